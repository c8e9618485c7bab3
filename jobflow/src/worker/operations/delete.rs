use tracing::instrument;

use crate::{
    job::JobId,
    worker::{OperationError, WorkerContext},
};

use super::release;

/// Removes a finished job, its executions and, where possible, the remote job assignments.
#[instrument(skip(context))]
pub async fn delete_job(context: &WorkerContext, job_id: &JobId) -> Result<(), OperationError> {
    let lock = context.lock_job(job_id).await?;
    let result: Result<(), OperationError> = async {
        let job = context.get_job(job_id).await?;
        if !job.is_terminal() {
            return Err(OperationError::Conflict(format!(
                "Cannot delete job while it's non-terminal. Current status: {}",
                job.status
            )));
        }

        let repository = &context.repository;
        for execution in repository.get_executions(job_id).await? {
            if let Some(assignment_id) = &execution.job_assignment_id {
                tracing::info!(%assignment_id, "Deleting job assignment '{assignment_id}'");
                let _ = context
                    .resource_manager
                    .delete(assignment_id)
                    .await
                    .inspect_err(|err| {
                        tracing::warn!(
                            ?err,
                            %assignment_id,
                            "Failed to delete job assignment {assignment_id}: {err}"
                        )
                    });
            }
            repository.delete_execution(&execution.id).await?;
        }

        repository.delete_job(job_id).await?;
        tracing::info!("Deleted job {job_id}");
        Ok(())
    }
    .await;

    release(lock, result).await
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        job::{JobStatus, NewJob},
        testing::{self, FakeResourceManager},
        worker::{
            operations::{cancel::cancel_job, restart::restart_job, start::start_job},
            test::context,
        },
    };

    #[tokio::test]
    async fn delete_finished_job() {
        let resource_manager = FakeResourceManager::with_transform_service();
        let context = context(resource_manager.clone());
        let job = context.repository.add_job(NewJob::raw()).await.unwrap();
        start_job(&context, &job.id).await.unwrap();
        restart_job(&context, &job.id).await.unwrap();
        cancel_job(&context, &job.id).await.unwrap();
        let executions = context.repository.get_executions(&job.id).await.unwrap();

        delete_job(&context, &job.id).await.unwrap();

        assert!(context.repository.get_job(&job.id).await.unwrap().is_none());
        for execution in executions {
            assert!(context
                .repository
                .get_execution(&execution.id)
                .await
                .unwrap()
                .is_none());
        }
        assert_eq!(
            resource_manager.deletes(),
            [
                format!("{}/2", testing::ASSIGNMENT_ENDPOINT),
                format!("{}/1", testing::ASSIGNMENT_ENDPOINT),
            ]
        );
    }

    #[tokio::test]
    async fn assignment_deletion_is_best_effort() {
        let resource_manager = FakeResourceManager::with_transform_service();
        resource_manager.fail_url(format!("{}/1", testing::ASSIGNMENT_ENDPOINT));
        let context = context(resource_manager);
        let job = context.repository.add_job(NewJob::raw()).await.unwrap();
        start_job(&context, &job.id).await.unwrap();
        cancel_job(&context, &job.id).await.unwrap();

        delete_job(&context, &job.id).await.unwrap();

        assert!(context.repository.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_running_job_is_rejected() {
        let resource_manager = FakeResourceManager::with_transform_service();
        let context = context(resource_manager.clone());
        let job = context.repository.add_job(NewJob::raw()).await.unwrap();
        start_job(&context, &job.id).await.unwrap();
        let mut execution = context
            .repository
            .get_latest_execution(&job.id)
            .await
            .unwrap()
            .unwrap();
        execution.status = JobStatus::Running;
        let execution = context.repository.update_execution(&execution).await.unwrap();
        let job = context
            .repository
            .update_job(
                &context
                    .repository
                    .get_job(&job.id)
                    .await
                    .unwrap()
                    .unwrap()
                    .with_status(JobStatus::Running),
            )
            .await
            .unwrap();

        let result = delete_job(&context, &job.id).await;

        assert_matches!(result, Err(OperationError::Conflict(_)));
        assert_eq!(context.repository.get_job(&job.id).await.unwrap(), Some(job));
        assert_eq!(
            context.repository.get_execution(&execution.id).await.unwrap(),
            Some(execution)
        );
        assert!(resource_manager.deletes().is_empty());
    }
}
