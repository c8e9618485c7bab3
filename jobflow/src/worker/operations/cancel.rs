use tracing::instrument;

use crate::{
    job::{Job, JobId, JobStatus},
    worker::{OperationError, WorkerContext},
};

use super::release;

#[instrument(skip(context))]
pub async fn cancel_job(context: &WorkerContext, job_id: &JobId) -> Result<(), OperationError> {
    let lock = context.lock_job(job_id).await?;
    let result: Result<Option<Job>, OperationError> = async {
        let job = context.get_job(job_id).await?;
        if job.is_terminal() {
            tracing::info!(
                status = %job.status,
                "Job {job_id} already finished, nothing to cancel"
            );
            return Ok(None);
        }
        cancel_execution(context, job).await.map(Some)
    }
    .await;

    if let Some(job) = release(lock, result).await? {
        context.send_notification(&job).await;
    }
    Ok(())
}

/// Cancels the current execution and marks the job canceled. Terminal jobs are returned as is.
///
/// The caller must hold the job's mutex.
pub(crate) async fn cancel_execution(
    context: &WorkerContext,
    mut job: Job,
) -> Result<Job, OperationError> {
    if job.is_terminal() {
        return Ok(job);
    }

    let repository = &context.repository;
    if let Some(mut execution) = repository.get_latest_execution(&job.id).await? {
        if let Some(assignment_id) = &execution.job_assignment_id {
            request_assignment_cancel(context, assignment_id).await;
        }
        execution.status = JobStatus::Canceled;
        repository.update_execution(&execution).await?;
    }

    tracing::info!(job_id = %job.id, "Job canceled");
    job.status = JobStatus::Canceled;
    Ok(repository.update_job(&job).await?)
}

/// Asks the service running the assignment to stop. Failures are logged and ignored.
pub(crate) async fn request_assignment_cancel(context: &WorkerContext, assignment_id: &str) {
    tracing::info!(%assignment_id, "Canceling job assignment '{assignment_id}'");
    let _ = context
        .resource_manager
        .post(&format!("{assignment_id}/cancel"), &serde_json::Value::Null)
        .await
        .inspect_err(|err| {
            tracing::warn!(
                ?err,
                %assignment_id,
                "Canceling job assignment '{assignment_id}' failed: {err}"
            )
        });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        job::NewJob,
        testing::{self, FakeResourceManager},
        worker::{operations::start::start_job, test::context},
    };

    #[tokio::test]
    async fn cancel_assigned_job() {
        let resource_manager = FakeResourceManager::with_transform_service();
        let context = context(resource_manager.clone());
        let job = context.repository.add_job(NewJob::raw()).await.unwrap();
        start_job(&context, &job.id).await.unwrap();

        cancel_job(&context, &job.id).await.unwrap();

        let job = context.repository.get_job(&job.id).await.unwrap().unwrap();
        let execution = context
            .repository
            .get_latest_execution(&job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(execution.status, JobStatus::Canceled);

        let cancel_url = format!("{}/1/cancel", testing::ASSIGNMENT_ENDPOINT);
        assert!(resource_manager.posts().iter().any(|(url, _)| *url == cancel_url));
        assert_eq!(
            resource_manager.notifications().last().map(|job| job.status),
            Some(JobStatus::Canceled)
        );
    }

    #[tokio::test]
    async fn cancel_is_best_effort() {
        let resource_manager = FakeResourceManager::with_transform_service();
        resource_manager.fail_url(format!("{}/1/cancel", testing::ASSIGNMENT_ENDPOINT));
        let context = context(resource_manager);
        let job = context.repository.add_job(NewJob::raw()).await.unwrap();
        start_job(&context, &job.id).await.unwrap();

        cancel_job(&context, &job.id).await.unwrap();

        let job = context.repository.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_without_execution() {
        let context = context(FakeResourceManager::new());
        let job = context.repository.add_job(NewJob::raw()).await.unwrap();

        cancel_job(&context, &job.id).await.unwrap();

        let job = context.repository.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_a_no_op() {
        let resource_manager = FakeResourceManager::new();
        let context = context(resource_manager.clone());
        let job = context.repository.add_job(NewJob::raw()).await.unwrap();
        let job = context
            .repository
            .update_job(&job.with_status(JobStatus::Completed))
            .await
            .unwrap();

        cancel_job(&context, &job.id).await.unwrap();

        assert_eq!(context.repository.get_job(&job.id).await.unwrap(), Some(job));
        assert!(resource_manager.notifications().is_empty());
    }
}
