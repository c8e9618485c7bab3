use chrono::Utc;
use tracing::instrument;

use crate::{
    job::{Job, JobId, JobStatus, ProblemDetail},
    worker::{OperationError, WorkerContext},
};

use super::{cancel::request_assignment_cancel, release};

/// Stops the current execution and marks it and the job as failed with `error`.
#[instrument(skip(context, error))]
pub async fn fail_job(
    context: &WorkerContext,
    job_id: &JobId,
    error: ProblemDetail,
) -> Result<(), OperationError> {
    let lock = context.lock_job(job_id).await?;
    let result: Result<Option<Job>, OperationError> = async {
        let mut job = context.get_job(job_id).await?;
        if job.is_terminal() {
            tracing::info!(status = %job.status, "Job {job_id} already finished, not failing it");
            return Ok(None);
        }

        let repository = &context.repository;
        if let Some(mut execution) = repository.get_latest_execution(job_id).await? {
            if let Some(assignment_id) = &execution.job_assignment_id {
                request_assignment_cancel(context, assignment_id).await;
            }
            execution.actual_end_date.get_or_insert_with(Utc::now);
            execution.update_duration();
            execution.status = JobStatus::Failed;
            execution.error = Some(error.clone());
            repository.update_execution(&execution).await?;
        }

        tracing::info!(problem = %error.problem_type, "Job {job_id} failed: {}", error.title);
        job.status = JobStatus::Failed;
        job.error = Some(error);
        Ok(Some(repository.update_job(&job).await?))
    }
    .await;

    if let Some(job) = release(lock, result).await? {
        context.send_notification(&job).await;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        job::NewJob,
        testing::{self, FakeResourceManager},
        worker::{operations::start::start_job, test::context},
    };

    fn timeout_error() -> ProblemDetail {
        ProblemDetail::new(
            ProblemDetail::JOB_TIMEOUT_PASSED,
            "Job failed to complete before timeout limit",
        )
        .with_detail("Job timed out after 5 minutes")
    }

    #[tokio::test]
    async fn fail_running_job() {
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
        execution.actual_start_date = Some(Utc::now() - TimeDelta::minutes(6));
        context.repository.update_execution(&execution).await.unwrap();

        fail_job(&context, &job.id, timeout_error()).await.unwrap();

        let job = context.repository.get_job(&job.id).await.unwrap().unwrap();
        let execution = context
            .repository
            .get_execution(&execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error, Some(timeout_error()));
        assert_eq!(execution.status, JobStatus::Failed);
        assert_eq!(execution.error, Some(timeout_error()));
        assert!(execution.actual_end_date.is_some());
        assert!(execution.actual_duration >= TimeDelta::minutes(6).num_milliseconds());

        let cancel_url = format!("{}/1/cancel", testing::ASSIGNMENT_ENDPOINT);
        assert!(resource_manager.posts().iter().any(|(url, _)| *url == cancel_url));
    }

    #[tokio::test]
    async fn fail_keeps_existing_end_date() {
        let context = context(FakeResourceManager::with_transform_service());
        let job = context.repository.add_job(NewJob::raw()).await.unwrap();
        start_job(&context, &job.id).await.unwrap();

        let mut execution = context
            .repository
            .get_latest_execution(&job.id)
            .await
            .unwrap()
            .unwrap();
        let start = Utc::now() - TimeDelta::minutes(2);
        execution.actual_start_date = Some(start);
        execution.actual_end_date = Some(start + TimeDelta::seconds(30));
        context.repository.update_execution(&execution).await.unwrap();

        fail_job(&context, &job.id, timeout_error()).await.unwrap();

        let execution = context
            .repository
            .get_execution(&execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.actual_end_date, Some(start + TimeDelta::seconds(30)));
        assert_eq!(execution.actual_duration, 30_000);
    }

    #[tokio::test]
    async fn fail_terminal_job_is_a_no_op() {
        let resource_manager = FakeResourceManager::new();
        let context = context(resource_manager.clone());
        let job = context.repository.add_job(NewJob::raw()).await.unwrap();
        let job = context
            .repository
            .update_job(&job.with_status(JobStatus::Canceled))
            .await
            .unwrap();

        fail_job(&context, &job.id, timeout_error()).await.unwrap();

        assert_eq!(context.repository.get_job(&job.id).await.unwrap(), Some(job));
        assert!(resource_manager.notifications().is_empty());
    }
}
