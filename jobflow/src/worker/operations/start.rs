use tracing::instrument;

use crate::{
    job::{Job, JobId, JobParameterBag, JobStatus},
    worker::{dispatch::dispatch, OperationError, WorkerContext},
};

use super::release;

/// Creates the first execution of a new job and hands it to a capable service.
///
/// A job that has left `New` was already started by an earlier delivery of the same request and
/// is left alone.
#[instrument(skip(context))]
pub async fn start_job(context: &WorkerContext, job_id: &JobId) -> Result<(), OperationError> {
    let lock = context.lock_job(job_id).await?;
    let result: Result<Option<Job>, OperationError> = async {
        let job = context.get_job(job_id).await?;
        if job.status != JobStatus::New {
            tracing::warn!(
                status = %job.status,
                "Job {job_id} is already {}, ignoring start request",
                job.status
            );
            return Ok(None);
        }
        start_execution(context, job).await.map(Some)
    }
    .await;

    if let Some(job) = release(lock, result).await? {
        context.send_notification(&job).await;
        context.enable_job_checker().await;
    }
    Ok(())
}

/// Adds a new execution to the job and dispatches it.
///
/// Dispatch failures are recorded on the execution and the job, only store failures are returned.
/// The caller must hold the job's mutex.
pub(crate) async fn start_execution(
    context: &WorkerContext,
    mut job: Job,
) -> Result<Job, OperationError> {
    let repository = &context.repository;

    tracing::info!(job_id = %job.id, "Creating job execution");
    let mut execution = repository
        .add_execution(&job.id, JobStatus::Pending)
        .await?;

    job.status = execution.status;
    job.error = None;
    job.job_output = Some(JobParameterBag::new());
    job.progress = None;
    let mut job = repository.update_job(&job).await?;

    match dispatch(context, &job, &execution).await {
        Ok(assignment_id) => {
            tracing::info!(
                job_id = %job.id,
                execution_id = %execution.id,
                %assignment_id,
                "Job assigned to {assignment_id}"
            );
            execution.status = JobStatus::Assigned;
            execution.job_assignment_id = Some(assignment_id);
        }
        Err(err) => {
            tracing::error!(
                ?err,
                job_id = %job.id,
                execution_id = %execution.id,
                "Failed to start job due to error '{err}'"
            );
            execution.status = JobStatus::Failed;
            execution.error = Some(err.to_problem());
        }
    }

    let execution = repository.update_execution(&execution).await?;
    job.status = execution.status;
    job.error = execution.error;
    Ok(repository.update_job(&job).await?)
}
