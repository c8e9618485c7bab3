use chrono::{SecondsFormat, Utc};
use tracing::instrument;

use crate::{
    job::{Job, JobId},
    worker::{OperationError, WorkerContext},
};

use super::{cancel::cancel_execution, release, start::start_execution};

/// Cancels the current execution and dispatches the job again as a new execution.
#[instrument(skip(context))]
pub async fn restart_job(context: &WorkerContext, job_id: &JobId) -> Result<(), OperationError> {
    let lock = context.lock_job(job_id).await?;
    let result: Result<Job, OperationError> = async {
        let job = context.get_job(job_id).await?;
        if let Some(deadline) = job.deadline.filter(|_| job.deadline_passed(Utc::now())) {
            return Err(OperationError::Precondition(format!(
                "Cannot restart job that missed its deadline of {}",
                deadline.to_rfc3339_opts(SecondsFormat::Millis, true)
            )));
        }

        let job = cancel_execution(context, job).await?;
        start_execution(context, job).await
    }
    .await;

    let job = release(lock, result).await?;
    context.send_notification(&job).await;
    context.enable_job_checker().await;
    Ok(())
}
