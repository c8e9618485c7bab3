use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::{
    job::{Job, JobExecution, JobId, JobStatus},
    worker::{JobNotification, OperationError, WorkerContext},
};

use super::release;

/// Merges the state reported by a service into the execution and mirrors it onto the job.
///
/// Notifications for executions that already finished are ignored.
#[instrument(skip(context, notification), fields(status = %notification.status))]
pub async fn process_notification(
    context: &WorkerContext,
    job_id: &JobId,
    job_execution_id: &str,
    notification: JobNotification,
) -> Result<(), OperationError> {
    let lock = context.lock_job(job_id).await?;
    let result: Result<Option<Job>, OperationError> = async {
        let mut job = context.get_job(job_id).await?;
        let mut execution = context
            .repository
            .get_execution(job_execution_id)
            .await?
            .ok_or_else(|| OperationError::ExecutionNotFound(job_execution_id.to_owned()))?;

        if execution.is_terminal() {
            tracing::warn!(
                "Ignoring notification for job execution that would change state from {} to {}: {}",
                execution.status,
                notification.status,
                execution.id
            );
            return Ok(None);
        }

        apply_notification(&mut execution, notification, Utc::now());
        let execution = context.repository.update_execution(&execution).await?;
        job.mirror(&execution);
        Ok(Some(context.repository.update_job(&job).await?))
    }
    .await;

    if let Some(job) = release(lock, result).await? {
        context.send_notification(&job).await;
    }
    Ok(())
}

/// Applies a reported state to a non-terminal execution.
///
/// Entering `Running` records the start date, entering a terminal status records the start and
/// end dates and the duration. Dates that are already set are kept.
pub(crate) fn apply_notification(
    execution: &mut JobExecution,
    notification: JobNotification,
    now: DateTime<Utc>,
) {
    if execution.status != notification.status {
        tracing::info!(
            execution_id = %execution.id,
            "Job execution changed status from {} to {}",
            execution.status,
            notification.status
        );
        match notification.status {
            JobStatus::Running => {
                execution.actual_start_date.get_or_insert(now);
            }
            status if status.is_terminal() => {
                execution.actual_start_date.get_or_insert(now);
                execution.actual_end_date.get_or_insert(now);
                execution.update_duration();
            }
            _ => {}
        }
    }

    execution.status = notification.status;
    execution.error = notification.error;
    execution.progress = notification.progress;
    execution.job_output = notification.job_output;
}
