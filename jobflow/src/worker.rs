//! Asynchronous execution of the job state transitions.
//!
//! Callers describe what should happen to a job with an [`Operation`] and hand it to a
//! [`WorkerInvoker`]. Whatever transport sits behind the invoker eventually delivers the
//! [`WorkerRequest`] to a [`Worker`], which runs the matching operation under the job's mutex.
//! Delivery is at least once, so every operation tolerates being run twice.
//!
//! [`LocalWorkerInvoker`] together with [`Worker::spawn`] provide an in process transport.
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    checker::CheckerSwitch,
    job::{Job, JobId, JobParameterBag, JobStatus, ProblemDetail, Tracker},
    repository::JobRepository,
    resource::ResourceManager,
    store::{LockGuard, StoreError},
};

pub mod dispatch;
pub mod operations;

/// The state transitions a worker can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operationName", content = "input", rename_all_fields = "camelCase")]
pub enum Operation {
    StartJob {
        job_id: JobId,
    },
    CancelJob {
        job_id: JobId,
    },
    RestartJob {
        job_id: JobId,
    },
    FailJob {
        job_id: JobId,
        error: ProblemDetail,
    },
    DeleteJob {
        job_id: JobId,
    },
    ProcessNotification {
        job_id: JobId,
        job_execution_id: String,
        notification: JobNotification,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::StartJob { .. } => "StartJob",
            Operation::CancelJob { .. } => "CancelJob",
            Operation::RestartJob { .. } => "RestartJob",
            Operation::FailJob { .. } => "FailJob",
            Operation::DeleteJob { .. } => "DeleteJob",
            Operation::ProcessNotification { .. } => "ProcessNotification",
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Operation::StartJob { job_id }
            | Operation::CancelJob { job_id }
            | Operation::RestartJob { job_id }
            | Operation::FailJob { job_id, .. }
            | Operation::DeleteJob { job_id }
            | Operation::ProcessNotification { job_id, .. } => job_id,
        }
    }
}

/// The state a remote service reports for a job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobNotification {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_output: Option<JobParameterBag>,
}

impl JobNotification {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            error: None,
            progress: None,
            job_output: None,
        }
    }

    pub fn with_progress(self, progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..self
        }
    }

    pub fn with_error(self, error: ProblemDetail) -> Self {
        Self {
            error: Some(error),
            ..self
        }
    }

    pub fn with_output(self, job_output: JobParameterBag) -> Self {
        Self {
            job_output: Some(job_output),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(flatten)]
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<Tracker>,
}

impl WorkerRequest {
    pub fn new(operation: Operation, tracker: Option<Tracker>) -> Self {
        Self { operation, tracker }
    }

    pub fn for_job(operation: Operation, job: &Job) -> Self {
        Self::new(operation, job.tracker.clone())
    }
}

/// Hands a [`WorkerRequest`] to a transport for asynchronous execution.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    async fn invoke(&self, request: WorkerRequest) -> Result<(), InvokeError>;
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("The worker is no longer accepting requests")]
    Closed,
    #[error("Failed to encode worker request")]
    Encode(#[from] serde_json::Error),
}

/// Delivers requests to a [`Worker`] running in the same process.
#[derive(Debug, Clone)]
pub struct LocalWorkerInvoker {
    sender: mpsc::UnboundedSender<WorkerRequest>,
}

impl LocalWorkerInvoker {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl WorkerInvoker for LocalWorkerInvoker {
    async fn invoke(&self, request: WorkerRequest) -> Result<(), InvokeError> {
        tracing::debug!(
            operation = request.operation.name(),
            job_id = %request.operation.job_id(),
            "Enqueuing worker request"
        );
        self.sender.send(request).map_err(|_| InvokeError::Closed)
    }
}

/// Everything an operation needs for one invocation.
pub struct WorkerContext {
    pub request_id: String,
    pub repository: JobRepository,
    pub resource_manager: Arc<dyn ResourceManager>,
    pub job_checker: Option<CheckerSwitch>,
}

impl WorkerContext {
    /// Takes the job's mutex on behalf of this invocation.
    pub async fn lock_job(&self, job_id: &JobId) -> Result<LockGuard, StoreError> {
        LockGuard::acquire(
            self.repository
                .create_mutex(job_id.as_str(), &self.request_id),
        )
        .await
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Job, OperationError> {
        self.repository
            .get_job(job_id)
            .await?
            .ok_or_else(|| OperationError::JobNotFound(job_id.clone()))
    }

    /// Publishes the job state. Failures are logged and otherwise ignored.
    pub async fn send_notification(&self, job: &Job) {
        let _ = self
            .resource_manager
            .send_notification(job)
            .await
            .inspect_err(|err| {
                tracing::warn!(
                    ?err,
                    job_id = %job.id,
                    "Failed to send notification for job {}: {err}",
                    job.id
                )
            });
    }

    /// Makes sure the watchdog keeps running now that a job is in flight.
    pub async fn enable_job_checker(&self) {
        if let Some(job_checker) = &self.job_checker {
            let _ = job_checker
                .enable(&self.request_id)
                .await
                .inspect_err(|err| tracing::warn!(?err, "Failed to enable job checker: {err}"));
        }
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Job with id '{0}' not found")]
    JobNotFound(JobId),
    #[error("JobExecution with id '{0}' not found")]
    ExecutionNotFound(String),
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
}

/// Runs [`WorkerRequest`]s against the job store.
#[derive(Clone)]
pub struct Worker {
    repository: JobRepository,
    resource_manager: Arc<dyn ResourceManager>,
    job_checker: Option<CheckerSwitch>,
}

impl Worker {
    pub fn new(repository: JobRepository, resource_manager: Arc<dyn ResourceManager>) -> Self {
        Self {
            repository,
            resource_manager,
            job_checker: None,
        }
    }

    /// Start and restart will re-enable the watchdog through this switch.
    pub fn with_job_checker(self, job_checker: CheckerSwitch) -> Self {
        Self {
            job_checker: Some(job_checker),
            ..self
        }
    }

    fn context(&self, request_id: String) -> WorkerContext {
        WorkerContext {
            request_id,
            repository: self.repository.clone(),
            resource_manager: self.resource_manager.clone(),
            job_checker: self.job_checker.clone(),
        }
    }

    /// Runs a single request to completion.
    ///
    /// Failures are logged here and returned so the transport can apply its own redelivery.
    pub async fn do_work(&self, request: WorkerRequest) -> Result<(), OperationError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let operation_name = request.operation.name();
        let span = tracing::info_span!(
            "worker",
            operation = operation_name,
            job_id = %request.operation.job_id(),
            %request_id,
            tracker = request.tracker.as_ref().map(|tracker| tracker.id.as_str()),
        );
        let context = self.context(request_id);

        async move {
            tracing::debug!("Handling worker request");
            let result = match request.operation {
                Operation::StartJob { job_id } => {
                    operations::start::start_job(&context, &job_id).await
                }
                Operation::CancelJob { job_id } => {
                    operations::cancel::cancel_job(&context, &job_id).await
                }
                Operation::RestartJob { job_id } => {
                    operations::restart::restart_job(&context, &job_id).await
                }
                Operation::FailJob { job_id, error } => {
                    operations::fail::fail_job(&context, &job_id, error).await
                }
                Operation::DeleteJob { job_id } => {
                    operations::delete::delete_job(&context, &job_id).await
                }
                Operation::ProcessNotification {
                    job_id,
                    job_execution_id,
                    notification,
                } => {
                    operations::notification::process_notification(
                        &context,
                        &job_id,
                        &job_execution_id,
                        notification,
                    )
                    .await
                }
            };
            result.inspect_err(|err| {
                tracing::error!(
                    ?err,
                    "Error occurred when handling operation '{operation_name}': {err}"
                )
            })
        }
        .instrument(span)
        .await
    }

    /// Consumes requests until the channel closes or the token is cancelled, then waits for the
    /// requests already in flight.
    pub fn spawn(
        self,
        mut receiver: mpsc::UnboundedReceiver<WorkerRequest>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let in_flight = TaskTracker::new();
            loop {
                tokio::select! {
                    request = receiver.recv() => match request {
                        Some(request) => {
                            let worker = self.clone();
                            in_flight.spawn(async move {
                                let _ = worker.do_work(request).await;
                            });
                        }
                        None => break,
                    },
                    _ = cancellation_token.cancelled() => break,
                }
            }
            in_flight.close();
            in_flight.wait().await;
            tracing::debug!("Shutting down the job worker");
        })
    }
}
