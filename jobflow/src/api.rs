//! The inbound boundary of the orchestrator.
//!
//! [`JobApi`] validates requests against the stored state, answers reads directly and turns
//! every state change into a [`WorkerRequest`]. It is transport agnostic: an HTTP layer maps the
//! path variables onto the arguments and [`ApiError::status_code`] onto the response status.
//! Job and execution ids are taken as the last path segment, e.g. the `{jobId}` of
//! `/jobs/{jobId}`.
use std::sync::Arc;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::{
    job::{query::JobQuery, Job, JobExecution, JobId, NewJob, Tracker},
    repository::JobRepository,
    resource::{ResourceManager, ResourceManagerExt},
    store::{PageToken, QueryResults, StoreError},
    worker::{InvokeError, JobNotification, Operation, WorkerInvoker, WorkerRequest},
};

const DEFAULT_PAGE_SIZE: usize = 100;

/// The request was valid and the change has been handed to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted;

impl Accepted {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::ACCEPTED
    }
}

#[derive(Deserialize)]
struct IncomingNotification {
    source: Option<String>,
    content: JobNotification,
}

#[derive(Clone)]
pub struct JobApi {
    repository: JobRepository,
    resource_manager: Arc<dyn ResourceManager>,
    invoker: Arc<dyn WorkerInvoker>,
}

impl JobApi {
    pub fn new(
        repository: JobRepository,
        resource_manager: Arc<dyn ResourceManager>,
        invoker: Arc<dyn WorkerInvoker>,
    ) -> Self {
        Self {
            repository,
            resource_manager,
            invoker,
        }
    }

    fn job_id(&self, job_id: &str) -> JobId {
        JobId::from(format!("{}/jobs/{job_id}", self.repository.public_url()))
    }

    async fn find_job(&self, job_id: &str) -> Result<Job, ApiError> {
        let job_id = self.job_id(job_id);
        self.repository
            .get_job(&job_id)
            .await?
            .ok_or(ApiError::NotFound(job_id.to_string()))
    }

    async fn invoke(&self, operation: Operation, job: &Job) -> Result<Accepted, ApiError> {
        self.invoker
            .invoke(WorkerRequest::for_job(operation, job))
            .await?;
        Ok(Accepted)
    }

    /// Stores a new job and requests it to be started.
    ///
    /// Jobs submitted without a tracker get one labelled after their type and profile.
    #[instrument(skip_all, fields(job_type = %job.job_type))]
    pub async fn add_job(&self, mut job: NewJob) -> Result<Job, ApiError> {
        if job.tracker.is_none() {
            let label = match self
                .resource_manager
                .get_job_profile(&job.job_profile_id)
                .await
            {
                Ok(profile) => format!("{} with JobProfile {}", job.job_type, profile.name),
                Err(err) => {
                    tracing::error!(
                        ?err,
                        "Failed to get job profile '{}': {err}",
                        job.job_profile_id
                    );
                    format!("{} with unknown JobProfile", job.job_type)
                }
            };
            job.tracker = Some(Tracker {
                id: uuid::Uuid::new_v4().to_string(),
                label,
            });
        }

        let job = self.repository.add_job(job).await?;
        tracing::info!(job_id = %job.id, "Created job {}", job.id);
        self.invoke(
            Operation::StartJob {
                job_id: job.id.clone(),
            },
            &job,
        )
        .await?;
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, ApiError> {
        self.find_job(job_id).await
    }

    /// Queries jobs, limited to one page of 100 when neither a date range nor a page size is given.
    pub async fn query_jobs(
        &self,
        query: JobQuery,
        page_token: Option<PageToken>,
    ) -> Result<QueryResults<Job>, ApiError> {
        let query = if query.from.is_none() && query.to.is_none() && query.page_size.is_none() {
            query.with_page_size(DEFAULT_PAGE_SIZE)
        } else {
            query
        };
        Ok(self.repository.query_jobs(&query, page_token).await?)
    }

    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: &str) -> Result<Accepted, ApiError> {
        let job = self.find_job(job_id).await?;
        if job.is_terminal() {
            return Err(ApiError::Conflict(
                "Cannot cancel job when already finished".to_owned(),
            ));
        }
        self.invoke(Operation::CancelJob { job_id: job.id.clone() }, &job)
            .await
    }

    #[instrument(skip(self))]
    pub async fn restart_job(&self, job_id: &str) -> Result<Accepted, ApiError> {
        let job = self.find_job(job_id).await?;
        if let Some(deadline) = job.deadline.filter(|_| job.deadline_passed(chrono::Utc::now())) {
            return Err(ApiError::Conflict(format!(
                "Cannot restart job when deadline is in the past ({})",
                deadline.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            )));
        }
        self.invoke(Operation::RestartJob { job_id: job.id.clone() }, &job)
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_job(&self, job_id: &str) -> Result<Accepted, ApiError> {
        let job = self.find_job(job_id).await?;
        if !job.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "Cannot delete job while is non final state ({})",
                job.status
            )));
        }
        self.invoke(Operation::DeleteJob { job_id: job.id.clone() }, &job)
            .await
    }

    pub async fn query_executions(
        &self,
        job_id: &str,
        query: JobQuery,
        page_token: Option<PageToken>,
    ) -> Result<QueryResults<JobExecution>, ApiError> {
        let job = self.find_job(job_id).await?;
        Ok(self
            .repository
            .query_executions(&job.id, &query, page_token)
            .await?)
    }

    /// Gets an execution by number, or the current one for `latest`.
    pub async fn get_execution(
        &self,
        job_id: &str,
        execution_id: &str,
    ) -> Result<JobExecution, ApiError> {
        let job_id = self.job_id(job_id);
        let execution = if execution_id == "latest" {
            self.repository.get_latest_execution(&job_id).await?
        } else {
            self.repository
                .get_execution(&format!("{job_id}/executions/{execution_id}"))
                .await?
        };
        execution.ok_or_else(|| ApiError::NotFound(format!("{job_id}/executions/{execution_id}")))
    }

    /// Accepts a status update posted by a service for one of its assignments.
    ///
    /// The body is `{ "source": <job assignment id>, "content": <notification> }`. Once the
    /// execution has been assigned, only its assignment may report on it.
    #[instrument(skip(self, body))]
    pub async fn process_notification(
        &self,
        job_id: &str,
        execution_id: &str,
        body: serde_json::Value,
    ) -> Result<Accepted, ApiError> {
        let job = self.find_job(job_id).await?;
        let execution_id = format!("{}/executions/{execution_id}", job.id);
        let execution = self
            .repository
            .get_execution(&execution_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(execution_id.clone()))?;

        if body.is_null() {
            return Err(ApiError::BadRequest("Missing request body.".to_owned()));
        }
        let notification: IncomingNotification = serde_json::from_value(body)
            .map_err(|err| ApiError::BadRequest(format!("Invalid notification: {err}")))?;

        if let Some(assignment_id) = &execution.job_assignment_id {
            if notification.source.as_deref() != Some(assignment_id.as_str()) {
                return Err(ApiError::BadRequest(format!(
                    "Unexpected notification from '{}'.",
                    notification.source.as_deref().unwrap_or_default()
                )));
            }
        }

        self.invoke(
            Operation::ProcessNotification {
                job_id: job.id.clone(),
                job_execution_id: execution.id,
                notification: notification.content,
            },
            &job,
        )
        .await
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource '{0}' not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Failed to enqueue worker request")]
    Invoke(#[from] InvokeError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::InvalidPageToken(_) | StoreError::InvalidQuery(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Store(_) | ApiError::Invoke(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
