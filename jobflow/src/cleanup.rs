//! Periodic removal of finished jobs.
//!
//! Jobs in a terminal status created more than the retention period ago are deleted through a
//! `DeleteJob` worker request each. The sweep takes no mutex of its own, the delete operation
//! locks the job and checks it is still terminal.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use cron::Schedule;
use thiserror::Error;
use tracing::instrument;

use crate::{
    job::{query::JobQuery, JobId, JobStatus},
    repository::JobRepository,
    schedule::Sweep,
    store::StoreError,
    worker::{InvokeError, Operation, WorkerInvoker, WorkerRequest},
};

const PAGE_SIZE: usize = 100;

pub struct CleanupConfig {
    pub schedule: Schedule,
    pub retention_days: Option<i64>,
}

impl CleanupConfig {
    pub const RETENTION_ENV: &'static str = "JOB_RETENTION_PERIOD_IN_DAYS";

    pub const fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            retention_days: None,
        }
    }

    /// Cleanup is disabled unless the retention period is positive.
    pub const fn with_retention_days(mut self, days: Option<i64>) -> Self {
        self.retention_days = days;
        self
    }

    /// Reads the retention period from `JOB_RETENTION_PERIOD_IN_DAYS`.
    pub fn retention_days_from_env() -> Option<i64> {
        std::env::var(Self::RETENTION_ENV)
            .ok()
            .and_then(|value| value.trim().parse().ok())
    }
}

#[derive(Clone)]
pub struct JobCleanup {
    repository: JobRepository,
    invoker: Arc<dyn WorkerInvoker>,
    retention_days: Option<i64>,
}

impl JobCleanup {
    pub fn new(
        repository: JobRepository,
        invoker: Arc<dyn WorkerInvoker>,
        config: &CleanupConfig,
    ) -> Self {
        Self {
            repository,
            invoker,
            retention_days: config.retention_days,
        }
    }

    /// Requests deletion of every expired job and returns their ids.
    #[instrument(skip(self))]
    pub async fn clean_up(&self, request_id: &str) -> Result<Vec<JobId>, CleanupError> {
        let Some(days) = self.retention_days.filter(|days| *days > 0) else {
            tracing::debug!("Job retention not configured, skipping cleanup");
            return Ok(Vec::new());
        };
        let Some(cutoff) = TimeDelta::try_days(days)
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            tracing::warn!(days, "Job retention of {days} days is out of range, skipping cleanup");
            return Ok(Vec::new());
        };

        let mut deleted = Vec::new();
        for status in JobStatus::TERMINAL {
            let query = JobQuery::status_equal(status)
                .created_to(cutoff)
                .with_page_size(PAGE_SIZE);
            let mut page_token = None;
            loop {
                let page = self.repository.query_jobs(&query, page_token).await?;
                for job in page.results {
                    tracing::debug!(job_id = %job.id, "Deleting expired job");
                    self.invoker
                        .invoke(WorkerRequest::for_job(
                            Operation::DeleteJob {
                                job_id: job.id.clone(),
                            },
                            &job,
                        ))
                        .await?;
                    deleted.push(job.id);
                }
                page_token = page.next_page_token;
                if page_token.is_none() {
                    break;
                }
            }
        }

        tracing::info!(
            count = deleted.len(),
            "Requested deletion of {} jobs older than {days} days",
            deleted.len()
        );
        Ok(deleted)
    }
}

#[async_trait]
impl Sweep for JobCleanup {
    const NAME: &'static str = "job cleanup";

    async fn sweep(&self, request_id: &str) {
        let _ = self
            .clean_up(request_id)
            .await
            .inspect_err(|err| tracing::error!(?err, "Job cleanup failed with error {err}"));
    }
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Failed to enqueue worker request")]
    Invoke(#[from] InvokeError),
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        job::{Job, NewJob},
        store::memory::InMemoryStore,
        worker::MockWorkerInvoker,
    };

    fn config(days: Option<i64>) -> CleanupConfig {
        CleanupConfig::new("0 0 * * * *".parse().unwrap()).with_retention_days(days)
    }

    async fn add_job(repository: &JobRepository, status: JobStatus, age: TimeDelta) -> Job {
        let job = repository.add_job(NewJob::raw()).await.unwrap();
        repository
            .update_job(
                &job.with_status(status)
                    .with_date_created(Utc::now() - age),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn deletes_only_expired_terminal_jobs() {
        let repository =
            JobRepository::new(Arc::new(InMemoryStore::new()), "https://jobs.example.com");
        let old = TimeDelta::days(31);
        let recent = TimeDelta::days(29);
        let mut expected = vec![
            add_job(&repository, JobStatus::Completed, old).await.id,
            add_job(&repository, JobStatus::Failed, old).await.id,
            add_job(&repository, JobStatus::Canceled, old).await.id,
        ];
        add_job(&repository, JobStatus::Running, old).await;
        add_job(&repository, JobStatus::New, old).await;
        add_job(&repository, JobStatus::Completed, recent).await;
        add_job(&repository, JobStatus::Failed, recent).await;

        let mut invoker = MockWorkerInvoker::new();
        invoker
            .expect_invoke()
            .withf(|request| matches!(request.operation, Operation::DeleteJob { .. }))
            .times(3)
            .returning(|_| Ok(()));

        let mut deleted = JobCleanup::new(repository, Arc::new(invoker), &config(Some(30)))
            .clean_up("request")
            .await
            .unwrap();

        deleted.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(deleted, expected);
    }

    #[tokio::test]
    async fn non_positive_retention_deletes_nothing() {
        let repository =
            JobRepository::new(Arc::new(InMemoryStore::new()), "https://jobs.example.com");
        add_job(&repository, JobStatus::Completed, TimeDelta::days(400)).await;

        for days in [None, Some(0), Some(-5)] {
            let mut invoker = MockWorkerInvoker::new();
            invoker.expect_invoke().never();
            let deleted = JobCleanup::new(repository.clone(), Arc::new(invoker), &config(days))
                .clean_up("request")
                .await
                .unwrap();
            assert!(deleted.is_empty());
        }
    }

    #[tokio::test]
    async fn out_of_range_retention_deletes_nothing() {
        let repository =
            JobRepository::new(Arc::new(InMemoryStore::new()), "https://jobs.example.com");
        add_job(&repository, JobStatus::Completed, TimeDelta::days(400)).await;

        for days in [i64::MAX / 1000, 300_000_000, i64::MAX] {
            let mut invoker = MockWorkerInvoker::new();
            invoker.expect_invoke().never();
            let deleted =
                JobCleanup::new(repository.clone(), Arc::new(invoker), &config(Some(days)))
                    .clean_up("request")
                    .await
                    .unwrap();
            assert!(deleted.is_empty());
        }
    }

    #[tokio::test]
    async fn invoke_failure_is_reported() {
        let repository =
            JobRepository::new(Arc::new(InMemoryStore::new()), "https://jobs.example.com");
        add_job(&repository, JobStatus::Completed, TimeDelta::days(10)).await;

        let mut invoker = MockWorkerInvoker::new();
        invoker
            .expect_invoke()
            .returning(|_| Err(InvokeError::Closed));

        let result = JobCleanup::new(repository, Arc::new(invoker), &config(Some(1)))
            .clean_up("request")
            .await;
        assert_matches!(result, Err(CleanupError::Invoke(InvokeError::Closed)));
    }
}
