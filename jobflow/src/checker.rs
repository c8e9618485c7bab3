//! The watchdog failing jobs that ran past their deadline or timeout.
//!
//! A sweep looks at every job in an active status. A job with a passed deadline is failed with a
//! deadline error. Otherwise, if a timeout applies and more minutes than the timeout have passed
//! since its current execution started, it is failed with a timeout error. A job's own timeout
//! always applies, the configured default timeout only applies to jobs without a deadline.
//! Failing is delegated to a `FailJob` worker request, the sweep never holds a job's mutex.
//!
//! Only one sweep runs at a time across all processes sharing the store. A sweep that finds the
//! sweep mutex taken exits without doing anything.
//!
//! With adaptive throttling the sweep disables its own [`Trigger`] before scanning and enables it
//! again only if some job is still active. Starting or restarting a job enables it as well.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use cron::Schedule;
use thiserror::Error;
use tracing::instrument;

use crate::{
    job::{query::JobQuery, Job, JobId, JobStatus, ProblemDetail},
    repository::JobRepository,
    schedule::Sweep,
    store::{LockGuard, StoreError},
    worker::{InvokeError, Operation, WorkerInvoker, WorkerRequest},
};

const PAGE_SIZE: usize = 100;

/// Something that periodically runs the watchdog and can be switched on and off.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn set_enabled(&self, enabled: bool) -> Result<(), TriggerError>;
}

#[derive(Debug, Error)]
#[error("Failed to toggle trigger: {0}")]
pub struct TriggerError(pub String);

/// An in process [`Trigger`]: a flag consulted by the sweep runner before each tick.
#[derive(Debug, Clone)]
pub struct ScheduleTrigger {
    enabled: Arc<AtomicBool>,
}

impl Default for ScheduleTrigger {
    fn default() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl ScheduleTrigger {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Trigger for ScheduleTrigger {
    async fn set_enabled(&self, enabled: bool) -> Result<(), TriggerError> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

/// Toggles a [`Trigger`] while holding a store mutex named after it.
#[derive(Clone)]
pub struct CheckerSwitch {
    trigger: Arc<dyn Trigger>,
    repository: JobRepository,
    name: Arc<str>,
}

impl CheckerSwitch {
    pub const DEFAULT_NAME: &'static str = "job-checker-trigger";

    pub fn new(trigger: Arc<dyn Trigger>, repository: JobRepository) -> Self {
        Self {
            trigger,
            repository,
            name: Self::DEFAULT_NAME.into(),
        }
    }

    pub fn with_name(self, name: &str) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub async fn enable(&self, holder: &str) -> Result<(), CheckerError> {
        self.set_enabled(true, holder).await
    }

    pub async fn disable(&self, holder: &str) -> Result<(), CheckerError> {
        self.set_enabled(false, holder).await
    }

    async fn set_enabled(&self, enabled: bool, holder: &str) -> Result<(), CheckerError> {
        let lock = LockGuard::acquire(self.repository.create_mutex(&self.name, holder)).await?;
        let result = self.trigger.set_enabled(enabled).await;
        lock.release().await?;
        tracing::debug!(trigger = %self.name, enabled, "Toggled job checker trigger");
        Ok(result?)
    }
}

pub struct CheckerConfig {
    pub schedule: Schedule,
    pub default_timeout: Option<u32>,
    pub adaptive_throttling: bool,
}

impl CheckerConfig {
    pub const DEFAULT_TIMEOUT_ENV: &'static str = "DEFAULT_JOB_TIMEOUT_IN_MINUTES";

    pub const fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            default_timeout: None,
            adaptive_throttling: false,
        }
    }

    /// Timeout in minutes for jobs that specify neither a timeout nor a deadline.
    pub const fn with_default_timeout(mut self, minutes: Option<u32>) -> Self {
        self.default_timeout = minutes;
        self
    }

    pub const fn with_adaptive_throttling(mut self, adaptive_throttling: bool) -> Self {
        self.adaptive_throttling = adaptive_throttling;
        self
    }

    /// Reads the default timeout from `DEFAULT_JOB_TIMEOUT_IN_MINUTES`.
    pub fn default_timeout_from_env() -> Option<u32> {
        std::env::var(Self::DEFAULT_TIMEOUT_ENV)
            .ok()
            .and_then(|value| value.trim().parse().ok())
    }
}

/// The result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Another sweep held the mutex so nothing was checked.
    pub skipped: bool,
    pub active: usize,
    pub failed: Vec<JobId>,
}

#[derive(Clone)]
pub struct JobChecker {
    repository: JobRepository,
    invoker: Arc<dyn WorkerInvoker>,
    switch: Option<CheckerSwitch>,
    default_timeout: Option<u32>,
    adaptive_throttling: bool,
}

impl JobChecker {
    pub const MUTEX_NAME: &'static str = "job-checker";

    pub fn new(
        repository: JobRepository,
        invoker: Arc<dyn WorkerInvoker>,
        config: &CheckerConfig,
    ) -> Self {
        Self {
            repository,
            invoker,
            switch: None,
            default_timeout: config.default_timeout,
            adaptive_throttling: config.adaptive_throttling,
        }
    }

    pub fn with_switch(self, switch: CheckerSwitch) -> Self {
        Self {
            switch: Some(switch),
            ..self
        }
    }

    #[instrument(skip(self))]
    pub async fn check(&self, request_id: &str) -> Result<CheckReport, CheckerError> {
        let mutex = self.repository.create_mutex(Self::MUTEX_NAME, request_id);
        let Some(lock) = LockGuard::try_acquire(mutex).await? else {
            tracing::info!("Job checker already running, skipping");
            return Ok(CheckReport {
                skipped: true,
                ..Default::default()
            });
        };

        let result = self.sweep_active_jobs(request_id).await;
        let released = lock.release().await;
        let report = result?;
        released?;
        Ok(report)
    }

    async fn sweep_active_jobs(&self, request_id: &str) -> Result<CheckReport, CheckerError> {
        let switch = self.switch.as_ref().filter(|_| self.adaptive_throttling);
        if let Some(switch) = switch {
            switch.disable(request_id).await?;
        }

        let now = Utc::now();
        let mut report = CheckReport::default();
        for status in JobStatus::ACTIVE {
            let mut page_token = None;
            loop {
                let page = self
                    .repository
                    .query_jobs(
                        &JobQuery::status_equal(status).with_page_size(PAGE_SIZE),
                        page_token,
                    )
                    .await?;
                for job in page.results {
                    match self.overdue(&job, now).await? {
                        Some(error) => {
                            self.fail_job(&job, error).await?;
                            report.failed.push(job.id);
                        }
                        None => report.active += 1,
                    }
                }
                page_token = page.next_page_token;
                if page_token.is_none() {
                    break;
                }
            }
        }

        tracing::info!(
            failed = report.failed.len(),
            active = report.active,
            "Failed {} jobs due to deadline or timeout constraints",
            report.failed.len()
        );

        if let Some(switch) = switch.filter(|_| report.active > 0) {
            tracing::info!("There are {} active jobs remaining", report.active);
            switch.enable(request_id).await?;
        }
        Ok(report)
    }

    /// The error to fail the job with, if it is overdue.
    async fn overdue(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Option<ProblemDetail>, CheckerError> {
        if let Some(deadline) = job.deadline.filter(|deadline| *deadline < now) {
            return Ok(Some(deadline_error(deadline)));
        }

        let default_timeout = self.default_timeout.filter(|_| job.deadline.is_none());
        let Some(timeout) = job.timeout.or(default_timeout).filter(|timeout| *timeout > 0) else {
            return Ok(None);
        };

        let started = self
            .repository
            .get_latest_execution(&job.id)
            .await?
            .map(|execution| {
                execution
                    .actual_start_date
                    .unwrap_or(execution.date_created)
            })
            .unwrap_or(job.date_created);
        let elapsed_minutes = (now - started).as_seconds_f64() / 60.0;

        Ok((elapsed_minutes > f64::from(timeout)).then(|| timeout_error(timeout)))
    }

    async fn fail_job(&self, job: &Job, error: ProblemDetail) -> Result<(), CheckerError> {
        tracing::info!(job_id = %job.id, "Failing job: {}", error.title);
        self.invoker
            .invoke(WorkerRequest::for_job(
                Operation::FailJob {
                    job_id: job.id.clone(),
                    error,
                },
                job,
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Sweep for JobChecker {
    const NAME: &'static str = "job checker";

    async fn sweep(&self, request_id: &str) {
        let _ = self
            .check(request_id)
            .await
            .inspect_err(|err| tracing::error!(?err, "Job checker failed with error {err}"));
    }
}

pub fn deadline_error(deadline: DateTime<Utc>) -> ProblemDetail {
    ProblemDetail::new(
        ProblemDetail::JOB_DEADLINE_PASSED,
        "Job failed to complete before deadline",
    )
    .with_detail(format!(
        "Job missed deadline of {}",
        deadline.to_rfc3339_opts(SecondsFormat::Millis, true)
    ))
}

pub fn timeout_error(minutes: u32) -> ProblemDetail {
    ProblemDetail::new(
        ProblemDetail::JOB_TIMEOUT_PASSED,
        "Job failed to complete before timeout limit",
    )
    .with_detail(format!("Job timed out after {minutes} minutes"))
}

#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Failed to enqueue worker request")]
    Invoke(#[from] InvokeError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;
    use mockall::predicate::*;

    use super::*;
    use crate::{
        job::NewJob,
        store::memory::InMemoryStore,
        worker::MockWorkerInvoker,
    };

    fn repository() -> JobRepository {
        JobRepository::new(Arc::new(InMemoryStore::new()), "https://jobs.example.com")
    }

    fn config() -> CheckerConfig {
        CheckerConfig::new("0 * * * * *".parse().unwrap())
    }

    fn fails(
        job_id: &JobId,
        problem_type: &'static str,
    ) -> impl Fn(&WorkerRequest) -> bool + Send + 'static {
        let job_id = job_id.clone();
        move |request| {
            matches!(
                &request.operation,
                Operation::FailJob { job_id: id, error }
                    if *id == job_id && error.problem_type == problem_type
            )
        }
    }

    async fn add_job(repository: &JobRepository, job: NewJob, status: JobStatus) -> Job {
        let job = repository.add_job(job).await.unwrap();
        repository
            .update_job(&job.with_status(status))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn timeout_fails_job() {
        let repository = repository();
        let job = add_job(&repository, NewJob::raw().with_timeout(5), JobStatus::Running).await;
        let mut execution = repository
            .add_execution(&job.id, JobStatus::Running)
            .await
            .unwrap();
        execution.actual_start_date = Some(Utc::now() - TimeDelta::minutes(6));
        repository.update_execution(&execution).await.unwrap();

        let mut invoker = MockWorkerInvoker::new();
        invoker
            .expect_invoke()
            .withf(fails(&job.id, ProblemDetail::JOB_TIMEOUT_PASSED))
            .times(1)
            .returning(|_| Ok(()));

        let report = JobChecker::new(repository, Arc::new(invoker), &config())
            .check("request")
            .await
            .unwrap();
        assert_eq!(report.failed, [job.id]);
        assert_eq!(report.active, 0);
    }

    #[tokio::test]
    async fn timeout_compares_fractional_minutes() {
        let repository = repository();
        let mut jobs = Vec::new();
        for seconds in [290, 310] {
            let job =
                add_job(&repository, NewJob::raw().with_timeout(5), JobStatus::Running).await;
            let mut execution = repository
                .add_execution(&job.id, JobStatus::Running)
                .await
                .unwrap();
            execution.actual_start_date = Some(Utc::now() - TimeDelta::seconds(seconds));
            repository.update_execution(&execution).await.unwrap();
            jobs.push(job);
        }

        let mut invoker = MockWorkerInvoker::new();
        invoker
            .expect_invoke()
            .withf(fails(&jobs[1].id, ProblemDetail::JOB_TIMEOUT_PASSED))
            .times(1)
            .returning(|_| Ok(()));

        let report = JobChecker::new(repository, Arc::new(invoker), &config())
            .check("request")
            .await
            .unwrap();
        assert_eq!(report.failed, [jobs[1].id.clone()]);
        assert_eq!(report.active, 1);
    }

    #[tokio::test]
    async fn timeout_counts_from_execution_creation_before_start() {
        let repository = repository();
        let job = add_job(&repository, NewJob::raw().with_timeout(5), JobStatus::Assigned).await;
        repository
            .add_execution(&job.id, JobStatus::Assigned)
            .await
            .unwrap();

        let mut invoker = MockWorkerInvoker::new();
        invoker.expect_invoke().never();

        let report = JobChecker::new(repository, Arc::new(invoker), &config())
            .check("request")
            .await
            .unwrap();
        assert_eq!(report.active, 1);
    }

    #[tokio::test]
    async fn deadline_fails_job() {
        let repository = repository();
        let deadline = Utc::now() - TimeDelta::minutes(1);
        let job = add_job(
            &repository,
            NewJob::raw().with_deadline(deadline).with_timeout(5),
            JobStatus::Queued,
        )
        .await;

        let mut invoker = MockWorkerInvoker::new();
        invoker
            .expect_invoke()
            .withf(fails(&job.id, ProblemDetail::JOB_DEADLINE_PASSED))
            .times(1)
            .returning(|_| Ok(()));

        let report = JobChecker::new(repository, Arc::new(invoker), &config())
            .check("request")
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn default_timeout_is_not_applied_with_deadline() {
        let repository = repository();
        let old = Utc::now() - TimeDelta::hours(2);
        let with_deadline = repository
            .update_job(
                &repository
                    .add_job(NewJob::raw().with_deadline(Utc::now() + TimeDelta::hours(1)))
                    .await
                    .unwrap()
                    .with_status(JobStatus::Running)
                    .with_date_created(old),
            )
            .await
            .unwrap();
        let without_deadline = repository
            .update_job(
                &repository
                    .add_job(NewJob::raw())
                    .await
                    .unwrap()
                    .with_status(JobStatus::Running)
                    .with_date_created(old),
            )
            .await
            .unwrap();

        let mut invoker = MockWorkerInvoker::new();
        invoker
            .expect_invoke()
            .withf(fails(&without_deadline.id, ProblemDetail::JOB_TIMEOUT_PASSED))
            .times(1)
            .returning(|_| Ok(()));

        let report = JobChecker::new(
            repository,
            Arc::new(invoker),
            &config().with_default_timeout(Some(30)),
        )
        .check("request")
        .await
        .unwrap();
        assert_eq!(report.failed, [without_deadline.id]);
        assert_eq!(report.active, 1);
        assert!(!report.failed.contains(&with_deadline.id));
    }

    #[tokio::test]
    async fn terminal_jobs_are_not_checked() {
        let repository = repository();
        add_job(
            &repository,
            NewJob::raw().with_deadline(Utc::now() - TimeDelta::hours(1)),
            JobStatus::Completed,
        )
        .await;

        let mut invoker = MockWorkerInvoker::new();
        invoker.expect_invoke().never();

        let report = JobChecker::new(repository, Arc::new(invoker), &config())
            .check("request")
            .await
            .unwrap();
        assert_eq!(report, CheckReport::default());
    }

    #[tokio::test]
    async fn concurrent_sweep_is_skipped() {
        let repository = repository();
        let held = repository.create_mutex(JobChecker::MUTEX_NAME, "other");
        assert!(held.try_lock().await.unwrap());

        let mut invoker = MockWorkerInvoker::new();
        invoker.expect_invoke().never();
        let checker = JobChecker::new(repository, Arc::new(invoker), &config());

        let report = checker.check("request").await.unwrap();
        assert!(report.skipped);

        held.unlock().await.unwrap();
        assert!(!checker.check("request").await.unwrap().skipped);
    }

    #[tokio::test]
    async fn sweep_releases_mutex() {
        let repository = repository();
        let checker = JobChecker::new(
            repository.clone(),
            Arc::new(MockWorkerInvoker::new()),
            &config(),
        );
        checker.check("first").await.unwrap();

        let mutex = repository.create_mutex(JobChecker::MUTEX_NAME, "second");
        assert!(mutex.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn sweeps_every_page() {
        let repository = repository();
        for _ in 0..(PAGE_SIZE + 5) {
            add_job(&repository, NewJob::raw().with_timeout(60), JobStatus::Running).await;
        }

        let report = JobChecker::new(repository, Arc::new(MockWorkerInvoker::new()), &config())
            .check("request")
            .await
            .unwrap();
        assert_eq!(report.active, PAGE_SIZE + 5);
    }

    #[tokio::test]
    async fn adaptive_throttling_keeps_trigger_enabled_with_active_jobs() {
        let repository = repository();
        add_job(&repository, NewJob::raw(), JobStatus::Running).await;

        let mut trigger = MockTrigger::new();
        let mut sequence = mockall::Sequence::new();
        trigger
            .expect_set_enabled()
            .with(eq(false))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        trigger
            .expect_set_enabled()
            .with(eq(true))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));

        JobChecker::new(
            repository.clone(),
            Arc::new(MockWorkerInvoker::new()),
            &config().with_adaptive_throttling(true),
        )
        .with_switch(CheckerSwitch::new(Arc::new(trigger), repository))
        .check("request")
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn adaptive_throttling_disables_trigger_without_active_jobs() {
        let repository = repository();

        let mut trigger = MockTrigger::new();
        trigger
            .expect_set_enabled()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(()));
        trigger.expect_set_enabled().with(eq(true)).never();

        JobChecker::new(
            repository.clone(),
            Arc::new(MockWorkerInvoker::new()),
            &config().with_adaptive_throttling(true),
        )
        .with_switch(CheckerSwitch::new(Arc::new(trigger), repository))
        .check("request")
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn fixed_schedule_never_toggles_trigger() {
        let repository = repository();
        add_job(&repository, NewJob::raw(), JobStatus::Running).await;

        let mut trigger = MockTrigger::new();
        trigger.expect_set_enabled().never();

        JobChecker::new(
            repository.clone(),
            Arc::new(MockWorkerInvoker::new()),
            &config(),
        )
        .with_switch(CheckerSwitch::new(Arc::new(trigger), repository))
        .check("request")
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn schedule_trigger_flag() {
        let trigger = ScheduleTrigger::default();
        assert!(trigger.is_enabled());
        trigger.set_enabled(false).await.unwrap();
        assert!(!trigger.clone().is_enabled());
    }

    #[test]
    fn problem_details() {
        let deadline = "2024-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            deadline_error(deadline).detail.as_deref(),
            Some("Job missed deadline of 2024-03-01T10:00:00.000Z")
        );
        assert_eq!(
            timeout_error(5).detail.as_deref(),
            Some("Job timed out after 5 minutes")
        );
    }
}
