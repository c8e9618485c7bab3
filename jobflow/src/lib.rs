//! A multi-tenant job orchestration engine.
//!
//! Clients submit [`job::Job`]s through the [`api::JobApi`]. The orchestrator finds a service able
//! to run each job, dispatches it as a job assignment and follows its progress through the
//! notifications the service sends back. Every state change runs as a worker operation holding
//! the job's mutex in the shared [`store::DocumentStore`], so any number of processes can serve
//! the same jobs.
//!
//! Two optional sweeps run on cron schedules: the [`checker::JobChecker`] fails jobs that missed
//! their deadline or timeout, and the [`cleanup::JobCleanup`] deletes finished jobs once their
//! retention period is over.
//!
//! ```no_run
//! # use std::{str::FromStr, sync::Arc};
//! # use jobflow::prelude::*;
//! # async fn run() -> Result<(), JobflowError> {
//! let orchestrator = Orchestrator::builder(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(HttpResourceManager::new("https://registry.example.com")),
//!     OrchestratorConfig::new("https://jobs.example.com"),
//! )
//! .with_job_checker(
//!     CheckerConfig::new(cron::Schedule::from_str("0 * * * * *").unwrap())
//!         .with_default_timeout(CheckerConfig::default_timeout_from_env()),
//! )
//! .start();
//!
//! let job = orchestrator
//!     .api()
//!     .add_job(NewJob::new("TransformJob", "https://registry.example.com/job-profiles/transcode"))
//!     .await?;
//! # let _ = job;
//! orchestrator.graceful_shutdown().await
//! # }
//! ```
use std::sync::Arc;

use checker::{CheckerConfig, CheckerSwitch, JobChecker, ScheduleTrigger};
use cleanup::{CleanupConfig, JobCleanup};
use repository::JobRepository;
use resource::ResourceManager;
use schedule::SweepRunner;
use store::{DocumentStore, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::{LocalWorkerInvoker, Worker};

pub mod api;
pub mod checker;
pub mod cleanup;
pub mod job;
pub mod prelude;
pub mod repository;
pub mod resource;
pub mod schedule;
pub mod store;
#[doc(hidden)]
pub mod testing;
pub mod worker;

use api::{ApiError, JobApi};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base url of the job endpoints, used to form job ids.
    pub public_url: String,
}

impl OrchestratorConfig {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
        }
    }
}

pub struct OrchestratorBuilder {
    repository: JobRepository,
    resource_manager: Arc<dyn ResourceManager>,
    checker: Option<CheckerConfig>,
    cleanup: Option<CleanupConfig>,
}

impl OrchestratorBuilder {
    /// Runs the watchdog on the given schedule.
    pub fn with_job_checker(self, config: CheckerConfig) -> Self {
        Self {
            checker: Some(config),
            ..self
        }
    }

    /// Runs the retention cleanup on the given schedule.
    pub fn with_job_cleanup(self, config: CleanupConfig) -> Self {
        Self {
            cleanup: Some(config),
            ..self
        }
    }

    /// Spawns the worker and the configured sweeps onto the current runtime.
    pub fn start(self) -> Orchestrator {
        let cancellation_token = CancellationToken::new();
        let (invoker, receiver) = LocalWorkerInvoker::channel();
        let invoker = Arc::new(invoker);
        let mut worker = Worker::new(self.repository.clone(), self.resource_manager.clone());
        let mut sweeps = Vec::new();

        if let Some(config) = self.checker {
            let trigger = ScheduleTrigger::default();
            let switch = CheckerSwitch::new(Arc::new(trigger.clone()), self.repository.clone());
            worker = worker.with_job_checker(switch.clone());
            let checker = JobChecker::new(self.repository.clone(), invoker.clone(), &config)
                .with_switch(switch);
            sweeps.push(
                SweepRunner::new(checker, config.schedule)
                    .with_trigger(trigger)
                    .spawn(cancellation_token.child_token()),
            );
        }
        if let Some(config) = self.cleanup {
            let cleanup = JobCleanup::new(self.repository.clone(), invoker.clone(), &config);
            sweeps.push(
                SweepRunner::new(cleanup, config.schedule).spawn(cancellation_token.child_token()),
            );
        }

        let worker = worker.spawn(receiver, cancellation_token.child_token());
        tracing::debug!(sweeps = sweeps.len(), "Started job orchestrator");

        Orchestrator {
            api: JobApi::new(self.repository, self.resource_manager, invoker),
            worker,
            sweeps,
            cancellation_token,
        }
    }
}

/// A running orchestrator: the job API backed by an in process worker and the sweeps.
pub struct Orchestrator {
    api: JobApi,
    worker: JoinHandle<()>,
    sweeps: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Orchestrator {
    pub fn builder(
        store: Arc<dyn DocumentStore>,
        resource_manager: Arc<dyn ResourceManager>,
        config: OrchestratorConfig,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            repository: JobRepository::new(store, &config.public_url),
            resource_manager,
            checker: None,
            cleanup: None,
        }
    }

    pub fn api(&self) -> &JobApi {
        &self.api
    }

    /// Stops the sweeps, then waits for the worker to finish the requests it is running.
    pub async fn graceful_shutdown(self) -> Result<(), JobflowError> {
        tracing::debug!("Shutting down job orchestrator tasks");
        self.cancellation_token.cancel();
        for result in futures::future::join_all(self.sweeps).await {
            result.map_err(|_| JobflowError::GracefulShutdownFailed)?;
        }
        self.worker
            .await
            .map_err(|_| JobflowError::GracefulShutdownFailed)
    }
}

#[derive(Debug, Error)]
pub enum JobflowError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Api(#[from] ApiError),
}
