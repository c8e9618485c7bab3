//! The purpose of this module is to alleviate the need to import many of the `[jobflow]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobflow::prelude::*;
//! ```
pub use crate::api::{Accepted, ApiError, JobApi};
pub use crate::checker::{CheckerConfig, CheckerSwitch, JobChecker, ScheduleTrigger, Trigger};
pub use crate::cleanup::{CleanupConfig, JobCleanup};
pub use crate::job::query::JobQuery;
pub use crate::job::{Job, JobExecution, JobId, JobStatus, NewJob, ProblemDetail, Tracker};
pub use crate::repository::JobRepository;
pub use crate::resource::http::HttpResourceManager;
pub use crate::resource::{ResourceManager, ResourceManagerExt};
pub use crate::store::memory::InMemoryStore;
pub use crate::store::{DocumentStore, PageToken, SortOrder};
pub use crate::worker::{LocalWorkerInvoker, Operation, Worker, WorkerInvoker, WorkerRequest};
pub use crate::{JobflowError, Orchestrator, OrchestratorConfig};
