//! The job and job execution records tracked by the orchestrator.
//!
//! A [`Job`] is the externally visible work request. Every attempt to run it on a remote service
//! is recorded as a [`JobExecution`]; the most recently created execution is the *current* one
//! and the job's status always mirrors it once it exists.
use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod query;

/// The URL shaped identifier of a job, `{public_url}/jobs/{uuid}`.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    New,
    Pending,
    Assigned,
    Queued,
    Scheduled,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// The statuses the watchdog treats as still in flight.
    pub const ACTIVE: [JobStatus; 6] = [
        JobStatus::New,
        JobStatus::Pending,
        JobStatus::Assigned,
        JobStatus::Queued,
        JobStatus::Scheduled,
        JobStatus::Running,
    ];

    pub const TERMINAL: [JobStatus; 3] =
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "New",
            JobStatus::Pending => "Pending",
            JobStatus::Assigned => "Assigned",
            JobStatus::Queued => "Queued",
            JobStatus::Scheduled => "Scheduled",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Canceled => "Canceled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        JobStatus::ACTIVE
            .into_iter()
            .chain(JobStatus::TERMINAL)
            .find(|status| status.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownStatus(value.to_owned()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown job status '{0}'")]
pub struct UnknownStatus(String);

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named input or output values of a job.
pub type JobParameterBag = BTreeMap<String, serde_json::Value>;

/// An RFC 7807 style description of a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetail {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl ProblemDetail {
    pub const JOB_START_FAILURE: &'static str =
        "uri://jobflow/rfc7807/job-processor/job-start-failure";
    pub const JOB_DEADLINE_PASSED: &'static str =
        "uri://jobflow/rfc7807/job-processor/job-deadline-passed";
    pub const JOB_TIMEOUT_PASSED: &'static str =
        "uri://jobflow/rfc7807/job-processor/job-timeout-passed";

    pub fn new(problem_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            problem_type: problem_type.into(),
            title: title.into(),
            detail: None,
            stacktrace: None,
        }
    }

    pub fn with_detail(self, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..self
        }
    }
}

/// Correlation information propagated across every record and notification of a logical job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEndpoint {
    pub http_endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "@type")]
    pub job_type: String,
    pub job_profile_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_input: Option<JobParameterBag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_output: Option<JobParameterBag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Relative timeout in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<Tracker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_endpoint: Option<NotificationEndpoint>,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

impl Job {
    pub fn builder(job_type: impl Into<String>, job_profile_id: impl Into<String>) -> NewJob {
        NewJob::new(job_type, job_profile_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline < now)
    }

    /// Copies the state of the given execution onto the job.
    pub(crate) fn mirror(&mut self, execution: &JobExecution) {
        self.status = execution.status;
        self.error = execution.error.clone();
        self.progress = execution.progress;
        self.job_output = execution.job_output.clone();
    }
}

/// A job that has not been stored yet.
///
/// The id and timestamps are assigned by [`crate::repository::JobRepository::add_job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    #[serde(rename = "@type")]
    pub job_type: String,
    pub job_profile_id: String,
    #[serde(default)]
    pub job_input: Option<JobParameterBag>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub tracker: Option<Tracker>,
    #[serde(default)]
    pub notification_endpoint: Option<NotificationEndpoint>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, job_profile_id: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            job_profile_id: job_profile_id.into(),
            job_input: None,
            deadline: None,
            timeout: None,
            tracker: None,
            notification_endpoint: None,
        }
    }

    pub fn with_input(self, job_input: JobParameterBag) -> Self {
        Self {
            job_input: Some(job_input),
            ..self
        }
    }

    pub fn add_input(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.job_input
            .get_or_insert_with(Default::default)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_deadline(self, deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    pub fn with_timeout(self, minutes: u32) -> Self {
        Self {
            timeout: Some(minutes),
            ..self
        }
    }

    pub fn with_tracker(self, tracker: Tracker) -> Self {
        Self {
            tracker: Some(tracker),
            ..self
        }
    }

    pub fn with_notification_endpoint(self, http_endpoint: impl Into<String>) -> Self {
        Self {
            notification_endpoint: Some(NotificationEndpoint {
                http_endpoint: http_endpoint.into(),
            }),
            ..self
        }
    }

    pub(crate) fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            job_type: self.job_type,
            job_profile_id: self.job_profile_id,
            status: JobStatus::New,
            job_input: self.job_input,
            job_output: None,
            progress: None,
            error: None,
            deadline: self.deadline,
            timeout: self.timeout,
            tracker: self.tracker,
            notification_endpoint: self.notification_endpoint,
            date_created: now,
            date_modified: now,
        }
    }
}

/// One attempt to run a [`Job`] on a remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    /// `{job_id}/executions/{n}`
    pub id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_assignment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_end_date: Option<DateTime<Utc>>,
    /// Milliseconds between the actual start and end dates.
    #[serde(default)]
    pub actual_duration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_output: Option<JobParameterBag>,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

impl JobExecution {
    pub(crate) fn new(id: String, status: JobStatus, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status,
            job_assignment_id: None,
            actual_start_date: None,
            actual_end_date: None,
            actual_duration: 0,
            error: None,
            progress: None,
            job_output: None,
            date_created: now,
            date_modified: now,
        }
    }

    /// The 1-based attempt number encoded at the end of the id.
    pub fn number(&self) -> Option<u32> {
        self.id.rsplit('/').next()?.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The duration is only ever derived from a strictly increasing start/end pair, otherwise it
    /// is zero.
    pub fn update_duration(&mut self) {
        self.actual_duration = match (self.actual_start_date, self.actual_end_date) {
            (Some(start), Some(end)) if start < end => (end - start).num_milliseconds(),
            _ => 0,
        };
    }
}

#[cfg(test)]
pub(crate) mod test {
    use chrono::TimeDelta;

    use super::*;

    impl Job {
        pub(crate) const DEFAULT_TYPE: &'static str = crate::testing::JOB_TYPE;
        pub(crate) const DEFAULT_PROFILE: &'static str = crate::testing::PROFILE_ID;

        pub(crate) fn raw_job() -> Self {
            NewJob::raw().into_job(
                format!("https://jobs.example.com/jobs/{}", uuid::Uuid::new_v4()).into(),
                Utc::now(),
            )
        }

        pub(crate) fn with_status(self, status: JobStatus) -> Self {
            Self { status, ..self }
        }

        pub(crate) fn with_date_created(self, date_created: DateTime<Utc>) -> Self {
            Self {
                date_created,
                ..self
            }
        }
    }

    impl NewJob {
        pub(crate) fn raw() -> Self {
            NewJob::new(Job::DEFAULT_TYPE, Job::DEFAULT_PROFILE)
                .add_input("inputFile", "s3://bucket/in.mp4")
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::TERMINAL.iter().all(JobStatus::is_terminal));
        assert!(!JobStatus::ACTIVE.iter().any(JobStatus::is_terminal));
    }

    #[test]
    fn duration_requires_increasing_pair() {
        let now = Utc::now();
        let mut execution =
            JobExecution::new("/jobs/1/executions/1".into(), JobStatus::Running, now);

        execution.update_duration();
        assert_eq!(execution.actual_duration, 0);

        execution.actual_start_date = Some(now);
        execution.actual_end_date = Some(now + TimeDelta::seconds(3));
        execution.update_duration();
        assert_eq!(execution.actual_duration, 3000);

        execution.actual_end_date = Some(now - TimeDelta::seconds(3));
        execution.update_duration();
        assert_eq!(execution.actual_duration, 0);

        execution.actual_end_date = Some(now);
        execution.update_duration();
        assert_eq!(execution.actual_duration, 0);
    }

    #[test]
    fn execution_number() {
        let execution =
            JobExecution::new("https://h/jobs/1/executions/12".into(), JobStatus::New, Utc::now());
        assert_eq!(execution.number(), Some(12));
    }

    #[test]
    fn serializes_with_wire_names() {
        let job = Job::raw_job();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["@type"], Job::DEFAULT_TYPE);
        assert_eq!(value["status"], "New");
        assert!(value.get("dateCreated").is_some());
        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }
}
