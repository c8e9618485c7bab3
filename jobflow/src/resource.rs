//! The remote service registry and the calls the orchestrator makes to remote services.
//!
//! [`ResourceManager`] is the seam to everything outside the orchestrator's own store: looking up
//! job profiles and registered services, posting job assignments, asking for their cancellation
//! or deletion, and publishing job state. [`http::HttpResourceManager`] talks to a service
//! registry over HTTP.
use std::fmt::Display;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobId, NotificationEndpoint, Tracker};

pub mod http;

#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Fetches the resource with the given URL shaped id.
    async fn get(&self, id: &str) -> Result<serde_json::Value, ResourceError>;
    /// Lists every registered resource of a kind.
    async fn query(&self, kind: ResourceKind) -> Result<Vec<serde_json::Value>, ResourceError>;
    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError>;
    async fn delete(&self, url: &str) -> Result<(), ResourceError>;
    /// Publishes the current state of a job to whoever asked to be notified about it.
    async fn send_notification(&self, job: &Job) -> Result<(), ResourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    JobProfile,
}

impl ResourceKind {
    /// The collection the registry serves this kind under.
    pub fn collection(&self) -> &'static str {
        match self {
            ResourceKind::Service => "services",
            ResourceKind::JobProfile => "job-profiles",
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Service => f.write_str("Service"),
            ResourceKind::JobProfile => f.write_str("JobProfile"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEndpoint {
    pub resource_type: String,
    pub http_endpoint: String,
}

/// A registered remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceEndpoint>,
    #[serde(default)]
    pub job_profile_ids: Vec<String>,
}

impl Service {
    pub const JOB_ASSIGNMENT: &'static str = "JobAssignment";

    pub fn endpoint(&self, resource_type: &str) -> Option<&str> {
        self.resources
            .iter()
            .find(|resource| resource.resource_type == resource_type)
            .map(|resource| resource.http_endpoint.as_str())
    }

    pub fn job_assignment_endpoint(&self) -> Option<&str> {
        self.endpoint(Self::JOB_ASSIGNMENT)
    }

    pub fn supports_profile(&self, job_profile_id: &str) -> bool {
        self.job_profile_ids.iter().any(|id| id == job_profile_id)
    }
}

impl TryFrom<serde_json::Value> for Service {
    type Error = ResourceError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let service: Service = serde_json::from_value(value)
            .map_err(|err| ResourceError::InvalidDescriptor(err.to_string()))?;
        if let Some(resource) = service
            .resources
            .iter()
            .find(|resource| resource.http_endpoint.is_empty())
        {
            return Err(ResourceError::InvalidDescriptor(format!(
                "Service '{}' declares resource '{}' without an endpoint",
                service.name, resource.resource_type
            )));
        }
        Ok(service)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParameter {
    pub parameter_name: String,
    #[serde(default)]
    pub parameter_type: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input_parameters: Vec<JobParameter>,
    #[serde(default)]
    pub output_parameters: Vec<JobParameter>,
}

impl JobProfile {
    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.input_parameters
            .iter()
            .filter(|parameter| !parameter.optional)
            .map(|parameter| parameter.parameter_name.as_str())
    }
}

/// The request posted to a service's job assignment endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAssignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub job_id: JobId,
    pub notification_endpoint: NotificationEndpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<Tracker>,
}

/// The body of a notification about a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification<'a> {
    pub source: &'a JobId,
    pub content: &'a Job,
}

/// Convenience lookups on top of a [`ResourceManager`].
#[async_trait]
pub trait ResourceManagerExt: ResourceManager {
    async fn get_job_profile(&self, id: &str) -> Result<JobProfile, ResourceError> {
        Ok(serde_json::from_value(self.get(id).await?)?)
    }

    /// The registered services that could be parsed, the others are skipped with a warning.
    async fn services(&self) -> Result<Vec<Service>, ResourceError> {
        Ok(self
            .query(ResourceKind::Service)
            .await?
            .into_iter()
            .filter_map(|value| {
                Service::try_from(value)
                    .inspect_err(|err| {
                        tracing::warn!(?err, "Skipping unusable service descriptor: {err}")
                    })
                    .ok()
            })
            .collect())
    }
}

impl<T: ResourceManager + ?Sized> ResourceManagerExt for T {}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Request failed with status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Failed to decode resource: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Invalid resource descriptor: {0}")]
    InvalidDescriptor(String),
}

impl ResourceError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn service_from_descriptor() {
        let service = Service::try_from(json!({
            "@type": "Service",
            "id": "https://registry/services/transform",
            "name": "Transform Service",
            "jobType": "TransformJob",
            "resources": [
                {
                    "resourceType": "JobAssignment",
                    "httpEndpoint": "https://transform/job-assignments"
                }
            ],
            "jobProfileIds": ["https://registry/job-profiles/transcode"],
        }))
        .unwrap();

        assert_eq!(service.job_type.as_deref(), Some("TransformJob"));
        assert_eq!(
            service.job_assignment_endpoint(),
            Some("https://transform/job-assignments")
        );
        assert!(service.supports_profile("https://registry/job-profiles/transcode"));
        assert!(!service.supports_profile("https://registry/job-profiles/other"));
    }

    #[test]
    fn invalid_service_descriptors() {
        assert_matches!(
            Service::try_from(json!({ "jobType": "TransformJob" })),
            Err(ResourceError::InvalidDescriptor(_))
        );
        assert_matches!(
            Service::try_from(json!({
                "name": "Broken",
                "resources": [{ "resourceType": "JobAssignment", "httpEndpoint": "" }],
            })),
            Err(ResourceError::InvalidDescriptor(_))
        );
    }

    #[test]
    fn service_without_assignment_endpoint() {
        let service = Service::try_from(json!({ "name": "Passive", "jobType": "TransformJob" }))
            .unwrap();
        assert_eq!(service.job_assignment_endpoint(), None);
    }

    #[test]
    fn optional_parameters_are_not_required() {
        let profile: JobProfile = serde_json::from_value(json!({
            "id": "https://registry/job-profiles/transcode",
            "name": "Transcode",
            "inputParameters": [
                { "parameterName": "inputFile", "parameterType": "Locator" },
                { "parameterName": "preset", "optional": true },
            ],
        }))
        .unwrap();

        assert_eq!(profile.required_inputs().collect::<Vec<_>>(), ["inputFile"]);
    }

    #[test]
    fn job_assignment_wire_format() {
        let assignment = JobAssignment {
            id: None,
            job_id: JobId::from("https://jobs/jobs/1"),
            notification_endpoint: NotificationEndpoint {
                http_endpoint: "https://jobs/jobs/1/executions/1/notifications".to_owned(),
            },
            tracker: None,
        };
        assert_eq!(
            serde_json::to_value(&assignment).unwrap(),
            json!({
                "jobId": "https://jobs/jobs/1",
                "notificationEndpoint": {
                    "httpEndpoint": "https://jobs/jobs/1/executions/1/notifications"
                },
            })
        );
    }
}
