//! Helpers for testing.
//!
//! [`FakeResourceManager`] stands in for a service registry and the services it lists. It records
//! every call so tests can assert on the traffic an operation produced.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde_json::json;

use crate::{
    job::Job,
    resource::{ResourceError, ResourceKind, ResourceManager},
};

pub const JOB_TYPE: &str = "TransformJob";
pub const PROFILE_ID: &str = "https://registry.example.com/job-profiles/transcode";
pub const PROFILE_NAME: &str = "Transcode";
pub const ASSIGNMENT_ENDPOINT: &str = "https://transform.example.com/job-assignments";

/// A job profile requiring the `inputFile` parameter.
pub fn transcode_profile() -> serde_json::Value {
    json!({
        "@type": "JobProfile",
        "id": PROFILE_ID,
        "name": PROFILE_NAME,
        "inputParameters": [
            { "parameterName": "inputFile", "parameterType": "Locator" },
            { "parameterName": "preset", "optional": true },
        ],
    })
}

/// A service able to run [`JOB_TYPE`] jobs with the [`transcode_profile`].
pub fn transform_service() -> serde_json::Value {
    json!({
        "@type": "Service",
        "id": "https://registry.example.com/services/transform",
        "name": "Transform Service",
        "jobType": JOB_TYPE,
        "resources": [
            { "resourceType": "JobAssignment", "httpEndpoint": ASSIGNMENT_ENDPOINT },
        ],
        "jobProfileIds": [PROFILE_ID],
    })
}

#[derive(Default)]
struct FakeState {
    resources: BTreeMap<String, serde_json::Value>,
    services: Vec<serde_json::Value>,
    failing: BTreeSet<String>,
    posts: Vec<(String, serde_json::Value)>,
    deletes: Vec<String>,
    notifications: Vec<Job>,
    assignments: u64,
}

/// An in memory [`ResourceManager`].
///
/// Posting to any url not ending in `/cancel` creates a job assignment with id
/// `{url}/{n}`. Urls registered through [`FakeResourceManager::fail_url`] answer with a 500.
#[derive(Clone, Default)]
pub struct FakeResourceManager {
    state: Arc<Mutex<FakeState>>,
}

impl FakeResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the transcode profile and the transform service.
    pub fn with_transform_service() -> Self {
        Self::new()
            .with_resource(PROFILE_ID, transcode_profile())
            .with_service(transform_service())
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_resource(self, id: impl Into<String>, resource: serde_json::Value) -> Self {
        self.state().resources.insert(id.into(), resource);
        self
    }

    pub fn with_service(self, service: serde_json::Value) -> Self {
        self.state().services.push(service);
        self
    }

    pub fn fail_url(&self, url: impl Into<String>) {
        self.state().failing.insert(url.into());
    }

    pub fn posts(&self) -> Vec<(String, serde_json::Value)> {
        self.state().posts.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state().deletes.clone()
    }

    pub fn notifications(&self) -> Vec<Job> {
        self.state().notifications.clone()
    }

    fn check(&self, url: &str) -> Result<(), ResourceError> {
        if self.state().failing.contains(url) {
            Err(ResourceError::api_error(500, format!("{url} is unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResourceManager for FakeResourceManager {
    async fn get(&self, id: &str) -> Result<serde_json::Value, ResourceError> {
        self.check(id)?;
        self.state()
            .resources
            .get(id)
            .cloned()
            .ok_or_else(|| ResourceError::api_error(404, format!("{id} not found")))
    }

    async fn query(&self, kind: ResourceKind) -> Result<Vec<serde_json::Value>, ResourceError> {
        let state = self.state();
        Ok(match kind {
            ResourceKind::Service => state.services.clone(),
            ResourceKind::JobProfile => state
                .resources
                .values()
                .filter(|resource| resource["@type"] == "JobProfile")
                .cloned()
                .collect(),
        })
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        self.check(url)?;
        let mut state = self.state();
        state.posts.push((url.to_owned(), body.clone()));
        if url.ends_with("/cancel") {
            return Ok(serde_json::Value::Null);
        }
        state.assignments += 1;
        let mut created = body.clone();
        created["id"] = json!(format!("{url}/{}", state.assignments));
        Ok(created)
    }

    async fn delete(&self, url: &str) -> Result<(), ResourceError> {
        self.check(url)?;
        self.state().deletes.push(url.to_owned());
        Ok(())
    }

    async fn send_notification(&self, job: &Job) -> Result<(), ResourceError> {
        self.state().notifications.push(job.clone());
        Ok(())
    }
}
