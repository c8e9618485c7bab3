//! A [`ResourceManager`] backed by a service registry reachable over HTTP.
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;

use super::{Notification, ResourceError, ResourceKind, ResourceManager};
use crate::job::Job;

/// Talks to the service registry at `registry_url` and to the services it lists.
///
/// # Example
///
/// ```
/// use jobflow::resource::http::HttpResourceManager;
///
/// let manager = HttpResourceManager::new("https://registry.example.com/api/");
/// assert_eq!(manager.registry_url(), "https://registry.example.com/api");
/// ```
#[derive(Debug, Clone)]
pub struct HttpResourceManager {
    registry_url: String,
    client: Client,
}

impl HttpResourceManager {
    pub fn new(registry_url: impl Into<String>) -> Self {
        Self::with_client(registry_url, Client::new())
    }

    /// Use a preconfigured client, e.g. with timeouts or default auth headers.
    pub fn with_client(registry_url: impl Into<String>, client: Client) -> Self {
        let registry_url = registry_url.into();
        Self {
            registry_url: registry_url.trim_end_matches('/').to_owned(),
            client,
        }
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ResourceError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_owned());
            return Err(ResourceError::api_error(status.as_u16(), message));
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn handle_empty_response(response: reqwest::Response) -> Result<(), ResourceError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_owned());
            return Err(ResourceError::api_error(status.as_u16(), message));
        }
        Ok(())
    }
}

/// Registries either answer with a bare list or with a page of results.
fn into_results(value: serde_json::Value) -> Result<Vec<serde_json::Value>, ResourceError> {
    match value {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut page) => match page.remove("results") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => Err(ResourceError::InvalidDescriptor(
                "Query response has no results".to_owned(),
            )),
        },
        _ => Err(ResourceError::InvalidDescriptor(
            "Query response is not a list".to_owned(),
        )),
    }
}

#[async_trait]
impl ResourceManager for HttpResourceManager {
    async fn get(&self, id: &str) -> Result<serde_json::Value, ResourceError> {
        let response = self.client.get(id).send().await?;
        Self::handle_response(response).await
    }

    async fn query(&self, kind: ResourceKind) -> Result<Vec<serde_json::Value>, ResourceError> {
        let url = format!("{}/{}", self.registry_url, kind.collection());
        let response = self.client.get(&url).send().await?;
        into_results(Self::handle_response(response).await?)
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        let response = self.client.post(url).json(body).send().await?;
        Self::handle_response(response).await
    }

    async fn delete(&self, url: &str) -> Result<(), ResourceError> {
        let response = self.client.delete(url).send().await?;
        Self::handle_empty_response(response).await
    }

    async fn send_notification(&self, job: &Job) -> Result<(), ResourceError> {
        let Some(endpoint) = &job.notification_endpoint else {
            return Ok(());
        };
        let notification = Notification {
            source: &job.id,
            content: job,
        };
        let response = self
            .client
            .post(&endpoint.http_endpoint)
            .json(&notification)
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }
}
