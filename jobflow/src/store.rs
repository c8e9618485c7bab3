//! The document store contract the orchestrator persists through.
//!
//! A [`DocumentStore`] is a key-value store of JSON documents addressed by path, with range
//! queries over the documents directly below a collection path, and a named distributed mutex
//! primitive. Two implementations exist: [`memory::InMemoryStore`] in this crate and the
//! PostgreSQL store in `jobflow-sqlx`. Both index documents on their `status` and `dateCreated`
//! fields, see [`IndexKeys`].
//!
//! Backends that want to check conformance can include [`crate::test_suite`] in their tests.
use std::{fmt::Display, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
mod queryable;
#[doc(hidden)]
pub mod testing;

pub use queryable::Queryable;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Prepares the backing table. Called once, lazily, before the first operation.
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }
    async fn get(&self, path: &str) -> Result<Option<serde_json::Value>, StoreError>;
    async fn put(
        &self,
        path: &str,
        item: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError>;
    async fn delete(&self, path: &str) -> Result<(), StoreError>;
    async fn query(
        &self,
        query: DocumentQuery,
    ) -> Result<QueryResults<serde_json::Value>, StoreError>;
    fn create_mutex(&self, name: &str, holder: &str) -> Box<dyn DocumentMutex>;
}

/// A named lock shared by every process using the same store.
///
/// The lock is not reentrant: a second `lock` by the same holder waits like any other caller.
#[async_trait]
pub trait DocumentMutex: Send + Sync {
    fn name(&self) -> &str;
    /// Waits until the lock is acquired.
    async fn lock(&self) -> Result<(), StoreError>;
    /// Acquires the lock if it is free, never waits.
    async fn try_lock(&self) -> Result<bool, StoreError>;
    async fn unlock(&self) -> Result<(), StoreError>;
}

/// Holds a [`DocumentMutex`] until released.
///
/// Callers should [`LockGuard::release`] explicitly so unlock failures are observed. A guard that
/// is dropped while still held (early return through `?`, panic, cancelled future) unlocks in a
/// background task.
pub struct LockGuard {
    mutex: Option<Box<dyn DocumentMutex>>,
}

impl LockGuard {
    pub async fn acquire(mutex: Box<dyn DocumentMutex>) -> Result<Self, StoreError> {
        mutex.lock().await?;
        tracing::trace!(mutex = mutex.name(), "Acquired mutex");
        Ok(Self { mutex: Some(mutex) })
    }

    pub async fn try_acquire(mutex: Box<dyn DocumentMutex>) -> Result<Option<Self>, StoreError> {
        if mutex.try_lock().await? {
            tracing::trace!(mutex = mutex.name(), "Acquired mutex");
            Ok(Some(Self { mutex: Some(mutex) }))
        } else {
            Ok(None)
        }
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        match self.mutex.take() {
            Some(mutex) => mutex.unlock().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(mutex) = self.mutex.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = mutex.unlock().await.inspect_err(|err| {
                        tracing::error!(?err, mutex = mutex.name(), "Failed to unlock mutex {err}")
                    });
                });
            }
            Err(_) => tracing::error!(
                mutex = mutex.name(),
                "Mutex dropped outside of a runtime and was not unlocked"
            ),
        }
    }
}

/// A query for the documents directly below `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentQuery {
    pub path: String,
    pub filter: Filter,
    pub sort_order: SortOrder,
    pub page_size: Option<usize>,
    pub page_token: Option<PageToken>,
}

impl DocumentQuery {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            filter: Filter::And(Vec::new()),
            sort_order: SortOrder::Ascending,
            page_size: None,
            page_token: None,
        }
    }

    pub fn with_filter(self, filter: Filter) -> Self {
        Self { filter, ..self }
    }

    pub fn sorted(self, sort_order: SortOrder) -> Self {
        Self { sort_order, ..self }
    }

    pub fn with_page_size(self, page_size: Option<usize>) -> Self {
        Self { page_size, ..self }
    }

    pub fn starting_at(self, page_token: Option<PageToken>) -> Self {
        Self { page_token, ..self }
    }
}

/// Backend independent filter over the indexed fields of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    StatusEqual(String),
    /// Created at or after the given time.
    CreatedFrom(DateTime<Utc>),
    /// Created at or before the given time.
    CreatedTo(DateTime<Utc>),
}

/// Documents are always sorted by creation time, ties broken by path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl FromStr for SortOrder {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "ascending" | "asc" => Ok(SortOrder::Ascending),
            "descending" | "desc" => Ok(SortOrder::Descending),
            _ => Err(StoreError::InvalidQuery(format!("Unknown sort order '{value}'"))),
        }
    }
}

/// The values a store indexes a document by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKeys {
    pub status: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

impl IndexKeys {
    pub const STATUS_FIELD: &'static str = "status";
    pub const CREATED_FIELD: &'static str = "dateCreated";

    pub fn of(item: &serde_json::Value) -> Self {
        Self {
            status: item
                .get(Self::STATUS_FIELD)
                .and_then(serde_json::Value::as_str)
                .map(ToOwned::to_owned),
            created: item
                .get(Self::CREATED_FIELD)
                .and_then(serde_json::Value::as_str)
                .and_then(|created| DateTime::parse_from_rfc3339(created).ok())
                .map(|created| created.with_timezone(&Utc)),
        }
    }
}

/// The collection path a document belongs to.
pub fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Opaque continuation token for paginated queries.
///
/// Encodes the sort key of the last returned document so a page is stable under concurrent
/// inserts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    pub fn new(created: Option<DateTime<Utc>>, path: &str) -> Self {
        let created = created.unwrap_or_default();
        Self(format!(
            "{}|{path}",
            created.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ))
    }

    pub fn decode(&self) -> Result<(DateTime<Utc>, String), StoreError> {
        let (created, path) = self
            .0
            .split_once('|')
            .ok_or_else(|| StoreError::InvalidPageToken(self.0.clone()))?;
        let created = DateTime::parse_from_rfc3339(created)
            .map_err(|_| StoreError::InvalidPageToken(self.0.clone()))?
            .with_timezone(&Utc);
        Ok((created, path.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PageToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for PageToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResults<T> {
    pub results: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<PageToken>,
}

impl QueryResults<serde_json::Value> {
    pub(crate) fn decode<T: serde::de::DeserializeOwned>(
        self,
    ) -> Result<QueryResults<T>, StoreError> {
        Ok(QueryResults {
            results: self
                .results
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<_, _>>()?,
            next_page_token: self.next_page_token,
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Error encoding or decoding document")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("System in bad state")]
    BadState,
}
