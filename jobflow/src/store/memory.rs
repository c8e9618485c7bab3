//! Provides an in memory implementation of [`DocumentStore`].
//!
//! The mutexes it hands out are only shared between clones of the same store, so it coordinates
//! tasks within one process. It is a correct implementation intended for tests, demos and single
//! process deployments.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use tokio::sync::Notify;

use super::{
    parent_path, queryable::Queryable, DocumentMutex, DocumentQuery, DocumentStore, IndexKeys,
    PageToken, QueryResults, SortOrder, StoreError,
};

/// An in memory implementation of [`DocumentStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    documents: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
    locks: Arc<LockTable>,
}

#[derive(Default)]
struct LockTable {
    holders: Mutex<FxHashMap<String, String>>,
    released: Notify,
}

impl InMemoryStore {
    /// Creates a new, empty instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored documents.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self
            .documents
            .read()
            .map_err(|_| StoreError::BadState)?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|len| len == 0)
    }
}

type SortKey = (DateTime<Utc>, String);

fn sort_key(path: &str, keys: &IndexKeys) -> SortKey {
    (keys.created.unwrap_or_default(), path.to_owned())
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, path: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .documents
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(path)
            .cloned())
    }

    async fn put(
        &self,
        path: &str,
        item: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        self.documents
            .write()
            .map_err(|_| StoreError::BadState)?
            .insert(path.to_owned(), item.clone());
        Ok(item)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.documents
            .write()
            .map_err(|_| StoreError::BadState)?
            .remove(path);
        Ok(())
    }

    async fn query(
        &self,
        query: DocumentQuery,
    ) -> Result<QueryResults<serde_json::Value>, StoreError> {
        let after = query.page_token.as_ref().map(PageToken::decode).transpose()?;

        let mut matching = self
            .documents
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|(path, _)| parent_path(path) == query.path)
            .map(|(path, item)| (IndexKeys::of(item), path, item))
            .filter(|(keys, _, _)| query.filter.matches(keys))
            .map(|(keys, path, item)| (sort_key(path, &keys), item.clone()))
            .collect::<Vec<_>>();

        match query.sort_order {
            SortOrder::Ascending => matching.sort_by(|(a, _), (b, _)| a.cmp(b)),
            SortOrder::Descending => matching.sort_by(|(a, _), (b, _)| b.cmp(a)),
        }

        if let Some(after) = after {
            matching.retain(|(key, _)| match query.sort_order {
                SortOrder::Ascending => *key > after,
                SortOrder::Descending => *key < after,
            });
        }

        let next_page_token = match query.page_size {
            Some(page_size) if matching.len() > page_size => {
                matching.truncate(page_size);
                matching
                    .last()
                    .map(|((created, path), _)| PageToken::new(Some(*created), path))
            }
            _ => None,
        };

        Ok(QueryResults {
            results: matching.into_iter().map(|(_, item)| item).collect(),
            next_page_token,
        })
    }

    fn create_mutex(&self, name: &str, holder: &str) -> Box<dyn DocumentMutex> {
        Box::new(InMemoryMutex {
            name: name.to_owned(),
            holder: holder.to_owned(),
            locks: self.locks.clone(),
        })
    }
}

struct InMemoryMutex {
    name: String,
    holder: String,
    locks: Arc<LockTable>,
}

impl InMemoryMutex {
    fn acquire(&self) -> Result<bool, StoreError> {
        let mut holders = self.locks.holders.lock().map_err(|_| StoreError::BadState)?;
        if holders.contains_key(&self.name) {
            Ok(false)
        } else {
            holders.insert(self.name.clone(), self.holder.clone());
            Ok(true)
        }
    }
}

#[async_trait]
impl DocumentMutex for InMemoryMutex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self) -> Result<(), StoreError> {
        loop {
            // Registered before checking so a release in between is not missed.
            let released = self.locks.released.notified();
            if self.acquire()? {
                return Ok(());
            }
            released.await;
        }
    }

    async fn try_lock(&self) -> Result<bool, StoreError> {
        self.acquire()
    }

    async fn unlock(&self) -> Result<(), StoreError> {
        {
            let mut holders = self.locks.holders.lock().map_err(|_| StoreError::BadState)?;
            match holders.get(&self.name) {
                Some(holder) if *holder == self.holder => {
                    holders.remove(&self.name);
                }
                Some(holder) => {
                    tracing::warn!(
                        mutex = %self.name,
                        %holder,
                        "Mutex {} is held by {holder}, not by {}",
                        self.name,
                        self.holder
                    );
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
        self.locks.released.notify_waiters();
        Ok(())
    }
}
