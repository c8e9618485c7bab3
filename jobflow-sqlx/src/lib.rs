//! A PostgreSQL [`DocumentStore`] for jobflow.
//!
//! Documents live in the `jobflow_documents` table together with the values they are queried by,
//! their parent collection, `status` and `dateCreated`. Mutexes are rows in `jobflow_mutexes`
//! that expire after the configured lock timeout, so a process that dies while holding one does
//! not block the job forever.
//!
//! ```no_run
//! # async fn run() -> Result<(), jobflow::store::StoreError> {
//! use jobflow_sqlx::PgDocumentStore;
//!
//! let pool = sqlx::PgPool::connect_lazy("postgres://localhost/jobflow").unwrap();
//! let store = PgDocumentStore::new(pool).await?;
//! # let _ = store;
//! # Ok(())
//! # }
//! ```
use std::{ops::Deref, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobflow::store::{
    parent_path, DocumentMutex, DocumentQuery, DocumentStore, IndexKeys, PageToken, QueryResults,
    StoreError,
};
use sqlx::{prelude::FromRow, PgPool};
use tracing::instrument;

mod mutex;
mod query;

use mutex::PgMutex;
use query::ToQuery;

#[derive(Clone, Debug)]
pub struct PgDocumentStore {
    pool: PgPool,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
}

impl Deref for PgDocumentStore {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgDocumentStore {
    fn from(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: Self::DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}

impl From<&PgPool> for PgDocumentStore {
    fn from(value: &PgPool) -> Self {
        value.to_owned().into()
    }
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    path: String,
    date_created: DateTime<Utc>,
    document: serde_json::Value,
}

pub(crate) fn map_err(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Decode(err) => StoreError::Unavailable(format!("Failed to decode row: {err}")),
        error => StoreError::Unavailable(error.to_string()),
    }
}

impl PgDocumentStore {
    /// How long a mutex is held before other holders may take it over.
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Creates the store and runs the migrations.
    pub async fn new(pool: PgPool) -> Result<Self, StoreError> {
        let this = Self::from(pool);
        this.initialize().await?;
        Ok(this)
    }

    pub fn with_lock_timeout(self, lock_timeout: Duration) -> Self {
        Self {
            lock_timeout,
            ..self
        }
    }

    pub fn with_lock_poll_interval(self, lock_poll_interval: Duration) -> Self {
        Self {
            lock_poll_interval,
            ..self
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(self.deref())
            .await
            .map_err(|err| StoreError::Unavailable(format!("Failed to run migrations: {err}")))
    }

    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> Result<Option<serde_json::Value>, StoreError> {
        sqlx::query_scalar("SELECT document FROM jobflow_documents WHERE path = $1")
            .bind(path)
            .fetch_optional(self.deref())
            .await
            .map_err(map_err)
    }

    #[instrument(skip(self, item))]
    async fn put(
        &self,
        path: &str,
        item: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        let keys = IndexKeys::of(&item);
        sqlx::query_scalar(
            r#"INSERT INTO jobflow_documents (
                path,
                parent,
                status,
                date_created,
                document
            ) VALUES ($1, $2, $3, COALESCE($4, 'epoch'::timestamptz), $5)
            ON CONFLICT (path) DO UPDATE SET
                status = EXCLUDED.status,
                date_created = EXCLUDED.date_created,
                document = EXCLUDED.document
            RETURNING document
            "#,
        )
        .bind(path)
        .bind(parent_path(path))
        .bind(keys.status)
        .bind(keys.created)
        .bind(&item)
        .fetch_one(self.deref())
        .await
        .map_err(map_err)
    }

    #[instrument(skip(self))]
    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobflow_documents WHERE path = $1")
            .bind(path)
            .execute(self.deref())
            .await
            .map_err(map_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query(
        &self,
        query: DocumentQuery,
    ) -> Result<QueryResults<serde_json::Value>, StoreError> {
        let mut rows = query
            .query()?
            .build_query_as::<DocumentRow>()
            .fetch_all(self.deref())
            .await
            .map_err(map_err)?;

        let next_page_token = match query.page_size {
            Some(page_size) if rows.len() > page_size => {
                rows.truncate(page_size);
                rows.last()
                    .map(|row| PageToken::new(Some(row.date_created), &row.path))
            }
            _ => None,
        };
        Ok(QueryResults {
            results: rows.into_iter().map(|row| row.document).collect(),
            next_page_token,
        })
    }

    fn create_mutex(&self, name: &str, holder: &str) -> Box<dyn DocumentMutex> {
        Box::new(PgMutex::new(self.clone(), name, holder))
    }
}
