//! Typed access to jobs and job executions on top of a [`DocumentStore`].
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OnceCell;

use crate::{
    job::{query::JobQuery, Job, JobExecution, JobId, JobStatus, NewJob},
    store::{
        DocumentMutex, DocumentQuery, DocumentStore, PageToken, QueryResults, SortOrder,
        StoreError,
    },
};

/// Owns the construction of ids and store paths and the bookkeeping of timestamps.
///
/// The backing store is initialized lazily on first use.
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn DocumentStore>,
    public_url: Arc<str>,
    initialized: Arc<OnceCell<()>>,
}

impl JobRepository {
    pub fn new(store: Arc<dyn DocumentStore>, public_url: &str) -> Self {
        Self {
            store,
            public_url: public_url.trim_end_matches('/').into(),
            initialized: Default::default(),
        }
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    async fn store(&self) -> Result<&dyn DocumentStore, StoreError> {
        self.initialized
            .get_or_try_init(|| self.store.initialize())
            .await?;
        Ok(self.store.as_ref())
    }

    async fn get_document<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, StoreError> {
        self.store()
            .await?
            .get(path)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    async fn put_document<T: serde::Serialize + serde::de::DeserializeOwned>(
        &self,
        path: &str,
        item: &T,
    ) -> Result<T, StoreError> {
        let stored = self
            .store()
            .await?
            .put(path, serde_json::to_value(item)?)
            .await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn add_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let id = JobId::from(format!("{}/jobs/{}", self.public_url, uuid::Uuid::new_v4()));
        let job = job.into_job(id, Utc::now());
        let job = self.put_document(self.path(job.id.as_str()), &job).await?;
        tracing::debug!(job_id = %job.id, "Stored new job");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        self.get_document(self.path(job_id.as_str())).await
    }

    pub async fn update_job(&self, job: &Job) -> Result<Job, StoreError> {
        let job = Job {
            date_modified: Utc::now(),
            ..job.clone()
        };
        self.put_document(self.path(job.id.as_str()), &job).await
    }

    pub async fn delete_job(&self, job_id: &JobId) -> Result<(), StoreError> {
        self.store().await?.delete(self.path(job_id.as_str())).await
    }

    pub async fn query_jobs(
        &self,
        query: &JobQuery,
        page_token: Option<PageToken>,
    ) -> Result<QueryResults<Job>, StoreError> {
        self.query("/jobs", query, page_token).await
    }

    /// Stores a new execution numbered one past the executions the job already has.
    ///
    /// Only safe while holding the job's mutex.
    pub async fn add_execution(
        &self,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<JobExecution, StoreError> {
        let existing = self
            .store()
            .await?
            .query(DocumentQuery::new(self.executions_path(job_id)))
            .await?
            .results
            .len();
        let execution = JobExecution::new(
            format!("{job_id}/executions/{}", existing + 1),
            status,
            Utc::now(),
        );
        self.put_document(self.path(&execution.id), &execution)
            .await
    }

    pub async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<JobExecution>, StoreError> {
        self.get_document(self.path(execution_id)).await
    }

    /// All executions of the job, the current one first.
    pub async fn get_executions(&self, job_id: &JobId) -> Result<Vec<JobExecution>, StoreError> {
        let mut executions = self
            .store()
            .await?
            .query(DocumentQuery::new(self.executions_path(job_id)).sorted(SortOrder::Descending))
            .await?
            .decode::<JobExecution>()?
            .results;
        // Executions created within the same instant must still come out by number.
        executions.sort_by_key(|execution| std::cmp::Reverse(execution.number()));
        Ok(executions)
    }

    pub async fn get_latest_execution(
        &self,
        job_id: &JobId,
    ) -> Result<Option<JobExecution>, StoreError> {
        Ok(self.get_executions(job_id).await?.into_iter().next())
    }

    pub async fn update_execution(
        &self,
        execution: &JobExecution,
    ) -> Result<JobExecution, StoreError> {
        let execution = JobExecution {
            date_modified: Utc::now(),
            ..execution.clone()
        };
        self.put_document(self.path(&execution.id), &execution)
            .await
    }

    pub async fn delete_execution(&self, execution_id: &str) -> Result<(), StoreError> {
        self.store()
            .await?
            .delete(self.path(execution_id))
            .await
    }

    pub async fn query_executions(
        &self,
        job_id: &JobId,
        query: &JobQuery,
        page_token: Option<PageToken>,
    ) -> Result<QueryResults<JobExecution>, StoreError> {
        self.query(&self.executions_path(job_id), query, page_token)
            .await
    }

    pub fn create_mutex(&self, name: &str, holder: &str) -> Box<dyn DocumentMutex> {
        self.store.create_mutex(name, holder)
    }

    async fn query<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &JobQuery,
        page_token: Option<PageToken>,
    ) -> Result<QueryResults<T>, StoreError> {
        self.store()
            .await?
            .query(
                DocumentQuery::new(path)
                    .with_filter(query.filter())
                    .sorted(query.sort_order)
                    .with_page_size(query.page_size)
                    .starting_at(page_token),
            )
            .await?
            .decode()
    }

    /// The store path of a job or execution id, i.e. the id without the public url.
    fn path<'a>(&self, id: &'a str) -> &'a str {
        id.strip_prefix(&*self.public_url)
            .filter(|path| path.starts_with("/jobs/"))
            .unwrap_or(id)
    }

    fn executions_path(&self, job_id: &JobId) -> String {
        format!("{}/executions", self.path(job_id.as_str()))
    }
}
