use std::{ops::Deref, time::Duration};

use async_trait::async_trait;
use jobflow::store::{DocumentMutex, StoreError};
use rand::Rng;

use crate::{map_err, PgDocumentStore};

/// A row in `jobflow_mutexes`, taken over by others once it has expired.
pub(crate) struct PgMutex {
    store: PgDocumentStore,
    name: String,
    holder: String,
}

impl PgMutex {
    pub fn new(store: PgDocumentStore, name: &str, holder: &str) -> Self {
        Self {
            store,
            name: name.to_owned(),
            holder: holder.to_owned(),
        }
    }

    fn poll_delay(&self) -> Duration {
        let interval = self.store.lock_poll_interval;
        let max_jitter = u64::try_from(interval.as_millis() / 2).unwrap_or(u64::MAX);
        interval.saturating_add(Duration::from_millis(
            rand::thread_rng().gen_range(0..=max_jitter),
        ))
    }
}

#[async_trait]
impl DocumentMutex for PgMutex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self) -> Result<(), StoreError> {
        while !self.try_lock().await? {
            tokio::time::sleep(self.poll_delay()).await;
        }
        Ok(())
    }

    async fn try_lock(&self) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO jobflow_mutexes (name, holder, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE jobflow_mutexes.expires_at < now()
            "#,
        )
        .bind(&self.name)
        .bind(&self.holder)
        .bind(self.store.lock_timeout.as_secs_f64())
        .execute(self.store.deref())
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobflow_mutexes WHERE name = $1 AND holder = $2")
            .bind(&self.name)
            .bind(&self.holder)
            .execute(self.store.deref())
            .await
            .map_err(map_err)?;
        if result.rows_affected() == 0 {
            tracing::warn!(
                mutex = %self.name,
                holder = %self.holder,
                "Mutex was not held by {} when unlocking, it may have expired",
                self.holder
            );
        }
        Ok(())
    }
}
