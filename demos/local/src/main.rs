use std::{str::FromStr, sync::Arc};

use jobflow::prelude::*;
use jobflow_sqlx::PgDocumentStore;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

const DATABASE_URL: &str = "DATABASE_URL";
const PUBLIC_URL: &str = "PUBLIC_URL";
const REGISTRY_URL: &str = "SERVICE_REGISTRY_URL";
const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080";
const DEFAULT_REGISTRY_URL: &str = "http://localhost:8081";

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "jobflow=debug".into()),
        )
        .init();

    // Without a database everything is kept in memory.
    let store: Arc<dyn DocumentStore> = match std::env::var(DATABASE_URL) {
        Ok(db_url) => {
            let pool = PgPoolOptions::new().connect(&db_url).await?;
            Arc::new(PgDocumentStore::new(pool).await?)
        }
        Err(_) => Arc::new(InMemoryStore::new()),
    };
    let public_url = std::env::var(PUBLIC_URL).unwrap_or_else(|_| DEFAULT_PUBLIC_URL.to_owned());
    let registry_url =
        std::env::var(REGISTRY_URL).unwrap_or_else(|_| DEFAULT_REGISTRY_URL.to_owned());

    let orchestrator = Orchestrator::builder(
        store,
        Arc::new(HttpResourceManager::new(registry_url.as_str())),
        OrchestratorConfig::new(public_url),
    )
    .with_job_checker(
        CheckerConfig::new(cron::Schedule::from_str("0 * * * * *")?)
            .with_default_timeout(CheckerConfig::default_timeout_from_env())
            .with_adaptive_throttling(true),
    )
    .with_job_cleanup(
        CleanupConfig::new(cron::Schedule::from_str("0 0 * * * *")?)
            .with_retention_days(CleanupConfig::retention_days_from_env()),
    )
    .start();

    let job = orchestrator
        .api()
        .add_job(
            NewJob::new("TransformJob", format!("{registry_url}/job-profiles/transcode"))
                .add_input("inputFile", "s3://bucket/input.mp4")
                .with_timeout(30),
        )
        .await?;
    println!("Submitted job {}", job.id);

    tokio::signal::ctrl_c().await?;
    orchestrator.graceful_shutdown().await?;
    Ok(())
}
