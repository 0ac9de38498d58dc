use crate::config::DatabaseConfig;
use crate::error::Error;
use anyhow::Result;
use log::{error, info, warn};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;

pub mod migrations;
pub mod models;
pub mod repositories;

/// Recorders and workers are often started together with Postgres
const CONNECT_ATTEMPTS: u32 = 5;

/// Shared pool for the job queue and event tables
pub struct DatabaseService {
    pub pool: Arc<PgPool>,
}

impl DatabaseService {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Initializing Database service");

        let pool = open_pool(config).await?;
        info!("Connected to PostgreSQL database");

        let service = Self {
            pool: Arc::new(pool),
        };

        if config.auto_migrate {
            service.run_migrations().await?;
        }

        Ok(service)
    }

    /// Connect a worker process from a bare URL
    pub async fn connect(url: &str) -> Result<Self> {
        Self::new(&DatabaseConfig {
            url: url.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub async fn run_migrations(&self) -> Result<()> {
        migrations::run_migrations(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to run migrations: {}", e)))?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Job counts per status, oldest status name first
    pub async fn queue_depth(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM analysis_jobs GROUP BY status ORDER BY status",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to count jobs: {}", e)))?;
        Ok(rows)
    }

    /// Logs the queue depth; false when the database cannot be queried
    pub async fn health_check(&self) -> bool {
        match self.queue_depth().await {
            Ok(depth) => {
                let summary: Vec<String> = depth
                    .iter()
                    .map(|(status, count)| format!("{}={}", status, count))
                    .collect();
                info!("Job queue: [{}]", summary.join(", "));
                true
            }
            Err(e) => {
                error!("Database health check failed: {}", e);
                false
            }
        }
    }
}

async fn open_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let mut attempt = 1;
    loop {
        let result = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await;
        match result {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                let delay = Duration::from_secs(2 * attempt as u64);
                warn!(
                    "Database connection attempt {}/{} failed, retrying in {:?}: {}",
                    attempt, CONNECT_ATTEMPTS, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(
                    Error::Database(format!("Failed to connect to database: {}", e)).into(),
                )
            }
        }
    }
}
