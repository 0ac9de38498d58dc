use crate::db::models::RealtimeEvent;
use crate::error::Error;
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;

/// Destination of realtime detections. Writes are fire-and-forget from the detector's view.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &RealtimeEvent) -> Result<(), Error>;
}

/// Realtime events repository
#[derive(Clone)]
pub struct PgEventsRepository {
    pool: Arc<PgPool>,
}

impl PgEventsRepository {
    /// Create a new events repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for PgEventsRepository {
    async fn record(&self, event: &RealtimeEvent) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO realtime_events (
                id, camera_id, timestamp, event_type, severity, title, description, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(&event.camera_id)
        .bind(event.timestamp)
        .bind(&event.event_type)
        .bind(&event.severity)
        .bind(&event.title)
        .bind(&event.description)
        .bind(&event.metadata)
        .bind(event.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create event: {}", e)))?;

        Ok(())
    }
}
