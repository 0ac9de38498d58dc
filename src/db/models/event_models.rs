use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Near-realtime detection, independent of the job queue
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RealtimeEvent {
    pub id: Uuid,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: String,
    pub title: String,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
