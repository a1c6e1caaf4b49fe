//! Vector storage for the semantic message index.
//!
//! All channels share one collection; every read and delete is filtered on the
//! `channel_id` payload field or on `expires_at`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
pub mod qdrant;

pub use memory::InMemoryVectorStore;
pub use qdrant::QdrantStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub message_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IndexedPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub payload: PointPayload,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub channel_id: Option<String>,
    pub limit: usize,
    pub score_threshold: Option<f32>,
}

impl SearchFilter {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn matches(&self, payload: &PointPayload) -> bool {
        if let Some(channel) = &self.channel_id {
            if &payload.channel_id != channel {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, points: Vec<IndexedPoint>) -> anyhow::Result<()>;

    /// Nearest neighbours of `vector` matching `filter`, best first.
    async fn search(&self, vector: Vec<f32>, filter: SearchFilter)
        -> anyhow::Result<Vec<ScoredPoint>>;

    /// Deletes every point whose `expires_at` is before `now`, across all channels.
    async fn delete_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize>;

    async fn count(&self, channel_id: &str) -> anyhow::Result<usize>;
}
