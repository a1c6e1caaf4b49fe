//! Durable facts distilled from chat, kept per identity.
//!
//! Channel facts live under `channel:<id>`, personal memory under `user:<id>`.
//! Everything here is best-effort: a missing or failing backend yields empty
//! context, never an error for the caller.

use crate::message::MessageRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Fewer usable turns than this and extraction is skipped.
const MIN_EXTRACTION_TURNS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMemory {
    pub id: String,
    pub memory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub results: Vec<ExtractedMemory>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactHit {
    pub id: String,
    pub memory: String,
    pub score: f32,
}

#[async_trait]
pub trait FactBackend: Send + Sync {
    /// Extracts and stores facts from `messages` under `identity`.
    async fn add(
        &self,
        messages: Vec<String>,
        identity: &str,
        metadata: Value,
    ) -> anyhow::Result<ExtractionResult>;

    /// Facts under `identity` ranked by relevance to `query`.
    async fn search(&self, query: &str, identity: &str, limit: usize)
        -> anyhow::Result<Vec<FactHit>>;

    async fn get_all(&self, identity: &str, limit: usize) -> anyhow::Result<Vec<FactHit>>;
}

pub fn channel_identity(channel_id: &str) -> String {
    format!("channel:{channel_id}")
}

pub fn user_identity(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub struct FactExtractor {
    backend: Option<Arc<dyn FactBackend>>,
    counters: Mutex<HashMap<String, usize>>,
    threshold: usize,
    window: usize,
}

impl FactExtractor {
    pub fn new(backend: Option<Arc<dyn FactBackend>>, threshold: usize, window: usize) -> Self {
        Self {
            backend,
            counters: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
            window,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, usize::MAX, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Counts a recorded message. Returns true when the channel just crossed the
    /// extraction threshold; the counter is reset in the same step.
    pub fn observe(&self, record: &MessageRecord) -> bool {
        if record.is_bot || self.backend.is_none() {
            return false;
        }
        let Ok(mut counters) = self.counters.lock() else {
            return false;
        };
        let count = counters.entry(record.channel_id.clone()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            *count = 0;
            return true;
        }
        false
    }

    pub fn counter(&self, channel_id: &str) -> usize {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(channel_id).copied())
            .unwrap_or(0)
    }

    pub fn forget_channel(&self, channel_id: &str) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.remove(channel_id);
        }
    }

    /// Submits the last `window` human messages for extraction under the channel identity.
    /// Returns the number of facts stored.
    pub async fn extract(&self, channel_id: &str, recent: &[MessageRecord]) -> anyhow::Result<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };

        let mut turns: Vec<String> = recent
            .iter()
            .filter(|m| !m.is_bot && !m.content.trim().is_empty())
            .map(MessageRecord::attributed)
            .collect();
        if turns.len() > self.window {
            turns.drain(..turns.len() - self.window);
        }
        if turns.len() < MIN_EXTRACTION_TURNS {
            debug!(
                "Facts: only {} usable turns in channel {}, skipping",
                turns.len(),
                channel_id
            );
            return Ok(0);
        }

        let turn_count = turns.len();
        let result = backend
            .add(
                turns,
                &channel_identity(channel_id),
                json!({ "source": "channel", "channel_id": channel_id, "turns": turn_count }),
            )
            .await?;
        if let Some(error) = result.error {
            anyhow::bail!("extraction backend reported: {error}");
        }
        Ok(result.results.len())
    }

    /// Runs `extract` in the background; failures are logged only.
    pub fn spawn_extraction(self: &Arc<Self>, channel_id: String, recent: Vec<MessageRecord>) {
        let extractor = Arc::clone(self);
        tokio::spawn(async move {
            match extractor.extract(&channel_id, &recent).await {
                Ok(0) => {}
                Ok(n) => info!("Facts: extracted {} facts for channel {}", n, channel_id),
                Err(e) => warn!("Facts: extraction failed for channel {}: {}", channel_id, e),
            }
        });
    }

    /// Bulleted channel facts relevant to `query`, or "" when unavailable.
    pub async fn get_facts(&self, channel_id: &str, query: &str, limit: usize) -> String {
        self.bulleted(&channel_identity(channel_id), query, limit)
            .await
    }

    /// Bulleted personal memory for a user, or "" when unavailable.
    pub async fn personal_memory(&self, user_id: &str, query: &str, limit: usize) -> String {
        self.bulleted(&user_identity(user_id), query, limit).await
    }

    async fn bulleted(&self, identity: &str, query: &str, limit: usize) -> String {
        let Some(backend) = &self.backend else {
            return String::new();
        };
        if limit == 0 {
            return String::new();
        }
        let hits = if query.trim().is_empty() {
            backend.get_all(identity, limit).await
        } else {
            backend.search(query, identity, limit).await
        };
        match hits {
            Ok(hits) => hits
                .iter()
                .map(|h| format!("- {}", h.memory))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => {
                warn!("Facts: lookup for {} failed: {}", identity, e);
                String::new()
            }
        }
    }

    /// Feeds a finished exchange to personal memory extraction in the background.
    pub fn remember_exchange(
        self: &Arc<Self>,
        user_id: &str,
        user_name: &str,
        user_message: &str,
        reply: &str,
    ) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        if user_message.trim().chars().count() < 12 {
            return;
        }
        let identity = user_identity(user_id);
        let messages = vec![
            format!("[{user_name}]: {user_message}"),
            format!("[assistant]: {reply}"),
        ];
        tokio::spawn(async move {
            match backend
                .add(messages, &identity, json!({ "source": "chat" }))
                .await
            {
                Ok(result) if !result.results.is_empty() => {
                    debug!("Facts: {} personal facts for {}", result.results.len(), identity)
                }
                Ok(_) => {}
                Err(e) => warn!("Facts: personal extraction failed for {}: {}", identity, e),
            }
        });
    }
}
