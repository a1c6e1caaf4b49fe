//! Tiered channel context.
//!
//! Tracked channels feed three tiers: a ring buffer of recent messages, the batch
//! indexer for semantic recall, and the fact extractor. Writes fan out to all three
//! and never fail from the caller's side; reads merge whatever tiers answer.

use crate::cache::RingBuffer;
use crate::config::Config;
use crate::db::Database;
use crate::facts::FactExtractor;
use crate::indexer::{BatchIndexer, SearchHit};
use crate::message::MessageRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const RELATED_MESSAGES_HEADER: &str =
    "Related earlier messages (retrieved by similarity, not part of the current conversation):";

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub buffer_capacity: usize,
    pub recent_messages: usize,
    pub semantic_limit: usize,
    pub score_threshold: f32,
    pub facts_limit: usize,
    pub flush_interval: Duration,
    pub cleanup_interval: Duration,
    pub activity_sync_interval: Duration,
}

impl ContextSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buffer_capacity: config.ring_buffer_capacity,
            recent_messages: config.recent_context_messages,
            semantic_limit: config.semantic_search_limit,
            score_threshold: config.semantic_score_threshold,
            facts_limit: config.channel_facts_limit,
            flush_interval: Duration::from_secs(config.index_flush_interval_secs.max(1)),
            cleanup_interval: Duration::from_secs(config.index_cleanup_interval_secs.max(1)),
            activity_sync_interval: Duration::from_secs(config.activity_sync_interval_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    pub buffer_count: usize,
    /// Live count from the vector store; `None` when the store could not be reached.
    pub indexed_count: Option<usize>,
    pub pending_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

struct ChannelState {
    buffer: RingBuffer<MessageRecord>,
    last_activity: Option<DateTime<Utc>>,
    activity_dirty: bool,
}

struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct ChannelContextEngine {
    channels: Mutex<HashMap<String, ChannelState>>,
    indexer: Arc<BatchIndexer>,
    facts: Arc<FactExtractor>,
    db: Database,
    settings: ContextSettings,
    workers: Mutex<Option<Workers>>,
}

impl ChannelContextEngine {
    pub fn new(
        db: Database,
        indexer: Arc<BatchIndexer>,
        facts: Arc<FactExtractor>,
        settings: ContextSettings,
    ) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            indexer,
            facts,
            db,
            settings,
            workers: Mutex::new(None),
        }
    }

    pub fn facts(&self) -> &Arc<FactExtractor> {
        &self.facts
    }

    pub fn indexer(&self) -> &Arc<BatchIndexer> {
        &self.indexer
    }

    /// Starts tracking a channel. Enabling a tracked channel keeps its buffer.
    pub async fn enable_channel(
        &self,
        guild_id: Option<&str>,
        channel_id: &str,
    ) -> anyhow::Result<()> {
        let (guild, channel) = (guild_id.map(str::to_string), channel_id.to_string());
        self.db
            .run_blocking(move |db| db.set_channel_enabled(guild.as_deref(), &channel, true))
            .await?;

        let mut channels = self.lock_channels()?;
        if !channels.contains_key(channel_id) {
            channels.insert(channel_id.to_string(), self.fresh_state(None));
            info!("Context: tracking enabled for channel {}", channel_id);
        }
        Ok(())
    }

    /// Stops tracking a channel and drops its buffer. Indexed points and stored
    /// facts are left to expire on their own.
    pub async fn disable_channel(&self, channel_id: &str) -> anyhow::Result<bool> {
        let channel = channel_id.to_string();
        self.db
            .run_blocking(move |db| db.set_channel_enabled(None, &channel, false))
            .await?;

        let removed = self.lock_channels()?.remove(channel_id).is_some();
        self.facts.forget_channel(channel_id);
        if removed {
            info!("Context: tracking disabled for channel {}", channel_id);
        }
        Ok(removed)
    }

    pub fn is_channel_tracked(&self, channel_id: &str) -> bool {
        self.channels
            .lock()
            .map(|c| c.contains_key(channel_id))
            .unwrap_or(false)
    }

    pub fn tracked_channels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Records a message into every tier. Untracked channels are ignored.
    pub fn record_message(&self, record: MessageRecord) {
        let extraction = {
            let Ok(mut channels) = self.channels.lock() else {
                return;
            };
            let Some(state) = channels.get_mut(&record.channel_id) else {
                return;
            };
            state.buffer.push(record.clone());
            state.last_activity = Some(record.timestamp);
            state.activity_dirty = true;

            // Bot replies are dropped before windowing, so the whole buffer is handed over.
            if self.facts.observe(&record) {
                Some(state.buffer.get_recent(state.buffer.len()))
            } else {
                None
            }
        };

        let channel_id = record.channel_id.clone();
        self.indexer.enqueue(record);
        if let Some(recent) = extraction {
            debug!("Context: fact extraction triggered for channel {}", channel_id);
            self.facts.spawn_extraction(channel_id, recent);
        }
    }

    /// Recent messages, semantic matches and channel facts, in that order. Returns ""
    /// for untracked channels; a failing tier is left out.
    pub async fn build_hybrid_context(&self, channel_id: &str, current_message: &str) -> String {
        let recent = {
            let Ok(channels) = self.channels.lock() else {
                return String::new();
            };
            let Some(state) = channels.get(channel_id) else {
                return String::new();
            };
            state.buffer.get_recent(self.settings.recent_messages)
        };

        let (hits, facts) = tokio::join!(
            self.indexer.search(
                current_message,
                channel_id,
                self.settings.semantic_limit,
                self.settings.score_threshold,
            ),
            self.facts
                .get_facts(channel_id, current_message, self.settings.facts_limit),
        );

        let mut sections = Vec::new();
        let recent: Vec<String> = recent
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(MessageRecord::attributed)
            .collect();
        if !recent.is_empty() {
            sections.push(format!("Recent messages in this channel:\n{}", recent.join("\n")));
        }

        match hits {
            Ok(hits) if !hits.is_empty() => {
                sections.push(format!("{RELATED_MESSAGES_HEADER}\n{}", format_hits(&hits)))
            }
            Ok(_) => {}
            Err(e) => warn!("Context: semantic search failed for channel {}: {}", channel_id, e),
        }

        if !facts.is_empty() {
            sections.push(format!("Known facts about this channel:\n{facts}"));
        }

        sections.join("\n\n")
    }

    /// `None` when the channel is not tracked.
    pub async fn get_channel_stats(&self, channel_id: &str) -> Option<ChannelStats> {
        let (buffer_count, last_activity) = {
            let channels = self.channels.lock().ok()?;
            let state = channels.get(channel_id)?;
            (state.buffer.len(), state.last_activity)
        };

        let indexed_count = match self.indexer.count(channel_id).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("Context: point count failed for channel {}: {}", channel_id, e);
                None
            }
        };

        Some(ChannelStats {
            buffer_count,
            indexed_count,
            pending_count: self.indexer.pending_count(channel_id),
            last_activity,
        })
    }

    /// Loads tracked channels and starts the flush, cleanup and activity-sync tasks.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let tracked = self
            .db
            .run_blocking(|db| db.list_tracked_channels())
            .await?;
        {
            let mut channels = self.lock_channels()?;
            for record in &tracked {
                channels
                    .entry(record.channel_id.clone())
                    .or_insert_with(|| self.fresh_state(record.last_activity));
            }
        }
        info!("Context: {} tracked channels loaded", tracked.len());

        let (shutdown, rx) = watch::channel(false);
        let flush = {
            let engine = Arc::clone(self);
            spawn_periodic("flush", self.settings.flush_interval, rx.clone(), move || {
                let engine = Arc::clone(&engine);
                async move { engine.flush_once().await }
            })
        };
        let cleanup = {
            let engine = Arc::clone(self);
            spawn_periodic("cleanup", self.settings.cleanup_interval, rx.clone(), move || {
                let engine = Arc::clone(&engine);
                async move { engine.cleanup_once().await }
            })
        };
        let activity = {
            let engine = Arc::clone(self);
            spawn_periodic(
                "activity-sync",
                self.settings.activity_sync_interval,
                rx,
                move || {
                    let engine = Arc::clone(&engine);
                    async move { engine.sync_activity().await }
                },
            )
        };

        let previous = self.lock_workers()?.replace(Workers {
            shutdown,
            handles: vec![flush, cleanup, activity],
        });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
        }
        Ok(())
    }

    /// Stops the background tasks, then drains the indexer and persists activity.
    pub async fn stop(&self) {
        let workers = self.lock_workers().ok().and_then(|mut w| w.take());
        if let Some(workers) = workers {
            let _ = workers.shutdown.send(true);
            for handle in workers.handles {
                if let Err(e) = handle.await {
                    warn!("Context: background task ended abnormally: {}", e);
                }
            }
        }

        self.flush_once().await;
        self.sync_activity().await;
        info!("Context: engine stopped");
    }

    pub async fn flush_once(&self) {
        let report = self.indexer.flush().await;
        if report.indexed + report.requeued + report.dropped > 0 {
            info!(
                "Context: flush indexed {}, filtered {}, requeued {}, dropped {}",
                report.indexed, report.filtered, report.requeued, report.dropped
            );
        }
    }

    pub async fn cleanup_once(&self) {
        match self.indexer.cleanup().await {
            Ok(0) => debug!("Context: no expired points"),
            Ok(n) => info!("Context: deleted {} expired points", n),
            Err(e) => warn!("Context: expiry sweep failed: {}", e),
        }
    }

    /// Persists last-activity timestamps changed since the previous sync.
    pub async fn sync_activity(&self) {
        let dirty: Vec<(String, DateTime<Utc>)> = match self.channels.lock() {
            Ok(mut channels) => channels
                .iter_mut()
                .filter(|(_, s)| s.activity_dirty)
                .filter_map(|(id, s)| {
                    s.activity_dirty = false;
                    s.last_activity.map(|ts| (id.clone(), ts))
                })
                .collect(),
            Err(_) => return,
        };
        if dirty.is_empty() {
            return;
        }

        let count = dirty.len();
        let result = self
            .db
            .run_blocking(move |db| {
                for (channel_id, ts) in &dirty {
                    db.touch_channel_activity(channel_id, *ts)?;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => debug!("Context: persisted activity for {} channels", count),
            Err(e) => warn!("Context: activity sync failed: {}", e),
        }
    }

    fn fresh_state(&self, last_activity: Option<DateTime<Utc>>) -> ChannelState {
        ChannelState {
            buffer: RingBuffer::new(self.settings.buffer_capacity),
            last_activity,
            activity_dirty: false,
        }
    }

    fn lock_channels(
        &self,
    ) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<String, ChannelState>>> {
        self.channels
            .lock()
            .map_err(|_| anyhow::anyhow!("channel map mutex poisoned"))
    }

    fn lock_workers(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Option<Workers>>> {
        self.workers
            .lock()
            .map_err(|_| anyhow::anyhow!("worker handle mutex poisoned"))
    }
}

fn format_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|h| {
            format!(
                "- [{} on {}]: {}",
                h.author_name,
                h.timestamp.format("%Y-%m-%d"),
                h.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!("Context: {} task every {}", name, humantime::format_duration(period));
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Context: {} task stopped", name);
    })
}
