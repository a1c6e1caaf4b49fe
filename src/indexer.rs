use crate::llm::Embedder;
use crate::message::MessageRecord;
use crate::rag::{IndexedPoint, PointPayload, SearchFilter, VectorStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct IndexerSettings {
    pub min_content_chars: usize,
    pub embed_batch_size: usize,
    pub max_pending: usize,
    pub retention: Duration,
}

impl IndexerSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            min_content_chars: config.index_min_content_chars,
            embed_batch_size: config.index_embed_batch_size.max(1),
            max_pending: config.index_max_pending,
            retention: Duration::days(config.index_retention_days),
        }
    }
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            min_content_chars: 10,
            embed_batch_size: 50,
            max_pending: 1000,
            retention: Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub indexed: usize,
    pub filtered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Queues channel messages and writes them to the vector store in batches.
pub struct BatchIndexer {
    pending: Mutex<Vec<MessageRecord>>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    settings: IndexerSettings,
}

impl BatchIndexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            embedder,
            store,
            settings,
        }
    }

    pub fn enqueue(&self, record: MessageRecord) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(record);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn pending_count(&self, channel_id: &str) -> usize {
        self.pending
            .lock()
            .map(|p| p.iter().filter(|m| m.channel_id == channel_id).count())
            .unwrap_or(0)
    }

    fn is_indexable(&self, record: &MessageRecord) -> bool {
        !record.is_bot && record.content.trim().chars().count() >= self.settings.min_content_chars
    }

    /// Takes everything pending and indexes it. Failed batches go back on the queue
    /// unless that would exceed `max_pending`, in which case they are dropped.
    pub async fn flush(&self) -> FlushReport {
        let taken = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return FlushReport::default(),
        };
        if taken.is_empty() {
            return FlushReport::default();
        }

        let total = taken.len();
        let batch: Vec<MessageRecord> = taken.into_iter().filter(|m| self.is_indexable(m)).collect();
        let mut report = FlushReport {
            filtered: total - batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return report;
        }

        match self.index_batch(&batch).await {
            Ok(indexed) => report.indexed = indexed,
            Err(e) => {
                warn!("Indexer: batch of {} failed: {}", batch.len(), e);
                if self.requeue(batch.clone()) {
                    report.requeued = batch.len();
                } else {
                    report.dropped = batch.len();
                }
            }
        }
        report
    }

    fn requeue(&self, batch: Vec<MessageRecord>) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        if pending.len() + batch.len() > self.settings.max_pending {
            warn!(
                "Indexer: pending queue at {} (cap {}), dropping {} messages",
                pending.len(),
                self.settings.max_pending,
                batch.len()
            );
            return false;
        }
        let newer = std::mem::take(&mut *pending);
        pending.extend(batch);
        pending.extend(newer);
        true
    }

    async fn index_batch(&self, batch: &[MessageRecord]) -> anyhow::Result<usize> {
        let mut vectors = Vec::with_capacity(batch.len());
        for chunk in batch.chunks(self.settings.embed_batch_size) {
            let texts: Vec<String> = chunk.iter().map(|m| m.content.clone()).collect();
            let embedded = self.embedder.embed(texts).await?;
            if embedded.len() != chunk.len() {
                anyhow::bail!(
                    "embedder returned {} vectors for {} texts",
                    embedded.len(),
                    chunk.len()
                );
            }
            vectors.extend(embedded);
        }

        let expires_at = Utc::now() + self.settings.retention;
        let points: Vec<IndexedPoint> = batch
            .iter()
            .zip(vectors)
            .map(|(m, vector)| IndexedPoint {
                id: Uuid::new_v4(),
                vector,
                payload: PointPayload {
                    channel_id: m.channel_id.clone(),
                    guild_id: m.guild_id.clone(),
                    message_id: m.id.clone(),
                    author_name: m.author_name.clone(),
                    content: m.content.clone(),
                    timestamp: m.timestamp,
                    expires_at,
                },
            })
            .collect();

        let count = points.len();
        self.store.upsert(points).await?;
        debug!("Indexer: upserted {} points", count);
        Ok(count)
    }

    /// Semantic search within one channel. Hits under `score_threshold` are dropped.
    pub async fn search(
        &self,
        query: &str,
        channel_id: &str,
        limit: usize,
        score_threshold: f32,
    ) -> anyhow::Result<Vec<SearchHit>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let vector = self
            .embedder
            .embed(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No embedding returned"))?;

        let filter = SearchFilter::default()
            .with_channel(channel_id)
            .with_limit(limit)
            .with_score_threshold(score_threshold);
        let hits = self.store.search(vector, filter).await?;

        Ok(hits
            .into_iter()
            .filter(|h| h.score >= score_threshold && h.payload.channel_id == channel_id)
            .map(|h| SearchHit {
                author_name: h.payload.author_name,
                content: h.payload.content,
                timestamp: h.payload.timestamp,
                score: h.score,
            })
            .collect())
    }

    /// Deletes expired points across every channel.
    pub async fn cleanup(&self) -> anyhow::Result<usize> {
        self.store.delete_expired(Utc::now()).await
    }

    pub async fn count(&self, channel_id: &str) -> anyhow::Result<usize> {
        self.store.count(channel_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::mock_message;
    use crate::rag::InMemoryVectorStore;
    use crate::testing::{FailingEmbedder, FakeEmbedder, FlakyStore};

    fn settings() -> IndexerSettings {
        IndexerSettings {
            embed_batch_size: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_flush_skips_bots_and_short_messages() {
        let embedder = Arc::new(FakeEmbedder::new());
        let store = Arc::new(InMemoryVectorStore::new());
        let indexer = BatchIndexer::new(embedder.clone(), store.clone(), settings());

        let mut bot = mock_message(1, "c1", "Bot", "a long enough automated message");
        bot.is_bot = true;
        indexer.enqueue(bot);
        indexer.enqueue(mock_message(2, "c1", "alice", "short"));
        indexer.enqueue(mock_message(3, "c1", "alice", "   padded   "));
        indexer.enqueue(mock_message(4, "c1", "alice", "this one is definitely long enough"));

        let report = indexer.flush().await;
        assert_eq!(report.indexed, 1);
        assert_eq!(report.filtered, 3);

        let embedded = embedder.embedded.lock().unwrap().clone();
        assert_eq!(embedded, vec!["this one is definitely long enough".to_string()]);
        assert_eq!(store.len(), 1);
        assert_eq!(indexer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_flush_embeds_in_sub_batches_with_one_expiry() {
        let embedder = Arc::new(FakeEmbedder::new());
        let store = Arc::new(InMemoryVectorStore::new());
        let indexer = BatchIndexer::new(embedder.clone(), store.clone(), settings());

        for i in 0..10 {
            indexer.enqueue(mock_message(i, "c1", "alice", &format!("message number {i} here")));
        }
        let report = indexer.flush().await;
        assert_eq!(report.indexed, 10);
        // 10 texts in sub-batches of 4
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 3);

        let points = store.snapshot();
        let expiry = points[0].payload.expires_at;
        assert!(points.iter().all(|p| p.payload.expires_at == expiry));
        assert!(expiry > Utc::now() + Duration::days(29));

        let mut ids: Vec<_> = points.iter().map(|p| p.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued_and_not_lost() {
        let embedder = Arc::new(FakeEmbedder::new());
        let store = Arc::new(FlakyStore::new(2));
        let indexer = BatchIndexer::new(embedder, store.clone(), settings());

        for i in 0..5 {
            indexer.enqueue(mock_message(i, "c1", "alice", &format!("persistent message {i}")));
        }

        let first = indexer.flush().await;
        assert_eq!(first.requeued, 5);
        assert_eq!(indexer.pending_len(), 5);

        // A message arriving between attempts is kept too.
        indexer.enqueue(mock_message(99, "c1", "bob", "arrived during the outage"));
        let second = indexer.flush().await;
        assert_eq!(second.requeued, 6);

        let third = indexer.flush().await;
        assert_eq!(third.indexed, 6);
        assert_eq!(indexer.pending_len(), 0);

        let mut ids: Vec<String> = store
            .inner
            .snapshot()
            .into_iter()
            .map(|p| p.payload.message_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4", "99"]);
    }

    #[tokio::test]
    async fn test_requeue_respects_cap() {
        let indexer = BatchIndexer::new(
            Arc::new(FailingEmbedder),
            Arc::new(InMemoryVectorStore::new()),
            IndexerSettings {
                max_pending: 3,
                ..settings()
            },
        );
        for i in 0..4 {
            indexer.enqueue(mock_message(i, "c1", "alice", &format!("overflowing message {i}")));
        }

        let report = indexer.flush().await;
        assert_eq!(report.dropped, 4);
        assert_eq!(report.requeued, 0);
        assert_eq!(indexer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_search_and_cleanup() {
        let embedder = Arc::new(FakeEmbedder::new());
        let store = Arc::new(InMemoryVectorStore::new());
        let indexer = BatchIndexer::new(embedder, store.clone(), settings());

        indexer.enqueue(mock_message(1, "c1", "alice", "the castle was built in 1066"));
        indexer.enqueue(mock_message(2, "c2", "bob", "the castle was built in 1066"));
        indexer.flush().await;

        let hits = indexer
            .search("the castle was built in 1066", "c1", 5, 0.9)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].author_name, "alice");

        assert!(indexer.search("", "c1", 5, 0.0).await.unwrap().is_empty());
        assert_eq!(indexer.count("c2").await.unwrap(), 1);

        // Nothing has expired yet
        assert_eq!(indexer.cleanup().await.unwrap(), 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_count_per_channel() {
        let indexer = BatchIndexer::new(
            Arc::new(FakeEmbedder::new()),
            Arc::new(InMemoryVectorStore::new()),
            settings(),
        );
        indexer.enqueue(mock_message(1, "c1", "alice", "first message here"));
        indexer.enqueue(mock_message(2, "c1", "alice", "second message here"));
        indexer.enqueue(mock_message(3, "c2", "alice", "other channel here"));
        assert_eq!(indexer.pending_count("c1"), 2);
        assert_eq!(indexer.pending_count("c2"), 1);
        assert_eq!(indexer.pending_count("c3"), 0);
    }
}
