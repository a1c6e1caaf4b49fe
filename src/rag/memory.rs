use super::{IndexedPoint, ScoredPoint, SearchFilter, VectorStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Process-local vector store with exact cosine search.
///
/// Used when no Qdrant URL is configured, and in tests.
#[derive(Default)]
pub struct InMemoryVectorStore {
    points: Mutex<HashMap<Uuid, IndexedPoint>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<IndexedPoint> {
        self.points
            .lock()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<Uuid, IndexedPoint>>> {
        self.points
            .lock()
            .map_err(|_| anyhow::anyhow!("vector store mutex poisoned"))
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, points: Vec<IndexedPoint>) -> anyhow::Result<()> {
        let mut store = self.lock()?;
        for point in points {
            store.insert(point.id, point);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        filter: SearchFilter,
    ) -> anyhow::Result<Vec<ScoredPoint>> {
        let store = self.lock()?;
        let mut hits: Vec<ScoredPoint> = store
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| ScoredPoint {
                payload: p.payload.clone(),
                score: cosine_similarity(&vector, &p.vector),
            })
            .filter(|hit| filter.score_threshold.map_or(true, |t| hit.score >= t))
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(filter.limit);
        Ok(hits)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut store = self.lock()?;
        let before = store.len();
        store.retain(|_, p| p.payload.expires_at >= now);
        Ok(before - store.len())
    }

    async fn count(&self, channel_id: &str) -> anyhow::Result<usize> {
        let store = self.lock()?;
        Ok(store
            .values()
            .filter(|p| p.payload.channel_id == channel_id)
            .count())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::PointPayload;
    use chrono::Duration;

    fn point(channel: &str, vector: Vec<f32>, expires_in: Duration) -> IndexedPoint {
        let now = Utc::now();
        IndexedPoint {
            id: Uuid::new_v4(),
            vector,
            payload: PointPayload {
                channel_id: channel.to_string(),
                guild_id: None,
                message_id: "1".to_string(),
                author_name: "alice".to_string(),
                content: format!("in {channel}"),
                timestamp: now,
                expires_at: now + expires_in,
            },
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_search_is_channel_filtered_and_thresholded() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(vec![
                point("c1", vec![1.0, 0.0, 0.0], Duration::days(1)),
                point("c1", vec![0.0, 1.0, 0.0], Duration::days(1)),
                point("c2", vec![1.0, 0.0, 0.0], Duration::days(1)),
            ])
            .await
            .unwrap();

        let filter = SearchFilter::default()
            .with_channel("c1")
            .with_limit(10)
            .with_score_threshold(0.5);
        let hits = store.search(vec![1.0, 0.1, 0.0], filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.channel_id, "c1");
        assert!(hits[0].score > 0.9);

        assert_eq!(store.count("c1").await.unwrap(), 2);
        assert_eq!(store.count("c2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_expired_across_channels() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(vec![
                point("c1", vec![1.0], Duration::days(-1)),
                point("c2", vec![1.0], Duration::hours(-3)),
                point("c2", vec![1.0], Duration::days(2)),
            ])
            .await
            .unwrap();

        let now = Utc::now();
        let deleted = store.delete_expired(now).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.snapshot().iter().all(|p| p.payload.expires_at >= now));
        assert_eq!(store.len(), 1);
    }
}
