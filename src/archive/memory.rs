use super::{ArchiveFilter, ArchiveHit, ArchivePoint, ArchiveStore};
use crate::rag::memory::cosine_similarity;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Process-local archive, used when no Qdrant URL is configured and in tests.
#[derive(Default)]
pub struct InMemoryArchiveStore {
    points: Mutex<HashMap<Uuid, ArchivePoint>>,
}

impl InMemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<Uuid, ArchivePoint>>> {
        self.points
            .lock()
            .map_err(|_| anyhow::anyhow!("archive store mutex poisoned"))
    }
}

#[async_trait]
impl ArchiveStore for InMemoryArchiveStore {
    async fn upsert(&self, points: Vec<ArchivePoint>) -> anyhow::Result<()> {
        let mut store = self.lock()?;
        for point in points {
            store.insert(point.id, point);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        filter: ArchiveFilter,
    ) -> anyhow::Result<Vec<ArchiveHit>> {
        let store = self.lock()?;
        let mut hits: Vec<ArchiveHit> = store
            .values()
            .filter(|p| filter.matches(&p.chunk))
            .map(|p| ArchiveHit {
                chunk: p.chunk.clone(),
                score: cosine_similarity(&vector, &p.vector),
            })
            .filter(|hit| filter.score_threshold.map_or(true, |t| hit.score >= t))
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(filter.limit);
        Ok(hits)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.lock()?.len())
    }
}
