use super::{ArchiveChunk, ArchiveFilter, ArchiveHit, ArchivePoint, ArchiveStore};
use crate::rag::qdrant::{PayloadIndex, QdrantCollection};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// The archive collection, with keyword indexes on the filterable fields and a
/// full-text index on the chunk text.
pub struct QdrantArchiveStore {
    collection: QdrantCollection,
}

impl QdrantArchiveStore {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        collection: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let collection = QdrantCollection::new(
            base_url,
            api_key,
            collection,
            dimensions,
            timeout,
            archive_indexes(),
        )?;
        Ok(Self { collection })
    }
}

fn archive_indexes() -> Vec<PayloadIndex> {
    vec![
        PayloadIndex::typed("year", "integer"),
        PayloadIndex::keyword("decade"),
        PayloadIndex::keyword("channel"),
        PayloadIndex::keyword("network"),
        PayloadIndex::keyword("participants"),
        PayloadIndex {
            field: "text",
            schema: json!({
                "type": "text",
                "tokenizer": "word",
                "min_token_len": 2,
                "max_token_len": 20,
                "lowercase": true,
            }),
        },
    ]
}

fn build_filter(filter: &ArchiveFilter) -> Value {
    let mut must = Vec::new();
    if let Some(year) = filter.year {
        must.push(json!({ "key": "year", "match": { "value": year } }));
    }
    if let Some(channel) = &filter.channel {
        must.push(json!({ "key": "channel", "match": { "value": channel } }));
    }
    if !filter.participants.is_empty() {
        must.push(json!({ "key": "participants", "match": { "any": filter.participants } }));
    }
    if let Some(keyword) = &filter.keyword {
        must.push(json!({ "key": "text", "match": { "text": keyword } }));
    }
    json!({ "must": must })
}

#[async_trait]
impl ArchiveStore for QdrantArchiveStore {
    async fn upsert(&self, points: Vec<ArchivePoint>) -> anyhow::Result<()> {
        let body: Vec<Value> = points
            .into_iter()
            .map(|p| {
                json!({
                    "id": p.id.to_string(),
                    "vector": p.vector,
                    "payload": p.chunk,
                })
            })
            .collect();
        self.collection.upsert(body).await
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        filter: ArchiveFilter,
    ) -> anyhow::Result<Vec<ArchiveHit>> {
        let mut body = json!({
            "vector": vector,
            "limit": filter.limit,
            "with_payload": true,
            "filter": build_filter(&filter),
        });
        if let Some(threshold) = filter.score_threshold {
            body["score_threshold"] = json!(threshold);
        }

        let hits = self.collection.search::<ArchiveChunk>(body).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                hit.payload.map(|chunk| ArchiveHit {
                    chunk,
                    score: hit.score,
                })
            })
            .collect())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        self.collection.count(json!({ "must": [] })).await
    }
}
