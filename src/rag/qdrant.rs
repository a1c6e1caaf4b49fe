use super::{IndexedPoint, PointPayload, ScoredPoint, SearchFilter, VectorStore};
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Payload index created alongside a collection.
#[derive(Debug, Clone)]
pub(crate) struct PayloadIndex {
    pub field: &'static str,
    pub schema: Value,
}

impl PayloadIndex {
    pub fn keyword(field: &'static str) -> Self {
        Self {
            field,
            schema: json!("keyword"),
        }
    }

    pub fn typed(field: &'static str, schema: &'static str) -> Self {
        Self {
            field,
            schema: json!(schema),
        }
    }
}

/// One Qdrant collection accessed over the REST API; created with its payload
/// indexes on first use.
pub(crate) struct QdrantCollection {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    name: String,
    dimensions: usize,
    indexes: Vec<PayloadIndex>,
    ready: OnceCell<()>,
}

#[derive(Deserialize)]
pub(crate) struct QdrantResponse<T> {
    pub result: T,
}

#[derive(Deserialize)]
pub(crate) struct QdrantHit<P> {
    pub score: f32,
    pub payload: Option<P>,
}

#[derive(Deserialize)]
pub(crate) struct QdrantCount {
    pub count: usize,
}

impl QdrantCollection {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        name: &str,
        dimensions: usize,
        timeout: Duration,
        indexes: Vec<PayloadIndex>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Qdrant HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            name: name.to_string(),
            dimensions,
            indexes,
            ready: OnceCell::new(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.name, path)
    }

    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    pub async fn send(&self, builder: reqwest::RequestBuilder) -> anyhow::Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Qdrant request failed ({}): {}", status, body);
        }
        Ok(response)
    }

    /// Creates the collection and its payload indexes on first use.
    pub async fn ensure(&self) -> anyhow::Result<()> {
        self.ready
            .get_or_try_init(|| async {
                let existing = self
                    .request(reqwest::Method::GET, "")
                    .send()
                    .await
                    .context("Qdrant unreachable")?;
                if existing.status().is_success() {
                    return Ok(());
                }

                info!(
                    "Qdrant: creating collection '{}' ({} dims)",
                    self.name, self.dimensions
                );
                self.send(self.request(reqwest::Method::PUT, "").json(&json!({
                    "vectors": { "size": self.dimensions, "distance": "Cosine" }
                })))
                .await?;

                for index in &self.indexes {
                    self.send(
                        self.request(reqwest::Method::PUT, "/index?wait=true").json(&json!({
                            "field_name": index.field,
                            "field_schema": index.schema,
                        })),
                    )
                    .await?;
                }
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    pub async fn upsert(&self, points: Vec<Value>) -> anyhow::Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        self.ensure().await?;
        let count = points.len();
        self.send(
            self.request(reqwest::Method::PUT, "/points?wait=true")
                .json(&json!({ "points": points })),
        )
        .await?;
        debug!("Qdrant: upserted {} points into '{}'", count, self.name);
        Ok(())
    }

    pub async fn search<P: DeserializeOwned>(&self, body: Value) -> anyhow::Result<Vec<QdrantHit<P>>> {
        self.ensure().await?;
        let response: QdrantResponse<Vec<QdrantHit<P>>> = self
            .send(self.request(reqwest::Method::POST, "/points/search").json(&body))
            .await?
            .json()
            .await?;
        Ok(response.result)
    }

    pub async fn count(&self, filter: Value) -> anyhow::Result<usize> {
        self.ensure().await?;
        let counted: QdrantResponse<QdrantCount> = self
            .send(
                self.request(reqwest::Method::POST, "/points/count")
                    .json(&json!({ "filter": filter, "exact": true })),
            )
            .await?
            .json()
            .await?;
        Ok(counted.result.count)
    }
}

/// The channel message index.
pub struct QdrantStore {
    collection: QdrantCollection,
}

impl QdrantStore {
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
            vec![
                PayloadIndex::keyword("channel_id"),
                PayloadIndex::typed("expires_at", "datetime"),
            ],
        )?;
        Ok(Self { collection })
    }
}

pub(crate) fn build_filter(filter: &SearchFilter) -> Value {
    let mut must = Vec::new();
    if let Some(channel) = &filter.channel_id {
        must.push(json!({ "key": "channel_id", "match": { "value": channel } }));
    }
    json!({ "must": must })
}

fn expired_filter(now: DateTime<Utc>) -> Value {
    json!({ "must": [{ "key": "expires_at", "range": { "lt": now.to_rfc3339() } }] })
}

fn channel_filter(channel_id: &str) -> Value {
    json!({ "must": [{ "key": "channel_id", "match": { "value": channel_id } }] })
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, points: Vec<IndexedPoint>) -> anyhow::Result<()> {
        let body: Vec<Value> = points
            .into_iter()
            .map(|p| {
                json!({
                    "id": p.id.to_string(),
                    "vector": p.vector,
                    "payload": p.payload,
                })
            })
            .collect();
        self.collection.upsert(body).await
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        filter: SearchFilter,
    ) -> anyhow::Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": filter.limit,
            "with_payload": true,
            "filter": build_filter(&filter),
        });
        if let Some(threshold) = filter.score_threshold {
            body["score_threshold"] = json!(threshold);
        }

        let hits = self.collection.search::<PointPayload>(body).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                hit.payload.map(|payload| ScoredPoint {
                    payload,
                    score: hit.score,
                })
            })
            .collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let expired = self.collection.count(expired_filter(now)).await?;
        if expired == 0 {
            return Ok(0);
        }

        self.collection
            .send(
                self.collection
                    .request(reqwest::Method::POST, "/points/delete?wait=true")
                    .json(&json!({ "filter": expired_filter(now) })),
            )
            .await?;
        Ok(expired)
    }

    async fn count(&self, channel_id: &str) -> anyhow::Result<usize> {
        self.collection.count(channel_filter(channel_id)).await
    }
}
