//! Fakes for the external collaborators, shared by unit tests.

use crate::llm::{Completion, Embedder, Generation, GenerationRequest, Generator, TokenUsage};
use crate::rag::{IndexedPoint, InMemoryVectorStore, ScoredPoint, SearchFilter, VectorStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Deterministic bag-of-bytes embedding; identical texts embed identically.
pub struct FakeEmbedder {
    pub calls: AtomicUsize,
    pub embedded: Mutex<Vec<String>>,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            embedded: Mutex::new(Vec::new()),
        }
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 16];
        for b in text.to_lowercase().bytes() {
            v[(b as usize) % 16] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.embedded.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding service unavailable")
    }
}

/// Wraps an in-memory store and fails the first `failures` upserts.
pub struct FlakyStore {
    pub inner: InMemoryVectorStore,
    failures: AtomicUsize,
    pub fail_searches: bool,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryVectorStore::new(),
            failures: AtomicUsize::new(failures),
            fail_searches: false,
        }
    }

    pub fn failing_searches() -> Self {
        Self {
            inner: InMemoryVectorStore::new(),
            failures: AtomicUsize::new(0),
            fail_searches: true,
        }
    }
}

#[async_trait]
impl VectorStore for FlakyStore {
    async fn upsert(&self, points: Vec<IndexedPoint>) -> anyhow::Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("vector store unavailable");
        }
        self.inner.upsert(points).await
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        filter: SearchFilter,
    ) -> anyhow::Result<Vec<ScoredPoint>> {
        if self.fail_searches {
            anyhow::bail!("vector store unavailable");
        }
        self.inner.search(vector, filter).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        self.inner.delete_expired(now).await
    }

    async fn count(&self, channel_id: &str) -> anyhow::Result<usize> {
        self.inner.count(channel_id).await
    }
}

/// Echoes the input back and reports fixed usage.
pub struct FakeGenerator {
    pub usage: TokenUsage,
    pub fail: bool,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeGenerator {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0, 0)
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<Generation> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            anyhow::bail!("generation backend unavailable");
        }
        Ok(Generation {
            text: format!("reply to: {}", request.input.lines().last().unwrap_or_default()),
            usage: self.usage,
            artifacts: Vec::new(),
        })
    }
}

/// Returns a canned completion and records prompts.
pub struct FakeCompletion {
    pub response: String,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeCompletion {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Completion for FakeCompletion {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.response.clone())
    }
}
