pub mod client;

pub use client::LlmClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub instructions: String,
    pub input: String,
    /// Image attached to the current turn, passed through untouched.
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Something produced alongside the reply text (an image, a file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    pub artifacts: Vec<Artifact>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<Generation>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait Completion: Send + Sync {
    /// Single-prompt completion used for fact extraction.
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}
