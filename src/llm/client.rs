use super::{Completion, Embedder, Generation, GenerationRequest, Generator, TokenUsage};
use crate::config::Config;
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs,
        CreateEmbeddingRequestArgs, ImageUrlArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct LlmClient {
    chat_client: Client<OpenAIConfig>,
    embedding_client: Client<OpenAIConfig>,
    chat_model: String,
    embedding_model: String,
    chat_timeout: Duration,
    embedding_timeout: Duration,
}

impl LlmClient {
    pub fn new(config: &Config) -> Self {
        let chat_config = OpenAIConfig::new()
            .with_api_base(&config.llama_url)
            .with_api_key(config.llama_api_key.as_deref().unwrap_or("unused"));

        let embedding_config = OpenAIConfig::new()
            .with_api_base(&config.embedding_url)
            .with_api_key(config.embedding_api_key.as_deref().unwrap_or("unused"));

        Self {
            chat_client: Client::with_config(chat_config),
            embedding_client: Client::with_config(embedding_config),
            chat_model: config.llama_model.clone(),
            embedding_model: config.embedding_model.clone(),
            chat_timeout: Duration::from_secs(config.llm_timeout_secs),
            embedding_timeout: Duration::from_secs(config.embedding_timeout_secs),
        }
    }

    async fn chat(&self, messages: Vec<ChatCompletionRequestMessage>) -> anyhow::Result<Generation> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .messages(messages)
            .build()?;

        let response = tokio::time::timeout(self.chat_timeout, self.chat_client.chat().create(request))
            .await
            .map_err(|_| anyhow::anyhow!("LLM request timed out after {:?}", self.chat_timeout))??;

        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_else(|| "No response from LLM".to_string());

        let usage = response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens as u64,
                output_tokens: u.completion_tokens as u64,
            })
            .unwrap_or_default();
        debug!(
            "LLM: {} input / {} output tokens",
            usage.input_tokens, usage.output_tokens
        );

        Ok(Generation {
            text,
            usage,
            artifacts: Vec::new(),
        })
    }

    fn user_message(
        text: String,
        image_url: Option<String>,
    ) -> anyhow::Result<ChatCompletionRequestMessage> {
        let Some(url) = image_url else {
            return Ok(ChatCompletionRequestUserMessageArgs::default()
                .content(text)
                .build()?
                .into());
        };

        let parts = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartTextArgs::default()
                    .text(text)
                    .build()?,
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImageArgs::default()
                    .image_url(ImageUrlArgs::default().url(url).build()?)
                    .build()?,
            ),
        ];
        Ok(ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(parts))
            .build()?
            .into())
    }
}

#[async_trait]
impl Generator for LlmClient {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<Generation> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(request.instructions)
                .build()?
                .into(),
            Self::user_message(request.input, request.image_url)?,
        ];
        self.chat(messages).await
    }
}

#[async_trait]
impl Completion for LlmClient {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> =
            vec![ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()?
                .into()];
        Ok(self.chat(messages).await?.text)
    }
}

#[async_trait]
impl Embedder for LlmClient {
    async fn embed(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.embedding_model)
            .input(texts)
            .build()?;

        let response = tokio::time::timeout(
            self.embedding_timeout,
            self.embedding_client.embeddings().create(request),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Embedding request timed out after {:?}", self.embedding_timeout))??;

        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        if data.len() != expected {
            anyhow::bail!(
                "Embedding count mismatch: sent {} texts, got {} vectors",
                expected,
                data.len()
            );
        }

        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}
