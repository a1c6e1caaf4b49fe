//! The chat service behind the slash commands.
//!
//! Every public operation returns an outcome value; refusals and upstream failures
//! are reported through `success`, `reason` and `error` rather than propagated.

use crate::config::Config;
use crate::context::ChannelContextEngine;
use crate::conversation::{
    ConversationManager, ConversationState, ConversationStatus, Exchange, ReasonCode, Refusal,
    TurnError,
};
use crate::db::ConversationRecord;
use crate::llm::{Artifact, GenerationRequest, Generator};
use crate::persona::{Persona, PersonaRegistry};
use crate::system_prompt::{self, PromptParts};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ChatUser {
    pub id: String,
    pub name: String,
}

/// One chat turn as received from the transport.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub persona_id: &'a str,
    pub message: &'a str,
    pub user: &'a ChatUser,
    pub channel_id: Option<&'a str>,
    pub guild_id: Option<&'a str>,
    pub image_url: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub channel_id: String,
    pub persona_id: String,
    pub message_count: u32,
    pub total_tokens: u64,
    pub status: ConversationStatus,
    pub last_activity: DateTime<Utc>,
}

impl From<&ConversationRecord> for ConversationSummary {
    fn from(record: &ConversationRecord) -> Self {
        Self {
            channel_id: record.channel_id.clone(),
            persona_id: record.persona_id.clone(),
            message_count: record.message_count,
            total_tokens: record.total_tokens,
            status: record.status,
            last_activity: record.last_activity,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub tokens: Option<u64>,
    pub conversation: Option<ConversationSummary>,
    pub error: Option<String>,
    pub reason: Option<ReasonCode>,
    pub artifacts: Vec<Artifact>,
}

impl ChatOutcome {
    fn refused(refusal: Refusal) -> Self {
        Self {
            reason: Some(refusal.reason()),
            error: Some(refusal.to_string()),
            ..Default::default()
        }
    }

    fn failed(reason: ReasonCode, error: &str) -> Self {
        Self {
            reason: Some(reason),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdminOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub reason: Option<ReasonCode>,
}

impl AdminOutcome {
    fn ok(message: String) -> Self {
        Self {
            success: true,
            message: Some(message),
            ..Default::default()
        }
    }

    fn refused(refusal: Refusal) -> Self {
        Self {
            reason: Some(refusal.reason()),
            error: Some(refusal.to_string()),
            ..Default::default()
        }
    }

    fn storage_failed() -> Self {
        Self {
            reason: Some(ReasonCode::StorageFailed),
            error: Some(STORAGE_FAILED.to_string()),
            ..Default::default()
        }
    }
}

/// Result of `conversation_status`. `state` is set whenever the lookup succeeded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusOutcome {
    pub success: bool,
    pub state: Option<ConversationState>,
    pub conversation: Option<ConversationSummary>,
    pub error: Option<String>,
    pub reason: Option<ReasonCode>,
}

impl StatusOutcome {
    fn refused(refusal: Refusal) -> Self {
        Self {
            reason: Some(refusal.reason()),
            error: Some(refusal.to_string()),
            ..Default::default()
        }
    }

    fn storage_failed() -> Self {
        Self {
            reason: Some(ReasonCode::StorageFailed),
            error: Some(STATUS_UNAVAILABLE.to_string()),
            ..Default::default()
        }
    }
}

const GENERATION_FAILED: &str = "I couldn't come up with a reply just now. Please try `/chat` again in a moment.";
const STORAGE_FAILED: &str = "I couldn't save this conversation. Please try again in a moment.";
const STATUS_UNAVAILABLE: &str = "I couldn't look up this conversation. Please try again in a moment.";

#[derive(Debug, Clone, Copy)]
pub struct AssistantSettings {
    pub history_turns: usize,
    pub personal_memory_limit: usize,
}

impl AssistantSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            history_turns: config.conversation_history_turns,
            personal_memory_limit: config.personal_memory_limit,
        }
    }
}

pub struct Assistant {
    personas: PersonaRegistry,
    conversations: ConversationManager,
    engine: Arc<ChannelContextEngine>,
    generator: Arc<dyn Generator>,
    settings: AssistantSettings,
}

/// Channel a turn is keyed on; direct messages get a per-user pseudo channel.
pub fn resolve_channel(channel_id: Option<&str>, user_id: &str) -> String {
    match channel_id {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => format!("dm:{user_id}"),
    }
}

impl Assistant {
    pub fn new(
        personas: PersonaRegistry,
        conversations: ConversationManager,
        engine: Arc<ChannelContextEngine>,
        generator: Arc<dyn Generator>,
        settings: AssistantSettings,
    ) -> Self {
        Self {
            personas,
            conversations,
            engine,
            generator,
            settings,
        }
    }

    pub fn personas(&self) -> &PersonaRegistry {
        &self.personas
    }

    pub fn engine(&self) -> &Arc<ChannelContextEngine> {
        &self.engine
    }

    pub async fn chat(&self, request: ChatRequest<'_>) -> ChatOutcome {
        let persona = match self.persona(request.persona_id) {
            Ok(p) => p,
            Err(refusal) => return ChatOutcome::refused(refusal),
        };
        let channel_id = resolve_channel(request.channel_id, &request.user.id);
        let now = Utc::now();

        match self
            .conversations
            .begin_chat(&channel_id, persona.id(), now)
            .await
        {
            Ok(record) => self.run_turn(persona, &channel_id, record, &request, now).await,
            Err(e) => turn_failure(e, &channel_id, persona.id()),
        }
    }

    /// Reactivates an expired conversation and runs the turn against it.
    pub async fn resume_chat(&self, request: ChatRequest<'_>) -> ChatOutcome {
        let persona = match self.persona(request.persona_id) {
            Ok(p) => p,
            Err(refusal) => return ChatOutcome::refused(refusal),
        };
        let channel_id = resolve_channel(request.channel_id, &request.user.id);
        let now = Utc::now();

        match self
            .conversations
            .begin_resume(&channel_id, persona.id(), now)
            .await
        {
            Ok(record) => self.run_turn(persona, &channel_id, record, &request, now).await,
            Err(e) => turn_failure(e, &channel_id, persona.id()),
        }
    }

    pub async fn reset_conversation(&self, channel_id: &str, persona_id: &str) -> AdminOutcome {
        let persona = match self.persona(persona_id) {
            Ok(p) => p,
            Err(refusal) => return AdminOutcome::refused(refusal),
        };
        match self.conversations.reset(channel_id, persona.id()).await {
            Ok(true) => AdminOutcome::ok(format!(
                "Conversation with {} was reset. Use `/chat` to start a new one.",
                persona.name()
            )),
            Ok(false) => AdminOutcome::refused(Refusal::NotFound),
            Err(e) => {
                error!("Reset of {}/{} failed: {}", channel_id, persona_id, e);
                AdminOutcome::storage_failed()
            }
        }
    }

    /// Expires an active conversation so it can only continue through `/resume`.
    pub async fn expire_conversation(&self, channel_id: &str, persona_id: &str) -> AdminOutcome {
        let persona = match self.persona(persona_id) {
            Ok(p) => p,
            Err(refusal) => return AdminOutcome::refused(refusal),
        };
        let existing = match self.conversations.get(channel_id, persona.id()).await {
            Ok(r) => r,
            Err(e) => {
                error!("Lookup of {}/{} failed: {}", channel_id, persona_id, e);
                return AdminOutcome::storage_failed();
            }
        };
        match existing.map(|r| r.status) {
            None => return AdminOutcome::refused(Refusal::NotFound),
            Some(ConversationStatus::Expired) => return AdminOutcome::refused(Refusal::Expired),
            Some(ConversationStatus::Reset) => return AdminOutcome::refused(Refusal::Reset),
            Some(ConversationStatus::Active) => {}
        }

        match self.conversations.expire(channel_id, persona.id()).await {
            Ok(true) => {
                info!("Conversation {}/{} expired by operator", channel_id, persona_id);
                AdminOutcome::ok(format!(
                    "Conversation with {} expired. Use `/resume` to pick it up again.",
                    persona.name()
                ))
            }
            Ok(false) => AdminOutcome::refused(Refusal::NotFound),
            Err(e) => {
                error!("Expire of {}/{} failed: {}", channel_id, persona_id, e);
                AdminOutcome::storage_failed()
            }
        }
    }

    /// Current lifecycle state. An idle conversation is expired as part of the lookup.
    pub async fn conversation_status(
        &self,
        channel_id: &str,
        persona_id: &str,
    ) -> StatusOutcome {
        let persona = match self.persona(persona_id) {
            Ok(p) => p,
            Err(refusal) => return StatusOutcome::refused(refusal),
        };
        match self
            .conversations
            .observe_timeout(channel_id, persona.id(), Utc::now())
            .await
        {
            Ok((state, record)) => StatusOutcome {
                success: true,
                state: Some(state),
                conversation: record.as_ref().map(ConversationSummary::from),
                ..Default::default()
            },
            Err(e) => {
                error!("Status lookup of {}/{} failed: {}", channel_id, persona_id, e);
                StatusOutcome::storage_failed()
            }
        }
    }

    fn persona(&self, persona_id: &str) -> Result<&Persona, Refusal> {
        self.personas
            .get(persona_id.trim())
            .ok_or_else(|| Refusal::UnknownPersona {
                requested: persona_id.to_string(),
                available: self.personas.ids(),
            })
    }

    async fn run_turn(
        &self,
        persona: &Persona,
        channel_id: &str,
        record: ConversationRecord,
        request: &ChatRequest<'_>,
        now: DateTime<Utc>,
    ) -> ChatOutcome {
        let (channel_context, personal_memory) = tokio::join!(
            self.engine.build_hybrid_context(channel_id, request.message),
            self.engine.facts().personal_memory(
                &request.user.id,
                request.message,
                self.settings.personal_memory_limit,
            ),
        );

        let prompt = system_prompt::assemble(
            &PromptParts {
                persona,
                history: &record.messages,
                speaker: &request.user.name,
                message: request.message,
                personal_memory: &personal_memory,
                channel_context: &channel_context,
                now,
            },
            self.settings.history_turns,
        );
        let limits = self.conversations.limits();
        if let Err(refusal) = system_prompt::check_budget(&prompt, record.total_tokens, limits.max_tokens)
        {
            warn!(
                "Turn for {}/{} refused before generation: ~{} tokens, {} remaining",
                channel_id,
                persona.id(),
                prompt.estimated_tokens(),
                limits.remaining_tokens(&record)
            );
            return ChatOutcome::refused(refusal);
        }

        let generation = match self
            .generator
            .generate(GenerationRequest {
                instructions: prompt.instructions,
                input: prompt.input,
                image_url: request.image_url.map(str::to_string),
            })
            .await
        {
            Ok(g) => g,
            Err(e) => {
                error!(
                    "Generation failed for {}/{} (guild {}): {}",
                    channel_id,
                    persona.id(),
                    request.guild_id.unwrap_or("none"),
                    e
                );
                return ChatOutcome::failed(ReasonCode::GenerationFailed, GENERATION_FAILED);
            }
        };

        let tokens = generation.usage.total();
        let stored = match self
            .conversations
            .record_exchange(
                channel_id,
                persona.id(),
                Exchange {
                    speaker: &request.user.name,
                    user_message: request.message,
                    reply: &generation.text,
                    tokens,
                },
                Utc::now(),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("Recording exchange for {}/{} failed: {}", channel_id, persona.id(), e);
                return ChatOutcome::failed(ReasonCode::StorageFailed, STORAGE_FAILED);
            }
        };

        self.engine.facts().remember_exchange(
            &request.user.id,
            &request.user.name,
            request.message,
            &generation.text,
        );

        ChatOutcome {
            success: true,
            message: Some(generation.text),
            tokens: Some(tokens),
            conversation: Some(ConversationSummary::from(&stored)),
            artifacts: generation.artifacts,
            ..Default::default()
        }
    }
}

fn turn_failure(err: TurnError, channel_id: &str, persona_id: &str) -> ChatOutcome {
    match err {
        TurnError::Refused(refusal) => {
            info!(
                "Turn for {}/{} refused: {}",
                channel_id,
                persona_id,
                refusal.reason().as_str()
            );
            ChatOutcome::refused(refusal)
        }
        TurnError::Storage(e) => {
            error!("Conversation storage failed for {}/{}: {}", channel_id, persona_id, e);
            ChatOutcome::failed(ReasonCode::StorageFailed, STORAGE_FAILED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::context::ContextSettings;
    use crate::conversation::ConversationLimits;
    use crate::db::Database;
    use crate::facts::FactExtractor;
    use crate::indexer::{BatchIndexer, IndexerSettings};
    use crate::rag::InMemoryVectorStore;
    use crate::testing::{FakeEmbedder, FakeGenerator};
    use chrono::Duration;

    struct Harness {
        assistant: Assistant,
        generator: Arc<FakeGenerator>,
        db: Database,
        user: ChatUser,
    }

    fn harness_with(generator: FakeGenerator) -> Harness {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        harness_on(db, generator)
    }

    fn harness_on(db: Database, generator: FakeGenerator) -> Harness {
        let config = test_config();
        let indexer = Arc::new(BatchIndexer::new(
            Arc::new(FakeEmbedder::new()),
            Arc::new(InMemoryVectorStore::new()),
            IndexerSettings::from_config(&config),
        ));
        let engine = Arc::new(ChannelContextEngine::new(
            db.clone(),
            indexer,
            Arc::new(FactExtractor::disabled()),
            ContextSettings::from_config(&config),
        ));
        let generator = Arc::new(generator);
        let assistant = Assistant::new(
            PersonaRegistry::builtin(),
            ConversationManager::new(db.clone(), ConversationLimits::from_config(&config)),
            engine,
            generator.clone(),
            AssistantSettings::from_config(&config),
        );
        Harness {
            assistant,
            generator,
            db,
            user: ChatUser {
                id: "u1".to_string(),
                name: "alice".to_string(),
            },
        }
    }

    fn harness() -> Harness {
        harness_with(FakeGenerator::new(10, 5))
    }

    fn request<'a>(h: &'a Harness, persona: &'a str, message: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            persona_id: persona,
            message,
            user: &h.user,
            channel_id: Some("C2"),
            guild_id: Some("g1"),
            image_url: None,
        }
    }

    #[tokio::test]
    async fn test_grumpy_historian_counts_two_per_exchange() {
        let h = harness();
        let first = h.assistant.chat(request(&h, "grumpy-historian", "hello")).await;
        assert!(first.success, "{:?}", first.error);
        assert_eq!(first.message.as_deref(), Some("reply to: [alice]: hello"));
        assert_eq!(first.tokens, Some(15));
        assert_eq!(first.conversation.as_ref().unwrap().message_count, 2);

        let second = h.assistant.chat(request(&h, "grumpy-historian", "again")).await;
        assert!(second.success);
        let convo = second.conversation.unwrap();
        assert_eq!(convo.message_count, 4);
        assert_eq!(convo.total_tokens, 30);
        assert_eq!(convo.status, ConversationStatus::Active);

        let requests = h.generator.requests.lock().unwrap();
        assert!(requests[1].instructions.starts_with("You are a grumpy but brilliant historian"));
        assert!(requests[1].input.starts_with("[alice]: hello\n[Grumpy Historian]: reply to:"));
    }

    #[tokio::test]
    async fn test_refuses_at_message_limit_without_generating() {
        let h = harness();
        assert!(h.assistant.chat(request(&h, "pirate", "ahoy there")).await.success);
        h.db.force_conversation_state("C2", "pirate", 100, 0, Utc::now())
            .unwrap();

        let outcome = h.assistant.chat(request(&h, "pirate", "one more")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(ReasonCode::MessageLimit));
        assert!(outcome.error.unwrap().contains("/reset"));
        assert_eq!(h.generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_reset_mentions_reset() {
        let h = harness();
        assert!(h.assistant.chat(request(&h, "pirate", "ahoy there")).await.success);

        let reset = h.assistant.reset_conversation("C2", "pirate").await;
        assert!(reset.success);

        let outcome = h.assistant.resume_chat(request(&h, "pirate", "back again")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(ReasonCode::Reset));
        assert!(outcome.error.unwrap().contains("reset"));

        let fresh = h.assistant.chat(request(&h, "pirate", "new start")).await;
        assert_eq!(fresh.conversation.unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn test_expire_then_resume_keeps_counts() {
        let h = harness();
        h.assistant.chat(request(&h, "pirate", "ahoy there")).await;
        h.assistant.chat(request(&h, "pirate", "second turn")).await;

        let expired = h.assistant.expire_conversation("C2", "pirate").await;
        assert!(expired.success);
        let again = h.assistant.expire_conversation("C2", "pirate").await;
        assert_eq!(again.reason, Some(ReasonCode::Expired));

        let refused = h.assistant.chat(request(&h, "pirate", "hello?")).await;
        assert_eq!(refused.reason, Some(ReasonCode::Expired));
        assert!(refused.error.unwrap().contains("/resume"));

        let resumed = h.assistant.resume_chat(request(&h, "pirate", "I'm back")).await;
        assert!(resumed.success);
        assert_eq!(resumed.conversation.unwrap().message_count, 6);

        let active = h.assistant.resume_chat(request(&h, "pirate", "again")).await;
        assert_eq!(active.reason, Some(ReasonCode::Active));
    }

    #[tokio::test]
    async fn test_unknown_persona_lists_ids() {
        let h = harness();
        let outcome = h.assistant.chat(request(&h, "bard", "sing")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(ReasonCode::UnknownPersona));
        let error = outcome.error.unwrap();
        assert!(error.contains("grumpy-historian"));
        assert!(error.contains("pirate"));

        let reset = h.assistant.reset_conversation("C2", "bard").await;
        assert_eq!(reset.reason, Some(ReasonCode::UnknownPersona));
    }

    #[tokio::test]
    async fn test_token_preflight_refuses_before_generation() {
        let h = harness();
        h.assistant.chat(request(&h, "pirate", "ahoy there")).await;
        h.db.force_conversation_state("C2", "pirate", 2, 149_990, Utc::now())
            .unwrap();

        let long = "tell me everything ".repeat(20);
        let outcome = h.assistant.chat(request(&h, "pirate", &long)).await;
        assert_eq!(outcome.reason, Some(ReasonCode::TokenLimit));
        assert_eq!(h.generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_generation_failure_is_reported() {
        let h = harness_with(FakeGenerator::failing());
        let outcome = h.assistant.chat(request(&h, "pirate", "ahoy there")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(ReasonCode::GenerationFailed));

        let stored = h.db.get_conversation("C2", "pirate").unwrap().unwrap();
        assert_eq!(stored.message_count, 0);
    }

    #[tokio::test]
    async fn test_direct_messages_use_user_channel() {
        let h = harness();
        let outcome = h
            .assistant
            .chat(ChatRequest {
                channel_id: None,
                ..request(&h, "assistant", "private question")
            })
            .await;
        assert_eq!(outcome.conversation.unwrap().channel_id, "dm:u1");
        assert_eq!(resolve_channel(Some(" "), "u7"), "dm:u7");
    }

    #[tokio::test]
    async fn test_status_expires_idle_conversation() {
        let h = harness();
        h.assistant.chat(request(&h, "pirate", "ahoy there")).await;
        h.db.force_conversation_state("C2", "pirate", 2, 15, Utc::now() - Duration::minutes(45))
            .unwrap();

        let status = h.assistant.conversation_status("C2", "pirate").await;
        assert!(status.success);
        assert_eq!(status.state, Some(ConversationState::Expired));
        assert_eq!(status.conversation.unwrap().status, ConversationStatus::Expired);

        let status = h.assistant.conversation_status("C3", "pirate").await;
        assert_eq!(status.state, Some(ConversationState::Absent));
        assert!(status.conversation.is_none());
    }

    #[tokio::test]
    async fn test_status_reports_refusal_and_storage_failure() {
        let h = harness();
        let unknown = h.assistant.conversation_status("C2", "bard").await;
        assert!(!unknown.success);
        assert_eq!(unknown.reason, Some(ReasonCode::UnknownPersona));
        assert!(unknown.state.is_none());

        // No schema, so every lookup fails.
        let broken = harness_on(Database::open(":memory:").unwrap(), FakeGenerator::new(10, 5));
        let status = broken.assistant.conversation_status("C2", "pirate").await;
        assert!(!status.success);
        assert_eq!(status.reason, Some(ReasonCode::StorageFailed));
        assert!(status.state.is_none());
        assert!(status.error.unwrap().contains("try again"));
    }
}
