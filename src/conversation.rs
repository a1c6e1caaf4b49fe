//! Conversation lifecycle per (channel, persona) pair.
//!
//! Persisted statuses are `active`, `expired` and `reset`. `idle` is derived on
//! touch from `last_activity` and is never written to the store.

use crate::db::{ConversationRecord, Database};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Expired,
    Reset,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Expired => "expired",
            ConversationStatus::Reset => "reset",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "expired" => Ok(ConversationStatus::Expired),
            "reset" => Ok(ConversationStatus::Reset),
            other => Err(anyhow::anyhow!("unknown conversation status '{other}'")),
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state as observed at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Absent,
    Active,
    Idle,
    Expired,
    Reset,
}

impl ConversationState {
    pub fn observe(
        record: Option<&ConversationRecord>,
        now: DateTime<Utc>,
        idle_timeout: Duration,
    ) -> Self {
        match record {
            None => ConversationState::Absent,
            Some(r) => match r.status {
                ConversationStatus::Expired => ConversationState::Expired,
                ConversationStatus::Reset => ConversationState::Reset,
                ConversationStatus::Active if now - r.last_activity > idle_timeout => {
                    ConversationState::Idle
                }
                ConversationStatus::Active => ConversationState::Active,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    /// Display name of the speaker for user turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Machine-readable reason attached to a failed foreground operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    MessageLimit,
    TokenLimit,
    Expired,
    Reset,
    NotFound,
    Active,
    UnknownPersona,
    GenerationFailed,
    StorageFailed,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::MessageLimit => "message_limit",
            ReasonCode::TokenLimit => "token_limit",
            ReasonCode::Expired => "expired",
            ReasonCode::Reset => "reset",
            ReasonCode::NotFound => "not_found",
            ReasonCode::Active => "active",
            ReasonCode::UnknownPersona => "unknown_persona",
            ReasonCode::GenerationFailed => "generation_failed",
            ReasonCode::StorageFailed => "storage_failed",
        }
    }
}

/// A user-facing refusal. The message always names the command that gets the user unstuck.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Refusal {
    #[error("This conversation has reached the {limit}-message limit. Use `/reset` to start a fresh conversation.")]
    MessageLimit { limit: u32 },
    #[error("This conversation has used {used} of its {limit}-token budget. Use `/reset` to start a fresh conversation.")]
    TokenLimit { used: u64, limit: u64 },
    #[error("This conversation has expired. Use `/resume` to pick it up again or `/reset` to start over.")]
    Expired,
    #[error("This conversation was reset and cannot be resumed. Use `/chat` to start a new one.")]
    Reset,
    #[error("There is no conversation with this persona here. Use `/chat` to start one.")]
    NotFound,
    #[error("This conversation is still active, so there is nothing to resume. Keep going with `/chat`.")]
    AlreadyActive,
    #[error("Unknown persona `{requested}`. Available personas: {}", .available.join(", "))]
    UnknownPersona {
        requested: String,
        available: Vec<String>,
    },
}

impl Refusal {
    pub fn reason(&self) -> ReasonCode {
        match self {
            Refusal::MessageLimit { .. } => ReasonCode::MessageLimit,
            Refusal::TokenLimit { .. } => ReasonCode::TokenLimit,
            Refusal::Expired => ReasonCode::Expired,
            Refusal::Reset => ReasonCode::Reset,
            Refusal::NotFound => ReasonCode::NotFound,
            Refusal::AlreadyActive => ReasonCode::Active,
            Refusal::UnknownPersona { .. } => ReasonCode::UnknownPersona,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Refused(#[from] Refusal),
    #[error("conversation storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ConversationLimits {
    pub max_messages: u32,
    pub max_tokens: u64,
    pub idle_timeout: Duration,
}

impl ConversationLimits {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            max_messages: config.conversation_max_messages,
            max_tokens: config.conversation_max_tokens,
            idle_timeout: Duration::minutes(config.conversation_idle_timeout_mins),
        }
    }

    pub fn check(&self, record: &ConversationRecord) -> Result<(), Refusal> {
        if record.message_count >= self.max_messages {
            return Err(Refusal::MessageLimit {
                limit: self.max_messages,
            });
        }
        if record.total_tokens >= self.max_tokens {
            return Err(Refusal::TokenLimit {
                used: record.total_tokens,
                limit: self.max_tokens,
            });
        }
        Ok(())
    }

    pub fn remaining_tokens(&self, record: &ConversationRecord) -> u64 {
        self.max_tokens.saturating_sub(record.total_tokens)
    }
}

impl Default for ConversationLimits {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_tokens: 150_000,
            idle_timeout: Duration::minutes(30),
        }
    }
}

/// One completed user/assistant exchange to be recorded.
pub struct Exchange<'a> {
    pub speaker: &'a str,
    pub user_message: &'a str,
    pub reply: &'a str,
    pub tokens: u64,
}

pub struct ConversationManager {
    db: Database,
    limits: ConversationLimits,
}

impl ConversationManager {
    pub fn new(db: Database, limits: ConversationLimits) -> Self {
        Self { db, limits }
    }

    pub fn limits(&self) -> &ConversationLimits {
        &self.limits
    }

    pub async fn get(
        &self,
        channel_id: &str,
        persona_id: &str,
    ) -> anyhow::Result<Option<ConversationRecord>> {
        let (channel_id, persona_id) = (channel_id.to_string(), persona_id.to_string());
        self.db
            .run_blocking(move |db| db.get_conversation(&channel_id, &persona_id))
            .await
    }

    /// Resolves the conversation a `chat()` turn will run against.
    ///
    /// Absent pairs are created, reset ones restarted, and idle ones expired then
    /// restarted in place. Limits are checked against the conversation that will
    /// actually receive the turn.
    pub async fn begin_chat(
        &self,
        channel_id: &str,
        persona_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ConversationRecord, TurnError> {
        let (channel, persona) = (channel_id.to_string(), persona_id.to_string());
        let (record, created) = self
            .db
            .run_blocking(move |db| db.get_or_create_conversation(&channel, &persona, now))
            .await?;
        if created {
            info!("Conversation started for {}/{}", channel_id, persona_id);
        }

        let record = match ConversationState::observe(Some(&record), now, self.limits.idle_timeout)
        {
            ConversationState::Expired => return Err(Refusal::Expired.into()),
            ConversationState::Reset => {
                debug!("Conversation {}/{} restarting after reset", channel_id, persona_id);
                self.restart(channel_id, persona_id, now).await?
            }
            ConversationState::Idle => {
                let idle_for = (now - record.last_activity).to_std().unwrap_or_default();
                info!(
                    "Conversation {}/{} idle for {}, expiring and restarting",
                    channel_id,
                    persona_id,
                    humantime::format_duration(round_secs(idle_for))
                );
                self.expire(channel_id, persona_id).await?;
                self.restart(channel_id, persona_id, now).await?
            }
            ConversationState::Active | ConversationState::Absent => record,
        };

        self.limits.check(&record)?;
        Ok(record)
    }

    /// Reactivates an expired conversation for a `resume_chat()` turn.
    pub async fn begin_resume(
        &self,
        channel_id: &str,
        persona_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ConversationRecord, TurnError> {
        let existing = self.get(channel_id, persona_id).await?;
        match ConversationState::observe(existing.as_ref(), now, self.limits.idle_timeout) {
            ConversationState::Absent => return Err(Refusal::NotFound.into()),
            ConversationState::Active | ConversationState::Idle => {
                return Err(Refusal::AlreadyActive.into())
            }
            ConversationState::Reset => return Err(Refusal::Reset.into()),
            ConversationState::Expired => {}
        }
        // A conversation over its limits stays expired.
        if let Some(record) = &existing {
            self.limits.check(record)?;
        }

        let (channel, persona) = (channel_id.to_string(), persona_id.to_string());
        let resumed = self
            .db
            .run_blocking(move |db| db.resume_conversation(&channel, &persona, now))
            .await?
            // Lost a race with a concurrent reset or resume.
            .ok_or(Refusal::NotFound)?;
        info!(
            "Conversation {}/{} resumed at {} messages",
            channel_id, persona_id, resumed.message_count
        );
        Ok(resumed)
    }

    /// Appends the exchange and returns the stored running totals.
    pub async fn record_exchange(
        &self,
        channel_id: &str,
        persona_id: &str,
        exchange: Exchange<'_>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ConversationRecord> {
        let user = ConversationMessage {
            role: MessageRole::User,
            content: exchange.user_message.to_string(),
            speaker: Some(exchange.speaker.to_string()),
            timestamp: now,
        };
        let assistant = ConversationMessage {
            role: MessageRole::Assistant,
            content: exchange.reply.to_string(),
            speaker: None,
            timestamp: now,
        };
        let tokens = exchange.tokens;
        let (channel, persona) = (channel_id.to_string(), persona_id.to_string());
        self.db
            .run_blocking(move |db| {
                db.append_exchange(&channel, &persona, user, assistant, tokens, now)
            })
            .await
    }

    /// Discards history. Returns false when the pair has no conversation.
    pub async fn reset(&self, channel_id: &str, persona_id: &str) -> anyhow::Result<bool> {
        let (channel, persona) = (channel_id.to_string(), persona_id.to_string());
        let count = self
            .db
            .run_blocking(move |db| db.reset_conversation(&channel, &persona))
            .await?;
        if count > 0 {
            info!("Conversation {}/{} reset", channel_id, persona_id);
        }
        Ok(count > 0)
    }

    /// Expires an active conversation, keeping its history for `/resume`.
    pub async fn expire(&self, channel_id: &str, persona_id: &str) -> anyhow::Result<bool> {
        let (channel, persona) = (channel_id.to_string(), persona_id.to_string());
        let count = self
            .db
            .run_blocking(move |db| db.expire_conversation(&channel, &persona))
            .await?;
        Ok(count > 0)
    }

    /// Reports the current state, expiring the conversation if it has gone idle.
    pub async fn observe_timeout(
        &self,
        channel_id: &str,
        persona_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(ConversationState, Option<ConversationRecord>)> {
        let record = self.get(channel_id, persona_id).await?;
        let state = ConversationState::observe(record.as_ref(), now, self.limits.idle_timeout);
        if state != ConversationState::Idle {
            return Ok((state, record));
        }

        self.expire(channel_id, persona_id).await?;
        let record = self.get(channel_id, persona_id).await?;
        Ok((ConversationState::Expired, record))
    }

    async fn restart(
        &self,
        channel_id: &str,
        persona_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ConversationRecord> {
        let (channel, persona) = (channel_id.to_string(), persona_id.to_string());
        self.db
            .run_blocking(move |db| db.restart_conversation(&channel, &persona, now))
            .await
    }
}

fn round_secs(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(d.as_secs())
}
