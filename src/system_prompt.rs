//! Prompt assembly for a chat turn.
//!
//! Pure composition: everything is passed in, nothing is fetched. The result is the
//! instruction text and the input text handed to the generator, plus a rough token
//! estimate used to refuse turns that would blow the conversation budget.

use crate::conversation::{ConversationMessage, MessageRole, Refusal};
use crate::persona::Persona;
use chrono::{DateTime, Utc};

/// Characters per token for the pre-flight estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Format a point in time for inclusion in system prompts.
///
/// ```text
/// Current date/time: Wednesday, February 05, 2025, 14:30:15 UTC (2025-02-05T14:30:15+00:00)
/// ```
pub fn get_datetime_context(now: DateTime<Utc>) -> String {
    format!(
        "Current date/time: {}, {} UTC ({})",
        now.format("%A, %B %d, %Y"),
        now.format("%H:%M:%S"),
        now.to_rfc3339()
    )
}

fn group_chat_framing(persona: &Persona, now: DateTime<Utc>) -> String {
    format!(
        "You are {name}, talking in a group chat channel where several people may address you. \
Each user message is prefixed with the speaker's name in brackets, like `[alice]: hi`. \
Keep track of who said what, address people by name when it helps, and reply as {name} \
without adding a name prefix yourself.\n{}",
        get_datetime_context(now),
        name = persona.name()
    )
}

/// Everything a turn's prompt is built from.
pub struct PromptParts<'a> {
    pub persona: &'a Persona,
    pub history: &'a [ConversationMessage],
    pub speaker: &'a str,
    pub message: &'a str,
    pub personal_memory: &'a str,
    pub channel_context: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub instructions: String,
    pub input: String,
}

impl AssembledPrompt {
    pub fn estimated_tokens(&self) -> u64 {
        estimate_tokens(&self.instructions) + estimate_tokens(&self.input)
    }
}

pub fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64
}

/// Builds the prompt, keeping at most `history_limit` of the most recent prior messages.
pub fn assemble(parts: &PromptParts<'_>, history_limit: usize) -> AssembledPrompt {
    let mut blocks = vec![
        parts.persona.prompt().to_string(),
        group_chat_framing(parts.persona, parts.now),
    ];
    let personal = parts.personal_memory.trim();
    if !personal.is_empty() {
        blocks.push(format!(
            "What you remember about {}:\n{}",
            parts.speaker, personal
        ));
    }
    let channel = parts.channel_context.trim();
    if !channel.is_empty() {
        blocks.push(format!("Channel context:\n{channel}"));
    }

    let skip = parts.history.len().saturating_sub(history_limit);
    let mut lines: Vec<String> = parts.history[skip..]
        .iter()
        .map(|m| match m.role {
            MessageRole::User => format!(
                "[{}]: {}",
                m.speaker.as_deref().unwrap_or("user"),
                m.content
            ),
            MessageRole::Assistant => format!("[{}]: {}", parts.persona.name(), m.content),
        })
        .collect();
    lines.push(format!("[{}]: {}", parts.speaker, parts.message));

    AssembledPrompt {
        instructions: blocks.join("\n\n"),
        input: lines.join("\n"),
    }
}

/// Refuses when the estimated prompt size does not fit the remaining token budget.
pub fn check_budget(
    prompt: &AssembledPrompt,
    used: u64,
    limit: u64,
) -> Result<(), Refusal> {
    let remaining = limit.saturating_sub(used);
    if prompt.estimated_tokens() >= remaining {
        return Err(Refusal::TokenLimit { used, limit });
    }
    Ok(())
}
