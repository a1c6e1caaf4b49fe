//! Splits parsed log sessions into embeddable chunks.

use super::mirc::{LogMessage, LogSession};
use chrono::{Datelike, Duration, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A silence longer than this starts a new chunk.
pub const SESSION_GAP_MINUTES: i64 = 30;
pub const MAX_CHUNK_MESSAGES: usize = 20;
/// Roughly 2,000 tokens.
pub const MAX_CHUNK_CHARS: usize = 8000;

/// One stretch of archived conversation; also the archive point payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveChunk {
    pub chunk_id: String,
    pub session_id: String,
    pub channel: Option<String>,
    pub target_nick: Option<String>,
    pub network: Option<String>,
    pub participants: Vec<String>,
    /// `HH:MM` of the first and last message.
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub year: Option<i32>,
    pub decade: Option<String>,
    pub text: String,
    pub message_count: usize,
    pub chunk_index: usize,
}

impl ArchiveChunk {
    /// Stable point id, so re-importing a log overwrites its chunks.
    pub fn point_id(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, self.chunk_id.as_bytes())
    }

    /// Where the chunk came from: the channel, or the other party of a private log.
    pub fn source_label(&self) -> String {
        match (&self.channel, &self.target_nick) {
            (Some(channel), _) => channel.clone(),
            (None, Some(nick)) => format!("private chat with {nick}"),
            (None, None) => "unknown source".to_string(),
        }
    }
}

pub fn decade_label(year: i32) -> String {
    format!("{}s", year.div_euclid(10) * 10)
}

/// Chunks one session on time gaps, message count and size.
pub fn chunk_session(session: &LogSession) -> Vec<ArchiveChunk> {
    let year = session.started_at.map(|t| t.year());
    let decade = year.map(decade_label);

    let mut chunks = Vec::new();
    let mut current: Vec<&LogMessage> = Vec::new();
    let mut current_chars = 0;

    for message in &session.messages {
        let chars = line_for(message).chars().count() + 1;
        let split = current
            .last()
            .is_some_and(|prev| gap_exceeded(prev.time, message.time))
            || current.len() >= MAX_CHUNK_MESSAGES
            || current_chars + chars > MAX_CHUNK_CHARS;

        if split && !current.is_empty() {
            chunks.push(build_chunk(session, &current, chunks.len(), year, decade.clone()));
            current.clear();
            current_chars = 0;
        }
        current.push(message);
        current_chars += chars;
    }
    if !current.is_empty() {
        chunks.push(build_chunk(session, &current, chunks.len(), year, decade));
    }
    chunks
}

fn line_for(message: &LogMessage) -> String {
    format!("{}: {}", message.nick, message.text)
}

/// Times carry no date; a later message with an earlier clock time rolled past midnight.
fn gap_exceeded(prev: Option<NaiveTime>, curr: Option<NaiveTime>) -> bool {
    let (Some(prev), Some(curr)) = (prev, curr) else {
        return false;
    };
    let mut gap = curr.signed_duration_since(prev);
    if gap < Duration::zero() {
        gap += Duration::days(1);
    }
    gap > Duration::minutes(SESSION_GAP_MINUTES)
}

fn build_chunk(
    session: &LogSession,
    messages: &[&LogMessage],
    index: usize,
    year: Option<i32>,
    decade: Option<String>,
) -> ArchiveChunk {
    let participants: BTreeSet<String> = messages.iter().map(|m| m.nick.clone()).collect();
    let time_of = |m: Option<&&LogMessage>| {
        m.and_then(|m| m.time)
            .map(|t| t.format("%H:%M").to_string())
    };
    ArchiveChunk {
        chunk_id: format!("{}_chunk{:03}", session.session_id, index),
        session_id: session.session_id.clone(),
        channel: session.channel.clone(),
        target_nick: session.target_nick.clone(),
        network: session.network.clone(),
        participants: participants.into_iter().collect(),
        start_time: time_of(messages.first()),
        end_time: time_of(messages.last()),
        year,
        decade,
        text: messages
            .iter()
            .map(|m| line_for(m))
            .collect::<Vec<_>>()
            .join("\n"),
        message_count: messages.len(),
        chunk_index: index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn message(time: &str, nick: &str, text: &str) -> LogMessage {
        LogMessage {
            time: NaiveTime::parse_from_str(time, "%H:%M").ok(),
            nick: nick.to_string(),
            text: text.to_string(),
            is_self: false,
        }
    }

    fn session(messages: Vec<LogMessage>) -> LogSession {
        LogSession {
            session_id: "#retro.EFnet_0001".to_string(),
            channel: Some("#retro".to_string()),
            target_nick: None,
            network: Some("EFnet".to_string()),
            started_at: NaiveDate::from_ymd_opt(1999, 3, 4)
                .and_then(|d| d.and_hms_opt(20, 0, 0)),
            ended_at: None,
            messages,
        }
    }

    #[test]
    fn test_splits_on_long_silence() {
        let chunks = chunk_session(&session(vec![
            message("20:00", "alice", "first"),
            message("20:10", "bob", "second"),
            message("20:41", "alice", "after a break"),
        ]));

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "alice: first\nbob: second");
        assert_eq!(chunks[0].participants, vec!["alice", "bob"]);
        assert_eq!(chunks[0].start_time.as_deref(), Some("20:00"));
        assert_eq!(chunks[0].end_time.as_deref(), Some("20:10"));
        assert_eq!(chunks[1].chunk_id, "#retro.EFnet_0001_chunk001");
        assert_eq!(chunks[1].year, Some(1999));
        assert_eq!(chunks[1].decade.as_deref(), Some("1990s"));
    }

    #[test]
    fn test_midnight_rollover_is_not_a_gap() {
        let chunks = chunk_session(&session(vec![
            message("23:50", "alice", "late"),
            message("00:05", "bob", "later"),
        ]));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_caps_messages_per_chunk() {
        let messages = (0..45)
            .map(|i| message("20:00", "alice", &format!("line {i}")))
            .collect();
        let chunks = chunk_session(&session(messages));
        let sizes: Vec<usize> = chunks.iter().map(|c| c.message_count).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
        assert_eq!(chunks[2].chunk_index, 2);
    }

    #[test]
    fn test_caps_chunk_size() {
        let long = "x".repeat(3000);
        let chunks = chunk_session(&session(vec![
            message("20:00", "alice", &long),
            message("20:01", "bob", &long),
            message("20:02", "carol", &long),
        ]));
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= MAX_CHUNK_CHARS));
    }

    #[test]
    fn test_point_id_is_stable() {
        let chunks = chunk_session(&session(vec![message("20:00", "alice", "hello")]));
        assert_eq!(chunks[0].point_id(), chunks[0].clone().point_id());
        assert_eq!(decade_label(2003), "2000s");
        assert_eq!(chunks[0].source_label(), "#retro");
    }
}
