use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chat message observed in a tracked channel.
///
/// Lives only in the ring buffer and the pending-index queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_bot: bool,
    pub reply_to_id: Option<String>,
}

impl MessageRecord {
    /// `[author]: content`, the form used for recent context and extraction input.
    pub fn attributed(&self) -> String {
        format!("[{}]: {}", self.author_name, self.content)
    }
}

impl From<&serenity::model::channel::Message> for MessageRecord {
    fn from(msg: &serenity::model::channel::Message) -> Self {
        let timestamp = DateTime::<Utc>::from_timestamp(msg.timestamp.unix_timestamp(), 0)
            .unwrap_or_else(Utc::now);
        Self {
            id: msg.id.to_string(),
            channel_id: msg.channel_id.to_string(),
            guild_id: msg.guild_id.map(|id| id.to_string()),
            author_id: msg.author.id.to_string(),
            author_name: msg.author.name.clone(),
            content: msg.content.clone(),
            timestamp,
            is_bot: msg.author.bot,
            reply_to_id: msg
                .referenced_message
                .as_deref()
                .map(|m| m.id.to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) fn mock_message(id: u64, channel_id: &str, author: &str, content: &str) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        guild_id: Some("g1".to_string()),
        author_id: format!("u-{}", author.to_lowercase()),
        author_name: author.to_string(),
        content: content.to_string(),
        timestamp: Utc::now(),
        is_bot: false,
        reply_to_id: None,
    }
}
