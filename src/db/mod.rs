use crate::config::Config;
use crate::conversation::{ConversationMessage, ConversationStatus};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Result};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub mod schema;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub channel_id: String,
    pub persona_id: String,
    pub messages: Vec<ConversationMessage>,
    pub message_count: u32,
    pub total_tokens: u64,
    pub status: ConversationStatus,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub enabled: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactRecord {
    pub id: String,
    pub identity: String,
    pub memory: String,
    pub created_at: DateTime<Utc>,
}

const CONVERSATION_COLUMNS: &str = "channel_id, persona_id, messages, message_count, total_tokens, status, last_activity, created_at";

impl Database {
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
        }
        let conn = Connection::open(path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.lock()?;
        conn.execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    /// Runs a synchronous database operation on the blocking pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection mutex poisoned"))
    }

    // --- Conversations ---

    pub fn get_conversation(
        &self,
        channel_id: &str,
        persona_id: &str,
    ) -> anyhow::Result<Option<ConversationRecord>> {
        let conn = self.lock()?;
        Self::query_conversation(&conn, channel_id, persona_id)
    }

    fn query_conversation(
        conn: &Connection,
        channel_id: &str,
        persona_id: &str,
    ) -> anyhow::Result<Option<ConversationRecord>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE channel_id = ?1 AND persona_id = ?2"
        );
        let row = conn
            .query_row(&sql, (channel_id, persona_id), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .optional()?;

        let Some((channel_id, persona_id, messages, count, tokens, status, last, created)) = row
        else {
            return Ok(None);
        };

        Ok(Some(ConversationRecord {
            channel_id,
            persona_id,
            messages: serde_json::from_str(&messages)?,
            message_count: count,
            total_tokens: tokens.max(0) as u64,
            status: status.parse()?,
            last_activity: parse_ts(&last)?,
            created_at: parse_ts(&created)?,
        }))
    }

    /// Returns the conversation for the pair, creating an empty active one if absent.
    pub fn get_or_create_conversation(
        &self,
        channel_id: &str,
        persona_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(ConversationRecord, bool)> {
        let conn = self.lock()?;
        let now = fmt_ts(now);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO conversations (channel_id, persona_id, status, last_activity, created_at)
             VALUES (?1, ?2, 'active', ?3, ?3)",
            (channel_id, persona_id, &now),
        )?;
        let record = Self::query_conversation(&conn, channel_id, persona_id)?
            .ok_or_else(|| anyhow::anyhow!("conversation {channel_id}/{persona_id} vanished"))?;
        Ok((record, inserted > 0))
    }

    /// Discards history and counters and marks the conversation active again.
    pub fn restart_conversation(
        &self,
        channel_id: &str,
        persona_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ConversationRecord> {
        let conn = self.lock()?;
        let now = fmt_ts(now);
        conn.execute(
            "INSERT INTO conversations (channel_id, persona_id, messages, message_count, total_tokens, status, last_activity, created_at)
             VALUES (?1, ?2, '[]', 0, 0, 'active', ?3, ?3)
             ON CONFLICT(channel_id, persona_id) DO UPDATE SET
                messages = '[]', message_count = 0, total_tokens = 0,
                status = 'active', last_activity = ?3, created_at = ?3",
            (channel_id, persona_id, &now),
        )?;
        Self::query_conversation(&conn, channel_id, persona_id)?
            .ok_or_else(|| anyhow::anyhow!("conversation {channel_id}/{persona_id} vanished"))
    }

    /// Appends one user/assistant exchange and returns the stored running totals.
    pub fn append_exchange(
        &self,
        channel_id: &str,
        persona_id: &str,
        user_message: ConversationMessage,
        assistant_message: ConversationMessage,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ConversationRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT messages FROM conversations WHERE channel_id = ?1 AND persona_id = ?2",
                (channel_id, persona_id),
                |row| row.get(0),
            )
            .optional()?;
        let Some(existing) = existing else {
            anyhow::bail!("no conversation for {channel_id}/{persona_id}");
        };

        let mut messages: Vec<ConversationMessage> = serde_json::from_str(&existing)?;
        messages.push(user_message);
        messages.push(assistant_message);
        let messages = serde_json::to_string(&messages)?;

        tx.execute(
            "UPDATE conversations SET
                messages = ?3,
                message_count = message_count + 2,
                total_tokens = total_tokens + ?4,
                last_activity = ?5
             WHERE channel_id = ?1 AND persona_id = ?2",
            (channel_id, persona_id, &messages, tokens as i64, fmt_ts(now)),
        )?;
        tx.commit()?;

        Self::query_conversation(&conn, channel_id, persona_id)?
            .ok_or_else(|| anyhow::anyhow!("conversation {channel_id}/{persona_id} vanished"))
    }

    pub fn reset_conversation(&self, channel_id: &str, persona_id: &str) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "UPDATE conversations SET messages = '[]', message_count = 0, total_tokens = 0, status = 'reset'
             WHERE channel_id = ?1 AND persona_id = ?2",
            (channel_id, persona_id),
        )?;
        Ok(count)
    }

    /// Marks an active conversation expired, keeping its history.
    pub fn expire_conversation(&self, channel_id: &str, persona_id: &str) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "UPDATE conversations SET status = 'expired'
             WHERE channel_id = ?1 AND persona_id = ?2 AND status = 'active'",
            (channel_id, persona_id),
        )?;
        Ok(count)
    }

    /// Reactivates an expired conversation; counters and history are untouched.
    pub fn resume_conversation(
        &self,
        channel_id: &str,
        persona_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ConversationRecord>> {
        let conn = self.lock()?;
        let count = conn.execute(
            "UPDATE conversations SET status = 'active', last_activity = ?3
             WHERE channel_id = ?1 AND persona_id = ?2 AND status = 'expired'",
            (channel_id, persona_id, fmt_ts(now)),
        )?;
        if count == 0 {
            return Ok(None);
        }
        Self::query_conversation(&conn, channel_id, persona_id)
    }

    #[cfg(test)]
    pub(crate) fn list_conversations_by_status(
        &self,
        status: ConversationStatus,
    ) -> anyhow::Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT channel_id, persona_id FROM conversations WHERE status = ?1 ORDER BY last_activity DESC",
        )?;
        let rows = stmt.query_map([status.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    #[cfg(test)]
    pub(crate) fn force_conversation_state(
        &self,
        channel_id: &str,
        persona_id: &str,
        message_count: u32,
        total_tokens: u64,
        last_activity: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations SET message_count = ?3, total_tokens = ?4, last_activity = ?5
             WHERE channel_id = ?1 AND persona_id = ?2",
            (
                channel_id,
                persona_id,
                message_count,
                total_tokens as i64,
                fmt_ts(last_activity),
            ),
        )?;
        Ok(())
    }

    // --- Tracked channels ---

    pub fn set_channel_enabled(
        &self,
        guild_id: Option<&str>,
        channel_id: &str,
        enabled: bool,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tracked_channels (guild_id, channel_id, enabled, updated_at)
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
             ON CONFLICT(channel_id) DO UPDATE SET
                enabled = ?3,
                guild_id = COALESCE(?1, guild_id),
                updated_at = CURRENT_TIMESTAMP",
            (guild_id, channel_id, enabled),
        )?;
        Ok(())
    }

    pub fn get_channel(&self, channel_id: &str) -> anyhow::Result<Option<ChannelRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT channel_id, guild_id, enabled, last_activity FROM tracked_channels WHERE channel_id = ?1",
                [channel_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(channel_from_row).transpose()
    }

    pub fn list_tracked_channels(&self) -> anyhow::Result<Vec<ChannelRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT channel_id, guild_id, enabled, last_activity FROM tracked_channels WHERE enabled = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(channel_from_row(row?)?);
        }
        Ok(results)
    }

    pub fn touch_channel_activity(
        &self,
        channel_id: &str,
        last_activity: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tracked_channels SET last_activity = ?2 WHERE channel_id = ?1",
            (channel_id, fmt_ts(last_activity)),
        )?;
        Ok(())
    }

    // --- Facts ---

    pub fn insert_fact(
        &self,
        id: &str,
        identity: &str,
        memory: &str,
        metadata: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO facts (id, identity, memory, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            (id, identity, memory, metadata, fmt_ts(now)),
        )?;
        Ok(())
    }

    /// Facts for an identity, newest first.
    pub fn list_facts(&self, identity: &str, limit: usize) -> anyhow::Result<Vec<FactRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity, memory, created_at FROM facts WHERE identity = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map((identity, limit as i64), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (id, identity, memory, created_at) = row?;
            results.push(FactRecord {
                id,
                identity,
                memory,
                created_at: parse_ts(&created_at)?,
            });
        }
        debug!("Database: {} facts for {}", results.len(), identity);
        Ok(results)
    }
}

fn channel_from_row(
    (channel_id, guild_id, enabled, last_activity): (String, Option<String>, bool, Option<String>),
) -> anyhow::Result<ChannelRecord> {
    Ok(ChannelRecord {
        channel_id,
        guild_id,
        enabled,
        last_activity: last_activity.as_deref().map(parse_ts).transpose()?,
    })
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(ts: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(ts)
        .map_err(|e| anyhow::anyhow!("invalid timestamp '{ts}': {e}"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::MessageRole;
    use chrono::Duration;

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        db
    }

    fn turn(role: MessageRole, content: &str) -> ConversationMessage {
        ConversationMessage {
            role,
            content: content.to_string(),
            speaker: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_conversation_create_and_append() {
        let db = test_db();
        let now = Utc::now();

        let (created, fresh) = db.get_or_create_conversation("c1", "bard", now).unwrap();
        assert!(fresh);
        assert_eq!(created.status, ConversationStatus::Active);
        assert_eq!(created.message_count, 0);

        let (again, fresh) = db.get_or_create_conversation("c1", "bard", now).unwrap();
        assert!(!fresh);
        assert_eq!(again.created_at, created.created_at);

        let updated = db
            .append_exchange(
                "c1",
                "bard",
                turn(MessageRole::User, "hi"),
                turn(MessageRole::Assistant, "hello"),
                42,
                now,
            )
            .unwrap();
        assert_eq!(updated.message_count, 2);
        assert_eq!(updated.total_tokens, 42);
        assert_eq!(updated.messages.len(), 2);
        assert_eq!(updated.messages[1].content, "hello");
    }

    #[test]
    fn test_append_without_conversation_fails() {
        let db = test_db();
        let result = db.append_exchange(
            "nope",
            "bard",
            turn(MessageRole::User, "hi"),
            turn(MessageRole::Assistant, "hello"),
            1,
            Utc::now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_reset_expire_resume() {
        let db = test_db();
        let now = Utc::now();
        db.get_or_create_conversation("c1", "bard", now).unwrap();
        db.append_exchange(
            "c1",
            "bard",
            turn(MessageRole::User, "hi"),
            turn(MessageRole::Assistant, "hello"),
            10,
            now,
        )
        .unwrap();

        // Expire keeps history
        assert_eq!(db.expire_conversation("c1", "bard").unwrap(), 1);
        let expired = db.get_conversation("c1", "bard").unwrap().unwrap();
        assert_eq!(expired.status, ConversationStatus::Expired);
        assert_eq!(expired.message_count, 2);

        // Expiring twice is a no-op
        assert_eq!(db.expire_conversation("c1", "bard").unwrap(), 0);

        let resumed = db.resume_conversation("c1", "bard", now).unwrap().unwrap();
        assert_eq!(resumed.status, ConversationStatus::Active);
        assert_eq!(resumed.message_count, 2);
        assert_eq!(resumed.total_tokens, 10);

        // Resume only applies to expired rows
        assert!(db.resume_conversation("c1", "bard", now).unwrap().is_none());

        // Reset discards history
        assert_eq!(db.reset_conversation("c1", "bard").unwrap(), 1);
        let reset = db.get_conversation("c1", "bard").unwrap().unwrap();
        assert_eq!(reset.status, ConversationStatus::Reset);
        assert_eq!(reset.message_count, 0);
        assert!(reset.messages.is_empty());

        let listed = db
            .list_conversations_by_status(ConversationStatus::Reset)
            .unwrap();
        assert_eq!(listed, vec![("c1".to_string(), "bard".to_string())]);
    }

    #[test]
    fn test_restart_conversation() {
        let db = test_db();
        let earlier = Utc::now() - Duration::hours(2);
        db.get_or_create_conversation("c1", "bard", earlier).unwrap();
        db.append_exchange(
            "c1",
            "bard",
            turn(MessageRole::User, "hi"),
            turn(MessageRole::Assistant, "hello"),
            10,
            earlier,
        )
        .unwrap();

        let now = Utc::now();
        let restarted = db.restart_conversation("c1", "bard", now).unwrap();
        assert_eq!(restarted.message_count, 0);
        assert_eq!(restarted.total_tokens, 0);
        assert!(restarted.messages.is_empty());
        assert_eq!(restarted.status, ConversationStatus::Active);
        assert!(restarted.last_activity > earlier);
    }

    #[test]
    fn test_tracked_channels() {
        let db = test_db();
        assert!(db.get_channel("c1").unwrap().is_none());

        db.set_channel_enabled(Some("g1"), "c1", true).unwrap();
        db.set_channel_enabled(None, "c2", true).unwrap();
        db.set_channel_enabled(None, "c2", false).unwrap();

        let tracked = db.list_tracked_channels().unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].channel_id, "c1");
        assert_eq!(tracked[0].guild_id.as_deref(), Some("g1"));

        let now = Utc::now();
        db.touch_channel_activity("c1", now).unwrap();
        let record = db.get_channel("c1").unwrap().unwrap();
        assert!(record.enabled);
        assert_eq!(
            record.last_activity.map(|t| t.timestamp()),
            Some(now.timestamp())
        );

        // Re-enabling without a guild keeps the stored guild
        db.set_channel_enabled(None, "c1", true).unwrap();
        let record = db.get_channel("c1").unwrap().unwrap();
        assert_eq!(record.guild_id.as_deref(), Some("g1"));
    }

    #[test]
    fn test_facts_are_namespaced() {
        let db = test_db();
        let now = Utc::now();
        db.insert_fact("f1", "channel:1", "likes rust", None, now)
            .unwrap();
        db.insert_fact("f2", "user:1", "prefers tea", None, now)
            .unwrap();
        db.insert_fact("f3", "channel:1", "meets on fridays", None, now + Duration::seconds(1))
            .unwrap();

        let channel = db.list_facts("channel:1", 10).unwrap();
        assert_eq!(channel.len(), 2);
        assert_eq!(channel[0].memory, "meets on fridays");

        let user = db.list_facts("user:1", 10).unwrap();
        assert_eq!(user.len(), 1);
        assert_eq!(user[0].memory, "prefers tea");
    }
}
