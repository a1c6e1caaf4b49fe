use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Clone, Deserialize)]
pub struct Config {
    pub discord_token: String,
    pub application_id: u64,
    pub owner_id: Option<u64>,
    pub llama_url: String,
    pub llama_model: String,
    pub llama_api_key: Option<String>,
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_api_key: Option<String>,
    pub embedding_dimensions: usize,
    pub database_url: String,
    pub personas_file: String,
    pub status_message: String,

    // Timeouts
    pub llm_timeout_secs: u64,
    pub embedding_timeout_secs: u64,

    // Tier 1: recent-message ring buffer
    pub ring_buffer_capacity: usize,
    pub recent_context_messages: usize,

    // Tier 2: vector index
    pub qdrant_url: Option<String>,
    pub qdrant_api_key: Option<String>,
    pub qdrant_collection: String,
    pub index_flush_interval_secs: u64,
    pub index_min_content_chars: usize,
    pub index_embed_batch_size: usize,
    pub index_max_pending: usize,
    pub index_retention_days: i64,
    pub index_cleanup_interval_secs: u64,
    pub semantic_search_limit: usize,
    pub semantic_score_threshold: f32,

    // Tier 3: fact extraction
    pub fact_extraction_enabled: bool,
    pub fact_extraction_threshold: usize,
    pub fact_extraction_window: usize,
    pub channel_facts_limit: usize,
    pub personal_memory_limit: usize,

    // Conversation lifecycle
    pub conversation_idle_timeout_mins: i64,
    pub conversation_max_messages: u32,
    pub conversation_max_tokens: u64,
    pub conversation_history_turns: usize,

    pub activity_sync_interval_secs: u64,

    // IRC history archive
    pub history_collection: String,
    pub history_log_dir: Option<String>,
    pub history_nick_map_file: String,
    pub history_search_limit: usize,
    pub history_score_threshold: f32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            application_id: env::var("APPLICATION_ID")
                .map_err(|_| anyhow::anyhow!("APPLICATION_ID must be set"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("APPLICATION_ID must be a valid u64"))?,
            owner_id: env::var("OWNER_ID").ok().and_then(|id| id.parse().ok()),
            llama_url: env::var("LLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:8080/v1".to_string()),
            llama_model: env::var("LLAMA_MODEL").unwrap_or_else(|_| "local-model".to_string()),
            llama_api_key: env::var("LLAMA_API_KEY").ok(),
            embedding_url: env::var("EMBEDDING_URL").unwrap_or_else(|_| {
                env::var("LLAMA_URL").unwrap_or_else(|_| "http://localhost:8080/v1".to_string())
            }),
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "local-model".to_string()),
            embedding_api_key: env::var("EMBEDDING_API_KEY").ok(),
            embedding_dimensions: env_or("EMBEDDING_DIMENSIONS", 1536),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/personacord.db".to_string()),
            personas_file: env::var("PERSONAS_FILE")
                .unwrap_or_else(|_| "personas.toml".to_string()),
            status_message: env::var("STATUS_MESSAGE")
                .unwrap_or_else(|_| "Listening in character".to_string()),

            llm_timeout_secs: env_or("LLM_TIMEOUT_SECS", 120),
            embedding_timeout_secs: env_or("EMBEDDING_TIMEOUT_SECS", 30),

            ring_buffer_capacity: env_or("RING_BUFFER_CAPACITY", 100),
            recent_context_messages: env_or("RECENT_CONTEXT_MESSAGES", 10),

            qdrant_url: env::var("QDRANT_URL").ok().filter(|u| !u.trim().is_empty()),
            qdrant_api_key: env::var("QDRANT_API_KEY").ok(),
            qdrant_collection: env::var("QDRANT_COLLECTION")
                .unwrap_or_else(|_| "channel_messages".to_string()),
            index_flush_interval_secs: env_or("INDEX_FLUSH_INTERVAL_SECS", 30),
            index_min_content_chars: env_or("INDEX_MIN_CONTENT_CHARS", 10),
            index_embed_batch_size: env_or("INDEX_EMBED_BATCH_SIZE", 50),
            index_max_pending: env_or("INDEX_MAX_PENDING", 1000),
            index_retention_days: env_or("INDEX_RETENTION_DAYS", 30),
            index_cleanup_interval_secs: env_or("INDEX_CLEANUP_INTERVAL_SECS", 3600),
            semantic_search_limit: env_or("SEMANTIC_SEARCH_LIMIT", 5),
            semantic_score_threshold: env_or("SEMANTIC_SCORE_THRESHOLD", 0.5),

            fact_extraction_enabled: env_or("FACT_EXTRACTION_ENABLED", true),
            fact_extraction_threshold: env_or("FACT_EXTRACTION_THRESHOLD", 20),
            fact_extraction_window: env_or("FACT_EXTRACTION_WINDOW", 30),
            channel_facts_limit: env_or("CHANNEL_FACTS_LIMIT", 5),
            personal_memory_limit: env_or("PERSONAL_MEMORY_LIMIT", 5),

            conversation_idle_timeout_mins: env_or("CONVERSATION_IDLE_TIMEOUT_MINS", 30),
            conversation_max_messages: env_or("CONVERSATION_MAX_MESSAGES", 100),
            conversation_max_tokens: env_or("CONVERSATION_MAX_TOKENS", 150_000),
            conversation_history_turns: env_or("CONVERSATION_HISTORY_TURNS", 20),

            activity_sync_interval_secs: env_or("ACTIVITY_SYNC_INTERVAL_SECS", 60),

            history_collection: env::var("HISTORY_COLLECTION")
                .unwrap_or_else(|_| "irc_history".to_string()),
            history_log_dir: env::var("HISTORY_LOG_DIR")
                .ok()
                .filter(|d| !d.trim().is_empty()),
            history_nick_map_file: env::var("HISTORY_NICK_MAP_FILE")
                .unwrap_or_else(|_| "nick_mappings.json".to_string()),
            history_search_limit: env_or("HISTORY_SEARCH_LIMIT", 5),
            history_score_threshold: env_or("HISTORY_SCORE_THRESHOLD", 0.3),
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("application_id", &self.application_id)
            .field("owner_id", &self.owner_id)
            .field("llama_url", &self.llama_url)
            .field("llama_model", &self.llama_model)
            .field(
                "llama_api_key",
                &self.llama_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("embedding_url", &self.embedding_url)
            .field("embedding_model", &self.embedding_model)
            .field(
                "embedding_api_key",
                &self.embedding_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("embedding_dimensions", &self.embedding_dimensions)
            .field("database_url", &self.database_url)
            .field("personas_file", &self.personas_file)
            .field("status_message", &self.status_message)
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .field("embedding_timeout_secs", &self.embedding_timeout_secs)
            .field("ring_buffer_capacity", &self.ring_buffer_capacity)
            .field("recent_context_messages", &self.recent_context_messages)
            .field("qdrant_url", &self.qdrant_url)
            .field(
                "qdrant_api_key",
                &self.qdrant_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("qdrant_collection", &self.qdrant_collection)
            .field("index_flush_interval_secs", &self.index_flush_interval_secs)
            .field("index_min_content_chars", &self.index_min_content_chars)
            .field("index_embed_batch_size", &self.index_embed_batch_size)
            .field("index_max_pending", &self.index_max_pending)
            .field("index_retention_days", &self.index_retention_days)
            .field(
                "index_cleanup_interval_secs",
                &self.index_cleanup_interval_secs,
            )
            .field("semantic_search_limit", &self.semantic_search_limit)
            .field("semantic_score_threshold", &self.semantic_score_threshold)
            .field("fact_extraction_enabled", &self.fact_extraction_enabled)
            .field("fact_extraction_threshold", &self.fact_extraction_threshold)
            .field("fact_extraction_window", &self.fact_extraction_window)
            .field("channel_facts_limit", &self.channel_facts_limit)
            .field("personal_memory_limit", &self.personal_memory_limit)
            .field(
                "conversation_idle_timeout_mins",
                &self.conversation_idle_timeout_mins,
            )
            .field("conversation_max_messages", &self.conversation_max_messages)
            .field("conversation_max_tokens", &self.conversation_max_tokens)
            .field(
                "conversation_history_turns",
                &self.conversation_history_turns,
            )
            .field(
                "activity_sync_interval_secs",
                &self.activity_sync_interval_secs,
            )
            .field("history_collection", &self.history_collection)
            .field("history_log_dir", &self.history_log_dir)
            .field("history_nick_map_file", &self.history_nick_map_file)
            .field("history_search_limit", &self.history_search_limit)
            .field("history_score_threshold", &self.history_score_threshold)
            .finish()
    }
}

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;
/// Embed description limit is 4096 characters
pub const DISCORD_EMBED_LIMIT: usize = 4096;

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        discord_token: "test".to_string(),
        application_id: 0,
        owner_id: None,
        llama_url: "test".to_string(),
        llama_model: "test".to_string(),
        llama_api_key: None,
        embedding_url: "test".to_string(),
        embedding_model: "test".to_string(),
        embedding_api_key: None,
        embedding_dimensions: 3,
        database_url: ":memory:".to_string(),
        personas_file: "does-not-exist.toml".to_string(),
        status_message: "test".to_string(),
        llm_timeout_secs: 5,
        embedding_timeout_secs: 5,
        ring_buffer_capacity: 50,
        recent_context_messages: 10,
        qdrant_url: None,
        qdrant_api_key: None,
        qdrant_collection: "test".to_string(),
        index_flush_interval_secs: 30,
        index_min_content_chars: 10,
        index_embed_batch_size: 4,
        index_max_pending: 1000,
        index_retention_days: 30,
        index_cleanup_interval_secs: 3600,
        semantic_search_limit: 5,
        semantic_score_threshold: 0.5,
        fact_extraction_enabled: true,
        fact_extraction_threshold: 5,
        fact_extraction_window: 30,
        channel_facts_limit: 5,
        personal_memory_limit: 5,
        conversation_idle_timeout_mins: 30,
        conversation_max_messages: 100,
        conversation_max_tokens: 150_000,
        conversation_history_turns: 20,
        activity_sync_interval_secs: 60,
        history_collection: "test_history".to_string(),
        history_log_dir: None,
        history_nick_map_file: "does-not-exist.json".to_string(),
        history_search_limit: 5,
        history_score_threshold: 0.3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Test missing vars
        env::remove_var("DISCORD_TOKEN");
        env::remove_var("APPLICATION_ID");
        let result = Config::build();
        assert!(
            result.is_err(),
            "Should fail when required vars are missing"
        );

        // 2. Test defaults
        env::set_var("DISCORD_TOKEN", "test_token");
        env::set_var("APPLICATION_ID", "12345");
        let config = Config::build().unwrap();
        assert_eq!(config.discord_token, "test_token");
        assert_eq!(config.application_id, 12345);
        assert_eq!(config.conversation_max_messages, 100);
        assert_eq!(config.conversation_max_tokens, 150_000);
        assert_eq!(config.conversation_idle_timeout_mins, 30);
        assert_eq!(config.index_max_pending, 1000);
        assert_eq!(config.history_collection, "irc_history");
        assert_eq!(config.history_search_limit, 5);
        assert!(config.qdrant_url.is_none() || env::var("QDRANT_URL").is_ok());

        // 3. Test debug redaction
        env::set_var("LLAMA_API_KEY", "secret_api_key");
        env::set_var("QDRANT_API_KEY", "secret_qdrant_key");
        let config_redacted = Config::build().unwrap();
        let debug_output = format!("{:?}", config_redacted);
        assert!(!debug_output.contains("test_token"));
        assert!(!debug_output.contains("secret_api_key"));
        assert!(!debug_output.contains("secret_qdrant_key"));
        assert!(debug_output.contains("[REDACTED]"));

        // 4. Unparseable numbers fall back to defaults
        env::set_var("CONVERSATION_MAX_MESSAGES", "lots");
        let config = Config::build().unwrap();
        assert_eq!(config.conversation_max_messages, 100);

        // Cleanup
        env::remove_var("DISCORD_TOKEN");
        env::remove_var("APPLICATION_ID");
        env::remove_var("LLAMA_API_KEY");
        env::remove_var("QDRANT_API_KEY");
        env::remove_var("CONVERSATION_MAX_MESSAGES");
    }
}
