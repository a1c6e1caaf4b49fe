/// Schema applied by `Database::execute_init`.
pub const SCHEMA: &str = "
    -- One row per (channel, persona) conversation; messages is a JSON array
    CREATE TABLE IF NOT EXISTS conversations (
        channel_id TEXT NOT NULL,
        persona_id TEXT NOT NULL,
        messages TEXT NOT NULL DEFAULT '[]',
        message_count INTEGER NOT NULL DEFAULT 0,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active',
        last_activity DATETIME NOT NULL,
        created_at DATETIME NOT NULL,
        PRIMARY KEY (channel_id, persona_id)
    );

    CREATE TABLE IF NOT EXISTS tracked_channels (
        channel_id TEXT PRIMARY KEY,
        guild_id TEXT,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        last_activity DATETIME,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    -- Append-only extracted facts, namespaced by identity (channel:<id> / user:<id>)
    CREATE TABLE IF NOT EXISTS facts (
        id TEXT PRIMARY KEY,
        identity TEXT NOT NULL,
        memory TEXT NOT NULL,
        metadata TEXT,
        created_at DATETIME NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_facts_identity ON facts (identity, created_at);
";
