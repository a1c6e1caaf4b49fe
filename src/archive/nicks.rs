//! Curated mapping between Discord users and the IRC nicks they used.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Away and status suffixes people tacked onto their nick.
const NICK_SUFFIXES: [&str; 11] = [
    "wrk", "work", "away", "afk", "zzz", "sleep", "brb", "food", "out", "home", "mobile",
];
const NICK_SEPARATORS: [char; 3] = ['_', '-', '|'];

#[derive(Debug, Deserialize)]
struct MappingEntry {
    discord: DiscordUser,
    #[serde(default)]
    irc_nicks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
}

#[derive(Debug, Default)]
pub struct NickMap {
    by_user: HashMap<String, Vec<String>>,
    by_nick: HashMap<String, String>,
}

impl NickMap {
    /// Reads a mappings file. A missing file gives an empty map.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let map = Self::from_json(&content)
            .map_err(|e| anyhow::anyhow!("invalid nick mapping file {}: {}", path.display(), e))?;
        info!(
            "Archive: {} nick mappings loaded from {}",
            map.len(),
            path.display()
        );
        Ok(map)
    }

    /// Entries with no confirmed nicks are skipped.
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let entries: Vec<MappingEntry> = serde_json::from_str(content)?;
        let mut map = Self::default();
        for entry in entries.into_iter().filter(|e| !e.irc_nicks.is_empty()) {
            for nick in &entry.irc_nicks {
                map.by_nick
                    .insert(normalize_nick(nick), entry.discord.id.clone());
            }
            map.by_user
                .entry(entry.discord.id)
                .or_default()
                .extend(entry.irc_nicks);
        }
        Ok(map)
    }

    pub fn nicks_for(&self, user_id: &str) -> &[String] {
        self.by_user.get(user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Discord user behind a nick, ignoring case and away suffixes.
    pub fn user_for(&self, nick: &str) -> Option<&str> {
        self.by_nick.get(&normalize_nick(nick)).map(String::as_str)
    }

    /// Mapped users.
    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}

/// `Alice_away`, `alice|wrk` and `_alice_2` all normalize to `alice`.
pub fn normalize_nick(nick: &str) -> String {
    let is_separator = |c: char| NICK_SEPARATORS.contains(&c);
    let lower = nick.to_lowercase();
    let mut base = lower.as_str();
    if let Some(pos) = base.rfind(is_separator) {
        let suffix = &base[pos + 1..];
        let is_status = NICK_SUFFIXES.contains(&suffix)
            || (!suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()));
        if is_status {
            base = &base[..pos];
        }
    }
    base.trim_matches(is_separator)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}
