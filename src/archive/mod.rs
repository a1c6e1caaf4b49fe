//! Searchable archive of old IRC logs.
//!
//! mIRC logs are parsed into sessions, chunked, embedded and stored in their own
//! collection, separate from the live channel index. Nothing here expires.

use crate::config::Config;
use crate::llm::Embedder;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod chunk;
pub mod memory;
pub mod mirc;
pub mod nicks;
pub mod qdrant;

pub use chunk::{chunk_session, ArchiveChunk};
pub use memory::InMemoryArchiveStore;
pub use mirc::{LogSession, MircParser};
pub use nicks::NickMap;
pub use qdrant::QdrantArchiveStore;

const LOG_EXTENSION: &str = "log";

#[derive(Debug, Clone)]
pub struct ArchivePoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub chunk: ArchiveChunk,
}

#[derive(Debug, Clone)]
pub struct ArchiveHit {
    pub chunk: ArchiveChunk,
    pub score: f32,
}

/// Payload filter for archive searches. Participant nicks match if any of them spoke.
#[derive(Debug, Clone, Default)]
pub struct ArchiveFilter {
    pub year: Option<i32>,
    pub channel: Option<String>,
    pub participants: Vec<String>,
    /// Every word must appear in the chunk text.
    pub keyword: Option<String>,
    pub limit: usize,
    pub score_threshold: Option<f32>,
}

impl ArchiveFilter {
    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_participants(mut self, nicks: Vec<String>) -> Self {
        self.participants = nicks;
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn matches(&self, chunk: &ArchiveChunk) -> bool {
        if self.year.is_some() && chunk.year != self.year {
            return false;
        }
        if let Some(channel) = &self.channel {
            if chunk.channel.as_ref() != Some(channel) {
                return false;
            }
        }
        if !self.participants.is_empty()
            && !chunk.participants.iter().any(|p| self.participants.contains(p))
        {
            return false;
        }
        if let Some(keyword) = &self.keyword {
            let words = text_tokens(&chunk.text);
            if !text_tokens(keyword).iter().all(|w| words.contains(w)) {
                return false;
            }
        }
        true
    }
}

/// Lowercased words of 2 to 20 characters, matching the full-text index settings.
pub(crate) fn text_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| (2..=20).contains(&w.chars().count()))
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn upsert(&self, points: Vec<ArchivePoint>) -> anyhow::Result<()>;

    /// Nearest chunks to `vector` matching `filter`, best first.
    async fn search(&self, vector: Vec<f32>, filter: ArchiveFilter)
        -> anyhow::Result<Vec<ArchiveHit>>;

    async fn count(&self) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveSettings {
    /// Sessions shorter than this are not archived.
    pub min_session_messages: usize,
    /// Chunks shorter than this are dropped.
    pub min_chunk_messages: usize,
    pub upsert_batch_size: usize,
    pub embed_batch_size: usize,
    pub search_limit: usize,
    pub score_threshold: f32,
}

impl ArchiveSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            search_limit: config.history_search_limit,
            score_threshold: config.history_score_threshold,
            ..Self::default()
        }
    }
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            min_session_messages: 2,
            min_chunk_messages: 3,
            upsert_batch_size: 100,
            embed_batch_size: 50,
            search_limit: 5,
            score_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub files: usize,
    pub sessions: usize,
    pub chunks: usize,
    pub indexed: usize,
    pub unreadable: usize,
}

pub struct HistoryArchive {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn ArchiveStore>,
    nicks: NickMap,
    parser: MircParser,
    settings: ArchiveSettings,
}

impl HistoryArchive {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ArchiveStore>,
        nicks: NickMap,
        settings: ArchiveSettings,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            embedder,
            store,
            nicks,
            parser: MircParser::new()?,
            settings,
        })
    }

    pub fn nicks(&self) -> &NickMap {
        &self.nicks
    }

    pub fn settings(&self) -> &ArchiveSettings {
        &self.settings
    }

    /// Parses and chunks one log file, applying the session and chunk minimums.
    pub fn chunk_log(&self, file_name: &str, content: &str) -> (usize, Vec<ArchiveChunk>) {
        let sessions: Vec<LogSession> = self
            .parser
            .parse(file_name, content)
            .into_iter()
            .filter(|s| s.messages.len() >= self.settings.min_session_messages)
            .collect();
        let chunks = sessions
            .iter()
            .flat_map(chunk_session)
            .filter(|c| c.message_count >= self.settings.min_chunk_messages)
            .collect();
        (sessions.len(), chunks)
    }

    /// Imports every `*.log` file under `dir`. Unreadable files are skipped. A failing
    /// embed or upsert stops the import; the error says how many chunks were stored.
    pub async fn ingest_dir(&self, dir: &Path) -> anyhow::Result<IngestReport> {
        let root = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || find_logs(&root)).await??;
        info!("Archive: importing {} log files from {}", files.len(), dir.display());

        let mut report = IngestReport {
            files: files.len(),
            ..Default::default()
        };
        for path in files {
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!("Archive: cannot read {}: {}", path.display(), e);
                    report.unreadable += 1;
                    continue;
                }
            };
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (sessions, chunks) = self.chunk_log(&file_name, &String::from_utf8_lossy(&bytes));
            debug!(
                "Archive: {} gave {} sessions, {} chunks",
                file_name,
                sessions,
                chunks.len()
            );
            report.sessions += sessions;
            report.chunks += chunks.len();
            let indexed_so_far = report.indexed;
            let stored = self.ingest(chunks).await.map_err(|e| {
                anyhow::anyhow!(
                    "import stopped at {} after {} chunks: {}",
                    file_name,
                    indexed_so_far,
                    e
                )
            })?;
            report.indexed += stored;
        }
        info!(
            "Archive: imported {} chunks from {} sessions in {} files",
            report.indexed, report.sessions, report.files
        );
        Ok(report)
    }

    /// Embeds and stores chunks in batches. Returns the number stored.
    pub async fn ingest(&self, chunks: Vec<ArchiveChunk>) -> anyhow::Result<usize> {
        let mut stored = 0;
        for batch in chunks.chunks(self.settings.upsert_batch_size.max(1)) {
            let mut vectors = Vec::with_capacity(batch.len());
            for texts in batch.chunks(self.settings.embed_batch_size.max(1)) {
                let embedded = self
                    .embedder
                    .embed(texts.iter().map(|c| c.text.clone()).collect())
                    .await?;
                if embedded.len() != texts.len() {
                    anyhow::bail!(
                        "embedding count mismatch: sent {}, got {}",
                        texts.len(),
                        embedded.len()
                    );
                }
                vectors.extend(embedded);
            }

            let points: Vec<ArchivePoint> = batch
                .iter()
                .cloned()
                .zip(vectors)
                .map(|(chunk, vector)| ArchivePoint {
                    id: chunk.point_id(),
                    vector,
                    chunk,
                })
                .collect();
            self.store.upsert(points).await?;
            stored += batch.len();
        }
        Ok(stored)
    }

    /// Semantic search over the archive. An empty query returns nothing.
    pub async fn search(
        &self,
        query: &str,
        filter: ArchiveFilter,
    ) -> anyhow::Result<Vec<ArchiveHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = self
            .embedder
            .embed(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No embedding returned"))?;

        let filter = ArchiveFilter {
            limit: if filter.limit == 0 {
                self.settings.search_limit
            } else {
                filter.limit
            },
            score_threshold: filter
                .score_threshold
                .or(Some(self.settings.score_threshold)),
            ..filter
        };
        self.store.search(vector, filter).await
    }

    pub async fn count(&self) -> anyhow::Result<usize> {
        self.store.count().await
    }

    /// One hit as a short quote with its source, year and mapped participants.
    pub fn describe(&self, hit: &ArchiveHit, max_chars: usize) -> String {
        let when = match (&hit.chunk.year, &hit.chunk.start_time) {
            (Some(year), Some(time)) => format!("{year}, {time}"),
            (Some(year), None) => year.to_string(),
            (None, _) => "undated".to_string(),
        };
        let who: Vec<String> = hit
            .chunk
            .participants
            .iter()
            .map(|nick| match self.nicks.user_for(nick) {
                Some(user) => format!("{nick} (<@{user}>)"),
                None => nick.clone(),
            })
            .collect();

        let mut quote: String = hit.chunk.text.chars().take(max_chars).collect();
        if hit.chunk.text.chars().count() > max_chars {
            quote.push_str("...");
        }
        format!(
            "**{}** · {} · {}\n```\n{}\n```",
            hit.chunk.source_label(),
            when,
            who.join(", "),
            quote
        )
    }
}

fn find_logs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|e| e == LOG_EXTENSION) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingEmbedder, FakeEmbedder};

    const RETRO_LOG: &str = "\
Session Start: Thu Mar 04 20:00:00 1999
[20:00] [alice] who still has the BeOS install cd
[20:01] [bob] I lent mine to carol
[20:02] (carol) it is on my shelf next to the modem
[20:03] [alice] bring it friday
Session Close: Thu Mar 04 20:30:00 1999
Session Start: Fri Mar 05 10:00:00 1999
[10:00] [dave] lone message
";

    const QUAKE_LOG: &str = "\
Session Start: Sat Jun 03 21:00:00 2000
[21:00] [dave] quake server is back up
[21:01] [erin] what map
[21:02] [dave] dm6 with railguns only
";

    const MAPPINGS: &str = r#"[
        { "discord": { "id": "111", "username": "alice" }, "irc_nicks": ["alice"] }
    ]"#;

    fn archive_with(embedder: Arc<dyn Embedder>) -> (HistoryArchive, Arc<InMemoryArchiveStore>) {
        let store = Arc::new(InMemoryArchiveStore::new());
        let archive = HistoryArchive::new(
            embedder,
            store.clone(),
            NickMap::from_json(MAPPINGS).unwrap(),
            ArchiveSettings {
                score_threshold: 0.0,
                ..ArchiveSettings::default()
            },
        )
        .unwrap();
        (archive, store)
    }

    #[tokio::test]
    async fn test_ingest_dir_imports_nested_logs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("#retro.EFnet.log"), RETRO_LOG).unwrap();
        std::fs::create_dir(dir.path().join("2000")).unwrap();
        std::fs::write(dir.path().join("2000").join("#quake.EFnet.log"), QUAKE_LOG).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a log").unwrap();

        let (archive, store) = archive_with(Arc::new(FakeEmbedder::new()));
        let report = archive.ingest_dir(dir.path()).await.unwrap();

        assert_eq!(report.files, 2);
        // The one-message session is below the session minimum.
        assert_eq!(report.sessions, 2);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.indexed, 2);
        assert_eq!(store.len(), 2);

        // Importing again overwrites the same points.
        archive.ingest_dir(dir.path()).await.unwrap();
        assert_eq!(archive.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_search_filters_on_year_and_participants() {
        let (archive, _store) = archive_with(Arc::new(FakeEmbedder::new()));
        let (_, mut chunks) = archive.chunk_log("#retro.EFnet.log", RETRO_LOG);
        chunks.extend(archive.chunk_log("#quake.EFnet.log", QUAKE_LOG).1);
        assert_eq!(archive.ingest(chunks).await.unwrap(), 2);

        let by_year = archive
            .search("install cd", ArchiveFilter::default().with_year(2000))
            .await
            .unwrap();
        assert_eq!(by_year.len(), 1);
        assert_eq!(by_year[0].chunk.channel.as_deref(), Some("#quake"));

        let nicks = archive.nicks().nicks_for("111").to_vec();
        let by_user = archive
            .search("quake server", ArchiveFilter::default().with_participants(nicks))
            .await
            .unwrap();
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].chunk.year, Some(1999));
        assert_eq!(by_user[0].chunk.decade.as_deref(), Some("1990s"));

        let by_word = archive
            .search("anything", ArchiveFilter::default().with_keyword("Railguns"))
            .await
            .unwrap();
        assert_eq!(by_word.len(), 1);

        assert!(archive
            .search("  ", ArchiveFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_describe_marks_mapped_participants() {
        let (archive, _store) = archive_with(Arc::new(FakeEmbedder::new()));
        let (_, chunks) = archive.chunk_log("#retro.EFnet.log", RETRO_LOG);
        let hit = ArchiveHit {
            chunk: chunks[0].clone(),
            score: 0.9,
        };

        let text = archive.describe(&hit, 20);
        assert!(text.starts_with("**#retro** · 1999, 20:00 · alice (<@111>), bob, carol"));
        assert!(text.contains("..."));
    }

    #[tokio::test]
    async fn test_embedding_failure_stops_ingest() {
        let (archive, store) = archive_with(Arc::new(FailingEmbedder));
        let (_, chunks) = archive.chunk_log("#retro.EFnet.log", RETRO_LOG);
        assert!(archive.ingest(chunks).await.is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_filter_matching() {
        let (archive, _store) = archive_with(Arc::new(FakeEmbedder::new()));
        let (_, chunks) = archive.chunk_log("#retro.EFnet.log", RETRO_LOG);
        let chunk = &chunks[0];

        assert!(ArchiveFilter::default().matches(chunk));
        assert!(ArchiveFilter::default().with_channel("#retro").matches(chunk));
        assert!(!ArchiveFilter::default().with_channel("#quake").matches(chunk));
        assert!(!ArchiveFilter::default().with_year(2000).matches(chunk));
        assert!(ArchiveFilter::default()
            .with_participants(vec!["zed".to_string(), "bob".to_string()])
            .matches(chunk));
        assert!(ArchiveFilter::default().with_keyword("beos cd").matches(chunk));
        assert!(!ArchiveFilter::default().with_keyword("beos floppy").matches(chunk));
    }
}
