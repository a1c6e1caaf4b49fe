use crate::db::{Database, FactRecord};
use crate::facts::{ExtractedMemory, ExtractionResult, FactBackend, FactHit};
use crate::llm::Completion;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// How many stored facts are considered when ranking a search.
const SEARCH_POOL: usize = 200;
const MAX_FACTS_PER_EXTRACTION: usize = 8;
const MAX_FACT_CHARS: usize = 280;

/// Extracts facts with the chat model and keeps them in SQLite.
pub struct SqliteFactStore {
    db: Database,
    llm: Arc<dyn Completion>,
}

impl SqliteFactStore {
    pub fn new(db: Database, llm: Arc<dyn Completion>) -> Self {
        Self { db, llm }
    }

    fn extraction_prompt(identity: &str, messages: &[String], known: &[FactRecord]) -> String {
        let subject = if identity.starts_with("channel:") {
            "this chat channel and its regular participants"
        } else {
            "this user"
        };
        let known = if known.is_empty() {
            "(none)".to_string()
        } else {
            known
                .iter()
                .map(|f| format!("- {}", f.memory))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "You extract durable facts about {subject} from a chat transcript. Keep only stable \
preferences, ongoing projects, recurring topics, decisions, and facts someone explicitly shared. \
Do NOT record secrets, credentials, health data, financial data, precise locations, or anything \
already listed under KNOWN FACTS. If there is nothing new, respond with exactly: NONE.\n\n\
KNOWN FACTS:\n{known}\n\n\
TRANSCRIPT:\n{}\n\n\
Return each new fact on its own line as a short bullet, at most {MAX_FACTS_PER_EXTRACTION} lines.",
            messages.join("\n")
        )
    }
}

#[async_trait]
impl FactBackend for SqliteFactStore {
    async fn add(
        &self,
        messages: Vec<String>,
        identity: &str,
        metadata: Value,
    ) -> anyhow::Result<ExtractionResult> {
        if messages.is_empty() {
            return Ok(ExtractionResult::default());
        }

        let identity_query = identity.to_string();
        let known = self
            .db
            .run_blocking(move |db| db.list_facts(&identity_query, SEARCH_POOL))
            .await?;

        let prompt = Self::extraction_prompt(identity, &messages, &known);
        let raw = self.llm.complete(&prompt).await?;

        let seen: HashSet<String> = known.iter().map(|f| f.memory.to_lowercase()).collect();
        let fresh: Vec<ExtractedMemory> = normalize_facts(&raw)
            .into_iter()
            .filter(|f| !seen.contains(&f.to_lowercase()))
            .map(|memory| ExtractedMemory {
                id: Uuid::new_v4().to_string(),
                memory,
            })
            .collect();
        if fresh.is_empty() {
            return Ok(ExtractionResult::default());
        }

        let identity = identity.to_string();
        let metadata = metadata.to_string();
        let to_store = fresh.clone();
        self.db
            .run_blocking(move |db| {
                let now = Utc::now();
                for fact in &to_store {
                    db.insert_fact(&fact.id, &identity, &fact.memory, Some(&metadata), now)?;
                }
                Ok(())
            })
            .await?;

        Ok(ExtractionResult {
            results: fresh,
            error: None,
        })
    }

    async fn search(
        &self,
        query: &str,
        identity: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<FactHit>> {
        let identity = identity.to_string();
        let facts = self
            .db
            .run_blocking(move |db| db.list_facts(&identity, SEARCH_POOL))
            .await?;
        Ok(rank_facts(query, facts, limit))
    }

    async fn get_all(&self, identity: &str, limit: usize) -> anyhow::Result<Vec<FactHit>> {
        let identity = identity.to_string();
        let facts = self
            .db
            .run_blocking(move |db| db.list_facts(&identity, limit))
            .await?;
        Ok(facts
            .into_iter()
            .map(|f| FactHit {
                id: f.id,
                memory: f.memory,
                score: 0.0,
            })
            .collect())
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Ranks by word overlap with the query; newest facts break ties and fill the
/// result when nothing overlaps.
fn rank_facts(query: &str, facts: Vec<FactRecord>, limit: usize) -> Vec<FactHit> {
    let query_terms = tokenize(query);
    let mut scored: Vec<(usize, FactHit)> = facts
        .into_iter()
        .enumerate()
        .map(|(recency, f)| {
            let terms = tokenize(&f.memory);
            let overlap = terms.intersection(&query_terms).count();
            let score = if terms.is_empty() {
                0.0
            } else {
                overlap as f32 / terms.len() as f32
            };
            (
                recency,
                FactHit {
                    id: f.id,
                    memory: f.memory,
                    score,
                },
            )
        })
        .collect();

    scored.sort_by(|(ra, a), (rb, b)| b.score.total_cmp(&a.score).then(ra.cmp(rb)));
    scored.into_iter().take(limit).map(|(_, hit)| hit).collect()
}

fn normalize_facts(raw: &str) -> Vec<String> {
    let text = raw.trim().replace('\r', "");
    if text.is_empty() {
        return Vec::new();
    }
    let upper = text.to_uppercase();
    if upper == "NONE" || upper.starts_with("NONE.") || upper.contains("NO_UPDATE") {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    text.lines()
        .map(|l| {
            l.trim()
                .trim_start_matches(|c: char| c == '-' || c == '*' || c == '•')
                .trim()
                .to_string()
        })
        .filter(|l| !l.is_empty())
        .filter(|l| {
            let upper = l.to_uppercase();
            !(upper.starts_with("FACTS:") || upper.starts_with("NEW FACTS:") || upper == "NONE")
        })
        .map(|l| truncate_chars(&l, MAX_FACT_CHARS))
        .filter(|l| seen.insert(l.to_lowercase()))
        .take(MAX_FACTS_PER_EXTRACTION)
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCompletion;
    use serde_json::json;

    fn store(response: &str) -> (SqliteFactStore, Arc<FakeCompletion>, Database) {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        let llm = Arc::new(FakeCompletion::new(response));
        (SqliteFactStore::new(db.clone(), llm.clone()), llm, db)
    }

    #[test]
    fn test_normalize_facts() {
        let raw = "NEW FACTS:\n- Plays chess on Fridays\n* Prefers Rust\n\n- plays chess on fridays\n";
        let facts = normalize_facts(raw);
        assert_eq!(facts, vec!["Plays chess on Fridays", "Prefers Rust"]);

        assert!(normalize_facts("NONE").is_empty());
        assert!(normalize_facts("  ").is_empty());

        let long = format!("- {}", "x".repeat(400));
        assert!(normalize_facts(&long)[0].ends_with("..."));
    }

    #[test]
    fn test_rank_facts_prefers_overlap_then_recency() {
        let now = Utc::now();
        let facts = vec![
            FactRecord {
                id: "new".to_string(),
                identity: "channel:1".to_string(),
                memory: "meets every friday".to_string(),
                created_at: now,
            },
            FactRecord {
                id: "old".to_string(),
                identity: "channel:1".to_string(),
                memory: "the group plays chess".to_string(),
                created_at: now,
            },
        ];
        let ranked = rank_facts("who plays chess here", facts.clone(), 2);
        assert_eq!(ranked[0].id, "old");
        assert!(ranked[0].score > 0.0);

        let ranked = rank_facts("unrelated", facts, 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "new");
    }

    #[tokio::test]
    async fn test_add_stores_new_facts_only() {
        let (store, llm, db) = store("- The group plays chess\n- Meets on Fridays");
        db.insert_fact("f0", "channel:1", "meets on fridays", None, Utc::now())
            .unwrap();

        let result = store
            .add(
                vec!["[alice]: chess tonight?".to_string()],
                "channel:1",
                json!({ "source": "test" }),
            )
            .await
            .unwrap();
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].memory, "The group plays chess");

        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("chat channel"));
        assert!(prompt.contains("- meets on fridays"));
        assert!(prompt.contains("[alice]: chess tonight?"));

        let all = store.get_all("channel:1", 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.get_all("user:1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_with_nothing_new() {
        let (store, _llm, _db) = store("NONE");
        let result = store
            .add(vec!["[bob]: hi".to_string()], "user:7", json!({}))
            .await
            .unwrap();
        assert!(result.results.is_empty());
        assert!(result.error.is_none());
    }
}
