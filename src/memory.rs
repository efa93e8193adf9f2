//! Entity-keyed observation memory
//!
//! The whole document lives in one JSON file:
//!
//! ```json
//! { "entities": { "Leon": { "observations": [ { "content": "...", "timestamp": "..." } ] } } }
//! ```
//!
//! Every read loads the file fresh and every write replaces it atomically
//! (temp file in the same directory, then rename). A single writer is assumed.
//! Timestamps are written as RFC 3339; naive ISO 8601 timestamps are read as
//! local time. A document that cannot be parsed is moved aside before the
//! next write, never overwritten.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::MemoryConfig;
use crate::{Error, Result};

/// Entity key for the companion the robot talks to
pub const COMPANION: &str = "Leon";
/// Entity key for observations about the robot itself
pub const SELF: &str = "self";
/// Entity key for observations about the surroundings
pub const ENVIRONMENT: &str = "environment";
/// Entity key for everything else
pub const GENERAL: &str = "general";

const ENVIRONMENT_KEYWORDS: &[&str] = &[
    "hittade", "såg", "rummet", "under", "bakom", "golvet", "bordet",
];

/// Rendering order and headers for the prompt
const PRIORITY: &[(&str, &str)] = &[
    (COMPANION, "Du minns om Leon:"),
    (SELF, "Du minns om dig själv:"),
    (ENVIRONMENT, "Du minns om rummet:"),
    (GENERAL, "Du minns:"),
];

/// A single remembered fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub content: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Local>,
}

fn deserialize_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<DateTime<Local>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

/// RFC 3339, or a naive ISO 8601 timestamp taken as local time
fn parse_timestamp(raw: &str) -> Option<DateTime<Local>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Local));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| Some(Local.from_utc_datetime(&naive)))
}

/// Observations grouped under one entity, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(default)]
    pub observations: Vec<Observation>,
}

/// The persisted memory document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDocument {
    #[serde(default)]
    pub entities: BTreeMap<String, Entity>,
}

impl MemoryDocument {
    /// Total observations across all entities
    #[must_use]
    pub fn observation_count(&self) -> usize {
        self.entities.values().map(|e| e.observations.len()).sum()
    }
}

/// Result of reading the backing file
enum Loaded {
    Missing,
    Document(MemoryDocument),
    /// Present but not readable as a memory document
    Unreadable,
}

/// File-backed memory store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    path: PathBuf,
    max_per_entity: usize,
    max_in_prompt: usize,
    recent_per_entity: usize,
}

impl MemoryStore {
    /// Create a store over the configured file
    #[must_use]
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            path: config.path.clone(),
            max_per_entity: config.max_per_entity.max(1),
            max_in_prompt: config.max_in_prompt,
            recent_per_entity: config.recent_per_entity,
        }
    }

    /// Path of the backing document
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; a missing or corrupt file reads as empty
    #[must_use]
    pub fn load(&self) -> MemoryDocument {
        match self.read() {
            Loaded::Document(doc) => doc,
            Loaded::Missing | Loaded::Unreadable => MemoryDocument::default(),
        }
    }

    fn read(&self) -> Loaded {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no memory file, starting fresh");
                return Loaded::Missing;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read memory");
                return Loaded::Unreadable;
            }
        };

        match serde_json::from_str::<MemoryDocument>(&content) {
            Ok(doc) => {
                tracing::debug!(
                    entities = doc.entities.len(),
                    observations = doc.observation_count(),
                    "loaded memory"
                );
                Loaded::Document(doc)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "corrupt memory file, ignoring");
                Loaded::Unreadable
            }
        }
    }

    /// Append an observation under `entity`, pruning the oldest beyond the cap
    ///
    /// Blank observations are skipped. An unreadable document is renamed to a
    /// `.corrupt-<time>.json` backup first.
    ///
    /// # Errors
    ///
    /// Returns error if the document cannot be written, or an unreadable
    /// document cannot be moved aside
    pub fn add_observation(&self, entity: &str, observation: &str) -> Result<()> {
        let content = observation.trim();
        if content.is_empty() {
            tracing::debug!(entity, "skipping empty observation");
            return Ok(());
        }

        let mut doc = match self.read() {
            Loaded::Document(doc) => doc,
            Loaded::Missing => MemoryDocument::default(),
            Loaded::Unreadable => {
                self.back_up()?;
                MemoryDocument::default()
            }
        };
        let entry = doc.entities.entry(entity.to_string()).or_insert_with(|| {
            tracing::info!(entity, "creating memory entity");
            Entity::default()
        });
        entry.observations.push(Observation {
            content: content.to_string(),
            timestamp: Local::now(),
        });

        let len = entry.observations.len();
        if len > self.max_per_entity {
            let pruned = len - self.max_per_entity;
            entry.observations.drain(..pruned);
            tracing::debug!(entity, pruned, "pruned old observations");
        }

        self.save(&doc)?;
        tracing::info!(entity, observation = content, "memory added");
        Ok(())
    }

    /// Like [`MemoryStore::add_observation`], filing under the canonical key
    /// for a user-typed entity name
    ///
    /// Returns the key used.
    ///
    /// # Errors
    ///
    /// Returns error if the document cannot be written
    pub fn remember(&self, entity: &str, observation: &str) -> Result<String> {
        let key = normalize_entity(entity);
        self.add_observation(&key, observation)?;
        Ok(key)
    }

    fn back_up(&self) -> Result<()> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let backup = self.path.with_extension(format!("corrupt-{stamp}.json"));
        std::fs::rename(&self.path, &backup).map_err(|e| {
            Error::Memory(format!(
                "refusing to overwrite unreadable {}: {e}",
                self.path.display()
            ))
        })?;
        tracing::warn!(backup = %backup.display(), "moved unreadable memory file aside");
        Ok(())
    }

    /// Render remembered facts for the system prompt
    ///
    /// Entities appear in priority order (companion, self, environment,
    /// general) followed by any other entity alphabetically. Only the most
    /// recent observations of each entity are shown and the total is capped.
    #[must_use]
    pub fn format_for_prompt(&self) -> String {
        render_for_prompt(&self.load(), self.recent_per_entity, self.max_in_prompt)
    }

    fn save(&self, doc: &MemoryDocument) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(doc)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Memory(format!("failed to replace memory file: {e}")))?;
        Ok(())
    }
}

/// Render a document the way [`MemoryStore::format_for_prompt`] does
#[must_use]
pub fn render_for_prompt(doc: &MemoryDocument, recent_per_entity: usize, max_total: usize) -> String {
    let mut order: Vec<(&str, String)> = PRIORITY
        .iter()
        .map(|(key, header)| (*key, (*header).to_string()))
        .collect();
    for key in doc.entities.keys() {
        if !PRIORITY.iter().any(|(k, _)| k == key) {
            order.push((key.as_str(), format!("Du minns om {key}:")));
        }
    }

    let mut sections = Vec::new();
    let mut total = 0;
    for (key, header) in order {
        if total >= max_total {
            break;
        }
        let Some(entity) = doc.entities.get(key) else {
            continue;
        };
        if entity.observations.is_empty() {
            continue;
        }

        let start = entity.observations.len().saturating_sub(recent_per_entity);
        let mut lines = vec![header];
        for obs in &entity.observations[start..] {
            if total >= max_total {
                break;
            }
            lines.push(format!("- {}", obs.content));
            total += 1;
        }
        if lines.len() > 1 {
            sections.push(lines.join("\n"));
        }
    }

    sections.join("\n\n")
}

/// Map a tagged entity name onto its canonical key
#[must_use]
pub fn normalize_entity(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    match lower.as_str() {
        "leon" => COMPANION.to_string(),
        "env" | "environment" | "rummet" | "rum" => ENVIRONMENT.to_string(),
        "self" | "jag" | "själv" | "mig" => SELF.to_string(),
        "general" => GENERAL.to_string(),
        _ => capitalize(&lower),
    }
}

/// Guess the entity of an untagged observation from lexical cues
///
/// Returns the entity key and the observation with any leading subject
/// token removed.
#[must_use]
pub fn detect_entity(text: &str) -> (String, String) {
    let text = text.trim();
    let lower = text.to_lowercase();

    if lower.starts_with("leon") {
        for prefix in ["leon's ", "leons ", "leon "] {
            if lower.starts_with(prefix) {
                return (COMPANION.to_string(), text[prefix.len()..].trim().to_string());
            }
        }
        return (COMPANION.to_string(), text.to_string());
    }

    if lower.starts_with("jag ") {
        return (SELF.to_string(), text[4..].trim().to_string());
    }

    if ENVIRONMENT_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return (ENVIRONMENT.to_string(), text.to_string());
    }

    (GENERAL.to_string(), text.to_string())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, max_per_entity: usize) -> MemoryStore {
        MemoryStore::new(&MemoryConfig {
            path: dir.join("memory.json"),
            max_per_entity,
            max_in_prompt: 15,
            recent_per_entity: 5,
        })
    }

    #[test]
    fn test_add_creates_entity_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 20);

        tokio_test::assert_ok!(store.add_observation("Leon", "gillar dinosaurier"));

        let doc = store.load();
        let leon = &doc.entities["Leon"];
        assert_eq!(leon.observations.len(), 1);
        assert_eq!(leon.observations[0].content, "gillar dinosaurier");
    }

    #[test]
    fn test_pruning_keeps_most_recent_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);

        for i in 0..7 {
            store.add_observation("self", &format!("obs {i}")).unwrap();
        }

        let contents: Vec<_> = store.load().entities["self"]
            .observations
            .iter()
            .map(|o| o.content.clone())
            .collect();
        assert_eq!(contents, vec!["obs 4", "obs 5", "obs 6"]);
    }

    #[test]
    fn test_empty_observation_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 20);

        store.add_observation("Leon", "   ").unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_file_reads_empty_and_is_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 20);
        std::fs::write(store.path(), "{not json").unwrap();

        assert_eq!(store.load(), MemoryDocument::default());
        store.add_observation("Leon", "är 9 år").unwrap();
        assert_eq!(store.load().observation_count(), 1);

        let backups: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok()?.file_name().into_string().ok())
            .filter(|name| name.starts_with("memory.corrupt-"))
            .collect();
        assert_eq!(backups.len(), 1);
        let kept = std::fs::read_to_string(dir.path().join(&backups[0])).unwrap();
        assert_eq!(kept, "{not json");
    }

    #[test]
    fn test_naive_timestamps_load_and_survive_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 20);
        std::fs::write(
            store.path(),
            r#"{"entities": {"Leon": {"observations": [
                {"content": "gillar dinosaurier", "timestamp": "2025-01-04T15:22:10.123456"}
            ]}}}"#,
        )
        .unwrap();

        let doc = store.load();
        let leon = &doc.entities["Leon"].observations;
        assert_eq!(leon.len(), 1);
        assert_eq!(
            leon[0].timestamp.naive_local().to_string(),
            "2025-01-04 15:22:10.123456"
        );
        assert!(store.format_for_prompt().contains("- gillar dinosaurier"));

        store.add_observation("Leon", "har en katt").unwrap();
        let contents: Vec<_> = store.load().entities["Leon"]
            .observations
            .iter()
            .map(|o| o.content.clone())
            .collect();
        assert_eq!(contents, vec!["gillar dinosaurier", "har en katt"]);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2025-01-04T15:22:10+01:00").is_some());
        assert!(parse_timestamp("2025-01-04T15:22:10").is_some());
        assert!(parse_timestamp("2025-01-04 15:22:10.5").is_some());
        assert!(parse_timestamp("igår").is_none());
    }

    #[test]
    fn test_format_priority_order_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 20);
        store.add_observation("general", "det regnade").unwrap();
        store.add_observation("Max", "byggde roboten").unwrap();
        store.add_observation("environment", "soffan är blå").unwrap();
        store.add_observation("Leon", "gillar matte").unwrap();

        let first = store.format_for_prompt();
        let second = store.format_for_prompt();
        assert_eq!(first, second);

        let leon = first.find("Du minns om Leon:").unwrap();
        let room = first.find("Du minns om rummet:").unwrap();
        let general = first.find("Du minns:").unwrap();
        let max = first.find("Du minns om Max:").unwrap();
        assert!(leon < room && room < general && general < max);
    }

    #[test]
    fn test_format_caps_totals() {
        let mut doc = MemoryDocument::default();
        for key in ["Leon", "self", "environment", "general"] {
            let entity = doc.entities.entry(key.to_string()).or_default();
            for i in 0..8 {
                entity.observations.push(Observation {
                    content: format!("{key} {i}"),
                    timestamp: Local::now(),
                });
            }
        }

        let text = render_for_prompt(&doc, 5, 12);
        assert_eq!(text.lines().filter(|l| l.starts_with("- ")).count(), 12);
        assert!(text.contains("- Leon 3"));
        assert!(!text.contains("- Leon 2"));
        assert!(!text.contains("Du minns:"));
    }

    #[test]
    fn test_empty_document_renders_empty() {
        assert_eq!(render_for_prompt(&MemoryDocument::default(), 5, 15), "");
    }

    #[test]
    fn test_remember_files_under_canonical_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 20);

        assert_eq!(store.remember("leon", "gillar bilar").unwrap(), "Leon");
        store.remember("Leon", "har en katt").unwrap();
        store.remember("rum", "soffan är blå").unwrap();

        let doc = store.load();
        assert_eq!(doc.entities.len(), 2);
        assert_eq!(doc.entities["Leon"].observations.len(), 2);
        assert!(doc.entities.contains_key("environment"));
    }

    #[test]
    fn test_normalize_entity() {
        assert_eq!(normalize_entity("leon"), "Leon");
        assert_eq!(normalize_entity("rummet"), "environment");
        assert_eq!(normalize_entity("JAG"), "self");
        assert_eq!(normalize_entity("oscar"), "Oscar");
    }

    #[test]
    fn test_detect_entity() {
        assert_eq!(
            detect_entity("Leons favoritfärg är grön"),
            ("Leon".to_string(), "favoritfärg är grön".to_string())
        );
        assert_eq!(
            detect_entity("jag gillar att köra fort"),
            ("self".to_string(), "gillar att köra fort".to_string())
        );
        assert_eq!(
            detect_entity("hittade en strumpa under soffan").0,
            "environment"
        );
        assert_eq!(detect_entity("det är tisdag").0, "general");
    }
}
