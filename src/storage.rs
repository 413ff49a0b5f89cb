use anyhow::{bail, Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::{Path, PathBuf};

use crate::graph::{Event, KnowledgeGraph, Person, Relationship};
use crate::session::{ChatMessage, Role};

/// File name of the chat transcript kept next to a JSON snapshot
pub const CHAT_HISTORY_FILE: &str = "chat_history.json";

/// Durable home of the graph snapshot and the chat transcript.
///
/// `save` overwrites the previous snapshot. `load` never fails: a missing,
/// empty or unreadable snapshot is reported and treated as an empty graph.
pub trait GraphStore: Send + Sync {
    /// Load the snapshot, surfacing any read or decode error
    fn try_load(&self) -> Result<KnowledgeGraph>;

    /// Replace the stored snapshot with `graph`
    fn save(&self, graph: &KnowledgeGraph) -> Result<()>;

    fn try_load_history(&self) -> Result<Vec<ChatMessage>>;

    fn save_history(&self, history: &[ChatMessage]) -> Result<()>;

    /// Where the snapshot lives, for log messages
    fn location(&self) -> &Path;

    fn load(&self) -> KnowledgeGraph {
        match self.try_load() {
            Ok(graph) => graph,
            Err(err) => {
                tracing::warn!(
                    path = %self.location().display(),
                    error = %format!("{err:#}"),
                    "Could not load knowledge graph, starting fresh"
                );
                KnowledgeGraph::default()
            }
        }
    }

    fn load_history(&self) -> Vec<ChatMessage> {
        match self.try_load_history() {
            Ok(history) => history,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "Could not load chat history, starting fresh");
                Vec::new()
            }
        }
    }

    /// Full reset: empty graph and empty transcript
    fn reset(&self) -> Result<()> {
        self.save(&KnowledgeGraph::default())?;
        self.save_history(&[])?;
        tracing::info!(path = %self.location().display(), "All data cleared");
        Ok(())
    }
}

/// Snapshot format, picked from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite,
    Json,
}

/// Validate snapshot file path (extension must be .db or .json)
pub fn store_kind(path: &Path) -> Result<StoreKind> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("db") => Ok(StoreKind::Sqlite),
        Some("json") => Ok(StoreKind::Json),
        Some(_) => bail!("Invalid snapshot file extension (must be .db or .json)"),
        None => bail!("Snapshot path must have a .db or .json extension"),
    }
}

/// Open the store matching the path's extension
pub fn open_store(path: &Path) -> Result<Box<dyn GraphStore>> {
    Ok(match store_kind(path)? {
        StoreKind::Sqlite => Box::new(SqliteStore::open(path)?),
        StoreKind::Json => Box::new(JsonFileStore::open(path)?),
    })
}

// ---------------------------------------------------------------------------
// SQLite snapshot
// ---------------------------------------------------------------------------

// `position` keeps insertion order so a load/save cycle is lossless.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS persons (
    position INTEGER PRIMARY KEY NOT NULL,
    id TEXT NOT NULL,
    name TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS events (
    position INTEGER PRIMARY KEY NOT NULL,
    id TEXT NOT NULL,
    description TEXT NOT NULL,
    attendees TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS relationships (
    position INTEGER PRIMARY KEY NOT NULL,
    source TEXT NOT NULL,
    target TEXT NOT NULL,
    rel_type TEXT NOT NULL,
    context TEXT
) STRICT;

CREATE TABLE IF NOT EXISTS chat_messages (
    position INTEGER PRIMARY KEY NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL
) STRICT;

CREATE INDEX IF NOT EXISTS idx_persons_id ON persons(id);
CREATE INDEX IF NOT EXISTS idx_events_id ON events(id);
CREATE INDEX IF NOT EXISTS idx_relationships_triple ON relationships(source, target, rel_type);
"#;

pub struct SqliteStore {
    path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open or create database with connection pool
    pub fn open(path: &Path) -> Result<Self> {
        if store_kind(path)? != StoreKind::Sqlite {
            bail!("Invalid database file extension (must be .db)");
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("Failed to create connection pool")?;

        {
            let conn = pool.get().context("Failed to get connection from pool")?;

            // WAL mode for concurrent reads
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;

            conn.execute_batch(SCHEMA)?;
        }

        Ok(Self { path: path.to_path_buf(), pool })
    }
}

impl GraphStore for SqliteStore {
    fn try_load(&self) -> Result<KnowledgeGraph> {
        let conn = self.pool.get()
            .context("Failed to get database connection from pool")?;

        let mut persons = Vec::new();
        let mut stmt = conn.prepare("SELECT id, name FROM persons ORDER BY position")?;
        let rows = stmt.query_map([], |row| {
            Ok(Person { id: row.get(0)?, name: row.get(1)? })
        })?;
        for row in rows {
            persons.push(row?);
        }

        let mut events = Vec::new();
        let mut stmt = conn.prepare("SELECT id, description, attendees FROM events ORDER BY position")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (id, description, attendees_json) = row?;
            let attendees: Vec<String> = serde_json::from_str(&attendees_json)
                .with_context(|| format!("Corrupted attendees data for event '{}'", id))?;
            events.push(Event { id, description, attendees });
        }

        let mut relationships = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT source, target, rel_type, context FROM relationships ORDER BY position"
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Relationship {
                source: row.get(0)?,
                target: row.get(1)?,
                rel_type: row.get(2)?,
                context: row.get(3)?,
            })
        })?;
        for row in rows {
            relationships.push(row?);
        }

        Ok(KnowledgeGraph { persons, events, relationships })
    }

    /// Replace the snapshot in a single transaction
    fn save(&self, graph: &KnowledgeGraph) -> Result<()> {
        let conn = self.pool.get()
            .context("Failed to get database connection from pool")?;
        let tx = conn.unchecked_transaction()
            .context("Failed to start transaction for saving graph")?;

        tx.execute_batch("DELETE FROM persons; DELETE FROM events; DELETE FROM relationships;")
            .context("Failed to clear previous snapshot")?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO persons (position, id, name) VALUES (?1, ?2, ?3)"
            )
            .context("Failed to prepare insert statement for persons")?;
            for (position, person) in graph.persons.iter().enumerate() {
                stmt.execute(params![position as i64, &person.id, &person.name])
                    .with_context(|| format!("Failed to insert person '{}'", person.id))?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO events (position, id, description, attendees) VALUES (?1, ?2, ?3, ?4)"
            )
            .context("Failed to prepare insert statement for events")?;
            for (position, event) in graph.events.iter().enumerate() {
                let attendees_json = serde_json::to_string(&event.attendees)
                    .with_context(|| format!("Failed to serialize attendees for event '{}'", event.id))?;
                stmt.execute(params![position as i64, &event.id, &event.description, &attendees_json])
                    .with_context(|| format!("Failed to insert event '{}'", event.id))?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO relationships (position, source, target, rel_type, context) VALUES (?1, ?2, ?3, ?4, ?5)"
            )
            .context("Failed to prepare insert statement for relationships")?;
            for (position, rel) in graph.relationships.iter().enumerate() {
                stmt.execute(params![position as i64, &rel.source, &rel.target, &rel.rel_type, &rel.context])
                    .with_context(|| format!(
                        "Failed to insert relationship '{}' -[{}]-> '{}'",
                        rel.source, rel.rel_type, rel.target
                    ))?;
            }
        }

        tx.commit()
            .context("Failed to commit transaction for saving graph")?;
        tracing::info!(path = %self.path.display(), "Knowledge graph saved");
        Ok(())
    }

    fn try_load_history(&self) -> Result<Vec<ChatMessage>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT role, content FROM chat_messages ORDER BY position")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (role, content) = row?;
            let role = role.parse::<Role>()
                .with_context(|| format!("Corrupted chat history role '{}'", role))?;
            history.push(ChatMessage { role, content });
        }
        Ok(history)
    }

    fn save_history(&self, history: &[ChatMessage]) -> Result<()> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM chat_messages", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO chat_messages (position, role, content) VALUES (?1, ?2, ?3)"
            )?;
            for (position, message) in history.iter().enumerate() {
                stmt.execute(params![position as i64, message.role.as_str(), &message.content])?;
            }
        }
        tx.commit()
            .context("Failed to commit transaction for saving chat history")?;
        Ok(())
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// JSON document snapshot
// ---------------------------------------------------------------------------

/// Pretty-printed `{persons, events, relationships}` document on disk
pub struct JsonFileStore {
    path: PathBuf,
    history_path: PathBuf,
}

impl JsonFileStore {
    pub fn open(path: &Path) -> Result<Self> {
        if store_kind(path)? != StoreKind::Json {
            bail!("Invalid snapshot file extension (must be .json)");
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let history_path = path
            .parent()
            .map(|p| p.join(CHAT_HISTORY_FILE))
            .unwrap_or_else(|| PathBuf::from(CHAT_HISTORY_FILE));
        Ok(Self { path: path.to_path_buf(), history_path })
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }
}

/// Write through a temp file so a crash never leaves half a snapshot
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write '{}'", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace '{}'", path.display()))?;
    Ok(())
}

/// Read a file that may not exist yet; `None` for missing or blank files
fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(None),
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read '{}'", path.display())),
    }
}

impl GraphStore for JsonFileStore {
    fn try_load(&self) -> Result<KnowledgeGraph> {
        let Some(text) = read_optional(&self.path)? else {
            tracing::info!(path = %self.path.display(), "No snapshot found, using a new empty graph");
            return Ok(KnowledgeGraph::default());
        };
        // `{}` and `null` count as empty, like a blank file
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("Corrupted snapshot '{}'", self.path.display()))?;
        if value.is_null() || value.as_object().is_some_and(|o| o.is_empty()) {
            return Ok(KnowledgeGraph::default());
        }
        serde_json::from_value(value)
            .with_context(|| format!("Invalid snapshot structure in '{}'", self.path.display()))
    }

    fn save(&self, graph: &KnowledgeGraph) -> Result<()> {
        let text = serde_json::to_string_pretty(graph)
            .context("Failed to serialize knowledge graph")?;
        write_atomic(&self.path, &text)?;
        tracing::info!(path = %self.path.display(), "Knowledge graph saved");
        Ok(())
    }

    fn try_load_history(&self) -> Result<Vec<ChatMessage>> {
        match read_optional(&self.history_path)? {
            Some(text) => serde_json::from_str(&text)
                .with_context(|| format!("Invalid chat history in '{}'", self.history_path.display())),
            None => Ok(Vec::new()),
        }
    }

    fn save_history(&self, history: &[ChatMessage]) -> Result<()> {
        let text = serde_json::to_string_pretty(history)
            .context("Failed to serialize chat history")?;
        write_atomic(&self.history_path, &text)
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> KnowledgeGraph {
        KnowledgeGraph {
            persons: vec![Person::new("zoe", "Zoe"), Person::new("adam", "Adam")],
            events: vec![Event {
                id: "picnic".into(),
                description: "Picnic in the park".into(),
                attendees: vec!["zoe".into(), "adam".into()],
            }],
            relationships: vec![
                Relationship {
                    source: "zoe".into(),
                    target: "picnic".into(),
                    rel_type: "ATTENDED".into(),
                    context: Some("brought cake".into()),
                },
                Relationship {
                    source: "adam".into(),
                    target: "zoe".into(),
                    rel_type: "KNOWS".into(),
                    context: None,
                },
            ],
        }
    }

    #[test]
    fn extension_selects_store() {
        assert_eq!(store_kind(Path::new("a/kg.db")).unwrap(), StoreKind::Sqlite);
        assert_eq!(store_kind(Path::new("kg.json")).unwrap(), StoreKind::Json);
        assert!(store_kind(Path::new("kg.txt")).is_err());
        assert!(store_kind(Path::new("kg")).is_err());
    }

    #[test]
    fn sqlite_round_trip_keeps_order() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("kg.db")).unwrap();
        assert!(store.load().is_empty());

        store.save(&sample()).unwrap();
        assert_eq!(store.load(), sample());

        // overwrite, not append
        let mut smaller = sample();
        smaller.relationships.pop();
        store.save(&smaller).unwrap();
        assert_eq!(store.load(), smaller);
    }

    #[test]
    fn json_round_trip_is_byte_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kg.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.save(&sample()).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        let loaded = store.load();
        assert_eq!(loaded, sample());
        store.save(&loaded).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn json_missing_empty_and_corrupt_load_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kg.json");
        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.load().is_empty());

        std::fs::write(&path, "").unwrap();
        assert!(store.load().is_empty());

        std::fs::write(&path, "{}").unwrap();
        assert!(store.load().is_empty());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(store.try_load().is_err());
        assert!(store.load().is_empty());

        std::fs::write(&path, r#"{"persons": 5}"#).unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn history_round_trip_and_reset() {
        let dir = TempDir::new().unwrap();
        let history = vec![
            ChatMessage::new(Role::User, "Alice met Bob"),
            ChatMessage::new(Role::Assistant, "Okay"),
        ];

        let stores: Vec<Box<dyn GraphStore>> = vec![
            open_store(&dir.path().join("kg.db")).unwrap(),
            open_store(&dir.path().join("kg.json")).unwrap(),
        ];
        for store in stores {
            store.save(&sample()).unwrap();
            store.save_history(&history).unwrap();
            assert_eq!(store.load_history(), history);

            store.reset().unwrap();
            assert!(store.load().is_empty());
            assert!(store.load_history().is_empty());
        }
    }

    #[test]
    fn json_history_lives_next_to_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(&dir.path().join("nested/kg.json")).unwrap();
        assert_eq!(store.history_path(), dir.path().join("nested").join(CHAT_HISTORY_FILE));
        store.save_history(&[ChatMessage::new(Role::User, "hi")]).unwrap();
        assert!(store.history_path().exists());
    }
}
