//! SQLite content store shared by the reference agents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A mined document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub url: String,
    pub query: String,
    pub title: String,
    pub body: String,
    pub fetched_at: i64,
}

/// A named entity extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type", alias = "entity_type", default = "default_entity_type")]
    pub entity_type: String,
}

fn default_entity_type() -> String {
    "concept".to_string()
}

/// Handle to the content database. Each operation opens its own connection.
#[derive(Debug, Clone)]
pub struct ContentStore {
    path: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
        };
        store.connect()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path).map_err(|e| Error::Store(format!("sqlite open: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS content (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                query TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                fetched_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                content_id TEXT NOT NULL,
                name TEXT NOT NULL,
                entity_type TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entities_content ON entities(content_id);
            "#,
        )
        .map_err(|e| Error::Store(format!("sqlite init: {}", e)))?;
        Ok(conn)
    }

    pub fn insert_content(&self, url: &str, query: &str, title: &str, body: &str) -> Result<String> {
        let id = ulid::Ulid::new().to_string();
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO content (id, url, query, title, body, fetched_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, url, query, title, body, chrono::Utc::now().timestamp_millis()],
        )
        .map_err(|e| Error::Store(format!("sqlite insert content: {}", e)))?;
        Ok(id)
    }

    /// Most recently fetched documents first.
    pub fn list_content(&self, limit: usize) -> Result<Vec<ContentItem>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, url, query, title, body, fetched_at FROM content ORDER BY fetched_at DESC, id DESC LIMIT ?1",
            )
            .map_err(|e| Error::Store(format!("sqlite prepare list: {}", e)))?;
        let rows = stmt
            .query_map(params![limit as i64], content_from_row)
            .map_err(|e| Error::Store(format!("sqlite list content: {}", e)))?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(|e| Error::Store(format!("sqlite row: {}", e)))?);
        }
        Ok(items)
    }

    pub fn content_count(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM content", [], |row| row.get(0))
            .map_err(|e| Error::Store(format!("sqlite count: {}", e)))?;
        Ok(count as usize)
    }

    /// Documents ranked by how many of the query's keywords they contain.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<ContentItem>> {
        let keywords = keywords(query);
        if keywords.is_empty() {
            return Ok(vec![]);
        }

        let mut scored: Vec<(usize, ContentItem)> = self
            .list_content(usize::MAX >> 1)?
            .into_iter()
            .filter_map(|item| {
                let haystack = format!("{} {}", item.title, item.body).to_lowercase();
                let hits: usize = keywords.iter().map(|k| haystack.matches(k.as_str()).count()).sum();
                (hits > 0).then_some((hits, item))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(limit).map(|(_, item)| item).collect())
    }

    pub fn insert_entities(&self, content_id: &str, entities: &[Entity]) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Store(format!("sqlite begin: {}", e)))?;
        for entity in entities {
            tx.execute(
                "INSERT INTO entities (id, content_id, name, entity_type) VALUES (?1, ?2, ?3, ?4)",
                params![
                    ulid::Ulid::new().to_string(),
                    content_id,
                    entity.name,
                    entity.entity_type
                ],
            )
            .map_err(|e| Error::Store(format!("sqlite insert entity: {}", e)))?;
        }
        tx.commit()
            .map_err(|e| Error::Store(format!("sqlite commit: {}", e)))?;
        Ok(entities.len())
    }

    /// Entity counts per type.
    pub fn entity_types(&self) -> Result<BTreeMap<String, usize>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type")
            .map_err(|e| Error::Store(format!("sqlite prepare types: {}", e)))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| Error::Store(format!("sqlite entity types: {}", e)))?;

        let mut types = BTreeMap::new();
        for row in rows {
            let (entity_type, count) = row.map_err(|e| Error::Store(format!("sqlite row: {}", e)))?;
            types.insert(entity_type, count as usize);
        }
        Ok(types)
    }
}

fn content_from_row(row: &Row<'_>) -> rusqlite::Result<ContentItem> {
    Ok(ContentItem {
        id: row.get(0)?,
        url: row.get(1)?,
        query: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        fetched_at: row.get(5)?,
    })
}

/// Lowercased words of three or more characters.
fn keywords(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ContentStore) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(&dir.path().join("db").join("crew.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_insert_and_search() {
        let (_dir, store) = store();
        store
            .insert_content("https://a", "rust", "Rust ownership", "Ownership and borrowing rules")
            .unwrap();
        store
            .insert_content("https://b", "rust", "Cooking", "A recipe for soup")
            .unwrap();

        assert_eq!(store.content_count().unwrap(), 2);
        let hits = store.search("How does ownership work?", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://a");
        assert!(store.search("a ?", 5).unwrap().is_empty());
    }

    #[test]
    fn test_entity_types() {
        let (_dir, store) = store();
        let id = store.insert_content("https://a", "q", "t", "b").unwrap();
        let entities: Vec<Entity> = serde_json::from_str(
            r#"[{"name": "Mozilla", "type": "organization"}, {"name": "Rust", "type": "technology"}, {"name": "Cargo"}]"#,
        )
        .unwrap();
        assert_eq!(store.insert_entities(&id, &entities).unwrap(), 3);

        let types = store.entity_types().unwrap();
        assert_eq!(types.get("organization"), Some(&1));
        assert_eq!(types.get("concept"), Some(&1));
        assert_eq!(types.values().sum::<usize>(), 3);
    }
}
