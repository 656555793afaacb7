use crate::api::models::Conversation;
use crate::error::ChatResult;
use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::{Path, PathBuf};

pub fn default_db_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("com", "example", "RecruitChat")?;
    Some(proj.data_dir().join("cache.sqlite"))
}

// Conversation list cache: lets the sidebar render before the first fetch
// returns, and stands in for the list when the fetch fails.
pub struct ConversationCache {
    conn: Connection,
}

impl ConversationCache {
    pub fn open(path: &Path) -> ChatResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> ChatResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> ChatResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                candidate_id TEXT NOT NULL,
                last_activity INTEGER,
                raw_json TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    pub fn upsert(&mut self, conversations: &[Conversation]) -> ChatResult<()> {
        let tx = self.conn.transaction()?;
        for c in conversations {
            let raw = serde_json::to_string(c)?;
            let activity = c.last_message_at.map(|t| t.timestamp_millis());
            tx.execute(
                r#"
                INSERT INTO conversations (id, candidate_id, last_activity, raw_json)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    candidate_id=excluded.candidate_id,
                    last_activity=excluded.last_activity,
                    raw_json=excluded.raw_json
                "#,
                params![c.id, c.candidate_id, activity, raw],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent activity first. Rows that no longer decode are skipped.
    pub fn load(&self, limit: Option<usize>) -> ChatResult<Vec<Conversation>> {
        let mut stmt = self.conn.prepare(
            "SELECT raw_json FROM conversations
             ORDER BY last_activity IS NULL, last_activity DESC, id ASC LIMIT ?1",
        )?;
        let lim = limit.unwrap_or(500) as i64;
        let rows = stmt.query_map(params![lim], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            match serde_json::from_str::<Conversation>(&raw?) {
                Ok(c) => out.push(c),
                Err(e) => log::warn!("Dropping unreadable cached conversation: {e}"),
            }
        }
        Ok(out)
    }

    pub fn find_by_candidate(&self, candidate_id: &str) -> ChatResult<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM conversations WHERE candidate_id = ?1")?;
        let id: Option<String> = stmt
            .query_row(params![candidate_id], |row| row.get(0))
            .optional()?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, conversation};

    #[test]
    fn upsert_then_load_orders_by_activity() {
        let mut cache = ConversationCache::open_in_memory().unwrap();
        let mut quiet = conversation("c-quiet", "k1");
        quiet.last_message_at = None;
        let mut old = conversation("c-old", "k2");
        old.last_message_at = Some(at(10));
        let mut new = conversation("c-new", "k3");
        new.last_message_at = Some(at(20));
        cache.upsert(&[quiet, old.clone(), new]).unwrap();

        let ids: Vec<String> = cache.load(None).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c-new", "c-old", "c-quiet"]);

        old.last_message_at = Some(at(30));
        old.unread_count = 4;
        cache.upsert(&[old]).unwrap();
        let loaded = cache.load(Some(1)).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "c-old");
        assert_eq!(loaded[0].unread_count, 4);
    }

    #[test]
    fn finds_conversation_by_candidate() {
        let mut cache = ConversationCache::open_in_memory().unwrap();
        cache.upsert(&[conversation("c1", "cand-7")]).unwrap();
        assert_eq!(cache.find_by_candidate("cand-7").unwrap().as_deref(), Some("c1"));
        assert!(cache.find_by_candidate("nobody").unwrap().is_none());
    }

    #[test]
    fn opens_file_in_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite");
        let mut cache = ConversationCache::open(&path).unwrap();
        cache.upsert(&[conversation("c1", "k1")]).unwrap();
        drop(cache);
        let reopened = ConversationCache::open(&path).unwrap();
        assert_eq!(reopened.load(None).unwrap().len(), 1);
    }
}
