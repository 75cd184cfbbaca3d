//! Durable slot for the current chat session id.
//!
//! One row, one owner: the chat session manager is the only writer.
//! Absence is "no session yet", never an error.

use parking_lot::Mutex;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// A server-tracked conversational context, as mirrored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub id: String,
    /// Epoch seconds at local creation time.
    pub created_at: i64,
}

impl ChatSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: epoch_secs(),
        }
    }
}

/// Where the current chat id survives restarts.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<ChatSession>>;

    /// A fresh save fully replaces whatever was there.
    fn save(&self, session: &ChatSession) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// SQLite-backed store.
pub struct SqliteSessionStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat_session (
                slot INTEGER PRIMARY KEY CHECK (slot = 0),
                chat_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn load(&self) -> Result<Option<ChatSession>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT chat_id, created_at FROM chat_session WHERE slot = 0",
            [],
            |r| {
                Ok(ChatSession {
                    id: r.get(0)?,
                    created_at: r.get(1)?,
                })
            },
        );
        match row {
            Ok(session) => Ok(Some(session)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, session: &ChatSession) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chat_session (slot, chat_id, created_at) VALUES (0, ?1, ?2)
             ON CONFLICT(slot) DO UPDATE SET
                chat_id = excluded.chat_id,
                created_at = excluded.created_at",
            rusqlite::params![session.id, session.created_at],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM chat_session WHERE slot = 0", [])?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral embeddings.
#[derive(Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<ChatSession>>,
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<ChatSession>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, session: &ChatSession) -> Result<()> {
        *self.slot.lock() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

pub(crate) fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_round_trip_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteSessionStore::open(&dir.path().join("widget.db")).unwrap();

        assert_eq!(store.load().unwrap(), None);

        let first = ChatSession::new("chat_1");
        store.save(&first).unwrap();
        assert_eq!(store.load().unwrap(), Some(first));

        let second = ChatSession::new("chat_2");
        store.save(&second).unwrap();
        assert_eq!(store.load().unwrap().unwrap().id, "chat_2");

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("widget.db");

        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store.save(&ChatSession::new("chat_persisted")).unwrap();
        }

        let store = SqliteSessionStore::open(&path).unwrap();
        assert_eq!(store.load().unwrap().unwrap().id, "chat_persisted");
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySessionStore::default();
        assert_eq!(store.load().unwrap(), None);
        store.save(&ChatSession::new("chat_m")).unwrap();
        assert_eq!(store.load().unwrap().unwrap().id, "chat_m");
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
