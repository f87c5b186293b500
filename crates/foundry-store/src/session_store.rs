use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use foundry_core::ThreadId;

use crate::database::Database;
use crate::error::StoreError;

pub const ACTIVE_THREAD_KEY: &str = "active_thread_id";
pub const ACTIVE_QUERY_KEY: &str = "active_query";

/// The active session as remembered across restarts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedSession {
    pub thread_id: ThreadId,
    pub query: String,
}

/// Durable record of the single active session.
///
/// Both fields are written and removed in one transaction. A half-written
/// pair (one key missing) reads back as no session at all.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, query), fields(thread_id = %thread_id))]
    pub fn save(&self, thread_id: &ThreadId, query: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            for (key, value) in [
                (ACTIVE_THREAD_KEY, thread_id.as_str()),
                (ACTIVE_QUERY_KEY, query),
            ] {
                tx.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    rusqlite::params![key, value, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn load(&self) -> Result<Option<SavedSession>, StoreError> {
        self.db.with_conn(|conn| {
            let get = |key: &str| -> Result<Option<String>, StoreError> {
                Ok(conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                    .optional()?)
            };

            match (get(ACTIVE_THREAD_KEY)?, get(ACTIVE_QUERY_KEY)?) {
                (Some(thread_id), Some(query)) if !thread_id.is_empty() => Ok(Some(SavedSession {
                    thread_id: ThreadId::from_raw(thread_id),
                    query,
                })),
                (None, None) => Ok(None),
                _ => {
                    debug!("incomplete session record treated as absent");
                    Ok(None)
                }
            }
        })
    }

    #[instrument(skip(self))]
    pub fn clear(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM kv WHERE key IN (?1, ?2)",
                [ACTIVE_THREAD_KEY, ACTIVE_QUERY_KEY],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Database::in_memory().unwrap())
    }

    #[test]
    fn empty_store_loads_nothing() {
        assert_eq!(store().load().unwrap(), None);
    }

    #[test]
    fn save_then_load() {
        let store = store();
        store
            .save(&ThreadId::from_raw("t1"), "Exposure hierarchy for social anxiety")
            .unwrap();
        assert_eq!(
            store.load().unwrap(),
            Some(SavedSession {
                thread_id: ThreadId::from_raw("t1"),
                query: "Exposure hierarchy for social anxiety".into(),
            })
        );
    }

    #[test]
    fn save_overwrites_previous_session() {
        let store = store();
        store.save(&ThreadId::from_raw("t1"), "first").unwrap();
        store.save(&ThreadId::from_raw("t2"), "second").unwrap();
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.thread_id.as_str(), "t2");
        assert_eq!(saved.query, "second");
    }

    #[test]
    fn clear_removes_both_fields() {
        let store = store();
        store.save(&ThreadId::from_raw("t1"), "q").unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        // clearing twice is harmless
        store.clear().unwrap();
    }

    #[test]
    fn half_written_pair_reads_as_absent() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, 't1', 'now')",
                [ACTIVE_THREAD_KEY],
            )?;
            Ok(())
        })
        .unwrap();
        assert_eq!(SessionStore::new(db).load().unwrap(), None);
    }

    #[test]
    fn empty_thread_id_reads_as_absent() {
        let store = store();
        store.save(&ThreadId::from_raw(""), "q").unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn empty_query_is_still_a_session() {
        let store = store();
        store.save(&ThreadId::from_raw("t1"), "").unwrap();
        assert_eq!(store.load().unwrap().unwrap().query, "");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.db");
        SessionStore::new(Database::open(&path).unwrap())
            .save(&ThreadId::from_raw("t1"), "q")
            .unwrap();

        let reopened = SessionStore::new(Database::open(&path).unwrap());
        assert_eq!(
            reopened.load().unwrap().map(|s| s.thread_id),
            Some(ThreadId::from_raw("t1"))
        );
    }
}
