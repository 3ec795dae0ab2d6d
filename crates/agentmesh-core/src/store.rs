use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use rusqlite::Connection;

use crate::error::CoreError;
use crate::model::SessionContext;

/// Loads and persists per-session conversational state.
///
/// Thread-safety contract: implementations must be safe to call concurrently
/// from many sessions at once; the orchestrator serializes calls for the
/// *same* session id via a per-session lock but makes no guarantee
/// about ordering across different sessions. `load` must be idempotent and
/// return a freshly allocated `SessionContext` reflecting the last durable
/// `save`. A `load` for a session id never seen before returns a new, empty
/// context rather than an error.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str, caller_id: Option<&str>) -> Result<SessionContext, CoreError>;

    /// Persists the full context object atomically. Implementations must not
    /// partially apply a context on failure.
    async fn save(&self, context: &SessionContext) -> Result<(), CoreError>;

    /// Removes a session's state, used by the idle-timeout eviction policy.
    async fn evict(&self, session_id: &str) -> Result<(), CoreError>;
}

/// In-memory `SessionStore`. Used by tests and ephemeral single-process
/// deployments; state does not survive a restart.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: SyncMutex<HashMap<String, SessionContext>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str, caller_id: Option<&str>) -> Result<SessionContext, CoreError> {
        let sessions = self.sessions.lock();
        Ok(sessions
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| SessionContext::new(session_id, caller_id.map(str::to_owned))))
    }

    async fn save(&self, context: &SessionContext) -> Result<(), CoreError> {
        self.sessions
            .lock()
            .insert(context.session_id.clone(), context.clone());
        Ok(())
    }

    async fn evict(&self, session_id: &str) -> Result<(), CoreError> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }
}

/// Durable `SessionStore`, one row per session holding the serialized
/// `SessionContext` as JSON. This is the store used outside of tests.
///
/// `rusqlite::Connection` is `Send` but not `Sync`, so writes go through
/// `spawn_blocking` against a connection guarded by a blocking mutex,
/// keeping SQLite access off the async runtime's worker threads.
pub struct SqliteSessionStore {
    conn: Arc<SyncMutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn open(path: &str) -> Result<Self, CoreError> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                context_json TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(SyncMutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, CoreError> {
        Self::open(":memory:")
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, session_id: &str, caller_id: Option<&str>) -> Result<SessionContext, CoreError> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        let caller_id = caller_id.map(str::to_owned);
        tokio::task::spawn_blocking(move || -> Result<SessionContext, CoreError> {
            let conn = conn.lock();
            let row = conn.query_row(
                "SELECT context_json FROM sessions WHERE session_id = ?1",
                [&session_id],
                |row| row.get::<_, String>(0),
            );
            match row {
                Ok(json) => {
                    serde_json::from_str(&json).map_err(|e| CoreError::ContextStore(e.to_string()))
                }
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    Ok(SessionContext::new(session_id, caller_id))
                }
                Err(other) => Err(other.into()),
            }
        })
        .await
        .map_err(|e| CoreError::ContextStore(e.to_string()))?
    }

    async fn save(&self, context: &SessionContext) -> Result<(), CoreError> {
        let conn = self.conn.clone();
        let context = context.clone();
        tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            let json = serde_json::to_string(&context)
                .map_err(|e| CoreError::ContextStore(e.to_string()))?;
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO sessions (session_id, context_json) VALUES (?1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET context_json = excluded.context_json",
                rusqlite::params![context.session_id, json],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| CoreError::ContextStore(e.to_string()))?
    }

    async fn evict(&self, session_id: &str) -> Result<(), CoreError> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            let conn = conn.lock();
            conn.execute("DELETE FROM sessions WHERE session_id = ?1", [&session_id])?;
            Ok(())
        })
        .await
        .map_err(|e| CoreError::ContextStore(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_load_is_idempotent_for_unknown_session() {
        let store = MemorySessionStore::new();
        let a = store.load("s1", None).await.unwrap();
        let b = store.load("s1", None).await.unwrap();
        assert_eq!(a, b);
        assert!(a.conversation.is_empty());
    }

    #[tokio::test]
    async fn memory_store_save_then_load_roundtrips() {
        let store = MemorySessionStore::new();
        let mut ctx = SessionContext::new("s1", Some("caller-1".into()));
        ctx.append_user("hi");
        store.save(&ctx).await.unwrap();
        let loaded = store.load("s1", None).await.unwrap();
        assert_eq!(loaded, ctx);
    }

    #[tokio::test]
    async fn memory_store_evict_resets_to_fresh_context() {
        let store = MemorySessionStore::new();
        let mut ctx = SessionContext::new("s1", None);
        ctx.append_user("hi");
        store.save(&ctx).await.unwrap();
        store.evict("s1").await.unwrap();
        let loaded = store.load("s1", None).await.unwrap();
        assert!(loaded.conversation.is_empty());
    }

    #[tokio::test]
    async fn sqlite_store_save_then_load_roundtrips() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let mut ctx = SessionContext::new("s1", None);
        ctx.append_user("hi");
        ctx.append_assistant("hello", None);
        store.save(&ctx).await.unwrap();
        let loaded = store.load("s1", None).await.unwrap();
        assert_eq!(loaded, ctx);
    }

    #[tokio::test]
    async fn sqlite_store_save_is_idempotent_by_session_id() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let mut ctx = SessionContext::new("s1", None);
        ctx.append_user("first save");
        store.save(&ctx).await.unwrap();
        ctx.append_user("second save");
        store.save(&ctx).await.unwrap();
        let loaded = store.load("s1", None).await.unwrap();
        assert_eq!(loaded.conversation.len(), 2);
    }
}
