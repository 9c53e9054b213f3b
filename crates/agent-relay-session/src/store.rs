//! Persistence adapter for session state.

use std::{collections::HashMap, sync::Arc};

use agent_relay_core::{AgentSession, KeyValueStorage, StorageError};

/// Key the session table is persisted under unless configured otherwise.
pub const DEFAULT_STORAGE_KEY: &str = "agent-relay:sessions";

/// Serializes the session table into a single key of a [`KeyValueStorage`].
///
/// Every write rewrites the whole table, so a reader never sees a partial
/// update.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
}

impl SessionStore {
    /// Create a store over `storage` using `key`.
    #[must_use]
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    /// The underlying storage.
    #[must_use]
    pub fn storage(&self) -> Arc<dyn KeyValueStorage> {
        Arc::clone(&self.storage)
    }

    /// Load every persisted session.
    ///
    /// A corrupt entry is treated as empty.
    ///
    /// # Errors
    /// Returns error if the storage cannot be read.
    pub fn load(&self) -> Result<HashMap<String, AgentSession>, StorageError> {
        let Some(raw) = self.storage.get_item(&self.key)? else {
            return Ok(HashMap::new());
        };
        match serde_json::from_str(&raw) {
            Ok(sessions) => Ok(sessions),
            Err(e) => {
                tracing::warn!(key = %self.key, "Discarding unreadable session state: {e}");
                Ok(HashMap::new())
            }
        }
    }

    /// Load one session.
    ///
    /// # Errors
    /// Returns error if the storage cannot be read.
    pub fn get(&self, session_id: &str) -> Result<Option<AgentSession>, StorageError> {
        Ok(self.load()?.remove(session_id))
    }

    /// Insert or replace one session.
    ///
    /// # Errors
    /// Returns error if the storage cannot be read or written.
    pub fn save(&self, session: &AgentSession) -> Result<(), StorageError> {
        let mut sessions = self.load()?;
        sessions.insert(session.id.clone(), session.clone());
        self.write(&sessions)
    }

    /// Replace the whole persisted table.
    ///
    /// # Errors
    /// Returns error if the storage cannot be written.
    pub fn save_all(&self, sessions: &HashMap<String, AgentSession>) -> Result<(), StorageError> {
        if sessions.is_empty() {
            return self.clear();
        }
        self.write(sessions)
    }

    /// Remove one session.
    ///
    /// # Errors
    /// Returns error if the storage cannot be read or written.
    pub fn remove(&self, session_id: &str) -> Result<(), StorageError> {
        let mut sessions = self.load()?;
        if sessions.remove(session_id).is_none() {
            return Ok(());
        }
        self.save_all(&sessions)
    }

    /// Wipe all persisted state.
    ///
    /// # Errors
    /// Returns error if the storage cannot be written.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.storage.remove_item(&self.key)
    }

    fn write(&self, sessions: &HashMap<String, AgentSession>) -> Result<(), StorageError> {
        let raw = serde_json::to_string(sessions)?;
        self.storage.set_item(&self.key, &raw)
    }
}
