// Credential persistence
// Survives process restarts; the coordinator works without it

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::TransportError;

use super::types::CredentialPair;

/// Key under which the token pair is stored in `auth_kv`
const TOKENS_KEY: &str = "bearer-session:tokens";

/// Persistence collaborator for the credential pair
pub trait CredentialStore: Send + Sync {
    fn save(&self, pair: &CredentialPair) -> Result<(), TransportError>;
    fn load(&self) -> Result<Option<CredentialPair>, TransportError>;
    fn erase(&self) -> Result<(), TransportError>;
}

/// Process-lifetime store
#[derive(Debug, Default)]
pub struct MemoryStore {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<CredentialPair>>, TransportError> {
        self.pair
            .lock()
            .map_err(|_| TransportError::Storage("memory store lock poisoned".to_string()))
    }
}

impl CredentialStore for MemoryStore {
    fn save(&self, pair: &CredentialPair) -> Result<(), TransportError> {
        *self.slot()? = Some(pair.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<CredentialPair>, TransportError> {
        Ok(self.slot()?.clone())
    }

    fn erase(&self) -> Result<(), TransportError> {
        *self.slot()? = None;
        Ok(())
    }
}

/// SQLite key/value store (`auth_kv` table)
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let store = Self { path: path.into() };
        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TransportError::Storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        store.connect()?;
        tracing::debug!("Credential store ready at {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<rusqlite::Connection, TransportError> {
        let conn = rusqlite::Connection::open(&self.path).map_err(|e| {
            TransportError::Storage(format!(
                "Failed to open SQLite database {}: {}",
                self.path.display(),
                e
            ))
        })?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(conn)
    }
}

impl CredentialStore for SqliteStore {
    fn save(&self, pair: &CredentialPair) -> Result<(), TransportError> {
        let value = serde_json::to_string(pair)
            .map_err(|e| TransportError::Storage(format!("Failed to encode tokens: {}", e)))?;
        self.connect()?.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [TOKENS_KEY, value.as_str()],
        )?;
        Ok(())
    }

    fn load(&self) -> Result<Option<CredentialPair>, TransportError> {
        let conn = self.connect()?;
        let value: Option<String> = match conn.query_row(
            "SELECT value FROM auth_kv WHERE key = ?",
            [TOKENS_KEY],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        value
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| {
                    TransportError::Storage(format!("Failed to parse stored tokens: {}", e))
                })
            })
            .transpose()
    }

    fn erase(&self) -> Result<(), TransportError> {
        self.connect()?
            .execute("DELETE FROM auth_kv WHERE key = ?", [TOKENS_KEY])?;
        Ok(())
    }
}
