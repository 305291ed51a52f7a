// Credential storage
// Key-value persistence for tokens and the cached user profile

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::Credential;
use crate::error::{ClientError, Result};

/// Backing keys, persisted across process restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    AccessToken,
    RefreshToken,
    UserInfo,
}

impl StoreKey {
    pub const ALL: [StoreKey; 3] = [
        StoreKey::AccessToken,
        StoreKey::RefreshToken,
        StoreKey::UserInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::AccessToken => "access_token",
            StoreKey::RefreshToken => "refresh_token",
            StoreKey::UserInfo => "user_info",
        }
    }
}

/// Durable holder of the current credential
///
/// Implementations only need the three primitive operations; the typed
/// accessors are built on top of them. Implementations must be safe to call
/// from many tasks at once.
pub trait CredentialStore: Send + Sync {
    fn read(&self, key: StoreKey) -> Result<Option<String>>;

    fn write(&self, key: StoreKey, value: &str) -> Result<()>;

    fn remove(&self, key: StoreKey) -> Result<()>;

    /// Both tokens, or `None` if either is missing
    fn get(&self) -> Result<Option<Credential>> {
        let access_token = self.read(StoreKey::AccessToken)?;
        let refresh_token = self.read(StoreKey::RefreshToken)?;

        Ok(match (access_token, refresh_token) {
            (Some(access_token), Some(refresh_token)) => Some(Credential {
                access_token,
                refresh_token,
            }),
            _ => None,
        })
    }

    fn set(&self, credential: &Credential) -> Result<()> {
        self.write(StoreKey::AccessToken, &credential.access_token)?;
        self.write(StoreKey::RefreshToken, &credential.refresh_token)
    }

    /// Remove every key, user profile included
    fn clear(&self) -> Result<()> {
        for key in StoreKey::ALL {
            self.remove(key)?;
        }
        Ok(())
    }

    fn access_token(&self) -> Result<Option<String>> {
        self.read(StoreKey::AccessToken)
    }

    fn refresh_token(&self) -> Result<Option<String>> {
        self.read(StoreKey::RefreshToken)
    }

    fn user_info(&self) -> Result<Option<serde_json::Value>> {
        match self.read(StoreKey::UserInfo)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set_user_info(&self, user: &serde_json::Value) -> Result<()> {
        self.write(StoreKey::UserInfo, &user.to_string())
    }
}

/// In-process store, lost on exit
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: DashMap<StoreKey, String>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding a credential
    pub fn with_credential(credential: &Credential) -> Self {
        let store = Self::new();
        store
            .entries
            .insert(StoreKey::AccessToken, credential.access_token.clone());
        store
            .entries
            .insert(StoreKey::RefreshToken, credential.refresh_token.clone());
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn read(&self, key: StoreKey) -> Result<Option<String>> {
        Ok(self.entries.get(&key).map(|entry| entry.value().clone()))
    }

    fn write(&self, key: StoreKey, value: &str) -> Result<()> {
        self.entries.insert(key, value.to_string());
        Ok(())
    }

    fn remove(&self, key: StoreKey) -> Result<()> {
        self.entries.remove(&key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// SQLite-backed store
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS credential_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const UPSERT: &str = "INSERT INTO credential_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

impl SqliteCredentialStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ClientError::Storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        tracing::debug!("Opening credential store: {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute(SCHEMA, [])?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA, [])?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// When `key` was last written
    pub fn updated_at(&self, key: StoreKey) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT updated_at FROM credential_kv WHERE key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| ClientError::Storage(format!("Bad timestamp {}: {}", s, e)))
        })
        .transpose()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ClientError::Storage("credential store lock poisoned".to_string()))
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn read(&self, key: StoreKey) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM credential_kv WHERE key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write(&self, key: StoreKey, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(UPSERT, params![key.as_str(), value, Utc::now().to_rfc3339()])?;
        Ok(())
    }

    fn remove(&self, key: StoreKey) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM credential_kv WHERE key = ?1", [key.as_str()])?;
        Ok(())
    }

    // Both tokens change together or not at all
    fn set(&self, credential: &Credential) -> Result<()> {
        let mut conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        tx.execute(
            UPSERT,
            params![StoreKey::AccessToken.as_str(), credential.access_token, now],
        )?;
        tx.execute(
            UPSERT,
            params![StoreKey::RefreshToken.as_str(), credential.refresh_token, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM credential_kv", [])?;
        Ok(())
    }
}
