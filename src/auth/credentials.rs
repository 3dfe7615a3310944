// Credential persistence in a SQLite key/value table

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::types::UserProfile;
use crate::error::ClientError;

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const USER_KEY: &str = "user";

/// Everything the store holds, read under one lock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
}

/// Sole owner of the access token, refresh token and cached user profile
///
/// Values live in an `auth_kv` table so they survive restarts. Every
/// operation takes the connection mutex, and multi-key writes run in a
/// single transaction, so no reader can observe one token without the other.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Open (or create) the credential database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create credential directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        tracing::debug!("Credential store opened at {}", path.display());
        Self::from_connection(conn)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind, so the connection is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current access token
    pub fn access(&self) -> Result<Option<String>, ClientError> {
        read_key(&self.lock(), ACCESS_TOKEN_KEY)
    }

    /// Current refresh token
    pub fn refresh(&self) -> Result<Option<String>, ClientError> {
        read_key(&self.lock(), REFRESH_TOKEN_KEY)
    }

    /// Cached user profile
    pub fn cached_user(&self) -> Result<Option<UserProfile>, ClientError> {
        let raw = read_key(&self.lock(), USER_KEY)?;
        Ok(raw.as_deref().and_then(parse_user))
    }

    /// All three values from one consistent view
    pub fn snapshot(&self) -> Result<StoredSession, ClientError> {
        let conn = self.lock();
        Ok(StoredSession {
            access_token: read_key(&conn, ACCESS_TOKEN_KEY)?,
            refresh_token: read_key(&conn, REFRESH_TOKEN_KEY)?,
            user: read_key(&conn, USER_KEY)?.as_deref().and_then(parse_user),
        })
    }

    /// Overwrite both tokens
    pub fn set(&self, access_token: &str, refresh_token: &str) -> Result<(), ClientError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        write_key(&tx, ACCESS_TOKEN_KEY, access_token)?;
        write_key(&tx, REFRESH_TOKEN_KEY, refresh_token)?;
        tx.commit()?;

        tracing::debug!("Stored new access/refresh token pair");
        Ok(())
    }

    /// Replace the cached user profile
    pub fn set_user(&self, user: &UserProfile) -> Result<(), ClientError> {
        let json = serde_json::to_string(user)
            .map_err(|e| ClientError::Internal(anyhow::anyhow!("Failed to serialize user: {}", e)))?;
        write_key(&self.lock(), USER_KEY, &json)?;
        Ok(())
    }

    /// Remove all three values at once
    ///
    /// Returns `true` when anything was actually removed.
    pub fn clear(&self) -> Result<bool, ClientError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM auth_kv WHERE key IN (?1, ?2, ?3)",
            params![ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY],
        )?;
        tx.commit()?;

        if removed > 0 {
            tracing::debug!("Cleared stored credentials");
        }
        Ok(removed > 0)
    }

    /// True iff an access token is stored
    pub fn has_session(&self) -> Result<bool, ClientError> {
        Ok(self.access()?.is_some())
    }
}

fn read_key(conn: &Connection, key: &str) -> Result<Option<String>, ClientError> {
    let value = conn
        .query_row("SELECT value FROM auth_kv WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

fn write_key(conn: &Connection, key: &str, value: &str) -> Result<(), ClientError> {
    conn.execute(
        "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn parse_user(raw: &str) -> Option<UserProfile> {
    match serde_json::from_str(raw) {
        Ok(user) => Some(user),
        Err(e) => {
            tracing::warn!("Ignoring unreadable cached user profile: {}", e);
            None
        }
    }
}
