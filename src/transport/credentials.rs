//! Credential storage consulted by every transport call.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex as PlMutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Async key-value store holding the bearer token and the signed-in identity.
///
/// Clearing is idempotent: clearing an already-empty store is harmless, so the
/// 401 path needs no coordination with concurrent requests.
#[async_trait]
pub trait CredentialStore: Send + Sync {
  async fn get_token(&self) -> Option<String>;

  async fn set_token(&self, token: &str);

  async fn clear_token(&self);

  /// Serialized profile of the signed-in user, if any.
  async fn get_identity(&self) -> Option<String>;

  async fn set_identity(&self, identity: &str);

  async fn clear_identity(&self);
}

/// In-process credential store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
  token: PlMutex<Option<String>>,
  identity: PlMutex<Option<String>>,
}

impl MemoryCredentialStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_token(token: impl Into<String>) -> Self {
    Self {
      token: PlMutex::new(Some(token.into())),
      identity: PlMutex::new(None),
    }
  }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
  async fn get_token(&self) -> Option<String> {
    self.token.lock().clone()
  }

  async fn set_token(&self, token: &str) {
    *self.token.lock() = Some(token.to_string());
  }

  async fn clear_token(&self) {
    *self.token.lock() = None;
  }

  async fn get_identity(&self) -> Option<String> {
    self.identity.lock().clone()
  }

  async fn set_identity(&self, identity: &str) {
    *self.identity.lock() = Some(identity.to_string());
  }

  async fn clear_identity(&self) {
    *self.identity.lock() = None;
  }
}

const TOKEN_KEY: &str = "auth_token";
const IDENTITY_KEY: &str = "identity";

/// Schema for the credential table.
const CREDENTIAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed credential store so a session survives restarts.
pub struct SqliteCredentialStore {
  conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create credential directory: {}", e))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      eyre!(
        "Failed to open credential database at {}: {}",
        path.display(),
        e
      )
    })?;

    conn
      .execute_batch(CREDENTIAL_SCHEMA)
      .map_err(|e| eyre!("Failed to run credential migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("storefront").join("credentials.db"))
  }

  fn read(&self, name: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM credentials WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read credential {}: {}", name, e))
  }

  fn write(&self, name: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO credentials (name, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![name, value],
      )
      .map_err(|e| eyre!("Failed to store credential {}: {}", name, e))?;

    Ok(())
  }

  fn delete(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM credentials WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to clear credential {}: {}", name, e))?;

    Ok(())
  }
}

// Storage failures degrade to "no credential" rather than failing the request:
// an anonymous call is always valid.
#[async_trait]
impl CredentialStore for SqliteCredentialStore {
  async fn get_token(&self) -> Option<String> {
    self.read(TOKEN_KEY).unwrap_or_else(|e| {
      warn!("{}", e);
      None
    })
  }

  async fn set_token(&self, token: &str) {
    if let Err(e) = self.write(TOKEN_KEY, token) {
      warn!("{}", e);
    }
  }

  async fn clear_token(&self) {
    if let Err(e) = self.delete(TOKEN_KEY) {
      warn!("{}", e);
    }
  }

  async fn get_identity(&self) -> Option<String> {
    self.read(IDENTITY_KEY).unwrap_or_else(|e| {
      warn!("{}", e);
      None
    })
  }

  async fn set_identity(&self, identity: &str) {
    if let Err(e) = self.write(IDENTITY_KEY, identity) {
      warn!("{}", e);
    }
  }

  async fn clear_identity(&self) {
    if let Err(e) = self.delete(IDENTITY_KEY) {
      warn!("{}", e);
    }
  }
}
