//! Store coordinator: owns the store location and hands out connections.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{quote_identifier, METADATA_TABLE};
use crate::config::StoreConfiguration;
use crate::error::{Error, Result};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    /// In-memory database on the `memdb` VFS, shared by every connection
    /// in the process that opens the same URI.
    Memory(String),
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreLocation::File(path) => write!(f, "{}", path.display()),
            StoreLocation::Memory(uri) => write!(f, "{}", uri),
        }
    }
}

/// Every context connects through the coordinator. The coordinator keeps one
/// anchor connection open for as long as it lives, which is what keeps an
/// in-memory store alive between contexts.
pub struct Coordinator {
    location: StoreLocation,
    journal_mode: &'static str,
    anchor: Mutex<Option<Connection>>,
}

impl Coordinator {
    /// Open the store described by `config` at `path`. `path` is ignored for
    /// in-memory stores.
    pub fn open(config: &StoreConfiguration, path: &Path) -> Result<Self> {
        let location = if config.is_file_backed() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            StoreLocation::File(path.to_path_buf())
        } else {
            StoreLocation::Memory(format!("file:/kern-{}?vfs=memdb", uuid::Uuid::new_v4()))
        };

        let coordinator = Self {
            location,
            journal_mode: config.journal_mode(),
            anchor: Mutex::new(None),
        };

        let anchor = coordinator.connect()?;
        *coordinator.anchor.lock().unwrap_or_else(PoisonError::into_inner) = Some(anchor);

        tracing::debug!(
            "Opened store coordinator at {} (journal: {})",
            coordinator.location,
            coordinator.journal_mode
        );
        Ok(coordinator)
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn journal_mode(&self) -> &'static str {
        self.journal_mode
    }

    /// Open a new connection to the store.
    pub fn connect(&self) -> Result<Connection> {
        let conn = match &self.location {
            StoreLocation::File(path) => Connection::open(path)?,
            StoreLocation::Memory(uri) => Connection::open_with_flags(uri, OpenFlags::default())?,
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Journal mode is per connection for in-memory stores.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", self.journal_mode, |row| {
                row.get(0)
            })?;
        if !mode.eq_ignore_ascii_case(self.journal_mode) {
            tracing::warn!(
                "Requested journal mode {} but store reports {}",
                self.journal_mode,
                mode
            );
        }

        Ok(conn)
    }

    /// Run `f` against the anchor connection.
    pub fn with_anchor<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut anchor = self.anchor.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = anchor
            .as_mut()
            .ok_or_else(|| Error::Config(format!("store {} is closed", self.location)))?;
        f(conn)
    }

    /// Release the anchor connection. An in-memory store is gone once the last
    /// context connection is dropped as well.
    pub fn close(&self) {
        let conn = self
            .anchor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                tracing::warn!("Failed to close store {}: {}", self.location, e);
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn ensure_metadata_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        quote_identifier(METADATA_TABLE)
    ))?;
    Ok(())
}

/// Read the store metadata dictionary. A store without a metadata table has
/// no metadata.
pub fn read_metadata(conn: &Connection) -> Result<BTreeMap<String, String>> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![METADATA_TABLE],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Ok(BTreeMap::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT key, value FROM {} ORDER BY key",
        quote_identifier(METADATA_TABLE)
    ))?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

    let mut metadata = BTreeMap::new();
    for row in rows {
        let (key, value): (String, String) = row?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

/// Upsert metadata entries.
pub fn write_metadata(conn: &Connection, entries: &[(&str, String)]) -> Result<()> {
    ensure_metadata_table(conn)?;
    let sql = format!(
        "INSERT INTO {} (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        quote_identifier(METADATA_TABLE)
    );
    for (key, value) in entries {
        conn.execute(&sql, params![key, value])?;
    }
    Ok(())
}

/// Read metadata from a store file without setting anything up.
pub fn read_metadata_at(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Err(Error::NotFound(format!("no store at {}", path.display())));
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    read_metadata(&conn)
}
