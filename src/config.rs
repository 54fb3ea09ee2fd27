//! Store configuration and data directory resolution.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Store file name used when no name is given.
pub const DEFAULT_STORE_FILE_NAME: &str = "Kern.sqlite";

/// Metadata key recording the logical store file name.
pub const STORE_METADATA_KEY_FILE_NAME: &str = "KernPersistentStoreMetaDataKeyStoreFileName";

/// Metadata key recording the resolved store location.
pub const STORE_METADATA_KEY_URL: &str = "KernPersistentStoreMetaDataKeyStoreURL";

/// Metadata key recording the model version the store was last migrated to.
pub const STORE_METADATA_KEY_MODEL_VERSION: &str = "KernModelVersion";

/// Metadata key recording the model type of every stored attribute, as JSON.
pub const STORE_METADATA_KEY_ATTRIBUTE_TYPES: &str = "KernAttributeTypes";

/// Metadata key recording the do-not-backup flag.
pub const STORE_METADATA_KEY_EXCLUDED_FROM_BACKUP: &str = "KernExcludedFromBackup";

/// Rows per page for fetch requests that page their results.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Environment variable overriding the base data directory.
pub const DATA_DIR_ENV: &str = "KERN_DATA_DIR";

/// Where the store lives.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    File,
    Memory,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::File => write!(f, "file"),
            StoreKind::Memory => write!(f, "memory"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_store_name() -> String {
    DEFAULT_STORE_FILE_NAME.to_string()
}

/// Configuration chosen at setup time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoreConfiguration {
    #[serde(default = "default_store_name")]
    pub store_name: String,
    /// Write-ahead-log journaling. Off means rollback (`DELETE`) journaling.
    #[serde(default = "default_true")]
    pub journaling: bool,
    #[serde(default)]
    pub exclude_from_backup: bool,
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_true")]
    pub auto_migrate: bool,
}

impl Default for StoreConfiguration {
    fn default() -> Self {
        Self::sqlite(DEFAULT_STORE_FILE_NAME)
    }
}

impl StoreConfiguration {
    /// File-backed, journaled, auto-migrating store.
    pub fn sqlite(store_name: &str) -> Self {
        Self {
            store_name: store_name.to_string(),
            journaling: true,
            exclude_from_backup: false,
            kind: StoreKind::File,
            auto_migrate: true,
        }
    }

    /// Memory-only store. Nothing is written to disk.
    pub fn in_memory() -> Self {
        Self {
            store_name: DEFAULT_STORE_FILE_NAME.to_string(),
            journaling: false,
            exclude_from_backup: false,
            kind: StoreKind::Memory,
            auto_migrate: true,
        }
    }

    pub fn with_journaling(mut self, journaling: bool) -> Self {
        self.journaling = journaling;
        self
    }

    pub fn with_exclude_from_backup(mut self, exclude: bool) -> Self {
        self.exclude_from_backup = exclude;
        self
    }

    pub fn with_auto_migrate(mut self, auto_migrate: bool) -> Self {
        self.auto_migrate = auto_migrate;
        self
    }

    pub fn is_file_backed(&self) -> bool {
        self.kind == StoreKind::File
    }

    /// SQLite journal mode for this configuration.
    pub fn journal_mode(&self) -> &'static str {
        match (self.kind, self.journaling) {
            (StoreKind::Memory, _) => "MEMORY",
            (StoreKind::File, true) => "WAL",
            (StoreKind::File, false) => "DELETE",
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_store_name(&self.store_name)
    }
}

/// Reject names that would resolve outside the base directory.
pub fn validate_store_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Config("store name must not be empty".to_string()));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(Error::Config(format!(
            "store name '{}' must be a plain file name",
            name
        )));
    }
    if name.contains('\0') {
        return Err(Error::Config("store name contains a NUL byte".to_string()));
    }
    Ok(())
}

/// Resolve the base data directory: `KERN_DATA_DIR` if set, else the
/// platform data directory.
pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let dirs = directories::ProjectDirs::from("com", "kern", "kern")
        .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    Ok(dirs.data_dir().to_path_buf())
}

/// Load a store configuration from a JSON file.
pub fn load_configuration(path: &Path) -> Result<StoreConfiguration> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Configuration file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let config: StoreConfiguration = serde_json::from_str(&content)?;
    config.validate()?;

    tracing::debug!("Loaded store configuration from {}", path.display());
    Ok(config)
}
