//! SQLite-backed store: coordinator, contexts, fetch requests and migration.

pub mod context;
pub mod coordinator;
pub mod fetch;
pub mod files;
pub mod migration;
pub mod record;

pub use context::{Change, Context};
pub use coordinator::{read_metadata, read_metadata_at, write_metadata, Coordinator, StoreLocation};
pub use fetch::{Condition, FetchRequest, SortDescriptor};
pub use files::{remove_store_files, sidecar_paths, SIDECAR_SUFFIXES};
pub use migration::{LightweightMigrator, MigrationReport, Migrator};
pub use record::{Record, Value};

/// Name of the table holding store metadata.
pub const METADATA_TABLE: &str = "kern_metadata";

/// Quote an identifier for use in SQL.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
