//! Kern library root.
//!
//! A shared SQLite store behind a [`StoreManager`]: set a store up once,
//! hand out contexts, build and run fetch requests, and drop the store
//! again between test runs.
//!
//! ```no_run
//! use kern::{Condition, Record, StoreManager, ResourceBundle};
//!
//! # fn main() -> kern::Result<()> {
//! let manager = StoreManager::new(ResourceBundle::new("resources"))?;
//! manager.setup_auto_migrating()?;
//!
//! manager
//!     .shared_context()?
//!     .lock()
//!     .unwrap()
//!     .insert(Record::new("Person").with("name", "Ada".to_string()))?;
//! if !manager.save_context() {
//!     eprintln!("save failed, see log");
//! }
//!
//! let request = StoreManager::fetch_request_for_entity_name(
//!     "Person",
//!     Some(Condition::equals("name", "Ada".to_string())),
//!     Vec::new(),
//!     0,
//! );
//! assert_eq!(manager.count_for_fetch_request(&request), 1);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
mod macros;
pub mod manager;
pub mod model;
pub mod store;

#[doc(hidden)]
pub use tracing as __tracing;

pub use config::{
    StoreConfiguration, StoreKind, DEFAULT_BATCH_SIZE, DEFAULT_STORE_FILE_NAME,
    STORE_METADATA_KEY_FILE_NAME, STORE_METADATA_KEY_URL,
};
pub use error::{Error, Result};
pub use manager::{ContextHandle, StoreManager};
pub use model::{
    AttributeDescription, AttributeType, EntityDescription, Model, ResourceBundle,
    SchemaProvider, StaticSchema,
};
pub use store::{
    Condition, Context, FetchRequest, LightweightMigrator, Migrator, Record, SortDescriptor,
    Value,
};
