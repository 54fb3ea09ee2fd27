//! CLI commands for Kern using clap.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{default_data_dir, validate_store_name, DEFAULT_STORE_FILE_NAME};
use crate::store::{read_metadata_at, remove_store_files, sidecar_paths};

/// Kern - inspect and reset stores.
#[derive(Parser, Debug)]
#[command(name = "kern")]
#[command(version)]
#[command(about = "Inspect and reset Kern stores", long_about = None)]
pub struct Commands {
    /// Base data directory (defaults to the platform data directory)
    #[arg(long, global = true, env = "KERN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Print the location of a store
    Path {
        /// Store file name
        name: Option<String>,
    },

    /// Show store metadata and files
    Info {
        /// Store file name
        name: Option<String>,
    },

    /// Delete a store and its sidecar files
    Drop {
        /// Store file name
        name: String,

        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

/// Resolve a store name against the data directory.
pub fn resolve_store(data_dir: &Path, name: Option<&str>) -> Result<PathBuf> {
    let name = name.unwrap_or(DEFAULT_STORE_FILE_NAME);
    validate_store_name(name)?;
    Ok(data_dir.join(name))
}

impl Commands {
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(default_data_dir()?),
        }
    }

    pub fn run(&self) -> Result<()> {
        let data_dir = self.resolved_data_dir()?;

        match &self.command {
            Command::Path { name } => {
                let path = resolve_store(&data_dir, name.as_deref())?;
                println!("{}", path.display());
            }
            Command::Info { name } => {
                let path = resolve_store(&data_dir, name.as_deref())?;
                let metadata = read_metadata_at(&path)?;

                println!("Store: {}", path.display());
                if metadata.is_empty() {
                    println!("  (no metadata)");
                }
                for (key, value) in &metadata {
                    println!("  {}: {}", key, value);
                }

                println!("Files:");
                let mut files = vec![path.clone()];
                files.extend(sidecar_paths(&path));
                for file in files.iter().filter(|f| f.exists()) {
                    let size = std::fs::metadata(file)?.len();
                    println!("  {} ({} bytes)", file.display(), size);
                }
            }
            Command::Drop { name, yes } => {
                let path = resolve_store(&data_dir, Some(name))?;
                if !yes {
                    bail!("refusing to drop {} without --yes", path.display());
                }
                let removed = remove_store_files(&path)?;
                tracing::info!("Dropped {} ({} files)", path.display(), removed.len());
                println!("Removed {} file(s) for {}", removed.len(), path.display());
            }
        }

        Ok(())
    }
}
