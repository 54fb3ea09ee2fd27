//! Lightweight schema migration.
//!
//! Additive changes only: new entities become tables, new attributes become
//! columns. Anything else is refused, including a change between attribute
//! types that share a column affinity (integer, boolean and date).

use rusqlite::Connection;
use std::collections::BTreeMap;

use super::coordinator::{ensure_metadata_table, read_metadata, write_metadata};
use super::quote_identifier;
use crate::config::{STORE_METADATA_KEY_ATTRIBUTE_TYPES, STORE_METADATA_KEY_MODEL_VERSION};
use crate::error::{Error, Result};
use crate::model::{AttributeDescription, AttributeType, EntityDescription, Model, ID_COLUMN};

/// Brings a store in line with a model.
pub trait Migrator: Send + Sync {
    /// With `auto_migrate` off, an existing store that needs changes is
    /// refused instead of migrated.
    fn migrate(&self, conn: &mut Connection, model: &Model, auto_migrate: bool)
        -> Result<MigrationReport>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub created_tables: Vec<String>,
    /// `Entity.attribute`
    pub added_columns: Vec<String>,
    pub from_version: Option<u32>,
    pub to_version: u32,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.created_tables.is_empty() && self.added_columns.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LightweightMigrator;

enum Step<'a> {
    CreateTable(&'a EntityDescription),
    AddColumn(&'a EntityDescription, &'a AttributeDescription),
}

/// Column name and declared type.
fn existing_columns(conn: &Connection, table: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let rows = stmt.query_map([], |row| Ok((row.get(1)?, row.get(2)?)))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Recorded model types, keyed by lowercased `entity.attribute`.
type AttributeTypes = BTreeMap<String, AttributeType>;

fn attribute_key(entity: &EntityDescription, attribute: &AttributeDescription) -> String {
    format!("{}.{}", entity.name, attribute.name).to_ascii_lowercase()
}

fn model_attribute_types(model: &Model) -> AttributeTypes {
    model
        .entities
        .iter()
        .flat_map(|entity| {
            entity
                .attributes
                .iter()
                .map(move |attribute| (attribute_key(entity, attribute), attribute.attribute_type))
        })
        .collect()
}

fn create_table_sql(entity: &EntityDescription) -> String {
    let mut columns = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        quote_identifier(ID_COLUMN)
    )];
    for attribute in &entity.attributes {
        columns.push(format!(
            "{} {}",
            quote_identifier(&attribute.name),
            attribute.attribute_type.affinity()
        ));
    }
    format!(
        "CREATE TABLE {} ({})",
        quote_identifier(&entity.name),
        columns.join(", ")
    )
}

fn add_column_sql(entity: &EntityDescription, attribute: &AttributeDescription) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_identifier(&entity.name),
        quote_identifier(&attribute.name),
        attribute.attribute_type.affinity()
    )
}

impl LightweightMigrator {
    fn plan<'a>(
        &self,
        conn: &Connection,
        model: &'a Model,
        recorded: &AttributeTypes,
    ) -> Result<(Vec<Step<'a>>, bool)> {
        let mut steps = Vec::new();
        let mut any_existing = false;

        for entity in &model.entities {
            let columns = existing_columns(conn, &entity.name)?;
            if columns.is_empty() {
                steps.push(Step::CreateTable(entity));
                continue;
            }
            any_existing = true;

            for attribute in &entity.attributes {
                match columns
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(&attribute.name))
                {
                    None => steps.push(Step::AddColumn(entity, attribute)),
                    Some((_, declared)) => {
                        if !declared.eq_ignore_ascii_case(attribute.attribute_type.affinity()) {
                            return Err(Error::Migration(format!(
                                "{}.{} is stored as {} but modelled as {}; \
                                 this needs more than a lightweight migration",
                                entity.name, attribute.name, declared, attribute.attribute_type
                            )));
                        }
                        // Stores written before types were recorded only have affinity.
                        if let Some(stored) = recorded.get(&attribute_key(entity, attribute)) {
                            if *stored != attribute.attribute_type {
                                return Err(Error::Migration(format!(
                                    "{}.{} is stored as {} but modelled as {}; \
                                     this needs more than a lightweight migration",
                                    entity.name, attribute.name, stored, attribute.attribute_type
                                )));
                            }
                        }
                    }
                }
            }
        }

        Ok((steps, any_existing))
    }
}

impl Migrator for LightweightMigrator {
    fn migrate(
        &self,
        conn: &mut Connection,
        model: &Model,
        auto_migrate: bool,
    ) -> Result<MigrationReport> {
        ensure_metadata_table(conn)?;

        let metadata = read_metadata(conn)?;
        let from_version = match metadata.get(STORE_METADATA_KEY_MODEL_VERSION) {
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
                Error::Migration(format!("store records unreadable model version '{}'", raw))
            })?),
            None => None,
        };

        if let Some(stored) = from_version {
            if stored > model.version {
                return Err(Error::Migration(format!(
                    "store was written by model v{} but the current model is v{}",
                    stored, model.version
                )));
            }
        }

        let recorded: AttributeTypes = match metadata.get(STORE_METADATA_KEY_ATTRIBUTE_TYPES) {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                Error::Migration(format!("store records unreadable attribute types: {}", e))
            })?,
            None => AttributeTypes::new(),
        };

        let (steps, any_existing) = self.plan(conn, model, &recorded)?;
        let existing_store = any_existing || from_version.is_some();
        if !steps.is_empty() && existing_store && !auto_migrate {
            return Err(Error::Migration(
                "store is incompatible with the model and automatic migration is disabled"
                    .to_string(),
            ));
        }

        let mut report = MigrationReport {
            from_version,
            to_version: model.version,
            ..Default::default()
        };

        let tx = conn.transaction()?;
        for step in &steps {
            match step {
                Step::CreateTable(entity) => {
                    tx.execute_batch(&create_table_sql(entity))?;
                    report.created_tables.push(entity.name.clone());
                }
                Step::AddColumn(entity, attribute) => {
                    tx.execute_batch(&add_column_sql(entity, attribute))?;
                    report
                        .added_columns
                        .push(format!("{}.{}", entity.name, attribute.name));
                }
            }
        }
        let mut types = recorded;
        types.extend(model_attribute_types(model));
        write_metadata(
            &tx,
            &[
                (STORE_METADATA_KEY_MODEL_VERSION, model.version.to_string()),
                (STORE_METADATA_KEY_ATTRIBUTE_TYPES, serde_json::to_string(&types)?),
            ],
        )?;
        tx.commit()?;

        if !report.is_empty() {
            tracing::info!(
                "Migrated store to model v{}: {} new tables, {} new columns",
                model.version,
                report.created_tables.len(),
                report.added_columns.len()
            );
        }
        Ok(report)
    }
}
