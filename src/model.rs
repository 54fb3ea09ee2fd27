//! Model definitions and the providers that load them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// File suffix picked up by [`ResourceBundle`].
pub const MODEL_FILE_SUFFIX: &str = ".model.json";

/// Column every entity table carries as its primary key.
pub const ID_COLUMN: &str = "id";

/// Attribute storage type.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    /// Unix milliseconds, UTC.
    Date,
}

impl AttributeType {
    /// SQLite column affinity.
    pub fn affinity(&self) -> &'static str {
        match self {
            AttributeType::Integer | AttributeType::Boolean | AttributeType::Date => "INTEGER",
            AttributeType::Real => "REAL",
            AttributeType::Text => "TEXT",
            AttributeType::Blob => "BLOB",
        }
    }
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeType::Integer => write!(f, "integer"),
            AttributeType::Real => write!(f, "real"),
            AttributeType::Text => write!(f, "text"),
            AttributeType::Blob => write!(f, "blob"),
            AttributeType::Boolean => write!(f, "boolean"),
            AttributeType::Date => write!(f, "date"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AttributeDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    #[serde(default = "default_optional")]
    pub optional: bool,
}

fn default_optional() -> bool {
    true
}

impl AttributeDescription {
    pub fn new(name: &str, attribute_type: AttributeType) -> Self {
        Self {
            name: name.to_string(),
            attribute_type,
            optional: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescription>,
}

impl EntityDescription {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: Vec::new(),
        }
    }

    pub fn attribute(mut self, attribute: AttributeDescription) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn attribute_named(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// True for declared attributes and the implicit id column.
    pub fn has_key(&self, key: &str) -> bool {
        key == ID_COLUMN || self.attribute_named(key).is_some()
    }
}

/// Schema definition describing record types and their fields.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Model {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub entities: Vec<EntityDescription>,
}

fn default_version() -> u32 {
    1
}

impl Model {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            entities: Vec::new(),
        }
    }

    pub fn entity(mut self, entity: EntityDescription) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn entity_named(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Look up an entity, failing with `NotFound` when it is not modelled.
    pub fn require_entity(&self, name: &str) -> Result<&EntityDescription> {
        self.entity_named(name)
            .ok_or_else(|| Error::NotFound(format!("entity '{}' is not in the model", name)))
    }

    /// Merge several models. The highest version wins; entity names must be
    /// unique across the inputs.
    pub fn merged(models: Vec<Model>) -> Result<Model> {
        let mut merged = Model::new(0);
        for model in models {
            merged.version = merged.version.max(model.version);
            for entity in model.entities {
                if merged.entity_named(&entity.name).is_some() {
                    return Err(Error::Model(format!(
                        "entity '{}' is defined more than once",
                        entity.name
                    )));
                }
                merged.entities.push(entity);
            }
        }
        Ok(merged)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entities.is_empty() {
            return Err(Error::Model("model defines no entities".to_string()));
        }

        let mut entity_names = HashSet::new();
        for entity in &self.entities {
            validate_identifier(&entity.name)?;
            if entity.name.to_ascii_lowercase().starts_with("kern_")
                || entity.name.to_ascii_lowercase().starts_with("sqlite_")
            {
                return Err(Error::Model(format!(
                    "entity name '{}' uses a reserved prefix",
                    entity.name
                )));
            }
            if !entity_names.insert(entity.name.to_ascii_lowercase()) {
                return Err(Error::Model(format!(
                    "entity '{}' is defined more than once",
                    entity.name
                )));
            }

            let mut attribute_names = HashSet::new();
            for attribute in &entity.attributes {
                validate_identifier(&attribute.name)?;
                if attribute.name.eq_ignore_ascii_case(ID_COLUMN) {
                    return Err(Error::Model(format!(
                        "{}.{} clashes with the implicit id column",
                        entity.name, attribute.name
                    )));
                }
                if !attribute_names.insert(attribute.name.to_ascii_lowercase()) {
                    return Err(Error::Model(format!(
                        "{}.{} is defined more than once",
                        entity.name, attribute.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Entity and attribute names become SQL identifiers, so keep them plain.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Model(format!("'{}' is not a valid identifier", name)))
    }
}

/// Supplies the model a store is built from.
pub trait SchemaProvider: Send + Sync {
    /// `Ok(None)` means no model could be found.
    fn load_model(&self) -> Result<Option<Model>>;

    /// Human readable source, used in diagnostics.
    fn describe(&self) -> String;
}

/// A model held in memory.
#[derive(Clone, Debug)]
pub struct StaticSchema(pub Model);

impl SchemaProvider for StaticSchema {
    fn load_model(&self) -> Result<Option<Model>> {
        Ok(Some(self.0.clone()))
    }

    fn describe(&self) -> String {
        format!("static model v{}", self.0.version)
    }
}

/// Merges every `*.model.json` file found in a resource directory.
#[derive(Clone, Debug)]
pub struct ResourceBundle {
    dir: PathBuf,
}

impl ResourceBundle {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn model_files(&self) -> Result<Vec<PathBuf>> {
        let pattern = format!(
            "{}/*{}",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            MODEL_FILE_SUFFIX
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("bad resource pattern {}: {}", pattern, e)))?;

        let mut files = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) => files.push(path),
                Err(e) => tracing::warn!("Skipping unreadable model file: {}", e),
            }
        }
        files.sort();
        Ok(files)
    }
}

impl SchemaProvider for ResourceBundle {
    fn load_model(&self) -> Result<Option<Model>> {
        let files = self.model_files()?;
        if files.is_empty() {
            return Ok(None);
        }

        let mut models = Vec::with_capacity(files.len());
        for path in &files {
            let content = std::fs::read_to_string(path)?;
            let model: Model = serde_json::from_str(&content)
                .map_err(|e| Error::Model(format!("{}: {}", path.display(), e)))?;
            tracing::debug!("Loaded model file {}", path.display());
            models.push(model);
        }

        Model::merged(models).map(Some)
    }

    fn describe(&self) -> String {
        format!("resource bundle {}", self.dir.display())
    }
}
