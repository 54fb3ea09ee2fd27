//! Records: one row of one entity.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::model::{AttributeDescription, AttributeType};

pub use rusqlite::types::Value;

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    entity: String,
    id: Option<i64>,
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            id: None,
            values: BTreeMap::new(),
        }
    }

    /// Builder form of [`Record::set`].
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn set_date(&mut self, key: &str, value: DateTime<Utc>) {
        self.set(key, value.timestamp_millis());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Row id. `None` until the record has been saved and fetched back.
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn real(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(Value::Real(f)) => Some(*f),
            Some(Value::Integer(i)) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn boolean(&self, key: &str) -> Option<bool> {
        self.integer(key).map(|i| i != 0)
    }

    pub fn blob(&self, key: &str) -> Option<&[u8]> {
        match self.values.get(key) {
            Some(Value::Blob(b)) => Some(b),
            _ => None,
        }
    }

    pub fn date(&self, key: &str) -> Option<DateTime<Utc>> {
        self.integer(key)
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn from_row(entity: String, id: i64, values: BTreeMap<String, Value>) -> Self {
        Self {
            entity,
            id: Some(id),
            values,
        }
    }
}

/// Check a value against the attribute it is stored in.
pub(crate) fn check_value(
    entity: &str,
    attribute: &AttributeDescription,
    value: &Value,
) -> Result<()> {
    let ok = match (attribute.attribute_type, value) {
        (_, Value::Null) => attribute.optional,
        (AttributeType::Integer, Value::Integer(_)) => true,
        (AttributeType::Date, Value::Integer(_)) => true,
        (AttributeType::Boolean, Value::Integer(i)) => *i == 0 || *i == 1,
        (AttributeType::Real, Value::Real(_) | Value::Integer(_)) => true,
        (AttributeType::Text, Value::Text(_)) => true,
        (AttributeType::Blob, Value::Blob(_)) => true,
        _ => false,
    };

    if ok {
        Ok(())
    } else if *value == Value::Null {
        Err(Error::Validation(format!(
            "{}.{} is required",
            entity, attribute.name
        )))
    } else {
        Err(Error::Validation(format!(
            "{}.{} expects {} but got {:?}",
            entity, attribute.name, attribute.attribute_type, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let mut record = Record::new("Person")
            .with("name", "Ada".to_string())
            .with("age", 36i64)
            .with("active", true)
            .with("score", 9.5f64)
            .with("avatar", vec![1u8, 2, 3]);
        let born = Utc.with_ymd_and_hms(1815, 12, 10, 0, 0, 0).unwrap();
        record.set_date("born", born);

        assert_eq!(record.entity(), "Person");
        assert_eq!(record.id(), None);
        assert_eq!(record.text("name"), Some("Ada"));
        assert_eq!(record.integer("age"), Some(36));
        assert_eq!(record.boolean("active"), Some(true));
        assert_eq!(record.real("score"), Some(9.5));
        assert_eq!(record.real("age"), Some(36.0));
        assert_eq!(record.blob("avatar"), Some(&[1u8, 2, 3][..]));
        assert_eq!(record.date("born"), Some(born));
        assert_eq!(record.text("age"), None);
        assert_eq!(record.len(), 6);
    }

    #[test]
    fn test_check_value() {
        let name = AttributeDescription::new("name", AttributeType::Text).required();
        assert!(check_value("Person", &name, &Value::Text("Ada".to_string())).is_ok());
        assert!(check_value("Person", &name, &Value::Null).is_err());
        assert!(check_value("Person", &name, &Value::Integer(1)).is_err());

        let flag = AttributeDescription::new("flag", AttributeType::Boolean);
        assert!(check_value("Person", &flag, &Value::Integer(1)).is_ok());
        assert!(check_value("Person", &flag, &Value::Integer(2)).is_err());
        assert!(check_value("Person", &flag, &Value::Null).is_ok());

        let score = AttributeDescription::new("score", AttributeType::Real);
        assert!(check_value("Person", &score, &Value::Integer(3)).is_ok());
    }
}
