//! Fetch requests: declarative query descriptors and their SQL rendering.

use std::collections::BTreeMap;

use super::quote_identifier;
use super::record::Value;
use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::{Error, Result};
use crate::model::{EntityDescription, ID_COLUMN};

/// Filter applied to a fetch request.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// Every key equals its value. `Null` matches with `IS NULL`.
    Equals(BTreeMap<String, Value>),
    /// A raw SQL boolean expression with positional `?` placeholders.
    Predicate { clause: String, args: Vec<Value> },
    /// All conditions hold.
    And(Vec<Condition>),
}

impl Condition {
    pub fn equals(key: &str, value: impl Into<Value>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), value.into());
        Condition::Equals(map)
    }

    pub fn predicate<I>(clause: &str, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Condition::Predicate {
            clause: clause.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn render(&self, entity: &EntityDescription, args: &mut Vec<Value>) -> Result<String> {
        match self {
            Condition::Equals(map) => {
                if map.is_empty() {
                    return Ok("1 = 1".to_string());
                }
                let mut parts = Vec::with_capacity(map.len());
                for (key, value) in map {
                    require_key(entity, key)?;
                    if *value == Value::Null {
                        parts.push(format!("{} IS NULL", quote_identifier(key)));
                    } else {
                        parts.push(format!("{} = ?", quote_identifier(key)));
                        args.push(value.clone());
                    }
                }
                Ok(format!("({})", parts.join(" AND ")))
            }
            Condition::Predicate { clause, args: own } => {
                if clause.trim().is_empty() {
                    return Err(Error::Fetch("empty predicate".to_string()));
                }
                args.extend(own.iter().cloned());
                Ok(format!("({})", clause))
            }
            Condition::And(conditions) => {
                if conditions.is_empty() {
                    return Ok("1 = 1".to_string());
                }
                let parts = conditions
                    .iter()
                    .map(|c| c.render(entity, args))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(" AND ")))
            }
        }
    }
}

impl From<&str> for Condition {
    fn from(clause: &str) -> Self {
        Condition::Predicate {
            clause: clause.to_string(),
            args: Vec::new(),
        }
    }
}

impl From<BTreeMap<String, Value>> for Condition {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Condition::Equals(map)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ascending: true,
        }
    }

    pub fn descending(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ascending: false,
        }
    }

    /// Parse `"name ASC, age DESC"`. A bare key sorts ascending.
    pub fn parse_list(input: &str) -> Result<Vec<SortDescriptor>> {
        let mut sort = Vec::new();
        for part in input.split(',') {
            let mut words = part.split_whitespace();
            let key = match words.next() {
                Some(key) => key,
                None => continue,
            };
            let ascending = match words.next() {
                None => true,
                Some(dir) if dir.eq_ignore_ascii_case("asc") => true,
                Some(dir) if dir.eq_ignore_ascii_case("desc") => false,
                Some(dir) => {
                    return Err(Error::Fetch(format!(
                        "unknown sort direction '{}' for '{}'",
                        dir, key
                    )))
                }
            };
            if words.next().is_some() {
                return Err(Error::Fetch(format!("malformed sort clause '{}'", part.trim())));
            }
            sort.push(SortDescriptor {
                key: key.to_string(),
                ascending,
            });
        }
        Ok(sort)
    }
}

/// Query descriptor: entity, filter, sort and limit.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchRequest {
    pub entity: String,
    pub condition: Option<Condition>,
    pub sort: Vec<SortDescriptor>,
    /// 0 means unlimited.
    pub limit: usize,
    pub offset: usize,
    /// Rows per page for [`crate::store::Context::fetch_batches`]. 0 fetches
    /// everything in one page.
    pub batch_size: usize,
}

/// Rendered SQL plus its positional arguments.
#[derive(Debug)]
pub(crate) struct SqlQuery {
    pub sql: String,
    pub args: Vec<Value>,
}

impl FetchRequest {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            condition: None,
            sort: Vec::new(),
            limit: 0,
            offset: 0,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<Condition>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_sort(mut self, sort: Vec<SortDescriptor>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn check_entity(&self, entity: &EntityDescription) -> Result<()> {
        if entity.name != self.entity {
            return Err(Error::Fetch(format!(
                "request for '{}' rendered against '{}'",
                self.entity, entity.name
            )));
        }
        Ok(())
    }

    fn where_sql(&self, entity: &EntityDescription, args: &mut Vec<Value>) -> Result<String> {
        match &self.condition {
            Some(condition) => Ok(format!(" WHERE {}", condition.render(entity, args)?)),
            None => Ok(String::new()),
        }
    }

    fn order_sql(&self, entity: &EntityDescription) -> Result<String> {
        let mut terms = Vec::with_capacity(self.sort.len() + 1);
        let mut has_id = false;
        for descriptor in &self.sort {
            require_key(entity, &descriptor.key)?;
            has_id |= descriptor.key == ID_COLUMN;
            terms.push(format!(
                "{} {}",
                quote_identifier(&descriptor.key),
                if descriptor.ascending { "ASC" } else { "DESC" }
            ));
        }
        // id breaks ties so paging is stable
        if !has_id {
            terms.push(format!("{} ASC", quote_identifier(ID_COLUMN)));
        }
        Ok(format!(" ORDER BY {}", terms.join(", ")))
    }

    fn limit_sql(limit: usize, offset: usize) -> String {
        // SQLite limits are signed 64-bit
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        match (limit, offset) {
            (0, 0) => String::new(),
            (0, offset) => format!(" LIMIT -1 OFFSET {}", offset),
            (limit, 0) => format!(" LIMIT {}", limit),
            (limit, offset) => format!(" LIMIT {} OFFSET {}", limit, offset),
        }
    }

    fn columns(entity: &EntityDescription) -> String {
        std::iter::once(ID_COLUMN)
            .chain(entity.attributes.iter().map(|a| a.name.as_str()))
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn select_sql(&self, entity: &EntityDescription) -> Result<SqlQuery> {
        self.select_page_sql(entity, self.limit, self.offset)
    }

    /// Select with an explicit window, used for paging.
    pub(crate) fn select_page_sql(
        &self,
        entity: &EntityDescription,
        limit: usize,
        offset: usize,
    ) -> Result<SqlQuery> {
        self.check_entity(entity)?;
        let mut args = Vec::new();
        let sql = format!(
            "SELECT {} FROM {}{}{}{}",
            Self::columns(entity),
            quote_identifier(&entity.name),
            self.where_sql(entity, &mut args)?,
            self.order_sql(entity)?,
            Self::limit_sql(limit, offset),
        );
        Ok(SqlQuery { sql, args })
    }

    /// Count of rows the select would return, limit and offset included.
    pub(crate) fn count_sql(&self, entity: &EntityDescription) -> Result<SqlQuery> {
        self.check_entity(entity)?;
        let mut args = Vec::new();
        let sql = format!(
            "SELECT COUNT(*) FROM (SELECT {} FROM {}{}{})",
            quote_identifier(ID_COLUMN),
            quote_identifier(&entity.name),
            self.where_sql(entity, &mut args)?,
            Self::limit_sql(self.limit, self.offset),
        );
        Ok(SqlQuery { sql, args })
    }
}

fn require_key(entity: &EntityDescription, key: &str) -> Result<()> {
    if entity.has_key(key) {
        Ok(())
    } else {
        Err(Error::Fetch(format!(
            "'{}' is not an attribute of '{}'",
            key, entity.name
        )))
    }
}
