//! Contexts: one connection plus the changes staged on it.
//!
//! A context is `Send` but not `Sync`: it belongs to one worker at a time.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use super::fetch::{Condition, FetchRequest, SqlQuery};
use super::quote_identifier;
use super::record::{check_value, Record, Value};
use crate::error::{Error, Result};
use crate::model::{EntityDescription, Model, ID_COLUMN};

/// A staged write.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Insert(Record),
    Update(Record),
    Delete { entity: String, id: i64 },
}

pub struct Context {
    conn: Connection,
    model: Arc<Model>,
    label: String,
    pending: Vec<Change>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("label", &self.label)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Context {
    pub fn new(conn: Connection, model: Arc<Model>, label: &str) -> Self {
        Self {
            conn,
            model,
            label: label.to_string(),
            pending: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_changes(&self) -> &[Change] {
        &self.pending
    }

    /// Discard staged changes.
    pub fn rollback(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(
                "Context {} discarded {} staged changes",
                self.label,
                self.pending.len()
            );
        }
        self.pending.clear();
    }

    /// Stage a new record.
    pub fn insert(&mut self, record: Record) -> Result<()> {
        let entity = self.model.require_entity(record.entity())?;
        for (key, value) in record.values() {
            let attribute = entity.attribute_named(key).ok_or_else(|| {
                Error::Validation(format!("'{}' is not an attribute of '{}'", key, entity.name))
            })?;
            check_value(&entity.name, attribute, value)?;
        }
        for attribute in entity.attributes.iter().filter(|a| !a.optional) {
            if record.get(&attribute.name).is_none() {
                return Err(Error::Validation(format!(
                    "{}.{} is required",
                    entity.name, attribute.name
                )));
            }
        }
        self.pending.push(Change::Insert(record));
        Ok(())
    }

    /// Stage changed attributes of a saved record. Attributes not present on
    /// the record are left untouched.
    pub fn update(&mut self, record: Record) -> Result<()> {
        let entity = self.model.require_entity(record.entity())?;
        if record.id().is_none() {
            return Err(Error::Validation(format!(
                "cannot update an unsaved '{}' record",
                entity.name
            )));
        }
        for (key, value) in record.values() {
            let attribute = entity.attribute_named(key).ok_or_else(|| {
                Error::Validation(format!("'{}' is not an attribute of '{}'", key, entity.name))
            })?;
            check_value(&entity.name, attribute, value)?;
        }
        self.pending.push(Change::Update(record));
        Ok(())
    }

    pub fn delete(&mut self, entity: &str, id: i64) -> Result<()> {
        self.model.require_entity(entity)?;
        self.pending.push(Change::Delete {
            entity: entity.to_string(),
            id,
        });
        Ok(())
    }

    /// Apply staged changes in one transaction. On failure nothing is
    /// written and the changes stay staged.
    pub fn save(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let tx = self.conn.transaction()?;
        for change in &self.pending {
            apply_change(&tx, change)?;
        }
        tx.commit()?;

        tracing::debug!(
            "Context {} saved {} changes in {}ms",
            self.label,
            self.pending.len(),
            started.elapsed().as_millis()
        );
        self.pending.clear();
        Ok(())
    }

    /// Run a fetch and return matching records in order.
    pub fn execute(&self, request: &FetchRequest) -> Result<Vec<Record>> {
        let entity = self.model.require_entity(&request.entity)?;
        let query = request.select_sql(entity)?;
        query_records(&self.conn, entity, &query)
    }

    /// Number of records a fetch would return.
    pub fn count(&self, request: &FetchRequest) -> Result<usize> {
        let entity = self.model.require_entity(&request.entity)?;
        let query = request.count_sql(entity)?;
        let count: i64 = self.conn.query_row(
            &query.sql,
            params_from_iter(query.args.iter()),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Run a fetch in pages of `request.batch_size` records. The callback may
    /// stop early by returning an error.
    ///
    /// On WAL stores every page comes from one read snapshot. Elsewhere an
    /// open read blocks writers, so each page is read on its own and no lock
    /// is held while the callback runs.
    pub fn fetch_batches<F>(&self, request: &FetchRequest, mut f: F) -> Result<()>
    where
        F: FnMut(Vec<Record>) -> Result<()>,
    {
        let entity = self.model.require_entity(&request.entity)?;
        if request.batch_size == 0 {
            let records = self.execute(request)?;
            if !records.is_empty() {
                f(records)?;
            }
            return Ok(());
        }

        let snapshot = if self.uses_wal()? {
            Some(self.conn.unchecked_transaction()?)
        } else {
            None
        };
        let mut offset = request.offset;
        let mut fetched = 0usize;
        loop {
            let mut page = request.batch_size;
            if request.limit > 0 {
                page = page.min(request.limit - fetched);
            }
            if page == 0 {
                break;
            }

            let query = request.select_page_sql(entity, page, offset)?;
            let records = query_records(&self.conn, entity, &query)?;
            let got = records.len();
            if got == 0 {
                break;
            }
            f(records)?;

            fetched += got;
            offset += got;
            if got < page {
                break;
            }
        }
        if let Some(snapshot) = snapshot {
            snapshot.commit()?;
        }
        Ok(())
    }

    fn uses_wal(&self) -> Result<bool> {
        let mode: String = self
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }

    /// Fetch a single record by id.
    pub fn existing_record(&self, entity: &str, id: i64) -> Result<Option<Record>> {
        let description = self.model.require_entity(entity)?;
        let request = FetchRequest::new(entity).with_condition(Condition::equals(ID_COLUMN, id));
        let query = request.select_sql(description)?;
        let mut stmt = self.conn.prepare(&query.sql)?;
        let record = stmt
            .query_row(params_from_iter(query.args.iter()), |row| {
                read_record(description, row)
            })
            .optional()?;
        Ok(record)
    }
}

fn query_records(
    conn: &Connection,
    entity: &EntityDescription,
    query: &SqlQuery,
) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(&query.sql)?;
    let rows = stmt.query_map(params_from_iter(query.args.iter()), |row| {
        read_record(entity, row)
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Columns come back as `id` followed by the attributes in model order.
fn read_record(entity: &EntityDescription, row: &Row<'_>) -> rusqlite::Result<Record> {
    let id: i64 = row.get(0)?;
    let mut values = BTreeMap::new();
    for (idx, attribute) in entity.attributes.iter().enumerate() {
        let value: Value = row.get(idx + 1)?;
        if value != Value::Null {
            values.insert(attribute.name.clone(), value);
        }
    }
    Ok(Record::from_row(entity.name.clone(), id, values))
}

fn apply_change(conn: &Connection, change: &Change) -> Result<()> {
    match change {
        Change::Insert(record) => {
            let mut columns = Vec::new();
            let mut args: Vec<&Value> = Vec::new();
            let id = record.id().map(Value::Integer);
            if let Some(id) = &id {
                columns.push(quote_identifier(ID_COLUMN));
                args.push(id);
            }
            for (key, value) in record.values() {
                columns.push(quote_identifier(key));
                args.push(value);
            }

            let table = quote_identifier(record.entity());
            if columns.is_empty() {
                conn.execute(&format!("INSERT INTO {} DEFAULT VALUES", table), [])?;
            } else {
                let placeholders = vec!["?"; columns.len()].join(", ");
                conn.execute(
                    &format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        table,
                        columns.join(", "),
                        placeholders
                    ),
                    params_from_iter(args),
                )?;
            }
        }
        Change::Update(record) => {
            let id = record.id().ok_or_else(|| {
                Error::Validation(format!("cannot update an unsaved '{}' record", record.entity()))
            })?;
            if record.is_empty() {
                return Ok(());
            }

            let mut assignments = Vec::new();
            let mut args: Vec<Value> = Vec::new();
            for (key, value) in record.values() {
                assignments.push(format!("{} = ?", quote_identifier(key)));
                args.push(value.clone());
            }
            args.push(Value::Integer(id));

            let changed = conn.execute(
                &format!(
                    "UPDATE {} SET {} WHERE {} = ?",
                    quote_identifier(record.entity()),
                    assignments.join(", "),
                    quote_identifier(ID_COLUMN)
                ),
                params_from_iter(args.iter()),
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("{} #{}", record.entity(), id)));
            }
        }
        Change::Delete { entity, id } => {
            let changed = conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    quote_identifier(entity),
                    quote_identifier(ID_COLUMN)
                ),
                params![id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("{} #{}", entity, id)));
            }
        }
    }
    Ok(())
}
