//! The row engine boundary.
//!
//! Change tracking and replay treat the database as an opaque row-mutation
//! source and sink. This module is that collaborator: named tables holding
//! rows keyed by their encoded primary key, a savepoint stack for atomic
//! replay, declared foreign keys for deferred violation counting, and
//! pre-update hooks through which live sessions capture mutations.
//!
//! Hooks receive a self-contained event (schema plus row images) and must
//! not re-enter the connection that fired them.

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{ChangeOp, Value};

mod lock;
mod schema;

pub use lock::ConnectionLock;
pub use schema::{Column, ForeignKey, TableSchema};

/// A connection shared between the application, sessions, and containers.
pub type SharedConnection = Arc<RwLock<Connection>>;

/// Mutation event delivered to pre-update hooks before the row changes.
pub struct PreupdateEvent<'a> {
    /// Schema of the affected table
    pub schema: &'a TableSchema,
    /// Operation about to be applied
    pub op: ChangeOp,
    /// Current row image (update/delete)
    pub old: Option<&'a [Value]>,
    /// Incoming row image (insert/update)
    pub new: Option<&'a [Value]>,
}

/// Pre-update hook. An error return aborts the mutation.
pub type PreupdateHook = Box<dyn Fn(&PreupdateEvent<'_>) -> Result<()> + Send + Sync>;

struct TableState {
    schema: TableSchema,
    rows: IndexMap<Vec<u8>, Vec<Value>>,
}

type Snapshot = Vec<(String, IndexMap<Vec<u8>, Vec<Value>>)>;

/// A live database connection.
pub struct Connection {
    tables: IndexMap<String, TableState>,
    hooks: Vec<(u64, PreupdateHook)>,
    next_hook_id: u64,
    savepoints: Vec<Snapshot>,
    open_stmts: usize,
    closed: bool,
}

impl Connection {
    /// Create a new empty connection.
    pub fn new() -> Self {
        Self {
            tables: IndexMap::new(),
            hooks: Vec::new(),
            next_hook_id: 1,
            savepoints: Vec::new(),
            open_stmts: 0,
            closed: false,
        }
    }

    /// Create a new connection behind the shared handle the rest of the
    /// crate works with.
    pub fn open() -> SharedConnection {
        Arc::new(RwLock::new(Connection::new()))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::with_message(ErrorCode::Misuse, "connection is closed"));
        }
        Ok(())
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the connection. Fails with `Busy` while statements (connection
    /// locks) are still open.
    pub fn close(&mut self) -> Result<()> {
        if self.open_stmts > 0 {
            log::warn!(
                "close refused: {} statement(s) still open on connection",
                self.open_stmts
            );
            return Err(Error::with_message(
                ErrorCode::Busy,
                "unfinalized statements outstanding",
            ));
        }
        self.closed = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------

    /// Define a new table.
    pub fn create_table(&mut self, schema: TableSchema) -> Result<()> {
        self.check_open()?;
        if schema.columns.is_empty() {
            return Err(Error::with_message(ErrorCode::Misuse, "table has no columns"));
        }
        let key = schema.name.to_lowercase();
        if self.tables.contains_key(&key) {
            return Err(Error::with_message(
                ErrorCode::Error,
                format!("table already exists: {}", schema.name),
            ));
        }
        self.tables.insert(
            key,
            TableState {
                schema,
                rows: IndexMap::new(),
            },
        );
        Ok(())
    }

    /// Look up a table's schema.
    pub fn table_schema(&self, table: &str) -> Result<&TableSchema> {
        self.check_open()?;
        self.table(table).map(|t| &t.schema)
    }

    /// Names of all tables, in creation order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.values().map(|t| t.schema.name.clone()).collect()
    }

    fn table(&self, table: &str) -> Result<&TableState> {
        self.tables.get(&table.to_lowercase()).ok_or_else(|| {
            Error::with_message(ErrorCode::NotFound, format!("no such table: {}", table))
        })
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut TableState> {
        self.tables.get_mut(&table.to_lowercase()).ok_or_else(|| {
            Error::with_message(ErrorCode::NotFound, format!("no such table: {}", table))
        })
    }

    // ------------------------------------------------------------------
    // Row mutation
    // ------------------------------------------------------------------

    /// Insert a full row. Fails with `Constraint` on a duplicate or NULL
    /// primary key.
    pub fn insert(&mut self, table: &str, values: Vec<Value>) -> Result<()> {
        self.check_open()?;
        let state = self.table(table)?;
        check_row_shape(&state.schema, &values)?;
        let key = pk_key(&state.schema, &values);
        if state.rows.contains_key(&key) {
            return Err(Error::with_message(
                ErrorCode::Constraint,
                format!("UNIQUE constraint failed: {}", state.schema.name),
            ));
        }
        self.fire_hooks(table, ChangeOp::Insert, None, Some(&values))?;
        let state = self.table_mut(table)?;
        state.rows.insert(key, values);
        Ok(())
    }

    /// Overwrite the row addressed by the primary key inside `values`.
    /// Fails with `NotFound` if no such row exists.
    pub fn update(&mut self, table: &str, values: Vec<Value>) -> Result<()> {
        self.check_open()?;
        let state = self.table(table)?;
        check_row_shape(&state.schema, &values)?;
        let key = pk_key(&state.schema, &values);
        let old = state.rows.get(&key).cloned().ok_or_else(|| {
            Error::with_message(ErrorCode::NotFound, format!("row not found in {}", table))
        })?;
        self.fire_hooks(table, ChangeOp::Update, Some(&old), Some(&values))?;
        let state = self.table_mut(table)?;
        state.rows.insert(key, values);
        Ok(())
    }

    /// Delete the row addressed by `pk_cells` (primary-key values in
    /// declaration order). Fails with `NotFound` if no such row exists.
    pub fn delete(&mut self, table: &str, pk_cells: &[Value]) -> Result<()> {
        self.check_open()?;
        let state = self.table(table)?;
        let key = pk_cells_key(&state.schema, pk_cells)?;
        let old = state.rows.get(&key).cloned().ok_or_else(|| {
            Error::with_message(ErrorCode::NotFound, format!("row not found in {}", table))
        })?;
        self.fire_hooks(table, ChangeOp::Delete, Some(&old), None)?;
        let state = self.table_mut(table)?;
        state.rows.shift_remove(&key);
        Ok(())
    }

    /// Read the row addressed by `pk_cells`, if present.
    pub fn read_row(&self, table: &str, pk_cells: &[Value]) -> Result<Option<Vec<Value>>> {
        self.check_open()?;
        let state = self.table(table)?;
        let key = pk_cells_key(&state.schema, pk_cells)?;
        Ok(state.rows.get(&key).cloned())
    }

    /// All rows of a table, in insertion order.
    pub fn scan(&self, table: &str) -> Result<Vec<Vec<Value>>> {
        self.check_open()?;
        Ok(self.table(table)?.rows.values().cloned().collect())
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> Result<usize> {
        self.check_open()?;
        Ok(self.table(table)?.rows.len())
    }

    fn fire_hooks(
        &self,
        table: &str,
        op: ChangeOp,
        old: Option<&[Value]>,
        new: Option<&[Value]>,
    ) -> Result<()> {
        if self.hooks.is_empty() {
            return Ok(());
        }
        let schema = &self.table(table)?.schema;
        let event = PreupdateEvent {
            schema,
            op,
            old,
            new,
        };
        for (_, hook) in &self.hooks {
            hook(&event)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Register a pre-update hook; returns an id for removal.
    pub fn register_preupdate_hook(&mut self, hook: PreupdateHook) -> u64 {
        let id = self.next_hook_id;
        self.next_hook_id += 1;
        self.hooks.push((id, hook));
        id
    }

    /// Remove a previously registered hook. Removing twice is a no-op.
    pub fn remove_preupdate_hook(&mut self, id: u64) {
        self.hooks.retain(|(hook_id, _)| *hook_id != id);
    }

    // ------------------------------------------------------------------
    // Savepoints
    // ------------------------------------------------------------------

    /// Open a savepoint covering every table's rows.
    pub fn savepoint(&mut self) -> Result<()> {
        self.check_open()?;
        let snapshot = self
            .tables
            .iter()
            .map(|(key, state)| (key.clone(), state.rows.clone()))
            .collect();
        self.savepoints.push(snapshot);
        Ok(())
    }

    /// Roll back to and discard the most recent savepoint.
    pub fn rollback(&mut self) -> Result<()> {
        let snapshot = self
            .savepoints
            .pop()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "no open savepoint"))?;
        for (key, rows) in snapshot {
            if let Some(state) = self.tables.get_mut(&key) {
                state.rows = rows;
            }
        }
        Ok(())
    }

    /// Discard the most recent savepoint, keeping all changes.
    pub fn release_savepoint(&mut self) -> Result<()> {
        self.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "no open savepoint"))
    }

    // ------------------------------------------------------------------
    // Foreign keys
    // ------------------------------------------------------------------

    /// Count rows whose declared foreign-key value has no parent row.
    pub fn foreign_key_violations(&self) -> i64 {
        let mut violations = 0;
        for state in self.tables.values() {
            for fk in &state.schema.foreign_keys {
                let parent = self.tables.get(&fk.parent_table.to_lowercase());
                for row in state.rows.values() {
                    let value = match row.get(fk.column) {
                        Some(v) if !v.is_null() => v,
                        _ => continue,
                    };
                    let found = parent.is_some_and(|p| {
                        let pk = p.schema.pk_indices();
                        pk.len() == 1
                            && p.rows.values().any(|parent_row| &parent_row[pk[0]] == value)
                    });
                    if !found {
                        violations += 1;
                    }
                }
            }
        }
        violations
    }

    // ------------------------------------------------------------------
    // Statement accounting (connection locks)
    // ------------------------------------------------------------------

    pub(crate) fn open_statement(&mut self) -> Result<()> {
        self.check_open()?;
        self.open_stmts += 1;
        Ok(())
    }

    pub(crate) fn close_statement(&mut self) {
        if self.open_stmts == 0 {
            log::warn!("statement finalized with none outstanding");
            return;
        }
        self.open_stmts -= 1;
    }
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}

fn check_row_shape(schema: &TableSchema, values: &[Value]) -> Result<()> {
    if values.len() != schema.n_col() {
        return Err(Error::with_message(
            ErrorCode::Mismatch,
            format!(
                "{} values for {} columns in {}",
                values.len(),
                schema.n_col(),
                schema.name
            ),
        ));
    }
    for idx in schema.pk_indices() {
        if values[idx].is_null() {
            return Err(Error::with_message(
                ErrorCode::Constraint,
                format!("NOT NULL constraint failed: {}", schema.name),
            ));
        }
    }
    Ok(())
}

/// Encode the primary-key cells of a full row into a lookup key.
pub(crate) fn pk_key(schema: &TableSchema, row: &[Value]) -> Vec<u8> {
    let mut key = Vec::new();
    for idx in schema.pk_indices() {
        key_value(&mut key, &row[idx]);
    }
    key
}

fn pk_cells_key(schema: &TableSchema, pk_cells: &[Value]) -> Result<Vec<u8>> {
    let pk = schema.pk_indices();
    if pk_cells.len() != pk.len() {
        return Err(Error::with_message(
            ErrorCode::Mismatch,
            format!(
                "{} key values for {} primary-key columns in {}",
                pk_cells.len(),
                pk.len(),
                schema.name
            ),
        ));
    }
    let mut key = Vec::new();
    for cell in pk_cells {
        key_value(&mut key, cell);
    }
    Ok(key)
}

// Deterministic cell serialization for row keys. Keys never leave the
// process, so this is independent of the changeset wire format.
fn key_value(key: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => key.push(0),
        Value::Integer(i) => {
            key.push(1);
            key.extend_from_slice(&i.to_be_bytes());
        }
        Value::Real(f) => {
            key.push(2);
            key.extend_from_slice(&f.to_be_bytes());
        }
        Value::Text(s) => {
            key.push(3);
            key.extend_from_slice(&(s.len() as u64).to_be_bytes());
            key.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            key.push(4);
            key.extend_from_slice(&(b.len() as u64).to_be_bytes());
            key.extend_from_slice(b);
        }
    }
}
