//! Live change-tracking sessions.
//!
//! A session attaches to an open connection and records row mutations made
//! through it, one coalesced change per row, in first-touch order. The
//! accumulated log can be flushed at any time as a changeset or patchset,
//! to a buffer or a stream, without disturbing the log itself.
//!
//! The session object is a thin lifetime-holder: it owns the capture hook
//! registered on the connection, a connection lock, and the managed
//! callback state. Disposing it detaches the hook and releases the lock;
//! the connection's own lifecycle is independent, but a session must not
//! outlive its connection.

mod diff;

use std::collections::HashSet;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::changeset::format::{
    encode_cell, full_image, key_image, ChangesetBuilder, Row, SetKind, TableHeader,
};
use crate::changeset::MemoryChangeset;
use crate::engine::{ConnectionLock, PreupdateEvent, SharedConnection, TableSchema};
use crate::error::{Error, ErrorCode, Result};
use crate::strm::{ChunkedWriter, DEFAULT_CHUNK_SIZE};
use crate::types::{ChangeOp, Value};

/// Construction-time session configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Keep `changeset_size` live. Off by default; sizing re-encodes the
    /// pending log.
    pub track_changeset_size: bool,
    /// Chunk size for streamed changeset output.
    pub stream_chunk_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            track_changeset_size: false,
            stream_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

type TableFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct SessionChange {
    op: ChangeOp,
    indirect: bool,
    old: Option<Vec<Value>>,
    new: Option<Vec<Value>>,
}

struct SessionTable {
    name: String,
    n_col: usize,
    pk: Vec<bool>,
    changes: IndexMap<Vec<u8>, SessionChange>,
}

impl SessionTable {
    fn from_schema(schema: &TableSchema) -> Self {
        Self {
            name: schema.name.clone(),
            n_col: schema.n_col(),
            pk: schema.pk_flags(),
            changes: IndexMap::new(),
        }
    }
}

pub(crate) struct SessionState {
    enabled: bool,
    indirect: bool,
    attach_all: bool,
    tables: IndexMap<String, SessionTable>,
    declined: HashSet<String>,
    filter: Option<TableFilter>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            enabled: true,
            indirect: false,
            attach_all: false,
            tables: IndexMap::new(),
            declined: HashSet::new(),
            filter: None,
        }
    }

    /// Capture path, invoked from the connection's pre-update hook.
    fn record(&mut self, event: &PreupdateEvent<'_>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let table_key = event.schema.name.to_lowercase();
        if !self.tables.contains_key(&table_key) {
            if !self.attach_all || self.declined.contains(&table_key) {
                return Ok(());
            }
            if let Some(ref filter) = self.filter {
                let name = event.schema.name.clone();
                let keep = catch_unwind(AssertUnwindSafe(|| filter(&name))).unwrap_or_else(|_| {
                    log::error!("table filter panicked on {}; tracking the table", name);
                    true
                });
                if !keep {
                    self.declined.insert(table_key);
                    return Ok(());
                }
            }
            if !event.schema.has_pk() {
                // tables without a primary key cannot be tracked
                self.declined.insert(table_key);
                return Ok(());
            }
            self.tables
                .insert(table_key.clone(), SessionTable::from_schema(event.schema));
        }
        let indirect = self.indirect;
        self.record_values(
            &table_key,
            event.op,
            event.old.map(|row| row.to_vec()),
            event.new.map(|row| row.to_vec()),
            indirect,
        )
    }

    /// Fold one change into the per-row log.
    fn record_values(
        &mut self,
        table_key: &str,
        op: ChangeOp,
        old: Option<Vec<Value>>,
        new: Option<Vec<Value>>,
        indirect: bool,
    ) -> Result<()> {
        let table = self
            .tables
            .get_mut(table_key)
            .ok_or_else(|| Error::new(ErrorCode::Internal))?;

        let keyed = match op {
            ChangeOp::Insert => new.as_ref(),
            ChangeOp::Update | ChangeOp::Delete => old.as_ref(),
        }
        .ok_or_else(|| Error::new(ErrorCode::Internal))?;
        if keyed.len() != table.n_col {
            return Err(Error::with_message(
                ErrorCode::Mismatch,
                format!("{} values for {} columns", keyed.len(), table.n_col),
            ));
        }
        let key = change_key(&table.pk, keyed);

        let existing_op = match table.changes.get(&key) {
            None => {
                table.changes.insert(
                    key,
                    SessionChange {
                        op,
                        indirect,
                        old,
                        new,
                    },
                );
                return Ok(());
            }
            Some(existing) => existing.op,
        };

        // a row inserted and then deleted within one session never happened
        if existing_op == ChangeOp::Insert && op == ChangeOp::Delete {
            table.changes.shift_remove(&key);
            return Ok(());
        }

        let existing = table.changes.get_mut(&key).expect("entry present");
        existing.indirect = existing.indirect && indirect;
        match (existing_op, op) {
            (ChangeOp::Insert, ChangeOp::Update) | (ChangeOp::Update, ChangeOp::Update) => {
                existing.new = new;
            }
            (ChangeOp::Update, ChangeOp::Delete) => {
                existing.op = ChangeOp::Delete;
                existing.new = None;
            }
            (ChangeOp::Delete, ChangeOp::Insert) => {
                existing.op = ChangeOp::Update;
                existing.new = new;
            }
            // remaining pairs cannot arise from a consistent engine
            _ => {}
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.tables.values().all(|table| table.changes.is_empty())
    }

    fn memory_used(&self) -> i64 {
        let mut total = 0i64;
        for table in self.tables.values() {
            total += table.name.len() as i64;
            total += table.pk.len() as i64;
            for (key, change) in &table.changes {
                total += key.len() as i64;
                for row in change.old.iter().chain(change.new.iter()) {
                    total += row.iter().map(|v| v.bytes() as i64).sum::<i64>();
                }
            }
        }
        total
    }

    /// Serialize the pending log.
    fn encode(&self, kind: SetKind) -> Result<Vec<u8>> {
        let mut builder = ChangesetBuilder::new(kind);
        for table in self.tables.values() {
            if table.changes.is_empty() {
                continue;
            }
            let header = TableHeader {
                table: table.name.clone(),
                n_col: table.n_col,
                pk: table.pk.clone(),
            };
            for change in table.changes.values() {
                let (old, new) = encode_images(change, kind, &table.pk);
                builder.push(&header, change.op, change.indirect, old.as_ref(), new.as_ref())?;
            }
        }
        Ok(builder.finish())
    }

    pub(crate) fn is_attached(&self, table_key: &str) -> bool {
        self.tables.contains_key(table_key)
    }

    pub(crate) fn attach_all(&self) -> bool {
        self.attach_all
    }

    pub(crate) fn attach_schema(&mut self, schema: &TableSchema) {
        let table_key = schema.name.to_lowercase();
        self.declined.remove(&table_key);
        if !self.tables.contains_key(&table_key) {
            self.tables
                .insert(table_key, SessionTable::from_schema(schema));
        }
    }

    pub(crate) fn load_change(
        &mut self,
        table_key: &str,
        op: ChangeOp,
        old: Option<Vec<Value>>,
        new: Option<Vec<Value>>,
    ) -> Result<()> {
        self.record_values(table_key, op, old, new, false)
    }
}

/// Row images for one serialized record. Patchsets reduce old images to
/// their key cells; changesets carry both images in full.
fn encode_images(
    change: &SessionChange,
    kind: SetKind,
    pk: &[bool],
) -> (Option<Row>, Option<Row>) {
    let old = change.old.as_deref().map(full_image);
    let new = change.new.as_deref().map(full_image);
    match kind {
        SetKind::Changeset => (old, new),
        SetKind::Patchset => match change.op {
            ChangeOp::Insert => (None, new),
            ChangeOp::Update | ChangeOp::Delete => {
                (old.map(|row| key_image(&row, pk)), new)
            }
        },
    }
}

fn change_key(pk: &[bool], values: &[Value]) -> Vec<u8> {
    let mut key = Vec::new();
    for (value, &is_pk) in values.iter().zip(pk.iter()) {
        if is_pk {
            encode_cell(&mut key, Some(value));
        }
    }
    key
}

// ============================================================================
// Session
// ============================================================================

/// Change-tracking object attached to a live connection.
pub struct Session {
    state: Arc<RwLock<SessionState>>,
    lock: ConnectionLock,
    hook_id: Option<u64>,
    options: SessionOptions,
}

impl Session {
    /// Attach a new session to `conn` with default options.
    pub fn new(conn: &SharedConnection) -> Result<Self> {
        Session::with_options(conn, SessionOptions::default())
    }

    /// Attach a new session to `conn`.
    pub fn with_options(conn: &SharedConnection, options: SessionOptions) -> Result<Self> {
        let lock = ConnectionLock::acquire(conn)?;
        let state = Arc::new(RwLock::new(SessionState::new()));
        let hook_state = state.clone();
        let hook_id = conn
            .write()
            .unwrap()
            .register_preupdate_hook(Box::new(move |event| {
                hook_state.write().unwrap().record(event)
            }));
        Ok(Self {
            state,
            lock,
            hook_id: Some(hook_id),
            options,
        })
    }

    /// Whether new changes are currently being recorded.
    pub fn is_enabled(&self) -> bool {
        self.state.read().unwrap().enabled
    }

    /// Start or stop recording. Disabling keeps already-tracked changes.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.state.write().unwrap().enabled = enabled;
    }

    /// Whether subsequent changes are recorded as indirect.
    pub fn is_indirect(&self) -> bool {
        self.state.read().unwrap().indirect
    }

    /// Mark subsequently-tracked changes as indirect (or not). Does not
    /// relabel changes already tracked.
    pub fn set_indirect(&mut self, indirect: bool) {
        self.state.write().unwrap().indirect = indirect;
    }

    /// True iff no changes are currently tracked.
    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().is_empty()
    }

    /// Begin tracking `table`, or every table if `None`.
    ///
    /// Explicitly attached tables bypass the table filter. Tables without a
    /// primary key cannot be tracked and are skipped. With `None`, tables
    /// attach lazily when their first change arrives, consulting the filter.
    pub fn attach_table(&mut self, table: Option<&str>) -> Result<()> {
        match table {
            Some(name) => {
                let schema = {
                    let conn = self.lock.connection().read().unwrap();
                    conn.table_schema(name)?.clone()
                };
                if !schema.has_pk() {
                    return Ok(());
                }
                self.state.write().unwrap().attach_schema(&schema);
                Ok(())
            }
            None => {
                self.state.write().unwrap().attach_all = true;
                Ok(())
            }
        }
    }

    /// Install (or clear, with `None`) the predicate deciding whether a
    /// not-yet-attached table should be tracked.
    pub fn set_table_filter<F>(&mut self, filter: Option<F>)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.state.write().unwrap().filter = filter.map(|f| Box::new(f) as TableFilter);
    }

    /// Flush the tracked-change log into an in-memory changeset.
    pub fn create_changeset(&self) -> Result<MemoryChangeset> {
        let data = self.state.read().unwrap().encode(SetKind::Changeset)?;
        MemoryChangeset::from_parts(self.lock.connection(), data, SetKind::Changeset)
    }

    /// Flush the tracked-change log into an in-memory patchset.
    pub fn create_patchset(&self) -> Result<MemoryChangeset> {
        let data = self.state.read().unwrap().encode(SetKind::Patchset)?;
        MemoryChangeset::from_parts(self.lock.connection(), data, SetKind::Patchset)
    }

    /// Stream the tracked-change log as a changeset.
    pub fn changeset_to_writer(&self, out: impl Write) -> Result<()> {
        let data = self.state.read().unwrap().encode(SetKind::Changeset)?;
        ChunkedWriter::new(out, self.options.stream_chunk_size).push_chunked(&data)
    }

    /// Stream the tracked-change log as a patchset.
    pub fn patchset_to_writer(&self, out: impl Write) -> Result<()> {
        let data = self.state.read().unwrap().encode(SetKind::Patchset)?;
        ChunkedWriter::new(out, self.options.stream_chunk_size).push_chunked(&data)
    }

    /// Approximate bytes held by the tracked-change log.
    pub fn memory_used(&self) -> i64 {
        self.state.read().unwrap().memory_used()
    }

    /// Serialized size of the pending changeset, when size tracking was
    /// enabled at construction; 0 otherwise.
    pub fn changeset_size(&self) -> i64 {
        if !self.options.track_changeset_size {
            return 0;
        }
        self.state
            .read()
            .unwrap()
            .encode(SetKind::Changeset)
            .map(|data| data.len() as i64)
            .unwrap_or(0)
    }

    /// Load the differences between `from`'s copy of `table` and this
    /// session's connection's copy as tracked changes.
    ///
    /// Both tables must share name, column set, and primary key definition.
    pub fn load_differences_from_table(
        &mut self,
        from: &SharedConnection,
        table: &str,
    ) -> Result<()> {
        diff::load_table_diff(&self.state, self.lock.connection(), from, table)
    }

    /// Detach from the connection: remove the capture hook and release the
    /// connection lock. Idempotent; dropping the session does the same.
    pub fn close(&mut self) {
        if let Some(id) = self.hook_id.take() {
            if let Ok(mut conn) = self.lock.connection().write() {
                conn.remove_preupdate_hook(id);
            }
        }
        self.lock.release();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
