//! Changeset replay with conflict resolution.
//!
//! Records are applied strictly in capture order. Every row-level conflict
//! is put to the caller's conflict handler, whose action drives a small
//! state machine: `Omit` skips the record, `Replace` forces the change
//! through (legal only for data and insert conflicts), `Abort` rolls back
//! everything applied so far. The whole replay runs inside a savepoint so
//! an abort leaves the target exactly as it was.
//!
//! Handler and filter callbacks sit on the other side of an internal
//! boundary: a panic raised inside one is caught here, logged, and mapped
//! to a conservative default instead of unwinding through the replay.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use bitflags::bitflags;

use crate::changeset::format::{full_image, pk_cells, Row};
use crate::changeset::iter::{ChangeRecord, ChangesetIter};
use crate::engine::{SharedConnection, TableSchema};
use crate::error::{Error, ErrorCode, Result};
use crate::types::{ChangeOp, Value};

/// Kind of conflict encountered while applying one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// The target row exists but its current values differ from the
    /// recorded old values.
    Data,
    /// The target row for an update or delete does not exist.
    NotFound,
    /// An insert collides with an existing row under the same primary key.
    Conflict,
    /// Applying the change would violate a constraint.
    Constraint,
    /// Outstanding foreign-key violations after all records were applied.
    ForeignKey,
}

/// Caller's decision for one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Skip this record and continue.
    Omit,
    /// Force the change through. Legal only for `Data` and `Conflict`.
    Replace,
    /// Roll back the whole apply call.
    Abort,
}

/// What to do when a conflict handler panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicPolicy {
    /// Treat the panic as `Abort` (default).
    #[default]
    Abort,
    /// Treat the panic as `Omit`.
    Omit,
}

bitflags! {
    /// Flags modifying `apply`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ApplyFlags: u32 {
        /// Do not wrap the replay in a savepoint; the caller manages the
        /// enclosing transaction.
        const NO_SAVEPOINT = 0x01;
    }
}

/// Configuration for one `apply` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub flags: ApplyFlags,
    pub panic_policy: PanicPolicy,
}

enum TableDisposition {
    Apply(TableSchema),
    Skip,
}

/// Replay every record the iterator yields against `conn`.
pub(crate) fn apply_iter<F, C>(
    conn: &SharedConnection,
    iter: &mut ChangesetIter<'_>,
    filter: Option<F>,
    conflict: C,
    options: &ApplyOptions,
) -> Result<()>
where
    F: FnMut(&str) -> bool,
    C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
{
    let use_savepoint = !options.flags.contains(ApplyFlags::NO_SAVEPOINT);
    if use_savepoint {
        conn.write().unwrap().savepoint()?;
    }
    let result = apply_records(conn, iter, filter, conflict, options);
    let mut guard = conn.write().unwrap();
    match result {
        Ok(()) => {
            if use_savepoint {
                guard.release_savepoint()?;
            }
            Ok(())
        }
        Err(err) => {
            if use_savepoint {
                let _ = guard.rollback();
            }
            Err(err)
        }
    }
}

fn apply_records<F, C>(
    conn: &SharedConnection,
    iter: &mut ChangesetIter<'_>,
    mut filter: Option<F>,
    mut conflict: C,
    options: &ApplyOptions,
) -> Result<()>
where
    F: FnMut(&str) -> bool,
    C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
{
    let mut tables: HashMap<String, TableDisposition> = HashMap::new();

    while iter.next()? {
        let record = iter.current()?.clone();
        let table_key = record.table_name().to_lowercase();

        if !tables.contains_key(&table_key) {
            let disposition = evaluate_table(conn, record.table_name(), filter.as_mut());
            tables.insert(table_key.clone(), disposition);
        }
        let schema = match tables.get(&table_key).expect("cached") {
            TableDisposition::Skip => continue,
            TableDisposition::Apply(schema) => schema.clone(),
        };

        if record.column_count() != schema.n_col()
            || record.primary_key_columns() != schema.pk_flags()
        {
            return Err(Error::with_message(
                ErrorCode::Schema,
                format!(
                    "definition of table {} changed since the changeset was captured",
                    record.table_name()
                ),
            ));
        }

        apply_record(conn, &schema, record, &mut conflict, options)?;
    }

    let violations = conn.read().unwrap().foreign_key_violations();
    if violations > 0 {
        let report = ChangeRecord::foreign_key_report(violations);
        match invoke_conflict(&mut conflict, ConflictType::ForeignKey, &report, options)? {
            // commit despite the violation
            ConflictAction::Omit => {}
            ConflictAction::Abort => return Err(abort()),
            ConflictAction::Replace => unreachable!("rejected by invoke_conflict"),
        }
    }
    Ok(())
}

fn evaluate_table<F>(
    conn: &SharedConnection,
    table: &str,
    filter: Option<&mut F>,
) -> TableDisposition
where
    F: FnMut(&str) -> bool,
{
    if let Some(filter) = filter {
        if !invoke_filter(filter, table) {
            return TableDisposition::Skip;
        }
    }
    match conn.read().unwrap().table_schema(table) {
        Ok(schema) => TableDisposition::Apply(schema.clone()),
        Err(_) => {
            log::warn!("changeset references missing table {}; skipping it", table);
            TableDisposition::Skip
        }
    }
}

fn apply_record<C>(
    conn: &SharedConnection,
    schema: &TableSchema,
    mut record: ChangeRecord,
    conflict: &mut C,
    options: &ApplyOptions,
) -> Result<()>
where
    C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
{
    match record.operation() {
        ChangeOp::Insert => apply_insert(conn, schema, &mut record, conflict, options),
        ChangeOp::Update => apply_update(conn, schema, &mut record, conflict, options),
        ChangeOp::Delete => apply_delete(conn, schema, &mut record, conflict, options),
    }
}

fn apply_insert<C>(
    conn: &SharedConnection,
    schema: &TableSchema,
    record: &mut ChangeRecord,
    conflict: &mut C,
    options: &ApplyOptions,
) -> Result<()>
where
    C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
{
    let table = schema.name.clone();
    let new_image = required_image(record.new_image())?;
    let values = materialize(&new_image);
    let pk = pk_cells(&new_image, record.primary_key_columns())?;

    let existing = conn.read().unwrap().read_row(&table, &pk)?;
    if let Some(current) = existing {
        record.set_conflict_row(Some(full_image(&current)));
        return match invoke_conflict(conflict, ConflictType::Conflict, record, options)? {
            ConflictAction::Omit => Ok(()),
            ConflictAction::Abort => Err(abort()),
            ConflictAction::Replace => {
                // Remove the blocking row and retry; if the retry fails the
                // original row is put back before continuing.
                let mut guard = conn.write().unwrap();
                guard.delete(&table, &pk)?;
                if let Err(err) = guard.insert(&table, values) {
                    log::warn!("replace-insert into {} failed ({}); restoring row", table, err);
                    guard.insert(&table, current)?;
                }
                Ok(())
            }
        };
    }

    match conn.write().unwrap().insert(&table, values) {
        Ok(()) => Ok(()),
        Err(err) if err.code == ErrorCode::Constraint => {
            record.set_conflict_row(None);
            match invoke_conflict(conflict, ConflictType::Constraint, record, options)? {
                ConflictAction::Omit => Ok(()),
                ConflictAction::Abort => Err(abort()),
                ConflictAction::Replace => unreachable!("rejected by invoke_conflict"),
            }
        }
        Err(err) => Err(err),
    }
}

fn apply_update<C>(
    conn: &SharedConnection,
    schema: &TableSchema,
    record: &mut ChangeRecord,
    conflict: &mut C,
    options: &ApplyOptions,
) -> Result<()>
where
    C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
{
    let table = schema.name.clone();
    let old_image = required_image(record.old_image())?;
    let new_image = required_image(record.new_image())?;
    let pk = pk_cells(&old_image, record.primary_key_columns())?;

    let current = match conn.read().unwrap().read_row(&table, &pk)? {
        Some(current) => current,
        None => {
            return match invoke_conflict(conflict, ConflictType::NotFound, record, options)? {
                ConflictAction::Omit => Ok(()),
                ConflictAction::Abort => Err(abort()),
                ConflictAction::Replace => unreachable!("rejected by invoke_conflict"),
            }
        }
    };

    if !image_matches(&old_image, &current) {
        record.set_conflict_row(Some(full_image(&current)));
        match invoke_conflict(conflict, ConflictType::Data, record, options)? {
            ConflictAction::Omit => return Ok(()),
            ConflictAction::Abort => return Err(abort()),
            // overwrite the conflicting row with the change's new values
            ConflictAction::Replace => {}
        }
    }

    let merged = overlay_values(&current, &new_image);
    let mut guard = conn.write().unwrap();
    if crate::engine::pk_key(schema, &merged) == crate::engine::pk_key(schema, &current) {
        guard.update(&table, merged)
    } else {
        // primary-key change: delete under the old key, insert the new row
        guard.delete(&table, &pk)?;
        guard.insert(&table, merged)
    }
}

fn apply_delete<C>(
    conn: &SharedConnection,
    schema: &TableSchema,
    record: &mut ChangeRecord,
    conflict: &mut C,
    options: &ApplyOptions,
) -> Result<()>
where
    C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
{
    let table = schema.name.clone();
    let old_image = required_image(record.old_image())?;
    let pk = pk_cells(&old_image, record.primary_key_columns())?;

    let current = match conn.read().unwrap().read_row(&table, &pk)? {
        Some(current) => current,
        None => {
            return match invoke_conflict(conflict, ConflictType::NotFound, record, options)? {
                ConflictAction::Omit => Ok(()),
                ConflictAction::Abort => Err(abort()),
                ConflictAction::Replace => unreachable!("rejected by invoke_conflict"),
            }
        }
    };

    if !image_matches(&old_image, &current) {
        record.set_conflict_row(Some(full_image(&current)));
        match invoke_conflict(conflict, ConflictType::Data, record, options)? {
            ConflictAction::Omit => return Ok(()),
            ConflictAction::Abort => return Err(abort()),
            // a delete-change forced through deletes the conflicting row
            ConflictAction::Replace => {}
        }
    }

    conn.write().unwrap().delete(&table, &pk)
}

// ============================================================================
// Callback boundary
// ============================================================================

fn invoke_conflict<C>(
    conflict: &mut C,
    conflict_type: ConflictType,
    record: &ChangeRecord,
    options: &ApplyOptions,
) -> Result<ConflictAction>
where
    C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
{
    let action = match catch_unwind(AssertUnwindSafe(|| conflict(conflict_type, record))) {
        Ok(action) => action,
        Err(_) => {
            let fallback = match options.panic_policy {
                PanicPolicy::Abort => ConflictAction::Abort,
                PanicPolicy::Omit => ConflictAction::Omit,
            };
            log::error!(
                "conflict handler panicked on {:?} conflict; treating as {:?}",
                conflict_type,
                fallback
            );
            fallback
        }
    };
    if action == ConflictAction::Replace
        && !matches!(conflict_type, ConflictType::Data | ConflictType::Conflict)
    {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            format!("REPLACE is not valid for a {:?} conflict", conflict_type),
        ));
    }
    Ok(action)
}

fn invoke_filter<F>(filter: &mut F, table: &str) -> bool
where
    F: FnMut(&str) -> bool,
{
    catch_unwind(AssertUnwindSafe(|| filter(table))).unwrap_or_else(|_| {
        log::error!("table filter panicked on {}; including the table", table);
        true
    })
}

// ============================================================================
// Row helpers
// ============================================================================

fn abort() -> Error {
    Error::with_message(ErrorCode::Abort, "changeset apply aborted by conflict handler")
}

fn required_image(image: Option<&Row>) -> Result<Row> {
    image.cloned().ok_or_else(|| {
        Error::with_message(ErrorCode::Corrupt, "record is missing a row image")
    })
}

/// Full engine row from an image; cells the encoder left undefined fall
/// back to NULL.
fn materialize(image: &Row) -> Vec<Value> {
    image
        .iter()
        .map(|cell| cell.clone().unwrap_or(Value::Null))
        .collect()
}

/// Lay an image's defined cells over the current row.
fn overlay_values(current: &[Value], image: &Row) -> Vec<Value> {
    current
        .iter()
        .zip(image.iter())
        .map(|(cur, cell)| cell.clone().unwrap_or_else(|| cur.clone()))
        .collect()
}

/// Whether every defined cell of the image equals the current row.
fn image_matches(image: &Row, current: &[Value]) -> bool {
    image
        .iter()
        .zip(current.iter())
        .all(|(cell, cur)| cell.as_ref().map_or(true, |v| v == cur))
}
