//! Table diffing: load the differences between two databases' copies of a
//! table into a session, as if the changes had been captured live.
//!
//! The loaded changes transform the attached ("from") database's copy into
//! the session connection's copy: rows only here become inserts, rows only
//! there become deletes, rows in both with different values become updates.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::engine::SharedConnection;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{ChangeOp, Value};

use super::SessionState;

pub(crate) fn load_table_diff(
    state: &Arc<RwLock<SessionState>>,
    own: &SharedConnection,
    from: &SharedConnection,
    table: &str,
) -> Result<()> {
    let (schema, own_rows) = {
        let conn = own.read().unwrap();
        (conn.table_schema(table)?.clone(), conn.scan(table)?)
    };
    let from_rows = {
        let conn = from.read().unwrap();
        let from_schema = conn.table_schema(table).map_err(|_| {
            Error::with_message(
                ErrorCode::Schema,
                format!("no table {} in the attached database", table),
            )
        })?;
        if !schema.compatible_with(from_schema) {
            return Err(Error::with_message(
                ErrorCode::Schema,
                format!("table schemas do not match for {}", table),
            ));
        }
        conn.scan(table)?
    };

    let table_key = table.to_lowercase();
    let mut state = state.write().unwrap();
    if !state.is_attached(&table_key) {
        if !state.attach_all() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("table {} is not attached to the session", table),
            ));
        }
        state.attach_schema(&schema);
    }

    let pk = schema.pk_flags();
    let mut from_by_key: HashMap<Vec<u8>, Vec<Value>> = from_rows
        .into_iter()
        .map(|row| (super::change_key(&pk, &row), row))
        .collect();

    for row in own_rows {
        let key = super::change_key(&pk, &row);
        match from_by_key.remove(&key) {
            None => state.load_change(&table_key, ChangeOp::Insert, None, Some(row))?,
            Some(from_row) if from_row != row => {
                state.load_change(&table_key, ChangeOp::Update, Some(from_row), Some(row))?
            }
            Some(_) => {}
        }
    }
    for (_, from_row) in from_by_key {
        state.load_change(&table_key, ChangeOp::Delete, Some(from_row), None)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::engine::{Connection, SharedConnection, TableSchema};
    use crate::error::ErrorCode;
    use crate::session::Session;
    use crate::types::{ChangeOp, Value};

    fn conn_with_rows(rows: &[(i64, &str)]) -> SharedConnection {
        let conn = Connection::open();
        {
            let mut guard = conn.write().unwrap();
            guard
                .create_table(TableSchema::new("t1").column("id", true).column("v", false))
                .unwrap();
            for &(id, v) in rows {
                guard.insert("t1", vec![id.into(), v.into()]).unwrap();
            }
        }
        conn
    }

    #[test]
    fn test_diff_yields_insert_update_delete() {
        // session db: rows 1 (changed), 2 (new); from db: rows 1 (old), 3 (gone)
        let own = conn_with_rows(&[(1, "new"), (2, "b")]);
        let from = conn_with_rows(&[(1, "old"), (3, "c")]);

        let mut session = Session::new(&own).unwrap();
        session.attach_table(Some("t1")).unwrap();
        session.load_differences_from_table(&from, "t1").unwrap();

        let changeset = session.create_changeset().unwrap();
        let mut iter = changeset.iter();
        let mut seen = Vec::new();
        while iter.next().unwrap() {
            let r = iter.current().unwrap();
            seen.push((
                r.operation(),
                r.old_value(0).unwrap(),
                r.new_value(0).unwrap(),
            ));
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&(
            ChangeOp::Update,
            Value::Integer(1),
            Value::Integer(1)
        )));
        assert!(seen.contains(&(ChangeOp::Insert, Value::Null, Value::Integer(2))));
        assert!(seen.contains(&(ChangeOp::Delete, Value::Integer(3), Value::Null)));
    }

    #[test]
    fn test_diff_requires_matching_schemas() {
        let own = conn_with_rows(&[]);
        let from = Connection::open();
        from.write()
            .unwrap()
            .create_table(
                TableSchema::new("t1")
                    .column("id", true)
                    .column("v", false)
                    .column("w", false),
            )
            .unwrap();

        let mut session = Session::new(&own).unwrap();
        session.attach_table(Some("t1")).unwrap();
        let err = session.load_differences_from_table(&from, "t1").unwrap_err();
        assert_eq!(err.code, ErrorCode::Schema);
    }

    #[test]
    fn test_diff_requires_attached_table() {
        let own = conn_with_rows(&[]);
        let from = conn_with_rows(&[]);
        let mut session = Session::new(&own).unwrap();
        let err = session.load_differences_from_table(&from, "t1").unwrap_err();
        assert_eq!(err.code, ErrorCode::Misuse);
    }

    #[test]
    fn test_diff_of_identical_tables_is_empty() {
        let own = conn_with_rows(&[(1, "a")]);
        let from = conn_with_rows(&[(1, "a")]);
        let mut session = Session::new(&own).unwrap();
        session.attach_table(Some("t1")).unwrap();
        session.load_differences_from_table(&from, "t1").unwrap();
        assert!(session.is_empty());
    }
}
