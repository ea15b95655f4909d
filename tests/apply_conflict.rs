use std::cell::RefCell;

use changetrack::{
    ApplyOptions, ChangeOp, ConflictAction, ConflictType, Connection, ErrorCode, MemoryChangeset,
    Session, SharedConnection, TableSchema, Value,
};

fn open_db() -> SharedConnection {
    let conn = Connection::open();
    conn.write()
        .unwrap()
        .create_table(TableSchema::new("t").column("id", true).column("v", false))
        .unwrap();
    conn
}

/// Run `mutate` on a fresh tracked connection and return the captured
/// changeset bytes.
fn capture(mutate: impl FnOnce(&SharedConnection)) -> Vec<u8> {
    let conn = open_db();
    let mut session = Session::new(&conn).unwrap();
    session.attach_table(Some("t")).unwrap();
    mutate(&conn);
    let changeset = session.create_changeset().unwrap();
    changeset.data().to_vec()
}

fn rows(conn: &SharedConnection, table: &str) -> Vec<Vec<Value>> {
    conn.read().unwrap().scan(table).unwrap()
}

fn no_conflict(_: ConflictType, _: &changetrack::ChangeRecord) -> ConflictAction {
    panic!("conflict callback should not run");
}

#[test]
fn test_apply_to_fresh_database() {
    let bytes = capture(|conn| {
        conn.write()
            .unwrap()
            .insert("t", vec![1.into(), "a".into()])
            .unwrap();
    });

    let target = open_db();
    let set = MemoryChangeset::from_bytes(&target, bytes).unwrap();
    set.apply(None::<fn(&str) -> bool>, no_conflict).unwrap();
    assert_eq!(rows(&target, "t"), vec![vec![1.into(), "a".into()]]);
}

#[test]
fn test_second_apply_conflicts_and_omit_keeps_state() {
    let bytes = capture(|conn| {
        conn.write()
            .unwrap()
            .insert("t", vec![1.into(), "a".into()])
            .unwrap();
    });

    let target = open_db();
    let set = MemoryChangeset::from_bytes(&target, bytes.clone()).unwrap();
    set.apply(None::<fn(&str) -> bool>, no_conflict).unwrap();

    let seen = RefCell::new(Vec::new());
    let set = MemoryChangeset::from_bytes(&target, bytes).unwrap();
    set.apply(None::<fn(&str) -> bool>, |conflict_type, record| {
        seen.borrow_mut().push(conflict_type);
        // the conflicting row is visible to the handler
        assert_eq!(record.conflict_value(1).unwrap(), Value::Text("a".into()));
        ConflictAction::Omit
    })
    .unwrap();

    assert_eq!(*seen.borrow(), vec![ConflictType::Conflict]);
    assert_eq!(rows(&target, "t"), vec![vec![1.into(), "a".into()]]);
}

#[test]
fn test_replace_resolves_insert_conflict() {
    let bytes = capture(|conn| {
        conn.write()
            .unwrap()
            .insert("t", vec![1.into(), "fresh".into()])
            .unwrap();
    });

    let target = open_db();
    target
        .write()
        .unwrap()
        .insert("t", vec![1.into(), "stale".into()])
        .unwrap();

    let set = MemoryChangeset::from_bytes(&target, bytes).unwrap();
    set.apply(None::<fn(&str) -> bool>, |_, _| ConflictAction::Replace)
        .unwrap();
    assert_eq!(rows(&target, "t"), vec![vec![1.into(), "fresh".into()]]);
}

#[test]
fn test_update_data_conflict_omit_and_replace() {
    // seed the row before the session starts so the capture is one update
    let update_bytes = {
        let conn = open_db();
        conn.write()
            .unwrap()
            .insert("t", vec![1.into(), "a".into()])
            .unwrap();
        let mut session = Session::new(&conn).unwrap();
        session.attach_table(Some("t")).unwrap();
        conn.write()
            .unwrap()
            .update("t", vec![1.into(), "b".into()])
            .unwrap();
        session.create_changeset().unwrap().data().to_vec()
    };

    // target row drifted: old values no longer match
    let target = open_db();
    target
        .write()
        .unwrap()
        .insert("t", vec![1.into(), "z".into()])
        .unwrap();

    let set = MemoryChangeset::from_bytes(&target, update_bytes.clone()).unwrap();
    set.apply(None::<fn(&str) -> bool>, |conflict_type, _| {
        assert_eq!(conflict_type, ConflictType::Data);
        ConflictAction::Omit
    })
    .unwrap();
    assert_eq!(rows(&target, "t"), vec![vec![1.into(), "z".into()]]);

    let set = MemoryChangeset::from_bytes(&target, update_bytes).unwrap();
    set.apply(None::<fn(&str) -> bool>, |_, _| ConflictAction::Replace)
        .unwrap();
    assert_eq!(rows(&target, "t"), vec![vec![1.into(), "b".into()]]);
}

#[test]
fn test_abort_rolls_back_everything() {
    let bytes = capture(|conn| {
        let mut guard = conn.write().unwrap();
        guard.insert("t", vec![1.into(), "a".into()]).unwrap();
        guard.insert("t", vec![2.into(), "b".into()]).unwrap();
    });

    // the second record collides, the first would have applied cleanly
    let target = open_db();
    target
        .write()
        .unwrap()
        .insert("t", vec![2.into(), "existing".into()])
        .unwrap();
    let before = rows(&target, "t");

    let set = MemoryChangeset::from_bytes(&target, bytes).unwrap();
    let err = set
        .apply(None::<fn(&str) -> bool>, |_, _| ConflictAction::Abort)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Abort);
    assert_eq!(rows(&target, "t"), before);
}

#[test]
fn test_replace_for_not_found_is_misuse_and_rolls_back() {
    let update_bytes = {
        let conn = open_db();
        conn.write()
            .unwrap()
            .insert("t", vec![1.into(), "a".into()])
            .unwrap();
        let mut session = Session::new(&conn).unwrap();
        session.attach_table(Some("t")).unwrap();
        conn.write()
            .unwrap()
            .update("t", vec![1.into(), "b".into()])
            .unwrap();
        session.create_changeset().unwrap().data().to_vec()
    };

    let target = open_db();
    let set = MemoryChangeset::from_bytes(&target, update_bytes).unwrap();
    let err = set
        .apply(None::<fn(&str) -> bool>, |conflict_type, _| {
            assert_eq!(conflict_type, ConflictType::NotFound);
            ConflictAction::Replace
        })
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Misuse);
    assert!(rows(&target, "t").is_empty());
}

#[test]
fn test_combined_changeset_applies_like_the_sequence() {
    let first = capture(|conn| {
        conn.write()
            .unwrap()
            .insert("t", vec![1.into(), "a".into()])
            .unwrap();
    });
    let second = capture(|conn| {
        conn.write()
            .unwrap()
            .insert("t", vec![2.into(), "b".into()])
            .unwrap();
    });

    let sequential = open_db();
    for bytes in [first.clone(), second.clone()] {
        let set = MemoryChangeset::from_bytes(&sequential, bytes).unwrap();
        set.apply(None::<fn(&str) -> bool>, no_conflict).unwrap();
    }

    let combined_target = open_db();
    let a = MemoryChangeset::from_bytes(&combined_target, first).unwrap();
    let b = MemoryChangeset::from_bytes(&combined_target, second).unwrap();
    let combined = a.combine_with(&b).unwrap();
    let ops: Vec<ChangeOp> = {
        let mut iter = combined.iter();
        let mut ops = Vec::new();
        while iter.next().unwrap() {
            ops.push(iter.current().unwrap().operation());
        }
        ops
    };
    assert_eq!(ops, vec![ChangeOp::Insert, ChangeOp::Insert]);
    combined.apply(None::<fn(&str) -> bool>, no_conflict).unwrap();

    assert_eq!(rows(&sequential, "t"), rows(&combined_target, "t"));
}

#[test]
fn test_table_filter_called_once_per_table() {
    let conn = Connection::open();
    {
        let mut guard = conn.write().unwrap();
        guard
            .create_table(TableSchema::new("t").column("id", true).column("v", false))
            .unwrap();
        guard
            .create_table(TableSchema::new("u").column("id", true).column("v", false))
            .unwrap();
    }
    let mut session = Session::new(&conn).unwrap();
    session.attach_table(None).unwrap();
    {
        let mut guard = conn.write().unwrap();
        guard.insert("t", vec![1.into(), "a".into()]).unwrap();
        guard.insert("t", vec![2.into(), "b".into()]).unwrap();
        guard.insert("u", vec![1.into(), "c".into()]).unwrap();
    }
    let bytes = session.create_changeset().unwrap().data().to_vec();

    let target = Connection::open();
    {
        let mut guard = target.write().unwrap();
        guard
            .create_table(TableSchema::new("t").column("id", true).column("v", false))
            .unwrap();
        guard
            .create_table(TableSchema::new("u").column("id", true).column("v", false))
            .unwrap();
    }

    let calls = RefCell::new(Vec::new());
    let set = MemoryChangeset::from_bytes(&target, bytes).unwrap();
    set.apply(
        Some(|table: &str| {
            calls.borrow_mut().push(table.to_string());
            table != "u"
        }),
        no_conflict,
    )
    .unwrap();

    // one call per distinct table, every u record skipped
    assert_eq!(*calls.borrow(), vec!["t".to_string(), "u".to_string()]);
    assert_eq!(rows(&target, "t").len(), 2);
    assert!(rows(&target, "u").is_empty());
}

#[test]
fn test_foreign_key_conflict_reported_once() {
    fn fk_schema(conn: &SharedConnection) {
        let mut guard = conn.write().unwrap();
        guard
            .create_table(TableSchema::new("parent").column("id", true).column("v", false))
            .unwrap();
        guard
            .create_table(
                TableSchema::new("child")
                    .column("id", true)
                    .column("pid", false)
                    .foreign_key(1, "parent"),
            )
            .unwrap();
    }

    let source = Connection::open();
    fk_schema(&source);
    source
        .write()
        .unwrap()
        .insert("parent", vec![1.into(), "p".into()])
        .unwrap();
    let mut session = Session::new(&source).unwrap();
    session.attach_table(Some("child")).unwrap();
    source
        .write()
        .unwrap()
        .insert("child", vec![10.into(), 1.into()])
        .unwrap();
    let bytes = session.create_changeset().unwrap().data().to_vec();

    // the target lacks the parent row, so the applied child row dangles
    let target = Connection::open();
    fk_schema(&target);

    let seen = RefCell::new(Vec::new());
    let set = MemoryChangeset::from_bytes(&target, bytes.clone()).unwrap();
    set.apply(None::<fn(&str) -> bool>, |conflict_type, record| {
        seen.borrow_mut().push(conflict_type);
        assert_eq!(record.foreign_key_conflict_count().unwrap(), 1);
        ConflictAction::Omit
    })
    .unwrap();
    // omit commits despite the violation
    assert_eq!(*seen.borrow(), vec![ConflictType::ForeignKey]);
    assert_eq!(rows(&target, "child").len(), 1);

    // abort rolls the row back out
    let target = Connection::open();
    fk_schema(&target);
    let set = MemoryChangeset::from_bytes(&target, bytes).unwrap();
    let err = set
        .apply(None::<fn(&str) -> bool>, |_, _| ConflictAction::Abort)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Abort);
    assert!(rows(&target, "child").is_empty());
}

#[test]
fn test_callback_panic_follows_policy() {
    let bytes = capture(|conn| {
        conn.write()
            .unwrap()
            .insert("t", vec![1.into(), "a".into()])
            .unwrap();
    });

    let target = open_db();
    target
        .write()
        .unwrap()
        .insert("t", vec![1.into(), "z".into()])
        .unwrap();

    // default policy: a panicking handler aborts the apply
    let set = MemoryChangeset::from_bytes(&target, bytes.clone()).unwrap();
    let err = set
        .apply(None::<fn(&str) -> bool>, |_, _| -> ConflictAction {
            panic!("handler bug")
        })
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Abort);
    assert_eq!(rows(&target, "t"), vec![vec![1.into(), "z".into()]]);

    // omit policy: the record is skipped instead
    let options = ApplyOptions {
        panic_policy: changetrack::PanicPolicy::Omit,
        ..Default::default()
    };
    let set = MemoryChangeset::from_bytes(&target, bytes).unwrap();
    set.apply_with_options(
        None::<fn(&str) -> bool>,
        |_, _| -> ConflictAction { panic!("handler bug") },
        &options,
    )
    .unwrap();
    assert_eq!(rows(&target, "t"), vec![vec![1.into(), "z".into()]]);
}
