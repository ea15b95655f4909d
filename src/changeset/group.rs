//! Change group: merges independently-captured changesets into one.
//!
//! A group accumulates raw changeset or patchset data and produces a single
//! combined output. Merging is pure data consolidation keyed by table and
//! primary key; no connection or conflict semantics are involved. When two
//! records target the same row the pair collapses:
//!
//! | existing | incoming | result                               |
//! |----------|----------|--------------------------------------|
//! | INSERT   | INSERT   | incoming ignored                     |
//! | INSERT   | UPDATE   | INSERT carrying the updated values   |
//! | INSERT   | DELETE   | both dropped                         |
//! | UPDATE   | INSERT   | incoming ignored                     |
//! | UPDATE   | UPDATE   | single UPDATE, original to final     |
//! | UPDATE   | DELETE   | DELETE of the original row           |
//! | DELETE   | INSERT   | UPDATE from old row to inserted row  |
//! | DELETE   | UPDATE   | incoming ignored                     |
//! | DELETE   | DELETE   | incoming ignored                     |

use indexmap::IndexMap;

use crate::changeset::format::{pk_cells, ChangesetBuilder, Row, SetKind, TableHeader};
use crate::changeset::iter::{ChangesetIter, StartFlags};
use crate::error::{Error, ErrorCode, Result};
use crate::strm::{ChunkedReader, ChunkedWriter};
use crate::types::{ChangeOp, Value};

struct GroupChange {
    op: ChangeOp,
    indirect: bool,
    old: Option<Row>,
    new: Option<Row>,
}

struct GroupTable {
    header: TableHeader,
    changes: IndexMap<Vec<u8>, GroupChange>,
}

/// Accumulator that merges added changesets into one combined output.
pub struct ChangeGroup {
    tables: IndexMap<String, GroupTable>,
    kind: Option<SetKind>,
}

impl ChangeGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            tables: IndexMap::new(),
            kind: None,
        }
    }

    /// True if nothing has been added (or everything annihilated).
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|t| t.changes.is_empty())
    }

    /// Add raw changeset or patchset data to the group.
    ///
    /// The first addition pins the group's kind; adding the other kind
    /// afterwards is `Misuse`. Empty or malformed data is rejected.
    pub fn add_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "empty changeset data",
            ));
        }
        let mut iter = ChangesetIter::from_bytes(data);
        self.add_iter(&mut iter)
    }

    /// Add streamed changeset or patchset data to the group.
    pub fn add_stream(&mut self, reader: ChunkedReader<'_>) -> Result<()> {
        let mut iter = ChangesetIter::from_reader(reader, StartFlags::empty());
        self.add_iter(&mut iter)
    }

    pub(crate) fn add_iter(&mut self, iter: &mut ChangesetIter<'_>) -> Result<()> {
        let mut any = false;
        while iter.next()? {
            if !any {
                let kind = iter.kind().expect("kind known after first record");
                match self.kind {
                    None => self.kind = Some(kind),
                    Some(pinned) if pinned != kind => {
                        return Err(Error::with_message(
                            ErrorCode::Misuse,
                            "cannot mix changesets and patchsets in one group",
                        ))
                    }
                    Some(_) => {}
                }
                any = true;
            }
            let record = iter.current()?;
            self.merge(
                record.header(),
                record.operation(),
                record.is_indirect(),
                record.old_image().cloned(),
                record.new_image().cloned(),
            )?;
        }
        Ok(())
    }

    fn merge(
        &mut self,
        header: TableHeader,
        op: ChangeOp,
        indirect: bool,
        old: Option<Row>,
        new: Option<Row>,
    ) -> Result<()> {
        let table_key = header.table.to_lowercase();
        let table = match self.tables.entry(table_key) {
            indexmap::map::Entry::Occupied(entry) => {
                let table = entry.into_mut();
                if table.header.n_col != header.n_col || table.header.pk != header.pk {
                    return Err(Error::with_message(
                        ErrorCode::Schema,
                        format!("conflicting definitions of table {}", header.table),
                    ));
                }
                table
            }
            indexmap::map::Entry::Vacant(entry) => entry.insert(GroupTable {
                header,
                changes: IndexMap::new(),
            }),
        };

        let key_image = match op {
            ChangeOp::Insert => new.as_ref(),
            ChangeOp::Update | ChangeOp::Delete => old.as_ref(),
        }
        .ok_or_else(|| Error::new(ErrorCode::Internal))?;
        let key = {
            let cells = pk_cells(key_image, &table.header.pk)?;
            encode_group_key(&cells)
        };

        let existing_op = match table.changes.get(&key) {
            None => {
                table.changes.insert(
                    key,
                    GroupChange {
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

        if existing_op == ChangeOp::Insert && op == ChangeOp::Delete {
            table.changes.shift_remove(&key);
            return Ok(());
        }

        let existing = table.changes.get_mut(&key).expect("entry present");
        existing.indirect = existing.indirect && indirect;
        match (existing_op, op) {
            (ChangeOp::Insert, ChangeOp::Update) | (ChangeOp::Update, ChangeOp::Update) => {
                existing.new = Some(overlay(existing.new.take(), new));
            }
            (ChangeOp::Update, ChangeOp::Delete) => {
                existing.op = ChangeOp::Delete;
                existing.new = None;
            }
            (ChangeOp::Delete, ChangeOp::Insert) => {
                existing.op = ChangeOp::Update;
                existing.new = new;
            }
            // insert over insert, update over delete, delete over delete:
            // the incoming record is ignored
            _ => {}
        }
        Ok(())
    }

    /// Materialize the combined result.
    ///
    /// The accumulator is not cleared; adding more data and calling this
    /// again yields the further-merged result.
    pub fn output(&self) -> Result<Vec<u8>> {
        let kind = self.kind.unwrap_or(SetKind::Changeset);
        let mut builder = ChangesetBuilder::new(kind);
        for table in self.tables.values() {
            for change in table.changes.values() {
                builder.push(
                    &table.header,
                    change.op,
                    change.indirect,
                    change.old.as_ref(),
                    change.new.as_ref(),
                )?;
            }
        }
        Ok(builder.finish())
    }

    /// Write the combined result to an output stream in chunks.
    pub fn output_to(&self, writer: &mut ChunkedWriter<'_>) -> Result<()> {
        writer.push_chunked(&self.output()?)
    }

    /// The kind pinned by the first addition, if any.
    pub fn kind(&self) -> Option<SetKind> {
        self.kind
    }
}

impl Default for ChangeGroup {
    fn default() -> Self {
        ChangeGroup::new()
    }
}

/// Lay `incoming`'s defined cells over `base`.
fn overlay(base: Option<Row>, incoming: Option<Row>) -> Row {
    match (base, incoming) {
        (Some(base), Some(incoming)) => base
            .into_iter()
            .zip(incoming)
            .map(|(b, i)| i.or(b))
            .collect(),
        (None, Some(incoming)) => incoming,
        (Some(base), None) => base,
        (None, None) => Vec::new(),
    }
}

fn encode_group_key(cells: &[Value]) -> Vec<u8> {
    let mut key = Vec::new();
    for cell in cells {
        crate::changeset::format::encode_cell(&mut key, Some(cell));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::format::full_image;

    fn header() -> TableHeader {
        TableHeader {
            table: "t1".into(),
            n_col: 2,
            pk: vec![true, false],
        }
    }

    fn single_record_set(op: ChangeOp, old: Option<&[Value]>, new: Option<&[Value]>) -> Vec<u8> {
        let mut builder = ChangesetBuilder::new(SetKind::Changeset);
        builder
            .push(
                &header(),
                op,
                false,
                old.map(full_image).as_ref(),
                new.map(full_image).as_ref(),
            )
            .unwrap();
        builder.finish()
    }

    fn records(data: &[u8]) -> Vec<(ChangeOp, Value, Value)> {
        let mut iter = ChangesetIter::from_bytes(data);
        let mut out = Vec::new();
        while iter.next().unwrap() {
            let r = iter.current().unwrap();
            out.push((
                r.operation(),
                r.old_value(1).unwrap(),
                r.new_value(1).unwrap(),
            ));
        }
        out
    }

    #[test]
    fn test_insert_then_update_folds_into_insert() {
        let mut group = ChangeGroup::new();
        group
            .add_bytes(&single_record_set(
                ChangeOp::Insert,
                None,
                Some(&[1.into(), "a".into()]),
            ))
            .unwrap();
        group
            .add_bytes(&single_record_set(
                ChangeOp::Update,
                Some(&[1.into(), "a".into()]),
                Some(&[1.into(), "b".into()]),
            ))
            .unwrap();
        let merged = records(&group.output().unwrap());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].0, ChangeOp::Insert);
        assert_eq!(merged[0].2, Value::Text("b".into()));
    }

    #[test]
    fn test_insert_then_delete_annihilates() {
        let mut group = ChangeGroup::new();
        group
            .add_bytes(&single_record_set(
                ChangeOp::Insert,
                None,
                Some(&[1.into(), "a".into()]),
            ))
            .unwrap();
        group
            .add_bytes(&single_record_set(
                ChangeOp::Delete,
                Some(&[1.into(), "a".into()]),
                None,
            ))
            .unwrap();
        assert!(group.is_empty());
        assert!(records(&group.output().unwrap()).is_empty());
    }

    #[test]
    fn test_non_overlapping_rows_keep_order() {
        let mut group = ChangeGroup::new();
        group
            .add_bytes(&single_record_set(
                ChangeOp::Insert,
                None,
                Some(&[2.into(), "b".into()]),
            ))
            .unwrap();
        group
            .add_bytes(&single_record_set(
                ChangeOp::Insert,
                None,
                Some(&[1.into(), "a".into()]),
            ))
            .unwrap();
        let merged = records(&group.output().unwrap());
        assert_eq!(merged.len(), 2);
        // first-added first, never reordered by key
        assert_eq!(merged[0].2, Value::Text("b".into()));
        assert_eq!(merged[1].2, Value::Text("a".into()));
    }

    #[test]
    fn test_empty_data_rejected() {
        let mut group = ChangeGroup::new();
        assert_eq!(
            group.add_bytes(&[]).unwrap_err().code,
            ErrorCode::Corrupt
        );
    }

    #[test]
    fn test_kind_mixing_rejected() {
        let changeset = single_record_set(ChangeOp::Insert, None, Some(&[1.into(), "a".into()]));
        let mut patch_builder = ChangesetBuilder::new(SetKind::Patchset);
        patch_builder
            .push(
                &header(),
                ChangeOp::Insert,
                false,
                None,
                Some(&full_image(&[2.into(), "b".into()])),
            )
            .unwrap();
        let patchset = patch_builder.finish();

        let mut group = ChangeGroup::new();
        group.add_bytes(&changeset).unwrap();
        assert_eq!(
            group.add_bytes(&patchset).unwrap_err().code,
            ErrorCode::Misuse
        );
    }
}
