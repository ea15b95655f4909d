//! Changeset iteration and per-record metadata.
//!
//! The iterator owns a cursor over changeset bytes, either a whole in-memory
//! buffer or a stream pulled in fixed windows. `next` advances one record;
//! the current record is then readable until the next advance. Malformed
//! data poisons the iterator: the remainder of the buffer cannot be trusted,
//! so every later call fails the same way.

use bitflags::bitflags;

use crate::changeset::format::{
    decode_op, decode_row, decode_table_header, Row, SetKind, TableHeader, CHANGESET_END,
};
use crate::error::{Error, ErrorCode, Result};
use crate::strm::ChunkedReader;
use crate::types::{ChangeOp, Value};

bitflags! {
    /// Flags accepted when opening an iterator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StartFlags: u32 {
        /// Yield each record inverted (insert and delete swapped, old and
        /// new images exchanged). Not valid over patchsets.
        const INVERT = 0x0002;
    }
}

/// One change record: table metadata plus the row images the operation
/// defines. A fresh record is produced by every successful `next`; it does
/// not survive the following advance unless cloned.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    table: String,
    n_col: usize,
    op: ChangeOp,
    indirect: bool,
    pk: Vec<bool>,
    old: Option<Row>,
    new: Option<Row>,
    conflict: Option<Row>,
    fk_conflicts: Option<i64>,
}

impl ChangeRecord {
    pub(crate) fn new(
        header: &TableHeader,
        op: ChangeOp,
        indirect: bool,
        old: Option<Row>,
        new: Option<Row>,
    ) -> Self {
        Self {
            table: header.table.clone(),
            n_col: header.n_col,
            op,
            indirect,
            pk: header.pk.clone(),
            old,
            new,
            conflict: None,
            fk_conflicts: None,
        }
    }

    /// Name of the table this record belongs to.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Number of columns in the record's table.
    pub fn column_count(&self) -> usize {
        self.n_col
    }

    /// The operation type.
    pub fn operation(&self) -> ChangeOp {
        self.op
    }

    /// Whether the change was made indirectly (trigger or cascade).
    pub fn is_indirect(&self) -> bool {
        self.indirect
    }

    /// One flag per column, true iff that ordinal is part of the table's
    /// primary key for this record.
    pub fn primary_key_columns(&self) -> &[bool] {
        &self.pk
    }

    /// Pre-change value of column `index`.
    ///
    /// Defined for update and delete records. For operations without an old
    /// image, or cells the encoder did not record, this is `Null`.
    pub fn old_value(&self, index: usize) -> Result<Value> {
        self.image_value(self.old.as_ref(), index)
    }

    /// Post-change value of column `index`.
    ///
    /// Defined for insert and update records; `Null` otherwise.
    pub fn new_value(&self, index: usize) -> Result<Value> {
        self.image_value(self.new.as_ref(), index)
    }

    /// The conflicting row's value of column `index`.
    ///
    /// Only available inside a conflict callback for a data or insert
    /// conflict; `Misuse` in any other context.
    pub fn conflict_value(&self, index: usize) -> Result<Value> {
        match self.conflict {
            Some(ref row) => self.image_value(Some(row), index),
            None => Err(Error::with_message(
                ErrorCode::Misuse,
                "no conflicting row in this context",
            )),
        }
    }

    /// Number of outstanding foreign-key violations.
    ///
    /// Only available inside a foreign-key conflict callback.
    pub fn foreign_key_conflict_count(&self) -> Result<i64> {
        self.fk_conflicts.ok_or_else(|| {
            Error::with_message(ErrorCode::Misuse, "not a foreign-key conflict")
        })
    }

    fn image_value(&self, image: Option<&Row>, index: usize) -> Result<Value> {
        if index >= self.n_col {
            return Err(Error::new(ErrorCode::Range));
        }
        Ok(image
            .and_then(|row| row[index].clone())
            .unwrap_or(Value::Null))
    }

    pub(crate) fn old_image(&self) -> Option<&Row> {
        self.old.as_ref()
    }

    pub(crate) fn new_image(&self) -> Option<&Row> {
        self.new.as_ref()
    }

    pub(crate) fn header(&self) -> TableHeader {
        TableHeader {
            table: self.table.clone(),
            n_col: self.n_col,
            pk: self.pk.clone(),
        }
    }

    /// Swap insert/delete and exchange the row images.
    pub(crate) fn inverted(mut self) -> Self {
        self.op = match self.op {
            ChangeOp::Insert => ChangeOp::Delete,
            ChangeOp::Delete => ChangeOp::Insert,
            ChangeOp::Update => ChangeOp::Update,
        };
        std::mem::swap(&mut self.old, &mut self.new);
        self
    }

    pub(crate) fn set_conflict_row(&mut self, row: Option<Row>) {
        self.conflict = row;
    }

    /// A synthetic record used for the one-shot foreign-key conflict report.
    pub(crate) fn foreign_key_report(count: i64) -> Self {
        Self {
            table: String::new(),
            n_col: 0,
            op: ChangeOp::Insert,
            indirect: false,
            pk: Vec::new(),
            old: None,
            new: None,
            conflict: None,
            fk_conflicts: Some(count),
        }
    }
}

// ============================================================================
// Iterator
// ============================================================================

enum Source<'a> {
    Memory(&'a [u8]),
    Stream {
        reader: ChunkedReader<'a>,
        buf: Vec<u8>,
        eof: bool,
    },
}

/// Cursor over changeset bytes.
pub struct ChangesetIter<'a> {
    source: Source<'a>,
    pos: usize,
    header: Option<TableHeader>,
    kind: Option<SetKind>,
    current: Option<ChangeRecord>,
    invert: bool,
    poisoned: bool,
}

impl<'a> std::fmt::Debug for ChangesetIter<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesetIter")
            .field("pos", &self.pos)
            .field("invert", &self.invert)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl<'a> ChangesetIter<'a> {
    /// Iterate an in-memory buffer. The buffer is held for the iterator's
    /// whole lifetime.
    pub fn from_bytes(data: &'a [u8]) -> Self {
        Self::from_bytes_flagged(data, StartFlags::empty())
    }

    /// Iterate an in-memory buffer with start flags.
    pub fn from_bytes_flagged(data: &'a [u8], flags: StartFlags) -> Self {
        Self {
            source: Source::Memory(data),
            pos: 0,
            header: None,
            kind: None,
            current: None,
            invert: flags.contains(StartFlags::INVERT),
            poisoned: false,
        }
    }

    /// Iterate a stream, pulling bytes on demand in fixed windows.
    pub fn from_reader(reader: ChunkedReader<'a>, flags: StartFlags) -> Self {
        Self {
            source: Source::Stream {
                reader,
                buf: Vec::new(),
                eof: false,
            },
            pos: 0,
            header: None,
            kind: None,
            current: None,
            invert: flags.contains(StartFlags::INVERT),
            poisoned: false,
        }
    }

    /// The kind of data under the cursor, known once the first table header
    /// has been read.
    pub fn kind(&self) -> Option<SetKind> {
        self.kind
    }

    /// Advance to the next record. Returns `true` if one is available,
    /// `false` at end-of-data.
    pub fn next(&mut self) -> Result<bool> {
        if self.poisoned {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "iterator poisoned by earlier error",
            ));
        }
        self.current = None;
        loop {
            // Parse against a scratch cursor; commit only on success so a
            // partial window never corrupts the real position.
            let mut try_pos = self.pos;
            let mut try_header = self.header.clone();
            let mut try_kind = self.kind;
            let parsed = {
                let data = self.data();
                parse_step(data, &mut try_pos, &mut try_header, &mut try_kind)
            };
            match parsed {
                Ok(step) => {
                    self.pos = try_pos;
                    self.header = try_header;
                    self.kind = try_kind;
                    if self.invert && self.kind == Some(SetKind::Patchset) {
                        self.poisoned = true;
                        return Err(Error::with_message(
                            ErrorCode::Misuse,
                            "patchsets cannot be inverted",
                        ));
                    }
                    match step {
                        Some(record) => {
                            self.compact();
                            self.current =
                                Some(if self.invert { record.inverted() } else { record });
                            return Ok(true);
                        }
                        None => {
                            // Out of buffered data; a stream may have more.
                            if self.refill()? {
                                continue;
                            }
                            return Ok(false);
                        }
                    }
                }
                Err(err) if err.code == ErrorCode::Corrupt => {
                    // Could be a record split across windows.
                    if self.refill()? {
                        continue;
                    }
                    self.poisoned = true;
                    return Err(err);
                }
                Err(err) => {
                    self.poisoned = true;
                    return Err(err);
                }
            }
        }
    }

    /// The record at the current position.
    ///
    /// Fails with `Misuse` before the first `next` or after `next` has
    /// returned false.
    pub fn current(&self) -> Result<&ChangeRecord> {
        self.current.as_ref().ok_or_else(|| {
            Error::with_message(ErrorCode::Misuse, "iterator is not positioned on a record")
        })
    }

    fn data(&self) -> &[u8] {
        match &self.source {
            Source::Memory(data) => data,
            Source::Stream { buf, .. } => buf,
        }
    }

    /// Pull one more window from a stream source. Returns whether any new
    /// bytes arrived.
    fn refill(&mut self) -> Result<bool> {
        match &mut self.source {
            Source::Memory(_) => Ok(false),
            Source::Stream { reader, buf, eof } => {
                if *eof {
                    return Ok(false);
                }
                let n = reader.fill(buf)?;
                if n == 0 {
                    *eof = true;
                }
                Ok(n > 0)
            }
        }
    }

    /// Drop consumed stream bytes so the window stays bounded.
    fn compact(&mut self) {
        if let Source::Stream { buf, .. } = &mut self.source {
            buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

/// One parsing step over the available bytes. `Ok(None)` means the data ran
/// out cleanly at a record boundary.
fn parse_step(
    data: &[u8],
    pos: &mut usize,
    header: &mut Option<TableHeader>,
    kind: &mut Option<SetKind>,
) -> Result<Option<ChangeRecord>> {
    loop {
        if *pos >= data.len() {
            return Ok(None);
        }
        if header.is_none() {
            let (run_kind, run_header) = decode_table_header(data, pos)?;
            if kind.is_some() && *kind != Some(run_kind) {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    "buffer mixes changeset and patchset runs",
                ));
            }
            *kind = Some(run_kind);
            *header = Some(run_header);
            continue;
        }
        let op_byte = data[*pos];
        *pos += 1;
        if op_byte == CHANGESET_END {
            *header = None;
            continue;
        }
        let (op, indirect) = decode_op(op_byte)?;
        let table = header.as_ref().expect("header present");
        let old = match op {
            ChangeOp::Insert => None,
            ChangeOp::Update | ChangeOp::Delete => Some(decode_row(data, pos, table.n_col)?),
        };
        let new = match op {
            ChangeOp::Delete => None,
            ChangeOp::Insert | ChangeOp::Update => Some(decode_row(data, pos, table.n_col)?),
        };
        return Ok(Some(ChangeRecord::new(table, op, indirect, old, new)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::format::{full_image, ChangesetBuilder};
    use std::io::Cursor;

    fn sample_changeset() -> Vec<u8> {
        let header = TableHeader {
            table: "t1".into(),
            n_col: 2,
            pk: vec![true, false],
        };
        let mut builder = ChangesetBuilder::new(SetKind::Changeset);
        builder
            .push(
                &header,
                ChangeOp::Insert,
                false,
                None,
                Some(&full_image(&[1.into(), "a".into()])),
            )
            .unwrap();
        builder
            .push(
                &header,
                ChangeOp::Delete,
                true,
                Some(&full_image(&[2.into(), "b".into()])),
                None,
            )
            .unwrap();
        builder.finish()
    }

    #[test]
    fn test_memory_iteration() {
        let data = sample_changeset();
        let mut iter = ChangesetIter::from_bytes(&data);

        assert!(iter.next().unwrap());
        let record = iter.current().unwrap();
        assert_eq!(record.table_name(), "t1");
        assert_eq!(record.operation(), ChangeOp::Insert);
        assert_eq!(record.column_count(), 2);
        assert!(!record.is_indirect());
        assert_eq!(record.new_value(0).unwrap(), Value::Integer(1));
        assert_eq!(record.new_value(1).unwrap(), Value::Text("a".into()));
        // insert has no old image
        assert_eq!(record.old_value(0).unwrap(), Value::Null);

        assert!(iter.next().unwrap());
        let record = iter.current().unwrap();
        assert_eq!(record.operation(), ChangeOp::Delete);
        assert!(record.is_indirect());
        assert_eq!(record.old_value(1).unwrap(), Value::Text("b".into()));

        assert!(!iter.next().unwrap());
        assert!(iter.current().is_err());
    }

    #[test]
    fn test_current_before_next_is_misuse() {
        let data = sample_changeset();
        let iter = ChangesetIter::from_bytes(&data);
        assert_eq!(iter.current().unwrap_err().code, ErrorCode::Misuse);
    }

    #[test]
    fn test_out_of_range_index() {
        let data = sample_changeset();
        let mut iter = ChangesetIter::from_bytes(&data);
        iter.next().unwrap();
        assert_eq!(
            iter.current().unwrap().new_value(5).unwrap_err().code,
            ErrorCode::Range
        );
    }

    #[test]
    fn test_stream_iteration_small_window() {
        let data = sample_changeset();
        let reader = ChunkedReader::new(Cursor::new(data), 3);
        let mut iter = ChangesetIter::from_reader(reader, StartFlags::empty());
        let mut ops = Vec::new();
        while iter.next().unwrap() {
            ops.push(iter.current().unwrap().operation());
        }
        assert_eq!(ops, vec![ChangeOp::Insert, ChangeOp::Delete]);
    }

    #[test]
    fn test_inverting_iterator() {
        let data = sample_changeset();
        let mut iter = ChangesetIter::from_bytes_flagged(&data, StartFlags::INVERT);
        iter.next().unwrap();
        let record = iter.current().unwrap();
        assert_eq!(record.operation(), ChangeOp::Delete);
        assert_eq!(record.old_value(0).unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_inverting_a_patchset_is_misuse() {
        let header = TableHeader {
            table: "t".into(),
            n_col: 1,
            pk: vec![true],
        };
        let mut builder = ChangesetBuilder::new(SetKind::Patchset);
        builder
            .push(
                &header,
                ChangeOp::Insert,
                false,
                None,
                Some(&full_image(&[Value::Integer(1)])),
            )
            .unwrap();
        let data = builder.finish();
        let mut iter = ChangesetIter::from_bytes_flagged(&data, StartFlags::INVERT);
        assert_eq!(iter.next().unwrap_err().code, ErrorCode::Misuse);
    }

    #[test]
    fn test_corrupt_data_poisons_iterator() {
        let mut data = sample_changeset();
        // overwrite the first op byte with garbage
        let header_len = {
            let mut pos = 0;
            decode_table_header(&data, &mut pos).unwrap();
            pos
        };
        data[header_len] = 0x7E;
        let mut iter = ChangesetIter::from_bytes(&data);
        assert_eq!(iter.next().unwrap_err().code, ErrorCode::Corrupt);
        assert_eq!(iter.next().unwrap_err().code, ErrorCode::Corrupt);
    }

    #[test]
    fn test_truncated_data_is_corrupt() {
        let data = sample_changeset();
        let truncated = &data[..data.len() - 3];
        let mut iter = ChangesetIter::from_bytes(truncated);
        iter.next().unwrap();
        assert!(iter.next().is_err());
    }
}
