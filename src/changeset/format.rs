//! Binary changeset wire format.
//!
//! A changeset is a sequence of table runs. Each run is a table header
//! (varint name length, name bytes, varint column count, one primary-key
//! flag byte per column), followed by change records, closed by a 0x00
//! terminator. A record is an op byte (insert/update/delete, high bit set
//! for indirect changes) followed by the row images the op defines: old for
//! update/delete, new for insert/update.
//!
//! A row image is one cell per column. A cell is a tag byte and payload:
//! NULL and undefined cells have no payload, integers are zigzag varints,
//! reals are 8-byte big-endian IEEE 754, text and blobs are length-prefixed.
//! The undefined tag marks a column the encoder did not record; patchsets
//! use it for every non-key old cell.

use crate::error::{Error, ErrorCode, Result};
use crate::types::{ChangeOp, Value};
use crate::util::{get_varint, put_varint};

pub const MARKER_CHANGESET: u8 = b'T';
pub const MARKER_PATCHSET: u8 = b'P';

pub const CHANGESET_END: u8 = 0;
pub const CHANGESET_INSERT: u8 = 1;
pub const CHANGESET_UPDATE: u8 = 2;
pub const CHANGESET_DELETE: u8 = 3;
pub const CHANGESET_INDIRECT: u8 = 0x80;

pub const VALUE_NULL: u8 = 0;
pub const VALUE_INTEGER: u8 = 1;
pub const VALUE_REAL: u8 = 2;
pub const VALUE_TEXT: u8 = 3;
pub const VALUE_BLOB: u8 = 4;
pub const VALUE_UNDEFINED: u8 = 5;

/// Whether a buffer carries full change data or the reduced patch form.
///
/// Every table header opens with a marker byte, so the kind is a property
/// of the data itself and mixing kinds is detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    /// Full old and new row data; invertible.
    Changeset,
    /// Old images reduced to primary-key cells; smaller, not invertible.
    Patchset,
}

impl SetKind {
    pub fn marker(self) -> u8 {
        match self {
            SetKind::Changeset => MARKER_CHANGESET,
            SetKind::Patchset => MARKER_PATCHSET,
        }
    }

    pub fn from_marker(byte: u8) -> Result<SetKind> {
        match byte {
            MARKER_CHANGESET => Ok(SetKind::Changeset),
            MARKER_PATCHSET => Ok(SetKind::Patchset),
            other => Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("unknown set marker byte {:#04x}", other),
            )),
        }
    }
}

/// Classify a raw buffer by its leading marker. Empty data counts as an
/// empty changeset.
pub fn sniff_kind(data: &[u8]) -> Result<SetKind> {
    match data.first() {
        None => Ok(SetKind::Changeset),
        Some(&byte) => SetKind::from_marker(byte),
    }
}

/// One row image. `None` marks a cell the encoder did not record.
pub type Row = Vec<Option<Value>>;

/// Wrap a full engine row as a fully-defined image.
pub fn full_image(values: &[Value]) -> Row {
    values.iter().cloned().map(Some).collect()
}

/// Keep only the primary-key cells of an image, leaving the rest undefined.
pub fn key_image(row: &Row, pk: &[bool]) -> Row {
    row.iter()
        .zip(pk.iter())
        .map(|(cell, &is_pk)| if is_pk { cell.clone() } else { None })
        .collect()
}

/// Extract the primary-key cell values of an image, in declaration order.
///
/// Fails with `Corrupt` if a key cell is undefined; every valid record
/// carries its full primary key.
pub fn pk_cells(row: &Row, pk: &[bool]) -> Result<Vec<Value>> {
    let mut cells = Vec::new();
    for (cell, &is_pk) in row.iter().zip(pk.iter()) {
        if !is_pk {
            continue;
        }
        match cell {
            Some(value) => cells.push(value.clone()),
            None => {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    "record is missing a primary-key value",
                ))
            }
        }
    }
    Ok(cells)
}

// ============================================================================
// Table Header
// ============================================================================

/// Header shared by one run of records for a single table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHeader {
    pub table: String,
    pub n_col: usize,
    pub pk: Vec<bool>,
}

pub fn encode_table_header(buf: &mut Vec<u8>, kind: SetKind, header: &TableHeader) {
    buf.push(kind.marker());
    put_varint(buf, header.table.len() as u64);
    buf.extend_from_slice(header.table.as_bytes());
    put_varint(buf, header.n_col as u64);
    for &is_pk in &header.pk {
        buf.push(u8::from(is_pk));
    }
}

pub fn decode_table_header(data: &[u8], pos: &mut usize) -> Result<(SetKind, TableHeader)> {
    if *pos >= data.len() {
        return Err(corrupt("truncated table header"));
    }
    let kind = SetKind::from_marker(data[*pos])?;
    *pos += 1;
    let name_len = read_varint(data, pos)? as usize;
    let name = take(data, pos, name_len)?;
    let table = std::str::from_utf8(name)
        .map_err(|_| corrupt("table name is not UTF-8"))?
        .to_string();

    let n_col = read_varint(data, pos)? as usize;
    let flags = take(data, pos, n_col)?;
    let pk = flags.iter().map(|&b| b != 0).collect();

    Ok((kind, TableHeader { table, n_col, pk }))
}

// ============================================================================
// Op Byte
// ============================================================================

pub fn encode_op(op: ChangeOp, indirect: bool) -> u8 {
    let byte = match op {
        ChangeOp::Insert => CHANGESET_INSERT,
        ChangeOp::Update => CHANGESET_UPDATE,
        ChangeOp::Delete => CHANGESET_DELETE,
    };
    if indirect {
        byte | CHANGESET_INDIRECT
    } else {
        byte
    }
}

pub fn decode_op(byte: u8) -> Result<(ChangeOp, bool)> {
    let indirect = byte & CHANGESET_INDIRECT != 0;
    let op = match byte & !CHANGESET_INDIRECT {
        CHANGESET_INSERT => ChangeOp::Insert,
        CHANGESET_UPDATE => ChangeOp::Update,
        CHANGESET_DELETE => ChangeOp::Delete,
        other => {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("unknown change op byte {:#04x}", other),
            ))
        }
    };
    Ok((op, indirect))
}

// ============================================================================
// Cells and Rows
// ============================================================================

pub fn encode_cell(buf: &mut Vec<u8>, cell: Option<&Value>) {
    match cell {
        None => buf.push(VALUE_UNDEFINED),
        Some(Value::Null) => buf.push(VALUE_NULL),
        Some(Value::Integer(v)) => {
            buf.push(VALUE_INTEGER);
            put_varint(buf, zigzag_encode(*v));
        }
        Some(Value::Real(v)) => {
            buf.push(VALUE_REAL);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Some(Value::Text(v)) => {
            buf.push(VALUE_TEXT);
            put_varint(buf, v.len() as u64);
            buf.extend_from_slice(v.as_bytes());
        }
        Some(Value::Blob(v)) => {
            buf.push(VALUE_BLOB);
            put_varint(buf, v.len() as u64);
            buf.extend_from_slice(v);
        }
    }
}

pub fn decode_cell(data: &[u8], pos: &mut usize) -> Result<Option<Value>> {
    if *pos >= data.len() {
        return Err(corrupt("truncated record"));
    }
    let tag = data[*pos];
    *pos += 1;
    match tag {
        VALUE_UNDEFINED => Ok(None),
        VALUE_NULL => Ok(Some(Value::Null)),
        VALUE_INTEGER => {
            let raw = read_varint(data, pos)?;
            Ok(Some(Value::Integer(zigzag_decode(raw))))
        }
        VALUE_REAL => {
            let bytes = take(data, pos, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Ok(Some(Value::Real(f64::from_be_bytes(raw))))
        }
        VALUE_TEXT | VALUE_BLOB => {
            let len = read_varint(data, pos)? as usize;
            let payload = take(data, pos, len)?;
            if tag == VALUE_TEXT {
                let text = std::str::from_utf8(payload)
                    .map_err(|_| corrupt("text cell is not UTF-8"))?;
                Ok(Some(Value::Text(text.to_string())))
            } else {
                Ok(Some(Value::Blob(payload.to_vec())))
            }
        }
        other => Err(Error::with_message(
            ErrorCode::Corrupt,
            format!("unknown cell tag {:#04x}", other),
        )),
    }
}

pub fn encode_row(buf: &mut Vec<u8>, n_col: usize, row: &Row) -> Result<()> {
    if row.len() != n_col {
        return Err(Error::with_message(
            ErrorCode::Mismatch,
            format!("row has {} cells for {} columns", row.len(), n_col),
        ));
    }
    for cell in row {
        encode_cell(buf, cell.as_ref());
    }
    Ok(())
}

pub fn decode_row(data: &[u8], pos: &mut usize, n_col: usize) -> Result<Row> {
    let mut row = Vec::with_capacity(n_col);
    for _ in 0..n_col {
        row.push(decode_cell(data, pos)?);
    }
    Ok(row)
}

// ============================================================================
// Records
// ============================================================================

/// Encode one record body (op byte plus its row images).
pub fn encode_record(
    buf: &mut Vec<u8>,
    n_col: usize,
    op: ChangeOp,
    indirect: bool,
    old: Option<&Row>,
    new: Option<&Row>,
) -> Result<()> {
    let (want_old, want_new) = match op {
        ChangeOp::Insert => (false, true),
        ChangeOp::Update => (true, true),
        ChangeOp::Delete => (true, false),
    };
    if want_old != old.is_some() || want_new != new.is_some() {
        return Err(Error::with_message(
            ErrorCode::Internal,
            "record images do not match its operation",
        ));
    }
    buf.push(encode_op(op, indirect));
    if let Some(row) = old {
        encode_row(buf, n_col, row)?;
    }
    if let Some(row) = new {
        encode_row(buf, n_col, row)?;
    }
    Ok(())
}

/// Streaming-order changeset encoder.
///
/// Emits a table header when the table changes, closes each run with the
/// terminator byte, and never reorders the records pushed into it.
pub struct ChangesetBuilder {
    kind: SetKind,
    buf: Vec<u8>,
    current: Option<TableHeader>,
}

impl ChangesetBuilder {
    pub fn new(kind: SetKind) -> Self {
        Self {
            kind,
            buf: Vec::new(),
            current: None,
        }
    }

    /// Append one record under `header`, opening a new table run if needed.
    pub fn push(
        &mut self,
        header: &TableHeader,
        op: ChangeOp,
        indirect: bool,
        old: Option<&Row>,
        new: Option<&Row>,
    ) -> Result<()> {
        if self.current.as_ref() != Some(header) {
            if self.current.is_some() {
                self.buf.push(CHANGESET_END);
            }
            encode_table_header(&mut self.buf, self.kind, header);
            self.current = Some(header.clone());
        }
        encode_record(&mut self.buf, header.n_col, op, indirect, old, new)
    }

    /// Close the final run and return the encoded bytes.
    pub fn finish(mut self) -> Vec<u8> {
        if self.current.is_some() {
            self.buf.push(CHANGESET_END);
        }
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn corrupt(msg: &str) -> Error {
    Error::with_message(ErrorCode::Corrupt, msg)
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let (value, consumed) = get_varint(&data[*pos..]);
    if consumed == 0 {
        return Err(corrupt("truncated varint"));
    }
    *pos += consumed;
    Ok(value)
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| corrupt("record extends past end of data"))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ (-((value & 1) as i64))
}
