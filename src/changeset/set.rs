//! Changeset and patchset containers.
//!
//! A container is the immutable result of capturing changes: either a raw
//! in-memory buffer or a pair of byte streams. Both variants support invert,
//! combine, apply, and enumeration, with one deliberate asymmetry: the
//! in-memory variant returns new containers, while the stream variant
//! writes its result to the configured output stream and returns nothing.
//!
//! Every container holds a connection lock for its lifetime so the
//! connection it will apply against cannot be closed underneath it.

use std::fmt;
use std::io::{Read, Write};

use crate::changeset::apply::{apply_iter, ApplyOptions, ConflictAction, ConflictType};
use crate::changeset::format::{sniff_kind, ChangesetBuilder, SetKind};
use crate::changeset::group::ChangeGroup;
use crate::changeset::iter::{ChangeRecord, ChangesetIter, StartFlags};
use crate::engine::{ConnectionLock, SharedConnection};
use crate::error::{Error, ErrorCode, Result};
use crate::strm::{ChunkedReader, ChunkedWriter};

fn misuse(msg: &str) -> Error {
    Error::with_message(ErrorCode::Misuse, msg)
}

// ============================================================================
// Memory variant
// ============================================================================

/// Changeset or patchset held entirely in memory.
pub struct MemoryChangeset {
    data: Vec<u8>,
    kind: SetKind,
    lock: ConnectionLock,
}

impl MemoryChangeset {
    /// Wrap raw changeset bytes produced elsewhere. The kind is read from
    /// the data's marker byte; empty data is an empty changeset.
    pub fn from_bytes(conn: &SharedConnection, data: Vec<u8>) -> Result<Self> {
        let kind = sniff_kind(&data)?;
        Ok(Self {
            data,
            kind,
            lock: ConnectionLock::acquire(conn)?,
        })
    }

    pub(crate) fn from_parts(
        conn: &SharedConnection,
        data: Vec<u8>,
        kind: SetKind,
    ) -> Result<Self> {
        Ok(Self {
            data,
            kind,
            lock: ConnectionLock::acquire(conn)?,
        })
    }

    /// The raw encoded bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this container holds a changeset or a patchset.
    pub fn kind(&self) -> SetKind {
        self.kind
    }

    /// Begin a restartable enumeration of the records.
    pub fn iter(&self) -> ChangesetIter<'_> {
        ChangesetIter::from_bytes(&self.data)
    }

    /// Begin an enumeration with start flags.
    ///
    /// `StartFlags::INVERT` over a patchset is `Misuse`.
    pub fn iter_flagged(&self, flags: StartFlags) -> Result<ChangesetIter<'_>> {
        if flags.contains(StartFlags::INVERT) && self.kind == SetKind::Patchset {
            return Err(misuse("patchsets cannot be inverted"));
        }
        Ok(ChangesetIter::from_bytes_flagged(&self.data, flags))
    }

    /// Produce a new container with inserts and deletes swapped and old and
    /// new values exchanged, preserving record order.
    pub fn invert(&self) -> Result<MemoryChangeset> {
        if self.kind == SetKind::Patchset {
            return Err(misuse("patchsets cannot be inverted"));
        }
        let mut builder = ChangesetBuilder::new(self.kind);
        let mut iter = ChangesetIter::from_bytes_flagged(&self.data, StartFlags::INVERT);
        while iter.next()? {
            let record = iter.current()?;
            builder.push(
                &record.header(),
                record.operation(),
                record.is_indirect(),
                record.old_image(),
                record.new_image(),
            )?;
        }
        MemoryChangeset::from_parts(self.lock.connection(), builder.finish(), self.kind)
    }

    /// Merge this container with another of the same kind into a new one.
    pub fn combine_with(&self, other: &MemoryChangeset) -> Result<MemoryChangeset> {
        if self.kind != other.kind {
            return Err(misuse("cannot combine a changeset with a patchset"));
        }
        let mut group = ChangeGroup::new();
        if !self.data.is_empty() {
            group.add_bytes(&self.data)?;
        }
        if !other.data.is_empty() {
            group.add_bytes(&other.data)?;
        }
        MemoryChangeset::from_parts(self.lock.connection(), group.output()?, self.kind)
    }

    /// Replay this container against its connection.
    ///
    /// The conflict handler decides the fate of every conflicting record.
    /// If a table filter is given it is consulted once per distinct table;
    /// a `false` return skips every record of that table.
    pub fn apply<F, C>(&self, filter: Option<F>, conflict: C) -> Result<()>
    where
        F: FnMut(&str) -> bool,
        C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
    {
        self.apply_with_options(filter, conflict, &ApplyOptions::default())
    }

    /// As `apply`, with explicit options.
    pub fn apply_with_options<F, C>(
        &self,
        filter: Option<F>,
        conflict: C,
        options: &ApplyOptions,
    ) -> Result<()>
    where
        F: FnMut(&str) -> bool,
        C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
    {
        let mut iter = ChangesetIter::from_bytes(&self.data);
        apply_iter(self.lock.connection(), &mut iter, filter, conflict, options)
    }

    /// Release the connection lock early. Idempotent; dropping the
    /// container does the same.
    pub fn close(&mut self) {
        self.lock.release();
    }
}

impl fmt::Debug for MemoryChangeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = &self.data[..self.data.len().min(16)];
        f.debug_struct("MemoryChangeset")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("data", &hex::encode(preview))
            .finish()
    }
}

// ============================================================================
// Stream variant
// ============================================================================

/// Changeset or patchset flowing through byte streams.
///
/// The input stream is consumed by the first reading operation (enumerate,
/// invert, combine, or apply); a second one fails with `Misuse` instead of
/// reading stale data. Results of invert and combine go to the output
/// stream, which not every constructor provides.
pub struct StreamChangeset<'a> {
    input: Option<ChunkedReader<'a>>,
    output: Option<ChunkedWriter<'a>>,
    kind: SetKind,
    chunk_size: usize,
    lock: ConnectionLock,
}

impl<'a> StreamChangeset<'a> {
    /// Wrap an input stream. A `chunk_size` of 0 selects the default.
    pub fn new(
        conn: &SharedConnection,
        input: impl Read + 'a,
        kind: SetKind,
        chunk_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            input: Some(ChunkedReader::new(input, chunk_size)),
            output: None,
            kind,
            chunk_size,
            lock: ConnectionLock::acquire(conn)?,
        })
    }

    /// Wrap an input stream plus the output stream that invert and combine
    /// write to.
    pub fn with_output(
        conn: &SharedConnection,
        input: impl Read + 'a,
        output: impl Write + 'a,
        kind: SetKind,
        chunk_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            input: Some(ChunkedReader::new(input, chunk_size)),
            output: Some(ChunkedWriter::new(output, chunk_size)),
            kind,
            chunk_size,
            lock: ConnectionLock::acquire(conn)?,
        })
    }

    /// Whether this container carries a changeset or a patchset.
    pub fn kind(&self) -> SetKind {
        self.kind
    }

    fn take_input(&mut self) -> Result<ChunkedReader<'a>> {
        self.input
            .take()
            .ok_or_else(|| misuse("input stream already consumed"))
    }

    fn output(&mut self) -> Result<&mut ChunkedWriter<'a>> {
        self.output
            .as_mut()
            .ok_or_else(|| misuse("container has no output stream"))
    }

    /// Begin the single-pass enumeration of the records.
    ///
    /// Stream enumeration cannot restart; this consumes the input stream.
    pub fn iter(&mut self) -> Result<ChangesetIter<'a>> {
        let reader = self.take_input()?;
        Ok(ChangesetIter::from_reader(reader, StartFlags::empty()))
    }

    /// Invert the input and write the result to the output stream.
    ///
    /// Unlike the in-memory variant no new container is produced; the
    /// result is the side effect on the output stream.
    pub fn invert(&mut self) -> Result<()> {
        if self.kind == SetKind::Patchset {
            return Err(misuse("patchsets cannot be inverted"));
        }
        let reader = self.take_input()?;
        let mut iter = ChangesetIter::from_reader(reader, StartFlags::INVERT);
        let mut builder = ChangesetBuilder::new(self.kind);
        while iter.next()? {
            let record = iter.current()?;
            builder.push(
                &record.header(),
                record.operation(),
                record.is_indirect(),
                record.old_image(),
                record.new_image(),
            )?;
        }
        let data = builder.finish();
        self.output()?.push_chunked(&data)
    }

    /// Merge this stream with another of the same kind and write the result
    /// to this container's output stream.
    pub fn combine_with(&mut self, other: &mut StreamChangeset<'_>) -> Result<()> {
        if self.kind != other.kind {
            return Err(misuse("cannot combine a changeset with a patchset"));
        }
        let mine = self.take_input()?;
        let theirs = other.take_input()?;
        let mut group = ChangeGroup::new();
        group.add_stream(mine)?;
        group.add_stream(theirs)?;
        let data = group.output()?;
        self.output()?.push_chunked(&data)
    }

    /// Replay the streamed records against this container's connection.
    pub fn apply<F, C>(&mut self, filter: Option<F>, conflict: C) -> Result<()>
    where
        F: FnMut(&str) -> bool,
        C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
    {
        self.apply_with_options(filter, conflict, &ApplyOptions::default())
    }

    /// As `apply`, with explicit options.
    pub fn apply_with_options<F, C>(
        &mut self,
        filter: Option<F>,
        conflict: C,
        options: &ApplyOptions,
    ) -> Result<()>
    where
        F: FnMut(&str) -> bool,
        C: FnMut(ConflictType, &ChangeRecord) -> ConflictAction,
    {
        let reader = self.take_input()?;
        let mut iter = ChangesetIter::from_reader(reader, StartFlags::empty());
        let conn = self.lock.connection().clone();
        apply_iter(&conn, &mut iter, filter, conflict, options)
    }

    /// The configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Release the connection lock early. Idempotent; dropping the
    /// container does the same.
    pub fn close(&mut self) {
        self.lock.release();
    }
}
