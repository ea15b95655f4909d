//! changetrack - row-level change tracking with portable changesets and
//! conflict-resolving replay.
//!
//! A [`Session`] attached to a live [`engine::Connection`] records the row
//! mutations made through it and flushes them as a binary changeset or
//! patchset. Changesets can be enumerated, inverted, combined with each
//! other (directly or through a [`ChangeGroup`]), and applied to another
//! connection, with every row-level conflict put to a caller-supplied
//! resolution callback.

pub mod changeset;
pub mod engine;
pub mod error;
pub mod session;
pub mod strm;
pub mod types;
pub mod util;

// Re-export main public types
pub use error::{errstr, Error, ErrorCode, Result};
pub use types::{ChangeOp, ColumnType, Value};

pub use changeset::{
    ApplyFlags, ApplyOptions, ChangeGroup, ChangeRecord, ChangesetIter, ConflictAction,
    ConflictType, MemoryChangeset, PanicPolicy, SetKind, StartFlags, StreamChangeset,
};
pub use engine::{Column, Connection, ConnectionLock, ForeignKey, SharedConnection, TableSchema};
pub use session::{Session, SessionOptions};
pub use strm::{ChunkedReader, ChunkedWriter, DEFAULT_CHUNK_SIZE};
