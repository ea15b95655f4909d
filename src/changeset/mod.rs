//! Changeset containers, iteration, grouping, and replay.

pub mod apply;
pub mod format;
pub mod group;
pub mod iter;
pub mod set;

pub use apply::{ApplyFlags, ApplyOptions, ConflictAction, ConflictType, PanicPolicy};
pub use format::SetKind;
pub use group::ChangeGroup;
pub use iter::{ChangeRecord, ChangesetIter, StartFlags};
pub use set::{MemoryChangeset, StreamChangeset};
