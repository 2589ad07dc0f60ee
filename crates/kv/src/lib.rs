//! Transactional key-value backend for the squill SQL engine.
//!
//! A [`Db`] is one *database instance*: a set of ordered containers, each
//! named by a dense integer root id, plus two persisted scalar attributes
//! (schema signature and format version). Containers are ordered maps from
//! raw byte keys to raw byte values; key order is plain `memcmp`, so the
//! engine is responsible for encoding keys in an order-preserving way.
//!
//! Instances opened by path are shared in-process: every [`Db`] handle on
//! the same path sees the same containers and coordinates through the same
//! single-writer transaction. `:memory:` instances are private to the
//! handle that opened them and vanish on close.

mod cursor;
mod snapshot;
mod store;

pub use cursor::{Cursor, Seek};
pub use store::{Db, OpenOptions, MASTER_ROOT};

/// Errors surfaced by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Another handle holds the instance's transaction.
    #[error("database is locked by another connection")]
    Busy,
    #[error("cannot open database: {0}")]
    CantOpen(String),
    #[error("no container with root id {0}")]
    NoSuchContainer(i32),
    #[error("cursor is not positioned on an entry")]
    NotPositioned,
    #[error("write attempted outside a transaction")]
    NoTransaction,
    #[error("write attempted through a read-only handle")]
    ReadOnly,
    #[error("database file is malformed: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type KvResult<T> = Result<T, KvError>;
