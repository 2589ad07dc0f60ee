//! Storage-manager adapter: the engine's view of one attached database
//! instance. Maps the engine's root ids onto `squill-kv` containers and
//! carries the transaction envelope and the two persisted schema scalars.

use squill_kv::{Cursor, Db, OpenOptions, Seek};

use crate::errors::{Error, ErrorCode, Result};

pub use squill_kv::MASTER_ROOT;

/// Newest on-disk layout this engine writes and the only one it reads.
pub const FORMAT_VERSION: u32 = 1;

pub struct DbHandle {
    kv: Db,
    pub filename: String,
}

impl DbHandle {
    /// Open (or create) a database instance. A brand-new instance gets the
    /// current format version stamped; an instance from a newer engine is
    /// refused.
    pub fn open(path: &str, read_only: bool) -> Result<DbHandle> {
        let kv = Db::open(
            path,
            OpenOptions {
                create: true,
                read_only,
                ..OpenOptions::default()
            },
        )?;
        let handle = DbHandle {
            kv,
            filename: path.to_owned(),
        };
        let version = handle.kv.format_version()?;
        if version == 0 && !read_only {
            handle.kv.begin()?;
            handle.kv.set_format_version(FORMAT_VERSION)?;
            handle.kv.commit()?;
        } else if version > FORMAT_VERSION {
            return Err(Error::new(
                ErrorCode::Format,
                format!("database {path} uses unsupported format version {version}"),
            ));
        }
        Ok(handle)
    }

    pub fn begin(&self) -> Result<()> {
        Ok(self.kv.begin()?)
    }

    pub fn commit(&self) -> Result<()> {
        Ok(self.kv.commit()?)
    }

    pub fn abort(&self) -> Result<()> {
        Ok(self.kv.abort()?)
    }

    pub fn in_txn(&self) -> bool {
        self.kv.in_txn()
    }

    pub fn txn_mark(&self) -> Result<usize> {
        Ok(self.kv.txn_mark()?)
    }

    pub fn txn_rewind(&self, mark: usize) -> Result<()> {
        Ok(self.kv.txn_rewind(mark)?)
    }

    /// Allocate a fresh container; the returned root id comes from the
    /// instance's persisted sequence.
    pub fn create_container(&self) -> Result<i32> {
        Ok(self.kv.create_container()?)
    }

    pub fn drop_container(&self, root: i32) -> Result<()> {
        Ok(self.kv.drop_container(root)?)
    }

    /// Truncate; returns the number of entries removed.
    pub fn clear_container(&self, root: i32) -> Result<u64> {
        Ok(self.kv.clear_container(root)?)
    }

    pub fn cursor(&self, root: i32, write: bool) -> Result<Cursor> {
        Ok(Cursor::open(&self.kv, root, write)?)
    }

    pub fn get(&self, root: i32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.get(root, key)?)
    }

    pub fn put(&self, root: i32, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.kv.put(root, key, value)?)
    }

    pub fn schema_sig(&self) -> Result<u32> {
        Ok(self.kv.schema_sig()?)
    }

    pub fn set_schema_sig(&self, sig: u32) -> Result<()> {
        Ok(self.kv.set_schema_sig(sig)?)
    }

    pub fn format_version(&self) -> Result<u32> {
        Ok(self.kv.format_version()?)
    }

    pub fn is_durable(&self) -> bool {
        self.kv.is_durable()
    }
}

pub type StoreCursor = Cursor;
pub type SeekOutcome = Seek;
