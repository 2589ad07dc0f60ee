use std::ops::Bound::{Excluded, Unbounded};

use crate::store::Db;
use crate::{KvError, KvResult};

/// Outcome of [`Cursor::moveto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    /// Positioned exactly on the requested key.
    Exact,
    /// Key absent; positioned on its greatest predecessor.
    Before,
    /// Key absent; positioned on its smallest successor.
    After,
    /// Container is empty; cursor is unpositioned.
    Empty,
}

/// A cursor over one container. The cursor owns its position (the current
/// key) rather than borrowing into the store, so it stays valid across
/// writes made through the same client; each operation re-locks the
/// instance and re-navigates from the owned key.
pub struct Cursor {
    db: Db,
    root: i32,
    write: bool,
    pos: Option<Vec<u8>>,
}

impl Cursor {
    pub fn open(db: &Db, root: i32, write: bool) -> KvResult<Cursor> {
        if !db.container_exists(root)? {
            return Err(KvError::NoSuchContainer(root));
        }
        Ok(Cursor {
            db: db.clone(),
            root,
            write,
            pos: None,
        })
    }

    pub fn root(&self) -> i32 {
        self.root
    }

    pub fn is_valid(&self) -> bool {
        self.pos.is_some()
    }

    fn with_container<T>(
        &self,
        f: impl FnOnce(&std::collections::BTreeMap<Vec<u8>, Vec<u8>>) -> T,
    ) -> KvResult<T> {
        let state = self.db.lock_read()?;
        let container = state
            .containers
            .get(&self.root)
            .ok_or(KvError::NoSuchContainer(self.root))?;
        Ok(f(container))
    }

    /// Position at `key`, or as close as the container allows.
    pub fn moveto(&mut self, key: &[u8]) -> KvResult<Seek> {
        let (pos, outcome) = self.with_container(|c| {
            if c.contains_key(key) {
                return (Some(key.to_vec()), Seek::Exact);
            }
            if let Some((next, _)) = c.range(key.to_vec()..).next() {
                return (Some(next.clone()), Seek::After);
            }
            match c.iter().next_back() {
                Some((last, _)) => (Some(last.clone()), Seek::Before),
                None => (None, Seek::Empty),
            }
        })?;
        self.pos = pos;
        Ok(outcome)
    }

    /// Advance to the next entry; `false` when the cursor runs off the end.
    pub fn next(&mut self) -> KvResult<bool> {
        let Some(pos) = self.pos.clone() else {
            return self.first();
        };
        self.pos = self.with_container(|c| {
            c.range((Excluded(pos), Unbounded))
                .next()
                .map(|(k, _)| k.clone())
        })?;
        Ok(self.pos.is_some())
    }

    pub fn prev(&mut self) -> KvResult<bool> {
        let Some(pos) = self.pos.clone() else {
            return self.last();
        };
        self.pos = self.with_container(|c| {
            c.range(..pos).next_back().map(|(k, _)| k.clone())
        })?;
        Ok(self.pos.is_some())
    }

    pub fn first(&mut self) -> KvResult<bool> {
        self.pos = self.with_container(|c| c.iter().next().map(|(k, _)| k.clone()))?;
        Ok(self.pos.is_some())
    }

    pub fn last(&mut self) -> KvResult<bool> {
        self.pos = self.with_container(|c| c.iter().next_back().map(|(k, _)| k.clone()))?;
        Ok(self.pos.is_some())
    }

    pub fn key(&self) -> KvResult<Vec<u8>> {
        self.pos.clone().ok_or(KvError::NotPositioned)
    }

    pub fn key_len(&self) -> KvResult<usize> {
        Ok(self.key()?.len())
    }

    pub fn value(&self) -> KvResult<Vec<u8>> {
        let key = self.pos.as_deref().ok_or(KvError::NotPositioned)?;
        self.with_container(|c| c.get(key).cloned())?
            .ok_or(KvError::NotPositioned)
    }

    pub fn value_len(&self) -> KvResult<usize> {
        Ok(self.value()?.len())
    }

    /// Sized read of the current key starting at `offset`.
    pub fn read_key(&self, offset: usize, len: usize) -> KvResult<Vec<u8>> {
        let key = self.key()?;
        Ok(slice_window(&key, offset, len))
    }

    /// Sized read of the current value starting at `offset`.
    pub fn read_value(&self, offset: usize, len: usize) -> KvResult<Vec<u8>> {
        let value = self.value()?;
        Ok(slice_window(&value, offset, len))
    }

    /// Insert `value` under `key` and leave the cursor on it.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        if !self.write {
            return Err(KvError::ReadOnly);
        }
        self.db.put(self.root, key, value)?;
        self.pos = Some(key.to_vec());
        Ok(())
    }

    /// Delete the entry under the cursor. The position is retained as a
    /// ghost so that a following `next` lands on the successor.
    pub fn delete(&mut self) -> KvResult<()> {
        if !self.write {
            return Err(KvError::ReadOnly);
        }
        let key = self.pos.as_deref().ok_or(KvError::NotPositioned)?;
        self.db.delete(self.root, key)?;
        Ok(())
    }
}

fn slice_window(bytes: &[u8], offset: usize, len: usize) -> Vec<u8> {
    let start = offset.min(bytes.len());
    let end = (offset + len).min(bytes.len());
    bytes[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MASTER_ROOT, OpenOptions};

    fn seeded() -> Db {
        let db = Db::open(":memory:", OpenOptions::default()).unwrap();
        db.begin().unwrap();
        for key in [b"b".as_ref(), b"d", b"f"] {
            db.put(MASTER_ROOT, key, b"v").unwrap();
        }
        db.commit().unwrap();
        db
    }

    #[test]
    fn moveto_three_valued() {
        let db = seeded();
        let mut cursor = Cursor::open(&db, MASTER_ROOT, false).unwrap();

        assert_eq!(cursor.moveto(b"d").unwrap(), Seek::Exact);
        assert_eq!(cursor.moveto(b"c").unwrap(), Seek::After);
        assert_eq!(cursor.key().unwrap(), b"d".to_vec());
        assert_eq!(cursor.moveto(b"z").unwrap(), Seek::Before);
        assert_eq!(cursor.key().unwrap(), b"f".to_vec());
    }

    #[test]
    fn scan_forward_and_back() {
        let db = seeded();
        let mut cursor = Cursor::open(&db, MASTER_ROOT, false).unwrap();

        assert!(cursor.first().unwrap());
        let mut keys = vec![cursor.key().unwrap()];
        while cursor.next().unwrap() {
            keys.push(cursor.key().unwrap());
        }
        assert_eq!(keys, vec![b"b".to_vec(), b"d".to_vec(), b"f".to_vec()]);

        assert!(cursor.last().unwrap());
        assert!(cursor.prev().unwrap());
        assert_eq!(cursor.key().unwrap(), b"d".to_vec());
    }

    #[test]
    fn delete_leaves_ghost_position() {
        let db = seeded();
        db.begin().unwrap();
        let mut cursor = Cursor::open(&db, MASTER_ROOT, true).unwrap();
        cursor.moveto(b"d").unwrap();
        cursor.delete().unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.key().unwrap(), b"f".to_vec());
        db.commit().unwrap();
    }

    #[test]
    fn writes_visible_within_transaction() {
        let db = seeded();
        db.begin().unwrap();
        let mut cursor = Cursor::open(&db, MASTER_ROOT, true).unwrap();
        cursor.insert(b"c", b"new").unwrap();
        assert_eq!(cursor.moveto(b"c").unwrap(), Seek::Exact);
        assert_eq!(cursor.value().unwrap(), b"new".to_vec());
        db.abort().unwrap();
        let mut cursor = Cursor::open(&db, MASTER_ROOT, false).unwrap();
        assert_eq!(cursor.moveto(b"c").unwrap(), Seek::After);
    }
}
