use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

use ahash::AHashMap;

use crate::snapshot;
use crate::{KvError, KvResult};

/// Root id of the schema master container. Reserved at instance creation;
/// the allocation sequence starts above it.
pub const MASTER_ROOT: i32 = 2;

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// Registry of path-opened instances, so that several handles on the same
/// path share one [`Shared`]. Weak entries are pruned on open.
static REGISTRY: LazyLock<Mutex<AHashMap<PathBuf, Weak<Shared>>>> =
    LazyLock::new(|| Mutex::new(AHashMap::new()));

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Create the instance if the file does not exist yet.
    pub create: bool,
    pub read_only: bool,
    /// Advisory cache sizing in kilobytes. The in-process backend keeps
    /// everything resident; the value is recorded for introspection only.
    pub cache_kb: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            create: true,
            read_only: false,
            cache_kb: 2048,
        }
    }
}

pub(crate) type Container = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Meta {
    pub(crate) schema_sig: u32,
    pub(crate) format_version: u32,
}

pub(crate) enum Undo {
    /// Restore `key` in `root` to its prior value (`None` = absent).
    Restore {
        root: i32,
        key: Vec<u8>,
        prior: Option<Vec<u8>>,
    },
    CreateContainer(i32),
    DropContainer(i32, Container),
    Meta(Meta),
    NextRoot(i32),
}

pub(crate) struct Txn {
    owner: u64,
    depth: u32,
    undo: Vec<Undo>,
}

pub(crate) struct State {
    pub(crate) containers: BTreeMap<i32, Container>,
    pub(crate) meta: Meta,
    pub(crate) next_root: i32,
    pub(crate) txn: Option<Txn>,
}

impl State {
    fn fresh() -> State {
        let mut containers = BTreeMap::new();
        containers.insert(MASTER_ROOT, Container::new());
        State {
            containers,
            meta: Meta::default(),
            next_root: MASTER_ROOT + 1,
            txn: None,
        }
    }

    fn log(&mut self, undo: Undo) {
        if let Some(txn) = &mut self.txn {
            txn.undo.push(undo);
        }
    }
}

pub(crate) struct Shared {
    path: Option<PathBuf>,
    pub(crate) state: Mutex<State>,
}

/// A handle on one database instance. Cloning the handle shares the client
/// identity, so a connection's cursors all count as the same transaction
/// owner.
#[derive(Clone)]
pub struct Db {
    pub(crate) shared: Arc<Shared>,
    pub(crate) client: u64,
    read_only: bool,
}

impl Db {
    /// Open a database instance. `":memory:"` yields a private instance
    /// erased on close; any other path is shared between all handles open
    /// on it in this process and snapshotted to disk on commit.
    pub fn open(path: &str, opts: OpenOptions) -> KvResult<Db> {
        let client = NEXT_CLIENT.fetch_add(1, Ordering::Relaxed);
        if path == ":memory:" {
            let shared = Arc::new(Shared {
                path: None,
                state: Mutex::new(State::fresh()),
            });
            return Ok(Db {
                shared,
                client,
                read_only: opts.read_only,
            });
        }

        let path = PathBuf::from(path);
        let mut registry = REGISTRY.lock().expect("kv registry poisoned");
        registry.retain(|_, weak| weak.strong_count() > 0);
        if let Some(shared) = registry.get(&path).and_then(Weak::upgrade) {
            return Ok(Db {
                shared,
                client,
                read_only: opts.read_only,
            });
        }

        let state = if path.exists() {
            snapshot::read(&path)?
        } else if opts.create {
            State::fresh()
        } else {
            return Err(KvError::CantOpen(path.display().to_string()));
        };
        let shared = Arc::new(Shared {
            path: Some(path.clone()),
            state: Mutex::new(state),
        });
        registry.insert(path, Arc::downgrade(&shared));
        Ok(Db {
            shared,
            client,
            read_only: opts.read_only,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().expect("kv store poisoned")
    }

    /// Lock the state and verify this handle may read: free when no
    /// transaction is in flight or when this client owns it.
    pub(crate) fn lock_read(&self) -> KvResult<MutexGuard<'_, State>> {
        let state = self.lock();
        match &state.txn {
            Some(txn) if txn.owner != self.client => Err(KvError::Busy),
            _ => Ok(state),
        }
    }

    fn lock_write(&self) -> KvResult<MutexGuard<'_, State>> {
        if self.read_only {
            return Err(KvError::ReadOnly);
        }
        let state = self.lock();
        match &state.txn {
            Some(txn) if txn.owner == self.client => Ok(state),
            Some(_) => Err(KvError::Busy),
            None => Err(KvError::NoTransaction),
        }
    }

    // ---- transactions -----------------------------------------------

    /// Begin a transaction. A nested begin by the owning client reuses the
    /// outer transaction; a begin while another client holds it is `Busy`.
    pub fn begin(&self) -> KvResult<()> {
        if self.read_only {
            return Err(KvError::ReadOnly);
        }
        let mut state = self.lock();
        match &mut state.txn {
            Some(txn) if txn.owner == self.client => {
                txn.depth += 1;
                Ok(())
            }
            Some(_) => Err(KvError::Busy),
            None => {
                log::trace!("kv: client {} begins transaction", self.client);
                state.txn = Some(Txn {
                    owner: self.client,
                    depth: 1,
                    undo: Vec::new(),
                });
                Ok(())
            }
        }
    }

    pub fn in_txn(&self) -> bool {
        matches!(&self.lock().txn, Some(txn) if txn.owner == self.client)
    }

    pub fn commit(&self) -> KvResult<()> {
        let mut state = self.lock_write()?;
        let txn = state.txn.as_mut().expect("checked by lock_write");
        txn.depth -= 1;
        if txn.depth > 0 {
            return Ok(());
        }
        state.txn = None;
        log::trace!("kv: client {} commits", self.client);
        if let Some(path) = &self.shared.path {
            snapshot::write(path, &state)?;
        }
        Ok(())
    }

    /// Mark the current position in the transaction's undo log. Rewinding
    /// to the mark undoes everything logged after it without touching the
    /// transaction itself; statement-level ABORT is built on this.
    pub fn txn_mark(&self) -> KvResult<usize> {
        let state = self.lock_write()?;
        Ok(state.txn.as_ref().expect("checked by lock_write").undo.len())
    }

    pub fn txn_rewind(&self, mark: usize) -> KvResult<()> {
        let mut state = self.lock_write()?;
        let mut tail = {
            let txn = state.txn.as_mut().expect("checked by lock_write");
            if mark >= txn.undo.len() {
                return Ok(());
            }
            txn.undo.split_off(mark)
        };
        while let Some(undo) = tail.pop() {
            match undo {
                Undo::Restore { root, key, prior } => {
                    let container = state
                        .containers
                        .get_mut(&root)
                        .expect("undo names a live container");
                    match prior {
                        Some(value) => container.insert(key, value),
                        None => container.remove(&key),
                    };
                }
                Undo::CreateContainer(root) => {
                    state.containers.remove(&root);
                }
                Undo::DropContainer(root, contents) => {
                    state.containers.insert(root, contents);
                }
                Undo::Meta(meta) => state.meta = meta,
                Undo::NextRoot(root) => state.next_root = root,
            }
        }
        Ok(())
    }

    pub fn abort(&self) -> KvResult<()> {
        let mut state = self.lock_write()?;
        let txn = state.txn.as_mut().expect("checked by lock_write");
        txn.depth -= 1;
        if txn.depth > 0 {
            return Ok(());
        }
        let mut txn = state.txn.take().expect("still in place");
        log::trace!(
            "kv: client {} aborts, rolling back {} changes",
            self.client,
            txn.undo.len()
        );
        while let Some(undo) = txn.undo.pop() {
            match undo {
                Undo::Restore { root, key, prior } => {
                    let container = state
                        .containers
                        .get_mut(&root)
                        .expect("undo names a live container");
                    match prior {
                        Some(value) => container.insert(key, value),
                        None => container.remove(&key),
                    };
                }
                Undo::CreateContainer(root) => {
                    state.containers.remove(&root);
                }
                Undo::DropContainer(root, contents) => {
                    state.containers.insert(root, contents);
                }
                Undo::Meta(meta) => state.meta = meta,
                Undo::NextRoot(root) => state.next_root = root,
            }
        }
        Ok(())
    }

    // ---- containers -------------------------------------------------

    /// Allocate a fresh container, returning its root id from the
    /// persisted sequence.
    pub fn create_container(&self) -> KvResult<i32> {
        let mut state = self.lock_write()?;
        let root = state.next_root;
        state.log(Undo::NextRoot(root));
        state.next_root += 1;
        state.log(Undo::CreateContainer(root));
        state.containers.insert(root, Container::new());
        Ok(root)
    }

    pub fn container_exists(&self, root: i32) -> KvResult<bool> {
        Ok(self.lock_read()?.containers.contains_key(&root))
    }

    pub fn drop_container(&self, root: i32) -> KvResult<()> {
        let mut state = self.lock_write()?;
        let contents = state
            .containers
            .remove(&root)
            .ok_or(KvError::NoSuchContainer(root))?;
        state.log(Undo::DropContainer(root, contents));
        Ok(())
    }

    /// Remove every entry of a container, returning how many were removed.
    pub fn clear_container(&self, root: i32) -> KvResult<u64> {
        let mut state = self.lock_write()?;
        let contents = std::mem::take(
            state
                .containers
                .get_mut(&root)
                .ok_or(KvError::NoSuchContainer(root))?,
        );
        let count = contents.len() as u64;
        if state.txn.is_some() {
            for (key, value) in contents {
                state.log(Undo::Restore {
                    root,
                    key,
                    prior: Some(value),
                });
            }
        }
        Ok(count)
    }

    // ---- entries ----------------------------------------------------

    pub fn put(&self, root: i32, key: &[u8], value: &[u8]) -> KvResult<()> {
        let mut state = self.lock_write()?;
        let container = state
            .containers
            .get_mut(&root)
            .ok_or(KvError::NoSuchContainer(root))?;
        let prior = container.insert(key.to_vec(), value.to_vec());
        state.log(Undo::Restore {
            root,
            key: key.to_vec(),
            prior,
        });
        Ok(())
    }

    pub fn delete(&self, root: i32, key: &[u8]) -> KvResult<bool> {
        let mut state = self.lock_write()?;
        let container = state
            .containers
            .get_mut(&root)
            .ok_or(KvError::NoSuchContainer(root))?;
        let prior = container.remove(key);
        let found = prior.is_some();
        if found {
            state.log(Undo::Restore {
                root,
                key: key.to_vec(),
                prior,
            });
        }
        Ok(found)
    }

    pub fn get(&self, root: i32, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let state = self.lock_read()?;
        let container = state
            .containers
            .get(&root)
            .ok_or(KvError::NoSuchContainer(root))?;
        Ok(container.get(key).cloned())
    }

    pub fn entry_count(&self, root: i32) -> KvResult<u64> {
        let state = self.lock_read()?;
        let container = state
            .containers
            .get(&root)
            .ok_or(KvError::NoSuchContainer(root))?;
        Ok(container.len() as u64)
    }

    // ---- instance attributes ----------------------------------------

    pub fn schema_sig(&self) -> KvResult<u32> {
        Ok(self.lock_read()?.meta.schema_sig)
    }

    pub fn set_schema_sig(&self, sig: u32) -> KvResult<()> {
        let mut state = self.lock_write()?;
        let prior = state.meta;
        state.log(Undo::Meta(prior));
        state.meta.schema_sig = sig;
        Ok(())
    }

    pub fn format_version(&self) -> KvResult<u32> {
        Ok(self.lock_read()?.meta.format_version)
    }

    pub fn set_format_version(&self, version: u32) -> KvResult<()> {
        let mut state = self.lock_write()?;
        let prior = state.meta;
        state.log(Undo::Meta(prior));
        state.meta.format_version = version;
        Ok(())
    }

    /// Whether this handle persists to a file (false for `:memory:`).
    pub fn is_durable(&self) -> bool {
        self.shared.path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn mem() -> Db {
        Db::open(":memory:", OpenOptions::default()).unwrap()
    }

    #[test]
    fn master_container_reserved() {
        let db = mem();
        assert!(db.container_exists(MASTER_ROOT).unwrap());
        db.begin().unwrap();
        let root = db.create_container().unwrap();
        assert!(root > MASTER_ROOT);
        db.commit().unwrap();
    }

    #[test]
    fn abort_restores_prior_state() {
        let db = mem();
        db.begin().unwrap();
        db.put(MASTER_ROOT, b"k", b"v1").unwrap();
        db.commit().unwrap();

        db.begin().unwrap();
        db.put(MASTER_ROOT, b"k", b"v2").unwrap();
        db.put(MASTER_ROOT, b"other", b"x").unwrap();
        let root = db.create_container().unwrap();
        db.abort().unwrap();

        assert_eq!(db.get(MASTER_ROOT, b"k").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.get(MASTER_ROOT, b"other").unwrap(), None);
        assert!(!db.container_exists(root).unwrap());
    }

    #[test]
    fn nested_begin_reuses_outer() {
        let db = mem();
        db.begin().unwrap();
        db.begin().unwrap();
        db.put(MASTER_ROOT, b"a", b"1").unwrap();
        db.commit().unwrap();
        assert!(db.in_txn());
        db.abort().unwrap();
        assert_eq!(db.get(MASTER_ROOT, b"a").unwrap(), None);
    }

    #[test]
    fn second_client_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let path = path.to_str().unwrap();

        let a = Db::open(path, OpenOptions::default()).unwrap();
        let b = Db::open(path, OpenOptions::default()).unwrap();

        a.begin().unwrap();
        a.put(MASTER_ROOT, b"k", b"v").unwrap();
        assert!(matches!(b.begin(), Err(KvError::Busy)));
        assert!(matches!(b.get(MASTER_ROOT, b"k"), Err(KvError::Busy)));
        a.commit().unwrap();

        assert_eq!(b.get(MASTER_ROOT, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let path = path.to_str().unwrap();

        {
            let db = Db::open(path, OpenOptions::default()).unwrap();
            db.begin().unwrap();
            db.put(MASTER_ROOT, b"k", b"v").unwrap();
            db.set_schema_sig(7).unwrap();
            db.commit().unwrap();
        }

        let db = Db::open(path, OpenOptions::default()).unwrap();
        assert_eq!(db.get(MASTER_ROOT, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(db.schema_sig().unwrap(), 7);
    }
}
