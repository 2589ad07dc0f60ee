//! On-disk snapshot format. The whole instance is serialized on commit and
//! replaced atomically via a rename, so a torn write never leaves a partial
//! file behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::store::{Container, Meta, State};
use crate::{KvError, KvResult};

const MAGIC: u32 = 0x53_51_4B_56; // "SQKV"

#[derive(Serialize, Deserialize)]
struct Snapshot {
    magic: u32,
    schema_sig: u32,
    format_version: u32,
    next_root: i32,
    containers: BTreeMap<i32, Container>,
}

pub(crate) fn read(path: &Path) -> KvResult<State> {
    let bytes = fs::read(path)?;
    let snapshot: Snapshot = bincode::deserialize(&bytes)
        .map_err(|err| KvError::Corrupt(err.to_string()))?;
    if snapshot.magic != MAGIC {
        return Err(KvError::Corrupt("bad magic".into()));
    }
    Ok(State {
        containers: snapshot.containers,
        meta: Meta {
            schema_sig: snapshot.schema_sig,
            format_version: snapshot.format_version,
        },
        next_root: snapshot.next_root,
        txn: None,
    })
}

pub(crate) fn write(path: &Path, state: &State) -> KvResult<()> {
    let snapshot = Snapshot {
        magic: MAGIC,
        schema_sig: state.meta.schema_sig,
        format_version: state.meta.format_version,
        next_root: state.next_root,
        containers: state.containers.clone(),
    };
    let bytes = bincode::serialize(&snapshot)
        .map_err(|err| KvError::Corrupt(err.to_string()))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
