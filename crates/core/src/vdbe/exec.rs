//! The byte-code interpreter. A single program counter walks the
//! instruction vector; the value stack is the only data path between
//! opcodes, with memory cells for addressable intermediates. Cursors,
//! row-id queues, sets, the sorter and aggregate contexts are owned by
//! the statement and torn down deterministically.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::sync::atomic::Ordering as AtomicOrdering;

use crate::catalog;
use crate::errors::{Error, ErrorCode, Result};
use crate::func::{AggCtx, FuncContext, FuncDef, FuncKind};
use crate::session::Conn;
use crate::vdbe::key::{self, KeyLayout};
use crate::vdbe::record;
use crate::vdbe::value::Value;
use crate::vdbe::{
    HALT_FAIL, HALT_ROLLBACK, Opcode, Operand, Program, WRITE_COUNT_CHANGE, WRITE_SET_ROWID,
};

pub enum RunOutcome {
    Row,
    Done,
}

enum CursorImpl {
    Store(squill_kv::Cursor),
    Temp {
        map: BTreeMap<Vec<u8>, Vec<u8>>,
        pos: Option<Vec<u8>>,
    },
    Pseudo {
        row: Option<(i64, Vec<u8>)>,
    },
}

struct VmCursor {
    imp: CursorImpl,
    key_as_data: bool,
    null_row: bool,
    eof: bool,
    /// Deferred seek target: a row id not yet applied to the storage
    /// cursor, with the cached-row-id validity that implies.
    deferred_rowid: Option<i64>,
}

impl VmCursor {
    fn temp() -> VmCursor {
        VmCursor {
            imp: CursorImpl::Temp {
                map: BTreeMap::new(),
                pos: None,
            },
            key_as_data: false,
            null_row: false,
            eof: false,
            deferred_rowid: None,
        }
    }

    fn pseudo() -> VmCursor {
        VmCursor {
            imp: CursorImpl::Pseudo { row: None },
            key_as_data: false,
            null_row: false,
            eof: false,
            deferred_rowid: None,
        }
    }

    fn store(cursor: squill_kv::Cursor) -> VmCursor {
        VmCursor {
            imp: CursorImpl::Store(cursor),
            key_as_data: false,
            null_row: false,
            eof: false,
            deferred_rowid: None,
        }
    }

    fn reset_position_state(&mut self) {
        self.null_row = false;
        self.eof = false;
        self.deferred_rowid = None;
    }

    /// Apply any deferred seek so reads see the right row.
    fn materialize(&mut self) -> Result<()> {
        if let Some(rowid) = self.deferred_rowid.take() {
            let target = key::encode_rowid(rowid);
            match &mut self.imp {
                CursorImpl::Store(cursor) => {
                    cursor.moveto(&target).map_err(Error::from)?;
                }
                CursorImpl::Temp { map, pos } => {
                    *pos = map
                        .range(target.to_vec()..)
                        .next()
                        .map(|(k, _)| k.clone());
                }
                CursorImpl::Pseudo { .. } => {}
            }
        }
        Ok(())
    }

    fn current_key(&mut self) -> Result<Option<Vec<u8>>> {
        self.materialize()?;
        match &self.imp {
            CursorImpl::Store(cursor) => {
                if cursor.is_valid() {
                    Ok(Some(cursor.key().map_err(Error::from)?))
                } else {
                    Ok(None)
                }
            }
            CursorImpl::Temp { pos, .. } => Ok(pos.clone()),
            CursorImpl::Pseudo { row } => {
                Ok(row.as_ref().map(|(id, _)| key::encode_rowid(*id).to_vec()))
            }
        }
    }

    fn current_value(&mut self) -> Result<Option<Vec<u8>>> {
        self.materialize()?;
        match &self.imp {
            CursorImpl::Store(cursor) => {
                if cursor.is_valid() {
                    Ok(Some(cursor.value().map_err(Error::from)?))
                } else {
                    Ok(None)
                }
            }
            CursorImpl::Temp { map, pos } => {
                Ok(pos.as_ref().and_then(|k| map.get(k).cloned()))
            }
            CursorImpl::Pseudo { row } => Ok(row.as_ref().map(|(_, rec)| rec.clone())),
        }
    }

    fn first(&mut self) -> Result<bool> {
        self.reset_position_state();
        let ok = match &mut self.imp {
            CursorImpl::Store(cursor) => cursor.first().map_err(Error::from)?,
            CursorImpl::Temp { map, pos } => {
                *pos = map.keys().next().cloned();
                pos.is_some()
            }
            CursorImpl::Pseudo { row } => row.is_some(),
        };
        self.eof = !ok;
        Ok(ok)
    }

    fn last(&mut self) -> Result<bool> {
        self.reset_position_state();
        let ok = match &mut self.imp {
            CursorImpl::Store(cursor) => cursor.last().map_err(Error::from)?,
            CursorImpl::Temp { map, pos } => {
                *pos = map.keys().next_back().cloned();
                pos.is_some()
            }
            CursorImpl::Pseudo { row } => row.is_some(),
        };
        self.eof = !ok;
        Ok(ok)
    }

    fn next(&mut self) -> Result<bool> {
        if self.eof || self.null_row {
            return Ok(false);
        }
        self.materialize()?;
        let ok = match &mut self.imp {
            CursorImpl::Store(cursor) => {
                if !cursor.is_valid() {
                    false
                } else {
                    cursor.next().map_err(Error::from)?
                }
            }
            CursorImpl::Temp { map, pos } => match pos.take() {
                Some(cur) => {
                    *pos = map
                        .range((std::ops::Bound::Excluded(cur), std::ops::Bound::Unbounded))
                        .next()
                        .map(|(k, _)| k.clone());
                    pos.is_some()
                }
                None => false,
            },
            CursorImpl::Pseudo { .. } => false,
        };
        self.eof = !ok;
        Ok(ok)
    }

    fn prev(&mut self) -> Result<bool> {
        if self.eof || self.null_row {
            return Ok(false);
        }
        self.materialize()?;
        let ok = match &mut self.imp {
            CursorImpl::Store(cursor) => {
                if !cursor.is_valid() {
                    false
                } else {
                    cursor.prev().map_err(Error::from)?
                }
            }
            CursorImpl::Temp { map, pos } => match pos.take() {
                Some(cur) => {
                    *pos = map.range(..cur).next_back().map(|(k, _)| k.clone());
                    pos.is_some()
                }
                None => false,
            },
            CursorImpl::Pseudo { .. } => false,
        };
        self.eof = !ok;
        Ok(ok)
    }

    /// Seek to the first entry at or after `target`; false when no such
    /// entry exists.
    fn seek_ge(&mut self, target: &[u8]) -> Result<bool> {
        self.reset_position_state();
        let ok = match &mut self.imp {
            CursorImpl::Store(cursor) => matches!(
                cursor.moveto(target).map_err(Error::from)?,
                squill_kv::Seek::Exact | squill_kv::Seek::After
            ),
            CursorImpl::Temp { map, pos } => {
                *pos = map.range(target.to_vec()..).next().map(|(k, _)| k.clone());
                pos.is_some()
            }
            CursorImpl::Pseudo { .. } => false,
        };
        self.eof = !ok;
        Ok(ok)
    }

    /// Exact lookup of an integer row id; positions on hit.
    fn seek_rowid(&mut self, rowid: i64) -> Result<bool> {
        self.reset_position_state();
        let target = key::encode_rowid(rowid);
        match &mut self.imp {
            CursorImpl::Store(cursor) => {
                let hit = cursor.moveto(&target).map_err(Error::from)? == squill_kv::Seek::Exact;
                self.eof = !hit;
                Ok(hit)
            }
            CursorImpl::Temp { map, pos } => {
                if map.contains_key(target.as_slice()) {
                    *pos = Some(target.to_vec());
                    Ok(true)
                } else {
                    self.eof = true;
                    Ok(false)
                }
            }
            CursorImpl::Pseudo { row } => Ok(row.as_ref().is_some_and(|(id, _)| *id == rowid)),
        }
    }

    fn contains(&mut self, target: &[u8]) -> Result<bool> {
        match &mut self.imp {
            CursorImpl::Store(cursor) => {
                Ok(cursor.moveto(target).map_err(Error::from)? == squill_kv::Seek::Exact)
            }
            CursorImpl::Temp { map, pos } => {
                if map.contains_key(target) {
                    *pos = Some(target.to_vec());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            CursorImpl::Pseudo { .. } => Ok(false),
        }
    }

    fn insert(&mut self, k: &[u8], v: &[u8]) -> Result<()> {
        self.reset_position_state();
        match &mut self.imp {
            CursorImpl::Store(cursor) => cursor.insert(k, v).map_err(Error::from),
            CursorImpl::Temp { map, pos } => {
                map.insert(k.to_vec(), v.to_vec());
                *pos = Some(k.to_vec());
                Ok(())
            }
            CursorImpl::Pseudo { row } => {
                *row = Some((key::decode_rowid(k), v.to_vec()));
                Ok(())
            }
        }
    }

    fn delete_at(&mut self) -> Result<()> {
        self.materialize()?;
        match &mut self.imp {
            CursorImpl::Store(cursor) => cursor.delete().map_err(Error::from),
            CursorImpl::Temp { map, pos } => {
                if let Some(k) = pos {
                    map.remove(k);
                }
                Ok(())
            }
            CursorImpl::Pseudo { row } => {
                *row = None;
                Ok(())
            }
        }
    }

    fn delete_key(&mut self, target: &[u8]) -> Result<()> {
        match &mut self.imp {
            CursorImpl::Store(cursor) => {
                if cursor.moveto(target).map_err(Error::from)? == squill_kv::Seek::Exact {
                    cursor.delete().map_err(Error::from)?;
                }
                Ok(())
            }
            CursorImpl::Temp { map, .. } => {
                map.remove(target);
                Ok(())
            }
            CursorImpl::Pseudo { row } => {
                *row = None;
                Ok(())
            }
        }
    }

    /// Fresh row id: one past the largest in use, falling back to random
    /// probing when the sequence is exhausted.
    fn new_rowid(&mut self) -> Result<i64> {
        let largest = match &mut self.imp {
            CursorImpl::Store(cursor) => {
                if cursor.last().map_err(Error::from)? {
                    Some(key::decode_rowid(&cursor.key().map_err(Error::from)?))
                } else {
                    None
                }
            }
            CursorImpl::Temp { map, .. } => {
                map.keys().next_back().map(|k| key::decode_rowid(k))
            }
            CursorImpl::Pseudo { row } => row.as_ref().map(|(id, _)| *id),
        };
        match largest {
            None => Ok(1),
            Some(id) if id < i64::MAX => Ok(id.max(0) + 1),
            Some(_) => {
                for _ in 0..100 {
                    let candidate = (rand::random::<i64>()).abs().max(1);
                    if !self.seek_rowid(candidate)? {
                        return Ok(candidate);
                    }
                }
                Err(Error::new(ErrorCode::Full, "unable to allocate a row id"))
            }
        }
    }
}

struct SetObj {
    items: std::collections::BTreeSet<Vec<u8>>,
    cursor: Option<Vec<u8>>,
}

enum AggSlotState {
    Val(Value),
    Acc(AggCtx, Arc<FuncDef>),
}

#[derive(Default)]
struct Aggregator {
    nslots: usize,
    contexts: BTreeMap<Vec<u8>, Vec<AggSlotState>>,
    current: Option<Vec<u8>>,
    iter_keys: Vec<Vec<u8>>,
    iter_pos: usize,
    iterating: bool,
}

struct CopyFile {
    reader: BufReader<File>,
    fields: Vec<Option<String>>,
}

/// Interpreter state for one statement execution.
pub struct Vm {
    pc: usize,
    stack: Vec<Value>,
    mem: Vec<Value>,
    cursors: Vec<Option<VmCursor>>,
    lists: Vec<(Vec<i64>, usize)>,
    sets: ahash::AHashMap<i32, SetObj>,
    sorter: Vec<(Vec<u8>, Vec<Value>)>,
    sorter_pos: usize,
    agg: Aggregator,
    returns: Vec<usize>,
    file: Option<CopyFile>,
    params: Vec<Value>,
    row: Vec<Value>,
    /// Databases whose transaction this statement opened (autocommit).
    begun_dbs: Vec<usize>,
    /// Undo-log marks for statement-level rollback.
    stmt_marks: Vec<(usize, usize)>,
    wrote: bool,
    delivered_rows: bool,
    ops_since_progress: u32,
    halted: bool,
}

impl Vm {
    pub fn new() -> Vm {
        Vm {
            pc: 0,
            stack: Vec::new(),
            mem: Vec::new(),
            cursors: Vec::new(),
            lists: vec![(Vec::new(), 0)],
            sets: ahash::AHashMap::new(),
            sorter: Vec::new(),
            sorter_pos: 0,
            agg: Aggregator::default(),
            returns: Vec::new(),
            file: None,
            params: Vec::new(),
            row: Vec::new(),
            begun_dbs: Vec::new(),
            stmt_marks: Vec::new(),
            wrote: false,
            delivered_rows: false,
            ops_since_progress: 0,
            halted: false,
        }
    }

    pub fn row(&self) -> &[Value] {
        &self.row
    }

    pub fn set_row(&mut self, row: Vec<Value>) {
        self.row = row;
    }

    /// Safe to restart from scratch after BUSY: nothing observable has
    /// happened yet.
    pub fn restartable(&self) -> bool {
        !self.wrote && !self.delivered_rows
    }

    /// Reset to the start of the program, capturing statement-undo marks
    /// for transactions already in flight.
    pub fn start(&mut self, program: &Program, params: Vec<Value>, conn: &mut Conn) -> Result<()> {
        self.teardown(conn);
        self.params = params;
        self.halted = false;
        conn.interrupt.store(false, AtomicOrdering::Relaxed);
        let slots: Vec<usize> = conn.catalog.slots().map(|(i, _)| i).collect();
        for db in slots {
            let store = &conn.catalog.db(db)?.store;
            if store.in_txn() {
                let mark = store.txn_mark()?;
                self.stmt_marks.push((db, mark));
            }
        }
        let _ = program;
        Ok(())
    }

    /// Release every resource owned by the execution, aborting any
    /// transaction the statement itself opened.
    pub fn teardown(&mut self, conn: &mut Conn) {
        for db in std::mem::take(&mut self.begun_dbs) {
            if let Ok(handle) = conn.catalog.db(db) {
                if handle.store.in_txn() {
                    let _ = handle.store.abort();
                }
            }
        }
        self.pc = 0;
        self.stack.clear();
        self.mem.clear();
        self.cursors.clear();
        self.lists = vec![(Vec::new(), 0)];
        self.sets.clear();
        self.sorter.clear();
        self.sorter_pos = 0;
        self.agg = Aggregator::default();
        self.returns.clear();
        self.file = None;
        self.stmt_marks.clear();
        self.wrote = false;
        self.delivered_rows = false;
        self.halted = false;
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::internal("stack underflow"))
    }

    fn pop_int(&mut self) -> Result<i64> {
        let v = self.pop()?;
        v.as_int()
            .ok_or_else(|| Error::new(ErrorCode::Mismatch, "datatype mismatch"))
    }

    fn pop_bytes(&mut self) -> Result<Vec<u8>> {
        match self.pop()? {
            Value::Blob(b) => Ok(b),
            Value::Text(t) => Ok(t.as_str().as_bytes().to_vec()),
            other => Err(Error::internal(format!(
                "expected key bytes on stack, found {other:?}"
            ))),
        }
    }

    fn peek(&self) -> Result<&Value> {
        self.stack
            .last()
            .ok_or_else(|| Error::internal("stack underflow"))
    }

    fn cursor(&mut self, idx: i32) -> Result<&mut VmCursor> {
        self.cursors
            .get_mut(idx as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::internal(format!("cursor {idx} is not open")))
    }

    fn put_cursor(&mut self, idx: i32, cursor: VmCursor) {
        let idx = idx as usize;
        if self.cursors.len() <= idx {
            self.cursors.resize_with(idx + 1, || None);
        }
        self.cursors[idx] = Some(cursor);
    }

    fn mem_cell(&mut self, idx: i32) -> &mut Value {
        let idx = idx as usize;
        if self.mem.len() <= idx {
            self.mem.resize(idx + 1, Value::Null);
        }
        &mut self.mem[idx]
    }

    fn set_obj(&mut self, idx: i32) -> &mut SetObj {
        self.sets.entry(idx).or_insert_with(|| SetObj {
            items: std::collections::BTreeSet::new(),
            cursor: None,
        })
    }

    fn check_interrupt(&self, conn: &Conn) -> Result<()> {
        if conn.interrupt.load(AtomicOrdering::Relaxed) {
            return Err(Error::new(ErrorCode::Interrupted, "interrupted"));
        }
        Ok(())
    }

    fn tick_progress(&mut self, conn: &mut Conn) -> Result<()> {
        let Some((every, hook)) = &mut conn.progress else {
            return Ok(());
        };
        self.ops_since_progress += 1;
        if self.ops_since_progress >= *every {
            self.ops_since_progress = 0;
            if hook() {
                return Err(Error::new(ErrorCode::Interrupted, "interrupted"));
            }
        }
        Ok(())
    }

    /// Execute until a result row, the final halt, or an error. Errors
    /// apply their policy (statement rewind, transaction rollback) before
    /// returning.
    pub fn run(&mut self, program: &Program, conn: &mut Conn) -> Result<RunOutcome> {
        if self.halted {
            return Ok(RunOutcome::Done);
        }
        match self.run_inner(program, conn) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.apply_error_policy(&err, conn);
                Err(err)
            }
        }
    }

    fn apply_error_policy(&mut self, err: &Error, conn: &mut Conn) {
        self.halted = true;
        if err.code == ErrorCode::Busy {
            return;
        }
        // Statement-level undo, then release any transaction this
        // statement opened. Full rollback is handled by Halt itself.
        for (db, mark) in self.stmt_marks.clone() {
            if let Ok(handle) = conn.catalog.db(db) {
                if handle.store.in_txn() {
                    let _ = handle.store.txn_rewind(mark);
                }
            }
        }
        for db in std::mem::take(&mut self.begun_dbs) {
            if let Ok(handle) = conn.catalog.db(db) {
                if handle.store.in_txn() {
                    let _ = handle.store.abort();
                }
            }
        }
    }

    fn rollback_everything(&mut self, conn: &mut Conn) {
        let slots: Vec<usize> = conn.catalog.slots().map(|(i, _)| i).collect();
        let mut rolled_back = Vec::new();
        for db in slots {
            if let Ok(handle) = conn.catalog.db(db) {
                if handle.store.in_txn() {
                    let _ = handle.store.abort();
                    rolled_back.push(db);
                }
            }
        }
        self.begun_dbs.clear();
        self.stmt_marks.clear();
        conn.in_txn = false;
        // The rollback may have undone DDL; the cached schema follows the
        // store.
        for db in rolled_back {
            let _ = reload_db_schema(conn, db);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_inner(&mut self, program: &Program, conn: &mut Conn) -> Result<RunOutcome> {
        loop {
            let Some(insn) = program.insns.get(self.pc) else {
                self.halted = true;
                return Ok(RunOutcome::Done);
            };
            let insn = insn.clone();
            self.pc += 1;
            self.tick_progress(conn)?;

            match insn.opcode {
                // ---- stack and memory ---------------------------------
                Opcode::Integer => match &insn.p3 {
                    Operand::Text(text) => {
                        let v = text.parse::<i64>().map_err(|_| {
                            Error::internal("malformed integer literal")
                        })?;
                        self.stack.push(Value::Int(v));
                    }
                    _ => self.stack.push(Value::Int(insn.p1 as i64)),
                },
                Opcode::String => {
                    let text = insn.p3.as_str().unwrap_or_default();
                    self.stack.push(Value::from_text(text));
                }
                Opcode::Real => {
                    let v = match insn.p3 {
                        Operand::Real(r) => r,
                        _ => 0.0,
                    };
                    self.stack.push(Value::Real(v));
                }
                Opcode::Null => self.stack.push(Value::Null),
                Opcode::Variable => {
                    let idx = insn.p1.max(1) as usize - 1;
                    let v = self.params.get(idx).cloned().unwrap_or(Value::Null);
                    self.stack.push(v);
                }
                Opcode::Dup => {
                    let depth = insn.p1 as usize;
                    let idx = self
                        .stack
                        .len()
                        .checked_sub(depth + 1)
                        .ok_or_else(|| Error::internal("Dup past stack bottom"))?;
                    let v = self.stack[idx].clone();
                    self.stack.push(v);
                }
                Opcode::Pop => {
                    for _ in 0..insn.p1 {
                        self.pop()?;
                    }
                }
                Opcode::Pull => {
                    let depth = insn.p1 as usize;
                    let idx = self
                        .stack
                        .len()
                        .checked_sub(depth + 1)
                        .ok_or_else(|| Error::internal("Pull past stack bottom"))?;
                    let v = self.stack.remove(idx);
                    self.stack.push(v);
                }
                Opcode::Push => {
                    let v = self.pop()?;
                    let depth = insn.p1 as usize;
                    let idx = self
                        .stack
                        .len()
                        .checked_sub(depth + 1)
                        .ok_or_else(|| Error::internal("Push past stack bottom"))?;
                    self.stack[idx] = v;
                }
                Opcode::MemStore => {
                    let v = if insn.p2 != 0 {
                        self.pop()?
                    } else {
                        self.peek()?.clone()
                    };
                    *self.mem_cell(insn.p1) = v;
                }
                Opcode::MemLoad => {
                    let v = self.mem_cell(insn.p1).clone();
                    self.stack.push(v);
                }
                Opcode::MemIncr => {
                    let cell = self.mem_cell(insn.p1);
                    let next = cell.as_int().unwrap_or(0) + 1;
                    *cell = Value::Int(next);
                    if next > 0 && insn.p2 != 0 {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::AddImm => {
                    let v = self.pop()?;
                    let n = v.as_int().unwrap_or(0) + insn.p1 as i64;
                    self.stack.push(Value::Int(n));
                }
                Opcode::MustBeInt => {
                    let v = self.peek()?.clone();
                    match v.as_int() {
                        Some(n)
                            if !matches!(v, Value::Real(r) if r.trunc() != r)
                                && !matches!(v, Value::Blob(_)) =>
                        {
                            *self.stack.last_mut().expect("peeked") = Value::Int(n);
                        }
                        _ => {
                            self.pop()?;
                            if insn.p2 != 0 {
                                self.pc = insn.p2 as usize;
                            } else {
                                let msg = insn
                                    .p3
                                    .as_str()
                                    .unwrap_or("datatype mismatch")
                                    .to_owned();
                                return Err(Error::new(
                                    ErrorCode::from_code(insn.p1),
                                    msg,
                                ));
                            }
                        }
                    }
                }
                Opcode::Concat => {
                    let n = insn.p1 as usize;
                    let at = self.stack.len().checked_sub(n).ok_or_else(|| {
                        Error::internal("Concat past stack bottom")
                    })?;
                    let parts: Vec<Value> = self.stack.split_off(at);
                    if parts.iter().any(Value::is_null) {
                        self.stack.push(Value::Null);
                    } else {
                        let joined: String =
                            parts.iter().map(Value::to_text).collect::<Vec<_>>().join(
                                insn.p3.as_str().unwrap_or(""),
                            );
                        self.stack.push(Value::from_text(&joined));
                    }
                }

                // ---- arithmetic, logic, comparison --------------------
                Opcode::Add
                | Opcode::Subtract
                | Opcode::Multiply
                | Opcode::Divide
                | Opcode::Remainder => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.stack.push(arith(insn.opcode, &lhs, &rhs));
                }
                Opcode::BitAnd | Opcode::BitOr | Opcode::ShiftLeft | Opcode::ShiftRight => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    if lhs.is_null() || rhs.is_null() {
                        self.stack.push(Value::Null);
                    } else {
                        let a = lhs.as_int().unwrap_or(0);
                        let b = rhs.as_int().unwrap_or(0);
                        let v = match insn.opcode {
                            Opcode::BitAnd => a & b,
                            Opcode::BitOr => a | b,
                            Opcode::ShiftLeft => a.wrapping_shl(b as u32),
                            _ => a.wrapping_shr(b as u32),
                        };
                        self.stack.push(Value::Int(v));
                    }
                }
                Opcode::Negative => {
                    let v = self.pop()?;
                    self.stack.push(match v {
                        Value::Null => Value::Null,
                        Value::Int(i) => Value::Int(-i),
                        other => match other.as_number() {
                            Some(n) => Value::Real(-n),
                            None => Value::Int(0),
                        },
                    });
                }
                Opcode::BitNot => {
                    let v = self.pop()?;
                    self.stack.push(match v.is_null() {
                        true => Value::Null,
                        false => Value::Int(!v.as_int().unwrap_or(0)),
                    });
                }
                Opcode::Not => {
                    let v = self.pop()?;
                    self.stack.push(if v.is_null() {
                        Value::Null
                    } else {
                        Value::Int(i64::from(!v.is_true()))
                    });
                }
                Opcode::And | Opcode::Or => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let a = (!lhs.is_null()).then(|| lhs.is_true());
                    let b = (!rhs.is_null()).then(|| rhs.is_true());
                    let out = if insn.opcode == Opcode::And {
                        match (a, b) {
                            (Some(false), _) | (_, Some(false)) => Some(false),
                            (Some(true), Some(true)) => Some(true),
                            _ => None,
                        }
                    } else {
                        match (a, b) {
                            (Some(true), _) | (_, Some(true)) => Some(true),
                            (Some(false), Some(false)) => Some(false),
                            _ => None,
                        }
                    };
                    self.stack.push(match out {
                        Some(b) => Value::Int(i64::from(b)),
                        None => Value::Null,
                    });
                }
                Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let verdict = lhs.sql_compare(&rhs).map(|ord| match insn.opcode {
                        Opcode::Eq => ord == Ordering::Equal,
                        Opcode::Ne => ord != Ordering::Equal,
                        Opcode::Lt => ord == Ordering::Less,
                        Opcode::Le => ord != Ordering::Greater,
                        Opcode::Gt => ord == Ordering::Greater,
                        _ => ord != Ordering::Less,
                    });
                    if insn.p2 != 0 {
                        if verdict == Some(true) {
                            self.pc = insn.p2 as usize;
                        }
                    } else {
                        self.stack.push(match verdict {
                            Some(b) => Value::Int(i64::from(b)),
                            None => Value::Null,
                        });
                    }
                }

                // ---- control flow -------------------------------------
                Opcode::Goto => {
                    self.check_interrupt(conn)?;
                    self.pc = insn.p2 as usize;
                }
                Opcode::If => {
                    let v = self.pop()?;
                    if v.is_true() {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::IfNot => {
                    let v = self.pop()?;
                    if !v.is_true() {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::IsNull => {
                    if self.peek()?.is_null() {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::NotNull => {
                    if !self.peek()?.is_null() {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::Gosub => {
                    self.returns.push(self.pc);
                    self.pc = insn.p2 as usize;
                }
                Opcode::Return => {
                    self.pc = self
                        .returns
                        .pop()
                        .ok_or_else(|| Error::internal("Return without Gosub"))?;
                }
                Opcode::Noop => {}
                Opcode::Halt => {
                    if insn.p1 == 0 {
                        self.halted = true;
                        // Any autocommit transaction the program left open
                        // (it normally commits itself) is committed here.
                        for db in std::mem::take(&mut self.begun_dbs) {
                            let handle = conn.catalog.db(db)?;
                            if handle.store.in_txn() {
                                handle.store.commit()?;
                            }
                        }
                        return Ok(RunOutcome::Done);
                    }
                    let message = insn
                        .p3
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| "statement halted".to_owned());
                    if insn.p2 == HALT_ROLLBACK {
                        self.rollback_everything(conn);
                    }
                    let code = ErrorCode::from_code(insn.p1);
                    if insn.p2 == HALT_FAIL {
                        // Keep prior changes: drop the statement marks so
                        // the error path does not rewind them.
                        self.stmt_marks.clear();
                        // The statement's own transaction still commits.
                        for db in std::mem::take(&mut self.begun_dbs) {
                            let handle = conn.catalog.db(db)?;
                            if handle.store.in_txn() {
                                handle.store.commit()?;
                            }
                        }
                    }
                    return Err(Error::new(code, message));
                }

                // ---- functions ----------------------------------------
                Opcode::Function => {
                    let argc = insn.p1 as usize;
                    let at = self.stack.len().checked_sub(argc).ok_or_else(|| {
                        Error::internal("Function args past stack bottom")
                    })?;
                    let args: Vec<Value> = self.stack.split_off(at);
                    let Operand::Func(def) = &insn.p3 else {
                        return Err(Error::internal("Function without a definition"));
                    };
                    let FuncKind::Scalar(f) = &def.kind else {
                        return Err(Error::internal("aggregate in scalar position"));
                    };
                    let mut ctx = FuncContext {
                        last_rowid: conn.last_rowid,
                    };
                    let out = f(&mut ctx, &args)?;
                    self.stack.push(out);
                }

                // ---- cursors ------------------------------------------
                Opcode::OpenRead | Opcode::OpenWrite => {
                    let root = if insn.p2 > 0 {
                        insn.p2
                    } else {
                        self.pop_int()? as i32
                    };
                    let db = self.pop_int()? as usize;
                    let write = insn.opcode == Opcode::OpenWrite;
                    let handle = conn.catalog.db(db)?;
                    let cursor = handle.store.cursor(root, write)?;
                    self.put_cursor(insn.p1, VmCursor::store(cursor));
                }
                Opcode::OpenTemp => {
                    self.put_cursor(insn.p1, VmCursor::temp());
                }
                Opcode::OpenPseudo => {
                    self.put_cursor(insn.p1, VmCursor::pseudo());
                }
                Opcode::Close => {
                    if let Some(slot) = self.cursors.get_mut(insn.p1 as usize) {
                        *slot = None;
                    }
                }
                Opcode::MoveTo => {
                    let v = self.pop()?;
                    match v {
                        Value::Blob(bytes) => {
                            if !self.cursor(insn.p1)?.seek_ge(&bytes)? && insn.p2 != 0 {
                                self.pc = insn.p2 as usize;
                            }
                        }
                        other => {
                            let rowid = other.as_int().ok_or_else(|| {
                                Error::new(ErrorCode::Mismatch, "datatype mismatch")
                            })?;
                            if insn.p2 == 0 {
                                let cursor = self.cursor(insn.p1)?;
                                cursor.reset_position_state();
                                cursor.deferred_rowid = Some(rowid);
                            } else if !self.cursor(insn.p1)?.seek_rowid(rowid)? {
                                self.pc = insn.p2 as usize;
                            }
                        }
                    }
                }
                Opcode::MoveLt => {
                    let bytes = self.pop_bytes()?;
                    let cursor = self.cursor(insn.p1)?;
                    let positioned = if cursor.seek_ge(&bytes)? {
                        cursor.prev()?
                    } else {
                        cursor.last()?
                    };
                    if !positioned && insn.p2 != 0 {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::NotExists => {
                    let rowid = self.pop_int()?;
                    if !self.cursor(insn.p1)?.seek_rowid(rowid)? {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::Found => {
                    let bytes = self.pop_bytes()?;
                    if self.cursor(insn.p1)?.contains(&bytes)? {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::NotFound => {
                    let bytes = self.pop_bytes()?;
                    if !self.cursor(insn.p1)?.contains(&bytes)? {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::IsUnique => {
                    let full = self.pop_bytes()?;
                    let (prefix, rowid) = key::split_rowid(&full);
                    let prefix = prefix.to_vec();
                    let mut bound = prefix.clone();
                    key::increment(&mut bound);
                    let cursor = self.cursor(insn.p1)?;
                    let mut conflict: Option<i64> = None;
                    if cursor.seek_ge(&prefix)? {
                        loop {
                            let Some(cur_key) = cursor.current_key()? else {
                                break;
                            };
                            if !bound.is_empty() && cur_key.as_slice() >= bound.as_slice() {
                                break;
                            }
                            let (_, entry_rowid) = key::split_rowid(&cur_key);
                            if entry_rowid != rowid {
                                conflict = Some(entry_rowid);
                                break;
                            }
                            if !cursor.next()? {
                                break;
                            }
                        }
                    }
                    match conflict {
                        Some(existing) => self.stack.push(Value::Int(existing)),
                        None => self.pc = insn.p2 as usize,
                    }
                }
                Opcode::Rewind => {
                    if !self.cursor(insn.p1)?.first()? {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::Last => {
                    if !self.cursor(insn.p1)?.last()? {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::Next => {
                    self.check_interrupt(conn)?;
                    if self.cursor(insn.p1)?.next()? {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::Prev => {
                    self.check_interrupt(conn)?;
                    if self.cursor(insn.p1)?.prev()? {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::Column => {
                    let cursor = self.cursor(insn.p1)?;
                    if cursor.null_row {
                        self.stack.push(Value::Null);
                    } else {
                        let data = if cursor.key_as_data {
                            cursor.current_key()?
                        } else {
                            cursor.current_value()?
                        };
                        let v = data
                            .map(|bytes| record::decode_column(&bytes, insn.p2 as usize))
                            .unwrap_or(Value::Null);
                        self.stack.push(v);
                    }
                }
                Opcode::Recno => {
                    let cursor = self.cursor(insn.p1)?;
                    if cursor.null_row {
                        self.stack.push(Value::Null);
                    } else if let Some(rowid) = cursor.deferred_rowid {
                        // Cached row id from a deferred seek.
                        self.stack.push(Value::Int(rowid));
                    } else {
                        let v = cursor
                            .current_key()?
                            .map(|k| Value::Int(key::decode_rowid(&k)))
                            .unwrap_or(Value::Null);
                        self.stack.push(v);
                    }
                }
                Opcode::IdxRecno => {
                    let cursor = self.cursor(insn.p1)?;
                    if cursor.null_row {
                        self.stack.push(Value::Null);
                    } else {
                        let v = cursor
                            .current_key()?
                            .map(|k| Value::Int(key::split_rowid(&k).1))
                            .unwrap_or(Value::Null);
                        self.stack.push(v);
                    }
                }
                Opcode::FullKey => {
                    let cursor = self.cursor(insn.p1)?;
                    let v = cursor
                        .current_key()?
                        .map(Value::Blob)
                        .unwrap_or(Value::Null);
                    self.stack.push(v);
                }
                Opcode::KeyAsData => {
                    self.cursor(insn.p1)?.key_as_data = insn.p2 != 0;
                }
                Opcode::IdxGE | Opcode::IdxGT => {
                    let bound = self.pop_bytes()?;
                    let cursor = self.cursor(insn.p1)?;
                    let jump = match cursor.current_key()? {
                        // Empty bound means "past everything": never reached.
                        Some(cur) => {
                            !bound.is_empty()
                                && if insn.opcode == Opcode::IdxGE {
                                    cur.as_slice() >= bound.as_slice()
                                } else {
                                    cur.as_slice() > bound.as_slice()
                                }
                        }
                        None => true,
                    };
                    if jump {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::NullRow => {
                    let cursor = self.cursor(insn.p1)?;
                    cursor.null_row = true;
                    cursor.deferred_rowid = None;
                }

                // ---- records, keys, writes ----------------------------
                Opcode::NewRecno => {
                    let rowid = self.cursor(insn.p1)?.new_rowid()?;
                    self.stack.push(Value::Int(rowid));
                }
                Opcode::MakeRecord => {
                    let n = insn.p1 as usize;
                    let at = self.stack.len().checked_sub(n).ok_or_else(|| {
                        Error::internal("MakeRecord past stack bottom")
                    })?;
                    let values: Vec<Value> = self.stack.split_off(at);
                    self.stack.push(Value::Blob(record::encode_record(&values)));
                }
                Opcode::MakeKey => {
                    let n = insn.p1 as usize;
                    let layout = operand_layout(&insn.p3, n);
                    let at = self.stack.len().checked_sub(n).ok_or_else(|| {
                        Error::internal("MakeKey past stack bottom")
                    })?;
                    let values: Vec<Value> = self.stack.split_off(at);
                    let bytes = key::encode_key(&values, &layout);
                    if insn.p2 != 0 {
                        self.stack.extend(values);
                    }
                    self.stack.push(Value::Blob(bytes));
                }
                Opcode::MakeIdxKey => {
                    let n = insn.p1 as usize;
                    let layout = operand_layout(&insn.p3, n);
                    let at = self.stack.len().checked_sub(n).ok_or_else(|| {
                        Error::internal("MakeIdxKey past stack bottom")
                    })?;
                    let values: Vec<Value> = self.stack.split_off(at);
                    let rowid = self.pop_int()?;
                    let mut bytes = key::encode_key(&values, &layout);
                    key::append_rowid(&mut bytes, rowid);
                    self.stack.push(Value::Blob(bytes));
                }
                Opcode::IncrKey => {
                    let mut bytes = self.pop_bytes()?;
                    key::increment(&mut bytes);
                    self.stack.push(Value::Blob(bytes));
                }
                Opcode::PutIntKey => {
                    let rec = self.pop_bytes()?;
                    let rowid = self.pop_int()?;
                    self.wrote = true;
                    self.cursor(insn.p1)?
                        .insert(&key::encode_rowid(rowid), &rec)?;
                    if insn.p2 & WRITE_SET_ROWID != 0 {
                        conn.last_rowid = rowid;
                    }
                    if insn.p2 & WRITE_COUNT_CHANGE != 0 {
                        conn.changes += 1;
                    }
                }
                Opcode::PutStrKey => {
                    let k = self.pop_bytes()?;
                    self.wrote = true;
                    self.cursor(insn.p1)?.insert(&k, &[])?;
                }
                Opcode::IdxPut => {
                    let k = self.pop_bytes()?;
                    if insn.p1 >= 0 && insn.p2 != 0 {
                        // Enforce uniqueness of the column prefix.
                        let (prefix, rowid) = key::split_rowid(&k);
                        let prefix = prefix.to_vec();
                        let mut bound = prefix.clone();
                        key::increment(&mut bound);
                        let cursor = self.cursor(insn.p1)?;
                        if cursor.seek_ge(&prefix)? {
                            if let Some(cur) = cursor.current_key()? {
                                let in_range =
                                    bound.is_empty() || cur.as_slice() < bound.as_slice();
                                if in_range && key::split_rowid(&cur).1 != rowid {
                                    let msg = insn
                                        .p3
                                        .as_str()
                                        .unwrap_or("uniqueness constraint failed")
                                        .to_owned();
                                    return Err(Error::constraint(msg));
                                }
                            }
                        }
                    }
                    self.wrote = true;
                    self.cursor(insn.p1)?.insert(&k, &[])?;
                }
                Opcode::Delete => {
                    self.wrote = true;
                    self.cursor(insn.p1)?.delete_at()?;
                    if insn.p2 & WRITE_COUNT_CHANGE != 0 {
                        conn.changes += 1;
                    }
                }
                Opcode::IdxDelete => {
                    let k = self.pop_bytes()?;
                    self.wrote = true;
                    self.cursor(insn.p1)?.delete_key(&k)?;
                }
                Opcode::Clear => {
                    let db = insn.p2 as usize;
                    self.wrote = true;
                    let removed = conn.catalog.db(db)?.store.clear_container(insn.p1)?;
                    if matches!(insn.p3, Operand::Static("count")) {
                        conn.changes += removed;
                    }
                }
                Opcode::Destroy => {
                    let db = insn.p2 as usize;
                    self.wrote = true;
                    conn.catalog.db(db)?.store.drop_container(insn.p1)?;
                }
                Opcode::CreateTable | Opcode::CreateIndex => {
                    let db = insn.p1 as usize;
                    self.wrote = true;
                    let root = conn.catalog.db(db)?.store.create_container()?;
                    self.stack.push(Value::Int(root as i64));
                }
                Opcode::Vacuum => {
                    // Compaction is delegated to the storage backend.
                }

                // ---- row-id queues ------------------------------------
                Opcode::ListPush => self.lists.push((Vec::new(), 0)),
                Opcode::ListPop => {
                    self.lists.pop();
                    if self.lists.is_empty() {
                        self.lists.push((Vec::new(), 0));
                    }
                }
                Opcode::ListWrite => {
                    let v = self.pop_int()?;
                    self.lists.last_mut().expect("list stack").0.push(v);
                }
                Opcode::ListRewind => {
                    self.lists.last_mut().expect("list stack").1 = 0;
                }
                Opcode::ListRead => {
                    let (list, pos) = self.lists.last_mut().expect("list stack");
                    if *pos < list.len() {
                        let v = list[*pos];
                        *pos += 1;
                        self.stack.push(Value::Int(v));
                    } else {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::ListReset => {
                    let (list, pos) = self.lists.last_mut().expect("list stack");
                    list.clear();
                    *pos = 0;
                }

                // ---- sets ---------------------------------------------
                Opcode::SetInsert => {
                    let v = self.pop()?;
                    let k = key::encode_key(&[v], &KeyLayout::ascending(1));
                    self.set_obj(insn.p1).items.insert(k);
                }
                Opcode::SetFound => {
                    let v = self.pop()?;
                    let k = key::encode_key(&[v], &KeyLayout::ascending(1));
                    if self.set_obj(insn.p1).items.contains(&k) {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::SetNotFound => {
                    let v = self.pop()?;
                    let k = key::encode_key(&[v], &KeyLayout::ascending(1));
                    if !self.set_obj(insn.p1).items.contains(&k) {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::SetFirst => {
                    let set = self.set_obj(insn.p1);
                    match set.items.iter().next().cloned() {
                        Some(k) => {
                            set.cursor = Some(k.clone());
                            let v = key::decode_key(&k).into_iter().next().unwrap_or(Value::Null);
                            self.stack.push(v);
                        }
                        None => self.pc = insn.p2 as usize,
                    }
                }
                Opcode::SetNext => {
                    let set = self.set_obj(insn.p1);
                    let next = set.cursor.as_ref().and_then(|cur| {
                        set.items
                            .range((
                                std::ops::Bound::Excluded(cur.clone()),
                                std::ops::Bound::Unbounded,
                            ))
                            .next()
                            .cloned()
                    });
                    if let Some(k) = next {
                        set.cursor = Some(k.clone());
                        let v = key::decode_key(&k).into_iter().next().unwrap_or(Value::Null);
                        self.stack.push(v);
                        self.pc = insn.p2 as usize;
                    }
                }

                // ---- sorter -------------------------------------------
                Opcode::SortPut => {
                    let n = insn.p1 as usize;
                    let at = self.stack.len().checked_sub(n).ok_or_else(|| {
                        Error::internal("SortPut past stack bottom")
                    })?;
                    let row: Vec<Value> = self.stack.split_off(at);
                    let k = self.pop_bytes()?;
                    self.sorter.push((k, row));
                }
                Opcode::Sort => {
                    self.sorter.sort_by(|a, b| a.0.cmp(&b.0));
                    self.sorter_pos = 0;
                }
                Opcode::SortNext => {
                    if self.sorter_pos < self.sorter.len() {
                        let row = self.sorter[self.sorter_pos].1.clone();
                        self.sorter_pos += 1;
                        self.stack.extend(row);
                    } else {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::SortReset => {
                    self.sorter.clear();
                    self.sorter_pos = 0;
                }

                // ---- aggregation --------------------------------------
                Opcode::AggReset => {
                    self.agg = Aggregator {
                        nslots: insn.p2 as usize,
                        ..Aggregator::default()
                    };
                }
                Opcode::AggFocus => {
                    let k = self.pop_bytes()?;
                    let nslots = self.agg.nslots;
                    let existed = self.agg.contexts.contains_key(&k);
                    self.agg
                        .contexts
                        .entry(k.clone())
                        .or_insert_with(|| {
                            (0..nslots).map(|_| AggSlotState::Val(Value::Null)).collect()
                        });
                    self.agg.current = Some(k);
                    if existed {
                        self.pc = insn.p2 as usize;
                    }
                }
                Opcode::AggInit => {
                    let Operand::Func(def) = &insn.p3 else {
                        return Err(Error::internal("AggInit without a definition"));
                    };
                    let def = def.clone();
                    let slot = insn.p2 as usize;
                    let cell = &mut self.current_agg()?[slot];
                    if matches!(cell, AggSlotState::Val(Value::Null)) {
                        *cell = AggSlotState::Acc(AggCtx::default(), def);
                    }
                }
                Opcode::AggSet => {
                    let v = self.pop()?;
                    let slot = insn.p2 as usize;
                    let ctx = self.current_agg()?;
                    ctx[slot] = AggSlotState::Val(v);
                }
                Opcode::AggGet => {
                    let slot = insn.p2 as usize;
                    let v = match &self.current_agg()?[slot] {
                        AggSlotState::Val(v) => v.clone(),
                        AggSlotState::Acc(..) => Value::Null,
                    };
                    self.stack.push(v);
                }
                Opcode::AggFunc => {
                    let argc = insn.p1 as usize;
                    let at = self.stack.len().checked_sub(argc).ok_or_else(|| {
                        Error::internal("AggFunc args past stack bottom")
                    })?;
                    let args: Vec<Value> = self.stack.split_off(at);
                    let Operand::Func(def) = &insn.p3 else {
                        return Err(Error::internal("AggFunc without a definition"));
                    };
                    let FuncKind::Aggregate { step, .. } = &def.kind else {
                        return Err(Error::internal("scalar in aggregate position"));
                    };
                    let step = step.clone();
                    let def = def.clone();
                    let slot = insn.p2 as usize;
                    let cell = &mut self.current_agg()?[slot];
                    if !matches!(cell, AggSlotState::Acc(..)) {
                        *cell = AggSlotState::Acc(AggCtx::default(), def);
                    }
                    let AggSlotState::Acc(ctx, _) = cell else {
                        unreachable!("just installed");
                    };
                    step(ctx, &args)?;
                }
                Opcode::AggNext => {
                    if !self.agg.iterating {
                        self.agg.iter_keys = self.agg.contexts.keys().cloned().collect();
                        self.agg.iter_pos = 0;
                        self.agg.iterating = true;
                    } else {
                        self.agg.iter_pos += 1;
                    }
                    if self.agg.iter_pos >= self.agg.iter_keys.len() {
                        self.pc = insn.p2 as usize;
                    } else {
                        let k = self.agg.iter_keys[self.agg.iter_pos].clone();
                        self.agg.current = Some(k.clone());
                        // Finalize the function slots of the now-current
                        // context.
                        let slots = self
                            .agg
                            .contexts
                            .get_mut(&k)
                            .ok_or_else(|| Error::internal("aggregate context vanished"))?;
                        for cell in slots.iter_mut() {
                            if let AggSlotState::Acc(ctx, def) = cell {
                                let FuncKind::Aggregate { finalize, .. } = &def.kind else {
                                    return Err(Error::internal("scalar in aggregate slot"));
                                };
                                let v = finalize(ctx)?;
                                *cell = AggSlotState::Val(v);
                            }
                        }
                    }
                }

                // ---- results ------------------------------------------
                Opcode::ColumnName => {
                    // Names are read statically off the program; nothing
                    // to do at run time.
                }
                Opcode::Callback => {
                    let n = insn.p1 as usize;
                    let at = self.stack.len().checked_sub(n).ok_or_else(|| {
                        Error::internal("Callback past stack bottom")
                    })?;
                    self.row = self.stack.split_off(at);
                    self.delivered_rows = true;
                    return Ok(RunOutcome::Row);
                }

                // ---- COPY ingest --------------------------------------
                Opcode::FileOpen => {
                    let path = insn.p3.as_str().unwrap_or_default();
                    let file = File::open(path).map_err(|err| {
                        Error::new(ErrorCode::CantOpen, format!("cannot open {path}: {err}"))
                    })?;
                    self.file = Some(CopyFile {
                        reader: BufReader::new(file),
                        fields: Vec::new(),
                    });
                }
                Opcode::FileRead => {
                    let delim = insn.p3.as_str().unwrap_or("\t").to_owned();
                    let Some(file) = &mut self.file else {
                        return Err(Error::internal("FileRead without FileOpen"));
                    };
                    let mut line = String::new();
                    let n = file.reader.read_line(&mut line)?;
                    if n == 0 {
                        self.file = None;
                        self.pc = insn.p2 as usize;
                    } else {
                        let line = line.trim_end_matches(['\n', '\r']);
                        file.fields = line
                            .split(delim.as_str())
                            .map(|field| {
                                if field == "\\N" {
                                    None
                                } else {
                                    Some(field.to_owned())
                                }
                            })
                            .collect();
                    }
                }
                Opcode::FileColumn => {
                    let v = self
                        .file
                        .as_ref()
                        .and_then(|f| f.fields.get(insn.p1 as usize))
                        .and_then(|field| field.as_ref().map(|s| Value::from_text(s)))
                        .unwrap_or(Value::Null);
                    self.stack.push(v);
                }

                // ---- transactions and schema --------------------------
                Opcode::Transaction => {
                    let db = insn.p1 as usize;
                    let handle = conn.catalog.db(db)?;
                    if !handle.store.in_txn() {
                        handle.store.begin()?;
                        let mark = handle.store.txn_mark()?;
                        self.stmt_marks.push((db, mark));
                        if insn.p2 == 0 {
                            self.begun_dbs.push(db);
                        }
                    }
                    if insn.p2 != 0 {
                        conn.in_txn = true;
                    }
                }
                Opcode::Commit => {
                    let vetoed = match &mut conn.commit_hook {
                        Some(hook) => hook(),
                        None => false,
                    };
                    if vetoed {
                        self.rollback_everything(conn);
                        return Err(Error::constraint("commit vetoed by hook"));
                    }
                    let slots: Vec<usize> = conn.catalog.slots().map(|(i, _)| i).collect();
                    for db in slots {
                        let handle = conn.catalog.db(db)?;
                        if handle.store.in_txn() {
                            handle.store.commit()?;
                        }
                    }
                    self.begun_dbs.clear();
                    self.stmt_marks.clear();
                    if insn.p2 != 0 {
                        conn.in_txn = false;
                    }
                }
                Opcode::Rollback => {
                    self.rollback_everything(conn);
                }
                Opcode::VerifyCookie => {
                    let db = insn.p1 as usize;
                    let stored = conn.catalog.db(db)?.store.schema_sig()?;
                    if stored != insn.p2 as u32 {
                        reload_db_schema(conn, db)?;
                        return Err(Error::new(
                            ErrorCode::Schema,
                            "database schema has changed",
                        ));
                    }
                }
                Opcode::SetCookie => {
                    let db = insn.p1 as usize;
                    self.wrote = true;
                    conn.catalog.db(db)?.store.set_schema_sig(insn.p2 as u32)?;
                }
                Opcode::ReloadSchema => {
                    let db = insn.p1 as usize;
                    reload_db_schema(conn, db)?;
                }
                Opcode::Attach => {
                    let name = self.pop()?.to_text();
                    let filename = self.pop()?.to_text();
                    attach_db(conn, &filename, &name)?;
                }
                Opcode::Detach => {
                    let name = self.pop()?.to_text();
                    if conn.in_txn {
                        return Err(Error::sql(
                            "cannot DETACH database within a transaction",
                        ));
                    }
                    conn.catalog.detach(&name)?;
                    conn.bump_generation();
                }
            }
        }
    }

    fn current_agg(&mut self) -> Result<&mut Vec<AggSlotState>> {
        let key = self
            .agg
            .current
            .clone()
            .ok_or_else(|| Error::internal("no aggregate context in focus"))?;
        self.agg
            .contexts
            .get_mut(&key)
            .ok_or_else(|| Error::internal("aggregate context vanished"))
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

fn operand_layout(operand: &Operand, n: usize) -> Arc<KeyLayout> {
    match operand {
        Operand::Layout(layout) => layout.clone(),
        _ => KeyLayout::ascending(n),
    }
}

fn arith(opcode: Opcode, lhs: &Value, rhs: &Value) -> Value {
    if lhs.is_null() || rhs.is_null() {
        return Value::Null;
    }
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        return match opcode {
            Opcode::Add => Value::Int(a.wrapping_add(*b)),
            Opcode::Subtract => Value::Int(a.wrapping_sub(*b)),
            Opcode::Multiply => Value::Int(a.wrapping_mul(*b)),
            Opcode::Divide => {
                if *b == 0 {
                    Value::Null
                } else {
                    Value::Int(a.wrapping_div(*b))
                }
            }
            _ => {
                if *b == 0 {
                    Value::Null
                } else {
                    Value::Int(a.wrapping_rem(*b))
                }
            }
        };
    }
    let a = lhs.as_number().unwrap_or(0.0);
    let b = rhs.as_number().unwrap_or(0.0);
    match opcode {
        Opcode::Add => Value::Real(a + b),
        Opcode::Subtract => Value::Real(a - b),
        Opcode::Multiply => Value::Real(a * b),
        Opcode::Divide => {
            if b == 0.0 {
                Value::Null
            } else {
                Value::Real(a / b)
            }
        }
        _ => {
            if b == 0.0 {
                Value::Null
            } else {
                Value::Real(a % b)
            }
        }
    }
}

/// Re-read a database's schema from its master table and refresh the
/// cached signature; every prepared statement is invalidated.
fn reload_db_schema(conn: &mut Conn, db: usize) -> Result<()> {
    let (schema, sig) = {
        let handle = conn.catalog.db(db)?;
        let schema = catalog::load_schema(db, &handle.store)?;
        let sig = handle.store.schema_sig()?;
        (schema, sig)
    };
    let slot = conn.catalog.db_mut(db)?;
    slot.schema = schema;
    slot.schema_sig = sig;
    conn.bump_generation();
    log::debug!("schema for database {db} reloaded at signature {sig}");
    Ok(())
}

fn attach_db(conn: &mut Conn, filename: &str, name: &str) -> Result<()> {
    let store = crate::store::DbHandle::open(filename, conn.config.read_only)?;
    let slot_probe = conn.catalog.dbs.len().max(2);
    let schema = catalog::load_schema(slot_probe, &store)?;
    let sig = store.schema_sig()?;
    if conn.in_txn {
        store.begin()?;
    }
    let idx = conn.catalog.attach(crate::catalog::AttachedDb {
        name: smol_str::SmolStr::new(name),
        store,
        schema,
        schema_sig: sig,
    })?;
    // The schema objects were loaded under a provisional slot number;
    // stamp them with the real one.
    if idx != slot_probe {
        let reloaded = {
            let handle = conn.catalog.db(idx)?;
            catalog::load_schema(idx, &handle.store)?
        };
        conn.catalog.db_mut(idx)?.schema = reloaded;
    }
    conn.bump_generation();
    Ok(())
}
