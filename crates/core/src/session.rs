//! The session facade: connections, prepared statements, hooks, and the
//! public-operation safety check. One connection is single-threaded; its
//! state machine assumes no two calls run against it concurrently.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use smol_str::SmolStr;

use crate::ast::ConflictAction;
use crate::auth::{AuthAction, AuthResult, Authorizer};
use crate::catalog::{AttachedDb, Catalog, load_schema};
use crate::compile;
use crate::errors::{Error, ErrorCode, Result};
use crate::func::{AggCtx, FuncDef, FuncKind, FuncRegistry};
use crate::parser::Parser;
use crate::schema::{MAIN_DB, TEMP_DB};
use crate::store::DbHandle;
use crate::vdbe::exec::Vm;
use crate::vdbe::value::Value;
use crate::vdbe::Program;

/// PRAGMA-settable behaviour toggles.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeFlags {
    pub full_column_names: bool,
    pub show_datatypes: bool,
    pub count_changes: bool,
    pub empty_result_callbacks: bool,
}

/// Immutable per-connection configuration fixed at open.
#[derive(Debug, Clone)]
pub struct OpenConfig {
    pub read_only: bool,
    /// Advisory storage cache sizing, in kilobytes.
    pub cache_kb: u32,
}

impl Default for OpenConfig {
    fn default() -> OpenConfig {
        OpenConfig {
            read_only: false,
            cache_kb: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// A public operation is in flight; re-entry is MISUSE.
    Busy,
    /// A fatal error occurred; only finalize/close proceed.
    Error,
}

type BusyHandler = Box<dyn FnMut(u32) -> bool>;
type TraceHook = Box<dyn FnMut(&str)>;
/// Returning true vetoes the commit.
type CommitHook = Box<dyn FnMut() -> bool>;
type ProgressHook = Box<dyn FnMut() -> bool>;

pub(crate) struct Conn {
    pub catalog: Catalog,
    pub funcs: FuncRegistry,
    pub flags: RuntimeFlags,
    pub config: OpenConfig,
    pub state: ConnState,
    /// An explicit BEGIN is open.
    pub in_txn: bool,
    pub interrupt: Arc<AtomicBool>,
    pub last_rowid: i64,
    /// Rows changed by the most recent statement.
    pub changes: u64,
    pub total_changes: u64,
    pub conflict_override: Option<ConflictAction>,
    /// Bumped on every catalog change; stale programs report SCHEMA.
    pub generation: u64,
    pub live_statements: usize,
    pub busy_handler: Option<BusyHandler>,
    pub trace: Option<TraceHook>,
    pub commit_hook: Option<CommitHook>,
    pub progress: Option<(u32, ProgressHook)>,
    pub authorizer: Option<Authorizer>,
}

impl Conn {
    pub fn run_authorizer(
        &mut self,
        action: AuthAction,
        arg1: Option<&str>,
        arg2: Option<&str>,
        db: Option<&str>,
        trigger: Option<&str>,
    ) -> AuthResult {
        match &mut self.authorizer {
            Some(hook) => hook(action, arg1, arg2, db, trigger),
            None => AuthResult::Allow,
        }
    }

    pub fn bump_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

/// A database connection. Cheap to move, not `Send`: the engine is
/// single-threaded per connection.
pub struct Connection {
    inner: Rc<RefCell<Conn>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Outcome of [`Statement::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Row,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StmtState {
    Init,
    Run,
    Halt,
    Dead,
}

pub struct Statement {
    conn: Rc<RefCell<Conn>>,
    program: Program,
    sql: String,
    vm: Vm,
    state: StmtState,
    params: Vec<Value>,
    /// Pending count_changes row, delivered after the writes finish.
    pending_count_row: bool,
}

/// A clonable handle that can flip the interrupt flag from anywhere.
#[derive(Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Connection {
    /// Open a connection: the main database at `path` (`":memory:"` for a
    /// private in-memory instance) plus a fresh temp database.
    pub fn open(path: &str) -> Result<Connection> {
        Connection::open_with(path, OpenConfig::default())
    }

    pub fn open_with(path: &str, config: OpenConfig) -> Result<Connection> {
        let main = DbHandle::open(path, config.read_only)?;
        let temp = DbHandle::open(":memory:", false)?;
        let main_schema = load_schema(MAIN_DB, &main)?;
        let temp_schema = load_schema(TEMP_DB, &temp)?;
        let main_sig = main.schema_sig()?;

        let mut catalog = Catalog::default();
        catalog.dbs.push(Some(AttachedDb {
            name: SmolStr::new_static("main"),
            store: main,
            schema: main_schema,
            schema_sig: main_sig,
        }));
        catalog.dbs.push(Some(AttachedDb {
            name: SmolStr::new_static("temp"),
            store: temp,
            schema: temp_schema,
            schema_sig: 0,
        }));

        Ok(Connection {
            inner: Rc::new(RefCell::new(Conn {
                catalog,
                funcs: FuncRegistry::with_builtins(),
                flags: RuntimeFlags::default(),
                config,
                state: ConnState::Open,
                in_txn: false,
                interrupt: Arc::new(AtomicBool::new(false)),
                last_rowid: 0,
                changes: 0,
                total_changes: 0,
                conflict_override: None,
                generation: 0,
                live_statements: 0,
                busy_handler: None,
                trace: None,
                commit_hook: None,
                progress: None,
                authorizer: None,
            })),
        })
    }

    /// Close the connection. Refused while prepared statements are live.
    pub fn close(self) -> std::result::Result<(), (Connection, Error)> {
        {
            let conn = self.inner.borrow();
            if conn.live_statements > 0 {
                drop(conn);
                return Err((
                    self,
                    Error::new(
                        ErrorCode::Busy,
                        "unable to close due to unfinalized statements",
                    ),
                ));
            }
        }
        let mut conn = self.inner.borrow_mut();
        if conn.in_txn {
            let slots: Vec<usize> = conn.catalog.slots().map(|(i, _)| i).collect();
            for db in slots {
                if let Ok(handle) = conn.catalog.db(db) {
                    if handle.store.in_txn() {
                        let _ = handle.store.abort();
                    }
                }
            }
            conn.in_txn = false;
        }
        Ok(())
    }

    /// Compile the first statement of `sql`. Returns the statement (None
    /// for empty input) and the byte offset of the unparsed tail.
    pub fn prepare(&self, sql: &str) -> Result<(Option<Statement>, usize)> {
        let mut conn = self.guard()?;
        let result = self.prepare_locked(&mut conn, sql);
        conn.state = ConnState::Open;
        drop(conn);
        result
    }

    fn prepare_locked(
        &self,
        conn: &mut Conn,
        sql: &str,
    ) -> Result<(Option<Statement>, usize)> {
        let mut parser = Parser::new(sql);
        let Some(stmt) = parser.parse_statement()? else {
            return Ok((None, sql.len()));
        };
        let tail = parser.tail_offset();
        let nvars = parser.parameter_count();
        let text = &sql[..tail];
        let program = compile::compile(conn, &stmt, nvars, text)?;
        conn.live_statements += 1;
        let params = vec![Value::Null; program.nvars];
        Ok((
            Some(Statement {
                conn: Rc::clone(&self.inner),
                sql: text.to_owned(),
                vm: Vm::new(),
                state: StmtState::Init,
                params,
                pending_count_row: false,
                program,
            }),
            tail,
        ))
    }

    /// Prepare, run to completion and finalize every statement in `sql`,
    /// delivering rows to `callback`. The callback returns `true` to
    /// abort.
    pub fn exec(
        &self,
        sql: &str,
        mut callback: impl FnMut(&[Value], &[String]) -> bool,
    ) -> Result<()> {
        let mut rest = sql;
        loop {
            let (stmt, tail) = self.prepare(rest)?;
            let Some(mut stmt) = stmt else {
                return Ok(());
            };
            let mut saw_row = false;
            loop {
                match stmt.step() {
                    Ok(StepOutcome::Row) => {
                        saw_row = true;
                        if callback(stmt.row(), stmt.column_names()) {
                            stmt.finalize()?;
                            return Err(Error::new(ErrorCode::Abort, "callback requested abort"));
                        }
                    }
                    Ok(StepOutcome::Done) => break,
                    Err(err) => {
                        let _ = stmt.finalize();
                        return Err(err);
                    }
                }
            }
            if !saw_row && stmt.column_count() > 0 {
                let flags = self.inner.borrow().flags;
                if flags.empty_result_callbacks && callback(&[], stmt.column_names()) {
                    stmt.finalize()?;
                    return Err(Error::new(ErrorCode::Abort, "callback requested abort"));
                }
            }
            stmt.finalize()?;
            rest = &rest[tail..];
            if rest.trim().is_empty() {
                return Ok(());
            }
        }
    }

    /// Run `sql` and collect the complete result: column names plus every
    /// row, materialised.
    pub fn get_table(&self, sql: &str) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
        let mut names: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        self.exec(sql, |row, columns| {
            if names.is_empty() {
                names = columns.to_vec();
            }
            rows.push(row.to_vec());
            false
        })?;
        Ok((names, rows))
    }

    fn guard(&self) -> Result<std::cell::RefMut<'_, Conn>> {
        let mut conn = self
            .inner
            .try_borrow_mut()
            .map_err(|_| Error::misuse("connection is in use"))?;
        match conn.state {
            ConnState::Busy => Err(Error::misuse("connection is busy")),
            ConnState::Error => Err(Error::misuse(
                "connection is in an error state; finalize statements first",
            )),
            ConnState::Open => {
                conn.state = ConnState::Busy;
                Ok(conn)
            }
        }
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.inner.borrow().last_rowid
    }

    /// Rows changed by the most recently completed statement.
    pub fn changes(&self) -> u64 {
        self.inner.borrow().changes
    }

    pub fn total_changes(&self) -> u64 {
        self.inner.borrow().total_changes
    }

    /// Set the cancellation flag; the running statement halts with
    /// INTERRUPTED at its next loop edge.
    pub fn interrupt(&self) {
        self.inner.borrow().interrupt.store(true, Ordering::Relaxed);
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.inner.borrow().interrupt))
    }

    pub fn set_busy_handler(&self, handler: Option<BusyHandler>) {
        self.inner.borrow_mut().busy_handler = handler;
    }

    pub fn set_trace(&self, hook: Option<TraceHook>) {
        self.inner.borrow_mut().trace = hook;
    }

    pub fn set_commit_hook(&self, hook: Option<CommitHook>) {
        self.inner.borrow_mut().commit_hook = hook;
    }

    pub fn set_progress_callback(&self, every_n_ops: u32, hook: Option<ProgressHook>) {
        self.inner.borrow_mut().progress = hook.map(|h| (every_n_ops.max(1), h));
    }

    pub fn set_authorizer(&self, authorizer: Option<Authorizer>) {
        self.inner.borrow_mut().authorizer = authorizer;
    }

    /// Statement-independent conflict-policy override (the second rung of
    /// the resolution ladder).
    pub fn set_conflict_override(&self, action: Option<ConflictAction>) {
        self.inner.borrow_mut().conflict_override = action;
    }

    /// Install or replace a scalar SQL function.
    pub fn create_function(
        &self,
        name: &str,
        arity: i32,
        f: impl Fn(&[Value]) -> Result<Value> + 'static,
    ) {
        self.inner.borrow_mut().funcs.register(FuncDef {
            name: SmolStr::new(name),
            arity,
            kind: FuncKind::Scalar(Arc::new(move |_, args| f(args))),
        });
    }

    /// Install or replace an aggregate SQL function.
    pub fn create_aggregate(
        &self,
        name: &str,
        arity: i32,
        step: impl Fn(&mut AggCtx, &[Value]) -> Result<()> + 'static,
        finalize: impl Fn(&mut AggCtx) -> Result<Value> + 'static,
    ) {
        self.inner.borrow_mut().funcs.register(FuncDef {
            name: SmolStr::new(name),
            arity,
            kind: FuncKind::Aggregate {
                step: Arc::new(step),
                finalize: Arc::new(finalize),
            },
        });
    }
}

impl Statement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn column_count(&self) -> usize {
        self.program.ncols
    }

    pub fn column_names(&self) -> &[String] {
        &self.program.column_names
    }

    pub fn column_name(&self, i: usize) -> Option<&str> {
        self.program.column_names.get(i).map(String::as_str)
    }

    /// The current result row, valid after a `Row` outcome.
    pub fn row(&self) -> &[Value] {
        self.vm.row()
    }

    pub fn column_value(&self, i: usize) -> Value {
        self.vm.row().get(i).cloned().unwrap_or(Value::Null)
    }

    /// Bind a parameter by 1-based index.
    pub fn bind(&mut self, index: usize, value: Value) -> Result<()> {
        if index == 0 || index > self.program.nvars {
            return Err(Error::new(
                ErrorCode::Range,
                format!("bind index {index} out of range"),
            ));
        }
        if self.state == StmtState::Run {
            return Err(Error::misuse("cannot bind while the statement is running"));
        }
        self.params[index - 1] = value;
        Ok(())
    }

    /// Advance the program: `Row` when a result row is ready, `Done` at
    /// the final halt.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.state == StmtState::Dead {
            return Err(Error::misuse("statement was finalized or is unusable"));
        }
        if self.state == StmtState::Halt {
            return Err(Error::misuse("statement needs reset before re-execution"));
        }

        // Borrow through a local handle so the guard does not pin `self`.
        let conn_rc = Rc::clone(&self.conn);
        let mut conn = conn_rc
            .try_borrow_mut()
            .map_err(|_| Error::misuse("connection is in use"))?;
        if conn.state == ConnState::Busy {
            return Err(Error::misuse("connection is busy"));
        }
        conn.state = ConnState::Busy;

        let outcome = self.step_locked(&mut conn);

        conn.state = match &outcome {
            Err(err) if is_fatal(err.code) => ConnState::Error,
            _ => ConnState::Open,
        };
        drop(conn);

        match &outcome {
            Ok(StepOutcome::Done) => self.state = StmtState::Halt,
            Ok(StepOutcome::Row) => self.state = StmtState::Run,
            Err(_) => self.state = StmtState::Halt,
        }
        outcome
    }

    fn step_locked(&mut self, conn: &mut Conn) -> Result<StepOutcome> {
        if self.pending_count_row {
            self.pending_count_row = false;
            return Ok(StepOutcome::Done);
        }

        if self.state == StmtState::Init {
            if self.program.generation != conn.generation {
                return Err(Error::new(
                    ErrorCode::Schema,
                    "database schema has changed",
                ));
            }
            if let Some(trace) = &mut conn.trace {
                trace(&self.sql);
            }
            conn.changes = 0;
            self.vm.start(&self.program, self.params.clone(), conn)?;
        }

        let mut attempts: u32 = 0;
        loop {
            match self.vm.run(&self.program, conn) {
                Ok(outcome) => {
                    if matches!(outcome, crate::vdbe::exec::RunOutcome::Done) {
                        conn.total_changes += conn.changes;
                        if conn.flags.count_changes && self.program.dml_label.is_some() {
                            // Deliver the change count as a one-row result.
                            self.vm.set_row(vec![Value::Int(conn.changes as i64)]);
                            self.pending_count_row = true;
                            return Ok(StepOutcome::Row);
                        }
                        return Ok(StepOutcome::Done);
                    }
                    return Ok(StepOutcome::Row);
                }
                Err(err) if err.code == ErrorCode::Busy && self.vm.restartable() => {
                    attempts += 1;
                    let retry = match &mut conn.busy_handler {
                        Some(handler) => handler(attempts),
                        None => false,
                    };
                    if !retry {
                        return Err(err);
                    }
                    self.vm.start(&self.program, self.params.clone(), conn)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Rewind to the pre-execution state without recompiling.
    pub fn reset(&mut self) -> Result<()> {
        let mut conn = self
            .conn
            .try_borrow_mut()
            .map_err(|_| Error::misuse("connection is in use"))?;
        self.vm.teardown(&mut conn);
        if conn.state == ConnState::Error {
            conn.state = ConnState::Open;
        }
        self.pending_count_row = false;
        self.state = StmtState::Init;
        Ok(())
    }

    /// Reclaim the statement. The final status of the last execution is
    /// folded into the result.
    pub fn finalize(mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        if self.state == StmtState::Dead {
            return;
        }
        if let Ok(mut conn) = self.conn.try_borrow_mut() {
            self.vm.teardown(&mut conn);
            conn.live_statements = conn.live_statements.saturating_sub(1);
            if conn.state == ConnState::Error {
                conn.state = ConnState::Open;
            }
        }
        self.state = StmtState::Dead;
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_fatal(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::Internal | ErrorCode::Corrupt | ErrorCode::RunRecovery | ErrorCode::NoMem
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_bootstraps_main_and_temp() {
        let conn = Connection::open(":memory:").unwrap();
        {
            let inner = conn.inner.borrow();
            assert_eq!(inner.catalog.slots().count(), 2);
            assert!(inner.catalog.db(MAIN_DB).unwrap().schema.table("squill_master").is_some());
            assert!(
                inner
                    .catalog
                    .db(TEMP_DB)
                    .unwrap()
                    .schema
                    .table("squill_temp_master")
                    .is_some()
            );
        }
        conn.close().unwrap();
    }

    #[test]
    fn close_refused_with_live_statement() {
        let conn = Connection::open(":memory:").unwrap();
        let (stmt, _) = conn.prepare("SELECT 1").unwrap();
        let stmt = stmt.unwrap();
        let conn = match conn.close() {
            Err((conn, err)) => {
                assert_eq!(err.code, ErrorCode::Busy);
                conn
            }
            Ok(()) => panic!("close should be refused"),
        };
        stmt.finalize().unwrap();
        conn.close().unwrap();
    }

    #[test]
    fn bind_out_of_range_is_range() {
        let conn = Connection::open(":memory:").unwrap();
        let (stmt, _) = conn.prepare("SELECT ?").unwrap();
        let mut stmt = stmt.unwrap();
        assert_eq!(
            stmt.bind(2, Value::Int(1)).unwrap_err().code,
            ErrorCode::Range
        );
        stmt.bind(1, Value::Int(1)).unwrap();
    }
}
