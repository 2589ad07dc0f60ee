//! The code generator: consumes parsed statement trees, resolves names
//! against the catalog, and lowers everything into a VDBE program. Each
//! statement form lives in its own submodule; this module owns the
//! compiler state, the name scopes, and the program prologue that checks
//! schema cookies before the body runs.

mod ddl;
mod delete;
mod expr;
mod insert;
mod planner;
mod pragma;
mod select;
mod trigger;
mod update;

use smol_str::SmolStr;

use crate::ast::{ColumnPos, ConflictAction, Stmt};
use crate::auth::{AuthAction, AuthResult};
use crate::errors::{Error, ErrorCode, Result};
use crate::schema::{TEMP_DB, Table};
use crate::session::Conn;
use crate::vdbe::{Opcode, Program, ProgramBuilder};

pub(crate) use insert::ConstraintCtx;

/// One visible source in a name scope: a base-table cursor, a pseudo
/// cursor (OLD/NEW), a materialised subquery, or a cell window used by
/// constraint checks.
pub(crate) struct ScopeItem {
    /// Names this item answers to (alias, else table name).
    pub alias: SmolStr,
    /// Catalog identity when this is a base table.
    pub db: Option<usize>,
    pub table: Option<SmolStr>,
    pub cursor: i32,
    pub columns: Vec<SmolStr>,
    pub ipk: Option<usize>,
    /// When set, column i reads from memory cell `cells + i` instead of
    /// the cursor.
    pub cells: Option<i32>,
}

#[derive(Default)]
pub(crate) struct Scope<'p> {
    pub items: Vec<ScopeItem>,
    pub parent: Option<&'p Scope<'p>>,
}

pub(crate) struct Resolved {
    pub item_idx: usize,
    pub pos: ColumnPos,
}

impl<'p> Scope<'p> {
    fn is_rowid_name(name: &str) -> bool {
        name.eq_ignore_ascii_case("rowid")
            || name.eq_ignore_ascii_case("_rowid_")
            || name.eq_ignore_ascii_case("oid")
    }

    /// Resolve `[table.]column` in this scope only.
    fn resolve_here(&self, table: Option<&str>, column: &str) -> Result<Option<Resolved>> {
        let mut found: Option<Resolved> = None;
        for (item_idx, item) in self.items.iter().enumerate() {
            if let Some(table) = table {
                if !item.alias.eq_ignore_ascii_case(table) {
                    continue;
                }
            }
            let pos = item
                .columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(column));
            let pos = match pos {
                Some(i) => {
                    if item.ipk == Some(i) {
                        ColumnPos::Rowid
                    } else {
                        ColumnPos::Idx(i)
                    }
                }
                None if Self::is_rowid_name(column) && item.cells.is_none() => ColumnPos::Rowid,
                None => continue,
            };
            if found.is_some() {
                return Err(Error::sql(format!("ambiguous column name: {column}")));
            }
            found = Some(Resolved { item_idx, pos });
        }
        Ok(found)
    }

    /// Resolve through enclosing scopes; returns the scope distance too.
    pub fn resolve(
        &self,
        table: Option<&str>,
        column: &str,
    ) -> Result<(usize, Resolved)> {
        let mut scope: Option<&Scope<'_>> = Some(self);
        let mut level = 0;
        while let Some(s) = scope {
            if let Some(resolved) = s.resolve_here(table, column)? {
                return Ok((level, resolved));
            }
            scope = s.parent;
            level += 1;
        }
        let name = match table {
            Some(t) => format!("{t}.{column}"),
            None => column.to_owned(),
        };
        Err(Error::sql(format!("no such column: {name}")))
    }

    pub fn item(&self, level: usize, idx: usize) -> &ScopeItem {
        let mut scope = self;
        for _ in 0..level {
            scope = scope.parent.expect("level was resolved");
        }
        &scope.items[idx]
    }
}

pub(crate) fn scope_item_for_table(table: &Table, alias: Option<&str>, cursor: i32) -> ScopeItem {
    ScopeItem {
        alias: alias.map(SmolStr::new).unwrap_or_else(|| table.name.clone()),
        db: Some(table.db),
        table: Some(table.name.clone()),
        cursor,
        columns: table.columns.iter().map(|c| c.name.clone()).collect(),
        ipk: table.ipk_column,
        cells: None,
    }
}

pub(crate) struct Compiler<'a> {
    pub conn: &'a mut Conn,
    pub b: ProgramBuilder,
    next_cursor: i32,
    next_mem: i32,
    next_set: i32,
    next_list_depth: i32,
    /// Databases whose schema this program depends on.
    cookie_dbs: Vec<usize>,
    /// Databases this program writes; drives the transaction envelope.
    write_dbs: Vec<usize>,
    /// Triggers currently being expanded, to stop self-recursion.
    pub trigger_stack: Vec<SmolStr>,
    /// Jump target for RAISE(IGNORE) while inside a trigger body.
    pub ignore_label: Option<i32>,
    /// Source text of the statement being compiled, for the master table.
    pub sql_text: String,
}

impl<'a> Compiler<'a> {
    pub fn new(conn: &'a mut Conn) -> Compiler<'a> {
        Compiler {
            conn,
            b: ProgramBuilder::new(),
            next_cursor: 0,
            next_mem: 0,
            next_set: 0,
            next_list_depth: 0,
            cookie_dbs: Vec::new(),
            write_dbs: Vec::new(),
            trigger_stack: Vec::new(),
            ignore_label: None,
            sql_text: String::new(),
        }
    }

    pub fn alloc_cursor(&mut self) -> i32 {
        let c = self.next_cursor;
        self.next_cursor += 1;
        c
    }

    pub fn alloc_mem(&mut self) -> i32 {
        let m = self.next_mem;
        self.next_mem += 1;
        m
    }

    pub fn alloc_mems(&mut self, n: usize) -> i32 {
        let m = self.next_mem;
        self.next_mem += n as i32;
        m
    }

    pub fn alloc_set(&mut self) -> i32 {
        let s = self.next_set;
        self.next_set += 1;
        s
    }

    /// Record that the program depends on `db`'s schema signature.
    pub fn use_schema(&mut self, db: usize) {
        if !self.cookie_dbs.contains(&db) {
            self.cookie_dbs.push(db);
        }
    }

    /// Record that the program writes `db`. The transaction envelope is
    /// emitted into the prologue, where it runs before the body.
    pub fn begin_write(&mut self, db: usize) {
        self.use_schema(db);
        if !self.write_dbs.contains(&db) {
            self.write_dbs.push(db);
        }
    }

    pub fn writes_anything(&self) -> bool {
        !self.write_dbs.is_empty()
    }

    /// Authorizer gate. `Deny` fails compilation; `Ignore` is handed back
    /// for the caller to compile around.
    pub fn authorize(
        &mut self,
        action: AuthAction,
        arg1: Option<&str>,
        arg2: Option<&str>,
        db: Option<usize>,
    ) -> Result<AuthResult> {
        let db_name = db
            .and_then(|idx| self.conn.catalog.db(idx).ok())
            .map(|db| db.name.to_string());
        let trigger = self.trigger_stack.last().map(|t| t.to_string());
        let verdict = self.conn.run_authorizer(
            action,
            arg1,
            arg2,
            db_name.as_deref(),
            trigger.as_deref(),
        );
        if verdict == AuthResult::Deny {
            return Err(Error::new(
                ErrorCode::Auth,
                format!("not authorized: {}", <&'static str>::from(action)),
            ));
        }
        Ok(verdict)
    }

    /// Temp-or-not variants share one call site.
    pub fn create_action(&self, base: AuthAction, db: usize) -> AuthAction {
        use AuthAction::*;
        if db != TEMP_DB {
            return base;
        }
        match base {
            CreateIndex => CreateTempIndex,
            CreateTable => CreateTempTable,
            CreateTrigger => CreateTempTrigger,
            CreateView => CreateTempView,
            DropIndex => DropTempIndex,
            DropTable => DropTempTable,
            DropTrigger => DropTempTrigger,
            DropView => DropTempView,
            other => other,
        }
    }

    /// Effective conflict policy: statement override, then the
    /// connection's, then the declared action, then ABORT.
    pub fn conflict_policy(
        &self,
        stmt_override: Option<ConflictAction>,
        declared: Option<ConflictAction>,
    ) -> ConflictAction {
        stmt_override
            .or(self.conn.conflict_override)
            .or(declared)
            .unwrap_or(ConflictAction::Abort)
    }

    /// A nested row-id list for trigger bodies that scan while an outer
    /// statement is replaying its own list.
    pub fn push_list(&mut self) {
        self.next_list_depth += 1;
        self.b.emit(Opcode::ListPush, 0, 0);
    }

    pub fn pop_list(&mut self) {
        self.next_list_depth -= 1;
        self.b.emit(Opcode::ListPop, 0, 0);
    }

    fn finish(mut self) -> Program {
        // Body ends; the prologue verifies cookies and opens transactions,
        // then jumps back to the body. Instruction 0 is the jump out.
        self.b.emit(Opcode::Halt, 0, 0);
        let prologue = self.b.current_addr() as i32;
        self.b.set_p2(0, prologue);
        for db in std::mem::take(&mut self.cookie_dbs) {
            let sig = self
                .conn
                .catalog
                .db(db)
                .map(|d| d.schema_sig)
                .unwrap_or(0);
            self.b.emit(Opcode::VerifyCookie, db as i32, sig as i32);
        }
        if !self.conn.in_txn {
            for db in std::mem::take(&mut self.write_dbs) {
                self.b.emit(Opcode::Transaction, db as i32, 0);
            }
        }
        self.b.emit(Opcode::Goto, 0, 1);
        self.b.finish()
    }
}

/// Compile one statement into a program. `sql_text` is the statement's
/// own source slice; DDL persists it into the master table.
pub fn compile(conn: &mut Conn, stmt: &Stmt, nvars: usize, sql_text: &str) -> Result<Program> {
    if let Stmt::Explain(inner) = stmt {
        let program = compile(conn, inner, nvars, sql_text)?;
        return Ok(explain_program(&program));
    }

    let mut c = Compiler::new(conn);
    c.sql_text = sql_text.trim().trim_end_matches(';').trim().to_owned();
    c.b.nvars = nvars;
    c.b.generation = c.conn.generation;
    c.b.dml_label = match stmt {
        Stmt::Insert { .. } | Stmt::Copy { .. } => Some("rows inserted"),
        Stmt::Update { .. } => Some("rows updated"),
        Stmt::Delete { .. } => Some("rows deleted"),
        _ => None,
    };
    if c.conn.flags.count_changes {
        if let Some(label) = c.b.dml_label {
            c.b.ncols = 1;
            c.b.column_names = vec![label.to_owned()];
        }
    }
    // Address 0: jump to the prologue appended by finish().
    c.b.emit(Opcode::Goto, 0, 0);

    match stmt {
        Stmt::Select(select) => {
            select::compile_select_toplevel(&mut c, select)?;
        }
        Stmt::Insert {
            or_conflict,
            table,
            columns,
            source,
        } => insert::compile_insert(&mut c, *or_conflict, table, columns, source)?,
        Stmt::Update {
            or_conflict,
            table,
            sets,
            where_clause,
        } => update::compile_update(&mut c, *or_conflict, table, sets, where_clause.as_ref())?,
        Stmt::Delete {
            table,
            where_clause,
        } => delete::compile_delete(&mut c, table, where_clause.as_ref())?,
        Stmt::Copy {
            or_conflict,
            table,
            file,
            delimiter,
        } => insert::compile_copy(&mut c, *or_conflict, table, file, delimiter.as_deref())?,
        Stmt::CreateTable { .. }
        | Stmt::CreateIndex { .. }
        | Stmt::CreateView { .. }
        | Stmt::CreateTrigger { .. }
        | Stmt::Drop { .. }
        | Stmt::Attach { .. }
        | Stmt::Detach { .. }
        | Stmt::Begin(_)
        | Stmt::Commit
        | Stmt::Rollback
        | Stmt::Vacuum(_) => ddl::compile_ddl(&mut c, stmt)?,
        Stmt::Pragma {
            database,
            name,
            value,
        } => pragma::compile_pragma(&mut c, database.as_deref(), name, value.as_deref())?,
        Stmt::Explain(_) => unreachable!("handled above"),
    }

    // The write statement ends by committing what it opened, unless an
    // explicit transaction is in flight.
    if !c.conn.in_txn && c.writes_anything() {
        c.b.emit(Opcode::Commit, 0, 0);
    }
    Ok(c.finish())
}

/// EXPLAIN: a program whose rows describe another program.
fn explain_program(inner: &Program) -> Program {
    use crate::vdbe::Operand;
    let mut b = ProgramBuilder::new();
    b.generation = inner.generation;
    b.nvars = inner.nvars;
    b.ncols = 5;
    b.column_names = ["addr", "opcode", "p1", "p2", "p3"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for (i, name) in b.column_names.clone().iter().enumerate() {
        b.emit3(Opcode::ColumnName, i as i32, 0, Operand::Text(name.clone()));
    }
    for (addr, opcode, p1, p2, p3) in inner.explain() {
        b.emit(Opcode::Integer, addr, 0);
        b.emit3(Opcode::String, 0, 0, Operand::Text(opcode));
        b.emit(Opcode::Integer, p1, 0);
        b.emit(Opcode::Integer, p2, 0);
        b.emit3(Opcode::String, 0, 0, Operand::Text(p3));
        b.emit(Opcode::Callback, 5, 0);
    }
    b.emit(Opcode::Halt, 0, 0);
    b.finish()
}
