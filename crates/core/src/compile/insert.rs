//! INSERT and COPY lowering, plus the constraint-check and row-completion
//! blocks shared with UPDATE. A row insert is compiled once as a
//! subroutine; VALUES rows, SELECT sources and COPY lines all Gosub into
//! it with the provided values on the stack.

use itertools::Itertools;
use smol_str::SmolStr;

use crate::ast::{ConflictAction, InsertSource, QualName, TriggerEvent, TriggerTiming};
use crate::auth::{AuthAction, AuthResult};
use crate::errors::{Error, ErrorCode, Result};
use crate::schema::{Index, Table};
use crate::vdbe::key::KeyLayout;
use crate::vdbe::{
    HALT_ABORT, HALT_FAIL, HALT_ROLLBACK, Opcode, Operand, WRITE_COUNT_CHANGE, WRITE_SET_ROWID,
};

use super::select::Dest;
use super::{Compiler, Scope, ScopeItem};

/// Write cursors over a table and its indices.
pub(crate) struct WriteCursors {
    pub table_cur: i32,
    pub indices: Vec<(i32, Index)>,
}

pub(crate) fn open_write_cursors(
    c: &mut Compiler<'_>,
    db: usize,
    table: &Table,
) -> Result<WriteCursors> {
    let table_cur = c.alloc_cursor();
    c.b.emit(Opcode::Integer, db as i32, 0);
    c.b.emit3(
        Opcode::OpenWrite,
        table_cur,
        table.root,
        Operand::Text(table.name.to_string()),
    );
    let mut indices = Vec::new();
    for idx_name in &table.indices {
        let index = c
            .conn
            .catalog
            .db(db)?
            .schema
            .index(idx_name)
            .ok_or_else(|| Error::internal(format!("missing index {idx_name}")))?
            .clone();
        let cur = c.alloc_cursor();
        c.b.emit(Opcode::Integer, db as i32, 0);
        c.b.emit3(
            Opcode::OpenWrite,
            cur,
            index.root,
            Operand::Text(index.name.to_string()),
        );
        indices.push((cur, index));
    }
    Ok(WriteCursors { table_cur, indices })
}

pub(crate) fn close_write_cursors(c: &mut Compiler<'_>, cursors: &WriteCursors) {
    c.b.emit(Opcode::Close, cursors.table_cur, 0);
    for (cur, _) in &cursors.indices {
        c.b.emit(Opcode::Close, *cur, 0);
    }
}

/// Everything the constraint/completion blocks need to know about the row
/// being written. Column values live in the cell window `cells..cells+n`,
/// with the new row id one past the columns.
pub(crate) struct ConstraintCtx {
    pub db: usize,
    pub table: Table,
    pub cells: i32,
    pub stmt_conflict: Option<ConflictAction>,
    /// Row-skip target for the IGNORE policy and RAISE(IGNORE).
    pub ignore_dest: i32,
    /// UPDATE keeps the prior row id at the bottom of the block's stack.
    pub has_old_rowid: bool,
    /// Whether the row id can collide with an existing row (always for
    /// INSERT; for UPDATE only when the statement changes it).
    pub check_rowid: bool,
}

impl ConstraintCtx {
    pub fn rowid_cell(&self) -> i32 {
        self.cells + self.table.columns.len() as i32
    }

    fn cells_scope(&self) -> Scope<'_> {
        Scope {
            items: vec![ScopeItem {
                alias: self.table.name.clone(),
                db: Some(self.db),
                table: Some(self.table.name.clone()),
                cursor: -1,
                columns: self.table.columns.iter().map(|c| c.name.clone()).collect(),
                ipk: self.table.ipk_column,
                cells: Some(self.cells),
            }],
            parent: None,
        }
    }
}

fn halt_constraint(c: &mut Compiler<'_>, policy: ConflictAction, message: String) {
    let action = match policy {
        ConflictAction::Rollback => HALT_ROLLBACK,
        ConflictAction::Fail => HALT_FAIL,
        _ => HALT_ABORT,
    };
    c.b.emit3(
        Opcode::Halt,
        ErrorCode::Constraint as i32,
        action,
        Operand::Text(message),
    );
}

/// NOT NULL and CHECK run against the cell window before the contract
/// stack is built; nothing is on the stack at their conflict sites.
fn code_cell_phase_checks(c: &mut Compiler<'_>, ctx: &ConstraintCtx) -> Result<()> {
    for (i, col) in ctx.table.columns.iter().enumerate() {
        if !col.not_null || ctx.table.ipk_column == Some(i) {
            continue;
        }
        let policy = c.conflict_policy(ctx.stmt_conflict, col.not_null_conflict);
        let ok = c.b.new_label();
        let done = c.b.new_label();
        c.b.emit(Opcode::MemLoad, ctx.cells + i as i32, 0);
        c.b.emit(Opcode::NotNull, 0, ok);
        c.b.emit(Opcode::Pop, 1, 0);
        match policy {
            ConflictAction::Ignore => {
                c.b.emit(Opcode::Goto, 0, ctx.ignore_dest);
            }
            ConflictAction::Replace => match &col.default {
                Some(default) => {
                    let scope = Scope::default();
                    c.code_expr(&scope, default)?;
                    c.b.emit(Opcode::MemStore, ctx.cells + i as i32, 1);
                }
                None => halt_constraint(
                    c,
                    ConflictAction::Abort,
                    format!("{}.{} may not be NULL", ctx.table.name, col.name),
                ),
            },
            policy => halt_constraint(
                c,
                policy,
                format!("{}.{} may not be NULL", ctx.table.name, col.name),
            ),
        }
        c.b.emit(Opcode::Goto, 0, done);
        c.b.resolve_label(ok);
        c.b.emit(Opcode::Pop, 1, 0);
        c.b.resolve_label(done);
    }

    for (check, declared) in ctx.table.checks.clone() {
        let policy = c.conflict_policy(ctx.stmt_conflict, Some(declared));
        let scope = ctx.cells_scope();
        c.code_expr(&scope, &check)?;
        let pass_null = c.b.new_label();
        let pass = c.b.new_label();
        c.b.emit(Opcode::IsNull, 0, pass_null);
        c.b.emit(Opcode::If, 0, pass);
        match policy {
            ConflictAction::Ignore => {
                c.b.emit(Opcode::Goto, 0, ctx.ignore_dest);
            }
            policy => halt_constraint(
                c,
                policy,
                format!("CHECK constraint failed for table {}", ctx.table.name),
            ),
        }
        c.b.resolve_label(pass_null);
        c.b.emit(Opcode::Pop, 1, 0);
        c.b.resolve_label(pass);
    }
    Ok(())
}

/// Push the contract stack: `[old rowid?,] new rowid, column values`.
/// The integer-primary-key column is stored as NULL; reads of it resolve
/// to the row id instead.
fn push_row_stack(c: &mut Compiler<'_>, ctx: &ConstraintCtx, old_rowid_cell: Option<i32>) {
    if let Some(cell) = old_rowid_cell {
        c.b.emit(Opcode::MemLoad, cell, 0);
    }
    c.b.emit(Opcode::MemLoad, ctx.rowid_cell(), 0);
    for i in 0..ctx.table.columns.len() {
        if ctx.table.ipk_column == Some(i) {
            c.b.emit(Opcode::Null, 0, 0);
        } else {
            c.b.emit(Opcode::MemLoad, ctx.cells + i as i32, 0);
        }
    }
}

/// Delete the row the given table cursor is positioned on, together with
/// its index entries.
pub(crate) fn code_positioned_row_delete(
    c: &mut Compiler<'_>,
    cursors: &WriteCursors,
    count_change: bool,
) {
    for (idx_cur, index) in cursors.indices.clone() {
        c.b.emit(Opcode::Recno, cursors.table_cur, 0);
        for &col in &index.columns {
            c.b.emit(Opcode::Column, cursors.table_cur, col as i32);
        }
        c.b.emit3(
            Opcode::MakeIdxKey,
            index.columns.len() as i32,
            0,
            Operand::Layout(KeyLayout::ascending(index.columns.len())),
        );
        c.b.emit(Opcode::IdxDelete, idx_cur, 0);
    }
    let flags = if count_change { WRITE_COUNT_CHANGE } else { 0 };
    c.b.emit(Opcode::Delete, cursors.table_cur, flags);
}

/// The uniqueness phase: row-id collision, then each index. On success
/// the stack gains one key per index, kept for the completion block.
fn code_unique_phase(
    c: &mut Compiler<'_>,
    ctx: &ConstraintCtx,
    cursors: &WriteCursors,
) -> Result<()> {
    let ncols = ctx.table.columns.len();
    let below = usize::from(ctx.has_old_rowid);

    if ctx.check_rowid {
        let policy = c.conflict_policy(ctx.stmt_conflict, None);
        let ok = c.b.new_label();
        c.b.emit(Opcode::Dup, ncols as i32, 0);
        c.b.emit(Opcode::NotExists, cursors.table_cur, ok);
        match policy {
            ConflictAction::Ignore => {
                c.b.emit(Opcode::Pop, (ncols + 1 + below) as i32, 0);
                c.b.emit(Opcode::Goto, 0, ctx.ignore_dest);
            }
            ConflictAction::Replace => {
                code_positioned_row_delete(c, cursors, false);
            }
            policy => halt_constraint(
                c,
                policy,
                format!("PRIMARY KEY must be unique in table {}", ctx.table.name),
            ),
        }
        c.b.resolve_label(ok);
    }

    for (k, (idx_cur, index)) in cursors.indices.iter().enumerate() {
        let idx_cur = *idx_cur;
        let index = index.clone();
        // Key = column values + new row id; the row id sits at depth
        // ncols + k now that k keys are already stacked.
        let retry_addr = c.b.current_addr();
        c.b.emit(Opcode::Dup, (ncols + k) as i32, 0);
        for &col in &index.columns {
            if ctx.table.ipk_column == Some(col) {
                c.b.emit(Opcode::MemLoad, ctx.rowid_cell(), 0);
            } else {
                c.b.emit(Opcode::MemLoad, ctx.cells + col as i32, 0);
            }
        }
        c.b.emit3(
            Opcode::MakeIdxKey,
            index.columns.len() as i32,
            0,
            Operand::Layout(KeyLayout::ascending(index.columns.len())),
        );
        let Some(declared) = index.on_conflict else {
            continue;
        };
        let policy = c.conflict_policy(ctx.stmt_conflict, Some(declared));
        let ok = c.b.new_label();
        c.b.emit(Opcode::Dup, 0, 0);
        c.b.emit(Opcode::IsUnique, idx_cur, ok);
        // Conflict: the offending row id is on top of the key.
        match policy {
            ConflictAction::Ignore => {
                c.b.emit(Opcode::Pop, (ncols + 1 + below + k + 2) as i32, 0);
                c.b.emit(Opcode::Goto, 0, ctx.ignore_dest);
            }
            ConflictAction::Replace => {
                let miss = c.b.new_label();
                c.b.emit(Opcode::MoveTo, cursors.table_cur, miss);
                code_positioned_row_delete(c, cursors, false);
                c.b.resolve_label(miss);
                // Drop the tentative key and retry this index.
                c.b.emit(Opcode::Pop, 1, 0);
                c.b.emit(Opcode::Goto, 0, retry_addr as i32);
            }
            policy => {
                let columns = index
                    .columns
                    .iter()
                    .map(|&i| ctx.table.columns[i].name.as_str())
                    .join(", ");
                halt_constraint(
                    c,
                    policy,
                    format!(
                        "UNIQUE constraint failed: {}({columns})",
                        ctx.table.name
                    ),
                );
            }
        }
        c.b.resolve_label(ok);
    }
    Ok(())
}

/// The full constraint block per the interpreter contract: cell-phase
/// checks, then the stack is built and the uniqueness phase leaves one
/// index key per index above the column values.
pub(crate) fn code_constraint_block(
    c: &mut Compiler<'_>,
    ctx: &ConstraintCtx,
    cursors: &WriteCursors,
    old_rowid_cell: Option<i32>,
) -> Result<()> {
    code_cell_phase_checks(c, ctx)?;
    push_row_stack(c, ctx, old_rowid_cell);
    code_unique_phase(c, ctx, cursors)
}

/// Consume the constraint block's stack: index keys from the top, then
/// the packed record under the new row id.
pub(crate) fn code_completion(
    c: &mut Compiler<'_>,
    ctx: &ConstraintCtx,
    cursors: &WriteCursors,
    write_flags: i32,
) {
    for (idx_cur, _) in cursors.indices.iter().rev() {
        c.b.emit(Opcode::IdxPut, *idx_cur, 0);
    }
    let ncols = ctx.table.columns.len() as i32;
    c.b.emit(Opcode::MakeRecord, ncols, 0);
    c.b.emit(Opcode::PutIntKey, cursors.table_cur, write_flags);
}

fn provided_positions(table: &Table, columns: &[SmolStr]) -> Result<Vec<usize>> {
    if columns.is_empty() {
        return Ok((0..table.columns.len()).collect());
    }
    let mut positions = Vec::with_capacity(columns.len());
    for name in columns {
        let pos = table
            .column_index(name)
            .ok_or_else(|| Error::sql(format!("table {} has no column named {name}", table.name)))?;
        if positions.contains(&pos) {
            return Err(Error::sql(format!("column {name} used twice")));
        }
        positions.push(pos);
    }
    Ok(positions)
}

fn writable_table(c: &mut Compiler<'_>, table: &QualName) -> Result<(usize, Table)> {
    let (db, resolved) = c
        .conn
        .catalog
        .find_table(table.database.as_deref(), &table.name)?;
    let resolved = resolved.clone();
    if resolved.read_only && !resolved.is_view() {
        return Err(Error::sql(format!(
            "table {} may not be modified",
            resolved.name
        )));
    }
    Ok((db, resolved))
}

/// Does the SELECT read from the destination table?
fn select_reads_table(select: &crate::ast::Select, db_name: Option<&str>, table: &str) -> bool {
    let mut cur = Some(select);
    while let Some(s) = cur {
        for item in &s.from {
            if item.table.eq_ignore_ascii_case(table) {
                return true;
            }
            if let Some(sub) = &item.subquery {
                if select_reads_table(sub, db_name, table) {
                    return true;
                }
            }
        }
        cur = s.compound.as_ref().map(|(_, prior)| prior.as_ref());
    }
    false
}

pub(crate) fn compile_insert(
    c: &mut Compiler<'_>,
    or_conflict: Option<ConflictAction>,
    table_name: &QualName,
    columns: &[SmolStr],
    source: &InsertSource,
) -> Result<()> {
    compile_insert_inner(c, or_conflict, table_name, columns, source, None)
}

pub(crate) fn compile_insert_inner(
    c: &mut Compiler<'_>,
    or_conflict: Option<ConflictAction>,
    table_name: &QualName,
    columns: &[SmolStr],
    source: &InsertSource,
    trigger_scope: Option<&Scope<'_>>,
) -> Result<()> {
    let (db, table) = writable_table(c, table_name)?;
    let verdict = c.authorize(
        AuthAction::Insert,
        Some(table.name.as_str()),
        None,
        Some(db),
    )?;
    if verdict == AuthResult::Ignore {
        return Ok(());
    }
    c.use_schema(db);

    let positions = provided_positions(&table, columns)?;
    let nprov = positions.len();

    if table.is_view() {
        return compile_view_write(
            c,
            db,
            &table,
            &positions,
            source,
            or_conflict,
            trigger_scope,
        );
    }
    c.begin_write(db);

    let cursors = open_write_cursors(c, db, &table)?;
    let ncols = table.columns.len();
    let cells = c.alloc_mems(ncols + 1);

    // The per-row subroutine: provided values arrive on the stack.
    let over = c.b.new_label();
    c.b.emit(Opcode::Goto, 0, over);
    let sub_entry = c.b.current_addr() as i32;
    let ignore_dest = c.b.new_label();
    {
        // Spill provided values (top of stack = last provided column).
        for &pos in positions.iter().rev() {
            c.b.emit(Opcode::MemStore, cells + pos as i32, 1);
        }
        // Defaults for everything not provided.
        for (i, col) in table.columns.iter().enumerate() {
            if positions.contains(&i) {
                continue;
            }
            match &col.default {
                Some(default) => {
                    let default = default.clone();
                    let scope = Scope::default();
                    c.code_expr(&scope, &default)?;
                }
                None => {
                    c.b.emit(Opcode::Null, 0, 0);
                }
            }
            c.b.emit(Opcode::MemStore, cells + i as i32, 1);
        }

        let ctx = ConstraintCtx {
            db,
            table: table.clone(),
            cells,
            stmt_conflict: or_conflict,
            ignore_dest,
            has_old_rowid: false,
            check_rowid: true,
        };

        // Row id: a provided non-NULL integer primary key, else a fresh
        // one; the sentinel NULL stays in the column cell.
        match table.ipk_column {
            Some(ipk) => {
                let have = c.b.new_label();
                let store = c.b.new_label();
                c.b.emit(Opcode::MemLoad, cells + ipk as i32, 0);
                c.b.emit(Opcode::NotNull, 0, have);
                c.b.emit(Opcode::Pop, 1, 0);
                c.b.emit(Opcode::NewRecno, cursors.table_cur, 0);
                c.b.emit(Opcode::Goto, 0, store);
                c.b.resolve_label(have);
                c.b.emit3(
                    Opcode::MustBeInt,
                    ErrorCode::Mismatch as i32,
                    0,
                    Operand::Static("datatype mismatch"),
                );
                c.b.resolve_label(store);
                c.b.emit(Opcode::MemStore, ctx.rowid_cell(), 1);
                c.b.emit(Opcode::Null, 0, 0);
                c.b.emit(Opcode::MemStore, cells + ipk as i32, 1);
            }
            None => {
                c.b.emit(Opcode::NewRecno, cursors.table_cur, 0);
                c.b.emit(Opcode::MemStore, ctx.rowid_cell(), 1);
            }
        }

        let new_cur = super::trigger::open_new_pseudo(c, &ctx)?;
        super::trigger::fire_row_triggers(
            c,
            db,
            &table,
            TriggerTiming::Before,
            &TriggerEvent::Insert,
            Some(new_cur),
            None,
            or_conflict,
        )?;

        code_constraint_block(c, &ctx, &cursors, None)?;
        code_completion(
            c,
            &ctx,
            &cursors,
            WRITE_SET_ROWID | WRITE_COUNT_CHANGE,
        );

        super::trigger::fire_row_triggers(
            c,
            db,
            &table,
            TriggerTiming::After,
            &TriggerEvent::Insert,
            Some(new_cur),
            None,
            or_conflict,
        )?;
        c.b.emit(Opcode::Close, new_cur, 0);
    }
    c.b.resolve_label(ignore_dest);
    c.b.emit(Opcode::Return, 0, 0);
    c.b.resolve_label(over);

    // Feed the subroutine.
    match source {
        InsertSource::Values(rows) => {
            let scope = Scope {
                items: Vec::new(),
                parent: trigger_scope,
            };
            for row in rows {
                if row.len() != nprov {
                    return Err(Error::sql(format!(
                        "{} values for {} columns",
                        row.len(),
                        nprov
                    )));
                }
                for expr in row {
                    c.code_expr(&scope, expr)?;
                }
                c.b.emit(Opcode::Gosub, 0, sub_entry);
            }
        }
        InsertSource::Select(select) => {
            let meta;
            if select_reads_table(select, None, &table.name) {
                // The source reads the destination: materialise first.
                let scratch = c.alloc_cursor();
                c.b.emit(Opcode::OpenTemp, scratch, 0);
                meta = super::select::compile_select(
                    c,
                    select,
                    Dest::Table(scratch),
                    trigger_scope,
                )?;
                let done = c.b.new_label();
                c.b.emit(Opcode::Rewind, scratch, done);
                let top = c.b.current_addr() as i32;
                for i in 0..meta.ncols {
                    c.b.emit(Opcode::Column, scratch, i as i32);
                }
                c.b.emit(Opcode::Gosub, 0, sub_entry);
                c.b.emit(Opcode::Next, scratch, top);
                c.b.resolve_label(done);
                c.b.emit(Opcode::Close, scratch, 0);
            } else {
                meta = super::select::compile_select(
                    c,
                    select,
                    Dest::Gosub(sub_entry),
                    trigger_scope,
                )?;
            }
            if meta.ncols != nprov {
                return Err(Error::sql(format!(
                    "{} values for {} columns",
                    meta.ncols, nprov
                )));
            }
        }
    }
    close_write_cursors(c, &cursors);
    Ok(())
}

/// Writes against a view run entirely through its BEFORE (once INSTEAD OF)
/// triggers; there is no storage row to touch.
fn compile_view_write(
    c: &mut Compiler<'_>,
    db: usize,
    table: &Table,
    positions: &[usize],
    source: &InsertSource,
    or_conflict: Option<ConflictAction>,
    trigger_scope: Option<&Scope<'_>>,
) -> Result<()> {
    if !super::trigger::has_row_triggers(c, db, table, &TriggerEvent::Insert) {
        return Err(Error::sql(format!(
            "cannot modify view {}: no INSTEAD OF trigger",
            table.name
        )));
    }
    let ncols = table.columns.len();
    let cells = c.alloc_mems(ncols + 1);

    let over = c.b.new_label();
    c.b.emit(Opcode::Goto, 0, over);
    let sub_entry = c.b.current_addr() as i32;
    let ignore_dest = c.b.new_label();
    {
        for &pos in positions.iter().rev() {
            c.b.emit(Opcode::MemStore, cells + pos as i32, 1);
        }
        for i in 0..ncols {
            if positions.contains(&i) {
                continue;
            }
            c.b.emit(Opcode::Null, 0, 0);
            c.b.emit(Opcode::MemStore, cells + i as i32, 1);
        }
        c.b.emit(Opcode::Null, 0, 0);
        c.b.emit(Opcode::MemStore, cells + ncols as i32, 1);

        let ctx = ConstraintCtx {
            db,
            table: table.clone(),
            cells,
            stmt_conflict: or_conflict,
            ignore_dest,
            has_old_rowid: false,
            check_rowid: false,
        };
        let new_cur = super::trigger::open_new_pseudo(c, &ctx)?;
        super::trigger::fire_row_triggers(
            c,
            db,
            table,
            TriggerTiming::Before,
            &TriggerEvent::Insert,
            Some(new_cur),
            None,
            or_conflict,
        )?;
        c.b.emit(Opcode::Close, new_cur, 0);
    }
    c.b.resolve_label(ignore_dest);
    c.b.emit(Opcode::Return, 0, 0);
    c.b.resolve_label(over);

    let nprov = positions.len();
    match source {
        InsertSource::Values(rows) => {
            let scope = Scope {
                items: Vec::new(),
                parent: trigger_scope,
            };
            for row in rows {
                if row.len() != nprov {
                    return Err(Error::sql(format!(
                        "{} values for {} columns",
                        row.len(),
                        nprov
                    )));
                }
                for expr in row {
                    c.code_expr(&scope, expr)?;
                }
                c.b.emit(Opcode::Gosub, 0, sub_entry);
            }
        }
        InsertSource::Select(select) => {
            let meta =
                super::select::compile_select(c, select, Dest::Gosub(sub_entry), trigger_scope)?;
            if meta.ncols != nprov {
                return Err(Error::sql(format!(
                    "{} values for {} columns",
                    meta.ncols, nprov
                )));
            }
        }
    }
    Ok(())
}

/// COPY: ingest a delimited text file through the normal insertion path,
/// one line per row. `\N` reads as NULL, matching the original loader.
pub(crate) fn compile_copy(
    c: &mut Compiler<'_>,
    or_conflict: Option<ConflictAction>,
    table_name: &QualName,
    file: &str,
    delimiter: Option<&str>,
) -> Result<()> {
    let (db, table) = {
        let (db, table) = writable_table(c, table_name)?;
        if table.is_view() {
            return Err(Error::sql(format!("cannot COPY into view {}", table.name)));
        }
        (db, table)
    };
    let verdict = c.authorize(
        AuthAction::Copy,
        Some(table.name.as_str()),
        Some(file),
        Some(db),
    )?;
    if verdict == AuthResult::Ignore {
        return Ok(());
    }
    c.begin_write(db);
    let ncols = table.columns.len();

    c.b.emit3(Opcode::FileOpen, 0, 0, Operand::Text(file.to_owned()));
    let cursors = open_write_cursors(c, db, &table)?;
    let cells = c.alloc_mems(ncols + 1);
    let done = c.b.new_label();
    let row_done = c.b.new_label();
    let top = c.b.current_addr() as i32;
    c.b.emit3(
        Opcode::FileRead,
        ncols as i32,
        done,
        Operand::Text(delimiter.unwrap_or("\t").to_owned()),
    );
    // Each line feeds the same constraint/insertion path as INSERT.
    {
        for i in 0..ncols {
            c.b.emit(Opcode::FileColumn, i as i32, 0);
        }
        for pos in (0..ncols).rev() {
            c.b.emit(Opcode::MemStore, cells + pos as i32, 1);
        }
        let ctx = ConstraintCtx {
            db,
            table: table.clone(),
            cells,
            stmt_conflict: or_conflict,
            ignore_dest: row_done,
            has_old_rowid: false,
            check_rowid: true,
        };
        match table.ipk_column {
            Some(ipk) => {
                let have = c.b.new_label();
                let store = c.b.new_label();
                c.b.emit(Opcode::MemLoad, cells + ipk as i32, 0);
                c.b.emit(Opcode::NotNull, 0, have);
                c.b.emit(Opcode::Pop, 1, 0);
                c.b.emit(Opcode::NewRecno, cursors.table_cur, 0);
                c.b.emit(Opcode::Goto, 0, store);
                c.b.resolve_label(have);
                c.b.emit3(
                    Opcode::MustBeInt,
                    ErrorCode::Mismatch as i32,
                    0,
                    Operand::Static("datatype mismatch"),
                );
                c.b.resolve_label(store);
                c.b.emit(Opcode::MemStore, ctx.rowid_cell(), 1);
                c.b.emit(Opcode::Null, 0, 0);
                c.b.emit(Opcode::MemStore, cells + ipk as i32, 1);
            }
            None => {
                c.b.emit(Opcode::NewRecno, cursors.table_cur, 0);
                c.b.emit(Opcode::MemStore, ctx.rowid_cell(), 1);
            }
        }
        let new_cur = super::trigger::open_new_pseudo(c, &ctx)?;
        super::trigger::fire_row_triggers(
            c,
            db,
            &table,
            TriggerTiming::Before,
            &TriggerEvent::Insert,
            Some(new_cur),
            None,
            or_conflict,
        )?;
        code_constraint_block(c, &ctx, &cursors, None)?;
        code_completion(c, &ctx, &cursors, WRITE_SET_ROWID | WRITE_COUNT_CHANGE);
        super::trigger::fire_row_triggers(
            c,
            db,
            &table,
            TriggerTiming::After,
            &TriggerEvent::Insert,
            Some(new_cur),
            None,
            or_conflict,
        )?;
        c.b.emit(Opcode::Close, new_cur, 0);
    }
    c.b.resolve_label(row_done);
    c.b.emit(Opcode::Goto, 0, top);
    c.b.resolve_label(done);
    close_write_cursors(c, &cursors);
    Ok(())
}
