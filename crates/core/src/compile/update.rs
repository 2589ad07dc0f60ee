//! UPDATE lowering: a read-only scan collects the qualifying row ids into
//! the row-id queue, then a write pass replays the queue, rebuilding each
//! row through the shared constraint and completion blocks.

use smol_str::SmolStr;

use crate::ast::{ConflictAction, Expr, QualName, TriggerEvent, TriggerTiming};
use crate::auth::{AuthAction, AuthResult};
use crate::errors::{Error, ErrorCode, Result};
use crate::vdbe::{Opcode, Operand, WRITE_COUNT_CHANGE};

use super::insert::{
    ConstraintCtx, close_write_cursors, code_completion, code_constraint_block,
    code_positioned_row_delete, open_write_cursors,
};
use super::{Compiler, Scope, scope_item_for_table};

pub(crate) fn compile_update(
    c: &mut Compiler<'_>,
    or_conflict: Option<ConflictAction>,
    table: &QualName,
    sets: &[(SmolStr, Expr)],
    where_clause: Option<&Expr>,
) -> Result<()> {
    compile_update_inner(c, or_conflict, table, sets, where_clause, None)
}

pub(crate) fn compile_update_inner(
    c: &mut Compiler<'_>,
    or_conflict: Option<ConflictAction>,
    table_name: &QualName,
    sets: &[(SmolStr, Expr)],
    where_clause: Option<&Expr>,
    trigger_scope: Option<&Scope<'_>>,
) -> Result<()> {
    let (db, table) = c
        .conn
        .catalog
        .find_table(table_name.database.as_deref(), &table_name.name)?;
    let table = table.clone();

    // The authorizer sees one Update per assigned column; IGNORE drops
    // the assignment.
    let mut live_sets: Vec<(usize, Expr)> = Vec::new();
    for (name, expr) in sets {
        let pos = table
            .column_index(name)
            .ok_or_else(|| Error::sql(format!("no such column: {name}")))?;
        let verdict = c.authorize(
            AuthAction::Update,
            Some(table.name.as_str()),
            Some(name),
            Some(db),
        )?;
        if verdict != AuthResult::Ignore {
            live_sets.push((pos, expr.clone()));
        }
    }

    if table.is_view() {
        return compile_view_update(c, db, &table, &live_sets, where_clause, or_conflict);
    }
    if table.read_only {
        return Err(Error::sql(format!(
            "table {} may not be modified",
            table.name
        )));
    }
    c.use_schema(db);
    c.begin_write(db);

    let changed: Vec<SmolStr> = live_sets
        .iter()
        .map(|(pos, _)| table.columns[*pos].name.clone())
        .collect();
    let rowid_changed = live_sets
        .iter()
        .any(|(pos, _)| table.ipk_column == Some(*pos));

    // Pass one: collect row ids.
    c.push_list();
    {
        let cursor = c.alloc_cursor();
        let scope = Scope {
            items: vec![scope_item_for_table(&table, None, cursor)],
            parent: trigger_scope,
        };
        let ctx = c.where_begin(&scope, &[Default::default()], where_clause, None)?;
        c.b.emit(Opcode::Recno, cursor, 0);
        c.b.emit(Opcode::ListWrite, 0, 0);
        c.where_end(ctx);
        c.b.emit(Opcode::Close, cursor, 0);
    }

    // Pass two: replay under write cursors.
    let cursors = open_write_cursors(c, db, &table)?;
    let ncols = table.columns.len();
    let cells = c.alloc_mems(ncols + 1);
    let old_cell = c.alloc_mem();

    c.b.emit(Opcode::ListRewind, 0, 0);
    let done = c.b.new_label();
    let cont = c.b.new_label();
    let top = c.b.current_addr() as i32;
    c.b.emit(Opcode::ListRead, 0, done);
    c.b.emit(Opcode::MemStore, old_cell, 1);
    c.b.emit(Opcode::MemLoad, old_cell, 0);
    c.b.emit(Opcode::NotExists, cursors.table_cur, cont);

    // Fill the cell window: assigned columns evaluate in the row's scope,
    // the rest copy through from the stored row.
    let row_scope = Scope {
        items: vec![scope_item_for_table(&table, None, cursors.table_cur)],
        parent: trigger_scope,
    };
    for i in 0..ncols {
        match live_sets.iter().find(|(pos, _)| *pos == i) {
            Some((_, expr)) => {
                let expr = expr.clone();
                c.code_expr(&row_scope, &expr)?;
            }
            None => {
                if table.ipk_column == Some(i) {
                    c.b.emit(Opcode::Recno, cursors.table_cur, 0);
                } else {
                    c.b.emit(Opcode::Column, cursors.table_cur, i as i32);
                }
            }
        }
        c.b.emit(Opcode::MemStore, cells + i as i32, 1);
    }

    // When the row id changes, the old row must leave the indices before
    // the uniqueness checks or the new row would collide with its own
    // prior version. The IGNORE policy then restores it from the OLD
    // pseudo row instead of skipping straight out.
    let pre_delete = rowid_changed;
    let ignore_repair = c.b.new_label();
    let ctx = ConstraintCtx {
        db,
        table: table.clone(),
        cells,
        stmt_conflict: or_conflict,
        ignore_dest: if pre_delete { ignore_repair } else { cont },
        has_old_rowid: true,
        check_rowid: rowid_changed,
    };

    // The new row id: the assigned integer-primary-key value, else the
    // old one; the sentinel NULL goes back into the column cell.
    match table.ipk_column {
        Some(ipk) => {
            c.b.emit(Opcode::MemLoad, cells + ipk as i32, 0);
            c.b.emit3(
                Opcode::MustBeInt,
                ErrorCode::Mismatch as i32,
                0,
                Operand::Static("datatype mismatch"),
            );
            c.b.emit(Opcode::MemStore, ctx.rowid_cell(), 1);
            c.b.emit(Opcode::Null, 0, 0);
            c.b.emit(Opcode::MemStore, cells + ipk as i32, 1);
        }
        None => {
            c.b.emit(Opcode::MemLoad, old_cell, 0);
            c.b.emit(Opcode::MemStore, ctx.rowid_cell(), 1);
        }
    }

    let old_cur = super::trigger::open_old_pseudo(c, &table, cursors.table_cur)?;
    let new_cur = super::trigger::open_new_pseudo(c, &ctx)?;
    super::trigger::fire_row_triggers(
        c,
        db,
        &table,
        TriggerTiming::Before,
        &TriggerEvent::Update(changed.clone()),
        Some(new_cur),
        Some(old_cur),
        or_conflict,
    )?;
    // A BEFORE trigger may have deleted the row.
    c.b.emit(Opcode::MemLoad, old_cell, 0);
    c.b.emit(Opcode::NotExists, cursors.table_cur, cont);

    if pre_delete {
        code_positioned_row_delete(c, &cursors, false);
        code_constraint_block(c, &ctx, &cursors, Some(old_cell))?;
    } else {
        code_constraint_block(c, &ctx, &cursors, Some(old_cell))?;
        // A REPLACE during the checks may have moved the cursor.
        let gone = c.b.new_label();
        c.b.emit(Opcode::MemLoad, old_cell, 0);
        c.b.emit(Opcode::NotExists, cursors.table_cur, gone);
        code_positioned_row_delete(c, &cursors, false);
        c.b.resolve_label(gone);
    }
    code_completion(c, &ctx, &cursors, WRITE_COUNT_CHANGE);
    // The prior row id is still at the bottom of the contract stack.
    c.b.emit(Opcode::Pop, 1, 0);

    super::trigger::fire_row_triggers(
        c,
        db,
        &table,
        TriggerTiming::After,
        &TriggerEvent::Update(changed),
        Some(new_cur),
        Some(old_cur),
        or_conflict,
    )?;
    c.b.emit(Opcode::Close, old_cur, 0);
    c.b.emit(Opcode::Close, new_cur, 0);

    if pre_delete {
        // IGNORE lands here after the old row was already removed: put it
        // back from the OLD pseudo row, then continue with the next one.
        c.b.emit(Opcode::Goto, 0, cont);
        c.b.resolve_label(ignore_repair);
        for (idx_cur, index) in cursors.indices.clone() {
            c.b.emit(Opcode::Recno, old_cur, 0);
            for &col in &index.columns {
                c.b.emit(Opcode::Column, old_cur, col as i32);
            }
            c.b.emit3(
                Opcode::MakeIdxKey,
                index.columns.len() as i32,
                0,
                Operand::Layout(crate::vdbe::key::KeyLayout::ascending(
                    index.columns.len(),
                )),
            );
            c.b.emit(Opcode::IdxPut, idx_cur, 0);
        }
        c.b.emit(Opcode::Recno, old_cur, 0);
        for i in 0..ncols {
            if table.ipk_column == Some(i) {
                c.b.emit(Opcode::Null, 0, 0);
            } else {
                c.b.emit(Opcode::Column, old_cur, i as i32);
            }
        }
        c.b.emit(Opcode::MakeRecord, ncols as i32, 0);
        c.b.emit(Opcode::PutIntKey, cursors.table_cur, 0);
        c.b.emit(Opcode::Close, old_cur, 0);
        c.b.emit(Opcode::Close, new_cur, 0);
    }

    c.b.resolve_label(cont);
    c.b.emit(Opcode::Goto, 0, top);
    c.b.resolve_label(done);
    close_write_cursors(c, &cursors);
    c.pop_list();
    Ok(())
}

/// UPDATE on a view: scan the materialised view, expose each row as OLD,
/// the assigned row as NEW, and let the BEFORE triggers do the writing.
fn compile_view_update(
    c: &mut Compiler<'_>,
    db: usize,
    table: &crate::schema::Table,
    live_sets: &[(usize, Expr)],
    where_clause: Option<&Expr>,
    or_conflict: Option<ConflictAction>,
) -> Result<()> {
    let changed: Vec<SmolStr> = live_sets
        .iter()
        .map(|(pos, _)| table.columns[*pos].name.clone())
        .collect();
    if !super::trigger::has_row_triggers(c, db, table, &TriggerEvent::Update(changed.clone())) {
        return Err(Error::sql(format!(
            "cannot modify view {}: no INSTEAD OF trigger",
            table.name
        )));
    }
    let view_select = table.view_select.as_ref().expect("view").as_ref().clone();
    let mat = c.alloc_cursor();
    c.b.emit(Opcode::OpenTemp, mat, 0);
    super::select::compile_select(c, &view_select, super::select::Dest::Table(mat), None)?;

    let ncols = table.columns.len();
    let cells = c.alloc_mems(ncols + 1);
    let done = c.b.new_label();
    let cont = c.b.new_label();
    c.b.emit(Opcode::Rewind, mat, done);
    let top = c.b.current_addr() as i32;

    let scope = Scope {
        items: vec![super::ScopeItem {
            alias: table.name.clone(),
            db: None,
            table: None,
            cursor: mat,
            columns: table.columns.iter().map(|col| col.name.clone()).collect(),
            ipk: None,
            cells: None,
        }],
        parent: None,
    };
    if let Some(where_clause) = where_clause {
        c.code_expr(&scope, where_clause)?;
        c.b.emit(Opcode::IfNot, 0, cont);
    }
    for i in 0..ncols {
        match live_sets.iter().find(|(pos, _)| *pos == i) {
            Some((_, expr)) => {
                let expr = expr.clone();
                c.code_expr(&scope, &expr)?;
            }
            None => {
                c.b.emit(Opcode::Column, mat, i as i32);
            }
        }
        c.b.emit(Opcode::MemStore, cells + i as i32, 1);
    }
    c.b.emit(Opcode::Null, 0, 0);
    c.b.emit(Opcode::MemStore, cells + ncols as i32, 1);

    let ctx = ConstraintCtx {
        db,
        table: table.clone(),
        cells,
        stmt_conflict: or_conflict,
        ignore_dest: cont,
        has_old_rowid: false,
        check_rowid: false,
    };
    let old_cur = super::trigger::open_old_pseudo(c, table, mat)?;
    let new_cur = super::trigger::open_new_pseudo(c, &ctx)?;
    super::trigger::fire_row_triggers(
        c,
        db,
        table,
        TriggerTiming::Before,
        &TriggerEvent::Update(changed),
        Some(new_cur),
        Some(old_cur),
        or_conflict,
    )?;
    c.b.emit(Opcode::Close, old_cur, 0);
    c.b.emit(Opcode::Close, new_cur, 0);

    c.b.resolve_label(cont);
    c.b.emit(Opcode::Next, mat, top);
    c.b.resolve_label(done);
    c.b.emit(Opcode::Close, mat, 0);
    Ok(())
}
