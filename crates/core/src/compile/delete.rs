//! DELETE lowering. Without a WHERE clause (and with no triggers to run)
//! the table and its indices are truncated in one opcode each; otherwise
//! the qualifying row ids are queued and replayed under write cursors.

use crate::ast::{Expr, QualName, TriggerEvent, TriggerTiming};
use crate::auth::{AuthAction, AuthResult};
use crate::errors::{Error, Result};
use crate::vdbe::key::KeyLayout;
use crate::vdbe::{Opcode, Operand, WRITE_COUNT_CHANGE};

use super::insert::{close_write_cursors, open_write_cursors};
use super::{Compiler, Scope, scope_item_for_table};

pub(crate) fn compile_delete(
    c: &mut Compiler<'_>,
    table: &QualName,
    where_clause: Option<&Expr>,
) -> Result<()> {
    compile_delete_inner(c, table, where_clause, None)
}

pub(crate) fn compile_delete_inner(
    c: &mut Compiler<'_>,
    table_name: &QualName,
    where_clause: Option<&Expr>,
    trigger_scope: Option<&Scope<'_>>,
) -> Result<()> {
    let (db, table) = c
        .conn
        .catalog
        .find_table(table_name.database.as_deref(), &table_name.name)?;
    let table = table.clone();
    let verdict = c.authorize(
        AuthAction::Delete,
        Some(table.name.as_str()),
        None,
        Some(db),
    )?;
    if verdict == AuthResult::Ignore {
        return Ok(());
    }

    if table.is_view() {
        return compile_view_delete(c, db, &table, where_clause);
    }
    if table.read_only {
        return Err(Error::sql(format!(
            "table {} may not be modified",
            table.name
        )));
    }
    c.use_schema(db);
    c.begin_write(db);

    let has_triggers = super::trigger::has_row_triggers(c, db, &table, &TriggerEvent::Delete);

    // Whole-table delete with nothing to observe it: truncate. The
    // table's own Clear reports the removed rows into the change count.
    if where_clause.is_none() && !has_triggers {
        c.b.emit3(Opcode::Clear, table.root, db as i32, Operand::Static("count"));
        self_truncate_indices(c, db, &table)?;
        return Ok(());
    }

    // Pass one: queue the row ids.
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

    // Pass two: replay.
    let cursors = open_write_cursors(c, db, &table)?;
    c.b.emit(Opcode::ListRewind, 0, 0);
    let done = c.b.new_label();
    let cont = c.b.new_label();
    let top = c.b.current_addr() as i32;
    c.b.emit(Opcode::ListRead, 0, done);
    c.b.emit(Opcode::NotExists, cursors.table_cur, cont);

    let old_cur = if has_triggers {
        let old_cur = super::trigger::open_old_pseudo(c, &table, cursors.table_cur)?;
        super::trigger::fire_row_triggers(
            c,
            db,
            &table,
            TriggerTiming::Before,
            &TriggerEvent::Delete,
            None,
            Some(old_cur),
            None,
        )?;
        // The trigger may have removed the row itself.
        c.b.emit(Opcode::Recno, old_cur, 0);
        c.b.emit(Opcode::NotExists, cursors.table_cur, cont);
        Some(old_cur)
    } else {
        None
    };

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
    c.b.emit(Opcode::Delete, cursors.table_cur, WRITE_COUNT_CHANGE);

    if let Some(old_cur) = old_cur {
        super::trigger::fire_row_triggers(
            c,
            db,
            &table,
            TriggerTiming::After,
            &TriggerEvent::Delete,
            None,
            Some(old_cur),
            None,
        )?;
        c.b.emit(Opcode::Close, old_cur, 0);
    }

    c.b.resolve_label(cont);
    c.b.emit(Opcode::Goto, 0, top);
    c.b.resolve_label(done);
    close_write_cursors(c, &cursors);
    c.pop_list();
    Ok(())
}

fn self_truncate_indices(
    c: &mut Compiler<'_>,
    db: usize,
    table: &crate::schema::Table,
) -> Result<()> {
    let roots: Vec<i32> = table
        .indices
        .iter()
        .filter_map(|name| {
            c.conn
                .catalog
                .db(db)
                .ok()
                .and_then(|d| d.schema.index(name))
                .map(|i| i.root)
        })
        .collect();
    for root in roots {
        c.b.emit(Opcode::Clear, root, db as i32);
    }
    Ok(())
}

/// DELETE on a view: each matching materialised row becomes OLD for the
/// BEFORE (INSTEAD OF) triggers.
fn compile_view_delete(
    c: &mut Compiler<'_>,
    db: usize,
    table: &crate::schema::Table,
    where_clause: Option<&Expr>,
) -> Result<()> {
    if !super::trigger::has_row_triggers(c, db, table, &TriggerEvent::Delete) {
        return Err(Error::sql(format!(
            "cannot modify view {}: no INSTEAD OF trigger",
            table.name
        )));
    }
    let view_select = table.view_select.as_ref().expect("view").as_ref().clone();
    let mat = c.alloc_cursor();
    c.b.emit(Opcode::OpenTemp, mat, 0);
    super::select::compile_select(c, &view_select, super::select::Dest::Table(mat), None)?;

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
    let old_cur = super::trigger::open_old_pseudo(c, table, mat)?;
    super::trigger::fire_row_triggers(
        c,
        db,
        table,
        TriggerTiming::Before,
        &TriggerEvent::Delete,
        None,
        Some(old_cur),
        None,
    )?;
    c.b.emit(Opcode::Close, old_cur, 0);

    c.b.resolve_label(cont);
    c.b.emit(Opcode::Next, mat, top);
    c.b.resolve_label(done);
    c.b.emit(Opcode::Close, mat, 0);
    Ok(())
}
