//! Row-trigger expansion. Triggers compile inline into the statement that
//! fires them; OLD and NEW rows travel through single-row pseudo cursors,
//! and the firing stack keeps any trigger from re-entering itself.

use smol_str::SmolStr;

use crate::ast::{ConflictAction, QualName, TriggerEvent, TriggerStep, TriggerTiming};
use crate::errors::Result;
use crate::schema::{TEMP_DB, Table, Trigger};
use crate::vdbe::Opcode;

use super::select::Dest;
use super::{Compiler, ConstraintCtx, Scope, ScopeItem};

/// Build the NEW pseudo row from the constraint cell window and leave it
/// in a fresh pseudo cursor. The integer primary key reads as the row id.
pub(crate) fn open_new_pseudo(c: &mut Compiler<'_>, ctx: &ConstraintCtx) -> Result<i32> {
    let cur = c.alloc_cursor();
    c.b.emit(Opcode::OpenPseudo, cur, 0);
    let ncols = ctx.table.columns.len();
    for i in 0..ncols {
        if ctx.table.ipk_column == Some(i) {
            c.b.emit(Opcode::MemLoad, ctx.rowid_cell(), 0);
        } else {
            c.b.emit(Opcode::MemLoad, ctx.cells + i as i32, 0);
        }
    }
    c.b.emit(Opcode::MakeRecord, ncols as i32, 0);
    c.b.emit(Opcode::MemLoad, ctx.rowid_cell(), 0);
    c.b.emit(Opcode::Pull, 1, 0);
    c.b.emit(Opcode::PutIntKey, cur, 0);
    Ok(cur)
}

/// Copy the row `src_cursor` is positioned on into a pseudo cursor, to
/// serve as the OLD row.
pub(crate) fn open_old_pseudo(
    c: &mut Compiler<'_>,
    table: &Table,
    src_cursor: i32,
) -> Result<i32> {
    let cur = c.alloc_cursor();
    c.b.emit(Opcode::OpenPseudo, cur, 0);
    let ncols = table.columns.len();
    for i in 0..ncols {
        if table.ipk_column == Some(i) {
            c.b.emit(Opcode::Recno, src_cursor, 0);
        } else {
            c.b.emit(Opcode::Column, src_cursor, i as i32);
        }
    }
    c.b.emit(Opcode::MakeRecord, ncols as i32, 0);
    c.b.emit(Opcode::Recno, src_cursor, 0);
    c.b.emit(Opcode::Pull, 1, 0);
    c.b.emit(Opcode::PutIntKey, cur, 0);
    Ok(cur)
}

fn collect_triggers(c: &Compiler<'_>, db: usize, table: &Table) -> Vec<Trigger> {
    let mut out: Vec<Trigger> = Vec::new();
    if let Ok(home) = c.conn.catalog.db(db) {
        for name in &table.triggers {
            if let Some(trigger) = home.schema.trigger(name) {
                out.push(trigger.clone());
            }
        }
    }
    // Temp triggers may target tables in other databases.
    if db != TEMP_DB {
        if let Ok(temp) = c.conn.catalog.db(TEMP_DB) {
            for trigger in temp.schema.triggers() {
                if trigger.table.eq_ignore_ascii_case(&table.name) {
                    out.push(trigger.clone());
                }
            }
        }
    }
    out
}

fn event_matches(trigger: &Trigger, event: &TriggerEvent) -> bool {
    match (&trigger.event, event) {
        (TriggerEvent::Insert, TriggerEvent::Insert) => true,
        (TriggerEvent::Delete, TriggerEvent::Delete) => true,
        (TriggerEvent::Update(of), TriggerEvent::Update(changed)) => {
            of.is_empty()
                || changed.is_empty()
                || of.iter()
                    .any(|col| changed.iter().any(|ch| ch.eq_ignore_ascii_case(col)))
        }
        _ => false,
    }
}

pub(crate) fn has_row_triggers(
    c: &Compiler<'_>,
    db: usize,
    table: &Table,
    event: &TriggerEvent,
) -> bool {
    collect_triggers(c, db, table)
        .iter()
        .any(|t| event_matches(t, event))
}

/// Expand every applicable trigger for `(timing, event)` at the current
/// program point. `new_cur`/`old_cur` hold the pseudo rows the bodies
/// see as NEW and OLD.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fire_row_triggers(
    c: &mut Compiler<'_>,
    db: usize,
    table: &Table,
    timing: TriggerTiming,
    event: &TriggerEvent,
    new_cur: Option<i32>,
    old_cur: Option<i32>,
    on_conflict: Option<ConflictAction>,
) -> Result<()> {
    let triggers: Vec<Trigger> = collect_triggers(c, db, table)
        .into_iter()
        .filter(|t| t.timing == timing && event_matches(t, event))
        .collect();

    for trigger in triggers {
        let key = SmolStr::new(trigger.name.to_lowercase());
        // A trigger already on the firing chain does not re-enter.
        if c.trigger_stack.contains(&key) {
            log::debug!("trigger {} suppressed by recursion guard", trigger.name);
            continue;
        }
        c.trigger_stack.push(key);
        let skip = c.b.new_label();
        let saved_ignore = c.ignore_label;
        c.ignore_label = Some(skip);

        let mut items = Vec::new();
        if let Some(cur) = old_cur {
            items.push(ScopeItem {
                alias: SmolStr::new_static("old"),
                db: None,
                table: None,
                cursor: cur,
                columns: table.columns.iter().map(|col| col.name.clone()).collect(),
                ipk: None,
                cells: None,
            });
        }
        if let Some(cur) = new_cur {
            items.push(ScopeItem {
                alias: SmolStr::new_static("new"),
                db: None,
                table: None,
                cursor: cur,
                columns: table.columns.iter().map(|col| col.name.clone()).collect(),
                ipk: None,
                cells: None,
            });
        }
        let scope = Scope {
            items,
            parent: None,
        };

        if let Some(when) = &trigger.when {
            c.code_expr(&scope, when)?;
            c.b.emit(Opcode::IfNot, 0, skip);
        }

        for step in &trigger.steps {
            match step {
                TriggerStep::Select(select) => {
                    super::select::compile_select(c, select, Dest::Discard, Some(&scope))?;
                }
                TriggerStep::Insert {
                    or_conflict: step_conflict,
                    table: target,
                    columns,
                    source,
                } => {
                    super::insert::compile_insert_inner(
                        c,
                        step_conflict.or(on_conflict),
                        &QualName::bare(target.clone()),
                        columns,
                        source,
                        Some(&scope),
                    )?;
                }
                TriggerStep::Update {
                    or_conflict: step_conflict,
                    table: target,
                    sets,
                    where_clause,
                } => {
                    super::update::compile_update_inner(
                        c,
                        step_conflict.or(on_conflict),
                        &QualName::bare(target.clone()),
                        sets,
                        where_clause.as_ref(),
                        Some(&scope),
                    )?;
                }
                TriggerStep::Delete {
                    table: target,
                    where_clause,
                } => {
                    super::delete::compile_delete_inner(
                        c,
                        &QualName::bare(target.clone()),
                        where_clause.as_ref(),
                        Some(&scope),
                    )?;
                }
            }
        }

        c.b.resolve_label(skip);
        c.ignore_label = saved_ignore;
        c.trigger_stack.pop();
    }
    Ok(())
}
