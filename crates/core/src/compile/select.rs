//! SELECT lowering: scope construction (with view and subquery
//! materialisation), join-condition folding, the aggregate pass, compound
//! operators over keyed temp containers, DISTINCT via sets, sorting, and
//! LIMIT/OFFSET counters.

use smol_str::SmolStr;

use crate::ast::{
    BinaryOp, CompoundOp, Expr, JoinKind, ResultColumn, Select, SortItem, SortOrder,
};
use crate::auth::AuthAction;
use crate::errors::{Error, Result};
use crate::func::FuncDef;
use crate::resolve;
use crate::vdbe::key::KeyLayout;
use crate::vdbe::{Opcode, Operand};

use super::{Compiler, Scope, ScopeItem, scope_item_for_table};

/// Where the rows of a select go.
#[derive(Clone, Copy)]
pub(crate) enum Dest {
    /// Deliver to the caller.
    Callback,
    /// Insert the single result column into a set.
    Set(i32),
    /// Store the first row's single column in a memory cell, then stop.
    Mem(i32),
    /// Append to a row-id keyed container.
    Table(i32),
    /// Insert the packed record as a key (dedup).
    Union(i32),
    /// Delete the packed record key.
    Except(i32),
    /// Call a subroutine with the row's values left on the stack; the
    /// subroutine consumes them (INSERT ... SELECT).
    Gosub(i32),
    /// Evaluate and drop (trigger-body SELECTs).
    Discard,
}

pub(crate) struct SelectMeta {
    pub ncols: usize,
    pub names: Vec<String>,
    pub types: Vec<String>,
}

/// An output column after `*` expansion.
struct OutCol {
    expr: Expr,
    name: String,
    type_name: String,
}

/// One aggregate-pass slot: a plain field or an aggregate call.
enum AggSlot {
    Field(Expr),
    Call {
        def: std::sync::Arc<FuncDef>,
        args: Vec<Expr>,
    },
}

pub(crate) fn compile_select_toplevel(c: &mut Compiler<'_>, select: &Select) -> Result<()> {
    let meta = compile_select(c, select, Dest::Callback, None)?;
    c.b.ncols = meta.ncols;
    let mut names = meta.names.clone();
    if c.conn.flags.show_datatypes {
        names.extend(meta.types.iter().cloned());
    }
    for (i, name) in names.iter().enumerate() {
        c.b.emit3(
            Opcode::ColumnName,
            i as i32,
            0,
            Operand::Text(name.clone()),
        );
    }
    c.b.column_names = names;
    Ok(())
}

pub(crate) fn compile_select(
    c: &mut Compiler<'_>,
    select: &Select,
    dest: Dest,
    outer: Option<&Scope<'_>>,
) -> Result<SelectMeta> {
    if select.compound.is_some() {
        compile_compound(c, select, dest, outer)
    } else {
        compile_one_select(c, select, dest, outer)
    }
}

// ---- compound selects ------------------------------------------------

/// An arm stripped of the chain bookkeeping: the outermost node carries
/// the compound's ORDER BY and LIMIT, which must not apply per-arm.
fn bare_arm(arm: &Select) -> Select {
    let mut arm = arm.clone();
    arm.compound = None;
    arm.order_by = Vec::new();
    arm.limit = None;
    arm
}

fn flatten<'s>(select: &'s Select) -> Vec<(Option<CompoundOp>, &'s Select)> {
    let mut arms = Vec::new();
    let mut cur = select;
    loop {
        match &cur.compound {
            Some((op, prior)) => {
                arms.push((Some(*op), cur));
                cur = prior;
            }
            None => {
                arms.push((None, cur));
                break;
            }
        }
    }
    arms.reverse();
    arms
}

fn compile_compound(
    c: &mut Compiler<'_>,
    select: &Select,
    dest: Dest,
    outer: Option<&Scope<'_>>,
) -> Result<SelectMeta> {
    let arms = flatten(select);
    let order_by = &select.order_by;
    let limit = select.limit;

    // A pure UNION ALL chain with no ordering streams straight through.
    let all_union_all = arms
        .iter()
        .all(|(op, _)| matches!(op, None | Some(CompoundOp::UnionAll)));
    if all_union_all && order_by.is_empty() && limit.is_none() {
        let mut meta: Option<SelectMeta> = None;
        for (_, arm) in &arms {
            let m = compile_one_select(c, &bare_arm(arm), dest, outer)?;
            if let Some(meta) = &meta {
                if meta.ncols != m.ncols {
                    return Err(compound_mismatch());
                }
            } else {
                meta = Some(m);
            }
        }
        return Ok(meta.expect("at least one arm"));
    }

    // Everything up to the last set operator lands in a keyed container;
    // a trailing run of UNION ALL arms streams into the output phase. A
    // pure UNION ALL chain (here only because of ORDER BY/LIMIT) keeps
    // duplicates in a row-id keyed container instead.
    let last_set_op = if all_union_all {
        arms.len() - 1
    } else {
        arms.iter()
            .rposition(|(op, _)| {
                matches!(
                    op,
                    Some(CompoundOp::Union | CompoundOp::Intersect | CompoundOp::Except)
                )
            })
            .unwrap_or(0)
    };

    let mut mat = c.alloc_cursor();
    c.b.emit(Opcode::OpenTemp, mat, 0);
    if !all_union_all {
        c.b.emit(Opcode::KeyAsData, mat, 1);
    }

    let mut meta: Option<SelectMeta> = None;
    let mut check = |meta: &mut Option<SelectMeta>, m: SelectMeta| -> Result<SelectMeta> {
        if let Some(prev) = meta.as_ref() {
            if prev.ncols != m.ncols {
                return Err(compound_mismatch());
            }
        } else {
            *meta = Some(SelectMeta {
                ncols: m.ncols,
                names: m.names.clone(),
                types: m.types.clone(),
            });
        }
        Ok(m)
    };

    for (i, (op, arm)) in arms.iter().enumerate().take(last_set_op + 1) {
        match op {
            None | Some(CompoundOp::Union) | Some(CompoundOp::UnionAll) => {
                let arm_dest = if all_union_all {
                    Dest::Table(mat)
                } else {
                    Dest::Union(mat)
                };
                let m = compile_one_select(c, &bare_arm(arm), arm_dest, outer)?;
                check(&mut meta, m)?;
            }
            Some(CompoundOp::Except) => {
                let m = compile_one_select(c, &bare_arm(arm), Dest::Except(mat), outer)?;
                check(&mut meta, m)?;
            }
            Some(CompoundOp::Intersect) => {
                // Build the arm's own set, then keep only common records.
                let other = c.alloc_cursor();
                c.b.emit(Opcode::OpenTemp, other, 0);
                c.b.emit(Opcode::KeyAsData, other, 1);
                let m = compile_one_select(c, &bare_arm(arm), Dest::Union(other), outer)?;
                check(&mut meta, m)?;

                let kept = c.alloc_cursor();
                c.b.emit(Opcode::OpenTemp, kept, 0);
                c.b.emit(Opcode::KeyAsData, kept, 1);
                let done = c.b.new_label();
                let skip = c.b.new_label();
                c.b.emit(Opcode::Rewind, mat, done);
                let top = c.b.current_addr() as i32;
                c.b.emit(Opcode::FullKey, mat, 0);
                c.b.emit(Opcode::Dup, 0, 0);
                c.b.emit(Opcode::NotFound, other, skip);
                c.b.emit(Opcode::PutStrKey, kept, 0);
                let next = c.b.new_label();
                c.b.emit(Opcode::Goto, 0, next);
                c.b.resolve_label(skip);
                c.b.emit(Opcode::Pop, 1, 0);
                c.b.resolve_label(next);
                c.b.emit(Opcode::Next, mat, top);
                c.b.resolve_label(done);
                c.b.emit(Opcode::Close, mat, 0);
                c.b.emit(Opcode::Close, other, 0);
                mat = kept;
            }
        }
        let _ = i;
    }
    let meta = meta.expect("at least one arm");

    // Output phase: scan the container, then stream the UNION ALL tail.
    let ncols = meta.ncols;
    let mut sink = RowSink::new(c, dest, order_by, limit, false)?;
    if !order_by.is_empty() {
        sink.sort_positions = Some(compound_order_positions(&meta, order_by)?);
    }

    let done = c.b.new_label();
    c.b.emit(Opcode::Rewind, mat, done);
    let top = c.b.current_addr() as i32;
    let cont = c.b.new_label();
    {
        let push_row = |c: &mut Compiler<'_>| -> Result<()> {
            for i in 0..ncols {
                c.b.emit(Opcode::Column, mat, i as i32);
            }
            Ok(())
        };
        sink.emit_row(c, ncols, cont, done, push_row)?;
    }
    c.b.resolve_label(cont);
    c.b.emit(Opcode::Next, mat, top);
    c.b.resolve_label(done);
    c.b.emit(Opcode::Close, mat, 0);

    for (op, arm) in arms.iter().skip(last_set_op + 1) {
        debug_assert!(matches!(op, Some(CompoundOp::UnionAll)));
        if sink.sorter.is_some() {
            let m = compile_arm_into_sink(c, arm, &mut sink, outer)?;
            if m.ncols != ncols {
                return Err(compound_mismatch());
            }
        } else {
            let m = compile_one_select(c, &bare_arm(arm), dest, outer)?;
            if m.ncols != ncols {
                return Err(compound_mismatch());
            }
        }
    }

    sink.finish(c, ncols)?;
    Ok(meta)
}

fn compound_mismatch() -> Error {
    Error::sql(
        "SELECTs to the left and right of a compound operator do not have \
         the same number of result columns",
    )
}

/// ORDER BY terms of a compound resolve against output columns only:
/// 1-based positions or output column names.
fn compound_order_positions(meta: &SelectMeta, order_by: &[SortItem]) -> Result<Vec<usize>> {
    order_by
        .iter()
        .map(|item| match &item.expr {
            Expr::Integer(n) if *n >= 1 && (*n as usize) <= meta.ncols => Ok(*n as usize - 1),
            Expr::Name(name) => meta
                .names
                .iter()
                .position(|col| col.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    Error::sql(format!("ORDER BY term does not match any column: {name}"))
                }),
            _ => Err(Error::sql(
                "ORDER BY on a compound SELECT must name an output column",
            )),
        })
        .collect()
}

/// Feed one UNION ALL tail arm through an already-open sorter sink.
fn compile_arm_into_sink(
    c: &mut Compiler<'_>,
    arm: &Select,
    sink: &mut RowSink,
    outer: Option<&Scope<'_>>,
) -> Result<SelectMeta> {
    // The arm lands in a scratch container, which is then drained into
    // the sink; this keeps the arm compiler unchanged.
    let scratch = c.alloc_cursor();
    c.b.emit(Opcode::OpenTemp, scratch, 0);
    let meta = compile_one_select(c, &bare_arm(arm), Dest::Table(scratch), outer)?;
    let done = c.b.new_label();
    let cont = c.b.new_label();
    c.b.emit(Opcode::Rewind, scratch, done);
    let top = c.b.current_addr() as i32;
    let ncols = meta.ncols;
    let push_row = |c: &mut Compiler<'_>| -> Result<()> {
        for i in 0..ncols {
            c.b.emit(Opcode::Column, scratch, i as i32);
        }
        Ok(())
    };
    sink.emit_row(c, ncols, cont, done, push_row)?;
    c.b.resolve_label(cont);
    c.b.emit(Opcode::Next, scratch, top);
    c.b.resolve_label(done);
    c.b.emit(Opcode::Close, scratch, 0);
    Ok(meta)
}

// ---- the row sink ----------------------------------------------------

struct SorterState {
    /// Sort keys are column positions (compound) or expressions.
    layout: std::sync::Arc<KeyLayout>,
}

/// Shared per-row machinery: DISTINCT, OFFSET, LIMIT, the destination,
/// and optionally a sorter that buffers rows until `finish`.
struct RowSink {
    dest: Dest,
    distinct_set: Option<i32>,
    limit_cell: Option<i32>,
    offset_cell: Option<i32>,
    sorter: Option<SorterState>,
    /// Sort terms as expressions (plain selects).
    sort_exprs: Vec<SortItem>,
    /// Sort terms as output positions (compound selects).
    sort_positions: Option<Vec<usize>>,
}

impl RowSink {
    fn new(
        c: &mut Compiler<'_>,
        dest: Dest,
        order_by: &[SortItem],
        limit: Option<crate::ast::Limit>,
        distinct: bool,
    ) -> Result<RowSink> {
        let distinct_set = distinct.then(|| c.alloc_set());
        let mut limit_cell = None;
        let mut offset_cell = None;
        if let Some(limit) = limit {
            if limit.limit >= 0 {
                let cell = c.alloc_mem();
                c.b.emit(Opcode::Integer, -(limit.limit as i32), 0);
                c.b.emit(Opcode::MemStore, cell, 1);
                limit_cell = Some(cell);
            }
            if limit.offset > 0 {
                let cell = c.alloc_mem();
                c.b.emit(Opcode::Integer, -(limit.offset as i32), 0);
                c.b.emit(Opcode::MemStore, cell, 1);
                offset_cell = Some(cell);
            }
        }
        let sorter = (!order_by.is_empty()).then(|| SorterState {
            layout: KeyLayout::of(order_by.iter().map(|i| i.order).collect()),
        });
        Ok(RowSink {
            dest,
            distinct_set,
            limit_cell,
            offset_cell,
            sorter,
            sort_exprs: order_by.to_vec(),
            sort_positions: None,
        })
    }

    /// Emit the per-row path. `push_row` emits code leaving the row's
    /// values on the stack; it may run more than once.
    fn emit_row(
        &mut self,
        c: &mut Compiler<'_>,
        ncols: usize,
        cont: i32,
        brk: i32,
        push_row: impl Fn(&mut Compiler<'_>) -> Result<()>,
    ) -> Result<()> {
        if let Some(set) = self.distinct_set {
            push_row(c)?;
            c.b.emit(Opcode::MakeRecord, ncols as i32, 0);
            c.b.emit(Opcode::Dup, 0, 0);
            let dup = c.b.new_label();
            let fresh = c.b.new_label();
            c.b.emit(Opcode::SetFound, set, dup);
            c.b.emit(Opcode::SetInsert, set, 0);
            c.b.emit(Opcode::Goto, 0, fresh);
            c.b.resolve_label(dup);
            c.b.emit(Opcode::Pop, 1, 0);
            c.b.emit(Opcode::Goto, 0, cont);
            c.b.resolve_label(fresh);
        }

        if let Some(sorter) = &self.sorter {
            // Buffered path: key, then values; limits apply on drain.
            match &self.sort_positions {
                Some(positions) => {
                    push_row(c)?;
                    // Values on stack; copy key parts up from their depth,
                    // which grows with every copy already made.
                    for (j, pos) in positions.iter().enumerate() {
                        let depth = (ncols - 1 - pos) + j;
                        c.b.emit(Opcode::Dup, depth as i32, 0);
                    }
                    c.b.emit3(
                        Opcode::MakeKey,
                        positions.len() as i32,
                        0,
                        Operand::Layout(sorter.layout.clone()),
                    );
                    c.b.emit(Opcode::SortPut, ncols as i32, 0);
                }
                None => {
                    // Keys first (computed via expressions by the caller
                    // through `sort_exprs`), then the row values.
                    unreachable!("expression sorts go through emit_sorted_row")
                }
            }
            return Ok(());
        }

        if let Some(cell) = self.offset_cell {
            let past = c.b.new_label();
            c.b.emit(Opcode::MemIncr, cell, past);
            c.b.emit(Opcode::Goto, 0, cont);
            c.b.resolve_label(past);
        }
        if let Some(cell) = self.limit_cell {
            c.b.emit(Opcode::MemIncr, cell, brk);
        }
        push_row(c)?;
        self.emit_dest(c, ncols, brk)
    }

    /// Per-row path for plain selects with ORDER BY: the caller computes
    /// the key expressions in the row's scope.
    fn emit_sorted_row(
        &mut self,
        c: &mut Compiler<'_>,
        ncols: usize,
        cont: i32,
        scope: &Scope<'_>,
        push_row: impl Fn(&mut Compiler<'_>) -> Result<()>,
    ) -> Result<()> {
        let sorter = self.sorter.as_ref().expect("sorted path");
        if let Some(set) = self.distinct_set {
            push_row(c)?;
            c.b.emit(Opcode::MakeRecord, ncols as i32, 0);
            c.b.emit(Opcode::Dup, 0, 0);
            let dup = c.b.new_label();
            let fresh = c.b.new_label();
            c.b.emit(Opcode::SetFound, set, dup);
            c.b.emit(Opcode::SetInsert, set, 0);
            c.b.emit(Opcode::Goto, 0, fresh);
            c.b.resolve_label(dup);
            c.b.emit(Opcode::Pop, 1, 0);
            c.b.emit(Opcode::Goto, 0, cont);
            c.b.resolve_label(fresh);
        }
        let layout = sorter.layout.clone();
        let sort_exprs = self.sort_exprs.clone();
        for item in &sort_exprs {
            c.code_expr(scope, &item.expr)?;
        }
        c.b.emit3(
            Opcode::MakeKey,
            sort_exprs.len() as i32,
            0,
            Operand::Layout(layout),
        );
        push_row(c)?;
        c.b.emit(Opcode::SortPut, ncols as i32, 0);
        Ok(())
    }

    fn emit_dest(&self, c: &mut Compiler<'_>, ncols: usize, brk: i32) -> Result<()> {
        match self.dest {
            Dest::Callback => {
                c.b.emit(Opcode::Callback, ncols as i32, 0);
            }
            Dest::Set(set) => {
                if ncols != 1 {
                    return Err(Error::sql(
                        "only a single result allowed for a SELECT that is part of an expression",
                    ));
                }
                c.b.emit(Opcode::SetInsert, set, 0);
            }
            Dest::Mem(cell) => {
                if ncols != 1 {
                    return Err(Error::sql(
                        "only a single result allowed for a SELECT that is part of an expression",
                    ));
                }
                c.b.emit(Opcode::MemStore, cell, 1);
                c.b.emit(Opcode::Goto, 0, brk);
            }
            Dest::Table(cursor) => {
                c.b.emit(Opcode::MakeRecord, ncols as i32, 0);
                c.b.emit(Opcode::NewRecno, cursor, 0);
                c.b.emit(Opcode::Pull, 1, 0);
                c.b.emit(Opcode::PutIntKey, cursor, 0);
            }
            Dest::Union(cursor) => {
                c.b.emit(Opcode::MakeRecord, ncols as i32, 0);
                c.b.emit(Opcode::PutStrKey, cursor, 0);
            }
            Dest::Except(cursor) => {
                c.b.emit(Opcode::MakeRecord, ncols as i32, 0);
                c.b.emit(Opcode::IdxDelete, cursor, 0);
            }
            Dest::Gosub(entry) => {
                c.b.emit(Opcode::Gosub, 0, entry);
            }
            Dest::Discard => {
                c.b.emit(Opcode::Pop, ncols as i32, 0);
            }
        }
        Ok(())
    }

    /// Drain the sorter, applying LIMIT/OFFSET on the way out. The limit
    /// only counts rows that survive the offset skip.
    fn finish(mut self, c: &mut Compiler<'_>, ncols: usize) -> Result<()> {
        if self.sorter.take().is_none() {
            return Ok(());
        }
        c.b.emit(Opcode::Sort, 0, 0);
        let done = c.b.new_label();
        let drop_row = c.b.new_label();
        let top_addr = c.b.current_addr() as i32;
        c.b.emit(Opcode::SortNext, ncols as i32, done);
        if let Some(cell) = self.offset_cell {
            let past = c.b.new_label();
            c.b.emit(Opcode::MemIncr, cell, past);
            c.b.emit(Opcode::Pop, ncols as i32, 0);
            c.b.emit(Opcode::Goto, 0, top_addr);
            c.b.resolve_label(past);
        }
        if let Some(cell) = self.limit_cell {
            c.b.emit(Opcode::MemIncr, cell, drop_row);
        }
        self.emit_dest(c, ncols, done)?;
        c.b.emit(Opcode::Goto, 0, top_addr);
        c.b.resolve_label(drop_row);
        c.b.emit(Opcode::Pop, ncols as i32, 0);
        c.b.resolve_label(done);
        c.b.emit(Opcode::SortReset, 0, 0);
        Ok(())
    }
}

// ---- single select ---------------------------------------------------

fn compile_one_select(
    c: &mut Compiler<'_>,
    select: &Select,
    dest: Dest,
    outer: Option<&Scope<'_>>,
) -> Result<SelectMeta> {
    c.authorize(AuthAction::Select, None, None, None)?;

    // Build the scope, materialising views and FROM subqueries.
    let mut items: Vec<ScopeItem> = Vec::new();
    let mut joins: Vec<JoinKind> = Vec::new();
    let mut join_terms: Vec<Expr> = Vec::new();

    for src in &select.from {
        joins.push(src.join);
        let cursor = c.alloc_cursor();
        let item = if let Some(subquery) = &src.subquery {
            c.b.emit(Opcode::OpenTemp, cursor, 0);
            let meta = compile_select(c, subquery, Dest::Table(cursor), None)?;
            ScopeItem {
                alias: src
                    .alias
                    .clone()
                    .unwrap_or_else(|| SmolStr::new(format!("sub_{cursor}"))),
                db: None,
                table: None,
                cursor,
                columns: meta.names.iter().map(SmolStr::new).collect(),
                ipk: None,
                cells: None,
            }
        } else {
            let (db, table) = c
                .conn
                .catalog
                .find_table(src.database.as_deref(), &src.table)?;
            let table = table.clone();
            c.use_schema(db);
            if let Some(view_select) = &table.view_select {
                let view_select = view_select.as_ref().clone();
                c.b.emit(Opcode::OpenTemp, cursor, 0);
                let meta = compile_select(c, &view_select, Dest::Table(cursor), None)?;
                ScopeItem {
                    alias: src.alias.clone().unwrap_or_else(|| table.name.clone()),
                    db: None,
                    table: None,
                    cursor,
                    columns: meta.names.iter().map(SmolStr::new).collect(),
                    ipk: None,
                    cells: None,
                }
            } else {
                scope_item_for_table(&table, src.alias.as_deref(), cursor)
            }
        };

        // NATURAL and USING join conditions become WHERE terms; ON
        // clauses are folded in as-is.
        if src.join.natural || !src.using.is_empty() {
            let right_alias = item.alias.clone();
            let pairs: Vec<SmolStr> = if src.join.natural {
                item.columns
                    .iter()
                    .filter(|col| {
                        items
                            .iter()
                            .any(|prev| prev.columns.iter().any(|p| p.eq_ignore_ascii_case(col)))
                    })
                    .cloned()
                    .collect()
            } else {
                src.using.clone()
            };
            for col in pairs {
                let left = items
                    .iter()
                    .rev()
                    .find(|prev| prev.columns.iter().any(|p| p.eq_ignore_ascii_case(&col)))
                    .map(|prev| prev.alias.clone())
                    .ok_or_else(|| {
                        Error::sql(format!("cannot join using column {col}"))
                    })?;
                join_terms.push(Expr::binary(
                    Expr::Qualified(left, col.clone()),
                    BinaryOp::Eq,
                    Expr::Qualified(right_alias.clone(), col.clone()),
                ));
            }
        }
        if let Some(on) = &src.on_clause {
            join_terms.push(on.clone());
        }
        items.push(item);
    }

    let scope = Scope {
        items,
        parent: outer,
    };

    // Expand the projection.
    let out_cols = expand_columns(c, select, &scope)?;
    let ncols = out_cols.len();
    let meta = SelectMeta {
        ncols,
        names: out_cols.iter().map(|col| col.name.clone()).collect(),
        types: out_cols.iter().map(|col| col.type_name.clone()).collect(),
    };

    // Fold join conditions into the WHERE expression.
    let mut where_all = select.where_clause.clone();
    for term in join_terms {
        where_all = Some(match where_all {
            Some(prev) => Expr::binary(prev, BinaryOp::And, term),
            None => term,
        });
    }

    let is_aggregate = !select.group_by.is_empty()
        || out_cols
            .iter()
            .any(|col| expr_has_aggregate(c, &col.expr))
        || select
            .having
            .as_ref()
            .is_some_and(|h| expr_has_aggregate(c, h));

    if is_aggregate {
        compile_aggregate_select(
            c, select, dest, &scope, &joins, where_all.as_ref(), out_cols, meta,
        )
    } else {
        if select.having.is_some() {
            return Err(Error::sql("a GROUP BY clause is required before HAVING"));
        }
        compile_plain_select(
            c, select, dest, &scope, &joins, where_all.as_ref(), out_cols, meta,
        )
    }
}

/// ORDER BY terms may name an output position (1-based integer) or an
/// output alias; both resolve to the column's expression.
fn resolve_order_terms(out_cols: &[OutCol], order_by: &[SortItem]) -> Result<Vec<SortItem>> {
    order_by
        .iter()
        .map(|item| {
            let expr = match &item.expr {
                Expr::Integer(n) => {
                    let idx = *n;
                    if idx < 1 || idx as usize > out_cols.len() {
                        return Err(Error::sql(format!(
                            "ORDER BY position {idx} is out of range"
                        )));
                    }
                    out_cols[idx as usize - 1].expr.clone()
                }
                Expr::Name(name) => out_cols
                    .iter()
                    .find(|col| col.name.eq_ignore_ascii_case(name))
                    .map(|col| col.expr.clone())
                    .unwrap_or_else(|| item.expr.clone()),
                other => other.clone(),
            };
            Ok(SortItem {
                expr,
                order: item.order,
            })
        })
        .collect()
}

fn expr_has_aggregate(c: &Compiler<'_>, expr: &Expr) -> bool {
    let mut found = false;
    let _ = resolve::walk_expr(expr, &mut |e| {
        if let Expr::Function { name, args, star } = e {
            let argc = if *star { 0 } else { args.len() as i32 };
            if c.conn
                .funcs
                .find(name, argc)
                .is_some_and(|def| def.is_aggregate())
            {
                found = true;
            }
        }
        Ok(())
    });
    found
}

fn expand_columns(
    c: &mut Compiler<'_>,
    select: &Select,
    scope: &Scope<'_>,
) -> Result<Vec<OutCol>> {
    let mut out = Vec::new();
    for column in &select.columns {
        match column {
            ResultColumn::Star => {
                if scope.items.is_empty() {
                    return Err(Error::sql("no tables specified"));
                }
                for item in &scope.items {
                    push_table_columns(c, item, &mut out);
                }
            }
            ResultColumn::TableStar(table) => {
                let item = scope
                    .items
                    .iter()
                    .find(|item| item.alias.eq_ignore_ascii_case(table))
                    .ok_or_else(|| Error::sql(format!("no such table: {table}")))?;
                push_table_columns(c, item, &mut out);
            }
            ResultColumn::Expr { expr, alias } => {
                let name = match (alias, expr) {
                    (Some(alias), _) => alias.to_string(),
                    (None, Expr::Name(name)) => name.to_string(),
                    (None, Expr::Qualified(table, name))
                    | (None, Expr::DbQualified(_, table, name)) => {
                        if c.conn.flags.full_column_names {
                            format!("{table}.{name}")
                        } else {
                            name.to_string()
                        }
                    }
                    (None, _) => format!("column{}", out.len() + 1),
                };
                let type_name = declared_type(c, scope, expr);
                out.push(OutCol {
                    expr: expr.clone(),
                    name,
                    type_name,
                });
            }
        }
    }
    Ok(out)
}

fn push_table_columns(c: &Compiler<'_>, item: &ScopeItem, out: &mut Vec<OutCol>) {
    for col in &item.columns {
        let expr = Expr::Qualified(item.alias.clone(), col.clone());
        let name = if c.conn.flags.full_column_names {
            format!("{}.{col}", item.alias)
        } else {
            col.to_string()
        };
        out.push(OutCol {
            expr,
            name,
            type_name: lookup_declared_type(c, item, col),
        });
    }
}

fn declared_type(c: &Compiler<'_>, scope: &Scope<'_>, expr: &Expr) -> String {
    let (table, column) = match expr {
        Expr::Name(name) => (None, name.as_str()),
        Expr::Qualified(table, column) | Expr::DbQualified(_, table, column) => {
            (Some(table.as_str()), column.as_str())
        }
        _ => return "NUMERIC".to_owned(),
    };
    if let Ok((level, resolved)) = scope.resolve(table, column) {
        let item = scope.item(level, resolved.item_idx);
        return lookup_declared_type(c, item, column);
    }
    String::new()
}

fn lookup_declared_type(c: &Compiler<'_>, item: &ScopeItem, column: &str) -> String {
    let (Some(db), Some(table)) = (item.db, item.table.as_ref()) else {
        return "NUMERIC".to_owned();
    };
    c.conn
        .catalog
        .db(db)
        .ok()
        .and_then(|d| d.schema.table(table))
        .and_then(|t| {
            t.column_index(column)
                .and_then(|i| t.columns[i].type_name.clone())
        })
        .unwrap_or_else(|| "NUMERIC".to_owned())
}

#[allow(clippy::too_many_arguments)]
fn compile_plain_select(
    c: &mut Compiler<'_>,
    select: &Select,
    dest: Dest,
    scope: &Scope<'_>,
    joins: &[JoinKind],
    where_all: Option<&Expr>,
    out_cols: Vec<OutCol>,
    meta: SelectMeta,
) -> Result<SelectMeta> {
    let ncols = out_cols.len();
    let order_terms = resolve_order_terms(&out_cols, &select.order_by)?;

    // No FROM clause: a single synthetic row.
    if scope.items.is_empty() {
        let mut sink = RowSink::new(c, dest, &order_terms, select.limit, select.distinct)?;
        let brk = c.b.new_label();
        let cont = c.b.new_label();
        let ok = c.b.new_label();
        if let Some(where_expr) = where_all {
            c.code_expr(scope, where_expr)?;
            c.b.emit(Opcode::If, 0, ok);
            c.b.emit(Opcode::Goto, 0, cont);
        } else {
            c.b.emit(Opcode::Goto, 0, ok);
        }
        c.b.resolve_label(ok);
        if sink.sorter.is_some() {
            sink.emit_sorted_row(c, ncols, cont, scope, |c| {
                for col in &out_cols {
                    c.code_expr(scope, &col.expr)?;
                }
                Ok(())
            })?;
        } else {
            sink.emit_row(c, ncols, cont, brk, |c| {
                for col in &out_cols {
                    c.code_expr(scope, &col.expr)?;
                }
                Ok(())
            })?;
        }
        c.b.resolve_label(cont);
        c.b.resolve_label(brk);
        sink.finish(c, ncols)?;
        return Ok(meta);
    }

    let where_ctx = c.where_begin(scope, joins, where_all, Some(&order_terms))?;
    let order_needed = !order_terms.is_empty() && !where_ctx.order_satisfied;
    let order_by: &[SortItem] = if order_needed { &order_terms } else { &[] };
    let mut sink = RowSink::new(c, dest, order_by, select.limit, select.distinct)?;

    let cont = where_ctx.continue_label;
    let brk = where_ctx.break_label;
    if sink.sorter.is_some() {
        sink.emit_sorted_row(c, ncols, cont, scope, |c| {
            for col in &out_cols {
                c.code_expr(scope, &col.expr)?;
            }
            Ok(())
        })?;
    } else {
        sink.emit_row(c, ncols, cont, brk, |c| {
            for col in &out_cols {
                c.code_expr(scope, &col.expr)?;
            }
            Ok(())
        })?;
    }
    c.where_end(where_ctx);
    // Close the base-table cursors this select opened.
    for item in &scope.items {
        c.b.emit(Opcode::Close, item.cursor, 0);
    }
    sink.finish(c, ncols)?;
    Ok(meta)
}

#[allow(clippy::too_many_arguments)]
fn compile_aggregate_select(
    c: &mut Compiler<'_>,
    select: &Select,
    dest: Dest,
    scope: &Scope<'_>,
    joins: &[JoinKind],
    where_all: Option<&Expr>,
    out_cols: Vec<OutCol>,
    meta: SelectMeta,
) -> Result<SelectMeta> {
    let ncols = out_cols.len();

    // Assign slots: GROUP BY fields first, then every aggregate call and
    // loose field discovered in the output expressions.
    let mut slots: Vec<AggSlot> = select
        .group_by
        .iter()
        .map(|e| AggSlot::Field(e.clone()))
        .collect();

    let mut rewritten: Vec<Expr> = Vec::with_capacity(ncols);
    for col in &out_cols {
        rewritten.push(agg_rewrite(c, &col.expr, &mut slots)?);
    }
    let having = select
        .having
        .as_ref()
        .map(|h| agg_rewrite(c, h, &mut slots))
        .transpose()?;
    let order_terms = resolve_order_terms(&out_cols, &select.order_by)?;
    let order_rewritten: Vec<SortItem> = order_terms
        .iter()
        .map(|item| {
            Ok(SortItem {
                expr: agg_rewrite(c, &item.expr, &mut slots)?,
                order: item.order,
            })
        })
        .collect::<Result<_>>()?;

    c.b.emit(Opcode::AggReset, 0, slots.len() as i32);

    let where_ctx = c.where_begin(scope, joins, where_all, None)?;
    {
        // Group key, then focus.
        let ngroup = select.group_by.len();
        for expr in &select.group_by {
            c.code_expr(scope, expr)?;
        }
        c.b.emit3(
            Opcode::MakeKey,
            ngroup as i32,
            0,
            Operand::Layout(KeyLayout::ascending(ngroup)),
        );
        let focused = c.b.new_label();
        c.b.emit(Opcode::AggFocus, 0, focused);
        // New context: arm the function slots before any row steps them.
        for (i, slot) in slots.iter().enumerate() {
            if let AggSlot::Call { def, .. } = slot {
                c.b.emit3(Opcode::AggInit, 0, i as i32, Operand::Func(def.clone()));
            }
        }
        c.b.resolve_label(focused);
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                AggSlot::Field(expr) => {
                    let expr = expr.clone();
                    c.code_expr(scope, &expr)?;
                    c.b.emit(Opcode::AggSet, 0, i as i32);
                }
                AggSlot::Call { def, args } => {
                    let args = args.clone();
                    let def = def.clone();
                    for arg in &args {
                        c.code_expr(scope, arg)?;
                    }
                    c.b.emit3(
                        Opcode::AggFunc,
                        args.len() as i32,
                        i as i32,
                        Operand::Func(def),
                    );
                }
            }
        }
    }
    c.where_end(where_ctx);
    for item in &scope.items {
        c.b.emit(Opcode::Close, item.cursor, 0);
    }

    // Without GROUP BY an empty input still yields one row.
    if select.group_by.is_empty() {
        let have = c.b.new_label();
        c.b.emit3(Opcode::MakeKey, 0, 0, Operand::Layout(KeyLayout::ascending(0)));
        c.b.emit(Opcode::AggFocus, 0, have);
        for (i, slot) in slots.iter().enumerate() {
            if let AggSlot::Call { def, .. } = slot {
                c.b.emit3(Opcode::AggInit, 0, i as i32, Operand::Func(def.clone()));
            }
        }
        c.b.resolve_label(have);
    }

    // Output pass over the aggregate contexts.
    let mut sink = RowSink::new(c, dest, &order_rewritten, select.limit, select.distinct)?;
    let done = c.b.new_label();
    let loop_top = c.b.current_addr() as i32;
    c.b.emit(Opcode::AggNext, 0, done);
    let cont = c.b.new_label();
    // The rewritten expressions only reference context slots, so the
    // output pass runs in an empty scope.
    let out_scope = Scope::default();
    if let Some(having) = &having {
        c.code_expr(&out_scope, having)?;
        c.b.emit(Opcode::IfNot, 0, cont);
    }
    if sink.sorter.is_some() {
        sink.emit_sorted_row(c, ncols, cont, &out_scope, |c| {
            for expr in &rewritten {
                c.code_expr(&Scope::default(), expr)?;
            }
            Ok(())
        })?;
    } else {
        sink.emit_row(c, ncols, cont, done, |c| {
            for expr in &rewritten {
                c.code_expr(&Scope::default(), expr)?;
            }
            Ok(())
        })?;
    }
    c.b.resolve_label(cont);
    c.b.emit(Opcode::Goto, 0, loop_top);
    c.b.resolve_label(done);
    sink.finish(c, ncols)?;
    Ok(meta)
}

/// Rewrite an output expression for the aggregate output pass: aggregate
/// calls and grouped fields become context-slot references.
fn agg_rewrite(c: &mut Compiler<'_>, expr: &Expr, slots: &mut Vec<AggSlot>) -> Result<Expr> {
    // Whole-expression match against an existing field slot (the GROUP BY
    // terms land there first).
    for (i, slot) in slots.iter().enumerate() {
        if let AggSlot::Field(field) = slot {
            if field == expr {
                return Ok(Expr::AggRef(i));
            }
        }
    }
    match expr {
        Expr::Function { name, args, star } => {
            let argc = if *star { 0 } else { args.len() as i32 };
            if let Some(def) = c.conn.funcs.find(name, argc) {
                if def.is_aggregate() {
                    slots.push(AggSlot::Call {
                        def,
                        args: args.clone(),
                    });
                    return Ok(Expr::AggRef(slots.len() - 1));
                }
            }
            let args = args
                .iter()
                .map(|a| agg_rewrite(c, a, slots))
                .collect::<Result<Vec<_>>>()?;
            Ok(Expr::Function {
                name: name.clone(),
                args,
                star: *star,
            })
        }
        Expr::Name(_) | Expr::Qualified(..) | Expr::DbQualified(..) | Expr::Column(_) => {
            // A bare column in an aggregate query reads through a field
            // slot; within a group it carries the group's last row.
            slots.push(AggSlot::Field(expr.clone()));
            Ok(Expr::AggRef(slots.len() - 1))
        }
        Expr::Unary(op, e) => Ok(Expr::Unary(*op, Box::new(agg_rewrite(c, e, slots)?))),
        Expr::Binary(l, op, r) => Ok(Expr::Binary(
            Box::new(agg_rewrite(c, l, slots)?),
            *op,
            Box::new(agg_rewrite(c, r, slots)?),
        )),
        Expr::IsNull { expr, negated } => Ok(Expr::IsNull {
            expr: Box::new(agg_rewrite(c, expr, slots)?),
            negated: *negated,
        }),
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => Ok(Expr::Between {
            expr: Box::new(agg_rewrite(c, expr, slots)?),
            low: Box::new(agg_rewrite(c, low, slots)?),
            high: Box::new(agg_rewrite(c, high, slots)?),
            negated: *negated,
        }),
        Expr::Case {
            base,
            whens,
            else_expr,
        } => Ok(Expr::Case {
            base: base
                .as_ref()
                .map(|b| agg_rewrite(c, b, slots).map(Box::new))
                .transpose()?,
            whens: whens
                .iter()
                .map(|(w, t)| Ok((agg_rewrite(c, w, slots)?, agg_rewrite(c, t, slots)?)))
                .collect::<Result<_>>()?,
            else_expr: else_expr
                .as_ref()
                .map(|e| agg_rewrite(c, e, slots).map(Box::new))
                .transpose()?,
        }),
        other => Ok(other.clone()),
    }
}
