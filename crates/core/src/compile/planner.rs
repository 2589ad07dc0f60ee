//! The WHERE planner: splits the WHERE clause into AND-conjuncts, scores
//! the usable indices of every source, and emits the nested scan loops.
//! Scoring: each pinned equality column is worth 8, a trailing upper bound
//! 1, a trailing lower bound 2, a lone IN term 4; the best index wins.
//! Every term is re-checked as a filter even when it drove a seek, so the
//! chosen strategy can never change the row multiset.

use smol_str::SmolStr;

use crate::ast::{BinaryOp, ColumnPos, Expr, JoinKind, SortItem, SortOrder};
use crate::errors::Result;
use crate::vdbe::key::KeyLayout;
use crate::vdbe::{Opcode, Operand};

use super::{Compiler, Scope};

/// Sources beyond this depth join without index help.
const MAX_PLANNED_SOURCES: usize = 32;
/// Static cap on analysed AND-conjuncts.
const MAX_TERMS: usize = 100;

pub(crate) struct WhereCtx {
    levels: Vec<Level>,
    pub break_label: i32,
    /// Per-row continue target of the innermost loop.
    pub continue_label: i32,
    /// The scan order already delivers the requested ORDER BY.
    pub order_satisfied: bool,
}

struct Level {
    cursor: i32,
    idx_cursor: Option<i32>,
    tail: Tail,
    cont_label: i32,
    brk_label: i32,
    left_join_cell: Option<i32>,
    body_label: i32,
}

enum Tail {
    /// Single-shot level (row-id lookup): continue falls through to break.
    Single,
    Scan { cursor: i32, top: i32 },
    InRowid { set: i32, in_top: i32 },
    InIdx {
        idx: i32,
        inner_top: i32,
        set: i32,
        in_top: i32,
        value_done: i32,
    },
}

struct Term<'e> {
    expr: &'e Expr,
    /// Bitmask of scope items the term reads.
    deps: u64,
    used: bool,
}

enum InSrc<'e> {
    List(&'e [Expr]),
    Select(&'e crate::ast::Select),
}

enum Plan<'e> {
    FullScan,
    RowidEq(&'e Expr),
    RowidIn(InSrc<'e>),
    RowidRange {
        lower: Option<(&'e Expr, bool)>,
        upper: Option<(&'e Expr, bool)>,
    },
    Index {
        name: SmolStr,
        root: i32,
        db: usize,
        eq: Vec<&'e Expr>,
        in_term: Option<InSrc<'e>>,
        lower: Option<(&'e Expr, bool)>,
        upper: Option<(&'e Expr, bool)>,
    },
}

fn split_conjuncts<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    if out.len() >= MAX_TERMS {
        return;
    }
    match expr {
        Expr::Binary(lhs, BinaryOp::And, rhs) => {
            split_conjuncts(lhs, out);
            split_conjuncts(rhs, out);
        }
        other => out.push(other),
    }
}

/// Scope-item dependencies of an expression; subqueries make the term
/// depend on everything, pinning it to the innermost loop as a filter.
fn expr_deps(scope: &Scope<'_>, expr: &Expr, mask: &mut u64, opaque: &mut bool) {
    match expr {
        Expr::Name(name) => {
            if let Ok(Some(resolved)) = scope.resolve_here(None, name) {
                *mask |= 1 << resolved.item_idx;
            }
        }
        Expr::Qualified(table, column) | Expr::DbQualified(_, table, column) => {
            if let Ok(Some(resolved)) = scope.resolve_here(Some(table), column) {
                *mask |= 1 << resolved.item_idx;
            }
        }
        Expr::Select(_) | Expr::InSelect { .. } => {
            *opaque = true;
        }
        Expr::Unary(_, e) => expr_deps(scope, e, mask, opaque),
        Expr::Binary(l, _, r) => {
            expr_deps(scope, l, mask, opaque);
            expr_deps(scope, r, mask, opaque);
        }
        Expr::IsNull { expr, .. } => expr_deps(scope, expr, mask, opaque),
        Expr::Between {
            expr, low, high, ..
        } => {
            expr_deps(scope, expr, mask, opaque);
            expr_deps(scope, low, mask, opaque);
            expr_deps(scope, high, mask, opaque);
        }
        Expr::InList { expr, list, .. } => {
            expr_deps(scope, expr, mask, opaque);
            for e in list {
                expr_deps(scope, e, mask, opaque);
            }
        }
        Expr::Function { args, .. } => {
            for e in args {
                expr_deps(scope, e, mask, opaque);
            }
        }
        Expr::Case {
            base,
            whens,
            else_expr,
        } => {
            if let Some(b) = base {
                expr_deps(scope, b, mask, opaque);
            }
            for (w, t) in whens {
                expr_deps(scope, w, mask, opaque);
                expr_deps(scope, t, mask, opaque);
            }
            if let Some(e) = else_expr {
                expr_deps(scope, e, mask, opaque);
            }
        }
        _ => {}
    }
}

fn deps_of(scope: &Scope<'_>, expr: &Expr, all_mask: u64) -> u64 {
    let mut mask = 0;
    let mut opaque = false;
    expr_deps(scope, expr, &mut mask, &mut opaque);
    if opaque { all_mask } else { mask }
}

/// `column <op> expr` with the column side on `item`; returns the column
/// position and the expr side with the operator normalised to put the
/// column on the left.
fn comparison_on<'e>(
    scope: &Scope<'_>,
    item: usize,
    term: &'e Expr,
) -> Option<(ColumnPos, BinaryOp, &'e Expr)> {
    let Expr::Binary(lhs, op, rhs) = term else {
        return None;
    };
    let indexable = matches!(
        op,
        BinaryOp::Eq | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
    );
    if !indexable {
        return None;
    }
    if let Some(pos) = column_of(scope, item, lhs) {
        return Some((pos, *op, rhs));
    }
    if let Some(pos) = column_of(scope, item, rhs) {
        let flipped = match op {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::Le => BinaryOp::Ge,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::Ge => BinaryOp::Le,
            other => *other,
        };
        return Some((pos, flipped, lhs));
    }
    None
}

fn column_of(scope: &Scope<'_>, item: usize, expr: &Expr) -> Option<ColumnPos> {
    let (table, column) = match expr {
        Expr::Name(name) => (None, name.as_str()),
        Expr::Qualified(table, column) => (Some(table.as_str()), column.as_str()),
        _ => return None,
    };
    match scope.resolve_here(table, column) {
        Ok(Some(resolved)) if resolved.item_idx == item => Some(resolved.pos),
        _ => None,
    }
}

fn in_on<'e>(scope: &Scope<'_>, item: usize, term: &'e Expr) -> Option<(ColumnPos, InSrc<'e>)> {
    match term {
        Expr::InList {
            expr,
            list,
            negated: false,
        } => Some((column_of(scope, item, expr)?, InSrc::List(list))),
        Expr::InSelect {
            expr,
            select,
            negated: false,
        } => Some((column_of(scope, item, expr)?, InSrc::Select(select))),
        _ => None,
    }
}

impl<'a> Compiler<'a> {
    /// Open the scan loops for every source in `scope`, filtered by
    /// `where_expr`. The caller emits the row body, then calls
    /// [`Compiler::where_end`]. Cursors for base tables are opened here;
    /// items without a catalog table must arrive with open cursors.
    pub(crate) fn where_begin(
        &mut self,
        scope: &Scope<'_>,
        joins: &[JoinKind],
        where_expr: Option<&Expr>,
        order_by: Option<&[SortItem]>,
    ) -> Result<WhereCtx> {
        let nitems = scope.items.len();
        let all_mask = if nitems >= 64 {
            u64::MAX
        } else {
            (1u64 << nitems) - 1
        };

        let mut conjuncts = Vec::new();
        if let Some(expr) = where_expr {
            split_conjuncts(expr, &mut conjuncts);
        }
        let mut terms: Vec<Term<'_>> = conjuncts
            .into_iter()
            .map(|expr| Term {
                deps: deps_of(scope, expr, all_mask),
                expr,
                used: false,
            })
            .collect();

        let break_label = self.b.new_label();
        let mut levels: Vec<Level> = Vec::with_capacity(nitems);
        let mut positioned: u64 = 0;
        let mut order_satisfied = false;

        for item_idx in 0..nitems {
            let left_outer = joins.get(item_idx).is_some_and(|j| j.left_outer);
            let plan = if item_idx < MAX_PLANNED_SOURCES {
                self.choose_plan(scope, item_idx, positioned, &mut terms)
            } else {
                Plan::FullScan
            };

            // ORDER BY elision: single source, pure scan in index or rowid
            // order with uniformly ascending terms.
            let plan = if nitems == 1 && item_idx == 0 {
                match order_by {
                    Some(order) if !order.is_empty() => {
                        let (plan, satisfied) =
                            self.try_order_plan(scope, plan, order);
                        order_satisfied = satisfied;
                        plan
                    }
                    _ => plan,
                }
            } else {
                plan
            };

            let level = self.emit_level(scope, item_idx, left_outer, plan, break_label)?;

            positioned |= 1 << item_idx;
            // Filters whose dependencies are now all positioned.
            let cont = level.cont_label;
            for term in terms.iter_mut().filter(|t| !t.used) {
                if term.deps & !positioned == 0 {
                    term.used = true;
                    let expr = term.expr;
                    self.code_expr(scope, expr)?;
                    self.b.emit(Opcode::IfNot, 0, cont);
                }
            }
            // The level matched once its own filters passed; the NULL-row
            // path re-enters here, so deeper levels re-run their loops.
            if let Some(cell) = level.left_join_cell {
                self.b.emit(Opcode::Integer, 1, 0);
                self.b.emit(Opcode::MemStore, cell, 1);
            }
            self.b.resolve_label(level.body_label);
            levels.push(level);
        }

        let continue_label = levels
            .last()
            .map(|l| l.cont_label)
            .unwrap_or(break_label);
        Ok(WhereCtx {
            levels,
            break_label,
            continue_label,
            order_satisfied,
        })
    }

    fn choose_plan<'e>(
        &mut self,
        scope: &Scope<'_>,
        item_idx: usize,
        positioned: u64,
        terms: &mut Vec<Term<'e>>,
    ) -> Plan<'e> {
        let item = &scope.items[item_idx];
        let Some(db) = item.db else {
            return Plan::FullScan;
        };
        let Some(table_name) = item.table.clone() else {
            return Plan::FullScan;
        };
        let usable = |deps: u64| deps & !(positioned | (1 << item_idx)) == 0;

        // Strategy 1: direct row-id lookup.
        for term in terms.iter_mut() {
            if term.used || !usable(term.deps) {
                continue;
            }
            if let Some((ColumnPos::Rowid, BinaryOp::Eq, rhs)) =
                comparison_on(scope, item_idx, term.expr)
            {
                if deps_of(scope, rhs, u64::MAX) & (1 << item_idx) == 0 {
                    return Plan::RowidEq(rhs);
                }
            }
            if let Some((ColumnPos::Rowid, src)) = in_on(scope, item_idx, term.expr) {
                return Plan::RowidIn(src);
            }
        }

        // Strategy 3: row-id range.
        let mut rid_lower: Option<(&Expr, bool)> = None;
        let mut rid_upper: Option<(&Expr, bool)> = None;
        for term in terms.iter() {
            if term.used || !usable(term.deps) {
                continue;
            }
            if let Some((ColumnPos::Rowid, op, rhs)) = comparison_on(scope, item_idx, term.expr)
            {
                if deps_of(scope, rhs, u64::MAX) & (1 << item_idx) != 0 {
                    continue;
                }
                match op {
                    BinaryOp::Gt => rid_lower = rid_lower.or(Some((rhs, false))),
                    BinaryOp::Ge => rid_lower = rid_lower.or(Some((rhs, true))),
                    BinaryOp::Lt => rid_upper = rid_upper.or(Some((rhs, false))),
                    BinaryOp::Le => rid_upper = rid_upper.or(Some((rhs, true))),
                    _ => {}
                }
            }
        }

        // Index strategies 2 and 5, scored.
        let indices: Vec<(SmolStr, i32, Vec<usize>)> = self
            .conn
            .catalog
            .db(db)
            .ok()
            .and_then(|d| d.schema.table(&table_name).cloned())
            .map(|table| {
                table
                    .indices
                    .iter()
                    .filter_map(|name| {
                        self.conn
                            .catalog
                            .db(db)
                            .ok()?
                            .schema
                            .index(name)
                            .map(|i| (i.name.clone(), i.root, i.columns.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut best: Option<(u32, Plan<'e>)> = None;
        for (idx_name, idx_root, idx_columns) in indices {
            let mut eq: Vec<&Expr> = Vec::new();
            let mut in_term: Option<InSrc<'e>> = None;
            let mut lower: Option<(&Expr, bool)> = None;
            let mut upper: Option<(&Expr, bool)> = None;
            let mut score: u32 = 0;

            for (slot, &col) in idx_columns.iter().enumerate() {
                let want = ColumnPos::Idx(col);
                let mut advanced = false;
                for term in terms.iter() {
                    if term.used || !usable(term.deps) {
                        continue;
                    }
                    match comparison_on(scope, item_idx, term.expr) {
                        Some((pos, BinaryOp::Eq, rhs)) if pos == want => {
                            if deps_of(scope, rhs, u64::MAX) & (1 << item_idx) != 0 {
                                continue;
                            }
                            eq.push(rhs);
                            score += 8;
                            advanced = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if advanced {
                    continue;
                }
                // No equality for this column: an IN term (first unpinned
                // column only) or a trailing inequality ends the prefix.
                if slot == eq.len() {
                    for term in terms.iter() {
                        if term.used || !usable(term.deps) {
                            continue;
                        }
                        if eq.is_empty() && in_term.is_none() {
                            if let Some((pos, src)) = in_on(scope, item_idx, term.expr) {
                                if pos == want {
                                    in_term = Some(src);
                                    continue;
                                }
                            }
                        }
                        if let Some((pos, op, rhs)) = comparison_on(scope, item_idx, term.expr)
                        {
                            if pos != want
                                || deps_of(scope, rhs, u64::MAX) & (1 << item_idx) != 0
                            {
                                continue;
                            }
                            match op {
                                BinaryOp::Lt if upper.is_none() => {
                                    upper = Some((rhs, false));
                                    score += 1;
                                }
                                BinaryOp::Le if upper.is_none() => {
                                    upper = Some((rhs, true));
                                    score += 1;
                                }
                                BinaryOp::Gt if lower.is_none() => {
                                    lower = Some((rhs, false));
                                    score += 2;
                                }
                                BinaryOp::Ge if lower.is_none() => {
                                    lower = Some((rhs, true));
                                    score += 2;
                                }
                                _ => {}
                            }
                        }
                    }
                }
                break;
            }
            if score == 0 && in_term.is_some() {
                score = 4;
            }
            if score == 0 {
                continue;
            }
            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((
                    score,
                    Plan::Index {
                        name: idx_name,
                        root: idx_root,
                        db,
                        eq,
                        in_term,
                        lower,
                        upper,
                    },
                ));
            }
        }

        if let Some((_, plan)) = best {
            log::debug!("where: index scan chosen for {table_name}");
            return plan;
        }
        if rid_lower.is_some() || rid_upper.is_some() {
            return Plan::RowidRange {
                lower: rid_lower,
                upper: rid_upper,
            };
        }
        Plan::FullScan
    }

    /// Swap a full scan for an index scan that delivers ORDER BY order.
    fn try_order_plan<'e>(
        &mut self,
        scope: &Scope<'_>,
        plan: Plan<'e>,
        order: &[SortItem],
    ) -> (Plan<'e>, bool) {
        if order.iter().any(|item| item.order != SortOrder::Asc) {
            return (plan, false);
        }
        let positions: Option<Vec<ColumnPos>> = order
            .iter()
            .map(|item| column_of(scope, 0, &item.expr))
            .collect();
        let Some(positions) = positions else {
            return (plan, false);
        };
        match &plan {
            Plan::FullScan | Plan::RowidRange { .. } | Plan::RowidEq(_) => {
                // Natural table order is row-id order.
                if positions == [ColumnPos::Rowid] {
                    return (plan, true);
                }
            }
            _ => {}
        }
        if !matches!(plan, Plan::FullScan) {
            return (plan, false);
        }
        let item = &scope.items[0];
        let (Some(db), Some(table_name)) = (item.db, item.table.clone()) else {
            return (plan, false);
        };
        let Ok(dbref) = self.conn.catalog.db(db) else {
            return (plan, false);
        };
        let Some(table) = dbref.schema.table(&table_name) else {
            return (plan, false);
        };
        for idx_name in &table.indices {
            let Some(index) = dbref.schema.index(idx_name) else {
                continue;
            };
            let leading: Vec<ColumnPos> = index
                .columns
                .iter()
                .take(positions.len())
                .map(|&c| ColumnPos::Idx(c))
                .collect();
            if leading == positions {
                return (
                    Plan::Index {
                        name: index.name.clone(),
                        root: index.root,
                        db,
                        eq: Vec::new(),
                        in_term: None,
                        lower: None,
                        upper: None,
                    },
                    true,
                );
            }
        }
        (plan, false)
    }

    fn emit_level(
        &mut self,
        scope: &Scope<'_>,
        item_idx: usize,
        left_outer: bool,
        plan: Plan<'_>,
        _break_label: i32,
    ) -> Result<Level> {
        let item = &scope.items[item_idx];
        let cursor = item.cursor;
        let cont_label = self.b.new_label();
        let brk_label = self.b.new_label();
        let body_label = self.b.new_label();

        // Open the base-table cursor (temp/pseudo items come pre-opened).
        if let (Some(db), Some(table_name)) = (item.db, item.table.clone()) {
            let root = self
                .conn
                .catalog
                .db(db)?
                .schema
                .table(&table_name)
                .map(|t| t.root)
                .unwrap_or(0);
            self.use_schema(db);
            self.b.emit(Opcode::Integer, db as i32, 0);
            self.b
                .emit3(Opcode::OpenRead, cursor, root, Operand::Text(table_name.to_string()));
        }

        let left_join_cell = if left_outer {
            let cell = self.alloc_mem();
            self.b.emit(Opcode::Integer, 0, 0);
            self.b.emit(Opcode::MemStore, cell, 1);
            Some(cell)
        } else {
            None
        };

        let tail = match plan {
            Plan::FullScan => {
                self.b.emit(Opcode::Rewind, cursor, brk_label);
                let top = self.b.current_addr() as i32;
                Tail::Scan { cursor, top }
            }
            Plan::RowidEq(rhs) => {
                self.code_expr(scope, rhs)?;
                self.b.emit(Opcode::MustBeInt, 0, cont_label);
                self.b.emit(Opcode::NotExists, cursor, cont_label);
                Tail::Single
            }
            Plan::RowidIn(src) => {
                let set = self.code_in_source(scope, src)?;
                self.b.emit(Opcode::SetFirst, set, brk_label);
                let in_top = self.b.current_addr() as i32;
                self.b.emit(Opcode::MustBeInt, 0, cont_label);
                self.b.emit(Opcode::NotExists, cursor, cont_label);
                Tail::InRowid { set, in_top }
            }
            Plan::RowidRange { lower, upper } => {
                let upper_cell = upper
                    .map(|(expr, inclusive)| {
                        self.code_expr(scope, expr)?;
                        self.b.emit(Opcode::MustBeInt, 0, brk_label);
                        if inclusive {
                            self.b.emit(Opcode::AddImm, 1, 0);
                        }
                        let cell = self.alloc_mem();
                        self.b.emit(Opcode::MemStore, cell, 1);
                        Ok::<i32, crate::errors::Error>(cell)
                    })
                    .transpose()?;
                match lower {
                    Some((expr, inclusive)) => {
                        self.code_expr(scope, expr)?;
                        self.b.emit(Opcode::MustBeInt, 0, brk_label);
                        if !inclusive {
                            self.b.emit(Opcode::AddImm, 1, 0);
                        }
                        self.b.emit(Opcode::MoveTo, cursor, brk_label);
                    }
                    None => {
                        self.b.emit(Opcode::Rewind, cursor, brk_label);
                    }
                }
                let top = self.b.current_addr() as i32;
                if let Some(cell) = upper_cell {
                    // Exit once the current row id reaches the bound.
                    self.b.emit(Opcode::Recno, cursor, 0);
                    self.b.emit(Opcode::MemLoad, cell, 0);
                    self.b.emit(Opcode::Ge, 0, brk_label);
                }
                Tail::Scan { cursor, top }
            }
            Plan::Index {
                name,
                root,
                db,
                eq,
                in_term,
                lower,
                upper,
            } => {
                let idx_cursor = self.alloc_cursor();
                self.b.emit(Opcode::Integer, db as i32, 0);
                self.b
                    .emit3(Opcode::OpenRead, idx_cursor, root, Operand::Text(name.to_string()));

                let n_eq = eq.len();
                let (set, in_cell) = match in_term {
                    Some(src) => {
                        let set = self.code_in_source(scope, src)?;
                        let cell = self.alloc_mem();
                        (Some(set), Some(cell))
                    }
                    None => (None, None),
                };

                // Upper bound key into a cell: eq prefix + optional bound.
                let upper_cell = self.alloc_mem();
                let emit_bounds = |c: &mut Compiler<'_>,
                                   scope: &Scope<'_>,
                                   in_cell: Option<i32>|
                 -> Result<()> {
                    for rhs in &eq {
                        c.code_expr(scope, rhs)?;
                    }
                    if let Some(cell) = in_cell {
                        c.b.emit(Opcode::MemLoad, cell, 0);
                    }
                    let mut n_upper = n_eq + usize::from(in_cell.is_some());
                    match upper {
                        Some((expr, inclusive)) => {
                            c.code_expr(scope, expr)?;
                            n_upper += 1;
                            c.b.emit3(
                                Opcode::MakeKey,
                                n_upper as i32,
                                0,
                                Operand::Layout(KeyLayout::ascending(n_upper)),
                            );
                            if inclusive {
                                c.b.emit(Opcode::IncrKey, 0, 0);
                            }
                        }
                        None => {
                            c.b.emit3(
                                Opcode::MakeKey,
                                n_upper as i32,
                                0,
                                Operand::Layout(KeyLayout::ascending(n_upper)),
                            );
                            c.b.emit(Opcode::IncrKey, 0, 0);
                        }
                    }
                    c.b.emit(Opcode::MemStore, upper_cell, 1);
                    Ok(())
                };

                // With an IN term, bound hits and failed seeks advance the
                // IN iteration rather than the row loop.
                let (in_top, seek_brk) = match (set, in_cell) {
                    (Some(set), Some(cell)) => {
                        let value_done = self.b.new_label();
                        self.b.emit(Opcode::SetFirst, set, brk_label);
                        let in_top = self.b.current_addr() as i32;
                        self.b.emit(Opcode::MemStore, cell, 1);
                        (Some((set, in_top, value_done)), value_done)
                    }
                    _ => (None, brk_label),
                };

                emit_bounds(self, scope, in_cell)?;

                // Lower bound: eq prefix (+ IN value) + optional bound.
                for rhs in &eq {
                    self.code_expr(scope, rhs)?;
                }
                if let Some(cell) = in_cell {
                    self.b.emit(Opcode::MemLoad, cell, 0);
                }
                let mut n_lower = n_eq + usize::from(in_cell.is_some());
                if let Some((expr, inclusive)) = lower {
                    self.code_expr(scope, expr)?;
                    n_lower += 1;
                    self.b.emit3(
                        Opcode::MakeKey,
                        n_lower as i32,
                        0,
                        Operand::Layout(KeyLayout::ascending(n_lower)),
                    );
                    if !inclusive {
                        self.b.emit(Opcode::IncrKey, 0, 0);
                    }
                } else {
                    self.b.emit3(
                        Opcode::MakeKey,
                        n_lower as i32,
                        0,
                        Operand::Layout(KeyLayout::ascending(n_lower)),
                    );
                }
                self.b.emit(Opcode::MoveTo, idx_cursor, seek_brk);
                let inner_top = self.b.current_addr() as i32;
                self.b.emit(Opcode::MemLoad, upper_cell, 0);
                self.b.emit(Opcode::IdxGE, idx_cursor, seek_brk);
                self.b.emit(Opcode::IdxRecno, idx_cursor, 0);
                self.b.emit(Opcode::MoveTo, cursor, cont_label);

                match in_top {
                    Some((set, in_top, value_done)) => Tail::InIdx {
                        idx: idx_cursor,
                        inner_top,
                        set,
                        in_top,
                        value_done,
                    },
                    None => Tail::Scan {
                        cursor: idx_cursor,
                        top: inner_top,
                    },
                }
            }
        };

        let idx_cursor = match &tail {
            Tail::InIdx { idx, .. } => Some(*idx),
            Tail::Scan { cursor: c, .. } if *c != cursor => Some(*c),
            _ => None,
        };

        Ok(Level {
            cursor,
            idx_cursor,
            tail,
            cont_label,
            brk_label,
            left_join_cell,
            body_label,
        })
    }

    fn code_in_source(&mut self, scope: &Scope<'_>, src: InSrc<'_>) -> Result<i32> {
        match src {
            InSrc::List(items) => {
                let set = self.alloc_set();
                let once = self.alloc_mem();
                let skip = self.b.new_label();
                self.b.emit(Opcode::MemLoad, once, 0);
                self.b.emit(Opcode::If, 0, skip);
                for item in items {
                    self.code_expr(scope, item)?;
                    self.b.emit(Opcode::SetInsert, set, 0);
                }
                self.b.emit(Opcode::Integer, 1, 0);
                self.b.emit(Opcode::MemStore, once, 1);
                self.b.resolve_label(skip);
                Ok(set)
            }
            InSrc::Select(select) => {
                let set = self.alloc_set();
                let once = self.alloc_mem();
                let skip = self.b.new_label();
                self.b.emit(Opcode::MemLoad, once, 0);
                self.b.emit(Opcode::If, 0, skip);
                super::select::compile_select(
                    self,
                    select,
                    super::select::Dest::Set(set),
                    Some(scope),
                )?;
                self.b.emit(Opcode::Integer, 1, 0);
                self.b.emit(Opcode::MemStore, once, 1);
                self.b.resolve_label(skip);
                Ok(set)
            }
        }
    }

    /// Close the loops opened by [`Compiler::where_begin`], innermost
    /// first, with the left-join NULL-row synthesis at each level's
    /// exhaustion point.
    pub(crate) fn where_end(&mut self, ctx: WhereCtx) {
        for level in ctx.levels.iter().rev() {
            self.b.resolve_label(level.cont_label);
            match &level.tail {
                Tail::Single => {}
                Tail::Scan { cursor, top } => {
                    self.b.emit(Opcode::Next, *cursor, *top);
                }
                Tail::InRowid { set, in_top } => {
                    self.b.emit(Opcode::SetNext, *set, *in_top);
                }
                Tail::InIdx {
                    idx,
                    inner_top,
                    set,
                    in_top,
                    value_done,
                } => {
                    self.b.emit(Opcode::Next, *idx, *inner_top);
                    self.b.resolve_label(*value_done);
                    self.b.emit(Opcode::SetNext, *set, *in_top);
                }
            }
            self.b.resolve_label(level.brk_label);
            if let Some(cell) = level.left_join_cell {
                let matched = self.b.new_label();
                self.b.emit(Opcode::MemLoad, cell, 0);
                self.b.emit(Opcode::If, 0, matched);
                self.b.emit(Opcode::NullRow, level.cursor, 0);
                if let Some(idx) = level.idx_cursor {
                    self.b.emit(Opcode::NullRow, idx, 0);
                }
                self.b.emit(Opcode::Integer, 1, 0);
                self.b.emit(Opcode::MemStore, cell, 1);
                self.b.emit(Opcode::Goto, 0, level.body_label);
                self.b.resolve_label(matched);
            }
            if let Some(idx) = level.idx_cursor {
                self.b.emit(Opcode::Close, idx, 0);
            }
        }
        self.b.resolve_label(ctx.break_label);
    }
}
