//! Expression lowering. Every expression leaves exactly one value on the
//! VDBE stack. Comparison opcodes double as jump instructions; here they
//! are used in push mode except where a special form wants the jump.

use crate::ast::{BinaryOp, ColumnPos, Expr, RaiseKind, UnaryOp};
use crate::auth::{AuthAction, AuthResult};
use crate::errors::{Error, ErrorCode, Result};
use crate::func::FuncDef;
use crate::vdbe::{HALT_ABORT, HALT_FAIL, HALT_ROLLBACK, Opcode, Operand};

use super::select::Dest;
use super::{Compiler, Scope};

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Subtract => Opcode::Subtract,
        BinaryOp::Multiply => Opcode::Multiply,
        BinaryOp::Divide => Opcode::Divide,
        BinaryOp::Remainder => Opcode::Remainder,
        BinaryOp::Concat => Opcode::Concat,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
        BinaryOp::BitAnd => Opcode::BitAnd,
        BinaryOp::BitOr => Opcode::BitOr,
        BinaryOp::ShiftLeft => Opcode::ShiftLeft,
        BinaryOp::ShiftRight => Opcode::ShiftRight,
    }
}

impl<'a> Compiler<'a> {
    /// Emit code that pushes the value of `expr`.
    pub(crate) fn code_expr(&mut self, scope: &Scope<'_>, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Null => {
                self.b.emit(Opcode::Null, 0, 0);
            }
            Expr::Integer(value) => {
                if let Ok(small) = i32::try_from(*value) {
                    self.b.emit(Opcode::Integer, small, 0);
                } else {
                    self.b
                        .emit3(Opcode::Integer, 0, 0, Operand::Text(value.to_string()));
                }
            }
            Expr::Float(value) => {
                self.b.emit3(Opcode::Real, 0, 0, Operand::Real(*value));
            }
            Expr::String(value) => {
                self.b
                    .emit3(Opcode::String, 0, 0, Operand::Text(value.clone()));
            }
            Expr::Parameter(index) => {
                self.b.emit(Opcode::Variable, *index as i32, 0);
            }
            Expr::Name(name) => self.code_column(scope, None, None, name)?,
            Expr::Qualified(table, column) => {
                self.code_column(scope, None, Some(table), column)?;
            }
            Expr::DbQualified(db, table, column) => {
                self.code_column(scope, Some(db), Some(table), column)?;
            }
            Expr::Column(col) => {
                // Pre-resolved reference (compiler-internal).
                let item = scope.item(col.level, col.src);
                match col.column {
                    ColumnPos::Rowid => {
                        self.b.emit(Opcode::Recno, item.cursor, 0);
                    }
                    ColumnPos::Idx(i) => {
                        self.b.emit(Opcode::Column, item.cursor, i as i32);
                    }
                }
            }
            Expr::AggRef(slot) => {
                self.b.emit(Opcode::AggGet, 0, *slot as i32);
            }
            Expr::Unary(op, operand) => {
                self.code_expr(scope, operand)?;
                let opcode = match op {
                    UnaryOp::Negate => Opcode::Negative,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::BitNot => Opcode::BitNot,
                };
                self.b.emit(opcode, 0, 0);
            }
            Expr::Binary(lhs, op, rhs) => {
                self.code_expr(scope, lhs)?;
                self.code_expr(scope, rhs)?;
                let opcode = binary_opcode(*op);
                if opcode == Opcode::Concat {
                    self.b.emit(Opcode::Concat, 2, 0);
                } else {
                    self.b.emit(opcode, 0, 0);
                }
            }
            Expr::IsNull { expr, negated } => {
                self.code_expr(scope, expr)?;
                let yes = self.b.new_label();
                let done = self.b.new_label();
                self.b.emit(Opcode::IsNull, 0, yes);
                self.b.emit(Opcode::Pop, 1, 0);
                self.b
                    .emit(Opcode::Integer, if *negated { 1 } else { 0 }, 0);
                self.b.emit(Opcode::Goto, 0, done);
                self.b.resolve_label(yes);
                self.b.emit(Opcode::Pop, 1, 0);
                self.b
                    .emit(Opcode::Integer, if *negated { 0 } else { 1 }, 0);
                self.b.resolve_label(done);
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                self.code_expr(scope, expr)?;
                self.b.emit(Opcode::Dup, 0, 0);
                self.code_expr(scope, low)?;
                self.b.emit(Opcode::Ge, 0, 0);
                self.b.emit(Opcode::Pull, 1, 0);
                self.code_expr(scope, high)?;
                self.b.emit(Opcode::Le, 0, 0);
                self.b.emit(Opcode::And, 0, 0);
                if *negated {
                    self.b.emit(Opcode::Not, 0, 0);
                }
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                self.code_expr(scope, expr)?;
                let is_null = self.b.new_label();
                let matched = self.b.new_label();
                let done = self.b.new_label();
                self.b.emit(Opcode::IsNull, 0, is_null);
                for item in list {
                    self.b.emit(Opcode::Dup, 0, 0);
                    self.code_expr(scope, item)?;
                    self.b.emit(Opcode::Eq, 0, matched);
                }
                self.b.emit(Opcode::Pop, 1, 0);
                self.b
                    .emit(Opcode::Integer, if *negated { 1 } else { 0 }, 0);
                self.b.emit(Opcode::Goto, 0, done);
                self.b.resolve_label(matched);
                self.b.emit(Opcode::Pop, 1, 0);
                self.b
                    .emit(Opcode::Integer, if *negated { 0 } else { 1 }, 0);
                self.b.emit(Opcode::Goto, 0, done);
                self.b.resolve_label(is_null);
                self.b.emit(Opcode::Pop, 1, 0);
                self.b.emit(Opcode::Null, 0, 0);
                self.b.resolve_label(done);
            }
            Expr::InSelect {
                expr,
                select,
                negated,
            } => {
                let set = self.code_subquery_set(scope, select)?;
                self.code_expr(scope, expr)?;
                let is_null = self.b.new_label();
                let matched = self.b.new_label();
                let done = self.b.new_label();
                self.b.emit(Opcode::IsNull, 0, is_null);
                self.b.emit(Opcode::SetFound, set, matched);
                self.b
                    .emit(Opcode::Integer, if *negated { 1 } else { 0 }, 0);
                self.b.emit(Opcode::Goto, 0, done);
                self.b.resolve_label(matched);
                self.b
                    .emit(Opcode::Integer, if *negated { 0 } else { 1 }, 0);
                self.b.emit(Opcode::Goto, 0, done);
                self.b.resolve_label(is_null);
                self.b.emit(Opcode::Pop, 1, 0);
                self.b.emit(Opcode::Null, 0, 0);
                self.b.resolve_label(done);
            }
            Expr::Select(select) => {
                let cell = self.code_subquery_value(scope, select)?;
                self.b.emit(Opcode::MemLoad, cell, 0);
            }
            Expr::Function { name, args, star } => {
                self.code_function(scope, name, args, *star)?;
            }
            Expr::Case {
                base,
                whens,
                else_expr,
            } => {
                self.code_case(scope, base.as_deref(), whens, else_expr.as_deref())?;
            }
            Expr::Raise(kind) => self.code_raise(kind)?,
        }
        Ok(())
    }

    fn code_column(
        &mut self,
        scope: &Scope<'_>,
        db: Option<&str>,
        table: Option<&str>,
        column: &str,
    ) -> Result<()> {
        // A database qualifier narrows the table qualifier; resolution is
        // by alias, so `db.t.c` must match an item aliased `t` owned by
        // that database.
        let (level, resolved) = scope.resolve(table, column)?;
        let item = scope.item(level, resolved.item_idx);
        if let Some(db_name) = db {
            let slot = self
                .conn
                .catalog
                .slot_by_name(db_name)
                .ok_or_else(|| Error::sql(format!("no such database: {db_name}")))?;
            if item.db != Some(slot) {
                return Err(Error::sql(format!(
                    "no such column: {db_name}.{}.{column}",
                    table.unwrap_or("?")
                )));
            }
        }
        if let (Some(db_idx), Some(table_name)) = (item.db, item.table.clone()) {
            let verdict = self.authorize(
                AuthAction::Read,
                Some(table_name.as_str()),
                Some(column),
                Some(db_idx),
            )?;
            if verdict == AuthResult::Ignore {
                self.b.emit(Opcode::Null, 0, 0);
                return Ok(());
            }
        }
        let item = scope.item(level, resolved.item_idx);
        match (item.cells, resolved.pos) {
            (Some(base), ColumnPos::Idx(i)) => {
                self.b.emit(Opcode::MemLoad, base + i as i32, 0);
            }
            (Some(base), ColumnPos::Rowid) => {
                // Cell windows store the row id one past the columns.
                self.b
                    .emit(Opcode::MemLoad, base + item.columns.len() as i32, 0);
            }
            (None, ColumnPos::Rowid) => {
                self.b.emit(Opcode::Recno, item.cursor, 0);
            }
            (None, ColumnPos::Idx(i)) => {
                self.b.emit(Opcode::Column, item.cursor, i as i32);
            }
        }
        Ok(())
    }

    fn code_function(
        &mut self,
        scope: &Scope<'_>,
        name: &str,
        args: &[Expr],
        star: bool,
    ) -> Result<()> {
        let argc = if star { 0 } else { args.len() as i32 };
        let def = self.lookup_function(name, argc)?;
        if def.is_aggregate() {
            return Err(Error::sql(format!(
                "misuse of aggregate function {name}()"
            )));
        }
        for arg in args {
            self.code_expr(scope, arg)?;
        }
        self.b
            .emit3(Opcode::Function, argc, 0, Operand::Func(def));
        Ok(())
    }

    pub(crate) fn lookup_function(
        &mut self,
        name: &str,
        argc: i32,
    ) -> Result<std::sync::Arc<FuncDef>> {
        self.conn
            .funcs
            .find(name, argc)
            .ok_or_else(|| Error::sql(format!("no such function: {name}")))
    }

    fn code_case(
        &mut self,
        scope: &Scope<'_>,
        base: Option<&Expr>,
        whens: &[(Expr, Expr)],
        else_expr: Option<&Expr>,
    ) -> Result<()> {
        let done = self.b.new_label();
        match base {
            Some(base) => {
                self.code_expr(scope, base)?;
                for (when, then) in whens {
                    let next = self.b.new_label();
                    self.b.emit(Opcode::Dup, 0, 0);
                    self.code_expr(scope, when)?;
                    let hit = self.b.new_label();
                    self.b.emit(Opcode::Eq, 0, hit);
                    self.b.emit(Opcode::Goto, 0, next);
                    self.b.resolve_label(hit);
                    self.b.emit(Opcode::Pop, 1, 0);
                    self.code_expr(scope, then)?;
                    self.b.emit(Opcode::Goto, 0, done);
                    self.b.resolve_label(next);
                }
                self.b.emit(Opcode::Pop, 1, 0);
            }
            None => {
                for (when, then) in whens {
                    let next = self.b.new_label();
                    self.code_expr(scope, when)?;
                    self.b.emit(Opcode::IfNot, 0, next);
                    self.code_expr(scope, then)?;
                    self.b.emit(Opcode::Goto, 0, done);
                    self.b.resolve_label(next);
                }
            }
        }
        match else_expr {
            Some(e) => self.code_expr(scope, e)?,
            None => {
                self.b.emit(Opcode::Null, 0, 0);
            }
        }
        self.b.resolve_label(done);
        Ok(())
    }

    fn code_raise(&mut self, kind: &RaiseKind) -> Result<()> {
        let Some(ignore_label) = self.ignore_label else {
            return Err(Error::sql("RAISE() may only be used within a trigger"));
        };
        match kind {
            RaiseKind::Ignore => {
                self.b.emit(Opcode::Goto, 0, ignore_label);
                // The expression still must leave a value for any
                // enclosing context that is never reached.
                self.b.emit(Opcode::Null, 0, 0);
            }
            RaiseKind::Rollback(msg) => {
                self.b.emit3(
                    Opcode::Halt,
                    ErrorCode::Constraint as i32,
                    HALT_ROLLBACK,
                    Operand::Text(msg.clone()),
                );
                self.b.emit(Opcode::Null, 0, 0);
            }
            RaiseKind::Abort(msg) => {
                self.b.emit3(
                    Opcode::Halt,
                    ErrorCode::Constraint as i32,
                    HALT_ABORT,
                    Operand::Text(msg.clone()),
                );
                self.b.emit(Opcode::Null, 0, 0);
            }
            RaiseKind::Fail(msg) => {
                self.b.emit3(
                    Opcode::Halt,
                    ErrorCode::Constraint as i32,
                    HALT_FAIL,
                    Operand::Text(msg.clone()),
                );
                self.b.emit(Opcode::Null, 0, 0);
            }
        }
        Ok(())
    }

    /// Materialise `IN (SELECT ...)` into a set, once per execution,
    /// guarded by a memory cell.
    fn code_subquery_set(&mut self, scope: &Scope<'_>, select: &crate::ast::Select) -> Result<i32> {
        let set = self.alloc_set();
        let once = self.alloc_mem();
        let skip = self.b.new_label();
        self.b.emit(Opcode::MemLoad, once, 0);
        self.b.emit(Opcode::If, 0, skip);
        super::select::compile_select(self, select, Dest::Set(set), Some(scope))?;
        self.b.emit(Opcode::Integer, 1, 0);
        self.b.emit(Opcode::MemStore, once, 1);
        self.b.resolve_label(skip);
        Ok(set)
    }

    /// Scalar subquery: first row, first column, NULL when empty.
    fn code_subquery_value(
        &mut self,
        scope: &Scope<'_>,
        select: &crate::ast::Select,
    ) -> Result<i32> {
        let cell = self.alloc_mem();
        let once = self.alloc_mem();
        let skip = self.b.new_label();
        self.b.emit(Opcode::MemLoad, once, 0);
        self.b.emit(Opcode::If, 0, skip);
        self.b.emit(Opcode::Null, 0, 0);
        self.b.emit(Opcode::MemStore, cell, 1);
        super::select::compile_select(self, select, Dest::Mem(cell), Some(scope))?;
        self.b.emit(Opcode::Integer, 1, 0);
        self.b.emit(Opcode::MemStore, once, 1);
        self.b.resolve_label(skip);
        Ok(cell)
    }
}
