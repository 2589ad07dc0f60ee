//! AST walking utilities and the reference normaliser: the compile-time
//! pass that keeps triggers, views and indices from smuggling references
//! into other databases. Unqualified names inside such objects bind to the
//! object's home database when they are compiled; explicit qualifiers must
//! name the home database (or the object must live in temp, which may see
//! everything).

use smol_str::SmolStr;

use crate::ast::{Expr, ResultColumn, Select, TriggerStep};
use crate::errors::{Error, Result};
use crate::schema::TEMP_DB;

/// Visit every sub-expression of `expr`, outside-in.
pub fn walk_expr(expr: &Expr, f: &mut impl FnMut(&Expr) -> Result<()>) -> Result<()> {
    f(expr)?;
    match expr {
        Expr::Unary(_, e) => walk_expr(e, f)?,
        Expr::Binary(l, _, r) => {
            walk_expr(l, f)?;
            walk_expr(r, f)?;
        }
        Expr::IsNull { expr, .. } => walk_expr(expr, f)?,
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, f)?;
            walk_expr(low, f)?;
            walk_expr(high, f)?;
        }
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, f)?;
            for e in list {
                walk_expr(e, f)?;
            }
        }
        Expr::InSelect { expr, select, .. } => {
            walk_expr(expr, f)?;
            walk_select_exprs(select, f)?;
        }
        Expr::Function { args, .. } => {
            for e in args {
                walk_expr(e, f)?;
            }
        }
        Expr::Case {
            base,
            whens,
            else_expr,
        } => {
            if let Some(base) = base {
                walk_expr(base, f)?;
            }
            for (when, then) in whens {
                walk_expr(when, f)?;
                walk_expr(then, f)?;
            }
            if let Some(e) = else_expr {
                walk_expr(e, f)?;
            }
        }
        Expr::Select(select) => walk_select_exprs(select, f)?,
        _ => {}
    }
    Ok(())
}

/// Visit every expression of a select, including compound arms and
/// subqueries in FROM.
pub fn walk_select_exprs(
    select: &Select,
    f: &mut impl FnMut(&Expr) -> Result<()>,
) -> Result<()> {
    for column in &select.columns {
        if let ResultColumn::Expr { expr, .. } = column {
            walk_expr(expr, f)?;
        }
    }
    for item in &select.from {
        if let Some(subquery) = &item.subquery {
            walk_select_exprs(subquery, f)?;
        }
        if let Some(on) = &item.on_clause {
            walk_expr(on, f)?;
        }
    }
    if let Some(where_clause) = &select.where_clause {
        walk_expr(where_clause, f)?;
    }
    for e in &select.group_by {
        walk_expr(e, f)?;
    }
    if let Some(having) = &select.having {
        walk_expr(having, f)?;
    }
    for item in &select.order_by {
        walk_expr(&item.expr, f)?;
    }
    if let Some((_, prior)) = &select.compound {
        walk_select_exprs(prior, f)?;
    }
    Ok(())
}

fn check_qualifier(
    object_kind: &str,
    home_db: usize,
    home_db_name: &str,
    qualifier: &str,
) -> Result<()> {
    if home_db == TEMP_DB || qualifier.eq_ignore_ascii_case(home_db_name) {
        return Ok(());
    }
    Err(Error::sql(format!(
        "{object_kind} cannot reference objects in database {qualifier}"
    )))
}

fn check_select(
    object_kind: &str,
    home_db: usize,
    home_db_name: &str,
    select: &Select,
) -> Result<()> {
    for item in &select.from {
        if let Some(db) = &item.database {
            check_qualifier(object_kind, home_db, home_db_name, db)?;
        }
        if let Some(subquery) = &item.subquery {
            check_select(object_kind, home_db, home_db_name, subquery)?;
        }
    }
    if let Some((_, prior)) = &select.compound {
        check_select(object_kind, home_db, home_db_name, prior)?;
    }
    walk_select_exprs(&select.clone_without_compound(), &mut |expr| {
        if let Expr::DbQualified(db, _, _) = expr {
            check_qualifier(object_kind, home_db, home_db_name, db)?;
        }
        Ok(())
    })
}

impl Select {
    /// The compound chain is already visited explicitly by the callers in
    /// this module; cloning without it avoids double reports.
    fn clone_without_compound(&self) -> Select {
        let mut select = self.clone();
        select.compound = None;
        select
    }
}

/// Normalise a view's defining SELECT.
pub fn normalize_view(home_db: usize, home_db_name: &str, select: &Select) -> Result<()> {
    check_select("view", home_db, home_db_name, select)
}

/// Normalise a trigger body: WHEN predicate plus every step.
pub fn normalize_trigger(
    home_db: usize,
    home_db_name: &str,
    when: Option<&Expr>,
    steps: &[TriggerStep],
) -> Result<()> {
    let mut check = |expr: &Expr| {
        if let Expr::DbQualified(db, _, _) = expr {
            check_qualifier("trigger", home_db, home_db_name, db)?;
        }
        Ok(())
    };
    if let Some(when) = when {
        walk_expr(when, &mut check)?;
    }
    for step in steps {
        match step {
            TriggerStep::Select(select) => {
                check_select("trigger", home_db, home_db_name, select)?;
            }
            TriggerStep::Insert { source, .. } => match source {
                crate::ast::InsertSource::Values(rows) => {
                    for row in rows {
                        for expr in row {
                            walk_expr(expr, &mut check)?;
                        }
                    }
                }
                crate::ast::InsertSource::Select(select) => {
                    check_select("trigger", home_db, home_db_name, select)?;
                }
            },
            TriggerStep::Update {
                sets, where_clause, ..
            } => {
                for (_, expr) in sets {
                    walk_expr(expr, &mut check)?;
                }
                if let Some(w) = where_clause {
                    walk_expr(w, &mut check)?;
                }
            }
            TriggerStep::Delete { where_clause, .. } => {
                if let Some(w) = where_clause {
                    walk_expr(w, &mut check)?;
                }
            }
        }
    }
    Ok(())
}

/// Column names a view presents: aliases win, then bare column names,
/// then a positional fallback.
pub fn view_column_names(select: &Select) -> Vec<SmolStr> {
    select
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| match column {
            ResultColumn::Expr {
                alias: Some(alias), ..
            } => alias.clone(),
            ResultColumn::Expr {
                expr: Expr::Name(name),
                ..
            } => name.clone(),
            ResultColumn::Expr {
                expr: Expr::Qualified(_, name),
                ..
            } => name.clone(),
            _ => SmolStr::new(format!("column{}", i + 1)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Stmt;
    use crate::parser::Parser;
    use crate::schema::MAIN_DB;

    fn view_select(sql: &str) -> Select {
        let mut parser = Parser::new(sql);
        let Some(Stmt::Select(select)) = parser.parse_statement().unwrap() else {
            panic!("expected select");
        };
        select
    }

    #[test]
    fn cross_database_view_reference_is_rejected() {
        let select = view_select("SELECT aux.t.a FROM aux.t");
        let err = normalize_view(MAIN_DB, "main", &select).unwrap_err();
        assert!(err.message.contains("aux"));
    }

    #[test]
    fn home_database_qualifier_is_fine() {
        let select = view_select("SELECT main.t.a FROM main.t");
        normalize_view(MAIN_DB, "main", &select).unwrap();
    }

    #[test]
    fn temp_objects_may_reach_everywhere() {
        let select = view_select("SELECT a FROM main.t");
        normalize_view(TEMP_DB, "temp", &select).unwrap();
    }

    #[test]
    fn view_names_prefer_aliases() {
        let select = view_select("SELECT a AS x, b, count(*) FROM t");
        let names = view_column_names(&select);
        assert_eq!(names[0].as_str(), "x");
        assert_eq!(names[1].as_str(), "b");
        assert_eq!(names[2].as_str(), "column3");
    }
}
