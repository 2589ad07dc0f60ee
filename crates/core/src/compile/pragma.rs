//! PRAGMA lowering: schema introspection compiles to constant result
//! rows; the runtime toggles flip connection flags at compile time.

use crate::auth::AuthAction;
use crate::errors::{Error, Result};
use crate::schema::MAIN_DB;
use crate::vdbe::{Opcode, Operand};

use super::Compiler;

enum Cell {
    Int(i64),
    Text(String),
    Null,
}

fn emit_columns(c: &mut Compiler<'_>, names: &[&str]) {
    c.b.ncols = names.len();
    c.b.column_names = names.iter().map(|s| s.to_string()).collect();
    for (i, name) in names.iter().enumerate() {
        c.b.emit3(
            Opcode::ColumnName,
            i as i32,
            0,
            Operand::Text(name.to_string()),
        );
    }
}

fn emit_row(c: &mut Compiler<'_>, cells: Vec<Cell>) {
    let n = cells.len();
    for cell in cells {
        match cell {
            Cell::Int(i) => {
                if let Ok(small) = i32::try_from(i) {
                    c.b.emit(Opcode::Integer, small, 0);
                } else {
                    c.b.emit3(Opcode::Integer, 0, 0, Operand::Text(i.to_string()));
                }
            }
            Cell::Text(s) => {
                c.b.emit3(Opcode::String, 0, 0, Operand::Text(s));
            }
            Cell::Null => {
                c.b.emit(Opcode::Null, 0, 0);
            }
        }
    }
    c.b.emit(Opcode::Callback, n as i32, 0);
}

fn parse_toggle(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "on" | "true" | "yes" | "1"
    )
}

pub(crate) fn compile_pragma(
    c: &mut Compiler<'_>,
    database: Option<&str>,
    name: &str,
    value: Option<&str>,
) -> Result<()> {
    c.authorize(AuthAction::Pragma, Some(name), value, None)?;
    let db = match database {
        Some(db_name) => c
            .conn
            .catalog
            .slot_by_name(db_name)
            .ok_or_else(|| Error::sql(format!("no such database: {db_name}")))?,
        None => MAIN_DB,
    };

    match name.to_ascii_lowercase().as_str() {
        "full_column_names" => toggle(c, value, |flags| &mut flags.full_column_names),
        "show_datatypes" => toggle(c, value, |flags| &mut flags.show_datatypes),
        "count_changes" => toggle(c, value, |flags| &mut flags.count_changes),
        "empty_result_callbacks" => {
            toggle(c, value, |flags| &mut flags.empty_result_callbacks)
        }
        "database_list" => {
            emit_columns(c, &["seq", "name", "file"]);
            let rows: Vec<(usize, String, String)> = c
                .conn
                .catalog
                .slots()
                .map(|(i, db)| (i, db.name.to_string(), db.store.filename.clone()))
                .collect();
            for (seq, name, file) in rows {
                emit_row(
                    c,
                    vec![Cell::Int(seq as i64), Cell::Text(name), Cell::Text(file)],
                );
            }
            Ok(())
        }
        "table_info" => {
            let table_name = value.ok_or_else(|| Error::sql("table_info requires a table"))?;
            let table = c
                .conn
                .catalog
                .db(db)?
                .schema
                .table(table_name)
                .ok_or_else(|| Error::sql(format!("no such table: {table_name}")))?
                .clone();
            c.use_schema(db);
            emit_columns(c, &["cid", "name", "type", "notnull", "dflt_value", "pk"]);
            for (i, col) in table.columns.iter().enumerate() {
                emit_row(
                    c,
                    vec![
                        Cell::Int(i as i64),
                        Cell::Text(col.name.to_string()),
                        col.type_name
                            .clone()
                            .map(Cell::Text)
                            .unwrap_or(Cell::Null),
                        Cell::Int(i64::from(col.not_null)),
                        match &col.default {
                            Some(crate::ast::Expr::String(s)) => Cell::Text(s.clone()),
                            Some(crate::ast::Expr::Integer(i)) => Cell::Int(*i),
                            Some(_) => Cell::Text("?".to_owned()),
                            None => Cell::Null,
                        },
                        Cell::Int(i64::from(col.primary_key)),
                    ],
                );
            }
            Ok(())
        }
        "index_list" => {
            let table_name = value.ok_or_else(|| Error::sql("index_list requires a table"))?;
            let table = c
                .conn
                .catalog
                .db(db)?
                .schema
                .table(table_name)
                .ok_or_else(|| Error::sql(format!("no such table: {table_name}")))?
                .clone();
            c.use_schema(db);
            emit_columns(c, &["seq", "name", "unique"]);
            let uniques: Vec<(String, bool)> = table
                .indices
                .iter()
                .filter_map(|idx| {
                    c.conn
                        .catalog
                        .db(db)
                        .ok()
                        .and_then(|d| d.schema.index(idx))
                        .map(|i| (i.name.to_string(), i.is_unique()))
                })
                .collect();
            for (seq, (name, unique)) in uniques.into_iter().enumerate() {
                emit_row(
                    c,
                    vec![
                        Cell::Int(seq as i64),
                        Cell::Text(name),
                        Cell::Int(i64::from(unique)),
                    ],
                );
            }
            Ok(())
        }
        "index_info" => {
            let index_name = value.ok_or_else(|| Error::sql("index_info requires an index"))?;
            let (db, index) = c.conn.catalog.find_index(database, index_name)?;
            let index = index.clone();
            let table = c
                .conn
                .catalog
                .db(db)?
                .schema
                .table(&index.table)
                .ok_or_else(|| Error::internal("index without table"))?
                .clone();
            c.use_schema(db);
            emit_columns(c, &["seqno", "cid", "name"]);
            for (seqno, &cid) in index.columns.iter().enumerate() {
                emit_row(
                    c,
                    vec![
                        Cell::Int(seqno as i64),
                        Cell::Int(cid as i64),
                        Cell::Text(table.columns[cid].name.to_string()),
                    ],
                );
            }
            Ok(())
        }
        "foreign_key_list" => {
            let table_name =
                value.ok_or_else(|| Error::sql("foreign_key_list requires a table"))?;
            let table = c
                .conn
                .catalog
                .db(db)?
                .schema
                .table(table_name)
                .ok_or_else(|| Error::sql(format!("no such table: {table_name}")))?
                .clone();
            c.use_schema(db);
            emit_columns(c, &["id", "seq", "table", "from", "to"]);
            for (id, fkey) in table.foreign_keys.iter().enumerate() {
                for (seq, from) in fkey.columns.iter().enumerate() {
                    emit_row(
                        c,
                        vec![
                            Cell::Int(id as i64),
                            Cell::Int(seq as i64),
                            Cell::Text(fkey.foreign_table.to_string()),
                            Cell::Text(from.to_string()),
                            fkey.foreign_columns
                                .get(seq)
                                .map(|to| Cell::Text(to.to_string()))
                                .unwrap_or(Cell::Null),
                        ],
                    );
                }
            }
            Ok(())
        }
        // Unknown pragmas are accepted and ignored.
        _ => Ok(()),
    }
}

fn toggle(
    c: &mut Compiler<'_>,
    value: Option<&str>,
    field: impl Fn(&mut crate::session::RuntimeFlags) -> &mut bool,
) -> Result<()> {
    match value {
        Some(value) => {
            *field(&mut c.conn.flags) = parse_toggle(value);
        }
        None => {
            let current = *field(&mut c.conn.flags);
            emit_columns(c, &["value"]);
            emit_row(c, vec![Cell::Int(i64::from(current))]);
        }
    }
    Ok(())
}
