//! DDL lowering. Schema changes run through the program like any other
//! write: the new container is allocated, the master-table row written,
//! the schema cookie bumped, and the in-memory catalog reloaded before
//! the statement commits.

use smol_str::SmolStr;

use crate::ast::{ConflictAction, DropKind, QualName, Stmt, TriggerEvent, TxnMode};
use crate::auth::{AuthAction, AuthResult};
use crate::catalog;
use crate::errors::{Error, Result};
use crate::resolve;
use crate::schema::{MAIN_DB, TEMP_DB, master_name};
use crate::store::MASTER_ROOT;
use crate::vdbe::key::KeyLayout;
use crate::vdbe::{Opcode, Operand};

use super::Compiler;

pub(crate) fn compile_ddl(c: &mut Compiler<'_>, stmt: &Stmt) -> Result<()> {
    match stmt {
        Stmt::CreateTable {
            temp,
            name,
            columns,
            constraints,
        } => create_table(c, *temp, name, columns, constraints),
        Stmt::CreateIndex {
            unique,
            conflict,
            name,
            table,
            columns,
        } => create_index(c, *unique, *conflict, name, table, columns),
        Stmt::CreateView { temp, name, select } => create_view(c, *temp, name, select),
        Stmt::CreateTrigger {
            temp,
            name,
            timing,
            event,
            table,
            for_each_row,
            when,
            steps,
        } => create_trigger(
            c,
            *temp,
            name,
            *timing,
            event,
            table,
            *for_each_row,
            when.as_ref(),
            steps,
        ),
        Stmt::Drop { kind, name } => drop_object(c, *kind, name),
        Stmt::Attach { filename, db_name } => attach(c, filename, db_name),
        Stmt::Detach { db_name } => detach(c, db_name),
        Stmt::Begin(mode) => begin_txn(c, *mode),
        Stmt::Commit => end_txn(c, Opcode::Commit),
        Stmt::Rollback => end_txn(c, Opcode::Rollback),
        Stmt::Vacuum(_) => {
            // Storage reclamation is the backend's business; the statement
            // succeeds without touching anything.
            c.b.emit(Opcode::Vacuum, 0, 0);
            Ok(())
        }
        _ => Err(Error::internal("not a DDL statement")),
    }
}

fn target_db(c: &Compiler<'_>, temp: bool, name: &QualName) -> Result<usize> {
    if temp {
        if name.database.is_some() {
            return Err(Error::sql("temporary objects cannot specify a database"));
        }
        return Ok(TEMP_DB);
    }
    match &name.database {
        Some(db) => c
            .conn
            .catalog
            .slot_by_name(db)
            .ok_or_else(|| Error::sql(format!("no such database: {db}"))),
        None => Ok(MAIN_DB),
    }
}

fn check_name_free(c: &Compiler<'_>, db: usize, name: &str, kind: &str) -> Result<()> {
    if name.eq_ignore_ascii_case(master_name(db)) || name.to_lowercase().starts_with("squill_") {
        return Err(Error::sql(format!(
            "object name reserved for internal use: {name}"
        )));
    }
    if c.conn.catalog.db(db)?.schema.name_in_use(name) {
        return Err(Error::sql(format!("{kind} {name} already exists")));
    }
    Ok(())
}

/// Open a write cursor on `db`'s master table and return it.
fn open_master(c: &mut Compiler<'_>, db: usize) -> i32 {
    let cur = c.alloc_cursor();
    c.b.emit(Opcode::Integer, db as i32, 0);
    c.b.emit3(
        Opcode::OpenWrite,
        cur,
        MASTER_ROOT,
        Operand::Static("master"),
    );
    cur
}

/// Append one master-table row. `root_cell` < 0 pushes literal 0 for
/// objects without storage; `sql` is None for auto-index rows.
fn write_master_row(
    c: &mut Compiler<'_>,
    mcur: i32,
    kind: &'static str,
    name: &str,
    tbl_name: &str,
    root_cell: Option<i32>,
    sql: Option<&str>,
) {
    c.b.emit(Opcode::NewRecno, mcur, 0);
    c.b.emit3(Opcode::String, 0, 0, Operand::Static(kind));
    c.b.emit3(Opcode::String, 0, 0, Operand::Text(name.to_owned()));
    c.b.emit3(Opcode::String, 0, 0, Operand::Text(tbl_name.to_owned()));
    match root_cell {
        Some(cell) => {
            c.b.emit(Opcode::MemLoad, cell, 0);
        }
        None => {
            c.b.emit(Opcode::Integer, 0, 0);
        }
    }
    match sql {
        Some(sql) => {
            c.b.emit3(Opcode::String, 0, 0, Operand::Text(sql.to_owned()));
        }
        None => {
            c.b.emit(Opcode::Null, 0, 0);
        }
    }
    c.b.emit(Opcode::MakeRecord, 5, 0);
    c.b.emit(Opcode::PutIntKey, mcur, 0);
}

fn bump_schema(c: &mut Compiler<'_>, db: usize) {
    let sig = c.conn.catalog.db(db).map(|d| d.schema_sig).unwrap_or(0);
    c.b.emit(Opcode::SetCookie, db as i32, sig.wrapping_add(1) as i32);
    c.b.emit(Opcode::ReloadSchema, db as i32, 0);
}

fn create_table(
    c: &mut Compiler<'_>,
    temp: bool,
    name: &QualName,
    columns: &[crate::ast::ColumnDef],
    constraints: &[crate::ast::TableConstraint],
) -> Result<()> {
    let db = target_db(c, temp, name)?;
    c.authorize(
        c.create_action(AuthAction::CreateTable, db),
        Some(name.name.as_str()),
        None,
        Some(db),
    )?;
    check_name_free(c, db, &name.name, "table")?;
    // Validation only; the objects are instated by the schema reload.
    let (_table, autos) = catalog::build_table(db, &name.name, columns, constraints, 0)?;

    c.use_schema(db);
    c.begin_write(db);
    let mcur = open_master(c, db);

    let root_cell = c.alloc_mem();
    c.b.emit(Opcode::CreateTable, db as i32, 0);
    c.b.emit(Opcode::MemStore, root_cell, 1);
    let sql = c.sql_text.clone();
    write_master_row(
        c,
        mcur,
        "table",
        &name.name,
        &name.name,
        Some(root_cell),
        Some(&sql),
    );
    for auto in &autos {
        let idx_root = c.alloc_mem();
        c.b.emit(Opcode::CreateIndex, db as i32, 0);
        c.b.emit(Opcode::MemStore, idx_root, 1);
        write_master_row(c, mcur, "index", &auto.name, &name.name, Some(idx_root), None);
    }
    c.b.emit(Opcode::Close, mcur, 0);
    bump_schema(c, db);
    Ok(())
}

fn create_index(
    c: &mut Compiler<'_>,
    unique: bool,
    conflict: Option<ConflictAction>,
    name: &QualName,
    table_name: &SmolStr,
    columns: &[SmolStr],
) -> Result<()> {
    let (db, table) = c.conn.catalog.find_table(None, table_name)?;
    let table = table.clone();
    if let Some(qual) = &name.database {
        let slot = c
            .conn
            .catalog
            .slot_by_name(qual)
            .ok_or_else(|| Error::sql(format!("no such database: {qual}")))?;
        if slot != db {
            return Err(Error::sql(
                "index and table must live in the same database",
            ));
        }
    }
    if table.is_view() {
        return Err(Error::sql("views may not be indexed"));
    }
    if table.read_only {
        return Err(Error::sql(format!(
            "table {} may not be indexed",
            table.name
        )));
    }
    c.authorize(
        c.create_action(AuthAction::CreateIndex, db),
        Some(name.name.as_str()),
        Some(table.name.as_str()),
        Some(db),
    )?;
    check_name_free(c, db, &name.name, "index")?;
    // Validates the column names.
    catalog::build_index(db, &name.name, &table, columns, unique, conflict, 0)?;

    c.use_schema(db);
    c.begin_write(db);
    let mcur = open_master(c, db);
    let root_cell = c.alloc_mem();
    c.b.emit(Opcode::CreateIndex, db as i32, 0);
    c.b.emit(Opcode::MemStore, root_cell, 1);
    let sql = c.sql_text.clone();
    write_master_row(
        c,
        mcur,
        "index",
        &name.name,
        &table.name,
        Some(root_cell),
        Some(&sql),
    );
    c.b.emit(Opcode::Close, mcur, 0);

    // Back-fill the index from the existing rows.
    let icur = c.alloc_cursor();
    c.b.emit(Opcode::Integer, db as i32, 0);
    c.b.emit(Opcode::MemLoad, root_cell, 0);
    c.b.emit3(
        Opcode::OpenWrite,
        icur,
        0,
        Operand::Text(name.name.to_string()),
    );
    let tcur = c.alloc_cursor();
    c.b.emit(Opcode::Integer, db as i32, 0);
    c.b.emit3(
        Opcode::OpenRead,
        tcur,
        table.root,
        Operand::Text(table.name.to_string()),
    );
    let done = c.b.new_label();
    c.b.emit(Opcode::Rewind, tcur, done);
    let top = c.b.current_addr() as i32;
    c.b.emit(Opcode::Recno, tcur, 0);
    let positions = columns
        .iter()
        .map(|col| table.column_index(col).expect("validated above"))
        .collect::<Vec<_>>();
    for &pos in &positions {
        if table.ipk_column == Some(pos) {
            c.b.emit(Opcode::Recno, tcur, 0);
        } else {
            c.b.emit(Opcode::Column, tcur, pos as i32);
        }
    }
    c.b.emit3(
        Opcode::MakeIdxKey,
        positions.len() as i32,
        0,
        Operand::Layout(KeyLayout::ascending(positions.len())),
    );
    c.b.emit3(
        Opcode::IdxPut,
        icur,
        i32::from(unique),
        Operand::Static("indexed columns are not unique"),
    );
    c.b.emit(Opcode::Next, tcur, top);
    c.b.resolve_label(done);
    c.b.emit(Opcode::Close, tcur, 0);
    c.b.emit(Opcode::Close, icur, 0);
    bump_schema(c, db);
    Ok(())
}

fn create_view(
    c: &mut Compiler<'_>,
    temp: bool,
    name: &QualName,
    select: &crate::ast::Select,
) -> Result<()> {
    let db = target_db(c, temp, name)?;
    c.authorize(
        c.create_action(AuthAction::CreateView, db),
        Some(name.name.as_str()),
        None,
        Some(db),
    )?;
    check_name_free(c, db, &name.name, "view")?;
    let db_name = c.conn.catalog.db(db)?.name.clone();
    resolve::normalize_view(db, &db_name, select)?;

    c.use_schema(db);
    c.begin_write(db);
    let mcur = open_master(c, db);
    let sql = c.sql_text.clone();
    write_master_row(c, mcur, "view", &name.name, &name.name, None, Some(&sql));
    c.b.emit(Opcode::Close, mcur, 0);
    bump_schema(c, db);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn create_trigger(
    c: &mut Compiler<'_>,
    temp: bool,
    name: &QualName,
    _timing: crate::ast::TriggerTiming,
    _event: &TriggerEvent,
    table: &QualName,
    for_each_row: bool,
    when: Option<&crate::ast::Expr>,
    steps: &[crate::ast::TriggerStep],
) -> Result<()> {
    if !for_each_row {
        return Err(Error::sql("FOR EACH STATEMENT triggers are not implemented"));
    }
    let db = target_db(c, temp, name)?;
    let (table_db, target) = c
        .conn
        .catalog
        .find_table(table.database.as_deref(), &table.name)?;
    let target_name = target.name.clone();
    if target.read_only && !target.is_view() {
        return Err(Error::sql(format!(
            "cannot create trigger on system table {target_name}"
        )));
    }
    if db != TEMP_DB && table_db != db {
        return Err(Error::sql(
            "trigger and table must live in the same database",
        ));
    }
    c.authorize(
        c.create_action(AuthAction::CreateTrigger, db),
        Some(name.name.as_str()),
        Some(target_name.as_str()),
        Some(db),
    )?;
    check_name_free(c, db, &name.name, "trigger")?;
    let db_name = c.conn.catalog.db(db)?.name.clone();
    resolve::normalize_trigger(db, &db_name, when, steps)?;

    c.use_schema(db);
    c.begin_write(db);
    let mcur = open_master(c, db);
    let sql = c.sql_text.clone();
    write_master_row(
        c,
        mcur,
        "trigger",
        &name.name,
        &target_name,
        None,
        Some(&sql),
    );
    c.b.emit(Opcode::Close, mcur, 0);
    bump_schema(c, db);
    Ok(())
}

fn drop_object(c: &mut Compiler<'_>, kind: DropKind, name: &QualName) -> Result<()> {
    let (db, destroy_roots, master_match_col, match_name) = match kind {
        DropKind::Table => {
            let (db, table) = c
                .conn
                .catalog
                .find_table(name.database.as_deref(), &name.name)?;
            let table = table.clone();
            if table.is_view() {
                return Err(Error::sql(format!(
                    "use DROP VIEW to delete view {}",
                    table.name
                )));
            }
            if table.read_only {
                return Err(Error::sql(format!(
                    "table {} may not be dropped",
                    table.name
                )));
            }
            c.authorize(
                c.create_action(AuthAction::DropTable, db),
                Some(table.name.as_str()),
                None,
                Some(db),
            )?;
            let mut roots = vec![table.root];
            for idx in &table.indices {
                if let Some(index) = c.conn.catalog.db(db)?.schema.index(idx) {
                    roots.push(index.root);
                }
            }
            // Matching on tbl_name removes the table's index and trigger
            // rows with it.
            (db, roots, 2, table.name.clone())
        }
        DropKind::Index => {
            let (db, index) = c
                .conn
                .catalog
                .find_index(name.database.as_deref(), &name.name)?;
            let index = index.clone();
            if index.auto {
                return Err(Error::sql(format!(
                    "index associated with UNIQUE or PRIMARY KEY constraint \
                     cannot be dropped: {}",
                    index.name
                )));
            }
            c.authorize(
                c.create_action(AuthAction::DropIndex, db),
                Some(index.name.as_str()),
                Some(index.table.as_str()),
                Some(db),
            )?;
            (db, vec![index.root], 1, index.name.clone())
        }
        DropKind::View => {
            let (db, table) = c
                .conn
                .catalog
                .find_table(name.database.as_deref(), &name.name)?;
            let table = table.clone();
            if !table.is_view() {
                return Err(Error::sql(format!(
                    "use DROP TABLE to delete table {}",
                    table.name
                )));
            }
            c.authorize(
                c.create_action(AuthAction::DropView, db),
                Some(table.name.as_str()),
                None,
                Some(db),
            )?;
            (db, Vec::new(), 2, table.name.clone())
        }
        DropKind::Trigger => {
            let (db, trigger) = c
                .conn
                .catalog
                .find_trigger(name.database.as_deref(), &name.name)?;
            let trigger_name = trigger.name.clone();
            let table = trigger.table.clone();
            c.authorize(
                c.create_action(AuthAction::DropTrigger, db),
                Some(trigger_name.as_str()),
                Some(table.as_str()),
                Some(db),
            )?;
            (db, Vec::new(), 1, trigger_name)
        }
    };

    c.use_schema(db);
    c.begin_write(db);
    for root in destroy_roots {
        c.b.emit(Opcode::Destroy, root, db as i32);
    }

    // Remove the master rows whose name (or tbl_name) matches.
    let mcur = open_master(c, db);
    c.push_list();
    let scan_done = c.b.new_label();
    c.b.emit(Opcode::Rewind, mcur, scan_done);
    let scan_top = c.b.current_addr() as i32;
    let keep = c.b.new_label();
    let take = c.b.new_label();
    c.b.emit(Opcode::Column, mcur, master_match_col);
    c.b.emit3(
        Opcode::String,
        0,
        0,
        Operand::Text(match_name.to_string()),
    );
    c.b.emit(Opcode::Eq, 0, take);
    c.b.emit(Opcode::Goto, 0, keep);
    c.b.resolve_label(take);
    c.b.emit(Opcode::Recno, mcur, 0);
    c.b.emit(Opcode::ListWrite, 0, 0);
    c.b.resolve_label(keep);
    c.b.emit(Opcode::Next, mcur, scan_top);
    c.b.resolve_label(scan_done);

    c.b.emit(Opcode::ListRewind, 0, 0);
    let del_done = c.b.new_label();
    let del_cont = c.b.new_label();
    let del_top = c.b.current_addr() as i32;
    c.b.emit(Opcode::ListRead, 0, del_done);
    c.b.emit(Opcode::NotExists, mcur, del_cont);
    c.b.emit(Opcode::Delete, mcur, 0);
    c.b.resolve_label(del_cont);
    c.b.emit(Opcode::Goto, 0, del_top);
    c.b.resolve_label(del_done);
    c.pop_list();
    c.b.emit(Opcode::Close, mcur, 0);
    bump_schema(c, db);
    Ok(())
}

fn attach(c: &mut Compiler<'_>, filename: &str, db_name: &str) -> Result<()> {
    let verdict = c.authorize(AuthAction::Attach, Some(filename), None, None)?;
    if verdict == AuthResult::Ignore {
        return Ok(());
    }
    c.b.emit3(Opcode::String, 0, 0, Operand::Text(filename.to_owned()));
    c.b.emit3(Opcode::String, 0, 0, Operand::Text(db_name.to_owned()));
    c.b.emit(Opcode::Attach, 0, 0);
    Ok(())
}

fn detach(c: &mut Compiler<'_>, db_name: &str) -> Result<()> {
    let verdict = c.authorize(AuthAction::Detach, Some(db_name), None, None)?;
    if verdict == AuthResult::Ignore {
        return Ok(());
    }
    c.b.emit3(Opcode::String, 0, 0, Operand::Text(db_name.to_owned()));
    c.b.emit(Opcode::Detach, 0, 0);
    Ok(())
}

fn begin_txn(c: &mut Compiler<'_>, _mode: TxnMode) -> Result<()> {
    if c.conn.in_txn {
        return Err(Error::sql(
            "cannot start a transaction within a transaction",
        ));
    }
    c.authorize(AuthAction::Transaction, Some("BEGIN"), None, None)?;
    // DEFERRED and IMMEDIATE both take the storage transaction here; the
    // engine holds one transaction across every attached database.
    let slots: Vec<usize> = c.conn.catalog.slots().map(|(i, _)| i).collect();
    for db in slots {
        c.b.emit(Opcode::Transaction, db as i32, 1);
    }
    Ok(())
}

fn end_txn(c: &mut Compiler<'_>, opcode: Opcode) -> Result<()> {
    if !c.conn.in_txn {
        let verb = if opcode == Opcode::Commit {
            "commit"
        } else {
            "rollback"
        };
        return Err(Error::sql(format!(
            "cannot {verb} - no transaction is active"
        )));
    }
    c.authorize(
        AuthAction::Transaction,
        Some(if opcode == Opcode::Commit {
            "COMMIT"
        } else {
            "ROLLBACK"
        }),
        None,
        None,
    )?;
    c.b.emit(opcode, 0, 1);
    Ok(())
}
