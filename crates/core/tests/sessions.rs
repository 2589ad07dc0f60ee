//! Multi-connection, persistence and hook behaviour.

use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;

use squill_core::auth::{AuthAction, AuthResult};
use squill_core::{Connection, ErrorCode, Value};

fn run(conn: &Connection, sql: &str) {
    conn.exec(sql, |_, _| false)
        .unwrap_or_else(|err| panic!("{sql}: {err}"));
}

fn int(conn: &Connection, sql: &str) -> i64 {
    let mut out = None;
    conn.exec(sql, |row, _| {
        out = row[0].as_int();
        false
    })
    .unwrap_or_else(|err| panic!("{sql}: {err}"));
    out.expect("one integer row")
}

fn temp_db_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_owned()
}

#[test]
fn schema_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "persist.db");
    {
        let c = Connection::open(&path).unwrap();
        run(&c, "CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT)");
        run(&c, "CREATE INDEX i ON t(b)");
        run(&c, "INSERT INTO t VALUES(NULL, 'kept')");
        c.close().unwrap();
    }
    let c = Connection::open(&path).unwrap();
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 1);
    // The reopened catalog still knows the index.
    let mut index_names = Vec::new();
    c.exec("PRAGMA index_list(t)", |row, _| {
        index_names.push(row[1].to_text());
        false
    })
    .unwrap();
    assert_eq!(index_names, vec!["i".to_owned()]);
}

#[test]
fn second_connection_sees_busy_during_write_txn() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "shared.db");
    let a = Connection::open(&path).unwrap();
    let b = Connection::open(&path).unwrap();
    run(&a, "CREATE TABLE t(a)");

    run(&a, "BEGIN");
    run(&a, "INSERT INTO t VALUES(1)");

    // No handler: BUSY immediately.
    let err = b.exec("SELECT * FROM t", |_, _| false).unwrap_err();
    assert_eq!(err.code, ErrorCode::Busy);

    // A handler that gives up after three retries still ends in BUSY.
    let attempts = Rc::new(Cell::new(0u32));
    let seen = Rc::clone(&attempts);
    b.set_busy_handler(Some(Box::new(move |n| {
        seen.set(n);
        n < 3
    })));
    let err = b.exec("SELECT * FROM t", |_, _| false).unwrap_err();
    assert_eq!(err.code, ErrorCode::Busy);
    assert_eq!(attempts.get(), 3);

    run(&a, "COMMIT");
    b.set_busy_handler(None);
    assert_eq!(int(&b, "SELECT count(*) FROM t"), 1);
}

#[test]
fn cross_connection_schema_change_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "schema.db");
    let a = Connection::open(&path).unwrap();
    let b = Connection::open(&path).unwrap();
    run(&a, "CREATE TABLE t(a)");

    let (stmt, _) = b.prepare("SELECT count(*) FROM t").unwrap();
    let mut stmt = stmt.unwrap();

    // A DDL elsewhere invalidates the compiled statement.
    run(&a, "CREATE TABLE u(x)");
    let err = stmt.step().unwrap_err();
    assert_eq!(err.code, ErrorCode::Schema);
    stmt.finalize().unwrap();

    // Re-preparing sees the refreshed catalog.
    assert_eq!(int(&b, "SELECT count(*) FROM u"), 0);
}

#[test]
fn attach_and_detach() {
    let dir = tempfile::tempdir().unwrap();
    let other = temp_db_path(&dir, "aux.db");
    {
        let c = Connection::open(&other).unwrap();
        run(&c, "CREATE TABLE numbers(n)");
        run(&c, "INSERT INTO numbers VALUES(41),(1)");
        c.close().unwrap();
    }
    let c = Connection::open(":memory:").unwrap();
    run(&c, &format!("ATTACH DATABASE '{other}' AS aux"));
    assert_eq!(int(&c, "SELECT sum(n) FROM aux.numbers"), 42);
    run(&c, "DETACH DATABASE aux");
    let err = c.exec("SELECT * FROM aux.numbers", |_, _| false).unwrap_err();
    assert_eq!(err.code, ErrorCode::Error);
}

#[test]
fn copy_loads_delimited_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("people.tsv");
    {
        let mut f = std::fs::File::create(&data).unwrap();
        writeln!(f, "1\tann").unwrap();
        writeln!(f, "2\t\\N").unwrap();
        writeln!(f, "3\tcarol").unwrap();
    }
    let c = Connection::open(":memory:").unwrap();
    run(&c, "CREATE TABLE people(id, name)");
    run(
        &c,
        &format!("COPY people FROM '{}'", data.to_str().unwrap()),
    );
    assert_eq!(int(&c, "SELECT count(*) FROM people"), 3);
    assert_eq!(int(&c, "SELECT count(*) FROM people WHERE name IS NULL"), 1);
}

#[test]
fn authorizer_deny_and_ignore() {
    let c = Connection::open(":memory:").unwrap();
    run(&c, "CREATE TABLE secrets(v)");
    run(&c, "INSERT INTO secrets VALUES('classified')");

    c.set_authorizer(Some(Box::new(|action, arg1, _, _, _| {
        match (action, arg1) {
            (AuthAction::Read, Some("secrets")) => AuthResult::Ignore,
            (AuthAction::Delete, _) => AuthResult::Deny,
            _ => AuthResult::Allow,
        }
    })));

    // Reads compile to NULL.
    let mut values = Vec::new();
    c.exec("SELECT v FROM secrets", |row, _| {
        values.push(row[0].clone());
        false
    })
    .unwrap();
    assert!(values.iter().all(Value::is_null));

    let err = c.exec("DELETE FROM secrets", |_, _| false).unwrap_err();
    assert_eq!(err.code, ErrorCode::Auth);

    c.set_authorizer(None);
    assert_eq!(int(&c, "SELECT count(*) FROM secrets"), 1);
}

#[test]
fn commit_hook_can_veto() {
    let c = Connection::open(":memory:").unwrap();
    run(&c, "CREATE TABLE t(a)");
    c.set_commit_hook(Some(Box::new(|| true)));
    let err = c.exec("INSERT INTO t VALUES(1)", |_, _| false).unwrap_err();
    assert_eq!(err.code, ErrorCode::Constraint);
    c.set_commit_hook(None);
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 0);
}

#[test]
fn trace_hook_sees_statement_text() {
    let c = Connection::open(":memory:").unwrap();
    let seen = Rc::new(Cell::new(false));
    let flag = Rc::clone(&seen);
    c.set_trace(Some(Box::new(move |sql| {
        if sql.contains("SELECT 1") {
            flag.set(true);
        }
    })));
    run(&c, "SELECT 1");
    assert!(seen.get());
}

#[test]
fn count_changes_pragma_reports_rows() {
    let c = Connection::open(":memory:").unwrap();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "PRAGMA count_changes = ON");
    let mut reported = None;
    c.exec("INSERT INTO t VALUES(1),(2)", |row, _| {
        reported = row[0].as_int();
        false
    })
    .unwrap();
    assert_eq!(reported, Some(2));
}

#[test]
fn conflict_override_applies_between_statement_and_declared() {
    let c = Connection::open(":memory:").unwrap();
    run(&c, "CREATE TABLE t(a UNIQUE)");
    run(&c, "INSERT INTO t VALUES(1)");
    c.set_conflict_override(Some(squill_core::ConflictAction::Ignore));
    run(&c, "INSERT INTO t VALUES(1)");
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 1);
    c.set_conflict_override(None);
    let err = c.exec("INSERT INTO t VALUES(1)", |_, _| false).unwrap_err();
    assert_eq!(err.code, ErrorCode::Constraint);
}

#[test]
fn vacuum_is_accepted() {
    let c = Connection::open(":memory:").unwrap();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "VACUUM");
}
