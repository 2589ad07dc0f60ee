//! End-to-end engine tests: SQL in, rows out.

use pretty_assertions::assert_eq;
use squill_core::{Connection, ErrorCode, StepOutcome, Value};

fn conn() -> Connection {
    Connection::open(":memory:").unwrap()
}

fn run(conn: &Connection, sql: &str) {
    conn.exec(sql, |_, _| false)
        .unwrap_or_else(|err| panic!("{sql}: {err}"));
}

fn rows(conn: &Connection, sql: &str) -> Vec<Vec<Value>> {
    let mut out = Vec::new();
    conn.exec(sql, |row, _| {
        out.push(row.to_vec());
        false
    })
    .unwrap_or_else(|err| panic!("{sql}: {err}"));
    out
}

fn texts(conn: &Connection, sql: &str) -> Vec<Vec<String>> {
    rows(conn, sql)
        .into_iter()
        .map(|row| row.iter().map(Value::to_text).collect())
        .collect()
}

fn one(conn: &Connection, sql: &str) -> Value {
    let mut all = rows(conn, sql);
    assert_eq!(all.len(), 1, "expected one row from {sql}");
    let row = all.remove(0);
    assert_eq!(row.len(), 1, "expected one column from {sql}");
    row.into_iter().next().unwrap()
}

fn int(conn: &Connection, sql: &str) -> i64 {
    one(conn, sql).as_int().unwrap_or_else(|| panic!("{sql}: not an integer"))
}

#[test]
fn integer_primary_key_allocates_rowids() {
    let c = conn();
    run(&c, "CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT)");
    run(&c, "INSERT INTO t VALUES(NULL, 'x')");
    run(&c, "INSERT INTO t VALUES(NULL, 'y')");
    assert_eq!(
        texts(&c, "SELECT a, b FROM t ORDER BY a"),
        vec![vec!["1".to_owned(), "x".to_owned()], vec!["2".to_owned(), "y".to_owned()]]
    );
    assert_eq!(c.last_insert_rowid(), 2);
}

#[test]
fn or_ignore_skips_conflicting_row() {
    let c = conn();
    run(&c, "CREATE TABLE t(a UNIQUE)");
    run(&c, "INSERT INTO t VALUES(1)");
    run(&c, "INSERT OR IGNORE INTO t VALUES(1)");
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 1);
    assert_eq!(c.changes(), 0);
}

#[test]
fn or_replace_removes_conflicting_row() {
    let c = conn();
    run(&c, "CREATE TABLE t(a UNIQUE, b)");
    run(&c, "INSERT INTO t VALUES(1, 'old')");
    run(&c, "INSERT OR REPLACE INTO t VALUES(1, 'new')");
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 1);
    assert_eq!(one(&c, "SELECT b FROM t").to_text(), "new");
}

#[test]
fn or_abort_leaves_table_unchanged() {
    let c = conn();
    run(&c, "CREATE TABLE t(a UNIQUE)");
    run(&c, "INSERT INTO t VALUES(1)");
    let err = c
        .exec("INSERT INTO t VALUES(1)", |_, _| false)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Constraint);
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 1);
}

#[test]
fn rollback_undoes_inserts() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "BEGIN");
    run(&c, "INSERT INTO t VALUES(1)");
    run(&c, "INSERT INTO t VALUES(2)");
    run(&c, "ROLLBACK");
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 0);
}

#[test]
fn commit_makes_inserts_durable() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "BEGIN; INSERT INTO t VALUES(1); INSERT INTO t VALUES(2); COMMIT;");
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 2);
}

#[test]
fn statement_failure_in_txn_keeps_earlier_statements() {
    let c = conn();
    run(&c, "CREATE TABLE t(a UNIQUE)");
    run(&c, "BEGIN");
    run(&c, "INSERT INTO t VALUES(1)");
    assert!(c.exec("INSERT INTO t VALUES(1)", |_, _| false).is_err());
    run(&c, "COMMIT");
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 1);
}

#[test]
fn indexed_lookup_finds_row_and_uses_index() {
    let c = conn();
    run(&c, "CREATE TABLE t(a, b)");
    run(&c, "CREATE INDEX i ON t(a)");
    run(&c, "INSERT INTO t VALUES(1,'x'),(2,'y')");
    assert_eq!(one(&c, "SELECT b FROM t WHERE a = 2").to_text(), "y");

    // The compiled program opens the index, not just the table.
    let explain = texts(&c, "EXPLAIN SELECT b FROM t WHERE a = 2");
    assert!(
        explain
            .iter()
            .any(|row| row[1] == "OpenRead" && row[4] == "i"),
        "expected an index scan in {explain:?}"
    );
}

#[test]
fn planner_matches_full_scan_results() {
    let c = conn();
    run(&c, "CREATE TABLE t(a, b)");
    run(&c, "CREATE INDEX i ON t(a, b)");
    for row in 0..30 {
        run(
            &c,
            &format!("INSERT INTO t VALUES({}, {})", row % 5, row % 7),
        );
    }
    let indexed = texts(&c, "SELECT a, b FROM t WHERE a = 3 AND b > 2 ORDER BY rowid");
    // The same predicate against an unindexed copy.
    run(&c, "CREATE TABLE u(a, b)");
    run(&c, "INSERT INTO u SELECT a, b FROM t");
    let scanned = texts(&c, "SELECT a, b FROM u WHERE a = 3 AND b > 2 ORDER BY rowid");
    assert_eq!(indexed, scanned);
}

#[test]
fn trigger_fires_once_per_insert() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(
        &c,
        "CREATE TRIGGER tr AFTER INSERT ON t BEGIN \
         INSERT INTO t VALUES(new.a + 1); \
         END",
    );
    run(&c, "INSERT INTO t VALUES(1)");
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 2);
    assert_eq!(
        texts(&c, "SELECT a FROM t ORDER BY a"),
        vec![vec!["1".to_owned()], vec!["2".to_owned()]]
    );
}

#[test]
fn trigger_when_clause_filters_rows() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "CREATE TABLE log(v)");
    run(
        &c,
        "CREATE TRIGGER tr AFTER INSERT ON t WHEN new.a > 10 BEGIN \
         INSERT INTO log VALUES(new.a); \
         END",
    );
    run(&c, "INSERT INTO t VALUES(5)");
    run(&c, "INSERT INTO t VALUES(50)");
    assert_eq!(texts(&c, "SELECT v FROM log"), vec![vec!["50".to_owned()]]);
}

#[test]
fn delete_trigger_sees_old_row() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "CREATE TABLE graveyard(a)");
    run(
        &c,
        "CREATE TRIGGER tr BEFORE DELETE ON t BEGIN \
         INSERT INTO graveyard VALUES(old.a); \
         END",
    );
    run(&c, "INSERT INTO t VALUES(7),(8)");
    run(&c, "DELETE FROM t WHERE a = 7");
    assert_eq!(texts(&c, "SELECT a FROM graveyard"), vec![vec!["7".to_owned()]]);
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 1);
}

#[test]
fn update_with_where_changes_matching_rows() {
    let c = conn();
    run(&c, "CREATE TABLE t(a, b)");
    run(&c, "INSERT INTO t VALUES(1, 10),(2, 20),(3, 30)");
    run(&c, "UPDATE t SET b = b + 1 WHERE a >= 2");
    assert_eq!(c.changes(), 2);
    assert_eq!(
        texts(&c, "SELECT b FROM t ORDER BY a"),
        vec![vec!["10".to_owned()], vec!["21".to_owned()], vec!["31".to_owned()]]
    );
}

#[test]
fn aggregates_and_group_by() {
    let c = conn();
    run(&c, "CREATE TABLE sales(region, amount)");
    run(
        &c,
        "INSERT INTO sales VALUES('east', 10),('east', 20),('west', 5)",
    );
    assert_eq!(
        texts(
            &c,
            "SELECT region, count(*), sum(amount) FROM sales GROUP BY region ORDER BY region",
        ),
        vec![
            vec!["east".to_owned(), "2".to_owned(), "30".to_owned()],
            vec!["west".to_owned(), "1".to_owned(), "5".to_owned()],
        ]
    );
    assert_eq!(
        texts(
            &c,
            "SELECT region FROM sales GROUP BY region HAVING sum(amount) > 10",
        ),
        vec![vec!["east".to_owned()]]
    );
}

#[test]
fn count_on_empty_table_is_zero() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 0);
    assert!(one(&c, "SELECT max(a) FROM t").is_null());
}

#[test]
fn order_by_desc_and_limit_offset() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    for i in 1..=5 {
        run(&c, &format!("INSERT INTO t VALUES({i})"));
    }
    assert_eq!(
        texts(&c, "SELECT a FROM t ORDER BY a DESC LIMIT 2"),
        vec![vec!["5".to_owned()], vec!["4".to_owned()]]
    );
    assert_eq!(
        texts(&c, "SELECT a FROM t ORDER BY a LIMIT 2 OFFSET 2"),
        vec![vec!["3".to_owned()], vec!["4".to_owned()]]
    );
}

#[test]
fn select_distinct() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "INSERT INTO t VALUES(1),(1),(2),(2),(3)");
    assert_eq!(
        texts(&c, "SELECT DISTINCT a FROM t ORDER BY a"),
        vec![vec!["1".to_owned()], vec!["2".to_owned()], vec!["3".to_owned()]]
    );
}

#[test]
fn compound_selects() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "CREATE TABLE u(a)");
    run(&c, "INSERT INTO t VALUES(1),(2),(3)");
    run(&c, "INSERT INTO u VALUES(2),(3),(4)");
    assert_eq!(
        texts(&c, "SELECT a FROM t UNION SELECT a FROM u ORDER BY 1"),
        vec![
            vec!["1".to_owned()],
            vec!["2".to_owned()],
            vec!["3".to_owned()],
            vec!["4".to_owned()],
        ]
    );
    assert_eq!(
        texts(&c, "SELECT a FROM t INTERSECT SELECT a FROM u ORDER BY 1"),
        vec![vec!["2".to_owned()], vec!["3".to_owned()]]
    );
    assert_eq!(
        texts(&c, "SELECT a FROM t EXCEPT SELECT a FROM u"),
        vec![vec!["1".to_owned()]]
    );
    let mut all = texts(&c, "SELECT a FROM t UNION ALL SELECT a FROM t");
    all.sort();
    assert_eq!(all.len(), 6);
}

#[test]
fn joins_inner_and_left_outer() {
    let c = conn();
    run(&c, "CREATE TABLE person(id, name)");
    run(&c, "CREATE TABLE pet(owner_id, pet_name)");
    run(&c, "INSERT INTO person VALUES(1, 'ann'),(2, 'bob')");
    run(&c, "INSERT INTO pet VALUES(1, 'rex')");
    assert_eq!(
        texts(
            &c,
            "SELECT name, pet_name FROM person, pet \
             WHERE person.id = pet.owner_id",
        ),
        vec![vec!["ann".to_owned(), "rex".to_owned()]]
    );
    let left = texts(
        &c,
        "SELECT name, pet_name FROM person LEFT OUTER JOIN pet \
         ON person.id = pet.owner_id ORDER BY name",
    );
    assert_eq!(left.len(), 2);
    assert_eq!(left[0], vec!["ann".to_owned(), "rex".to_owned()]);
    assert_eq!(left[1][0], "bob");
    assert_eq!(left[1][1], "");
}

#[test]
fn in_list_and_in_subquery() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "CREATE TABLE picks(v)");
    run(&c, "INSERT INTO t VALUES(1),(2),(3),(4)");
    run(&c, "INSERT INTO picks VALUES(2),(4)");
    assert_eq!(
        texts(&c, "SELECT a FROM t WHERE a IN (1, 3) ORDER BY a"),
        vec![vec!["1".to_owned()], vec!["3".to_owned()]]
    );
    assert_eq!(
        texts(&c, "SELECT a FROM t WHERE a IN (SELECT v FROM picks) ORDER BY a"),
        vec![vec!["2".to_owned()], vec!["4".to_owned()]]
    );
    assert_eq!(
        texts(&c, "SELECT a FROM t WHERE a NOT IN (SELECT v FROM picks) ORDER BY a"),
        vec![vec!["1".to_owned()], vec!["3".to_owned()]]
    );
}

#[test]
fn scalar_subquery_and_correlated_reference() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "INSERT INTO t VALUES(1),(5),(9)");
    assert_eq!(int(&c, "SELECT (SELECT max(a) FROM t)"), 9);
}

#[test]
fn like_and_glob() {
    let c = conn();
    run(&c, "CREATE TABLE t(name)");
    run(&c, "INSERT INTO t VALUES('Alice'),('Bob'),('alfred')");
    assert_eq!(
        texts(&c, "SELECT name FROM t WHERE name LIKE 'al%' ORDER BY name"),
        vec![vec!["Alice".to_owned()], vec!["alfred".to_owned()]]
    );
    assert_eq!(
        texts(&c, "SELECT name FROM t WHERE name GLOB 'B*'"),
        vec![vec!["Bob".to_owned()]]
    );
}

#[test]
fn views_materialize_their_select() {
    let c = conn();
    run(&c, "CREATE TABLE t(a, b)");
    run(&c, "INSERT INTO t VALUES(1, 'x'),(2, 'y')");
    run(&c, "CREATE VIEW big AS SELECT a, b FROM t WHERE a > 1");
    assert_eq!(
        texts(&c, "SELECT b FROM big"),
        vec![vec!["y".to_owned()]]
    );
    let err = c.exec("INSERT INTO big VALUES(3, 'z')", |_, _| false).unwrap_err();
    assert!(err.message.contains("view"), "{}", err.message);
}

#[test]
fn check_and_not_null_constraints() {
    let c = conn();
    run(&c, "CREATE TABLE t(a NOT NULL, b CHECK(b > 0))");
    let err = c
        .exec("INSERT INTO t VALUES(NULL, 1)", |_, _| false)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Constraint);
    let err = c
        .exec("INSERT INTO t VALUES(1, -1)", |_, _| false)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Constraint);
    run(&c, "INSERT INTO t VALUES(1, 1)");
    assert_eq!(int(&c, "SELECT count(*) FROM t"), 1);
}

#[test]
fn unique_index_backfill_rejects_duplicates() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "INSERT INTO t VALUES(1),(1)");
    let err = c
        .exec("CREATE UNIQUE INDEX i ON t(a)", |_, _| false)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Constraint);
}

#[test]
fn drop_table_removes_schema_and_data() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "CREATE INDEX i ON t(a)");
    run(&c, "INSERT INTO t VALUES(1)");
    run(&c, "DROP TABLE t");
    let err = c.exec("SELECT * FROM t", |_, _| false).unwrap_err();
    assert!(err.message.contains("no such table"), "{}", err.message);
    // The index went with it.
    run(&c, "CREATE TABLE t(a)");
    run(&c, "CREATE INDEX i ON t(a)");
}

#[test]
fn prepared_statement_reset_replays_rows() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "INSERT INTO t VALUES(1),(2)");
    let (stmt, _) = c.prepare("SELECT a FROM t ORDER BY a").unwrap();
    let mut stmt = stmt.unwrap();
    let mut first = Vec::new();
    while stmt.step().unwrap() == StepOutcome::Row {
        first.push(stmt.column_value(0).to_text());
    }
    stmt.reset().unwrap();
    let mut second = Vec::new();
    while stmt.step().unwrap() == StepOutcome::Row {
        second.push(stmt.column_value(0).to_text());
    }
    assert_eq!(first, second);
    stmt.finalize().unwrap();
}

#[test]
fn bound_parameters() {
    let c = conn();
    run(&c, "CREATE TABLE t(a, b)");
    let (stmt, _) = c.prepare("INSERT INTO t VALUES(?, ?)").unwrap();
    let mut stmt = stmt.unwrap();
    stmt.bind(1, Value::Int(1)).unwrap();
    stmt.bind(2, Value::from_text("one")).unwrap();
    assert_eq!(stmt.step().unwrap(), StepOutcome::Done);
    stmt.reset().unwrap();
    stmt.bind(1, Value::Int(2)).unwrap();
    stmt.bind(2, Value::from_text("two")).unwrap();
    assert_eq!(stmt.step().unwrap(), StepOutcome::Done);
    stmt.finalize().unwrap();
    assert_eq!(
        texts(&c, "SELECT b FROM t ORDER BY a"),
        vec![vec!["one".to_owned()], vec!["two".to_owned()]]
    );
}

#[test]
fn interrupt_stops_running_statement() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    for i in 0..10 {
        run(&c, &format!("INSERT INTO t VALUES({i})"));
    }
    let (stmt, _) = c.prepare("SELECT a FROM t").unwrap();
    let mut stmt = stmt.unwrap();
    assert_eq!(stmt.step().unwrap(), StepOutcome::Row);
    c.interrupt();
    let err = stmt.step().unwrap_err();
    assert_eq!(err.code, ErrorCode::Interrupted);
    stmt.finalize().unwrap();
}

#[test]
fn changes_and_total_changes() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "INSERT INTO t VALUES(1),(2),(3)");
    assert_eq!(c.changes(), 3);
    run(&c, "DELETE FROM t WHERE a < 3");
    assert_eq!(c.changes(), 2);
    assert_eq!(c.total_changes(), 5);
}

#[test]
fn builtin_scalar_functions() {
    let c = conn();
    assert_eq!(one(&c, "SELECT upper('abc')").to_text(), "ABC");
    assert_eq!(int(&c, "SELECT length('hello')"), 5);
    assert_eq!(one(&c, "SELECT coalesce(NULL, NULL, 'x')").to_text(), "x");
    assert_eq!(int(&c, "SELECT abs(-4)"), 4);
    assert_eq!(one(&c, "SELECT substr('hello', 2, 3)").to_text(), "ell");
    assert_eq!(int(&c, "SELECT max(3, 1, 2)"), 3);
    assert_eq!(one(&c, "SELECT nullif(1, 1)"), Value::Null);
    assert_eq!(one(&c, "SELECT quote('it''s')").to_text(), "'it''s'");
}

#[test]
fn user_defined_scalar_function() {
    let c = conn();
    c.create_function("double_it", 1, |args| {
        Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2))
    });
    assert_eq!(int(&c, "SELECT double_it(21)"), 42);
}

#[test]
fn user_defined_aggregate() {
    let c = conn();
    c.create_aggregate(
        "longest",
        1,
        |ctx, args| {
            let s = args[0].to_text();
            let best = ctx
                .state
                .get_or_insert_with(|| Box::new(String::new()))
                .downcast_mut::<String>()
                .expect("state");
            if s.len() > best.len() {
                *best = s;
            }
            Ok(())
        },
        |ctx| {
            Ok(ctx
                .state
                .take()
                .and_then(|b| b.downcast::<String>().ok())
                .map(|s| Value::from_text(&s))
                .unwrap_or(Value::Null))
        },
    );
    run(&c, "CREATE TABLE t(w)");
    run(&c, "INSERT INTO t VALUES('hi'),('there'),('ok')");
    assert_eq!(one(&c, "SELECT longest(w) FROM t").to_text(), "there");
}

#[test]
fn case_expression() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    run(&c, "INSERT INTO t VALUES(1),(2),(3)");
    assert_eq!(
        texts(
            &c,
            "SELECT CASE WHEN a = 1 THEN 'one' WHEN a = 2 THEN 'two' ELSE 'many' END \
             FROM t ORDER BY a",
        ),
        vec![vec!["one".to_owned()], vec!["two".to_owned()], vec!["many".to_owned()]]
    );
}

#[test]
fn explain_lists_program() {
    let c = conn();
    run(&c, "CREATE TABLE t(a)");
    let explain = texts(&c, "EXPLAIN SELECT a FROM t");
    assert!(!explain.is_empty());
    assert!(explain.iter().any(|row| row[1] == "Rewind"));
    assert!(explain.iter().any(|row| row[1] == "Halt"));
}

#[test]
fn pragma_table_info_and_database_list() {
    let c = conn();
    run(&c, "CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT NOT NULL)");
    let info = texts(&c, "PRAGMA table_info(t)");
    assert_eq!(info.len(), 2);
    assert_eq!(info[0][1], "a");
    assert_eq!(info[0][2], "INTEGER");
    assert_eq!(info[1][3], "1");

    let dbs = texts(&c, "PRAGMA database_list");
    assert_eq!(dbs[0][1], "main");
    assert_eq!(dbs[1][1], "temp");
}

#[test]
fn get_table_collects_names_and_rows() {
    let c = conn();
    run(&c, "CREATE TABLE t(a, b)");
    run(&c, "INSERT INTO t VALUES(1, 'x'),(2, 'y')");
    let (names, result) = c.get_table("SELECT a, b FROM t ORDER BY a").unwrap();
    assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(result.len(), 2);
    assert_eq!(result[1][1].to_text(), "y");
}

#[test]
fn temp_tables_are_private_to_the_connection() {
    let c = conn();
    run(&c, "CREATE TEMP TABLE scratch(a)");
    run(&c, "INSERT INTO scratch VALUES(1)");
    assert_eq!(int(&c, "SELECT count(*) FROM scratch"), 1);
}
