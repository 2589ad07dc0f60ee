//! The connection's catalog: attached databases, schema bootstrap from
//! the master table, and the builders that turn CREATE statements into
//! in-memory schema objects. The same builders serve first-time DDL and
//! init-mode replay; replay pins root ids from the persisted `rootpage`
//! instead of allocating.

use smol_str::SmolStr;

use crate::ast::{ColumnDef, ConflictAction, Stmt, TableConstraint};
use crate::errors::{Error, ErrorCode, Result};
use crate::parser::Parser;
use crate::schema::{Column, DbSchema, Index, MAIN_DB, MAX_ATTACHED, TEMP_DB, Table, Trigger};
use crate::store::{DbHandle, MASTER_ROOT};
use crate::vdbe::record;

pub struct AttachedDb {
    pub name: SmolStr,
    pub store: DbHandle,
    pub schema: DbSchema,
    /// Signature the cached schema was read under.
    pub schema_sig: u32,
}

/// Attached-database slots. Slot 0 is main, slot 1 is temp; DETACH leaves
/// a hole rather than renumbering, so cached root references stay valid.
#[derive(Default)]
pub struct Catalog {
    pub dbs: Vec<Option<AttachedDb>>,
}

impl Catalog {
    pub fn db(&self, idx: usize) -> Result<&AttachedDb> {
        self.dbs
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::internal(format!("no database at slot {idx}")))
    }

    pub fn db_mut(&mut self, idx: usize) -> Result<&mut AttachedDb> {
        self.dbs
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::internal(format!("no database at slot {idx}")))
    }

    pub fn slots(&self) -> impl Iterator<Item = (usize, &AttachedDb)> {
        self.dbs
            .iter()
            .enumerate()
            .filter_map(|(i, db)| db.as_ref().map(|db| (i, db)))
    }

    pub fn slot_by_name(&self, name: &str) -> Option<usize> {
        self.slots()
            .find(|(_, db)| db.name.eq_ignore_ascii_case(name))
            .map(|(i, _)| i)
    }

    /// Find a table, honouring an optional database qualifier. Unqualified
    /// lookups search temp first, then main, then the attached databases.
    pub fn find_table(&self, database: Option<&str>, name: &str) -> Result<(usize, &Table)> {
        match database {
            Some(db_name) => {
                let idx = self.slot_by_name(db_name).ok_or_else(|| {
                    Error::sql(format!("no such database: {db_name}"))
                })?;
                let table = self.db(idx)?.schema.table(name).ok_or_else(|| {
                    Error::sql(format!("no such table: {db_name}.{name}"))
                })?;
                Ok((idx, table))
            }
            None => {
                for idx in self.search_order() {
                    if let Some(table) = self.db(idx)?.schema.table(name) {
                        return Ok((idx, table));
                    }
                }
                Err(Error::sql(format!("no such table: {name}")))
            }
        }
    }

    pub fn find_index(&self, database: Option<&str>, name: &str) -> Result<(usize, &Index)> {
        match database {
            Some(db_name) => {
                let idx = self.slot_by_name(db_name).ok_or_else(|| {
                    Error::sql(format!("no such database: {db_name}"))
                })?;
                let index = self.db(idx)?.schema.index(name).ok_or_else(|| {
                    Error::sql(format!("no such index: {name}"))
                })?;
                Ok((idx, index))
            }
            None => {
                for idx in self.search_order() {
                    if let Some(index) = self.db(idx)?.schema.index(name) {
                        return Ok((idx, index));
                    }
                }
                Err(Error::sql(format!("no such index: {name}")))
            }
        }
    }

    pub fn find_trigger(&self, database: Option<&str>, name: &str) -> Result<(usize, &Trigger)> {
        match database {
            Some(db_name) => {
                let idx = self.slot_by_name(db_name).ok_or_else(|| {
                    Error::sql(format!("no such database: {db_name}"))
                })?;
                let trigger = self.db(idx)?.schema.trigger(name).ok_or_else(|| {
                    Error::sql(format!("no such trigger: {name}"))
                })?;
                Ok((idx, trigger))
            }
            None => {
                for idx in self.search_order() {
                    if let Some(trigger) = self.db(idx)?.schema.trigger(name) {
                        return Ok((idx, trigger));
                    }
                }
                Err(Error::sql(format!("no such trigger: {name}")))
            }
        }
    }

    fn search_order(&self) -> Vec<usize> {
        let mut order = vec![TEMP_DB, MAIN_DB];
        order.extend(
            self.slots()
                .map(|(i, _)| i)
                .filter(|&i| i != MAIN_DB && i != TEMP_DB),
        );
        order.retain(|&i| self.dbs.get(i).is_some_and(Option::is_some));
        order
    }

    /// Insert a new slot for ATTACH; slots are bounded by the compile-time
    /// attach limit plus the two built-ins.
    pub fn attach(&mut self, db: AttachedDb) -> Result<usize> {
        if self.slot_by_name(&db.name).is_some() {
            return Err(Error::sql(format!(
                "database {} is already in use",
                db.name
            )));
        }
        let live = self.slots().count();
        if live >= MAX_ATTACHED + 2 {
            return Err(Error::sql(format!(
                "too many attached databases (max {MAX_ATTACHED})"
            )));
        }
        for idx in 2..self.dbs.len() {
            if self.dbs[idx].is_none() {
                self.dbs[idx] = Some(db);
                return Ok(idx);
            }
        }
        self.dbs.push(Some(db));
        Ok(self.dbs.len() - 1)
    }

    pub fn detach(&mut self, name: &str) -> Result<()> {
        let idx = self
            .slot_by_name(name)
            .ok_or_else(|| Error::sql(format!("no such database: {name}")))?;
        if idx < 2 {
            return Err(Error::sql(format!("cannot detach database {name}")));
        }
        self.dbs[idx] = None;
        Ok(())
    }
}

/// Build a [`Table`] and its auto-created indices from a parsed CREATE
/// TABLE body. `root` is the storage container (0 while unallocated).
pub fn build_table(
    db: usize,
    name: &str,
    columns: &[ColumnDef],
    constraints: &[TableConstraint],
    root: i32,
) -> Result<(Table, Vec<Index>)> {
    let mut table = Table {
        name: name.into(),
        db,
        root,
        columns: Vec::with_capacity(columns.len()),
        ipk_column: None,
        read_only: false,
        view_select: None,
        indices: Vec::new(),
        triggers: Vec::new(),
        checks: Vec::new(),
        foreign_keys: Vec::new(),
    };
    let mut autos: Vec<Index> = Vec::new();
    let mut auto_seq = 0usize;
    let mut next_auto = |table: &str| {
        auto_seq += 1;
        SmolStr::new(format!("({table} autoindex {auto_seq})"))
    };

    let mut pk_seen = false;
    for (i, def) in columns.iter().enumerate() {
        if table.column_index(&def.name).is_some() {
            return Err(Error::sql(format!("duplicate column name: {}", def.name)));
        }
        if def.primary_key {
            if pk_seen {
                return Err(Error::sql(format!(
                    "table \"{name}\" has more than one primary key"
                )));
            }
            pk_seen = true;
            let is_integer = def
                .type_name
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("integer"));
            if is_integer {
                table.ipk_column = Some(i);
            } else {
                autos.push(Index {
                    name: next_auto(name),
                    db,
                    root: 0,
                    table: table.name.clone(),
                    columns: vec![i],
                    on_conflict: Some(def.pk_conflict.unwrap_or(ConflictAction::Abort)),
                    auto: true,
                });
            }
        }
        if def.unique {
            autos.push(Index {
                name: next_auto(name),
                db,
                root: 0,
                table: table.name.clone(),
                columns: vec![i],
                on_conflict: Some(def.unique_conflict.unwrap_or(ConflictAction::Abort)),
                auto: true,
            });
        }
        if let Some(check) = &def.check {
            table.checks.push((check.clone(), ConflictAction::Abort));
        }
        table.columns.push(Column {
            name: def.name.clone(),
            type_name: def.type_name.clone(),
            default: def.default.clone(),
            not_null: def.not_null,
            not_null_conflict: def.not_null_conflict,
            primary_key: def.primary_key,
        });
    }

    for constraint in constraints {
        match constraint {
            TableConstraint::PrimaryKey { columns, conflict } => {
                if pk_seen {
                    return Err(Error::sql(format!(
                        "table \"{name}\" has more than one primary key"
                    )));
                }
                pk_seen = true;
                let positions = resolve_columns(&table, columns)?;
                if positions.len() == 1 {
                    table.columns[positions[0]].primary_key = true;
                    let def = &table.columns[positions[0]];
                    if def
                        .type_name
                        .as_deref()
                        .is_some_and(|t| t.eq_ignore_ascii_case("integer"))
                    {
                        table.ipk_column = Some(positions[0]);
                        continue;
                    }
                } else if let Some(first) = positions.first() {
                    table.columns[*first].primary_key = true;
                }
                autos.push(Index {
                    name: next_auto(name),
                    db,
                    root: 0,
                    table: table.name.clone(),
                    columns: positions,
                    on_conflict: Some(conflict.unwrap_or(ConflictAction::Abort)),
                    auto: true,
                });
            }
            TableConstraint::Unique { columns, conflict } => {
                let positions = resolve_columns(&table, columns)?;
                autos.push(Index {
                    name: next_auto(name),
                    db,
                    root: 0,
                    table: table.name.clone(),
                    columns: positions,
                    on_conflict: Some(conflict.unwrap_or(ConflictAction::Abort)),
                    auto: true,
                });
            }
            TableConstraint::Check { expr, conflict } => {
                let action = conflict.unwrap_or(ConflictAction::Abort);
                if action == ConflictAction::Replace {
                    return Err(Error::sql("REPLACE is not a valid action for CHECK"));
                }
                table.checks.push((expr.clone(), action));
            }
            TableConstraint::ForeignKey {
                columns,
                foreign_table,
                foreign_columns,
            } => {
                resolve_columns(&table, columns)?;
                table.foreign_keys.push(crate::schema::ForeignKey {
                    columns: columns.clone(),
                    foreign_table: foreign_table.clone(),
                    foreign_columns: foreign_columns.clone(),
                });
            }
        }
    }

    // The invariant: one flagged column exactly when an integer primary
    // key or single-column key exists.
    if table.ipk_column.is_some() || pk_seen {
        debug_assert!(table.columns.iter().filter(|c| c.primary_key).count() <= 1);
    }
    Ok((table, autos))
}

fn resolve_columns(table: &Table, names: &[SmolStr]) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|n| {
            table
                .column_index(n)
                .ok_or_else(|| Error::sql(format!("no such column: {n}")))
        })
        .collect()
}

/// Build an [`Index`] from a parsed CREATE INDEX against its table.
pub fn build_index(
    db: usize,
    name: &str,
    table: &Table,
    columns: &[SmolStr],
    unique: bool,
    conflict: Option<ConflictAction>,
    root: i32,
) -> Result<Index> {
    let positions = resolve_columns(table, columns)?;
    Ok(Index {
        name: name.into(),
        db,
        root,
        table: table.name.clone(),
        columns: positions,
        on_conflict: if unique {
            Some(conflict.unwrap_or(ConflictAction::Abort))
        } else {
            None
        },
        auto: false,
    })
}

/// The master-table object for database slot `db`, bootstrapped from its
/// fabricated CREATE TABLE text.
pub fn master_table(db: usize) -> Table {
    let sql = crate::schema::master_schema_sql(db == TEMP_DB);
    let Ok(Stmt::CreateTable {
        name, columns, constraints, ..
    }) = parse_single(&sql)
    else {
        unreachable!("the fabricated master DDL always parses");
    };
    let (mut table, _) =
        build_table(db, &name.name, &columns, &constraints, MASTER_ROOT)
            .expect("the fabricated master DDL always builds");
    table.read_only = true;
    table
}

/// Populate a schema cache by replaying the master table. Each persisted
/// row re-parses in init mode: the object's root id comes from the stored
/// `rootpage`, and auto-index rows (NULL sql) only pin down the root of an
/// index the table's own DDL already implied.
pub fn load_schema(db: usize, handle: &DbHandle) -> Result<DbSchema> {
    let mut schema = DbSchema::default();
    schema.add_table(master_table(db));

    let mut cursor = handle.cursor(MASTER_ROOT, false)?;
    let mut more = cursor.first().map_err(Error::from)?;
    while more {
        let row = record::decode_record(&cursor.value().map_err(Error::from)?);
        if row.len() >= 5 {
            let kind = row[0].to_text();
            let name = row[1].to_text();
            let rootpage = row[3].as_int().unwrap_or(0) as i32;
            let sql = if row[4].is_null() {
                None
            } else {
                Some(row[4].to_text())
            };
            install_master_row(db, &mut schema, &kind, &name, rootpage, sql.as_deref())?;
        }
        more = cursor.next().map_err(Error::from)?;
    }
    Ok(schema)
}

fn install_master_row(
    db: usize,
    schema: &mut DbSchema,
    kind: &str,
    name: &str,
    rootpage: i32,
    sql: Option<&str>,
) -> Result<()> {
    match (kind, sql) {
        ("table", Some(sql)) | ("view", Some(sql)) => {
            let stmt = parse_single(sql)?;
            match stmt {
                Stmt::CreateTable {
                    name: qual,
                    columns,
                    constraints,
                    ..
                } => {
                    let (table, autos) =
                        build_table(db, &qual.name, &columns, &constraints, rootpage)?;
                    schema.add_table(table);
                    for auto in autos {
                        schema.add_index(auto);
                    }
                }
                Stmt::CreateView {
                    name: qual, select, ..
                } => {
                    let table = view_table(db, &qual.name, *select)?;
                    schema.add_table(table);
                }
                _ => {
                    return Err(corrupt_master(name));
                }
            }
        }
        ("index", Some(sql)) => {
            let Stmt::CreateIndex {
                unique,
                conflict,
                name: qual,
                table,
                columns,
            } = parse_single(sql)?
            else {
                return Err(corrupt_master(name));
            };
            let parent = schema
                .table(&table)
                .ok_or_else(|| corrupt_master(name))?
                .clone();
            let index = build_index(
                db, &qual.name, &parent, &columns, unique, conflict, rootpage,
            )?;
            schema.add_index(index);
        }
        ("index", None) => {
            // Auto-created index: the defining SQL lives with the table;
            // the row only records the container.
            let index = schema
                .index_mut(name)
                .ok_or_else(|| corrupt_master(name))?;
            index.root = rootpage;
        }
        ("trigger", Some(sql)) => {
            let Stmt::CreateTrigger {
                name: qual,
                timing,
                event,
                table,
                for_each_row,
                when,
                steps,
                ..
            } = parse_single(sql)?
            else {
                return Err(corrupt_master(name));
            };
            schema.add_trigger(Trigger {
                name: qual.name,
                db,
                table: table.name,
                table_db: db,
                timing,
                event,
                for_each_row,
                when,
                steps,
            });
        }
        _ => return Err(corrupt_master(name)),
    }
    Ok(())
}

/// A view is a read-only table whose rows come from its defining SELECT;
/// column names derive from the projection.
pub fn view_table(db: usize, name: &str, select: crate::ast::Select) -> Result<Table> {
    let columns = crate::resolve::view_column_names(&select);
    Ok(Table {
        name: name.into(),
        db,
        root: 0,
        columns: columns
            .into_iter()
            .map(|col| Column {
                name: col,
                type_name: None,
                default: None,
                not_null: false,
                not_null_conflict: None,
                primary_key: false,
            })
            .collect(),
        ipk_column: None,
        read_only: true,
        view_select: Some(Box::new(select)),
        indices: Vec::new(),
        triggers: Vec::new(),
        checks: Vec::new(),
        foreign_keys: Vec::new(),
    })
}

fn parse_single(sql: &str) -> Result<Stmt> {
    let mut parser = Parser::new(sql);
    parser
        .parse_statement()?
        .ok_or_else(|| Error::new(ErrorCode::Corrupt, "empty DDL in master table"))
}

fn corrupt_master(name: &str) -> Error {
    Error::new(
        ErrorCode::Corrupt,
        format!("malformed master table entry for {name}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::schema::MAIN_DB;

    fn parsed_table(sql: &str) -> (Table, Vec<Index>) {
        let mut parser = Parser::new(sql);
        let Some(Stmt::CreateTable {
            name,
            columns,
            constraints,
            ..
        }) = parser.parse_statement().unwrap()
        else {
            panic!("expected create table");
        };
        build_table(MAIN_DB, &name.name, &columns, &constraints, 3).unwrap()
    }

    #[test]
    fn integer_primary_key_aliases_rowid() {
        let (table, autos) = parsed_table("CREATE TABLE t(a INTEGER PRIMARY KEY, b)");
        assert_eq!(table.ipk_column, Some(0));
        assert!(autos.is_empty());
    }

    #[test]
    fn text_primary_key_gets_auto_index() {
        let (table, autos) = parsed_table("CREATE TABLE t(a TEXT PRIMARY KEY, b UNIQUE)");
        assert_eq!(table.ipk_column, None);
        assert_eq!(autos.len(), 2);
        assert!(autos.iter().all(|i| i.auto && i.is_unique()));
        assert_eq!(autos[0].name.as_str(), "(t autoindex 1)");
    }

    #[test]
    fn replace_on_check_is_rejected() {
        let mut parser =
            Parser::new("CREATE TABLE t(a, CHECK(a > 0) ON CONFLICT REPLACE)");
        let Some(Stmt::CreateTable {
            name,
            columns,
            constraints,
            ..
        }) = parser.parse_statement().unwrap()
        else {
            panic!("expected create table");
        };
        let err = build_table(MAIN_DB, &name.name, &columns, &constraints, 3).unwrap_err();
        assert!(err.message.contains("REPLACE"));
    }

    #[test]
    fn attach_reuses_holes_and_bounds_slots() {
        let mut catalog = Catalog::default();
        catalog.dbs.push(None);
        catalog.dbs.push(None);
        // Slots 0 and 1 stand in for main and temp here; attach fills 2+.
        let mk = |name: &str| AttachedDb {
            name: name.into(),
            store: DbHandle::open(":memory:", false).unwrap(),
            schema: DbSchema::default(),
            schema_sig: 0,
        };
        let a = catalog.attach(mk("a")).unwrap();
        let b = catalog.attach(mk("b")).unwrap();
        assert_eq!((a, b), (2, 3));
        catalog.detach("a").unwrap();
        assert!(catalog.dbs[2].is_none());
        let c = catalog.attach(mk("c")).unwrap();
        assert_eq!(c, 2);
        assert!(catalog.attach(mk("b")).is_err(), "duplicate name");
    }
}
