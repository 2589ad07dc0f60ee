//! In-memory schema objects and the per-database catalog. Objects are
//! owned by their catalog maps and refer to each other by name; the maps
//! are insertion-ordered and keyed case-insensitively.

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::ast::{ConflictAction, Expr, Select, TriggerEvent, TriggerStep, TriggerTiming};

/// Databases attached to a connection: slot 0 is main, slot 1 is temp.
pub const MAIN_DB: usize = 0;
pub const TEMP_DB: usize = 1;

/// Upper bound on ATTACHed databases (beyond main and temp).
pub const MAX_ATTACHED: usize = 10;

pub const MASTER_NAME: &str = "squill_master";
pub const TEMP_MASTER_NAME: &str = "squill_temp_master";

/// The fabricated schema of the master table itself.
pub fn master_schema_sql(temp: bool) -> String {
    let name = if temp { TEMP_MASTER_NAME } else { MASTER_NAME };
    format!(
        "CREATE TABLE {name}(\n  type TEXT,\n  name TEXT,\n  tbl_name TEXT,\n  rootpage INTEGER,\n  sql TEXT\n)"
    )
}

pub fn master_name(db: usize) -> &'static str {
    if db == TEMP_DB { TEMP_MASTER_NAME } else { MASTER_NAME }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: SmolStr,
    pub type_name: Option<String>,
    pub default: Option<Expr>,
    pub not_null: bool,
    pub not_null_conflict: Option<ConflictAction>,
    pub primary_key: bool,
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub columns: Vec<SmolStr>,
    pub foreign_table: SmolStr,
    pub foreign_columns: Vec<SmolStr>,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: SmolStr,
    /// Owning database slot.
    pub db: usize,
    /// Storage container; 0 for views.
    pub root: i32,
    pub columns: Vec<Column>,
    /// Column declared INTEGER PRIMARY KEY, which aliases the row id.
    pub ipk_column: Option<usize>,
    pub read_only: bool,
    /// Defining SELECT when this is a view.
    pub view_select: Option<Box<Select>>,
    /// Names of the indices over this table, oldest first.
    pub indices: Vec<SmolStr>,
    /// Names of the triggers on this table.
    pub triggers: Vec<SmolStr>,
    pub checks: Vec<(Expr, ConflictAction)>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    pub fn is_view(&self) -> bool {
        self.view_select.is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
pub struct Index {
    pub name: SmolStr,
    pub db: usize,
    pub root: i32,
    pub table: SmolStr,
    /// Positions of the indexed columns in the parent table.
    pub columns: Vec<usize>,
    /// Conflict action for the implied UNIQUE constraint; `None` for a
    /// non-unique index.
    pub on_conflict: Option<ConflictAction>,
    /// Auto-created indices (PRIMARY KEY, UNIQUE constraints) persist a
    /// NULL sql text in the master table.
    pub auto: bool,
}

impl Index {
    pub fn is_unique(&self) -> bool {
        self.on_conflict.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Trigger {
    pub name: SmolStr,
    pub db: usize,
    pub table: SmolStr,
    pub table_db: usize,
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    pub for_each_row: bool,
    pub when: Option<Expr>,
    pub steps: Vec<TriggerStep>,
}

/// One attached database's schema cache.
#[derive(Debug, Default)]
pub struct DbSchema {
    tables: IndexMap<String, Table>,
    indices: IndexMap<String, Index>,
    triggers: IndexMap<String, Trigger>,
}

fn fold(name: &str) -> String {
    name.to_lowercase()
}

impl DbSchema {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(&fold(name))
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(&fold(name))
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(fold(&table.name), table);
    }

    pub fn remove_table(&mut self, name: &str) -> Option<Table> {
        self.tables.shift_remove(&fold(name))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indices.get(&fold(name))
    }

    pub fn index_mut(&mut self, name: &str) -> Option<&mut Index> {
        self.indices.get_mut(&fold(name))
    }

    pub fn add_index(&mut self, index: Index) {
        if let Some(table) = self.tables.get_mut(&fold(&index.table)) {
            table.indices.push(index.name.clone());
        }
        self.indices.insert(fold(&index.name), index);
    }

    pub fn remove_index(&mut self, name: &str) -> Option<Index> {
        let index = self.indices.shift_remove(&fold(name))?;
        if let Some(table) = self.tables.get_mut(&fold(&index.table)) {
            table.indices.retain(|n| !n.eq_ignore_ascii_case(name));
        }
        Some(index)
    }

    pub fn indices(&self) -> impl Iterator<Item = &Index> {
        self.indices.values()
    }

    pub fn trigger(&self, name: &str) -> Option<&Trigger> {
        self.triggers.get(&fold(name))
    }

    pub fn add_trigger(&mut self, trigger: Trigger) {
        if trigger.db == trigger.table_db {
            if let Some(table) = self.tables.get_mut(&fold(&trigger.table)) {
                table.triggers.push(trigger.name.clone());
            }
        }
        self.triggers.insert(fold(&trigger.name), trigger);
    }

    pub fn remove_trigger(&mut self, name: &str) -> Option<Trigger> {
        let trigger = self.triggers.shift_remove(&fold(name))?;
        if let Some(table) = self.tables.get_mut(&fold(&trigger.table)) {
            table.triggers.retain(|n| !n.eq_ignore_ascii_case(name));
        }
        Some(trigger)
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.values()
    }

    /// Any schema object with this name, of any kind?
    pub fn name_in_use(&self, name: &str) -> bool {
        let key = fold(name);
        self.tables.contains_key(&key)
            || self.indices.contains_key(&key)
            || self.triggers.contains_key(&key)
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.indices.clear();
        self.triggers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> Table {
        Table {
            name: name.into(),
            db: MAIN_DB,
            root: 3,
            columns: vec![Column {
                name: "a".into(),
                type_name: None,
                default: None,
                not_null: false,
                not_null_conflict: None,
                primary_key: false,
            }],
            ipk_column: None,
            read_only: false,
            view_select: None,
            indices: Vec::new(),
            triggers: Vec::new(),
            checks: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut schema = DbSchema::default();
        schema.add_table(table("People"));
        assert!(schema.table("PEOPLE").is_some());
        assert!(schema.table("people").is_some());
        assert_eq!(schema.table("people").unwrap().name.as_str(), "People");
    }

    #[test]
    fn index_links_to_parent_table() {
        let mut schema = DbSchema::default();
        schema.add_table(table("t"));
        schema.add_index(Index {
            name: "i1".into(),
            db: MAIN_DB,
            root: 4,
            table: "T".into(),
            columns: vec![0],
            on_conflict: None,
            auto: false,
        });
        assert_eq!(schema.table("t").unwrap().indices, vec![SmolStr::from("i1")]);
        schema.remove_index("I1");
        assert!(schema.table("t").unwrap().indices.is_empty());
    }
}
