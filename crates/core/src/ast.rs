//! Statement and expression trees produced by the parser. The parser only
//! builds these; a separate compile pass resolves names and lowers them to
//! VDBE programs.

use smol_str::SmolStr;

/// What to do when a constraint check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ConflictAction {
    Rollback,
    Abort,
    Fail,
    Ignore,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A possibly database-qualified object name, e.g. `aux.t1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualName {
    pub database: Option<SmolStr>,
    pub name: SmolStr,
}

impl QualName {
    pub fn bare(name: impl Into<SmolStr>) -> QualName {
        QualName {
            database: None,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    ShiftLeft,
    ShiftRight,
}

/// Which column of a source a resolved reference addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnPos {
    Rowid,
    Idx(usize),
}

/// Resolver output: a column pinned to a from-list entry. `level` counts
/// enclosing name scopes outward (0 = innermost), for correlated
/// subqueries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRef {
    pub level: usize,
    pub src: usize,
    pub column: ColumnPos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RaiseKind {
    Ignore,
    Rollback(String),
    Abort(String),
    Fail(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    /// `?` placeholder with its 1-based bind index.
    Parameter(usize),
    /// Unresolved bare identifier.
    Name(SmolStr),
    /// Unresolved `table.column`.
    Qualified(SmolStr, SmolStr),
    /// Unresolved `database.table.column`.
    DbQualified(SmolStr, SmolStr, SmolStr),
    /// Resolved column reference (resolver output).
    Column(ColumnRef),
    /// Aggregate-context slot reference (compiler-internal).
    AggRef(usize),
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSelect {
        expr: Box<Expr>,
        select: Box<Select>,
        negated: bool,
    },
    Function {
        name: SmolStr,
        args: Vec<Expr>,
        /// `count(*)` style call.
        star: bool,
    },
    Case {
        base: Option<Box<Expr>>,
        whens: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    /// Scalar subquery.
    Select(Box<Select>),
    Raise(RaiseKind),
}

impl Expr {
    pub fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Expr {
        Expr::Binary(Box::new(lhs), op, Box::new(rhs))
    }

    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Null
            | Expr::Integer(_)
            | Expr::Float(_)
            | Expr::String(_)
            | Expr::Parameter(_) => true,
            Expr::Unary(_, e) => e.is_constant(),
            Expr::Binary(l, _, r) => l.is_constant() && r.is_constant(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultColumn {
    /// `expr [AS alias]`
    Expr {
        expr: Expr,
        alias: Option<SmolStr>,
    },
    /// `*`
    Star,
    /// `table.*`
    TableStar(SmolStr),
}

/// How a from-list entry joins to the one before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinKind {
    pub natural: bool,
    pub left_outer: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SrcItem {
    pub database: Option<SmolStr>,
    pub table: SmolStr,
    pub alias: Option<SmolStr>,
    /// Parenthesised SELECT in the FROM clause.
    pub subquery: Option<Box<Select>>,
    pub join: JoinKind,
    pub on_clause: Option<Expr>,
    pub using: Vec<SmolStr>,
}

pub type SrcList = Vec<SrcItem>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Union,
    UnionAll,
    Intersect,
    Except,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortItem {
    pub expr: Expr,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub columns: Vec<ResultColumn>,
    pub from: SrcList,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<SortItem>,
    pub limit: Option<Limit>,
    /// UNION/INTERSECT/EXCEPT chain; the operand is the *prior* select.
    pub compound: Option<(CompoundOp, Box<Select>)>,
}

impl Select {
    pub fn simple(columns: Vec<ResultColumn>, from: SrcList) -> Select {
        Select {
            distinct: false,
            columns,
            from,
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            compound: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: SmolStr,
    pub type_name: Option<String>,
    pub default: Option<Expr>,
    pub not_null: bool,
    pub not_null_conflict: Option<ConflictAction>,
    pub primary_key: bool,
    pub pk_conflict: Option<ConflictAction>,
    pub unique: bool,
    pub unique_conflict: Option<ConflictAction>,
    pub check: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableConstraint {
    PrimaryKey {
        columns: Vec<SmolStr>,
        conflict: Option<ConflictAction>,
    },
    Unique {
        columns: Vec<SmolStr>,
        conflict: Option<ConflictAction>,
    },
    Check {
        expr: Expr,
        conflict: Option<ConflictAction>,
    },
    /// Recorded for `PRAGMA foreign_key_list`; not enforced.
    ForeignKey {
        columns: Vec<SmolStr>,
        foreign_table: SmolStr,
        foreign_columns: Vec<SmolStr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    Select(Box<Select>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEvent {
    Insert,
    Delete,
    Update(Vec<SmolStr>),
}

/// One statement of a trigger body.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerStep {
    Select(Select),
    Insert {
        or_conflict: Option<ConflictAction>,
        table: SmolStr,
        columns: Vec<SmolStr>,
        source: InsertSource,
    },
    Update {
        or_conflict: Option<ConflictAction>,
        table: SmolStr,
        sets: Vec<(SmolStr, Expr)>,
        where_clause: Option<Expr>,
    },
    Delete {
        table: SmolStr,
        where_clause: Option<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    Deferred,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    Table,
    Index,
    View,
    Trigger,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Select(Select),
    Insert {
        or_conflict: Option<ConflictAction>,
        table: QualName,
        columns: Vec<SmolStr>,
        source: InsertSource,
    },
    Update {
        or_conflict: Option<ConflictAction>,
        table: QualName,
        sets: Vec<(SmolStr, Expr)>,
        where_clause: Option<Expr>,
    },
    Delete {
        table: QualName,
        where_clause: Option<Expr>,
    },
    Copy {
        or_conflict: Option<ConflictAction>,
        table: QualName,
        file: String,
        delimiter: Option<String>,
    },
    CreateTable {
        temp: bool,
        name: QualName,
        columns: Vec<ColumnDef>,
        constraints: Vec<TableConstraint>,
    },
    CreateIndex {
        unique: bool,
        conflict: Option<ConflictAction>,
        name: QualName,
        table: SmolStr,
        columns: Vec<SmolStr>,
    },
    CreateView {
        temp: bool,
        name: QualName,
        select: Box<Select>,
    },
    CreateTrigger {
        temp: bool,
        name: QualName,
        timing: TriggerTiming,
        event: TriggerEvent,
        table: QualName,
        for_each_row: bool,
        when: Option<Expr>,
        steps: Vec<TriggerStep>,
    },
    Drop {
        kind: DropKind,
        name: QualName,
    },
    Attach {
        filename: String,
        db_name: SmolStr,
    },
    Detach {
        db_name: SmolStr,
    },
    Begin(TxnMode),
    Commit,
    Rollback,
    Vacuum(Option<SmolStr>),
    Pragma {
        database: Option<SmolStr>,
        name: SmolStr,
        value: Option<String>,
    },
    Explain(Box<Stmt>),
}
