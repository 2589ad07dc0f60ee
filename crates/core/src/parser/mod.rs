//! Recursive-descent parser. Consumes the token stream and yields [`Stmt`]
//! trees; it performs no name resolution and emits no code. One statement
//! is parsed per call so the session can report the unconsumed tail.

mod expr;

use smol_str::SmolStr;

use crate::ast::*;
use crate::errors::{Error, Result};
use crate::tokenizer::{Keyword, Token, TokenKind, Tokenizer, dequote};

#[derive(Clone, Copy)]
struct Lexed<'a> {
    token: Token<'a>,
    /// Byte offset one past the token.
    end: usize,
}

pub struct Parser<'a> {
    tokens: Vec<Lexed<'a>>,
    pos: usize,
    /// Running count of `?` placeholders in the current statement.
    nvar: usize,
}

impl<'a> Parser<'a> {
    pub fn new(sql: &'a str) -> Parser<'a> {
        let mut tokens = Vec::new();
        let mut tokenizer = Tokenizer::new(sql);
        while let Some(token) = tokenizer.next() {
            if !token.kind.is_trivia() {
                tokens.push(Lexed {
                    token,
                    end: tokenizer.offset(),
                });
            }
        }
        Parser {
            tokens,
            pos: 0,
            nvar: 0,
        }
    }

    /// Parse the next statement; `None` at end of input. Leading and
    /// trailing semicolons are consumed.
    pub fn parse_statement(&mut self) -> Result<Option<Stmt>> {
        while self.eat(TokenKind::Semi) {}
        if self.peek_kind().is_none() {
            return Ok(None);
        }
        self.nvar = 0;
        let stmt = self.statement()?;
        if !self.eat(TokenKind::Semi) && self.peek_kind().is_some() {
            return Err(self.syntax_error());
        }
        Ok(Some(stmt))
    }

    /// Byte offset of the unparsed remainder of the input.
    pub fn tail_offset(&self) -> usize {
        match self.tokens.get(self.pos.wrapping_sub(1)) {
            Some(prev) if self.pos > 0 => prev.end,
            _ => 0,
        }
    }

    /// Number of `?` placeholders seen in the last parsed statement.
    pub fn parameter_count(&self) -> usize {
        self.nvar
    }

    // ---- token plumbing ---------------------------------------------

    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).map(|lexed| lexed.token)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn peek2_kind(&self) -> Option<TokenKind> {
        self.tokens.get(self.pos + 1).map(|lexed| lexed.token.kind)
    }

    fn advance(&mut self) -> Option<Token<'a>> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        self.eat(TokenKind::Keyword(kw))
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'a>> {
        if self.peek_kind() == Some(kind) {
            Ok(self.advance().expect("peeked"))
        } else {
            Err(self.syntax_error())
        }
    }

    fn expect_kw(&mut self, kw: Keyword) -> Result<()> {
        self.expect(TokenKind::Keyword(kw)).map(|_| ())
    }

    fn syntax_error(&self) -> Error {
        match self.peek() {
            Some(token) => Error::sql(format!("near \"{}\": syntax error", token.text)),
            None => Error::sql("incomplete input"),
        }
    }

    /// An object or column name: a plain or quoted identifier, a join
    /// spelling used as a name, or a string literal.
    fn name(&mut self) -> Result<SmolStr> {
        match self.peek_kind() {
            Some(TokenKind::Id | TokenKind::JoinKw | TokenKind::String) => {
                let token = self.advance().expect("peeked");
                Ok(SmolStr::new(dequote(token.text)))
            }
            _ => Err(self.syntax_error()),
        }
    }

    /// `[database.]name`
    fn qual_name(&mut self) -> Result<QualName> {
        let first = self.name()?;
        if self.eat(TokenKind::Dot) {
            let name = self.name()?;
            Ok(QualName {
                database: Some(first),
                name,
            })
        } else {
            Ok(QualName {
                database: None,
                name: first,
            })
        }
    }

    fn name_list(&mut self) -> Result<Vec<SmolStr>> {
        let mut names = vec![self.name()?];
        while self.eat(TokenKind::Comma) {
            names.push(self.name()?);
        }
        Ok(names)
    }

    fn string_or_name(&mut self) -> Result<String> {
        match self.peek_kind() {
            Some(TokenKind::String | TokenKind::Id) => {
                let token = self.advance().expect("peeked");
                Ok(dequote(token.text))
            }
            _ => Err(self.syntax_error()),
        }
    }

    // ---- statements -------------------------------------------------

    fn statement(&mut self) -> Result<Stmt> {
        let Some(TokenKind::Keyword(kw)) = self.peek_kind() else {
            return Err(self.syntax_error());
        };
        match kw {
            Keyword::Explain => {
                self.advance();
                Ok(Stmt::Explain(Box::new(self.statement()?)))
            }
            Keyword::Select => self.select_stmt().map(Stmt::Select),
            Keyword::Insert | Keyword::Replace => self.insert_stmt(),
            Keyword::Update => self.update_stmt(),
            Keyword::Delete => self.delete_stmt(),
            Keyword::Copy => self.copy_stmt(),
            Keyword::Create => self.create_stmt(),
            Keyword::Drop => self.drop_stmt(),
            Keyword::Attach => self.attach_stmt(),
            Keyword::Detach => self.detach_stmt(),
            Keyword::Begin => self.begin_stmt(),
            Keyword::Commit | Keyword::End => {
                self.advance();
                self.txn_tail()?;
                Ok(Stmt::Commit)
            }
            Keyword::Rollback => {
                self.advance();
                self.txn_tail()?;
                Ok(Stmt::Rollback)
            }
            Keyword::Vacuum => {
                self.advance();
                let name = match self.peek_kind() {
                    Some(TokenKind::Id | TokenKind::JoinKw) => Some(self.name()?),
                    _ => None,
                };
                Ok(Stmt::Vacuum(name))
            }
            Keyword::Pragma => self.pragma_stmt(),
            _ => Err(self.syntax_error()),
        }
    }

    fn txn_tail(&mut self) -> Result<()> {
        if self.eat_kw(Keyword::Transaction)
            && matches!(self.peek_kind(), Some(TokenKind::Id | TokenKind::JoinKw))
        {
            self.name()?;
        }
        Ok(())
    }

    fn begin_stmt(&mut self) -> Result<Stmt> {
        self.expect_kw(Keyword::Begin)?;
        let mode = if self.eat_kw(Keyword::Immediate) {
            TxnMode::Immediate
        } else {
            self.eat_kw(Keyword::Deferred);
            TxnMode::Deferred
        };
        self.txn_tail()?;
        Ok(Stmt::Begin(mode))
    }

    fn conflict_clause(&mut self) -> Result<Option<ConflictAction>> {
        if !self.eat_kw(Keyword::On) {
            return Ok(None);
        }
        self.expect_kw(Keyword::Conflict)?;
        self.conflict_action().map(Some)
    }

    fn conflict_action(&mut self) -> Result<ConflictAction> {
        let action = match self.peek_kind() {
            Some(TokenKind::Keyword(Keyword::Rollback)) => ConflictAction::Rollback,
            Some(TokenKind::Keyword(Keyword::Abort)) => ConflictAction::Abort,
            Some(TokenKind::Keyword(Keyword::Fail)) => ConflictAction::Fail,
            Some(TokenKind::Keyword(Keyword::Ignore)) => ConflictAction::Ignore,
            Some(TokenKind::Keyword(Keyword::Replace)) => ConflictAction::Replace,
            _ => return Err(self.syntax_error()),
        };
        self.advance();
        Ok(action)
    }

    /// `OR ROLLBACK|ABORT|FAIL|IGNORE|REPLACE` after INSERT/UPDATE/COPY.
    fn or_conflict(&mut self) -> Result<Option<ConflictAction>> {
        if self.eat_kw(Keyword::Or) {
            self.conflict_action().map(Some)
        } else {
            Ok(None)
        }
    }

    fn insert_stmt(&mut self) -> Result<Stmt> {
        let or_conflict = if self.eat_kw(Keyword::Replace) {
            Some(ConflictAction::Replace)
        } else {
            self.expect_kw(Keyword::Insert)?;
            self.or_conflict()?
        };
        self.expect_kw(Keyword::Into)?;
        let table = self.qual_name()?;
        let mut columns = Vec::new();
        if self.peek_kind() == Some(TokenKind::LParen) {
            self.advance();
            columns = self.name_list()?;
            self.expect(TokenKind::RParen)?;
        }
        let source = self.insert_source()?;
        Ok(Stmt::Insert {
            or_conflict,
            table,
            columns,
            source,
        })
    }

    fn insert_source(&mut self) -> Result<InsertSource> {
        if self.eat_kw(Keyword::Values) {
            let mut rows = Vec::new();
            loop {
                self.expect(TokenKind::LParen)?;
                rows.push(self.expr_list()?);
                self.expect(TokenKind::RParen)?;
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            Ok(InsertSource::Values(rows))
        } else if self.peek_kind() == Some(TokenKind::Keyword(Keyword::Select)) {
            Ok(InsertSource::Select(Box::new(self.select_stmt()?)))
        } else {
            Err(self.syntax_error())
        }
    }

    fn update_stmt(&mut self) -> Result<Stmt> {
        self.expect_kw(Keyword::Update)?;
        let or_conflict = self.or_conflict()?;
        let table = self.qual_name()?;
        self.expect_kw(Keyword::Set)?;
        let mut sets = Vec::new();
        loop {
            let column = self.name()?;
            self.expect(TokenKind::Eq)?;
            sets.push((column, self.expr()?));
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        let where_clause = self.where_clause()?;
        Ok(Stmt::Update {
            or_conflict,
            table,
            sets,
            where_clause,
        })
    }

    fn delete_stmt(&mut self) -> Result<Stmt> {
        self.expect_kw(Keyword::Delete)?;
        self.expect_kw(Keyword::From)?;
        let table = self.qual_name()?;
        let where_clause = self.where_clause()?;
        Ok(Stmt::Delete {
            table,
            where_clause,
        })
    }

    fn copy_stmt(&mut self) -> Result<Stmt> {
        self.expect_kw(Keyword::Copy)?;
        let or_conflict = self.or_conflict()?;
        let table = self.qual_name()?;
        self.expect_kw(Keyword::From)?;
        let file = self.string_or_name()?;
        let delimiter = if self.eat_kw(Keyword::Using) {
            self.expect_kw(Keyword::Delimiters)?;
            Some(self.string_or_name()?)
        } else {
            None
        };
        Ok(Stmt::Copy {
            or_conflict,
            table,
            file,
            delimiter,
        })
    }

    fn where_clause(&mut self) -> Result<Option<Expr>> {
        if self.eat_kw(Keyword::Where) {
            Ok(Some(self.expr()?))
        } else {
            Ok(None)
        }
    }

    fn create_stmt(&mut self) -> Result<Stmt> {
        self.expect_kw(Keyword::Create)?;
        let temp = self.eat_kw(Keyword::Temp);
        match self.peek_kind() {
            Some(TokenKind::Keyword(Keyword::Table)) => self.create_table(temp),
            Some(TokenKind::Keyword(Keyword::View)) => self.create_view(temp),
            Some(TokenKind::Keyword(Keyword::Trigger)) => self.create_trigger(temp),
            Some(TokenKind::Keyword(Keyword::Index | Keyword::Unique)) if !temp => {
                self.create_index()
            }
            _ => Err(self.syntax_error()),
        }
    }

    fn create_table(&mut self, temp: bool) -> Result<Stmt> {
        self.expect_kw(Keyword::Table)?;
        let name = self.qual_name()?;
        self.expect(TokenKind::LParen)?;
        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            if self.table_constraint_ahead() {
                constraints.push(self.table_constraint()?);
            } else {
                columns.push(self.column_def()?);
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(Stmt::CreateTable {
            temp,
            name,
            columns,
            constraints,
        })
    }

    fn table_constraint_ahead(&self) -> bool {
        matches!(
            self.peek_kind(),
            Some(TokenKind::Keyword(
                Keyword::Primary
                    | Keyword::Unique
                    | Keyword::Check
                    | Keyword::Foreign
                    | Keyword::Constraint
            ))
        )
    }

    fn table_constraint(&mut self) -> Result<TableConstraint> {
        if self.eat_kw(Keyword::Constraint) {
            self.name()?;
        }
        match self.peek_kind() {
            Some(TokenKind::Keyword(Keyword::Primary)) => {
                self.advance();
                self.expect_kw(Keyword::Key)?;
                self.expect(TokenKind::LParen)?;
                let columns = self.indexed_column_list()?;
                self.expect(TokenKind::RParen)?;
                let conflict = self.conflict_clause()?;
                Ok(TableConstraint::PrimaryKey { columns, conflict })
            }
            Some(TokenKind::Keyword(Keyword::Unique)) => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let columns = self.indexed_column_list()?;
                self.expect(TokenKind::RParen)?;
                let conflict = self.conflict_clause()?;
                Ok(TableConstraint::Unique { columns, conflict })
            }
            Some(TokenKind::Keyword(Keyword::Check)) => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let expr = self.expr()?;
                self.expect(TokenKind::RParen)?;
                let conflict = self.conflict_clause()?;
                Ok(TableConstraint::Check { expr, conflict })
            }
            Some(TokenKind::Keyword(Keyword::Foreign)) => {
                self.advance();
                self.expect_kw(Keyword::Key)?;
                self.expect(TokenKind::LParen)?;
                let columns = self.name_list()?;
                self.expect(TokenKind::RParen)?;
                let (foreign_table, foreign_columns) = self.references_clause()?;
                Ok(TableConstraint::ForeignKey {
                    columns,
                    foreign_table,
                    foreign_columns,
                })
            }
            _ => Err(self.syntax_error()),
        }
    }

    /// Column names with an optional ASC/DESC each (parsed, not recorded:
    /// index order is always ascending in storage).
    fn indexed_column_list(&mut self) -> Result<Vec<SmolStr>> {
        let mut names = Vec::new();
        loop {
            names.push(self.name()?);
            if !self.eat_kw(Keyword::Asc) {
                self.eat_kw(Keyword::Desc);
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(names)
    }

    fn references_clause(&mut self) -> Result<(SmolStr, Vec<SmolStr>)> {
        self.expect_kw(Keyword::References)?;
        let table = self.name()?;
        let mut columns = Vec::new();
        if self.eat(TokenKind::LParen) {
            columns = self.name_list()?;
            self.expect(TokenKind::RParen)?;
        }
        // ON DELETE/UPDATE actions and deferrability are accepted and
        // discarded; foreign keys are catalogued, not enforced.
        loop {
            if self.eat_kw(Keyword::On) {
                if !self.eat_kw(Keyword::Delete)
                    && !self.eat_kw(Keyword::Update)
                    && !self.eat_kw(Keyword::Insert)
                {
                    return Err(self.syntax_error());
                }
                if self.eat_kw(Keyword::Set) {
                    if !self.eat_kw(Keyword::Null) && !self.eat_kw(Keyword::Default) {
                        return Err(self.syntax_error());
                    }
                } else if !self.eat_kw(Keyword::Cascade)
                    && !self.eat_kw(Keyword::Restrict)
                    && !(self.eat_kw(Keyword::Match) && self.name().map(|_| true)?)
                {
                    return Err(self.syntax_error());
                }
            } else if self.eat_kw(Keyword::Match) {
                self.name()?;
            } else if self.eat_kw(Keyword::Not) || self.peek_kind() == Some(TokenKind::Keyword(Keyword::Deferrable)) {
                self.expect_kw(Keyword::Deferrable)?;
                if self.eat_kw(Keyword::Initially) {
                    if !self.eat_kw(Keyword::Deferred) && !self.eat_kw(Keyword::Immediate) {
                        return Err(self.syntax_error());
                    }
                }
            } else {
                break;
            }
        }
        Ok((table, columns))
    }

    fn column_def(&mut self) -> Result<ColumnDef> {
        let name = self.name()?;
        let mut def = ColumnDef {
            name,
            type_name: None,
            default: None,
            not_null: false,
            not_null_conflict: None,
            primary_key: false,
            pk_conflict: None,
            unique: false,
            unique_conflict: None,
            check: None,
        };
        def.type_name = self.type_name()?;
        loop {
            match self.peek_kind() {
                Some(TokenKind::Keyword(Keyword::Constraint)) => {
                    self.advance();
                    self.name()?;
                }
                Some(TokenKind::Keyword(Keyword::Primary)) => {
                    self.advance();
                    self.expect_kw(Keyword::Key)?;
                    if !self.eat_kw(Keyword::Asc) {
                        self.eat_kw(Keyword::Desc);
                    }
                    def.primary_key = true;
                    def.pk_conflict = self.conflict_clause()?;
                }
                Some(TokenKind::Keyword(Keyword::Not)) => {
                    self.advance();
                    self.expect_kw(Keyword::Null)?;
                    def.not_null = true;
                    def.not_null_conflict = self.conflict_clause()?;
                }
                Some(TokenKind::Keyword(Keyword::Null)) => {
                    self.advance();
                }
                Some(TokenKind::Keyword(Keyword::Unique)) => {
                    self.advance();
                    def.unique = true;
                    def.unique_conflict = self.conflict_clause()?;
                }
                Some(TokenKind::Keyword(Keyword::Check)) => {
                    self.advance();
                    self.expect(TokenKind::LParen)?;
                    def.check = Some(self.expr()?);
                    self.expect(TokenKind::RParen)?;
                    self.conflict_clause()?;
                }
                Some(TokenKind::Keyword(Keyword::Default)) => {
                    self.advance();
                    def.default = Some(self.default_value()?);
                }
                Some(TokenKind::Keyword(Keyword::Collate)) => {
                    self.advance();
                    self.name()?;
                }
                Some(TokenKind::Keyword(Keyword::References)) => {
                    let (table, columns) = self.references_clause()?;
                    let _ = (table, columns);
                }
                _ => break,
            }
        }
        Ok(def)
    }

    fn type_name(&mut self) -> Result<Option<String>> {
        let mut parts: Vec<String> = Vec::new();
        while matches!(self.peek_kind(), Some(TokenKind::Id)) {
            let token = self.advance().expect("peeked");
            parts.push(dequote(token.text));
        }
        if parts.is_empty() {
            return Ok(None);
        }
        let mut text = parts.join(" ");
        if self.eat(TokenKind::LParen) {
            text.push('(');
            let mut first = true;
            loop {
                match self.peek_kind() {
                    Some(TokenKind::Integer | TokenKind::Float) => {
                        if !first {
                            text.push(',');
                        }
                        first = false;
                        text.push_str(self.advance().expect("peeked").text);
                    }
                    Some(TokenKind::Plus | TokenKind::Minus) => {
                        text.push_str(self.advance().expect("peeked").text);
                        continue;
                    }
                    _ => return Err(self.syntax_error()),
                }
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            text.push(')');
        }
        Ok(Some(text))
    }

    /// DEFAULT accepts a literal, a signed number, or NULL.
    fn default_value(&mut self) -> Result<Expr> {
        match self.peek_kind() {
            Some(TokenKind::String) => {
                let token = self.advance().expect("peeked");
                Ok(Expr::String(dequote(token.text)))
            }
            Some(TokenKind::Keyword(Keyword::Null)) => {
                self.advance();
                Ok(Expr::Null)
            }
            Some(TokenKind::Minus | TokenKind::Plus) => {
                let negative = self.advance().expect("peeked").kind == TokenKind::Minus;
                let literal = self.number_literal()?;
                Ok(if negative {
                    Expr::Unary(UnaryOp::Negate, Box::new(literal))
                } else {
                    literal
                })
            }
            Some(TokenKind::Integer | TokenKind::Float) => self.number_literal(),
            _ => Err(self.syntax_error()),
        }
    }

    fn number_literal(&mut self) -> Result<Expr> {
        match self.peek_kind() {
            Some(TokenKind::Integer) => {
                let token = self.advance().expect("peeked");
                match token.text.parse::<i64>() {
                    Ok(value) => Ok(Expr::Integer(value)),
                    Err(_) => token
                        .text
                        .parse::<f64>()
                        .map(Expr::Float)
                        .map_err(|_| Error::sql(format!("malformed number {}", token.text))),
                }
            }
            Some(TokenKind::Float) => {
                let token = self.advance().expect("peeked");
                token
                    .text
                    .parse::<f64>()
                    .map(Expr::Float)
                    .map_err(|_| Error::sql(format!("malformed number {}", token.text)))
            }
            _ => Err(self.syntax_error()),
        }
    }

    fn create_index(&mut self) -> Result<Stmt> {
        let unique = self.eat_kw(Keyword::Unique);
        self.expect_kw(Keyword::Index)?;
        let name = self.qual_name()?;
        self.expect_kw(Keyword::On)?;
        let table = self.name()?;
        self.expect(TokenKind::LParen)?;
        let columns = self.indexed_column_list()?;
        self.expect(TokenKind::RParen)?;
        let conflict = self.conflict_clause()?;
        Ok(Stmt::CreateIndex {
            unique,
            conflict,
            name,
            table,
            columns,
        })
    }

    fn create_view(&mut self, temp: bool) -> Result<Stmt> {
        self.expect_kw(Keyword::View)?;
        let name = self.qual_name()?;
        self.expect_kw(Keyword::As)?;
        let select = self.select_stmt()?;
        Ok(Stmt::CreateView {
            temp,
            name,
            select: Box::new(select),
        })
    }

    fn create_trigger(&mut self, temp: bool) -> Result<Stmt> {
        self.expect_kw(Keyword::Trigger)?;
        let name = self.qual_name()?;
        let timing = if self.eat_kw(Keyword::Before) {
            TriggerTiming::Before
        } else if self.eat_kw(Keyword::After) {
            TriggerTiming::After
        } else if self.eat_kw(Keyword::Instead) {
            // INSTEAD OF is rewritten to BEFORE while parsing.
            self.expect_kw(Keyword::Of)?;
            TriggerTiming::Before
        } else {
            TriggerTiming::Before
        };
        let event = match self.peek_kind() {
            Some(TokenKind::Keyword(Keyword::Insert)) => {
                self.advance();
                TriggerEvent::Insert
            }
            Some(TokenKind::Keyword(Keyword::Delete)) => {
                self.advance();
                TriggerEvent::Delete
            }
            Some(TokenKind::Keyword(Keyword::Update)) => {
                self.advance();
                if self.eat_kw(Keyword::Of) {
                    TriggerEvent::Update(self.name_list()?)
                } else {
                    TriggerEvent::Update(Vec::new())
                }
            }
            _ => return Err(self.syntax_error()),
        };
        self.expect_kw(Keyword::On)?;
        let table = self.qual_name()?;
        // Row granularity is the default; FOR EACH STATEMENT is parsed
        // and rejected downstream.
        let mut for_each_row = true;
        if self.eat_kw(Keyword::For) {
            self.expect_kw(Keyword::Each)?;
            if !self.eat_kw(Keyword::Row) {
                self.expect_kw(Keyword::Statement)?;
                for_each_row = false;
            }
        }
        let when = if self.eat_kw(Keyword::When) {
            Some(self.expr()?)
        } else {
            None
        };
        self.expect_kw(Keyword::Begin)?;
        let mut steps = Vec::new();
        while !self.eat_kw(Keyword::End) {
            steps.push(self.trigger_step()?);
            self.expect(TokenKind::Semi)?;
        }
        Ok(Stmt::CreateTrigger {
            temp,
            name,
            timing,
            event,
            table,
            for_each_row,
            when,
            steps,
        })
    }

    fn trigger_step(&mut self) -> Result<TriggerStep> {
        match self.statement()? {
            Stmt::Select(select) => Ok(TriggerStep::Select(select)),
            Stmt::Insert {
                or_conflict,
                table,
                columns,
                source,
            } if table.database.is_none() => Ok(TriggerStep::Insert {
                or_conflict,
                table: table.name,
                columns,
                source,
            }),
            Stmt::Update {
                or_conflict,
                table,
                sets,
                where_clause,
            } if table.database.is_none() => Ok(TriggerStep::Update {
                or_conflict,
                table: table.name,
                sets,
                where_clause,
            }),
            Stmt::Delete {
                table,
                where_clause,
            } if table.database.is_none() => Ok(TriggerStep::Delete {
                table: table.name,
                where_clause,
            }),
            _ => Err(Error::sql(
                "only SELECT, INSERT, UPDATE and DELETE on unqualified names \
                 are allowed inside a trigger",
            )),
        }
    }

    fn drop_stmt(&mut self) -> Result<Stmt> {
        self.expect_kw(Keyword::Drop)?;
        let kind = match self.peek_kind() {
            Some(TokenKind::Keyword(Keyword::Table)) => DropKind::Table,
            Some(TokenKind::Keyword(Keyword::Index)) => DropKind::Index,
            Some(TokenKind::Keyword(Keyword::View)) => DropKind::View,
            Some(TokenKind::Keyword(Keyword::Trigger)) => DropKind::Trigger,
            _ => return Err(self.syntax_error()),
        };
        self.advance();
        let name = self.qual_name()?;
        Ok(Stmt::Drop { kind, name })
    }

    fn attach_stmt(&mut self) -> Result<Stmt> {
        self.expect_kw(Keyword::Attach)?;
        self.eat_kw(Keyword::Database);
        let filename = self.string_or_name()?;
        self.expect_kw(Keyword::As)?;
        let db_name = self.name()?;
        Ok(Stmt::Attach { filename, db_name })
    }

    fn detach_stmt(&mut self) -> Result<Stmt> {
        self.expect_kw(Keyword::Detach)?;
        self.eat_kw(Keyword::Database);
        let db_name = self.name()?;
        Ok(Stmt::Detach { db_name })
    }

    fn pragma_stmt(&mut self) -> Result<Stmt> {
        self.expect_kw(Keyword::Pragma)?;
        let qual = self.qual_name()?;
        let value = if self.eat(TokenKind::Eq) {
            Some(self.pragma_value()?)
        } else if self.eat(TokenKind::LParen) {
            let value = self.pragma_value()?;
            self.expect(TokenKind::RParen)?;
            Some(value)
        } else {
            None
        };
        Ok(Stmt::Pragma {
            database: qual.database,
            name: qual.name,
            value,
        })
    }

    fn pragma_value(&mut self) -> Result<String> {
        match self.peek_kind() {
            Some(
                TokenKind::Id
                | TokenKind::String
                | TokenKind::Integer
                | TokenKind::Float
                | TokenKind::JoinKw,
            ) => {
                let token = self.advance().expect("peeked");
                Ok(dequote(token.text))
            }
            Some(TokenKind::Keyword(kw))
                if matches!(kw, Keyword::On | Keyword::Default | Keyword::Null) =>
            {
                let token = self.advance().expect("peeked");
                Ok(token.text.to_string())
            }
            Some(TokenKind::Minus) => {
                self.advance();
                let token = self.expect(TokenKind::Integer)?;
                Ok(format!("-{}", token.text))
            }
            _ => Err(self.syntax_error()),
        }
    }

    // ---- SELECT -----------------------------------------------------

    /// A full select: compound chain plus trailing ORDER BY and LIMIT,
    /// which apply to the whole compound.
    pub(crate) fn select_stmt(&mut self) -> Result<Select> {
        let mut select = self.one_select()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Keyword(Keyword::Union)) => {
                    self.advance();
                    if self.eat_kw(Keyword::All) {
                        CompoundOp::UnionAll
                    } else {
                        CompoundOp::Union
                    }
                }
                Some(TokenKind::Keyword(Keyword::Intersect)) => {
                    self.advance();
                    CompoundOp::Intersect
                }
                Some(TokenKind::Keyword(Keyword::Except)) => {
                    self.advance();
                    CompoundOp::Except
                }
                _ => break,
            };
            let mut next = self.one_select()?;
            next.compound = Some((op, Box::new(select)));
            select = next;
        }
        if self.eat_kw(Keyword::Order) {
            self.expect_kw(Keyword::By)?;
            select.order_by = self.sort_list()?;
        }
        select.limit = self.limit_clause()?;
        Ok(select)
    }

    fn one_select(&mut self) -> Result<Select> {
        self.expect_kw(Keyword::Select)?;
        let distinct = if self.eat_kw(Keyword::Distinct) {
            true
        } else {
            self.eat_kw(Keyword::All);
            false
        };
        let columns = self.result_columns()?;
        let from = if self.eat_kw(Keyword::From) {
            self.src_list()?
        } else {
            Vec::new()
        };
        let where_clause = self.where_clause()?;
        let mut group_by = Vec::new();
        let mut having = None;
        if self.eat_kw(Keyword::Group) {
            self.expect_kw(Keyword::By)?;
            group_by = self.expr_list()?;
            if self.eat_kw(Keyword::Having) {
                having = Some(self.expr()?);
            }
        }
        Ok(Select {
            distinct,
            columns,
            from,
            where_clause,
            group_by,
            having,
            order_by: Vec::new(),
            limit: None,
            compound: None,
        })
    }

    fn result_columns(&mut self) -> Result<Vec<ResultColumn>> {
        let mut columns = Vec::new();
        loop {
            if self.eat(TokenKind::Star) {
                columns.push(ResultColumn::Star);
            } else if self.peek_kind() == Some(TokenKind::Id)
                && self.peek2_kind() == Some(TokenKind::Dot)
                && self.tokens.get(self.pos + 2).map(|l| l.token.kind) == Some(TokenKind::Star)
            {
                let table = self.name()?;
                self.advance();
                self.advance();
                columns.push(ResultColumn::TableStar(table));
            } else {
                let expr = self.expr()?;
                let alias = if self.eat_kw(Keyword::As) {
                    Some(self.name()?)
                } else if matches!(self.peek_kind(), Some(TokenKind::Id | TokenKind::String)) {
                    Some(self.name()?)
                } else {
                    None
                };
                columns.push(ResultColumn::Expr { expr, alias });
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(columns)
    }

    fn src_list(&mut self) -> Result<SrcList> {
        let mut list = vec![self.src_item(JoinKind::default())?];
        loop {
            if self.eat(TokenKind::Comma) {
                list.push(self.src_item(JoinKind::default())?);
                continue;
            }
            let Some(join) = self.join_operator()? else {
                break;
            };
            let mut item = self.src_item(join)?;
            if self.eat_kw(Keyword::On) {
                item.on_clause = Some(self.expr()?);
            } else if self.eat_kw(Keyword::Using) {
                self.expect(TokenKind::LParen)?;
                item.using = self.name_list()?;
                self.expect(TokenKind::RParen)?;
            }
            list.push(item);
        }
        Ok(list)
    }

    /// Parse a join operator, if one is next. RIGHT and FULL OUTER joins
    /// are recognised and rejected.
    fn join_operator(&mut self) -> Result<Option<JoinKind>> {
        let mut join = JoinKind::default();
        let mut seen = false;
        while self.peek_kind() == Some(TokenKind::JoinKw) {
            let token = self.advance().expect("peeked");
            seen = true;
            match token.text.to_ascii_uppercase().as_str() {
                "NATURAL" => join.natural = true,
                "LEFT" => join.left_outer = true,
                "OUTER" | "INNER" | "CROSS" => {}
                other => {
                    return Err(Error::sql(format!(
                        "{other} joins are not supported"
                    )));
                }
            }
        }
        if self.eat_kw(Keyword::Join) {
            Ok(Some(join))
        } else if seen {
            Err(self.syntax_error())
        } else {
            Ok(None)
        }
    }

    fn src_item(&mut self, join: JoinKind) -> Result<SrcItem> {
        if self.eat(TokenKind::LParen) {
            let select = self.select_stmt()?;
            self.expect(TokenKind::RParen)?;
            let alias = if self.eat_kw(Keyword::As) {
                Some(self.name()?)
            } else if matches!(self.peek_kind(), Some(TokenKind::Id)) {
                Some(self.name()?)
            } else {
                None
            };
            return Ok(SrcItem {
                database: None,
                table: SmolStr::default(),
                alias,
                subquery: Some(Box::new(select)),
                join,
                on_clause: None,
                using: Vec::new(),
            });
        }
        let qual = self.qual_name()?;
        let alias = if self.eat_kw(Keyword::As) {
            Some(self.name()?)
        } else if matches!(self.peek_kind(), Some(TokenKind::Id)) {
            Some(self.name()?)
        } else {
            None
        };
        Ok(SrcItem {
            database: qual.database,
            table: qual.name,
            alias,
            subquery: None,
            join,
            on_clause: None,
            using: Vec::new(),
        })
    }

    fn sort_list(&mut self) -> Result<Vec<SortItem>> {
        let mut items = Vec::new();
        loop {
            let expr = self.expr()?;
            let order = if self.eat_kw(Keyword::Desc) {
                SortOrder::Desc
            } else {
                self.eat_kw(Keyword::Asc);
                SortOrder::Asc
            };
            items.push(SortItem { expr, order });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(items)
    }

    /// `LIMIT n [OFFSET m]` or `LIMIT m, n`. Counts are integer literals.
    fn limit_clause(&mut self) -> Result<Option<Limit>> {
        if !self.eat_kw(Keyword::Limit) {
            return Ok(None);
        }
        let first = self.signed_integer()?;
        if self.eat_kw(Keyword::Offset) {
            let offset = self.signed_integer()?;
            Ok(Some(Limit {
                limit: first,
                offset,
            }))
        } else if self.eat(TokenKind::Comma) {
            let limit = self.signed_integer()?;
            Ok(Some(Limit {
                limit,
                offset: first,
            }))
        } else {
            Ok(Some(Limit {
                limit: first,
                offset: 0,
            }))
        }
    }

    fn signed_integer(&mut self) -> Result<i64> {
        let negative = self.eat(TokenKind::Minus);
        let token = self.expect(TokenKind::Integer)?;
        let value: i64 = token
            .text
            .parse()
            .map_err(|_| Error::sql(format!("malformed number {}", token.text)))?;
        Ok(if negative { -value } else { value })
    }

    pub(crate) fn expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut list = vec![self.expr()?];
        while self.eat(TokenKind::Comma) {
            list.push(self.expr()?);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(sql: &str) -> Stmt {
        let mut parser = Parser::new(sql);
        parser.parse_statement().unwrap().unwrap()
    }

    #[test]
    fn parses_multi_row_values() {
        let Stmt::Insert { source, .. } = parse_one("INSERT INTO t VALUES(1,'x'),(2,'y')")
        else {
            panic!("expected insert");
        };
        let InsertSource::Values(rows) = source else {
            panic!("expected values");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Expr::Integer(1));
        assert_eq!(rows[1][1], Expr::String("y".into()));
    }

    #[test]
    fn replace_is_insert_or_replace() {
        let Stmt::Insert { or_conflict, .. } = parse_one("REPLACE INTO t VALUES(1)") else {
            panic!("expected insert");
        };
        assert_eq!(or_conflict, Some(ConflictAction::Replace));
    }

    #[test]
    fn parses_qualified_insert() {
        let Stmt::Insert { table, .. } = parse_one("INSERT INTO aux.t VALUES(1)") else {
            panic!("expected insert");
        };
        assert_eq!(table.database.as_deref(), Some("aux"));
        assert_eq!(table.name.as_str(), "t");
    }

    #[test]
    fn parses_create_table_with_constraints() {
        let Stmt::CreateTable {
            columns,
            constraints,
            ..
        } = parse_one(
            "CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT NOT NULL ON CONFLICT IGNORE, \
             c UNIQUE, UNIQUE(b, c), CHECK(a > 0))",
        )
        else {
            panic!("expected create table");
        };
        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary_key);
        assert!(columns[1].not_null);
        assert_eq!(columns[1].not_null_conflict, Some(ConflictAction::Ignore));
        assert!(columns[2].unique);
        assert_eq!(constraints.len(), 2);
    }

    #[test]
    fn parses_left_join_with_on() {
        let Stmt::Select(select) = parse_one("SELECT * FROM a LEFT OUTER JOIN b ON a.x = b.x")
        else {
            panic!("expected select");
        };
        assert_eq!(select.from.len(), 2);
        assert!(select.from[1].join.left_outer);
        assert!(select.from[1].on_clause.is_some());
    }

    #[test]
    fn rejects_right_join() {
        let mut parser = Parser::new("SELECT * FROM a RIGHT JOIN b");
        assert!(parser.parse_statement().is_err());
    }

    #[test]
    fn parses_compound_select_with_order() {
        let Stmt::Select(select) =
            parse_one("SELECT a FROM t UNION SELECT b FROM u ORDER BY 1 LIMIT 10 OFFSET 2")
        else {
            panic!("expected select");
        };
        let (op, prior) = select.compound.as_ref().unwrap();
        assert_eq!(*op, CompoundOp::Union);
        assert!(prior.compound.is_none());
        assert_eq!(select.order_by.len(), 1);
        assert_eq!(
            select.limit,
            Some(Limit {
                limit: 10,
                offset: 2
            })
        );
    }

    #[test]
    fn parses_trigger_body() {
        let Stmt::CreateTrigger {
            timing,
            event,
            steps,
            ..
        } = parse_one(
            "CREATE TRIGGER tr AFTER INSERT ON t BEGIN \
             INSERT INTO log VALUES(new.a); \
             DELETE FROM other WHERE x = 1; \
             END",
        )
        else {
            panic!("expected create trigger");
        };
        assert_eq!(timing, TriggerTiming::After);
        assert_eq!(event, TriggerEvent::Insert);
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn instead_of_becomes_before() {
        let Stmt::CreateTrigger { timing, .. } = parse_one(
            "CREATE TRIGGER tr INSTEAD OF DELETE ON v BEGIN SELECT 1; END",
        ) else {
            panic!("expected create trigger");
        };
        assert_eq!(timing, TriggerTiming::Before);
    }

    #[test]
    fn reports_tail_offset() {
        let sql = "SELECT 1; SELECT 2";
        let mut parser = Parser::new(sql);
        parser.parse_statement().unwrap();
        assert_eq!(&sql[parser.tail_offset()..], " SELECT 2");
    }

    #[test]
    fn pragma_forms() {
        let Stmt::Pragma { name, value, .. } = parse_one("PRAGMA count_changes = ON") else {
            panic!("expected pragma");
        };
        assert_eq!(name.as_str(), "count_changes");
        assert_eq!(value.as_deref(), Some("ON"));

        let Stmt::Pragma { database, name, .. } = parse_one("PRAGMA aux.table_info(t1)") else {
            panic!("expected pragma");
        };
        assert_eq!(database.as_deref(), Some("aux"));
        assert_eq!(name.as_str(), "table_info");
    }

    #[test]
    fn syntax_error_names_the_token() {
        let mut parser = Parser::new("SELECT FROM WHERE");
        let err = parser.parse_statement().unwrap_err();
        assert!(err.message.contains("near \"FROM\""), "{}", err.message);
    }
}
