//! Expression parsing: precedence climbing over the operator table, with
//! the SQL special forms (BETWEEN, IN, LIKE/GLOB, IS NULL, CASE, RAISE)
//! folded in at their grammar precedence.

use smol_str::SmolStr;

use crate::ast::{BinaryOp, Expr, RaiseKind, UnaryOp};
use crate::errors::{Error, Result};
use crate::tokenizer::{Keyword, TokenKind, dequote};

use super::Parser;

/// Left binding power of the comparison tier; NOT-prefixed special forms
/// and IS/ISNULL/NOTNULL all sit here.
const BP_COMPARE: u8 = 7;

fn infix_power(kind: TokenKind) -> Option<(u8, u8, BinaryOp)> {
    use BinaryOp::*;
    Some(match kind {
        TokenKind::Keyword(Keyword::Or) => (1, 2, Or),
        TokenKind::Keyword(Keyword::And) => (3, 4, And),
        TokenKind::Eq => (BP_COMPARE, 8, Eq),
        TokenKind::Ne => (BP_COMPARE, 8, Ne),
        TokenKind::Lt => (9, 10, Lt),
        TokenKind::Le => (9, 10, Le),
        TokenKind::Gt => (9, 10, Gt),
        TokenKind::Ge => (9, 10, Ge),
        TokenKind::BitAnd => (11, 12, BitAnd),
        TokenKind::BitOr => (11, 12, BitOr),
        TokenKind::LShift => (11, 12, ShiftLeft),
        TokenKind::RShift => (11, 12, ShiftRight),
        TokenKind::Plus => (13, 14, Add),
        TokenKind::Minus => (13, 14, Subtract),
        TokenKind::Star => (15, 16, Multiply),
        TokenKind::Slash => (15, 16, Divide),
        TokenKind::Rem => (15, 16, Remainder),
        TokenKind::Concat => (17, 18, Concat),
        _ => return None,
    })
}

impl<'a> Parser<'a> {
    pub(crate) fn expr(&mut self) -> Result<Expr> {
        self.expr_bp(0)
    }

    fn expr_bp(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.prefix()?;

        loop {
            let Some(kind) = self.peek_kind() else { break };

            // The comparison-tier special forms.
            if min_bp <= BP_COMPARE {
                match kind {
                    TokenKind::Keyword(Keyword::Not) if self.special_follows_not() => {
                        self.advance();
                        lhs = self.special_form(lhs, true)?;
                        continue;
                    }
                    TokenKind::Keyword(
                        Keyword::In | Keyword::Like | Keyword::Glob | Keyword::Between,
                    ) => {
                        lhs = self.special_form(lhs, false)?;
                        continue;
                    }
                    TokenKind::Keyword(Keyword::Is) => {
                        self.advance();
                        let negated = self.eat_kw(Keyword::Not);
                        self.expect_kw(Keyword::Null)?;
                        lhs = Expr::IsNull {
                            expr: Box::new(lhs),
                            negated,
                        };
                        continue;
                    }
                    TokenKind::Keyword(Keyword::IsNull) => {
                        self.advance();
                        lhs = Expr::IsNull {
                            expr: Box::new(lhs),
                            negated: false,
                        };
                        continue;
                    }
                    TokenKind::Keyword(Keyword::NotNull) => {
                        self.advance();
                        lhs = Expr::IsNull {
                            expr: Box::new(lhs),
                            negated: true,
                        };
                        continue;
                    }
                    _ => {}
                }
            }

            let Some((lbp, rbp, op)) = infix_power(kind) else {
                break;
            };
            if lbp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.expr_bp(rbp)?;
            lhs = Expr::binary(lhs, op, rhs);
        }
        Ok(lhs)
    }

    /// Whether the token after NOT opens a comparison special form
    /// (`NOT IN`, `NOT LIKE`, `NOT GLOB`, `NOT BETWEEN`, `NOT NULL`).
    fn special_follows_not(&self) -> bool {
        matches!(
            self.peek2_kind(),
            Some(TokenKind::Keyword(
                Keyword::In | Keyword::Like | Keyword::Glob | Keyword::Between | Keyword::Null
            ))
        )
    }

    fn special_form(&mut self, lhs: Expr, negated: bool) -> Result<Expr> {
        match self.peek_kind() {
            Some(TokenKind::Keyword(Keyword::Null)) => {
                // `x NOT NULL` postfix.
                self.advance();
                Ok(Expr::IsNull {
                    expr: Box::new(lhs),
                    negated,
                })
            }
            Some(TokenKind::Keyword(Keyword::Between)) => {
                self.advance();
                let low = self.expr_bp(BP_COMPARE + 1)?;
                self.expect_kw(Keyword::And)?;
                let high = self.expr_bp(BP_COMPARE + 1)?;
                Ok(Expr::Between {
                    expr: Box::new(lhs),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                })
            }
            Some(TokenKind::Keyword(Keyword::In)) => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let result = if self.peek_kind() == Some(TokenKind::Keyword(Keyword::Select)) {
                    Expr::InSelect {
                        expr: Box::new(lhs),
                        select: Box::new(self.select_stmt()?),
                        negated,
                    }
                } else {
                    Expr::InList {
                        expr: Box::new(lhs),
                        list: self.expr_list()?,
                        negated,
                    }
                };
                self.expect(TokenKind::RParen)?;
                Ok(result)
            }
            Some(TokenKind::Keyword(kw @ (Keyword::Like | Keyword::Glob))) => {
                self.advance();
                let pattern = self.expr_bp(BP_COMPARE + 1)?;
                // `x LIKE p` compiles as like(p, x), matching the builtin's
                // (pattern, string) argument order.
                let call = Expr::Function {
                    name: if kw == Keyword::Like {
                        SmolStr::new_static("like")
                    } else {
                        SmolStr::new_static("glob")
                    },
                    args: vec![pattern, lhs],
                    star: false,
                };
                Ok(if negated {
                    Expr::Unary(UnaryOp::Not, Box::new(call))
                } else {
                    call
                })
            }
            _ => Err(self.syntax_error()),
        }
    }

    fn prefix(&mut self) -> Result<Expr> {
        match self.peek_kind() {
            Some(TokenKind::Integer | TokenKind::Float) => self.number_literal(),
            Some(TokenKind::String) => {
                let token = self.advance().expect("peeked");
                Ok(Expr::String(dequote(token.text)))
            }
            Some(TokenKind::Keyword(Keyword::Null)) => {
                self.advance();
                Ok(Expr::Null)
            }
            Some(TokenKind::Variable) => {
                self.advance();
                self.nvar += 1;
                Ok(Expr::Parameter(self.nvar))
            }
            Some(TokenKind::Minus) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Negate, Box::new(self.expr_bp(19)?)))
            }
            Some(TokenKind::Plus) => {
                self.advance();
                self.expr_bp(19)
            }
            Some(TokenKind::BitNot) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::BitNot, Box::new(self.expr_bp(19)?)))
            }
            Some(TokenKind::Keyword(Keyword::Not)) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.expr_bp(5)?)))
            }
            Some(TokenKind::LParen) => {
                self.advance();
                let expr = if self.peek_kind() == Some(TokenKind::Keyword(Keyword::Select)) {
                    Expr::Select(Box::new(self.select_stmt()?))
                } else {
                    self.expr()?
                };
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            Some(TokenKind::Keyword(Keyword::Case)) => self.case_expr(),
            Some(TokenKind::Keyword(Keyword::Raise)) => self.raise_expr(),
            Some(TokenKind::Id | TokenKind::JoinKw) => self.name_expr(),
            _ => Err(self.syntax_error()),
        }
    }

    fn case_expr(&mut self) -> Result<Expr> {
        self.expect_kw(Keyword::Case)?;
        let base = if self.peek_kind() != Some(TokenKind::Keyword(Keyword::When)) {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        let mut whens = Vec::new();
        while self.eat_kw(Keyword::When) {
            let when = self.expr()?;
            self.expect_kw(Keyword::Then)?;
            let then = self.expr()?;
            whens.push((when, then));
        }
        if whens.is_empty() {
            return Err(self.syntax_error());
        }
        let else_expr = if self.eat_kw(Keyword::Else) {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        self.expect_kw(Keyword::End)?;
        Ok(Expr::Case {
            base,
            whens,
            else_expr,
        })
    }

    /// RAISE is only meaningful inside trigger bodies; the resolver
    /// rejects it elsewhere.
    fn raise_expr(&mut self) -> Result<Expr> {
        self.expect_kw(Keyword::Raise)?;
        self.expect(TokenKind::LParen)?;
        let kind = if self.eat_kw(Keyword::Ignore) {
            RaiseKind::Ignore
        } else {
            let make: fn(String) -> RaiseKind = if self.eat_kw(Keyword::Rollback) {
                RaiseKind::Rollback
            } else if self.eat_kw(Keyword::Abort) {
                RaiseKind::Abort
            } else if self.eat_kw(Keyword::Fail) {
                RaiseKind::Fail
            } else {
                return Err(self.syntax_error());
            };
            self.expect(TokenKind::Comma)?;
            let message = self.expect(TokenKind::String)?;
            make(dequote(message.text))
        };
        self.expect(TokenKind::RParen)?;
        Ok(Expr::Raise(kind))
    }

    fn name_expr(&mut self) -> Result<Expr> {
        let first = self.name()?;
        if self.eat(TokenKind::LParen) {
            return self.function_call(first);
        }
        if !self.eat(TokenKind::Dot) {
            return Ok(Expr::Name(first));
        }
        let second = self.name()?;
        if self.eat(TokenKind::Dot) {
            let third = self.name()?;
            Ok(Expr::DbQualified(first, second, third))
        } else {
            Ok(Expr::Qualified(first, second))
        }
    }

    fn function_call(&mut self, name: SmolStr) -> Result<Expr> {
        if self.eat(TokenKind::Star) {
            self.expect(TokenKind::RParen)?;
            return Ok(Expr::Function {
                name,
                args: Vec::new(),
                star: true,
            });
        }
        let args = if self.eat(TokenKind::RParen) {
            Vec::new()
        } else {
            let args = self.expr_list()?;
            self.expect(TokenKind::RParen)?;
            args
        };
        if args.is_empty() && name.eq_ignore_ascii_case("count") {
            return Err(Error::sql("count() requires an argument or *"));
        }
        Ok(Expr::Function {
            name,
            args,
            star: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_expr(sql: &str) -> Expr {
        let mut parser = Parser::new(sql);
        let expr = parser.expr().unwrap();
        assert!(parser.peek_kind().is_none(), "trailing input in {sql:?}");
        expr
    }

    #[test]
    fn precedence_mul_over_add() {
        let expr = parse_expr("1 + 2 * 3");
        let Expr::Binary(lhs, BinaryOp::Add, rhs) = expr else {
            panic!("expected +");
        };
        assert_eq!(*lhs, Expr::Integer(1));
        assert!(matches!(*rhs, Expr::Binary(_, BinaryOp::Multiply, _)));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse_expr("a OR b AND c");
        assert!(matches!(expr, Expr::Binary(_, BinaryOp::Or, _)));
    }

    #[test]
    fn not_in_is_negated() {
        let expr = parse_expr("x NOT IN (1, 2)");
        let Expr::InList { negated, list, .. } = expr else {
            panic!("expected IN");
        };
        assert!(negated);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn between_consumes_its_and() {
        let expr = parse_expr("x BETWEEN 1 AND 2 AND y");
        // The trailing AND is the logical one.
        assert!(matches!(expr, Expr::Binary(_, BinaryOp::And, _)));
    }

    #[test]
    fn like_lowers_to_function() {
        let expr = parse_expr("name LIKE 'a%'");
        let Expr::Function { name, args, .. } = expr else {
            panic!("expected function");
        };
        assert_eq!(name.as_str(), "like");
        assert_eq!(args[0], Expr::String("a%".into()));
    }

    #[test]
    fn is_not_null_postfixes() {
        assert!(matches!(
            parse_expr("x IS NOT NULL"),
            Expr::IsNull { negated: true, .. }
        ));
        assert!(matches!(
            parse_expr("x NOTNULL"),
            Expr::IsNull { negated: true, .. }
        ));
        assert!(matches!(
            parse_expr("x NOT NULL"),
            Expr::IsNull { negated: true, .. }
        ));
    }

    #[test]
    fn parameters_number_in_order() {
        let mut parser = Parser::new("? + ?");
        let expr = parser.expr().unwrap();
        let Expr::Binary(lhs, _, rhs) = expr else {
            panic!("expected +");
        };
        assert_eq!(*lhs, Expr::Parameter(1));
        assert_eq!(*rhs, Expr::Parameter(2));
    }

    #[test]
    fn case_with_base_and_else() {
        let expr = parse_expr("CASE x WHEN 1 THEN 'a' ELSE 'b' END");
        let Expr::Case {
            base,
            whens,
            else_expr,
        } = expr
        else {
            panic!("expected case");
        };
        assert!(base.is_some());
        assert_eq!(whens.len(), 1);
        assert!(else_expr.is_some());
    }

    #[test]
    fn scalar_subquery() {
        let expr = parse_expr("(SELECT max(a) FROM t)");
        assert!(matches!(expr, Expr::Select(_)));
    }
}
