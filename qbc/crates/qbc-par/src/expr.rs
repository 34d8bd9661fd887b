//! Expression parsing with Pratt-style binding powers.
//!
//! Precedence, loosest to tightest, as the dialect defines it:
//!
//! | Level | Operators                          |
//! |-------|------------------------------------|
//! | 1     | `OR`                               |
//! | 2     | `AND`                              |
//! | 3     | `=` `<>` `<` `<=` `>` `>=`         |
//! | 4     | `+` `-`                            |
//! | 5     | `MOD`                              |
//! | 6     | `\`                                |
//! | 7     | `*` `/`                            |
//! | 8     | `^`                                |
//! | 9     | unary `-`, `NOT`                   |
//!
//! All binary operators are left-associative. `AND`/`OR` evaluate both
//! operands eagerly; there is no short-circuit form in the language, so
//! none exists here either.

use qbc_lex::{Kw, Punct, TokenKind};
use qbc_util::DiagnosticKind;

use crate::ast::{BinOp, Expr, ExprKind, UnOp};
use crate::Parser;

/// Binding power levels. Higher binds tighter; left-associative
/// operators use `(bp, bp + 1)`.
mod bp {
    pub const MIN: u8 = 0;
    pub const OR: u8 = 2;
    pub const AND: u8 = 4;
    pub const RELATIONAL: u8 = 6;
    pub const ADDITIVE: u8 = 8;
    pub const MODULO: u8 = 10;
    pub const INT_DIV: u8 = 12;
    pub const MULTIPLICATIVE: u8 = 14;
    pub const POWER: u8 = 16;
    pub const UNARY: u8 = 18;
}

impl<'a> Parser<'a> {
    /// Parse a complete expression.
    pub(crate) fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_expr_bp(bp::MIN)
    }

    /// Parse an expression restricted to l-value shapes: a name, an
    /// indexed name, or a record field path. Used for assignment
    /// targets, `READ`/`INPUT` targets and `FOR` counters.
    pub(crate) fn parse_lvalue(&mut self) -> Option<Expr> {
        let expr = self.parse_postfix()?;
        if !expr.is_lvalue_shaped() {
            self.handler.report(
                DiagnosticKind::NotAnLValue,
                "expected a variable, array element or record field",
                expr.span,
            );
        }
        Some(expr)
    }

    fn parse_expr_bp(&mut self, min_bp: u8) -> Option<Expr> {
        let mut lhs = self.parse_prefix()?;

        while let Some((op, lbp)) = self.peek_binop() {
            if lbp < min_bp {
                break;
            }
            self.bump();
            let rhs = self.parse_expr_bp(lbp + 1)?;
            let span = lhs.span.merge(rhs.span);
            lhs = self.mk_expr(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Some(lhs)
    }

    fn peek_binop(&self) -> Option<(BinOp, u8)> {
        Some(match self.peek_kind() {
            TokenKind::Punct(Punct::Plus) => (BinOp::Add, bp::ADDITIVE),
            TokenKind::Punct(Punct::Minus) => (BinOp::Sub, bp::ADDITIVE),
            TokenKind::Punct(Punct::Star) => (BinOp::Mul, bp::MULTIPLICATIVE),
            TokenKind::Punct(Punct::Slash) => (BinOp::Div, bp::MULTIPLICATIVE),
            TokenKind::Punct(Punct::Backslash) => (BinOp::IntDiv, bp::INT_DIV),
            TokenKind::Punct(Punct::Caret) => (BinOp::Pow, bp::POWER),
            TokenKind::Punct(Punct::Eq) => (BinOp::Eq, bp::RELATIONAL),
            TokenKind::Punct(Punct::Ne) => (BinOp::Ne, bp::RELATIONAL),
            TokenKind::Punct(Punct::Lt) => (BinOp::Lt, bp::RELATIONAL),
            TokenKind::Punct(Punct::Le) => (BinOp::Le, bp::RELATIONAL),
            TokenKind::Punct(Punct::Gt) => (BinOp::Gt, bp::RELATIONAL),
            TokenKind::Punct(Punct::Ge) => (BinOp::Ge, bp::RELATIONAL),
            TokenKind::Kw(Kw::Mod) => (BinOp::Mod, bp::MODULO),
            TokenKind::Kw(Kw::And) => (BinOp::And, bp::AND),
            TokenKind::Kw(Kw::Or) => (BinOp::Or, bp::OR),
            _ => return None,
        })
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        let span = self.span();
        match self.peek_kind().clone() {
            TokenKind::Punct(Punct::Minus) => {
                self.bump();
                let operand = self.parse_expr_bp(bp::UNARY)?;
                let span = span.merge(operand.span);
                Some(self.mk_expr(
                    ExprKind::Unary {
                        op: UnOp::Neg,
                        operand: Box::new(operand),
                    },
                    span,
                ))
            }
            TokenKind::Punct(Punct::Plus) => {
                // Unary plus is accepted and ignored.
                self.bump();
                self.parse_expr_bp(bp::UNARY)
            }
            TokenKind::Kw(Kw::Not) => {
                self.bump();
                let operand = self.parse_expr_bp(bp::UNARY)?;
                let span = span.merge(operand.span);
                Some(self.mk_expr(
                    ExprKind::Unary {
                        op: UnOp::Not,
                        operand: Box::new(operand),
                    },
                    span,
                ))
            }
            _ => self.parse_postfix(),
        }
    }

    /// A primary expression plus any `.field` postfix chain.
    pub(crate) fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        while self.eat_punct(Punct::Period) {
            let field_span = self.span();
            match self.peek_kind() {
                TokenKind::Ident(sym) => {
                    let field = *sym;
                    self.bump();
                    let span = expr.span.merge(field_span);
                    expr = self.mk_expr(
                        ExprKind::Field {
                            base: Box::new(expr),
                            field,
                        },
                        span,
                    );
                }
                _ => {
                    self.handler.report(
                        DiagnosticKind::UnexpectedToken,
                        "expected a field name after `.`",
                        field_span,
                    );
                    return None;
                }
            }
        }
        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let span = self.span();
        match self.peek_kind().clone() {
            TokenKind::Number(lit) => {
                self.bump();
                Some(self.mk_expr(ExprKind::Number(lit), span))
            }
            TokenKind::StringLit(bytes) => {
                self.bump();
                Some(self.mk_expr(ExprKind::StringLit(bytes), span))
            }
            TokenKind::Kw(Kw::Timer) => {
                // TIMER is a keyword but reads like a nullary function.
                self.bump();
                Some(self.mk_expr(
                    ExprKind::Call {
                        name: qbc_util::Symbol::intern("TIMER"),
                        args: Vec::new(),
                    },
                    span,
                ))
            }
            TokenKind::Ident(sym) => {
                self.bump();
                if self.eat_punct(Punct::LParen) {
                    let mut args = Vec::new();
                    if !self.check_punct(Punct::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat_punct(Punct::Comma) {
                                break;
                            }
                        }
                    }
                    let close = self.span();
                    self.expect_punct(Punct::RParen, "`)` after arguments");
                    Some(self.mk_expr(ExprKind::Call { name: sym, args }, span.merge(close)))
                } else {
                    Some(self.mk_expr(ExprKind::Var(sym), span))
                }
            }
            TokenKind::Punct(Punct::LParen) => {
                self.bump();
                let inner = self.parse_expr()?;
                let close = self.span();
                self.expect_punct(Punct::RParen, "`)`");
                // Re-span the inner expression to include the parentheses
                // so diagnostics point at what the user wrote.
                Some(Expr {
                    span: span.merge(close),
                    ..inner
                })
            }
            _ => {
                self.handler.report(
                    DiagnosticKind::UnexpectedToken,
                    "expected an expression",
                    span,
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbc_util::{FileId, Handler, Symbol};

    fn parse_one(src: &str) -> Expr {
        let handler = Handler::new();
        let tokens = qbc_lex::tokenize(src, FileId::DUMMY, &handler);
        let mut parser = Parser::new(tokens, &handler);
        let expr = parser.parse_expr().expect("expression");
        assert!(
            !handler.has_errors(),
            "unexpected diagnostics: {:?}",
            handler.diagnostics()
        );
        expr
    }

    fn binary_op(expr: &Expr) -> BinOp {
        match &expr.kind {
            ExprKind::Binary { op, .. } => *op,
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[test]
    fn test_mul_binds_tighter_than_add() {
        // a + b * c => a + (b * c)
        let expr = parse_one("a + b * c");
        match &expr.kind {
            ExprKind::Binary { op: BinOp::Add, rhs, .. } => {
                assert_eq!(binary_op(rhs), BinOp::Mul);
            }
            other => panic!("expected Add at root, got {other:?}"),
        }
    }

    #[test]
    fn test_left_associativity() {
        // a - b - c => (a - b) - c
        let expr = parse_one("a - b - c");
        match &expr.kind {
            ExprKind::Binary { op: BinOp::Sub, lhs, .. } => {
                assert_eq!(binary_op(lhs), BinOp::Sub);
            }
            other => panic!("expected Sub at root, got {other:?}"),
        }
    }

    #[test]
    fn test_int_div_between_mul_and_mod() {
        // a * b \ c MOD d => ((a * b) \ c) MOD d
        let expr = parse_one("a * b \\ c MOD d");
        assert_eq!(binary_op(&expr), BinOp::Mod);
        match &expr.kind {
            ExprKind::Binary { lhs, .. } => {
                assert_eq!(binary_op(lhs), BinOp::IntDiv);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_relational_below_additive() {
        // a + 1 < b => (a + 1) < b
        let expr = parse_one("a + 1 < b");
        assert_eq!(binary_op(&expr), BinOp::Lt);
    }

    #[test]
    fn test_and_or_lowest() {
        let expr = parse_one("a < b AND c > d OR e = f");
        assert_eq!(binary_op(&expr), BinOp::Or);
        match &expr.kind {
            ExprKind::Binary { lhs, .. } => assert_eq!(binary_op(lhs), BinOp::And),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_unary_not_and_neg() {
        let expr = parse_one("NOT a = b");
        // NOT binds tighter than `=`, per the dialect's table.
        assert_eq!(binary_op(&expr), BinOp::Eq);
        match &expr.kind {
            ExprKind::Binary { lhs, .. } => {
                assert!(matches!(lhs.kind, ExprKind::Unary { op: UnOp::Not, .. }));
            }
            _ => unreachable!(),
        }

        let expr = parse_one("-x ^ 2");
        // Unary minus binds tighter than `^`: (-x) ^ 2.
        assert_eq!(binary_op(&expr), BinOp::Pow);
    }

    #[test]
    fn test_parentheses_override() {
        let expr = parse_one("(a + b) * c");
        assert_eq!(binary_op(&expr), BinOp::Mul);
    }

    #[test]
    fn test_call_and_index_shape() {
        let expr = parse_one("arr(i + 1)");
        match &expr.kind {
            ExprKind::Call { name, args } => {
                assert_eq!(*name, Symbol::intern("arr"));
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn test_field_chain() {
        let expr = parse_one("p.pos.x");
        match &expr.kind {
            ExprKind::Field { base, field } => {
                assert_eq!(*field, Symbol::intern("x"));
                assert!(matches!(base.kind, ExprKind::Field { .. }));
            }
            other => panic!("expected Field, got {other:?}"),
        }
    }

    #[test]
    fn test_expr_ids_are_unique() {
        let handler = Handler::new();
        let tokens = qbc_lex::tokenize("a + b * c", FileId::DUMMY, &handler);
        let mut parser = Parser::new(tokens, &handler);
        let expr = parser.parse_expr().unwrap();
        let mut ids = Vec::new();
        fn collect(e: &Expr, ids: &mut Vec<u32>) {
            ids.push(e.id.0);
            match &e.kind {
                ExprKind::Binary { lhs, rhs, .. } => {
                    collect(lhs, ids);
                    collect(rhs, ids);
                }
                ExprKind::Unary { operand, .. } => collect(operand, ids),
                _ => {}
            }
        }
        collect(&expr, &mut ids);
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }
}
