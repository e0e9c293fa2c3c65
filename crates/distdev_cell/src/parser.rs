//! Recursive-descent parser for cell source.

use crate::ast::{BinOp, Expr, Program, Statement};
use crate::error::{CellError, CellResult};
use crate::lexer::{Token, TokenKind, tokenize};
use serde_json::Value;

/// Parse cell source into a [`Program`]
///
/// # Errors
///
/// Returns [`CellError::Syntax`] with the position of the first offending token
pub fn parse(source: &str) -> CellResult<Program> {
    let tokens = tokenize(source)?;
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

/// Maximum expression nesting
pub const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The lexer always terminates the stream with Eof.
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_second(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos + 1).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> CellError {
        let token = self.peek();
        CellError::syntax(token.line, token.column, message)
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> CellResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {}", what, describe(self.peek_kind()))))
        }
    }

    fn program(mut self) -> CellResult<Program> {
        let mut statements = Vec::new();
        loop {
            while self.eat(&TokenKind::Newline) {}
            if self.peek_kind() == &TokenKind::Eof {
                break;
            }
            statements.push(self.statement()?);
            match self.peek_kind() {
                TokenKind::Newline | TokenKind::Eof => {}
                other => {
                    return Err(self.error(format!(
                        "expected end of statement, found {}",
                        describe(other)
                    )));
                }
            }
        }
        Ok(Program { statements })
    }

    fn statement(&mut self) -> CellResult<Statement> {
        if let TokenKind::Ident(name) = self.peek_kind() {
            if self.peek_second() == Some(&TokenKind::Assign) {
                let name = name.clone();
                self.advance();
                self.advance();
                let value = self.expr()?;
                return Ok(Statement::Assign { name, value });
            }
        }
        Ok(Statement::Expr(self.expr()?))
    }

    fn expr(&mut self) -> CellResult<Expr> {
        self.nested(Self::or_expr)
    }

    fn or_expr(&mut self) -> CellResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat(&TokenKind::Or) {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> CellResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat(&TokenKind::And) {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> CellResult<Expr> {
        if self.eat(&TokenKind::Not) {
            let inner = self.nested(Self::not_expr)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn nested(&mut self, rule: fn(&mut Self) -> CellResult<Expr>) -> CellResult<Expr> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        let result = rule(self);
        self.depth -= 1;
        result
    }

    fn comparison(&mut self) -> CellResult<Expr> {
        let left = self.additive()?;
        let Some(op) = comparison_op(self.peek_kind()) else {
            return Ok(left);
        };
        self.advance();
        let right = self.additive()?;
        if comparison_op(self.peek_kind()).is_some() {
            return Err(self.error("chained comparisons are not supported"));
        }
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn additive(&mut self) -> CellResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn term(&mut self) -> CellResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::SlashSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> CellResult<Expr> {
        if self.eat(&TokenKind::Minus) {
            let inner = self.nested(Self::unary)?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> CellResult<Expr> {
        let mut callable = matches!(self.peek_kind(), TokenKind::Ident(_));
        let mut expr = self.primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::LParen => {
                    let (true, Expr::Name(function)) = (callable, expr) else {
                        return Err(self.error("only named functions can be called"));
                    };
                    callable = false;
                    self.advance();
                    let args = self.sequence(&TokenKind::RParen, "')'")?;
                    expr = Expr::Call { function, args };
                }
                TokenKind::LBracket => {
                    callable = false;
                    self.advance();
                    let index = self.expr()?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> CellResult<Expr> {
        let token = self.peek().clone();
        let expr = match token.kind {
            TokenKind::Int(n) => Expr::Literal(Value::from(n)),
            TokenKind::Float(f) => Expr::Literal(Value::from(f)),
            TokenKind::Str(s) => Expr::Literal(Value::String(s)),
            TokenKind::True => Expr::Literal(Value::Bool(true)),
            TokenKind::False => Expr::Literal(Value::Bool(false)),
            TokenKind::None => Expr::Literal(Value::Null),
            TokenKind::Ident(name) => Expr::Name(name),
            TokenKind::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                return Ok(inner);
            }
            TokenKind::LBracket => {
                self.advance();
                let items = self.sequence(&TokenKind::RBracket, "']'")?;
                return Ok(Expr::List(items));
            }
            ref other => {
                return Err(self.error(format!("expected expression, found {}", describe(other))));
            }
        };
        self.advance();
        Ok(expr)
    }

    /// Comma-separated expressions up to `close`; a trailing comma is allowed
    fn sequence(&mut self, close: &TokenKind, what: &str) -> CellResult<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.eat(&TokenKind::Comma) {
                if self.eat(close) {
                    return Ok(items);
                }
                continue;
            }
            self.expect(close, what)?;
            return Ok(items);
        }
    }
}

fn comparison_op(kind: &TokenKind) -> Option<BinOp> {
    match kind {
        TokenKind::EqEq => Some(BinOp::Eq),
        TokenKind::NotEq => Some(BinOp::Ne),
        TokenKind::Lt => Some(BinOp::Lt),
        TokenKind::Le => Some(BinOp::Le),
        TokenKind::Gt => Some(BinOp::Gt),
        TokenKind::Ge => Some(BinOp::Ge),
        _ => None,
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Int(n) => format!("integer {}", n),
        TokenKind::Float(f) => format!("float {}", f),
        TokenKind::Str(_) => "string".to_string(),
        TokenKind::Ident(name) => format!("name '{}'", name),
        TokenKind::Newline => "end of line".to_string(),
        TokenKind::Eof => "end of input".to_string(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(source: &str) -> Expr {
        match parse(source).unwrap().statements.pop() {
            Some(Statement::Expr(e)) => e,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    fn int(n: i64) -> Box<Expr> {
        Box::new(Expr::Literal(Value::from(n)))
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("\n\n# only a comment\n").unwrap().is_empty());
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            expr("1 + 2 * 3"),
            Expr::Binary {
                op: BinOp::Add,
                left: int(1),
                right: Box::new(Expr::Binary {
                    op: BinOp::Mul,
                    left: int(2),
                    right: int(3),
                }),
            }
        );
    }

    #[test]
    fn test_left_associative() {
        assert_eq!(
            expr("8 - 4 - 2"),
            Expr::Binary {
                op: BinOp::Sub,
                left: Box::new(Expr::Binary {
                    op: BinOp::Sub,
                    left: int(8),
                    right: int(4),
                }),
                right: int(2),
            }
        );
    }

    #[test]
    fn test_assignment_and_expression() {
        let program = parse("x = 2\nx * 3").unwrap();
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(&program.statements[0], Statement::Assign { name, .. } if name == "x"));
        assert!(program.ends_with_expr());
    }

    #[test]
    fn test_call_and_index() {
        assert_eq!(
            expr("f(1, [2, 3],)[0]"),
            Expr::Index {
                target: Box::new(Expr::Call {
                    function: "f".into(),
                    args: vec![
                        Expr::Literal(Value::from(1)),
                        Expr::List(vec![Expr::Literal(Value::from(2)), Expr::Literal(Value::from(3))]),
                    ],
                }),
                index: int(0),
            }
        );
    }

    #[test]
    fn test_not_binds_looser_than_comparison() {
        assert!(matches!(expr("not 1 == 2"), Expr::Not(inner) if matches!(*inner, Expr::Binary { op: BinOp::Eq, .. })));
    }

    #[test]
    fn test_chained_comparison_rejected() {
        assert!(matches!(parse("1 < 2 < 3"), Err(CellError::Syntax { .. })));
    }

    #[test]
    fn test_error_position() {
        let err = parse("x = 1\ny = (2 +").unwrap_err();
        assert_eq!(
            err,
            CellError::Syntax {
                line: 2,
                column: 9,
                message: "expected expression, found end of input".into(),
            }
        );
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(parse("1 2").is_err());
        assert!(parse("x = = 1").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        assert!(matches!(parse(&deep), Err(CellError::Syntax { .. })));
        assert!(parse(&"-".repeat(MAX_NESTING * 2)).is_err());
        assert!(parse("((((1))))").is_ok());
    }

    #[test]
    fn test_call_on_non_name_rejected() {
        assert!(parse("(f)(1)").is_err());
    }
}
