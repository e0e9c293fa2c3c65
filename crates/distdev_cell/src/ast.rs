//! Syntax tree for cell programs.

use serde_json::Value;

/// A parsed cell
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    /// Statements in source order
    pub statements: Vec<Statement>,
}

impl Program {
    /// Whether the program has no statements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Whether the last statement is a bare expression
    #[must_use]
    pub fn ends_with_expr(&self) -> bool {
        matches!(self.statements.last(), Some(Statement::Expr(_)))
    }
}

/// A single statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `name = expr`
    Assign {
        /// Bound name
        name: String,
        /// Value
        value: Expr,
    },
    /// Bare expression
    Expr(Expr),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `//`
    FloorDiv,
    /// `%`
    Mod,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl BinOp {
    /// Source symbol
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value
    Literal(Value),
    /// Name lookup
    Name(String),
    /// List display
    List(Vec<Expr>),
    /// Arithmetic negation
    Neg(Box<Expr>),
    /// Logical negation
    Not(Box<Expr>),
    /// Short-circuit `and`
    And(Box<Expr>, Box<Expr>),
    /// Short-circuit `or`
    Or(Box<Expr>, Box<Expr>),
    /// Binary operation
    Binary {
        /// Operator
        op: BinOp,
        /// Left operand
        left: Box<Expr>,
        /// Right operand
        right: Box<Expr>,
    },
    /// Function call
    Call {
        /// Function name
        function: String,
        /// Positional arguments
        args: Vec<Expr>,
    },
    /// `target[index]`
    Index {
        /// Indexed value
        target: Box<Expr>,
        /// Index
        index: Box<Expr>,
    },
}
