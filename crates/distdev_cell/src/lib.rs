//! distdev Cell Language
//!
//! A small expression language used for ad-hoc cells and for script
//! callables shipped to workers. Values are JSON values; each worker keeps
//! one [`Interpreter`] whose globals persist across cells.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ast;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod value;

pub use ast::{BinOp, Expr, Program, Statement};
pub use error::{CellError, CellResult};
pub use eval::{BUILTINS, Host, Interpreter, NoHost};
pub use parser::parse;
