//! Cell language errors.

/// Cell result type
pub type CellResult<T> = Result<T, CellError>;

/// Error raised while parsing or evaluating a cell
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    /// The source could not be parsed
    #[error("SyntaxError at line {line}, column {column}: {message}")]
    Syntax {
        /// 1-based line
        line: usize,
        /// 1-based column
        column: usize,
        /// What was expected
        message: String,
    },

    /// A name had no binding
    #[error("NameError: name '{0}' is not defined")]
    Name(String),

    /// An operation was applied to values of the wrong type
    #[error("TypeError: {0}")]
    Type(String),

    /// Overflow, division by zero or a non-finite result
    #[error("ArithmeticError: {0}")]
    Arithmetic(String),

    /// Index or key out of range
    #[error("IndexError: {0}")]
    Index(String),

    /// Raised explicitly with `fail`
    #[error("{0}")]
    Raised(String),

    /// A host function failed
    #[error("{function}: {message}")]
    Host {
        /// Function name
        function: String,
        /// Failure message
        message: String,
    },
}

impl CellError {
    pub(crate) fn syntax(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            column,
            message: message.into(),
        }
    }
}
