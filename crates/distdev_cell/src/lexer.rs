//! Tokenizer for cell source.

use crate::error::{CellError, CellResult};

/// Token kinds
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Integer literal
    Int(i64),
    /// Float literal
    Float(f64),
    /// String literal (escapes resolved)
    Str(String),
    /// Identifier
    Ident(String),
    /// `true`
    True,
    /// `false`
    False,
    /// `none`
    None,
    /// `and`
    And,
    /// `or`
    Or,
    /// `not`
    Not,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `//`
    SlashSlash,
    /// `%`
    Percent,
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `=`
    Assign,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `,`
    Comma,
    /// End of statement (newline or `;`)
    Newline,
    /// End of input
    Eof,
}

/// A token with its 1-based source position
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Kind
    pub kind: TokenKind,
    /// Line
    pub line: usize,
    /// Column
    pub column: usize,
}

/// Split `source` into tokens.
///
/// Newlines inside brackets or parentheses do not end a statement.
///
/// # Errors
///
/// Returns a syntax error on an unexpected character, an unterminated
/// string or an out-of-range number
pub fn tokenize(source: &str) -> CellResult<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
    depth: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            depth: 0,
            tokens: Vec::new(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, line: usize, column: usize) {
        self.tokens.push(Token { kind, line, column });
    }

    fn run(mut self) -> CellResult<Vec<Token>> {
        while let Some(&c) = self.chars.peek() {
            let (line, column) = (self.line, self.column);
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' | ';' => {
                    self.bump();
                    if self.depth == 0 {
                        self.push(TokenKind::Newline, line, column);
                    }
                }
                '#' => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '0'..='9' => {
                    let kind = self.number(line, column)?;
                    self.push(kind, line, column);
                }
                '"' | '\'' => {
                    let s = self.string(c, line, column)?;
                    self.push(TokenKind::Str(s), line, column);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let word = self.ident();
                    let kind = match word.as_str() {
                        "true" => TokenKind::True,
                        "false" => TokenKind::False,
                        "none" => TokenKind::None,
                        "and" => TokenKind::And,
                        "or" => TokenKind::Or,
                        "not" => TokenKind::Not,
                        _ => TokenKind::Ident(word),
                    };
                    self.push(kind, line, column);
                }
                _ => {
                    self.bump();
                    let kind = self.operator(c, line, column)?;
                    self.push(kind, line, column);
                }
            }
        }
        let (line, column) = (self.line, self.column);
        self.push(TokenKind::Eof, line, column);
        Ok(self.tokens)
    }

    fn operator(&mut self, c: char, line: usize, column: usize) -> CellResult<TokenKind> {
        let next_is = |lexer: &mut Self, expected: char| {
            if lexer.chars.peek() == Some(&expected) {
                lexer.bump();
                true
            } else {
                false
            }
        };
        let kind = match c {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '%' => TokenKind::Percent,
            ',' => TokenKind::Comma,
            '/' if next_is(self, '/') => TokenKind::SlashSlash,
            '/' => TokenKind::Slash,
            '=' if next_is(self, '=') => TokenKind::EqEq,
            '=' => TokenKind::Assign,
            '!' if next_is(self, '=') => TokenKind::NotEq,
            '<' if next_is(self, '=') => TokenKind::Le,
            '<' => TokenKind::Lt,
            '>' if next_is(self, '=') => TokenKind::Ge,
            '>' => TokenKind::Gt,
            '(' | '[' => {
                self.depth += 1;
                if c == '(' {
                    TokenKind::LParen
                } else {
                    TokenKind::LBracket
                }
            }
            ')' | ']' => {
                self.depth = self.depth.saturating_sub(1);
                if c == ')' {
                    TokenKind::RParen
                } else {
                    TokenKind::RBracket
                }
            }
            other => {
                return Err(CellError::syntax(
                    line,
                    column,
                    format!("unexpected character {:?}", other),
                ));
            }
        };
        Ok(kind)
    }

    fn ident(&mut self) -> String {
        let mut word = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn digits(&mut self, out: &mut String) {
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                out.push(c);
                self.bump();
            } else if c == '_' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn number(&mut self, line: usize, column: usize) -> CellResult<TokenKind> {
        let mut text = String::new();
        let mut is_float = false;
        self.digits(&mut text);

        if self.chars.peek() == Some(&'.') {
            self.bump();
            match self.chars.peek() {
                Some(c) if c.is_ascii_digit() => {
                    text.push('.');
                    self.digits(&mut text);
                    is_float = true;
                }
                _ => {
                    return Err(CellError::syntax(
                        line,
                        column,
                        "expected digits after decimal point",
                    ));
                }
            }
        }

        if matches!(self.chars.peek(), Some('e') | Some('E')) {
            self.bump();
            text.push('e');
            if let Some(&sign) = self.chars.peek() {
                if sign == '+' || sign == '-' {
                    text.push(sign);
                    self.bump();
                }
            }
            let before = text.len();
            self.digits(&mut text);
            if text.len() == before {
                return Err(CellError::syntax(line, column, "malformed exponent"));
            }
            is_float = true;
        }

        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| CellError::syntax(line, column, format!("invalid float {}", text)))
        } else {
            text.parse::<i64>().map(TokenKind::Int).map_err(|_| {
                CellError::syntax(line, column, format!("integer {} out of range", text))
            })
        }
    }

    fn string(&mut self, quote: char, line: usize, column: usize) -> CellResult<String> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(CellError::syntax(line, column, "unterminated string"));
                }
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('\\') => '\\',
                        Some('\'') => '\'',
                        Some('"') => '"',
                        Some(other) => {
                            return Err(CellError::syntax(
                                self.line,
                                self.column,
                                format!("unknown escape \\{}", other),
                            ));
                        }
                        None => {
                            return Err(CellError::syntax(line, column, "unterminated string"));
                        }
                    };
                    out.push(escaped);
                }
                Some(c) => out.push(c),
            }
        }
    }
}
