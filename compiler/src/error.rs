use colored::Colorize;
use std::fmt;

/// Where, syntactically, an error was anchored: at a specific token's
/// lexeme, or at the end of the source.
#[derive(Debug, Clone)]
pub enum ErrorSite {
    Token(String),
    Eof,
}

/// A single compile-time diagnostic (lexical, syntactic, or semantic).
/// `Display` renders it in the `[line N] Error at '<lexeme>': <message>`
/// shape used for every diagnostic this compiler produces.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub site: ErrorSite,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, site: ErrorSite, message: impl Into<String>) -> Self {
        Self {
            line,
            site,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let where_clause = match &self.site {
            ErrorSite::Token(lexeme) => format!(" at '{lexeme}'"),
            ErrorSite::Eof => " at end".to_string(),
        };
        write!(
            f,
            "[line {}] {}{}: {}",
            self.line,
            "Error".red(),
            where_clause,
            self.message
        )
    }
}
