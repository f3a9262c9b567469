// Hazel Error Handling Module
// Provides compile-error reporting with line numbers, spans and source context

use colored::*;
use std::fmt;

/// Represents a position in the source code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self { line: 1, column: 1 }
    }
}

/// Represents a span in the source code (start to end position)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn from_positions(
        start_line: usize,
        start_col: usize,
        end_line: usize,
        end_col: usize,
    ) -> Self {
        Self {
            start: Position::new(start_line, start_col),
            end: Position::new(end_line, end_col),
        }
    }

    pub fn single(line: usize, column: usize) -> Self {
        let pos = Position::new(line, column);
        Self { start: pos, end: pos }
    }

    /// Span covering everything from the start of `self` to the end of `other`.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end,
        }
    }
}

/// The three fatal failure classes of a compile unit.
///
/// Lexing, parsing and code generation each abort on the first error; there is
/// no recovery and no warning level in the compiler core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    LexError,
    SyntaxError,
    SemanticError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::LexError => write!(f, "LexError"),
            ErrorKind::SyntaxError => write!(f, "SyntaxError"),
            ErrorKind::SemanticError => write!(f, "SemanticError"),
        }
    }
}

/// Main error type produced by `compile`
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub file: String,
    pub help: Option<String>,
    source_lines: Vec<String>,
}

impl CompileError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        span: Span,
        file: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            file: file.into(),
            help: None,
            source_lines: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_lines = source.lines().map(String::from).collect();
        self
    }

    /// Format the error for terminal display
    pub fn format(&self) -> String {
        let mut output = String::new();

        let header = format!(
            "{}: {} at {}:{}:{}",
            self.kind.to_string().red().bold(),
            self.message.white().bold(),
            self.file,
            self.span.start.line,
            self.span.start.column
        );
        output.push_str(&header);
        output.push('\n');

        // Source context: the error line plus one line either side
        if !self.source_lines.is_empty() {
            let error_line = self.span.start.line;
            let start_line = if error_line > 1 { error_line - 1 } else { 1 };
            let end_line = (error_line + 1).min(self.source_lines.len());

            output.push('\n');

            for line_num in start_line..=end_line {
                if line_num <= self.source_lines.len() {
                    let line_content = &self.source_lines[line_num - 1];
                    let line_num_str = format!("{:>4} |", line_num);

                    if line_num == error_line {
                        output.push_str(&format!("{} {}\n", line_num_str.red(), line_content));

                        let spaces = " ".repeat(6 + self.span.start.column);
                        let caret_len = if self.span.end.column > self.span.start.column {
                            self.span.end.column - self.span.start.column + 1
                        } else {
                            1
                        };
                        let carets = "^".repeat(caret_len);
                        output.push_str(&format!("{}{}\n", spaces, carets.red().bold()));
                    } else {
                        output.push_str(&format!("{} {}\n", line_num_str.dimmed(), line_content));
                    }
                }
            }
        }

        if let Some(ref help) = self.help {
            output.push_str(&format!("\n      {}: {}\n", "Help".cyan().bold(), help));
        }

        output
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl std::error::Error for CompileError {}

/// Result type for compiler operations
pub type CompileResult<T> = Result<T, CompileError>;

// Convenience constructors for the three error classes
impl CompileError {
    pub fn lex_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::LexError, message, span, file)
    }

    pub fn syntax_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::SyntaxError, message, span, file)
    }

    pub fn semantic_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::SemanticError, message, span, file)
    }
}
