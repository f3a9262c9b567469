// Hazel Scanner (Lexer)
// Converts source code into tokens; also the home of `#` directive processing,
// which runs inline during scanning and mutates the per-compile feature mask.

use crate::error::{CompileError, CompileResult, Span};
use crate::lexer::token::{Token, TokenKind};
use crate::{
    FEATURE_EXPLICIT_THIS, FEATURE_NO_CLASS_DECL_SUGAR, FEATURE_NO_FUNC_DECL_SUGAR,
    FEATURE_NO_OPTIMIZER, FEATURE_NO_ROOT_ACCESS,
};

/// Scanner that tokenizes Hazel source code
pub struct Scanner {
    source: Vec<char>,
    tokens: Vec<Token>,
    start: usize,
    current: usize,
    line: usize,
    column: usize,
    start_line: usize,
    start_column: usize,
    file: String,

    /// Per-compile-unit language feature mask, seeded from the context
    /// defaults and mutated by feature directives.
    pub features: u32,
    /// Set when a `default:`-prefixed directive ran; the compile entry copies
    /// this back into `CompilerContext::default_features`.
    pub new_defaults: Option<u32>,
    /// `(token index, mask)` snapshots taken at each feature directive, so the
    /// parser can apply a toggle exactly where it appeared in the stream.
    pub feature_updates: Vec<(usize, u32)>,
}

impl Scanner {
    pub fn new(source: &str, file: impl Into<String>, features: u32) -> Self {
        Self {
            source: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            start_line: 1,
            start_column: 1,
            file: file.into(),
            features,
            new_defaults: None,
            feature_updates: Vec::new(),
        }
    }

    /// Scan all tokens from the source
    pub fn scan_tokens(&mut self) -> CompileResult<Vec<Token>> {
        while !self.is_at_end() {
            self.start = self.current;
            self.start_line = self.line;
            self.start_column = self.column;
            self.scan_token()?;
        }

        self.tokens.push(Token::new(
            TokenKind::Eof,
            "",
            Span::single(self.line, self.column),
        ));

        Ok(std::mem::take(&mut self.tokens))
    }

    fn scan_token(&mut self) -> CompileResult<()> {
        let c = self.advance();

        match c {
            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),
            '{' => self.add_token(TokenKind::LeftBrace),
            '}' => self.add_token(TokenKind::RightBrace),
            '[' => self.add_token(TokenKind::LeftBracket),
            ']' => self.add_token(TokenKind::RightBracket),
            ',' => self.add_token(TokenKind::Comma),
            ';' => self.add_token(TokenKind::Semicolon),
            '.' => {
                if self.match_char('.') {
                    if self.match_char('.') {
                        self.add_token(TokenKind::DotDotDot);
                    } else {
                        return Err(self.error("Unexpected '..'"));
                    }
                } else {
                    self.add_token(TokenKind::Dot);
                }
            }
            ':' => {
                let kind = if self.match_char(':') {
                    TokenKind::DoubleColon
                } else if self.match_char('=') {
                    TokenKind::InExprAssign
                } else {
                    TokenKind::Colon
                };
                self.add_token(kind);
            }
            '?' => {
                let kind = if self.match_char('?') {
                    TokenKind::QuestionQuestion
                } else {
                    TokenKind::Question
                };
                self.add_token(kind);
            }
            '@' => {
                // `@"..."` is a verbatim string, bare `@` starts a lambda
                if self.peek() == '"' {
                    self.advance();
                    self.verbatim_string()?;
                } else {
                    self.add_token(TokenKind::At);
                }
            }
            '#' => self.directive()?,

            '+' => {
                let kind = if self.match_char('=') {
                    TokenKind::PlusEqual
                } else if self.match_char('+') {
                    TokenKind::PlusPlus
                } else {
                    TokenKind::Plus
                };
                self.add_token(kind);
            }
            '-' => {
                let kind = if self.match_char('=') {
                    TokenKind::MinusEqual
                } else if self.match_char('-') {
                    TokenKind::MinusMinus
                } else {
                    TokenKind::Minus
                };
                self.add_token(kind);
            }
            '*' => {
                let kind = if self.match_char('=') {
                    TokenKind::StarEqual
                } else {
                    TokenKind::Star
                };
                self.add_token(kind);
            }
            '/' => {
                if self.match_char('/') {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                } else if self.match_char('*') {
                    self.block_comment()?;
                } else if self.match_char('=') {
                    self.add_token(TokenKind::SlashEqual);
                } else {
                    self.add_token(TokenKind::Slash);
                }
            }
            '%' => {
                let kind = if self.match_char('=') {
                    TokenKind::PercentEqual
                } else {
                    TokenKind::Percent
                };
                self.add_token(kind);
            }

            '!' => {
                let kind = if self.match_char('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.add_token(kind);
            }
            '=' => {
                let kind = if self.match_char('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.add_token(kind);
            }
            '<' => {
                let kind = if self.match_char('=') {
                    if self.match_char('>') {
                        TokenKind::ThreeWay
                    } else {
                        TokenKind::LessEqual
                    }
                } else if self.match_char('-') {
                    TokenKind::NewSlot
                } else if self.match_char('<') {
                    TokenKind::LessLess
                } else {
                    TokenKind::Less
                };
                self.add_token(kind);
            }
            '>' => {
                let kind = if self.match_char('=') {
                    TokenKind::GreaterEqual
                } else if self.match_char('>') {
                    TokenKind::GreaterGreater
                } else {
                    TokenKind::Greater
                };
                self.add_token(kind);
            }
            '&' => {
                let kind = if self.match_char('&') {
                    TokenKind::And
                } else {
                    TokenKind::Ampersand
                };
                self.add_token(kind);
            }
            '|' => {
                let kind = if self.match_char('|') {
                    TokenKind::Or
                } else {
                    TokenKind::Pipe
                };
                self.add_token(kind);
            }
            '^' => self.add_token(TokenKind::Caret),
            '~' => self.add_token(TokenKind::Tilde),

            '"' => self.string()?,

            ' ' | '\r' | '\t' => {}
            '\n' => {
                self.line += 1;
                self.column = 1;
            }

            c if c.is_ascii_digit() => self.number()?,
            c if c.is_alphabetic() || c == '_' => self.identifier(),

            _ => {
                return Err(self.error(format!("Unexpected character '{}'", c)));
            }
        }

        Ok(())
    }

    // ==================== Directives ====================

    /// Handles `#pos:<line>:<col>` and language feature toggles. A `default:`
    /// prefix additionally updates the mask used to seed future compiles.
    fn directive(&mut self) -> CompileResult<()> {
        let mut text = String::new();
        while !self.is_at_end() {
            let c = self.peek();
            if c.is_alphanumeric() || c == '-' || c == ':' || c == '_' {
                text.push(self.advance());
            } else {
                break;
            }
        }

        if let Some(rest) = text.strip_prefix("pos:") {
            let mut parts = rest.split(':');
            let line = parts.next().and_then(|p| p.parse::<usize>().ok());
            let col = parts.next().and_then(|p| p.parse::<usize>().ok());
            match (line, col, parts.next()) {
                (Some(line), Some(col), None) => {
                    self.line = line;
                    self.column = col;
                    return Ok(());
                }
                _ => return Err(self.error(format!("Malformed directive '#{}'", text))),
            }
        }

        let (name, is_default) = match text.strip_prefix("default:") {
            Some(rest) => (rest, true),
            None => (text.as_str(), false),
        };

        let mut mask = self.features;
        match name {
            "explicit-this" => mask |= FEATURE_EXPLICIT_THIS,
            "implicit-this" => mask &= !FEATURE_EXPLICIT_THIS,
            "no-func-decl-sugar" => mask |= FEATURE_NO_FUNC_DECL_SUGAR,
            "func-decl-sugar" => mask &= !FEATURE_NO_FUNC_DECL_SUGAR,
            "no-class-decl-sugar" => mask |= FEATURE_NO_CLASS_DECL_SUGAR,
            "class-decl-sugar" => mask &= !FEATURE_NO_CLASS_DECL_SUGAR,
            "no-root-access" => mask |= FEATURE_NO_ROOT_ACCESS,
            "root-access" => mask &= !FEATURE_NO_ROOT_ACCESS,
            "no-optimizer" => mask |= FEATURE_NO_OPTIMIZER,
            "optimizer" => mask &= !FEATURE_NO_OPTIMIZER,
            "strict" => mask |= FEATURE_EXPLICIT_THIS | FEATURE_NO_ROOT_ACCESS,
            _ => return Err(self.error(format!("Unknown directive '#{}'", text))),
        }

        self.features = mask;
        self.feature_updates.push((self.tokens.len(), mask));
        if is_default {
            self.new_defaults = Some(mask);
        }

        Ok(())
    }

    // ==================== Literals ====================

    fn string(&mut self) -> CompileResult<()> {
        let mut value = String::new();

        while self.peek() != '"' && !self.is_at_end() {
            let c = self.advance();
            if c == '\n' {
                return Err(self.error("Unterminated string literal"));
            }
            if c == '\\' {
                if self.is_at_end() {
                    return Err(self.error("Unterminated string literal"));
                }
                let escaped = self.advance();
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    '\'' => value.push('\''),
                    other => {
                        return Err(self.error(format!("Invalid escape sequence '\\{}'", other)))
                    }
                }
            } else {
                value.push(c);
            }
        }

        if self.is_at_end() {
            return Err(self.error("Unterminated string literal"));
        }
        self.advance(); // closing quote

        self.add_token(TokenKind::String(value));
        Ok(())
    }

    /// `@"..."` strings take every character literally; `""` escapes a quote.
    fn verbatim_string(&mut self) -> CompileResult<()> {
        let mut value = String::new();

        loop {
            if self.is_at_end() {
                return Err(self.error("Unterminated verbatim string literal"));
            }
            let c = self.advance();
            if c == '"' {
                if self.peek() == '"' {
                    self.advance();
                    value.push('"');
                } else {
                    break;
                }
            } else {
                if c == '\n' {
                    self.line += 1;
                    self.column = 1;
                }
                value.push(c);
            }
        }

        self.add_token(TokenKind::String(value));
        Ok(())
    }

    fn number(&mut self) -> CompileResult<()> {
        // Hex literal
        if self.source[self.start] == '0' && (self.peek() == 'x' || self.peek() == 'X') {
            self.advance();
            let mut digits = String::new();
            while self.peek().is_ascii_hexdigit() {
                digits.push(self.advance());
            }
            if digits.is_empty() {
                return Err(self.error("Malformed hex literal"));
            }
            let value = i64::from_str_radix(&digits, 16)
                .map_err(|_| self.error("Hex literal out of range"))?;
            self.add_token(TokenKind::Integer(value));
            return Ok(());
        }

        while self.peek().is_ascii_digit() {
            self.advance();
        }

        let mut is_float = false;
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            is_float = true;
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        if self.peek() == 'e' || self.peek() == 'E' {
            is_float = true;
            self.advance();
            if self.peek() == '+' || self.peek() == '-' {
                self.advance();
            }
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| self.error("Malformed float literal"))?;
            self.add_token(TokenKind::Float(value));
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| self.error("Integer literal out of range"))?;
            self.add_token(TokenKind::Integer(value));
        }

        Ok(())
    }

    fn identifier(&mut self) {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        let kind = match text.as_str() {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            "local" => TokenKind::Local,
            "let" => TokenKind::Let,
            "function" => TokenKind::Function,
            "constructor" => TokenKind::Constructor,
            "class" => TokenKind::Class,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "do" => TokenKind::Do,
            "for" => TokenKind::For,
            "foreach" => TokenKind::Foreach,
            "switch" => TokenKind::Switch,
            "case" => TokenKind::Case,
            "default" => TokenKind::Default,
            "return" => TokenKind::Return,
            "yield" => TokenKind::Yield,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "try" => TokenKind::Try,
            "catch" => TokenKind::Catch,
            "throw" => TokenKind::Throw,
            "const" => TokenKind::Const,
            "enum" => TokenKind::Enum,
            "global" => TokenKind::Global,
            "static" => TokenKind::Static,
            "this" => TokenKind::This,
            "base" => TokenKind::Base,
            "extends" => TokenKind::Extends,
            "typeof" => TokenKind::Typeof,
            "instanceof" => TokenKind::Instanceof,
            "in" => TokenKind::In,
            "delete" => TokenKind::Delete,
            "clone" => TokenKind::Clone,
            _ => TokenKind::Identifier(text.clone()),
        };

        self.add_token(kind);
    }

    fn block_comment(&mut self) -> CompileResult<()> {
        let mut depth = 1;
        while depth > 0 {
            if self.is_at_end() {
                return Err(self.error("Unterminated block comment"));
            }
            let c = self.advance();
            match c {
                '\n' => {
                    self.line += 1;
                    self.column = 1;
                }
                '/' if self.peek() == '*' => {
                    self.advance();
                    depth += 1;
                }
                '*' if self.peek() == '/' => {
                    self.advance();
                    depth -= 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ==================== Helpers ====================

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.source[self.start..self.current].iter().collect();
        let span = Span::from_positions(
            self.start_line,
            self.start_column,
            self.line,
            self.column.saturating_sub(1).max(1),
        );
        self.tokens.push(Token::new(kind, lexeme, span));
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::lex_error(
            message,
            Span::single(self.start_line, self.start_column),
            &self.file,
        )
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        if c != '\n' {
            self.column += 1;
        }
        c
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        self.column += 1;
        true
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }
}
