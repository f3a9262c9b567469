use crate::error::Span;
use std::fmt;

/// Token kinds produced by the scanner. Literal payloads ride on the token so
/// the parser never has to re-inspect source text.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Integer(i64),
    Float(f64),
    String(String),
    True,
    False,
    Null,

    Identifier(String),

    // Keywords
    Local,
    Let,
    Function,
    Constructor,
    Class,
    If,
    Else,
    While,
    Do,
    For,
    Foreach,
    Switch,
    Case,
    Default,
    Return,
    Yield,
    Break,
    Continue,
    Try,
    Catch,
    Throw,
    Const,
    Enum,
    Global,
    Static,
    This,
    Base,
    Extends,
    Typeof,
    Instanceof,
    In,
    Delete,
    Clone,

    // Operators
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Percent,      // %
    PlusPlus,     // ++
    MinusMinus,   // --
    Equal,        // =
    NewSlot,      // <-
    InExprAssign, // :=
    PlusEqual,    // +=
    MinusEqual,   // -=
    StarEqual,    // *=
    SlashEqual,   // /=
    PercentEqual, // %=
    EqualEqual,   // ==
    BangEqual,    // !=
    ThreeWay,     // <=>
    Less,         // <
    LessEqual,    // <=
    Greater,      // >
    GreaterEqual, // >=
    And,          // &&
    Or,           // ||
    QuestionQuestion, // ??
    Bang,         // !
    Tilde,        // ~
    Ampersand,    // &
    Pipe,         // |
    Caret,        // ^
    LessLess,     // <<
    GreaterGreater, // >>

    // Punctuation
    LeftParen,    // (
    RightParen,   // )
    LeftBrace,    // {
    RightBrace,   // }
    LeftBracket,  // [
    RightBracket, // ]
    Comma,        // ,
    Dot,          // .
    DotDotDot,    // ...
    Semicolon,    // ;
    Colon,        // :
    DoubleColon,  // ::
    Question,     // ?
    At,           // @

    Eof,
}

impl TokenKind {
    /// Human-readable name used in "expected X" diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Integer(_) => "integer literal".to_string(),
            TokenKind::Float(_) => "float literal".to_string(),
            TokenKind::String(_) => "string literal".to_string(),
            TokenKind::Identifier(_) => "identifier".to_string(),
            TokenKind::Eof => "end of file".to_string(),
            other => format!("'{}'", other),
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TokenKind::Integer(n) => return write!(f, "{}", n),
            TokenKind::Float(n) => return write!(f, "{}", n),
            TokenKind::String(s) => return write!(f, "\"{}\"", s),
            TokenKind::Identifier(name) => return write!(f, "{}", name),
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Null => "null",
            TokenKind::Local => "local",
            TokenKind::Let => "let",
            TokenKind::Function => "function",
            TokenKind::Constructor => "constructor",
            TokenKind::Class => "class",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::Do => "do",
            TokenKind::For => "for",
            TokenKind::Foreach => "foreach",
            TokenKind::Switch => "switch",
            TokenKind::Case => "case",
            TokenKind::Default => "default",
            TokenKind::Return => "return",
            TokenKind::Yield => "yield",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::Try => "try",
            TokenKind::Catch => "catch",
            TokenKind::Throw => "throw",
            TokenKind::Const => "const",
            TokenKind::Enum => "enum",
            TokenKind::Global => "global",
            TokenKind::Static => "static",
            TokenKind::This => "this",
            TokenKind::Base => "base",
            TokenKind::Extends => "extends",
            TokenKind::Typeof => "typeof",
            TokenKind::Instanceof => "instanceof",
            TokenKind::In => "in",
            TokenKind::Delete => "delete",
            TokenKind::Clone => "clone",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::PlusPlus => "++",
            TokenKind::MinusMinus => "--",
            TokenKind::Equal => "=",
            TokenKind::NewSlot => "<-",
            TokenKind::InExprAssign => ":=",
            TokenKind::PlusEqual => "+=",
            TokenKind::MinusEqual => "-=",
            TokenKind::StarEqual => "*=",
            TokenKind::SlashEqual => "/=",
            TokenKind::PercentEqual => "%=",
            TokenKind::EqualEqual => "==",
            TokenKind::BangEqual => "!=",
            TokenKind::ThreeWay => "<=>",
            TokenKind::Less => "<",
            TokenKind::LessEqual => "<=",
            TokenKind::Greater => ">",
            TokenKind::GreaterEqual => ">=",
            TokenKind::And => "&&",
            TokenKind::Or => "||",
            TokenKind::QuestionQuestion => "??",
            TokenKind::Bang => "!",
            TokenKind::Tilde => "~",
            TokenKind::Ampersand => "&",
            TokenKind::Pipe => "|",
            TokenKind::Caret => "^",
            TokenKind::LessLess => "<<",
            TokenKind::GreaterGreater => ">>",
            TokenKind::LeftParen => "(",
            TokenKind::RightParen => ")",
            TokenKind::LeftBrace => "{",
            TokenKind::RightBrace => "}",
            TokenKind::LeftBracket => "[",
            TokenKind::RightBracket => "]",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::DotDotDot => "...",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::DoubleColon => "::",
            TokenKind::Question => "?",
            TokenKind::At => "@",
            TokenKind::Eof => "<eof>",
        };
        write!(f, "{}", text)
    }
}

/// A single token with its source span and raw lexeme
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            lexeme: lexeme.into(),
            span,
        }
    }
}
