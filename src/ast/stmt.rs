use super::expr::{Expr, FunctionDef, Literal};
use crate::error::Span;

/// One `local`/`let` binding; several can share a declaration statement.
#[derive(Debug, Clone)]
pub struct LocalDecl {
    pub name: String,
    pub initializer: Option<Expr>,
    pub span: Span,
}

/// One name bound by a destructuring declaration. Table patterns read the
/// slot with the same name from the source; array patterns bind by position.
#[derive(Debug, Clone)]
pub struct DestructureBinding {
    pub name: String,
    pub default: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructureKind {
    Table,
    Array,
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub value: Expr,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct EnumMember {
    pub name: String,
    pub value: Option<Literal>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Empty {
        span: Span,
    },

    Expression {
        expr: Expr,
        span: Span,
    },

    Block {
        block: super::Block,
    },

    /// `local a = 1, b` (assignable) or `let a = 1` (read-only).
    Local {
        decls: Vec<LocalDecl>,
        assignable: bool,
        span: Span,
    },

    /// `local {a, b = 1} = src` / `let [x, y] = src`.
    Destructure {
        kind: DestructureKind,
        bindings: Vec<DestructureBinding>,
        source: Expr,
        assignable: bool,
        span: Span,
    },

    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        span: Span,
    },

    While {
        condition: Expr,
        body: Box<Stmt>,
        span: Span,
    },

    DoWhile {
        body: Box<Stmt>,
        condition: Expr,
        span: Span,
    },

    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        increment: Option<Expr>,
        body: Box<Stmt>,
        span: Span,
    },

    Foreach {
        /// Optional user index binding; `foreach (v in e)` leaves it `None`.
        index: Option<String>,
        value: String,
        iterable: Expr,
        body: Box<Stmt>,
        span: Span,
    },

    Switch {
        subject: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
        span: Span,
    },

    /// `function name(...) {...}` declaration sugar (newslot on `this`).
    Function {
        def: Box<FunctionDef>,
        span: Span,
    },

    /// `class Name [extends E] {...}` declaration sugar.
    Class {
        name: String,
        body: super::expr::ClassBody,
        span: Span,
    },

    Return {
        value: Option<Expr>,
        span: Span,
    },

    Yield {
        value: Option<Expr>,
        span: Span,
    },

    Break {
        span: Span,
    },

    Continue {
        span: Span,
    },

    TryCatch {
        try_body: Box<Stmt>,
        catch_var: String,
        catch_body: Box<Stmt>,
        span: Span,
    },

    Throw {
        value: Expr,
        span: Span,
    },

    Const {
        name: String,
        value: Literal,
        global: bool,
        span: Span,
    },

    Enum {
        name: String,
        members: Vec<EnumMember>,
        global: bool,
        span: Span,
    },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Empty { span } => *span,
            Stmt::Expression { span, .. } => *span,
            Stmt::Block { block } => block.span,
            Stmt::Local { span, .. } => *span,
            Stmt::Destructure { span, .. } => *span,
            Stmt::If { span, .. } => *span,
            Stmt::While { span, .. } => *span,
            Stmt::DoWhile { span, .. } => *span,
            Stmt::For { span, .. } => *span,
            Stmt::Foreach { span, .. } => *span,
            Stmt::Switch { span, .. } => *span,
            Stmt::Function { span, .. } => *span,
            Stmt::Class { span, .. } => *span,
            Stmt::Return { span, .. } => *span,
            Stmt::Yield { span, .. } => *span,
            Stmt::Break { span } => *span,
            Stmt::Continue { span } => *span,
            Stmt::TryCatch { span, .. } => *span,
            Stmt::Throw { span, .. } => *span,
            Stmt::Const { span, .. } => *span,
            Stmt::Enum { span, .. } => *span,
        }
    }
}
