pub mod expr;
pub mod stmt;

pub use expr::{
    AssignOp, BinaryOp, ClassBody, Expr, FunctionDef, IncDecOp, Literal, Member, MemberKey,
    Param, UnaryOp,
};
pub use stmt::{
    DestructureBinding, DestructureKind, EnumMember, LocalDecl, Stmt, SwitchCase,
};

use crate::error::Span;

/// Ordered statement list. Whether a block is a function body or the syntactic
/// root is a property of the visit, not the node, so the struct stays plain.
#[derive(Debug, Clone)]
pub struct Block {
    pub statements: Vec<Stmt>,
    pub span: Span,
}

impl Block {
    pub fn new(statements: Vec<Stmt>, span: Span) -> Self {
        Self { statements, span }
    }
}

/// Root of one compile unit. Owns the whole node tree; dropping the program
/// frees every node at once.
#[derive(Debug, Clone)]
pub struct Program {
    pub block: Block,
}

impl Program {
    pub fn new(block: Block) -> Self {
        Self { block }
    }
}
