use crate::error::Span;
use crate::lexer::TokenKind;

/// Binary operator tags, grouped by family (arithmetic, comparison, logical,
/// bitwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    Equal,
    NotEqual,
    ThreeWay,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    In,
    Instanceof,

    And,
    Or,
    NullCoalesce,

    BitAnd,
    BitOr,
    BitXor,
    LeftShift,
    RightShift,
}

impl BinaryOp {
    /// Operators that never evaluate their right operand unconditionally.
    pub fn is_short_circuit(&self) -> bool {
        matches!(
            self,
            BinaryOp::And | BinaryOp::Or | BinaryOp::NullCoalesce
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    BitNot,
    Typeof,
    Clone,
}

/// Assignment flavors. `NewSlot` is `<-`, `InExpr` is the `:=` form that is
/// legal inside conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    NewSlot,
    InExpr,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
}

impl AssignOp {
    pub fn from_token(kind: &TokenKind) -> Option<Self> {
        match kind {
            TokenKind::Equal => Some(AssignOp::Assign),
            TokenKind::NewSlot => Some(AssignOp::NewSlot),
            TokenKind::InExprAssign => Some(AssignOp::InExpr),
            TokenKind::PlusEqual => Some(AssignOp::AddAssign),
            TokenKind::MinusEqual => Some(AssignOp::SubAssign),
            TokenKind::StarEqual => Some(AssignOp::MulAssign),
            TokenKind::SlashEqual => Some(AssignOp::DivAssign),
            TokenKind::PercentEqual => Some(AssignOp::ModAssign),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncDecOp {
    Increment,
    Decrement,
}

/// Literal payloads. Integer and float literals are distinct values even when
/// numerically equal, so the constant pool keeps `1` and `1.0` apart.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

/// One declared parameter; `default` is compiled in the enclosing function.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
    pub span: Span,
}

/// A function literal body shared by declarations, members, and lambdas.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<Param>,
    pub is_vararg: bool,
    pub body: super::Block,
    pub span: Span,
}

/// Member key of a table or class body.
#[derive(Debug, Clone)]
pub enum MemberKey {
    /// Bareword `name = ...` / `name() {...}` member.
    Named(String),
    /// JSON-style `"name": ...` member (tables only).
    Json(String),
    /// Computed `[expr] = ...` member.
    Computed(Expr),
}

impl MemberKey {
    /// Literal identity used for the duplicate-member check; computed keys
    /// cannot collide at parse time.
    pub fn literal_name(&self) -> Option<&str> {
        match self {
            MemberKey::Named(name) | MemberKey::Json(name) => Some(name),
            MemberKey::Computed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Member {
    pub key: MemberKey,
    pub value: Expr,
    pub is_static: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ClassBody {
    pub extends: Option<Box<Expr>>,
    pub members: Vec<Member>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal {
        value: Literal,
        span: Span,
    },

    Identifier {
        name: String,
        span: Span,
    },

    This {
        span: Span,
    },

    Base {
        span: Span,
    },

    /// `::name` root-table access.
    Root {
        name: String,
        span: Span,
    },

    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
        span: Span,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },

    Grouping {
        expr: Box<Expr>,
        span: Span,
    },

    Assignment {
        target: Box<Expr>,
        op: AssignOp,
        value: Box<Expr>,
        span: Span,
    },

    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
        span: Span,
    },

    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },

    /// `object.property`
    Get {
        object: Box<Expr>,
        property: String,
        span: Span,
    },

    /// `object[index]`
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },

    Array {
        elements: Vec<Expr>,
        span: Span,
    },

    Table {
        members: Vec<Member>,
        span: Span,
    },

    Class {
        body: ClassBody,
        span: Span,
    },

    Function {
        def: Box<FunctionDef>,
        span: Span,
    },

    PreIncDec {
        op: IncDecOp,
        target: Box<Expr>,
        span: Span,
    },

    PostIncDec {
        op: IncDecOp,
        target: Box<Expr>,
        span: Span,
    },

    /// `delete obj.slot` / `delete obj[key]`; yields the removed value.
    Delete {
        target: Box<Expr>,
        span: Span,
    },

    Comma {
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal { span, .. } => *span,
            Expr::Identifier { span, .. } => *span,
            Expr::This { span } => *span,
            Expr::Base { span } => *span,
            Expr::Root { span, .. } => *span,
            Expr::Binary { span, .. } => *span,
            Expr::Unary { span, .. } => *span,
            Expr::Grouping { span, .. } => *span,
            Expr::Assignment { span, .. } => *span,
            Expr::Ternary { span, .. } => *span,
            Expr::Call { span, .. } => *span,
            Expr::Get { span, .. } => *span,
            Expr::Index { span, .. } => *span,
            Expr::Array { span, .. } => *span,
            Expr::Table { span, .. } => *span,
            Expr::Class { span, .. } => *span,
            Expr::Function { span, .. } => *span,
            Expr::PreIncDec { span, .. } => *span,
            Expr::PostIncDec { span, .. } => *span,
            Expr::Delete { span, .. } => *span,
            Expr::Comma { span, .. } => *span,
        }
    }

    /// Shapes that can appear on the left of `=` and compound assignment.
    /// `<-` additionally accepts any access expression; codegen checks that.
    pub fn is_lvalue(&self) -> bool {
        matches!(
            self,
            Expr::Identifier { .. } | Expr::Get { .. } | Expr::Index { .. } | Expr::Root { .. }
        )
    }

    /// Access expressions (receiver + key), the shapes `delete` and `<-` need.
    pub fn is_access(&self) -> bool {
        matches!(self, Expr::Get { .. } | Expr::Index { .. })
    }
}
