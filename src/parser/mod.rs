// Hazel Parser
// Recursive descent parser that converts tokens into an AST

use rustc_hash::FxHashSet;

use crate::ast::*;
use crate::error::{CompileError, CompileResult, Span};
use crate::lexer::{Token, TokenKind};
use crate::{FEATURE_NO_CLASS_DECL_SUGAR, FEATURE_NO_FUNC_DECL_SUGAR, FEATURE_NO_ROOT_ACCESS};

/// Where an expression appears. Plain `=` is only legal in statement
/// position; the in-expression form `:=` stays legal inside conditions so
/// `if (x := f())` works while `if (x = 5)` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExprContext {
    Statement,
    IfCondition,
    SwitchSubject,
    LoopCondition,
    FunctionArg,
    NoAssign,
}

impl ExprContext {
    fn describe(&self) -> &'static str {
        match self {
            ExprContext::Statement => "a statement",
            ExprContext::IfCondition => "'if'",
            ExprContext::SwitchSubject => "'switch'",
            ExprContext::LoopCondition => "a loop condition",
            ExprContext::FunctionArg => "a function argument",
            ExprContext::NoAssign => "this position",
        }
    }
}

/// Recursive descent parser for Hazel
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    file: String,
    source: String,
    context: ExprContext,
    features: u32,
    feature_updates: Vec<(usize, u32)>,
    next_update: usize,
}

impl Parser {
    pub fn new(
        tokens: Vec<Token>,
        feature_updates: Vec<(usize, u32)>,
        features: u32,
        file: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            current: 0,
            file: file.into(),
            source: source.into(),
            context: ExprContext::Statement,
            features,
            feature_updates,
            next_update: 0,
        }
    }

    /// Parse the entire program
    pub fn parse(&mut self) -> CompileResult<Program> {
        let start = self.peek().span;
        let mut statements = Vec::new();

        while !self.is_at_end() {
            statements.push(self.statement()?);
        }

        let span = start.merge(self.previous_or_start().span);
        Ok(Program::new(Block::new(statements, span)))
    }

    /// Feature mask in effect at the current token, accounting for feature
    /// directives that appeared earlier in the stream.
    fn features(&mut self) -> u32 {
        while self.next_update < self.feature_updates.len()
            && self.feature_updates[self.next_update].0 <= self.current
        {
            self.features = self.feature_updates[self.next_update].1;
            self.next_update += 1;
        }
        self.features
    }

    // ==================== Statements ====================

    fn statement(&mut self) -> CompileResult<Stmt> {
        match &self.peek().kind {
            TokenKind::Semicolon => {
                let span = self.advance().span;
                Ok(Stmt::Empty { span })
            }
            TokenKind::LeftBrace => {
                let block = self.block()?;
                Ok(Stmt::Block { block })
            }
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Do => self.do_while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Foreach => self.foreach_statement(),
            TokenKind::Switch => self.switch_statement(),
            TokenKind::Local => self.local_declaration(true),
            TokenKind::Let => self.local_declaration(false),
            TokenKind::Return => self.return_statement(false),
            TokenKind::Yield => self.return_statement(true),
            TokenKind::Break => {
                let span = self.advance().span;
                self.match_token(&TokenKind::Semicolon);
                Ok(Stmt::Break { span })
            }
            TokenKind::Continue => {
                let span = self.advance().span;
                self.match_token(&TokenKind::Semicolon);
                Ok(Stmt::Continue { span })
            }
            TokenKind::Function => self.function_declaration(),
            TokenKind::Class => self.class_declaration(),
            TokenKind::Try => self.try_statement(),
            TokenKind::Throw => self.throw_statement(),
            TokenKind::Const => self.const_declaration(false),
            TokenKind::Enum => self.enum_declaration(false),
            TokenKind::Global => self.global_declaration(),
            _ => self.expression_statement(),
        }
    }

    fn block(&mut self) -> CompileResult<Block> {
        let start = self.consume(&TokenKind::LeftBrace, "Expected '{'")?.span;
        let mut statements = Vec::new();

        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            statements.push(self.statement()?);
        }

        let end = self
            .consume(&TokenKind::RightBrace, "Expected '}' after block")?
            .span;
        Ok(Block::new(statements, start.merge(end)))
    }

    fn expression_statement(&mut self) -> CompileResult<Stmt> {
        let expr = self.comma_expression(ExprContext::Statement)?;
        let span = expr.span();
        self.match_token(&TokenKind::Semicolon);
        Ok(Stmt::Expression { expr, span })
    }

    fn if_statement(&mut self) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'if'
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'if'")?;
        let condition = self.expression_in(ExprContext::IfCondition)?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition")?;

        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.match_token(&TokenKind::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };

        let end = self.previous().span;
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            span: start.merge(end),
        })
    }

    fn while_statement(&mut self) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'while'
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'")?;
        let condition = self.expression_in(ExprContext::LoopCondition)?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition")?;

        let body = Box::new(self.statement()?);
        let end = self.previous().span;
        Ok(Stmt::While {
            condition,
            body,
            span: start.merge(end),
        })
    }

    fn do_while_statement(&mut self) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'do'
        let body = Box::new(self.statement()?);

        self.consume(&TokenKind::While, "Expected 'while' after 'do' body")?;
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'")?;
        let condition = self.expression_in(ExprContext::LoopCondition)?;
        let end = self
            .consume(&TokenKind::RightParen, "Expected ')' after condition")?
            .span;
        self.match_token(&TokenKind::Semicolon);

        Ok(Stmt::DoWhile {
            body,
            condition,
            span: start.merge(end),
        })
    }

    fn for_statement(&mut self) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'for'
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'for'")?;

        let init = if self.match_token(&TokenKind::Semicolon) {
            None
        } else if self.check(&TokenKind::Local) {
            let decl = self.local_declaration(true)?;
            // local_declaration eats a trailing ';' when present
            Some(Box::new(decl))
        } else {
            let stmt = self.expression_statement()?;
            Some(Box::new(stmt))
        };

        let condition = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression_in(ExprContext::LoopCondition)?)
        };
        self.consume(&TokenKind::Semicolon, "Expected ';' after 'for' condition")?;

        let increment = if self.check(&TokenKind::RightParen) {
            None
        } else {
            Some(self.comma_expression(ExprContext::Statement)?)
        };
        self.consume(&TokenKind::RightParen, "Expected ')' after 'for' clauses")?;

        let body = Box::new(self.statement()?);
        let end = self.previous().span;
        Ok(Stmt::For {
            init,
            condition,
            increment,
            body,
            span: start.merge(end),
        })
    }

    fn foreach_statement(&mut self) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'foreach'
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'foreach'")?;

        let first = self
            .consume_identifier("Expected iteration variable after '('")?
            .lexeme
            .clone();

        let (index, value) = if self.match_token(&TokenKind::Comma) {
            let value = self
                .consume_identifier("Expected value variable after ','")?
                .lexeme
                .clone();
            (Some(first), value)
        } else {
            (None, first)
        };

        self.consume(&TokenKind::In, "Expected 'in' in 'foreach'")?;
        let iterable = self.expression_in(ExprContext::NoAssign)?;
        self.consume(&TokenKind::RightParen, "Expected ')' after 'foreach' source")?;

        let body = Box::new(self.statement()?);
        let end = self.previous().span;
        Ok(Stmt::Foreach {
            index,
            value,
            iterable,
            body,
            span: start.merge(end),
        })
    }

    fn switch_statement(&mut self) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'switch'
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'switch'")?;
        let subject = self.expression_in(ExprContext::SwitchSubject)?;
        self.consume(&TokenKind::RightParen, "Expected ')' after 'switch' subject")?;
        self.consume(&TokenKind::LeftBrace, "Expected '{' to open 'switch' body")?;

        let mut cases = Vec::new();
        let mut default = None;

        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            if self.check(&TokenKind::Case) {
                let case_start = self.advance().span;
                if default.is_some() {
                    return Err(self.error("'case' after 'default' is not allowed"));
                }
                let value = self.expression_in(ExprContext::NoAssign)?;
                self.consume(&TokenKind::Colon, "Expected ':' after 'case' value")?;
                let body = self.case_body()?;
                let span = case_start.merge(self.previous().span);
                cases.push(SwitchCase { value, body, span });
            } else if self.check(&TokenKind::Default) {
                self.advance();
                if default.is_some() {
                    return Err(self.error("Duplicate 'default' clause"));
                }
                self.consume(&TokenKind::Colon, "Expected ':' after 'default'")?;
                default = Some(self.case_body()?);
            } else {
                return Err(self.error("Expected 'case' or 'default' inside 'switch'"));
            }
        }

        let end = self
            .consume(&TokenKind::RightBrace, "Expected '}' to close 'switch'")?
            .span;
        Ok(Stmt::Switch {
            subject,
            cases,
            default,
            span: start.merge(end),
        })
    }

    fn case_body(&mut self) -> CompileResult<Vec<Stmt>> {
        let mut body = Vec::new();
        while !self.check(&TokenKind::Case)
            && !self.check(&TokenKind::Default)
            && !self.check(&TokenKind::RightBrace)
            && !self.is_at_end()
        {
            body.push(self.statement()?);
        }
        Ok(body)
    }

    /// `local` / `let` declarations: plain bindings, chained bindings,
    /// `local function` sugar, and `{...}`/`[...]` destructuring.
    fn local_declaration(&mut self, assignable: bool) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'local' / 'let'

        if self.check(&TokenKind::LeftBrace) || self.check(&TokenKind::LeftBracket) {
            return self.destructure_declaration(start, assignable);
        }

        if self.check(&TokenKind::Function) {
            self.advance();
            let name_token = self.consume_identifier("Expected function name after 'function'")?;
            let name = name_token.lexeme.clone();
            let name_span = name_token.span;
            let def = self.function_rest(Some(name.clone()), name_span)?;
            let span = start.merge(def.span);
            let init = Expr::Function {
                span: def.span,
                def: Box::new(def),
            };
            return Ok(Stmt::Local {
                decls: vec![LocalDecl {
                    name,
                    initializer: Some(init),
                    span: name_span,
                }],
                assignable,
                span,
            });
        }

        let mut decls = Vec::new();
        loop {
            let name_token = self.consume_identifier("Expected variable name")?;
            let name = name_token.lexeme.clone();
            let name_span = name_token.span;

            let initializer = if self.match_token(&TokenKind::Equal) {
                Some(self.expression_in(ExprContext::NoAssign)?)
            } else if !assignable {
                return Err(self
                    .error(format!("'let' binding '{}' must be initialized", name)));
            } else {
                None
            };

            let span = match &initializer {
                Some(init) => name_span.merge(init.span()),
                None => name_span,
            };
            decls.push(LocalDecl {
                name,
                initializer,
                span,
            });

            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }

        let end = self.previous().span;
        self.match_token(&TokenKind::Semicolon);
        Ok(Stmt::Local {
            decls,
            assignable,
            span: start.merge(end),
        })
    }

    fn destructure_declaration(&mut self, start: Span, assignable: bool) -> CompileResult<Stmt> {
        let (kind, close) = if self.match_token(&TokenKind::LeftBrace) {
            (DestructureKind::Table, TokenKind::RightBrace)
        } else {
            self.advance(); // consume '['
            (DestructureKind::Array, TokenKind::RightBracket)
        };

        let mut bindings = Vec::new();
        loop {
            let name_token = self.consume_identifier("Expected binding name in pattern")?;
            let name = name_token.lexeme.clone();
            let name_span = name_token.span;

            let default = if self.match_token(&TokenKind::Equal) {
                Some(self.expression_in(ExprContext::NoAssign)?)
            } else {
                None
            };

            bindings.push(DestructureBinding {
                name,
                default,
                span: name_span,
            });

            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&close, "Expected closing bracket after pattern")?;

        if bindings.is_empty() {
            return Err(self.error("Destructuring pattern binds no names"));
        }

        self.consume(&TokenKind::Equal, "Expected '=' after destructuring pattern")?;
        let source = self.expression_in(ExprContext::NoAssign)?;
        let span = start.merge(source.span());
        self.match_token(&TokenKind::Semicolon);

        Ok(Stmt::Destructure {
            kind,
            bindings,
            source,
            assignable,
            span,
        })
    }

    fn return_statement(&mut self, is_yield: bool) -> CompileResult<Stmt> {
        let keyword = self.advance(); // consume 'return' / 'yield'
        let start = keyword.span;
        let keyword_line = keyword.span.start.line;

        // A value must start on the same line as the keyword
        let value = if self.check(&TokenKind::Semicolon)
            || self.check(&TokenKind::RightBrace)
            || self.is_at_end()
            || self.peek().span.start.line != keyword_line
        {
            None
        } else {
            Some(self.comma_expression(ExprContext::NoAssign)?)
        };

        let end = match &value {
            Some(v) => v.span(),
            None => start,
        };
        self.match_token(&TokenKind::Semicolon);

        let span = start.merge(end);
        if is_yield {
            Ok(Stmt::Yield { value, span })
        } else {
            Ok(Stmt::Return { value, span })
        }
    }

    fn function_declaration(&mut self) -> CompileResult<Stmt> {
        if self.features() & FEATURE_NO_FUNC_DECL_SUGAR != 0 {
            return Err(self
                .error("Function declarations are disabled")
                .with_help("Use 'local function name() {...}' or assign a function expression"));
        }

        let start = self.advance().span; // consume 'function'
        let name_token = self.consume_identifier("Expected function name")?;
        let name = name_token.lexeme.clone();
        let name_span = name_token.span;

        let def = self.function_rest(Some(name), name_span)?;
        let span = start.merge(def.span);
        Ok(Stmt::Function {
            def: Box::new(def),
            span,
        })
    }

    fn class_declaration(&mut self) -> CompileResult<Stmt> {
        if self.features() & FEATURE_NO_CLASS_DECL_SUGAR != 0 {
            return Err(self
                .error("Class declarations are disabled")
                .with_help("Assign a class expression instead"));
        }

        let start = self.advance().span; // consume 'class'
        let name = self
            .consume_identifier("Expected class name")?
            .lexeme
            .clone();

        let body = self.class_body(start)?;
        let span = start.merge(body.span);
        Ok(Stmt::Class { name, body, span })
    }

    fn try_statement(&mut self) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'try'
        let try_body = Box::new(self.statement()?);

        self.consume(&TokenKind::Catch, "Expected 'catch' after 'try' body")?;
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'catch'")?;
        let catch_var = self
            .consume_identifier("Expected exception variable name")?
            .lexeme
            .clone();
        self.consume(&TokenKind::RightParen, "Expected ')' after exception variable")?;
        let catch_body = Box::new(self.statement()?);

        let end = self.previous().span;
        Ok(Stmt::TryCatch {
            try_body,
            catch_var,
            catch_body,
            span: start.merge(end),
        })
    }

    fn throw_statement(&mut self) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'throw'
        let value = self.expression_in(ExprContext::NoAssign)?;
        let span = start.merge(value.span());
        self.match_token(&TokenKind::Semicolon);
        Ok(Stmt::Throw { value, span })
    }

    fn global_declaration(&mut self) -> CompileResult<Stmt> {
        self.advance(); // consume 'global'
        if self.check(&TokenKind::Const) {
            self.const_declaration(true)
        } else if self.check(&TokenKind::Enum) {
            self.enum_declaration(true)
        } else {
            Err(self.error("Expected 'const' or 'enum' after 'global'"))
        }
    }

    fn const_declaration(&mut self, global: bool) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'const'
        let name = self
            .consume_identifier("Expected constant name")?
            .lexeme
            .clone();
        self.consume(&TokenKind::Equal, "Expected '=' after constant name")?;
        let value = self.scalar_literal("Constant value must be a scalar literal")?;

        let end = self.previous().span;
        self.match_token(&TokenKind::Semicolon);
        Ok(Stmt::Const {
            name,
            value,
            global,
            span: start.merge(end),
        })
    }

    fn enum_declaration(&mut self, global: bool) -> CompileResult<Stmt> {
        let start = self.advance().span; // consume 'enum'
        let name = self.consume_identifier("Expected enum name")?.lexeme.clone();
        self.consume(&TokenKind::LeftBrace, "Expected '{' after enum name")?;

        let mut members = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            let member_token = self.consume_identifier("Expected enum member name")?;
            let member_name = member_token.lexeme.clone();
            let member_span = member_token.span;

            let value = if self.match_token(&TokenKind::Equal) {
                Some(self.scalar_literal("Enum value must be a scalar literal")?)
            } else {
                None
            };

            members.push(EnumMember {
                name: member_name,
                value,
                span: member_span,
            });

            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }

        let end = self
            .consume(&TokenKind::RightBrace, "Expected '}' to close enum")?
            .span;
        self.match_token(&TokenKind::Semicolon);
        Ok(Stmt::Enum {
            name,
            members,
            global,
            span: start.merge(end),
        })
    }

    /// Scalar literal with an optional leading minus, as `const`/`enum`
    /// initializers require.
    fn scalar_literal(&mut self, message: &str) -> CompileResult<Literal> {
        let negate = self.match_token(&TokenKind::Minus);
        let token = self.advance().clone();
        let literal = match token.kind {
            TokenKind::Integer(n) => Literal::Integer(if negate { -n } else { n }),
            TokenKind::Float(n) => Literal::Float(if negate { -n } else { n }),
            TokenKind::String(s) if !negate => Literal::String(s),
            TokenKind::True if !negate => Literal::Boolean(true),
            TokenKind::False if !negate => Literal::Boolean(false),
            _ => return Err(self.error_at(message, token.span)),
        };
        Ok(literal)
    }

    // ==================== Expressions ====================

    fn expression_in(&mut self, context: ExprContext) -> CompileResult<Expr> {
        let saved = self.context;
        self.context = context;
        let result = self.expression();
        self.context = saved;
        result
    }

    /// `a, b, c` sequence; value is the last expression.
    fn comma_expression(&mut self, context: ExprContext) -> CompileResult<Expr> {
        let saved = self.context;
        self.context = context;
        let result = (|| {
            let mut expr = self.expression()?;
            while self.match_token(&TokenKind::Comma) {
                let right = self.expression()?;
                let span = expr.span().merge(right.span());
                expr = Expr::Comma {
                    left: Box::new(expr),
                    right: Box::new(right),
                    span,
                };
            }
            Ok(expr)
        })();
        self.context = saved;
        result
    }

    /// Assignment / ternary level (lowest precedence)
    fn expression(&mut self) -> CompileResult<Expr> {
        let expr = self.null_coalesce()?;

        if let Some(op) = AssignOp::from_token(&self.peek().kind) {
            let op_token_span = self.peek().span;
            self.check_assign_context(op, op_token_span)?;
            self.advance();

            if op == AssignOp::NewSlot {
                if !expr.is_access() && !matches!(expr, Expr::Root { .. }) {
                    return Err(self
                        .error_at("'<-' needs a slot expression on its left", expr.span()));
                }
            } else if !expr.is_lvalue() {
                return Err(self.error_at("Can't assign to expression", expr.span()));
            }

            let value = self.expression()?; // right-associative
            let span = expr.span().merge(value.span());
            return Ok(Expr::Assignment {
                target: Box::new(expr),
                op,
                value: Box::new(value),
                span,
            });
        }

        if self.match_token(&TokenKind::Question) {
            let then_expr = self.expression()?;
            self.consume(&TokenKind::Colon, "Expected ':' in ternary expression")?;
            let else_expr = self.expression()?;
            let span = expr.span().merge(else_expr.span());
            return Ok(Expr::Ternary {
                condition: Box::new(expr),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
                span,
            });
        }

        Ok(expr)
    }

    fn check_assign_context(&self, op: AssignOp, span: Span) -> CompileResult<()> {
        // ':=' exists exactly so conditions can bind; everything else is
        // statement-only.
        let legal = match op {
            AssignOp::InExpr => self.context != ExprContext::NoAssign,
            _ => self.context == ExprContext::Statement,
        };
        if legal {
            return Ok(());
        }

        let symbol = match op {
            AssignOp::Assign => "=",
            AssignOp::NewSlot => "<-",
            AssignOp::InExpr => ":=",
            AssignOp::AddAssign => "+=",
            AssignOp::SubAssign => "-=",
            AssignOp::MulAssign => "*=",
            AssignOp::DivAssign => "/=",
            AssignOp::ModAssign => "%=",
        };
        let mut err = self.error_at(
            format!("'{}' inside {} is forbidden", symbol, self.context.describe()),
            span,
        );
        if op == AssignOp::Assign && self.context != ExprContext::NoAssign {
            err = err.with_help("Use ':=' to bind inside an expression, or '==' to compare");
        }
        Err(err)
    }

    fn null_coalesce(&mut self) -> CompileResult<Expr> {
        let mut expr = self.logical_or()?;
        while self.match_token(&TokenKind::QuestionQuestion) {
            let right = self.logical_or()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: BinaryOp::NullCoalesce,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn logical_or(&mut self) -> CompileResult<Expr> {
        let mut expr = self.logical_and()?;
        while self.match_token(&TokenKind::Or) {
            let right = self.logical_and()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: BinaryOp::Or,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn logical_and(&mut self) -> CompileResult<Expr> {
        let mut expr = self.bitwise_or()?;
        while self.match_token(&TokenKind::And) {
            let right = self.bitwise_or()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: BinaryOp::And,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn bitwise_or(&mut self) -> CompileResult<Expr> {
        let mut expr = self.bitwise_xor()?;
        while self.match_token(&TokenKind::Pipe) {
            let right = self.bitwise_xor()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: BinaryOp::BitOr,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn bitwise_xor(&mut self) -> CompileResult<Expr> {
        let mut expr = self.bitwise_and()?;
        while self.match_token(&TokenKind::Caret) {
            let right = self.bitwise_and()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: BinaryOp::BitXor,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn bitwise_and(&mut self) -> CompileResult<Expr> {
        let mut expr = self.equality()?;
        while self.match_token(&TokenKind::Ampersand) {
            let right = self.equality()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: BinaryOp::BitAnd,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn equality(&mut self) -> CompileResult<Expr> {
        let mut expr = self.relational()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::EqualEqual => BinaryOp::Equal,
                TokenKind::BangEqual => BinaryOp::NotEqual,
                TokenKind::ThreeWay => BinaryOp::ThreeWay,
                _ => break,
            };
            self.advance();
            let right = self.relational()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn relational(&mut self) -> CompileResult<Expr> {
        let mut expr = self.shift()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEqual => BinaryOp::LessEqual,
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
                TokenKind::In => BinaryOp::In,
                TokenKind::Instanceof => BinaryOp::Instanceof,
                _ => break,
            };
            self.advance();
            let right = self.shift()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn shift(&mut self) -> CompileResult<Expr> {
        let mut expr = self.additive()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::LessLess => BinaryOp::LeftShift,
                TokenKind::GreaterGreater => BinaryOp::RightShift,
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn additive(&mut self) -> CompileResult<Expr> {
        let mut expr = self.multiplicative()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn multiplicative(&mut self) -> CompileResult<Expr> {
        let mut expr = self.prefixed()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.prefixed()?;
            let span = expr.span().merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn prefixed(&mut self) -> CompileResult<Expr> {
        let span = self.peek().span;
        match &self.peek().kind {
            TokenKind::Minus
            | TokenKind::Bang
            | TokenKind::Tilde
            | TokenKind::Typeof
            | TokenKind::Clone => {
                let op = match self.advance().kind {
                    TokenKind::Minus => UnaryOp::Negate,
                    TokenKind::Bang => UnaryOp::Not,
                    TokenKind::Tilde => UnaryOp::BitNot,
                    TokenKind::Typeof => UnaryOp::Typeof,
                    _ => UnaryOp::Clone,
                };
                let operand = self.prefixed()?;
                let full = span.merge(operand.span());
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                    span: full,
                })
            }
            TokenKind::Delete => {
                self.advance();
                let target = self.prefixed()?;
                if !target.is_access() {
                    return Err(self
                        .error_at("'delete' needs a field or index expression", target.span()));
                }
                let full = span.merge(target.span());
                Ok(Expr::Delete {
                    target: Box::new(target),
                    span: full,
                })
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = if self.advance().kind == TokenKind::PlusPlus {
                    IncDecOp::Increment
                } else {
                    IncDecOp::Decrement
                };
                let target = self.prefixed()?;
                if !target.is_lvalue() {
                    return Err(self.error_at("Can't increment this expression", target.span()));
                }
                let full = span.merge(target.span());
                Ok(Expr::PreIncDec {
                    op,
                    target: Box::new(target),
                    span: full,
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> CompileResult<Expr> {
        let mut expr = self.factor()?;

        loop {
            match &self.peek().kind {
                TokenKind::Dot => {
                    self.advance();
                    // `constructor` is a keyword but stays legal as a property
                    let name_token = if self.check(&TokenKind::Constructor) {
                        self.advance()
                    } else {
                        self.consume_identifier("Expected property name after '.'")?
                    };
                    let property = name_token.lexeme.clone();
                    let span = expr.span().merge(name_token.span);
                    expr = Expr::Get {
                        object: Box::new(expr),
                        property,
                        span,
                    };
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.expression_in(ExprContext::NoAssign)?;
                    let end = self
                        .consume(&TokenKind::RightBracket, "Expected ']' after index")?
                        .span;
                    let span = expr.span().merge(end);
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        span,
                    };
                }
                TokenKind::LeftParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RightParen) {
                        loop {
                            args.push(self.expression_in(ExprContext::FunctionArg)?);
                            if !self.match_token(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    let end = self
                        .consume(&TokenKind::RightParen, "Expected ')' after arguments")?
                        .span;
                    let span = expr.span().merge(end);
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        span,
                    };
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    // Postfix only binds on the same line as its operand
                    if self.peek().span.start.line != self.previous().span.end.line {
                        break;
                    }
                    if !expr.is_lvalue() {
                        return Err(self.error_at("Can't increment this expression", expr.span()));
                    }
                    let token = self.advance();
                    let op = if token.kind == TokenKind::PlusPlus {
                        IncDecOp::Increment
                    } else {
                        IncDecOp::Decrement
                    };
                    let span = expr.span().merge(token.span);
                    expr = Expr::PostIncDec {
                        op,
                        target: Box::new(expr),
                        span,
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn factor(&mut self) -> CompileResult<Expr> {
        let token = self.peek().clone();
        let span = token.span;

        match token.kind {
            TokenKind::Integer(n) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Integer(n),
                    span,
                })
            }
            TokenKind::Float(n) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Float(n),
                    span,
                })
            }
            TokenKind::String(s) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::String(s),
                    span,
                })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Boolean(true),
                    span,
                })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Boolean(false),
                    span,
                })
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Null,
                    span,
                })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::Identifier { name, span })
            }
            TokenKind::This => {
                self.advance();
                Ok(Expr::This { span })
            }
            TokenKind::Base => {
                self.advance();
                Ok(Expr::Base { span })
            }
            TokenKind::DoubleColon => {
                if self.features() & FEATURE_NO_ROOT_ACCESS != 0 {
                    return Err(self.error("Root table access is disabled"));
                }
                self.advance();
                let name_token = self.consume_identifier("Expected name after '::'")?;
                let name = name_token.lexeme.clone();
                let full = span.merge(name_token.span);
                Ok(Expr::Root { name, span: full })
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.comma_expression(self.context)?;
                let end = self
                    .consume(&TokenKind::RightParen, "Expected ')' after expression")?
                    .span;
                Ok(Expr::Grouping {
                    expr: Box::new(inner),
                    span: span.merge(end),
                })
            }
            TokenKind::LeftBracket => self.array_literal(),
            TokenKind::LeftBrace => self.table_literal(),
            TokenKind::Function => {
                self.advance();
                let name = if self.check_identifier() {
                    Some(self.advance().lexeme.clone())
                } else {
                    None
                };
                let def = self.function_rest(name, span)?;
                let full = span.merge(def.span);
                Ok(Expr::Function {
                    def: Box::new(def),
                    span: full,
                })
            }
            TokenKind::Class => {
                self.advance();
                let body = self.class_body(span)?;
                let full = span.merge(body.span);
                Ok(Expr::Class { body, span: full })
            }
            TokenKind::At => self.lambda(),
            _ => Err(self.error(format!(
                "Unexpected {} in expression",
                token.kind.describe()
            ))),
        }
    }

    fn array_literal(&mut self) -> CompileResult<Expr> {
        let start = self.advance().span; // consume '['
        let mut elements = Vec::new();

        while !self.check(&TokenKind::RightBracket) && !self.is_at_end() {
            elements.push(self.expression_in(ExprContext::NoAssign)?);
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }

        let end = self
            .consume(&TokenKind::RightBracket, "Expected ']' after array elements")?
            .span;
        Ok(Expr::Array {
            elements,
            span: start.merge(end),
        })
    }

    fn table_literal(&mut self) -> CompileResult<Expr> {
        let start = self.advance().span; // consume '{'
        let members = self.member_list(false)?;
        let end = self
            .consume(&TokenKind::RightBrace, "Expected '}' after table members")?
            .span;
        Ok(Expr::Table {
            members,
            span: start.merge(end),
        })
    }

    fn class_body(&mut self, start: Span) -> CompileResult<ClassBody> {
        let extends = if self.match_token(&TokenKind::Extends) {
            Some(Box::new(self.expression_in(ExprContext::NoAssign)?))
        } else {
            None
        };

        self.consume(&TokenKind::LeftBrace, "Expected '{' to open class body")?;
        let members = self.member_list(true)?;
        let end = self
            .consume(&TokenKind::RightBrace, "Expected '}' after class body")?
            .span;

        Ok(ClassBody {
            extends,
            members,
            span: start.merge(end),
        })
    }

    /// Shared table/class member parser. Classes additionally accept `static`
    /// and `constructor`, and reject the JSON string-key form.
    fn member_list(&mut self, is_class: bool) -> CompileResult<Vec<Member>> {
        let mut members = Vec::new();
        let mut seen: FxHashSet<String> = FxHashSet::default();

        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            let member_start = self.peek().span;

            let is_static = if is_class && self.check(&TokenKind::Static) {
                self.advance();
                true
            } else {
                false
            };

            let member = match &self.peek().kind {
                TokenKind::Function => {
                    self.advance();
                    let name_token = self.consume_identifier("Expected method name")?;
                    let name = name_token.lexeme.clone();
                    let name_span = name_token.span;
                    let def = self.function_rest(Some(name.clone()), name_span)?;
                    let span = member_start.merge(def.span);
                    Member {
                        key: MemberKey::Named(name),
                        value: Expr::Function {
                            span: def.span,
                            def: Box::new(def),
                        },
                        is_static,
                        span,
                    }
                }
                TokenKind::Constructor if is_class => {
                    let ctor_span = self.advance().span;
                    let def = self.function_rest(Some("constructor".to_string()), ctor_span)?;
                    let span = member_start.merge(def.span);
                    Member {
                        key: MemberKey::Named("constructor".to_string()),
                        value: Expr::Function {
                            span: def.span,
                            def: Box::new(def),
                        },
                        is_static,
                        span,
                    }
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let key = self.expression_in(ExprContext::NoAssign)?;
                    self.consume(&TokenKind::RightBracket, "Expected ']' after member key")?;
                    self.consume(&TokenKind::Equal, "Expected '=' after computed member key")?;
                    let value = self.expression_in(ExprContext::NoAssign)?;
                    let span = member_start.merge(value.span());
                    Member {
                        key: MemberKey::Computed(key),
                        value,
                        is_static,
                        span,
                    }
                }
                TokenKind::String(s) if !is_class => {
                    let name = s.clone();
                    self.advance();
                    self.consume(&TokenKind::Colon, "Expected ':' after string member key")?;
                    let value = self.expression_in(ExprContext::NoAssign)?;
                    let span = member_start.merge(value.span());
                    Member {
                        key: MemberKey::Json(name),
                        value,
                        is_static,
                        span,
                    }
                }
                _ => {
                    let name_token = self.consume_identifier("Expected member name")?;
                    let name = name_token.lexeme.clone();
                    self.consume(&TokenKind::Equal, "Expected '=' after member name")?;
                    let value = self.expression_in(ExprContext::NoAssign)?;
                    let span = member_start.merge(value.span());
                    Member {
                        key: MemberKey::Named(name),
                        value,
                        is_static,
                        span,
                    }
                }
            };

            if let Some(name) = member.key.literal_name() {
                if !seen.insert(name.to_string()) {
                    return Err(self.error_at(
                        format!("Duplicate member '{}'", name),
                        member.span,
                    ));
                }
            }

            members.push(member);

            // Members may be separated by ',' or ';', both optional
            if !self.match_token(&TokenKind::Comma) {
                self.match_token(&TokenKind::Semicolon);
            }
        }

        Ok(members)
    }

    /// Parameter list and body, shared by every function-creating form. The
    /// keyword/name has already been consumed.
    fn function_rest(&mut self, name: Option<String>, start: Span) -> CompileResult<FunctionDef> {
        self.consume(&TokenKind::LeftParen, "Expected '(' before parameters")?;
        let (params, is_vararg) = self.parameter_list()?;

        let body = if self.check(&TokenKind::LeftBrace) {
            self.block()?
        } else {
            // Single-statement body
            let stmt = self.statement()?;
            let span = stmt.span();
            Block::new(vec![stmt], span)
        };

        let span = start.merge(body.span);
        Ok(FunctionDef {
            name,
            params,
            is_vararg,
            body,
            span,
        })
    }

    fn parameter_list(&mut self) -> CompileResult<(Vec<Param>, bool)> {
        let mut params = Vec::new();
        let mut is_vararg = false;
        let mut seen_default = false;

        while !self.check(&TokenKind::RightParen) && !self.is_at_end() {
            if self.check(&TokenKind::DotDotDot) {
                let span = self.advance().span;
                if seen_default {
                    return Err(self.error_at(
                        "A vararg function cannot have default parameter values",
                        span,
                    ));
                }
                is_vararg = true;
                if !self.check(&TokenKind::RightParen) {
                    return Err(self.error("'...' must be the last parameter"));
                }
                break;
            }

            let name_token = self.consume_identifier("Expected parameter name")?;
            let name = name_token.lexeme.clone();
            let name_span = name_token.span;

            let default = if self.match_token(&TokenKind::Equal) {
                seen_default = true;
                Some(self.expression_in(ExprContext::NoAssign)?)
            } else {
                if seen_default {
                    return Err(self.error_at(
                        format!("Parameter '{}' without a default follows defaulted ones", name),
                        name_span,
                    ));
                }
                None
            };

            params.push(Param {
                name,
                default,
                span: name_span,
            });

            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }

        self.consume(&TokenKind::RightParen, "Expected ')' after parameters")?;
        Ok((params, is_vararg))
    }

    /// `@(a, b) expr` — sugar for a function whose body returns `expr`.
    fn lambda(&mut self) -> CompileResult<Expr> {
        let start = self.advance().span; // consume '@'
        self.consume(&TokenKind::LeftParen, "Expected '(' after '@'")?;
        let (params, is_vararg) = self.parameter_list()?;

        let body_expr = self.expression_in(ExprContext::NoAssign)?;
        let body_span = body_expr.span();
        let body = Block::new(
            vec![Stmt::Return {
                value: Some(body_expr),
                span: body_span,
            }],
            body_span,
        );

        let span = start.merge(body_span);
        let def = FunctionDef {
            name: None,
            params,
            is_vararg,
            body,
            span,
        };
        Ok(Expr::Function {
            def: Box::new(def),
            span,
        })
    }

    // ==================== Token helpers ====================

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn previous_or_start(&self) -> &Token {
        if self.current == 0 {
            &self.tokens[0]
        } else {
            &self.tokens[self.current - 1]
        }
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        if self.is_at_end() {
            return false;
        }
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn check_identifier(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Identifier(_))
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> CompileResult<&Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(message))
        }
    }

    fn consume_identifier(&mut self, message: &str) -> CompileResult<&Token> {
        if self.check_identifier() {
            Ok(self.advance())
        } else {
            Err(self.error(message))
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        self.error_at(message, self.peek().span)
    }

    fn error_at(&self, message: impl Into<String>, span: Span) -> CompileError {
        CompileError::syntax_error(message, span, &self.file).with_source(&self.source)
    }
}
