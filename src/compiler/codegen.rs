// Tree-walking code generator. Walks the parsed program once, driving a stack
// of FuncStates (one per open function literal) and emitting instructions
// through the append-time peephole optimizer.
//
// Expression codegen keeps one invariant throughout: every expression leaves
// exactly one entry on the target stack, holding the slot of its result.

use std::rc::Rc;

use rustc_hash::FxHashSet;

use crate::ast::{
    AssignOp, BinaryOp, Block, ClassBody, DestructureBinding, DestructureKind, EnumMember, Expr,
    FunctionDef, IncDecOp, Literal, Member, MemberKey, Program, Stmt, SwitchCase, UnaryOp,
};
use crate::compiler::funcstate::{FuncState, MAX_STACK_SLOTS};
use crate::compiler::opcode::{BitwOp, CmpOp, NewObjKind, Op, JUMP_PLACEHOLDER, NO_TARGET};
use crate::compiler::proto::{FunctionProto, LiteralValue, OuterKind};
use crate::error::{CompileError, CompileResult, Span};
use crate::{ConstTable, ConstValue, FEATURE_EXPLICIT_THIS, FEATURE_NO_OPTIMIZER};

/// How an identifier resolves at the current emission point.
enum Binding {
    /// Named slot in the current function; bool is assignability.
    Local(u8, bool),
    /// Index into the current function's outer records.
    Outer(u8, bool),
    Const(ConstValue),
    /// Falls through to a slot of `this`.
    ThisField,
}

/// Bookkeeping for one open breakable construct (loop or switch).
struct BreakableMarks {
    breaks: usize,
    continues: usize,
    has_continue: bool,
}

struct ScopeSnapshot {
    stack_size: usize,
}

pub struct CodegenVisitor<'a> {
    /// Context-wide constants; `global const`/`global enum` write here.
    consts: &'a mut ConstTable,
    /// Per-compile constants supplied by the host.
    scoped: Option<&'a ConstTable>,
    /// Constants declared by this compilation unit.
    unit_consts: ConstTable,

    features: u32,
    emit_line_info: bool,
    optimize: bool,

    source_name: &'a str,
    source: &'a str,

    fs_stack: Vec<FuncState>,
}

impl<'a> CodegenVisitor<'a> {
    pub fn new(
        consts: &'a mut ConstTable,
        scoped: Option<&'a ConstTable>,
        features: u32,
        emit_line_info: bool,
        source_name: &'a str,
        source: &'a str,
    ) -> Self {
        Self {
            consts,
            scoped,
            unit_consts: ConstTable::new(),
            features,
            emit_line_info,
            optimize: features & FEATURE_NO_OPTIMIZER == 0,
            source_name,
            source,
            fs_stack: Vec::new(),
        }
    }

    /// Compile the whole unit into the root function prototype. The root
    /// behaves like a vararg function taking `this`.
    pub fn generate(mut self, program: &Program) -> CompileResult<FunctionProto> {
        let mut root = FuncState::new("main", self.source_name, self.optimize);
        root.add_parameter("this");
        root.add_parameter("vargv");
        root.is_vararg = true;
        self.fs_stack.push(root);

        for stmt in &program.block.statements {
            self.statement(stmt)?;
        }
        self.fs().emit(Op::Return, NO_TARGET, 0, 0, 0);

        let root = self.fs_stack.pop().unwrap();
        debug_assert!(root
            .instructions
            .iter()
            .all(|i| !(i.op.is_jump() && i.arg1 == JUMP_PLACEHOLDER)));
        Ok(root.build_proto())
    }

    fn fs(&mut self) -> &mut FuncState {
        self.fs_stack.last_mut().unwrap()
    }

    fn error(&self, message: impl Into<String>, span: Span) -> CompileError {
        CompileError::semantic_error(message, span, self.source_name).with_source(self.source)
    }

    // ==================== Statements ====================

    fn statement(&mut self, stmt: &Stmt) -> CompileResult<()> {
        let line = stmt.span().start.line as u32;
        let emit_op = self.emit_line_info;
        self.fs().add_line_info(line, emit_op);
        let depth = self.fs().target_depth();

        match stmt {
            Stmt::Empty { .. } => {}

            Stmt::Expression { expr, .. } => {
                self.expr(expr)?;
                self.fs().pop_target();
            }

            Stmt::Block { block } => {
                let snap = self.begin_scope();
                for stmt in &block.statements {
                    self.statement(stmt)?;
                }
                self.end_scope(snap);
            }

            Stmt::Local {
                decls, assignable, ..
            } => {
                for decl in decls {
                    match &decl.initializer {
                        Some(init) => {
                            self.expr(init)?;
                            let fs = self.fs();
                            let src = fs.pop_target();
                            let dest = fs.push_target();
                            if dest != src {
                                fs.emit(Op::Move, dest, src as i32, 0, 0);
                            }
                            fs.pop_target();
                            self.declare_local(&decl.name, *assignable, decl.span)?;
                        }
                        None => {
                            let pos = self.declare_local(&decl.name, *assignable, decl.span)?;
                            self.fs().emit(Op::LoadNulls, pos, 1, 0, 0);
                        }
                    }
                }
            }

            Stmt::Destructure {
                kind,
                bindings,
                source,
                assignable,
                ..
            } => self.destructure(*kind, bindings, source, *assignable)?,

            Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                self.expr(condition)?;
                let fs = self.fs();
                let cond = fs.pop_target();
                fs.emit(Op::Jz, cond, JUMP_PLACEHOLDER, 0, 0);
                let jz = fs.current_pos() as usize;

                let snap = self.begin_scope();
                self.statement(then_branch)?;
                self.end_scope(snap);

                match else_branch {
                    Some(else_branch) => {
                        let fs = self.fs();
                        fs.emit(Op::Jmp, 0, JUMP_PLACEHOLDER, 0, 0);
                        let jmp = fs.current_pos() as usize;
                        fs.set_jump_target(jz);
                        fs.snooze_opt();

                        let snap = self.begin_scope();
                        self.statement(else_branch)?;
                        self.end_scope(snap);

                        let fs = self.fs();
                        fs.set_jump_target(jmp);
                        fs.snooze_opt();
                    }
                    None => {
                        let fs = self.fs();
                        fs.set_jump_target(jz);
                        fs.snooze_opt();
                    }
                }
            }

            Stmt::While {
                condition, body, ..
            } => {
                let fs = self.fs();
                fs.snooze_opt();
                let cond_start = fs.instructions.len() as i32;
                let marks = self.open_breakable(true);

                self.expr(condition)?;
                let fs = self.fs();
                let cond = fs.pop_target();
                fs.emit(Op::Jz, cond, JUMP_PLACEHOLDER, 0, 0);
                let jz = fs.current_pos() as usize;

                let snap = self.begin_scope();
                self.statement(body)?;
                self.end_scope(snap);

                self.emit_loop_jump(cond_start);
                self.fs().set_jump_target(jz);
                self.close_breakable(marks, Some(cond_start));
            }

            Stmt::DoWhile {
                body, condition, ..
            } => {
                let fs = self.fs();
                fs.snooze_opt();
                let body_start = fs.instructions.len() as i32;
                let marks = self.open_breakable(true);

                let snap = self.begin_scope();
                self.statement(body)?;
                self.end_scope(snap);

                let fs = self.fs();
                fs.snooze_opt();
                let cond_start = fs.instructions.len() as i32;
                self.expr(condition)?;
                let fs = self.fs();
                let cond = fs.pop_target();
                // A false condition skips only the loop-back jump
                fs.emit(Op::Jz, cond, 1, 0, 0);
                self.emit_loop_jump(body_start);
                self.close_breakable(marks, Some(cond_start));
            }

            Stmt::For {
                init,
                condition,
                increment,
                body,
                ..
            } => {
                let snap = self.begin_scope();
                if let Some(init) = init {
                    self.statement(init)?;
                }

                let fs = self.fs();
                fs.snooze_opt();
                let cond_start = fs.instructions.len() as i32;
                let jz = match condition {
                    Some(condition) => {
                        self.expr(condition)?;
                        let fs = self.fs();
                        let cond = fs.pop_target();
                        fs.emit(Op::Jz, cond, JUMP_PLACEHOLDER, 0, 0);
                        Some(fs.current_pos() as usize)
                    }
                    None => None,
                };

                // The modifier clause is compiled in place, then relocated
                // past the body. Its jumps are relative, so they survive.
                let mod_from = self.fs().instructions.len();
                if let Some(increment) = increment {
                    self.expr(increment)?;
                    self.fs().pop_target();
                }
                let modifier = self.fs().snip_instructions(mod_from);
                // The modifier consumed the snooze armed for the loop head;
                // the body's first instruction becomes the landing target.
                if self.fs().instructions.len() as i32 == cond_start {
                    self.fs().snooze_opt();
                }

                let marks = self.open_breakable(true);
                let body_snap = self.begin_scope();
                self.statement(body)?;
                self.end_scope(body_snap);

                let fs = self.fs();
                let continue_target = fs.instructions.len() as i32;
                fs.append_raw(&modifier);
                self.emit_loop_jump(cond_start);
                if let Some(jz) = jz {
                    self.fs().set_jump_target(jz);
                }
                self.close_breakable(marks, Some(continue_target));
                self.end_scope(snap);
            }

            Stmt::Foreach {
                index,
                value,
                iterable,
                body,
                span,
            } => {
                let snap = self.begin_scope();
                self.expr(iterable)?;
                let container = self.fs().top_target();

                // Three consecutive loop slots: index, value, iterator state.
                // Hidden names cannot collide with user identifiers.
                let index_pos = match index {
                    Some(name) => self.declare_local(name, true, *span)?,
                    None => self.fs().push_local("@INDEX@", true),
                };
                self.fs().emit(Op::LoadNulls, index_pos, 1, 0, 0);
                let value_pos = self.declare_local(value, true, *span)?;
                self.fs().emit(Op::LoadNulls, value_pos, 1, 0, 0);
                let iterator_pos = self.fs().push_local("@ITERATOR@", true);
                self.fs().emit(Op::LoadNulls, iterator_pos, 1, 0, 0);

                let marks = self.open_breakable(true);
                let fs = self.fs();
                fs.emit(Op::Foreach, container, JUMP_PLACEHOLDER, index_pos, 0);
                let foreach_pos = fs.current_pos() as usize;
                fs.emit(Op::PostForeach, container, JUMP_PLACEHOLDER, index_pos, 0);

                let body_snap = self.begin_scope();
                self.statement(body)?;
                self.end_scope(body_snap);

                self.emit_loop_jump(foreach_pos as i32);
                let fs = self.fs();
                fs.set_jump_target(foreach_pos);
                fs.set_jump_target(foreach_pos + 1);
                self.close_breakable(marks, Some(foreach_pos as i32));
                self.fs().pop_target();
                self.end_scope(snap);
            }

            Stmt::Switch {
                subject,
                cases,
                default,
                ..
            } => self.switch_statement(subject, cases, default.as_deref())?,

            Stmt::Function { def, .. } => {
                // Declaration sugar: newslot on `this` under the function name
                let name = def.name.clone().unwrap_or_default();
                let fs = self.fs();
                fs.push_target_at(0);
                let lit = fs.get_literal(LiteralValue::String(name));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                self.function_expr(def)?;
                let fs = self.fs();
                let val = fs.pop_target();
                let key = fs.pop_target();
                let obj = fs.pop_target();
                fs.emit(Op::NewSlot, NO_TARGET, obj as i32, key, val);
            }

            Stmt::Class { name, body, .. } => {
                let fs = self.fs();
                fs.push_target_at(0);
                let lit = fs.get_literal(LiteralValue::String(name.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                self.class_expr(body)?;
                let fs = self.fs();
                let val = fs.pop_target();
                let key = fs.pop_target();
                let obj = fs.pop_target();
                fs.emit(Op::NewSlot, NO_TARGET, obj as i32, key, val);
            }

            Stmt::Return { value, .. } => self.return_like(value.as_ref(), Op::Return)?,

            Stmt::Yield { value, .. } => {
                self.fs().is_generator = true;
                self.return_like(value.as_ref(), Op::Yield)?;
            }

            Stmt::Break { span } => {
                if self.fs().break_targets.is_empty() {
                    return Err(self.error("'break' has to be in a loop block", *span));
                }
                let fs = self.fs();
                let traps = *fs.break_targets.last().unwrap();
                if traps > 0 {
                    fs.emit(Op::PopTrap, traps as u8, 0, 0, 0);
                }
                let base = *fs.block_stack_sizes.last().unwrap();
                if fs.has_captured_from(base) {
                    fs.emit(Op::Close, 0, base as i32, 0, 0);
                }
                fs.emit(Op::Jmp, 0, JUMP_PLACEHOLDER, 0, 0);
                let pos = fs.current_pos() as usize;
                fs.unresolved_breaks.push(pos);
            }

            Stmt::Continue { span } => {
                if self.fs().continue_targets.is_empty() {
                    return Err(self.error("'continue' has to be in a loop block", *span));
                }
                let fs = self.fs();
                let traps = *fs.continue_targets.last().unwrap();
                if traps > 0 {
                    fs.emit(Op::PopTrap, traps as u8, 0, 0, 0);
                }
                let base = *fs.block_stack_sizes.last().unwrap();
                if fs.has_captured_from(base) {
                    fs.emit(Op::Close, 0, base as i32, 0, 0);
                }
                fs.emit(Op::Jmp, 0, JUMP_PLACEHOLDER, 0, 0);
                let pos = fs.current_pos() as usize;
                fs.unresolved_continues.push(pos);
            }

            Stmt::TryCatch {
                try_body,
                catch_var,
                catch_body,
                span,
            } => {
                let fs = self.fs();
                fs.trap_depth += 1;
                if let Some(t) = fs.break_targets.last_mut() {
                    *t += 1;
                }
                if let Some(t) = fs.continue_targets.last_mut() {
                    *t += 1;
                }
                // The VM writes the thrown value at the trap's stack level,
                // which is exactly where the catch variable gets bound.
                let trap_slot = fs.stack_size() as u8;
                fs.emit(Op::PushTrap, trap_slot, JUMP_PLACEHOLDER, 0, 0);
                let trap_pos = fs.current_pos() as usize;

                let snap = self.begin_scope();
                self.statement(try_body)?;
                self.end_scope(snap);

                let fs = self.fs();
                fs.trap_depth -= 1;
                if let Some(t) = fs.break_targets.last_mut() {
                    *t = t.saturating_sub(1);
                }
                if let Some(t) = fs.continue_targets.last_mut() {
                    *t = t.saturating_sub(1);
                }
                fs.emit(Op::PopTrap, 1, 0, 0, 0);
                fs.emit(Op::Jmp, 0, JUMP_PLACEHOLDER, 0, 0);
                let jmp = fs.current_pos() as usize;
                fs.set_jump_target(trap_pos);
                fs.snooze_opt();

                let snap = self.begin_scope();
                let pos = self.declare_local(catch_var, true, *span)?;
                debug_assert_eq!(pos, trap_slot);
                self.statement(catch_body)?;
                self.end_scope(snap);

                let fs = self.fs();
                fs.set_jump_target(jmp);
                fs.snooze_opt();
            }

            Stmt::Throw { value, .. } => {
                self.expr(value)?;
                let fs = self.fs();
                let src = fs.pop_target();
                fs.emit(Op::Throw, src, 0, 0, 0);
            }

            Stmt::Const {
                name,
                value,
                global,
                span,
            } => {
                if self.lookup_const(name).is_some() {
                    return Err(self.error(format!("Constant '{}' already declared", name), *span));
                }
                let value = self.scalar_const(value, *span)?;
                if *global {
                    self.consts.set(name.clone(), value);
                } else {
                    self.unit_consts.set(name.clone(), value);
                }
            }

            Stmt::Enum {
                name,
                members,
                global,
                span,
            } => self.enum_statement(name, members, *global, *span)?,
        }

        debug_assert_eq!(self.fs().target_depth(), depth);
        Ok(())
    }

    fn destructure(
        &mut self,
        kind: DestructureKind,
        bindings: &[DestructureBinding],
        source: &Expr,
        assignable: bool,
    ) -> CompileResult<()> {
        let mut slots = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let pos = self.declare_local(&binding.name, assignable, binding.span)?;
            self.fs().emit(Op::LoadNulls, pos, 1, 0, 0);
            slots.push(pos);
        }

        self.expr(source)?;
        let container = self.fs().top_target();

        for (i, binding) in bindings.iter().enumerate() {
            let key = match kind {
                DestructureKind::Table => LiteralValue::String(binding.name.clone()),
                DestructureKind::Array => LiteralValue::Integer(i as i64),
            };
            let dst = slots[i];
            let fs = self.fs();
            let lit = fs.get_literal(key);
            fs.emit(Op::GetK, dst, lit, container, 0);
            if let Some(default) = &binding.default {
                // A non-null value skips the default expression
                fs.emit(Op::NullCoalesce, dst, JUMP_PLACEHOLDER, dst, 0);
                let jump = fs.current_pos() as usize;
                self.expr_into(default, dst)?;
                let fs = self.fs();
                fs.set_jump_target(jump);
                fs.snooze_opt();
            }
        }

        self.fs().pop_target();
        Ok(())
    }

    fn switch_statement(
        &mut self,
        subject: &Expr,
        cases: &[SwitchCase],
        default: Option<&[Stmt]>,
    ) -> CompileResult<()> {
        let snap = self.begin_scope();
        self.expr(subject)?;
        let subject_t = self.fs().top_target();
        let marks = self.open_breakable(false);

        let mut prev_test_jz: Option<usize> = None;
        let mut first = true;
        for case in cases {
            // A matched body falls through over the next test
            let mut skip_jmp = None;
            if !first {
                let fs = self.fs();
                fs.emit(Op::Jmp, 0, JUMP_PLACEHOLDER, 0, 0);
                skip_jmp = Some(fs.current_pos() as usize);
                if let Some(jz) = prev_test_jz.take() {
                    fs.set_jump_target(jz);
                    fs.snooze_opt();
                }
            }
            first = false;

            self.expr(&case.value)?;
            let fs = self.fs();
            let value = fs.pop_target();
            let local = fs.is_named_local(value);
            let eq_t = if local { fs.push_target() } else { value };
            fs.emit(Op::Eq, eq_t, value as i32, subject_t, 0);
            fs.emit(Op::Jz, eq_t, JUMP_PLACEHOLDER, 0, 0);
            if local {
                fs.pop_target();
            }
            prev_test_jz = Some(fs.current_pos() as usize);
            if let Some(skip) = skip_jmp {
                let fs = self.fs();
                fs.set_jump_target(skip);
                fs.snooze_opt();
            }

            for stmt in &case.body {
                self.statement(stmt)?;
            }
        }

        if let Some(jz) = prev_test_jz.take() {
            let fs = self.fs();
            fs.set_jump_target(jz);
            fs.snooze_opt();
        }
        if let Some(default) = default {
            for stmt in default {
                self.statement(stmt)?;
            }
        }

        self.close_breakable(marks, None);
        self.fs().pop_target();
        self.end_scope(snap);
        Ok(())
    }

    fn enum_statement(
        &mut self,
        name: &str,
        members: &[EnumMember],
        global: bool,
        span: Span,
    ) -> CompileResult<()> {
        if self.lookup_const(name).is_some() {
            return Err(self.error(format!("Constant '{}' already declared", name), span));
        }
        let mut table = ConstTable::new();
        let mut next = 0i64;
        for member in members {
            if table.contains(&member.name) {
                return Err(self.error(
                    format!("Duplicate enum member '{}'", member.name),
                    member.span,
                ));
            }
            let value = match &member.value {
                None => {
                    let v = ConstValue::Integer(next);
                    next += 1;
                    v
                }
                Some(Literal::Integer(n)) => {
                    next = n.wrapping_add(1);
                    ConstValue::Integer(*n)
                }
                Some(other) => self.scalar_const(other, member.span)?,
            };
            table.set(member.name.clone(), value);
        }
        let value = ConstValue::Table(Rc::new(table));
        if global {
            self.consts.set(name.to_string(), value);
        } else {
            self.unit_consts.set(name.to_string(), value);
        }
        Ok(())
    }

    fn return_like(&mut self, value: Option<&Expr>, op: Op) -> CompileResult<()> {
        match value {
            Some(value) => {
                self.expr(value)?;
                let fs = self.fs();
                if fs.trap_depth > 0 {
                    let traps = fs.trap_depth;
                    fs.emit(Op::PopTrap, traps as u8, 0, 0, 0);
                }
                let src = fs.pop_target();
                let size = fs.stack_size() as u8;
                fs.emit(op, 1, src as i32, size, 0);
            }
            None => {
                let fs = self.fs();
                if fs.trap_depth > 0 {
                    let traps = fs.trap_depth;
                    fs.emit(Op::PopTrap, traps as u8, 0, 0, 0);
                }
                let size = fs.stack_size() as u8;
                fs.emit(op, NO_TARGET, 0, size, 0);
            }
        }
        Ok(())
    }

    // ==================== Scopes and breakables ====================

    fn begin_scope(&mut self) -> ScopeSnapshot {
        ScopeSnapshot {
            stack_size: self.fs().stack_size(),
        }
    }

    fn end_scope(&mut self, snap: ScopeSnapshot) {
        let fs = self.fs();
        if fs.stack_size() != snap.stack_size {
            if fs.has_captured_from(snap.stack_size) {
                fs.emit(Op::Close, 0, snap.stack_size as i32, 0, 0);
            }
            fs.set_stack_size(snap.stack_size);
        }
    }

    fn open_breakable(&mut self, has_continue: bool) -> BreakableMarks {
        let fs = self.fs();
        fs.break_targets.push(0);
        if has_continue {
            fs.continue_targets.push(0);
        }
        let size = fs.stack_size();
        fs.block_stack_sizes.push(size);
        BreakableMarks {
            breaks: fs.unresolved_breaks.len(),
            continues: fs.unresolved_continues.len(),
            has_continue,
        }
    }

    /// Resolve pending break/continue jumps. Breaks land past the current
    /// end; continues land on `continue_target` when one is given.
    fn close_breakable(&mut self, marks: BreakableMarks, continue_target: Option<i32>) {
        let fs = self.fs();
        if marks.has_continue {
            let target = continue_target.unwrap_or(fs.instructions.len() as i32);
            while fs.unresolved_continues.len() > marks.continues {
                if let Some(pos) = fs.unresolved_continues.pop() {
                    fs.instructions[pos].arg1 = target - pos as i32 - 1;
                }
            }
            fs.continue_targets.pop();
        }
        while fs.unresolved_breaks.len() > marks.breaks {
            if let Some(pos) = fs.unresolved_breaks.pop() {
                fs.set_jump_target(pos);
            }
        }
        fs.break_targets.pop();
        fs.block_stack_sizes.pop();
        fs.snooze_opt();
    }

    /// Backward jump landing on the instruction at `target`.
    fn emit_loop_jump(&mut self, target: i32) {
        let fs = self.fs();
        let pos = fs.instructions.len() as i32;
        fs.emit(Op::Jmp, 0, target - pos - 1, 0, 0);
    }

    // ==================== Name resolution ====================

    fn declare_local(&mut self, name: &str, assignable: bool, span: Span) -> CompileResult<u8> {
        if self.fs().stack_size() >= MAX_STACK_SLOTS {
            return Err(self.error("Too many locals and temporaries in this function", span));
        }
        if self.fs().find_local(name).is_some() {
            return Err(self.error(format!("Local variable '{}' already declared", name), span));
        }
        if self.fs_stack.len() > 1 && self.fs().name == name {
            return Err(self.error(
                format!("'{}' conflicts with the enclosing function name", name),
                span,
            ));
        }
        if self.lookup_const(name).is_some() {
            return Err(self.error(format!("'{}' conflicts with a constant", name), span));
        }
        Ok(self.fs().push_local(name, assignable))
    }

    /// Constant lookup in precedence order: unit-local declarations, then the
    /// host's scoped bindings, then the context table.
    fn lookup_const(&self, name: &str) -> Option<ConstValue> {
        if let Some(value) = self.unit_consts.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.scoped.and_then(|t| t.get(name)) {
            return Some(value.clone());
        }
        self.consts.get(name).cloned()
    }

    /// A local or outer binding anywhere up the function stack hides a
    /// constant of the same name.
    fn shadows_const(&self, name: &str) -> bool {
        self.fs_stack
            .iter()
            .rev()
            .any(|fs| fs.find_local(name).is_some() || fs.find_outer(name).is_some())
    }

    fn resolve(&mut self, name: &str, span: Span) -> CompileResult<Binding> {
        if let Some(pos) = self.fs().find_local(name) {
            let assignable = self.fs().local(pos).assignable;
            return Ok(Binding::Local(pos, assignable));
        }
        let level = self.fs_stack.len() - 1;
        if let Some(idx) = self.resolve_outer_at(level, name) {
            let assignable = self.fs_stack[level].outer_vars[idx as usize].assignable;
            return Ok(Binding::Outer(idx, assignable));
        }
        if let Some(value) = self.lookup_const(name) {
            return Ok(Binding::Const(value));
        }
        if self.features & FEATURE_EXPLICIT_THIS != 0 {
            return Err(self
                .error(format!("Unknown variable '{}'", name), span)
                .with_help("Declare it as a local, or access it through 'this'"));
        }
        Ok(Binding::ThisField)
    }

    /// Resolve `name` as an outer variable of the function at `level`,
    /// threading capture records through every intervening function. Each
    /// function gets at most one record per name.
    fn resolve_outer_at(&mut self, level: usize, name: &str) -> Option<u8> {
        if let Some(existing) = self.fs_stack[level].find_outer(name) {
            return Some(existing);
        }
        if level == 0 {
            return None;
        }
        let parent = level - 1;
        if let Some(pos) = self.fs_stack[parent].find_local(name) {
            self.fs_stack[parent].mark_captured(pos);
            let assignable = self.fs_stack[parent].local(pos).assignable;
            return Some(self.fs_stack[level].add_outer(
                name,
                pos as u32,
                OuterKind::Local,
                assignable,
            ));
        }
        if let Some(parent_idx) = self.resolve_outer_at(parent, name) {
            let assignable = self.fs_stack[parent].outer_vars[parent_idx as usize].assignable;
            return Some(self.fs_stack[level].add_outer(
                name,
                parent_idx as u32,
                OuterKind::Outer,
                assignable,
            ));
        }
        None
    }

    /// Fold a chain of identifiers and field accesses to a constant if its
    /// head names an unshadowed constant. A missing member of a constant
    /// table is a hard error rather than a runtime lookup.
    fn const_receiver(&self, expr: &Expr) -> CompileResult<Option<ConstValue>> {
        match expr {
            Expr::Identifier { name, .. } => {
                if self.shadows_const(name) {
                    Ok(None)
                } else {
                    Ok(self.lookup_const(name))
                }
            }
            Expr::Grouping { expr, .. } => self.const_receiver(expr),
            Expr::Get {
                object,
                property,
                span,
            } => match self.const_receiver(object)? {
                Some(ConstValue::Table(table)) => match table.get(property) {
                    Some(value) => Ok(Some(value.clone())),
                    None => Err(self.error(
                        format!("Unknown member '{}' of constant table", property),
                        *span,
                    )),
                },
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    // ==================== Expressions ====================

    fn expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::Literal { value, .. } => self.emit_literal(value),

            Expr::Identifier { name, span } => match self.resolve(name, *span)? {
                Binding::Local(pos, _) => {
                    self.fs().push_target_at(pos);
                    Ok(())
                }
                Binding::Outer(idx, _) => {
                    let fs = self.fs();
                    let t = fs.push_target();
                    fs.emit(Op::GetOuter, t, idx as i32, 0, 0);
                    Ok(())
                }
                Binding::Const(value) => self.emit_const_value(&value, *span),
                Binding::ThisField => {
                    let fs = self.fs();
                    let lit = fs.get_literal(LiteralValue::String(name.clone()));
                    let t = fs.push_target();
                    fs.emit(Op::GetK, t, lit, 0, 0);
                    Ok(())
                }
            },

            Expr::This { .. } => {
                self.fs().push_target_at(0);
                Ok(())
            }

            Expr::Base { .. } => {
                let fs = self.fs();
                let t = fs.push_target();
                fs.emit(Op::GetBase, t, 0, 0, 0);
                Ok(())
            }

            Expr::Root { name, .. } => {
                let fs = self.fs();
                let t = fs.push_target();
                fs.emit(Op::LoadRoot, t, 0, 0, 0);
                let lit = fs.get_literal(LiteralValue::String(name.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                let key = fs.pop_target();
                let obj = fs.pop_target();
                let t = fs.push_target();
                fs.emit(Op::Get, t, obj as i32, key, 0);
                Ok(())
            }

            Expr::Binary {
                left, op, right, ..
            } => self.binary(left, *op, right),

            Expr::Unary { op, operand, .. } => {
                self.expr(operand)?;
                let fs = self.fs();
                let src = fs.pop_target();
                let t = fs.push_target();
                let op = match op {
                    UnaryOp::Negate => Op::Neg,
                    UnaryOp::Not => Op::Not,
                    UnaryOp::BitNot => Op::BitNot,
                    UnaryOp::Typeof => Op::TypeOf,
                    UnaryOp::Clone => Op::CloneObj,
                };
                fs.emit(op, t, src as i32, 0, 0);
                Ok(())
            }

            Expr::Grouping { expr, .. } => self.expr(expr),

            Expr::Assignment {
                target, op, value, span,
            } => self.assignment(target, *op, value, *span),

            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                self.expr(condition)?;
                let fs = self.fs();
                let cond = fs.pop_target();
                fs.emit(Op::Jz, cond, JUMP_PLACEHOLDER, 0, 0);
                let jz = fs.current_pos() as usize;
                let t = fs.push_target();

                self.expr_into(then_expr, t)?;
                let fs = self.fs();
                fs.emit(Op::Jmp, 0, JUMP_PLACEHOLDER, 0, 0);
                let jmp = fs.current_pos() as usize;
                fs.set_jump_target(jz);
                fs.snooze_opt();

                self.expr_into(else_expr, t)?;
                let fs = self.fs();
                fs.set_jump_target(jmp);
                fs.snooze_opt();
                Ok(())
            }

            Expr::Call { callee, args, .. } => self.call_expr(callee, args),

            Expr::Get {
                object, property, span,
            } => {
                if let Some(value) = self.const_receiver(expr)? {
                    return self.emit_const_value(&value, *span);
                }
                self.expr(object)?;
                let fs = self.fs();
                let lit = fs.get_literal(LiteralValue::String(property.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                let key = fs.pop_target();
                let obj = fs.pop_target();
                let t = fs.push_target();
                fs.emit(Op::Get, t, obj as i32, key, 0);
                Ok(())
            }

            Expr::Index { object, index, .. } => {
                self.expr(object)?;
                self.expr(index)?;
                let fs = self.fs();
                let key = fs.pop_target();
                let obj = fs.pop_target();
                let t = fs.push_target();
                fs.emit(Op::Get, t, obj as i32, key, 0);
                Ok(())
            }

            Expr::Array { elements, .. } => {
                let fs = self.fs();
                let t = fs.push_target();
                fs.emit(
                    Op::NewObj,
                    t,
                    elements.len() as i32,
                    NO_TARGET,
                    NewObjKind::Array as u8,
                );
                for element in elements {
                    self.expr(element)?;
                    let fs = self.fs();
                    let value = fs.pop_target();
                    let array = fs.top_target();
                    fs.emit(Op::AppendArray, array, value as i32, 0, 0);
                }
                Ok(())
            }

            Expr::Table { members, .. } => {
                let fs = self.fs();
                let t = fs.push_target();
                fs.emit(
                    Op::NewObj,
                    t,
                    members.len() as i32,
                    NO_TARGET,
                    NewObjKind::Table as u8,
                );
                self.emit_members(members, false)
            }

            Expr::Class { body, .. } => self.class_expr(body),

            Expr::Function { def, .. } => self.function_expr(def),

            Expr::PreIncDec { op, target, span } => self.inc_dec(target, *op, true, *span),
            Expr::PostIncDec { op, target, span } => self.inc_dec(target, *op, false, *span),

            Expr::Delete { target, span } => match &**target {
                Expr::Get {
                    object, property, ..
                } => {
                    self.expr(object)?;
                    let fs = self.fs();
                    let lit = fs.get_literal(LiteralValue::String(property.clone()));
                    let key = fs.push_target();
                    fs.emit(Op::Load, key, lit, 0, 0);
                    let key = fs.pop_target();
                    let obj = fs.pop_target();
                    let t = fs.push_target();
                    fs.emit(Op::DeleteSlot, t, obj as i32, key, 0);
                    Ok(())
                }
                Expr::Index { object, index, .. } => {
                    self.expr(object)?;
                    self.expr(index)?;
                    let fs = self.fs();
                    let key = fs.pop_target();
                    let obj = fs.pop_target();
                    let t = fs.push_target();
                    fs.emit(Op::DeleteSlot, t, obj as i32, key, 0);
                    Ok(())
                }
                _ => Err(self.error("'delete' needs a field or index expression", *span)),
            },

            Expr::Comma { left, right, .. } => {
                self.expr(left)?;
                self.fs().pop_target();
                self.expr(right)
            }
        }
    }

    /// Compile `expr` and make sure its value ends up in `dst`, which stays
    /// the caller's responsibility on the target stack.
    fn expr_into(&mut self, expr: &Expr, dst: u8) -> CompileResult<()> {
        self.expr(expr)?;
        let fs = self.fs();
        let src = fs.pop_target();
        if src != dst {
            fs.emit(Op::Move, dst, src as i32, 0, 0);
        }
        Ok(())
    }

    fn binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr) -> CompileResult<()> {
        if op.is_short_circuit() {
            let jump_op = match op {
                BinaryOp::And => Op::And,
                BinaryOp::Or => Op::Or,
                _ => Op::NullCoalesce,
            };
            self.expr(left)?;
            let fs = self.fs();
            let first = fs.pop_target();
            let t = fs.push_target();
            fs.emit(jump_op, t, JUMP_PLACEHOLDER, first, 0);
            let jump = fs.current_pos() as usize;
            self.expr_into(right, t)?;
            let fs = self.fs();
            fs.set_jump_target(jump);
            fs.snooze_opt();
            return Ok(());
        }

        self.expr(left)?;
        self.expr(right)?;
        let fs = self.fs();
        let rhs = fs.pop_target();
        let lhs = fs.pop_target();
        let t = fs.push_target();
        match op {
            BinaryOp::Add => fs.emit(Op::Add, t, rhs as i32, lhs, 0),
            BinaryOp::Sub => fs.emit(Op::Sub, t, rhs as i32, lhs, 0),
            BinaryOp::Mul => fs.emit(Op::Mul, t, rhs as i32, lhs, 0),
            BinaryOp::Div => fs.emit(Op::Div, t, rhs as i32, lhs, 0),
            BinaryOp::Mod => fs.emit(Op::Mod, t, rhs as i32, lhs, 0),
            BinaryOp::Equal => fs.emit(Op::Eq, t, rhs as i32, lhs, 0),
            BinaryOp::NotEqual => fs.emit(Op::Ne, t, rhs as i32, lhs, 0),
            BinaryOp::Less => fs.emit(Op::Cmp, t, rhs as i32, lhs, CmpOp::Less as u8),
            BinaryOp::LessEqual => fs.emit(Op::Cmp, t, rhs as i32, lhs, CmpOp::LessEq as u8),
            BinaryOp::Greater => fs.emit(Op::Cmp, t, rhs as i32, lhs, CmpOp::Greater as u8),
            BinaryOp::GreaterEqual => {
                fs.emit(Op::Cmp, t, rhs as i32, lhs, CmpOp::GreaterEq as u8)
            }
            BinaryOp::ThreeWay => fs.emit(Op::Cmp, t, rhs as i32, lhs, CmpOp::ThreeWay as u8),
            BinaryOp::In => fs.emit(Op::Exists, t, rhs as i32, lhs, 0),
            BinaryOp::Instanceof => fs.emit(Op::InstanceOf, t, lhs as i32, rhs, 0),
            BinaryOp::BitAnd => fs.emit(Op::Bitw, t, rhs as i32, lhs, BitwOp::And as u8),
            BinaryOp::BitOr => fs.emit(Op::Bitw, t, rhs as i32, lhs, BitwOp::Or as u8),
            BinaryOp::BitXor => fs.emit(Op::Bitw, t, rhs as i32, lhs, BitwOp::Xor as u8),
            BinaryOp::LeftShift => fs.emit(Op::Bitw, t, rhs as i32, lhs, BitwOp::Shl as u8),
            BinaryOp::RightShift => fs.emit(Op::Bitw, t, rhs as i32, lhs, BitwOp::Shr as u8),
            BinaryOp::And | BinaryOp::Or | BinaryOp::NullCoalesce => unreachable!(),
        }
        Ok(())
    }

    fn assignment(
        &mut self,
        target: &Expr,
        op: AssignOp,
        value: &Expr,
        span: Span,
    ) -> CompileResult<()> {
        match op {
            AssignOp::NewSlot => self.newslot_assign(target, value, span),
            AssignOp::Assign | AssignOp::InExpr => self.plain_assign(target, value, span),
            _ => self.compound_assign(target, op, value, span),
        }
    }

    fn plain_assign(&mut self, target: &Expr, value: &Expr, span: Span) -> CompileResult<()> {
        match target {
            Expr::Identifier { name, span } => match self.resolve(name, *span)? {
                Binding::Local(pos, assignable) => {
                    if !assignable {
                        return Err(self.error(
                            format!("Cannot assign to read-only binding '{}'", name),
                            *span,
                        ));
                    }
                    self.fs().push_target_at(pos);
                    self.expr(value)?;
                    let fs = self.fs();
                    let src = fs.pop_target();
                    let dst = fs.top_target();
                    if dst != src {
                        fs.emit(Op::Move, dst, src as i32, 0, 0);
                    }
                    Ok(())
                }
                Binding::Outer(idx, assignable) => {
                    if !assignable {
                        return Err(self.error(
                            format!("Cannot assign to read-only binding '{}'", name),
                            *span,
                        ));
                    }
                    self.expr(value)?;
                    let fs = self.fs();
                    let src = fs.pop_target();
                    let t = fs.push_target();
                    fs.emit(Op::SetOuter, t, idx as i32, src, 0);
                    Ok(())
                }
                Binding::Const(_) => {
                    Err(self.error(format!("Cannot assign to constant '{}'", name), *span))
                }
                Binding::ThisField => {
                    let fs = self.fs();
                    fs.push_target_at(0);
                    let lit = fs.get_literal(LiteralValue::String(name.clone()));
                    let key = fs.push_target();
                    fs.emit(Op::Load, key, lit, 0, 0);
                    self.expr(value)?;
                    let fs = self.fs();
                    let val = fs.pop_target();
                    let key = fs.pop_target();
                    let obj = fs.pop_target();
                    let t = fs.push_target();
                    fs.emit(Op::Set, t, obj as i32, key, val);
                    Ok(())
                }
            },

            Expr::Get {
                object, property, span,
            } => {
                if matches!(self.const_receiver(object)?, Some(ConstValue::Table(_))) {
                    return Err(
                        self.error(format!("Cannot assign to constant '{}'", property), *span)
                    );
                }
                self.expr(object)?;
                let fs = self.fs();
                let lit = fs.get_literal(LiteralValue::String(property.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                self.expr(value)?;
                self.emit_set()
            }

            Expr::Index { object, index, .. } => {
                self.expr(object)?;
                self.expr(index)?;
                self.expr(value)?;
                self.emit_set()
            }

            Expr::Root { name, .. } => {
                let fs = self.fs();
                let t = fs.push_target();
                fs.emit(Op::LoadRoot, t, 0, 0, 0);
                let lit = fs.get_literal(LiteralValue::String(name.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                self.expr(value)?;
                self.emit_set()
            }

            _ => Err(self.error("Cannot assign to this expression", span)),
        }
    }

    /// Pop value/key/object and emit `Set`, leaving the value as the result.
    fn emit_set(&mut self) -> CompileResult<()> {
        let fs = self.fs();
        let val = fs.pop_target();
        let key = fs.pop_target();
        let obj = fs.pop_target();
        let t = fs.push_target();
        fs.emit(Op::Set, t, obj as i32, key, val);
        Ok(())
    }

    fn newslot_assign(&mut self, target: &Expr, value: &Expr, span: Span) -> CompileResult<()> {
        match target {
            Expr::Get {
                object, property, ..
            } => {
                self.expr(object)?;
                let fs = self.fs();
                let lit = fs.get_literal(LiteralValue::String(property.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                self.expr(value)?;
            }
            Expr::Index { object, index, .. } => {
                self.expr(object)?;
                self.expr(index)?;
                self.expr(value)?;
            }
            Expr::Root { name, .. } => {
                let fs = self.fs();
                let t = fs.push_target();
                fs.emit(Op::LoadRoot, t, 0, 0, 0);
                let lit = fs.get_literal(LiteralValue::String(name.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                self.expr(value)?;
            }
            _ => return Err(self.error("'<-' needs a slot expression on its left side", span)),
        }
        let fs = self.fs();
        let val = fs.pop_target();
        let key = fs.pop_target();
        let obj = fs.pop_target();
        let t = fs.push_target();
        fs.emit(Op::NewSlot, t, obj as i32, key, val);
        Ok(())
    }

    fn compound_assign(
        &mut self,
        target: &Expr,
        op: AssignOp,
        value: &Expr,
        span: Span,
    ) -> CompileResult<()> {
        let arith = match op {
            AssignOp::AddAssign => Op::Add,
            AssignOp::SubAssign => Op::Sub,
            AssignOp::MulAssign => Op::Mul,
            AssignOp::DivAssign => Op::Div,
            AssignOp::ModAssign => Op::Mod,
            _ => unreachable!(),
        };

        match target {
            Expr::Identifier { name, span } => match self.resolve(name, *span)? {
                Binding::Local(pos, assignable) => {
                    if !assignable {
                        return Err(self.error(
                            format!("Cannot assign to read-only binding '{}'", name),
                            *span,
                        ));
                    }
                    self.expr(value)?;
                    let fs = self.fs();
                    let rhs = fs.pop_target();
                    fs.emit(arith, pos, rhs as i32, pos, 0);
                    fs.push_target_at(pos);
                    Ok(())
                }
                Binding::Outer(idx, assignable) => {
                    if !assignable {
                        return Err(self.error(
                            format!("Cannot assign to read-only binding '{}'", name),
                            *span,
                        ));
                    }
                    let fs = self.fs();
                    let tmp = fs.push_target();
                    fs.emit(Op::GetOuter, tmp, idx as i32, 0, 0);
                    self.expr(value)?;
                    let fs = self.fs();
                    let rhs = fs.pop_target();
                    fs.emit(arith, tmp, rhs as i32, tmp, 0);
                    fs.pop_target();
                    let t = fs.push_target();
                    fs.emit(Op::SetOuter, t, idx as i32, tmp, 0);
                    Ok(())
                }
                Binding::Const(_) => {
                    Err(self.error(format!("Cannot assign to constant '{}'", name), *span))
                }
                Binding::ThisField => {
                    let fs = self.fs();
                    fs.push_target_at(0);
                    let lit = fs.get_literal(LiteralValue::String(name.clone()));
                    let key = fs.push_target();
                    fs.emit(Op::Load, key, lit, 0, 0);
                    self.compound_slot(arith, value)
                }
            },

            Expr::Get {
                object, property, span,
            } => {
                if matches!(self.const_receiver(object)?, Some(ConstValue::Table(_))) {
                    return Err(
                        self.error(format!("Cannot assign to constant '{}'", property), *span)
                    );
                }
                self.expr(object)?;
                let fs = self.fs();
                let lit = fs.get_literal(LiteralValue::String(property.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                self.compound_slot(arith, value)
            }

            Expr::Index { object, index, .. } => {
                self.expr(object)?;
                self.expr(index)?;
                self.compound_slot(arith, value)
            }

            Expr::Root { name, .. } => {
                let fs = self.fs();
                let t = fs.push_target();
                fs.emit(Op::LoadRoot, t, 0, 0, 0);
                let lit = fs.get_literal(LiteralValue::String(name.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                self.compound_slot(arith, value)
            }

            _ => Err(self.error("Cannot assign to this expression", span)),
        }
    }

    /// Read-modify-write on a slot whose object and key are already on the
    /// target stack. The right-hand side is evaluated before the read, so the
    /// key load is never adjacent to the `Get`.
    fn compound_slot(&mut self, arith: Op, value: &Expr) -> CompileResult<()> {
        self.expr(value)?;
        let fs = self.fs();
        let current = fs.push_target();
        fs.pop_target();
        let val = fs.pop_target();
        let key = fs.pop_target();
        let obj = fs.pop_target();
        fs.emit(Op::Get, current, obj as i32, key, 0);
        fs.emit(arith, current, val as i32, current, 0);
        let t = fs.push_target();
        fs.emit(Op::Set, t, obj as i32, key, current);
        Ok(())
    }

    fn inc_dec(
        &mut self,
        target: &Expr,
        op: IncDecOp,
        prefix: bool,
        span: Span,
    ) -> CompileResult<()> {
        let diff: u8 = match op {
            IncDecOp::Increment => 1,
            IncDecOp::Decrement => 0xFF,
        };
        let (slot_op, local_op) = if prefix {
            (Op::Inc, Op::IncL)
        } else {
            (Op::PInc, Op::PIncL)
        };

        match target {
            Expr::Identifier { name, span } => match self.resolve(name, *span)? {
                Binding::Local(pos, assignable) => {
                    if !assignable {
                        return Err(self.error(
                            format!("Cannot modify read-only binding '{}'", name),
                            *span,
                        ));
                    }
                    let fs = self.fs();
                    let t = fs.push_target();
                    fs.emit(local_op, t, pos as i32, 0, diff);
                    Ok(())
                }
                Binding::Outer(idx, assignable) => {
                    if !assignable {
                        return Err(self.error(
                            format!("Cannot modify read-only binding '{}'", name),
                            *span,
                        ));
                    }
                    let fs = self.fs();
                    let tmp = fs.push_target();
                    fs.emit(Op::GetOuter, tmp, idx as i32, 0, 0);
                    let t = fs.push_target();
                    fs.emit(local_op, t, tmp as i32, 0, diff);
                    fs.emit(Op::SetOuter, NO_TARGET, idx as i32, tmp, 0);
                    fs.pop_target();
                    fs.pop_target();
                    let result = fs.push_target();
                    if result != t {
                        fs.emit(Op::Move, result, t as i32, 0, 0);
                    }
                    Ok(())
                }
                Binding::Const(_) => {
                    Err(self.error(format!("Cannot modify constant '{}'", name), *span))
                }
                Binding::ThisField => {
                    let fs = self.fs();
                    fs.push_target_at(0);
                    let lit = fs.get_literal(LiteralValue::String(name.clone()));
                    let key = fs.push_target();
                    fs.emit(Op::Load, key, lit, 0, 0);
                    let key = fs.pop_target();
                    let obj = fs.pop_target();
                    let t = fs.push_target();
                    fs.emit(slot_op, t, obj as i32, key, diff);
                    Ok(())
                }
            },

            Expr::Get {
                object, property, ..
            } => {
                self.expr(object)?;
                let fs = self.fs();
                let lit = fs.get_literal(LiteralValue::String(property.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                let key = fs.pop_target();
                let obj = fs.pop_target();
                let t = fs.push_target();
                fs.emit(slot_op, t, obj as i32, key, diff);
                Ok(())
            }

            Expr::Index { object, index, .. } => {
                self.expr(object)?;
                self.expr(index)?;
                let fs = self.fs();
                let key = fs.pop_target();
                let obj = fs.pop_target();
                let t = fs.push_target();
                fs.emit(slot_op, t, obj as i32, key, diff);
                Ok(())
            }

            Expr::Root { name, .. } => {
                let fs = self.fs();
                let t = fs.push_target();
                fs.emit(Op::LoadRoot, t, 0, 0, 0);
                let lit = fs.get_literal(LiteralValue::String(name.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                let key = fs.pop_target();
                let obj = fs.pop_target();
                let t = fs.push_target();
                fs.emit(slot_op, t, obj as i32, key, diff);
                Ok(())
            }

            _ => Err(self.error("Can only increment a variable or slot", span)),
        }
    }

    fn call_expr(&mut self, callee: &Expr, args: &[Expr]) -> CompileResult<()> {
        // Callees with a receiver go through PrepCall, which resolves the
        // closure and passes the receiver as `this` in one step.
        let method_call = match callee {
            Expr::Get {
                object, property, span,
            } => {
                if let Some(value) = self.const_receiver(callee)? {
                    self.emit_const_value(&value, *span)?;
                    false
                } else {
                    self.expr(object)?;
                    let fs = self.fs();
                    let lit = fs.get_literal(LiteralValue::String(property.clone()));
                    let key = fs.push_target();
                    fs.emit(Op::Load, key, lit, 0, 0);
                    true
                }
            }
            Expr::Index { object, index, .. } => {
                self.expr(object)?;
                self.expr(index)?;
                true
            }
            Expr::Root { name, .. } => {
                let fs = self.fs();
                let t = fs.push_target();
                fs.emit(Op::LoadRoot, t, 0, 0, 0);
                let lit = fs.get_literal(LiteralValue::String(name.clone()));
                let key = fs.push_target();
                fs.emit(Op::Load, key, lit, 0, 0);
                true
            }
            Expr::Identifier { name, span } => match self.resolve(name, *span)? {
                Binding::ThisField => {
                    // Bareword call on an implicit-this method
                    let fs = self.fs();
                    fs.push_target_at(0);
                    let lit = fs.get_literal(LiteralValue::String(name.clone()));
                    let key = fs.push_target();
                    fs.emit(Op::Load, key, lit, 0, 0);
                    true
                }
                Binding::Local(pos, _) => {
                    self.fs().push_target_at(pos);
                    false
                }
                Binding::Outer(idx, _) => {
                    let fs = self.fs();
                    let t = fs.push_target();
                    fs.emit(Op::GetOuter, t, idx as i32, 0, 0);
                    false
                }
                Binding::Const(value) => {
                    self.emit_const_value(&value, *span)?;
                    false
                }
            },
            other => {
                self.expr(other)?;
                false
            }
        };

        let this_t = if method_call {
            let fs = self.fs();
            let key = fs.pop_target();
            let obj = fs.pop_target();
            let closure_t = fs.push_target();
            let this_t = fs.push_target();
            fs.emit(Op::PrepCall, closure_t, key as i32, obj, this_t);
            this_t
        } else {
            let fs = self.fs();
            let this_t = fs.push_target();
            fs.emit(Op::Move, this_t, 0, 0, 0);
            this_t
        };

        for arg in args {
            self.expr(arg)?;
            self.move_if_local();
        }

        let fs = self.fs();
        let nargs = args.len() + 1;
        for _ in 0..args.len() {
            fs.pop_target();
        }
        fs.pop_target();
        let closure = fs.pop_target();
        let t = fs.push_target();
        fs.emit(Op::Call, t, closure as i32, this_t, nargs as u8);
        Ok(())
    }

    /// Call arguments must occupy consecutive temporaries. A result sitting
    /// in a named local is copied up into a fresh one.
    fn move_if_local(&mut self) {
        let fs = self.fs();
        let top = fs.top_target();
        if fs.is_named_local(top) {
            fs.pop_target();
            let t = fs.push_target();
            fs.emit(Op::Move, t, top as i32, 0, 0);
        }
    }

    fn class_expr(&mut self, body: &ClassBody) -> CompileResult<()> {
        let base = match &body.extends {
            Some(extends) => {
                self.expr(extends)?;
                self.fs().pop_target()
            }
            None => NO_TARGET,
        };
        let fs = self.fs();
        let t = fs.push_target();
        fs.emit(
            Op::NewObj,
            t,
            body.members.len() as i32,
            base,
            NewObjKind::Class as u8,
        );
        self.emit_members(&body.members, true)
    }

    /// Emit the member slots of a table or class literal; the object sits on
    /// top of the target stack and stays there.
    fn emit_members(&mut self, members: &[Member], is_class: bool) -> CompileResult<()> {
        for member in members {
            match &member.key {
                MemberKey::Named(name) | MemberKey::Json(name) => {
                    let fs = self.fs();
                    let lit = fs.get_literal(LiteralValue::String(name.clone()));
                    let key = fs.push_target();
                    fs.emit(Op::Load, key, lit, 0, 0);
                }
                MemberKey::Computed(expr) => self.expr(expr)?,
            }
            self.expr(&member.value)?;
            let fs = self.fs();
            let val = fs.pop_target();
            let key = fs.pop_target();
            let obj = fs.top_target();
            if is_class {
                let flags = if member.is_static { 1 } else { 0 };
                fs.emit(Op::NewSlotA, flags, obj as i32, key, val);
            } else {
                fs.emit(Op::NewSlot, NO_TARGET, obj as i32, key, val);
            }
        }
        Ok(())
    }

    fn function_expr(&mut self, def: &FunctionDef) -> CompileResult<()> {
        let name = def
            .name
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        let mut child = FuncState::new(name, self.source_name, self.optimize);
        child.add_parameter("this");

        let mut seen: FxHashSet<&str> = FxHashSet::default();
        seen.insert("this");
        for param in &def.params {
            if !seen.insert(param.name.as_str()) {
                return Err(self.error(
                    format!("Duplicate parameter '{}'", param.name),
                    param.span,
                ));
            }
            child.add_parameter(&param.name);
        }
        if def.is_vararg {
            if !seen.insert("vargv") {
                return Err(self.error("'vargv' conflicts with a parameter name", def.span));
            }
            child.add_parameter("vargv");
            child.is_vararg = true;
        }

        // Default expressions run in the enclosing frame; the child records
        // the enclosing stack positions holding the computed values.
        let mut ndefaults = 0;
        for param in &def.params {
            if let Some(default) = &param.default {
                self.expr(default)?;
                child.default_params.push(self.fs().top_target() as u32);
                ndefaults += 1;
            }
        }

        self.fs_stack.push(child);
        self.compile_body(&def.body)?;
        let child = self.fs_stack.pop().unwrap();
        debug_assert!(child
            .instructions
            .iter()
            .all(|i| !(i.op.is_jump() && i.arg1 == JUMP_PLACEHOLDER)));
        let proto = child.build_proto();

        let fs = self.fs();
        let idx = fs.functions.len() as i32;
        fs.functions.push(proto);
        for _ in 0..ndefaults {
            fs.pop_target();
        }
        let t = fs.push_target();
        fs.emit(Op::Closure, t, idx, 0, 0);
        Ok(())
    }

    fn compile_body(&mut self, body: &Block) -> CompileResult<()> {
        for stmt in &body.statements {
            self.statement(stmt)?;
        }
        self.fs().emit(Op::Return, NO_TARGET, 0, 0, 0);
        Ok(())
    }

    // ==================== Values ====================

    fn emit_literal(&mut self, value: &Literal) -> CompileResult<()> {
        let fs = self.fs();
        match value {
            Literal::Integer(n) => {
                let lit = fs.get_literal(LiteralValue::Integer(*n));
                let t = fs.push_target();
                fs.emit(Op::Load, t, lit, 0, 0);
            }
            Literal::Float(n) => {
                let lit = fs.get_literal(LiteralValue::Float(*n));
                let t = fs.push_target();
                fs.emit(Op::Load, t, lit, 0, 0);
            }
            Literal::String(s) => {
                let lit = fs.get_literal(LiteralValue::String(s.clone()));
                let t = fs.push_target();
                fs.emit(Op::Load, t, lit, 0, 0);
            }
            Literal::Boolean(b) => {
                let t = fs.push_target();
                fs.emit(Op::LoadBool, t, *b as i32, 0, 0);
            }
            Literal::Null => {
                let t = fs.push_target();
                fs.emit(Op::LoadNulls, t, 1, 0, 0);
            }
        }
        Ok(())
    }

    fn emit_const_value(&mut self, value: &ConstValue, span: Span) -> CompileResult<()> {
        match value {
            ConstValue::Integer(n) => self.emit_literal(&Literal::Integer(*n)),
            ConstValue::Float(n) => self.emit_literal(&Literal::Float(*n)),
            ConstValue::String(s) => self.emit_literal(&Literal::String(s.clone())),
            ConstValue::Boolean(b) => self.emit_literal(&Literal::Boolean(*b)),
            ConstValue::Table(_) => Err(self
                .error("A constant table cannot be used as a value", span)
                .with_help("Access one of its members instead")),
        }
    }

    fn scalar_const(&self, value: &Literal, span: Span) -> CompileResult<ConstValue> {
        match value {
            Literal::Integer(n) => Ok(ConstValue::Integer(*n)),
            Literal::Float(n) => Ok(ConstValue::Float(*n)),
            Literal::String(s) => Ok(ConstValue::String(s.clone())),
            Literal::Boolean(b) => Ok(ConstValue::Boolean(*b)),
            Literal::Null => Err(self.error("A constant must be a scalar literal", span)),
        }
    }
}
