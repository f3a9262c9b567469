// Per-function compilation state: local slots, the target stack, the literal
// pool, outer-variable records, line info, and the instruction vector with
// its append-time peephole optimizer.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::compiler::opcode::{Instruction, Op};
use crate::compiler::peephole::{self, Fused};
use crate::compiler::proto::{
    FunctionProto, LineInfo, LiteralValue, LocalVarInfo, OuterKind, OuterVarInfo,
};

/// Stack slots are encoded in a byte; the top value is reserved for
/// `NO_TARGET`.
pub const MAX_STACK_SLOTS: usize = 0xFE;

/// One entry of the live local-variable stack. An entry without a name is an
/// anonymous temporary created by `push_target`.
#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: Option<String>,
    pub assignable: bool,
    pub captured: bool,
    pub start_op: u32,
}

impl LocalVar {
    fn temp() -> Self {
        Self {
            name: None,
            assignable: true,
            captured: false,
            start_op: 0,
        }
    }
}

/// Compilation state of one function. The code generator keeps these on an
/// explicit stack, one per open function literal.
pub struct FuncState {
    pub name: String,
    pub source_name: String,

    pub instructions: Vec<Instruction>,
    literal_index: FxHashMap<LiteralValue, usize>,
    literals: Vec<LiteralValue>,

    vlocals: Vec<LocalVar>,
    local_var_infos: Vec<LocalVarInfo>,
    target_stack: SmallVec<[u8; 16]>,
    max_stack_size: usize,

    pub outer_vars: SmallVec<[OuterVarInfo; 4]>,

    pub parameters: Vec<String>,
    pub default_params: Vec<u32>,
    pub functions: Vec<FunctionProto>,

    line_infos: Vec<LineInfo>,
    last_line: u32,

    pub is_vararg: bool,
    pub is_generator: bool,

    /// Open `try` blocks at the current emission point.
    pub trap_depth: usize,
    /// Jump positions waiting for the enclosing breakable/loop to close.
    pub unresolved_breaks: Vec<usize>,
    pub unresolved_continues: Vec<usize>,
    /// One entry per open breakable construct: traps opened since its start.
    pub break_targets: Vec<usize>,
    pub continue_targets: Vec<usize>,
    /// Local-stack size at the entry of each open breakable construct.
    pub block_stack_sizes: Vec<usize>,

    optimize: bool,
    opt_snoozed: bool,
}

impl FuncState {
    pub fn new(name: impl Into<String>, source_name: impl Into<String>, optimize: bool) -> Self {
        Self {
            name: name.into(),
            source_name: source_name.into(),
            instructions: Vec::new(),
            literal_index: FxHashMap::default(),
            literals: Vec::new(),
            vlocals: Vec::new(),
            local_var_infos: Vec::new(),
            target_stack: SmallVec::new(),
            max_stack_size: 0,
            outer_vars: SmallVec::new(),
            parameters: Vec::new(),
            default_params: Vec::new(),
            functions: Vec::new(),
            line_infos: Vec::new(),
            last_line: 0,
            is_vararg: false,
            is_generator: false,
            trap_depth: 0,
            unresolved_breaks: Vec::new(),
            unresolved_continues: Vec::new(),
            break_targets: Vec::new(),
            continue_targets: Vec::new(),
            block_stack_sizes: Vec::new(),
            optimize,
            opt_snoozed: false,
        }
    }

    // ==================== Targets ====================

    /// Allocate a fresh anonymous slot and push it as the current target.
    pub fn push_target(&mut self) -> u8 {
        let pos = self.alloc_stack_pos();
        self.target_stack.push(pos);
        pos
    }

    /// Push an existing slot (a named local or parameter) as the target.
    pub fn push_target_at(&mut self, pos: u8) {
        self.target_stack.push(pos);
    }

    pub fn pop_target(&mut self) -> u8 {
        let pos = match self.target_stack.pop() {
            Some(pos) => pos,
            None => return 0,
        };
        let idx = pos as usize;
        if idx + 1 == self.vlocals.len() && self.vlocals[idx].name.is_none() {
            self.vlocals.pop();
        }
        pos
    }

    pub fn top_target(&self) -> u8 {
        *self.target_stack.last().unwrap_or(&0)
    }

    pub fn target_depth(&self) -> usize {
        self.target_stack.len()
    }

    fn alloc_stack_pos(&mut self) -> u8 {
        let pos = self.vlocals.len();
        self.vlocals.push(LocalVar::temp());
        if self.vlocals.len() > self.max_stack_size {
            self.max_stack_size = self.vlocals.len();
        }
        pos as u8
    }

    // ==================== Locals ====================

    pub fn stack_size(&self) -> usize {
        self.vlocals.len()
    }

    pub fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    /// Bind a name to a fresh slot. The caller checks duplicates first.
    pub fn push_local(&mut self, name: impl Into<String>, assignable: bool) -> u8 {
        let pos = self.vlocals.len();
        self.vlocals.push(LocalVar {
            name: Some(name.into()),
            assignable,
            captured: false,
            start_op: self.instructions.len() as u32,
        });
        if self.vlocals.len() > self.max_stack_size {
            self.max_stack_size = self.vlocals.len();
        }
        pos as u8
    }

    pub fn add_parameter(&mut self, name: impl Into<String>) -> u8 {
        let name = name.into();
        self.parameters.push(name.clone());
        self.push_local(name, true)
    }

    /// Most recent visible local with this name; shadowing picks the newest.
    pub fn find_local(&self, name: &str) -> Option<u8> {
        for (idx, local) in self.vlocals.iter().enumerate().rev() {
            if local.name.as_deref() == Some(name) {
                return Some(idx as u8);
            }
        }
        None
    }

    pub fn local(&self, pos: u8) -> &LocalVar {
        &self.vlocals[pos as usize]
    }

    pub fn mark_captured(&mut self, pos: u8) {
        self.vlocals[pos as usize].captured = true;
    }

    /// True if a slot holds a named local (as opposed to a temporary).
    pub fn is_named_local(&self, pos: u8) -> bool {
        self.vlocals
            .get(pos as usize)
            .map(|l| l.name.is_some())
            .unwrap_or(false)
    }

    /// Any captured local at slot `level` or above?
    pub fn has_captured_from(&self, level: usize) -> bool {
        self.vlocals[level.min(self.vlocals.len())..]
            .iter()
            .any(|l| l.captured)
    }

    /// Restore the local stack to a scope-entry snapshot, recording debug
    /// ranges of the discarded named locals.
    pub fn set_stack_size(&mut self, size: usize) {
        let end_op = self.instructions.len() as u32;
        while self.vlocals.len() > size {
            if let Some(local) = self.vlocals.pop() {
                if let Some(name) = local.name {
                    self.local_var_infos.push(LocalVarInfo {
                        name,
                        pos: self.vlocals.len() as u32,
                        start_op: local.start_op,
                        end_op,
                    });
                }
            }
        }
    }

    // ==================== Outer variables ====================

    pub fn find_outer(&self, name: &str) -> Option<u8> {
        self.outer_vars
            .iter()
            .position(|o| o.name == name)
            .map(|idx| idx as u8)
    }

    /// Append an outer record unless one with this name exists already;
    /// indices are stable once handed out.
    pub fn add_outer(
        &mut self,
        name: impl Into<String>,
        index: u32,
        kind: OuterKind,
        assignable: bool,
    ) -> u8 {
        let name = name.into();
        if let Some(existing) = self.find_outer(&name) {
            return existing;
        }
        self.outer_vars.push(OuterVarInfo {
            name,
            index,
            kind,
            assignable,
        });
        (self.outer_vars.len() - 1) as u8
    }

    // ==================== Literal pool ====================

    /// Pool index for a literal, interning on first sight.
    pub fn get_literal(&mut self, value: LiteralValue) -> i32 {
        if let Some(&idx) = self.literal_index.get(&value) {
            return idx as i32;
        }
        let idx = self.literals.len();
        self.literals.push(value.clone());
        self.literal_index.insert(value, idx);
        idx as i32
    }

    pub fn literal_count(&self) -> usize {
        self.literals.len()
    }

    // ==================== Instructions ====================

    /// Index of the most recently emitted instruction.
    pub fn current_pos(&self) -> i32 {
        self.instructions.len() as i32 - 1
    }

    pub fn emit(&mut self, op: Op, arg0: u8, arg1: i32, arg2: u8, arg3: u8) {
        self.add_instruction(Instruction::new(op, arg0, arg1, arg2, arg3));
    }

    /// Disable fusion for the next appended instruction. Called whenever a
    /// jump can land on the next instruction, which must therefore stay
    /// addressable.
    pub fn snooze_opt(&mut self) {
        self.opt_snoozed = true;
    }

    pub fn add_instruction(&mut self, inst: Instruction) {
        if !self.optimize || self.opt_snoozed || self.instructions.is_empty() {
            self.opt_snoozed = false;
            self.instructions.push(inst);
            return;
        }

        let vlocals = &self.vlocals;
        let prev = match self.instructions.last_mut() {
            Some(prev) => prev,
            None => {
                self.instructions.push(inst);
                return;
            }
        };
        let is_named = |pos: u8| {
            vlocals
                .get(pos as usize)
                .map(|l| l.name.is_some())
                .unwrap_or(false)
        };

        match peephole::fuse(prev, inst, &is_named, self.trap_depth) {
            Fused::Append(new) => self.instructions.push(new),
            Fused::Absorbed => {}
            Fused::ReplacePrev(new) => {
                self.instructions.pop();
                self.instructions.push(new);
            }
            Fused::MutatedPrev(new) => self.instructions.push(new),
        }
    }

    /// Patch a forward jump at `jump_pos` to land just past the current end.
    pub fn set_jump_target(&mut self, jump_pos: usize) {
        let offset = self.current_pos() - jump_pos as i32;
        self.instructions[jump_pos].arg1 = offset;
    }

    /// Remove and return the instructions from `from` to the end, keeping
    /// their relative order. Used to relocate `for` modifier clauses.
    pub fn snip_instructions(&mut self, from: usize) -> Vec<Instruction> {
        self.instructions.split_off(from)
    }

    /// Re-append relocated instructions verbatim, bypassing the optimizer.
    pub fn append_raw(&mut self, instructions: &[Instruction]) {
        self.instructions.extend_from_slice(instructions);
    }

    // ==================== Line info ====================

    /// Record the line for the next instruction; optionally emits a `Line`
    /// marker op. Consecutive markers for the same line are collapsed.
    pub fn add_line_info(&mut self, line: u32, emit_op: bool) {
        if line == self.last_line {
            return;
        }
        self.last_line = line;
        if emit_op {
            self.emit(Op::Line, 0, line as i32, 0, 0);
        }
        self.line_infos.push(LineInfo {
            line,
            op: self.instructions.len() as u32,
        });
    }

    // ==================== Finishing ====================

    /// Seal the function: close out debug ranges and copy everything into an
    /// immutable prototype. The trailing return has already been emitted.
    pub fn build_proto(mut self) -> FunctionProto {
        self.set_stack_size(0);
        FunctionProto {
            instructions: self.instructions,
            literals: self.literals,
            parameters: self.parameters,
            default_params: self.default_params,
            outer_vars: self.outer_vars.into_vec(),
            functions: self.functions,
            local_var_infos: self.local_var_infos,
            line_infos: self.line_infos,
            is_vararg: self.is_vararg,
            is_generator: self.is_generator,
            stack_size: self.max_stack_size as u32,
            source_name: self.source_name,
            name: self.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> FuncState {
        FuncState::new("test", "test.hzl", true)
    }

    #[test]
    fn targets_are_lifo_and_temps_are_freed() {
        let mut fs = state();
        let a = fs.push_target();
        let b = fs.push_target();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(fs.top_target(), b);
        assert_eq!(fs.pop_target(), b);
        assert_eq!(fs.pop_target(), a);
        assert_eq!(fs.stack_size(), 0);
        // Freed temps are reusable
        assert_eq!(fs.push_target(), 0);
    }

    #[test]
    fn named_local_targets_are_not_freed_on_pop() {
        let mut fs = state();
        let slot = fs.push_local("x", true);
        fs.push_target_at(slot);
        fs.pop_target();
        assert_eq!(fs.stack_size(), 1);
        assert!(fs.is_named_local(slot));
    }

    #[test]
    fn literal_pool_dedups_but_keeps_int_and_float_apart() {
        let mut fs = state();
        let a = fs.get_literal(LiteralValue::Integer(1));
        let b = fs.get_literal(LiteralValue::Integer(1));
        let c = fs.get_literal(LiteralValue::Float(1.0));
        let d = fs.get_literal(LiteralValue::Float(1.0));
        assert_eq!(a, b);
        assert_eq!(c, d);
        assert_ne!(a, c);
        assert_eq!(fs.literal_count(), 2);
    }

    #[test]
    fn scope_restore_records_debug_ranges() {
        let mut fs = state();
        let before = fs.stack_size();
        fs.push_local("x", true);
        fs.emit(Op::LoadInt, 0, 42, 0, 0);
        fs.set_stack_size(before);
        assert_eq!(fs.stack_size(), before);
        let proto = fs.build_proto();
        assert_eq!(proto.local_var_infos.len(), 1);
        assert_eq!(proto.local_var_infos[0].name, "x");
    }

    #[test]
    fn shadowing_resolves_to_newest_binding() {
        let mut fs = state();
        fs.push_local("x", true);
        let inner = fs.push_local("x", false);
        assert_eq!(fs.find_local("x"), Some(inner));
    }

    #[test]
    fn outer_records_dedup_by_name() {
        let mut fs = state();
        let first = fs.add_outer("x", 3, OuterKind::Local, true);
        let second = fs.add_outer("x", 3, OuterKind::Local, true);
        assert_eq!(first, second);
        assert_eq!(fs.outer_vars.len(), 1);
    }

    #[test]
    fn line_markers_dedup_consecutive_lines() {
        let mut fs = state();
        fs.add_line_info(1, true);
        fs.add_line_info(1, true);
        fs.add_line_info(2, true);
        let lines: Vec<_> = fs
            .instructions
            .iter()
            .filter(|i| i.op == Op::Line)
            .map(|i| i.arg1)
            .collect();
        assert_eq!(lines, vec![1, 2]);
    }
}
