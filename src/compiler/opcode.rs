// Hazel instruction encoding
// Fixed four-field instructions: arg0 is almost always the result slot,
// arg1 is the wide operand (literal index, jump offset, immediate), arg2/arg3
// carry secondary slots and sub-operation tags.

use std::fmt;

/// Result-slot value meaning "no result wanted".
pub const NO_TARGET: u8 = 0xFF;

/// Offset written into a jump before its destination is known. Backpatching
/// must replace every one of these before the prototype is built.
pub const JUMP_PLACEHOLDER: i32 = -1234;

/// Comparison sub-operation carried in `arg3` of `Cmp`/`JCmp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmpOp {
    Greater = 0,
    GreaterEq = 1,
    Less = 2,
    LessEq = 3,
    ThreeWay = 4,
}

/// Bitwise sub-operation carried in `arg3` of `Bitw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitwOp {
    And = 0,
    Or = 1,
    Xor = 2,
    Shl = 3,
    Shr = 4,
}

/// Object kind created by `NewObj`, carried in `arg3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NewObjKind {
    Table = 0,
    Array = 1,
    Class = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// target = literals[arg1]
    Load,
    /// target = arg1 as integer immediate
    LoadInt,
    /// target = arg1 reinterpreted as f32 immediate
    LoadFloat,
    /// target = arg1 != 0
    LoadBool,
    /// slots [arg0, arg0+arg1) = null
    LoadNulls,
    /// target = the root table
    LoadRoot,
    /// target = base of the class enclosing `this`
    GetBase,
    /// Fused pair of `Load`: target/arg1 and arg2/arg3(literal)
    DLoad,

    /// target = stack[arg1]
    Move,
    /// Fused pair of `Move`: arg0<-arg1 and arg2<-arg3
    DMove,

    /// target = stack[arg2] op stack[arg1]; op selected by the variant
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// target = stack[arg2] <bitw arg3> stack[arg1]
    Bitw,
    /// target = compare(stack[arg2], stack[arg1]) per CmpOp in arg3
    Cmp,
    /// target = stack[arg2] == stack[arg1]
    Eq,
    /// target = stack[arg2] != stack[arg1]
    Ne,

    /// target = -stack[arg1]
    Neg,
    /// target = !stack[arg1]
    Not,
    /// target = ~stack[arg1]
    BitNot,
    /// target = typeof stack[arg1]
    TypeOf,
    /// target = clone stack[arg1]
    CloneObj,

    /// pc += arg1
    Jmp,
    /// if !stack[arg0] then pc += arg1
    Jz,
    /// Fused compare+branch: if !(stack[arg2] cmp stack[arg0]) then pc += arg1
    JCmp,
    /// if !stack[arg2] { target = stack[arg2]; pc += arg1 }
    And,
    /// if stack[arg2] { target = stack[arg2]; pc += arg1 }
    Or,
    /// if stack[arg2] != null { target = stack[arg2]; pc += arg1 }
    NullCoalesce,

    /// target = stack[arg1][stack[arg2]]
    Get,
    /// target = stack[arg2][literals[arg1]]
    GetK,
    /// stack[arg1][stack[arg2]] = stack[arg3]; target receives the value
    Set,
    /// stack[arg1][stack[arg2]] <- stack[arg3] (new slot)
    NewSlot,
    /// Class-member slot: arg0 = flags (bit 0 static), arg1 obj, arg2 key, arg3 val
    NewSlotA,
    /// target = delete stack[arg1][stack[arg2]]
    DeleteSlot,
    /// target = stack[arg2] in stack[arg1]
    Exists,
    /// target = stack[arg1] instanceof stack[arg2]
    InstanceOf,

    /// target = outers[arg1]
    GetOuter,
    /// outers[arg1] = stack[arg2]; target receives the value
    SetOuter,

    /// target = closure over protos[arg1]
    Closure,

    /// target = new object per NewObjKind in arg3; arg1 capacity hint,
    /// arg2 base-class slot (NO_TARGET for none)
    NewObj,
    /// append stack[arg1] to array at stack[arg0]
    AppendArray,

    /// Method-call setup: arg0 = closure dest, arg1 = key slot, arg2 = obj
    /// slot, arg3 = `this` dest
    PrepCall,
    /// PrepCall with literal key: arg1 = literal index
    PrepCallK,
    /// target = call stack[arg1] with arg3 args starting at stack[arg2]
    Call,
    /// Call in tail position reusing the current frame
    TailCall,

    /// Inc/dec a slot: target = new value of stack[arg1][stack[arg2]], arg3 = diff
    Inc,
    /// Inc/dec a local: target = new value of stack[arg1], arg3 = diff
    IncL,
    /// Postfix variants: target gets the old value
    PInc,
    PIncL,

    /// Return stack[arg1] if arg0 != NO_TARGET, else return null
    Return,
    /// Suspend the generator yielding stack[arg1] (arg0 as in Return)
    Yield,
    /// Close captured locals at stack levels >= arg1
    Close,

    /// Begin iteration of stack[arg0]; the index, value and iterator slots
    /// start at stack[arg2], exit jump arg1
    Foreach,
    /// Advance iteration of stack[arg0]; exit jump arg1, slots as in Foreach
    PostForeach,

    /// Install a trap: catch var slot arg0, handler at pc + arg1
    PushTrap,
    /// Remove arg0 innermost traps
    PopTrap,
    /// Raise stack[arg0]
    Throw,

    /// Debug line marker, line number in arg1
    Line,
}

impl Op {
    /// All variants in discriminant order, for byte round-trips.
    const ALL: &'static [Op] = &[
        Op::Load,
        Op::LoadInt,
        Op::LoadFloat,
        Op::LoadBool,
        Op::LoadNulls,
        Op::LoadRoot,
        Op::GetBase,
        Op::DLoad,
        Op::Move,
        Op::DMove,
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::Bitw,
        Op::Cmp,
        Op::Eq,
        Op::Ne,
        Op::Neg,
        Op::Not,
        Op::BitNot,
        Op::TypeOf,
        Op::CloneObj,
        Op::Jmp,
        Op::Jz,
        Op::JCmp,
        Op::And,
        Op::Or,
        Op::NullCoalesce,
        Op::Get,
        Op::GetK,
        Op::Set,
        Op::NewSlot,
        Op::NewSlotA,
        Op::DeleteSlot,
        Op::Exists,
        Op::InstanceOf,
        Op::GetOuter,
        Op::SetOuter,
        Op::Closure,
        Op::NewObj,
        Op::AppendArray,
        Op::PrepCall,
        Op::PrepCallK,
        Op::Call,
        Op::TailCall,
        Op::Inc,
        Op::IncL,
        Op::PInc,
        Op::PIncL,
        Op::Return,
        Op::Yield,
        Op::Close,
        Op::Foreach,
        Op::PostForeach,
        Op::PushTrap,
        Op::PopTrap,
        Op::Throw,
        Op::Line,
    ];

    pub fn from_u8(byte: u8) -> Option<Op> {
        Op::ALL.get(byte as usize).copied()
    }

    /// Ops whose `arg1` is a relative jump offset.
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Op::Jmp
                | Op::Jz
                | Op::JCmp
                | Op::And
                | Op::Or
                | Op::NullCoalesce
                | Op::Foreach
                | Op::PostForeach
                | Op::PushTrap
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub arg0: u8,
    pub arg1: i32,
    pub arg2: u8,
    pub arg3: u8,
}

impl Instruction {
    pub fn new(op: Op, arg0: u8, arg1: i32, arg2: u8, arg3: u8) -> Self {
        Self {
            op,
            arg0,
            arg1,
            arg2,
            arg3,
        }
    }

    /// Common shape: result slot + wide operand.
    pub fn ab(op: Op, arg0: u8, arg1: i32) -> Self {
        Self::new(op, arg0, arg1, 0, 0)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12} {:>3} {:>8} {:>3} {:>3}",
            format!("{:?}", self.op),
            self.arg0,
            self.arg1,
            self.arg2,
            self.arg3
        )
    }
}
