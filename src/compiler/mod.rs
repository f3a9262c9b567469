pub mod codegen;
pub mod funcstate;
pub mod opcode;
pub mod peephole;
pub mod proto;

pub use codegen::CodegenVisitor;
pub use funcstate::FuncState;
pub use opcode::{Instruction, Op, JUMP_PLACEHOLDER, NO_TARGET};
pub use proto::FunctionProto;
