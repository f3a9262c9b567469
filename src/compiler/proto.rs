// Function prototypes: the immutable output of compiling one function, plus
// the `.hzc` binary form used to ship precompiled scripts.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::compiler::opcode::{Instruction, Op};

/// A pooled runtime constant. Integer and float literals hash and compare as
/// distinct values even when numerically equal, so `1` and `1.0` get separate
/// pool entries.
#[derive(Debug, Clone)]
pub enum LiteralValue {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
}

impl PartialEq for LiteralValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LiteralValue::Null, LiteralValue::Null) => true,
            (LiteralValue::Integer(a), LiteralValue::Integer(b)) => a == b,
            (LiteralValue::Float(a), LiteralValue::Float(b)) => a.to_bits() == b.to_bits(),
            (LiteralValue::Boolean(a), LiteralValue::Boolean(b)) => a == b,
            (LiteralValue::String(a), LiteralValue::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for LiteralValue {}

impl Hash for LiteralValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            LiteralValue::Null => 0u8.hash(state),
            LiteralValue::Integer(n) => {
                1u8.hash(state);
                n.hash(state);
            }
            LiteralValue::Float(n) => {
                2u8.hash(state);
                n.to_bits().hash(state);
            }
            LiteralValue::Boolean(b) => {
                3u8.hash(state);
                b.hash(state);
            }
            LiteralValue::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Null => write!(f, "null"),
            LiteralValue::Integer(n) => write!(f, "{}", n),
            LiteralValue::Float(n) => write!(f, "{:?}", n),
            LiteralValue::Boolean(b) => write!(f, "{}", b),
            LiteralValue::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// Which slot of the enclosing function an outer variable refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterKind {
    /// A local slot of the immediate parent.
    Local,
    /// An entry in the immediate parent's own outer list.
    Outer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuterVarInfo {
    pub name: String,
    pub index: u32,
    pub kind: OuterKind,
    pub assignable: bool,
}

/// Debug record of one named local and its live instruction range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVarInfo {
    pub name: String,
    pub pos: u32,
    pub start_op: u32,
    pub end_op: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInfo {
    pub line: u32,
    pub op: u32,
}

/// Finished compilation result for one function (root chunk, nested function
/// or lambda). Everything here is immutable once built.
#[derive(Debug, Clone)]
pub struct FunctionProto {
    pub instructions: Vec<Instruction>,
    pub literals: Vec<LiteralValue>,
    pub parameters: Vec<String>,
    /// Stack positions in the *enclosing* frame holding default parameter
    /// values at closure-creation time.
    pub default_params: Vec<u32>,
    pub outer_vars: Vec<OuterVarInfo>,
    pub functions: Vec<FunctionProto>,
    pub local_var_infos: Vec<LocalVarInfo>,
    pub line_infos: Vec<LineInfo>,
    pub is_vararg: bool,
    pub is_generator: bool,
    pub stack_size: u32,
    pub source_name: String,
    pub name: String,
}

impl FunctionProto {
    /// Source line for an instruction index, from the line-info table.
    pub fn line_for_op(&self, op: usize) -> Option<u32> {
        let mut line = None;
        for info in &self.line_infos {
            if info.op as usize > op {
                break;
            }
            line = Some(info.line);
        }
        line
    }

    /// Human-readable instruction listing, used by tests and tooling.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("== {} ({}) ==\n", self.name, self.source_name));
        for (idx, inst) in self.instructions.iter().enumerate() {
            out.push_str(&format!("{:04} {}", idx, inst));
            if inst.op == Op::Load || inst.op == Op::GetK || inst.op == Op::PrepCallK {
                if let Some(lit) = self.literals.get(inst.arg1 as usize) {
                    out.push_str(&format!("  ; {}", lit));
                }
            }
            out.push('\n');
        }
        for (idx, func) in self.functions.iter().enumerate() {
            out.push_str(&format!("-- nested #{} --\n", idx));
            out.push_str(&func.disassemble());
        }
        out
    }
}

// ==================== Binary form ====================

const MAGIC: &[u8; 4] = b"HZPR";
const VERSION: u8 = 1;

/// Serialize a prototype tree to the `.hzc` byte format.
pub fn serialize(proto: &FunctionProto) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    write_proto(&mut out, proto);
    out
}

/// Parse a `.hzc` byte buffer back into a prototype tree.
pub fn deserialize(data: &[u8]) -> Result<FunctionProto, String> {
    if data.len() < 5 {
        return Err("Invalid file: too short".to_string());
    }
    if &data[0..4] != MAGIC {
        return Err("Invalid file: not a .hzc file".to_string());
    }
    let version = data[4];
    if version != VERSION {
        return Err(format!("Unsupported version: {}", version));
    }
    let mut cursor = 5;
    read_proto(data, &mut cursor)
}

fn write_proto(out: &mut Vec<u8>, proto: &FunctionProto) {
    write_string(out, &proto.source_name);
    write_string(out, &proto.name);
    out.push(proto.is_vararg as u8);
    out.push(proto.is_generator as u8);
    write_u32(out, proto.stack_size);

    write_u32(out, proto.instructions.len() as u32);
    for inst in &proto.instructions {
        out.push(inst.op as u8);
        out.push(inst.arg0);
        out.extend_from_slice(&inst.arg1.to_le_bytes());
        out.push(inst.arg2);
        out.push(inst.arg3);
    }

    write_u32(out, proto.literals.len() as u32);
    for lit in &proto.literals {
        match lit {
            LiteralValue::Null => out.push(0),
            LiteralValue::Integer(n) => {
                out.push(1);
                out.extend_from_slice(&n.to_le_bytes());
            }
            LiteralValue::Float(n) => {
                out.push(2);
                out.extend_from_slice(&n.to_le_bytes());
            }
            LiteralValue::Boolean(b) => {
                out.push(3);
                out.push(*b as u8);
            }
            LiteralValue::String(s) => {
                out.push(4);
                write_string(out, s);
            }
        }
    }

    write_u32(out, proto.parameters.len() as u32);
    for param in &proto.parameters {
        write_string(out, param);
    }

    write_u32(out, proto.default_params.len() as u32);
    for pos in &proto.default_params {
        write_u32(out, *pos);
    }

    write_u32(out, proto.outer_vars.len() as u32);
    for outer in &proto.outer_vars {
        write_string(out, &outer.name);
        write_u32(out, outer.index);
        out.push(matches!(outer.kind, OuterKind::Outer) as u8);
        out.push(outer.assignable as u8);
    }

    write_u32(out, proto.local_var_infos.len() as u32);
    for local in &proto.local_var_infos {
        write_string(out, &local.name);
        write_u32(out, local.pos);
        write_u32(out, local.start_op);
        write_u32(out, local.end_op);
    }

    write_u32(out, proto.line_infos.len() as u32);
    for info in &proto.line_infos {
        write_u32(out, info.line);
        write_u32(out, info.op);
    }

    write_u32(out, proto.functions.len() as u32);
    for func in &proto.functions {
        write_proto(out, func);
    }
}

fn read_proto(data: &[u8], cursor: &mut usize) -> Result<FunctionProto, String> {
    let source_name = read_string(data, cursor)?;
    let name = read_string(data, cursor)?;
    let is_vararg = read_u8(data, cursor)? != 0;
    let is_generator = read_u8(data, cursor)? != 0;
    let stack_size = read_u32(data, cursor)?;

    let inst_count = read_u32(data, cursor)? as usize;
    let mut instructions = Vec::with_capacity(inst_count);
    for _ in 0..inst_count {
        let op_byte = read_u8(data, cursor)?;
        let op = Op::from_u8(op_byte).ok_or_else(|| format!("Unknown opcode {}", op_byte))?;
        let arg0 = read_u8(data, cursor)?;
        let arg1 = read_i32(data, cursor)?;
        let arg2 = read_u8(data, cursor)?;
        let arg3 = read_u8(data, cursor)?;
        instructions.push(Instruction::new(op, arg0, arg1, arg2, arg3));
    }

    let lit_count = read_u32(data, cursor)? as usize;
    let mut literals = Vec::with_capacity(lit_count);
    for _ in 0..lit_count {
        let tag = read_u8(data, cursor)?;
        literals.push(match tag {
            0 => LiteralValue::Null,
            1 => LiteralValue::Integer(read_i64(data, cursor)?),
            2 => LiteralValue::Float(read_f64(data, cursor)?),
            3 => LiteralValue::Boolean(read_u8(data, cursor)? != 0),
            4 => LiteralValue::String(read_string(data, cursor)?),
            other => return Err(format!("Unknown literal tag {}", other)),
        });
    }

    let param_count = read_u32(data, cursor)? as usize;
    let mut parameters = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        parameters.push(read_string(data, cursor)?);
    }

    let default_count = read_u32(data, cursor)? as usize;
    let mut default_params = Vec::with_capacity(default_count);
    for _ in 0..default_count {
        default_params.push(read_u32(data, cursor)?);
    }

    let outer_count = read_u32(data, cursor)? as usize;
    let mut outer_vars = Vec::with_capacity(outer_count);
    for _ in 0..outer_count {
        let name = read_string(data, cursor)?;
        let index = read_u32(data, cursor)?;
        let kind = if read_u8(data, cursor)? != 0 {
            OuterKind::Outer
        } else {
            OuterKind::Local
        };
        let assignable = read_u8(data, cursor)? != 0;
        outer_vars.push(OuterVarInfo {
            name,
            index,
            kind,
            assignable,
        });
    }

    let local_count = read_u32(data, cursor)? as usize;
    let mut local_var_infos = Vec::with_capacity(local_count);
    for _ in 0..local_count {
        let name = read_string(data, cursor)?;
        let pos = read_u32(data, cursor)?;
        let start_op = read_u32(data, cursor)?;
        let end_op = read_u32(data, cursor)?;
        local_var_infos.push(LocalVarInfo {
            name,
            pos,
            start_op,
            end_op,
        });
    }

    let line_count = read_u32(data, cursor)? as usize;
    let mut line_infos = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        let line = read_u32(data, cursor)?;
        let op = read_u32(data, cursor)?;
        line_infos.push(LineInfo { line, op });
    }

    let func_count = read_u32(data, cursor)? as usize;
    let mut functions = Vec::with_capacity(func_count);
    for _ in 0..func_count {
        functions.push(read_proto(data, cursor)?);
    }

    Ok(FunctionProto {
        instructions,
        literals,
        parameters,
        default_params,
        outer_vars,
        functions,
        local_var_infos,
        line_infos,
        is_vararg,
        is_generator,
        stack_size,
        source_name,
        name,
    })
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn read_u8(data: &[u8], cursor: &mut usize) -> Result<u8, String> {
    let byte = *data.get(*cursor).ok_or("Unexpected end of file")?;
    *cursor += 1;
    Ok(byte)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32, String> {
    if *cursor + 4 > data.len() {
        return Err("Unexpected end of file".to_string());
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[*cursor..*cursor + 4]);
    *cursor += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i32(data: &[u8], cursor: &mut usize) -> Result<i32, String> {
    Ok(read_u32(data, cursor)? as i32)
}

fn read_i64(data: &[u8], cursor: &mut usize) -> Result<i64, String> {
    if *cursor + 8 > data.len() {
        return Err("Unexpected end of file".to_string());
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[*cursor..*cursor + 8]);
    *cursor += 8;
    Ok(i64::from_le_bytes(bytes))
}

fn read_f64(data: &[u8], cursor: &mut usize) -> Result<f64, String> {
    Ok(f64::from_bits(read_i64(data, cursor)? as u64))
}

fn read_string(data: &[u8], cursor: &mut usize) -> Result<String, String> {
    let len = read_u32(data, cursor)? as usize;
    if *cursor + len > data.len() {
        return Err("Unexpected end of file".to_string());
    }
    let s = String::from_utf8(data[*cursor..*cursor + len].to_vec())
        .map_err(|_| "Invalid string encoding".to_string())?;
    *cursor += len;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto_with_lines() -> FunctionProto {
        FunctionProto {
            instructions: vec![
                Instruction::ab(Op::Load, 0, 0),
                Instruction::ab(Op::Load, 1, 1),
                Instruction::new(Op::Return, 1, 1, 2, 0),
            ],
            literals: vec![LiteralValue::Integer(1), LiteralValue::Float(2.5)],
            parameters: vec!["this".to_string()],
            default_params: Vec::new(),
            outer_vars: Vec::new(),
            functions: Vec::new(),
            local_var_infos: Vec::new(),
            line_infos: vec![LineInfo { line: 3, op: 1 }, LineInfo { line: 5, op: 2 }],
            is_vararg: false,
            is_generator: false,
            stack_size: 2,
            source_name: "test.hzl".to_string(),
            name: "main".to_string(),
        }
    }

    #[test]
    fn line_for_op_picks_the_latest_marker_at_or_before() {
        let proto = proto_with_lines();
        assert_eq!(proto.line_for_op(0), None);
        assert_eq!(proto.line_for_op(1), Some(3));
        assert_eq!(proto.line_for_op(2), Some(5));
        assert_eq!(proto.line_for_op(10), Some(5));
    }
}
