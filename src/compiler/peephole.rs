// Single-lookback instruction fusion, applied on every append. Each rule
// inspects only the previous instruction; positions of anything earlier never
// change, so recorded jump origins stay valid.

use crate::compiler::opcode::{Instruction, Op, NO_TARGET};

/// Outcome of offering `new` to the fusion table while `prev` is the last
/// emitted instruction.
#[derive(Debug, PartialEq, Eq)]
pub enum Fused {
    /// No rule applied; append the instruction unchanged.
    Append(Instruction),
    /// `prev` was rewritten to absorb `new`; nothing gets appended.
    Absorbed,
    /// `prev` must be removed and this instruction appended in its place.
    ReplacePrev(Instruction),
    /// `prev` was rewritten in place and `new` still gets appended.
    MutatedPrev(Instruction),
}

/// Ops that write an ordinary result into `arg0` and can be retargeted when a
/// `Move` immediately copies that result elsewhere.
fn writes_plain_target(op: Op) -> bool {
    matches!(
        op,
        Op::Load
            | Op::LoadInt
            | Op::LoadFloat
            | Op::LoadBool
            | Op::LoadRoot
            | Op::GetBase
            | Op::Move
            | Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Bitw
            | Op::Cmp
            | Op::Eq
            | Op::Ne
            | Op::Neg
            | Op::Not
            | Op::BitNot
            | Op::TypeOf
            | Op::CloneObj
            | Op::Get
            | Op::GetK
            | Op::GetOuter
            | Op::Closure
            | Op::NewObj
            | Op::Exists
            | Op::InstanceOf
    )
}

fn fits_u8(value: i32) -> bool {
    (0..=0xFF).contains(&value)
}

/// Offer `new` to the fusion table. `is_named` reports whether a slot is a
/// live named local; every rule that rewrites a previous result requires the
/// rewritten destination to be a temporary.
pub fn fuse(
    prev: &mut Instruction,
    new: Instruction,
    is_named: &dyn Fn(u8) -> bool,
    trap_depth: usize,
) -> Fused {
    match new.op {
        // Cmp + Jz on the freshly computed flag fuses into one compare-branch
        Op::Jz => {
            if prev.op == Op::Cmp
                && prev.arg0 == new.arg0
                && !is_named(prev.arg0)
                && fits_u8(prev.arg1)
            {
                *prev = Instruction::new(
                    Op::JCmp,
                    prev.arg1 as u8,
                    new.arg1,
                    prev.arg2,
                    prev.arg3,
                );
                return Fused::Absorbed;
            }
        }

        // Two pool loads into distinct slots pack into one DLoad
        Op::Load => {
            if prev.op == Op::Load
                && prev.arg0 != new.arg0
                && fits_u8(prev.arg1)
                && fits_u8(new.arg1)
            {
                *prev = Instruction::new(
                    Op::DLoad,
                    prev.arg0,
                    prev.arg1,
                    new.arg0,
                    new.arg1 as u8,
                );
                return Fused::Absorbed;
            }
        }

        Op::Move => {
            // Retarget: a result copied straight out of a temporary is
            // produced directly into the copy's destination instead.
            if writes_plain_target(prev.op)
                && prev.arg0 as i32 == new.arg1
                && !is_named(prev.arg0)
            {
                prev.arg0 = new.arg0;
                return Fused::Absorbed;
            }
            if prev.op == Op::Move && fits_u8(prev.arg1) && fits_u8(new.arg1) {
                *prev = Instruction::new(
                    Op::DMove,
                    prev.arg0,
                    prev.arg1,
                    new.arg0,
                    new.arg1 as u8,
                );
                return Fused::Absorbed;
            }
        }

        // A key loaded from the pool and immediately used by Get becomes a
        // literal-keyed GetK
        Op::Get => {
            if prev.op == Op::Load
                && prev.arg0 == new.arg2
                && !is_named(prev.arg0)
                && fits_u8(new.arg1)
            {
                let fused = Instruction::new(Op::GetK, new.arg0, prev.arg1, new.arg1 as u8, 0);
                return Fused::ReplacePrev(fused);
            }
        }

        Op::PrepCall => {
            if prev.op == Op::Load && prev.arg0 as i32 == new.arg1 && !is_named(prev.arg0) {
                let fused =
                    Instruction::new(Op::PrepCallK, new.arg0, prev.arg1, new.arg2, new.arg3);
                return Fused::ReplacePrev(fused);
            }
        }

        Op::Return => {
            // Returning a call result with no trap to unwind runs the call in
            // the caller's frame
            if prev.op == Op::Call
                && trap_depth == 0
                && new.arg0 != NO_TARGET
                && prev.arg0 as i32 == new.arg1
            {
                prev.op = Op::TailCall;
                return Fused::MutatedPrev(new);
            }
            // Return closes every capture anyway
            if prev.op == Op::Close {
                return Fused::ReplacePrev(new);
            }
        }

        // Adjacent null fills merge into one wider fill
        Op::LoadNulls => {
            if prev.op == Op::LoadNulls && prev.arg0 as i32 + prev.arg1 == new.arg0 as i32 {
                prev.arg1 += new.arg1;
                return Fused::Absorbed;
            }
        }

        // Only the latest of two adjacent line markers matters
        Op::Line => {
            if prev.op == Op::Line {
                return Fused::ReplacePrev(new);
            }
        }

        _ => {}
    }

    Fused::Append(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::opcode::{CmpOp, JUMP_PLACEHOLDER};

    fn no_locals(_: u8) -> bool {
        false
    }

    #[test]
    fn cmp_then_jz_fuses_into_jcmp() {
        let mut prev = Instruction::new(Op::Cmp, 2, 1, 0, CmpOp::Less as u8);
        let jz = Instruction::new(Op::Jz, 2, JUMP_PLACEHOLDER, 0, 0);
        let outcome = fuse(&mut prev, jz, &no_locals, 0);
        assert_eq!(outcome, Fused::Absorbed);
        assert_eq!(prev.op, Op::JCmp);
        assert_eq!(prev.arg0, 1);
        assert_eq!(prev.arg1, JUMP_PLACEHOLDER);
        assert_eq!(prev.arg2, 0);
        assert_eq!(prev.arg3, CmpOp::Less as u8);
    }

    #[test]
    fn cmp_into_named_local_does_not_fuse() {
        let named = |pos: u8| pos == 2;
        let mut prev = Instruction::new(Op::Cmp, 2, 1, 0, CmpOp::Less as u8);
        let jz = Instruction::new(Op::Jz, 2, JUMP_PLACEHOLDER, 0, 0);
        let outcome = fuse(&mut prev, jz, &named, 0);
        assert!(matches!(outcome, Fused::Append(_)));
        assert_eq!(prev.op, Op::Cmp);
    }

    #[test]
    fn adjacent_loads_fuse_into_dload() {
        let mut prev = Instruction::ab(Op::Load, 0, 3);
        let second = Instruction::ab(Op::Load, 1, 4);
        assert_eq!(fuse(&mut prev, second, &no_locals, 0), Fused::Absorbed);
        assert_eq!(prev.op, Op::DLoad);
        assert_eq!((prev.arg0, prev.arg1, prev.arg2, prev.arg3), (0, 3, 1, 4));
    }

    #[test]
    fn load_then_get_becomes_getk() {
        let mut prev = Instruction::ab(Op::Load, 3, 7);
        let get = Instruction::new(Op::Get, 2, 1, 3, 0);
        match fuse(&mut prev, get, &no_locals, 0) {
            Fused::ReplacePrev(inst) => {
                assert_eq!(inst.op, Op::GetK);
                assert_eq!(inst.arg0, 2);
                assert_eq!(inst.arg1, 7);
                assert_eq!(inst.arg2, 1);
            }
            other => panic!("expected ReplacePrev, got {:?}", other),
        }
    }

    #[test]
    fn move_out_of_temp_retargets_producer() {
        let mut prev = Instruction::new(Op::Add, 4, 3, 2, 0);
        let mv = Instruction::ab(Op::Move, 1, 4);
        assert_eq!(fuse(&mut prev, mv, &no_locals, 0), Fused::Absorbed);
        assert_eq!(prev.op, Op::Add);
        assert_eq!(prev.arg0, 1);
    }

    #[test]
    fn call_then_return_tailcalls_outside_traps() {
        let mut prev = Instruction::new(Op::Call, 2, 2, 3, 1);
        let ret = Instruction::ab(Op::Return, 1, 2);
        let outcome = fuse(&mut prev, ret, &no_locals, 0);
        assert!(matches!(outcome, Fused::MutatedPrev(_)));
        assert_eq!(prev.op, Op::TailCall);
    }

    #[test]
    fn call_then_return_inside_trap_stays_a_call() {
        let mut prev = Instruction::new(Op::Call, 2, 2, 3, 1);
        let ret = Instruction::ab(Op::Return, 1, 2);
        let outcome = fuse(&mut prev, ret, &no_locals, 1);
        assert!(matches!(outcome, Fused::Append(_)));
        assert_eq!(prev.op, Op::Call);
    }

    #[test]
    fn close_before_return_is_dropped() {
        let mut prev = Instruction::ab(Op::Close, 0, 2);
        let ret = Instruction::ab(Op::Return, 1, 3);
        match fuse(&mut prev, ret, &no_locals, 0) {
            Fused::ReplacePrev(inst) => assert_eq!(inst.op, Op::Return),
            other => panic!("expected ReplacePrev, got {:?}", other),
        }
    }

    #[test]
    fn contiguous_null_fills_merge() {
        let mut prev = Instruction::ab(Op::LoadNulls, 2, 2);
        let next = Instruction::ab(Op::LoadNulls, 4, 1);
        assert_eq!(fuse(&mut prev, next, &no_locals, 0), Fused::Absorbed);
        assert_eq!(prev.arg1, 3);

        // A gap prevents the merge
        let mut prev = Instruction::ab(Op::LoadNulls, 2, 2);
        let gapped = Instruction::ab(Op::LoadNulls, 6, 1);
        assert!(matches!(fuse(&mut prev, gapped, &no_locals, 0), Fused::Append(_)));
    }

    #[test]
    fn duplicate_line_markers_collapse() {
        let mut prev = Instruction::ab(Op::Line, 0, 10);
        let next = Instruction::ab(Op::Line, 0, 11);
        match fuse(&mut prev, next, &no_locals, 0) {
            Fused::ReplacePrev(inst) => assert_eq!(inst.arg1, 11),
            other => panic!("expected ReplacePrev, got {:?}", other),
        }
    }
}
