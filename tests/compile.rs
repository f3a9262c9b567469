// End-to-end compiler tests: source text in, function prototypes (or errors)
// out. Instruction-level assertions only check properties the VM contract
// depends on, not exact instruction listings.

use hazel_core::compiler::opcode::{CmpOp, Op, JUMP_PLACEHOLDER};
use hazel_core::lexer::Scanner;
use hazel_core::parser::Parser;
use hazel_core::proto::{self, LiteralValue, OuterKind};
use hazel_core::{compile, CompileError, FunctionProto};

fn compile_ok(source: &str) -> FunctionProto {
    match compile(source, "test.hzl") {
        Ok(proto) => proto,
        Err(err) => panic!("expected successful compile, got: {}", err.message),
    }
}

fn compile_err(source: &str) -> CompileError {
    match compile(source, "test.hzl") {
        Ok(_) => panic!("expected compile error for:\n{}", source),
        Err(err) => err,
    }
}

fn has_op(proto: &FunctionProto, op: Op) -> bool {
    proto.instructions.iter().any(|i| i.op == op)
}

fn assert_no_placeholders(proto: &FunctionProto) {
    for inst in &proto.instructions {
        if inst.op.is_jump() {
            assert_ne!(
                inst.arg1, JUMP_PLACEHOLDER,
                "unresolved jump in '{}': {}",
                proto.name, inst
            );
        }
    }
    for child in &proto.functions {
        assert_no_placeholders(child);
    }
}

// ==================== Literal pool ====================

#[test]
fn test_literal_pool_dedups_within_a_function() {
    let proto = compile_ok("local a = 1\nlocal b = 1\nlocal c = 1\n");
    let ones = proto
        .literals
        .iter()
        .filter(|l| **l == LiteralValue::Integer(1))
        .count();
    assert_eq!(ones, 1);
}

#[test]
fn test_integer_and_float_literals_stay_distinct() {
    let proto = compile_ok("local a = 1\nlocal b = 1.0\n");
    assert!(proto.literals.contains(&LiteralValue::Integer(1)));
    assert!(proto.literals.contains(&LiteralValue::Float(1.0)));
}

#[test]
fn test_adjacent_literal_loads_fuse() {
    let proto = compile_ok("local a = 1, b = 2\n");
    assert!(has_op(&proto, Op::DLoad));
}

// ==================== Closures and captures ====================

#[test]
fn test_repeated_reference_captures_once() {
    let proto = compile_ok("local x = 1\nlocal f = function() { return x + x }\n");
    let f = &proto.functions[0];
    assert_eq!(f.outer_vars.len(), 1);
    assert_eq!(f.outer_vars[0].name, "x");
}

#[test]
fn test_capture_chains_through_intermediate_functions() {
    let proto = compile_ok(
        "local x = 1\n\
         local f = function() {\n\
             local g = function() { return x }\n\
             return g\n\
         }\n",
    );
    let f = &proto.functions[0];
    assert_eq!(f.outer_vars.len(), 1);
    assert_eq!(f.outer_vars[0].kind, OuterKind::Local);
    let g = &f.functions[0];
    assert_eq!(g.outer_vars.len(), 1);
    assert_eq!(g.outer_vars[0].kind, OuterKind::Outer);
}

#[test]
fn test_default_parameters_evaluate_in_enclosing_frame() {
    let proto = compile_ok("local d = 10\nlocal f = function(a = d + 1) { return a }\n");
    let f = &proto.functions[0];
    assert_eq!(f.default_params.len(), 1);
    assert_eq!(f.parameters, vec!["this", "a"]);
}

#[test]
fn test_yield_marks_the_function_as_generator() {
    let proto = compile_ok("local g = function() { yield 1 }\n");
    assert!(proto.functions[0].is_generator);
    assert!(!proto.is_generator);
}

// ==================== Peephole results ====================

#[test]
fn test_loop_comparison_fuses_into_jcmp() {
    let proto = compile_ok("local i = 0\nwhile (i < 10) i += 1\n");
    assert!(has_op(&proto, Op::JCmp));
}

#[test]
fn test_no_optimizer_directive_keeps_cmp_and_jz_apart() {
    let proto = compile_ok("#no-optimizer\nlocal i = 0\nwhile (i < 10) i += 1\n");
    assert!(!has_op(&proto, Op::JCmp));
    assert!(has_op(&proto, Op::Cmp));
    assert!(has_op(&proto, Op::Jz));
}

#[test]
fn test_self_call_in_return_position_becomes_tailcall() {
    let proto = compile_ok("function f(n) { return f(n - 1) }\n");
    let f = &proto.functions[0];
    assert!(f.instructions.iter().any(|i| i.op == Op::TailCall));
    // The Return stays behind the rewritten call
    assert!(f.instructions.iter().any(|i| i.op == Op::Return));
}

#[test]
fn test_return_of_call_inside_try_stays_a_plain_call() {
    let proto = compile_ok(
        "function f(n) {\n\
             try { return f(n - 1) } catch (e) { return 0 }\n\
         }\n",
    );
    let f = &proto.functions[0];
    assert!(!f.instructions.iter().any(|i| i.op == Op::TailCall));
    assert!(f.instructions.iter().any(|i| i.op == Op::Call));
}

#[test]
fn test_three_way_comparison_compiles_to_cmp() {
    let proto = compile_ok("local c = 1 <=> 2\n");
    assert!(proto
        .instructions
        .iter()
        .any(|i| i.op == Op::Cmp && i.arg3 == CmpOp::ThreeWay as u8));
}

// ==================== Jump resolution ====================

#[test]
fn test_no_jump_placeholder_survives_compilation() {
    let proto = compile_ok(
        "local total = 0\n\
         for (local i = 0; i < 10; i += 1) {\n\
             if (i == 3) continue\n\
             if (i == 8) break\n\
             switch (i) {\n\
                 case 0: total += 1\n\
                 case 1: total += 2; break\n\
                 default: total += i\n\
             }\n\
         }\n\
         foreach (k, v in { a = 1, b = 2 }) total += v\n\
         try { throw \"x\" } catch (e) { total = total ?? 0 }\n\
         local pick = total > 5 ? total : -total\n\
         local both = total && pick || 0\n\
         do { total -= 1 } while (total > 0)\n\
         local f = function() { return total }\n",
    );
    assert_no_placeholders(&proto);
}

#[test]
fn test_conditionless_for_body_stays_inside_the_loop() {
    // One line, so no line markers sit between the pre-loop initializer and
    // the loop head. The body's first instruction is the loop-back target and
    // must not fuse with anything emitted before the loop.
    let proto = compile_ok("for (local i = 0 ;; i = i + 1) { local j = 2; if (j > 9) break; }\n");
    let (back_pos, back) = proto
        .instructions
        .iter()
        .enumerate()
        .find(|(_, i)| i.op == Op::Jmp && i.arg1 < 0)
        .unwrap_or_else(|| panic!("no loop-back jump in:\n{}", proto.disassemble()));
    let head = back_pos as i32 + back.arg1 + 1;
    let two = proto
        .literals
        .iter()
        .position(|l| *l == LiteralValue::Integer(2))
        .unwrap() as i32;
    let j_init = proto
        .instructions
        .iter()
        .position(|i| {
            (i.op == Op::Load && i.arg1 == two)
                || (i.op == Op::DLoad && (i.arg1 == two || i.arg3 as i32 == two))
        })
        .unwrap() as i32;
    assert!(
        j_init >= head,
        "body initializer at {} sits before the loop head at {}:\n{}",
        j_init,
        head,
        proto.disassemble()
    );
}

// ==================== Statement and context errors ====================

#[test]
fn test_break_outside_loop_is_an_error() {
    let err = compile_err("break\n");
    assert!(err.message.contains("'break'"), "got: {}", err.message);
}

#[test]
fn test_continue_outside_loop_is_an_error() {
    let err = compile_err("continue\n");
    assert!(err.message.contains("'continue'"), "got: {}", err.message);
}

#[test]
fn test_plain_assignment_in_if_condition_is_rejected() {
    let err = compile_err("local x = 0\nif (x = 5) {}\n");
    assert!(err.message.contains("'if'"), "got: {}", err.message);
}

#[test]
fn test_in_expression_binding_is_legal_in_conditions() {
    compile_ok("local x = 0\nif (x := 5) {}\nwhile (x := x - 1) {}\n");
}

#[test]
fn test_plain_assignment_in_call_argument_is_rejected() {
    let err = compile_err("local x = 0\nprint(x = 5)\n");
    assert!(!err.message.is_empty());
    compile_ok("local x = 0\nprint(x := 5)\n");
}

#[test]
fn test_duplicate_local_is_an_error() {
    let err = compile_err("local x = 1\nlocal x = 2\n");
    assert!(err.message.contains("already declared"), "got: {}", err.message);
}

#[test]
fn test_let_binding_is_read_only() {
    let err = compile_err("let x = 1\nx = 2\n");
    assert!(err.message.contains("read-only"), "got: {}", err.message);
}

// ==================== Constants and enums ====================

#[test]
fn test_enum_member_access_folds_to_a_literal() {
    let proto = compile_ok("enum E { A, B = 5, C }\nlocal v = E.B\nlocal w = E.C\n");
    assert!(proto.literals.contains(&LiteralValue::Integer(5)));
    assert!(proto.literals.contains(&LiteralValue::Integer(6)));
    // No runtime lookup of the enum remains
    assert!(!proto.literals.contains(&LiteralValue::String("E".to_string())));
}

#[test]
fn test_unknown_enum_member_is_a_compile_error() {
    let err = compile_err("enum E { A }\nlocal v = E.Q\n");
    assert!(err.message.contains("Unknown member"), "got: {}", err.message);
}

#[test]
fn test_enum_table_is_not_a_first_class_value() {
    let err = compile_err("enum E { A }\nlocal t = E\n");
    assert!(err.message.contains("constant table"), "got: {}", err.message);
}

#[test]
fn test_local_shadows_constant() {
    let proto = compile_ok("const N = 5\nlocal f = function(N) { return N }\n");
    // The parameter wins inside the function, so no literal 5 is loaded there
    assert!(!proto.functions[0]
        .literals
        .contains(&LiteralValue::Integer(5)));
}

#[test]
fn test_constant_assignment_is_rejected() {
    let err = compile_err("const N = 5\nN = 6\n");
    assert!(err.message.contains("constant"), "got: {}", err.message);
}

// ==================== Parsing ====================

#[test]
fn test_logical_and_is_left_associative() {
    use hazel_core::ast::{BinaryOp, Expr, Stmt};
    let source = "a && b && c\n";
    let mut scanner = Scanner::new(source, "test.hzl", 0);
    let tokens = scanner.scan_tokens().unwrap();
    let mut parser = Parser::new(tokens, scanner.feature_updates, 0, "test.hzl", source);
    let program = parser.parse().unwrap();

    // ((a && b) && c): the outer right operand is the bare identifier c
    let Stmt::Expression {
        expr: Expr::Binary {
            left, op, right, ..
        },
        ..
    } = &program.block.statements[0]
    else {
        panic!("expected a binary expression statement");
    };
    assert_eq!(*op, BinaryOp::And);
    assert!(matches!(&**right, Expr::Identifier { name, .. } if name == "c"));
    assert!(matches!(&**left, Expr::Binary { op: BinaryOp::And, .. }));
}

#[test]
fn test_reparse_produces_identical_tree() {
    let source = "local x = 1\n\
                  function f(a, b = 2) {\n\
                      foreach (i, v in a) x += v\n\
                      return @(y) y + b\n\
                  }\n\
                  function g(...) { return vargv }\n\
                  class C extends D { constructor() { base.constructor() } }\n";
    let parse = |src: &str| {
        let mut scanner = Scanner::new(src, "test.hzl", 0);
        let tokens = scanner.scan_tokens().unwrap();
        let mut parser = Parser::new(tokens, scanner.feature_updates, 0, "test.hzl", src);
        parser.parse().unwrap()
    };
    let first = format!("{:?}", parse(source).block);
    let second = format!("{:?}", parse(source).block);
    assert_eq!(first, second);
}

#[test]
fn test_root_access_can_be_disabled() {
    compile_ok("local x = ::getroottable\n");
    let err = compile_err("#no-root-access\nlocal x = ::getroottable\n");
    assert!(!err.message.is_empty());
}

#[test]
fn test_explicit_this_rejects_bareword_fields() {
    compile_ok("width = 10\n");
    let err = compile_err("#explicit-this\nwidth = 10\n");
    assert!(err.message.contains("Unknown variable"), "got: {}", err.message);
}

// ==================== Binary form ====================

fn assert_protos_match(a: &FunctionProto, b: &FunctionProto) {
    assert_eq!(a.name, b.name);
    assert_eq!(a.source_name, b.source_name);
    assert_eq!(a.instructions, b.instructions, "in '{}'", a.name);
    assert_eq!(a.literals, b.literals, "in '{}'", a.name);
    assert_eq!(a.parameters, b.parameters);
    assert_eq!(a.default_params, b.default_params);
    assert_eq!(a.outer_vars, b.outer_vars);
    assert_eq!(a.local_var_infos, b.local_var_infos);
    assert_eq!(a.line_infos, b.line_infos);
    assert_eq!(a.is_vararg, b.is_vararg);
    assert_eq!(a.is_generator, b.is_generator);
    assert_eq!(a.stack_size, b.stack_size);
    assert_eq!(a.functions.len(), b.functions.len());
    for (x, y) in a.functions.iter().zip(&b.functions) {
        assert_protos_match(x, y);
    }
}

#[test]
fn test_binary_form_round_trips() {
    let compiled = compile_ok(
        "local scale = 2.5\n\
         function wave(n = 1) {\n\
             yield n * scale\n\
         }\n\
         local adder = function(v) {\n\
             return function() { return v + 1 }\n\
         }\n",
    );
    let bytes = proto::serialize(&compiled);
    let restored = match proto::deserialize(&bytes) {
        Ok(proto) => proto,
        Err(msg) => panic!("deserialize failed: {}", msg),
    };
    assert_protos_match(&compiled, &restored);
}

#[test]
fn test_binary_form_rejects_foreign_headers() {
    let compiled = compile_ok("local a = 1\n");
    let good = proto::serialize(&compiled);

    assert!(proto::deserialize(&good[..3]).is_err());

    let mut bad_magic = good.clone();
    bad_magic[0] = b'X';
    let err = proto::deserialize(&bad_magic).unwrap_err();
    assert!(err.contains("not a .hzc file"), "got: {}", err);

    let mut bad_version = good;
    bad_version[4] = 0xFF;
    let err = proto::deserialize(&bad_version).unwrap_err();
    assert!(err.contains("Unsupported version"), "got: {}", err);
}

// ==================== Larger smoke programs ====================

#[test]
fn test_destructuring_declarations_compile() {
    let proto = compile_ok(
        "local { a, b = 10 } = { a = 1 }\n\
         let [ x, y ] = [ 1, 2 ]\n\
         local sum = a + b + x + y\n",
    );
    assert_no_placeholders(&proto);
    assert!(has_op(&proto, Op::GetK));
}

#[test]
fn test_class_with_members_compiles() {
    let proto = compile_ok(
        "class Point {\n\
             static origin = null\n\
             constructor(x, y) { this.x = x; this.y = y }\n\
             function length() { return this.x * this.x + this.y * this.y }\n\
         }\n",
    );
    assert_no_placeholders(&proto);
    assert!(has_op(&proto, Op::NewObj));
    assert!(has_op(&proto, Op::NewSlotA));
}

#[test]
fn test_line_markers_can_be_disabled() {
    use hazel_core::{CompileOptions, CompilerContext};
    let source = "local a = 1\nlocal b = 2\n";
    let mut ctx = CompilerContext::new();
    let with_lines = ctx
        .compile(source, "test.hzl", CompileOptions::default())
        .unwrap();
    let without = ctx
        .compile(
            source,
            "test.hzl",
            CompileOptions {
                emit_line_info: false,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(with_lines.instructions.iter().any(|i| i.op == Op::Line));
    assert!(!without.instructions.iter().any(|i| i.op == Op::Line));
    // The debug table is independent of the marker ops
    assert!(!without.line_infos.is_empty());
}
