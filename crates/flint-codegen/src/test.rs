use expect_test::expect;

use flint_bytecode::{Op, Operand};
use flint_core::chunk::Chunk;
use flint_core::debug::disassemble_chunk;
use flint_core::object::Function;
use flint_core::{Gc, Heap};

use crate::compile;

fn compile_ok(source: &str, heap: &mut Heap) -> Gc<Function> {
    match compile(source, heap) {
        Ok(function) => function,
        Err(errors) => panic!("compile failed: {:?}", errors),
    }
}

/// Decode a chunk back into its opcode sequence, skipping operands.
fn decode(chunk: &Chunk) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut offset = 0;
    while offset < chunk.code.len() {
        let op = Op::try_from(chunk.code[offset]).expect("well-formed chunk");
        ops.push(op);
        offset += 1 + match op.operand() {
            Operand::None => 0,
            Operand::Byte | Operand::Const => 1,
            Operand::Jump | Operand::Loop | Operand::ConstByte => 2,
            Operand::Closure => {
                let constant = chunk.code[offset + 1];
                let upvalues = chunk.constants[constant as usize]
                    .as_obj()
                    .and_then(|obj| obj.downcast::<Function>())
                    .map_or(0, |f| f.upvalue_count);
                1 + 2 * upvalues
            }
        };
    }
    ops
}

#[test]
fn arithmetic_precedence() {
    let mut heap = Heap::new();
    let script = compile_ok("print (1 + 2) * 3 - -4;", &mut heap);
    assert_eq!(
        decode(&script.chunk),
        vec![
            Op::Constant,
            Op::Constant,
            Op::Add,
            Op::Constant,
            Op::Multiply,
            Op::Constant,
            Op::Negate,
            Op::Subtract,
            Op::Print,
            Op::Nil,
            Op::Return,
        ]
    );
}

#[test]
fn constants_are_deduplicated() {
    let mut heap = Heap::new();
    let script = compile_ok("print 1 + 1;", &mut heap);
    assert_eq!(script.chunk.constants.len(), 1);

    // Interned identifier names share one pool slot too.
    let script = compile_ok("var x = 5; x = 6; print x;", &mut heap);
    assert_eq!(script.chunk.constants.len(), 3);
}

#[test]
fn globals_compile_to_named_accesses() {
    let mut heap = Heap::new();
    let script = compile_ok("var x = 5; x = 6; print x;", &mut heap);
    assert_eq!(
        decode(&script.chunk),
        vec![
            Op::Constant,
            Op::DefineGlobal,
            Op::Constant,
            Op::SetGlobal,
            Op::Pop,
            Op::GetGlobal,
            Op::Print,
            Op::Nil,
            Op::Return,
        ]
    );
}

#[test]
fn locals_compile_to_slot_accesses() {
    let mut heap = Heap::new();
    let script = compile_ok("{ var a = 1; print a; }", &mut heap);
    assert_eq!(
        decode(&script.chunk),
        vec![
            Op::Constant,
            Op::GetLocal,
            Op::Print,
            Op::Pop,
            Op::Nil,
            Op::Return,
        ]
    );
    // Slot 1: slot 0 is reserved for the callee.
    let get_local_operand = script.chunk.code[3];
    assert_eq!(get_local_operand, 1);
}

#[test]
fn closures_capture_locals_as_upvalues() {
    let mut heap = Heap::new();
    let script = compile_ok(
        "fun outer() { var x = 1; fun inner() { print x; } }",
        &mut heap,
    );

    let outer = script.chunk.constants[1]
        .as_obj()
        .and_then(|obj| obj.downcast::<Function>())
        .expect("outer function constant");
    assert_eq!(outer.arity, 0);
    assert_eq!(outer.upvalue_count, 0);

    let inner = outer.chunk.constants[1]
        .as_obj()
        .and_then(|obj| obj.downcast::<Function>())
        .expect("inner function constant");
    assert_eq!(inner.upvalue_count, 1);
    assert_eq!(decode(&inner.chunk), vec![Op::GetUpvalue, Op::Print, Op::Nil, Op::Return]);

    // The OP_CLOSURE trailer in outer marks the capture as (local, slot 1).
    let ops = decode(&outer.chunk);
    assert_eq!(ops, vec![Op::Constant, Op::Closure, Op::Nil, Op::Return]);
    let closure_offset = 2;
    assert_eq!(outer.chunk.code[closure_offset], u8::from(Op::Closure));
    assert_eq!(outer.chunk.code[closure_offset + 2], 1); // is_local
    assert_eq!(outer.chunk.code[closure_offset + 3], 1); // slot index
}

#[test]
fn initializers_return_the_receiver() {
    let mut heap = Heap::new();
    let script = compile_ok("class A { init(n) { this.n = n; } }", &mut heap);
    assert_eq!(
        decode(&script.chunk),
        vec![
            Op::Class,
            Op::DefineGlobal,
            Op::GetGlobal,
            Op::Closure,
            Op::Method,
            Op::Pop,
            Op::Nil,
            Op::Return,
        ]
    );

    let init = script
        .chunk
        .constants
        .iter()
        .find_map(|c| c.as_obj().and_then(|obj| obj.downcast::<Function>()))
        .expect("init method constant");
    assert_eq!(init.arity, 1);
    assert_eq!(
        decode(&init.chunk),
        vec![
            Op::GetLocal,
            Op::GetLocal,
            Op::SetProperty,
            Op::Pop,
            Op::GetLocal,
            Op::Return,
        ]
    );
}

#[test]
fn inheritance_leaves_the_superclass_for_super_lookups() {
    let mut heap = Heap::new();
    let script = compile_ok("class A {} class B < A {}", &mut heap);
    assert_eq!(
        decode(&script.chunk),
        vec![
            // class A
            Op::Class,
            Op::DefineGlobal,
            Op::GetGlobal,
            Op::Pop,
            // class B < A
            Op::Class,
            Op::DefineGlobal,
            Op::GetGlobal, // superclass A
            Op::GetGlobal, // subclass B
            Op::Inherit,
            Op::GetGlobal, // B again, for the (empty) body
            Op::Pop,       // pop class
            Op::Pop,       // end of scope pops the hidden superclass local
            Op::Nil,
            Op::Return,
        ]
    );
}

#[test]
fn disassembly_snapshot() {
    let mut heap = Heap::new();
    let script = compile_ok("print 1 + 2;", &mut heap);
    expect![[r#"
        == <script> ==
        0000    1 OP_CONSTANT         0 '1'
        0002    | OP_CONSTANT         1 '2'
        0004    | OP_ADD
        0005    | OP_PRINT
        0006    | OP_NIL
        0007    | OP_RETURN
    "#]]
    .assert_eq(&disassemble_chunk(&script.chunk, "<script>"));
}

#[test]
fn missing_semicolon_is_reported() {
    let mut heap = Heap::new();
    let errors = compile("print 1", &mut heap).expect_err("should fail");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message(), "Expect ';' after value.");
    assert_eq!(
        errors[0].to_string(),
        "[line 1] Error at end: Expect ';' after value."
    );
}

#[test]
fn top_level_return_is_rejected() {
    let mut heap = Heap::new();
    let errors = compile("return 1;", &mut heap).expect_err("should fail");
    assert_eq!(errors[0].message(), "Can't return from top-level code.");
}

#[test]
fn duplicate_locals_are_rejected() {
    let mut heap = Heap::new();
    let errors = compile("{ var a = 1; var a = 2; }", &mut heap).expect_err("should fail");
    assert_eq!(
        errors[0].message(),
        "Already a variable with this name in this scope."
    );
}

#[test]
fn this_outside_a_class_is_rejected() {
    let mut heap = Heap::new();
    let errors = compile("print this;", &mut heap).expect_err("should fail");
    assert_eq!(errors[0].message(), "Can't use 'this' outside of a class.");
}

#[test]
fn panic_mode_recovers_at_statement_boundaries() {
    let mut heap = Heap::new();
    let errors = compile("var = 1; var y = ;", &mut heap).expect_err("should fail");
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].message(), "Expect variable name.");
    assert_eq!(errors[1].message(), "Expect expression.");
}

#[test]
fn constant_pool_overflow_is_reported() {
    let mut heap = Heap::new();
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("print {}.5;\n", i));
    }
    let errors = compile(&source, &mut heap).expect_err("should fail");
    assert!(errors
        .iter()
        .any(|e| e.message() == "Too many constants in one chunk."));
}
