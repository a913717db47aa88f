//! End-to-end tests: compile and run source, observe printed output and
//! diagnostics.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use flint_vm::{InterpretResult, Vm, VmOptions};

/// A clonable sink so the test can keep reading what the VM wrote.
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("output is UTF-8")
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_with(options: VmOptions, source: &str) -> (InterpretResult, String, String) {
    let out = SharedBuf::default();
    let err = SharedBuf::default();
    let mut vm = Vm::with_streams(options, Box::new(out.clone()), Box::new(err.clone()));
    let result = vm.interpret(source);
    (result, out.contents(), err.contents())
}

fn run(source: &str) -> (InterpretResult, String, String) {
    run_with(VmOptions::default(), source)
}

fn assert_prints(source: &str, expected: &str) {
    let (result, out, err) = run(source);
    assert_eq!(result, InterpretResult::Ok, "stderr: {}", err);
    assert_eq!(out, expected);
}

fn assert_runtime_error(source: &str, message: &str) {
    let (result, _, err) = run(source);
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(
        err.contains(message),
        "expected {:?} in stderr, got: {}",
        message,
        err
    );
}

#[test]
fn arithmetic_precedence() {
    assert_prints("print (1 + 2) * 3 - -4;", "13\n");
}

#[test]
fn number_printing_round_trips() {
    assert_prints("print 2.5; print 100; print 0.125;", "2.5\n100\n0.125\n");
}

#[test]
fn comparison_and_logic() {
    assert_prints("print 1 < 2; print 2 <= 1; print 3 > 2; print 3 >= 4;", "true\nfalse\ntrue\nfalse\n");
    assert_prints("print 1 and 2; print false and 1; print nil or \"x\";", "2\nfalse\nx\n");
    assert_prints("print !nil; print !0; print !\"\";", "true\nfalse\nfalse\n");
}

#[test]
fn equality_semantics() {
    assert_prints("print nil == false;", "false\n");
    assert_prints("print \"a\" == \"a\"; print \"a\" == \"b\";", "true\nfalse\n");
    assert_prints("print 0/0 == 0/0;", "false\n");
    assert_prints("print 1 == 1.0;", "true\n");
}

#[test]
fn string_concatenation_interns_the_result() {
    assert_prints("print \"foo\" + \"bar\";", "foobar\n");
    assert_prints("print (\"foo\" + \"bar\") == \"foobar\";", "true\n");
}

#[test]
fn global_set_then_get_round_trips() {
    assert_prints("var x = 40; x = x + 2; print x;", "42\n");
    // Redefinition is allowed for globals.
    assert_prints("var a = 1; var a = 2; print a;", "2\n");
}

#[test]
fn control_flow() {
    assert_prints("if (1 < 2) print \"then\"; else print \"else\";", "then\n");
    assert_prints("if (nil) print \"then\"; else print \"else\";", "else\n");
    assert_prints(
        "var sum = 0; for (var i = 1; i < 5; i = i + 1) { sum = sum + i; } print sum;",
        "10\n",
    );
    assert_prints(
        "var n = 3; while (n > 0) { print n; n = n - 1; }",
        "3\n2\n1\n",
    );
}

#[test]
fn functions_return_values() {
    assert_prints("fun f() { return 5; } print f();", "5\n");
    assert_prints("fun f() {} print f();", "nil\n");
    assert_prints("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);", "55\n");
}

#[test]
fn closure_captures_survive_the_frame() {
    assert_prints(
        "fun outer() { var x = \"a\"; fun inner() { print x; } return inner; } outer()();",
        "a\n",
    );
}

#[test]
fn closures_share_one_upvalue_per_slot() {
    assert_prints(
        "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
         var f = make(); print f(); print f(); print f();",
        "1\n2\n3\n",
    );
}

#[test]
fn block_scoped_captures_close_on_scope_exit() {
    assert_prints(
        "var f; { var local = \"kept\"; fun g() { print local; } f = g; } f();",
        "kept\n",
    );
}

#[test]
fn classes_construct_and_dispatch() {
    assert_prints(
        "class A { init(n) { this.n = n; } greet() { print this.n; } } A(7).greet();",
        "7\n",
    );
    assert_prints("class A {} print A; print A();", "A\nA instance\n");
}

#[test]
fn fields_set_then_get_round_trip() {
    assert_prints(
        "class P {} var p = P(); p.x = 1; p.y = 2; print p.x + p.y;",
        "3\n",
    );
    // Assignment leaves the value as the expression result.
    assert_prints("class P {} var p = P(); print p.x = 9;", "9\n");
}

#[test]
fn methods_bind_their_receiver() {
    assert_prints(
        "class A { init() { this.n = 3; } m() { print this.n; } } var bound = A().m; bound();",
        "3\n",
    );
    assert_prints("class A { m() {} } print A().m;", "<fn m>\n");
}

#[test]
fn initializers_return_the_new_instance() {
    assert_prints(
        "class A { init(n) { this.n = n; } } var a = A(1); print a.init(9).n;",
        "9\n",
    );
}

#[test]
fn inheritance_and_super() {
    assert_prints(
        "class A { f() { print \"A\"; } } class B < A { f() { super.f(); print \"B\"; } } B().f();",
        "A\nB\n",
    );
    // Inherited methods come along even without overriding.
    assert_prints(
        "class A { f() { print \"inherited\"; } } class B < A {} B().f();",
        "inherited\n",
    );
}

#[test]
fn fields_shadow_methods_on_invoke() {
    assert_prints(
        "class A { f() { print \"method\"; } } \
         fun shadow() { print \"field\"; } \
         var a = A(); a.f = shadow; a.f();",
        "field\n",
    );
}

#[test]
fn natives_are_callable_values() {
    assert_prints("print clock;", "<native fn>\n");
    assert_prints("print clock() >= 0;", "true\n");
    assert_prints("var c = clock; print c() <= clock();", "true\n");
}

#[test]
fn function_printing_forms() {
    assert_prints("fun f() {} print f;", "<fn f>\n");
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    let source = "fun add(a, b) { return a + b; }\nadd(1);";
    let (result, _, err) = run(source);
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(err.contains("Expected 2 arguments but got 1."), "got: {}", err);
    assert!(err.contains("[line 2] in script"), "got: {}", err);
}

#[test]
fn runtime_errors_carry_a_stack_trace() {
    let source = "fun boom() { return 1 + nil; }\nboom();";
    let (result, _, err) = run(source);
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(err.contains("Operands must be two numbers or two strings."), "got: {}", err);
    assert!(err.contains("[line 1] in boom()"), "got: {}", err);
    assert!(err.contains("[line 2] in script"), "got: {}", err);
}

#[test]
fn canonical_operand_errors() {
    assert_runtime_error("print -true;", "Operand must be a number.");
    assert_runtime_error("print true > false;", "Operands must be numbers.");
    assert_runtime_error("print 1 + \"x\";", "Operands must be two numbers or two strings.");
    assert_runtime_error("print missing;", "Undefined variable 'missing'.");
    assert_runtime_error("missing = 1;", "Undefined variable 'missing'.");
    assert_runtime_error("var x = 1; x();", "Can only call functions and classes.");
    assert_runtime_error("var x = 1; print x.field;", "Only instances have properties.");
    assert_runtime_error("var x = 1; x.field = 2;", "Only instances have fields.");
    assert_runtime_error("var x = 1; x.method();", "Only instances have methods.");
    assert_runtime_error("class A {} print A().missing;", "Undefined property 'missing'.");
    assert_runtime_error("class A {} A().missing();", "Undefined property 'missing'.");
    assert_runtime_error("var NotAClass = 1; class B < NotAClass {}", "Superclass must be a class.");
    assert_runtime_error("class A {} A(1);", "Expected 0 arguments but got 1.");
}

#[test]
fn unbounded_recursion_overflows_the_frame_stack() {
    assert_runtime_error("fun f() { f(); } f();", "Stack overflow.");
}

#[test]
fn the_vm_recovers_after_a_runtime_error() {
    let out = SharedBuf::default();
    let err = SharedBuf::default();
    let mut vm = Vm::with_streams(
        VmOptions::default(),
        Box::new(out.clone()),
        Box::new(err.clone()),
    );

    assert_eq!(vm.interpret("print missing;"), InterpretResult::RuntimeError);
    assert_eq!(vm.interpret("print 1 + 2;"), InterpretResult::Ok);
    assert_eq!(out.contents(), "3\n");
}

#[test]
fn globals_persist_across_interprets() {
    let out = SharedBuf::default();
    let err = SharedBuf::default();
    let mut vm = Vm::with_streams(
        VmOptions::default(),
        Box::new(out.clone()),
        Box::new(err.clone()),
    );

    assert_eq!(vm.interpret("var x = 40;"), InterpretResult::Ok);
    assert_eq!(vm.interpret("print x + 2;"), InterpretResult::Ok);
    assert_eq!(out.contents(), "42\n");
}

#[test]
fn compile_errors_are_reported_not_run() {
    let (result, out, err) = run("print 1");
    assert_eq!(result, InterpretResult::CompileError);
    assert_eq!(out, "");
    assert!(err.contains("[line 1] Error at end: Expect ';' after value."), "got: {}", err);
}

#[test]
fn stress_gc_does_not_change_observable_behavior() {
    let options = VmOptions {
        stress_gc: true,
        ..VmOptions::default()
    };
    let source = "\
        class Node { init(value) { this.value = value; this.next = nil; } }\n\
        fun chain(n) {\n\
          var head = Node(0);\n\
          var tail = head;\n\
          for (var i = 1; i < n; i = i + 1) {\n\
            tail.next = Node(i);\n\
            tail = tail.next;\n\
          }\n\
          return head;\n\
        }\n\
        var list = chain(20);\n\
        var total = 0;\n\
        while (list != nil) { total = total + list.value; list = list.next; }\n\
        print total;\n\
        fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; }\n\
        var f = make();\n\
        f(); f();\n\
        print f();\n\
        print \"gc\" + \"-\" + \"safe\";\n";
    let (result, out, err) = run_with(options, source);
    assert_eq!(result, InterpretResult::Ok, "stderr: {}", err);
    assert_eq!(out, "190\n3\ngc-safe\n");
}

#[test]
fn long_running_loops_trigger_collections_naturally() {
    // Enough instance churn to pass the first collection threshold; the
    // garbage from early iterations must be reclaimed without touching the
    // chain still reachable through the global.
    let source = "\
        class Node { init(v) { this.v = v; } }\n\
        var keep = Node(0);\n\
        for (var i = 0; i < 30000; i = i + 1) { keep.v = Node(i); }\n\
        print keep.v.v;\n";
    assert_prints(source, "29999\n");
}
