// Integration tests driving the compiler and VM together through the
// public `rulox` crate, exactly as `main.rs` does for a script file.
// Output is captured through the injectable sink instead of stdout, so
// tests don't race each other's output.

use std::cell::RefCell;
use std::rc::Rc;

use rulox::vm::{InterpretError, Vm};

fn run_ok(source: &str) -> String {
    let output = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::with_output(output.clone());
    match vm.interpret(source) {
        Ok(()) => {}
        Err(InterpretError::Compile(_)) => panic!("unexpected compile error for: {}", source),
        Err(InterpretError::Runtime(e)) => panic!("unexpected runtime error: {}", e),
    }
    String::from_utf8(output.borrow().clone()).unwrap()
}

fn expect_compile_error(source: &str) {
    let output = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::with_output(output);
    match vm.interpret(source) {
        Err(InterpretError::Compile(_)) => {}
        other => panic!("expected a compile error, got {:?}", other.is_ok()),
    }
}

fn expect_runtime_error(source: &str) -> rulox::errors::RuntimeError {
    let output = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::with_output(output);
    match vm.interpret(source) {
        Err(InterpretError::Runtime(e)) => e,
        other => panic!("expected a runtime error, got {:?}", other.is_ok()),
    }
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run_ok("print \"hi\" + \"!\";"), "hi!\n");
}

#[test]
fn while_loop() {
    assert_eq!(run_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"), "0\n1\n2\n");
}

#[test]
fn for_loop_desugaring_runs_init_test_body_increment_test() {
    let src = "for (var i = 2; i < 5; i = i + 1) { print i; }";
    assert_eq!(run_ok(src), "2\n3\n4\n");
}

#[test]
fn closures_capture_and_mutate_shared_upvalues() {
    let src = "fun counter() { var n = 0; fun next() { n = n + 1; return n; } return next; } \
               var c = counter(); print c(); print c(); print c();";
    assert_eq!(run_ok(src), "1\n2\n3\n");
}

#[test]
fn classes_methods_and_this() {
    let src = r#"class Greeter { greet() { print "hi " + this.who; } }
                 var g = Greeter(); g.who = "lox"; g.greet();"#;
    assert_eq!(run_ok(src), "hi lox\n");
}

#[test]
fn inheritance_super_call_chains_to_parent_method() {
    let src = r#"class Base { greet() { print "hi " + this.who; } }
                 class Sub < Base { greet() { super.greet(); print "!"; } }
                 var s = Sub(); s.who = "sub"; s.greet();"#;
    assert_eq!(run_ok(src), "hi sub\n!\n");
}

#[test]
fn reading_a_local_in_its_own_initializer_is_a_compile_error() {
    expect_compile_error("{ var a = a; }");
}

#[test]
fn returning_a_value_from_top_level_code_is_a_compile_error() {
    expect_compile_error("return 1;");
}

#[test]
fn subtracting_a_string_from_a_number_is_a_runtime_type_error_with_one_frame() {
    let err = expect_runtime_error("\"a\" - 1;");
    assert_eq!(err.message, "Operands must be numbers.");
    assert_eq!(err.frames.len(), 1);
    assert_eq!(err.frames[0].name, "script");
}

#[test]
fn unbounded_recursion_overflows_the_call_stack() {
    let err = expect_runtime_error("fun recurse() { return recurse(); } recurse();");
    assert_eq!(err.message, "Stack overflow.");
}

#[test]
fn undefined_global_is_a_runtime_error() {
    let err = expect_runtime_error("print nope;");
    assert_eq!(err.message, "Undefined variable 'nope'.");
}

#[test]
fn calling_a_non_callable_value_is_a_runtime_error() {
    let err = expect_runtime_error("var x = 1; x();");
    assert_eq!(err.message, "Can only call functions and classes.");
}

#[test]
fn field_access_on_a_non_instance_is_a_runtime_error() {
    let err = expect_runtime_error("var x = 1; print x.y;");
    assert_eq!(err.message, "Only instances have properties.");
}

#[test]
fn clock_native_is_callable_and_returns_a_number() {
    let output = run_ok("print clock() >= 0;");
    assert_eq!(output, "true\n");
}

#[test]
fn calling_a_native_with_the_wrong_arity_is_a_runtime_error() {
    let err = expect_runtime_error("clock(1);");
    assert_eq!(err.message, "Expected 0 arguments but got 1.");
}

#[test]
fn nil_and_false_are_the_only_falsey_values() {
    assert_eq!(run_ok("print !nil; print !false; print !0; print !\"\";"), "true\ntrue\nfalse\nfalse\n");
}
