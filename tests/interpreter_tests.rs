// End-to-end tests driving the public `run_source` pipeline. These exercise
// the full compile -> execute path the CLI uses, not individual modules.

use loxvm::errors::ErrorKind;
use loxvm::vm::{InterpretError, Vm};

fn interpret(source: &str) -> Result<(), InterpretError> {
    Vm::new().interpret(source)
}

#[test]
fn arithmetic_follows_precedence() {
    assert!(interpret("print 1 + 2 * 3;").is_ok());
}

#[test]
fn strings_concatenate() {
    assert!(interpret("var a = \"foo\"; var b = \"bar\"; print a + b;").is_ok());
}

#[test]
fn closures_capture_and_mutate_shared_state() {
    let source = "
        fun make(n) {
            fun inc() {
                n = n + 1;
                return n;
            }
            return inc;
        }
        var c = make(10);
        print c();
        print c();
        print c();
    ";
    assert!(interpret(source).is_ok());
}

#[test]
fn subclass_methods_can_call_super() {
    let source = "
        class A { greet() { print \"hi\"; } }
        class B < A { greet() { super.greet(); print \"bye\"; } }
        B().greet();
    ";
    assert!(interpret(source).is_ok());
}

#[test]
fn initializer_sets_instance_fields() {
    let source = "
        class Box { init(v) { this.v = v; } }
        var b = Box(42);
        print b.v;
    ";
    assert!(interpret(source).is_ok());
}

#[test]
fn for_loop_accumulates_a_sum() {
    let source = "
        var s = 0;
        for (var i = 1; i <= 100; i = i + 1) s = s + i;
        print s;
    ";
    assert!(interpret(source).is_ok());
}

#[test]
fn reading_a_local_in_its_own_initializer_is_a_compile_error() {
    match interpret("{ var a = a; }") {
        Err(InterpretError::Compile(errors)) => {
            assert!(errors.iter().any(|e| e.message.contains("own initializer")));
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn returning_a_value_at_top_level_is_a_compile_error() {
    match interpret("return 1;") {
        Err(InterpretError::Compile(_)) => {}
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn a_class_inheriting_from_itself_is_a_compile_error() {
    match interpret("class Foo < Foo {}") {
        Err(InterpretError::Compile(_)) => {}
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn adding_a_string_and_a_number_is_a_runtime_error() {
    match interpret("\"a\" + 1;") {
        Err(InterpretError::Runtime(_)) => {}
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn calling_an_undefined_global_is_a_runtime_error() {
    match interpret("undefined();") {
        Err(InterpretError::Runtime(_)) => {}
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn diagnostics_report_the_right_kind() {
    use loxvm::errors::LoxError;

    let errors = LoxError::from_interpret_error(interpret("\"a\" + 1;").unwrap_err());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::Runtime);

    let errors = LoxError::from_interpret_error(interpret("class Foo < Foo {}").unwrap_err());
    assert!(errors.iter().all(|e| e.kind == ErrorKind::Compile));
}
