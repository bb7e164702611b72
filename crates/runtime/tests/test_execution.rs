//! End-to-end tests: source text through the compiler and the VM, asserting
//! on the program output captured from the `debug`/`print` sink.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use koji_runtime::{stdlib, Koji, KojiError, KojiType};

/// A cloneable capture sink for program output.
#[derive(Clone, Default)]
struct Capture(Rc<RefCell<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), KojiError>, String, Koji) {
    let mut koji = Koji::new();
    stdlib::install(&mut koji).unwrap();
    let capture = Capture::default();
    koji.set_output(Box::new(capture.clone()));
    let result = koji.load_str(source).and_then(|()| koji.run());
    (result, capture.contents(), koji)
}

fn run_ok(source: &str) -> String {
    let (result, output, _koji) = run(source);
    result.unwrap();
    output
}

#[test]
fn arithmetic_constant_folding() {
    assert_eq!(run_ok("var a = 1 + 2 * 3\ndebug(a)"), "7\n");
}

#[test]
fn string_concatenation_folded_and_at_runtime() {
    assert_eq!(run_ok("var s = \"foo\" + \"bar\"\ndebug(s)"), "foobar\n");
    assert_eq!(
        run_ok("var a = \"ab\"\nvar b = a + \"cd\"\ndebug(b)"),
        "abcd\n"
    );
}

#[test]
fn string_repetition_at_runtime() {
    assert_eq!(run_ok("var a = \"ab\"\ndebug(a * 3)"), "ababab\n");
}

#[test]
fn table_fields() {
    let output = run_ok("var t = {}\nt.x = 10\nt.y = t.x + 5\ndebug(t.y)");
    assert_eq!(output, "15\n");
}

#[test]
fn table_literal_and_indexing() {
    assert_eq!(
        run_ok("var t = { x: 1, y: 2 }\ndebug(t.x + t.y)"),
        "3\n"
    );
    assert_eq!(
        run_ok("var t = { 10, 20, 30 }\ndebug(t[0] + t[2])"),
        "40\n"
    );
}

#[test]
fn short_circuit_condition() {
    assert_eq!(
        run_ok("if (1 < 2 && 3 > 2) debug(\"ok\") else debug(\"no\")"),
        "ok\n"
    );
    assert_eq!(
        run_ok("var a = 1\nif (a > 1 || a < 0) debug(\"no\") else debug(\"ok\")"),
        "ok\n"
    );
}

#[test]
fn negated_short_circuit_condition() {
    let source = "var a = false\nvar b = true\n\
                  if (!a && b) debug(\"yes\") else debug(\"no\")";
    assert_eq!(run_ok(source), "yes\n");
    let source = "var a = true\nvar b = true\n\
                  if (!a && b) debug(\"yes\") else debug(\"no\")";
    assert_eq!(run_ok(source), "no\n");
}

#[test]
fn negated_short_circuit_value() {
    assert_eq!(
        run_ok("var a = false\nvar b = 9\nvar c = !a && b\ndebug(c)"),
        "9\n"
    );
}

#[test]
fn short_circuit_value() {
    assert_eq!(run_ok("var a = false\nvar b = a || 5\ndebug(b)"), "5\n");
    assert_eq!(run_ok("var a = 3\nvar b = a && 7\ndebug(b)"), "7\n");
}

#[test]
fn while_loop() {
    assert_eq!(
        run_ok("var i = 0\nwhile (i < 3) { debug(i)\ni = i + 1 }"),
        "0\n1\n2\n"
    );
}

#[test]
fn do_while_loop_runs_once() {
    assert_eq!(
        run_ok("var i = 10\ndo { debug(i)\ni = i + 1 } while (i < 3)"),
        "10\n"
    );
}

#[test]
fn function_call_and_return() {
    assert_eq!(
        run_ok("func add(a, b) { return a + b }\ndebug(add(2, 40))"),
        "42\n"
    );
}

#[test]
fn arrow_function_returns_its_expression() {
    assert_eq!(
        run_ok("func double(x) => x * 2\ndebug(double(21))"),
        "42\n"
    );
}

#[test]
fn nested_calls_through_globals() {
    // Functions see only their own locals and the globals; the inner
    // function reaches `add` through the globals table.
    let source = "globals.add = func (a, b) => a + b\n\
                  func twice(x) { return globals.add(x, x) }\n\
                  debug(twice(globals.add(1, 2)))";
    assert_eq!(run_ok(source), "6\n");
}

#[test]
fn outer_locals_are_not_captured() {
    let (result, _, _) = run("var a = 1\nfunc f() { return a }");
    assert!(matches!(result, Err(KojiError::Compile(_))));
}

#[test]
fn method_call_gets_receiver_as_this() {
    let source = "var t = { val: 7 }\n\
                  t.get_val = func () => this.val\n\
                  debug(t.get_val())";
    assert_eq!(run_ok(source), "7\n");
}

#[test]
fn method_call_falls_back_to_metatable() {
    let source = "var base = {}\n\
                  base.answer = func () => 42\n\
                  var t = {}\n\
                  set_metatable(t, base)\n\
                  debug(t.answer())";
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn get_metatable_round_trips() {
    let source = "var base = { tag: 9 }\n\
                  var t = {}\n\
                  set_metatable(t, base)\n\
                  debug(get_metatable(t).tag)";
    assert_eq!(run_ok(source), "9\n");
}

#[test]
fn globals_round_trip() {
    assert_eq!(run_ok("globals.x = 10\ndebug(globals.x)"), "10\n");
}

#[test]
fn globals_persist_across_loads() {
    let mut koji = Koji::new();
    stdlib::install(&mut koji).unwrap();
    let capture = Capture::default();
    koji.set_output(Box::new(capture.clone()));

    koji.load_str("globals.counter = 41").unwrap();
    koji.run().unwrap();
    koji.load_str("globals.counter += 1\ndebug(globals.counter)")
        .unwrap();
    koji.run().unwrap();
    assert_eq!(capture.contents(), "42\n");
}

#[test]
fn compound_assignment() {
    assert_eq!(run_ok("var a = 40\na += 2\ndebug(a)"), "42\n");
    assert_eq!(
        run_ok("var t = { n: 6 }\nt.n *= 7\ndebug(t.n)"),
        "42\n"
    );
}

#[test]
fn stdlib_print_and_len() {
    assert_eq!(run_ok("print(\"hello\", 1, true)"), "hello 1 true\n");
    assert_eq!(run_ok("debug(len(\"hello\"))"), "5\n");
    assert_eq!(
        run_ok("var t = { a: 1, b: 2 }\ndebug(len(t))"),
        "2\n"
    );
}

#[test]
fn string_byte_indexing() {
    assert_eq!(run_ok("var s = \"abc\"\ndebug(s[1])"), "98\n");
}

#[test]
fn unary_operators() {
    assert_eq!(run_ok("var a = 5\ndebug(-a)"), "-5\n");
    assert_eq!(run_ok("var a = false\ndebug(!a)"), "true\n");
}

#[test]
fn throw_surfaces_as_runtime_error() {
    let (result, _, koji) = run("throw \"boom\"");
    match result {
        Err(KojiError::Runtime(message)) => assert_eq!(message, "boom"),
        other => panic!("expected a runtime error, got {other:?}"),
    }
    // The diagnostic is also on top of the value stack.
    assert_eq!(koji.str_at(-1), Some("boom"));
}

#[test]
fn runtime_type_error_reports_operator() {
    let source = "var t = {}\nvar x = t + 1";
    let (result, _, _) = run(source);
    match result {
        Err(KojiError::Runtime(message)) => {
            assert!(message.contains("add"), "unexpected message: {message}")
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn faulted_state_stays_invalid() {
    let (result, _, mut koji) = run("throw \"first\"");
    assert!(result.is_err());
    match koji.run() {
        Err(KojiError::Runtime(message)) => assert!(message.contains("invalid")),
        other => panic!("expected an invalid-state error, got {other:?}"),
    }
}

#[test]
fn wrong_argument_count_is_a_runtime_error() {
    let (result, _, _) = run("func f(a) { return a }\nf(1, 2)");
    match result {
        Err(KojiError::Runtime(message)) => assert!(message.contains("arguments")),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn static_function_argument_counts_check_at_compile_time() {
    let (result, _, _) = run("debug(len(\"a\", \"b\"))");
    match result {
        Err(KojiError::Compile(message)) => assert!(message.contains("len")),
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn compile_error_leaves_diagnostic_on_stack() {
    let (result, _, koji) = run("var a = ");
    match result {
        Err(KojiError::Compile(message)) => {
            assert_eq!(koji.str_at(-1), Some(message.as_str()));
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn redefining_a_static_function_fails() {
    let mut koji = Koji::new();
    stdlib::install(&mut koji).unwrap();
    match stdlib::install(&mut koji) {
        Err(KojiError::Fail(message)) => assert!(message.contains("already defined")),
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[test]
fn value_stack_balances_after_a_run() {
    let (result, _, koji) = run("var a = 1\nvar t = {}\nt.x = a\ndebug(t.x)");
    result.unwrap();
    assert_eq!(koji.stack_len(), 0);
}

#[test]
fn closing_a_state_releases_every_allocation() {
    let heap = {
        let source = "var t = { name: \"koji\" }\n\
                      t.hello = func () => this.name + \"!\"\n\
                      globals.kept = t.hello()\n\
                      debug(globals.kept)";
        let (result, output, koji) = run(source);
        result.unwrap();
        assert_eq!(output, "koji!\n");
        koji.heap().clone()
    };
    assert_eq!(heap.live_allocations(), 0);
}

#[test]
fn load_file_runs_a_script() {
    use std::io::Write as _;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "debug(2 + 3)").unwrap();

    let mut koji = Koji::new();
    stdlib::install(&mut koji).unwrap();
    let capture = Capture::default();
    koji.set_output(Box::new(capture.clone()));
    koji.load_file(file.path()).unwrap();
    koji.run().unwrap();
    assert_eq!(capture.contents(), "5\n");
}

#[test]
fn load_file_missing_reports_compile_error() {
    let mut koji = Koji::new();
    let result = koji.load_file(std::path::Path::new("/definitely/not/here.koji"));
    assert!(matches!(result, Err(KojiError::Compile(_))));
}

#[test]
fn host_values_on_the_stack() {
    let mut koji = Koji::new();
    koji.push_number(4.25);
    koji.push_str("hi").unwrap();
    assert_eq!(koji.value_type(-1), Some(KojiType::String));
    assert_eq!(koji.value_type(-2), Some(KojiType::Number));
    assert_eq!(koji.str_at(-1), Some("hi"));
    assert_eq!(koji.str_len(-1), Some(2));
    assert_eq!(koji.to_number(-2), Some(4.25));
    koji.pop(2);
    assert_eq!(koji.stack_len(), 0);
}

#[test]
fn set_global_from_host() {
    let mut koji = Koji::new();
    stdlib::install(&mut koji).unwrap();
    let capture = Capture::default();
    koji.set_output(Box::new(capture.clone()));

    koji.push_number(42.0);
    koji.set_global("answer").unwrap();
    koji.load_str("debug(globals.answer)").unwrap();
    koji.run().unwrap();
    assert_eq!(capture.contents(), "42\n");
}

#[test]
fn for_in_parses_and_skips_its_body() {
    assert_eq!(
        run_ok("var t = {}\nfor (var x in t) debug(x)\ndebug(\"done\")"),
        "done\n"
    );
}

#[test]
fn comparison_materializes_when_assigned() {
    assert_eq!(run_ok("var a = 1\nvar b = a < 2\ndebug(b)"), "true\n");
    assert_eq!(run_ok("var a = 1\nvar b = a > 2\ndebug(b)"), "false\n");
}

#[test]
fn debug_prints_multiple_values() {
    assert_eq!(run_ok("debug(1, \"two\", true, nil)"), "1 two true nil\n");
}

#[test]
fn comparison_trichotomy() {
    // For two distinct numbers exactly one of <, ==, > holds.
    let source = "var a = 1\nvar b = 2\n\
                  debug(a < b, a == b, a > b)\n\
                  debug(b < a, b == b, b <= a)";
    assert_eq!(run_ok(source), "true false false\nfalse true false\n");
}

#[test]
fn disassembly_of_a_loaded_program() {
    let mut koji = Koji::new();
    koji.load_str("var a = 1 + 2").unwrap();
    let listing = koji.disassemble_loaded().unwrap();
    assert!(listing.contains("prototype"));
    assert!(listing.contains("ret"));
}
