//! End-to-end language scenarios, run through the public `run_string` entry
//! point exactly as the CLI invokes it.

use vm::{run_string, ExitStatus};

fn run(source: &str) -> (bool, String, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut stdin: &[u8] = &[];
    let status = run_string(source, &mut stdout, &mut stderr, &mut stdin, false);
    (
        matches!(status, ExitStatus::Ok),
        String::from_utf8(stdout).unwrap(),
        String::from_utf8(stderr).unwrap(),
    )
}

#[test]
fn scenario_arithmetic() {
    let (ok, out, _) = run("print 1 + 2;");
    assert!(ok);
    assert_eq!(out, "3\n");
}

#[test]
fn scenario_function_call() {
    let (ok, out, _) = run("fun f(x) { return x * x; } print f(5);");
    assert!(ok);
    assert_eq!(out, "25\n");
}

#[test]
fn scenario_closures() {
    let source = "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
                  var c = make(); print c(); print c(); print c();";
    let (ok, out, _) = run(source);
    assert!(ok);
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn scenario_inheritance_with_super() {
    let source = "class A { greet() { print \"A\"; } } \
                  class B < A { greet() { super.greet(); print \"B\"; } } \
                  B().greet();";
    let (ok, out, _) = run(source);
    assert!(ok);
    assert_eq!(out, "A\nB\n");
}

#[test]
fn scenario_runtime_type_error() {
    let (ok, _, err) = run("print 1 + \"a\";");
    assert!(!ok);
    assert!(err.contains("Operands must be two numbers or two strings."));
}

#[test]
fn scenario_undefined_global() {
    let (ok, _, err) = run("print x;");
    assert!(!ok);
    assert!(err.contains("Undefined variable 'x'."));
}

#[test]
fn boundary_255_parameters_compiles() {
    let params = (0..255).map(|i| format!("p{i}")).collect::<Vec<_>>().join(", ");
    let source = format!("fun f({params}) {{ return p0; }} print f({});", (0..255).map(|i| i.to_string()).collect::<Vec<_>>().join(", "));
    let (ok, out, _) = run(&source);
    assert!(ok);
    assert_eq!(out, "0\n");
}

#[test]
fn boundary_256_parameters_is_a_compile_error() {
    let params = (0..256).map(|i| format!("p{i}")).collect::<Vec<_>>().join(", ");
    let source = format!("fun f({params}) {{ return 0; }}");
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut stdin: &[u8] = &[];
    let status = run_string(&source, &mut stdout, &mut stderr, &mut stdin, false);
    assert!(matches!(status, ExitStatus::CompileError));
    let err = String::from_utf8(stderr).unwrap();
    assert!(err.contains("Can't have more than 255 parameters."));
}

#[test]
fn boundary_arity_mismatch_is_a_runtime_error() {
    let (ok, _, err) = run("fun f(a, b) { return a + b; } f(1);");
    assert!(!ok);
    assert!(err.contains("Expected 2 arguments but got 1."));
}

#[test]
fn boundary_stack_overflow_on_unbounded_recursion() {
    let (ok, _, err) = run("fun recurse() { return recurse(); } recurse();");
    assert!(!ok);
    assert!(err.contains("Stack overflow."));
}

#[test]
fn string_identity_equal_literals_compare_equal() {
    let (ok, out, _) = run("print \"abc\" == \"abc\";");
    assert!(ok);
    assert_eq!(out, "true\n");
}

#[test]
fn stack_is_empty_and_output_unaffected_under_stress_gc() {
    let source = "class Pair { init(a, b) { this.a = a; this.b = b; } sum() { return this.a + this.b; } } \
                  fun build(n) { var i = 0; var last = nil; while (i < n) { last = Pair(i, i + 1); i = i + 1; } return last; } \
                  print build(200).sum();";
    let mut stdout_normal = Vec::new();
    let mut stderr_normal = Vec::new();
    let mut stdin: &[u8] = &[];
    run_string(source, &mut stdout_normal, &mut stderr_normal, &mut stdin, false);

    let mut stdout_stress = Vec::new();
    let mut stderr_stress = Vec::new();
    let mut stdin: &[u8] = &[];
    run_string(source, &mut stdout_stress, &mut stderr_stress, &mut stdin, true);

    assert_eq!(stdout_normal, stdout_stress);
}

#[test]
fn natives_clock_chr_ord_round_trip() {
    let source = "print ord(chr(65)); print clock() >= 0;";
    let (ok, out, _) = run(source);
    assert!(ok);
    assert_eq!(out, "65\ntrue\n");
}

#[test]
fn natives_ord_reads_the_first_raw_byte_not_the_first_codepoint() {
    // "é" encodes in UTF-8 as the two bytes 0xC3 0xA9 (195, 169). ord must
    // return the raw first byte (195), not the codepoint (233).
    let (ok, out, _) = run("print ord(\"\u{e9}clair\");");
    assert!(ok);
    assert_eq!(out, "195\n");
}

#[test]
fn natives_chr_is_byte_valued_and_rejects_out_of_range_input() {
    let (ok, out, _) = run("print ord(chr(195)) == 195;");
    assert!(ok);
    assert_eq!(out, "true\n");

    let (ok, _, err) = run("chr(256);");
    assert!(!ok);
    assert!(err.contains("is not a valid byte value"));
}
