mod common;
use common::*;

use rstest::rstest;

#[rstest]
#[case::add_mul("print 1 + 2 * 3;", "7\n")]
#[case::grouping("print (1 + 2) * 3;", "9\n")]
#[case::modulo("print 10 % 4;", "2\n")]
#[case::unary("print -(1 + 2);", "-3\n")]
#[case::comparison("print 1 < 2; print 2 <= 2; print 3 > 4; print 4 >= 5;", "true\ntrue\nfalse\nfalse\n")]
#[case::equality("print 1 == 1.0; print \"a\" != \"b\"; print nil == nil;", "true\ntrue\ntrue\n")]
#[case::nan("print (0/0) == (0/0);", "false\n")]
#[case::falsiness("print !nil; print !false; print !0; print !\"\";", "true\ntrue\nfalse\nfalse\n")]
fn operators(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_program(source).unwrap(), expected);
}

#[rstest]
#[case::concat("var a = \"he\"; var b = \"llo\"; print a + b;", "hello\n")]
#[case::interning("print \"he\" + \"llo\" == \"hello\";", "true\n")]
#[case::index("print \"abc\"[0]; print \"abc\"[2];", "a\nc\n")]
fn strings(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_program(source).unwrap(), expected);
}

#[rstest]
#[case::fib(
    "fun fib(n){ if (n<2) return n; return fib(n-1)+fib(n-2);} print fib(10);",
    "55\n"
)]
#[case::implicit_nil("fun f() {} print f();", "nil\n")]
#[case::early_return("fun f() { return 1; print 2; } print f();", "1\n")]
#[case::higher_order(
    "fun twice(f, x) { return f(f(x)); } fun inc(n) { return n + 1; } print twice(inc, 5);",
    "7\n"
)]
fn functions(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_program(source).unwrap(), expected);
}

#[test]
fn counter_closure() {
    let source = "
        var c = 0;
        fun mk(){ fun inc(){ c = c + 1; return c; } return inc;}
        var f = mk();
        print f(); print f(); print f();
    ";
    assert_eq!(run_program(source).unwrap(), "1\n2\n3\n");
}

#[test]
fn closures_close_over_loop_variables() {
    let source = "
        var fns = [];
        {
            var i = 0;
            while (i < 3) {
                var j = i;
                fun get() { return j; }
                append(fns, get);
                i = i + 1;
            }
        }
        print fns[0]() + fns[1]() + fns[2]();
    ";
    assert_eq!(run_program(source).unwrap(), "3\n");
}

#[rstest]
#[case::init_and_method(
    "class C { init(x){ this.x = x; } g(){ return this.x + 1; }} print C(41).g();",
    "42\n"
)]
#[case::super_call(
    "class A { greet(){ print \"A\"; }} class B < A { greet(){ super.greet(); print \"B\"; }} B().greet();",
    "A\nB\n"
)]
#[case::inherited_method(
    "class A { m() { return \"from A\"; } } class B < A { } print B().m();",
    "from A\n"
)]
#[case::fields("class Box {} var b = Box(); b.v = 3; b.v = b.v + 1; print b.v;", "4\n")]
#[case::bound_method(
    "class C { init() { this.n = 10; } get() { return this.n; } } var m = C().get; print m();",
    "10\n"
)]
fn classes(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_program(source).unwrap(), expected);
}

#[rstest]
#[case::literal_and_index("var xs = [10, 20, 30]; print xs[1];", "20\n")]
#[case::assignment("var xs = [10, 20, 30]; xs[1] = 99; print xs[1];", "99\n")]
#[case::len("var xs = [10, 20, 30]; print len(xs);", "3\n")]
#[case::append("var xs = []; append(xs, 1); append(xs, 2); print xs;", "[1, 2]\n")]
#[case::delete("var xs = [1, 2, 3]; print delete(xs, 1); print xs;", "2\n[1, 3]\n")]
#[case::nested("var m = [[1, 2], [3, 4]]; print m[1][0];", "3\n")]
fn lists(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_program(source).unwrap(), expected);
}

#[rstest]
#[case::while_loop("var i = 0; while (i < 3) { print i; i = i + 1; }", "0\n1\n2\n")]
#[case::for_loop("for (var i = 0; i < 3; i = i + 1) print i;", "0\n1\n2\n")]
#[case::dangling_else("if (true) if (false) print 1; else print 2;", "2\n")]
#[case::and_or("print nil or \"fallback\"; print 1 and 2;", "fallback\n2\n")]
fn control_flow(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_program(source).unwrap(), expected);
}

#[test]
fn finish_joins_async_children_before_continuing() {
    let source = "finish { async { print \"a\"; } async { print \"b\"; } } print \"c\";";
    let lines = run_lines(source).unwrap();

    assert_eq!(lines.len(), 3);
    // "a" and "b" race, "c" strictly follows the join
    assert!(lines[..2].contains(&"a".to_string()));
    assert!(lines[..2].contains(&"b".to_string()));
    assert_eq!(lines[2], "c");
}

#[test]
fn async_children_snapshot_the_parent_stack() {
    let source = "
        {
            var x = \"before\";
            finish {
                async { print x; }
                x = \"after\";
            }
            print x;
        }
    ";
    assert_eq!(run_program(source).unwrap(), "before\nafter\n");
}

#[test]
fn many_async_children_all_run() {
    // more children than fit the pool at once, to force slot reuse
    let mut source = String::from("finish {\n");
    for i in 0..40 {
        source.push_str(&format!("async {{ print {}; }}\n", i));
    }
    source.push_str("}\n");

    let lines = run_lines(&source).unwrap();
    let mut printed: Vec<i64> = lines.iter().map(|l| l.parse().unwrap()).collect();
    printed.sort();
    assert_eq!(printed, (0..40).collect::<Vec<_>>());
}

#[rstest]
#[case::missing_semicolon("print 1")]
#[case::unterminated_string("var s = \"oops;")]
#[case::unexpected_character("var x = 1 @ 2;")]
#[case::return_at_top_level("return 1;")]
#[case::invalid_assignment("1 + 2 = 3;")]
#[case::self_inheritance("class A < A {}")]
#[case::this_outside_class("print this;")]
#[case::super_without_superclass("class A { m() { super.m(); } }")]
#[case::future_unsupported("var f = future;")]
fn compile_errors(#[case] source: &str) {
    let err = run_program(source).unwrap_err();
    assert!(err.contains("Static errors"), "{err}");
}

#[rstest]
#[case::undefined_variable("print missing;", "undefined variable")]
#[case::add_mismatch("print 1 + nil;", "invalid operands")]
#[case::negate_mismatch("print -\"a\";", "invalid operand")]
#[case::not_callable("var x = 1; x();", "can only call functions")]
#[case::wrong_arity("fun f(a) {} f();", "wrong number of arguments")]
#[case::bad_index("var xs = [1]; print xs[3];", "out of bounds")]
#[case::property_on_number("var x = 1; print x.field;", "only instances have properties")]
#[case::undefined_property("class C {} print C().nope;", "undefined property")]
#[case::superclass_not_class("var NotClass = 1; class B < NotClass {}", "superclass must be a class")]
fn runtime_errors(#[case] source: &str, #[case] needle: &str) {
    let err = run_program(source).unwrap_err();
    assert!(err.contains(needle), "{err}");
}

#[test]
fn frame_overflow_is_a_runtime_error() {
    let err = run_program("fun f() { f(); } f();").unwrap_err();
    assert!(err.contains("stack overflow"), "{err}");
}

#[test]
fn empty_source_is_fine() {
    assert_eq!(run_program("").unwrap(), "");
    assert_eq!(run_program("// only a comment\n").unwrap(), "");
}
