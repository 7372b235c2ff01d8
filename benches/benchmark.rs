use criterion::{black_box, criterion_group, criterion_main, Criterion};

use alox::{SharedWriter, Vm};

const FIB: &str = "\
fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }
print fib(18);
";

const STRING_EQUALITY: &str = "\
var i = 0;
while (i < 2000) {
    var a = \"ab\" + \"cd\";
    if (a == \"abcd\") { i = i + 1; }
}
";

const INSTANTIATION: &str = "\
class Point { init(x, y) { this.x = x; this.y = y; } }
var i = 0;
while (i < 2000) {
    var p = Point(i, i);
    i = p.x + 1;
}
";

const LISTS: &str = "\
var xs = [];
for (var i = 0; i < 2000; i = i + 1) { append(xs, i); }
var sum = 0;
for (var i = 0; i < len(xs); i = i + 1) { sum = sum + xs[i]; }
print sum;
";

fn bench_core(c: &mut Criterion, input: &str, name: &str) {
    c.bench_function(name, move |b| {
        b.iter(|| {
            let mut vm = Vm::with_output(SharedWriter::new(std::io::sink()));
            vm.interpret(black_box(input)).unwrap();
        })
    });
}

fn bench_fib(c: &mut Criterion) {
    bench_core(c, FIB, "fib");
}

fn bench_string_equality(c: &mut Criterion) {
    bench_core(c, STRING_EQUALITY, "string_equality");
}

fn bench_instantiation(c: &mut Criterion) {
    bench_core(c, INSTANTIATION, "instantiation");
}

fn bench_lists(c: &mut Criterion) {
    bench_core(c, LISTS, "lists");
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_fib,
              bench_string_equality,
              bench_instantiation,
              bench_lists
);
criterion_main!(benches);
