use coil::{CodeBuilder, CompareOp, Const, Object, Opcode, Runner};
use criterion::{Bencher, Criterion, black_box, criterion_group, criterion_main};

fn konst(b: &mut CodeBuilder, value: Const) {
    let index = b.add_const(value);
    b.emit_arg(Opcode::LoadConst, index);
}

fn name(b: &mut CodeBuilder, op: Opcode, ident: &str) {
    let index = b.add_name(ident);
    b.emit_arg(op, index);
}

/// `for i in range(n): <body>` around the instructions emitted by `body`.
fn range_loop(b: &mut CodeBuilder, n: i64, body: impl FnOnce(&mut CodeBuilder)) {
    let after = b.emit_jump(Opcode::SetupLoop);
    name(b, Opcode::LoadName, "range");
    konst(b, Const::Int(n));
    b.emit_call(Opcode::CallFunction, 1, 0);
    b.emit(Opcode::GetIter);
    let top = b.current_offset();
    let done = b.emit_jump(Opcode::ForIter);
    name(b, Opcode::StoreName, "i");
    body(b);
    b.emit_jump_to(Opcode::JumpAbsolute, top);
    b.patch_jump(done);
    b.emit(Opcode::PopBlock);
    b.patch_jump(after);
}

/// Runs once to check the result, then measures repeated runs.
fn run_coil(bench: &mut Bencher, runner: &Runner, expected: &Object) {
    let r = runner.run(coil::NoLimitTracker, &mut coil::NoPrint).unwrap();
    assert_eq!(&r, expected);

    bench.iter(|| {
        let r = runner.run(coil::NoLimitTracker, &mut coil::NoPrint).unwrap();
        black_box(r);
    });
}

/// `total = 0; for i in range(n): total = total + i; return total`
fn sum_loop(n: i64) -> Runner {
    let mut b = CodeBuilder::new("<module>");
    konst(&mut b, Const::Int(0));
    name(&mut b, Opcode::StoreName, "total");
    range_loop(&mut b, n, |b| {
        name(b, Opcode::LoadName, "total");
        name(b, Opcode::LoadName, "i");
        b.emit(Opcode::BinaryAdd);
        name(b, Opcode::StoreName, "total");
    });
    name(&mut b, Opcode::LoadName, "total");
    b.emit(Opcode::ReturnValue);
    Runner::new(b.build()).unwrap()
}

/// `d = {}; for i in range(n): d[i] = i; return len(d)`, then looks every key up again.
fn dict_fill(n: i64) -> Runner {
    let mut b = CodeBuilder::new("<module>");
    b.emit_arg(Opcode::BuildMap, 0u32);
    name(&mut b, Opcode::StoreName, "d");
    range_loop(&mut b, n, |b| {
        name(b, Opcode::LoadName, "i");
        name(b, Opcode::LoadName, "d");
        name(b, Opcode::LoadName, "i");
        b.emit(Opcode::StoreSubscr);
    });
    range_loop(&mut b, n, |b| {
        name(b, Opcode::LoadName, "i");
        name(b, Opcode::LoadName, "d");
        name(b, Opcode::LoadName, "i");
        b.emit(Opcode::BinarySubscr);
        b.emit_arg(Opcode::CompareOp, CompareOp::Eq as u32);
        b.emit(Opcode::PopTop);
    });
    name(&mut b, Opcode::LoadName, "len");
    name(&mut b, Opcode::LoadName, "d");
    b.emit_call(Opcode::CallFunction, 1, 0);
    b.emit(Opcode::ReturnValue);
    Runner::new(b.build()).unwrap()
}

/// Repeated squaring of a big integer, returning the bit length as a truthiness check.
fn bignum_mul(rounds: i64) -> Runner {
    let mut b = CodeBuilder::new("<module>");
    konst(&mut b, Const::BigInt("123456789012345678901234567890".to_owned()));
    name(&mut b, Opcode::StoreName, "x");
    range_loop(&mut b, rounds, |b| {
        name(b, Opcode::LoadName, "x");
        name(b, Opcode::LoadName, "x");
        b.emit(Opcode::BinaryMultiply);
        name(b, Opcode::StoreName, "x");
    });
    name(&mut b, Opcode::LoadName, "x");
    konst(&mut b, Const::Int(0));
    b.emit_arg(Opcode::CompareOp, CompareOp::Gt as u32);
    b.emit(Opcode::ReturnValue);
    Runner::new(b.build()).unwrap()
}

/// `def f(n): return n + 1`, called `n` times.
fn call_overhead(n: i64) -> Runner {
    let mut f = CodeBuilder::new("f");
    f.set_flags(coil::Code::NEWLOCALS);
    f.set_args(&["n"]);
    let arg = f.add_varname("n");
    f.emit_arg(Opcode::LoadFast, arg);
    konst(&mut f, Const::Int(1));
    f.emit(Opcode::BinaryAdd);
    f.emit(Opcode::ReturnValue);

    let mut b = CodeBuilder::new("<module>");
    konst(&mut b, Const::Code(Box::new(f.build())));
    b.emit_arg(Opcode::MakeFunction, 0u32);
    name(&mut b, Opcode::StoreName, "f");
    range_loop(&mut b, n, |b| {
        name(b, Opcode::LoadName, "f");
        name(b, Opcode::LoadName, "i");
        b.emit_call(Opcode::CallFunction, 1, 0);
        b.emit(Opcode::PopTop);
    });
    konst(&mut b, Const::None);
    b.emit(Opcode::ReturnValue);
    Runner::new(b.build()).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let runner = sum_loop(10_000);
    c.bench_function("sum_loop", |b| run_coil(b, &runner, &Object::Int(49_995_000)));

    let runner = dict_fill(5_000);
    c.bench_function("dict_fill_lookup", |b| run_coil(b, &runner, &Object::Int(5_000)));

    let runner = bignum_mul(8);
    c.bench_function("bignum_mul", |b| run_coil(b, &runner, &Object::Bool(true)));

    let runner = call_overhead(5_000);
    c.bench_function("call_overhead", |b| run_coil(b, &runner, &Object::None));

    let code = dict_fill(100).code().clone();
    c.bench_function("validate", |b| b.iter(|| black_box(&code).validate().unwrap()));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
