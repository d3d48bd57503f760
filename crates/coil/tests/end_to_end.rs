//! Whole programs assembled with `CodeBuilder` and run through `Interpreter`.

mod common;

use coil::{Const, ExcType, Interpreter, LimitedTracker, NoPrint, Object, Opcode, ResourceLimits};
use common::{Asm, function, module, run};
use pretty_assertions::assert_eq;

// =============================================================================
// Functions
// =============================================================================

/// `def f(a, b=2): return a + b` then `f(1)`.
#[test]
fn default_argument_fills_missing_parameter() {
    let mut body = function("f", &["a", "b"]);
    body.load_fast("a");
    body.load_fast("b");
    body.emit(Opcode::BinaryAdd);
    body.ret();

    let mut b = module();
    b.def("f", body.build(), &[Const::Int(2)]);
    b.load("f");
    b.int(1);
    b.call(1);
    b.ret();
    assert_eq!(run(&b.build()).unwrap(), Object::Int(3));
}

/// `f(1, b=10)` binds the keyword over the default.
#[test]
fn keyword_argument_overrides_default() {
    let mut body = function("f", &["a", "b"]);
    body.load_fast("a");
    body.load_fast("b");
    body.emit(Opcode::BinarySubtract);
    body.ret();

    let mut b = module();
    b.def("f", body.build(), &[Const::Int(2)]);
    b.load("f");
    b.int(1);
    b.str("b");
    b.int(10);
    b.call_kw(1, 1);
    b.ret();
    assert_eq!(run(&b.build()).unwrap(), Object::Int(-9));
}

#[test]
fn missing_argument_is_a_type_error() {
    let mut body = function("f", &["a", "b"]);
    body.load_fast("a");
    body.ret();

    let mut b = module();
    b.def("f", body.build(), &[]);
    b.load("f");
    b.call(0);
    b.ret();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::TypeError));
}

/// A function object whose defaults outnumber its parameters cannot be called.
#[test]
fn more_defaults_than_arguments_is_a_system_error() {
    let mut body = function("f", &[]);
    body.ret_none();

    let mut b = module();
    b.def("f", body.build(), &[Const::Int(1), Const::Int(2)]);
    b.load("f");
    b.call(0);
    b.ret();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::SystemError));
}

/// `def f(a, *args, **kw): return (a, args, kw['x'])`
fn collecting_function() -> coil::Code {
    let mut body = function("f", &["a"]);
    body.set_flags(coil::Code::NEWLOCALS | coil::Code::VARARGS | coil::Code::VARKEYWORDS);
    body.add_varname("args");
    body.add_varname("kw");
    body.load_fast("a");
    body.load_fast("args");
    body.load_fast("kw");
    body.str("x");
    body.emit(Opcode::BinarySubscr);
    body.emit_arg(Opcode::BuildTuple, 3u32);
    body.ret();
    body.build()
}

/// `f(1, 2, 3, x=4)`
#[test]
fn star_args_and_keywords_collect_the_rest() {
    let mut b = module();
    b.def("f", collecting_function(), &[]);
    b.load("f");
    b.int(1);
    b.int(2);
    b.int(3);
    b.str("x");
    b.int(4);
    b.call_kw(3, 1);
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![
            Object::Int(1),
            Object::Tuple(vec![Object::Int(2), Object::Int(3)]),
            Object::Int(4),
        ])
    );
}

#[test]
fn keyword_repeating_a_positional_is_a_type_error() {
    let mut b = module();
    b.def("f", collecting_function(), &[]);
    b.load("f");
    b.int(1);
    b.str("a");
    b.int(2);
    b.call_kw(1, 1);
    b.ret();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "TypeError: f() got multiple values for keyword argument 'a'"
    );
}

#[test]
fn unknown_keyword_is_a_type_error() {
    let mut body = function("f", &["a"]);
    body.load_fast("a");
    body.ret();

    let mut b = module();
    b.def("f", body.build(), &[]);
    b.load("f");
    b.int(1);
    b.str("z");
    b.int(2);
    b.call_kw(1, 1);
    b.ret();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(err.to_string(), "TypeError: f() got an unexpected keyword argument 'z'");
}

/// `def fact(n): return 1 if n < 2 else n * fact(n - 1)`; `fact(25)` needs a bignum.
#[test]
fn recursion_promotes_to_bignum() {
    let mut body = function("fact", &["n"]);
    body.load_fast("n");
    body.int(2);
    body.compare(coil::CompareOp::Lt);
    let recurse = body.emit_jump(Opcode::PopJumpIfFalse);
    body.int(1);
    body.ret();
    body.patch_jump(recurse);
    body.load_fast("n");
    body.load_global("fact");
    body.load_fast("n");
    body.int(1);
    body.emit(Opcode::BinarySubtract);
    body.call(1);
    body.emit(Opcode::BinaryMultiply);
    body.ret();

    let mut b = module();
    b.def("fact", body.build(), &[]);
    b.load("fact");
    b.int(25);
    b.call(1);
    b.ret();
    let expected: num_bigint::BigInt = "15511210043330985984000000".parse().unwrap();
    assert_eq!(run(&b.build()).unwrap(), Object::BigInt(expected));
}

#[test]
fn bignum_shrinks_back_to_native() {
    let mut b = module();
    b.int(i64::MAX);
    b.int(1);
    b.emit(Opcode::BinaryAdd);
    b.store("big");
    b.load("big");
    b.int(1);
    b.emit(Opcode::BinarySubtract);
    b.load("big");
    b.emit_arg(Opcode::BuildTuple, 2u32);
    b.ret();
    let big = num_bigint::BigInt::from(i64::MAX) + 1;
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![Object::Int(i64::MAX), Object::BigInt(big)])
    );
}

// =============================================================================
// Exceptions
// =============================================================================

/// `try: raise ValueError("x") except ValueError: pass`, then the module carries on.
#[test]
fn handled_exception_leaves_nothing_outstanding() {
    let mut b = module();
    let handler = b.emit_jump(Opcode::SetupExcept);
    b.load("ValueError");
    b.str("x");
    b.call(1);
    b.emit_arg(Opcode::RaiseVarargs, 1u32);
    b.emit(Opcode::PopBlock);
    let done = b.emit_jump(Opcode::JumpForward);
    b.patch_jump(handler);
    let reraise = b.except_match("ValueError");
    let handled = b.emit_jump(Opcode::JumpForward);
    b.patch_jump(reraise);
    b.emit(Opcode::EndFinally);
    b.patch_jump(done);
    b.patch_jump(handled);
    b.str("ok");
    b.ret();

    let mut interp = Interpreter::new_no_limits().unwrap();
    assert_eq!(interp.execute(&b.build(), &mut NoPrint).unwrap(), common::s("ok"));

    // a second program in the same interpreter sees a clean exception state
    let mut b = module();
    b.int(7);
    b.ret();
    assert_eq!(interp.execute(&b.build(), &mut NoPrint).unwrap(), Object::Int(7));
}

#[test]
fn unmatched_handler_reraises() {
    let mut b = module();
    let handler = b.emit_jump(Opcode::SetupExcept);
    b.load("TypeError");
    b.str("wrong type");
    b.call(1);
    b.emit_arg(Opcode::RaiseVarargs, 1u32);
    b.emit(Opcode::PopBlock);
    let done = b.emit_jump(Opcode::JumpForward);
    b.patch_jump(handler);
    let reraise = b.except_match("KeyError");
    let handled = b.emit_jump(Opcode::JumpForward);
    b.patch_jump(reraise);
    b.emit(Opcode::EndFinally);
    b.patch_jump(done);
    b.patch_jump(handled);
    b.ret_none();

    let err = run(&b.build()).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::TypeError));
    assert_eq!(err.to_string(), "TypeError: wrong type");
}

/// `LookupError` catches `IndexError` raised by list indexing.
#[test]
fn handler_matches_base_class() {
    let mut b = module();
    let handler = b.emit_jump(Opcode::SetupExcept);
    b.emit_arg(Opcode::BuildList, 0u32);
    b.int(3);
    b.emit(Opcode::BinarySubscr);
    b.pop();
    b.emit(Opcode::PopBlock);
    let done = b.emit_jump(Opcode::JumpForward);
    b.patch_jump(handler);
    let reraise = b.except_match("LookupError");
    b.str("caught");
    b.ret();
    b.patch_jump(reraise);
    b.emit(Opcode::EndFinally);
    b.patch_jump(done);
    b.ret_none();
    assert_eq!(run(&b.build()).unwrap(), common::s("caught"));
}

/// `for i in range(5): try: break finally: count += 1`
#[test]
fn break_through_finally_runs_it_once() {
    let mut b = module();
    b.int(0);
    b.store("count");
    let after_loop = b.emit_jump(Opcode::SetupLoop);
    b.load("range");
    b.int(5);
    b.call(1);
    b.emit(Opcode::GetIter);
    let top = b.current_offset();
    let exhausted = b.emit_jump(Opcode::ForIter);
    b.store("i");
    let finally = b.emit_jump(Opcode::SetupFinally);
    b.emit(Opcode::BreakLoop);
    b.emit(Opcode::PopBlock);
    b.none();
    b.patch_jump(finally);
    b.load("count");
    b.int(1);
    b.emit(Opcode::InplaceAdd);
    b.store("count");
    b.emit(Opcode::EndFinally);
    b.emit_jump_to(Opcode::JumpAbsolute, top);
    b.patch_jump(exhausted);
    b.emit(Opcode::PopBlock);
    b.patch_jump(after_loop);
    b.load("count");
    b.ret();
    assert_eq!(run(&b.build()).unwrap(), Object::Int(1));
}

/// `for i in range(3): try: count += 1; continue finally: done += 1`
#[test]
fn continue_through_finally_runs_it_every_time() {
    let mut b = module();
    b.int(0);
    b.store("count");
    b.int(0);
    b.store("done");
    let after_loop = b.emit_jump(Opcode::SetupLoop);
    b.load("range");
    b.int(3);
    b.call(1);
    b.emit(Opcode::GetIter);
    let top = b.current_offset();
    let exhausted = b.emit_jump(Opcode::ForIter);
    b.store("i");
    let finally = b.emit_jump(Opcode::SetupFinally);
    b.load("count");
    b.int(1);
    b.emit(Opcode::InplaceAdd);
    b.store("count");
    b.emit_jump_to(Opcode::ContinueLoop, top);
    b.emit(Opcode::PopBlock);
    b.none();
    b.patch_jump(finally);
    b.load("done");
    b.int(1);
    b.emit(Opcode::InplaceAdd);
    b.store("done");
    b.emit(Opcode::EndFinally);
    b.emit_jump_to(Opcode::JumpAbsolute, top);
    b.patch_jump(exhausted);
    b.emit(Opcode::PopBlock);
    b.patch_jump(after_loop);
    b.load("count");
    b.load("done");
    b.emit_arg(Opcode::BuildTuple, 2u32);
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![Object::Int(3), Object::Int(3)])
    );
}

/// `def f(): try: return 1 finally: log.append(2)` returns 1 after the finally ran.
#[test]
fn return_through_finally_keeps_value() {
    let mut body = function("f", &[]);
    let finally = body.emit_jump(Opcode::SetupFinally);
    body.int(1);
    body.ret();
    body.emit(Opcode::PopBlock);
    body.none();
    body.patch_jump(finally);
    body.load_global("log");
    body.attr("append");
    body.int(2);
    body.call(1);
    body.pop();
    body.emit(Opcode::EndFinally);
    body.ret_none();

    let mut b = module();
    b.emit_arg(Opcode::BuildList, 0u32);
    b.store("log");
    b.def("f", body.build(), &[]);
    b.load("f");
    b.call(0);
    b.load("log");
    b.emit_arg(Opcode::BuildTuple, 2u32);
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::List(vec![Object::Int(2)])])
    );
}

/// A bare `raise` with nothing being handled.
#[test]
fn bare_raise_outside_handler_is_a_value_error() {
    let mut b = module();
    b.emit_arg(Opcode::RaiseVarargs, 0u32);
    b.ret_none();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::ValueError));
    assert_eq!(
        err.to_string(),
        "ValueError: cannot reraise if no exception has been raised"
    );
}

/// `d = {'a': 1}; try: del d['zz'] except KeyError: pass; len(d)`
#[test]
fn deleting_missing_key_raises_and_keeps_size() {
    let mut b = module();
    b.emit_arg(Opcode::BuildMap, 1u32);
    b.int(1);
    b.str("a");
    b.emit(Opcode::StoreMap);
    b.store("d");
    let handler = b.emit_jump(Opcode::SetupExcept);
    b.load("d");
    b.str("zz");
    b.emit(Opcode::DeleteSubscr);
    b.emit(Opcode::PopBlock);
    let done = b.emit_jump(Opcode::JumpForward);
    b.patch_jump(handler);
    let reraise = b.except_match("KeyError");
    let handled = b.emit_jump(Opcode::JumpForward);
    b.patch_jump(reraise);
    b.emit(Opcode::EndFinally);
    b.patch_jump(done);
    b.patch_jump(handled);
    b.load("len");
    b.load("d");
    b.call(1);
    b.ret();
    assert_eq!(run(&b.build()).unwrap(), Object::Int(1));
}

#[test]
fn uncaught_key_error_shows_key_repr() {
    let mut b = module();
    b.emit_arg(Opcode::BuildMap, 0u32);
    b.str("missing");
    b.emit(Opcode::BinarySubscr);
    b.ret();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(err.to_string(), "KeyError: 'missing'");
}

// =============================================================================
// Resource limits
// =============================================================================

/// Doubles a string until the memory limit stops it.
fn doubling_loop(b: &mut coil::CodeBuilder) {
    b.str("ab");
    b.store("x");
    let top = b.current_offset();
    b.load("x");
    b.load("x");
    b.emit(Opcode::BinaryAdd);
    b.store("x");
    b.emit_jump_to(Opcode::JumpAbsolute, top);
}

#[test]
fn memory_limit_raises_memory_error() {
    let mut b = module();
    doubling_loop(&mut b);
    let tracker = LimitedTracker::new(ResourceLimits::new().max_memory(8 * 1024 * 1024));
    let mut interp = Interpreter::new(tracker).unwrap();
    let err = interp.execute(&b.build(), &mut NoPrint).unwrap_err();
    assert!(err.is_memory_error(), "expected MemoryError, got {err}");
    assert_eq!(err.message(), None);
}

/// Two caught allocation failures hand out the same pre-built instance.
#[test]
fn memory_error_is_a_singleton() {
    let mut b = module();
    for name in ["first", "second"] {
        let handler = b.emit_jump(Opcode::SetupExcept);
        doubling_loop(&mut b);
        b.patch_jump(handler);
        let reraise = b.except_match_keep_value("MemoryError", name);
        let handled = b.emit_jump(Opcode::JumpForward);
        b.patch_jump(reraise);
        b.emit(Opcode::EndFinally);
        b.patch_jump(handled);
    }
    b.load("first");
    b.load("second");
    b.compare(coil::CompareOp::Is);
    b.ret();
    let tracker = LimitedTracker::new(ResourceLimits::new().max_memory(8 * 1024 * 1024));
    let mut interp = Interpreter::new(tracker).unwrap();
    assert_eq!(interp.execute(&b.build(), &mut NoPrint).unwrap(), Object::Bool(true));
}

#[test]
fn operation_limit_cannot_be_caught() {
    let mut b = module();
    let handler = b.emit_jump(Opcode::SetupExcept);
    let top = b.current_offset();
    b.emit(Opcode::Nop);
    b.emit_jump_to(Opcode::JumpAbsolute, top);
    b.patch_jump(handler);
    b.pop();
    b.pop();
    b.pop();
    b.str("caught");
    b.ret();
    let tracker = LimitedTracker::new(ResourceLimits::new().max_operations(1_000));
    let mut interp = Interpreter::new(tracker).unwrap();
    let err = interp.execute(&b.build(), &mut NoPrint).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::RuntimeError));
}

#[test]
fn runaway_recursion_is_a_runtime_error() {
    let mut body = function("f", &[]);
    body.load_global("f");
    body.call(0);
    body.ret();

    let mut b = module();
    b.def("f", body.build(), &[]);
    b.load("f");
    b.call(0);
    b.ret();
    let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(Some(50)));
    let mut interp = Interpreter::new(tracker).unwrap();
    let err = interp.execute(&b.build(), &mut NoPrint).unwrap_err();
    assert_eq!(err.to_string(), "RuntimeError: maximum recursion depth exceeded");
}

trait KeepValue {
    /// `except Type, name:` handling.
    fn except_match_keep_value(&mut self, exc_type: &str, name: &str) -> coil::JumpLabel;
}

impl KeepValue for coil::CodeBuilder {
    fn except_match_keep_value(&mut self, exc_type: &str, name: &str) -> coil::JumpLabel {
        self.emit(Opcode::DupTop);
        self.load(exc_type);
        self.compare(coil::CompareOp::ExcMatch);
        let no_match = self.emit_jump(Opcode::PopJumpIfFalse);
        self.pop();
        self.store(name);
        self.pop();
        no_match
    }
}
