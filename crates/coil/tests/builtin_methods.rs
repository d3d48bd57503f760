//! Builtin functions and the methods of `str`, `list` and `dict`.

mod common;

use coil::{CodeBuilder, CompareOp, Const, ExcType, Exception, Object, Opcode};
use common::{Asm, module, run, s};
use pretty_assertions::assert_eq;

/// Runs the expressions pushed by `push` and returns them as a tuple.
fn eval_all(push: impl FnOnce(&mut CodeBuilder) -> u32) -> Vec<Object> {
    let mut b = module();
    let count = push(&mut b);
    b.emit_arg(Opcode::BuildTuple, count);
    b.ret();
    match run(&b.build()).unwrap() {
        Object::Tuple(items) => items,
        other => panic!("expected a tuple, got {other:?}"),
    }
}

fn eval_err(push: impl FnOnce(&mut CodeBuilder)) -> Exception {
    let mut b = module();
    push(&mut b);
    b.ret();
    run(&b.build()).unwrap_err()
}

/// `receiver.method(args...)` with string constants as arguments.
fn str_call(b: &mut CodeBuilder, receiver: &str, method: &str, args: &[Const]) {
    b.str(receiver);
    b.attr(method);
    for arg in args {
        b.konst(arg.clone());
    }
    b.call(u8::try_from(args.len()).unwrap());
}

fn text(value: &str) -> Const {
    Const::Str(value.to_owned())
}

fn ints(values: &[i64]) -> Object {
    Object::List(values.iter().map(|v| Object::Int(*v)).collect())
}

fn strs(values: &[&str]) -> Object {
    Object::List(values.iter().map(|v| s(v)).collect())
}

// =============================================================================
// str
// =============================================================================

#[test]
fn str_methods() {
    let results = eval_all(|b| {
        str_call(b, "a,b,,c", "split", &[text(",")]);
        str_call(b, "  x  y ", "split", &[]);
        str_call(b, "hello", "find", &[text("l")]);
        str_call(b, "hello", "rfind", &[text("l")]);
        str_call(b, "hello", "find", &[text("z")]);
        str_call(b, "hello", "replace", &[text("l"), text("L"), Const::Int(1)]);
        str_call(b, "  pad \n", "strip", &[]);
        str_call(b, "MiXed", "upper", &[]);
        str_call(b, "7", "rjust", &[Const::Int(3), text("0")]);
        str_call(b, "abc", "startswith", &[Const::Tuple(vec![text("x"), text("ab")])]);
        10
    });
    assert_eq!(
        results,
        vec![
            strs(&["a", "b", "", "c"]),
            strs(&["x", "y"]),
            Object::Int(2),
            Object::Int(3),
            Object::Int(-1),
            s("heLlo"),
            s("pad"),
            s("MIXED"),
            s("007"),
            Object::Bool(true),
        ]
    );
}

#[test]
fn str_join_and_operators() {
    let results = eval_all(|b| {
        b.str("-");
        b.attr("join");
        b.str("a");
        b.str("b");
        b.str("c");
        b.emit_arg(Opcode::BuildList, 3u32);
        b.call(1);
        b.str("ab");
        b.int(3);
        b.emit(Opcode::BinaryMultiply);
        b.str("b");
        b.str("abc");
        b.compare(CompareOp::In);
        b.str("hello");
        b.none();
        b.none();
        b.int(-1);
        b.emit_arg(Opcode::BuildSlice, 3u32);
        b.emit(Opcode::BinarySubscr);
        4
    });
    assert_eq!(results, vec![s("a-b-c"), s("ababab"), Object::Bool(true), s("olleh")]);
}

#[test]
fn str_index_miss_is_value_error() {
    let err = eval_err(|b| str_call(b, "abc", "index", &[text("z")]));
    assert_eq!(err.to_string(), "ValueError: substring not found");
}

#[test]
fn join_rejects_non_strings() {
    let err = eval_err(|b| {
        b.str(",");
        b.attr("join");
        b.str("a");
        b.int(1);
        b.emit_arg(Opcode::BuildList, 2u32);
        b.call(1);
    });
    assert_eq!(err.to_string(), "TypeError: sequence item 1: expected string, int found");
}

// =============================================================================
// list
// =============================================================================

#[test]
fn list_methods() {
    let mut b = module();
    for v in [3, 1, 2] {
        b.int(v);
    }
    b.emit_arg(Opcode::BuildList, 3u32);
    b.store("l");
    b.method_call("l", "sort", |_| 0);
    b.pop();
    b.method_call("l", "append", |b| {
        b.int(0);
        1
    });
    b.pop();
    b.method_call("l", "insert", |b| {
        b.int(0);
        b.int(9);
        2
    });
    b.pop();
    // l == [9, 1, 2, 3, 0]
    b.method_call("l", "pop", |_| 0);
    b.method_call("l", "index", |b| {
        b.int(2);
        1
    });
    b.method_call("l", "count", |b| {
        b.int(9);
        1
    });
    b.method_call("l", "remove", |b| {
        b.int(9);
        1
    });
    b.pop();
    b.method_call("l", "reverse", |_| 0);
    b.pop();
    b.load("l");
    b.emit_arg(Opcode::BuildTuple, 4u32);
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![Object::Int(0), Object::Int(2), Object::Int(1), ints(&[3, 2, 1])])
    );
}

#[test]
fn sort_accepts_key_and_reverse() {
    let results = eval_all(|b| {
        for word in ["ccc", "a", "bb"] {
            b.str(word);
        }
        b.emit_arg(Opcode::BuildList, 3u32);
        b.store("words");
        b.load("words");
        b.attr("sort");
        b.str("key");
        b.load("len");
        b.call_kw(0, 1);
        b.pop();
        b.load("words");

        for v in [1, 3, 2] {
            b.int(v);
        }
        b.emit_arg(Opcode::BuildList, 3u32);
        b.store("nums");
        b.load("nums");
        b.attr("sort");
        b.str("reverse");
        b.konst(Const::Bool(true));
        b.call_kw(0, 1);
        b.pop();
        b.load("nums");
        2
    });
    assert_eq!(results, vec![strs(&["a", "bb", "ccc"]), ints(&[3, 2, 1])]);
}

#[test]
fn pop_from_empty_list() {
    let err = eval_err(|b| {
        b.emit_arg(Opcode::BuildList, 0u32);
        b.attr("pop");
        b.call(0);
    });
    assert_eq!(err.to_string(), "IndexError: pop from empty list");
}

/// Appending N items and deleting all but the last leaves it alone at index 0.
#[test]
fn list_shrinks_to_survivor() {
    let mut b = module();
    b.emit_arg(Opcode::BuildList, 0u32);
    b.store("l");
    let after = b.emit_jump(Opcode::SetupLoop);
    b.load("range");
    b.int(100);
    b.call(1);
    b.emit(Opcode::GetIter);
    let top = b.current_offset();
    let done = b.emit_jump(Opcode::ForIter);
    b.store("i");
    b.method_call("l", "append", |b| {
        b.load("i");
        1
    });
    b.pop();
    b.emit_jump_to(Opcode::JumpAbsolute, top);
    b.patch_jump(done);
    b.emit(Opcode::PopBlock);
    b.patch_jump(after);
    // del l[:-1]
    b.load("l");
    b.int(-1);
    b.emit(Opcode::DeleteSlice2);
    b.load("len");
    b.load("l");
    b.call(1);
    b.load("l");
    b.int(0);
    b.emit(Opcode::BinarySubscr);
    b.emit_arg(Opcode::BuildTuple, 2u32);
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Int(99)])
    );
}

/// Repeating by a negative count gives an empty sequence, never an error.
#[test]
fn negative_repeat_count_is_empty() {
    let results = eval_all(|b| {
        b.int(1);
        b.int(2);
        b.emit_arg(Opcode::BuildList, 2u32);
        b.int(-2);
        b.emit(Opcode::BinaryMultiply);

        b.konst(Const::Tuple(vec![Const::Int(1)]));
        b.int(-1);
        b.emit(Opcode::BinaryMultiply);

        b.int(-3);
        b.str("ab");
        b.emit(Opcode::BinaryMultiply);
        3
    });
    assert_eq!(results, vec![ints(&[]), Object::Tuple(vec![]), s("")]);
}

#[test]
fn list_slices_and_unpacking() {
    let results = eval_all(|b| {
        for v in 0..5 {
            b.int(v);
        }
        b.emit_arg(Opcode::BuildList, 5u32);
        b.int(1);
        b.int(4);
        b.emit_arg(Opcode::BuildSlice, 2u32);
        b.emit(Opcode::BinarySubscr);

        b.konst(Const::Tuple(vec![Const::Int(1), Const::Int(2)]));
        b.emit_arg(Opcode::UnpackSequence, 2u32);
        b.store("a");
        b.store("b");
        b.load("b");
        b.load("a");
        3
    });
    assert_eq!(results, vec![ints(&[1, 2, 3]), Object::Int(2), Object::Int(1)]);
}

// =============================================================================
// dict
// =============================================================================

#[test]
fn dict_methods() {
    let mut b = module();
    b.emit_arg(Opcode::BuildMap, 0u32);
    b.store("d");
    b.method_call("d", "setdefault", |b| {
        b.str("a");
        b.int(1);
        2
    });
    b.method_call("d", "get", |b| {
        b.str("b");
        b.int(7);
        2
    });
    b.method_call("d", "pop", |b| {
        b.str("zz");
        b.int(0);
        2
    });
    b.load("d");
    b.attr("update");
    b.str("x");
    b.int(2);
    b.call_kw(0, 1);
    b.pop();
    b.method_call("d", "has_key", |b| {
        b.str("x");
        1
    });
    b.load("len");
    b.method_call("d", "keys", |_| 0);
    b.call(1);
    b.method_call("d", "pop", |b| {
        b.str("a");
        1
    });
    b.load("d");
    b.emit_arg(Opcode::BuildTuple, 7u32);
    b.ret();
    let expected_dict = Object::Dict(vec![(s("x"), Object::Int(2))].into());
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![
            Object::Int(1),
            Object::Int(7),
            Object::Int(0),
            Object::Bool(true),
            Object::Int(2),
            Object::Int(1),
            expected_dict,
        ])
    );
}

#[test]
fn dict_pop_without_default_raises_key_error() {
    let err = eval_err(|b| {
        b.emit_arg(Opcode::BuildMap, 0u32);
        b.attr("pop");
        b.str("missing");
        b.call(1);
    });
    assert_eq!(err.exc_type(), Some(ExcType::KeyError));
    assert_eq!(err.to_string(), "KeyError: 'missing'");
}

#[test]
fn unhashable_key_is_type_error() {
    let err = eval_err(|b| {
        b.emit_arg(Opcode::BuildMap, 0u32);
        b.emit_arg(Opcode::BuildList, 0u32);
        b.emit(Opcode::BinarySubscr);
    });
    assert_eq!(err.to_string(), "TypeError: unhashable type: 'list'");
}

// =============================================================================
// Builtin functions and arithmetic
// =============================================================================

#[test]
fn builtin_functions() {
    let results = eval_all(|b| {
        b.load("len");
        b.str("abc");
        b.call(1);
        b.load("range");
        b.int(2);
        b.int(8);
        b.int(2);
        b.call(3);
        b.load("repr");
        b.str("a");
        b.call(1);
        b.load("getattr");
        b.str("x");
        b.str("missing");
        b.str("dflt");
        b.call(3);
        b.load("hasattr");
        b.str("x");
        b.str("upper");
        b.call(2);
        b.load("next");
        b.load("iter");
        b.int(5);
        b.int(6);
        b.emit_arg(Opcode::BuildList, 2u32);
        b.call(1);
        b.call(1);
        b.load("int");
        b.str("ff");
        b.int(16);
        b.call(2);
        b.load("bool");
        b.int(0);
        b.call(1);
        b.load("tuple");
        b.int(1);
        b.emit_arg(Opcode::BuildList, 1u32);
        b.call(1);
        b.load("hash");
        b.int(5);
        b.call(1);
        b.load("hash");
        b.int(5);
        b.call(1);
        b.compare(CompareOp::Eq);
        10
    });
    assert_eq!(
        results,
        vec![
            Object::Int(3),
            ints(&[2, 4, 6]),
            s("'a'"),
            s("dflt"),
            Object::Bool(true),
            Object::Int(5),
            Object::Int(255),
            Object::Bool(false),
            Object::Tuple(vec![Object::Int(1)]),
            Object::Bool(true),
        ]
    );
}

#[test]
fn integer_arithmetic_follows_python_two() {
    let results = eval_all(|b| {
        b.int(7);
        b.int(-2);
        b.emit(Opcode::BinaryFloorDivide);
        b.int(-7);
        b.int(3);
        b.emit(Opcode::BinaryModulo);
        b.int(2);
        b.int(100);
        b.emit(Opcode::BinaryPower);
        b.int(1);
        b.int(70);
        b.emit(Opcode::BinaryLshift);
        4
    });
    let two_100: num_bigint::BigInt = num_bigint::BigInt::from(1) << 100;
    let one_70: num_bigint::BigInt = num_bigint::BigInt::from(1) << 70;
    assert_eq!(
        results,
        vec![Object::Int(-4), Object::Int(2), Object::BigInt(two_100), Object::BigInt(one_70)]
    );
}

#[test]
fn division_by_zero() {
    let err = eval_err(|b| {
        b.int(1);
        b.int(0);
        b.emit(Opcode::BinaryDivide);
    });
    assert_eq!(err.to_string(), "ZeroDivisionError: integer division or modulo by zero");
}

#[test]
fn unsupported_operands() {
    let err = eval_err(|b| {
        b.int(1);
        b.str("a");
        b.emit(Opcode::BinaryAdd);
    });
    assert_eq!(
        err.to_string(),
        "TypeError: unsupported operand type(s) for +: 'int' and 'str'"
    );
}
