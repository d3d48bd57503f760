//! Classes, modules, printing, `with`, tracebacks and host values.

mod common;

use coil::{
    Code, CodeBuilder, CompareOp, Const, DictPairs, ExcType, Interpreter, NoPrint, Object, Opcode, StackFrame,
};
use common::{Asm, function, module, run, run_printing, s};
use pretty_assertions::assert_eq;

fn class_body(name: &str) -> CodeBuilder {
    let mut b = CodeBuilder::new(name);
    b.set_filename("test.py");
    b.set_flags(Code::NEWLOCALS);
    b.set_stack_size(32);
    b
}

fn finish_class(mut body: CodeBuilder) -> Code {
    body.emit(Opcode::LoadLocals);
    body.ret();
    body.build()
}

/// `class name(base): <body>`
fn define_class(b: &mut CodeBuilder, name: &str, base: &str, body: Code) {
    b.str(name);
    b.load(base);
    b.emit_arg(Opcode::BuildTuple, 1u32);
    b.konst(Const::Code(Box::new(body)));
    b.emit_arg(Opcode::MakeFunction, 0u32);
    b.call(0);
    b.emit(Opcode::BuildClass);
    b.store(name);
}

/// Methods that stash `v` and read it back.
fn value_holder_body(name: &str) -> CodeBuilder {
    let mut init = function("__init__", &["self", "v"]);
    init.load_fast("v");
    init.load_fast("self");
    init.store_attr("v");
    init.ret_none();

    let mut get = function("get", &["self"]);
    get.load_fast("self");
    get.attr("v");
    get.ret();

    let mut body = class_body(name);
    body.def("__init__", init.build(), &[]);
    body.def("get", get.build(), &[]);
    body
}

// =============================================================================
// Classes and instances
// =============================================================================

#[test]
fn instance_methods_see_init_state() {
    let mut b = module();
    define_class(&mut b, "C", "object", finish_class(value_holder_body("C")));
    b.load("C");
    b.int(5);
    b.call(1);
    b.attr("get");
    b.call(0);
    b.ret();
    assert_eq!(run(&b.build()).unwrap(), Object::Int(5));
}

/// `class D(C): def get(self): return self.v * 2`, with `__init__` inherited.
#[test]
fn subclass_overrides_and_inherits() {
    let mut get = function("get", &["self"]);
    get.load_fast("self");
    get.attr("v");
    get.int(2);
    get.emit(Opcode::BinaryMultiply);
    get.ret();
    let mut derived = class_body("D");
    derived.def("get", get.build(), &[]);

    let mut b = module();
    define_class(&mut b, "C", "object", finish_class(value_holder_body("C")));
    define_class(&mut b, "D", "C", finish_class(derived));
    b.load("D");
    b.int(4);
    b.call(1);
    b.store("d");
    b.load("d");
    b.attr("get");
    b.call(0);
    b.load("isinstance");
    b.load("d");
    b.load("C");
    b.call(2);
    b.load("issubclass");
    b.load("C");
    b.load("D");
    b.call(2);
    b.emit_arg(Opcode::BuildTuple, 3u32);
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![Object::Int(8), Object::Bool(true), Object::Bool(false)])
    );
}

/// `__getattribute__` raising AttributeError hands the lookup to `__getattr__`.
#[test]
fn failed_getattribute_falls_back_to_getattr() {
    let mut getattribute = function("__getattribute__", &["self", "name"]);
    getattribute.load_global("AttributeError");
    getattribute.load_fast("name");
    getattribute.call(1);
    getattribute.emit_arg(Opcode::RaiseVarargs, 1u32);
    getattribute.ret_none();

    let mut getattr = function("__getattr__", &["self", "name"]);
    getattr.load_fast("name");
    getattr.str("!");
    getattr.emit(Opcode::BinaryAdd);
    getattr.ret();

    let mut body = class_body("G");
    body.def("__getattribute__", getattribute.build(), &[]);
    body.def("__getattr__", getattr.build(), &[]);

    let mut b = module();
    define_class(&mut b, "G", "object", finish_class(body));
    b.load("G");
    b.call(0);
    b.attr("missing");
    b.ret();
    assert_eq!(run(&b.build()).unwrap(), s("missing!"));
}

/// `C.get(C(5))` works through the class; `C.get(3)` is rejected.
#[test]
fn unbound_method_checks_its_instance() {
    let mut b = module();
    define_class(&mut b, "C", "object", finish_class(value_holder_body("C")));
    b.load("C");
    b.attr("get");
    b.load("C");
    b.int(5);
    b.call(1);
    b.call(1);
    b.ret();
    let code = b.build();
    assert_eq!(run(&code).unwrap(), Object::Int(5));

    let mut b = module();
    define_class(&mut b, "C", "object", finish_class(value_holder_body("C")));
    b.load("C");
    b.attr("get");
    b.int(3);
    b.call(1);
    b.ret();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "TypeError: unbound method get() must be called with C instance as first argument (got int instance instead)"
    );
}

#[test]
fn builtin_types_are_not_acceptable_bases() {
    let mut b = module();
    define_class(&mut b, "L", "list", finish_class(class_body("L")));
    b.ret_none();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(err.to_string(), "TypeError: type 'list' is not an acceptable base type");
}

/// `class P(object): __slots__ = ('x',)` accepts `p.x` and rejects `p.y`.
#[test]
fn slots_restrict_attributes() {
    let mut body = class_body("P");
    body.konst(Const::Tuple(vec![Const::Str("x".to_owned())]));
    body.store("__slots__");

    let mut b = module();
    define_class(&mut b, "P", "object", finish_class(body));
    b.load("P");
    b.call(0);
    b.store("p");
    b.int(1);
    b.load("p");
    b.store_attr("x");
    b.int(2);
    b.load("p");
    b.store_attr("y");
    b.ret_none();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::AttributeError));
}

/// Keys with a user `__hash__` and `__eq__` collapse onto one entry.
#[test]
fn user_hash_and_eq_drive_dict_keys() {
    let mut hash = function("__hash__", &["self"]);
    hash.int(1);
    hash.ret();
    let mut eq = function("__eq__", &["self", "other"]);
    eq.konst(Const::Bool(true));
    eq.ret();
    let mut body = class_body("K");
    body.def("__hash__", hash.build(), &[]);
    body.def("__eq__", eq.build(), &[]);

    let mut b = module();
    define_class(&mut b, "K", "object", finish_class(body));
    b.emit_arg(Opcode::BuildMap, 0u32);
    b.store("d");
    for value in ["first", "second"] {
        b.str(value);
        b.load("d");
        b.load("K");
        b.call(0);
        b.emit(Opcode::StoreSubscr);
    }
    b.load("len");
    b.load("d");
    b.call(1);
    b.load("d");
    b.load("K");
    b.call(0);
    b.emit(Opcode::BinarySubscr);
    b.emit_arg(Opcode::BuildTuple, 2u32);
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![Object::Int(1), s("second")])
    );
}

/// A class with only `__getitem__` iterates until IndexError.
#[test]
fn getitem_sequences_iterate() {
    let mut getitem = function("__getitem__", &["self", "i"]);
    getitem.load_fast("i");
    getitem.int(3);
    getitem.compare(CompareOp::Lt);
    let past_end = getitem.emit_jump(Opcode::PopJumpIfFalse);
    getitem.load_fast("i");
    getitem.int(10);
    getitem.emit(Opcode::BinaryMultiply);
    getitem.ret();
    getitem.patch_jump(past_end);
    getitem.load_global("IndexError");
    getitem.emit_arg(Opcode::RaiseVarargs, 1u32);
    let mut body = class_body("Seq");
    body.def("__getitem__", getitem.build(), &[]);

    let mut b = module();
    define_class(&mut b, "Seq", "object", finish_class(body));
    b.load("list");
    b.load("Seq");
    b.call(0);
    b.call(1);
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::List(vec![Object::Int(0), Object::Int(10), Object::Int(20)])
    );
}

/// `del f` drops the last reference and `__del__` runs before the next instruction.
#[test]
fn finalizer_runs_when_last_reference_goes() {
    let mut del = function("__del__", &["self"]);
    del.load_global("log");
    del.attr("append");
    del.str("bye");
    del.call(1);
    del.pop();
    del.ret_none();
    let mut body = class_body("F");
    body.def("__del__", del.build(), &[]);

    let mut b = module();
    b.emit_arg(Opcode::BuildList, 0u32);
    b.store("log");
    define_class(&mut b, "F", "object", finish_class(body));
    b.load("F");
    b.call(0);
    b.store("f");
    let name = b.add_name("f");
    b.emit_arg(Opcode::DeleteName, name);
    b.emit(Opcode::Nop);
    b.load("log");
    b.ret();
    assert_eq!(run(&b.build()).unwrap(), Object::List(vec![s("bye")]));
}

// =============================================================================
// with statement
// =============================================================================

/// `with CM() as x: raise ValueError("boom")` where `__exit__` logs and suppresses.
#[test]
fn with_exit_suppresses_exception() {
    let mut enter = function("__enter__", &["self"]);
    enter.str("in");
    enter.ret();
    let mut exit = function("__exit__", &["self", "t", "v", "tb"]);
    exit.load_global("log");
    exit.attr("append");
    exit.load_fast("t");
    exit.none();
    exit.compare(CompareOp::IsNot);
    exit.call(1);
    exit.pop();
    exit.konst(Const::Bool(true));
    exit.ret();
    let mut body = class_body("CM");
    body.def("__enter__", enter.build(), &[]);
    body.def("__exit__", exit.build(), &[]);

    let mut b = module();
    b.emit_arg(Opcode::BuildList, 0u32);
    b.store("log");
    define_class(&mut b, "CM", "object", finish_class(body));
    b.load("CM");
    b.call(0);
    let cleanup = b.emit_jump(Opcode::SetupWith);
    b.store("x");
    b.load("ValueError");
    b.str("boom");
    b.call(1);
    b.emit_arg(Opcode::RaiseVarargs, 1u32);
    b.emit(Opcode::PopBlock);
    b.none();
    b.patch_jump(cleanup);
    b.emit(Opcode::WithCleanup);
    b.emit(Opcode::EndFinally);
    b.load("x");
    b.load("log");
    b.emit_arg(Opcode::BuildTuple, 2u32);
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Tuple(vec![s("in"), Object::List(vec![Object::Bool(true)])])
    );
}

// =============================================================================
// Modules
// =============================================================================

fn helpers_module() -> Code {
    let mut double = function("double", &["x"]);
    double.load_fast("x");
    double.int(2);
    double.emit(Opcode::BinaryMultiply);
    double.ret();

    let mut b = module();
    b.set_filename("helpers.py");
    b.int(42);
    b.store("value");
    b.def("double", double.build(), &[]);
    b.ret_none();
    b.build()
}

/// `import helpers; from helpers import double; double(helpers.value)`
#[test]
fn registered_module_imports() {
    let mut b = module();
    b.int(-1);
    b.none();
    let helpers = b.add_name("helpers");
    b.emit_arg(Opcode::ImportName, helpers);
    b.store("helpers");
    b.int(-1);
    b.konst(Const::Tuple(vec![Const::Str("double".to_owned())]));
    b.emit_arg(Opcode::ImportName, helpers);
    let double = b.add_name("double");
    b.emit_arg(Opcode::ImportFrom, double);
    b.store("double");
    b.pop();
    b.load("double");
    b.load("helpers");
    b.attr("value");
    b.call(1);
    b.ret();

    let mut interp = Interpreter::new_no_limits().unwrap();
    interp.register_module("helpers", helpers_module()).unwrap();
    assert_eq!(interp.execute(&b.build(), &mut NoPrint).unwrap(), Object::Int(84));
}

#[test]
fn unknown_module_is_import_error() {
    let mut b = module();
    b.int(-1);
    b.none();
    let name = b.add_name("nowhere");
    b.emit_arg(Opcode::ImportName, name);
    b.ret();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(err.to_string(), "ImportError: No module named nowhere");
}

// =============================================================================
// Print statement
// =============================================================================

/// `print 1, 'a'` then `print`.
#[test]
fn print_items_are_space_separated() {
    let mut b = module();
    b.int(1);
    b.emit(Opcode::PrintItem);
    b.str("a");
    b.emit(Opcode::PrintItem);
    b.emit(Opcode::PrintNewline);
    b.emit(Opcode::PrintNewline);
    b.ret_none();
    let (result, output) = run_printing(&b.build());
    assert_eq!(result.unwrap(), Object::None);
    assert_eq!(output, "1 a\n\n");
}

// =============================================================================
// Tracebacks
// =============================================================================

#[test]
fn traceback_lists_frames_outermost_first() {
    let mut f = function("f", &[]);
    f.set_line(2);
    f.load_global("ValueError");
    f.str("bad");
    f.call(1);
    f.emit_arg(Opcode::RaiseVarargs, 1u32);

    let mut b = module();
    b.set_line(1);
    b.def("f", f.build(), &[]);
    b.set_line(3);
    b.load("f");
    b.call(0);
    b.ret();

    let err = run(&b.build()).unwrap_err();
    let lines: Vec<Option<u32>> = err.traceback().iter().map(|frame| frame.line).collect();
    assert_eq!(lines, vec![Some(3), Some(2)]);
    assert_eq!(
        err.traceback_text(),
        "Traceback (most recent call last):\n  File \"test.py\", line 3, in <module>\n  File \"test.py\", line 2, in f\nValueError: bad"
    );
}

#[test]
fn traceback_without_line_table_shows_offset() {
    let mut b = CodeBuilder::new("<module>");
    b.set_stack_size(8);
    b.load("undefined_name");
    b.ret();
    let err = run(&b.build()).unwrap_err();
    assert_eq!(
        err.traceback(),
        &[StackFrame {
            filename: "<string>".to_owned(),
            name: "<module>".to_owned(),
            line: None,
            ip: 0,
        }]
    );
    assert_eq!(err.to_string(), "NameError: name 'undefined_name' is not defined");
}

#[test]
fn system_exit_carries_code() {
    let mut b = module();
    b.load("SystemExit");
    b.int(3);
    b.call(1);
    b.emit_arg(Opcode::RaiseVarargs, 1u32);
    b.ret_none();
    let err = run(&b.build()).unwrap_err();
    assert!(err.is_system_exit());
    assert_eq!(err.exit_code(), 3);
}

// =============================================================================
// Host values
// =============================================================================

#[test]
fn globals_cross_the_host_boundary() {
    let mut interp = Interpreter::new_no_limits().unwrap();
    let data = Object::Dict(DictPairs::from(vec![(s("k"), Object::Int(5))]));
    interp.set_global("data", data).unwrap();

    let mut b = module();
    b.load("data");
    b.str("k");
    b.emit(Opcode::BinarySubscr);
    b.int(1);
    b.emit(Opcode::BinaryAdd);
    b.store("result");
    b.ret_none();
    interp.execute(&b.build(), &mut NoPrint).unwrap();
    assert_eq!(interp.get_global("result"), Some(Object::Int(6)));
    assert_eq!(interp.get_global("absent"), None);
}

#[test]
fn repr_only_values_are_rejected_as_inputs() {
    let mut interp = Interpreter::new_no_limits().unwrap();
    let err = interp.set_global("x", Object::Repr("<thing>".to_owned())).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::TypeError));
}

#[test]
fn functions_come_back_as_repr() {
    let mut f = function("f", &[]);
    f.ret_none();
    let mut b = module();
    b.def("f", f.build(), &[]);
    b.load("len");
    b.ret();
    assert_eq!(
        run(&b.build()).unwrap(),
        Object::Repr("<built-in function len>".to_owned())
    );
}
