use std::{
    fs,
    path::PathBuf,
    process::{Command, Output},
};

use coil::{CodeBuilder, Const, Opcode};
use pretty_assertions::assert_eq;
use similar::TextDiff;

/// Writes `code` as JSON to a file unique to the calling test.
fn write_code(test: &str, code: &coil::Code) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("coil-cli-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{test}.json"));
    fs::write(&path, code.to_json().unwrap()).unwrap();
    path
}

fn coil(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_coil")).args(args).output().unwrap()
}

fn assert_text(actual: &[u8], expected: &str) {
    let actual = String::from_utf8_lossy(actual);
    if actual != expected {
        let diff = TextDiff::from_lines(expected, actual.as_ref());
        panic!("output differs:\n{}", diff.unified_diff().header("expected", "actual"));
    }
}

fn konst(b: &mut CodeBuilder, value: Const) {
    let index = b.add_const(value);
    b.emit_arg(Opcode::LoadConst, index);
}

/// `print 'hello'; return None`
fn hello() -> coil::Code {
    let mut b = CodeBuilder::new("<module>");
    b.set_line(1);
    konst(&mut b, Const::Str("hello".to_owned()));
    b.emit(Opcode::PrintItem);
    b.emit(Opcode::PrintNewline);
    konst(&mut b, Const::None);
    b.emit(Opcode::ReturnValue);
    b.build()
}

/// `raise name(arg)`
fn raising(name: &str, arg: Const) -> coil::Code {
    let mut b = CodeBuilder::new("<module>");
    b.set_filename("prog.py");
    b.set_line(1);
    let index = b.add_name(name);
    b.emit_arg(Opcode::LoadName, index);
    konst(&mut b, arg);
    b.emit_call(Opcode::CallFunction, 1, 0);
    b.emit_arg(Opcode::RaiseVarargs, 1u32);
    b.build()
}

#[test]
fn run_prints_program_output() {
    let path = write_code("hello", &hello());
    let output = coil(&["run", path.to_str().unwrap()]);
    assert!(output.status.success());
    assert_text(&output.stdout, "hello\n");
}

#[test]
fn uncaught_exception_prints_traceback_and_fails() {
    let path = write_code("raise", &raising("ValueError", Const::Str("bad".to_owned())));
    let output = coil(&["run", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert_text(
        &output.stderr,
        "Traceback (most recent call last):\n  File \"prog.py\", line 1, in <module>\nValueError: bad\n",
    );
}

#[test]
fn system_exit_sets_status() {
    let path = write_code("exit", &raising("SystemExit", Const::Int(4)));
    let output = coil(&["run", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(4));
    assert_text(&output.stderr, "");
}

#[test]
fn operation_limit_stops_a_loop() {
    let mut b = CodeBuilder::new("<module>");
    let top = b.current_offset();
    b.emit_jump_to(Opcode::JumpAbsolute, top);
    let path = write_code("spin", &b.build());
    let output = coil(&["run", "--max-operations", "500", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("RuntimeError"));
}

#[test]
fn dis_lists_instructions() {
    let code = hello();
    let path = write_code("dis", &code);
    let output = coil(&["dis", path.to_str().unwrap()]);
    assert!(output.status.success());
    assert_text(&output.stdout, &code.disassemble());
}

#[test]
fn malformed_input_is_reported() {
    let dir = std::env::temp_dir().join(format!("coil-cli-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("garbage.json");
    fs::write(&path, "{not json").unwrap();
    let output = coil(&["run", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("error: "));
}
