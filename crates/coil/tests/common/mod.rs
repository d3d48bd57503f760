//! Shorthand for assembling code objects in tests.
#![allow(dead_code, reason = "each test binary uses a different subset")]

use coil::{
    CodeBuilder, CollectStringPrint, CompareOp, Const, Exception, Interpreter, JumpLabel, NoPrint, Object, Opcode,
};

/// A module-level builder with a fixed filename and a roomy operand stack.
pub fn module() -> CodeBuilder {
    let mut b = CodeBuilder::new("<module>");
    b.set_filename("test.py");
    b.set_stack_size(32);
    b
}

/// A function body builder with fast locals for `args`.
pub fn function(name: &str, args: &[&str]) -> CodeBuilder {
    let mut b = CodeBuilder::new(name);
    b.set_filename("test.py");
    b.set_flags(coil::Code::NEWLOCALS);
    b.set_args(args);
    b.set_stack_size(32);
    b
}

pub trait Asm {
    fn konst(&mut self, value: Const);
    fn int(&mut self, value: i64);
    fn str(&mut self, value: &str);
    fn none(&mut self);
    fn load(&mut self, name: &str);
    fn store(&mut self, name: &str);
    fn load_fast(&mut self, name: &str);
    fn store_fast(&mut self, name: &str);
    fn load_global(&mut self, name: &str);
    fn attr(&mut self, name: &str);
    fn store_attr(&mut self, name: &str);
    fn call(&mut self, positional: u8);
    fn call_kw(&mut self, positional: u8, keywords: u8);
    fn compare(&mut self, op: CompareOp);
    fn pop(&mut self);
    fn ret(&mut self);
    /// `return None`, the usual tail of a module.
    fn ret_none(&mut self);
    /// Calls `obj.method(*args)` where the receiver and arguments are already pushed by `push`.
    fn method_call(&mut self, receiver: &str, method: &str, push: impl FnOnce(&mut Self) -> u8);
    /// Defines `name` in the current namespace from a finished function body.
    fn def(&mut self, name: &str, body: coil::Code, defaults: &[Const]);
    /// Opens `except Type:` handling; returns the label that skips to the re-raise.
    fn except_match(&mut self, exc_type: &str) -> JumpLabel;
}

impl Asm for CodeBuilder {
    fn konst(&mut self, value: Const) {
        let index = self.add_const(value);
        self.emit_arg(Opcode::LoadConst, index);
    }

    fn int(&mut self, value: i64) {
        self.konst(Const::Int(value));
    }

    fn str(&mut self, value: &str) {
        self.konst(Const::Str(value.to_owned()));
    }

    fn none(&mut self) {
        self.konst(Const::None);
    }

    fn load(&mut self, name: &str) {
        let index = self.add_name(name);
        self.emit_arg(Opcode::LoadName, index);
    }

    fn store(&mut self, name: &str) {
        let index = self.add_name(name);
        self.emit_arg(Opcode::StoreName, index);
    }

    fn load_fast(&mut self, name: &str) {
        let index = self.add_varname(name);
        self.emit_arg(Opcode::LoadFast, index);
    }

    fn store_fast(&mut self, name: &str) {
        let index = self.add_varname(name);
        self.emit_arg(Opcode::StoreFast, index);
    }

    fn load_global(&mut self, name: &str) {
        let index = self.add_name(name);
        self.emit_arg(Opcode::LoadGlobal, index);
    }

    fn attr(&mut self, name: &str) {
        let index = self.add_name(name);
        self.emit_arg(Opcode::LoadAttr, index);
    }

    fn store_attr(&mut self, name: &str) {
        let index = self.add_name(name);
        self.emit_arg(Opcode::StoreAttr, index);
    }

    fn call(&mut self, positional: u8) {
        self.emit_call(Opcode::CallFunction, positional, 0);
    }

    fn call_kw(&mut self, positional: u8, keywords: u8) {
        self.emit_call(Opcode::CallFunction, positional, keywords);
    }

    fn compare(&mut self, op: CompareOp) {
        self.emit_arg(Opcode::CompareOp, op as u32);
    }

    fn pop(&mut self) {
        self.emit(Opcode::PopTop);
    }

    fn ret(&mut self) {
        self.emit(Opcode::ReturnValue);
    }

    fn ret_none(&mut self) {
        self.none();
        self.ret();
    }

    fn method_call(&mut self, receiver: &str, method: &str, push: impl FnOnce(&mut Self) -> u8) {
        self.load(receiver);
        self.attr(method);
        let argc = push(self);
        self.call(argc);
    }

    fn def(&mut self, name: &str, body: coil::Code, defaults: &[Const]) {
        for default in defaults {
            self.konst(default.clone());
        }
        self.konst(Const::Code(Box::new(body)));
        self.emit_arg(Opcode::MakeFunction, u32::try_from(defaults.len()).unwrap());
        self.store(name);
    }

    fn except_match(&mut self, exc_type: &str) -> JumpLabel {
        self.emit(Opcode::DupTop);
        self.load(exc_type);
        self.compare(CompareOp::ExcMatch);
        let no_match = self.emit_jump(Opcode::PopJumpIfFalse);
        self.pop();
        self.pop();
        self.pop();
        no_match
    }
}

/// Runs `code` in a fresh interpreter without limits or output.
pub fn run(code: &coil::Code) -> Result<Object, Exception> {
    Interpreter::new_no_limits().unwrap().execute(code, &mut NoPrint)
}

/// Runs `code` and returns what it printed alongside the result.
pub fn run_printing(code: &coil::Code) -> (Result<Object, Exception>, String) {
    let mut print = CollectStringPrint::new();
    let result = Interpreter::new_no_limits().unwrap().execute(code, &mut print);
    (result, print.into_output())
}

pub fn s(text: &str) -> Object {
    Object::String(text.to_owned())
}
