use std::rc::Rc;

use crate::{
    bytecode::{Code, NativeId},
    heap::HeapId,
    value::Value,
};

/// Heap payload of a code object: the immutable `Code` plus its materialized constants.
#[derive(Debug)]
pub(crate) struct CodeObject {
    pub code: Rc<Code>,
    /// Constants converted to runtime values, indexed like `Code::consts`.
    pub consts: Vec<Value>,
}

/// An interpreted function created by `MakeFunction`.
#[derive(Debug)]
pub(crate) struct Function {
    pub name: String,
    /// Owned reference to a `CodeObject`.
    pub code: HeapId,
    /// Owned reference to the globals dict the function was defined in.
    pub globals: HeapId,
    /// Default values for the trailing declared arguments.
    pub defaults: Vec<Value>,
}

/// A function implemented in Rust.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeFunction {
    pub name: &'static str,
    pub id: NativeId,
}

/// A function looked up through a type: bound to an instance, or unbound.
#[derive(Debug)]
pub(crate) struct Method {
    /// Owned reference to the type the function was found on.
    pub owner: HeapId,
    pub func: Value,
    pub bound_self: Option<Value>,
}

fn push_ref(value: &mut Value, stack: &mut Vec<HeapId>) {
    if let Value::Ref(id) = value {
        stack.push(*id);
        #[cfg(feature = "ref-count-panic")]
        value.dec_ref_forget();
    }
}

impl CodeObject {
    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for value in &mut self.consts {
            push_ref(value, stack);
        }
    }
}

impl Function {
    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        stack.push(self.code);
        stack.push(self.globals);
        for value in &mut self.defaults {
            push_ref(value, stack);
        }
    }
}

impl Method {
    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        stack.push(self.owner);
        push_ref(&mut self.func, stack);
        if let Some(value) = &mut self.bound_self {
            push_ref(value, stack);
        }
    }
}
