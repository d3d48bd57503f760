//! Methods of `BaseException`, inherited by every exception class.

use super::super::VM;
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, HeapData},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `BaseException.__new__(cls, *args)`: the instance carries `args` before any
    /// `__init__` runs, so subclasses that skip the base initializer still have them.
    pub(super) fn exception_new(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let ArgValues { args, kwargs } = args;
        kwargs.drop_with_heap(self.heap);
        let class = this.ref_id().filter(|id| matches!(self.heap.get(*id), HeapData::Type(_)));
        let Some(class) = class else {
            args.drop_with_heap(self.heap);
            return Err(ExcType::type_error(format!(
                "BaseException.__new__(X): X is not a type object ({})",
                self.type_name(this)
            )));
        };
        self.instantiate_exception(class, args)
    }

    /// `BaseException.__init__(self, *args)` replaces `args`.
    pub(super) fn exception_init(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let args = args.check_no_kwargs("BaseException", self.heap)?;
        let Some(id) = this.ref_id().filter(|_| self.is_instance_value(this)) else {
            args.drop_with_heap(self.heap);
            return Err(ExcType::type_error(format!(
                "descriptor '__init__' requires a 'BaseException' object but received a '{}'",
                self.type_name(this)
            )));
        };
        let args = self.heap.alloc_tuple(args)?;
        self.set_exception_args(id, args);
        Ok(Value::None)
    }

    pub(super) fn exception_str(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("__str__", self.heap)?;
        let text = self.exception_text(this)?;
        Ok(self.heap.alloc_str(&text)?)
    }

    /// `Name(arg, ...)`, with the trailing comma of a one-tuple dropped.
    pub(super) fn exception_repr(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("__repr__", self.heap)?;
        let items: Vec<Value> = self
            .exception_args(this)
            .iter()
            .map(|v| v.clone_with_heap(self.heap))
            .collect();
        let mut parts = Vec::with_capacity(items.len());
        let mut failed = None;
        for item in &items {
            match self.repr(item) {
                Ok(part) => parts.push(part),
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }
        items.drop_with_heap(self.heap);
        if let Some(err) = failed {
            return Err(err);
        }
        let text = format!("{}({})", self.type_name(this), parts.join(", "));
        Ok(self.heap.alloc_str(&text)?)
    }

    /// `__getattr__` fallback for `args`, `message` and the environment error fields.
    pub(super) fn exception_getattr(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let name = args.get_one_arg("__getattr__", self.heap)?;
        let attr = self.heap.str_text(&name);
        name.drop_with_heap(self.heap);
        let Some(attr) = attr else {
            return Err(ExcType::type_error("attribute name must be string"));
        };
        match self.exception_attr(this, &attr)? {
            Some(value) => Ok(value),
            None => Err(self.attribute_missing(this, &attr)),
        }
    }
}
