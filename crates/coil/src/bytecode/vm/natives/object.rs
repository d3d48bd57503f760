//! `object`'s default methods and the protocol methods shared by the builtin types.

use super::super::{
    VM,
    binary::{BinaryOp, UnaryOp},
};
use crate::{
    args::ArgValues,
    bytecode::CompareOp,
    exception_private::{ExcType, RunResult},
    heap::DropWithHeap,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    // ========================================================================
    // object
    // ========================================================================

    /// `object.__init__`: rejects arguments unless the class has its own `__new__` to
    /// consume them.
    pub(super) fn object_init(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let given = args.count();
        args.drop_with_heap(self.heap);
        if given > 0 {
            let has_new = self
                .type_dict(self.type_of(this))
                .is_some_and(|dict| self.heap.dict_get_str(dict, "__new__").is_some());
            if !has_new {
                return Err(ExcType::type_error("object.__init__() takes no parameters"));
            }
        }
        Ok(Value::None)
    }

    pub(super) fn object_hash(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("__hash__", self.heap)?;
        Ok(Value::Int(this.id()))
    }

    /// `object.__str__` defers to the repr, which may be user defined.
    pub(super) fn object_str(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("__str__", self.heap)?;
        let text = self.repr(this)?;
        Ok(self.heap.alloc_str(&text)?)
    }

    pub(super) fn object_repr(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("__repr__", self.heap)?;
        let text = self.default_repr(this);
        Ok(self.heap.alloc_str(&text)?)
    }

    fn name_arg(&mut self, name: &Value) -> RunResult<String> {
        self.heap.str_text(name).ok_or_else(|| {
            ExcType::type_error(format!(
                "attribute name must be string, not '{}'",
                self.type_name(name)
            ))
        })
    }

    pub(super) fn object_getattr_native(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let name = args.get_one_arg("__getattr__", self.heap)?;
        let attr = self.name_arg(&name);
        name.drop_with_heap(self.heap);
        let attr = attr?;
        match self.generic_getattr(this, &attr)? {
            Some(value) => Ok(value),
            None => Err(self.attribute_missing(this, &attr)),
        }
    }

    pub(super) fn object_setattr_native(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let (name, value) = args.get_two_args("__setattr__", self.heap)?;
        let attr = self.name_arg(&name);
        name.drop_with_heap(self.heap);
        match attr {
            Ok(attr) => self.generic_setattr(this, &attr, value).map(|()| Value::None),
            Err(err) => {
                value.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    pub(super) fn object_delattr_native(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let name = args.get_one_arg("__delattr__", self.heap)?;
        let attr = self.name_arg(&name);
        name.drop_with_heap(self.heap);
        self.generic_delattr(this, &attr?).map(|()| Value::None)
    }

    /// `object.__eq__`/`__ne__`: decides only for the identical object.
    pub(super) fn object_eq(&mut self, this: &Value, args: ArgValues, eq: bool) -> RunResult<Value> {
        let other = args.get_one_arg(if eq { "__eq__" } else { "__ne__" }, self.heap)?;
        let same = this.is(&other);
        other.drop_with_heap(self.heap);
        Ok(if same { Value::Bool(eq) } else { Value::NotImplemented })
    }

    // ========================================================================
    // Protocol methods of the builtin types
    // ========================================================================

    /// Protocol natives operate on builtin payloads; reached with an instance they
    /// would only dispatch straight back to the instance's own method.
    fn require_builtin(&self, this: &Value, method: &str) -> RunResult<()> {
        if self.is_instance_value(this) {
            return Err(ExcType::type_error(format!(
                "descriptor '{method}' requires a builtin object but received a '{}'",
                self.type_name(this)
            )));
        }
        Ok(())
    }

    pub(super) fn dunder_len(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("__len__", self.heap)?;
        self.require_builtin(this, "__len__")?;
        let len = self.len(this)?;
        Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
    }

    pub(super) fn dunder_getitem(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let index = args.get_one_arg("__getitem__", self.heap)?;
        let result = self
            .require_builtin(this, "__getitem__")
            .and_then(|()| self.get_item(this, &index));
        index.drop_with_heap(self.heap);
        result
    }

    pub(super) fn dunder_setitem(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let (index, value) = args.get_two_args("__setitem__", self.heap)?;
        let result = match self.require_builtin(this, "__setitem__") {
            Ok(()) => self.set_item(this, &index, value),
            Err(err) => {
                value.drop_with_heap(self.heap);
                Err(err)
            }
        };
        index.drop_with_heap(self.heap);
        result.map(|()| Value::None)
    }

    pub(super) fn dunder_delitem(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let index = args.get_one_arg("__delitem__", self.heap)?;
        let result = self
            .require_builtin(this, "__delitem__")
            .and_then(|()| self.del_item(this, &index));
        index.drop_with_heap(self.heap);
        result.map(|()| Value::None)
    }

    pub(super) fn dunder_contains(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let item = args.get_one_arg("__contains__", self.heap)?;
        let result = self
            .require_builtin(this, "__contains__")
            .and_then(|()| self.contains(this, &item));
        item.drop_with_heap(self.heap);
        result.map(Value::Bool)
    }

    pub(super) fn dunder_iter(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("__iter__", self.heap)?;
        self.require_builtin(this, "__iter__")?;
        self.get_iter(this)
    }

    pub(super) fn dunder_nonzero(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("__nonzero__", self.heap)?;
        self.require_builtin(this, "__nonzero__")?;
        self.is_true(this).map(Value::Bool)
    }

    /// `int.__add__` and friends: `NotImplemented` when the operand types do not fit.
    pub(super) fn dunder_binary(&mut self, op: BinaryOp, this: &Value, args: ArgValues) -> RunResult<Value> {
        let other = args.get_one_arg(op.dunders().0, self.heap)?;
        let result = self.builtin_binary(op, this, &other);
        other.drop_with_heap(self.heap);
        Ok(result?.unwrap_or(Value::NotImplemented))
    }

    pub(super) fn dunder_unary(&mut self, op: UnaryOp, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args(op.dunder(), self.heap)?;
        match self.builtin_unary(op, this)? {
            Some(result) => Ok(result),
            None => Err(ExcType::unary_type_error(op.symbol(), &self.type_name(this))),
        }
    }

    pub(super) fn dunder_compare(&mut self, op: CompareOp, this: &Value, args: ArgValues) -> RunResult<Value> {
        let name = op.dunder().map_or("__cmp__", |(name, _)| name);
        let other = args.get_one_arg(name, self.heap)?;
        let same_kind = self.type_of(this) == self.type_of(&other)
            || (self.isinstance(this, self.rt.types.int) && self.isinstance(&other, self.rt.types.int));
        let result = if same_kind {
            self.builtin_compare(op, this, &other)
        } else {
            Ok(None)
        };
        other.drop_with_heap(self.heap);
        Ok(result?.map_or(Value::NotImplemented, Value::Bool))
    }

    /// `iterator.next()`.
    pub(super) fn iterator_next(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("next", self.heap)?;
        match self.iter_next(this)? {
            Some(item) => Ok(item),
            None => Err(ExcType::stop_iteration()),
        }
    }
}
