//! The functions of the builtins namespace.

use super::super::VM;
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::DropWithHeap,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

/// Number of items `range(start, stop, step)` yields.
fn range_len(start: i64, stop: i64, step: i64) -> u128 {
    let (lo, hi, step) = if step > 0 {
        (i128::from(start), i128::from(stop), i128::from(step))
    } else {
        (i128::from(stop), i128::from(start), -i128::from(step))
    };
    if lo >= hi {
        0
    } else {
        // both operands are positive here
        ((hi - lo - 1) / step + 1).unsigned_abs()
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    pub(super) fn builtin_id(&mut self, args: ArgValues) -> RunResult<Value> {
        let value = args.get_one_arg("id", self.heap)?;
        let id = value.id();
        value.drop_with_heap(self.heap);
        Ok(Value::Int(id))
    }

    pub(super) fn builtin_len(&mut self, args: ArgValues) -> RunResult<Value> {
        let value = args.get_one_arg("len", self.heap)?;
        let len = self.len(&value);
        value.drop_with_heap(self.heap);
        Ok(Value::Int(i64::try_from(len?).unwrap_or(i64::MAX)))
    }

    pub(super) fn builtin_hash(&mut self, args: ArgValues) -> RunResult<Value> {
        let value = args.get_one_arg("hash", self.heap)?;
        let hash = self.hash_value(&value);
        value.drop_with_heap(self.heap);
        hash.map(Value::Int)
    }

    /// Reads an attribute name argument, which must be a string.
    fn attr_name(&self, name: &Value, func: &str) -> RunResult<String> {
        self.heap
            .str_text(name)
            .ok_or_else(|| ExcType::type_error(format!("{func}(): attribute name must be string")))
    }

    pub(super) fn builtin_getattr(&mut self, args: ArgValues) -> RunResult<Value> {
        let mut args = args.get_range("getattr", 2, 3, self.heap)?.into_iter();
        let (Some(obj), Some(name)) = (args.next(), args.next()) else {
            return Err(ExcType::type_error("getattr expected at least 2 arguments"));
        };
        let default = args.next();
        let result = self.attr_name(&name, "getattr").and_then(|attr| {
            let found = self.get_attr(&obj, &attr)?;
            Ok((attr, found))
        });
        let result = match result {
            Ok((_, Some(value))) => Ok(value),
            Ok((attr, None)) => match default {
                Some(default) => {
                    (obj, name).drop_with_heap(self.heap);
                    return Ok(default);
                }
                None => Err(self.attribute_missing(&obj, &attr)),
            },
            Err(err) => Err(err),
        };
        (obj, name, default).drop_with_heap(self.heap);
        result
    }

    pub(super) fn builtin_setattr(&mut self, args: ArgValues) -> RunResult<Value> {
        let mut args = args.get_range("setattr", 3, 3, self.heap)?.into_iter();
        let (Some(obj), Some(name), Some(value)) = (args.next(), args.next(), args.next()) else {
            return Err(ExcType::type_error("setattr expected 3 arguments"));
        };
        let result = match self.attr_name(&name, "setattr") {
            Ok(attr) => self.set_attr(&obj, &attr, value),
            Err(err) => {
                value.drop_with_heap(self.heap);
                Err(err)
            }
        };
        (obj, name).drop_with_heap(self.heap);
        result.map(|()| Value::None)
    }

    pub(super) fn builtin_hasattr(&mut self, args: ArgValues) -> RunResult<Value> {
        let (obj, name) = args.get_two_args("hasattr", self.heap)?;
        let found = self
            .attr_name(&name, "hasattr")
            .and_then(|attr| self.get_attr(&obj, &attr));
        (obj, name).drop_with_heap(self.heap);
        match found {
            Ok(value) => {
                let present = value.is_some();
                value.drop_with_heap(self.heap);
                Ok(Value::Bool(present))
            }
            // like Python 2, any ordinary exception means "no"
            Err(err) if self.error_matches(&err, ExcType::Exception) => {
                err.drop_with_heap(self.heap);
                Ok(Value::Bool(false))
            }
            Err(err) => Err(err),
        }
    }

    pub(super) fn builtin_delattr(&mut self, args: ArgValues) -> RunResult<Value> {
        let (obj, name) = args.get_two_args("delattr", self.heap)?;
        let result = self
            .attr_name(&name, "delattr")
            .and_then(|attr| self.del_attr(&obj, &attr));
        (obj, name).drop_with_heap(self.heap);
        result.map(|()| Value::None)
    }

    pub(super) fn builtin_isinstance(&mut self, args: ArgValues) -> RunResult<Value> {
        let (obj, types) = args.get_two_args("isinstance", self.heap)?;
        let matched = self.class_matches(self.type_of(&obj), &types, "isinstance");
        (obj, types).drop_with_heap(self.heap);
        matched.map(Value::Bool)
    }

    pub(super) fn builtin_issubclass(&mut self, args: ArgValues) -> RunResult<Value> {
        let (class, types) = args.get_two_args("issubclass", self.heap)?;
        let matched = match class.ref_id().filter(|_| self.is_type(&class)) {
            Some(id) => self.class_matches(id, &types, "issubclass"),
            None => Err(ExcType::type_error("issubclass() arg 1 must be a class")),
        };
        (class, types).drop_with_heap(self.heap);
        matched.map(Value::Bool)
    }

    pub(super) fn builtin_repr(&mut self, args: ArgValues) -> RunResult<Value> {
        let value = args.get_one_arg("repr", self.heap)?;
        let text = self.repr(&value);
        value.drop_with_heap(self.heap);
        Ok(self.heap.alloc_str(&text?)?)
    }

    pub(super) fn builtin_next(&mut self, args: ArgValues) -> RunResult<Value> {
        let (iterator, default) = args.get_one_two_args("next", self.heap)?;
        let item = self.iter_next(&iterator);
        iterator.drop_with_heap(self.heap);
        match (item, default) {
            (Ok(Some(item)), default) => {
                default.drop_with_heap(self.heap);
                Ok(item)
            }
            (Ok(None), Some(default)) => Ok(default),
            (Ok(None), None) => Err(ExcType::stop_iteration()),
            (Err(err), default) => {
                default.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    pub(super) fn builtin_iter(&mut self, args: ArgValues) -> RunResult<Value> {
        let value = args.get_one_arg("iter", self.heap)?;
        let iterator = self.get_iter(&value);
        value.drop_with_heap(self.heap);
        iterator
    }

    /// `range([start,] stop[, step])`, returning a list as Python 2 does.
    pub(super) fn builtin_range(&mut self, args: ArgValues) -> RunResult<Value> {
        let args = args.get_range("range", 1, 3, self.heap)?;
        let mut bounds = [0_i64; 3];
        let mut bad = None;
        for (i, arg) in args.iter().enumerate() {
            match arg {
                Value::Int(v) => bounds[i] = *v,
                Value::Bool(b) => bounds[i] = i64::from(*b),
                _ if bad.is_none() => bad = Some((i, self.type_name(arg))),
                _ => {}
            }
        }
        let count = args.len();
        args.drop_with_heap(self.heap);
        if let Some((i, type_name)) = bad {
            let which = match (count, i) {
                (1, _) | (_, 1) => "end",
                (_, 0) => "start",
                _ => "step",
            };
            return Err(ExcType::type_error(format!(
                "range() integer {which} argument expected, got {type_name}."
            )));
        }
        let (start, stop, step) = match count {
            1 => (0, bounds[0], 1),
            2 => (bounds[0], bounds[1], 1),
            _ => (bounds[0], bounds[1], bounds[2]),
        };
        if step == 0 {
            return Err(ExcType::value_error("range() step argument must not be zero"));
        }
        let len = usize::try_from(range_len(start, stop, step))
            .map_err(|_| RunError::from(SimpleException::new_msg(ExcType::OverflowError, "range() result has too many items")))?;
        self.check_result_size(len, size_of::<Value>())?;
        let items: Vec<Value> = (0..len)
            .scan(start, |next, _| {
                let current = *next;
                *next = next.wrapping_add(step);
                Some(Value::Int(current))
            })
            .collect();
        Ok(self.heap.alloc_list(items)?)
    }
}

#[cfg(test)]
mod tests {
    use super::range_len;

    #[test]
    fn range_lengths() {
        assert_eq!(range_len(0, 10, 1), 10);
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(10, 0, -1), 10);
        assert_eq!(range_len(10, 0, -3), 4);
        assert_eq!(range_len(5, 5, 1), 0);
        assert_eq!(range_len(5, 0, 1), 0);
        assert_eq!(range_len(i64::MIN, i64::MAX, i64::MAX), 3);
    }
}
