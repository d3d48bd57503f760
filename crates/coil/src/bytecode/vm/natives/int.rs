//! `int` and `bool` construction and methods.

use super::super::VM;
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunResult},
    heap::DropWithHeap,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Int, str::repr_bytes},
    value::Value,
};

/// The ValueError for a string `int()` could not parse.
fn invalid_literal(bytes: &[u8], base: u32) -> crate::exception_private::RunError {
    let mut quoted = String::new();
    repr_bytes(bytes, &mut quoted);
    ExcType::value_error(format!("invalid literal for int() with base {base}: {quoted}"))
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `int(x=0, base=10)` and `bool(x=False)`; `this` is the class being called.
    pub(super) fn int_new(&mut self, _this: &Value, args: ArgValues, is_bool: bool) -> RunResult<Value> {
        if is_bool {
            let value = args.get_zero_one_arg("bool", self.heap)?;
            let Some(value) = value else {
                return Ok(Value::Bool(false));
            };
            let truth = self.is_true(&value);
            value.drop_with_heap(self.heap);
            return truth.map(Value::Bool);
        }
        let args = args.get_range("int", 0, 2, self.heap)?;
        let mut args = args.into_iter();
        let Some(value) = args.next() else {
            return Ok(Value::Int(0));
        };
        let base = args.next();
        let result = match base {
            Some(base) => {
                let radix = match Int::from_value(&base, self.heap) {
                    Some(Int::Native(b)) if (2..=36).contains(&b) => u32::try_from(b).ok(),
                    Some(_) => None,
                    None => {
                        let type_name = self.type_name(&base);
                        (value, base).drop_with_heap(self.heap);
                        return Err(ExcType::type_error(format!(
                            "an integer is required (got type {type_name})"
                        )));
                    }
                };
                base.drop_with_heap(self.heap);
                match radix {
                    Some(radix) => self.int_from_text(&value, radix),
                    None => Err(ExcType::value_error("int() base must be >= 2 and <= 36")),
                }
            }
            None => self.int_from_value(&value),
        };
        value.drop_with_heap(self.heap);
        result
    }

    fn int_from_text(&mut self, value: &Value, radix: u32) -> RunResult<Value> {
        let Some(bytes) = self.heap.str_bytes(value) else {
            return Err(ExcType::type_error("int() can't convert non-string with explicit base"));
        };
        let parsed = std::str::from_utf8(bytes).ok().and_then(|text| {
            if radix == 10 {
                Int::parse(text)
            } else {
                Int::parse_radix(text, radix)
            }
        });
        match parsed {
            Some(int) => Ok(int.into_value(self.heap)?),
            None => Err(invalid_literal(bytes, radix)),
        }
    }

    fn int_from_value(&mut self, value: &Value) -> RunResult<Value> {
        if let Some(int) = Int::from_value(value, self.heap) {
            return Ok(int.into_value(self.heap)?);
        }
        if self.is_str(value) {
            return self.int_from_text(value, 10);
        }
        let Some(result) = self.call_method(value, "__int__", ArgValues::empty())? else {
            return Err(ExcType::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                self.type_name(value)
            )));
        };
        match Int::from_value(&result, self.heap) {
            Some(Int::Native(v)) if !matches!(result, Value::Bool(_)) => Ok(Value::Int(v)),
            Some(int) => {
                result.drop_with_heap(self.heap);
                Ok(int.into_value(self.heap)?)
            }
            None => {
                let type_name = self.type_name(&result);
                result.drop_with_heap(self.heap);
                Err(ExcType::type_error(format!("__int__ returned non-int (type {type_name})")))
            }
        }
    }

    pub(super) fn int_bit_length(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("bit_length", self.heap)?;
        match Int::from_value(this, self.heap) {
            Some(int) => Ok(Value::Int(i64::try_from(int.bit_length()).unwrap_or(i64::MAX))),
            None => Err(ExcType::type_error(format!(
                "descriptor 'bit_length' requires a 'int' object but received a '{}'",
                self.type_name(this)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception_private::RunError;

    #[test]
    fn invalid_literal_quotes_the_text() {
        let RunError::Exc(exc) = invalid_literal(b"12x", 10) else {
            panic!("expected a simple exception");
        };
        assert_eq!(exc.arg(), Some("invalid literal for int() with base 10: '12x'"));
    }
}
