use crate::{
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap},
    resource::ResourceTracker,
    value::Value,
};

/// Arguments of a call: positionals in order plus keyword pairs.
///
/// Both halves are owned; every consumer either moves the values on or releases them
/// with `drop_with_heap`, including on error paths.
#[derive(Debug, Default)]
pub(crate) struct ArgValues {
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

impl ArgValues {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Vec::new(),
        }
    }

    #[must_use]
    pub fn one(arg: Value) -> Self {
        Self::new(vec![arg])
    }

    #[must_use]
    pub fn two(a: Value, b: Value) -> Self {
        Self::new(vec![a, b])
    }

    /// Total number of arguments, positional and keyword.
    #[must_use]
    pub fn count(&self) -> usize {
        self.args.len() + self.kwargs.len()
    }

    /// Inserts `value` as the first positional argument (binding `self`).
    pub fn prepend(&mut self, value: Value) {
        self.args.insert(0, value);
    }

    /// Fails with "f() takes no keyword arguments" when keywords were passed.
    ///
    /// On error, properly drops all contained values to maintain reference counts.
    pub fn check_no_kwargs(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<Vec<Value>> {
        if self.kwargs.is_empty() {
            Ok(self.args)
        } else {
            self.drop_with_heap(heap);
            Err(ExcType::type_error_no_kwargs(name))
        }
    }

    /// Checks that zero arguments were passed.
    pub fn check_zero_args(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<()> {
        if self.count() == 0 {
            Ok(())
        } else {
            let count = self.count();
            self.drop_with_heap(heap);
            Err(ExcType::type_error_no_args(name, count))
        }
    }

    /// Checks that exactly one positional argument was passed, returning it.
    pub fn get_one_arg(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<Value> {
        let mut args = self.check_no_kwargs(name, heap)?;
        if args.len() == 1 {
            Ok(args.remove(0))
        } else {
            let count = args.len();
            args.drop_with_heap(heap);
            Err(ExcType::type_error_arg_count(name, 1, count))
        }
    }

    /// Checks that exactly two positional arguments were passed.
    pub fn get_two_args(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<(Value, Value)> {
        let args = self.check_no_kwargs(name, heap)?;
        if args.len() == 2 {
            let mut iter = args.into_iter();
            match (iter.next(), iter.next()) {
                (Some(a), Some(b)) => Ok((a, b)),
                _ => unreachable!("length checked above"),
            }
        } else {
            let count = args.len();
            args.drop_with_heap(heap);
            Err(ExcType::type_error_arg_count(name, 2, count))
        }
    }

    /// Checks that zero or one positional argument was passed.
    pub fn get_zero_one_arg(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<Option<Value>> {
        let mut args = self.check_no_kwargs(name, heap)?;
        match args.len() {
            0 => Ok(None),
            1 => Ok(args.pop()),
            count => {
                args.drop_with_heap(heap);
                Err(ExcType::type_error_at_most(name, 1, count))
            }
        }
    }

    /// Checks that one or two positional arguments were passed.
    pub fn get_one_two_args(
        self,
        name: &str,
        heap: &mut Heap<impl ResourceTracker>,
    ) -> RunResult<(Value, Option<Value>)> {
        let args = self.get_range(name, 1, 2, heap)?;
        let mut iter = args.into_iter();
        match iter.next() {
            Some(first) => Ok((first, iter.next())),
            None => unreachable!("range checked"),
        }
    }

    /// Returns the positionals when their count lies in `min..=max`.
    ///
    /// On error, properly drops all contained values to maintain reference counts.
    pub fn get_range(
        self,
        name: &str,
        min: usize,
        max: usize,
        heap: &mut Heap<impl ResourceTracker>,
    ) -> RunResult<Vec<Value>> {
        let args = self.check_no_kwargs(name, heap)?;
        let count = args.len();
        if count < min {
            args.drop_with_heap(heap);
            Err(ExcType::type_error_at_least(name, min, count))
        } else if count > max {
            args.drop_with_heap(heap);
            Err(ExcType::type_error_at_most(name, max, count))
        } else {
            Ok(args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exception_private::RunError, resource::NoLimitTracker};

    fn message(err: RunError) -> String {
        match err {
            RunError::Exc(exc) => exc.to_string(),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn arity_errors_match_builtin_messages() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let err = ArgValues::two(Value::Int(1), Value::Int(2))
            .get_one_arg("len", &mut heap)
            .unwrap_err();
        assert_eq!(message(err), "TypeError: len() takes exactly one argument (2 given)");

        let err = ArgValues::empty().get_one_two_args("getattr", &mut heap).unwrap_err();
        assert_eq!(message(err), "TypeError: getattr expected at least 1 arguments, got 0");
    }

    #[test]
    fn keywords_are_rejected_and_released() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let value = heap.alloc_str("v").expect("alloc");
        let args = ArgValues {
            args: vec![],
            kwargs: vec![("key".to_owned(), value)],
        };
        let err = args.check_no_kwargs("append", &mut heap).unwrap_err();
        assert_eq!(message(err), "TypeError: append() takes no keyword arguments");
        assert_eq!(heap.heap_stats().live_objects, 0);
    }
}
