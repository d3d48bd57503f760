//! Comparisons, truth testing and membership.

use std::cmp::Ordering;

use super::VM;
use crate::{
    args::ArgValues,
    bytecode::CompareOp,
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::Int,
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// The `CompareOp` opcode.
    pub(super) fn compare_op(&mut self, cmp: CompareOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        match cmp {
            CompareOp::Is => Ok(Value::Bool(lhs.is(rhs))),
            CompareOp::IsNot => Ok(Value::Bool(!lhs.is(rhs))),
            CompareOp::In => self.contains(rhs, lhs).map(Value::Bool),
            CompareOp::NotIn => self.contains(rhs, lhs).map(|found| Value::Bool(!found)),
            CompareOp::ExcMatch => Ok(Value::Bool(self.exception_matches(lhs, rhs))),
            _ => self.rich_compare(cmp, lhs, rhs),
        }
    }

    /// `except` clause matching: `pattern` is a class or a tuple of classes.
    fn exception_matches(&self, kind: &Value, pattern: &Value) -> bool {
        let Some(kind) = kind.ref_id() else {
            return false;
        };
        let matches_one = |candidate: &Value| match candidate.ref_id() {
            Some(id) if matches!(self.heap.get(id), HeapData::Type(_)) => self.is_subclass(kind, id),
            _ => false,
        };
        if self.is_tuple(pattern) {
            self.heap
                .sequence_items(pattern)
                .is_some_and(|items| items.iter().any(matches_one))
        } else {
            matches_one(pattern)
        }
    }

    /// One of the six ordering/equality operators.
    ///
    /// Builtin payloads compare directly. Otherwise `lhs.__op__(rhs)` is tried, then the
    /// reflected method on `rhs`; if both decline, equality falls back to identity and
    /// ordering to a fixed but arbitrary order of types.
    pub(crate) fn rich_compare(&mut self, cmp: CompareOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        if let Some(result) = self.builtin_compare(cmp, lhs, rhs)? {
            return Ok(Value::Bool(result));
        }
        let Some((name, reflected)) = cmp.dunder() else {
            return Err(ExcType::system_error(format!("{cmp} is not a rich comparison")));
        };
        if let Some(result) = self.try_compare_dunder(lhs, name, rhs)? {
            return Ok(result);
        }
        if let Some(result) = self.try_compare_dunder(rhs, reflected, lhs)? {
            return Ok(result);
        }
        let ordering = match cmp {
            CompareOp::Eq => return Ok(Value::Bool(lhs.is(rhs))),
            CompareOp::Ne => return Ok(Value::Bool(!lhs.is(rhs))),
            _ => self.fallback_order(lhs, rhs),
        };
        Ok(Value::Bool(ordering_holds(cmp, ordering)))
    }

    fn try_compare_dunder(&mut self, obj: &Value, name: &str, other: &Value) -> RunResult<Option<Value>> {
        // builtin payloads already had their say in `builtin_compare`
        if !self.is_instance_value(obj) && !self.is_type(obj) {
            return Ok(None);
        }
        let arg = other.clone_with_heap(self.heap);
        match self.call_method(obj, name, ArgValues::one(arg))? {
            Some(Value::NotImplemented) | None => Ok(None),
            Some(result) => Ok(Some(result)),
        }
    }

    /// Comparison between builtin payloads. `Ok(None)` when user code has to decide.
    pub(crate) fn builtin_compare(&mut self, cmp: CompareOp, lhs: &Value, rhs: &Value) -> RunResult<Option<bool>> {
        if let (Some(a), Some(b)) = (Int::from_value(lhs, self.heap), Int::from_value(rhs, self.heap)) {
            return Ok(Some(ordering_holds(cmp, a.cmp(&b))));
        }
        if let (Some(a), Some(b)) = (self.heap.str_bytes(lhs), self.heap.str_bytes(rhs)) {
            return Ok(Some(ordering_holds(cmp, a.cmp(b))));
        }
        let same_sequence = match (lhs.ref_id(), rhs.ref_id()) {
            (Some(a), Some(b)) => matches!(
                (self.heap.get(a), self.heap.get(b)),
                (HeapData::Tuple(_), HeapData::Tuple(_)) | (HeapData::List(_), HeapData::List(_))
            ),
            _ => false,
        };
        if same_sequence {
            return self.sequence_compare(cmp, lhs, rhs).map(Some);
        }
        let both_dicts = match (lhs.ref_id(), rhs.ref_id()) {
            (Some(a), Some(b)) => matches!((self.heap.get(a), self.heap.get(b)), (HeapData::Dict(_), HeapData::Dict(_))),
            _ => false,
        };
        if both_dicts && matches!(cmp, CompareOp::Eq | CompareOp::Ne) {
            let equal = self.dict_equal(lhs, rhs)?;
            return Ok(Some(equal == (cmp == CompareOp::Eq)));
        }
        if self.is_instance_value(lhs) || self.is_instance_value(rhs) {
            return Ok(None);
        }
        if self.is_type(lhs) || self.is_type(rhs) {
            return Ok(None);
        }
        match cmp {
            CompareOp::Eq | CompareOp::Ne => match self.heap.builtin_eq(lhs, rhs) {
                Some(equal) => Ok(Some(equal == (cmp == CompareOp::Eq))),
                None => Ok(None),
            },
            _ => Ok(Some(ordering_holds(cmp, self.fallback_order(lhs, rhs)))),
        }
    }

    /// Lexicographic comparison of two tuples or two lists, with item equality dispatched.
    fn sequence_compare(&mut self, cmp: CompareOp, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        let left = self.heap.clone_sequence_items(lhs).unwrap_or_default();
        let right = self.heap.clone_sequence_items(rhs).unwrap_or_default();
        let result = self.compare_items(cmp, &left, &right);
        (left, right).drop_with_heap(self.heap);
        result
    }

    fn compare_items(&mut self, cmp: CompareOp, left: &[Value], right: &[Value]) -> RunResult<bool> {
        for (a, b) in left.iter().zip(right) {
            if self.eq(a, b)? {
                continue;
            }
            return match cmp {
                CompareOp::Eq => Ok(false),
                CompareOp::Ne => Ok(true),
                _ => {
                    let result = self.rich_compare(cmp, a, b)?;
                    let truth = self.is_true(&result);
                    result.drop_with_heap(self.heap);
                    truth
                }
            };
        }
        Ok(ordering_holds(cmp, left.len().cmp(&right.len())))
    }

    fn dict_equal(&mut self, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        let (Some(a), Some(b)) = (lhs.ref_id(), rhs.ref_id()) else {
            return Ok(false);
        };
        if self.dict_len(a) != self.dict_len(b) {
            return Ok(false);
        }
        let mut pairs = self.dict_pairs(a).into_iter();
        while let Some((key, value)) = pairs.next() {
            let found = self.dict_get(b, &key);
            let same = match found {
                Ok(Some(other)) => {
                    let same = self.eq(&value, &other);
                    other.drop_with_heap(self.heap);
                    same
                }
                Ok(None) => Ok(false),
                Err(err) => Err(err),
            };
            (key, value).drop_with_heap(self.heap);
            match same {
                Ok(true) => {}
                other => {
                    pairs.drop_with_heap(self.heap);
                    return other;
                }
            }
        }
        Ok(true)
    }

    /// Order used when neither operand defines the comparison: `None` first, then numbers,
    /// then by type name, then by identity.
    fn fallback_order(&self, lhs: &Value, rhs: &Value) -> Ordering {
        let rank = |v: &Value| match v {
            Value::None => 0,
            Value::Bool(_) | Value::Int(_) => 1,
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::LongInt(_)) => 1,
            _ => 2,
        };
        rank(lhs)
            .cmp(&rank(rhs))
            .then_with(|| self.type_name(lhs).cmp(&self.type_name(rhs)))
            .then_with(|| lhs.id().cmp(&rhs.id()))
    }

    /// `lhs == rhs` reduced to a bool.
    pub(crate) fn eq(&mut self, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        if let Some(equal) = self.heap.builtin_eq(lhs, rhs) {
            return Ok(equal);
        }
        let result = self.rich_compare(CompareOp::Eq, lhs, rhs)?;
        let truth = self.is_true(&result);
        result.drop_with_heap(self.heap);
        truth
    }

    /// `lhs < rhs` reduced to a bool, used by sorting.
    pub(crate) fn less_than(&mut self, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        let result = self.rich_compare(CompareOp::Lt, lhs, rhs)?;
        let truth = self.is_true(&result);
        result.drop_with_heap(self.heap);
        truth
    }

    /// Truth value: `__nonzero__`, then `__len__`, otherwise true.
    pub(crate) fn is_true(&mut self, value: &Value) -> RunResult<bool> {
        match value {
            Value::None => return Ok(false),
            Value::NotImplemented => return Ok(true),
            Value::Bool(b) => return Ok(*b),
            Value::Int(i) => return Ok(*i != 0),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Str(s) => return Ok(s.len() != 0),
                HeapData::Tuple(t) => return Ok(t.len() != 0),
                HeapData::List(l) => return Ok(l.len() != 0),
                HeapData::Dict(d) => return Ok(!d.is_empty()),
                HeapData::LongInt(_) => return Ok(true),
                HeapData::Instance(_) => {}
                _ => return Ok(true),
            },
            #[cfg(feature = "ref-count-panic")]
            Value::Dereferenced => return Ok(false),
        }
        if let Some(result) = self.call_method(value, "__nonzero__", ArgValues::empty())? {
            return match result {
                Value::Bool(b) => Ok(b),
                Value::Int(i) => Ok(i != 0),
                other => {
                    let is_long = matches!(other.ref_id().map(|id| self.heap.get(id)), Some(HeapData::LongInt(_)));
                    let type_name = self.type_name(&other);
                    other.drop_with_heap(self.heap);
                    if is_long {
                        Ok(true)
                    } else {
                        Err(ExcType::type_error(format!(
                            "__nonzero__ should return bool or int, returned {type_name}"
                        )))
                    }
                }
            };
        }
        if let Some(len) = self.call_method(value, "__len__", ArgValues::empty())? {
            return self.len_result(len).map(|n| n != 0);
        }
        Ok(true)
    }

    /// Validates the value a `__len__` returned.
    pub(crate) fn len_result(&mut self, len: Value) -> RunResult<usize> {
        let n = Int::from_value(&len, self.heap);
        len.drop_with_heap(self.heap);
        match n {
            Some(n) if n.is_negative() => Err(ExcType::value_error("__len__() should return >= 0")),
            Some(n) => usize::try_from(n.saturating_i64())
                .map_err(|_| ExcType::value_error("__len__() should return >= 0")),
            None => Err(ExcType::type_error("an integer is required")),
        }
    }

    /// `item in container`.
    pub(crate) fn contains(&mut self, container: &Value, item: &Value) -> RunResult<bool> {
        if let Some(haystack) = self.heap.str_bytes(container) {
            let Some(needle) = self.heap.str_bytes(item) else {
                return Err(ExcType::type_error("'in <string>' requires string as left operand"));
            };
            return Ok(crate::types::str::find(haystack, needle, crate::types::str::SearchDir::Forward).is_some());
        }
        if let Some(id) = container.ref_id() {
            match self.heap.get(id) {
                HeapData::Dict(_) => return self.dict_get(id, item).map(|found| {
                    let present = found.is_some();
                    found.drop_with_heap(self.heap);
                    present
                }),
                HeapData::Tuple(_) | HeapData::List(_) => {
                    let items = self.heap.clone_sequence_items(container).unwrap_or_default();
                    let result = self.any_equal(&items, item);
                    items.drop_with_heap(self.heap);
                    return result;
                }
                _ => {}
            }
        }
        if self.is_instance_value(container) {
            let arg = item.clone_with_heap(self.heap);
            if let Some(result) = self.call_method(container, "__contains__", ArgValues::one(arg))? {
                let truth = self.is_true(&result);
                result.drop_with_heap(self.heap);
                return truth;
            }
        }
        let iterator = match self.get_iter(container) {
            Ok(iterator) => iterator,
            Err(err) if self.error_matches(&err, ExcType::TypeError) => {
                err.drop_with_heap(self.heap);
                return Err(ExcType::type_error(format!(
                    "argument of type '{}' is not iterable",
                    self.type_name(container)
                )));
            }
            Err(err) => return Err(err),
        };
        let result = self.iterator_contains(&iterator, item);
        iterator.drop_with_heap(self.heap);
        result
    }

    fn any_equal(&mut self, items: &[Value], item: &Value) -> RunResult<bool> {
        for candidate in items {
            if self.eq(candidate, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn iterator_contains(&mut self, iterator: &Value, item: &Value) -> RunResult<bool> {
        while let Some(next) = self.iter_next(iterator)? {
            let equal = self.eq(&next, item);
            next.drop_with_heap(self.heap);
            if equal? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether `class` is one of `types` (a type or a tuple of types), for `isinstance`
    /// and `issubclass`.
    pub(crate) fn class_matches(&self, class: HeapId, types: &Value, func: &str) -> RunResult<bool> {
        if let Some(items) = self.heap.sequence_items(types).filter(|_| self.is_tuple(types)) {
            for item in items {
                if self.class_matches(class, item, func)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        match types.ref_id() {
            Some(id) if matches!(self.heap.get(id), HeapData::Type(_)) => Ok(self.is_subclass(class, id)),
            _ => Err(ExcType::type_error(format!(
                "{func}() arg 2 must be a class, type, or tuple of classes and types"
            ))),
        }
    }
}

fn ordering_holds(cmp: CompareOp, ordering: Ordering) -> bool {
    match cmp {
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orderings_map_to_operators() {
        assert!(ordering_holds(CompareOp::Le, Ordering::Equal));
        assert!(!ordering_holds(CompareOp::Lt, Ordering::Equal));
        assert!(ordering_holds(CompareOp::Ne, Ordering::Less));
        assert!(!ordering_holds(CompareOp::In, Ordering::Equal));
    }
}
