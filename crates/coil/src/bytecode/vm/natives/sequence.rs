//! `tuple` and `list` construction and methods.

use super::super::VM;
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Int, str::clamp_range},
    value::Value,
};

/// Inserts `index` into `order` after every element that does not sort after it.
///
/// `before(a, b)` answers whether `a` must come strictly before `b`, so equal
/// elements keep their original order.
fn insertion_point(
    order: &[usize],
    index: usize,
    mut before: impl FnMut(usize, usize) -> RunResult<bool>,
) -> RunResult<usize> {
    let (mut lo, mut hi) = (0, order.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if before(index, order[mid])? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    fn list_of(&self, this: &Value, method: &str) -> RunResult<HeapId> {
        this.ref_id()
            .filter(|id| matches!(self.heap.get(*id), HeapData::List(_)))
            .ok_or_else(|| {
                ExcType::type_error(format!(
                    "descriptor '{method}' requires a 'list' object but received a '{}'",
                    self.type_name(this)
                ))
            })
    }

    fn list_len(&self, id: HeapId) -> usize {
        match self.heap.get(id) {
            HeapData::List(list) => list.len(),
            _ => 0,
        }
    }

    /// `tuple(iterable=())`; a tuple argument is returned as is.
    pub(super) fn tuple_new(&mut self, _this: &Value, args: ArgValues) -> RunResult<Value> {
        let Some(iterable) = args.get_zero_one_arg("tuple", self.heap)? else {
            return Ok(self.heap.alloc_tuple(Vec::new())?);
        };
        if self.is_tuple(&iterable) {
            return Ok(iterable);
        }
        let items = self.collect(&iterable);
        iterable.drop_with_heap(self.heap);
        Ok(self.heap.alloc_tuple(items?)?)
    }

    /// `list(iterable=())`, always a new list.
    pub(super) fn list_new(&mut self, _this: &Value, args: ArgValues) -> RunResult<Value> {
        let Some(iterable) = args.get_zero_one_arg("list", self.heap)? else {
            return Ok(self.heap.alloc_list(Vec::new())?);
        };
        let items = self.collect(&iterable);
        iterable.drop_with_heap(self.heap);
        Ok(self.heap.alloc_list(items?)?)
    }

    pub(super) fn list_append(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let item = args.get_one_arg("append", self.heap)?;
        match self.list_of(this, "append") {
            Ok(id) => self.list_extend_items(id, vec![item]).map(|()| Value::None),
            Err(err) => {
                item.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    /// `insert(index, item)`: negative indices count from the end, then clamp.
    pub(super) fn list_insert(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let (index, item) = args.get_two_args("insert", self.heap)?;
        let position = self.list_of(this, "insert").and_then(|id| {
            let index = Int::from_value(&index, self.heap)
                .ok_or_else(|| ExcType::type_error("an integer is required"))?
                .saturating_i64();
            let (position, _) = clamp_range(self.list_len(id), Some(index), None);
            Ok((id, position))
        });
        index.drop_with_heap(self.heap);
        let (id, position) = match position {
            Ok(found) => found,
            Err(err) => {
                item.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        if let Err(err) = self.heap.on_container_insert() {
            item.drop_with_heap(self.heap);
            return Err(err.into());
        }
        match self.heap.get_mut(id) {
            HeapData::List(list) => list.insert(position, item),
            _ => item.drop_with_heap(self.heap),
        }
        Ok(Value::None)
    }

    pub(super) fn list_extend(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let iterable = args.get_one_arg("extend", self.heap)?;
        let items = self
            .list_of(this, "extend")
            .and_then(|id| self.collect(&iterable).map(|items| (id, items)));
        iterable.drop_with_heap(self.heap);
        let (id, items) = items?;
        self.list_extend_items(id, items).map(|()| Value::None)
    }

    /// `pop(index=-1)`.
    pub(super) fn list_pop(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let index = args.get_zero_one_arg("pop", self.heap)?;
        let parsed = self.list_of(this, "pop").and_then(|id| match &index {
            None => Ok((id, -1)),
            Some(index) => Int::from_value(index, self.heap)
                .map(|i| (id, i.saturating_i64()))
                .ok_or_else(|| ExcType::type_error("an integer is required")),
        });
        index.drop_with_heap(self.heap);
        let (id, index) = parsed?;
        let len = self.list_len(id);
        if len == 0 {
            return Err(ExcType::index_error("pop from empty list"));
        }
        let len_i = i64::try_from(len).unwrap_or(i64::MAX);
        let wrapped = if index < 0 { index + len_i } else { index };
        let position = usize::try_from(wrapped)
            .ok()
            .filter(|p| *p < len)
            .ok_or_else(|| ExcType::index_error("pop index out of range"))?;
        match self.heap.get_mut(id) {
            HeapData::List(list) => Ok(list.remove(position)),
            _ => Err(ExcType::index_error("pop from empty list")),
        }
    }

    /// Position of the first item equal to `item` within `[lo, hi)`.
    ///
    /// Items are compared on a snapshot, since `__eq__` may mutate the sequence.
    fn position_of(&mut self, seq: &Value, item: &Value, lo: usize, hi: usize) -> RunResult<Option<usize>> {
        let items = self.heap.clone_sequence_items(seq).unwrap_or_default();
        let mut found = Ok(None);
        for (i, candidate) in items.iter().enumerate().take(hi).skip(lo) {
            match self.eq(candidate, item) {
                Ok(false) => {}
                Ok(true) => {
                    found = Ok(Some(i));
                    break;
                }
                Err(err) => {
                    found = Err(err);
                    break;
                }
            }
        }
        items.drop_with_heap(self.heap);
        found
    }

    /// `remove(item)`: deletes the first equal item.
    pub(super) fn list_remove(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let item = args.get_one_arg("remove", self.heap)?;
        let found = self.list_of(this, "remove").and_then(|id| {
            let position = self.position_of(this, &item, 0, usize::MAX)?;
            Ok((id, position))
        });
        item.drop_with_heap(self.heap);
        let (id, position) = found?;
        let removed = match (position, self.heap.get_mut(id)) {
            (Some(position), HeapData::List(list)) if position < list.len() => Some(list.remove(position)),
            _ => None,
        };
        match removed {
            Some(removed) => {
                removed.drop_with_heap(self.heap);
                Ok(Value::None)
            }
            None => Err(ExcType::value_error("list.remove(x): x not in list")),
        }
    }

    pub(super) fn list_reverse(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("reverse", self.heap)?;
        let id = self.list_of(this, "reverse")?;
        if let HeapData::List(list) = self.heap.get_mut(id) {
            list.reverse();
        }
        Ok(Value::None)
    }

    /// `sort(key=None, reverse=False)`: a stable sort using `<`.
    ///
    /// The list is empty while user code runs; items added meanwhile are discarded and
    /// reported as a ValueError.
    pub(super) fn list_sort(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let ArgValues { args: positional, kwargs } = args;
        let id = match self.list_of(this, "sort") {
            Ok(id) if positional.is_empty() => id,
            Ok(_) => {
                (positional, kwargs).drop_with_heap(self.heap);
                return Err(ExcType::type_error("sort() takes no positional arguments"));
            }
            Err(err) => {
                (positional, kwargs).drop_with_heap(self.heap);
                return Err(err);
            }
        };
        let mut key = None;
        let mut reverse = Ok(false);
        let mut unexpected = None;
        for (name, value) in kwargs {
            match name.as_str() {
                "key" if !value.is_none() => key.replace(value).drop_with_heap(self.heap),
                "reverse" => {
                    reverse = self.is_true(&value);
                    value.drop_with_heap(self.heap);
                }
                "key" => {}
                _ => {
                    unexpected.get_or_insert_with(|| name.clone());
                    value.drop_with_heap(self.heap);
                }
            }
        }
        if let Some(name) = unexpected {
            key.drop_with_heap(self.heap);
            return Err(ExcType::type_error(format!(
                "'{name}' is an invalid keyword argument for this function"
            )));
        }
        let reverse = match reverse {
            Ok(reverse) => reverse,
            Err(err) => {
                key.drop_with_heap(self.heap);
                return Err(err);
            }
        };

        let items = match self.heap.get_mut(id) {
            HeapData::List(list) => list.take_items(),
            _ => Vec::new(),
        };
        let sorted = self.sort_items(&items, key.as_ref(), reverse);
        key.drop_with_heap(self.heap);
        let (items, failed) = match sorted {
            Ok(order) => {
                let mut slots: Vec<Option<Value>> = items.into_iter().map(Some).collect();
                (order.into_iter().filter_map(|i| slots[i].take()).collect(), None)
            }
            Err(err) => (items, Some(err)),
        };
        let intruders = match self.heap.get_mut(id) {
            HeapData::List(list) => {
                let intruders = list.take_items();
                list.restore_items(items);
                intruders
            }
            _ => items,
        };
        let modified = !intruders.is_empty();
        intruders.drop_with_heap(self.heap);
        if let Some(err) = failed {
            return Err(err);
        }
        if modified {
            return Err(ExcType::value_error("list modified during sort"));
        }
        Ok(Value::None)
    }

    /// The sorted order of `items` as indices into it.
    fn sort_items(&mut self, items: &[Value], key: Option<&Value>, reverse: bool) -> RunResult<Vec<usize>> {
        let keys = match key {
            Some(key) => {
                let mut keys = Vec::with_capacity(items.len());
                for item in items {
                    let arg = item.clone_with_heap(self.heap);
                    match self.call_sync(key, ArgValues::one(arg)) {
                        Ok(k) => keys.push(k),
                        Err(err) => {
                            keys.drop_with_heap(self.heap);
                            return Err(err);
                        }
                    }
                }
                Some(keys)
            }
            None => None,
        };
        let mut order = Vec::with_capacity(items.len());
        let mut result = Ok(());
        {
            let compared = keys.as_deref().unwrap_or(items);
            for index in 0..compared.len() {
                let position = insertion_point(&order, index, |a, b| {
                    if reverse {
                        self.less_than(&compared[b], &compared[a])
                    } else {
                        self.less_than(&compared[a], &compared[b])
                    }
                });
                match position {
                    Ok(position) => order.insert(position, index),
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
        }
        keys.drop_with_heap(self.heap);
        result.map(|()| order)
    }

    /// `index(item[, start[, stop]])` of tuples and lists.
    pub(super) fn seq_index(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let args = args.get_range("index", 1, 3, self.heap)?;
        let kind = if self.is_tuple(this) { "tuple" } else { "list" };
        let len = self.heap.sequence_items(this).map_or(0, <[Value]>::len);
        let found = self.opt_index(args.get(1)).and_then(|start| {
            let (lo, hi) = clamp_range(len, start, self.opt_index(args.get(2))?);
            self.position_of(this, &args[0], lo, hi)
        });
        args.drop_with_heap(self.heap);
        match found? {
            Some(i) => Ok(Value::Int(i64::try_from(i).unwrap_or(i64::MAX))),
            None => Err(ExcType::value_error(format!("{kind}.index(x): x not in {kind}"))),
        }
    }

    pub(super) fn seq_count(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let item = args.get_one_arg("count", self.heap)?;
        let items = self.heap.clone_sequence_items(this).unwrap_or_default();
        let mut count = 0_i64;
        let mut failed = None;
        for candidate in &items {
            match self.eq(candidate, &item) {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }
        (items, item).drop_with_heap(self.heap);
        match failed {
            Some(err) => Err(err),
            None => Ok(Value::Int(count)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::insertion_point;

    fn sort(values: &[i32]) -> Vec<usize> {
        let mut order = Vec::new();
        for index in 0..values.len() {
            let at = insertion_point(&order, index, |a, b| Ok(values[a] < values[b])).unwrap();
            order.insert(at, index);
        }
        order
    }

    #[test]
    fn insertion_keeps_equal_items_in_order() {
        assert_eq!(sort(&[3, 1, 2]), vec![1, 2, 0]);
        assert_eq!(sort(&[1, 0, 1, 0]), vec![1, 3, 0, 2]);
        assert!(sort(&[]).is_empty());
    }
}
