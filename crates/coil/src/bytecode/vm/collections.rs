//! Subscription, iteration, unpacking, hashing and the dict operations that may call
//! back into user code.

use super::{Step, VM};
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunError, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{DictIter, DictIterKind, DictSlot, Int, Lookup, SeqIter, SliceIndices, tuple_hash},
    value::Value,
};

/// Builtin sequences that support integer indexing.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Indexable {
    Str,
    Tuple,
    List,
}

impl Indexable {
    /// Name used in index error messages.
    fn label(self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Tuple => "tuple",
            Self::List => "list",
        }
    }
}

/// Normalizes a possibly negative index against `len`.
fn wrap_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    fn indexable(&self, value: &Value) -> Option<Indexable> {
        match value.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Str(_)) => Some(Indexable::Str),
            Some(HeapData::Tuple(_)) => Some(Indexable::Tuple),
            Some(HeapData::List(_)) => Some(Indexable::List),
            _ => None,
        }
    }

    fn slice_id(&self, value: &Value) -> Option<HeapId> {
        value
            .ref_id()
            .filter(|id| matches!(self.heap.get(*id), HeapData::Slice(_)))
    }

    pub(crate) fn dict_id(&self, value: &Value) -> Option<HeapId> {
        value
            .ref_id()
            .filter(|id| matches!(self.heap.get(*id), HeapData::Dict(_)))
    }

    /// Length of a builtin sequence.
    fn seq_len(&self, value: &Value) -> usize {
        match value.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Str(s)) => s.len(),
            Some(HeapData::Tuple(t)) => t.len(),
            Some(HeapData::List(l)) => l.len(),
            _ => 0,
        }
    }

    /// Reads an integer index, saturating values too large for `i64`.
    fn index_value(&self, index: &Value) -> Option<i64> {
        Int::from_value(index, self.heap).map(|i| i.saturating_i64())
    }

    /// Turns a slice object's bounds into concrete indices for a sequence of `len` items.
    pub(crate) fn resolve_slice(&self, slice_id: HeapId, len: usize) -> RunResult<SliceIndices> {
        let HeapData::Slice(slice) = self.heap.get(slice_id) else {
            return Err(RunError::internal("resolve_slice: not a slice"));
        };
        let bound = |value: &Value| -> RunResult<Option<i64>> {
            if value.is_none() {
                return Ok(None);
            }
            self.index_value(value).map(Some).ok_or_else(|| {
                ExcType::type_error("slice indices must be integers or None or have an __index__ method")
            })
        };
        let start = bound(&slice.start)?;
        let stop = bound(&slice.stop)?;
        let step = bound(&slice.step)?.unwrap_or(1);
        if step == 0 {
            return Err(ExcType::value_error("slice step cannot be zero"));
        }
        Ok(SliceIndices::resolve(len, start, stop, step))
    }

    // ========================================================================
    // Subscription
    // ========================================================================

    /// `container[index]`.
    pub(crate) fn get_item(&mut self, container: &Value, index: &Value) -> RunResult<Value> {
        if let Some(kind) = self.indexable(container) {
            if let Some(slice_id) = self.slice_id(index) {
                let indices = self.resolve_slice(slice_id, self.seq_len(container))?;
                return self.slice_sequence(kind, container, &indices);
            }
            let Some(i) = self.index_value(index) else {
                return Err(ExcType::type_error_indices(kind.label(), &self.type_name(index)));
            };
            let out_of_range = || ExcType::index_error(format!("{} index out of range", kind.label()));
            let position = wrap_index(i, self.seq_len(container)).ok_or_else(out_of_range)?;
            if kind == Indexable::Str {
                let byte = self.str_of(container)[position];
                return Ok(self.heap.alloc_bytes(vec![byte])?);
            }
            let items = self.heap.sequence_items(container).unwrap_or_default();
            return items
                .get(position)
                .map(|v| v.clone_with_heap(self.heap))
                .ok_or_else(out_of_range);
        }
        if let Some(dict) = self.dict_id(container) {
            return match self.dict_get(dict, index)? {
                Some(value) => Ok(value),
                None => Err(self.key_error(index)),
            };
        }
        let arg = index.clone_with_heap(self.heap);
        match self.call_method(container, "__getitem__", ArgValues::one(arg))? {
            Some(value) => Ok(value),
            None => Err(ExcType::type_error_not_subscriptable(&self.type_name(container))),
        }
    }

    fn slice_sequence(&mut self, kind: Indexable, seq: &Value, indices: &SliceIndices) -> RunResult<Value> {
        if kind == Indexable::Str {
            let bytes = self.str_of(seq);
            let picked: Vec<u8> = indices.iter().map(|i| bytes[i]).collect();
            return Ok(self.heap.alloc_bytes(picked)?);
        }
        let items = self.heap.sequence_items(seq).unwrap_or_default();
        let picked: Vec<Value> = indices.iter().map(|i| items[i].clone_with_heap(self.heap)).collect();
        Ok(match kind {
            Indexable::List => self.heap.alloc_list(picked)?,
            _ => self.heap.alloc_tuple(picked)?,
        })
    }

    /// `container[index] = value`.
    pub(crate) fn set_item(&mut self, container: &Value, index: &Value, value: Value) -> RunResult<()> {
        match self.indexable(container) {
            Some(Indexable::List) => {
                let list_id = container.ref_id().ok_or_else(|| RunError::internal("list without id"))?;
                if let Some(slice_id) = self.slice_id(index) {
                    return self.list_set_slice(list_id, slice_id, value);
                }
                let Some(i) = self.index_value(index) else {
                    value.drop_with_heap(self.heap);
                    return Err(ExcType::type_error_indices("list", &self.type_name(index)));
                };
                let Some(position) = wrap_index(i, self.seq_len(container)) else {
                    value.drop_with_heap(self.heap);
                    return Err(ExcType::index_error("list assignment index out of range"));
                };
                let old = match self.heap.get_mut(list_id) {
                    HeapData::List(list) => list.set(position, value),
                    _ => value,
                };
                old.drop_with_heap(self.heap);
                return Ok(());
            }
            Some(kind @ (Indexable::Str | Indexable::Tuple)) => {
                value.drop_with_heap(self.heap);
                let name = if kind == Indexable::Str { "str" } else { "tuple" };
                return Err(ExcType::type_error(format!(
                    "'{name}' object does not support item assignment"
                )));
            }
            None => {}
        }
        if let Some(dict) = self.dict_id(container) {
            let key = index.clone_with_heap(self.heap);
            return self.dict_set(dict, key, value);
        }
        let key = index.clone_with_heap(self.heap);
        match self.call_method(container, "__setitem__", ArgValues::two(key, value))? {
            Some(result) => {
                result.drop_with_heap(self.heap);
                Ok(())
            }
            None => Err(ExcType::type_error(format!(
                "'{}' object does not support item assignment",
                self.type_name(container)
            ))),
        }
    }

    fn list_set_slice(&mut self, list_id: HeapId, slice_id: HeapId, value: Value) -> RunResult<()> {
        let len = match self.heap.get(list_id) {
            HeapData::List(list) => list.len(),
            _ => 0,
        };
        let indices = match self.resolve_slice(slice_id, len) {
            Ok(indices) => indices,
            Err(err) => {
                value.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        let items = self.collect(&value);
        value.drop_with_heap(self.heap);
        let items = items?;
        if indices.step == 1 {
            let start = usize::try_from(indices.start).unwrap_or(0);
            let stop = usize::try_from(indices.stop).unwrap_or(0).max(start);
            let removed = match self.heap.get_mut(list_id) {
                HeapData::List(list) => list.splice(start, stop, items),
                _ => items,
            };
            removed.drop_with_heap(self.heap);
            return Ok(());
        }
        if items.len() != indices.len {
            let given = items.len();
            items.drop_with_heap(self.heap);
            return Err(ExcType::value_error(format!(
                "attempt to assign sequence of size {given} to extended slice of size {}",
                indices.len
            )));
        }
        let positions: Vec<usize> = indices.iter().collect();
        let mut old = Vec::with_capacity(items.len());
        if let HeapData::List(list) = self.heap.get_mut(list_id) {
            for (position, item) in positions.into_iter().zip(items) {
                old.push(list.set(position, item));
            }
        }
        old.drop_with_heap(self.heap);
        Ok(())
    }

    /// `del container[index]`.
    pub(crate) fn del_item(&mut self, container: &Value, index: &Value) -> RunResult<()> {
        match self.indexable(container) {
            Some(Indexable::List) => {
                let list_id = container.ref_id().ok_or_else(|| RunError::internal("list without id"))?;
                let len = self.seq_len(container);
                let removed = if let Some(slice_id) = self.slice_id(index) {
                    let indices = self.resolve_slice(slice_id, len)?;
                    let mut positions: Vec<usize> = indices.iter().collect();
                    positions.sort_unstable();
                    match self.heap.get_mut(list_id) {
                        HeapData::List(list) => list.remove_indices(&positions),
                        _ => Vec::new(),
                    }
                } else {
                    let Some(i) = self.index_value(index) else {
                        return Err(ExcType::type_error_indices("list", &self.type_name(index)));
                    };
                    let position = wrap_index(i, len)
                        .ok_or_else(|| ExcType::index_error("list assignment index out of range"))?;
                    match self.heap.get_mut(list_id) {
                        HeapData::List(list) => vec![list.remove(position)],
                        _ => Vec::new(),
                    }
                };
                removed.drop_with_heap(self.heap);
                return Ok(());
            }
            Some(kind) => {
                let name = if kind == Indexable::Str { "str" } else { "tuple" };
                return Err(ExcType::type_error(format!(
                    "'{name}' object doesn't support item deletion"
                )));
            }
            None => {}
        }
        if let Some(dict) = self.dict_id(container) {
            return match self.dict_remove(dict, index)? {
                Some(value) => {
                    value.drop_with_heap(self.heap);
                    Ok(())
                }
                None => Err(self.key_error(index)),
            };
        }
        let key = index.clone_with_heap(self.heap);
        match self.call_method(container, "__delitem__", ArgValues::one(key))? {
            Some(result) => {
                result.drop_with_heap(self.heap);
                Ok(())
            }
            None => Err(ExcType::type_error(format!(
                "'{}' object doesn't support item deletion",
                self.type_name(container)
            ))),
        }
    }

    /// `len(value)`.
    pub(crate) fn len(&mut self, value: &Value) -> RunResult<usize> {
        match value.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Str(s)) => return Ok(s.len()),
            Some(HeapData::Tuple(t)) => return Ok(t.len()),
            Some(HeapData::List(l)) => return Ok(l.len()),
            Some(HeapData::Dict(d)) => return Ok(d.len()),
            Some(HeapData::Instance(_)) => {
                if let Some(len) = self.call_method(value, "__len__", ArgValues::empty())? {
                    return self.len_result(len);
                }
            }
            _ => {}
        }
        Err(ExcType::type_error(format!(
            "object of type '{}' has no len()",
            self.type_name(value)
        )))
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// `iter(value)`.
    pub(crate) fn get_iter(&mut self, value: &Value) -> RunResult<Value> {
        let state = match value.ref_id().map(|id| (id, self.heap.get(id))) {
            Some((_, HeapData::Str(_) | HeapData::Tuple(_) | HeapData::List(_))) => {
                HeapData::SeqIter(SeqIter::new(value.clone_with_heap(self.heap)))
            }
            Some((id, HeapData::Dict(_))) => {
                self.heap.inc_ref(id);
                HeapData::DictIter(DictIter {
                    dict: id,
                    cursor: Default::default(),
                    kind: DictIterKind::Keys,
                })
            }
            Some((_, HeapData::SeqIter(_) | HeapData::DictIter(_))) => return Ok(value.clone_with_heap(self.heap)),
            Some((_, HeapData::Instance(inst))) => {
                let class = inst.class;
                if let Some(iterator) = self.call_method(value, "__iter__", ArgValues::empty())? {
                    if !self.is_iterator(&iterator) {
                        let type_name = self.type_name(&iterator);
                        iterator.drop_with_heap(self.heap);
                        return Err(ExcType::type_error(format!(
                            "iter() returned non-iterator of type '{type_name}'"
                        )));
                    }
                    return Ok(iterator);
                }
                let Some(getitem) = self.lookup_type_attr(class, "__getitem__") else {
                    return Err(ExcType::type_error_not_iterable(&self.type_name(value)));
                };
                getitem.drop_with_heap(self.heap);
                HeapData::SeqIter(SeqIter::new(value.clone_with_heap(self.heap)))
            }
            _ => return Err(ExcType::type_error_not_iterable(&self.type_name(value))),
        };
        Ok(Value::Ref(self.heap.allocate(state)?))
    }

    fn is_iterator(&self, value: &Value) -> bool {
        match value.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::SeqIter(_) | HeapData::DictIter(_)) => true,
            Some(HeapData::Instance(inst)) => self
                .type_dict(inst.class)
                .is_some_and(|dict| self.heap.dict_get_str(dict, "next").is_some()),
            _ => false,
        }
    }

    /// Advances an iterator. `Ok(None)` once it is exhausted.
    pub(crate) fn iter_next(&mut self, iterator: &Value) -> RunResult<Option<Value>> {
        let Some(id) = iterator.ref_id() else {
            return Err(self.not_an_iterator(iterator));
        };
        match self.heap.get(id) {
            HeapData::SeqIter(_) => self.seq_iter_next(id),
            HeapData::DictIter(_) => self.dict_iter_next(id),
            HeapData::Instance(_) => match self.call_method(iterator, "next", ArgValues::empty()) {
                Ok(Some(value)) => Ok(Some(value)),
                Ok(None) => Err(self.not_an_iterator(iterator)),
                Err(err) if self.error_matches(&err, ExcType::StopIteration) => {
                    err.drop_with_heap(self.heap);
                    Ok(None)
                }
                Err(err) => Err(err),
            },
            _ => Err(self.not_an_iterator(iterator)),
        }
    }

    fn not_an_iterator(&self, value: &Value) -> RunError {
        ExcType::type_error(format!("'{}' object is not an iterator", self.type_name(value)))
    }

    fn seq_iter_next(&mut self, id: HeapId) -> RunResult<Option<Value>> {
        let (seq, index) = match self.heap.get(id) {
            HeapData::SeqIter(it) => match &it.seq {
                Some(seq) => (seq.clone_with_heap(self.heap), it.index),
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        let item = if let Some(kind) = self.indexable(&seq) {
            let len = self.seq_len(&seq);
            if index >= len {
                Ok(None)
            } else if kind == Indexable::Str {
                let byte = self.str_of(&seq)[index];
                self.heap.alloc_bytes(vec![byte]).map(Some).map_err(Into::into)
            } else {
                let items = self.heap.sequence_items(&seq).unwrap_or_default();
                Ok(items.get(index).map(|v| v.clone_with_heap(self.heap)))
            }
        } else {
            let position = Value::Int(i64::try_from(index).unwrap_or(i64::MAX));
            match self.get_item(&seq, &position) {
                Ok(value) => Ok(Some(value)),
                Err(err)
                    if self.error_matches(&err, ExcType::IndexError)
                        || self.error_matches(&err, ExcType::StopIteration) =>
                {
                    err.drop_with_heap(self.heap);
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        };
        seq.drop_with_heap(self.heap);
        let item = item?;
        let exhausted = match self.heap.get_mut(id) {
            HeapData::SeqIter(it) if item.is_some() => {
                it.index += 1;
                None
            }
            HeapData::SeqIter(it) => it.seq.take(),
            _ => None,
        };
        exhausted.drop_with_heap(self.heap);
        Ok(item)
    }

    fn dict_iter_next(&mut self, id: HeapId) -> RunResult<Option<Value>> {
        let (dict_id, mut cursor, kind) = match self.heap.get(id) {
            HeapData::DictIter(it) => (it.dict, it.cursor, it.kind),
            _ => return Ok(None),
        };
        let entry = match self.heap.get(dict_id) {
            HeapData::Dict(dict) => dict
                .next(&mut cursor)
                .map(|e| (e.key.clone_with_heap(self.heap), e.value.clone_with_heap(self.heap))),
            _ => None,
        };
        if let HeapData::DictIter(it) = self.heap.get_mut(id) {
            it.cursor = cursor;
        }
        let Some((key, value)) = entry else {
            return Ok(None);
        };
        let item = match kind {
            DictIterKind::Keys => {
                value.drop_with_heap(self.heap);
                key
            }
            DictIterKind::Values => {
                key.drop_with_heap(self.heap);
                value
            }
            DictIterKind::Items => self.heap.alloc_tuple(vec![key, value])?,
        };
        Ok(Some(item))
    }

    /// Drains any iterable into a vector of owned values.
    pub(crate) fn collect(&mut self, iterable: &Value) -> RunResult<Vec<Value>> {
        if let Some(items) = self.heap.clone_sequence_items(iterable) {
            return Ok(items);
        }
        let iterator = self.get_iter(iterable)?;
        let mut out = Vec::new();
        let result = loop {
            match self.iter_next(&iterator) {
                Ok(Some(item)) => {
                    if let Err(err) = self.heap.on_container_insert() {
                        item.drop_with_heap(self.heap);
                        break Err(err.into());
                    }
                    out.push(item);
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        iterator.drop_with_heap(self.heap);
        match result {
            Ok(()) => Ok(out),
            Err(err) => {
                out.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    /// `UnpackSequence`: exactly `count` items, in order.
    pub(super) fn unpack_sequence(&mut self, seq: &Value, count: usize) -> RunResult<Vec<Value>> {
        let items = self.collect(seq).map_err(|err| {
            if self.error_matches(&err, ExcType::TypeError) && !self.is_instance_value(seq) {
                err.drop_with_heap(self.heap);
                ExcType::type_error(format!("'{}' object is not iterable", self.type_name(seq)))
            } else {
                err
            }
        })?;
        match items.len() {
            n if n == count => Ok(items),
            n if n < count => {
                items.drop_with_heap(self.heap);
                Err(ExcType::value_error(format!(
                    "need more than {n} value{} to unpack",
                    if n == 1 { "" } else { "s" }
                )))
            }
            _ => {
                items.drop_with_heap(self.heap);
                Err(ExcType::value_error("too many values to unpack"))
            }
        }
    }

    // ========================================================================
    // Hashing and dicts
    // ========================================================================

    /// `hash(value)`, dispatching `__hash__` for instances.
    pub(crate) fn hash_value(&mut self, value: &Value) -> RunResult<i64> {
        if let Some(hash) = self.heap.builtin_hash(value)? {
            return Ok(hash);
        }
        if self.is_tuple(value) {
            let items = self.heap.clone_sequence_items(value).unwrap_or_default();
            let mut hashes = Vec::with_capacity(items.len());
            let mut failed = None;
            for item in &items {
                match self.hash_value(item) {
                    Ok(h) => hashes.push(h),
                    Err(err) => {
                        failed = Some(err);
                        break;
                    }
                }
            }
            items.drop_with_heap(self.heap);
            return match failed {
                Some(err) => Err(err),
                None => Ok(tuple_hash(&hashes)),
            };
        }
        let Some(result) = self.call_method(value, "__hash__", ArgValues::empty())? else {
            return Ok(value.id());
        };
        let hash = Int::from_value(&result, self.heap).map(|i| i.hash());
        result.drop_with_heap(self.heap);
        hash.ok_or_else(|| ExcType::type_error("an integer is required"))
    }

    /// Finds `key` in a dict, running `__eq__` when builtin equality cannot decide.
    fn dict_find(&mut self, dict_id: HeapId, key: &Value) -> RunResult<(i64, Option<DictSlot>)> {
        let hash = self.hash_value(key)?;
        match self.heap.dict_lookup_builtin(dict_id, hash, key) {
            Lookup::Found(slot) => return Ok((hash, Some(slot))),
            Lookup::Missing => return Ok((hash, None)),
            Lookup::NeedsDispatch => {}
        }
        let candidates: Vec<Value> = match self.heap.get(dict_id) {
            HeapData::Dict(dict) => dict
                .candidates(hash)
                .into_iter()
                .map(|slot| dict.entry(slot).key.clone_with_heap(self.heap))
                .collect(),
            _ => Vec::new(),
        };
        let mut found = Ok(None);
        for candidate in &candidates {
            match self.eq(candidate, key) {
                Ok(false) => {}
                Ok(true) => {
                    // `__eq__` may have mutated the dict; find the entry again by identity
                    found = Ok(match self.heap.get(dict_id) {
                        HeapData::Dict(dict) => dict.find_identical(hash, candidate),
                        _ => None,
                    });
                    if matches!(found, Ok(Some(_))) {
                        break;
                    }
                }
                Err(err) => {
                    found = Err(err);
                    break;
                }
            }
        }
        candidates.drop_with_heap(self.heap);
        found.map(|slot| (hash, slot))
    }

    /// `dict[key]` without raising: a new reference to the value, if present.
    pub(crate) fn dict_get(&mut self, dict_id: HeapId, key: &Value) -> RunResult<Option<Value>> {
        let (_, slot) = self.dict_find(dict_id, key)?;
        Ok(slot.and_then(|slot| match self.heap.get(dict_id) {
            HeapData::Dict(dict) => Some(dict.entry(slot).value.clone_with_heap(self.heap)),
            _ => None,
        }))
    }

    /// `dict[key] = value`. An existing entry keeps its original key object.
    pub(crate) fn dict_set(&mut self, dict_id: HeapId, key: Value, value: Value) -> RunResult<()> {
        let (hash, slot) = match self.dict_find(dict_id, &key) {
            Ok(found) => found,
            Err(err) => {
                (key, value).drop_with_heap(self.heap);
                return Err(err);
            }
        };
        if let Some(slot) = slot {
            let old = match self.heap.get_mut(dict_id) {
                HeapData::Dict(dict) => dict.replace_value(slot, value),
                _ => value,
            };
            (key, old).drop_with_heap(self.heap);
            return Ok(());
        }
        if let Err(err) = self.heap.on_container_insert() {
            (key, value).drop_with_heap(self.heap);
            return Err(err.into());
        }
        match self.heap.get_mut(dict_id) {
            HeapData::Dict(dict) => dict.insert_new(hash, key, value),
            _ => (key, value).drop_with_heap(self.heap),
        }
        Ok(())
    }

    /// Removes `key`, returning its value. `Ok(None)` when absent; the dict is unchanged.
    pub(crate) fn dict_remove(&mut self, dict_id: HeapId, key: &Value) -> RunResult<Option<Value>> {
        let (_, slot) = self.dict_find(dict_id, key)?;
        let Some(slot) = slot else {
            return Ok(None);
        };
        let entry = match self.heap.get_mut(dict_id) {
            HeapData::Dict(dict) => dict.remove(slot),
            _ => return Ok(None),
        };
        entry.key.drop_with_heap(self.heap);
        Ok(Some(entry.value))
    }

    pub(crate) fn dict_len(&self, dict_id: HeapId) -> usize {
        match self.heap.get(dict_id) {
            HeapData::Dict(dict) => dict.len(),
            _ => 0,
        }
    }

    /// New references to every `(key, value)`, in iteration order.
    pub(crate) fn dict_pairs(&self, dict_id: HeapId) -> Vec<(Value, Value)> {
        match self.heap.get(dict_id) {
            HeapData::Dict(dict) => dict
                .iter()
                .map(|e| (e.key.clone_with_heap(self.heap), e.value.clone_with_heap(self.heap)))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The keys, values or `(key, value)` tuples of a dict, in iteration order.
    pub(crate) fn dict_entries(&mut self, dict_id: HeapId, kind: DictIterKind) -> RunResult<Vec<Value>> {
        let mut pairs = self.dict_pairs(dict_id).into_iter();
        let mut out = Vec::with_capacity(pairs.len());
        while let Some((key, value)) = pairs.next() {
            let item = match kind {
                DictIterKind::Keys => {
                    value.drop_with_heap(self.heap);
                    key
                }
                DictIterKind::Values => {
                    key.drop_with_heap(self.heap);
                    value
                }
                DictIterKind::Items => match self.heap.alloc_tuple(vec![key, value]) {
                    Ok(item) => item,
                    Err(err) => {
                        (out, pairs.collect::<Vec<_>>()).drop_with_heap(self.heap);
                        return Err(err.into());
                    }
                },
            };
            out.push(item);
        }
        Ok(out)
    }

    /// A shallow copy with the same iteration order.
    pub(crate) fn dict_copy(&mut self, dict_id: HeapId) -> RunResult<Value> {
        let entries: Vec<(i64, Value, Value)> = match self.heap.get(dict_id) {
            HeapData::Dict(dict) => dict
                .iter()
                .map(|e| (e.hash, e.key.clone_with_heap(self.heap), e.value.clone_with_heap(self.heap)))
                .collect(),
            _ => Vec::new(),
        };
        let copy = match self.heap.alloc_dict() {
            Ok(copy) => copy,
            Err(err) => {
                for (_, key, value) in entries {
                    (key, value).drop_with_heap(self.heap);
                }
                return Err(err.into());
            }
        };
        // each insert becomes the head of its chain, so go oldest first
        let mut entries = entries.into_iter().rev();
        while let Some((hash, key, value)) = entries.next() {
            if let Err(err) = self.heap.on_container_insert() {
                (key, value).drop_with_heap(self.heap);
                for (_, key, value) in entries {
                    (key, value).drop_with_heap(self.heap);
                }
                self.heap.dec_ref(copy);
                return Err(err.into());
            }
            if let HeapData::Dict(dict) = self.heap.get_mut(copy) {
                dict.insert_new(hash, key, value);
            }
        }
        Ok(Value::Ref(copy))
    }

    /// `dict.update(source)`: another dict, or an iterable of key/value pairs.
    pub(crate) fn dict_merge(&mut self, dict_id: HeapId, source: &Value) -> RunResult<()> {
        if let Some(src) = self.dict_id(source) {
            let mut pairs = self.dict_pairs(src).into_iter();
            while let Some((key, value)) = pairs.next() {
                if let Err(err) = self.dict_set(dict_id, key, value) {
                    pairs.collect::<Vec<_>>().drop_with_heap(self.heap);
                    return Err(err);
                }
            }
            return Ok(());
        }
        let mut items = self.collect(source)?.into_iter().enumerate();
        while let Some((n, item)) = items.next() {
            let pair = if self.indexable(&item).is_some() || self.is_instance_value(&item) {
                self.collect(&item)
            } else {
                Err(ExcType::type_error(format!(
                    "cannot convert dictionary update sequence element #{n} to a sequence"
                )))
            };
            item.drop_with_heap(self.heap);
            let result = pair.and_then(|pair| match <[Value; 2]>::try_from(pair) {
                Ok([key, value]) => self.dict_set(dict_id, key, value),
                Err(pair) => {
                    let len = pair.len();
                    pair.drop_with_heap(self.heap);
                    Err(ExcType::value_error(format!(
                        "dictionary update sequence element #{n} has length {len}; 2 is required"
                    )))
                }
            });
            if let Err(err) = result {
                for (_, rest) in items {
                    rest.drop_with_heap(self.heap);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Container-building opcodes
    // ========================================================================

    /// `StoreMap`: key on top, value below it, the dict below that stays.
    pub(super) fn store_map(&mut self) -> RunResult<Step> {
        let [value, key] = self.pop_array()?;
        let Some(dict) = self.dict_id(self.peek(0)?) else {
            (key, value).drop_with_heap(self.heap);
            return Err(ExcType::system_error("STORE_MAP without a dict"));
        };
        self.dict_set(dict, key, value)?;
        Ok(Step::Next)
    }

    /// `MapAdd`: dict comprehension step, with the dict `depth` entries down.
    pub(super) fn map_add(&mut self, depth: usize) -> RunResult<Step> {
        let [value, key] = self.pop_array()?;
        let dict = match self.peek(depth.saturating_sub(1)) {
            Ok(target) => self.dict_id(target),
            Err(err) => {
                (key, value).drop_with_heap(self.heap);
                return Err(err);
            }
        };
        let Some(dict) = dict else {
            (key, value).drop_with_heap(self.heap);
            return Err(ExcType::system_error("MAP_ADD without a dict"));
        };
        self.dict_set(dict, key, value)?;
        Ok(Step::Next)
    }

    /// `ListAppend`: list comprehension step, with the list `depth` entries down.
    pub(super) fn list_append_op(&mut self, depth: usize) -> RunResult<Step> {
        let value = self.pop()?;
        let list = match self.peek(depth.saturating_sub(1)) {
            Ok(target) => target
                .ref_id()
                .filter(|id| matches!(self.heap.get(*id), HeapData::List(_))),
            Err(err) => {
                value.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        let Some(list) = list else {
            value.drop_with_heap(self.heap);
            return Err(ExcType::system_error("LIST_APPEND without a list"));
        };
        self.list_extend_items(list, vec![value])?;
        Ok(Step::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indices_wrap_once() {
        assert_eq!(wrap_index(-1, 3), Some(2));
        assert_eq!(wrap_index(-3, 3), Some(0));
        assert_eq!(wrap_index(-4, 3), None);
        assert_eq!(wrap_index(3, 3), None);
        assert_eq!(wrap_index(0, 0), None);
    }
}
