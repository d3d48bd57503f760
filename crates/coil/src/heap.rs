use std::{
    collections::BTreeMap,
    mem::ManuallyDrop,
    ptr::addr_of,
    sync::atomic::{AtomicUsize, Ordering},
    vec,
};

use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunResult},
    resource::{ResourceError, ResourceTracker},
    types::{
        CodeObject, Dict, DictIter, Function, Instance, Int, List, LongInt, Lookup, Method, Module, NativeFunction,
        SeqIter, Slice, Str, Traceback, Tuple, TypeObject, str::hash_bytes, tuple_hash,
    },
    value::Value,
};

/// Snapshot of heap state at a point in time.
///
/// The `objects_by_type` map uses `BTreeMap` for deterministic iteration order,
/// making snapshots suitable for display and comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Total number of live objects on the heap.
    pub live_objects: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total heap capacity (live + free).
    pub total_slots: usize,
    /// Breakdown of live objects by `HeapData` variant name ("List", "Dict", "Str", ...).
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Resource tracker allocation count, if using `LimitedTracker`.
    pub tracker_allocations: Option<usize>,
    /// Resource tracker memory usage in bytes, if using `LimitedTracker`.
    pub tracker_memory_bytes: Option<usize>,
}

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Payload of a heap object. The object's type follows from the variant, except for
/// instances, which point at their class.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(Str),
    Tuple(Tuple),
    List(List),
    Dict(Dict),
    LongInt(LongInt),
    Type(TypeObject),
    Instance(Instance),
    Function(Function),
    Native(NativeFunction),
    Method(Method),
    Code(CodeObject),
    Traceback(Traceback),
    Slice(Slice),
    SeqIter(SeqIter),
    DictIter(DictIter),
    Module(Module),
}

impl HeapData {
    /// Variant name used for heap statistics.
    fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::Tuple(_) => "Tuple",
            Self::List(_) => "List",
            Self::Dict(_) => "Dict",
            Self::LongInt(_) => "LongInt",
            Self::Type(_) => "Type",
            Self::Instance(_) => "Instance",
            Self::Function(_) => "Function",
            Self::Native(_) => "Native",
            Self::Method(_) => "Method",
            Self::Code(_) => "Code",
            Self::Traceback(_) => "Traceback",
            Self::Slice(_) => "Slice",
            Self::SeqIter(_) => "SeqIter",
            Self::DictIter(_) => "DictIter",
            Self::Module(_) => "Module",
        }
    }

    /// Approximate size in bytes, reported to the resource tracker.
    fn estimate_size(&self) -> usize {
        match self {
            Self::Str(s) => s.estimate_size(),
            Self::Tuple(t) => t.estimate_size(),
            Self::List(l) => l.estimate_size(),
            Self::Dict(d) => d.estimate_size(),
            Self::LongInt(li) => li.estimate_size(),
            Self::Type(t) => t.estimate_size(),
            Self::Instance(i) => i.estimate_size(),
            Self::Traceback(tb) => tb.estimate_size(),
            Self::Code(c) => std::mem::size_of::<CodeObject>() + c.consts.len() * std::mem::size_of::<Value>(),
            Self::Function(f) => std::mem::size_of::<Function>() + f.name.len(),
            Self::Native(_)
            | Self::Method(_)
            | Self::Slice(_)
            | Self::SeqIter(_)
            | Self::DictIter(_)
            | Self::Module(_) => std::mem::size_of::<Self>(),
        }
    }

    /// Collects the heap ids this object owns, so they can be released after it is freed.
    ///
    /// With `ref-count-panic` the owned `Value`s are also marked dereferenced.
    fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        match self {
            Self::Str(_) | Self::LongInt(_) | Self::Native(_) => {}
            Self::Tuple(t) => t.dec_ref_ids(stack),
            Self::List(l) => l.dec_ref_ids(stack),
            Self::Dict(d) => d.dec_ref_ids(stack),
            Self::Type(t) => t.dec_ref_ids(stack),
            Self::Instance(i) => i.dec_ref_ids(stack),
            Self::Function(f) => f.dec_ref_ids(stack),
            Self::Method(m) => m.dec_ref_ids(stack),
            Self::Code(c) => c.dec_ref_ids(stack),
            Self::Traceback(tb) => stack.extend(tb.next),
            Self::Slice(s) => s.dec_ref_ids(stack),
            Self::SeqIter(it) => it.dec_ref_ids(stack),
            Self::DictIter(it) => stack.push(it.dict),
            Self::Module(m) => stack.push(m.dict),
        }
    }
}

/// A single entry inside the heap arena.
///
/// The `data` field is an Option to support temporary borrowing: `with_entry_mut` takes
/// the data out (leaving `None`), passes `&mut Heap` to the closure, then restores it.
/// This avoids unsafe code while keeping `refcount` accessible during the borrow.
#[derive(Debug)]
pub struct HeapValue {
    refcount: AtomicUsize,
    data: Option<HeapData>,
}

/// Reference-counted arena that backs all heap-only runtime values.
///
/// Uses a free list to reuse slots from freed values, keeping memory usage
/// constant for loops that repeatedly allocate and free values.
///
/// Generic over `T: ResourceTracker`; with `NoLimitTracker` all resource checks compile
/// away to no-ops.
#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker> {
    entries: Vec<Option<HeapValue>>,
    /// IDs of freed slots available for reuse. Populated by `dec_ref`, consumed by `allocate`.
    free_list: Vec<HeapId>,
    tracker: T,
    /// Instances whose refcount reached zero and whose class defines `__del__`.
    /// The queue owns one reference to each.
    finalize_queue: Vec<HeapId>,
}

macro_rules! take_data {
    ($self:ident, $id:expr, $func_name:literal) => {
        $self
            .entries
            .get_mut($id.index())
            .expect(concat!("Heap::", $func_name, ": slot missing"))
            .as_mut()
            .expect(concat!("Heap::", $func_name, ": object already freed"))
            .data
            .take()
            .expect(concat!("Heap::", $func_name, ": data already borrowed"))
    };
}

macro_rules! restore_data {
    ($self:ident, $id:expr, $new_data:expr, $func_name:literal) => {{
        let entry = $self
            .entries
            .get_mut($id.index())
            .expect(concat!("Heap::", $func_name, ": slot missing"))
            .as_mut()
            .expect(concat!("Heap::", $func_name, ": object already freed"));
        entry.data = Some($new_data);
    }};
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(capacity: usize, tracker: T) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            tracker,
            finalize_queue: Vec::new(),
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Charges an in-place container growth against the allocation budget.
    pub fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        self.tracker.on_container_insert()
    }

    /// Allocates a new heap entry with refcount 1, reusing a freed slot when possible.
    ///
    /// On a resource error `data` is dropped without releasing the references it owns,
    /// so callers allocate containers before filling them where possible.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        if let Err(err) = self.tracker.on_allocate(|| data.estimate_size()) {
            self.release_data(data);
            return Err(err);
        }
        let new_entry = HeapValue {
            refcount: AtomicUsize::new(1),
            data: Some(data),
        };
        let id = if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(new_entry);
            id
        } else {
            let id = self.entries.len();
            self.entries.push(Some(new_entry));
            HeapId(id)
        };
        Ok(id)
    }

    /// Releases the references owned by data that never made it into the arena.
    fn release_data(&mut self, mut data: HeapData) {
        let mut child_ids = Vec::new();
        data.dec_ref_ids(&mut child_ids);
        drop(data);
        for child_id in child_ids {
            self.dec_ref(child_id);
        }
    }

    /// Increments the reference count for an existing heap entry.
    ///
    /// Uses interior mutability for the refcount, so only shared access to the heap
    /// is required.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn inc_ref(&self, id: HeapId) {
        let value = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        value.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the reference count and frees the value (plus children) once it hits zero.
    ///
    /// An instance whose class defines `__del__` is not freed on its first drop to zero:
    /// it stays alive with the finalize queue holding its reference, is marked finalized,
    /// and the interpreter runs `__del__` at the next instruction boundary.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        // children are released through a worklist so deep nesting cannot overflow the stack
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            self.release_one(id, &mut pending);
        }
    }

    /// Drops one reference to `id`; if it was the last, frees it and queues its children.
    fn release_one(&mut self, id: HeapId, pending: &mut Vec<HeapId>) {
        {
            let entry = self
                .entries
                .get_mut(id.index())
                .expect("Heap::dec_ref: slot missing")
                .as_mut()
                .expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.load(Ordering::Relaxed);
            if count > 1 {
                entry.refcount.store(count - 1, Ordering::Relaxed);
                return;
            }
        }

        if self.needs_finalizer(id) {
            if let Some(HeapData::Instance(inst)) = self.get_mut_if_live(id) {
                inst.finalized = true;
            }
            self.finalize_queue.push(id);
            return;
        }

        let value = self.entries[id.index()].take().expect("Heap::dec_ref: object already freed");
        self.free_list.push(id);

        if let Some(ref data) = value.data {
            self.tracker.on_free(|| data.estimate_size());
        }
        if let Some(mut data) = value.data {
            data.dec_ref_ids(pending);
        }
    }

    fn needs_finalizer(&self, id: HeapId) -> bool {
        let Some(HeapData::Instance(inst)) = self.get_if_live(id) else {
            return false;
        };
        if inst.finalized {
            return false;
        }
        match self.get_if_live(inst.class) {
            Some(HeapData::Type(t)) => self.dict_get_str(t.dict, "__del__").is_some(),
            _ => false,
        }
    }

    /// Pops the next instance waiting for `__del__`. The caller takes over the queue's
    /// reference.
    pub fn take_finalizer(&mut self) -> Option<HeapId> {
        if self.finalize_queue.is_empty() {
            None
        } else {
            Some(self.finalize_queue.remove(0))
        }
    }

    #[must_use]
    pub fn has_pending_finalizers(&self) -> bool {
        !self.finalize_queue.is_empty()
    }

    /// Returns an immutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid, the value has already been freed,
    /// or the data is currently borrowed via `with_entry_mut`.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
            .as_ref()
            .expect("Heap::get: data currently borrowed")
    }

    /// Returns heap data if the slot is live, `None` instead of panicking otherwise.
    #[must_use]
    pub fn get_if_live(&self, id: HeapId) -> Option<&HeapData> {
        self.entries.get(id.index())?.as_ref()?.data.as_ref()
    }

    /// Returns a mutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid, the value has already been freed,
    /// or the data is currently borrowed via `with_entry_mut`.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
            .as_mut()
            .expect("Heap::get_mut: data currently borrowed")
    }

    pub fn get_mut_if_live(&mut self, id: HeapId) -> Option<&mut HeapData> {
        self.entries.get_mut(id.index())?.as_mut()?.data.as_mut()
    }

    /// Temporarily takes the data of an entry so the closure can mutate it while also
    /// using the heap (e.g. to allocate or release values). The data is restored after
    /// the closure returns.
    pub fn with_entry_mut<F, R>(&mut self, id: HeapId, f: F) -> R
    where
        F: FnOnce(&mut Self, &mut HeapData) -> R,
    {
        let mut data = take_data!(self, id, "with_entry_mut");
        let result = f(self, &mut data);
        restore_data!(self, id, data, "with_entry_mut");
        result
    }

    /// Returns the reference count for the heap entry at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    #[must_use]
    pub fn get_refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .expect("Heap::get_refcount: slot missing")
            .as_ref()
            .expect("Heap::get_refcount: object already freed")
            .refcount
            .load(Ordering::Relaxed)
    }

    /// Whether the slot currently holds a live object.
    #[must_use]
    pub fn is_live(&self, id: HeapId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }

    pub fn heap_stats(&self) -> HeapStats {
        let mut objects_by_type = BTreeMap::new();
        let mut live_objects = 0;
        for data in self.entries.iter().flatten().filter_map(|e| e.data.as_ref()) {
            live_objects += 1;
            *objects_by_type.entry(data.variant_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            objects_by_type,
            tracker_allocations: self.tracker.allocation_count(),
            tracker_memory_bytes: self.tracker.current_memory_bytes(),
        }
    }

    /// Number of live entries, used by leak tests.
    #[must_use]
    #[cfg(feature = "ref-count-return")]
    pub fn entry_count(&self) -> usize {
        self.entries.iter().filter(|o| o.is_some()).count()
    }

    // ========================================================================
    // Allocation helpers
    // ========================================================================

    pub fn alloc_str(&mut self, s: &str) -> Result<Value, ResourceError> {
        self.alloc_bytes(s.as_bytes().to_vec())
    }

    pub fn alloc_bytes(&mut self, bytes: Vec<u8>) -> Result<Value, ResourceError> {
        Ok(Value::Ref(self.allocate(HeapData::Str(Str::new(bytes)))?))
    }

    pub fn alloc_tuple(&mut self, items: Vec<Value>) -> Result<Value, ResourceError> {
        Ok(Value::Ref(self.allocate(HeapData::Tuple(Tuple::new(items)))?))
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> Result<Value, ResourceError> {
        Ok(Value::Ref(self.allocate(HeapData::List(List::new(items)))?))
    }

    pub fn alloc_dict(&mut self) -> Result<HeapId, ResourceError> {
        self.allocate(HeapData::Dict(Dict::new()))
    }

    /// Raw bytes of a `str` value.
    #[must_use]
    pub fn str_bytes(&self, value: &Value) -> Option<&[u8]> {
        match value {
            Value::Ref(id) => match self.get(*id) {
                HeapData::Str(s) => Some(s.as_bytes()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Lossy UTF-8 text of a `str` value.
    #[must_use]
    pub fn str_text(&self, value: &Value) -> Option<String> {
        self.str_bytes(value).map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Items of a tuple or list, borrowed.
    #[must_use]
    pub fn sequence_items(&self, value: &Value) -> Option<&[Value]> {
        match value {
            Value::Ref(id) => match self.get(*id) {
                HeapData::Tuple(t) => Some(t.items()),
                HeapData::List(l) => Some(l.items()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Clones the items of a tuple or list out of the heap with their refcounts bumped.
    #[must_use]
    pub fn clone_sequence_items(&self, value: &Value) -> Option<Vec<Value>> {
        let items = self.sequence_items(value)?;
        Some(items.iter().map(|v| v.clone_with_heap(self)).collect())
    }

    // ========================================================================
    // Builtin equality and hashing
    // ========================================================================

    /// Equality between builtin payloads, without running user code.
    ///
    /// Returns `None` when an instance is involved (or a dict, whose values may be
    /// instances); the interpreter then dispatches `__eq__`.
    #[must_use]
    pub fn builtin_eq(&self, a: &Value, b: &Value) -> Option<bool> {
        if a.is(b) {
            return Some(true);
        }
        match (a, b) {
            (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => {
                Some(int_like(a) == int_like(b))
            }
            (Value::Ref(x), Value::Ref(y)) => match (self.get(*x), self.get(*y)) {
                (HeapData::Str(s1), HeapData::Str(s2)) => Some(s1.as_bytes() == s2.as_bytes()),
                (HeapData::LongInt(l1), HeapData::LongInt(l2)) => Some(l1 == l2),
                (HeapData::Tuple(t1), HeapData::Tuple(t2)) => self.items_eq(t1.items(), t2.items()),
                (HeapData::List(l1), HeapData::List(l2)) => self.items_eq(l1.items(), l2.items()),
                (HeapData::Instance(_) | HeapData::Dict(_), _) | (_, HeapData::Instance(_) | HeapData::Dict(_)) => {
                    None
                }
                _ => Some(false),
            },
            (Value::Ref(id), _) | (_, Value::Ref(id)) => match self.get(*id) {
                HeapData::Instance(_) => None,
                _ => Some(false),
            },
            _ => Some(false),
        }
    }

    fn items_eq(&self, a: &[Value], b: &[Value]) -> Option<bool> {
        if a.len() != b.len() {
            return Some(false);
        }
        for (x, y) in a.iter().zip(b) {
            if !self.builtin_eq(x, y)? {
                return Some(false);
            }
        }
        Some(true)
    }

    /// Hash of a builtin payload.
    ///
    /// `Ok(None)` means user code decides (an instance, or a tuple containing one);
    /// lists, dicts and slices are unhashable.
    pub fn builtin_hash(&self, value: &Value) -> RunResult<Option<i64>> {
        let hash = match value {
            Value::Int(v) => Int::Native(*v).hash(),
            Value::Bool(b) => i64::from(*b),
            Value::Ref(id) => match self.get(*id) {
                HeapData::Str(s) => s.hash(),
                HeapData::LongInt(li) => Int::Big(li.digits().to_vec()).hash(),
                HeapData::Tuple(t) => {
                    let mut hashes = Vec::with_capacity(t.len());
                    for item in t.items() {
                        match self.builtin_hash(item)? {
                            Some(h) => hashes.push(h),
                            None => return Ok(None),
                        }
                    }
                    tuple_hash(&hashes)
                }
                HeapData::List(_) => return Err(ExcType::type_error_unhashable("list")),
                HeapData::Dict(_) => return Err(ExcType::type_error_unhashable("dict")),
                HeapData::Slice(_) => return Err(ExcType::type_error_unhashable("slice")),
                HeapData::Instance(_) => return Ok(None),
                _ => value.id(),
            },
            other => other.id(),
        };
        Ok(Some(hash))
    }

    // ========================================================================
    // String-keyed dict access
    // ========================================================================

    /// Looks up a `str` key by raw bytes, without equality dispatch.
    #[must_use]
    pub fn dict_get_str(&self, dict_id: HeapId, name: &str) -> Option<&Value> {
        let HeapData::Dict(dict) = self.get(dict_id) else {
            return None;
        };
        let hash = hash_bytes(name.as_bytes());
        match dict.find_by(hash, |k| Some(self.str_bytes(k) == Some(name.as_bytes()))) {
            Lookup::Found(slot) => Some(&dict.entry(slot).value),
            Lookup::Missing | Lookup::NeedsDispatch => None,
        }
    }

    /// Sets a `str` key, allocating the key string when the entry is new.
    pub fn dict_set_str(&mut self, dict_id: HeapId, name: &str, value: Value) -> Result<(), ResourceError> {
        let hash = hash_bytes(name.as_bytes());
        let found = match self.get(dict_id) {
            HeapData::Dict(dict) => dict.find_by(hash, |k| Some(self.str_bytes(k) == Some(name.as_bytes()))),
            _ => Lookup::Missing,
        };
        if let Lookup::Found(slot) = found {
            let old = match self.get_mut(dict_id) {
                HeapData::Dict(dict) => dict.replace_value(slot, value),
                _ => unreachable!("dict_set_str: checked above"),
            };
            old.drop_with_heap(self);
            return Ok(());
        }
        let key = match self.alloc_str(name).and_then(|k| self.on_container_insert().map(|()| k)) {
            Ok(key) => key,
            Err(err) => {
                value.drop_with_heap(self);
                return Err(err);
            }
        };
        match self.get_mut(dict_id) {
            HeapData::Dict(dict) => dict.insert_new(hash, key, value),
            _ => {
                key.drop_with_heap(self);
                value.drop_with_heap(self);
            }
        }
        Ok(())
    }

    /// Removes a `str` key, returning its value.
    pub fn dict_del_str(&mut self, dict_id: HeapId, name: &str) -> Option<Value> {
        let hash = hash_bytes(name.as_bytes());
        let found = match self.get(dict_id) {
            HeapData::Dict(dict) => dict.find_by(hash, |k| Some(self.str_bytes(k) == Some(name.as_bytes()))),
            _ => Lookup::Missing,
        };
        let Lookup::Found(slot) = found else {
            return None;
        };
        let entry = match self.get_mut(dict_id) {
            HeapData::Dict(dict) => dict.remove(slot),
            _ => return None,
        };
        entry.key.drop_with_heap(self);
        Some(entry.value)
    }

    /// Copies every entry of `src` into `dst`, comparing keys with builtin equality.
    ///
    /// Existing keys keep their value unless `overwrite` is set. Used for type dicts,
    /// whose keys are strings.
    pub fn dict_merge_builtin(&mut self, dst: HeapId, src: HeapId, overwrite: bool) -> Result<(), ResourceError> {
        let entries: Vec<(i64, Value, Value)> = match self.get(src) {
            HeapData::Dict(dict) => dict
                .iter()
                .map(|e| (e.hash, e.key.clone_with_heap(self), e.value.clone_with_heap(self)))
                .collect(),
            _ => return Ok(()),
        };
        let mut entries = entries.into_iter();
        while let Some((hash, key, value)) = entries.next() {
            if let Lookup::Found(slot) = self.dict_lookup_builtin(dst, hash, &key) {
                key.drop_with_heap(self);
                if overwrite {
                    let old = match self.get_mut(dst) {
                        HeapData::Dict(dict) => dict.replace_value(slot, value),
                        _ => unreachable!("dict_merge_builtin: lookup found a slot"),
                    };
                    old.drop_with_heap(self);
                } else {
                    value.drop_with_heap(self);
                }
                continue;
            }
            if let Err(err) = self.on_container_insert() {
                (key, value).drop_with_heap(self);
                for (_, k, v) in entries {
                    (k, v).drop_with_heap(self);
                }
                return Err(err);
            }
            if let HeapData::Dict(dict) = self.get_mut(dst) {
                dict.insert_new(hash, key, value);
            } else {
                (key, value).drop_with_heap(self);
            }
        }
        Ok(())
    }

    /// Looks up an arbitrary key with builtin equality only.
    #[must_use]
    pub fn dict_lookup_builtin(&self, dict_id: HeapId, hash: i64, key: &Value) -> Lookup {
        match self.get(dict_id) {
            HeapData::Dict(dict) => dict.find_by(hash, |k| self.builtin_eq(k, key)),
            _ => Lookup::Missing,
        }
    }
}

fn int_like(v: &Value) -> i64 {
    match v {
        Value::Int(i) => *i,
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

/// Marks all contained values as dereferenced before dropping, so the `ref-count-panic`
/// feature does not fire for objects still alive when the interpreter goes away.
#[cfg(feature = "ref-count-panic")]
impl<T: ResourceTracker> Drop for Heap<T> {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let mut dummy_stack = Vec::new();
        for value in self.entries.iter_mut().flatten() {
            if let Some(data) = &mut value.data {
                data.dec_ref_ids(&mut dummy_stack);
            }
        }
    }
}

/// This trait represents types that contain a `Heap`; it allows for more complex structures
/// to participate in the `HeapGuard` pattern.
pub(crate) trait ContainsHeap<T: ResourceTracker> {
    fn heap_mut(&mut self) -> &mut Heap<T>;
}

impl<T: ResourceTracker> ContainsHeap<T> for Heap<T> {
    #[inline]
    fn heap_mut(&mut self) -> &mut Self {
        self
    }
}

/// Trait for types that require heap access for proper cleanup.
///
/// Rust's `Drop` cannot decrement heap reference counts because it has no access to the
/// `Heap`, so owned values are released explicitly. **Every code path** must release
/// them, including early returns; prefer [`defer_drop!`] or [`HeapGuard`] so cleanup
/// happens automatically.
pub(crate) trait DropWithHeap<T: ResourceTracker> {
    /// Consume `self` and decrement reference counts for any heap values contained within.
    fn drop_with_heap(self, heap: &mut Heap<T>);
}

impl<T: ResourceTracker> DropWithHeap<T> for Value {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        Self::drop_with_heap(self, heap);
    }
}

impl<T: ResourceTracker, U: DropWithHeap<T>> DropWithHeap<T> for Option<U> {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        if let Some(value) = self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker, U: DropWithHeap<T>> DropWithHeap<T> for Vec<U> {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker, U: DropWithHeap<T>> DropWithHeap<T> for vec::IntoIter<U> {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker, A: DropWithHeap<T>, B: DropWithHeap<T>> DropWithHeap<T> for (A, B) {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        let (a, b) = self;
        a.drop_with_heap(heap);
        b.drop_with_heap(heap);
    }
}

impl<T: ResourceTracker, A: DropWithHeap<T>, B: DropWithHeap<T>, C: DropWithHeap<T>> DropWithHeap<T> for (A, B, C) {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        let (a, b, c) = self;
        a.drop_with_heap(heap);
        b.drop_with_heap(heap);
        c.drop_with_heap(heap);
    }
}

/// Keyword names own no heap references.
impl<T: ResourceTracker> DropWithHeap<T> for String {
    #[inline]
    fn drop_with_heap(self, _heap: &mut Heap<T>) {}
}

impl<T: ResourceTracker> DropWithHeap<T> for HeapId {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        heap.dec_ref(self);
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Dict {
    fn drop_with_heap(mut self, heap: &mut Heap<T>) {
        self.drop_all_entries(heap);
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for ArgValues {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.args.drop_with_heap(heap);
        self.kwargs.drop_with_heap(heap);
    }
}

/// RAII guard that ensures a [`DropWithHeap`] value is cleaned up on every code path.
///
/// The guard's `Drop` impl calls [`DropWithHeap::drop_with_heap`] automatically, so
/// cleanup happens whether the scope exits normally, via `?`, `continue` or an early
/// return. On the normal path the value can be borrowed via [`as_parts`](Self::as_parts)
/// or reclaimed via [`into_inner`](Self::into_inner).
pub(crate) struct HeapGuard<'a, T: ResourceTracker, H: ContainsHeap<T>, V: DropWithHeap<T>> {
    // manually dropped because it needs to be dropped by move.
    value: ManuallyDrop<V>,
    heap: &'a mut H,
    _tracker: std::marker::PhantomData<T>,
}

impl<'a, T: ResourceTracker, H: ContainsHeap<T>, V: DropWithHeap<T>> HeapGuard<'a, T, H, V> {
    #[inline]
    pub fn new(value: V, heap: &'a mut H) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            heap,
            _tracker: std::marker::PhantomData,
        }
    }

    /// Consumes the guard and returns the contained value without dropping it.
    #[inline]
    pub fn into_inner(self) -> V {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: [DH] - `ManuallyDrop::new(self)` prevents `Drop` on self, so we can take the value out
        unsafe { ManuallyDrop::take(&mut this.value) }
    }

    /// Borrows the value (immutably) and heap (mutably) out of the guard.
    #[inline]
    pub fn as_parts(&mut self) -> (&V, &mut H) {
        (&self.value, self.heap)
    }

    /// Borrows the value (mutably) and heap (mutably) out of the guard.
    #[inline]
    pub fn as_parts_mut(&mut self) -> (&mut V, &mut H) {
        (&mut self.value, self.heap)
    }

    /// Consumes the guard and returns the value and heap separately, without dropping.
    #[inline]
    pub fn into_parts(self) -> (V, &'a mut H) {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: [DH] - `ManuallyDrop` prevents `Drop` on self, so we can recover the parts
        unsafe { (ManuallyDrop::take(&mut this.value), addr_of!(this.heap).read()) }
    }

    #[inline]
    pub fn heap(&mut self) -> &mut H {
        self.heap
    }
}

impl<T: ResourceTracker, H: ContainsHeap<T>, V: DropWithHeap<T>> Drop for HeapGuard<'_, T, H, V> {
    fn drop(&mut self) {
        // SAFETY: [DH] - value is never manually dropped until this point
        unsafe { ManuallyDrop::take(&mut self.value) }.drop_with_heap(self.heap.heap_mut());
    }
}

/// Ensures a [`DropWithHeap`] value is released on every path out of the current scope.
///
/// Moves `$value` into a [`HeapGuard`] and rebinds `$value` as `&V` and `$heap` as
/// `&mut H`. The macro rebinds `$heap` with `let`, so it cannot be used with `self`
/// directly; in `&mut self` methods write `let this = self;` first.
#[macro_export]
macro_rules! defer_drop {
    ($value:ident, $heap:ident) => {
        let mut _guard = $crate::heap::HeapGuard::new($value, $heap);
        #[allow(
            clippy::allow_attributes,
            reason = "the reborrowed parts may not both be used in every case, so allow unused vars to avoid warnings"
        )]
        #[allow(unused_variables)]
        let ($value, $heap) = _guard.as_parts();
    };
}

/// Like [`defer_drop!`], but rebinds `$value` as `&mut V`.
#[macro_export]
macro_rules! defer_drop_mut {
    ($value:ident, $heap:ident) => {
        let mut _guard = $crate::heap::HeapGuard::new($value, $heap);
        #[allow(
            clippy::allow_attributes,
            reason = "the reborrowed parts may not both be used in every case, so allow unused vars to avoid warnings"
        )]
        #[allow(unused_variables)]
        let ($value, $heap) = _guard.as_parts_mut();
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{LimitedTracker, NoLimitTracker, ResourceLimits};

    #[test]
    fn inc_then_dec_keeps_refcount() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let s = heap.alloc_str("x").expect("alloc");
        let id = s.ref_id().expect("ref");
        heap.inc_ref(id);
        heap.dec_ref(id);
        assert_eq!(heap.get_refcount(id), 1);
        s.drop_with_heap(&mut heap);
        assert!(!heap.is_live(id));
    }

    #[test]
    fn freeing_a_container_releases_children_once() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let child = heap.alloc_str("child").expect("alloc");
        let child_id = child.ref_id().expect("ref");
        heap.inc_ref(child_id);
        let extra = Value::Ref(child_id);
        let tuple = heap.alloc_tuple(vec![child]).expect("alloc");
        assert_eq!(heap.get_refcount(child_id), 2);
        tuple.drop_with_heap(&mut heap);
        assert_eq!(heap.get_refcount(child_id), 1);
        extra.drop_with_heap(&mut heap);
        assert_eq!(heap.heap_stats().live_objects, 0);
    }

    #[test]
    fn releasing_deeply_nested_lists_does_not_recurse() {
        let mut heap = Heap::new(16, NoLimitTracker);
        let mut value = heap.alloc_list(vec![]).expect("alloc");
        for _ in 0..200_000 {
            value = heap.alloc_list(vec![value]).expect("alloc");
        }
        value.drop_with_heap(&mut heap);
        assert_eq!(heap.heap_stats().live_objects, 0);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let a = heap.alloc_str("a").expect("alloc");
        let a_id = a.ref_id().expect("ref");
        a.drop_with_heap(&mut heap);
        let b = heap.alloc_str("b").expect("alloc");
        assert_eq!(b.ref_id(), Some(a_id));
        b.drop_with_heap(&mut heap);
    }

    #[test]
    fn string_keyed_dict_helpers() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let dict = heap.alloc_dict().expect("alloc");
        heap.dict_set_str(dict, "answer", Value::Int(41)).expect("set");
        heap.dict_set_str(dict, "answer", Value::Int(42)).expect("set");
        assert!(matches!(heap.dict_get_str(dict, "answer"), Some(Value::Int(42))));
        assert!(heap.dict_get_str(dict, "missing").is_none());
        let removed = heap.dict_del_str(dict, "answer");
        assert!(matches!(removed, Some(Value::Int(42))));
        assert!(heap.dict_del_str(dict, "answer").is_none());
        heap.dec_ref(dict);
        assert_eq!(heap.heap_stats().live_objects, 0);
    }

    #[test]
    fn failed_insert_leaves_dict_intact() {
        let mut heap = Heap::new(8, LimitedTracker::new(ResourceLimits::new().max_allocations(3)));
        let dict = heap.alloc_dict().expect("alloc");
        heap.dict_set_str(dict, "a", Value::Int(1)).expect("set");
        // key allocation succeeds, the insert itself is over budget
        assert!(heap.dict_set_str(dict, "b", Value::Int(2)).is_err());
        let HeapData::Dict(d) = heap.get(dict) else { panic!("not a dict") };
        assert_eq!(d.len(), 1);
        assert!(matches!(heap.dict_get_str(dict, "a"), Some(Value::Int(1))));
    }

    #[test]
    fn builtin_equality_and_hash() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let a = heap.alloc_str("key").expect("alloc");
        let b = heap.alloc_str("key").expect("alloc");
        assert_eq!(heap.builtin_eq(&a, &b), Some(true));
        assert_eq!(heap.builtin_eq(&Value::Int(1), &Value::Bool(true)), Some(true));
        assert_eq!(heap.builtin_eq(&a, &Value::Int(1)), Some(false));
        assert_eq!(heap.builtin_hash(&a).ok(), heap.builtin_hash(&b).ok());
        let list = heap.alloc_list(vec![]).expect("alloc");
        assert!(heap.builtin_hash(&list).is_err());
        for v in [a, b, list] {
            v.drop_with_heap(&mut heap);
        }
    }
}
