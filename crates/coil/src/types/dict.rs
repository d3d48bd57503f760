//! The 32-bucket chained hash table behind `dict`, namespaces and type dicts.
//!
//! Each bucket is a chain stored in a `Vec`; the end of the vector is the head of the
//! chain, so new entries (pushed at the end) are visited first by lookups and iteration.
//! The table itself knows nothing about equality: lookups take a predicate, and the
//! heap/VM layers supply builtin or dispatched `__eq__` comparisons.

use crate::{
    heap::{Heap, HeapId},
    resource::ResourceTracker,
    value::Value,
};

pub(crate) const NUM_BUCKETS: usize = 32;

#[derive(Debug)]
pub(crate) struct DictEntry {
    pub hash: i64,
    pub key: Value,
    pub value: Value,
}

/// Position of a live entry: bucket number and index within the bucket's vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DictSlot {
    pub bucket: usize,
    pub index: usize,
}

/// Outcome of a lookup with a builtin equality predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    Found(DictSlot),
    Missing,
    /// A candidate with a matching hash needs a user-level `__eq__` to decide.
    NeedsDispatch,
}

/// Opaque iteration cursor: bucket number and distance from the chain head.
///
/// Mutating the dict while a cursor is live is memory safe (positions are bounds
/// checked), but entries may then be skipped or repeated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DictCursor {
    bucket: usize,
    pos: usize,
}

#[derive(Debug)]
pub(crate) struct Dict {
    buckets: [Vec<DictEntry>; NUM_BUCKETS],
    count: usize,
}

impl Default for Dict {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
#[must_use]
pub(crate) fn bucket_of(hash: i64) -> usize {
    (hash as u64 % NUM_BUCKETS as u64) as usize
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Vec::new()),
            count: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Scans the chain for `hash` from the head, comparing cached hashes first.
    ///
    /// `eq` returns `Some(true)` on a match, `Some(false)` to continue and `None` when the
    /// comparison cannot be decided without running user code.
    pub fn find_by(&self, hash: i64, mut eq: impl FnMut(&Value) -> Option<bool>) -> Lookup {
        let bucket = bucket_of(hash);
        for (index, entry) in self.buckets[bucket].iter().enumerate().rev() {
            if entry.hash != hash {
                continue;
            }
            match eq(&entry.key) {
                Some(true) => return Lookup::Found(DictSlot { bucket, index }),
                Some(false) => {}
                None => return Lookup::NeedsDispatch,
            }
        }
        Lookup::Missing
    }

    /// Slots whose cached hash equals `hash`, in chain order.
    #[must_use]
    pub fn candidates(&self, hash: i64) -> Vec<DictSlot> {
        let bucket = bucket_of(hash);
        self.buckets[bucket]
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, e)| e.hash == hash)
            .map(|(index, _)| DictSlot { bucket, index })
            .collect()
    }

    /// Finds the slot holding exactly this key object (identity), used to re-locate an
    /// entry after user code may have mutated the table.
    #[must_use]
    pub fn find_identical(&self, hash: i64, key: &Value) -> Option<DictSlot> {
        let bucket = bucket_of(hash);
        self.buckets[bucket]
            .iter()
            .enumerate()
            .rev()
            .find(|(_, e)| e.hash == hash && e.key.is(key))
            .map(|(index, _)| DictSlot { bucket, index })
    }

    #[must_use]
    pub fn entry(&self, slot: DictSlot) -> &DictEntry {
        &self.buckets[slot.bucket][slot.index]
    }

    /// Inserts a key known to be absent at the head of its chain.
    pub fn insert_new(&mut self, hash: i64, key: Value, value: Value) {
        self.buckets[bucket_of(hash)].push(DictEntry { hash, key, value });
        self.count += 1;
    }

    /// Replaces the value of an existing entry, returning the old one.
    pub fn replace_value(&mut self, slot: DictSlot, value: Value) -> Value {
        std::mem::replace(&mut self.buckets[slot.bucket][slot.index].value, value)
    }

    pub fn remove(&mut self, slot: DictSlot) -> DictEntry {
        self.count -= 1;
        self.buckets[slot.bucket].remove(slot.index)
    }

    /// Advances the cursor, returning the next live entry.
    pub fn next(&self, cursor: &mut DictCursor) -> Option<&DictEntry> {
        while cursor.bucket < NUM_BUCKETS {
            let chain = &self.buckets[cursor.bucket];
            if cursor.pos < chain.len() {
                let entry = &chain[chain.len() - 1 - cursor.pos];
                cursor.pos += 1;
                return Some(entry);
            }
            cursor.bucket += 1;
            cursor.pos = 0;
        }
        None
    }

    /// Iterates entries in cursor order.
    pub fn iter(&self) -> impl Iterator<Item = &DictEntry> {
        self.buckets.iter().flat_map(|chain| chain.iter().rev())
    }

    /// Removes every entry, returning them in iteration order.
    pub fn drain(&mut self) -> Vec<DictEntry> {
        self.count = 0;
        let mut out = Vec::new();
        for chain in &mut self.buckets {
            out.extend(chain.drain(..).rev());
        }
        out
    }

    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for chain in &mut self.buckets {
            for entry in chain.iter_mut() {
                for value in [&mut entry.key, &mut entry.value] {
                    if let Value::Ref(id) = value {
                        stack.push(*id);
                        #[cfg(feature = "ref-count-panic")]
                        value.dec_ref_forget();
                    }
                }
            }
        }
    }

    pub fn drop_all_entries(&mut self, heap: &mut Heap<impl ResourceTracker>) {
        for entry in self.drain() {
            entry.key.drop_with_heap(heap);
            entry.value.drop_with_heap(heap);
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.count * std::mem::size_of::<DictEntry>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_eq(target: i64) -> impl FnMut(&Value) -> Option<bool> {
        move |k| Some(matches!(k, Value::Int(v) if *v == target))
    }

    #[test]
    fn bucket_uses_unsigned_modulo() {
        assert_eq!(bucket_of(33), 1);
        assert_eq!(bucket_of(-2), ((-2i64) as u64 % 32) as usize);
    }

    #[test]
    fn newest_entry_is_chain_head() {
        let mut dict = Dict::new();
        dict.insert_new(1, Value::Int(1), Value::Int(10));
        dict.insert_new(33, Value::Int(33), Value::Int(330));
        let keys: Vec<i64> = dict
            .iter()
            .map(|e| match e.key {
                Value::Int(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![33, 1]);
    }

    #[test]
    fn find_remove_and_len() {
        let mut dict = Dict::new();
        for i in 0..100 {
            dict.insert_new(i, Value::Int(i), Value::Int(i * 2));
        }
        assert_eq!(dict.len(), 100);
        let Lookup::Found(slot) = dict.find_by(42, int_eq(42)) else {
            panic!("key 42 missing");
        };
        assert!(matches!(dict.entry(slot).value, Value::Int(84)));
        let removed = dict.remove(slot);
        assert!(matches!(removed.key, Value::Int(42)));
        assert_eq!(dict.len(), 99);
        assert_eq!(dict.find_by(42, int_eq(42)), Lookup::Missing);
    }

    #[test]
    fn undecidable_candidate_requests_dispatch() {
        let mut dict = Dict::new();
        dict.insert_new(5, Value::Int(5), Value::None);
        assert_eq!(dict.find_by(5, |_| None), Lookup::NeedsDispatch);
        // a different hash never reaches the predicate
        assert_eq!(dict.find_by(6, |_| None), Lookup::Missing);
    }

    #[test]
    fn cursor_visits_every_entry_once() {
        let mut dict = Dict::new();
        for i in 0..70 {
            dict.insert_new(i, Value::Int(i), Value::None);
        }
        let mut cursor = DictCursor::default();
        let mut seen = 0;
        while dict.next(&mut cursor).is_some() {
            seen += 1;
        }
        assert_eq!(seen, 70);
    }
}
