use crate::{heap::HeapId, value::Value};

/// Heap payload of `list`.
///
/// The logical capacity is tracked separately from the `Vec`: when an append pushes the
/// count past it, the capacity becomes `count + 4`, and removals never shrink it.
#[derive(Debug, Default)]
pub(crate) struct List {
    items: Vec<Value>,
    allocated: usize,
}

impl List {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        let allocated = items.len();
        Self { items, allocated }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    #[must_use]
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    fn grow_for(&mut self, count: usize) {
        if count > self.allocated {
            self.allocated = count + 4;
            // the logical capacity grows by four, the backing vector geometrically
            self.items.reserve(self.allocated - self.items.len());
        }
    }

    pub fn append(&mut self, value: Value) {
        self.grow_for(self.items.len() + 1);
        self.items.push(value);
    }

    /// Inserts before `index`, clamped to the current length.
    pub fn insert(&mut self, index: usize, value: Value) {
        self.grow_for(self.items.len() + 1);
        let index = index.min(self.items.len());
        self.items.insert(index, value);
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = Value>) {
        for value in values {
            self.append(value);
        }
    }

    /// Replaces the item at `index`, returning the old value for the caller to release.
    pub fn set(&mut self, index: usize, value: Value) -> Value {
        std::mem::replace(&mut self.items[index], value)
    }

    /// Removes the item at `index`, compacting the remaining items.
    pub fn remove(&mut self, index: usize) -> Value {
        self.items.remove(index)
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.items.pop()
    }

    /// Replaces `start..end` with `values`, returning the removed items.
    pub fn splice(&mut self, start: usize, end: usize, values: Vec<Value>) -> Vec<Value> {
        let new_len = self.items.len() - (end - start) + values.len();
        self.grow_for(new_len);
        self.items.splice(start..end, values).collect()
    }

    /// Removes the items at the given sorted indices.
    pub fn remove_indices(&mut self, indices: &[usize]) -> Vec<Value> {
        let mut removed = Vec::with_capacity(indices.len());
        for &index in indices.iter().rev() {
            removed.push(self.items.remove(index));
        }
        removed
    }

    pub fn reverse(&mut self) {
        self.items.reverse();
    }

    /// Takes the items out, leaving the list empty (used by in-place sort).
    pub fn take_items(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.items)
    }

    pub fn restore_items(&mut self, items: Vec<Value>) {
        self.grow_for(items.len());
        self.items = items;
    }

    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for value in &mut self.items {
            if let Value::Ref(id) = value {
                stack.push(*id);
                #[cfg(feature = "ref-count-panic")]
                value.dec_ref_forget();
            }
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.allocated * std::mem::size_of::<Value>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_grows_to_count_plus_four() {
        let mut list = List::default();
        list.append(Value::Int(1));
        assert_eq!(list.allocated(), 5);
        for i in 2..=5 {
            list.append(Value::Int(i));
        }
        assert_eq!(list.allocated(), 5);
        list.append(Value::Int(6));
        assert_eq!(list.allocated(), 10);
    }

    #[test]
    fn backing_storage_grows_geometrically() {
        let mut list = List::default();
        let mut reallocations = 0;
        let mut capacity = list.items.capacity();
        for i in 0..100_000 {
            list.append(Value::Int(i));
            if list.items.capacity() != capacity {
                capacity = list.items.capacity();
                reallocations += 1;
            }
        }
        assert!(reallocations < 40, "{reallocations} reallocations");
        assert_eq!(list.allocated(), 100_004);
    }

    #[test]
    fn deleting_all_but_last_keeps_survivor_first() {
        let mut list = List::default();
        for i in 0..1000 {
            list.append(Value::Int(i));
        }
        let capacity = list.allocated();
        while list.len() > 1 {
            let _ = list.remove(0);
        }
        assert_eq!(list.len(), 1);
        assert!(matches!(list.get(0), Some(Value::Int(999))));
        assert_eq!(list.allocated(), capacity);
    }
}
