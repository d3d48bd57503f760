use crate::{heap::HeapId, value::Value};

/// Heap payload of `tuple`: a fixed-length sequence of owned references.
#[derive(Debug, Default)]
pub(crate) struct Tuple(Vec<Value>);

impl Tuple {
    /// Takes ownership of `items`.
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self(items)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn items(&self) -> &[Value] {
        &self.0
    }

    /// Bounds-checked access.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Unchecked (panicking) access for internal callers that already know the length.
    #[must_use]
    pub fn item(&self, index: usize) -> &Value {
        &self.0[index]
    }

    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for value in &mut self.0 {
            if let Value::Ref(id) = value {
                stack.push(*id);
                #[cfg(feature = "ref-count-panic")]
                value.dec_ref_forget();
            }
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.0.len() * std::mem::size_of::<Value>()
    }
}
