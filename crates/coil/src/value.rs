use crate::{
    heap::{Heap, HeapId},
    resource::ResourceTracker,
};

/// Primary value type representing runtime objects.
///
/// Small immediate values (None, NotImplemented, bools and machine-word ints) are stored
/// inline; every other object lives in the heap arena and is referenced via `Ref(HeapId)`.
///
/// NOTE: `Clone` is intentionally NOT derived. Use `clone_with_heap()` for heap values
/// or `clone_immediate()` for immediate values only. A `Value` held by value is an owned
/// reference; `&Value` is a borrowed one.
#[derive(Debug)]
pub(crate) enum Value {
    None,
    /// Returned by binary and comparison methods to ask for the reflected operation.
    NotImplemented,
    Bool(bool),
    /// The native form of an integer. Integers outside `i64` live on the heap as
    /// `HeapData::LongInt`.
    Int(i64),
    Ref(HeapId),
    /// Sentinel value indicating this Value was properly cleaned up via `drop_with_heap`.
    /// Only exists when `ref-count-panic` feature is enabled.
    #[cfg(feature = "ref-count-panic")]
    Dereferenced,
}

/// Drop implementation that panics if a `Ref` variant is dropped without calling `drop_with_heap`.
#[cfg(feature = "ref-count-panic")]
impl Drop for Value {
    fn drop(&mut self) {
        if let Self::Ref(id) = self {
            panic!("Value::Ref({id:?}) dropped without calling drop_with_heap() - this is a reference counting bug");
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// Base of the synthetic ids handed out for heap objects by `id()` and default reprs.
const HEAP_ID_BASE: i64 = 0x0010_0000;

impl Value {
    /// Clones a value with proper heap reference counting.
    ///
    /// Immediate values are copied; `Ref` values get their refcount incremented.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap<impl ResourceTracker>) -> Self {
        match self {
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
            other => other.clone_immediate(),
        }
    }

    /// Drops a value, decrementing its heap reference count if applicable.
    ///
    /// This MUST be called before overwriting a slot that owns a value or discarding
    /// a value, otherwise the referenced object leaks.
    #[cfg(not(feature = "ref-count-panic"))]
    #[inline]
    pub fn drop_with_heap(self, heap: &mut Heap<impl ResourceTracker>) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// With `ref-count-panic` enabled, `Ref` variants are replaced with `Dereferenced` and
    /// the original is forgotten so the Drop impl does not fire.
    #[cfg(feature = "ref-count-panic")]
    pub fn drop_with_heap(mut self, heap: &mut Heap<impl ResourceTracker>) {
        let old = std::mem::replace(&mut self, Self::Dereferenced);
        if let Self::Ref(id) = &old {
            heap.dec_ref(*id);
            std::mem::forget(old);
        }
    }

    /// Copies an immediate value.
    ///
    /// # Panics
    /// Panics on `Ref`: heap references must go through `clone_with_heap`.
    #[must_use]
    pub fn clone_immediate(&self) -> Self {
        match self {
            Self::Ref(_) => panic!("Ref clones must go through clone_with_heap to maintain refcounts"),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("Cannot clone Dereferenced object"),
            _ => self.copy_for_extend(),
        }
    }

    /// Creates a shallow copy without touching reference counts.
    ///
    /// IMPORTANT: for `Ref` the caller MUST call `heap.inc_ref()` separately. This is used
    /// when values are copied out of a borrowed container and incremented afterwards.
    #[must_use]
    pub(crate) fn copy_for_extend(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::NotImplemented => Self::NotImplemented,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(v) => Self::Int(*v),
            Self::Ref(id) => Self::Ref(*id),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("Cannot copy Dereferenced object"),
        }
    }

    /// Mark as Dereferenced to prevent Drop panic.
    ///
    /// This should be called from `dec_ref_ids` implementations only.
    #[cfg(feature = "ref-count-panic")]
    pub fn dec_ref_forget(&mut self) {
        let old = std::mem::replace(self, Self::Dereferenced);
        std::mem::forget(old);
    }

    /// Returns the heap id for `Ref` values.
    /// Hands the owned reference over to a raw heap id without touching the refcount.
    #[must_use]
    pub fn into_owned_id(self) -> Option<HeapId> {
        let id = self.ref_id();
        #[cfg(feature = "ref-count-panic")]
        std::mem::forget(self);
        id
    }

    #[inline]
    #[must_use]
    pub fn ref_id(&self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Identity comparison (`is`).
    ///
    /// Immediates compare by value, so `None is None` and equal native ints are identical.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::NotImplemented, Self::NotImplemented) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    /// The value returned by `id()` and shown in default reprs.
    ///
    /// Heap objects map to a stable address-like number derived from the arena slot;
    /// immediates get fixed or value-derived numbers in a separate range.
    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            Self::None => 0x10,
            Self::NotImplemented => 0x20,
            Self::Bool(false) => 0x30,
            Self::Bool(true) => 0x40,
            Self::Int(v) => v.wrapping_mul(2).wrapping_sub(1) & 0x000F_FFFF,
            Self::Ref(id) => HEAP_ID_BASE + (id.index() as i64) * 0x20,
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("Cannot get id of Dereferenced object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_of_immediates() {
        assert!(Value::None.is(&Value::None));
        assert!(Value::Int(7).is(&Value::Int(7)));
        assert!(!Value::Int(1).is(&Value::Bool(true)));
        assert!(!Value::None.is(&Value::NotImplemented));
    }

    #[test]
    fn immediate_ids_are_stable() {
        assert_eq!(Value::None.id(), Value::None.id());
        assert_ne!(Value::Bool(true).id(), Value::Bool(false).id());
    }
}
