//! Iterator payloads.
//!
//! Advancing them needs the interpreter (a sequence iterator over a user object calls
//! `__getitem__`), so only the state lives here; `next` is implemented by the VM.

use crate::{heap::HeapId, types::dict::DictCursor, value::Value};

/// Iterates a sequence by increasing index until `IndexError`.
#[derive(Debug)]
pub(crate) struct SeqIter {
    /// Owned reference to the sequence; `None` once exhausted.
    pub seq: Option<Value>,
    pub index: usize,
}

impl SeqIter {
    #[must_use]
    pub fn new(seq: Value) -> Self {
        Self { seq: Some(seq), index: 0 }
    }
}

/// What a dict iterator yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DictIterKind {
    Keys,
    Values,
    Items,
}

#[derive(Debug)]
pub(crate) struct DictIter {
    /// Owned reference to the dict.
    pub dict: HeapId,
    pub cursor: DictCursor,
    pub kind: DictIterKind,
}

impl SeqIter {
    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        if let Some(value) = &mut self.seq
            && let Value::Ref(id) = value
        {
            stack.push(*id);
            #[cfg(feature = "ref-count-panic")]
            value.dec_ref_forget();
        }
    }
}
