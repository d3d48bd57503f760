use crate::heap::HeapId;

/// One traceback entry. Entries form a chain from the outermost frame (the head,
/// added last) to the frame where the exception was raised.
#[derive(Debug)]
pub(crate) struct Traceback {
    /// Name of the code object executing in the frame.
    pub name: String,
    pub filename: String,
    /// Source line from the code's line table, if it has one.
    pub line: Option<u32>,
    /// Byte offset of the instruction that was executing.
    pub ip: usize,
    /// Owned reference to the next (inner) entry.
    pub next: Option<HeapId>,
}

impl Traceback {
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.name.len() + self.filename.len()
    }
}
