use crate::heap::HeapId;

/// Heap payload of an imported module: its name and namespace dict.
#[derive(Debug)]
pub(crate) struct Module {
    pub name: String,
    /// Owned reference to the module's globals.
    pub dict: HeapId,
}
