//! Type objects and instances.

use crate::{
    exception_private::ExcType,
    heap::{Heap, HeapData, HeapId},
    resource::{ResourceError, ResourceTracker},
    value::Value,
};

/// What kind of storage a type's instances get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    /// Plain instances: a dict, fixed slots, or nothing.
    Object,
    /// Instances carry an `args` payload next to their dict.
    Exception,
    /// Builtin payload types (`int`, `list`, `function`, ...). Instances are created by the
    /// type's native `__new__` only, and the type cannot be subclassed.
    Builtin,
}

/// Heap payload of a type object. The type of every type object is `type`.
#[derive(Debug)]
pub(crate) struct TypeObject {
    pub name: String,
    /// Owned reference to the single base; `None` only for `object`.
    pub base: Option<HeapId>,
    pub layout: Layout,
    /// Instances get a `__dict__` (false when the class declares `__slots__`).
    pub has_dict: bool,
    /// Slot names in declaration order, inherited ones first.
    pub slot_names: Vec<String>,
    /// Owned reference to the method dictionary. The base's entries are merged in at
    /// creation time, so lookups only consult this dict.
    pub dict: HeapId,
    /// The builtin exception this type is, or derives from.
    pub exc_type: Option<ExcType>,
    /// Created by a class statement rather than at startup.
    pub heap_type: bool,
}

impl TypeObject {
    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        if let Some(base) = self.base {
            stack.push(base);
        }
        stack.push(self.dict);
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.name.len() + self.slot_names.iter().map(String::len).sum::<usize>()
    }
}

/// Per-instance attribute storage, chosen by the class at creation.
#[derive(Debug)]
pub(crate) enum InstanceAttrs {
    Dict(HeapId),
    Slots(Vec<Option<Value>>),
    None,
}

/// Heap payload of an instance of a user class or an exception.
#[derive(Debug)]
pub(crate) struct Instance {
    /// Owned reference to the class.
    pub class: HeapId,
    pub attrs: InstanceAttrs,
    /// Exception arguments tuple, for exception layouts.
    pub args: Option<Value>,
    /// Set once `__del__` has been scheduled, so it runs at most once.
    pub finalized: bool,
}

impl Instance {
    /// Allocates an instance of `class` with the storage its layout asks for: a fresh
    /// dict, a row of empty slots, or nothing, plus an empty `args` tuple for exceptions.
    pub fn allocate(heap: &mut Heap<impl ResourceTracker>, class: HeapId) -> Result<HeapId, ResourceError> {
        let (has_dict, slot_count, layout) = match heap.get(class) {
            HeapData::Type(t) => (t.has_dict, t.slot_names.len(), t.layout),
            _ => (true, 0, Layout::Object),
        };
        let attrs = if has_dict {
            InstanceAttrs::Dict(heap.alloc_dict()?)
        } else if slot_count > 0 {
            InstanceAttrs::Slots((0..slot_count).map(|_| None).collect())
        } else {
            InstanceAttrs::None
        };
        let args = if layout == Layout::Exception {
            match heap.alloc_tuple(Vec::new()) {
                Ok(args) => Some(args),
                Err(err) => {
                    if let InstanceAttrs::Dict(dict) = attrs {
                        heap.dec_ref(dict);
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };
        heap.inc_ref(class);
        heap.allocate(HeapData::Instance(Self {
            class,
            attrs,
            args,
            finalized: false,
        }))
    }

    #[must_use]
    pub fn dict_id(&self) -> Option<HeapId> {
        match self.attrs {
            InstanceAttrs::Dict(id) => Some(id),
            _ => None,
        }
    }

    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        stack.push(self.class);
        match &mut self.attrs {
            InstanceAttrs::Dict(id) => stack.push(*id),
            InstanceAttrs::Slots(slots) => {
                for value in slots.iter_mut().flatten() {
                    if let Value::Ref(id) = value {
                        stack.push(*id);
                        #[cfg(feature = "ref-count-panic")]
                        value.dec_ref_forget();
                    }
                }
            }
            InstanceAttrs::None => {}
        }
        if let Some(args) = &mut self.args
            && let Value::Ref(id) = args
        {
            stack.push(*id);
            #[cfg(feature = "ref-count-panic")]
            args.dec_ref_forget();
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        let slots = match &self.attrs {
            InstanceAttrs::Slots(s) => s.len() * std::mem::size_of::<Option<Value>>(),
            _ => 0,
        };
        std::mem::size_of::<Self>() + slots
    }
}
