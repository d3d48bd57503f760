//! Interpreter-wide state: builtin type objects, the exception cell, the builtins
//! namespace and the module table.
//!
//! A `Runtime` is built once per interpreter and lives next to the heap it allocated
//! into. Nothing here is process-global; two interpreters never share a type object.

use std::rc::Rc;

use ahash::AHashMap;
use strum::IntoEnumIterator;

use crate::{
    bytecode::{
        Code,
        vm::natives::{
            BOOL_METHODS, BUILTIN_FUNCTIONS, DICT_METHODS, EXCEPTION_METHODS, INT_METHODS, ITERATOR_METHODS,
            LIST_METHODS, MethodTable, OBJECT_METHODS, STR_METHODS, TUPLE_METHODS,
        },
    },
    exception_private::{ExcInfo, ExcType},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    resource::{ResourceError, ResourceTracker},
    types::{Instance, Layout, NativeFunction, TypeObject},
    value::Value,
};

/// Type objects of the builtin payloads. Each field owns one reference.
#[derive(Debug)]
pub(crate) struct BuiltinTypes {
    pub object: HeapId,
    pub type_: HeapId,
    pub none: HeapId,
    pub not_implemented: HeapId,
    pub int: HeapId,
    pub bool_: HeapId,
    pub str_: HeapId,
    pub tuple: HeapId,
    pub list: HeapId,
    pub dict: HeapId,
    pub function: HeapId,
    pub native: HeapId,
    pub method: HeapId,
    pub code: HeapId,
    pub traceback: HeapId,
    pub slice: HeapId,
    pub seq_iter: HeapId,
    pub dict_iter: HeapId,
    pub module: HeapId,
}

impl BuiltinTypes {
    fn all(&self) -> [HeapId; 19] {
        [
            self.object,
            self.type_,
            self.none,
            self.not_implemented,
            self.int,
            self.bool_,
            self.str_,
            self.tuple,
            self.list,
            self.dict,
            self.function,
            self.native,
            self.method,
            self.code,
            self.traceback,
            self.slice,
            self.seq_iter,
            self.dict_iter,
            self.module,
        ]
    }
}

/// An entry of the module table.
#[derive(Debug)]
pub(crate) enum ModuleSlot {
    /// Registered by the host, not imported yet.
    Pending(Rc<Code>),
    /// Owned reference to the module object.
    Loaded(HeapId),
}

#[derive(Debug)]
pub(crate) struct Runtime {
    pub types: BuiltinTypes,
    /// Indexed by `ExcType as usize`.
    exc_types: Vec<HeapId>,
    /// Owned reference to the builtins namespace.
    pub builtins: HeapId,
    /// Pre-built instances, raised without allocating.
    memory_error: HeapId,
    stop_iteration: HeapId,
    /// The current exception, at most one outstanding.
    exc: Option<ExcInfo>,
    pub modules: AHashMap<String, ModuleSlot>,
    /// Python 2 print state: a space is due before the next item.
    pub softspace: bool,
}

impl Runtime {
    /// Creates every builtin type, the exception hierarchy, the singleton exception
    /// instances and the builtins namespace.
    pub fn new(heap: &mut Heap<impl ResourceTracker>) -> Result<Self, ResourceError> {
        let object = alloc_type(heap, "object", None, Layout::Object, false, None, OBJECT_METHODS)?;
        let builtin = |heap: &mut Heap<_>, name: &str, methods: MethodTable| {
            alloc_type(heap, name, Some(object), Layout::Builtin, false, None, methods)
        };
        let type_ = builtin(heap, "type", &[])?;
        let none = builtin(heap, "NoneType", &[])?;
        let not_implemented = builtin(heap, "NotImplementedType", &[])?;
        let int = builtin(heap, "int", INT_METHODS)?;
        let bool_ = alloc_type(heap, "bool", Some(int), Layout::Builtin, false, None, BOOL_METHODS)?;
        let types = BuiltinTypes {
            object,
            type_,
            none,
            not_implemented,
            int,
            bool_,
            str_: builtin(heap, "str", STR_METHODS)?,
            tuple: builtin(heap, "tuple", TUPLE_METHODS)?,
            list: builtin(heap, "list", LIST_METHODS)?,
            dict: builtin(heap, "dict", DICT_METHODS)?,
            function: builtin(heap, "function", &[])?,
            native: builtin(heap, "builtin_function_or_method", &[])?,
            method: builtin(heap, "instancemethod", &[])?,
            code: builtin(heap, "code", &[])?,
            traceback: builtin(heap, "traceback", &[])?,
            slice: builtin(heap, "slice", &[])?,
            seq_iter: builtin(heap, "iterator", ITERATOR_METHODS)?,
            dict_iter: builtin(heap, "dictionary-iterator", ITERATOR_METHODS)?,
            module: builtin(heap, "module", &[])?,
        };

        // declaration order puts every base before its subclasses
        let mut exc_types: Vec<HeapId> = Vec::new();
        for exc_type in ExcType::iter() {
            let base = exc_type.base().map_or(object, |b| exc_types[b as usize]);
            let methods = if exc_type == ExcType::BaseException {
                EXCEPTION_METHODS
            } else {
                &[]
            };
            let id = alloc_type(heap, exc_type.into(), Some(base), Layout::Exception, true, Some(exc_type), methods)?;
            exc_types.push(id);
        }

        let memory_error = Instance::allocate(heap, exc_types[ExcType::MemoryError as usize])?;
        let stop_iteration = Instance::allocate(heap, exc_types[ExcType::StopIteration as usize])?;

        let builtins = heap.alloc_dict()?;
        let named_types = [
            ("object", types.object),
            ("type", types.type_),
            ("int", types.int),
            ("bool", types.bool_),
            ("str", types.str_),
            ("tuple", types.tuple),
            ("list", types.list),
            ("dict", types.dict),
            ("slice", types.slice),
        ];
        for (name, id) in named_types {
            heap.inc_ref(id);
            heap.dict_set_str(builtins, name, Value::Ref(id))?;
        }
        for (exc_type, &id) in ExcType::iter().zip(&exc_types) {
            heap.inc_ref(id);
            heap.dict_set_str(builtins, exc_type.into(), Value::Ref(id))?;
        }
        heap.dict_set_str(builtins, "True", Value::Bool(true))?;
        heap.dict_set_str(builtins, "False", Value::Bool(false))?;
        heap.dict_set_str(builtins, "None", Value::None)?;
        heap.dict_set_str(builtins, "NotImplemented", Value::NotImplemented)?;
        for &(name, id) in BUILTIN_FUNCTIONS {
            let func = heap.allocate(HeapData::Native(NativeFunction { name, id }))?;
            heap.dict_set_str(builtins, name, Value::Ref(func))?;
        }
        let module_name = heap.alloc_str("__builtin__")?;
        heap.dict_set_str(builtins, "__name__", module_name)?;

        Ok(Self {
            types,
            exc_types,
            builtins,
            memory_error,
            stop_iteration,
            exc: None,
            modules: AHashMap::new(),
            softspace: false,
        })
    }

    /// The type object of a builtin exception.
    #[must_use]
    pub fn exc_type(&self, exc_type: ExcType) -> HeapId {
        self.exc_types[exc_type as usize]
    }

    /// The type object of any value.
    #[must_use]
    pub fn type_of(&self, heap: &Heap<impl ResourceTracker>, value: &Value) -> HeapId {
        let t = &self.types;
        match value {
            Value::None => t.none,
            Value::NotImplemented => t.not_implemented,
            Value::Bool(_) => t.bool_,
            Value::Int(_) => t.int,
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Str(_) => t.str_,
                HeapData::Tuple(_) => t.tuple,
                HeapData::List(_) => t.list,
                HeapData::Dict(_) => t.dict,
                HeapData::LongInt(_) => t.int,
                HeapData::Type(_) => t.type_,
                HeapData::Instance(inst) => inst.class,
                HeapData::Function(_) => t.function,
                HeapData::Native(_) => t.native,
                HeapData::Method(_) => t.method,
                HeapData::Code(_) => t.code,
                HeapData::Traceback(_) => t.traceback,
                HeapData::Slice(_) => t.slice,
                HeapData::SeqIter(_) => t.seq_iter,
                HeapData::DictIter(_) => t.dict_iter,
                HeapData::Module(_) => t.module,
            },
            #[cfg(feature = "ref-count-panic")]
            Value::Dereferenced => panic!("type_of on a released value"),
        }
    }

    // ========================================================================
    // Exception cell
    // ========================================================================

    #[must_use]
    pub fn occurred(&self) -> bool {
        self.exc.is_some()
    }

    /// Sets the current exception, releasing any previous one.
    pub fn raise(&mut self, heap: &mut Heap<impl ResourceTracker>, info: ExcInfo) {
        if let Some(old) = self.exc.replace(info) {
            old.drop_with_heap(heap);
        }
    }

    /// Takes the current exception out of the cell.
    pub fn fetch(&mut self) -> Option<ExcInfo> {
        self.exc.take()
    }

    /// Puts back a previously fetched exception (or clears the cell with `None`).
    pub fn restore(&mut self, heap: &mut Heap<impl ResourceTracker>, info: Option<ExcInfo>) {
        let old = std::mem::replace(&mut self.exc, info);
        old.drop_with_heap(heap);
    }

    /// Whether the current exception is an instance of `kind` or one of its subclasses.
    #[must_use]
    pub fn matches(&self, heap: &Heap<impl ResourceTracker>, kind: HeapId) -> bool {
        self.exc.as_ref().is_some_and(|info| info_matches(heap, info, kind))
    }

    /// The singleton `MemoryError`, as a fresh set of owned references.
    #[must_use]
    pub fn memory_error_info(&self, heap: &Heap<impl ResourceTracker>) -> ExcInfo {
        self.singleton_info(heap, ExcType::MemoryError, self.memory_error)
    }

    /// The singleton `StopIteration`.
    #[must_use]
    pub fn stop_iteration_info(&self, heap: &Heap<impl ResourceTracker>) -> ExcInfo {
        self.singleton_info(heap, ExcType::StopIteration, self.stop_iteration)
    }

    fn singleton_info(&self, heap: &Heap<impl ResourceTracker>, exc_type: ExcType, instance: HeapId) -> ExcInfo {
        let kind = self.exc_type(exc_type);
        heap.inc_ref(kind);
        heap.inc_ref(instance);
        ExcInfo {
            kind: Value::Ref(kind),
            value: Value::Ref(instance),
            traceback: Value::None,
        }
    }

    /// Whether `id` is one of the pre-built exception instances.
    #[must_use]
    pub fn is_singleton(&self, id: HeapId) -> bool {
        id == self.memory_error || id == self.stop_iteration
    }

    /// Releases every reference the runtime owns.
    pub fn release(mut self, heap: &mut Heap<impl ResourceTracker>) {
        self.exc.take().drop_with_heap(heap);
        for (_, slot) in self.modules.drain() {
            if let ModuleSlot::Loaded(id) = slot {
                heap.dec_ref(id);
            }
        }
        heap.dec_ref(self.builtins);
        heap.dec_ref(self.memory_error);
        heap.dec_ref(self.stop_iteration);
        for id in self.exc_types.drain(..).rev() {
            heap.dec_ref(id);
        }
        for id in self.types.all().into_iter().rev() {
            heap.dec_ref(id);
        }
    }
}

/// Whether the exception in `info` is of type `kind` or a subclass.
pub(crate) fn info_matches(heap: &Heap<impl ResourceTracker>, info: &ExcInfo, kind: HeapId) -> bool {
    info.kind.ref_id().is_some_and(|t| is_subtype(heap, t, kind))
}

/// Whether `sub` is `sup` or derives from it.
#[must_use]
pub(crate) fn is_subtype(heap: &Heap<impl ResourceTracker>, sub: HeapId, sup: HeapId) -> bool {
    let mut current = Some(sub);
    while let Some(id) = current {
        if id == sup {
            return true;
        }
        current = match heap.get_if_live(id) {
            Some(HeapData::Type(t)) => t.base,
            _ => None,
        };
    }
    false
}

/// Turns a static method table into a dict of native function objects.
pub(crate) fn build_method_dict(
    heap: &mut Heap<impl ResourceTracker>,
    methods: MethodTable,
) -> Result<HeapId, ResourceError> {
    let dict = heap.alloc_dict()?;
    for &(name, id) in methods {
        let result = heap
            .allocate(HeapData::Native(NativeFunction { name, id }))
            .and_then(|func| heap.dict_set_str(dict, name, Value::Ref(func)));
        if let Err(err) = result {
            heap.dec_ref(dict);
            return Err(err);
        }
    }
    Ok(dict)
}

/// Allocates a builtin type: its own methods, `__name__`, then the base's entries merged
/// in without overwriting.
pub(crate) fn alloc_type(
    heap: &mut Heap<impl ResourceTracker>,
    name: &str,
    base: Option<HeapId>,
    layout: Layout,
    has_dict: bool,
    exc_type: Option<ExcType>,
    methods: MethodTable,
) -> Result<HeapId, ResourceError> {
    let dict = build_method_dict(heap, methods)?;
    let filled = heap.alloc_str(name).and_then(|n| heap.dict_set_str(dict, "__name__", n));
    let merged = filled.and_then(|()| match base.map(|b| heap.get(b)) {
        Some(HeapData::Type(t)) => {
            let base_dict = t.dict;
            heap.dict_merge_builtin(dict, base_dict, false)
        }
        _ => Ok(()),
    });
    if let Err(err) = merged {
        heap.dec_ref(dict);
        return Err(err);
    }
    if let Some(base) = base {
        heap.inc_ref(base);
    }
    heap.allocate(HeapData::Type(TypeObject {
        name: name.to_owned(),
        base,
        layout,
        has_dict,
        slot_names: Vec::new(),
        dict,
        exc_type,
        heap_type: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn exception_cell_raise_fetch_restore() {
        let mut heap = Heap::new(64, NoLimitTracker);
        let mut rt = Runtime::new(&mut heap).expect("runtime");
        assert!(!rt.occurred());
        assert!(rt.fetch().is_none());

        let info = rt.stop_iteration_info(&heap);
        rt.raise(&mut heap, info);
        assert!(rt.occurred());

        let fetched = rt.fetch().expect("raised");
        assert!(!rt.occurred());
        rt.restore(&mut heap, Some(fetched));
        assert!(rt.occurred());

        // raising over a pending exception replaces it
        let info = rt.memory_error_info(&heap);
        rt.raise(&mut heap, info);
        assert!(rt.matches(&heap, rt.exc_type(ExcType::MemoryError)));

        rt.restore(&mut heap, None);
        assert!(!rt.occurred());
        rt.release(&mut heap);
    }

    #[test]
    fn matches_follows_the_exception_hierarchy() {
        let mut heap = Heap::new(64, NoLimitTracker);
        let mut rt = Runtime::new(&mut heap).expect("runtime");
        assert!(!rt.matches(&heap, rt.exc_type(ExcType::StopIteration)));

        let info = rt.stop_iteration_info(&heap);
        rt.raise(&mut heap, info);
        assert!(rt.matches(&heap, rt.exc_type(ExcType::StopIteration)));
        assert!(rt.matches(&heap, rt.exc_type(ExcType::Exception)));
        assert!(rt.matches(&heap, rt.exc_type(ExcType::BaseException)));
        assert!(!rt.matches(&heap, rt.exc_type(ExcType::LookupError)));
        rt.release(&mut heap);
    }
}
