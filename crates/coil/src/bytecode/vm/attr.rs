//! Attribute lookup, assignment and deletion.
//!
//! Reading an attribute goes through a user `__getattribute__` when the type defines
//! one, then the object's own storage, then the type dictionary (functions found there
//! become methods), then a handful of computed attributes, and finally `__getattr__`.

use super::{VM, natives::NativeId};
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Instance, InstanceAttrs},
    value::Value,
};

/// Where an instance keeps `name`.
enum Storage {
    Dict(HeapId),
    Slot(usize),
    Missing,
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `obj.name`, raising AttributeError when it is missing.
    pub(crate) fn load_attr(&mut self, obj: &Value, name: &str) -> RunResult<Value> {
        match self.get_attr(obj, name)? {
            Some(value) => Ok(value),
            None => Err(self.attribute_missing(obj, name)),
        }
    }

    /// `obj.name`, or `Ok(None)` when it is missing.
    pub(crate) fn get_attr(&mut self, obj: &Value, name: &str) -> RunResult<Option<Value>> {
        if let Some(hook) = self.user_hook(obj, "__getattribute__") {
            let name_value = self.heap.alloc_str(name);
            let result = match name_value {
                Ok(name_value) => self.call_bound(&hook, obj.clone_with_heap(self.heap), ArgValues::one(name_value)),
                Err(err) => Err(err.into()),
            };
            hook.drop_with_heap(self.heap);
            match self.finish_call(result) {
                Ok(value) => return Ok(Some(value)),
                Err(err) if self.error_matches(&err, ExcType::AttributeError) => err.drop_with_heap(self.heap),
                Err(err) => return Err(err),
            }
        } else if let Some(value) = self.generic_getattr(obj, name)? {
            return Ok(Some(value));
        }
        self.getattr_hook(obj, name)
    }

    /// The type's `__getattr__`, for attributes normal lookup did not find.
    fn getattr_hook(&mut self, obj: &Value, name: &str) -> RunResult<Option<Value>> {
        let Some(hook) = self.lookup_type_attr(self.type_of(obj), "__getattr__") else {
            return Ok(None);
        };
        match self.native_id(&hook) {
            Some(NativeId::ObjectGetAttr) => {
                hook.drop_with_heap(self.heap);
                return Ok(None);
            }
            Some(NativeId::ExcGetAttr) => {
                hook.drop_with_heap(self.heap);
                return self.exception_attr(obj, name);
            }
            _ => {}
        }
        let result = match self.heap.alloc_str(name) {
            Ok(name_value) => self.call_bound(&hook, obj.clone_with_heap(self.heap), ArgValues::one(name_value)),
            Err(err) => Err(err.into()),
        };
        hook.drop_with_heap(self.heap);
        match self.finish_call(result) {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.error_matches(&err, ExcType::AttributeError) => {
                err.drop_with_heap(self.heap);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Lookup without any user hooks: the part `object.__getattr__` exposes.
    pub(crate) fn generic_getattr(&mut self, obj: &Value, name: &str) -> RunResult<Option<Value>> {
        let Some(id) = obj.ref_id() else {
            return self.type_dict_attr(obj, name);
        };
        match self.heap.get(id) {
            HeapData::Type(t) => {
                let dict = t.dict;
                match name {
                    "__name__" => {
                        let type_name = t.name.clone();
                        return Ok(Some(self.heap.alloc_str(&type_name)?));
                    }
                    "__bases__" => {
                        let bases = t.base.map(|base| {
                            self.heap.inc_ref(base);
                            Value::Ref(base)
                        });
                        return Ok(Some(self.heap.alloc_tuple(bases.into_iter().collect())?));
                    }
                    "__dict__" => {
                        self.heap.inc_ref(dict);
                        return Ok(Some(Value::Ref(dict)));
                    }
                    "__class__" => return Ok(Some(self.type_value(obj))),
                    _ => {}
                }
                let Some(found) = self.heap.dict_get_str(dict, name).map(|v| v.clone_with_heap(self.heap)) else {
                    return Ok(None);
                };
                if self.is_method_like(&found) {
                    return self.make_method(id, found, None).map(Some);
                }
                Ok(Some(found))
            }
            HeapData::Instance(inst) => {
                let class = inst.class;
                let storage = match &inst.attrs {
                    InstanceAttrs::Dict(dict) => Storage::Dict(*dict),
                    InstanceAttrs::Slots(_) => self.slot_index(class, name).map_or(Storage::Missing, Storage::Slot),
                    InstanceAttrs::None => Storage::Missing,
                };
                match name {
                    "__class__" => return Ok(Some(self.type_value(obj))),
                    "__dict__" => {
                        if let Storage::Dict(dict) = storage {
                            self.heap.inc_ref(dict);
                            return Ok(Some(Value::Ref(dict)));
                        }
                    }
                    _ => {}
                }
                let own = match storage {
                    Storage::Dict(dict) => self.heap.dict_get_str(dict, name).map(|v| v.clone_with_heap(self.heap)),
                    Storage::Slot(index) => match self.heap.get(id) {
                        HeapData::Instance(Instance {
                            attrs: InstanceAttrs::Slots(slots),
                            ..
                        }) => slots[index].as_ref().map(|v| v.clone_with_heap(self.heap)),
                        _ => None,
                    },
                    Storage::Missing => None,
                };
                match own {
                    Some(value) => Ok(Some(value)),
                    None => self.type_dict_attr(obj, name),
                }
            }
            HeapData::Module(module) => {
                let dict = module.dict;
                if name == "__dict__" {
                    self.heap.inc_ref(dict);
                    return Ok(Some(Value::Ref(dict)));
                }
                match self.heap.dict_get_str(dict, name).map(|v| v.clone_with_heap(self.heap)) {
                    Some(value) => Ok(Some(value)),
                    None => self.type_dict_attr(obj, name),
                }
            }
            HeapData::Method(method) => {
                let value = match name {
                    "im_self" | "__self__" => Some(
                        method
                            .bound_self
                            .as_ref()
                            .map_or(Value::None, |v| v.clone_with_heap(self.heap)),
                    ),
                    "im_func" | "__func__" => Some(method.func.clone_with_heap(self.heap)),
                    "im_class" => {
                        self.heap.inc_ref(method.owner);
                        Some(Value::Ref(method.owner))
                    }
                    _ => None,
                };
                match value {
                    Some(value) => Ok(Some(value)),
                    None if name == "__name__" => {
                        let func = method.func.clone_with_heap(self.heap);
                        let found = self.generic_getattr(&func, name);
                        func.drop_with_heap(self.heap);
                        found
                    }
                    None => self.type_dict_attr(obj, name),
                }
            }
            HeapData::Function(func) if matches!(name, "__name__" | "func_name") => {
                let func_name = func.name.clone();
                Ok(Some(self.heap.alloc_str(&func_name)?))
            }
            HeapData::Function(func) if matches!(name, "func_globals" | "__globals__") => {
                self.heap.inc_ref(func.globals);
                Ok(Some(Value::Ref(func.globals)))
            }
            HeapData::Native(native) if name == "__name__" => {
                let native_name = native.name;
                Ok(Some(self.heap.alloc_str(native_name)?))
            }
            _ => self.type_dict_attr(obj, name),
        }
    }

    /// Looks `name` up on the type of `obj`, binding functions to `obj`.
    fn type_dict_attr(&mut self, obj: &Value, name: &str) -> RunResult<Option<Value>> {
        let class = self.type_of(obj);
        if name == "__class__" {
            return Ok(Some(self.type_value(obj)));
        }
        let Some(found) = self.lookup_type_attr(class, name) else {
            return Ok(None);
        };
        if self.is_method_like(&found) {
            let this = obj.clone_with_heap(self.heap);
            return self.make_method(class, found, Some(this)).map(Some);
        }
        Ok(Some(found))
    }

    fn type_value(&self, obj: &Value) -> Value {
        let class = self.type_of(obj);
        self.heap.inc_ref(class);
        Value::Ref(class)
    }

    fn slot_index(&self, class: HeapId, name: &str) -> Option<usize> {
        match self.heap.get(class) {
            HeapData::Type(t) => t.slot_names.iter().position(|slot| slot == name),
            _ => None,
        }
    }

    /// The type's `name` hook, unless it is inherited unchanged from `object`.
    fn user_hook(&mut self, obj: &Value, name: &str) -> Option<Value> {
        let hook = self.lookup_type_attr(self.type_of(obj), name)?;
        if matches!(
            self.native_id(&hook),
            Some(NativeId::ObjectSetAttr | NativeId::ObjectDelAttr | NativeId::ObjectGetAttr)
        ) {
            hook.drop_with_heap(self.heap);
            return None;
        }
        Some(hook)
    }

    fn native_id(&self, value: &Value) -> Option<NativeId> {
        match value.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Native(native)) => Some(native.id),
            _ => None,
        }
    }

    /// The error for a failed attribute read, worded for the kind of object.
    pub(crate) fn attribute_missing(&self, obj: &Value, name: &str) -> RunError {
        match obj.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Type(t)) => SimpleException::new_msg(
                ExcType::AttributeError,
                format!("type object '{}' has no attribute '{name}'", t.name),
            )
            .into(),
            _ => ExcType::attribute_error(self.type_name(obj), name),
        }
    }

    // ========================================================================
    // Assignment and deletion
    // ========================================================================

    /// `obj.name = value`.
    pub(crate) fn set_attr(&mut self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        if let Some(hook) = self.user_hook(obj, "__setattr__") {
            let result = match self.heap.alloc_str(name) {
                Ok(name_value) => {
                    let args = ArgValues::two(name_value, value);
                    self.call_bound(&hook, obj.clone_with_heap(self.heap), args)
                }
                Err(err) => {
                    value.drop_with_heap(self.heap);
                    Err(err.into())
                }
            };
            hook.drop_with_heap(self.heap);
            let result = self.finish_call(result)?;
            result.drop_with_heap(self.heap);
            return Ok(());
        }
        self.generic_setattr(obj, name, value)
    }

    /// Assignment without hooks: the part `object.__setattr__` exposes.
    pub(crate) fn generic_setattr(&mut self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        let target = match obj.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Instance(inst)) => match &inst.attrs {
                InstanceAttrs::Dict(dict) => Some(Storage::Dict(*dict)),
                InstanceAttrs::Slots(_) => self.slot_index(inst.class, name).map(Storage::Slot),
                InstanceAttrs::None => None,
            },
            Some(HeapData::Module(module)) => Some(Storage::Dict(module.dict)),
            Some(HeapData::Type(t)) if t.heap_type => Some(Storage::Dict(t.dict)),
            Some(HeapData::Type(t)) => {
                let message = format!("can't set attributes of built-in/extension type '{}'", t.name);
                value.drop_with_heap(self.heap);
                return Err(ExcType::type_error(message));
            }
            _ => None,
        };
        match target {
            Some(Storage::Dict(dict)) => Ok(self.heap.dict_set_str(dict, name, value)?),
            Some(Storage::Slot(index)) => {
                let old = match obj.ref_id().map(|id| self.heap.get_mut(id)) {
                    Some(HeapData::Instance(Instance {
                        attrs: InstanceAttrs::Slots(slots),
                        ..
                    })) => slots[index].replace(value),
                    _ => Some(value),
                };
                old.drop_with_heap(self.heap);
                Ok(())
            }
            Some(Storage::Missing) | None => {
                value.drop_with_heap(self.heap);
                Err(ExcType::attribute_error(self.type_name(obj), name))
            }
        }
    }

    /// `del obj.name`.
    pub(crate) fn del_attr(&mut self, obj: &Value, name: &str) -> RunResult<()> {
        if let Some(hook) = self.user_hook(obj, "__delattr__") {
            let result = match self.heap.alloc_str(name) {
                Ok(name_value) => self.call_bound(&hook, obj.clone_with_heap(self.heap), ArgValues::one(name_value)),
                Err(err) => Err(err.into()),
            };
            hook.drop_with_heap(self.heap);
            let result = self.finish_call(result)?;
            result.drop_with_heap(self.heap);
            return Ok(());
        }
        self.generic_delattr(obj, name)
    }

    /// Deletion without hooks: the part `object.__delattr__` exposes.
    pub(crate) fn generic_delattr(&mut self, obj: &Value, name: &str) -> RunResult<()> {
        let target = match obj.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Instance(inst)) => match &inst.attrs {
                InstanceAttrs::Dict(dict) => Storage::Dict(*dict),
                InstanceAttrs::Slots(_) => self.slot_index(inst.class, name).map_or(Storage::Missing, Storage::Slot),
                InstanceAttrs::None => Storage::Missing,
            },
            Some(HeapData::Module(module)) => Storage::Dict(module.dict),
            Some(HeapData::Type(t)) if t.heap_type => Storage::Dict(t.dict),
            Some(HeapData::Type(t)) => {
                return Err(ExcType::type_error(format!(
                    "can't set attributes of built-in/extension type '{}'",
                    t.name
                )));
            }
            _ => Storage::Missing,
        };
        let removed = match target {
            Storage::Dict(dict) => self.heap.dict_del_str(dict, name),
            Storage::Slot(index) => match obj.ref_id().map(|id| self.heap.get_mut(id)) {
                Some(HeapData::Instance(Instance {
                    attrs: InstanceAttrs::Slots(slots),
                    ..
                })) => slots[index].take(),
                _ => None,
            },
            Storage::Missing => None,
        };
        match removed {
            Some(old) => {
                old.drop_with_heap(self.heap);
                Ok(())
            }
            None => Err(self.attribute_missing(obj, name)),
        }
    }
}
