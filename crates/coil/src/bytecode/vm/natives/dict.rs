//! `dict` construction and methods.

use super::super::VM;
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{DictIter, DictIterKind},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    fn dict_of(&self, this: &Value, method: &str) -> RunResult<HeapId> {
        self.dict_id(this).ok_or_else(|| {
            ExcType::type_error(format!(
                "descriptor '{method}' requires a 'dict' object but received a '{}'",
                self.type_name(this)
            ))
        })
    }

    /// Stores keyword arguments under string keys.
    fn dict_set_kwargs(&mut self, dict: HeapId, kwargs: Vec<(String, Value)>) -> RunResult<()> {
        let mut kwargs = kwargs.into_iter();
        while let Some((name, value)) = kwargs.next() {
            let key = match self.heap.alloc_str(&name) {
                Ok(key) => key,
                Err(err) => {
                    value.drop_with_heap(self.heap);
                    kwargs.map(|(_, v)| v).collect::<Vec<_>>().drop_with_heap(self.heap);
                    return Err(err.into());
                }
            };
            if let Err(err) = self.dict_set(dict, key, value) {
                kwargs.map(|(_, v)| v).collect::<Vec<_>>().drop_with_heap(self.heap);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Merges an optional positional source and then the keywords, as `dict()` and
    /// `update()` both do.
    fn dict_fill(&mut self, dict: HeapId, name: &str, args: ArgValues) -> RunResult<()> {
        let ArgValues { args, kwargs } = args;
        if args.len() > 1 {
            let count = args.len();
            (args, kwargs).drop_with_heap(self.heap);
            return Err(ExcType::type_error(format!(
                "{name} expected at most 1 arguments, got {count}"
            )));
        }
        if let Some(source) = args.into_iter().next() {
            let merged = self.dict_merge(dict, &source);
            source.drop_with_heap(self.heap);
            if let Err(err) = merged {
                kwargs.drop_with_heap(self.heap);
                return Err(err);
            }
        }
        self.dict_set_kwargs(dict, kwargs)
    }

    /// `dict(mapping_or_pairs=(), **kwargs)`.
    pub(super) fn dict_new(&mut self, _this: &Value, args: ArgValues) -> RunResult<Value> {
        let dict = match self.heap.alloc_dict() {
            Ok(dict) => dict,
            Err(err) => {
                args.drop_with_heap(self.heap);
                return Err(err.into());
            }
        };
        match self.dict_fill(dict, "dict", args) {
            Ok(()) => Ok(Value::Ref(dict)),
            Err(err) => {
                self.heap.dec_ref(dict);
                Err(err)
            }
        }
    }

    /// `keys()`, `values()` and `items()`, which return lists in Python 2.
    pub(super) fn dict_listing(&mut self, this: &Value, args: ArgValues, kind: DictIterKind) -> RunResult<Value> {
        let name = match kind {
            DictIterKind::Keys => "keys",
            DictIterKind::Values => "values",
            DictIterKind::Items => "items",
        };
        args.check_zero_args(name, self.heap)?;
        let dict = self.dict_of(this, name)?;
        let entries = self.dict_entries(dict, kind)?;
        Ok(self.heap.alloc_list(entries)?)
    }

    /// `iterkeys()`, `itervalues()` and `iteritems()`.
    pub(super) fn dict_iterator(&mut self, this: &Value, args: ArgValues, kind: DictIterKind) -> RunResult<Value> {
        let name = match kind {
            DictIterKind::Keys => "iterkeys",
            DictIterKind::Values => "itervalues",
            DictIterKind::Items => "iteritems",
        };
        args.check_zero_args(name, self.heap)?;
        let dict = self.dict_of(this, name)?;
        self.heap.inc_ref(dict);
        let iterator = self.heap.allocate(HeapData::DictIter(DictIter {
            dict,
            cursor: Default::default(),
            kind,
        }));
        match iterator {
            Ok(id) => Ok(Value::Ref(id)),
            Err(err) => {
                self.heap.dec_ref(dict);
                Err(err.into())
            }
        }
    }

    /// `get(key, default=None)`.
    pub(super) fn dict_get_method(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let (key, default) = args.get_one_two_args("get", self.heap)?;
        let found = self.dict_of(this, "get").and_then(|dict| self.dict_get(dict, &key));
        key.drop_with_heap(self.heap);
        match found {
            Ok(Some(value)) => {
                default.drop_with_heap(self.heap);
                Ok(value)
            }
            Ok(None) => Ok(default.unwrap_or(Value::None)),
            Err(err) => {
                default.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    /// `pop(key[, default])`: KeyError only when no default is given.
    pub(super) fn dict_pop_method(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let (key, default) = args.get_one_two_args("pop", self.heap)?;
        let removed = self.dict_of(this, "pop").and_then(|dict| self.dict_remove(dict, &key));
        let result = match (removed, default) {
            (Ok(Some(value)), default) => {
                default.drop_with_heap(self.heap);
                Ok(value)
            }
            (Ok(None), Some(default)) => Ok(default),
            (Ok(None), None) => Err(self.key_error(&key)),
            (Err(err), default) => {
                default.drop_with_heap(self.heap);
                Err(err)
            }
        };
        key.drop_with_heap(self.heap);
        result
    }

    /// `setdefault(key, default=None)`.
    pub(super) fn dict_setdefault(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let (key, default) = args.get_one_two_args("setdefault", self.heap)?;
        let default = default.unwrap_or(Value::None);
        let dict = match self.dict_of(this, "setdefault") {
            Ok(dict) => dict,
            Err(err) => {
                (key, default).drop_with_heap(self.heap);
                return Err(err);
            }
        };
        match self.dict_get(dict, &key) {
            Ok(Some(existing)) => {
                (key, default).drop_with_heap(self.heap);
                Ok(existing)
            }
            Ok(None) => {
                let stored = default.clone_with_heap(self.heap);
                match self.dict_set(dict, key, stored) {
                    Ok(()) => Ok(default),
                    Err(err) => {
                        default.drop_with_heap(self.heap);
                        Err(err)
                    }
                }
            }
            Err(err) => {
                (key, default).drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    /// `update([source], **kwargs)`.
    pub(super) fn dict_update(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let dict = match self.dict_of(this, "update") {
            Ok(dict) => dict,
            Err(err) => {
                args.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        self.dict_fill(dict, "update", args).map(|()| Value::None)
    }

    pub(super) fn dict_copy_method(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("copy", self.heap)?;
        let dict = self.dict_of(this, "copy")?;
        self.dict_copy(dict)
    }

    pub(super) fn dict_clear(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_zero_args("clear", self.heap)?;
        let dict = self.dict_of(this, "clear")?;
        let entries = match self.heap.get_mut(dict) {
            HeapData::Dict(dict) => dict.drain(),
            _ => Vec::new(),
        };
        for entry in entries {
            (entry.key, entry.value).drop_with_heap(self.heap);
        }
        Ok(Value::None)
    }

    pub(super) fn dict_has_key(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let key = args.get_one_arg("has_key", self.heap)?;
        let found = self.dict_of(this, "has_key").and_then(|dict| self.dict_get(dict, &key));
        key.drop_with_heap(self.heap);
        let found = found?;
        let present = found.is_some();
        found.drop_with_heap(self.heap);
        Ok(Value::Bool(present))
    }
}
