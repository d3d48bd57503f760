//! Calling: the `CallFunction*` opcodes, callable dispatch, type calls and class creation.

use super::{Step, VM};
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunError, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    runtime::is_subtype,
    tracer::VmTracer,
    types::{Instance, Layout, Method, TypeObject},
    value::Value,
};

/// What calling a value produced.
#[derive(Debug)]
pub(crate) enum CallOutcome {
    /// A native ran to completion.
    Value(Value),
    /// An interpreted function's frame is now on top; its return value will be pushed
    /// onto the caller's stack when it finishes.
    FramePushed,
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `CallFunction` and its `Var`/`Kw`/`VarKw` variants.
    ///
    /// Stack, bottom to top: callable, positionals, keyword name/value pairs, then the
    /// `*args` sequence and the `**kwargs` dict when the variant has them.
    pub(super) fn call_function_op(&mut self, arg: u32, has_var: bool, has_kw: bool) -> RunResult<Step> {
        let positional = (arg & 0xFF) as usize;
        let keywords = ((arg >> 8) & 0xFF) as usize;
        let total = 1 + positional + 2 * keywords + usize::from(has_var) + usize::from(has_kw);
        let mut items = self.pop_n(total)?.into_iter();
        let Some(callable) = items.next() else {
            return Err(RunError::internal("call without a callable"));
        };
        let args_vec: Vec<Value> = items.by_ref().take(positional).collect();
        let mut args = ArgValues::new(args_vec);
        let mut pairs: Vec<Value> = items.collect();
        let kw_dict = if has_kw { pairs.pop() } else { None };
        let star = if has_var { pairs.pop() } else { None };
        let result = self
            .gather_keywords(&callable, &mut args, &mut pairs)
            .and_then(|()| match &star {
                Some(star) => self.gather_star(&callable, &mut args, star),
                None => Ok(()),
            })
            .and_then(|()| match &kw_dict {
                Some(kw_dict) => self.gather_kw_dict(&callable, &mut args, kw_dict),
                None => Ok(()),
            });
        (star, kw_dict, pairs).drop_with_heap(self.heap);
        if let Err(err) = result {
            (callable, args).drop_with_heap(self.heap);
            return Err(err);
        }
        let outcome = self.call_value(&callable, args);
        callable.drop_with_heap(self.heap);
        match outcome? {
            CallOutcome::Value(value) => Ok(Step::Push(value)),
            CallOutcome::FramePushed => Ok(Step::Next),
        }
    }

    /// Moves explicit `name=value` pairs into `args.kwargs`.
    fn gather_keywords(&mut self, callable: &Value, args: &mut ArgValues, pairs: &mut Vec<Value>) -> RunResult<()> {
        let mut drained = std::mem::take(pairs).into_iter();
        while let (Some(key), Some(value)) = (drained.next(), drained.next()) {
            let Some(name) = self.heap.str_text(&key) else {
                (key, value).drop_with_heap(self.heap);
                drained.drop_with_heap(self.heap);
                return Err(ExcType::type_error(format!(
                    "{} keywords must be strings",
                    self.callable_name(callable)
                )));
            };
            key.drop_with_heap(self.heap);
            args.kwargs.push((name, value));
        }
        Ok(())
    }

    fn gather_star(&mut self, callable: &Value, args: &mut ArgValues, star: &Value) -> RunResult<()> {
        match self.collect(star) {
            Ok(items) => {
                args.args.extend(items);
                Ok(())
            }
            Err(err) if self.error_matches(&err, ExcType::TypeError) => {
                err.drop_with_heap(self.heap);
                Err(ExcType::type_error(format!(
                    "{} argument after * must be a sequence, not {}",
                    self.callable_name(callable),
                    self.type_name(star)
                )))
            }
            Err(err) => Err(err),
        }
    }

    fn gather_kw_dict(&mut self, callable: &Value, args: &mut ArgValues, kw_dict: &Value) -> RunResult<()> {
        let entries: Vec<(Value, Value)> = match kw_dict.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Dict(dict)) => dict
                .iter()
                .map(|e| (e.key.clone_with_heap(self.heap), e.value.clone_with_heap(self.heap)))
                .collect(),
            _ => {
                return Err(ExcType::type_error(format!(
                    "{} argument after ** must be a mapping, not {}",
                    self.callable_name(callable),
                    self.type_name(kw_dict)
                )));
            }
        };
        let mut entries = entries.into_iter();
        while let Some((key, value)) = entries.next() {
            let name = self.heap.str_text(&key);
            key.drop_with_heap(self.heap);
            let error = match name {
                None => Some(format!("{} keywords must be strings", self.callable_name(callable))),
                Some(name) if args.kwargs.iter().any(|(k, _)| *k == name) => Some(format!(
                    "{} got multiple values for keyword argument '{name}'",
                    self.callable_name(callable)
                )),
                Some(name) => {
                    args.kwargs.push((name, value));
                    continue;
                }
            };
            value.drop_with_heap(self.heap);
            for (k, v) in entries {
                (k, v).drop_with_heap(self.heap);
            }
            return Err(ExcType::type_error(error.unwrap_or_default()));
        }
        Ok(())
    }

    /// `f()` style name of a callable for argument errors.
    fn callable_name(&self, callable: &Value) -> String {
        let name = match callable.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Function(f)) => f.name.clone(),
            Some(HeapData::Native(n)) => n.name.to_owned(),
            Some(HeapData::Method(m)) => return self.callable_name(&m.func),
            Some(HeapData::Type(t)) => t.name.clone(),
            _ => return format!("{} object", self.type_name(callable)),
        };
        format!("{name}()")
    }

    // ========================================================================
    // Dispatch on the callable
    // ========================================================================

    /// Calls `callable`; interpreted functions get a frame instead of running here.
    pub(crate) fn call_value(&mut self, callable: &Value, args: ArgValues) -> RunResult<CallOutcome> {
        let Value::Ref(id) = callable else {
            args.drop_with_heap(self.heap);
            return Err(ExcType::type_error_not_callable(&self.type_name(callable)));
        };
        let id = *id;
        match self.heap.get(id) {
            HeapData::Function(_) => {
                self.push_function_frame(id, args)?;
                Ok(CallOutcome::FramePushed)
            }
            HeapData::Native(native) => {
                let native_id = native.id;
                self.call_native(native_id, None, args).map(CallOutcome::Value)
            }
            HeapData::Method(method) => {
                let owner = method.owner;
                let func = method.func.clone_with_heap(self.heap);
                let bound_self = method.bound_self.as_ref().map(|v| v.clone_with_heap(self.heap));
                let result = self.call_method_object(owner, &func, bound_self, args);
                func.drop_with_heap(self.heap);
                result
            }
            HeapData::Type(_) => self.call_type(id, args).map(CallOutcome::Value),
            HeapData::Instance(inst) => {
                let class = inst.class;
                match self.lookup_type_attr(class, "__call__") {
                    Some(call) => {
                        let this = callable.clone_with_heap(self.heap);
                        let result = self.call_bound(&call, this, args);
                        call.drop_with_heap(self.heap);
                        result
                    }
                    None => {
                        args.drop_with_heap(self.heap);
                        Err(ExcType::type_error_not_callable(&self.type_name(callable)))
                    }
                }
            }
            _ => {
                args.drop_with_heap(self.heap);
                Err(ExcType::type_error_not_callable(&self.type_name(callable)))
            }
        }
    }

    fn call_method_object(
        &mut self,
        owner: HeapId,
        func: &Value,
        bound_self: Option<Value>,
        args: ArgValues,
    ) -> RunResult<CallOutcome> {
        if let Some(this) = bound_self {
            return self.call_bound(func, this, args);
        }
        let got = match args.args.first() {
            Some(first) if self.isinstance(first, owner) => None,
            Some(first) => Some(format!("{} instance", self.type_name(first))),
            None => Some("nothing".to_owned()),
        };
        if let Some(got) = got {
            args.drop_with_heap(self.heap);
            let name = match func.ref_id().map(|id| self.heap.get(id)) {
                Some(HeapData::Function(f)) => f.name.clone(),
                Some(HeapData::Native(n)) => n.name.to_owned(),
                _ => "?".to_owned(),
            };
            return Err(ExcType::type_error(format!(
                "unbound method {name}() must be called with {} instance as first argument (got {got} instead)",
                self.type_id_name(owner)
            )));
        }
        self.call_value(func, args)
    }

    /// Calls `func` with `this` bound as its first argument. Natives receive `this`
    /// through the side channel rather than in `args`.
    pub(crate) fn call_bound(&mut self, func: &Value, this: Value, args: ArgValues) -> RunResult<CallOutcome> {
        if let Some(HeapData::Native(native)) = func.ref_id().map(|id| self.heap.get(id)) {
            let native_id = native.id;
            return self.call_native(native_id, Some(this), args).map(CallOutcome::Value);
        }
        let mut args = args;
        args.prepend(this);
        self.call_value(func, args)
    }

    /// Calls a value and runs any frame it pushed to completion.
    pub(crate) fn call_sync(&mut self, callable: &Value, args: ArgValues) -> RunResult<Value> {
        let outcome = self.call_value(callable, args);
        self.finish_call(outcome)
    }

    /// Runs a pushed frame to completion, so native code sees a plain value.
    pub(crate) fn finish_call(&mut self, outcome: RunResult<CallOutcome>) -> RunResult<Value> {
        match outcome? {
            CallOutcome::Value(value) => Ok(value),
            CallOutcome::FramePushed => self.run_frames(self.frames.len() - 1),
        }
    }

    /// Calls the special method `name` found on the type of `obj`, with `obj` bound.
    ///
    /// `Ok(None)` when the type has no such method. Lookup skips the instance dict, as
    /// special method lookup does for new-style classes.
    pub(crate) fn call_method(&mut self, obj: &Value, name: &str, args: ArgValues) -> RunResult<Option<Value>> {
        let Some(method) = self.lookup_type_attr(self.type_of(obj), name) else {
            args.drop_with_heap(self.heap);
            return Ok(None);
        };
        let this = obj.clone_with_heap(self.heap);
        let outcome = self.call_bound(&method, this, args);
        method.drop_with_heap(self.heap);
        self.finish_call(outcome).map(Some)
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// Calling a type: `type(x)`, `type(name, bases, dict)`, or instance creation through
    /// `__new__` and `__init__`.
    fn call_type(&mut self, type_id: HeapId, args: ArgValues) -> RunResult<Value> {
        if type_id == self.rt.types.type_ {
            return self.call_type_type(args);
        }
        let init_args = ArgValues {
            args: args.args.iter().map(|v| v.clone_with_heap(self.heap)).collect(),
            kwargs: args
                .kwargs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone_with_heap(self.heap)))
                .collect(),
        };
        let created = match self.lookup_type_attr(type_id, "__new__") {
            Some(new) => {
                self.heap.inc_ref(type_id);
                let outcome = self.call_bound(&new, Value::Ref(type_id), args);
                let result = self.finish_call(outcome);
                new.drop_with_heap(self.heap);
                result
            }
            None => {
                args.drop_with_heap(self.heap);
                self.allocate_instance(type_id)
            }
        };
        let instance = match created {
            Ok(instance) => instance,
            Err(err) => {
                init_args.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        if !self.is_instance_value(&instance) || !self.isinstance(&instance, type_id) {
            init_args.drop_with_heap(self.heap);
            return Ok(instance);
        }
        match self.run_init(type_id, &instance, init_args) {
            Ok(()) => Ok(instance),
            Err(err) => {
                instance.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    fn allocate_instance(&mut self, type_id: HeapId) -> RunResult<Value> {
        match self.heap.get(type_id) {
            HeapData::Type(t) if t.layout == Layout::Builtin => Err(ExcType::type_error(format!(
                "cannot create '{}' instances",
                t.name
            ))),
            _ => Ok(Value::Ref(Instance::allocate(self.heap, type_id)?)),
        }
    }

    fn run_init(&mut self, type_id: HeapId, instance: &Value, args: ArgValues) -> RunResult<()> {
        let Some(init) = self.lookup_type_attr(type_id, "__init__") else {
            args.drop_with_heap(self.heap);
            return Ok(());
        };
        let this = instance.clone_with_heap(self.heap);
        let outcome = self.call_bound(&init, this, args);
        let result = self.finish_call(outcome);
        init.drop_with_heap(self.heap);
        match result? {
            Value::None => Ok(()),
            other => {
                let type_name = self.type_name(&other);
                other.drop_with_heap(self.heap);
                Err(ExcType::type_error(format!(
                    "__init__() should return None, not '{type_name}'"
                )))
            }
        }
    }

    fn call_type_type(&mut self, args: ArgValues) -> RunResult<Value> {
        let mut args = args.check_no_kwargs("type", self.heap)?;
        match args.len() {
            1 => {
                let value = args.remove(0);
                let type_id = self.type_of(&value);
                value.drop_with_heap(self.heap);
                self.heap.inc_ref(type_id);
                Ok(Value::Ref(type_id))
            }
            3 => {
                let mut args = args.into_iter();
                let (Some(name), Some(bases), Some(body)) = (args.next(), args.next(), args.next()) else {
                    unreachable!("length checked above")
                };
                let result = self.build_class(&name, &bases, &body);
                (name, bases, body).drop_with_heap(self.heap);
                result
            }
            _ => {
                args.drop_with_heap(self.heap);
                Err(ExcType::type_error("type() takes 1 or 3 arguments"))
            }
        }
    }

    /// Creates a class from its name, a tuple of at most one base, and the namespace
    /// its body produced.
    pub(super) fn build_class(&mut self, name: &Value, bases: &Value, body: &Value) -> RunResult<Value> {
        let Some(class_name) = self.heap.str_text(name) else {
            return Err(ExcType::type_error("type() argument 1 must be string"));
        };
        let base = match self.heap.sequence_items(bases) {
            Some([]) => self.rt.types.object,
            Some([base]) => match base.ref_id().map(|id| (id, self.heap.get(id))) {
                Some((id, HeapData::Type(t))) if t.layout != Layout::Builtin => id,
                Some((_, HeapData::Type(t))) => {
                    return Err(ExcType::type_error(format!(
                        "type '{}' is not an acceptable base type",
                        t.name
                    )));
                }
                _ => {
                    return Err(ExcType::type_error(format!(
                        "class base must be a type, not {}",
                        self.type_name(base)
                    )));
                }
            },
            Some(_) => return Err(ExcType::type_error("multiple inheritance is not supported")),
            None => return Err(ExcType::type_error("bases must be a tuple")),
        };
        let Some(body_id) = body
            .ref_id()
            .filter(|id| matches!(self.heap.get(*id), HeapData::Dict(_)))
        else {
            return Err(ExcType::type_error("type() argument 3 must be dict"));
        };
        let own_slots = self.class_slots(body_id)?;

        let dict = self.heap.alloc_dict()?;
        let filled = self
            .heap
            .dict_merge_builtin(dict, body_id, true)
            .and_then(|()| self.heap.alloc_str(&class_name))
            .and_then(|n| self.heap.dict_set_str(dict, "__name__", n));
        let base_dict = self.type_dict(base);
        let merged = filled.and_then(|()| match base_dict {
            Some(base_dict) => self.heap.dict_merge_builtin(dict, base_dict, false),
            None => Ok(()),
        });
        if let Err(err) = merged {
            self.heap.dec_ref(dict);
            return Err(err.into());
        }

        let HeapData::Type(base_type) = self.heap.get(base) else {
            self.heap.dec_ref(dict);
            return Err(RunError::internal("class base vanished"));
        };
        let (has_dict, slot_names) = match own_slots {
            Some(own) => {
                let mut names = base_type.slot_names.clone();
                names.extend(own);
                (base_type.has_dict, names)
            }
            None => (true, base_type.slot_names.clone()),
        };
        let class = TypeObject {
            name: class_name,
            base: Some(base),
            layout: base_type.layout,
            has_dict,
            slot_names,
            dict,
            exc_type: base_type.exc_type,
            heap_type: true,
        };
        self.heap.inc_ref(base);
        Ok(Value::Ref(self.heap.allocate(HeapData::Type(class))?))
    }

    /// Reads `__slots__` from a class body: a string or a tuple/list of strings.
    fn class_slots(&self, body_id: HeapId) -> RunResult<Option<Vec<String>>> {
        let Some(slots) = self.heap.dict_get_str(body_id, "__slots__") else {
            return Ok(None);
        };
        if let Some(name) = self.heap.str_text(slots) {
            return Ok(Some(vec![name]));
        }
        let Some(items) = self.heap.sequence_items(slots) else {
            return Err(ExcType::type_error("__slots__ must be a string or a sequence of strings"));
        };
        items
            .iter()
            .map(|item| {
                self.heap.str_text(item).ok_or_else(|| {
                    ExcType::type_error(format!(
                        "__slots__ items must be strings, not '{}'",
                        self.type_name(item)
                    ))
                })
            })
            .collect::<RunResult<Vec<_>>>()
            .map(Some)
    }

    /// Wraps a function found in a type dict as a method.
    pub(crate) fn make_method(&mut self, owner: HeapId, func: Value, bound_self: Option<Value>) -> RunResult<Value> {
        self.heap.inc_ref(owner);
        let id = self.heap.allocate(HeapData::Method(Method {
            owner,
            func,
            bound_self,
        }))?;
        Ok(Value::Ref(id))
    }

    /// Whether `value` is a function or native that attribute lookup turns into a method.
    pub(crate) fn is_method_like(&self, value: &Value) -> bool {
        matches!(
            value.ref_id().map(|id| self.heap.get(id)),
            Some(HeapData::Function(_) | HeapData::Native(_))
        )
    }

    /// `issubclass` over type objects.
    pub(crate) fn is_subclass(&self, sub: HeapId, sup: HeapId) -> bool {
        is_subtype(self.heap, sub, sup)
    }
}
