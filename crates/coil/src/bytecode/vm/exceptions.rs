//! Raising: normalizing errors into heap exceptions, traceback capture, `RaiseVarargs`,
//! and converting an escaped exception for the host.

use super::{Reason, Step, VM};
use crate::{
    exception_private::{ExcInfo, ExcType, RunError, RunResult, SimpleException},
    exception_public::{Exception, StackFrame},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    runtime::{info_matches, is_subtype},
    tracer::VmTracer,
    types::{Instance, Int, Layout, Traceback},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Parks a handler error in the exception cell.
    ///
    /// Returns the error back when no handler may see it (internal errors and limit
    /// violations), in which case execution must stop.
    pub(super) fn raise_error(&mut self, err: RunError) -> Result<(), RunError> {
        let mut info = match err {
            RunError::Internal(_) | RunError::Uncatchable(_) => return Err(err),
            RunError::Exc(simple) => self.normalize_simple(&simple),
            RunError::Raised(info) => *info,
        };
        self.add_traceback(&mut info);
        let name = match info.kind.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Type(t)) => t.name.clone(),
            _ => String::new(),
        };
        self.tracer.on_exception_raised(&name, self.frames.len());
        self.rt.raise(self.heap, info);
        Ok(())
    }

    /// Builds the heap triple for an exception created by Rust code.
    ///
    /// MemoryError always uses the pre-built instance, and so does a bare StopIteration;
    /// if allocating the instance fails the MemoryError singleton is reported instead.
    fn normalize_simple(&mut self, simple: &SimpleException) -> ExcInfo {
        match (simple.exc_type(), simple.arg()) {
            (ExcType::MemoryError, _) => return self.rt.memory_error_info(self.heap),
            (ExcType::StopIteration, None) => return self.rt.stop_iteration_info(self.heap),
            _ => {}
        }
        let args = match simple.arg() {
            Some(msg) => match self.heap.alloc_str(msg) {
                Ok(msg) => vec![msg],
                Err(_) => return self.rt.memory_error_info(self.heap),
            },
            None => Vec::new(),
        };
        match self.new_exception(simple.exc_type(), args) {
            Ok(info) => info,
            Err(err) => {
                err.drop_with_heap(self.heap);
                self.rt.memory_error_info(self.heap)
            }
        }
    }

    /// Allocates an instance of a builtin exception type with the given `args`.
    pub(crate) fn new_exception(&mut self, exc_type: ExcType, args: Vec<Value>) -> RunResult<ExcInfo> {
        let kind = self.rt.exc_type(exc_type);
        let value = self.instantiate_exception(kind, args)?;
        self.heap.inc_ref(kind);
        Ok(ExcInfo {
            kind: Value::Ref(kind),
            value,
            traceback: Value::None,
        })
    }

    /// Allocates an instance of any exception class, without running `__init__`.
    pub(crate) fn instantiate_exception(&mut self, class: HeapId, args: Vec<Value>) -> RunResult<Value> {
        let args = self.heap.alloc_tuple(args)?;
        let id = match Instance::allocate(self.heap, class) {
            Ok(id) => id,
            Err(err) => {
                args.drop_with_heap(self.heap);
                return Err(err.into());
            }
        };
        self.set_exception_args(id, args);
        Ok(Value::Ref(id))
    }

    /// Replaces an exception instance's `args` tuple.
    pub(crate) fn set_exception_args(&mut self, id: HeapId, args: Value) {
        let old = match self.heap.get_mut(id) {
            HeapData::Instance(inst) => inst.args.replace(args),
            _ => Some(args),
        };
        old.drop_with_heap(self.heap);
    }

    /// `KeyError(key)`, carrying the key object itself.
    pub(crate) fn key_error(&mut self, key: &Value) -> RunError {
        let key = key.clone_with_heap(self.heap);
        match self.new_exception(ExcType::KeyError, vec![key]) {
            Ok(info) => info.into(),
            Err(err) => err,
        }
    }

    /// Whether `err` is an exception of `exc_type` or a subclass.
    pub(crate) fn error_matches(&self, err: &RunError, exc_type: ExcType) -> bool {
        match err {
            RunError::Exc(simple) => simple.exc_type().is_subclass_of(exc_type),
            RunError::Raised(info) => info_matches(self.heap, info, self.rt.exc_type(exc_type)),
            RunError::Internal(_) | RunError::Uncatchable(_) => false,
        }
    }

    /// Prepends the current frame's position to the exception's traceback chain.
    ///
    /// Best effort: if the entry cannot be allocated the chain stays as it was.
    pub(super) fn add_traceback(&mut self, info: &mut ExcInfo) {
        let Some(frame) = self.frames.last() else {
            return;
        };
        let next = info.traceback.ref_id();
        let entry = Traceback {
            name: frame.code.name().to_owned(),
            filename: frame.code.filename().to_owned(),
            line: frame.code.line_for(frame.last_ip),
            ip: frame.last_ip,
            next,
        };
        if let Some(next) = next {
            // the new entry owns a reference to the rest of the chain
            self.heap.inc_ref(next);
        }
        if let Ok(id) = self.heap.allocate(HeapData::Traceback(entry)) {
            let old = std::mem::replace(&mut info.traceback, Value::Ref(id));
            old.drop_with_heap(self.heap);
        }
    }

    // ========================================================================
    // RaiseVarargs
    // ========================================================================

    /// `raise` with 0 to 3 operands.
    ///
    /// A bare `raise` re-raises the exception being handled as is, without adding a
    /// traceback entry for the re-raise.
    pub(super) fn raise_varargs(&mut self, argc: usize) -> RunResult<Step> {
        if argc == 0 {
            let Some(handled) = self.current_handled() else {
                return Err(ExcType::value_error("cannot reraise if no exception has been raised"));
            };
            self.rt.restore(self.heap, Some(handled));
            return Ok(Step::Unwind(Reason::Error));
        }
        if argc > 3 {
            return Err(ExcType::system_error("bad RAISE_VARARGS oparg"));
        }
        let mut parts = self.pop_n(argc)?.into_iter();
        let kind = parts.next().unwrap_or(Value::None);
        let value = parts.next().unwrap_or(Value::None);
        let traceback = parts.next().unwrap_or(Value::None);
        if !traceback.is_none() && !matches!(traceback.ref_id().map(|id| self.heap.get(id)), Some(HeapData::Traceback(_)))
        {
            (kind, value, traceback).drop_with_heap(self.heap);
            return Err(ExcType::type_error("raise: arg 3 must be a traceback or None"));
        }
        match self.normalize_raise(kind, value) {
            Ok((kind, value)) => Err(ExcInfo { kind, value, traceback }.into()),
            Err(err) => {
                traceback.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    /// Turns `raise kind, value` into a type and an instance of it.
    fn normalize_raise(&mut self, kind: Value, value: Value) -> RunResult<(Value, Value)> {
        let base_exception = self.rt.exc_type(ExcType::BaseException);
        if let Some(class) = kind.ref_id().filter(|id| self.is_exception_class(*id, base_exception)) {
            if !value.is_none() && self.isinstance(&value, class) {
                return Ok((kind, value));
            }
            let args = if value.is_none() {
                value.drop_with_heap(self.heap);
                Vec::new()
            } else if let Some(items) = self.heap.clone_sequence_items(&value).filter(|_| self.is_tuple(&value)) {
                value.drop_with_heap(self.heap);
                items
            } else {
                vec![value]
            };
            let result = self.call_sync(&kind, crate::args::ArgValues::new(args));
            return match result {
                Ok(instance) if self.isinstance(&instance, base_exception) => {
                    let actual = self.type_of(&instance);
                    kind.drop_with_heap(self.heap);
                    self.heap.inc_ref(actual);
                    Ok((Value::Ref(actual), instance))
                }
                Ok(other) => {
                    let type_name = self.type_name(&other);
                    (kind, other).drop_with_heap(self.heap);
                    Err(ExcType::type_error(format!(
                        "calling exception class returned an instance of '{type_name}'"
                    )))
                }
                Err(err) => {
                    kind.drop_with_heap(self.heap);
                    Err(err)
                }
            };
        }
        if self.isinstance(&kind, base_exception) {
            if !value.is_none() {
                (kind, value).drop_with_heap(self.heap);
                return Err(ExcType::type_error("instance exception may not have a separate value"));
            }
            let class = self.type_of(&kind);
            self.heap.inc_ref(class);
            return Ok((Value::Ref(class), kind));
        }
        let type_name = self.type_name(&kind);
        (kind, value).drop_with_heap(self.heap);
        Err(ExcType::type_error(format!(
            "exceptions must be old-style classes or derived from BaseException, not {type_name}"
        )))
    }

    fn is_exception_class(&self, id: HeapId, base_exception: HeapId) -> bool {
        matches!(self.heap.get(id), HeapData::Type(_)) && is_subtype(self.heap, id, base_exception)
    }

    pub(crate) fn is_tuple(&self, value: &Value) -> bool {
        matches!(value.ref_id().map(|id| self.heap.get(id)), Some(HeapData::Tuple(_)))
    }

    // ========================================================================
    // Exception object attributes
    // ========================================================================

    /// Borrowed `args` of an exception instance.
    pub(crate) fn exception_args(&self, value: &Value) -> &[Value] {
        match value.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Instance(inst)) => inst.args.as_ref().and_then(|a| self.heap.sequence_items(a)),
            _ => None,
        }
        .unwrap_or_default()
    }

    /// The builtin exception type an exception value's class is or derives from.
    pub(crate) fn builtin_exc_type(&self, value: &Value) -> Option<ExcType> {
        match self.heap.get(self.type_of(value)) {
            HeapData::Type(t) if t.layout == Layout::Exception => t.exc_type,
            _ => None,
        }
    }

    /// Computed attributes of exception instances: `args`, `message`, and `errno`,
    /// `strerror`, `filename` on environment errors. `Ok(None)` when `name` is none of them.
    pub(crate) fn exception_attr(&mut self, this: &Value, name: &str) -> RunResult<Option<Value>> {
        let environment = self.builtin_exc_type(this).is_some_and(ExcType::is_environment_error);
        let args = self.exception_args(this);
        let picked = match name {
            "args" => {
                let tuple = match this.ref_id().map(|id| self.heap.get(id)) {
                    Some(HeapData::Instance(inst)) => inst.args.as_ref().map(|a| a.clone_with_heap(self.heap)),
                    _ => None,
                };
                return match tuple {
                    Some(tuple) => Ok(Some(tuple)),
                    None => Ok(Some(self.heap.alloc_tuple(Vec::new())?)),
                };
            }
            "message" => match args {
                [single] => single.clone_with_heap(self.heap),
                _ => return Ok(Some(self.heap.alloc_str("")?)),
            },
            "errno" if environment => env_field(args, 0).map_or(Value::None, |v| v.clone_with_heap(self.heap)),
            "strerror" if environment => env_field(args, 1).map_or(Value::None, |v| v.clone_with_heap(self.heap)),
            "filename" if environment => match args {
                [_, _, filename] => filename.clone_with_heap(self.heap),
                _ => Value::None,
            },
            _ => return Ok(None),
        };
        Ok(Some(picked))
    }

    /// `str()` of an exception: empty, the single argument, the environment error form,
    /// or the repr of the args tuple.
    pub(crate) fn exception_text(&mut self, this: &Value) -> RunResult<String> {
        let builtin = self.builtin_exc_type(this);
        let environment = builtin.is_some_and(ExcType::is_environment_error);
        // a lone key is shown as its repr, so `KeyError('')` is not blank
        let key_error = builtin.is_some_and(|t| t.is_subclass_of(ExcType::KeyError));
        let args: Vec<Value> = self
            .exception_args(this)
            .iter()
            .map(|v| v.clone_with_heap(self.heap))
            .collect();
        let text = match args.as_slice() {
            [] => Ok(String::new()),
            [single] if key_error => self.repr(single),
            [single] => self.str_text_of(single),
            [errno, strerror] if environment => self.str_text_of(errno).and_then(|errno| {
                self.str_text_of(strerror)
                    .map(|strerror| format!("[Errno {errno}] {strerror}"))
            }),
            [errno, strerror, filename] if environment => self.str_text_of(errno).and_then(|errno| {
                let strerror = self.str_text_of(strerror)?;
                let filename = self.repr(filename)?;
                Ok(format!("[Errno {errno}] {strerror}: {filename}"))
            }),
            _ => {
                let items = args.iter().map(|v| v.clone_with_heap(self.heap)).collect();
                let tuple = self.heap.alloc_tuple(items)?;
                let text = self.repr(&tuple);
                tuple.drop_with_heap(self.heap);
                text
            }
        };
        args.drop_with_heap(self.heap);
        text
    }

    // ========================================================================
    // Host conversion
    // ========================================================================

    /// Detaches an exception that escaped every frame from the heap.
    ///
    /// MemoryError is reported without formatting its instance, so it needs no memory.
    pub(crate) fn into_public_exception(&mut self, info: ExcInfo) -> Exception {
        let type_name = match info.kind.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Type(t)) => t.name.clone(),
            _ => self.type_name(&info.value),
        };
        let builtin = self.builtin_exc_type(&info.value);
        let traceback = self.traceback_frames(&info.traceback);
        if builtin.is_some_and(|t| t.is_subclass_of(ExcType::MemoryError)) {
            info.drop_with_heap(self.heap);
            return Exception::from_parts(type_name, builtin, None, traceback, None);
        }
        let exit_code = if builtin.is_some_and(|t| t.is_subclass_of(ExcType::SystemExit)) {
            Some(match self.exception_args(&info.value) {
                [] | [Value::None] => 0,
                [code] => Int::from_value(code, self.heap).map_or(1, |c| i32::try_from(c.saturating_i64()).unwrap_or(1)),
                _ => 1,
            })
        } else {
            None
        };
        let message = if builtin.is_some() {
            self.exception_text(&info.value)
        } else {
            self.str_text_of(&info.value)
        };
        let message = match message {
            Ok(message) => Some(message),
            Err(err) => {
                err.drop_with_heap(self.heap);
                None
            }
        };
        // whatever `__str__` raised is not part of the report
        let stray = self.rt.fetch();
        stray.drop_with_heap(self.heap);
        info.drop_with_heap(self.heap);
        Exception::from_parts(type_name, builtin, message, traceback, exit_code)
    }

    /// Walks a traceback chain, outermost frame first.
    fn traceback_frames(&self, traceback: &Value) -> Vec<StackFrame> {
        let mut frames = Vec::new();
        let mut current = traceback.ref_id();
        while let Some(id) = current {
            let Some(HeapData::Traceback(tb)) = self.heap.get_if_live(id) else {
                break;
            };
            frames.push(StackFrame {
                filename: tb.filename.clone(),
                name: tb.name.clone(),
                line: tb.line,
                ip: tb.ip,
            });
            current = tb.next;
        }
        frames
    }
}

/// `errno`/`strerror` exist once the exception has at least two args.
fn env_field(args: &[Value], index: usize) -> Option<&Value> {
    if args.len() >= 2 { args.get(index) } else { None }
}
