//! Activation records and argument binding.

use std::rc::Rc;

use smallvec::SmallVec;

use super::VM;
use crate::{
    args::ArgValues,
    bytecode::Code,
    exception_private::{ExcInfo, ExcType, RunError, RunResult},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Loop,
    Except,
    Finally,
}

/// An entry of a frame's block stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Block {
    pub kind: BlockKind,
    /// Where unwinding resumes: the loop exit, or the except/finally handler.
    pub handler: usize,
    /// Operand stack depth when the block was set up.
    pub level: usize,
}

/// One activation of a code object.
///
/// Every heap id and value here is an owned reference, released by [`Frame::release`].
#[derive(Debug)]
pub(crate) struct Frame {
    pub code: Rc<Code>,
    /// The `CodeObject` holding the materialized constants.
    pub code_obj: HeapId,
    pub globals: HeapId,
    /// A fresh dict for `NEWLOCALS` code, otherwise the globals dict again.
    pub locals: HeapId,
    /// Fast locals, indexed like `Code::varnames`.
    pub fast: Vec<Option<Value>>,
    pub ip: usize,
    /// Offset of the instruction being executed, for tracebacks.
    pub last_ip: usize,
    pub stack: Vec<Value>,
    pub blocks: SmallVec<[Block; 8]>,
    /// The exception being handled, re-raised by a bare `raise`.
    pub handled: Option<ExcInfo>,
}

impl Frame {
    /// Takes ownership of one reference to each id.
    pub fn new(code: Rc<Code>, code_obj: HeapId, globals: HeapId, locals: HeapId) -> Self {
        let fast = (0..code.varnames().len()).map(|_| None).collect();
        let stack = Vec::with_capacity(code.stack_size());
        Self {
            code,
            code_obj,
            globals,
            locals,
            fast,
            ip: 0,
            last_ip: 0,
            stack,
            blocks: SmallVec::new(),
            handled: None,
        }
    }

    pub fn release(self, heap: &mut Heap<impl ResourceTracker>) {
        self.stack.drop_with_heap(heap);
        for value in self.fast.into_iter().flatten() {
            value.drop_with_heap(heap);
        }
        self.handled.drop_with_heap(heap);
        heap.dec_ref(self.code_obj);
        heap.dec_ref(self.globals);
        heap.dec_ref(self.locals);
    }

    /// Pops blocks' worth of operand stack down to `level`.
    pub fn truncate_stack(&mut self, level: usize, heap: &mut Heap<impl ResourceTracker>) {
        while self.stack.len() > level {
            if let Some(value) = self.stack.pop() {
                value.drop_with_heap(heap);
            }
        }
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Pushes a frame for an interpreted function, with its arguments bound.
    pub(crate) fn push_function_frame(&mut self, func_id: HeapId, args: ArgValues) -> RunResult<()> {
        let HeapData::Function(func) = self.heap.get(func_id) else {
            args.drop_with_heap(self.heap);
            return Err(RunError::internal("push_function_frame: not a function"));
        };
        let (name, code_obj, globals) = (func.name.clone(), func.code, func.globals);
        let defaults: Vec<Value> = func.defaults.iter().map(|v| v.clone_with_heap(self.heap)).collect();
        let code = match self.heap.get(code_obj) {
            HeapData::Code(c) => Rc::clone(&c.code),
            _ => {
                (args, defaults).drop_with_heap(self.heap);
                return Err(RunError::internal("function without a code object"));
            }
        };
        if code.has_flag(Code::GENERATOR) {
            (args, defaults).drop_with_heap(self.heap);
            return Err(ExcType::system_error(format!(
                "generator function '{name}' cannot be executed"
            )));
        }
        if let Err(err) = self.heap.tracker().check_recursion_depth(self.frames.len()) {
            (args, defaults).drop_with_heap(self.heap);
            return Err(err.into());
        }
        let locals = if code.has_flag(Code::NEWLOCALS) {
            match self.heap.alloc_dict() {
                Ok(dict) => dict,
                Err(err) => {
                    (args, defaults).drop_with_heap(self.heap);
                    return Err(err.into());
                }
            }
        } else {
            self.heap.inc_ref(globals);
            globals
        };
        self.heap.inc_ref(code_obj);
        self.heap.inc_ref(globals);
        let mut frame = Frame::new(code, code_obj, globals, locals);
        if let Err(err) = self.apply_args(&mut frame, &name, args, defaults) {
            frame.release(self.heap);
            return Err(err);
        }
        frame.handled = self.current_handled();
        self.frames.push(frame);
        self.tracer.on_call(&name, self.frames.len());
        Ok(())
    }

    /// A copy of the exception the innermost frame is handling.
    pub(super) fn current_handled(&self) -> Option<ExcInfo> {
        self.frames
            .last()
            .and_then(|f| f.handled.as_ref())
            .map(|info| info.clone_with_heap(self.heap))
    }

    /// Binds call arguments to the frame's fast locals.
    ///
    /// Positionals fill the declared slots in order, keywords fill slots by name, and
    /// defaults fill the trailing slots still empty. Surplus positionals and keywords go
    /// to the `*args` tuple and `**kwargs` dict when the code declares them.
    fn apply_args(&mut self, frame: &mut Frame, name: &str, args: ArgValues, defaults: Vec<Value>) -> RunResult<()> {
        let code = Rc::clone(&frame.code);
        let argc = code.arg_count();
        let has_varargs = code.has_flag(Code::VARARGS);
        let has_varkw = code.has_flag(Code::VARKEYWORDS);
        let ArgValues { args, kwargs } = args;
        let given = args.len() + kwargs.len();
        let positional = args.len();
        let defcount = defaults.len();

        if defcount > argc {
            (args, kwargs, defaults).drop_with_heap(self.heap);
            return Err(ExcType::system_error(format!(
                "{name}() has {defcount} defaults for {argc} argument{}",
                plural(argc)
            )));
        }
        if positional > argc && !has_varargs {
            (args, kwargs, defaults).drop_with_heap(self.heap);
            return Err(ExcType::type_error(format!(
                "{name}() takes {} {argc} argument{} ({given} given)",
                if defcount > 0 { "at most" } else { "exactly" },
                plural(argc),
            )));
        }

        let mut args = args.into_iter();
        for slot in frame.fast.iter_mut().take(argc.min(positional)) {
            *slot = args.next();
        }
        if has_varargs {
            let rest: Vec<Value> = args.collect();
            let tuple = match self.heap.alloc_tuple(rest) {
                Ok(t) => t,
                Err(err) => {
                    (kwargs, defaults).drop_with_heap(self.heap);
                    return Err(err.into());
                }
            };
            frame.fast[argc] = Some(tuple);
        } else {
            args.drop_with_heap(self.heap);
        }

        let kw_dict = if has_varkw {
            match self.heap.alloc_dict() {
                Ok(dict) => {
                    frame.fast[argc + usize::from(has_varargs)] = Some(Value::Ref(dict));
                    Some(dict)
                }
                Err(err) => {
                    (kwargs, defaults).drop_with_heap(self.heap);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let mut unexpected: Vec<String> = Vec::new();
        let mut kwargs = kwargs.into_iter();
        while let Some((key, value)) = kwargs.next() {
            let index = code.varnames()[..argc].iter().position(|v| *v == key);
            let result = match (index, kw_dict) {
                (Some(i), _) if frame.fast[i].is_some() => Err(ExcType::type_error(format!(
                    "{name}() got multiple values for keyword argument '{key}'"
                ))),
                (Some(i), _) => {
                    frame.fast[i] = Some(value);
                    continue;
                }
                (None, Some(dict)) => self.heap.dict_set_str(dict, &key, value).map_err(Into::into),
                (None, None) => {
                    value.drop_with_heap(self.heap);
                    unexpected.push(key);
                    Ok(())
                }
            };
            if let Err(err) = result {
                (kwargs.collect::<Vec<_>>(), defaults).drop_with_heap(self.heap);
                return Err(err);
            }
        }
        match unexpected.as_slice() {
            [] => {}
            [key] => {
                defaults.drop_with_heap(self.heap);
                return Err(ExcType::type_error(format!(
                    "{name}() got an unexpected keyword argument '{key}'"
                )));
            }
            keys => {
                defaults.drop_with_heap(self.heap);
                return Err(ExcType::type_error(format!(
                    "{name}() got {} unexpected keyword arguments",
                    keys.len()
                )));
            }
        }

        let first_default = argc - defcount;
        let mut missing = false;
        for (i, default) in defaults.into_iter().enumerate() {
            let slot = &mut frame.fast[first_default + i];
            if slot.is_none() {
                *slot = Some(default);
            } else {
                default.drop_with_heap(self.heap);
            }
        }
        if frame.fast[..argc].iter().any(Option::is_none) {
            missing = true;
        }
        if missing {
            let required = argc - defcount;
            return Err(ExcType::type_error(format!(
                "{name}() takes {} {required} argument{} ({given} given)",
                if has_varargs || defcount > 0 { "at least" } else { "exactly" },
                plural(required),
            )));
        }
        Ok(())
    }
}
