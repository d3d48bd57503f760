//! Bytecode virtual machine.
//!
//! The VM runs code objects on a stack of frames. Each frame owns its instruction
//! pointer, operand stack and block stack. Every opcode handler returns a [`Step`]; an
//! `Err` from a handler is parked in the runtime's exception cell and turned into the
//! `Error` unwind reason, so the block-stack walk in [`VM::unwind`] is the only place
//! that decides where execution resumes.

mod attr;
mod binary;
mod call;
mod collections;
mod compare;
mod exceptions;
mod format;
mod frame;
mod import;
pub(crate) mod natives;

use std::rc::Rc;

pub(crate) use binary::{BinaryOp, UnaryOp};
pub(crate) use call::CallOutcome;
use frame::{Block, BlockKind, Frame};

use crate::{
    args::ArgValues,
    bytecode::{
        Code, Const,
        op::{CompareOp, Opcode},
    },
    exception_private::{ExcInfo, ExcType, RunError, RunResult, SimpleException},
    heap::{ContainsHeap, DropWithHeap, Heap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    runtime::{Runtime, is_subtype},
    tracer::{NoopTracer, VmTracer},
    types::{CodeObject, Function, Int, Slice},
    value::Value,
};

/// Block nesting limit per frame, as in CPython.
const MAX_BLOCKS: usize = 20;

/// What the dispatch loop does after an instruction.
#[derive(Debug)]
pub(crate) enum Step {
    Next,
    Push(Value),
    Jump(usize),
    Unwind(Reason),
}

/// Why the block stack is being unwound.
#[derive(Debug)]
pub(crate) enum Reason {
    Return(Value),
    Break,
    /// Carries the loop's continue target.
    Continue(usize),
    /// The exception is in the runtime's exception cell.
    Error,
}

impl Reason {
    /// The code pushed for a finally handler, read back by `EndFinally` and `WithCleanup`.
    const RETURN: i64 = 0x08;
    const BREAK: i64 = 0x10;
    const CONTINUE: i64 = 0x20;

    fn name(&self) -> &'static str {
        match self {
            Self::Return(_) => "return",
            Self::Break => "break",
            Self::Continue(_) => "continue",
            Self::Error => "exception",
        }
    }
}

/// Outcome of unwinding the current frame's block stack.
enum Unwound {
    /// A handler was entered; the frame keeps running.
    Resumed,
    Return(Value),
    Error,
    /// `break`/`continue` with no enclosing loop.
    Stray(&'static str),
}

/// The interpreter proper: borrows the heap and runtime for the duration of a run.
pub(crate) struct VM<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer = NoopTracer> {
    heap: &'a mut Heap<T>,
    rt: &'a mut Runtime,
    print_writer: &'a mut P,
    tracer: &'a mut Tr,
    frames: Vec<Frame>,
    /// Containers whose repr is being built, for `[...]`/`{...}` on recursion.
    repr_guard: Vec<HeapId>,
}

// `heap` is not a public field on VM, so this implementation needs to go here rather than in `heap.rs`
impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> ContainsHeap<T> for VM<'_, T, P, Tr> {
    #[inline]
    fn heap_mut(&mut self) -> &mut Heap<T> {
        self.heap
    }
}

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'a, T, P, Tr> {
    pub fn new(heap: &'a mut Heap<T>, rt: &'a mut Runtime, print_writer: &'a mut P, tracer: &'a mut Tr) -> Self {
        Self {
            heap,
            rt,
            print_writer,
            tracer,
            frames: Vec::new(),
            repr_guard: Vec::new(),
        }
    }

    /// Runs `code` with the given namespaces until its frame returns.
    ///
    /// Borrows `globals` and `locals`; the frame takes its own references.
    pub fn run_code(&mut self, code: Rc<Code>, globals: HeapId, locals: HeapId) -> RunResult<Value> {
        let code_obj = self.load_code(Rc::clone(&code))?;
        self.heap.inc_ref(globals);
        self.heap.inc_ref(locals);
        let name = code.name().to_owned();
        let mut frame = Frame::new(code, code_obj, globals, locals);
        frame.handled = self.current_handled();
        self.frames.push(frame);
        self.tracer.on_call(&name, self.frames.len());
        self.run_frames(self.frames.len() - 1)
    }

    /// Materializes a code object's constants into a heap `CodeObject`.
    pub fn load_code(&mut self, code: Rc<Code>) -> RunResult<HeapId> {
        let mut consts = Vec::with_capacity(code.consts().len());
        for constant in code.consts() {
            match self.load_const(constant) {
                Ok(value) => consts.push(value),
                Err(err) => {
                    consts.drop_with_heap(self.heap);
                    return Err(err);
                }
            }
        }
        Ok(self.heap.allocate(HeapData::Code(CodeObject { code, consts }))?)
    }

    fn load_const(&mut self, constant: &Const) -> RunResult<Value> {
        Ok(match constant {
            Const::None => Value::None,
            Const::Bool(b) => Value::Bool(*b),
            Const::Int(v) => Value::Int(*v),
            Const::BigInt(text) => Int::parse(text)
                .ok_or_else(|| ExcType::system_error(format!("bad integer constant {text}")))?
                .into_value(self.heap)?,
            Const::Str(s) => self.heap.alloc_str(s)?,
            Const::Bytes(b) => self.heap.alloc_bytes(b.clone())?,
            Const::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match self.load_const(item) {
                        Ok(value) => values.push(value),
                        Err(err) => {
                            values.drop_with_heap(self.heap);
                            return Err(err);
                        }
                    }
                }
                self.heap.alloc_tuple(values)?
            }
            Const::Code(nested) => Value::Ref(self.load_code(Rc::new((**nested).clone()))?),
        })
    }

    // ========================================================================
    // Dispatch loop
    // ========================================================================

    /// Executes until the frame count drops back to `base`, returning that frame's value.
    fn run_frames(&mut self, base: usize) -> RunResult<Value> {
        loop {
            if self.heap.has_pending_finalizers() {
                self.run_finalizers();
            }
            let step = match self.heap.tracker_mut().on_instruction() {
                Ok(()) => self.fetch().and_then(|(op, arg)| {
                    let frame = self.frame();
                    let (ip, depth) = (frame.last_ip, frame.stack.len());
                    self.tracer.on_instruction(ip, op, depth, self.frames.len());
                    self.dispatch(op, arg)
                }),
                Err(err) => Err(err.into()),
            };
            let step = match step.and_then(|step| self.apply_push(step)) {
                Ok(step) => step,
                Err(err) => match self.raise_error(err) {
                    Ok(()) => Step::Unwind(Reason::Error),
                    Err(fatal) => return Err(self.abort(base, fatal)),
                },
            };
            match step {
                Step::Next | Step::Push(_) => {}
                Step::Jump(target) => self.frame_mut().ip = target,
                Step::Unwind(reason) => match self.unwind(reason, base) {
                    Ok(Some(value)) => return Ok(value),
                    Ok(None) => {}
                    Err(fatal) => return Err(self.abort(base, fatal)),
                },
            }
        }
    }

    fn apply_push(&mut self, step: Step) -> RunResult<Step> {
        match step {
            Step::Push(value) => self.push(value).map(|()| Step::Next),
            other => Ok(other),
        }
    }

    /// Drops every frame above `base` after an error no handler may see.
    fn abort(&mut self, base: usize, err: RunError) -> RunError {
        while self.frames.len() > base {
            if let Some(frame) = self.frames.pop() {
                frame.release(self.heap);
            }
        }
        err
    }

    /// Decodes the next instruction, folding `ExtendedArg` prefixes into the operand.
    fn fetch(&mut self) -> RunResult<(Opcode, u32)> {
        let frame = self.frames.last_mut().ok_or_else(|| RunError::internal("fetch without a frame"))?;
        let bytecode = frame.code.bytecode();
        let mut extended: u32 = 0;
        loop {
            let offset = frame.ip;
            let Some(&byte) = bytecode.get(offset) else {
                return Err(ExcType::system_error("instruction pointer ran past the end of the code"));
            };
            let Some(op) = Opcode::from_byte(byte) else {
                return Err(ExcType::system_error(format!("unknown opcode {byte}")));
            };
            frame.last_ip = offset;
            if !op.has_arg() {
                frame.ip = offset + 1;
                return Ok((op, 0));
            }
            let Some(operand) = bytecode.get(offset + 1..offset + 3) else {
                return Err(ExcType::system_error("truncated operand"));
            };
            let arg = (extended << 16) | u32::from(u16::from_le_bytes([operand[0], operand[1]]));
            frame.ip = offset + 3;
            if op == Opcode::ExtendedArg {
                extended = arg;
            } else {
                return Ok((op, arg));
            }
        }
    }

    #[expect(clippy::too_many_lines, reason = "one arm per opcode")]
    fn dispatch(&mut self, op: Opcode, arg: u32) -> RunResult<Step> {
        let oparg = arg as usize;
        match op {
            Opcode::Nop => Ok(Step::Next),
            Opcode::PopTop => {
                let value = self.pop()?;
                value.drop_with_heap(self.heap);
                Ok(Step::Next)
            }
            Opcode::RotTwo => self.rotate(2),
            Opcode::RotThree => self.rotate(3),
            Opcode::RotFour => self.rotate(4),
            Opcode::DupTop => {
                let top = self.peek(0)?.clone_with_heap(self.heap);
                Ok(Step::Push(top))
            }
            Opcode::DupTopx => self.dup_topx(oparg),

            // ==== names ====
            Opcode::LoadConst => {
                let frame = self.frame();
                let value = match self.heap.get(frame.code_obj) {
                    HeapData::Code(c) => c.consts.get(oparg).map(|v| v.clone_with_heap(self.heap)),
                    _ => None,
                };
                value
                    .map(Step::Push)
                    .ok_or_else(|| ExcType::system_error(format!("constant index {oparg} out of range")))
            }
            Opcode::LoadLocals => {
                let locals = self.frame().locals;
                self.heap.inc_ref(locals);
                Ok(Step::Push(Value::Ref(locals)))
            }
            Opcode::LoadFast => {
                let value = match self.frame().fast.get(oparg) {
                    Some(Some(value)) => value.clone_with_heap(self.heap),
                    Some(None) => return Err(ExcType::unbound_local_error(&self.varname(oparg)?)),
                    None => return Err(ExcType::system_error("local index out of range")),
                };
                Ok(Step::Push(value))
            }
            Opcode::StoreFast => {
                let value = self.pop()?;
                match self.frame_mut().fast.get_mut(oparg) {
                    Some(slot) => {
                        let old = slot.replace(value);
                        old.drop_with_heap(self.heap);
                        Ok(Step::Next)
                    }
                    None => {
                        value.drop_with_heap(self.heap);
                        Err(ExcType::system_error("local index out of range"))
                    }
                }
            }
            Opcode::DeleteFast => match self.frame_mut().fast.get_mut(oparg).map(Option::take) {
                Some(Some(old)) => {
                    old.drop_with_heap(self.heap);
                    Ok(Step::Next)
                }
                Some(None) => Err(ExcType::unbound_local_error(&self.varname(oparg)?)),
                None => Err(ExcType::system_error("local index out of range")),
            },
            Opcode::LoadName => {
                let name = self.name(oparg)?;
                let frame = self.frame();
                let found = [frame.locals, frame.globals, self.rt.builtins]
                    .into_iter()
                    .find_map(|dict| self.heap.dict_get_str(dict, &name))
                    .map(|v| v.clone_with_heap(self.heap));
                found.map(Step::Push).ok_or_else(|| ExcType::name_error(&name))
            }
            Opcode::StoreName => {
                let name = self.name(oparg)?;
                let value = self.pop()?;
                let locals = self.frame().locals;
                self.heap.dict_set_str(locals, &name, value)?;
                Ok(Step::Next)
            }
            Opcode::DeleteName => {
                let name = self.name(oparg)?;
                let locals = self.frame().locals;
                let old = self.heap.dict_del_str(locals, &name).ok_or_else(|| ExcType::name_error(&name))?;
                old.drop_with_heap(self.heap);
                Ok(Step::Next)
            }
            Opcode::LoadGlobal => {
                let name = self.name(oparg)?;
                let globals = self.frame().globals;
                let found = [globals, self.rt.builtins]
                    .into_iter()
                    .find_map(|dict| self.heap.dict_get_str(dict, &name))
                    .map(|v| v.clone_with_heap(self.heap));
                found.map(Step::Push).ok_or_else(|| ExcType::global_name_error(&name))
            }
            Opcode::StoreGlobal => {
                let name = self.name(oparg)?;
                let value = self.pop()?;
                let globals = self.frame().globals;
                self.heap.dict_set_str(globals, &name, value)?;
                Ok(Step::Next)
            }
            Opcode::DeleteGlobal => {
                let name = self.name(oparg)?;
                let globals = self.frame().globals;
                let old = self
                    .heap
                    .dict_del_str(globals, &name)
                    .ok_or_else(|| ExcType::global_name_error(&name))?;
                old.drop_with_heap(self.heap);
                Ok(Step::Next)
            }

            // ==== attributes ====
            Opcode::LoadAttr => {
                let name = self.name(oparg)?;
                let obj = self.pop()?;
                let result = self.load_attr(&obj, &name);
                obj.drop_with_heap(self.heap);
                result.map(Step::Push)
            }
            Opcode::StoreAttr => {
                let name = self.name(oparg)?;
                let obj = self.pop()?;
                let value = match self.pop() {
                    Ok(value) => value,
                    Err(err) => {
                        obj.drop_with_heap(self.heap);
                        return Err(err);
                    }
                };
                let result = self.set_attr(&obj, &name, value);
                obj.drop_with_heap(self.heap);
                result.map(|()| Step::Next)
            }
            Opcode::DeleteAttr => {
                let name = self.name(oparg)?;
                let obj = self.pop()?;
                let result = self.del_attr(&obj, &name);
                obj.drop_with_heap(self.heap);
                result.map(|()| Step::Next)
            }

            // ==== containers ====
            Opcode::BuildTuple => {
                let items = self.pop_n(oparg)?;
                Ok(Step::Push(self.heap.alloc_tuple(items)?))
            }
            Opcode::BuildList => {
                let items = self.pop_n(oparg)?;
                Ok(Step::Push(self.heap.alloc_list(items)?))
            }
            Opcode::BuildMap => Ok(Step::Push(Value::Ref(self.heap.alloc_dict()?))),
            Opcode::StoreMap => self.store_map(),
            Opcode::MapAdd => self.map_add(oparg),
            Opcode::ListAppend => self.list_append_op(oparg),
            Opcode::BuildSlice => {
                if !(2..=3).contains(&oparg) {
                    return Err(ExcType::system_error("BUILD_SLICE takes 2 or 3 operands"));
                }
                let mut parts = self.pop_n(oparg)?.into_iter();
                let start = parts.next().unwrap_or(Value::None);
                let stop = parts.next().unwrap_or(Value::None);
                let step = parts.next().unwrap_or(Value::None);
                let slice = self.heap.allocate(HeapData::Slice(Slice { start, stop, step }))?;
                Ok(Step::Push(Value::Ref(slice)))
            }
            Opcode::Slice0 | Opcode::Slice1 | Opcode::Slice2 | Opcode::Slice3 => {
                let flags = op as u8 - Opcode::Slice0 as u8;
                let slice = self.pop_slice_bounds(flags)?;
                let obj = match self.pop() {
                    Ok(obj) => obj,
                    Err(err) => {
                        slice.drop_with_heap(self.heap);
                        return Err(err);
                    }
                };
                let result = self.get_item(&obj, &slice);
                (obj, slice).drop_with_heap(self.heap);
                result.map(Step::Push)
            }
            Opcode::StoreSlice0 | Opcode::StoreSlice1 | Opcode::StoreSlice2 | Opcode::StoreSlice3 => {
                let flags = op as u8 - Opcode::StoreSlice0 as u8;
                let slice = self.pop_slice_bounds(flags)?;
                let (obj, value) = match self.pop().and_then(|obj| match self.pop() {
                    Ok(value) => Ok((obj, value)),
                    Err(err) => {
                        obj.drop_with_heap(self.heap);
                        Err(err)
                    }
                }) {
                    Ok(pair) => pair,
                    Err(err) => {
                        slice.drop_with_heap(self.heap);
                        return Err(err);
                    }
                };
                let result = self.set_item(&obj, &slice, value);
                (obj, slice).drop_with_heap(self.heap);
                result.map(|()| Step::Next)
            }
            Opcode::DeleteSlice0 | Opcode::DeleteSlice1 | Opcode::DeleteSlice2 | Opcode::DeleteSlice3 => {
                let flags = op as u8 - Opcode::DeleteSlice0 as u8;
                let slice = self.pop_slice_bounds(flags)?;
                let obj = match self.pop() {
                    Ok(obj) => obj,
                    Err(err) => {
                        slice.drop_with_heap(self.heap);
                        return Err(err);
                    }
                };
                let result = self.del_item(&obj, &slice);
                (obj, slice).drop_with_heap(self.heap);
                result.map(|()| Step::Next)
            }
            Opcode::BinarySubscr => {
                let [container, index] = self.pop_array()?;
                let result = self.get_item(&container, &index);
                (container, index).drop_with_heap(self.heap);
                result.map(Step::Push)
            }
            Opcode::StoreSubscr => {
                let [value, container, index] = self.pop_array()?;
                let result = self.set_item(&container, &index, value);
                (container, index).drop_with_heap(self.heap);
                result.map(|()| Step::Next)
            }
            Opcode::DeleteSubscr => {
                let [container, index] = self.pop_array()?;
                let result = self.del_item(&container, &index);
                (container, index).drop_with_heap(self.heap);
                result.map(|()| Step::Next)
            }
            Opcode::UnpackSequence => {
                let seq = self.pop()?;
                let result = self.unpack_sequence(&seq, oparg);
                seq.drop_with_heap(self.heap);
                let mut items = result?;
                while let Some(item) = items.pop() {
                    if let Err(err) = self.push(item) {
                        items.drop_with_heap(self.heap);
                        return Err(err);
                    }
                }
                Ok(Step::Next)
            }

            // ==== arithmetic ====
            Opcode::UnaryPositive => self.unary_step(UnaryOp::Pos),
            Opcode::UnaryNegative => self.unary_step(UnaryOp::Neg),
            Opcode::UnaryInvert => self.unary_step(UnaryOp::Invert),
            Opcode::UnaryNot => {
                let value = self.pop()?;
                let result = self.is_true(&value);
                value.drop_with_heap(self.heap);
                Ok(Step::Push(Value::Bool(!result?)))
            }
            Opcode::UnaryConvert => {
                let value = self.pop()?;
                let result = self.repr(&value);
                value.drop_with_heap(self.heap);
                Ok(Step::Push(self.heap.alloc_str(&result?)?))
            }
            Opcode::BinaryPower => self.binary_step(BinaryOp::Pow, false),
            Opcode::BinaryMultiply => self.binary_step(BinaryOp::Mul, false),
            Opcode::BinaryDivide => self.binary_step(BinaryOp::Div, false),
            Opcode::BinaryFloorDivide => self.binary_step(BinaryOp::FloorDiv, false),
            Opcode::BinaryTrueDivide => self.binary_step(BinaryOp::TrueDiv, false),
            Opcode::BinaryModulo => self.binary_step(BinaryOp::Mod, false),
            Opcode::BinaryAdd => self.binary_step(BinaryOp::Add, false),
            Opcode::BinarySubtract => self.binary_step(BinaryOp::Sub, false),
            Opcode::BinaryLshift => self.binary_step(BinaryOp::LShift, false),
            Opcode::BinaryRshift => self.binary_step(BinaryOp::RShift, false),
            Opcode::BinaryAnd => self.binary_step(BinaryOp::And, false),
            Opcode::BinaryXor => self.binary_step(BinaryOp::Xor, false),
            Opcode::BinaryOr => self.binary_step(BinaryOp::Or, false),
            Opcode::InplacePower => self.binary_step(BinaryOp::Pow, true),
            Opcode::InplaceMultiply => self.binary_step(BinaryOp::Mul, true),
            Opcode::InplaceDivide => self.binary_step(BinaryOp::Div, true),
            Opcode::InplaceFloorDivide => self.binary_step(BinaryOp::FloorDiv, true),
            Opcode::InplaceTrueDivide => self.binary_step(BinaryOp::TrueDiv, true),
            Opcode::InplaceModulo => self.binary_step(BinaryOp::Mod, true),
            Opcode::InplaceAdd => self.binary_step(BinaryOp::Add, true),
            Opcode::InplaceSubtract => self.binary_step(BinaryOp::Sub, true),
            Opcode::InplaceLshift => self.binary_step(BinaryOp::LShift, true),
            Opcode::InplaceRshift => self.binary_step(BinaryOp::RShift, true),
            Opcode::InplaceAnd => self.binary_step(BinaryOp::And, true),
            Opcode::InplaceXor => self.binary_step(BinaryOp::Xor, true),
            Opcode::InplaceOr => self.binary_step(BinaryOp::Or, true),
            Opcode::CompareOp => {
                let cmp = CompareOp::from_repr(arg as u8)
                    .filter(|_| arg <= u32::from(u8::MAX))
                    .ok_or_else(|| ExcType::system_error(format!("bad comparison operand {arg}")))?;
                let [lhs, rhs] = self.pop_array()?;
                let result = self.compare_op(cmp, &lhs, &rhs);
                (lhs, rhs).drop_with_heap(self.heap);
                result.map(Step::Push)
            }

            // ==== control flow ====
            Opcode::JumpForward => Ok(Step::Jump(self.frame().ip + oparg)),
            Opcode::JumpAbsolute => Ok(Step::Jump(oparg)),
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let value = self.pop()?;
                let truth = self.is_true(&value);
                value.drop_with_heap(self.heap);
                let jump_on = op == Opcode::PopJumpIfTrue;
                Ok(if truth? == jump_on { Step::Jump(oparg) } else { Step::Next })
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let truth = {
                    let top = self.peek(0)?.clone_with_heap(self.heap);
                    let truth = self.is_true(&top);
                    top.drop_with_heap(self.heap);
                    truth?
                };
                if truth == (op == Opcode::JumpIfTrueOrPop) {
                    Ok(Step::Jump(oparg))
                } else {
                    let value = self.pop()?;
                    value.drop_with_heap(self.heap);
                    Ok(Step::Next)
                }
            }
            Opcode::GetIter => {
                let value = self.pop()?;
                let result = self.get_iter(&value);
                value.drop_with_heap(self.heap);
                result.map(Step::Push)
            }
            Opcode::ForIter => {
                let iterator = self.peek(0)?.clone_with_heap(self.heap);
                let next = self.iter_next(&iterator);
                iterator.drop_with_heap(self.heap);
                match next? {
                    Some(value) => Ok(Step::Push(value)),
                    None => {
                        let exhausted = self.pop()?;
                        exhausted.drop_with_heap(self.heap);
                        Ok(Step::Jump(self.frame().ip + oparg))
                    }
                }
            }
            Opcode::SetupLoop => self.setup_block(BlockKind::Loop, oparg),
            Opcode::SetupExcept => self.setup_block(BlockKind::Except, oparg),
            Opcode::SetupFinally => self.setup_block(BlockKind::Finally, oparg),
            Opcode::PopBlock => {
                let frame = self.frames.last_mut().ok_or_else(|| RunError::internal("no frame"))?;
                let block = frame
                    .blocks
                    .pop()
                    .ok_or_else(|| ExcType::system_error("block stack underflow"))?;
                frame.truncate_stack(block.level, self.heap);
                Ok(Step::Next)
            }
            Opcode::BreakLoop => Ok(Step::Unwind(Reason::Break)),
            Opcode::ContinueLoop => Ok(Step::Unwind(Reason::Continue(oparg))),
            Opcode::EndFinally => self.end_finally(),
            Opcode::RaiseVarargs => self.raise_varargs(oparg),
            Opcode::ReturnValue => Ok(Step::Unwind(Reason::Return(self.pop()?))),
            Opcode::SetupWith => self.setup_with(oparg),
            Opcode::WithCleanup => self.with_cleanup(),

            // ==== functions and classes ====
            Opcode::MakeFunction => self.make_function(oparg),
            Opcode::CallFunction => self.call_function_op(arg, false, false),
            Opcode::CallFunctionVar => self.call_function_op(arg, true, false),
            Opcode::CallFunctionKw => self.call_function_op(arg, false, true),
            Opcode::CallFunctionVarKw => self.call_function_op(arg, true, true),
            Opcode::BuildClass => {
                let [name, bases, body] = self.pop_array()?;
                let result = self.build_class(&name, &bases, &body);
                (name, bases, body).drop_with_heap(self.heap);
                result.map(Step::Push)
            }

            // ==== modules ====
            Opcode::ImportName => self.import_name_op(oparg),
            Opcode::ImportFrom => self.import_from_op(oparg),
            Opcode::ImportStar => self.import_star_op(),

            // ==== print statement ====
            Opcode::PrintItem => self.print_item_op(false),
            Opcode::PrintItemTo => self.print_item_op(true),
            Opcode::PrintNewline => self.print_newline_op(false),
            Opcode::PrintNewlineTo => self.print_newline_op(true),
            Opcode::PrintExpr => self.print_expr_op(),

            Opcode::ExtendedArg => Err(ExcType::system_error("EXTENDED_ARG reached dispatch")),
        }
    }

    // ========================================================================
    // Opcode helpers
    // ========================================================================

    fn rotate(&mut self, n: usize) -> RunResult<Step> {
        let stack = &mut self.frame_mut().stack;
        let len = stack.len();
        if len < n {
            return Err(ExcType::system_error("stack underflow"));
        }
        stack[len - n..].rotate_right(1);
        Ok(Step::Next)
    }

    fn dup_topx(&mut self, count: usize) -> RunResult<Step> {
        if !(1..=5).contains(&count) {
            return Err(ExcType::system_error("invalid argument to DUP_TOPX (bytecode corruption?)"));
        }
        let stack = &self.frame().stack;
        if stack.len() < count {
            return Err(ExcType::system_error("stack underflow"));
        }
        let copies: Vec<Value> = stack[stack.len() - count..]
            .iter()
            .map(|v| v.clone_with_heap(self.heap))
            .collect();
        let mut copies = copies.into_iter();
        while let Some(value) = copies.next() {
            if let Err(err) = self.push(value) {
                copies.drop_with_heap(self.heap);
                return Err(err);
            }
        }
        Ok(Step::Next)
    }

    /// Pops the optional `SLICE+n` bounds and wraps them in a slice object.
    fn pop_slice_bounds(&mut self, flags: u8) -> RunResult<Value> {
        let stop = if flags & 2 == 0 { Value::None } else { self.pop()? };
        let start = if flags & 1 == 0 {
            Value::None
        } else {
            match self.pop() {
                Ok(start) => start,
                Err(err) => {
                    stop.drop_with_heap(self.heap);
                    return Err(err);
                }
            }
        };
        let slice = self.heap.allocate(HeapData::Slice(Slice {
            start,
            stop,
            step: Value::None,
        }))?;
        Ok(Value::Ref(slice))
    }

    fn unary_step(&mut self, op: UnaryOp) -> RunResult<Step> {
        let value = self.pop()?;
        let result = self.unary_op(op, &value);
        value.drop_with_heap(self.heap);
        result.map(Step::Push)
    }

    fn binary_step(&mut self, op: BinaryOp, inplace: bool) -> RunResult<Step> {
        let [lhs, rhs] = self.pop_array()?;
        let result = if inplace {
            self.inplace_op(op, &lhs, &rhs)
        } else {
            self.binary_op(op, &lhs, &rhs)
        };
        (lhs, rhs).drop_with_heap(self.heap);
        result.map(Step::Push)
    }

    fn setup_block(&mut self, kind: BlockKind, delta: usize) -> RunResult<Step> {
        let frame = self.frame_mut();
        if frame.blocks.len() >= MAX_BLOCKS {
            return Err(ExcType::system_error("too many statically nested blocks"));
        }
        let block = Block {
            kind,
            handler: frame.ip + delta,
            level: frame.stack.len(),
        };
        frame.blocks.push(block);
        Ok(Step::Next)
    }

    /// `MakeFunction`: the code object on top, `argc` defaults below it.
    fn make_function(&mut self, argc: usize) -> RunResult<Step> {
        let code = self.pop()?;
        let defaults = match self.pop_n(argc) {
            Ok(defaults) => defaults,
            Err(err) => {
                code.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        let name = match code.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Code(c)) => c.code.name().to_owned(),
            _ => {
                (code, defaults).drop_with_heap(self.heap);
                return Err(ExcType::system_error("MAKE_FUNCTION expects a code object"));
            }
        };
        let code_id = code.into_owned_id().ok_or_else(|| RunError::internal("code object lost its id"))?;
        let globals = self.frame().globals;
        self.heap.inc_ref(globals);
        let func = self.heap.allocate(HeapData::Function(Function {
            name,
            code: code_id,
            globals,
            defaults,
        }))?;
        Ok(Step::Push(Value::Ref(func)))
    }

    // ========================================================================
    // Block-stack unwinding
    // ========================================================================

    /// Unwinds frames for `reason`. `Some(value)` when the frame at `base` returned.
    fn unwind(&mut self, reason: Reason, base: usize) -> RunResult<Option<Value>> {
        let mut reason = reason;
        loop {
            if matches!(reason, Reason::Error) && !self.rt.occurred() {
                self.raise_error(ExcType::system_error("error return without exception set"))?;
            }
            match self.unwind_blocks(reason) {
                Unwound::Resumed => return Ok(None),
                Unwound::Return(value) => {
                    self.pop_frame();
                    if self.frames.len() <= base {
                        return Ok(Some(value));
                    }
                    // the call instruction consumed its operands, so there is room
                    self.frame_mut().stack.push(value);
                    return Ok(None);
                }
                Unwound::Error => {
                    self.pop_frame();
                    if self.frames.len() <= base {
                        return Err(match self.rt.fetch() {
                            Some(info) => info.into(),
                            None => RunError::internal("frame unwound with no exception set"),
                        });
                    }
                    if let Some(mut info) = self.rt.fetch() {
                        self.add_traceback(&mut info);
                        self.rt.raise(self.heap, info);
                    }
                    reason = Reason::Error;
                }
                Unwound::Stray(what) => {
                    self.raise_error(ExcType::system_error(format!("'{what}' outside loop")))?;
                    reason = Reason::Error;
                }
            }
        }
    }

    fn unwind_blocks(&mut self, reason: Reason) -> Unwound {
        self.tracer.on_unwind(reason.name(), self.frames.len());
        let Some(frame) = self.frames.last_mut() else {
            return Unwound::Error;
        };
        while let Some(block) = frame.blocks.last().copied() {
            if let Reason::Continue(target) = reason
                && block.kind == BlockKind::Loop
            {
                frame.ip = target;
                return Unwound::Resumed;
            }
            frame.blocks.pop();
            frame.truncate_stack(block.level, self.heap);
            if block.kind == BlockKind::Loop {
                if matches!(reason, Reason::Break) {
                    frame.ip = block.handler;
                    return Unwound::Resumed;
                }
                continue;
            }
            if block.kind == BlockKind::Except && !matches!(reason, Reason::Error) {
                continue;
            }
            match reason {
                Reason::Error => {
                    // `unwind` guarantees the cell is set before handlers are searched
                    let Some(info) = self.rt.fetch() else {
                        return Unwound::Error;
                    };
                    let type_name = match info.kind.ref_id().map(|id| self.heap.get(id)) {
                        Some(HeapData::Type(t)) => t.name.as_str(),
                        _ => "?",
                    };
                    self.tracer.on_exception_handled(type_name, block.handler);
                    let handled = info.clone_with_heap(self.heap);
                    if let Some(old) = frame.handled.replace(handled) {
                        old.drop_with_heap(self.heap);
                    }
                    frame.stack.push(info.traceback);
                    frame.stack.push(info.value);
                    frame.stack.push(info.kind);
                }
                Reason::Return(value) => {
                    frame.stack.push(value);
                    frame.stack.push(Value::Int(Reason::RETURN));
                }
                Reason::Continue(target) => {
                    frame.stack.push(Value::Int(target as i64));
                    frame.stack.push(Value::Int(Reason::CONTINUE));
                }
                Reason::Break => frame.stack.push(Value::Int(Reason::BREAK)),
            }
            frame.ip = block.handler;
            return Unwound::Resumed;
        }
        match reason {
            Reason::Return(value) => Unwound::Return(value),
            Reason::Error => Unwound::Error,
            Reason::Break => Unwound::Stray("break"),
            Reason::Continue(_) => Unwound::Stray("continue"),
        }
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            frame.release(self.heap);
            self.tracer.on_return(self.frames.len());
        }
    }

    /// `EndFinally`: resumes whatever sent control into the finally block.
    fn end_finally(&mut self) -> RunResult<Step> {
        let marker = self.pop()?;
        match marker {
            Value::None => {
                let handled = self.frame_mut().handled.take();
                handled.drop_with_heap(self.heap);
                Ok(Step::Next)
            }
            Value::Int(Reason::RETURN) => Ok(Step::Unwind(Reason::Return(self.pop()?))),
            Value::Int(Reason::CONTINUE) => match self.pop()? {
                Value::Int(target) if target >= 0 => Ok(Step::Unwind(Reason::Continue(target as usize))),
                other => {
                    other.drop_with_heap(self.heap);
                    Err(ExcType::system_error("bad continue target"))
                }
            },
            Value::Int(Reason::BREAK) => Ok(Step::Unwind(Reason::Break)),
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Type(_)) => {
                let [traceback, value] = match self.pop_array() {
                    Ok(pair) => pair,
                    Err(err) => {
                        marker.drop_with_heap(self.heap);
                        return Err(err);
                    }
                };
                let info = ExcInfo {
                    kind: marker,
                    value,
                    traceback,
                };
                self.rt.restore(self.heap, Some(info));
                Ok(Step::Unwind(Reason::Error))
            }
            other => {
                other.drop_with_heap(self.heap);
                Err(ExcType::system_error("'finally' pops bad exception"))
            }
        }
    }

    /// `SetupWith`: swaps the manager for its bound `__exit__`, enters a finally block,
    /// then pushes the `__enter__` result.
    fn setup_with(&mut self, delta: usize) -> RunResult<Step> {
        let manager = self.pop()?;
        let exit = match self.get_attr(&manager, "__exit__") {
            Ok(Some(exit)) => exit,
            Ok(None) => {
                manager.drop_with_heap(self.heap);
                return Err(missing_special("__exit__"));
            }
            Err(err) => {
                manager.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        self.frame_mut().stack.push(exit);
        let enter = self.get_attr(&manager, "__enter__");
        manager.drop_with_heap(self.heap);
        let enter = enter?.ok_or_else(|| missing_special("__enter__"))?;
        let entered = self.call_sync(&enter, ArgValues::empty());
        enter.drop_with_heap(self.heap);
        let entered = entered?;
        if let Err(err) = self.setup_block(BlockKind::Finally, delta) {
            entered.drop_with_heap(self.heap);
            return Err(err);
        }
        Ok(Step::Push(entered))
    }

    /// `WithCleanup`: removes `__exit__` from under the finally marker and calls it.
    ///
    /// With an exception on the stack, a true result from `__exit__` replaces the
    /// exception triple with `None` so the following `EndFinally` falls through.
    fn with_cleanup(&mut self) -> RunResult<Step> {
        let (exit_depth, exc) = match self.peek(0)? {
            Value::None => (2, false),
            Value::Int(Reason::RETURN | Reason::CONTINUE) => (3, false),
            Value::Int(_) => (2, false),
            _ => (4, true),
        };
        let frame = self.frames.last_mut().ok_or_else(|| RunError::internal("no frame"))?;
        let stack = &mut frame.stack;
        if stack.len() < exit_depth {
            return Err(ExcType::system_error("stack underflow"));
        }
        let exit = stack.remove(stack.len() - exit_depth);
        let args = if exc {
            let len = stack.len();
            let triple = [&stack[len - 1], &stack[len - 2], &stack[len - 3]];
            triple.map(|v| v.clone_with_heap(self.heap)).into()
        } else {
            vec![Value::None, Value::None, Value::None]
        };
        let result = self.call_sync(&exit, ArgValues::new(args));
        exit.drop_with_heap(self.heap);
        let result = result?;
        let suppress = if exc { self.is_true(&result) } else { Ok(false) };
        result.drop_with_heap(self.heap);
        if suppress? {
            let triple = self.pop_n(3)?;
            triple.drop_with_heap(self.heap);
            self.frame_mut().stack.push(Value::None);
        }
        Ok(Step::Next)
    }

    // ========================================================================
    // Stack and frame access
    // ========================================================================

    fn frame(&self) -> &Frame {
        self.frames.last().expect("VM has no active frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("VM has no active frame")
    }

    fn push(&mut self, value: Value) -> RunResult<()> {
        let frame = self.frame_mut();
        if frame.stack.len() >= frame.code.stack_size() {
            value.drop_with_heap(self.heap);
            return Err(ExcType::system_error("stack overflow"));
        }
        frame.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.frame_mut()
            .stack
            .pop()
            .ok_or_else(|| ExcType::system_error("stack underflow"))
    }

    fn peek(&self, depth: usize) -> RunResult<&Value> {
        let stack = &self.frame().stack;
        stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|i| stack.get(i))
            .ok_or_else(|| ExcType::system_error("stack underflow"))
    }

    /// Pops `n` values, returned in stack order (the old top last).
    fn pop_n(&mut self, n: usize) -> RunResult<Vec<Value>> {
        let stack = &mut self.frame_mut().stack;
        if stack.len() < n {
            return Err(ExcType::system_error("stack underflow"));
        }
        let at = stack.len() - n;
        Ok(stack.split_off(at))
    }

    fn pop_array<const N: usize>(&mut self) -> RunResult<[Value; N]> {
        let items = self.pop_n(N)?;
        match <[Value; N]>::try_from(items) {
            Ok(array) => Ok(array),
            Err(items) => {
                items.drop_with_heap(self.heap);
                Err(RunError::internal("pop_array: length mismatch"))
            }
        }
    }

    fn name(&self, index: usize) -> RunResult<String> {
        self.frame()
            .code
            .names()
            .get(index)
            .cloned()
            .ok_or_else(|| ExcType::system_error(format!("name index {index} out of range")))
    }

    fn varname(&self, index: usize) -> RunResult<String> {
        self.frame()
            .code
            .varnames()
            .get(index)
            .cloned()
            .ok_or_else(|| ExcType::system_error(format!("local index {index} out of range")))
    }

    // ========================================================================
    // Type helpers
    // ========================================================================

    pub(crate) fn type_of(&self, value: &Value) -> HeapId {
        self.rt.type_of(self.heap, value)
    }

    /// Name of the value's type, as shown in error messages.
    pub(crate) fn type_name(&self, value: &Value) -> String {
        self.type_id_name(self.type_of(value))
    }

    pub(crate) fn type_id_name(&self, type_id: HeapId) -> String {
        match self.heap.get(type_id) {
            HeapData::Type(t) => t.name.clone(),
            _ => "?".to_owned(),
        }
    }

    /// Name of an exception's type object, or of the value's type if it is not one.
    pub(crate) fn exc_type_name(&self, kind: &Value) -> String {
        match kind.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Type(t)) => t.name.clone(),
            _ => self.type_name(kind),
        }
    }

    pub(crate) fn type_dict(&self, type_id: HeapId) -> Option<HeapId> {
        match self.heap.get(type_id) {
            HeapData::Type(t) => Some(t.dict),
            _ => None,
        }
    }

    /// Looks `name` up in a type's dictionary, which already holds the inherited entries.
    pub(crate) fn lookup_type_attr(&self, type_id: HeapId, name: &str) -> Option<Value> {
        let dict = self.type_dict(type_id)?;
        self.heap.dict_get_str(dict, name).map(|v| v.clone_with_heap(self.heap))
    }

    /// Bytes of a `str` value; empty for anything else.
    pub(crate) fn str_of(&self, value: &Value) -> &[u8] {
        self.heap.str_bytes(value).unwrap_or_default()
    }

    pub(crate) fn is_str(&self, value: &Value) -> bool {
        self.heap.str_bytes(value).is_some()
    }

    pub(crate) fn is_instance_value(&self, value: &Value) -> bool {
        matches!(value.ref_id().map(|id| self.heap.get(id)), Some(HeapData::Instance(_)))
    }

    pub(crate) fn isinstance(&self, value: &Value, type_id: HeapId) -> bool {
        is_subtype(self.heap, self.type_of(value), type_id)
    }

    pub(crate) fn is_type(&self, value: &Value) -> bool {
        matches!(value.ref_id().map(|id| self.heap.get(id)), Some(HeapData::Type(_)))
    }

    // ========================================================================
    // Finalizers
    // ========================================================================

    /// Runs `__del__` for every queued instance with the exception cell saved aside.
    pub fn run_finalizers(&mut self) {
        while let Some(id) = self.heap.take_finalizer() {
            let saved = self.rt.fetch();
            let obj = Value::Ref(id);
            match self.call_method(&obj, "__del__", ArgValues::empty()) {
                Ok(result) => result.drop_with_heap(self.heap),
                Err(err) => err.drop_with_heap(self.heap),
            }
            self.rt.restore(self.heap, saved);
            obj.drop_with_heap(self.heap);
        }
    }
}

/// AttributeError for a missing context-manager method, worded like CPython 2.7.
fn missing_special(name: &str) -> RunError {
    SimpleException::new_msg(ExcType::AttributeError, name).into()
}
