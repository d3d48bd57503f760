//! Public interface for running coil code objects.
use std::rc::Rc;

use crate::{
    Exception,
    bytecode::{Code, CodeError, VM},
    exception_private::{ExcType, RunError},
    heap::{Heap, HeapId, HeapStats},
    io::{PrintWriter, StdPrint},
    object::Object,
    resource::{NoLimitTracker, ResourceTracker},
    runtime::{ModuleSlot, Runtime},
    tracer::{NoopTracer, VmTracer},
};

/// Initial arena capacity; the heap grows past it as needed.
const INITIAL_HEAP_CAPACITY: usize = 1024;

/// A long-lived interpreter: one heap, one set of builtin types, the `__main__`
/// namespace and the module table.
///
/// Globals persist across [`execute`](Self::execute) calls, so code objects run one after
/// another behave like statements typed into the same module.
///
/// # Example
/// ```
/// use coil::{CodeBuilder, Const, Interpreter, NoPrint, Object, Opcode};
///
/// let mut b = CodeBuilder::new("<module>");
/// let forty = b.add_const(Const::Int(40));
/// let two = b.add_const(Const::Int(2));
/// b.emit_arg(Opcode::LoadConst, forty);
/// b.emit_arg(Opcode::LoadConst, two);
/// b.emit(Opcode::BinaryAdd);
/// b.emit(Opcode::ReturnValue);
/// let code = b.build();
///
/// let mut interp = Interpreter::new_no_limits().unwrap();
/// assert_eq!(interp.execute(&code, &mut NoPrint).unwrap(), Object::Int(42));
/// ```
#[derive(Debug)]
pub struct Interpreter<T: ResourceTracker = NoLimitTracker> {
    heap: Heap<T>,
    rt: Runtime,
    /// Globals and locals of `__main__`; one owned reference.
    main: HeapId,
}

impl Interpreter<NoLimitTracker> {
    /// Creates an interpreter that enforces only the default recursion depth.
    ///
    /// # Errors
    /// Never in practice; kept fallible to match [`new`](Self::new).
    pub fn new_no_limits() -> Result<Self, Exception> {
        Self::new(NoLimitTracker)
    }
}

impl<T: ResourceTracker> Interpreter<T> {
    /// Builds the builtin types, the builtins namespace and an empty `__main__`.
    ///
    /// # Errors
    /// Returns a MemoryError when the tracker refuses the bootstrap allocations.
    pub fn new(tracker: T) -> Result<Self, Exception> {
        let mut heap = Heap::new(INITIAL_HEAP_CAPACITY, tracker);
        let rt = Runtime::new(&mut heap).map_err(resource_exception)?;
        let main = match Self::main_namespace(&mut heap) {
            Ok(main) => main,
            Err(err) => {
                rt.release(&mut heap);
                return Err(resource_exception(err));
            }
        };
        Ok(Self { heap, rt, main })
    }

    fn main_namespace(heap: &mut Heap<T>) -> Result<HeapId, crate::resource::ResourceError> {
        let main = heap.alloc_dict()?;
        let named = heap.alloc_str("__main__").and_then(|name| heap.dict_set_str(main, "__name__", name));
        if let Err(err) = named {
            heap.dec_ref(main);
            return Err(err);
        }
        Ok(main)
    }

    /// Makes `code` importable as `name`. It runs on the first `import name`.
    ///
    /// Registering over a module that was already imported replaces the loaded module.
    ///
    /// # Errors
    /// Returns [`CodeError`] when the code object fails validation.
    pub fn register_module(&mut self, name: &str, code: Code) -> Result<(), CodeError> {
        code.validate()?;
        if let Some(ModuleSlot::Loaded(id)) = self.rt.modules.insert(name.to_owned(), ModuleSlot::Pending(Rc::new(code))) {
            self.heap.dec_ref(id);
        }
        Ok(())
    }

    /// Binds `name` in `__main__`.
    ///
    /// # Errors
    /// Returns an exception when the object cannot be an input or allocation fails.
    pub fn set_global(&mut self, name: &str, value: Object) -> Result<(), Exception> {
        let value = value
            .to_value(&mut self.heap)
            .map_err(|err| Exception::new(ExcType::TypeError, Some(err.to_string())))?;
        self.heap
            .dict_set_str(self.main, name, value)
            .map_err(resource_exception)
    }

    /// A copy of the global `name` from `__main__`.
    #[must_use]
    pub fn get_global(&mut self, name: &str) -> Option<Object> {
        let value = self.heap.dict_get_str(self.main, name)?.clone_with_heap(&self.heap);
        Some(Object::new(value, &mut self.heap, &self.rt))
    }

    /// Runs `code` in `__main__` and converts its return value.
    ///
    /// # Errors
    /// Returns the uncaught exception, with its traceback, when one escapes the code.
    pub fn execute(&mut self, code: &Code, print: &mut impl PrintWriter) -> Result<Object, Exception> {
        self.execute_traced(code, print, &mut NoopTracer)
    }

    /// Like [`execute`](Self::execute), reporting every instruction to `tracer`.
    ///
    /// # Errors
    /// Returns the uncaught exception, with its traceback, when one escapes the code.
    pub fn execute_traced(
        &mut self,
        code: &Code,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
    ) -> Result<Object, Exception> {
        code.validate()
            .map_err(|err| Exception::new(ExcType::SystemError, Some(err.to_string())))?;
        let mut vm = VM::new(&mut self.heap, &mut self.rt, print, tracer);
        let result = vm.run_code(Rc::new(code.clone()), self.main, self.main);
        let result = match result {
            Ok(value) => Ok(value),
            Err(RunError::Raised(info)) => Err(vm.into_public_exception(*info)),
            Err(RunError::Exc(exc) | RunError::Uncatchable(exc)) => Err(Exception::from(*exc)),
            Err(RunError::Internal(msg)) => Err(Exception::new(ExcType::SystemError, Some(msg.into_owned()))),
        };
        vm.run_finalizers();
        drop(vm);
        result.map(|value| Object::new(value, &mut self.heap, &self.rt))
    }

    /// Live objects by payload kind.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.heap_stats()
    }

    /// The resource tracker, for reading usage after a run.
    #[must_use]
    pub fn tracker(&self) -> &T {
        self.heap.tracker()
    }

    /// Drops `__main__`, the module table and the builtins, then counts what is left.
    ///
    /// A leak-free run leaves no live objects.
    #[cfg(feature = "ref-count-return")]
    #[must_use]
    pub fn into_leak_count(mut self) -> usize {
        self.heap.dec_ref(self.main);
        let mut vm = VM::new(&mut self.heap, &mut self.rt, &mut crate::io::NoPrint, &mut NoopTracer);
        vm.run_finalizers();
        drop(vm);
        let Self { mut heap, rt, .. } = self;
        rt.release(&mut heap);
        heap.entry_count()
    }
}

fn resource_exception(err: crate::resource::ResourceError) -> Exception {
    match RunError::from(err) {
        RunError::Exc(exc) | RunError::Uncatchable(exc) => Exception::from(*exc),
        _ => Exception::new(ExcType::MemoryError, None),
    }
}

/// One-shot convenience around [`Interpreter`]: holds a code object and runs it in a
/// fresh interpreter each time.
///
/// # Example
/// ```
/// use coil::{CodeBuilder, Const, Object, Opcode, Runner};
///
/// let mut b = CodeBuilder::new("<module>");
/// let c = b.add_const(Const::Str("hi".to_owned()));
/// b.emit_arg(Opcode::LoadConst, c);
/// b.emit(Opcode::ReturnValue);
/// let runner = Runner::new(b.build()).unwrap();
/// assert_eq!(runner.run_no_limits().unwrap(), Object::String("hi".to_owned()));
/// ```
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Runner {
    code: Code,
    /// Modules registered into each interpreter before the main code runs.
    modules: Vec<(String, Code)>,
}

impl Runner {
    /// Validates `code` and wraps it.
    ///
    /// # Errors
    /// Returns [`CodeError`] when the code object is malformed.
    pub fn new(code: Code) -> Result<Self, CodeError> {
        code.validate()?;
        Ok(Self {
            code,
            modules: Vec::new(),
        })
    }

    /// Parses a JSON code object, as written by [`Code::to_json`].
    ///
    /// # Errors
    /// Returns [`CodeError`] when the JSON is not a valid code object.
    pub fn from_json(json: &str) -> Result<Self, CodeError> {
        Self::new(Code::from_json(json)?)
    }

    /// Adds a module that the main code can import.
    ///
    /// # Errors
    /// Returns [`CodeError`] when the module's code object is malformed.
    pub fn with_module(mut self, name: impl Into<String>, code: Code) -> Result<Self, CodeError> {
        code.validate()?;
        self.modules.push((name.into(), code));
        Ok(self)
    }

    /// The main code object.
    #[must_use]
    pub fn code(&self) -> &Code {
        &self.code
    }

    /// Runs the code to completion under `tracker`, printing through `print`.
    ///
    /// # Errors
    /// Returns the uncaught exception.
    pub fn run(&self, tracker: impl ResourceTracker, print: &mut impl PrintWriter) -> Result<Object, Exception> {
        self.run_traced(tracker, print, &mut NoopTracer)
    }

    /// Like [`run`](Self::run) with a tracer attached.
    ///
    /// # Errors
    /// Returns the uncaught exception.
    pub fn run_traced(
        &self,
        tracker: impl ResourceTracker,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
    ) -> Result<Object, Exception> {
        let mut interp = Interpreter::new(tracker)?;
        for (name, code) in &self.modules {
            interp
                .register_module(name, code.clone())
                .map_err(|err| Exception::new(ExcType::SystemError, Some(err.to_string())))?;
        }
        interp.execute_traced(&self.code, print, tracer)
    }

    /// Runs with no limits, printing to stdout.
    ///
    /// # Errors
    /// Returns the uncaught exception.
    pub fn run_no_limits(&self) -> Result<Object, Exception> {
        self.run(NoLimitTracker, &mut StdPrint)
    }

    /// Serializes the runner to a binary format.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserializes a runner written by [`dump`](Self::dump).
    ///
    /// The code objects are validated again, since the bytes may come from anywhere.
    ///
    /// # Errors
    /// Returns an error if deserialization fails or a code object is malformed.
    pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
        let runner: Self = postcard::from_bytes(bytes)?;
        runner.code.validate()?;
        for (_, code) in &runner.modules {
            code.validate()?;
        }
        Ok(runner)
    }
}

/// Failure restoring a [`Runner`] from bytes.
#[derive(Debug)]
pub enum LoadError {
    Decode(postcard::Error),
    Code(CodeError),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "invalid runner data: {e}"),
            Self::Code(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<postcard::Error> for LoadError {
    fn from(err: postcard::Error) -> Self {
        Self::Decode(err)
    }
}

impl From<CodeError> for LoadError {
    fn from(err: CodeError) -> Self {
        Self::Code(err)
    }
}
