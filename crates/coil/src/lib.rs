#![doc = include_str!("../../../README.md")]
#![expect(clippy::needless_pass_by_value, reason = "owned values are consumed on every path")]
#![expect(clippy::unnecessary_wraps, reason = "native method signatures are uniform")]
#![expect(clippy::unused_self, reason = "vm helpers keep method shape")]
#![expect(clippy::type_complexity, reason = "argument tuples are intentionally rich")]
// first to include defer_drop macro
mod heap;

mod args;
mod bytecode;
mod exception_private;
mod exception_public;
mod io;
mod object;
mod resource;
mod run;
mod runtime;
pub mod tracer;
mod types;
mod value;

pub use crate::{
    bytecode::{
        Code, CodeBuilder, CodeError, CompareOp, Const, HAVE_ARGUMENT, Instruction, Instructions, JumpKind, JumpLabel,
        LineEntry, Opcode,
    },
    exception_private::ExcType,
    exception_public::{Exception, StackFrame},
    heap::HeapStats,
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::{DictPairs, InvalidInputError, Object},
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LARGE_RESULT_THRESHOLD, LimitedTracker, NoLimitTracker, ResourceError,
        ResourceLimits, ResourceTracker,
    },
    run::{Interpreter, LoadError, Runner},
    tracer::{NoopTracer, ProfilingReport, ProfilingTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
};
