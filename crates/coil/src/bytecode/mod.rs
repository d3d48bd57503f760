//! Bytecode layer.
//!
//! # Module Structure
//!
//! - `op` - opcode numbering (Python 2.7 instruction set) and comparison operands
//! - `code` - code objects, constants, line tables, validation and disassembly
//! - `builder` - `CodeBuilder` for assembling code objects from Rust
//! - `vm` - the interpreter: frames, dispatch loop, block-stack unwinding, natives

pub use builder::{CodeBuilder, JumpLabel};
pub use code::{Code, CodeError, Const, Instruction, Instructions, LineEntry};
pub use op::{CompareOp, HAVE_ARGUMENT, JumpKind, Opcode};
pub(crate) use vm::{VM, natives::NativeId};

mod builder;
mod code;
mod op;
pub(crate) mod vm;
