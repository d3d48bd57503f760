//! Code objects: bytecode plus the tables it indexes into.
//!
//! Code enters the runtime already compiled, either assembled with
//! [`CodeBuilder`](super::CodeBuilder) or deserialized from JSON/postcard. Nothing here
//! touches the heap; constants are materialized into runtime values when the
//! interpreter first loads a code object.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

use super::op::{CompareOp, JumpKind, Opcode};
use crate::types::str::repr_bytes;

/// A compile-time constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    /// Integer outside the `i64` range, in decimal.
    BigInt(String),
    /// Byte string given as text.
    Str(String),
    /// Byte string that is not valid UTF-8.
    Bytes(Vec<u8>),
    Tuple(Vec<Const>),
    Code(Box<Code>),
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::BigInt(s) => f.write_str(s),
            Self::Str(s) => {
                let mut out = String::new();
                repr_bytes(s.as_bytes(), &mut out);
                f.write_str(&out)
            }
            Self::Bytes(b) => {
                let mut out = String::new();
                repr_bytes(b, &mut out);
                f.write_str(&out)
            }
            Self::Tuple(items) => {
                f.write_char('(')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_char(',')?;
                }
                f.write_char(')')
            }
            Self::Code(code) => write!(
                f,
                "<code object {}, file \"{}\", line {}>",
                code.name, code.filename, code.first_line
            ),
        }
    }
}

/// Maps a bytecode offset to the source line that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub ip: u32,
    pub line: u32,
}

/// A compiled code object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) filename: String,
    #[serde(default)]
    pub(crate) flags: u32,
    pub(crate) stack_size: u32,
    #[serde(default)]
    pub(crate) arg_count: u32,
    pub(crate) bytecode: Vec<u8>,
    #[serde(default)]
    pub(crate) consts: Vec<Const>,
    #[serde(default)]
    pub(crate) names: Vec<String>,
    #[serde(default)]
    pub(crate) varnames: Vec<String>,
    #[serde(default)]
    pub(crate) first_line: u32,
    /// Sorted by `ip`.
    #[serde(default)]
    pub(crate) lines: Vec<LineEntry>,
}

impl Code {
    /// Frames get a fresh locals dict instead of sharing the globals.
    pub const NEWLOCALS: u32 = 0x02;
    /// Excess positionals are collected into a tuple.
    pub const VARARGS: u32 = 0x04;
    /// Unmatched keywords are collected into a dict.
    pub const VARKEYWORDS: u32 = 0x08;
    /// The code is a generator body; the interpreter refuses to run it.
    pub const GENERATOR: u32 = 0x20;

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[inline]
    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size as usize
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.arg_count as usize
    }

    #[inline]
    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn consts(&self) -> &[Const] {
        &self.consts
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn varnames(&self) -> &[String] {
        &self.varnames
    }

    /// Source line of the instruction at `ip`, if the code has a line table.
    #[must_use]
    pub fn line_for(&self, ip: usize) -> Option<u32> {
        let idx = self.lines.partition_point(|e| e.ip as usize <= ip);
        if idx == 0 { None } else { Some(self.lines[idx - 1].line) }
    }

    /// Iterates the instructions in order, decoding operands.
    #[must_use]
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            bytecode: &self.bytecode,
            offset: 0,
            extended: 0,
        }
    }

    /// Checks that the bytecode decodes and every operand is in range.
    ///
    /// The interpreter does not require validation (it reports bad bytecode as
    /// `SystemError`), but hosts loading untrusted code objects should call this first.
    pub fn validate(&self) -> Result<(), CodeError> {
        let declared = self.arg_count()
            + usize::from(self.has_flag(Self::VARARGS))
            + usize::from(self.has_flag(Self::VARKEYWORDS));
        if declared > self.varnames.len() {
            return Err(CodeError::ArgCount {
                declared,
                varnames: self.varnames.len(),
            });
        }

        let mut boundaries = Vec::new();
        let mut jumps = Vec::new();
        for instruction in self.instructions() {
            let instruction = instruction?;
            boundaries.push(instruction.offset);
            let Some(arg) = instruction.arg else { continue };
            let index = arg as usize;
            let limit = match instruction.opcode {
                Opcode::LoadConst => Some((self.consts.len(), "constant")),
                Opcode::LoadName
                | Opcode::StoreName
                | Opcode::DeleteName
                | Opcode::LoadGlobal
                | Opcode::StoreGlobal
                | Opcode::DeleteGlobal
                | Opcode::LoadAttr
                | Opcode::StoreAttr
                | Opcode::DeleteAttr
                | Opcode::ImportName
                | Opcode::ImportFrom => Some((self.names.len(), "name")),
                Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => Some((self.varnames.len(), "varname")),
                Opcode::CompareOp => Some((CompareOp::ExcMatch as usize + 1, "compare op")),
                _ => None,
            };
            if let Some((len, table)) = limit
                && index >= len
            {
                return Err(CodeError::OperandOutOfRange {
                    offset: instruction.offset,
                    table,
                    index,
                });
            }
            if let Some(target) = instruction.jump_target() {
                jumps.push((instruction.offset, target));
            }
        }
        for (offset, target) in jumps {
            if boundaries.binary_search(&target).is_err() {
                return Err(CodeError::JumpTarget { offset, target });
            }
        }
        for constant in &self.consts {
            validate_nested(constant)?;
        }
        Ok(())
    }

    /// Human-readable listing in the style of Python's `dis` module.
    ///
    /// Nested code objects are listed after their parent.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out);
        out
    }

    fn disassemble_into(&self, out: &mut String) {
        let targets: Vec<usize> = self.instructions().flatten().filter_map(|i| i.jump_target()).collect();
        let mut last_line = None;
        for instruction in self.instructions() {
            let instruction = match instruction {
                Ok(i) => i,
                Err(err) => {
                    let _ = writeln!(out, "    <{err}>");
                    break;
                }
            };
            let line = self.line_for(instruction.offset);
            if line.is_some() && line != last_line {
                if last_line.is_some() {
                    out.push('\n');
                }
                let _ = write!(out, "{:>4}", line.unwrap_or_default());
                last_line = line;
            } else {
                out.push_str("    ");
            }
            let marker = if targets.contains(&instruction.offset) { ">>" } else { "  " };
            let _ = write!(out, "    {marker} {:>4} {:<20}", instruction.offset, instruction.opcode.to_string());
            if let Some(arg) = instruction.arg {
                let _ = write!(out, " {arg:>5}");
                if let Some(detail) = self.operand_detail(&instruction) {
                    let _ = write!(out, " ({detail})");
                }
            }
            out.push('\n');
        }
        for constant in &self.consts {
            if let Const::Code(nested) = constant {
                let _ = writeln!(out, "\nDisassembly of {}:", nested.name);
                nested.disassemble_into(out);
            }
        }
    }

    fn operand_detail(&self, instruction: &Instruction) -> Option<String> {
        let index = instruction.arg? as usize;
        match instruction.opcode {
            Opcode::LoadConst => self.consts.get(index).map(ToString::to_string),
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => self.varnames.get(index).cloned(),
            Opcode::CompareOp => CompareOp::from_repr(index as u8).map(|op| op.to_string()),
            Opcode::JumpForward | Opcode::ForIter | Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally
            | Opcode::SetupWith => instruction.jump_target().map(|t| format!("to {t}")),
            op if op.jump_kind().is_some() || !op.has_arg() => None,
            Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::LoadAttr
            | Opcode::StoreAttr
            | Opcode::DeleteAttr
            | Opcode::ImportName
            | Opcode::ImportFrom => self.names.get(index).cloned(),
            _ => None,
        }
    }

    /// Serializes to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, CodeError> {
        serde_json::to_string_pretty(self).map_err(|e| CodeError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CodeError> {
        serde_json::from_str(json).map_err(|e| CodeError::Serialization(e.to_string()))
    }

    /// Serializes to the compact postcard binary format.
    pub fn to_postcard(&self) -> Result<Vec<u8>, CodeError> {
        postcard::to_allocvec(self).map_err(|e| CodeError::Serialization(e.to_string()))
    }

    pub fn from_postcard(bytes: &[u8]) -> Result<Self, CodeError> {
        postcard::from_bytes(bytes).map_err(|e| CodeError::Serialization(e.to_string()))
    }
}

fn validate_nested(constant: &Const) -> Result<(), CodeError> {
    match constant {
        Const::Code(code) => code.validate().map_err(|source| CodeError::Nested {
            name: code.name.clone(),
            source: Box::new(source),
        }),
        Const::Tuple(items) => items.iter().try_for_each(validate_nested),
        _ => Ok(()),
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: Opcode,
    /// Operand, including the high bits from a preceding `ExtendedArg`.
    pub arg: Option<u32>,
}

impl Instruction {
    /// Offset of the instruction that follows this one.
    #[must_use]
    pub fn next_offset(&self) -> usize {
        self.offset + self.opcode.size()
    }

    /// Absolute jump target for jumping opcodes.
    #[must_use]
    pub fn jump_target(&self) -> Option<usize> {
        let arg = self.arg? as usize;
        match self.opcode.jump_kind()? {
            JumpKind::Relative => Some(self.next_offset() + arg),
            JumpKind::Absolute => Some(arg),
        }
    }
}

/// Iterator over the instructions of a code object.
#[derive(Debug)]
pub struct Instructions<'a> {
    bytecode: &'a [u8],
    offset: usize,
    extended: u32,
}

impl Iterator for Instructions<'_> {
    type Item = Result<Instruction, CodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset;
        let &byte = self.bytecode.get(offset)?;
        let Some(opcode) = Opcode::from_byte(byte) else {
            self.offset = self.bytecode.len();
            return Some(Err(CodeError::UnknownOpcode { offset, byte }));
        };
        if !opcode.has_arg() {
            self.offset += 1;
            return Some(Ok(Instruction {
                offset,
                opcode,
                arg: None,
            }));
        }
        let Some(operand) = self.bytecode.get(offset + 1..offset + 3) else {
            self.offset = self.bytecode.len();
            return Some(Err(CodeError::TruncatedOperand { offset }));
        };
        let arg = (self.extended << 16) | u32::from(u16::from_le_bytes([operand[0], operand[1]]));
        self.extended = if opcode == Opcode::ExtendedArg { arg } else { 0 };
        self.offset += 3;
        Some(Ok(Instruction {
            offset,
            opcode,
            arg: Some(arg),
        }))
    }
}

/// Error in a code object, found by [`Code::validate`] or while deserializing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    UnknownOpcode { offset: usize, byte: u8 },
    TruncatedOperand { offset: usize },
    OperandOutOfRange { offset: usize, table: &'static str, index: usize },
    JumpTarget { offset: usize, target: usize },
    ArgCount { declared: usize, varnames: usize },
    Nested { name: String, source: Box<CodeError> },
    Serialization(String),
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { offset, byte } => write!(f, "unknown opcode {byte} at offset {offset}"),
            Self::TruncatedOperand { offset } => write!(f, "truncated operand at offset {offset}"),
            Self::OperandOutOfRange { offset, table, index } => {
                write!(f, "{table} index {index} out of range at offset {offset}")
            }
            Self::JumpTarget { offset, target } => {
                write!(f, "jump at offset {offset} targets {target}, which is not an instruction")
            }
            Self::ArgCount { declared, varnames } => {
                write!(f, "code declares {declared} arguments but only {varnames} varnames")
            }
            Self::Nested { name, source } => write!(f, "in nested code '{name}': {source}"),
            Self::Serialization(msg) => write!(f, "invalid code object: {msg}"),
        }
    }
}

impl std::error::Error for CodeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeBuilder;

    fn sample() -> Code {
        let mut b = CodeBuilder::new("<module>");
        b.set_line(1);
        let one = b.add_const(Const::Int(1));
        b.emit_arg(Opcode::LoadConst, one);
        let x = b.add_name("x");
        b.emit_arg(Opcode::StoreName, x);
        b.set_line(2);
        let none = b.add_const(Const::None);
        b.emit_arg(Opcode::LoadConst, none);
        b.emit(Opcode::ReturnValue);
        b.build()
    }

    #[test]
    fn line_table_lookup() {
        let code = sample();
        assert_eq!(code.line_for(0), Some(1));
        assert_eq!(code.line_for(3), Some(1));
        assert_eq!(code.line_for(6), Some(2));
    }

    #[test]
    fn validate_rejects_bad_operands() {
        let mut code = sample();
        assert_eq!(code.validate(), Ok(()));
        code.bytecode[1] = 9;
        assert!(matches!(
            code.validate(),
            Err(CodeError::OperandOutOfRange { table: "constant", .. })
        ));
        code.bytecode = vec![0xFF];
        assert_eq!(code.validate(), Err(CodeError::UnknownOpcode { offset: 0, byte: 0xFF }));
        code.bytecode = vec![Opcode::LoadConst as u8, 0];
        assert_eq!(code.validate(), Err(CodeError::TruncatedOperand { offset: 0 }));
    }

    #[test]
    fn extended_arg_widens_the_next_operand() {
        let code = Code {
            bytecode: vec![Opcode::ExtendedArg as u8, 1, 0, Opcode::JumpAbsolute as u8, 2, 0],
            ..sample()
        };
        let decoded: Vec<_> = code.instructions().collect::<Result<_, _>>().expect("decodes");
        assert_eq!(decoded[1].arg, Some(0x1_0002));
    }

    #[test]
    fn disassembly_lists_operands() {
        let text = sample().disassemble();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].contains("LOAD_CONST"), "{text}");
        assert!(lines[0].ends_with("(1)"), "{text}");
        assert!(lines[1].ends_with("(x)"), "{text}");
        assert!(text.contains("RETURN_VALUE"));
    }

    #[test]
    fn json_and_postcard_round_trip() {
        let code = sample();
        assert_eq!(Code::from_json(&code.to_json().expect("json")).expect("parse"), code);
        assert_eq!(
            Code::from_postcard(&code.to_postcard().expect("postcard")).expect("parse"),
            code
        );
        assert!(matches!(Code::from_json("{}"), Err(CodeError::Serialization(_))));
    }
}
