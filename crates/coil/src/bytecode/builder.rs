//! Builder for assembling code objects.
//!
//! `CodeBuilder` encodes opcodes and operands, patches forward jumps, interns
//! constants and names, records the line table, and computes the operand stack
//! size the code needs.

use super::{
    code::{Code, Const, LineEntry},
    op::{JumpKind, Opcode},
};

/// Builder for emitting bytecode.
///
/// # Usage
///
/// ```ignore
/// let mut builder = CodeBuilder::new("f");
/// builder.set_line(1);
/// let jump = builder.emit_jump(Opcode::PopJumpIfFalse);
/// // ... emit more code ...
/// builder.patch_jump(jump);
/// let code = builder.build();
/// ```
#[derive(Debug, Default)]
pub struct CodeBuilder {
    name: String,
    filename: String,
    flags: u32,
    arg_count: u32,
    bytecode: Vec<u8>,
    consts: Vec<Const>,
    names: Vec<String>,
    varnames: Vec<String>,
    first_line: u32,
    lines: Vec<LineEntry>,
    /// Overrides the computed stack size.
    stack_size: Option<u32>,
}

impl CodeBuilder {
    /// Creates a builder for code named `name` (`<module>` for module bodies).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: "<string>".to_owned(),
            ..Self::default()
        }
    }

    pub fn set_filename(&mut self, filename: impl Into<String>) {
        self.filename = filename.into();
    }

    /// Sets the `Code::NEWLOCALS`/`VARARGS`/... flag bits.
    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    /// Declares the positional parameters; they become the first varnames.
    pub fn set_args(&mut self, names: &[&str]) {
        for name in names {
            self.add_varname(name);
        }
        self.arg_count = u32::try_from(names.len()).expect("too many arguments");
    }

    /// Fixes the operand stack size instead of computing it in [`build`](Self::build).
    pub fn set_stack_size(&mut self, size: u32) {
        self.stack_size = Some(size);
    }

    /// Starts a new line table entry at the current offset.
    pub fn set_line(&mut self, line: u32) {
        if self.lines.is_empty() {
            self.first_line = line;
        }
        let ip = u32::try_from(self.bytecode.len()).expect("bytecode exceeds u32 range");
        match self.lines.last_mut() {
            Some(last) if last.ip == ip => last.line = line,
            Some(last) if last.line == line => {}
            _ => self.lines.push(LineEntry { ip, line }),
        }
    }

    /// Emits an opcode without an operand.
    pub fn emit(&mut self, op: Opcode) {
        debug_assert!(!op.has_arg(), "{op:?} needs an operand");
        self.bytecode.push(op as u8);
    }

    /// Emits an opcode with an operand, prefixing `ExtendedArg` when it exceeds 16 bits.
    pub fn emit_arg(&mut self, op: Opcode, arg: impl Into<u32>) {
        debug_assert!(op.has_arg(), "{op:?} takes no operand");
        let arg: u32 = arg.into();
        if arg > 0xFFFF {
            self.push_instruction(Opcode::ExtendedArg, (arg >> 16) as u16);
        }
        self.push_instruction(op, arg as u16);
    }

    /// Emits `CallFunction`-style opcodes: low byte positional count, high byte
    /// keyword pair count.
    pub fn emit_call(&mut self, op: Opcode, positional: u8, keywords: u8) {
        self.emit_arg(op, u32::from(positional) | (u32::from(keywords) << 8));
    }

    fn push_instruction(&mut self, op: Opcode, operand: u16) {
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
    }

    /// Emits a forward jump whose target is filled in by [`patch_jump`](Self::patch_jump).
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        debug_assert!(op.jump_kind().is_some(), "{op:?} is not a jump");
        let label = JumpLabel(self.bytecode.len());
        self.push_instruction(op, 0);
        label
    }

    /// Points a forward jump at the current offset.
    ///
    /// # Panics
    ///
    /// Panics if the target does not fit the 16-bit operand.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.bytecode.len();
        let op = Opcode::from_byte(self.bytecode[label.0]).expect("label points at an opcode");
        let operand = match op.jump_kind() {
            Some(JumpKind::Relative) => target - (label.0 + 3),
            _ => target,
        };
        let operand = u16::try_from(operand).expect("jump target exceeds u16 range; code too large");
        let bytes = operand.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a jump to a known target, typically backwards to a loop head.
    ///
    /// # Panics
    ///
    /// Panics for a relative jump to an earlier offset, which the encoding cannot express.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        let operand = match op.jump_kind() {
            Some(JumpKind::Relative) => target
                .checked_sub(self.bytecode.len() + 3)
                .expect("relative jumps can only go forward"),
            _ => target,
        };
        self.emit_arg(op, u32::try_from(operand).expect("jump target exceeds u32 range"));
    }

    /// Returns the current bytecode offset.
    ///
    /// Use this to record loop start positions for backward jumps.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Adds a constant to the pool, reusing an equal existing entry.
    #[must_use]
    pub fn add_const(&mut self, value: Const) -> u32 {
        let idx = match self.consts.iter().position(|c| *c == value) {
            Some(idx) => idx,
            None => {
                self.consts.push(value);
                self.consts.len() - 1
            }
        };
        u32::try_from(idx).expect("constant pool exceeds u32 range")
    }

    /// Adds a global/attribute name, reusing an existing entry.
    #[must_use]
    pub fn add_name(&mut self, name: &str) -> u32 {
        intern(&mut self.names, name)
    }

    /// Adds a local variable name, reusing an existing entry.
    pub fn add_varname(&mut self, name: &str) -> u32 {
        intern(&mut self.varnames, name)
    }

    /// Builds the final code object.
    #[must_use]
    pub fn build(self) -> Code {
        let stack_size = self.stack_size.unwrap_or_else(|| compute_stack_size(&self.bytecode));
        Code {
            name: self.name,
            filename: self.filename,
            flags: self.flags,
            stack_size,
            arg_count: self.arg_count,
            bytecode: self.bytecode,
            consts: self.consts,
            names: self.names,
            varnames: self.varnames,
            first_line: self.first_line,
            lines: self.lines,
        }
    }
}

fn intern(table: &mut Vec<String>, name: &str) -> u32 {
    let idx = match table.iter().position(|n| n == name) {
        Some(idx) => idx,
        None => {
            table.push(name.to_owned());
            table.len() - 1
        }
    };
    u32::try_from(idx).expect("name table exceeds u32 range")
}

/// Label for a forward jump that needs patching.
///
/// Stores the bytecode offset where the jump instruction was emitted.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

/// Net stack effect of an instruction on its fall-through path.
fn stack_effect(op: Opcode, arg: u32) -> i64 {
    let arg = i64::from(arg);
    let call_args = (arg & 0xFF) + 2 * ((arg >> 8) & 0xFF);
    match op {
        Opcode::Nop
        | Opcode::RotTwo
        | Opcode::RotThree
        | Opcode::RotFour
        | Opcode::UnaryPositive
        | Opcode::UnaryNegative
        | Opcode::UnaryNot
        | Opcode::UnaryConvert
        | Opcode::UnaryInvert
        | Opcode::Slice0
        | Opcode::GetIter
        | Opcode::PrintNewline
        | Opcode::BreakLoop
        | Opcode::PopBlock
        | Opcode::DeleteName
        | Opcode::LoadAttr
        | Opcode::JumpForward
        | Opcode::JumpIfFalseOrPop
        | Opcode::JumpIfTrueOrPop
        | Opcode::JumpAbsolute
        | Opcode::DeleteGlobal
        | Opcode::ContinueLoop
        | Opcode::SetupLoop
        | Opcode::SetupExcept
        | Opcode::SetupFinally
        | Opcode::DeleteFast
        | Opcode::ExtendedArg => 0,
        Opcode::DupTop
        | Opcode::LoadLocals
        | Opcode::ForIter
        | Opcode::LoadConst
        | Opcode::LoadName
        | Opcode::BuildMap
        | Opcode::ImportFrom
        | Opcode::LoadGlobal
        | Opcode::LoadFast => 1,
        Opcode::PopTop
        | Opcode::ListAppend
        | Opcode::Slice1
        | Opcode::Slice2
        | Opcode::DeleteSlice0
        | Opcode::BinarySubscr
        | Opcode::PrintExpr
        | Opcode::PrintItem
        | Opcode::PrintNewlineTo
        | Opcode::WithCleanup
        | Opcode::ReturnValue
        | Opcode::ImportStar
        | Opcode::StoreName
        | Opcode::DeleteAttr
        | Opcode::StoreGlobal
        | Opcode::CompareOp
        | Opcode::ImportName
        | Opcode::PopJumpIfFalse
        | Opcode::PopJumpIfTrue
        | Opcode::StoreFast
        | Opcode::BinaryPower
        | Opcode::BinaryMultiply
        | Opcode::BinaryDivide
        | Opcode::BinaryModulo
        | Opcode::BinaryAdd
        | Opcode::BinarySubtract
        | Opcode::BinaryFloorDivide
        | Opcode::BinaryTrueDivide
        | Opcode::BinaryLshift
        | Opcode::BinaryRshift
        | Opcode::BinaryAnd
        | Opcode::BinaryXor
        | Opcode::BinaryOr
        | Opcode::InplaceFloorDivide
        | Opcode::InplaceTrueDivide
        | Opcode::InplaceAdd
        | Opcode::InplaceSubtract
        | Opcode::InplaceMultiply
        | Opcode::InplaceDivide
        | Opcode::InplaceModulo
        | Opcode::InplacePower
        | Opcode::InplaceLshift
        | Opcode::InplaceRshift
        | Opcode::InplaceAnd
        | Opcode::InplaceXor
        | Opcode::InplaceOr => -1,
        Opcode::Slice3
        | Opcode::StoreSlice0
        | Opcode::DeleteSlice1
        | Opcode::DeleteSlice2
        | Opcode::StoreMap
        | Opcode::DeleteSubscr
        | Opcode::PrintItemTo
        | Opcode::BuildClass
        | Opcode::StoreAttr
        | Opcode::MapAdd => -2,
        Opcode::StoreSlice1 | Opcode::StoreSlice2 | Opcode::DeleteSlice3 | Opcode::StoreSubscr | Opcode::EndFinally => {
            -3
        }
        Opcode::StoreSlice3 => -4,
        Opcode::SetupWith => 4,
        Opcode::UnpackSequence => arg - 1,
        Opcode::DupTopx => arg,
        Opcode::BuildTuple | Opcode::BuildList => 1 - arg,
        Opcode::RaiseVarargs | Opcode::MakeFunction => -arg,
        Opcode::CallFunction => -call_args,
        Opcode::CallFunctionVar | Opcode::CallFunctionKw => -call_args - 1,
        Opcode::CallFunctionVarKw => -call_args - 2,
        Opcode::BuildSlice => {
            if arg == 3 {
                -2
            } else {
                -1
            }
        }
    }
}

/// Maximum operand stack depth over every path through the code.
///
/// Handler entry for `SetupExcept`/`SetupFinally` adds the three exception values;
/// the exhausted branch of `ForIter` pops the iterator. Undecodable code gets the depth
/// seen so far; the interpreter reports the bad instruction when it reaches it.
fn compute_stack_size(bytecode: &[u8]) -> u32 {
    const DEPTH_CAP: i64 = 1 << 16;
    let code = Code {
        name: String::new(),
        filename: String::new(),
        flags: 0,
        stack_size: 0,
        arg_count: 0,
        bytecode: bytecode.to_vec(),
        consts: Vec::new(),
        names: Vec::new(),
        varnames: Vec::new(),
        first_line: 0,
        lines: Vec::new(),
    };
    let Ok(instructions) = code.instructions().collect::<Result<Vec<_>, _>>() else {
        return 16;
    };
    let index_of = |offset: usize| instructions.binary_search_by_key(&offset, |i| i.offset).ok();

    let mut seen: Vec<Option<i64>> = vec![None; instructions.len()];
    let mut work = vec![(0usize, 0i64)];
    let mut max_depth = 0;
    while let Some((idx, depth)) = work.pop() {
        let Some(instruction) = instructions.get(idx) else { continue };
        if seen[idx].is_some_and(|d| d >= depth) || depth > DEPTH_CAP {
            continue;
        }
        seen[idx] = Some(depth);
        let arg = instruction.arg.unwrap_or(0);
        let after = (depth + stack_effect(instruction.opcode, arg)).max(0);
        max_depth = max_depth.max(after);
        if let Some(target) = instruction.jump_target().and_then(index_of) {
            let target_depth = match instruction.opcode {
                Opcode::ForIter => (depth - 1).max(0),
                Opcode::SetupExcept | Opcode::SetupFinally => depth + 3,
                _ => after,
            };
            max_depth = max_depth.max(target_depth);
            work.push((target, target_depth));
        }
        let falls_through = !matches!(
            instruction.opcode,
            Opcode::JumpAbsolute
                | Opcode::JumpForward
                | Opcode::ReturnValue
                | Opcode::RaiseVarargs
                | Opcode::BreakLoop
                | Opcode::ContinueLoop
        );
        if falls_through {
            work.push((idx + 1, after));
        }
    }
    u32::try_from(max_depth).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_basic() {
        let mut builder = CodeBuilder::new("f");
        builder.emit(Opcode::PopTop);
        builder.emit(Opcode::ReturnValue);
        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::PopTop as u8, Opcode::ReturnValue as u8]);
    }

    #[test]
    fn emit_u16_operand() {
        let mut builder = CodeBuilder::new("f");
        builder.emit_arg(Opcode::LoadConst, 0x1234u32);
        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::LoadConst as u8, 0x34, 0x12]);
    }

    #[test]
    fn wide_operand_uses_extended_arg() {
        let mut builder = CodeBuilder::new("f");
        builder.emit_arg(Opcode::LoadConst, 0x0002_0001u32);
        let code = builder.build();
        assert_eq!(
            code.bytecode(),
            &[Opcode::ExtendedArg as u8, 2, 0, Opcode::LoadConst as u8, 1, 0]
        );
    }

    #[test]
    fn forward_jumps_are_relative_or_absolute_per_opcode() {
        let mut builder = CodeBuilder::new("f");
        let rel = builder.emit_jump(Opcode::JumpForward);
        let abs = builder.emit_jump(Opcode::PopJumpIfFalse);
        builder.emit(Opcode::PopTop);
        builder.patch_jump(rel);
        builder.patch_jump(abs);
        let code = builder.build();
        // both target offset 7; the relative one counts from offset 3
        assert_eq!(&code.bytecode()[1..3], &[4, 0]);
        assert_eq!(&code.bytecode()[4..6], &[7, 0]);
    }

    #[test]
    fn constants_and_names_are_deduplicated() {
        let mut builder = CodeBuilder::new("f");
        let a = builder.add_const(Const::Int(1));
        let b = builder.add_const(Const::Str("x".to_owned()));
        let c = builder.add_const(Const::Int(1));
        assert_eq!((a, b, c), (0, 1, 0));
        assert_eq!(builder.add_name("x"), builder.add_name("x"));
    }

    #[test]
    fn stack_size_follows_the_deepest_path() {
        let mut builder = CodeBuilder::new("f");
        let one = builder.add_const(Const::Int(1));
        for _ in 0..3 {
            builder.emit_arg(Opcode::LoadConst, one);
        }
        builder.emit_arg(Opcode::BuildTuple, 3u32);
        builder.emit(Opcode::ReturnValue);
        assert_eq!(builder.build().stack_size(), 3);

        let mut builder = CodeBuilder::new("g");
        let setup = builder.emit_jump(Opcode::SetupFinally);
        builder.emit(Opcode::PopBlock);
        builder.patch_jump(setup);
        builder.emit(Opcode::EndFinally);
        let none = builder.add_const(Const::None);
        builder.emit_arg(Opcode::LoadConst, none);
        builder.emit(Opcode::ReturnValue);
        // the handler entry holds the exception triple
        assert_eq!(builder.build().stack_size(), 3);
    }
}
