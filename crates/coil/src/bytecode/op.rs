//! Opcode definitions.
//!
//! Numbering follows the Python 2.7 instruction set so code objects produced for
//! that interpreter can be loaded unchanged. Opcodes below [`HAVE_ARGUMENT`] are one
//! byte long; the rest carry a little-endian `u16` operand, widened by a preceding
//! `ExtendedArg`.

use strum::{Display, FromRepr, IntoStaticStr};

/// First opcode that carries an operand.
pub const HAVE_ARGUMENT: u8 = 90;

/// Bytecode opcodes.
///
/// The `Display`/`Into<&'static str>` form is the disassembler mnemonic
/// (`LOAD_CONST`, `SLICE+1`, ...); `Debug` gives the variant name used by tracers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    RotFour = 5,
    Nop = 9,
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryConvert = 13,
    UnaryInvert = 15,
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryDivide = 21,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    InplaceFloorDivide = 28,
    InplaceTrueDivide = 29,
    #[strum(serialize = "SLICE+0")]
    Slice0 = 30,
    #[strum(serialize = "SLICE+1")]
    Slice1 = 31,
    #[strum(serialize = "SLICE+2")]
    Slice2 = 32,
    #[strum(serialize = "SLICE+3")]
    Slice3 = 33,
    #[strum(serialize = "STORE_SLICE+0")]
    StoreSlice0 = 40,
    #[strum(serialize = "STORE_SLICE+1")]
    StoreSlice1 = 41,
    #[strum(serialize = "STORE_SLICE+2")]
    StoreSlice2 = 42,
    #[strum(serialize = "STORE_SLICE+3")]
    StoreSlice3 = 43,
    #[strum(serialize = "DELETE_SLICE+0")]
    DeleteSlice0 = 50,
    #[strum(serialize = "DELETE_SLICE+1")]
    DeleteSlice1 = 51,
    #[strum(serialize = "DELETE_SLICE+2")]
    DeleteSlice2 = 52,
    #[strum(serialize = "DELETE_SLICE+3")]
    DeleteSlice3 = 53,
    StoreMap = 54,
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    InplaceDivide = 58,
    InplaceModulo = 59,
    StoreSubscr = 60,
    DeleteSubscr = 61,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    InplacePower = 67,
    GetIter = 68,
    PrintExpr = 70,
    PrintItem = 71,
    PrintNewline = 72,
    PrintItemTo = 73,
    PrintNewlineTo = 74,
    InplaceLshift = 75,
    InplaceRshift = 76,
    InplaceAnd = 77,
    InplaceXor = 78,
    InplaceOr = 79,
    BreakLoop = 80,
    WithCleanup = 81,
    LoadLocals = 82,
    ReturnValue = 83,
    ImportStar = 84,
    PopBlock = 87,
    EndFinally = 88,
    BuildClass = 89,
    // ==== opcodes with an operand ====
    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    ForIter = 93,
    ListAppend = 94,
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    DupTopx = 99,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    ImportName = 108,
    ImportFrom = 109,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    ContinueLoop = 119,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    BuildSlice = 133,
    CallFunctionVar = 140,
    CallFunctionKw = 141,
    CallFunctionVarKw = 142,
    SetupWith = 143,
    ExtendedArg = 145,
    MapAdd = 147,
}

/// How an opcode's operand addresses its jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// Offset from the start of the next instruction.
    Relative,
    /// Absolute byte offset.
    Absolute,
}

impl Opcode {
    /// Decodes an opcode byte, `None` for bytes outside the instruction set.
    #[inline]
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    /// Whether the opcode is followed by a two-byte operand.
    #[inline]
    #[must_use]
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    /// Encoded size of the instruction in bytes.
    #[inline]
    #[must_use]
    pub fn size(self) -> usize {
        if self.has_arg() { 3 } else { 1 }
    }

    /// How the operand encodes a jump target, for jumping opcodes.
    #[must_use]
    pub fn jump_kind(self) -> Option<JumpKind> {
        match self {
            Self::JumpForward
            | Self::ForIter
            | Self::SetupLoop
            | Self::SetupExcept
            | Self::SetupFinally
            | Self::SetupWith => Some(JumpKind::Relative),
            Self::JumpAbsolute
            | Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop
            | Self::ContinueLoop => Some(JumpKind::Absolute),
            _ => None,
        }
    }
}

/// Operand of `CompareOp`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display, IntoStaticStr)]
pub enum CompareOp {
    #[strum(serialize = "<")]
    Lt = 0,
    #[strum(serialize = "<=")]
    Le = 1,
    #[strum(serialize = "==")]
    Eq = 2,
    #[strum(serialize = "!=")]
    Ne = 3,
    #[strum(serialize = ">")]
    Gt = 4,
    #[strum(serialize = ">=")]
    Ge = 5,
    #[strum(serialize = "in")]
    In = 6,
    #[strum(serialize = "not in")]
    NotIn = 7,
    #[strum(serialize = "is")]
    Is = 8,
    #[strum(serialize = "is not")]
    IsNot = 9,
    #[strum(serialize = "exception match")]
    ExcMatch = 10,
}

impl CompareOp {
    /// The rich comparison method and its reflection, for the ordering operators.
    #[must_use]
    pub fn dunder(self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Lt => Some(("__lt__", "__gt__")),
            Self::Le => Some(("__le__", "__ge__")),
            Self::Eq => Some(("__eq__", "__eq__")),
            Self::Ne => Some(("__ne__", "__ne__")),
            Self::Gt => Some(("__gt__", "__lt__")),
            Self::Ge => Some(("__ge__", "__le__")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_matches_python27() {
        assert_eq!(Opcode::LoadConst as u8, 100);
        assert_eq!(Opcode::SetupFinally as u8, 122);
        assert_eq!(Opcode::from_byte(83), Some(Opcode::ReturnValue));
        assert_eq!(Opcode::from_byte(0), None);
        assert_eq!(Opcode::from_byte(86), None);
    }

    #[test]
    fn mnemonics() {
        assert_eq!(Opcode::LoadConst.to_string(), "LOAD_CONST");
        assert_eq!(Opcode::Slice2.to_string(), "SLICE+2");
        assert_eq!(Opcode::DupTopx.to_string(), "DUP_TOPX");
        assert_eq!(CompareOp::NotIn.to_string(), "not in");
    }

    #[test]
    fn operand_sizes() {
        assert!(!Opcode::BuildClass.has_arg());
        assert!(Opcode::StoreName.has_arg());
        assert_eq!(Opcode::CallFunction.size(), 3);
        assert_eq!(Opcode::SetupWith.jump_kind(), Some(JumpKind::Relative));
        assert_eq!(Opcode::ContinueLoop.jump_kind(), Some(JumpKind::Absolute));
    }
}
