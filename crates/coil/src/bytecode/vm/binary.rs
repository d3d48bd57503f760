//! Arithmetic: the int fast paths, sequence concatenation and repetition, and dunder
//! dispatch with the reflected fallback.

use super::VM;
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::{LARGE_RESULT_THRESHOLD, ResourceTracker},
    tracer::VmTracer,
    types::Int,
    value::Value,
};

/// Binary arithmetic operators, shared by the binary and in-place opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Classic `/`; floor division on integers.
    Div,
    FloorDiv,
    TrueDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    And,
    Xor,
    Or,
}

impl BinaryOp {
    /// Operator as shown in `unsupported operand type(s)` messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div | Self::TrueDiv => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "** or pow()",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::And => "&",
            Self::Xor => "^",
            Self::Or => "|",
        }
    }

    /// `(method, reflected method, in-place method)`.
    #[must_use]
    pub fn dunders(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::Add => ("__add__", "__radd__", "__iadd__"),
            Self::Sub => ("__sub__", "__rsub__", "__isub__"),
            Self::Mul => ("__mul__", "__rmul__", "__imul__"),
            Self::Div => ("__div__", "__rdiv__", "__idiv__"),
            Self::FloorDiv => ("__floordiv__", "__rfloordiv__", "__ifloordiv__"),
            Self::TrueDiv => ("__truediv__", "__rtruediv__", "__itruediv__"),
            Self::Mod => ("__mod__", "__rmod__", "__imod__"),
            Self::Pow => ("__pow__", "__rpow__", "__ipow__"),
            Self::LShift => ("__lshift__", "__rlshift__", "__ilshift__"),
            Self::RShift => ("__rshift__", "__rrshift__", "__irshift__"),
            Self::And => ("__and__", "__rand__", "__iand__"),
            Self::Xor => ("__xor__", "__rxor__", "__ixor__"),
            Self::Or => ("__or__", "__ror__", "__ior__"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum UnaryOp {
    Pos,
    Neg,
    Invert,
}

impl UnaryOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Pos => "+",
            Self::Neg => "-",
            Self::Invert => "~",
        }
    }

    #[must_use]
    pub fn dunder(self) -> &'static str {
        match self {
            Self::Pos => "__pos__",
            Self::Neg => "__neg__",
            Self::Invert => "__invert__",
        }
    }
}

/// Which builtin sequence a repetition or concatenation produces.
#[derive(Clone, Copy)]
enum SeqKind {
    Str,
    Tuple,
    List,
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `lhs op rhs`: builtin fast path, then `lhs.__op__(rhs)`, then `rhs.__rop__(lhs)`.
    pub(crate) fn binary_op(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        if let Some(result) = self.builtin_binary(op, lhs, rhs)? {
            return Ok(result);
        }
        let (name, rname, _) = op.dunders();
        if let Some(result) = self.try_binary_dunder(lhs, name, rhs)? {
            return Ok(result);
        }
        let lhs_type = self.type_of(lhs);
        if self.type_of(rhs) != lhs_type
            && let Some(result) = self.try_binary_dunder(rhs, rname, lhs)?
        {
            return Ok(result);
        }
        Err(ExcType::binary_type_error(
            op.symbol(),
            &self.type_name(lhs),
            &self.type_name(rhs),
        ))
    }

    /// In-place operators: `list +=` extends in place, then an instance's `__iop__`,
    /// then the plain binary operator.
    pub(crate) fn inplace_op(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        if op == BinaryOp::Add
            && let Value::Ref(id) = lhs
            && matches!(self.heap.get(*id), HeapData::List(_))
        {
            let items = self.collect(rhs)?;
            self.list_extend_items(*id, items)?;
            return Ok(lhs.clone_with_heap(self.heap));
        }
        if self.is_instance_value(lhs) {
            let (_, _, iname) = op.dunders();
            if let Some(result) = self.try_binary_dunder(lhs, iname, rhs)? {
                return Ok(result);
            }
        }
        self.binary_op(op, lhs, rhs)
    }

    /// Calls `obj.name(other)`; `None` when the method is missing or returns `NotImplemented`.
    fn try_binary_dunder(&mut self, obj: &Value, name: &str, other: &Value) -> RunResult<Option<Value>> {
        let arg = other.clone_with_heap(self.heap);
        match self.call_method(obj, name, ArgValues::one(arg))? {
            Some(Value::NotImplemented) | None => Ok(None),
            Some(result) => Ok(Some(result)),
        }
    }

    /// Arithmetic on builtin payloads without any dispatch. `Ok(None)` when the operand
    /// types have no builtin meaning for `op`.
    pub(crate) fn builtin_binary(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> RunResult<Option<Value>> {
        if let (Some(a), Some(b)) = (Int::from_value(lhs, self.heap), Int::from_value(rhs, self.heap)) {
            let result = match op {
                BinaryOp::Add => a.add(&b),
                BinaryOp::Sub => a.sub(&b),
                BinaryOp::Mul => a.mul(&b),
                BinaryOp::Div | BinaryOp::FloorDiv => a.floordiv(&b)?,
                BinaryOp::TrueDiv => return Ok(None),
                BinaryOp::Mod => a.modulo(&b)?,
                BinaryOp::Pow => a.pow(&b, self.heap.tracker())?,
                BinaryOp::LShift => a.lshift(&b, self.heap.tracker())?,
                BinaryOp::RShift => a.rshift(&b)?,
                BinaryOp::And => a.and(&b),
                BinaryOp::Xor => a.xor(&b),
                BinaryOp::Or => a.or(&b),
            };
            return Ok(Some(result.into_value(self.heap)?));
        }
        match op {
            BinaryOp::Add => self.concat(lhs, rhs),
            BinaryOp::Mul => {
                if let Some(count) = Int::from_value(rhs, self.heap) {
                    self.repeat(lhs, count.saturating_i64())
                } else if let Some(count) = Int::from_value(lhs, self.heap) {
                    self.repeat(rhs, count.saturating_i64())
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    fn seq_kind(&self, value: &Value) -> Option<SeqKind> {
        let Value::Ref(id) = value else { return None };
        match self.heap.get(*id) {
            HeapData::Str(_) => Some(SeqKind::Str),
            HeapData::Tuple(_) => Some(SeqKind::Tuple),
            HeapData::List(_) => Some(SeqKind::List),
            _ => None,
        }
    }

    pub(crate) fn check_result_size(&self, items: usize, item_size: usize) -> RunResult<()> {
        let estimated = items.saturating_mul(item_size);
        if estimated > LARGE_RESULT_THRESHOLD {
            self.heap.tracker().check_large_result(estimated)?;
        }
        Ok(())
    }

    fn concat(&mut self, lhs: &Value, rhs: &Value) -> RunResult<Option<Value>> {
        let (Some(a), Some(b)) = (self.seq_kind(lhs), self.seq_kind(rhs)) else {
            return Ok(None);
        };
        match (a, b) {
            (SeqKind::Str, SeqKind::Str) => {
                let (x, y) = (self.str_of(lhs), self.str_of(rhs));
                self.check_result_size(x.len() + y.len(), 1)?;
                let mut bytes = Vec::with_capacity(x.len() + y.len());
                bytes.extend_from_slice(x);
                bytes.extend_from_slice(y);
                Ok(Some(self.heap.alloc_bytes(bytes)?))
            }
            (SeqKind::Tuple, SeqKind::Tuple) | (SeqKind::List, SeqKind::List) => {
                let mut items = self.heap.clone_sequence_items(lhs).unwrap_or_default();
                items.extend(self.heap.clone_sequence_items(rhs).unwrap_or_default());
                let result = if matches!(a, SeqKind::Tuple) {
                    self.heap.alloc_tuple(items)?
                } else {
                    self.heap.alloc_list(items)?
                };
                Ok(Some(result))
            }
            _ => Ok(None),
        }
    }

    fn repeat(&mut self, seq: &Value, count: i64) -> RunResult<Option<Value>> {
        let Some(kind) = self.seq_kind(seq) else {
            return Ok(None);
        };
        let count = usize::try_from(count).unwrap_or(0);
        match kind {
            SeqKind::Str => {
                let bytes = self.str_of(seq);
                self.check_result_size(bytes.len(), count)?;
                let repeated = bytes.repeat(count);
                Ok(Some(self.heap.alloc_bytes(repeated)?))
            }
            SeqKind::Tuple | SeqKind::List => {
                let len = self.heap.sequence_items(seq).map_or(0, <[Value]>::len);
                self.check_result_size(len.saturating_mul(count), size_of::<Value>())?;
                let mut items = Vec::with_capacity(len * count);
                for _ in 0..count {
                    items.extend(self.heap.clone_sequence_items(seq).unwrap_or_default());
                }
                let result = if matches!(kind, SeqKind::Tuple) {
                    self.heap.alloc_tuple(items)?
                } else {
                    self.heap.alloc_list(items)?
                };
                Ok(Some(result))
            }
        }
    }

    /// `+x`, `-x`, `~x`.
    pub(crate) fn unary_op(&mut self, op: UnaryOp, value: &Value) -> RunResult<Value> {
        if let Some(result) = self.builtin_unary(op, value)? {
            return Ok(result);
        }
        match self.call_method(value, op.dunder(), ArgValues::empty())? {
            Some(result) => Ok(result),
            None => Err(ExcType::unary_type_error(op.symbol(), &self.type_name(value))),
        }
    }

    pub(crate) fn builtin_unary(&mut self, op: UnaryOp, value: &Value) -> RunResult<Option<Value>> {
        let Some(int) = Int::from_value(value, self.heap) else {
            return Ok(None);
        };
        let result = match op {
            UnaryOp::Pos => int,
            UnaryOp::Neg => int.neg(),
            UnaryOp::Invert => int.invert(),
        };
        Ok(Some(result.into_value(self.heap)?))
    }

    /// Appends already-owned items to a list, charging each insert to the tracker.
    pub(crate) fn list_extend_items(&mut self, list_id: HeapId, items: Vec<Value>) -> RunResult<()> {
        let mut items = items.into_iter();
        while let Some(item) = items.next() {
            if let Err(err) = self.heap.on_container_insert() {
                item.drop_with_heap(self.heap);
                items.drop_with_heap(self.heap);
                return Err(err.into());
            }
            match self.heap.get_mut(list_id) {
                HeapData::List(list) => list.append(item),
                _ => item.drop_with_heap(self.heap),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflected_names_line_up() {
        assert_eq!(BinaryOp::Sub.dunders(), ("__sub__", "__rsub__", "__isub__"));
        assert_eq!(BinaryOp::Pow.symbol(), "** or pow()");
        assert_eq!(UnaryOp::Invert.dunder(), "__invert__");
    }
}
