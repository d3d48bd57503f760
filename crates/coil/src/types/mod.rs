//! Heap payloads of the builtin types.
//!
//! These modules hold data and the algorithms that need no interpreter access (hashing,
//! searching, digit arithmetic, slice normalization). Anything that can call back into
//! user code lives in `bytecode::vm`.

pub(crate) mod class;
pub(crate) mod dict;
pub(crate) mod function;
pub(crate) mod int;
pub(crate) mod iter;
pub(crate) mod list;
pub(crate) mod module;
pub(crate) mod slice;
pub(crate) mod str;
pub(crate) mod traceback;
pub(crate) mod tuple;

pub(crate) use class::{Instance, InstanceAttrs, Layout, TypeObject};
pub(crate) use dict::{Dict, DictCursor, DictSlot, Lookup};
pub(crate) use function::{CodeObject, Function, Method, NativeFunction};
pub(crate) use int::{Int, LongInt};
pub(crate) use iter::{DictIter, DictIterKind, SeqIter};
pub(crate) use list::List;
pub(crate) use module::Module;
pub(crate) use slice::{Slice, SliceIndices};
pub(crate) use str::Str;
pub(crate) use traceback::Traceback;
pub(crate) use tuple::Tuple;

/// Python 2's tuple hash over already computed element hashes.
#[must_use]
pub(crate) fn tuple_hash(hashes: &[i64]) -> i64 {
    let mut x: i64 = 0x0034_5678;
    let mut mult: i64 = 1_000_003;
    let mut remaining = hashes.len() as i64;
    for &y in hashes {
        remaining -= 1;
        x = (x ^ y).wrapping_mul(mult);
        mult = mult.wrapping_add(82520 + remaining + remaining);
    }
    x = x.wrapping_add(97531);
    if x == -1 { -2 } else { x }
}
