//! Functions implemented in Rust.
//!
//! Every native is identified by a [`NativeId`]. Type objects get their method
//! dictionaries from the static tables below at interpreter start; the builtins
//! namespace gets [`BUILTIN_FUNCTIONS`]. Calls land in [`VM::call_native`], which splits
//! off `self` and routes to the implementation in the submodule for the type.

mod builtins;
mod dict;
mod exception;
mod int;
mod object;
mod sequence;
mod str;

use super::{
    VM,
    binary::{BinaryOp, UnaryOp},
};
use crate::{
    args::ArgValues,
    bytecode::CompareOp,
    exception_private::{ExcType, RunResult},
    heap::DropWithHeap,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{DictIterKind, str::Justify},
    value::Value,
};

/// Identity of a native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum NativeId {
    // builtins namespace
    Id,
    Len,
    Hash,
    GetAttr,
    SetAttr,
    HasAttr,
    DelAttr,
    IsInstance,
    IsSubclass,
    Repr,
    Next,
    Range,
    Iter,
    // object
    ObjectInit,
    ObjectHash,
    ObjectStr,
    ObjectRepr,
    ObjectGetAttr,
    ObjectSetAttr,
    ObjectDelAttr,
    ObjectEq,
    ObjectNe,
    // protocol methods shared by the builtin types
    DunderLen,
    DunderGetItem,
    DunderSetItem,
    DunderDelItem,
    DunderContains,
    DunderIter,
    DunderNonzero,
    Binary(BinaryOp),
    Unary(UnaryOp),
    RichCompare(CompareOp),
    IterNext,
    IterSelf,
    // int, bool
    IntNew,
    BoolNew,
    IntBitLength,
    // str
    StrNew,
    StrJoin,
    StrFind,
    StrRFind,
    StrIndex,
    StrRIndex,
    StrStartsWith,
    StrEndsWith,
    StrLJust,
    StrRJust,
    StrCenter,
    StrSplit,
    StrStrip,
    StrUpper,
    StrLower,
    StrReplace,
    // tuple, list
    TupleNew,
    ListNew,
    ListAppend,
    ListInsert,
    ListExtend,
    ListPop,
    ListRemove,
    ListReverse,
    ListSort,
    SeqIndex,
    SeqCount,
    // dict
    DictNew,
    DictKeys,
    DictValues,
    DictItems,
    DictGet,
    DictPop,
    DictSetDefault,
    DictUpdate,
    DictCopy,
    DictClear,
    DictHasKey,
    DictIterKeys,
    DictIterValues,
    DictIterItems,
    // exceptions
    ExcNew,
    ExcInit,
    ExcStr,
    ExcRepr,
    ExcGetAttr,
}

impl NativeId {
    /// Natives of the builtins namespace take no `self`; everything else is a method.
    fn is_function(self) -> bool {
        matches!(
            self,
            Self::Id
                | Self::Len
                | Self::Hash
                | Self::GetAttr
                | Self::SetAttr
                | Self::HasAttr
                | Self::DelAttr
                | Self::IsInstance
                | Self::IsSubclass
                | Self::Repr
                | Self::Next
                | Self::Range
                | Self::Iter
        )
    }
}

/// `(attribute name, native)` pairs a method dictionary is built from.
pub(crate) type MethodTable = &'static [(&'static str, NativeId)];

pub(crate) const BUILTIN_FUNCTIONS: MethodTable = &[
    ("id", NativeId::Id),
    ("len", NativeId::Len),
    ("hash", NativeId::Hash),
    ("getattr", NativeId::GetAttr),
    ("setattr", NativeId::SetAttr),
    ("hasattr", NativeId::HasAttr),
    ("delattr", NativeId::DelAttr),
    ("isinstance", NativeId::IsInstance),
    ("issubclass", NativeId::IsSubclass),
    ("repr", NativeId::Repr),
    ("next", NativeId::Next),
    ("range", NativeId::Range),
    ("iter", NativeId::Iter),
];

pub(crate) const OBJECT_METHODS: MethodTable = &[
    ("__init__", NativeId::ObjectInit),
    ("__hash__", NativeId::ObjectHash),
    ("__str__", NativeId::ObjectStr),
    ("__repr__", NativeId::ObjectRepr),
    ("__getattr__", NativeId::ObjectGetAttr),
    ("__setattr__", NativeId::ObjectSetAttr),
    ("__delattr__", NativeId::ObjectDelAttr),
    ("__eq__", NativeId::ObjectEq),
    ("__ne__", NativeId::ObjectNe),
];

pub(crate) const INT_METHODS: MethodTable = &[
    ("__new__", NativeId::IntNew),
    ("bit_length", NativeId::IntBitLength),
    ("__add__", NativeId::Binary(BinaryOp::Add)),
    ("__sub__", NativeId::Binary(BinaryOp::Sub)),
    ("__mul__", NativeId::Binary(BinaryOp::Mul)),
    ("__div__", NativeId::Binary(BinaryOp::Div)),
    ("__floordiv__", NativeId::Binary(BinaryOp::FloorDiv)),
    ("__mod__", NativeId::Binary(BinaryOp::Mod)),
    ("__pow__", NativeId::Binary(BinaryOp::Pow)),
    ("__lshift__", NativeId::Binary(BinaryOp::LShift)),
    ("__rshift__", NativeId::Binary(BinaryOp::RShift)),
    ("__and__", NativeId::Binary(BinaryOp::And)),
    ("__or__", NativeId::Binary(BinaryOp::Or)),
    ("__xor__", NativeId::Binary(BinaryOp::Xor)),
    ("__neg__", NativeId::Unary(UnaryOp::Neg)),
    ("__pos__", NativeId::Unary(UnaryOp::Pos)),
    ("__invert__", NativeId::Unary(UnaryOp::Invert)),
    ("__nonzero__", NativeId::DunderNonzero),
    ("__lt__", NativeId::RichCompare(CompareOp::Lt)),
    ("__le__", NativeId::RichCompare(CompareOp::Le)),
    ("__gt__", NativeId::RichCompare(CompareOp::Gt)),
    ("__ge__", NativeId::RichCompare(CompareOp::Ge)),
];

pub(crate) const BOOL_METHODS: MethodTable = &[("__new__", NativeId::BoolNew)];

pub(crate) const STR_METHODS: MethodTable = &[
    ("__new__", NativeId::StrNew),
    ("__len__", NativeId::DunderLen),
    ("__getitem__", NativeId::DunderGetItem),
    ("__contains__", NativeId::DunderContains),
    ("__add__", NativeId::Binary(BinaryOp::Add)),
    ("__mul__", NativeId::Binary(BinaryOp::Mul)),
    ("__lt__", NativeId::RichCompare(CompareOp::Lt)),
    ("__le__", NativeId::RichCompare(CompareOp::Le)),
    ("__gt__", NativeId::RichCompare(CompareOp::Gt)),
    ("__ge__", NativeId::RichCompare(CompareOp::Ge)),
    ("join", NativeId::StrJoin),
    ("find", NativeId::StrFind),
    ("rfind", NativeId::StrRFind),
    ("index", NativeId::StrIndex),
    ("rindex", NativeId::StrRIndex),
    ("startswith", NativeId::StrStartsWith),
    ("endswith", NativeId::StrEndsWith),
    ("ljust", NativeId::StrLJust),
    ("rjust", NativeId::StrRJust),
    ("center", NativeId::StrCenter),
    ("split", NativeId::StrSplit),
    ("strip", NativeId::StrStrip),
    ("upper", NativeId::StrUpper),
    ("lower", NativeId::StrLower),
    ("replace", NativeId::StrReplace),
];

pub(crate) const TUPLE_METHODS: MethodTable = &[
    ("__new__", NativeId::TupleNew),
    ("__len__", NativeId::DunderLen),
    ("__getitem__", NativeId::DunderGetItem),
    ("__contains__", NativeId::DunderContains),
    ("__iter__", NativeId::DunderIter),
    ("__add__", NativeId::Binary(BinaryOp::Add)),
    ("__mul__", NativeId::Binary(BinaryOp::Mul)),
    ("index", NativeId::SeqIndex),
    ("count", NativeId::SeqCount),
];

pub(crate) const LIST_METHODS: MethodTable = &[
    ("__new__", NativeId::ListNew),
    ("__len__", NativeId::DunderLen),
    ("__getitem__", NativeId::DunderGetItem),
    ("__setitem__", NativeId::DunderSetItem),
    ("__delitem__", NativeId::DunderDelItem),
    ("__contains__", NativeId::DunderContains),
    ("__iter__", NativeId::DunderIter),
    ("__add__", NativeId::Binary(BinaryOp::Add)),
    ("__mul__", NativeId::Binary(BinaryOp::Mul)),
    ("append", NativeId::ListAppend),
    ("insert", NativeId::ListInsert),
    ("extend", NativeId::ListExtend),
    ("pop", NativeId::ListPop),
    ("remove", NativeId::ListRemove),
    ("reverse", NativeId::ListReverse),
    ("sort", NativeId::ListSort),
    ("index", NativeId::SeqIndex),
    ("count", NativeId::SeqCount),
];

pub(crate) const DICT_METHODS: MethodTable = &[
    ("__new__", NativeId::DictNew),
    ("__len__", NativeId::DunderLen),
    ("__getitem__", NativeId::DunderGetItem),
    ("__setitem__", NativeId::DunderSetItem),
    ("__delitem__", NativeId::DunderDelItem),
    ("__contains__", NativeId::DunderContains),
    ("__iter__", NativeId::DunderIter),
    ("keys", NativeId::DictKeys),
    ("values", NativeId::DictValues),
    ("items", NativeId::DictItems),
    ("get", NativeId::DictGet),
    ("pop", NativeId::DictPop),
    ("setdefault", NativeId::DictSetDefault),
    ("update", NativeId::DictUpdate),
    ("copy", NativeId::DictCopy),
    ("clear", NativeId::DictClear),
    ("has_key", NativeId::DictHasKey),
    ("iterkeys", NativeId::DictIterKeys),
    ("itervalues", NativeId::DictIterValues),
    ("iteritems", NativeId::DictIterItems),
];

pub(crate) const ITERATOR_METHODS: MethodTable = &[("__iter__", NativeId::IterSelf), ("next", NativeId::IterNext)];

pub(crate) const EXCEPTION_METHODS: MethodTable = &[
    ("__new__", NativeId::ExcNew),
    ("__init__", NativeId::ExcInit),
    ("__str__", NativeId::ExcStr),
    ("__repr__", NativeId::ExcRepr),
    ("__getattr__", NativeId::ExcGetAttr),
];

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Calls a native. `self_value` is the bound instance, if the native was reached
    /// through a bound method; unbound method natives take `self` from the first argument.
    pub(crate) fn call_native(&mut self, id: NativeId, self_value: Option<Value>, args: ArgValues) -> RunResult<Value> {
        if id.is_function() {
            self_value.drop_with_heap(self.heap);
            return self.call_builtin_function(id, args);
        }
        let (this, args) = match self_value {
            Some(this) => (this, args),
            None => {
                let mut args = args;
                if args.args.is_empty() {
                    args.drop_with_heap(self.heap);
                    return Err(ExcType::type_error("unbound method called without an instance"));
                }
                let this = args.args.remove(0);
                (this, args)
            }
        };
        let result = self.call_native_method(id, &this, args);
        this.drop_with_heap(self.heap);
        result
    }

    fn call_builtin_function(&mut self, id: NativeId, args: ArgValues) -> RunResult<Value> {
        match id {
            NativeId::Id => self.builtin_id(args),
            NativeId::Len => self.builtin_len(args),
            NativeId::Hash => self.builtin_hash(args),
            NativeId::GetAttr => self.builtin_getattr(args),
            NativeId::SetAttr => self.builtin_setattr(args),
            NativeId::HasAttr => self.builtin_hasattr(args),
            NativeId::DelAttr => self.builtin_delattr(args),
            NativeId::IsInstance => self.builtin_isinstance(args),
            NativeId::IsSubclass => self.builtin_issubclass(args),
            NativeId::Repr => self.builtin_repr(args),
            NativeId::Next => self.builtin_next(args),
            NativeId::Range => self.builtin_range(args),
            NativeId::Iter => self.builtin_iter(args),
            other => {
                args.drop_with_heap(self.heap);
                Err(ExcType::system_error(format!("{other:?} is not a builtin function")))
            }
        }
    }

    fn call_native_method(&mut self, id: NativeId, this: &Value, args: ArgValues) -> RunResult<Value> {
        match id {
            NativeId::ObjectInit => self.object_init(this, args),
            NativeId::ObjectHash => self.object_hash(this, args),
            NativeId::ObjectStr => self.object_str(this, args),
            NativeId::ObjectRepr => self.object_repr(this, args),
            NativeId::ObjectGetAttr => self.object_getattr_native(this, args),
            NativeId::ObjectSetAttr => self.object_setattr_native(this, args),
            NativeId::ObjectDelAttr => self.object_delattr_native(this, args),
            NativeId::ObjectEq => self.object_eq(this, args, true),
            NativeId::ObjectNe => self.object_eq(this, args, false),

            NativeId::DunderLen => self.dunder_len(this, args),
            NativeId::DunderGetItem => self.dunder_getitem(this, args),
            NativeId::DunderSetItem => self.dunder_setitem(this, args),
            NativeId::DunderDelItem => self.dunder_delitem(this, args),
            NativeId::DunderContains => self.dunder_contains(this, args),
            NativeId::DunderIter => self.dunder_iter(this, args),
            NativeId::DunderNonzero => self.dunder_nonzero(this, args),
            NativeId::Binary(op) => self.dunder_binary(op, this, args),
            NativeId::Unary(op) => self.dunder_unary(op, this, args),
            NativeId::RichCompare(op) => self.dunder_compare(op, this, args),
            NativeId::IterNext => self.iterator_next(this, args),
            NativeId::IterSelf => {
                args.check_zero_args("__iter__", self.heap)?;
                Ok(this.clone_with_heap(self.heap))
            }

            NativeId::IntNew => self.int_new(this, args, false),
            NativeId::BoolNew => self.int_new(this, args, true),
            NativeId::IntBitLength => self.int_bit_length(this, args),

            NativeId::StrNew => self.str_new(this, args),
            NativeId::StrJoin => self.str_join(this, args),
            NativeId::StrFind => self.str_find(this, args, false, false),
            NativeId::StrRFind => self.str_find(this, args, true, false),
            NativeId::StrIndex => self.str_find(this, args, false, true),
            NativeId::StrRIndex => self.str_find(this, args, true, true),
            NativeId::StrStartsWith => self.str_affix(this, args, true),
            NativeId::StrEndsWith => self.str_affix(this, args, false),
            NativeId::StrLJust => self.str_justify(this, args, Justify::Left),
            NativeId::StrRJust => self.str_justify(this, args, Justify::Right),
            NativeId::StrCenter => self.str_justify(this, args, Justify::Center),
            NativeId::StrSplit => self.str_split(this, args),
            NativeId::StrStrip => self.str_strip(this, args),
            NativeId::StrUpper => self.str_map_bytes(this, args, "upper", |b| b.to_ascii_uppercase()),
            NativeId::StrLower => self.str_map_bytes(this, args, "lower", |b| b.to_ascii_lowercase()),
            NativeId::StrReplace => self.str_replace(this, args),

            NativeId::TupleNew => self.tuple_new(this, args),
            NativeId::ListNew => self.list_new(this, args),
            NativeId::ListAppend => self.list_append(this, args),
            NativeId::ListInsert => self.list_insert(this, args),
            NativeId::ListExtend => self.list_extend(this, args),
            NativeId::ListPop => self.list_pop(this, args),
            NativeId::ListRemove => self.list_remove(this, args),
            NativeId::ListReverse => self.list_reverse(this, args),
            NativeId::ListSort => self.list_sort(this, args),
            NativeId::SeqIndex => self.seq_index(this, args),
            NativeId::SeqCount => self.seq_count(this, args),

            NativeId::DictNew => self.dict_new(this, args),
            NativeId::DictKeys => self.dict_listing(this, args, DictIterKind::Keys),
            NativeId::DictValues => self.dict_listing(this, args, DictIterKind::Values),
            NativeId::DictItems => self.dict_listing(this, args, DictIterKind::Items),
            NativeId::DictIterKeys => self.dict_iterator(this, args, DictIterKind::Keys),
            NativeId::DictIterValues => self.dict_iterator(this, args, DictIterKind::Values),
            NativeId::DictIterItems => self.dict_iterator(this, args, DictIterKind::Items),
            NativeId::DictGet => self.dict_get_method(this, args),
            NativeId::DictPop => self.dict_pop_method(this, args),
            NativeId::DictSetDefault => self.dict_setdefault(this, args),
            NativeId::DictUpdate => self.dict_update(this, args),
            NativeId::DictCopy => self.dict_copy_method(this, args),
            NativeId::DictClear => self.dict_clear(this, args),
            NativeId::DictHasKey => self.dict_has_key(this, args),

            NativeId::ExcNew => self.exception_new(this, args),
            NativeId::ExcInit => self.exception_init(this, args),
            NativeId::ExcStr => self.exception_str(this, args),
            NativeId::ExcRepr => self.exception_repr(this, args),
            NativeId::ExcGetAttr => self.exception_getattr(this, args),

            builtin => self.call_builtin_function(builtin, args),
        }
    }
}
