use std::fmt::{self, Write};

use ahash::AHashSet;
use num_bigint::BigInt;
use num_traits::Zero;

use crate::{
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    resource::{ResourceError, ResourceTracker},
    runtime::Runtime,
    types::{Int, Lookup, int::from_bigint, str::repr_bytes},
    value::Value,
};

/// A value passed into or returned from the interpreter.
///
/// `Object` owns its data and needs no heap, so it can be cloned, compared,
/// serialized and stored freely. Values with no structural mapping (functions, classes,
/// instances, modules) come out as [`Repr`](Self::Repr), which is output-only.
///
/// Strings are byte strings inside the interpreter: valid UTF-8 comes out as
/// [`String`](Self::String), anything else as [`Bytes`](Self::Bytes). Both go in as `str`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Object {
    #[serde(alias = "none", alias = "NoneType")]
    None,
    NotImplemented,
    #[serde(alias = "bool")]
    Bool(bool),
    #[serde(alias = "int")]
    Int(i64),
    /// An integer outside the `i64` range.
    BigInt(BigInt),
    #[serde(alias = "str")]
    String(String),
    /// A `str` whose bytes are not UTF-8.
    Bytes(Vec<u8>),
    #[serde(alias = "list")]
    List(Vec<Self>),
    #[serde(alias = "tuple")]
    Tuple(Vec<Self>),
    /// Key/value pairs in the dict's iteration order.
    #[serde(alias = "dict")]
    Dict(DictPairs),
    /// The `repr()` of a value with no structural mapping.
    Repr(String),
    /// A container met again while it was being converted; holds its placeholder.
    Cycle(String),
}

/// Ordered key/value pairs of a dict.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DictPairs(Vec<(Object, Object)>);

impl DictPairs {
    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, (Object, Object)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The value stored under a string key.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&Object> {
        self.0
            .iter()
            .find(|(k, _)| matches!(k, Object::String(s) if s == key))
            .map(|(_, v)| v)
    }
}

impl From<Vec<(Object, Object)>> for DictPairs {
    fn from(pairs: Vec<(Object, Object)>) -> Self {
        Self(pairs)
    }
}

impl IntoIterator for DictPairs {
    type Item = (Object, Object);
    type IntoIter = std::vec::IntoIter<(Object, Object)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for Object {
    /// `str()` of the value: strings print bare, everything else as its repr.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Repr(text) | Self::Cycle(text) => f.write_str(text),
            _ => self.repr_fmt(f),
        }
    }
}

impl Object {
    /// Converts a value, releasing it.
    pub(crate) fn new(value: Value, heap: &mut Heap<impl ResourceTracker>, rt: &Runtime) -> Self {
        let object = Self::from_value(&value, heap, rt, &mut AHashSet::new());
        value.drop_with_heap(heap);
        object
    }

    fn from_value(value: &Value, heap: &Heap<impl ResourceTracker>, rt: &Runtime, visited: &mut AHashSet<HeapId>) -> Self {
        let id = match value {
            Value::None => return Self::None,
            Value::NotImplemented => return Self::NotImplemented,
            Value::Bool(b) => return Self::Bool(*b),
            Value::Int(i) => return Self::Int(*i),
            Value::Ref(id) => *id,
            #[cfg(feature = "ref-count-panic")]
            Value::Dereferenced => panic!("Dereferenced found while converting to Object"),
        };
        if !visited.insert(id) {
            return Self::Cycle(
                match heap.get(id) {
                    HeapData::List(_) => "[...]",
                    HeapData::Dict(_) => "{...}",
                    _ => "...",
                }
                .to_owned(),
            );
        }
        let convert = |items: &[Value], visited: &mut AHashSet<HeapId>| -> Vec<Self> {
            items.iter().map(|item| Self::from_value(item, heap, rt, visited)).collect()
        };
        let object = match heap.get(id) {
            HeapData::Str(s) => match std::str::from_utf8(s.as_bytes()) {
                Ok(text) => Self::String(text.to_owned()),
                Err(_) => Self::Bytes(s.as_bytes().to_vec()),
            },
            HeapData::LongInt(_) => match Int::from_value(value, heap) {
                Some(Int::Native(v)) => Self::Int(v),
                Some(big) => Self::BigInt(big.to_big()),
                None => Self::Repr("<long>".to_owned()),
            },
            HeapData::Tuple(t) => Self::Tuple(convert(t.items(), visited)),
            HeapData::List(l) => Self::List(convert(l.items(), visited)),
            HeapData::Dict(d) => {
                let pairs: Vec<(Self, Self)> = d
                    .iter()
                    .map(|e| {
                        (
                            Self::from_value(&e.key, heap, rt, visited),
                            Self::from_value(&e.value, heap, rt, visited),
                        )
                    })
                    .collect();
                Self::Dict(DictPairs(pairs))
            }
            HeapData::Type(t) if t.heap_type => Self::Repr(format!("<class '{}'>", t.name)),
            HeapData::Type(t) => Self::Repr(format!("<type '{}'>", t.name)),
            HeapData::Function(func) => Self::Repr(format!("<function {} at 0x{:08x}>", func.name, value.id())),
            HeapData::Native(native) => Self::Repr(format!("<built-in function {}>", native.name)),
            HeapData::Module(m) => Self::Repr(format!("<module '{}'>", m.name)),
            _ => {
                let type_name = match heap.get(rt.type_of(heap, value)) {
                    HeapData::Type(t) => t.name.clone(),
                    _ => "object".to_owned(),
                };
                Self::Repr(format!("<{type_name} instance at 0x{:08x}>", value.id()))
            }
        };
        visited.remove(&id);
        object
    }

    /// Allocates the value this object describes.
    ///
    /// # Errors
    /// `Repr` and `Cycle` are output-only; dict keys must be hashable builtin values.
    pub(crate) fn to_value(self, heap: &mut Heap<impl ResourceTracker>) -> Result<Value, InvalidInputError> {
        match self {
            Self::None => Ok(Value::None),
            Self::NotImplemented => Ok(Value::NotImplemented),
            Self::Bool(b) => Ok(Value::Bool(b)),
            Self::Int(i) => Ok(Value::Int(i)),
            Self::BigInt(big) => Ok(from_bigint(&big).into_value(heap)?),
            Self::String(s) => Ok(heap.alloc_str(&s)?),
            Self::Bytes(b) => Ok(heap.alloc_bytes(b)?),
            Self::List(items) => {
                let values = Self::to_values(items, heap)?;
                Ok(heap.alloc_list(values)?)
            }
            Self::Tuple(items) => {
                let values = Self::to_values(items, heap)?;
                Ok(heap.alloc_tuple(values)?)
            }
            Self::Dict(pairs) => {
                let dict = heap.alloc_dict()?;
                for (key, value) in pairs {
                    if let Err(err) = Self::insert_pair(heap, dict, key, value) {
                        heap.dec_ref(dict);
                        return Err(err);
                    }
                }
                Ok(Value::Ref(dict))
            }
            Self::Repr(_) => Err(InvalidInputError::invalid_type("Repr")),
            Self::Cycle(_) => Err(InvalidInputError::invalid_type("Cycle")),
        }
    }

    fn to_values(items: Vec<Self>, heap: &mut Heap<impl ResourceTracker>) -> Result<Vec<Value>, InvalidInputError> {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            match item.to_value(heap) {
                Ok(value) => values.push(value),
                Err(err) => {
                    values.drop_with_heap(heap);
                    return Err(err);
                }
            }
        }
        Ok(values)
    }

    fn insert_pair(
        heap: &mut Heap<impl ResourceTracker>,
        dict: HeapId,
        key: Self,
        value: Self,
    ) -> Result<(), InvalidInputError> {
        let key = key.to_value(heap)?;
        let hash = match heap.builtin_hash(&key) {
            Ok(Some(hash)) => hash,
            Ok(None) | Err(_) => {
                key.drop_with_heap(heap);
                return Err(InvalidInputError::invalid_type("unhashable dict key"));
            }
        };
        let value = match value.to_value(heap) {
            Ok(value) => value,
            Err(err) => {
                key.drop_with_heap(heap);
                return Err(err);
            }
        };
        let lookup = heap.dict_lookup_builtin(dict, hash, &key);
        if let Err(err) = heap.on_container_insert() {
            (key, value).drop_with_heap(heap);
            return Err(err.into());
        }
        let HeapData::Dict(d) = heap.get_mut(dict) else {
            (key, value).drop_with_heap(heap);
            return Err(InvalidInputError::invalid_type("dict"));
        };
        match lookup {
            Lookup::Found(slot) => {
                let old = d.replace_value(slot, value);
                (key, old).drop_with_heap(heap);
            }
            Lookup::Missing | Lookup::NeedsDispatch => d.insert_new(hash, key, value),
        }
        Ok(())
    }

    /// The Python 2 `repr()` of the value.
    #[must_use]
    pub fn py_repr(&self) -> String {
        let mut s = String::new();
        // writing to a String cannot fail
        let _ = self.repr_fmt(&mut s);
        s
    }

    fn repr_fmt(&self, f: &mut impl Write) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::NotImplemented => f.write_str("NotImplemented"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::BigInt(v) => write!(f, "{v}"),
            Self::String(s) => {
                let mut out = String::new();
                repr_bytes(s.as_bytes(), &mut out);
                f.write_str(&out)
            }
            Self::Bytes(b) => {
                let mut out = String::new();
                repr_bytes(b, &mut out);
                f.write_str(&out)
            }
            Self::List(items) => {
                f.write_char('[')?;
                Self::items_fmt(items, f)?;
                f.write_char(']')
            }
            Self::Tuple(items) => {
                f.write_char('(')?;
                Self::items_fmt(items, f)?;
                if items.len() == 1 {
                    f.write_char(',')?;
                }
                f.write_char(')')
            }
            Self::Dict(pairs) => {
                f.write_char('{')?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    key.repr_fmt(f)?;
                    f.write_str(": ")?;
                    value.repr_fmt(f)?;
                }
                f.write_char('}')
            }
            Self::Repr(text) | Self::Cycle(text) => f.write_str(text),
        }
    }

    fn items_fmt(items: &[Self], f: &mut impl Write) -> fmt::Result {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            item.repr_fmt(f)?;
        }
        Ok(())
    }

    /// Python truthiness. `Repr` values count as true, as objects do by default.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::BigInt(big) => !big.is_zero(),
            Self::String(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::List(items) | Self::Tuple(items) => !items.is_empty(),
            Self::Dict(pairs) => !pairs.is_empty(),
            Self::NotImplemented | Self::Repr(_) | Self::Cycle(_) => true,
        }
    }
}

/// Error converting an [`Object`] into an interpreter value.
#[derive(Debug, Clone)]
pub enum InvalidInputError {
    /// The object cannot be an input; holds what it was.
    InvalidType(&'static str),
    /// A resource limit was hit while allocating.
    Resource(ResourceError),
}

impl InvalidInputError {
    #[must_use]
    pub fn invalid_type(type_name: &'static str) -> Self {
        Self::InvalidType(type_name)
    }
}

impl fmt::Display for InvalidInputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidType(type_name) => write!(f, "'{type_name}' is not a valid input value"),
            Self::Resource(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InvalidInputError {}

impl From<ResourceError> for InvalidInputError {
    fn from(err: ResourceError) -> Self {
        Self::Resource(err)
    }
}

impl TryFrom<&Object> for i64 {
    type Error = InvalidInputError;

    fn try_from(value: &Object) -> Result<Self, Self::Error> {
        match value {
            Object::Int(i) => Ok(*i),
            Object::Bool(b) => Ok(Self::from(*b)),
            _ => Err(InvalidInputError::invalid_type("non-int")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_matches_python_two() {
        let obj = Object::Tuple(vec![
            Object::Int(1),
            Object::String("a'b".to_owned()),
            Object::List(vec![Object::None, Object::Bool(true)]),
        ]);
        assert_eq!(obj.py_repr(), "(1, \"a'b\", [None, True])");
        assert_eq!(Object::Tuple(vec![Object::Int(1)]).py_repr(), "(1,)");
        assert_eq!(Object::String("hi".to_owned()).to_string(), "hi");
    }

    #[test]
    fn dict_pairs_lookup() {
        let pairs = DictPairs::from(vec![(Object::String("x".to_owned()), Object::Int(3))]);
        assert_eq!(pairs.get_str("x"), Some(&Object::Int(3)));
        assert_eq!(pairs.get_str("y"), None);
        assert!(!Object::Dict(DictPairs::default()).is_truthy());
    }
}
