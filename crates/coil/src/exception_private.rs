use std::{
    borrow::Cow,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    heap::{DropWithHeap, Heap},
    resource::ResourceTracker,
    value::Value,
};

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Built-in exception types.
///
/// Uses strum derives for `Display`, `FromStr` and `Into<&'static str>`; the string form
/// is the variant name, which is also the name of the type object in the builtins
/// namespace. Every variant gets a type object at interpreter start, with the base
/// given by [`ExcType::base`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, EnumIter, Serialize, Deserialize,
)]
pub enum ExcType {
    BaseException,
    Exception,
    StandardError,
    AttributeError,
    EnvironmentError,
    IOError,
    ImportError,
    LookupError,
    IndexError,
    KeyError,
    MemoryError,
    NameError,
    UnboundLocalError,
    SystemError,
    TypeError,
    ValueError,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    RuntimeError,
    AssertionError,
    StopIteration,
    SystemExit,
    KeyboardInterrupt,
}

impl ExcType {
    /// Returns the direct base of this exception type, `None` for `BaseException`.
    #[must_use]
    pub fn base(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception | Self::SystemExit | Self::KeyboardInterrupt => Some(Self::BaseException),
            Self::StandardError | Self::StopIteration => Some(Self::Exception),
            Self::IOError => Some(Self::EnvironmentError),
            Self::IndexError | Self::KeyError => Some(Self::LookupError),
            Self::UnboundLocalError => Some(Self::NameError),
            Self::ZeroDivisionError | Self::OverflowError => Some(Self::ArithmeticError),
            Self::AttributeError
            | Self::EnvironmentError
            | Self::ImportError
            | Self::LookupError
            | Self::MemoryError
            | Self::NameError
            | Self::SystemError
            | Self::TypeError
            | Self::ValueError
            | Self::ArithmeticError
            | Self::RuntimeError
            | Self::AssertionError => Some(Self::StandardError),
        }
    }

    /// Returns true if `self` would be caught by `except handler_type:`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t == handler_type {
                return true;
            }
            current = t.base();
        }
        false
    }

    /// Whether instances expose `errno`, `strerror` and `filename`.
    #[must_use]
    pub fn is_environment_error(self) -> bool {
        self.is_subclass_of(Self::EnvironmentError)
    }

    #[must_use]
    pub(crate) fn type_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::TypeError, msg).into()
    }

    #[must_use]
    pub(crate) fn value_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::ValueError, msg).into()
    }

    #[must_use]
    pub(crate) fn system_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::SystemError, msg).into()
    }

    #[must_use]
    pub(crate) fn index_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::IndexError, msg).into()
    }

    /// `'T' object has no attribute 'x'`
    #[must_use]
    pub(crate) fn attribute_error(type_name: impl Display, attr: &str) -> RunError {
        SimpleException::new_msg(
            Self::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn name_error(name: &str) -> RunError {
        SimpleException::new_msg(Self::NameError, format!("name '{name}' is not defined")).into()
    }

    #[must_use]
    pub(crate) fn unbound_local_error(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn global_name_error(name: &str) -> RunError {
        SimpleException::new_msg(Self::NameError, format!("global name '{name}' is not defined")).into()
    }

    #[must_use]
    pub(crate) fn zero_division() -> RunError {
        SimpleException::new_msg(Self::ZeroDivisionError, "integer division or modulo by zero").into()
    }

    /// `unsupported operand type(s) for +: 'A' and 'B'`
    #[must_use]
    pub(crate) fn binary_type_error(op: &str, lhs_type: &str, rhs_type: &str) -> RunError {
        Self::type_error(format!(
            "unsupported operand type(s) for {op}: '{lhs_type}' and '{rhs_type}'"
        ))
    }

    /// `bad operand type for unary -: 'A'`
    #[must_use]
    pub(crate) fn unary_type_error(op: &str, value_type: &str) -> RunError {
        Self::type_error(format!("bad operand type for unary {op}: '{value_type}'"))
    }

    #[must_use]
    pub(crate) fn type_error_unhashable(type_name: &str) -> RunError {
        Self::type_error(format!("unhashable type: '{type_name}'"))
    }

    #[must_use]
    pub(crate) fn type_error_not_callable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not callable"))
    }

    #[must_use]
    pub(crate) fn type_error_not_iterable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not iterable"))
    }

    #[must_use]
    pub(crate) fn type_error_not_subscriptable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object has no attribute '__getitem__'"))
    }

    #[must_use]
    pub(crate) fn type_error_indices(type_name: &str, index_type: &str) -> RunError {
        Self::type_error(format!("{type_name} indices must be integers, not {index_type}"))
    }

    /// Matches CPython's builtin argument count messages:
    /// `len() takes exactly one argument (2 given)` / `insert expected 2 arguments, got 1`
    #[must_use]
    pub(crate) fn type_error_arg_count(name: &str, expected: usize, actual: usize) -> RunError {
        if expected == 1 {
            Self::type_error(format!("{name}() takes exactly one argument ({actual} given)"))
        } else {
            Self::type_error(format!("{name} expected {expected} arguments, got {actual}"))
        }
    }

    #[must_use]
    pub(crate) fn type_error_no_args(name: &str, actual: usize) -> RunError {
        Self::type_error(format!("{name}() takes no arguments ({actual} given)"))
    }

    #[must_use]
    pub(crate) fn type_error_at_least(name: &str, min: usize, actual: usize) -> RunError {
        Self::type_error(format!("{name} expected at least {min} arguments, got {actual}"))
    }

    #[must_use]
    pub(crate) fn type_error_at_most(name: &str, max: usize, actual: usize) -> RunError {
        Self::type_error(format!("{name} expected at most {max} arguments, got {actual}"))
    }

    #[must_use]
    pub(crate) fn type_error_no_kwargs(name: &str) -> RunError {
        Self::type_error(format!("{name}() takes no keyword arguments"))
    }

    #[must_use]
    pub(crate) fn value_error_substring_not_found() -> RunError {
        Self::value_error("substring not found")
    }

    #[must_use]
    pub(crate) fn stop_iteration() -> RunError {
        SimpleException::new_none(Self::StopIteration).into()
    }

    #[must_use]
    pub(crate) fn import_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::ImportError, msg).into()
    }
}

/// Lightweight representation of an exception raised by runtime code.
///
/// Rust-side failures (type errors in natives, arithmetic errors, limit violations)
/// are created as `SimpleException`s and only turned into heap instances when they
/// reach the interpreter's exception state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct SimpleException {
    exc_type: ExcType,
    arg: Option<String>,
}

impl fmt::Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            Some(arg) => write!(f, "{}: {arg}", self.exc_type),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

impl SimpleException {
    /// Creates a new exception with the given type and optional message.
    #[must_use]
    pub fn new(exc_type: ExcType, arg: Option<String>) -> Self {
        Self { exc_type, arg }
    }

    /// Creates a new exception with the given type and message.
    #[must_use]
    pub fn new_msg(exc_type: ExcType, arg: impl Display) -> Self {
        Self {
            exc_type,
            arg: Some(arg.to_string()),
        }
    }

    /// Creates a new exception without a message.
    #[must_use]
    pub fn new_none(exc_type: ExcType) -> Self {
        Self { exc_type, arg: None }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn arg(&self) -> Option<&str> {
        self.arg.as_deref()
    }
}

/// A normalized exception triple: type object, instance and traceback.
///
/// All three are owned references. `traceback` is `Value::None` until the exception
/// has passed through at least one frame.
#[derive(Debug)]
pub(crate) struct ExcInfo {
    pub kind: Value,
    pub value: Value,
    pub traceback: Value,
}

impl ExcInfo {
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap<impl ResourceTracker>) -> Self {
        Self {
            kind: self.kind.clone_with_heap(heap),
            value: self.value.clone_with_heap(heap),
            traceback: self.traceback.clone_with_heap(heap),
        }
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for ExcInfo {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.kind.drop_with_heap(heap);
        self.value.drop_with_heap(heap);
        self.traceback.drop_with_heap(heap);
    }
}

/// Runtime error type.
///
/// - `Internal`: bug in the interpreter, never catchable
/// - `Exc`: exception created by Rust code, normalized when it reaches a frame
/// - `Raised`: exception instance already on the heap (user `raise`, propagation out of
///   a frame, exceptions created with an object payload such as `KeyError(key)`)
/// - `Uncatchable`: limit violations that no handler or finally block may observe
#[derive(Debug)]
pub(crate) enum RunError {
    Internal(Cow<'static, str>),
    Exc(Box<SimpleException>),
    Raised(Box<ExcInfo>),
    Uncatchable(Box<SimpleException>),
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl From<ExcInfo> for RunError {
    fn from(info: ExcInfo) -> Self {
        Self::Raised(Box::new(info))
    }
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the exception type when it is known without touching the heap.
    #[must_use]
    pub fn simple_type(&self) -> Option<ExcType> {
        match self {
            Self::Exc(exc) | Self::Uncatchable(exc) => Some(exc.exc_type()),
            Self::Internal(_) | Self::Raised(_) => None,
        }
    }

    /// Whether try/except and finally blocks may see this error.
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        matches!(self, Self::Exc(_) | Self::Raised(_))
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for RunError {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        if let Self::Raised(info) = self {
            info.drop_with_heap(heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn hierarchy_matches_python2() {
        assert!(ExcType::KeyError.is_subclass_of(ExcType::LookupError));
        assert!(ExcType::KeyError.is_subclass_of(ExcType::StandardError));
        assert!(ExcType::IOError.is_subclass_of(ExcType::EnvironmentError));
        assert!(ExcType::UnboundLocalError.is_subclass_of(ExcType::NameError));
        assert!(ExcType::StopIteration.is_subclass_of(ExcType::Exception));
        assert!(!ExcType::StopIteration.is_subclass_of(ExcType::StandardError));
        assert!(!ExcType::SystemExit.is_subclass_of(ExcType::Exception));
        assert!(!ExcType::LookupError.is_subclass_of(ExcType::KeyError));
    }

    #[test]
    fn every_type_reaches_base_exception() {
        for exc_type in ExcType::iter() {
            assert!(exc_type.is_subclass_of(ExcType::BaseException), "{exc_type}");
        }
    }

    #[test]
    fn names_round_trip_through_strum() {
        assert_eq!(ExcType::from_str("ZeroDivisionError"), Ok(ExcType::ZeroDivisionError));
        let name: &'static str = ExcType::IOError.into();
        assert_eq!(name, "IOError");
    }

    #[test]
    fn simple_exception_display() {
        assert_eq!(
            SimpleException::new_msg(ExcType::ValueError, "bad").to_string(),
            "ValueError: bad"
        );
        assert_eq!(SimpleException::new_none(ExcType::MemoryError).to_string(), "MemoryError");
    }
}
