//! Values manipulated by interpreted code.
//!
//! Storage locations (arguments, locals, fields, statics and array elements) are [`Slot`]s so
//! that a managed pointer ([`Value::Ref`]) can alias any of them. Integers narrower than 32 bits
//! and booleans live on the stack as [`Value::I4`].
//!
//! Instances of user value types are held as [`Object`]s and therefore have reference
//! semantics: copying a struct value shares its fields. The weaving and fix-up paths never
//! depend on struct copies, so the simplification is invisible to them.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use dashmap::DashMap;

use crate::runtime::{delegate::DelegateValue, RuntimeFieldId, RuntimeMethodId, RuntimeTypeId};

/// A shared, lockable storage location.
pub type Slot = Arc<RwLock<Value>>;

/// Create a slot holding `value`.
#[must_use]
pub fn slot(value: Value) -> Slot {
    Arc::new(RwLock::new(value))
}

/// A value on the evaluation stack or in a storage location.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// The null reference
    #[default]
    Null,
    /// `int32` and everything narrower, including `bool` and `char`
    I4(i32),
    /// `int64`
    I8(i64),
    /// `float32` and `float64`
    R8(f64),
    /// `native int`
    NativeInt(isize),
    /// A string
    String(Arc<str>),
    /// An object or value type instance
    Object(Arc<Object>),
    /// A delegate
    Delegate(Arc<DelegateValue>),
    /// A single-dimensional array
    Array(Arc<ArrayValue>),
    /// A managed pointer to a storage location
    Ref(Slot),
    /// A method pointer produced by `ldftn`
    MethodPtr(RuntimeMethodId),
}

impl Value {
    /// A string value.
    #[must_use]
    pub fn string(value: &str) -> Value {
        Value::String(Arc::from(value))
    }

    /// A boolean as `0` or `1`.
    #[must_use]
    pub fn bool(value: bool) -> Value {
        Value::I4(i32::from(value))
    }

    /// `true` for the null reference.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The truth value used by `brtrue` and friends.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I4(v) => *v != 0,
            Value::I8(v) => *v != 0,
            Value::R8(v) => *v != 0.0,
            Value::NativeInt(v) => *v != 0,
            _ => true,
        }
    }

    /// The value as `int32`, if it is an integer.
    #[must_use]
    pub fn as_i4(&self) -> Option<i32> {
        match self {
            Value::I4(v) => Some(*v),
            Value::I8(v) => Some(*v as i32),
            Value::NativeInt(v) => Some(*v as i32),
            _ => None,
        }
    }

    /// The value as `int64`, if it is an integer.
    #[must_use]
    pub fn as_i8(&self) -> Option<i64> {
        match self {
            Value::I4(v) => Some(i64::from(*v)),
            Value::I8(v) => Some(*v),
            Value::NativeInt(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// The string contents, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The delegate, if this is one.
    #[must_use]
    pub fn as_delegate(&self) -> Option<&Arc<DelegateValue>> {
        match self {
            Value::Delegate(d) => Some(d),
            _ => None,
        }
    }

    /// Reference identity for heap values, value equality for everything else.
    ///
    /// This is the comparison `ceq` performs. Strings compare by contents.
    #[must_use]
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Delegate(a), Value::Delegate(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(a, b),
            (Value::MethodPtr(a), Value::MethodPtr(b)) => a == b,
            (Value::R8(a), Value::R8(b)) => a == b,
            (a, b) => match (a.as_i8(), b.as_i8()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    /// Short name of the value kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::I4(_) => "int32",
            Value::I8(_) => "int64",
            Value::R8(_) => "float",
            Value::NativeInt(_) => "native int",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::Delegate(_) => "delegate",
            Value::Array(_) => "array",
            Value::Ref(_) => "managed pointer",
            Value::MethodPtr(_) => "method pointer",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::I4(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::R8(v) => write!(f, "{v}"),
            Value::NativeInt(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            other => write!(f, "<{}>", other.kind()),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I4(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::string(value)
    }
}

/// A heap object.
#[derive(Debug)]
pub struct Object {
    /// Exact type of the instance
    pub ty: RuntimeTypeId,
    /// Instance fields of the type and all its bases
    pub fields: DashMap<RuntimeFieldId, Slot>,
}

impl Object {
    /// The storage of `field`, if the object has it.
    #[must_use]
    pub fn field(&self, field: RuntimeFieldId) -> Option<Slot> {
        self.fields.get(&field).map(|s| Arc::clone(&s))
    }
}

/// A single-dimensional, zero-based array.
#[derive(Debug)]
pub struct ArrayValue {
    /// Element type
    pub element: RuntimeTypeId,
    /// Elements
    pub items: Vec<Slot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_true());
        assert!(!Value::I4(0).is_true());
        assert!(Value::I4(-1).is_true());
        assert!(Value::string("").is_true());
    }

    #[test]
    fn identity_and_equality() {
        assert!(Value::I4(5).same(&Value::I8(5)));
        assert!(Value::string("a").same(&Value::string("a")));
        assert!(!Value::string("a").same(&Value::Null));

        let location = slot(Value::I4(1));
        assert!(Value::Ref(location.clone()).same(&Value::Ref(location)));
        assert!(!Value::Ref(slot(Value::Null)).same(&Value::Ref(slot(Value::Null))));
    }

    #[test]
    fn display() {
        assert_eq!(Value::I4(42).to_string(), "42");
        assert_eq!(Value::string("hi").to_string(), "hi");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
