//! Native implementations of the base class library's `internalcall` members.
//!
//! | Member                                   | Behaviour                                   |
//! |------------------------------------------|---------------------------------------------|
//! | `Object::ToString()`                     | full name of the receiver's type            |
//! | `Object::Equals(object)`                 | reference identity, string contents         |
//! | `Object::GetHashCode()`                  | stable per value                            |
//! | `Int32::ToString()`                      | decimal rendering                           |
//! | `String::Concat` (2 or 3 strings, 2 objects) | concatenation, null as empty            |
//! | `String::op_Equality` / `op_Inequality`  | ordinal comparison                          |
//! | `String::get_Length`                     | length in UTF-16 code units                 |
//! | `String::IsNullOrEmpty`                  |                                             |
//! | `String::ToString()`                     | the receiver                                |
//! | `Delegate::Combine` / `Delegate::Remove` | see [`DelegateValue::combine`] and `remove` |

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{Arc, OnceLock},
};

use crate::{
    metadata::flags::MethodImplAttributes,
    runtime::{
        delegate::DelegateValue, interpreter::Completion, value::Value, Runtime, RuntimeMethodId,
        CORLIB_INDEX,
    },
    signature::{binary::describe_sig, type_signature},
    Error, Result,
};

/// A native member implementation. Receives the receiver first for instance members.
pub type Intrinsic = fn(&Runtime, &[Value]) -> Result<Completion>;

fn table() -> &'static HashMap<&'static str, Intrinsic> {
    static TABLE: OnceLock<HashMap<&'static str, Intrinsic>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let entries: [(&'static str, Intrinsic); 14] = [
            ("System.Object::ToString()", object_to_string),
            ("System.Object::Equals(System.Object)", object_equals),
            ("System.Object::GetHashCode()", object_hash_code),
            ("System.Int32::ToString()", int32_to_string),
            ("System.String::Concat(System.String,System.String)", string_concat),
            ("System.String::Concat(System.String,System.String,System.String)", string_concat),
            ("System.String::Concat(System.Object,System.Object)", string_concat),
            ("System.String::op_Equality(System.String,System.String)", string_equals),
            ("System.String::op_Inequality(System.String,System.String)", string_not_equals),
            ("System.String::get_Length()", string_length),
            ("System.String::IsNullOrEmpty(System.String)", string_is_null_or_empty),
            ("System.String::ToString()", string_to_string),
            ("System.Delegate::Combine(System.Delegate,System.Delegate)", delegate_combine),
            ("System.Delegate::Remove(System.Delegate,System.Delegate)", delegate_remove),
        ];
        entries.into_iter().collect()
    })
}

/// The native implementation of `method`, if it is a base class library `internalcall`.
///
/// # Errors
/// Returns an error if the method cannot be described.
pub fn lookup(runtime: &Runtime, method: RuntimeMethodId) -> Result<Option<Intrinsic>> {
    if method.assembly != CORLIB_INDEX {
        return Ok(None);
    }
    let def = runtime.method_def(method)?;
    if !def.impl_flags.contains(MethodImplAttributes::INTERNAL_CALL) {
        return Ok(None);
    }
    let module = runtime.module(CORLIB_INDEX)?;
    let params = def
        .signature
        .params
        .iter()
        .map(|p| describe_sig(module, p).map(|d| type_signature(&d)))
        .collect::<Result<Vec<_>>>()?;
    let key = format!(
        "{}::{}({})",
        runtime.type_name(method.declaring_type()),
        def.name,
        params.join(",")
    );
    Ok(table().get(key.as_str()).copied())
}

fn receiver<'a>(args: &'a [Value], member: &str) -> Result<&'a Value> {
    args.first()
        .ok_or_else(|| Error::Execution(format!("{member} called without a receiver")))
}

/// The text `String.Concat` uses for a value.
fn text(runtime: &Runtime, value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => String::new(),
        Value::String(s) => s.to_string(),
        Value::I4(_) | Value::I8(_) | Value::R8(_) | Value::NativeInt(_) => value.to_string(),
        other => match runtime.type_of(other)? {
            Some(ty) => runtime.type_name(ty),
            None => other.to_string(),
        },
    })
}

fn returns(value: Value) -> Result<Completion> {
    Ok(Completion::Return(value))
}

fn object_to_string(runtime: &Runtime, args: &[Value]) -> Result<Completion> {
    let this = receiver(args, "Object::ToString")?;
    returns(Value::string(&text(runtime, this)?))
}

fn object_equals(_: &Runtime, args: &[Value]) -> Result<Completion> {
    let this = receiver(args, "Object::Equals")?;
    let other = args.get(1).unwrap_or(&Value::Null);
    returns(Value::bool(this.same(other)))
}

fn object_hash_code(_: &Runtime, args: &[Value]) -> Result<Completion> {
    let this = receiver(args, "Object::GetHashCode")?;
    let hash = match this {
        Value::I4(v) => *v,
        Value::String(s) => {
            let mut hasher = DefaultHasher::new();
            s.hash(&mut hasher);
            hasher.finish() as i32
        }
        Value::Object(o) => Arc::as_ptr(o) as usize as i32,
        Value::Delegate(d) => Arc::as_ptr(d) as usize as i32,
        Value::Array(a) => Arc::as_ptr(a) as usize as i32,
        other => other.as_i8().map_or(0, |v| v as i32),
    };
    returns(Value::I4(hash))
}

fn int32_to_string(_: &Runtime, args: &[Value]) -> Result<Completion> {
    let this = receiver(args, "Int32::ToString")?;
    returns(Value::string(&this.to_string()))
}

fn string_concat(runtime: &Runtime, args: &[Value]) -> Result<Completion> {
    let mut result = String::new();
    for value in args {
        result.push_str(&text(runtime, value)?);
    }
    returns(Value::string(&result))
}

fn string_equals(_: &Runtime, args: &[Value]) -> Result<Completion> {
    returns(Value::bool(args.first().map(Value::as_str) == args.get(1).map(Value::as_str)))
}

fn string_not_equals(_: &Runtime, args: &[Value]) -> Result<Completion> {
    returns(Value::bool(args.first().map(Value::as_str) != args.get(1).map(Value::as_str)))
}

fn string_length(runtime: &Runtime, args: &[Value]) -> Result<Completion> {
    match receiver(args, "String::get_Length")? {
        Value::String(s) => returns(Value::I4(s.encode_utf16().count() as i32)),
        _ => runtime.throw_new("System", "NullReferenceException", "Length of a null string"),
    }
}

fn string_is_null_or_empty(_: &Runtime, args: &[Value]) -> Result<Completion> {
    let empty = args.first().and_then(Value::as_str).map_or(true, str::is_empty);
    returns(Value::bool(empty))
}

fn string_to_string(_: &Runtime, args: &[Value]) -> Result<Completion> {
    returns(receiver(args, "String::ToString")?.clone())
}

fn delegate_operand(value: Option<&Value>) -> Result<Option<&Arc<DelegateValue>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Delegate(d)) => Ok(Some(d)),
        Some(other) => Err(Error::Execution(format!(
            "Delegate operation on a {}",
            other.kind()
        ))),
    }
}

fn delegate_combine(runtime: &Runtime, args: &[Value]) -> Result<Completion> {
    let (a, b) = (delegate_operand(args.first())?, delegate_operand(args.get(1))?);
    match DelegateValue::combine(a, b) {
        Ok(combined) => returns(combined.map_or(Value::Null, Value::Delegate)),
        Err(e) => runtime.throw_new("System", "ArgumentException", &e.to_string()),
    }
}

fn delegate_remove(_: &Runtime, args: &[Value]) -> Result<Completion> {
    let (a, b) = (delegate_operand(args.first())?, delegate_operand(args.get(1))?);
    returns(DelegateValue::remove(a, b).map_or(Value::Null, Value::Delegate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::model::MethodId;

    fn corlib_method(runtime: &Runtime, ty: &str, name: &str, params: usize) -> RuntimeMethodId {
        let ty = runtime.corlib_type("System", ty).unwrap();
        runtime.find_method(ty, name, params).unwrap()
    }

    #[test]
    fn every_internal_call_has_an_implementation() {
        let runtime = Runtime::new().unwrap();
        let module = runtime.module(CORLIB_INDEX).unwrap();
        for id in module.method_ids() {
            let method = RuntimeMethodId {
                assembly: CORLIB_INDEX,
                method: id,
            };
            let def = runtime.method_def(method).unwrap();
            if def.impl_flags.contains(MethodImplAttributes::INTERNAL_CALL) {
                assert!(
                    lookup(&runtime, method).unwrap().is_some(),
                    "{} has no intrinsic",
                    runtime.method_name(method)
                );
            }
        }
    }

    #[test]
    fn string_members() {
        let runtime = Runtime::new().unwrap();
        let concat = corlib_method(&runtime, "String", "Concat", 3);
        let result = runtime
            .invoke(concat, vec!["a".into(), Value::Null, "c".into()])
            .unwrap();
        assert_eq!(result.as_str(), Some("ac"));

        let length = corlib_method(&runtime, "String", "get_Length", 0);
        assert!(matches!(runtime.invoke(length, vec!["héllo".into()]).unwrap(), Value::I4(5)));
        assert!(runtime.invoke(length, vec![Value::Null]).is_err());
    }

    #[test]
    fn methods_outside_corlib_are_not_intrinsics() {
        let runtime = Runtime::new().unwrap();
        let method = RuntimeMethodId {
            assembly: 1,
            method: MethodId { ty: 0, index: 0 },
        };
        assert!(lookup(&runtime, method).unwrap().is_none());
    }
}
