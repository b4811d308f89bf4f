//! Delegates and their invocation lists.
//!
//! A [`DelegateValue`] is immutable: [`DelegateValue::combine`] and [`DelegateValue::remove`]
//! return new values, exactly like `System.Delegate.Combine` and `Remove`. Invoking a delegate
//! calls every entry of its list front to back and yields the result of the last call.

use std::{fmt, sync::Arc};

use crate::{
    runtime::{interpreter::Completion, value::Value, Runtime, RuntimeMethodId, RuntimeTypeId},
    Error, Result,
};

/// A native callable: receives the `Invoke` arguments and returns the result.
pub type NativeFn = Arc<dyn Fn(&Runtime, &[Value]) -> Result<Value> + Send + Sync>;

/// One entry of an invocation list.
#[derive(Clone)]
pub enum Callable {
    /// A managed method, bound to `target` or open over its receiver
    Method {
        /// Bound receiver; `None` for static methods and open instance delegates
        target: Option<Value>,
        /// The method to call
        method: RuntimeMethodId,
    },
    /// A host function
    Native(NativeFn),
}

impl Callable {
    fn same(&self, other: &Callable) -> bool {
        match (self, other) {
            (
                Callable::Method { target: ta, method: ma },
                Callable::Method { target: tb, method: mb },
            ) => {
                ma == mb
                    && match (ta, tb) {
                        (None, None) => true,
                        (Some(a), Some(b)) => a.same(b),
                        _ => false,
                    }
            }
            (Callable::Native(a), Callable::Native(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Method { target, method } => f
                .debug_struct("Method")
                .field("target", target)
                .field("method", method)
                .finish(),
            Callable::Native(_) => write!(f, "Native"),
        }
    }
}

/// An instance of a delegate type.
#[derive(Debug, Clone)]
pub struct DelegateValue {
    /// The delegate type
    pub ty: RuntimeTypeId,
    /// Invocation list, never empty
    pub invocation: Vec<Callable>,
}

impl DelegateValue {
    /// A delegate with a single entry.
    #[must_use]
    pub fn new(ty: RuntimeTypeId, callable: Callable) -> Self {
        DelegateValue {
            ty,
            invocation: vec![callable],
        }
    }

    /// A delegate over a host function.
    pub fn native<F>(ty: RuntimeTypeId, f: F) -> Self
    where
        F: Fn(&Runtime, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        DelegateValue::new(ty, Callable::Native(Arc::new(f)))
    }

    /// The same invocation list under another delegate type.
    #[must_use]
    pub fn retype(&self, ty: RuntimeTypeId) -> DelegateValue {
        DelegateValue {
            ty,
            invocation: self.invocation.clone(),
        }
    }

    /// Concatenate two invocation lists, `first` before `second`. Null operands are skipped.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if both operands are present and their types differ.
    pub fn combine(
        first: Option<&Arc<DelegateValue>>,
        second: Option<&Arc<DelegateValue>>,
    ) -> Result<Option<Arc<DelegateValue>>> {
        match (first, second) {
            (None, other) | (other, None) => Ok(other.cloned()),
            (Some(a), Some(b)) => {
                if a.ty != b.ty {
                    return Err(Error::Execution(format!(
                        "Delegates to combine must be of the same type ({:?} and {:?})",
                        a.ty, b.ty
                    )));
                }
                let mut invocation = a.invocation.clone();
                invocation.extend(b.invocation.iter().cloned());
                Ok(Some(Arc::new(DelegateValue { ty: a.ty, invocation })))
            }
        }
    }

    /// Remove the last occurrence of `value`'s invocation list from `source`.
    ///
    /// Returns `None` if nothing remains.
    #[must_use]
    pub fn remove(
        source: Option<&Arc<DelegateValue>>,
        value: Option<&Arc<DelegateValue>>,
    ) -> Option<Arc<DelegateValue>> {
        let source = source?;
        let Some(value) = value else {
            return Some(Arc::clone(source));
        };
        let needle = &value.invocation;
        let haystack = &source.invocation;
        if needle.len() > haystack.len() {
            return Some(Arc::clone(source));
        }
        let found = (0..=haystack.len() - needle.len())
            .rev()
            .find(|&start| needle.iter().zip(&haystack[start..]).all(|(a, b)| a.same(b)));
        let Some(start) = found else {
            return Some(Arc::clone(source));
        };
        let mut invocation = haystack[..start].to_vec();
        invocation.extend(haystack[start + needle.len()..].iter().cloned());
        if invocation.is_empty() {
            None
        } else {
            Some(Arc::new(DelegateValue {
                ty: source.ty,
                invocation,
            }))
        }
    }

    /// Invoke every entry, returning the last result or the first exception.
    ///
    /// # Errors
    /// Returns an error if an entry cannot be executed.
    pub fn call(&self, runtime: &Runtime, args: &[Value]) -> Result<Completion> {
        let mut last = Completion::Return(Value::Null);
        for callable in &self.invocation {
            last = match callable {
                Callable::Native(f) => Completion::Return(f(runtime, args)?),
                Callable::Method { target, method } => {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    if let Some(target) = target {
                        full.push(target.clone());
                    }
                    full.extend(args.iter().cloned());
                    runtime.call(*method, full)?
                }
            };
            if matches!(last, Completion::Throw(_)) {
                break;
            }
        }
        Ok(last)
    }

    /// Invoke the delegate from host code.
    ///
    /// # Errors
    /// Returns [`Error::ManagedException`] if an entry throws.
    pub fn invoke(&self, runtime: &Runtime, args: &[Value]) -> Result<Value> {
        let completion = self.call(runtime, args)?;
        runtime.complete(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::model::MethodId;

    const TY: RuntimeTypeId = RuntimeTypeId { assembly: 0, ty: 1 };

    fn method(index: usize) -> Callable {
        Callable::Method {
            target: None,
            method: RuntimeMethodId {
                assembly: 1,
                method: MethodId { ty: 1, index },
            },
        }
    }

    fn single(callable: Callable) -> Arc<DelegateValue> {
        Arc::new(DelegateValue::new(TY, callable))
    }

    #[test]
    fn combine_concatenates() {
        let a = single(method(0));
        let b = single(method(1));
        let both = DelegateValue::combine(Some(&a), Some(&b)).unwrap().unwrap();
        assert_eq!(both.invocation.len(), 2);
        assert!(both.invocation[0].same(&method(0)));

        let alone = DelegateValue::combine(None, Some(&b)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&alone, &b));
        assert!(DelegateValue::combine(None, None).unwrap().is_none());
    }

    #[test]
    fn combine_requires_same_type() {
        let a = single(method(0));
        let b = Arc::new(DelegateValue::new(RuntimeTypeId { assembly: 0, ty: 2 }, method(1)));
        assert!(DelegateValue::combine(Some(&a), Some(&b)).is_err());
    }

    #[test]
    fn remove_takes_last_occurrence() {
        let a = single(method(0));
        let b = single(method(1));
        let ab = DelegateValue::combine(Some(&a), Some(&b)).unwrap();
        let aba = DelegateValue::combine(ab.as_ref(), Some(&a)).unwrap();

        let removed = DelegateValue::remove(aba.as_ref(), Some(&a)).unwrap();
        assert_eq!(removed.invocation.len(), 2);
        assert!(removed.invocation[1].same(&method(1)));

        assert!(DelegateValue::remove(Some(&a), Some(&a)).is_none());
        let untouched = DelegateValue::remove(Some(&a), Some(&b)).unwrap();
        assert!(Arc::ptr_eq(&untouched, &a));
    }

    #[test]
    fn natives_compare_by_identity() {
        let f: NativeFn = Arc::new(|_, _| Ok(Value::Null));
        let a = Callable::Native(Arc::clone(&f));
        let b = Callable::Native(f);
        let c = Callable::Native(Arc::new(|_, _| Ok(Value::Null)));
        assert!(a.same(&b));
        assert!(!a.same(&c));
    }
}
