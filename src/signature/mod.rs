//! Structural type and method signatures.
//!
//! A signature identifies a type or method by structure alone, so "the same" method yields the
//! same string in two builds of an assembly and in the loaded process. Tokens, load order and
//! generic parameter names never take part.
//!
//! Both views describe themselves as a neutral [`TypeDesc`] / [`MethodDesc`] and share one
//! formatter:
//!
//! - [`binary`] describes definitions of a [`ModuleDef`] as read from disk
//! - [`runtime`] describes definitions loaded into a [`crate::runtime::Runtime`], following
//!   references into the assemblies that define them
//!
//! # Format
//!
//! ```text
//! type    Namespace.Outer+Inner`1
//! method  Name`2<System.Int32,!0,!2,Game.Box`1[.T1]>
//! ```
//!
//! - The namespace is omitted when empty; nesting is joined with `+`
//! - A generic method carries its arity as `` `N``
//! - A parameter that is a generic parameter renders `!<pos>`; method parameters are offset by
//!   the arity of the declaring type
//! - Generic instances in parameter position append `[args]`, where a generic parameter renders
//!   `.T<pos>` with the same offset
//! - By-ref, array and pointer types append `&`, `[]` and `*` to the element name, without the
//!   element's generic arguments
//!
//! # Examples
//!
//! ```rust
//! use dotweave::signature::{method_signature, MethodDesc, TypeDesc};
//!
//! let desc = MethodDesc {
//!     name: "Swap".to_string(),
//!     generic_arity: 1,
//!     class_arity: 0,
//!     params: vec![
//!         TypeDesc::ByRef(Box::new(TypeDesc::GenericParam { position: 0, method: true })),
//!         TypeDesc::named("System", "Int32"),
//!     ],
//! };
//! assert_eq!(method_signature(&desc), "Swap`1<!0&,System.Int32>");
//! ```

pub mod binary;
pub mod runtime;

pub use binary::{BinaryMethod, BinaryType};
pub use runtime::{RuntimeMethod, RuntimeType};

use std::fmt::Write;

use crate::{
    metadata::model::{MethodId, ModuleDef},
    Result,
};

/// Neutral structural description of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    /// A nominal type, possibly an instantiated generic
    Named {
        /// Namespace of the outermost enclosing type
        namespace: String,
        /// Names from the outermost enclosing type down to the type itself
        path: Vec<String>,
        /// Generic arguments of an instantiation, empty otherwise
        args: Vec<TypeDesc>,
    },
    /// A generic parameter by position
    GenericParam {
        /// Position in the declaring type's or method's parameter list
        position: u32,
        /// `true` for method generic parameters
        method: bool,
    },
    /// Managed pointer
    ByRef(Box<TypeDesc>),
    /// Single-dimensional array
    SzArray(Box<TypeDesc>),
    /// Unmanaged pointer
    Pointer(Box<TypeDesc>),
}

impl TypeDesc {
    /// A top-level, non-generic named type.
    #[must_use]
    pub fn named(namespace: &str, name: &str) -> TypeDesc {
        TypeDesc::Named {
            namespace: namespace.to_string(),
            path: vec![name.to_string()],
            args: Vec::new(),
        }
    }

    /// `true` for managed pointers.
    #[must_use]
    pub fn is_by_ref(&self) -> bool {
        matches!(self, TypeDesc::ByRef(_))
    }
}

/// Neutral structural description of a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDesc {
    /// Method name
    pub name: String,
    /// Number of method generic parameters
    pub generic_arity: u32,
    /// Number of generic parameters of the declaring type
    pub class_arity: u32,
    /// Declared parameter types, receiver excluded
    pub params: Vec<TypeDesc>,
}

/// A type that can describe its own structure.
pub trait StructuralType {
    /// The structural description.
    ///
    /// # Errors
    /// Returns an error if a referenced type cannot be described.
    fn describe(&self) -> Result<TypeDesc>;

    /// The structural signature string.
    ///
    /// # Errors
    /// Returns an error if a referenced type cannot be described.
    fn signature(&self) -> Result<String> {
        Ok(type_signature(&self.describe()?))
    }
}

/// A method that can describe its own structure.
pub trait StructuralMethod {
    /// The structural description.
    ///
    /// # Errors
    /// Returns an error if a parameter type cannot be described.
    fn describe(&self) -> Result<MethodDesc>;

    /// The structural signature string.
    ///
    /// # Errors
    /// Returns an error if a parameter type cannot be described.
    fn signature(&self) -> Result<String> {
        Ok(method_signature(&self.describe()?))
    }
}

/// Render a type signature without generic context.
#[must_use]
pub fn type_signature(desc: &TypeDesc) -> String {
    let mut out = String::new();
    write_type(&mut out, desc, None);
    out
}

/// Render a method signature.
#[must_use]
pub fn method_signature(desc: &MethodDesc) -> String {
    let mut out = String::with_capacity(desc.name.len() + 16);
    out.push_str(&desc.name);
    if desc.generic_arity > 0 {
        let _ = write!(out, "`{}", desc.generic_arity);
    }
    out.push('<');
    for (i, param) in desc.params.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match param {
            TypeDesc::GenericParam { position, method } => {
                let _ = write!(out, "!{}", offset(*position, *method, desc.class_arity));
            }
            other => write_type(&mut out, other, Some(desc.class_arity)),
        }
    }
    out.push('>');
    out
}

fn offset(position: u32, method: bool, class_arity: u32) -> u32 {
    if method {
        position + class_arity
    } else {
        position
    }
}

fn write_type(out: &mut String, desc: &TypeDesc, context: Option<u32>) {
    match desc {
        TypeDesc::Named { namespace, path, args } => {
            write_name(out, namespace, path);
            let Some(class_arity) = context else { return };
            if args.is_empty() {
                return;
            }
            out.push('[');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                match arg {
                    TypeDesc::GenericParam { position, method } => {
                        let _ = write!(out, ".T{}", offset(*position, *method, class_arity));
                    }
                    other => write_type(out, other, context),
                }
            }
            out.push(']');
        }
        TypeDesc::GenericParam { position, method } => {
            let _ = write!(out, "!{}", offset(*position, *method, context.unwrap_or(0)));
        }
        TypeDesc::ByRef(_) | TypeDesc::SzArray(_) | TypeDesc::Pointer(_) => {
            write_compound(out, desc, context.unwrap_or(0));
        }
    }
}

fn write_compound(out: &mut String, desc: &TypeDesc, class_arity: u32) {
    match desc {
        TypeDesc::Named { namespace, path, .. } => write_name(out, namespace, path),
        TypeDesc::GenericParam { position, method } => {
            let _ = write!(out, "!{}", offset(*position, *method, class_arity));
        }
        TypeDesc::ByRef(inner) => {
            write_compound(out, inner, class_arity);
            out.push('&');
        }
        TypeDesc::SzArray(inner) => {
            write_compound(out, inner, class_arity);
            out.push_str("[]");
        }
        TypeDesc::Pointer(inner) => {
            write_compound(out, inner, class_arity);
            out.push('*');
        }
    }
}

fn write_name(out: &mut String, namespace: &str, path: &[String]) {
    if !namespace.is_empty() {
        out.push_str(namespace);
        out.push('.');
    }
    for (i, name) in path.iter().enumerate() {
        if i > 0 {
            out.push('+');
        }
        out.push_str(name);
    }
}

/// Find a type definition of `module` by signature.
///
/// The first `+`-separated part must equal the signature of a top-level type; every further
/// part names a nested type of the previous one.
#[must_use]
pub fn find_type_by_signature(module: &ModuleDef, signature: &str) -> Option<usize> {
    let mut parts = signature.split('+');
    let first = parts.next()?;
    let mut current = module.top_level_types().find(|&index| {
        BinaryType::new(module, index)
            .signature()
            .is_ok_and(|s| s == first)
    })?;
    for name in parts {
        current = module.find_nested_type(current, name)?;
    }
    Some(current)
}

/// Find the first method of type `ty` whose signature equals `signature`.
#[must_use]
pub fn find_method_by_signature(module: &ModuleDef, ty: usize, signature: &str) -> Option<MethodId> {
    let def = module.types.get(ty)?;
    (0..def.methods.len())
        .map(|index| MethodId { ty, index })
        .find(|&id| {
            BinaryMethod::new(module, id)
                .signature()
                .is_ok_and(|s| s == signature)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic(position: u32, method: bool) -> TypeDesc {
        TypeDesc::GenericParam { position, method }
    }

    #[test]
    fn type_signatures() {
        let nested = TypeDesc::Named {
            namespace: "Game.Core".to_string(),
            path: vec!["Outer".to_string(), "Inner`1".to_string()],
            args: vec![TypeDesc::named("System", "Int32")],
        };
        assert_eq!(type_signature(&nested), "Game.Core.Outer+Inner`1");
        assert_eq!(type_signature(&TypeDesc::named("", "Global")), "Global");
    }

    #[test]
    fn generic_parameters_are_positional() {
        let desc = MethodDesc {
            name: "Map".to_string(),
            generic_arity: 2,
            class_arity: 1,
            params: vec![
                generic(0, false),
                generic(1, true),
                TypeDesc::Named {
                    namespace: "System".to_string(),
                    path: vec!["Func`2".to_string()],
                    args: vec![generic(0, true), generic(0, false)],
                },
            ],
        };
        assert_eq!(method_signature(&desc), "Map`2<!0,!2,System.Func`2[.T1,.T0]>");
    }

    #[test]
    fn compound_types_drop_arguments() {
        let list = TypeDesc::Named {
            namespace: "Game".to_string(),
            path: vec!["List`1".to_string()],
            args: vec![TypeDesc::named("System", "String")],
        };
        let desc = MethodDesc {
            name: "Fill".to_string(),
            generic_arity: 0,
            class_arity: 0,
            params: vec![
                TypeDesc::ByRef(Box::new(list)),
                TypeDesc::SzArray(Box::new(TypeDesc::named("System", "Byte"))),
                TypeDesc::Pointer(Box::new(TypeDesc::named("System", "Int32"))),
            ],
        };
        assert_eq!(
            method_signature(&desc),
            "Fill<Game.List`1&,System.Byte[],System.Int32*>"
        );
    }

    #[test]
    fn parameterless_method() {
        let desc = MethodDesc {
            name: ".ctor".to_string(),
            generic_arity: 0,
            class_arity: 0,
            params: Vec::new(),
        };
        assert_eq!(method_signature(&desc), ".ctor<>");
    }
}
