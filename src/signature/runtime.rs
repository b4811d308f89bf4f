//! Signatures of definitions loaded into a [`Runtime`].
//!
//! Parameter types are described through the definitions their references resolve to, so a
//! method signature computed here matches the one computed from the defining image even when
//! the referencing assembly spells a type differently. References that do not resolve fall
//! back to the names the referencing assembly carries.

use crate::{
    metadata::{model::TypeHandle, signatures::TypeSig},
    runtime::{Runtime, RuntimeMethodId, RuntimeTypeId},
    signature::{
        binary::{describe_handle, describe_sig},
        find_type_by_signature, MethodDesc, StructuralMethod, StructuralType, TypeDesc,
    },
    Error, Result,
};

/// A type loaded into a [`Runtime`].
#[derive(Clone, Copy)]
pub struct RuntimeType<'a> {
    runtime: &'a Runtime,
    id: RuntimeTypeId,
}

impl<'a> RuntimeType<'a> {
    /// View the loaded type `id`.
    #[must_use]
    pub fn new(runtime: &'a Runtime, id: RuntimeTypeId) -> Self {
        RuntimeType { runtime, id }
    }
}

impl StructuralType for RuntimeType<'_> {
    fn describe(&self) -> Result<TypeDesc> {
        describe_handle(self.runtime.module(self.id.assembly)?, TypeHandle::Def(self.id.ty))
    }
}

/// A method loaded into a [`Runtime`].
#[derive(Clone, Copy)]
pub struct RuntimeMethod<'a> {
    runtime: &'a Runtime,
    id: RuntimeMethodId,
}

impl<'a> RuntimeMethod<'a> {
    /// View the loaded method `id`.
    #[must_use]
    pub fn new(runtime: &'a Runtime, id: RuntimeMethodId) -> Self {
        RuntimeMethod { runtime, id }
    }
}

impl StructuralMethod for RuntimeMethod<'_> {
    fn describe(&self) -> Result<MethodDesc> {
        let method = self.runtime.method_def(self.id)?;
        let owner = self.runtime.type_def(self.id.declaring_type())?;
        Ok(MethodDesc {
            name: method.name.clone(),
            generic_arity: method.generic_params.len() as u32,
            class_arity: owner.generic_params.len() as u32,
            params: method
                .signature
                .params
                .iter()
                .map(|p| describe_resolved(self.runtime, self.id.assembly, p))
                .collect::<Result<_>>()?,
        })
    }
}

fn describe_resolved(runtime: &Runtime, assembly: usize, signature: &TypeSig) -> Result<TypeDesc> {
    let module = runtime.module(assembly)?;
    let nominal = |handle: TypeHandle| -> Result<TypeDesc> {
        match handle {
            TypeHandle::Ref(_) => match runtime.resolve_type(assembly, handle) {
                Ok(def) => RuntimeType::new(runtime, def).describe(),
                Err(e) => {
                    log::debug!("Describing unresolved {}: {e}", module.type_full_name(handle));
                    describe_handle(module, handle)
                }
            },
            _ => describe_handle(module, handle),
        }
    };

    Ok(match signature {
        TypeSig::Class(handle) | TypeSig::ValueType(handle) => nominal(*handle)?,
        TypeSig::GenericInst { base, args, .. } => match nominal(*base)? {
            TypeDesc::Named { namespace, path, .. } => TypeDesc::Named {
                namespace,
                path,
                args: args
                    .iter()
                    .map(|a| describe_resolved(runtime, assembly, a))
                    .collect::<Result<_>>()?,
            },
            _ => return Err(malformed_error!("Generic instance over a non-nominal type")),
        },
        TypeSig::ByRef(inner) => TypeDesc::ByRef(Box::new(describe_resolved(runtime, assembly, inner)?)),
        TypeSig::Ptr(inner) => TypeDesc::Pointer(Box::new(describe_resolved(runtime, assembly, inner)?)),
        TypeSig::SzArray(inner) => TypeDesc::SzArray(Box::new(describe_resolved(runtime, assembly, inner)?)),
        other => describe_sig(module, other)?,
    })
}

/// Find a loaded type of `assembly` by signature.
///
/// # Errors
/// Returns [`Error::TypeNotFound`] if no type matches.
pub fn find_type(runtime: &Runtime, assembly: usize, klass: &str) -> Result<RuntimeTypeId> {
    find_type_by_signature(runtime.module(assembly)?, klass)
        .map(|ty| RuntimeTypeId { assembly, ty })
        .ok_or_else(|| Error::TypeNotFound(klass.to_string()))
}

/// Find a loaded method of `assembly` by type and method signature.
///
/// # Errors
/// Returns [`Error::TypeNotFound`] or [`Error::MethodNotFound`] if nothing matches.
pub fn find_method(runtime: &Runtime, assembly: usize, klass: &str, method: &str) -> Result<RuntimeMethodId> {
    let ty = find_type(runtime, assembly, klass)?;
    let count = runtime.type_def(ty)?.methods.len();
    for index in 0..count {
        let id = RuntimeMethodId {
            assembly,
            method: crate::metadata::model::MethodId { ty: ty.ty, index },
        };
        if RuntimeMethod::new(runtime, id).signature().is_ok_and(|s| s == method) {
            return Ok(id);
        }
    }
    Err(Error::MethodNotFound {
        klass: klass.to_string(),
        method: method.to_string(),
    })
}
