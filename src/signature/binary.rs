//! Signatures of definitions in a module image.

use crate::{
    metadata::{
        model::{MethodId, ModuleDef, ResolutionScope, TypeHandle},
        signatures::TypeSig,
    },
    signature::{MethodDesc, StructuralMethod, StructuralType, TypeDesc},
    Result,
};

/// A type definition of a [`ModuleDef`].
#[derive(Clone, Copy)]
pub struct BinaryType<'a> {
    module: &'a ModuleDef,
    index: usize,
}

impl<'a> BinaryType<'a> {
    /// View type `index` of `module`.
    #[must_use]
    pub fn new(module: &'a ModuleDef, index: usize) -> Self {
        BinaryType { module, index }
    }
}

impl StructuralType for BinaryType<'_> {
    fn describe(&self) -> Result<TypeDesc> {
        describe_handle(self.module, TypeHandle::Def(self.index))
    }
}

/// A method definition of a [`ModuleDef`].
#[derive(Clone, Copy)]
pub struct BinaryMethod<'a> {
    module: &'a ModuleDef,
    id: MethodId,
}

impl<'a> BinaryMethod<'a> {
    /// View method `id` of `module`.
    #[must_use]
    pub fn new(module: &'a ModuleDef, id: MethodId) -> Self {
        BinaryMethod { module, id }
    }
}

impl StructuralMethod for BinaryMethod<'_> {
    fn describe(&self) -> Result<MethodDesc> {
        let method = self.module.method(self.id)?;
        let owner = self.module.type_def(self.id.ty)?;
        Ok(MethodDesc {
            name: method.name.clone(),
            generic_arity: method.generic_params.len() as u32,
            class_arity: owner.generic_params.len() as u32,
            params: method
                .signature
                .params
                .iter()
                .map(|p| describe_sig(self.module, p))
                .collect::<Result<_>>()?,
        })
    }
}

/// Describe a signature type in the context of `module`.
///
/// # Errors
/// Returns an error if a referenced handle is dangling.
pub fn describe_sig(module: &ModuleDef, signature: &TypeSig) -> Result<TypeDesc> {
    if let Some((namespace, name)) = signature.primitive_name() {
        return Ok(TypeDesc::named(namespace, name));
    }
    Ok(match signature {
        TypeSig::Class(handle) | TypeSig::ValueType(handle) => describe_handle(module, *handle)?,
        TypeSig::GenericInst { base, args, .. } => match describe_handle(module, *base)? {
            TypeDesc::Named { namespace, path, .. } => TypeDesc::Named {
                namespace,
                path,
                args: args
                    .iter()
                    .map(|a| describe_sig(module, a))
                    .collect::<Result<_>>()?,
            },
            _ => return Err(malformed_error!("Generic instance over a non-nominal type")),
        },
        TypeSig::Var(position) => TypeDesc::GenericParam {
            position: *position,
            method: false,
        },
        TypeSig::MVar(position) => TypeDesc::GenericParam {
            position: *position,
            method: true,
        },
        TypeSig::ByRef(inner) => TypeDesc::ByRef(Box::new(describe_sig(module, inner)?)),
        TypeSig::Ptr(inner) => TypeDesc::Pointer(Box::new(describe_sig(module, inner)?)),
        TypeSig::SzArray(inner) => TypeDesc::SzArray(Box::new(describe_sig(module, inner)?)),
        _ => return Err(malformed_error!("Unexpected signature element {:?}", signature)),
    })
}

/// Describe a type handle by the names it carries in `module`.
///
/// # Errors
/// Returns an error if the handle is dangling.
pub fn describe_handle(module: &ModuleDef, handle: TypeHandle) -> Result<TypeDesc> {
    match handle {
        TypeHandle::Def(index) => {
            let mut path = Vec::new();
            let mut current = module.type_def(index)?;
            loop {
                path.push(current.name.clone());
                match current.enclosing {
                    Some(outer) => current = module.type_def(outer)?,
                    None => break,
                }
            }
            path.reverse();
            Ok(TypeDesc::Named {
                namespace: current.namespace.clone(),
                path,
                args: Vec::new(),
            })
        }
        TypeHandle::Ref(index) => {
            let mut path = Vec::new();
            let mut current = index;
            loop {
                let reference = module
                    .type_refs
                    .get(current)
                    .ok_or_else(|| malformed_error!("Dangling TypeRef #{}", current))?;
                path.push(reference.name.clone());
                match reference.scope {
                    ResolutionScope::TypeRef(outer) => current = outer,
                    _ => {
                        path.reverse();
                        return Ok(TypeDesc::Named {
                            namespace: reference.namespace.clone(),
                            path,
                            args: Vec::new(),
                        });
                    }
                }
            }
        }
        TypeHandle::Spec(index) => {
            let signature = module
                .type_specs
                .get(index)
                .ok_or_else(|| malformed_error!("Dangling TypeSpec #{}", index))?;
            describe_sig(module, signature)
        }
    }
}
