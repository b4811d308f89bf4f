//! The marker attribute carried by every woven method.
//!
//! The marker type is defined inside the woven module on first use:
//!
//! ```text
//! public class DotWeave.Injection.InjectedMethodAttribute : System.Attribute
//! {
//!     public int32 originalToken;
//!     public .ctor(int32 token) { ldarg.0; ldarg.1; stfld originalToken; ret }
//! }
//! ```
//!
//! A method is woven iff it carries the attribute. The attribute's single argument is the
//! method's [`StableId`]; presence and identifier are separate queries.

use crate::{
    metadata::{
        builder::{MethodBuilder, TypeBuilder},
        flags::{FieldAttributes, TypeAttributes},
        model::{
            AttributeArg, CustomAttribute, FieldDef, FieldHandle, FieldId, MethodDef, MethodHandle,
            MethodId, ModuleDef,
        },
        signatures::TypeSig,
        token::StableId,
    },
    Result,
};

/// Namespace of the marker type.
pub const MARKER_NAMESPACE: &str = "DotWeave.Injection";
/// Name of the marker type.
pub const MARKER_NAME: &str = "InjectedMethodAttribute";
/// Name of the marker's token field.
pub const MARKER_FIELD: &str = "originalToken";

/// Constructor of the marker type in `module`, defining the type if it is missing.
///
/// # Errors
/// Returns an error if the constructor cannot be assembled, or a synthesis error if a type of
/// that name exists without the expected constructor.
pub fn ensure_marker_type(module: &mut ModuleDef) -> Result<MethodHandle> {
    if let Some(ty) = module.find_type(MARKER_NAMESPACE, MARKER_NAME) {
        let ctor = module.types[ty]
            .methods
            .iter()
            .position(|m| m.name == ".ctor" && m.signature.params == [TypeSig::I4])
            .ok_or_else(|| synthesis_error!("{}.{} has no .ctor(int32)", MARKER_NAMESPACE, MARKER_NAME))?;
        return Ok(MethodHandle::Def(MethodId { ty, index: ctor }));
    }

    let attribute = module.corlib_type("System", "Attribute");
    let ty = TypeBuilder::new(MARKER_NAMESPACE, MARKER_NAME)
        .flags(TypeAttributes::PUBLIC)
        .extends(attribute)
        .build(module);
    let field = module.add_field(ty, FieldDef::new(MARKER_FIELD, FieldAttributes::PUBLIC, TypeSig::I4))?;
    let ctor = MethodBuilder::constructor()
        .param("token", TypeSig::I4)
        .implementation(move |asm| {
            asm.ldarg_0()?
                .ldarg_1()?
                .stfld(FieldHandle::Def(field))?
                .ret()?;
            Ok(())
        })
        .build(module, ty)?;
    log::debug!("Defined {MARKER_NAMESPACE}.{MARKER_NAME} in {}", module.name);
    Ok(MethodHandle::Def(ctor))
}

/// The marker attached to `method`, if any.
#[must_use]
pub fn marker_of<'a>(module: &ModuleDef, method: &'a MethodDef) -> Option<&'a CustomAttribute> {
    method
        .custom_attributes
        .iter()
        .find(|attr| module.has_attribute(std::slice::from_ref(attr), MARKER_NAMESPACE, MARKER_NAME))
}

/// `true` if `method` carries the marker.
#[must_use]
pub fn is_woven(module: &ModuleDef, method: &MethodDef) -> bool {
    marker_of(module, method).is_some()
}

/// The stable identifier stored in the marker of `method`.
///
/// `None` if the method is not woven or the marker carries no int32 argument.
#[must_use]
pub fn stable_id(module: &ModuleDef, method: &MethodDef) -> Option<StableId> {
    match marker_of(module, method)?.args.first()? {
        #[allow(clippy::cast_sign_loss)]
        AttributeArg::I4(value) => Some(StableId::new(*value as u32)),
        _ => None,
    }
}

/// Attach the marker carrying `id` to `method`, unless it already has one.
///
/// Returns `true` if the marker was added.
///
/// # Errors
/// Returns an error if the marker type cannot be defined or the method does not exist.
pub fn mark(module: &mut ModuleDef, method: MethodId, id: StableId) -> Result<bool> {
    if is_woven(module, module.method(method)?) {
        return Ok(false);
    }
    let ctor = ensure_marker_type(module)?;
    module.method_mut(method)?.custom_attributes.push(CustomAttribute {
        ctor,
        args: vec![AttributeArg::I4(id.as_i32())],
    });
    Ok(true)
}

/// Token field of the marker type, if the module defines one.
#[must_use]
pub fn marker_field(module: &ModuleDef) -> Option<FieldId> {
    let ty = module.find_type(MARKER_NAMESPACE, MARKER_NAME)?;
    let index = module.types[ty].field_index(MARKER_FIELD)?;
    Some(FieldId { ty, index })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::builder::MethodBuilder;

    fn module_with_method() -> (ModuleDef, MethodId) {
        let mut module = ModuleDef::new("Game");
        let object = module.corlib_type("System", "Object");
        let ty = TypeBuilder::new("Game", "Player").extends(object).build(&mut module);
        let method = MethodBuilder::new("Run")
            .implementation(|asm| {
                asm.ret()?;
                Ok(())
            })
            .build(&mut module, ty)
            .unwrap();
        (module, method)
    }

    #[test]
    fn marker_type_is_defined_once() {
        let (mut module, _) = module_with_method();
        let first = ensure_marker_type(&mut module).unwrap();
        let second = ensure_marker_type(&mut module).unwrap();
        assert_eq!(first, second);

        let ty = module.find_type(MARKER_NAMESPACE, MARKER_NAME).unwrap();
        let def = &module.types[ty];
        assert_eq!(module.type_full_name(def.extends.unwrap()), "System.Attribute");
        assert_eq!(def.fields[0].name, MARKER_FIELD);
        assert!(def.fields[0].flags.contains(FieldAttributes::PUBLIC));
        assert_eq!(marker_field(&module), Some(FieldId { ty, index: 0 }));

        let ctor = &def.methods[0];
        let body = ctor.body.as_ref().unwrap();
        assert_eq!(body.instructions.len(), 4);
    }

    #[test]
    fn presence_and_identifier_are_separate() {
        let (mut module, method) = module_with_method();
        assert!(!is_woven(&module, module.method(method).unwrap()));
        assert_eq!(stable_id(&module, module.method(method).unwrap()), None);

        assert!(mark(&mut module, method, StableId::new(0x12)).unwrap());
        assert!(!mark(&mut module, method, StableId::new(0x34)).unwrap());

        let def = module.method(method).unwrap();
        assert!(is_woven(&module, def));
        assert_eq!(def.custom_attributes.len(), 1);
        assert_eq!(stable_id(&module, def), Some(StableId::new(0x12)));
    }

    #[test]
    fn marker_without_argument_has_no_identifier() {
        let (mut module, method) = module_with_method();
        let ctor = ensure_marker_type(&mut module).unwrap();
        module.method_mut(method).unwrap().custom_attributes.push(CustomAttribute {
            ctor,
            args: Vec::new(),
        });
        let def = module.method(method).unwrap();
        assert!(is_woven(&module, def));
        assert_eq!(stable_id(&module, def), None);
    }
}
