//! Copying a method under a new name.
//!
//! The copy keeps everything that makes the body behave the same: calling convention,
//! parameters, generic parameters, implementation flags, locals, instructions, exception
//! handlers and sequence points. Bodies address positions by instruction index, so handler
//! regions and sequence points carry over without an offset table. Custom attributes stay on
//! the original.
//!
//! The clone is private and never virtual, abstract, final or new-slot; a virtual original keeps
//! its vtable slot and the clone is reached by a direct call from the stub.
//!
//! # Examples
//!
//! ```rust
//! use dotweave::{
//!     metadata::{
//!         builder::{MethodBuilder, TypeBuilder},
//!         flags::MethodAttributes,
//!         model::ModuleDef,
//!         signatures::TypeSig,
//!     },
//!     weaver::clone::clone_method,
//! };
//!
//! let mut module = ModuleDef::new("Game");
//! let object = module.corlib_type("System", "Object");
//! let player = TypeBuilder::new("Game", "Player").extends(object).build(&mut module);
//! let tick = MethodBuilder::new("Tick")
//!     .returns(TypeSig::I4)
//!     .implementation(|asm| {
//!         asm.ldc_i4(1)?.ret()?;
//!         Ok(())
//!     })
//!     .build(&mut module, player)?;
//!
//! let copy = clone_method(&mut module, tick, "OriginMethod_Tick_000001")?;
//! let clone = module.method(copy)?;
//! assert!(clone.flags.has_access(MethodAttributes::PRIVATE));
//! assert_eq!(clone.body, module.method(tick)?.body);
//! # Ok::<(), dotweave::Error>(())
//! ```

use crate::{
    metadata::{
        flags::MethodAttributes,
        model::{MethodDef, MethodId, ModuleDef},
        token::Token,
    },
    Result,
};

/// Attributes removed from a clone on top of its accessibility.
const DROPPED_ATTRIBUTES: MethodAttributes = MethodAttributes::VIRTUAL
    .union(MethodAttributes::NEW_SLOT)
    .union(MethodAttributes::ABSTRACT)
    .union(MethodAttributes::FINAL);

/// The method definition a clone of `source` named `name` starts out as.
#[must_use]
pub fn cloned_definition(source: &MethodDef, name: &str) -> MethodDef {
    let flags = source
        .flags
        .difference(DROPPED_ATTRIBUTES)
        .with_access(MethodAttributes::PRIVATE);
    MethodDef {
        name: name.to_string(),
        flags,
        impl_flags: source.impl_flags,
        signature: source.signature.clone(),
        params: source.params.clone(),
        generic_params: source.generic_params.clone(),
        body: source.body.clone(),
        custom_attributes: Vec::new(),
        token: Token::default(),
    }
}

/// Add a private copy of `source` named `name` to the declaring type.
///
/// # Errors
/// Returns an error if `source` does not exist or its body does not validate.
pub fn clone_method(module: &mut ModuleDef, source: MethodId, name: &str) -> Result<MethodId> {
    let clone = cloned_definition(module.method(source)?, name);
    if let Some(body) = &clone.body {
        body.validate()?;
    }
    module.add_method(source.ty, clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        body::SequencePoint,
        builder::{MethodBuilder, TypeBuilder},
        flags::{ExceptionHandlerFlags, ParamAttributes},
        signatures::TypeSig,
    };

    #[test]
    fn clone_keeps_body_and_drops_dispatch_attributes() {
        let mut module = ModuleDef::new("Game");
        let object = module.corlib_type("System", "Object");
        let exception = module.corlib_type("System", "Exception");
        let ty = TypeBuilder::new("Game", "Player").extends(object).build(&mut module);
        let source = MethodBuilder::new("Guarded")
            .virtual_method()
            .param_with("result", TypeSig::I4.by_ref(), ParamAttributes::OUT)
            .local(TypeSig::I4)
            .implementation(move |asm| {
                asm.label("try")?
                    .ldarg_1()?
                    .ldc_i4(7)?
                    .stind_i4()?
                    .leave_s("end")?
                    .label("catch")?
                    .pop()?
                    .leave_s("end")?
                    .label("end")?
                    .ret()?
                    .catch_handler("try", "catch", "catch", "end", exception)?;
                Ok(())
            })
            .build(&mut module, ty)
            .unwrap();
        module
            .method_mut(source)
            .unwrap()
            .body
            .as_mut()
            .unwrap()
            .sequence_points
            .push(SequencePoint {
                index: 1,
                document: "Player.cs".into(),
                start_line: 10,
                start_column: 9,
                end_line: 10,
                end_column: 20,
            });

        let clone = clone_method(&mut module, source, "OriginMethod_Guarded_000001").unwrap();
        let original = module.method(source).unwrap();
        let copy = module.method(clone).unwrap();

        assert_eq!(copy.name, "OriginMethod_Guarded_000001");
        assert!(!copy.is_virtual());
        assert!(copy.flags.has_access(MethodAttributes::PRIVATE));
        assert!(copy.flags.contains(MethodAttributes::HIDE_BY_SIG));
        assert_eq!(copy.signature, original.signature);
        assert_eq!(copy.params, original.params);
        assert!(copy.custom_attributes.is_empty());

        let (a, b) = (original.body.as_ref().unwrap(), copy.body.as_ref().unwrap());
        assert_eq!(a.instructions, b.instructions);
        assert_eq!(a.locals, b.locals);
        assert_eq!(b.exception_handlers.len(), 1);
        assert_eq!(b.exception_handlers[0].flags, ExceptionHandlerFlags::EXCEPTION);
        assert_eq!(b.exception_handlers[0].try_start, 0);
        assert_eq!(b.exception_handlers[0].handler_start, 4);
        assert_eq!(b.exception_handlers[0].handler_end, 6);
        assert_eq!(b.sequence_points, a.sequence_points);
    }
}
