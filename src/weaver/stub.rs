//! The forwarding body a woven method is rewritten to.
//!
//! ```text
//!     ldsfld   DelegateField_<m>_<id>
//!     brtrue.s HOOKED
//!     ldarg    0 .. n-1
//!     call     OriginMethod_<m>_<id>      // callvirt for virtual targets
//!     ret
//! HOOKED:
//!     ldsfld   DelegateField_<m>_<id>
//!     ldarg    0 .. n-1
//!     callvirt Invoke
//!     ret
//! ```
//!
//! Arguments are forwarded unchanged, so by-ref parameters stay by-ref on both paths.
//!
//! With the field unset the woven method behaves exactly like the original. The fix-up driver
//! sets the field at load time; from then on every call goes through the delegate, which
//! receives the receiver of instance methods as its first argument.
//!
//! [`step_through`] adds `System.Diagnostics.DebuggerStepThroughAttribute` so debuggers step
//! straight into the clone or the installed replacement instead of stopping in the stub.

use crate::{
    assembly::InstructionAssembler,
    metadata::{
        body::MethodBody,
        model::{CustomAttribute, FieldHandle, MemberSig, MethodHandle, MethodId, ModuleDef},
        signatures::{MethodSig, TypeSig},
    },
    Result,
};

const HOOKED: &str = "HOOKED";

/// Members the forwarding body refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingTargets {
    /// Static delegate field
    pub field: FieldHandle,
    /// Clone of the original body
    pub origin: MethodHandle,
    /// `Invoke` of the field's delegate type
    pub invoke: MethodHandle,
    /// Call the clone with `callvirt` instead of `call`
    pub virtual_origin: bool,
}

/// The forwarding body for a method taking `arg_count` arguments, receiver included.
///
/// # Errors
/// Returns an error if the body cannot be assembled or its stack depth cannot be computed.
pub fn forwarding_body(
    module: &ModuleDef,
    targets: ForwardingTargets,
    arg_count: usize,
    returns_value: bool,
) -> Result<MethodBody> {
    let arg_count = u16::try_from(arg_count)
        .map_err(|_| synthesis_error!("{} arguments cannot be forwarded", arg_count))?;

    let mut asm = InstructionAssembler::new();
    asm.ldsfld(targets.field)?.brtrue_s(HOOKED)?;
    for index in 0..arg_count {
        asm.ldarg(index)?;
    }
    if targets.virtual_origin {
        asm.callvirt(targets.origin)?;
    } else {
        asm.call(targets.origin)?;
    }
    asm.ret()?;

    asm.label(HOOKED)?.ldsfld(targets.field)?;
    for index in 0..arg_count {
        asm.ldarg(index)?;
    }
    asm.callvirt(targets.invoke)?.ret()?;

    let code = asm.finish()?;
    let mut body = MethodBody {
        max_stack: 0,
        init_locals: true,
        locals: Vec::new(),
        instructions: code.instructions,
        exception_handlers: code.exception_handlers,
        sequence_points: Vec::new(),
    };
    body.validate()?;
    body.max_stack = body.compute_max_stack(module, returns_value)?;
    Ok(body)
}

/// Replace the body of `method` with the forwarding body.
///
/// Locals, exception handlers and sequence points of the old body are discarded.
///
/// # Errors
/// Returns an error if `method` does not exist or the body cannot be built.
pub fn rewrite(module: &mut ModuleDef, method: MethodId, targets: ForwardingTargets) -> Result<()> {
    let signature = &module.method(method)?.signature;
    let (arg_count, returns_value) = (signature.arg_count(), !signature.ret.is_void());
    let body = forwarding_body(module, targets, arg_count, returns_value)?;
    module.method_mut(method)?.body = Some(body);
    Ok(())
}

/// Attach `System.Diagnostics.DebuggerStepThroughAttribute` to `method` unless present.
///
/// Returns `true` if the attribute was added.
///
/// # Errors
/// Returns an error if `method` does not exist.
pub fn step_through(module: &mut ModuleDef, method: MethodId) -> Result<bool> {
    const NAMESPACE: &str = "System.Diagnostics";
    const NAME: &str = "DebuggerStepThroughAttribute";

    if module.has_attribute(&module.method(method)?.custom_attributes, NAMESPACE, NAME) {
        return Ok(false);
    }
    let attribute = module.corlib_type(NAMESPACE, NAME);
    let ctor = module.member_ref(
        attribute,
        ".ctor",
        MemberSig::Method(MethodSig::instance(TypeSig::Void, Vec::new())),
    );
    module.method_mut(method)?.custom_attributes.push(CustomAttribute {
        ctor: MethodHandle::Ref(ctor),
        args: Vec::new(),
    });
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{OpCode, Operand},
        metadata::{
            builder::{MethodBuilder, TypeBuilder},
            flags::{FieldAttributes, MethodAttributes},
            model::{FieldDef, MethodId},
        },
    };

    fn fixture() -> (ModuleDef, MethodId, ForwardingTargets) {
        let mut module = ModuleDef::new("Game");
        let object = module.corlib_type("System", "Object");
        let ty = TypeBuilder::new("Game", "Player").extends(object).build(&mut module);
        let target = MethodBuilder::new("Greet")
            .param("name", TypeSig::String)
            .returns(TypeSig::String)
            .local(TypeSig::I4)
            .implementation(|asm| {
                asm.ldarg_1()?.ret()?;
                Ok(())
            })
            .build(&mut module, ty)
            .unwrap();
        let origin = MethodBuilder::new("OriginMethod_Greet_000001")
            .flags(MethodAttributes::PRIVATE | MethodAttributes::HIDE_BY_SIG)
            .param("name", TypeSig::String)
            .returns(TypeSig::String)
            .build(&mut module, ty)
            .unwrap();
        let delegate = crate::metadata::builder::DelegateBuilder::new("", "Delegate_Greet_000001")
            .nested_in(ty)
            .param("self", TypeSig::Object)
            .param("name", TypeSig::String)
            .returns(TypeSig::String)
            .build(&mut module)
            .unwrap();
        let field = module
            .add_field(
                ty,
                FieldDef::new(
                    "DelegateField_Greet_000001",
                    FieldAttributes::PUBLIC | FieldAttributes::STATIC,
                    TypeSig::Class(crate::metadata::model::TypeHandle::Def(delegate)),
                ),
            )
            .unwrap();
        let targets = ForwardingTargets {
            field: FieldHandle::Def(field),
            origin: MethodHandle::Def(origin),
            invoke: MethodHandle::Def(MethodId { ty: delegate, index: 1 }),
            virtual_origin: false,
        };
        (module, target, targets)
    }

    #[test]
    fn forwarding_shape() {
        let (mut module, target, targets) = fixture();
        rewrite(&mut module, target, targets).unwrap();
        let body = module.method(target).unwrap().body.as_ref().unwrap();

        let opcodes: Vec<OpCode> = body.instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            [
                OpCode::Ldsfld,
                OpCode::BrtrueS,
                OpCode::Ldarg0,
                OpCode::Ldarg1,
                OpCode::Call,
                OpCode::Ret,
                OpCode::Ldsfld,
                OpCode::Ldarg0,
                OpCode::Ldarg1,
                OpCode::Callvirt,
                OpCode::Ret,
            ]
        );
        assert_eq!(body.instructions[1].operand, Operand::Branch(6));
        assert_eq!(body.instructions[9].operand, Operand::Method(targets.invoke));
        assert!(body.locals.is_empty());
        assert!(body.exception_handlers.is_empty());
        assert!(body.init_locals);
        assert_eq!(body.max_stack, 3);
    }

    #[test]
    fn virtual_targets_call_the_origin_virtually() {
        let (mut module, target, mut targets) = fixture();
        targets.virtual_origin = true;
        rewrite(&mut module, target, targets).unwrap();
        let body = module.method(target).unwrap().body.as_ref().unwrap();
        assert_eq!(body.instructions[4].opcode, OpCode::Callvirt);
    }

    #[test]
    fn step_through_is_added_once() {
        let (mut module, target, _) = fixture();
        assert!(step_through(&mut module, target).unwrap());
        assert!(!step_through(&mut module, target).unwrap());
        let attributes = &module.method(target).unwrap().custom_attributes;
        assert_eq!(attributes.len(), 1);
        assert!(module.has_attribute(attributes, "System.Diagnostics", "DebuggerStepThroughAttribute"));
    }
}
