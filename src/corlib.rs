//! The base class library module.
//!
//! [`build`] produces `mscorlib` as an ordinary [`ModuleDef`]: the root types, the primitive
//! value types, strings, attributes, exceptions and the delegate family including the standard
//! `System.Func` and `System.Action` shapes. Members whose work cannot be expressed in CIL are
//! marked `internalcall` and implemented natively by [`crate::runtime`].
//!
//! The module is written and read like any other image, so a process can load it from disk or
//! have the runtime synthesize it on demand.

use crate::{
    metadata::{
        builder::{DelegateBuilder, MethodBuilder, TypeBuilder},
        flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, TypeAttributes},
        model::{
            FieldDef, FieldHandle, FieldId, MethodHandle, MethodId, ModuleDef, TypeHandle, Version,
            CORLIB_NAME,
        },
        signatures::TypeSig,
    },
    Result,
};

/// Largest arity of the standard `System.Func` family (parameters plus result).
pub const MAX_FUNC_ARITY: usize = 9;

/// Largest arity of the standard `System.Action` family.
pub const MAX_ACTION_ARITY: usize = 8;

/// Name of the private message field of `System.Exception`.
pub const EXCEPTION_MESSAGE_FIELD: &str = "_message";

const PRIMITIVES: [&str; 15] = [
    "Void", "Boolean", "Char", "SByte", "Byte", "Int16", "UInt16", "Int32", "UInt32", "Int64",
    "UInt64", "Single", "Double", "IntPtr", "UIntPtr",
];

const EXCEPTIONS: [&str; 7] = [
    "NullReferenceException",
    "DivideByZeroException",
    "InvalidCastException",
    "InvalidOperationException",
    "ArgumentException",
    "NotSupportedException",
    "IndexOutOfRangeException",
];

/// Build the base class library module.
///
/// # Errors
/// Returns an error if a member body fails to assemble.
///
/// # Examples
///
/// ```rust
/// let corlib = dotweave::corlib::build()?;
/// assert!(corlib.find_type("System", "Func`3").is_some());
/// assert!(corlib.find_type("System", "Action`9").is_none());
/// # Ok::<(), dotweave::Error>(())
/// ```
pub fn build() -> Result<ModuleDef> {
    let mut module = ModuleDef::new(CORLIB_NAME);
    module.version = Version::new(4, 0, 0, 0);

    let object = TypeBuilder::new("System", "Object")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::SERIALIZABLE)
        .build(&mut module);
    let object_ctor = MethodBuilder::constructor()
        .implementation(|asm| {
            asm.ret()?;
            Ok(())
        })
        .build(&mut module, object)?;
    intrinsic(MethodBuilder::new("ToString").virtual_method().returns(TypeSig::String))
        .build(&mut module, object)?;
    intrinsic(
        MethodBuilder::new("Equals")
            .virtual_method()
            .param("obj", TypeSig::Object)
            .returns(TypeSig::Boolean),
    )
    .build(&mut module, object)?;
    intrinsic(MethodBuilder::new("GetHashCode").virtual_method().returns(TypeSig::I4))
        .build(&mut module, object)?;
    let object = module.corlib_type("System", "Object");

    let value_type = TypeBuilder::new("System", "ValueType")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT)
        .extends(object)
        .build(&mut module);
    let value_type = TypeHandle::Def(value_type);
    TypeBuilder::new("System", "Enum")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT)
        .extends(value_type)
        .build(&mut module);
    TypeBuilder::new("System", "Array")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT)
        .extends(object)
        .build(&mut module);

    for name in PRIMITIVES {
        let index = TypeBuilder::new("System", name)
            .flags(TypeAttributes::PUBLIC | TypeAttributes::SEALED)
            .extends(value_type)
            .build(&mut module);
        if name == "Int32" {
            intrinsic(MethodBuilder::new("ToString").virtual_method().returns(TypeSig::String))
                .build(&mut module, index)?;
        }
    }

    build_string(&mut module, object)?;

    let attribute = TypeBuilder::new("System", "Attribute")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::SERIALIZABLE)
        .extends(object)
        .build(&mut module);
    let attribute_ctor = chained_constructor(&mut module, attribute, object_ctor)?;
    let step_through = TypeBuilder::new("System.Diagnostics", "DebuggerStepThroughAttribute")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::SEALED)
        .extends(TypeHandle::Def(attribute))
        .build(&mut module);
    chained_constructor(&mut module, step_through, attribute_ctor)?;

    build_exceptions(&mut module, object, object_ctor)?;
    build_delegates(&mut module, object)?;

    module.assign_tokens();
    Ok(module)
}

fn intrinsic(builder: MethodBuilder) -> MethodBuilder {
    builder.impl_flags(MethodImplAttributes::INTERNAL_CALL)
}

fn chained_constructor(module: &mut ModuleDef, ty: usize, base: MethodId) -> Result<MethodId> {
    MethodBuilder::constructor()
        .flags(
            MethodAttributes::FAMILY
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::SPECIAL_NAME
                | MethodAttributes::RT_SPECIAL_NAME,
        )
        .implementation(move |asm| {
            asm.ldarg_0()?.call(MethodHandle::Def(base))?.ret()?;
            Ok(())
        })
        .build(module, ty)
}

fn build_string(module: &mut ModuleDef, object: TypeHandle) -> Result<()> {
    let string = TypeBuilder::new("System", "String")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::SERIALIZABLE)
        .extends(object)
        .build(module);

    let concat = |params: &[TypeSig]| {
        params
            .iter()
            .enumerate()
            .fold(intrinsic(MethodBuilder::new("Concat").static_method()), |b, (i, p)| {
                b.param(&format!("str{i}"), p.clone())
            })
            .returns(TypeSig::String)
    };
    concat(&[TypeSig::String, TypeSig::String]).build(module, string)?;
    concat(&[TypeSig::String, TypeSig::String, TypeSig::String]).build(module, string)?;
    concat(&[TypeSig::Object, TypeSig::Object]).build(module, string)?;

    for name in ["op_Equality", "op_Inequality"] {
        intrinsic(
            MethodBuilder::new(name)
                .static_method()
                .flags(MethodAttributes::PUBLIC | MethodAttributes::STATIC | MethodAttributes::SPECIAL_NAME)
                .param("a", TypeSig::String)
                .param("b", TypeSig::String)
                .returns(TypeSig::Boolean),
        )
        .build(module, string)?;
    }
    intrinsic(MethodBuilder::new("get_Length").returns(TypeSig::I4)).build(module, string)?;
    intrinsic(
        MethodBuilder::new("IsNullOrEmpty")
            .static_method()
            .param("value", TypeSig::String)
            .returns(TypeSig::Boolean),
    )
    .build(module, string)?;
    intrinsic(MethodBuilder::new("ToString").virtual_method().returns(TypeSig::String)).build(module, string)?;
    Ok(())
}

fn build_exceptions(module: &mut ModuleDef, object: TypeHandle, object_ctor: MethodId) -> Result<()> {
    let exception = TypeBuilder::new("System", "Exception")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::SERIALIZABLE)
        .extends(object)
        .build(module);
    let message = module.add_field(
        exception,
        FieldDef::new(EXCEPTION_MESSAGE_FIELD, FieldAttributes::PRIVATE, TypeSig::String),
    )?;
    let (default_ctor, message_ctor) = exception_constructors(module, exception, object_ctor, message)?;
    MethodBuilder::new("get_Message")
        .flags(
            MethodAttributes::PUBLIC
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::SPECIAL_NAME
                | MethodAttributes::VIRTUAL,
        )
        .returns(TypeSig::String)
        .implementation(move |asm| {
            asm.ldarg_0()?.ldfld(FieldHandle::Def(message))?.ret()?;
            Ok(())
        })
        .build(module, exception)?;

    let base = TypeHandle::Def(exception);
    for name in EXCEPTIONS {
        let index = TypeBuilder::new("System", name)
            .flags(TypeAttributes::PUBLIC | TypeAttributes::SERIALIZABLE)
            .extends(base)
            .build(module);
        exception_subclass(module, index, default_ctor, message_ctor)?;
    }
    Ok(())
}

fn exception_constructors(
    module: &mut ModuleDef,
    exception: usize,
    object_ctor: MethodId,
    message: FieldId,
) -> Result<(MethodId, MethodId)> {
    let default_ctor = MethodBuilder::constructor()
        .implementation(move |asm| {
            asm.ldarg_0()?.call(MethodHandle::Def(object_ctor))?.ret()?;
            Ok(())
        })
        .build(module, exception)?;
    let message_ctor = MethodBuilder::constructor()
        .param("message", TypeSig::String)
        .implementation(move |asm| {
            asm.ldarg_0()?
                .call(MethodHandle::Def(object_ctor))?
                .ldarg_0()?
                .ldarg_1()?
                .stfld(FieldHandle::Def(message))?
                .ret()?;
            Ok(())
        })
        .build(module, exception)?;
    Ok((default_ctor, message_ctor))
}

fn exception_subclass(module: &mut ModuleDef, ty: usize, default_ctor: MethodId, message_ctor: MethodId) -> Result<()> {
    MethodBuilder::constructor()
        .implementation(move |asm| {
            asm.ldarg_0()?.call(MethodHandle::Def(default_ctor))?.ret()?;
            Ok(())
        })
        .build(module, ty)?;
    MethodBuilder::constructor()
        .param("message", TypeSig::String)
        .implementation(move |asm| {
            asm.ldarg_0()?.ldarg_1()?.call(MethodHandle::Def(message_ctor))?.ret()?;
            Ok(())
        })
        .build(module, ty)?;
    Ok(())
}

fn build_delegates(module: &mut ModuleDef, object: TypeHandle) -> Result<()> {
    let delegate = TypeBuilder::new("System", "Delegate")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::SERIALIZABLE)
        .extends(object)
        .build(module);
    let delegate_sig = TypeSig::Class(TypeHandle::Def(delegate));
    for name in ["Combine", "Remove"] {
        intrinsic(
            MethodBuilder::new(name)
                .static_method()
                .param("a", delegate_sig.clone())
                .param("b", delegate_sig.clone())
                .returns(delegate_sig.clone()),
        )
        .build(module, delegate)?;
    }
    TypeBuilder::new("System", "MulticastDelegate")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::SERIALIZABLE)
        .extends(TypeHandle::Def(delegate))
        .build(module);

    let async_result = TypeBuilder::new("System", "IAsyncResult")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT)
        .build(module);
    DelegateBuilder::new("System", "AsyncCallback")
        .param(
            "ar",
            TypeSig::Class(TypeHandle::Def(async_result)),
        )
        .build(module)?;

    DelegateBuilder::new("System", "Action").build(module)?;
    for arity in 1..=MAX_ACTION_ARITY {
        let mut builder = DelegateBuilder::new("System", &format!("Action`{arity}"));
        for position in 0..arity {
            let name = generic_name(arity, position);
            builder = builder
                .generic_param(&name)
                .param(&format!("arg{}", position + 1), TypeSig::Var(position as u32));
        }
        builder.build(module)?;
    }
    for arity in 1..=MAX_FUNC_ARITY {
        let mut builder = DelegateBuilder::new("System", &format!("Func`{arity}"));
        for position in 0..arity - 1 {
            builder = builder
                .generic_param(&generic_name(arity - 1, position))
                .param(&format!("arg{}", position + 1), TypeSig::Var(position as u32));
        }
        builder = builder
            .generic_param("TResult")
            .returns(TypeSig::Var((arity - 1) as u32));
        builder.build(module)?;
    }
    Ok(())
}

fn generic_name(count: usize, position: usize) -> String {
    if count == 1 {
        "T".to_string()
    } else {
        format!("T{}", position + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_types_are_present() {
        let corlib = build().unwrap();
        assert_eq!(corlib.name, CORLIB_NAME);
        for name in ["Object", "String", "Int32", "Exception", "Delegate", "MulticastDelegate"] {
            assert!(corlib.find_type("System", name).is_some(), "{name}");
        }
        assert!(corlib
            .find_type("System.Diagnostics", "DebuggerStepThroughAttribute")
            .is_some());
        let object = corlib.find_type("System", "Object").unwrap();
        assert!(corlib.types[object].extends.is_none());
    }

    #[test]
    fn standard_delegate_shapes() {
        let corlib = build().unwrap();
        let func = corlib.find_type("System", "Func`3").unwrap();
        let ty = &corlib.types[func];
        let names: Vec<&str> = ty.generic_params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["T1", "T2", "TResult"]);
        let invoke = &ty.methods[ty.method_index("Invoke").unwrap()];
        assert_eq!(invoke.signature.params, vec![TypeSig::Var(0), TypeSig::Var(1)]);
        assert_eq!(invoke.signature.ret, TypeSig::Var(2));

        let action = corlib.find_type("System", "Action").unwrap();
        assert!(corlib.types[action].generic_params.is_empty());
        assert!(corlib.find_type("System", "Action`8").is_some());
        assert!(corlib.find_type("System", "Func`10").is_none());
    }

    #[test]
    fn exception_constructor_stores_message() {
        let corlib = build().unwrap();
        let exception = corlib.find_type("System", "Exception").unwrap();
        let ty = &corlib.types[exception];
        assert_eq!(ty.fields[0].name, EXCEPTION_MESSAGE_FIELD);
        let ctor = ty
            .methods
            .iter()
            .find(|m| m.name == ".ctor" && m.signature.params.len() == 1)
            .unwrap();
        assert_eq!(ctor.body.as_ref().unwrap().instructions.len(), 6);
    }

    #[test]
    fn corlib_survives_image_round_trip() {
        let mut corlib = build().unwrap();
        let bytes = corlib.to_bytes().unwrap();
        let read = ModuleDef::from_bytes(&bytes).unwrap();
        assert!(read.assembly_refs.is_empty());
        assert_eq!(read.types.len(), corlib.types.len());
        for (read, built) in read.types.iter().zip(&corlib.types) {
            assert_eq!(read.name, built.name);
            assert_eq!(read.generic_params, built.generic_params);
            assert_eq!(read.methods.len(), built.methods.len());
            for (r, b) in read.methods.iter().zip(&built.methods) {
                assert_eq!(r.signature, b.signature);
                assert_eq!(r.impl_flags, b.impl_flags);
            }
        }
    }
}
