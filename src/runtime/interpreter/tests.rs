use super::*;
use crate::metadata::{
    builder::{MethodBuilder, TypeBuilder},
    flags::FieldAttributes,
    model::{FieldDef, FieldHandle, MemberSig, MethodHandle, ModuleDef, TypeHandle},
    signatures::{MethodSig, TypeSig},
};

struct Fixture {
    module: ModuleDef,
    host: usize,
    concat: MethodHandle,
}

impl Fixture {
    fn new() -> Self {
        let mut module = ModuleDef::new("Scripts");
        let object = module.corlib_type("System", "Object");
        let host = TypeBuilder::new("Scripts", "Host").extends(object).build(&mut module);
        let string = module.corlib_type("System", "String");
        let concat = module.member_ref(
            string,
            "Concat",
            MemberSig::Method(MethodSig::static_method(
                TypeSig::String,
                vec![TypeSig::String, TypeSig::String],
            )),
        );
        Fixture {
            module,
            host,
            concat: MethodHandle::Ref(concat),
        }
    }

    fn exception_ctor(&mut self, name: &str) -> MethodHandle {
        let ty = self.module.corlib_type("System", name);
        MethodHandle::Ref(self.module.member_ref(
            ty,
            ".ctor",
            MemberSig::Method(MethodSig::instance(TypeSig::Void, vec![TypeSig::String])),
        ))
    }

    fn run(self, method: MethodId, args: Vec<Value>) -> Result<Value> {
        let runtime = Runtime::new()?;
        let assembly = runtime.load_module(self.module, None)?;
        runtime.invoke(RuntimeMethodId { assembly, method }, args)
    }
}

#[test]
fn loops_and_arithmetic() -> Result<()> {
    let mut fixture = Fixture::new();
    let sum = MethodBuilder::new("Sum")
        .static_method()
        .param("n", TypeSig::I4)
        .returns(TypeSig::I4)
        .local(TypeSig::I4)
        .implementation(|asm| {
            asm.ldc_i4(0)?
                .stloc_0()?
                .label("loop")?
                .ldarg_0()?
                .brfalse_s("done")?
                .ldloc_0()?
                .ldarg_0()?
                .add()?
                .stloc_0()?
                .ldarg_0()?
                .ldc_i4(1)?
                .sub()?
                .starg(0)?
                .br_s("loop")?
                .label("done")?
                .ldloc_0()?
                .ret()?;
            Ok(())
        })
        .build(&mut fixture.module, fixture.host)?;
    let result = fixture.run(sum, vec![Value::I4(10)])?;
    assert!(matches!(result, Value::I4(55)));
    Ok(())
}

#[test]
fn catch_runs_before_outer_finally() -> Result<()> {
    let mut fixture = Fixture::new();
    let concat = fixture.concat;
    let ctor = fixture.exception_ctor("InvalidOperationException");
    let caught = fixture.module.corlib_type("System", "InvalidOperationException");
    let run = MethodBuilder::new("Run")
        .static_method()
        .returns(TypeSig::String)
        .local(TypeSig::String)
        .implementation(move |asm| {
            asm.ldstr("")?
                .stloc_0()?
                .label("try")?
                .ldloc_0()?
                .ldstr("t")?
                .call(concat)?
                .stloc_0()?
                .ldstr("boom")?
                .newobj(ctor)?
                .throw()?
                .label("catch")?
                .pop()?
                .ldloc_0()?
                .ldstr("c")?
                .call(concat)?
                .stloc_0()?
                .leave("after")?
                .label("finally")?
                .ldloc_0()?
                .ldstr("f")?
                .call(concat)?
                .stloc_0()?
                .endfinally()?
                .label("after")?
                .ldloc_0()?
                .ret()?
                .catch_handler("try", "catch", "catch", "finally", caught)?
                .finally_handler("try", "finally", "finally", "after")?;
            Ok(())
        })
        .build(&mut fixture.module, fixture.host)?;
    let result = fixture.run(run, Vec::new())?;
    assert_eq!(result.as_str(), Some("tcf"));
    Ok(())
}

#[test]
fn unmatched_catch_runs_finally_and_propagates() -> Result<()> {
    let mut fixture = Fixture::new();
    let log = fixture.module.add_field(
        fixture.host,
        FieldDef::new("log", FieldAttributes::PUBLIC | FieldAttributes::STATIC, TypeSig::String),
    )?;
    let ctor = fixture.exception_ctor("ArgumentException");
    let other = fixture.module.corlib_type("System", "NullReferenceException");
    let run = MethodBuilder::new("Run")
        .static_method()
        .implementation(move |asm| {
            asm.label("try")?
                .ldstr("bad argument")?
                .newobj(ctor)?
                .throw()?
                .label("catch")?
                .pop()?
                .leave("after")?
                .label("finally")?
                .ldstr("cleaned")?
                .stsfld(FieldHandle::Def(log))?
                .endfinally()?
                .label("after")?
                .ret()?
                .catch_handler("try", "catch", "catch", "finally", other)?
                .finally_handler("try", "finally", "finally", "after")?;
            Ok(())
        })
        .build(&mut fixture.module, fixture.host)?;

    let runtime = Runtime::new()?;
    let assembly = runtime.load_module(fixture.module, None)?;
    let error = runtime
        .invoke(RuntimeMethodId { assembly, method: run }, Vec::new())
        .unwrap_err();
    assert!(matches!(&error, Error::ManagedException(m) if m == "System.ArgumentException: bad argument"));
    let log = runtime.get_static(crate::runtime::RuntimeFieldId { assembly, field: log })?;
    assert_eq!(log.as_str(), Some("cleaned"));
    Ok(())
}

#[test]
fn delegates_invoke_static_targets() -> Result<()> {
    let mut fixture = Fixture::new();
    let double = MethodBuilder::new("Double")
        .static_method()
        .param("x", TypeSig::I4)
        .returns(TypeSig::I4)
        .implementation(|asm| {
            asm.ldarg_0()?.ldarg_0()?.add()?.ret()?;
            Ok(())
        })
        .build(&mut fixture.module, fixture.host)?;

    let func = fixture.module.corlib_type("System", "Func`2");
    let instance = fixture.module.type_spec(TypeSig::GenericInst {
        base: func,
        value_type: false,
        args: vec![TypeSig::I4, TypeSig::I4],
    });
    let ctor = fixture.module.member_ref(
        instance,
        ".ctor",
        MemberSig::Method(MethodSig::instance(TypeSig::Void, vec![TypeSig::Object, TypeSig::I])),
    );
    let invoke = fixture.module.member_ref(
        instance,
        "Invoke",
        MemberSig::Method(MethodSig::instance(TypeSig::Var(1), vec![TypeSig::Var(0)])),
    );
    let run = MethodBuilder::new("Run")
        .static_method()
        .returns(TypeSig::I4)
        .implementation(move |asm| {
            asm.ldnull()?
                .ldftn(MethodHandle::Def(double))?
                .newobj(MethodHandle::Ref(ctor))?
                .ldc_i4(21)?
                .callvirt(MethodHandle::Ref(invoke))?
                .ret()?;
            Ok(())
        })
        .build(&mut fixture.module, fixture.host)?;
    assert!(matches!(fixture.run(run, Vec::new())?, Value::I4(42)));
    Ok(())
}

#[test]
fn callvirt_dispatches_to_override() -> Result<()> {
    let mut fixture = Fixture::new();
    let object = fixture.module.corlib_type("System", "Object");
    let animal = TypeBuilder::new("Scripts", "Animal").extends(object).build(&mut fixture.module);
    let speak = MethodBuilder::new("Speak")
        .virtual_method()
        .returns(TypeSig::String)
        .implementation(|asm| {
            asm.ldstr("...")?.ret()?;
            Ok(())
        })
        .build(&mut fixture.module, animal)?;
    let dog = TypeBuilder::new("Scripts", "Dog")
        .extends(TypeHandle::Def(animal))
        .build(&mut fixture.module);
    let ctor = MethodBuilder::constructor()
        .implementation(|asm| {
            asm.ret()?;
            Ok(())
        })
        .build(&mut fixture.module, dog)?;
    MethodBuilder::new("Speak")
        .virtual_method()
        .returns(TypeSig::String)
        .implementation(|asm| {
            asm.ldstr("woof")?.ret()?;
            Ok(())
        })
        .build(&mut fixture.module, dog)?;

    let run = MethodBuilder::new("Run")
        .static_method()
        .returns(TypeSig::String)
        .implementation(move |asm| {
            asm.newobj(MethodHandle::Def(ctor))?
                .callvirt(MethodHandle::Def(speak))?
                .ret()?;
            Ok(())
        })
        .build(&mut fixture.module, fixture.host)?;
    assert_eq!(fixture.run(run, Vec::new())?.as_str(), Some("woof"));
    Ok(())
}

#[test]
fn type_initializer_runs_once() -> Result<()> {
    let mut fixture = Fixture::new();
    let object = fixture.module.corlib_type("System", "Object");
    let counter = TypeBuilder::new("Scripts", "Counter").extends(object).build(&mut fixture.module);
    let count = fixture.module.add_field(
        counter,
        FieldDef::new("count", FieldAttributes::PRIVATE | FieldAttributes::STATIC, TypeSig::I4),
    )?;
    MethodBuilder::new(".cctor")
        .static_method()
        .implementation(move |asm| {
            asm.ldc_i4(10)?.stsfld(FieldHandle::Def(count))?.ret()?;
            Ok(())
        })
        .build(&mut fixture.module, counter)?;
    let next = MethodBuilder::new("Next")
        .static_method()
        .returns(TypeSig::I4)
        .implementation(move |asm| {
            asm.ldsfld(FieldHandle::Def(count))?
                .ldc_i4(1)?
                .add()?
                .dup()?
                .stsfld(FieldHandle::Def(count))?
                .ret()?;
            Ok(())
        })
        .build(&mut fixture.module, counter)?;

    let runtime = Runtime::new()?;
    let assembly = runtime.load_module(fixture.module, None)?;
    let next = RuntimeMethodId { assembly, method: next };
    assert!(matches!(runtime.invoke(next, Vec::new())?, Value::I4(11)));
    assert!(matches!(runtime.invoke(next, Vec::new())?, Value::I4(12)));
    Ok(())
}

#[test]
fn unbounded_recursion_is_stopped() -> Result<()> {
    let mut fixture = Fixture::new();
    let id = MethodId {
        ty: fixture.host,
        index: 0,
    };
    MethodBuilder::new("Forever")
        .static_method()
        .implementation(move |asm| {
            asm.call(MethodHandle::Def(id))?.ret()?;
            Ok(())
        })
        .build(&mut fixture.module, fixture.host)?;
    assert!(matches!(
        fixture.run(id, Vec::new()),
        Err(Error::RecursionLimit(MAX_CALL_DEPTH))
    ));
    Ok(())
}

#[test]
fn null_receiver_raises_null_reference() -> Result<()> {
    let mut fixture = Fixture::new();
    let string = fixture.module.corlib_type("System", "String");
    let length = fixture.module.member_ref(
        string,
        "get_Length",
        MemberSig::Method(MethodSig::instance(TypeSig::I4, Vec::new())),
    );
    let run = MethodBuilder::new("Run")
        .static_method()
        .returns(TypeSig::I4)
        .implementation(move |asm| {
            asm.ldnull()?.callvirt(MethodHandle::Ref(length))?.ret()?;
            Ok(())
        })
        .build(&mut fixture.module, fixture.host)?;
    let error = fixture.run(run, Vec::new()).unwrap_err();
    assert!(matches!(error, Error::ManagedException(m) if m.starts_with("System.NullReferenceException")));
    Ok(())
}
