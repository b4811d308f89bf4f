//! Shared fixtures: a small `Game` assembly with the method shapes weaving has to handle.
#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use dotweave::{
    injection::{InjectionDescriptor, FnProvider, WeavingRecord},
    metadata::{
        builder::{MethodBuilder, TypeBuilder},
        flags::{FieldAttributes, ParamAttributes, TypeAttributes},
        model::{FieldDef, FieldHandle, MemberSig, MethodHandle, ModuleDef},
        signatures::{MethodSig, TypeSig},
    },
    runtime::{Runtime, RuntimeMethodId},
    weaver::{inject_assembly, WeaveOutcome, WeaveRequest},
    driver::InjectionDriver,
};

pub const GAME: &str = "Game";
pub const PLAYER: &str = "Game.Player";

pub const GET_STRING_STATIC: &str = "GetStringStatic<System.String,System.String>";
pub const GET_STRING: &str = "GetString<System.String&>";
pub const TRY_PARSE: &str = "TryParse<System.String,System.Int32&>";
pub const ADD: &str = "Add<System.Int32,System.Int32>";
pub const TICK: &str = "Tick<>";

/// Builds the `Game` assembly:
///
/// ```text
/// class Game.Player {
///     string Name;
///     .ctor() {}
///     static string GetStringStatic(string prefix, string name) => prefix + " " + name;
///     string GetString(ref string name) { name = Name; return "hi, " + name; }
///     static bool TryParse(string text, out int value) { value = 7; return true; }
///     static int Add(int a, int b) => a + b;
///     static void Tick() {}
/// }
/// struct Game.Vector { int Length() => 5; }
/// ```
pub fn game_module() -> ModuleDef {
    let mut module = ModuleDef::new(GAME);
    let object = module.corlib_type("System", "Object");
    let string = module.corlib_type("System", "String");
    let concat2 = MethodHandle::Ref(module.member_ref(
        string,
        "Concat",
        MemberSig::Method(MethodSig::static_method(
            TypeSig::String,
            vec![TypeSig::String, TypeSig::String],
        )),
    ));
    let concat3 = MethodHandle::Ref(module.member_ref(
        string,
        "Concat",
        MemberSig::Method(MethodSig::static_method(
            TypeSig::String,
            vec![TypeSig::String, TypeSig::String, TypeSig::String],
        )),
    ));

    let player = TypeBuilder::new("Game", "Player")
        .flags(TypeAttributes::PUBLIC)
        .extends(object)
        .build(&mut module);
    let name = module
        .add_field(player, FieldDef::new("Name", FieldAttributes::PUBLIC, TypeSig::String))
        .unwrap();

    MethodBuilder::constructor()
        .implementation(|asm| {
            asm.ret()?;
            Ok(())
        })
        .build(&mut module, player)
        .unwrap();

    MethodBuilder::new("GetStringStatic")
        .static_method()
        .param("prefix", TypeSig::String)
        .param("name", TypeSig::String)
        .returns(TypeSig::String)
        .implementation(move |asm| {
            asm.ldarg_0()?.ldstr(" ")?.ldarg_1()?.call(concat3)?.ret()?;
            Ok(())
        })
        .build(&mut module, player)
        .unwrap();

    MethodBuilder::new("GetString")
        .param("name", TypeSig::String.by_ref())
        .returns(TypeSig::String)
        .implementation(move |asm| {
            asm.ldarg_1()?
                .ldarg_0()?
                .ldfld(FieldHandle::Def(name))?
                .stind_ref()?
                .ldstr("hi, ")?
                .ldarg_1()?
                .ldind_ref()?
                .call(concat2)?
                .ret()?;
            Ok(())
        })
        .build(&mut module, player)
        .unwrap();

    MethodBuilder::new("TryParse")
        .static_method()
        .param("text", TypeSig::String)
        .param_with("value", TypeSig::I4.by_ref(), ParamAttributes::OUT)
        .returns(TypeSig::Boolean)
        .implementation(|asm| {
            asm.ldarg_1()?.ldc_i4(7)?.stind_i4()?.ldc_i4(1)?.ret()?;
            Ok(())
        })
        .build(&mut module, player)
        .unwrap();

    MethodBuilder::new("Add")
        .static_method()
        .param("a", TypeSig::I4)
        .param("b", TypeSig::I4)
        .returns(TypeSig::I4)
        .implementation(|asm| {
            asm.ldarg_0()?.ldarg_1()?.add()?.ret()?;
            Ok(())
        })
        .build(&mut module, player)
        .unwrap();

    MethodBuilder::new("Tick")
        .static_method()
        .implementation(|asm| {
            asm.ret()?;
            Ok(())
        })
        .build(&mut module, player)
        .unwrap();

    let value_type = module.corlib_type("System", "ValueType");
    let vector = TypeBuilder::new("Game", "Vector")
        .flags(TypeAttributes::PUBLIC | TypeAttributes::SEALED)
        .extends(value_type)
        .build(&mut module);
    MethodBuilder::new("Length")
        .returns(TypeSig::I4)
        .implementation(|asm| {
            asm.ldc_i4(5)?.ret()?;
            Ok(())
        })
        .build(&mut module, vector)
        .unwrap();

    module.assign_tokens();
    module
}

/// Write the `Game` assembly to `dir/Game.dll`.
pub fn write_game(dir: &Path) -> PathBuf {
    let path = dir.join(format!("{GAME}.dll"));
    game_module().write_to(&path).unwrap();
    path
}

pub fn record(method: &str) -> WeavingRecord {
    WeavingRecord::new(GAME, PLAYER, method)
}

/// Weave `methods` of `Game.Player` into the image at `path`, in place.
pub fn weave(path: &Path, methods: &[&str]) -> WeaveOutcome {
    let requests: Vec<WeaveRequest> = methods.iter().map(|m| WeaveRequest::new(record(m))).collect();
    inject_assembly(path, &requests, &[path.to_path_buf()], path).unwrap()
}

/// A runtime probing `dir` and a driver over it whose catalog holds `descriptors`.
pub fn driver(dir: &Path, descriptors: Vec<InjectionDescriptor>) -> InjectionDriver {
    let runtime = Arc::new(Runtime::with_search_paths(vec![dir.to_path_buf()]).unwrap());
    let driver = InjectionDriver::new(runtime);
    let descriptors = Arc::new(descriptors);
    driver
        .catalog()
        .register(Arc::new(FnProvider::new("Mods", move |_| Ok(descriptors.to_vec()))))
        .unwrap();
    driver
}

pub fn method(runtime: &Runtime, signature: &str) -> RuntimeMethodId {
    runtime.method_by_signature(GAME, PLAYER, signature).unwrap()
}
