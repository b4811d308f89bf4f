//! Weaving images on disk: idempotence, backups, batches and image round trips.

mod common;

use std::{fs, sync::Arc};

use common::*;
use dotweave::{
    assembly::{InstructionAssembler, OpCode},
    backup::BackupManager,
    config::WeaveConfig,
    injection::{write_records, WeaveAction, WeavingRecord},
    metadata::{
        body::{MethodBody, SequencePoint},
        builder::TypeBuilder,
        model::{MemberSig, MethodHandle, MethodId, ModuleDef, ResolutionScope},
        signatures::{MethodSig, TypeSig},
    },
    weaver::{is_woven, stable_id, BatchWeaver, GeneratedNames, WeaveRequest},
    Error,
};

fn player(module: &ModuleDef) -> usize {
    module.find_type("Game", "Player").unwrap()
}

#[test]
fn weaving_twice_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());

    let first = weave(&path, &[ADD]);
    assert!(first.dirty);
    let woven = fs::read(&path).unwrap();

    let second = weave(&path, &[ADD]);
    assert!(!second.dirty);
    assert_eq!(second.unchanged.len(), 1);
    assert_eq!(fs::read(&path).unwrap(), woven);

    let module = ModuleDef::from_path(&path).unwrap();
    let ty = player(&module);
    let add = &module.types[ty].methods[module.types[ty].method_index("Add").unwrap()];
    let markers = add
        .custom_attributes
        .iter()
        .filter(|a| {
            module
                .method_parent(a.ctor)
                .is_ok_and(|p| module.type_full_name(p) == "DotWeave.Injection.InjectedMethodAttribute")
        })
        .count();
    assert_eq!(markers, 1);
    assert!(is_woven(&module, add));

    let names = GeneratedNames::new("Add", stable_id(&module, add).unwrap());
    let clones = module.types[ty]
        .methods
        .iter()
        .filter(|m| m.name == names.origin_method)
        .count();
    assert_eq!(clones, 1);
}

#[test]
fn every_shape_weaves_and_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());

    let requests: Vec<WeavingRecord> = [GET_STRING_STATIC, GET_STRING, TRY_PARSE, ADD, TICK]
        .iter()
        .map(|m| record(m))
        .chain(std::iter::once(WeavingRecord::new(GAME, "Game.Vector", "Length<>")))
        .collect();
    let weaver = BatchWeaver::new(vec![path.clone()], BackupManager::new(Vec::new()));
    let report = weaver.weave_records(&requests);
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.woven(), 6);
    weaver.validate(&path).unwrap();

    let module = ModuleDef::from_path(&path).unwrap();
    let synthesized = |ty: usize, method: &str| {
        let def = &module.types[ty].methods[module.types[ty].method_index(method).unwrap()];
        let names = GeneratedNames::new(method, stable_id(&module, def).unwrap());
        module.find_nested_type(ty, &names.delegate_type).is_some()
    };
    let ty = player(&module);
    assert!(!synthesized(ty, "GetStringStatic"));
    assert!(!synthesized(ty, "Add"));
    assert!(!synthesized(ty, "Tick"));
    assert!(synthesized(ty, "GetString"));
    assert!(synthesized(ty, "TryParse"));
    assert!(synthesized(module.find_type("Game", "Vector").unwrap(), "Length"));
}

#[test]
fn backups_hold_the_pre_weave_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());
    let original = fs::read(&path).unwrap();

    let backups = BackupManager::new(Vec::new());
    let weaver = BatchWeaver::new(vec![path.clone()], backups.clone());
    assert!(weaver.weave_records(&[record(ADD)]).is_success());
    assert!(backups.has_backup(&path));
    assert_eq!(fs::read(BackupManager::backup_path(&path)).unwrap(), original);
    assert_ne!(fs::read(&path).unwrap(), original);

    // A second pass keeps the first backup
    assert!(weaver.weave_records(&[record(TICK)]).is_success());
    assert_eq!(fs::read(BackupManager::backup_path(&path)).unwrap(), original);

    let restored = backups.restore_all(dir.path()).unwrap();
    assert_eq!(restored, vec![path.clone()]);
    assert_eq!(fs::read(&path).unwrap(), original);
}

#[test]
fn batch_failures_stay_in_their_assembly() {
    let dir = tempfile::tempdir().unwrap();
    let game = write_game(dir.path());
    let broken = dir.path().join("Broken.dll");
    fs::write(&broken, b"not an image").unwrap();

    let weaver = BatchWeaver::new(vec![game.clone(), broken.clone()], BackupManager::new(Vec::new()));
    let report = weaver.weave_records(&[
        record(ADD),
        WeavingRecord::new("Broken", "Broken.Type", "Run<>"),
        WeavingRecord::new("Elsewhere", "Other.Type", "Run<>"),
        WeavingRecord::new(GAME, "", "Incomplete<>"),
    ]);

    assert!(!report.is_success());
    assert_eq!(report.skipped, vec!["Elsewhere".to_string()]);
    assert_eq!(report.assemblies.len(), 2);
    let by_name = |name: &str| report.assemblies.iter().find(|a| a.assembly == name).unwrap();
    assert!(by_name("Broken").result.is_err());
    assert_eq!(by_name(GAME).result.as_ref().unwrap().woven.len(), 1);
    assert_eq!(fs::read(&broken).unwrap(), b"not an image");
}

#[test]
fn stale_records_leave_the_image_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());
    let original = fs::read(&path).unwrap();

    let outcome = weave(&path, &["Missing<System.Int32>"]);
    assert!(!outcome.dirty);
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].error.is_resolution());
    assert_eq!(fs::read(&path).unwrap(), original);

    let outcome = weave(&path, &["Missing<System.Int32>", ADD]);
    assert!(outcome.dirty);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.woven, vec![record(ADD)]);
}

#[test]
fn woven_images_survive_a_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());
    weave(&path, &[GET_STRING_STATIC, GET_STRING]);

    let mut first = ModuleDef::from_path(&path).unwrap();
    let bytes = first.to_bytes().unwrap();
    let second = ModuleDef::from_bytes(&bytes).unwrap();

    assert_eq!(first.types.len(), second.types.len());
    for (a, b) in first.types.iter().zip(&second.types) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.fields.len(), b.fields.len());
        let names = |t: &dotweave::metadata::model::TypeDef| {
            t.methods.iter().map(|m| m.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(a), names(b));
        for (ma, mb) in a.methods.iter().zip(&b.methods) {
            let ops = |m: &dotweave::metadata::model::MethodDef| {
                m.body
                    .as_ref()
                    .map(|body| body.instructions.iter().map(|i| i.opcode).collect::<Vec<OpCode>>())
            };
            assert_eq!(ops(ma), ops(mb), "{}", ma.name);
        }
    }

    let ty = player(&second);
    let stub = &second.types[ty].methods[second.types[ty].method_index("GetStringStatic").unwrap()];
    let ops: Vec<OpCode> = stub.body.as_ref().unwrap().instructions.iter().map(|i| i.opcode).collect();
    assert_eq!(ops[0], OpCode::Ldsfld);
    assert_eq!(ops[1], OpCode::BrtrueS);
    assert_eq!(ops.iter().filter(|op| **op == OpCode::Ret).count(), 2);
    assert!(ops.contains(&OpCode::Callvirt));
}

#[test]
fn symbols_move_with_the_original_body() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Game.dll");
    let mut module = game_module();
    module.has_symbols = true;
    let ty = player(&module);
    let add = module.types[ty].method_index("Add").unwrap();
    if let Some(body) = module.types[ty].methods[add].body.as_mut() {
        body.sequence_points.push(SequencePoint {
            index: 2,
            document: "Player.cs".to_string(),
            start_line: 12,
            start_column: 9,
            end_line: 12,
            end_column: 22,
        });
    }
    module.write_to(&path).unwrap();

    weave(&path, &[ADD]);
    assert!(dir.path().join("Game.pdb").is_file());

    let woven = ModuleDef::from_path(&path).unwrap();
    assert!(woven.has_symbols);
    let ty = player(&woven);
    let def = &woven.types[ty].methods[woven.types[ty].method_index("Add").unwrap()];
    let names = GeneratedNames::new("Add", stable_id(&woven, def).unwrap());
    let origin = &woven.types[ty].methods[woven.types[ty].method_index(&names.origin_method).unwrap()];
    let points = &origin.body.as_ref().unwrap().sequence_points;
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].index, 2);
    assert_eq!(points[0].document, "Player.cs");
}

#[test]
fn configuration_drives_a_weave() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());
    let records = dir.path().join("records.json");
    write_records(&records, &[record(TICK), record(TICK), record(ADD)]).unwrap();

    let config_path = dir.path().join("dotweave.json");
    fs::write(
        &config_path,
        serde_json::json!({
            "ephemeralDirs": [],
            "allowedAssemblies": [path],
            "recordsPath": records,
        })
        .to_string(),
    )
    .unwrap();

    let config = WeaveConfig::from_path(&config_path).unwrap();
    let report = BatchWeaver::from_config(&config).weave_records(&config.records().unwrap());
    assert!(report.is_success());
    assert_eq!(report.woven(), 2);
}

/// Replaces the body with `System.String::DoesNotExist(); return 0;`.
fn call_missing_member() -> WeaveAction {
    Arc::new(|module: &mut ModuleDef, method: MethodId| {
        let string = module.corlib_type("System", "String");
        let missing = module.member_ref(
            string,
            "DoesNotExist",
            MemberSig::Method(MethodSig::static_method(TypeSig::Void, Vec::new())),
        );
        let mut asm = InstructionAssembler::new();
        asm.call(MethodHandle::Ref(missing))?.ldc_i4(0)?.ret()?;
        let code = asm.finish()?;
        module.method_mut(method)?.body = Some(MethodBody {
            max_stack: 1,
            init_locals: true,
            locals: Vec::new(),
            instructions: code.instructions,
            exception_handlers: code.exception_handlers,
            sequence_points: Vec::new(),
        });
        Ok(true)
    })
}

#[test]
fn invalid_weave_is_restored_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());
    let original = fs::read(&path).unwrap();

    let backups = BackupManager::new(Vec::new());
    let weaver = BatchWeaver::new(vec![path.clone()], backups.clone());
    let requests = vec![
        WeaveRequest {
            target: record(ADD),
            action: Some(call_missing_member()),
        },
        WeaveRequest::new(record("Missing<>")),
    ];
    let report = weaver.weave(&requests);

    assert!(!report.is_success());
    assert_eq!(report.woven(), 0);
    match &report.assemblies[0].result {
        Err(Error::WovenImageInvalid {
            assembly,
            cause,
            failures,
        }) => {
            assert_eq!(assembly, GAME);
            assert!(matches!(**cause, Error::Validation(_)));
            assert!(cause.to_string().contains("DoesNotExist"));
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].target, record("Missing<>"));
            assert!(failures[0].error.is_resolution());
        }
        other => panic!("expected an invalid weave, got {other:?}"),
    }
    assert_eq!(fs::read(&path).unwrap(), original);
    assert!(backups.has_backup(&path));

    let restored = ModuleDef::from_path(&path).unwrap();
    let ty = player(&restored);
    let add = &restored.types[ty].methods[restored.types[ty].method_index("Add").unwrap()];
    assert!(!is_woven(&restored, add));
}

#[test]
fn validation_sees_only_the_allow_list() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());

    let engine_path = dir.path().join("Engine.dll");
    let mut engine = ModuleDef::new("Engine");
    let object = engine.corlib_type("System", "Object");
    TypeBuilder::new("Engine", "Loop").extends(object).build(&mut engine);
    engine.write_to(&engine_path).unwrap();

    let mut game = ModuleDef::from_path(&path).unwrap();
    let scope = ResolutionScope::AssemblyRef(game.assembly_ref("Engine"));
    let _ = game.type_ref(scope, "Engine", "Loop");
    game.write_to(&path).unwrap();

    // Engine.dll sits beside Game.dll but is not allowed
    let weaver = BatchWeaver::new(vec![path.clone()], BackupManager::new(Vec::new()));
    let error = weaver.validate(&path).unwrap_err();
    assert!(matches!(error, Error::Validation(_)));
    assert!(error.to_string().contains("Assembly not found - Engine"), "{error}");

    let weaver = BatchWeaver::new(vec![path.clone(), engine_path], BackupManager::new(Vec::new()));
    weaver.validate(&path).unwrap();
}
