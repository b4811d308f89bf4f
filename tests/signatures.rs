//! Binary and runtime views of the same assembly agree on every signature.

mod common;

use common::*;
use dotweave::{
    injection::WeavingRecord,
    runtime::{Runtime, RuntimeMethodId},
    signature::{find_method_by_signature, find_type_by_signature, BinaryMethod, StructuralMethod},
};

#[test]
fn fixture_signatures() {
    let module = game_module();
    let player = find_type_by_signature(&module, PLAYER).unwrap();
    let signatures: Vec<String> = module
        .method_ids()
        .filter(|id| id.ty == player)
        .map(|id| BinaryMethod::new(&module, id).signature().unwrap())
        .collect();
    assert_eq!(
        signatures,
        vec![".ctor<>", GET_STRING_STATIC, GET_STRING, TRY_PARSE, ADD, TICK]
    );
    assert!(find_method_by_signature(&module, player, "Add<System.Int64,System.Int32>").is_none());
}

#[test]
fn records_match_across_views() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());
    let module = dotweave::metadata::model::ModuleDef::from_path(&path).unwrap();

    let runtime = Runtime::with_search_paths(vec![dir.path().to_path_buf()]).unwrap();
    let assembly = runtime.assembly_by_name(GAME).unwrap();

    for id in module.method_ids().filter(|id| id.ty != 0) {
        let binary = WeavingRecord::from_binary(&module, id).unwrap();
        let loaded = WeavingRecord::from_runtime(&runtime, RuntimeMethodId { assembly, method: id }).unwrap();
        assert_eq!(binary, loaded);

        let found = runtime
            .method_by_signature(&binary.assembly_name, &binary.klass_signature, &binary.method_signature)
            .unwrap();
        assert_eq!(found.method, id);
    }
}

#[test]
fn signatures_survive_weaving() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_game(dir.path());
    weave(&path, &[GET_STRING, ADD]);

    let runtime = Runtime::with_search_paths(vec![dir.path().to_path_buf()]).unwrap();
    for signature in [GET_STRING_STATIC, GET_STRING, TRY_PARSE, ADD, TICK] {
        let found = method(&runtime, signature);
        assert_eq!(
            WeavingRecord::from_runtime(&runtime, found).unwrap(),
            record(signature)
        );
    }
}
