//! A build notifies the waiting server, which weaves the notified directory.
#![cfg(unix)]

mod common;

use std::time::Duration;

use common::*;
use dotweave::{
    config::WeaveConfig,
    injection::write_records,
    metadata::model::ModuleDef,
    rendezvous::{notify, ExitCode, RendezvousServer},
    weaver::is_woven,
};

fn config(runtime_dir: &std::path::Path, records: &[dotweave::injection::WeavingRecord]) -> WeaveConfig {
    let records_path = runtime_dir.join("records.json");
    write_records(&records_path, records).unwrap();
    WeaveConfig {
        ephemeral_dirs: Vec::new(),
        records_path: Some(records_path),
        ..WeaveConfig::with_runtime_dir(runtime_dir)
    }
}

#[test]
fn notified_directory_is_woven() {
    let runtime_dir = tempfile::tempdir().unwrap();
    let build = tempfile::tempdir().unwrap();
    let path = write_game(build.path());

    let server = RendezvousServer::weaving(config(runtime_dir.path(), &[record(ADD)])).unwrap();
    let code = notify(runtime_dir.path(), build.path(), Duration::from_secs(10)).unwrap();
    assert_eq!(code, ExitCode::Success);
    assert_eq!(server.join().unwrap(), Some(ExitCode::Success));

    let module = ModuleDef::from_path(&path).unwrap();
    let player = module.find_type("Game", "Player").unwrap();
    let add = module.types[player].method_index("Add").unwrap();
    assert!(is_woven(&module, &module.types[player].methods[add]));
}

#[test]
fn weaving_failures_answer_injection_error() {
    let runtime_dir = tempfile::tempdir().unwrap();
    let build = tempfile::tempdir().unwrap();
    write_game(build.path());

    let server = RendezvousServer::weaving(config(runtime_dir.path(), &[record("Missing<>")])).unwrap();
    let code = notify(runtime_dir.path(), build.path(), Duration::from_secs(10)).unwrap();
    assert_eq!(code, ExitCode::InjectionError);
    assert_eq!(server.join().unwrap(), Some(ExitCode::InjectionError));
}
