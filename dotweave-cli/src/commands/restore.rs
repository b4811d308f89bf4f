use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::load_config,
    output::print_output,
};

#[derive(Debug, Serialize)]
struct RestoreOutput {
    restored: Vec<String>,
    count: usize,
}

pub fn run(dir: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let backups = load_config(opts)?.backup_manager();
    let restored = backups
        .restore_all(dir)
        .with_context(|| format!("failed to restore assemblies under {}", dir.display()))?;

    let output = RestoreOutput {
        count: restored.len(),
        restored: restored.iter().map(|p| p.display().to_string()).collect(),
    };
    print_output(&output, opts, |out| {
        for path in &out.restored {
            println!("restored {path}");
        }
        println!("{} assembly(ies) restored", out.count);
    })
}
