use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use dotweave::{
    injection::{read_records, WeavingRecord},
    weaver::{BatchReport, BatchWeaver},
};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{file_display_name, load_config},
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
struct AssemblyEntry {
    assembly: String,
    file: String,
    status: String,
    woven: usize,
    unchanged: usize,
    failures: Vec<String>,
}

#[derive(Debug, Serialize)]
struct WeaveOutput {
    assemblies: Vec<AssemblyEntry>,
    skipped: Vec<String>,
    woven: usize,
    success: bool,
}

impl From<&BatchReport> for WeaveOutput {
    fn from(report: &BatchReport) -> Self {
        let assemblies = report
            .assemblies
            .iter()
            .map(|a| match &a.result {
                Ok(outcome) => AssemblyEntry {
                    assembly: a.assembly.clone(),
                    file: file_display_name(&a.path),
                    status: if outcome.is_success() { "ok" } else { "partial" }.to_string(),
                    woven: outcome.woven.len(),
                    unchanged: outcome.unchanged.len(),
                    failures: outcome
                        .failures
                        .iter()
                        .map(|f| format!("{}: {}", f.target, f.error))
                        .collect(),
                },
                Err(e) => AssemblyEntry {
                    assembly: a.assembly.clone(),
                    file: file_display_name(&a.path),
                    status: "failed".to_string(),
                    woven: 0,
                    unchanged: 0,
                    failures: vec![e.to_string()],
                },
            })
            .collect();

        WeaveOutput {
            assemblies,
            skipped: report.skipped.clone(),
            woven: report.woven(),
            success: report.is_success(),
        }
    }
}

pub fn run(
    records: Option<&Path>,
    allow: &[PathBuf],
    targets: &[PathBuf],
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    let config = load_config(opts)?;
    let records = match records {
        Some(path) => read_records(path)
            .with_context(|| format!("failed to read records: {}", path.display()))?,
        None => config.records()?,
    };

    let names: Vec<String> = targets
        .iter()
        .filter_map(|t| t.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    let records: Vec<WeavingRecord> = records
        .into_iter()
        .filter(|r| names.contains(&r.assembly_name))
        .collect();
    log::info!("{} record(s) towards {} target(s)", records.len(), targets.len());

    let mut allowed = targets.to_vec();
    allowed.extend(allow.iter().cloned());
    allowed.extend(config.allowed_assemblies.iter().cloned());

    let report = BatchWeaver::new(allowed, config.backup_manager()).weave_records(&records);
    let output = WeaveOutput::from(&report);

    print_output(&output, opts, |out| {
        let mut tw = TabWriter::new(&[
            ("Assembly", Align::Left),
            ("File", Align::Left),
            ("Status", Align::Left),
            ("Woven", Align::Right),
            ("Unchanged", Align::Right),
        ]);
        for a in &out.assemblies {
            tw.row(vec![
                a.assembly.clone(),
                a.file.clone(),
                a.status.clone(),
                a.woven.to_string(),
                a.unchanged.to_string(),
            ]);
        }
        tw.print();

        for a in &out.assemblies {
            for failure in &a.failures {
                println!("  {}: {failure}", a.assembly);
            }
        }
        for name in &out.skipped {
            println!("  skipped {name}: not in the allow-list");
        }
        println!("\n{} method(s) woven", out.woven);
    })?;

    if !output.success {
        bail!("weaving failed");
    }
    Ok(())
}
