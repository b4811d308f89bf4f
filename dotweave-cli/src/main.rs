mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })?;

    let cli = Cli::parse();

    // dotweave info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("dotweave", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Weave {
            records,
            allow,
            targets,
        } => commands::weave::run(records.as_deref(), allow, targets, &cli.global),
        Command::Restore { dir } => commands::restore::run(dir, &cli.global),
        Command::Inspect { path } => commands::inspect::run(path, &cli.global),
        Command::Signatures { path, r#type } => {
            commands::signatures::run(path, r#type.as_deref(), &cli.global)
        }
        Command::Serve {
            runtime_dir,
            records,
        } => commands::serve::run(runtime_dir.as_deref(), records.as_deref(), &cli.global),
        Command::Notify {
            dir,
            runtime_dir,
            timeout_ms,
        } => commands::notify::run(dir, runtime_dir.as_deref(), *timeout_ms, &cli.global),
    }
}
