use std::path::Path;

use serde::Serialize;

use crate::{app::GlobalOptions, commands::common::load_config, output::print_output};

#[derive(Debug, Serialize)]
struct NotifyOutput {
    dir: String,
    exit_code: u8,
    result: String,
}

#[cfg(unix)]
pub fn run(
    dir: &Path,
    runtime_dir: Option<&Path>,
    timeout_ms: Option<u64>,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    use dotweave::rendezvous::{notify, ExitCode};
    use std::time::Duration;

    let config = load_config(opts)?;
    let runtime_dir = runtime_dir.unwrap_or(&config.runtime_dir);
    let timeout = timeout_ms.map_or_else(|| config.connect_timeout(), Duration::from_millis);

    let code = notify(runtime_dir, dir, timeout)?;
    let output = NotifyOutput {
        dir: dir.display().to_string(),
        exit_code: code as u8,
        result: code.to_string(),
    };
    print_output(&output, opts, |out| {
        println!("{}: {} ({})", out.dir, out.result, out.exit_code);
    })?;

    if code != ExitCode::Success {
        std::process::exit(i32::from(code as u8));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn run(_: &Path, _: Option<&Path>, _: Option<u64>, _: &GlobalOptions) -> anyhow::Result<()> {
    anyhow::bail!("the rendezvous client needs Unix domain sockets")
}
