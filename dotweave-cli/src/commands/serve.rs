use std::path::Path;

use serde::Serialize;

use crate::{app::GlobalOptions, commands::common::load_config, output::print_output};

#[derive(Debug, Serialize)]
struct ServeOutput {
    endpoint: String,
    exit_code: Option<u8>,
}

#[cfg(unix)]
pub fn run(runtime_dir: Option<&Path>, records: Option<&Path>, opts: &GlobalOptions) -> anyhow::Result<()> {
    use dotweave::rendezvous::RendezvousServer;

    let mut config = load_config(opts)?;
    if let Some(dir) = runtime_dir {
        config.runtime_dir = dir.to_path_buf();
    }
    if let Some(path) = records {
        config.records_path = Some(path.to_path_buf());
    }

    let server = RendezvousServer::weaving(config)?;
    let endpoint = server.endpoint().display().to_string();
    log::info!("Waiting for a notification on {endpoint}");
    let code = server.join()?;

    let output = ServeOutput {
        endpoint,
        exit_code: code.map(|c| c as u8),
    };
    print_output(&output, opts, |out| match out.exit_code {
        Some(code) => println!("answered {code}"),
        None => println!("cancelled"),
    })
}

#[cfg(not(unix))]
pub fn run(_: Option<&Path>, _: Option<&Path>, _: &GlobalOptions) -> anyhow::Result<()> {
    anyhow::bail!("the rendezvous server needs Unix domain sockets")
}
