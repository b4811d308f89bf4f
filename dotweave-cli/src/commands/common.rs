use std::path::Path;

use anyhow::Context;
use dotweave::{config::WeaveConfig, metadata::model::ModuleDef};

use crate::app::GlobalOptions;

/// The configuration named by `--config`, or the defaults, with `--project-root` applied.
pub fn load_config(opts: &GlobalOptions) -> anyhow::Result<WeaveConfig> {
    let mut config = match &opts.config {
        Some(path) => WeaveConfig::from_path(path)
            .with_context(|| format!("failed to read configuration: {}", path.display()))?,
        None => WeaveConfig::default(),
    };
    if let Some(root) = &opts.project_root {
        config.project_root = Some(root.clone());
    }
    Ok(config)
}

/// Read an assembly image, with its symbols if present.
pub fn load_module(path: &Path) -> anyhow::Result<ModuleDef> {
    ModuleDef::from_path(path).with_context(|| format!("failed to load assembly: {}", path.display()))
}

/// Extract a display-friendly filename from a path.
pub fn file_display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
