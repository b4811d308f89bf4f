//! Configuration of weaving passes and the rendezvous endpoint.
//!
//! A [`WeaveConfig`] can be built in code or read from a JSON file. Every field is optional in
//! the file; missing fields take their defaults.
//!
//! ```json
//! {
//!     "projectRoot": "/work/MyGame",
//!     "ephemeralDirs": ["Library", "Temp"],
//!     "runtimeDir": "/tmp/dotweave",
//!     "connectTimeoutMs": 8000,
//!     "allowedAssemblies": ["Managed/Game.dll", "Managed/Engine.dll"],
//!     "recordsPath": "weaving-records.json"
//! }
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    backup::{BackupManager, DEFAULT_EPHEMERAL_DIRS},
    injection::{read_records, WeavingRecord},
    Result,
};

/// Default client connect timeout of the rendezvous in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 8000;

/// Settings for weaving and the rendezvous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeaveConfig {
    /// Root of the project; the ephemeral directories are relative to it. The current
    /// directory when unset
    pub project_root: Option<PathBuf>,

    /// Directories below the project root whose assemblies are build output and never backed up
    pub ephemeral_dirs: Vec<String>,

    /// Directory holding the rendezvous socket
    pub runtime_dir: PathBuf,

    /// How long a rendezvous client keeps trying to connect
    pub connect_timeout_ms: u64,

    /// Assembly files a weaving pass may read and rewrite, in resolution order
    pub allowed_assemblies: Vec<PathBuf>,

    /// Weaving record file used by the rendezvous server
    pub records_path: Option<PathBuf>,
}

impl Default for WeaveConfig {
    fn default() -> Self {
        Self {
            project_root: None,
            ephemeral_dirs: DEFAULT_EPHEMERAL_DIRS.iter().map(ToString::to_string).collect(),
            runtime_dir: std::env::temp_dir(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            allowed_assemblies: Vec::new(),
            records_path: None,
        }
    }
}

impl WeaveConfig {
    /// Defaults with the rendezvous socket under `runtime_dir`.
    #[must_use]
    pub fn with_runtime_dir(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            ..Self::default()
        }
    }

    /// Replace the allow-list.
    #[must_use]
    pub fn allow(mut self, assemblies: Vec<PathBuf>) -> Self {
        self.allowed_assemblies = assemblies;
        self
    }

    /// Read a JSON configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The client connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// A backup manager honouring [`WeaveConfig::project_root`] and
    /// [`WeaveConfig::ephemeral_dirs`].
    #[must_use]
    pub fn backup_manager(&self) -> BackupManager {
        let backups = BackupManager::new(self.ephemeral_dirs.clone());
        match &self.project_root {
            Some(root) => backups.with_project_root(root),
            None => backups,
        }
    }

    /// The records named by [`WeaveConfig::records_path`]; empty when unset.
    ///
    /// # Errors
    /// Returns an error if the record file cannot be read.
    pub fn records(&self) -> Result<Vec<WeavingRecord>> {
        match &self.records_path {
            Some(path) => read_records(path),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dotweave.json");
        fs::write(&path, r#"{"connectTimeoutMs": 250, "allowedAssemblies": ["Game.dll"]}"#).unwrap();

        let config = WeaveConfig::from_path(&path).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(250));
        assert_eq!(config.allowed_assemblies, vec![PathBuf::from("Game.dll")]);
        assert_eq!(config.ephemeral_dirs, vec!["Library", "Temp"]);
        assert!(config.records().unwrap().is_empty());
    }

    #[test]
    fn defaults() {
        let config = WeaveConfig::with_runtime_dir("/run/dotweave");
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(config.runtime_dir, PathBuf::from("/run/dotweave"));
        assert!(config.backup_manager().is_ephemeral(Path::new("Library/Game.dll")));
        assert_eq!(config.project_root, None);
    }

    #[test]
    fn project_root_anchors_backups() {
        let config: WeaveConfig =
            serde_json::from_str(r#"{"projectRoot": "/Users/dev/Library/MyGame"}"#).unwrap();
        let backups = config.backup_manager();
        assert_eq!(backups.project_root(), Path::new("/Users/dev/Library/MyGame"));
        assert!(!backups.is_ephemeral(Path::new("/Users/dev/Library/MyGame/Assets/Game.dll")));
        assert!(backups.is_ephemeral(Path::new("/Users/dev/Library/MyGame/Temp/Game.dll")));
    }
}
