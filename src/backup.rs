//! Backups of assemblies taken before they are woven.
//!
//! The backup of `Game.dll` is `Game.dll.backup`, a byte-for-byte copy of the file before its
//! first mutation; the symbol file `Game.pdb` gets `Game.pdb.backup` beside it. Assemblies below
//! an ephemeral build-output directory of the project (`<root>/Library`, `<root>/Temp`) are
//! regenerated by the build and never backed up. A directory of the same name elsewhere on the
//! path, such as `~/Library` on macOS, is not build output.
//!
//! ```rust,no_run
//! use dotweave::backup::BackupManager;
//! use std::path::Path;
//!
//! let backups = BackupManager::default().with_project_root("/work/MyGame");
//! let game = Path::new("/work/MyGame/Build/Managed/Game.dll");
//! backups.try_backup(game)?;
//! // ... weave, validate ...
//! backups.recover(game)?;
//! # Ok::<(), dotweave::Error>(())
//! ```

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::{metadata::symbols::symbol_path, Result};

/// Extension appended to backed-up files.
pub const BACKUP_EXTENSION: &str = "backup";

/// Build-output directories whose assemblies are never backed up by default.
pub const DEFAULT_EPHEMERAL_DIRS: [&str; 2] = ["Library", "Temp"];

/// Takes and restores backups of assemblies and their symbol files.
#[derive(Debug, Clone)]
pub struct BackupManager {
    project_root: PathBuf,
    ephemeral: Vec<String>,
}

impl Default for BackupManager {
    fn default() -> Self {
        BackupManager::new(DEFAULT_EPHEMERAL_DIRS.iter().map(ToString::to_string).collect())
    }
}

impl BackupManager {
    /// A manager treating the directories `ephemeral` directly below the project root as build
    /// output. The project root is the current directory until
    /// [`BackupManager::with_project_root`] sets it.
    #[must_use]
    pub fn new(ephemeral: Vec<String>) -> Self {
        BackupManager {
            project_root: std::env::current_dir().unwrap_or_default(),
            ephemeral,
        }
    }

    /// Anchor the ephemeral directories at `root`.
    #[must_use]
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    /// The directory the ephemeral directories are relative to.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// The backup file of `path`.
    #[must_use]
    pub fn backup_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(".");
        name.push(BACKUP_EXTENSION);
        PathBuf::from(name)
    }

    /// `true` if `path` lies below an ephemeral directory of the project.
    ///
    /// Relative paths are taken relative to the project root.
    #[must_use]
    pub fn is_ephemeral(&self, path: &Path) -> bool {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        };
        let Some(parent) = path.parent() else {
            return false;
        };
        self.ephemeral
            .iter()
            .any(|dir| parent.starts_with(self.project_root.join(dir)))
    }

    /// `true` if a backup of `path` exists.
    #[must_use]
    pub fn has_backup(&self, path: &Path) -> bool {
        Self::backup_path(path).is_file()
    }

    /// Copy `path` and its symbol file to their backups, replacing existing backups.
    ///
    /// Returns `false` if `path` is ephemeral and nothing was copied.
    ///
    /// # Errors
    /// Returns an error if a file cannot be copied.
    pub fn backup(&self, path: &Path) -> Result<bool> {
        if self.is_ephemeral(path) {
            log::debug!("Not backing up ephemeral {}", path.display());
            return Ok(false);
        }
        for file in Self::files_of(path) {
            fs::copy(&file, Self::backup_path(&file))?;
        }
        log::debug!("Backed up {}", path.display());
        Ok(true)
    }

    /// Back up `path` unless a backup already exists.
    ///
    /// Returns `true` if a backup was taken.
    ///
    /// # Errors
    /// Returns an error if a file cannot be copied.
    pub fn try_backup(&self, path: &Path) -> Result<bool> {
        if self.has_backup(path) {
            return Ok(false);
        }
        self.backup(path)
    }

    /// Restore `path` and its symbol file from their backups.
    ///
    /// Returns `false` if `path` has no backup.
    ///
    /// # Errors
    /// Returns an error if a file cannot be copied.
    pub fn recover(&self, path: &Path) -> Result<bool> {
        if !self.has_backup(path) {
            return Ok(false);
        }
        fs::copy(Self::backup_path(path), path)?;
        let symbols = symbol_path(path);
        let symbols_backup = Self::backup_path(&symbols);
        if symbols_backup.is_file() {
            fs::copy(symbols_backup, symbols)?;
        }
        log::info!("Recovered {} from backup", path.display());
        Ok(true)
    }

    /// Recover every backed-up assembly below `dir`.
    ///
    /// Returns the restored assembly paths in walk order.
    ///
    /// # Errors
    /// Returns an error if the tree cannot be walked or a file cannot be copied.
    pub fn restore_all(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut restored = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            let path = entry.path();
            if !entry.file_type().is_file() || !path.extension().is_some_and(|e| e == BACKUP_EXTENSION) {
                continue;
            }
            let original = path.with_extension("");
            if original.extension().is_some_and(|e| e == "pdb") {
                continue;
            }
            if self.recover(&original)? {
                restored.push(original);
            }
        }
        Ok(restored)
    }

    fn files_of(path: &Path) -> Vec<PathBuf> {
        let symbols = symbol_path(path);
        if symbols.is_file() {
            vec![path.to_path_buf(), symbols]
        } else {
            vec![path.to_path_buf()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_names() {
        assert_eq!(
            BackupManager::backup_path(Path::new("Managed/Game.dll")),
            PathBuf::from("Managed/Game.dll.backup")
        );
    }

    #[test]
    fn ephemeral_directories_are_anchored_at_the_project() {
        let backups = BackupManager::default().with_project_root("/work/Project");
        assert!(backups.is_ephemeral(Path::new("/work/Project/Library/ScriptAssemblies/Game.dll")));
        assert!(backups.is_ephemeral(Path::new("/work/Project/Temp/Game.dll")));
        assert!(backups.is_ephemeral(Path::new("Temp/Game.dll")));
        assert!(!backups.is_ephemeral(Path::new("/work/Project/Libraryish/Game.dll")));
        assert!(!backups.is_ephemeral(Path::new("/work/Project/Build/Game_Data/Managed/Game.dll")));
        assert!(!backups.is_ephemeral(Path::new("/work/Project/Assets/Library/Game.dll")));
        assert!(!backups.is_ephemeral(Path::new("/work/Project/Library")));
    }

    #[test]
    fn same_named_directories_outside_the_project_are_not_ephemeral() {
        let mac = BackupManager::default()
            .with_project_root("/Users/dev/Library/Mobile Documents/MyGame");
        assert!(!mac.is_ephemeral(Path::new(
            "/Users/dev/Library/Mobile Documents/MyGame/Assets/Plugins/Engine.dll"
        )));
        assert!(mac.is_ephemeral(Path::new(
            "/Users/dev/Library/Mobile Documents/MyGame/Library/ScriptAssemblies/Game.dll"
        )));

        let linux = BackupManager::default().with_project_root("/home/dev/Temp/MyGame");
        assert!(!linux.is_ephemeral(Path::new("/home/dev/Temp/MyGame/Assets/Plugins/Engine.dll")));
        assert!(!linux.is_ephemeral(Path::new("/opt/Temp/Game.dll")));
    }

    #[test]
    fn project_library_is_backed_up_outside_build_output() {
        let home = tempfile::tempdir().unwrap();
        let project = home.path().join("Library").join("MyGame");
        let plugins = project.join("Assets").join("Plugins");
        fs::create_dir_all(&plugins).unwrap();
        let dll = plugins.join("Engine.dll");
        fs::write(&dll, b"original").unwrap();

        let backups = BackupManager::default().with_project_root(&project);
        assert!(backups.backup(&dll).unwrap());
        assert!(backups.has_backup(&dll));
    }

    #[test]
    fn backup_is_taken_once_and_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let dll = dir.path().join("Game.dll");
        let pdb = dir.path().join("Game.pdb");
        fs::write(&dll, b"original").unwrap();
        fs::write(&pdb, b"symbols").unwrap();

        let backups = BackupManager::default();
        assert!(backups.try_backup(&dll).unwrap());
        fs::write(&dll, b"woven").unwrap();
        fs::write(&pdb, b"woven symbols").unwrap();
        assert!(!backups.try_backup(&dll).unwrap());
        assert_eq!(fs::read(BackupManager::backup_path(&dll)).unwrap(), b"original");

        assert!(backups.recover(&dll).unwrap());
        assert_eq!(fs::read(&dll).unwrap(), b"original");
        assert_eq!(fs::read(&pdb).unwrap(), b"symbols");
    }

    #[test]
    fn restore_all_walks_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("Managed");
        fs::create_dir_all(&nested).unwrap();
        let a = nested.join("A.dll");
        let b = dir.path().join("B.dll");
        let c = dir.path().join("C.dll");
        for path in [&a, &b, &c] {
            fs::write(path, b"original").unwrap();
        }
        let backups = BackupManager::new(Vec::new());
        backups.backup(&a).unwrap();
        backups.backup(&b).unwrap();
        for path in [&a, &b, &c] {
            fs::write(path, b"woven").unwrap();
        }

        let mut restored = backups.restore_all(dir.path()).unwrap();
        restored.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(restored, expected);
        assert_eq!(fs::read(&a).unwrap(), b"original");
        assert_eq!(fs::read(&c).unwrap(), b"woven");
    }

    #[test]
    fn ephemeral_assemblies_are_not_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("Temp");
        fs::create_dir_all(&temp).unwrap();
        let dll = temp.join("Game.dll");
        fs::write(&dll, b"original").unwrap();
        let backups = BackupManager::default().with_project_root(dir.path());
        assert!(!backups.backup(&dll).unwrap());
        assert!(!backups.has_backup(&dll));
        assert!(!backups.recover(&dll).unwrap());
    }
}
