//! Weaving several assemblies at once.
//!
//! Requests are grouped by assembly name and every group is woven on the rayon pool. Each
//! assembly goes through
//!
//! 1. backup, unless it is ephemeral or already backed up
//! 2. weave in place
//! 3. validation: a fresh [`Runtime`] loads and verifies the rewritten image
//! 4. recovery from the backup if any step after the backup failed
//!
//! A failing assembly never affects the others.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use rayon::prelude::*;

use crate::{
    backup::BackupManager,
    config::WeaveConfig,
    injection::WeavingRecord,
    runtime::Runtime,
    weaver::engine::{inject_assembly, WeaveOutcome, WeaveRequest},
    Error, Result,
};

/// Result of weaving one assembly of a batch.
#[derive(Debug)]
pub struct AssemblyReport {
    /// Assembly name
    pub assembly: String,
    /// File that was woven
    pub path: PathBuf,
    /// Outcome, or the error that made the assembly fail as a whole
    pub result: Result<WeaveOutcome>,
}

/// Result of a batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One report per woven assembly, ordered by name
    pub assemblies: Vec<AssemblyReport>,
    /// Assemblies that had requests but are not in the allow-list
    pub skipped: Vec<String>,
}

impl BatchReport {
    /// `true` if every assembly and every request succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.assemblies
            .iter()
            .all(|a| a.result.as_ref().is_ok_and(WeaveOutcome::is_success))
    }

    /// Total number of methods woven.
    #[must_use]
    pub fn woven(&self) -> usize {
        self.assemblies
            .iter()
            .filter_map(|a| a.result.as_ref().ok())
            .map(|o| o.woven.len())
            .sum()
    }
}

/// Weaves groups of requests into the assemblies of an allow-list.
#[derive(Debug, Clone)]
pub struct BatchWeaver {
    allowed: Vec<PathBuf>,
    backups: BackupManager,
}

impl BatchWeaver {
    /// A weaver over `allowed`, taking backups with `backups`.
    #[must_use]
    pub fn new(allowed: Vec<PathBuf>, backups: BackupManager) -> Self {
        BatchWeaver { allowed, backups }
    }

    /// A weaver configured by `config`.
    #[must_use]
    pub fn from_config(config: &WeaveConfig) -> Self {
        BatchWeaver::new(config.allowed_assemblies.clone(), config.backup_manager())
    }

    /// The allowed file of assembly `name`.
    #[must_use]
    pub fn path_of(&self, name: &str) -> Option<&Path> {
        self.allowed
            .iter()
            .find(|p| p.file_stem().is_some_and(|stem| stem == name))
            .map(PathBuf::as_path)
    }

    /// Weave `records` with the default action. Incomplete records are dropped.
    #[must_use]
    pub fn weave_records(&self, records: &[WeavingRecord]) -> BatchReport {
        let requests: Vec<WeaveRequest> = records
            .iter()
            .filter(|record| {
                let complete = record.is_complete();
                if !complete {
                    log::warn!("Ignoring incomplete weaving record {record}");
                }
                complete
            })
            .cloned()
            .map(WeaveRequest::from)
            .collect();
        self.weave(&requests)
    }

    /// Weave `requests`, one assembly per rayon task.
    #[must_use]
    pub fn weave(&self, requests: &[WeaveRequest]) -> BatchReport {
        let mut groups: BTreeMap<&str, Vec<WeaveRequest>> = BTreeMap::new();
        for request in requests {
            groups
                .entry(request.target.assembly_name.as_str())
                .or_default()
                .push(request.clone());
        }

        let mut report = BatchReport::default();
        let mut work = Vec::with_capacity(groups.len());
        for (name, group) in groups {
            match self.path_of(name) {
                Some(path) => work.push((name, path, group)),
                None => {
                    log::warn!("Skipping {name}: not in the allowed assemblies");
                    report.skipped.push(name.to_string());
                }
            }
        }

        report.assemblies = work
            .into_par_iter()
            .map(|(name, path, group)| AssemblyReport {
                assembly: name.to_string(),
                path: path.to_path_buf(),
                result: self.weave_assembly(path, &group),
            })
            .collect();
        report
    }

    /// Back up, weave, validate and, on failure, recover the assembly at `path`.
    ///
    /// # Errors
    /// Returns the error of the first failing step; the file is restored from its backup before
    /// returning if one exists. A failed validation is reported as
    /// [`Error::WovenImageInvalid`] carrying the request failures of the weave.
    pub fn weave_assembly(&self, path: &Path, requests: &[WeaveRequest]) -> Result<WeaveOutcome> {
        self.backups.try_backup(path)?;
        let result = inject_assembly(path, requests, &self.allowed, path).and_then(|outcome| {
            if !outcome.dirty {
                return Ok(outcome);
            }
            match self.validate(path) {
                Ok(()) => Ok(outcome),
                Err(cause) => Err(Error::WovenImageInvalid {
                    assembly: assembly_name(path),
                    cause: Box::new(cause),
                    failures: outcome.failures,
                }),
            }
        });

        if let Err(error) = &result {
            log::error!("Weaving {} failed: {error}", path.display());
            match self.backups.recover(path) {
                Ok(true) => {}
                Ok(false) => log::warn!("No backup of {} to recover", path.display()),
                Err(e) => log::error!("Recovering {} failed: {e}", path.display()),
            }
        }
        result
    }

    /// Load `path` into an isolated runtime and verify every reference resolves.
    ///
    /// The runtime sees only the files of the allow-list.
    ///
    /// # Errors
    /// Returns the load or verification error.
    pub fn validate(&self, path: &Path) -> Result<()> {
        let runtime = Runtime::with_allowed_assemblies(self.allowed.clone())?;
        let assembly = runtime.load_path(path)?;
        runtime.verify(assembly)?;
        log::debug!("Validated {}", path.display());
        Ok(())
    }
}

fn assembly_name(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| path.display().to_string(), |stem| stem.to_string_lossy().into_owned())
}
