use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// dotweave - method redirection weaving for managed assemblies
#[derive(Debug, Parser)]
#[command(name = "dotweave", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Weaving configuration file (JSON).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Project root the ephemeral build directories are relative to (overrides the configuration).
    #[arg(long, global = true, value_name = "DIR")]
    pub project_root: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Weave redirection stubs into the methods named by a record file.
    Weave {
        /// Record file: a JSON array of {assemblyName, klassSignature, methodSignature}.
        #[arg(short, long, value_name = "FILE")]
        records: Option<PathBuf>,

        /// Additional assemblies the pass may read to resolve references.
        #[arg(long, value_name = "FILE")]
        allow: Vec<PathBuf>,

        /// Assemblies to weave in place.
        #[arg(value_name = "FILE", required = true)]
        targets: Vec<PathBuf>,
    },

    /// Restore every backed-up assembly under a directory.
    Restore {
        /// Directory to search recursively.
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// List woven methods and their markers.
    Inspect {
        /// Path to the assembly file.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// List structural type and method signatures of an assembly.
    Signatures {
        /// Path to the assembly file.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Filter by type signature substring.
        #[arg(long, value_name = "NAME")]
        r#type: Option<String>,
    },

    /// Wait for one rendezvous notification and weave the notified directory.
    Serve {
        /// Directory holding the rendezvous endpoint (overrides the configuration).
        #[arg(long, value_name = "DIR")]
        runtime_dir: Option<PathBuf>,

        /// Record file (overrides the configuration).
        #[arg(short, long, value_name = "FILE")]
        records: Option<PathBuf>,
    },

    /// Notify a waiting server that a directory of assemblies is ready.
    Notify {
        /// Directory of freshly built assemblies.
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Directory holding the rendezvous endpoint (overrides the configuration).
        #[arg(long, value_name = "DIR")]
        runtime_dir: Option<PathBuf>,

        /// Connect timeout in milliseconds (overrides the configuration).
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
}
