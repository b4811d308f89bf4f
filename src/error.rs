use thiserror::Error;

use crate::{metadata::token::Token, weaver::engine::WeaveFailure};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! synthesis_error {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        crate::Error::Synthesis(format!($fmt $(, $arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants follow the failure taxonomy of the weaving pipeline:
///
/// ## Image Errors
/// - [`Error::Malformed`] - Corrupted or invalid module image or symbol file
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a buffer
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::GoblinErr`] - PE container parsing errors from goblin
///
/// ## Resolution Errors
/// - [`Error::TypeNotFound`], [`Error::MethodNotFound`], [`Error::FieldNotFound`] and
///   [`Error::AssemblyNotFound`] - a signature or name did not match anything
///
/// ## Weaving Errors
/// - [`Error::Synthesis`] - cloning or rewriting a method body failed
/// - [`Error::Validation`] - a rewritten image failed its verification load
/// - [`Error::WovenImageInvalid`] - a woven assembly failed validation and was restored; carries
///   the request failures of the weaving pass
///
/// ## Runtime Errors
/// - [`Error::Installation`] - installing a descriptor failed
/// - [`Error::AssemblyInstallation`] - aggregate of all failures for one assembly
/// - [`Error::ManagedException`] - interpreted code raised an exception
///
/// # Examples
///
/// ```rust,no_run
/// use dotweave::{Error, metadata::ModuleDef};
/// use std::path::Path;
///
/// match ModuleDef::from_path(Path::new("Game.dll")) {
///     Ok(module) => println!("loaded {}", module.name),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The image or symbol file is damaged and could not be parsed.
    ///
    /// Carries the source location where the inconsistency was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    #[error("Out of Bounds - attempted to access memory that is not available")]
    OutOfBounds,

    /// This file type or feature is not supported.
    #[error("This file type or feature is not supported: {0}")]
    NotSupported(String),

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The PE container could not be parsed.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Serialization of weaving records or configuration failed.
    #[error("Json - {0}")]
    Json(#[from] serde_json::Error),

    /// No type matches the given structural signature.
    #[error("Type not found - {0}")]
    TypeNotFound(String),

    /// No method of the type matches the given structural signature.
    #[error("Method not found - {method} in {klass}")]
    MethodNotFound {
        /// Signature of the declaring type that was searched
        klass: String,
        /// Signature of the method that was requested
        method: String,
    },

    /// A generated field or named field could not be found.
    #[error("Field not found - {field} in {klass}")]
    FieldNotFound {
        /// Name of the type that was searched
        klass: String,
        /// Name of the missing field
        field: String,
    },

    /// The resolver could not locate an assembly by name.
    #[error("Assembly not found - {0}")]
    AssemblyNotFound(String),

    /// A metadata token did not resolve to a row of the module.
    #[error("Invalid token - {0}")]
    InvalidToken(Token),

    /// Cloning or rewriting a method body failed.
    #[error("Synthesis - {0}")]
    Synthesis(String),

    /// A rewritten image could not be loaded back for verification.
    #[error("Validation - {0}")]
    Validation(String),

    /// A woven assembly failed its verification load.
    ///
    /// The file has been restored from its backup when one existed. `failures` holds the
    /// requests the weaving pass itself could not weave, which often explain the broken image.
    #[error(
        "Woven image of {assembly} is invalid: {cause}{}",
        describe_failures(failures)
    )]
    WovenImageInvalid {
        /// Name of the woven assembly
        assembly: String,
        /// The validation error
        #[source]
        cause: Box<Error>,
        /// Requests of the pass that failed to weave
        failures: Vec<WeaveFailure>,
    },

    /// Installing a single descriptor failed.
    #[error("Installation - {0}")]
    Installation(String),

    /// One or more descriptors of an assembly failed to install.
    ///
    /// Raised once per assembly after every descriptor has been attempted.
    #[error("Installation of assembly {assembly} failed with {} error(s): {}", errors.len(), join_errors(errors))]
    AssemblyInstallation {
        /// Name of the assembly whose installation failed
        assembly: String,
        /// Every failure encountered while installing the assembly
        errors: Vec<Error>,
    },

    /// Interpreted code raised an exception that nothing caught.
    #[error("Unhandled managed exception - {0}")]
    ManagedException(String),

    /// The interpreter was asked to execute something it cannot.
    #[error("Execution - {0}")]
    Execution(String),

    /// The recursion limit has been reached.
    #[error("Reach the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,

    /// The rendezvous handshake failed.
    #[error("Rendezvous - {0}")]
    Rendezvous(String),

    /// Generic error for miscellaneous cases.
    #[error("{0}")]
    Error(String),
}

fn describe_failures(failures: &[WeaveFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let described = failures
        .iter()
        .map(|f| format!("{}: {}", f.target, f.error))
        .collect::<Vec<_>>()
        .join("; ");
    format!(" ({} request(s) failed: {described})", failures.len())
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Whether the error is a resolution failure (type or method absent).
    ///
    /// Resolution failures are non-fatal during weaving: the descriptor is skipped.
    #[must_use]
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            Error::TypeNotFound(_) | Error::MethodNotFound { .. } | Error::AssemblyNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injection::WeavingRecord;

    #[test]
    fn aggregate_names_assembly_and_members() {
        let err = Error::AssemblyInstallation {
            assembly: "Game".to_string(),
            errors: vec![
                Error::Installation("first".to_string()),
                Error::TypeNotFound("Foo.Bar".to_string()),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("Game"));
        assert!(text.contains("2 error(s)"));
        assert!(text.contains("first"));
        assert!(text.contains("Foo.Bar"));
    }

    #[test]
    fn invalid_weave_lists_request_failures() {
        let err = Error::WovenImageInvalid {
            assembly: "Game".to_string(),
            cause: Box::new(Error::Validation("Game: call does not resolve".to_string())),
            failures: vec![WeaveFailure {
                target: WeavingRecord::new("Game", "Game.Player", "Missing<>"),
                error: Error::TypeNotFound("Game.Player".to_string()),
            }],
        };
        let text = err.to_string();
        assert!(text.starts_with("Woven image of Game is invalid: Validation - Game: call"));
        assert!(text.contains("1 request(s) failed"));
        assert!(text.contains("Missing<>"));

        let bare = Error::WovenImageInvalid {
            assembly: "Game".to_string(),
            cause: Box::new(Error::Validation("bad".to_string())),
            failures: Vec::new(),
        };
        assert_eq!(bare.to_string(), "Woven image of Game is invalid: Validation - bad");
    }

    #[test]
    fn malformed_carries_location() {
        let err = malformed_error!("bad header {}", 3);
        match err {
            Error::Malformed { message, file, .. } => {
                assert_eq!(message, "bad header 3");
                assert!(file.ends_with("error.rs"));
            }
            _ => panic!("expected malformed"),
        }
    }

    #[test]
    fn resolution_classification() {
        assert!(Error::TypeNotFound("A".into()).is_resolution());
        assert!(Error::MethodNotFound {
            klass: "A".into(),
            method: "B<>".into()
        }
        .is_resolution());
        assert!(!Error::Synthesis("x".into()).is_resolution());
    }
}
