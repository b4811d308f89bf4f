//! # dotweave Prelude
//!
//! The types needed for the common weave-then-install workflow.
//!
//! ```rust,no_run
//! use dotweave::prelude::*;
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotweave operations
pub use crate::Error;

/// The result type used throughout dotweave
pub use crate::Result;

/// Configuration of weaving passes and the rendezvous
pub use crate::config::WeaveConfig;

// ================================================================================================
// Module Model
// ================================================================================================

/// In-memory module and its definitions
pub use crate::metadata::{
    MethodBody, MethodSig, ModuleDef, StableId, Token, TypeSig,
};

/// Fluent builders for types, methods and delegates
pub use crate::metadata::builder::{DelegateBuilder, MethodBuilder, TypeBuilder};

/// CIL instructions and the label-based assembler
pub use crate::assembly::{Instruction, InstructionAssembler, OpCode, Operand};

// ================================================================================================
// Weaving
// ================================================================================================

/// Assembly resolution during a weaving pass
pub use crate::resolver::AssemblyResolver;

/// The weaving engine
pub use crate::weaver::{
    inject_assembly, weave_module, BatchReport, BatchWeaver, WeaveOutcome, WeaveRequest,
};

/// Backups of woven assemblies
pub use crate::backup::BackupManager;

/// Structural signatures
pub use crate::signature::{StructuralMethod, StructuralType};

// ================================================================================================
// Injection and Fix-up
// ================================================================================================

/// Descriptors, providers and records
pub use crate::injection::{
    FnProvider, InjectionDescriptor, InjectionProvider, ProviderCatalog, WeavingRecord,
};

/// The fix-up driver
pub use crate::driver::{InjectionDriver, InstallState};

/// The runtime the driver installs into
pub use crate::runtime::{DelegateValue, Runtime, RuntimeMethodId, Value};
