//! The weaving engine.
//!
//! Weaving makes a compiled method replaceable at load time. For a target method `M` with
//! stable token `T` the engine adds to the declaring type:
//!
//! - `OriginMethod_M_T`, a private copy of the original body ([`clone`])
//! - `DelegateField_M_T`, a private static field typed by a delegate matching `M` ([`delegate`])
//! - `Delegate_M_T`, a nested delegate type, only when no standard delegate fits
//!
//! and rewrites `M` to forward to the field when it is set and to the copy otherwise
//! ([`stub`]). The marker attribute ([`marker`]) records the stable token and makes weaving
//! idempotent. Generated names follow [`naming`].
//!
//! [`engine`] weaves one module, [`batch`] many assemblies in parallel with backup and
//! recovery.

pub mod batch;
pub mod clone;
pub mod delegate;
pub mod engine;
pub mod marker;
pub mod naming;
pub mod stub;

pub use batch::{AssemblyReport, BatchReport, BatchWeaver};
pub use delegate::{DelegateBinding, DelegateShape};
pub use engine::{
    distinct_requests, inject_assembly, weave_method, weave_module, WeaveFailure, WeaveOutcome,
    WeaveRequest,
};
pub use marker::{is_woven, stable_id};
pub use naming::GeneratedNames;
