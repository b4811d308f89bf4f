//! The injection model: what to replace, and how it is identified across processes.
//!
//! - [`record`] - [`WeavingRecord`], the persisted structural identity of a target method
//! - [`descriptor`] - [`InjectionDescriptor`], a target plus the transform producing its replacement
//! - [`provider`] - [`InjectionProvider`] and the [`ProviderCatalog`] descriptors are discovered from
//!
//! Descriptors are shared by both halves of the tool: the weaver only needs their targets and
//! optional weave actions, the fix-up driver runs their transforms.

pub mod descriptor;
pub mod provider;
pub mod record;

pub use descriptor::{InjectionDescriptor, InstallAction, Transform, WeaveAction};
pub use provider::{Descriptors, FnProvider, InjectionProvider, ProviderCatalog};
pub use record::{dedupe, read_records, write_records, WeavingRecord};
