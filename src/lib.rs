// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'file/mod.rs' uses mmap to map a file into memory

//! # dotweave
//!
//! Retrofit compiled managed assemblies so that chosen methods can be replaced at load time,
//! without recompiling their source.
//!
//! Weaving happens in two halves:
//!
//! - **Weaving** ([`weaver`]) rewrites an assembly on disk. Every target method gets a private
//!   copy of its original body, a static delegate field, and a new body that calls through the
//!   field when it is set and into the copy otherwise. A marker attribute records the method's
//!   stable token and makes weaving idempotent.
//! - **Fix-up** ([`driver`]) runs in the loaded process. It finds the generated members through
//!   the marker and installs the replacement delegates built by [`injection`] descriptors.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dotweave::prelude::*;
//! use std::{path::PathBuf, sync::Arc};
//!
//! // Weave Game.dll in place, with a backup taken first.
//! let records = vec![WeavingRecord::new("Game", "Game.Player", "Greet<System.String>")];
//! let weaver = BatchWeaver::new(vec![PathBuf::from("Managed/Game.dll")], BackupManager::default());
//! let report = weaver.weave_records(&records);
//! assert!(report.is_success());
//!
//! // Load the woven assembly and install a replacement.
//! let runtime = Arc::new(Runtime::with_search_paths(vec![PathBuf::from("Managed")])?);
//! runtime.load_path("Managed/Game.dll".as_ref())?;
//! let driver = InjectionDriver::new(Arc::clone(&runtime));
//! driver.catalog().register(Arc::new(FnProvider::new("Mods", |_| {
//!     let target = WeavingRecord::new("Game", "Game.Player", "Greet<System.String>");
//!     Ok(vec![InjectionDescriptor::intercept(target, |runtime, original, args| {
//!         let greeting = original.invoke(runtime, args)?;
//!         Ok(Value::string(&format!("{}!", greeting.as_str().unwrap_or_default())))
//!     })])
//! })))?;
//! driver.install_all()?;
//! # Ok::<(), dotweave::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - module model, image reader/writer and symbol files
//! - [`assembly`] - CIL instruction codec and fluent assembler
//! - [`corlib`] - the base class library module
//! - [`runtime`] - loads images and interprets CIL; the "loaded process" of fix-up
//! - [`signature`] - structural type and method signatures shared by both halves
//! - [`resolver`] - resolves assembly names against an allow-list during weaving
//! - [`weaver`] - the weaving engine and batch weaving
//! - [`backup`] - backups and recovery of woven assemblies
//! - [`injection`] - descriptors, providers and weaving records
//! - [`driver`] - installation of replacements
//! - [`rendezvous`] - notification socket between a build step and the weaver
//! - [`config`] - configuration
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result):
//!
//! ```rust,no_run
//! use dotweave::{resolver::AssemblyResolver, Error};
//!
//! let resolver = AssemblyResolver::new(Vec::new());
//! match resolver.resolve("Game") {
//!     Ok(assembly) => println!("{} types", assembly.module().types.len()),
//!     Err(e) if e.is_resolution() => println!("Not allowed: {e}"),
//!     Err(e) => println!("Error: {e}"),
//! }
//! ```
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

pub mod assembly;
pub mod backup;
pub mod config;
pub mod corlib;
pub mod driver;
pub mod file;
pub mod injection;
pub mod metadata;
pub mod prelude;
#[cfg(unix)]
pub mod rendezvous;
pub mod resolver;
pub mod runtime;
pub mod signature;
pub mod weaver;

/// `dotweave` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `dotweave` Error type
///
/// ```rust
/// use dotweave::Error;
///
/// let err = Error::MethodNotFound { klass: "Game.Player".into(), method: "Greet<>".into() };
/// assert!(err.is_resolution());
/// ```
pub use error::Error;
