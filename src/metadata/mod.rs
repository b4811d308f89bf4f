//! Module model and its binary encodings.
//!
//! - [`model`] is the in-memory object model of a module: types, fields, methods and the
//!   references between them, with method bodies as index-based instruction lists
//! - [`signatures`] encodes and decodes ECMA-335 signature blobs
//! - [`body`] encodes and decodes method bodies
//! - [`image`] reads and writes whole module images
//! - [`symbols`] reads and writes the sequence point file beside an image
//! - [`builder`] adds types and methods fluently
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotweave::metadata::ModuleDef;
//! use std::path::Path;
//!
//! let module = ModuleDef::from_path(Path::new("Game.dll"))?;
//! for index in module.top_level_types() {
//!     let ty = &module.types[index];
//!     println!("{}.{}: {} methods", ty.namespace, ty.name, ty.methods.len());
//! }
//! # Ok::<(), dotweave::Error>(())
//! ```

pub mod body;
pub mod builder;
pub mod flags;
pub mod image;
pub mod model;
pub mod signatures;
pub mod symbols;
pub mod tables;
pub mod token;

pub use body::{ExceptionHandler, MethodBody, SequencePoint};
pub use model::{
    AssemblyRef, AttributeArg, CustomAttribute, FieldDef, FieldHandle, FieldId, GenericParam,
    MemberRef, MemberSig, MethodDef, MethodHandle, MethodId, ModuleDef, ParamDef,
    ResolutionScope, TypeDef, TypeHandle, TypeRef, Version, CORLIB_NAME, MODULE_TYPE_NAME,
};
pub use signatures::{MethodSig, TypeSig};
pub use token::{StableId, Token};
