//! Names of the members generated for a woven method.
//!
//! Every name is derived from the method name and its [`StableId`] alone, which is what lets
//! the fix-up driver find the members again from the marker attribute. The id is printed as six
//! lowercase hex digits, the row part of the method's token.
//!
//! | Member | Name |
//! |--------|------|
//! | clone of the original body | `OriginMethod_<name>_<id>` |
//! | static delegate field | `DelegateField_<name>_<id>` |
//! | synthesized delegate type | `Delegate_<name>_<id>` |
//!
//! # Examples
//!
//! ```rust
//! use dotweave::{metadata::token::StableId, weaver::GeneratedNames};
//!
//! let names = GeneratedNames::new("Greet", StableId::new(0x0600_0002));
//! assert_eq!(names.origin_method, "OriginMethod_Greet_000002");
//! assert_eq!(names.delegate_field, "DelegateField_Greet_000002");
//! assert_eq!(names.delegate_type, "Delegate_Greet_000002");
//! ```

use crate::metadata::token::StableId;

/// Prefix of the clone holding the original body.
pub const ORIGIN_METHOD_PREFIX: &str = "OriginMethod";
/// Prefix of the static delegate field.
pub const DELEGATE_FIELD_PREFIX: &str = "DelegateField";
/// Prefix of a synthesized delegate type.
pub const DELEGATE_TYPE_PREFIX: &str = "Delegate";

/// `OriginMethod_<name>_<id>`
#[must_use]
pub fn origin_method_name(method: &str, id: StableId) -> String {
    format!("{ORIGIN_METHOD_PREFIX}_{method}_{id}")
}

/// `DelegateField_<name>_<id>`
#[must_use]
pub fn delegate_field_name(method: &str, id: StableId) -> String {
    format!("{DELEGATE_FIELD_PREFIX}_{method}_{id}")
}

/// `Delegate_<name>_<id>`
#[must_use]
pub fn delegate_type_name(method: &str, id: StableId) -> String {
    format!("{DELEGATE_TYPE_PREFIX}_{method}_{id}")
}

/// The generated names of one woven method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedNames {
    /// Name of the clone
    pub origin_method: String,
    /// Name of the static delegate field
    pub delegate_field: String,
    /// Name of the delegate type, used only when one is synthesized
    pub delegate_type: String,
}

impl GeneratedNames {
    /// The names for `method` woven under `id`.
    #[must_use]
    pub fn new(method: &str, id: StableId) -> Self {
        GeneratedNames {
            origin_method: origin_method_name(method, id),
            delegate_field: delegate_field_name(method, id),
            delegate_type: delegate_type_name(method, id),
        }
    }
}
