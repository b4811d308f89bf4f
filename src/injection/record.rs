//! Weaving records: the persisted identity of a method to weave.
//!
//! A record names a method by assembly name plus structural type and method signatures, so
//! it survives recompilation of the target. Record files are JSON arrays:
//!
//! ```json
//! [{"assemblyName": "Game", "klassSignature": "Game.Player", "methodSignature": "Greet<System.String>"}]
//! ```

use std::{collections::HashSet, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    metadata::model::{MethodId, ModuleDef},
    runtime::{Runtime, RuntimeMethodId},
    signature::{BinaryMethod, BinaryType, RuntimeMethod, RuntimeType, StructuralMethod, StructuralType},
    Result,
};

/// Identity of one method to weave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeavingRecord {
    /// Simple name of the assembly defining the method
    pub assembly_name: String,
    /// Signature of the declaring type
    pub klass_signature: String,
    /// Signature of the method
    pub method_signature: String,
}

impl WeavingRecord {
    /// A record from its three parts.
    #[must_use]
    pub fn new(assembly_name: &str, klass_signature: &str, method_signature: &str) -> Self {
        WeavingRecord {
            assembly_name: assembly_name.to_string(),
            klass_signature: klass_signature.to_string(),
            method_signature: method_signature.to_string(),
        }
    }

    /// The record of a method definition in a module image.
    ///
    /// # Errors
    /// Returns an error if the method or a parameter type cannot be described.
    pub fn from_binary(module: &ModuleDef, method: MethodId) -> Result<Self> {
        Ok(WeavingRecord {
            assembly_name: module.name.clone(),
            klass_signature: BinaryType::new(module, method.ty).signature()?,
            method_signature: BinaryMethod::new(module, method).signature()?,
        })
    }

    /// The record of a method loaded into `runtime`.
    ///
    /// # Errors
    /// Returns an error if the method or a parameter type cannot be described.
    pub fn from_runtime(runtime: &Runtime, method: RuntimeMethodId) -> Result<Self> {
        Ok(WeavingRecord {
            assembly_name: runtime.assembly(method.assembly)?.name().to_string(),
            klass_signature: RuntimeType::new(runtime, method.declaring_type()).signature()?,
            method_signature: RuntimeMethod::new(runtime, method).signature()?,
        })
    }

    /// `true` if every part is non-empty.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.assembly_name.is_empty() && !self.klass_signature.is_empty() && !self.method_signature.is_empty()
    }
}

impl std::fmt::Display for WeavingRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}::{}", self.assembly_name, self.klass_signature, self.method_signature)
    }
}

/// Drop repeated records, keeping the first occurrence of each.
#[must_use]
pub fn dedupe(records: impl IntoIterator<Item = WeavingRecord>) -> Vec<WeavingRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.clone()))
        .collect()
}

/// Read a record file, dropping duplicates.
///
/// # Errors
/// Returns an error if the file cannot be read or is not a JSON array of records.
pub fn read_records(path: &Path) -> Result<Vec<WeavingRecord>> {
    let text = fs::read_to_string(path)?;
    let records: Vec<WeavingRecord> = serde_json::from_str(&text)?;
    Ok(dedupe(records))
}

/// Write a record file, dropping duplicates.
///
/// # Errors
/// Returns an error if serialisation or writing fails.
pub fn write_records(path: &Path, records: &[WeavingRecord]) -> Result<()> {
    let records = dedupe(records.iter().cloned());
    fs::write(path, serde_json::to_string_pretty(&records)?)?;
    Ok(())
}
