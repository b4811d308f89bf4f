//! The module image format.
//!
//! An image is a PE file (see [`crate::file::pe`]) whose CLR header locates an ECMA-335
//! metadata root:
//!
//! - `#~` holds the tables, with column widths derived from heap sizes and row counts
//! - `#Strings`, `#US`, `#Blob` and `#GUID` are the heaps
//! - a MethodDef RVA addresses its body in the `.text` section; 0 marks a method without body
//!
//! Only the tables the weaving model represents are accepted; images that carry others (for
//! example `Property` or `Event`) are rejected with [`crate::Error::NotSupported`] instead of
//! being rewritten lossily.
//!
//! [`ModuleDef::from_path`] and [`ModuleDef::write_to`] also take care of the symbol file.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotweave::metadata::ModuleDef;
//! use std::path::Path;
//!
//! let mut module = ModuleDef::from_path(Path::new("Game.dll"))?;
//! println!("{} types", module.types.len());
//! module.write_to(Path::new("Game.woven.dll"))?;
//! # Ok::<(), dotweave::Error>(())
//! ```

pub mod heaps;
pub mod reader;
pub mod root;
pub mod writer;

pub use reader::{decode_attribute_value, read_image, ReadImage};
pub use writer::{encode_attribute_value, write_image, WrittenImage};

use std::{collections::HashMap, path::Path};

use crate::{
    file::File,
    metadata::{
        model::ModuleDef,
        symbols::{read_symbols, symbol_path, write_symbols},
        token::Token,
    },
    Result,
};

/// `BSJB`
pub const METADATA_MAGIC: u32 = 0x424A_5342;
/// Runtime version recorded in the root.
pub const VERSION_STRING: &str = "v4.0.30319";
/// Tables stream name
pub const STREAM_TABLES: &str = "#~";
/// Strings heap name
pub const STREAM_STRINGS: &str = "#Strings";
/// User strings heap name
pub const STREAM_US: &str = "#US";
/// GUID heap name
pub const STREAM_GUID: &str = "#GUID";
/// Blob heap name
pub const STREAM_BLOB: &str = "#Blob";

/// Byte offset of every instruction of every body (plus the code length), by method token.
pub type MethodOffsets = HashMap<Token, Vec<u32>>;

impl ModuleDef {
    /// Load an image from disk, with its symbol file if one exists beside it.
    ///
    /// # Errors
    /// Returns an error if either file cannot be read or is malformed.
    pub fn from_path(path: &Path) -> Result<ModuleDef> {
        let file = File::from_path(path)?;
        let read = read_image(file.data())?;
        let mut module = read.module;

        let symbols = symbol_path(path);
        if symbols.is_file() {
            let data = std::fs::read(&symbols)?;
            read_symbols(&data, &mut module, &read.method_offsets)?;
            log::debug!("Loaded symbols for {} from {}", module.name, symbols.display());
        }
        Ok(module)
    }

    /// Parse an in-memory image. Symbols are not loaded.
    ///
    /// # Errors
    /// Returns an error if the image is malformed.
    pub fn from_bytes(data: &[u8]) -> Result<ModuleDef> {
        Ok(read_image(data)?.module)
    }

    /// Serialise to an in-memory image, updating tokens and the MVID.
    ///
    /// # Errors
    /// Returns an error if the model holds dangling references or invalid bodies.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.assign_tokens();
        let written = write_image(self)?;
        self.mvid = written.mvid;
        Ok(written.bytes)
    }

    /// Write the image to `path`, and the symbol file if symbols were loaded.
    ///
    /// # Errors
    /// Returns an error if serialisation or file I/O fails.
    pub fn write_to(&mut self, path: &Path) -> Result<()> {
        self.assign_tokens();
        let written = write_image(self)?;
        self.mvid = written.mvid;
        std::fs::write(path, &written.bytes)?;

        if self.has_symbols {
            let symbols = write_symbols(self, &written.method_offsets)?;
            std::fs::write(symbol_path(path), symbols)?;
        }
        log::debug!("Wrote {} ({} bytes) to {}", self.name, written.bytes.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{Instruction, OpCode, Operand},
        metadata::{
            body::{MethodBody, SequencePoint},
            flags::{FieldAttributes, MethodAttributes, TypeAttributes},
            model::{AttributeArg, CustomAttribute, FieldDef, MethodDef, MethodHandle, TypeDef},
            signatures::{MethodSig, TypeSig},
        },
    };

    fn sample() -> ModuleDef {
        let mut module = ModuleDef::new("Sample");
        let object = module.corlib_type("System", "Object");
        let ty = module.add_type(TypeDef::new("Demo", "Greeter", TypeAttributes::PUBLIC, Some(object)));
        module
            .add_field(ty, FieldDef::new("count", FieldAttributes::PRIVATE | FieldAttributes::STATIC, TypeSig::I4))
            .unwrap();

        let string = module.corlib_type("System", "String");
        let concat = module.member_ref(
            string,
            "Concat",
            crate::metadata::model::MemberSig::Method(MethodSig::static_method(
                TypeSig::String,
                vec![TypeSig::String, TypeSig::String],
            )),
        );

        let mut greet = MethodDef::new(
            "Greet",
            MethodAttributes::PUBLIC | MethodAttributes::STATIC,
            MethodSig::static_method(TypeSig::String, vec![TypeSig::String]),
        );
        let mut body = MethodBody::with_instructions(vec![
            Instruction::with(OpCode::Ldstr, Operand::String("Hello ".to_string())),
            Instruction::ldarg(0),
            Instruction::with(OpCode::Call, Operand::Method(MethodHandle::Ref(concat))),
            Instruction::new(OpCode::Ret),
        ]);
        body.max_stack = 8;
        greet.body = Some(body);
        module.add_method(ty, greet).unwrap();
        module
    }

    #[test]
    fn image_round_trip() {
        let mut module = sample();
        let bytes = module.to_bytes().unwrap();
        let read = ModuleDef::from_bytes(&bytes).unwrap();

        assert_eq!(read.name, "Sample");
        assert_eq!(read.mvid, module.mvid);
        assert_eq!(read.types, module.types);
        assert_eq!(read.type_refs, module.type_refs);
        assert_eq!(read.member_refs, module.member_refs);
        assert_eq!(read.assembly_refs, module.assembly_refs);
    }

    #[test]
    fn writing_is_deterministic() {
        let mut module = sample();
        let first = module.to_bytes().unwrap();
        let second = module.to_bytes().unwrap();
        assert_eq!(first, second);
        assert_ne!(module.mvid, uguid::Guid::ZERO);
    }

    #[test]
    fn corrupted_image_is_rejected() {
        let mut module = sample();
        let mut bytes = module.to_bytes().unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xFF;
        assert!(ModuleDef::from_bytes(&bytes).is_err());
        assert!(ModuleDef::from_bytes(&[]).is_err());
    }

    #[test]
    fn image_is_a_pe_dll() {
        let mut module = sample();
        let bytes = module.to_bytes().unwrap();

        let pe = goblin::pe::PE::parse(&bytes).unwrap();
        assert!(pe.is_lib);
        assert_eq!(pe.sections.len(), 1);

        let cli = crate::file::pe::CliImage::parse(&bytes).unwrap();
        assert_eq!(cli.flags(), crate::file::pe::FLAGS_IL_ONLY);
        assert_eq!(&cli.metadata()[..4], b"BSJB");
    }

    #[test]
    fn large_heaps_use_wide_indices() {
        let mut module = sample();
        let name = "Greet".repeat(0x4000);
        module.types[1].methods[0].name = name.clone();
        let bytes = module.to_bytes().unwrap();

        let read = ModuleDef::from_bytes(&bytes).unwrap();
        assert_eq!(read.types[1].methods[0].name, name);
        assert_eq!(read.types, module.types);
        assert_eq!(read.member_refs, module.member_refs);
    }

    #[test]
    fn attribute_values() {
        let args = vec![
            AttributeArg::I4(0x0600_0002),
            AttributeArg::Bool(true),
            AttributeArg::String(None),
            AttributeArg::String(Some("x".to_string())),
        ];
        let blob = encode_attribute_value(&args).unwrap();
        let params = [TypeSig::I4, TypeSig::Boolean, TypeSig::String, TypeSig::String];
        assert_eq!(decode_attribute_value(&blob, &params).unwrap(), args);
        assert!(decode_attribute_value(&blob[2..], &params).is_err());
    }

    #[test]
    fn attributes_survive_round_trip() {
        let mut module = sample();
        let attribute = module.corlib_type("System", "ObsoleteAttribute");
        let ctor = module.member_ref(
            attribute,
            ".ctor",
            crate::metadata::model::MemberSig::Method(MethodSig::instance(TypeSig::Void, vec![TypeSig::String])),
        );
        module.types[1].methods[0].custom_attributes.push(CustomAttribute {
            ctor: MethodHandle::Ref(ctor),
            args: vec![AttributeArg::String(Some("old".to_string()))],
        });
        let bytes = module.to_bytes().unwrap();
        let read = ModuleDef::from_bytes(&bytes).unwrap();
        assert!(read.has_attribute(&read.types[1].methods[0].custom_attributes, "System", "ObsoleteAttribute"));
    }

    #[test]
    fn symbols_follow_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Sample.dll");

        let mut module = sample();
        module.has_symbols = true;
        if let Some(body) = module.types[1].methods[0].body.as_mut() {
            body.sequence_points.push(SequencePoint {
                index: 2,
                document: "Greeter.cs".to_string(),
                start_line: 10,
                start_column: 5,
                end_line: 10,
                end_column: 30,
            });
        }
        module.write_to(&path).unwrap();
        assert!(dir.path().join("Sample.pdb").is_file());

        let read = ModuleDef::from_path(&path).unwrap();
        assert!(read.has_symbols);
        let body = read.types[1].methods[0].body.as_ref().unwrap();
        assert_eq!(body.sequence_points.len(), 1);
        assert_eq!(body.sequence_points[0].index, 2);
        assert_eq!(body.sequence_points[0].document, "Greeter.cs");

        let plain = ModuleDef::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        assert!(!plain.has_symbols);
    }
}
