//! Type, method, field and local signatures and their blob encoding (ECMA-335 II.23.2).
//!
//! Signatures reference types through [`TypeHandle`]s. In a blob those are written as
//! `TypeDefOrRefOrSpecEncoded` coded indices whose rows are the handle index plus one, which
//! holds because the image writer emits every table in model order.

use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::model::TypeHandle,
    Error::RecursionLimit,
    Result,
};

/// Maximum nesting depth accepted when parsing a signature blob.
const MAX_RECURSION_DEPTH: usize = 50;

/// Element type constants used in signature blobs.
#[allow(non_snake_case, missing_docs)]
pub mod ELEMENT_TYPE {
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const PTR: u8 = 0x0f;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const GENERICINST: u8 = 0x15;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const OBJECT: u8 = 0x1c;
    pub const SZARRAY: u8 = 0x1d;
    pub const MVAR: u8 = 0x1e;
}

/// Calling convention bits of a method signature.
#[allow(non_snake_case, missing_docs)]
pub mod CALLING_CONVENTION {
    pub const DEFAULT: u8 = 0x00;
    pub const FIELD: u8 = 0x06;
    pub const LOCAL_SIG: u8 = 0x07;
    pub const GENERIC: u8 = 0x10;
    pub const HASTHIS: u8 = 0x20;
    pub const EXPLICITTHIS: u8 = 0x40;
}

/// A type as it appears in a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// `void`
    Void,
    /// `System.Boolean`
    Boolean,
    /// `System.Char`
    Char,
    /// `System.SByte`
    I1,
    /// `System.Byte`
    U1,
    /// `System.Int16`
    I2,
    /// `System.UInt16`
    U2,
    /// `System.Int32`
    I4,
    /// `System.UInt32`
    U4,
    /// `System.Int64`
    I8,
    /// `System.UInt64`
    U8,
    /// `System.Single`
    R4,
    /// `System.Double`
    R8,
    /// `System.String`
    String,
    /// `System.Object`
    Object,
    /// `System.IntPtr`
    I,
    /// `System.UIntPtr`
    U,
    /// A reference type
    Class(TypeHandle),
    /// A value type
    ValueType(TypeHandle),
    /// An instantiated generic type
    GenericInst {
        /// The generic type definition
        base: TypeHandle,
        /// `true` if the definition is a value type
        value_type: bool,
        /// Type arguments
        args: Vec<TypeSig>,
    },
    /// Generic parameter of the enclosing type, by position
    Var(u32),
    /// Generic parameter of the enclosing method, by position
    MVar(u32),
    /// Managed pointer
    ByRef(Box<TypeSig>),
    /// Unmanaged pointer
    Ptr(Box<TypeSig>),
    /// Single-dimensional, zero-based array
    SzArray(Box<TypeSig>),
}

impl TypeSig {
    /// Wrap in a managed pointer.
    #[must_use]
    pub fn by_ref(self) -> TypeSig {
        TypeSig::ByRef(Box::new(self))
    }

    /// `true` for managed pointers.
    #[must_use]
    pub fn is_by_ref(&self) -> bool {
        matches!(self, TypeSig::ByRef(_))
    }

    /// `true` for `void`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, TypeSig::Void)
    }

    /// Namespace and name of the base library type behind a primitive element type.
    #[must_use]
    pub fn primitive_name(&self) -> Option<(&'static str, &'static str)> {
        let name = match self {
            TypeSig::Void => "Void",
            TypeSig::Boolean => "Boolean",
            TypeSig::Char => "Char",
            TypeSig::I1 => "SByte",
            TypeSig::U1 => "Byte",
            TypeSig::I2 => "Int16",
            TypeSig::U2 => "UInt16",
            TypeSig::I4 => "Int32",
            TypeSig::U4 => "UInt32",
            TypeSig::I8 => "Int64",
            TypeSig::U8 => "UInt64",
            TypeSig::R4 => "Single",
            TypeSig::R8 => "Double",
            TypeSig::String => "String",
            TypeSig::Object => "Object",
            TypeSig::I => "IntPtr",
            TypeSig::U => "UIntPtr",
            _ => return None,
        };
        Some(("System", name))
    }

    /// The primitive element type for a base library type name, if it has one.
    #[must_use]
    pub fn from_primitive_name(namespace: &str, name: &str) -> Option<TypeSig> {
        if namespace != "System" {
            return None;
        }
        Some(match name {
            "Void" => TypeSig::Void,
            "Boolean" => TypeSig::Boolean,
            "Char" => TypeSig::Char,
            "SByte" => TypeSig::I1,
            "Byte" => TypeSig::U1,
            "Int16" => TypeSig::I2,
            "UInt16" => TypeSig::U2,
            "Int32" => TypeSig::I4,
            "UInt32" => TypeSig::U4,
            "Int64" => TypeSig::I8,
            "UInt64" => TypeSig::U8,
            "Single" => TypeSig::R4,
            "Double" => TypeSig::R8,
            "String" => TypeSig::String,
            "Object" => TypeSig::Object,
            "IntPtr" => TypeSig::I,
            "UIntPtr" => TypeSig::U,
            _ => return None,
        })
    }
}

/// A method signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    /// Instance method with an implicit receiver
    pub has_this: bool,
    /// Receiver is listed explicitly in `params`
    pub explicit_this: bool,
    /// Number of method generic parameters
    pub generic_param_count: u32,
    /// Return type
    pub ret: TypeSig,
    /// Parameter types, receiver excluded
    pub params: Vec<TypeSig>,
}

impl MethodSig {
    /// Signature of an instance method.
    #[must_use]
    pub fn instance(ret: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            has_this: true,
            explicit_this: false,
            generic_param_count: 0,
            ret,
            params,
        }
    }

    /// Signature of a static method.
    #[must_use]
    pub fn static_method(ret: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            has_this: false,
            ..MethodSig::instance(ret, params)
        }
    }

    /// Number of arguments on the evaluation stack at a call, receiver included.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.has_this && !self.explicit_this)
    }

    /// Encode as a method signature blob.
    ///
    /// # Errors
    /// Returns an error if a count does not fit the compressed encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new();
        let mut conv = CALLING_CONVENTION::DEFAULT;
        if self.has_this {
            conv |= CALLING_CONVENTION::HASTHIS;
        }
        if self.explicit_this {
            conv |= CALLING_CONVENTION::EXPLICITTHIS;
        }
        if self.generic_param_count > 0 {
            conv |= CALLING_CONVENTION::GENERIC;
        }
        writer.write_le::<u8>(conv);
        if self.generic_param_count > 0 {
            writer.write_compressed_uint(self.generic_param_count)?;
        }
        writer.write_compressed_uint(count(self.params.len())?)?;
        encode_type(&mut writer, &self.ret)?;
        for param in &self.params {
            encode_type(&mut writer, param)?;
        }
        Ok(writer.into_inner())
    }
}

/// Encode a field signature blob.
///
/// # Errors
/// Returns an error if a nested count does not fit the compressed encoding.
pub fn encode_field_sig(signature: &TypeSig) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    writer.write_le::<u8>(CALLING_CONVENTION::FIELD);
    encode_type(&mut writer, signature)?;
    Ok(writer.into_inner())
}

/// Encode a local variable signature blob.
///
/// # Errors
/// Returns an error if a count does not fit the compressed encoding.
pub fn encode_locals_sig(locals: &[TypeSig]) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    writer.write_le::<u8>(CALLING_CONVENTION::LOCAL_SIG);
    writer.write_compressed_uint(count(locals.len())?)?;
    for local in locals {
        encode_type(&mut writer, local)?;
    }
    Ok(writer.into_inner())
}

/// Encode a type specification blob.
///
/// # Errors
/// Returns an error if a count does not fit the compressed encoding.
pub fn encode_type_spec(signature: &TypeSig) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    encode_type(&mut writer, signature)?;
    Ok(writer.into_inner())
}

fn count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| malformed_error!("Signature count {} too large", len))
}

/// Encode a [`TypeHandle`] as a `TypeDefOrRefOrSpecEncoded` value.
///
/// # Errors
/// Returns an error if the row does not fit 24 bits.
pub fn encode_type_handle(handle: TypeHandle) -> Result<u32> {
    let (index, tag) = match handle {
        TypeHandle::Def(i) => (i, 0),
        TypeHandle::Ref(i) => (i, 1),
        TypeHandle::Spec(i) => (i, 2),
    };
    let row = u32::try_from(index + 1)
        .ok()
        .filter(|r| *r <= 0x00FF_FFFF)
        .ok_or_else(|| malformed_error!("Type row {} out of range", index + 1))?;
    Ok((row << 2) | tag)
}

/// Decode a `TypeDefOrRefOrSpecEncoded` value.
///
/// # Errors
/// Returns an error for a null row or an unknown tag.
pub fn decode_type_handle(value: u32) -> Result<TypeHandle> {
    let row = value >> 2;
    if row == 0 {
        return Err(malformed_error!("Null type reference in signature"));
    }
    let index = (row - 1) as usize;
    match value & 0x3 {
        0 => Ok(TypeHandle::Def(index)),
        1 => Ok(TypeHandle::Ref(index)),
        2 => Ok(TypeHandle::Spec(index)),
        tag => Err(malformed_error!("Invalid TypeDefOrRef tag {}", tag)),
    }
}

fn encode_type(writer: &mut Writer, signature: &TypeSig) -> Result<()> {
    let element = match signature {
        TypeSig::Void => ELEMENT_TYPE::VOID,
        TypeSig::Boolean => ELEMENT_TYPE::BOOLEAN,
        TypeSig::Char => ELEMENT_TYPE::CHAR,
        TypeSig::I1 => ELEMENT_TYPE::I1,
        TypeSig::U1 => ELEMENT_TYPE::U1,
        TypeSig::I2 => ELEMENT_TYPE::I2,
        TypeSig::U2 => ELEMENT_TYPE::U2,
        TypeSig::I4 => ELEMENT_TYPE::I4,
        TypeSig::U4 => ELEMENT_TYPE::U4,
        TypeSig::I8 => ELEMENT_TYPE::I8,
        TypeSig::U8 => ELEMENT_TYPE::U8,
        TypeSig::R4 => ELEMENT_TYPE::R4,
        TypeSig::R8 => ELEMENT_TYPE::R8,
        TypeSig::String => ELEMENT_TYPE::STRING,
        TypeSig::Object => ELEMENT_TYPE::OBJECT,
        TypeSig::I => ELEMENT_TYPE::I,
        TypeSig::U => ELEMENT_TYPE::U,
        TypeSig::Class(handle) => {
            writer.write_le::<u8>(ELEMENT_TYPE::CLASS);
            return writer.write_compressed_uint(encode_type_handle(*handle)?);
        }
        TypeSig::ValueType(handle) => {
            writer.write_le::<u8>(ELEMENT_TYPE::VALUETYPE);
            return writer.write_compressed_uint(encode_type_handle(*handle)?);
        }
        TypeSig::GenericInst {
            base,
            value_type,
            args,
        } => {
            writer.write_le::<u8>(ELEMENT_TYPE::GENERICINST);
            writer.write_le::<u8>(if *value_type {
                ELEMENT_TYPE::VALUETYPE
            } else {
                ELEMENT_TYPE::CLASS
            });
            writer.write_compressed_uint(encode_type_handle(*base)?)?;
            writer.write_compressed_uint(count(args.len())?)?;
            for arg in args {
                encode_type(writer, arg)?;
            }
            return Ok(());
        }
        TypeSig::Var(position) => {
            writer.write_le::<u8>(ELEMENT_TYPE::VAR);
            return writer.write_compressed_uint(*position);
        }
        TypeSig::MVar(position) => {
            writer.write_le::<u8>(ELEMENT_TYPE::MVAR);
            return writer.write_compressed_uint(*position);
        }
        TypeSig::ByRef(inner) => {
            writer.write_le::<u8>(ELEMENT_TYPE::BYREF);
            return encode_type(writer, inner);
        }
        TypeSig::Ptr(inner) => {
            writer.write_le::<u8>(ELEMENT_TYPE::PTR);
            return encode_type(writer, inner);
        }
        TypeSig::SzArray(inner) => {
            writer.write_le::<u8>(ELEMENT_TYPE::SZARRAY);
            return encode_type(writer, inner);
        }
    };
    writer.write_le::<u8>(element);
    Ok(())
}

/// Parser for signature blobs.
///
/// # Example
///
/// ```rust
/// use dotweave::metadata::signatures::{SignatureParser, TypeSig};
/// let data = &[0x20, 0x01, 0x01, 0x0E];
/// let mut parser = SignatureParser::new(data);
/// let sig = parser.parse_method_signature().unwrap();
/// assert!(sig.has_this);
/// assert_eq!(sig.params, vec![TypeSig::String]);
/// ```
pub struct SignatureParser<'a> {
    parser: Parser<'a>,
    depth: usize,
}

impl<'a> SignatureParser<'a> {
    /// Create a parser over a signature blob.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        SignatureParser {
            parser: Parser::new(data),
            depth: 0,
        }
    }

    fn parse_type(&mut self) -> Result<TypeSig> {
        self.depth += 1;
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(RecursionLimit(MAX_RECURSION_DEPTH));
        }

        let current_byte = self.parser.read_le::<u8>()?;
        let signature = match current_byte {
            ELEMENT_TYPE::VOID => TypeSig::Void,
            ELEMENT_TYPE::BOOLEAN => TypeSig::Boolean,
            ELEMENT_TYPE::CHAR => TypeSig::Char,
            ELEMENT_TYPE::I1 => TypeSig::I1,
            ELEMENT_TYPE::U1 => TypeSig::U1,
            ELEMENT_TYPE::I2 => TypeSig::I2,
            ELEMENT_TYPE::U2 => TypeSig::U2,
            ELEMENT_TYPE::I4 => TypeSig::I4,
            ELEMENT_TYPE::U4 => TypeSig::U4,
            ELEMENT_TYPE::I8 => TypeSig::I8,
            ELEMENT_TYPE::U8 => TypeSig::U8,
            ELEMENT_TYPE::R4 => TypeSig::R4,
            ELEMENT_TYPE::R8 => TypeSig::R8,
            ELEMENT_TYPE::STRING => TypeSig::String,
            ELEMENT_TYPE::OBJECT => TypeSig::Object,
            ELEMENT_TYPE::I => TypeSig::I,
            ELEMENT_TYPE::U => TypeSig::U,
            ELEMENT_TYPE::PTR => TypeSig::Ptr(Box::new(self.parse_type()?)),
            ELEMENT_TYPE::BYREF => TypeSig::ByRef(Box::new(self.parse_type()?)),
            ELEMENT_TYPE::SZARRAY => TypeSig::SzArray(Box::new(self.parse_type()?)),
            ELEMENT_TYPE::CLASS => {
                TypeSig::Class(decode_type_handle(self.parser.read_compressed_uint()?)?)
            }
            ELEMENT_TYPE::VALUETYPE => {
                TypeSig::ValueType(decode_type_handle(self.parser.read_compressed_uint()?)?)
            }
            ELEMENT_TYPE::VAR => TypeSig::Var(self.parser.read_compressed_uint()?),
            ELEMENT_TYPE::MVAR => TypeSig::MVar(self.parser.read_compressed_uint()?),
            ELEMENT_TYPE::GENERICINST => {
                let kind = self.parser.read_le::<u8>()?;
                if kind != ELEMENT_TYPE::CLASS && kind != ELEMENT_TYPE::VALUETYPE {
                    return Err(malformed_error!(
                        "GENERICINST - next byte is not CLASS or VALUETYPE - {}",
                        kind
                    ));
                }
                let base = decode_type_handle(self.parser.read_compressed_uint()?)?;
                let arg_count = self.parser.read_compressed_uint()?;
                let mut args = Vec::with_capacity(arg_count.min(16) as usize);
                for _ in 0..arg_count {
                    args.push(self.parse_type()?);
                }
                TypeSig::GenericInst {
                    base,
                    value_type: kind == ELEMENT_TYPE::VALUETYPE,
                    args,
                }
            }
            _ => {
                return Err(malformed_error!(
                    "Unsupported ELEMENT_TYPE - {}",
                    current_byte
                ))
            }
        };

        self.depth -= 1;
        Ok(signature)
    }

    /// Parse a method signature blob.
    ///
    /// # Errors
    /// Returns an error if the blob is truncated or uses unsupported element types.
    pub fn parse_method_signature(&mut self) -> Result<MethodSig> {
        let conv = self.parser.read_le::<u8>()?;
        let generic_param_count = if conv & CALLING_CONVENTION::GENERIC != 0 {
            self.parser.read_compressed_uint()?
        } else {
            0
        };
        let param_count = self.parser.read_compressed_uint()?;
        let ret = self.parse_type()?;
        let mut params = Vec::with_capacity(param_count.min(64) as usize);
        for _ in 0..param_count {
            params.push(self.parse_type()?);
        }
        Ok(MethodSig {
            has_this: conv & CALLING_CONVENTION::HASTHIS != 0,
            explicit_this: conv & CALLING_CONVENTION::EXPLICITTHIS != 0,
            generic_param_count,
            ret,
            params,
        })
    }

    /// Parse a field signature blob.
    ///
    /// # Errors
    /// Returns an error if the prolog is not `FIELD` or the type is malformed.
    pub fn parse_field_signature(&mut self) -> Result<TypeSig> {
        let head = self.parser.read_le::<u8>()?;
        if head != CALLING_CONVENTION::FIELD {
            return Err(malformed_error!(
                "SignatureField - invalid start - {}",
                head
            ));
        }
        self.parse_type()
    }

    /// Parse a local variable signature blob.
    ///
    /// # Errors
    /// Returns an error if the prolog is not `LOCAL_SIG` or a type is malformed.
    pub fn parse_local_var_signature(&mut self) -> Result<Vec<TypeSig>> {
        let head = self.parser.read_le::<u8>()?;
        if head != CALLING_CONVENTION::LOCAL_SIG {
            return Err(malformed_error!(
                "SignatureLocalVar - invalid start - {}",
                head
            ));
        }
        let local_count = self.parser.read_compressed_uint()?;
        let mut locals = Vec::with_capacity(local_count.min(256) as usize);
        for _ in 0..local_count {
            locals.push(self.parse_type()?);
        }
        Ok(locals)
    }

    /// Parse a type specification blob.
    ///
    /// # Errors
    /// Returns an error if the type is malformed.
    pub fn parse_type_spec_signature(&mut self) -> Result<TypeSig> {
        self.parse_type()
    }

    /// Peek whether the blob is a field signature.
    #[must_use]
    pub fn is_field_signature(data: &[u8]) -> bool {
        data.first() == Some(&CALLING_CONVENTION::FIELD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generic_method_with_byref() {
        // instance generic<1> void (int32&, !!0)
        let data = &[0x30, 0x01, 0x02, 0x01, 0x10, 0x08, 0x1E, 0x00];
        let sig = SignatureParser::new(data).parse_method_signature().unwrap();
        assert!(sig.has_this);
        assert_eq!(sig.generic_param_count, 1);
        assert_eq!(sig.ret, TypeSig::Void);
        assert_eq!(sig.params, vec![TypeSig::I4.by_ref(), TypeSig::MVar(0)]);
        assert_eq!(sig.encode().unwrap(), data);
    }

    #[test]
    fn test_generic_instance_with_handles() {
        let sig = TypeSig::GenericInst {
            base: TypeHandle::Ref(2),
            value_type: false,
            args: vec![TypeSig::String, TypeSig::Class(TypeHandle::Def(4))],
        };
        let blob = encode_type_spec(&sig).unwrap();
        // TypeRef row 3 => (3 << 2) | 1, TypeDef row 5 => 5 << 2
        assert_eq!(blob, vec![0x15, 0x12, 0x0D, 0x02, 0x0E, 0x12, 0x14]);
        let parsed = SignatureParser::new(&blob).parse_type_spec_signature().unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn test_field_and_locals() {
        let field = encode_field_sig(&TypeSig::SzArray(Box::new(TypeSig::U1))).unwrap();
        assert_eq!(field, vec![0x06, 0x1D, 0x05]);
        assert!(SignatureParser::is_field_signature(&field));

        let locals = encode_locals_sig(&[TypeSig::I4, TypeSig::Object]).unwrap();
        assert_eq!(locals, vec![0x07, 0x02, 0x08, 0x1C]);
        assert_eq!(
            SignatureParser::new(&locals).parse_local_var_signature().unwrap(),
            vec![TypeSig::I4, TypeSig::Object]
        );
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(SignatureParser::new(&[0x07, 0x01, 0x08])
            .parse_field_signature()
            .is_err());
        assert!(SignatureParser::new(&[0x00, 0x01, 0x01, 0x17])
            .parse_method_signature()
            .is_err());
        assert!(decode_type_handle(0x01).is_err());
        assert!(decode_type_handle(0x07).is_err());
    }

    #[test]
    fn test_primitive_names() {
        assert_eq!(TypeSig::I4.primitive_name(), Some(("System", "Int32")));
        assert_eq!(TypeSig::from_primitive_name("System", "String"), Some(TypeSig::String));
        assert_eq!(TypeSig::from_primitive_name("Demo", "Int32"), None);
        assert_eq!(TypeSig::Var(0).primitive_name(), None);
    }
}
