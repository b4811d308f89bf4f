//! Reconstruction of a [`ModuleDef`] from a module image.

use std::collections::HashMap;

use strum::IntoEnumIterator;

use crate::{
    assembly::TokenSource,
    file::{parser::Parser, pe::CliImage},
    metadata::{
        body::{decode_body, BodySource},
        flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, ParamAttributes, TypeAttributes},
        image::{
            heaps::{Blob, Guids, Strings, UserStrings},
            root::Root,
            MethodOffsets, STREAM_BLOB, STREAM_GUID, STREAM_STRINGS, STREAM_TABLES, STREAM_US,
        },
        model::{
            AssemblyRef, AttributeArg, CustomAttribute, FieldDef, FieldHandle, FieldId, GenericParam,
            MemberRef, MemberSig, MethodDef, MethodHandle, MethodId, ModuleDef, ParamDef,
            ResolutionScope, TypeDef, TypeHandle, TypeRef, Version,
        },
        signatures::{SignatureParser, TypeSig},
        tables::{CodedIndexType, TableId, TableLayout, USER_STRING_TABLE},
        token::Token,
    },
    Error::OutOfBounds,
    Result,
};

/// Output of [`read_image`].
#[derive(Debug, Clone)]
pub struct ReadImage {
    /// The reconstructed module
    pub module: ModuleDef,
    /// Instruction offsets of every body, keyed by method token
    pub method_offsets: MethodOffsets,
}

/// Parse a module image: a PE file whose CLR header points at the metadata root.
///
/// # Errors
/// Returns [`crate::Error::GoblinErr`] if the PE headers do not parse,
/// [`crate::Error::NotSupported`] for metadata tables outside the supported set, and
/// [`crate::Error::Malformed`] if the checksum does not match, a stream is missing, or any row,
/// heap entry, signature or body is inconsistent.
pub fn read_image(data: &[u8]) -> Result<ReadImage> {
    let image = CliImage::parse(data)?;
    let metadata = image.metadata();

    let root = Root::read(metadata)?;
    let heaps = Heaps {
        strings: Strings::from(root.stream(metadata, STREAM_STRINGS)?)?,
        blobs: Blob::from(root.stream(metadata, STREAM_BLOB)?)?,
        user_strings: UserStrings::from(root.stream(metadata, STREAM_US)?)?,
        guids: Guids::from(root.stream(metadata, STREAM_GUID)?),
    };
    let rows = read_tables(root.stream(metadata, STREAM_TABLES)?)?;

    ModuleReader { heaps, rows, image }.read()
}

struct Heaps<'a> {
    strings: Strings<'a>,
    blobs: Blob<'a>,
    user_strings: UserStrings<'a>,
    guids: Guids<'a>,
}

type RawRows = HashMap<TableId, Vec<Vec<u32>>>;

/// `HeapSizes` bit announcing an extra 4 bytes after the row counts.
const HEAP_EXTRA_DATA: u8 = 0x40;

fn read_tables(data: &[u8]) -> Result<RawRows> {
    let mut parser = Parser::new(data);
    parser.advance_by(4)?;
    let major = parser.read_le::<u8>()?;
    let _minor = parser.read_le::<u8>()?;
    if major != 2 {
        return Err(malformed_error!("Unsupported tables stream version {}", major));
    }
    let heap_sizes = parser.read_le::<u8>()?;
    parser.advance()?;

    let valid = parser.read_le::<u64>()?;
    let _sorted = parser.read_le::<u64>()?;
    let known = TableId::iter().fold(0u64, |mask, t| mask | t.mask_bit());
    if valid & !known != 0 {
        return Err(crate::Error::NotSupported(format!(
            "metadata tables {:#x}",
            valid & !known
        )));
    }

    let present: Vec<TableId> = TableId::iter().filter(|t| valid & t.mask_bit() != 0).collect();
    let mut counts = HashMap::with_capacity(present.len());
    for table in &present {
        counts.insert(*table, parser.read_le::<u32>()?);
    }
    if heap_sizes & HEAP_EXTRA_DATA != 0 {
        parser.advance_by(4)?;
    }
    let layout = TableLayout::new(heap_sizes, |t| counts.get(&t).copied().unwrap_or(0));

    let mut rows = RawRows::new();
    for table in present {
        let count = counts.get(&table).copied().unwrap_or(0) as usize;
        if count.saturating_mul(layout.row_size(table)) > parser.remaining() {
            return Err(OutOfBounds);
        }
        let mut table_rows = Vec::with_capacity(count);
        for _ in 0..count {
            let mut values = Vec::with_capacity(table.columns().len());
            for column in table.columns() {
                values.push(match layout.width(*column) {
                    2 => u32::from(parser.read_le::<u16>()?),
                    _ => parser.read_le::<u32>()?,
                });
            }
            table_rows.push(values);
        }
        rows.insert(table, table_rows);
    }
    Ok(rows)
}

struct ModuleReader<'a> {
    heaps: Heaps<'a>,
    rows: RawRows,
    image: CliImage<'a>,
}

impl<'a> ModuleReader<'a> {
    fn table(&self, table: TableId) -> &[Vec<u32>] {
        self.rows.get(&table).map_or(&[][..], Vec::as_slice)
    }

    fn string(&self, index: u32) -> Result<String> {
        Ok(self.heaps.strings.get(index)?.to_string())
    }

    fn read(self) -> Result<ReadImage> {
        let assembly = self
            .table(TableId::Assembly)
            .first()
            .ok_or_else(|| malformed_error!("Image has no Assembly row"))?;
        let module_row = self
            .table(TableId::Module)
            .first()
            .ok_or_else(|| malformed_error!("Image has no Module row"))?;

        let mut module = ModuleDef {
            name: self.string(assembly[7])?,
            version: Version::new(
                assembly[1] as u16,
                assembly[2] as u16,
                assembly[3] as u16,
                assembly[4] as u16,
            ),
            mvid: self.heaps.guids.get(module_row[2])?,
            assembly_refs: Vec::new(),
            type_refs: Vec::new(),
            type_specs: Vec::new(),
            member_refs: Vec::new(),
            types: Vec::new(),
            has_symbols: false,
        };

        for row in self.table(TableId::AssemblyRef) {
            module.assembly_refs.push(AssemblyRef {
                name: self.string(row[6])?,
                version: Version::new(row[0] as u16, row[1] as u16, row[2] as u16, row[3] as u16),
            });
        }

        for row in self.table(TableId::TypeRef) {
            let scope_token = CodedIndexType::ResolutionScope.decode(row[0])?;
            let scope = match TableId::from_id(scope_token.table()) {
                Some(TableId::Module) => ResolutionScope::Module,
                Some(TableId::AssemblyRef) => ResolutionScope::AssemblyRef(index_of(scope_token)?),
                Some(TableId::TypeRef) => ResolutionScope::TypeRef(index_of(scope_token)?),
                _ => return Err(malformed_error!("Invalid resolution scope {}", scope_token)),
            };
            module.type_refs.push(TypeRef {
                scope,
                name: self.string(row[1])?,
                namespace: self.string(row[2])?,
            });
        }

        for row in self.table(TableId::TypeSpec) {
            let blob = self.heaps.blobs.get(row[0])?;
            module
                .type_specs
                .push(SignatureParser::new(blob).parse_type_spec_signature()?);
        }

        let fields = self.table(TableId::Field);
        let methods = self.table(TableId::MethodDef);
        let params = self.table(TableId::Param);
        let type_rows = self.table(TableId::TypeDef);
        let mut method_ids = Vec::with_capacity(methods.len());
        let mut field_ids = Vec::with_capacity(fields.len());
        let mut rvas = Vec::with_capacity(methods.len());

        for (ty_index, row) in type_rows.iter().enumerate() {
            let extends = match row[3] {
                0 => None,
                value => Some(self.type_handle(CodedIndexType::TypeDefOrRef.decode(value)?)?),
            };
            let mut ty = TypeDef::new(
                &self.string(row[2])?,
                &self.string(row[1])?,
                TypeAttributes::from_bits_retain(row[0]),
                extends,
            );

            let field_range = list_range(type_rows, ty_index, 4, fields.len())?;
            for (index, field_row) in fields[field_range].iter().enumerate() {
                let signature = SignatureParser::new(self.heaps.blobs.get(field_row[2])?)
                    .parse_field_signature()?;
                ty.fields.push(FieldDef::new(
                    &self.string(field_row[1])?,
                    FieldAttributes::from_bits_retain(field_row[0] as u16),
                    signature,
                ));
                field_ids.push(FieldId { ty: ty_index, index });
            }

            let method_range = list_range(type_rows, ty_index, 5, methods.len())?;
            let method_start = method_range.start;
            for (index, method_row) in methods[method_range].iter().enumerate() {
                let signature = SignatureParser::new(self.heaps.blobs.get(method_row[4])?)
                    .parse_method_signature()?;
                let mut method = MethodDef::new(
                    &self.string(method_row[3])?,
                    MethodAttributes::from_bits_retain(method_row[2] as u16),
                    signature,
                );
                method.impl_flags = MethodImplAttributes::from_bits_retain(method_row[1] as u16);

                let param_range = list_range(methods, method_start + index, 5, params.len())?;
                for param_row in &params[param_range] {
                    method.params.push(ParamDef {
                        flags: ParamAttributes::from_bits_retain(param_row[0] as u16),
                        sequence: param_row[1] as u16,
                        name: self.string(param_row[2])?,
                    });
                }

                ty.methods.push(method);
                method_ids.push(MethodId { ty: ty_index, index });
                rvas.push(method_row[0]);
            }
            module.types.push(ty);
        }

        if method_ids.len() != methods.len() || field_ids.len() != fields.len() {
            return Err(malformed_error!("Member lists do not cover their tables"));
        }

        let mut member_is_field = Vec::new();
        for row in self.table(TableId::MemberRef) {
            let parent = self.type_handle(CodedIndexType::MemberRefParent.decode(row[0])?)?;
            let blob = self.heaps.blobs.get(row[2])?;
            let signature = if SignatureParser::is_field_signature(blob) {
                MemberSig::Field(SignatureParser::new(blob).parse_field_signature()?)
            } else {
                MemberSig::Method(SignatureParser::new(blob).parse_method_signature()?)
            };
            member_is_field.push(matches!(signature, MemberSig::Field(_)));
            module.member_refs.push(MemberRef {
                parent,
                name: self.string(row[1])?,
                signature,
            });
        }

        for row in self.table(TableId::NestedClass) {
            let nested = row_index(row[0], module.types.len())?;
            let enclosing = row_index(row[1], module.types.len())?;
            module.types[nested].enclosing = Some(enclosing);
        }

        for row in self.table(TableId::GenericParam) {
            let owner = CodedIndexType::TypeOrMethodDef.decode(row[2])?;
            let param = GenericParam {
                name: self.string(row[3])?,
                flags: row[1] as u16,
            };
            match TableId::from_id(owner.table()) {
                Some(TableId::TypeDef) => {
                    let index = row_index(owner.row(), module.types.len())?;
                    module.types[index].generic_params.push(param);
                }
                _ => {
                    let id = method_ids[row_index(owner.row(), method_ids.len())?];
                    module.method_mut(id)?.generic_params.push(param);
                }
            }
        }

        let source = ReaderTokens {
            heaps: &self.heaps,
            rows: &self.rows,
            method_ids: &method_ids,
            field_ids: &field_ids,
            member_is_field: &member_is_field,
            type_defs: module.types.len(),
            type_refs: module.type_refs.len(),
            type_specs: module.type_specs.len(),
        };

        for row in self.table(TableId::CustomAttribute) {
            let owner = CodedIndexType::HasCustomAttribute.decode(row[0])?;
            let ctor = source.method(CodedIndexType::CustomAttributeType.decode(row[1])?)?;
            let ctor_params = module.method_sig(ctor)?.params.clone();
            let args = decode_attribute_value(self.heaps.blobs.get(row[2])?, &ctor_params)?;
            let attribute = CustomAttribute { ctor, args };
            match TableId::from_id(owner.table()) {
                Some(TableId::TypeDef) => {
                    let index = row_index(owner.row(), module.types.len())?;
                    module.types[index].custom_attributes.push(attribute);
                }
                Some(TableId::MethodDef) => {
                    let id = method_ids[row_index(owner.row(), method_ids.len())?];
                    module.method_mut(id)?.custom_attributes.push(attribute);
                }
                Some(TableId::Field) => {
                    let id = field_ids[row_index(owner.row(), field_ids.len())?];
                    module.types[id.ty].fields[id.index].custom_attributes.push(attribute);
                }
                _ => log::debug!("Dropping custom attribute on unsupported owner {}", owner),
            }
        }

        let mut method_offsets = MethodOffsets::new();
        for (row, (id, rva)) in method_ids.iter().zip(rvas).enumerate() {
            if rva == 0 {
                continue;
            }
            let decoded = decode_body(self.image.at(rva)?, &source)?;
            module.method_mut(*id)?.body = Some(decoded.body);
            method_offsets.insert(TableId::MethodDef.token(row as u32 + 1), decoded.offsets);
        }

        module.assign_tokens();
        Ok(ReadImage {
            module,
            method_offsets,
        })
    }

    fn type_handle(&self, token: Token) -> Result<TypeHandle> {
        let index = index_of(token)?;
        match TableId::from_id(token.table()) {
            Some(TableId::TypeDef) => Ok(TypeHandle::Def(index)),
            Some(TableId::TypeRef) => Ok(TypeHandle::Ref(index)),
            Some(TableId::TypeSpec) => Ok(TypeHandle::Spec(index)),
            _ => Err(malformed_error!("{} is not a type", token)),
        }
    }
}

/// Resolves tokens of the image being read.
struct ReaderTokens<'r, 'a> {
    heaps: &'r Heaps<'a>,
    rows: &'r RawRows,
    method_ids: &'r [MethodId],
    field_ids: &'r [FieldId],
    member_is_field: &'r [bool],
    type_defs: usize,
    type_refs: usize,
    type_specs: usize,
}

impl ReaderTokens<'_, '_> {
    fn member_ref(&self, token: Token, field: bool) -> Result<usize> {
        let index = row_index(token.row(), self.member_is_field.len())
            .map_err(|_| crate::Error::InvalidToken(token))?;
        if self.member_is_field[index] != field {
            return Err(malformed_error!("{} has the wrong member kind", token));
        }
        Ok(index)
    }
}

impl TokenSource for ReaderTokens<'_, '_> {
    fn method(&self, token: Token) -> Result<MethodHandle> {
        match TableId::from_id(token.table()) {
            Some(TableId::MethodDef) => row_index(token.row(), self.method_ids.len())
                .map(|i| MethodHandle::Def(self.method_ids[i]))
                .map_err(|_| crate::Error::InvalidToken(token)),
            Some(TableId::MemberRef) => Ok(MethodHandle::Ref(self.member_ref(token, false)?)),
            _ => Err(crate::Error::InvalidToken(token)),
        }
    }

    fn field(&self, token: Token) -> Result<FieldHandle> {
        match TableId::from_id(token.table()) {
            Some(TableId::Field) => row_index(token.row(), self.field_ids.len())
                .map(|i| FieldHandle::Def(self.field_ids[i]))
                .map_err(|_| crate::Error::InvalidToken(token)),
            Some(TableId::MemberRef) => Ok(FieldHandle::Ref(self.member_ref(token, true)?)),
            _ => Err(crate::Error::InvalidToken(token)),
        }
    }

    fn ty(&self, token: Token) -> Result<TypeHandle> {
        let (handle, len) = match TableId::from_id(token.table()) {
            Some(TableId::TypeDef) => (TypeHandle::Def as fn(usize) -> TypeHandle, self.type_defs),
            Some(TableId::TypeRef) => (TypeHandle::Ref as fn(usize) -> TypeHandle, self.type_refs),
            Some(TableId::TypeSpec) => (TypeHandle::Spec as fn(usize) -> TypeHandle, self.type_specs),
            _ => return Err(crate::Error::InvalidToken(token)),
        };
        row_index(token.row(), len)
            .map(handle)
            .map_err(|_| crate::Error::InvalidToken(token))
    }

    fn string(&self, token: Token) -> Result<String> {
        if token.table() != USER_STRING_TABLE {
            return Err(crate::Error::InvalidToken(token));
        }
        self.heaps.user_strings.get(token.row())
    }
}

impl BodySource for ReaderTokens<'_, '_> {
    fn locals(&self, token: Token) -> Result<Vec<TypeSig>> {
        if token.table() != TableId::StandAloneSig as u8 {
            return Err(crate::Error::InvalidToken(token));
        }
        let sigs = self.rows.get(&TableId::StandAloneSig).map_or(&[][..], Vec::as_slice);
        let index = row_index(token.row(), sigs.len()).map_err(|_| crate::Error::InvalidToken(token))?;
        let blob = self.heaps.blobs.get(sigs[index][0])?;
        SignatureParser::new(blob).parse_local_var_signature()
    }
}

/// Index for a 1-based row bounded by `len`.
fn row_index(row: u32, len: usize) -> Result<usize> {
    let row = row as usize;
    if row == 0 || row > len {
        return Err(malformed_error!("Row {} out of range 1..={}", row, len));
    }
    Ok(row - 1)
}

fn index_of(token: Token) -> Result<usize> {
    if token.row() == 0 {
        return Err(malformed_error!("Null row in {}", token));
    }
    Ok(token.row() as usize - 1)
}

/// Rows owned by `owner_rows[index]` through the list column `column`.
fn list_range(
    owner_rows: &[Vec<u32>],
    index: usize,
    column: usize,
    target_len: usize,
) -> Result<std::ops::Range<usize>> {
    let start = owner_rows[index][column] as usize;
    let end = match owner_rows.get(index + 1) {
        Some(next) => next[column] as usize,
        None => target_len + 1,
    };
    if start == 0 || start > end || end > target_len + 1 {
        return Err(malformed_error!("Invalid member list {}..{}", start, end));
    }
    Ok(start - 1..end - 1)
}

/// Decode the fixed arguments of a custom attribute against the constructor parameters.
///
/// # Errors
/// Returns an error for a missing prolog, truncated data, or parameter types other than
/// `bool`, `int32` and `string`.
pub fn decode_attribute_value(data: &[u8], params: &[TypeSig]) -> Result<Vec<AttributeArg>> {
    let mut parser = Parser::new(data);
    let prolog = parser.read_le::<u16>()?;
    if prolog != 0x0001 {
        return Err(malformed_error!("Invalid custom attribute prolog {:#x}", prolog));
    }

    let mut args = Vec::with_capacity(params.len());
    for param in params {
        args.push(match param {
            TypeSig::Boolean => AttributeArg::Bool(parser.read_le::<u8>()? != 0),
            TypeSig::I4 => AttributeArg::I4(parser.read_le::<i32>()?),
            TypeSig::String => {
                if parser.peek_byte()? == 0xFF {
                    parser.advance()?;
                    AttributeArg::String(None)
                } else {
                    AttributeArg::String(Some(parser.read_compressed_string_utf8()?))
                }
            }
            other => {
                return Err(crate::Error::NotSupported(format!(
                    "custom attribute argument of type {other:?}"
                )))
            }
        });
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::writer::Writer;

    fn tables_stream(valid: u64, counts: &[u32]) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.write_le::<u32>(0);
        writer.write_le::<u8>(2);
        writer.write_le::<u8>(0);
        writer.write_le::<u8>(0);
        writer.write_le::<u8>(1);
        writer.write_le::<u64>(valid);
        writer.write_le::<u64>(0);
        for count in counts {
            writer.write_le::<u32>(*count);
        }
        writer.into_inner()
    }

    #[test]
    fn unsupported_tables_are_named() {
        // Property (0x17)
        let data = tables_stream(TableId::Module.mask_bit() | (1 << 0x17), &[1, 1]);
        match read_tables(&data) {
            Err(crate::Error::NotSupported(message)) => assert!(message.contains("0x800000")),
            other => panic!("expected NotSupported, got {other:?}"),
        }
    }

    #[test]
    fn narrow_rows_are_widened() {
        let mut data = tables_stream(TableId::TypeSpec.mask_bit(), &[2]);
        data.extend_from_slice(&[0x05, 0x00, 0x09, 0x00]);
        let rows = read_tables(&data).unwrap();
        assert_eq!(rows[&TableId::TypeSpec], vec![vec![5], vec![9]]);

        assert!(read_tables(&data[..data.len() - 1]).is_err());
    }
}
