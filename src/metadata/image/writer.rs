//! Serialisation of a [`ModuleDef`] into a module image.

use std::collections::{BTreeMap, HashMap};

use sha1::{Digest, Sha1};

use crate::{
    assembly::TokenSink,
    file::{
        pe::{stamp_checksum, PeBuilder, BODIES_RVA},
        writer::Writer,
    },
    metadata::{
        body::encode_body,
        image::{
            heaps::{BlobHeapBuilder, GuidHeapBuilder, StringHeapBuilder, UserStringHeapBuilder},
            MethodOffsets, METADATA_MAGIC, STREAM_BLOB, STREAM_GUID, STREAM_STRINGS,
            STREAM_TABLES, STREAM_US, VERSION_STRING,
        },
        model::{
            AttributeArg, CustomAttribute, FieldHandle, FieldId, MemberSig, MethodHandle, MethodId,
            ModuleDef, ResolutionScope, TypeHandle,
        },
        signatures::{encode_field_sig, encode_locals_sig, encode_type_spec},
        tables::{CodedIndexType, TableId, TableLayout, USER_STRING_TABLE},
        token::Token,
    },
    Result,
};

/// Output of [`write_image`].
#[derive(Debug, Clone)]
pub struct WrittenImage {
    /// The PE file bytes
    pub bytes: Vec<u8>,
    /// The module version id stamped into the image
    pub mvid: uguid::Guid,
    /// Instruction offsets of every written body
    pub method_offsets: MethodOffsets,
}

/// Serialise `module`.
///
/// Rows are numbered by position in the model; the stored tokens of the model are not
/// consulted. Method bodies are laid out from [`BODIES_RVA`] in the `.text` section. The MVID
/// is derived from the content and the PE timestamp is zero, so writing the same model twice
/// yields identical bytes.
///
/// # Errors
/// Returns an error if a handle in the model is dangling or a body cannot be encoded.
pub fn write_image(module: &ModuleDef) -> Result<WrittenImage> {
    let mut state = ImageWriter::new(module);
    let tables = state.build_tables()?;
    state.assemble(tables)
}

struct ImageWriter<'m> {
    module: &'m ModuleDef,
    strings: StringHeapBuilder,
    blobs: BlobHeapBuilder,
    user_strings: UserStringHeapBuilder,
    il: Writer,
    method_rows: HashMap<MethodId, u32>,
    field_rows: HashMap<FieldId, u32>,
    standalone_sigs: Vec<u32>,
    standalone_index: HashMap<u32, u32>,
    method_offsets: MethodOffsets,
}

type Rows = BTreeMap<TableId, Vec<Vec<u32>>>;

impl<'m> ImageWriter<'m> {
    fn new(module: &'m ModuleDef) -> Self {
        let mut method_rows = HashMap::new();
        let mut field_rows = HashMap::new();
        for (ty, def) in module.types.iter().enumerate() {
            for index in 0..def.methods.len() {
                let row = method_rows.len() as u32 + 1;
                method_rows.insert(MethodId { ty, index }, row);
            }
            for index in 0..def.fields.len() {
                let row = field_rows.len() as u32 + 1;
                field_rows.insert(FieldId { ty, index }, row);
            }
        }

        ImageWriter {
            module,
            strings: StringHeapBuilder::default(),
            blobs: BlobHeapBuilder::default(),
            user_strings: UserStringHeapBuilder::default(),
            il: Writer::new(),
            method_rows,
            field_rows,
            standalone_sigs: Vec::new(),
            standalone_index: HashMap::new(),
            method_offsets: MethodOffsets::new(),
        }
    }

    fn method_row(&self, id: MethodId) -> Result<u32> {
        self.method_rows
            .get(&id)
            .copied()
            .ok_or_else(|| malformed_error!("Dangling method {:?}", id))
    }

    fn locals_token(&mut self, blob: &[u8]) -> Result<Token> {
        let index = self.blobs.add(blob)?;
        if let Some(row) = self.standalone_index.get(&index) {
            return Ok(TableId::StandAloneSig.token(*row));
        }
        self.standalone_sigs.push(index);
        let row = self.standalone_sigs.len() as u32;
        self.standalone_index.insert(index, row);
        Ok(TableId::StandAloneSig.token(row))
    }

    fn build_tables(&mut self) -> Result<Rows> {
        let module = self.module;
        let mut rows = Rows::new();

        rows.insert(
            TableId::Module,
            vec![vec![0, self.strings.add(&format!("{}.dll", module.name))?, 1, 0, 0]],
        );

        let mut type_refs = Vec::with_capacity(module.type_refs.len());
        for type_ref in &module.type_refs {
            let scope = match type_ref.scope {
                ResolutionScope::Module => TableId::Module.token(1),
                ResolutionScope::AssemblyRef(i) => TableId::AssemblyRef.token(row(i)?),
                ResolutionScope::TypeRef(i) => TableId::TypeRef.token(row(i)?),
            };
            type_refs.push(vec![
                CodedIndexType::ResolutionScope.encode(scope)?,
                self.strings.add(&type_ref.name)?,
                self.strings.add(&type_ref.namespace)?,
            ]);
        }
        rows.insert(TableId::TypeRef, type_refs);

        let mut type_defs = Vec::with_capacity(module.types.len());
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut params = Vec::new();
        for ty in &module.types {
            let extends = match ty.extends {
                Some(handle) => CodedIndexType::TypeDefOrRef.encode(type_token(module, handle)?)?,
                None => 0,
            };
            type_defs.push(vec![
                ty.flags.bits(),
                self.strings.add(&ty.name)?,
                self.strings.add(&ty.namespace)?,
                extends,
                fields.len() as u32 + 1,
                methods.len() as u32 + 1,
            ]);

            for field in &ty.fields {
                fields.push(vec![
                    u32::from(field.flags.bits()),
                    self.strings.add(&field.name)?,
                    self.blobs.add(&encode_field_sig(&field.signature)?)?,
                ]);
            }

            for method in &ty.methods {
                let token = TableId::MethodDef.token(methods.len() as u32 + 1);
                let rva = match &method.body {
                    Some(body) => {
                        let locals = if body.locals.is_empty() {
                            Token::default()
                        } else {
                            let blob = encode_locals_sig(&body.locals)?;
                            self.locals_token(&blob)?
                        };
                        let encoded = encode_body(body, locals, self)?;
                        self.il.align(4);
                        let rva = u32::try_from(self.il.pos())
                            .ok()
                            .and_then(|pos| BODIES_RVA.checked_add(pos))
                            .ok_or_else(|| malformed_error!("Method bodies exceed the address space"))?;
                        self.il.write_bytes(&encoded.bytes);
                        self.method_offsets.insert(token, encoded.offsets);
                        rva
                    }
                    None => 0,
                };

                let param_list = params.len() as u32 + 1;
                let mut ordered: Vec<_> = method.params.iter().collect();
                ordered.sort_by_key(|p| p.sequence);
                for param in ordered {
                    params.push(vec![
                        u32::from(param.flags.bits()),
                        u32::from(param.sequence),
                        self.strings.add(&param.name)?,
                    ]);
                }

                methods.push(vec![
                    rva,
                    u32::from(method.impl_flags.bits()),
                    u32::from(method.flags.bits()),
                    self.strings.add(&method.name)?,
                    self.blobs.add(&method.signature.encode()?)?,
                    param_list,
                ]);
            }
        }
        rows.insert(TableId::TypeDef, type_defs);
        rows.insert(TableId::Field, fields);
        rows.insert(TableId::MethodDef, methods);
        rows.insert(TableId::Param, params);

        let mut member_refs = Vec::with_capacity(module.member_refs.len());
        for member in &module.member_refs {
            let signature = match &member.signature {
                MemberSig::Method(sig) => sig.encode()?,
                MemberSig::Field(sig) => encode_field_sig(sig)?,
            };
            member_refs.push(vec![
                CodedIndexType::MemberRefParent.encode(type_token(module, member.parent)?)?,
                self.strings.add(&member.name)?,
                self.blobs.add(&signature)?,
            ]);
        }
        rows.insert(TableId::MemberRef, member_refs);

        let mut attributes = Vec::new();
        for (ty_index, ty) in module.types.iter().enumerate() {
            let owner = TableId::TypeDef.token(row(ty_index)?);
            self.push_attributes(&mut attributes, owner, &ty.custom_attributes)?;
            for (index, field) in ty.fields.iter().enumerate() {
                let field_row = self.field_rows[&FieldId { ty: ty_index, index }];
                let owner = TableId::Field.token(field_row);
                self.push_attributes(&mut attributes, owner, &field.custom_attributes)?;
            }
            for (index, method) in ty.methods.iter().enumerate() {
                let method_row = self.method_row(MethodId { ty: ty_index, index })?;
                let owner = TableId::MethodDef.token(method_row);
                self.push_attributes(&mut attributes, owner, &method.custom_attributes)?;
            }
        }
        attributes.sort_by_key(|r| r[0]);
        rows.insert(TableId::CustomAttribute, attributes);

        let standalone = self.standalone_sigs.iter().map(|b| vec![*b]).collect();
        rows.insert(TableId::StandAloneSig, standalone);

        let mut type_specs = Vec::with_capacity(module.type_specs.len());
        for spec in &module.type_specs {
            type_specs.push(vec![self.blobs.add(&encode_type_spec(spec)?)?]);
        }
        rows.insert(TableId::TypeSpec, type_specs);

        let version = module.version;
        rows.insert(
            TableId::Assembly,
            vec![vec![
                0x8004,
                u32::from(version.major),
                u32::from(version.minor),
                u32::from(version.build),
                u32::from(version.revision),
                0,
                0,
                self.strings.add(&module.name)?,
                0,
            ]],
        );

        let mut assembly_refs = Vec::with_capacity(module.assembly_refs.len());
        for assembly in &module.assembly_refs {
            assembly_refs.push(vec![
                u32::from(assembly.version.major),
                u32::from(assembly.version.minor),
                u32::from(assembly.version.build),
                u32::from(assembly.version.revision),
                0,
                0,
                self.strings.add(&assembly.name)?,
                0,
                0,
            ]);
        }
        rows.insert(TableId::AssemblyRef, assembly_refs);

        let mut nested = Vec::new();
        for (index, ty) in module.types.iter().enumerate() {
            if let Some(enclosing) = ty.enclosing {
                nested.push(vec![row(index)?, row(enclosing)?]);
            }
        }
        nested.sort_by_key(|r| r[0]);
        rows.insert(TableId::NestedClass, nested);

        let mut generic_params = Vec::new();
        for (ty_index, ty) in module.types.iter().enumerate() {
            let owner = CodedIndexType::TypeOrMethodDef.encode(TableId::TypeDef.token(row(ty_index)?))?;
            for (number, param) in ty.generic_params.iter().enumerate() {
                generic_params.push(vec![
                    number as u32,
                    u32::from(param.flags),
                    owner,
                    self.strings.add(&param.name)?,
                ]);
            }
            for (index, method) in ty.methods.iter().enumerate() {
                let method_row = self.method_row(MethodId { ty: ty_index, index })?;
                let owner = CodedIndexType::TypeOrMethodDef.encode(TableId::MethodDef.token(method_row))?;
                for (number, param) in method.generic_params.iter().enumerate() {
                    generic_params.push(vec![
                        number as u32,
                        u32::from(param.flags),
                        owner,
                        self.strings.add(&param.name)?,
                    ]);
                }
            }
        }
        generic_params.sort_by_key(|r| (r[2], r[0]));
        rows.insert(TableId::GenericParam, generic_params);

        Ok(rows)
    }

    fn push_attributes(
        &mut self,
        rows: &mut Vec<Vec<u32>>,
        owner: Token,
        attributes: &[CustomAttribute],
    ) -> Result<()> {
        for attribute in attributes {
            let ctor = self.method_token(attribute.ctor)?;
            let value = encode_attribute_value(&attribute.args)?;
            rows.push(vec![
                CodedIndexType::HasCustomAttribute.encode(owner)?,
                CodedIndexType::CustomAttributeType.encode(ctor)?,
                self.blobs.add(&value)?,
            ]);
        }
        Ok(())
    }

    fn assemble(self, rows: Rows) -> Result<WrittenImage> {
        // The MVID is stamped after hashing the image with a nil MVID.
        let mut guids = GuidHeapBuilder::default();
        guids.add(&uguid::Guid::ZERO)?;

        let strings = self.strings.into_inner();
        let blobs = self.blobs.into_inner();
        let guids = guids.into_inner();
        let heap_sizes = TableLayout::heap_sizes_for(strings.len(), guids.len(), blobs.len());
        let tables = encode_tables(&rows, heap_sizes)?;

        let streams: Vec<(&str, Vec<u8>)> = vec![
            (STREAM_TABLES, tables),
            (STREAM_STRINGS, strings),
            (STREAM_US, self.user_strings.into_inner()),
            (STREAM_GUID, guids),
            (STREAM_BLOB, blobs),
        ];

        let mut root = Writer::new();
        root.write_le::<u32>(METADATA_MAGIC);
        root.write_le::<u16>(1);
        root.write_le::<u16>(1);
        root.write_le::<u32>(0);
        let version_len = (VERSION_STRING.len() + 1 + 3) & !3;
        root.write_le::<u32>(version_len as u32);
        let mut version = VERSION_STRING.as_bytes().to_vec();
        version.resize(version_len, 0);
        root.write_bytes(&version);
        root.write_le::<u16>(0);
        root.write_le::<u16>(streams.len() as u16);

        let headers_size: usize = streams
            .iter()
            .map(|(name, _)| 8 + ((name.len() + 1 + 3) & !3))
            .sum();
        let mut offset = root.pos() + headers_size;
        let mut guid_offset = 0;
        for (name, data) in &streams {
            root.write_le::<u32>(offset as u32);
            root.write_le::<u32>(((data.len() + 3) & !3) as u32);
            root.write_string_utf8(name);
            root.align(4);
            if *name == STREAM_GUID {
                guid_offset = offset;
            }
            offset += (data.len() + 3) & !3;
        }
        for (_, data) in &streams {
            root.write_bytes(data);
            root.align(4);
        }

        let image = PeBuilder::new(self.il.into_inner(), root.into_inner()).build()?;
        let mut bytes = image.bytes;
        let mvid_at = image.metadata_offset + guid_offset;

        let mvid_digest = Sha1::digest(&bytes);
        let mut mvid_bytes = [0u8; 16];
        mvid_bytes.copy_from_slice(&mvid_digest[..16]);
        bytes
            .get_mut(mvid_at..mvid_at + 16)
            .ok_or_else(|| malformed_error!("GUID heap lies outside the image"))?
            .copy_from_slice(&mvid_bytes);
        stamp_checksum(&mut bytes)?;

        Ok(WrittenImage {
            bytes,
            mvid: uguid::Guid::from_bytes(mvid_bytes),
            method_offsets: self.method_offsets,
        })
    }
}

impl TokenSink for ImageWriter<'_> {
    fn method_token(&mut self, handle: MethodHandle) -> Result<Token> {
        match handle {
            MethodHandle::Def(id) => Ok(TableId::MethodDef.token(self.method_row(id)?)),
            MethodHandle::Ref(index) if index < self.module.member_refs.len() => {
                Ok(TableId::MemberRef.token(row(index)?))
            }
            MethodHandle::Ref(index) => Err(malformed_error!("Dangling MemberRef #{}", index)),
        }
    }

    fn field_token(&mut self, handle: FieldHandle) -> Result<Token> {
        match handle {
            FieldHandle::Def(id) => self
                .field_rows
                .get(&id)
                .map(|row| TableId::Field.token(*row))
                .ok_or_else(|| malformed_error!("Dangling field {:?}", id)),
            FieldHandle::Ref(index) if index < self.module.member_refs.len() => {
                Ok(TableId::MemberRef.token(row(index)?))
            }
            FieldHandle::Ref(index) => Err(malformed_error!("Dangling MemberRef #{}", index)),
        }
    }

    fn type_token(&mut self, handle: TypeHandle) -> Result<Token> {
        type_token(self.module, handle)
    }

    fn string_token(&mut self, value: &str) -> Result<Token> {
        let offset = self.user_strings.add(value)?;
        Ok(Token::from_parts(USER_STRING_TABLE, offset))
    }
}

fn row(index: usize) -> Result<u32> {
    u32::try_from(index + 1)
        .ok()
        .filter(|r| *r <= 0x00FF_FFFF)
        .ok_or_else(|| malformed_error!("Row {} out of range", index + 1))
}

fn type_token(module: &ModuleDef, handle: TypeHandle) -> Result<Token> {
    let (table, index, len) = match handle {
        TypeHandle::Def(i) => (TableId::TypeDef, i, module.types.len()),
        TypeHandle::Ref(i) => (TableId::TypeRef, i, module.type_refs.len()),
        TypeHandle::Spec(i) => (TableId::TypeSpec, i, module.type_specs.len()),
    };
    if index >= len {
        return Err(malformed_error!("Dangling type handle {:?}", handle));
    }
    Ok(table.token(row(index)?))
}

fn encode_tables(rows: &Rows, heap_sizes: u8) -> Result<Vec<u8>> {
    let count = |table: TableId| rows.get(&table).map_or(0, |r| r.len() as u32);
    let layout = TableLayout::new(heap_sizes, count);

    let mut writer = Writer::new();
    writer.write_le::<u32>(0);
    writer.write_le::<u8>(2);
    writer.write_le::<u8>(0);
    writer.write_le::<u8>(layout.heap_sizes());
    writer.write_le::<u8>(1);

    let present: Vec<(&TableId, &Vec<Vec<u32>>)> = rows.iter().filter(|(_, r)| !r.is_empty()).collect();
    let valid = present.iter().fold(0u64, |mask, (t, _)| mask | t.mask_bit());
    let sorted = present
        .iter()
        .filter(|(t, _)| t.is_sorted())
        .fold(0u64, |mask, (t, _)| mask | t.mask_bit());
    writer.write_le::<u64>(valid);
    writer.write_le::<u64>(sorted);
    for (_, table_rows) in &present {
        writer.write_le::<u32>(
            u32::try_from(table_rows.len()).map_err(|_| malformed_error!("Too many rows"))?,
        );
    }

    for (table, table_rows) in &present {
        let columns = table.columns();
        for values in *table_rows {
            if values.len() != columns.len() {
                return Err(malformed_error!("Row of {:?} has {} columns", table, values.len()));
            }
            for (value, column) in values.iter().zip(columns) {
                match layout.width(*column) {
                    2 => writer.write_le::<u16>(
                        u16::try_from(*value)
                            .map_err(|_| malformed_error!("Value {} overflows a {:?} column", value, table))?,
                    ),
                    _ => writer.write_le::<u32>(*value),
                }
            }
        }
    }
    writer.align(4);
    Ok(writer.into_inner())
}

/// Encode the fixed arguments of a custom attribute (ECMA-335 II.23.3).
///
/// # Errors
/// Returns an error if a string does not fit the compressed length encoding.
pub fn encode_attribute_value(args: &[AttributeArg]) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    writer.write_le::<u16>(0x0001);
    for arg in args {
        match arg {
            AttributeArg::Bool(value) => writer.write_le::<u8>(u8::from(*value)),
            AttributeArg::I4(value) => writer.write_le::<i32>(*value),
            AttributeArg::String(None) => writer.write_le::<u8>(0xFF),
            AttributeArg::String(Some(value)) => writer.write_compressed_string_utf8(value)?,
        }
    }
    writer.write_le::<u16>(0);
    Ok(writer.into_inner())
}
