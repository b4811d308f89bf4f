//! The symbol file format carrying method sequence points.
//!
//! A symbol file sits beside its image as `<stem>.pdb` and is bound to it by the image MVID.
//! Sequence points are stored by IL offset, so reading needs the instruction offsets produced
//! by the image reader and writing needs those produced by the image writer.
//!
//! ```text
//! u32 magic "DWDB" | u16 version | u16 reserved | 16 byte mvid
//! compressed document count, compressed UTF-8 document names
//! compressed method count, per method:
//!     u32 token | compressed point count
//!     per point: compressed offset delta | compressed document | start line | start column
//!                | end line | end column (all compressed)
//! ```

use std::path::{Path, PathBuf};

use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::{body::SequencePoint, image::MethodOffsets, model::ModuleDef, token::Token},
    Result,
};

/// `DWDB` in little-endian byte order.
pub const SYMBOLS_MAGIC: u32 = 0x4244_5744;

/// Current symbol format version.
pub const SYMBOLS_VERSION: u16 = 1;

/// Path of the symbol file belonging to `image`.
#[must_use]
pub fn symbol_path(image: &Path) -> PathBuf {
    image.with_extension("pdb")
}

/// Serialise the sequence points of `module`.
///
/// `offsets` must be the instruction offsets of the image written for the same module state.
///
/// # Errors
/// Returns an error if a sequence point names an instruction without an offset.
pub fn write_symbols(module: &ModuleDef, offsets: &MethodOffsets) -> Result<Vec<u8>> {
    let mut documents: Vec<&str> = Vec::new();
    let mut methods = Vec::new();
    for ty in &module.types {
        for method in &ty.methods {
            let Some(body) = &method.body else { continue };
            if body.sequence_points.is_empty() {
                continue;
            }
            for point in &body.sequence_points {
                if !documents.contains(&point.document.as_str()) {
                    documents.push(&point.document);
                }
            }
            methods.push((method.token, &body.sequence_points));
        }
    }

    let mut writer = Writer::new();
    writer.write_le::<u32>(SYMBOLS_MAGIC);
    writer.write_le::<u16>(SYMBOLS_VERSION);
    writer.write_le::<u16>(0);
    writer.write_bytes(&module.mvid.to_bytes());

    writer.write_compressed_uint(documents.len() as u32)?;
    for document in &documents {
        writer.write_compressed_string_utf8(document)?;
    }

    writer.write_compressed_uint(methods.len() as u32)?;
    for (token, points) in methods {
        let method_offsets = offsets
            .get(&token)
            .ok_or_else(|| malformed_error!("No instruction offsets for {}", token))?;
        let mut ordered: Vec<&SequencePoint> = points.iter().collect();
        ordered.sort_by_key(|p| p.index);

        writer.write_le::<u32>(token.value());
        writer.write_compressed_uint(ordered.len() as u32)?;
        let mut previous = 0u32;
        for point in ordered {
            let offset = *method_offsets
                .get(point.index)
                .ok_or_else(|| malformed_error!("Sequence point past the end of {}", token))?;
            let document = documents
                .iter()
                .position(|d| *d == point.document)
                .unwrap_or_default();
            writer.write_compressed_uint(offset - previous)?;
            writer.write_compressed_uint(document as u32)?;
            writer.write_compressed_uint(point.start_line)?;
            writer.write_compressed_uint(point.start_column)?;
            writer.write_compressed_uint(point.end_line)?;
            writer.write_compressed_uint(point.end_column)?;
            previous = offset;
        }
    }
    Ok(writer.into_inner())
}

/// Attach the sequence points in `data` to the bodies of `module`.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the file belongs to another image, names unknown
/// methods, or places a point between instructions.
pub fn read_symbols(data: &[u8], module: &mut ModuleDef, offsets: &MethodOffsets) -> Result<()> {
    let mut parser = Parser::new(data);
    if parser.read_le::<u32>()? != SYMBOLS_MAGIC {
        return Err(malformed_error!("Not a symbol file"));
    }
    let version = parser.read_le::<u16>()?;
    if version != SYMBOLS_VERSION {
        return Err(malformed_error!("Unsupported symbol file version {}", version));
    }
    parser.advance_by(2)?;
    let mut mvid = [0u8; 16];
    mvid.copy_from_slice(parser.read_bytes(16)?);
    if uguid::Guid::from_bytes(mvid) != module.mvid {
        return Err(malformed_error!("Symbol file does not match the image MVID"));
    }

    let document_count = parser.read_compressed_uint()?;
    let mut documents = Vec::with_capacity(document_count.min(1024) as usize);
    for _ in 0..document_count {
        documents.push(parser.read_compressed_string_utf8()?);
    }

    let method_count = parser.read_compressed_uint()?;
    for _ in 0..method_count {
        let token = Token::new(parser.read_le::<u32>()?);
        let id = module
            .method_by_token(token)
            .ok_or(crate::Error::InvalidToken(token))?;
        let method_offsets = offsets
            .get(&token)
            .ok_or_else(|| malformed_error!("{} has no body", token))?;

        let count = parser.read_compressed_uint()?;
        let mut points = Vec::with_capacity(count.min(4096) as usize);
        let mut offset = 0u32;
        for _ in 0..count {
            offset += parser.read_compressed_uint()?;
            let document = parser.read_compressed_uint()? as usize;
            let index = method_offsets
                .binary_search(&offset)
                .map_err(|_| malformed_error!("Sequence point at {:#x} splits an instruction", offset))?;
            points.push(SequencePoint {
                index,
                document: documents
                    .get(document)
                    .cloned()
                    .ok_or_else(|| malformed_error!("Unknown document #{}", document))?,
                start_line: parser.read_compressed_uint()?,
                start_column: parser.read_compressed_uint()?,
                end_line: parser.read_compressed_uint()?,
                end_column: parser.read_compressed_uint()?,
            });
        }

        let body = module
            .method_mut(id)?
            .body
            .as_mut()
            .ok_or_else(|| malformed_error!("{} has no body", token))?;
        body.sequence_points = points;
    }

    module.has_symbols = true;
    Ok(())
}
