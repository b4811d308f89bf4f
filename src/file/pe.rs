//! The PE/COFF container of a managed image (ECMA-335 II.25).
//!
//! Reading is done with `goblin`: the CLR runtime header data directory locates the CLI header,
//! the CLI header locates the metadata root, and every MethodDef RVA is mapped through the
//! section table to the bytes of its body. This is the same path a compiler-produced assembly
//! takes.
//!
//! Writing produces an IL-only PE32 DLL with a single `.text` section:
//!
//! ```text
//! 0x0000  DOS header and stub, PE signature, COFF header, optional header, section table
//! 0x0200  .text  (RVA 0x2000)
//!         CLI header (72 bytes)
//!         method bodies, 4-byte aligned
//!         metadata root and streams
//! ```
//!
//! The optional header checksum is computed over the final bytes. A non-zero checksum is
//! verified on read; compilers usually leave it zero and such images are accepted unchecked.
//!
//! # Examples
//!
//! ```rust,ignore
//! use dotweave::file::pe::{CliImage, PeBuilder};
//!
//! let metadata = std::fs::read("metadata.bin")?;
//! let image = PeBuilder::new(Vec::new(), metadata).build()?;
//! let cli = CliImage::parse(&image.bytes)?;
//! assert_eq!(cli.metadata().len() % 4, 0);
//! # Ok::<(), dotweave::Error>(())
//! ```

use goblin::pe::PE;

use crate::{
    file::{
        io::{read_le_at, write_le_at},
        writer::Writer,
    },
    Error::{self, OutOfBounds},
    Result,
};

/// Size of the CLI header.
pub const CLI_HEADER_SIZE: u32 = 72;
/// Alignment of section data in the file.
pub const FILE_ALIGNMENT: u32 = 0x200;
/// Alignment of sections in memory.
pub const SECTION_ALIGNMENT: u32 = 0x2000;
/// RVA of the `.text` section of written images.
pub const TEXT_RVA: u32 = 0x2000;
/// RVA of the first method body of written images.
pub const BODIES_RVA: u32 = TEXT_RVA + CLI_HEADER_SIZE;

/// `COMIMAGE_FLAGS_ILONLY`
pub const FLAGS_IL_ONLY: u32 = 0x0000_0001;

const PE_POINTER: u32 = 0x80;
const IMAGE_BASE: u32 = 0x1000_0000;
const OPTIONAL_HEADER_SIZE: u16 = 0xE0;
const DATA_DIRECTORIES: u32 = 16;
const CLR_DIRECTORY: u32 = 14;
/// Offset of the checksum inside the optional header.
const CHECKSUM_FIELD: usize = 64;

/// The canonical real-mode stub that prints "This program cannot be run in DOS mode."
#[rustfmt::skip]
const DOS_STUB: [u8; 64] = [
    0x0E, 0x1F, 0xBA, 0x0E, 0x00, 0xB4, 0x09, 0xCD, 0x21, 0xB8, 0x01, 0x4C, 0xCD, 0x21, 0x54, 0x68,
    0x69, 0x73, 0x20, 0x70, 0x72, 0x6F, 0x67, 0x72, 0x61, 0x6D, 0x20, 0x63, 0x61, 0x6E, 0x6E, 0x6F,
    0x74, 0x20, 0x62, 0x65, 0x20, 0x72, 0x75, 0x6E, 0x20, 0x69, 0x6E, 0x20, 0x44, 0x4F, 0x53, 0x20,
    0x6D, 0x6F, 0x64, 0x65, 0x2E, 0x0D, 0x0D, 0x0A, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

#[derive(Debug, Clone, Copy)]
struct Section {
    rva: u32,
    virtual_size: u32,
    raw_offset: u32,
    raw_size: u32,
}

impl Section {
    /// File offset of `rva` and the number of bytes that follow it in this section.
    fn map(&self, rva: u32) -> Option<(usize, usize)> {
        let extent = self.virtual_size.max(self.raw_size);
        if rva < self.rva || rva >= self.rva.checked_add(extent)? {
            return None;
        }
        let delta = rva - self.rva;
        if delta >= self.raw_size {
            return None;
        }
        Some(((self.raw_offset + delta) as usize, (self.raw_size - delta) as usize))
    }
}

/// The CLI view of a PE file: its metadata root and RVA-addressed method bodies.
#[derive(Debug)]
pub struct CliImage<'a> {
    data: &'a [u8],
    sections: Vec<Section>,
    metadata: &'a [u8],
    flags: u32,
    entry_point: u32,
}

impl<'a> CliImage<'a> {
    /// Parse the PE headers of `data` and locate the CLI header and metadata root.
    ///
    /// # Errors
    /// Returns [`Error::Empty`] for empty input, [`Error::GoblinErr`] if the PE headers do not
    /// parse, and [`Error::Malformed`] if the file carries no CLR header, the checksum does not
    /// match, or a directory points outside the sections.
    pub fn parse(data: &'a [u8]) -> Result<CliImage<'a>> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let pe = PE::parse(data)?;
        let optional = pe
            .header
            .optional_header
            .ok_or_else(|| malformed_error!("File does not have an OptionalHeader"))?;
        let (clr_rva, clr_size) = optional
            .data_directories
            .get_clr_runtime_header()
            .as_ref()
            .map(|dir| (dir.virtual_address, dir.size))
            .ok_or_else(|| malformed_error!("File does not have a CLR runtime header directory"))?;

        let stored = read_le_at::<u32>(data, &mut checksum_offset(data)?)?;
        if stored != 0 {
            let actual = checksum(data)?;
            if actual != stored {
                return Err(malformed_error!(
                    "Image checksum does not match its content - stored {:#x}, computed {:#x}",
                    stored,
                    actual
                ));
            }
        }

        let sections = pe
            .sections
            .iter()
            .map(|s| Section {
                rva: s.virtual_address,
                virtual_size: s.virtual_size,
                raw_offset: s.pointer_to_raw_data,
                raw_size: s.size_of_raw_data,
            })
            .collect();
        let mut image = CliImage {
            data,
            sections,
            metadata: &[],
            flags: 0,
            entry_point: 0,
        };

        if clr_size < CLI_HEADER_SIZE {
            return Err(malformed_error!("CLI header too small - {} bytes", clr_size));
        }
        let header = image.slice(clr_rva, CLI_HEADER_SIZE)?;
        let mut offset = 8;
        let metadata_rva = read_le_at::<u32>(header, &mut offset)?;
        let metadata_size = read_le_at::<u32>(header, &mut offset)?;
        image.flags = read_le_at::<u32>(header, &mut offset)?;
        image.entry_point = read_le_at::<u32>(header, &mut offset)?;
        image.metadata = image.slice(metadata_rva, metadata_size)?;
        Ok(image)
    }

    /// The metadata root and its streams.
    #[must_use]
    pub fn metadata(&self) -> &'a [u8] {
        self.metadata
    }

    /// CLI header flags.
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Token of the entry point method, or 0.
    #[must_use]
    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    /// The section bytes from `rva` to the end of its section.
    ///
    /// # Errors
    /// Returns an error if no section holds `rva`.
    pub fn at(&self, rva: u32) -> Result<&'a [u8]> {
        let (offset, len) = self
            .sections
            .iter()
            .find_map(|s| s.map(rva))
            .ok_or_else(|| malformed_error!("RVA could not be converted to offset - {:#x}", rva))?;
        self.data.get(offset..offset + len).ok_or(OutOfBounds)
    }

    /// Exactly `size` bytes at `rva`.
    ///
    /// # Errors
    /// Returns an error if the range does not lie inside one section.
    pub fn slice(&self, rva: u32, size: u32) -> Result<&'a [u8]> {
        self.at(rva)?.get(..size as usize).ok_or(OutOfBounds)
    }
}

/// Output of [`PeBuilder::build`].
#[derive(Debug, Clone)]
pub struct PeImage {
    /// The file bytes; the checksum is left zero until [`stamp_checksum`]
    pub bytes: Vec<u8>,
    /// File offset of the metadata root
    pub metadata_offset: usize,
}

/// Lays out an IL-only PE32 DLL around method bodies and a metadata root.
#[derive(Debug, Clone)]
pub struct PeBuilder {
    bodies: Vec<u8>,
    metadata: Vec<u8>,
    entry_point: u32,
}

impl PeBuilder {
    /// A builder for `bodies`, which must start at [`BODIES_RVA`], and `metadata`.
    #[must_use]
    pub fn new(bodies: Vec<u8>, metadata: Vec<u8>) -> Self {
        PeBuilder {
            bodies,
            metadata,
            entry_point: 0,
        }
    }

    /// Record an entry point token in the CLI header.
    #[must_use]
    pub fn entry_point(mut self, token: u32) -> Self {
        self.entry_point = token;
        self
    }

    /// Lay out the file.
    ///
    /// # Errors
    /// Returns an error if the section would exceed the 32-bit address space.
    pub fn build(self) -> Result<PeImage> {
        let bodies_len = align(to_u32(self.bodies.len())?, 4);
        let metadata_rva = BODIES_RVA + bodies_len;
        let metadata_size = to_u32(self.metadata.len())?;
        let virtual_size = CLI_HEADER_SIZE + bodies_len + metadata_size;
        let raw_size = align(virtual_size, FILE_ALIGNMENT);
        let image_size = align(TEXT_RVA + virtual_size, SECTION_ALIGNMENT);

        let mut out = Writer::new();

        // DOS header
        out.write_bytes(b"MZ");
        out.write_le::<u16>(0x90);
        out.write_le::<u16>(3);
        out.write_le::<u16>(0);
        out.write_le::<u16>(4);
        out.write_le::<u16>(0);
        out.write_le::<u16>(0xFFFF);
        out.write_le::<u16>(0);
        out.write_le::<u16>(0xB8);
        out.write_bytes(&[0u8; 0x3C - 0x12]);
        out.write_le::<u32>(PE_POINTER);
        out.write_bytes(&DOS_STUB);

        // COFF header
        out.write_bytes(b"PE\0\0");
        out.write_le::<u16>(0x014C);
        out.write_le::<u16>(1);
        out.write_le::<u32>(0);
        out.write_le::<u32>(0);
        out.write_le::<u32>(0);
        out.write_le::<u16>(OPTIONAL_HEADER_SIZE);
        // EXECUTABLE_IMAGE | 32BIT_MACHINE | DLL
        out.write_le::<u16>(0x2102);

        // Optional header, standard fields
        let optional = out.pos();
        out.write_le::<u16>(0x010B);
        out.write_le::<u8>(48);
        out.write_le::<u8>(0);
        out.write_le::<u32>(raw_size);
        out.write_le::<u32>(0);
        out.write_le::<u32>(0);
        out.write_le::<u32>(0);
        out.write_le::<u32>(TEXT_RVA);
        out.write_le::<u32>(0);

        // Windows fields
        out.write_le::<u32>(IMAGE_BASE);
        out.write_le::<u32>(SECTION_ALIGNMENT);
        out.write_le::<u32>(FILE_ALIGNMENT);
        out.write_le::<u16>(4);
        out.write_le::<u16>(0);
        out.write_le::<u16>(0);
        out.write_le::<u16>(0);
        out.write_le::<u16>(4);
        out.write_le::<u16>(0);
        out.write_le::<u32>(0);
        out.write_le::<u32>(image_size);
        out.write_le::<u32>(FILE_ALIGNMENT);
        debug_assert_eq!(out.pos() - optional, CHECKSUM_FIELD);
        out.write_le::<u32>(0);
        // WINDOWS_CUI
        out.write_le::<u16>(3);
        // DYNAMIC_BASE | NX_COMPAT | NO_SEH | TERMINAL_SERVER_AWARE
        out.write_le::<u16>(0x8540);
        out.write_le::<u32>(0x0010_0000);
        out.write_le::<u32>(0x1000);
        out.write_le::<u32>(0x0010_0000);
        out.write_le::<u32>(0x1000);
        out.write_le::<u32>(0);
        out.write_le::<u32>(DATA_DIRECTORIES);
        for index in 0..DATA_DIRECTORIES {
            let (rva, size) = if index == CLR_DIRECTORY {
                (TEXT_RVA, CLI_HEADER_SIZE)
            } else {
                (0, 0)
            };
            out.write_le::<u32>(rva);
            out.write_le::<u32>(size);
        }
        debug_assert_eq!(out.pos() - optional, usize::from(OPTIONAL_HEADER_SIZE));

        // Section table
        out.write_bytes(b".text\0\0\0");
        out.write_le::<u32>(virtual_size);
        out.write_le::<u32>(TEXT_RVA);
        out.write_le::<u32>(raw_size);
        out.write_le::<u32>(FILE_ALIGNMENT);
        out.write_le::<u32>(0);
        out.write_le::<u32>(0);
        out.write_le::<u16>(0);
        out.write_le::<u16>(0);
        // CNT_CODE | MEM_EXECUTE | MEM_READ
        out.write_le::<u32>(0x6000_0020);
        out.align(FILE_ALIGNMENT as usize);

        // CLI header
        out.write_le::<u32>(CLI_HEADER_SIZE);
        out.write_le::<u16>(2);
        out.write_le::<u16>(5);
        out.write_le::<u32>(metadata_rva);
        out.write_le::<u32>(metadata_size);
        out.write_le::<u32>(FLAGS_IL_ONLY);
        out.write_le::<u32>(self.entry_point);
        // Resources, StrongNameSignature, CodeManagerTable, VTableFixups,
        // ExportAddressTableJumps, ManagedNativeHeader
        out.write_bytes(&[0u8; 48]);

        out.write_bytes(&self.bodies);
        out.align(4);
        let metadata_offset = out.pos();
        out.write_bytes(&self.metadata);
        out.align(FILE_ALIGNMENT as usize);

        Ok(PeImage {
            bytes: out.into_inner(),
            metadata_offset,
        })
    }
}

/// Compute the checksum of `data` and store it in the optional header.
///
/// # Errors
/// Returns an error if `data` is too short to hold a PE header.
pub fn stamp_checksum(data: &mut [u8]) -> Result<u32> {
    let mut offset = checksum_offset(data)?;
    write_le_at(data, &mut offset, 0u32)?;
    let sum = checksum(data)?;
    let mut offset = checksum_offset(data)?;
    write_le_at(data, &mut offset, sum)?;
    Ok(sum)
}

/// The PE image checksum: a folded 16-bit one's complement sum of the file, with the checksum
/// field itself skipped, plus the file length.
///
/// # Errors
/// Returns an error if `data` is too short to hold a PE header.
pub fn checksum(data: &[u8]) -> Result<u32> {
    let field = checksum_offset(data)?;
    let mut sum: u64 = 0;
    for (index, chunk) in data.chunks(2).enumerate() {
        let at = index * 2;
        if at == field || at == field + 2 {
            continue;
        }
        let word = match chunk {
            [low, high] => u64::from(u16::from_le_bytes([*low, *high])),
            [low] => u64::from(*low),
            _ => 0,
        };
        sum += word;
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum = (sum & 0xFFFF) + (sum >> 16);
    let length = to_u32(data.len())?;
    Ok((sum as u32).wrapping_add(length))
}

fn checksum_offset(data: &[u8]) -> Result<usize> {
    let pe_pointer = read_le_at::<u32>(data, &mut 0x3C)? as usize;
    let offset = pe_pointer
        .checked_add(4 + 20 + CHECKSUM_FIELD)
        .ok_or_else(|| malformed_error!("PE header pointer overflows - {:#x}", pe_pointer))?;
    if offset + 4 > data.len() {
        return Err(OutOfBounds);
    }
    Ok(offset)
}

fn align(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

fn to_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| malformed_error!("Section too large - {} bytes", len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let bodies = vec![0x0A, 0x17, 0x2A];
        let metadata = b"BSJB-metadata-stand-in".to_vec();
        let mut image = PeBuilder::new(bodies, metadata).build().unwrap();
        stamp_checksum(&mut image.bytes).unwrap();
        image.bytes
    }

    #[test]
    fn written_image_parses_with_goblin() {
        let bytes = sample();
        assert_eq!(bytes.len() % FILE_ALIGNMENT as usize, 0);

        let image = CliImage::parse(&bytes).unwrap();
        assert_eq!(image.flags(), FLAGS_IL_ONLY);
        assert_eq!(image.entry_point(), 0);
        assert_eq!(image.metadata(), b"BSJB-metadata-stand-in");
        assert_eq!(&image.at(BODIES_RVA).unwrap()[..3], &[0x0A, 0x17, 0x2A]);
        assert!(image.at(0x10).is_err());
        assert!(image.at(TEXT_RVA + 0x10_0000).is_err());
    }

    #[test]
    fn checksum_detects_changes() {
        let mut bytes = sample();
        assert_ne!(checksum(&bytes).unwrap(), 0);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x5A;
        assert!(CliImage::parse(&bytes).is_err());

        // A zero checksum is not verified
        let mut offset = checksum_offset(&bytes).unwrap();
        write_le_at(&mut bytes, &mut offset, 0u32).unwrap();
        assert!(CliImage::parse(&bytes).is_ok());
    }

    #[test]
    fn non_pe_input_is_rejected() {
        assert!(matches!(CliImage::parse(&[]), Err(Error::Empty)));
        assert!(CliImage::parse(b"not an image").is_err());
    }
}
