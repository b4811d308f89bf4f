//! The `#Strings`, `#US`, `#Blob` and `#GUID` heaps (ECMA-335 II.24.2.2 - II.24.2.5).
//!
//! Builders intern values and hand out heap indices; readers resolve indices back to values.
//! Index 0 of the string, blob and user string heaps is the empty entry.

use std::collections::HashMap;

use widestring::{U16Str, U16String};

use crate::{
    file::{parser::Parser, writer::Writer},
    Error::OutOfBounds,
    Result,
};

/// Builder of the `#Strings` heap.
pub struct StringHeapBuilder {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl Default for StringHeapBuilder {
    fn default() -> Self {
        StringHeapBuilder {
            data: vec![0],
            index: HashMap::new(),
        }
    }
}

impl StringHeapBuilder {
    /// Intern `value` and return its heap offset.
    ///
    /// # Errors
    /// Returns an error if the heap outgrows a 32-bit index.
    pub fn add(&mut self, value: &str) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }
        let offset = heap_offset(self.data.len())?;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.index.insert(value.to_string(), offset);
        Ok(offset)
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Builder of the `#Blob` heap.
pub struct BlobHeapBuilder {
    data: Vec<u8>,
    index: HashMap<Vec<u8>, u32>,
}

impl Default for BlobHeapBuilder {
    fn default() -> Self {
        BlobHeapBuilder {
            data: vec![0],
            index: HashMap::new(),
        }
    }
}

impl BlobHeapBuilder {
    /// Intern `blob` and return its heap offset.
    ///
    /// # Errors
    /// Returns an error if the blob or the heap is too large.
    pub fn add(&mut self, blob: &[u8]) -> Result<u32> {
        if blob.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = self.index.get(blob) {
            return Ok(*offset);
        }
        let offset = heap_offset(self.data.len())?;
        let mut writer = Writer::new();
        writer.write_compressed_uint(heap_offset(blob.len())?)?;
        self.data.extend_from_slice(writer.as_slice());
        self.data.extend_from_slice(blob);
        self.index.insert(blob.to_vec(), offset);
        Ok(offset)
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Builder of the `#US` heap.
pub struct UserStringHeapBuilder {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl Default for UserStringHeapBuilder {
    fn default() -> Self {
        UserStringHeapBuilder {
            data: vec![0],
            index: HashMap::new(),
        }
    }
}

impl UserStringHeapBuilder {
    /// Intern `value` and return its heap offset.
    ///
    /// # Errors
    /// Returns an error if the heap outgrows the 24-bit user string token space.
    pub fn add(&mut self, value: &str) -> Result<u32> {
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }
        let offset = heap_offset(self.data.len())?;
        if offset > 0x00FF_FFFF {
            return Err(malformed_error!("#US heap exceeds the token range"));
        }

        let units = U16String::from_str(value).into_vec();
        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
        // Trailing byte flags strings that need more than a plain copy (II.24.2.4).
        let special = units
            .iter()
            .any(|u| *u > 0x7E || matches!(*u, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D));

        let mut writer = Writer::new();
        writer.write_compressed_uint(heap_offset(bytes.len() + 1)?)?;
        self.data.extend_from_slice(writer.as_slice());
        self.data.extend_from_slice(&bytes);
        self.data.push(u8::from(special));
        self.index.insert(value.to_string(), offset);
        Ok(offset)
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Builder of the `#GUID` heap.
#[derive(Default)]
pub struct GuidHeapBuilder {
    data: Vec<u8>,
}

impl GuidHeapBuilder {
    /// Append `guid` and return its 1-based index.
    ///
    /// # Errors
    /// Returns an error if the heap outgrows a 32-bit index.
    pub fn add(&mut self, guid: &uguid::Guid) -> Result<u32> {
        self.data.extend_from_slice(&guid.to_bytes());
        heap_offset(self.data.len() / 16)
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

fn heap_offset(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Heap exceeds 4 GiB"))
}

/// Reader over a `#Strings` heap.
pub struct Strings<'a> {
    data: &'a [u8],
}

impl<'a> Strings<'a> {
    /// Wrap the heap bytes.
    ///
    /// # Errors
    /// Returns an error if the heap does not start with the empty string.
    pub fn from(data: &'a [u8]) -> Result<Strings<'a>> {
        if data.first() != Some(&0) {
            return Err(malformed_error!("Invalid #Strings heap"));
        }
        Ok(Strings { data })
    }

    /// The string at `index`.
    ///
    /// # Errors
    /// Returns an error for out-of-range offsets and invalid UTF-8.
    pub fn get(&self, index: u32) -> Result<&'a str> {
        let tail = self.data.get(index as usize..).ok_or(OutOfBounds)?;
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| malformed_error!("Unterminated string at {}", index))?;
        std::str::from_utf8(&tail[..end])
            .map_err(|_| malformed_error!("Invalid UTF-8 string at {}", index))
    }
}

/// Reader over a `#Blob` heap.
pub struct Blob<'a> {
    data: &'a [u8],
}

impl<'a> Blob<'a> {
    /// Wrap the heap bytes.
    ///
    /// # Errors
    /// Returns an error if the heap does not start with the empty blob.
    pub fn from(data: &'a [u8]) -> Result<Blob<'a>> {
        if data.first() != Some(&0) {
            return Err(malformed_error!("Invalid #Blob heap"));
        }
        Ok(Blob { data })
    }

    /// The blob at `index`.
    ///
    /// # Errors
    /// Returns an error if the blob runs past the heap.
    pub fn get(&self, index: u32) -> Result<&'a [u8]> {
        let mut parser = Parser::new(self.data);
        parser.seek(index as usize)?;
        let len = parser.read_compressed_uint()? as usize;
        parser.read_bytes(len)
    }
}

/// Reader over a `#US` heap.
pub struct UserStrings<'a> {
    data: &'a [u8],
}

impl<'a> UserStrings<'a> {
    /// Wrap the heap bytes.
    ///
    /// # Errors
    /// Returns an error if the heap is empty or does not start with the empty entry.
    pub fn from(data: &'a [u8]) -> Result<UserStrings<'a>> {
        if data.first() != Some(&0) {
            return Err(OutOfBounds);
        }
        Ok(UserStrings { data })
    }

    /// The string at `index`.
    ///
    /// # Errors
    /// Returns an error for out-of-range offsets and invalid UTF-16.
    pub fn get(&self, index: u32) -> Result<String> {
        let mut parser = Parser::new(self.data);
        parser.seek(index as usize)?;
        let len = parser.read_compressed_uint()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = parser.read_bytes(len - 1)?;
        if bytes.len() % 2 != 0 {
            return Err(malformed_error!(
                "Invalid string data length at index - {}",
                index
            ));
        }
        let units = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        U16Str::from_slice(&units)
            .to_string()
            .map_err(|_| malformed_error!("Invalid string from index - {}", index))
    }
}

/// Reader over a `#GUID` heap.
pub struct Guids<'a> {
    data: &'a [u8],
}

impl<'a> Guids<'a> {
    /// Wrap the heap bytes.
    #[must_use]
    pub fn from(data: &'a [u8]) -> Guids<'a> {
        Guids { data }
    }

    /// The GUID at 1-based `index`; index 0 is the nil GUID.
    ///
    /// # Errors
    /// Returns an error if the index is past the heap.
    pub fn get(&self, index: u32) -> Result<uguid::Guid> {
        if index == 0 {
            return Ok(uguid::Guid::ZERO);
        }
        let start = (index as usize - 1) * 16;
        let slice = self.data.get(start..start + 16).ok_or(OutOfBounds)?;
        let mut buffer = [0u8; 16];
        buffer.copy_from_slice(slice);
        Ok(uguid::Guid::from_bytes(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_interned() {
        let mut builder = StringHeapBuilder::default();
        let a = builder.add("Hello").unwrap();
        let b = builder.add("World").unwrap();
        assert_eq!(builder.add("Hello").unwrap(), a);
        assert_eq!(builder.add("").unwrap(), 0);
        let data = builder.into_inner();
        let heap = Strings::from(&data).unwrap();
        assert_eq!(heap.get(a).unwrap(), "Hello");
        assert_eq!(heap.get(b).unwrap(), "World");
        assert_eq!(heap.get(0).unwrap(), "");
    }

    #[test]
    fn user_strings_are_utf16() {
        let mut builder = UserStringHeapBuilder::default();
        let index = builder.add("Hello, World!").unwrap();
        let empty = builder.add("").unwrap();
        let data = builder.into_inner();
        assert_eq!(index, 1);
        // length prefix: 13 UTF-16 units + terminal byte
        assert_eq!(data[1], 27);
        assert_eq!(data[28], 0);
        let heap = UserStrings::from(&data).unwrap();
        assert_eq!(heap.get(index).unwrap(), "Hello, World!");
        assert_eq!(heap.get(empty).unwrap(), "");
    }

    #[test]
    fn blobs_and_guids() {
        let mut blobs = BlobHeapBuilder::default();
        let index = blobs.add(&[0x20, 0x00, 0x01]).unwrap();
        assert_eq!(blobs.add(&[0x20, 0x00, 0x01]).unwrap(), index);
        let data = blobs.into_inner();
        assert_eq!(Blob::from(&data).unwrap().get(index).unwrap(), &[0x20, 0x00, 0x01]);
        assert!(Blob::from(&data).unwrap().get(40).is_err());

        let guid = uguid::guid!("d437908e-65e6-487c-9735-7bdff699bea5");
        let mut guids = GuidHeapBuilder::default();
        assert_eq!(guids.add(&guid).unwrap(), 1);
        let data = guids.into_inner();
        let heap = Guids::from(&data);
        assert_eq!(heap.get(1).unwrap(), guid);
        assert_eq!(heap.get(0).unwrap(), uguid::Guid::ZERO);
        assert!(heap.get(2).is_err());
    }
}
