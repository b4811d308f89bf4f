//! Growable output buffer, the counterpart of [`crate::file::Parser`].

use crate::{
    file::io::{write_le_at, CilIO},
    Result,
};

/// An append-only byte buffer with little-endian and ECMA-335 compressed encodings.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length, which is also the offset of the next write.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.data.len()
    }

    /// Append a little-endian value.
    pub fn write_le<T: CilIO>(&mut self, value: T) {
        self.data.extend_from_slice(value.to_le_bytes().as_ref());
    }

    /// Overwrite a previously written value.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset` does not point into written data.
    pub fn patch_le<T: CilIO>(&mut self, offset: usize, value: T) -> Result<()> {
        let mut offset = offset;
        write_le_at(&mut self.data, &mut offset, value)
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append an ECMA-335 compressed unsigned integer.
    ///
    /// # Errors
    /// Returns an error if `value` exceeds `0x1FFF_FFFF`, the largest encodable value.
    pub fn write_compressed_uint(&mut self, value: u32) -> Result<()> {
        if value <= 0x7F {
            #[allow(clippy::cast_possible_truncation)]
            self.data.push(value as u8);
        } else if value <= 0x3FFF {
            #[allow(clippy::cast_possible_truncation)]
            self.data
                .extend_from_slice(&[0x80 | (value >> 8) as u8, (value & 0xFF) as u8]);
        } else if value <= 0x1FFF_FFFF {
            #[allow(clippy::cast_possible_truncation)]
            self.data.extend_from_slice(&[
                0xC0 | (value >> 24) as u8,
                ((value >> 16) & 0xFF) as u8,
                ((value >> 8) & 0xFF) as u8,
                (value & 0xFF) as u8,
            ]);
        } else {
            return Err(malformed_error!("Value too large for compressed uint - {}", value));
        }

        Ok(())
    }

    /// Append a compressed length prefix followed by the UTF-8 bytes of `value`.
    ///
    /// # Errors
    /// Returns an error if the string is too long to prefix.
    pub fn write_compressed_string_utf8(&mut self, value: &str) -> Result<()> {
        let length = u32::try_from(value.len())
            .map_err(|_| malformed_error!("String too long - {}", value.len()))?;
        self.write_compressed_uint(length)?;
        self.write_bytes(value.as_bytes());
        Ok(())
    }

    /// Append a zero-terminated UTF-8 string.
    pub fn write_string_utf8(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
        self.data.push(0);
    }

    /// Pad with zero bytes up to a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        while self.data.len() % alignment != 0 {
            self.data.push(0);
        }
    }

    /// Borrow the written bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consume the writer and return its bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Parser;

    #[test]
    fn compressed_uint_boundaries() {
        let mut writer = Writer::new();
        for value in [0, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1FFF_FFFF] {
            writer.write_compressed_uint(value).unwrap();
        }
        assert!(writer.write_compressed_uint(0x2000_0000).is_err());

        let bytes = writer.into_inner();
        assert_eq!(&bytes[..4], &[0x00, 0x7F, 0x80, 0x80]);

        let mut parser = Parser::new(&bytes);
        for value in [0, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1FFF_FFFF] {
            assert_eq!(parser.read_compressed_uint().unwrap(), value);
        }
    }

    #[test]
    fn patch_and_align() {
        let mut writer = Writer::new();
        writer.write_le(0u32);
        writer.write_le(7u8);
        writer.align(4);
        writer.patch_le(0, 0xAABB_CCDDu32).unwrap();
        assert_eq!(writer.as_slice(), &[0xDD, 0xCC, 0xBB, 0xAA, 7, 0, 0, 0]);
        assert!(writer.patch_le(6, 1u32).is_err());
    }
}
