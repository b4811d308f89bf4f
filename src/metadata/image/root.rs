//! The metadata root and its stream directory (ECMA-335 II.24.2.1).

use crate::{
    file::io::{read_le, read_le_at},
    Error::OutOfBounds,
    Result,
};

/// Location of one stream inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Offset from the start of the root
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
    /// Stream name, e.g. `#~`
    pub name: String,
}

/// The parsed metadata root.
#[derive(Debug, Clone)]
pub struct Root {
    /// Major format version
    pub major_version: u16,
    /// Minor format version
    pub minor_version: u16,
    /// Runtime version string
    pub version: String,
    /// Every stream of the image
    pub stream_headers: Vec<StreamHeader>,
}

/// Upper bound on streams accepted in a root.
const MAX_STREAMS: u16 = 8;

impl Root {
    /// Parse the root at the start of `data`.
    ///
    /// # Errors
    /// Returns an error if the magic is wrong or a stream lies outside of `data`.
    pub fn read(data: &[u8]) -> Result<Root> {
        if data.len() < 20 {
            return Err(OutOfBounds);
        }

        let signature = read_le::<u32>(data)?;
        if signature != super::METADATA_MAGIC {
            return Err(malformed_error!("Metadata magic does not match - {:#x}", signature));
        }

        let version_length = read_le_at::<u32>(data, &mut 12)? as usize;
        let version_end = version_length
            .checked_add(16)
            .filter(|end| *end <= data.len())
            .ok_or(OutOfBounds)?;
        let version_bytes = &data[16..version_end];
        let terminator = version_bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(version_bytes.len());
        let version = String::from_utf8_lossy(&version_bytes[..terminator]).into_owned();

        let mut offset = version_end + 2;
        let stream_count = read_le_at::<u16>(data, &mut offset)?;
        if stream_count == 0 || stream_count > MAX_STREAMS {
            return Err(malformed_error!("Invalid stream count - {}", stream_count));
        }

        let mut stream_headers = Vec::with_capacity(stream_count as usize);
        for _ in 0..stream_count {
            let stream_offset = read_le_at::<u32>(data, &mut offset)?;
            let size = read_le_at::<u32>(data, &mut offset)?;
            let name_bytes = data.get(offset..).ok_or(OutOfBounds)?;
            let name_len = name_bytes
                .iter()
                .take(32)
                .position(|b| *b == 0)
                .ok_or_else(|| malformed_error!("Unterminated stream name"))?;
            let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
            offset += (name_len + 1 + 3) & !3;

            match stream_offset.checked_add(size) {
                Some(end) if end as usize <= data.len() => {}
                Some(_) => return Err(OutOfBounds),
                None => {
                    return Err(malformed_error!(
                        "Stream offset and size cause integer overflow - {} + {}",
                        stream_offset,
                        size
                    ))
                }
            }

            stream_headers.push(StreamHeader {
                offset: stream_offset,
                size,
                name,
            });
        }

        Ok(Root {
            major_version: read_le_at::<u16>(data, &mut 4)?,
            minor_version: read_le_at::<u16>(data, &mut 6)?,
            version,
            stream_headers,
        })
    }

    /// The bytes of the stream called `name`.
    ///
    /// # Errors
    /// Returns an error if the image has no such stream.
    pub fn stream<'a>(&self, data: &'a [u8], name: &str) -> Result<&'a [u8]> {
        let header = self
            .stream_headers
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| malformed_error!("Missing stream {}", name))?;
        let start = header.offset as usize;
        data.get(start..start + header.size as usize).ok_or(OutOfBounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let header_bytes = [
            0x42, 0x53, 0x4A, 0x42,
            0x01, 0x00,
            0x01, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x08, 0x00, 0x00, 0x00,
            b'v', b'4', b'.', b'0', 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
            0x01, 0x00,

            0x28, 0x00, 0x00, 0x00, // StreamHeader
            0x02, 0x00, 0x00, 0x00,
            0x23, 0x7E, 0x00, 0x00,
            0xAB, 0xCD,
        ];

        let root = Root::read(&header_bytes).unwrap();
        assert_eq!(root.major_version, 1);
        assert_eq!(root.version, "v4.0");
        assert_eq!(root.stream_headers.len(), 1);
        assert_eq!(root.stream_headers[0].name, "#~");
        assert_eq!(root.stream(&header_bytes, "#~").unwrap(), &[0xAB, 0xCD]);
        assert!(root.stream(&header_bytes, "#Blob").is_err());
    }

    #[test]
    fn wrong_magic() {
        let mut bytes = [0u8; 40];
        bytes[0] = 0x42;
        assert!(Root::read(&bytes).is_err());
    }
}
