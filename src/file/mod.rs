//! Access to the raw bytes of module images and symbol files.
//!
//! A [`File`] is either a read-only memory mapping of a file on disk or an owned buffer.
//! Mapped files keep their OS handle open until the [`File`] is dropped, which is what the
//! assembly resolver relies on to release cached images. [`pe`] understands the PE/COFF
//! container around the metadata.

pub mod io;
pub mod parser;
pub mod pe;
pub mod writer;

pub use parser::Parser;
pub use writer::Writer;

use memmap2::Mmap;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    Memory(Vec<u8>),
}

/// The bytes of one input file.
#[derive(Debug)]
pub struct File {
    backing: Backing,
    path: Option<PathBuf>,
}

impl File {
    /// Memory-map a file from disk.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be opened or mapped.
    pub fn from_path(path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(Error::Empty);
        }

        // Safety: the mapping is read-only and callers never write to the file while it is
        // mapped; the weaver writes to a separate output path or after the mapping is dropped.
        let mmap = unsafe { Mmap::map(&file) }?;

        Ok(File {
            backing: Backing::Mapped(mmap),
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an owned buffer.
    #[must_use]
    pub fn from_mem(data: Vec<u8>) -> File {
        File {
            backing: Backing::Memory(data),
            path: None,
        }
    }

    /// The file contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(mmap) => mmap.as_ref(),
            Backing::Memory(data) => data,
        }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// `true` if the file holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Path the file was mapped from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// `true` if the bytes are backed by a live file mapping.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, [1u8, 2, 3]).unwrap();

        let mapped = File::from_path(&path).unwrap();
        assert!(mapped.is_mapped());
        assert_eq!(mapped.data(), &[1, 2, 3]);
        assert_eq!(mapped.path(), Some(path.as_path()));

        let memory = File::from_mem(vec![4, 5]);
        assert!(!memory.is_mapped());
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        match File::from_path(dir.path().join("nope.dll")) {
            Err(Error::FileError(err)) => assert_eq!(err.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected FileError, got {other:?}"),
        }

        let empty = dir.path().join("empty.dll");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(File::from_path(&empty), Err(Error::Empty)));
    }
}
