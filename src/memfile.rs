//! An in-memory [`File`] implementation.
//!
//! Used by unit tests that need byte-level control over file contents
//! without touching the filesystem. `create` and `open` ignore the path
//! and always hand out a fresh empty file, so this type is only suitable
//! for direct construction in tests, not for path-addressed store opens.

use std::path::Path;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::file::{File, FileMode};

#[derive(Debug, Default)]
pub struct MemFile {
    data: RwLock<Vec<u8>>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a file holding `data`.
    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Copy out the full contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }
}

impl File for MemFile {
    fn create(_mode: FileMode, _path: &Path) -> Result<Self> {
        Ok(Self::new())
    }

    fn open(_mode: FileMode, _path: &Path) -> Result<Self> {
        Ok(Self::new())
    }

    fn erase(_path: &Path) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().unwrap().len() as u64)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Error::ShortRead);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn trunc(&self, len: u64) -> Result<()> {
        self.data.write().unwrap().resize(len as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn behaves_like_a_positional_file() {
        let f = MemFile::new();
        f.write(4, b"abcd").unwrap();
        assert_eq!(f.size().unwrap(), 8);

        let mut buf = [0u8; 8];
        f.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0\0\0abcd");

        assert_eq!(f.read(5, &mut buf).err(), Some(Error::ShortRead));

        f.trunc(2).unwrap();
        assert_eq!(f.size().unwrap(), 2);
    }
}
