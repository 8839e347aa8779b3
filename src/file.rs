//! The file abstraction used by the store.
//!
//! Every operation is positional: there is no implicit cursor, so one open
//! file can serve concurrent readers while the commit thread appends. The
//! store is generic over [`File`], which lets tests substitute an
//! in-memory implementation.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Advisory open mode for a file.
///
/// The mode only tunes read-ahead behavior; it does not restrict the
/// operations available on the handle beyond read-only for `Scan`/`Read`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    /// Read-only, sequential access pattern.
    Scan,
    /// Read-only, random access pattern.
    Read,
    /// Read/write, random access pattern.
    Append,
    /// Read/write, default access pattern.
    Write,
}

impl FileMode {
    fn writable(self) -> bool {
        matches!(self, FileMode::Append | FileMode::Write)
    }
}

/// Positional file operations.
///
/// Errors are returned, never panicked. `read` fails with
/// [`Error::ShortRead`] when fewer bytes than requested are available;
/// `write` retries partial writes and fails with [`Error::ShortWrite`]
/// only if the OS refuses to make progress.
pub trait File: Sized + Send + Sync {
    /// Create a new file. Fails with [`Error::AlreadyExists`] if the path
    /// is taken.
    fn create(mode: FileMode, path: &Path) -> Result<Self>;

    /// Open an existing file. Fails with [`Error::NotFound`] if absent.
    fn open(mode: FileMode, path: &Path) -> Result<Self>;

    /// Remove the file at `path`.
    fn erase(path: &Path) -> Result<()>;

    /// Current size of the file in bytes.
    fn size(&self) -> Result<u64>;

    /// Fill `buf` from the file starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` to the file starting at `offset`.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush file contents and metadata to durable storage.
    fn sync(&self) -> Result<()>;

    /// Truncate or extend the file to `len` bytes.
    fn trunc(&self, len: u64) -> Result<()>;
}

/// [`File`] backed by the operating system.
#[derive(Debug)]
pub struct StdFile {
    file: fs::File,
}

impl StdFile {
    fn apply_advice(file: &fs::File, mode: FileMode) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let advice = match mode {
                FileMode::Scan => libc::POSIX_FADV_SEQUENTIAL,
                FileMode::Read | FileMode::Append => libc::POSIX_FADV_RANDOM,
                FileMode::Write => libc::POSIX_FADV_NORMAL,
            };
            // Advice only; a failure here changes performance, not behavior.
            unsafe {
                libc::posix_fadvise(file.as_raw_fd(), 0, 0, advice);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (file, mode);
        }
    }
}

impl File for StdFile {
    fn create(mode: FileMode, path: &Path) -> Result<Self> {
        let file = fs::File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::apply_advice(&file, mode);
        Ok(Self { file })
    }

    fn open(mode: FileMode, path: &Path) -> Result<Self> {
        let file = fs::File::options()
            .read(true)
            .write(mode.writable())
            .open(path)?;
        Self::apply_advice(&file, mode);
        Ok(Self { file })
    }

    fn erase(path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        #[cfg(unix)]
        use std::os::unix::fs::FileExt;
        #[cfg(windows)]
        use std::os::windows::fs::FileExt;

        let mut done = 0;
        while done < buf.len() {
            #[cfg(unix)]
            let r = self.file.read_at(&mut buf[done..], offset + done as u64);
            #[cfg(windows)]
            let r = self.file.seek_read(&mut buf[done..], offset + done as u64);
            match r {
                Ok(0) => return Err(Error::ShortRead),
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        #[cfg(unix)]
        use std::os::unix::fs::FileExt;
        #[cfg(windows)]
        use std::os::windows::fs::FileExt;

        let mut done = 0;
        while done < buf.len() {
            #[cfg(unix)]
            let r = self.file.write_at(&buf[done..], offset + done as u64);
            #[cfg(windows)]
            let r = self.file.seek_write(&buf[done..], offset + done as u64);
            match r {
                Ok(0) => return Err(Error::ShortWrite),
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn trunc(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_open_erase_lifecycle() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("a.bin");

        assert_eq!(
            StdFile::open(FileMode::Read, &path).err(),
            Some(Error::NotFound)
        );

        let f = StdFile::create(FileMode::Write, &path).expect("create");
        assert_eq!(f.size().unwrap(), 0);
        drop(f);

        assert_eq!(
            StdFile::create(FileMode::Write, &path).err(),
            Some(Error::AlreadyExists)
        );

        StdFile::erase(&path).expect("erase");
        assert_eq!(StdFile::erase(&path).err(), Some(Error::NotFound));
    }

    #[test]
    fn positional_read_write() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("b.bin");
        let f = StdFile::create(FileMode::Write, &path).expect("create");

        f.write(0, b"hello world").unwrap();
        f.write(6, b"nudb!").unwrap();

        let mut buf = [0u8; 11];
        f.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello nudb!");

        // Writes at an offset beyond the end extend with zeros.
        f.write(16, b"x").unwrap();
        assert_eq!(f.size().unwrap(), 17);
        let mut gap = [0xFFu8; 5];
        f.read(11, &mut gap).unwrap();
        assert_eq!(gap, [0u8; 5]);
    }

    #[test]
    fn read_past_end_is_short_read() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("c.bin");
        let f = StdFile::create(FileMode::Write, &path).expect("create");
        f.write(0, b"abc").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(f.read(0, &mut buf).err(), Some(Error::ShortRead));
        assert_eq!(f.read(100, &mut buf[..1]).err(), Some(Error::ShortRead));
    }

    #[test]
    fn trunc_shrinks_and_extends() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("d.bin");
        let f = StdFile::create(FileMode::Write, &path).expect("create");
        f.write(0, b"0123456789").unwrap();

        f.trunc(4).unwrap();
        assert_eq!(f.size().unwrap(), 4);

        f.trunc(8).unwrap();
        assert_eq!(f.size().unwrap(), 8);
        let mut buf = [0xFFu8; 4];
        f.read(4, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn scan_mode_is_read_only() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("e.bin");
        let f = StdFile::create(FileMode::Write, &path).expect("create");
        f.write(0, b"data").unwrap();
        drop(f);

        let r = StdFile::open(FileMode::Scan, &path).expect("open");
        let mut buf = [0u8; 4];
        r.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
        assert!(r.write(0, b"nope").is_err());
    }
}
