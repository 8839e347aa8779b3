//! The on-disk format: the three file headers and the functions that
//! derive the index geometry.
//!
//! A database is three files sharing a common stem. The data file holds
//! the records, the key file holds the hashed-bucket index, and the log
//! file exists only while a commit (or rekey) is in flight; its presence
//! on disk is the durable marker that recovery is required.
//!
//! All integers are little-endian. The data file header is padded to 64
//! bytes; the key file header occupies the whole first block.

use std::path::Path;

use rand::Rng;

use crate::error::{Error, Result};
use crate::field;
use crate::file::File;
use crate::hash::{hash, Hasher};

pub const DAT_MAGIC: &[u8; 8] = b"nudb.dat";
pub const KEY_MAGIC: &[u8; 8] = b"nudb.key";
pub const LOG_MAGIC: &[u8; 8] = b"nudb.log";

pub const CURRENT_VERSION: u16 = 2;

/// Size of the data file header on disk, including reserved padding.
pub const DAT_HEADER_SIZE: usize = 64;

/// Nominal size of the key file header; on disk it is padded out to one
/// full block.
pub const KEY_HEADER_SIZE: usize = 64;

/// Size of the log file header on disk.
pub const LOG_HEADER_SIZE: usize = 62;

pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Header of the data file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatFileHeader {
    pub version: u16,
    pub uid: u64,
    pub appnum: u64,
    pub key_size: u16,
}

impl DatFileHeader {
    pub fn encode(&self) -> [u8; DAT_HEADER_SIZE] {
        let mut buf = [0u8; DAT_HEADER_SIZE];
        buf[0..8].copy_from_slice(DAT_MAGIC);
        field::write_u16(&mut buf[8..], self.version);
        field::write_u64(&mut buf[10..], self.uid);
        field::write_u64(&mut buf[18..], self.appnum);
        field::write_u16(&mut buf[26..], self.key_size);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DAT_HEADER_SIZE || &buf[0..8] != DAT_MAGIC {
            return Err(Error::NotDataFile);
        }
        let h = Self {
            version: field::read_u16(&buf[8..]),
            uid: field::read_u64(&buf[10..]),
            appnum: field::read_u64(&buf[18..]),
            key_size: field::read_u16(&buf[26..]),
        };
        if h.version != CURRENT_VERSION {
            return Err(Error::NotDataFile);
        }
        if h.key_size == 0 {
            return Err(Error::KeySizeInvalid);
        }
        Ok(h)
    }

    pub fn read_from<F: File>(file: &F) -> Result<Self> {
        let mut buf = [0u8; DAT_HEADER_SIZE];
        file.read(0, &mut buf).map_err(|e| match e {
            Error::ShortRead => Error::NotDataFile,
            other => other,
        })?;
        Self::decode(&buf)
    }

    pub fn write_to<F: File>(&self, file: &F) -> Result<()> {
        file.write(0, &self.encode())
    }
}

/// Header of the key file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyFileHeader {
    pub version: u16,
    pub uid: u64,
    pub appnum: u64,
    pub salt: u64,
    pub pepper: u64,
    pub block_size: u32,
    pub key_size: u16,
    /// Target load factor scaled by 65536, capped at 65535.
    pub load_factor: u16,
    pub buckets: u64,
    pub modulus: u64,
}

impl KeyFileHeader {
    /// Entries per bucket at this block size.
    pub fn capacity(&self) -> usize {
        crate::bucket::bucket_capacity(self.block_size as usize)
    }

    /// Offset of bucket `n` in the key file.
    pub fn bucket_offset(&self, n: u64) -> u64 {
        (n + 1) * u64::from(self.block_size)
    }

    /// Steady-state size of the key file: header block plus one block per
    /// bucket.
    pub fn key_file_size(&self) -> u64 {
        (self.buckets + 1) * u64::from(self.block_size)
    }

    pub fn encode(&self) -> [u8; KEY_HEADER_SIZE] {
        let mut buf = [0u8; KEY_HEADER_SIZE];
        buf[0..8].copy_from_slice(KEY_MAGIC);
        field::write_u16(&mut buf[8..], self.version);
        field::write_u64(&mut buf[10..], self.uid);
        field::write_u64(&mut buf[18..], self.appnum);
        field::write_u64(&mut buf[26..], self.salt);
        field::write_u64(&mut buf[34..], self.pepper);
        // 65536 wraps to 0 in the 16-bit field.
        field::write_u16(&mut buf[42..], self.block_size as u16);
        field::write_u16(&mut buf[44..], self.key_size);
        field::write_u16(&mut buf[46..], self.load_factor);
        field::write_u64(&mut buf[48..], self.buckets);
        field::write_u64(&mut buf[56..], self.modulus);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < KEY_HEADER_SIZE || &buf[0..8] != KEY_MAGIC {
            return Err(Error::NotKeyFile);
        }
        let raw_block = field::read_u16(&buf[42..]);
        let h = Self {
            version: field::read_u16(&buf[8..]),
            uid: field::read_u64(&buf[10..]),
            appnum: field::read_u64(&buf[18..]),
            salt: field::read_u64(&buf[26..]),
            pepper: field::read_u64(&buf[34..]),
            block_size: if raw_block == 0 {
                MAX_BLOCK_SIZE
            } else {
                u32::from(raw_block)
            },
            key_size: field::read_u16(&buf[44..]),
            load_factor: field::read_u16(&buf[46..]),
            buckets: field::read_u64(&buf[48..]),
            modulus: field::read_u64(&buf[56..]),
        };
        h.validate()?;
        Ok(h)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != CURRENT_VERSION {
            return Err(Error::NotKeyFile);
        }
        if self.key_size == 0 {
            return Err(Error::KeySizeInvalid);
        }
        if !valid_block_size(self.block_size) {
            return Err(Error::BlockSizeInvalid);
        }
        if self.load_factor == 0 {
            return Err(Error::LoadFactorInvalid);
        }
        if self.buckets == 0 || self.modulus != ceil_pow2(self.buckets) {
            return Err(Error::InvalidBucketCount);
        }
        Ok(())
    }

    pub fn read_from<F: File>(file: &F) -> Result<Self> {
        let mut buf = [0u8; KEY_HEADER_SIZE];
        file.read(0, &mut buf).map_err(|e| match e {
            Error::ShortRead => Error::NotKeyFile,
            other => other,
        })?;
        Self::decode(&buf)
    }

    /// Write the header padded out to one full block.
    pub fn write_to<F: File>(&self, file: &F) -> Result<()> {
        let mut block = vec![0u8; self.block_size as usize];
        block[..KEY_HEADER_SIZE].copy_from_slice(&self.encode());
        file.write(0, &block)
    }
}

/// Header of the log file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogFileHeader {
    pub version: u16,
    pub uid: u64,
    pub appnum: u64,
    pub key_size: u16,
    pub salt: u64,
    pub pepper: u64,
    pub block_size: u32,
    /// Size of the key file when the commit began.
    pub key_file_size: u64,
    /// Size of the data file when the commit began.
    pub dat_file_size: u64,
}

impl LogFileHeader {
    pub fn encode(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut buf = [0u8; LOG_HEADER_SIZE];
        buf[0..8].copy_from_slice(LOG_MAGIC);
        field::write_u16(&mut buf[8..], self.version);
        field::write_u64(&mut buf[10..], self.uid);
        field::write_u64(&mut buf[18..], self.appnum);
        field::write_u16(&mut buf[26..], self.key_size);
        field::write_u64(&mut buf[28..], self.salt);
        field::write_u64(&mut buf[36..], self.pepper);
        field::write_u16(&mut buf[44..], self.block_size as u16);
        field::write_u64(&mut buf[46..], self.key_file_size);
        field::write_u64(&mut buf[54..], self.dat_file_size);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < LOG_HEADER_SIZE || &buf[0..8] != LOG_MAGIC {
            return Err(Error::NotLogFile);
        }
        let raw_block = field::read_u16(&buf[44..]);
        let h = Self {
            version: field::read_u16(&buf[8..]),
            uid: field::read_u64(&buf[10..]),
            appnum: field::read_u64(&buf[18..]),
            key_size: field::read_u16(&buf[26..]),
            salt: field::read_u64(&buf[28..]),
            pepper: field::read_u64(&buf[36..]),
            block_size: if raw_block == 0 {
                MAX_BLOCK_SIZE
            } else {
                u32::from(raw_block)
            },
            key_file_size: field::read_u64(&buf[46..]),
            dat_file_size: field::read_u64(&buf[54..]),
        };
        if h.version != CURRENT_VERSION {
            return Err(Error::NotLogFile);
        }
        Ok(h)
    }

    pub fn read_from<F: File>(file: &F) -> Result<Self> {
        let mut buf = [0u8; LOG_HEADER_SIZE];
        file.read(0, &mut buf).map_err(|e| match e {
            Error::ShortRead => Error::NotLogFile,
            other => other,
        })?;
        Self::decode(&buf)
    }

    pub fn write_to<F: File>(&self, file: &F) -> Result<()> {
        file.write(0, &self.encode())
    }
}

/// Check that the data and key files belong to the same database.
pub fn verify_dat_key(dh: &DatFileHeader, kh: &KeyFileHeader) -> Result<()> {
    if dh.uid != kh.uid {
        return Err(Error::UidMismatch);
    }
    if dh.appnum != kh.appnum {
        return Err(Error::AppnumMismatch);
    }
    if dh.key_size != kh.key_size {
        return Err(Error::KeySizeMismatch);
    }
    Ok(())
}

/// Check that the key file was written by hash function `H`.
pub fn verify_hasher<H: Hasher>(kh: &KeyFileHeader) -> Result<()> {
    if pepper::<H>(kh.salt) != kh.pepper {
        return Err(Error::HashMismatch);
    }
    Ok(())
}

/// Check that a log file belongs to the database described by the key
/// file header. Any disagreement means the log is not ours.
pub fn verify_log_key(lh: &LogFileHeader, kh: &KeyFileHeader) -> Result<()> {
    if lh.uid != kh.uid
        || lh.appnum != kh.appnum
        || lh.key_size != kh.key_size
        || lh.salt != kh.salt
        || lh.pepper != kh.pepper
        || lh.block_size != kh.block_size
    {
        return Err(Error::NotLogFile);
    }
    Ok(())
}

/// Derive the pepper for `salt`: the hash of the salt's own little-endian
/// bytes, seeded by the salt. Binds the hash function identity to the file.
pub fn pepper<H: Hasher>(salt: u64) -> u64 {
    hash::<H>(&salt.to_le_bytes(), salt)
}

/// Map a key hash to a bucket index.
///
/// Reducing by the power-of-two modulus first keeps the distribution
/// near-uniform while allowing a non-power-of-two bucket count.
pub fn bucket_index(h: u64, buckets: u64, modulus: u64) -> u64 {
    let n = h % modulus;
    if n >= buckets {
        n % buckets
    } else {
        n
    }
}

/// Smallest power of two that is >= `n` (and at least 1).
pub fn ceil_pow2(n: u64) -> u64 {
    n.max(1).next_power_of_two()
}

pub fn valid_block_size(block_size: u32) -> bool {
    block_size.is_power_of_two() && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
}

/// Preferred block size of the volume holding `path`.
///
/// Probing the actual device geometry is not portable; every mainstream
/// filesystem prefers the 4 KiB page, so that is what creation uses.
pub fn block_size(_path: &Path) -> u32 {
    4096
}

/// A random 64-bit salt.
pub fn make_salt() -> u64 {
    rand::thread_rng().gen()
}

/// A random nonzero database id, generated once at creation.
pub fn make_uid() -> u64 {
    loop {
        let uid: u64 = rand::thread_rng().gen();
        if uid != 0 {
            return uid;
        }
    }
}

/// Encode a fractional load factor into its 16-bit fixed-point field.
pub fn encode_load_factor(f: f64) -> u16 {
    ((65536.0 * f) as u64).min(65535) as u16
}

/// Decode the 16-bit fixed-point load factor field.
pub fn decode_load_factor(v: u16) -> f64 {
    f64::from(v) / 65536.0
}
