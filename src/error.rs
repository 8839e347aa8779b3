use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Database errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// A file that was expected to exist does not.
    NotFound,
    /// A file that was expected to be absent already exists.
    AlreadyExists,
    /// A file read returned less data than expected.
    ShortRead,
    /// A file write stored less data than expected.
    ShortWrite,
    /// An operating system I/O error.
    Io(String),
    /// The key already exists in the store.
    KeyExists,
    /// The key was not found.
    KeyNotFound,
    /// A key length does not match the key size the store was created with.
    KeySizeMismatch,
    /// The key size is outside the allowed range.
    KeySizeInvalid,
    /// The block size is not a power of two in the allowed range.
    BlockSizeInvalid,
    /// The load factor is outside (0, 1).
    LoadFactorInvalid,
    /// The file is not a data file.
    NotDataFile,
    /// The file is not a key file.
    NotKeyFile,
    /// The file is not a log file, or does not belong to this database.
    NotLogFile,
    /// The key file was created with a different hash function.
    HashMismatch,
    /// The files do not belong to the same database.
    UidMismatch,
    /// The application number does not match.
    AppnumMismatch,
    /// A data record has an invalid size, or does not match its index entry.
    InvalidRecordSize,
    /// A spill record has an invalid size.
    InvalidSpillSize,
    /// A bucket holds more entries than its capacity, or is unsorted.
    InvalidBucketCount,
    /// The bucket has no room for another entry.
    BucketFull,
    /// A log file exists; the database needs recovery before it can be opened.
    RecoverNeeded,
    /// The key file is missing.
    NoKeyFile,
    /// The store has been closed.
    StoreClosed,
    /// The store is already open.
    AlreadyOpen,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "file not found"),
            Error::AlreadyExists => write!(f, "file already exists"),
            Error::ShortRead => write!(f, "short read"),
            Error::ShortWrite => write!(f, "short write"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::KeyExists => write!(f, "key already exists"),
            Error::KeyNotFound => write!(f, "key not found"),
            Error::KeySizeMismatch => write!(f, "key size mismatch"),
            Error::KeySizeInvalid => write!(f, "invalid key size"),
            Error::BlockSizeInvalid => write!(f, "invalid block size"),
            Error::LoadFactorInvalid => write!(f, "invalid load factor"),
            Error::NotDataFile => write!(f, "not a data file"),
            Error::NotKeyFile => write!(f, "not a key file"),
            Error::NotLogFile => write!(f, "not a log file"),
            Error::HashMismatch => write!(f, "hash function mismatch"),
            Error::UidMismatch => write!(f, "uid mismatch"),
            Error::AppnumMismatch => write!(f, "appnum mismatch"),
            Error::InvalidRecordSize => write!(f, "invalid record size"),
            Error::InvalidSpillSize => write!(f, "invalid spill size"),
            Error::InvalidBucketCount => write!(f, "invalid bucket count"),
            Error::BucketFull => write!(f, "bucket full"),
            Error::RecoverNeeded => write!(f, "recovery needed, a log file exists"),
            Error::NoKeyFile => write!(f, "no key file"),
            Error::StoreClosed => write!(f, "store is closed"),
            Error::AlreadyOpen => write!(f, "store is already open"),
        }
    }
}

/// A database Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound,
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists,
            std::io::ErrorKind::UnexpectedEof => Error::ShortRead,
            _ => Error::Io(err.to_string()),
        }
    }
}
