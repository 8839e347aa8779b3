//! An append-only, insert-only key/value store for write-once datasets.
//!
//! Keys are fixed-width, values are variable-length, and lookup is by
//! exact key. There is no delete, no update and no iteration by key. A
//! database is three files: the data file (records), the key file (the
//! hashed-bucket index) and a log file that exists only while a commit is
//! in flight; if a log file is present at open, run [`recover`] first.

pub mod arena;
pub mod bucket;
pub mod bulkio;
pub mod error;
pub mod field;
pub mod file;
pub mod format;
pub mod hash;
pub mod memfile;
pub mod pool;
pub mod recover;
pub mod rekey;
pub mod store;
pub mod verify;
pub mod visit;

pub use error::{Error, Result};
pub use file::{File, FileMode, StdFile};
pub use hash::{Hasher, XxHasher};
pub use memfile::MemFile;
pub use recover::recover;
pub use rekey::rekey;
pub use store::{create, Store, StoreOptions};
pub use verify::{verify, verify_fast, VerifyInfo};
pub use visit::visit;
