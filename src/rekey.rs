//! Rebuild the key file for an existing data file.
//!
//! The data file is the authoritative copy of every record, so a lost or
//! corrupt key file can be reconstructed from it. The algorithm renders a
//! window of buckets in memory and streams the whole data file once per
//! window; a buffer large enough to hold the entire key file needs only
//! a single pass.

use std::path::Path;

use tracing::info;

use crate::bucket::{bucket_capacity, maybe_spill, Bucket};
use crate::bulkio::{BulkReader, BulkWriter, BULK_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::field;
use crate::file::{File, FileMode};
use crate::format::{
    self, bucket_index, ceil_pow2, encode_load_factor, make_salt, pepper, DatFileHeader,
    KeyFileHeader, LogFileHeader, CURRENT_VERSION, DAT_HEADER_SIZE,
};
use crate::hash::{hash, Hasher};

const REKEY_LOAD_FACTOR: f64 = 0.5;

/// Build a fresh key file for `dat_path`.
///
/// `item_count` is the number of records in the data file (countable with
/// [`crate::visit`]); it sizes the bucket array. `buffer_size` bounds the
/// in-memory bucket window. A log file guards the operation: it records a
/// key file size of zero, so recovery after a crash mid-rekey erases the
/// partial key file and rolls back any spills appended to the data file.
///
/// `progress` is called with (amount done, total amount), where the total
/// is the data file size times the number of passes.
pub fn rekey<H, F, P>(
    dat_path: &Path,
    key_path: &Path,
    log_path: &Path,
    item_count: u64,
    buffer_size: usize,
    mut progress: P,
) -> Result<()>
where
    H: Hasher,
    F: File,
    P: FnMut(u64, u64),
{
    let df = F::open(FileMode::Append, dat_path)?;
    let dh = DatFileHeader::read_from(&df)?;
    let dat_size = df.size()?;

    let block_size = format::block_size(key_path);
    let capacity = bucket_capacity(block_size as usize) as u64;
    let per_bucket = ((capacity as f64 * REKEY_LOAD_FACTOR) as u64).max(1);
    let buckets = item_count.div_ceil(per_bucket).max(1);
    let salt = make_salt();
    let kh = KeyFileHeader {
        version: CURRENT_VERSION,
        uid: dh.uid,
        appnum: dh.appnum,
        salt,
        pepper: pepper::<H>(salt),
        block_size,
        key_size: dh.key_size,
        load_factor: encode_load_factor(REKEY_LOAD_FACTOR),
        buckets,
        modulus: ceil_pow2(buckets),
    };

    // The guard log. Its presence makes a crashed rekey recoverable, so
    // it must be durable before the key file exists.
    let lf = match F::create(FileMode::Append, log_path) {
        Ok(lf) => lf,
        Err(Error::AlreadyExists) => return Err(Error::RecoverNeeded),
        Err(e) => return Err(e),
    };
    let guard = LogFileHeader {
        version: CURRENT_VERSION,
        uid: kh.uid,
        appnum: kh.appnum,
        key_size: kh.key_size,
        salt: kh.salt,
        pepper: kh.pepper,
        block_size: kh.block_size,
        key_file_size: 0,
        dat_file_size: dat_size,
    };
    if let Err(e) = guard.write_to(&lf).and_then(|_| lf.sync()) {
        let _ = F::erase(log_path);
        return Err(e);
    }

    let kf = match F::create(FileMode::Write, key_path) {
        Ok(kf) => kf,
        Err(e) => {
            // Nothing was built; removing the guard keeps a pre-existing
            // key file out of recovery's reach.
            let _ = F::erase(log_path);
            return Err(e);
        }
    };
    // From here on, failures leave the guard log in place and recovery
    // cleans up.
    kh.write_to(&kf)?;
    kf.trunc(kh.key_file_size())?;

    let block_size = block_size as usize;
    let chunk = (buffer_size / block_size).max(1) as u64;
    let passes = buckets.div_ceil(chunk);
    let total = passes * dat_size;
    let key_size = usize::from(kh.key_size);

    let mut dw = BulkWriter::new(&df, dat_size, BULK_BUFFER_SIZE);
    let mut npass = 0u64;
    let mut b0 = 0u64;
    while b0 < buckets {
        let bn = chunk.min(buckets - b0);
        let mut window = vec![0u8; bn as usize * block_size];

        let mut r = BulkReader::new(&df, DAT_HEADER_SIZE as u64, dat_size, BULK_BUFFER_SIZE);
        while !r.eof() {
            let offset = r.offset();
            let size = field::read_u48(r.read(6)?);
            if size == 0 {
                // A spill record from an earlier commit; skip it.
                let len = field::read_u16(r.read(2)?) as usize;
                r.read(len)?;
                continue;
            }
            let data = r.read(key_size + size as usize)?;
            let h = hash::<H>(&data[..key_size], kh.salt);
            let n = bucket_index(h, kh.buckets, kh.modulus);
            progress(npass * dat_size + r.offset(), total);
            if n < b0 || n >= b0 + bn {
                continue;
            }
            let at = (n - b0) as usize * block_size;
            let mut bucket = Bucket::new(&mut window[at..at + block_size]);
            maybe_spill(&mut bucket, &mut dw)?;
            bucket.insert(offset, size, h)?;
        }

        kf.write(kh.bucket_offset(b0), &window)?;
        b0 += bn;
        npass += 1;
    }

    dw.flush()?;
    df.sync()?;
    kf.sync()?;
    drop(lf);
    F::erase(log_path)?;
    progress(total, total);
    info!(buckets, passes, items = item_count, "rekey complete");
    Ok(())
}
