//! Offline integrity check.
//!
//! Two algorithms produce the same report. The slow one needs almost no
//! memory: it walks every bucket chain and then streams the data file,
//! locating each record in its bucket. The fast one materializes the
//! expected contents of a window of buckets from the data file, the way
//! rekey does, and cross-checks the window against the on-disk chains;
//! larger buffers mean fewer passes over the data file.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::bucket::{
    read_spill, Bucket, BucketEntry, BUCKET_ENTRY_SIZE, BUCKET_HEADER_SIZE, SPILL_PREFIX_SIZE,
};
use crate::bulkio::BulkReader;
use crate::error::{Error, Result};
use crate::field;
use crate::file::{File, FileMode};
use crate::format::{
    bucket_index, decode_load_factor, verify_dat_key, verify_hasher, DatFileHeader,
    KeyFileHeader, DAT_HEADER_SIZE,
};
use crate::hash::{hash, Hasher};

/// The report produced by [`verify`] and [`verify_fast`].
#[derive(Clone, Debug, Serialize)]
pub struct VerifyInfo {
    pub version: u16,
    pub uid: u64,
    pub appnum: u64,
    pub key_size: u16,
    pub salt: u64,
    pub pepper: u64,
    pub block_size: u32,
    pub load_factor: f64,
    /// Entries per bucket.
    pub capacity: u64,
    pub buckets: u64,
    /// Bytes of a full bucket payload.
    pub bucket_size: u64,
    pub key_file_size: u64,
    pub dat_file_size: u64,
    /// Entries reachable through the bucket chains.
    pub key_count: u64,
    /// Data records in the data file.
    pub value_count: u64,
    pub value_bytes: u64,
    /// Spill records reachable from bucket chains.
    pub spill_count: u64,
    /// All spill records in the data file, including abandoned ones.
    pub spill_count_tot: u64,
    pub spill_bytes: u64,
    pub spill_bytes_tot: u64,
    /// Mean number of block reads to fetch a key.
    pub avg_fetch: f64,
    /// Fraction of the data file occupied by unreachable spills.
    pub waste: f64,
    /// Storage overhead relative to key and value payload.
    pub overhead: f64,
    /// Achieved entries-per-capacity ratio.
    pub actual_load: f64,
    /// Histogram of log2(value size), 64 slots.
    pub hist: Vec<u64>,
}

struct Checked<F: File> {
    df: F,
    kf: F,
    kh: KeyFileHeader,
    dat_size: u64,
}

fn open_pair<H: Hasher, F: File>(dat_path: &Path, key_path: &Path) -> Result<Checked<F>> {
    let df = F::open(FileMode::Read, dat_path)?;
    let kf = F::open(FileMode::Read, key_path).map_err(|e| match e {
        Error::NotFound => Error::NoKeyFile,
        other => other,
    })?;
    let dh = DatFileHeader::read_from(&df)?;
    let kh = KeyFileHeader::read_from(&kf)?;
    verify_dat_key(&dh, &kh)?;
    verify_hasher::<H>(&kh)?;
    if kf.size()? != kh.key_file_size() {
        return Err(Error::ShortRead);
    }
    let dat_size = df.size()?;
    Ok(Checked {
        df,
        kf,
        kh,
        dat_size,
    })
}

fn new_info(c: &Checked<impl File>) -> VerifyInfo {
    let kh = &c.kh;
    let capacity = kh.capacity() as u64;
    VerifyInfo {
        version: kh.version,
        uid: kh.uid,
        appnum: kh.appnum,
        key_size: kh.key_size,
        salt: kh.salt,
        pepper: kh.pepper,
        block_size: kh.block_size,
        load_factor: decode_load_factor(kh.load_factor),
        capacity,
        buckets: kh.buckets,
        bucket_size: (BUCKET_HEADER_SIZE + capacity as usize * BUCKET_ENTRY_SIZE) as u64,
        key_file_size: kh.key_file_size(),
        dat_file_size: c.dat_size,
        key_count: 0,
        value_count: 0,
        value_bytes: 0,
        spill_count: 0,
        spill_count_tot: 0,
        spill_bytes: 0,
        spill_bytes_tot: 0,
        avg_fetch: 0.0,
        waste: 0.0,
        overhead: 0.0,
        actual_load: 0.0,
        hist: vec![0; 64],
    }
}

/// Walk the chain of bucket `n`, calling `visit` with each link's bucket
/// image and its depth (0 = the key-file block). Chain statistics go into
/// `info`; `fetch_cost` accumulates entries weighted by depth + 1.
fn walk_chain<F: File>(
    c: &Checked<F>,
    n: u64,
    info: &mut VerifyInfo,
    fetch_cost: &mut u64,
    mut visit: impl FnMut(&mut [u8]) -> Result<()>,
) -> Result<()> {
    let block_size = c.kh.block_size as usize;
    let mut block = vec![0u8; block_size];
    c.kf.read(c.kh.bucket_offset(n), &mut block)?;
    let mut depth = 0u64;
    let mut prev_spill = u64::MAX;
    loop {
        let spill = {
            let b = Bucket::new(&mut block);
            b.validate()?;
            info.key_count += b.count() as u64;
            *fetch_cost += (depth + 1) * b.count() as u64;
            b.spill()
        };
        visit(&mut block)?;
        if spill == 0 {
            return Ok(());
        }
        // The head bucket links the newest spill and each link points at
        // an older one, so offsets strictly decrease along the chain.
        // That also rules out cycles.
        if spill >= c.dat_size || spill >= prev_spill {
            return Err(Error::InvalidSpillSize);
        }
        prev_spill = spill;
        read_spill(&c.df, spill, &mut block)?;
        info.spill_count += 1;
        info.spill_bytes += (SPILL_PREFIX_SIZE + block.len()) as u64;
        depth += 1;
    }
}

fn finish(info: &mut VerifyInfo, fetch_cost: u64) {
    if info.value_count > 0 {
        info.avg_fetch = fetch_cost as f64 / info.value_count as f64;
    }
    if info.dat_file_size > 0 {
        info.waste =
            info.spill_bytes_tot.saturating_sub(info.spill_bytes) as f64 / info.dat_file_size as f64;
    }
    let payload = info.key_count * u64::from(info.key_size) + info.value_bytes;
    if payload > 0 {
        info.overhead = (info.key_file_size + info.dat_file_size) as f64 / payload as f64 - 1.0;
    }
    if info.buckets > 0 && info.capacity > 0 {
        info.actual_load = info.key_count as f64 / (info.capacity * info.buckets) as f64;
    }
}

/// Verify integrity with a linear scan per record.
///
/// `read_size` is the streaming buffer for the data file pass.
pub fn verify<H: Hasher, F: File>(
    dat_path: &Path,
    key_path: &Path,
    read_size: usize,
) -> Result<VerifyInfo> {
    let c = open_pair::<H, F>(dat_path, key_path)?;
    let mut info = new_info(&c);
    let key_size = usize::from(c.kh.key_size);
    let mut fetch_cost = 0u64;

    // Every chain link must be well formed, and every entry must point at
    // a matching record.
    for n in 0..c.kh.buckets {
        let mut entries: Vec<BucketEntry> = Vec::new();
        walk_chain(&c, n, &mut info, &mut fetch_cost, |block| {
            let b = Bucket::new(block);
            for i in 0..b.count() {
                entries.push(b.entry(i));
            }
            Ok(())
        })?;
        for e in entries {
            let end = e.offset + 6 + key_size as u64 + e.size;
            if e.size == 0 || end > c.dat_size {
                return Err(Error::InvalidRecordSize);
            }
            let mut head = [0u8; 6];
            c.df.read(e.offset, &mut head)?;
            if field::read_u48(&head) != e.size {
                return Err(Error::InvalidRecordSize);
            }
        }
    }

    // Every record must be reachable through its bucket chain.
    let mut r = BulkReader::new(&c.df, DAT_HEADER_SIZE as u64, c.dat_size, read_size);
    while !r.eof() {
        let offset = r.offset();
        let size = field::read_u48(r.read(6)?);
        if size == 0 {
            let len = field::read_u16(r.read(2)?) as usize;
            if len < BUCKET_HEADER_SIZE {
                return Err(Error::InvalidSpillSize);
            }
            r.read(len)?;
            info.spill_count_tot += 1;
            info.spill_bytes_tot += (SPILL_PREFIX_SIZE + len) as u64;
            continue;
        }
        let data = r.read(key_size + size as usize)?;
        let h = hash::<H>(&data[..key_size], c.kh.salt);
        info.value_count += 1;
        info.value_bytes += size;
        info.hist[size.ilog2() as usize] += 1;

        let n = bucket_index(h, c.kh.buckets, c.kh.modulus);
        if !chain_contains(&c, n, h, offset, size)? {
            return Err(Error::KeyNotFound);
        }
    }

    if info.key_count != info.value_count {
        return Err(Error::InvalidBucketCount);
    }
    finish(&mut info, fetch_cost);
    debug!(keys = info.key_count, spills = info.spill_count, "verify (slow) clean");
    Ok(info)
}

/// Does the chain of bucket `n` hold an entry for (h, offset, size)?
fn chain_contains<F: File>(
    c: &Checked<F>,
    n: u64,
    h: u64,
    offset: u64,
    size: u64,
) -> Result<bool> {
    let block_size = c.kh.block_size as usize;
    let mut block = vec![0u8; block_size];
    c.kf.read(c.kh.bucket_offset(n), &mut block)?;
    loop {
        let spill = {
            let b = Bucket::new(&mut block);
            b.validate()?;
            let mut i = b.lower_bound(h);
            while i < b.count() {
                let e = b.entry(i);
                if e.hash != h {
                    break;
                }
                if e.offset == offset && e.size == size {
                    return Ok(true);
                }
                i += 1;
            }
            b.spill()
        };
        if spill == 0 {
            return Ok(false);
        }
        read_spill(&c.df, spill, &mut block)?;
    }
}

/// Verify integrity by materializing bucket windows in memory.
///
/// `buffer_size` bounds the window; a buffer the size of the key file
/// verifies in a single pass over the data file.
pub fn verify_fast<H: Hasher, F: File>(
    dat_path: &Path,
    key_path: &Path,
    buffer_size: usize,
) -> Result<VerifyInfo> {
    let c = open_pair::<H, F>(dat_path, key_path)?;
    let mut info = new_info(&c);
    let key_size = usize::from(c.kh.key_size);
    let block_size = c.kh.block_size as usize;
    let chunk = (buffer_size / block_size).max(1) as u64;
    let mut fetch_cost = 0u64;

    let mut b0 = 0u64;
    let mut first_pass = true;
    while b0 < c.kh.buckets {
        let bn = chunk.min(c.kh.buckets - b0);
        let mut expected: Vec<Vec<BucketEntry>> = vec![Vec::new(); bn as usize];

        let mut r = BulkReader::new(&c.df, DAT_HEADER_SIZE as u64, c.dat_size, buffer_size);
        while !r.eof() {
            let offset = r.offset();
            let size = field::read_u48(r.read(6)?);
            if size == 0 {
                let len = field::read_u16(r.read(2)?) as usize;
                if len < BUCKET_HEADER_SIZE {
                    return Err(Error::InvalidSpillSize);
                }
                r.read(len)?;
                if first_pass {
                    info.spill_count_tot += 1;
                    info.spill_bytes_tot += (SPILL_PREFIX_SIZE + len) as u64;
                }
                continue;
            }
            let data = r.read(key_size + size as usize)?;
            let h = hash::<H>(&data[..key_size], c.kh.salt);
            if first_pass {
                info.value_count += 1;
                info.value_bytes += size;
                info.hist[size.ilog2() as usize] += 1;
            }
            let n = bucket_index(h, c.kh.buckets, c.kh.modulus);
            if n >= b0 && n < b0 + bn {
                expected[(n - b0) as usize].push(BucketEntry {
                    hash: h,
                    offset,
                    size,
                });
            }
        }

        for (i, mut want) in expected.into_iter().enumerate() {
            let n = b0 + i as u64;
            let mut got: Vec<BucketEntry> = Vec::with_capacity(want.len());
            walk_chain(&c, n, &mut info, &mut fetch_cost, |block| {
                let b = Bucket::new(block);
                for j in 0..b.count() {
                    got.push(b.entry(j));
                }
                Ok(())
            })?;
            if got.len() != want.len() {
                return Err(Error::InvalidBucketCount);
            }
            want.sort_unstable();
            got.sort_unstable();
            if got != want {
                return Err(Error::InvalidRecordSize);
            }
        }

        b0 += bn;
        first_pass = false;
    }

    finish(&mut info, fetch_cost);
    debug!(keys = info.key_count, spills = info.spill_count, "verify (fast) clean");
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    use crate::file::StdFile;
    use crate::hash::XxHasher;
    use crate::rekey::rekey;
    use crate::store::{create, Store, StoreOptions};

    type TestStore = Store<XxHasher, StdFile>;

    const READ_SIZE: usize = 1024 * 1024;

    fn db_paths(dir: &TempDir) -> (PathBuf, PathBuf, PathBuf) {
        (
            dir.path().join("v.dat"),
            dir.path().join("v.key"),
            dir.path().join("v.log"),
        )
    }

    fn populate(dir: &TempDir, count: u64, block_size: u32) {
        let (dat, key, log) = db_paths(dir);
        create::<XxHasher, StdFile>(&dat, &key, &log, 3, 42, 8, block_size, 0.5).unwrap();
        let store = TestStore::open(&dat, &key, &log, StoreOptions::default()).unwrap();
        for i in 0..count {
            store.insert(&i.to_le_bytes(), &[0xCD; 32]).unwrap();
        }
        store.close().unwrap();
    }

    #[test]
    fn slow_verify_reports_counts() {
        let dir = TempDir::new().unwrap();
        populate(&dir, 1000, 4096);
        let (dat, key, _) = db_paths(&dir);

        let info = verify::<XxHasher, StdFile>(&dat, &key, READ_SIZE).unwrap();
        assert_eq!(info.key_count, 1000);
        assert_eq!(info.value_count, 1000);
        assert_eq!(info.value_bytes, 32_000);
        assert_eq!(info.hist[5], 1000);
        assert_eq!(info.hist.iter().sum::<u64>(), 1000);
        assert!(info.avg_fetch >= 1.0);
        assert!(info.overhead > 0.0);
    }

    #[test]
    fn fast_verify_matches_slow() {
        let dir = TempDir::new().unwrap();
        // A small block size forces spill chains.
        populate(&dir, 600, 512);
        let (dat, key, _) = db_paths(&dir);

        let slow = verify::<XxHasher, StdFile>(&dat, &key, READ_SIZE).unwrap();
        // A one-block window and a full-size buffer must agree.
        for buffer in [512usize, 1 << 20] {
            let fast = verify_fast::<XxHasher, StdFile>(&dat, &key, buffer).unwrap();
            assert_eq!(fast.key_count, slow.key_count);
            assert_eq!(fast.value_count, slow.value_count);
            assert_eq!(fast.value_bytes, slow.value_bytes);
            assert_eq!(fast.spill_count, slow.spill_count);
            assert_eq!(fast.spill_bytes, slow.spill_bytes);
            assert_eq!(fast.spill_count_tot, slow.spill_count_tot);
            assert_eq!(fast.hist, slow.hist);
            assert_eq!(fast.avg_fetch, slow.avg_fetch);
        }
        assert!(slow.spill_count > 0);
        assert!(slow.avg_fetch > 1.0);
    }

    #[test]
    fn rekey_then_verify_is_clean_and_loaded_as_configured() {
        let dir = TempDir::new().unwrap();
        populate(&dir, 1000, 4096);
        let (dat, key, log) = db_paths(&dir);
        std::fs::remove_file(&key).unwrap();

        rekey::<XxHasher, StdFile, _>(&dat, &key, &log, 1000, 1 << 20, |_, _| {}).unwrap();

        let info = verify::<XxHasher, StdFile>(&dat, &key, READ_SIZE).unwrap();
        assert_eq!(info.key_count, 1000);
        // The rekey targets a load factor of 0.5.
        assert!((info.actual_load - 0.5).abs() < 0.05, "{}", info.actual_load);

        let fast = verify_fast::<XxHasher, StdFile>(&dat, &key, 1 << 20).unwrap();
        assert_eq!(fast.key_count, 1000);
    }

    #[test]
    fn a_scribbled_bucket_entry_is_caught() {
        let dir = TempDir::new().unwrap();
        populate(&dir, 100, 4096);
        let (dat, key, _) = db_paths(&dir);

        // Flip the offset field of the first entry of the first occupied
        // bucket.
        let kf = StdFile::open(FileMode::Write, &key).unwrap();
        let kh = KeyFileHeader::read_from(&kf).unwrap();
        let mut block = vec![0u8; kh.block_size as usize];
        let mut target = None;
        for n in 0..kh.buckets {
            kf.read(kh.bucket_offset(n), &mut block).unwrap();
            if Bucket::new(&mut block).count() > 0 {
                target = Some(n);
                break;
            }
        }
        let n = target.expect("an occupied bucket");
        let at = BUCKET_HEADER_SIZE + 8; // first entry's offset field
        block[at] ^= 0xFF;
        kf.write(kh.bucket_offset(n), &block).unwrap();
        drop(kf);

        assert!(verify::<XxHasher, StdFile>(&dat, &key, READ_SIZE).is_err());
        assert!(verify_fast::<XxHasher, StdFile>(&dat, &key, 1 << 20).is_err());
    }

    #[test]
    fn truncated_key_file_is_caught() {
        let dir = TempDir::new().unwrap();
        populate(&dir, 100, 4096);
        let (dat, key, _) = db_paths(&dir);

        let kf = StdFile::open(FileMode::Write, &key).unwrap();
        let len = kf.size().unwrap();
        kf.trunc(len - 1).unwrap();
        drop(kf);

        assert_eq!(
            verify::<XxHasher, StdFile>(&dat, &key, READ_SIZE).err(),
            Some(Error::ShortRead)
        );
    }
}
