//! A bucket is one fixed-size block of the key file: a small sorted array
//! of (hash, offset, size) entries plus an optional spill pointer to a
//! continuation bucket stored in the data file.
//!
//! The view borrows an externally owned block so the same code serves
//! fetch buffers, the commit pipeline's staging blocks, and the windowed
//! buffers used by rekey and verify.

use crate::bulkio::BulkWriter;
use crate::error::{Error, Result};
use crate::field;
use crate::file::File;

/// Bucket header: `count:u16 | spill:u48`.
pub const BUCKET_HEADER_SIZE: usize = 8;

/// Bucket entry: `hash:u64 | offset:u48 | size:u48`.
pub const BUCKET_ENTRY_SIZE: usize = 20;

/// Framing of a spill record ahead of its payload: a zero 48-bit size
/// marker and the 16-bit payload length.
pub const SPILL_PREFIX_SIZE: usize = 8;

/// Entries that fit in one block of `block_size` bytes.
pub fn bucket_capacity(block_size: usize) -> usize {
    block_size.saturating_sub(BUCKET_HEADER_SIZE) / BUCKET_ENTRY_SIZE
}

/// One index entry pointing at a data record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BucketEntry {
    pub hash: u64,
    pub offset: u64,
    pub size: u64,
}

/// Mutable view over a bucket block.
pub struct Bucket<'a> {
    block: &'a mut [u8],
}

impl<'a> Bucket<'a> {
    /// View an existing block without touching its contents.
    pub fn new(block: &'a mut [u8]) -> Self {
        debug_assert!(block.len() >= BUCKET_HEADER_SIZE);
        Self { block }
    }

    /// View a block and reset it to the empty bucket.
    pub fn empty(block: &'a mut [u8]) -> Self {
        let mut b = Self::new(block);
        b.clear();
        b
    }

    pub fn count(&self) -> usize {
        field::read_u16(self.block) as usize
    }

    fn set_count(&mut self, count: usize) {
        field::write_u16(self.block, count as u16);
    }

    /// Offset of the continuation bucket in the data file, or 0.
    pub fn spill(&self) -> u64 {
        field::read_u48(&self.block[2..])
    }

    pub fn set_spill(&mut self, offset: u64) {
        field::write_u48(&mut self.block[2..], offset);
    }

    /// Reset to an empty bucket with no spill.
    pub fn clear(&mut self) {
        self.block[..BUCKET_HEADER_SIZE].fill(0);
    }

    pub fn capacity(&self) -> usize {
        bucket_capacity(self.block.len())
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity()
    }

    /// Bytes of the block actually occupied by the header and entries.
    pub fn actual_size(&self) -> usize {
        BUCKET_HEADER_SIZE + self.count() * BUCKET_ENTRY_SIZE
    }

    pub fn entry(&self, i: usize) -> BucketEntry {
        debug_assert!(i < self.count());
        let at = BUCKET_HEADER_SIZE + i * BUCKET_ENTRY_SIZE;
        BucketEntry {
            hash: field::read_u64(&self.block[at..]),
            offset: field::read_u48(&self.block[at + 8..]),
            size: field::read_u48(&self.block[at + 14..]),
        }
    }

    fn put_entry(&mut self, i: usize, e: BucketEntry) {
        let at = BUCKET_HEADER_SIZE + i * BUCKET_ENTRY_SIZE;
        field::write_u64(&mut self.block[at..], e.hash);
        field::write_u48(&mut self.block[at + 8..], e.offset);
        field::write_u48(&mut self.block[at + 14..], e.size);
    }

    /// Index of the first entry whose hash is >= `hash`.
    pub fn lower_bound(&self, hash: u64) -> usize {
        let mut lo = 0;
        let mut hi = self.count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry(mid).hash < hash {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Insert an entry, keeping the array ordered by (hash, offset).
    pub fn insert(&mut self, offset: u64, size: u64, hash: u64) -> Result<()> {
        let count = self.count();
        if count >= self.capacity() {
            return Err(Error::BucketFull);
        }
        let mut i = self.lower_bound(hash);
        while i < count {
            let e = self.entry(i);
            if e.hash != hash || e.offset >= offset {
                break;
            }
            i += 1;
        }
        let src = BUCKET_HEADER_SIZE + i * BUCKET_ENTRY_SIZE;
        let end = BUCKET_HEADER_SIZE + count * BUCKET_ENTRY_SIZE;
        self.block.copy_within(src..end, src + BUCKET_ENTRY_SIZE);
        self.put_entry(i, BucketEntry { hash, offset, size });
        self.set_count(count + 1);
        Ok(())
    }

    /// Structural self-check: the entry count fits the block and the
    /// entries are sorted. A block that fails this was torn or corrupted.
    pub fn validate(&self) -> Result<()> {
        let count = self.count();
        if count > self.capacity() {
            return Err(Error::InvalidBucketCount);
        }
        for i in 1..count {
            let a = self.entry(i - 1);
            let b = self.entry(i);
            if (b.hash, b.offset) < (a.hash, a.offset) {
                return Err(Error::InvalidBucketCount);
            }
        }
        Ok(())
    }
}

/// If `bucket` has no room left, append its contents to the data file as
/// a spill record, then reset it to empty with the spill linked in.
/// Returns whether a spill was written.
///
/// The freshly emptied bucket receives subsequent inserts, so a chain is
/// ordered newest-first from the key file outward.
pub fn maybe_spill<F: File>(bucket: &mut Bucket, writer: &mut BulkWriter<F>) -> Result<bool> {
    if !bucket.is_full() {
        return Ok(false);
    }
    let used = bucket.actual_size();
    let (offset, mem) = writer.prepare(SPILL_PREFIX_SIZE + used)?;
    field::write_u48(mem, 0);
    field::write_u16(&mut mem[6..], used as u16);
    mem[SPILL_PREFIX_SIZE..].copy_from_slice(&bucket.block[..used]);
    bucket.clear();
    bucket.set_spill(offset);
    Ok(true)
}

/// Read the spill record at `offset` in the data file, returning its
/// payload (a bucket block image) in `block`.
pub fn read_spill<F: File>(file: &F, offset: u64, block: &mut Vec<u8>) -> Result<()> {
    let mut prefix = [0u8; SPILL_PREFIX_SIZE];
    file.read(offset, &mut prefix)?;
    if field::read_u48(&prefix) != 0 {
        return Err(Error::InvalidSpillSize);
    }
    let len = field::read_u16(&prefix[6..]) as usize;
    if len < BUCKET_HEADER_SIZE {
        return Err(Error::InvalidSpillSize);
    }
    block.resize(len, 0);
    file.read(offset + SPILL_PREFIX_SIZE as u64, block)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfile::MemFile;

    #[test]
    fn capacity_formula() {
        assert_eq!(bucket_capacity(4096), (4096 - 8) / 20);
        assert_eq!(bucket_capacity(512), 25);
        assert_eq!(bucket_capacity(8), 0);
    }

    #[test]
    fn empty_bucket_has_no_entries_or_spill() {
        let mut block = vec![0xAAu8; 512];
        let b = Bucket::empty(&mut block);
        assert_eq!(b.count(), 0);
        assert_eq!(b.spill(), 0);
        assert!(!b.is_full());
        assert_eq!(b.actual_size(), BUCKET_HEADER_SIZE);
    }

    #[test]
    fn insert_keeps_entries_sorted() {
        let mut block = vec![0u8; 512];
        let mut b = Bucket::empty(&mut block);

        b.insert(300, 10, 5).unwrap();
        b.insert(100, 10, 1).unwrap();
        b.insert(200, 10, 9).unwrap();
        b.insert(400, 10, 5).unwrap();
        b.insert(250, 10, 5).unwrap();

        let hashes: Vec<u64> = (0..b.count()).map(|i| b.entry(i).hash).collect();
        assert_eq!(hashes, vec![1, 5, 5, 5, 9]);

        // Equal hashes tie-break by offset.
        let offsets: Vec<u64> = (1..4).map(|i| b.entry(i).offset).collect();
        assert_eq!(offsets, vec![250, 300, 400]);

        b.validate().unwrap();
    }

    #[test]
    fn lower_bound_finds_first_match() {
        let mut block = vec![0u8; 512];
        let mut b = Bucket::empty(&mut block);
        for (i, h) in [2u64, 4, 4, 8].iter().enumerate() {
            b.insert(i as u64 * 100, 1, *h).unwrap();
        }
        assert_eq!(b.lower_bound(1), 0);
        assert_eq!(b.lower_bound(4), 1);
        assert_eq!(b.lower_bound(5), 3);
        assert_eq!(b.lower_bound(9), 4);
    }

    #[test]
    fn insert_into_full_bucket_fails() {
        let mut block = vec![0u8; 512];
        let mut b = Bucket::empty(&mut block);
        let cap = b.capacity();
        for i in 0..cap {
            b.insert(i as u64, 1, i as u64).unwrap();
        }
        assert!(b.is_full());
        assert_eq!(b.insert(999, 1, 999).err(), Some(Error::BucketFull));
    }

    #[test]
    fn validate_rejects_garbage() {
        let mut block = vec![0u8; 512];
        {
            let mut b = Bucket::empty(&mut block);
            b.insert(100, 1, 7).unwrap();
            b.insert(200, 1, 3).unwrap();
        }
        // Overwrite the count with something impossible.
        field::write_u16(&mut block, 999);
        assert_eq!(
            Bucket::new(&mut block).validate().err(),
            Some(Error::InvalidBucketCount)
        );

        // Unsorted entries are also rejected.
        let mut block = vec![0u8; 512];
        let mut b = Bucket::empty(&mut block);
        b.insert(100, 1, 7).unwrap();
        b.insert(200, 1, 3).unwrap();
        b.validate().unwrap();
        let at = BUCKET_HEADER_SIZE;
        field::write_u64(&mut block[at..], 9); // first entry now largest
        assert_eq!(
            Bucket::new(&mut block).validate().err(),
            Some(Error::InvalidBucketCount)
        );
    }

    #[test]
    fn spill_round_trip() {
        let mut block = vec![0u8; 512];
        let mut b = Bucket::empty(&mut block);
        let cap = b.capacity();
        for i in 0..cap {
            b.insert(i as u64 * 10, 3, i as u64).unwrap();
        }

        let file = MemFile::new();
        let mut writer = BulkWriter::new(&file, 64, 4096);
        assert!(maybe_spill(&mut b, &mut writer).unwrap());
        writer.flush().unwrap();

        // The bucket was reset and linked to the spill.
        assert_eq!(b.count(), 0);
        let spill_at = b.spill();
        assert_eq!(spill_at, 64);

        let mut payload = Vec::new();
        read_spill(&file, spill_at, &mut payload).unwrap();
        let spilled = Bucket::new(&mut payload);
        assert_eq!(spilled.count(), cap);
        assert_eq!(spilled.entry(1).hash, 1);
        assert_eq!(spilled.entry(1).offset, 10);
        spilled.validate().unwrap();
    }

    #[test]
    fn maybe_spill_leaves_unfull_buckets_alone() {
        let mut block = vec![0u8; 512];
        let mut b = Bucket::empty(&mut block);
        b.insert(10, 1, 1).unwrap();

        let file = MemFile::new();
        let mut writer = BulkWriter::new(&file, 0, 4096);
        assert!(!maybe_spill(&mut b, &mut writer).unwrap());
        writer.flush().unwrap();

        assert_eq!(b.count(), 1);
        assert_eq!(b.spill(), 0);
        assert_eq!(file.size().unwrap(), 0);
    }

    #[test]
    fn read_spill_rejects_data_records() {
        let file = MemFile::new();
        // A data record starts with a nonzero 48-bit size.
        let mut rec = vec![0u8; 16];
        field::write_u48(&mut rec, 5);
        file.write(0, &rec).unwrap();

        let mut payload = Vec::new();
        assert_eq!(
            read_spill(&file, 0, &mut payload).err(),
            Some(Error::InvalidSpillSize)
        );
    }
}
