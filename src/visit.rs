//! Sequential iteration over every record in a data file.
//!
//! Only the data file is needed, so this works even when the key file is
//! lost; it is how an operator counts items before a rekey.

use std::path::Path;

use crate::bucket::BUCKET_HEADER_SIZE;
use crate::bulkio::BulkReader;
use crate::error::{Error, Result};
use crate::field;
use crate::file::{File, FileMode};
use crate::format::{DatFileHeader, DAT_HEADER_SIZE};

/// Stream all data records in file order, calling `f(key, value)` for
/// each. Spill records are skipped. Iteration stops early if `f` returns
/// an error.
pub fn visit<F, C>(dat_path: &Path, read_size: usize, mut f: C) -> Result<()>
where
    F: File,
    C: FnMut(&[u8], &[u8]) -> Result<()>,
{
    let df = F::open(FileMode::Scan, dat_path)?;
    let dh = DatFileHeader::read_from(&df)?;
    let dat_size = df.size()?;
    let key_size = usize::from(dh.key_size);

    let mut r = BulkReader::new(&df, DAT_HEADER_SIZE as u64, dat_size, read_size);
    while !r.eof() {
        let size = field::read_u48(r.read(6)?);
        if size == 0 {
            let len = field::read_u16(r.read(2)?) as usize;
            if len < BUCKET_HEADER_SIZE {
                return Err(Error::InvalidSpillSize);
            }
            r.read(len)?;
            continue;
        }
        let data = r.read(key_size + size as usize)?;
        f(&data[..key_size], &data[key_size..])?;
    }
    Ok(())
}
