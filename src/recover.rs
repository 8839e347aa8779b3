//! Crash recovery: consume a log file left behind by an interrupted
//! commit or rekey, restoring the data and key files to their
//! pre-operation state.

use std::path::Path;

use tracing::{debug, info};

use crate::bulkio::BulkReader;
use crate::error::{Error, Result};
use crate::field;
use crate::file::{File, FileMode};
use crate::format::{verify_log_key, KeyFileHeader, LogFileHeader, LOG_HEADER_SIZE};

const LOG_READ_SIZE: usize = 1024 * 1024;

/// Replay the log file, if present.
///
/// Each log record holds the before-image of one key-file bucket; writing
/// them back and truncating both files to their logged sizes leaves the
/// database byte-identical to the moment before the interrupted commit
/// began. A log whose header never finished writing is simply discarded:
/// the commit had not yet touched either file. Recovery is idempotent
/// and safe to re-run; with no log present it does nothing.
pub fn recover<F: File>(dat_path: &Path, key_path: &Path, log_path: &Path) -> Result<()> {
    let lf = match F::open(FileMode::Scan, log_path) {
        Ok(lf) => lf,
        Err(Error::NotFound) => return Ok(()),
        Err(e) => return Err(e),
    };
    let log_size = lf.size()?;
    if log_size < LOG_HEADER_SIZE as u64 {
        debug!("discarding log with incomplete header");
        drop(lf);
        return F::erase(log_path);
    }
    let lh = LogFileHeader::read_from(&lf)?;

    // A zero key file size marks an interrupted rekey: the key file under
    // construction is abandoned entirely.
    if lh.key_file_size == 0 {
        let df = F::open(FileMode::Write, dat_path)?;
        df.trunc(lh.dat_file_size)?;
        df.sync()?;
        match F::erase(key_path) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        drop(lf);
        F::erase(log_path)?;
        info!("recovered from an interrupted rekey");
        return Ok(());
    }

    let kf = F::open(FileMode::Write, key_path).map_err(|e| match e {
        Error::NotFound => Error::NoKeyFile,
        other => other,
    })?;
    let kh = KeyFileHeader::read_from(&kf)?;
    verify_log_key(&lh, &kh)?;
    let df = F::open(FileMode::Write, dat_path)?;

    let block_size = kh.block_size as usize;
    let mut reader = BulkReader::new(&lf, LOG_HEADER_SIZE as u64, log_size, LOG_READ_SIZE);
    let mut restored = 0u64;
    while !reader.eof() {
        // A record torn at the end of the log was never made durable by
        // the writer, so everything before it is complete and the tail
        // can be ignored.
        let n = match reader.read(8) {
            Ok(buf) => field::read_u64(buf),
            Err(Error::ShortRead) => break,
            Err(e) => return Err(e),
        };
        if n >= kh.buckets {
            return Err(Error::NotLogFile);
        }
        let block = match reader.read(block_size) {
            Ok(block) => block,
            Err(Error::ShortRead) => break,
            Err(e) => return Err(e),
        };
        kf.write(kh.bucket_offset(n), block)?;
        restored += 1;
    }

    drop(reader);
    kf.trunc(lh.key_file_size)?;
    df.trunc(lh.dat_file_size)?;
    kf.sync()?;
    df.sync()?;
    drop(lf);
    F::erase(log_path)?;
    info!(
        buckets = restored,
        key_file_size = lh.key_file_size,
        dat_file_size = lh.dat_file_size,
        "recovery complete"
    );
    Ok(())
}
