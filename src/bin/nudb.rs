//! Admin tool: inspect, recover, rekey, verify and visit database files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use nudb::file::{File, FileMode};
use nudb::format::{DatFileHeader, KeyFileHeader, LogFileHeader};
use nudb::{recover, rekey, verify, verify_fast, visit, Result, StdFile, VerifyInfo, XxHasher};

const READ_SIZE: usize = 1024 * 1024;

#[derive(Parser)]
#[command(
    name = "nudb",
    version,
    about = "Administer append-only key/value database files"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show metadata and header information for database files
    Info {
        /// Paths of data, key or log files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Perform a database recovery
    ///
    /// A recovery should always be performed first, before any operations
    /// on the database, if a log file is present.
    Recover {
        dat: PathBuf,
        key: PathBuf,
        log: PathBuf,
    },
    /// Generate the key file for a data file
    ///
    /// Must be passed the count of items in the data file, which can be
    /// calculated with the 'visit' command. Larger buffers process
    /// faster; a buffer equal to the size of the key file is fastest.
    Rekey {
        dat: PathBuf,
        key: PathBuf,
        /// Number of items in the data file
        count: u64,
        /// Buffer size in bytes
        #[arg(long)]
        buffer: u64,
        /// Path of the guard log file (defaults next to the key file)
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Verify the integrity of a database
    ///
    /// Without a buffer a slow algorithm is used; with one, a fast
    /// algorithm whose speed grows with the buffer size.
    Verify {
        dat: PathBuf,
        key: PathBuf,
        /// Buffer size in bytes for the fast algorithm
        #[arg(long)]
        buffer: Option<u64>,
    },
    /// Iterate a data file and show item count and size histogram
    Visit { dat: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nudb: {e}.");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Info { paths } => {
            for path in paths {
                info(&path);
            }
            Ok(())
        }
        Commands::Recover { dat, key, log } => recover::<StdFile>(&dat, &key, &log),
        Commands::Rekey {
            dat,
            key,
            count,
            buffer,
            log,
        } => {
            let log = log.unwrap_or_else(|| key.with_extension("log"));
            rekey::<XxHasher, StdFile, _>(&dat, &key, &log, count, buffer as usize, |_, _| {})
        }
        Commands::Verify { dat, key, buffer } => {
            let info = match buffer {
                Some(buffer) => verify_fast::<XxHasher, StdFile>(&dat, &key, buffer as usize)?,
                None => verify::<XxHasher, StdFile>(&dat, &key, READ_SIZE)?,
            };
            print_verify(&info);
            Ok(())
        }
        Commands::Visit { dat } => {
            let mut count = 0u64;
            let mut hist = [0u64; 64];
            visit::<StdFile, _>(&dat, READ_SIZE, |_, value| {
                count += 1;
                hist[value.len().max(1).ilog2() as usize] += 1;
                Ok(())
            })?;
            println!("data file:       {}", dat.display());
            println!("items:           {}", num(count));
            println!("hist:            {}", hist_string(&hist));
            Ok(())
        }
    }
}

/// Print the header of whichever database file `path` holds.
fn info(path: &Path) {
    let file = match StdFile::open(FileMode::Read, path) {
        Ok(file) => file,
        Err(e) => {
            println!("{}: {e}", path.display());
            return;
        }
    };
    let size = match file.size() {
        Ok(size) => size,
        Err(e) => {
            println!("{}: {e}", path.display());
            return;
        }
    };
    if size < 8 {
        println!("File {} is too small to be a database file.", path.display());
        return;
    }
    let mut magic = [0u8; 8];
    if let Err(e) = file.read(0, &mut magic) {
        println!("{}: {e}", path.display());
        return;
    }

    match &magic {
        b"nudb.dat" => match DatFileHeader::read_from(&file) {
            Ok(h) => {
                println!("data file:       {}", path.display());
                println!("file size:       {}", num(size));
                println!("version:         {}", h.version);
                println!("uid:             {:#018x}", h.uid);
                println!("appnum:          {:#018x}", h.appnum);
                println!("key_size:        {}", h.key_size);
                println!();
            }
            Err(e) => println!("{}: {e}", path.display()),
        },
        b"nudb.key" => match KeyFileHeader::read_from(&file) {
            Ok(h) => {
                println!("key file:        {}", path.display());
                println!("file size:       {}", num(size));
                println!("version:         {}", h.version);
                println!("uid:             {:#018x}", h.uid);
                println!("appnum:          {:#018x}", h.appnum);
                println!("key_size:        {}", h.key_size);
                println!("salt:            {:#018x}", h.salt);
                println!("pepper:          {:#018x}", h.pepper);
                println!("block_size:      {}", num(u64::from(h.block_size)));
                println!("load_factor:     {:.2}", nudb::format::decode_load_factor(h.load_factor));
                println!("buckets:         {}", num(h.buckets));
                println!("modulus:         {}", num(h.modulus));
                println!();
            }
            Err(e) => println!("{}: {e}", path.display()),
        },
        b"nudb.log" => match LogFileHeader::read_from(&file) {
            Ok(h) => {
                println!("log file:        {}", path.display());
                println!("file size:       {}", num(size));
                println!("version:         {}", h.version);
                println!("uid:             {:#018x}", h.uid);
                println!("appnum:          {:#018x}", h.appnum);
                println!("key_size:        {}", h.key_size);
                println!("salt:            {:#018x}", h.salt);
                println!("pepper:          {:#018x}", h.pepper);
                println!("block_size:      {}", num(u64::from(h.block_size)));
                println!("key_file_size:   {}", num(h.key_file_size));
                println!("dat_file_size:   {}", num(h.dat_file_size));
                println!();
            }
            Err(e) => println!("{}: {e}", path.display()),
        },
        other => println!(
            "File {} has unknown type '{}'.",
            path.display(),
            String::from_utf8_lossy(other)
        ),
    }
}

fn print_verify(info: &VerifyInfo) {
    println!("avg_fetch:       {:.3}", info.avg_fetch);
    println!("waste:           {:.3}%", info.waste * 100.0);
    println!("overhead:        {:.1}%", info.overhead * 100.0);
    println!("actual_load:     {:.0}%", info.actual_load * 100.0);
    println!("version:         {}", info.version);
    println!("uid:             {:#018x}", info.uid);
    println!("appnum:          {:#018x}", info.appnum);
    println!("key_size:        {}", num(u64::from(info.key_size)));
    println!("salt:            {:#018x}", info.salt);
    println!("pepper:          {:#018x}", info.pepper);
    println!("block_size:      {}", num(u64::from(info.block_size)));
    println!("bucket_size:     {}", num(info.bucket_size));
    println!("load_factor:     {:.0}%", info.load_factor * 100.0);
    println!("capacity:        {}", num(info.capacity));
    println!("buckets:         {}", num(info.buckets));
    println!("key_count:       {}", num(info.key_count));
    println!("value_count:     {}", num(info.value_count));
    println!("value_bytes:     {}", num(info.value_bytes));
    println!("spill_count:     {}", num(info.spill_count));
    println!("spill_count_tot: {}", num(info.spill_count_tot));
    println!("spill_bytes:     {}", num(info.spill_bytes));
    println!("spill_bytes_tot: {}", num(info.spill_bytes_tot));
    println!("key_file_size:   {}", num(info.key_file_size));
    println!("dat_file_size:   {}", num(info.dat_file_size));
    println!("hist:            {}", hist_string(&info.hist));
}

/// Format with thousands separators.
fn num(v: u64) -> String {
    let digits = v.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Comma-separated histogram slots, trailing zeros trimmed.
fn hist_string(hist: &[u64]) -> String {
    let last = hist.iter().rposition(|&v| v != 0).unwrap_or(0);
    hist[..=last]
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
