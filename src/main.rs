mod chain;
mod error;
mod jpeg;
mod md5_state;
mod oracle;
mod output;

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time;

use log::{error, info, warn};
use structopt::StructOpt;

use chain::{ChainBuilder, ChainConfig};
use error::{Error, Result};
use md5_state::{ChainingState, Md5, MD5_IV};
use oracle::stevens::StevensOracle;

/// Builds JPEG files that all share one MD5 hash
///
/// Each output renders as the matching input image, yet every output hashes to the same value:
///
/// $ jpegcoll out/ cat.jpg dog.jpg
///
/// $ md5sum out/cat.jpg out/dog.jpg
///
/// prints the same hash twice, while each file still shows its own picture.
#[derive(Debug, StructOpt)]
#[structopt(name = "jpegcoll")]
struct Cli {
    /// Directory the colliding images are written to
    #[structopt(parse(from_os_str))]
    output_directory: PathBuf,
    /// JPEG images to collide, at least two
    #[structopt(parse(from_os_str), required = true, min_values = 2)]
    images: Vec<PathBuf>,
    /// Initial MD5 state as four comma separated 32-bit integers (decimal or 0x hex)
    #[structopt(
        long,
        value_name = "INT1,INT2,INT3,INT4",
        use_delimiter = false,
        parse(try_from_str = parse_iv)
    )]
    iv: Option<ChainingState>,
    /// File whose leading bytes are hashed before the images
    #[structopt(long, value_name = "FILE", parse(from_os_str))]
    prefix: Option<PathBuf>,
    /// Number of prefix bytes to use, defaults to the whole file
    #[structopt(long, value_name = "POS")]
    position: Option<usize>,
    /// Collision search threads, defaults to the number of CPUs
    #[structopt(short, long)]
    threads: Option<usize>,
    /// Seed for a reproducible collision search, defaults to OS entropy
    #[structopt(long)]
    seed: Option<u64>,
}

fn parse_u32(value: &str) -> std::result::Result<u32, String> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid integer {:?}: {}", value, e))
}

fn parse_iv(value: &str) -> std::result::Result<ChainingState, String> {
    let words = value
        .split(',')
        .map(parse_u32)
        .collect::<std::result::Result<Vec<u32>, String>>()?;
    if words.len() != 4 {
        return Err(format!("--iv requires 4 arguments, got {}", words.len()));
    }
    Ok([words[0], words[1], words[2], words[3]])
}

fn read_prefix(path: Option<&Path>, position: Option<usize>) -> Result<Vec<u8>> {
    let path = match path {
        Some(path) => path,
        None => {
            if position.is_some() {
                warn!("--position has no effect without --prefix");
            }
            return Ok(Vec::new());
        }
    };

    let mut bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    if let Some(position) = position {
        if position > bytes.len() {
            return Err(Error::PrefixTooShort {
                wanted: position,
                available: bytes.len(),
            });
        }
        bytes.truncate(position);
    }
    info!("Using {} prefix bytes from {}", bytes.len(), path.display());
    Ok(bytes)
}

fn run(args: Cli) -> Result<()> {
    let start = time::Instant::now();

    let images = jpeg::load_images(&args.images)?;
    let config = ChainConfig {
        iv: args.iv.unwrap_or(MD5_IV),
        prefix: read_prefix(args.prefix.as_deref(), args.position)?,
    };

    let threads = args.threads.unwrap_or_else(num_cpus::get);
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
    {
        warn!("Could not size the search thread pool: {}", e);
    }
    let oracle = StevensOracle::new(threads, args.seed);

    let mut layout = ChainBuilder::new(&config, Md5, &oracle).build(&images)?;
    output::write_outputs(&mut layout, &images, &args.output_directory)?;

    if config.prefix.is_empty() && config.iv == MD5_IV {
        info!(
            "All {} images have MD5 {:x}",
            images.len(),
            md5::compute(&layout.buffer)
        );
    }
    info!("Completed in {} seconds", start.elapsed().as_secs_f32());
    Ok(())
}

fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let args = Cli::from_args();
    if let Err(e) = run(args) {
        error!("{}", e);
        process::exit(1);
    }
}
