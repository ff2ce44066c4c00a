use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use blockfs_codecs::{ZstdCodec, ZstdMode};
use blockfs_core::format::DEFAULT_BLOCK_SIZE;
use blockfs_core::{Compressor, Configuration, OptionParse, Reader, Writer};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "blockfs",
    about = "Build, append to, and inspect zstd-compressed block images",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a file into a new image
    Create {
        /// Source file ("-" reads stdin)
        input: PathBuf,
        /// Destination image
        image: PathBuf,
        /// Raw bytes per block
        #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u32,
        /// zstd engine: block | stream
        #[arg(long, default_value_t = ZstdMode::Block)]
        zstd_mode: ZstdMode,
        /// Compressor options, e.g. -Xcompression-level 19 (see `blockfs usage`)
        #[arg(allow_hyphen_values = true, trailing_var_arg = true)]
        comp_opts: Vec<String>,
    },
    /// Append a file to an existing image using the image's stored options
    Append {
        /// Source file ("-" reads stdin)
        input: PathBuf,
        /// Image to extend
        image: PathBuf,
        /// Ignored: the options stored in the image always win
        #[arg(allow_hyphen_values = true, trailing_var_arg = true)]
        comp_opts: Vec<String>,
    },
    /// Decompress every block of an image back to raw bytes
    Extract {
        /// Source image
        image: PathBuf,
        /// Destination file ("-" writes to stdout)
        output: PathBuf,
    },
    /// Print superblock, compressor options and block statistics
    Inspect {
        /// Image to inspect
        image: PathBuf,
        /// Print per-block details
        #[arg(long)]
        blocks: bool,
    },
    /// Print the compressor's option help
    Usage,
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

/// Offer each token to the compressor's option parser, mksquashfs style.
fn parse_compressor_options(
    codec: &dyn Compressor,
    config: &mut Configuration,
    opts: &[String],
) -> anyhow::Result<()> {
    let mut i = 0;
    while i < opts.len() {
        match codec.parse_option(config, &opts[i..]) {
            Ok(OptionParse::Consumed(extra)) => i += 1 + extra,
            Ok(OptionParse::Unrecognized) => {
                eprintln!("{} compressor options:\n{}", codec.name(), codec.usage());
                anyhow::bail!("unrecognised {} option {}", codec.name(), opts[i]);
            }
            Err(e) => {
                eprintln!("{} compressor options:\n{}", codec.name(), codec.usage());
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Copy `input` (or stdin for "-") into `writer`. Returns bytes read.
fn feed(input: &Path, writer: &mut Writer, block_size: usize) -> anyhow::Result<u64> {
    let mut src: Box<dyn Read> = if input.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        Box::new(BufReader::new(
            File::open(input).with_context(|| format!("opening input file {:?}", input))?,
        ))
    };

    let mut buf = vec![0u8; block_size];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

fn report(
    image: &Path,
    codec: &dyn Compressor,
    bytes_read: u64,
    block_count: u64,
    elapsed: f64,
) -> anyhow::Result<()> {
    let image_size = std::fs::metadata(image)?.len();
    eprintln!("  codec       : {}", codec.name());
    eprintln!("  blocks      : {}", block_count);
    eprintln!("  raw input   : {}", human_bytes(bytes_read));
    eprintln!("  image size  : {}", human_bytes(image_size));
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((bytes_read as f64 / elapsed) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed);
    Ok(())
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_create(
    input: PathBuf,
    image: PathBuf,
    block_size: u32,
    mode: ZstdMode,
    comp_opts: Vec<String>,
) -> anyhow::Result<()> {
    let codec: Arc<dyn Compressor> = Arc::new(ZstdCodec::with_mode(mode));
    let mut config = codec.default_configuration();
    parse_compressor_options(codec.as_ref(), &mut config, &comp_opts)?;
    log::info!(
        "creating {:?}: {} level {}, {} engine, block size {}",
        image,
        codec.name(),
        config.compression_level,
        mode,
        block_size
    );

    let t0 = Instant::now();
    let mut writer = Writer::create(&image, codec.clone(), config, block_size)
        .with_context(|| format!("creating image {:?}", image))?;
    let bytes_read = feed(&input, &mut writer, block_size as usize)?;
    let block_count = writer.finish()?;

    report(&image, codec.as_ref(), bytes_read, block_count, t0.elapsed().as_secs_f64())
}

fn run_append(input: PathBuf, image: PathBuf, comp_opts: Vec<String>) -> anyhow::Result<()> {
    let codec: Arc<dyn Compressor> = Arc::new(ZstdCodec::new());
    if !comp_opts.is_empty() {
        // Still validated so typos are caught, then overridden by the image.
        let mut ignored = codec.default_configuration();
        parse_compressor_options(codec.as_ref(), &mut ignored, &comp_opts)?;
        log::warn!("compressor options on the command line are ignored when appending");
    }

    let t0 = Instant::now();
    let mut writer = Writer::append(&image, codec.clone())?;
    log::info!(
        "appending to {:?} with stored level {}",
        image,
        writer.configuration().compression_level
    );
    let block_size = writer.block_size() as usize;
    let bytes_read = feed(&input, &mut writer, block_size)?;
    let block_count = writer.finish()?;

    report(&image, codec.as_ref(), bytes_read, block_count, t0.elapsed().as_secs_f64())
}

fn run_extract(image: PathBuf, output: PathBuf) -> anyhow::Result<()> {
    let mut reader = Reader::open(&image, Arc::new(ZstdCodec::new()))?;

    let is_stdout = output.to_str() == Some("-");
    let mut dst: Box<dyn Write> = if is_stdout {
        Box::new(io::stdout())
    } else {
        Box::new(
            File::create(&output).with_context(|| format!("creating output file {:?}", output))?,
        )
    };

    let t0 = Instant::now();
    let block_count = reader.block_count();
    let mut total_raw = 0u64;
    for idx in 0..block_count {
        let block = reader.read_block(idx)?;
        total_raw += block.len() as u64;
        dst.write_all(&block)?;
    }
    dst.flush()?;

    let elapsed = t0.elapsed();
    eprintln!("  blocks      : {}", block_count);
    eprintln!("  raw size    : {}", human_bytes(total_raw));
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((total_raw as f64 / elapsed.as_secs_f64()) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_inspect(image: PathBuf, show_blocks: bool) -> anyhow::Result<()> {
    let codec = Arc::new(ZstdCodec::new());
    // Inspect must still describe an image whose options record is corrupt.
    let reader = Reader::inspect(&image, codec.clone())?;
    let file_size = std::fs::metadata(&image)?.len();

    println!("=== blockfs image: {:?} ===", image);
    println!();
    println!("  format version : {}", reader.superblock.version);
    println!(
        "  compressor     : {} (id={})",
        codec.name(),
        reader.superblock.compression_id
    );
    println!("  block size     : {}", human_bytes(reader.block_size() as u64));
    println!("  block count    : {}", reader.block_count());
    println!("  raw size       : {}", human_bytes(reader.raw_size()));
    println!("  stored         : {}", human_bytes(reader.compressed_size()));
    println!("  stored raw     : {} blocks", reader.uncompressed_blocks());
    println!("  file on disk   : {}", human_bytes(file_size));
    println!("  ratio          : {:.2}x", reader.ratio());
    println!("  flags          : 0x{:016x}", reader.superblock.flags);
    println!();
    if reader.options_record().is_empty() {
        println!("  compressor options: defaults");
    } else {
        println!("  compressor options:");
        reader.display_options(&mut io::stdout())?;
        if let Some(e) = reader.options_error() {
            println!("    (corrupt, blocks cannot be decoded)");
            eprintln!("{}", e);
        }
    }

    if show_blocks {
        println!();
        println!(
            "  {:>8}  {:>14}  {:>12}  {:>12}  {:>5}  {:>16}",
            "block", "file offset", "stored", "raw", "mode", "checksum"
        );
        println!("  {}", "-".repeat(75));
        for (i, e) in reader.entries().iter().enumerate() {
            println!(
                "  {:>8}  {:>14}  {:>12}  {:>12}  {:>5}  {:016x}",
                i,
                e.offset,
                human_bytes(e.stored_len as u64),
                human_bytes(e.raw_len as u64),
                if e.is_uncompressed() { "raw" } else { "zstd" },
                e.checksum
            );
        }
    }

    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    env_logger::builder().format_timestamp(None).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Create {
            input,
            image,
            block_size,
            zstd_mode,
            comp_opts,
        } => run_create(input, image, block_size, zstd_mode, comp_opts),
        Commands::Append {
            input,
            image,
            comp_opts,
        } => run_append(input, image, comp_opts),
        Commands::Extract { image, output } => run_extract(image, output),
        Commands::Inspect { image, blocks } => run_inspect(image, blocks),
        Commands::Usage => {
            let codec = ZstdCodec::new();
            print!("{} compressor options:\n{}", codec.name(), codec.usage());
            Ok(())
        }
    }
}
