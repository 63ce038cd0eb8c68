use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, LevelFilter};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use layertar::{
    apply_filter, new_overlay_whiteout_filter, pack, unpack, Cancellation, GenericToOverlay,
    UnpackOptions,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Direction {
    /// overlayfs whiteouts to `.wh.` marker files
    Overlay,
    /// `.wh.` marker files to overlayfs whiteouts
    ToOverlay,
}

#[derive(Subcommand)]
enum Command {
    /// Pack a directory into a tar stream
    Pack {
        #[arg(help = "Directory to pack")]
        source: PathBuf,

        #[arg(short, long, help = "Output file (stdout if omitted or '-')")]
        output: Option<PathBuf>,

        #[arg(long, help = "Gzip the output")]
        gzip: bool,
    },
    /// Unpack a tar stream on top of a directory, applying whiteouts
    Unpack {
        #[arg(help = "Destination directory")]
        dest: PathBuf,

        #[arg(short, long, help = "Input file (stdin if omitted or '-'); gzip is detected")]
        input: Option<PathBuf>,

        #[arg(long, help = "Skip entries whose name starts with this prefix")]
        exclude: Vec<PathBuf>,
    },
    /// Translate whiteouts between overlayfs and marker-file form
    Filter {
        #[arg(value_enum)]
        direction: Direction,

        #[arg(short, long, help = "Input file (stdin if omitted or '-')")]
        input: Option<PathBuf>,

        #[arg(short, long, help = "Output file (stdout if omitted or '-')")]
        output: Option<PathBuf>,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace)"
    )]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity level
    let log_level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(log_level)
        .init();

    let cancel = Cancellation::new();

    match cli.command {
        Command::Pack {
            source,
            output,
            gzip,
        } => {
            info!("Packing {}", source.display());
            let mut stream = pack(&cancel, &source)
                .with_context(|| format!("Failed to pack {}", source.display()))?;
            let out = open_output(output.as_deref())?;
            if gzip {
                debug!("Compressing output with gzip");
                let mut encoder = GzEncoder::new(out, Compression::default());
                copy_stream(&mut stream, &mut encoder)?;
                encoder
                    .finish()
                    .context("Failed to finish gzip stream")?
                    .flush()
                    .context("Failed to flush output")?;
            } else {
                let mut out = out;
                copy_stream(&mut stream, &mut out)?;
                out.flush().context("Failed to flush output")?;
            }
        }
        Command::Unpack {
            dest,
            input,
            exclude,
        } => {
            info!("Unpacking into {}", dest.display());
            let reader = open_input(input.as_deref())?;
            let mut options = UnpackOptions::new();
            if !exclude.is_empty() {
                debug!("Excluding prefixes: {:?}", exclude);
                options = options.with_filter(move |entry| {
                    !exclude.iter().any(|prefix| entry.name.starts_with(prefix))
                });
            }
            let summary = unpack(&cancel, reader, &dest, options)
                .with_context(|| format!("Failed to unpack into {}", dest.display()))?;
            info!(
                "Unpacked {} entries, {} whiteouts applied, {} skipped",
                summary.entries, summary.whiteouts, summary.skipped
            );
        }
        Command::Filter {
            direction,
            input,
            output,
        } => {
            debug!("Filter direction: {:?}", direction);
            let reader = open_input(input.as_deref())?;
            let mut filtered: Box<dyn Read> = match direction {
                Direction::Overlay => Box::new(
                    apply_filter(reader, new_overlay_whiteout_filter())
                        .context("Failed to start overlay filter")?,
                ),
                Direction::ToOverlay => Box::new(
                    apply_filter(reader, GenericToOverlay)
                        .context("Failed to start overlay filter")?,
                ),
            };
            let mut out = open_output(output.as_deref())?;
            copy_stream(&mut filtered, &mut out)?;
            out.flush().context("Failed to flush output")?;
        }
    }

    Ok(())
}

fn is_stdio(path: Option<&Path>) -> bool {
    path.map_or(true, |p| p == Path::new("-"))
}

/// Opens the input, transparently decompressing gzip.
fn open_input(path: Option<&Path>) -> Result<Box<dyn Read + Send>> {
    let raw: Box<dyn Read + Send> = match path {
        Some(p) if !is_stdio(Some(p)) => Box::new(
            File::open(p).with_context(|| format!("Failed to open input: {}", p.display()))?,
        ),
        _ => Box::new(io::stdin()),
    };

    let mut buf_reader = BufReader::new(raw);
    let magic = buf_reader.fill_buf().context("Failed to read input")?;

    // Gzip magic number: 0x1f 0x8b
    if magic.starts_with(&[0x1f, 0x8b]) {
        debug!("Detected gzip compressed input");
        Ok(Box::new(GzDecoder::new(buf_reader)))
    } else {
        Ok(Box::new(buf_reader))
    }
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    match path {
        Some(p) if !is_stdio(Some(p)) => {
            let file = File::create(p)
                .with_context(|| format!("Failed to create output: {}", p.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        _ => Ok(Box::new(BufWriter::new(io::stdout()))),
    }
}

/// Copies a tar stream, turning errors carried by the stream back into their original form.
fn copy_stream<R: Read + ?Sized, W: Write + ?Sized>(reader: &mut R, writer: &mut W) -> Result<()> {
    io::copy(reader, writer)
        .map_err(|e| layertar::Error::from_stream("reading tar stream", e))
        .context("Failed to copy tar stream")?;
    Ok(())
}
