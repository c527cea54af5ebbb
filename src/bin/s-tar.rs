//! Command line front end for s-tar

use clap::{ArgAction, Parser, Subcommand};
use s_tar::chunk::manifest_path;
use s_tar::error::exit_code;
use s_tar::progress::NotifyError;
use s_tar::{
    compress, decompress, list_contents_with, Algorithm, Artifact, CancellationState,
    CancellationToken, CompressOptions, DecompressOptions, OperationStats, OverwritePolicy,
    ProgressEvent, STarError, Sink, Source,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Streaming tar compressor", long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace); overrides RUST_LOG
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Print stats and listings as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive and compress files or directories
    Compress {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Archive file, or part prefix with --chunk-size
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, default_value = "gzip")]
        algorithm: Algorithm,
        #[arg(short, long)]
        level: Option<u32>,
        /// Split output into parts of this size (e.g. 512K, 10M, 1G)
        #[arg(long, value_parser = parse_size)]
        chunk_size: Option<u64>,
        /// Print one line per entry and chunk
        #[arg(long)]
        progress: bool,
    },
    /// Extract an archive file or a chunk set
    Decompress {
        /// Archive file or part prefix
        input: PathBuf,
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Skip detection and use this algorithm
        #[arg(short, long)]
        algorithm: Option<Algorithm>,
        /// Treat the input as a part prefix
        #[arg(long)]
        chunks: bool,
        /// Do not recompute chunk checksums
        #[arg(long)]
        no_verify: bool,
        /// overwrite, skip or error
        #[arg(long, default_value = "overwrite")]
        overwrite: OverwritePolicy,
        #[arg(long)]
        progress: bool,
    },
    /// List archive entries without extracting
    List {
        input: PathBuf,
        #[arg(short, long)]
        algorithm: Option<Algorithm>,
        #[arg(long)]
        chunks: bool,
    },
    /// Show which compression algorithms this build supports
    Algorithms,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::from(exit_code::FAILURE);
        }
    };

    let result = runtime.block_on(run(cli));
    // a forced abort may leave a stage blocked on I/O or the prompt
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> s_tar::Result<()> {
    let token = CancellationToken::new();
    install_interrupt_handler(token.clone());

    match cli.command {
        Commands::Compress {
            inputs,
            output,
            algorithm,
            level,
            chunk_size,
            progress,
        } => {
            let mut options = CompressOptions::new(algorithm)
                .with_cancellation(token)
                .with_confirm(confirm_on_terminal);
            if let Some(level) = level {
                options = options.with_level(level);
            }
            if let Some(chunk_size) = chunk_size {
                options = options.with_chunk_size(chunk_size);
            }
            if progress {
                options = options.with_progress(print_progress);
            }
            let done = compress(&inputs, Sink::File(output), options).await?;
            if let Artifact::Chunks { prefix, manifest } = &done.artifact {
                if !cli.json {
                    println!(
                        "{} chunks written, manifest {}",
                        manifest.total_chunks,
                        manifest_path(prefix).display()
                    );
                }
            }
            report(&done.stats, cli.json)
        }
        Commands::Decompress {
            input,
            output,
            algorithm,
            chunks,
            no_verify,
            overwrite,
            progress,
        } => {
            let mut options = DecompressOptions::new()
                .with_verify_checksum(!no_verify)
                .with_overwrite(overwrite)
                .with_cancellation(token)
                .with_confirm(confirm_on_terminal);
            if let Some(algorithm) = algorithm {
                options = options.with_algorithm(algorithm);
            }
            if progress {
                options = options.with_progress(print_progress);
            }
            let stats = decompress(source_for(input, chunks), output, options).await?;
            report(&stats, cli.json)
        }
        Commands::List {
            input,
            algorithm,
            chunks,
        } => {
            let mut options = DecompressOptions::new().with_cancellation(token);
            if let Some(algorithm) = algorithm {
                options = options.with_algorithm(algorithm);
            }
            let entries = list_contents_with(source_for(input, chunks), options).await?;
            if cli.json {
                return print_json(&entries);
            }
            for entry in entries {
                let marker = if entry.is_directory && !entry.name.ends_with('/') {
                    "/"
                } else {
                    ""
                };
                println!("{:>12}  {}{}", entry.size, entry.name, marker);
            }
            Ok(())
        }
        Commands::Algorithms => {
            if cli.json {
                let rows: Vec<_> = Algorithm::ALL
                    .iter()
                    .map(|a| {
                        serde_json::json!({
                            "name": a.name(),
                            "extension": a.extension(),
                            "description": a.description(),
                            "available": a.is_available(),
                        })
                    })
                    .collect();
                return print_json(&rows);
            }
            for algorithm in Algorithm::ALL {
                let status = if algorithm.is_available() {
                    "available".to_string()
                } else {
                    format!("needs feature `{}`", algorithm.feature().unwrap_or("default"))
                };
                println!(
                    "{:<6} {:<9} {:<48} {}",
                    algorithm.name(),
                    algorithm.extension(),
                    algorithm.description(),
                    status
                );
            }
            Ok(())
        }
    }
}

/// Chunk prefix when asked for, or when only `<input>.metadata` exists
fn source_for(input: PathBuf, chunks: bool) -> Source {
    if chunks || (!input.is_file() && manifest_path(&input).is_file()) {
        Source::Chunks(input)
    } else {
        Source::File(input)
    }
}

/// Ctrl-C once asks for confirmation at the next entry, twice aborts
fn install_interrupt_handler(token: CancellationToken) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match token.interrupt() {
                CancellationState::InterruptRequested => {
                    eprintln!("\ninterrupt received, press Ctrl-C again to abort");
                }
                CancellationState::Cancelled { forced: true } => {
                    eprintln!("\naborting");
                }
                _ => {}
            }
        }
    });
}

fn confirm_on_terminal() -> bool {
    let mut stderr = std::io::stderr();
    // prompt failures are treated as a yes
    let _ = write!(stderr, "Cancel the running operation? [y/N] ");
    let _ = stderr.flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return true;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn print_progress(event: ProgressEvent) -> Result<(), NotifyError> {
    match event {
        ProgressEvent::Started {
            total_files,
            total_bytes,
        } => eprintln!("{total_files} files, {total_bytes} bytes"),
        ProgressEvent::Entry { name, size } => eprintln!("{size:>12}  {name}"),
        ProgressEvent::Skipped { name, reason } => eprintln!("     skipped  {name} ({reason})"),
        ProgressEvent::ChunkWritten { index, size } => eprintln!("chunk {index:04} written, {size} bytes"),
        ProgressEvent::ChunkVerified { index, size } => eprintln!("chunk {index:04} read, {size} bytes"),
    }
    Ok(())
}

fn report(stats: &OperationStats, json: bool) -> s_tar::Result<()> {
    if json {
        return print_json(stats);
    }
    println!(
        "{} files, {} dirs, {} skipped, {} bytes -> {} bytes ({:.1}%) in {:.2}s, {:.1} MiB/s",
        stats.files,
        stats.directories,
        stats.skipped,
        stats.bytes,
        stats.compressed_bytes,
        stats.compression_ratio() * 100.0,
        stats.elapsed.as_secs_f64(),
        stats.throughput_mib_s()
    );
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> s_tar::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| STarError::InvalidFormat(format!("encode json: {e}")))?;
    println!("{text}");
    Ok(())
}

/// `1048576`, `512K`, `10M`, `1G`, with an optional `B`/`iB` suffix
fn parse_size(text: &str) -> Result<u64, String> {
    let upper = text.trim().to_ascii_uppercase();
    let digits = upper.trim_end_matches("IB").trim_end_matches('B');
    let (number, multiplier) = match digits.chars().last() {
        Some('K') => (&digits[..digits.len() - 1], 1024u64),
        Some('M') => (&digits[..digits.len() - 1], 1024 * 1024),
        Some('G') => (&digits[..digits.len() - 1], 1024 * 1024 * 1024),
        _ => (digits, 1),
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{text}'"))?;
    if value == 0 {
        return Err("size must be greater than zero".to_string());
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{text}' is too large"))
}
