mod cli;
mod commands;
mod daemon;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rpatch::config::{PatchConfig, TransferConfig, MIB};
use rpatch::manifest::DEFAULT_PATCH_PATTERN;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::cli::FingerprintCheck;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download one file, resuming an earlier partial transfer
    Download {
        url: String,

        /// Destination path (defaults to the URL's file name in the current directory)
        destination: Option<PathBuf>,

        /// Run in background (daemon mode) [Unix only]
        #[arg(short = 'd', long)]
        daemon: bool,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Pause the background download [Unix only]
    Pause,

    /// Resume the background download [Unix only]
    Resume,

    /// Stop the background download, keeping its progress [Unix only]
    Stop,

    /// List in-flight transfers in a directory
    Status {
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Refresh the listing until interrupted
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Compare an install against a base or patch manifest
    Scan {
        #[arg(short = 'i', long)]
        install: PathBuf,

        /// Base manifest file (size-only check)
        #[arg(short = 'b', long, conflicts_with = "patches", required_unless_present = "patches")]
        base: Option<PathBuf>,

        /// Patch manifest file or URL (size and fingerprint check)
        #[arg(short = 'p', long)]
        patches: Option<String>,

        #[arg(long = "verify", value_enum, default_value = "auto")]
        verify: FingerprintCheck,
    },

    /// Bring an install in line with a patch manifest
    Apply {
        #[arg(short = 'i', long)]
        install: PathBuf,

        /// Patch manifest file or URL
        #[arg(short = 'm', long)]
        manifest: String,

        /// Only repair entries a size scan against this base manifest flags
        #[arg(short = 'b', long)]
        base: Option<PathBuf>,

        /// Maximum concurrent entry operations
        #[arg(short = 'j', long, default_value_t = 8)]
        jobs: usize,

        /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
        #[arg(short = 'r', long)]
        rate_limit: Option<u32>,

        #[arg(long = "verify", value_enum, default_value = "auto")]
        verify: FingerprintCheck,
    },

    /// Build base and patch manifests from a reference client directory
    Generate {
        client_dir: PathBuf,

        /// Where to write the manifests (defaults to the client directory)
        #[arg(short = 'o', long)]
        out_dir: Option<PathBuf>,

        /// Base URL recorded in the patch manifest
        #[arg(short = 'u', long, default_value = "")]
        base_url: String,

        /// Glob selecting patch archives, relative to the client directory
        #[arg(long, default_value = DEFAULT_PATCH_PATTERN)]
        pattern: String,
    },
}

#[derive(Args, Debug)]
struct TransferArgs {
    /// Concurrent chunk workers for large files
    #[arg(short = 'w', long, default_value_t = 4)]
    workers: usize,

    /// Chunk size in MiB
    #[arg(long, default_value_t = 16)]
    chunk_mib: u64,

    /// Attempts before giving up
    #[arg(long, default_value_t = 50)]
    retries: u32,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,
}

impl TransferArgs {
    fn config(&self) -> TransferConfig {
        TransferConfig {
            max_chunk_workers: self.workers.max(1),
            chunk_size: self.chunk_mib.max(1) * MIB,
            max_attempts: self.retries.max(1),
            rate_limit: self.rate_limit,
            ..Default::default()
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Signal commands need no runtime.
    match &cli.command {
        Command::Pause => return daemon::pause_daemon(),
        Command::Resume => return daemon::resume_daemon(),
        Command::Stop => return daemon::stop_daemon(),
        _ => {}
    }

    // Fork before the runtime starts; worker threads do not survive it.
    let in_daemon = matches!(cli.command, Command::Download { daemon: true, .. });
    if in_daemon {
        daemon::start_daemon()?;
    }

    init_tracing();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Download {
                url,
                destination,
                transfer,
                ..
            } => commands::run_download(url, destination, transfer.config(), in_daemon).await,
            Command::Status { dir, follow } => {
                if follow {
                    commands::follow_status(dir).await
                } else {
                    commands::list_transfers(dir).await
                }
            }
            Command::Scan {
                install,
                base,
                patches,
                verify,
            } => commands::run_scan(install, base, patches, verify).await,
            Command::Apply {
                install,
                manifest,
                base,
                jobs,
                rate_limit,
                verify,
            } => {
                let transfer = TransferConfig {
                    rate_limit,
                    ..Default::default()
                };
                let patch = PatchConfig {
                    max_parallel: jobs.max(1),
                    ..Default::default()
                };
                commands::run_apply(install, manifest, base, transfer, patch, verify).await
            }
            Command::Generate {
                client_dir,
                out_dir,
                base_url,
                pattern,
            } => commands::run_generate(client_dir, out_dir, base_url, pattern).await,
            Command::Pause | Command::Resume | Command::Stop => Ok(()),
        }
    })
}
