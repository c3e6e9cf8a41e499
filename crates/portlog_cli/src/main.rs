//! portlog CLI
//!
//! Captures serial ports into rotating log segments and uploads them.
//!
//! # Commands
//!
//! - `run` - Capture the configured ports and upload periodically
//! - `consolidate` - Upload pending segments once
//! - `inspect` - List pending segments
//!
//! Settings are read from the environment (`STORAGE_DIR`, `P0`..`P9`,
//! `UPLOAD_INTERVAL`, ...) and can be overridden with flags.

mod commands;

use clap::{Parser, Subcommand};
use commands::store::StoreTarget;
use portlog_core::{Config, PortMapping};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Serial line capture with rotation and object store upload.
#[derive(Parser)]
#[command(name = "portlog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory segment files are written to
    #[arg(global = true, short = 'd', long)]
    storage_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture ports and upload segments periodically
    Run {
        /// Port to capture as NAME=DEVICE (repeatable)
        #[arg(short, long = "port", value_name = "NAME=DEVICE")]
        ports: Vec<PortMapping>,

        /// Upload target: dir:<path> or s3
        #[arg(short, long, default_value = "dir:./uploads")]
        store: StoreTarget,

        /// Upload bucket
        #[arg(short, long)]
        bucket: Option<String>,

        /// Key prefix of uploaded objects
        #[arg(long)]
        prefix: Option<String>,

        /// Minutes between uploads
        #[arg(long, value_name = "MINUTES")]
        upload_interval: Option<u64>,

        /// Segment size in bytes that triggers rotation
        #[arg(long, value_name = "BYTES")]
        max_file_size: Option<u64>,

        /// Serial line speed
        #[arg(long)]
        baud_rate: Option<u32>,
    },

    /// Upload pending segments once
    Consolidate {
        /// Upload target: dir:<path> or s3
        #[arg(short, long, default_value = "dir:./uploads")]
        store: StoreTarget,

        /// Upload bucket
        #[arg(short, long)]
        bucket: Option<String>,

        /// Key prefix of uploaded objects
        #[arg(long)]
        prefix: Option<String>,

        /// Dry run - show what would be uploaded
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// List pending segments grouped by stream
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Version = cli.command {
        println!("portlog CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("portlog Core v{}", portlog_core::VERSION);
        return Ok(());
    }

    let mut config = Config::from_env()?;
    if let Some(dir) = cli.storage_dir {
        config = config.storage_dir(dir);
    }

    match cli.command {
        Commands::Run {
            ports,
            store,
            bucket,
            prefix,
            upload_interval,
            max_file_size,
            baud_rate,
        } => {
            for port in ports {
                config = config.port(port);
            }
            apply_target(&mut config, bucket, prefix);
            if let Some(minutes) = upload_interval {
                config = config.upload_interval(Duration::from_secs(minutes * 60));
            }
            if let Some(size) = max_file_size {
                config = config.max_segment_size(size);
            }
            if let Some(baud) = baud_rate {
                config.baud_rate = baud;
            }
            commands::run::run(config, &store)?;
        }
        Commands::Consolidate {
            store,
            bucket,
            prefix,
            dry_run,
        } => {
            apply_target(&mut config, bucket, prefix);
            commands::consolidate::run(&config, &store, dry_run)?;
        }
        Commands::Inspect { format } => {
            commands::inspect::run(&config, &format)?;
        }
        Commands::Version => {}
    }

    Ok(())
}

fn apply_target(config: &mut Config, bucket: Option<String>, prefix: Option<String>) {
    if let Some(bucket) = bucket {
        config.bucket = bucket;
    }
    if let Some(prefix) = prefix {
        config.key_prefix = prefix;
    }
}
