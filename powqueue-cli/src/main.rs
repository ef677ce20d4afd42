// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! powqueue CLI
//!
//! Runs the offload server and submits requests to it from the shell.

use clap::{Parser, Subcommand};
use powqueue_core::QueueName;

mod commands;

/// powq - shared-memory modular exponentiation offload queue
#[derive(Parser)]
#[command(name = "powq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (defaults apply if it does not exist)
    #[arg(short, long, default_value = "powqueue.yaml")]
    pub config: String,

    /// Shared memory object name, overrides `queue.name`
    #[arg(short, long, global = true)]
    pub name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create (or adopt) the ring and serve requests until SIGINT/SIGTERM
    Serve {
        /// Number of request slots, overrides `queue.capacity`
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Submit `2^exponent mod modulus` and print the result
    Submit {
        #[arg(short, long)]
        exponent: u64,

        #[arg(short, long)]
        modulus: u64,

        /// Wait timeout in milliseconds, overrides `client.timeout_ms`
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Wait for a free slot instead of failing when the ring is full
        #[arg(long)]
        block: bool,
    },

    /// Show ring counters
    Status,

    /// Unlink a stale shared memory object
    Destroy,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so `submit` output stays scriptable.
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Validate { file } = &cli.command {
        return commands::validate::execute(file).await;
    }

    let mut config = commands::load_config(&cli.config)?;
    if let Some(name) = &cli.name {
        config.queue.name = QueueName::new(name.as_str())?;
    }

    match cli.command {
        Commands::Serve { capacity } => commands::serve::execute(config, capacity).await,
        Commands::Submit {
            exponent,
            modulus,
            timeout_ms,
            block,
        } => commands::submit::execute(config, exponent, modulus, timeout_ms, block).await,
        Commands::Status => commands::status::execute(&config).await,
        Commands::Destroy => commands::destroy::execute(&config).await,
        Commands::Validate { .. } => Ok(()),
    }
}
