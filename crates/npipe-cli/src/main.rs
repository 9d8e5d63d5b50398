//! npipe - talk to an npipe echo channel.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use npipe_core::{ChannelName, NpipeConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// npipe - npipe channel client
#[derive(Parser, Debug)]
#[command(name = "npipe")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "npipe.toml")]
    config: PathBuf,

    /// Channel name
    #[arg(short, long)]
    name: Option<ChannelName>,

    /// Runtime directory holding the channel socket
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Explicit socket path (overrides name resolution)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Connection attempts while the server is unavailable
    #[arg(long)]
    attempts: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send each message and print its echo
    Send {
        /// Messages to send, one request each
        #[arg(required = true)]
        messages: Vec<String>,
    },

    /// Send stdin line by line and print each echo
    Interactive,

    /// Wait until the channel admits a client
    Wait,

    /// Print the effective configuration as TOML
    Config,
}

impl Cli {
    /// File configuration with command-line overrides applied.
    fn effective_config(&self) -> Result<NpipeConfig> {
        let mut config = NpipeConfig::load_or_default(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;

        if let Some(name) = &self.name {
            config.channel.name = name.clone();
        }
        if let Some(dir) = &self.runtime_dir {
            config.channel.runtime_dir = Some(dir.clone());
        }
        if let Some(socket) = &self.socket {
            config.channel.socket = Some(socket.clone());
        }
        if let Some(timeout) = self.timeout_ms {
            config.client.request_timeout_ms = timeout;
        }
        if let Some(attempts) = self.attempts {
            config.client.connect_attempts = attempts;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = cli.effective_config()?;

    match cli.command {
        Commands::Send { messages } => commands::send(&config, &messages),
        Commands::Interactive => commands::interactive(&config),
        Commands::Wait => commands::wait(&config),
        Commands::Config => commands::print_config(&config),
    }
}
