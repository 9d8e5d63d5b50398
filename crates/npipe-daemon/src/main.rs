//! npiped - npipe echo server.
//!
//! Binds a named channel, admits clients permitted by the configured
//! security descriptor and echoes every message back to its sender until
//! SIGTERM or SIGINT.
//!
//! Configuration comes from `npipe.toml` (see `npipe_core::config`);
//! command-line flags override individual file values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use npipe_core::config::{AllowRule, NpipeConfig};
use npipe_core::ChannelName;
use npipe_daemon::{EchoServer, ListenerConfig};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// npiped - secured multi-client channel echo server
#[derive(Parser, Debug)]
#[command(name = "npiped")]
#[command(version, about, long_about = None)]
struct Args {
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

    /// Grant access to a principal, e.g. `owner`, `gid:100=read,write`.
    /// Replaces the configured access list; may be repeated.
    #[arg(long = "allow", value_name = "PRINCIPAL[=PERMS]")]
    allow: Vec<String>,

    /// Maximum concurrently served sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Maximum message size in bytes
    #[arg(long)]
    max_message_size: Option<usize>,

    /// Shutdown grace period in milliseconds
    #[arg(long)]
    shutdown_grace_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Effective server configuration: file values with CLI overrides applied.
#[derive(Debug)]
struct DaemonConfig {
    config: NpipeConfig,
}

impl DaemonConfig {
    fn new(args: &Args) -> Result<Self> {
        let mut config = NpipeConfig::load_or_default(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?;

        if let Some(name) = &args.name {
            config.channel.name = name.clone();
        }
        if let Some(dir) = &args.runtime_dir {
            config.channel.runtime_dir = Some(dir.clone());
        }
        if let Some(socket) = &args.socket {
            config.channel.socket = Some(socket.clone());
        }
        if !args.allow.is_empty() {
            config.security.allow = args
                .allow
                .iter()
                .map(String::as_str)
                .map(parse_allow)
                .collect();
        }
        if let Some(max) = args.max_sessions {
            config.limits.max_sessions = max;
        }
        if let Some(max) = args.max_message_size {
            config.limits.max_message_size = max;
        }
        if let Some(grace) = args.shutdown_grace_ms {
            config.limits.shutdown_grace_ms = grace;
        }

        config.validate().context("invalid configuration")?;
        Ok(Self { config })
    }

    fn shutdown_grace(&self) -> Duration {
        self.config.limits.shutdown_grace()
    }
}

/// `PRINCIPAL[=PERMS]`, permissions comma-separated, read/write by default.
fn parse_allow(spec: &str) -> AllowRule {
    match spec.split_once('=') {
        Some((principal, perms)) => AllowRule {
            principal: principal.to_string(),
            access: perms.split(',').map(str::to_string).collect(),
        },
        None => AllowRule {
            principal: spec.to_string(),
            access: vec!["read".to_string(), "write".to_string()],
        },
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("npiped-worker")
        .build()
        .context("failed to create Tokio runtime")?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;

    let daemon_config = DaemonConfig::new(&args)?;
    let descriptor = daemon_config
        .config
        .security_descriptor()
        .context("failed to build security descriptor")?;
    let listener_config = ListenerConfig::from_config(&daemon_config.config);

    info!(
        channel = %daemon_config.config.channel.name,
        socket_path = %listener_config.socket_path.display(),
        entries = descriptor.entries().len(),
        "Starting npiped"
    );

    let server = EchoServer::start(listener_config, descriptor).context("failed to start server")?;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
        () = server.stopped() => {
            error!("Channel listener exited unexpectedly");
        }
    }

    let report = server
        .shutdown(daemon_config.shutdown_grace())
        .await
        .context("echo server failed")?;

    info!(
        admitted = report.stats.admitted,
        messages = report.stats.messages_echoed,
        forced = report.forced,
        "npiped exited"
    );
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}
