//! Command implementations.
//!
//! Each command builds a current-thread runtime; the client needs no more.

use std::path::Path;

use anyhow::{Context, Result};
use npipe_cli::{ChannelClient, ClientConfig, RetryPolicy};
use npipe_core::NpipeConfig;
use tokio::io::{AsyncBufReadExt, BufReader};

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

async fn connect(config: &NpipeConfig, socket_path: &Path) -> Result<ChannelClient> {
    ChannelClient::connect_with_retry(
        socket_path,
        &ClientConfig::from_section(&config.client),
        &RetryPolicy::from_section(&config.client),
    )
    .await
    .with_context(|| format!("failed to connect to {}", socket_path.display()))
}

/// Send each message as one request and print the echoes in order.
pub fn send(config: &NpipeConfig, messages: &[String]) -> Result<()> {
    let socket_path = config.socket_path();
    runtime()?.block_on(async {
        let mut client = connect(config, &socket_path).await?;
        for message in messages {
            let reply = client
                .request(message.clone().into_bytes())
                .await
                .context("request failed")?;
            println!("{}", String::from_utf8_lossy(&reply));
        }
        client.close().await.context("failed to close connection")?;
        Ok(())
    })
}

/// Send stdin line by line until EOF.
pub fn interactive(config: &NpipeConfig) -> Result<()> {
    let socket_path = config.socket_path();
    runtime()?.block_on(async {
        let mut client = connect(config, &socket_path).await?;
        eprintln!(
            "connected to {} ({}), connection {}",
            socket_path.display(),
            client.server_info(),
            client.connection_id()
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
            let reply = client
                .request(line.into_bytes())
                .await
                .context("request failed")?;
            println!("{}", String::from_utf8_lossy(&reply));
        }

        client.close().await.context("failed to close connection")?;
        Ok(())
    })
}

/// Block until the channel admits a client, then disconnect.
pub fn wait(config: &NpipeConfig) -> Result<()> {
    let socket_path = config.socket_path();
    runtime()?.block_on(async {
        let client = connect(config, &socket_path).await?;
        println!(
            "channel {} is available ({})",
            config.channel.name,
            client.server_info()
        );
        client.close().await.context("failed to close connection")?;
        Ok(())
    })
}

/// Print the effective configuration.
pub fn print_config(config: &NpipeConfig) -> Result<()> {
    let text = config.to_toml().context("failed to render configuration")?;
    print!("{text}");
    Ok(())
}
