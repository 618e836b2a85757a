//! # PeerLink CLI
//!
//! Control client for remote video producers:
//! - `streams`: list producers (HTTP discovery, or the signalling server)
//! - `identity`: ask the signalling server for a consumer id
//! - `session`: reserve a session id for one producer
//! - `watch`: follow the signalling channel lifecycle until Ctrl-C

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerlink_common::StreamDescriptor;
use peerlink_discovery::DiscoveryClient;
use peerlink_signalling::{ChannelEvent, ChannelOptions, SignallingChannel};

#[derive(Parser, Debug)]
#[command(name = "peerlink", version)]
#[command(about = "Signalling and discovery client for remote video producers")]
struct Args {
    /// Signalling server WebSocket URL (overrides config)
    #[arg(long, env = "PEERLINK_SIGNALLING_URL")]
    signalling_url: Option<String>,

    /// Discovery service base URL (overrides config)
    #[arg(long, env = "PEERLINK_DISCOVERY_URL")]
    discovery_url: Option<String>,

    /// How long to wait for a signalling answer, in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available producers
    Streams {
        /// Ask the signalling server instead of the HTTP discovery service
        #[arg(long)]
        via_signalling: bool,
    },

    /// Print the consumer id assigned by the signalling server
    Identity,

    /// Reserve a session with a producer and print its ids
    Session {
        /// Producer id, as listed by `streams`
        producer_id: String,
    },

    /// Print signalling channel events until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = peerlink_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerlink=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    let answer_timeout = Duration::from_secs(args.timeout);
    let signalling_url = args
        .signalling_url
        .clone()
        .unwrap_or_else(|| config.signalling.url.clone());

    match args.command {
        Command::Streams { via_signalling: false } => {
            let client = match &args.discovery_url {
                Some(url) => DiscoveryClient::new(url, Duration::from_secs(config.discovery.timeout_secs))?,
                None => DiscoveryClient::from_config(&config.discovery)?,
            };
            let streams = client.streams().await.context("Failed to list streams")?;
            print_streams(&streams);
        }
        Command::Streams { via_signalling: true } => {
            let channel = connect(&signalling_url, &config.signalling, answer_timeout).await?;
            let streams = tokio::time::timeout(answer_timeout, channel.request_available_streams())
                .await
                .context("Timed out waiting for available streams")??;
            for stream in &streams {
                println!("{:<24} {}", stream.id, stream.name);
            }
            channel.close("done").await;
        }
        Command::Identity => {
            let channel = connect(&signalling_url, &config.signalling, answer_timeout).await?;
            let id = tokio::time::timeout(answer_timeout, channel.request_identity())
                .await
                .context("Timed out waiting for a consumer id")??;
            println!("{id}");
            channel.close("done").await;
        }
        Command::Session { producer_id } => {
            let channel = connect(&signalling_url, &config.signalling, answer_timeout).await?;
            let consumer_id = tokio::time::timeout(answer_timeout, channel.request_identity())
                .await
                .context("Timed out waiting for a consumer id")??;
            let session_id = tokio::time::timeout(
                answer_timeout,
                channel.request_session_id(&consumer_id, &producer_id),
            )
            .await
            .context("Timed out waiting for a session id")??;

            println!("consumer: {consumer_id}");
            println!("producer: {producer_id}");
            println!("session:  {session_id}");
            channel.close("done").await;
        }
        Command::Watch => {
            let channel = SignallingChannel::new(ChannelOptions::from(&config.signalling));
            let mut events = channel.subscribe();
            channel.connect(&signalling_url).await;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(ChannelEvent::Open) => println!("open   {signalling_url}"),
                        Ok(ChannelEvent::Close) => println!("closed"),
                        Ok(ChannelEvent::Error(e)) => println!("error  {e}"),
                        Ok(ChannelEvent::Status(s)) => println!("status {s}"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "Dropped channel events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            channel.close("interrupted").await;
        }
    }

    Ok(())
}

/// Open a channel and wait until the socket is up.
async fn connect(
    url: &str,
    cfg: &peerlink_common::config::SignallingConfig,
    wait: Duration,
) -> Result<SignallingChannel> {
    let channel = SignallingChannel::new(ChannelOptions {
        reconnect: false,
        ..ChannelOptions::from(cfg)
    });
    channel.connect(url).await;
    tokio::time::timeout(wait, channel.wait_until_open())
        .await
        .with_context(|| format!("Could not reach signalling server at {url}"))?;
    Ok(channel)
}

fn print_streams(streams: &[StreamDescriptor]) {
    if streams.is_empty() {
        println!("No streams available");
        return;
    }
    for s in streams {
        let resolution = s
            .resolution()
            .map(|(w, h)| format!("{w}x{h}"))
            .unwrap_or_else(|| "-".into());
        let state = match (&s.error, s.running) {
            (Some(e), _) => format!("error: {e}"),
            (None, true) => "running".into(),
            (None, false) => "stopped".into(),
        };
        println!(
            "{:<24} {:<20} {:<6} {:>9} {:>6.2}fps {}{} [{}]",
            s.id,
            s.name,
            s.encode.as_deref().unwrap_or("-"),
            resolution,
            s.fps,
            s.source,
            if s.thermal { " (thermal)" } else { "" },
            state,
        );
    }
}
