//! channel-daemon: chat node with channel mesh membership, plus the relay hub
//! nodes use as their overlay.

use anyhow::{Context, Result};
use channel_core::{ChannelNode, Descriptor};
use channel_daemon::console::{Command, Console, Output, format_message};
use channel_daemon::{DaemonConfig, Hub, RemoteOverlay, identity};
use clap::{Parser, Subcommand};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const COMMAND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "channel-daemon")]
#[command(about = "P2P chat node and relay hub")]
struct Args {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the relay hub that nodes connect to
    Hub {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        listen: String,
    },
    /// Run an interactive chat node
    Node {
        /// Path to a TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Hub URL (overrides the config file)
        #[arg(long)]
        hub: Option<String>,

        /// Identity file (overrides the config file)
        #[arg(long)]
        identity: Option<PathBuf>,

        /// Channel to join at startup (repeatable)
        #[arg(short, long)]
        join: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose. Stderr keeps the console readable.
    let default_filter = if args.verbose {
        "debug,channel_core=debug,channel_daemon=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.mode {
        Mode::Hub { listen } => run_hub(&listen).await,
        Mode::Node {
            config,
            hub,
            identity,
            join,
        } => run_node(config, hub, identity, join).await,
    }
}

async fn run_hub(listen: &str) -> Result<()> {
    let hub = Hub::bind(listen).await?;
    let shutdown = hub.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        shutdown.cancel();
    });
    hub.run().await
}

async fn run_node(
    config_path: Option<PathBuf>,
    hub: Option<String>,
    identity_path: Option<PathBuf>,
    join: Vec<String>,
) -> Result<()> {
    let config = DaemonConfig::load(config_path.as_deref())?;
    let identity_path = identity_path.unwrap_or_else(|| config.identity_path());
    let peer_id = identity::load_or_generate(&identity_path)?;
    let hub_url = hub.unwrap_or_else(|| config.p2p.hub_url.clone());

    let node_config = config.node_config()?;
    let mut autojoin = config.autojoin()?;
    for raw in &join {
        autojoin.push(Descriptor::parse(raw).with_context(|| format!("--join {raw}"))?);
    }

    let overlay = RemoteOverlay::connect(&hub_url, peer_id)
        .await
        .with_context(|| format!("Failed to connect to hub at {hub_url}"))?;
    let hub_closed = overlay.closed();
    let node = ChannelNode::new(Arc::new(overlay.clone()), node_config);
    let mut messages = node
        .messages()
        .context("Message stream already taken")?;
    node.start();

    let console = Console::new(node.clone());
    for descriptor in autojoin {
        match node.join_channel(&descriptor).await {
            Ok(()) => console.set_current(descriptor),
            Err(e) => warn!("Autojoin failed: {}", e),
        }
    }
    println!("Node {} ready. Type /help for commands.", peer_id);

    let commands = TaskTracker::new();
    let (output_tx, mut outputs) = mpsc::unbounded_channel();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match Command::parse(&line) {
                    Ok(Some(command)) => {
                        if let Some(output) = console.dispatch(command, &commands, &output_tx).await {
                            if show(output).is_break() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                },
                Ok(None) => {
                    info!("Stdin closed, running until interrupted");
                    stdin_open = false;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            Some(output) = outputs.recv() => {
                if show(output).is_break() {
                    break;
                }
            }
            Some(message) = messages.recv() => println!("{}", format_message(&message)),
            _ = hub_closed.cancelled() => {
                error!("Lost connection to hub");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if !overlay.is_closed() {
        for descriptor in node.joined_channels() {
            if let Err(e) = node.leave_channel(&descriptor).await {
                warn!("{}", e);
            }
        }
    }
    node.shutdown().await;
    overlay.close().await;

    // In-flight commands fail fast once the node and hub connection are gone
    commands.close();
    if tokio::time::timeout(COMMAND_DRAIN_TIMEOUT, commands.wait())
        .await
        .is_err()
    {
        warn!("Console commands still running after {:?}", COMMAND_DRAIN_TIMEOUT);
    }
    Ok(())
}

/// Print a command result. Breaks when the user asked to quit.
fn show(output: Result<Output>) -> ControlFlow<()> {
    match output {
        Ok(Output::Text(text)) => println!("{text}"),
        Ok(Output::Silent) => {}
        Ok(Output::Quit) => return ControlFlow::Break(()),
        Err(e) => println!("error: {e}"),
    }
    ControlFlow::Continue(())
}
