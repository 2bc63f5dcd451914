//! Line-oriented console for a running node.
//!
//! Lines starting with `/` are commands; anything else is posted to the
//! channel joined last. Commands that wait on the network run as tasks and
//! report back through a channel, so the input loop keeps printing messages.

use anyhow::{Result, anyhow};
use channel_core::{ChannelInfo, ChannelNode, Descriptor, Message, PeerId, PeerInfo};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// How many round trips `/ping` measures.
const PING_COUNT: usize = 3;

pub const HELP: &str = "\
Commands:
  /join <#channel>              join a channel
  /leave [#channel]             leave a channel (default: current)
  /msg <#channel> <text>        post to a channel
  /rejoin [#channel]            rediscover members (default: all channels)
  /announce [#channel]          refresh our advertisement (default: all channels)
  /members [#channel]           list connected members
  /stat <descriptor>            show what we know about a channel
  /peers                        list connected peers
  /ping <peer-id>               measure round-trip time to a peer
  /status                       show network health
  /id                           show our peer ID
  /connect <peer-id>            dial a peer directly
  /help                         show this help
  /quit                         leave every channel and exit
Anything else is posted to the current channel.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: /{0} (try /help)")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join(String),
    Leave(Option<String>),
    Msg { target: String, text: String },
    /// Plain text for the current channel
    Say(String),
    Rejoin(Option<String>),
    Announce(Option<String>),
    Members(Option<String>),
    Stat(String),
    Peers,
    Ping(String),
    Status,
    Id,
    Connect(String),
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Command::Say(line.to_string())));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        let optional = || (!args.is_empty()).then(|| args.to_string());
        let required = |usage| {
            if args.is_empty() {
                Err(CommandError::Usage(usage))
            } else {
                Ok(args.to_string())
            }
        };

        let command = match name {
            "join" | "j" => Command::Join(required("/join <#channel>")?),
            "leave" | "part" => Command::Leave(optional()),
            "msg" | "m" => {
                let (target, text) = args
                    .split_once(char::is_whitespace)
                    .ok_or(CommandError::Usage("/msg <#channel> <text>"))?;
                Command::Msg {
                    target: target.to_string(),
                    text: text.trim().to_string(),
                }
            }
            "rejoin" => Command::Rejoin(optional()),
            "announce" => Command::Announce(optional()),
            "members" => Command::Members(optional()),
            "stat" => Command::Stat(required("/stat <descriptor>")?),
            "peers" => Command::Peers,
            "ping" => Command::Ping(required("/ping <peer-id>")?),
            "status" => Command::Status,
            "id" => Command::Id,
            "connect" => Command::Connect(required("/connect <peer-id>")?),
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }

    /// Whether the command waits on the overlay.
    pub fn is_network_bound(&self) -> bool {
        !matches!(
            self,
            Command::Msg { .. } | Command::Say(_) | Command::Id | Command::Help | Command::Quit
        )
    }
}

/// What the caller should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Text(String),
    Silent,
    Quit,
}

/// Executes console commands against a node. Cheap to clone.
#[derive(Clone)]
pub struct Console {
    node: ChannelNode,
    /// Target of plain-text lines
    current: Arc<Mutex<Option<Descriptor>>>,
}

impl Console {
    pub fn new(node: ChannelNode) -> Self {
        Self {
            node,
            current: Arc::new(Mutex::new(None)),
        }
    }

    fn current_slot(&self) -> std::sync::MutexGuard<'_, Option<Descriptor>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> Option<Descriptor> {
        self.current_slot().clone()
    }

    /// Make `descriptor` the target of plain-text lines.
    pub fn set_current(&self, descriptor: Descriptor) {
        *self.current_slot() = Some(descriptor);
    }

    fn target(&self, raw: Option<&str>) -> Result<Descriptor> {
        match raw {
            Some(raw) => Ok(Descriptor::parse(raw)?),
            None => self
                .current()
                .ok_or_else(|| anyhow!("No current channel, /join one first")),
        }
    }

    /// Run `command`, spawning it on `tasks` if it waits on the network.
    ///
    /// Returns the output of commands run inline. Spawned commands send
    /// theirs to `outputs` when they finish.
    pub async fn dispatch(
        &self,
        command: Command,
        tasks: &TaskTracker,
        outputs: &mpsc::UnboundedSender<Result<Output>>,
    ) -> Option<Result<Output>> {
        if !command.is_network_bound() {
            return Some(self.execute(command).await);
        }
        let console = self.clone();
        let outputs = outputs.clone();
        tasks.spawn(async move {
            let _ = outputs.send(console.execute(command).await);
        });
        None
    }

    pub async fn execute(&self, command: Command) -> Result<Output> {
        let node = &self.node;
        let output = match command {
            Command::Join(raw) => {
                let descriptor = Descriptor::parse(&raw)?;
                node.join_channel(&descriptor).await?;
                let text = format!("Joined {descriptor}");
                self.set_current(descriptor);
                Output::Text(text)
            }
            Command::Leave(raw) => {
                let descriptor = self.target(raw.as_deref())?;
                node.leave_channel(&descriptor).await?;
                let mut current = self.current_slot();
                if current.as_ref() == Some(&descriptor) {
                    *current = node.joined_channels().pop();
                }
                Output::Text(format!("Left {descriptor}"))
            }
            Command::Msg { target, text } => {
                let descriptor = Descriptor::parse(&target)?;
                node.post(&descriptor, &text)?;
                Output::Silent
            }
            Command::Say(text) => {
                let descriptor = self.target(None)?;
                node.post(&descriptor, &text)?;
                Output::Silent
            }
            Command::Rejoin(Some(raw)) => {
                let descriptor = Descriptor::parse(&raw)?;
                let connected = node.rejoin_channel(&descriptor).await?;
                Output::Text(format!("Connected to {connected} peers for {descriptor}"))
            }
            Command::Rejoin(None) => {
                node.rejoin_all().await;
                Output::Text("Rejoined all channels".to_string())
            }
            Command::Announce(Some(raw)) => {
                let descriptor = Descriptor::parse(&raw)?;
                node.announce_channel(&descriptor).await?;
                Output::Text(format!("Announced {descriptor}"))
            }
            Command::Announce(None) => {
                node.announce_all().await;
                Output::Text("Announced all channels".to_string())
            }
            Command::Members(raw) => {
                let descriptor = self.target(raw.as_deref())?;
                let members = node.connected_members(&descriptor).await;
                let names: Vec<String> = members.iter().map(PeerId::short).collect();
                Output::Text(format!(
                    "{} ({}): {}",
                    descriptor,
                    members.len(),
                    names.join(", ")
                ))
            }
            Command::Stat(raw) => {
                let descriptor = Descriptor::parse(&raw)?;
                Output::Text(format_channel_info(&node.channel_info(&descriptor).await?))
            }
            Command::Peers => {
                let peers = node.peer_connections().await?;
                let mut text = format!("Connected peers ({}):", peers.len());
                for (peer, conns) in peers {
                    text.push_str(&format!("\n| {peer} ({conns} connections)"));
                }
                Output::Text(text)
            }
            Command::Ping(raw) => {
                let peer: PeerId = raw.parse()?;
                let mut lines = Vec::with_capacity(PING_COUNT);
                for _ in 0..PING_COUNT {
                    let rtt = node.ping(peer).await?;
                    lines.push(format!("RTT to {peer}: {rtt:?}"));
                }
                Output::Text(lines.join("\n"))
            }
            Command::Status => {
                let status = node.status().await?;
                let channels: Vec<String> =
                    node.joined_channels().iter().map(ToString::to_string).collect();
                Output::Text(format!(
                    "{} | {} connected, {} known, {} topics{} | channels: {}",
                    status.state,
                    status.connected_peers,
                    status.known_peers,
                    status.subscription_count,
                    if status.nat_restricted { " | behind NAT" } else { "" },
                    channels.join(" ")
                ))
            }
            Command::Id => Output::Text(node.local_id().to_string()),
            Command::Connect(raw) => {
                let peer: PeerId = raw.parse()?;
                node.connect_peer(&PeerInfo::new(peer)).await?;
                Output::Text(format!("Connected to {peer}"))
            }
            Command::Help => Output::Text(HELP.to_string()),
            Command::Quit => Output::Quit,
        };
        Ok(output)
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Render `/stat` output for a channel.
pub fn format_channel_info(info: &ChannelInfo) -> String {
    let mut text = format!(
        "Channel {}\n Full descriptor: {}\n We are member: {}",
        info.name,
        info.descriptor,
        yes_no(info.joined)
    );
    if !info.protected_members.is_empty() {
        text.push_str(&format!("\n Protected members: {}", info.protected_members.len()));
    }
    if !info.connected_members.is_empty() {
        text.push_str("\nConnected members:");
        for peer in &info.connected_members {
            text.push_str(&format!("\n| {peer}"));
        }
    }
    text
}

/// Render an inbound message for display.
pub fn format_message(message: &Message) -> String {
    format!(
        "<{}> {}: {}",
        message.channel,
        message.sender.short(),
        message.text
    )
}
