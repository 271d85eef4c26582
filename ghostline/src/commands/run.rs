// Copyright (c) 2024 Botho Foundation

use anyhow::{Context, Result};
use std::{net::SocketAddr, path::Path, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{
    config::Config,
    identity::{ContactCard, DeviceId},
    messenger::Messenger,
    network::{ConnectTarget, NodeEvent, ReceivedMessage},
};

/// Parse `<device_id>@<addr>`.
pub fn parse_connect_target(s: &str) -> Result<ConnectTarget, String> {
    let (peer, addr) = s
        .split_once('@')
        .ok_or_else(|| "expected <device_id>@<ip:port>".to_string())?;
    let peer: DeviceId = peer.parse().map_err(|e| format!("{}", e))?;
    let addr: SocketAddr = addr.parse().map_err(|e| format!("invalid address {:?}: {}", addr, e))?;
    Ok(ConnectTarget::Address { peer, addr })
}

/// Run the messenger until Ctrl+C
pub fn run(config_path: &Path, target: Option<ConnectTarget>) -> Result<()> {
    let config = Config::load(config_path).context("No config found. Run 'ghostline init' first.")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async { run_async(config, config_path, target).await })
}

async fn run_async(config: Config, config_path: &Path, target: Option<ConnectTarget>) -> Result<()> {
    let keystore = Arc::new(super::open_keystore(&config, config_path)?);
    let contacts = Contacts::from_config(&config);
    let messenger = Messenger::start(
        keystore,
        config.peer_directory()?,
        config.messenger_config(),
        config.rendezvous_client()?,
    )
    .await
    .context("Failed to start messenger")?;

    println!(
        "Ghostline running as {} [{}] ({}). Press Ctrl+C to stop.",
        config.device_name(&messenger.device_id()),
        messenger.device_id(),
        messenger.fingerprint()
    );
    println!("Listening on {}", messenger.listen_addr());
    if !messenger.is_registered() {
        println!("No rendezvous service: manual connections only.");
    }
    println!("Type a line to send it. Commands: /to <peer>, /peers, /quit");

    let mut events = messenger.events();
    let (inbox_tx, mut inbox) = mpsc::unbounded_channel::<ReceivedMessage>();
    messenger.on_message_received(move |message| {
        let _ = inbox_tx.send(message.clone());
    });

    let mut recipient = target.map(|target| target.peer()).or_else(|| contacts.only());
    if let Some(target) = target {
        match messenger.connect(target).await {
            Ok(Some(via)) => println!("Connected to {} via {}", contacts.name(&target.peer()), via.strategy),
            Ok(None) => println!("Already connected to {}", contacts.name(&target.peer())),
            Err(e) => println!("Could not connect to {}: {}", contacts.name(&target.peer()), e),
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            Some(message) = inbox.recv() => {
                println!(
                    "[{}] {}",
                    contacts.name(&message.from),
                    String::from_utf8_lossy(&message.plaintext)
                );
            }
            Some(event) = next_event(&mut events) => match event {
                NodeEvent::PeerConnected(peer) => println!("* {} connected", contacts.name(&peer)),
                NodeEvent::PeerDisconnected { peer, reason } => {
                    println!("* {} disconnected ({})", contacts.name(&peer), reason)
                }
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_line(&messenger, &contacts, &mut recipient, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Reading stdin failed: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    println!("Shutting down...");
    messenger.shutdown().await;
    Ok(())
}

async fn next_event(events: &mut Option<mpsc::Receiver<NodeEvent>>) -> Option<NodeEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Returns false when the user asked to quit.
async fn handle_line(
    messenger: &Messenger,
    contacts: &Contacts,
    recipient: &mut Option<DeviceId>,
    line: &str,
) -> bool {
    if line.is_empty() {
        return true;
    }

    if let Some(name) = line.strip_prefix("/to ") {
        match contacts.resolve(name.trim()) {
            Some(peer) => {
                *recipient = Some(peer);
                println!("Sending to {}", contacts.name(&peer));
            }
            None => println!("Unknown peer {:?}", name.trim()),
        }
        return true;
    }

    match line {
        "/quit" => return false,
        "/peers" => {
            let connected = messenger.connected_peers();
            for (peer, _) in &contacts.entries {
                let state = if connected.contains(peer) { "connected" } else { "offline" };
                println!("  {} {} ({})", contacts.name(peer), peer, state);
            }
            return true;
        }
        _ => {}
    }

    let Some(peer) = *recipient else {
        println!("No recipient. Use /to <peer> first.");
        return true;
    };
    if let Err(e) = messenger.send_message(&peer, line.as_bytes()).await {
        println!("Send to {} failed: {}", contacts.name(&peer), e);
    }
    true
}

/// Configured peers by device id and label.
struct Contacts {
    entries: Vec<(DeviceId, Option<String>)>,
}

impl Contacts {
    fn from_config(config: &Config) -> Self {
        let entries = config
            .peers
            .iter()
            .filter_map(|entry| {
                let card = ContactCard::decode(&entry.card).ok()?;
                Some((card.device_id, entry.label.clone()))
            })
            .collect();
        Self { entries }
    }

    /// The single configured peer, if there is exactly one.
    fn only(&self) -> Option<DeviceId> {
        match self.entries.as_slice() {
            [(peer, _)] => Some(*peer),
            _ => None,
        }
    }

    /// Match a label, a full device id, or a unique device id prefix.
    fn resolve(&self, name: &str) -> Option<DeviceId> {
        if let Some((peer, _)) = self
            .entries
            .iter()
            .find(|(_, label)| label.as_deref() == Some(name))
        {
            return Some(*peer);
        }
        let name = name.to_ascii_lowercase();
        let mut matches = self
            .entries
            .iter()
            .filter(|(peer, _)| peer.to_string().starts_with(&name));
        match (matches.next(), matches.next()) {
            (Some((peer, _)), None) if !name.is_empty() => Some(*peer),
            _ => None,
        }
    }

    fn name(&self, peer: &DeviceId) -> String {
        self.entries
            .iter()
            .find(|(id, _)| id == peer)
            .and_then(|(_, label)| label.clone())
            .unwrap_or_else(|| peer.short())
    }
}
