// Copyright (c) 2024 Botho Foundation
//
//! Common test utilities for integration tests.
//!
//! Messengers here listen on loopback without STUN. [`RecordingProxy`] sits
//! between two of them and keeps every byte that crosses it.

#![allow(dead_code)]

mod rendezvous;

pub use rendezvous::*;

use ghostline::{
    identity::{KeyStore, PeerDirectory},
    network::{
        obfuscation::{DecoyConfig, JitterConfig},
        NodeConfig, ObfuscationConfig, ReceivedMessage, RendezvousClient,
    },
    Messenger, MessengerConfig,
};
use parking_lot::Mutex;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Obfuscation without decoys or jitter.
pub fn quiet_obfuscation() -> ObfuscationConfig {
    ObfuscationConfig::default()
        .with_decoys(DecoyConfig::disabled())
        .with_jitter(JitterConfig::disabled())
}

pub fn messenger_config(obfuscation: ObfuscationConfig) -> MessengerConfig {
    MessengerConfig::default()
        .with_node(
            NodeConfig::default()
                .with_listen_addr("127.0.0.1:0".parse().unwrap())
                .with_obfuscation(obfuscation),
        )
        .with_stun(None)
}

pub async fn start_messenger(config: MessengerConfig) -> Messenger {
    start_messenger_with(config, None).await
}

pub async fn start_messenger_with(
    config: MessengerConfig,
    rendezvous: Option<Arc<dyn RendezvousClient>>,
) -> Messenger {
    let keystore = Arc::new(KeyStore::generate().expect("key generation"));
    Messenger::start(keystore, PeerDirectory::new(), config, rendezvous)
        .await
        .expect("messenger start")
}

/// Two messengers that trust each other. Neither knows the other's address.
pub async fn trusted_pair(config: MessengerConfig) -> (Messenger, Messenger) {
    let a = start_messenger(config.clone()).await;
    let b = start_messenger(config).await;
    a.add_peer(b.device_identity(), Some("b".to_string()), None);
    b.add_peer(a.device_identity(), Some("a".to_string()), None);
    (a, b)
}

/// Channel fed by the messenger's delivery callback.
pub fn inbox(messenger: &Messenger) -> mpsc::UnboundedReceiver<ReceivedMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    messenger.on_message_received(move |message| {
        let _ = tx.send(message.clone());
    });
    rx
}

pub async fn recv(inbox: &mut mpsc::UnboundedReceiver<ReceivedMessage>) -> ReceivedMessage {
    tokio::time::timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("inbox closed")
}

/// Forwards one TCP connection to `upstream` and records both directions.
pub struct RecordingProxy {
    pub addr: SocketAddr,
    /// Bytes from the dialing side towards `upstream`.
    pub outbound: Arc<Mutex<Vec<u8>>>,
    /// Bytes from `upstream` back to the dialing side.
    pub inbound: Arc<Mutex<Vec<u8>>>,
}

impl RecordingProxy {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let inbound = Arc::new(Mutex::new(Vec::new()));

        let (out_log, in_log) = (outbound.clone(), inbound.clone());
        tokio::spawn(async move {
            let Ok((client, _)) = listener.accept().await else {
                return;
            };
            let Ok(server) = TcpStream::connect(upstream).await else {
                return;
            };
            let (client_rx, client_tx) = client.into_split();
            let (server_rx, server_tx) = server.into_split();
            tokio::spawn(pump(client_rx, server_tx, out_log));
            tokio::spawn(pump(server_rx, client_tx, in_log));
        });

        Self {
            addr,
            outbound,
            inbound,
        }
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    pub fn contains(&self, needle: &[u8]) -> bool {
        let found = |haystack: &[u8]| haystack.windows(needle.len()).any(|window| window == needle);
        found(&self.outbound.lock()) || found(&self.inbound.lock())
    }
}

async fn pump(
    mut from: tokio::net::tcp::OwnedReadHalf,
    mut to: tokio::net::tcp::OwnedWriteHalf,
    log: Arc<Mutex<Vec<u8>>>,
) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        log.lock().extend_from_slice(&buf[..n]);
        if to.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = to.shutdown().await;
}
