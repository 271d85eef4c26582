// Copyright (c) 2024 Botho Foundation

//! Peer-to-peer node.
//!
//! Owns the listening socket and the table of live connections, one per
//! peer. Streams become connections only after the key-exchange handshake
//! (see [`super::connection`]); anything that fails to identify itself is
//! dropped without a reply.

use super::{
    connection::{
        self, ConnectionError, ConnectionHandle, ConnectionId, ConnectionObserver, Direction,
        DisconnectReason, LinkContext, ReceivedMessage, DEFAULT_HANDSHAKE_TIMEOUT,
    },
    obfuscation::{ObfuscationConfig, Obfuscator},
};
use crate::{
    crypto::MessageCipher,
    identity::{DeviceId, KeyStore, PeerDirectory},
    session::{SessionConfig, SessionManager},
};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Mutex, RwLock};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpSocket},
    sync::{mpsc, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default listen address: all interfaces, OS-assigned port.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:0";

/// Errors from the node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// No live connection to the peer.
    #[error("not connected to {0}")]
    NotConnected(DeviceId),

    /// No connection and none could be established.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(DeviceId),

    /// The peer's contact card was never added.
    #[error("unknown peer: {0}")]
    UnknownPeer(DeviceId),

    #[error("already listening on {0}")]
    AlreadyListening(SocketAddr),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Events from the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Handshake completed, messages can flow.
    PeerConnected(DeviceId),
    /// Connection gone. Session state for the peer is discarded unless a
    /// new handshake with it is under way.
    PeerDisconnected {
        peer: DeviceId,
        reason: DisconnectReason,
    },
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
    pub obfuscation: ObfuscationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session: SessionConfig::default(),
            obfuscation: ObfuscationConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_obfuscation(mut self, obfuscation: ObfuscationConfig) -> Self {
        self.obfuscation = obfuscation;
        self
    }
}

type MessageCallback = Arc<dyn Fn(&ReceivedMessage) + Send + Sync>;

struct NodeInner {
    ctx: Arc<LinkContext>,
    directory: PeerDirectory,
    peers: DashMap<DeviceId, ConnectionHandle>,
    /// Handshakes in flight per peer.
    handshakes: DashMap<DeviceId, usize>,
    registered: Notify,
    callbacks: RwLock<Vec<MessageCallback>>,
    event_tx: mpsc::Sender<NodeEvent>,
    next_connection: AtomicU64,
}

impl NodeInner {
    fn emit(&self, event: NodeEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!("Dropped node event: {}", e);
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    fn live_connection(&self, peer: &DeviceId) -> Option<ConnectionId> {
        self.peers
            .get(peer)
            .filter(|handle| !handle.is_closed())
            .map(|handle| handle.id())
    }

    fn initiator(&self, peer: DeviceId, direction: Direction) -> DeviceId {
        match direction {
            Direction::Outbound => self.ctx.local_id,
            Direction::Inbound => peer,
        }
    }

    /// Two fresh connections opened from opposite ends have crossed. Both
    /// sides keep the one opened by the smaller device id.
    fn keeps_existing(&self, peer: DeviceId, existing: &ConnectionHandle, direction: Direction) -> bool {
        let existing_initiator = self.initiator(peer, existing.direction());
        !existing.is_closed()
            && existing.direction() != direction
            && existing.opened_at().elapsed() < self.ctx.handshake_timeout
            && existing_initiator < self.initiator(peer, direction)
    }

    fn begin_handshake(self: &Arc<Self>, peer: DeviceId) -> HandshakeGuard {
        *self.handshakes.entry(peer).or_insert(0) += 1;
        HandshakeGuard {
            inner: self.clone(),
            peer,
        }
    }

    /// Start the connection unless a crossing one is kept instead.
    fn register<S>(self: &Arc<Self>, peer: DeviceId, framed: connection::UnitStream<S>, direction: Direction)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_id();
        let observer: Arc<dyn ConnectionObserver> = self.clone();
        let handle = match self.peers.entry(peer) {
            Entry::Occupied(mut entry) => {
                if self.keeps_existing(peer, entry.get(), direction) {
                    debug!(peer = %peer.short(), kept = %entry.get().id(), "Dropping crossing connection");
                    return;
                }
                let handle = connection::spawn(self.ctx.clone(), observer, id, peer, direction, framed);
                let previous = entry.insert(handle.clone());
                debug!(peer = %peer.short(), old = %previous.id(), new = %id, "Replacing connection");
                previous.close(DisconnectReason::Replaced);
                handle
            }
            Entry::Vacant(entry) => {
                let handle = connection::spawn(self.ctx.clone(), observer, id, peer, direction, framed);
                entry.insert(handle.clone());
                handle
            }
        };
        self.registered.notify_waiters();

        // Died before it was registered
        if handle.is_closed() {
            self.peers.remove_if(&peer, |_, h| h.id() == id);
            return;
        }

        info!(peer = %peer.short(), connection = %id, "Peer connected");
        self.emit(NodeEvent::PeerConnected(peer));
    }

    /// Wait until some connection to `peer` is registered, up to `deadline`.
    async fn await_connection(&self, peer: &DeviceId, deadline: Instant) -> bool {
        loop {
            let notified = self.registered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live_connection(peer).is_some() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.live_connection(peer).is_some();
            }
        }
    }

    async fn attach_outbound<S>(self: &Arc<Self>, peer: DeviceId, stream: S) -> Result<(), NodeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if !self.directory.contains(&peer) {
            return Err(NodeError::UnknownPeer(peer));
        }
        if let Some(existing) = self.live_connection(&peer) {
            debug!(peer = %peer.short(), connection = %existing, "Already connected, dropping new stream");
            return Ok(());
        }

        let deadline = Instant::now() + self.ctx.handshake_timeout;
        let _handshake = self.begin_handshake(peer);
        let mut framed = connection::frame(stream, &self.ctx.obfuscator);
        match connection::handshake_outbound(&self.ctx, &mut framed, peer).await {
            Ok(()) => {
                self.register(peer, framed, Direction::Outbound);
                Ok(())
            }
            // The peer may have closed this stream for a crossing one it dialed
            Err(e @ (ConnectionError::Closed | ConnectionError::HandshakeTimeout)) => {
                drop(framed);
                if self.await_connection(&peer, deadline).await {
                    debug!(peer = %peer.short(), "Connected through a crossing stream");
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn attach_inbound<S>(self: &Arc<Self>, stream: S) -> Result<DeviceId, NodeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut handshake = None;
        let mut framed = connection::frame(stream, &self.ctx.obfuscator);
        let peer = connection::handshake_inbound(&self.ctx, &mut framed, |claimed| {
            handshake.get_or_insert_with(|| self.begin_handshake(claimed));
        })
        .await?;
        self.register(peer, framed, Direction::Inbound);
        Ok(peer)
    }
}

/// Marks a handshake with `peer` in flight. While any is, closing an older
/// connection keeps the peer's session state. The last one to finish drops
/// that state if no connection was registered.
struct HandshakeGuard {
    inner: Arc<NodeInner>,
    peer: DeviceId,
}

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        let idle = match self.inner.handshakes.entry(self.peer) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        };
        if idle && !self.inner.peers.contains_key(&self.peer) {
            self.inner.ctx.sessions.remove_peer(&self.peer);
        }
    }
}

impl ConnectionObserver for NodeInner {
    fn on_message(&self, message: ReceivedMessage) {
        let callbacks: Vec<MessageCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            callback(&message);
        }
    }

    fn on_closed(&self, peer: DeviceId, id: ConnectionId, reason: DisconnectReason) {
        // Only the registered connection owns the peer's state
        if self.peers.remove_if(&peer, |_, h| h.id() == id).is_none() {
            return;
        }
        if self.handshakes.contains_key(&peer) {
            debug!(peer = %peer.short(), "Keeping session state for a handshake in flight");
        } else {
            self.ctx.sessions.remove_peer(&peer);
        }
        info!(peer = %peer.short(), "Peer disconnected: {}", reason);
        self.emit(NodeEvent::PeerDisconnected { peer, reason });
    }
}

/// A node: one listener, one connection per peer.
pub struct P2PNode {
    inner: Arc<NodeInner>,
    config: NodeConfig,
    event_rx: Mutex<Option<mpsc::Receiver<NodeEvent>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl P2PNode {
    pub fn new(keystore: Arc<KeyStore>, directory: PeerDirectory, config: NodeConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);
        let local_id = keystore.device_id();
        let sessions = Arc::new(SessionManager::new(
            keystore,
            directory.clone(),
            config.session.clone(),
        ));

        let ctx = Arc::new(LinkContext {
            local_id,
            sessions,
            cipher: MessageCipher::new(),
            obfuscator: Obfuscator::new(config.obfuscation.clone()),
            handshake_timeout: config.handshake_timeout,
        });

        Self {
            inner: Arc::new(NodeInner {
                ctx,
                directory,
                peers: DashMap::new(),
                handshakes: DashMap::new(),
                registered: Notify::new(),
                callbacks: RwLock::new(Vec::new()),
                event_tx,
                next_connection: AtomicU64::new(1),
            }),
            config,
            event_rx: Mutex::new(Some(event_rx)),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.ctx.local_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.inner.directory
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.ctx.sessions
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind the configured address and start accepting.
    pub async fn listen(&self) -> Result<SocketAddr, NodeError> {
        if let Some(addr) = self.local_addr() {
            return Err(NodeError::AlreadyListening(addr));
        }
        let listener = bind_listener(self.config.listen_addr)?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!("Listening on {}", addr);

        tokio::spawn(accept_loop(
            self.inner.clone(),
            listener,
            self.shutdown.child_token(),
        ));
        Ok(addr)
    }

    /// Run the outbound handshake on a connected stream and start the
    /// connection. Returns once the session is ready.
    pub async fn attach_outbound<S>(&self, peer: DeviceId, stream: S) -> Result<(), NodeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.attach_outbound(peer, stream).await
    }

    /// Run the inbound handshake on an accepted stream.
    pub async fn attach_inbound<S>(&self, stream: S) -> Result<DeviceId, NodeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.attach_inbound(stream).await
    }

    /// Encrypt and send `plaintext` to a connected peer.
    pub async fn send(&self, peer: &DeviceId, plaintext: &[u8]) -> Result<(), NodeError> {
        let handle = self
            .inner
            .peers
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or(NodeError::NotConnected(*peer))?;
        handle.send(plaintext.to_vec()).await.map_err(|e| match e {
            ConnectionError::Closed => NodeError::NotConnected(*peer),
            e => e.into(),
        })
    }

    /// Register a delivery callback. Callbacks run on the connection's
    /// reader task and should not block.
    pub fn on_message_received<F>(&self, callback: F)
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push(Arc::new(callback));
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<NodeEvent>> {
        self.event_rx.lock().take()
    }

    pub fn is_connected(&self, peer: &DeviceId) -> bool {
        self.inner.peers.contains_key(peer)
    }

    pub fn connected_peers(&self) -> Vec<DeviceId> {
        self.inner.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Close the connection to `peer` and drop its session state. Long-term
    /// keys and the directory entry are kept.
    pub fn disconnect(&self, peer: &DeviceId) -> bool {
        let Some((_, handle)) = self.inner.peers.remove(peer) else {
            return false;
        };
        handle.close(DisconnectReason::Local);
        self.inner.ctx.sessions.remove_peer(peer);
        info!(peer = %peer.short(), "Disconnected");
        self.inner.emit(NodeEvent::PeerDisconnected {
            peer: *peer,
            reason: DisconnectReason::Local,
        });
        true
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for peer in self.connected_peers() {
            self.disconnect(&peer);
        }
    }
}

impl Drop for P2PNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bind with address and port reuse so hole-punch dials can share the port.
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn accept_loop(inner: Arc<NodeInner>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                debug!("Inbound stream from {}", remote);
                let inner = inner.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        result = inner.attach_inbound(stream) => match result {
                            Ok(peer) => debug!(peer = %peer.short(), "Inbound handshake complete"),
                            Err(e) => debug!("Closed unidentified stream from {}: {}", remote, e),
                        },
                    }
                });
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Accept loop stopped");
}
