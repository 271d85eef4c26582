// Copyright (c) 2024 Botho Foundation

//! Messenger: the application-facing facade.
//!
//! Ties the node, the connection broker and the discovery services together.
//! Starting a messenger binds the listener, learns this device's addresses,
//! registers with the rendezvous service when one is configured, and keeps
//! the registration alive. Sending to a peer without a live connection
//! establishes one first.

use crate::{
    identity::{ContactCard, DeviceId, Fingerprint, KeyStore, PeerDirectory},
    network::{
        rendezvous::DEFAULT_HEARTBEAT_INTERVAL, spawn_heartbeat, BrokerConfig, BrokerError, Candidate,
        ConnectTarget, ConnectionBroker, NodeConfig, NodeError, NodeEvent, P2PNode, PeerAddressInfo,
        ReceivedMessage, RendezvousClient, SelfAddresses, StunClient, StunConfig, TcpDialer,
    },
};
use dashmap::DashSet;
use parking_lot::Mutex;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often pending connect requests are polled while registered.
pub const DEFAULT_CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Errors surfaced to the application.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// No connection exists and none could be established.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(DeviceId),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Messenger configuration.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub node: NodeConfig,
    pub broker: BrokerConfig,
    /// STUN self-discovery; `None` skips it.
    pub stun: Option<StunConfig>,
    pub heartbeat_interval: Duration,
    pub connect_poll_interval: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            broker: BrokerConfig::default(),
            stun: Some(StunConfig::default()),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_poll_interval: DEFAULT_CONNECT_POLL_INTERVAL,
        }
    }
}

impl MessengerConfig {
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }

    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_stun(mut self, stun: Option<StunConfig>) -> Self {
        self.stun = stun;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_poll_interval(mut self, interval: Duration) -> Self {
        self.connect_poll_interval = interval;
        self
    }
}

/// A running messenger.
pub struct Messenger {
    keystore: Arc<KeyStore>,
    node: Arc<P2PNode>,
    broker: Arc<ConnectionBroker<TcpDialer>>,
    listen_addr: SocketAddr,
    advertised: PeerAddressInfo,
    registered: bool,
    dialing: Arc<DashSet<DeviceId>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Messenger {
    /// Start listening and, when `rendezvous` is given, register with it.
    ///
    /// Discovery failures are not fatal: without STUN the local address is
    /// advertised as public, and without a reachable rendezvous service only
    /// manual connections work.
    pub async fn start(
        keystore: Arc<KeyStore>,
        directory: PeerDirectory,
        config: MessengerConfig,
        rendezvous: Option<Arc<dyn RendezvousClient>>,
    ) -> Result<Self, MessengerError> {
        let device = keystore.device_id();
        let node = Arc::new(P2PNode::new(keystore.clone(), directory, config.node.clone()));
        let listen_addr = node.listen().await?;

        let this_node = discover_self(listen_addr, config.stun.as_ref()).await;
        let advertised = advertised_addresses(listen_addr, &this_node);
        info!(
            device = %device.short(),
            behind_nat = this_node.behind_nat(),
            "Advertising public {:?}, local {:?}",
            advertised.public_addr,
            advertised.local_addr
        );

        let mut broker = ConnectionBroker::new(device, TcpDialer::new(Some(listen_addr.port())), config.broker)
            .with_self_addresses(this_node);
        if let Some(client) = &rendezvous {
            broker = broker.with_rendezvous(client.clone());
        }

        let mut messenger = Self {
            keystore,
            node,
            broker: Arc::new(broker),
            listen_addr,
            advertised,
            registered: false,
            dialing: Arc::new(DashSet::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };

        if let Some(client) = rendezvous {
            match client.register(device, advertised).await {
                Ok(()) => {
                    info!("Registered with rendezvous service");
                    messenger.registered = true;
                    let heartbeat = spawn_heartbeat(
                        client.clone(),
                        device,
                        advertised,
                        config.heartbeat_interval,
                        messenger.shutdown.child_token(),
                    );
                    let poller = messenger.spawn_connect_request_poller(client, config.connect_poll_interval);
                    messenger.tasks.lock().extend([heartbeat, poller]);
                }
                Err(e) => warn!("Rendezvous registration failed, manual connections only: {}", e),
            }
        }

        Ok(messenger)
    }

    pub fn device_id(&self) -> DeviceId {
        self.keystore.device_id()
    }

    /// Contact card to hand to peers out of band.
    pub fn device_identity(&self) -> ContactCard {
        ContactCard::new(self.keystore.device_id(), self.keystore.public_key().clone())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.keystore.fingerprint()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Addresses registered with the rendezvous service.
    pub fn advertised_addresses(&self) -> PeerAddressInfo {
        self.advertised
    }

    pub fn self_addresses(&self) -> &SelfAddresses {
        self.broker.self_addresses()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn node(&self) -> &P2PNode {
        &self.node
    }

    /// Trust a peer's contact card. `address_hint` is tried before a
    /// rendezvous lookup when sending to a peer that is not connected.
    pub fn add_peer(&self, card: ContactCard, label: Option<String>, address_hint: Option<SocketAddr>) {
        info!(peer = %card.device_id.short(), fingerprint = %card.fingerprint(), "Added peer");
        self.node.directory().insert(card, label, address_hint);
    }

    /// Establish a connection and complete the key exchange.
    ///
    /// A stream that fails the handshake counts as a failed try, so the
    /// broker moves on to the peer's next address. Returns the strategy that
    /// connected, or `None` if the peer was already connected.
    pub async fn connect(&self, target: ConnectTarget) -> Result<Option<Candidate>, MessengerError> {
        let peer = target.peer();
        if !self.node.directory().contains(&peer) {
            return Err(NodeError::UnknownPeer(peer).into());
        }
        if self.node.is_connected(&peer) {
            debug!(peer = %peer.short(), "Already connected");
            return Ok(None);
        }
        let node: &P2PNode = &self.node;
        let (via, ()) = self
            .broker
            .connect_with(target, &self.shutdown.child_token(), move |stream| {
                P2PNode::attach_outbound(node, peer, stream)
            })
            .await?;
        Ok(Some(via))
    }

    /// Send `plaintext` to `peer`, connecting first if needed.
    pub async fn send_message(&self, peer: &DeviceId, plaintext: &[u8]) -> Result<(), MessengerError> {
        if !self.node.is_connected(peer) {
            self.reach(*peer).await?;
        }
        self.node.send(peer, plaintext).await?;
        Ok(())
    }

    /// Register a delivery callback.
    pub fn on_message_received<F>(&self, callback: F)
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        self.node.on_message_received(callback);
    }

    /// Take the event receiver (can only be called once)
    pub fn events(&self) -> Option<mpsc::Receiver<NodeEvent>> {
        self.node.take_event_receiver()
    }

    pub fn disconnect(&self, peer: &DeviceId) -> bool {
        self.node.disconnect(peer)
    }

    pub fn connected_peers(&self) -> Vec<DeviceId> {
        self.node.connected_peers()
    }

    /// Close every connection, stop background tasks and unregister.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.node.shutdown();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }
        info!("Messenger stopped");
    }

    /// Try the directory's address hint, then a rendezvous lookup.
    async fn reach(&self, peer: DeviceId) -> Result<(), MessengerError> {
        let record = self
            .node
            .directory()
            .get(&peer)
            .ok_or(NodeError::UnknownPeer(peer))?;

        let mut targets = Vec::with_capacity(2);
        if let Some(addr) = record.address_hint {
            targets.push(ConnectTarget::Address { peer, addr });
        }
        if self.broker.rendezvous().is_some() {
            targets.push(ConnectTarget::Lookup(peer));
        }

        for target in targets {
            match self.connect(target).await {
                Ok(via) => {
                    if let Some(via) = via {
                        debug!(peer = %peer.short(), strategy = %via.strategy, "Connected on demand");
                    }
                    return Ok(());
                }
                // Shutdown wins over any further target.
                Err(MessengerError::Broker(BrokerError::Cancelled)) => {
                    return Err(BrokerError::Cancelled.into());
                }
                Err(e) => debug!(peer = %peer.short(), "Connect via {:?} failed: {}", target, e),
            }
        }
        Err(MessengerError::PeerUnreachable(peer))
    }

    /// Answer connect requests posted for this device by dialing back.
    fn spawn_connect_request_poller(
        &self,
        client: Arc<dyn RendezvousClient>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let device = self.device_id();
        let node = self.node.clone();
        let broker = self.broker.clone();
        let dialing = self.dialing.clone();
        let shutdown = self.shutdown.child_token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let requests = match client.pending_connect_requests(device).await {
                    Ok(requests) => requests,
                    Err(e) => {
                        debug!("Polling connect requests failed: {}", e);
                        continue;
                    }
                };

                for request in requests {
                    let requester = request.requester;
                    if let Err(e) = client.clear_connect_request(device, requester).await {
                        debug!("Clearing connect request failed: {}", e);
                    }
                    if !node.directory().contains(&requester) {
                        debug!(peer = %requester.short(), "Ignoring connect request from unknown device");
                        continue;
                    }
                    if node.is_connected(&requester) || !dialing.insert(requester) {
                        continue;
                    }

                    info!(peer = %requester.short(), "Answering connect request");
                    let node = node.clone();
                    let broker = broker.clone();
                    let dialing = dialing.clone();
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        let node: &P2PNode = &node;
                        let attach = move |stream| P2PNode::attach_outbound(node, requester, stream);
                        if let Err(e) = broker.dial_back_with(requester, &request.info, &cancel, attach).await {
                            debug!(peer = %requester.short(), "Dial-back failed: {}", e);
                        }
                        dialing.remove(&requester);
                    });
                }
            }
        })
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// STUN from a UDP socket on the listening port, so the mapping tends to
/// match the port peers will dial; any free port if that one is taken.
async fn discover_self(listen_addr: SocketAddr, stun: Option<&StunConfig>) -> SelfAddresses {
    let local = match listen_addr.ip() {
        ip if ip.is_unspecified() => crate::network::stun::local_ip().await,
        ip => Some(ip),
    };
    let Some(config) = stun else {
        return SelfAddresses { public: None, local };
    };

    let client = StunClient::new(config.clone());
    let result = match UdpSocket::bind(listen_addr).await {
        Ok(socket) => client.discover_from(&socket).await,
        Err(_) => client.discover_public_address().await,
    };
    let public = match result {
        Ok(result) => Some(result.mapped_address),
        Err(e) => {
            warn!("STUN discovery failed, advertising local address only: {}", e);
            None
        }
    };
    SelfAddresses { public, local }
}

/// Addresses peers should dial: the discovered IPs with the TCP listening
/// port. Without a public address the local one stands in.
fn advertised_addresses(listen_addr: SocketAddr, this_node: &SelfAddresses) -> PeerAddressInfo {
    let port = listen_addr.port();
    let local = this_node.local.map(|ip: IpAddr| SocketAddr::new(ip, port));
    let public = this_node
        .public
        .map(|mapped| SocketAddr::new(mapped.ip(), port))
        .or(local);
    PeerAddressInfo::new(public, local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{
        obfuscation::{DecoyConfig, JitterConfig},
        ConnectRequest, ObfuscationConfig, RendezvousError, Strategy,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn quiet_config() -> MessengerConfig {
        let obfuscation = ObfuscationConfig::default()
            .with_decoys(DecoyConfig::disabled())
            .with_jitter(JitterConfig::disabled());
        MessengerConfig::default()
            .with_node(
                NodeConfig::default()
                    .with_listen_addr("127.0.0.1:0".parse().unwrap())
                    .with_obfuscation(obfuscation),
            )
            .with_stun(None)
            .with_connect_poll_interval(Duration::from_millis(50))
    }

    async fn start(rendezvous: Option<Arc<dyn RendezvousClient>>) -> Messenger {
        let keystore = Arc::new(KeyStore::generate().unwrap());
        Messenger::start(keystore, PeerDirectory::new(), quiet_config(), rendezvous)
            .await
            .unwrap()
    }

    #[derive(Default)]
    struct FakeRendezvous {
        devices: Mutex<HashMap<DeviceId, PeerAddressInfo>>,
        requests: Mutex<HashMap<DeviceId, Vec<ConnectRequest>>>,
    }

    #[async_trait]
    impl RendezvousClient for FakeRendezvous {
        async fn register(&self, device: DeviceId, info: PeerAddressInfo) -> Result<(), RendezvousError> {
            self.devices.lock().insert(device, info);
            Ok(())
        }

        async fn lookup(&self, device: DeviceId) -> Result<Option<PeerAddressInfo>, RendezvousError> {
            Ok(self.devices.lock().get(&device).copied())
        }

        async fn heartbeat(&self, device: DeviceId) -> Result<(), RendezvousError> {
            if self.devices.lock().contains_key(&device) {
                Ok(())
            } else {
                Err(RendezvousError::NotRegistered)
            }
        }

        async fn unregister(&self, device: DeviceId) -> Result<(), RendezvousError> {
            self.devices.lock().remove(&device);
            Ok(())
        }

        async fn request_connect(
            &self,
            requester: DeviceId,
            target: DeviceId,
        ) -> Result<Option<PeerAddressInfo>, RendezvousError> {
            let devices = self.devices.lock();
            let (Some(info), Some(target_info)) = (devices.get(&requester), devices.get(&target)) else {
                return Ok(None);
            };
            self.requests.lock().entry(target).or_default().push(ConnectRequest {
                requester,
                info: *info,
                timestamp: 0.0,
            });
            Ok(Some(*target_info))
        }

        async fn pending_connect_requests(&self, device: DeviceId) -> Result<Vec<ConnectRequest>, RendezvousError> {
            Ok(self.requests.lock().get(&device).cloned().unwrap_or_default())
        }

        async fn clear_connect_request(&self, target: DeviceId, requester: DeviceId) -> Result<(), RendezvousError> {
            if let Some(pending) = self.requests.lock().get_mut(&target) {
                pending.retain(|request| request.requester != requester);
            }
            Ok(())
        }
    }

    async fn wait_connected(events: &mut mpsc::Receiver<NodeEvent>) -> DeviceId {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        match event {
            NodeEvent::PeerConnected(peer) => peer,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_advertised_falls_back_to_local() {
        let listen: SocketAddr = "0.0.0.0:7100".parse().unwrap();
        let this_node = SelfAddresses {
            public: None,
            local: Some("192.168.1.20".parse().unwrap()),
        };
        let info = advertised_addresses(listen, &this_node);
        assert_eq!(info.local_addr, Some("192.168.1.20:7100".parse().unwrap()));
        assert_eq!(info.public_addr, info.local_addr);

        // The mapped UDP port is replaced by the TCP listening port.
        let this_node = SelfAddresses {
            public: Some("203.0.113.9:55000".parse().unwrap()),
            local: Some("192.168.1.20".parse().unwrap()),
        };
        let info = advertised_addresses(listen, &this_node);
        assert_eq!(info.public_addr, Some("203.0.113.9:7100".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_device_identity_card() {
        let messenger = start(None).await;
        let card = ContactCard::decode(&messenger.device_identity().encode()).unwrap();
        assert_eq!(card.device_id, messenger.device_id());
        assert_eq!(card.fingerprint(), messenger.fingerprint());
        assert!(!messenger.is_registered());
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_connects_through_address_hint() {
        let alice = start(None).await;
        let bob = start(None).await;
        alice.add_peer(bob.device_identity(), Some("bob".into()), Some(bob.listen_addr()));
        bob.add_peer(alice.device_identity(), None, None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on_message_received(move |message| {
            let _ = tx.send((message.from, message.plaintext.clone()));
        });

        alice.send_message(&bob.device_id(), b"hello").await.unwrap();
        let (from, plaintext) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, alice.device_id());
        assert_eq!(plaintext, b"hello");
        assert_eq!(alice.connected_peers(), vec![bob.device_id()]);

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_without_route_is_unreachable() {
        let alice = start(None).await;
        let bob = start(None).await;
        alice.add_peer(bob.device_identity(), None, None);

        let result = alice.send_message(&bob.device_id(), b"hi").await;
        assert!(matches!(result, Err(MessengerError::PeerUnreachable(peer)) if peer == bob.device_id()));
        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let alice = start(None).await;
        let stranger = DeviceId::from_bytes([9; 16]);
        let result = alice.send_message(&stranger, b"hi").await;
        assert!(matches!(result, Err(MessengerError::Node(NodeError::UnknownPeer(_)))));
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_by_lookup() {
        let rendezvous = Arc::new(FakeRendezvous::default());
        let alice = start(Some(rendezvous.clone())).await;
        let bob = start(Some(rendezvous.clone())).await;
        assert!(alice.is_registered());
        alice.add_peer(bob.device_identity(), None, None);
        bob.add_peer(alice.device_identity(), None, None);

        let via = alice.connect(ConnectTarget::Lookup(bob.device_id())).await.unwrap();
        assert_eq!(via.unwrap().addr, bob.advertised_addresses().local_addr.unwrap());
        assert!(alice.node().is_connected(&bob.device_id()));

        // A second connect finds the live connection
        assert!(alice.connect(ConnectTarget::Lookup(bob.device_id())).await.unwrap().is_none());

        alice.shutdown().await;
        assert!(rendezvous.lookup(alice.device_id()).await.unwrap().is_none());
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_handshake_tries_next_address() {
        let rendezvous = Arc::new(FakeRendezvous::default());
        let mut config = quiet_config();
        config.node.handshake_timeout = Duration::from_secs(1);
        let alice = Messenger::start(
            Arc::new(KeyStore::generate().unwrap()),
            PeerDirectory::new(),
            config,
            Some(rendezvous.clone()),
        )
        .await
        .unwrap();
        let bob = start(None).await;
        let carol = start(None).await;
        alice.add_peer(bob.device_identity(), None, None);
        bob.add_peer(alice.device_identity(), None, None);
        carol.add_peer(alice.device_identity(), None, None);

        // Bob's advertised LAN address is now served by carol
        rendezvous.devices.lock().insert(
            bob.device_id(),
            PeerAddressInfo::new(Some(bob.listen_addr()), Some(carol.listen_addr())),
        );

        let via = alice
            .connect(ConnectTarget::Lookup(bob.device_id()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(via.strategy, Strategy::DirectPublic);
        assert_eq!(via.addr, bob.listen_addr());
        assert!(alice.node().is_connected(&bob.device_id()));
        assert!(carol.connected_peers().is_empty());

        alice.shutdown().await;
        bob.shutdown().await;
        carol.shutdown().await;
    }

    #[tokio::test]
    async fn test_answers_connect_request() {
        let rendezvous = Arc::new(FakeRendezvous::default());
        let alice = start(Some(rendezvous.clone())).await;
        let bob = start(Some(rendezvous.clone())).await;
        alice.add_peer(bob.device_identity(), None, None);
        bob.add_peer(alice.device_identity(), None, None);
        let mut bob_events = bob.events().unwrap();

        // Bob asks Alice to dial back at his local address.
        rendezvous.requests.lock().entry(alice.device_id()).or_default().push(ConnectRequest {
            requester: bob.device_id(),
            info: PeerAddressInfo::new(None, Some(bob.listen_addr())),
            timestamp: 0.0,
        });

        assert_eq!(wait_connected(&mut bob_events).await, alice.device_id());
        assert!(rendezvous.requests.lock()[&alice.device_id()].is_empty());

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_ignores_connect_request_from_stranger() {
        let rendezvous = Arc::new(FakeRendezvous::default());
        let alice = start(Some(rendezvous.clone())).await;
        let bob = start(Some(rendezvous.clone())).await;
        bob.add_peer(alice.device_identity(), None, None);

        rendezvous.requests.lock().entry(alice.device_id()).or_default().push(ConnectRequest {
            requester: bob.device_id(),
            info: PeerAddressInfo::new(None, Some(bob.listen_addr())),
            timestamp: 0.0,
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rendezvous.requests.lock()[&alice.device_id()].is_empty());
        assert!(alice.connected_peers().is_empty());

        alice.shutdown().await;
        bob.shutdown().await;
    }
}
