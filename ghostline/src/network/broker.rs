// Copyright (c) 2024 Botho Foundation

//! Connection establishment.
//!
//! The broker turns a [`ConnectTarget`] into a connected stream. It resolves
//! the peer's addresses (manual entry or rendezvous lookup), plans the
//! strategies that apply, and walks them in priority order:
//!
//! 1. [`Strategy::Local`]: the peer's LAN address, or a manual address that
//!    is private or loopback.
//! 2. [`Strategy::DirectPublic`]: the peer's public address.
//! 3. [`Strategy::HolePunch`]: when this node is behind NAT and a rendezvous
//!    service is available. A connect request asks the peer to dial back
//!    while both sides connect from their listening port.
//!
//! Each strategy has its own timeout and attempt budget. Progress is an
//! explicit [`ConnectionAttempt`] state machine owned by one `connect` call.
//! A stream that connects but fails the caller's check (the key-exchange
//! handshake, for the messenger) counts as a failed try of its strategy.

use super::{
    rendezvous::{PeerAddressInfo, RendezvousClient, RendezvousError},
    stun::SelfAddresses,
};
use crate::identity::DeviceId;
use async_trait::async_trait;
use std::{
    convert::Infallible,
    fmt,
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpSocket, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from connection establishment.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Every planned strategy used up its budget.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(DeviceId),

    #[error("connection attempt cancelled")]
    Cancelled,

    /// Lookup target given but no rendezvous service configured.
    #[error("no rendezvous service configured")]
    NoRendezvous,

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
}

/// How to reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Local,
    DirectPublic,
    HolePunch,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::DirectPublic => write!(f, "direct-public"),
            Self::HolePunch => write!(f, "hole-punch"),
        }
    }
}

/// Who to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectTarget {
    /// A manually entered address, expected to belong to `peer`.
    Address { peer: DeviceId, addr: SocketAddr },
    /// Resolve through the rendezvous service.
    Lookup(DeviceId),
}

impl ConnectTarget {
    pub fn peer(&self) -> DeviceId {
        match self {
            Self::Address { peer, .. } => *peer,
            Self::Lookup(peer) => *peer,
        }
    }
}

/// Timeout and attempt count for one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyBudget {
    pub timeout: Duration,
    pub attempts: u32,
}

impl StrategyBudget {
    pub const fn new(timeout: Duration, attempts: u32) -> Self {
        Self { timeout, attempts }
    }
}

/// Broker policy.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub local: StrategyBudget,
    pub direct: StrategyBudget,
    pub hole_punch: StrategyBudget,
    /// Pause between attempts of the same strategy.
    pub retry_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            local: StrategyBudget::new(Duration::from_secs(2), 1),
            direct: StrategyBudget::new(Duration::from_secs(5), 2),
            hole_punch: StrategyBudget::new(Duration::from_secs(10), 3),
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl BrokerConfig {
    pub fn budget(&self, strategy: Strategy) -> StrategyBudget {
        match strategy {
            Strategy::Local => self.local,
            Strategy::DirectPublic => self.direct,
            Strategy::HolePunch => self.hole_punch,
        }
    }

    pub fn with_budget(mut self, strategy: Strategy, budget: StrategyBudget) -> Self {
        match strategy {
            Strategy::Local => self.local = budget,
            Strategy::DirectPublic => self.direct = budget,
            Strategy::HolePunch => self.hole_punch = budget,
        }
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// One planned strategy and the address it dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub strategy: Strategy,
    pub addr: SocketAddr,
}

/// State of a [`ConnectionAttempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Succeeded(Candidate),
    Failed,
}

/// What to do after a failed try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Same strategy again.
    Retry,
    /// Budget used up, moved to the next strategy.
    Advance,
    /// Nothing left to try.
    Exhausted,
}

/// Strategies left to try for one peer, with the attempt count of the
/// current one.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    peer: DeviceId,
    plan: Vec<Candidate>,
    index: usize,
    attempts: u32,
    outcome: AttemptOutcome,
}

impl ConnectionAttempt {
    pub fn new(peer: DeviceId, plan: Vec<Candidate>) -> Self {
        let outcome = if plan.is_empty() {
            AttemptOutcome::Failed
        } else {
            AttemptOutcome::Pending
        };
        Self {
            peer,
            plan,
            index: 0,
            attempts: 0,
            outcome,
        }
    }

    /// Plan strategies for `peer` from its known addresses.
    ///
    /// `manual` addresses are classified by range: private, loopback and
    /// link-local ones are local, the rest public. Hole punching is planned
    /// only when this node is behind NAT and `rendezvous` is available.
    pub fn plan(
        peer: DeviceId,
        info: &PeerAddressInfo,
        manual: Option<SocketAddr>,
        this_node: &SelfAddresses,
        rendezvous: bool,
    ) -> Self {
        let mut local = info.local_addr;
        let mut public = info.public_addr;
        if let Some(addr) = manual {
            if is_local_address(&addr.ip()) {
                local = Some(addr);
            } else {
                public = Some(addr);
            }
        }

        let mut plan = Vec::with_capacity(3);
        if let Some(addr) = local {
            plan.push(Candidate {
                strategy: Strategy::Local,
                addr,
            });
        }
        if let Some(addr) = public.filter(|addr| Some(*addr) != local) {
            plan.push(Candidate {
                strategy: Strategy::DirectPublic,
                addr,
            });
            if rendezvous && this_node.behind_nat() {
                plan.push(Candidate {
                    strategy: Strategy::HolePunch,
                    addr,
                });
            }
        }

        Self::new(peer, plan)
    }

    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    /// Strategy to try now, `None` once finished.
    pub fn current(&self) -> Option<Candidate> {
        match self.outcome {
            AttemptOutcome::Pending => self.plan.get(self.index).copied(),
            _ => None,
        }
    }

    /// Tries made on the current strategy.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Candidates not yet abandoned, current first.
    pub fn remaining(&self) -> &[Candidate] {
        match self.outcome {
            AttemptOutcome::Pending => &self.plan[self.index..],
            _ => &[],
        }
    }

    /// Start a try of the current strategy.
    pub fn begin(&mut self) -> Option<Candidate> {
        let candidate = self.current()?;
        self.attempts += 1;
        Some(candidate)
    }

    /// Point the current strategy at a fresher address.
    pub fn retarget(&mut self, addr: SocketAddr) {
        if let (AttemptOutcome::Pending, Some(candidate)) = (self.outcome, self.plan.get_mut(self.index)) {
            candidate.addr = addr;
        }
    }

    pub fn record_success(&mut self) {
        if let Some(candidate) = self.current() {
            self.outcome = AttemptOutcome::Succeeded(candidate);
        }
    }

    pub fn record_failure(&mut self, config: &BrokerConfig) -> NextStep {
        let Some(candidate) = self.current() else {
            return NextStep::Exhausted;
        };
        if self.attempts < config.budget(candidate.strategy).attempts.max(1) {
            return NextStep::Retry;
        }

        self.index += 1;
        self.attempts = 0;
        if self.index < self.plan.len() {
            NextStep::Advance
        } else {
            self.outcome = AttemptOutcome::Failed;
            NextStep::Exhausted
        }
    }
}

async fn accept_any<S>(stream: S) -> Result<S, Infallible> {
    Ok(stream)
}

/// Private, loopback, link-local or unique-local.
pub fn is_local_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        IpAddr::V6(ip) => {
            ip.is_loopback()
                // fc00::/7 unique local, fe80::/10 link local
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Opens streams for the broker.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, strategy: Strategy, addr: SocketAddr) -> io::Result<Self::Stream>;
}

/// TCP dialer. Hole punches connect from the listening port with address
/// and port reuse, so the peer's simultaneous dial meets ours.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    listen_port: Option<u16>,
}

impl TcpDialer {
    pub fn new(listen_port: Option<u16>) -> Self {
        Self { listen_port }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, strategy: Strategy, addr: SocketAddr) -> io::Result<TcpStream> {
        match (strategy, self.listen_port) {
            (Strategy::HolePunch, Some(port)) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                #[cfg(unix)]
                socket.set_reuseport(true)?;
                let bind: SocketAddr = if addr.is_ipv4() {
                    SocketAddr::from(([0, 0, 0, 0], port))
                } else {
                    SocketAddr::from(([0u16; 8], port))
                };
                socket.bind(bind)?;
                socket.connect(addr).await
            }
            _ => TcpStream::connect(addr).await,
        }
    }
}

/// A stream connected to the expected peer's address.
///
/// The peer's identity is still unproven until the key exchange completes.
#[derive(Debug)]
pub struct Established<S> {
    pub peer: DeviceId,
    pub via: Candidate,
    pub stream: S,
}

/// Resolves targets and drives connection attempts.
pub struct ConnectionBroker<D: Dialer> {
    local_device: DeviceId,
    dialer: D,
    rendezvous: Option<Arc<dyn RendezvousClient>>,
    this_node: SelfAddresses,
    config: BrokerConfig,
}

impl<D: Dialer> ConnectionBroker<D> {
    pub fn new(local_device: DeviceId, dialer: D, config: BrokerConfig) -> Self {
        Self {
            local_device,
            dialer,
            rendezvous: None,
            this_node: SelfAddresses {
                public: None,
                local: None,
            },
            config,
        }
    }

    pub fn with_rendezvous(mut self, rendezvous: Arc<dyn RendezvousClient>) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    /// Addresses learned by self-discovery.
    pub fn with_self_addresses(mut self, addresses: SelfAddresses) -> Self {
        self.this_node = addresses;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn self_addresses(&self) -> &SelfAddresses {
        &self.this_node
    }

    pub fn rendezvous(&self) -> Option<&Arc<dyn RendezvousClient>> {
        self.rendezvous.as_ref()
    }

    /// Build the attempt plan for `target`, resolving through rendezvous
    /// when needed.
    pub async fn plan(&self, target: ConnectTarget) -> Result<ConnectionAttempt, BrokerError> {
        let peer = target.peer();
        let (info, manual) = match target {
            ConnectTarget::Address { addr, .. } => (PeerAddressInfo::default(), Some(addr)),
            ConnectTarget::Lookup(_) => {
                let rendezvous = self.rendezvous.as_ref().ok_or(BrokerError::NoRendezvous)?;
                match rendezvous.lookup(peer).await? {
                    Some(info) => (info, None),
                    None => {
                        info!(peer = %peer.short(), "Peer not found on rendezvous");
                        return Err(BrokerError::PeerUnreachable(peer));
                    }
                }
            }
        };

        Ok(ConnectionAttempt::plan(
            peer,
            &info,
            manual,
            &self.this_node,
            self.rendezvous.is_some(),
        ))
    }

    /// Connect to `target`, trying strategies in priority order.
    ///
    /// Cancelling `cancel` drops the in-flight dial and its timer.
    pub async fn connect(
        &self,
        target: ConnectTarget,
        cancel: &CancellationToken,
    ) -> Result<Established<D::Stream>, BrokerError> {
        self.connect_with(target, cancel, accept_any).await.map(|(via, stream)| Established {
            peer: target.peer(),
            via,
            stream,
        })
    }

    /// Connect to `target` and hand each connected stream to `accept`. A
    /// stream `accept` rejects sends the attempt on to the next try.
    pub async fn connect_with<T, E, F, Fut>(
        &self,
        target: ConnectTarget,
        cancel: &CancellationToken,
        accept: F,
    ) -> Result<(Candidate, T), BrokerError>
    where
        F: FnMut(D::Stream) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            plan = self.plan(target) => plan?,
        };
        self.run_with(attempt, cancel, accept).await
    }

    /// Drive a planned attempt to completion.
    pub async fn run(
        &self,
        attempt: ConnectionAttempt,
        cancel: &CancellationToken,
    ) -> Result<Established<D::Stream>, BrokerError> {
        let peer = attempt.peer();
        self.run_with(attempt, cancel, accept_any)
            .await
            .map(|(via, stream)| Established { peer, via, stream })
    }

    /// [`run`](Self::run), checking each stream with `accept`.
    pub async fn run_with<T, E, F, Fut>(
        &self,
        attempt: ConnectionAttempt,
        cancel: &CancellationToken,
        accept: F,
    ) -> Result<(Candidate, T), BrokerError>
    where
        F: FnMut(D::Stream) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.drive(attempt, cancel, true, accept).await
    }

    /// Answer a peer's connect request: punch towards its public address,
    /// then try its local one. No connect request is posted in return.
    pub async fn dial_back(
        &self,
        peer: DeviceId,
        info: &PeerAddressInfo,
        cancel: &CancellationToken,
    ) -> Result<Established<D::Stream>, BrokerError> {
        self.dial_back_with(peer, info, cancel, accept_any)
            .await
            .map(|(via, stream)| Established { peer, via, stream })
    }

    /// [`dial_back`](Self::dial_back), checking each stream with `accept`.
    pub async fn dial_back_with<T, E, F, Fut>(
        &self,
        peer: DeviceId,
        info: &PeerAddressInfo,
        cancel: &CancellationToken,
        accept: F,
    ) -> Result<(Candidate, T), BrokerError>
    where
        F: FnMut(D::Stream) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut plan = Vec::with_capacity(2);
        if let Some(addr) = info.public_addr {
            plan.push(Candidate {
                strategy: Strategy::HolePunch,
                addr,
            });
        }
        if let Some(addr) = info.local_addr.filter(|addr| Some(*addr) != info.public_addr) {
            plan.push(Candidate {
                strategy: Strategy::Local,
                addr,
            });
        }
        self.drive(ConnectionAttempt::new(peer, plan), cancel, false, accept)
            .await
    }

    async fn drive<T, E, F, Fut>(
        &self,
        mut attempt: ConnectionAttempt,
        cancel: &CancellationToken,
        post_requests: bool,
        mut accept: F,
    ) -> Result<(Candidate, T), BrokerError>
    where
        F: FnMut(D::Stream) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let peer = attempt.peer();
        let mut punch_requested = !post_requests;

        while let Some(mut candidate) = attempt.begin() {
            if candidate.strategy == Strategy::HolePunch && !punch_requested {
                punch_requested = true;
                if let Some(addr) = self.request_punch(peer).await {
                    attempt.retarget(addr);
                    candidate.addr = addr;
                }
            }

            let budget = self.config.budget(candidate.strategy);
            debug!(
                peer = %peer.short(),
                strategy = %candidate.strategy,
                attempt = attempt.attempts(),
                "Dialing {}",
                candidate.addr
            );

            let dial = self.dialer.dial(candidate.strategy, candidate.addr);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                result = tokio::time::timeout(budget.timeout, dial) => result,
            };

            match result {
                Ok(Ok(stream)) => {
                    let accepted = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                        accepted = accept(stream) => accepted,
                    };
                    match accepted {
                        Ok(value) => {
                            attempt.record_success();
                            info!(peer = %peer.short(), strategy = %candidate.strategy, "Connected to {}", candidate.addr);
                            return Ok((candidate, value));
                        }
                        Err(e) => {
                            debug!(peer = %peer.short(), strategy = %candidate.strategy, "Stream to {} rejected: {}", candidate.addr, e);
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer.short(), strategy = %candidate.strategy, "Dial failed: {}", e);
                }
                Err(_) => {
                    debug!(
                        peer = %peer.short(),
                        strategy = %candidate.strategy,
                        "Dial timed out after {:?}",
                        budget.timeout
                    );
                }
            }

            if attempt.record_failure(&self.config) == NextStep::Retry {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }
        }

        warn!(peer = %peer.short(), "All connection strategies exhausted");
        Err(BrokerError::PeerUnreachable(peer))
    }

    /// Post a connect request so the peer dials back. Returns the peer's
    /// current public address if the service reports one.
    async fn request_punch(&self, peer: DeviceId) -> Option<SocketAddr> {
        let rendezvous = self.rendezvous.as_ref()?;
        match rendezvous.request_connect(self.local_device, peer).await {
            Ok(Some(info)) => {
                debug!(peer = %peer.short(), "Connect request posted");
                info.public_addr
            }
            Ok(None) => {
                debug!(peer = %peer.short(), "Connect request: peer not registered");
                None
            }
            Err(e) => {
                warn!("Connect request failed: {}", e);
                None
            }
        }
    }
}
