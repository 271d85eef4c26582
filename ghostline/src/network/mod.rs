// Copyright (c) 2024 Botho Foundation

//! Networking: obfuscated transport, peer connections and connection
//! establishment.

pub mod broker;
mod connection;
pub mod node;
pub mod obfuscation;
pub mod rendezvous;
pub mod stun;

pub use broker::{
    AttemptOutcome, BrokerConfig, BrokerError, Candidate, ConnectTarget, ConnectionAttempt, ConnectionBroker,
    Dialer, Established, NextStep, Strategy, StrategyBudget, TcpDialer,
};
pub use connection::{ConnectionError, ConnectionId, DisconnectReason, ReceivedMessage, DEFAULT_HANDSHAKE_TIMEOUT};
pub use node::{NodeConfig, NodeError, NodeEvent, P2PNode};
pub use obfuscation::{ObfuscationConfig, Obfuscator};
pub use rendezvous::{
    spawn_heartbeat, ConnectRequest, HttpRendezvousClient, PeerAddressInfo, RendezvousClient, RendezvousError,
};
pub use stun::{SelfAddresses, StunClient, StunConfig, StunError, StunResult};
