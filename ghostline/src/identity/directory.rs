// Copyright (c) 2024 Botho Foundation

//! Known peers and the contact cards used to exchange identities.
//!
//! Identities are exchanged out of band as a [`ContactCard`]: the device id
//! plus its [`PublicIdentity`], base64 encoded. Key exchange only accepts
//! offers from devices present in the [`PeerDirectory`].

use super::{device::DeviceId, keystore::PublicIdentity, Fingerprint};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;

/// Errors decoding a contact card.
#[derive(Debug, Error)]
pub enum ContactCardError {
    #[error("contact card is not valid base64")]
    Encoding,

    #[error("contact card is malformed")]
    Malformed,

    #[error("contact card carries invalid key material")]
    InvalidKey,
}

/// Shareable identity of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub device_id: DeviceId,
    pub identity: PublicIdentity,
}

impl ContactCard {
    pub fn new(device_id: DeviceId, identity: PublicIdentity) -> Self {
        Self {
            device_id,
            identity,
        }
    }

    pub fn encode(&self) -> String {
        // Serializing plain byte fields cannot fail
        let bytes = bincode::serialize(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn decode(text: &str) -> Result<Self, ContactCardError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|_| ContactCardError::Encoding)?;
        let card: Self = bincode::deserialize(&bytes).map_err(|_| ContactCardError::Malformed)?;
        card.identity
            .validate()
            .map_err(|_| ContactCardError::InvalidKey)?;
        Ok(card)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }
}

/// A peer this device is willing to talk to.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub identity: PublicIdentity,
    pub label: Option<String>,
    pub address_hint: Option<SocketAddr>,
}

/// Concurrent table of known peers.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<DashMap<DeviceId, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a peer.
    pub fn insert(&self, card: ContactCard, label: Option<String>, address_hint: Option<SocketAddr>) {
        self.peers.insert(
            card.device_id,
            PeerRecord {
                identity: card.identity,
                label,
                address_hint,
            },
        );
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<PeerRecord> {
        self.peers.get(device_id).map(|r| r.value().clone())
    }

    pub fn identity(&self, device_id: &DeviceId) -> Option<PublicIdentity> {
        self.peers.get(device_id).map(|r| r.identity.clone())
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.peers.contains_key(device_id)
    }

    pub fn remove(&self, device_id: &DeviceId) -> Option<PeerRecord> {
        self.peers.remove(device_id).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
