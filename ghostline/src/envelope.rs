// Copyright (c) 2024 Botho Foundation

//! The unit that crosses the wire inside an obfuscated stream.

use crate::identity::DeviceId;
use bincode::Options;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a session identifier in bytes.
pub const SESSION_ID_LEN: usize = 16;

/// Upper bound on a serialized envelope.
pub const MAX_ENVELOPE_SIZE: usize = 2 * 1024 * 1024;

/// Kind of payload carried by an [`Envelope`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeType {
    /// Application message under a session key.
    Message = 0x01,
    /// Session key offer or confirmation.
    KeyExchange = 0x02,
    /// Cover traffic; never delivered.
    Decoy = 0x03,
}

impl EnvelopeType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Message),
            0x02 => Some(Self::KeyExchange),
            0x03 => Some(Self::Decoy),
            _ => None,
        }
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Identifies one session key generation between two devices.
///
/// Ordered so that concurrent offers can be resolved deterministically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SESSION_ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// An encrypted message or key-exchange record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeType,
    pub session_id: SessionId,
    pub sender: DeviceId,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn new(
        kind: EnvelopeType,
        session_id: SessionId,
        sender: DeviceId,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            session_id,
            sender,
            ciphertext,
        }
    }

    /// Serialize for the obfuscated transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        codec_options().serialize(self)
    }

    /// Parse an envelope from the front of `bytes`, ignoring anything after
    /// it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        codec_options().deserialize(bytes)
    }
}

fn codec_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_ENVELOPE_SIZE as u64)
}
