// Copyright (c) 2024 Botho Foundation

//! Traffic obfuscation.
//!
//! Envelopes never travel as-is. Each one is wrapped in a unit with a random
//! header, a masked tag and length, and a random footer (see [`unit`]), so
//! unit sizes are decoupled from message sizes and no fixed byte pattern
//! repeats across units. Decoy units with the same shape are interleaved
//! (see [`cover`]) and every outbound unit is jittered (see [`timing`]).
//!
//! The receiving side reassembles units from arbitrary read boundaries with
//! [`ObfuscationCodec`], drops decoys and malformed units, and yields
//! envelopes.

mod codec;
pub mod cover;
pub mod timing;
pub mod unit;

pub use codec::{InboundUnit, ObfuscationCodec, OutboundUnit};
pub use cover::{DecoyConfig, DecoyScheduler};
pub use timing::{JitterConfig, TimingJitter};
pub use unit::{ObfuscationError, ShapeConfig};

use crate::envelope::{Envelope, EnvelopeType};
use bytes::BytesMut;
use rand::Rng;

/// Full obfuscation policy for a connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObfuscationConfig {
    pub shape: ShapeConfig,
    pub decoys: DecoyConfig,
    pub jitter: JitterConfig,
}

impl ObfuscationConfig {
    pub fn with_shape(mut self, shape: ShapeConfig) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_decoys(mut self, decoys: DecoyConfig) -> Self {
        self.decoys = decoys;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterConfig) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Wraps envelopes into units and unwraps them again.
#[derive(Debug, Clone)]
pub struct Obfuscator {
    shape: ShapeConfig,
    decoys: DecoyScheduler,
    jitter: TimingJitter,
}

impl Default for Obfuscator {
    fn default() -> Self {
        Self::new(ObfuscationConfig::default())
    }
}

impl Obfuscator {
    pub fn new(config: ObfuscationConfig) -> Self {
        Self {
            shape: config.shape.normalized(),
            decoys: DecoyScheduler::new(config.decoys),
            jitter: TimingJitter::new(config.jitter),
        }
    }

    pub fn shape(&self) -> &ShapeConfig {
        &self.shape
    }

    pub fn decoys(&self) -> &DecoyScheduler {
        &self.decoys
    }

    pub fn jitter(&self) -> &TimingJitter {
        &self.jitter
    }

    /// Wrap `envelope` into one unit appended to `dst`.
    pub fn wrap_into<R: Rng>(
        &self,
        envelope: &Envelope,
        rng: &mut R,
        dst: &mut BytesMut,
    ) -> Result<(), ObfuscationError> {
        if envelope.kind == EnvelopeType::Decoy {
            return self.decoy_into(rng, dst);
        }
        let payload = envelope
            .to_bytes()
            .map_err(|e| ObfuscationError::Serialize(e.to_string()))?;
        unit::encode_unit(&self.shape, envelope.kind.as_byte(), &payload, rng, dst)
    }

    /// Wrap `envelope` into a standalone unit.
    pub fn wrap(&self, envelope: &Envelope) -> Result<Vec<u8>, ObfuscationError> {
        let mut dst = BytesMut::new();
        self.wrap_into(envelope, &mut rand::thread_rng(), &mut dst)?;
        Ok(dst.to_vec())
    }

    /// Append one decoy unit to `dst`.
    pub fn decoy_into<R: Rng>(&self, rng: &mut R, dst: &mut BytesMut) -> Result<(), ObfuscationError> {
        unit::encode_unit(&self.shape, EnvelopeType::Decoy.as_byte(), &[], rng, dst)
    }

    /// A standalone decoy unit.
    pub fn decoy(&self) -> Vec<u8> {
        let mut dst = BytesMut::new();
        // An empty payload always fits the body limit
        let _ = self.decoy_into(&mut rand::thread_rng(), &mut dst);
        dst.to_vec()
    }

    /// Take the next complete unit from the reassembly buffer `src`.
    ///
    /// Decoys and malformed units are returned as such so the caller can
    /// discard them; only oversized declarations are errors.
    pub fn unwrap(&self, src: &mut BytesMut) -> Result<Option<InboundUnit>, ObfuscationError> {
        let Some((tag, body)) = unit::decode_unit(&self.shape, src)? else {
            return Ok(None);
        };

        let unit = match EnvelopeType::from_byte(tag) {
            Some(EnvelopeType::Decoy) => InboundUnit::Decoy,
            Some(kind) => match parse_envelope(kind, &body) {
                Ok(envelope) => InboundUnit::Envelope(envelope),
                Err(_) => InboundUnit::Malformed,
            },
            None => InboundUnit::Malformed,
        };
        Ok(Some(unit))
    }
}

fn parse_envelope(kind: EnvelopeType, body: &[u8]) -> Result<Envelope, ObfuscationError> {
    let envelope = Envelope::from_bytes(body).map_err(|_| ObfuscationError::MalformedEnvelope)?;
    if envelope.kind != kind {
        return Err(ObfuscationError::MalformedEnvelope);
    }
    Ok(envelope)
}
