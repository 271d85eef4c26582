// Copyright (c) 2024 Botho Foundation

//! `tokio_util` codec over [`Obfuscator`].
//!
//! The `Framed` read buffer is the per-connection reassembly buffer: units
//! may arrive split across reads or several per read.

use super::{ObfuscationError, Obfuscator};
use crate::envelope::Envelope;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// A unit to write.
#[derive(Debug, Clone)]
pub enum OutboundUnit {
    Envelope(Envelope),
    Decoy,
}

/// A unit read off the wire.
#[derive(Debug, Clone)]
pub enum InboundUnit {
    Envelope(Envelope),
    Decoy,
    /// Not a valid envelope; handled exactly like a decoy.
    Malformed,
}

/// Encodes [`OutboundUnit`]s and decodes [`InboundUnit`]s.
#[derive(Debug, Clone, Default)]
pub struct ObfuscationCodec {
    obfuscator: Obfuscator,
}

impl ObfuscationCodec {
    pub fn new(obfuscator: Obfuscator) -> Self {
        Self { obfuscator }
    }

    pub fn obfuscator(&self) -> &Obfuscator {
        &self.obfuscator
    }
}

impl Decoder for ObfuscationCodec {
    type Item = InboundUnit;
    type Error = ObfuscationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.obfuscator.unwrap(src)
    }
}

impl Encoder<OutboundUnit> for ObfuscationCodec {
    type Error = ObfuscationError;

    fn encode(&mut self, item: OutboundUnit, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut rng = rand::thread_rng();
        match item {
            OutboundUnit::Envelope(envelope) => self.obfuscator.wrap_into(&envelope, &mut rng, dst),
            OutboundUnit::Decoy => self.obfuscator.decoy_into(&mut rng, dst),
        }
    }
}
