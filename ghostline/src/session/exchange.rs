// Copyright (c) 2024 Botho Foundation

//! Signed key-exchange records.
//!
//! A key exchange rides in an [`Envelope`] of type
//! [`EnvelopeType::KeyExchange`]. Two records exist:
//!
//! - `Offer`: a new session key wrapped for the recipient, signed by the
//!   sender and stamped with its issue time;
//! - `Confirm`: the recipient's signed acknowledgement of an offer.
//!
//! Signatures cover a domain string, the record kind, the session id, both
//! device ids and (for offers) the issue time and the wrapped key.

use crate::{
    envelope::{Envelope, EnvelopeType, SessionId},
    identity::{DeviceId, KeyStore, PublicIdentity, WrappedKey, SIGNATURE_LEN},
};
use serde::{Deserialize, Serialize};

const TRANSCRIPT_DOMAIN: &[u8] = b"ghostline-key-exchange-v1";

const OFFER_KIND: u8 = 0x01;
const CONFIRM_KIND: u8 = 0x02;

/// Body of a key-exchange envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyExchange {
    Offer {
        recipient: DeviceId,
        issued_at: u64,
        wrapped: WrappedKey,
        signature: Vec<u8>,
    },
    Confirm {
        recipient: DeviceId,
        signature: Vec<u8>,
    },
}

impl KeyExchange {
    /// Build a signed offer envelope.
    pub fn offer(
        keystore: &KeyStore,
        session_id: SessionId,
        recipient: DeviceId,
        issued_at: u64,
        wrapped: WrappedKey,
    ) -> Envelope {
        let transcript = offer_transcript(
            session_id,
            &keystore.device_id(),
            &recipient,
            issued_at,
            &wrapped,
        );
        let record = Self::Offer {
            recipient,
            issued_at,
            wrapped,
            signature: keystore.sign(&transcript).to_vec(),
        };
        record.into_envelope(session_id, keystore.device_id())
    }

    /// Build a signed confirmation envelope.
    pub fn confirm(keystore: &KeyStore, session_id: SessionId, recipient: DeviceId) -> Envelope {
        let transcript = confirm_transcript(session_id, &keystore.device_id(), &recipient);
        let record = Self::Confirm {
            recipient,
            signature: keystore.sign(&transcript).to_vec(),
        };
        record.into_envelope(session_id, keystore.device_id())
    }

    /// Parse the record carried by `envelope`.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        if envelope.kind != EnvelopeType::KeyExchange {
            return None;
        }
        bincode::deserialize(&envelope.ciphertext).ok()
    }

    pub fn recipient(&self) -> DeviceId {
        match self {
            Self::Offer { recipient, .. } | Self::Confirm { recipient, .. } => *recipient,
        }
    }

    /// Check the signature against the claimed sender's public identity.
    pub fn verify(&self, session_id: SessionId, sender: &DeviceId, signer: &PublicIdentity) -> bool {
        let (transcript, signature) = match self {
            Self::Offer {
                recipient,
                issued_at,
                wrapped,
                signature,
            } => (
                offer_transcript(session_id, sender, recipient, *issued_at, wrapped),
                signature,
            ),
            Self::Confirm {
                recipient,
                signature,
            } => (confirm_transcript(session_id, sender, recipient), signature),
        };

        let Ok(signature) = <[u8; SIGNATURE_LEN]>::try_from(signature.as_slice()) else {
            return false;
        };
        KeyStore::verify(signer, &transcript, &signature).is_ok()
    }

    fn into_envelope(self, session_id: SessionId, sender: DeviceId) -> Envelope {
        // Serializing plain byte fields cannot fail
        let body = bincode::serialize(&self).unwrap_or_default();
        Envelope::new(EnvelopeType::KeyExchange, session_id, sender, body)
    }
}

fn offer_transcript(
    session_id: SessionId,
    sender: &DeviceId,
    recipient: &DeviceId,
    issued_at: u64,
    wrapped: &WrappedKey,
) -> Vec<u8> {
    let mut transcript = base_transcript(OFFER_KIND, session_id, sender, recipient);
    transcript.extend_from_slice(&issued_at.to_be_bytes());
    transcript.extend_from_slice(&wrapped.transcript_bytes());
    transcript
}

fn confirm_transcript(session_id: SessionId, sender: &DeviceId, recipient: &DeviceId) -> Vec<u8> {
    base_transcript(CONFIRM_KIND, session_id, sender, recipient)
}

fn base_transcript(
    kind: u8,
    session_id: SessionId,
    sender: &DeviceId,
    recipient: &DeviceId,
) -> Vec<u8> {
    let mut transcript = Vec::with_capacity(TRANSCRIPT_DOMAIN.len() + 1 + 16 * 3);
    transcript.extend_from_slice(TRANSCRIPT_DOMAIN);
    transcript.push(kind);
    transcript.extend_from_slice(session_id.as_bytes());
    transcript.extend_from_slice(sender.as_bytes());
    transcript.extend_from_slice(recipient.as_bytes());
    transcript
}
