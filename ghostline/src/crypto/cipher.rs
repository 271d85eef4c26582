// Copyright (c) 2024 Botho Foundation

//! Authenticated encryption of application messages.
//!
//! # Ciphertext Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Nonce (12) │ ChaCha20-Poly1305(padded plaintext) │ Tag (16) │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole ciphertext is one of the padding size classes. Associated data
//! binds the nonce, the envelope type, the session id and the sender, so
//! an envelope cannot be relabelled without failing authentication.

use super::{padding, CryptoError};
use crate::{
    envelope::{Envelope, EnvelopeType},
    identity::DeviceId,
    session::SessionKey,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use zeroize::Zeroizing;

/// Size of ChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of ChaCha20-Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const AEAD_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Pads and seals message plaintexts under session keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCipher;

impl MessageCipher {
    pub fn new() -> Self {
        Self
    }

    /// Encrypt `plaintext` from `sender` under `key`.
    ///
    /// Nonces come from the key's own sequence and are never reused.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key: &SessionKey,
        sender: DeviceId,
    ) -> Result<Envelope, CryptoError> {
        let padded = Zeroizing::new(
            padding::pad(plaintext, AEAD_OVERHEAD)
                .map_err(|_| CryptoError::PayloadTooLarge(plaintext.len()))?,
        );
        let nonce = key.next_nonce()?;
        let aad = associated_data(&nonce, EnvelopeType::Message, key, &sender);

        let direction_key = key.direction_key(&sender);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&direction_key[..]));
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &padded,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)?;

        let mut ciphertext = Vec::with_capacity(NONCE_SIZE + sealed.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);

        Ok(Envelope::new(
            EnvelopeType::Message,
            key.session_id(),
            sender,
            ciphertext,
        ))
    }

    /// Verify and decrypt `envelope` under `key`.
    ///
    /// Nothing is returned unless the tag verifies. Every failure maps to
    /// [`CryptoError::Authentication`].
    pub fn decrypt(&self, envelope: &Envelope, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
        if envelope.kind != EnvelopeType::Message
            || envelope.session_id != key.session_id()
            || envelope.ciphertext.len() < AEAD_OVERHEAD
        {
            return Err(CryptoError::Authentication);
        }

        let (nonce, sealed) = envelope.ciphertext.split_at(NONCE_SIZE);
        let aad = associated_data(nonce, envelope.kind, key, &envelope.sender);

        let direction_key = key.direction_key(&envelope.sender);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&direction_key[..]));
        let padded = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: sealed,
                        aad: &aad,
                    },
                )
                .map_err(|_| CryptoError::Authentication)?,
        );

        padding::unpad(&padded)
            .map(<[u8]>::to_vec)
            .map_err(|_| CryptoError::Authentication)
    }
}

fn associated_data(
    nonce: &[u8],
    kind: EnvelopeType,
    key: &SessionKey,
    sender: &DeviceId,
) -> Vec<u8> {
    let session_id = key.session_id();
    let mut aad = Vec::with_capacity(NONCE_SIZE + 1 + 32);
    aad.extend_from_slice(nonce);
    aad.push(kind.as_byte());
    aad.extend_from_slice(session_id.as_bytes());
    aad.extend_from_slice(sender.as_bytes());
    aad
}
