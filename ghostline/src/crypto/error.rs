// Copyright (c) 2024 Botho Foundation

use thiserror::Error;

/// Errors from key generation, key wrapping and message encryption.
///
/// Display strings are intentionally uniform: a failed decryption never says
/// which check failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The platform entropy source failed while generating key material.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// A wrapped session key could not be unwrapped.
    #[error("decryption failed")]
    Decryption,

    /// A message failed authentication or its padding was malformed.
    #[error("authentication failed")]
    Authentication,

    /// Encoded key material had the wrong shape.
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// Plaintext exceeds the maximum message size.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// The nonce sequence of a session key is exhausted.
    #[error("session key exhausted")]
    KeyExhausted,
}
