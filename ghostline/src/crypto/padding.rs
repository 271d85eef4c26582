// Copyright (c) 2024 Botho Foundation

//! Size-class padding for message plaintexts.
//!
//! Plaintexts are padded before encryption so that the sealed ciphertext
//! (nonce + body + tag) lands exactly on one of a small set of size classes.
//! Two messages in the same class produce envelopes of identical size.
//!
//! # Padded Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ Length (4 bytes, big-endian) │ Payload │ Random fill │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The padded buffer is `class - reserved` bytes long, where `reserved` is
//! the AEAD overhead the caller adds afterwards.

use rand::RngCore;
use thiserror::Error;

/// Length header size in bytes (u32 big-endian).
pub const LENGTH_HEADER_SIZE: usize = 4;

/// Every size class is a multiple of this block.
pub const PADDING_BLOCK: usize = 256;

/// Size classes for sealed message ciphertexts, in bytes.
pub const SIZE_CLASSES: [usize; 9] = [
    256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536,
];

/// Above the largest class, sizes round up to a multiple of this step.
pub const LARGE_CLASS_STEP: usize = 65536;

/// Largest plaintext accepted for a single message.
pub const MAX_PLAINTEXT_LEN: usize = 1 << 20;

/// Errors that can occur during padding/unpadding operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaddingError {
    /// Payload exceeds [`MAX_PLAINTEXT_LEN`].
    #[error("payload too large: {0} bytes exceeds maximum {MAX_PLAINTEXT_LEN}")]
    PayloadTooLarge(usize),

    /// Padded buffer is shorter than the length header.
    #[error("padded message too short: got {0} bytes")]
    TooShort(usize),

    /// Length header claims more bytes than the buffer holds.
    #[error("invalid length header: claims {claimed} bytes but only {available} available")]
    InvalidLength { claimed: usize, available: usize },
}

/// Smallest size class able to hold `needed` bytes.
pub fn size_class(needed: usize) -> usize {
    SIZE_CLASSES
        .iter()
        .copied()
        .find(|&class| class >= needed)
        .unwrap_or_else(|| needed.div_ceil(LARGE_CLASS_STEP) * LARGE_CLASS_STEP)
}

/// Pad `payload` so that adding `reserved` bytes afterwards reaches a size
/// class exactly.
pub fn pad(payload: &[u8], reserved: usize) -> Result<Vec<u8>, PaddingError> {
    if payload.len() > MAX_PLAINTEXT_LEN {
        return Err(PaddingError::PayloadTooLarge(payload.len()));
    }

    let class = size_class(payload.len() + LENGTH_HEADER_SIZE + reserved);
    let padded_len = class - reserved;

    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    padded.extend_from_slice(payload);

    // Random fill, not zeros
    let start = padded.len();
    padded.resize(padded_len, 0);
    rand::thread_rng().fill_bytes(&mut padded[start..]);

    Ok(padded)
}

/// Strip padding and return the original payload.
pub fn unpad(padded: &[u8]) -> Result<&[u8], PaddingError> {
    if padded.len() < LENGTH_HEADER_SIZE {
        return Err(PaddingError::TooShort(padded.len()));
    }

    let mut header = [0u8; LENGTH_HEADER_SIZE];
    header.copy_from_slice(&padded[..LENGTH_HEADER_SIZE]);
    let claimed = u32::from_be_bytes(header) as usize;

    let available = padded.len() - LENGTH_HEADER_SIZE;
    if claimed > available {
        return Err(PaddingError::InvalidLength { claimed, available });
    }

    Ok(&padded[LENGTH_HEADER_SIZE..LENGTH_HEADER_SIZE + claimed])
}
