// Copyright (c) 2024 Botho Foundation

//! Message encryption.
//!
//! [`MessageCipher`] pads plaintext to a size class and seals it with
//! ChaCha20-Poly1305 under a per-direction key derived from the session key.

mod cipher;
mod error;
pub mod padding;

pub use cipher::{MessageCipher, NONCE_SIZE, TAG_SIZE};
pub use error::CryptoError;
