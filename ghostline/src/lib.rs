// Copyright (c) 2024 Botho Foundation

//! Ghostline - device-bound, serverless peer-to-peer secure messaging.
//!
//! Devices hold long-term hybrid keys ([`identity`]), agree per-peer session
//! keys ([`session`]), encrypt every message ([`crypto`]) and exchange them
//! over an obfuscated transport with NAT traversal ([`network`]). The
//! [`messenger`] module ties these together for applications.

#![deny(clippy::print_stdout)]

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod identity;
pub mod messenger;
pub mod network;
pub mod session;
pub mod telemetry;

// Re-export commands module for CLI binary
pub mod commands;

pub use identity::{ContactCard, DeviceId, KeyStore, PeerDirectory};
pub use messenger::{Messenger, MessengerConfig, MessengerError};
