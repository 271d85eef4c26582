// Copyright (c) 2024 Botho Foundation

//! CLI command implementations.
//!
//! These modules implement the user-facing CLI commands and legitimately
//! use stdout for output.

#![allow(clippy::print_stdout)]

pub mod add_peer;
pub mod identity;
pub mod init;
pub mod run;
pub mod set_name;

use crate::{
    config::Config,
    identity::{FileKeyStore, KeyStore},
};
use anyhow::{bail, Context, Result};
use std::path::Path;

/// Load the device key named by the config. Fails if it was never created.
pub(crate) fn open_keystore(config: &Config, config_path: &Path) -> Result<KeyStore> {
    let key_path = config.key_file_path(config_path);
    if !key_path.exists() {
        bail!(
            "No device key at {}\nRun 'ghostline init' first.",
            key_path.display()
        );
    }
    KeyStore::load_or_generate(&FileKeyStore::new(key_path.clone()))
        .with_context(|| format!("Failed to load device key from {}", key_path.display()))
}

pub(crate) fn print_identity(keystore: &KeyStore, name: &str) {
    let card = crate::identity::ContactCard::new(keystore.device_id(), keystore.public_key().clone());
    println!("Name:        {}", name);
    println!("Device ID:   {}", keystore.device_id());
    println!("Fingerprint: {}", keystore.fingerprint());
    println!("\nContact card (share with peers):\n{}", card.encode());
}
