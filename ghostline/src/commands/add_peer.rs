// Copyright (c) 2024 Botho Foundation

use anyhow::{bail, Context, Result};
use std::{net::SocketAddr, path::Path};
use tracing::info;

use crate::{config::Config, identity::ContactCard};

/// Trust a peer's contact card
pub fn run(config_path: &Path, card: &str, label: Option<String>, address: Option<SocketAddr>) -> Result<()> {
    let mut config = Config::load(config_path).context("No config found. Run 'ghostline init' first.")?;
    let card = ContactCard::decode(card).context("Invalid contact card")?;

    let own = super::open_keystore(&config, config_path)?;
    if card.device_id == own.device_id() {
        bail!("That is this device's own contact card");
    }

    config.upsert_peer(&card, label.clone(), address);
    config.save(config_path)?;

    info!(peer = %card.device_id.short(), "Peer added");
    println!("Added peer {}", label.as_deref().unwrap_or("(no label)"));
    println!("Device ID:   {}", card.device_id);
    println!("Fingerprint: {}", card.fingerprint());
    println!("\nCompare the fingerprint with your peer over a channel you trust.");
    Ok(())
}
