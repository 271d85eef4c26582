// Copyright (c) 2024 Botho Foundation

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;

use crate::{
    config::Config,
    identity::{FileKeyStore, KeyStore},
};

/// Run the init command
pub fn run(config_path: &Path, name: Option<&str>) -> Result<()> {
    if Config::exists(config_path) {
        bail!(
            "Config already exists at {}\nUse a different --config path or delete the existing config.",
            config_path.display()
        );
    }

    let mut config = Config::default();
    if let Some(name) = name {
        config.set_device_name(name)?;
    }
    let key_path = config.key_file_path(config_path);
    let reused = key_path.exists();
    let keystore = KeyStore::load_or_generate(&FileKeyStore::new(key_path.clone()))
        .with_context(|| format!("Failed to create device key at {}", key_path.display()))?;
    config.save(config_path)?;

    info!(device = %keystore.device_id().short(), "Device initialized at {}", config_path.display());
    if reused {
        println!("\nUsing the existing device key at {}.", key_path.display());
    } else {
        println!("\nA new device key was created at {}.", key_path.display());
        println!("It never leaves this device. Losing it means peers must re-add you.");
    }
    println!("Config saved to: {}\n", config_path.display());
    super::print_identity(&keystore, &config.device_name(&keystore.device_id()));
    println!("\nNext steps:");
    println!("  1. Exchange contact cards with a peer and compare fingerprints");
    println!("  2. Run 'ghostline add-peer <card>'");
    println!("  3. Run 'ghostline run --connect <device_id>@<addr>'");

    Ok(())
}
