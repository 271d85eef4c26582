// Copyright (c) 2024 Botho Foundation

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::config::Config;

/// Change this device's name
pub fn run(config_path: &Path, name: &str) -> Result<()> {
    let mut config = Config::load(config_path).context("No config found. Run 'ghostline init' first.")?;
    config.set_device_name(name).context("Invalid device name")?;
    config.save(config_path)?;

    let name = config.device_name(&super::open_keystore(&config, config_path)?.device_id());
    info!("Device name set to {:?}", name);
    println!("Device name: {}", name);
    Ok(())
}
