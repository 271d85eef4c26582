// Copyright (c) 2024 Botho Foundation

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;

/// Show this device's identity
pub fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path).context("No config found. Run 'ghostline init' first.")?;
    let keystore = super::open_keystore(&config, config_path)?;
    super::print_identity(&keystore, &config.device_name(&keystore.device_id()));
    Ok(())
}
