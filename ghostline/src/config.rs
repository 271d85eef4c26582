// Copyright (c) 2024 Botho Foundation

//! On-disk configuration.
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::{
    identity::{ContactCard, DeviceId, PeerDirectory},
    messenger::{MessengerConfig, DEFAULT_CONNECT_POLL_INTERVAL},
    network::{
        obfuscation::{DecoyConfig, JitterConfig, ShapeConfig},
        rendezvous::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REQUEST_TIMEOUT},
        BrokerConfig, HttpRendezvousClient, NodeConfig, ObfuscationConfig, RendezvousClient, StrategyBudget,
        StunConfig, DEFAULT_HANDSHAKE_TIMEOUT,
    },
    session::{SessionConfig, DEFAULT_GRACE_WINDOW, DEFAULT_OFFER_MAX_AGE, DEFAULT_ROTATION_INTERVAL},
};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Main configuration for Ghostline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub obfuscation: ObfuscationSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub broker: BrokerSection,
    /// Trusted peers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Address the P2P listener binds. Port 0 picks a free port.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Device key file. Defaults to `identity.key` next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Name this device shows locally. Defaults to `Ghostline-<short id>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// Longest accepted device name, in characters.
pub const MAX_DEVICE_NAME_LEN: usize = 64;

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            key_file: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            device_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,

    /// How long a retired session key still decrypts.
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,

    #[serde(default = "default_offer_max_age_secs")]
    pub offer_max_age_secs: u64,
}

fn default_rotation_interval_secs() -> u64 {
    DEFAULT_ROTATION_INTERVAL.as_secs()
}

fn default_grace_window_secs() -> u64 {
    DEFAULT_GRACE_WINDOW.as_secs()
}

fn default_offer_max_age_secs() -> u64 {
    DEFAULT_OFFER_MAX_AGE.as_secs()
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            rotation_interval_secs: default_rotation_interval_secs(),
            grace_window_secs: default_grace_window_secs(),
            offer_max_age_secs: default_offer_max_age_secs(),
        }
    }
}

/// Traffic shaping policy. Missing fields take the library defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationSection {
    pub min_unit_size: usize,
    pub max_unit_size: usize,
    pub min_header_len: usize,
    pub max_header_len: usize,
    pub decoy_probability: f64,
    pub decoy_burst_min: usize,
    pub decoy_burst_max: usize,
    /// Idle cover traffic.
    pub cover_traffic: bool,
    pub cover_interval_min_ms: u64,
    pub cover_interval_max_ms: u64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for ObfuscationSection {
    fn default() -> Self {
        let shape = ShapeConfig::default();
        let decoys = DecoyConfig::default();
        let (cover_min, cover_max) = decoys.cover_interval_ms.unwrap_or((0, 0));
        let jitter = JitterConfig::default();
        Self {
            min_unit_size: shape.min_unit_size,
            max_unit_size: shape.max_unit_size,
            min_header_len: shape.min_header_len,
            max_header_len: shape.max_header_len,
            decoy_probability: decoys.probability,
            decoy_burst_min: decoys.burst_min,
            decoy_burst_max: decoys.burst_max,
            cover_traffic: decoys.cover_interval_ms.is_some(),
            cover_interval_min_ms: cover_min,
            cover_interval_max_ms: cover_max,
            jitter_min_ms: jitter.min_delay_ms,
            jitter_max_ms: jitter.max_delay_ms,
        }
    }
}

impl ObfuscationSection {
    pub fn to_obfuscation_config(&self) -> ObfuscationConfig {
        let shape = ShapeConfig {
            min_unit_size: self.min_unit_size,
            max_unit_size: self.max_unit_size,
            min_header_len: self.min_header_len,
            max_header_len: self.max_header_len,
            ..ShapeConfig::default()
        };
        let cover = self
            .cover_traffic
            .then_some((self.cover_interval_min_ms, self.cover_interval_max_ms));
        let decoys = DecoyConfig::default()
            .with_probability(self.decoy_probability)
            .with_burst(self.decoy_burst_min, self.decoy_burst_max)
            .with_cover_interval_ms(cover);
        ObfuscationConfig::default()
            .with_shape(shape)
            .with_decoys(decoys)
            .with_jitter(JitterConfig::new(self.jitter_min_ms, self.jitter_max_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// Query STUN servers for the public address at startup.
    #[serde(default = "default_true")]
    pub stun_enabled: bool,

    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// Rendezvous service base URL. Unset means manual connections only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous_url: Option<String>,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_connect_poll_interval_secs")]
    pub connect_poll_interval_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_stun_servers() -> Vec<String> {
    StunConfig::default().servers
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL.as_secs()
}

fn default_connect_poll_interval_secs() -> u64 {
    DEFAULT_CONNECT_POLL_INTERVAL.as_secs()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            stun_enabled: true,
            stun_servers: default_stun_servers(),
            rendezvous_url: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            connect_poll_interval_secs: default_connect_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Per-strategy connect budgets. Missing fields take the library defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub local_timeout_ms: u64,
    pub local_attempts: u32,
    pub direct_timeout_ms: u64,
    pub direct_attempts: u32,
    pub hole_punch_timeout_ms: u64,
    pub hole_punch_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        Self {
            local_timeout_ms: broker.local.timeout.as_millis() as u64,
            local_attempts: broker.local.attempts,
            direct_timeout_ms: broker.direct.timeout.as_millis() as u64,
            direct_attempts: broker.direct.attempts,
            hole_punch_timeout_ms: broker.hole_punch.timeout.as_millis() as u64,
            hole_punch_attempts: broker.hole_punch.attempts,
            retry_delay_ms: broker.retry_delay.as_millis() as u64,
        }
    }
}

impl BrokerSection {
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            local: StrategyBudget::new(Duration::from_millis(self.local_timeout_ms), self.local_attempts),
            direct: StrategyBudget::new(Duration::from_millis(self.direct_timeout_ms), self.direct_attempts),
            hole_punch: StrategyBudget::new(
                Duration::from_millis(self.hole_punch_timeout_ms),
                self.hole_punch_attempts,
            ),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// A trusted peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Encoded contact card.
    pub card: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Address tried before a rendezvous lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,
}

impl Config {
    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Load the config at `path`, or the defaults if there is none yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms)
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }

        Ok(())
    }

    /// Check if config file exists
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn validate(&self) -> Result<()> {
        let obfuscation = &self.obfuscation;
        if !(0.0..=1.0).contains(&obfuscation.decoy_probability) {
            bail!("obfuscation.decoy_probability must be within 0.0..=1.0");
        }
        if obfuscation.min_unit_size > obfuscation.max_unit_size {
            bail!("obfuscation.min_unit_size exceeds max_unit_size");
        }
        // Peers refuse any unit body past their frame limit
        let frame_limit = ShapeConfig::default().max_body_len;
        if obfuscation.max_unit_size > frame_limit {
            bail!(
                "obfuscation.max_unit_size must not exceed the {} byte frame limit",
                frame_limit
            );
        }
        if obfuscation.min_header_len > obfuscation.max_header_len {
            bail!("obfuscation.min_header_len exceeds max_header_len");
        }
        if obfuscation.cover_traffic && obfuscation.cover_interval_max_ms == 0 {
            bail!("obfuscation.cover_interval_max_ms must be positive when cover traffic is on");
        }
        let broker = &self.broker;
        if broker.local_attempts == 0 || broker.direct_attempts == 0 || broker.hole_punch_attempts == 0 {
            bail!("broker attempt counts must be at least 1");
        }
        if self.discovery.heartbeat_interval_secs == 0 || self.discovery.connect_poll_interval_secs == 0 {
            bail!("discovery intervals must be at least one second");
        }
        if self.session.grace_window_secs >= self.session.rotation_interval_secs {
            bail!("session.grace_window_secs must be shorter than rotation_interval_secs");
        }
        if let Some(name) = &self.node.device_name {
            check_device_name(name).context("node.device_name")?;
        }
        for (index, peer) in self.peers.iter().enumerate() {
            ContactCard::decode(&peer.card).map_err(|e| anyhow!("peers[{}]: {}", index, e))?;
        }
        Ok(())
    }

    /// Name shown for this device.
    pub fn device_name(&self, device: &DeviceId) -> String {
        self.node
            .device_name
            .clone()
            .unwrap_or_else(|| format!("Ghostline-{}", device.short()))
    }

    pub fn set_device_name(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        check_device_name(name)?;
        self.node.device_name = Some(name.to_string());
        Ok(())
    }

    /// Key file path, resolved against the directory holding `config_path`.
    pub fn key_file_path(&self, config_path: &Path) -> PathBuf {
        let base = config_path.parent().unwrap_or(config_path);
        match &self.node.key_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => base.join(path),
            None => base.join("identity.key"),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            rotation_interval: Duration::from_secs(self.session.rotation_interval_secs),
            grace_window: Duration::from_secs(self.session.grace_window_secs),
            offer_max_age: Duration::from_secs(self.session.offer_max_age_secs),
        }
    }

    pub fn messenger_config(&self) -> MessengerConfig {
        let node = NodeConfig::default()
            .with_listen_addr(self.node.listen_addr)
            .with_handshake_timeout(Duration::from_secs(self.node.handshake_timeout_secs))
            .with_session(self.session_config())
            .with_obfuscation(self.obfuscation.to_obfuscation_config());
        let stun = self
            .discovery
            .stun_enabled
            .then(|| StunConfig::with_servers(self.discovery.stun_servers.clone()));

        MessengerConfig::default()
            .with_node(node)
            .with_broker(self.broker.to_broker_config())
            .with_stun(stun)
            .with_heartbeat_interval(Duration::from_secs(self.discovery.heartbeat_interval_secs))
            .with_connect_poll_interval(Duration::from_secs(self.discovery.connect_poll_interval_secs))
    }

    /// Client for the configured rendezvous service, if any.
    pub fn rendezvous_client(&self) -> Result<Option<Arc<dyn RendezvousClient>>> {
        let Some(url) = &self.discovery.rendezvous_url else {
            return Ok(None);
        };
        let timeout = Duration::from_secs(self.discovery.request_timeout_secs);
        let client = HttpRendezvousClient::with_timeout(url, timeout)
            .with_context(|| format!("Failed to create rendezvous client for {}", url))?;
        Ok(Some(Arc::new(client)))
    }

    /// Directory holding every configured peer.
    pub fn peer_directory(&self) -> Result<PeerDirectory> {
        let directory = PeerDirectory::new();
        for peer in &self.peers {
            let card = ContactCard::decode(&peer.card)
                .with_context(|| format!("Invalid contact card for peer {:?}", peer.label))?;
            directory.insert(card, peer.label.clone(), peer.address);
        }
        Ok(directory)
    }

    /// Add or replace the entry for `card`'s device.
    pub fn upsert_peer(&mut self, card: &ContactCard, label: Option<String>, address: Option<SocketAddr>) {
        let encoded = card.encode();
        self.peers.retain(|entry| match ContactCard::decode(&entry.card) {
            Ok(existing) => existing.device_id != card.device_id,
            Err(_) => entry.card != encoded,
        });
        self.peers.push(PeerEntry {
            card: encoded,
            label,
            address,
        });
    }
}

fn check_device_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("device name must not be empty");
    }
    if name.chars().count() > MAX_DEVICE_NAME_LEN {
        bail!("device name is longer than {} characters", MAX_DEVICE_NAME_LEN);
    }
    if name.chars().any(char::is_control) {
        bail!("device name must not contain control characters");
    }
    Ok(())
}

/// Get the default data directory path
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".ghostline"))
        .ok_or_else(|| anyhow!("Could not determine home directory"))
}

/// Get the default config file path
pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join("config.toml"))
}
