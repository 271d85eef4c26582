// Copyright (c) 2024 Botho Foundation

//! Device identifiers and public-key fingerprints.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

/// Length of a device identifier in bytes (128-bit).
pub const DEVICE_ID_LEN: usize = 16;

/// Number of digest bytes rendered into a fingerprint.
const FINGERPRINT_BYTES: usize = 8;

/// A random 128-bit identifier bound to one device for its lifetime.
///
/// Displayed as 32 lowercase hex characters. `Debug` shows a short prefix
/// so logs stay readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    /// Generate a new random device identifier.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; DEVICE_ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a device identifier from raw bytes.
    pub const fn from_bytes(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of this identifier.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl AsRef<[u8]> for DeviceId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Error parsing a [`DeviceId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device id: expected {} hex characters", DEVICE_ID_LEN * 2)]
pub struct ParseDeviceIdError;

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| ParseDeviceIdError)?;
        let bytes: [u8; DEVICE_ID_LEN] = bytes.try_into().map_err(|_| ParseDeviceIdError)?;
        Ok(Self(bytes))
    }
}

/// Human-verifiable digest of a device's long-term public key.
///
/// Rendered as four groups of four upper-case hex characters
/// (`XXXX-XXXX-XXXX-XXXX`) so that two users can compare it out of band.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_BYTES]);

impl Fingerprint {
    /// Compute the fingerprint of encoded public key material.
    pub fn of(public_key_bytes: &[u8]) -> Self {
        let digest = Sha256::digest(public_key_bytes);
        let mut bytes = [0u8; FINGERPRINT_BYTES];
        bytes.copy_from_slice(&digest[..FINGERPRINT_BYTES]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_BYTES] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode_upper(self.0);
        for (i, group) in hex.as_bytes().chunks(4).enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            // hex output is ASCII
            f.write_str(std::str::from_utf8(group).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}
