// Copyright (c) 2024 Botho Foundation

//! Symmetric session keys and their nonce sequences.

use crate::{
    crypto::{CryptoError, NONCE_SIZE},
    envelope::SessionId,
    identity::DeviceId,
};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of session keys in bytes (256-bit).
pub const SESSION_KEY_LEN: usize = 32;

/// Bytes of the nonce taken from the per-key random salt.
const NONCE_SALT_LEN: usize = 4;

/// Domain separator for per-direction message keys.
const DIRECTION_KEY_INFO: &[u8] = b"ghostline-message-key-v1";

/// Raw session key bytes, zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyMaterial([u8; SESSION_KEY_LEN]);

impl SessionKeyMaterial {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeyMaterial([REDACTED])")
    }
}

/// A symmetric key shared with one peer for one session generation.
///
/// Shared as `Arc<SessionKey>`; the nonce counter is atomic so that
/// concurrent encryptions never reuse a nonce.
pub struct SessionKey {
    peer: DeviceId,
    session_id: SessionId,
    material: SessionKeyMaterial,
    created_at: Instant,
    expires_at: Instant,
    nonce_salt: [u8; NONCE_SALT_LEN],
    nonce_counter: AtomicU64,
}

impl SessionKey {
    /// Generate a fresh key for `peer`.
    pub fn generate<R: RngCore + CryptoRng>(
        peer: DeviceId,
        lifetime: Duration,
        now: Instant,
        rng: &mut R,
    ) -> Self {
        let session_id = SessionId::random(rng);
        let material = SessionKeyMaterial::random(rng);
        Self::from_material(peer, session_id, material, lifetime, now)
    }

    /// Install key material received from `peer`.
    pub fn from_material(
        peer: DeviceId,
        session_id: SessionId,
        material: SessionKeyMaterial,
        lifetime: Duration,
        now: Instant,
    ) -> Self {
        let mut nonce_salt = [0u8; NONCE_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_salt);
        Self {
            peer,
            session_id,
            material,
            created_at: now,
            expires_at: now + lifetime,
            nonce_salt,
            nonce_counter: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn material(&self) -> &SessionKeyMaterial {
        &self.material
    }

    /// Next nonce: random salt followed by a big-endian counter.
    ///
    /// The counter never wraps; an exhausted key must be rotated.
    pub fn next_nonce(&self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        let counter = self
            .nonce_counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_add(1))
            .map_err(|_| CryptoError::KeyExhausted)?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_SALT_LEN].copy_from_slice(&self.nonce_salt);
        nonce[NONCE_SALT_LEN..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }

    /// Message key for traffic sent by `sender` under this session.
    ///
    /// Each direction gets its own key so that the two peers' nonce
    /// sequences never collide.
    pub(crate) fn direction_key(&self, sender: &DeviceId) -> Zeroizing<[u8; SESSION_KEY_LEN]> {
        let hk = Hkdf::<Sha256>::new(Some(self.session_id.as_bytes()), self.material.as_bytes());
        let mut info = Vec::with_capacity(DIRECTION_KEY_INFO.len() + sender.as_bytes().len());
        info.extend_from_slice(DIRECTION_KEY_INFO);
        info.extend_from_slice(sender.as_bytes());

        let mut okm = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        // 32 bytes is always a valid HKDF-SHA256 output length
        let _ = hk.expand(&info, okm.as_mut());
        okm
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("peer", &self.peer)
            .field("session_id", &self.session_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        let mut rng = rand::thread_rng();
        SessionKey::generate(
            DeviceId::random(&mut rng),
            Duration::from_secs(60),
            Instant::now(),
            &mut rng,
        )
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = key();
        let a = key.next_nonce().unwrap();
        let b = key.next_nonce().unwrap();
        assert_ne!(a, b);
        assert_eq!(a[..NONCE_SALT_LEN], b[..NONCE_SALT_LEN]);
    }

    #[test]
    fn test_nonce_counter_exhaustion() {
        let key = key();
        key.nonce_counter.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(key.next_nonce(), Err(CryptoError::KeyExhausted));
    }

    #[test]
    fn test_expiry() {
        let now = Instant::now();
        let mut rng = rand::thread_rng();
        let key = SessionKey::generate(
            DeviceId::random(&mut rng),
            Duration::from_secs(10),
            now,
            &mut rng,
        );
        assert!(!key.is_expired(now));
        assert!(!key.is_expired(now + Duration::from_secs(9)));
        assert!(key.is_expired(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_direction_keys_differ_per_sender() {
        let key = key();
        let mut rng = rand::thread_rng();
        let a = DeviceId::random(&mut rng);
        let b = DeviceId::random(&mut rng);
        assert_ne!(*key.direction_key(&a), *key.direction_key(&b));
        assert_eq!(*key.direction_key(&a), *key.direction_key(&a));
    }

    #[test]
    fn test_debug_redacts_material() {
        let key = key();
        let debug = format!("{key:?}");
        assert!(!debug.contains(&hex::encode(key.material().as_bytes())));
        assert_eq!(
            format!("{:?}", key.material()),
            "SessionKeyMaterial([REDACTED])"
        );
    }
}
