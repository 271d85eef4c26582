// Copyright (c) 2024 Botho Foundation

//! Long-term device key material.
//!
//! Every device holds one key bundle derived from a single 32-byte master
//! seed:
//!
//! - an X25519 static key and an ML-KEM-768 key pair, used together to wrap
//!   session keys for transport (hybrid classical + post-quantum);
//! - an Ed25519 signing key, used to authenticate key-exchange records.
//!
//! # Wrapping Protocol
//!
//! ```text
//! sender:    eph  = X25519 ephemeral
//!            ss1  = X25519(eph, recipient.x25519)
//!            (ct, ss2) = ML-KEM-768.Encaps(recipient.ek)
//!            k, n = HKDF-SHA256(ss1 || ss2, info = domain || eph_pub || ct || recipient.x25519)
//!            sealed = ChaCha20-Poly1305(k, n, session_key, aad = eph_pub || ct)
//! recipient: recomputes ss1, ss2 and opens `sealed`
//! ```
//!
//! Breaking a wrapped key requires breaking both X25519 and ML-KEM-768.
//!
//! # Security
//!
//! - The master seed is kept in zeroizing memory and only leaves the process
//!   through a [`KeyMaterialStore`].
//! - Unwrap failures are reported as a single generic
//!   [`CryptoError::Decryption`].

use super::{
    device::{DeviceId, Fingerprint, DEVICE_ID_LEN},
    storage::{KeyMaterialStore, StorageError},
};
use crate::{crypto::CryptoError, session::SessionKeyMaterial};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use ml_kem::{
    kem::{Decapsulate, Encapsulate},
    Encoded, EncodedSizeUser, KemCore, MlKem768,
};
use rand::{rngs::OsRng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

/// Length of the master seed in bytes.
pub const MASTER_SEED_LEN: usize = 32;

/// ML-KEM-768 encapsulation key size in bytes.
pub const ML_KEM_768_PUBLIC_KEY_BYTES: usize = 1184;

/// ML-KEM-768 ciphertext size in bytes.
pub const ML_KEM_768_CIPHERTEXT_BYTES: usize = 1088;

/// Ed25519 signature size in bytes.
pub const SIGNATURE_LEN: usize = 64;

const X25519_SEED_INFO: &[u8] = b"ghostline-identity-x25519-v1";
const ML_KEM_SEED_INFO: &[u8] = b"ghostline-identity-ml-kem-768-v1";
const SIGNING_SEED_INFO: &[u8] = b"ghostline-identity-ed25519-v1";
const WRAP_DOMAIN: &[u8] = b"ghostline-session-wrap-v1";

/// Serialized private identity: magic, device id, master seed.
const STORED_MAGIC: &[u8; 4] = b"GLK1";
const STORED_LEN: usize = STORED_MAGIC.len() + DEVICE_ID_LEN + MASTER_SEED_LEN;

type MlKemDecapsulationKey = <MlKem768 as KemCore>::DecapsulationKey;
type MlKemEncapsulationKey = <MlKem768 as KemCore>::EncapsulationKey;

/// The exportable half of a device's long-term key bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    x25519: [u8; 32],
    ml_kem: Vec<u8>,
    verifying: [u8; 32],
}

impl PublicIdentity {
    /// Check that every component parses as a valid key.
    pub fn validate(&self) -> Result<(), CryptoError> {
        self.encapsulation_key()?;
        self.verifying_key()?;
        Ok(())
    }

    /// Canonical encoding, used for fingerprints.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + self.ml_kem.len() + 32);
        bytes.extend_from_slice(&self.x25519);
        bytes.extend_from_slice(&self.ml_kem);
        bytes.extend_from_slice(&self.verifying);
        bytes
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.to_bytes())
    }

    fn x25519(&self) -> X25519Public {
        X25519Public::from(self.x25519)
    }

    fn encapsulation_key(&self) -> Result<MlKemEncapsulationKey, CryptoError> {
        let encoded = Encoded::<MlKemEncapsulationKey>::try_from(&self.ml_kem[..])
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(MlKemEncapsulationKey::from_bytes(&encoded))
    }

    pub(crate) fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.verifying).map_err(|_| CryptoError::InvalidKeyMaterial)
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", self.fingerprint())
    }
}

/// A session key sealed for one recipient.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    ephemeral: [u8; 32],
    kem_ciphertext: Vec<u8>,
    sealed: Vec<u8>,
}

impl WrappedKey {
    /// Bytes covered by key-exchange signatures.
    pub fn transcript_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(32 + self.kem_ciphertext.len() + self.sealed.len());
        bytes.extend_from_slice(&self.ephemeral);
        bytes.extend_from_slice(&self.kem_ciphertext);
        bytes.extend_from_slice(&self.sealed);
        bytes
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedKey")
            .field("ephemeral", &hex::encode(&self.ephemeral[..4]))
            .finish_non_exhaustive()
    }
}

/// Holder of the device's long-term private keys.
///
/// Constructed once at startup and shared as `Arc<KeyStore>`; every method
/// takes `&self`.
pub struct KeyStore {
    device_id: DeviceId,
    seed: Zeroizing<[u8; MASTER_SEED_LEN]>,
    x25519: StaticSecret,
    ml_kem: MlKemDecapsulationKey,
    signing: SigningKey,
    public: PublicIdentity,
}

impl KeyStore {
    /// Generate a fresh identity from the platform entropy source.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut id = [0u8; DEVICE_ID_LEN];
        getrandom::getrandom(&mut id).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        let mut seed = Zeroizing::new([0u8; MASTER_SEED_LEN]);
        getrandom::getrandom(seed.as_mut())
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        Ok(Self::from_seed(DeviceId::from_bytes(id), seed))
    }

    /// Rebuild an identity from its device id and master seed.
    pub fn from_seed(device_id: DeviceId, seed: Zeroizing<[u8; MASTER_SEED_LEN]>) -> Self {
        let x25519 = StaticSecret::from(*derive_subseed(&seed, X25519_SEED_INFO));
        let signing = SigningKey::from_bytes(&derive_subseed(&seed, SIGNING_SEED_INFO));

        let mut rng = ChaCha20Rng::from_seed(*derive_subseed(&seed, ML_KEM_SEED_INFO));
        let (ml_kem, ek) = MlKem768::generate(&mut rng);

        let public = PublicIdentity {
            x25519: X25519Public::from(&x25519).to_bytes(),
            ml_kem: ek.as_bytes().as_slice().to_vec(),
            verifying: signing.verifying_key().to_bytes(),
        };

        Self {
            device_id,
            seed,
            x25519,
            ml_kem,
            signing,
            public,
        }
    }

    /// Load the identity from `store`, generating and saving one if the
    /// store is empty.
    pub fn load_or_generate(store: &dyn KeyMaterialStore) -> Result<Self, StorageError> {
        if let Some(stored) = store.load()? {
            let keystore = Self::from_stored(&stored)?;
            debug!(device = %keystore.device_id.short(), "Loaded device identity");
            return Ok(keystore);
        }

        let keystore = Self::generate()?;
        store.store(&keystore.to_stored())?;
        debug!(device = %keystore.device_id.short(), "Generated new device identity");
        Ok(keystore)
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// The public identity to hand to peers.
    pub fn public_key(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint()
    }

    /// Seal `key` so that only the holder of `recipient` can recover it.
    pub fn wrap(
        &self,
        key: &SessionKeyMaterial,
        recipient: &PublicIdentity,
    ) -> Result<WrappedKey, CryptoError> {
        let ek = recipient.encapsulation_key()?;
        let (kem_ciphertext, kem_shared) = ek
            .encapsulate(&mut OsRng)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519Public::from(&ephemeral);
        let dh = ephemeral.diffie_hellman(&recipient.x25519());
        if !dh.was_contributory() {
            return Err(CryptoError::InvalidKeyMaterial);
        }

        let wrapped = WrappedKey {
            ephemeral: ephemeral_public.to_bytes(),
            kem_ciphertext: kem_ciphertext.as_slice().to_vec(),
            sealed: Vec::new(),
        };
        let (cipher, nonce) = wrapping_cipher(
            dh.as_bytes(),
            kem_shared.as_slice(),
            &wrapped,
            &recipient.x25519,
        );

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(nonce.as_ref()),
                Payload {
                    msg: key.as_bytes(),
                    aad: &wrapping_aad(&wrapped),
                },
            )
            .map_err(|_| CryptoError::Decryption)?;

        Ok(WrappedKey { sealed, ..wrapped })
    }

    /// Recover a session key sealed to this device.
    pub fn unwrap(&self, wrapped: &WrappedKey) -> Result<SessionKeyMaterial, CryptoError> {
        let ct = ml_kem::Ciphertext::<MlKem768>::try_from(&wrapped.kem_ciphertext[..])
            .map_err(|_| CryptoError::Decryption)?;
        let kem_shared = self
            .ml_kem
            .decapsulate(&ct)
            .map_err(|_| CryptoError::Decryption)?;

        let dh = self
            .x25519
            .diffie_hellman(&X25519Public::from(wrapped.ephemeral));
        if !dh.was_contributory() {
            return Err(CryptoError::Decryption);
        }

        let (cipher, nonce) = wrapping_cipher(
            dh.as_bytes(),
            kem_shared.as_slice(),
            wrapped,
            &self.public.x25519,
        );
        let opened = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce.as_ref()),
                    Payload {
                        msg: &wrapped.sealed,
                        aad: &wrapping_aad(wrapped),
                    },
                )
                .map_err(|_| CryptoError::Decryption)?,
        );

        let bytes: [u8; 32] = opened
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Decryption)?;
        Ok(SessionKeyMaterial::from_bytes(bytes))
    }

    /// Sign `message` with the device signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    /// Verify a signature made by the holder of `signer`.
    pub fn verify(
        signer: &PublicIdentity,
        message: &[u8],
        signature: &[u8; SIGNATURE_LEN],
    ) -> Result<(), CryptoError> {
        let key = signer.verifying_key()?;
        let signature = ed25519_dalek::Signature::from_bytes(signature);
        key.verify_strict(message, &signature)
            .map_err(|_| CryptoError::Authentication)
    }

    /// Encoding handed to a [`KeyMaterialStore`].
    fn to_stored(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(STORED_LEN));
        bytes.extend_from_slice(STORED_MAGIC);
        bytes.extend_from_slice(self.device_id.as_bytes());
        bytes.extend_from_slice(self.seed.as_ref());
        bytes
    }

    fn from_stored(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() != STORED_LEN || &bytes[..STORED_MAGIC.len()] != STORED_MAGIC {
            return Err(StorageError::Corrupt);
        }
        let rest = &bytes[STORED_MAGIC.len()..];

        let mut id = [0u8; DEVICE_ID_LEN];
        id.copy_from_slice(&rest[..DEVICE_ID_LEN]);
        let mut seed = Zeroizing::new([0u8; MASTER_SEED_LEN]);
        seed.copy_from_slice(&rest[DEVICE_ID_LEN..]);

        Ok(Self::from_seed(DeviceId::from_bytes(id), seed))
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

fn derive_subseed(seed: &[u8; MASTER_SEED_LEN], info: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, seed);
    let mut out = Zeroizing::new([0u8; 32]);
    // 32 bytes is always a valid HKDF-SHA256 output length
    let _ = hk.expand(info, out.as_mut());
    out
}

fn wrapping_cipher(
    dh_shared: &[u8],
    kem_shared: &[u8],
    wrapped: &WrappedKey,
    recipient_x25519: &[u8; 32],
) -> (ChaCha20Poly1305, Zeroizing<[u8; 12]>) {
    let mut ikm = Zeroizing::new(Vec::with_capacity(64));
    ikm.extend_from_slice(dh_shared);
    ikm.extend_from_slice(kem_shared);

    let mut info = Vec::with_capacity(WRAP_DOMAIN.len() + 32 + wrapped.kem_ciphertext.len() + 32);
    info.extend_from_slice(WRAP_DOMAIN);
    info.extend_from_slice(&wrapped.ephemeral);
    info.extend_from_slice(&wrapped.kem_ciphertext);
    info.extend_from_slice(recipient_x25519);

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = Zeroizing::new([0u8; 44]);
    // 44 bytes is always a valid HKDF-SHA256 output length
    let _ = hk.expand(&info, okm.as_mut());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm[..32]));
    let mut nonce = Zeroizing::new([0u8; 12]);
    nonce.copy_from_slice(&okm[32..]);
    (cipher, nonce)
}

fn wrapping_aad(wrapped: &WrappedKey) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + wrapped.kem_ciphertext.len());
    aad.extend_from_slice(&wrapped.ephemeral);
    aad.extend_from_slice(&wrapped.kem_ciphertext);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryKeyStore;

    #[test]
    fn test_public_identity_components() {
        let keystore = KeyStore::generate().unwrap();
        let public = keystore.public_key();
        assert_eq!(public.ml_kem.len(), ML_KEM_768_PUBLIC_KEY_BYTES);
        assert!(public.validate().is_ok());
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let alice = KeyStore::generate().unwrap();
        let bob = KeyStore::generate().unwrap();

        let key = SessionKeyMaterial::random(&mut rand::thread_rng());
        let wrapped = alice.wrap(&key, bob.public_key()).unwrap();
        assert_eq!(wrapped.kem_ciphertext.len(), ML_KEM_768_CIPHERTEXT_BYTES);

        let recovered = bob.unwrap(&wrapped).unwrap();
        assert_eq!(recovered.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_unwrap_by_wrong_recipient_fails() {
        let alice = KeyStore::generate().unwrap();
        let bob = KeyStore::generate().unwrap();
        let eve = KeyStore::generate().unwrap();

        let key = SessionKeyMaterial::random(&mut rand::thread_rng());
        let wrapped = alice.wrap(&key, bob.public_key()).unwrap();
        assert_eq!(eve.unwrap(&wrapped).unwrap_err(), CryptoError::Decryption);
    }

    #[test]
    fn test_unwrap_tampered_fails() {
        let alice = KeyStore::generate().unwrap();
        let bob = KeyStore::generate().unwrap();
        let key = SessionKeyMaterial::random(&mut rand::thread_rng());

        let mut wrapped = alice.wrap(&key, bob.public_key()).unwrap();
        wrapped.sealed[0] ^= 1;
        assert_eq!(bob.unwrap(&wrapped).unwrap_err(), CryptoError::Decryption);

        let mut wrapped = alice.wrap(&key, bob.public_key()).unwrap();
        wrapped.kem_ciphertext[10] ^= 1;
        assert_eq!(bob.unwrap(&wrapped).unwrap_err(), CryptoError::Decryption);

        let mut wrapped = alice.wrap(&key, bob.public_key()).unwrap();
        wrapped.kem_ciphertext.truncate(100);
        assert_eq!(bob.unwrap(&wrapped).unwrap_err(), CryptoError::Decryption);
    }

    #[test]
    fn test_wrapping_is_randomized() {
        let alice = KeyStore::generate().unwrap();
        let bob = KeyStore::generate().unwrap();
        let key = SessionKeyMaterial::random(&mut rand::thread_rng());

        let a = alice.wrap(&key, bob.public_key()).unwrap();
        let b = alice.wrap(&key, bob.public_key()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sign_verify() {
        let keystore = KeyStore::generate().unwrap();
        let other = KeyStore::generate().unwrap();

        let signature = keystore.sign(b"transcript");
        assert!(KeyStore::verify(keystore.public_key(), b"transcript", &signature).is_ok());
        assert_eq!(
            KeyStore::verify(keystore.public_key(), b"tampered", &signature),
            Err(CryptoError::Authentication)
        );
        assert_eq!(
            KeyStore::verify(other.public_key(), b"transcript", &signature),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let id = DeviceId::from_bytes([3u8; DEVICE_ID_LEN]);
        let a = KeyStore::from_seed(id, Zeroizing::new([7u8; MASTER_SEED_LEN]));
        let b = KeyStore::from_seed(id, Zeroizing::new([7u8; MASTER_SEED_LEN]));
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = KeyStore::from_seed(id, Zeroizing::new([8u8; MASTER_SEED_LEN]));
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn test_load_or_generate_persists_identity() {
        let store = MemoryKeyStore::new();

        let first = KeyStore::load_or_generate(&store).unwrap();
        let second = KeyStore::load_or_generate(&store).unwrap();
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_from_stored_rejects_garbage() {
        assert!(matches!(
            KeyStore::from_stored(b"nope"),
            Err(StorageError::Corrupt)
        ));
        let mut bytes = vec![0u8; STORED_LEN];
        bytes[..4].copy_from_slice(b"XXXX");
        assert!(matches!(
            KeyStore::from_stored(&bytes),
            Err(StorageError::Corrupt)
        ));
    }

    #[test]
    fn test_debug_does_not_leak_seed() {
        let keystore = KeyStore::generate().unwrap();
        let debug = format!("{keystore:?}");
        assert!(!debug.contains(&hex::encode(&keystore.seed[..])));
    }
}
