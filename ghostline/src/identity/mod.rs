// Copyright (c) 2024 Botho Foundation

//! Device identity: identifiers, long-term keys and known peers.

mod device;
mod directory;
mod keystore;
mod storage;

pub use device::{DeviceId, Fingerprint, ParseDeviceIdError, DEVICE_ID_LEN};
pub use directory::{ContactCard, ContactCardError, PeerDirectory, PeerRecord};
pub use keystore::{
    KeyStore, PublicIdentity, WrappedKey, MASTER_SEED_LEN, ML_KEM_768_CIPHERTEXT_BYTES,
    ML_KEM_768_PUBLIC_KEY_BYTES, SIGNATURE_LEN,
};
pub use storage::{FileKeyStore, KeyMaterialStore, MemoryKeyStore, StorageError};
