// Copyright (c) 2024 Botho Foundation

//! Persistence of the private identity.
//!
//! The core never writes key material itself; it goes through a
//! [`KeyMaterialStore`]. [`FileKeyStore`] keeps it in a file readable only by
//! the owner.

use crate::crypto::CryptoError;
use parking_lot::Mutex;
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors from loading or storing key material.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("stored key material is corrupt")]
    Corrupt,

    #[error(transparent)]
    KeyGeneration(#[from] CryptoError),
}

/// Backing store for the device's private key material.
pub trait KeyMaterialStore: Send + Sync {
    /// Read stored material, `None` if nothing was stored yet.
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError>;

    /// Replace the stored material.
    fn store(&self, material: &[u8]) -> Result<(), StorageError>;
}

/// Key material kept in a file with mode 0600.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyMaterialStore for FileKeyStore {
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, material: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        file.write_all(material)?;
        file.sync_all()?;

        // The mode above only applies to newly created files
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

/// Key material held in memory only; the identity dies with the process.
#[derive(Default)]
pub struct MemoryKeyStore {
    material: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyMaterialStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        Ok(self.material.lock().clone())
    }

    fn store(&self, material: &[u8]) -> Result<(), StorageError> {
        *self.material.lock() = Some(Zeroizing::new(material.to_vec()));
        Ok(())
    }
}
