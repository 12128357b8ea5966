//! where key blob encryption keys come from
//!
//! key files are created owner-only (0600 on unix).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::random_bytes;
use crate::error::KeyProviderError;

pub trait EncryptionKeyProvider {
    /// the key blob encryption key, created on first use if needed
    fn export_or_generate_encryption_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyProviderError>;
}

/// fixed key held in memory
pub struct StaticKeyProvider {
    key: Option<Zeroizing<[u8; 32]>>,
}

impl StaticKeyProvider {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key: Some(Zeroizing::new(key)) }
    }

    /// provider that always fails, standing in for an unreachable key service
    pub fn unavailable() -> Self {
        Self { key: None }
    }
}

impl EncryptionKeyProvider for StaticKeyProvider {
    fn export_or_generate_encryption_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyProviderError> {
        self.key
            .clone()
            .ok_or_else(|| KeyProviderError::Unavailable("no key configured".into()))
    }
}

/// 32 byte key kept in a file, generated the first time it is asked for
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    fn generate(&self) -> Result<Zeroizing<[u8; 32]>, KeyProviderError> {
        let key = Zeroizing::new(random_bytes::<32>());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut f = opts.open(&self.path).map_err(unavailable)?;
        f.write_all(key.as_slice()).map_err(unavailable)?;
        f.sync_all().map_err(unavailable)?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::File::open(parent).and_then(|d| d.sync_all()).map_err(unavailable)?;
        info!(path = %self.path.display(), "generated key file");
        Ok(key)
    }
}

impl EncryptionKeyProvider for FileKeyProvider {
    fn export_or_generate_encryption_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyProviderError> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let bytes = Zeroizing::new(bytes);
                if bytes.len() != 32 {
                    return Err(KeyProviderError::Unavailable(format!(
                        "{} holds {} bytes, expected 32",
                        self.path.display(),
                        bytes.len()
                    )));
                }
                let mut key = Zeroizing::new([0u8; 32]);
                key.copy_from_slice(&bytes);
                Ok(key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.generate(),
            Err(e) => Err(unavailable(e)),
        }
    }
}

fn unavailable(e: std::io::Error) -> KeyProviderError {
    KeyProviderError::Unavailable(e.to_string())
}
