//! Persistent WireGuard key store.
//!
//! A process-wide map of public → private keys, serialized by one mutex.
//! Every mutation is persisted inside the lock so `add` and `save` cannot
//! race. The in-memory map stays authoritative for the running process, so
//! callers treat persistence failures as non-fatal.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tracing::error;
use x25519_dalek::{PublicKey, StaticSecret};

const KEYS_FILE: &str = "keys.keys";

pub struct KeyStore {
    path: PathBuf,
    keys: Mutex<HashMap<String, String>>,
}

impl KeyStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(KEYS_FILE),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Load the persisted map. A missing file is a fresh install, not an error.
    pub fn load(&self) -> std::io::Result<()> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let map: HashMap<String, String> = serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        *self.keys.lock() = map;
        Ok(())
    }

    pub fn lookup(&self, public: &str) -> Option<String> {
        self.keys.lock().get(public).cloned()
    }

    pub fn add(&self, public: &str, private: &str) -> std::io::Result<()> {
        let mut keys = self.keys.lock();
        keys.insert(public.to_string(), private.to_string());
        Self::persist(&self.path, &keys)
    }

    pub fn delete(&self, public: &str) -> std::io::Result<()> {
        let mut keys = self.keys.lock();
        keys.remove(public);
        Self::persist(&self.path, &keys)
    }

    pub fn save(&self) -> std::io::Result<()> {
        let keys = self.keys.lock();
        Self::persist(&self.path, &keys)
    }

    /// Atomic write: temp file in the same directory, fsync, rename over the
    /// old map. Mode 0600 since the values are private keys.
    fn persist(path: &Path, keys: &HashMap<String, String>) -> std::io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let data = serde_json::to_vec(keys)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tmp.as_file().set_permissions(perms)?;
        }
        tmp.persist(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to persist key store");
            e.error
        })?;
        Ok(())
    }

    /// Generate a fresh Curve25519 keypair, returned as (public, private)
    /// base64 strings in the WireGuard encoding.
    pub fn generate() -> (String, String) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (
            BASE64.encode(public.as_bytes()),
            BASE64.encode(secret.to_bytes()),
        )
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }
}
