//! Registry of configured control-plane servers.
//!
//! Each remote server the device is enrolled with is persisted as one JSON
//! file in the data directory; the file is the source of truth across
//! restarts. Every registry entry owns a shutdown channel its reconciler
//! task observes at the loop head.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::model::Message;
use crate::util::sanitize;

/// Reserved file consumed by the legacy single-server layout.
const LEGACY_FILE: &str = "nettica.json";

struct ServerState {
    config: Message,
    body: Vec<u8>,
}

/// One registered control-plane server and its cached Message.
pub struct Server {
    /// Sanitized server host, used for logging and the file name.
    pub name: String,
    /// Persistence file backing this entry.
    pub path: PathBuf,
    state: RwLock<ServerState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown: AtomicBool,
}

impl Server {
    fn new(name: String, path: PathBuf, config: Message, body: Vec<u8>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name,
            path,
            state: RwLock::new(ServerState { config, body }),
            shutdown_tx,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> Message {
        self.state.read().config.clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.state.read().body.clone()
    }

    /// Device ID this server addresses us by.
    pub fn device_id(&self) -> String {
        self.state
            .read()
            .config
            .device
            .as_ref()
            .map(|d| d.id.clone())
            .unwrap_or_default()
    }

    pub fn set_message(&self, config: Message, body: Vec<u8>) {
        let mut state = self.state.write();
        state.config = config;
        state.body = body;
    }

    /// Mutate the cached Message in place (callers persist via
    /// [`ServerRegistry::save`] afterwards).
    pub fn update_config(&self, f: impl FnOnce(&mut Message)) {
        let mut state = self.state.write();
        f(&mut state.config);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

pub struct ServerRegistry {
    data_dir: PathBuf,
    servers: DashMap<PathBuf, Arc<Server>>,
}

impl ServerRegistry {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            servers: DashMap::new(),
        }
    }

    /// Scan the data directory for persisted server files and populate the
    /// registry. Unreadable entries are skipped with a warning.
    pub fn load(&self) -> std::io::Result<()> {
        let entries = std::fs::read_dir(&self.data_dir)?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".json")
                || file_name == LEGACY_FILE
                || file_name.ends_with("-service-host.json")
            {
                continue;
            }
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read server file");
                    continue;
                }
            };
            let config: Message = match serde_json::from_slice(&data) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse server file");
                    continue;
                }
            };
            let name = config
                .device
                .as_ref()
                .map(|d| host_name(&d.server))
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| file_name.trim_end_matches(".json").to_string());
            info!(server = %name, path = %path.display(), "loaded server");
            let server = Arc::new(Server::new(name, path.clone(), config, data));
            self.servers.insert(path, server);
        }
        Ok(())
    }

    /// Create a fresh entry for a server URL not seen before.
    pub fn create(&self, server_url: &str, config: Message) -> Arc<Server> {
        let name = host_name(server_url);
        let path = self.server_path(server_url);
        let server = Arc::new(Server::new(name, path.clone(), config, Vec::new()));
        self.servers.insert(path, Arc::clone(&server));
        server
    }

    /// Persist the server's Message atomically. The file holds the
    /// serialized config (the source of truth across restarts) while the
    /// in-memory `body` keeps the raw wire bytes the reconciler compares
    /// incoming responses against.
    pub fn save(&self, server: &Server) -> std::io::Result<()> {
        let state = server.state.read();
        let data = serde_json::to_vec(&state.config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        drop(state);
        let dir = server
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&server.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Re-read the persisted file into memory, picking up credential edits
    /// made by the agent or by hand.
    pub fn reload(&self, server: &Server) -> std::io::Result<()> {
        let data = std::fs::read(&server.path)?;
        let config: Message = serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        server.set_message(config, data);
        Ok(())
    }

    /// Un-root a server: flag and signal its reconciler, delete the file,
    /// drop the entry.
    pub fn remove(&self, server: &Server) {
        server.shutdown.store(true, Ordering::SeqCst);
        let _ = server.shutdown_tx.send(true);
        if let Err(e) = std::fs::remove_file(&server.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(path = %server.path.display(), error = %e, "failed to remove server file");
            }
        }
        self.servers.remove(&server.path);
        info!(server = %server.name, "server removed");
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Server>> {
        self.servers.get(path).map(|s| Arc::clone(&s))
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Persistence path for a server URL.
    pub fn server_path(&self, server_url: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", host_name(server_url)))
    }
}

/// Turn a server URL into a safe file-name stem: strip the scheme, then
/// strip path and shell metacharacters.
pub(crate) fn host_name(server_url: &str) -> String {
    let lower = server_url.to_ascii_lowercase();
    let rest = if lower.starts_with("https://") {
        &server_url[8..]
    } else if lower.starts_with("http://") {
        &server_url[7..]
    } else {
        server_url
    };
    sanitize(rest)
}
