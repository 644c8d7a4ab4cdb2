//! Shared application state passed to all subsystems.

use std::sync::Arc;

use tokio::sync::watch;

use crate::adapters::notify::Notifier;
use crate::adapters::upnp::UpnpMapper;
use crate::adapters::TunnelBackend;
use crate::config::Config;
use crate::dns::DnsState;
use crate::failsafe::FailSafe;
use crate::keystore::KeyStore;
use crate::registry::ServerRegistry;

/// Central state shared across reconcilers, the DNS resolver, and the local
/// control surface. The conference hub deliberately holds none of this.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ServerRegistry,
    pub keystore: KeyStore,
    pub failsafe: FailSafe,
    pub dns: Arc<DnsState>,
    pub tunnels: Arc<dyn TunnelBackend>,
    pub upnp: Arc<UpnpMapper>,
    pub notify: Notifier,
    shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        registry: ServerRegistry,
        keystore: KeyStore,
        dns: Arc<DnsState>,
        tunnels: Arc<dyn TunnelBackend>,
        notify: Notifier,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry,
            keystore,
            failsafe: FailSafe::new(),
            dns,
            tunnels,
            upnp: Arc::new(UpnpMapper::new()),
            notify,
            shutdown_tx,
        }
    }

    /// Process-wide shutdown signal, observed by every long-running task.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
