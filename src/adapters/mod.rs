//! External collaborators the reconciliation core drives.
//!
//! Everything here talks to the world outside the process: the WireGuard
//! tooling, the local GUI agent, the internet gateway, and the OS service
//! manager. The core only depends on the narrow interfaces; failures are
//! reported per call and never abort a convergence pass.

pub mod notify;
pub mod service;
pub mod template;
pub mod upnp;
pub mod wg;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },
    #[error("`{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Platform tunnel control. Names are pre-sanitized by the caller.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Platform-dependent first-time setup, used as the retry when a plain
    /// start fails.
    async fn install(&self, net: &str) -> Result<(), AdapterError>;
    async fn start(&self, net: &str) -> Result<(), AdapterError>;
    async fn stop(&self, net: &str) -> Result<(), AdapterError>;
    async fn remove(&self, net: &str) -> Result<(), AdapterError>;
    async fn is_running(&self, net: &str) -> bool;
    /// Raw `wg show <net> transfer` output.
    async fn stats(&self, net: &str) -> Result<String, AdapterError>;
}

#[cfg(test)]
pub mod testing {
    //! Recording tunnel backend for converger and control-surface tests.

    use std::collections::HashSet;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{AdapterError, TunnelBackend};

    #[derive(Default)]
    pub struct RecordingBackend {
        pub calls: Mutex<Vec<String>>,
        pub running: Mutex<HashSet<String>>,
        pub stats_output: Mutex<String>,
    }

    impl RecordingBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn set_running(&self, net: &str) {
            self.running.lock().insert(net.to_string());
        }
    }

    #[async_trait]
    impl TunnelBackend for RecordingBackend {
        async fn install(&self, net: &str) -> Result<(), AdapterError> {
            self.calls.lock().push(format!("install {net}"));
            Ok(())
        }

        async fn start(&self, net: &str) -> Result<(), AdapterError> {
            self.calls.lock().push(format!("start {net}"));
            self.running.lock().insert(net.to_string());
            Ok(())
        }

        async fn stop(&self, net: &str) -> Result<(), AdapterError> {
            self.calls.lock().push(format!("stop {net}"));
            self.running.lock().remove(net);
            Ok(())
        }

        async fn remove(&self, net: &str) -> Result<(), AdapterError> {
            self.calls.lock().push(format!("remove {net}"));
            self.running.lock().remove(net);
            Ok(())
        }

        async fn is_running(&self, net: &str) -> bool {
            self.running.lock().contains(net)
        }

        async fn stats(&self, net: &str) -> Result<String, AdapterError> {
            self.calls.lock().push(format!("stats {net}"));
            Ok(self.stats_output.lock().clone())
        }
    }
}
