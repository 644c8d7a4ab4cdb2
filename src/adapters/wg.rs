//! `wg-quick` tunnel backend.
//!
//! Shells out to the WireGuard tooling with a hard deadline per command so a
//! wedged script can never stall a reconciler tick indefinitely.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error};

use super::{AdapterError, TunnelBackend};

const COMMAND_DEADLINE: Duration = Duration::from_secs(5);

pub struct WgQuick {
    wireguard_dir: PathBuf,
}

impl WgQuick {
    pub fn new(wireguard_dir: &Path) -> Self {
        Self {
            wireguard_dir: wireguard_dir.to_path_buf(),
        }
    }

    /// On-disk config path for a net. `wg-quick` accepts either an interface
    /// name (resolved against its own config directory) or an explicit path;
    /// the explicit path keeps us independent of the tool's default.
    pub fn conf_path(&self, net: &str) -> PathBuf {
        self.wireguard_dir.join(format!("{net}.conf"))
    }

    fn quick_target(&self, net: &str) -> String {
        let path = self.conf_path(net);
        if path.exists() {
            path.to_string_lossy().into_owned()
        } else {
            net.to_string()
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, AdapterError> {
        let command = format!("{} {}", program, args.join(" "));
        debug!(%command, "running");
        let output = timeout(COMMAND_DEADLINE, Command::new(program).args(args).output())
            .await
            .map_err(|_| AdapterError::Timeout {
                command: command.clone(),
                seconds: COMMAND_DEADLINE.as_secs(),
            })??;
        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(%command, %detail, "command failed");
            return Err(AdapterError::Command { command, detail });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TunnelBackend for WgQuick {
    async fn install(&self, net: &str) -> Result<(), AdapterError> {
        self.start(net).await
    }

    async fn start(&self, net: &str) -> Result<(), AdapterError> {
        let target = self.quick_target(net);
        self.run("wg-quick", &["up", &target]).await.map(|_| ())
    }

    async fn stop(&self, net: &str) -> Result<(), AdapterError> {
        let target = self.quick_target(net);
        self.run("wg-quick", &["down", &target]).await.map(|_| ())
    }

    async fn remove(&self, net: &str) -> Result<(), AdapterError> {
        self.stop(net).await
    }

    async fn is_running(&self, net: &str) -> bool {
        self.run("wg", &["show", net]).await.is_ok()
    }

    async fn stats(&self, net: &str) -> Result<String, AdapterError> {
        self.run("wg", &["show", net, "transfer"]).await
    }
}
