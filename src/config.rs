//! Bootstrap configuration.
//!
//! Most settings arrive through `NETTICA_*` environment variables so the
//! agent can run unattended under a service manager; every variable also has
//! a CLI flag. The truthy variables (`NETTICA_QUIET`, `NETTICA_DEBUG`) treat
//! presence with an empty value, "true" or "1" as enabled, which clap cannot
//! express directly; those are resolved in [`Config::finalize`].

use std::path::PathBuf;

use clap::Parser;

/// Endpoint agent that keeps this host's WireGuard tunnels synchronized with
/// one or more Nettica control-plane servers.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Control-plane server URL used when no server file exists yet
    #[arg(long, env = "NETTICA_SERVER")]
    pub server: Option<String>,

    /// Device ID assigned by the control plane
    #[arg(long, env = "NETTICA_DEVICE_ID")]
    pub device_id: Option<String>,

    /// API key for the device
    #[arg(long, env = "NETTICA_API_KEY")]
    pub api_key: Option<String>,

    /// Service group for ServiceHost deployments
    #[arg(long, env = "NETTICA_SERVICE_GROUP")]
    pub service_group: Option<String>,

    /// API key for the service group
    #[arg(long, env = "NETTICA_SERVICE_API_KEY")]
    pub service_api_key: Option<String>,

    /// Cloud instance ID, when launched from machine imagery
    #[arg(long, env = "NETTICA_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// One-time enrollment code
    #[arg(long, env = "NETTICA_EZCODE")]
    pub ez_code: Option<String>,

    /// Seconds between polls of each server
    #[arg(long, default_value_t = 10)]
    pub check_interval: i64,

    /// Source address for outbound HTTP requests
    #[arg(long)]
    pub source: Option<String>,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Directory for server files and the key store
    #[arg(long, default_value_os_t = default_data_dir())]
    pub data_dir: PathBuf,

    /// Directory for rendered tunnel configs
    #[arg(long, default_value_os_t = default_wireguard_dir())]
    pub wireguard_dir: PathBuf,

    /// Suppress routine log output
    #[arg(skip)]
    pub quiet: bool,

    /// Verbose debug logging
    #[arg(skip)]
    pub debug: bool,

    /// Re-send adopted keys to the server (disabled only by
    /// NETTICA_UPDATE_KEYS=false)
    #[arg(skip = true)]
    pub update_keys: bool,

    /// Hardened ServiceHost mode: reject Messages carrying shell-privileged
    /// tunnel hooks (enabled by the presence of NETTICA_SERVICE_HOST)
    #[arg(skip)]
    pub service_host: bool,
}

impl Config {
    /// Parse CLI + environment and resolve the truthy variables.
    pub fn load() -> Self {
        let mut config = Self::parse();
        config.finalize();
        config
    }

    pub fn finalize(&mut self) {
        if let Ok(v) = std::env::var("NETTICA_QUIET") {
            self.quiet = truthy(&v);
        }
        if let Ok(v) = std::env::var("NETTICA_DEBUG") {
            self.debug = truthy(&v);
        }
        self.update_keys = !std::env::var("NETTICA_UPDATE_KEYS")
            .map(|v| v.eq_ignore_ascii_case("false"))
            .unwrap_or(false);
        self.service_host = std::env::var_os("NETTICA_SERVICE_HOST").is_some();
        if self.check_interval < 1 {
            self.check_interval = 10;
        }
    }

    /// User-Agent sent on every control-plane request.
    pub fn user_agent() -> String {
        format!("nettica-client/{}", env!("CARGO_PKG_VERSION"))
    }

    pub fn platform() -> &'static str {
        if cfg!(target_os = "linux") {
            "Linux"
        } else if cfg!(target_os = "macos") {
            "MacOS"
        } else if cfg!(target_os = "windows") {
            "Windows"
        } else {
            std::env::consts::OS
        }
    }
}

/// Empty, "true" and "1" all mean enabled.
fn truthy(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("true") || value == "1"
}

fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/usr/local/etc/nettica")
    } else if cfg!(target_os = "windows") {
        PathBuf::from("C:\\ProgramData\\Nettica")
    } else {
        PathBuf::from("/etc/nettica")
    }
}

fn default_wireguard_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/usr/local/etc/wireguard")
    } else if cfg!(target_os = "windows") {
        PathBuf::from("C:\\ProgramData\\Nettica\\Wireguard")
    } else {
        PathBuf::from("/etc/wireguard")
    }
}
