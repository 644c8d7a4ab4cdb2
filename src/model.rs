//! Wire model for control-plane Messages.
//!
//! The control plane speaks camelCase JSON where optional fields are often
//! present as empty strings. Empty string means "no change" when merging into
//! the local device; a bare boolean `enable` is always authoritative.

use serde::{Deserialize, Serialize};

/// VPN failover states reported back to the control plane.
pub const NOFAILOVER: i32 = 0;
pub const FAILOVER: i32 = 1;

/// Default polling interval in seconds.
pub const DEFAULT_CHECK_INTERVAL: i64 = 10;

fn default_true() -> bool {
    true
}

fn default_check_interval() -> i64 {
    DEFAULT_CHECK_INTERVAL
}

/// The local node's identity on one control-plane server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    pub id: String,
    pub server: String,
    pub api_key: String,
    pub account_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval: i64,
    pub registered: bool,
    pub quiet: bool,
    pub debug: bool,
    #[serde(default = "default_true")]
    pub update_keys: bool,
    pub instance_id: String,
    pub ez_code: String,
    pub service_group: String,
    pub service_api_key: String,
    pub source_address: String,
    pub platform: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub created: Option<String>,
    pub updated: Option<String>,
    pub text_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
    pub conference_enabled: Option<bool>,
}

impl Device {
    /// Minimal validity check used by the ServiceHost gate and bootstrap.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.server.is_empty() && !self.api_key.is_empty()
    }
}

/// Authoritative snapshot from one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub device: Option<Device>,
    pub config: Vec<Net>,
}

/// A named WireGuard network grouping peer VPNs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Net {
    pub net_name: String,
    pub net_id: String,
    pub vpns: Vec<Vpn>,
}

impl Net {
    /// Index of the VPN belonging to the given device, if any.
    pub fn vpn_index_for(&self, device_id: &str) -> Option<usize> {
        self.vpns.iter().position(|v| v.device_id == device_id)
    }
}

/// One peer endpoint inside a Net.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Vpn {
    pub id: String,
    pub account_id: String,
    pub device_id: String,
    pub name: String,
    pub net_name: String,
    pub net_id: String,
    pub enable: bool,
    pub failover: i32,
    pub created: Option<String>,
    pub updated: Option<String>,
    pub current: Settings,
    pub default: Settings,
}

/// Concrete per-VPN parameters applied when rendering a tunnel config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub address: Vec<String>,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    pub dns: Vec<String>,
    pub endpoint: String,
    pub listen_port: u32,
    pub mtu: u32,
    pub pre_up: String,
    pub post_up: String,
    pub pre_down: String,
    pub post_down: String,
    pub public_key: String,
    pub private_key: String,
    pub preshared_key: String,
    pub enable_dns: bool,
    pub fail_safe: bool,
    pub upnp: bool,
    pub sync_endpoint: bool,
    pub persistent_keepalive: u32,
    #[serde(rename = "type")]
    pub vpn_type: String,
}

/// Structural equality over the server-managed Device fields. Used to decide
/// whether a bootstrap merge needs to be pushed back to the server.
pub fn compare_devices(a: &Device, b: &Device) -> bool {
    a.id == b.id
        && a.registered == b.registered
        && a.instance_id == b.instance_id
        && a.ez_code == b.ez_code
        && a.name == b.name
        && a.api_key == b.api_key
        && a.server == b.server
        && a.check_interval == b.check_interval
        && a.enable == b.enable
        && a.platform == b.platform
        && a.version == b.version
        && a.source_address == b.source_address
        && a.updated == b.updated
        && a.created == b.created
        && a.account_id == b.account_id
        && a.service_group == b.service_group
        && a.service_api_key == b.service_api_key
        && a.text_enabled == b.text_enabled
        && a.video_enabled == b.video_enabled
        && a.conference_enabled == b.conference_enabled
}

/// Merge a server-sent Device into the locally held one.
///
/// Empty strings are "no change"; `enable` is authoritative; `registered`
/// latches true. Quiet, debug and version stay client-owned and are never
/// touched here. Capability flags take the server's value, including `None`.
pub fn merge_device(from: &Device, into: &mut Device) {
    if from.id != into.id {
        into.id = from.id.clone();
    }
    if from.registered {
        into.registered = true;
    }
    if !from.name.is_empty() {
        into.name = from.name.clone();
    }
    if !from.api_key.is_empty() {
        into.api_key = from.api_key.clone();
    }
    if !from.server.is_empty() {
        into.server = from.server.clone();
    }
    if from.check_interval != 0 {
        into.check_interval = from.check_interval;
    }
    if into.check_interval == 0 {
        into.check_interval = DEFAULT_CHECK_INTERVAL;
    }
    into.enable = from.enable;
    if !from.platform.is_empty() {
        into.platform = from.platform.clone();
    }
    if !from.source_address.is_empty() {
        into.source_address = from.source_address.clone();
    }
    into.updated = from.updated.clone();
    into.created = from.created.clone();
    if !from.account_id.is_empty() {
        into.account_id = from.account_id.clone();
    }
    if !from.service_group.is_empty() {
        into.service_group = from.service_group.clone();
    }
    if !from.service_api_key.is_empty() {
        into.service_api_key = from.service_api_key.clone();
    }
    if !from.instance_id.is_empty() {
        into.instance_id = from.instance_id.clone();
    }
    into.ez_code = from.ez_code.clone();
    into.text_enabled = from.text_enabled;
    into.video_enabled = from.video_enabled;
    into.conference_enabled = from.conference_enabled;
}
