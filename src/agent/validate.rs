//! Hardened ServiceHost message validation.
//!
//! A ServiceHost runs tunnels whose configs come from a shared service
//! group, so it refuses any Message that could smuggle shell payloads into
//! the tunnel lifecycle hooks. Validation runs before any side effect; a
//! failed check aborts the whole convergence tick.

use crate::model::Message;
use crate::util::sanitize;

/// Commands that must never appear in a service tunnel's hooks.
const RESERVED_WORDS: &[&str] = &["apk", "ssh", "wget", "curl"];

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("message must contain exactly one network")]
    NetCount,
    #[error("message device is missing or invalid")]
    InvalidDevice,
    #[error("network must contain exactly one VPN for this device")]
    VpnCount,
    #[error("vpn is invalid: {0}")]
    InvalidVpn(String),
    #[error("vpn type must be Service")]
    NotService,
    #[error("{0} must be empty")]
    HookNotEmpty(&'static str),
    #[error("{0} contains forbidden characters")]
    HookUnsafe(&'static str),
    #[error("{0} contains reserved word {1}")]
    ReservedWord(&'static str, &'static str),
}

pub fn validate_message(msg: &Message, device_id: &str) -> Result<(), ValidationError> {
    if !msg.device.as_ref().map(|d| d.is_valid()).unwrap_or(false) {
        return Err(ValidationError::InvalidDevice);
    }

    if msg.config.len() != 1 {
        return Err(ValidationError::NetCount);
    }
    let net = &msg.config[0];

    let ours: Vec<_> = net
        .vpns
        .iter()
        .filter(|v| v.device_id == device_id)
        .collect();
    if ours.len() != 1 {
        return Err(ValidationError::VpnCount);
    }
    let vpn = ours[0];

    if vpn.name.is_empty() {
        return Err(ValidationError::InvalidVpn("missing name".into()));
    }
    if vpn.current.address.is_empty() {
        return Err(ValidationError::InvalidVpn("no addresses".into()));
    }
    for addr in &vpn.current.address {
        if crate::util::network_address(addr).is_none() {
            return Err(ValidationError::InvalidVpn(format!("bad address {addr}")));
        }
    }

    if vpn.current.vpn_type != "Service" {
        return Err(ValidationError::NotService);
    }
    if !vpn.current.pre_up.is_empty() {
        return Err(ValidationError::HookNotEmpty("preUp"));
    }
    if !vpn.current.pre_down.is_empty() {
        return Err(ValidationError::HookNotEmpty("preDown"));
    }

    check_hook("postUp", &vpn.current.post_up)?;
    check_hook("postDown", &vpn.current.post_down)?;
    Ok(())
}

fn check_hook(label: &'static str, hook: &str) -> Result<(), ValidationError> {
    if sanitize(hook) != hook {
        return Err(ValidationError::HookUnsafe(label));
    }
    let lower = hook.to_lowercase();
    for word in RESERVED_WORDS {
        if lower.contains(word) {
            return Err(ValidationError::ReservedWord(label, word));
        }
    }
    Ok(())
}
