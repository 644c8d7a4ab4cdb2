//! One-shot migration from the legacy single-server file layout.
//!
//! Older releases kept one `nettica.json` regardless of which server the
//! device was enrolled with. The multi-server layout names each file after
//! its server host. The legacy file is copied, not renamed, so an old agent
//! left on the machine can still read it; the untouched originals land in
//! `original/` as a safety net.

use std::path::Path;

use tracing::{error, info};

use crate::model::Message;
use crate::registry::host_name;

pub fn run(data_dir: &Path) {
    let legacy = data_dir.join("nettica.json");
    if !legacy.exists() {
        return;
    }

    let data = match std::fs::read(&legacy) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "failed to read legacy config");
            return;
        }
    };
    let host = serde_json::from_slice::<Message>(&data)
        .ok()
        .and_then(|msg| msg.device.map(|d| host_name(&d.server)))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "my.nettica.com".to_string());

    let target = data_dir.join(format!("{host}.json"));
    if target.exists() {
        return;
    }

    info!(%host, "migrating legacy single-server layout");

    let backup_dir = data_dir.join("original");
    if let Err(e) = std::fs::create_dir_all(&backup_dir) {
        error!(error = %e, "failed to create backup directory");
    }
    for name in ["nettica.json", "nettica.conf", "nettica-service-host.json"] {
        let src = data_dir.join(name);
        if src.exists() {
            if let Err(e) = std::fs::copy(&src, backup_dir.join(name)) {
                error!(file = %name, error = %e, "failed to back up legacy file");
            }
        }
    }

    if let Err(e) = std::fs::write(&target, &data) {
        error!(path = %target.display(), error = %e, "failed to write migrated server file");
        return;
    }

    let legacy_service = data_dir.join("nettica-service-host.json");
    if legacy_service.exists() {
        let service_target = data_dir.join(format!("{host}-service-host.json"));
        if let Err(e) = std::fs::rename(&legacy_service, &service_target) {
            error!(error = %e, "failed to move service host file");
        }
    }

    info!("migration complete");
}
