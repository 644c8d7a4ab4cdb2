//! The converger: diff the authoritative Message against local state and
//! drive the host to match.
//!
//! Per-VPN failures are logged and skipped; the next VPN proceeds and the
//! next tick retries. The only hard failures are an unparseable Message and
//! a ServiceHost validation rejection, both of which abort the tick before
//! any side effect.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, error, info, warn};

use super::api::ApiClient;
use super::validate::{self, ValidationError};
use crate::adapters::template;
use crate::model::{Device, Message, Net, Vpn, DEFAULT_CHECK_INTERVAL, FAILOVER};
use crate::registry::Server;
use crate::state::AppState;
use crate::util::{self, sanitize, strip_prefix_len};

#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    #[error("unparseable message: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Bring local tunnel state into line with `body`, the raw Message bytes
/// fetched from (or cached for) one server.
pub async fn converge(
    state: &Arc<AppState>,
    server: &Arc<Server>,
    api: &ApiClient,
    body: &[u8],
    is_background: bool,
) -> Result<(), ConvergeError> {
    // Parse before anything else: a bad Message aborts without side effects.
    let mut msg: Message = serde_json::from_slice(body)?;
    if state.config.service_host {
        validate::validate_message(&msg, &server.device_id())?;
    }

    let failsafe_active = state.failsafe.is_active();
    if body == server.body().as_slice()
        && !state.failsafe.bounce_pending()
        && !failsafe_active
        && !is_background
    {
        debug!(server = %server.name, "message unchanged, nothing to do");
        return Ok(());
    }
    info!(server = %server.name, "config changed, converging");

    let old = server.config();
    carry_client_fields(&mut msg, &old);
    let device = msg.device.clone().unwrap_or_default();

    server.set_message(msg.clone(), body.to_vec());
    if let Err(e) = state.registry.save(server) {
        // In-memory state stays authoritative; the next tick re-writes.
        error!(server = %server.name, error = %e, "failed to persist server file");
    }

    // Device gate: a disabled device runs no tunnels at all.
    if !device.enable {
        info!(server = %server.name, "device is disabled, stopping all tunnels");
        for net in &msg.config {
            let _ = state.tunnels.stop(&sanitize(&net.net_name)).await;
        }
        return Ok(());
    }

    // Deletion pass: networks present in the old Message but gone from the
    // new one are torn down completely.
    for old_net in &old.config {
        if msg.config.iter().any(|n| n.net_name == old_net.net_name) {
            continue;
        }
        let net_name = sanitize(&old_net.net_name);
        info!(net = %net_name, "network removed by server");
        if let Err(e) = state.tunnels.stop(&net_name).await {
            warn!(net = %net_name, error = %e, "failed to stop removed network");
        }
        let conf = state.config.wireguard_dir.join(format!("{net_name}.conf"));
        if let Err(e) = std::fs::remove_file(&conf) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %conf.display(), error = %e, "failed to remove config");
            }
        }
        for vpn in &old_net.vpns {
            if vpn.device_id == device.id {
                if let Err(e) = state.keystore.delete(&vpn.current.public_key) {
                    error!(error = %e, "failed to persist key store");
                }
            }
        }
        state
            .notify
            .info(&format!("Network {} has been removed", old_net.net_name));
    }

    // Per-net convergence. Errors are contained per network.
    let subnets = util::local_subnets();
    for net in &msg.config {
        if let Err(e) = converge_net(state, api, &device, net, &subnets, is_background).await {
            error!(net = %net.net_name, error = %e, "network convergence failed");
        }
    }

    // Post-pass: the DNS snapshot aggregates every server's cached state.
    let messages: Vec<Message> = state
        .registry
        .servers()
        .iter()
        .map(|s| s.config())
        .collect();
    state.dns.rebuild(&messages).await;
    state.failsafe.clear_bounce();

    Ok(())
}

/// Client-owned Device fields survive the wholesale Message replacement.
fn carry_client_fields(msg: &mut Message, old: &Message) {
    let Some(new_dev) = msg.device.as_mut() else {
        return;
    };
    if let Some(old_dev) = old.device.as_ref() {
        new_dev.quiet = old_dev.quiet;
        new_dev.debug = old_dev.debug;
        new_dev.version = old_dev.version.clone();
        if new_dev.instance_id.is_empty() {
            new_dev.instance_id = old_dev.instance_id.clone();
        }
        if new_dev.ez_code.is_empty() {
            new_dev.ez_code = old_dev.ez_code.clone();
        }
    }
    if new_dev.check_interval < 1 {
        new_dev.check_interval = DEFAULT_CHECK_INTERVAL;
    }
}

async fn converge_net(
    state: &Arc<AppState>,
    api: &ApiClient,
    device: &Device,
    net: &Net,
    subnets: &[IpNet],
    is_background: bool,
) -> anyhow::Result<()> {
    let Some(idx) = net.vpn_index_for(&device.id) else {
        debug!(net = %net.net_name, "no VPN for this device, skipping");
        return Ok(());
    };
    let mut vpns = net.vpns.clone();
    let mut vpn = vpns.remove(idx);
    let mut peers = vpns;
    let net_name = sanitize(&net.net_name);

    // UPnP reconciliation runs on its own; a slow gateway must not stall
    // the tick. A corrected endpoint is pushed back to the control plane.
    {
        let upnp = Arc::clone(&state.upnp);
        let api = api.clone();
        let v = vpn.clone();
        tokio::spawn(async move {
            match upnp.configure(&v).await {
                Ok(Some(corrected)) => {
                    if let Err(e) = api.update_vpn(&corrected).await {
                        warn!(vpn = %corrected.name, error = %e, "failed to push corrected endpoint");
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(vpn = %v.name, error = %e, "UPnP reconcile failed"),
            }
        });
    }

    prune_allowed_ips(&vpn, &mut peers, subnets);

    // While the process is in FailSafe, VPNs marked for it are toggled and
    // reported instead of normally converged.
    if state.failsafe.is_active() && vpn.current.fail_safe && vpn.enable {
        if state.tunnels.is_running(&net_name).await {
            if vpn.current.enable_dns {
                if let Some(addr) = first_address(&vpn) {
                    state.dns.stop_listener(addr).await;
                }
                // Drop the resolver state so recovery rebuilds it cleanly.
                state.dns.clear().await;
            }
            if let Err(e) = state.tunnels.stop(&net_name).await {
                warn!(net = %net_name, error = %e, "failsafe stop failed");
            }
            vpn.failover = FAILOVER;
            if let Err(e) = api.update_vpn(&vpn).await {
                warn!(vpn = %vpn.name, error = %e, "failed to report failover");
            }
            state.failsafe.mark_acted();
            state
                .notify
                .info(&format!("Network {} has been stopped", net.net_name));
        } else {
            if let Err(e) = state.tunnels.start(&net_name).await {
                warn!(net = %net_name, error = %e, "failsafe start failed");
            }
            state.failsafe.mark_acted();
        }
        return Ok(());
    }

    adopt_keys(state, api, device, &mut vpn).await;

    let text = template::render(&vpn, &peers);
    let conf_path = state.config.wireguard_dir.join(format!("{net_name}.conf"));
    let (force, existing) = match std::fs::read(&conf_path) {
        Ok(existing) => (false, existing),
        Err(_) => (true, Vec::new()),
    };

    // Background refresh only touches a tunnel that should be up but isn't
    // (laptop sleep, crashed interface).
    let drift = is_background && vpn.enable && !state.tunnels.is_running(&net_name).await;

    if !force && existing == text.as_bytes() && !drift {
        info!(net = %net_name, "no changes, skipping");
        return Ok(());
    }

    if vpn.current.enable_dns {
        if let Some(addr) = first_address(&vpn) {
            state.dns.stop_listener(addr).await;
        }
    }
    if let Err(e) = state.tunnels.stop(&net_name).await {
        debug!(net = %net_name, error = %e, "stop before rewrite failed");
    }

    write_config(&conf_path, text.as_bytes())?;

    if !vpn.enable {
        // Stopping is not always reliable; make sure it sticks.
        if let Err(e) = state.tunnels.stop(&net_name).await {
            warn!(net = %net_name, error = %e, "failed to stop disabled network");
        }
        info!(net = %net_name, "network is disabled, stopped service if running");
        state
            .notify
            .info(&format!("Network {} has been stopped", net.net_name));
        return Ok(());
    }

    match state.tunnels.start(&net_name).await {
        Ok(()) => {
            info!(net = %net_name, "started");
            state
                .notify
                .info(&format!("Network {} is running", net.net_name));
        }
        Err(e) => {
            warn!(net = %net_name, error = %e, "start failed, attempting install");
            match state.tunnels.install(&net_name).await {
                Ok(()) => {
                    info!(net = %net_name, "installed and started");
                    state
                        .notify
                        .info(&format!("Network {} is running", net.net_name));
                }
                Err(e) => {
                    error!(net = %net_name, error = %e, "failed to bring up network");
                    state
                        .notify
                        .info(&format!("Network {} failed to start", net.net_name));
                }
            }
        }
    }

    Ok(())
}

/// Remove from each peer's allowedIPs any prefix that already falls inside
/// a local subnet of the host that we do not advertise ourselves. Routing
/// such a prefix through the tunnel would loop traffic that is directly
/// reachable.
fn prune_allowed_ips(vpn: &Vpn, peers: &mut [Vpn], subnets: &[IpNet]) {
    let ours: Vec<IpNet> = vpn
        .current
        .address
        .iter()
        .filter_map(|a| util::network_address(a))
        .collect();
    let residual: Vec<IpNet> = subnets
        .iter()
        .map(|s| s.trunc())
        .filter(|s| !ours.contains(s))
        .collect();
    if residual.is_empty() {
        return;
    }
    for peer in peers {
        peer.current.allowed_ips.retain(|cidr| {
            let Some(net) = util::network_address(cidr) else {
                return true;
            };
            !residual.iter().any(|s| s.contains(&net))
        });
    }
}

/// Make sure we hold the private key the Message refers to, generating and
/// publishing a replacement when the control plane has none for us.
async fn adopt_keys(state: &Arc<AppState>, api: &ApiClient, device: &Device, vpn: &mut Vpn) {
    let public = vpn.current.public_key.clone();
    let stored = match state.keystore.lookup(&public) {
        Some(stored) => stored,
        None => {
            if let Err(e) = state.keystore.add(&public, &vpn.current.private_key) {
                error!(error = %e, "failed to persist key store");
            }
            if device.update_keys {
                let mut push = vpn.clone();
                push.current.private_key.clear();
                if let Err(e) = api.update_vpn(&push).await {
                    warn!(vpn = %vpn.name, error = %e, "failed to scrub private key upstream");
                }
            }
            vpn.current.private_key.clone()
        }
    };

    if stored.is_empty() {
        let _ = state.keystore.delete(&public);
        let (new_public, new_private) = crate::keystore::KeyStore::generate();
        info!(vpn = %vpn.name, "generated replacement keypair");
        vpn.current.public_key = new_public.clone();
        vpn.current.private_key = new_private.clone();
        if let Err(e) = state.keystore.add(&new_public, &new_private) {
            error!(error = %e, "failed to persist key store");
        }
        let mut push = vpn.clone();
        push.current.private_key.clear();
        if let Err(e) = api.update_vpn(&push).await {
            warn!(vpn = %vpn.name, error = %e, "failed to publish new public key");
        }
    } else {
        vpn.current.private_key = stored;
    }
}

fn first_address(vpn: &Vpn) -> Option<IpAddr> {
    vpn.current
        .address
        .first()
        .and_then(|a| strip_prefix_len(a).parse().ok())
}

pub(crate) fn write_config(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::notify::Notifier;
    use crate::adapters::testing::RecordingBackend;
    use crate::adapters::TunnelBackend;
    use crate::config::Config;
    use crate::dns::DnsState;
    use crate::keystore::KeyStore;
    use crate::model::Settings;
    use crate::registry::ServerRegistry;
    use clap::Parser;

    struct Fixture {
        state: Arc<AppState>,
        backend: Arc<RecordingBackend>,
        server: Arc<Server>,
        api: ApiClient,
        _data: tempfile::TempDir,
        _wg: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let data = tempfile::tempdir().unwrap();
        let wg = tempfile::tempdir().unwrap();
        let mut config = Config::parse_from(["nettica-client"]);
        config.data_dir = data.path().to_path_buf();
        config.wireguard_dir = wg.path().to_path_buf();
        config.update_keys = false;
        let config = Arc::new(config);

        let backend = Arc::new(RecordingBackend::new());
        let notify = Notifier::new();
        let state = Arc::new(AppState::new(
            Arc::clone(&config),
            ServerRegistry::new(data.path()),
            KeyStore::new(data.path()),
            Arc::new(DnsState::new(notify.clone(), true)),
            Arc::clone(&backend) as Arc<dyn crate::adapters::TunnelBackend>,
            notify,
        ));

        let server = state
            .registry
            .create("http://127.0.0.1:9", Message::default());
        // An unroutable local port: PATCH attempts fail fast and are logged.
        let api = ApiClient::new("http://127.0.0.1:9", "d1", "K", None);

        Fixture {
            state,
            backend,
            server,
            api,
            _data: data,
            _wg: wg,
        }
    }

    fn message(nets: &[(&str, &str)]) -> Message {
        Message {
            device: Some(Device {
                id: "d1".into(),
                server: "http://127.0.0.1:9".into(),
                api_key: "K".into(),
                enable: true,
                ..Default::default()
            }),
            config: nets
                .iter()
                .map(|(net_name, addr)| Net {
                    net_name: (*net_name).into(),
                    vpns: vec![Vpn {
                        id: format!("vpn-{net_name}"),
                        device_id: "d1".into(),
                        name: format!("{net_name}-host"),
                        net_name: (*net_name).into(),
                        enable: true,
                        current: Settings {
                            address: vec![(*addr).into()],
                            public_key: format!("PUB-{net_name}"),
                            private_key: format!("PRIV-{net_name}"),
                            ..Default::default()
                        },
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .collect(),
        }
    }

    fn body(msg: &Message) -> Vec<u8> {
        serde_json::to_vec(msg).unwrap()
    }

    #[tokio::test]
    async fn first_converge_writes_config_and_starts() {
        let f = fixture();
        let msg = message(&[("alpha", "10.123.45.2/32")]);
        converge(&f.state, &f.server, &f.api, &body(&msg), false)
            .await
            .unwrap();

        let conf = f.state.config.wireguard_dir.join("alpha.conf");
        assert!(conf.exists());
        let calls = f.backend.calls();
        assert!(calls.contains(&"stop alpha".to_string()));
        assert!(calls.contains(&"start alpha".to_string()));
        // Message adopted into the key store
        assert_eq!(
            f.state.keystore.lookup("PUB-alpha").as_deref(),
            Some("PRIV-alpha")
        );
        // Server file persisted
        assert!(f.server.path.exists());
    }

    #[tokio::test]
    async fn equal_body_is_a_complete_no_op() {
        let f = fixture();
        let msg = message(&[("alpha", "10.123.45.2/32")]);
        let bytes = body(&msg);
        converge(&f.state, &f.server, &f.api, &bytes, false)
            .await
            .unwrap();
        let calls_before = f.backend.calls();
        let conf = f.state.config.wireguard_dir.join("alpha.conf");
        let contents_before = std::fs::read(&conf).unwrap();

        converge(&f.state, &f.server, &f.api, &bytes, false)
            .await
            .unwrap();

        assert_eq!(f.backend.calls(), calls_before);
        assert_eq!(std::fs::read(&conf).unwrap(), contents_before);
    }

    #[tokio::test]
    async fn background_refresh_skips_matching_config() {
        let f = fixture();
        let msg = message(&[("alpha", "10.123.45.2/32")]);
        let bytes = body(&msg);
        converge(&f.state, &f.server, &f.api, &bytes, false)
            .await
            .unwrap();
        let calls_before = f.backend.calls();

        // Tunnel is running and the on-disk config matches: the hourly
        // refresh must not bounce the interface.
        converge(&f.state, &f.server, &f.api, &bytes, true)
            .await
            .unwrap();
        assert_eq!(f.backend.calls(), calls_before);
    }

    #[tokio::test]
    async fn background_refresh_restarts_drifted_tunnel() {
        let f = fixture();
        let msg = message(&[("alpha", "10.123.45.2/32")]);
        let bytes = body(&msg);
        converge(&f.state, &f.server, &f.api, &bytes, false)
            .await
            .unwrap();
        // Simulate the interface dying underneath us.
        f.backend.running.lock().clear();

        converge(&f.state, &f.server, &f.api, &bytes, true)
            .await
            .unwrap();
        let starts = f
            .backend
            .calls()
            .iter()
            .filter(|c| *c == "start alpha")
            .count();
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn removed_network_is_torn_down() {
        let f = fixture();
        let msg = message(&[("alpha", "10.123.45.2/32")]);
        converge(&f.state, &f.server, &f.api, &body(&msg), false)
            .await
            .unwrap();
        assert!(f.state.keystore.lookup("PUB-alpha").is_some());

        let empty = message(&[]);
        converge(&f.state, &f.server, &f.api, &body(&empty), false)
            .await
            .unwrap();

        assert!(!f.state.config.wireguard_dir.join("alpha.conf").exists());
        assert!(f.state.keystore.lookup("PUB-alpha").is_none());
        let calls = f.backend.calls();
        let stops = calls.iter().filter(|c| *c == "stop alpha").count();
        assert!(stops >= 2, "expected teardown stop, got {calls:?}");
    }

    #[tokio::test]
    async fn disabled_device_stops_every_net() {
        let f = fixture();
        let msg = message(&[("alpha", "10.123.45.2/32"), ("beta", "10.123.46.2/32")]);
        converge(&f.state, &f.server, &f.api, &body(&msg), false)
            .await
            .unwrap();

        let mut disabled = message(&[("alpha", "10.123.45.2/32"), ("beta", "10.123.46.2/32")]);
        disabled.device.as_mut().unwrap().enable = false;
        converge(&f.state, &f.server, &f.api, &body(&disabled), false)
            .await
            .unwrap();

        assert!(!f.backend.running.lock().contains("alpha"));
        assert!(!f.backend.running.lock().contains("beta"));
    }

    #[tokio::test]
    async fn disabled_vpn_is_stopped_not_started() {
        let f = fixture();
        let mut msg = message(&[("alpha", "10.123.45.2/32")]);
        msg.config[0].vpns[0].enable = false;
        converge(&f.state, &f.server, &f.api, &body(&msg), false)
            .await
            .unwrap();
        let calls = f.backend.calls();
        assert!(!calls.contains(&"start alpha".to_string()));
        assert!(calls.contains(&"stop alpha".to_string()));
    }

    #[tokio::test]
    async fn failsafe_stops_running_marked_vpn() {
        let f = fixture();
        let mut msg = message(&[("alpha", "10.123.45.2/32")]);
        msg.config[0].vpns[0].current.fail_safe = true;
        let bytes = body(&msg);
        converge(&f.state, &f.server, &f.api, &bytes, false)
            .await
            .unwrap();
        assert!(f.backend.is_running("alpha").await);

        for _ in 0..4 {
            f.state.failsafe.record_failure();
        }
        assert!(f.state.failsafe.is_active());

        converge(&f.state, &f.server, &f.api, &bytes, false)
            .await
            .unwrap();
        assert!(!f.backend.is_running("alpha").await);
        // The latch acted, so the next success must notify once.
        assert!(f.state.failsafe.record_success());
    }

    #[tokio::test]
    async fn failsafe_restarts_stopped_marked_vpn() {
        let f = fixture();
        let mut msg = message(&[("alpha", "10.123.45.2/32")]);
        msg.config[0].vpns[0].current.fail_safe = true;
        let bytes = body(&msg);
        converge(&f.state, &f.server, &f.api, &bytes, false)
            .await
            .unwrap();
        f.backend.running.lock().clear();

        for _ in 0..4 {
            f.state.failsafe.record_failure();
        }
        converge(&f.state, &f.server, &f.api, &bytes, false)
            .await
            .unwrap();
        assert!(f.backend.is_running("alpha").await);
        assert!(f.state.failsafe.record_success());
    }

    #[tokio::test]
    async fn bad_json_aborts_without_side_effects() {
        let f = fixture();
        let result = converge(&f.state, &f.server, &f.api, b"{not json", false).await;
        assert!(matches!(result, Err(ConvergeError::Protocol(_))));
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn blank_stored_private_key_generates_replacement() {
        let f = fixture();
        f.state.keystore.add("PUB-alpha", "").unwrap();
        let msg = message(&[("alpha", "10.123.45.2/32")]);
        converge(&f.state, &f.server, &f.api, &body(&msg), false)
            .await
            .unwrap();

        // Old key dropped, replacement stored under the new public half.
        assert!(f.state.keystore.lookup("PUB-alpha").is_none());
        assert_eq!(f.state.keystore.len(), 1);
        let conf = std::fs::read_to_string(
            f.state.config.wireguard_dir.join("alpha.conf"),
        )
        .unwrap();
        assert!(!conf.contains("PrivateKey = PRIV-alpha"));
        assert!(!conf.contains("PrivateKey = \n"));
    }

    #[test]
    fn prune_removes_only_unadvertised_local_prefixes() {
        let vpn = Vpn {
            current: Settings {
                address: vec!["10.50.0.2/24".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let mut peers = vec![Vpn {
            current: Settings {
                allowed_ips: vec![
                    "10.50.0.0/24".into(),   // advertised by us: kept
                    "192.168.7.0/24".into(), // local but not ours: pruned
                    "10.99.0.0/24".into(),   // not local at all: kept
                ],
                ..Default::default()
            },
            ..Default::default()
        }];
        let subnets = vec![
            "10.50.0.0/24".parse().unwrap(),
            "192.168.7.0/24".parse().unwrap(),
        ];
        prune_allowed_ips(&vpn, &mut peers, &subnets);
        assert_eq!(
            peers[0].current.allowed_ips,
            vec!["10.50.0.0/24".to_string(), "10.99.0.0/24".to_string()]
        );
    }

    #[test]
    fn carry_preserves_client_owned_fields() {
        let mut old = Message::default();
        old.device = Some(Device {
            quiet: true,
            debug: true,
            version: "2.0.0".into(),
            instance_id: "i-abc".into(),
            ez_code: "ez".into(),
            ..Default::default()
        });
        let mut incoming = Message {
            device: Some(Device::default()),
            config: Vec::new(),
        };
        carry_client_fields(&mut incoming, &old);
        let dev = incoming.device.unwrap();
        assert!(dev.quiet);
        assert!(dev.debug);
        assert_eq!(dev.version, "2.0.0");
        assert_eq!(dev.instance_id, "i-abc");
        assert_eq!(dev.ez_code, "ez");
        assert_eq!(dev.check_interval, DEFAULT_CHECK_INTERVAL);
    }
}
