//! Loopback control surface for the co-located GUI agent.
//!
//! Bound to 127.0.0.1 only; the GUI runs on the same host. Every response
//! carries permissive CORS headers so the agent's webview can call straight
//! in. All path inputs pass through the sanitizer before touching the
//! filesystem or a command line.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::agent::{self, api::ApiClient};
use crate::adapters::template;
use crate::keystore::KeyStore;
use crate::model::{Device, Message, Net};
use crate::registry::Server;
use crate::state::AppState;
use crate::util::sanitize;

const LISTEN_ADDR: &str = "127.0.0.1:53280";

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let mut shutdown = state.subscribe_shutdown();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(LISTEN_ADDR).await?;
    info!(addr = %LISTEN_ADDR, "local control surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stats/{net}", get(get_stats))
        .route("/keys/", get(generate_key))
        .route("/service/{net}", patch(enable_service).delete(disable_service))
        .route("/vpn/{vpn_id}", delete(remove_vpn))
        .route("/device/{device_id}", delete(remove_device))
        .route("/config/", get(configure))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

async fn cors(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert("Access-Control-Allow-Methods", HeaderValue::from_static("*"));
    response
}

// ── /stats/{net} ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct Metrics {
    #[serde(rename = "Send")]
    pub send: i64,
    #[serde(rename = "Recv")]
    pub recv: i64,
}

/// Fold `wg show <net> transfer` output (one `pubkey rx tx` line per peer)
/// into per-net totals.
pub fn make_stats(net: &str, raw: &str) -> HashMap<String, Metrics> {
    let mut stats: HashMap<String, Metrics> = HashMap::new();
    for line in raw.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            break;
        }
        let recv = parts[1].parse::<i64>().unwrap_or(0);
        let send = parts[2].parse::<i64>().unwrap_or(0);
        let entry = stats.entry(net.to_string()).or_default();
        entry.send += send;
        entry.recv += recv;
    }
    stats
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(net): Path<String>,
) -> Response {
    let net = sanitize(&net);
    match state.tunnels.stats(&net).await {
        Ok(raw) => Json(make_stats(&net, &raw)).into_response(),
        Err(e) => {
            warn!(net = %net, error = %e, "stats unavailable");
            (StatusCode::NOT_FOUND, "").into_response()
        }
    }
}

// ── /keys/ ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct KeyResponse {
    #[serde(rename = "Public")]
    public: String,
}

/// Generate and store a keypair, returning only the public half so the GUI
/// can create a VPN without ever seeing the private key.
async fn generate_key(State(state): State<Arc<AppState>>) -> Json<KeyResponse> {
    let (public, private) = KeyStore::generate();
    if let Err(e) = state.keystore.add(&public, &private) {
        error!(error = %e, "failed to persist key store");
    }
    Json(KeyResponse { public })
}

// ── /service/{net} ──────────────────────────────────────────────────────────

/// Whether any peer of the net announces a default route. Starting such a
/// tunnel while others run would fight over the route table, so every other
/// tunnel is stopped first.
pub fn has_default_route(net: &Net, our_idx: usize) -> bool {
    net.vpns.iter().enumerate().any(|(i, vpn)| {
        i != our_idx
            && vpn
                .current
                .allowed_ips
                .iter()
                .any(|cidr| cidr == "0.0.0.0/0" || cidr == "::/0")
    })
}

fn find_net(state: &AppState, net_name: &str) -> Option<(Arc<Server>, Net, usize)> {
    for server in state.registry.servers() {
        let config = server.config();
        let device_id = server.device_id();
        if let Some(net) = config.config.iter().find(|n| n.net_name == net_name) {
            if let Some(idx) = net.vpn_index_for(&device_id) {
                return Some((server, net.clone(), idx));
            }
        }
    }
    None
}

fn set_vpn_enable(server: &Server, net_name: &str, vpn_id: &str, enable: bool) {
    server.update_config(|msg| {
        if let Some(net) = msg.config.iter_mut().find(|n| n.net_name == net_name) {
            if let Some(vpn) = net.vpns.iter_mut().find(|v| v.id == vpn_id) {
                vpn.enable = enable;
            }
        }
    });
}

async fn enable_service(
    State(state): State<Arc<AppState>>,
    Path(net): Path<String>,
) -> Response {
    let net_name = sanitize(&net);
    let Some((server, net, idx)) = find_net(&state, &net_name) else {
        return (StatusCode::NOT_FOUND, "").into_response();
    };
    info!(net = %net_name, "enabling service");

    let mut peers = net.vpns.clone();
    let mut vpn = peers.remove(idx);
    vpn.enable = true;
    vpn.failover = crate::model::NOFAILOVER;

    set_vpn_enable(&server, &net.net_name, &vpn.id, true);
    if let Err(e) = state.registry.save(&server) {
        error!(server = %server.name, error = %e, "failed to persist server file");
    }
    let api = ApiClient::for_server(&state.config, &server);
    if let Err(e) = api.update_vpn(&vpn).await {
        warn!(vpn = %vpn.name, error = %e, "failed to update VPN upstream");
    }

    // A default-route tunnel owns the host's egress; everything else must
    // be down before it comes up.
    if has_default_route(&net, idx) {
        info!(net = %net_name, "peers announce a default route, stopping other tunnels");
        let mut stops = Vec::new();
        for other in state.registry.servers() {
            for other_net in other.config().config {
                if other_net.net_name == net.net_name {
                    continue;
                }
                let name = sanitize(&other_net.net_name);
                let tunnels = Arc::clone(&state.tunnels);
                stops.push(tokio::spawn(async move {
                    let _ = tunnels.stop(&name).await;
                }));
            }
        }
        for stop in stops {
            let _ = stop.await;
        }
    }

    if let Some(private) = state.keystore.lookup(&vpn.current.public_key) {
        if !private.is_empty() {
            vpn.current.private_key = private;
        }
    }
    let text = template::render(&vpn, &peers);
    let conf_path = state
        .config
        .wireguard_dir
        .join(format!("{net_name}.conf"));
    if let Err(e) = crate::agent::converge::write_config(&conf_path, text.as_bytes()) {
        error!(path = %conf_path.display(), error = %e, "failed to write config");
    }
    if let Err(e) = state.tunnels.start(&net_name).await {
        error!(net = %net_name, error = %e, "failed to start tunnel");
        return (StatusCode::INTERNAL_SERVER_ERROR, "").into_response();
    }
    state
        .notify
        .info(&format!("Network {} is running", net.net_name));
    (StatusCode::OK, "").into_response()
}

async fn disable_service(
    State(state): State<Arc<AppState>>,
    Path(net): Path<String>,
) -> Response {
    let net_name = sanitize(&net);
    let Some((server, net, idx)) = find_net(&state, &net_name) else {
        return (StatusCode::NOT_FOUND, "").into_response();
    };
    info!(net = %net_name, "disabling service");

    let mut vpn = net.vpns[idx].clone();
    vpn.enable = false;

    set_vpn_enable(&server, &net.net_name, &vpn.id, false);
    if let Err(e) = state.registry.save(&server) {
        error!(server = %server.name, error = %e, "failed to persist server file");
    }
    let api = ApiClient::for_server(&state.config, &server);
    if let Err(e) = api.update_vpn(&vpn).await {
        warn!(vpn = %vpn.name, error = %e, "failed to update VPN upstream");
    }

    if let Err(e) = state.tunnels.stop(&net_name).await {
        warn!(net = %net_name, error = %e, "failed to stop tunnel");
    }
    if vpn.current.enable_dns {
        state.dns.clear().await;
    }
    state
        .notify
        .info(&format!("Network {} has been stopped", net.net_name));
    (StatusCode::OK, "").into_response()
}

// ── /vpn/{vpnId} ────────────────────────────────────────────────────────────

async fn remove_vpn(
    State(state): State<Arc<AppState>>,
    Path(vpn_id): Path<String>,
) -> Response {
    let vpn_id = sanitize(&vpn_id);
    for server in state.registry.servers() {
        let owns = server
            .config()
            .config
            .iter()
            .any(|n| n.vpns.iter().any(|v| v.id == vpn_id));
        if owns {
            info!(vpn = %vpn_id, server = %server.name, "deleting VPN");
            let api = ApiClient::for_server(&state.config, &server);
            return match api.delete_vpn(&vpn_id).await {
                Ok(()) => (StatusCode::OK, "").into_response(),
                Err(e) => {
                    error!(vpn = %vpn_id, error = %e, "delete failed");
                    (StatusCode::BAD_GATEWAY, "").into_response()
                }
            };
        }
    }
    (StatusCode::NOT_FOUND, "").into_response()
}

// ── /device/{deviceId} ──────────────────────────────────────────────────────

async fn remove_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Response {
    let device_id = sanitize(&device_id);
    for server in state.registry.servers() {
        if server.device_id() != device_id {
            continue;
        }
        info!(device = %device_id, server = %server.name, "deleting device");
        let api = ApiClient::for_server(&state.config, &server);
        for net in server.config().config {
            for vpn in &net.vpns {
                if vpn.device_id == device_id {
                    if let Err(e) = api.delete_vpn(&vpn.id).await {
                        warn!(vpn = %vpn.id, error = %e, "failed to delete VPN upstream");
                    }
                }
            }
        }
        state.registry.remove(&server);
        state
            .notify
            .info(&format!("Device removed from {}", server.name));
        return (StatusCode::OK, "").into_response();
    }
    (StatusCode::NOT_FOUND, "").into_response()
}

// ── /config/ ────────────────────────────────────────────────────────────────

/// Device bootstrap from query parameters. Creates a new Server (and its
/// reconciler) or updates an existing one matching the URL.
async fn configure(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let server_url = params.get("server").cloned().unwrap_or_default();
    let device_id = params.get("id").cloned().unwrap_or_default();
    let api_key = params.get("apiKey").cloned().unwrap_or_default();
    if server_url.is_empty() || device_id.is_empty() || api_key.is_empty() {
        warn!("invalid config parameters");
        return (StatusCode::BAD_REQUEST, "").into_response();
    }

    let apply = |device: &mut Device| {
        device.server = server_url.clone();
        device.id = device_id.clone();
        device.api_key = api_key.clone();
        if let Some(v) = params.get("name").filter(|v| !v.is_empty()) {
            device.name = v.clone();
        }
        if let Some(v) = params.get("accountid").filter(|v| !v.is_empty()) {
            device.account_id = v.clone();
        }
        if let Some(v) = params.get("ezcode").filter(|v| !v.is_empty()) {
            device.ez_code = v.clone();
        }
        if let Some(v) = params.get("instanceid").filter(|v| !v.is_empty()) {
            device.instance_id = v.clone();
        }
        if let Some(v) = params.get("os").filter(|v| !v.is_empty()) {
            device.os = v.clone();
        }
        if let Some(v) = params.get("arch").filter(|v| !v.is_empty()) {
            device.arch = v.clone();
        }
        if let Some(interval) = params.get("checkInterval").and_then(|v| v.parse().ok()) {
            if interval >= 1 {
                device.check_interval = interval;
            }
        }
    };

    let target_path = state.registry.server_path(&server_url);
    if let Some(server) = state.registry.get(&target_path) {
        info!(server = %server.name, "updating existing server from bootstrap");
        server.update_config(|msg| {
            let device = msg.device.get_or_insert_with(Device::default);
            apply(device);
        });
        if let Err(e) = state.registry.save(&server) {
            error!(server = %server.name, error = %e, "failed to persist server file");
        }
        let device = server.config().device.unwrap_or_default();
        let api = ApiClient::for_server(&state.config, &server);
        if let Err(e) = api.update_device(&device).await {
            warn!(error = %e, "failed to update device upstream");
        }
        return Json(device).into_response();
    }

    let mut device = Device {
        enable: true,
        check_interval: state.config.check_interval,
        platform: crate::config::Config::platform().into(),
        os: std::env::consts::OS.into(),
        arch: std::env::consts::ARCH.into(),
        version: env!("CARGO_PKG_VERSION").into(),
        update_keys: state.config.update_keys,
        quiet: state.config.quiet,
        debug: state.config.debug,
        ..Default::default()
    };
    apply(&mut device);

    info!(server = %server_url, device = %device.id, "bootstrapping new server");
    let message = Message {
        device: Some(device.clone()),
        config: Vec::new(),
    };
    let server = state.registry.create(&server_url, message);
    if let Err(e) = state.registry.save(&server) {
        error!(server = %server.name, error = %e, "failed to persist server file");
    }
    agent::spawn_worker(Arc::clone(&state), server);

    Json(device).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Settings, Vpn};

    #[test]
    fn make_stats_sums_peer_lines() {
        let raw = "pub1 1024 2048\npub2 512 256\n";
        let stats = make_stats("alpha", raw);
        assert_eq!(stats["alpha"].recv, 1536);
        assert_eq!(stats["alpha"].send, 2304);
    }

    #[test]
    fn make_stats_stops_at_short_line() {
        let raw = "pub1 100 200\n(none)\npub2 300 400\n";
        let stats = make_stats("alpha", raw);
        assert_eq!(stats["alpha"].recv, 100);
        assert_eq!(stats["alpha"].send, 200);
    }

    #[test]
    fn make_stats_empty_output() {
        assert!(make_stats("alpha", "").is_empty());
    }

    fn net_with_allowed(ours: &str, peer_allowed: &[&str]) -> Net {
        Net {
            net_name: "eu".into(),
            vpns: vec![
                Vpn {
                    device_id: ours.into(),
                    ..Default::default()
                },
                Vpn {
                    device_id: "peer".into(),
                    current: Settings {
                        allowed_ips: peer_allowed.iter().map(|s| s.to_string()).collect(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn default_route_detected_for_v4_and_v6() {
        assert!(has_default_route(
            &net_with_allowed("d1", &["0.0.0.0/0"]),
            0
        ));
        assert!(has_default_route(&net_with_allowed("d1", &["::/0"]), 0));
        assert!(!has_default_route(
            &net_with_allowed("d1", &["10.0.0.0/8"]),
            0
        ));
    }

    #[test]
    fn our_own_default_route_does_not_count() {
        let mut net = net_with_allowed("d1", &["10.0.0.0/8"]);
        net.vpns[0].current.allowed_ips = vec!["0.0.0.0/0".into()];
        assert!(!has_default_route(&net, 0));
    }
}
