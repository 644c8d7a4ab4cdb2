//! Per-server reconciliation.
//!
//! One worker task per registered server: tick at the device's check
//! interval, fetch the authoritative Message with conditional-request
//! caching, feed the converger, and count failures into the process-wide
//! FailSafe latch. A separate hourly task re-runs convergence from cached
//! state to keep UPnP leases alive and recover from laptop sleeps.

pub mod api;
pub mod converge;
pub mod validate;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::Server;
use crate::state::AppState;

use api::{ApiClient, ApiError, FetchOutcome};

/// Interval for the background refresh pass.
const BACKGROUND_REFRESH: Duration = Duration::from_secs(3600);

/// Spawn the reconciler for one server. The task runs until the server is
/// removed or the process shuts down.
pub fn spawn_worker(state: Arc<AppState>, server: Arc<Server>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(state, server).await;
    })
}

async fn run(state: Arc<AppState>, server: Arc<Server>) {
    info!(server = %server.name, "reconciler started");
    let mut shutdown = server.subscribe_shutdown();
    let mut global_shutdown = state.subscribe_shutdown();
    let mut api = ApiClient::for_server(&state.config, &server);
    let mut etag = String::new();
    let mut last_ip: Option<IpAddr> = None;

    loop {
        if server.is_shutdown() {
            break;
        }

        // The local outbound address changing (new Wi-Fi, VPN up/down,
        // DHCP renewal) invalidates cached comparisons: force a pass.
        if let Some(ip) = crate::util::outbound_ip() {
            if let Some(previous) = last_ip {
                if previous != ip {
                    info!(server = %server.name, old = %previous, new = %ip, "outbound address changed");
                    state.failsafe.set_bounce();
                }
            }
            last_ip = Some(ip);
        }

        match api.fetch_status(&etag).await {
            Ok(outcome) => {
                if state.failsafe.record_success() {
                    state.notify.info("FailSafe: connectivity restored");
                }
                let body = match outcome {
                    FetchOutcome::Updated { body, etag: new_etag } => {
                        etag = new_etag;
                        body
                    }
                    FetchOutcome::NotModified => server.body(),
                };
                if let Err(e) = converge::converge(&state, &server, &api, &body, false).await {
                    error!(server = %server.name, error = %e, "converge failed");
                }
            }
            Err(ApiError::Unauthorized) => {
                // Credentials may have been rotated by the agent or edited
                // by hand; pick them up and retry next tick.
                warn!(server = %server.name, "unauthorized, reloading credentials");
                if let Err(e) = state.registry.reload(&server) {
                    error!(server = %server.name, error = %e, "credential reload failed");
                }
                api = ApiClient::for_server(&state.config, &server);
                etag.clear();
            }
            Err(ApiError::NotFound) => {
                // The server authoritatively un-rooted this device.
                info!(server = %server.name, "device not found on server, removing");
                state
                    .notify
                    .info(&format!("Device not found, removing {}", server.name));
                state.registry.remove(&server);
                break;
            }
            Err(e) => {
                warn!(server = %server.name, error = %e, "poll failed");
                if state.failsafe.record_failure() {
                    info!(server = %server.name, "FailSafe engaged, converging from cached state");
                    let body = server.body();
                    if !body.is_empty() {
                        if let Err(e) = converge::converge(&state, &server, &api, &body, false).await
                        {
                            error!(server = %server.name, error = %e, "failsafe converge failed");
                        }
                    }
                }
            }
        }

        let interval = server
            .config()
            .device
            .map(|d| d.check_interval.max(1))
            .unwrap_or(10) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            _ = shutdown.changed() => {
                debug!(server = %server.name, "reconciler stopping");
                break;
            }
            _ = global_shutdown.changed() => {
                debug!(server = %server.name, "reconciler stopping (process shutdown)");
                break;
            }
        }
    }
    info!(server = %server.name, "reconciler exited");
}

/// Hourly re-converge of every server from its cached body. Keeps UPnP
/// port mappings active and restarts tunnels that died while we slept.
pub async fn background_refresh(state: Arc<AppState>) {
    let mut shutdown = state.subscribe_shutdown();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(BACKGROUND_REFRESH) => {}
            _ = shutdown.changed() => return,
        }
        for server in state.registry.servers() {
            let body = server.body();
            if body.is_empty() {
                continue;
            }
            let api = ApiClient::for_server(&state.config, &server);
            if let Err(e) = converge::converge(&state, &server, &api, &body, true).await {
                error!(server = %server.name, error = %e, "background refresh failed");
            }
        }
    }
}
