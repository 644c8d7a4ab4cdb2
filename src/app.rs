//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};

use crate::adapters::notify::Notifier;
use crate::adapters::wg::WgQuick;
use crate::adapters::TunnelBackend;
use crate::agent;
use crate::conference;
use crate::config::Config;
use crate::control;
use crate::dns::DnsState;
use crate::keystore::KeyStore;
use crate::migrate;
use crate::model::{Device, Message};
use crate::registry::ServerRegistry;
use crate::state::AppState;

/// Run the agent until SIGINT/SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "nettica-client starting"
    );

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!(error = %e, "could not create data directory");
    }
    migrate::run(&config.data_dir);

    let keystore = KeyStore::new(&config.data_dir);
    if let Err(e) = keystore.load() {
        warn!(error = %e, "could not load key store");
    }
    let registry = ServerRegistry::new(&config.data_dir);
    if let Err(e) = registry.load() {
        warn!(error = %e, "could not scan data directory");
    }

    let notify = Notifier::new();
    let dns = Arc::new(DnsState::new(notify.clone(), config.quiet));
    let tunnels: Arc<dyn TunnelBackend> = Arc::new(WgQuick::new(&config.wireguard_dir));
    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        registry,
        keystore,
        dns,
        tunnels,
        notify,
    ));

    if state.registry.is_empty() {
        bootstrap_from_env(&state)?;
    }

    for server in state.registry.servers() {
        agent::spawn_worker(Arc::clone(&state), server);
    }

    // Seed the resolver from persisted state so names answer before the
    // first poll completes.
    let messages: Vec<Message> = state
        .registry
        .servers()
        .iter()
        .map(|s| s.config())
        .collect();
    state.dns.rebuild(&messages).await;

    let control_state = Arc::clone(&state);
    let control_task = tokio::spawn(async move {
        if let Err(e) = control::serve(control_state).await {
            error!(error = %e, "control surface failed");
        }
    });
    let conference_shutdown = state.subscribe_shutdown();
    let conference_task = tokio::spawn(async move {
        if let Err(e) = conference::serve(conference_shutdown).await {
            error!(error = %e, "conference hub failed");
        }
    });
    tokio::spawn(agent::background_refresh(Arc::clone(&state)));

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    state.signal_shutdown();
    state.dns.clear().await;
    let _ = control_task.await;
    let _ = conference_task.await;

    info!("nettica-client stopped");
    Ok(())
}

/// When nothing is persisted, a Server can be synthesized from the
/// NETTICA_* environment. Incomplete credentials are a hard configuration
/// error; no credentials at all just means the local GUI will bootstrap us
/// through `/config/` later.
fn bootstrap_from_env(state: &Arc<AppState>) -> anyhow::Result<()> {
    let config = &state.config;
    let device_id = config.device_id.clone().unwrap_or_default();
    let api_key = config.api_key.clone().unwrap_or_default();

    if device_id.is_empty() && api_key.is_empty() {
        info!("no servers configured, waiting for bootstrap via /config/");
        return Ok(());
    }
    if device_id.is_empty() || api_key.is_empty() {
        anyhow::bail!("NETTICA_DEVICE_ID and NETTICA_API_KEY must both be set");
    }
    let server_url = config
        .server
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "https://my.nettica.com".to_string());

    info!(server = %server_url, device = %device_id, "bootstrapping from environment");

    let device = Device {
        id: device_id,
        api_key,
        server: server_url.clone(),
        enable: true,
        check_interval: config.check_interval,
        quiet: config.quiet,
        debug: config.debug,
        update_keys: config.update_keys,
        service_group: config.service_group.clone().unwrap_or_default(),
        service_api_key: config.service_api_key.clone().unwrap_or_default(),
        instance_id: config.instance_id.clone().unwrap_or_default(),
        ez_code: config.ez_code.clone().unwrap_or_default(),
        source_address: config.source.clone().unwrap_or_default(),
        platform: Config::platform().into(),
        os: std::env::consts::OS.into(),
        arch: std::env::consts::ARCH.into(),
        version: env!("CARGO_PKG_VERSION").into(),
        ..Default::default()
    };
    let message = Message {
        device: Some(device),
        config: Vec::new(),
    };
    let server = state.registry.create(&server_url, message);
    if let Err(e) = state.registry.save(&server) {
        error!(error = %e, "failed to persist bootstrapped server");
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let default_filter = if config.debug {
        "debug"
    } else if config.quiet {
        "warn"
    } else {
        config.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // The presence of the log file is the opt-in switch for file logging.
    let log_path = config.data_dir.join("nettica.log");
    match std::fs::OpenOptions::new().append(true).open(&log_path) {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
