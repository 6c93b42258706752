mod cli;
mod client;
mod config;
mod hub;
mod router;
mod server;
mod store;

#[cfg(test)]
mod integration_tests;

use std::path::PathBuf;

use castmate_rpc::arg;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Command, StateRef};
use crate::client::{BridgeClient, overlay_url};
use crate::config::BridgeConfig;
use crate::hub::HostHub;
use crate::store::HostState;

#[tokio::main]
async fn main() {
    // Initialize tracing with RUST_LOG support
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = cli::Cli::parse();

    match cli.command {
        Command::Serve { port, config } => serve(port, config).await,
        Command::Connect {
            url,
            overlay,
            acquire,
            config,
        } => connect(url, overlay, acquire, config).await,
    }
}

fn load_config(path: Option<PathBuf>) -> BridgeConfig {
    match BridgeConfig::load_or_default(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn serve(port: Option<u16>, config: Option<PathBuf>) {
    let mut config = load_config(config);
    if let Some(port) = port {
        config.port = port;
    }

    info!(
        port = config.port,
        prefix = %config.method_prefix,
        "castmate bridge starting"
    );

    let hub = match HostHub::new(HostState::new(), config.methods(), config.call_policy()) {
        Ok(hub) => hub,
        Err(e) => {
            error!("Failed to set up host: {}", e);
            std::process::exit(1);
        }
    };

    // Lets widgets read any host state without subscribing to it
    let state = hub.state().clone();
    let registered = hub.handle_widget_rpc("getState", move |_overlay, _from, args| {
        let state = state.clone();
        async move {
            let namespace: String = arg(&args, 0)?;
            let key: String = arg(&args, 1)?;
            Ok(state.get(&namespace, &key))
        }
    });
    if let Err(e) = registered {
        error!("Failed to set up host: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = server::run_server(config.port, hub).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn connect(url: String, overlay: String, acquire: Vec<StateRef>, config: Option<PathBuf>) {
    let config = load_config(config);
    let client = match BridgeClient::new(config.methods(), config.call_policy()) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to set up client: {}", e);
            std::process::exit(1);
        }
    };

    for state in &acquire {
        client.state().acquire_state(&state.namespace, &state.key);
    }

    let mut changes = client.state().subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => info!(
                    namespace = %change.namespace,
                    key = %change.key,
                    value = ?change.value,
                    "state changed"
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("missed {} state changes", n);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let mut overlay_config = client.widgets().config();
    tokio::spawn(async move {
        while overlay_config.changed().await.is_ok() {
            let config = overlay_config.borrow_and_update().clone();
            info!(config = %config, "overlay config received");
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let url = overlay_url(&url, &overlay);
    info!(url = %url, overlay = %overlay, "castmate client starting");
    client.run(&url, config.reconnect_delay(), cancel).await;
}
