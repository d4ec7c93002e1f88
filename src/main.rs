#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # connector
//!
//! Reverse-tunnel agent that exposes a cluster's Kubernetes API server to a
//! remote relay without any inbound connectivity.
//!
//! The connector dials out to the relay over mutual TLS and keeps a small set
//! of channels open. The relay writes HTTP requests onto request channels;
//! each one is replayed against the API server and its response is streamed
//! back on a fresh session channel. `kubectl exec`, `attach` and
//! `port-forward` keep their session channel open as a frame pipe.
//!
//! ## Channels
//!
//! | Kind | Byte | Lifetime   | Carries                                   |
//! |------|------|------------|-------------------------------------------|
//! | request | `0` | per cycle  | inbound requests, outbound heartbeats   |
//! | session | `1` | per request | one response, then upgraded frames     |
//! | meta    | `2` | per cycle  | metadata JSON out, `ack` back           |
//!
//! A liveness endpoint answers `GET /healthz` on `0.0.0.0:10254`.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, CLI, wiring, graceful shutdown
//! config.rs        TOML + env-var configuration
//! tls.rs           relay client TLS (mTLS, optional CA)
//! healthz.rs       GET /healthz
//! identity.rs      cluster identity from the service-account token
//! cluster.rs       provider detection, customize command, kube config
//! error.rs         shared error type
//! tunnel/
//!   agent.rs       one connection cycle and its sibling tasks
//!   client.rs      reconnect loop with flap detection
//!   connector.rs   dial + handshake
//!   kube_proxy.rs  per-request API server connections
//!   heartbeat.rs   health byte stream and API server probe
//!   meta.rs        metadata upload
//!   wire.rs, frame.rs, pipe.rs HTTP/1.1 and frame plumbing
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cluster_connector::cluster::{self, KubeMetaSource};
use cluster_connector::config::{log_filter_for_level, Config};
use cluster_connector::error::{Error, Result};
use cluster_connector::identity::ClusterId;
use cluster_connector::tunnel::connector::StubConnector;
use cluster_connector::tunnel::dial::TlsDialer;
use cluster_connector::tunnel::heartbeat::NodeListProbe;
use cluster_connector::tunnel::kube_proxy::KubernetesClientManager;
use cluster_connector::tunnel::{self, agent::Agent};
use cluster_connector::{healthz, tls};

/// Reverse-tunnel agent for a private Kubernetes API server.
#[derive(Parser)]
#[command(name = "connector", version)]
struct Cli {
    /// Path to config file (default: connector.toml in CWD).
    #[arg(long)]
    config: Option<String>,

    /// Kubeconfig to use instead of in-cluster credentials.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Log level: -1 trace, 0 debug, 1 info, 2 warn, 3 error.
    #[arg(long, allow_negative_numbers = true)]
    log_level: Option<i32>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("connector: {e}");
            std::process::exit(1);
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = log_filter_for_level(level).to_string();
    }
    if cli.kubeconfig.is_some() {
        config.cluster.kubeconfig = cli.kubeconfig;
    }

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("connector v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!(error = %e, "connector exiting");
        std::process::exit(1);
    }
    info!("connector stopped");
}

async fn run(config: Config) -> Result<()> {
    tls::install_crypto_provider();
    config.validate()?;

    let (cert, key) = (config.cert_path(), config.key_path());
    for path in [&cert, &key] {
        if !path.exists() {
            return Err(Error::Config(format!("{} does not exist", path.display())));
        }
    }
    let relay_tls = tls::relay_client_config(&cert, &key, Some(&config.ca_path()))?;
    let cluster_id = ClusterId::load(&config.cluster.token_path).map_err(|e| {
        Error::Config(format!(
            "cannot read service account token {}: {e}",
            config.cluster.token_path.display()
        ))
    })?;
    info!(
        cluster = %config.cluster.id,
        relay = %config.relay.addr,
        tunnels = config.relay.tunnels_per_agent,
        "configuration loaded"
    );

    let kube_config = cluster::load_kube_config(config.cluster.kubeconfig.as_deref()).await?;
    let upstream =
        KubernetesClientManager::from_kube_config(&kube_config, config.cluster.api_server.as_deref())?;
    let kube_client = kube::Client::try_from(kube_config)?;

    let relay = TlsDialer::new(config.relay.addr.clone(), Arc::new(relay_tls))?
        .with_timeout(config.dial_timeout());
    let connector = StubConnector::new(Arc::new(relay), cluster_id).with_backoff(config.dial_backoff());
    let probe = Arc::new(NodeListProbe::new(
        kube_client.clone(),
        config.cluster.probe_label_selector.clone(),
    ));
    let meta_source = Arc::new(KubeMetaSource::new(
        kube_client,
        cluster::agent_namespace().await,
        config.cluster.intranet.clone(),
    ));
    let agent = Agent::new(connector, upstream, probe, meta_source, config.agent_options());

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    match TcpListener::bind(&config.healthz.listen).await {
        Ok(listener) => {
            info!(listen = %config.healthz.listen, "healthz listening");
            let stop = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = healthz::serve(listener, stop).await {
                    warn!(error = %e, "healthz server stopped");
                }
            });
        }
        Err(e) => warn!(listen = %config.healthz.listen, error = %e, "cannot bind healthz"),
    }

    tunnel::client::run(&agent, config.flap_window(), &shutdown).await
}

/// Graceful shutdown on SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot register SIGTERM handler");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
    shutdown.cancel();
}
