//! graphwire - graph database wire protocol server
//!
//! Serves the versioned chunked binary protocol over TCP, backed by the
//! bundled literal query engine.

use graphwire_server::metrics::{run_metrics_server, Metrics};
use graphwire_server::{tls, Config, LiteralEngine, Server, ServerConfig, TokenAuthenticator};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if GRAPHWIRE_CONFIG is set, then env overrides)
    let config_path = std::env::var("GRAPHWIRE_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting graphwire server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Protocol versions: {:?}",
        config.protocol.enabled_versions
    );
    tracing::info!("  Server agent: {}", config.protocol.server_agent);

    if config.auth.required {
        if config.auth.credential_hashes.is_empty() {
            tracing::error!("auth.required=true but no credentials configured!");
            return Err("Authentication required but no credentials configured".into());
        }
        tracing::info!(
            "  Authentication: enabled ({} credential(s))",
            config.auth.credential_hashes.len()
        );
    } else {
        tracing::info!("  Authentication: disabled");
    }

    let mut server_config = ServerConfig::from_config(&config)?;

    if config.tls.enabled {
        let acceptor = tls::create_tls_acceptor(&config.tls)?;
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
        server_config = server_config.with_tls(acceptor);
    } else {
        tracing::info!("  TLS: disabled");
    }

    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let engine = Arc::new(LiteralEngine::new());
    let authenticator = Arc::new(TokenAuthenticator::from_config(&config.auth));
    let server = Arc::new(Server::with_auth(server_config, engine, authenticator));

    let shutdown_server = server.clone();
    let shutdown_metrics = metrics_shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        let _ = shutdown_metrics.send(());
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
