//! tinyrpc - RPC server with an optional embedded registry.
//!
//! Serves a demo `Arith` service, optionally hosts the registry endpoint,
//! and keeps itself announced to a registry when one is configured.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tinyrpc_registry::{Heartbeat, Registry};
use tinyrpc_server::{run_metrics_server, Config, Metrics, Server, ServerConfig, ServiceTable};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct Args {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize)]
struct Quotient {
    quo: i64,
    rem: i64,
}

fn arith_service() -> Result<ServiceTable, tinyrpc_server::RegisterError> {
    let mut services = ServiceTable::new();
    services.register("Arith.Sum", |args: Args| async move {
        args.a
            .checked_add(args.b)
            .ok_or_else(|| "overflow".to_string())
    })?;
    services.register("Arith.Mul", |args: Args| async move {
        args.a
            .checked_mul(args.b)
            .ok_or_else(|| "overflow".to_string())
    })?;
    services.register("Arith.Divide", |args: Args| async move {
        if args.b == 0 {
            return Err("divide by zero".to_string());
        }
        Ok(Quotient {
            quo: args.a / args.b,
            rem: args.a % args.b,
        })
    })?;
    Ok(services)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if TINYRPC_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("TINYRPC_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("TINYRPC_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid environment configuration ({}), using defaults", e);
            Config::default()
        }
    };

    tracing::info!("Starting tinyrpc server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    if config.network.max_inflight_requests > 0 {
        tracing::info!(
            "  Max in-flight requests per connection: {}",
            config.network.max_inflight_requests
        );
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        tokio::spawn(run_metrics_server(
            config.metrics.bind_addr,
            metrics.clone(),
            shutdown_tx.subscribe(),
        ));
        tracing::info!("  Metrics: enabled");
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    if config.registry.enabled {
        let listener = TcpListener::bind(config.registry.bind_addr).await?;
        let registry = Arc::new(Registry::new(config.registry.timeout()));
        let path = config.registry.path.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = tinyrpc_registry::serve(listener, registry, path, shutdown).await {
                tracing::error!("Registry stopped: {}", e);
            }
        });
        tracing::info!("  Registry: enabled");
    }

    let mut server_config = ServerConfig::new(config.network.bind_addr)
        .with_max_inflight_requests(config.network.max_inflight_requests);
    if let Some(metrics) = metrics {
        server_config = server_config.with_metrics(metrics);
    }
    let server = Arc::new(Server::with_codecs(
        server_config,
        config.codec_registry(),
        Arc::new(arith_service()?),
    ));
    let listener = TcpListener::bind(config.network.bind_addr).await?;
    let rpc_addr = format!("tcp@{}", listener.local_addr()?);

    if let Some(ref registry_url) = config.heartbeat.registry_url {
        let heartbeat = Heartbeat::new(registry_url, rpc_addr.clone(), config.heartbeat.interval())?;
        heartbeat.spawn(shutdown_tx.subscribe());
    }

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_all = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        let _ = shutdown_all.send(());
    });

    // Run server (blocks until shutdown)
    tracing::info!("Serving {}", rpc_addr);
    server.serve(listener).await?;

    tracing::info!("Server stopped");
    Ok(())
}
