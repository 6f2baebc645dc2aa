//! # tinyrpc-server
//!
//! TCP server for tinyrpc.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Connection option handshake and codec selection
//! - Concurrent request dispatch through a [`MethodInvoker`]
//! - A typed service table
//! - Configuration loading and Prometheus metrics

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;

pub use config::{Config, ConfigError, HeartbeatConfig, MetricsConfig, NetworkConfig, RegistryConfig};
pub use error::ServerError;
pub use handler::{CallError, CallFuture, MethodHandler, MethodInvoker, RegisterError, ServiceTable};
pub use metrics::{run_metrics_server, serve_metrics, Metrics};
pub use server::{serve, Server, ServerConfig, ServerStats};

/// Default RPC listener port.
pub const DEFAULT_PORT: u16 = 9527;
