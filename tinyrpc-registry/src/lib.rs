//! # tinyrpc-registry
//!
//! Service registry for tinyrpc.
//!
//! This crate provides:
//! - An in-memory table of server addresses with last-seen eviction
//! - The registry HTTP endpoint (`GET` lists, `POST` announces)
//! - A small HTTP client for the endpoint
//! - A heartbeat task that keeps one server announced

pub mod client;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod registry;

pub use client::{parse_servers, RegistryClient};
pub use error::RegistryError;
pub use heartbeat::Heartbeat;
pub use http::serve;
pub use registry::Registry;

use std::time::Duration;

/// Default URL path of the registry endpoint.
pub const DEFAULT_PATH: &str = "/_gorpc_/registry";

/// Default time after which a silent server is evicted.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default heartbeat interval: one minute less than the eviction timeout.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Response header carrying the comma-joined list of alive servers.
pub const SERVERS_HEADER: &str = "X-Gorpc-Servers";

/// Request header carrying the announcing server's address.
pub const SERVER_HEADER: &str = "X-Gorpc-Server";
