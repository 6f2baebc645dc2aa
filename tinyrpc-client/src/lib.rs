//! # tinyrpc-client
//!
//! Client library for tinyrpc.
//!
//! This crate provides:
//! - A pipelined single-connection client
//! - Server discovery from a static list or a registry
//! - Random and round-robin server selection
//! - A load-balanced client with broadcast calls

pub mod client;
pub mod discovery;
pub mod error;
pub mod xclient;

pub use client::{parse_rpc_addr, Client, ClientConfig};
pub use discovery::{Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode};
pub use error::{ClientError, DiscoveryError};
pub use xclient::XClient;
