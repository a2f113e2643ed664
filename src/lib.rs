//! data-mesher: a gossiped, signed hostname directory.
//!
//! Each node publishes signed `hostname -> address` records under a shared
//! namespace, exchanges its full directory with its peers on a fixed
//! interval and keeps, per hostname, the newest validly signed record.

pub mod config;
pub mod dns_server;
pub mod error;
pub mod export;
pub mod identity;
pub mod node;
pub mod peers;
pub mod server;
pub mod store;
pub mod sync;
pub mod types;
