//! # peerlease
//!
//! Hands out stable VPN mesh addresses to peers by hostname. Peers ask with
//! an ordinary DNS `A` query; the first query for a hostname leases the
//! lowest free address in the pool, and every later query (across restarts)
//! returns the same address.
//!
//! ## Features
//!
//! - Permanent hostname-to-address leases, one TOML peer record per host
//! - Ascending, gap-filling allocation with excluded addresses
//! - Atomic record writes; a lease is only answered once it is on disk
//! - Companion client that writes the address into a systemd-networkd file
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use peerlease::{Config, LeaseServer};
//!
//! #[tokio::main]
//! async fn main() -> peerlease::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = LeaseServer::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Listen address, network, exclusions and peer directory
//! - [`LeaseServer`] - UDP receive loop answering `A` queries
//! - [`Leases`] - Lease table with per-hostname peer records
//! - [`AddressPool`] - Ascending allocator over the configured network
//! - [`Query`] - Query decoding and reply encoding

pub mod client;
pub mod config;
pub mod error;
pub mod lease;
pub mod pool;
pub mod query;
pub mod record;
pub mod server;

pub use config::Config;
pub use error::{ConfigError, Error, Result};
pub use lease::{Lease, Leases};
pub use pool::AddressPool;
pub use query::{Answer, Query};
pub use server::LeaseServer;
