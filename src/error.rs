//! Error types for the lease server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Startup validation failures are
//! grouped separately in [`ConfigError`] so callers can match on the cause.

use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Errors that can occur during lease server operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error (peer records and interface files).
    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Invalid startup configuration.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Malformed query received.
    ///
    /// The datagram is too short, a label overruns the buffer, the name has
    /// no terminating label, or the message is not a query at all.
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// The address pool is exhausted.
    ///
    /// Every address in the network is either excluded or leased. Leases
    /// are permanent, so the only remedy is a larger network.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// A lease record could not be written to stable storage.
    ///
    /// The lease is not granted and the in-memory table is unchanged.
    #[error("Failed to persist lease for {hostname}: {source}")]
    Persistence {
        hostname: String,
        #[source]
        source: std::io::Error,
    },

    /// Hostname cannot be used as a lease key (empty, or not usable as a record file name).
    #[error("Invalid hostname: {0:?}")]
    InvalidHostname(String),

    /// A lease already exists for this hostname.
    #[error("Hostname {0} already has a lease")]
    LeaseExists(String),

    /// Address is already leased or excluded from the pool.
    #[error("Address {0} is not available")]
    AddressInUse(Ipv4Addr),

    /// An update named a different address than the one leased.
    ///
    /// Addresses are immutable once granted.
    #[error("Lease for {hostname} holds {leased}, not {requested}")]
    AddressMismatch {
        hostname: String,
        leased: Ipv4Addr,
        requested: Ipv4Addr,
    },

    /// No lease exists for the specified hostname.
    #[error("Hostname {0} not found in leases")]
    LeaseNotFound(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 53 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),

    /// The lease server did not answer in time (client side).
    #[error("Timed out waiting for a response")]
    Timeout,

    /// The lease server answered without an address (client side).
    #[error("No address returned for {hostname} (rcode {rcode})")]
    NoAddress { hostname: String, rcode: u16 },
}

/// Startup configuration errors.
///
/// Returned by [`Config::validate`](crate::Config::validate). Any of these
/// stops the process before the receive loop starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `network` is not an IPv4 CIDR block.
    #[error("invalid network CIDR {0:?}")]
    InvalidCidr(String),

    /// `listen_host` is not an IP address.
    #[error("invalid listen host {0:?}")]
    InvalidListenHost(String),

    /// `listen_port` is zero.
    #[error("listen port must be non-zero")]
    InvalidPort,

    /// An `excluded` entry lies outside `network`.
    #[error("excluded address {address} is outside network {network}")]
    ExcludedOutsideNetwork { address: Ipv4Addr, network: String },

    /// `peers_dir` exists but cannot be listed.
    #[error("peer directory {path} is unreadable: {source}")]
    UnreadableDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A specialized Result type for lease server operations.
pub type Result<T> = std::result::Result<T, Error>;
