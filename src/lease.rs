//! Lease management and persistence.
//!
//! This module owns the hostname-to-address table. It handles:
//!
//! - Loading one peer record per hostname from the peers directory
//! - Lookup of existing leases (never allocates)
//! - Allocation of the next free pool address for unknown hostnames
//! - Writing each new lease to disk before it is granted
//! - Out-of-band updates of peer keys
//!
//! Leases are permanent: there is no release or expiry.
//!
//! # Thread Safety
//!
//! All operations are thread-safe. The [`Leases`] struct keeps its table
//! behind a single [`Mutex`], and [`Leases::resolve`] holds it across the
//! whole lookup, allocation and record write. Two concurrent requests for
//! the same unknown hostname therefore end up with one lease, and the set
//! of assigned addresses never includes an address whose record is not yet
//! on disk.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::AddressPool;
use crate::record::{
    PEER_SECTION, PeerFields, apply_peer_fields, hostname_from_path, parent_directory,
    parse_peer_fields, peer_fields_of, read_document, record_path, sync_directory,
    validate_hostname, write_document,
};

/// A permanent hostname-to-address assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Hostname as received in the query, case preserved.
    pub hostname: String,

    /// The address granted to this peer.
    pub address: Ipv4Addr,

    /// WireGuard public key, set out of band.
    pub public_key: Option<String>,

    /// WireGuard preshared key, set out of band.
    pub preshared_key: Option<String>,

    /// Peer endpoint, written by the companion client.
    pub endpoint: Option<String>,
}

impl Lease {
    pub fn new(hostname: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            hostname: hostname.into(),
            address,
            public_key: None,
            preshared_key: None,
            endpoint: None,
        }
    }

    fn from_fields(hostname: String, address: Ipv4Addr, fields: PeerFields) -> Self {
        Self {
            hostname,
            address,
            public_key: fields.public_key,
            preshared_key: fields.preshared_key,
            endpoint: fields.endpoint,
        }
    }

    fn peer_fields(&self) -> PeerFields {
        PeerFields {
            allowed_ips: Some(self.address.to_string()),
            public_key: self.public_key.clone(),
            preshared_key: self.preshared_key.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// A peer record that [`Leases::load`] could not turn into a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub path: PathBuf,
    pub reason: String,
}

/// Internal mutable state protected by the lease mutex.
#[derive(Debug, Default)]
struct InternalState {
    /// Leases indexed by hostname.
    leases: BTreeMap<String, Lease>,
    /// Addresses held by `leases`.
    assigned: HashSet<Ipv4Addr>,
}

impl InternalState {
    fn insert(&mut self, lease: Lease) {
        self.assigned.insert(lease.address);
        self.leases.insert(lease.hostname.clone(), lease);
    }
}

/// Thread-safe lease table backed by one record file per hostname.
///
/// # Example
///
/// ```no_run
/// use peerlease::{AddressPool, Leases};
///
/// # async fn example() -> peerlease::Result<()> {
/// let pool = AddressPool::new(
///     "10.0.0.0/24".parse().unwrap(),
///     ["10.0.0.0".parse().unwrap(), "10.0.0.255".parse().unwrap()],
/// );
/// let leases = Leases::load("peers", pool).await?;
///
/// let lease = leases.resolve("alice").await?;
/// println!("alice -> {}", lease.address);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Leases {
    state: Mutex<InternalState>,
    pool: AddressPool,
    directory: PathBuf,
    skipped: Vec<SkippedRecord>,
}

impl Leases {
    /// Loads every peer record in `directory`, creating the directory if
    /// it does not exist.
    ///
    /// Records are read in file name order. A record is skipped (logged and
    /// listed in [`skipped_records`](Self::skipped_records)) when it cannot
    /// be read or parsed, has no usable `AllowedIps`, names an excluded
    /// address, or names an address an earlier record already holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub async fn load(directory: impl AsRef<Path>, pool: AddressPool) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        if !tokio::fs::try_exists(&directory).await? {
            tokio::fs::create_dir_all(&directory).await?;
            sync_directory(parent_directory(&directory)).await?;
        }

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();

        let mut state = InternalState::default();
        let mut skipped = Vec::new();

        for path in paths {
            let Some(hostname) = hostname_from_path(&path) else {
                debug!("Ignoring non-record file {}", path.display());
                continue;
            };

            match Self::load_record(&path, hostname, &pool, &state).await {
                Ok(lease) => {
                    if !pool.contains(lease.address) {
                        debug!(
                            "Lease {} -> {} is outside network {}",
                            lease.hostname,
                            lease.address,
                            pool.network()
                        );
                    }
                    state.insert(lease);
                }
                Err(reason) => {
                    warn!("Skipping peer record {}: {}", path.display(), reason);
                    skipped.push(SkippedRecord { path, reason });
                }
            }
        }

        info!(
            "Loaded {} lease(s) from {} ({} skipped)",
            state.leases.len(),
            directory.display(),
            skipped.len()
        );

        Ok(Self {
            state: Mutex::new(state),
            pool,
            directory,
            skipped,
        })
    }

    async fn load_record(
        path: &Path,
        hostname: String,
        pool: &AddressPool,
        state: &InternalState,
    ) -> std::result::Result<Lease, String> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| format!("unreadable: {}", error))?;
        let fields =
            parse_peer_fields(&content).map_err(|error| format!("unparsable: {}", error))?;

        let address = match (&fields.allowed_ips, fields.address()) {
            (None, _) => return Err(format!("missing {}.AllowedIps", PEER_SECTION)),
            (Some(text), None) => return Err(format!("invalid AllowedIps {:?}", text)),
            (Some(_), Some(address)) => address,
        };

        if pool.is_excluded(address) {
            return Err(format!("address {} is excluded from the pool", address));
        }

        if state.assigned.contains(&address) {
            return Err(format!("address {} is already leased", address));
        }

        Ok(Lease::from_fields(hostname, address, fields))
    }

    /// Returns the lease for a hostname, if one exists.
    pub async fn lookup(&self, hostname: &str) -> Option<Lease> {
        let state = self.state.lock().await;
        state.leases.get(hostname).cloned()
    }

    /// Returns the lease for a hostname, allocating and persisting a new one
    /// if the hostname is unknown.
    ///
    /// Lookup, allocation and the record write happen under one lock.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHostname`] if the hostname cannot be a record name
    /// - [`Error::PoolExhausted`] if no address is available
    /// - [`Error::Persistence`] if the record could not be written; the
    ///   address is not granted
    pub async fn resolve(&self, hostname: &str) -> Result<Lease> {
        validate_hostname(hostname)?;
        let mut state = self.state.lock().await;

        if let Some(lease) = state.leases.get(hostname) {
            debug!("Existing lease {} -> {}", hostname, lease.address);
            return Ok(lease.clone());
        }

        let address = self.pool.reserve_next(&state.assigned)?;
        self.create_locked(&mut state, hostname, address).await
    }

    /// Creates a lease for `hostname` at `address` and persists it.
    ///
    /// The record is on disk before this returns `Ok`. On failure the
    /// table is unchanged.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHostname`] if the hostname cannot be a record name
    /// - [`Error::LeaseExists`] if the hostname already has a lease
    /// - [`Error::AddressInUse`] if the address is leased or excluded
    /// - [`Error::Persistence`] if the record could not be written
    pub async fn create(&self, hostname: &str, address: Ipv4Addr) -> Result<Lease> {
        validate_hostname(hostname)?;
        let mut state = self.state.lock().await;
        self.create_locked(&mut state, hostname, address).await
    }

    async fn create_locked(
        &self,
        state: &mut InternalState,
        hostname: &str,
        address: Ipv4Addr,
    ) -> Result<Lease> {
        if state.leases.contains_key(hostname) {
            return Err(Error::LeaseExists(hostname.to_string()));
        }

        if state.assigned.contains(&address) || self.pool.is_excluded(address) {
            return Err(Error::AddressInUse(address));
        }

        let lease = self
            .write_new_record(hostname, address)
            .await
            .map_err(|source| Error::Persistence {
                hostname: hostname.to_string(),
                source,
            })?;

        state.insert(lease.clone());

        info!("Leased {} to {}", address, hostname);

        Ok(lease)
    }

    /// Writes the record for a new lease.
    ///
    /// A leftover record for the hostname (one skipped at load) keeps its
    /// keys, endpoint and unrelated tables; only `AllowedIps` is replaced.
    async fn write_new_record(&self, hostname: &str, address: Ipv4Addr) -> io::Result<Lease> {
        let path = record_path(&self.directory, hostname);
        let mut document = self.read_existing(&path).await;

        let existing = peer_fields_of(&document);
        let lease = Lease::from_fields(hostname.to_string(), address, existing);

        apply_peer_fields(&mut document, &lease.peer_fields());
        write_document(&path, &document).await?;

        Ok(lease)
    }

    async fn read_existing(&self, path: &Path) -> toml::Table {
        match read_document(path).await {
            Ok(document) => document,
            Err(error) => {
                warn!(
                    "Replacing unreadable peer record {}: {}",
                    path.display(),
                    error
                );
                toml::Table::new()
            }
        }
    }

    /// Persists the out-of-band fields of an existing lease.
    ///
    /// Only `public_key`, `preshared_key` and `endpoint` can change; the
    /// hostname must already be leased and the address must match.
    ///
    /// # Errors
    ///
    /// - [`Error::LeaseNotFound`] if the hostname has no lease
    /// - [`Error::AddressMismatch`] if `lease.address` differs from the lease
    /// - [`Error::Persistence`] if the record could not be written; the
    ///   table is unchanged
    pub async fn save(&self, lease: &Lease) -> Result<()> {
        let mut state = self.state.lock().await;

        let current = state
            .leases
            .get(&lease.hostname)
            .ok_or_else(|| Error::LeaseNotFound(lease.hostname.clone()))?;

        if current.address != lease.address {
            return Err(Error::AddressMismatch {
                hostname: lease.hostname.clone(),
                leased: current.address,
                requested: lease.address,
            });
        }

        let path = record_path(&self.directory, &lease.hostname);
        let mut document = self.read_existing(&path).await;
        apply_peer_fields(&mut document, &lease.peer_fields());
        write_document(&path, &document)
            .await
            .map_err(|source| Error::Persistence {
                hostname: lease.hostname.clone(),
                source,
            })?;

        state.leases.insert(lease.hostname.clone(), lease.clone());

        info!("Updated peer record for {}", lease.hostname);

        Ok(())
    }

    /// Returns all leases ordered by hostname.
    pub async fn list_leases(&self) -> Vec<Lease> {
        let state = self.state.lock().await;
        state.leases.values().cloned().collect()
    }

    pub async fn lease_count(&self) -> usize {
        let state = self.state.lock().await;
        state.leases.len()
    }

    /// Returns the count of addresses still available in the pool.
    pub async fn free_address_count(&self) -> u64 {
        let state = self.state.lock().await;
        self.pool.available_count(&state.assigned)
    }

    /// Records skipped by [`load`](Self::load).
    pub fn skipped_records(&self) -> &[SkippedRecord] {
        &self.skipped
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
