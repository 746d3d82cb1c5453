//! On-disk peer records.
//!
//! Each lease is stored as its own TOML file, `<peers_dir>/<hostname>.toml`,
//! in the systemd-networkd style read by the companion client:
//!
//! ```toml
//! [WireGuardPeer]
//! AllowedIps = "10.0.0.1"
//! PublicKey = "..."
//! PresharedKey = "..."
//! Endpoint = "..."
//! ```
//!
//! Only the `[WireGuardPeer]` keys this crate knows about are touched when a
//! record is rewritten; any other tables already present in the file survive.

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

pub const PEER_RECORD_EXTENSION: &str = "toml";
pub const PEER_SECTION: &str = "WireGuardPeer";

const ALLOWED_IPS_KEY: &str = "AllowedIps";
const PUBLIC_KEY_KEY: &str = "PublicKey";
const PRESHARED_KEY_KEY: &str = "PresharedKey";
const ENDPOINT_KEY: &str = "Endpoint";

#[derive(Debug, Default, Deserialize)]
struct RecordFile {
    #[serde(rename = "WireGuardPeer")]
    peer: Option<PeerFields>,
}

/// The `[WireGuardPeer]` fields of a record. Every field is optional on
/// disk; `AllowedIps` is required for the record to describe a lease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PeerFields {
    #[serde(rename = "AllowedIps")]
    pub allowed_ips: Option<String>,
    #[serde(rename = "PublicKey")]
    pub public_key: Option<String>,
    #[serde(rename = "PresharedKey")]
    pub preshared_key: Option<String>,
    #[serde(rename = "Endpoint")]
    pub endpoint: Option<String>,
}

impl PeerFields {
    /// Parses `AllowedIps` as a single host address.
    ///
    /// Accepts a bare address or a `/32` network.
    pub fn address(&self) -> Option<Ipv4Addr> {
        let text = self.allowed_ips.as_deref()?.trim();
        if let Ok(address) = text.parse::<Ipv4Addr>() {
            return Some(address);
        }
        match text.parse::<Ipv4Net>() {
            Ok(net) if net.prefix_len() == 32 => Some(net.addr()),
            _ => None,
        }
    }
}

/// Parses the `[WireGuardPeer]` table of a record file.
///
/// A file without the table yields all-`None` fields.
pub fn parse_peer_fields(content: &str) -> Result<PeerFields> {
    let file: RecordFile = toml::from_str(content)?;
    Ok(file.peer.unwrap_or_default())
}

/// Extracts the `[WireGuardPeer]` fields of an already parsed document.
///
/// A missing or malformed table yields all-`None` fields.
pub fn peer_fields_of(document: &toml::Table) -> PeerFields {
    document
        .get(PEER_SECTION)
        .cloned()
        .and_then(|section| section.try_into::<PeerFields>().ok())
        .unwrap_or_default()
}

/// Sets every present field of `fields` in the `[WireGuardPeer]` table,
/// creating the table if needed. Absent fields are left as they are.
pub fn apply_peer_fields(document: &mut toml::Table, fields: &PeerFields) {
    let section = document
        .entry(PEER_SECTION)
        .or_insert(toml::Value::Table(toml::Table::new()));
    if !section.is_table() {
        *section = toml::Value::Table(toml::Table::new());
    }
    let Some(section) = section.as_table_mut() else {
        return;
    };

    let updates = [
        (ALLOWED_IPS_KEY, &fields.allowed_ips),
        (PUBLIC_KEY_KEY, &fields.public_key),
        (PRESHARED_KEY_KEY, &fields.preshared_key),
        (ENDPOINT_KEY, &fields.endpoint),
    ];
    for (key, value) in updates {
        if let Some(value) = value {
            section.insert(key.to_string(), toml::Value::String(value.clone()));
        }
    }
}

/// Rejects hostnames that cannot serve as both a lease key and a file name.
pub fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && !hostname.starts_with('.')
        && !hostname
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidHostname(hostname.to_string()))
    }
}

pub fn record_path(directory: &Path, hostname: &str) -> PathBuf {
    directory.join(format!("{}.{}", hostname, PEER_RECORD_EXTENSION))
}

/// Returns the hostname a record file belongs to, or `None` if the path is
/// not a peer record.
pub fn hostname_from_path(path: &Path) -> Option<String> {
    if path.extension()? != PEER_RECORD_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    validate_hostname(stem).ok()?;
    Some(stem.to_string())
}

/// Reads a TOML document, treating a missing file as empty.
pub async fn read_document(path: &Path) -> Result<toml::Table> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content.parse::<toml::Table>()?),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(toml::Table::new()),
        Err(error) => Err(error.into()),
    }
}

/// Writes a TOML document through a synced temporary file and a rename, so
/// readers see either the old content or the new, never a partial file.
pub async fn write_document(path: &Path, document: &toml::Table) -> io::Result<()> {
    let content = toml::to_string(document).map_err(io::Error::other)?;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(error) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(error);
    }

    sync_directory(parent_directory(path)).await
}

/// Flushes a directory so entries created or renamed in it survive a crash.
#[cfg(unix)]
pub async fn sync_directory(directory: &Path) -> io::Result<()> {
    tokio::fs::File::open(directory).await?.sync_all().await
}

/// Directories cannot be opened as files here; renames are flushed by the
/// file system itself.
#[cfg(not(unix))]
pub async fn sync_directory(_directory: &Path) -> io::Result<()> {
    Ok(())
}

pub fn parent_directory(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
