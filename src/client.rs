//! Client side of the lease exchange.
//!
//! A peer asks the lease server for the address leased to its hostname and
//! writes the answer into its systemd-networkd configuration.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::query::{Reply, encode_address_query};
use crate::record::{PeerFields, apply_peer_fields, read_document, write_document};

pub const DEFAULT_PORT: u16 = 53;
pub const DEFAULT_INTERFACE: &str = "wg0";
pub const DEFAULT_NETWORK_FILE: &str = "/etc/systemd/network/99-wireguard.network";
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUFFER_SIZE: usize = 4096;
const MATCH_SECTION: &str = "Match";
const NETWORK_SECTION: &str = "Network";

/// Asks `server` for the address leased to `hostname`.
pub async fn lookup_address(server: SocketAddr, hostname: &str) -> Result<Ipv4Addr> {
    lookup_address_with_timeout(server, hostname, RESPONSE_TIMEOUT).await
}

/// Same as [`lookup_address`] with an explicit deadline for the whole exchange.
///
/// Datagrams that do not decode as a reply, or that carry another
/// transaction id, are ignored until the deadline passes.
pub async fn lookup_address_with_timeout(
    server: SocketAddr,
    hostname: &str,
    deadline: Duration,
) -> Result<Ipv4Addr> {
    let id: u16 = rand::random();
    let query = encode_address_query(id, hostname)?;

    let bind_addr: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.send_to(&query, server).await?;
    debug!("Sent A query {:#06x} for {} to {}", id, hostname, server);

    let reply = tokio::time::timeout(deadline, receive_reply(&socket, id))
        .await
        .map_err(|_| Error::Timeout)??;

    reply
        .addresses
        .first()
        .copied()
        .ok_or_else(|| Error::NoAddress {
            hostname: hostname.to_string(),
            rcode: reply.rcode(),
        })
}

async fn receive_reply(socket: &UdpSocket, id: u16) -> Result<Reply> {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        let (size, source) = socket.recv_from(&mut buffer).await?;
        match Reply::decode(&buffer[..size]) {
            Ok(reply) if reply.id == id => return Ok(reply),
            Ok(reply) => {
                debug!(
                    "Ignoring reply {:#06x} from {}, waiting for {:#06x}",
                    reply.id, source, id
                );
            }
            Err(error) => debug!("Ignoring datagram from {}: {}", source, error),
        }
    }
}

/// Points the interface configuration at `address`.
///
/// A missing file is created. `[Match] Name` is only written when the file
/// has no `[Match]` table yet.
pub async fn update_network_file(path: &Path, interface: &str, address: Ipv4Addr) -> Result<()> {
    let mut document = read_document(path).await?;

    if !document.contains_key(MATCH_SECTION) {
        let mut section = toml::Table::new();
        section.insert("Name".to_string(), toml::Value::String(interface.to_string()));
        document.insert(MATCH_SECTION.to_string(), toml::Value::Table(section));
    }

    let network = document
        .entry(NETWORK_SECTION)
        .or_insert(toml::Value::Table(toml::Table::new()));
    if !network.is_table() {
        *network = toml::Value::Table(toml::Table::new());
    }
    if let Some(network) = network.as_table_mut() {
        network.insert(
            "Address".to_string(),
            toml::Value::String(address.to_string()),
        );
    }

    write_document(path, &document).await?;
    Ok(())
}

/// Sets the present fields of `update` in the file's `[WireGuardPeer]` table.
pub async fn update_peer_file(path: &Path, update: &PeerFields) -> Result<()> {
    let mut document = read_document(path).await?;
    apply_peer_fields(&mut document, update);
    write_document(path, &document).await?;
    Ok(())
}

/// The name this machine knows itself by, used as the lease key when none
/// is given.
pub fn system_hostname() -> Result<String> {
    let hostname = gethostname::gethostname()
        .into_string()
        .map_err(|raw| Error::InvalidHostname(raw.to_string_lossy().into_owned()))?;
    if hostname.is_empty() {
        return Err(Error::InvalidHostname(hostname));
    }
    Ok(hostname)
}

/// Options of one lookup-and-configure run.
#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub server: String,
    pub port: u16,
    pub hostname: String,
    pub interface: String,
    pub network_file: Option<PathBuf>,
    pub peer_file: Option<PathBuf>,
}

impl LookupOptions {
    /// Resolves the network and peer file paths. A single path given for
    /// either one is used for both.
    pub fn paths(&self) -> (PathBuf, PathBuf) {
        match (&self.network_file, &self.peer_file) {
            (Some(network), Some(peer)) => (network.clone(), peer.clone()),
            (Some(path), None) | (None, Some(path)) => (path.clone(), path.clone()),
            (None, None) => (
                PathBuf::from(DEFAULT_NETWORK_FILE),
                PathBuf::from(DEFAULT_NETWORK_FILE),
            ),
        }
    }
}

/// Looks up this peer's address and records it, with the server as the
/// peer endpoint.
pub async fn lookup_and_configure(options: &LookupOptions) -> Result<Ipv4Addr> {
    let server = tokio::net::lookup_host((options.server.as_str(), options.port))
        .await?
        .next()
        .ok_or_else(|| Error::Socket(format!("Could not resolve {}", options.server)))?;

    let address = lookup_address(server, &options.hostname).await?;
    info!("{} is leased {}", options.hostname, address);

    let (network_file, peer_file) = options.paths();
    update_network_file(&network_file, &options.interface, address).await?;

    let update = PeerFields {
        endpoint: Some(options.server.clone()),
        ..Default::default()
    };
    update_peer_file(&peer_file, &update).await?;

    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Answer, Query};

    async fn spawn_responder(answer: Answer, send_stray_first: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buffer = [0u8; 512];
            let (size, source) = socket.recv_from(&mut buffer).await.unwrap();
            let query = Query::decode(&buffer[..size]).unwrap();

            if send_stray_first {
                let mut stray = query.encode_reply(Answer::Address(Ipv4Addr::new(10, 66, 0, 1)));
                let wrong_id = query.id.wrapping_add(1).to_be_bytes();
                stray[0..2].copy_from_slice(&wrong_id);
                socket.send_to(&stray, source).await.unwrap();
                socket.send_to(b"junk", source).await.unwrap();
            }

            socket
                .send_to(&query.encode_reply(answer), source)
                .await
                .unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_lookup_address() {
        let server = spawn_responder(Answer::Address(Ipv4Addr::new(10, 0, 0, 7)), false).await;
        let address = lookup_address(server, "alice").await.unwrap();
        assert_eq!(address, Ipv4Addr::new(10, 0, 0, 7));
    }

    #[tokio::test]
    async fn test_lookup_ignores_other_transactions() {
        let server = spawn_responder(Answer::Address(Ipv4Addr::new(10, 0, 0, 8)), true).await;
        let address = lookup_address(server, "alice").await.unwrap();
        assert_eq!(address, Ipv4Addr::new(10, 0, 0, 8));
    }

    #[tokio::test]
    async fn test_lookup_without_answer() {
        let server = spawn_responder(Answer::ServerFailure, false).await;
        let result = lookup_address(server, "alice").await;
        assert!(matches!(result, Err(Error::NoAddress { rcode: 2, .. })));
    }

    #[tokio::test]
    async fn test_lookup_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = silent.local_addr().unwrap();

        let result =
            lookup_address_with_timeout(server, "alice", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_update_network_file_creates_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("99-wireguard.network");

        update_network_file(&path, "wg0", Ipv4Addr::new(10, 0, 0, 3))
            .await
            .unwrap();

        let document = read_document(&path).await.unwrap();
        assert_eq!(
            document
                .get("Match")
                .and_then(|section| section.get("Name"))
                .and_then(|value| value.as_str()),
            Some("wg0")
        );
        assert_eq!(
            document
                .get("Network")
                .and_then(|section| section.get("Address"))
                .and_then(|value| value.as_str()),
            Some("10.0.0.3")
        );
    }

    #[tokio::test]
    async fn test_update_network_file_keeps_existing_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.network");
        std::fs::write(
            &path,
            "[Match]\nName = \"mesh0\"\n\n[Network]\nAddress = \"10.0.0.1\"\nDNS = \"10.0.0.254\"\n",
        )
        .unwrap();

        update_network_file(&path, "wg0", Ipv4Addr::new(10, 0, 0, 9))
            .await
            .unwrap();

        let document = read_document(&path).await.unwrap();
        let network = document.get("Network").unwrap();
        assert_eq!(
            document
                .get("Match")
                .and_then(|section| section.get("Name"))
                .and_then(|value| value.as_str()),
            Some("mesh0")
        );
        assert_eq!(
            network.get("Address").and_then(|v| v.as_str()),
            Some("10.0.0.9")
        );
        assert_eq!(
            network.get("DNS").and_then(|v| v.as_str()),
            Some("10.0.0.254")
        );
    }

    #[tokio::test]
    async fn test_update_peer_file_preserves_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("99-wireguard.network");
        std::fs::write(
            &path,
            "[WireGuardPeer]\nPublicKey = \"pub\"\n\n[Network]\nAddress = \"10.0.0.4\"\n",
        )
        .unwrap();

        let update = PeerFields {
            endpoint: Some("lease.example".to_string()),
            ..Default::default()
        };
        update_peer_file(&path, &update).await.unwrap();

        let document = read_document(&path).await.unwrap();
        let peer = crate::record::peer_fields_of(&document);
        assert_eq!(peer.endpoint.as_deref(), Some("lease.example"));
        assert_eq!(peer.public_key.as_deref(), Some("pub"));
        assert!(document.contains_key("Network"));
    }

    #[test]
    fn test_system_hostname() {
        let hostname = system_hostname().unwrap();
        assert!(!hostname.is_empty());
    }

    #[test]
    fn test_lookup_paths() {
        let mut options = LookupOptions {
            server: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            hostname: "alice".to_string(),
            interface: DEFAULT_INTERFACE.to_string(),
            network_file: None,
            peer_file: None,
        };
        assert_eq!(
            options.paths(),
            (
                PathBuf::from(DEFAULT_NETWORK_FILE),
                PathBuf::from(DEFAULT_NETWORK_FILE)
            )
        );

        options.peer_file = Some(PathBuf::from("/tmp/peer.network"));
        assert_eq!(
            options.paths(),
            (
                PathBuf::from("/tmp/peer.network"),
                PathBuf::from("/tmp/peer.network")
            )
        );

        options.network_file = Some(PathBuf::from("/tmp/net.network"));
        assert_eq!(
            options.paths(),
            (
                PathBuf::from("/tmp/net.network"),
                PathBuf::from("/tmp/peer.network")
            )
        );
    }

    #[tokio::test]
    async fn test_lookup_and_configure_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg.network");
        let server = spawn_responder(Answer::Address(Ipv4Addr::new(10, 0, 0, 12)), false).await;

        let options = LookupOptions {
            server: server.ip().to_string(),
            port: server.port(),
            hostname: "carol".to_string(),
            interface: "wg1".to_string(),
            network_file: Some(path.clone()),
            peer_file: None,
        };
        let address = lookup_and_configure(&options).await.unwrap();
        assert_eq!(address, Ipv4Addr::new(10, 0, 0, 12));

        let document = read_document(&path).await.unwrap();
        assert_eq!(
            document
                .get("Network")
                .and_then(|section| section.get("Address"))
                .and_then(|value| value.as_str()),
            Some("10.0.0.12")
        );
        let peer = crate::record::peer_fields_of(&document);
        assert_eq!(peer.endpoint.as_deref(), Some("127.0.0.1"));
    }
}
