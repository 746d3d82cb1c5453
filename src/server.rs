use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::Leases;
use crate::query::{Answer, Query};

const RECV_BUFFER_SIZE: usize = 4096;

pub struct LeaseServer {
    leases: Arc<Leases>,
    socket: Arc<UdpSocket>,
}

impl LeaseServer {
    pub async fn new(config: Config) -> Result<Self> {
        let pool = config.pool()?;
        let listen_addr = config.listen_addr()?;
        let leases = Arc::new(Leases::load(&config.peers_dir, pool).await?);

        let socket = Arc::new(Self::create_socket(listen_addr)?);

        info!(
            "Lease server starting on {}",
            socket.local_addr().unwrap_or(listen_addr)
        );
        info!(
            "Address pool: {} ({} excluded, {} leased, {} free)",
            leases.pool().network(),
            leases.pool().excluded().len(),
            leases.lease_count().await,
            leases.free_address_count().await
        );

        Ok(Self { leases, socket })
    }

    fn create_socket(listen_addr: SocketAddr) -> Result<UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(listen_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        socket.bind(&listen_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", listen_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    /// Receives queries until the task is dropped. Each datagram is handled
    /// on its own task; a failed request never stops the loop.
    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("Lease server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = QueryHandler {
                        leases: Arc::clone(&self.leases),
                        socket: Arc::clone(&self.socket),
                    };

                    tokio::spawn(async move {
                        if let Err(error) = handler.handle_packet(&data, source).await {
                            warn!("Error handling query from {}: {}", source, error);
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving query: {}", error);
                }
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn leases(&self) -> &Leases {
        &self.leases
    }
}

struct QueryHandler {
    leases: Arc<Leases>,
    socket: Arc<UdpSocket>,
}

impl QueryHandler {
    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        let reply = match self.build_reply(data, source).await {
            Ok(reply) => reply,
            Err(Error::MalformedQuery(reason)) => {
                debug!("Dropping malformed query from {}: {}", source, reason);
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        self.socket.send_to(&reply, source).await?;

        Ok(())
    }

    /// Decodes one query and produces the reply bytes.
    ///
    /// Only a malformed query is an error; every other outcome, including
    /// pool exhaustion and write failures, is a reply.
    async fn build_reply(&self, data: &[u8], source: SocketAddr) -> Result<Vec<u8>> {
        let query = Query::decode(data)?;
        let hostname = query.hostname();

        if !query.is_address_query() {
            info!(
                "Unsupported query type {} for {:?} from {}",
                query.qtype, hostname, source
            );
            return Ok(query.encode_reply(Answer::NoData));
        }

        let answer = match self.leases.resolve(hostname).await {
            Ok(lease) => {
                info!("A {} -> {} ({})", hostname, lease.address, source);
                Answer::Address(lease.address)
            }
            Err(Error::PoolExhausted) => {
                warn!("Pool exhausted, cannot lease an address to {}", hostname);
                Answer::ServerFailure
            }
            Err(Error::InvalidHostname(_)) => {
                warn!("Refusing unleasable hostname {:?} from {}", hostname, source);
                Answer::Refused
            }
            Err(error) => {
                error!("Failed to lease an address to {}: {}", hostname, error);
                Answer::ServerFailure
            }
        };

        Ok(query.encode_reply(answer))
    }
}
