use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use peerlease::client::{lookup_address, lookup_address_with_timeout};
use peerlease::query::{Reply, encode_address_query};
use peerlease::{Config, Error, LeaseServer};

fn test_config(peers_dir: &Path) -> Config {
    Config {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        network: "10.0.0.0/24".to_string(),
        excluded: vec![Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 255)],
        peers_dir: peers_dir.to_path_buf(),
    }
}

struct RunningServer {
    server: Arc<LeaseServer>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningServer {
    async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn start_server(config: Config) -> RunningServer {
    let server = Arc::new(LeaseServer::new(config).await.unwrap());
    let addr = server.local_addr().unwrap();

    let running = Arc::clone(&server);
    let task = tokio::spawn(async move {
        let _ = running.run().await;
    });

    RunningServer { server, addr, task }
}

#[tokio::test]
async fn leases_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = start_server(test_config(dir.path())).await;
    let first_addr = first.addr;
    assert_eq!(
        lookup_address(first_addr, "alice").await.unwrap(),
        Ipv4Addr::new(10, 0, 0, 1)
    );
    assert_eq!(
        lookup_address(first_addr, "bob").await.unwrap(),
        Ipv4Addr::new(10, 0, 0, 2)
    );
    assert_eq!(
        lookup_address(first_addr, "alice").await.unwrap(),
        Ipv4Addr::new(10, 0, 0, 1)
    );
    first.stop().await;

    let stopped =
        lookup_address_with_timeout(first_addr, "carol", Duration::from_millis(300)).await;
    assert!(stopped.is_err());

    let second = start_server(test_config(dir.path())).await;
    assert_eq!(second.server.leases().lease_count().await, 2);
    assert_eq!(
        lookup_address(second.addr, "bob").await.unwrap(),
        Ipv4Addr::new(10, 0, 0, 2)
    );
    assert_eq!(
        lookup_address(second.addr, "carol").await.unwrap(),
        Ipv4Addr::new(10, 0, 0, 3)
    );
    second.stop().await;
}

#[tokio::test]
async fn concurrent_lookups_get_distinct_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let running = start_server(test_config(dir.path())).await;
    let addr = running.addr;

    let mut tasks = Vec::new();
    for index in 0..20 {
        tasks.push(tokio::spawn(async move {
            lookup_address(addr, &format!("host{}", index)).await.unwrap()
        }));
    }

    let mut addresses = Vec::new();
    for task in tasks {
        addresses.push(task.await.unwrap());
    }
    addresses.sort();
    addresses.dedup();

    assert_eq!(addresses.len(), 20);
    assert_eq!(running.server.leases().lease_count().await, 20);
    running.stop().await;
}

#[tokio::test]
async fn malformed_datagram_gets_no_reply() {
    let dir = tempfile::tempdir().unwrap();
    let running = start_server(test_config(dir.path())).await;
    let addr = running.addr;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&[0x12, 0x34, 0x01], addr).await.unwrap();

    let mut buffer = [0u8; 512];
    let received =
        tokio::time::timeout(Duration::from_millis(300), socket.recv_from(&mut buffer)).await;
    assert!(received.is_err());

    assert_eq!(
        lookup_address(addr, "alice").await.unwrap(),
        Ipv4Addr::new(10, 0, 0, 1)
    );
    running.stop().await;
}

#[tokio::test]
async fn oversized_datagram_is_answered_from_its_first_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let running = start_server(test_config(dir.path())).await;

    let mut datagram = encode_address_query(0x5151, "alice").unwrap();
    datagram.resize(6000, 0xAB);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&datagram, running.addr).await.unwrap();

    let mut buffer = [0u8; 512];
    let (size, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    let reply = Reply::decode(&buffer[..size]).unwrap();
    assert_eq!(reply.id, 0x5151);
    assert_eq!(reply.addresses, vec![Ipv4Addr::new(10, 0, 0, 1)]);

    running.stop().await;
}

#[tokio::test]
async fn exhausted_pool_returns_no_address() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        network: "10.9.0.0/30".to_string(),
        excluded: vec![Ipv4Addr::new(10, 9, 0, 0), Ipv4Addr::new(10, 9, 0, 3)],
        ..test_config(dir.path())
    };
    let running = start_server(config).await;
    let addr = running.addr;

    lookup_address(addr, "one").await.unwrap();
    lookup_address(addr, "two").await.unwrap();

    let result = lookup_address_with_timeout(addr, "three", Duration::from_secs(2)).await;
    assert!(matches!(result, Err(Error::NoAddress { rcode: 2, .. })));
    running.stop().await;
}
