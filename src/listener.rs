use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::Connection;
use crate::packet::Packet;
use crate::socket::{DatagramSocket, SocketState};

/// The capability a blocking send needs from its host: drive one pass of the
///  inbound pump so acknowledgements can arrive. Passed per call, never
///  stored by a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceivePump: Send + Sync {
    async fn receive(&self, block: bool, timeout: Duration) -> SocketState;
}

/// Owns the UDP socket and all connections over it, keyed by remote address.
///
/// This is the place where the parts of the protocol come together: inbound
///  datagrams are dispatched to their connection by source address (creating
///  one for previously unseen peers), outbound traffic from all connections
///  shares the one socket, and the host drives everything by calling
///  [`Listener::receive`] and [`Listener::update`] in its loop.
pub struct Listener {
    config: Arc<Config>,
    socket: Arc<UdpSocket>,
    connections: RwLock<FxHashMap<SocketAddr, Arc<Connection>>>,
}

impl Listener {
    pub async fn bind(addr: impl ToSocketAddrs, config: Config) -> anyhow::Result<Listener> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("bound receive socket to {:?}", socket.local_addr()?);

        Ok(Listener {
            config: Arc::new(config),
            socket,
            connections: RwLock::new(FxHashMap::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    /// Registers a connection for `remote` and opens the conversation with a
    ///  connect packet. The connection reports itself as connected once the
    ///  peer's reply has passed through the pump.
    ///
    /// Handshake packets carry no sequence and are never retransmitted by
    ///  this layer - callers that need a robust handshake re-dial on their
    ///  own schedule until [`Connection::connected`] turns true.
    pub async fn dial(&self, remote: SocketAddr) -> Arc<Connection> {
        let connection = self.get_or_create(remote).await;

        debug!("dialing {:?}", remote);
        DatagramSocket::send_to(&self.socket, Packet::connect().bytes(), remote).await;

        connection
    }

    pub async fn connection(&self, remote: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&remote).cloned()
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Severs a peer. Pending outbound stores and undelivered inbound packets
    ///  are discarded with it; a datagram from the same address later creates
    ///  a fresh connection.
    pub async fn drop_connection(&self, remote: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(&remote)
    }

    /// Drives retransmission and dedup maintenance for every connection.
    pub async fn update(&self) {
        for connection in self.connections().await {
            connection.update().await;
        }
    }

    /// One pass of the inbound pump: reads at most one datagram off the
    ///  socket and dispatches it to the connection owning its source address.
    ///
    /// Returns `InProgress` when no datagram was available (within `timeout`
    ///  if `block` is set), otherwise whatever the connection made of the
    ///  packet. A protocol violation drops the offending connection and is
    ///  not an error of the pump itself.
    pub async fn receive(&self, block: bool, timeout: Duration) -> SocketState {
        let mut buf = vec![0u8; self.config.max_datagram_size];

        let (num_read, from) = if block {
            match time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
                Err(_) => return SocketState::InProgress,
                Ok(Err(e)) => {
                    error!("socket error: {}", e);
                    return SocketState::Error;
                }
                Ok(Ok(x)) => x,
            }
        } else {
            match self.socket.try_recv_from(&mut buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => return SocketState::InProgress,
                Err(e) => {
                    error!("socket error: {}", e);
                    return SocketState::Error;
                }
                Ok(x) => x,
            }
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

        async {
            trace!("received {} bytes from {:?}", num_read, from);

            let connection = self.get_or_create(from).await;
            match connection.store_inbound(Packet::from_datagram(&buf[..num_read])).await {
                Ok(state) => state,
                Err(violation) => {
                    warn!("protocol violation from {:?} ({}) - dropping the connection", from, violation);
                    self.connections.write().await.remove(&from);
                    SocketState::Done
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_or_create(&self, remote: SocketAddr) -> Arc<Connection> {
        match self.connections.write().await.entry(remote) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                debug!("initializing connection for {:?}", remote);
                let connection = Connection::new(
                    Arc::new(self.socket.clone()),
                    remote,
                    self.config.clone(),
                );
                e.insert(Arc::new(connection)).clone()
            }
        }
    }
}

#[async_trait]
impl ReceivePump for Listener {
    async fn receive(&self, block: bool, timeout: Duration) -> SocketState {
        Listener::receive(self, block, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Reliability;

    const PUMP_TIMEOUT: Duration = Duration::from_secs(1);

    async fn loopback_pair() -> (Listener, Listener) {
        let server = Listener::bind("127.0.0.1:0", Config::default()).await.unwrap();
        let client = Listener::bind("127.0.0.1:0", Config::default()).await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_dial_performs_the_handshake() {
        let (server, client) = loopback_pair().await;

        let connection = client.dial(server.local_addr()).await;
        assert!(!connection.connected().await);

        // the connect packet is consumed by the server's pump, answered, and
        // never reaches the server-side inbox
        assert_eq!(server.receive(true, PUMP_TIMEOUT).await, SocketState::InProgress);
        let server_side = server.connection(client.local_addr()).await.unwrap();
        assert!(server_side.connected().await);
        assert!(server_side.pop().await.is_none());

        assert_eq!(client.receive(true, PUMP_TIMEOUT).await, SocketState::InProgress);
        assert!(connection.connected().await);
    }

    #[tokio::test]
    async fn test_unreliable_delivery_retains_nothing() {
        let (server, client) = loopback_pair().await;
        let connection = client.dial(server.local_addr()).await;
        server.receive(true, PUMP_TIMEOUT).await;
        client.receive(true, PUMP_TIMEOUT).await;

        let mut packet = Packet::message(Reliability::None);
        packet.put_payload(b"x");
        let state = connection.send(&mut packet, false, &client).await.unwrap();
        assert_eq!(state, SocketState::Done);
        assert_eq!(connection.in_flight().await, 0);

        assert_eq!(server.receive(true, PUMP_TIMEOUT).await, SocketState::Done);
        let server_side = server.connection(client.local_addr()).await.unwrap();
        assert_eq!(server_side.pop().await.unwrap().payload(), b"x");

        // nothing flows back for unreliable traffic
        assert_eq!(client.receive(true, Duration::from_millis(50)).await, SocketState::InProgress);
    }

    #[tokio::test]
    async fn test_reliable_round_trip_clears_the_store() {
        let (server, client) = loopback_pair().await;
        let connection = client.dial(server.local_addr()).await;
        server.receive(true, PUMP_TIMEOUT).await;
        client.receive(true, PUMP_TIMEOUT).await;

        let mut packet = Packet::message(Reliability::Ack);
        packet.put_payload(b"ping");
        connection.send(&mut packet, false, &client).await.unwrap();
        assert_eq!(connection.in_flight().await, 1);

        assert_eq!(server.receive(true, PUMP_TIMEOUT).await, SocketState::Done);
        let server_side = server.connection(client.local_addr()).await.unwrap();
        assert_eq!(server_side.pop().await.unwrap().payload(), b"ping");

        assert_eq!(client.receive(true, PUMP_TIMEOUT).await, SocketState::Done);
        assert_eq!(connection.in_flight().await, 0);

        // the ack itself surfaces as an empty packet
        assert_eq!(connection.pop().await.unwrap().payload(), b"");
    }

    #[tokio::test]
    async fn test_unprocessed_ack_triggers_retransmission_and_dedup() {
        let server = Listener::bind("127.0.0.1:0", Config::default()).await.unwrap();
        let mut config = Config::default();
        config.initial_rtt = Duration::from_millis(50);
        let client = Listener::bind("127.0.0.1:0", config).await.unwrap();

        let connection = client.dial(server.local_addr()).await;
        server.receive(true, PUMP_TIMEOUT).await;
        client.receive(true, PUMP_TIMEOUT).await;

        let mut packet = Packet::message(Reliability::Ack);
        packet.put_payload(b"once");
        connection.send(&mut packet, false, &client).await.unwrap();

        assert_eq!(server.receive(true, PUMP_TIMEOUT).await, SocketState::Done);

        // the client sits on the ack without processing it, so the packet
        // falls due and goes out again
        tokio::time::sleep(Duration::from_millis(120)).await;
        client.update().await;
        assert_eq!(connection.in_flight().await, 1);

        // the duplicate is suppressed but re-acked
        assert_eq!(server.receive(true, PUMP_TIMEOUT).await, SocketState::InProgress);
        let server_side = server.connection(client.local_addr()).await.unwrap();
        assert!(server_side.pop().await.unwrap().payload() == b"once");
        assert!(server_side.pop().await.is_none());

        // both acks are waiting; either one clears the store
        client.receive(true, PUMP_TIMEOUT).await;
        client.receive(true, PUMP_TIMEOUT).await;
        assert_eq!(connection.in_flight().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_send_against_a_live_peer() {
        let (server, client) = loopback_pair().await;
        let server = Arc::new(server);
        let client = Arc::new(client);

        let pump_server = server.clone();
        let server_task = tokio::spawn(async move {
            loop {
                pump_server.receive(true, Duration::from_millis(10)).await;
                pump_server.update().await;
            }
        });

        let connection = client.dial(server.local_addr()).await;
        client.receive(true, PUMP_TIMEOUT).await;

        let mut packet = Packet::message(Reliability::Ordered);
        packet.put_payload(b"blocking");
        let state = connection.send(&mut packet, true, &*client).await.unwrap();

        assert_eq!(state, SocketState::Done);
        assert_eq!(connection.in_flight().await, 0);

        server_task.abort();
    }

    #[tokio::test]
    async fn test_protocol_violation_drops_the_connection() {
        let server = Listener::bind("127.0.0.1:0", Config::default()).await.unwrap();

        let rogue = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        rogue.send_to(&[9, 0], server.local_addr()).await.unwrap();

        assert_eq!(server.receive(true, PUMP_TIMEOUT).await, SocketState::Done);
        assert!(server.connection(rogue.local_addr().unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_nonblocking_receive_reports_an_idle_socket() {
        let server = Listener::bind("127.0.0.1:0", Config::default()).await.unwrap();
        assert_eq!(server.receive(false, Duration::ZERO).await, SocketState::InProgress);
    }
}
