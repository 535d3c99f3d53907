use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Outcome of a socket operation or of one pass of the inbound pump.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SocketState {
    /// The operation completed.
    Done,
    /// Nothing went wrong, but the operation is not complete - e.g. the
    ///  socket would block, or a received packet was consumed internally.
    InProgress,
    /// A transport error; retransmission and blocking loops give up.
    Error,
}

/// This is an abstraction for sending a datagram, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, packet_buf: &[u8], to: SocketAddr) -> SocketState;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_to(&self, packet_buf: &[u8], to: SocketAddr) -> SocketState {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        match UdpSocket::send_to(self, packet_buf, to).await {
            Ok(_) => SocketState::Done,
            Err(e) if e.kind() == ErrorKind::WouldBlock => SocketState::InProgress,
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                SocketState::Error
            }
        }
    }
}
