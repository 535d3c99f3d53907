//! A reliability layer on top of UDP, multiplexing several delivery
//!  disciplines onto a single datagram channel per remote peer.
//!
//! ## Design goals
//!
//! * One UDP socket serves any number of peers; per-peer state lives in a
//!   [`Connection`] owned by the [`Listener`] and keyed by remote address
//! * The abstraction is sending / receiving *packets* (defined-length chunks
//!   of data as opposed to streams of bytes)
//! * Applications choose per packet how much reliability they pay for:
//!   * `None` - plain datagram semantics, no sequence at all
//!   * `Newest` - sequenced fire-and-forget, receiver keeps only the newest
//!   * `Ack` - every packet acknowledged and retransmitted until it is
//!   * `AckNewest` - acknowledged, but only the newest outstanding packet is
//!      retained for retransmission; older ones are superseded
//!   * `Ordered` - acknowledged, retransmitted strictly head-first so packets
//!      leave the sender in sequence order
//! * Retransmission timing adapts to the observed round-trip time; under
//!   loss the estimate grows, widening the retransmit interval
//! * Duplicated and reordered datagrams are absorbed by per-discipline
//!   dedup state on the receiver
//! * No congestion control, flow control or encryption - this layer does
//!   reliability and nothing else
//!
//! ## Wire format
//!
//! Every datagram is a sequence of one-byte-tagged control chunks followed by
//! opaque application payload. All sequence numbers are u32 little-endian.
//!
//! ```ascii
//! 0: tag (u8):
//!    * 0 EOP         no payload; ends the control section, application
//!                     payload (if any) follows this byte
//!    * 1 TYPE        one discipline byte (0 none, 1 newest, 2 ack,
//!                     3 ack-newest, 4 ordered)
//!    * 2 SEQUENCE    one sequence number; reserved by the sender as a
//!                     placeholder and assigned by the connection on send
//!    * 3 ACK         one discipline byte + one sequence number
//!    * 4 CONNECT     no payload; requests a CONNECTED reply
//!    * 5 CONNECTED   no payload
//!    * 6 BAD_VERSION no payload
//! ```
//!
//! A reliable data packet is `[TYPE d] [SEQUENCE n] [EOP] payload...`, an
//! acknowledgement is `[ACK d n] [EOP]`, and the handshake packets are a
//! single tag followed by `[EOP]`.
//!
//! ## Driving the protocol
//!
//! The layer is cooperative: the host calls [`Listener::receive`] to pump one
//! inbound datagram and [`Connection::update`] (or [`Listener::update`])
//! periodically to drive retransmission. A blocking [`Connection::send`]
//! performs both itself until the packet is acknowledged, so a host may also
//! simply block on sends.

mod config;
mod connection;
mod error;
mod listener;
mod packet;
mod rtt;
mod socket;
mod wire;

pub use config::Config;
pub use connection::Connection;
pub use error::ProtocolError;
pub use listener::{Listener, ReceivePump};
pub use packet::Packet;
pub use socket::{DatagramSocket, SocketState};
pub use wire::{ControlTag, Reliability, SequenceNr};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
