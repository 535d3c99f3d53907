use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::ProtocolError;
use crate::listener::ReceivePump;
use crate::packet::Packet;
use crate::rtt::RttEstimator;
use crate::socket::{DatagramSocket, SocketState};
use crate::wire::{ControlTag, Reliability, SequenceNr};

/// One retained outbound packet awaiting acknowledgement.
struct Store {
    sequence: SequenceNr,
    packet: Vec<u8>,
    /// When the packet was first sent. Never updated, so `creation_time`
    ///  measures the full time a packet has been in flight.
    creation_time: Instant,
    /// When the packet was last (re)transmitted.
    last_active: Instant,
}

impl Store {
    fn new(sequence: SequenceNr, packet: &Packet) -> Store {
        let now = Instant::now();
        Store {
            sequence,
            packet: packet.bytes().to_vec(),
            creation_time: now,
            last_active: now,
        }
    }

    fn should_send(&self, interval: Duration) -> bool {
        self.last_active.elapsed() > interval
    }

    fn reset_activity(&mut self) {
        self.last_active = Instant::now();
    }
}

struct ConnectionInner {
    // outbound sequence counters, one per discipline
    faf_out: SequenceNr,
    uid_out: SequenceNr,
    acknew_out: SequenceNr,
    seq_out: SequenceNr,

    /// Unacknowledged ordered packets, ascending by sequence. Only the head
    ///  is ever retransmitted, so packets leave in sequence order.
    ordered_out: VecDeque<Store>,
    /// Unacknowledged unordered packets, keyed by sequence.
    uids_out: BTreeMap<SequenceNr, Store>,
    /// The latest newest-only packet still in flight. Superseded by every
    ///  newer send of the same discipline.
    acknew_data: Option<Store>,

    /// Highest fire-and-forget sequence observed from the peer.
    faf_in: SequenceNr,
    /// Highest newest-only sequence observed from the peer.
    acknew_in: SequenceNr,
    /// Recently delivered unordered sequences by time of last observation.
    uids_in: FxHashMap<SequenceNr, Instant>,
    /// Recently delivered ordered sequences by time of last observation.
    seqs_in: FxHashMap<SequenceNr, Instant>,

    /// Packets awaiting pickup by the application.
    inbound: VecDeque<Packet>,

    rtt: RttEstimator,
    connected: bool,
}

impl ConnectionInner {
    fn new(config: &Config) -> ConnectionInner {
        ConnectionInner {
            faf_out: SequenceNr::ZERO,
            uid_out: SequenceNr::ZERO,
            acknew_out: SequenceNr::ZERO,
            seq_out: SequenceNr::ZERO,
            ordered_out: VecDeque::new(),
            uids_out: BTreeMap::new(),
            acknew_data: None,
            faf_in: SequenceNr::ZERO,
            acknew_in: SequenceNr::ZERO,
            uids_in: FxHashMap::default(),
            seqs_in: FxHashMap::default(),
            inbound: VecDeque::new(),
            rtt: RttEstimator::new(config.initial_rtt),
            connected: false,
        }
    }

    /// Returns true if `sequence` was already delivered for `discipline`,
    ///  updating the discipline's dedup state either way.
    fn handled(&mut self, discipline: Reliability, sequence: SequenceNr) -> bool {
        match discipline {
            Reliability::None => false,

            Reliability::Newest => {
                if sequence <= self.faf_in {
                    return true;
                }
                self.faf_in = sequence;
                false
            }

            Reliability::AckNewest => {
                if sequence <= self.acknew_in {
                    return true;
                }
                self.acknew_in = sequence;
                false
            }

            Reliability::Ack => Self::check_dedup(&mut self.uids_in, sequence),
            Reliability::Ordered => Self::check_dedup(&mut self.seqs_in, sequence),
        }
    }

    fn check_dedup(table: &mut FxHashMap<SequenceNr, Instant>, sequence: SequenceNr) -> bool {
        let now = Instant::now();
        if let Some(seen) = table.get_mut(&sequence) {
            *seen = now;
            return true;
        }
        table.insert(sequence, now);
        false
    }

    /// Drops the acknowledged packet from its discipline's container,
    ///  folding the measured round trip into the estimator.
    fn remove_outbound(
        &mut self,
        discipline: Reliability,
        sequence: SequenceNr,
    ) -> Result<(), ProtocolError> {
        match discipline {
            Reliability::None => return Err(ProtocolError::AckOnUnreliable),

            Reliability::Newest => {}

            Reliability::Ack => {
                if let Some(store) = self.uids_out.remove(&sequence) {
                    self.rtt.add_point(store.creation_time.elapsed());
                }
            }

            Reliability::AckNewest => {
                if self.acknew_out == sequence {
                    if let Some(store) = self.acknew_data.take() {
                        self.rtt.add_point(store.creation_time.elapsed());
                    }
                }
            }

            Reliability::Ordered => {
                if let Some(index) = self.ordered_out.iter().position(|s| s.sequence == sequence) {
                    if let Some(store) = self.ordered_out.remove(index) {
                        self.rtt.add_point(store.creation_time.elapsed());
                    }
                }
            }
        }
        Ok(())
    }

    /// Forgets dedup entries that have not been observed within the
    ///  retention window.
    fn prune(&mut self, age_threshold: Duration) {
        let now = Instant::now();
        self.seqs_in.retain(|_, seen| now.duration_since(*seen) < age_threshold);
        self.uids_in.retain(|_, seen| now.duration_since(*seen) < age_threshold);
    }
}

/// The reliability core for a single remote peer.
///
/// Owned by the [`crate::Listener`] that dispatches inbound datagrams to it;
///  shares the listener's socket for sending. All state is per peer: sequence
///  counters, in-flight retransmission stores, dedup tables, the inbound
///  queue and the round-trip estimator.
pub struct Connection {
    config: Arc<Config>,
    socket: Arc<dyn DatagramSocket>,
    remote_addr: SocketAddr,
    inner: Arc<RwLock<ConnectionInner>>,
}

impl Connection {
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        remote_addr: SocketAddr,
        config: Arc<Config>,
    ) -> Connection {
        let inner = ConnectionInner::new(&config);
        Connection {
            config,
            socket,
            remote_addr,
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub async fn connected(&self) -> bool {
        self.inner.read().await.connected
    }

    /// Number of packets retained for retransmission across all disciplines.
    pub async fn in_flight(&self) -> usize {
        let inner = self.inner.read().await;
        inner.ordered_out.len()
            + inner.uids_out.len()
            + if inner.acknew_data.is_some() { 1 } else { 0 }
    }

    /// Assigns a sequence to the packet according to its declared discipline,
    ///  retains a copy for retransmission where the discipline is reliable,
    ///  and transmits it.
    ///
    /// The packet must carry its control section up front: a type chunk and,
    ///  for sequenced disciplines, a sequence chunk whose value field is
    ///  overwritten here. Both cursors are restored before returning, so the
    ///  caller can reuse the packet.
    ///
    /// With `block` set, a send of a reliable discipline polls `pump` and
    ///  drives retransmission until the packet (for `AckNewest`: until the
    ///  newest packet of that discipline) is acknowledged, or until the
    ///  socket reports an error. There is no timeout - deciding when a peer
    ///  is gone is the host's call.
    pub async fn send(
        &self,
        packet: &mut Packet,
        block: bool,
        pump: &dyn ReceivePump,
    ) -> Result<SocketState, ProtocolError> {
        let read_pos = packet.read_pos();
        let write_pos = packet.write_pos();
        packet.rewind();

        // scan the control section for the declared discipline and the
        // reserved sequence field
        let mut discipline = Reliability::None;
        let mut sequence_offset = None;

        loop {
            match packet.try_get_tag()? {
                ControlTag::Eop => break,
                ControlTag::Type => discipline = packet.try_get_reliability()?,
                ControlTag::Sequence => {
                    sequence_offset = Some(packet.read_pos());
                    packet.try_get_sequence()?;
                    break;
                }
                tag => return Err(ProtocolError::UnexpectedTag(tag.into())),
            }
        }

        let mut inner = self.inner.write().await;
        let mut outbound_sequence = SequenceNr::ZERO;

        if discipline == Reliability::None {
            if sequence_offset.is_some() {
                return Err(ProtocolError::UnexpectedSequence);
            }
        } else {
            let offset = sequence_offset.ok_or(ProtocolError::SequenceNotReserved)?;
            packet.seek_write(offset);

            match discipline {
                Reliability::Newest => {
                    inner.faf_out = inner.faf_out.next();
                    outbound_sequence = inner.faf_out;
                    packet.put_sequence(outbound_sequence);
                }

                Reliability::Ack => {
                    inner.uid_out = inner.uid_out.next();
                    outbound_sequence = inner.uid_out;
                    packet.put_sequence(outbound_sequence);
                    inner.uids_out.insert(outbound_sequence, Store::new(outbound_sequence, packet));
                }

                Reliability::AckNewest => {
                    inner.acknew_out = inner.acknew_out.next();
                    outbound_sequence = inner.acknew_out;
                    packet.put_sequence(outbound_sequence);
                    inner.acknew_data = Some(Store::new(outbound_sequence, packet));
                }

                Reliability::Ordered => {
                    inner.seq_out = inner.seq_out.next();
                    outbound_sequence = inner.seq_out;
                    packet.put_sequence(outbound_sequence);
                    inner.ordered_out.push_back(Store::new(outbound_sequence, packet));
                }

                Reliability::None => unreachable!("filtered above"),
            }

            trace!("assigned {:?} sequence #{} for {:?}", discipline, outbound_sequence, self.remote_addr);
        }

        let result = self.socket.send_to(packet.bytes(), self.remote_addr).await;

        packet.seek_read(read_pos);
        packet.seek_write(write_pos);

        if !block || result != SocketState::Done {
            return Ok(result);
        }
        drop(inner);

        match discipline {
            Reliability::None | Reliability::Newest => Ok(result),

            Reliability::Ack => {
                self.block_until(pump, |inner| !inner.uids_out.contains_key(&outbound_sequence)).await
            }

            // NB: acknew_data may also become empty because a *later* send of
            //  this discipline superseded ours and was acknowledged; the loop
            //  still exits, reporting success for a packet that was replaced
            Reliability::AckNewest => {
                self.block_until(pump, |inner| inner.acknew_data.is_none()).await
            }

            Reliability::Ordered => {
                self.block_until(pump, |inner| {
                    inner.ordered_out.iter().all(|s| s.sequence != outbound_sequence)
                })
                .await
            }
        }
    }

    async fn block_until(
        &self,
        pump: &dyn ReceivePump,
        cleared: impl Fn(&ConnectionInner) -> bool,
    ) -> Result<SocketState, ProtocolError> {
        loop {
            if cleared(&*self.inner.read().await) {
                return Ok(SocketState::Done);
            }

            if pump.receive(true, self.config.pump_timeout).await == SocketState::Error {
                return Ok(SocketState::Error);
            }

            self.update().await;
            sleep(self.config.block_poll_interval).await;
        }
    }

    /// Processes one received datagram: applies acknowledgements, answers
    ///  handshake packets, acknowledges and deduplicates reliable data, and
    ///  enqueues the packet for [`Connection::pop`].
    ///
    /// Returns `InProgress` when the packet was consumed internally (a
    ///  handshake packet, or a duplicate delivery), `Done` when it was
    ///  enqueued for the application.
    pub async fn store_inbound(&self, mut packet: Packet) -> Result<SocketState, ProtocolError> {
        let mut discipline = Reliability::None;
        let mut packet_sequence = None;

        let mut inner = self.inner.write().await;

        loop {
            match packet.try_get_tag()? {
                ControlTag::Eop => break,

                ControlTag::Type => {
                    if discipline != Reliability::None {
                        return Err(ProtocolError::DuplicateType);
                    }
                    discipline = packet.try_get_reliability()?;
                }

                ControlTag::Connect => {
                    debug!("received connect from {:?}", self.remote_addr);
                    inner.connected = true;
                    self.socket.send_to(Packet::connected().bytes(), self.remote_addr).await;
                    return Ok(SocketState::InProgress);
                }

                ControlTag::Connected => {
                    debug!("peer {:?} confirmed the connection", self.remote_addr);
                    inner.connected = true;
                    return Ok(SocketState::InProgress);
                }

                ControlTag::BadVersion => {
                    warn!("peer {:?} rejected our protocol version", self.remote_addr);
                    return Ok(SocketState::InProgress);
                }

                ControlTag::Sequence => {
                    if discipline == Reliability::None {
                        return Err(ProtocolError::SequenceWithoutType);
                    }
                    packet_sequence = Some(packet.try_get_sequence()?);
                }

                ControlTag::Ack => {
                    let acked_discipline = packet.try_get_reliability()?;
                    let acked_sequence = packet.try_get_sequence()?;
                    trace!("peer {:?} acknowledged {:?} #{}", self.remote_addr, acked_discipline, acked_sequence);
                    inner.remove_outbound(acked_discipline, acked_sequence)?;
                }
            }
        }

        if discipline != Reliability::None && discipline != Reliability::Newest {
            let sequence = packet_sequence.ok_or(ProtocolError::MissingSequence)?;

            self.socket
                .send_to(Packet::ack(discipline, sequence).bytes(), self.remote_addr)
                .await;

            if inner.handled(discipline, sequence) {
                trace!("duplicate {:?} #{} from {:?} - delivery suppressed", discipline, sequence, self.remote_addr);
                return Ok(SocketState::InProgress);
            }
        }

        inner.inbound.push_back(packet);
        Ok(SocketState::Done)
    }

    /// Drives retransmission and dedup-table maintenance. Called periodically
    ///  by the host and from within blocking send loops.
    ///
    /// Retransmits every due unordered packet, the due newest-only packet,
    ///  but only the *head* of the ordered queue - at most one ordered packet
    ///  per pass, keeping the wire in sequence order. Every retransmission
    ///  folds the packet's total time in flight into the estimator, growing
    ///  the retransmit interval under sustained loss.
    pub async fn update(&self) {
        let mut inner = self.inner.write().await;
        inner.prune(self.config.age_threshold);

        let interval = inner.rtt.mean();

        let ConnectionInner { ordered_out, uids_out, acknew_data, rtt, .. } = &mut *inner;

        if let Some(store) = ordered_out.front_mut() {
            Self::retransmit_if_due(store, interval, rtt, self.socket.as_ref(), self.remote_addr).await;
        }

        for store in uids_out.values_mut() {
            Self::retransmit_if_due(store, interval, rtt, self.socket.as_ref(), self.remote_addr).await;
        }

        if let Some(store) = acknew_data {
            Self::retransmit_if_due(store, interval, rtt, self.socket.as_ref(), self.remote_addr).await;
        }
    }

    async fn retransmit_if_due(
        store: &mut Store,
        interval: Duration,
        rtt: &mut RttEstimator,
        socket: &dyn DatagramSocket,
        remote_addr: SocketAddr,
    ) {
        if !store.should_send(interval) {
            return;
        }

        trace!("retransmitting #{} to {:?}", store.sequence, remote_addr);
        rtt.add_point(store.creation_time.elapsed());
        socket.send_to(&store.packet, remote_addr).await;
        store.reset_activity();
    }

    /// Takes the next packet off the inbound queue, if any. The packet's read
    ///  cursor is positioned at the start of the application payload.
    pub async fn pop(&self) -> Option<Packet> {
        self.inner.write().await.inbound.pop_front()
    }
}
