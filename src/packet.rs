use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::wire::{ControlTag, Reliability, SequenceNr};

/// A packet buffer with independent read and write cursors.
///
/// Reads are checked and fail with [`ProtocolError::Truncated`] instead of
///  panicking, since inbound packets come straight off the wire. Writes at
///  the end of the buffer append; writes behind the end overwrite in place,
///  which is how the connection assigns the real sequence number into the
///  placeholder the application reserved.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    data: BytesMut,
    read_pos: usize,
    write_pos: usize,
}

impl Packet {
    pub fn new() -> Packet {
        Packet::default()
    }

    /// Wraps the bytes of a received datagram; the read cursor starts at the
    ///  first byte, the write cursor after the last.
    pub fn from_datagram(bytes: &[u8]) -> Packet {
        Packet {
            data: BytesMut::from(bytes),
            read_pos: 0,
            write_pos: bytes.len(),
        }
    }

    /// A reliable (or deliberately unreliable) data packet: type chunk,
    ///  sequence placeholder for sequenced disciplines, terminator. Append
    ///  payload with [`Packet::put_payload`] afterwards.
    pub fn message(discipline: Reliability) -> Packet {
        let mut packet = Packet::new();
        packet.put_tag(ControlTag::Type);
        packet.put_reliability(discipline);
        if discipline != Reliability::None {
            packet.put_tag(ControlTag::Sequence);
            packet.put_sequence(SequenceNr::ZERO);
        }
        packet.put_tag(ControlTag::Eop);
        packet
    }

    pub fn connect() -> Packet {
        Self::control(ControlTag::Connect)
    }

    pub fn connected() -> Packet {
        Self::control(ControlTag::Connected)
    }

    pub fn bad_version() -> Packet {
        Self::control(ControlTag::BadVersion)
    }

    pub(crate) fn ack(discipline: Reliability, sequence: SequenceNr) -> Packet {
        let mut packet = Packet::new();
        packet.put_tag(ControlTag::Ack);
        packet.put_reliability(discipline);
        packet.put_sequence(sequence);
        packet.put_tag(ControlTag::Eop);
        packet
    }

    fn control(tag: ControlTag) -> Packet {
        let mut packet = Packet::new();
        packet.put_tag(tag);
        packet.put_tag(ControlTag::Eop);
        packet
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The full serialized content, independent of either cursor.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// The bytes after the read cursor - once the control section has been
    ///  scanned, this is the application payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.read_pos.min(self.data.len())..]
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub fn seek_read(&mut self, pos: usize) {
        debug_assert!(pos <= self.data.len());
        self.read_pos = pos;
    }

    pub fn seek_write(&mut self, pos: usize) {
        debug_assert!(pos <= self.data.len());
        self.write_pos = pos;
    }

    /// Moves both cursors back to the start of the buffer.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put_slice_at_cursor(&[value]);
    }

    pub fn put_tag(&mut self, tag: ControlTag) {
        self.put_u8(tag.into());
    }

    pub fn put_reliability(&mut self, discipline: Reliability) {
        self.put_u8(discipline.into());
    }

    pub fn put_sequence(&mut self, sequence: SequenceNr) {
        self.put_slice_at_cursor(&sequence.to_raw().to_le_bytes());
    }

    pub fn put_payload(&mut self, bytes: &[u8]) {
        self.put_slice_at_cursor(bytes);
    }

    pub fn try_get_u8(&mut self) -> Result<u8, ProtocolError> {
        let value = *self.data.get(self.read_pos).ok_or(ProtocolError::Truncated)?;
        self.read_pos += 1;
        Ok(value)
    }

    pub fn try_get_tag(&mut self) -> Result<ControlTag, ProtocolError> {
        let raw = self.try_get_u8()?;
        ControlTag::try_from(raw).map_err(|_| ProtocolError::UnknownTag(raw))
    }

    pub fn try_get_reliability(&mut self) -> Result<Reliability, ProtocolError> {
        let raw = self.try_get_u8()?;
        Reliability::try_from(raw).map_err(|_| ProtocolError::UnknownReliability(raw))
    }

    pub fn try_get_sequence(&mut self) -> Result<SequenceNr, ProtocolError> {
        let end = self.read_pos + size_of::<u32>();
        let bytes = self.data.get(self.read_pos..end).ok_or(ProtocolError::Truncated)?;
        let raw = u32::from_le_bytes(bytes.try_into().expect("slice of exactly four bytes"));
        self.read_pos = end;
        Ok(SequenceNr::from_raw(raw))
    }

    /// Writes at the write cursor: bytes behind the end of the buffer are
    ///  overwritten in place, the remainder is appended.
    fn put_slice_at_cursor(&mut self, bytes: &[u8]) {
        let end = self.write_pos + bytes.len();
        let overlap = self.data.len().min(end) - self.write_pos.min(self.data.len());
        self.data[self.write_pos..self.write_pos + overlap].copy_from_slice(&bytes[..overlap]);
        self.data.put_slice(&bytes[overlap..]);
        self.write_pos = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_cursors_are_independent() {
        let mut packet = Packet::new();
        packet.put_u8(1);
        packet.put_u8(2);
        packet.put_u8(3);

        assert_eq!(packet.write_pos(), 3);
        assert_eq!(packet.read_pos(), 0);

        assert_eq!(packet.try_get_u8(), Ok(1));
        assert_eq!(packet.read_pos(), 1);
        assert_eq!(packet.write_pos(), 3);
    }

    #[test]
    fn test_overwrite_in_place() {
        let mut packet = Packet::new();
        packet.put_u8(9);
        packet.put_sequence(SequenceNr::ZERO);
        packet.put_u8(7);

        packet.seek_write(1);
        packet.put_sequence(SequenceNr::from_raw(0x0403_0201));

        assert_eq!(packet.bytes(), &[9, 1, 2, 3, 4, 7]);
        assert_eq!(packet.write_pos(), 5);
    }

    #[test]
    fn test_overwrite_spanning_the_end_appends() {
        let mut packet = Packet::new();
        packet.put_u8(1);
        packet.put_u8(2);

        packet.seek_write(1);
        packet.put_payload(&[8, 9]);

        assert_eq!(packet.bytes(), &[1, 8, 9]);
    }

    #[test]
    fn test_sequence_round_trip_little_endian() {
        let mut packet = Packet::new();
        packet.put_sequence(SequenceNr::from_raw(0x1234_5678));

        assert_eq!(packet.bytes(), &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(packet.try_get_sequence(), Ok(SequenceNr::from_raw(0x1234_5678)));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::partial_sequence(vec![2, 1, 2])]
    fn test_truncated_reads(#[case] bytes: Vec<u8>) {
        let mut packet = Packet::from_datagram(&bytes);
        if !bytes.is_empty() {
            assert_eq!(packet.try_get_tag(), Ok(ControlTag::Sequence));
        }
        assert_eq!(packet.try_get_sequence(), Err(ProtocolError::Truncated));
    }

    #[test]
    fn test_unknown_tag_and_discipline() {
        let mut packet = Packet::from_datagram(&[250, 99]);
        assert_eq!(packet.try_get_tag(), Err(ProtocolError::UnknownTag(250)));
        assert_eq!(packet.try_get_reliability(), Err(ProtocolError::UnknownReliability(99)));
    }

    #[rstest]
    #[case::unreliable(Reliability::None, vec![1, 0, 0])]
    #[case::ack(Reliability::Ack, vec![1, 2, 2, 0, 0, 0, 0, 0])]
    #[case::ordered(Reliability::Ordered, vec![1, 4, 2, 0, 0, 0, 0, 0])]
    fn test_message_layout(#[case] discipline: Reliability, #[case] expected: Vec<u8>) {
        let mut packet = Packet::message(discipline);
        packet.put_payload(b"xy");

        let mut with_payload = expected.clone();
        with_payload.extend_from_slice(b"xy");
        assert_eq!(packet.bytes(), with_payload.as_slice());
    }

    #[test]
    fn test_control_packet_layouts() {
        assert_eq!(Packet::connect().bytes(), &[4, 0]);
        assert_eq!(Packet::connected().bytes(), &[5, 0]);
        assert_eq!(Packet::bad_version().bytes(), &[6, 0]);
        assert_eq!(
            Packet::ack(Reliability::Ordered, SequenceNr::from_raw(258)).bytes(),
            &[3, 4, 2, 1, 0, 0, 0],
        );
    }

    #[test]
    fn test_payload_follows_read_cursor() {
        let mut packet = Packet::from_datagram(&[1, 0, 0, b'h', b'i']);
        assert_eq!(packet.try_get_tag(), Ok(ControlTag::Type));
        assert_eq!(packet.try_get_reliability(), Ok(Reliability::None));
        assert_eq!(packet.try_get_tag(), Ok(ControlTag::Eop));
        assert_eq!(packet.payload(), b"hi");
    }
}
