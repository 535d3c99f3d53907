use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Display, Formatter};

/// One-byte tag introducing each control chunk of a packet.
///
/// The control section of a packet is a sequence of tagged chunks terminated
///  by [`ControlTag::Eop`]; application payload follows the terminator and is
///  never inspected by this layer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlTag {
    /// End of the control section.
    Eop = 0,
    /// Carries the packet's delivery discipline.
    Type = 1,
    /// Carries the packet's sequence number. The sender reserves this field
    ///  with a placeholder; the connection assigns the real value on send.
    Sequence = 2,
    /// Carries a `(discipline, sequence)` pair acknowledging a prior packet.
    Ack = 3,
    Connect = 4,
    Connected = 5,
    BadVersion = 6,
}

/// Delivery discipline of a packet. Each discipline has its own sequence
///  space and its own reliability guarantees.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Reliability {
    /// Unreliable and unsequenced.
    None = 0,
    /// Sequenced fire-and-forget; the receiver keeps only the newest.
    Newest = 1,
    /// Reliable, unordered; every delivery acknowledged exactly once.
    Ack = 2,
    /// Reliable; only the newest outstanding packet is retained.
    AckNewest = 3,
    /// Reliable, FIFO per sender.
    Ordered = 4,
}

/// Sequence number scoped to one discipline on one side of a connection.
///
/// Dense and monotonically increasing within a connection lifetime; `0` means
///  "nothing assigned / observed yet", the first assigned value is `1`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNr(u32);

impl SequenceNr {
    pub const ZERO: SequenceNr = SequenceNr(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SequenceNr {
        SequenceNr(
            self.0.checked_add(1)
                .expect("sequence space exhausted"),
        )
    }
}

impl Display for SequenceNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::eop(0, Some(ControlTag::Eop))]
    #[case::type_chunk(1, Some(ControlTag::Type))]
    #[case::sequence(2, Some(ControlTag::Sequence))]
    #[case::ack(3, Some(ControlTag::Ack))]
    #[case::connect(4, Some(ControlTag::Connect))]
    #[case::connected(5, Some(ControlTag::Connected))]
    #[case::bad_version(6, Some(ControlTag::BadVersion))]
    #[case::unknown(7, None)]
    #[case::far_out(0xff, None)]
    fn test_control_tag_from_wire(#[case] raw: u8, #[case] expected: Option<ControlTag>) {
        assert_eq!(ControlTag::try_from(raw).ok(), expected);
        if let Some(tag) = expected {
            assert_eq!(u8::from(tag), raw);
        }
    }

    #[rstest]
    #[case::none(0, Some(Reliability::None))]
    #[case::newest(1, Some(Reliability::Newest))]
    #[case::ack(2, Some(Reliability::Ack))]
    #[case::ack_newest(3, Some(Reliability::AckNewest))]
    #[case::ordered(4, Some(Reliability::Ordered))]
    #[case::unknown(5, None)]
    fn test_reliability_from_wire(#[case] raw: u8, #[case] expected: Option<Reliability>) {
        assert_eq!(Reliability::try_from(raw).ok(), expected);
        if let Some(discipline) = expected {
            assert_eq!(u8::from(discipline), raw);
        }
    }

    #[test]
    fn test_sequence_nr_next() {
        let mut seq = SequenceNr::ZERO;
        for expected in 1..=3u32 {
            seq = seq.next();
            assert_eq!(seq, SequenceNr::from_raw(expected));
        }
        assert!(SequenceNr::from_raw(7) < SequenceNr::from_raw(8));
    }
}
