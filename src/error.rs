use thiserror::Error;

/// A violation of the wire contract by the peer (or by the application
///  assembling an outbound packet).
///
/// These are fatal for the operation that detected them: the reliability
///  layer recovers from loss, duplication and reordering, but a malformed
///  chunk stream points to a peer bug or a version mismatch. Hosts are
///  expected to drop the offending connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet ends in the middle of a control chunk")]
    Truncated,
    #[error("unknown control tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unknown delivery discipline {0:#04x}")]
    UnknownReliability(u8),
    #[error("misplaced control tag {0:#04x}")]
    UnexpectedTag(u8),
    #[error("more than one type chunk in a packet")]
    DuplicateType,
    #[error("sequence specified in non-sequenced packet")]
    UnexpectedSequence,
    #[error("sequence offset was not reserved")]
    SequenceNotReserved,
    #[error("sequence chunk without a preceding type chunk")]
    SequenceWithoutType,
    #[error("sequenced packet carries no sequence chunk")]
    MissingSequence,
    #[error("acknowledgement for an unreliable discipline")]
    AckOnUnreliable,
}
