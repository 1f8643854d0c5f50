use weft_core::types::{PacketNumber, PathId};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer acknowledged a packet number above anything we sent.
    #[error("ack references packet {largest_acked} above largest sent {largest_sent}")]
    AckForUnsentPacket {
        largest_acked: PacketNumber,
        largest_sent: PacketNumber,
    },
    #[error("packet number {0} is not increasing")]
    NonMonotonicPacketNumber(PacketNumber),
    #[error("too many outstanding sent packets")]
    TooManyOutstanding,
    #[error("unknown path {0}")]
    UnknownPath(PathId),
    #[error(transparent)]
    Codec(#[from] weft_core::codec::CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
