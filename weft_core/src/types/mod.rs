use serde::{Deserialize, Serialize};

pub mod frame;

/// Identifier of a network path within a session.
///
/// Path 0 is the bootstrap path used to establish the session; it is kept
/// out of multipath scheduling once additional paths exist.
pub type PathId = u8;

/// Per-path, monotonically increasing packet number.
pub type PacketNumber = u64;

/// Byte counts for windows, in-flight accounting and frame sizes.
pub type ByteCount = u64;

/// The bootstrap path.
pub const INITIAL_PATH_ID: PathId = 0;

/// Sender maximum segment size used for congestion window arithmetic.
pub const DEFAULT_TCP_MSS: ByteCount = 1460;

/// Upper bound for a sealed packet payload, in bytes.
pub const MAX_PACKET_SIZE: usize = 1350;

/// Encryption level a packet was sealed under. Anything below forward
/// secure counts as handshake data for retransmission purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionLevel {
    Unencrypted,
    Secure,
    ForwardSecure,
}
