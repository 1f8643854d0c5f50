pub mod codec;
pub mod types;

pub use types::{ByteCount, EncryptionLevel, PacketNumber, PathId};
