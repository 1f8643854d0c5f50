//! Seals frames into packets under a path's packet numbering.

use std::collections::HashMap;

use bytes::Bytes;

use weft_core::codec;
use weft_core::types::frame::Frame;
use weft_core::types::{EncryptionLevel, PacketNumber, PathId, MAX_PACKET_SIZE};

use crate::ackhandler::Packet;
use crate::error::Result;
use crate::framer::StreamFramer;
use crate::path::Path;

/// A sealed packet ready for the socket.
#[derive(Debug, Clone)]
pub struct PackedPacket {
    pub number: PacketNumber,
    pub raw: Bytes,
    pub frames: Vec<Frame>,
    pub encryption_level: EncryptionLevel,
}

#[derive(Debug, Default)]
pub struct Packer {
    /// Control frames queued per path for the next packet.
    control_queues: HashMap<PathId, Vec<Frame>>,
    /// Per-path packet numbering, starting at 1.
    last_packet_number: HashMap<PathId, PacketNumber>,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_control_frame(&mut self, frame: Frame, path_id: PathId) {
        self.control_queues.entry(path_id).or_default().push(frame);
    }

    fn next_packet_number(&mut self, path_id: PathId) -> PacketNumber {
        let entry = self.last_packet_number.entry(path_id).or_insert(0);
        *entry += 1;
        *entry
    }

    fn seal(
        &mut self,
        frames: Vec<Frame>,
        path_id: PathId,
        encryption_level: EncryptionLevel,
    ) -> Result<PackedPacket> {
        let raw = codec::encode_frames(&frames)?;
        Ok(PackedPacket {
            number: self.next_packet_number(path_id),
            raw: Bytes::from(raw),
            frames,
            encryption_level,
        })
    }

    /// Pack queued control frames plus as much stream data as fits, or
    /// `None` when there is nothing to send on this path.
    pub fn pack_packet(
        &mut self,
        path: &Path,
        framer: &mut StreamFramer,
    ) -> Result<Option<PackedPacket>> {
        let mut frames = self.control_queues.remove(&path.path_id).unwrap_or_default();
        let used: usize = frames.iter().map(|f| f.wire_size_hint()).sum();
        frames.extend(framer.pop_frames(MAX_PACKET_SIZE.saturating_sub(used)));
        if frames.is_empty() {
            return Ok(None);
        }
        self.seal(frames, path.path_id, EncryptionLevel::ForwardSecure)
            .map(Some)
    }

    /// Pack only the queued control frames. Used for ACK-only emissions and
    /// pings; returns `None` when nothing is queued.
    pub fn pack_control_packet(&mut self, path: &Path) -> Result<Option<PackedPacket>> {
        let frames = self.control_queues.remove(&path.path_id).unwrap_or_default();
        if frames.is_empty() {
            return Ok(None);
        }
        self.seal(frames, path.path_id, EncryptionLevel::ForwardSecure)
            .map(Some)
    }

    /// Re-pack a handshake packet's frames under the chosen path, keeping
    /// its original encryption level.
    pub fn pack_handshake_retransmission(
        &mut self,
        packet: &Packet,
        path: &Path,
    ) -> Result<PackedPacket> {
        let mut frames = self.control_queues.remove(&path.path_id).unwrap_or_default();
        frames.extend(packet.frames_for_retransmission());
        self.seal(frames, path.path_id, packet.encryption_level)
    }

    /// Seal a redundant copy of `frames` under `path`'s own numbering.
    pub fn seal_copy(&mut self, frames: Vec<Frame>, path: &Path) -> Result<PackedPacket> {
        self.seal(frames, path.path_id, EncryptionLevel::ForwardSecure)
    }
}
