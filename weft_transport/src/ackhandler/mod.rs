//! Per-path packet accounting: what went out, what came back.

use std::time::Instant;

use weft_core::types::frame::Frame;
use weft_core::types::{ByteCount, EncryptionLevel, PacketNumber, PathId};

pub mod received_packet_handler;
pub mod sent_packet_handler;

pub use received_packet_handler::ReceivedPacketHandler;
pub use sent_packet_handler::SentPacketHandler;

/// Record of a packet handed to a path's socket.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_number: PacketNumber,
    pub path_id: PathId,
    /// Frames retained for retransmission.
    pub frames: Vec<Frame>,
    /// Sealed length in bytes.
    pub length: ByteCount,
    pub encryption_level: EncryptionLevel,
    pub send_time: Instant,
    /// Whether a successful peer-path copy allows this record to be
    /// forgotten.
    pub dup_droppable: bool,
}

impl Packet {
    pub fn is_retransmittable(&self) -> bool {
        self.frames.iter().any(|f| f.is_retransmittable())
    }

    /// Frames that must be re-sent if the packet is deemed lost.
    pub fn frames_for_retransmission(&self) -> Vec<Frame> {
        self.frames
            .iter()
            .filter(|f| f.is_retransmittable())
            .cloned()
            .collect()
    }

    /// Frames eligible for re-sealing on another path, or `None` when the
    /// packet carries no stream data worth duplicating.
    pub fn copy_frames(&self) -> Option<Vec<Frame>> {
        let frames: Vec<Frame> = self
            .frames
            .iter()
            .filter(|f| f.is_duplicable())
            .cloned()
            .collect();
        if frames.iter().any(|f| matches!(f, Frame::Stream { .. })) {
            Some(frames)
        } else {
            None
        }
    }

    /// A packet may be dropped once a copy is acked iff no retransmittable
    /// frame would be lost by forgetting it.
    pub fn dup_droppable_frames(frames: &[Frame]) -> bool {
        frames.iter().any(|f| matches!(f, Frame::Stream { .. }))
            && frames
                .iter()
                .filter(|f| f.is_retransmittable())
                .all(|f| f.is_duplicable())
    }

    pub fn stream_frame_length(&self) -> ByteCount {
        self.frames.iter().map(|f| f.stream_len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bytes::ByteBuf;
    use std::time::Duration;
    use weft_core::types::frame::AckFrame;

    fn stream_frame(len: usize) -> Frame {
        Frame::Stream {
            stream_id: 1,
            offset: 0,
            data: ByteBuf::from(vec![0u8; len]),
            fin: false,
        }
    }

    fn packet(frames: Vec<Frame>) -> Packet {
        let dup_droppable = Packet::dup_droppable_frames(&frames);
        Packet {
            packet_number: 1,
            path_id: 1,
            frames,
            length: 100,
            encryption_level: EncryptionLevel::ForwardSecure,
            send_time: Instant::now(),
            dup_droppable,
        }
    }

    #[test]
    fn stream_packets_are_droppable() {
        let pkt = packet(vec![stream_frame(64), Frame::Ping]);
        assert!(pkt.dup_droppable);
        assert_eq!(pkt.copy_frames().unwrap().len(), 2);
        assert_eq!(pkt.stream_frame_length(), 64);
    }

    #[test]
    fn control_only_packets_are_not_duplicated() {
        let ack = Frame::Ack(AckFrame {
            largest_acked: 3,
            lowest_acked: 1,
            ranges: Vec::new(),
            delay_time: Duration::ZERO,
        });
        let pkt = packet(vec![ack, Frame::Ping]);
        assert!(!pkt.dup_droppable);
        assert!(pkt.copy_frames().is_none());
    }

    #[test]
    fn path_bound_frames_block_droppability() {
        let pkt = packet(vec![stream_frame(8), Frame::ClosePath { path_id: 2 }]);
        // The stream bytes may be copied, but the record must survive for
        // the CLOSE_PATH frame.
        assert!(!pkt.dup_droppable);
        assert!(pkt.copy_frames().is_some());
    }

    #[test]
    fn retransmission_drops_ack_state() {
        let ack = Frame::Ack(AckFrame {
            largest_acked: 3,
            lowest_acked: 1,
            ranges: Vec::new(),
            delay_time: Duration::ZERO,
        });
        let pkt = packet(vec![stream_frame(8), ack]);
        let retrans = pkt.frames_for_retransmission();
        assert_eq!(retrans.len(), 1);
        assert!(matches!(retrans[0], Frame::Stream { .. }));
    }
}
