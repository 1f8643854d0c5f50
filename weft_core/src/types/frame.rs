use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::types::{PacketNumber, PathId};

/// Acknowledgement carried inside a [`Frame::Ack`].
///
/// `ranges` holds inclusive `(start, end)` runs of acked packet numbers in
/// ascending order. An empty list means everything between `lowest_acked`
/// and `largest_acked` is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub largest_acked: PacketNumber,
    pub lowest_acked: PacketNumber,
    pub ranges: Vec<(PacketNumber, PacketNumber)>,
    /// Time the receiver held the ACK back before sending it.
    pub delay_time: Duration,
}

impl AckFrame {
    /// Whether `packet_number` is acknowledged by this frame.
    pub fn covers(&self, packet_number: PacketNumber) -> bool {
        if self.ranges.is_empty() {
            return packet_number >= self.lowest_acked && packet_number <= self.largest_acked;
        }
        self.ranges
            .iter()
            .any(|&(start, end)| packet_number >= start && packet_number <= end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Stream {
        stream_id: u32,
        offset: u64,
        data: ByteBuf,
        fin: bool,
    },
    Ack(AckFrame),
    StopWaiting {
        least_unacked: PacketNumber,
    },
    WindowUpdate {
        stream_id: u32,
        byte_offset: u64,
    },
    Ping,
    ClosePath {
        path_id: PathId,
    },
    AddAddress {
        addr: String,
    },
    Paths {
        path_ids: Vec<PathId>,
    },
}

impl Frame {
    /// ACK and stop-waiting frames are regenerated, never retransmitted.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::StopWaiting { .. })
    }

    /// Whether the frame may be re-sealed on another path as a redundant
    /// copy. Acknowledgement state and path control are per-path.
    pub fn is_duplicable(&self) -> bool {
        matches!(
            self,
            Frame::Stream { .. } | Frame::WindowUpdate { .. } | Frame::Ping
        )
    }

    /// Stream payload carried by this frame.
    pub fn stream_len(&self) -> u64 {
        match self {
            Frame::Stream { data, .. } => data.len() as u64,
            _ => 0,
        }
    }

    /// Rough sealed size, used by the packer to bound packet payloads.
    pub fn wire_size_hint(&self) -> usize {
        match self {
            Frame::Stream { data, .. } => data.len() + 16,
            Frame::Ack(ack) => 24 + ack.ranges.len() * 16,
            Frame::AddAddress { addr } => addr.len() + 8,
            Frame::Paths { path_ids } => path_ids.len() + 8,
            _ => 16,
        }
    }
}
