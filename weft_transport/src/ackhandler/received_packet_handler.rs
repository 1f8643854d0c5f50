//! Tracks packet numbers received on a path and builds the ACK frames to
//! send back.

use std::collections::BTreeSet;
use std::time::Duration;

use weft_core::types::frame::{AckFrame, Frame};
use weft_core::types::{ByteCount, PacketNumber, PathId};

#[derive(Debug)]
pub struct ReceivedPacketHandler {
    path_id: PathId,
    /// Numbers received and not yet released by a peer stop-waiting.
    received: BTreeSet<PacketNumber>,
    /// Everything at or below this is settled; arrivals there are stale
    /// duplicates.
    lower_limit: PacketNumber,
    largest_observed: PacketNumber,
    /// New ack-eliciting data arrived since the last emitted ACK frame.
    ack_queued: bool,
    close_path_requested: bool,

    packets_received: u64,
    bytes_received: ByteCount,
}

impl ReceivedPacketHandler {
    pub fn new(path_id: PathId) -> Self {
        Self {
            path_id,
            received: BTreeSet::new(),
            lower_limit: 0,
            largest_observed: 0,
            ack_queued: false,
            close_path_requested: false,
            packets_received: 0,
            bytes_received: 0,
        }
    }

    /// Record an arriving packet. Duplicates are suppressed.
    pub fn received_packet(
        &mut self,
        packet_number: PacketNumber,
        should_instigate_ack: bool,
        length: ByteCount,
    ) {
        if packet_number <= self.lower_limit || self.received.contains(&packet_number) {
            return;
        }
        self.received.insert(packet_number);
        self.packets_received += 1;
        self.bytes_received += length;
        if packet_number > self.largest_observed {
            self.largest_observed = packet_number;
        }
        if should_instigate_ack {
            self.ack_queued = true;
        }
    }

    /// Peer stop-waiting: it will never retransmit anything below
    /// `least_unacked`, so that range can be forgotten.
    pub fn set_lower_limit(&mut self, least_unacked: PacketNumber) {
        let limit = least_unacked.saturating_sub(1);
        if limit <= self.lower_limit {
            return;
        }
        self.lower_limit = limit;
        self.received = self.received.split_off(&least_unacked);
    }

    /// The ACK frame to send, or `None` when nothing new arrived since the
    /// last emission.
    pub fn get_ack_frame(&mut self) -> Option<AckFrame> {
        if !self.ack_queued {
            return None;
        }
        let largest = self.received.iter().next_back().copied()?;
        let lowest = self.received.iter().next().copied()?;

        let mut ranges: Vec<(PacketNumber, PacketNumber)> = Vec::new();
        for &pn in self.received.iter() {
            match ranges.last_mut() {
                Some((_, end)) if pn == *end + 1 => *end = pn,
                _ => ranges.push((pn, pn)),
            }
        }

        self.ack_queued = false;
        Some(AckFrame {
            largest_acked: largest,
            lowest_acked: lowest,
            ranges,
            delay_time: Duration::ZERO,
        })
    }

    /// Ask for a CLOSE_PATH acknowledgement on the next send.
    pub fn queue_close_path(&mut self) {
        self.close_path_requested = true;
    }

    pub fn get_close_path_frame(&mut self) -> Option<Frame> {
        if !self.close_path_requested {
            return None;
        }
        self.close_path_requested = false;
        Some(Frame::ClosePath {
            path_id: self.path_id,
        })
    }

    /// `(packets, bytes)` accepted on this path.
    pub fn get_statistics(&self) -> (u64, ByteCount) {
        (self.packets_received, self.bytes_received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_frame_reports_gaps() {
        let mut h = ReceivedPacketHandler::new(1);
        for pn in [1u64, 2, 3, 6, 7] {
            h.received_packet(pn, true, 100);
        }
        let ack = h.get_ack_frame().unwrap();
        assert_eq!(ack.largest_acked, 7);
        assert_eq!(ack.lowest_acked, 1);
        assert_eq!(ack.ranges, vec![(1, 3), (6, 7)]);
    }

    #[test]
    fn no_frame_without_new_packets() {
        let mut h = ReceivedPacketHandler::new(1);
        assert!(h.get_ack_frame().is_none());
        h.received_packet(1, true, 100);
        assert!(h.get_ack_frame().is_some());
        // Nothing new since the last emission.
        assert!(h.get_ack_frame().is_none());
        h.received_packet(2, true, 100);
        assert!(h.get_ack_frame().is_some());
    }

    #[test]
    fn duplicates_are_suppressed() {
        let mut h = ReceivedPacketHandler::new(1);
        h.received_packet(5, true, 100);
        h.received_packet(5, true, 100);
        assert_eq!(h.get_statistics(), (1, 100));
    }

    #[test]
    fn lower_limit_drops_settled_numbers() {
        let mut h = ReceivedPacketHandler::new(1);
        for pn in 1..=5 {
            h.received_packet(pn, true, 10);
        }
        h.set_lower_limit(4);
        let ack = h.get_ack_frame().unwrap();
        assert_eq!(ack.lowest_acked, 4);
        // Anything below the limit arriving late is a stale duplicate.
        h.received_packet(2, true, 10);
        assert_eq!(h.get_statistics(), (5, 50));
    }

    #[test]
    fn ack_only_packets_do_not_instigate_acks() {
        let mut h = ReceivedPacketHandler::new(1);
        h.received_packet(1, false, 40);
        assert!(h.get_ack_frame().is_none());
    }

    #[test]
    fn close_path_frame_is_emitted_once() {
        let mut h = ReceivedPacketHandler::new(3);
        assert!(h.get_close_path_frame().is_none());
        h.queue_close_path();
        assert_eq!(h.get_close_path_frame(), Some(Frame::ClosePath { path_id: 3 }));
        assert!(h.get_close_path_frame().is_none());
    }
}
