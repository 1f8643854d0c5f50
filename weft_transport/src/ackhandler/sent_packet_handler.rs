//! The sent-packet ledger: in-flight tracking, ACK processing, loss
//! detection and the retransmission queue for one path.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;
use weft_core::types::frame::{AckFrame, Frame};
use weft_core::types::{ByteCount, PacketNumber, PathId, DEFAULT_TCP_MSS};

use super::Packet;
use crate::congestion::SendAlgorithm;
use crate::error::{Result, TransportError};
use crate::rtt::RttStats;

/// Packets tracked before `sent_packet` starts refusing new ones.
const MAX_TRACKED_SENT_PACKETS: usize = 2500;

/// Newer packets that must be acked before an older one is declared lost.
const PACKET_REORDERING_THRESHOLD: PacketNumber = 3;

/// Non-retransmittable packets tolerated before the send path forces a PING.
const MAX_NON_RETRANSMITTABLE_PACKETS: u32 = 19;

const MIN_RTO: Duration = Duration::from_millis(200);
const MAX_RTO: Duration = Duration::from_secs(60);
/// RTO used before the first RTT sample.
const DEFAULT_RTO: Duration = Duration::from_millis(500);

/// Extra in-flight budget granted to `overshoot_free`, split across the
/// contending paths.
const OVERSHOOT_BYTES: ByteCount = 4 * DEFAULT_TCP_MSS;

#[derive(Debug)]
pub struct SentPacketHandler {
    path_id: PathId,
    rtt_stats: RttStats,
    congestion: Box<dyn SendAlgorithm>,

    packet_history: BTreeMap<PacketNumber, Packet>,
    retransmission_queue: VecDeque<Packet>,
    bytes_in_flight: ByteCount,

    largest_sent_packet_number: PacketNumber,
    largest_acked: PacketNumber,
    /// Largest peer packet number that carried an ACK we processed.
    largest_received_packet_with_ack: PacketNumber,
    largest_acked_updated: bool,
    non_retransmittable_count: u32,
    consecutive_rto_count: u32,

    loss_time: Option<Instant>,
    alarm: Option<Instant>,

    packets_sent: u64,
    retransmissions_sent: u64,
    packets_lost: u64,
    bytes_sent: ByteCount,
}

impl SentPacketHandler {
    pub fn new(path_id: PathId, congestion: Box<dyn SendAlgorithm>) -> Self {
        Self {
            path_id,
            rtt_stats: RttStats::new(),
            congestion,
            packet_history: BTreeMap::new(),
            retransmission_queue: VecDeque::new(),
            bytes_in_flight: 0,
            largest_sent_packet_number: 0,
            largest_acked: 0,
            largest_received_packet_with_ack: 0,
            largest_acked_updated: false,
            non_retransmittable_count: 0,
            consecutive_rto_count: 0,
            loss_time: None,
            alarm: None,
            packets_sent: 0,
            retransmissions_sent: 0,
            packets_lost: 0,
            bytes_sent: 0,
        }
    }

    /// Append to the in-flight set and arm the loss-detection alarm.
    pub fn sent_packet(&mut self, packet: Packet) -> Result<()> {
        if self.largest_sent_packet_number != 0
            && packet.packet_number <= self.largest_sent_packet_number
        {
            return Err(TransportError::NonMonotonicPacketNumber(
                packet.packet_number,
            ));
        }
        if self.packet_history.len() >= MAX_TRACKED_SENT_PACKETS {
            return Err(TransportError::TooManyOutstanding);
        }
        self.largest_sent_packet_number = packet.packet_number;
        self.packets_sent += 1;
        self.bytes_sent += packet.length;

        let counts = self.congestion.on_packet_sent(
            self.bytes_in_flight,
            packet.packet_number,
            packet.length,
            packet.is_retransmittable(),
        );
        if counts {
            self.non_retransmittable_count = 0;
            self.bytes_in_flight += packet.length;
            self.packet_history.insert(packet.packet_number, packet);
            self.update_loss_detection_alarm();
        } else {
            self.non_retransmittable_count += 1;
        }
        Ok(())
    }

    /// Process an ACK frame received at `recv_time` inside peer packet
    /// `with_packet_number`. Returns the newly acked packet numbers so the
    /// scheduler can reconcile cross-path duplicates.
    ///
    /// Duplicate and reordered ACK frames are ignored.
    pub fn received_ack(
        &mut self,
        ack: &AckFrame,
        with_packet_number: PacketNumber,
        recv_time: Instant,
    ) -> Result<Vec<PacketNumber>> {
        if ack.largest_acked > self.largest_sent_packet_number {
            return Err(TransportError::AckForUnsentPacket {
                largest_acked: ack.largest_acked,
                largest_sent: self.largest_sent_packet_number,
            });
        }
        if with_packet_number != 0
            && with_packet_number <= self.largest_received_packet_with_ack
        {
            return Ok(Vec::new());
        }
        self.largest_received_packet_with_ack = with_packet_number;

        if ack.largest_acked > self.largest_acked {
            self.largest_acked = ack.largest_acked;
            self.largest_acked_updated = true;
        }

        if let Some(pkt) = self.packet_history.get(&ack.largest_acked) {
            self.rtt_stats.update_rtt(
                recv_time.saturating_duration_since(pkt.send_time),
                ack.delay_time,
            );
        }

        let covered: Vec<PacketNumber> = self
            .packet_history
            .range(..=ack.largest_acked)
            .map(|(&pn, _)| pn)
            .filter(|&pn| ack.covers(pn))
            .collect();
        let mut acked = Vec::with_capacity(covered.len());
        for pn in covered {
            if let Some(pkt) = self.packet_history.remove(&pn) {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pkt.length);
                self.congestion.on_packet_acked(
                    pn,
                    pkt.length,
                    self.bytes_in_flight,
                    &self.rtt_stats,
                );
                acked.push(pn);
            }
        }

        self.congestion.maybe_exit_slow_start(&self.rtt_stats);
        self.detect_lost_packets(recv_time);
        self.consecutive_rto_count = 0;
        self.update_loss_detection_alarm();
        Ok(acked)
    }

    fn detect_lost_packets(&mut self, now: Instant) {
        self.loss_time = None;
        let max_rtt = self.rtt_stats.latest_rtt().max(self.rtt_stats.smoothed_rtt());
        let delay_until_lost = if max_rtt.is_zero() {
            None
        } else {
            Some(max_rtt + max_rtt / 8)
        };

        let mut lost = Vec::new();
        for (&pn, pkt) in self.packet_history.iter() {
            if pn >= self.largest_acked {
                break;
            }
            let overdue = delay_until_lost
                .map(|d| now.saturating_duration_since(pkt.send_time) > d)
                .unwrap_or(false);
            if self.largest_acked - pn > PACKET_REORDERING_THRESHOLD || overdue {
                lost.push(pn);
            } else if let Some(d) = delay_until_lost {
                if self.loss_time.is_none() {
                    self.loss_time = Some(pkt.send_time + d);
                }
            }
        }

        for pn in lost {
            if let Some(pkt) = self.packet_history.remove(&pn) {
                debug!(path = self.path_id, packet = pn, "packet deemed lost");
                self.packets_lost += 1;
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pkt.length);
                self.congestion
                    .on_packet_lost(pn, pkt.length, self.bytes_in_flight);
                self.retransmission_queue.push_back(pkt);
            }
        }
    }

    /// Next packet whose frames must be re-sent, if any.
    pub fn dequeue_packet_for_retransmission(&mut self) -> Option<Packet> {
        let pkt = self.retransmission_queue.pop_front()?;
        self.retransmissions_sent += 1;
        Some(pkt)
    }

    /// Everyday send gate: congestion headroom, with retransmissions always
    /// allowed through.
    pub fn sending_allowed(&self) -> bool {
        let congestion_ok = self.congestion.can_send(self.bytes_in_flight)
            && self.packet_history.len() < MAX_TRACKED_SENT_PACKETS;
        congestion_ok || !self.retransmission_queue.is_empty()
    }

    /// Strict window gate used for best-path utilization.
    pub fn congestion_free(&self) -> bool {
        self.bytes_in_flight < self.congestion.congestion_window()
    }

    /// Window gate with a fairness-overshoot margin split across the
    /// contending paths: one more packet may exceed the window by at most
    /// the path's share of the overshoot budget.
    pub fn overshoot_free(&self, num_paths: usize) -> bool {
        let margin = OVERSHOOT_BYTES / num_paths.max(1) as u64;
        self.bytes_in_flight + DEFAULT_TCP_MSS <= self.congestion.congestion_window() + margin
    }

    /// Drop a packet whose copy on another path was acked. Returns whether
    /// the packet was still in flight here.
    pub fn remove_packet_by_number(&mut self, packet_number: PacketNumber) -> bool {
        match self.packet_history.remove(&packet_number) {
            Some(pkt) => {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pkt.length);
                true
            }
            None => false,
        }
    }

    /// Record that the packet is considered acked via any of its copies.
    pub fn duplicate_packet(&mut self, packet_number: PacketNumber) {
        if let Some(pkt) = self.packet_history.get_mut(&packet_number) {
            pkt.dup_droppable = true;
        }
    }

    pub fn get_stop_waiting_frame(&mut self, force: bool) -> Option<Frame> {
        if !force && !self.largest_acked_updated {
            return None;
        }
        if self.largest_acked == 0 && !force {
            return None;
        }
        self.largest_acked_updated = false;
        Some(Frame::StopWaiting {
            least_unacked: self.largest_acked + 1,
        })
    }

    /// Lowest packet number the peer should still expect retransmissions
    /// for.
    pub fn get_least_unacked(&self) -> PacketNumber {
        self.packet_history
            .keys()
            .next()
            .copied()
            .unwrap_or(self.largest_acked + 1)
    }

    pub fn get_alarm_timeout(&self) -> Option<Instant> {
        self.alarm
    }

    /// Fire the loss-detection alarm. Without in-flight packets this is a
    /// NOP.
    pub fn on_alarm(&mut self, now: Instant) {
        if self.packet_history.is_empty() {
            self.alarm = None;
            return;
        }
        if self.loss_time.is_some() {
            self.detect_lost_packets(now);
        } else {
            self.on_retransmission_timeout();
        }
        self.update_loss_detection_alarm();
    }

    fn on_retransmission_timeout(&mut self) {
        let numbers: Vec<PacketNumber> = self.packet_history.keys().copied().collect();
        let retransmitted = !numbers.is_empty();
        for pn in numbers {
            if let Some(pkt) = self.packet_history.remove(&pn) {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pkt.length);
                self.retransmission_queue.push_back(pkt);
            }
        }
        debug!(path = self.path_id, "retransmission timeout");
        self.consecutive_rto_count += 1;
        self.congestion.on_retransmission_timeout(retransmitted);
    }

    /// Move everything in flight to the retransmission queue, e.g. when the
    /// path is being closed and its data must travel elsewhere.
    pub fn set_inflight_as_lost(&mut self) {
        let numbers: Vec<PacketNumber> = self.packet_history.keys().copied().collect();
        for pn in numbers {
            if let Some(pkt) = self.packet_history.remove(&pn) {
                self.packets_lost += 1;
                self.retransmission_queue.push_back(pkt);
            }
        }
        self.bytes_in_flight = 0;
        self.loss_time = None;
        self.alarm = None;
    }

    fn update_loss_detection_alarm(&mut self) {
        if self.packet_history.is_empty() {
            self.alarm = None;
            return;
        }
        if let Some(t) = self.loss_time {
            self.alarm = Some(t);
            return;
        }
        let rto = self.current_rto();
        self.alarm = self
            .packet_history
            .values()
            .next_back()
            .map(|pkt| pkt.send_time + rto);
    }

    fn current_rto(&self) -> Duration {
        let base = match self.congestion.retransmission_delay(&self.rtt_stats) {
            Some(d) => d.max(MIN_RTO),
            None => DEFAULT_RTO,
        };
        let backoff = 1u32 << self.consecutive_rto_count.min(6);
        (base * backoff).min(MAX_RTO)
    }

    pub fn should_send_retransmittable_packet(&self) -> bool {
        self.non_retransmittable_count >= MAX_NON_RETRANSMITTABLE_PACKETS
    }

    /// `(sent, retransmissions, lost, bytes)`.
    pub fn get_statistics(&self) -> (u64, u64, u64, ByteCount) {
        (
            self.packets_sent,
            self.retransmissions_sent,
            self.packets_lost,
            self.bytes_sent,
        )
    }

    pub fn get_congestion_window(&self) -> ByteCount {
        self.congestion.congestion_window()
    }

    pub fn get_bytes_in_flight(&self) -> ByteCount {
        self.bytes_in_flight
    }

    pub fn rtt_stats(&self) -> &RttStats {
        &self.rtt_stats
    }

    pub fn on_connection_migration(&mut self) {
        self.congestion.on_connection_migration();
        self.rtt_stats = RttStats::new();
    }
}
