//! Per-path Vegas sender: slow start, congestion avoidance and recovery
//! around the throughput-gap core.

use std::time::Duration;

use weft_core::types::{ByteCount, PacketNumber, DEFAULT_TCP_MSS};

use super::hybrid_slow_start::HybridSlowStart;
use super::prr::PrrSender;
use super::vegas::Vegas;
use super::{
    CongestionState, SendAlgorithm, DEFAULT_MINIMUM_CONGESTION_WINDOW, MAX_BURST_BYTES,
};
use crate::rtt::RttStats;

/// Window reduction factor applied when a loss episode is confirmed.
const RECOVERY_BETA: f64 = 0.7;

/// Losses tolerated before a cutback. Overridable through the config.
pub const DEFAULT_LOSS_EVENT_THRESHOLD: u32 = 3;

#[derive(Debug)]
pub struct VegasSender {
    hybrid_slow_start: HybridSlowStart,
    prr: PrrSender,
    vegas: Vegas,

    largest_sent_packet_number: PacketNumber,
    largest_acked_packet_number: PacketNumber,
    /// Largest packet outstanding when the last cutback occurred. Acks at
    /// or below it mean the path is still in recovery.
    largest_sent_at_last_cutback: PacketNumber,
    last_cutback_exited_slowstart: bool,

    /// Congestion window in packets.
    congestion_window: u64,
    /// Slow start threshold in packets.
    slowstart_threshold: u64,
    min_congestion_window: u64,
    max_congestion_window: u64,

    /// Losses seen since the last cutback.
    loss_events: u32,
    loss_event_threshold: u32,

    initial_congestion_window: u64,
    initial_max_congestion_window: u64,
}

impl VegasSender {
    pub fn new(
        initial_congestion_window: u64,
        initial_max_congestion_window: u64,
        loss_event_threshold: u32,
    ) -> Self {
        Self {
            hybrid_slow_start: HybridSlowStart::default(),
            prr: PrrSender::default(),
            vegas: Vegas::new(),
            largest_sent_packet_number: 0,
            largest_acked_packet_number: 0,
            largest_sent_at_last_cutback: 0,
            last_cutback_exited_slowstart: false,
            congestion_window: initial_congestion_window,
            slowstart_threshold: initial_max_congestion_window,
            min_congestion_window: DEFAULT_MINIMUM_CONGESTION_WINDOW,
            max_congestion_window: initial_max_congestion_window,
            loss_events: 0,
            loss_event_threshold,
            initial_congestion_window,
            initial_max_congestion_window,
        }
    }

    fn in_recovery(&self) -> bool {
        self.largest_acked_packet_number != 0
            && self.largest_acked_packet_number <= self.largest_sent_at_last_cutback
    }

    fn in_slow_start(&self) -> bool {
        self.congestion_window < self.slowstart_threshold
    }

    fn congestion_window_bytes(&self) -> ByteCount {
        self.congestion_window * DEFAULT_TCP_MSS
    }

    /// The window only grows while the sender actually presses against it.
    fn is_cwnd_limited(&self, bytes_in_flight: ByteCount) -> bool {
        let window = self.congestion_window_bytes();
        if bytes_in_flight >= window {
            return true;
        }
        let available = window - bytes_in_flight;
        let slow_start_limited = self.in_slow_start() && bytes_in_flight > window / 2;
        slow_start_limited || available <= MAX_BURST_BYTES
    }

    fn maybe_increase_cwnd(&mut self, bytes_in_flight: ByteCount, rtt: &RttStats) {
        if !self.is_cwnd_limited(bytes_in_flight) {
            return;
        }
        if self.congestion_window >= self.max_congestion_window {
            return;
        }
        self.vegas.on_rtt_sample(rtt.latest_rtt(), rtt.min_rtt());
        if self.in_slow_start() {
            if self.vegas.slow_start_delay_exceeded(self.congestion_window) {
                // A queue is already standing; move to congestion avoidance.
                self.slowstart_threshold =
                    (self.congestion_window / 2).max(self.min_congestion_window);
                return;
            }
            self.congestion_window += 1;
            return;
        }
        self.congestion_window = self
            .vegas
            .window_after_ack(self.congestion_window)
            .clamp(self.min_congestion_window, self.max_congestion_window);
    }
}

impl SendAlgorithm for VegasSender {
    fn on_packet_sent(
        &mut self,
        _bytes_in_flight: ByteCount,
        packet_number: PacketNumber,
        bytes: ByteCount,
        is_retransmittable: bool,
    ) -> bool {
        if !is_retransmittable {
            return false;
        }
        if self.in_recovery() {
            self.prr.on_packet_sent(bytes);
        }
        self.largest_sent_packet_number = packet_number;
        self.hybrid_slow_start.on_packet_sent(packet_number);
        true
    }

    fn on_packet_acked(
        &mut self,
        acked_packet_number: PacketNumber,
        acked_bytes: ByteCount,
        bytes_in_flight: ByteCount,
        rtt: &RttStats,
    ) {
        self.largest_acked_packet_number = self
            .largest_acked_packet_number
            .max(acked_packet_number);
        if self.in_recovery() {
            self.prr.on_packet_acked(acked_bytes);
            return;
        }
        self.maybe_increase_cwnd(bytes_in_flight, rtt);
        if self.in_slow_start() {
            self.hybrid_slow_start.on_packet_acked(acked_packet_number);
        }
    }

    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        _lost_bytes: ByteCount,
        bytes_in_flight: ByteCount,
    ) {
        self.loss_events += 1;
        if self.loss_events <= self.loss_event_threshold {
            return;
        }
        if packet_number <= self.largest_sent_at_last_cutback {
            // Losses from before the cutback are already paid for.
            return;
        }
        self.last_cutback_exited_slowstart = self.in_slow_start();
        self.prr.on_packet_lost(bytes_in_flight);
        let reduced = (self.congestion_window as f64 * RECOVERY_BETA) as u64;
        self.congestion_window = reduced.max(self.min_congestion_window);
        self.slowstart_threshold = self.congestion_window;
        self.largest_sent_at_last_cutback = self.largest_sent_packet_number;
        self.loss_events = 0;
    }

    fn maybe_exit_slow_start(&mut self, rtt: &RttStats) {
        if self.in_slow_start()
            && self.hybrid_slow_start.should_exit_slow_start(
                rtt.latest_rtt(),
                rtt.min_rtt(),
                self.congestion_window,
            )
        {
            self.slowstart_threshold = self.congestion_window;
        }
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.largest_sent_at_last_cutback = 0;
        if !packets_retransmitted {
            return;
        }
        self.hybrid_slow_start.restart();
        self.vegas.reset();
        self.slowstart_threshold = self.congestion_window / 2;
        self.congestion_window = self.min_congestion_window;
    }

    fn on_connection_migration(&mut self) {
        self.hybrid_slow_start.restart();
        self.prr = PrrSender::default();
        self.vegas.reset();
        self.largest_sent_packet_number = 0;
        self.largest_acked_packet_number = 0;
        self.largest_sent_at_last_cutback = 0;
        self.last_cutback_exited_slowstart = false;
        self.loss_events = 0;
        self.congestion_window = self.initial_congestion_window;
        self.slowstart_threshold = self.initial_max_congestion_window;
        self.max_congestion_window = self.initial_max_congestion_window;
    }

    fn can_send(&self, bytes_in_flight: ByteCount) -> bool {
        if self.in_recovery() {
            return self.prr.can_send(
                self.congestion_window_bytes(),
                bytes_in_flight,
                self.slowstart_threshold * DEFAULT_TCP_MSS,
            );
        }
        bytes_in_flight < self.congestion_window_bytes()
    }

    fn congestion_window(&self) -> ByteCount {
        self.congestion_window_bytes()
    }

    fn slow_start_threshold(&self) -> ByteCount {
        self.slowstart_threshold * DEFAULT_TCP_MSS
    }

    fn state(&self) -> CongestionState {
        if self.in_recovery() {
            CongestionState::Recovery
        } else if self.in_slow_start() {
            CongestionState::SlowStart
        } else {
            CongestionState::CongestionAvoidance
        }
    }

    fn retransmission_delay(&self, rtt: &RttStats) -> Option<Duration> {
        if rtt.smoothed_rtt().is_zero() {
            return None;
        }
        Some(rtt.smoothed_rtt() + rtt.mean_deviation() * 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtt(latest_ms: u64, min_ms: u64) -> RttStats {
        let mut stats = RttStats::new();
        stats.update_rtt(Duration::from_millis(min_ms), Duration::ZERO);
        if latest_ms != min_ms {
            stats.update_rtt(Duration::from_millis(latest_ms), Duration::ZERO);
        }
        stats
    }

    fn sender_in_ca(cwnd: u64) -> VegasSender {
        let mut sender = VegasSender::new(cwnd, 1000, DEFAULT_LOSS_EVENT_THRESHOLD);
        sender.slowstart_threshold = cwnd;
        sender
    }

    #[test]
    fn slow_start_grows_one_packet_per_ack() {
        let mut sender = VegasSender::new(10, 1000, DEFAULT_LOSS_EVENT_THRESHOLD);
        let rtt = rtt(20, 20);
        sender.on_packet_sent(0, 1, DEFAULT_TCP_MSS, true);
        // Fully utilized window so the cwnd-limited check passes.
        sender.on_packet_acked(1, DEFAULT_TCP_MSS, sender.congestion_window(), &rtt);
        assert_eq!(sender.congestion_window, 11);
        assert_eq!(sender.state(), CongestionState::SlowStart);
    }

    #[test]
    fn vegas_step_in_congestion_avoidance() {
        let mut sender = sender_in_ca(20);
        sender.on_packet_sent(0, 1, DEFAULT_TCP_MSS, true);

        // Flat RTT: Diff below alpha/baseRtt, window grows by one.
        let flat = rtt(20, 20);
        sender.on_packet_acked(1, DEFAULT_TCP_MSS, sender.congestion_window(), &flat);
        assert_eq!(sender.congestion_window, 21);

        // Large delay: Diff above beta/baseRtt, window shrinks by one.
        let mut sender = sender_in_ca(20);
        sender.on_packet_sent(0, 1, DEFAULT_TCP_MSS, true);
        let delayed = rtt(60, 20);
        sender.on_packet_acked(1, DEFAULT_TCP_MSS, sender.congestion_window(), &delayed);
        assert_eq!(sender.congestion_window, 19);
    }

    #[test]
    fn window_only_grows_when_cwnd_limited() {
        let mut sender = sender_in_ca(20);
        sender.on_packet_sent(0, 1, DEFAULT_TCP_MSS, true);
        let flat = rtt(20, 20);
        // Barely any bytes in flight: application limited, no growth.
        sender.on_packet_acked(1, DEFAULT_TCP_MSS, DEFAULT_TCP_MSS, &flat);
        assert_eq!(sender.congestion_window, 20);
    }

    #[test]
    fn losses_below_threshold_do_not_cut_back() {
        let mut sender = sender_in_ca(30);
        sender.on_packet_sent(0, 10, DEFAULT_TCP_MSS, true);
        for pn in 1..=DEFAULT_LOSS_EVENT_THRESHOLD as u64 {
            sender.on_packet_lost(pn, DEFAULT_TCP_MSS, 10 * DEFAULT_TCP_MSS);
        }
        assert_eq!(sender.congestion_window, 30);
        assert_eq!(sender.largest_sent_at_last_cutback, 0);
    }

    #[test]
    fn cutback_after_threshold_losses() {
        let mut sender = sender_in_ca(30);
        sender.on_packet_sent(0, 10, DEFAULT_TCP_MSS, true);
        for pn in 1..=(DEFAULT_LOSS_EVENT_THRESHOLD as u64 + 1) {
            sender.on_packet_lost(pn, DEFAULT_TCP_MSS, 10 * DEFAULT_TCP_MSS);
        }
        assert_eq!(sender.congestion_window, 21);
        assert_eq!(sender.slowstart_threshold, 21);
        assert_eq!(sender.largest_sent_at_last_cutback, 10);
        assert_eq!(sender.loss_events, 0);
    }

    #[test]
    fn recovery_absorbs_older_losses() {
        let mut sender = sender_in_ca(30);
        sender.on_packet_sent(0, 10, DEFAULT_TCP_MSS, true);
        for pn in 1..=(DEFAULT_LOSS_EVENT_THRESHOLD as u64 + 1) {
            sender.on_packet_lost(pn, DEFAULT_TCP_MSS, 10 * DEFAULT_TCP_MSS);
        }
        let window = sender.congestion_window;
        // Another burst of losses for packets sent before the cutback.
        for pn in 5..=(5 + DEFAULT_LOSS_EVENT_THRESHOLD as u64) {
            sender.on_packet_lost(pn, DEFAULT_TCP_MSS, 8 * DEFAULT_TCP_MSS);
        }
        assert_eq!(sender.congestion_window, window);
    }

    #[test]
    fn recovery_gates_acks_through_prr() {
        let mut sender = sender_in_ca(30);
        sender.on_packet_sent(0, 10, DEFAULT_TCP_MSS, true);
        for pn in 1..=(DEFAULT_LOSS_EVENT_THRESHOLD as u64 + 1) {
            sender.on_packet_lost(pn, DEFAULT_TCP_MSS, 10 * DEFAULT_TCP_MSS);
        }
        let window = sender.congestion_window;
        let flat = rtt(20, 20);
        // An ack at or below the cutback point lands in recovery and is
        // routed through PRR, so the window must not grow.
        sender.on_packet_acked(6, DEFAULT_TCP_MSS, sender.congestion_window(), &flat);
        assert_eq!(sender.state(), CongestionState::Recovery);
        assert_eq!(sender.congestion_window, window);
        // Acking past the cutback point ends recovery.
        sender.on_packet_acked(11, DEFAULT_TCP_MSS, sender.congestion_window(), &flat);
        assert_ne!(sender.state(), CongestionState::Recovery);
    }

    #[test]
    fn rto_resets_window_and_vegas_state() {
        let mut sender = sender_in_ca(30);
        sender.slowstart_threshold = 20;
        let sample = rtt(20, 20);
        sender.on_packet_sent(0, 1, DEFAULT_TCP_MSS, true);
        sender.on_packet_acked(1, DEFAULT_TCP_MSS, sender.congestion_window(), &sample);

        sender.on_retransmission_timeout(true);
        assert_eq!(sender.congestion_window, DEFAULT_MINIMUM_CONGESTION_WINDOW);
        assert_eq!(sender.slowstart_threshold, 15);
        assert_eq!(sender.largest_sent_at_last_cutback, 0);
        assert!(sender.vegas.diff(20) > 0.0);
    }

    #[test]
    fn rto_without_retransmissions_only_clears_recovery() {
        let mut sender = sender_in_ca(30);
        sender.on_retransmission_timeout(false);
        assert_eq!(sender.congestion_window, 30);
    }

    #[test]
    fn migration_restores_initial_state() {
        let mut sender = VegasSender::new(32, 1000, DEFAULT_LOSS_EVENT_THRESHOLD);
        sender.on_packet_sent(0, 10, DEFAULT_TCP_MSS, true);
        for pn in 1..=(DEFAULT_LOSS_EVENT_THRESHOLD as u64 + 1) {
            sender.on_packet_lost(pn, DEFAULT_TCP_MSS, 10 * DEFAULT_TCP_MSS);
        }
        sender.on_connection_migration();
        assert_eq!(sender.congestion_window, 32);
        assert_eq!(sender.slowstart_threshold, 1000);
        assert_eq!(sender.largest_sent_packet_number, 0);
        assert_eq!(sender.largest_acked_packet_number, 0);
    }

    #[test]
    fn window_stays_within_bounds() {
        let mut sender = sender_in_ca(1000);
        sender.max_congestion_window = 1000;
        sender.on_packet_sent(0, 1, DEFAULT_TCP_MSS, true);
        let flat = rtt(20, 20);
        sender.on_packet_acked(1, DEFAULT_TCP_MSS, sender.congestion_window(), &flat);
        assert!(sender.congestion_window <= 1000);

        let mut sender = sender_in_ca(2);
        sender.on_packet_sent(0, 1, DEFAULT_TCP_MSS, true);
        let delayed = rtt(200, 20);
        sender.on_packet_acked(1, DEFAULT_TCP_MSS, sender.congestion_window(), &delayed);
        assert!(sender.congestion_window >= DEFAULT_MINIMUM_CONGESTION_WINDOW);
    }
}
