//! Hybrid slow start: leave slow start on a delay signal instead of
//! waiting for the first loss.

use std::time::Duration;

use weft_core::types::PacketNumber;

/// No exit below this window, in packets.
const LOW_WINDOW: u64 = 16;

/// RTT samples taken per receive round before the delay check fires.
const MIN_SAMPLES: u32 = 8;

/// Exponent of the divisor applied to the min RTT for the delay threshold.
const DELAY_FACTOR_EXP: u32 = 3;

const MIN_DELAY_THRESHOLD: Duration = Duration::from_millis(4);
const MAX_DELAY_THRESHOLD: Duration = Duration::from_millis(16);

#[derive(Debug, Default)]
pub struct HybridSlowStart {
    end_packet_number: PacketNumber,
    last_sent_packet_number: PacketNumber,
    started: bool,
    current_min_rtt: Duration,
    rtt_sample_count: u32,
    hystart_found: bool,
}

impl HybridSlowStart {
    fn start_receive_round(&mut self, last_sent: PacketNumber) {
        self.end_packet_number = last_sent;
        self.current_min_rtt = Duration::ZERO;
        self.rtt_sample_count = 0;
        self.started = true;
    }

    fn is_end_of_round(&self, ack: PacketNumber) -> bool {
        self.end_packet_number < ack
    }

    /// Delay check: the round's lowest RTT rising a threshold above the
    /// path minimum means queues are forming.
    pub fn should_exit_slow_start(
        &mut self,
        latest_rtt: Duration,
        min_rtt: Duration,
        congestion_window: u64,
    ) -> bool {
        if !self.started {
            self.start_receive_round(self.last_sent_packet_number);
        }
        if self.hystart_found {
            return congestion_window >= LOW_WINDOW;
        }
        self.rtt_sample_count += 1;
        if self.rtt_sample_count <= MIN_SAMPLES
            && (self.current_min_rtt.is_zero() || latest_rtt < self.current_min_rtt)
        {
            self.current_min_rtt = latest_rtt;
        }
        if self.rtt_sample_count == MIN_SAMPLES {
            let threshold = (min_rtt / (1u32 << DELAY_FACTOR_EXP))
                .clamp(MIN_DELAY_THRESHOLD, MAX_DELAY_THRESHOLD);
            if self.current_min_rtt > min_rtt + threshold {
                self.hystart_found = true;
            }
        }
        congestion_window >= LOW_WINDOW && self.hystart_found
    }

    pub fn on_packet_sent(&mut self, packet_number: PacketNumber) {
        self.last_sent_packet_number = packet_number;
    }

    pub fn on_packet_acked(&mut self, acked_packet_number: PacketNumber) {
        if self.is_end_of_round(acked_packet_number) {
            self.started = false;
        }
    }

    pub fn restart(&mut self) {
        self.started = false;
        self.hystart_found = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_exit_while_delay_is_flat() {
        let mut hss = HybridSlowStart::default();
        hss.on_packet_sent(100);
        for _ in 0..20 {
            assert!(!hss.should_exit_slow_start(
                Duration::from_millis(20),
                Duration::from_millis(20),
                64,
            ));
        }
    }

    #[test]
    fn exits_after_sustained_delay_increase() {
        let mut hss = HybridSlowStart::default();
        hss.on_packet_sent(100);
        let min = Duration::from_millis(20);
        // Threshold is clamped min/8 = 2.5ms -> 4ms; 30ms is well above it.
        let mut exited = false;
        for _ in 0..MIN_SAMPLES {
            exited = hss.should_exit_slow_start(Duration::from_millis(30), min, 64);
        }
        assert!(exited);
    }

    #[test]
    fn small_windows_never_exit() {
        let mut hss = HybridSlowStart::default();
        hss.on_packet_sent(100);
        for _ in 0..MIN_SAMPLES {
            assert!(!hss.should_exit_slow_start(
                Duration::from_millis(200),
                Duration::from_millis(20),
                LOW_WINDOW - 1,
            ));
        }
    }

    #[test]
    fn restart_clears_the_found_signal() {
        let mut hss = HybridSlowStart::default();
        hss.on_packet_sent(100);
        for _ in 0..MIN_SAMPLES {
            hss.should_exit_slow_start(Duration::from_millis(60), Duration::from_millis(20), 64);
        }
        assert!(hss.hystart_found);
        hss.restart();
        assert!(!hss.hystart_found);
    }
}
