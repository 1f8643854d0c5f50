//! Per-path congestion control.

use std::fmt;
use std::time::Duration;

use weft_core::types::{ByteCount, PacketNumber, DEFAULT_TCP_MSS};

use crate::rtt::RttStats;

pub mod hybrid_slow_start;
pub mod prr;
pub mod vegas;
pub mod vegas_sender;

pub use vegas_sender::VegasSender;

/// Initial congestion window in packets.
pub const INITIAL_CONGESTION_WINDOW: u64 = 32;

/// Largest congestion window the controller grows to, in packets.
pub const DEFAULT_MAX_CONGESTION_WINDOW: u64 = 1000;

/// Floor for the congestion window after cutbacks, in packets.
pub const DEFAULT_MINIMUM_CONGESTION_WINDOW: u64 = 2;

/// Burst headroom tolerated by the cwnd-limited check.
pub const MAX_BURST_BYTES: ByteCount = 3 * DEFAULT_TCP_MSS;

/// Regime of a per-path controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    SlowStart,
    CongestionAvoidance,
    Recovery,
}

/// Window evolution driven by the sent-packet ledger.
///
/// RTT state stays owned by the ledger and is passed in per call.
pub trait SendAlgorithm: Send + fmt::Debug {
    /// Returns whether the packet counts against the window.
    fn on_packet_sent(
        &mut self,
        bytes_in_flight: ByteCount,
        packet_number: PacketNumber,
        bytes: ByteCount,
        is_retransmittable: bool,
    ) -> bool;

    fn on_packet_acked(
        &mut self,
        acked_packet_number: PacketNumber,
        acked_bytes: ByteCount,
        bytes_in_flight: ByteCount,
        rtt: &RttStats,
    );

    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        lost_bytes: ByteCount,
        bytes_in_flight: ByteCount,
    );

    fn maybe_exit_slow_start(&mut self, rtt: &RttStats);

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// Reset to initial values when the connection moves to a new network.
    fn on_connection_migration(&mut self);

    fn can_send(&self, bytes_in_flight: ByteCount) -> bool;

    /// Congestion window in bytes.
    fn congestion_window(&self) -> ByteCount;

    /// Slow start threshold in bytes.
    fn slow_start_threshold(&self) -> ByteCount;

    fn state(&self) -> CongestionState;

    /// RTO interval derived from the path's RTT state, if a sample exists.
    fn retransmission_delay(&self, rtt: &RttStats) -> Option<Duration>;
}
