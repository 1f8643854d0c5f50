//! Session configuration.
//!
//! Scheduler and congestion-control choices are fixed at session
//! construction and read without locking; tests inject them here instead
//! of going through process-wide state.

use crate::congestion::vegas_sender::DEFAULT_LOSS_EVENT_THRESHOLD;
use crate::congestion::{DEFAULT_MAX_CONGESTION_WINDOW, INITIAL_CONGESTION_WINDOW};

/// Packet-to-path scheduling algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerAlgorithm {
    /// Lowest smoothed RTT wins; retransmissions ignore window headroom.
    LowRtt,
    /// Lowest send quota wins.
    RoundRobin,
    /// First eligible path sends, every other eligible path gets a copy.
    OppRedundant,
    /// Highest throughput path preferred, idle paths repair with copies.
    UtilRepair,
}

impl SchedulerAlgorithm {
    /// Maps the externally configured name. Unknown names yield `None` and
    /// the caller should refuse to schedule.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "lowRTT" => Some(Self::LowRtt),
            "RR" => Some(Self::RoundRobin),
            "oppRedundant" => Some(Self::OppRedundant),
            "utilRepair" => Some(Self::UtilRepair),
            _ => None,
        }
    }

    /// Whether the algorithm duplicates packets by itself.
    pub fn is_redundant(self) -> bool {
        matches!(self, Self::OppRedundant | Self::UtilRepair)
    }
}

/// Congestion control variant. Cubic and OLIA live outside this crate;
/// the delay-based Vegas controller is what the multipath scheduler ranks
/// paths with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionAlgorithm {
    Vegas,
}

impl CongestionAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "vegas" => Some(Self::Vegas),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub scheduler: SchedulerAlgorithm,
    pub congestion: CongestionAlgorithm,
    /// Send redundant copies along the scheduler's shortlist.
    pub redundant_sending: bool,
    /// Write per-path goodput lines from the stats logger.
    pub log_payload: bool,
    /// Whether the session discovers additional paths.
    pub create_paths: bool,
    /// Initial congestion window per path, in packets.
    pub initial_congestion_window: u64,
    /// Maximum congestion window per path, in packets.
    pub max_congestion_window: u64,
    /// Losses tolerated before a window cutback.
    pub loss_event_threshold: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerAlgorithm::LowRtt,
            congestion: CongestionAlgorithm::Vegas,
            redundant_sending: false,
            log_payload: true,
            create_paths: false,
            initial_congestion_window: INITIAL_CONGESTION_WINDOW,
            max_congestion_window: DEFAULT_MAX_CONGESTION_WINDOW,
            loss_event_threshold: DEFAULT_LOSS_EVENT_THRESHOLD,
        }
    }
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    scheduler: Option<SchedulerAlgorithm>,
    congestion: Option<CongestionAlgorithm>,
    redundant_sending: Option<bool>,
    log_payload: Option<bool>,
    create_paths: Option<bool>,
    initial_congestion_window: Option<u64>,
    max_congestion_window: Option<u64>,
    loss_event_threshold: Option<u32>,
}

impl TransportConfigBuilder {
    pub fn scheduler(mut self, scheduler: SchedulerAlgorithm) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn congestion(mut self, congestion: CongestionAlgorithm) -> Self {
        self.congestion = Some(congestion);
        self
    }

    pub fn redundant_sending(mut self, enabled: bool) -> Self {
        self.redundant_sending = Some(enabled);
        self
    }

    pub fn log_payload(mut self, enabled: bool) -> Self {
        self.log_payload = Some(enabled);
        self
    }

    pub fn create_paths(mut self, enabled: bool) -> Self {
        self.create_paths = Some(enabled);
        self
    }

    pub fn initial_congestion_window(mut self, packets: u64) -> Self {
        self.initial_congestion_window = Some(packets);
        self
    }

    pub fn max_congestion_window(mut self, packets: u64) -> Self {
        self.max_congestion_window = Some(packets);
        self
    }

    pub fn loss_event_threshold(mut self, losses: u32) -> Self {
        self.loss_event_threshold = Some(losses);
        self
    }

    pub fn build(self) -> TransportConfig {
        let default = TransportConfig::default();
        let scheduler = self.scheduler.unwrap_or(default.scheduler);
        TransportConfig {
            scheduler,
            congestion: self.congestion.unwrap_or(default.congestion),
            // Redundant schedulers duplicate by design unless told not to.
            redundant_sending: self
                .redundant_sending
                .unwrap_or_else(|| scheduler.is_redundant()),
            log_payload: self.log_payload.unwrap_or(default.log_payload),
            create_paths: self.create_paths.unwrap_or(default.create_paths),
            initial_congestion_window: self
                .initial_congestion_window
                .unwrap_or(default.initial_congestion_window),
            max_congestion_window: self
                .max_congestion_window
                .unwrap_or(default.max_congestion_window),
            loss_event_threshold: self
                .loss_event_threshold
                .unwrap_or(default.loss_event_threshold),
        }
    }
}
