//! Telemetry: per-path send-rate logs and the scheduler summary report.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use weft_core::types::{ByteCount, PathId, INITIAL_PATH_ID};

use crate::session::Session;

#[derive(Debug, Serialize)]
pub struct PathStatsEntry {
    #[serde(rename = "pathID")]
    pub path_id: PathId,
    #[serde(rename = "pathIP")]
    pub path_ip: String,
    #[serde(rename = "sendPackets")]
    pub send_packets: u64,
    #[serde(rename = "retransmissions")]
    pub retransmissions: u64,
    #[serde(rename = "losses")]
    pub losses: u64,
    #[serde(rename = "sentStreamFrameBytes")]
    pub sent_stream_frame_bytes: ByteCount,
    #[serde(rename = "selectedAsBestPath")]
    pub selected_as_best_path: u64,
}

#[derive(Debug, Serialize)]
pub struct SchedulerStatsReport {
    #[serde(rename = "totalSentPackets")]
    pub total_sent_packets: u64,
    #[serde(rename = "duplicatedPackets")]
    pub duplicated_packets: u64,
    #[serde(rename = "duplicatedDroppedPackets")]
    pub duplicated_dropped_packets: u64,
    #[serde(rename = "duplicatedPacketDropRate")]
    pub duplicated_packet_drop_rate: f64,
    #[serde(rename = "totalStreamBytes")]
    pub total_stream_bytes: ByteCount,
    #[serde(rename = "duplicatedStreamBytes")]
    pub duplicated_stream_bytes: ByteCount,
    #[serde(rename = "duplicateStreamRate")]
    pub duplicate_stream_rate: f64,
    #[serde(rename = "blockedCWhighestTPPath")]
    pub blocked_cw_highest_tp_path: u64,
    #[serde(rename = "lowerRTTSchedules")]
    pub lower_rtt_schedules: u64,
    #[serde(rename = "pathSwitches")]
    pub path_switches: u64,
    #[serde(rename = "pathStats")]
    pub path_stats: Vec<PathStatsEntry>,
}

/// Periodic writer of `P<id>_send.log` lines and the
/// `Server_scheduler_stats.json` summary.
pub struct StatsLogger {
    log_dir: PathBuf,
    start: Instant,
    last_log: Instant,
    last_sent_bytes: HashMap<PathId, ByteCount>,
    log_files: HashMap<PathId, File>,
}

impl StatsLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let now = Instant::now();
        Self {
            log_dir: log_dir.into(),
            start: now,
            last_log: now,
            last_sent_bytes: HashMap::new(),
            log_files: HashMap::new(),
        }
    }

    /// Append one goodput line per data path:
    /// `relative_ms;rate_kbit;bytes_in_flight`.
    pub fn log_sendings(&mut self, session: &Session) -> std::io::Result<()> {
        if !session.config().log_payload {
            return Ok(());
        }
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_log).as_secs_f64() * 1e3;
        self.last_log = now;
        let stamp_ms = now.duration_since(self.start).as_secs_f64() * 1e3;

        let paths = session.paths_snapshot();
        let multipath = paths.len() > 1;
        for pth in paths {
            if pth.path_id == INITIAL_PATH_ID && multipath {
                continue;
            }
            let (_, _, _, sent_bytes) = pth.sent_statistics();
            let last = self.last_sent_bytes.insert(pth.path_id, sent_bytes).unwrap_or(0);
            let delta = sent_bytes.saturating_sub(last);
            let rate_kbit = if elapsed_ms > 0.0 {
                delta as f64 * 8.0 / elapsed_ms
            } else {
                0.0
            };

            let file = match self.log_files.entry(pth.path_id) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    let name = self.log_dir.join(format!("P{}_send.log", pth.path_id));
                    e.insert(
                        OpenOptions::new().append(true).create(true).open(name)?,
                    )
                }
            };
            writeln!(file, "{stamp_ms};{rate_kbit};{}", pth.bytes_in_flight())?;
        }
        Ok(())
    }

    /// Assemble the summary from scheduler counters and path ledgers.
    pub fn build_report(session: &Session) -> SchedulerStatsReport {
        let counters = session.scheduler_counters();
        let mut path_stats = Vec::new();
        let mut total_stream_bytes: ByteCount = 0;
        for pth in session.paths_snapshot() {
            let (packets, retransmissions, losses, sent_bytes) = pth.sent_statistics();
            total_stream_bytes += sent_bytes;
            path_stats.push(PathStatsEntry {
                path_id: pth.path_id,
                path_ip: pth.local_addr().to_string(),
                send_packets: packets,
                retransmissions,
                losses,
                sent_stream_frame_bytes: sent_bytes,
                selected_as_best_path: counters
                    .best_path_selection
                    .get(&pth.path_id)
                    .copied()
                    .unwrap_or(0),
            });
        }

        let duplicated_packet_drop_rate = if counters.duplicated_packets != 0 {
            counters.dropped_duplicated_packets as f64 / counters.duplicated_packets as f64 * 100.0
        } else {
            0.0
        };
        let duplicate_stream_rate = if total_stream_bytes != 0 {
            counters.duplicated_stream_bytes as f64 / total_stream_bytes as f64 * 100.0
        } else {
            0.0
        };

        SchedulerStatsReport {
            total_sent_packets: session.all_sent_packets(),
            duplicated_packets: counters.duplicated_packets,
            duplicated_dropped_packets: counters.dropped_duplicated_packets,
            duplicated_packet_drop_rate,
            total_stream_bytes,
            duplicated_stream_bytes: counters.duplicated_stream_bytes,
            duplicate_stream_rate,
            blocked_cw_highest_tp_path: counters.cw_blocks,
            lower_rtt_schedules: counters.lower_rtt_schedules,
            path_switches: counters.path_switches,
            path_stats,
        }
    }

    pub fn write_report(&self, session: &Session) -> std::io::Result<()> {
        let report = Self::build_report(session);
        let raw = serde_json::to_vec(&report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(self.log_dir.join("Server_scheduler_stats.json"), raw)
    }

    /// Drive the logger until `stop` flips. Write failures are logged and
    /// do not kill the task.
    pub async fn run(
        mut self,
        session: Arc<Session>,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.log_sendings(&session) {
                        debug!(%err, "send log write failed");
                    }
                    if let Err(err) = self.write_report(&session) {
                        debug!(%err, "stats report write failed");
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }
}
