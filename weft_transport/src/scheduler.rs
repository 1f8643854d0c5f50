//! Packet-to-path scheduling, redundant duplication bookkeeping and
//! cross-path ACK reconciliation.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use weft_core::types::{ByteCount, PacketNumber, PathId, INITIAL_PATH_ID};

use crate::config::SchedulerAlgorithm;
use crate::path::Path;

/// Paths keyed by id; the BTreeMap keeps selection deterministic.
pub type PathMap = BTreeMap<PathId, Arc<Path>>;

/// Identifier of a packet across paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DupId {
    path_id: PathId,
    packet_number: PacketNumber,
}

/// Counter snapshot consumed by the stats logger.
#[derive(Debug, Clone, Default)]
pub struct SchedulerCounters {
    pub duplicated_packets: u64,
    pub dropped_duplicated_packets: u64,
    pub duplicated_stream_bytes: ByteCount,
    pub cw_blocks: u64,
    pub lower_rtt_schedules: u64,
    pub path_switches: u64,
    pub best_path_selection: HashMap<PathId, u64>,
}

#[derive(Debug)]
pub struct Scheduler {
    algorithm: SchedulerAlgorithm,
    /// Per-path send counters used by round robin and tie breaks.
    quotas: HashMap<PathId, u64>,
    /// Duplicated packets mapped to their shadow copy for selective drop.
    dup_packets: HashMap<DupId, DupId>,

    duplicated_packets: u64,
    dropped_duplicated_packets: u64,
    duplicated_stream_bytes: ByteCount,

    last_path: Option<PathId>,
    path_switches: u64,
    cw_blocks: u64,
    lower_rtt_schedules: u64,
    best_path_selection: HashMap<PathId, u64>,

    /// Shortlist of copy targets for the in-flight scheduling decision.
    redundant_paths: Vec<PathId>,
}

impl Scheduler {
    pub fn new(algorithm: SchedulerAlgorithm) -> Self {
        Self {
            algorithm,
            quotas: HashMap::new(),
            dup_packets: HashMap::new(),
            duplicated_packets: 0,
            dropped_duplicated_packets: 0,
            duplicated_stream_bytes: 0,
            last_path: None,
            path_switches: 0,
            cw_blocks: 0,
            lower_rtt_schedules: 0,
            best_path_selection: HashMap::new(),
            redundant_paths: Vec::new(),
        }
    }

    /// Pick the path the next packet should be sealed on, or `None` when no
    /// path is eligible. The shortlist of redundant copy targets for this
    /// decision is available through [`Self::redundant_paths`] afterwards.
    pub fn select_path(
        &mut self,
        paths: &PathMap,
        has_retransmission: bool,
        has_stream_retransmission: bool,
        from_path: Option<&Arc<Path>>,
    ) -> Option<Arc<Path>> {
        self.redundant_paths.clear();

        if let Some(pth) =
            self.select_initial_path(paths, has_retransmission, has_stream_retransmission, from_path)
        {
            return Some(pth);
        }

        match self.algorithm {
            SchedulerAlgorithm::LowRtt => self.select_path_low_latency(paths, has_retransmission),
            SchedulerAlgorithm::RoundRobin => {
                self.select_path_round_robin(paths, has_retransmission)
            }
            SchedulerAlgorithm::OppRedundant => {
                self.select_redundant_paths(paths, has_retransmission)
            }
            SchedulerAlgorithm::UtilRepair => {
                self.select_path_util_repair(paths, has_retransmission, has_stream_retransmission)
            }
        }
    }

    /// Bootstrap step: keep path 0 alive while it is alone, and steer
    /// retransmissions off unmeasured paths onto quieter peers.
    fn select_initial_path(
        &mut self,
        paths: &PathMap,
        has_retransmission: bool,
        has_stream_retransmission: bool,
        from_path: Option<&Arc<Path>>,
    ) -> Option<Arc<Path>> {
        if paths.len() <= 1 {
            let pth = paths.get(&INITIAL_PATH_ID)?;
            if !has_retransmission && !pth.sending_allowed() {
                return None;
            }
            return Some(pth.clone());
        }

        if has_retransmission && has_stream_retransmission {
            if let Some(from) = from_path {
                if from.smoothed_rtt().is_zero() {
                    let current_quota = self.quota_of(from.path_id);
                    for (&path_id, pth) in paths {
                        if path_id == INITIAL_PATH_ID || path_id == from.path_id {
                            continue;
                        }
                        if self.quota_of(path_id) < current_quota {
                            return Some(pth.clone());
                        }
                    }
                }
            }
        }

        None
    }

    fn select_path_low_latency(
        &mut self,
        paths: &PathMap,
        has_retransmission: bool,
    ) -> Option<Arc<Path>> {
        let mut selected: Option<Arc<Path>> = None;
        let mut lower_rtt = Duration::ZERO;
        let mut selected_quota = 0u64;

        for (&path_id, pth) in paths {
            // Retransmissions may exceed the congestion window.
            if !has_retransmission && !pth.sending_allowed() {
                continue;
            }
            if pth.potentially_failed() {
                continue;
            }
            if path_id == INITIAL_PATH_ID {
                continue;
            }

            let current_rtt = pth.smoothed_rtt();

            // A path with a sample always beats an unmeasured one.
            if !lower_rtt.is_zero() && current_rtt.is_zero() {
                continue;
            }

            // Unmeasured paths tie-break on the lower quota.
            if current_rtt.is_zero() {
                let current_quota = self.quota_of(path_id);
                if selected.is_some() && current_quota > selected_quota {
                    continue;
                }
            }

            if !current_rtt.is_zero()
                && !lower_rtt.is_zero()
                && selected.is_some()
                && current_rtt >= lower_rtt
            {
                continue;
            }

            selected_quota = self.quota_of(path_id);
            lower_rtt = current_rtt;
            selected = Some(pth.clone());
        }

        selected
    }

    fn select_path_round_robin(
        &mut self,
        paths: &PathMap,
        has_retransmission: bool,
    ) -> Option<Arc<Path>> {
        let mut selected: Option<Arc<Path>> = None;
        let mut lower_quota = u64::MAX;

        for (&path_id, pth) in paths {
            if !has_retransmission && !pth.sending_allowed() {
                continue;
            }
            if pth.potentially_failed() || path_id == INITIAL_PATH_ID {
                continue;
            }
            let quota = self.quota_of(path_id);
            if quota < lower_quota {
                selected = Some(pth.clone());
                lower_quota = quota;
            }
        }

        selected
    }

    /// First eligible path sends, every other eligible path is shortlisted
    /// for a copy.
    fn select_redundant_paths(
        &mut self,
        paths: &PathMap,
        has_retransmission: bool,
    ) -> Option<Arc<Path>> {
        let mut selected: Option<Arc<Path>> = None;

        for (&path_id, pth) in paths {
            if !has_retransmission && !pth.sending_allowed() {
                continue;
            }
            if pth.potentially_failed() || path_id == INITIAL_PATH_ID {
                continue;
            }
            if selected.is_none() {
                selected = Some(pth.clone());
            } else {
                self.redundant_paths.push(path_id);
            }
        }

        selected
    }

    /// Utilize the highest-throughput path; when it is window-blocked,
    /// repair onto a lower-RTT path and fill idle capacity with copies.
    fn select_path_util_repair(
        &mut self,
        paths: &PathMap,
        has_retransmission: bool,
        has_stream_retransmission: bool,
    ) -> Option<Arc<Path>> {
        struct PathStat {
            path: Arc<Path>,
            rtt: f64,
            throughput: f64,
        }

        let mut stats: Vec<PathStat> = Vec::new();
        let mut best: Option<usize> = None;

        for (&path_id, pth) in paths {
            if pth.potentially_failed() || path_id == INITIAL_PATH_ID {
                continue;
            }
            let rtt = pth.smoothed_rtt().as_secs_f64();
            let throughput = if rtt > 0.0 {
                pth.congestion_window() as f64 / rtt
            } else {
                0.0
            };
            stats.push(PathStat {
                path: pth.clone(),
                rtt,
                throughput,
            });
            let idx = stats.len() - 1;
            if best.map_or(true, |b| stats[b].throughput < throughput) {
                best = Some(idx);
            }
        }

        // Retransmission pressure: replicate on every free path.
        if has_retransmission && has_stream_retransmission {
            for stat in &stats {
                if stat.path.sending_allowed() {
                    self.redundant_paths.push(stat.path.path_id);
                }
            }
            let first = *self.redundant_paths.first()?;
            return paths.get(&first).cloned();
        }

        let best_idx = best?;
        let best_path = stats[best_idx].path.clone();
        let max_rtt = stats[best_idx].rtt;
        *self
            .best_path_selection
            .entry(best_path.path_id)
            .or_insert(0) += 1;

        if best_path.congestion_free() && best_path.overshoot_free(stats.len()) {
            return Some(best_path);
        }

        self.cw_blocks += 1;
        if stats.len() > 1 {
            stats.remove(best_idx);
            stats.sort_by(|a, b| {
                b.throughput
                    .partial_cmp(&a.throughput)
                    .unwrap_or(CmpOrdering::Equal)
            });

            let mut lower_rtt_path: Option<Arc<Path>> = None;
            for stat in &stats {
                if !stat.path.congestion_free() {
                    continue;
                }
                if stat.rtt < max_rtt {
                    if lower_rtt_path.is_none() {
                        lower_rtt_path = Some(stat.path.clone());
                        self.lower_rtt_schedules += 1;
                    }
                } else {
                    // Replicate onto capacity that would otherwise idle.
                    self.redundant_paths.push(stat.path.path_id);
                }
            }
            return lower_rtt_path;
        }

        None
    }

    /// Copy targets chosen by the current scheduling decision.
    pub fn redundant_paths(&self) -> &[PathId] {
        &self.redundant_paths
    }

    pub fn quota_of(&self, path_id: PathId) -> u64 {
        self.quotas.get(&path_id).copied().unwrap_or(0)
    }

    pub fn increment_quota(&mut self, path_id: PathId) {
        *self.quotas.entry(path_id).or_insert(0) += 1;
    }

    /// Track path switches across selections, including drops to "no path".
    pub fn note_selection(&mut self, selected: Option<PathId>) {
        if let Some(last) = self.last_path {
            if selected != Some(last) {
                self.path_switches += 1;
            }
        }
        self.last_path = selected;
    }

    pub fn is_duplicated(&self, path_id: PathId, packet_number: PacketNumber) -> bool {
        self.dup_packets.contains_key(&DupId {
            path_id,
            packet_number,
        })
    }

    /// Register a duplication. The reverse mapping is only added when the
    /// original may be dropped on a copy ACK (asymmetric droppability).
    pub fn register_duplicate(
        &mut self,
        original: (PathId, PacketNumber),
        copy: (PathId, PacketNumber),
        original_droppable: bool,
        stream_bytes: ByteCount,
    ) {
        let original = DupId {
            path_id: original.0,
            packet_number: original.1,
        };
        let copy = DupId {
            path_id: copy.0,
            packet_number: copy.1,
        };
        self.dup_packets.insert(original, copy);
        if original_droppable {
            self.dup_packets.insert(copy, original);
        }
        self.duplicated_packets += 1;
        self.duplicated_stream_bytes += stream_bytes;
    }

    /// An ACK for `(path_id, packet_number)` retires the shadow copy on its
    /// peer path, if one is still in flight. Lookup misses are NOPs.
    pub fn cross_ack_handling(
        &mut self,
        paths: &PathMap,
        path_id: PathId,
        packet_number: PacketNumber,
    ) {
        let key = DupId {
            path_id,
            packet_number,
        };
        if let Some(peer) = self.dup_packets.get(&key).copied() {
            if let Some(pth) = paths.get(&peer.path_id) {
                if pth.remove_packet_by_number(peer.packet_number) {
                    debug!(
                        path = path_id,
                        packet = packet_number,
                        peer_path = peer.path_id,
                        peer_packet = peer.packet_number,
                        "dropped duplicated packet"
                    );
                    self.dropped_duplicated_packets += 1;
                }
            }
            self.dup_packets.remove(&peer);
        }
        self.dup_packets.remove(&key);
    }

    pub fn duplicate_map_len(&self) -> usize {
        self.dup_packets.len()
    }

    pub fn counters(&self) -> SchedulerCounters {
        SchedulerCounters {
            duplicated_packets: self.duplicated_packets,
            dropped_duplicated_packets: self.dropped_duplicated_packets,
            duplicated_stream_bytes: self.duplicated_stream_bytes,
            cw_blocks: self.cw_blocks,
            lower_rtt_schedules: self.lower_rtt_schedules,
            path_switches: self.path_switches,
            best_path_selection: self.best_path_selection.clone(),
        }
    }
}
