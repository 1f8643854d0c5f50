//! Session glue: the send loop that drives the scheduler, redundant
//! duplication, and the receive-side dispatch back into the ledgers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tracing::{debug, info};

use weft_core::types::frame::Frame;
use weft_core::types::{ByteCount, EncryptionLevel, PacketNumber, PathId, INITIAL_PATH_ID};

use crate::ackhandler::Packet;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::framer::StreamFramer;
use crate::packer::{PackedPacket, Packer};
use crate::path::{Path, PathConn};
use crate::scheduler::{PathMap, Scheduler, SchedulerCounters};

pub struct Session {
    config: TransportConfig,
    paths: RwLock<PathMap>,
    scheduler: Mutex<Scheduler>,
    packer: Mutex<Packer>,
    stream_framer: Mutex<StreamFramer>,
    handshake_complete: AtomicBool,
    all_sent_packets: AtomicU64,
    /// Stream frames surfaced by the receive side, awaiting the reassembler.
    received_streams: Mutex<VecDeque<Frame>>,
}

impl Session {
    pub fn new(config: TransportConfig) -> Self {
        let scheduler = Scheduler::new(config.scheduler);
        Self {
            config,
            paths: RwLock::new(PathMap::new()),
            scheduler: Mutex::new(scheduler),
            packer: Mutex::new(Packer::new()),
            stream_framer: Mutex::new(StreamFramer::new()),
            handshake_complete: AtomicBool::new(false),
            all_sent_packets: AtomicU64::new(0),
            received_streams: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Register a path. The first one becomes the initial path.
    pub fn add_path(&self, conn: Arc<dyn PathConn>) -> PathId {
        let mut paths = self.paths.write().unwrap();
        let path_id = paths
            .keys()
            .next_back()
            .map(|&id| id + 1)
            .unwrap_or(INITIAL_PATH_ID);
        info!(path = path_id, remote = %conn.remote_addr(), "path added");
        paths.insert(path_id, Arc::new(Path::new(path_id, conn, &self.config)));
        path_id
    }

    pub fn path(&self, path_id: PathId) -> Option<Arc<Path>> {
        self.paths.read().unwrap().get(&path_id).cloned()
    }

    pub fn paths_snapshot(&self) -> Vec<Arc<Path>> {
        self.paths.read().unwrap().values().cloned().collect()
    }

    pub fn set_handshake_complete(&self) {
        self.handshake_complete.store(true, Ordering::Relaxed);
    }

    pub fn queue_stream_frame(&self, frame: Frame) {
        self.stream_framer.lock().unwrap().queue_stream_frame(frame);
    }

    pub fn queue_window_update(&self, stream_id: u32, byte_offset: u64) {
        self.stream_framer
            .lock()
            .unwrap()
            .queue_window_update(stream_id, byte_offset);
    }

    /// Stream frames received so far, in arrival order.
    pub fn pop_received_stream(&self) -> Option<Frame> {
        self.received_streams.lock().unwrap().pop_front()
    }

    pub fn all_sent_packets(&self) -> u64 {
        self.all_sent_packets.load(Ordering::Relaxed)
    }

    pub fn scheduler_counters(&self) -> SchedulerCounters {
        self.scheduler.lock().unwrap().counters()
    }

    /// Walk all paths for retransmissions. Handshake packets are returned
    /// for immediate re-packing; stream frames are re-injected into the
    /// framer and control frames re-queued on their origin path.
    fn get_retransmission(&self) -> (bool, Option<Packet>, Option<Arc<Path>>) {
        let mut has_retransmission = false;
        let mut from_path = None;

        loop {
            let dequeued = {
                let paths = self.paths.read().unwrap();
                let mut found = None;
                for pth in paths.values() {
                    if let Some(packet) = pth.dequeue_retransmission() {
                        found = Some((packet, pth.clone()));
                        break;
                    }
                }
                found
            };
            let Some((packet, pth)) = dequeued else {
                break;
            };
            has_retransmission = true;
            from_path = Some(pth.clone());

            if packet.encryption_level != EncryptionLevel::ForwardSecure {
                if self.handshake_complete.load(Ordering::Relaxed) {
                    // Stale handshake data once the handshake is done.
                    continue;
                }
                debug!(packet = packet.packet_number, "dequeued handshake retransmission");
                return (true, Some(packet), Some(pth));
            }

            debug!(
                packet = packet.packet_number,
                path = pth.path_id,
                "dequeued retransmission"
            );
            let mut packer = self.packer.lock().unwrap();
            let mut framer = self.stream_framer.lock().unwrap();
            for frame in packet.frames_for_retransmission() {
                match frame {
                    stream @ Frame::Stream { .. } => framer.add_frame_for_retransmission(stream),
                    Frame::WindowUpdate {
                        stream_id,
                        byte_offset,
                    } => {
                        // Only while no newer update went out for the
                        // stream in the meantime.
                        if framer.window_update_still_relevant(stream_id, byte_offset) {
                            packer.queue_control_frame(
                                Frame::WindowUpdate {
                                    stream_id,
                                    byte_offset,
                                },
                                pth.path_id,
                            );
                        }
                    }
                    Frame::Paths { .. } => {
                        // Advertise the current path set instead of the
                        // stale one.
                        let path_ids: Vec<PathId> =
                            self.paths.read().unwrap().keys().copied().collect();
                        framer.queue_paths_frame(path_ids);
                    }
                    other => packer.queue_control_frame(other, pth.path_id),
                }
            }
        }

        (has_retransmission, None, from_path)
    }

    /// One pass of the send loop: drain retransmissions and fresh data onto
    /// scheduled paths until nothing is selectable, then flush ACKs.
    ///
    /// Socket errors on primary sends are fatal to the session and
    /// propagate out of here.
    pub async fn send_packets(&self) -> Result<()> {
        {
            let paths = self.paths.read().unwrap();
            for pth in paths.values() {
                pth.update_least_unacked();
            }
        }

        let mut window_update_frames = self.stream_framer.lock().unwrap().window_update_frames();

        loop {
            let (has_retransmission, handshake_packet, from_path) = self.get_retransmission();
            let has_stream_retransmission = self
                .stream_framer
                .lock()
                .unwrap()
                .has_frames_for_retransmission();

            let (selected, redundant) = {
                let paths = self.paths.read().unwrap();
                let mut scheduler = self.scheduler.lock().unwrap();
                let selected = scheduler.select_path(
                    &paths,
                    has_retransmission,
                    has_stream_retransmission,
                    from_path.as_ref(),
                );
                scheduler.note_selection(selected.as_ref().map(|p| p.path_id));
                (selected, scheduler.redundant_paths().to_vec())
            };

            let Some(pth) = selected else {
                let wufs = std::mem::take(&mut window_update_frames);
                return self.ack_remaining_paths(wufs).await;
            };

            if let Some(packet) = handshake_packet {
                // Handshake retransmissions bypass the framer and carry a
                // forced stop-waiting.
                let packed = {
                    let mut packer = self.packer.lock().unwrap();
                    if let Some(swf) = pth.get_stop_waiting_frame(true) {
                        packer.queue_control_frame(swf, pth.path_id);
                    }
                    packer.pack_handshake_retransmission(&packet, &pth)?
                };
                self.send_packed_tracked(&packed, &pth).await?;
                continue;
            }

            {
                let mut packer = self.packer.lock().unwrap();
                let ack = pth.get_ack_frame();
                let has_ack = ack.is_some();
                if let Some(ack) = ack {
                    packer.queue_control_frame(Frame::Ack(ack), pth.path_id);
                }
                if has_ack || has_stream_retransmission {
                    if let Some(swf) = pth.get_stop_waiting_frame(has_stream_retransmission) {
                        packer.queue_control_frame(swf, pth.path_id);
                    }
                }

                let mut framer = self.stream_framer.lock().unwrap();
                if let Some(cpf) = pth.get_close_path_frame() {
                    packer.queue_control_frame(cpf, pth.path_id);
                }
                while let Some(f) = framer.pop_close_path_frame() {
                    packer.queue_control_frame(f, pth.path_id);
                }
                while let Some(f) = framer.pop_add_address_frame() {
                    packer.queue_control_frame(f, pth.path_id);
                }
                while let Some(f) = framer.pop_paths_frame() {
                    packer.queue_control_frame(f, pth.path_id);
                }
            }

            let Some(packet) = self
                .perform_packet_sending(&mut window_update_frames, &pth)
                .await?
            else {
                let wufs = std::mem::take(&mut window_update_frames);
                return self.ack_remaining_paths(wufs).await;
            };

            if self.config.redundant_sending && !redundant.is_empty() {
                self.red_send_packet(&pth, &packet).await?;
            } else if pth.smoothed_rtt().is_zero() && !self.config.redundant_sending {
                // A path we know nothing about carried data: prime a
                // quieter peer with a copy.
                self.prime_unmeasured_path(&pth, &packet).await;
            }

            if let Some(from) = &from_path {
                if from.potentially_failed() {
                    self.send_ping(from).await?;
                }
            }
        }
    }

    /// Seal and send one packet on `pth`, updating its quota. Returns the
    /// ledger record, or `None` when there was nothing to pack.
    async fn perform_packet_sending(
        &self,
        window_update_frames: &mut Vec<Frame>,
        pth: &Arc<Path>,
    ) -> Result<Option<Packet>> {
        let packed = {
            let mut packer = self.packer.lock().unwrap();
            if pth.should_send_retransmittable_packet() {
                packer.queue_control_frame(Frame::Ping, pth.path_id);
            }
            for frame in window_update_frames.iter() {
                packer.queue_control_frame(frame.clone(), pth.path_id);
            }
            let mut framer = self.stream_framer.lock().unwrap();
            packer.pack_packet(pth, &mut framer)?
        };
        let Some(packed) = packed else {
            return Ok(None);
        };

        debug!(
            path = pth.path_id,
            packet = packed.number,
            size = packed.raw.len(),
            "sending packet"
        );
        let packet = self.send_packed_tracked(&packed, pth).await?;

        // Window updates go out twice; the second copy rides the next
        // packet on this path.
        {
            let mut packer = self.packer.lock().unwrap();
            for frame in window_update_frames.iter() {
                packer.queue_control_frame(frame.clone(), pth.path_id);
            }
        }
        window_update_frames.clear();

        self.scheduler.lock().unwrap().increment_quota(pth.path_id);
        Ok(Some(packet))
    }

    /// Track the packet in its path's ledger, then hand it to the socket.
    /// The ledger goes first so an ACK racing the send finds the record.
    async fn send_packed_tracked(&self, packed: &PackedPacket, pth: &Arc<Path>) -> Result<Packet> {
        let packet = Packet {
            packet_number: packed.number,
            path_id: pth.path_id,
            dup_droppable: Packet::dup_droppable_frames(&packed.frames),
            frames: packed.frames.clone(),
            length: packed.raw.len() as ByteCount,
            encryption_level: packed.encryption_level,
            send_time: Instant::now(),
        };
        pth.sent_packet(packet.clone())?;
        pth.send(&packed.raw).await?;
        self.all_sent_packets.fetch_add(1, Ordering::Relaxed);
        Ok(packet)
    }

    /// Flush pending ACKs and window updates on every path that has any.
    /// Pure ACKs are kept off the initial path only when it has nothing to
    /// acknowledge itself.
    async fn ack_remaining_paths(&self, mut window_update_frames: Vec<Frame>) -> Result<()> {
        if window_update_frames.is_empty() {
            window_update_frames = self.stream_framer.lock().unwrap().window_update_frames();
        }
        let paths = self.paths_snapshot();
        for pth in paths {
            let ack = pth.get_ack_frame();
            if ack.is_none() && window_update_frames.is_empty() {
                continue;
            }
            if pth.path_id == INITIAL_PATH_ID && ack.is_none() {
                continue;
            }
            let has_ack = ack.is_some();
            let packed = {
                let mut packer = self.packer.lock().unwrap();
                if let Some(swf) = pth.get_stop_waiting_frame(false) {
                    packer.queue_control_frame(swf, pth.path_id);
                }
                if let Some(ack) = ack {
                    packer.queue_control_frame(Frame::Ack(ack), pth.path_id);
                }
                for frame in &window_update_frames {
                    packer.queue_control_frame(frame.clone(), pth.path_id);
                }
                if has_ack {
                    packer.pack_control_packet(&pth)?
                } else {
                    let mut framer = self.stream_framer.lock().unwrap();
                    packer.pack_packet(&pth, &mut framer)?
                }
            };
            if let Some(packed) = packed {
                self.send_packed_tracked(&packed, &pth).await?;
            }
        }
        Ok(())
    }

    /// Re-seal the packet's duplicable frames on every shortlisted path.
    /// Failures here are swallowed per path; the primary already went out.
    async fn red_send_packet(&self, primary: &Arc<Path>, packet: &Packet) -> Result<()> {
        let Some(frames) = packet.copy_frames() else {
            // Nothing worth duplicating; at least flush ACKs.
            return self.ack_remaining_paths(Vec::new()).await;
        };

        let redundant: Vec<Arc<Path>> = {
            let paths = self.paths.read().unwrap();
            let scheduler = self.scheduler.lock().unwrap();
            scheduler
                .redundant_paths()
                .iter()
                .filter_map(|id| paths.get(id).cloned())
                .collect()
        };

        for red_pth in redundant {
            if red_pth.path_id == INITIAL_PATH_ID || red_pth.path_id == primary.path_id {
                continue;
            }
            if self
                .scheduler
                .lock()
                .unwrap()
                .is_duplicated(primary.path_id, packet.packet_number)
            {
                continue;
            }

            let packed = match self
                .packer
                .lock()
                .unwrap()
                .seal_copy(frames.clone(), &red_pth)
            {
                Ok(packed) => packed,
                Err(err) => {
                    debug!(path = red_pth.path_id, %err, "redundant seal failed");
                    continue;
                }
            };
            info!(
                packet = packet.packet_number,
                path = red_pth.path_id,
                "duplicating packet"
            );
            let copy = match self.send_packed_tracked(&packed, &red_pth).await {
                Ok(copy) => copy,
                Err(err) => {
                    debug!(path = red_pth.path_id, %err, "redundant send failed");
                    continue;
                }
            };

            self.scheduler.lock().unwrap().register_duplicate(
                (primary.path_id, packet.packet_number),
                (copy.path_id, copy.packet_number),
                packet.dup_droppable,
                packet.stream_frame_length(),
            );
        }

        Ok(())
    }

    /// Copy the packet onto one non-initial peer with a lower quota and
    /// sending headroom. Errors are swallowed; priming is opportunistic.
    async fn prime_unmeasured_path(&self, pth: &Arc<Path>, packet: &Packet) {
        let Some(frames) = packet.copy_frames() else {
            return;
        };
        let target = {
            let paths = self.paths.read().unwrap();
            let scheduler = self.scheduler.lock().unwrap();
            let current_quota = scheduler.quota_of(pth.path_id);
            paths
                .iter()
                .find(|(&path_id, peer)| {
                    path_id != INITIAL_PATH_ID
                        && path_id != pth.path_id
                        && scheduler.quota_of(path_id) < current_quota
                        && peer.sending_allowed()
                })
                .map(|(_, peer)| peer.clone())
        };
        let Some(target) = target else {
            return;
        };

        pth.duplicate_packet(packet.packet_number);
        let packed = match self.packer.lock().unwrap().seal_copy(frames, &target) {
            Ok(packed) => packed,
            Err(err) => {
                debug!(path = target.path_id, %err, "priming seal failed");
                return;
            }
        };
        match self.send_packed_tracked(&packed, &target).await {
            Ok(copy) => {
                self.scheduler.lock().unwrap().register_duplicate(
                    (pth.path_id, packet.packet_number),
                    (copy.path_id, copy.packet_number),
                    true,
                    packet.stream_frame_length(),
                );
            }
            Err(err) => {
                debug!(path = target.path_id, %err, "priming send failed");
            }
        }
    }

    async fn send_ping(&self, pth: &Arc<Path>) -> Result<()> {
        let packed = {
            let mut packer = self.packer.lock().unwrap();
            packer.queue_control_frame(Frame::Ping, pth.path_id);
            packer.pack_control_packet(pth)?
        };
        if let Some(packed) = packed {
            debug!(path = pth.path_id, "pinging potentially failed path");
            self.send_packed_tracked(&packed, pth).await?;
        }
        Ok(())
    }

    /// Receive-side entry: decode a sealed payload arriving on a path.
    pub fn handle_packet(
        &self,
        path_id: PathId,
        packet_number: PacketNumber,
        raw: &[u8],
        recv_time: Instant,
    ) -> Result<()> {
        let frames = weft_core::codec::decode_frames(raw)?;
        self.handle_frames(path_id, packet_number, frames, raw.len() as ByteCount, recv_time)
    }

    /// Book the packet with the receiving path and dispatch its frames.
    /// Protocol violations inside ACK frames terminate the session.
    pub fn handle_frames(
        &self,
        path_id: PathId,
        packet_number: PacketNumber,
        frames: Vec<Frame>,
        length: ByteCount,
        recv_time: Instant,
    ) -> Result<()> {
        let pth = self
            .path(path_id)
            .ok_or(TransportError::UnknownPath(path_id))?;

        let instigates_ack = frames.iter().any(|f| f.is_retransmittable());
        pth.received_packet(packet_number, instigates_ack, length);

        for frame in frames {
            match frame {
                Frame::Ack(ack) => {
                    let acked = pth.received_ack(&ack, packet_number, recv_time)?;
                    let paths = self.paths.read().unwrap();
                    let mut scheduler = self.scheduler.lock().unwrap();
                    for pn in acked {
                        scheduler.cross_ack_handling(&paths, path_id, pn);
                    }
                }
                Frame::StopWaiting { least_unacked } => pth.handle_stop_waiting(least_unacked),
                stream @ Frame::Stream { .. } => {
                    self.received_streams.lock().unwrap().push_back(stream);
                }
                Frame::ClosePath { .. } => pth.request_close_path(),
                Frame::Ping
                | Frame::WindowUpdate { .. }
                | Frame::AddAddress { .. }
                | Frame::Paths { .. } => {}
            }
        }
        Ok(())
    }

    /// Earliest pending loss-detection alarm across paths.
    pub fn next_alarm(&self) -> Option<Instant> {
        self.paths
            .read()
            .unwrap()
            .values()
            .filter_map(|pth| pth.alarm_timeout())
            .min()
    }

    /// Fire every path alarm that is due.
    pub fn on_alarm(&self, now: Instant) {
        let paths = self.paths_snapshot();
        for pth in paths {
            if pth.alarm_timeout().is_some_and(|t| t <= now) {
                pth.on_alarm(now);
            }
        }
    }
}
