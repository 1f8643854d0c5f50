//! Frame queues feeding the packer: fresh stream data, retransmission
//! re-injections and the pop-queues for path control frames.

use std::collections::{HashMap, VecDeque};

use weft_core::types::frame::Frame;
use weft_core::types::PathId;

#[derive(Debug, Default)]
pub struct StreamFramer {
    send_queue: VecDeque<Frame>,
    retransmission_queue: VecDeque<Frame>,
    window_update_queue: VecDeque<Frame>,
    /// Highest window offset queued per stream. A retransmitted update
    /// below this has been superseded and must not go out again.
    window_offsets: HashMap<u32, u64>,
    close_path_queue: VecDeque<Frame>,
    add_address_queue: VecDeque<Frame>,
    paths_queue: VecDeque<Frame>,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh application data.
    pub fn queue_stream_frame(&mut self, frame: Frame) {
        self.send_queue.push_back(frame);
    }

    /// Stream frames from a lost packet go back to the front of the line.
    pub fn add_frame_for_retransmission(&mut self, frame: Frame) {
        self.retransmission_queue.push_back(frame);
    }

    pub fn has_frames_for_retransmission(&self) -> bool {
        !self.retransmission_queue.is_empty()
    }

    pub fn has_data(&self) -> bool {
        !self.send_queue.is_empty() || !self.retransmission_queue.is_empty()
    }

    /// Retransmissions first, then fresh data, bounded by `max_bytes` of
    /// payload. At least one frame is returned when any is queued.
    pub fn pop_frames(&mut self, max_bytes: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut used = 0usize;
        loop {
            let next_size = match self
                .retransmission_queue
                .front()
                .or_else(|| self.send_queue.front())
            {
                Some(frame) => frame.wire_size_hint(),
                None => break,
            };
            if !frames.is_empty() && used + next_size > max_bytes {
                break;
            }
            let Some(frame) = self
                .retransmission_queue
                .pop_front()
                .or_else(|| self.send_queue.pop_front())
            else {
                break;
            };
            used += next_size;
            frames.push(frame);
        }
        frames
    }

    pub fn queue_window_update(&mut self, stream_id: u32, byte_offset: u64) {
        let highest = self.window_offsets.entry(stream_id).or_insert(0);
        if byte_offset > *highest {
            *highest = byte_offset;
        }
        self.window_update_queue.push_back(Frame::WindowUpdate {
            stream_id,
            byte_offset,
        });
    }

    /// Whether a retransmitted window update still carries the stream's
    /// current offset.
    pub fn window_update_still_relevant(&self, stream_id: u32, byte_offset: u64) -> bool {
        byte_offset >= self.window_offsets.get(&stream_id).copied().unwrap_or(0)
    }

    /// Drain the pending window updates.
    pub fn window_update_frames(&mut self) -> Vec<Frame> {
        self.window_update_queue.drain(..).collect()
    }

    pub fn queue_close_path(&mut self, path_id: PathId) {
        self.close_path_queue.push_back(Frame::ClosePath { path_id });
    }

    pub fn pop_close_path_frame(&mut self) -> Option<Frame> {
        self.close_path_queue.pop_front()
    }

    pub fn queue_add_address(&mut self, addr: String) {
        self.add_address_queue.push_back(Frame::AddAddress { addr });
    }

    pub fn pop_add_address_frame(&mut self) -> Option<Frame> {
        self.add_address_queue.pop_front()
    }

    /// Schedule a PATHS frame advertising the given path set.
    pub fn queue_paths_frame(&mut self, path_ids: Vec<PathId>) {
        self.paths_queue.push_back(Frame::Paths { path_ids });
    }

    pub fn pop_paths_frame(&mut self) -> Option<Frame> {
        self.paths_queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bytes::ByteBuf;

    fn stream(offset: u64, len: usize) -> Frame {
        Frame::Stream {
            stream_id: 1,
            offset,
            data: ByteBuf::from(vec![0u8; len]),
            fin: false,
        }
    }

    #[test]
    fn retransmissions_preempt_fresh_data() {
        let mut framer = StreamFramer::new();
        framer.queue_stream_frame(stream(100, 10));
        framer.add_frame_for_retransmission(stream(0, 10));
        let frames = framer.pop_frames(1000);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Stream { offset: 0, .. }));
        assert!(!framer.has_data());
    }

    #[test]
    fn pop_respects_the_byte_budget() {
        let mut framer = StreamFramer::new();
        framer.queue_stream_frame(stream(0, 600));
        framer.queue_stream_frame(stream(600, 600));
        framer.queue_stream_frame(stream(1200, 600));
        let frames = framer.pop_frames(1300);
        assert_eq!(frames.len(), 2);
        assert!(framer.has_data());
    }

    #[test]
    fn oversized_frames_still_move() {
        let mut framer = StreamFramer::new();
        framer.queue_stream_frame(stream(0, 5000));
        assert_eq!(framer.pop_frames(1300).len(), 1);
    }

    #[test]
    fn control_queues_pop_in_order() {
        let mut framer = StreamFramer::new();
        framer.queue_close_path(2);
        framer.queue_add_address("10.0.0.2:4433".into());
        framer.queue_paths_frame(vec![0, 1, 2]);
        assert_eq!(
            framer.pop_close_path_frame(),
            Some(Frame::ClosePath { path_id: 2 })
        );
        assert!(framer.pop_close_path_frame().is_none());
        assert!(framer.pop_add_address_frame().is_some());
        assert!(framer.pop_paths_frame().is_some());
    }

    #[test]
    fn window_updates_drain() {
        let mut framer = StreamFramer::new();
        framer.queue_window_update(1, 4096);
        assert_eq!(framer.window_update_frames().len(), 1);
        assert!(framer.window_update_frames().is_empty());
    }

    #[test]
    fn superseded_window_updates_lose_relevance() {
        let mut framer = StreamFramer::new();
        framer.queue_window_update(7, 4096);
        assert!(framer.window_update_still_relevant(7, 4096));
        assert!(!framer.window_update_still_relevant(7, 1024));
        framer.queue_window_update(7, 8192);
        assert!(!framer.window_update_still_relevant(7, 4096));
        // Streams that never advertised a window are unaffected.
        assert!(framer.window_update_still_relevant(9, 0));
    }
}
