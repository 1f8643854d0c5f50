//! A path binds one socket pair to its own RTT, congestion and packet
//! accounting state.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use weft_core::types::frame::{AckFrame, Frame};
use weft_core::types::{ByteCount, PacketNumber, PathId};

use crate::ackhandler::{Packet, ReceivedPacketHandler, SentPacketHandler};
use crate::config::TransportConfig;
use crate::congestion::VegasSender;
use crate::error::Result;

/// Socket endpoint of a path. Real traffic goes over [`UdpConn`]; tests
/// and benches use [`MemoryConn`].
#[async_trait]
pub trait PathConn: Send + Sync + fmt::Debug {
    async fn write(&self, data: &[u8]) -> io::Result<usize>;
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> SocketAddr;
}

/// `PathConn` over a connected UDP socket.
#[derive(Debug)]
pub struct UdpConn {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl UdpConn {
    pub async fn connect(local: SocketAddr, remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            remote_addr: remote,
        })
    }
}

#[async_trait]
impl PathConn for UdpConn {
    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send(data).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// In-memory endpoint recording every datagram written to it.
#[derive(Debug, Default)]
pub struct MemoryConn {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryConn {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

#[async_trait]
impl PathConn for MemoryConn {
    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1))
    }
}

#[derive(Debug)]
struct Handlers {
    sent: SentPacketHandler,
    recv: ReceivedPacketHandler,
}

/// One addressable network route with its own congestion state.
///
/// The handler pair is guarded by a mutex that is only held for short
/// non-blocking sections; socket writes happen outside of it.
#[derive(Debug)]
pub struct Path {
    pub path_id: PathId,
    conn: Arc<dyn PathConn>,
    /// Veto set by upper-layer failure detection.
    potentially_failed: AtomicBool,
    /// Last least-unacked broadcast from the send loop.
    least_unacked: AtomicU64,
    handlers: Mutex<Handlers>,
}

impl Path {
    pub fn new(path_id: PathId, conn: Arc<dyn PathConn>, config: &TransportConfig) -> Self {
        let congestion = Box::new(VegasSender::new(
            config.initial_congestion_window,
            config.max_congestion_window,
            config.loss_event_threshold,
        ));
        Self {
            path_id,
            conn,
            potentially_failed: AtomicBool::new(false),
            least_unacked: AtomicU64::new(1),
            handlers: Mutex::new(Handlers {
                sent: SentPacketHandler::new(path_id, congestion),
                recv: ReceivedPacketHandler::new(path_id),
            }),
        }
    }

    pub fn potentially_failed(&self) -> bool {
        self.potentially_failed.load(Ordering::Relaxed)
    }

    pub fn set_potentially_failed(&self, failed: bool) {
        self.potentially_failed.store(failed, Ordering::Relaxed);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.conn.write(data).await
    }

    pub fn sending_allowed(&self) -> bool {
        self.handlers.lock().unwrap().sent.sending_allowed()
    }

    pub fn congestion_free(&self) -> bool {
        self.handlers.lock().unwrap().sent.congestion_free()
    }

    pub fn overshoot_free(&self, num_paths: usize) -> bool {
        self.handlers.lock().unwrap().sent.overshoot_free(num_paths)
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.handlers.lock().unwrap().sent.rtt_stats().smoothed_rtt()
    }

    pub fn congestion_window(&self) -> ByteCount {
        self.handlers.lock().unwrap().sent.get_congestion_window()
    }

    pub fn bytes_in_flight(&self) -> ByteCount {
        self.handlers.lock().unwrap().sent.get_bytes_in_flight()
    }

    pub fn sent_packet(&self, packet: Packet) -> Result<()> {
        self.handlers.lock().unwrap().sent.sent_packet(packet)
    }

    pub fn received_ack(
        &self,
        ack: &AckFrame,
        with_packet_number: PacketNumber,
        recv_time: Instant,
    ) -> Result<Vec<PacketNumber>> {
        self.handlers
            .lock()
            .unwrap()
            .sent
            .received_ack(ack, with_packet_number, recv_time)
    }

    pub fn dequeue_retransmission(&self) -> Option<Packet> {
        self.handlers
            .lock()
            .unwrap()
            .sent
            .dequeue_packet_for_retransmission()
    }

    pub fn remove_packet_by_number(&self, packet_number: PacketNumber) -> bool {
        self.handlers
            .lock()
            .unwrap()
            .sent
            .remove_packet_by_number(packet_number)
    }

    pub fn duplicate_packet(&self, packet_number: PacketNumber) {
        self.handlers
            .lock()
            .unwrap()
            .sent
            .duplicate_packet(packet_number);
    }

    pub fn get_stop_waiting_frame(&self, force: bool) -> Option<Frame> {
        self.handlers.lock().unwrap().sent.get_stop_waiting_frame(force)
    }

    pub fn should_send_retransmittable_packet(&self) -> bool {
        self.handlers
            .lock()
            .unwrap()
            .sent
            .should_send_retransmittable_packet()
    }

    /// Refresh the least-unacked broadcast from the ledger.
    pub fn update_least_unacked(&self) {
        let lu = self.handlers.lock().unwrap().sent.get_least_unacked();
        self.least_unacked.store(lu, Ordering::Relaxed);
    }

    pub fn least_unacked(&self) -> PacketNumber {
        self.least_unacked.load(Ordering::Relaxed)
    }

    pub fn alarm_timeout(&self) -> Option<Instant> {
        self.handlers.lock().unwrap().sent.get_alarm_timeout()
    }

    pub fn on_alarm(&self, now: Instant) {
        self.handlers.lock().unwrap().sent.on_alarm(now);
    }

    pub fn set_inflight_as_lost(&self) {
        self.handlers.lock().unwrap().sent.set_inflight_as_lost();
    }

    pub fn on_connection_migration(&self) {
        self.handlers.lock().unwrap().sent.on_connection_migration();
    }

    /// `(sent, retransmissions, lost, bytes)` from the ledger.
    pub fn sent_statistics(&self) -> (u64, u64, u64, ByteCount) {
        self.handlers.lock().unwrap().sent.get_statistics()
    }

    /// `(packets, bytes)` accepted by the receive side.
    pub fn recv_statistics(&self) -> (u64, ByteCount) {
        self.handlers.lock().unwrap().recv.get_statistics()
    }

    pub fn received_packet(
        &self,
        packet_number: PacketNumber,
        should_instigate_ack: bool,
        length: ByteCount,
    ) {
        self.handlers
            .lock()
            .unwrap()
            .recv
            .received_packet(packet_number, should_instigate_ack, length);
    }

    /// Peer stop-waiting advances the receive side's lower limit.
    pub fn handle_stop_waiting(&self, least_unacked: PacketNumber) {
        self.handlers
            .lock()
            .unwrap()
            .recv
            .set_lower_limit(least_unacked);
    }

    pub fn get_ack_frame(&self) -> Option<AckFrame> {
        self.handlers.lock().unwrap().recv.get_ack_frame()
    }

    pub fn request_close_path(&self) {
        self.handlers.lock().unwrap().recv.queue_close_path();
    }

    pub fn get_close_path_frame(&self) -> Option<Frame> {
        self.handlers.lock().unwrap().recv.get_close_path_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bytes::ByteBuf;
    use weft_core::types::EncryptionLevel;

    fn path() -> (Path, Arc<MemoryConn>) {
        let conn = MemoryConn::new();
        let path = Path::new(1, conn.clone(), &TransportConfig::default());
        (path, conn)
    }

    fn data_packet(pn: PacketNumber) -> Packet {
        let frames = vec![Frame::Stream {
            stream_id: 1,
            offset: 0,
            data: ByteBuf::from(vec![0u8; 64]),
            fin: false,
        }];
        Packet {
            packet_number: pn,
            path_id: 1,
            dup_droppable: Packet::dup_droppable_frames(&frames),
            frames,
            length: 80,
            encryption_level: EncryptionLevel::ForwardSecure,
            send_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn writes_go_to_the_conn() {
        let (path, conn) = path();
        path.send(b"hello").await.unwrap();
        assert_eq!(conn.sent_count(), 1);
        assert_eq!(conn.take_sent(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn failure_flag_is_an_input_signal() {
        let (path, _conn) = path();
        assert!(!path.potentially_failed());
        path.set_potentially_failed(true);
        assert!(path.potentially_failed());
    }

    #[test]
    fn fresh_path_allows_sending() {
        let (path, _conn) = path();
        assert!(path.sending_allowed());
        assert!(path.congestion_free());
        assert!(path.smoothed_rtt().is_zero());
    }

    #[test]
    fn ledger_is_reachable_through_the_path() {
        let (path, _conn) = path();
        path.sent_packet(data_packet(1)).unwrap();
        assert_eq!(path.bytes_in_flight(), 80);
        assert!(path.remove_packet_by_number(1));
        assert_eq!(path.bytes_in_flight(), 0);
    }

    #[test]
    fn least_unacked_broadcast() {
        let (path, _conn) = path();
        path.sent_packet(data_packet(1)).unwrap();
        path.update_least_unacked();
        assert_eq!(path.least_unacked(), 1);
    }
}
