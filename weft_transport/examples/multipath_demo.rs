//! Drives a two-path session over in-memory connections and prints the
//! scheduler's summary report.
//!
//! Run with: cargo run --example multipath_demo

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_bytes::ByteBuf;

use weft_core::types::frame::{AckFrame, Frame};
use weft_transport::path::MemoryConn;
use weft_transport::stats::StatsLogger;
use weft_transport::{SchedulerAlgorithm, Session, TransportConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    weft_transport::logging::init_dev_logging();

    let config = TransportConfig::builder()
        .scheduler(SchedulerAlgorithm::LowRtt)
        .build();
    let session = Arc::new(Session::new(config));

    let conns: Vec<Arc<MemoryConn>> = (0..3).map(|_| MemoryConn::new()).collect();
    for conn in &conns {
        session.add_path(conn.clone());
    }

    // Push a handful of packets through; the peer answers in 15ms on
    // path 1 and 45ms on path 2.
    let mut acked = [0u64; 3];
    let mut peer_pn = [0u64; 3];
    for i in 0..20u64 {
        session.queue_stream_frame(Frame::Stream {
            stream_id: 1,
            offset: i * 1000,
            data: ByteBuf::from(vec![0u8; 1000]),
            fin: false,
        });
        session.send_packets().await?;

        for (path_id, delay_ms) in [(1u8, 15u64), (2, 45)] {
            let sent = conns[path_id as usize].sent_count() as u64;
            if sent == acked[path_id as usize] {
                continue;
            }
            acked[path_id as usize] = sent;
            peer_pn[path_id as usize] += 1;
            let ack = AckFrame {
                largest_acked: sent,
                lowest_acked: 1,
                ranges: vec![(1, sent)],
                delay_time: Duration::ZERO,
            };
            session.handle_frames(
                path_id,
                peer_pn[path_id as usize],
                vec![Frame::Ack(ack)],
                40,
                Instant::now() + Duration::from_millis(delay_ms),
            )?;
        }
    }

    let report = StatsLogger::build_report(&session);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
