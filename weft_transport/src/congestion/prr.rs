//! Proportional rate reduction: paces sends while a loss episode drains.

use weft_core::types::{ByteCount, DEFAULT_TCP_MSS};

#[derive(Debug, Default, Clone)]
pub struct PrrSender {
    bytes_sent_since_loss: ByteCount,
    bytes_delivered_since_loss: ByteCount,
    ack_count_since_loss: ByteCount,
    bytes_in_flight_before_loss: ByteCount,
}

impl PrrSender {
    pub fn on_packet_sent(&mut self, sent_bytes: ByteCount) {
        self.bytes_sent_since_loss += sent_bytes;
    }

    /// Snapshot the in-flight level the reduction proportions against.
    pub fn on_packet_lost(&mut self, bytes_in_flight: ByteCount) {
        self.bytes_sent_since_loss = 0;
        self.bytes_in_flight_before_loss = bytes_in_flight;
        self.bytes_delivered_since_loss = 0;
        self.ack_count_since_loss = 0;
    }

    pub fn on_packet_acked(&mut self, acked_bytes: ByteCount) {
        self.bytes_delivered_since_loss += acked_bytes;
        self.ack_count_since_loss += 1;
    }

    /// Whether recovery allows another packet out right now.
    pub fn can_send(
        &self,
        congestion_window: ByteCount,
        bytes_in_flight: ByteCount,
        slowstart_threshold: ByteCount,
    ) -> bool {
        // Keep the ack clock running right after the loss.
        if self.bytes_sent_since_loss == 0 || bytes_in_flight < DEFAULT_TCP_MSS {
            return true;
        }
        if congestion_window > bytes_in_flight {
            // Slow-start reduction bound: one extra MSS per ack.
            return self.bytes_delivered_since_loss + self.ack_count_since_loss * DEFAULT_TCP_MSS
                > self.bytes_sent_since_loss;
        }
        self.bytes_delivered_since_loss * slowstart_threshold
            > self.bytes_sent_since_loss * self.bytes_in_flight_before_loss
    }
}
