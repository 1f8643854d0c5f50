//! Sealing of frame vectors into packet payloads.
//!
//! The wire format proper (public header, AEAD) lives outside this
//! workspace; this codec produces the sealed byte blob whose length the
//! ledgers account against the congestion window.

use crate::types::frame::Frame;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame encoding failed: {0}")]
    Encode(serde_cbor::Error),
    #[error("frame decoding failed: {0}")]
    Decode(serde_cbor::Error),
}

pub fn encode_frames(frames: &[Frame]) -> Result<Vec<u8>, CodecError> {
    serde_cbor::to_vec(&frames).map_err(CodecError::Encode)
}

pub fn decode_frames(raw: &[u8]) -> Result<Vec<Frame>, CodecError> {
    serde_cbor::from_slice(raw).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bytes::ByteBuf;

    #[test]
    fn frames_survive_sealing() {
        let frames = vec![
            Frame::Stream {
                stream_id: 5,
                offset: 1024,
                data: ByteBuf::from(vec![0xab; 32]),
                fin: true,
            },
            Frame::Ping,
        ];
        let raw = encode_frames(&frames).unwrap();
        assert_eq!(decode_frames(&raw).unwrap(), frames);
    }
}
