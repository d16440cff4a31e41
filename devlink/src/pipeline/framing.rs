//! COBS byte stuffing with a `0x00` frame delimiter.

use bytes::{Bytes, BytesMut};

use super::{Frame, PipelineStage};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub const DELIMITER: u8 = 0x00;

/// Splits the byte stream on the delimiter and removes the stuffing.
///
/// Bytes after the last delimiter are kept until the rest of the frame
/// arrives. An unterminated run longer than `max_frame_len` is discarded.
pub struct FramingStage {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl FramingStage {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_len,
        }
    }
}

impl PipelineStage for FramingStage {
    fn name(&self) -> &'static str {
        "framing"
    }

    fn encode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let bytes = frame.into_bytes(self.name())?;
        let mut stuffed = cobs::encode_vec(&bytes);
        stuffed.push(DELIMITER);
        trace!(frame = %hex::encode(&stuffed), "Frame out.");
        out.push(Frame::Bytes(Bytes::from(stuffed)));
        Ok(())
    }

    fn decode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let chunk = frame.into_bytes(self.name())?;
        self.buffer.extend_from_slice(&chunk);

        let mut first_error = None;
        while let Some(pos) = self.buffer.iter().position(|b| *b == DELIMITER) {
            let raw = self.buffer.split_to(pos + 1);
            let stuffed = &raw[..pos];
            if stuffed.is_empty() {
                continue;
            }
            trace!(frame = %hex::encode(stuffed), "Frame in.");
            match cobs::decode_vec(stuffed) {
                Ok(unstuffed) => out.push(Frame::Bytes(Bytes::from(unstuffed))),
                Err(_) => {
                    first_error.get_or_insert(Error::Framing(format!(
                        "invalid byte stuffing in {} byte frame",
                        stuffed.len()
                    )));
                }
            }
        }

        if self.buffer.len() > self.max_frame_len {
            let dropped = self.buffer.len();
            self.buffer.clear();
            first_error.get_or_insert(Error::Framing(format!(
                "discarded {dropped} bytes without a frame delimiter"
            )));
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(stage: &mut FramingStage, data: &[u8]) -> Bytes {
        let mut out = Vec::new();
        stage
            .encode(Frame::Bytes(Bytes::copy_from_slice(data)), &mut out)
            .unwrap();
        out.remove(0).into_bytes("test").unwrap()
    }

    #[test]
    fn test_delimiter_never_inside_frame() {
        let mut stage = FramingStage::new(256);
        let wire = encode(&mut stage, &[0x00, 0x11, 0x00, 0x00, 0x22]);
        assert_eq!(wire.iter().filter(|b| **b == DELIMITER).count(), 1);
        assert_eq!(*wire.last().unwrap(), DELIMITER);
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let mut stage = FramingStage::new(256);
        let wire = encode(&mut stage, &[1, 0, 2, 3]);
        let (head, tail) = wire.split_at(2);

        let mut out = Vec::new();
        stage.decode(Frame::Bytes(Bytes::copy_from_slice(head)), &mut out).unwrap();
        assert!(out.is_empty());
        stage.decode(Frame::Bytes(Bytes::copy_from_slice(tail)), &mut out).unwrap();
        assert_eq!(out, vec![Frame::Bytes(Bytes::from_static(&[1, 0, 2, 3]))]);
    }

    #[test]
    fn test_several_frames_in_one_chunk() {
        let mut stage = FramingStage::new(256);
        let mut wire = encode(&mut stage, &[5]).to_vec();
        wire.extend_from_slice(&encode(&mut stage, &[6, 0]));

        let mut out = Vec::new();
        stage.decode(Frame::Bytes(Bytes::from(wire)), &mut out).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_overflow_discards_buffer() {
        let mut stage = FramingStage::new(4);
        let mut out = Vec::new();
        let result = stage.decode(Frame::Bytes(Bytes::from_static(&[1, 2, 3, 4, 5, 6])), &mut out);
        assert!(matches!(result, Err(Error::Framing(_))));

        let wire = encode(&mut stage, &[9]);
        stage.decode(Frame::Bytes(wire), &mut out).unwrap();
        assert_eq!(out, vec![Frame::Bytes(Bytes::from_static(&[9]))]);
    }
}
