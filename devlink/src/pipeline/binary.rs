use bytes::{Bytes, BytesMut};

use super::{Frame, PipelineStage};
use crate::error::Result;
use crate::protocol::{decode_packet, encode_packet};

/// Converts between unstuffed frames and packets using the header layout in
/// [`crate::protocol`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryStage;

impl PipelineStage for BinaryStage {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn encode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let packet = frame.into_packet(self.name())?;
        let mut dst = BytesMut::new();
        encode_packet(&packet, &mut dst)?;
        out.push(Frame::Bytes(dst.freeze()));
        Ok(())
    }

    fn decode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let bytes: Bytes = frame.into_bytes(self.name())?;
        out.push(Frame::Packet(decode_packet(&bytes)?));
        Ok(())
    }
}
