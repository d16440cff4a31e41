use super::{Frame, PipelineStage};
use crate::codec::CodecRegistry;
use crate::error::{Error, Result};
use crate::protocol::Payload;
use crate::tracing::prelude::*;

/// Matches packets against the codec list.
///
/// On decode, the first codec claiming the packet turns the raw payload into
/// a value. With `error_if_no_match`, an unclaimed packet is an error;
/// otherwise it passes through with its raw payload. On encode, a value
/// payload always needs a codec, and raw payloads pass through untouched.
pub struct CodecStage {
    codecs: CodecRegistry,
    error_if_no_match: bool,
}

impl CodecStage {
    pub fn new(codecs: CodecRegistry, error_if_no_match: bool) -> Result<Self> {
        if codecs.is_empty() {
            return Err(Error::Construction("no codecs registered".into()));
        }
        Ok(Self {
            codecs,
            error_if_no_match,
        })
    }
}

impl PipelineStage for CodecStage {
    fn name(&self) -> &'static str {
        "codec"
    }

    fn encode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let mut packet = frame.into_packet(self.name())?;
        if let Payload::Value(value) = &packet.payload {
            let codec = self
                .codecs
                .find(&packet.message_id, packet.type_tag)
                .ok_or_else(|| Error::CodecMismatch {
                    message_id: packet.message_id.clone(),
                    type_tag: packet.type_tag,
                })?;
            packet.payload = Payload::Raw(codec.encode(value)?);
        }
        out.push(Frame::Packet(packet));
        Ok(())
    }

    fn decode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let mut packet = frame.into_packet(self.name())?;
        if let Payload::Raw(raw) = &packet.payload {
            match self.codecs.find(&packet.message_id, packet.type_tag) {
                Some(codec) => packet.payload = Payload::Value(codec.decode(raw)?),
                None if self.error_if_no_match => {
                    return Err(Error::CodecMismatch {
                        message_id: packet.message_id,
                        type_tag: packet.type_tag,
                    });
                }
                None => {
                    debug!(message_id = %packet.message_id, "No codec, passing raw payload.");
                }
            }
        }
        out.push(Frame::Packet(packet));
        Ok(())
    }
}
