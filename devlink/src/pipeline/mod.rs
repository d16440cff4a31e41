//! Ordered chain of bidirectional transforms between transport bytes and
//! application packets.
//!
//! Stages are listed from the wire towards the application:
//!
//! ```text
//! framing -> binary -> fragments -> codec -> type cache -> identifier guard
//! ```
//!
//! Inbound data is decoded by walking the list front to back; outbound
//! packets are encoded by walking it back to front, so every stage sees the
//! inverse of what it produced. The list is assembled once by
//! [`PipelineBuilder::finalize`] and cannot change afterwards.
//!
//! A stage may turn one frame into zero, one, or many frames: framing splits
//! a byte chunk into any number of frames, and fragment reassembly swallows
//! frames until a payload completes.

mod binary;
mod codec;
mod fragment;
mod framing;
mod guard;
mod type_cache;

pub use binary::BinaryStage;
pub use codec::CodecStage;
pub use fragment::FragmentStage;
pub use framing::FramingStage;
pub use guard::MessageIdGuardStage;
pub use type_cache::TypeCacheStage;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::Packet;
use crate::tracing::prelude::*;

/// Unit of data passed between stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Bytes, either a raw transport chunk or one unstuffed frame.
    Bytes(Bytes),
    Packet(Packet),
}

impl Frame {
    pub(crate) fn into_bytes(self, stage: &str) -> Result<Bytes> {
        match self {
            Frame::Bytes(bytes) => Ok(bytes),
            Frame::Packet(p) => Err(Error::Construction(format!(
                "{stage} stage expected bytes, got packet '{}'",
                p.message_id
            ))),
        }
    }

    pub(crate) fn into_packet(self, stage: &str) -> Result<Packet> {
        match self {
            Frame::Packet(packet) => Ok(packet),
            Frame::Bytes(_) => Err(Error::Construction(format!(
                "{stage} stage expected a packet, got bytes"
            ))),
        }
    }
}

/// One symmetric transform.
///
/// `encode` runs on outbound frames, `decode` on inbound ones. Both push
/// their results onto `out`; pushing nothing consumes the frame.
pub trait PipelineStage: Send {
    fn name(&self) -> &'static str;

    fn encode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()>;

    fn decode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()>;
}

/// Collects stages before the pipeline is locked.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage on the application side of those already added.
    pub fn stage(mut self, stage: impl PipelineStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Lock the stage list.
    pub fn finalize(self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(Error::Construction("pipeline has no stages".into()));
        }
        Ok(Pipeline {
            stages: self.stages,
        })
    }
}

/// Packets and per-frame failures produced by one inbound chunk.
#[derive(Debug, Default)]
pub struct Decoded {
    pub packets: Vec<Packet>,
    pub errors: Vec<Error>,
}

/// A finalized, immutable stage list.
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Encode one outbound packet into the byte frames to write.
    ///
    /// Any stage error aborts the packet.
    pub fn encode(&mut self, packet: Packet) -> Result<Vec<Bytes>> {
        let mut frames = vec![Frame::Packet(packet)];
        for stage in self.stages.iter_mut().rev() {
            let mut next = Vec::with_capacity(frames.len());
            for frame in frames {
                stage.encode(frame, &mut next)?;
            }
            frames = next;
        }
        frames.into_iter().map(|f| f.into_bytes("transport")).collect()
    }

    /// Decode one inbound transport chunk.
    ///
    /// A failing frame is dropped and reported in [`Decoded::errors`]; the
    /// other frames of the chunk continue through the chain.
    pub fn decode(&mut self, chunk: Bytes) -> Decoded {
        let mut decoded = Decoded::default();
        let mut frames = vec![Frame::Bytes(chunk)];
        for stage in self.stages.iter_mut() {
            let mut next = Vec::with_capacity(frames.len());
            for frame in frames {
                if let Err(e) = stage.decode(frame, &mut next) {
                    trace!(stage = stage.name(), error = %e, "Frame dropped.");
                    decoded.errors.push(e);
                }
            }
            frames = next;
        }
        for frame in frames {
            match frame.into_packet("application") {
                Ok(packet) => decoded.packets.push(packet),
                Err(e) => decoded.errors.push(e),
            }
        }
        decoded
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::protocol::{MessageId, Payload, TypeTag};
    use crate::type_cache::TypeCache;
    use serde_json::json;

    fn full_pipeline(cache: TypeCache) -> Pipeline {
        PipelineBuilder::new()
            .stage(FramingStage::new(1024))
            .stage(BinaryStage)
            .stage(FragmentStage::new(100).unwrap())
            .stage(CodecStage::new(CodecRegistry::with_defaults([]), true).unwrap())
            .stage(TypeCacheStage::new(cache.clone()))
            .stage(MessageIdGuardStage::new(cache, [MessageId::from("name")]))
            .finalize()
            .unwrap()
    }

    #[test]
    fn test_empty_pipeline_is_rejected() {
        assert!(matches!(
            PipelineBuilder::new().finalize(),
            Err(Error::Construction(_))
        ));
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let pipeline = full_pipeline(TypeCache::new());
        assert_eq!(
            pipeline.stage_names(),
            ["framing", "binary", "fragments", "codec", "type_cache", "message_id_guard"]
        );
    }

    #[test]
    fn test_value_survives_both_directions() {
        let cache = TypeCache::new();
        let mut host = full_pipeline(cache.clone());
        let mut device = full_pipeline(cache);

        let out = host
            .encode(Packet::value("temps", TypeTag::Int16, json!([21, -4, 300])))
            .unwrap();
        let wire: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();

        let decoded = device.decode(Bytes::from(wire));
        assert!(decoded.errors.is_empty(), "{:?}", decoded.errors);
        assert_eq!(decoded.packets.len(), 1);
        assert_eq!(decoded.packets[0].payload, Payload::Value(json!([21, -4, 300])));
    }

    #[test]
    fn test_bad_frame_does_not_poison_chunk() {
        let mut host = full_pipeline(TypeCache::new());
        let mut device = full_pipeline(TypeCache::new());

        let good = host
            .encode(Packet::value("name", TypeTag::Char, json!("psu")))
            .unwrap();
        let mut wire = vec![0x13, 0x37, 0x00];
        wire.extend(good.iter().flat_map(|b| b.iter().copied()));

        let decoded = device.decode(Bytes::from(wire));
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(decoded.packets.len(), 1);
    }
}
