use super::{Frame, PipelineStage};
use crate::error::Result;
use crate::protocol::TypeTag;
use crate::type_cache::TypeCache;

/// Fills in and records message types on the way out.
///
/// An outbound packet with a concrete type registers that type; a packet
/// sent as [`TypeTag::Unknown`] gets the cached type. Inbound packets pass
/// through unchanged because the wire always carries the type.
pub struct TypeCacheStage {
    cache: TypeCache,
}

impl TypeCacheStage {
    pub fn new(cache: TypeCache) -> Self {
        Self { cache }
    }
}

impl PipelineStage for TypeCacheStage {
    fn name(&self) -> &'static str {
        "type_cache"
    }

    fn encode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let mut packet = frame.into_packet(self.name())?;
        if !packet.internal {
            if packet.type_tag == TypeTag::Unknown {
                if let Some(tag) = self.cache.type_of(&packet.message_id) {
                    packet.type_tag = tag;
                }
            } else {
                self.cache.register(&packet.message_id, packet.type_tag);
            }
        }
        out.push(Frame::Packet(packet));
        Ok(())
    }

    fn decode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        out.push(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageId, Packet};
    use serde_json::json;

    #[test]
    fn test_unknown_type_is_filled_from_cache() {
        let cache = TypeCache::new();
        cache.register(&MessageId::from("speed"), TypeTag::Uint16);
        let mut stage = TypeCacheStage::new(cache);

        let mut out = Vec::new();
        stage
            .encode(
                Frame::Packet(Packet::value("speed", TypeTag::Unknown, json!(10))),
                &mut out,
            )
            .unwrap();

        let packet = out.remove(0).into_packet("test").unwrap();
        assert_eq!(packet.type_tag, TypeTag::Uint16);
    }

    #[test]
    fn test_typed_send_registers() {
        let cache = TypeCache::new();
        let mut stage = TypeCacheStage::new(cache.clone());

        let mut out = Vec::new();
        stage
            .encode(
                Frame::Packet(Packet::value("mode", TypeTag::Uint8, json!(2))),
                &mut out,
            )
            .unwrap();

        assert_eq!(cache.type_of(&MessageId::from("mode")), Some(TypeTag::Uint8));
    }
}
