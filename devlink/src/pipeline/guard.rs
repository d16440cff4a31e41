use std::collections::HashSet;

use super::{Frame, PipelineStage};
use crate::error::{Error, Result};
use crate::protocol::MessageId;
use crate::tracing::prelude::*;
use crate::type_cache::TypeCache;

/// Drops inbound packets whose identifier is unknown to this connection.
///
/// An identifier is known if it is on the static allow-list or registered in
/// the connection's type cache. Internal link packets always pass.
pub struct MessageIdGuardStage {
    cache: TypeCache,
    allowed: HashSet<MessageId>,
}

impl MessageIdGuardStage {
    pub fn new(cache: TypeCache, allowed: impl IntoIterator<Item = MessageId>) -> Self {
        Self {
            cache,
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl PipelineStage for MessageIdGuardStage {
    fn name(&self) -> &'static str {
        "message_id_guard"
    }

    fn encode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        out.push(frame);
        Ok(())
    }

    fn decode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let packet = frame.into_packet(self.name())?;
        if packet.internal
            || self.allowed.contains(&packet.message_id)
            || self.cache.contains(&packet.message_id)
        {
            out.push(Frame::Packet(packet));
            return Ok(());
        }
        warn!(message_id = %packet.message_id, "Rejecting undefined message identifier.");
        Err(Error::UndefinedMessageIdentifier(packet.message_id))
    }
}
