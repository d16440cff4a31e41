use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

use super::{Frame, PipelineStage};
use crate::error::{Error, Result};
use crate::protocol::{Fragment, MessageId, Packet, Payload};
use crate::tracing::prelude::*;

struct Partial {
    header: Packet,
    total: usize,
    buf: BytesMut,
}

/// Splits payloads longer than `max_payload` into ordered fragments and
/// reassembles them on receipt.
///
/// Partial payloads are buffered per message identifier. A leading fragment
/// arriving while an earlier payload for the same identifier is incomplete
/// discards the earlier one.
pub struct FragmentStage {
    max_payload: usize,
    partial: HashMap<MessageId, Partial>,
}

impl FragmentStage {
    pub fn new(max_payload: usize) -> Result<Self> {
        if max_payload == 0 {
            return Err(Error::Construction("maximum fragment length must be non-zero".into()));
        }
        Ok(Self {
            max_payload,
            partial: HashMap::new(),
        })
    }
}

impl PipelineStage for FragmentStage {
    fn name(&self) -> &'static str {
        "fragments"
    }

    fn encode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let packet = frame.into_packet(self.name())?;
        let Some(payload) = packet.raw_payload().cloned() else {
            return Err(Error::Protocol(format!(
                "'{}' reached fragmentation with an unencoded value",
                packet.message_id
            )));
        };
        if payload.len() <= self.max_payload {
            out.push(Frame::Packet(packet));
            return Ok(());
        }

        let total = u16::try_from(payload.len()).map_err(|_| {
            Error::Protocol(format!(
                "payload of '{}' is {} bytes, above the fragmentable maximum",
                packet.message_id,
                payload.len()
            ))
        })?;
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + self.max_payload).min(payload.len());
            let mut piece = packet.clone();
            piece.fragment = Some(Fragment {
                offset: offset as u16,
                total,
            });
            piece.payload = Payload::Raw(payload.slice(offset..end));
            out.push(Frame::Packet(piece));
            offset = end;
        }
        Ok(())
    }

    fn decode(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let packet = frame.into_packet(self.name())?;
        let Some(fragment) = packet.fragment else {
            out.push(Frame::Packet(packet));
            return Ok(());
        };
        let piece = packet.raw_payload().cloned().unwrap_or_default();
        let id = packet.message_id.clone();

        if fragment.is_leading() {
            if self.partial.remove(&id).is_some() {
                debug!(message_id = %id, "Discarding incomplete payload.");
            }
            let mut header = packet;
            header.fragment = None;
            header.payload = Payload::Raw(Bytes::new());
            self.partial.insert(
                id.clone(),
                Partial {
                    header,
                    total: fragment.total as usize,
                    buf: BytesMut::with_capacity(fragment.total as usize),
                },
            );
        }

        let Some(partial) = self.partial.get_mut(&id) else {
            return Err(Error::Protocol(format!(
                "fragment of '{id}' at offset {} without a leading fragment",
                fragment.offset
            )));
        };
        if fragment.offset as usize != partial.buf.len() || fragment.total as usize != partial.total {
            self.partial.remove(&id);
            return Err(Error::Protocol(format!(
                "fragment of '{id}' out of sequence at offset {}",
                fragment.offset
            )));
        }

        partial.buf.extend_from_slice(&piece);
        if partial.buf.len() > partial.total {
            self.partial.remove(&id);
            return Err(Error::Protocol(format!("fragments of '{id}' overrun their total")));
        }
        if partial.buf.len() == partial.total {
            if let Some(done) = self.partial.remove(&id) {
                let mut packet = done.header;
                packet.payload = Payload::Raw(done.buf.freeze());
                out.push(Frame::Packet(packet));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TypeTag;
    use test_case::test_case;

    fn split(stage: &mut FragmentStage, packet: Packet) -> Vec<Frame> {
        let mut out = Vec::new();
        stage.encode(Frame::Packet(packet), &mut out).unwrap();
        out
    }

    fn join(stage: &mut FragmentStage, frames: Vec<Frame>) -> Vec<Packet> {
        let mut out = Vec::new();
        for frame in frames {
            stage.decode(frame, &mut out).unwrap();
        }
        out.into_iter().map(|f| f.into_packet("test").unwrap()).collect()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test_case(0, 1 ; "empty")]
    #[test_case(1, 1 ; "tiny")]
    #[test_case(100, 1 ; "exactly max")]
    #[test_case(101, 2 ; "just over")]
    #[test_case(200, 2 ; "two full")]
    #[test_case(250, 3 ; "three")]
    #[test_case(999, 10 ; "many")]
    fn test_round_trip(len: usize, fragments: usize) {
        let mut stage = FragmentStage::new(100).unwrap();
        let original = Packet::raw("blob", TypeTag::Byte, payload(len));

        let frames = split(&mut stage, original.clone());
        assert_eq!(frames.len(), fragments);

        let packets = join(&mut stage, frames);
        assert_eq!(packets, vec![original]);
    }

    #[test]
    fn test_new_leading_fragment_discards_incomplete() {
        let mut stage = FragmentStage::new(100).unwrap();
        let first = split(&mut stage, Packet::raw("blob", TypeTag::Byte, payload(250)));
        let second = Packet::raw("blob", TypeTag::Byte, vec![0xee; 150]);

        let mut frames: Vec<Frame> = first.into_iter().take(2).collect();
        frames.extend(split(&mut stage, second.clone()));

        assert_eq!(join(&mut stage, frames), vec![second]);
    }

    #[test]
    fn test_orphan_fragment_is_rejected() {
        let mut stage = FragmentStage::new(100).unwrap();
        let frames = split(&mut stage, Packet::raw("blob", TypeTag::Byte, payload(250)));
        let orphan = frames.into_iter().nth(1).unwrap();

        let mut out = Vec::new();
        assert!(stage.decode(orphan, &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_interleaved_identifiers_do_not_merge() {
        let mut stage = FragmentStage::new(100).unwrap();
        let a = Packet::raw("a", TypeTag::Byte, vec![1; 150]);
        let b = Packet::raw("b", TypeTag::Byte, vec![2; 150]);
        let mut fa = split(&mut stage, a.clone());
        let mut fb = split(&mut stage, b.clone());

        let frames = vec![fa.remove(0), fb.remove(0), fa.remove(0), fb.remove(0)];
        assert_eq!(join(&mut stage, frames), vec![a, b]);
    }

    #[test]
    fn test_zero_max_is_a_construction_error() {
        assert!(matches!(FragmentStage::new(0), Err(Error::Construction(_))));
    }
}
