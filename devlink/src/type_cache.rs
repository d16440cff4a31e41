//! Per-connection cache of message types.
//!
//! Applications may send packets without spelling out their type once the
//! type for that identifier is known. The cache maps each message identifier
//! to its type tag and a small slot number assigned on first registration.
//! The identifier validation stage also consults it: a registered identifier
//! is admitted even when it is not on the static allow-list.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::protocol::{MessageId, TypeTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    type_tag: TypeTag,
    slot: u16,
}

/// Shared handle to one connection's type cache.
///
/// Cloning yields another handle to the same cache; the factory hands one to
/// the type cache stage and one to the validation stage.
#[derive(Debug, Clone, Default)]
pub struct TypeCache {
    inner: Arc<RwLock<HashMap<MessageId, Entry>>>,
}

impl TypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache preloaded with identifiers known ahead of time.
    pub fn seeded<'a>(entries: impl IntoIterator<Item = (&'a MessageId, &'a TypeTag)>) -> Self {
        let cache = Self::new();
        for (id, tag) in entries {
            cache.register(id, *tag);
        }
        cache
    }

    /// Register a type descriptor and return its slot.
    ///
    /// Registering the same identifier again returns the slot it already
    /// has; a changed type tag replaces the cached one.
    pub fn register(&self, message_id: &MessageId, type_tag: TypeTag) -> u16 {
        let mut entries = self.inner.write();
        let next_slot = entries.len() as u16;
        let entry = entries.entry(message_id.clone()).or_insert(Entry {
            type_tag,
            slot: next_slot,
        });
        if type_tag != TypeTag::Unknown {
            entry.type_tag = type_tag;
        }
        entry.slot
    }

    pub fn type_of(&self, message_id: &MessageId) -> Option<TypeTag> {
        self.inner
            .read()
            .get(message_id)
            .map(|e| e.type_tag)
            .filter(|t| *t != TypeTag::Unknown)
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.inner.read().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let cache = TypeCache::new();
        let led = MessageId::from("led_state");

        let first = cache.register(&led, TypeTag::Uint8);
        let second = cache.register(&led, TypeTag::Uint8);

        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_descriptors_get_distinct_slots() {
        let cache = TypeCache::new();
        let a = cache.register(&MessageId::from("a"), TypeTag::Uint8);
        let b = cache.register(&MessageId::from("b"), TypeTag::Float);
        assert_ne!(a, b);
    }

    #[test]
    fn test_retype_keeps_slot() {
        let cache = TypeCache::new();
        let id = MessageId::from("speed");
        let slot = cache.register(&id, TypeTag::Uint16);
        assert_eq!(cache.register(&id, TypeTag::Float), slot);
        assert_eq!(cache.type_of(&id), Some(TypeTag::Float));
    }

    #[test]
    fn test_handles_share_state() {
        let cache = TypeCache::new();
        let other = cache.clone();
        cache.register(&MessageId::from("x"), TypeTag::Int32);
        assert!(other.contains(&MessageId::from("x")));
    }
}
