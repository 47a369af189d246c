//! Sends that could not go out immediately because the socket was full.
//!
//! An entry names *what* to send (an entity plus which of its messages), not
//! the encoded bytes. When the entry finally fires the message is rebuilt
//! from the entity's current state, so a backlog never replays stale values.

use crate::entity::EntityRef;

/// Which message of an entity to (re)send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sendable {
    /// The `ListEntities*Response` describing the entity.
    Info,
    /// The `*StateResponse` carrying its current state.
    State,
}

/// One queued send.
#[derive(Debug, Clone)]
pub struct DeferredMessage {
    pub entity: EntityRef,
    pub sendable: Sendable,
}

impl PartialEq for DeferredMessage {
    fn eq(&self, other: &Self) -> bool {
        self.sendable == other.sendable && self.entity.same(&other.entity)
    }
}

/// FIFO of pending sends, holding each `(entity, sendable)` pair at most once.
#[derive(Debug, Default)]
pub struct DeferredMessageQueue {
    queue: Vec<DeferredMessage>,
}

impl DeferredMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a send. A pending entry for the same pair is replaced in place,
    /// keeping its position.
    pub fn defer(&mut self, entity: EntityRef, sendable: Sendable) {
        let item = DeferredMessage { entity, sendable };
        match self.queue.iter_mut().find(|queued| **queued == item) {
            Some(queued) => *queued = item,
            None => self.queue.push(item),
        }
    }

    /// Hand entries to `try_send` front to back, dropping each one it
    /// accepts. Stops at the first refusal so order is preserved.
    pub fn process(&mut self, mut try_send: impl FnMut(&DeferredMessage) -> bool) {
        let sent = self.queue.iter().take_while(|item| try_send(*item)).count();
        self.queue.drain(..sent);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeferredMessage> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entities, EntityInfo, SensorTraits, StateBus};
    use proptest::prelude::*;

    fn two_entities() -> (EntityRef, EntityRef) {
        let mut entities = Entities::new(StateBus::new());
        let a = entities.add_sensor(EntityInfo::new("A"), SensorTraits::default());
        let b = entities.add_text_sensor(EntityInfo::new("B"));
        (EntityRef::Sensor(a), EntityRef::TextSensor(b))
    }

    #[test]
    fn test_same_pair_is_deduplicated() {
        let (a, _) = two_entities();
        let mut queue = DeferredMessageQueue::new();
        queue.defer(a.clone(), Sendable::State);
        queue.defer(a.clone(), Sendable::State);
        assert_eq!(queue.len(), 1);

        // Info and state of the same entity are distinct entries.
        queue.defer(a, Sendable::Info);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_replacement_keeps_position() {
        let (a, b) = two_entities();
        let mut queue = DeferredMessageQueue::new();
        queue.defer(a.clone(), Sendable::State);
        queue.defer(b.clone(), Sendable::State);
        queue.defer(a.clone(), Sendable::State);

        let order: Vec<u32> = queue.iter().map(|m| m.entity.key()).collect();
        assert_eq!(order, vec![a.key(), b.key()]);
    }

    #[test]
    fn test_process_stops_at_first_failure() {
        let (a, b) = two_entities();
        let mut queue = DeferredMessageQueue::new();
        queue.defer(a.clone(), Sendable::Info);
        queue.defer(b.clone(), Sendable::Info);
        queue.defer(a.clone(), Sendable::State);

        let mut attempts = Vec::new();
        queue.process(|m| {
            attempts.push((m.entity.key(), m.sendable));
            m.entity.key() == a.key()
        });

        // The second entry was refused, so the third was never tried.
        assert_eq!(
            attempts,
            vec![(a.key(), Sendable::Info), (b.key(), Sendable::Info)]
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.iter().next().map(|m| m.entity.key()), Some(b.key()));

        queue.process(|_| true);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn test_queue_holds_first_occurrence_order(
            defers in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..50)
        ) {
            let (a, b) = two_entities();
            let mut queue = DeferredMessageQueue::new();
            let mut expected: Vec<(u32, Sendable)> = Vec::new();
            for (first, info) in defers {
                let entity = if first { a.clone() } else { b.clone() };
                let sendable = if info { Sendable::Info } else { Sendable::State };
                let pair = (entity.key(), sendable);
                if !expected.contains(&pair) {
                    expected.push(pair);
                }
                queue.defer(entity, sendable);
            }

            let queued: Vec<(u32, Sendable)> =
                queue.iter().map(|m| (m.entity.key(), m.sendable)).collect();
            prop_assert_eq!(queued, expected);
        }
    }
}
