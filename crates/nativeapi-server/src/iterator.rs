//! Resumable walk over the entity list, one step per connection tick.

use crate::entity::{EntityRef, EntityRegistry};

/// What the iterator asks its driver to do on a step.
#[derive(Debug)]
pub enum IteratorStep<'a> {
    Begin,
    Entity(&'a EntityRef),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Idle,
    Begin,
    Entity(usize),
    End,
}

/// Cursor used by the list-entities and initial-state walks.
///
/// Each [`advance`](EntityIterator::advance) performs at most one step. A
/// step the driver refuses (returns `false`) is repeated on the next call.
/// Internal entities are skipped without consulting the driver.
#[derive(Debug, Clone, Copy)]
pub struct EntityIterator {
    position: Position,
}

impl Default for EntityIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityIterator {
    /// An iterator that has nothing to do until [`begin`](Self::begin).
    pub fn new() -> Self {
        Self {
            position: Position::Idle,
        }
    }

    /// Restart from the beginning.
    pub fn begin(&mut self) {
        self.position = Position::Begin;
    }

    pub fn completed(&self) -> bool {
        self.position == Position::Idle
    }

    pub fn advance<R>(&mut self, registry: &R, mut step: impl FnMut(IteratorStep<'_>) -> bool)
    where
        R: EntityRegistry + ?Sized,
    {
        self.position = match self.position {
            Position::Idle => Position::Idle,
            Position::Begin => {
                if step(IteratorStep::Begin) {
                    Position::Entity(0)
                } else {
                    Position::Begin
                }
            }
            Position::Entity(at) => match registry.entities().get(at) {
                None => Position::End,
                Some(entity) if entity.info().internal => Position::Entity(at + 1),
                Some(entity) => {
                    if step(IteratorStep::Entity(entity)) {
                        Position::Entity(at + 1)
                    } else {
                        Position::Entity(at)
                    }
                }
            },
            Position::End => {
                if step(IteratorStep::End) {
                    Position::Idle
                } else {
                    Position::End
                }
            }
        };
    }
}
