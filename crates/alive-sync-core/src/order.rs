//! Display order of a record collection.
//!
//! The index always holds each live record id exactly once. It is mutated
//! only through [`OrderIndex::push`], [`OrderIndex::remove`] and
//! [`OrderIndex::move_to`].

use crate::record::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Result of a [`OrderIndex::move_to`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    /// The record moved from one position to another
    Moved {
        /// Position before the move
        from: usize,
        /// Position after the move
        to: usize,
    },
    /// The record already sat at the requested (clamped) position
    Unchanged,
    /// The record is not in the index
    Missing,
}

/// Authoritative ordered sequence of record ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderIndex {
    ids: Vec<RecordId>,
}

impl OrderIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from ids, dropping repeats after their first
    /// occurrence.
    #[must_use]
    pub fn from_ids(ids: impl IntoIterator<Item = RecordId>) -> Self {
        let mut seen = HashSet::new();
        let ids = ids.into_iter().filter(|id| seen.insert(*id)).collect();
        Self { ids }
    }

    /// Append `id` at the tail, returning its position.
    ///
    /// An id already present keeps its current position.
    pub fn push(&mut self, id: RecordId) -> usize {
        if let Some(position) = self.position(id) {
            return position;
        }
        self.ids.push(id);
        self.ids.len() - 1
    }

    /// Remove `id`, returning the position it occupied.
    pub fn remove(&mut self, id: RecordId) -> Option<usize> {
        let position = self.position(id)?;
        self.ids.remove(position);
        Some(position)
    }

    /// Move `id` to `new_position`, clamped to `[0, len - 1]`.
    pub fn move_to(&mut self, id: RecordId, new_position: usize) -> Move {
        let Some(from) = self.position(id) else {
            return Move::Missing;
        };
        let to = new_position.min(self.ids.len() - 1);
        if from == to {
            return Move::Unchanged;
        }

        let moved = self.ids.remove(from);
        self.ids.insert(to, moved);
        Move::Moved { from, to }
    }

    /// Current position of `id`.
    #[must_use]
    pub fn position(&self, id: RecordId) -> Option<usize> {
        self.ids.iter().position(|candidate| *candidate == id)
    }

    /// Whether `id` is in the index.
    #[must_use]
    pub fn contains(&self, id: RecordId) -> bool {
        self.ids.contains(&id)
    }

    /// The ids in display order.
    #[must_use]
    pub fn as_slice(&self) -> &[RecordId] {
        &self.ids
    }

    /// Owned copy of the ids in display order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<RecordId> {
        self.ids.clone()
    }

    /// Number of records in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether the index is exactly a permutation of `live`.
    #[must_use]
    pub fn is_permutation_of(&self, live: &HashSet<RecordId>) -> bool {
        let unique: HashSet<RecordId> = self.ids.iter().copied().collect();
        unique.len() == self.ids.len() && unique == *live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<RecordId> {
        raw.iter().copied().map(RecordId).collect()
    }

    #[test]
    fn from_ids_drops_repeats() {
        let order = OrderIndex::from_ids(ids(&[3, 1, 3, 2, 1]));
        assert_eq!(order.as_slice(), ids(&[3, 1, 2]).as_slice());
    }

    #[test]
    fn move_to_head_and_tail() {
        let mut order = OrderIndex::from_ids(ids(&[1, 2, 3, 4]));

        assert_eq!(order.move_to(RecordId(4), 0), Move::Moved { from: 3, to: 0 });
        assert_eq!(order.as_slice(), ids(&[4, 1, 2, 3]).as_slice());

        assert_eq!(order.move_to(RecordId(1), 2), Move::Moved { from: 1, to: 2 });
        assert_eq!(order.as_slice(), ids(&[4, 2, 1, 3]).as_slice());
    }

    #[test]
    fn move_to_clamps_past_the_end() {
        let mut order = OrderIndex::from_ids(ids(&[1, 2, 3]));
        assert_eq!(order.move_to(RecordId(1), 99), Move::Moved { from: 0, to: 2 });
        assert_eq!(order.as_slice(), ids(&[2, 3, 1]).as_slice());

        // Already last, clamped target equals current position
        assert_eq!(order.move_to(RecordId(1), 50), Move::Unchanged);
    }

    #[test]
    fn move_to_same_position_is_unchanged() {
        let mut order = OrderIndex::from_ids(ids(&[1, 2, 3]));
        assert_eq!(order.move_to(RecordId(2), 1), Move::Unchanged);
        assert_eq!(order.move_to(RecordId(9), 0), Move::Missing);
        assert_eq!(order.as_slice(), ids(&[1, 2, 3]).as_slice());
    }

    #[test]
    fn stays_a_permutation_through_mixed_operations() {
        let mut order = OrderIndex::new();
        let mut live = HashSet::new();

        for step in 0..40u64 {
            match step % 5 {
                0 | 1 => {
                    let id = RecordId(step);
                    order.push(id);
                    live.insert(id);
                }
                2 => {
                    if let Some(first) = order.as_slice().first().copied() {
                        order.remove(first);
                        live.remove(&first);
                    }
                }
                _ => {
                    if let Some(last) = order.as_slice().last().copied() {
                        let _ = order.move_to(last, usize::try_from(step).unwrap() % 3);
                    }
                }
            }
            assert!(order.is_permutation_of(&live), "step {step}");
        }
    }

    #[test]
    fn push_existing_keeps_position() {
        let mut order = OrderIndex::from_ids(ids(&[1, 2]));
        assert_eq!(order.push(RecordId(1)), 0);
        assert_eq!(order.len(), 2);
        assert_eq!(order.push(RecordId(3)), 2);
    }
}
