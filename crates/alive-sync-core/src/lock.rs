//! Per-field edit locks.
//!
//! The table maps a [`FieldKey`] to the [`SessionId`] holding it. An absent
//! entry means the field is unlocked; there is never more than one holder
//! per key.

use crate::record::{FieldKey, RecordId, SessionId};
use std::collections::HashMap;

/// Process-wide edit lock table for one collection.
#[derive(Debug, Default, Clone)]
pub struct LockTable {
    entries: HashMap<FieldKey, SessionId>,
}

impl LockTable {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock on `(record_id, field)` for `holder`.
    ///
    /// Re-acquiring a lock already held by `holder` succeeds without change.
    /// Returns `false`, leaving the table untouched, when another session
    /// holds it.
    pub fn acquire(&mut self, record_id: RecordId, field: &str, holder: SessionId) -> bool {
        let key = FieldKey::new(record_id, field);
        match self.entries.get(&key) {
            None => {
                self.entries.insert(key, holder);
                true
            }
            Some(current) => *current == holder,
        }
    }

    /// Release the lock on `(record_id, field)` if `holder` owns it.
    ///
    /// A release by anyone else, or of a key nobody holds, is a no-op. Such
    /// stale releases happen when a release message arrives after the lock
    /// was already swept or reassigned. Returns whether an entry was removed.
    pub fn release(&mut self, record_id: RecordId, field: &str, holder: SessionId) -> bool {
        let key = FieldKey::new(record_id, field);
        if self.entries.get(&key) == Some(&holder) {
            self.entries.remove(&key);
            true
        } else {
            tracing::debug!(
                %record_id,
                field,
                %holder,
                current = ?self.entries.get(&key),
                "Ignoring stale lock release"
            );
            false
        }
    }

    /// Session currently holding `(record_id, field)`, if any.
    #[must_use]
    pub fn holder_of(&self, record_id: RecordId, field: &str) -> Option<SessionId> {
        self.entries.get(&FieldKey::new(record_id, field)).copied()
    }

    /// Drop every lock owned by `holder`, returning the released keys.
    ///
    /// Keys are returned sorted so that release broadcasts go out in a
    /// deterministic order.
    pub fn release_all(&mut self, holder: SessionId) -> Vec<FieldKey> {
        let mut released: Vec<FieldKey> = self
            .entries
            .iter()
            .filter(|(_, h)| **h == holder)
            .map(|(key, _)| key.clone())
            .collect();
        released.sort();

        for key in &released {
            self.entries.remove(key);
        }
        released
    }

    /// Drop every lock on any field of `record_id`, whoever holds it.
    ///
    /// Returns the swept keys together with their former holders.
    pub fn release_record(&mut self, record_id: RecordId) -> Vec<(FieldKey, SessionId)> {
        let mut swept: Vec<(FieldKey, SessionId)> = self
            .entries
            .iter()
            .filter(|(key, _)| key.record_id == record_id)
            .map(|(key, holder)| (key.clone(), *holder))
            .collect();
        swept.sort();

        for (key, _) in &swept {
            self.entries.remove(key);
        }
        swept
    }

    /// Iterate over all held locks.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldKey, &SessionId)> {
        self.entries.iter()
    }

    /// Number of held locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no lock is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_exclusive_and_reentrant() {
        let mut locks = LockTable::new();
        let a = SessionId::new();
        let b = SessionId::new();

        assert!(locks.acquire(RecordId(5), "title", a));
        assert!(locks.acquire(RecordId(5), "title", a));
        assert!(!locks.acquire(RecordId(5), "title", b));
        assert_eq!(locks.holder_of(RecordId(5), "title"), Some(a));
        assert_eq!(locks.len(), 1);

        // Other fields of the same record are independent
        assert!(locks.acquire(RecordId(5), "content", b));
    }

    #[test]
    fn foreign_release_keeps_entry() {
        let mut locks = LockTable::new();
        let a = SessionId::new();
        let b = SessionId::new();

        locks.acquire(RecordId(1), "title", a);
        assert!(!locks.release(RecordId(1), "title", b));
        assert_eq!(locks.holder_of(RecordId(1), "title"), Some(a));

        assert!(locks.release(RecordId(1), "title", a));
        assert_eq!(locks.holder_of(RecordId(1), "title"), None);

        // Second release is stale
        assert!(!locks.release(RecordId(1), "title", a));
    }

    #[test]
    fn blocked_until_first_holder_releases() {
        let mut locks = LockTable::new();
        let a = SessionId::new();
        let b = SessionId::new();

        locks.acquire(RecordId(2), "title", a);
        for _ in 0..3 {
            assert!(!locks.acquire(RecordId(2), "title", b));
        }
        locks.release(RecordId(2), "title", a);
        assert!(locks.acquire(RecordId(2), "title", b));
    }

    #[test]
    fn release_all_only_touches_holder() {
        let mut locks = LockTable::new();
        let a = SessionId::new();
        let b = SessionId::new();

        locks.acquire(RecordId(7), "content", a);
        locks.acquire(RecordId(7), "title", a);
        locks.acquire(RecordId(8), "title", b);

        let released = locks.release_all(a);
        assert_eq!(
            released,
            vec![
                FieldKey::new(RecordId(7), "content"),
                FieldKey::new(RecordId(7), "title"),
            ]
        );
        assert_eq!(locks.holder_of(RecordId(8), "title"), Some(b));
        assert!(locks.acquire(RecordId(7), "content", b));
    }

    #[test]
    fn release_record_sweeps_all_holders() {
        let mut locks = LockTable::new();
        let a = SessionId::new();
        let b = SessionId::new();

        locks.acquire(RecordId(3), "title", a);
        locks.acquire(RecordId(3), "content", b);
        locks.acquire(RecordId(4), "title", a);

        let swept = locks.release_record(RecordId(3));
        assert_eq!(swept.len(), 2);
        assert!(swept.iter().all(|(key, _)| key.record_id == RecordId(3)));
        assert_eq!(locks.len(), 1);
        assert_eq!(locks.holder_of(RecordId(4), "title"), Some(a));
    }

    #[test]
    fn at_most_one_holder_under_contention() {
        let mut locks = LockTable::new();
        let sessions: Vec<SessionId> = (0..8).map(|_| SessionId::new()).collect();

        for round in 0..4u64 {
            let winners = sessions
                .iter()
                .filter(|s| locks.acquire(RecordId(round), "title", **s))
                .count();
            assert_eq!(winners, 1);
        }
        assert_eq!(locks.len(), 4);
    }
}
