//! Record collection controller.
//!
//! A [`LiveCollection`] is the only writer of its collection's lock table and
//! order index. Every public operation runs under one mutex, including its
//! storage call and its publishes, so operations never interleave and
//! publish order always matches mutation order.

use crate::channel::{Subscription, Topic};
use crate::error::LiveError;
use crate::session::Session;
use alive_sync_core::{
    CollectionConf, FieldKey, Fields, LockTable, Move, OrderIndex, Record, RecordId, SessionId,
    Storage,
};
use alive_sync_proto::{BroadcastEvent, ExternalChange};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq)]
pub enum Acquire {
    /// The lock is held by the requester; `value` is the current field value
    Acquired {
        /// Snapshot of the field for the edit buffer
        value: Value,
        /// Topic sequence the snapshot reflects
        seq: u64,
    },
    /// Another session holds the lock
    Conflict {
        /// Current holder
        holder: SessionId,
        /// Topic sequence the answer reflects
        seq: u64,
    },
}

/// Outcome of an out-of-band change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalOutcome {
    /// Applied and broadcast
    Applied,
    /// Applied and broadcast while a session holds the field's lock
    Conflict {
        /// Session holding the lock
        holder: SessionId,
    },
    /// Already reflected; nothing was broadcast
    Ignored,
}

/// Authoritative view of a collection at one topic sequence.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Records in display order
    pub records: Vec<Record>,
    /// Held locks
    pub locks: HashMap<FieldKey, SessionId>,
    /// Topic sequence the snapshot reflects
    pub seq: u64,
}

#[derive(Debug, Default)]
struct SharedState {
    locks: LockTable,
    order: OrderIndex,
}

/// Shared controller for one record collection.
pub struct LiveCollection {
    conf: CollectionConf,
    storage: Arc<dyn Storage>,
    topic: Topic,
    state: Mutex<SharedState>,
}

impl std::fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCollection")
            .field("name", &self.conf.name)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl LiveCollection {
    /// Open a collection over `storage`, publishing on `topic`.
    ///
    /// The initial display order is ascending record id.
    ///
    /// # Errors
    ///
    /// Returns error if the records cannot be listed.
    pub fn open(
        conf: CollectionConf,
        storage: Arc<dyn Storage>,
        topic: Topic,
    ) -> Result<Arc<Self>, LiveError> {
        let records = storage.list()?;
        let order = OrderIndex::from_ids(records.iter().map(|r| r.id));

        tracing::info!(
            collection = %conf.name,
            topic = topic.name(),
            records = order.len(),
            "Opened live collection"
        );

        Ok(Arc::new(Self {
            conf,
            storage,
            topic,
            state: Mutex::new(SharedState {
                locks: LockTable::new(),
                order,
            }),
        }))
    }

    /// Collection configuration.
    #[must_use]
    pub fn conf(&self) -> &CollectionConf {
        &self.conf
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.conf.name
    }

    /// Broadcast topic of this collection.
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Open a new session on this collection.
    ///
    /// # Errors
    ///
    /// Returns error if the initial snapshot cannot be read.
    pub fn connect(self: &Arc<Self>) -> Result<Session, LiveError> {
        let (subscription, snapshot) = self.subscribe_with_snapshot()?;
        Ok(Session::new(Arc::clone(self), subscription, snapshot))
    }

    /// Current display order.
    #[must_use]
    pub fn order(&self) -> Vec<RecordId> {
        self.state.lock().order.to_vec()
    }

    /// Session holding the lock on `(record_id, field)`.
    #[must_use]
    pub fn holder_of(&self, record_id: RecordId, field: &str) -> Option<SessionId> {
        self.state.lock().locks.holder_of(record_id, field)
    }

    /// Number of held locks.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.state.lock().locks.len()
    }

    /// Fetch a live record from storage.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn record(&self, record_id: RecordId) -> Result<Option<Record>, LiveError> {
        let state = self.state.lock();
        if !state.order.contains(record_id) {
            return Ok(None);
        }
        Ok(self.storage.get(record_id)?)
    }

    /// Authoritative snapshot of records, locks and topic position.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn snapshot(&self) -> Result<Snapshot, LiveError> {
        let state = self.state.lock();
        self.snapshot_locked(&state)
    }

    pub(crate) fn subscribe_with_snapshot(&self) -> Result<(Subscription, Snapshot), LiveError> {
        let state = self.state.lock();
        let subscription = self.topic.subscribe();
        let snapshot = self.snapshot_locked(&state)?;
        Ok((subscription, snapshot))
    }

    fn snapshot_locked(&self, state: &SharedState) -> Result<Snapshot, LiveError> {
        let mut by_id: HashMap<RecordId, Record> = self
            .storage
            .list()?
            .into_iter()
            .map(|record| (record.id, record))
            .collect();

        let records = state
            .order
            .as_slice()
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();
        let locks = state
            .locks
            .iter()
            .map(|(key, holder)| (key.clone(), *holder))
            .collect();

        Ok(Snapshot {
            records,
            locks,
            seq: self.topic.last_seq(),
        })
    }

    /// One live record with the locks on its fields, at one topic sequence.
    pub(crate) fn record_snapshot(
        &self,
        record_id: RecordId,
    ) -> Result<Option<(Record, HashMap<FieldKey, SessionId>, u64)>, LiveError> {
        let state = self.state.lock();
        if !state.order.contains(record_id) {
            return Ok(None);
        }
        let Some(record) = self.storage.get(record_id)? else {
            return Ok(None);
        };
        let locks = state
            .locks
            .iter()
            .filter(|(key, _)| key.record_id == record_id)
            .map(|(key, holder)| (key.clone(), *holder))
            .collect();
        Ok(Some((record, locks, self.topic.last_seq())))
    }

    /// Current value, holder and topic sequence of one field; `None` if the
    /// record is gone.
    pub(crate) fn field_snapshot(
        &self,
        record_id: RecordId,
        field: &str,
    ) -> Result<Option<(Value, Option<SessionId>, u64)>, LiveError> {
        let state = self.state.lock();
        if !state.order.contains(record_id) {
            return Ok(None);
        }
        let Some(value) = self.storage.get_field(record_id, field)? else {
            return Ok(None);
        };
        Ok(Some((
            value,
            state.locks.holder_of(record_id, field),
            self.topic.last_seq(),
        )))
    }

    /// Take the edit lock on `(record_id, field)` for `holder`.
    ///
    /// A fresh lock is broadcast as `lock_acquired`; re-acquiring a lock the
    /// holder already owns is silent.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::RecordGone`] for unknown records,
    /// [`LiveError::NotEditable`] for read-only fields, or a persistence
    /// error if the current value cannot be read.
    pub fn acquire(
        &self,
        record_id: RecordId,
        field: &str,
        holder: SessionId,
    ) -> Result<Acquire, LiveError> {
        let mut state = self.state.lock();
        if !state.order.contains(record_id) {
            return Err(LiveError::RecordGone(record_id));
        }
        if !self.conf.is_editable(field) {
            return Err(LiveError::NotEditable(field.to_string()));
        }

        let already_held = state.locks.holder_of(record_id, field) == Some(holder);
        if !state.locks.acquire(record_id, field, holder) {
            let current = state.locks.holder_of(record_id, field).unwrap_or(holder);
            tracing::debug!(%record_id, field, %holder, %current, "Lock conflict");
            return Ok(Acquire::Conflict {
                holder: current,
                seq: self.topic.last_seq(),
            });
        }

        let value = match self.storage.get_field(record_id, field) {
            Ok(Some(value)) => value,
            Ok(None) => {
                state.locks.release(record_id, field, holder);
                if already_held {
                    self.publish_released(record_id, field, holder);
                }
                return Err(LiveError::RecordGone(record_id));
            }
            Err(err) => {
                if !already_held {
                    state.locks.release(record_id, field, holder);
                }
                return Err(err.into());
            }
        };

        let seq = if already_held {
            self.topic.last_seq()
        } else {
            tracing::debug!(%record_id, field, %holder, "Lock acquired");
            self.topic
                .publish(BroadcastEvent::LockAcquired {
                    record_id,
                    field: field.to_string(),
                    holder,
                })
                .seq
        };
        Ok(Acquire::Acquired { value, seq })
    }

    /// Persist `value` under `holder`'s lock, then release the lock.
    ///
    /// On success broadcasts `content_changed` followed by `lock_released`
    /// and returns the sequence of the content broadcast. On a failed write
    /// only `lock_released` is broadcast, so no other session ever sees the
    /// uncommitted value.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::RecordGone`] if the record was deleted,
    /// [`LiveError::LockLost`] if `holder` no longer owns the lock, or
    /// [`LiveError::Persistence`] if the write failed.
    pub fn commit(
        &self,
        record_id: RecordId,
        field: &str,
        holder: SessionId,
        value: Value,
    ) -> Result<u64, LiveError> {
        let mut state = self.state.lock();
        if !state.order.contains(record_id) {
            return Err(LiveError::RecordGone(record_id));
        }
        if state.locks.holder_of(record_id, field) != Some(holder) {
            tracing::debug!(%record_id, field, %holder, "Save without lock");
            return Err(LiveError::LockLost(FieldKey::new(record_id, field)));
        }

        let written = self.storage.set(record_id, field, value.clone());
        state.locks.release(record_id, field, holder);

        match written {
            Ok(()) => {
                let seq = self
                    .topic
                    .publish(BroadcastEvent::ContentChanged {
                        record_id,
                        field: field.to_string(),
                        value,
                        holder: Some(holder),
                    })
                    .seq;
                self.publish_released(record_id, field, holder);
                Ok(seq)
            }
            Err(err) => {
                tracing::warn!(%record_id, field, %holder, error = %err, "Failed to persist field");
                self.publish_released(record_id, field, holder);
                Err(err.into())
            }
        }
    }

    /// Release `holder`'s lock on `(record_id, field)` without writing.
    ///
    /// Stale releases are ignored. Returns whether a lock was released.
    pub fn release(&self, record_id: RecordId, field: &str, holder: SessionId) -> bool {
        let mut state = self.state.lock();
        let released = state.locks.release(record_id, field, holder);
        if released {
            self.publish_released(record_id, field, holder);
        }
        released
    }

    /// Release every lock `holder` owns. Called when a session goes away.
    pub fn disconnect(&self, holder: SessionId) -> Vec<FieldKey> {
        let mut state = self.state.lock();
        let released = state.locks.release_all(holder);
        for key in &released {
            self.publish_released(key.record_id, &key.field, holder);
        }
        if !released.is_empty() {
            tracing::info!(
                collection = %self.conf.name,
                %holder,
                released = released.len(),
                "Released locks of disconnected session"
            );
        }
        released
    }

    /// Create a record, append it to the display order and broadcast it.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::UnknownField`] if `fields` names a field not
    /// accepted on create, or a persistence error.
    pub fn create(&self, fields: Fields) -> Result<RecordId, LiveError> {
        if let Some(field) = fields.keys().find(|f| !self.conf.is_creatable(f)) {
            return Err(LiveError::UnknownField(field.clone()));
        }

        let mut state = self.state.lock();
        let record_id = self.storage.create(fields)?;
        state.order.push(record_id);

        tracing::debug!(collection = %self.conf.name, %record_id, "Record created");
        self.topic.publish(BroadcastEvent::RecordCreated {
            record_id,
            order: state.order.to_vec(),
        });
        Ok(record_id)
    }

    /// Delete a record, sweeping every lock on its fields.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::RecordGone`] if the record is not live, or a
    /// persistence error.
    pub fn delete(&self, record_id: RecordId) -> Result<(), LiveError> {
        let mut state = self.state.lock();
        if !state.order.contains(record_id) {
            return Err(LiveError::RecordGone(record_id));
        }
        self.storage.delete(record_id)?;
        self.forget(&mut state, record_id);
        Ok(())
    }

    /// Move a record to `new_position`, clamped into range.
    ///
    /// Broadcasts the full new order. Returns `false`, broadcasting nothing,
    /// when the record already sits at the target position.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::RecordGone`] if the record is not live.
    pub fn reorder(&self, record_id: RecordId, new_position: usize) -> Result<bool, LiveError> {
        let mut state = self.state.lock();
        self.reorder_locked(&mut state, record_id, new_position)
    }

    /// Move a record by `direction` positions (negative is towards the head).
    ///
    /// Moves past either end saturate there rather than being dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::RecordGone`] if the record is not live.
    pub fn move_by(&self, record_id: RecordId, direction: i64) -> Result<bool, LiveError> {
        let mut state = self.state.lock();
        let Some(current) = state.order.position(record_id) else {
            return Err(LiveError::RecordGone(record_id));
        };
        let current = i64::try_from(current).unwrap_or(i64::MAX);
        let target = usize::try_from(current.saturating_add(direction).max(0)).unwrap_or(usize::MAX);
        self.reorder_locked(&mut state, record_id, target)
    }

    fn reorder_locked(
        &self,
        state: &mut SharedState,
        record_id: RecordId,
        new_position: usize,
    ) -> Result<bool, LiveError> {
        match state.order.move_to(record_id, new_position) {
            Move::Moved { from, to } => {
                tracing::debug!(collection = %self.conf.name, %record_id, from, to, "Record moved");
                self.topic.publish(BroadcastEvent::OrderChanged {
                    order: state.order.to_vec(),
                });
                Ok(true)
            }
            Move::Unchanged => Ok(false),
            Move::Missing => Err(LiveError::RecordGone(record_id)),
        }
    }

    /// Apply a change made outside any live session.
    ///
    /// Field writes go to storage even when a session holds the lock; the
    /// lock is left in place and the holder sees a conflict instead of
    /// losing its buffer. A whole-record update has already been written:
    /// it is re-read and every displayed field is broadcast.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if a field write fails, or
    /// [`LiveError::RecordGone`] for a created or updated record storage
    /// does not know.
    pub fn apply_external(&self, change: &ExternalChange) -> Result<ExternalOutcome, LiveError> {
        let mut state = self.state.lock();
        match change {
            ExternalChange::FieldUpdated {
                record_id,
                field,
                value,
            } => {
                self.storage.set(*record_id, field, value.clone())?;
                self.topic.publish(BroadcastEvent::ContentChanged {
                    record_id: *record_id,
                    field: field.clone(),
                    value: value.clone(),
                    holder: None,
                });
                match state.locks.holder_of(*record_id, field) {
                    Some(holder) => Ok(ExternalOutcome::Conflict { holder }),
                    None => Ok(ExternalOutcome::Applied),
                }
            }
            ExternalChange::RecordUpdated { record_id } => {
                if !state.order.contains(*record_id) {
                    return Ok(ExternalOutcome::Ignored);
                }
                let record = self
                    .storage
                    .get(*record_id)?
                    .ok_or(LiveError::RecordGone(*record_id))?;
                let names: Vec<&String> = if self.conf.fields.is_empty() {
                    record.fields.keys().collect()
                } else {
                    self.conf.fields.iter().collect()
                };

                let mut locked = None;
                for name in names {
                    self.topic.publish(BroadcastEvent::ContentChanged {
                        record_id: *record_id,
                        field: name.clone(),
                        value: record.value(name),
                        holder: None,
                    });
                    locked = locked.or(state.locks.holder_of(*record_id, name));
                }
                match locked {
                    Some(holder) => Ok(ExternalOutcome::Conflict { holder }),
                    None => Ok(ExternalOutcome::Applied),
                }
            }
            ExternalChange::RecordCreated { record_id } => {
                if state.order.contains(*record_id) {
                    return Ok(ExternalOutcome::Ignored);
                }
                if self.storage.get(*record_id)?.is_none() {
                    return Err(LiveError::RecordGone(*record_id));
                }
                state.order.push(*record_id);
                self.topic.publish(BroadcastEvent::RecordCreated {
                    record_id: *record_id,
                    order: state.order.to_vec(),
                });
                Ok(ExternalOutcome::Applied)
            }
            ExternalChange::RecordDeleted { record_id } => {
                if !state.order.contains(*record_id) {
                    return Ok(ExternalOutcome::Ignored);
                }
                self.forget(&mut state, *record_id);
                Ok(ExternalOutcome::Applied)
            }
        }
    }

    /// Drop a record from the order, sweep its locks and broadcast.
    fn forget(&self, state: &mut SharedState, record_id: RecordId) {
        state.order.remove(record_id);
        for (key, holder) in state.locks.release_record(record_id) {
            self.publish_released(key.record_id, &key.field, holder);
        }
        tracing::debug!(collection = %self.conf.name, %record_id, "Record deleted");
        self.topic.publish(BroadcastEvent::RecordDeleted {
            record_id,
            order: state.order.to_vec(),
        });
    }

    fn publish_released(&self, record_id: RecordId, field: &str, holder: SessionId) {
        self.topic.publish(BroadcastEvent::LockReleased {
            record_id,
            field: field.to_string(),
            holder,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alive_sync_core::MemoryStore;
    use alive_sync_proto::Action;
    use serde_json::json;
    use std::collections::HashSet;

    fn fields(title: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".into(), json!(title));
        fields.insert("content".into(), json!(""));
        fields
    }

    fn cards(n: usize) -> Arc<LiveCollection> {
        let store = MemoryStore::with_records((0..n).map(|i| fields(&format!("card {i}"))));
        LiveCollection::open(
            CollectionConf::new("cards", ["title", "content"]),
            Arc::new(store),
            Topic::new("alive:cards", 64),
        )
        .unwrap()
    }

    fn drain_actions(sub: &mut Subscription) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Some(envelope) = sub.try_recv().unwrap() {
            actions.push(envelope.event.action());
        }
        actions
    }

    #[test]
    fn acquire_broadcasts_once_per_lock() {
        let live = cards(1);
        let mut sub = live.topic().subscribe();
        let a = SessionId::new();
        let b = SessionId::new();

        assert!(matches!(
            live.acquire(RecordId(1), "title", a).unwrap(),
            Acquire::Acquired { .. }
        ));
        assert!(matches!(
            live.acquire(RecordId(1), "title", a).unwrap(),
            Acquire::Acquired { .. }
        ));
        assert!(matches!(
            live.acquire(RecordId(1), "title", b).unwrap(),
            Acquire::Conflict { holder, .. } if holder == a
        ));

        assert_eq!(drain_actions(&mut sub), vec![Action::LockAcquired]);
    }

    #[test]
    fn acquire_rejects_unknown_records_and_read_only_fields() {
        let live = cards(1);
        let a = SessionId::new();

        assert!(matches!(
            live.acquire(RecordId(9), "title", a),
            Err(LiveError::RecordGone(RecordId(9)))
        ));
        assert!(matches!(
            live.acquire(RecordId(1), "id", a),
            Err(LiveError::NotEditable(_))
        ));
        assert_eq!(live.lock_count(), 0);
    }

    #[test]
    fn commit_requires_the_lock() {
        let live = cards(1);
        let a = SessionId::new();
        let b = SessionId::new();

        live.acquire(RecordId(1), "title", a).unwrap();
        assert!(matches!(
            live.commit(RecordId(1), "title", b, json!("hijack")),
            Err(LiveError::LockLost(_))
        ));

        let mut sub = live.topic().subscribe();
        live.commit(RecordId(1), "title", a, json!("Pasta")).unwrap();
        assert_eq!(
            drain_actions(&mut sub),
            vec![Action::ContentChanged, Action::LockReleased]
        );
        assert_eq!(live.holder_of(RecordId(1), "title"), None);
        assert_eq!(
            live.record(RecordId(1)).unwrap().unwrap().value("title"),
            json!("Pasta")
        );
    }

    #[test]
    fn stale_release_is_silent() {
        let live = cards(1);
        let a = SessionId::new();
        let b = SessionId::new();
        live.acquire(RecordId(1), "title", a).unwrap();

        let mut sub = live.topic().subscribe();
        assert!(!live.release(RecordId(1), "title", b));
        assert!(drain_actions(&mut sub).is_empty());
        assert_eq!(live.holder_of(RecordId(1), "title"), Some(a));
    }

    #[test]
    fn delete_sweeps_locks_and_order() {
        let live = cards(3);
        let a = SessionId::new();
        let b = SessionId::new();
        live.acquire(RecordId(2), "title", a).unwrap();
        live.acquire(RecordId(2), "content", b).unwrap();

        let mut sub = live.topic().subscribe();
        live.delete(RecordId(2)).unwrap();

        assert_eq!(
            drain_actions(&mut sub),
            vec![
                Action::LockReleased,
                Action::LockReleased,
                Action::RecordDeleted
            ]
        );
        assert_eq!(live.order(), vec![RecordId(1), RecordId(3)]);
        assert_eq!(live.lock_count(), 0);
        assert!(matches!(
            live.delete(RecordId(2)),
            Err(LiveError::RecordGone(_))
        ));
    }

    #[test]
    fn reorder_to_same_position_is_silent() {
        let live = cards(3);
        let mut sub = live.topic().subscribe();

        assert!(!live.reorder(RecordId(2), 1).unwrap());
        assert!(drain_actions(&mut sub).is_empty());

        assert!(live.reorder(RecordId(3), 0).unwrap());
        let envelope = sub.try_recv().unwrap().unwrap();
        assert_eq!(
            envelope.event,
            BroadcastEvent::OrderChanged {
                order: vec![RecordId(3), RecordId(1), RecordId(2)]
            }
        );
    }

    #[test]
    fn move_by_clamps_at_both_ends() {
        let live = cards(3);

        assert!(live.move_by(RecordId(2), -5).unwrap());
        assert_eq!(live.order(), vec![RecordId(2), RecordId(1), RecordId(3)]);

        assert!(live.move_by(RecordId(2), 10).unwrap());
        assert_eq!(live.order(), vec![RecordId(1), RecordId(3), RecordId(2)]);

        assert!(!live.move_by(RecordId(2), 1).unwrap());
    }

    #[test]
    fn create_rejects_fields_not_accepted_on_create() {
        let live = cards(0);
        let mut extra = fields("New");
        extra.insert("secret".into(), json!(true));

        assert!(matches!(
            live.create(extra),
            Err(LiveError::UnknownField(field)) if field == "secret"
        ));
        assert!(live.order().is_empty());
    }

    #[test]
    fn order_stays_a_permutation_of_live_records() {
        let live = cards(4);
        let mut live_ids: HashSet<RecordId> = live.order().into_iter().collect();

        let created = live.create(fields("New")).unwrap();
        live_ids.insert(created);
        live.reorder(created, 0).unwrap();
        live.delete(RecordId(2)).unwrap();
        live_ids.remove(&RecordId(2));
        live.move_by(RecordId(1), 2).unwrap();

        let order = OrderIndex::from_ids(live.order());
        assert_eq!(order.len(), live.order().len());
        assert!(order.is_permutation_of(&live_ids));
    }

    #[test]
    fn external_write_keeps_lock() {
        let live = cards(3);
        let a = SessionId::new();
        live.acquire(RecordId(3), "title", a).unwrap();

        let outcome = live
            .apply_external(&ExternalChange::FieldUpdated {
                record_id: RecordId(3),
                field: "title".into(),
                value: json!("Admin"),
            })
            .unwrap();

        assert_eq!(outcome, ExternalOutcome::Conflict { holder: a });
        assert_eq!(live.holder_of(RecordId(3), "title"), Some(a));
        live.commit(RecordId(3), "title", a, json!("Mine")).unwrap();
        assert_eq!(
            live.record(RecordId(3)).unwrap().unwrap().value("title"),
            json!("Mine")
        );
    }

    fn cards_with_store(n: usize) -> (Arc<LiveCollection>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_records(
            (0..n).map(|i| fields(&format!("card {i}"))),
        ));
        let live = LiveCollection::open(
            CollectionConf::new("cards", ["title", "content"]),
            Arc::clone(&store) as Arc<dyn Storage>,
            Topic::new("alive:cards", 64),
        )
        .unwrap();
        (live, store)
    }

    #[test]
    fn record_update_rereads_and_broadcasts_every_field() {
        let (live, store) = cards_with_store(2);
        let a = SessionId::new();
        live.acquire(RecordId(2), "content", a).unwrap();
        store.set(RecordId(2), "title", json!("Renamed")).unwrap();
        store.set(RecordId(2), "content", json!("Rewritten")).unwrap();

        let mut sub = live.topic().subscribe();
        let outcome = live
            .apply_external(&ExternalChange::RecordUpdated {
                record_id: RecordId(2),
            })
            .unwrap();
        assert_eq!(outcome, ExternalOutcome::Conflict { holder: a });

        let mut changed = Vec::new();
        while let Some(envelope) = sub.try_recv().unwrap() {
            changed.push(envelope.event);
        }
        assert_eq!(
            changed,
            vec![
                BroadcastEvent::ContentChanged {
                    record_id: RecordId(2),
                    field: "title".into(),
                    value: json!("Renamed"),
                    holder: None,
                },
                BroadcastEvent::ContentChanged {
                    record_id: RecordId(2),
                    field: "content".into(),
                    value: json!("Rewritten"),
                    holder: None,
                },
            ]
        );
        assert_eq!(live.holder_of(RecordId(2), "content"), Some(a));

        assert_eq!(
            live.apply_external(&ExternalChange::RecordUpdated {
                record_id: RecordId(1),
            })
            .unwrap(),
            ExternalOutcome::Applied
        );
        assert_eq!(
            live.apply_external(&ExternalChange::RecordUpdated {
                record_id: RecordId(9),
            })
            .unwrap(),
            ExternalOutcome::Ignored
        );

        store.delete(RecordId(1)).unwrap();
        assert!(matches!(
            live.apply_external(&ExternalChange::RecordUpdated {
                record_id: RecordId(1),
            }),
            Err(LiveError::RecordGone(RecordId(1)))
        ));
    }

    #[test]
    fn reacquire_of_vanished_record_broadcasts_release() {
        let (live, store) = cards_with_store(1);
        let a = SessionId::new();
        live.acquire(RecordId(1), "title", a).unwrap();
        store.delete(RecordId(1)).unwrap();

        let mut sub = live.topic().subscribe();
        assert!(matches!(
            live.acquire(RecordId(1), "title", a),
            Err(LiveError::RecordGone(RecordId(1)))
        ));
        assert_eq!(drain_actions(&mut sub), vec![Action::LockReleased]);
        assert_eq!(live.lock_count(), 0);

        // A fresh lock that never got broadcast is dropped silently
        let b = SessionId::new();
        assert!(live.acquire(RecordId(1), "content", b).is_err());
        assert!(drain_actions(&mut sub).is_empty());
    }
}
