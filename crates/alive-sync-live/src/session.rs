//! One connected client of a live collection.
//!
//! A [`Session`] owns its field controllers and its subscription to the
//! collection topic. Shared state is only ever changed through the
//! collection; everything else a session knows arrives as broadcasts, which
//! it folds in with [`Session::apply`] (or [`Session::pump`] /
//! [`Session::drain`]). Dropping a session releases every lock it holds.

use crate::channel::{ChannelError, Subscription};
use crate::collection::{LiveCollection, Snapshot};
use crate::error::LiveError;
use crate::field::{EditOutcome, FieldController, FieldMode, SaveOutcome};
use alive_sync_core::{FieldKey, Fields, Record, RecordId, SessionId};
use alive_sync_proto::{BroadcastEvent, ClientAction, Envelope};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// User-visible outcome queued for the client of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    /// The field is being edited by someone else
    LockedBy {
        /// Record
        record_id: RecordId,
        /// Field
        field: String,
        /// Current lock holder
        holder: SessionId,
    },
    /// The edit could not be persisted; the lock was released
    PersistenceFailed {
        /// Record
        record_id: RecordId,
        /// Field
        field: String,
        /// Storage error text
        message: String,
    },
    /// The record no longer exists
    RecordGone {
        /// Record
        record_id: RecordId,
    },
    /// The field changed outside any live session while being edited here
    ExternalConflict {
        /// Record
        record_id: RecordId,
        /// Field
        field: String,
        /// Incoming value
        value: Value,
    },
    /// The edit lock was lost before saving; the buffer was dropped
    LockLost {
        /// Record
        record_id: RecordId,
        /// Field
        field: String,
    },
}

/// Render mode of a field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FieldViewMode {
    /// Committed value shown read-only
    Viewing,
    /// Editing locally
    Editing {
        /// Current buffer
        buffer: Value,
    },
    /// Someone else is editing
    Locked {
        /// Lock holder
        holder: SessionId,
    },
    /// The record was deleted
    Removed,
}

/// Render model of one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldView {
    /// Field name
    pub name: String,
    /// Last committed value
    pub value: Value,
    /// Edit state
    #[serde(flatten)]
    pub mode: FieldViewMode,
    /// Conflicting out-of-band value, while editing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Value>,
}

impl FieldView {
    fn from_controller(controller: &FieldController) -> Self {
        let (mode, conflict) = match controller.mode() {
            FieldMode::Viewing => (FieldViewMode::Viewing, None),
            FieldMode::Editing { buffer, conflict } => (
                FieldViewMode::Editing {
                    buffer: buffer.clone(),
                },
                conflict.clone(),
            ),
            FieldMode::LockedByOther { holder } => (FieldViewMode::Locked { holder: *holder }, None),
            FieldMode::Removed => (FieldViewMode::Removed, None),
        };
        Self {
            name: controller.key().field.clone(),
            value: controller.value().clone(),
            mode,
            conflict,
        }
    }
}

/// Render model of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordView {
    /// Record id
    pub id: RecordId,
    /// Title field, if any
    pub title: Option<FieldView>,
    /// Remaining displayed fields, in display order
    pub fields: Vec<FieldView>,
}

/// Whole-state render model pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewState {
    /// Collection name
    pub collection: String,
    /// Records in display order
    pub records: Vec<RecordView>,
}

/// A connected client of a [`LiveCollection`].
pub struct Session {
    id: SessionId,
    collection: Arc<LiveCollection>,
    subscription: Subscription,
    order: Vec<RecordId>,
    fields: BTreeMap<FieldKey, FieldController>,
    notices: Vec<Notice>,
    synced_at: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("collection", &self.collection.name())
            .field("records", &self.order.len())
            .field("synced_at", &self.synced_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        collection: Arc<LiveCollection>,
        subscription: Subscription,
        snapshot: Snapshot,
    ) -> Self {
        let mut session = Self {
            id: SessionId::new(),
            collection,
            subscription,
            order: Vec::new(),
            fields: BTreeMap::new(),
            notices: Vec::new(),
            synced_at: snapshot.seq,
        };
        session.load_snapshot(snapshot);
        tracing::info!(
            session = %session.id,
            collection = session.collection.name(),
            records = session.order.len(),
            "Session connected"
        );
        session
    }

    /// Session identifier, used as the lock holder.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Collection this session is connected to.
    #[must_use]
    pub fn collection(&self) -> &Arc<LiveCollection> {
        &self.collection
    }

    /// Display order as known to this session.
    #[must_use]
    pub fn order(&self) -> &[RecordId] {
        &self.order
    }

    /// Controller for one field, if the session tracks it.
    #[must_use]
    pub fn field(&self, record_id: RecordId, field: &str) -> Option<&FieldController> {
        self.fields.get(&FieldKey::new(record_id, field))
    }

    /// Topic sequence this session has folded in.
    #[must_use]
    pub fn synced_at(&self) -> u64 {
        self.synced_at
    }

    /// Take every queued notice.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Start editing `(record_id, field)`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditable`] for read-only fields, or a
    /// persistence error.
    pub fn begin_edit(&mut self, record_id: RecordId, field: &str) -> Result<EditOutcome, LiveError> {
        let (me, collection) = (self.id, Arc::clone(&self.collection));
        let Some(controller) = self.controller(record_id, field)? else {
            self.notices.push(Notice::RecordGone { record_id });
            return Ok(EditOutcome::Removed);
        };

        let outcome = controller.begin_edit(&collection, me)?;
        match outcome {
            EditOutcome::Editing => {
                tracing::debug!(session = %me, %record_id, field, "Editing");
            }
            EditOutcome::LockedBy(holder) => self.notices.push(Notice::LockedBy {
                record_id,
                field: field.to_string(),
                holder,
            }),
            EditOutcome::Removed => self.notices.push(Notice::RecordGone { record_id }),
        }
        Ok(outcome)
    }

    /// Replace the local buffer of a field being edited.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditing`] unless the field is being edited.
    pub fn update_buffer(&mut self, record_id: RecordId, field: &str, value: Value) -> Result<(), LiveError> {
        self.live_editing_controller(record_id, field)?.update_buffer(value)
    }

    /// Persist the buffer of a field being edited.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditing`] unless the field is being edited, or
    /// [`LiveError::Persistence`] if storage rejected the write.
    pub fn save(&mut self, record_id: RecordId, field: &str) -> Result<SaveOutcome, LiveError> {
        let (me, collection) = (self.id, Arc::clone(&self.collection));
        let Some(controller) = self.editing_controller(record_id, field)? else {
            self.notices.push(Notice::RecordGone { record_id });
            return Ok(SaveOutcome::Removed);
        };
        let result = controller.save(&collection, me);

        match &result {
            Ok(SaveOutcome::Saved) => {
                tracing::debug!(session = %me, %record_id, field, "Saved");
            }
            Ok(SaveOutcome::LockLost) => self.notices.push(Notice::LockLost {
                record_id,
                field: field.to_string(),
            }),
            Ok(SaveOutcome::Removed) => self.notices.push(Notice::RecordGone { record_id }),
            Err(err) => self.notices.push(Notice::PersistenceFailed {
                record_id,
                field: field.to_string(),
                message: err.to_string(),
            }),
        }
        result
    }

    /// Drop the buffer of a field being edited and release its lock.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditing`] unless the field is being edited.
    pub fn cancel(&mut self, record_id: RecordId, field: &str) -> Result<(), LiveError> {
        let (me, collection) = (self.id, Arc::clone(&self.collection));
        let cancelled = match self.editing_controller(record_id, field)? {
            Some(controller) => controller.cancel(&collection, me)?,
            None => false,
        };
        if !cancelled {
            self.notices.push(Notice::RecordGone { record_id });
        }
        Ok(())
    }

    /// Replace the buffer with the pending out-of-band value.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditing`] unless the field is being edited.
    pub fn accept_external(&mut self, record_id: RecordId, field: &str) -> Result<bool, LiveError> {
        self.live_editing_controller(record_id, field)?.accept_external()
    }

    /// Create a record.
    ///
    /// # Errors
    ///
    /// See [`LiveCollection::create`].
    pub fn create(&mut self, fields: Fields) -> Result<RecordId, LiveError> {
        self.collection.create(fields)
    }

    /// Delete a record.
    ///
    /// # Errors
    ///
    /// See [`LiveCollection::delete`].
    pub fn delete(&mut self, record_id: RecordId) -> Result<(), LiveError> {
        match self.collection.delete(record_id) {
            Err(LiveError::RecordGone(id)) => {
                self.notices.push(Notice::RecordGone { record_id: id });
                Ok(())
            }
            other => other,
        }
    }

    /// Move a record to `position`; negative positions mean the head.
    ///
    /// # Errors
    ///
    /// See [`LiveCollection::reorder`].
    pub fn reorder(&mut self, record_id: RecordId, position: i64) -> Result<bool, LiveError> {
        let position = usize::try_from(position.max(0)).unwrap_or(usize::MAX);
        self.or_gone(self.collection.reorder(record_id, position))
    }

    /// Move a record by `direction` positions.
    ///
    /// # Errors
    ///
    /// See [`LiveCollection::move_by`].
    pub fn move_by(&mut self, record_id: RecordId, direction: i64) -> Result<bool, LiveError> {
        self.or_gone(self.collection.move_by(record_id, direction))
    }

    fn or_gone(&mut self, result: Result<bool, LiveError>) -> Result<bool, LiveError> {
        match result {
            Err(LiveError::RecordGone(record_id)) => {
                self.notices.push(Notice::RecordGone { record_id });
                Ok(false)
            }
            other => other,
        }
    }

    /// Dispatch a decoded client action.
    ///
    /// # Errors
    ///
    /// Returns the error of the dispatched operation.
    pub fn handle_action(&mut self, action: ClientAction) -> Result<(), LiveError> {
        tracing::trace!(session = %self.id, ?action, "Client action");
        match action {
            ClientAction::StartEdit { record_id, field } => {
                self.begin_edit(record_id, &field).map(drop)
            }
            ClientAction::UpdateDraft {
                record_id,
                field,
                value,
            } => self.update_buffer(record_id, &field, value),
            ClientAction::SaveEdit { record_id, field } => self.save(record_id, &field).map(drop),
            ClientAction::CancelEdit { record_id, field } => self.cancel(record_id, &field),
            ClientAction::AcceptExternal { record_id, field } => {
                self.accept_external(record_id, &field).map(drop)
            }
            ClientAction::ReorderToPosition {
                record_id,
                position,
            } => self.reorder(record_id, position).map(drop),
            ClientAction::MoveItem {
                record_id,
                direction,
            } => self.move_by(record_id, direction).map(drop),
            ClientAction::CreateItem { fields } => self.create(fields).map(drop),
            ClientAction::DeleteItem { record_id } => self.delete(record_id),
        }
    }

    /// Fold one broadcast into the session state.
    pub fn apply(&mut self, envelope: &Envelope) {
        if let Some(key) = envelope.event.field_key() {
            if let Some(controller) = self.fields.get_mut(&key) {
                if let Some(notice) = controller.on_envelope(envelope, self.id) {
                    self.notices.push(notice);
                }
            }
            self.synced_at = self.synced_at.max(envelope.seq);
            return;
        }

        if envelope.seq <= self.synced_at {
            return;
        }
        self.synced_at = envelope.seq;

        match &envelope.event {
            BroadcastEvent::RecordCreated { record_id, order } => {
                self.order.clone_from(order);
                // Controllers may already exist if an edit began before this echo
                match self.collection.record_snapshot(*record_id) {
                    Ok(Some((record, locks, seq))) => {
                        let locks: BTreeMap<FieldKey, SessionId> = locks.into_iter().collect();
                        self.track(&record, &locks, seq);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(session = %self.id, %record_id, error = %err, "Failed to load created record");
                    }
                }
            }
            BroadcastEvent::RecordDeleted { record_id, order } => {
                self.order.clone_from(order);
                let was_editing = self.record_fields(*record_id).any(FieldController::is_editing);
                self.fields.retain(|key, _| key.record_id != *record_id);
                if was_editing {
                    self.notices.push(Notice::RecordGone {
                        record_id: *record_id,
                    });
                }
            }
            BroadcastEvent::OrderChanged { order } => self.order.clone_from(order),
            BroadcastEvent::LockAcquired { .. }
            | BroadcastEvent::LockReleased { .. }
            | BroadcastEvent::ContentChanged { .. } => {}
        }
    }

    /// Wait for the next broadcast and fold it in.
    ///
    /// A lagged subscription is recovered by resynchronising from a fresh
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::ChannelClosed`] once the topic is gone.
    pub async fn pump(&mut self) -> Result<(), LiveError> {
        match self.subscription.recv().await {
            Ok(envelope) => {
                self.apply(&envelope);
                Ok(())
            }
            Err(ChannelError::Lagged(_)) => self.resync(),
            Err(ChannelError::Closed) => Err(LiveError::ChannelClosed),
        }
    }

    /// Fold in every broadcast already queued. Returns how many were applied.
    ///
    /// # Errors
    ///
    /// Same as [`Session::pump`].
    pub fn drain(&mut self) -> Result<usize, LiveError> {
        let mut applied = 0;
        loop {
            match self.subscription.try_recv() {
                Ok(Some(envelope)) => {
                    self.apply(&envelope);
                    applied += 1;
                }
                Ok(None) => return Ok(applied),
                Err(ChannelError::Lagged(_)) => self.resync()?,
                Err(ChannelError::Closed) => return Err(LiveError::ChannelClosed),
            }
        }
    }

    /// Rebuild the session from an authoritative snapshot, keeping edit
    /// buffers whose locks are still held.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the snapshot cannot be read.
    pub fn resync(&mut self) -> Result<(), LiveError> {
        let snapshot = self.collection.snapshot()?;
        tracing::info!(session = %self.id, seq = snapshot.seq, "Resynchronising session");
        self.synced_at = self.synced_at.max(snapshot.seq);
        self.load_snapshot(snapshot);
        Ok(())
    }

    /// Whole-state render model.
    #[must_use]
    pub fn render(&self) -> ViewState {
        let conf = self.collection.conf();
        let title_field = conf.title_field();

        let records = self
            .order
            .iter()
            .map(|&id| {
                let controllers: Vec<&FieldController> = if conf.fields.is_empty() {
                    self.record_fields(id).collect()
                } else {
                    conf.fields
                        .iter()
                        .filter_map(|name| self.fields.get(&FieldKey::new(id, name.as_str())))
                        .collect()
                };

                let mut title = None;
                let mut fields = Vec::new();
                for controller in controllers {
                    let view = FieldView::from_controller(controller);
                    if title.is_none() && Some(view.name.as_str()) == title_field {
                        title = Some(view);
                    } else {
                        fields.push(view);
                    }
                }
                RecordView { id, title, fields }
            })
            .collect();

        ViewState {
            collection: conf.name.clone(),
            records,
        }
    }

    /// Leave the collection, releasing every held lock.
    pub fn disconnect(self) {
        drop(self);
    }

    fn load_snapshot(&mut self, snapshot: Snapshot) {
        let Snapshot {
            records,
            locks,
            seq,
        } = snapshot;
        let locks: BTreeMap<FieldKey, SessionId> = locks.into_iter().collect();

        self.order = records.iter().map(|record| record.id).collect();
        let live: HashSet<RecordId> = self.order.iter().copied().collect();
        self.fields.retain(|key, _| live.contains(&key.record_id));
        for record in &records {
            self.track(record, &locks, seq);
        }
    }

    /// Create or rebase the controllers of every displayed field of `record`.
    fn track(&mut self, record: &Record, locks: &BTreeMap<FieldKey, SessionId>, seq: u64) {
        let conf = self.collection.conf();
        let names: Vec<String> = if conf.fields.is_empty() {
            record.fields.keys().cloned().collect()
        } else {
            conf.fields.clone()
        };

        for name in names {
            let key = FieldKey::new(record.id, name.as_str());
            let value = record.value(&name);
            let holder = locks.get(&key).copied();
            match self.fields.get_mut(&key) {
                Some(controller) => controller.rebase(value, holder, self.id, seq),
                None => {
                    let controller = FieldController::new(key.clone(), value, holder, self.id, seq);
                    self.fields.insert(key, controller);
                }
            }
        }
    }

    /// Controller for a field, loading it on demand. `None` if the record is
    /// gone.
    fn controller(&mut self, record_id: RecordId, field: &str) -> Result<Option<&mut FieldController>, LiveError> {
        let key = FieldKey::new(record_id, field);
        if !self.fields.contains_key(&key) {
            let Some((value, holder, seq)) = self.collection.field_snapshot(record_id, field)? else {
                return Ok(None);
            };
            let controller = FieldController::new(key.clone(), value, holder, self.id, seq);
            self.fields.insert(key.clone(), controller);
        }
        Ok(self.fields.get_mut(&key))
    }

    /// Controller of a field being edited. `None` if the record was deleted
    /// and its controllers already dropped.
    fn editing_controller(
        &mut self,
        record_id: RecordId,
        field: &str,
    ) -> Result<Option<&mut FieldController>, LiveError> {
        let key = FieldKey::new(record_id, field);
        let known = self.order.contains(&record_id);
        match self.fields.get_mut(&key) {
            Some(controller) if controller.is_editing() || controller.mode() == &FieldMode::Removed => {
                Ok(Some(controller))
            }
            None if !known => Ok(None),
            _ => Err(LiveError::NotEditing(key)),
        }
    }

    fn live_editing_controller(&mut self, record_id: RecordId, field: &str) -> Result<&mut FieldController, LiveError> {
        self.editing_controller(record_id, field)?
            .ok_or_else(|| LiveError::NotEditing(FieldKey::new(record_id, field)))
    }

    fn record_fields(&self, record_id: RecordId) -> impl Iterator<Item = &FieldController> {
        self.fields
            .values()
            .filter(move |controller| controller.key().record_id == record_id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let released = self.collection.disconnect(self.id);
        tracing::info!(
            session = %self.id,
            collection = self.collection.name(),
            released = released.len(),
            "Session disconnected"
        );
    }
}
