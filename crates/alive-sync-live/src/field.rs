//! Per-session, per-field edit state machine.
//!
//! ```text
//!            begin_edit (acquired)
//!   Viewing ───────────────────────▶ Editing ──save/cancel/lost──▶ Viewing
//!     │  ▲
//!     │  └── foreign lock released
//!     ▼
//!   LockedByOther
//!
//!   any state ──record deleted──▶ Removed (terminal)
//! ```
//!
//! The controller is session-local: it reads and writes shared state only
//! through [`LiveCollection`] and learns about other sessions only from
//! broadcast envelopes. Every authoritative read is tagged with the topic
//! sequence it reflects; envelopes at or below that sequence are already
//! accounted for and are skipped.

use crate::collection::{Acquire, LiveCollection};
use crate::error::LiveError;
use crate::session::Notice;
use alive_sync_core::{FieldKey, SessionId};
use alive_sync_proto::{BroadcastEvent, Envelope};
use serde_json::Value;

/// Edit state of one field as seen by one session.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldMode {
    /// Showing the committed value
    Viewing,
    /// This session holds the lock and owns a local buffer
    Editing {
        /// Uncommitted working copy
        buffer: Value,
        /// Out-of-band value that arrived while editing, if any
        conflict: Option<Value>,
    },
    /// Another session holds the lock
    LockedByOther {
        /// Lock holder, for display only
        holder: SessionId,
    },
    /// The record was deleted; no further operations are accepted
    Removed,
}

/// Result of [`FieldController::begin_edit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The lock was taken (or was already ours)
    Editing,
    /// Another session holds the lock
    LockedBy(SessionId),
    /// The record no longer exists
    Removed,
}

/// Result of [`FieldController::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The buffer was persisted and broadcast
    Saved,
    /// The lock had been lost; the buffer was dropped
    LockLost,
    /// The record no longer exists
    Removed,
}

/// State machine for one `(record, field)` within one session.
#[derive(Debug, Clone)]
pub struct FieldController {
    key: FieldKey,
    value: Value,
    mode: FieldMode,
    synced_at: u64,
}

impl FieldController {
    /// Create a controller from an authoritative snapshot taken at topic
    /// sequence `synced_at`.
    #[must_use]
    pub fn new(
        key: FieldKey,
        value: Value,
        holder: Option<SessionId>,
        me: SessionId,
        synced_at: u64,
    ) -> Self {
        let mode = match holder {
            Some(holder) if holder != me => FieldMode::LockedByOther { holder },
            _ => FieldMode::Viewing,
        };
        Self {
            key,
            value,
            mode,
            synced_at,
        }
    }

    /// Field address.
    #[must_use]
    pub fn key(&self) -> &FieldKey {
        &self.key
    }

    /// Last committed value known to this session.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Current edit state.
    #[must_use]
    pub fn mode(&self) -> &FieldMode {
        &self.mode
    }

    /// Whether this session is editing the field.
    #[must_use]
    pub fn is_editing(&self) -> bool {
        matches!(self.mode, FieldMode::Editing { .. })
    }

    /// The local buffer, when editing.
    #[must_use]
    pub fn buffer(&self) -> Option<&Value> {
        match &self.mode {
            FieldMode::Editing { buffer, .. } => Some(buffer),
            _ => None,
        }
    }

    /// The other session holding the lock, if any.
    #[must_use]
    pub fn locked_by(&self) -> Option<SessionId> {
        match self.mode {
            FieldMode::LockedByOther { holder } => Some(holder),
            _ => None,
        }
    }

    /// Topic sequence this controller's state reflects.
    #[must_use]
    pub fn synced_at(&self) -> u64 {
        self.synced_at
    }

    /// Try to start editing.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditable`] for read-only fields, or a
    /// persistence error if the current value cannot be read.
    pub fn begin_edit(
        &mut self,
        collection: &LiveCollection,
        me: SessionId,
    ) -> Result<EditOutcome, LiveError> {
        match self.mode {
            FieldMode::Removed => return Ok(EditOutcome::Removed),
            FieldMode::Editing { .. } => return Ok(EditOutcome::Editing),
            _ => {}
        }

        match collection.acquire(self.key.record_id, &self.key.field, me) {
            Ok(Acquire::Acquired { value, seq }) => {
                self.value = value.clone();
                self.mode = FieldMode::Editing {
                    buffer: value,
                    conflict: None,
                };
                self.synced_at = self.synced_at.max(seq);
                Ok(EditOutcome::Editing)
            }
            Ok(Acquire::Conflict { holder, seq }) => {
                self.mode = FieldMode::LockedByOther { holder };
                self.synced_at = self.synced_at.max(seq);
                Ok(EditOutcome::LockedBy(holder))
            }
            Err(LiveError::RecordGone(_)) => {
                self.mode = FieldMode::Removed;
                Ok(EditOutcome::Removed)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the local buffer. Never broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditing`] unless editing.
    pub fn update_buffer(&mut self, value: Value) -> Result<(), LiveError> {
        match &mut self.mode {
            FieldMode::Editing { buffer, .. } => {
                *buffer = value;
                Ok(())
            }
            _ => Err(LiveError::NotEditing(self.key.clone())),
        }
    }

    /// Persist the buffer, release the lock and return to viewing.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditing`] unless editing, or
    /// [`LiveError::Persistence`] if the write failed. On a failed write the
    /// lock is released anyway and the pre-edit value is shown.
    pub fn save(
        &mut self,
        collection: &LiveCollection,
        me: SessionId,
    ) -> Result<SaveOutcome, LiveError> {
        let buffer = match &self.mode {
            FieldMode::Removed => return Ok(SaveOutcome::Removed),
            FieldMode::Editing { buffer, .. } => buffer.clone(),
            _ => return Err(LiveError::NotEditing(self.key.clone())),
        };

        match collection.commit(self.key.record_id, &self.key.field, me, buffer.clone()) {
            Ok(seq) => {
                self.value = buffer;
                self.mode = FieldMode::Viewing;
                self.synced_at = self.synced_at.max(seq);
                Ok(SaveOutcome::Saved)
            }
            Err(LiveError::RecordGone(_)) => {
                self.mode = FieldMode::Removed;
                Ok(SaveOutcome::Removed)
            }
            Err(LiveError::LockLost(_)) => {
                self.refresh(collection, me);
                Ok(SaveOutcome::LockLost)
            }
            Err(e) => {
                self.mode = FieldMode::Viewing;
                Err(e)
            }
        }
    }

    /// Drop the buffer and release the lock. Returns `false` if the record
    /// was removed.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditing`] unless editing.
    pub fn cancel(&mut self, collection: &LiveCollection, me: SessionId) -> Result<bool, LiveError> {
        match self.mode {
            FieldMode::Removed => return Ok(false),
            FieldMode::Editing { .. } => {}
            _ => return Err(LiveError::NotEditing(self.key.clone())),
        }

        collection.release(self.key.record_id, &self.key.field, me);
        self.refresh(collection, me);
        Ok(true)
    }

    /// Adopt the conflicting out-of-band value as the new buffer.
    ///
    /// Returns `false` if there was no pending conflict.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotEditing`] unless editing.
    pub fn accept_external(&mut self) -> Result<bool, LiveError> {
        match &mut self.mode {
            FieldMode::Editing { buffer, conflict } => match conflict.take() {
                Some(incoming) => {
                    *buffer = incoming;
                    Ok(true)
                }
                None => Ok(false),
            },
            _ => Err(LiveError::NotEditing(self.key.clone())),
        }
    }

    /// Reset to an authoritative snapshot taken at `seq`, keeping an edit
    /// buffer whose lock is still ours.
    pub(crate) fn rebase(&mut self, value: Value, holder: Option<SessionId>, me: SessionId, seq: u64) {
        if holder == Some(me) && self.is_editing() {
            self.value = value;
            self.synced_at = self.synced_at.max(seq);
            return;
        }
        *self = Self::new(self.key.clone(), value, holder, me, self.synced_at.max(seq));
    }

    /// Re-read value and lock holder from the collection.
    fn refresh(&mut self, collection: &LiveCollection, me: SessionId) {
        let snapshot = collection.field_snapshot(self.key.record_id, &self.key.field);
        match snapshot {
            Ok(Some((value, holder, seq))) => {
                *self = Self::new(self.key.clone(), value, holder, me, self.synced_at.max(seq));
            }
            Ok(None) => self.mode = FieldMode::Removed,
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "Failed to refresh field");
                self.mode = FieldMode::Viewing;
            }
        }
    }

    /// React to a broadcast for this field's record.
    ///
    /// Returns a notice when the event is something the user must see.
    pub fn on_envelope(&mut self, envelope: &Envelope, me: SessionId) -> Option<Notice> {
        if envelope.seq <= self.synced_at {
            return None;
        }
        self.synced_at = envelope.seq;

        if matches!(self.mode, FieldMode::Removed) {
            return None;
        }

        match &envelope.event {
            BroadcastEvent::LockAcquired { holder, .. } => {
                if *holder == me {
                    return None;
                }
                match self.mode {
                    FieldMode::Viewing | FieldMode::LockedByOther { .. } => {
                        self.mode = FieldMode::LockedByOther { holder: *holder };
                    }
                    FieldMode::Editing { .. } => {
                        tracing::warn!(
                            key = %self.key,
                            %holder,
                            %me,
                            "Invariant violation: foreign lock acquired while editing"
                        );
                    }
                    FieldMode::Removed => {}
                }
                None
            }
            BroadcastEvent::LockReleased { holder, .. } => {
                if self.locked_by() == Some(*holder) {
                    self.mode = FieldMode::Viewing;
                }
                None
            }
            BroadcastEvent::ContentChanged { value, holder, .. } => {
                self.on_content_changed(value, *holder, me)
            }
            BroadcastEvent::RecordDeleted { .. } => {
                self.mode = FieldMode::Removed;
                None
            }
            BroadcastEvent::RecordCreated { .. } | BroadcastEvent::OrderChanged { .. } => None,
        }
    }

    fn on_content_changed(
        &mut self,
        value: &Value,
        holder: Option<SessionId>,
        me: SessionId,
    ) -> Option<Notice> {
        match &mut self.mode {
            FieldMode::Viewing | FieldMode::LockedByOther { .. } => {
                self.value = value.clone();
                None
            }
            FieldMode::Editing { conflict, .. } => match holder {
                Some(holder) if holder == me => None,
                Some(holder) => {
                    tracing::warn!(
                        key = %self.key,
                        %holder,
                        %me,
                        "Invariant violation: foreign commit while editing"
                    );
                    None
                }
                None if value == &self.value => None,
                None => {
                    tracing::info!(key = %self.key, "External change while editing");
                    self.value = value.clone();
                    *conflict = Some(value.clone());
                    Some(Notice::ExternalConflict {
                        record_id: self.key.record_id,
                        field: self.key.field.clone(),
                        value: value.clone(),
                    })
                }
            },
            FieldMode::Removed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alive_sync_core::RecordId;
    use serde_json::json;

    fn envelope(seq: u64, event: BroadcastEvent) -> Envelope {
        Envelope::new("alive:cards", seq, event)
    }

    fn viewing(me: SessionId) -> FieldController {
        FieldController::new(FieldKey::new(RecordId(5), "title"), json!("Soup"), None, me, 0)
    }

    #[test]
    fn foreign_lock_flips_viewing_to_locked_and_back() {
        let me = SessionId::new();
        let other = SessionId::new();
        let mut field = viewing(me);

        field.on_envelope(
            &envelope(
                1,
                BroadcastEvent::LockAcquired {
                    record_id: RecordId(5),
                    field: "title".into(),
                    holder: other,
                },
            ),
            me,
        );
        assert_eq!(field.locked_by(), Some(other));

        field.on_envelope(
            &envelope(
                2,
                BroadcastEvent::ContentChanged {
                    record_id: RecordId(5),
                    field: "title".into(),
                    value: json!("Pasta"),
                    holder: Some(other),
                },
            ),
            me,
        );
        field.on_envelope(
            &envelope(
                3,
                BroadcastEvent::LockReleased {
                    record_id: RecordId(5),
                    field: "title".into(),
                    holder: other,
                },
            ),
            me,
        );
        assert_eq!(field.mode(), &FieldMode::Viewing);
        assert_eq!(field.value(), &json!("Pasta"));
    }

    #[test]
    fn own_echo_is_ignored() {
        let me = SessionId::new();
        let mut field = viewing(me);

        field.on_envelope(
            &envelope(
                1,
                BroadcastEvent::LockAcquired {
                    record_id: RecordId(5),
                    field: "title".into(),
                    holder: me,
                },
            ),
            me,
        );
        assert_eq!(field.mode(), &FieldMode::Viewing);
    }

    #[test]
    fn stale_envelopes_are_skipped() {
        let me = SessionId::new();
        let other = SessionId::new();
        let mut field =
            FieldController::new(FieldKey::new(RecordId(5), "title"), json!("Soup"), None, me, 10);

        field.on_envelope(
            &envelope(
                9,
                BroadcastEvent::LockAcquired {
                    record_id: RecordId(5),
                    field: "title".into(),
                    holder: other,
                },
            ),
            me,
        );
        assert_eq!(field.mode(), &FieldMode::Viewing);
        assert_eq!(field.synced_at(), 10);
    }

    #[test]
    fn external_change_while_editing_raises_conflict() {
        let me = SessionId::new();
        let mut field = viewing(me);
        field.mode = FieldMode::Editing {
            buffer: json!("Draft"),
            conflict: None,
        };

        let notice = field.on_envelope(
            &envelope(
                4,
                BroadcastEvent::ContentChanged {
                    record_id: RecordId(5),
                    field: "title".into(),
                    value: json!("Admin"),
                    holder: None,
                },
            ),
            me,
        );

        assert!(matches!(notice, Some(Notice::ExternalConflict { .. })));
        assert_eq!(field.buffer(), Some(&json!("Draft")));

        assert!(field.accept_external().unwrap());
        assert_eq!(field.buffer(), Some(&json!("Admin")));
        assert!(!field.accept_external().unwrap());
    }

    #[test]
    fn unchanged_external_value_is_not_a_conflict() {
        let me = SessionId::new();
        let mut field = viewing(me);
        field.mode = FieldMode::Editing {
            buffer: json!("Draft"),
            conflict: None,
        };
        let unchanged = field.value().clone();

        let notice = field.on_envelope(
            &envelope(
                4,
                BroadcastEvent::ContentChanged {
                    record_id: RecordId(5),
                    field: "title".into(),
                    value: unchanged,
                    holder: None,
                },
            ),
            me,
        );

        assert_eq!(notice, None);
        assert!(!field.accept_external().unwrap());
        assert_eq!(field.buffer(), Some(&json!("Draft")));
    }

    #[test]
    fn buffer_updates_require_editing() {
        let me = SessionId::new();
        let mut field = viewing(me);
        assert!(matches!(
            field.update_buffer(json!("x")),
            Err(LiveError::NotEditing(_))
        ));
    }

    #[test]
    fn deletion_is_terminal() {
        let me = SessionId::new();
        let mut field = viewing(me);

        field.on_envelope(
            &envelope(
                1,
                BroadcastEvent::RecordDeleted {
                    record_id: RecordId(5),
                    order: vec![],
                },
            ),
            me,
        );
        assert_eq!(field.mode(), &FieldMode::Removed);

        field.on_envelope(
            &envelope(
                2,
                BroadcastEvent::ContentChanged {
                    record_id: RecordId(5),
                    field: "title".into(),
                    value: json!("ghost"),
                    holder: None,
                },
            ),
            me,
        );
        assert_eq!(field.value(), &json!("Soup"));
    }
}
