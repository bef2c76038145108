//! Local presence publishing.
//!
//! `LocalPresencePublisher` turns local input events into writes on the
//! session's own store entry. It remembers the last value it sent per field
//! and only writes when the value actually changed, so a burst of identical
//! caret events costs one write.

use crate::state::{Identity, PointerPosition, Position, PresenceField, SelectionRange};
use crate::store::{PresenceError, PresenceSession, Result};
use crate::SessionId;
use serde::Serialize;
use std::rc::Rc;
use tracing::{debug, trace};

/// Values last written successfully, per field.
#[derive(Debug, Default)]
struct SentCache {
    caret: Option<Position>,
    selection: Option<SelectionRange>,
    pointer: Option<PointerPosition>,
}

/// Writes local caret, selection and pointer changes to the store.
pub struct LocalPresencePublisher {
    session: Rc<dyn PresenceSession>,
    identity: Option<Identity>,
    sent: SentCache,
}

impl LocalPresencePublisher {
    pub fn new(session: Rc<dyn PresenceSession>) -> Self {
        Self {
            session,
            identity: None,
            sent: SentCache::default(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.session_id()
    }

    /// Identity published on this session, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Write the `user` field. Only the first call writes; later calls return
    /// `Ok(false)` because identity is fixed for the session.
    pub fn publish_identity(&mut self, identity: Identity) -> Result<bool> {
        if self.identity.is_some() {
            debug!("Identity already published for session {}", self.session_id());
            return Ok(false);
        }
        self.session
            .set_field(PresenceField::User, serde_json::to_value(&identity)?)?;
        debug!(
            "Published identity {} ({}) for session {}",
            identity.name,
            identity.color,
            self.session_id()
        );
        self.identity = Some(identity);
        Ok(true)
    }

    /// Local caret moved. Returns whether a write happened.
    pub fn caret_moved(&mut self, position: Position) -> Result<bool> {
        self.ensure_identity()?;
        write_if_changed(
            self.session.as_ref(),
            PresenceField::Cursor,
            &mut self.sent.caret,
            position,
        )
    }

    /// Local selection changed. Returns whether a write happened.
    pub fn selection_changed(&mut self, range: SelectionRange) -> Result<bool> {
        self.ensure_identity()?;
        write_if_changed(
            self.session.as_ref(),
            PresenceField::Selection,
            &mut self.sent.selection,
            range,
        )
    }

    /// Local pointer moved. Returns whether a write happened.
    pub fn pointer_moved(&mut self, point: PointerPosition) -> Result<bool> {
        self.ensure_identity()?;
        write_if_changed(
            self.session.as_ref(),
            PresenceField::Pointer,
            &mut self.sent.pointer,
            point,
        )
    }

    fn ensure_identity(&self) -> Result<()> {
        if self.identity.is_none() {
            return Err(PresenceError::IdentityNotPublished);
        }
        Ok(())
    }
}

fn write_if_changed<T: PartialEq + Serialize + Copy>(
    session: &dyn PresenceSession,
    field: PresenceField,
    last_sent: &mut Option<T>,
    value: T,
) -> Result<bool> {
    if last_sent.as_ref() == Some(&value) {
        trace!("Skipping unchanged {} write", field.key());
        return Ok(false);
    }
    session.set_field(field, serde_json::to_value(value)?)?;
    *last_sent = Some(value);
    Ok(true)
}
