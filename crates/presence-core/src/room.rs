//! In-process presence rooms.
//!
//! `InMemoryHub` stands in for the replicated presence transport: every
//! `(endpoint, room)` pair maps to one `InMemoryRoom` shared by all sessions
//! that connect to it. Writes are applied to the room immediately, but the
//! change notices they cause are queued and only delivered by `flush()`,
//! which models the transport's asynchronous delivery (a writer sees its own
//! write on the next cycle, not inside the write call).
//!
//! Each entry carries awareness-style metadata: a per-entry `clock` bumped
//! on every write and a `last_updated` timestamp, so entries of peers that
//! vanished without clearing can be expired the way a transport would after
//! a connection timeout.

use crate::events::{ChangeOrigin, EventBus, PresenceChange, Subscription};
use crate::state::{ParticipantState, PresenceField, PresenceSnapshot};
use crate::store::{PresenceError, PresenceSession, PresenceTransport, Result};
use crate::SessionId;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, info};

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

/// Operations applied to a room, in order. Used to assert write counts and
/// teardown ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomOp {
    SetField {
        session: SessionId,
        field: PresenceField,
    },
    Clear {
        session: SessionId,
    },
    Disconnect {
        session: SessionId,
    },
    Expire {
        session: SessionId,
    },
}

/// Stored entry plus transport metadata.
#[derive(Debug, Clone)]
pub struct RoomEntry {
    pub session: SessionId,
    pub state: ParticipantState,
    /// Bumped on every write to this entry.
    pub clock: u64,
    /// When the entry was last written, in milliseconds since Unix epoch.
    pub last_updated: f64,
}

struct Member {
    session: SessionId,
    bus: Rc<EventBus<PresenceChange>>,
}

#[derive(Default)]
struct RoomInner {
    name: String,
    entries: Vec<RoomEntry>,
    members: Vec<Member>,
    pending: VecDeque<(SessionId, PresenceChange)>,
    log: Vec<RoomOp>,
}

impl RoomInner {
    fn is_member(&self, session: SessionId) -> bool {
        self.members.iter().any(|m| m.session == session)
    }

    /// Queue one notice per connected member, tagged with its origin.
    fn broadcast(&mut self, writer: Option<SessionId>, make: impl Fn(ChangeOrigin) -> PresenceChange) {
        let targets: Vec<SessionId> = self.members.iter().map(|m| m.session).collect();
        for target in targets {
            let origin = if Some(target) == writer {
                ChangeOrigin::Local
            } else {
                ChangeOrigin::Remote
            };
            self.pending.push_back((target, make(origin)));
        }
    }
}

/// A shared presence room. Cheap to clone; clones refer to the same room.
#[derive(Clone, Default)]
pub struct InMemoryRoom {
    inner: Rc<RefCell<RoomInner>>,
}

impl InMemoryRoom {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RoomInner {
                name: name.into(),
                ..RoomInner::default()
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// Connect a new session with a generated id.
    pub fn join(&self) -> Rc<RoomSession> {
        self.join_as(SessionId::generate())
    }

    /// Connect a session with a fixed id.
    pub fn join_as(&self, session: SessionId) -> Rc<RoomSession> {
        let bus = Rc::new(EventBus::new());
        let mut inner = self.inner.borrow_mut();
        inner.members.push(Member {
            session,
            bus: Rc::clone(&bus),
        });
        info!("Session {} joined room {}", session, inner.name);
        Rc::new(RoomSession {
            session,
            room: self.clone(),
            bus,
            connected: Cell::new(true),
        })
    }

    /// Deliver every queued change notice. Returns how many were delivered.
    ///
    /// Notices caused by callbacks during the flush are delivered in the same
    /// call.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;
        loop {
            // Release the room borrow before running callbacks; they read it.
            let next = {
                let mut inner = self.inner.borrow_mut();
                inner.pending.pop_front().and_then(|(target, change)| {
                    inner
                        .members
                        .iter()
                        .find(|m| m.session == target)
                        .map(|m| (Rc::clone(&m.bus), change))
                })
            };
            match next {
                Some((bus, change)) => {
                    bus.emit(&change);
                    delivered += 1;
                }
                None if self.inner.borrow().pending.is_empty() => break,
                // Target left before delivery; skip it.
                None => continue,
            }
        }
        delivered
    }

    pub fn pending_notices(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.inner
            .borrow()
            .entries
            .iter()
            .map(|e| (e.session, e.state.clone()))
            .collect()
    }

    pub fn entry(&self, session: SessionId) -> Option<RoomEntry> {
        self.inner
            .borrow()
            .entries
            .iter()
            .find(|e| e.session == session)
            .cloned()
    }

    pub fn operations(&self) -> Vec<RoomOp> {
        self.inner.borrow().log.clone()
    }

    /// Number of field writes that reached the room for `session`.
    pub fn write_count(&self, session: SessionId) -> usize {
        self.inner
            .borrow()
            .log
            .iter()
            .filter(|op| matches!(op, RoomOp::SetField { session: s, .. } if *s == session))
            .count()
    }

    /// Write a raw field value on behalf of `session`, bypassing any
    /// publisher. Lets tests inject malformed or stale peer state.
    pub fn inject(&self, session: SessionId, field: PresenceField, value: Value) {
        self.write(session, field, value, now_millis());
    }

    /// Remove entries of disconnected sessions that were not written within
    /// `timeout_ms` of `now_ms`. Returns the expired sessions.
    pub fn expire_outdated(&self, now_ms: f64, timeout_ms: f64) -> Vec<SessionId> {
        let mut inner = self.inner.borrow_mut();
        let expired: Vec<SessionId> = inner
            .entries
            .iter()
            .filter(|e| now_ms - e.last_updated >= timeout_ms)
            .map(|e| e.session)
            .filter(|session| !inner.is_member(*session))
            .collect();

        if expired.is_empty() {
            return expired;
        }

        inner.entries.retain(|e| !expired.contains(&e.session));
        for session in &expired {
            inner.log.push(RoomOp::Expire { session: *session });
        }
        let removed = expired.clone();
        inner.broadcast(None, |origin| PresenceChange::removed(removed.clone(), origin));
        info!("Expired {} outdated presence entries in room {}", expired.len(), inner.name);
        expired
    }

    fn write(&self, session: SessionId, field: PresenceField, value: Value, now: f64) {
        let mut inner = self.inner.borrow_mut();
        inner.log.push(RoomOp::SetField { session, field });

        let created = match inner.entries.iter().position(|e| e.session == session) {
            Some(index) => {
                let entry = &mut inner.entries[index];
                entry.state.set(field, value);
                entry.clock += 1;
                entry.last_updated = now;
                false
            }
            None => {
                let mut state = ParticipantState::new();
                state.set(field, value);
                inner.entries.push(RoomEntry {
                    session,
                    state,
                    clock: 0,
                    last_updated: now,
                });
                true
            }
        };

        if created {
            inner.broadcast(Some(session), |origin| PresenceChange::added(session, origin));
        } else {
            inner.broadcast(Some(session), |origin| PresenceChange::updated(session, origin));
        }
    }

    fn remove(&self, session: SessionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.log.push(RoomOp::Clear { session });
        let before = inner.entries.len();
        inner.entries.retain(|e| e.session != session);
        let existed = inner.entries.len() != before;
        if existed {
            inner.broadcast(Some(session), |origin| PresenceChange::removed(vec![session], origin));
        }
        existed
    }

    fn leave(&self, session: SessionId) {
        let mut inner = self.inner.borrow_mut();
        inner.log.push(RoomOp::Disconnect { session });
        inner.members.retain(|m| m.session != session);
        inner.pending.retain(|(target, _)| *target != session);
        info!("Session {} left room {}", session, inner.name);
    }
}

/// A session connected to an `InMemoryRoom`.
pub struct RoomSession {
    session: SessionId,
    room: InMemoryRoom,
    bus: Rc<EventBus<PresenceChange>>,
    connected: Cell<bool>,
}

impl RoomSession {
    pub fn room(&self) -> &InMemoryRoom {
        &self.room
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.get() {
            Ok(())
        } else {
            Err(PresenceError::Disconnected)
        }
    }
}

impl PresenceSession for RoomSession {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn set_field(&self, field: PresenceField, value: Value) -> Result<()> {
        self.ensure_connected()?;
        self.room.write(self.session, field, value, now_millis());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.ensure_connected()?;
        if !self.room.remove(self.session) {
            debug!("Clear for session {} found no entry", self.session);
        }
        Ok(())
    }

    fn get_all_states(&self) -> PresenceSnapshot {
        self.room.snapshot()
    }

    fn on_change(&self, callback: Box<dyn Fn(&PresenceChange)>) -> Subscription {
        self.bus.subscribe(move |change| callback(change))
    }

    fn disconnect(&self) -> Result<()> {
        if self.connected.replace(false) {
            self.room.leave(self.session);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }
}

/// Transport that hands out sessions on in-process rooms.
#[derive(Default)]
pub struct InMemoryHub {
    rooms: RefCell<HashMap<(String, String), InMemoryRoom>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the room for `(endpoint, room)`.
    pub fn room(&self, endpoint: &str, room: &str) -> InMemoryRoom {
        self.rooms
            .borrow_mut()
            .entry((endpoint.to_string(), room.to_string()))
            .or_insert_with(|| InMemoryRoom::new(room))
            .clone()
    }

    /// Flush every room. Returns the total number of notices delivered.
    pub fn flush(&self) -> usize {
        let rooms: Vec<InMemoryRoom> = self.rooms.borrow().values().cloned().collect();
        rooms.iter().map(InMemoryRoom::flush).sum()
    }
}

impl PresenceTransport for InMemoryHub {
    fn connect(&self, endpoint: &str, room: &str) -> Result<Rc<dyn PresenceSession>> {
        if endpoint.is_empty() || room.is_empty() {
            return Err(PresenceError::ConnectionFailed(
                "endpoint and room must not be empty".to_string(),
            ));
        }
        let session: Rc<dyn PresenceSession> = self.room(endpoint, room).join();
        debug!("Connected session {} to {}/{}", session.session_id(), endpoint, room);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counted(session: &RoomSession) -> (Rc<RefCell<Vec<PresenceChange>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let sub = session.on_change(Box::new(move |change| sink.borrow_mut().push(change.clone())));
        (seen, sub)
    }

    #[test]
    fn test_notices_are_deferred_until_flush() {
        let room = InMemoryRoom::new("r");
        let a = room.join_as(SessionId::from(1));
        let (seen, _sub) = counted(&a);

        a.set_field(PresenceField::Cursor, json!({ "line": 1, "column": 1 }))
            .unwrap();
        assert!(seen.borrow().is_empty());
        assert_eq!(room.pending_notices(), 1);

        assert_eq!(room.flush(), 1);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].added, vec![SessionId::from(1)]);
        assert_eq!(seen[0].origin, ChangeOrigin::Local);
    }

    #[test]
    fn test_writes_merge_in_place() {
        let room = InMemoryRoom::new("r");
        let a = room.join_as(SessionId::from(1));

        a.set_field(PresenceField::User, json!({ "name": "Ana", "color": "#ff0000" }))
            .unwrap();
        a.set_field(PresenceField::Cursor, json!({ "line": 2, "column": 4 }))
            .unwrap();

        let entry = room.entry(SessionId::from(1)).unwrap();
        assert_eq!(entry.clock, 1);
        assert!(entry.state.identity().is_ok());
        assert!(entry.state.caret().is_ok());
        assert_eq!(room.snapshot().len(), 1);
    }

    #[test]
    fn test_remote_writes_are_tagged_remote() {
        let room = InMemoryRoom::new("r");
        let a = room.join_as(SessionId::from(1));
        let b = room.join_as(SessionId::from(2));
        let (seen, _sub) = counted(&b);

        a.set_field(PresenceField::Pointer, json!({ "x": 1, "y": 2 }))
            .unwrap();
        room.flush();

        assert_eq!(seen.borrow()[0].origin, ChangeOrigin::Remote);
    }

    #[test]
    fn test_clear_removes_entry_and_notifies() {
        let room = InMemoryRoom::new("r");
        let a = room.join_as(SessionId::from(1));
        let b = room.join_as(SessionId::from(2));
        a.set_field(PresenceField::User, json!({ "name": "Ana", "color": "#ff0000" }))
            .unwrap();
        room.flush();

        let (seen, _sub) = counted(&b);
        a.clear().unwrap();
        room.flush();

        assert!(room.snapshot().is_empty());
        assert_eq!(seen.borrow()[0].removed, vec![SessionId::from(1)]);
    }

    #[test]
    fn test_disconnected_session_rejects_writes() {
        let room = InMemoryRoom::new("r");
        let a = room.join_as(SessionId::from(1));
        a.disconnect().unwrap();
        a.disconnect().unwrap();

        assert!(matches!(
            a.set_field(PresenceField::Cursor, json!({})),
            Err(PresenceError::Disconnected)
        ));
        assert!(!a.is_connected());
        assert_eq!(
            room.operations(),
            vec![RoomOp::Disconnect {
                session: SessionId::from(1)
            }]
        );
    }

    #[test]
    fn test_disconnect_drops_pending_notices_for_that_session() {
        let room = InMemoryRoom::new("r");
        let a = room.join_as(SessionId::from(1));
        let (seen, _sub) = counted(&a);

        a.set_field(PresenceField::Cursor, json!({ "line": 1, "column": 1 }))
            .unwrap();
        a.disconnect().unwrap();

        assert_eq!(room.flush(), 0);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_expire_outdated_only_removes_departed_sessions() {
        let room = InMemoryRoom::new("r");
        let stays = room.join_as(SessionId::from(1));
        let vanishes = room.join_as(SessionId::from(2));
        stays
            .set_field(PresenceField::Cursor, json!({ "line": 1, "column": 1 }))
            .unwrap();
        vanishes
            .set_field(PresenceField::Cursor, json!({ "line": 1, "column": 1 }))
            .unwrap();
        vanishes.disconnect().unwrap();

        let later = now_millis() + 60_000.0;
        let expired = room.expire_outdated(later, 30_000.0);

        assert_eq!(expired, vec![SessionId::from(2)]);
        assert!(room.entry(SessionId::from(1)).is_some());
        assert!(room.entry(SessionId::from(2)).is_none());
    }

    #[test]
    fn test_hub_routes_by_endpoint_and_room() {
        let hub = InMemoryHub::new();
        let a = hub.connect("ws://relay", "one").unwrap();
        let b = hub.connect("ws://relay", "two").unwrap();

        a.set_field(PresenceField::Cursor, json!({ "line": 1, "column": 1 }))
            .unwrap();

        assert_eq!(a.get_all_states().len(), 1);
        assert!(b.get_all_states().is_empty());
        assert!(hub.connect("", "one").is_err());
    }
}
