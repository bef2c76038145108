//! Event infrastructure for presence-core.
//!
//! Provides `PresenceChange` (the store's change notice) and a generic
//! `EventBus` with drop-to-unsubscribe `Subscription` handles.
//!
//! The presence engine is single-threaded on every target: notices are
//! delivered on the same context as input handling and one reconcile pass
//! finishes before the next begins. The bus therefore uses `Rc` and
//! `RefCell` on native and browser targets alike.

use crate::SessionId;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Who caused a change, from the receiving session's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOrigin {
    /// The receiving session wrote the change itself.
    Local,
    /// Another session (or the transport) caused it.
    Remote,
}

/// Advisory description of a store change.
///
/// Receivers must not rely on it for state: re-read the full snapshot with
/// `PresenceSession::get_all_states`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub added: Vec<SessionId>,
    pub updated: Vec<SessionId>,
    pub removed: Vec<SessionId>,
    pub origin: ChangeOrigin,
}

impl PresenceChange {
    pub fn added(session: SessionId, origin: ChangeOrigin) -> Self {
        Self {
            added: vec![session],
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn updated(session: SessionId, origin: ChangeOrigin) -> Self {
        Self {
            added: Vec::new(),
            updated: vec![session],
            removed: Vec::new(),
            origin,
        }
    }

    pub fn removed(sessions: Vec<SessionId>, origin: ChangeOrigin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: sessions,
            origin,
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events; drop it or call `cancel()` to
/// unsubscribe. Cancelling after the bus is gone is a no-op.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    fn new(unsubscribe: impl FnOnce() + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Unsubscribe now.
    pub fn cancel(mut self) {
        self.release();
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

type Callback<E> = Rc<dyn Fn(&E)>;

/// Event bus for publishing events to subscribers.
///
/// Wrap in `Rc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RefCell<Vec<(usize, Callback<E>)>>,
    next_id: Cell<usize>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(self: &Rc<Self>, callback: impl Fn(&E) + 'static) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.callbacks.borrow_mut().push((id, Rc::new(callback)));

        let bus: Weak<Self> = Rc::downgrade(self);
        Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.unsubscribe(id);
            }
        })
    }

    fn unsubscribe(&self, id: usize) {
        // try_borrow_mut: a handle dropped while the list is borrowed must not panic
        if let Ok(mut callbacks) = self.callbacks.try_borrow_mut() {
            callbacks.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: &E) {
        // Clone the callback list so callbacks may subscribe or unsubscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .borrow()
            .iter()
            .map(|(_, cb)| Rc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.borrow().len()
    }
}
