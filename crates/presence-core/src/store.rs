//! Presence store contract.
//!
//! The replicated key→value table that carries presence between peers lives
//! in an external transport. This module only names the slice of it the
//! engine consumes: connect, per-field writes to the local entry, full
//! removal, snapshot reads and change notifications.
//!
//! Implementations:
//! - `InMemoryHub` / `RoomSession` - in-process rooms for tests and native hosts
//! - `JsPresenceSession` (in presence-wasm) - wraps a browser awareness object

use crate::config::ConfigError;
use crate::events::{PresenceChange, Subscription};
use crate::state::{PresenceField, PresenceSnapshot};
use crate::SessionId;
use serde_json::Value;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Session is disconnected")]
    Disconnected,

    #[error("Identity must be published before other presence fields")]
    IdentityNotPublished,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, PresenceError>;

/// One participant's handle to a replicated presence channel.
///
/// Every key belongs to exactly one session; a session only ever writes its
/// own entry.
pub trait PresenceSession {
    /// Identifier the transport assigned to this session.
    fn session_id(&self) -> SessionId;

    /// Merge one field into the local entry, creating the entry if needed.
    fn set_field(&self, field: PresenceField, value: Value) -> Result<()>;

    /// Remove the local entry entirely.
    fn clear(&self) -> Result<()>;

    /// Point-in-time copy of every entry, in store iteration order.
    fn get_all_states(&self) -> PresenceSnapshot;

    /// Register for change notices. Delivery may lag the write that caused
    /// it, including for the writer itself. Drop or cancel the returned
    /// handle to unregister.
    fn on_change(&self, callback: Box<dyn Fn(&PresenceChange)>) -> Subscription;

    /// Sever the connection. Further writes fail with `Disconnected`.
    fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Factory for presence sessions.
pub trait PresenceTransport {
    /// Open a presence channel scoped to `room` on `endpoint`.
    fn connect(&self, endpoint: &str, room: &str) -> Result<Rc<dyn PresenceSession>>;
}
