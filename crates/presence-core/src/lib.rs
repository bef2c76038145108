//! presence-core: Shared Rust library for real-time collaborative presence.
//!
//! This crate provides the core functionality for:
//! - Publishing the local participant's identity, caret, selection and pointer
//! - Reconciling remote participants' overlays against a rendering surface
//! - Deriving a deduplicated roster of remote participants
//! - Joining, mounting, unmounting and leaving without leaking overlays
//! - PresenceSession, PresenceTransport and OverlaySurface trait abstractions

pub mod config;
pub mod document;
pub mod events;
pub mod lifecycle;
pub mod publisher;
pub mod reconciler;
pub mod room;
pub mod roster;
pub mod session_id;
pub mod state;
pub mod store;
pub mod surface;

pub use config::{ConfigError, PresenceConfig};
pub use document::{DocumentError, LoroTextBinding, SharedText, TextBinding};
pub use events::{ChangeOrigin, EventBus, PresenceChange, Subscription};
pub use lifecycle::{PresenceClient, PresenceView};
pub use publisher::LocalPresencePublisher;
pub use reconciler::{OverlayCategory, OverlayReconciler, ReconcileReport};
pub use room::{InMemoryHub, InMemoryRoom, RoomSession};
pub use roster::{DedupKey, RosterConfig, RosterEntry, RosterView};
pub use session_id::{SessionId, SessionIdError};
pub use state::{
    FieldError, Identity, ParticipantState, PointerPosition, Position, PresenceField,
    PresenceSnapshot, SelectionRange,
};
pub use store::{PresenceError, PresenceSession, PresenceTransport};
pub use surface::{
    Decoration, DecorationHandle, DecorationKind, OverlaySurface, PointerHandle, RecordingSurface,
    StyleRule,
};
