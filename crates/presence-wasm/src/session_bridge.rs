//! JavaScript presence-store bridge for WASM.
//!
//! Implements the `PresenceSession` trait by calling JavaScript callbacks
//! that wrap the host's awareness object. Callbacks are synchronous: the
//! awareness API applies local writes immediately and reports changes
//! through its own event, which the host forwards with
//! `WasmPresenceClient.notifyChange`.

use crate::convert::{snapshot_from_entries, JsStateEntry};
use presence_core::events::{EventBus, PresenceChange, Subscription};
use presence_core::store::{PresenceError, PresenceSession, PresenceTransport, Result};
use presence_core::{PresenceField, PresenceSnapshot, SessionId};
use serde::Serialize;
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, warn};
use wasm_bindgen::prelude::*;

/// JavaScript presence-store bridge.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const hex = (id: number) => id.toString(16).padStart(16, "0");
/// const session = new JsPresenceSession(
///   hex(awareness.clientID),
///   (key, value) => awareness.setLocalStateField(key, value),
///   () => awareness.setLocalState(null),
///   () => [...awareness.getStates()].map(([id, state]) => ({ session: hex(id), state })),
///   () => provider.disconnect(),
/// );
/// ```
#[wasm_bindgen]
pub struct JsPresenceSession {
    session: SessionId,
    set_field_fn: js_sys::Function,
    clear_fn: js_sys::Function,
    get_states_fn: js_sys::Function,
    disconnect_fn: js_sys::Function,
    bus: Rc<EventBus<PresenceChange>>,
    connected: Cell<bool>,
}

#[wasm_bindgen]
impl JsPresenceSession {
    /// Create a session bridge. `session_id` is 16 hex characters.
    #[wasm_bindgen(constructor)]
    pub fn new(
        session_id: String,
        set_field_fn: js_sys::Function,
        clear_fn: js_sys::Function,
        get_states_fn: js_sys::Function,
        disconnect_fn: js_sys::Function,
    ) -> std::result::Result<JsPresenceSession, JsError> {
        let session: SessionId = session_id
            .parse()
            .map_err(|e| JsError::new(&format!("Invalid session ID: {}", e)))?;

        Ok(Self {
            session,
            set_field_fn,
            clear_fn,
            get_states_fn,
            disconnect_fn,
            bus: Rc::new(EventBus::new()),
            connected: Cell::new(true),
        })
    }
}

impl JsPresenceSession {
    /// Deliver a change notice to every registered listener.
    pub(crate) fn notify(&self, change: &PresenceChange) {
        self.bus.emit(change);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.get() {
            Ok(())
        } else {
            Err(PresenceError::Disconnected)
        }
    }
}

/// Convert a thrown JS value to a transport error.
fn js_err_to_presence_err(err: JsValue) -> PresenceError {
    let msg = err
        .as_string()
        .or_else(|| {
            js_sys::Reflect::get(&err, &"message".into())
                .ok()
                .and_then(|v| v.as_string())
        })
        .unwrap_or_else(|| format!("{:?}", err));
    PresenceError::Transport(msg)
}

/// JSON value to a plain JS value (objects, not `Map`s).
fn to_js(value: &Value) -> Result<JsValue> {
    let serializer = serde_wasm_bindgen::Serializer::new().serialize_maps_as_objects(true);
    value
        .serialize(&serializer)
        .map_err(|e| PresenceError::Transport(format!("Failed to convert value: {}", e)))
}

impl PresenceSession for JsPresenceSession {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn set_field(&self, field: PresenceField, value: Value) -> Result<()> {
        self.ensure_connected()?;
        let js_value = to_js(&value)?;
        self.set_field_fn
            .call2(&JsValue::NULL, &field.key().into(), &js_value)
            .map_err(js_err_to_presence_err)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.ensure_connected()?;
        self.clear_fn
            .call0(&JsValue::NULL)
            .map_err(js_err_to_presence_err)?;
        Ok(())
    }

    fn get_all_states(&self) -> PresenceSnapshot {
        let result = match self.get_states_fn.call0(&JsValue::NULL) {
            Ok(result) => result,
            Err(e) => {
                warn!("getStates failed: {}", js_err_to_presence_err(e));
                return PresenceSnapshot::new();
            }
        };

        match serde_wasm_bindgen::from_value::<Vec<JsStateEntry>>(result) {
            Ok(entries) => snapshot_from_entries(entries),
            Err(e) => {
                warn!("Failed to parse presence states: {}", e);
                PresenceSnapshot::new()
            }
        }
    }

    fn on_change(&self, callback: Box<dyn Fn(&PresenceChange)>) -> Subscription {
        self.bus.subscribe(move |change| callback(change))
    }

    fn disconnect(&self) -> Result<()> {
        if !self.connected.replace(false) {
            return Ok(());
        }
        self.disconnect_fn
            .call0(&JsValue::NULL)
            .map_err(js_err_to_presence_err)?;
        debug!("Disconnected session {}", self.session);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }
}

/// Transport whose only session was already connected by the host.
///
/// The host page owns the provider (endpoint, room, reconnects); Rust only
/// sees the resulting session.
pub(crate) struct HostTransport {
    session: Rc<JsPresenceSession>,
}

impl HostTransport {
    pub(crate) fn new(session: Rc<JsPresenceSession>) -> Self {
        Self { session }
    }
}

impl PresenceTransport for HostTransport {
    fn connect(&self, endpoint: &str, room: &str) -> Result<Rc<dyn PresenceSession>> {
        if !self.session.is_connected() {
            return Err(PresenceError::ConnectionFailed(format!(
                "session for {}/{} is already disconnected",
                endpoint, room
            )));
        }
        let session: Rc<dyn PresenceSession> = self.session.clone();
        Ok(session)
    }
}
