//! WASM bindings for presence-core.
//!
//! Provides the bridge between the TypeScript editor page and the Rust
//! presence engine.
//!
//! # Architecture
//!
//! The page owns the network provider, the awareness object and the editor
//! widget. It hands Rust three callback bridges, and Rust drives them:
//!
//! ```text
//! TypeScript                       WASM (Rust)
//! ──────────                       ───────────
//! awareness ──callbacks──> JsPresenceSession ──> impl PresenceSession
//! editor    ──callbacks──> JsOverlaySurface  ──> impl OverlaySurface
//! binding   ──callback───> JsTextBinding     ──> impl TextBinding
//!                                   │
//!                                   ▼
//!                    PresenceClient / PresenceView
//!                                   │
//!                                   ▼
//!             WasmPresenceClient / WasmPresenceView (exposed to JS)
//! ```
//!
//! Awareness change events are forwarded with `client.notifyChange(...)`.
//!
//! **Note**: The bindings only compile for `wasm32` targets. When building for
//! native targets (e.g., during `cargo check --workspace`), this crate only
//! exports the payload conversions.

pub mod convert;

#[cfg(target_arch = "wasm32")]
mod session_bridge;
#[cfg(target_arch = "wasm32")]
mod surface_bridge;

#[cfg(target_arch = "wasm32")]
pub use session_bridge::JsPresenceSession;
#[cfg(target_arch = "wasm32")]
pub use surface_bridge::{JsOverlaySurface, JsTextBinding};

// ============================================================================
// All WASM-specific code is gated behind target_arch = "wasm32"
// This allows `cargo check --workspace` to succeed on native targets.
// ============================================================================

#[cfg(target_arch = "wasm32")]
mod wasm_impl {
    use super::*;
    use presence_core::{
        PointerPosition, Position, PresenceClient, PresenceConfig, PresenceView, SelectionRange,
    };
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use tracing::debug;
    use tracing_subscriber::layer::SubscriberExt;
    use wasm_bindgen::prelude::*;

    // ========== Callback Logger Layer ==========

    /// Store the logger callback in thread-local storage (WASM is single-threaded)
    thread_local! {
        static LOGGER_CALLBACK: RefCell<Option<js_sys::Function>> = const { RefCell::new(None) };
    }

    /// A tracing layer that invokes a JavaScript callback for each log event.
    struct JsCallbackLayer;

    impl<S> tracing_subscriber::Layer<S> for JsCallbackLayer
    where
        S: tracing::Subscriber,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            LOGGER_CALLBACK.with(|cb| {
                let Some(callback) = cb.borrow().clone() else {
                    return;
                };
                let metadata = event.metadata();

                let mut visitor = MessageVisitor::default();
                event.record(&mut visitor);

                let js_event = js_sys::Object::new();
                let _ = js_sys::Reflect::set(&js_event, &"level".into(), &metadata.level().as_str().into());
                let _ = js_sys::Reflect::set(&js_event, &"target".into(), &metadata.target().into());
                let _ = js_sys::Reflect::set(&js_event, &"message".into(), &visitor.message.into());
                let _ = js_sys::Reflect::set(
                    &js_event,
                    &"timestamp".into(),
                    &presence_core::room::now_millis().into(),
                );

                let _ = callback.call1(&JsValue::NULL, &js_event);
            });
        }
    }

    /// Collects the `message` field, then any other fields as `name=value`.
    #[derive(Default)]
    struct MessageVisitor {
        message: String,
    }

    impl MessageVisitor {
        fn push_field(&mut self, name: &str, value: String) {
            if name == "message" {
                self.message = value;
            } else if self.message.is_empty() {
                self.message = format!("{}={}", name, value);
            } else {
                self.message.push_str(&format!(" {}={}", name, value));
            }
        }
    }

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.push_field(field.name(), format!("{:?}", value));
        }

        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            self.push_field(field.name(), value.to_string());
        }
    }

    /// Initialize the WASM module (sets up panic hook and tracing).
    ///
    /// Accepts an optional configuration object:
    /// - `init()` - console-only logging (default)
    /// - `init({ logger: (event) => {...} })` - callback + console logging
    /// - `init({ level: "trace" })` - lower the console level (default `debug`)
    ///
    /// The logger callback receives events with: `{ level, target, message, timestamp }`
    #[wasm_bindgen]
    pub fn init(config: Option<js_sys::Object>) {
        console_error_panic_hook::set_once();

        let option = |key: &str| {
            config
                .as_ref()
                .and_then(|cfg| js_sys::Reflect::get(cfg, &key.into()).ok())
                .filter(|v| !v.is_undefined())
        };

        let level = match option("level").and_then(|v| v.as_string()).as_deref() {
            Some("trace") => tracing::Level::TRACE,
            Some("info") => tracing::Level::INFO,
            Some("warn") => tracing::Level::WARN,
            Some("error") => tracing::Level::ERROR,
            _ => tracing::Level::DEBUG,
        };
        let console_config = tracing_wasm::WASMLayerConfigBuilder::new()
            .set_max_level(level)
            .build();

        let callback = option("logger").and_then(|v| v.dyn_into::<js_sys::Function>().ok());

        if let Some(cb) = callback {
            LOGGER_CALLBACK.with(|cell| {
                *cell.borrow_mut() = Some(cb);
            });

            let subscriber = tracing_subscriber::registry()
                .with(JsCallbackLayer)
                .with(tracing_wasm::WASMLayer::new(console_config));

            tracing::subscriber::set_global_default(subscriber).ok();
        } else {
            tracing_wasm::set_as_global_default_with_config(console_config);
        }

        tracing::info!("presence-wasm {} initialized", env!("CARGO_PKG_VERSION"));
    }

    /// Get version string
    #[wasm_bindgen]
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Generate a new random session ID as 16 hex characters.
    ///
    /// For hosts whose transport does not assign one.
    #[wasm_bindgen(js_name = generateSessionId)]
    pub fn generate_session_id() -> String {
        presence_core::SessionId::generate().to_string()
    }

    /// Generate a random `#rrggbb` color.
    #[wasm_bindgen(js_name = randomColor)]
    pub fn random_color() -> String {
        presence_core::state::random_color()
    }

    // ========== WASM Subscription Handle ==========

    /// Subscription handle exposed to JavaScript.
    ///
    /// Call `dispose()` to unsubscribe, or let the JS garbage collector
    /// collect it (the Rust Drop will run via FinalizationRegistry).
    #[wasm_bindgen]
    pub struct WasmSubscription {
        inner: RefCell<Option<presence_core::Subscription>>,
    }

    #[wasm_bindgen]
    impl WasmSubscription {
        /// Unsubscribe. Safe to call multiple times.
        pub fn dispose(&self) {
            self.inner.borrow_mut().take();
        }
    }

    fn js_err(e: impl std::fmt::Display) -> JsError {
        JsError::new(&e.to_string())
    }

    // ========== Client ==========

    /// One participant's presence connection, exposed to TypeScript.
    ///
    /// Methods take `&self` so JS callbacks fired during a call can re-enter
    /// the client.
    #[wasm_bindgen]
    pub struct WasmPresenceClient {
        session: Rc<JsPresenceSession>,
        inner: RefCell<PresenceClient>,
    }

    #[wasm_bindgen]
    impl WasmPresenceClient {
        /// Publish the local identity on an already connected session.
        ///
        /// `config` is a `PresenceConfig` object:
        /// `{ endpoint, room, displayName, color?, textName?, roster?: { excludeNames, dedup } }`
        pub fn connect(session: JsPresenceSession, config: JsValue) -> Result<WasmPresenceClient, JsError> {
            let config: PresenceConfig = serde_wasm_bindgen::from_value(config)
                .map_err(|e| JsError::new(&format!("Invalid presence config: {}", e)))?;

            let session = Rc::new(session);
            let transport = session_bridge::HostTransport::new(Rc::clone(&session));
            let client = PresenceClient::connect(&transport, config).map_err(js_err)?;

            Ok(WasmPresenceClient {
                session,
                inner: RefCell::new(client),
            })
        }

        #[wasm_bindgen(js_name = sessionId)]
        pub fn session_id(&self) -> String {
            use presence_core::PresenceSession;
            self.session.session_id().to_string()
        }

        /// Name of the shared text container the editor binding must use.
        #[wasm_bindgen(getter, js_name = textName)]
        pub fn text_name(&self) -> String {
            self.inner.borrow().config().text_name.clone()
        }

        /// Local caret moved (1-based). Returns whether a write happened.
        #[wasm_bindgen(js_name = caretMoved)]
        pub fn caret_moved(&self, line: u32, column: u32) -> Result<bool, JsError> {
            self.inner
                .borrow_mut()
                .caret_moved(Position::new(line, column))
                .map_err(js_err)
        }

        /// Local selection changed (1-based). Returns whether a write happened.
        #[wasm_bindgen(js_name = selectionChanged)]
        pub fn selection_changed(
            &self,
            start_line: u32,
            start_column: u32,
            end_line: u32,
            end_column: u32,
        ) -> Result<bool, JsError> {
            let range = SelectionRange::new(
                Position::new(start_line, start_column),
                Position::new(end_line, end_column),
            );
            self.inner.borrow_mut().selection_changed(range).map_err(js_err)
        }

        /// Local pointer moved. Returns whether a write happened.
        #[wasm_bindgen(js_name = pointerMoved)]
        pub fn pointer_moved(&self, x: f64, y: f64) -> Result<bool, JsError> {
            self.inner
                .borrow_mut()
                .pointer_moved(PointerPosition::new(x, y))
                .map_err(js_err)
        }

        /// Forward an awareness `change` event. Ids are 16 hex characters.
        #[wasm_bindgen(js_name = notifyChange)]
        pub fn notify_change(&self, added: Vec<String>, updated: Vec<String>, removed: Vec<String>) {
            use presence_core::PresenceSession;
            let change = convert::change_from_ids(self.session.session_id(), &added, &updated, &removed);
            self.session.notify(&change);
        }

        /// Attach an editor view. The view renders immediately.
        #[wasm_bindgen(js_name = mountView)]
        pub fn mount_view(&self, surface: JsOverlaySurface, binding: JsTextBinding) -> WasmPresenceView {
            let client = self.inner.borrow();
            let roster = client.config().roster.clone();
            let view = client.mount_view(surface, Box::new(binding), roster);
            WasmPresenceView {
                inner: RefCell::new(view),
                unmount_requested: Cell::new(false),
            }
        }

        /// Clear the local entry and disconnect. Safe to call multiple times.
        pub fn leave(&self) -> Result<(), JsError> {
            match self.inner.try_borrow_mut() {
                Ok(mut client) => client.leave().map_err(js_err),
                Err(_) => Err(JsError::new("leave() called while the client is busy")),
            }
        }

        #[wasm_bindgen(js_name = isActive)]
        pub fn is_active(&self) -> bool {
            self.inner.borrow().is_active()
        }
    }

    // ========== View ==========

    /// A mounted editor view, exposed to TypeScript.
    #[wasm_bindgen]
    pub struct WasmPresenceView {
        inner: RefCell<PresenceView<JsOverlaySurface>>,
        /// `unmount()` was called from a callback of a running `refresh()`.
        unmount_requested: Cell<bool>,
    }

    #[wasm_bindgen]
    impl WasmPresenceView {
        /// Current roster as `[{ displayName, colorHex }]`.
        pub fn roster(&self) -> Result<JsValue, JsError> {
            serde_wasm_bindgen::to_value(&self.inner.borrow().roster()).map_err(js_err)
        }

        /// Subscribe to roster changes. The callback receives the new list.
        ///
        /// Returns a `WasmSubscription` handle. Call `dispose()` on it to unsubscribe.
        #[wasm_bindgen(js_name = subscribeRoster)]
        pub fn subscribe_roster(&self, callback: js_sys::Function) -> WasmSubscription {
            let subscription = self.inner.borrow().subscribe_roster(move |entries| {
                if let Ok(js_entries) = serde_wasm_bindgen::to_value(entries) {
                    let _ = callback.call1(&JsValue::NULL, &js_entries);
                }
            });

            WasmSubscription {
                inner: RefCell::new(Some(subscription)),
            }
        }

        /// Re-run reconciliation, e.g. after the document's line count changed.
        pub fn refresh(&self) {
            self.inner.borrow().refresh();
            if self.unmount_requested.get() {
                self.unmount();
            }
        }

        /// Remove every overlay and style and destroy the binding. Safe to
        /// call multiple times, and from surface or roster callbacks: inside
        /// `refresh()` it takes effect when that call returns.
        pub fn unmount(&self) {
            match self.inner.try_borrow_mut() {
                Ok(mut view) => {
                    self.unmount_requested.set(false);
                    view.unmount();
                }
                Err(_) => {
                    debug!("unmount() during refresh(); deferred until it returns");
                    self.unmount_requested.set(true);
                }
            }
        }

        #[wasm_bindgen(js_name = isMounted)]
        pub fn is_mounted(&self) -> bool {
            self.inner.borrow().is_mounted()
        }
    }
}

// Re-export wasm_impl contents at crate root for wasm32 targets
#[cfg(target_arch = "wasm32")]
pub use wasm_impl::*;
