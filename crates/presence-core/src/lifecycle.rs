//! Presence lifecycle: connecting, mounting views, and tearing both down.
//!
//! `PresenceClient` owns the session and the publisher for one participant.
//! `PresenceView` ties a rendering surface and a text binding to the
//! client's session: it reconciles overlays and recomputes the roster on
//! every change notice until it is unmounted.
//!
//! Leaving and unmounting are independent. Each runs once, whichever order
//! they happen in, and dropping either handle runs it implicitly.

use crate::config::PresenceConfig;
use crate::document::{self, SharedText, TextBinding};
use crate::events::{ChangeOrigin, EventBus, PresenceChange, Subscription};
use crate::publisher::LocalPresencePublisher;
use crate::reconciler::{OverlayReconciler, ReconcileReport};
use crate::roster::{RosterConfig, RosterEntry, RosterView};
use crate::state::{Identity, PointerPosition, Position, SelectionRange};
use crate::store::{PresenceSession, PresenceTransport, Result};
use crate::surface::OverlaySurface;
use crate::SessionId;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, info, trace, warn};

/// One participant's connection to a presence room.
pub struct PresenceClient {
    session: Rc<dyn PresenceSession>,
    publisher: LocalPresencePublisher,
    config: PresenceConfig,
    membership_log: Option<Subscription>,
    left: bool,
}

impl PresenceClient {
    /// Connect to the configured room and publish the local identity.
    ///
    /// A random `#rrggbb` color is generated when the config has none.
    pub fn connect(transport: &dyn PresenceTransport, config: PresenceConfig) -> Result<Self> {
        config.validate()?;
        let session = transport.connect(&config.endpoint, &config.room)?;

        let identity = match &config.color {
            Some(color) => Identity::new(config.display_name.clone(), color.clone()),
            None => Identity::with_random_color(config.display_name.clone()),
        };

        let mut publisher = LocalPresencePublisher::new(Rc::clone(&session));
        publisher.publish_identity(identity)?;

        let local = session.session_id();
        let room = config.room.clone();
        let membership_log = session.on_change(Box::new(move |change: &PresenceChange| {
            log_membership(local, &room, change)
        }));

        info!(
            "Connected session {} to room {} as {}",
            local, config.room, config.display_name
        );

        Ok(Self {
            session,
            publisher,
            config,
            membership_log: Some(membership_log),
            left: false,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session.session_id()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.publisher.identity()
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// The underlying session, for hosts that need raw store access.
    pub fn session(&self) -> Rc<dyn PresenceSession> {
        Rc::clone(&self.session)
    }

    /// Whether `leave()` has not run yet.
    pub fn is_active(&self) -> bool {
        !self.left
    }

    pub fn caret_moved(&mut self, position: Position) -> Result<bool> {
        self.publisher.caret_moved(position)
    }

    pub fn selection_changed(&mut self, range: SelectionRange) -> Result<bool> {
        self.publisher.selection_changed(range)
    }

    pub fn pointer_moved(&mut self, point: PointerPosition) -> Result<bool> {
        self.publisher.pointer_moved(point)
    }

    /// Create the local replica of the shared text named by the config.
    /// Its edits are attributed to this client's session.
    pub fn open_text(&self) -> document::Result<SharedText> {
        let text = SharedText::for_session(&self.config.text_name, self.session_id())?;
        debug!("Opened shared text {} for session {}", text.name(), self.session_id());
        Ok(text)
    }

    /// Attach a view to this client's session and render the current state.
    pub fn mount_view<S: OverlaySurface + 'static>(
        &self,
        surface: S,
        binding: Box<dyn TextBinding>,
        roster: RosterConfig,
    ) -> PresenceView<S> {
        PresenceView::mount(Rc::clone(&self.session), surface, binding, roster)
    }

    /// Remove the local entry, then disconnect. Runs once; later calls
    /// return `Ok(())` without touching the session.
    ///
    /// The disconnect happens even when clearing fails; the clear error is
    /// returned afterwards.
    pub fn leave(&mut self) -> Result<()> {
        if self.left {
            return Ok(());
        }
        self.left = true;
        self.membership_log = None;

        let cleared = self.session.clear();
        if let Err(e) = &cleared {
            warn!("Failed to clear presence entry of {}: {}", self.session_id(), e);
        }
        self.session.disconnect()?;

        info!("Session {} left room {}", self.session_id(), self.config.room);
        cleared
    }
}

impl Drop for PresenceClient {
    fn drop(&mut self) {
        if let Err(e) = self.leave() {
            warn!("Leaving on drop failed: {}", e);
        }
    }
}

fn log_membership(local: SessionId, room: &str, change: &PresenceChange) {
    if change.origin == ChangeOrigin::Local {
        return;
    }
    for session in change.added.iter().filter(|s| **s != local) {
        info!("Participant {} joined room {}", session, room);
    }
    for session in change.removed.iter().filter(|s| **s != local) {
        info!("Participant {} left room {}", session, room);
    }
}

struct ViewState<S> {
    session: Rc<dyn PresenceSession>,
    surface: S,
    reconciler: OverlayReconciler,
    roster: RosterView,
}

struct ViewInner<S> {
    state: RefCell<ViewState<S>>,
    roster_entries: RefCell<Vec<RosterEntry>>,
    roster_bus: Rc<EventBus<Vec<RosterEntry>>>,
    /// A notice arrived while a pass held `state`.
    dirty: Cell<bool>,
    /// Set by unmount. A pass that is running tears down when it ends.
    unmounted: Cell<bool>,
}

impl<S: OverlaySurface> ViewInner<S> {
    /// Reconcile and recompute the roster from a fresh snapshot.
    ///
    /// A call that arrives while a pass is running marks the view dirty and
    /// returns `None`; the running pass then repeats until no notice is
    /// left, so every notice is followed by a complete pass.
    fn refresh(&self) -> Option<ReconcileReport> {
        if self.unmounted.get() {
            return None;
        }
        let Ok(mut state) = self.state.try_borrow_mut() else {
            trace!("Presence notice during a reconcile pass; queued");
            self.dirty.set(true);
            return None;
        };

        let mut report;
        let mut passes = 0;
        loop {
            self.dirty.set(false);
            passes += 1;

            let ViewState {
                session,
                surface,
                reconciler,
                roster,
            } = &mut *state;
            let snapshot = session.get_all_states();
            report = reconciler.reconcile(&snapshot, surface);
            let changed = roster.refresh(&snapshot);

            if self.unmounted.get() {
                teardown(&mut *state);
                return None;
            }

            if changed {
                let entries = roster.entries().to_vec();
                debug!("Roster changed: {} participants", entries.len());
                *self.roster_entries.borrow_mut() = entries.clone();

                // Listeners run without the state borrow so they may call
                // back into the view.
                drop(state);
                self.roster_bus.emit(&entries);
                if self.unmounted.get() || !self.dirty.get() {
                    break;
                }
                match self.state.try_borrow_mut() {
                    Ok(reborrowed) => state = reborrowed,
                    // Whoever holds the state is mid-pass and sees `dirty`.
                    Err(_) => break,
                }
                continue;
            }

            if !self.dirty.get() {
                break;
            }
        }

        if passes > 1 {
            debug!("Reconciled {} times to catch up with queued notices", passes);
        }
        Some(report)
    }

    /// Remove everything the view rendered, now or at the end of the
    /// running pass.
    fn unmount(&self) {
        self.unmounted.set(true);
        match self.state.try_borrow_mut() {
            Ok(mut state) => teardown(&mut *state),
            Err(_) => debug!("Unmount during a reconcile pass; deferred to its end"),
        }
    }
}

fn teardown<S: OverlaySurface>(state: &mut ViewState<S>) {
    let ViewState {
        surface, reconciler, ..
    } = state;
    let report = reconciler.teardown(surface);
    info!(
        "Unmounted presence view: removed {} carets, {} selections, {} pointers",
        report.carets.removed, report.selections.removed, report.pointers.removed
    );
}

/// A mounted presence view.
pub struct PresenceView<S: OverlaySurface> {
    inner: Rc<ViewInner<S>>,
    subscription: Option<Subscription>,
    binding: Option<Box<dyn TextBinding>>,
}

impl<S: OverlaySurface + 'static> PresenceView<S> {
    fn mount(
        session: Rc<dyn PresenceSession>,
        surface: S,
        binding: Box<dyn TextBinding>,
        roster: RosterConfig,
    ) -> Self {
        let local = session.session_id();
        let inner = Rc::new(ViewInner {
            state: RefCell::new(ViewState {
                session: Rc::clone(&session),
                surface,
                reconciler: OverlayReconciler::new(local),
                roster: RosterView::new(local, roster),
            }),
            roster_entries: RefCell::new(Vec::new()),
            roster_bus: Rc::new(EventBus::new()),
            dirty: Cell::new(false),
            unmounted: Cell::new(false),
        });

        let weak: Weak<ViewInner<S>> = Rc::downgrade(&inner);
        let subscription = session.on_change(Box::new(move |_change: &PresenceChange| {
            if let Some(inner) = weak.upgrade() {
                inner.refresh();
            }
        }));

        inner.refresh();
        info!("Mounted presence view for session {}", local);

        Self {
            inner,
            subscription: Some(subscription),
            binding: Some(binding),
        }
    }
}

impl<S: OverlaySurface> PresenceView<S> {
    /// Run a pass now, e.g. after the document's line count changed.
    pub fn refresh(&self) -> Option<ReconcileReport> {
        if !self.is_mounted() {
            return None;
        }
        self.inner.refresh()
    }

    /// Current roster.
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.inner.roster_entries.borrow().clone()
    }

    /// Be told whenever the roster changes. Drop the handle to stop.
    pub fn subscribe_roster(&self, callback: impl Fn(&Vec<RosterEntry>) + 'static) -> Subscription {
        self.inner.roster_bus.subscribe(callback)
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    /// Whether the text binding is still attached.
    pub fn is_bound(&self) -> bool {
        self.binding.as_ref().is_some_and(|b| b.is_bound())
    }

    /// Inspect the surface.
    pub fn with_surface<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.inner.state.borrow().surface)
    }

    /// Stop listening, destroy the binding and remove every overlay and
    /// style. Runs once; later calls do nothing.
    ///
    /// Called from inside a pass (e.g. by a surface callback), the overlays
    /// are removed as soon as that pass ends.
    pub fn unmount(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        subscription.cancel();

        if let Some(mut binding) = self.binding.take() {
            binding.destroy();
        }
        self.inner.unmount();
    }
}

impl<S: OverlaySurface> Drop for PresenceView<S> {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{LoroTextBinding, SharedText, DEFAULT_TEXT_NAME};
    use crate::room::{InMemoryHub, RoomOp};
    use crate::store::PresenceError;
    use crate::state::PresenceField;
    use crate::surface::{
        Decoration, DecorationHandle, DecorationKind, PointerHandle, RecordingSurface, StyleRule,
    };
    use serde_json::json;
    use std::cell::Cell;

    const ENDPOINT: &str = "mem://presence";
    const ROOM: &str = "room-code-sync";

    fn config(name: &str) -> PresenceConfig {
        let mut config = PresenceConfig::new(ENDPOINT, ROOM, name);
        config.color = Some("#ff0000".to_string());
        config
    }

    fn binding() -> Box<dyn TextBinding> {
        Box::new(LoroTextBinding::new(SharedText::new(DEFAULT_TEXT_NAME)))
    }

    type Hook = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

    /// Recording surface that runs a one-shot hook the next time a style is
    /// installed, i.e. in the middle of a reconcile pass.
    struct HookSurface {
        inner: RecordingSurface,
        on_style: Hook,
    }

    impl HookSurface {
        fn new(on_style: &Hook) -> Self {
            Self {
                inner: RecordingSurface::new(10),
                on_style: Rc::clone(on_style),
            }
        }
    }

    impl OverlaySurface for HookSurface {
        fn line_count(&self) -> u32 {
            self.inner.line_count()
        }

        fn replace_decorations(
            &mut self,
            old: &[DecorationHandle],
            new: &[Decoration],
        ) -> Vec<DecorationHandle> {
            self.inner.replace_decorations(old, new)
        }

        fn show_pointer(&mut self, session: SessionId, at: PointerPosition, style: &StyleRule) -> PointerHandle {
            self.inner.show_pointer(session, at, style)
        }

        fn move_pointer(&mut self, handle: &PointerHandle, at: PointerPosition) {
            self.inner.move_pointer(handle, at)
        }

        fn hide_pointer(&mut self, handle: &PointerHandle) {
            self.inner.hide_pointer(handle)
        }

        fn set_style(&mut self, rule: &StyleRule) {
            self.inner.set_style(rule);
            let hook = self.on_style.borrow_mut().take();
            if let Some(hook) = hook {
                hook();
            }
        }

        fn remove_style(&mut self, session: SessionId) {
            self.inner.remove_style(session)
        }
    }

    #[test]
    fn test_connect_publishes_identity() {
        let hub = InMemoryHub::new();
        let client = PresenceClient::connect(&hub, config("Ana")).unwrap();

        let snapshot = hub.room(ENDPOINT, ROOM).snapshot();
        let state = snapshot.get(client.session_id()).unwrap();
        assert_eq!(state.identity().unwrap(), Identity::new("Ana", "#ff0000"));
    }

    #[test]
    fn test_connect_generates_color() {
        let hub = InMemoryHub::new();
        let client = PresenceClient::connect(&hub, PresenceConfig::new(ENDPOINT, ROOM, "Ana")).unwrap();

        let color = &client.identity().unwrap().color;
        assert!(crate::state::is_hex_color(color));
    }

    #[test]
    fn test_connect_rejects_invalid_config() {
        let hub = InMemoryHub::new();
        let result = PresenceClient::connect(&hub, PresenceConfig::new(ENDPOINT, "", "Ana"));
        assert!(matches!(result, Err(PresenceError::Config(_))));
    }

    #[test]
    fn test_leave_clears_before_disconnect() {
        let hub = InMemoryHub::new();
        let mut client = PresenceClient::connect(&hub, config("Ana")).unwrap();
        let session = client.session_id();

        client.leave().unwrap();
        client.leave().unwrap();

        let ops = hub.room(ENDPOINT, ROOM).operations();
        let tail: Vec<_> = ops.iter().rev().take(2).rev().cloned().collect();
        assert_eq!(tail, vec![RoomOp::Clear { session }, RoomOp::Disconnect { session }]);
        assert!(!client.is_active());
    }

    #[test]
    fn test_drop_leaves() {
        let hub = InMemoryHub::new();
        let client = PresenceClient::connect(&hub, config("Ana")).unwrap();
        drop(client);

        assert!(hub.room(ENDPOINT, ROOM).snapshot().is_empty());
    }

    #[test]
    fn test_view_renders_remote_participant() {
        let hub = InMemoryHub::new();
        let local = PresenceClient::connect(&hub, config("Me")).unwrap();
        let mut remote = PresenceClient::connect(&hub, config("Ana")).unwrap();
        remote.caret_moved(Position::new(2, 3)).unwrap();

        let view = local.mount_view(RecordingSurface::new(10), binding(), RosterConfig::default());

        let carets = view.with_surface(|s| s.decorations_of(DecorationKind::Caret));
        assert_eq!(carets.len(), 1);
        assert_eq!(carets[0].session, remote.session_id());
        assert_eq!(view.roster().len(), 1);
    }

    #[test]
    fn test_view_follows_notices() {
        let hub = InMemoryHub::new();
        let local = PresenceClient::connect(&hub, config("Me")).unwrap();
        let view = local.mount_view(RecordingSurface::new(10), binding(), RosterConfig::default());
        hub.flush();

        let changes = Rc::new(Cell::new(0));
        let counter = Rc::clone(&changes);
        let _roster_sub = view.subscribe_roster(move |_| counter.set(counter.get() + 1));

        let mut remote = PresenceClient::connect(&hub, config("Ana")).unwrap();
        remote.caret_moved(Position::new(4, 1)).unwrap();
        hub.flush();

        assert_eq!(view.with_surface(|s| s.decorations().len()), 1);
        assert_eq!(changes.get(), 1);

        remote.leave().unwrap();
        hub.flush();

        assert!(view.with_surface(|s| s.is_clean()));
        assert!(view.roster().is_empty());
        assert_eq!(changes.get(), 2);
    }

    #[test]
    fn test_unmount_is_idempotent_and_independent() {
        let hub = InMemoryHub::new();
        let mut local = PresenceClient::connect(&hub, config("Me")).unwrap();
        let mut remote = PresenceClient::connect(&hub, config("Ana")).unwrap();
        remote.pointer_moved(PointerPosition::new(1.0, 2.0)).unwrap();
        let mut view = local.mount_view(RecordingSurface::new(10), binding(), RosterConfig::default());
        assert!(view.is_bound());

        view.unmount();
        view.unmount();

        assert!(!view.is_mounted());
        assert!(!view.is_bound());
        assert!(view.with_surface(|s| s.is_clean()));

        // Leaving afterwards still clears the entry exactly once.
        local.leave().unwrap();
        let session = local.session_id();
        let clears = hub
            .room(ENDPOINT, ROOM)
            .operations()
            .into_iter()
            .filter(|op| *op == RoomOp::Clear { session })
            .count();
        assert_eq!(clears, 1);
    }

    #[test]
    fn test_unmounted_view_ignores_notices() {
        let hub = InMemoryHub::new();
        let local = PresenceClient::connect(&hub, config("Me")).unwrap();
        let mut view = local.mount_view(RecordingSurface::new(10), binding(), RosterConfig::default());
        view.unmount();

        let mut remote = PresenceClient::connect(&hub, config("Ana")).unwrap();
        remote.caret_moved(Position::new(1, 1)).unwrap();
        hub.flush();

        assert!(view.with_surface(|s| s.is_clean()));
        assert!(view.refresh().is_none());
    }

    #[test]
    fn test_notice_during_pass_is_rendered_by_that_pass() {
        let hub = InMemoryHub::new();
        let local = PresenceClient::connect(&hub, config("Me")).unwrap();
        let mut ana = PresenceClient::connect(&hub, config("Ana")).unwrap();
        ana.caret_moved(Position::new(2, 3)).unwrap();

        // Installing Ana's style makes Bo appear and delivers the notice
        // while the mount pass is still running.
        let room = hub.room(ENDPOINT, ROOM);
        let bo = SessionId::from(0xb0);
        let hook: Hook = Rc::new(RefCell::new(None));
        *hook.borrow_mut() = Some(Box::new(move || {
            room.inject(bo, PresenceField::User, json!({ "name": "Bo", "color": "#00ff00" }));
            room.inject(bo, PresenceField::Cursor, json!({ "line": 5, "column": 1 }));
            room.flush();
        }));

        let view = local.mount_view(HookSurface::new(&hook), binding(), RosterConfig::default());
        hub.flush();

        assert!(hook.borrow().is_none());
        let carets = view.with_surface(|s| s.inner.decorations_of(DecorationKind::Caret));
        let sessions: Vec<SessionId> = carets.iter().map(|d| d.session).collect();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.contains(&ana.session_id()));
        assert!(sessions.contains(&bo));

        let names: Vec<String> = view.roster().into_iter().map(|e| e.display_name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Bo".to_string()));
    }

    #[test]
    fn test_unmount_during_pass_tears_down_at_its_end() {
        let hub = InMemoryHub::new();
        let local = PresenceClient::connect(&hub, config("Me")).unwrap();
        let hook: Hook = Rc::new(RefCell::new(None));
        let slot: Rc<RefCell<Option<PresenceView<HookSurface>>>> = Rc::new(RefCell::new(None));
        *slot.borrow_mut() = Some(local.mount_view(
            HookSurface::new(&hook),
            binding(),
            RosterConfig::default(),
        ));

        let target = Rc::clone(&slot);
        *hook.borrow_mut() = Some(Box::new(move || {
            if let Some(view) = target.borrow_mut().as_mut() {
                view.unmount();
            }
        }));

        let mut ana = PresenceClient::connect(&hub, config("Ana")).unwrap();
        ana.caret_moved(Position::new(4, 1)).unwrap();
        hub.flush();

        assert!(hook.borrow().is_none());
        let view = slot.borrow_mut().take().unwrap();
        assert!(!view.is_mounted());
        assert!(!view.is_bound());
        assert!(view.with_surface(|s| s.inner.is_clean()));
        assert!(view.roster().is_empty());
    }

    #[test]
    fn test_open_text_uses_configured_name() {
        let hub = InMemoryHub::new();
        let mut config = config("Me");
        config.text_name = "notes".to_string();
        let client = PresenceClient::connect(&hub, config).unwrap();

        let text = client.open_text().unwrap();

        assert_eq!(text.name(), "notes");
        assert_eq!(text.line_count(), 1);
    }
}
