//! End-to-end tests for presence-core.
//!
//! Drives several clients through one in-memory room: publishing, change
//! delivery, overlay reconciliation, roster updates and teardown.

use presence_core::room::{now_millis, RoomOp};
use presence_core::{
    DecorationKind, InMemoryHub, LoroTextBinding, PointerPosition, Position, PresenceClient,
    PresenceConfig, PresenceField, PresenceView, RecordingSurface, RosterConfig, SelectionRange,
    SessionId, SharedText,
};
use serde_json::json;

const ENDPOINT: &str = "mem://presence";
const ROOM: &str = "room-code-sync";

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("presence_core=trace")
        .try_init();
}

fn config(name: &str, color: &str) -> PresenceConfig {
    let mut config = PresenceConfig::new(ENDPOINT, ROOM, name);
    config.color = Some(color.to_string());
    config
}

/// The client's replica of the shared text, filled with ten lines.
fn document(client: &PresenceClient) -> SharedText {
    let text = client.open_text().unwrap();
    text.insert(0, &"line\n".repeat(9)).unwrap();
    assert_eq!(text.line_count(), 10);
    text
}

fn mount_over(client: &PresenceClient, text: &SharedText) -> PresenceView<RecordingSurface> {
    client.mount_view(
        RecordingSurface::over_text(text.clone()),
        Box::new(LoroTextBinding::new(text.clone())),
        client.config().roster.clone(),
    )
}

fn mount(client: &PresenceClient) -> PresenceView<RecordingSurface> {
    mount_over(client, &document(client))
}

fn caret_positions(view: &PresenceView<RecordingSurface>) -> Vec<(SessionId, Position)> {
    view.with_surface(|s| {
        s.decorations_of(DecorationKind::Caret)
            .into_iter()
            .map(|d| (d.session, d.start))
            .collect()
    })
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_identical_identities_share_a_roster_row() {
    init_tracing();
    let hub = InMemoryHub::new();
    let mut a = PresenceClient::connect(&hub, config("Ana", "#ff0000")).unwrap();
    let mut b = PresenceClient::connect(&hub, config("Ana", "#ff0000")).unwrap();
    let c = PresenceClient::connect(&hub, config("Cy", "#00ff00")).unwrap();
    let view = mount(&c);

    a.caret_moved(Position::new(3, 5)).unwrap();
    b.caret_moved(Position::new(7, 1)).unwrap();
    hub.flush();

    let names: Vec<String> = view.roster().into_iter().map(|e| e.display_name).collect();
    assert_eq!(names, vec!["Ana"]);

    let mut expected = vec![
        (a.session_id(), Position::new(3, 5)),
        (b.session_id(), Position::new(7, 1)),
    ];
    expected.sort();
    assert_eq!(caret_positions(&view), expected);
}

#[test]
fn test_selection_past_document_end_is_not_rendered() {
    init_tracing();
    let hub = InMemoryHub::new();
    let mut bo = PresenceClient::connect(&hub, config("Bo", "#0000ff")).unwrap();
    let local = PresenceClient::connect(&hub, config("Me", "#000000")).unwrap();
    let view = mount(&local);

    bo.caret_moved(Position::new(2, 1)).unwrap();
    bo.selection_changed(SelectionRange::new(Position::new(2, 1), Position::new(999, 1)))
        .unwrap();
    hub.flush();

    view.with_surface(|s| {
        assert!(s.decorations_of(DecorationKind::Selection).is_empty());
        assert_eq!(s.decorations_of(DecorationKind::Caret).len(), 1);
    });
}

#[test]
fn test_selection_appears_once_document_grows() {
    init_tracing();
    let hub = InMemoryHub::new();
    let mut bo = PresenceClient::connect(&hub, config("Bo", "#0000ff")).unwrap();
    let local = PresenceClient::connect(&hub, config("Me", "#000000")).unwrap();
    let text = document(&local);
    assert_eq!(text.name(), "monaco");
    let view = mount_over(&local, &text);

    bo.selection_changed(SelectionRange::new(Position::new(8, 1), Position::new(14, 2)))
        .unwrap();
    hub.flush();
    assert!(view.with_surface(|s| s.decorations_of(DecorationKind::Selection).is_empty()));

    text.insert(0, &"more\n".repeat(5)).unwrap();
    let report = view.refresh().unwrap();

    assert_eq!(report.selections.created, 1);
    let selections = view.with_surface(|s| s.decorations_of(DecorationKind::Selection));
    assert_eq!(selections[0].end, Position::new(14, 2));
}

#[test]
fn test_repeated_caret_reaches_store_once() {
    init_tracing();
    let hub = InMemoryHub::new();
    let mut ana = PresenceClient::connect(&hub, config("Ana", "#ff0000")).unwrap();

    assert!(ana.caret_moved(Position::new(2, 4)).unwrap());
    assert!(!ana.caret_moved(Position::new(2, 4)).unwrap());

    let room = hub.room(ENDPOINT, ROOM);
    let cursor_writes = room
        .operations()
        .into_iter()
        .filter(|op| {
            *op == RoomOp::SetField {
                session: ana.session_id(),
                field: PresenceField::Cursor,
            }
        })
        .count();
    assert_eq!(cursor_writes, 1);
}

#[test]
fn test_leaving_peer_disappears_on_next_pass() {
    init_tracing();
    let hub = InMemoryHub::new();
    let mut ana = PresenceClient::connect(&hub, config("Ana", "#ff0000")).unwrap();
    let local = PresenceClient::connect(&hub, config("Me", "#000000")).unwrap();
    let view = mount(&local);

    ana.caret_moved(Position::new(1, 1)).unwrap();
    ana.selection_changed(SelectionRange::new(Position::new(1, 1), Position::new(2, 2)))
        .unwrap();
    ana.pointer_moved(PointerPosition::new(12.0, 40.0)).unwrap();
    hub.flush();
    assert!(view.with_surface(|s| !s.is_clean()));

    let session = ana.session_id();
    ana.leave().unwrap();

    let ops = hub.room(ENDPOINT, ROOM).operations();
    let clear = ops.iter().position(|op| *op == RoomOp::Clear { session });
    let disconnect = ops.iter().position(|op| *op == RoomOp::Disconnect { session });
    assert!(clear.unwrap() < disconnect.unwrap());

    // Not gone until the notice is delivered.
    assert!(view.with_surface(|s| !s.is_clean()));
    hub.flush();
    assert!(view.with_surface(|s| s.is_clean()));
    assert!(view.roster().is_empty());
}

#[test]
fn test_color_change_restyles_without_recreating() {
    init_tracing();
    let hub = InMemoryHub::new();
    let mut ana = PresenceClient::connect(&hub, config("Ana", "#ff0000")).unwrap();
    let local = PresenceClient::connect(&hub, config("Me", "#000000")).unwrap();
    let view = mount(&local);
    ana.caret_moved(Position::new(5, 5)).unwrap();
    hub.flush();
    let before = view.with_surface(|s| s.stats());

    hub.room(ENDPOINT, ROOM).inject(
        ana.session_id(),
        PresenceField::User,
        json!({ "name": "Ana", "color": "#123456" }),
    );
    hub.flush();

    view.with_surface(|s| {
        let after = s.stats();
        assert_eq!(after.decorations_applied, before.decorations_applied);
        assert_eq!(after.styles_set, before.styles_set + 1);
        assert_eq!(s.style(ana.session_id()).unwrap().caret_color, "#123456");
    });
}

#[test]
fn test_malformed_peer_state_is_skipped() {
    init_tracing();
    let hub = InMemoryHub::new();
    let local = PresenceClient::connect(&hub, config("Me", "#000000")).unwrap();
    let view = mount(&local);
    let room = hub.room(ENDPOINT, ROOM);
    let rogue = SessionId::from(0xbad);

    room.inject(rogue, PresenceField::User, json!({ "name": "Rogue", "color": "#abcdef" }));
    room.inject(rogue, PresenceField::Cursor, json!({ "line": "three", "column": 1 }));
    room.inject(rogue, PresenceField::Pointer, json!({ "x": 4.0, "y": 9.5 }));
    hub.flush();

    view.with_surface(|s| {
        assert!(s.decorations().is_empty());
        assert_eq!(s.pointers().len(), 1);
    });
    assert_eq!(view.roster().len(), 1);
}

#[test]
fn test_vanished_peer_is_expired() {
    init_tracing();
    let hub = InMemoryHub::new();
    let mut ana = PresenceClient::connect(&hub, config("Ana", "#ff0000")).unwrap();
    let local = PresenceClient::connect(&hub, config("Me", "#000000")).unwrap();
    let view = mount(&local);
    ana.caret_moved(Position::new(1, 1)).unwrap();
    hub.flush();

    // Connection lost without clearing the entry.
    ana.session().disconnect().unwrap();
    let room = hub.room(ENDPOINT, ROOM);
    assert!(room.expire_outdated(now_millis(), 30_000.0).is_empty());

    let expired = room.expire_outdated(now_millis() + 60_000.0, 30_000.0);
    assert_eq!(expired, vec![ana.session_id()]);
    hub.flush();

    assert!(view.with_surface(|s| s.is_clean()));
}

#[test]
fn test_teardown_paths_are_independent() {
    init_tracing();
    let hub = InMemoryHub::new();
    let mut ana = PresenceClient::connect(&hub, config("Ana", "#ff0000")).unwrap();
    let mut local = PresenceClient::connect(&hub, config("Me", "#000000")).unwrap();
    let mut view = mount(&local);
    ana.pointer_moved(PointerPosition::new(3.0, 3.0)).unwrap();
    hub.flush();

    // Leave first, then unmount: the view still removes everything it drew.
    local.leave().unwrap();
    view.unmount();
    view.unmount();

    assert!(view.with_surface(|s| s.is_clean()));
    assert!(!view.is_bound());
    assert!(hub.room(ENDPOINT, ROOM).entry(local.session_id()).is_none());
}

#[test]
fn test_excluded_names_stay_off_roster() {
    init_tracing();
    let hub = InMemoryHub::new();
    let _host = PresenceClient::connect(&hub, config("Host", "#ff0000")).unwrap();
    let _bo = PresenceClient::connect(&hub, config("Bo", "#00ff00")).unwrap();
    let mut local_config = config("Me", "#000000");
    local_config.roster = RosterConfig {
        exclude_names: vec!["Host".to_string()],
        ..RosterConfig::default()
    };
    let local = PresenceClient::connect(&hub, local_config).unwrap();

    let view = mount(&local);

    let names: Vec<String> = view.roster().into_iter().map(|e| e.display_name).collect();
    assert_eq!(names, vec!["Bo"]);
}
