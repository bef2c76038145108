//! Conversions between the JS bridge payloads and presence-core types.
//!
//! Kept free of `wasm-bindgen` so it builds and tests on native targets.

use presence_core::{ChangeOrigin, ParticipantState, PresenceChange, PresenceSnapshot, SessionId};
use serde::Deserialize;
use std::cell::Cell;
use tracing::{debug, warn};

/// One entry of the array returned by the host's `getStates` callback.
///
/// ```json
/// { "session": "00000000000004d2", "state": { "user": { ... }, "cursor": { ... } } }
/// ```
#[derive(Debug, Deserialize)]
pub struct JsStateEntry {
    pub session: String,
    #[serde(default)]
    pub state: serde_json::Value,
}

/// Build a snapshot, keeping the host's order. Entries with an unparsable
/// session id are dropped.
pub fn snapshot_from_entries(entries: Vec<JsStateEntry>) -> PresenceSnapshot {
    entries
        .into_iter()
        .filter_map(|entry| match entry.session.parse::<SessionId>() {
            Ok(session) => Some((session, ParticipantState::from_value(entry.state))),
            Err(e) => {
                warn!("Ignoring presence entry with bad session id {:?}: {}", entry.session, e);
                None
            }
        })
        .collect()
}

pub fn parse_sessions(ids: &[String]) -> Vec<SessionId> {
    ids.iter()
        .filter_map(|id| match id.parse::<SessionId>() {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Ignoring bad session id {:?} in change notice: {}", id, e);
                None
            }
        })
        .collect()
}

/// Build a change notice. It counts as local when it only mentions `local`.
pub fn change_from_ids(
    local: SessionId,
    added: &[String],
    updated: &[String],
    removed: &[String],
) -> PresenceChange {
    let added = parse_sessions(added);
    let updated = parse_sessions(updated);
    let removed = parse_sessions(removed);

    let mut mentioned = added.iter().chain(&updated).chain(&removed).peekable();
    let origin = if mentioned.peek().is_some() && mentioned.all(|s| *s == local) {
        ChangeOrigin::Local
    } else {
        ChangeOrigin::Remote
    };

    PresenceChange {
        added,
        updated,
        removed,
        origin,
    }
}

/// Line count to validate selections against, given what the host's
/// `lineCount` callback returned (`None` when it threw or returned a
/// non-number).
///
/// A bad report falls back to the last good count, so one failing call does
/// not tear down every selection. Before any good count there is nothing to
/// validate against and no selection is rejected.
pub fn resolve_line_count(reported: Option<f64>, last_good: &Cell<Option<u32>>) -> u32 {
    match reported.filter(|n| n.is_finite() && *n >= 1.0) {
        Some(n) => {
            let count = n as u32;
            last_good.set(Some(count));
            count
        }
        None => {
            let fallback = last_good.get().unwrap_or(u32::MAX);
            debug!("Unusable line count {:?}; using {}", reported, fallback);
            fallback
        }
    }
}
