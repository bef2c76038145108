//! Remote participant roster.
//!
//! The roster is the "who else is here" list shown next to the editor. It is
//! derived from the presence snapshot on every change: the local session and
//! entries without a usable identity are left out, configured names are
//! filtered, and participants that look identical are collapsed into one row.

use crate::state::{Identity, PresenceSnapshot};
use crate::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;
use tracing::trace;

/// What makes two roster rows the same participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupKey {
    /// Same display name and color.
    #[default]
    NameAndColor,
    /// Same display name.
    Name,
    /// Never collapse; one row per session.
    None,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown dedup key: {0} (expected name-and-color, name or none)")]
pub struct DedupKeyError(pub String);

impl FromStr for DedupKey {
    type Err = DedupKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "name-and-color" => Ok(DedupKey::NameAndColor),
            "name" => Ok(DedupKey::Name),
            "none" => Ok(DedupKey::None),
            other => Err(DedupKeyError(other.to_string())),
        }
    }
}

/// Roster filtering options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RosterConfig {
    /// Display names never listed.
    pub exclude_names: Vec<String>,
    pub dedup: DedupKey,
}

/// One row of the roster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub display_name: String,
    pub color_hex: String,
}

impl From<Identity> for RosterEntry {
    fn from(identity: Identity) -> Self {
        Self {
            display_name: identity.name,
            color_hex: identity.color,
        }
    }
}

#[derive(Hash, PartialEq, Eq)]
enum RowKey {
    NameAndColor(String, String),
    Name(String),
    Session(SessionId),
}

fn row_key(dedup: DedupKey, session: SessionId, entry: &RosterEntry) -> RowKey {
    match dedup {
        DedupKey::NameAndColor => RowKey::NameAndColor(entry.display_name.clone(), entry.color_hex.clone()),
        DedupKey::Name => RowKey::Name(entry.display_name.clone()),
        DedupKey::None => RowKey::Session(session),
    }
}

/// Compute the roster of `snapshot` as seen by `local`.
///
/// Rows keep snapshot iteration order; on a key collision the first session
/// encountered wins.
pub fn compute(snapshot: &PresenceSnapshot, local: SessionId, config: &RosterConfig) -> Vec<RosterEntry> {
    let mut seen = HashSet::new();
    let mut roster = Vec::new();

    for (session, state) in snapshot.remote(local) {
        let identity = match state.identity() {
            Ok(identity) => identity,
            Err(e) => {
                trace!("Leaving session {} out of roster: {}", session, e);
                continue;
            }
        };
        if config.exclude_names.iter().any(|name| *name == identity.name) {
            continue;
        }

        let entry = RosterEntry::from(identity);
        if seen.insert(row_key(config.dedup, session, &entry)) {
            roster.push(entry);
        }
    }

    roster
}

/// Last computed roster of a view.
#[derive(Debug)]
pub struct RosterView {
    local: SessionId,
    config: RosterConfig,
    entries: Vec<RosterEntry>,
}

impl RosterView {
    pub fn new(local: SessionId, config: RosterConfig) -> Self {
        Self {
            local,
            config,
            entries: Vec::new(),
        }
    }

    /// Recompute from `snapshot`. Returns true when the list changed.
    pub fn refresh(&mut self, snapshot: &PresenceSnapshot) -> bool {
        let next = compute(snapshot, self.local, &self.config);
        if next == self.entries {
            return false;
        }
        self.entries = next;
        true
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn config(&self) -> &RosterConfig {
        &self.config
    }
}
