//! Participant presence state as it travels through the shared store.
//!
//! Every session owns one JSON object in the store:
//!
//! ```json
//! {
//!   "user":      { "name": "Ana", "color": "#ff0000" },
//!   "cursor":    { "line": 3, "column": 5 },
//!   "selection": { "start": { "line": 1, "column": 1 }, "end": { "line": 2, "column": 4 } },
//!   "pointer":   { "x": 120.5, "y": 48.0 }
//! }
//! ```
//!
//! Remote peers are not trusted to send well-formed values, so the object is
//! kept raw and each field is parsed on read. A bad field only affects the
//! accessor for that field.

use crate::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a presence field could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("Field missing: {0}")]
    Missing(&'static str),

    #[error("Field is not numeric: {0}")]
    NotNumeric(&'static str),

    #[error("Field out of range: {0}")]
    OutOfRange(&'static str),

    #[error("Field has the wrong shape: {0}")]
    Malformed(&'static str),
}

pub type FieldResult<T> = std::result::Result<T, FieldError>;

/// Top-level keys of a participant entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceField {
    User,
    Cursor,
    Selection,
    Pointer,
}

impl PresenceField {
    pub fn key(&self) -> &'static str {
        match self {
            PresenceField::User => "user",
            PresenceField::Cursor => "cursor",
            PresenceField::Selection => "selection",
            PresenceField::Pointer => "pointer",
        }
    }
}

/// Display identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub color: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    /// Identity with a freshly generated `#rrggbb` color.
    pub fn with_random_color(name: impl Into<String>) -> Self {
        Self::new(name, random_color())
    }
}

/// A random `#rrggbb` color, always six digits.
pub fn random_color() -> String {
    use rand::Rng;
    let value: u32 = rand::rng().random_range(0..=0xff_ffff);
    format!("#{:06x}", value)
}

/// Check for the `#rrggbb` form.
pub fn is_hex_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// One-based line/column position in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A selection span. `start` may come after `end` (backwards selection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: Position,
    pub end: Position,
}

impl SelectionRange {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Same span with `start <= end`.
    pub fn normalized(&self) -> Self {
        if self.end < self.start {
            Self {
                start: self.end,
                end: self.start,
            }
        } else {
            *self
        }
    }

    /// Largest line number referenced by either endpoint.
    pub fn max_line(&self) -> u32 {
        self.start.line.max(self.end.line)
    }
}

/// Pointer position in view-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerPosition {
    pub x: f64,
    pub y: f64,
}

impl PointerPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Raw presence entry of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantState {
    fields: Map<String, Value>,
}

impl ParticipantState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an arbitrary JSON value. Non-object values yield an empty entry.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Merge one field, leaving the others untouched.
    pub fn set(&mut self, field: PresenceField, value: Value) {
        self.fields.insert(field.key().to_string(), value);
    }

    pub fn raw(&self, field: PresenceField) -> Option<&Value> {
        self.fields.get(field.key())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn identity(&self) -> FieldResult<Identity> {
        let user = self.raw(PresenceField::User).ok_or(FieldError::Missing("user"))?;
        let user = user.as_object().ok_or(FieldError::Malformed("user"))?;
        let name = user
            .get("name")
            .ok_or(FieldError::Missing("user.name"))?
            .as_str()
            .ok_or(FieldError::Malformed("user.name"))?;
        let color = user
            .get("color")
            .ok_or(FieldError::Missing("user.color"))?
            .as_str()
            .ok_or(FieldError::Malformed("user.color"))?;
        Ok(Identity::new(name, color))
    }

    pub fn caret(&self) -> FieldResult<Position> {
        let value = self.raw(PresenceField::Cursor).ok_or(FieldError::Missing("cursor"))?;
        parse_position(value, "cursor.line", "cursor.column")
    }

    pub fn selection(&self) -> FieldResult<SelectionRange> {
        let value = self
            .raw(PresenceField::Selection)
            .ok_or(FieldError::Missing("selection"))?;
        let span = value.as_object().ok_or(FieldError::Malformed("selection"))?;
        let start = span.get("start").ok_or(FieldError::Missing("selection.start"))?;
        let end = span.get("end").ok_or(FieldError::Missing("selection.end"))?;
        Ok(SelectionRange {
            start: parse_position(start, "selection.start.line", "selection.start.column")?,
            end: parse_position(end, "selection.end.line", "selection.end.column")?,
        })
    }

    pub fn pointer(&self) -> FieldResult<PointerPosition> {
        let value = self.raw(PresenceField::Pointer).ok_or(FieldError::Missing("pointer"))?;
        let point = value.as_object().ok_or(FieldError::Malformed("pointer"))?;
        Ok(PointerPosition {
            x: parse_coordinate(point.get("x"), "pointer.x")?,
            y: parse_coordinate(point.get("y"), "pointer.y")?,
        })
    }
}

fn parse_position(
    value: &Value,
    line_name: &'static str,
    column_name: &'static str,
) -> FieldResult<Position> {
    let object = value.as_object().ok_or(FieldError::Malformed(line_name))?;
    Ok(Position {
        line: parse_one_based(object.get("line"), line_name)?,
        column: parse_one_based(object.get("column"), column_name)?,
    })
}

fn parse_one_based(value: Option<&Value>, name: &'static str) -> FieldResult<u32> {
    let value = value.ok_or(FieldError::Missing(name))?;
    if !value.is_number() {
        return Err(FieldError::NotNumeric(name));
    }
    let n = value.as_u64().ok_or(FieldError::OutOfRange(name))?;
    if n == 0 || n > u32::MAX as u64 {
        return Err(FieldError::OutOfRange(name));
    }
    Ok(n as u32)
}

fn parse_coordinate(value: Option<&Value>, name: &'static str) -> FieldResult<f64> {
    let value = value.ok_or(FieldError::Missing(name))?;
    let n = value.as_f64().ok_or(FieldError::NotNumeric(name))?;
    if !n.is_finite() || n < 0.0 {
        return Err(FieldError::OutOfRange(name));
    }
    Ok(n)
}

/// Point-in-time copy of every entry in the store, in store iteration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceSnapshot {
    entries: Vec<(SessionId, ParticipantState)>,
}

impl PresenceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. A repeated session replaces its earlier entry in place.
    pub fn insert(&mut self, session: SessionId, state: ParticipantState) {
        match self.entries.iter().position(|(id, _)| *id == session) {
            Some(index) => self.entries[index].1 = state,
            None => self.entries.push((session, state)),
        }
    }

    pub fn get(&self, session: SessionId) -> Option<&ParticipantState> {
        self.entries
            .iter()
            .find(|(id, _)| *id == session)
            .map(|(_, state)| state)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &ParticipantState)> {
        self.entries.iter().map(|(id, state)| (*id, state))
    }

    /// Entries other than `local`.
    pub fn remote(&self, local: SessionId) -> impl Iterator<Item = (SessionId, &ParticipantState)> {
        self.iter().filter(move |(id, _)| *id != local)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(SessionId, ParticipantState)> for PresenceSnapshot {
    fn from_iter<I: IntoIterator<Item = (SessionId, ParticipantState)>>(iter: I) -> Self {
        let mut snapshot = Self::new();
        for (session, state) in iter {
            snapshot.insert(session, state);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> ParticipantState {
        ParticipantState::from_value(value)
    }

    #[test]
    fn test_reads_complete_entry() {
        let s = state(json!({
            "user": { "name": "Ana", "color": "#ff0000" },
            "cursor": { "line": 3, "column": 5 },
            "selection": { "start": { "line": 1, "column": 1 }, "end": { "line": 2, "column": 4 } },
            "pointer": { "x": 10.5, "y": 0 }
        }));

        assert_eq!(s.identity().unwrap(), Identity::new("Ana", "#ff0000"));
        assert_eq!(s.caret().unwrap(), Position::new(3, 5));
        assert_eq!(
            s.selection().unwrap(),
            SelectionRange::new(Position::new(1, 1), Position::new(2, 4))
        );
        assert_eq!(s.pointer().unwrap(), PointerPosition::new(10.5, 0.0));
    }

    #[test]
    fn test_absent_fields_are_missing() {
        let s = state(json!({ "user": { "name": "Bo", "color": "#00ff00" } }));
        assert_eq!(s.caret(), Err(FieldError::Missing("cursor")));
        assert_eq!(s.selection(), Err(FieldError::Missing("selection")));
        assert_eq!(s.pointer(), Err(FieldError::Missing("pointer")));
    }

    #[test]
    fn test_non_numeric_line_is_rejected() {
        let s = state(json!({ "cursor": { "line": "3", "column": 5 } }));
        assert_eq!(s.caret(), Err(FieldError::NotNumeric("cursor.line")));
    }

    #[test]
    fn test_zero_and_fractional_positions_are_out_of_range() {
        let zero = state(json!({ "cursor": { "line": 0, "column": 5 } }));
        assert_eq!(zero.caret(), Err(FieldError::OutOfRange("cursor.line")));

        let fractional = state(json!({ "cursor": { "line": 2, "column": 1.5 } }));
        assert_eq!(fractional.caret(), Err(FieldError::OutOfRange("cursor.column")));
    }

    #[test]
    fn test_partial_selection_is_missing_endpoint() {
        let s = state(json!({ "selection": { "start": { "line": 1, "column": 1 } } }));
        assert_eq!(s.selection(), Err(FieldError::Missing("selection.end")));
    }

    #[test]
    fn test_negative_pointer_is_out_of_range() {
        let s = state(json!({ "pointer": { "x": -1, "y": 3 } }));
        assert_eq!(s.pointer(), Err(FieldError::OutOfRange("pointer.x")));

        let s = state(json!({ "pointer": { "x": 1, "y": null } }));
        assert_eq!(s.pointer(), Err(FieldError::NotNumeric("pointer.y")));
    }

    #[test]
    fn test_set_merges_single_field() {
        let mut s = state(json!({ "user": { "name": "Ana", "color": "#ff0000" } }));
        s.set(PresenceField::Cursor, json!({ "line": 2, "column": 4 }));

        assert!(s.identity().is_ok());
        assert_eq!(s.caret().unwrap(), Position::new(2, 4));
    }

    #[test]
    fn test_normalized_selection() {
        let backwards = SelectionRange::new(Position::new(5, 2), Position::new(1, 9));
        let normalized = backwards.normalized();
        assert_eq!(normalized.start, Position::new(1, 9));
        assert_eq!(normalized.end, Position::new(5, 2));
        assert_eq!(backwards.max_line(), 5);
    }

    #[test]
    fn test_random_color_is_six_digit_hex() {
        for _ in 0..100 {
            assert!(is_hex_color(&random_color()));
        }
        assert!(!is_hex_color("#fff"));
        assert!(!is_hex_color("ff0000"));
    }

    #[test]
    fn test_snapshot_keeps_insertion_order() {
        let snapshot: PresenceSnapshot = [
            (SessionId::from(3), ParticipantState::new()),
            (SessionId::from(1), ParticipantState::new()),
            (SessionId::from(2), ParticipantState::new()),
        ]
        .into_iter()
        .collect();

        let order: Vec<u64> = snapshot.iter().map(|(id, _)| id.as_u64()).collect();
        assert_eq!(order, vec![3, 1, 2]);

        let remote: Vec<u64> = snapshot
            .remote(SessionId::from(1))
            .map(|(id, _)| id.as_u64())
            .collect();
        assert_eq!(remote, vec![3, 2]);
    }
}
