//! Rendering surface abstraction for presence overlays.
//!
//! The editor widget owns the real text view. The engine only needs a
//! handful of its capabilities: the current line count, a decoration API
//! that swaps one set of styled range markers for another, free-floating
//! pointer glyphs, and a way to install a named style per session.
//!
//! Implementations:
//! - `RecordingSurface` - in-memory surface for tests and headless hosts
//! - `JsOverlaySurface` (in presence-wasm) - calls into the editor through JS callbacks

use crate::document::SharedText;
use crate::state::{Identity, PointerPosition, Position};
use crate::SessionId;
use serde::Serialize;
use std::collections::HashMap;

/// Opaque handle of an applied decoration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DecorationHandle(pub String);

/// Opaque handle of a rendered pointer glyph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PointerHandle(pub String);

/// What a decoration marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DecorationKind {
    Caret,
    Selection,
}

/// A styled range marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decoration {
    pub session: SessionId,
    pub kind: DecorationKind,
    pub start: Position,
    pub end: Position,
    /// CSS-style class the surface attaches to the range.
    pub class_name: String,
    /// Hover label, usually the participant's display name.
    pub label: String,
}

/// Named visual style for one session.
///
/// Decorations reference it through `class_name`, so a color change only
/// needs the rule re-applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleRule {
    pub session: SessionId,
    pub class_name: String,
    pub caret_color: String,
    pub selection_color: String,
    pub label: String,
}

impl StyleRule {
    /// Derive the style of a session's overlays from its identity.
    pub fn for_session(session: SessionId, identity: &Identity) -> Self {
        Self {
            session,
            class_name: Self::class_name_for(session),
            caret_color: identity.color.clone(),
            selection_color: translucent(&identity.color),
            label: identity.name.clone(),
        }
    }

    /// Class name of a session's rule. Depends only on the session id, so
    /// overlays keep pointing at the right rule when the color changes.
    pub fn class_name_for(session: SessionId) -> String {
        format!("presence-{}", session)
    }

    /// Class of a session's caret decorations.
    pub fn caret_class(session: SessionId) -> String {
        format!("{}-caret", Self::class_name_for(session))
    }

    /// Class of a session's selection decorations.
    pub fn selection_class(session: SessionId) -> String {
        format!("{}-selection", Self::class_name_for(session))
    }
}

/// `#rrggbb` → `#rrggbb33` so overlapping selections blend. Other color forms
/// pass through unchanged.
fn translucent(color: &str) -> String {
    if crate::state::is_hex_color(color) {
        format!("{}33", color)
    } else {
        color.to_string()
    }
}

/// Capabilities of the local editing view used by the overlay reconciler.
pub trait OverlaySurface {
    /// Number of lines in the document currently shown.
    fn line_count(&self) -> u32;

    /// Remove the `old` decorations and apply `new` ones in one step.
    /// Returns one handle per entry of `new`, in order.
    fn replace_decorations(
        &mut self,
        old: &[DecorationHandle],
        new: &[Decoration],
    ) -> Vec<DecorationHandle>;

    fn show_pointer(&mut self, session: SessionId, at: PointerPosition, style: &StyleRule) -> PointerHandle;

    fn move_pointer(&mut self, handle: &PointerHandle, at: PointerPosition);

    fn hide_pointer(&mut self, handle: &PointerHandle);

    /// Install or replace the style rule keyed by `rule.session`.
    fn set_style(&mut self, rule: &StyleRule);

    fn remove_style(&mut self, session: SessionId);
}

/// A pointer glyph as held by `RecordingSurface`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPointer {
    pub session: SessionId,
    pub at: PointerPosition,
    pub class_name: String,
}

/// Operation counters kept by `RecordingSurface`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceStats {
    pub decorations_applied: usize,
    pub decorations_removed: usize,
    pub pointers_shown: usize,
    pub pointers_moved: usize,
    pub pointers_hidden: usize,
    pub styles_set: usize,
    pub styles_removed: usize,
}

/// In-memory surface that records every live overlay.
///
/// Its line count is either fixed or read from a `SharedText`, so native
/// hosts validate selections against the document they actually show.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    line_count: u32,
    text: Option<SharedText>,
    next_handle: u64,
    decorations: HashMap<DecorationHandle, Decoration>,
    pointers: HashMap<PointerHandle, RecordedPointer>,
    styles: HashMap<SessionId, StyleRule>,
    stats: SurfaceStats,
}

impl RecordingSurface {
    pub fn new(line_count: u32) -> Self {
        Self {
            line_count,
            ..Self::default()
        }
    }

    /// Fix the line count. Has no effect on a surface over a text.
    pub fn set_line_count(&mut self, line_count: u32) {
        self.line_count = line_count;
    }

    /// A surface showing `text`.
    pub fn over_text(text: SharedText) -> Self {
        Self {
            text: Some(text),
            ..Self::default()
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_handle += 1;
        format!("{}{}", prefix, self.next_handle)
    }

    /// Live decorations, sorted by session then kind for stable assertions.
    pub fn decorations(&self) -> Vec<Decoration> {
        let mut all: Vec<Decoration> = self.decorations.values().cloned().collect();
        all.sort_by_key(|d| (d.session, d.kind == DecorationKind::Selection, d.start));
        all
    }

    pub fn decorations_of(&self, kind: DecorationKind) -> Vec<Decoration> {
        self.decorations()
            .into_iter()
            .filter(|d| d.kind == kind)
            .collect()
    }

    pub fn pointers(&self) -> Vec<RecordedPointer> {
        let mut all: Vec<RecordedPointer> = self.pointers.values().cloned().collect();
        all.sort_by_key(|p| p.session);
        all
    }

    pub fn style(&self, session: SessionId) -> Option<&StyleRule> {
        self.styles.get(&session)
    }

    pub fn style_count(&self) -> usize {
        self.styles.len()
    }

    pub fn stats(&self) -> SurfaceStats {
        self.stats
    }

    /// Nothing rendered and no style installed.
    pub fn is_clean(&self) -> bool {
        self.decorations.is_empty() && self.pointers.is_empty() && self.styles.is_empty()
    }
}

impl OverlaySurface for RecordingSurface {
    fn line_count(&self) -> u32 {
        match &self.text {
            Some(text) => text.line_count(),
            None => self.line_count,
        }
    }

    fn replace_decorations(
        &mut self,
        old: &[DecorationHandle],
        new: &[Decoration],
    ) -> Vec<DecorationHandle> {
        for handle in old {
            if self.decorations.remove(handle).is_some() {
                self.stats.decorations_removed += 1;
            }
        }
        new.iter()
            .map(|decoration| {
                let handle = DecorationHandle(self.next_id("d"));
                self.decorations.insert(handle.clone(), decoration.clone());
                self.stats.decorations_applied += 1;
                handle
            })
            .collect()
    }

    fn show_pointer(&mut self, session: SessionId, at: PointerPosition, style: &StyleRule) -> PointerHandle {
        let handle = PointerHandle(self.next_id("p"));
        self.pointers.insert(
            handle.clone(),
            RecordedPointer {
                session,
                at,
                class_name: style.class_name.clone(),
            },
        );
        self.stats.pointers_shown += 1;
        handle
    }

    fn move_pointer(&mut self, handle: &PointerHandle, at: PointerPosition) {
        if let Some(pointer) = self.pointers.get_mut(handle) {
            pointer.at = at;
            self.stats.pointers_moved += 1;
        }
    }

    fn hide_pointer(&mut self, handle: &PointerHandle) {
        if self.pointers.remove(handle).is_some() {
            self.stats.pointers_hidden += 1;
        }
    }

    fn set_style(&mut self, rule: &StyleRule) {
        self.styles.insert(rule.session, rule.clone());
        self.stats.styles_set += 1;
    }

    fn remove_style(&mut self, session: SessionId) {
        if self.styles.remove(&session).is_some() {
            self.stats.styles_removed += 1;
        }
    }
}
