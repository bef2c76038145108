//! Overlay reconciliation.
//!
//! `OverlayReconciler` turns a presence snapshot into remote carets,
//! selections and pointers on an `OverlaySurface`. Each pass computes the
//! overlays that should be visible and diffs them against what it rendered
//! last time, so an unchanged participant costs no surface calls at all.
//!
//! Categories are diffed independently: a malformed selection never hides a
//! valid caret of the same participant.

use crate::state::{FieldError, FieldResult, Identity, PointerPosition, Position, PresenceSnapshot, SelectionRange};
use crate::surface::{
    Decoration, DecorationHandle, DecorationKind, OverlaySurface, PointerHandle, StyleRule,
};
use crate::SessionId;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// The kinds of overlay a participant can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OverlayCategory {
    Caret,
    Selection,
    Pointer,
}

/// Surface operations issued for one category during a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCounts {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

impl CategoryCounts {
    pub fn is_zero(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.removed == 0
    }
}

/// Summary of one reconcile (or teardown) pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub carets: CategoryCounts,
    pub selections: CategoryCounts,
    pub pointers: CategoryCounts,
    pub styles_applied: usize,
    pub styles_removed: usize,
    /// Fields present in the snapshot but not renderable.
    pub skipped: usize,
}

impl ReconcileReport {
    /// True when the pass issued no surface operation.
    pub fn is_noop(&self) -> bool {
        self.carets.is_zero()
            && self.selections.is_zero()
            && self.pointers.is_zero()
            && self.styles_applied == 0
            && self.styles_removed == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CaretMark {
    at: Position,
    label: String,
}

#[derive(Debug, Clone, PartialEq)]
struct SelectionMark {
    range: SelectionRange,
    label: String,
}

#[derive(Debug)]
struct Rendered<V, H> {
    value: V,
    handle: H,
}

#[derive(Debug, Default)]
struct SessionOverlays {
    caret: Option<Rendered<CaretMark, DecorationHandle>>,
    selection: Option<Rendered<SelectionMark, DecorationHandle>>,
    pointer: Option<Rendered<PointerPosition, PointerHandle>>,
    style: Option<StyleRule>,
}

impl SessionOverlays {
    fn has_overlays(&self) -> bool {
        self.caret.is_some() || self.selection.is_some() || self.pointer.is_some()
    }
}

/// Everything the reconciler has materialized on the surface, per session.
#[derive(Debug, Default)]
struct RenderedOverlaySet {
    sessions: HashMap<SessionId, SessionOverlays>,
}

/// Validated overlays one remote session should have.
#[derive(Debug)]
struct Target {
    identity: Identity,
    caret: Option<Position>,
    selection: Option<SelectionRange>,
    pointer: Option<PointerPosition>,
}

impl Target {
    fn has_overlays(&self) -> bool {
        self.caret.is_some() || self.selection.is_some() || self.pointer.is_some()
    }
}

enum SlotChange<V, H> {
    Keep,
    Create(V),
    Update(H, V),
    Remove(H),
}

/// Decide what to do with one rendered slot given the wanted value.
///
/// On `Keep` the slot is left as it was; otherwise it is emptied and the
/// caller stores the outcome.
fn plan<V: PartialEq, H>(slot: &mut Option<Rendered<V, H>>, wanted: Option<V>) -> SlotChange<V, H> {
    match (slot.take(), wanted) {
        (None, None) => SlotChange::Keep,
        (Some(old), Some(value)) if old.value == value => {
            *slot = Some(old);
            SlotChange::Keep
        }
        (Some(old), Some(value)) => SlotChange::Update(old.handle, value),
        (Some(old), None) => SlotChange::Remove(old.handle),
        (None, Some(value)) => SlotChange::Create(value),
    }
}

/// Keeps the overlays of remote participants in step with the store.
#[derive(Debug)]
pub struct OverlayReconciler {
    local: SessionId,
    rendered: RenderedOverlaySet,
}

impl OverlayReconciler {
    /// Create a reconciler that never renders `local`'s own entry.
    pub fn new(local: SessionId) -> Self {
        Self {
            local,
            rendered: RenderedOverlaySet::default(),
        }
    }

    /// Bring the surface in line with `snapshot`.
    pub fn reconcile(
        &mut self,
        snapshot: &PresenceSnapshot,
        surface: &mut dyn OverlaySurface,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let targets = collect_targets(snapshot, self.local, surface.line_count(), &mut report.skipped);

        self.apply_styles(&targets, surface, &mut report);
        self.reconcile_carets(&targets, surface, &mut report.carets);
        self.reconcile_selections(&targets, surface, &mut report.selections);
        self.reconcile_pointers(&targets, surface, &mut report.pointers);
        self.drop_unused_styles(surface, &mut report);

        if !report.is_noop() {
            debug!(
                "Reconciled overlays: carets {:?}, selections {:?}, pointers {:?}, styles +{} -{}",
                report.carets,
                report.selections,
                report.pointers,
                report.styles_applied,
                report.styles_removed
            );
        }
        report
    }

    /// Remove every handle and style this reconciler created.
    pub fn teardown(&mut self, surface: &mut dyn OverlaySurface) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut decorations = Vec::new();

        for (session, overlays) in self.rendered.sessions.drain() {
            if let Some(caret) = overlays.caret {
                decorations.push(caret.handle);
                report.carets.removed += 1;
            }
            if let Some(selection) = overlays.selection {
                decorations.push(selection.handle);
                report.selections.removed += 1;
            }
            if let Some(pointer) = overlays.pointer {
                surface.hide_pointer(&pointer.handle);
                report.pointers.removed += 1;
            }
            if overlays.style.is_some() {
                surface.remove_style(session);
                report.styles_removed += 1;
            }
        }

        if !decorations.is_empty() {
            surface.replace_decorations(&decorations, &[]);
        }
        debug!("Tore down {} decorations", decorations.len());
        report
    }

    /// Sessions with at least one overlay on the surface, sorted.
    pub fn rendered_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self
            .rendered
            .sessions
            .iter()
            .filter(|(_, overlays)| overlays.has_overlays())
            .map(|(session, _)| *session)
            .collect();
        sessions.sort();
        sessions
    }

    pub fn is_rendered(&self, session: SessionId, category: OverlayCategory) -> bool {
        self.rendered
            .sessions
            .get(&session)
            .map(|overlays| match category {
                OverlayCategory::Caret => overlays.caret.is_some(),
                OverlayCategory::Selection => overlays.selection.is_some(),
                OverlayCategory::Pointer => overlays.pointer.is_some(),
            })
            .unwrap_or(false)
    }

    /// Whether nothing is rendered.
    pub fn is_empty(&self) -> bool {
        self.rendered.sessions.is_empty()
    }

    fn apply_styles(
        &mut self,
        targets: &HashMap<SessionId, Target>,
        surface: &mut dyn OverlaySurface,
        report: &mut ReconcileReport,
    ) {
        for (session, target) in targets {
            if !target.has_overlays() {
                continue;
            }
            let rule = StyleRule::for_session(*session, &target.identity);
            let overlays = self.rendered.sessions.entry(*session).or_default();
            if overlays.style.as_ref() != Some(&rule) {
                surface.set_style(&rule);
                overlays.style = Some(rule);
                report.styles_applied += 1;
            }
        }
    }

    fn drop_unused_styles(&mut self, surface: &mut dyn OverlaySurface, report: &mut ReconcileReport) {
        let idle: Vec<SessionId> = self
            .rendered
            .sessions
            .iter()
            .filter(|(_, overlays)| !overlays.has_overlays())
            .map(|(session, _)| *session)
            .collect();

        for session in idle {
            if let Some(overlays) = self.rendered.sessions.remove(&session) {
                if overlays.style.is_some() {
                    surface.remove_style(session);
                    report.styles_removed += 1;
                }
            }
        }
    }

    fn reconcile_carets(
        &mut self,
        targets: &HashMap<SessionId, Target>,
        surface: &mut dyn OverlaySurface,
        counts: &mut CategoryCounts,
    ) {
        for (session, overlays) in self.rendered.sessions.iter_mut() {
            let wanted = targets.get(session).and_then(|target| {
                target.caret.map(|at| CaretMark {
                    at,
                    label: target.identity.name.clone(),
                })
            });

            match plan(&mut overlays.caret, wanted) {
                SlotChange::Keep => {}
                SlotChange::Create(mark) => {
                    overlays.caret = apply_decoration(surface, &[], caret_decoration(*session, &mark))
                        .map(|handle| Rendered { value: mark, handle });
                    counts.created += 1;
                }
                SlotChange::Update(old, mark) => {
                    overlays.caret = apply_decoration(surface, &[old], caret_decoration(*session, &mark))
                        .map(|handle| Rendered { value: mark, handle });
                    counts.updated += 1;
                }
                SlotChange::Remove(old) => {
                    surface.replace_decorations(&[old], &[]);
                    counts.removed += 1;
                }
            }
        }
    }

    fn reconcile_selections(
        &mut self,
        targets: &HashMap<SessionId, Target>,
        surface: &mut dyn OverlaySurface,
        counts: &mut CategoryCounts,
    ) {
        for (session, overlays) in self.rendered.sessions.iter_mut() {
            let wanted = targets.get(session).and_then(|target| {
                target.selection.map(|range| SelectionMark {
                    range,
                    label: target.identity.name.clone(),
                })
            });

            match plan(&mut overlays.selection, wanted) {
                SlotChange::Keep => {}
                SlotChange::Create(mark) => {
                    overlays.selection =
                        apply_decoration(surface, &[], selection_decoration(*session, &mark))
                            .map(|handle| Rendered { value: mark, handle });
                    counts.created += 1;
                }
                SlotChange::Update(old, mark) => {
                    overlays.selection =
                        apply_decoration(surface, &[old], selection_decoration(*session, &mark))
                            .map(|handle| Rendered { value: mark, handle });
                    counts.updated += 1;
                }
                SlotChange::Remove(old) => {
                    surface.replace_decorations(&[old], &[]);
                    counts.removed += 1;
                }
            }
        }
    }

    fn reconcile_pointers(
        &mut self,
        targets: &HashMap<SessionId, Target>,
        surface: &mut dyn OverlaySurface,
        counts: &mut CategoryCounts,
    ) {
        for (session, overlays) in self.rendered.sessions.iter_mut() {
            let wanted = targets.get(session).and_then(|target| target.pointer);

            match plan(&mut overlays.pointer, wanted) {
                SlotChange::Keep => {}
                SlotChange::Create(at) => {
                    let Some(style) = overlays.style.as_ref() else {
                        continue;
                    };
                    let handle = surface.show_pointer(*session, at, style);
                    overlays.pointer = Some(Rendered { value: at, handle });
                    counts.created += 1;
                }
                SlotChange::Update(handle, at) => {
                    surface.move_pointer(&handle, at);
                    overlays.pointer = Some(Rendered { value: at, handle });
                    counts.updated += 1;
                }
                SlotChange::Remove(handle) => {
                    surface.hide_pointer(&handle);
                    counts.removed += 1;
                }
            }
        }
    }
}

/// Apply one decoration, replacing `old`. A surface that hands back no
/// handle leaves the slot empty so the next pass retries.
fn apply_decoration(
    surface: &mut dyn OverlaySurface,
    old: &[DecorationHandle],
    decoration: Decoration,
) -> Option<DecorationHandle> {
    let session = decoration.session;
    let handle = surface.replace_decorations(old, &[decoration]).into_iter().next();
    if handle.is_none() {
        warn!("Surface returned no decoration handle for session {}", session);
    }
    handle
}

fn caret_decoration(session: SessionId, mark: &CaretMark) -> Decoration {
    Decoration {
        session,
        kind: DecorationKind::Caret,
        start: mark.at,
        end: mark.at,
        class_name: StyleRule::caret_class(session),
        label: mark.label.clone(),
    }
}

fn selection_decoration(session: SessionId, mark: &SelectionMark) -> Decoration {
    let range = mark.range.normalized();
    Decoration {
        session,
        kind: DecorationKind::Selection,
        start: range.start,
        end: range.end,
        class_name: StyleRule::selection_class(session),
        label: mark.label.clone(),
    }
}

/// Keep a field if it parsed. Missing fields are normal; anything else is
/// counted and traced.
fn usable<T>(session: SessionId, result: FieldResult<T>, skipped: &mut usize) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(FieldError::Missing(_)) => None,
        Err(e) => {
            trace!("Skipping overlay of session {}: {}", session, e);
            *skipped += 1;
            None
        }
    }
}

fn collect_targets(
    snapshot: &PresenceSnapshot,
    local: SessionId,
    line_count: u32,
    skipped: &mut usize,
) -> HashMap<SessionId, Target> {
    let mut targets = HashMap::new();

    for (session, state) in snapshot.remote(local) {
        let identity = match state.identity() {
            Ok(identity) => identity,
            Err(e) => {
                trace!("Session {} has no usable identity: {}", session, e);
                if !state.is_empty() {
                    *skipped += 1;
                }
                continue;
            }
        };

        let caret = usable(session, state.caret(), skipped);
        let selection = usable(session, state.selection(), skipped).filter(|range| {
            let fits = range.max_line() <= line_count;
            if !fits {
                trace!(
                    "Skipping stale selection of session {}: line {} past end {}",
                    session,
                    range.max_line(),
                    line_count
                );
                *skipped += 1;
            }
            fits
        });
        let pointer = usable(session, state.pointer(), skipped);

        targets.insert(
            session,
            Target {
                identity,
                caret,
                selection,
                pointer,
            },
        );
    }

    targets
}
