//! JavaScript editor bridges for WASM.
//!
//! `JsOverlaySurface` implements `OverlaySurface` over callbacks that drive
//! the editor widget (decorations, pointer glyphs, injected style rules).
//! `JsTextBinding` implements `TextBinding` over the host's binding object.
//!
//! Surface callbacks cannot report errors to the reconciler, so a throwing
//! callback is logged and treated as "nothing rendered". A failing line
//! count falls back to the last one the host reported.

use crate::convert::resolve_line_count;
use presence_core::{
    Decoration, DecorationHandle, OverlaySurface, PointerHandle, PointerPosition, SessionId,
    StyleRule, TextBinding,
};
use serde::Serialize;
use std::cell::Cell;
use tracing::warn;
use wasm_bindgen::prelude::*;

/// JavaScript overlay surface.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const surface = new JsOverlaySurface(
///   () => editor.getModel()!.getLineCount(),
///   (oldIds, decorations) => editor.deltaDecorations(oldIds, decorations.map(toMonaco)),
///   (session, at, style) => pointers.show(session, at, style.className),
///   (handle, at) => pointers.move(handle, at),
///   (handle) => pointers.hide(handle),
///   (rule) => styles.set(rule.session, cssFor(rule)),
///   (session) => styles.remove(session),
/// );
/// ```
#[wasm_bindgen]
pub struct JsOverlaySurface {
    line_count_fn: js_sys::Function,
    replace_decorations_fn: js_sys::Function,
    show_pointer_fn: js_sys::Function,
    move_pointer_fn: js_sys::Function,
    hide_pointer_fn: js_sys::Function,
    set_style_fn: js_sys::Function,
    remove_style_fn: js_sys::Function,
    last_line_count: Cell<Option<u32>>,
}

#[wasm_bindgen]
impl JsOverlaySurface {
    #[wasm_bindgen(constructor)]
    pub fn new(
        line_count_fn: js_sys::Function,
        replace_decorations_fn: js_sys::Function,
        show_pointer_fn: js_sys::Function,
        move_pointer_fn: js_sys::Function,
        hide_pointer_fn: js_sys::Function,
        set_style_fn: js_sys::Function,
        remove_style_fn: js_sys::Function,
    ) -> Self {
        Self {
            line_count_fn,
            replace_decorations_fn,
            show_pointer_fn,
            move_pointer_fn,
            hide_pointer_fn,
            set_style_fn,
            remove_style_fn,
            last_line_count: Cell::new(None),
        }
    }
}

fn to_js<T: Serialize + ?Sized>(value: &T) -> JsValue {
    let serializer = serde_wasm_bindgen::Serializer::new().serialize_maps_as_objects(true);
    value.serialize(&serializer).unwrap_or(JsValue::NULL)
}

fn log_call_error(what: &str, result: Result<JsValue, JsValue>) -> Option<JsValue> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Surface callback {} threw: {:?}", what, e);
            None
        }
    }
}

impl OverlaySurface for JsOverlaySurface {
    fn line_count(&self) -> u32 {
        let reported = log_call_error("lineCount", self.line_count_fn.call0(&JsValue::NULL))
            .and_then(|v| v.as_f64());
        resolve_line_count(reported, &self.last_line_count)
    }

    fn replace_decorations(
        &mut self,
        old: &[DecorationHandle],
        new: &[Decoration],
    ) -> Vec<DecorationHandle> {
        let old_ids: Vec<&str> = old.iter().map(|h| h.0.as_str()).collect();
        let result = self.replace_decorations_fn.call2(&JsValue::NULL, &to_js(&old_ids), &to_js(new));

        log_call_error("replaceDecorations", result)
            .and_then(|v| serde_wasm_bindgen::from_value::<Vec<String>>(v).ok())
            .map(|ids| ids.into_iter().map(DecorationHandle).collect())
            .unwrap_or_default()
    }

    fn show_pointer(&mut self, session: SessionId, at: PointerPosition, style: &StyleRule) -> PointerHandle {
        let result = self.show_pointer_fn.call3(
            &JsValue::NULL,
            &session.to_string().into(),
            &to_js(&at),
            &to_js(style),
        );
        let id = log_call_error("showPointer", result)
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| session.to_string());
        PointerHandle(id)
    }

    fn move_pointer(&mut self, handle: &PointerHandle, at: PointerPosition) {
        let result = self
            .move_pointer_fn
            .call2(&JsValue::NULL, &handle.0.as_str().into(), &to_js(&at));
        log_call_error("movePointer", result);
    }

    fn hide_pointer(&mut self, handle: &PointerHandle) {
        let result = self.hide_pointer_fn.call1(&JsValue::NULL, &handle.0.as_str().into());
        log_call_error("hidePointer", result);
    }

    fn set_style(&mut self, rule: &StyleRule) {
        let result = self.set_style_fn.call1(&JsValue::NULL, &to_js(rule));
        log_call_error("setStyle", result);
    }

    fn remove_style(&mut self, session: SessionId) {
        let result = self
            .remove_style_fn
            .call1(&JsValue::NULL, &session.to_string().into());
        log_call_error("removeStyle", result);
    }
}

/// Host-side editor binding (e.g. a `MonacoBinding`).
///
/// Only its teardown is driven from Rust.
#[wasm_bindgen]
pub struct JsTextBinding {
    destroy_fn: Option<js_sys::Function>,
}

#[wasm_bindgen]
impl JsTextBinding {
    #[wasm_bindgen(constructor)]
    pub fn new(destroy_fn: js_sys::Function) -> Self {
        Self {
            destroy_fn: Some(destroy_fn),
        }
    }
}

impl TextBinding for JsTextBinding {
    fn destroy(&mut self) {
        if let Some(destroy_fn) = self.destroy_fn.take() {
            if let Err(e) = destroy_fn.call0(&JsValue::NULL) {
                warn!("Text binding destroy threw: {:?}", e);
            }
        }
    }

    fn is_bound(&self) -> bool {
        self.destroy_fn.is_some()
    }
}
