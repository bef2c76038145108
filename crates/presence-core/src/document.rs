//! SharedText: Loro document wrapper for the collaboratively edited text.
//!
//! The document holds a single `LoroText` container (named `monaco` unless
//! configured otherwise). Presence does not depend on its content, but the
//! view needs the text's line count to validate remote selections, and the
//! lifecycle owns the binding that joins the text to the editor. Syncing the
//! document between peers is the host's job.

use crate::SessionId;
use loro::{LoroDoc, LoroText};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

/// Container name used when none is configured.
pub const DEFAULT_TEXT_NAME: &str = "monaco";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Shared text document. Clones refer to the same document.
#[derive(Clone)]
pub struct SharedText {
    doc: Rc<LoroDoc>,
    name: String,
}

impl SharedText {
    /// Create an empty document with a text container called `name`.
    pub fn new(name: &str) -> Self {
        Self {
            doc: Rc::new(LoroDoc::new()),
            name: name.to_string(),
        }
    }

    /// Create an empty document whose edits are attributed to `session`.
    pub fn for_session(name: &str, session: SessionId) -> Result<Self> {
        let text = Self::new(name);
        text.doc
            .set_peer_id(session.as_u64())
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(text)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn text(&self) -> LoroText {
        self.doc.get_text(self.name.as_str())
    }

    pub fn content(&self) -> String {
        self.text().to_string()
    }

    /// Number of lines, counting an empty document as one line.
    pub fn line_count(&self) -> u32 {
        let newlines = self.content().matches('\n').count();
        u32::try_from(newlines + 1).unwrap_or(u32::MAX)
    }

    /// Insert `s` at unicode offset `pos` and commit.
    pub fn insert(&self, pos: usize, s: &str) -> Result<()> {
        self.text()
            .insert(pos, s)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.doc.commit();
        Ok(())
    }

    /// Delete `len` unicode characters starting at `pos` and commit.
    pub fn delete(&self, pos: usize, len: usize) -> Result<()> {
        self.text()
            .delete(pos, len)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.doc.commit();
        Ok(())
    }
}

impl fmt::Debug for SharedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedText")
            .field("name", &self.name)
            .field("peer", &self.doc.peer_id())
            .finish()
    }
}

/// Handle joining a shared text to an editor model.
///
/// The binding stays alive as long as the view is mounted and is destroyed
/// exactly once when the view unmounts.
pub trait TextBinding {
    /// Detach the editor from the shared text. Calling it again is a no-op.
    fn destroy(&mut self);

    fn is_bound(&self) -> bool;
}

/// Native binding that keeps a `SharedText` attached to the view.
pub struct LoroTextBinding {
    text: Option<SharedText>,
}

impl LoroTextBinding {
    pub fn new(text: SharedText) -> Self {
        debug!("Bound shared text {}", text.name());
        Self { text: Some(text) }
    }
}

impl TextBinding for LoroTextBinding {
    fn destroy(&mut self) {
        if let Some(text) = self.text.take() {
            debug!("Unbound shared text {}", text.name());
        }
    }

    fn is_bound(&self) -> bool {
        self.text.is_some()
    }
}
