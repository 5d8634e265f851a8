//! Operator annotation shown alongside the price history
//!
//! Replaced wholesale on every command, never appended to.

use std::sync::{PoisonError, RwLock};

/// Text shown until an operator sets an annotation.
pub const PLACEHOLDER: &str = "Belum ada info treasury.";

/// Current annotation text, already rendered for HTML display.
#[derive(Debug)]
pub struct Annotation {
    text: RwLock<String>,
}

/// Preserve operator spacing and line breaks in the dashboard.
pub fn render_html(text: &str) -> String {
    text.replace("  ", "&nbsp;&nbsp;").replace('\n', "<br>")
}

impl Annotation {
    pub fn new() -> Self {
        Self {
            text: RwLock::new(PLACEHOLDER.to_string()),
        }
    }

    /// Replace the annotation. Blank text is refused and leaves the current
    /// value in place.
    pub fn replace(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        let rendered = render_html(text);
        *self.text.write().unwrap_or_else(PoisonError::into_inner) = rendered;
        true
    }

    pub fn current(&self) -> String {
        self.text
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for Annotation {
    fn default() -> Self {
        Self::new()
    }
}
