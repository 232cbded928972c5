//! Character-Data Coalescing
//!
//! Consecutive CharacterData fragments are collected here and delivered as
//! one string when something else happens.

use super::callbacks::NotifyFn;
use std::rc::Rc;

/// Accumulates text for the CharacterData handler it was opened for.
#[derive(Default)]
pub struct TextBuffer {
    handler: Option<Rc<NotifyFn>>,
    text: String,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run destined for `handler`
    pub fn begin(&mut self, handler: Rc<NotifyFn>) {
        self.handler = Some(handler);
        self.text.clear();
    }

    #[inline]
    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    /// Whether a run is open
    #[inline]
    pub fn is_open(&self) -> bool {
        self.handler.is_some()
    }

    /// Close the run, returning its handler and coalesced text
    pub fn take(&mut self) -> Option<(Rc<NotifyFn>, String)> {
        let handler = self.handler.take()?;
        Some((handler, std::mem::take(&mut self.text)))
    }
}
