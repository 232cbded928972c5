//! Parsing Session
//!
//! A [`Parser`] owns one engine handle and the dispatch state around it.
//!
//! ```text
//!            feed                feed(final) / close
//!   PRE ──────────► ACTIVE ─────────────────────────► FINISHED
//!                   │   ▲  ▲
//!        text       │   │  │ next feed
//!                   ▼   │  │
//!          STRING_PENDING   ERROR_LATCHED
//! ```
//!
//! Configuration setters are only legal in PRE. Each feed is one dispatch
//! cycle; handlers run on the caller's stack before `feed` returns. A
//! session is driven through `&mut self`, so two feeds can never overlap;
//! handlers receive a [`Context`](crate::sax::Context), never the session.

use crate::core::{Tokenizer, TokenizerOptions};
use crate::engine::{Engine, Location};
use crate::error::{Error, ParseError, Result};
use crate::sax::{Callbacks, Dispatcher};
use std::rc::Rc;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, nothing fed yet
    Pre,
    /// Inside a feed cycle
    Active,
    /// Coalescing character data
    StringPending,
    /// A handler failed during the current (or last) feed cycle
    ErrorLatched,
    /// End of input was signaled
    Finished,
}

/// Configures and creates a [`Parser`]
pub struct ParserBuilder {
    callbacks: Rc<Callbacks>,
    options: TokenizerOptions,
    buffer_text: bool,
}

impl ParserBuilder {
    /// Enable namespace processing; qualified names are reported as
    /// `uri{separator}local`
    pub fn namespace_separator(mut self, separator: char) -> Self {
        self.options.separator = Some(separator);
        self
    }

    /// Settings for the built-in tokenizer; replaces any separator set
    /// before
    pub fn tokenizer_options(mut self, options: TokenizerOptions) -> Self {
        self.options = options;
        self
    }

    /// Coalesce consecutive character data before dispatch (on by default)
    pub fn buffer_text(mut self, enabled: bool) -> Self {
        self.buffer_text = enabled;
        self
    }

    /// Create a session over the built-in [`Tokenizer`]
    pub fn build(self) -> Result<Parser> {
        let engine = Tokenizer::with_options(self.options.clone());
        self.build_with(Box::new(engine))
    }

    /// Create a session over any engine. The namespace separator is the
    /// engine's own business here.
    pub fn build_with(self, engine: Box<dyn Engine>) -> Result<Parser> {
        self.callbacks.validate()?;
        log::debug!("new parser ({:?}, buffering {})", self.callbacks, self.buffer_text);
        Ok(Parser::from_engine(engine, self.callbacks, self.buffer_text))
    }
}

/// One parsing session
pub struct Parser {
    /// `None` once closed
    engine: Option<Box<dyn Engine>>,
    dispatch: Dispatcher,
}

impl Parser {
    /// Session with default settings over the built-in tokenizer
    pub fn new(callbacks: impl Into<Rc<Callbacks>>) -> Result<Parser> {
        Parser::builder(callbacks).build()
    }

    pub fn builder(callbacks: impl Into<Rc<Callbacks>>) -> ParserBuilder {
        ParserBuilder {
            callbacks: callbacks.into(),
            options: TokenizerOptions::default(),
            buffer_text: true,
        }
    }

    /// Wrap an engine without validating the table; used for sub-parsers,
    /// whose table was validated with the root session.
    pub(crate) fn from_engine(mut engine: Box<dyn Engine>, callbacks: Rc<Callbacks>, buffering: bool) -> Parser {
        engine.register(callbacks.registrations());
        Parser {
            engine: Some(engine),
            dispatch: Dispatcher::new(callbacks, buffering),
        }
    }

    fn engine(&self) -> Result<&dyn Engine> {
        self.engine.as_deref().ok_or(Error::Closed)
    }

    fn engine_mut(&mut self) -> Result<&mut (dyn Engine + 'static)> {
        self.engine.as_deref_mut().ok_or(Error::Closed)
    }

    fn engine_in_pre(&mut self) -> Result<&mut (dyn Engine + 'static)> {
        if self.dispatch.state() != State::Pre {
            return Err(Error::InvalidState);
        }
        self.engine_mut()
    }

    #[inline]
    pub fn state(&self) -> State {
        self.dispatch.state()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.engine.is_none()
    }

    /// Feed the next chunk of the document; `is_final` marks end of input.
    ///
    /// A handler failure is returned as it was raised and takes precedence
    /// over anything the engine reported in the same call.
    pub fn feed(&mut self, data: &[u8], is_final: bool) -> Result<()> {
        let engine = self.engine.as_deref_mut().ok_or(Error::Closed)?;
        if self.dispatch.state() == State::Finished {
            return if is_final && data.is_empty() {
                Ok(())
            } else {
                Err(Error::DocumentFinished)
            };
        }

        self.dispatch.begin_cycle();
        let status = engine.parse(data, is_final, &mut self.dispatch);
        self.dispatch.end_cycle(engine)?;
        if is_final {
            self.dispatch.finish();
        }
        status.map_err(|code| Error::Parse(ParseError::at(code, engine.position())))
    }

    /// Feed a non-final chunk
    #[inline]
    pub fn parse(&mut self, data: &[u8]) -> Result<()> {
        self.feed(data, false)
    }

    /// Signal end of input
    #[inline]
    pub fn finish(&mut self) -> Result<()> {
        self.feed(&[], true)
    }

    /// Finish the document if needed, then release the engine.
    ///
    /// Resources are released on every path. A parse failure raised while
    /// finishing is reported as [`Error::Close`]. Closing a closed session
    /// does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.engine.is_none() {
            return Ok(());
        }
        let status = if self.state() != State::Finished {
            self.finish()
        } else {
            Ok(())
        };
        self.release();
        log::debug!("parser closed");
        match status {
            Err(Error::Parse(err)) => Err(Error::Close(err)),
            other => other,
        }
    }

    /// Drop the engine without finishing the document
    pub(crate) fn release(&mut self) {
        self.engine = None;
    }

    /// Ask the engine to halt; returns whether it accepted
    pub fn stop(&mut self) -> Result<bool> {
        Ok(self.engine_mut()?.stop())
    }

    /// Current location, 1-based
    pub fn pos(&self) -> Result<Location> {
        Ok(self.engine()?.position().into())
    }

    /// Input bytes making up the current event
    pub fn current_byte_count(&self) -> Result<usize> {
        Ok(self.engine()?.current_byte_count())
    }

    /// Override the document's declared encoding
    pub fn set_encoding(&mut self, encoding: &str) -> Result<&mut Self> {
        self.engine_in_pre()?.set_encoding(encoding);
        Ok(self)
    }

    /// Report prefixed names as `uri sep local sep prefix`
    pub fn set_return_ns_triplet(&mut self, enabled: bool) -> Result<&mut Self> {
        self.engine_in_pre()?.set_return_ns_triplet(enabled);
        Ok(self)
    }

    pub fn set_base(&mut self, base: &str) -> Result<&mut Self> {
        if !self.engine_in_pre()?.set_base(base) {
            return Err(Error::Rejected("no memory to store base"));
        }
        Ok(self)
    }

    pub fn base(&self) -> Result<Option<&str>> {
        Ok(self.engine()?.base())
    }

    /// The handler table, shared with every sub-parser of this session
    pub fn callbacks(&self) -> Result<&Rc<Callbacks>> {
        self.engine()?;
        Ok(self.dispatch.callbacks())
    }

    /// Maximum ratio of expanded to direct input before the document fails
    pub fn set_max_amplification(&mut self, ratio: f32) -> Result<&mut Self> {
        if !self.engine_mut()?.set_max_amplification(ratio) {
            return Err(Error::Rejected("failed to set BLA maximum amplification"));
        }
        Ok(self)
    }

    /// Input size from which the amplification limit applies
    pub fn set_amplification_threshold(&mut self, bytes: u64) -> Result<&mut Self> {
        if !self.engine_mut()?.set_amplification_threshold(bytes) {
            return Err(Error::Rejected("failed to set BLA activation threshold"));
        }
        Ok(self)
    }
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .field("buffering", &self.dispatch.buffering())
            .finish()
    }
}
