//! Session Errors
//!
//! Three disjoint classes reach the caller:
//! - parse failures reported by the engine, with a 1-based location
//! - handler failures, re-raised exactly as the handler produced them
//! - usage errors, signaled at the call site and never latched

use crate::engine::{ErrorCode, Location, Position};
use crate::sax::EventKind;
use std::fmt;
use thiserror::Error;

/// Failure value produced by a host handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

/// A document rejected by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub code: ErrorCode,
    /// 1-based line
    pub line: u64,
    /// 1-based column
    pub column: u64,
    /// 1-based byte offset
    pub offset: u64,
}

impl ParseError {
    /// Build from the engine's native position of the failure
    pub fn at(code: ErrorCode, pos: Position) -> Self {
        let loc = Location::from(pos);
        ParseError {
            code,
            line: loc.line,
            column: loc.column,
            offset: loc.offset,
        }
    }

    pub fn message(&self) -> &'static str {
        self.code.message()
    }

    pub fn location(&self) -> Location {
        Location {
            line: self.line,
            column: self.column,
            offset: self.offset,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.message(), self.location())
    }
}

impl std::error::Error for ParseError {}

/// Which of the three classes an [`Error`] belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Parse,
    Handler,
    Usage,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Parse(ParseError),

    #[error("error closing parser: {0}")]
    Close(ParseError),

    /// A handler failed; the value is the one the handler returned
    #[error("{0}")]
    Handler(HandlerError),

    #[error("invalid key `{0}' in callback table")]
    InvalidCallbackKey(String),

    #[error("`{0}' callback is not a function")]
    NotCallable(EventKind),

    #[error("invalid parser state")]
    InvalidState,

    #[error("cannot parse - document is finished")]
    DocumentFinished,

    #[error("parser is closed")]
    Closed,

    #[error("failed to create external entity parser")]
    ChildCreation,

    #[error("{0}")]
    Rejected(&'static str),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Parse(_) | Error::Close(_) => ErrorClass::Parse,
            Error::Handler(_) => ErrorClass::Handler,
            _ => ErrorClass::Usage,
        }
    }

    /// The engine failure behind a parse-class error
    pub fn parse_error(&self) -> Option<&ParseError> {
        match self {
            Error::Parse(e) | Error::Close(e) => Some(e),
            _ => None,
        }
    }

    /// Recover the value a handler failed with
    pub fn into_handler_error(self) -> Option<HandlerError> {
        match self {
            Error::Handler(e) => Some(e),
            _ => None,
        }
    }

    /// Turn a handler's failure into the error re-raised to the caller.
    ///
    /// A handler that propagated a session error with `?` (typically from a
    /// nested parse) gets that error back unchanged instead of a doubly
    /// wrapped one.
    pub(crate) fn from_handler(err: HandlerError) -> Self {
        match err.downcast::<Error>() {
            Ok(inner) => *inner,
            Err(other) => Error::Handler(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_location() {
        let err = ParseError::at(
            ErrorCode::UnclosedToken,
            Position {
                line: 1,
                column: 3,
                byte_index: 3,
            },
        );
        assert_eq!((err.line, err.column, err.offset), (1, 4, 4));
        assert_eq!(err.to_string(), "unclosed token at line 1, column 4, offset 4");
    }

    #[test]
    fn test_handler_error_is_not_rewrapped() {
        let inner: HandlerError = Box::new(Error::DocumentFinished);
        let err = Error::from_handler(inner);
        assert!(matches!(err, Error::DocumentFinished));

        let plain: HandlerError = "boom".into();
        let err = Error::from_handler(plain);
        assert_eq!(err.class(), ErrorClass::Handler);
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.into_handler_error().map(|e| e.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn test_usage_messages() {
        assert_eq!(Error::InvalidState.to_string(), "invalid parser state");
        assert_eq!(
            Error::InvalidCallbackKey("Bogus".into()).to_string(),
            "invalid key `Bogus' in callback table"
        );
        assert_eq!(Error::NotCallable(EventKind::Comment).to_string(), "`Comment' callback is not a function");
        assert_eq!(Error::Closed.class(), ErrorClass::Usage);
    }
}
