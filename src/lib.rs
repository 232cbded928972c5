//! RustySAX - Streaming XML event dispatch
//!
//! Layers:
//! - engine: the tokenizer contract (`Engine`, `Scope`, `EventHandler`)
//! - core: the built-in streaming `Tokenizer`
//! - sax: handler table, dispatcher, text coalescing, content models and
//!   external-entity sub-parsers
//! - parser: the `Parser` session and its state machine
//!
//! ```
//! use rustysax::{Callbacks, Event, EventKind, Parser};
//!
//! let table = Callbacks::new().on(EventKind::StartElement, |_, event| {
//!     if let Event::StartElement { name, .. } = event {
//!         println!("<{}>", name);
//!     }
//!     Ok(())
//! });
//! let mut parser = Parser::new(table).unwrap();
//! parser.feed(b"<doc><item/></doc>", true).unwrap();
//! parser.close().unwrap();
//! ```

pub mod core;
pub mod engine;
pub mod error;
pub mod parser;
pub mod sax;

#[cfg(test)]
mod test_support;

pub use crate::core::{Features, Tokenizer, TokenizerOptions};
pub use engine::{ErrorCode, Location};
pub use error::{Error, ErrorClass, HandlerError, ParseError, Result};
pub use parser::{Parser, ParserBuilder, State};
pub use sax::{AttributeList, Callbacks, ContentModel, ContentNode, Context, EntityRef, Entry, Event, EventKind, HandlerResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
