//! SAX Event Dispatch
//!
//! Turns engine callbacks into calls on a host-supplied handler table.
//!
//! ## Architecture
//!
//! ```text
//! Engine ---> Dispatcher ---> Callbacks[kind](Context, Event)
//!                 |
//!                 +--> TextBuffer (coalesced CharacterData)
//!                 +--> content::translate (ElementDecl models)
//!                 +--> subparser::resolve (ExternalEntityRef)
//! ```
//!
//! ## Handler Keys
//!
//! The table is keyed by event name (`StartElement`, `CharacterData`, ...).
//! Unknown keys are rejected when a parser is created unless the table
//! carries `_nonstrict`.

pub mod buffer;
pub mod callbacks;
pub mod content;
pub mod dispatcher;
pub mod events;
pub(crate) mod subparser;

pub use callbacks::{Callbacks, Context, Entry, Handler, HandlerResult, NON_STRICT_KEY};
pub use content::{ContentModel, ContentNode};
pub use dispatcher::Dispatcher;
pub use events::{AttributeList, EntityRef, Event, EventKind};
