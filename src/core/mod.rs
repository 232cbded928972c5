//! Built-in XML engine
//!
//! The building blocks behind [`Tokenizer`], the engine a
//! [`Parser`](crate::Parser) drives by default:
//! - Scanner: memchr-accelerated delimiter search and name reading
//! - Entities: character and predefined entity references
//! - Encoding: input encoding detection and decoding to UTF-8
//! - Attributes: start-tag splitting and value normalization
//! - Namespace: prefix bindings per element scope
//! - DTD: internal subset declarations and the entity/attribute store
//! - Tokenizer: the streaming state machine implementing the engine traits

pub mod attributes;
pub mod dtd;
pub mod encoding;
pub mod entities;
pub mod namespace;
pub mod scanner;
pub mod tokenizer;

pub use tokenizer::{Features, Tokenizer, TokenizerOptions};
