//! Engine Collaborator Contract
//!
//! A session never tokenizes XML itself. It drives an [`Engine`]: a streaming
//! tokenizer that is fed bytes and calls back into an [`EventHandler`] for
//! every token it recognizes, on the same call stack as the feed.
//!
//! ```text
//! Parser::feed ---> Engine::parse ---> EventHandler::start_element(scope, ..)
//!                                 ---> EventHandler::character_data(scope, ..)
//!                                 ...
//! ```
//!
//! While an engine is inside `parse`, callbacks only see it through the
//! narrower [`Scope`] trait (position queries, stop, content-model release,
//! child creation). Owning an engine handle is owning a `Box<dyn Engine>`;
//! releasing the handle is dropping the box.

use bitflags::bitflags;
use std::fmt;
use std::ops::Range;

/// Engine-native location of the current event.
///
/// `line` is 1-based; `column` and `byte_index` are 0-based, exactly as a
/// tokenizer reports them. Use [`Location`] for the 1-based host view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub line: u64,
    pub column: u64,
    pub byte_index: u64,
}

impl Position {
    /// Position of the first byte of a document
    pub const START: Position = Position {
        line: 1,
        column: 0,
        byte_index: 0,
    };
}

/// Host-facing location: line, column and byte offset, all 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: u64,
    pub column: u64,
    pub offset: u64,
}

impl From<Position> for Location {
    #[inline]
    fn from(pos: Position) -> Self {
        Location {
            line: pos.line,
            column: pos.column + 1,
            offset: pos.byte_index + 1,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}, offset {}", self.line, self.column, self.offset)
    }
}

/// Reasons an engine rejects a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Syntax,
    NoElements,
    InvalidToken,
    UnclosedToken,
    PartialChar,
    TagMismatch,
    DuplicateAttribute,
    JunkAfterDocElement,
    ParamEntityRef,
    UndefinedEntity,
    RecursiveEntityRef,
    AsyncEntity,
    BadCharRef,
    BinaryEntityRef,
    AttributeExternalEntityRef,
    MisplacedXmlPi,
    UnknownEncoding,
    IncorrectEncoding,
    UnclosedCdataSection,
    ExternalEntityHandling,
    NotStandalone,
    UnboundPrefix,
    UndeclaringPrefix,
    XmlDecl,
    TextDecl,
    Aborted,
    Finished,
    ReservedPrefixXml,
    ReservedPrefixXmlns,
    AmplificationLimitBreach,
}

impl ErrorCode {
    /// Human readable message for this code
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Syntax => "syntax error",
            ErrorCode::NoElements => "no element found",
            ErrorCode::InvalidToken => "not well-formed (invalid token)",
            ErrorCode::UnclosedToken => "unclosed token",
            ErrorCode::PartialChar => "partial character",
            ErrorCode::TagMismatch => "mismatched tag",
            ErrorCode::DuplicateAttribute => "duplicate attribute",
            ErrorCode::JunkAfterDocElement => "junk after document element",
            ErrorCode::ParamEntityRef => "illegal parameter entity reference",
            ErrorCode::UndefinedEntity => "undefined entity",
            ErrorCode::RecursiveEntityRef => "recursive entity reference",
            ErrorCode::AsyncEntity => "asynchronous entity",
            ErrorCode::BadCharRef => "reference to invalid character number",
            ErrorCode::BinaryEntityRef => "reference to binary entity",
            ErrorCode::AttributeExternalEntityRef => "reference to external entity in attribute",
            ErrorCode::MisplacedXmlPi => "XML or text declaration not at start of entity",
            ErrorCode::UnknownEncoding => "unknown encoding",
            ErrorCode::IncorrectEncoding => "encoding specified in XML declaration is incorrect",
            ErrorCode::UnclosedCdataSection => "unclosed CDATA section",
            ErrorCode::ExternalEntityHandling => "error in processing external entity reference",
            ErrorCode::NotStandalone => "document is not standalone",
            ErrorCode::UnboundPrefix => "unbound prefix",
            ErrorCode::UndeclaringPrefix => "must not undeclare prefix",
            ErrorCode::XmlDecl => "XML declaration not well-formed",
            ErrorCode::TextDecl => "text declaration not well-formed",
            ErrorCode::Aborted => "parsing aborted",
            ErrorCode::Finished => "parsing finished",
            ErrorCode::ReservedPrefixXml => {
                "reserved prefix (xml) must not be undeclared or bound to another namespace name"
            }
            ErrorCode::ReservedPrefixXmlns => "reserved prefix (xmlns) must not be declared or undeclared",
            ErrorCode::AmplificationLimitBreach => {
                "limit on input amplification factor (from DTD and entities) breached"
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

bitflags! {
    /// Engine callbacks a session wants to receive.
    ///
    /// An engine must not invoke a callback whose flag is not registered;
    /// what it does instead (report raw markup to the default callback,
    /// skip the construct) is engine behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventSet: u32 {
        const START_CDATA_SECTION = 1 << 0;
        const END_CDATA_SECTION = 1 << 1;
        const CHARACTER_DATA = 1 << 2;
        const COMMENT = 1 << 3;
        const DEFAULT = 1 << 4;
        const DEFAULT_EXPAND = 1 << 5;
        const START_ELEMENT = 1 << 6;
        const END_ELEMENT = 1 << 7;
        const EXTERNAL_ENTITY_REF = 1 << 8;
        const START_NAMESPACE_DECL = 1 << 9;
        const END_NAMESPACE_DECL = 1 << 10;
        const NOTATION_DECL = 1 << 11;
        const NOT_STANDALONE = 1 << 12;
        const PROCESSING_INSTRUCTION = 1 << 13;
        const UNPARSED_ENTITY_DECL = 1 << 14;
        const ENTITY_DECL = 1 << 15;
        const START_DOCTYPE_DECL = 1 << 16;
        const END_DOCTYPE_DECL = 1 << 17;
        const XML_DECL = 1 << 18;
        const ATTLIST_DECL = 1 << 19;
        const SKIPPED_ENTITY = 1 << 20;
        const ELEMENT_DECL = 1 << 21;
    }
}

/// Kind of a content-model particle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Empty,
    Any,
    Mixed,
    Name,
    Choice,
    Sequence,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Empty => "EMPTY",
            ContentKind::Any => "ANY",
            ContentKind::Mixed => "MIXED",
            ContentKind::Name => "NAME",
            ContentKind::Choice => "CHOICE",
            ContentKind::Sequence => "SEQUENCE",
        }
    }
}

/// Occurrence indicator of a content-model particle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantifier {
    None,
    Optional,
    ZeroOrMore,
    OneOrMore,
}

impl Quantifier {
    /// DTD suffix for this quantifier; `None` has no suffix
    pub fn symbol(self) -> Option<&'static str> {
        match self {
            Quantifier::None => None,
            Quantifier::Optional => Some("?"),
            Quantifier::ZeroOrMore => Some("*"),
            Quantifier::OneOrMore => Some("+"),
        }
    }
}

/// One particle of a [`NativeModel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelParticle {
    pub kind: ContentKind,
    pub quantifier: Quantifier,
    pub name: Option<String>,
    /// Indices of this particle's children; siblings are contiguous
    pub children: Range<usize>,
}

/// Engine-allocated content model of one `<!ELEMENT>` declaration.
///
/// Laid out flat: the root particle is at index 0 and every particle's
/// children occupy a contiguous index range. Ownership passes to the
/// callback receiving it, which must hand it back through
/// [`Scope::free_content_model`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct NativeModel {
    particles: Vec<ModelParticle>,
}

impl NativeModel {
    /// Build a model from its flat layout. `particles` must be non-empty.
    pub fn from_particles(particles: Vec<ModelParticle>) -> Self {
        debug_assert!(!particles.is_empty());
        NativeModel { particles }
    }

    /// The root particle
    #[inline]
    pub fn root(&self) -> &ModelParticle {
        &self.particles[0]
    }

    /// Children of a particle, in declaration order
    #[inline]
    pub fn children(&self, particle: &ModelParticle) -> &[ModelParticle] {
        &self.particles[particle.children.clone()]
    }

    /// Total number of particles, root included
    #[inline]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
}

/// Outcome of an external entity reference, as decided by the callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityResolution {
    /// The entity was handled
    Accept,
    /// The entity could not be handled; the document fails
    Reject,
    /// Nobody wanted the entity; it is skipped
    Decline,
}

/// One `<!ENTITY>` declaration as reported by an engine
#[derive(Debug, Clone, Copy)]
pub struct EntityDeclaration<'a> {
    pub name: &'a str,
    pub is_parameter_entity: bool,
    pub value: Option<&'a str>,
    pub base: Option<&'a str>,
    pub system_id: Option<&'a str>,
    pub public_id: Option<&'a str>,
    pub notation_name: Option<&'a str>,
}

/// One attribute definition of an `<!ATTLIST>` declaration
#[derive(Debug, Clone, Copy)]
pub struct AttlistDeclaration<'a> {
    pub element_name: &'a str,
    pub attribute_name: &'a str,
    pub attribute_type: &'a str,
    pub default: Option<&'a str>,
    pub is_required: bool,
}

/// External identifier of an entity or notation, with the base in effect
#[derive(Debug, Clone, Copy)]
pub struct ExternalId<'a> {
    pub base: Option<&'a str>,
    pub system_id: Option<&'a str>,
    pub public_id: Option<&'a str>,
}

/// What a running engine exposes to the callbacks it invokes.
pub trait Scope {
    /// Position of the current event (or of the failure, after one)
    fn position(&self) -> Position;

    /// Number of input bytes making up the current event; 0 outside events
    /// and for events produced from entity replacement text
    fn current_byte_count(&self) -> usize;

    /// Number of attributes of the current start tag that were written in
    /// the document, as opposed to supplied by a DTD default
    fn specified_attribute_count(&self) -> usize;

    /// Base URI used to resolve relative system identifiers
    fn base(&self) -> Option<&str>;

    /// Request the engine halt at the next safe point; returns whether the
    /// request was accepted
    fn stop(&mut self) -> bool;

    /// Release a content model handed out by `element_decl`
    fn free_content_model(&mut self, model: NativeModel);

    /// Create the engine for an external parsed entity, sharing this
    /// engine's declarations. `context` is the token passed to
    /// `external_entity_ref`.
    fn create_child(&mut self, context: &str) -> Option<Box<dyn Engine>>;
}

/// An owned streaming tokenizer.
pub trait Engine: Scope {
    /// Select which callbacks the engine invokes
    fn register(&mut self, events: EventSet);

    /// Feed the next chunk; `is_final` marks the end of input. Callbacks run
    /// before this returns.
    fn parse(&mut self, data: &[u8], is_final: bool, handler: &mut dyn EventHandler) -> Result<(), ErrorCode>;

    /// The failure reported by the last `parse`, if any
    fn error_code(&self) -> Option<ErrorCode>;

    /// Override the document's declared encoding
    fn set_encoding(&mut self, encoding: &str);

    /// Report namespace-qualified names as `uri sep local sep prefix`
    fn set_return_ns_triplet(&mut self, enabled: bool);

    /// Set the base URI; returns false if it could not be stored
    fn set_base(&mut self, base: &str) -> bool;

    /// Maximum tolerated ratio of expanded to direct input; returns false
    /// if the value is rejected
    fn set_max_amplification(&mut self, ratio: f32) -> bool;

    /// Input size from which the amplification limit is enforced; returns
    /// false if the value is rejected
    fn set_amplification_threshold(&mut self, bytes: u64) -> bool;
}

/// Callbacks an engine invokes while parsing.
///
/// Every method receives the running engine as `scope`. Defaults ignore the
/// event, accept standalone checks, decline external entities and release
/// content models.
#[allow(unused_variables)]
pub trait EventHandler {
    fn start_cdata_section(&mut self, scope: &mut dyn Scope) {}

    fn end_cdata_section(&mut self, scope: &mut dyn Scope) {}

    fn character_data(&mut self, scope: &mut dyn Scope, text: &str) {}

    fn comment(&mut self, scope: &mut dyn Scope, text: &str) {}

    /// Raw markup with no other registered callback; entities unexpanded
    fn default_text(&mut self, scope: &mut dyn Scope, text: &str) {}

    /// Raw markup with no other registered callback; entities expanded
    fn default_expand(&mut self, scope: &mut dyn Scope, text: &str) {}

    /// `attributes` lists the specified attributes first, in document
    /// order, followed by defaulted ones
    fn start_element(&mut self, scope: &mut dyn Scope, name: &str, attributes: &[(String, String)]) {}

    fn end_element(&mut self, scope: &mut dyn Scope, name: &str) {}

    fn external_entity_ref(
        &mut self,
        scope: &mut dyn Scope,
        context: &str,
        id: ExternalId<'_>,
    ) -> EntityResolution {
        EntityResolution::Decline
    }

    fn start_namespace_decl(&mut self, scope: &mut dyn Scope, prefix: Option<&str>, uri: Option<&str>) {}

    fn end_namespace_decl(&mut self, scope: &mut dyn Scope, prefix: Option<&str>) {}

    fn notation_decl(&mut self, scope: &mut dyn Scope, name: &str, id: ExternalId<'_>) {}

    /// Return false to fail the document as not standalone
    fn not_standalone(&mut self, scope: &mut dyn Scope) -> bool {
        true
    }

    fn processing_instruction(&mut self, scope: &mut dyn Scope, target: &str, data: &str) {}

    fn unparsed_entity_decl(&mut self, scope: &mut dyn Scope, name: &str, id: ExternalId<'_>, notation_name: &str) {}

    fn entity_decl(&mut self, scope: &mut dyn Scope, decl: &EntityDeclaration<'_>) {}

    fn start_doctype_decl(
        &mut self,
        scope: &mut dyn Scope,
        name: &str,
        system_id: Option<&str>,
        public_id: Option<&str>,
        has_internal_subset: bool,
    ) {
    }

    fn end_doctype_decl(&mut self, scope: &mut dyn Scope) {}

    fn xml_decl(&mut self, scope: &mut dyn Scope, version: Option<&str>, encoding: Option<&str>, standalone: Option<bool>) {}

    fn attlist_decl(&mut self, scope: &mut dyn Scope, decl: &AttlistDeclaration<'_>) {}

    fn skipped_entity(&mut self, scope: &mut dyn Scope, name: &str, is_parameter_entity: bool) {}

    fn element_decl(&mut self, scope: &mut dyn Scope, name: &str, model: NativeModel) {
        scope.free_content_model(model);
    }
}
