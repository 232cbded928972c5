//! Streaming XML Tokenizer
//!
//! The built-in [`Engine`]. Each chunk of bytes is decoded and appended to
//! the unconsumed text, and every complete construct in it is reported to
//! the [`EventHandler`] before `parse` returns:
//! - XML declaration, DOCTYPE and internal subset declarations
//! - Element start/end tags, with DTD attribute defaults and namespaces
//! - Text, CDATA sections, comments, processing instructions
//! - Character, predefined, internal and external entity references
//!
//! A construct cut off by the end of a chunk stays buffered until a later
//! chunk completes it, and a text run is only reported once the markup
//! ending it is visible, so the events do not depend on how a document is
//! split into chunks.
//!
//! Internal entities are tokenized in place. Events produced from
//! replacement text report the position of the reference and a byte count
//! of zero.

use super::attributes::{collapse_spaces, push_normalized, scan_start_tag, split_qname};
use super::dtd::{self, AttributeDefault, Dtd, EntityDef};
use super::encoding::{detect, Decoder, Detection, Encoding};
use super::entities::{predefined, scan_reference, RefScan, Reference};
use super::namespace::NamespaceResolver;
use super::scanner::{
    find, find_tag_end, find_text_boundary, is_all_whitespace, is_name_start_char, is_partial, is_whitespace,
    normalize_newlines, whitespace_len, Scanner,
};
use crate::engine::{
    AttlistDeclaration, Engine, EntityDeclaration, EntityResolution, ErrorCode, EventHandler, EventSet, ExternalId,
    NativeModel, Position, Scope,
};
use memchr::{memchr, memchr2};
use std::cell::Cell;
use std::rc::Rc;

/// Default ceiling on expanded-to-direct input ratio
pub const DEFAULT_MAX_AMPLIFICATION: f32 = 100.0;

/// Default input size from which the amplification ceiling applies
pub const DEFAULT_AMPLIFICATION_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Build properties of the built-in engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Features {
    pub name: &'static str,
    pub version: &'static str,
    /// Namespace processing is available through a separator
    pub namespaces: bool,
    /// Internal subsets are parsed; parameter entities are not expanded
    pub dtd: bool,
    pub max_amplification: f32,
    pub amplification_threshold: u64,
    /// Deepest group nesting accepted in an element content model
    pub max_model_depth: usize,
}

/// Markup declarations of the internal subset
const DECLARATIONS: [(&str, Declaration); 4] = [
    ("<!ELEMENT", Declaration::Element),
    ("<!ATTLIST", Declaration::Attlist),
    ("<!ENTITY", Declaration::Entity),
    ("<!NOTATION", Declaration::Notation),
];

/// Construction-time settings of a [`Tokenizer`]
#[derive(Debug, Clone)]
pub struct TokenizerOptions {
    /// Turns on namespace processing; expanded names are
    /// `uri{separator}local`
    pub separator: Option<char>,
    /// Append `{separator}prefix` to prefixed names
    pub triplets: bool,
    /// Encoding that overrides the document's declaration
    pub encoding: Option<String>,
    pub base: Option<String>,
    pub max_amplification: f32,
    pub amplification_threshold: u64,
}

impl Default for TokenizerOptions {
    fn default() -> Self {
        TokenizerOptions {
            separator: None,
            triplets: false,
            encoding: None,
            base: None,
            max_amplification: DEFAULT_MAX_AMPLIFICATION,
            amplification_threshold: DEFAULT_AMPLIFICATION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Initialized,
    Parsing,
    Finished,
}

/// Where in the document the tokenizer is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prolog,
    /// Inside `<!DOCTYPE name [ ... ]`
    Subset,
    Content,
    /// After the root element closed
    Epilog,
}

#[derive(Debug, Clone, Copy)]
enum Declaration {
    Element,
    Attlist,
    Entity,
    Notation,
}

/// Input accounting for the amplification limit, shared with child engines
#[derive(Debug)]
struct Accounting {
    direct: Cell<u64>,
    indirect: Cell<u64>,
    max_ratio: Cell<f32>,
    threshold: Cell<u64>,
}

impl Accounting {
    fn new(max_ratio: f32, threshold: u64) -> Self {
        Accounting {
            direct: Cell::new(0),
            indirect: Cell::new(0),
            max_ratio: Cell::new(max_ratio),
            threshold: Cell::new(threshold),
        }
    }

    fn read(&self, bytes: usize) {
        self.direct.set(self.direct.get() + bytes as u64);
    }

    /// Account for `bytes` of replacement text
    fn expand(&self, bytes: usize) -> Result<(), ErrorCode> {
        let indirect = self.indirect.get() + bytes as u64;
        self.indirect.set(indirect);
        let direct = self.direct.get();
        let total = direct + indirect;
        if total < self.threshold.get() {
            return Ok(());
        }
        let ratio = total as f64 / direct.max(1) as f64;
        if ratio > f64::from(self.max_ratio.get()) {
            Err(ErrorCode::AmplificationLimitBreach)
        } else {
            Ok(())
        }
    }
}

/// Maps offsets in the unconsumed text to document positions
#[derive(Debug, Clone, Copy)]
struct Locator {
    encoding: Encoding,
    /// Position of offset 0
    origin: Position,
    origin_after_cr: bool,
    cursor: usize,
    at: Position,
    after_cr: bool,
}

impl Locator {
    fn new() -> Self {
        Locator {
            encoding: Encoding::Utf8,
            origin: Position::START,
            origin_after_cr: false,
            cursor: 0,
            at: Position::START,
            after_cr: false,
        }
    }

    /// Fix the encoding once detected; `skipped` bytes (a byte order mark)
    /// precede the text
    fn start(&mut self, encoding: Encoding, skipped: usize) {
        self.encoding = encoding;
        self.origin.byte_index += skipped as u64;
        self.at = self.origin;
    }

    fn locate(&mut self, text: &str, offset: usize) -> Position {
        if offset < self.cursor {
            self.cursor = 0;
            self.at = self.origin;
            self.after_cr = self.origin_after_cr;
        }
        for c in text[self.cursor..offset].chars() {
            self.at.byte_index += self.encoding.width(c) as u64;
            match c {
                '\n' if self.after_cr => self.after_cr = false,
                '\r' | '\n' => {
                    self.at.line += 1;
                    self.at.column = 0;
                    self.after_cr = c == '\r';
                }
                _ => {
                    self.at.column += 1;
                    self.after_cr = false;
                }
            }
        }
        self.cursor = offset;
        self.at
    }

    /// Drop `consumed` bytes from the front of the text
    fn commit(&mut self, text: &str, consumed: usize) -> Position {
        let at = self.locate(text, consumed);
        self.origin = at;
        self.origin_after_cr = self.after_cr;
        self.cursor = 0;
        at
    }

    /// Input bytes `raw` was decoded from
    fn input_len(&self, raw: &str) -> usize {
        match self.encoding {
            Encoding::Utf8 => raw.len(),
            Encoding::UsAscii | Encoding::Latin1 => raw.chars().count(),
        }
    }
}

/// Text being tokenized: the document itself or an entity's replacement text
#[derive(Debug, Clone, Copy)]
struct Frame<'t> {
    src: &'t str,
    /// The unconsumed document text, which positions refer to
    doc: &'t str,
    /// Offset in `doc` of the reference this frame expands
    anchor: Option<usize>,
    is_final: bool,
    /// Open elements when the frame started
    base_depth: usize,
}

impl Frame<'_> {
    #[inline]
    fn at(&self, offset: usize) -> usize {
        self.anchor.unwrap_or(offset)
    }

    #[inline]
    fn fail(&self, code: ErrorCode, offset: usize) -> Failure {
        Failure {
            code,
            at: self.at(offset),
        }
    }
}

/// A failure at an offset into the unconsumed document text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Failure {
    code: ErrorCode,
    at: usize,
}

/// Offset after the construct just handled, or `None` when the rest of
/// the frame is needed first
type Step = Result<Option<usize>, Failure>;

fn incomplete(frame: &Frame<'_>, offset: usize, code: ErrorCode) -> Step {
    if frame.is_final {
        Err(frame.fail(code, offset))
    } else {
        Ok(None)
    }
}

fn starts_xml_decl(input: &str) -> bool {
    input.starts_with("<?xml")
        && input
            .as_bytes()
            .get(5)
            .is_some_and(|&b| is_whitespace(b) || b == b'?')
}

#[derive(Debug)]
struct OpenElement {
    /// Name as written, for end-tag matching
    qname: String,
    /// Name as reported
    name: String,
}

/// Streaming tokenizer implementing [`Engine`]
pub struct Tokenizer {
    events: EventSet,
    separator: Option<char>,
    triplets: bool,
    forced_encoding: Option<String>,
    base: Option<String>,
    status: Status,
    halted: bool,
    error: Option<ErrorCode>,
    /// Bytes not yet decoded
    raw: Vec<u8>,
    decoder: Option<Decoder>,
    /// Decoded text not yet consumed
    text: String,
    locator: Locator,
    current: Position,
    event_bytes: usize,
    specified: usize,
    phase: Phase,
    /// Nothing consumed yet; an XML or text declaration may follow
    at_start: bool,
    seen_doctype: bool,
    /// The DOCTYPE named an external subset
    external_subset: bool,
    elements: Vec<OpenElement>,
    namespaces: NamespaceResolver,
    dtd: Rc<Dtd>,
    accounting: Rc<Accounting>,
    /// Entities being expanded, innermost last
    expanding: Vec<String>,
    is_child: bool,
    outstanding_models: usize,
}

impl Tokenizer {
    pub const FEATURES: Features = Features {
        name: "rustysax",
        version: env!("CARGO_PKG_VERSION"),
        namespaces: true,
        dtd: true,
        max_amplification: DEFAULT_MAX_AMPLIFICATION,
        amplification_threshold: DEFAULT_AMPLIFICATION_THRESHOLD,
        max_model_depth: dtd::MAX_MODEL_DEPTH,
    };

    /// Create a document tokenizer; `separator` turns on namespace
    /// processing
    pub fn new(separator: Option<char>) -> Self {
        Self::with_options(TokenizerOptions {
            separator,
            ..TokenizerOptions::default()
        })
    }

    pub fn with_options(options: TokenizerOptions) -> Self {
        let accounting = Accounting::new(options.max_amplification, options.amplification_threshold);
        let mut tokenizer = Self::blank(
            Rc::new(Dtd::new()),
            Rc::new(accounting),
            NamespaceResolver::new(),
            false,
        );
        tokenizer.separator = options.separator;
        tokenizer.triplets = options.triplets;
        tokenizer.forced_encoding = options.encoding;
        tokenizer.base = options.base;
        tokenizer
    }

    fn blank(dtd: Rc<Dtd>, accounting: Rc<Accounting>, namespaces: NamespaceResolver, is_child: bool) -> Self {
        Tokenizer {
            events: EventSet::empty(),
            separator: None,
            triplets: false,
            forced_encoding: None,
            base: None,
            status: Status::Initialized,
            halted: false,
            error: None,
            raw: Vec::new(),
            decoder: None,
            text: String::new(),
            locator: Locator::new(),
            current: Position::START,
            event_bytes: 0,
            specified: 0,
            phase: if is_child { Phase::Content } else { Phase::Prolog },
            at_start: true,
            seen_doctype: false,
            external_subset: false,
            elements: Vec::new(),
            namespaces,
            dtd,
            accounting,
            expanding: Vec::new(),
            is_child,
            outstanding_models: 0,
        }
    }

    /// Tokenizer for an external parsed entity referenced from this one
    fn child(&self) -> Tokenizer {
        let mut child = Self::blank(
            Rc::clone(&self.dtd),
            Rc::clone(&self.accounting),
            self.namespaces.clone(),
            true,
        );
        child.separator = self.separator;
        child.triplets = self.triplets;
        child.base = self.base.clone();
        child
    }

    /// Whether internal entity references in content are expanded
    #[inline]
    fn expands_internal(&self) -> bool {
        !(self.events.contains(EventSet::DEFAULT) && !self.events.contains(EventSet::DEFAULT_EXPAND))
    }

    /// Decode what the buffered bytes allow. A decoding error is returned
    /// for reporting after the text decoded before it.
    fn decode(&mut self, is_final: bool) -> Result<Option<ErrorCode>, ErrorCode> {
        if self.decoder.is_none() {
            match detect(&self.raw, self.forced_encoding.as_deref(), is_final)? {
                Detection::NeedMore => return Ok(None),
                Detection::Found { encoding, skip } => {
                    self.raw.drain(..skip);
                    self.locator.start(encoding, skip);
                    self.decoder = Some(Decoder::new(encoding));
                }
            }
        }
        let Some(decoder) = &self.decoder else {
            return Ok(None);
        };
        let step = decoder.decode(&self.raw, &mut self.text, is_final);
        self.raw.drain(..step.consumed);
        Ok(step.error)
    }

    fn latch(&mut self, code: ErrorCode) -> ErrorCode {
        log::debug!("tokenizer failed: {} at {:?}", code, self.current);
        self.error = Some(code);
        code
    }

    fn run(&mut self, text: &str, is_final: bool, handler: &mut dyn EventHandler) -> Result<usize, Failure> {
        let frame = Frame {
            src: text,
            doc: text,
            anchor: None,
            is_final,
            base_depth: 0,
        };
        let mut pos = 0;
        loop {
            let step = match self.phase {
                Phase::Prolog => self.prolog_step(&frame, pos, handler)?,
                Phase::Subset => self.subset_step(&frame, pos, handler)?,
                Phase::Content => self.content_step(&frame, pos, handler)?,
                Phase::Epilog => self.epilog_step(&frame, pos, handler)?,
            };
            match step {
                Some(next) => pos = next,
                None => break,
            }
        }
        if is_final {
            match self.phase {
                Phase::Epilog => {}
                Phase::Content if self.is_child => {
                    if !self.elements.is_empty() {
                        return Err(frame.fail(ErrorCode::AsyncEntity, pos));
                    }
                }
                _ => return Err(frame.fail(ErrorCode::NoElements, pos)),
            }
        }
        Ok(pos)
    }

    // ---- event plumbing ----

    fn begin_event(&mut self, frame: &Frame<'_>, offset: usize, raw: &str) {
        self.current = self.locator.locate(frame.doc, frame.at(offset));
        self.event_bytes = if frame.anchor.is_some() {
            0
        } else {
            self.locator.input_len(raw)
        };
    }

    /// Abort if a callback stopped the tokenizer
    #[inline]
    fn resume(&self, frame: &Frame<'_>, offset: usize) -> Result<(), Failure> {
        if self.halted {
            Err(frame.fail(ErrorCode::Aborted, offset))
        } else {
            Ok(())
        }
    }

    fn report_default(
        &mut self,
        frame: &Frame<'_>,
        offset: usize,
        raw: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        let expand = self.events.contains(EventSet::DEFAULT_EXPAND);
        if !expand && !self.events.contains(EventSet::DEFAULT) {
            return Ok(());
        }
        self.begin_event(frame, offset, raw);
        if expand {
            handler.default_expand(self, raw);
        } else {
            handler.default_text(self, raw);
        }
        self.resume(frame, offset)
    }

    fn character_data(
        &mut self,
        frame: &Frame<'_>,
        offset: usize,
        raw: &str,
        text: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        if !self.events.contains(EventSet::CHARACTER_DATA) {
            return self.report_default(frame, offset, raw, handler);
        }
        self.begin_event(frame, offset, raw);
        handler.character_data(self, text);
        self.resume(frame, offset)
    }

    /// Report a run of text; every line break is its own `"\n"` event
    fn text_segments(
        &mut self,
        frame: &Frame<'_>,
        offset: usize,
        run: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        let bytes = run.as_bytes();
        let mut start = 0;
        while start < run.len() {
            let (len, newline) = match memchr2(b'\r', b'\n', &bytes[start..]) {
                Some(0) => {
                    let crlf = bytes[start] == b'\r' && bytes.get(start + 1) == Some(&b'\n');
                    (if crlf { 2 } else { 1 }, true)
                }
                Some(i) => (i, false),
                None => (run.len() - start, false),
            };
            let raw = &run[start..start + len];
            let text = if newline { "\n" } else { raw };
            self.character_data(frame, offset + start, raw, text, handler)?;
            start += len;
        }
        Ok(())
    }

    fn check_standalone(
        &mut self,
        frame: &Frame<'_>,
        offset: usize,
        raw: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        if self.dtd.standalone || !self.events.contains(EventSet::NOT_STANDALONE) {
            return Ok(());
        }
        self.begin_event(frame, offset, raw);
        let accepted = handler.not_standalone(self);
        self.resume(frame, offset)?;
        if accepted {
            Ok(())
        } else {
            Err(frame.fail(ErrorCode::NotStandalone, offset))
        }
    }

    // ---- phases ----

    /// The XML declaration (text declaration in an external entity) is
    /// only recognized before anything else
    fn leading_declaration(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Option<Step> {
        let rest = &frame.src[pos..];
        if is_partial(rest, "<?xml ") && !frame.is_final {
            return Some(Ok(None));
        }
        if !starts_xml_decl(rest) {
            self.at_start = false;
            return None;
        }
        let Some(end) = find(rest, "?>") else {
            return Some(incomplete(frame, pos, ErrorCode::UnclosedToken));
        };
        self.at_start = false;
        let raw = &rest[..end + 2];
        Some(self.xml_declaration(frame, pos, raw, handler).map(Some))
    }

    fn xml_declaration(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        raw: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<usize, Failure> {
        let body = &raw[5..raw.len() - 2];
        let decl = dtd::parse_xml_decl(body, self.is_child).map_err(|code| frame.fail(code, pos))?;
        if decl.standalone == Some(true) {
            Rc::make_mut(&mut self.dtd).standalone = true;
        }
        if self.events.contains(EventSet::XML_DECL) {
            self.begin_event(frame, pos, raw);
            handler.xml_decl(self, decl.version, decl.encoding, decl.standalone);
            self.resume(frame, pos)?;
        } else {
            self.report_default(frame, pos, raw, handler)?;
        }
        Ok(pos + raw.len())
    }

    fn prolog_step(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        if self.at_start {
            if let Some(step) = self.leading_declaration(frame, pos, handler) {
                return step;
            }
        }
        let rest = &frame.src[pos..];
        if rest.is_empty() {
            return Ok(None);
        }
        let ws = whitespace_len(rest);
        if ws > 0 {
            return self.whitespace(frame, pos, ws, handler);
        }
        if rest.starts_with("<!--") {
            return self.comment(frame, pos, handler);
        }
        if rest.starts_with("<?") {
            return self.processing_instruction(frame, pos, handler);
        }
        if rest.starts_with("<!DOCTYPE") && !self.seen_doctype {
            return self.doctype(frame, pos, handler);
        }
        if is_partial(rest, "<!DOCTYPE") || is_partial(rest, "<!--") {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        }
        let bytes = rest.as_bytes();
        match (bytes[0], bytes.get(1)) {
            (b'<', Some(&b)) if is_name_start_char(b) => {
                self.phase = Phase::Content;
                Ok(Some(pos))
            }
            (b'<', _) => Err(frame.fail(ErrorCode::Syntax, pos)),
            _ => Err(frame.fail(ErrorCode::InvalidToken, pos)),
        }
    }

    fn epilog_step(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        if rest.is_empty() {
            return Ok(None);
        }
        let ws = whitespace_len(rest);
        if ws > 0 {
            return self.whitespace(frame, pos, ws, handler);
        }
        if rest.starts_with("<!--") {
            return self.comment(frame, pos, handler);
        }
        if rest.starts_with("<?") {
            return self.processing_instruction(frame, pos, handler);
        }
        if is_partial(rest, "<!--") {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        }
        Err(frame.fail(ErrorCode::JunkAfterDocElement, pos))
    }

    fn subset_step(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        if rest.is_empty() {
            return Ok(None);
        }
        let ws = whitespace_len(rest);
        if ws > 0 {
            return self.whitespace(frame, pos, ws, handler);
        }
        match rest.as_bytes()[0] {
            b']' => {
                let Some(gt) = memchr(b'>', rest.as_bytes()) else {
                    return incomplete(frame, pos, ErrorCode::UnclosedToken);
                };
                if !is_all_whitespace(&rest[1..gt]) {
                    return Err(frame.fail(ErrorCode::Syntax, pos));
                }
                let raw = &rest[..gt + 1];
                self.phase = Phase::Prolog;
                self.close_doctype(frame, pos, raw, handler)?;
                return Ok(Some(pos + raw.len()));
            }
            b'%' => return self.param_entity_ref(frame, pos, handler),
            _ => {}
        }
        if rest.starts_with("<!--") {
            return self.comment(frame, pos, handler);
        }
        if rest.starts_with("<?") {
            return self.processing_instruction(frame, pos, handler);
        }
        let mut partial = is_partial(rest, "<!--");
        for (keyword, kind) in DECLARATIONS {
            if rest.starts_with(keyword) {
                return self.markup_declaration(frame, pos, keyword.len(), kind, handler);
            }
            partial |= is_partial(rest, keyword);
        }
        if partial {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        }
        Err(frame.fail(ErrorCode::Syntax, pos))
    }

    fn content_step(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        if self.at_start {
            if let Some(step) = self.leading_declaration(frame, pos, handler) {
                return step;
            }
        }
        let rest = &frame.src[pos..];
        let Some(&first) = rest.as_bytes().first() else {
            return Ok(None);
        };
        // A run of text and references is reported in the chunk that closes it
        if first != b'<' && !frame.is_final && memchr(b'<', rest.as_bytes()).is_none() {
            return Ok(None);
        }
        match first {
            b'<' => self.content_markup(frame, pos, handler),
            b'&' => self.content_reference(frame, pos, handler),
            _ => self.text(frame, pos, handler),
        }
    }

    // ---- prolog, subset and epilog constructs ----

    /// Whitespace outside content goes to the default callback
    fn whitespace(&mut self, frame: &Frame<'_>, pos: usize, len: usize, handler: &mut dyn EventHandler) -> Step {
        if pos + len == frame.src.len() && !frame.is_final {
            return Ok(None);
        }
        let raw = &frame.src[pos..pos + len];
        self.report_default(frame, pos, raw, handler)?;
        Ok(Some(pos + len))
    }

    fn comment(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        let Some(end) = find(&rest[4..], "-->") else {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        };
        let body = &rest[4..4 + end];
        if let Some(dash) = find(body, "--") {
            return Err(frame.fail(ErrorCode::InvalidToken, pos + 4 + dash));
        }
        if body.ends_with('-') {
            return Err(frame.fail(ErrorCode::InvalidToken, pos + 3 + body.len()));
        }
        let raw = &rest[..end + 7];
        if self.events.contains(EventSet::COMMENT) {
            self.begin_event(frame, pos, raw);
            handler.comment(self, &normalize_newlines(body));
            self.resume(frame, pos)?;
        } else {
            self.report_default(frame, pos, raw, handler)?;
        }
        Ok(Some(pos + raw.len()))
    }

    fn processing_instruction(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        let Some(end) = find(&rest[2..], "?>").map(|i| i + 2) else {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        };
        let mut scanner = Scanner::new(&rest[2..end]);
        let target = scanner
            .read_name()
            .ok_or_else(|| frame.fail(ErrorCode::InvalidToken, pos + 2))?;
        if target.eq_ignore_ascii_case("xml") {
            let code = if target == "xml" {
                ErrorCode::MisplacedXmlPi
            } else {
                ErrorCode::InvalidToken
            };
            return Err(frame.fail(code, pos));
        }
        let data = if scanner.is_eof() {
            ""
        } else if scanner.skip_whitespace() {
            scanner.remaining()
        } else {
            return Err(frame.fail(ErrorCode::InvalidToken, pos + 2 + scanner.position()));
        };
        let raw = &rest[..end + 2];
        if self.events.contains(EventSet::PROCESSING_INSTRUCTION) {
            self.begin_event(frame, pos, raw);
            handler.processing_instruction(self, target, &normalize_newlines(data));
            self.resume(frame, pos)?;
        } else {
            self.report_default(frame, pos, raw, handler)?;
        }
        Ok(Some(pos + raw.len()))
    }

    fn doctype(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        let after = &rest["<!DOCTYPE".len()..];
        let Some(end) = dtd::find_doctype_header_end(after) else {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        };
        let header = dtd::parse_doctype_header(&after[..end]).map_err(|code| frame.fail(code, pos))?;
        let has_subset = after.as_bytes()[end] == b'[';
        let raw = &rest[.."<!DOCTYPE".len() + end + 1];
        self.seen_doctype = true;
        if header.system_id.is_some() {
            self.external_subset = true;
            Rc::make_mut(&mut self.dtd).has_param_entity_refs = true;
        }

        if self.events.contains(EventSet::START_DOCTYPE_DECL) {
            self.begin_event(frame, pos, raw);
            handler.start_doctype_decl(
                self,
                header.name,
                header.system_id,
                header.public_id.as_deref(),
                has_subset,
            );
            self.resume(frame, pos)?;
        } else {
            self.report_default(frame, pos, raw, handler)?;
        }

        let next = pos + raw.len();
        if has_subset {
            self.phase = Phase::Subset;
        } else {
            self.close_doctype(frame, next - 1, "", handler)?;
        }
        Ok(Some(next))
    }

    /// `raw` is the `]>` closing an internal subset, empty otherwise
    fn close_doctype(
        &mut self,
        frame: &Frame<'_>,
        offset: usize,
        raw: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        if self.external_subset {
            self.check_standalone(frame, offset, raw, handler)?;
        }
        if self.events.contains(EventSet::END_DOCTYPE_DECL) {
            self.begin_event(frame, offset, raw);
            handler.end_doctype_decl(self);
            self.resume(frame, offset)
        } else if raw.is_empty() {
            Ok(())
        } else {
            self.report_default(frame, offset, raw, handler)
        }
    }

    /// `%name;` in the internal subset. Parameter entities are not
    /// expanded, so later declarations may depend on text that was never
    /// read.
    fn param_entity_ref(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        let mut scanner = Scanner::new(rest);
        scanner.advance(1);
        let name = scanner.read_name();
        match (name, scanner.peek()) {
            (Some(_), Some(b';')) => {}
            (_, None) => return incomplete(frame, pos, ErrorCode::UnclosedToken),
            _ => return Err(frame.fail(ErrorCode::InvalidToken, pos)),
        }
        let raw = &rest[..scanner.position() + 1];
        {
            let dtd = Rc::make_mut(&mut self.dtd);
            dtd.has_param_entity_refs = true;
            dtd.keep_processing = dtd.standalone;
        }
        self.check_standalone(frame, pos, raw, handler)?;
        self.report_default(frame, pos, raw, handler)?;
        Ok(Some(pos + raw.len()))
    }

    fn markup_declaration(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        keyword_len: usize,
        kind: Declaration,
        handler: &mut dyn EventHandler,
    ) -> Step {
        let rest = &frame.src[pos..];
        let Some(end) = find_tag_end(rest) else {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        };
        let raw = &rest[..end + 1];
        let body = &rest[keyword_len..end];
        match kind {
            Declaration::Element => self.element_decl(frame, pos, raw, body, handler)?,
            Declaration::Attlist => self.attlist_decl(frame, pos, raw, body, handler)?,
            Declaration::Entity => self.entity_decl(frame, pos, raw, body, handler)?,
            Declaration::Notation => self.notation_decl(frame, pos, raw, body, handler)?,
        }
        Ok(Some(pos + raw.len()))
    }

    fn element_decl(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        raw: &str,
        body: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        let (name, model) = dtd::parse_element_decl(body).map_err(|code| frame.fail(code, pos))?;
        if !self.events.contains(EventSet::ELEMENT_DECL) {
            return self.report_default(frame, pos, raw, handler);
        }
        self.outstanding_models += 1;
        self.begin_event(frame, pos, raw);
        handler.element_decl(self, name, model);
        self.resume(frame, pos)
    }

    fn attlist_decl(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        raw: &str,
        body: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        let (element, defs) = dtd::parse_attlist_decl(body).map_err(|code| frame.fail(code, pos))?;
        if !self.dtd.keep_processing {
            return self.report_default(frame, pos, raw, handler);
        }
        let mut reported = false;
        for def in &defs {
            let value = match def.default.literal() {
                Some(literal) => Some(self.attribute_value(frame, pos, literal, def.is_cdata(), Some(pos))?),
                None => None,
            };
            Rc::make_mut(&mut self.dtd).declare_attribute(
                element,
                AttributeDefault {
                    name: def.name.to_string(),
                    is_cdata: def.is_cdata(),
                    value: value.clone(),
                },
            );
            if self.events.contains(EventSet::ATTLIST_DECL) {
                reported = true;
                let decl = AttlistDeclaration {
                    element_name: element,
                    attribute_name: def.name,
                    attribute_type: &def.att_type,
                    default: value.as_deref(),
                    is_required: def.default.is_required(),
                };
                self.begin_event(frame, pos, raw);
                handler.attlist_decl(self, &decl);
                self.resume(frame, pos)?;
            }
        }
        if !reported {
            self.report_default(frame, pos, raw, handler)?;
        }
        Ok(())
    }

    fn entity_decl(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        raw: &str,
        body: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        let decl = dtd::parse_entity_decl(body).map_err(|code| frame.fail(code, pos))?;
        if !self.dtd.keep_processing {
            return self.report_default(frame, pos, raw, handler);
        }
        let value = decl
            .literal
            .map(dtd::entity_value)
            .transpose()
            .map_err(|code| frame.fail(code, pos))?;
        let base = self.base.clone();
        let def = EntityDef {
            value: value.as_deref().map(Rc::from),
            system_id: decl.system_id.map(str::to_string),
            public_id: decl.public_id.clone(),
            notation: decl.notation.map(str::to_string),
            base: base.clone(),
        };
        if !Rc::make_mut(&mut self.dtd).declare_entity(decl.name, def, decl.is_parameter) {
            return self.report_default(frame, pos, raw, handler);
        }

        let id = ExternalId {
            base: base.as_deref(),
            system_id: decl.system_id,
            public_id: decl.public_id.as_deref(),
        };
        match decl.notation {
            Some(notation)
                if !self.events.contains(EventSet::ENTITY_DECL)
                    && self.events.contains(EventSet::UNPARSED_ENTITY_DECL) =>
            {
                self.begin_event(frame, pos, raw);
                handler.unparsed_entity_decl(self, decl.name, id, notation);
                self.resume(frame, pos)
            }
            _ if self.events.contains(EventSet::ENTITY_DECL) => {
                let declaration = EntityDeclaration {
                    name: decl.name,
                    is_parameter_entity: decl.is_parameter,
                    value: value.as_deref(),
                    base: id.base,
                    system_id: id.system_id,
                    public_id: id.public_id,
                    notation_name: decl.notation,
                };
                self.begin_event(frame, pos, raw);
                handler.entity_decl(self, &declaration);
                self.resume(frame, pos)
            }
            _ => self.report_default(frame, pos, raw, handler),
        }
    }

    fn notation_decl(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        raw: &str,
        body: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        let decl = dtd::parse_notation_decl(body).map_err(|code| frame.fail(code, pos))?;
        if !self.events.contains(EventSet::NOTATION_DECL) {
            return self.report_default(frame, pos, raw, handler);
        }
        let base = self.base.clone();
        let id = ExternalId {
            base: base.as_deref(),
            system_id: decl.system_id,
            public_id: decl.public_id.as_deref(),
        };
        self.begin_event(frame, pos, raw);
        handler.notation_decl(self, decl.name, id);
        self.resume(frame, pos)
    }

    // ---- content ----

    fn content_markup(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        if rest.starts_with("<!--") {
            return self.comment(frame, pos, handler);
        }
        if rest.starts_with("<![CDATA[") {
            return self.cdata_section(frame, pos, handler);
        }
        if rest.starts_with("<?") {
            return self.processing_instruction(frame, pos, handler);
        }
        if rest.starts_with("</") {
            return self.end_tag(frame, pos, handler);
        }
        if is_partial(rest, "<!--") || is_partial(rest, "<![CDATA[") {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        }
        if rest.starts_with("<!") {
            return Err(frame.fail(ErrorCode::InvalidToken, pos));
        }
        self.start_tag(frame, pos, handler)
    }

    fn text(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        let end = match find_text_boundary(rest) {
            Some(end) => end,
            None if frame.is_final => rest.len(),
            None => return Ok(None),
        };
        let run = &rest[..end];
        if let Some(i) = find(run, "]]>") {
            return Err(frame.fail(ErrorCode::InvalidToken, pos + i));
        }
        self.text_segments(frame, pos, run, handler)?;
        Ok(Some(pos + end))
    }

    fn cdata_section(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        const OPEN: &str = "<![CDATA[";
        let rest = &frame.src[pos..];
        let Some(end) = find(&rest[OPEN.len()..], "]]>").map(|i| i + OPEN.len()) else {
            return incomplete(frame, pos, ErrorCode::UnclosedCdataSection);
        };
        if self.events.contains(EventSet::START_CDATA_SECTION) {
            self.begin_event(frame, pos, OPEN);
            handler.start_cdata_section(self);
            self.resume(frame, pos)?;
        } else {
            self.report_default(frame, pos, OPEN, handler)?;
        }
        self.text_segments(frame, pos + OPEN.len(), &rest[OPEN.len()..end], handler)?;
        let close = pos + end;
        if self.events.contains(EventSet::END_CDATA_SECTION) {
            self.begin_event(frame, close, "]]>");
            handler.end_cdata_section(self);
            self.resume(frame, close)?;
        } else {
            self.report_default(frame, close, "]]>", handler)?;
        }
        Ok(Some(close + 3))
    }

    fn content_reference(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        let (reference, len) = match scan_reference(rest) {
            RefScan::Complete(reference, len) => (reference, len),
            RefScan::Partial => return incomplete(frame, pos, ErrorCode::UnclosedToken),
            RefScan::Invalid(code) => return Err(frame.fail(code, pos)),
        };
        let raw = &rest[..len];
        match reference {
            Reference::Char(c) => {
                let mut buf = [0u8; 4];
                self.character_data(frame, pos, raw, c.encode_utf8(&mut buf), handler)?;
            }
            Reference::Entity(name) => match predefined(name) {
                Some(text) => self.character_data(frame, pos, raw, text, handler)?,
                None => self.general_entity(frame, pos, raw, name, handler)?,
            },
        }
        Ok(Some(pos + len))
    }

    fn general_entity(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        raw: &str,
        name: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        let Some(def) = self.dtd.entity(name).cloned() else {
            if !self.dtd.has_param_entity_refs || self.dtd.standalone {
                return Err(frame.fail(ErrorCode::UndefinedEntity, pos));
            }
            return self.skipped_entity(frame, pos, raw, name, handler);
        };
        if def.is_unparsed() {
            return Err(frame.fail(ErrorCode::BinaryEntityRef, pos));
        }
        if let Some(value) = def.value {
            if !self.expands_internal() {
                return self.skipped_entity(frame, pos, raw, name, handler);
            }
            return self.expand_entity(frame, pos, name, &value, handler);
        }
        if !self.events.contains(EventSet::EXTERNAL_ENTITY_REF) {
            return self.report_default(frame, pos, raw, handler);
        }
        let id = ExternalId {
            base: def.base.as_deref(),
            system_id: def.system_id.as_deref(),
            public_id: def.public_id.as_deref(),
        };
        self.begin_event(frame, pos, raw);
        let resolution = handler.external_entity_ref(self, name, id);
        self.resume(frame, pos)?;
        if resolution == EntityResolution::Reject {
            return Err(frame.fail(ErrorCode::ExternalEntityHandling, pos));
        }
        Ok(())
    }

    fn skipped_entity(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        raw: &str,
        name: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        if !self.events.contains(EventSet::SKIPPED_ENTITY) {
            return self.report_default(frame, pos, raw, handler);
        }
        self.begin_event(frame, pos, raw);
        handler.skipped_entity(self, name, false);
        self.resume(frame, pos)
    }

    /// Tokenize an internal entity's replacement text as content
    fn expand_entity(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        name: &str,
        value: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        if self.expanding.iter().any(|open| open == name) {
            return Err(frame.fail(ErrorCode::RecursiveEntityRef, pos));
        }
        self.accounting
            .expand(value.len())
            .map_err(|code| frame.fail(code, pos))?;
        let inner = Frame {
            src: value,
            doc: frame.doc,
            anchor: Some(frame.at(pos)),
            is_final: true,
            base_depth: self.elements.len(),
        };
        self.expanding.push(name.to_string());
        let result = self.entity_content(&inner, handler);
        self.expanding.pop();
        result
    }

    fn entity_content(&mut self, frame: &Frame<'_>, handler: &mut dyn EventHandler) -> Result<(), Failure> {
        let mut pos = 0;
        while let Some(next) = self.content_step(frame, pos, handler)? {
            pos = next;
        }
        if self.elements.len() != frame.base_depth {
            return Err(frame.fail(ErrorCode::AsyncEntity, pos));
        }
        Ok(())
    }

    fn start_tag(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        let Some(end) = find_tag_end(rest) else {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        };
        let tag = &rest[..end + 1];
        let raw_tag = scan_start_tag(tag).map_err(|offset| frame.fail(ErrorCode::InvalidToken, pos + offset))?;
        let qname = &tag[raw_tag.name.clone()];

        let mut attributes: Vec<(String, String)> = Vec::with_capacity(raw_tag.attributes.len());
        for attr in &raw_tag.attributes {
            let name = &tag[attr.name.clone()];
            if attributes.iter().any(|(seen, _)| seen == name) {
                return Err(frame.fail(ErrorCode::DuplicateAttribute, pos + attr.name.start));
            }
            let is_cdata = self.dtd.attribute(qname, name).map_or(true, |def| def.is_cdata);
            let value = self.attribute_value(frame, pos + attr.value.start, &tag[attr.value.clone()], is_cdata, None)?;
            attributes.push((name.to_string(), value));
        }
        let mut specified = attributes.len();
        for def in self.dtd.attributes(qname) {
            if let Some(value) = &def.value {
                if !attributes.iter().any(|(seen, _)| *seen == def.name) {
                    attributes.push((def.name.clone(), value.clone()));
                }
            }
        }

        let (name, attributes, declared) = if self.separator.is_some() {
            self.namespace_scope(qname, attributes, &mut specified)
                .map_err(|code| frame.fail(code, pos))?
        } else {
            (qname.to_string(), attributes, Vec::new())
        };
        self.specified = specified;

        if self.events.contains(EventSet::START_NAMESPACE_DECL) {
            for (prefix, uri) in &declared {
                self.begin_event(frame, pos, tag);
                let uri = (!uri.is_empty()).then_some(uri.as_str());
                handler.start_namespace_decl(self, prefix.as_deref(), uri);
                self.resume(frame, pos)?;
            }
        }

        let element = OpenElement {
            qname: qname.to_string(),
            name,
        };
        if self.events.contains(EventSet::START_ELEMENT) {
            self.begin_event(frame, pos, tag);
            handler.start_element(self, &element.name, &attributes);
            self.resume(frame, pos)?;
        } else if !raw_tag.is_empty || !self.events.contains(EventSet::END_ELEMENT) {
            self.report_default(frame, pos, tag, handler)?;
        }

        if raw_tag.is_empty {
            self.close_element(frame, pos, "", &element, handler)?;
            self.leave_root(frame);
        } else {
            self.elements.push(element);
        }
        Ok(Some(pos + tag.len()))
    }

    fn end_tag(&mut self, frame: &Frame<'_>, pos: usize, handler: &mut dyn EventHandler) -> Step {
        let rest = &frame.src[pos..];
        let Some(gt) = memchr(b'>', rest.as_bytes()) else {
            return incomplete(frame, pos, ErrorCode::UnclosedToken);
        };
        let raw = &rest[..gt + 1];
        let mut scanner = Scanner::new(&rest[..gt]);
        scanner.advance(2);
        let qname = scanner
            .read_name()
            .ok_or_else(|| frame.fail(ErrorCode::InvalidToken, pos + 2))?;
        scanner.skip_whitespace();
        if !scanner.is_eof() {
            return Err(frame.fail(ErrorCode::InvalidToken, pos + scanner.position()));
        }
        if self.elements.len() <= frame.base_depth {
            return Err(frame.fail(ErrorCode::AsyncEntity, pos));
        }
        let Some(element) = self.elements.pop() else {
            return Err(frame.fail(ErrorCode::AsyncEntity, pos));
        };
        if element.qname != qname {
            self.elements.push(element);
            return Err(frame.fail(ErrorCode::TagMismatch, pos + 2));
        }
        self.close_element(frame, pos, raw, &element, handler)?;
        self.leave_root(frame);
        Ok(Some(pos + raw.len()))
    }

    /// `raw` is empty for the end of an empty-element tag
    fn close_element(
        &mut self,
        frame: &Frame<'_>,
        pos: usize,
        raw: &str,
        element: &OpenElement,
        handler: &mut dyn EventHandler,
    ) -> Result<(), Failure> {
        let prefixes = if self.separator.is_some() {
            self.namespaces.pop_scope()
        } else {
            Vec::new()
        };
        if self.events.contains(EventSet::END_ELEMENT) {
            self.begin_event(frame, pos, raw);
            handler.end_element(self, &element.name);
            self.resume(frame, pos)?;
        } else if !raw.is_empty() {
            self.report_default(frame, pos, raw, handler)?;
        }
        if self.events.contains(EventSet::END_NAMESPACE_DECL) {
            for prefix in prefixes.iter().rev() {
                self.begin_event(frame, pos, raw);
                handler.end_namespace_decl(self, prefix.as_deref());
                self.resume(frame, pos)?;
            }
        }
        Ok(())
    }

    /// Move to the epilog once the document element has closed
    fn leave_root(&mut self, frame: &Frame<'_>) {
        if self.elements.is_empty() && !self.is_child && frame.anchor.is_none() {
            self.phase = Phase::Epilog;
        }
    }

    /// Bind the element's namespace declarations and expand its names.
    /// Returns the element name, the remaining attributes and the
    /// declarations made, as (prefix, uri).
    #[allow(clippy::type_complexity)]
    fn namespace_scope(
        &mut self,
        qname: &str,
        attributes: Vec<(String, String)>,
        specified: &mut usize,
    ) -> Result<(String, Vec<(String, String)>, Vec<(Option<String>, String)>), ErrorCode> {
        self.namespaces.push_scope();
        let written = *specified;
        let mut declared = Vec::new();
        let mut kept = Vec::with_capacity(attributes.len());
        for (i, (attr, value)) in attributes.into_iter().enumerate() {
            let prefix = if attr == "xmlns" {
                Some(None)
            } else {
                attr.strip_prefix("xmlns:").map(|p| Some(p.to_string()))
            };
            match prefix {
                Some(prefix) => {
                    self.namespaces.declare(prefix.as_deref(), &value)?;
                    if i < written {
                        *specified -= 1;
                    }
                    declared.push((prefix, value));
                }
                None => kept.push((attr, value)),
            }
        }

        let name = self.qualify(qname, true)?;
        let mut attributes = Vec::with_capacity(kept.len());
        for (attr, value) in kept {
            let expanded = self.qualify(&attr, false)?;
            if attributes.iter().any(|(seen, _): &(String, String)| *seen == expanded) {
                return Err(ErrorCode::DuplicateAttribute);
            }
            attributes.push((expanded, value));
        }
        Ok((name, attributes, declared))
    }

    /// Expanded name of an element or attribute. Unprefixed attributes are
    /// in no namespace.
    fn qualify(&self, qname: &str, is_element: bool) -> Result<String, ErrorCode> {
        let Some(sep) = self.separator else {
            return Ok(qname.to_string());
        };
        let (prefix, local) = split_qname(qname);
        let uri = match prefix {
            Some(prefix) => self.namespaces.resolve(Some(prefix)).ok_or(ErrorCode::UnboundPrefix)?,
            None if is_element => match self.namespaces.resolve(None) {
                Some(uri) => uri,
                None => return Ok(qname.to_string()),
            },
            None => return Ok(qname.to_string()),
        };
        let mut name = format!("{uri}{sep}{local}");
        if let (true, Some(prefix)) = (self.triplets, prefix) {
            name.push(sep);
            name.push_str(prefix);
        }
        Ok(name)
    }

    /// Normalize an attribute value, expanding references. Errors are
    /// reported at the reference, or at `anchor` when given.
    fn attribute_value(
        &mut self,
        frame: &Frame<'_>,
        offset: usize,
        literal: &str,
        is_cdata: bool,
        anchor: Option<usize>,
    ) -> Result<String, Failure> {
        let mut out = String::with_capacity(literal.len());
        self.expand_attribute(frame, offset, literal, anchor, &mut out)?;
        if is_cdata {
            Ok(out)
        } else {
            Ok(collapse_spaces(&out))
        }
    }

    fn expand_attribute(
        &mut self,
        frame: &Frame<'_>,
        offset: usize,
        text: &str,
        anchor: Option<usize>,
        out: &mut String,
    ) -> Result<(), Failure> {
        let bytes = text.as_bytes();
        let mut start = 0;
        while let Some(i) = memchr2(b'&', b'<', &bytes[start..]).map(|i| start + i) {
            let at = anchor.unwrap_or(offset + i);
            if bytes[i] == b'<' {
                return Err(frame.fail(ErrorCode::InvalidToken, at));
            }
            push_normalized(out, &text[start..i]);
            let (reference, len) = match scan_reference(&text[i..]) {
                RefScan::Complete(reference, len) => (reference, len),
                RefScan::Partial => return Err(frame.fail(ErrorCode::InvalidToken, at)),
                RefScan::Invalid(code) => return Err(frame.fail(code, at)),
            };
            match reference {
                Reference::Char(c) => out.push(c),
                Reference::Entity(name) => match predefined(name) {
                    Some(text) => out.push_str(text),
                    None => self.attribute_entity(frame, at, name, out)?,
                },
            }
            start = i + len;
        }
        push_normalized(out, &text[start..]);
        Ok(())
    }

    fn attribute_entity(&mut self, frame: &Frame<'_>, at: usize, name: &str, out: &mut String) -> Result<(), Failure> {
        let Some(def) = self.dtd.entity(name).cloned() else {
            if !self.dtd.has_param_entity_refs || self.dtd.standalone {
                return Err(frame.fail(ErrorCode::UndefinedEntity, at));
            }
            return Ok(());
        };
        if def.is_unparsed() {
            return Err(frame.fail(ErrorCode::BinaryEntityRef, at));
        }
        let Some(value) = def.value else {
            return Err(frame.fail(ErrorCode::AttributeExternalEntityRef, at));
        };
        if self.expanding.iter().any(|open| open == name) {
            return Err(frame.fail(ErrorCode::RecursiveEntityRef, at));
        }
        self.accounting
            .expand(value.len())
            .map_err(|code| frame.fail(code, at))?;
        self.expanding.push(name.to_string());
        let result = self.expand_attribute(frame, 0, &value, Some(at), out);
        self.expanding.pop();
        result
    }
}

impl Scope for Tokenizer {
    fn position(&self) -> Position {
        self.current
    }

    fn current_byte_count(&self) -> usize {
        self.event_bytes
    }

    fn specified_attribute_count(&self) -> usize {
        self.specified
    }

    fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    fn stop(&mut self) -> bool {
        if self.status != Status::Parsing {
            return false;
        }
        self.status = Status::Finished;
        self.halted = true;
        true
    }

    fn free_content_model(&mut self, model: NativeModel) {
        self.outstanding_models = self.outstanding_models.saturating_sub(1);
        drop(model);
    }

    fn create_child(&mut self, context: &str) -> Option<Box<dyn Engine>> {
        log::trace!("child tokenizer for entity {}", context);
        Some(Box::new(self.child()))
    }
}

impl Engine for Tokenizer {
    fn register(&mut self, events: EventSet) {
        self.events = events;
    }

    fn parse(&mut self, data: &[u8], is_final: bool, handler: &mut dyn EventHandler) -> Result<(), ErrorCode> {
        if self.status == Status::Finished {
            return Err(ErrorCode::Finished);
        }
        if let Some(code) = self.error {
            return Err(code);
        }
        self.status = Status::Parsing;
        self.accounting.read(data.len());
        self.raw.extend_from_slice(data);

        let deferred = match self.decode(is_final) {
            Ok(deferred) => deferred,
            Err(code) => {
                self.current = self.locator.origin;
                return Err(self.latch(code));
            }
        };
        let mut text = std::mem::take(&mut self.text);
        let outcome = self
            .run(&text, is_final && deferred.is_none(), handler)
            .and_then(|consumed| match deferred {
                Some(code) => Err(Failure { code, at: text.len() }),
                None => Ok(consumed),
            });
        self.event_bytes = 0;
        match outcome {
            Ok(consumed) => {
                self.current = self.locator.commit(&text, consumed);
                text.drain(..consumed);
                self.text = text;
                if is_final {
                    self.status = Status::Finished;
                }
                Ok(())
            }
            Err(Failure { code, at }) => {
                self.current = self.locator.locate(&text, at);
                self.text = text;
                Err(self.latch(code))
            }
        }
    }

    fn error_code(&self) -> Option<ErrorCode> {
        self.error
    }

    fn set_encoding(&mut self, encoding: &str) {
        self.forced_encoding = Some(encoding.to_string());
    }

    fn set_return_ns_triplet(&mut self, enabled: bool) {
        self.triplets = enabled;
    }

    fn set_base(&mut self, base: &str) -> bool {
        self.base = Some(base.to_string());
        true
    }

    fn set_max_amplification(&mut self, ratio: f32) -> bool {
        if self.is_child || ratio.is_nan() || ratio < 1.0 {
            return false;
        }
        self.accounting.max_ratio.set(ratio);
        true
    }

    fn set_amplification_threshold(&mut self, bytes: u64) -> bool {
        if self.is_child {
            return false;
        }
        self.accounting.threshold.set(bytes);
        true
    }
}

impl Drop for Tokenizer {
    fn drop(&mut self) {
        if self.outstanding_models > 0 {
            log::warn!("tokenizer released with {} content models outstanding", self.outstanding_models);
        }
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("status", &self.status)
            .field("phase", &self.phase)
            .field("depth", &self.elements.len())
            .field("is_child", &self.is_child)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Records every callback as a line of text
    #[derive(Default)]
    struct Trace {
        lines: Vec<String>,
        positions: Vec<(String, Position, usize)>,
        specified: Vec<usize>,
        registered: EventSet,
        external: Option<&'static [u8]>,
        reject: bool,
        refuse_standalone: bool,
        stop_on: Option<&'static str>,
    }

    impl Trace {
        fn note(&mut self, scope: &mut dyn Scope, line: String) {
            self.positions
                .push((line.clone(), scope.position(), scope.current_byte_count()));
            self.lines.push(line);
        }

        fn at(&self, line: &str) -> (Position, usize) {
            self.positions
                .iter()
                .find(|(seen, _, _)| seen == line)
                .map(|(_, pos, bytes)| (*pos, *bytes))
                .unwrap()
        }
    }

    impl EventHandler for Trace {
        fn start_cdata_section(&mut self, scope: &mut dyn Scope) {
            self.note(scope, "cdata{".into());
        }

        fn end_cdata_section(&mut self, scope: &mut dyn Scope) {
            self.note(scope, "}cdata".into());
        }

        fn character_data(&mut self, scope: &mut dyn Scope, text: &str) {
            self.note(scope, format!("text:{text}"));
        }

        fn comment(&mut self, scope: &mut dyn Scope, text: &str) {
            self.note(scope, format!("comment:{text}"));
        }

        fn default_text(&mut self, scope: &mut dyn Scope, text: &str) {
            self.note(scope, format!("default:{text}"));
        }

        fn default_expand(&mut self, scope: &mut dyn Scope, text: &str) {
            self.note(scope, format!("expand:{text}"));
        }

        fn start_element(&mut self, scope: &mut dyn Scope, name: &str, attributes: &[(String, String)]) {
            let mut line = format!("start:{name}");
            for (attr, value) in attributes {
                line.push_str(&format!(" {attr}={value}"));
            }
            self.specified.push(scope.specified_attribute_count());
            self.note(scope, line);
            if self.stop_on == Some(name) {
                let stopped = scope.stop();
                self.lines.push(format!("stop:{stopped}"));
            }
        }

        fn end_element(&mut self, scope: &mut dyn Scope, name: &str) {
            self.note(scope, format!("end:{name}"));
        }

        fn external_entity_ref(&mut self, scope: &mut dyn Scope, context: &str, id: ExternalId<'_>) -> EntityResolution {
            self.note(scope, format!("external:{context}:{:?}", id.system_id));
            if self.reject {
                return EntityResolution::Reject;
            }
            let Some(data) = self.external else {
                return EntityResolution::Decline;
            };
            let mut child = scope.create_child(context).unwrap();
            child.register(self.registered);
            match child.parse(data, true, self) {
                Ok(()) => EntityResolution::Accept,
                Err(_) => EntityResolution::Reject,
            }
        }

        fn start_namespace_decl(&mut self, scope: &mut dyn Scope, prefix: Option<&str>, uri: Option<&str>) {
            self.note(scope, format!("ns:{}={}", prefix.unwrap_or(""), uri.unwrap_or("")));
        }

        fn end_namespace_decl(&mut self, scope: &mut dyn Scope, prefix: Option<&str>) {
            self.note(scope, format!("/ns:{}", prefix.unwrap_or("")));
        }

        fn notation_decl(&mut self, scope: &mut dyn Scope, name: &str, id: ExternalId<'_>) {
            self.note(scope, format!("notation:{name}:{:?}", id.system_id));
        }

        fn not_standalone(&mut self, scope: &mut dyn Scope) -> bool {
            self.note(scope, "not_standalone".into());
            !self.refuse_standalone
        }

        fn processing_instruction(&mut self, scope: &mut dyn Scope, target: &str, data: &str) {
            self.note(scope, format!("pi:{target}:{data}"));
        }

        fn unparsed_entity_decl(&mut self, scope: &mut dyn Scope, name: &str, id: ExternalId<'_>, notation_name: &str) {
            self.note(scope, format!("unparsed:{name}:{:?}:{notation_name}", id.system_id));
        }

        fn entity_decl(&mut self, scope: &mut dyn Scope, decl: &EntityDeclaration<'_>) {
            let line = format!(
                "entity:{}:{:?}:{:?}:{:?}",
                decl.name, decl.value, decl.system_id, decl.notation_name
            );
            self.note(scope, line);
        }

        fn start_doctype_decl(
            &mut self,
            scope: &mut dyn Scope,
            name: &str,
            system_id: Option<&str>,
            _public_id: Option<&str>,
            has_internal_subset: bool,
        ) {
            self.note(scope, format!("doctype:{name}:{system_id:?}:{has_internal_subset}"));
        }

        fn end_doctype_decl(&mut self, scope: &mut dyn Scope) {
            self.note(scope, "/doctype".into());
        }

        fn xml_decl(&mut self, scope: &mut dyn Scope, version: Option<&str>, encoding: Option<&str>, standalone: Option<bool>) {
            self.note(scope, format!("xml:{version:?}:{encoding:?}:{standalone:?}"));
        }

        fn attlist_decl(&mut self, scope: &mut dyn Scope, decl: &AttlistDeclaration<'_>) {
            let line = format!(
                "attlist:{}:{}:{}:{:?}:{}",
                decl.element_name, decl.attribute_name, decl.attribute_type, decl.default, decl.is_required
            );
            self.note(scope, line);
        }

        fn skipped_entity(&mut self, scope: &mut dyn Scope, name: &str, _is_parameter_entity: bool) {
            self.note(scope, format!("skipped:{name}"));
        }

        fn element_decl(&mut self, scope: &mut dyn Scope, name: &str, model: NativeModel) {
            self.note(scope, format!("element:{name}:{:?}", model.root().kind));
            scope.free_content_model(model);
        }
    }

    /// Everything except the default callbacks
    fn content() -> EventSet {
        EventSet::all() - EventSet::DEFAULT - EventSet::DEFAULT_EXPAND
    }

    fn run_with(mut tokenizer: Tokenizer, mut trace: Trace, doc: &str) -> (Trace, Result<(), ErrorCode>) {
        tokenizer.register(trace.registered);
        let result = tokenizer.parse(doc.as_bytes(), true, &mut trace);
        (trace, result)
    }

    fn run(doc: &str) -> (Vec<String>, Result<(), ErrorCode>) {
        let trace = Trace {
            registered: content(),
            ..Trace::default()
        };
        let (trace, result) = run_with(Tokenizer::new(None), trace, doc);
        (trace.lines, result)
    }

    fn events(doc: &str) -> Vec<String> {
        let (lines, result) = run(doc);
        assert_eq!(result, Ok(()), "events so far: {lines:?}");
        lines
    }

    fn error(doc: &str) -> ErrorCode {
        run(doc).1.unwrap_err()
    }

    #[test]
    fn test_basic_document() {
        let lines = events("<?xml version=\"1.0\"?><root a=\"1\"><!--c--><?pi data?>hi<![CDATA[x<y]]></root>");
        assert_eq!(
            lines,
            vec![
                "xml:Some(\"1.0\"):None:None",
                "start:root a=1",
                "comment:c",
                "pi:pi:data",
                "text:hi",
                "cdata{",
                "text:x<y",
                "}cdata",
                "end:root",
            ]
        );
    }

    const FEED_END: &str = "|";

    /// Join adjacent text fragments the way a buffering session does,
    /// breaking runs at feed boundaries
    fn coalesced(lines: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut open = false;
        for line in lines {
            if line == FEED_END {
                open = false;
                continue;
            }
            match (line.strip_prefix("text:"), out.last_mut()) {
                (Some(text), Some(last)) if open => last.push_str(text),
                (Some(_), _) => {
                    out.push(line.clone());
                    open = true;
                }
                (None, _) => {
                    out.push(line.clone());
                    open = false;
                }
            }
        }
        out
    }

    fn without_feed_ends(lines: &[String]) -> Vec<String> {
        lines.iter().filter(|line| *line != FEED_END).cloned().collect()
    }

    #[test]
    fn test_chunking_does_not_change_events() {
        let doc = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE d [\n<!ENTITY e \"ent\">\n\
                   <!ATTLIST d x CDATA \"def\">\n]>\n<d a='1 &amp; 2'>t&e;x\r\ny&lt;z&#65;&#x42;<![CDATA[c]]>w&gt;\
                   <!--k--><?p q?><i/>é</d>\n";
        let (whole, result) = run(doc);
        assert_eq!(result, Ok(()));
        let joined = coalesced(&whole);

        let bytes = doc.as_bytes();
        for split in 1..bytes.len() {
            let mut trace = Trace {
                registered: content(),
                ..Trace::default()
            };
            let mut tokenizer = Tokenizer::new(None);
            tokenizer.register(content());
            tokenizer.parse(&bytes[..split], false, &mut trace).unwrap();
            trace.lines.push(FEED_END.into());
            tokenizer.parse(&bytes[split..], true, &mut trace).unwrap();
            assert_eq!(without_feed_ends(&trace.lines), whole, "split at {split}");
            assert_eq!(coalesced(&trace.lines), joined, "split at {split}");
        }

        let mut trace = Trace::default();
        let mut tokenizer = Tokenizer::new(None);
        tokenizer.register(content());
        for byte in bytes {
            tokenizer.parse(std::slice::from_ref(byte), false, &mut trace).unwrap();
            trace.lines.push(FEED_END.into());
        }
        tokenizer.parse(&[], true, &mut trace).unwrap();
        assert_eq!(without_feed_ends(&trace.lines), whole);
        assert_eq!(coalesced(&trace.lines), joined);
    }

    #[test]
    fn test_text_held_until_markup_follows() {
        let mut trace = Trace {
            registered: content(),
            ..Trace::default()
        };
        let mut tokenizer = Tokenizer::new(None);
        tokenizer.register(content());
        tokenizer.parse(b"<a>x&lt;", false, &mut trace).unwrap();
        assert_eq!(trace.lines, vec!["start:a"]);
        tokenizer.parse(b"y&#65;", false, &mut trace).unwrap();
        assert_eq!(trace.lines, vec!["start:a"]);
        tokenizer.parse(b"</a>", true, &mut trace).unwrap();
        assert_eq!(trace.lines, vec!["start:a", "text:x", "text:<", "text:y", "text:A", "end:a"]);
    }

    #[test]
    fn test_features_match_defaults() {
        let features = Tokenizer::FEATURES;
        let options = TokenizerOptions::default();
        assert_eq!(features.version, env!("CARGO_PKG_VERSION"));
        assert!(features.namespaces && features.dtd);
        assert_eq!(features.max_amplification, options.max_amplification);
        assert_eq!(features.amplification_threshold, options.amplification_threshold);
    }

    #[test]
    fn test_deep_content_model_rejected() {
        let depth = Tokenizer::FEATURES.max_model_depth;
        let model = |depth: usize| format!("{}b{}", "(".repeat(depth), ")".repeat(depth));
        let lines = events(&format!("<!DOCTYPE a [<!ELEMENT a {}>]><a/>", model(depth)));
        assert!(lines.contains(&"element:a:Sequence".to_string()));
        let doc = format!("<!DOCTYPE a [<!ELEMENT a {}>]><a/>", model(50_000));
        assert_eq!(error(&doc), ErrorCode::Syntax);
    }

    #[test]
    fn test_unclosed_token_position() {
        let mut tokenizer = Tokenizer::new(None);
        tokenizer.register(content());
        let result = tokenizer.parse(b"<a><", true, &mut Trace::default());
        assert_eq!(result, Err(ErrorCode::UnclosedToken));
        let at = tokenizer.position();
        assert_eq!((at.line, at.column, at.byte_index), (1, 3, 3));
    }

    #[test]
    fn test_no_elements() {
        assert_eq!(error(""), ErrorCode::NoElements);
        assert_eq!(error("<a>"), ErrorCode::NoElements);
        assert_eq!(error("<!-- only -->"), ErrorCode::NoElements);
    }

    #[test]
    fn test_newlines_are_separate_character_data() {
        assert_eq!(
            events("<a>x\r\ny\nz</a>"),
            vec!["start:a", "text:x", "text:\n", "text:y", "text:\n", "text:z", "end:a"]
        );
    }

    #[test]
    fn test_character_references() {
        assert_eq!(
            events("<a>&lt;&#65;&#x42;</a>"),
            vec!["start:a", "text:<", "text:A", "text:B", "end:a"]
        );
    }

    #[test]
    fn test_attribute_defaults_and_specified_count() {
        let trace = Trace {
            registered: content(),
            ..Trace::default()
        };
        let doc = "<!DOCTYPE a [<!ATTLIST a x CDATA \"dx\" y CDATA #IMPLIED z NMTOKEN \" t \">]><a y=\"1\"/>";
        let (trace, result) = run_with(Tokenizer::new(None), trace, doc);
        assert_eq!(result, Ok(()));
        assert_eq!(
            trace.lines,
            vec![
                "doctype:a:None:true",
                "attlist:a:x:CDATA:Some(\"dx\"):false",
                "attlist:a:y:CDATA:None:false",
                "attlist:a:z:NMTOKEN:Some(\"t\"):false",
                "/doctype",
                "start:a y=1 x=dx z=t",
                "end:a",
            ]
        );
        assert_eq!(trace.specified, vec![1]);
    }

    #[test]
    fn test_attribute_value_normalization() {
        assert_eq!(
            events("<a x=\"1&#9;2\t3\n4\" y=\"&lt;\"/>"),
            vec!["start:a x=1\t2 3 4 y=<", "end:a"]
        );
    }

    #[test]
    fn test_duplicate_attribute() {
        assert_eq!(error("<a x=\"1\" x=\"2\"/>"), ErrorCode::DuplicateAttribute);
    }

    #[test]
    fn test_internal_entity_expansion() {
        let trace = Trace {
            registered: content(),
            ..Trace::default()
        };
        let doc = "<!DOCTYPE a [<!ENTITY e \"<b>x</b>\">]><a>&e;</a>";
        let (trace, result) = run_with(Tokenizer::new(None), trace, doc);
        assert_eq!(result, Ok(()));
        assert_eq!(
            trace.lines,
            vec![
                "doctype:a:None:true",
                "entity:e:Some(\"<b>x</b>\"):None:None",
                "/doctype",
                "start:a",
                "start:b",
                "text:x",
                "end:b",
                "end:a",
            ]
        );
        let (pos, bytes) = trace.at("start:b");
        assert_eq!((pos.column, pos.byte_index, bytes), (40, 40, 0));
    }

    #[test]
    fn test_recursive_entity() {
        let doc = "<!DOCTYPE a [<!ENTITY e \"&f;\"><!ENTITY f \"&e;\">]><a>&e;</a>";
        assert_eq!(error(doc), ErrorCode::RecursiveEntityRef);
    }

    #[test]
    fn test_undefined_entity() {
        assert_eq!(error("<a>&u;</a>"), ErrorCode::UndefinedEntity);
        assert_eq!(
            events("<!DOCTYPE a SYSTEM \"a.dtd\"><a>&u;</a>"),
            vec![
                "doctype:a:Some(\"a.dtd\"):false",
                "not_standalone",
                "/doctype",
                "start:a",
                "skipped:u",
                "end:a",
            ]
        );
    }

    #[test]
    fn test_entity_must_be_balanced() {
        let doc = "<!DOCTYPE a [<!ENTITY e \"<b>\">]><a>&e;</b></a>";
        assert_eq!(error(doc), ErrorCode::AsyncEntity);
    }

    #[test]
    fn test_default_handler_inhibits_expansion() {
        let trace = Trace {
            registered: EventSet::START_ELEMENT | EventSet::END_ELEMENT | EventSet::DEFAULT,
            ..Trace::default()
        };
        let doc = "<!DOCTYPE a [<!ENTITY e \"x\">]><a>&e;</a>";
        let (trace, result) = run_with(Tokenizer::new(None), trace, doc);
        assert_eq!(result, Ok(()));
        assert_eq!(
            trace.lines,
            vec![
                "default:<!DOCTYPE a [",
                "default:<!ENTITY e \"x\">",
                "default:]>",
                "start:a",
                "default:&e;",
                "end:a",
            ]
        );

        let trace = Trace {
            registered: EventSet::START_ELEMENT | EventSet::END_ELEMENT | EventSet::DEFAULT | EventSet::DEFAULT_EXPAND,
            ..Trace::default()
        };
        let (trace, result) = run_with(Tokenizer::new(None), trace, doc);
        assert_eq!(result, Ok(()));
        assert_eq!(trace.lines[3..], ["start:a", "expand:x", "end:a"]);
    }

    #[test]
    fn test_empty_element_default_reporting() {
        let trace = Trace {
            registered: EventSet::DEFAULT,
            ..Trace::default()
        };
        let (trace, _) = run_with(Tokenizer::new(None), trace, "<a/>");
        assert_eq!(trace.lines, vec!["default:<a/>"]);

        let trace = Trace {
            registered: EventSet::DEFAULT | EventSet::END_ELEMENT,
            ..Trace::default()
        };
        let (trace, _) = run_with(Tokenizer::new(None), trace, "<a/>");
        assert_eq!(trace.lines, vec!["end:a"]);
        assert_eq!(trace.at("end:a").1, 0);
    }

    #[test]
    fn test_element_declaration() {
        let mut tokenizer = Tokenizer::new(None);
        tokenizer.register(content());
        let mut trace = Trace::default();
        tokenizer
            .parse(b"<!DOCTYPE a [<!ELEMENT a (b,c+)><!ELEMENT b (#PCDATA)>]><a/>", true, &mut trace)
            .unwrap();
        assert_eq!(trace.lines[1..3], ["element:a:Sequence", "element:b:Mixed"]);
        assert_eq!(tokenizer.outstanding_models, 0);
    }

    #[test]
    fn test_entity_and_notation_declarations() {
        let doc = "<!DOCTYPE a [<!NOTATION n SYSTEM \"n.bin\"><!ENTITY u SYSTEM \"u.bin\" NDATA n>\
                   <!ENTITY x SYSTEM \"x.xml\">]><a/>";
        assert_eq!(
            events(doc)[1..4],
            [
                "notation:n:Some(\"n.bin\")",
                "entity:u:None:Some(\"u.bin\"):Some(\"n\")",
                "entity:x:None:Some(\"x.xml\"):None",
            ]
        );

        let trace = Trace {
            registered: content() - EventSet::ENTITY_DECL,
            ..Trace::default()
        };
        let (trace, result) = run_with(Tokenizer::new(None), trace, doc);
        assert_eq!(result, Ok(()));
        assert_eq!(
            trace.lines[1..3],
            ["notation:n:Some(\"n.bin\")", "unparsed:u:Some(\"u.bin\"):n"]
        );
    }

    #[test]
    fn test_unparsed_entity_reference() {
        let dtd = "<!DOCTYPE a [<!NOTATION n SYSTEM \"n\"><!ENTITY u SYSTEM \"u\" NDATA n>]>";
        assert_eq!(error(&format!("{dtd}<a>&u;</a>")), ErrorCode::BinaryEntityRef);
        assert_eq!(error(&format!("{dtd}<a x=\"&u;\"/>")), ErrorCode::BinaryEntityRef);
    }

    #[test]
    fn test_external_entity_in_attribute() {
        let doc = "<!DOCTYPE a [<!ENTITY x SYSTEM \"x.xml\">]><a v=\"&x;\"/>";
        assert_eq!(error(doc), ErrorCode::AttributeExternalEntityRef);
    }

    #[test]
    fn test_namespaces() {
        let doc = "<r xmlns=\"urn:d\" xmlns:p=\"urn:p\"><p:c p:x=\"1\" y=\"2\"/></r>";
        let trace = Trace {
            registered: content(),
            ..Trace::default()
        };
        let (trace, result) = run_with(Tokenizer::new(Some('|')), trace, doc);
        assert_eq!(result, Ok(()));
        assert_eq!(
            trace.lines,
            vec![
                "ns:=urn:d",
                "ns:p=urn:p",
                "start:urn:d|r",
                "start:urn:p|c urn:p|x=1 y=2",
                "end:urn:p|c",
                "end:urn:d|r",
                "/ns:p",
                "/ns:",
            ]
        );
        assert_eq!(trace.specified, vec![0, 2]);

        let trace = Trace {
            registered: EventSet::START_ELEMENT,
            ..Trace::default()
        };
        let mut tokenizer = Tokenizer::new(Some('|'));
        tokenizer.set_return_ns_triplet(true);
        let (trace, _) = run_with(tokenizer, trace, doc);
        assert_eq!(trace.lines[1], "start:urn:p|c|p urn:p|x|p=1 y=2");
    }

    #[test]
    fn test_unbound_prefix() {
        let trace = Trace::default();
        let (_, result) = run_with(Tokenizer::new(Some(' ')), trace, "<p:a/>");
        assert_eq!(result, Err(ErrorCode::UnboundPrefix));
    }

    #[test]
    fn test_not_standalone() {
        let trace = Trace {
            registered: content(),
            refuse_standalone: true,
            ..Trace::default()
        };
        let (_, result) = run_with(Tokenizer::new(None), trace, "<!DOCTYPE a SYSTEM \"a.dtd\"><a/>");
        assert_eq!(result, Err(ErrorCode::NotStandalone));

        let trace = Trace {
            registered: content(),
            refuse_standalone: true,
            ..Trace::default()
        };
        let doc = "<?xml version=\"1.0\" standalone=\"yes\"?><!DOCTYPE a SYSTEM \"a.dtd\"><a/>";
        let (trace, result) = run_with(Tokenizer::new(None), trace, doc);
        assert_eq!(result, Ok(()));
        assert!(!trace.lines.iter().any(|line| line == "not_standalone"));
    }

    #[test]
    fn test_parameter_entity_reference_stops_declarations() {
        assert_eq!(
            events("<!DOCTYPE a [%p;<!ENTITY e \"x\">]><a>&e;</a>"),
            vec![
                "doctype:a:None:true",
                "not_standalone",
                "/doctype",
                "start:a",
                "skipped:e",
                "end:a",
            ]
        );
    }

    #[test]
    fn test_external_entity_child() {
        let doc = "<!DOCTYPE a [<!ENTITY x SYSTEM \"x.xml\">]><a>&x;</a>";
        let trace = Trace {
            registered: content(),
            external: Some(b"<?xml encoding=\"UTF-8\"?><b>in</b>tail"),
            ..Trace::default()
        };
        let (trace, result) = run_with(Tokenizer::new(None), trace, doc);
        assert_eq!(result, Ok(()));
        assert_eq!(
            trace.lines[3..],
            [
                "start:a",
                "external:x:Some(\"x.xml\")",
                "xml:None:Some(\"UTF-8\"):None",
                "start:b",
                "text:in",
                "end:b",
                "text:tail",
                "end:a",
            ]
        );

        let trace = Trace {
            registered: content(),
            reject: true,
            ..Trace::default()
        };
        let (_, result) = run_with(Tokenizer::new(None), trace, doc);
        assert_eq!(result, Err(ErrorCode::ExternalEntityHandling));
    }

    #[test]
    fn test_child_entity_must_be_balanced() {
        let doc = "<!DOCTYPE a [<!ENTITY x SYSTEM \"x.xml\">]><a>&x;</a>";
        let trace = Trace {
            registered: content(),
            external: Some(b"<b>"),
            ..Trace::default()
        };
        let (_, result) = run_with(Tokenizer::new(None), trace, doc);
        assert_eq!(result, Err(ErrorCode::ExternalEntityHandling));
    }

    #[test]
    fn test_stop_aborts_and_finishes() {
        let mut tokenizer = Tokenizer::new(None);
        assert!(!tokenizer.stop());
        tokenizer.register(content());
        let mut trace = Trace {
            stop_on: Some("b"),
            ..Trace::default()
        };
        let result = tokenizer.parse(b"<a><b/><c/></a>", true, &mut trace);
        assert_eq!(result, Err(ErrorCode::Aborted));
        assert_eq!(trace.lines, vec!["start:a", "start:b", "stop:true"]);
        assert_eq!(tokenizer.parse(b"", true, &mut trace), Err(ErrorCode::Finished));
    }

    #[test]
    fn test_errors_are_sticky() {
        let mut tokenizer = Tokenizer::new(None);
        let mut trace = Trace::default();
        assert_eq!(tokenizer.parse(b"<a></b>", false, &mut trace), Err(ErrorCode::TagMismatch));
        assert_eq!(tokenizer.parse(b"</a>", true, &mut trace), Err(ErrorCode::TagMismatch));
        assert_eq!(tokenizer.error_code(), Some(ErrorCode::TagMismatch));
        assert_eq!(tokenizer.position().column, 5);
    }

    #[test]
    fn test_finished_after_final_chunk() {
        let mut tokenizer = Tokenizer::new(None);
        let mut trace = Trace::default();
        assert_eq!(tokenizer.parse(b"<a/>", true, &mut trace), Ok(()));
        assert_eq!(tokenizer.parse(b"", true, &mut trace), Err(ErrorCode::Finished));
    }

    #[test]
    fn test_amplification_limit() {
        let doc = format!(
            "<!DOCTYPE a [<!ENTITY e \"{}\">]><a>{}</a>",
            "x".repeat(100),
            "&e;".repeat(50)
        );
        assert_eq!(run(&doc).1, Ok(()));

        let mut tokenizer = Tokenizer::new(None);
        assert!(!tokenizer.set_max_amplification(0.5));
        assert!(!tokenizer.set_max_amplification(f32::NAN));
        assert!(tokenizer.set_max_amplification(2.0));
        assert!(tokenizer.set_amplification_threshold(0));
        let (_, result) = run_with(tokenizer, Trace::default(), &doc);
        assert_eq!(result, Err(ErrorCode::AmplificationLimitBreach));
    }

    #[test]
    fn test_child_cannot_change_amplification() {
        let mut child = Tokenizer::new(None).child();
        assert!(!child.set_max_amplification(10.0));
        assert!(!child.set_amplification_threshold(10));
    }

    #[test]
    fn test_latin1_input() {
        let mut doc = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><a>".to_vec();
        doc.push(0xE9);
        doc.extend_from_slice(b"</a>");
        let mut tokenizer = Tokenizer::new(None);
        tokenizer.register(EventSet::CHARACTER_DATA);
        let mut trace = Trace::default();
        assert_eq!(tokenizer.parse(&doc, true, &mut trace), Ok(()));
        assert_eq!(trace.lines, vec!["text:é"]);
    }

    #[test]
    fn test_utf16_is_unsupported() {
        let mut tokenizer = Tokenizer::new(None);
        let result = tokenizer.parse(&[0xFF, 0xFE, b'<', 0], true, &mut Trace::default());
        assert_eq!(result, Err(ErrorCode::UnknownEncoding));
    }

    #[test]
    fn test_epilog_errors() {
        assert_eq!(error("<a/>x"), ErrorCode::JunkAfterDocElement);
        assert_eq!(error("<a/><b/>"), ErrorCode::JunkAfterDocElement);
        assert_eq!(error("<a/><?xml version=\"1.0\"?>"), ErrorCode::MisplacedXmlPi);
        assert_eq!(error("<?XML x?><a/>"), ErrorCode::InvalidToken);
        assert_eq!(events("<a/><!--after-->\n"), vec!["start:a", "end:a", "comment:after"]);
    }

    #[test]
    fn test_markup_errors() {
        assert_eq!(error("text<a/>"), ErrorCode::InvalidToken);
        assert_eq!(error("<a>x]]>y</a>"), ErrorCode::InvalidToken);
        assert_eq!(error("<a><!-- a -- b --></a>"), ErrorCode::InvalidToken);
        assert_eq!(error("<a><![CDATA[open"), ErrorCode::UnclosedCdataSection);
        assert_eq!(error("<!DOCTYPE a><!DOCTYPE a><a/>"), ErrorCode::Syntax);
    }

    #[test]
    fn test_positions_and_byte_counts() {
        let trace = Trace {
            registered: content(),
            ..Trace::default()
        };
        let (trace, result) = run_with(Tokenizer::new(None), trace, "<a>\n  <b>x</b></a>");
        assert_eq!(result, Ok(()));
        let (pos, bytes) = trace.at("start:b");
        assert_eq!((pos.line, pos.column, pos.byte_index, bytes), (2, 2, 6, 3));
        let (pos, bytes) = trace.at("end:b");
        assert_eq!((pos.column, bytes), (6, 4));
    }
}
