//! Test doubles shared by the unit tests
//!
//! [`ScriptedEngine`] replays a fixed list of engine callbacks per `parse`
//! call and counts what the session does to it in a shared [`Ledger`].

use crate::engine::{
    ContentKind, Engine, EntityResolution, ErrorCode, EventHandler, EventSet, ExternalId, ModelParticle, NativeModel,
    Position, Quantifier, Scope,
};
use crate::sax::{Callbacks, Event, EventKind};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// One scripted engine callback
#[derive(Debug)]
pub enum Step {
    Text(String),
    Comment(String),
    /// Name, attributes, number of specified attributes
    Start(String, Vec<(String, String)>, usize),
    End(String),
    ElementDecl(String, NativeModel),
    /// Context, system id
    ExternalEntity(String, String),
    NotStandalone,
    Fail(ErrorCode),
}

#[derive(Default)]
struct Counters {
    stops: Cell<usize>,
    models_freed: Cell<usize>,
    children_created: Cell<usize>,
    engines_released: Cell<usize>,
    refuse_children: Cell<bool>,
    registered: Cell<EventSet>,
    child_scripts: RefCell<VecDeque<Vec<Vec<Step>>>>,
    resolutions: RefCell<Vec<EntityResolution>>,
}

/// Observations shared by a scripted engine and all of its children
#[derive(Clone, Default)]
pub struct Ledger(Rc<Counters>);

impl Ledger {
    pub fn stops(&self) -> usize {
        self.0.stops.get()
    }

    pub fn models_freed(&self) -> usize {
        self.0.models_freed.get()
    }

    pub fn children_created(&self) -> usize {
        self.0.children_created.get()
    }

    pub fn engines_released(&self) -> usize {
        self.0.engines_released.get()
    }

    /// Last event set registered by any engine of this ledger
    pub fn registered(&self) -> EventSet {
        self.0.registered.get()
    }

    pub fn resolutions(&self) -> Vec<EntityResolution> {
        self.0.resolutions.borrow().clone()
    }

    /// Queue the script of the next child engine
    pub fn push_child_script(&self, script: Vec<Vec<Step>>) {
        self.0.child_scripts.borrow_mut().push_back(script);
    }

    /// Make `create_child` fail from now on
    pub fn refuse_children(&self) {
        self.0.refuse_children.set(true);
    }
}

pub struct ScriptedEngine {
    script: VecDeque<Vec<Step>>,
    ledger: Ledger,
    registered: EventSet,
    parsing: bool,
    stopped: bool,
    specified: usize,
    base: Option<String>,
}

impl ScriptedEngine {
    /// Each inner vector is replayed by one `parse` call
    pub fn new(script: Vec<Vec<Step>>) -> (ScriptedEngine, Ledger) {
        let ledger = Ledger::default();
        (ScriptedEngine::with_ledger(script, ledger.clone()), ledger)
    }

    fn with_ledger(script: Vec<Vec<Step>>, ledger: Ledger) -> ScriptedEngine {
        ScriptedEngine {
            script: script.into(),
            ledger,
            registered: EventSet::empty(),
            parsing: false,
            stopped: false,
            specified: 0,
            base: None,
        }
    }

    fn wants(&self, event: EventSet) -> bool {
        self.registered.contains(event)
    }

    fn replay(&mut self, steps: Vec<Step>, handler: &mut dyn EventHandler) -> Result<(), ErrorCode> {
        for step in steps {
            if self.stopped {
                return Err(ErrorCode::Aborted);
            }
            match step {
                Step::Text(text) if self.wants(EventSet::CHARACTER_DATA) => handler.character_data(self, &text),
                Step::Comment(text) if self.wants(EventSet::COMMENT) => handler.comment(self, &text),
                Step::Start(name, attributes, specified) if self.wants(EventSet::START_ELEMENT) => {
                    self.specified = specified;
                    handler.start_element(self, &name, &attributes);
                }
                Step::End(name) if self.wants(EventSet::END_ELEMENT) => handler.end_element(self, &name),
                Step::ElementDecl(name, model) => {
                    if self.wants(EventSet::ELEMENT_DECL) {
                        handler.element_decl(self, &name, model);
                    } else {
                        self.free_content_model(model);
                    }
                }
                Step::ExternalEntity(context, system_id) if self.wants(EventSet::EXTERNAL_ENTITY_REF) => {
                    let base = self.base.clone();
                    let id = ExternalId {
                        base: base.as_deref(),
                        system_id: Some(&system_id),
                        public_id: None,
                    };
                    let resolution = handler.external_entity_ref(self, &context, id);
                    self.ledger.0.resolutions.borrow_mut().push(resolution);
                    if resolution == EntityResolution::Reject {
                        return Err(ErrorCode::ExternalEntityHandling);
                    }
                }
                Step::NotStandalone if self.wants(EventSet::NOT_STANDALONE) => {
                    if !handler.not_standalone(self) {
                        return Err(ErrorCode::NotStandalone);
                    }
                }
                Step::Fail(code) => return Err(code),
                _ => {}
            }
        }
        if self.stopped {
            return Err(ErrorCode::Aborted);
        }
        Ok(())
    }
}

impl Scope for ScriptedEngine {
    fn position(&self) -> Position {
        Position::START
    }

    fn current_byte_count(&self) -> usize {
        0
    }

    fn specified_attribute_count(&self) -> usize {
        self.specified
    }

    fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    fn stop(&mut self) -> bool {
        let counters = &self.ledger.0;
        counters.stops.set(counters.stops.get() + 1);
        if self.parsing {
            self.stopped = true;
        }
        self.parsing
    }

    fn free_content_model(&mut self, _model: NativeModel) {
        let counters = &self.ledger.0;
        counters.models_freed.set(counters.models_freed.get() + 1);
    }

    fn create_child(&mut self, _context: &str) -> Option<Box<dyn Engine>> {
        let counters = &self.ledger.0;
        if counters.refuse_children.get() {
            return None;
        }
        counters.children_created.set(counters.children_created.get() + 1);
        let script = counters.child_scripts.borrow_mut().pop_front().unwrap_or_default();
        let mut child = ScriptedEngine::with_ledger(script, self.ledger.clone());
        child.base = self.base.clone();
        Some(Box::new(child))
    }
}

impl Engine for ScriptedEngine {
    fn register(&mut self, events: EventSet) {
        self.registered = events;
        self.ledger.0.registered.set(events);
    }

    fn parse(&mut self, _data: &[u8], _is_final: bool, handler: &mut dyn EventHandler) -> Result<(), ErrorCode> {
        let steps = self.script.pop_front().unwrap_or_default();
        self.parsing = true;
        let outcome = self.replay(steps, handler);
        self.parsing = false;
        outcome
    }

    fn error_code(&self) -> Option<ErrorCode> {
        None
    }

    fn set_encoding(&mut self, _encoding: &str) {}

    fn set_return_ns_triplet(&mut self, _enabled: bool) {}

    fn set_base(&mut self, base: &str) -> bool {
        self.base = Some(base.to_string());
        true
    }

    fn set_max_amplification(&mut self, ratio: f32) -> bool {
        !ratio.is_nan() && ratio >= 1.0
    }

    fn set_amplification_threshold(&mut self, _bytes: u64) -> bool {
        true
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        let counters = &self.ledger.0;
        counters.engines_released.set(counters.engines_released.get() + 1);
    }
}

/// `(b, c+)`
pub fn sequence_b_c_plus() -> NativeModel {
    let leaf = |name: &str, quantifier| ModelParticle {
        kind: ContentKind::Name,
        quantifier,
        name: Some(name.to_string()),
        children: 0..0,
    };
    NativeModel::from_particles(vec![
        ModelParticle {
            kind: ContentKind::Sequence,
            quantifier: Quantifier::None,
            name: None,
            children: 1..3,
        },
        leaf("b", Quantifier::None),
        leaf("c", Quantifier::OneOrMore),
    ])
}

/// Simplified view of a dispatched event
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Text(String),
    Comment(String),
    /// Name, specified attributes in document order
    Start(String, Vec<(String, String)>),
    End(String),
    /// Name, kind, quantifier, number of children
    ElementDecl(String, String, Option<Quantifier>, usize),
    Other(EventKind),
}

impl Recorded {
    fn of(event: &Event<'_>) -> Recorded {
        match *event {
            Event::CharacterData(text) => Recorded::Text(text.to_string()),
            Event::Comment(text) => Recorded::Comment(text.to_string()),
            Event::StartElement { name, attributes } => {
                let specified = attributes
                    .specified()
                    .iter()
                    .map(|n| (n.clone(), attributes.get(n).unwrap_or_default().to_string()))
                    .collect();
                Recorded::Start(name.to_string(), specified)
            }
            Event::EndElement { name } => Recorded::End(name.to_string()),
            Event::ElementDecl {
                name,
                kind,
                quantifier,
                children,
            } => Recorded::ElementDecl(
                name.to_string(),
                kind.as_str().to_string(),
                quantifier,
                children.map_or(0, |c| c.len()),
            ),
            ref other => Recorded::Other(other.kind()),
        }
    }
}

pub type Log = Rc<RefCell<Vec<Recorded>>>;

/// A table recording `kinds` into a shared log
pub fn recorder(kinds: &[EventKind]) -> (Log, Callbacks) {
    recorder_into(Callbacks::new(), kinds)
}

/// Add recording handlers for `kinds` to an existing table
pub fn recorder_into(mut table: Callbacks, kinds: &[EventKind]) -> (Log, Callbacks) {
    let log: Log = Rc::default();
    for &kind in kinds {
        let sink = Rc::clone(&log);
        table = table.on(kind, move |_, event| {
            sink.borrow_mut().push(Recorded::of(event));
            Ok(())
        });
    }
    (log, table)
}
