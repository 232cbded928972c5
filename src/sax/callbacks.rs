//! Host Handler Table
//!
//! Maps handler-table keys to host handlers. A table is shared as
//! `Rc<Callbacks>` by a session and every sub-parser it spawns, and the
//! dispatch core only ever reads it.

use super::events::{EntityRef, Event, EventKind};
use crate::engine::{EventSet, Location, Scope};
use crate::error::{Error, HandlerError, Result};
use crate::parser::Parser;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Key that disables key validation
pub const NON_STRICT_KEY: &str = "_nonstrict";

/// What a handler returns
pub type HandlerResult<T = ()> = std::result::Result<T, HandlerError>;

pub type NotifyFn = dyn Fn(&mut Context<'_>, &Event<'_>) -> HandlerResult;
pub type DecideFn = dyn Fn(&mut Context<'_>) -> HandlerResult<bool>;
pub type EntityFn = dyn Fn(&mut Context<'_>, &mut Parser, &EntityRef<'_>) -> HandlerResult<bool>;

/// An invocable handler. The shape must match the event it is bound to:
/// `Decide` for NotStandalone, `Entity` for ExternalEntityRef, `Notify`
/// for everything else.
#[derive(Clone)]
pub enum Handler {
    Notify(Rc<NotifyFn>),
    Decide(Rc<DecideFn>),
    Entity(Rc<EntityFn>),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Notify(_) => f.write_str("Handler::Notify"),
            Handler::Decide(_) => f.write_str("Handler::Decide"),
            Handler::Entity(_) => f.write_str("Handler::Entity"),
        }
    }
}

/// One value stored in the table
#[derive(Debug, Clone)]
pub enum Entry {
    Handler(Handler),
    /// A plain flag. `false` reads as "no handler"; `true` under an event
    /// key is a handler that cannot be invoked.
    Flag(bool),
}

/// The host's key → handler table
#[derive(Default, Clone)]
pub struct Callbacks {
    entries: HashMap<String, Entry>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("Callbacks").field("keys", &keys).finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an ordinary event
    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&mut Context<'_>, &Event<'_>) -> HandlerResult + 'static,
    {
        self.set(kind.as_str(), Entry::Handler(Handler::Notify(Rc::new(handler))));
        self
    }

    /// Register the NotStandalone handler; its result is the engine's
    /// accept/reject decision
    pub fn on_not_standalone<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Context<'_>) -> HandlerResult<bool> + 'static,
    {
        self.set(
            EventKind::NotStandalone.as_str(),
            Entry::Handler(Handler::Decide(Rc::new(handler))),
        );
        self
    }

    /// Register the ExternalEntityRef handler. It receives a fresh child
    /// parser for the entity and reports whether the entity was handled.
    pub fn on_external_entity<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Context<'_>, &mut Parser, &EntityRef<'_>) -> HandlerResult<bool> + 'static,
    {
        self.set(
            EventKind::ExternalEntityRef.as_str(),
            Entry::Handler(Handler::Entity(Rc::new(handler))),
        );
        self
    }

    /// Accept keys outside the recognized set
    pub fn non_strict(mut self) -> Self {
        self.set(NON_STRICT_KEY, Entry::Flag(true));
        self
    }

    /// Store any value under any key; returns the previous value
    pub fn set(&mut self, key: impl Into<String>, entry: Entry) -> Option<Entry> {
        self.entries.insert(key.into(), entry)
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Whether a key holds any value, `false` flags included
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Reject unrecognized keys unless the table opts out
    pub fn validate(&self) -> Result<()> {
        if self.contains(NON_STRICT_KEY) {
            return Ok(());
        }
        match self.keys().find(|key| key.parse::<EventKind>().is_err()) {
            Some(key) => Err(Error::InvalidCallbackKey(key.to_string())),
            None => Ok(()),
        }
    }

    /// Engine callbacks needed for the keys present in this table
    pub fn registrations(&self) -> EventSet {
        EventKind::ALL
            .iter()
            .filter(|kind| self.contains(kind.as_str()))
            .fold(EventSet::empty(), |set, kind| set | kind.registration())
    }

    fn lookup(&self, kind: EventKind) -> Result<Option<&Handler>> {
        match self.entries.get(kind.as_str()) {
            None | Some(Entry::Flag(false)) => Ok(None),
            Some(Entry::Flag(true)) => Err(Error::NotCallable(kind)),
            Some(Entry::Handler(handler)) => Ok(Some(handler)),
        }
    }

    pub(crate) fn notify_handler(&self, kind: EventKind) -> Result<Option<Rc<NotifyFn>>> {
        match self.lookup(kind)? {
            None => Ok(None),
            Some(Handler::Notify(f)) => Ok(Some(Rc::clone(f))),
            Some(_) => Err(Error::NotCallable(kind)),
        }
    }

    pub(crate) fn decide_handler(&self) -> Result<Option<Rc<DecideFn>>> {
        match self.lookup(EventKind::NotStandalone)? {
            None => Ok(None),
            Some(Handler::Decide(f)) => Ok(Some(Rc::clone(f))),
            Some(_) => Err(Error::NotCallable(EventKind::NotStandalone)),
        }
    }

    pub(crate) fn entity_handler(&self) -> Result<Option<Rc<EntityFn>>> {
        match self.lookup(EventKind::ExternalEntityRef)? {
            None => Ok(None),
            Some(Handler::Entity(f)) => Ok(Some(Rc::clone(f))),
            Some(_) => Err(Error::NotCallable(EventKind::ExternalEntityRef)),
        }
    }
}

/// The session as a handler sees it: first argument of every call.
pub struct Context<'a> {
    scope: &'a mut dyn Scope,
    callbacks: &'a Rc<Callbacks>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(scope: &'a mut dyn Scope, callbacks: &'a Rc<Callbacks>) -> Self {
        Context { scope, callbacks }
    }

    /// Location of the event being dispatched
    pub fn pos(&self) -> Location {
        self.scope.position().into()
    }

    /// Input bytes making up the event being dispatched
    pub fn current_byte_count(&self) -> usize {
        self.scope.current_byte_count()
    }

    pub fn base(&self) -> Option<&str> {
        self.scope.base()
    }

    /// Ask the engine to halt; the running feed then fails with
    /// "parsing aborted"
    pub fn stop(&mut self) -> bool {
        self.scope.stop()
    }

    /// The table this handler was found in
    pub fn callbacks(&self) -> &Rc<Callbacks> {
        self.callbacks
    }
}
