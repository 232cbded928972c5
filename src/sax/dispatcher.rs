//! Event Dispatcher
//!
//! The [`EventHandler`] a session hands to its engine. For every engine
//! callback it:
//!
//! 1. discharges coalesced character data, so text always precedes the
//!    event that ended it
//! 2. does nothing once a handler failure is latched
//! 3. looks the handler up in the shared table
//! 4. builds the event arguments and invokes the handler
//! 5. latches the handler's failure, if any
//!
//! A handler that is present but cannot be invoked is a usage error: it is
//! recorded as a fault, the engine is stopped, and the session reports the
//! fault instead of a latched failure.

use super::buffer::TextBuffer;
use super::callbacks::{Callbacks, Context, NotifyFn};
use super::content::ModelGuard;
use super::events::{AttributeList, EntityRef, Event, EventKind};
use super::subparser;
use crate::engine::{
    AttlistDeclaration, EntityDeclaration, EntityResolution, EventHandler, ExternalId, NativeModel, Scope,
};
use crate::error::{Error, HandlerError, Result};
use crate::parser::State;
use std::rc::Rc;

pub struct Dispatcher {
    callbacks: Rc<Callbacks>,
    buffering: bool,
    state: State,
    /// Latched handler failure, re-raised when the feed returns
    pending: Option<Error>,
    /// Usage error detected while the engine was running
    fault: Option<Error>,
    text: TextBuffer,
}

impl Dispatcher {
    pub fn new(callbacks: Rc<Callbacks>, buffering: bool) -> Self {
        Dispatcher {
            callbacks,
            buffering,
            state: State::Pre,
            pending: None,
            fault: None,
            text: TextBuffer::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn callbacks(&self) -> &Rc<Callbacks> {
        &self.callbacks
    }

    #[inline]
    pub fn buffering(&self) -> bool {
        self.buffering
    }

    /// Enter ACTIVE for one feed cycle
    pub fn begin_cycle(&mut self) {
        self.state = State::Active;
        self.pending = None;
        self.fault = None;
    }

    /// Close a feed cycle once the engine has returned: flush pending text,
    /// then surface a fault or a latched handler failure.
    pub fn end_cycle(&mut self, scope: &mut dyn Scope) -> Result<()> {
        if self.state == State::StringPending {
            self.discharge(scope);
        }
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }
        match self.pending.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Enter FINISHED
    pub fn finish(&mut self) {
        self.state = State::Finished;
    }

    fn discharge(&mut self, scope: &mut dyn Scope) {
        self.state = State::Active;
        if let Some((handler, text)) = self.text.take() {
            self.call(&*handler, scope, &Event::CharacterData(&text));
        }
    }

    /// Steps 1 and 2: flush text, then report whether dispatch may go on
    fn ready(&mut self, scope: &mut dyn Scope) -> bool {
        if self.state == State::StringPending {
            self.discharge(scope);
        }
        self.state != State::ErrorLatched && self.fault.is_none()
    }

    fn notify(&mut self, kind: EventKind, scope: &mut dyn Scope) -> Option<Rc<NotifyFn>> {
        if !self.ready(scope) {
            return None;
        }
        match self.callbacks.notify_handler(kind) {
            Ok(handler) => handler,
            Err(err) => {
                self.record_fault(err, scope);
                None
            }
        }
    }

    fn record_fault(&mut self, err: Error, scope: &mut dyn Scope) {
        log::debug!("stopping engine: {}", err);
        self.fault = Some(err);
        scope.stop();
    }

    fn latch(&mut self, err: HandlerError) {
        let err = Error::from_handler(err);
        log::debug!("handler failed, suppressing dispatch: {}", err);
        self.pending = Some(err);
        self.state = State::ErrorLatched;
    }

    fn call(&mut self, handler: &NotifyFn, scope: &mut dyn Scope, event: &Event<'_>) {
        log::trace!("dispatching {}", event.kind());
        let mut cx = Context::new(scope, &self.callbacks);
        let outcome = handler(&mut cx, event);
        if let Err(err) = outcome {
            self.latch(err);
        }
    }

    fn emit(&mut self, scope: &mut dyn Scope, event: Event<'_>) {
        if let Some(handler) = self.notify(event.kind(), scope) {
            self.call(&*handler, scope, &event);
        }
    }
}

impl EventHandler for Dispatcher {
    fn start_cdata_section(&mut self, scope: &mut dyn Scope) {
        self.emit(scope, Event::StartCdataSection);
    }

    fn end_cdata_section(&mut self, scope: &mut dyn Scope) {
        self.emit(scope, Event::EndCdataSection);
    }

    fn character_data(&mut self, scope: &mut dyn Scope, text: &str) {
        if self.state == State::Active {
            let Some(handler) = self.notify(EventKind::CharacterData, scope) else {
                return;
            };
            if self.buffering {
                self.state = State::StringPending;
                self.text.begin(handler);
            } else {
                self.call(&*handler, scope, &Event::CharacterData(text));
            }
        }
        if self.state == State::StringPending {
            self.text.push(text);
        }
    }

    fn comment(&mut self, scope: &mut dyn Scope, text: &str) {
        self.emit(scope, Event::Comment(text));
    }

    fn default_text(&mut self, scope: &mut dyn Scope, text: &str) {
        self.emit(scope, Event::Default(text));
    }

    fn default_expand(&mut self, scope: &mut dyn Scope, text: &str) {
        self.emit(scope, Event::DefaultExpand(text));
    }

    fn start_element(&mut self, scope: &mut dyn Scope, name: &str, attributes: &[(String, String)]) {
        let Some(handler) = self.notify(EventKind::StartElement, scope) else {
            return;
        };
        let list = AttributeList::from_engine(attributes, scope.specified_attribute_count());
        self.call(&*handler, scope, &Event::StartElement { name, attributes: &list });
    }

    fn end_element(&mut self, scope: &mut dyn Scope, name: &str) {
        self.emit(scope, Event::EndElement { name });
    }

    fn external_entity_ref(&mut self, scope: &mut dyn Scope, context: &str, id: ExternalId<'_>) -> EntityResolution {
        if !self.ready(scope) {
            return EntityResolution::Decline;
        }
        let handler = match self.callbacks.entity_handler() {
            Ok(Some(handler)) => handler,
            Ok(None) => return EntityResolution::Decline,
            Err(err) => {
                self.record_fault(err, scope);
                return EntityResolution::Decline;
            }
        };
        let entity = EntityRef {
            base: id.base,
            system_id: id.system_id.unwrap_or_default(),
            public_id: id.public_id,
        };
        match subparser::resolve(scope, &self.callbacks, self.buffering, &*handler, context, &entity) {
            Ok(Ok(true)) => EntityResolution::Accept,
            Ok(Ok(false)) => EntityResolution::Reject,
            Ok(Err(err)) => {
                self.latch(err);
                EntityResolution::Reject
            }
            Err(err) => {
                self.record_fault(err, scope);
                EntityResolution::Reject
            }
        }
    }

    fn start_namespace_decl(&mut self, scope: &mut dyn Scope, prefix: Option<&str>, uri: Option<&str>) {
        self.emit(scope, Event::StartNamespaceDecl { prefix, uri });
    }

    fn end_namespace_decl(&mut self, scope: &mut dyn Scope, prefix: Option<&str>) {
        self.emit(scope, Event::EndNamespaceDecl { prefix });
    }

    fn notation_decl(&mut self, scope: &mut dyn Scope, name: &str, id: ExternalId<'_>) {
        self.emit(
            scope,
            Event::NotationDecl {
                name,
                base: id.base,
                system_id: id.system_id,
                public_id: id.public_id,
            },
        );
    }

    fn not_standalone(&mut self, scope: &mut dyn Scope) -> bool {
        if !self.ready(scope) {
            return true;
        }
        let handler = match self.callbacks.decide_handler() {
            Ok(Some(handler)) => handler,
            Ok(None) => return true,
            Err(err) => {
                self.record_fault(err, scope);
                return false;
            }
        };
        log::trace!("dispatching {}", EventKind::NotStandalone);
        let mut cx = Context::new(scope, &self.callbacks);
        let outcome = handler(&mut cx);
        match outcome {
            Ok(accept) => accept,
            Err(err) => {
                self.latch(err);
                false
            }
        }
    }

    fn processing_instruction(&mut self, scope: &mut dyn Scope, target: &str, data: &str) {
        self.emit(scope, Event::ProcessingInstruction { target, data });
    }

    fn unparsed_entity_decl(&mut self, scope: &mut dyn Scope, name: &str, id: ExternalId<'_>, notation_name: &str) {
        self.emit(
            scope,
            Event::UnparsedEntityDecl {
                name,
                base: id.base,
                system_id: id.system_id,
                public_id: id.public_id,
                notation_name,
            },
        );
    }

    fn entity_decl(&mut self, scope: &mut dyn Scope, decl: &EntityDeclaration<'_>) {
        self.emit(
            scope,
            Event::EntityDecl {
                name: decl.name,
                is_parameter_entity: decl.is_parameter_entity,
                value: decl.value,
                base: decl.base,
                system_id: decl.system_id,
                public_id: decl.public_id,
                notation_name: decl.notation_name,
            },
        );
    }

    fn start_doctype_decl(
        &mut self,
        scope: &mut dyn Scope,
        name: &str,
        system_id: Option<&str>,
        public_id: Option<&str>,
        has_internal_subset: bool,
    ) {
        self.emit(
            scope,
            Event::StartDoctypeDecl {
                name,
                system_id,
                public_id,
                has_internal_subset,
            },
        );
    }

    fn end_doctype_decl(&mut self, scope: &mut dyn Scope) {
        self.emit(scope, Event::EndDoctypeDecl);
    }

    fn xml_decl(&mut self, scope: &mut dyn Scope, version: Option<&str>, encoding: Option<&str>, standalone: Option<bool>) {
        self.emit(
            scope,
            Event::XmlDecl {
                version,
                encoding,
                standalone,
            },
        );
    }

    fn attlist_decl(&mut self, scope: &mut dyn Scope, decl: &AttlistDeclaration<'_>) {
        self.emit(
            scope,
            Event::AttlistDecl {
                element_name: decl.element_name,
                attribute_name: decl.attribute_name,
                attribute_type: decl.attribute_type,
                default: decl.default,
                is_required: decl.is_required,
            },
        );
    }

    fn skipped_entity(&mut self, scope: &mut dyn Scope, name: &str, is_parameter_entity: bool) {
        self.emit(
            scope,
            Event::SkippedEntity {
                name,
                is_parameter_entity,
            },
        );
    }

    fn element_decl(&mut self, scope: &mut dyn Scope, name: &str, model: NativeModel) {
        let handler = self.notify(EventKind::ElementDecl, scope);
        let tree = {
            let guard = ModelGuard::new(scope, model);
            match handler {
                Some(_) => guard.translate(),
                None => None,
            }
        };
        if let (Some(handler), Some(tree)) = (handler, tree) {
            let event = Event::ElementDecl {
                name,
                kind: tree.kind,
                quantifier: tree.quantifier,
                children: tree.children(),
            };
            self.call(&*handler, scope, &event);
        }
    }
}
