//! External-Entity Sub-Parsers
//!
//! An ExternalEntityRef handler is given a child [`Parser`] whose engine is
//! derived from the parent's and whose handler table is the parent's own
//! `Rc`. The child lives only for the duration of the handler call and its
//! engine is released before control returns to the parent engine, however
//! the handler exits.

use super::callbacks::{Callbacks, Context, EntityFn, HandlerResult};
use super::events::EntityRef;
use crate::engine::Scope;
use crate::error::{Error, Result};
use crate::parser::Parser;
use std::rc::Rc;

/// Run `handler` against a child session for the entity named by `context`.
///
/// The outer `Err` is a child that could not be created (a usage error);
/// the inner result is the handler's own verdict.
pub(crate) fn resolve(
    scope: &mut dyn Scope,
    callbacks: &Rc<Callbacks>,
    buffering: bool,
    handler: &EntityFn,
    context: &str,
    entity: &EntityRef<'_>,
) -> Result<HandlerResult<bool>> {
    let engine = scope.create_child(context).ok_or(Error::ChildCreation)?;
    let mut child = Parser::from_engine(engine, Rc::clone(callbacks), buffering);
    log::debug!("resolving external entity {} ({})", context, entity.system_id);

    let outcome = {
        let mut cx = Context::new(scope, callbacks);
        handler(&mut cx, &mut child, entity)
    };
    child.release();
    Ok(outcome)
}
