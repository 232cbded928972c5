//! Content-Model Translation
//!
//! Turns the engine's flat [`NativeModel`] into an owned tree of
//! [`ContentNode`]s, and guarantees the native form goes back to the engine
//! exactly once per declaration.

use crate::engine::{ContentKind, ModelParticle, NativeModel, Quantifier, Scope};

/// One particle of a translated content model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentNode {
    pub kind: ContentKind,
    /// Absent when the particle has no occurrence indicator
    pub quantifier: Option<Quantifier>,
    /// Present only for `Name` particles
    pub name: Option<String>,
    /// Child particles, in declaration order; empty for leaves
    pub children: Vec<ContentNode>,
}

impl ContentNode {
    /// Leaf `Name` particle
    pub fn name(name: impl Into<String>, quantifier: Option<Quantifier>) -> Self {
        ContentNode {
            kind: ContentKind::Name,
            quantifier,
            name: Some(name.into()),
            children: Vec::new(),
        }
    }
}

/// A translated `<!ELEMENT>` content model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentModel {
    pub kind: ContentKind,
    pub quantifier: Option<Quantifier>,
    pub children: Vec<ContentNode>,
}

impl ContentModel {
    /// Children as passed to handlers: absent rather than empty
    pub fn children(&self) -> Option<&[ContentNode]> {
        if self.children.is_empty() {
            None
        } else {
            Some(&self.children)
        }
    }
}

#[inline]
fn quantifier_of(particle: &ModelParticle) -> Option<Quantifier> {
    match particle.quantifier {
        Quantifier::None => None,
        q => Some(q),
    }
}

/// Translate a native model, preserving child order
pub fn translate(model: &NativeModel) -> ContentModel {
    let root = model.root();
    ContentModel {
        kind: root.kind,
        quantifier: quantifier_of(root),
        children: translate_children(model, root),
    }
}

fn translate_children(model: &NativeModel, root: &ModelParticle) -> Vec<ContentNode> {
    // Open particles with the children translated so far
    let mut open: Vec<(&ModelParticle, Vec<ContentNode>)> = vec![(root, Vec::new())];
    while let Some((particle, done)) = open.pop() {
        if let Some(child) = model.children(particle).get(done.len()) {
            open.push((particle, done));
            open.push((child, Vec::new()));
            continue;
        }
        let Some((_, siblings)) = open.last_mut() else {
            return done;
        };
        siblings.push(ContentNode {
            kind: particle.kind,
            quantifier: quantifier_of(particle),
            name: particle.name.clone(),
            children: done,
        });
    }
    Vec::new()
}

/// Holds a native model and hands it back to the engine when dropped.
pub struct ModelGuard<'s> {
    scope: &'s mut dyn Scope,
    model: Option<NativeModel>,
}

impl<'s> ModelGuard<'s> {
    pub fn new(scope: &'s mut dyn Scope, model: NativeModel) -> Self {
        ModelGuard {
            scope,
            model: Some(model),
        }
    }

    /// Translate the held model; the guard still releases it
    pub fn translate(&self) -> Option<ContentModel> {
        self.model.as_ref().map(translate)
    }
}

impl Drop for ModelGuard<'_> {
    fn drop(&mut self) {
        if let Some(model) = self.model.take() {
            self.scope.free_content_model(model);
        }
    }
}
