//! Per-type hooks: compile-time evaluators and ingest-time augmentation.

use crate::ast::{Clause, Filter};
use crate::error::Result;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Type-specific handling for one family of objects.
///
/// A modifier augments objects of its type with derived fields before they
/// are stored, and compiles clauses over those derived fields into filters
/// the store can evaluate.
pub trait StixModifier: Send + Sync {
    /// Short name used in error messages.
    fn name(&self) -> &str;

    fn can_handle(&self, stix_type: &str) -> bool;

    /// Compiles a clause this modifier owns.
    ///
    /// `Ok(None)` means the modifier does not own the field or operator and
    /// the generic translation should be used instead.
    fn compile(&self, clause: &Clause) -> Result<Option<Filter>>;

    /// Adds derived fields to an object before it is stored.
    fn augment(&self, object: Map<String, Value>) -> Map<String, Value>;

    /// Field a derived field is computed from (`x_ip` -> `value`).
    fn derived_from(&self, _field: &str) -> Option<&'static str> {
        None
    }
}

/// Static registry of modifiers, looked up by object type.
#[derive(Clone, Default)]
pub struct ModifierRegistry {
    modifiers: Vec<Arc<dyn StixModifier>>,
}

impl ModifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, modifier: impl StixModifier + 'static) -> Self {
        self.modifiers.push(Arc::new(modifier));
        self
    }

    /// First registered modifier that handles `stix_type`.
    pub fn lookup(&self, stix_type: &str) -> Option<&dyn StixModifier> {
        self.modifiers
            .iter()
            .find(|m| m.can_handle(stix_type))
            .map(|m| m.as_ref())
    }

    /// Augments an object with its type's derived fields, if any.
    pub fn augment(&self, object: Map<String, Value>) -> Map<String, Value> {
        let stix_type = object.get("type").and_then(Value::as_str).map(str::to_string);
        match stix_type.as_deref().and_then(|t| self.lookup(t)) {
            Some(modifier) => modifier.augment(object),
            None => object,
        }
    }

    pub fn len(&self) -> usize {
        self.modifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }
}

impl std::fmt::Debug for ModifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.modifiers.iter().map(|m| m.name()))
            .finish()
    }
}
