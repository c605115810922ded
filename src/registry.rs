//! The schema registry: string type names to schema variants.
//!
//! Stored records carry a `type` key naming the schema they were written
//! against; this registry turns that name back into a [`Schema`]. Host
//! applications extend it either by calling [`register`] directly or by
//! installing registrar functions that run lazily, on first lookup,
//! which keeps registration free of start-up ordering hazards.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::item::{base_schema, epics_schema, Schema};

/// A deferred registration hook, run once at first lookup.
pub type Registrar = Box<dyn Fn(&mut SchemaRegistry) + Send>;

/// Name → schema map with deferred registration.
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
    pending: Vec<Registrar>,
}

impl SchemaRegistry {
    /// A registry holding only the built-in schemas.
    pub fn new() -> Self {
        let mut schemas = HashMap::new();
        for schema in [base_schema(), epics_schema()] {
            schemas.insert(schema.name().to_string(), schema);
        }
        Self {
            schemas,
            pending: Vec::new(),
        }
    }

    /// Register a schema under its own name.
    ///
    /// Re-registering an existing name overwrites it: last writer wins.
    /// This is the supported way for a host application to replace a
    /// built-in variant, not an error.
    pub fn register(&mut self, schema: Schema) {
        let name = schema.name().to_string();
        if self.schemas.insert(name.clone(), schema).is_some() {
            debug!(name = %name, "schema re-registered, previous entry replaced");
        }
    }

    /// Queue a registrar to run at the next lookup.
    pub fn add_registrar(&mut self, registrar: Registrar) {
        self.pending.push(registrar);
    }

    /// Run any pending registrars. Called implicitly by [`resolve`];
    /// each registrar runs exactly once.
    pub fn ensure_loaded(&mut self) {
        while !self.pending.is_empty() {
            let batch = std::mem::take(&mut self.pending);
            for registrar in batch {
                registrar(self);
            }
        }
    }

    /// Resolve a type name to its schema.
    pub fn resolve(&mut self, name: &str) -> Result<Schema> {
        self.ensure_loaded();
        self.schemas.get(name).cloned().ok_or(Error::Resolution {
            target: name.to_string(),
            reason: "no schema registered under this type name".to_string(),
        })
    }

    /// All registered type names.
    pub fn names(&mut self) -> Vec<String> {
        self.ensure_loaded();
        let mut names: Vec<String> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: Lazy<Mutex<SchemaRegistry>> = Lazy::new(|| Mutex::new(SchemaRegistry::new()));

fn global() -> std::sync::MutexGuard<'static, SchemaRegistry> {
    GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Register a schema in the process-wide registry.
pub fn register(schema: Schema) {
    global().register(schema);
}

/// Queue a registrar against the process-wide registry.
pub fn add_registrar(registrar: Registrar) {
    global().add_registrar(registrar);
}

/// Resolve a type name against the process-wide registry.
pub fn resolve(name: &str) -> Result<Schema> {
    global().resolve(name)
}

/// Type names known to the process-wide registry.
pub fn names() -> Vec<String> {
    global().names()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldSpec;

    #[test]
    fn built_ins_resolve() {
        let mut registry = SchemaRegistry::new();
        assert!(registry.resolve("Item").is_ok());
        assert!(registry.resolve("EpicsItem").is_ok());
    }

    #[test]
    fn unknown_name_is_a_resolution_error() {
        let mut registry = SchemaRegistry::new();
        let err = registry.resolve("Imaginary").unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));
    }

    #[test]
    fn re_registration_overwrites() {
        let mut registry = SchemaRegistry::new();
        let first = base_schema().extend("Gauge", vec![FieldSpec::new("range_max", "")]);
        let second = base_schema().extend("Gauge", vec![FieldSpec::new("span", "")]);
        registry.register(first);
        registry.register(second);

        let resolved = registry.resolve("Gauge").unwrap();
        assert!(resolved.field("span").is_some());
        assert!(resolved.field("range_max").is_none());
    }

    #[test]
    fn registrars_run_lazily_and_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let mut registry = SchemaRegistry::new();
        registry.add_registrar(Box::new(move |reg| {
            counter.fetch_add(1, Ordering::SeqCst);
            reg.register(base_schema().extend("Shutter", vec![]));
        }));

        // Nothing runs until the first lookup.
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(registry.resolve("Shutter").is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Subsequent lookups do not re-run it.
        assert!(registry.resolve("Shutter").is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registrars_may_register_more_registrars() {
        let mut registry = SchemaRegistry::new();
        registry.add_registrar(Box::new(|reg| {
            reg.register(base_schema().extend("Outer", vec![]));
            reg.add_registrar(Box::new(|reg| {
                reg.register(base_schema().extend("Inner", vec![]));
            }));
        }));
        assert!(registry.resolve("Inner").is_ok());
        assert!(registry.resolve("Outer").is_ok());
    }
}
