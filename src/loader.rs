//! Turning items into live objects.
//!
//! An item names its constructor through `device_class`, a dotted
//! `module.Attr` path. There is no runtime module loading here: host
//! applications register factory functions under those paths, and the
//! loader resolves against that explicit map. Arguments pass through
//! `{{field}}` macro substitution (rendered from the item's own fields,
//! single-level lookup only) before the factory runs.
//!
//! Built objects live in an identity cache keyed by the item's name and
//! guarded by a fingerprint of its full serialized content: asking for
//! an unchanged item again returns the very same object, while any
//! content drift forces a rebuild.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::field::value_to_string;
use crate::item::{Item, Record};

/// An instantiated object, type-erased. Factories decide the concrete
/// type; callers downcast.
pub type FactoryObject = Arc<dyn Any + Send + Sync>;

/// A registered constructor: positional arguments plus keyword
/// arguments, already macro-substituted, in; built object out.
pub type Factory = Arc<dyn Fn(&[Value], &Record) -> Result<FactoryObject> + Send + Sync>;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("static pattern"));

/// The result of loading an item: the built object plus, unless
/// disabled, the originating item attached as metadata.
#[derive(Clone)]
pub struct Loaded {
    object: FactoryObject,
    md: Option<Item>,
}

impl Loaded {
    pub fn object(&self) -> &FactoryObject {
        &self.object
    }

    /// Downcast the built object to its concrete type.
    pub fn object_as<T: 'static>(&self) -> Option<&T> {
        self.object.downcast_ref::<T>()
    }

    /// The originating item, when metadata attachment was requested.
    pub fn md(&self) -> Option<&Item> {
        self.md.as_ref()
    }
}

struct CacheEntry {
    fingerprint: String,
    object: FactoryObject,
}

/// Factory registry plus identity cache.
#[derive(Default)]
pub struct Loader {
    modules: RefCell<HashMap<String, HashMap<String, Factory>>>,
    cache: RefCell<HashMap<String, CacheEntry>>,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a dotted `module.Attr` path.
    pub fn register_factory(&self, path: &str, factory: Factory) -> Result<()> {
        let (module, attr) = split_class_path(path)?;
        self.modules
            .borrow_mut()
            .entry(module.to_string())
            .or_default()
            .insert(attr.to_string(), factory);
        Ok(())
    }

    /// Resolve a `device_class` path to its factory.
    ///
    /// The two halves fail separately, mirroring a failed module import
    /// versus a missing attribute on a loaded module.
    pub fn resolve_class(&self, device_class: &str) -> Result<Factory> {
        let (module, attr) = split_class_path(device_class)?;
        let modules = self.modules.borrow();
        let entries = modules.get(module).ok_or_else(|| Error::Resolution {
            target: device_class.to_string(),
            reason: format!("module '{}' is not registered", module),
        })?;
        entries.get(attr).cloned().ok_or_else(|| Error::Resolution {
            target: device_class.to_string(),
            reason: format!("module '{}' has no attribute '{}'", module, attr),
        })
    }

    /// Load an item, attaching it to the object as metadata.
    pub fn from_item(&self, item: &Item) -> Result<Loaded> {
        self.from_item_with(item, true)
    }

    /// Load an item, controlling metadata attachment.
    pub fn from_item_with(&self, item: &Item, attach_md: bool) -> Result<Loaded> {
        let (name, fingerprint) = cache_key(item)?;

        if let Some(object) = self.cached(&name, &fingerprint) {
            debug!(name = %name, "loading from cache");
            return Ok(self.wrap(item, object, attach_md));
        }

        let (factory, args, kwargs) = self.prepare(item)?;
        let object = factory(&args, &kwargs)?;
        self.admit(&name, &fingerprint, &object);
        Ok(self.wrap(item, object, attach_md))
    }

    /// Instantiate several items on worker threads, reporting each
    /// completion through `on_loaded` as it lands. Failures are isolated
    /// per item; the returned results line up with the input order.
    ///
    /// This is purely a throughput optimization for slow constructors;
    /// results are identical to loading the items one by one.
    pub fn load_batch<F>(&self, items: &[Item], mut on_loaded: F) -> Vec<Result<Loaded>>
    where
        F: FnMut(&Item, &Result<Loaded>),
    {
        let mut slots: Vec<Option<Result<Loaded>>> = Vec::new();
        slots.resize_with(items.len(), || None);

        // Resolution, templating, and cache checks happen here on the
        // calling thread; only the factory calls fan out.
        let mut pending: Vec<(usize, Factory, Vec<Value>, Record)> = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let ready = match cache_key(item) {
                Ok((name, fingerprint)) => self
                    .cached(&name, &fingerprint)
                    .map(|object| Ok(self.wrap(item, object, true))),
                Err(err) => Some(Err(err)),
            };
            if let Some(result) = ready {
                on_loaded(item, &result);
                slots[index] = Some(result);
                continue;
            }
            match self.prepare(item) {
                Ok((factory, args, kwargs)) => pending.push((index, factory, args, kwargs)),
                Err(err) => {
                    let result = Err(err);
                    on_loaded(item, &result);
                    slots[index] = Some(result);
                }
            }
        }

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, Result<FactoryObject>)>();
            for (index, factory, args, kwargs) in pending {
                let tx = tx.clone();
                scope.spawn(move || {
                    let built = factory(&args, &kwargs);
                    // The receiver only disappears if the scope is
                    // unwinding; nothing to report to in that case.
                    let _ = tx.send((index, built));
                });
            }
            drop(tx);

            for (index, built) in rx {
                let item = &items[index];
                let result = built.map(|object| {
                    if let Ok((name, fingerprint)) = cache_key(item) {
                        self.admit(&name, &fingerprint, &object);
                    }
                    self.wrap(item, object, true)
                });
                on_loaded(item, &result);
                slots[index] = Some(result);
            }
        });

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(Error::Entry("load was skipped".into()))))
            .collect()
    }

    /// Drop every cached object.
    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    fn cached(&self, name: &str, fingerprint: &str) -> Option<FactoryObject> {
        let cache = self.cache.borrow();
        match cache.get(name) {
            Some(entry) if entry.fingerprint == fingerprint => Some(entry.object.clone()),
            Some(_) => {
                warn!(
                    name,
                    "item already loaded but its content has changed, rebuilding"
                );
                None
            }
            None => None,
        }
    }

    fn admit(&self, name: &str, fingerprint: &str, object: &FactoryObject) {
        self.cache.borrow_mut().insert(
            name.to_string(),
            CacheEntry {
                fingerprint: fingerprint.to_string(),
                object: object.clone(),
            },
        );
    }

    fn wrap(&self, item: &Item, object: FactoryObject, attach_md: bool) -> Loaded {
        Loaded {
            object,
            md: attach_md.then(|| item.clone()),
        }
    }

    /// Resolve the factory and render final arguments for an item.
    fn prepare(&self, item: &Item) -> Result<(Factory, Vec<Value>, Record)> {
        let device_class = match item.device_class() {
            Some(class) if !class.is_empty() => class.to_string(),
            _ => {
                return Err(Error::Entry(format!(
                    "item '{}' does not have an associated factory",
                    item.name().unwrap_or("?")
                )))
            }
        };
        let factory = self.resolve_class(&device_class)?;

        let args: Vec<Value> = item
            .args()
            .iter()
            .map(|arg| render_value(arg, item))
            .collect();
        let kwargs = filter_default_kwargs(item, render_kwargs(item));
        Ok((factory, args, kwargs))
    }
}

fn split_class_path(path: &str) -> Result<(&str, &str)> {
    match path.rsplit_once('.') {
        Some((module, attr)) if !module.is_empty() && !attr.is_empty() => Ok((module, attr)),
        _ => Err(Error::Resolution {
            target: path.to_string(),
            reason: "expected a dotted 'module.Attr' factory path".to_string(),
        }),
    }
}

fn cache_key(item: &Item) -> Result<(String, String)> {
    let name = item
        .name()
        .ok_or_else(|| Error::Entry("item has no name to cache under".to_string()))?
        .to_string();
    let fingerprint = serde_json::to_string(&item.post()).map_err(Error::Serialization)?;
    Ok((name, fingerprint))
}

/// Render a `{{field}}` template against an item's fields.
///
/// A template that is exactly one placeholder resolves to the field's
/// native value; anything else renders to a string with each
/// placeholder stringified in place. Unknown fields render empty.
pub fn fill_template(template: &str, item: &Item) -> Value {
    if let Some(captures) = PLACEHOLDER.captures(template) {
        let whole = captures
            .get(0)
            .map(|m| m.start() == 0 && m.end() == template.len())
            .unwrap_or(false);
        if whole {
            let key = &captures[1];
            return match item.get(key) {
                Some(value) => value.clone(),
                None => {
                    warn!(field = key, "template names a field the item does not have");
                    Value::String(String::new())
                }
            };
        }
    }

    let rendered = PLACEHOLDER.replace_all(template, |captures: &regex::Captures<'_>| {
        let key = &captures[1];
        match item.get(key) {
            Some(value) => value_to_string(value),
            None => {
                warn!(field = key, "template names a field the item does not have");
                String::new()
            }
        }
    });
    Value::String(rendered.into_owned())
}

/// Apply template substitution recursively through nested structures.
fn render_value(value: &Value, item: &Item) -> Value {
    match value {
        Value::String(template) => fill_template(template, item),
        Value::Array(entries) => Value::Array(
            entries
                .iter()
                .map(|entry| render_value(entry, item))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, entry)| (key.clone(), render_value(entry, item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_kwargs(item: &Item) -> Record {
    item.kwargs()
        .iter()
        .map(|(key, value)| (key.clone(), render_value(value, item)))
        .collect()
}

/// Drop keyword arguments whose value equals the matching field's
/// default. The `kwargs` field's own `include_default_as_kwarg` gates
/// the policy: when set (the default), individual fields opt out one by
/// one; when cleared, every default-equal entry is dropped.
fn filter_default_kwargs(item: &Item, kwargs: Record) -> Record {
    let schema = item.schema();
    let kwargs_include = schema
        .field("kwargs")
        .map(|spec| spec.include_default_as_kwarg)
        .unwrap_or(true);

    kwargs
        .into_iter()
        .filter(|(key, value)| match schema.field(key) {
            None => true,
            Some(spec) => {
                let equals_default = spec.default_or_null() == *value;
                if kwargs_include {
                    spec.include_default_as_kwarg || !equals_default
                } else {
                    !equals_default
                }
            }
        })
        .collect()
}
