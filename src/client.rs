//! The client: unified search, caching, and CRUD over one or more
//! backends.
//!
//! The client is the validation boundary. Raw records go in and out of
//! [`Backend`]s unchecked; everything the client hands back has been
//! resolved through the schema registry and wrapped as either a
//! [`SearchResult`] or an [`InvalidResult`]. A malformed record never
//! aborts a batch operation; it is reported alongside the good ones
//! with its originating error attached.
//!
//! Backend read caches are cleared before each search so results track
//! external writers. To run several searches against one stable
//! snapshot, hold the guard returned by [`Client::retain_cache`]: the
//! cache survives until the guard drops, and dropping it invalidates on
//! every exit path, early returns and errors included.

use std::cell::Cell;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::item::{base_schema, Item, Record, Schema};
use crate::loader::{Loaded, Loader};
use crate::registry;
use crate::store::Backend;

/// Keys the client stamps into stored records for its own bookkeeping.
/// They are stripped again at hydration time so round-trips are exact.
const BOOKKEEPING_KEYS: [&str; 4] = ["_id", "type", "creation", "last_edit"];

const ID_KEY: &str = "name";

/// A well-formed search hit: the raw stored record plus its resolved
/// container.
#[derive(Debug)]
pub struct SearchResult {
    item: Item,
    record: Record,
}

impl SearchResult {
    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn into_item(self) -> Item {
        self.item
    }

    /// The stored record, bookkeeping fields included.
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.record.get(key)
    }

    pub fn name(&self) -> &str {
        self.item.name().unwrap_or_default()
    }

    /// Instantiate the live object behind this hit.
    pub fn load(&self, loader: &Loader) -> Result<Loaded> {
        loader.from_item(&self.item)
    }
}

/// A search hit whose record could not be turned into a valid container.
///
/// Supports key-based metadata lookup and carries the instigating error,
/// but can never be instantiated.
#[derive(Debug)]
pub struct InvalidResult {
    record: Record,
    error: Error,
}

impl InvalidResult {
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.record.get(key)
    }

    pub fn name(&self) -> &str {
        self.record
            .get(ID_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Why this record failed to resolve.
    pub fn error(&self) -> &Error {
        &self.error
    }
}

/// One entry of a search: either a usable container or a malformed
/// record kept for inspection.
#[derive(Debug)]
pub enum SearchOutcome {
    Valid(SearchResult),
    Invalid(InvalidResult),
}

impl SearchOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, SearchOutcome::Valid(_))
    }

    pub fn name(&self) -> &str {
        match self {
            SearchOutcome::Valid(result) => result.name(),
            SearchOutcome::Invalid(result) => result.name(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            SearchOutcome::Valid(result) => result.get(key),
            SearchOutcome::Invalid(result) => result.get(key),
        }
    }

    pub fn as_valid(&self) -> Option<&SearchResult> {
        match self {
            SearchOutcome::Valid(result) => Some(result),
            SearchOutcome::Invalid(_) => None,
        }
    }

    pub fn as_invalid(&self) -> Option<&InvalidResult> {
        match self {
            SearchOutcome::Valid(_) => None,
            SearchOutcome::Invalid(result) => Some(result),
        }
    }
}

/// Merge policy for [`Client::change_schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Expect a value for every field of the target schema.
    Right,
    /// Only carry fields present in both the item and the target.
    Inner,
}

/// Scope guard returned by [`Client::retain_cache`]. While alive, the
/// backend cache is kept across searches; dropping it releases and
/// invalidates the cache.
pub struct CacheRetainGuard<'a> {
    client: &'a Client,
}

impl Drop for CacheRetainGuard<'_> {
    fn drop(&mut self) {
        self.client.retain.set(false);
        self.client.backend.clear_cache();
    }
}

/// The client controlling the contents of one logical store.
pub struct Client {
    backend: Box<dyn Backend>,
    retain: Cell<bool>,
}

impl Client {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            retain: Cell::new(false),
        }
    }

    /// Convenience over [`Client::new`] for a concrete backend value.
    pub fn with_backend(backend: impl Backend + 'static) -> Self {
        Self::new(Box::new(backend))
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Keep the backend cache for the lifetime of the returned guard.
    ///
    /// The cache is cleared on entry, so the scope starts from a fresh
    /// snapshot and every search inside it sees the same data.
    pub fn retain_cache(&self) -> CacheRetainGuard<'_> {
        self.retain_cache_with(true)
    }

    /// As [`Client::retain_cache`], optionally keeping whatever is
    /// already cached instead of starting fresh.
    pub fn retain_cache_with(&self, clear_first: bool) -> CacheRetainGuard<'_> {
        if clear_first {
            self.backend.clear_cache();
        }
        self.retain.set(true);
        CacheRetainGuard { client: self }
    }

    fn maybe_clear_cache(&self) {
        if !self.retain.get() {
            self.backend.clear_cache();
        }
    }

    /// Build an item from a registered type name and a raw record.
    pub fn create_item(&self, type_name: &str, record: Record) -> Result<Item> {
        Item::from_record(registry::resolve(type_name)?, record)
    }

    /// Turn a stored record back into an item: strip bookkeeping keys,
    /// resolve the declared type (records without one hydrate against
    /// the base schema), construct under enforcement, and check the
    /// mandatory set. A record failing any step is malformed.
    fn hydrate(&self, record: &Record) -> Result<Item> {
        let mut fields = record.clone();
        for key in BOOKKEEPING_KEYS {
            fields.shift_remove(key);
        }
        let schema = match record.get("type").and_then(Value::as_str) {
            Some(type_name) => registry::resolve(type_name)?,
            None => base_schema(),
        };
        let item = Item::from_record(schema, fields)?;
        item.validate()?;
        Ok(item)
    }

    fn wrap(&self, records: Vec<Record>) -> Vec<SearchOutcome> {
        records
            .into_iter()
            .map(|record| match self.hydrate(&record) {
                Ok(item) => SearchOutcome::Valid(SearchResult { item, record }),
                Err(error) => {
                    warn!(
                        name = record.get(ID_KEY).and_then(serde_json::Value::as_str).unwrap_or("?"),
                        %error,
                        "entry is malformed, reporting as invalid"
                    );
                    SearchOutcome::Invalid(InvalidResult { record, error })
                }
            })
            .collect()
    }

    /// All records whose stored values equal every given filter value.
    ///
    /// An integer filter matches an equal floating-point stored value.
    pub fn search(&self, filters: &Record) -> Result<Vec<SearchOutcome>> {
        self.maybe_clear_cache();
        Ok(self.wrap(self.backend.find(filters)?))
    }

    /// As [`Client::search`], additionally requiring the numeric field
    /// `key` to fall in `[start, end)`. A missing `end` is unbounded.
    pub fn search_range(
        &self,
        key: &str,
        start: f64,
        end: Option<f64>,
        filters: &Record,
    ) -> Result<Vec<SearchOutcome>> {
        if filters.contains_key(key) {
            return Err(Error::Search(format!(
                "cannot specify '{}' both as a filter and as the range key",
                key
            )));
        }
        let end = end.unwrap_or(f64::INFINITY);
        if start >= end {
            return Err(Error::Search(format!("invalid range: {} >= {}", start, end)));
        }
        self.maybe_clear_cache();
        Ok(self.wrap(self.backend.find_range(key, start, end, filters)?))
    }

    /// All records where each named field's stringified value fully
    /// matches the given pattern (case-insensitive).
    pub fn search_regex(&self, patterns: &[(&str, &str)]) -> Result<Vec<SearchOutcome>> {
        let owned: Vec<(String, String)> = patterns
            .iter()
            .map(|(key, pattern)| (key.to_string(), pattern.to_string()))
            .collect();
        self.maybe_clear_cache();
        Ok(self.wrap(self.backend.find_regex(&owned)?))
    }

    /// The single record matching the filters.
    ///
    /// Zero matches is [`Error::NotFound`]; more than one is
    /// [`Error::Ambiguous`] and the caller must tighten the filters.
    pub fn find(&self, filters: &Record) -> Result<SearchResult> {
        if filters.is_empty() {
            return Err(Error::Search(
                "no information pertinent to an item given".to_string(),
            ));
        }
        let mut hits: Vec<SearchResult> = self
            .search(filters)?
            .into_iter()
            .filter_map(|outcome| match outcome {
                SearchOutcome::Valid(result) => Some(result),
                SearchOutcome::Invalid(_) => None,
            })
            .collect();
        match hits.len() {
            0 => Err(Error::NotFound(
                "no item matches the search criteria".to_string(),
            )),
            1 => Ok(hits.remove(0)),
            n => Err(Error::Ambiguous(format!(
                "{} items match the search criteria",
                n
            ))),
        }
    }

    /// Find one item and instantiate it in a single call.
    pub fn load_item(&self, loader: &Loader, filters: &Record) -> Result<Loaded> {
        let result = self.find(filters)?;
        loader.from_item(result.item())
    }

    /// Validate and persist a new item. Fails with [`Error::Duplicate`]
    /// if the name is already taken in the backend.
    pub fn add(&self, item: &Item) -> Result<String> {
        info!(name = item.name().unwrap_or("?"), "storing new item");
        self.store(item, true)
    }

    /// Persist changes to an existing item. The name is the immutable
    /// identity: saving under an unknown name is [`Error::NotFound`]
    /// (renaming is delete + add).
    pub fn save(&self, item: &Item) -> Result<String> {
        self.store(item, false)
    }

    /// Delete an item's record by name. The in-memory item stays valid;
    /// it is simply no longer linked to storage.
    pub fn remove(&self, item: &Item) -> Result<()> {
        let name = item
            .name()
            .ok_or_else(|| Error::Entry("item has no name to delete by".to_string()))?;
        info!(name, "removing item from the store");
        self.backend.delete(name)
    }

    fn store(&self, item: &Item, insert: bool) -> Result<String> {
        item.validate()?;
        let mut post = item.post();
        for key in BOOKKEEPING_KEYS {
            post.shift_remove(key);
        }

        let name = match post.get(ID_KEY).and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                return Err(Error::Entry(format!(
                    "item did not supply the '{}' field required to key the store",
                    ID_KEY
                )))
            }
        };

        // Keep the original creation stamp across edits.
        let creation = match self.backend.get(&name)? {
            Some(existing) => existing
                .get("creation")
                .cloned()
                .unwrap_or_else(|| Value::String(Utc::now().to_rfc3339())),
            None => Value::String(Utc::now().to_rfc3339()),
        };

        post.insert("_id".to_string(), Value::String(name.clone()));
        post.insert(
            "type".to_string(),
            Value::String(item.schema().name().to_string()),
        );
        post.insert("creation".to_string(), creation);
        post.insert(
            "last_edit".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        debug!(name = %name, insert, "writing record");
        self.backend.save(&name, post, insert)?;
        Ok(name)
    }

    /// Fetch one entry by name, malformed records included.
    pub fn get(&self, name: &str) -> Result<SearchOutcome> {
        let record = self
            .backend
            .get(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(self.wrap(vec![record]).remove(0))
    }

    /// Whether any backend holds a record under this name.
    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.backend.get(name)?.is_some())
    }

    /// Names of all valid records.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .entries()?
            .iter()
            .filter(|outcome| outcome.is_valid())
            .map(|outcome| outcome.name().to_string())
            .collect())
    }

    /// All valid containers.
    pub fn values(&self) -> Result<Vec<Item>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|outcome| match outcome {
                SearchOutcome::Valid(result) => Some(result.into_item()),
                SearchOutcome::Invalid(_) => None,
            })
            .collect())
    }

    /// `(name, container)` pairs for all valid records.
    pub fn items(&self) -> Result<Vec<(String, Item)>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|outcome| match outcome {
                SearchOutcome::Valid(result) => {
                    Some((result.name().to_string(), result.into_item()))
                }
                SearchOutcome::Invalid(_) => None,
            })
            .collect())
    }

    /// Number of valid records.
    pub fn len(&self) -> Result<usize> {
        Ok(self
            .entries()?
            .iter()
            .filter(|outcome| outcome.is_valid())
            .count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every entry in the store, valid or not.
    pub fn entries(&self) -> Result<Vec<SearchOutcome>> {
        self.search(&Record::new())
    }

    /// Sweep the whole store, reporting the names of records that fail
    /// hydration or mandatory-field validation.
    pub fn validate_all(&self) -> Result<Vec<String>> {
        self.maybe_clear_cache();
        let mut bad = Vec::new();
        for (name, record) in self.backend.all_records()? {
            match self.hydrate(&record).and_then(|item| item.validate()) {
                Ok(()) => debug!(name = %name, "validated"),
                Err(error) => {
                    warn!(name = %name, %error, "failed validation");
                    bad.push(name);
                }
            }
        }
        Ok(bad)
    }

    /// Distinct values of `field` across all valid records.
    pub fn choices_for_field(&self, field: &str) -> Result<Vec<Value>> {
        let mut choices: Vec<Value> = Vec::new();
        for item in self.values()? {
            if let Some(value) = item.get(field) {
                if !value.is_null() && !choices.contains(value) {
                    choices.push(value.clone());
                }
            }
        }
        if choices.is_empty() {
            return Err(Error::Search(format!(
                "no entries found with field '{}'",
                field
            )));
        }
        Ok(choices)
    }

    /// Compute the record needed to move `item` into the `target`
    /// schema, enforcing the target's rules on every carried value.
    ///
    /// `edits` supersede the item's own values. With
    /// [`MergePolicy::Right`] every target field is attempted; with
    /// [`MergePolicy::Inner`] only fields the item already has. The
    /// result is guaranteed to satisfy the target's mandatory set.
    pub fn change_schema(
        &self,
        item: &Item,
        target: &Schema,
        edits: &Record,
        how: MergePolicy,
    ) -> Result<Record> {
        let post = item.post();
        let carried: Vec<&str> = match how {
            MergePolicy::Right => target.field_names().collect(),
            MergePolicy::Inner => target
                .field_names()
                .filter(|name| post.contains_key(*name))
                .collect(),
        };

        let mut new_record = edits.clone();
        for name in carried {
            let old = new_record.get(name).or_else(|| post.get(name));
            let old = match old {
                Some(value) if !value.is_null() => value.clone(),
                // No value anywhere; the mandatory sweep below decides
                // whether that is a problem.
                _ => continue,
            };
            let spec = target
                .field(name)
                .ok_or_else(|| Error::Container(format!("target has no field '{}'", name)))?;
            new_record.insert(name.to_string(), spec.enforce_value(&old)?);
        }

        for required in target.mandatory_names() {
            if !new_record.contains_key(required) {
                return Err(Error::Entry(format!(
                    "mandatory field {} missing a value",
                    required
                )));
            }
        }
        Ok(new_record)
    }
}
