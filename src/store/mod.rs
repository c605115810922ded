//! # Storage Layer
//!
//! Backends hold raw records and know nothing about schemas: every
//! record is a flat `name → fields` mapping, and all validation happens
//! above, at the client/item boundary. A backend only has to answer the
//! [`Backend`] trait:
//!
//! - `all_records` / `get` / `save` / `delete`: record CRUD, keyed by
//!   the record's `name` (unique within one backend only).
//! - `clear_cache`: invalidation hook for backends that keep a read
//!   cache. The client calls it around searches unless a retain-cache
//!   scope is active.
//! - `find` / `find_range` / `find_regex`: query hooks with default
//!   whole-scan implementations. Backends that can push filtering into
//!   their storage engine override them.
//!
//! ## Implementations
//!
//! - [`json::JsonBackend`]: the whole record set as one JSON document on
//!   disk, rewritten atomically on every mutation.
//! - [`mongo::MongoBackend`]: one document per record, with queries
//!   pushed down to the server (behind the `mongo` feature).
//! - [`multi::MultiBackend`]: a fan-out view over several backends.
//! - [`mem::MemBackend`]: in-memory maps for tests.
//!
//! Equality filtering carries one compatibility rule: when literal
//! equality fails, numeric values compare through `f64`, so an integer
//! filter matches an equal floating-point stored value.

use regex::RegexBuilder;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::item::Record;

pub mod json;
pub mod mem;
#[cfg(feature = "mongo")]
pub mod mongo;
pub mod multi;

/// Abstract interface for raw record storage.
pub trait Backend {
    /// Every record in the store, as `(name, record)` pairs.
    fn all_records(&self) -> Result<Vec<(String, Record)>>;

    /// Fetch one record by name. `Ok(None)` when absent; `Err` only on
    /// actual storage failures.
    fn get(&self, name: &str) -> Result<Option<Record>>;

    /// Write a record. With `insert` set, an existing name is a
    /// [`Error::Duplicate`]; without it, a missing name is
    /// [`Error::NotFound`].
    fn save(&self, name: &str, record: Record, insert: bool) -> Result<()>;

    /// Remove a record, failing with [`Error::NotFound`] when absent.
    fn delete(&self, name: &str) -> Result<()>;

    /// Drop any internal read cache. No-op for cacheless backends.
    fn clear_cache(&self) {}

    /// Records whose fields equal every given filter value.
    fn find(&self, filters: &Record) -> Result<Vec<Record>> {
        Ok(self
            .all_records()?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| matches_filters(record, filters))
            .collect())
    }

    /// Records matching `filters` whose `key` value lies in
    /// `[start, end)`.
    fn find_range(
        &self,
        key: &str,
        start: f64,
        end: f64,
        filters: &Record,
    ) -> Result<Vec<Record>> {
        Ok(self
            .all_records()?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| {
                matches_filters(record, filters) && in_range(record.get(key), start, end)
            })
            .collect())
    }

    /// Records where every named field's stringified value fully matches
    /// the given pattern (case-insensitive).
    fn find_regex(&self, patterns: &[(String, String)]) -> Result<Vec<Record>> {
        let compiled = compile_patterns(patterns)?;
        Ok(self
            .all_records()?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| {
                compiled.iter().all(|(key, re)| {
                    record
                        .get(key.as_str())
                        .map(|value| re.is_match(&crate::field::value_to_string(value)))
                        .unwrap_or(false)
                })
            })
            .collect())
    }
}

/// Equality with the numeric compatibility rule: `10` matches `10.0`.
pub(crate) fn values_equal(filter: &Value, stored: &Value) -> bool {
    if filter == stored {
        return true;
    }
    match (filter.as_f64(), stored.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub(crate) fn matches_filters(record: &Record, filters: &Record) -> bool {
    filters.iter().all(|(key, wanted)| {
        record
            .get(key)
            .map(|stored| values_equal(wanted, stored))
            .unwrap_or(false)
    })
}

fn in_range(value: Option<&Value>, start: f64, end: f64) -> bool {
    value
        .and_then(Value::as_f64)
        .map(|v| start <= v && v < end)
        .unwrap_or(false)
}

/// Compile search patterns anchored to the full value, case-insensitive.
pub(crate) fn compile_patterns(
    patterns: &[(String, String)],
) -> Result<Vec<(String, regex::Regex)>> {
    patterns
        .iter()
        .map(|(key, pattern)| {
            RegexBuilder::new(&format!("^(?:{})$", pattern))
                .case_insensitive(true)
                .build()
                .map(|re| (key.clone(), re))
                .map_err(|err| {
                    Error::Search(format!(
                        "failed to compile pattern for {}={:?}: {}",
                        key, pattern, err
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_filter_matches_float_value() {
        assert!(values_equal(&json!(10), &json!(10.0)));
        assert!(values_equal(&json!(10.0), &json!(10)));
        assert!(!values_equal(&json!(10), &json!(10.5)));
        assert!(!values_equal(&json!("10"), &json!(10)));
    }

    #[test]
    fn filters_require_every_key() {
        let record = json!({"name": "m1", "beamline": "MFX", "z": 3.0});
        let record = record.as_object().unwrap();
        let hit = json!({"beamline": "MFX", "z": 3});
        let miss = json!({"beamline": "MFX", "stand": "A"});
        assert!(matches_filters(record, hit.as_object().unwrap()));
        assert!(!matches_filters(record, miss.as_object().unwrap()));
    }

    #[test]
    fn range_is_half_open() {
        assert!(in_range(Some(&json!(4.0)), 4.0, 10.0));
        assert!(in_range(Some(&json!(9.9)), 4.0, 10.0));
        assert!(!in_range(Some(&json!(10.0)), 4.0, 10.0));
        assert!(!in_range(Some(&json!("text")), 4.0, 10.0));
        assert!(!in_range(None, 4.0, 10.0));
    }

    #[test]
    fn bad_pattern_is_a_search_error() {
        let err = compile_patterns(&[("name".into(), "(".into())]).unwrap_err();
        assert!(matches!(err, Error::Search(_)));
    }
}
