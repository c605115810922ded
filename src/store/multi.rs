use tracing::debug;

use super::Backend;
use crate::error::{Error, Result};
use crate::item::Record;

/// Fan-out store composing several backends into one logical view.
///
/// Reads merge every backend's records. Names are only unique within a
/// single backend, so a name appearing in two backends is reported as
/// two separate entries rather than collapsed. Writes and deletes are
/// routed to the backend that owns the name; records with a new name go
/// to the designated default backend (the first one, unless changed).
pub struct MultiBackend {
    backends: Vec<Box<dyn Backend>>,
    default_write: usize,
}

impl MultiBackend {
    /// Compose the given backends. The first receives new records.
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Self {
        Self {
            backends,
            default_write: 0,
        }
    }

    /// Route new records to the backend at `index` instead of the first.
    pub fn with_default_write(mut self, index: usize) -> Self {
        self.default_write = index.min(self.backends.len().saturating_sub(1));
        self
    }

    pub fn backends(&self) -> &[Box<dyn Backend>] {
        &self.backends
    }

    /// The first backend holding `name`, searched in composition order.
    fn owner_of(&self, name: &str) -> Result<Option<&dyn Backend>> {
        for backend in &self.backends {
            if backend.get(name)?.is_some() {
                return Ok(Some(backend.as_ref()));
            }
        }
        Ok(None)
    }
}

impl Backend for MultiBackend {
    fn all_records(&self) -> Result<Vec<(String, Record)>> {
        let mut records = Vec::new();
        for backend in &self.backends {
            records.extend(backend.all_records()?);
        }
        Ok(records)
    }

    fn get(&self, name: &str) -> Result<Option<Record>> {
        for backend in &self.backends {
            if let Some(record) = backend.get(name)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn save(&self, name: &str, record: Record, insert: bool) -> Result<()> {
        match self.owner_of(name)? {
            Some(owner) => owner.save(name, record, insert),
            None if insert => {
                debug!(name, index = self.default_write, "routing new record to default backend");
                match self.backends.get(self.default_write) {
                    Some(backend) => backend.save(name, record, insert),
                    None => Err(Error::Database(
                        "MultiBackend has no backends to write to".to_string(),
                    )),
                }
            }
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        match self.owner_of(name)? {
            Some(owner) => owner.delete(name),
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    fn clear_cache(&self) {
        for backend in &self.backends {
            backend.clear_cache();
        }
    }

    fn find(&self, filters: &Record) -> Result<Vec<Record>> {
        let mut hits = Vec::new();
        for backend in &self.backends {
            hits.extend(backend.find(filters)?);
        }
        Ok(hits)
    }

    fn find_range(
        &self,
        key: &str,
        start: f64,
        end: f64,
        filters: &Record,
    ) -> Result<Vec<Record>> {
        let mut hits = Vec::new();
        for backend in &self.backends {
            hits.extend(backend.find_range(key, start, end, filters)?);
        }
        Ok(hits)
    }

    fn find_regex(&self, patterns: &[(String, String)]) -> Result<Vec<Record>> {
        let mut hits = Vec::new();
        for backend in &self.backends {
            hits.extend(backend.find_regex(patterns)?);
        }
        Ok(hits)
    }
}
