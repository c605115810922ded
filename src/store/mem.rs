use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{Map, Value};

use super::Backend;
use crate::error::{Error, Result};
use crate::item::Record;

#[derive(Default)]
struct Inner {
    records: Map<String, Value>,
    simulate_write_error: bool,
}

/// In-memory storage backend for testing.
///
/// Uses `RefCell` for interior mutability since the storage model is
/// single-threaded; clones share the same underlying map, which lets a
/// test keep a handle on a backend already handed to a client.
#[derive(Clone, Default)]
pub struct MemBackend {
    inner: Rc<RefCell<Inner>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable write error simulation for testing error handling.
    pub fn set_simulate_write_error(&self, simulate: bool) {
        self.inner.borrow_mut().simulate_write_error = simulate;
    }

    /// Test helper: put a raw record in place without client bookkeeping.
    pub fn put_raw(&self, name: &str, record: Record) {
        self.inner
            .borrow_mut()
            .records
            .insert(name.to_string(), Value::Object(record));
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.borrow().simulate_write_error {
            return Err(Error::Database("Simulated write error".to_string()));
        }
        Ok(())
    }
}

impl Backend for MemBackend {
    fn all_records(&self) -> Result<Vec<(String, Record)>> {
        Ok(self
            .inner
            .borrow()
            .records
            .iter()
            .filter_map(|(name, value)| {
                value
                    .as_object()
                    .map(|record| (name.clone(), record.clone()))
            })
            .collect())
    }

    fn get(&self, name: &str) -> Result<Option<Record>> {
        Ok(self
            .inner
            .borrow()
            .records
            .get(name)
            .and_then(Value::as_object)
            .cloned())
    }

    fn save(&self, name: &str, record: Record, insert: bool) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.borrow_mut();
        let exists = inner.records.contains_key(name);
        if insert && exists {
            return Err(Error::Duplicate(name.to_string()));
        }
        if !insert && !exists {
            return Err(Error::NotFound(name.to_string()));
        }
        inner.records.insert(name.to_string(), Value::Object(record));
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        match self.inner.borrow_mut().records.shift_remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(name.to_string())),
        }
    }
}
