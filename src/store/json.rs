use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::debug;

use super::Backend;
use crate::error::{Error, Result};
use crate::item::Record;

/// File-backed store: the whole record set is one JSON document mapping
/// `name → record`, read wholesale and rewritten wholesale on mutation.
///
/// Reads go through an in-memory cache that lives until
/// [`Backend::clear_cache`]; writes stage the new document to a
/// temporary file in the same directory and atomically rename it over
/// the previous one, so an interrupted write can never leave a
/// truncated store behind.
pub struct JsonBackend {
    path: PathBuf,
    cache: RefCell<Option<Map<String, Value>>>,
}

impl JsonBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RefCell::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a new, empty store file.
    ///
    /// Refuses to overwrite an existing non-empty file: wiping a
    /// populated store must be an explicit filesystem operation, not a
    /// constructor side effect.
    pub fn initialize(&self) -> Result<()> {
        let occupied = fs::metadata(&self.path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if occupied {
            return Err(Error::Database(format!(
                "File {} already exists. Can not initialize a new database.",
                self.path.display()
            )));
        }
        self.store(&Map::new())
    }

    fn load(&self) -> Result<Map<String, Value>> {
        let raw = fs::read_to_string(&self.path).map_err(Error::Io)?;
        if raw.trim().is_empty() {
            // An empty file is a valid, empty database.
            return Ok(Map::new());
        }
        serde_json::from_str(&raw).map_err(|err| {
            Error::Database(format!(
                "store file {} is corrupt: {}",
                self.path.display(),
                err
            ))
        })
    }

    fn load_or_initialize(&self) -> Result<Map<String, Value>> {
        if let Some(db) = self.cache.borrow().as_ref() {
            return Ok(db.clone());
        }
        let db = match self.load() {
            Ok(db) => db,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "initializing new database");
                self.initialize()?;
                Map::new()
            }
            Err(err) => return Err(err),
        };
        *self.cache.borrow_mut() = Some(db.clone());
        Ok(db)
    }

    /// Publish a new document: staged write, then atomic rename.
    /// The temporary file is cleaned up on every exit path.
    fn store(&self, db: &Map<String, Value>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir).map_err(Error::Io)?;
        serde_json::to_writer_pretty(tmp.as_file(), db).map_err(Error::Serialization)?;
        tmp.as_file().sync_all().map_err(Error::Io)?;
        tmp.persist(&self.path)
            .map_err(|err| Error::Io(err.error))?;
        *self.cache.borrow_mut() = Some(db.clone());
        Ok(())
    }
}

impl Backend for JsonBackend {
    fn all_records(&self) -> Result<Vec<(String, Record)>> {
        Ok(self
            .load_or_initialize()?
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::Object(record) => Some((name, record)),
                _ => None,
            })
            .collect())
    }

    fn get(&self, name: &str) -> Result<Option<Record>> {
        Ok(self
            .load_or_initialize()?
            .get(name)
            .and_then(Value::as_object)
            .cloned())
    }

    fn save(&self, name: &str, record: Record, insert: bool) -> Result<()> {
        let mut db = self.load_or_initialize()?;
        let exists = db.contains_key(name);
        if insert && exists {
            return Err(Error::Duplicate(name.to_string()));
        }
        if !insert && !exists {
            return Err(Error::NotFound(name.to_string()));
        }
        db.insert(name.to_string(), Value::Object(record));
        self.store(&db)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut db = self.load_or_initialize()?;
        if db.shift_remove(name).is_none() {
            return Err(Error::NotFound(name.to_string()));
        }
        self.store(&db)
    }

    fn clear_cache(&self) {
        *self.cache.borrow_mut() = None;
    }
}
