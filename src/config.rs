//! Configuration-driven client construction.
//!
//! A config file is TOML with one `[[source]]` table per backend:
//!
//! ```toml
//! [[source]]
//! backend = "json"
//! path = "db.json"
//!
//! [[source]]
//! backend = "mongo"
//! host = "db.example.com"
//! user = "reader"
//! pw = "secret"
//! db = "instruments"
//! collection = "items"
//! ```
//!
//! Several sources compose into a fan-out store; the first source is
//! the default write target. A source without an explicit `backend`
//! falls back to the `ROSTER_BACKEND` environment variable, and to the
//! JSON file store absent that. The config file itself is located by
//! `ROSTER_CFG`, the working directory, or the user config directory,
//! in that order.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use tracing::debug;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::store::json::JsonBackend;
use crate::store::multi::MultiBackend;
use crate::store::Backend;

const CFG_ENV: &str = "ROSTER_CFG";
const BACKEND_ENV: &str = "ROSTER_BACKEND";
const DEFAULT_BACKEND: &str = "json";
const CFG_NAMES: [&str; 2] = ["roster.toml", ".roster.toml"];

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: Vec<SourceConfig>,
}

/// One backend description. Which keys matter depends on the kind.
#[derive(Debug, Default, Deserialize)]
pub struct SourceConfig {
    pub backend: Option<String>,
    // JSON file store
    pub path: Option<PathBuf>,
    // Document database
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pw: Option<String>,
    pub db: Option<String>,
    pub collection: Option<String>,
    pub auth_source: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&raw).map_err(|err| {
            Error::Database(format!("config file {} is invalid: {}", path.display(), err))
        })
    }
}

/// Locate a configuration file: `ROSTER_CFG`, then the working
/// directory, then the user config directory.
pub fn find_config() -> Option<PathBuf> {
    if let Some(cfg) = env::var_os(CFG_ENV) {
        debug!(path = %PathBuf::from(&cfg).display(), "using configuration from environment");
        return Some(PathBuf::from(cfg));
    }
    for name in CFG_NAMES {
        let candidate = PathBuf::from(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    if let Some(dirs) = ProjectDirs::from("", "", "roster") {
        for name in CFG_NAMES {
            let candidate = dirs.config_dir().join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// The backend kind to use when a source names none.
fn default_backend_kind() -> String {
    env::var(BACKEND_ENV)
        .map(|kind| kind.to_lowercase())
        .unwrap_or_else(|_| DEFAULT_BACKEND.to_string())
}

fn build_backend(source: &SourceConfig, cfg_dir: &Path) -> Result<Box<dyn Backend>> {
    let kind = source
        .backend
        .clone()
        .unwrap_or_else(default_backend_kind);
    match kind.as_str() {
        "json" => {
            let path = source.path.clone().ok_or_else(|| {
                Error::Database("json source needs a 'path' setting".to_string())
            })?;
            let path = if path.is_absolute() {
                path
            } else {
                cfg_dir.join(path)
            };
            Ok(Box::new(JsonBackend::new(path)))
        }
        #[cfg(feature = "mongo")]
        "mongo" | "mongodb" => {
            use crate::store::mongo::{MongoBackend, MongoOptions};
            let defaults = MongoOptions::default();
            let options = MongoOptions {
                host: source.host.clone().unwrap_or(defaults.host),
                port: source.port.unwrap_or(defaults.port),
                user: source.user.clone().unwrap_or_default(),
                pw: source.pw.clone().unwrap_or_default(),
                db: source.db.clone().ok_or_else(|| {
                    Error::Database("mongo source needs a 'db' setting".to_string())
                })?,
                collection: source.collection.clone().ok_or_else(|| {
                    Error::Database("mongo source needs a 'collection' setting".to_string())
                })?,
                auth_source: source.auth_source.clone(),
                timeout_ms: source.timeout_ms.unwrap_or(defaults.timeout_ms),
            };
            Ok(Box::new(MongoBackend::connect(&options)?))
        }
        #[cfg(not(feature = "mongo"))]
        "mongo" | "mongodb" => Err(Error::Database(
            "this build does not include the mongo backend".to_string(),
        )),
        other => Err(Error::Database(format!("unknown backend kind '{}'", other))),
    }
}

impl Client {
    /// Build a client from a configuration file.
    ///
    /// With no explicit path the file is discovered via [`find_config`].
    /// One configured source yields a plain client; several compose a
    /// fan-out store whose default write target is the first source.
    pub fn from_config(cfg: Option<&Path>) -> Result<Client> {
        let path = match cfg {
            Some(path) => path.to_path_buf(),
            None => find_config().ok_or_else(|| {
                Error::Database(format!(
                    "no configuration file found; set ${} or add a roster.toml",
                    CFG_ENV
                ))
            })?,
        };
        if !path.exists() {
            return Err(Error::Database(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let config = Config::load(&path)?;
        let cfg_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        let mut backends: Vec<Box<dyn Backend>> = Vec::new();
        for source in &config.source {
            backends.push(build_backend(source, &cfg_dir)?);
        }
        match backends.len() {
            0 => Err(Error::Database(format!(
                "no sources configured in {}",
                path.display()
            ))),
            1 => Ok(Client::new(backends.remove(0))),
            _ => Ok(Client::new(Box::new(MultiBackend::new(backends)))),
        }
    }
}
