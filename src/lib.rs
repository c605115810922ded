//! # roster
//!
//! A schema-validated metadata index for instantiable items.
//!
//! Roster keeps a catalog of real-world objects (motors, detectors,
//! anything constructible) as structured records: a factory reference
//! plus the arguments to build it with. Records live in pluggable
//! backends and come back out as live objects on demand.
//!
//! ## The Three Moving Parts
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Schemas (field.rs, item.rs, registry.rs)               │
//! │  - FieldSpec: one declared, enforced attribute          │
//! │  - Schema: an ahead-of-time field list per item kind    │
//! │  - Item: one record, open to extraneous metadata        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  Client + Storage (client.rs, store/)                   │
//! │  - Backend trait: raw record CRUD, no validation        │
//! │  - Client: caching, search, CRUD, mapping access        │
//! │  - Malformed records isolate as InvalidResult           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  Loader (loader.rs)                                     │
//! │  - Explicit factory registry for device_class paths     │
//! │  - {{field}} macro substitution in args/kwargs          │
//! │  - Identity cache fingerprinted on item content         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Tour
//!
//! ```no_run
//! use roster::{Client, Item, base_schema};
//! use roster::store::json::JsonBackend;
//! use serde_json::json;
//!
//! # fn main() -> roster::Result<()> {
//! let client = Client::with_backend(JsonBackend::new("db.json"));
//!
//! let motor = Item::from_record(
//!     base_schema(),
//!     json!({
//!         "name": "motor1",
//!         "device_class": "motion.Motor",
//!         "position": 10.0,
//!     })
//!     .as_object()
//!     .cloned()
//!     .unwrap(),
//! )?;
//! client.add(&motor)?;
//!
//! // An integer filter matches an equal float on purpose.
//! let hits = client.search(json!({"position": 10}).as_object().unwrap())?;
//! assert_eq!(hits.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! Storage is schema-blind by design: backends shuttle flat records and
//! every rule runs at the client boundary, so a half-broken store stays
//! searchable and the broken entries stay inspectable.

pub mod client;
pub mod config;
pub mod error;
pub mod field;
pub mod item;
pub mod loader;
pub mod registry;
pub mod store;

pub use client::{
    CacheRetainGuard, Client, InvalidResult, MergePolicy, SearchOutcome, SearchResult,
};
pub use error::{Error, Result};
pub use field::{Enforce, FieldSpec, ValueKind};
pub use item::{base_schema, epics_schema, Item, Record, Schema};
pub use loader::{fill_template, Factory, FactoryObject, Loaded, Loader};
pub use registry::SchemaRegistry;
pub use store::Backend;
