//! Item schemas and the container type built from them.
//!
//! A [`Schema`] is an ordered, ahead-of-time list of [`FieldSpec`]s; an
//! [`Item`] is one record held against a schema. Items accept unknown
//! keys (kept as extraneous metadata), enforce declared fields on every
//! write, and serialize declared fields first, extraneous fields after,
//! in insertion order.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::field::{enforce_identifier, Enforce, FieldSpec, ValueKind};

/// The serialized form of one item: a flat, ordered field → value map.
pub type Record = Map<String, Value>;

/// An ordered set of field descriptors describing one item kind.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Build a schema from its full field list.
    ///
    /// # Panics
    ///
    /// Panics if a field's default value fails that field's own
    /// enforcement rule: a schema with an unusable default is a
    /// programming error, caught at declaration time.
    pub fn new(name: &str, fields: Vec<FieldSpec>) -> Self {
        for spec in &fields {
            if let Some(default) = &spec.default {
                if spec.enforce_value(default).is_err() {
                    panic!(
                        "schema '{}': default for field '{}' fails its own enforcement",
                        name, spec.key
                    );
                }
            }
        }
        Self {
            name: name.to_string(),
            fields,
        }
    }

    /// Compose this schema with additional fields under a new name.
    ///
    /// A field whose key matches an existing one replaces it in place,
    /// keeping its position; this is how a variant narrows an inherited
    /// field (tighter enforcement, different default) without being able
    /// to remove it. New keys are appended.
    pub fn extend(&self, name: &str, extra: Vec<FieldSpec>) -> Self {
        let mut fields = self.fields.clone();
        for spec in extra {
            match fields.iter_mut().find(|f| f.key == spec.key) {
                Some(slot) => *slot = spec,
                None => fields.push(spec),
            }
        }
        Schema::new(name, fields)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.key.as_str())
    }

    pub fn mandatory_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| !f.optional)
            .map(|f| f.key.as_str())
    }
}

/// The base schema every item kind builds on.
pub fn base_schema() -> Schema {
    Schema::new(
        "Item",
        vec![
            FieldSpec::new("name", "Shorthand name used as the record identity")
                .mandatory()
                .enforce(Enforce::Custom(Arc::new(enforce_identifier)))
                .enforce_doc("Names must be plain identifiers"),
            FieldSpec::new("device_class", "Factory path that produces the live object")
                .of_kind(ValueKind::Str),
            FieldSpec::new("args", "Positional arguments passed to the factory")
                .of_kind(ValueKind::List)
                .default_value(json!([])),
            FieldSpec::new("kwargs", "Keyword arguments passed to the factory")
                .of_kind(ValueKind::Dict)
                .default_value(json!({})),
            FieldSpec::new("active", "Whether the item is actively deployed")
                .of_kind(ValueKind::Bool)
                .default_value(json!(true)),
            FieldSpec::new("documentation", "Relevant free-text documentation")
                .of_kind(ValueKind::Str),
        ],
    )
}

/// Built-in variant for EPICS-addressed instruments: adds a mandatory
/// base PV and templates it into the factory arguments.
pub fn epics_schema() -> Schema {
    base_schema().extend(
        "EpicsItem",
        vec![
            FieldSpec::new("prefix", "A base PV for all related records")
                .mandatory()
                .of_kind(ValueKind::Str),
            FieldSpec::new("args", "Positional arguments passed to the factory")
                .of_kind(ValueKind::List)
                .default_value(json!(["{{prefix}}"])),
            FieldSpec::new("kwargs", "Keyword arguments passed to the factory")
                .of_kind(ValueKind::Dict)
                .default_value(json!({"name": "{{name}}"})),
        ],
    )
}

/// One schema-typed record: declared values plus extraneous metadata.
///
/// Two items compare equal when their full serialized content matches,
/// regardless of how they were built.
#[derive(Debug, Clone)]
pub struct Item {
    schema: Schema,
    values: Record,
    extraneous: Record,
}

impl Item {
    /// An empty item of the given schema: every declared field starts at
    /// its default (or null).
    pub fn new(schema: Schema) -> Self {
        let mut values = Record::new();
        for spec in schema.fields() {
            values.insert(spec.key.clone(), spec.default_or_null());
        }
        Self {
            schema,
            values,
            extraneous: Record::new(),
        }
    }

    /// Build an item from a raw key/value record.
    ///
    /// Declared keys are enforced as they are taken; unknown keys land in
    /// the extraneous bag rather than being rejected. Enforcement
    /// failures abort construction: this is the seam where a malformed
    /// stored record turns into an error instead of a container.
    pub fn from_record(schema: Schema, record: Record) -> Result<Self> {
        let mut item = Item::new(schema);
        for (key, value) in record {
            item.set(&key, value)?;
        }
        Ok(item)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Look up a field by name, declared or extraneous.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).or_else(|| self.extraneous.get(key))
    }

    /// Write a field, enforcing the schema for declared keys.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        match self.schema.field(key) {
            Some(spec) => {
                let value = spec.enforce_value(&value)?;
                self.values.insert(key.to_string(), value);
            }
            None => {
                self.extraneous.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    pub fn extraneous(&self) -> &Record {
        &self.extraneous
    }

    /// The record identity, when set.
    pub fn name(&self) -> Option<&str> {
        self.get("name").and_then(Value::as_str)
    }

    pub fn device_class(&self) -> Option<&str> {
        self.get("device_class").and_then(Value::as_str)
    }

    pub fn args(&self) -> Vec<Value> {
        self.get("args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    pub fn kwargs(&self) -> Record {
        self.get("kwargs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active(&self) -> bool {
        self.get("active").and_then(Value::as_bool).unwrap_or(true)
    }

    /// Serialize to a flat record: declared fields in schema order, then
    /// extraneous fields in insertion order.
    pub fn post(&self) -> Record {
        let mut record = self.values.clone();
        for (key, value) in &self.extraneous {
            record.insert(key.clone(), value.clone());
        }
        record
    }

    /// Run every field's enforcement and check that no mandatory field is
    /// left unset. Used by the client before a save.
    pub fn validate(&self) -> Result<()> {
        for spec in self.schema.fields() {
            if let Some(value) = self.values.get(&spec.key) {
                spec.enforce_value(value)?;
            }
        }
        let missing: Vec<&str> = self
            .schema
            .fields()
            .iter()
            .filter(|spec| {
                !spec.optional
                    && self
                        .values
                        .get(&spec.key)
                        .map(Value::is_null)
                        .unwrap_or(true)
            })
            .map(|spec| spec.key.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Entry(format!(
                "Missing mandatory information ({}) for {}",
                missing.join(", "),
                self.schema.name()
            )))
        }
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.post() == other.post()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn unknown_keys_become_extraneous() {
        let item = Item::from_record(
            base_schema(),
            record(json!({"name": "motor1", "note": "spare axis"})),
        )
        .unwrap();
        assert_eq!(item.get("note"), Some(&json!("spare axis")));
        assert_eq!(item.extraneous().len(), 1);
    }

    #[test]
    fn defaults_fill_unspecified_fields() {
        let item = Item::from_record(base_schema(), record(json!({"name": "motor1"}))).unwrap();
        assert_eq!(item.get("active"), Some(&json!(true)));
        assert_eq!(item.get("args"), Some(&json!([])));
        assert_eq!(item.get("documentation"), Some(&Value::Null));
    }

    #[test]
    fn set_enforces_declared_fields() {
        let mut item = Item::new(base_schema());
        assert!(item.set("active", json!("yes")).is_ok());
        assert_eq!(item.get("active"), Some(&json!(true)));
        assert!(item.set("args", json!("not-a-list")).is_err());
    }

    #[test]
    fn post_orders_declared_then_extraneous() {
        let item = Item::from_record(
            base_schema(),
            record(json!({"beamline": "MFX", "name": "motor1", "z": 4.0})),
        )
        .unwrap();
        let post = item.post();
        let keys: Vec<&String> = post.keys().collect();
        assert_eq!(
            keys,
            [
                "name",
                "device_class",
                "args",
                "kwargs",
                "active",
                "documentation",
                "beamline",
                "z"
            ]
        );
    }

    #[test]
    fn equality_is_by_serialized_content() {
        let a = Item::from_record(base_schema(), record(json!({"name": "m", "z": 1.0}))).unwrap();
        let b = Item::from_record(base_schema(), record(json!({"z": 1.0, "name": "m"}))).unwrap();
        let c = Item::from_record(base_schema(), record(json!({"name": "m", "z": 2.0}))).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn validate_reports_unset_mandatory_fields() {
        let item = Item::new(base_schema());
        let err = item.validate().unwrap_err();
        assert!(err.to_string().contains("name"));

        let ok = Item::from_record(base_schema(), record(json!({"name": "motor1"}))).unwrap();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn variant_narrows_without_removing() {
        let schema = epics_schema();
        // Same field count as base plus one: args/kwargs were replaced,
        // prefix appended.
        assert_eq!(schema.fields().len(), base_schema().fields().len() + 1);
        assert_eq!(
            schema.field("args").unwrap().default,
            Some(json!(["{{prefix}}"]))
        );

        let item = Item::from_record(
            schema,
            record(json!({"name": "motor1", "prefix": "MFX:MOT:01"})),
        )
        .unwrap();
        assert!(item.validate().is_ok());
        assert_eq!(item.kwargs().get("name"), Some(&json!("{{name}}")));
    }

    #[test]
    fn variant_missing_mandatory_addition_fails_validation() {
        let item =
            Item::from_record(epics_schema(), record(json!({"name": "motor1"}))).unwrap();
        let err = item.validate().unwrap_err();
        assert!(err.to_string().contains("prefix"));
    }

    #[test]
    fn rejected_construction_on_bad_declared_value() {
        let result = Item::from_record(
            base_schema(),
            record(json!({"name": "motor1", "active": "sometimes"})),
        );
        assert!(result.is_err());
    }
}
