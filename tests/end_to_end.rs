//! Full-stack checks: records on disk, through the client, out of the
//! loader as live objects.

use std::sync::Arc;

use roster::store::json::JsonBackend;
use roster::{
    base_schema, epics_schema, Client, Factory, FactoryObject, Item, Loader, Record,
};
use serde_json::{json, Value};
use tempfile::TempDir;

#[derive(Debug, PartialEq)]
struct Motor {
    prefix: String,
    label: String,
}

fn motor_factory() -> Factory {
    Arc::new(|args: &[Value], kwargs: &Record| {
        Ok(Arc::new(Motor {
            prefix: args
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            label: kwargs
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }) as FactoryObject)
    })
}

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn setup() -> (TempDir, Client, Loader) {
    let dir = TempDir::new().unwrap();
    let client = Client::with_backend(JsonBackend::new(dir.path().join("db.json")));
    let loader = Loader::new();
    loader
        .register_factory("motion.Motor", motor_factory())
        .unwrap();
    (dir, client, loader)
}

#[test]
fn saved_item_round_trips_with_extraneous_fields() {
    let (_dir, client, _loader) = setup();
    let original = Item::from_record(
        epics_schema(),
        record(json!({
            "name": "motor1",
            "device_class": "motion.Motor",
            "prefix": "MFX:MOT:01",
            "beamline": "MFX",
            "stand": "DG2"
        })),
    )
    .unwrap();
    client.add(&original).unwrap();

    let fetched = client.find(&record(json!({"name": "motor1"}))).unwrap();
    assert_eq!(*fetched.item(), original);
    assert_eq!(fetched.item().get("stand"), Some(&json!("DG2")));
}

#[test]
fn search_result_loads_with_substituted_macros() {
    let (_dir, client, loader) = setup();
    client
        .add(
            &Item::from_record(
                epics_schema(),
                record(json!({
                    "name": "motor1",
                    "device_class": "motion.Motor",
                    "prefix": "MFX:MOT:01"
                })),
            )
            .unwrap(),
        )
        .unwrap();

    let result = client.find(&record(json!({"name": "motor1"}))).unwrap();
    let loaded = result.load(&loader).unwrap();
    assert_eq!(
        loaded.object_as::<Motor>().unwrap(),
        &Motor {
            prefix: "MFX:MOT:01".into(),
            label: "motor1".into()
        }
    );

    // The originating container rides along as metadata.
    assert_eq!(loaded.md().unwrap(), result.item());
}

#[test]
fn load_item_is_find_plus_instantiate() {
    let (_dir, client, loader) = setup();
    client
        .add(
            &Item::from_record(
                epics_schema(),
                record(json!({
                    "name": "motor1",
                    "device_class": "motion.Motor",
                    "prefix": "P"
                })),
            )
            .unwrap(),
        )
        .unwrap();

    let loaded = client
        .load_item(&loader, &record(json!({"name": "motor1"})))
        .unwrap();
    assert!(loaded.object_as::<Motor>().is_some());
}

#[test]
fn identity_cache_survives_a_store_round_trip() {
    let (_dir, client, loader) = setup();
    let motor = Item::from_record(
        epics_schema(),
        record(json!({
            "name": "motor1",
            "device_class": "motion.Motor",
            "prefix": "P"
        })),
    )
    .unwrap();
    client.add(&motor).unwrap();

    let first = loader.from_item(&motor).unwrap();

    // Re-reading from storage yields an equal item, so the loader hands
    // back the cached object.
    let reread = client.find(&record(json!({"name": "motor1"}))).unwrap();
    let second = reread.load(&loader).unwrap();
    assert!(Arc::ptr_eq(first.object(), second.object()));

    // Editing and re-saving drifts the fingerprint.
    let mut edited = reread.into_item();
    edited.set("documentation", json!("swapped cable")).unwrap();
    client.save(&edited).unwrap();
    let third = loader.from_item(&edited).unwrap();
    assert!(!Arc::ptr_eq(first.object(), third.object()));
}

#[test]
fn malformed_records_on_disk_are_isolated() {
    let (dir, client, _loader) = setup();
    for name in ["ok1", "ok2", "ok3"] {
        client
            .add(
                &Item::from_record(base_schema(), record(json!({"name": name}))).unwrap(),
            )
            .unwrap();
    }

    // Sneak a record missing its declared type's mandatory field into
    // the store file, bypassing client validation.
    let backend = JsonBackend::new(dir.path().join("db.json"));
    let mut broken = record(json!({"name": "broken", "type": "EpicsItem"}));
    broken.insert("_id".to_string(), json!("broken"));
    {
        use roster::store::Backend;
        backend.save("broken", broken, true).unwrap();
    }

    let hits = client.entries().unwrap();
    assert_eq!(hits.len(), 4);
    assert_eq!(hits.iter().filter(|h| h.is_valid()).count(), 3);

    let invalid = hits.iter().find_map(|h| h.as_invalid()).unwrap();
    assert_eq!(invalid.name(), "broken");
    assert!(!invalid.error().to_string().is_empty());
}

#[test]
fn mapping_access_over_the_store() {
    let (_dir, client, _loader) = setup();
    for name in ["m1", "m2"] {
        client
            .add(
                &Item::from_record(base_schema(), record(json!({"name": name}))).unwrap(),
            )
            .unwrap();
    }

    assert_eq!(client.len().unwrap(), 2);
    assert!(client.contains("m1").unwrap());
    let mut keys = client.keys().unwrap();
    keys.sort();
    assert_eq!(keys, ["m1", "m2"]);
    for (name, item) in client.items().unwrap() {
        assert_eq!(item.name(), Some(name.as_str()));
    }
}
