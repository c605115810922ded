use roster::store::json::JsonBackend;
use roster::{base_schema, Client, Item};
use serde_json::json;
use tempfile::TempDir;

fn item(name: &str) -> Item {
    Item::from_record(
        base_schema(),
        json!({"name": name}).as_object().cloned().unwrap(),
    )
    .unwrap()
}

fn setup() -> (TempDir, Client) {
    let dir = TempDir::new().unwrap();
    let client = Client::with_backend(JsonBackend::new(dir.path().join("db.json")));
    (dir, client)
}

/// Append a record to the store file directly, the way a second process
/// would.
fn external_write(dir: &TempDir, name: &str) {
    let other = JsonBackend::new(dir.path().join("db.json"));
    let client = Client::with_backend(other);
    client.add(&item(name)).unwrap();
}

#[test]
fn searches_track_external_writers_by_default() {
    let (dir, client) = setup();
    client.add(&item("m1")).unwrap();
    assert_eq!(client.entries().unwrap().len(), 1);

    external_write(&dir, "m2");
    assert_eq!(client.entries().unwrap().len(), 2);
}

#[test]
fn retain_cache_scope_pins_a_snapshot() {
    let (dir, client) = setup();
    client.add(&item("m1")).unwrap();

    {
        let _guard = client.retain_cache();
        assert_eq!(client.entries().unwrap().len(), 1);

        external_write(&dir, "m2");

        // Repeated reads inside the scope observe the same snapshot.
        assert_eq!(client.entries().unwrap().len(), 1);
        assert_eq!(client.len().unwrap(), 1);
    }

    // Scope ended: the cache was invalidated on the way out.
    assert_eq!(client.entries().unwrap().len(), 2);
}

#[test]
fn retain_cache_releases_on_early_exit() {
    let (dir, client) = setup();
    client.add(&item("m1")).unwrap();

    let peek = || -> roster::Result<usize> {
        let _guard = client.retain_cache();
        client.entries()?;
        // An early return still drops the guard.
        Err(roster::Error::Search("bail out".to_string()))
    };
    assert!(peek().is_err());

    external_write(&dir, "m2");
    assert_eq!(client.entries().unwrap().len(), 2);
}

#[test]
fn retain_cache_can_keep_the_warm_cache() {
    let (dir, client) = setup();
    client.add(&item("m1")).unwrap();

    // Warm the cache, then enter a scope without clearing first.
    assert_eq!(client.entries().unwrap().len(), 1);
    external_write(&dir, "m2");

    {
        let _guard = client.retain_cache_with(false);
        assert_eq!(client.entries().unwrap().len(), 1);
    }
    assert_eq!(client.entries().unwrap().len(), 2);
}
