use super::*;

#[test]
fn memory_store_set_get_remove() {
    let store = MemoryStore::new();
    assert_eq!(store.get("k").unwrap(), None);
    store.set("k", "v1").unwrap();
    store.set("k", "v2").unwrap();
    assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
    store.remove("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
}

#[test]
fn memory_store_remove_missing_is_ok() {
    let store = MemoryStore::new();
    assert!(store.remove("absent").is_ok());
}

#[test]
fn file_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("session.json");

    let store = FileStore::open(&path).unwrap();
    store.set("signup.role", "tenant").unwrap();
    store.set("auth-session-active", "true").unwrap();
    store.remove("auth-session-active").unwrap();
    drop(store);

    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(reopened.get("signup.role").unwrap().as_deref(), Some("tenant"));
    assert_eq!(reopened.get("auth-session-active").unwrap(), None);
    assert_eq!(reopened.path(), path.as_path());
}

#[test]
fn file_store_treats_empty_file_as_empty_map() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    std::fs::write(&path, "  ").unwrap();
    let store = FileStore::open(&path).unwrap();
    assert_eq!(store.get("anything").unwrap(), None);
}

#[test]
fn file_store_starts_empty_over_corrupt_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    std::fs::write(&path, "{not json").unwrap();

    let store = FileStore::open(&path).unwrap();
    assert_eq!(store.get("direct-auth-session").unwrap(), None);

    store.set("signup.role", "landlord").unwrap();
    drop(store);
    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(reopened.get("signup.role").unwrap().as_deref(), Some("landlord"));
}

#[test]
fn file_store_open_fails_when_path_is_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(FileStore::open(dir.path()), Err(StoreError::Io(_))));
}
