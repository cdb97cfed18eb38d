use super::{StateError, StateStore};
use std::collections::BTreeMap;
use tempfile::tempdir;

#[test]
pub fn push_then_get() {
    let mut store = StateStore::default();
    store.push_state("k", &42u64).unwrap();

    assert!(store.check_state("k").unwrap());
    assert_eq!(store.get_state::<u64>("k").unwrap(), 42);
}

#[test]
pub fn repeated_push_of_same_value_is_idempotent() {
    let mut store = StateStore::default();
    store.push_state("k", &42i32).unwrap();
    store.push_state("k", &42i32).unwrap();

    assert_eq!(store.get_state::<i32>("k").unwrap(), 42);
    assert_eq!(store.len(), 1);
}

#[test]
pub fn push_of_different_value_is_rejected() {
    let mut store = StateStore::default();
    store.push_state("k", &42i32).unwrap();

    assert!(matches!(
        store.push_state("k", &43i32),
        Err(StateError::AlreadyClaimed(key)) if key == "k"
    ));
    assert_eq!(store.get_state::<i32>("k").unwrap(), 42);
}

#[test]
pub fn cleared_state_is_gone() {
    let mut store = StateStore::default();
    store.push_state("k", &42i32).unwrap();
    store.clear_state("k").unwrap();

    assert!(!store.check_state("k").unwrap());
    assert!(matches!(
        store.get_state::<i32>("k"),
        Err(StateError::Unavailable(_))
    ));
    // clearing an absent key is fine
    store.clear_state("k").unwrap();
}

#[test]
pub fn invalid_keys() {
    let mut store = StateStore::default();

    for key in ["", "a/b", "a\\b", ".."] {
        assert!(matches!(
            store.push_state(key, &1u8),
            Err(StateError::InvalidKey(_))
        ));
        assert!(matches!(
            store.check_state(key),
            Err(StateError::InvalidKey(_))
        ));
    }
}

#[test]
pub fn disk_mirror_survives_a_new_store() {
    let dir = tempdir().unwrap();

    let mut first = StateStore::new(Some(dir.path().to_path_buf()));
    first
        .push_state("run-7", &("partial".to_string(), vec![1u32, 2, 3]))
        .unwrap();
    assert!(dir.path().join("SavedState_run-7.dat").exists());
    assert!(!dir.path().join("SavedState_run-7.dat_tmp").exists());

    let mut second = StateStore::new(Some(dir.path().to_path_buf()));
    assert_eq!(second.len(), 0);
    assert!(second.check_state("run-7").unwrap());
    assert_eq!(
        second.get_state::<(String, Vec<u32>)>("run-7").unwrap(),
        ("partial".to_string(), vec![1, 2, 3])
    );

    second.clear_state("run-7").unwrap();
    assert!(!dir.path().join("SavedState_run-7.dat").exists());
    assert!(!first.check_state("missing").unwrap());
}

#[test]
pub fn stale_entries_are_evicted() {
    let mut store = StateStore::with_limits(None, 10, 5);

    for index in 0..10 {
        store.push_state(&format!("key{index}"), &index).unwrap();
    }
    assert_eq!(store.len(), 10);

    // keep key0 fresh, everything else falls behind the window
    for _ in 0..5 {
        store.check_state("key0").unwrap();
    }
    store.push_state("key10", &10).unwrap();

    assert_eq!(store.len(), 2);
    assert!(store.check_state("key0").unwrap());
    assert!(store.check_state("key10").unwrap());
    assert!(!store.check_state("key3").unwrap());
}

#[test]
pub fn evicted_entries_reload_from_disk() {
    let dir = tempdir().unwrap();
    let mut store = StateStore::with_limits(Some(dir.path().to_path_buf()), 2, 1);

    store.push_state("a", &1u8).unwrap();
    store.push_state("b", &2u8).unwrap();
    store.push_state("c", &3u8).unwrap();
    assert!(store.len() < 3);

    assert_eq!(store.get_state::<u8>("a").unwrap(), 1);
    assert_eq!(store.get_state::<u8>("b").unwrap(), 2);
}

#[test]
pub fn snapshot_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("SavedState_3.dat");

    let mut store = StateStore::default();
    let mut totals = BTreeMap::new();
    totals.insert(1u32, 10.5f64);
    store.push_state("totals", &totals).unwrap();
    store.push_state("label", "worker 3").unwrap();
    store.save_snapshot(&path).unwrap();

    let mut restored = StateStore::default();
    assert_eq!(restored.load_snapshot(&path).unwrap(), 2);
    assert_eq!(
        restored.get_state::<BTreeMap<u32, f64>>("totals").unwrap(),
        totals
    );
    assert_eq!(restored.get_state::<String>("label").unwrap(), "worker 3");

    assert_eq!(
        restored
            .load_snapshot(&dir.path().join("SavedState_9.dat"))
            .unwrap(),
        0
    );
}
