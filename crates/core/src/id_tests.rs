use super::*;
use std::collections::HashMap;

crate::define_id! {
    /// Test ID type for macro verification.
    pub struct TestId("tst_");
}

#[test]
fn new_ids_are_unique_and_prefixed() {
    let a = TestId::new();
    let b = TestId::new();
    assert_ne!(a, b);
    assert!(a.as_str().starts_with("tst_"));
}

#[test]
fn round_trips_through_display_and_from_string() {
    let a = TestId::new();
    let parsed = TestId::from_string(a.to_string());
    assert_eq!(a, parsed);
}

#[test]
fn usable_as_hash_map_key_via_borrow_str() {
    let id = TestId::from_string("tst_abc");
    let mut map = HashMap::new();
    map.insert(id, 42);
    assert_eq!(map.get("tst_abc"), Some(&42));
}

#[test]
fn partial_eq_str() {
    let id = TestId::from_string("tst_abc");
    assert_eq!(id, "tst_abc");
}
