use docbridge_core::translator::{Descriptor, IdentifierTranslator};
use docbridge_core::EntityKind;
use docbridge_source::ObjectId;
use proptest::prelude::*;
use std::collections::HashMap;
use uuid::Uuid;

fn source(n: u8) -> ObjectId {
    let mut bytes = [0x65; 12];
    bytes[11] = n;
    ObjectId::from_bytes(bytes)
}

fn key(n: u8) -> Uuid {
    Uuid::from_u128(0x1000 + u128::from(n))
}

fn kind(n: u8) -> EntityKind {
    match n % 3 {
        0 => EntityKind::User,
        1 => EntityKind::Course,
        _ => EntityKind::Session,
    }
}

/// (source, key) attempts over small pools so collisions are frequent.
fn attempts() -> impl Strategy<Value = Vec<(u8, u8)>> {
    prop::collection::vec((0u8..8, 0u8..8), 0..40)
}

fn build(attempts: &[(u8, u8)]) -> (IdentifierTranslator, HashMap<u8, u8>) {
    let mut translator = IdentifierTranslator::new();
    let mut accepted: HashMap<u8, u8> = HashMap::new();
    for &(s, k) in attempts {
        let result = translator.register(source(s), key(k), Descriptor::new(kind(s), format!("e{s}")));
        let consistent = match accepted.get(&s) {
            Some(existing) => *existing == k,
            None => !accepted.values().any(|v| *v == k),
        };
        assert_eq!(result.is_ok(), consistent, "attempt ({s}, {k}) after {accepted:?}");
        if consistent {
            accepted.insert(s, k);
        }
    }
    (translator, accepted)
}

// ============================================================================
// Uniqueness
// ============================================================================

proptest! {
    #[test]
    fn prop_mapping_stays_one_to_one(attempts in attempts()) {
        let (translator, accepted) = build(&attempts);

        prop_assert_eq!(translator.len(), accepted.len());
        for (s, k) in &accepted {
            prop_assert_eq!(translator.resolve(source(*s)), Some(key(*k)));
            prop_assert_eq!(translator.source_of(key(*k)), Some(source(*s)));
        }
        for s in 0u8..8 {
            if !accepted.contains_key(&s) {
                prop_assert!(translator.resolve(source(s)).is_none());
            }
        }
    }

    #[test]
    fn prop_reregistering_an_accepted_pair_is_a_noop(attempts in attempts()) {
        let (mut translator, accepted) = build(&attempts);
        let before = translator.len();
        for (s, k) in &accepted {
            let added = translator
                .register(source(*s), key(*k), Descriptor::new(kind(*s), "again"))
                .unwrap();
            prop_assert!(!added);
        }
        prop_assert_eq!(translator.len(), before);
    }

    #[test]
    fn prop_snapshot_restores_every_mapping(attempts in attempts()) {
        let (translator, accepted) = build(&attempts);

        let mut restored = IdentifierTranslator::new();
        let added = restored.bulk_import(translator.bulk_export()).unwrap();
        prop_assert_eq!(added, accepted.len());
        for (s, k) in &accepted {
            prop_assert_eq!(restored.resolve_kind(source(*s), kind(*s)), Some(key(*k)));
        }

        // Importing the same snapshot again adds nothing.
        prop_assert_eq!(restored.bulk_import(translator.bulk_export()).unwrap(), 0);
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_persisted_file_reopens_with_same_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mapping.json");

    let mut translator = IdentifierTranslator::open(&path).unwrap();
    for n in 0..5 {
        translator
            .register(source(n), key(n), Descriptor::new(kind(n), format!("entity {n}")))
            .unwrap();
    }
    assert!(translator.is_dirty());
    translator.persist().unwrap();
    assert!(!translator.is_dirty());

    let reopened = IdentifierTranslator::open(&path).unwrap();
    assert_eq!(reopened.len(), 5);
    assert_eq!(reopened.count_kind(EntityKind::User), 2);
    assert_eq!(reopened.descriptor(source(3)).unwrap().display_name, "entity 3");
}

#[test]
fn test_conflicting_import_changes_nothing() {
    let mut translator = IdentifierTranslator::new();
    translator
        .register(source(1), key(1), Descriptor::new(EntityKind::User, "a"))
        .unwrap();

    let mut other = IdentifierTranslator::new();
    other
        .register(source(2), key(2), Descriptor::new(EntityKind::User, "b"))
        .unwrap();
    other
        .register(source(1), key(9), Descriptor::new(EntityKind::User, "a"))
        .unwrap();

    assert!(translator.bulk_import(other.bulk_export()).is_err());
    assert_eq!(translator.len(), 1);
    assert!(translator.resolve(source(2)).is_none());
}
