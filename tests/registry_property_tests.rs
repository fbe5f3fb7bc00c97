//! Property-based tests for the handle registry.
//!
//! Property 1: a handle validates with its own tag until destroyed, then never again
//! Property 2: a handle never validates with any other tag
//! Property 3: destroy is idempotent
//! Property 4: concurrent creates never hand out the same handle twice

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use rayon::prelude::*;

use databento_native::registry::{Handle, HandleRegistry, TypeTag, ValidationError};

fn any_tag() -> impl Strategy<Value = TypeTag> {
    prop::sample::select(TypeTag::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property 1: validation succeeds until destroy, fails after
    #[test]
    fn validates_until_destroyed(tag in any_tag(), value in any::<u64>(), lookups in 1usize..5) {
        let registry = HandleRegistry::new();
        let handle = registry.create(tag, Arc::new(value));

        for _ in 0..lookups {
            let got = registry.validate_and_cast::<u64>(handle, tag);
            prop_assert_eq!(got.map(|v| *v), Ok(value));
        }

        prop_assert!(registry.destroy(handle));
        prop_assert_eq!(
            registry.validate_and_cast::<u64>(handle, tag).err(),
            Some(ValidationError::InvalidHandle)
        );
    }

    /// Property 2: any other tag is a type mismatch
    #[test]
    fn other_tags_are_mismatches(created in any_tag(), asked in any_tag()) {
        prop_assume!(created != asked);
        let registry = HandleRegistry::new();
        let handle = registry.create(created, Arc::new(String::from("payload")));

        prop_assert_eq!(
            registry.validate_and_cast::<String>(handle, asked).err(),
            Some(ValidationError::TypeMismatch { expected: asked, actual: created })
        );
        // A failed lookup leaves the entry intact
        prop_assert!(registry.validate_and_cast::<String>(handle, created).is_ok());
    }

    /// Property 3: destroy twice never faults
    #[test]
    fn destroy_is_idempotent(tag in any_tag(), extra in 1usize..4) {
        let registry = HandleRegistry::new();
        let handle = registry.create(tag, Arc::new(()));

        prop_assert!(registry.destroy(handle));
        for _ in 0..extra {
            prop_assert!(!registry.destroy(handle));
        }
        prop_assert!(registry.is_empty());
    }

    /// Never-issued handles are invalid for every tag
    #[test]
    fn unissued_handles_are_invalid(raw in 1usize..usize::MAX, issued in 0usize..8) {
        let registry = HandleRegistry::new();
        let live: HashSet<usize> = (0..issued)
            .map(|i| registry.create(TypeTag::ALL[i % TypeTag::ALL.len()], Arc::new(i)).as_raw())
            .collect();
        prop_assume!(!live.contains(&raw));

        let handle = Handle::from_raw(raw).unwrap();
        for tag in TypeTag::ALL {
            prop_assert_eq!(
                registry.validate_and_cast::<usize>(handle, tag).err(),
                Some(ValidationError::InvalidHandle)
            );
        }
        prop_assert!(!registry.destroy(handle));
        prop_assert_eq!(registry.len(), issued);
    }
}

/// Property 4: 8 threads x 1000 creates yield 8000 distinct handles
#[test]
fn concurrent_creates_are_distinct() {
    let registry = Arc::new(HandleRegistry::new());

    let workers: Vec<_> = (0..8)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                (0..1000)
                    .map(|i| registry.create(TypeTag::ALL[t % TypeTag::ALL.len()], Arc::new((t, i))).as_raw())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for worker in workers {
        for raw in worker.join().expect("Thread should not panic") {
            assert!(seen.insert(raw), "duplicate handle {:#x}", raw);
        }
    }
    assert_eq!(seen.len(), 8000);
    assert_eq!(registry.len(), 8000);
}

/// Concurrent validate and destroy never corrupt neighbouring entries
#[test]
fn parallel_validate_and_destroy() {
    let registry = HandleRegistry::new();
    let handles: Vec<(Handle, usize)> = (0..4000)
        .map(|i| (registry.create(TypeTag::Metadata, Arc::new(i)), i))
        .collect();

    handles.par_iter().for_each(|&(handle, value)| {
        let got = registry
            .validate_and_cast::<usize>(handle, TypeTag::Metadata)
            .expect("live handle must validate");
        assert_eq!(*got, value);
        if value % 2 == 0 {
            assert!(registry.destroy(handle));
        }
    });

    handles.par_iter().for_each(|&(handle, value)| {
        let result = registry.validate_and_cast::<usize>(handle, TypeTag::Metadata);
        if value % 2 == 0 {
            assert_eq!(result.err(), Some(ValidationError::InvalidHandle));
        } else {
            assert_eq!(*result.unwrap(), value);
        }
    });
    assert_eq!(registry.len(), 2000);
}

/// Racing destroys: exactly one caller removes each entry
#[test]
fn racing_takes_remove_once() {
    let registry = HandleRegistry::new();
    let handles: Vec<Handle> = (0..500)
        .map(|i| registry.create(TypeTag::LiveClient, Arc::new(i as u32)))
        .collect();

    let wins: usize = (0..4)
        .into_par_iter()
        .map(|_| {
            handles
                .iter()
                .filter(|&&h| registry.take::<u32>(h, TypeTag::LiveClient).is_ok())
                .count()
        })
        .sum();
    assert_eq!(wins, 500);
    assert!(registry.is_empty());
}
