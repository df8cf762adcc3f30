//! Property-based tests for the allocator and the tiered pond
//!
//! # Test Properties
//!
//! 1. **Allocator round trip**: live blocks keep their contents through any
//!    interleaving of malloc, realloc and free, and the bins stay consistent
//! 2. **Tier exclusivity**: after any sequence of pond operations every
//!    used node sits in exactly one tier and the counters match the tiers
//! 3. **Purge monotonicity**: a size-targeted purge never exceeds its node
//!    budget and only reports success when the estimates reach the target
//! 4. **Rehash losslessness**: every record is found after a rehash
//! 5. **Migration reachability**: every record stays reachable at every
//!    step of an incremental hash migration, whatever else happens meanwhile

use proptest::prelude::*;
use shmpond::{
    Allocator, BinAllocator, Handle, HashAlgorithm, MemoryRegion, MemoryRegionBuilder, Pond,
    PondBuilder, RecordState, VecJournal,
};
use std::collections::HashMap;

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum AllocOp {
    Malloc(usize),
    Realloc(usize, usize),
    Free(usize),
}

fn alloc_op_strategy() -> impl Strategy<Value = AllocOp> {
    prop_oneof![
        4 => (1usize..2048).prop_map(AllocOp::Malloc),
        1 => (1usize..64 * 1024).prop_map(AllocOp::Malloc),
        2 => (any::<usize>(), 1usize..4096).prop_map(|(i, s)| AllocOp::Realloc(i, s)),
        3 => any::<usize>().prop_map(AllocOp::Free),
    ]
}

#[derive(Debug, Clone)]
enum PondOp {
    Insert(u8, u8, u32, bool),
    Update(u8, u8, u32),
    Purge(u8),
    Get(u8),
    MarkClean(u8),
    Marker,
    Flush(u8),
    PurgeSize(u16, u8),
}

fn pond_op_strategy() -> impl Strategy<Value = PondOp> {
    prop_oneof![
        5 => (0u8..40, any::<u8>(), 0u32..3, any::<bool>())
            .prop_map(|(k, len, rows, dirty)| PondOp::Insert(k, len, rows, dirty)),
        3 => (0u8..40, any::<u8>(), 0u32..3).prop_map(|(k, len, rows)| PondOp::Update(k, len, rows)),
        2 => (0u8..40).prop_map(PondOp::Purge),
        2 => (0u8..40).prop_map(PondOp::Get),
        1 => (0u8..40).prop_map(PondOp::MarkClean),
        1 => Just(PondOp::Marker),
        1 => (0u8..8).prop_map(PondOp::Flush),
        1 => (any::<u16>(), 1u8..10).prop_map(|(s, c)| PondOp::PurgeSize(s, c)),
    ]
}

fn create_heap() -> BinAllocator<MemoryRegion> {
    let region = MemoryRegionBuilder::new().size(2 * 1024 * 1024).build().unwrap();
    BinAllocator::init(region).unwrap()
}

fn create_pond(empty_filter: bool) -> Pond<MemoryRegion, VecJournal> {
    let region = MemoryRegionBuilder::new().size(4 * 1024 * 1024).build().unwrap();
    PondBuilder::new()
        .journal(VecJournal::new())
        .hash_buckets(17)
        .empty_filter(empty_filter)
        .create(region)
        .unwrap()
}

fn fill(heap: &mut BinAllocator<MemoryRegion>, handle: Handle, size: usize, byte: u8) {
    heap.bytes_mut(handle, size).unwrap().fill(byte);
}

// =============================================================================
// Allocator
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: live blocks keep their contents and freeing everything
    /// returns the heap to no user allocations.
    #[test]
    fn prop_alloc_round_trip(ops in prop::collection::vec(alloc_op_strategy(), 1..200)) {
        let mut heap = create_heap();
        let mut live: Vec<(Handle, usize, u8)> = Vec::new();
        let mut stamp = 0u8;

        for op in ops {
            stamp = stamp.wrapping_add(1);
            match op {
                AllocOp::Malloc(size) => {
                    let handle = heap.malloc(size);
                    if handle.is_valid() {
                        prop_assert!(heap.chunk_size(handle) >= size);
                        fill(&mut heap, handle, size, stamp);
                        live.push((handle, size, stamp));
                    }
                }
                AllocOp::Realloc(i, size) if !live.is_empty() => {
                    let idx = i % live.len();
                    let (handle, old_size, byte) = live[idx];
                    let moved = heap.realloc(handle, size);
                    if moved.is_valid() {
                        let kept = old_size.min(size);
                        prop_assert!(heap.bytes(moved, kept).unwrap().iter().all(|&b| b == byte));
                        fill(&mut heap, moved, size, byte);
                        live[idx] = (moved, size, byte);
                    }
                }
                AllocOp::Free(i) if !live.is_empty() => {
                    let (handle, _, _) = live.swap_remove(i % live.len());
                    prop_assert!(heap.free(handle).is_ok());
                }
                _ => {}
            }
        }

        for &(handle, size, byte) in live.iter() {
            prop_assert!(heap.bytes(handle, size).unwrap().iter().all(|&b| b == byte));
        }
        prop_assert!(heap.check_bins().is_ok());

        for (handle, _, _) in live.drain(..) {
            prop_assert!(heap.free(handle).is_ok());
        }
        prop_assert_eq!(heap.user_alloc_count(), 0);
        prop_assert!(heap.check_bins().is_ok());
    }
}

// =============================================================================
// Pond
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: every node sits in exactly one tier, the counters agree
    /// with the tiers, and cached values match a model map.
    #[test]
    fn prop_tier_exclusivity(
        empty_filter in any::<bool>(),
        ops in prop::collection::vec(pond_op_strategy(), 1..150),
    ) {
        let mut pond = create_pond(empty_filter);
        let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                PondOp::Insert(k, len, rows, dirty) => {
                    let key = format!("key-{}", k).into_bytes();
                    let value = vec![k; len as usize];
                    let state = if dirty { RecordState::Dirty } else { RecordState::Clean };
                    match pond.insert(&key, &value, rows, state) {
                        Ok(_) => {
                            prop_assert!(!model.contains_key(&key));
                            model.insert(key, value);
                        }
                        Err(shmpond::Error::KeyExists) => prop_assert!(model.contains_key(&key)),
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                }
                PondOp::Update(k, len, rows) => {
                    let key = format!("key-{}", k).into_bytes();
                    let value = vec![len; len as usize];
                    match pond.update(&key, &value, rows) {
                        Ok(()) => {
                            model.insert(key, value);
                        }
                        Err(shmpond::Error::KeyNotFound) => prop_assert!(!model.contains_key(&key)),
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                }
                PondOp::Purge(k) => {
                    let key = format!("key-{}", k).into_bytes();
                    let found = pond.purge(&key).is_ok();
                    prop_assert_eq!(found, model.remove(&key).is_some());
                }
                PondOp::Get(k) => {
                    let key = format!("key-{}", k).into_bytes();
                    prop_assert_eq!(pond.get(&key).unwrap(), model.get(&key).cloned());
                }
                PondOp::MarkClean(k) => {
                    let key = format!("key-{}", k).into_bytes();
                    prop_assert_eq!(pond.mark_clean(&key).is_ok(), model.contains_key(&key));
                }
                PondOp::Marker => {
                    pond.insert_time_marker(0).unwrap();
                }
                PondOp::Flush(max) => {
                    pond.flush_until_marker(max as usize).unwrap();
                }
                PondOp::PurgeSize(size, count) => {
                    let outcome = pond.try_purge_size(size as usize, None, count as usize).unwrap();
                    prop_assert!(outcome.purged <= count as usize);
                    prop_assert_eq!(outcome.satisfied, outcome.freed >= size as usize);
                    model.retain(|key, _| pond.contains(key).unwrap());
                }
            }
            prop_assert!(pond.verify().is_ok(), "{:?}", pond.verify());
        }

        prop_assert_eq!(pond.total_used_node().unwrap(), model.len() as u64);
        for (key, value) in model.iter() {
            prop_assert_eq!(pond.value(key).unwrap(), Some(&value[..]));
        }
    }

    /// Property: a rehash to any bucket count and algorithm loses nothing.
    #[test]
    fn prop_rehash_lossless(
        count in 1usize..300,
        buckets in 1u32..512,
        murmur in any::<bool>(),
    ) {
        let mut pond = create_pond(false);
        for i in 0..count {
            pond.insert(format!("r{}", i).as_bytes(), &i.to_le_bytes(), 1, RecordState::Clean)
                .unwrap();
        }
        let algorithm = if murmur { HashAlgorithm::Murmur } else { HashAlgorithm::Elf };
        pond.rehash(buckets, algorithm).unwrap();

        for i in 0..count {
            prop_assert_eq!(pond.value(format!("r{}", i).as_bytes()).unwrap(), Some(&i.to_le_bytes()[..]));
        }
        prop_assert!(pond.verify().is_ok());
    }

    /// Property: records stay reachable throughout an incremental hash
    /// migration interleaved with inserts, accesses and purges.
    #[test]
    fn prop_migration_reachable(
        count in 1usize..200,
        step in 1u32..8,
        churn in prop::collection::vec((0usize..400, 0u8..3), 0..60),
    ) {
        let mut pond = create_pond(false);
        let mut live: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        for i in 0..count {
            let key = format!("m{}", i).into_bytes();
            pond.insert(&key, &i.to_le_bytes(), 1, RecordState::Clean).unwrap();
            live.insert(key, i.to_le_bytes().to_vec());
        }
        prop_assert!(pond.begin_hash_migration(HashAlgorithm::Murmur).unwrap());

        let mut churn = churn.into_iter();
        loop {
            if let Some((i, action)) = churn.next() {
                let key = format!("m{}", i).into_bytes();
                match action {
                    0 if !live.contains_key(&key) => {
                        pond.insert(&key, b"new", 1, RecordState::Clean).unwrap();
                        live.insert(key, b"new".to_vec());
                    }
                    1 => {
                        prop_assert_eq!(pond.get(&key).unwrap(), live.get(&key).cloned());
                    }
                    2 => {
                        prop_assert_eq!(pond.purge(&key).is_ok(), live.remove(&key).is_some());
                    }
                    _ => {}
                }
            }
            for (key, value) in live.iter() {
                prop_assert_eq!(pond.value(key).unwrap(), Some(&value[..]));
            }
            prop_assert!(pond.verify().is_ok(), "{:?}", pond.verify());
            if pond.migrate_hash(step).unwrap() {
                break;
            }
        }
        prop_assert!(!pond.hash_migration_pending().unwrap());
        for (key, value) in live.iter() {
            prop_assert_eq!(pond.value(key).unwrap(), Some(&value[..]));
        }
    }
}
