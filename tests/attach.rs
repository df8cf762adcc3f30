//! Re-attaching a pond at a different base address, from memory and from a
//! mapped file

use shmpond::{
    Error, Handle, MemoryRegion, MemoryRegionBuilder, MmapRegionBuilder, PondBuilder, Region,
    RecordState, StartupMode, Tier,
};

fn key(i: u32) -> Vec<u8> {
    format!("record-{:05}", i).into_bytes()
}

#[test]
fn test_handles_stable_across_bases() {
    let region = MemoryRegionBuilder::new().size(4 * 1024 * 1024).build().unwrap();
    let mut pond = PondBuilder::new().create(region).unwrap();

    let mut handles: Vec<(Vec<u8>, Handle)> = Vec::new();
    for i in 0..500 {
        let state = if i % 3 == 0 { RecordState::Dirty } else { RecordState::Clean };
        pond.insert(&key(i), &i.to_le_bytes(), 1, state).unwrap();
        handles.push((key(i), pond.record_handle(&key(i)).unwrap().unwrap()));
    }
    let dirty = pond.total_dirty_node().unwrap();
    let region = pond.close().unwrap();
    let original_base = region.base_ptr();

    let copy = MemoryRegion::copy_from(region.as_bytes()).unwrap();
    assert_ne!(copy.base_ptr(), original_base);
    drop(region);

    let pond = PondBuilder::new().attach(copy).unwrap();
    assert_eq!(pond.startup_mode(), StartupMode::Attached);
    assert_eq!(pond.total_used_node().unwrap(), 500);
    assert_eq!(pond.total_dirty_node().unwrap(), dirty);
    for (i, (key, handle)) in handles.iter().enumerate() {
        assert_eq!(pond.record_handle(key).unwrap(), Some(*handle));
        assert_eq!(pond.value(key).unwrap(), Some(&(i as u32).to_le_bytes()[..]));
    }
    pond.verify().unwrap();
}

#[test]
fn test_unformatted_region_rejected() {
    let region = MemoryRegionBuilder::new().size(1024 * 1024).build().unwrap();
    assert!(matches!(PondBuilder::new().attach(region), Err(Error::Format(_))));

    let region = MemoryRegionBuilder::new().size(1024 * 1024).build().unwrap();
    let pond = PondBuilder::new().open(region).unwrap();
    assert_eq!(pond.startup_mode(), StartupMode::Created);
}

#[test]
fn test_mmap_file_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pond.region");

    let mut pond = PondBuilder::new()
        .region_size(2 * 1024 * 1024)
        .empty_filter(true)
        .open_file(&path)
        .unwrap();
    assert_eq!(pond.startup_mode(), StartupMode::Created);
    pond.insert(b"persisted", b"across mappings", 2, RecordState::Dirty)
        .unwrap();
    pond.insert(b"empty", b"", 0, RecordState::Clean).unwrap();
    pond.close().unwrap();

    let pond = PondBuilder::new()
        .region_size(2 * 1024 * 1024)
        .empty_filter(true)
        .open_file(&path)
        .unwrap();
    assert_eq!(pond.startup_mode(), StartupMode::Attached);
    assert_eq!(pond.value(b"persisted").unwrap(), Some(&b"across mappings"[..]));
    assert_eq!(pond.tier_of(b"persisted").unwrap(), Some(Tier::Dirty));
    assert_eq!(pond.tier_of(b"empty").unwrap(), Some(Tier::Empty));
    assert_eq!(pond.total_dirty_row().unwrap(), 2);
    pond.verify().unwrap();
}

#[test]
fn test_mmap_unclean_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pond.region");

    let mut pond = PondBuilder::new()
        .region_size(2 * 1024 * 1024)
        .open_file(&path)
        .unwrap();
    pond.insert(b"k", b"v", 1, RecordState::Clean).unwrap();
    pond.flush().unwrap();
    drop(pond);

    let reopened = PondBuilder::new()
        .region_size(2 * 1024 * 1024)
        .open_file(&path);
    assert!(reopened.err().is_some_and(|e| e.is_integrity()));

    let pond = PondBuilder::new()
        .region_size(2 * 1024 * 1024)
        .auto_delete_dirty(true)
        .open_file(&path)
        .unwrap();
    assert_eq!(pond.startup_mode(), StartupMode::Created);
    assert!(!pond.contains(b"k").unwrap());
}

#[test]
fn test_mmap_size_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pond.region");
    PondBuilder::new()
        .region_size(2 * 1024 * 1024)
        .open_file(&path)
        .unwrap()
        .close()
        .unwrap();

    let region = MmapRegionBuilder::new(&path).size(4 * 1024 * 1024).build();
    assert!(region.is_err());

    let region = MmapRegionBuilder::new(&path).build().unwrap();
    assert_eq!(region.len(), 2 * 1024 * 1024);
}

#[test]
fn test_mmap_inspect_is_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pond.region");

    let mut pond = PondBuilder::new()
        .region_size(2 * 1024 * 1024)
        .key_size(8)
        .open_file(&path)
        .unwrap();
    pond.insert(&42u64.to_le_bytes(), b"answer", 1, RecordState::Dirty)
        .unwrap();
    pond.flush().unwrap();
    drop(pond);
    let before = std::fs::read(&path).unwrap();

    let region = MmapRegionBuilder::new(&path).build().unwrap();
    let pond = PondBuilder::new().inspect(region).unwrap();
    assert!(!pond.region_clean());
    assert_eq!(pond.config().key_size, 8);
    assert_eq!(pond.value(&42u64.to_le_bytes()).unwrap(), Some(&b"answer"[..]));
    pond.verify().unwrap();
    pond.close().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), before);
    let reopened = PondBuilder::new()
        .region_size(2 * 1024 * 1024)
        .key_size(8)
        .open_file(&path);
    assert!(reopened.err().is_some_and(|e| e.is_integrity()));
}
