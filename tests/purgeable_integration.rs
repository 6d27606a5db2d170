//! Integration tests for purgeable memory end-to-end behavior.
//!
//! These drive the public API the way an application would: create with a
//! build step, read/write through guards, purge, and verify that rebuilds
//! reproduce content byte-for-byte.

use purgemem::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fill(byte: u8) -> impl Fn(&mut [u8]) -> bool + Send + Sync + 'static {
    move |data: &mut [u8]| {
        data.fill(byte);
        true
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Create, read both ends of the content, destroy.
#[test]
fn test_create_read_destroy() {
    let mem = PurgeableMem::new(4096, fill(0xAB)).unwrap();

    {
        let content = mem.begin_read().unwrap();
        assert_eq!(content.len(), 4096);
        assert_eq!(content[0], 0xAB);
        assert_eq!(content[4095], 0xAB);
    }

    assert!(mem.destroy());
}

/// Zero-size creation is rejected outright.
#[test]
fn test_create_zero_size_rejected() {
    assert!(matches!(
        PurgeableMem::new(0, fill(0xAB)).unwrap_err(),
        Error::ZeroSize
    ));
}

// ============================================================================
// Purge and rebuild
// ============================================================================

/// A purge costs exactly one rebuild and reproduces every byte.
#[test]
fn test_purge_then_rebuild() {
    let mem = PurgeableMem::new(8192, fill(0xAB)).unwrap();
    assert_eq!(mem.build_count(), 1);

    mem.purge();

    let content = mem.begin_read().unwrap();
    assert_eq!(content.len(), 8192);
    assert!(content.iter().all(|&b| b == 0xAB));
    drop(content);
    assert_eq!(mem.build_count(), 2);
}

/// Appended edits replay after the base builder and survive purges.
#[test]
fn test_appended_edit_survives_purge() {
    let mem = PurgeableMem::new(4096, fill(0xAB)).unwrap();
    mem.append_modify(|data: &mut [u8]| {
        data[10] = 0xCD;
        true
    })
    .unwrap();

    {
        let content = mem.begin_read().unwrap();
        assert_eq!(content[0], 0xAB);
        assert_eq!(content[10], 0xCD);
    }

    mem.purge();

    let content = mem.begin_read().unwrap();
    assert_eq!(content[0], 0xAB);
    assert_eq!(content[10], 0xCD);
}

/// Content always equals the chain replayed over a zeroed reference buffer,
/// whatever purges happen in between.
#[test]
fn test_content_matches_reference_replay() {
    const LEN: usize = 4096;
    let mem = PurgeableMem::new(LEN, fill(0x5A)).unwrap();
    let mut reference = vec![0u8; LEN];
    reference.fill(0x5A);

    for round in 0..4u8 {
        // Record an edit both in the object and in the reference replay.
        let offset = 100 * (round as usize + 1);
        mem.append_modify(move |data: &mut [u8]| {
            data[offset] = round;
            data[LEN - 1] = round;
            true
        })
        .unwrap();
        reference[offset] = round;
        reference[LEN - 1] = round;

        mem.purge();

        let content = mem.begin_read().unwrap();
        assert_eq!(&content[..], &reference[..], "round {round}");
    }
}

/// First replay failure surfaces as an error; the object stays usable and
/// the next access rebuilds.
#[test]
fn test_rebuild_failure_is_transient() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mem = PurgeableMem::new(4096, move |data: &mut [u8]| {
        // Invocation 0 is the initial build; invocation 1 (the first
        // replay) fails; everything after succeeds.
        if counter.fetch_add(1, Ordering::Relaxed) == 1 {
            return false;
        }
        data.fill(0xAB);
        true
    })
    .unwrap();

    mem.purge();
    assert!(mem.begin_read().is_err());

    let content = mem.begin_read().unwrap();
    assert!(content.iter().all(|&b| b == 0xAB));
    drop(content);
    assert_eq!(mem.build_count(), 2);
}

// ============================================================================
// Write access
// ============================================================================

/// A write guard hands out mutable content; direct edits are visible to
/// later readers but are not part of the rebuild chain.
#[test]
fn test_write_window() {
    let mem = PurgeableMem::new(4096, fill(0x00)).unwrap();

    {
        let mut content = mem.begin_write().unwrap();
        content[0] = 0x11;
        content[4095] = 0x22;
    }

    {
        let content = mem.begin_read().unwrap();
        assert_eq!(content[0], 0x11);
        assert_eq!(content[4095], 0x22);
    }

    // After a purge the replay wins over the direct edit.
    mem.purge();
    let content = mem.begin_read().unwrap();
    assert_eq!(content[0], 0x00);
}

/// begin_write on a purged object rebuilds before granting the window.
#[test]
fn test_write_window_rebuilds() {
    let mem = PurgeableMem::new(4096, fill(0x77)).unwrap();
    mem.purge();

    let content = mem.begin_write().unwrap();
    assert!(content.iter().all(|&b| b == 0x77));
    drop(content);
    assert_eq!(mem.build_count(), 2);
}

// ============================================================================
// Concurrency
// ============================================================================

/// Two readers loop for a second while a third thread purges periodically:
/// every observed snapshot is fully built and the build count only grows.
#[test]
fn test_readers_race_purger() {
    let mem = Arc::new(PurgeableMem::new(8192, fill(0xAB)).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let mem = Arc::clone(&mem);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut seen = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let content = mem.begin_read().unwrap();
                    assert!(content.iter().all(|&b| b == 0xAB));
                    drop(content);

                    let count = mem.build_count();
                    assert!(count >= seen, "build count went backwards");
                    seen = count;
                }
            })
        })
        .collect();

    let purger = {
        let mem = Arc::clone(&mem);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(1);
            while Instant::now() < deadline {
                mem.purge();
                std::thread::sleep(Duration::from_millis(5));
            }
            stop.store(true, Ordering::Relaxed);
        })
    };

    purger.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(mem.build_count() >= 2);
}

/// Concurrent appenders: all edits land, each exactly once per replay.
#[test]
fn test_concurrent_append_modify() {
    let mem = Arc::new(PurgeableMem::new(4096, fill(0x00)).unwrap());

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let mem = Arc::clone(&mem);
            std::thread::spawn(move || {
                mem.append_modify(move |data: &mut [u8]| {
                    data[i as usize] = i + 1;
                    true
                })
                .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    mem.purge();
    let content = mem.begin_read().unwrap();
    for i in 0..8usize {
        assert_eq!(content[i], i as u8 + 1);
    }
}

// ============================================================================
// Resource manager
// ============================================================================

/// Warming the manager's cache rebuilds purged objects ahead of access.
#[test]
fn test_manager_warms_cache() {
    let manager = ResourceManager::with_config(16, 4);
    let objects: Vec<_> = (0..8u8)
        .map(|i| Arc::new(PurgeableMem::new(4096, fill(i)).unwrap()))
        .collect();

    for obj in &objects {
        manager.add(Arc::clone(obj));
        obj.purge();
    }

    assert_eq!(manager.warm(), 8);

    for (i, obj) in objects.iter().enumerate() {
        assert_eq!(obj.build_count(), 2);
        let content = obj.begin_read().unwrap();
        assert!(content.iter().all(|&b| b == i as u8));
    }
}
