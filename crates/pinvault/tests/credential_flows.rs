//! End to end credential flows against an on-disk hash tree
//!
//! Everything here goes through the public api only: a real store in a
//! temp dir, the software sealing backend and a manual clock.

use std::fs;
use std::path::{Path, PathBuf};

use pinvault::clock::ManualClock;
use pinvault::counter::{FileCounter, MemoryCounter, MonotonicCounter};
use pinvault::delay::{Delay, DelaySchedule};
use pinvault::error::{ErrorClass, HashTreeError, LeCredError};
use pinvault::manager::{CredentialState, LeCredentialManager};
use pinvault::sealing::SoftwareSealingBackend;
use pinvault::store::HashTreeStore;
use pinvault::tree::TreeGeometry;

const HE: [u8; 32] = [0x11; 32];
const RESET: [u8; 32] = [0x22; 32];

fn geometry() -> TreeGeometry {
    TreeGeometry::new(4, 2).unwrap()
}

fn manager_at(
    dir: &Path,
    counter: impl MonotonicCounter + 'static,
    root_key: &[u8; 32],
    clock: &ManualClock,
) -> LeCredentialManager<SoftwareSealingBackend> {
    let store = HashTreeStore::open(dir, geometry(), counter, root_key).unwrap();
    let backend = SoftwareSealingBackend::from_root_key(root_key);
    let auth = backend.auth_values();
    LeCredentialManager::new(store, backend, auth).with_clock(clock.clone())
}

fn leaf_file(dir: &Path, label: u64) -> PathBuf {
    dir.join("leaves").join(format!("{}.leaf", label))
}

#[test]
fn test_insert_then_check() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let mut mgr = manager_at(dir.path(), MemoryCounter::new(), &[7u8; 32], &clock);

    let schedule = DelaySchedule::new().with(5, Delay::Infinite);
    let label = mgr.insert_credential(b"1234", &HE, &RESET, &schedule, &[]).unwrap();

    let secrets = mgr.check_credential(label, b"1234").unwrap();
    assert_eq!(secrets.he_secret.as_slice(), &HE);
    assert_eq!(secrets.reset_secret.as_slice(), &RESET);
    assert_eq!(mgr.get_wrong_auth_attempts(label), 0);

    let err = mgr.check_credential(label, b"0000").unwrap_err();
    assert!(matches!(err, LeCredError::InvalidLeSecret));
    assert_eq!(err.class(), ErrorClass::Policy);
    assert_eq!(mgr.get_wrong_auth_attempts(label), 1);
}

#[test]
fn test_lockout_then_reset() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let mut mgr = manager_at(dir.path(), MemoryCounter::new(), &[7u8; 32], &clock);

    let schedule = DelaySchedule::new().with(3, Delay::Infinite);
    let label = mgr.insert_credential(b"1234", &HE, &RESET, &schedule, &[]).unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        assert!(matches!(mgr.check_credential(label, b"9999"), Err(LeCredError::InvalidLeSecret)));
        seen.push(mgr.get_wrong_auth_attempts(label));
    }
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(mgr.credential_state(label).unwrap(), CredentialState::Locked);

    // locked out even with the right pin, and time does not help
    clock.advance(365 * 24 * 3600);
    assert!(matches!(mgr.check_credential(label, b"1234"), Err(LeCredError::TooManyAttempts)));
    assert!(matches!(mgr.check_credential(label, b"9999"), Err(LeCredError::TooManyAttempts)));
    assert_eq!(mgr.get_wrong_auth_attempts(label), 3);

    assert!(matches!(mgr.reset_credential(label, b"not the reset"), Err(LeCredError::InvalidResetSecret)));
    assert_eq!(mgr.get_wrong_auth_attempts(label), 3);

    mgr.reset_credential(label, &RESET).unwrap();
    assert_eq!(mgr.get_wrong_auth_attempts(label), 0);
    assert_eq!(mgr.credential_state(label).unwrap(), CredentialState::Provisioned);
    assert_eq!(mgr.check_credential(label, b"1234").unwrap().he_secret.as_slice(), &HE);
}

#[test]
fn test_timed_delay_releases() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let mut mgr = manager_at(dir.path(), MemoryCounter::new(), &[7u8; 32], &clock);

    let schedule = DelaySchedule::new().with(2, Delay::Seconds(60)).with(10, Delay::Infinite);
    let label = mgr.insert_credential(b"2468", &HE, &RESET, &schedule, &[]).unwrap();

    for _ in 0..2 {
        assert!(mgr.check_credential(label, b"0000").is_err());
    }
    assert!(matches!(mgr.check_credential(label, b"2468"), Err(LeCredError::TooManyAttempts)));

    clock.advance(59);
    assert!(matches!(mgr.check_credential(label, b"2468"), Err(LeCredError::TooManyAttempts)));

    clock.advance(1);
    mgr.check_credential(label, b"2468").unwrap();
    assert_eq!(mgr.get_wrong_auth_attempts(label), 0);
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let counter_path = dir.path().join("counter");
    let clock = ManualClock::new(1_000);
    let schedule = DelaySchedule::new().with(5, Delay::Infinite);

    let label = {
        let counter = FileCounter::open(&counter_path).unwrap();
        let mut mgr = manager_at(&store_dir, counter, &[9u8; 32], &clock);
        let label = mgr.insert_credential(b"1357", &HE, &RESET, &schedule, &[]).unwrap();
        assert!(mgr.check_credential(label, b"0000").is_err());
        assert!(mgr.check_credential(label, b"0000").is_err());
        label
    };

    let counter = FileCounter::open(&counter_path).unwrap();
    let mut mgr = manager_at(&store_dir, counter, &[9u8; 32], &clock);
    assert_eq!(mgr.get_wrong_auth_attempts(label), 2);
    assert_eq!(mgr.check_credential(label, b"1357").unwrap().he_secret.as_slice(), &HE);
}

#[test]
fn test_restored_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let counter_path = dir.path().join("counter");
    let clock = ManualClock::new(1_000);
    let schedule = DelaySchedule::new().with(3, Delay::Infinite);

    let label = {
        let counter = FileCounter::open(&counter_path).unwrap();
        let mut mgr = manager_at(&store_dir, counter, &[9u8; 32], &clock);
        mgr.insert_credential(b"1357", &HE, &RESET, &schedule, &[]).unwrap()
    };

    // an attacker copies the store aside, burns attempts, then restores it
    let files = ["root".to_string(), "hashcache".to_string(), format!("leaves/{}.leaf", label)];
    let snapshot: Vec<(PathBuf, Vec<u8>)> = files
        .iter()
        .map(|f| (store_dir.join(f), fs::read(store_dir.join(f)).unwrap()))
        .collect();
    {
        let counter = FileCounter::open(&counter_path).unwrap();
        let mut mgr = manager_at(&store_dir, counter, &[9u8; 32], &clock);
        for _ in 0..3 {
            assert!(mgr.check_credential(label, b"0000").is_err());
        }
    }
    for (path, bytes) in snapshot {
        fs::write(path, bytes).unwrap();
    }

    let counter = FileCounter::open(&counter_path).unwrap();
    let err = HashTreeStore::open(&store_dir, geometry(), counter, &[9u8; 32]).unwrap_err();
    assert!(matches!(err, HashTreeError::Rollback { .. }));
}

#[test]
fn test_restored_snapshot_with_forged_counter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let counter_path = dir.path().join("counter");
    let clock = ManualClock::new(1_000);
    let schedule = DelaySchedule::new().with(3, Delay::Infinite);

    let label = {
        let counter = FileCounter::open(&counter_path).unwrap();
        let mut mgr = manager_at(&store_dir, counter, &[9u8; 32], &clock);
        mgr.insert_credential(b"1357", &HE, &RESET, &schedule, &[]).unwrap()
    };
    let files = ["root".to_string(), "hashcache".to_string(), format!("leaves/{}.leaf", label)];
    let snapshot: Vec<(PathBuf, Vec<u8>)> = files
        .iter()
        .map(|f| (store_dir.join(f), fs::read(store_dir.join(f)).unwrap()))
        .collect();
    {
        let counter = FileCounter::open(&counter_path).unwrap();
        let mut mgr = manager_at(&store_dir, counter, &[9u8; 32], &clock);
        for _ in 0..3 {
            assert!(mgr.check_credential(label, b"0000").is_err());
        }
        assert!(matches!(mgr.check_credential(label, b"1357"), Err(LeCredError::TooManyAttempts)));
    }
    for (path, bytes) in snapshot {
        fs::write(path, bytes).unwrap();
    }

    // write the live counter value into the restored root record and redo
    // the trailer with everything a filesystem attacker can compute
    let current = FileCounter::open(&counter_path).unwrap().read().unwrap();
    let root_path = store_dir.join("root");
    let mut record = fs::read(&root_path).unwrap();
    record.truncate(record.len() - 32);
    record[44..52].copy_from_slice(&current.to_le_bytes());
    let trailer = pinvault::crypto::sha256(&[&record]);
    record.extend_from_slice(&trailer);
    fs::write(&root_path, &record).unwrap();

    let counter = FileCounter::open(&counter_path).unwrap();
    let err = HashTreeStore::open(&store_dir, geometry(), counter, &[9u8; 32]).unwrap_err();
    assert!(matches!(err, HashTreeError::TreeCorrupted(_)));
}

#[test]
fn test_hashcache_damage_leaves_credentials_usable() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let schedule = DelaySchedule::new().with(5, Delay::Infinite);
    let counter = MemoryCounter::new();

    let (a, b) = {
        let mut mgr = manager_at(dir.path(), counter.clone(), &[7u8; 32], &clock);
        let a = mgr.insert_credential(b"1111", &HE, &RESET, &schedule, &[]).unwrap();
        let b = mgr.insert_credential(b"2222", &HE, &RESET, &schedule, &[]).unwrap();
        (a, b)
    };

    let cache_path = dir.path().join("hashcache");
    let mut cache = fs::read(&cache_path).unwrap();
    cache[32 * a as usize] ^= 0x01;
    fs::write(&cache_path, &cache).unwrap();

    let mut mgr = manager_at(dir.path(), counter, &[7u8; 32], &clock);
    assert_eq!(mgr.check_credential(a, b"1111").unwrap().he_secret.as_slice(), &HE);
    assert_eq!(mgr.check_credential(b, b"2222").unwrap().he_secret.as_slice(), &HE);
}

#[test]
fn test_tampered_leaf_only_breaks_its_label() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let mut mgr = manager_at(dir.path(), MemoryCounter::new(), &[7u8; 32], &clock);
    let schedule = DelaySchedule::new().with(5, Delay::Infinite);

    let a = mgr.insert_credential(b"1111", &HE, &RESET, &schedule, &[]).unwrap();
    let b = mgr.insert_credential(b"2222", &HE, &RESET, &schedule, &[]).unwrap();
    assert_ne!(a, b);

    let path = leaf_file(dir.path(), a);
    let original = fs::read(&path).unwrap();
    for offset in (0..original.len()).step_by(37) {
        let mut bytes = original.clone();
        bytes[offset] ^= 0x80;
        fs::write(&path, &bytes).unwrap();

        assert_eq!(mgr.credential_state(a).unwrap(), CredentialState::Corrupted);
        assert_eq!(mgr.get_wrong_auth_attempts(a), -1);
        assert!(mgr.check_credential(a, b"1111").is_err());
        assert_eq!(mgr.check_credential(b, b"2222").unwrap().he_secret.as_slice(), &HE);
    }

    fs::write(&path, &original).unwrap();
    assert_eq!(mgr.check_credential(a, b"1111").unwrap().he_secret.as_slice(), &HE);
}

#[test]
fn test_remove_and_reuse_label() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let mut mgr = manager_at(dir.path(), MemoryCounter::new(), &[7u8; 32], &clock);
    let schedule = DelaySchedule::new().with(5, Delay::Infinite);

    let first = mgr.insert_credential(b"1111", &HE, &RESET, &schedule, &[]).unwrap();
    let second = mgr.insert_credential(b"2222", &HE, &RESET, &schedule, &[]).unwrap();
    mgr.remove_credential(first).unwrap();

    assert_eq!(mgr.credential_state(first).unwrap(), CredentialState::Free);
    assert!(matches!(mgr.check_credential(first, b"1111"), Err(LeCredError::InvalidLabel)));
    assert!(matches!(mgr.remove_credential(first), Err(LeCredError::InvalidLabel)));

    let reused = mgr.insert_credential(b"3333", &[0x33; 16], &RESET, &schedule, &[]).unwrap();
    assert_eq!(reused, first);
    assert!(matches!(mgr.check_credential(reused, b"1111"), Err(LeCredError::InvalidLeSecret)));
    assert_eq!(mgr.check_credential(reused, b"3333").unwrap().he_secret.as_slice(), &[0x33; 16]);
    assert_eq!(mgr.check_credential(second, b"2222").unwrap().he_secret.as_slice(), &HE);
}

#[test]
fn test_tree_fills_up() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let mut mgr = manager_at(dir.path(), MemoryCounter::new(), &[7u8; 32], &clock);
    let schedule = DelaySchedule::new().with(5, Delay::Infinite);

    let capacity = 1u64 << 4;
    for expected in 0..capacity {
        assert_eq!(mgr.insert_credential(b"0", b"he", b"rs", &schedule, &[]).unwrap(), expected);
    }
    let err = mgr.insert_credential(b"0", b"he", b"rs", &schedule, &[]).unwrap_err();
    assert!(matches!(err, LeCredError::NoFreeLabel));
    assert!(matches!(mgr.check_credential(capacity, b"0"), Err(LeCredError::InvalidLabel)));
}
