//! Keystore service lifecycle: initialization, rotation, selection and concurrency

mod common;

use chrono::{DateTime, Duration, Utc};
use common::{count_state, entry, settings, states, t0, InstrumentedRepository, HOUR_MS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sts_keymanagement::{
    Clock, KeyError, KeyState, KeyStore, KeyStoreRepository, KeyStoreService, KeyUsage, ManualClock,
    RandomKeyGenerator, SealedKeyStoreCodec, ServiceSettings,
};

struct Harness {
    repo: Arc<InstrumentedRepository>,
    clock: Arc<ManualClock>,
    service: Arc<KeyStoreService>,
}

impl Harness {
    fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn harness(settings: ServiceSettings) -> Harness {
    let repo = Arc::new(InstrumentedRepository::in_memory());
    let clock = Arc::new(ManualClock::new(t0()));
    let service = Arc::new(KeyStoreService::with_clock(
        repo.clone(),
        Arc::new(RandomKeyGenerator::new()),
        settings,
        clock.clone(),
    ));
    Harness {
        repo,
        clock,
        service,
    }
}

fn past_validity() -> Duration {
    Duration::milliseconds(HOUR_MS as i64 + 1)
}

#[tokio::test]
async fn test_initialize_mints_one_active_key_per_usage() {
    let h = harness(settings(1, 1));
    let store = h.service.get_or_initialize("sts").await.unwrap();

    for usage in KeyUsage::ALL {
        assert_eq!(states(&store, usage), vec![KeyState::Active], "{usage}");
    }
    assert_eq!(store.store_type(), SealedKeyStoreCodec::STORE_TYPE);
    assert_eq!(h.repo.creates(), 1);
    assert_eq!(h.repo.saves(), 0);

    let secret = store.newest_active(KeyUsage::SecretKey).unwrap();
    assert_eq!(secret.material().len(), 32);
    assert!(secret.alias().starts_with("sts-"));

    // Persisted: a second call only loads
    let again = h.service.get_or_initialize("sts").await.unwrap();
    assert!(again.same_entries(&store));
    assert_eq!(h.repo.creates(), 1);
}

#[tokio::test]
async fn test_initial_count_applies_to_empty_groups() {
    let h = harness(settings(1, 3));
    let store = h.service.get_or_initialize("sts").await.unwrap();
    for usage in KeyUsage::ALL {
        assert_eq!(count_state(&store, usage, KeyState::Active), 3);
    }

    h.clock.advance(past_validity());
    let store = h.service.refresh("sts").await.unwrap();
    for usage in KeyUsage::ALL {
        assert_eq!(count_state(&store, usage, KeyState::Legacy), 3);
        assert_eq!(count_state(&store, usage, KeyState::Active), 1);
    }
}

#[tokio::test]
async fn test_refresh_after_validity_demotes_and_mints() {
    let h = harness(settings(1, 1));
    let initial = h.service.get_or_initialize("sts").await.unwrap();
    let first_signer = initial.newest_active(KeyUsage::Signature).unwrap().clone();

    h.clock.advance(past_validity());
    let store = h.service.refresh("sts").await.unwrap();

    for usage in KeyUsage::ALL {
        assert_eq!(
            states(&store, usage),
            vec![KeyState::Active, KeyState::Legacy],
            "{usage}"
        );
    }
    let demoted = store.entry(first_signer.alias()).unwrap();
    assert_eq!(demoted.state(), KeyState::Legacy);
    assert_eq!(demoted.attributes().not_after, Some(h.clock_now()));
    assert_eq!(demoted.material().expose(), first_signer.material().expose());
    assert_eq!(h.repo.saves(), 1);

    let persisted = h.repo.load("sts").await.unwrap();
    assert!(persisted.same_entries(&store));
    assert_eq!(persisted.last_update(), store.last_update());
}

#[tokio::test]
async fn test_refresh_at_exact_validity_boundary_is_noop() {
    let h = harness(settings(1, 1));
    h.service.get_or_initialize("sts").await.unwrap();

    h.clock.advance(Duration::milliseconds(HOUR_MS as i64));
    let store = h.service.refresh("sts").await.unwrap();
    for usage in KeyUsage::ALL {
        assert_eq!(states(&store, usage), vec![KeyState::Active]);
    }
    assert_eq!(h.repo.saves(), 0);
}

#[tokio::test]
async fn test_noop_refresh_does_not_write() {
    let h = harness(settings(1, 1));
    let initial = h.service.get_or_initialize("sts").await.unwrap();
    let refreshed = h.service.refresh("sts").await.unwrap();
    assert!(refreshed.same_entries(&initial));
    assert_eq!(h.repo.saves(), 0);
    assert_eq!(h.repo.creates(), 1);
}

#[tokio::test]
async fn test_refresh_of_missing_keystore_is_not_found() {
    let h = harness(settings(1, 1));
    let err = h.service.refresh("absent").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(err, KeyError::Keystore { ref name, .. } if name == "absent"));
}

#[tokio::test]
async fn test_legacy_keys_expire_after_legacy_interval() {
    let h = harness(settings(1, 1));
    let a = h.service.get_or_initialize("sts").await.unwrap();
    let a = a.newest_active(KeyUsage::Signature).unwrap().alias().to_string();

    h.clock.advance(past_validity());
    let store = h.service.refresh("sts").await.unwrap();
    let b = store.newest_active(KeyUsage::Signature).unwrap().alias().to_string();

    h.clock.advance(Duration::days(1));
    let store = h.service.refresh("sts").await.unwrap();
    let c = store.newest_active(KeyUsage::Signature).unwrap().alias().to_string();

    assert_eq!(store.entry(&a).unwrap().state(), KeyState::Expired);
    assert_eq!(store.entry(&a).unwrap().attributes().expire_at, Some(h.clock_now()));
    assert_eq!(store.entry(&b).unwrap().state(), KeyState::Legacy);

    let verification: Vec<String> = h
        .service
        .select_verification_keys("sts", KeyUsage::Signature)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.alias().to_string())
        .collect();
    assert_eq!(verification, vec![c.clone(), b]);

    let signer = h.service.select_signing_key("sts").await.unwrap();
    assert_eq!(signer.alias(), c);
}

#[tokio::test]
async fn test_no_active_key_is_reported() {
    let h = harness(settings(1, 1));
    let store = KeyStore::from_parts(
        "retired",
        SealedKeyStoreCodec::STORE_TYPE,
        DateTime::<Utc>::UNIX_EPOCH,
        vec![entry(
            "sts-old",
            KeyUsage::Signature,
            KeyState::Legacy,
            Some(t0()),
        )],
    );
    h.repo.save(&store).await.unwrap();

    let err = h.service.select_signing_key("retired").await.unwrap_err();
    match err {
        KeyError::NoActiveKey { keystore, usage } => {
            assert_eq!(keystore, "retired");
            assert_eq!(usage, KeyUsage::Signature);
        }
        other => panic!("expected NoActiveKey, got {other:?}"),
    }

    // Legacy keys still verify
    let keys = h
        .service
        .select_verification_keys("retired", KeyUsage::Signature)
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
}

#[tokio::test]
async fn test_selection_uses_cached_snapshot() {
    let h = harness(settings(1, 1));
    h.service.get_or_initialize("sts").await.unwrap();
    let loads = h.repo.loads();

    h.service.select_signing_key("sts").await.unwrap();
    h.service
        .select_active_key("sts", KeyUsage::Encryption)
        .await
        .unwrap();
    assert_eq!(h.repo.loads(), loads);

    h.service.invalidate("sts");
    h.service.select_signing_key("sts").await.unwrap();
    assert_eq!(h.repo.loads(), loads + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_writes_once() {
    let h = harness(settings(1, 1));
    h.service.get_or_initialize("sts").await.unwrap();
    h.clock.advance(past_validity());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = h.service.clone();
            tokio::spawn(async move { service.refresh("sts").await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.repo.saves(), 1);
    let store = h.repo.load("sts").await.unwrap();
    for usage in KeyUsage::ALL {
        assert_eq!(count_state(&store, usage, KeyState::Active), 1);
        assert_eq!(count_state(&store, usage, KeyState::Legacy), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_initialization_creates_once() {
    let h = harness(settings(1, 1));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = h.service.clone();
            tokio::spawn(async move { service.get_or_initialize("sts").await })
        })
        .collect();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    assert_eq!(h.repo.creates(), 1);
    for store in &results {
        assert!(store.same_entries(&results[0]));
        assert_eq!(store.len(), 3);
    }
}

#[tokio::test]
async fn test_independent_keystores_rotate_separately() {
    let h = harness(settings(1, 1));
    h.service.get_or_initialize("tenant-a").await.unwrap();
    h.clock.advance(past_validity());
    h.service.get_or_initialize("tenant-b").await.unwrap();

    let a = h.service.refresh("tenant-a").await.unwrap();
    let b = h.service.refresh("tenant-b").await.unwrap();
    assert_eq!(a.len(), 6);
    assert_eq!(b.len(), 3);
    assert_eq!(h.repo.saves(), 1);
}

#[tokio::test]
async fn test_stalled_backend_times_out_and_releases_lock() {
    let mut settings = settings(1, 1);
    settings.io_timeout = std::time::Duration::from_millis(50);
    let h = harness(settings);
    h.service.get_or_initialize("sts").await.unwrap();

    h.clock.advance(past_validity());
    h.repo.stall_writes.store(true, Ordering::SeqCst);
    let err = h.service.refresh("sts").await.unwrap_err();
    assert!(matches!(err.root(), KeyError::Write(_)), "got {err:?}");
    assert!(err.to_string().contains("sts"));

    h.repo.stall_writes.store(false, Ordering::SeqCst);
    let store = tokio::time::timeout(std::time::Duration::from_secs(5), h.service.refresh("sts"))
        .await
        .expect("refresh blocked on a held lock")
        .unwrap();
    assert_eq!(count_state(&store, KeyUsage::Signature, KeyState::Active), 1);
    assert_eq!(h.repo.saves(), 1);
}

#[tokio::test]
async fn test_failed_save_drops_cached_snapshot() {
    let h = harness(settings(1, 1));
    h.service.get_or_initialize("sts").await.unwrap();

    h.clock.advance(past_validity());
    h.repo.fail_writes.store(true, Ordering::SeqCst);
    let err = h.service.refresh("sts").await.unwrap_err();
    assert!(matches!(err.root(), KeyError::Write(_)));

    let loads = h.repo.loads();
    let store = h.service.snapshot("sts").await.unwrap();
    assert_eq!(h.repo.loads(), loads + 1);
    // Nothing was persisted
    for usage in KeyUsage::ALL {
        assert_eq!(states(&store, usage), vec![KeyState::Active]);
    }
}

#[tokio::test]
async fn test_failed_create_leaves_keystore_absent() {
    let h = harness(settings(1, 1));
    h.repo.fail_writes.store(true, Ordering::SeqCst);
    assert!(h.service.get_or_initialize("sts").await.is_err());
    assert!(!h.repo.exists("sts").await.unwrap());

    h.repo.fail_writes.store(false, Ordering::SeqCst);
    let store = h.service.get_or_initialize("sts").await.unwrap();
    assert_eq!(store.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_snapshot_read_does_not_overwrite_a_newer_save() {
    let h = harness(settings(1, 1));
    let initial = h.service.get_or_initialize("sts").await.unwrap();
    let retired = initial
        .newest_active(KeyUsage::Signature)
        .unwrap()
        .alias()
        .to_string();
    h.service.invalidate("sts");

    // The reader fetches the pre-rotation store and finishes after the refresh saved
    h.repo.slow_next_load.store(true, Ordering::SeqCst);
    let reader = {
        let service = h.service.clone();
        tokio::spawn(async move { service.snapshot("sts").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    h.clock.advance(past_validity());
    h.service.refresh("sts").await.unwrap();
    let raced = reader.await.unwrap().unwrap();
    assert_eq!(
        raced.entry(&retired).map(|e| e.state()),
        Some(KeyState::Legacy)
    );

    let selected = h.service.select_signing_key("sts").await.unwrap();
    assert_ne!(selected.alias(), retired);
    let persisted = h.repo.load("sts").await.unwrap();
    assert_eq!(
        persisted.entry(selected.alias()).map(|e| e.state()),
        Some(KeyState::Active)
    );
}
