//! Shared fixtures for keystore integration tests
#![allow(dead_code)]

pub mod contract;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use sts_config::RotationPolicyConfig;
use sts_keymanagement::{
    Alias, DocumentRepository, FilesystemRepository, InMemoryDocumentStore, KeyEntry,
    KeyEntryAttributes, KeyError, KeyMaterial, KeyResult, KeyState, KeyStore,
    KeyStoreRepository, KeyStoreSealer, KeyUsage, RelationalRepository, RotationPolicy,
    SealedKeyStoreCodec, ServiceSettings,
};
use tempfile::TempDir;

pub const PASSWORD: &str = "correct horse battery staple";
pub const WRONG_PASSWORD: &str = "not the password";
pub const HOUR_MS: u64 = 3_600_000;
pub const DAY_MS: u64 = 86_400_000;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::milliseconds(250)
}

pub fn sealer(password: &str) -> KeyStoreSealer {
    KeyStoreSealer::new(Arc::new(SealedKeyStoreCodec::new()), password)
}

pub fn entry(
    alias: &str,
    usage: KeyUsage,
    state: KeyState,
    created_at: Option<DateTime<Utc>>,
) -> KeyEntry {
    let kind = usage.material_kind();
    let bytes: Vec<u8> = alias.bytes().cycle().take(48).collect();
    KeyEntry::new(
        KeyEntryAttributes {
            alias: alias.to_string(),
            created_at,
            not_before: created_at,
            not_after: created_at.map(|t| t + Duration::hours(1)),
            expire_at: created_at.map(|t| t + Duration::hours(25)),
            validity_interval: HOUR_MS as i64,
            legacy_interval: DAY_MS as i64,
            state,
            key_usage: usage,
        },
        KeyMaterial::new(kind, "TEST", bytes),
    )
}

/// Keystore with one entry per usage in differing states
pub fn sample_store(name: &str) -> KeyStore {
    KeyStore::from_parts(
        name,
        SealedKeyStoreCodec::STORE_TYPE,
        DateTime::<Utc>::UNIX_EPOCH,
        vec![
            entry("sts-sig-1", KeyUsage::Signature, KeyState::Active, Some(t0())),
            entry(
                "sts-enc-1",
                KeyUsage::Encryption,
                KeyState::Legacy,
                Some(t0() - Duration::hours(2)),
            ),
            entry("sts-sec-1", KeyUsage::SecretKey, KeyState::Expired, None),
        ],
    )
}

pub fn policy_config(min_keys: usize, initial_count: usize) -> RotationPolicyConfig {
    RotationPolicyConfig {
        enabled: true,
        validity_interval_ms: HOUR_MS,
        legacy_interval_ms: DAY_MS,
        min_keys,
        initial_count,
        algorithm: "RSA".to_string(),
        sig_algorithm: None,
        key_size: 512,
    }
}

pub fn settings(min_keys: usize, initial_count: usize) -> ServiceSettings {
    let config = policy_config(min_keys, initial_count);
    let secret = RotationPolicyConfig {
        algorithm: "AES".to_string(),
        key_size: 256,
        ..config.clone()
    };
    ServiceSettings {
        policies: vec![
            RotationPolicy::new(KeyUsage::Signature, &config),
            RotationPolicy::new(KeyUsage::Encryption, &config),
            RotationPolicy::new(KeyUsage::SecretKey, &secret),
        ],
        store_type: SealedKeyStoreCodec::STORE_TYPE.to_string(),
        alias_prefix: "sts-".to_string(),
        io_timeout: std::time::Duration::from_secs(5),
    }
}

/// Storage shared by repositories opened with different passwords
pub struct Fixture {
    pub dir: TempDir,
    pub documents: Arc<InMemoryDocumentStore>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            documents: Arc::new(InMemoryDocumentStore::new()),
        }
    }

    pub fn filesystem(&self, password: &str) -> Arc<dyn KeyStoreRepository> {
        Arc::new(FilesystemRepository::local(
            self.dir.path(),
            "keystores",
            sealer(password),
            true,
        ))
    }

    pub fn relational(&self, password: &str) -> Arc<dyn KeyStoreRepository> {
        Arc::new(
            RelationalRepository::open(self.dir.path().join("sts.sqlite"), sealer(password), true)
                .unwrap(),
        )
    }

    pub fn document(&self, password: &str) -> Arc<dyn KeyStoreRepository> {
        Arc::new(DocumentRepository::new(
            self.documents.clone(),
            "keystores",
            sealer(password),
            true,
        ))
    }
}

/// Repository wrapper that counts calls, can stall or fail writes and can delay one load
pub struct InstrumentedRepository {
    inner: Arc<dyn KeyStoreRepository>,
    pub loads: AtomicUsize,
    pub saves: AtomicUsize,
    pub creates: AtomicUsize,
    pub stall_writes: AtomicBool,
    pub fail_writes: AtomicBool,
    /// The next load reads immediately, then holds its result for `SLOW_LOAD`
    pub slow_next_load: AtomicBool,
}

pub const SLOW_LOAD: std::time::Duration = std::time::Duration::from_millis(300);

impl InstrumentedRepository {
    pub fn new(inner: Arc<dyn KeyStoreRepository>) -> Self {
        Self {
            inner,
            loads: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            stall_writes: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            slow_next_load: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(DocumentRepository::new(
            Arc::new(InMemoryDocumentStore::new()),
            "keystores",
            sealer(PASSWORD),
            true,
        )))
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    async fn before_write(&self) -> KeyResult<()> {
        if self.stall_writes.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KeyError::Write("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStoreRepository for InstrumentedRepository {
    fn backend_name(&self) -> &'static str {
        "instrumented"
    }

    async fn exists(&self, name: &str) -> KeyResult<bool> {
        self.inner.exists(name).await
    }

    async fn load(&self, name: &str) -> KeyResult<KeyStore> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let slow = self.slow_next_load.swap(false, Ordering::SeqCst);
        let loaded = self.inner.load(name).await;
        if slow {
            tokio::time::sleep(SLOW_LOAD).await;
        }
        loaded
    }

    async fn save(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>> {
        self.before_write().await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(store).await
    }

    async fn create(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>> {
        self.before_write().await?;
        let created = self.inner.create(store).await;
        if created.is_ok() {
            self.creates.fetch_add(1, Ordering::SeqCst);
        }
        created
    }

    async fn load_attributes(&self, name: &str) -> KeyResult<BTreeMap<Alias, KeyEntryAttributes>> {
        self.inner.load_attributes(name).await
    }

    async fn last_update(&self, name: &str) -> KeyResult<DateTime<Utc>> {
        self.inner.last_update(name).await
    }
}

pub fn states(store: &KeyStore, usage: KeyUsage) -> Vec<KeyState> {
    store.entries_for(usage).iter().map(|e| e.state()).collect()
}

pub fn count_state(store: &KeyStore, usage: KeyUsage, state: KeyState) -> usize {
    store
        .entries_for(usage)
        .iter()
        .filter(|e| e.state() == state)
        .count()
}
