//! Keystore orchestration: load, rotate, persist and key selection
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::clock::{Clock, SystemClock};
use crate::crypto::KeyGenerator;
use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyEntry, KeyStore, KeyUsage};
use crate::repository::KeyStoreRepository;
use crate::rotation::{self, MaterialPool, RotationPolicy};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use sts_config::KeyManagementConfig;
use tracing::{debug, info, warn};

/// Settings the service needs beyond its collaborators
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub policies: Vec<RotationPolicy>,
    pub store_type: String,
    pub alias_prefix: String,
    pub io_timeout: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &KeyManagementConfig) -> Self {
        Self {
            policies: RotationPolicy::from_keys_config(&config.keys),
            store_type: config.keystore.store_type.clone(),
            alias_prefix: config.keystore.alias_prefix.clone(),
            io_timeout: config.persistence.io_timeout(),
        }
    }
}

/// Cached snapshot of one keystore.
///
/// `generation` is bumped by every save and every invalidation. A load only
/// lands in the slot when the generation it started under is still current,
/// so a read that raced a save never replaces the saved snapshot.
#[derive(Default)]
struct CacheSlot {
    generation: u64,
    store: Option<Arc<KeyStore>>,
}

/// Coordinates load -> rotate -> persist per keystore name.
///
/// Mutations of one keystore are serialized through a per-name async lock
/// taken from `locks`. `cache` holds the last snapshot loaded or saved per
/// name; it is replaced after every successful save and dropped after a
/// failed one. Different names never contend.
///
/// Both maps hold one slot per keystore name ever touched and are never
/// pruned, so their size is bounded by the number of keystore names.
pub struct KeyStoreService {
    repository: Arc<dyn KeyStoreRepository>,
    generator: Arc<dyn KeyGenerator>,
    clock: Arc<dyn Clock>,
    settings: ServiceSettings,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cache: RwLock<HashMap<String, CacheSlot>>,
}

impl KeyStoreService {
    pub fn new(
        repository: Arc<dyn KeyStoreRepository>,
        generator: Arc<dyn KeyGenerator>,
        settings: ServiceSettings,
    ) -> Self {
        Self::with_clock(repository, generator, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<dyn KeyStoreRepository>,
        generator: Arc<dyn KeyGenerator>,
        settings: ServiceSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            generator,
            clock,
            settings,
            locks: Mutex::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn KeyStoreRepository> {
        &self.repository
    }

    /// Load the keystore, creating and populating it when it does not exist yet
    pub async fn get_or_initialize(&self, name: &str) -> KeyResult<Arc<KeyStore>> {
        let seen = self.generation(name);
        match self.load(name).await {
            Ok(store) => Ok(self.remember_loaded(store, seen)),
            Err(e) if e.is_not_found() => self.initialize(name).await,
            Err(e) => Err(e),
        }
    }

    async fn initialize(&self, name: &str) -> KeyResult<Arc<KeyStore>> {
        let now = self.clock.now();
        let empty = KeyStore::new(name, self.settings.store_type.clone());
        let plan = rotation::plan(&empty, now, &self.settings.policies);
        let mut pool = self.pregenerate(name, plan.requests()).await?;

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        // Someone may have initialized it while we were generating
        let seen = self.generation(name);
        match self.load(name).await {
            Ok(existing) => {
                warn!(keystore = %name, "Keystore appeared during initialization, using it");
                return Ok(self.remember_loaded(existing, seen));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let rotation = plan
            .complete(
                &self.settings.policies,
                &mut pool,
                self.generator.as_ref(),
                &self.settings.alias_prefix,
            )
            .await
            .map_err(|e| e.for_keystore(name))?;

        let created = self
            .bounded(name, "create", self.repository.create(&rotation.store))
            .await;
        match created {
            Ok(persisted_at) => {
                info!(
                    keystore = %name,
                    backend = self.repository.backend_name(),
                    entries = rotation.store.len(),
                    "Initialized keystore"
                );
                Ok(self.remember_saved(rotation.store.with_last_update(persisted_at)))
            }
            Err(e) if e.is_already_exists() => {
                warn!(keystore = %name, "Lost keystore initialization race, reloading");
                let seen = self.generation(name);
                let existing = self.load(name).await?;
                Ok(self.remember_loaded(existing, seen))
            }
            Err(e) => {
                self.invalidate(name);
                Err(e)
            }
        }
    }

    /// Apply every rotation policy to the stored keystore and persist it if anything changed.
    ///
    /// Key material is generated before the per-keystore lock is taken; under
    /// the lock the keystore is reloaded and re-planned so material already
    /// made redundant by a concurrent refresh is discarded instead of minted.
    pub async fn refresh(&self, name: &str) -> KeyResult<Arc<KeyStore>> {
        let now = self.clock.now();
        let seen = self.generation(name);
        let snapshot = self.load(name).await?;
        let early = rotation::plan(&snapshot, now, &self.settings.policies);
        if early.is_noop() {
            debug!(keystore = %name, "Keystore already up to date");
            return Ok(self.remember_loaded(snapshot, seen));
        }
        let mut pool = self.pregenerate(name, early.requests()).await?;

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let seen = self.generation(name);
        let current = self.load(name).await?;
        let plan = rotation::plan(&current, now, &self.settings.policies);
        if plan.is_noop() {
            if pool.remaining() > 0 {
                warn!(
                    keystore = %name,
                    discarded = pool.remaining(),
                    "Concurrent refresh already rotated keystore, discarding generated keys"
                );
            }
            return Ok(self.remember_loaded(current, seen));
        }

        let rotation = plan
            .complete(
                &self.settings.policies,
                &mut pool,
                self.generator.as_ref(),
                &self.settings.alias_prefix,
            )
            .await
            .map_err(|e| e.for_keystore(name))?;

        match self
            .bounded(name, "save", self.repository.save(&rotation.store))
            .await
        {
            Ok(persisted_at) => {
                info!(
                    keystore = %name,
                    transitioned = rotation.transitioned.len(),
                    minted = rotation.minted.len(),
                    "Rotated keystore"
                );
                Ok(self.remember_saved(rotation.store.with_last_update(persisted_at)))
            }
            Err(e) => {
                self.invalidate(name);
                Err(e)
            }
        }
    }

    /// Newest `Active` signing key
    pub async fn select_signing_key(&self, name: &str) -> KeyResult<KeyEntry> {
        self.select_active_key(name, KeyUsage::Signature).await
    }

    /// Newest `Active` key of any usage. Never falls back to legacy keys.
    pub async fn select_active_key(&self, name: &str, usage: KeyUsage) -> KeyResult<KeyEntry> {
        let store = self.snapshot(name).await?;
        store
            .newest_active(usage)
            .cloned()
            .ok_or_else(|| KeyError::NoActiveKey {
                keystore: name.to_string(),
                usage,
            })
    }

    /// `Active` and `Legacy` keys of a usage, newest first
    pub async fn select_verification_keys(
        &self,
        name: &str,
        usage: KeyUsage,
    ) -> KeyResult<Vec<KeyEntry>> {
        let store = self.snapshot(name).await?;
        Ok(store
            .verification_keys(usage)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Cached keystore, loaded on a miss
    pub async fn snapshot(&self, name: &str) -> KeyResult<Arc<KeyStore>> {
        if let Some(store) = self.cached(name) {
            debug!(keystore = %name, "Keystore cache hit");
            return Ok(store);
        }
        let seen = self.generation(name);
        let store = self.load(name).await?;
        Ok(self.remember_loaded(store, seen))
    }

    /// Drop the cached snapshot for a keystore
    pub fn invalidate(&self, name: &str) {
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = cache.get_mut(name) {
            slot.generation += 1;
            slot.store = None;
        }
    }

    fn cached(&self, name: &str) -> Option<Arc<KeyStore>> {
        self.cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .and_then(|slot| slot.store.clone())
    }

    fn generation(&self, name: &str) -> u64 {
        self.cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map_or(0, |slot| slot.generation)
    }

    /// Cache a freshly loaded store unless a save or invalidation happened since `seen`
    fn remember_loaded(&self, store: KeyStore, seen: u64) -> Arc<KeyStore> {
        let store = Arc::new(store);
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        let slot = cache.entry(store.name().to_string()).or_default();
        if slot.generation == seen {
            slot.store = Some(Arc::clone(&store));
            return store;
        }
        debug!(keystore = %store.name(), "Discarding snapshot loaded before a newer save");
        match &slot.store {
            Some(newer) => Arc::clone(newer),
            None => store,
        }
    }

    /// Cache the store just persisted under the keystore lock
    fn remember_saved(&self, store: KeyStore) -> Arc<KeyStore> {
        let store = Arc::new(store);
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        let slot = cache.entry(store.name().to_string()).or_default();
        slot.generation += 1;
        slot.store = Some(Arc::clone(&store));
        store
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    async fn load(&self, name: &str) -> KeyResult<KeyStore> {
        self.bounded(name, "load", self.repository.load(name)).await
    }

    async fn pregenerate(
        &self,
        name: &str,
        requests: &[rotation::MintRequest],
    ) -> KeyResult<MaterialPool> {
        MaterialPool::generate(&self.settings.policies, requests, self.generator.as_ref())
            .await
            .map_err(|e| e.for_keystore(name))
    }

    /// Run a backend call under the configured timeout and tag failures with the keystore name
    async fn bounded<T>(
        &self,
        name: &str,
        operation: &str,
        call: impl Future<Output = KeyResult<T>>,
    ) -> KeyResult<T> {
        match tokio::time::timeout(self.settings.io_timeout, call).await {
            Ok(result) => result.map_err(|e| e.for_keystore(name)),
            Err(_) => {
                warn!(keystore = %name, operation, timeout = ?self.settings.io_timeout, "Backend call timed out");
                Err(KeyError::Write(format!(
                    "{} timed out after {:?}",
                    operation, self.settings.io_timeout
                ))
                .for_keystore(name))
            }
        }
    }
}
