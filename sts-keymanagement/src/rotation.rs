//! Rotation policy: time-driven state transitions and key minting
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


use crate::crypto::KeyGenerator;
use crate::error::{KeyError, KeyResult};
use crate::key_types::{Alias, KeyEntry, KeyEntryAttributes, KeyMaterial, KeyState, KeyStore, KeyUsage};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use sts_config::{KeysConfig, RotationPolicyConfig};
use tracing::{debug, info};

/// Rotation rules for one key usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    usage: KeyUsage,
    enabled: bool,
    validity_ms: i64,
    legacy_ms: i64,
    min_keys: usize,
    initial_count: usize,
    algorithm: String,
    key_size: u32,
}

fn millis(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn offset(from: DateTime<Utc>, ms: i64) -> Option<DateTime<Utc>> {
    Duration::try_milliseconds(ms).and_then(|d| from.checked_add_signed(d))
}

impl RotationPolicy {
    pub fn new(usage: KeyUsage, config: &RotationPolicyConfig) -> Self {
        Self {
            usage,
            enabled: config.enabled,
            validity_ms: millis(config.validity_interval_ms),
            legacy_ms: millis(config.legacy_interval_ms),
            min_keys: config.min_keys,
            initial_count: config.initial_count,
            algorithm: config.algorithm.clone(),
            key_size: config.key_size,
        }
    }

    /// One policy per configured key kind
    pub fn from_keys_config(keys: &KeysConfig) -> Vec<Self> {
        vec![
            Self::new(KeyUsage::Encryption, &keys.enc_key_pairs),
            Self::new(KeyUsage::Signature, &keys.sign_key_pairs),
            Self::new(KeyUsage::SecretKey, &keys.secret_keys),
        ]
    }

    pub fn usage(&self) -> KeyUsage {
        self.usage
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn min_keys(&self) -> usize {
        self.min_keys
    }

    pub fn initial_count(&self) -> usize {
        self.initial_count
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    /// Apply the two-threshold rule to one entry.
    ///
    /// An `Active` entry older than its validity interval becomes `Legacy`
    /// with `not_after = now`; a `Legacy` entry older than validity plus
    /// legacy interval becomes `Expired` with `expire_at = now`. Both steps
    /// run in that order, so one pass can carry an entry straight to
    /// `Expired`. Entries without `created_at` never age.
    pub fn transition(&self, entry: KeyEntry, now: DateTime<Utc>) -> KeyEntry {
        if !self.enabled || entry.key_usage() != self.usage {
            return entry;
        }
        let Some(created_at) = entry.created_at() else {
            return entry;
        };

        let age = i128::from(now.signed_duration_since(created_at).num_milliseconds());
        let validity = i128::from(entry.attributes().validity_interval);
        let legacy = i128::from(entry.attributes().legacy_interval);

        let mut entry = entry;
        if entry.state() == KeyState::Active && age > validity {
            entry = entry.into_legacy(now);
        }
        if entry.state() == KeyState::Legacy && age > validity + legacy {
            entry = entry.into_expired(now);
        }
        entry
    }

    /// How many keys to mint given the (already transitioned) entries of this usage
    pub fn keys_to_mint(&self, entries: &[&KeyEntry]) -> usize {
        if entries.is_empty() {
            return self.initial_count.max(self.min_keys);
        }
        if !self.enabled {
            return 0;
        }
        let active = entries
            .iter()
            .filter(|entry| entry.state() == KeyState::Active)
            .count();
        self.min_keys.saturating_sub(active)
    }

    /// Fresh `Active` entry created at `now`
    pub fn mint(&self, alias: Alias, material: KeyMaterial, now: DateTime<Utc>) -> KeyEntry {
        let not_after = offset(now, self.validity_ms);
        KeyEntry::new(
            KeyEntryAttributes {
                alias,
                created_at: Some(now),
                not_before: Some(now),
                not_after,
                expire_at: not_after.and_then(|t| offset(t, self.legacy_ms)),
                validity_interval: self.validity_ms,
                legacy_interval: self.legacy_ms,
                state: KeyState::Active,
                key_usage: self.usage,
            },
            material,
        )
    }
}

/// Alias for a newly minted key
pub fn new_alias(prefix: &str) -> Alias {
    format!("{}{}", prefix, uuid::Uuid::new_v4())
}

/// Number of keys a usage needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintRequest {
    pub usage: KeyUsage,
    pub count: usize,
}

/// Key material generated ahead of a rotation, grouped by usage
#[derive(Debug, Default)]
pub struct MaterialPool {
    by_usage: HashMap<KeyUsage, Vec<KeyMaterial>>,
}

impl MaterialPool {
    /// Generate material for every request
    pub async fn generate(
        policies: &[RotationPolicy],
        requests: &[MintRequest],
        generator: &dyn KeyGenerator,
    ) -> KeyResult<Self> {
        let mut pool = Self::default();
        for request in requests {
            let Some(policy) = find_policy(policies, request.usage) else {
                continue;
            };
            for _ in 0..request.count {
                let material = generate_one(policy, generator).await?;
                pool.by_usage.entry(request.usage).or_default().push(material);
            }
        }
        Ok(pool)
    }

    pub fn take(&mut self, usage: KeyUsage) -> Option<KeyMaterial> {
        self.by_usage.get_mut(&usage).and_then(Vec::pop)
    }

    pub fn remaining(&self) -> usize {
        self.by_usage.values().map(Vec::len).sum()
    }
}

fn find_policy(policies: &[RotationPolicy], usage: KeyUsage) -> Option<&RotationPolicy> {
    policies.iter().find(|policy| policy.usage() == usage)
}

async fn generate_one(policy: &RotationPolicy, generator: &dyn KeyGenerator) -> KeyResult<KeyMaterial> {
    generator
        .generate(policy.usage().material_kind(), policy.algorithm(), policy.key_size())
        .await
        .map_err(|e| match e {
            KeyError::KeyGeneration(_) => e,
            other => KeyError::KeyGeneration(other.to_string()),
        })
}

/// Transitions computed for a keystore plus the keys still to be minted
#[derive(Debug, Clone)]
pub struct RotationPlan {
    now: DateTime<Utc>,
    store: KeyStore,
    transitioned: Vec<Alias>,
    requests: Vec<MintRequest>,
}

impl RotationPlan {
    /// Keystore with all transitions applied and nothing minted yet
    pub fn transitioned_store(&self) -> &KeyStore {
        &self.store
    }

    pub fn transitioned(&self) -> &[Alias] {
        &self.transitioned
    }

    pub fn requests(&self) -> &[MintRequest] {
        &self.requests
    }

    pub fn is_noop(&self) -> bool {
        self.transitioned.is_empty() && self.requests.is_empty()
    }

    /// Finish the plan with explicitly supplied new entries
    pub fn apply(self, minted: Vec<KeyEntry>) -> Rotation {
        let minted_aliases: Vec<Alias> = minted.iter().map(|e| e.alias().to_string()).collect();
        let changed = !self.transitioned.is_empty() || !minted_aliases.is_empty();
        let store = self
            .store
            .with_entries(self.store.entries().cloned().chain(minted));
        Rotation {
            store,
            transitioned: self.transitioned,
            minted: minted_aliases,
            changed,
        }
    }

    /// Finish the plan, drawing material from `pool` first and generating the shortfall
    pub async fn complete(
        self,
        policies: &[RotationPolicy],
        pool: &mut MaterialPool,
        generator: &dyn KeyGenerator,
        alias_prefix: &str,
    ) -> KeyResult<Rotation> {
        let mut minted = Vec::new();
        for request in &self.requests {
            let Some(policy) = find_policy(policies, request.usage) else {
                continue;
            };
            for _ in 0..request.count {
                let material = match pool.take(request.usage) {
                    Some(material) => material,
                    None => generate_one(policy, generator).await?,
                };
                let entry = policy.mint(new_alias(alias_prefix), material, self.now);
                info!(
                    keystore = %self.store.name(),
                    alias = %entry.alias(),
                    usage = %request.usage,
                    "Minted key"
                );
                minted.push(entry);
            }
        }
        Ok(self.apply(minted))
    }
}

/// Outcome of one rotation pass
#[derive(Debug, Clone)]
pub struct Rotation {
    pub store: KeyStore,
    /// Aliases whose state changed
    pub transitioned: Vec<Alias>,
    /// Aliases of newly minted entries
    pub minted: Vec<Alias>,
    /// A persistence write is needed
    pub changed: bool,
}

/// Compute the transitions and mint requests for `store` at `now`. Pure.
pub fn plan(store: &KeyStore, now: DateTime<Utc>, policies: &[RotationPolicy]) -> RotationPlan {
    let mut transitioned = Vec::new();
    let entries: Vec<KeyEntry> = store
        .entries()
        .cloned()
        .map(|entry| {
            let before = entry.state();
            let after = match find_policy(policies, entry.key_usage()) {
                Some(policy) => policy.transition(entry, now),
                None => entry,
            };
            if after.state() != before {
                info!(
                    keystore = %store.name(),
                    alias = %after.alias(),
                    from = %before,
                    to = %after.state(),
                    "Key state transition"
                );
                transitioned.push(after.alias().to_string());
            }
            after
        })
        .collect();
    let store = store.with_entries(entries);

    let requests: Vec<MintRequest> = policies
        .iter()
        .filter_map(|policy| {
            let count = policy.keys_to_mint(&store.entries_for(policy.usage()));
            (count > 0).then_some(MintRequest {
                usage: policy.usage(),
                count,
            })
        })
        .collect();

    debug!(
        keystore = %store.name(),
        transitioned = transitioned.len(),
        to_mint = requests.iter().map(|r| r.count).sum::<usize>(),
        "Rotation planned"
    );

    RotationPlan {
        now,
        store,
        transitioned,
        requests,
    }
}

/// Plan and complete a rotation pass in one go, generating material inline
pub async fn evaluate(
    store: &KeyStore,
    now: DateTime<Utc>,
    policies: &[RotationPolicy],
    generator: &dyn KeyGenerator,
    alias_prefix: &str,
) -> KeyResult<Rotation> {
    let mut pool = MaterialPool::default();
    plan(store, now, policies)
        .complete(policies, &mut pool, generator, alias_prefix)
        .await
}
