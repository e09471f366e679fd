//! Storage-agnostic keystore persistence contract
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


use crate::crypto::KeyMaterialCodec;
use crate::error::{KeyError, KeyResult};
use crate::key_types::{Alias, KeyEntry, KeyEntryAttributes, KeyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Load/save contract every storage backend satisfies identically.
///
/// `save` and `create` are atomic from the caller's perspective and stamp
/// `last_update` with the persistence instant, which they return.
#[async_trait]
pub trait KeyStoreRepository: Send + Sync {
    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    async fn exists(&self, name: &str) -> KeyResult<bool>;

    /// Fails with `NotFound`, `Corruption` or `UnsupportedFormat`
    async fn load(&self, name: &str) -> KeyResult<KeyStore>;

    /// Insert or replace the keystore
    async fn save(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>>;

    /// Insert the keystore only if absent; `AlreadyExists` otherwise
    async fn create(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>>;

    /// Per-alias metadata, read without unlocking the key material
    async fn load_attributes(&self, name: &str) -> KeyResult<BTreeMap<Alias, KeyEntryAttributes>>;

    /// Last persistence instant, read without unlocking the key material.
    /// A keystore that never recorded one reports the epoch.
    async fn last_update(&self, name: &str) -> KeyResult<DateTime<Utc>>;
}

/// Storage-level shape of a keystore: sealed material blob plus readable metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedKeyStore {
    pub name: String,
    pub store_type: String,
    pub keystore: Vec<u8>,
    /// `None` when the backend has never recorded a persistence instant
    pub last_update: Option<DateTime<Utc>>,
    pub entries: BTreeMap<Alias, KeyEntryAttributes>,
}

/// Maps between `KeyStore` and `SealedKeyStore` using a codec and the keystore password
#[derive(Clone)]
pub struct KeyStoreSealer {
    codec: Arc<dyn KeyMaterialCodec>,
    password: Zeroizing<String>,
}

impl KeyStoreSealer {
    pub fn new(codec: Arc<dyn KeyMaterialCodec>, password: &str) -> Self {
        Self {
            codec,
            password: Zeroizing::new(password.to_string()),
        }
    }

    pub fn store_type(&self) -> &str {
        self.codec.store_type()
    }

    pub fn seal(&self, store: &KeyStore, last_update: DateTime<Utc>) -> KeyResult<SealedKeyStore> {
        let provider = || self.password.clone();
        let keystore = self.codec.serialize(&store.materials(), &provider)?;
        Ok(SealedKeyStore {
            name: store.name().to_string(),
            store_type: self.codec.store_type().to_string(),
            keystore,
            last_update: Some(last_update),
            entries: store.attributes(),
        })
    }

    pub fn unseal(&self, sealed: SealedKeyStore) -> KeyResult<KeyStore> {
        if sealed.store_type != self.codec.store_type() {
            return Err(KeyError::UnsupportedFormat(format!(
                "Keystore {} has type {:?}, expected {:?}",
                sealed.name,
                sealed.store_type,
                self.codec.store_type()
            )));
        }

        let provider = || self.password.clone();
        let mut materials = self.codec.deserialize(&sealed.keystore, &provider)?;

        let mut entries = Vec::with_capacity(sealed.entries.len());
        for (alias, attributes) in sealed.entries {
            if alias != attributes.alias {
                return Err(KeyError::Corruption(format!(
                    "Entry stored under {} claims alias {}",
                    alias, attributes.alias
                )));
            }
            let material = materials.remove(&alias).ok_or_else(|| {
                KeyError::Corruption(format!("No key material for alias {}", alias))
            })?;
            entries.push(KeyEntry::new(attributes, material));
        }
        if !materials.is_empty() {
            let orphans: Vec<&str> = materials.keys().map(String::as_str).collect();
            return Err(KeyError::Corruption(format!(
                "Key material without attributes: {}",
                orphans.join(", ")
            )));
        }

        Ok(KeyStore::from_parts(
            sealed.name,
            sealed.store_type,
            sealed.last_update.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            entries,
        ))
    }
}

/// Timestamp encoding shared by backends that store text
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(value: &str) -> KeyResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| KeyError::Corruption(format!("Invalid timestamp {:?}: {}", value, e)))
}
