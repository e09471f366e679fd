//! Keystore and key entry model
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Unique identifier of a key entry inside a keystore
pub type Alias = String;

/// Rotation state of a key entry.
///
/// States only ever advance: `Active` -> `Legacy` -> `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyState {
    /// Used for new signatures and encryptions
    Active,
    /// Only kept to verify or decrypt what was produced earlier
    Legacy,
    Expired,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Active => "ACTIVE",
            KeyState::Legacy => "LEGACY",
            KeyState::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(KeyState::Active),
            "LEGACY" => Some(KeyState::Legacy),
            "EXPIRED" => Some(KeyState::Expired),
            _ => None,
        }
    }

    /// Usable for verification or decryption
    pub fn is_usable(&self) -> bool {
        !matches!(self, KeyState::Expired)
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a key entry is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyUsage {
    /// Key pair signing issued tokens
    Signature,
    /// Key pair for token encryption
    Encryption,
    /// Symmetric secret key
    SecretKey,
}

impl KeyUsage {
    pub const ALL: [KeyUsage; 3] = [KeyUsage::Signature, KeyUsage::Encryption, KeyUsage::SecretKey];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyUsage::Signature => "SIGNATURE",
            KeyUsage::Encryption => "ENCRYPTION",
            KeyUsage::SecretKey => "SECRET_KEY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SIGNATURE" => Some(KeyUsage::Signature),
            "ENCRYPTION" => Some(KeyUsage::Encryption),
            "SECRET_KEY" => Some(KeyUsage::SecretKey),
            _ => None,
        }
    }

    /// Kind of material minted for this usage
    pub fn material_kind(&self) -> MaterialKind {
        match self {
            KeyUsage::Signature | KeyUsage::Encryption => MaterialKind::KeyPair,
            KeyUsage::SecretKey => MaterialKind::Secret,
        }
    }
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of opaque key material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    KeyPair,
    Secret,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SecretBytes(Vec<u8>);

/// Opaque key material handle.
///
/// Clones share the same buffer, which is wiped when the last handle drops.
#[derive(Clone)]
pub struct KeyMaterial {
    kind: MaterialKind,
    algorithm: String,
    bytes: Arc<SecretBytes>,
}

impl KeyMaterial {
    pub fn new(kind: MaterialKind, algorithm: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            algorithm: algorithm.into(),
            bytes: Arc::new(SecretBytes(bytes)),
        }
    }

    pub fn kind(&self) -> MaterialKind {
        self.kind
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Borrow the raw bytes for a crypto operation
    pub fn expose(&self) -> &[u8] {
        &self.bytes.0
    }

    pub fn len(&self) -> usize {
        self.bytes.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.0.is_empty()
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.algorithm == other.algorithm && self.expose() == other.expose()
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("kind", &self.kind)
            .field("algorithm", &self.algorithm)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Backend-visible metadata of a key entry, readable without unlocking the keystore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntryAttributes {
    pub alias: Alias,
    pub created_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub expire_at: Option<DateTime<Utc>>,
    /// Milliseconds
    pub validity_interval: i64,
    /// Milliseconds
    pub legacy_interval: i64,
    pub state: KeyState,
    pub key_usage: KeyUsage,
}

/// One key inside a keystore: its attributes plus the material they describe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    attributes: KeyEntryAttributes,
    material: KeyMaterial,
}

impl KeyEntry {
    pub fn new(attributes: KeyEntryAttributes, material: KeyMaterial) -> Self {
        Self { attributes, material }
    }

    pub fn attributes(&self) -> &KeyEntryAttributes {
        &self.attributes
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    pub fn alias(&self) -> &str {
        &self.attributes.alias
    }

    pub fn state(&self) -> KeyState {
        self.attributes.state
    }

    pub fn key_usage(&self) -> KeyUsage {
        self.attributes.key_usage
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.attributes.created_at
    }

    /// Copy of this entry demoted to `Legacy` at `now`.
    ///
    /// A projected `expire_at` earlier than `now` moves up to `now` so the
    /// window stays ordered.
    pub fn into_legacy(self, now: DateTime<Utc>) -> Self {
        Self {
            attributes: KeyEntryAttributes {
                state: KeyState::Legacy,
                not_after: Some(now),
                expire_at: self.attributes.expire_at.map(|at| at.max(now)),
                ..self.attributes
            },
            material: self.material,
        }
    }

    /// Copy of this entry marked `Expired` at `now`. A `not_after` later than
    /// `now` is pulled back to `now`.
    pub fn into_expired(self, now: DateTime<Utc>) -> Self {
        Self {
            attributes: KeyEntryAttributes {
                state: KeyState::Expired,
                not_after: self.attributes.not_after.map(|at| at.min(now)),
                expire_at: Some(now),
                ..self.attributes
            },
            material: self.material,
        }
    }

    /// Ordering where the newest entry sorts first: highest `created_at`,
    /// then lexicographically greatest alias.
    pub fn newest_first(a: &KeyEntry, b: &KeyEntry) -> Ordering {
        b.created_at()
            .cmp(&a.created_at())
            .then_with(|| b.alias().cmp(a.alias()))
    }
}

/// A named, password-protected container of key entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStore {
    name: String,
    store_type: String,
    last_update: DateTime<Utc>,
    entries: BTreeMap<Alias, KeyEntry>,
}

impl KeyStore {
    /// Empty keystore that has never been persisted
    pub fn new(name: impl Into<String>, store_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store_type: store_type.into(),
            last_update: DateTime::<Utc>::UNIX_EPOCH,
            entries: BTreeMap::new(),
        }
    }

    /// Keystore from fully specified parts. Entries are keyed by their own alias;
    /// a later entry with a duplicate alias replaces the earlier one.
    pub fn from_parts(
        name: impl Into<String>,
        store_type: impl Into<String>,
        last_update: DateTime<Utc>,
        entries: impl IntoIterator<Item = KeyEntry>,
    ) -> Self {
        Self {
            name: name.into(),
            store_type: store_type.into(),
            last_update,
            entries: entries
                .into_iter()
                .map(|entry| (entry.alias().to_string(), entry))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store_type(&self) -> &str {
        &self.store_type
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn entries(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.values()
    }

    pub fn entry(&self, alias: &str) -> Option<&KeyEntry> {
        self.entries.get(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Same keystore with its entry set replaced
    pub fn with_entries(&self, entries: impl IntoIterator<Item = KeyEntry>) -> Self {
        Self::from_parts(self.name.clone(), self.store_type.clone(), self.last_update, entries)
    }

    /// Same keystore stamped with a new persistence instant
    pub fn with_last_update(self, last_update: DateTime<Utc>) -> Self {
        Self { last_update, ..self }
    }

    /// True when both keystores hold exactly the same entries
    pub fn same_entries(&self, other: &KeyStore) -> bool {
        self.entries == other.entries
    }

    pub fn materials(&self) -> BTreeMap<Alias, KeyMaterial> {
        self.entries
            .iter()
            .map(|(alias, entry)| (alias.clone(), entry.material().clone()))
            .collect()
    }

    pub fn attributes(&self) -> BTreeMap<Alias, KeyEntryAttributes> {
        self.entries
            .iter()
            .map(|(alias, entry)| (alias.clone(), entry.attributes().clone()))
            .collect()
    }

    /// Entries of one usage, newest first
    pub fn entries_for(&self, usage: KeyUsage) -> Vec<&KeyEntry> {
        let mut entries: Vec<&KeyEntry> = self
            .entries
            .values()
            .filter(|entry| entry.key_usage() == usage)
            .collect();
        entries.sort_by(|a, b| KeyEntry::newest_first(a, b));
        entries
    }

    /// Newest `Active` entry of a usage
    pub fn newest_active(&self, usage: KeyUsage) -> Option<&KeyEntry> {
        self.entries_for(usage)
            .into_iter()
            .find(|entry| entry.state() == KeyState::Active)
    }

    /// `Active` and `Legacy` entries of a usage, newest first
    pub fn verification_keys(&self, usage: KeyUsage) -> Vec<&KeyEntry> {
        self.entries_for(usage)
            .into_iter()
            .filter(|entry| entry.state().is_usable())
            .collect()
    }
}
