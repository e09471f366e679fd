//! Document-store keystore repository
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


use crate::error::{KeyError, KeyResult};
use crate::key_types::{Alias, KeyEntryAttributes, KeyStore};
use crate::repository::{KeyStoreRepository, KeyStoreSealer, SealedKeyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

/// Collections of JSON documents addressed by id
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn collection_exists(&self, collection: &str) -> KeyResult<bool>;

    /// Idempotent
    async fn create_collection(&self, collection: &str) -> KeyResult<()>;

    /// `Ok(None)` for a missing document or collection
    async fn find_by_id(&self, collection: &str, id: &str) -> KeyResult<Option<Value>>;

    /// Replace the whole document, inserting it when absent
    async fn replace_by_id(&self, collection: &str, id: &str, document: Value) -> KeyResult<()>;

    /// Insert only if no document has this id; returns false otherwise
    async fn insert(&self, collection: &str, id: &str, document: Value) -> KeyResult<bool>;
}

/// Process-local document store
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unknown_collection(collection: &str) -> KeyError {
    KeyError::Write(format!("Unknown collection {}", collection))
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn collection_exists(&self, collection: &str) -> KeyResult<bool> {
        Ok(self.collections.read().await.contains_key(collection))
    }

    async fn create_collection(&self, collection: &str) -> KeyResult<()> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> KeyResult<Option<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }

    async fn replace_by_id(&self, collection: &str, id: &str, document: Value) -> KeyResult<()> {
        let mut collections = self.collections.write().await;
        let documents = collections
            .get_mut(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        documents.insert(id.to_string(), document);
        Ok(())
    }

    async fn insert(&self, collection: &str, id: &str, document: Value) -> KeyResult<bool> {
        let mut collections = self.collections.write().await;
        let documents = collections
            .get_mut(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        if documents.contains_key(id) {
            return Ok(false);
        }
        documents.insert(id.to_string(), document);
        Ok(true)
    }
}

/// Persisted shape of a keystore document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStoreDocument {
    #[serde(rename = "_id")]
    pub name: String,
    #[serde(rename = "type")]
    pub store_type: String,
    /// Hex-encoded sealed blob
    pub keystore: String,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: BTreeMap<Alias, KeyEntryAttributes>,
}

impl From<SealedKeyStore> for KeyStoreDocument {
    fn from(sealed: SealedKeyStore) -> Self {
        Self {
            name: sealed.name,
            store_type: sealed.store_type,
            keystore: hex::encode(sealed.keystore),
            last_update: sealed.last_update,
            entries: sealed.entries,
        }
    }
}

impl KeyStoreDocument {
    fn into_sealed(self) -> KeyResult<SealedKeyStore> {
        let keystore = hex::decode(&self.keystore)
            .map_err(|e| KeyError::Corruption(format!("Keystore blob is not valid hex: {}", e)))?;
        Ok(SealedKeyStore {
            name: self.name,
            store_type: self.store_type,
            keystore,
            last_update: self.last_update,
            entries: self.entries,
        })
    }
}

/// Keystores as one document each inside a collection
pub struct DocumentRepository {
    documents: Arc<dyn DocumentStore>,
    collection: String,
    auto_create: bool,
    sealer: KeyStoreSealer,
    collection_ready: OnceCell<()>,
}

impl DocumentRepository {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        sealer: KeyStoreSealer,
        auto_create: bool,
    ) -> Self {
        Self {
            documents,
            collection: collection.into(),
            auto_create,
            sealer,
            collection_ready: OnceCell::new(),
        }
    }

    async fn ensure_collection(&self) -> KeyResult<()> {
        if !self.auto_create {
            return Ok(());
        }
        self.collection_ready
            .get_or_try_init(|| async {
                if !self.documents.collection_exists(&self.collection).await? {
                    info!(collection = %self.collection, "Creating keystore collection");
                    self.documents.create_collection(&self.collection).await?;
                }
                Ok::<(), KeyError>(())
            })
            .await?;
        Ok(())
    }

    async fn find(&self, name: &str) -> KeyResult<KeyStoreDocument> {
        self.ensure_collection().await?;
        let value = self
            .documents
            .find_by_id(&self.collection, name)
            .await?
            .ok_or_else(|| KeyError::NotFound(name.to_string()))?;
        serde_json::from_value(value)
            .map_err(|e| KeyError::Corruption(format!("Malformed keystore document: {}", e)))
    }

    fn encode(&self, store: &KeyStore, now: DateTime<Utc>) -> KeyResult<Value> {
        let document = KeyStoreDocument::from(self.sealer.seal(store, now)?);
        Ok(serde_json::to_value(document)?)
    }
}

#[async_trait]
impl KeyStoreRepository for DocumentRepository {
    fn backend_name(&self) -> &'static str {
        "document"
    }

    async fn exists(&self, name: &str) -> KeyResult<bool> {
        self.ensure_collection().await?;
        Ok(self
            .documents
            .find_by_id(&self.collection, name)
            .await?
            .is_some())
    }

    async fn load(&self, name: &str) -> KeyResult<KeyStore> {
        let document = self.find(name).await?;
        let store = self.sealer.unseal(document.into_sealed()?)?;
        debug!(keystore = %name, entries = store.len(), "Loaded keystore document");
        Ok(store)
    }

    async fn save(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>> {
        self.ensure_collection().await?;
        let now = Utc::now();
        let document = self.encode(store, now)?;
        self.documents
            .replace_by_id(&self.collection, store.name(), document)
            .await?;
        Ok(now)
    }

    async fn create(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>> {
        self.ensure_collection().await?;
        let now = Utc::now();
        let document = self.encode(store, now)?;
        if !self
            .documents
            .insert(&self.collection, store.name(), document)
            .await?
        {
            return Err(KeyError::AlreadyExists(store.name().to_string()));
        }
        Ok(now)
    }

    async fn load_attributes(&self, name: &str) -> KeyResult<BTreeMap<Alias, KeyEntryAttributes>> {
        Ok(self.find(name).await?.entries)
    }

    async fn last_update(&self, name: &str) -> KeyResult<DateTime<Utc>> {
        Ok(self
            .find(name)
            .await?
            .last_update
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SealedKeyStoreCodec;
    use serde_json::json;

    fn repository(store: Arc<InMemoryDocumentStore>, auto_create: bool) -> DocumentRepository {
        let sealer = KeyStoreSealer::new(Arc::new(SealedKeyStoreCodec::new()), "pw");
        DocumentRepository::new(store, "keystores", sealer, auto_create)
    }

    #[tokio::test]
    async fn test_replace_requires_collection() {
        let store = InMemoryDocumentStore::new();
        assert!(store.replace_by_id("none", "a", json!({})).await.is_err());
        store.create_collection("c").await.unwrap();
        assert!(store.insert("c", "a", json!({"v": 1})).await.unwrap());
        assert!(!store.insert("c", "a", json!({"v": 2})).await.unwrap());
        assert_eq!(store.find_by_id("c", "a").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_null_last_update_loads_as_epoch() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let repo = repository(Arc::clone(&documents), true);
        repo.save(&KeyStore::new("main", SealedKeyStoreCodec::STORE_TYPE))
            .await
            .unwrap();

        let mut raw = documents.find_by_id("keystores", "main").await.unwrap().unwrap();
        raw["lastUpdate"] = Value::Null;
        documents.replace_by_id("keystores", "main", raw).await.unwrap();

        let loaded = repo.load("main").await.unwrap();
        assert_eq!(loaded.last_update(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_without_auto_create_save_fails() {
        let repo = repository(Arc::new(InMemoryDocumentStore::new()), false);
        let err = repo
            .save(&KeyStore::new("main", SealedKeyStoreCodec::STORE_TYPE))
            .await
            .unwrap_err();
        assert!(matches!(err, KeyError::Write(_)));
        assert!(!repo.exists("main").await.unwrap());
    }

    #[tokio::test]
    async fn test_document_layout_is_readable() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let repo = repository(Arc::clone(&documents), true);
        repo.save(&KeyStore::new("main", SealedKeyStoreCodec::STORE_TYPE))
            .await
            .unwrap();

        let raw = documents.find_by_id("keystores", "main").await.unwrap().unwrap();
        assert_eq!(raw["_id"], json!("main"));
        assert_eq!(raw["type"], json!(SealedKeyStoreCodec::STORE_TYPE));
        assert!(raw["keystore"].is_string());
        assert!(raw["entries"].is_object());
    }
}
