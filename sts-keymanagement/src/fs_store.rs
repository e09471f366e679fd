//! Filesystem keystore repository over a container/object blob store
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
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Object storage keyed by (container, object)
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn container_exists(&self, container: &str) -> KeyResult<bool>;

    /// Idempotent
    async fn create_container(&self, container: &str) -> KeyResult<()>;

    async fn get(&self, container: &str, object: &str) -> KeyResult<Option<Vec<u8>>>;

    /// Atomically replace the object
    async fn put(&self, container: &str, object: &str, bytes: &[u8]) -> KeyResult<()>;

    /// Atomically create the object; returns false if it already exists
    async fn put_if_absent(&self, container: &str, object: &str, bytes: &[u8]) -> KeyResult<bool>;
}

/// Map a container or object name to a single path segment.
///
/// ASCII letters, digits, `-` and non-leading `.` are kept; every other byte
/// becomes `_XX`. `_` is always escaped, so distinct names never share a file.
fn encode_segment(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if keep {
            encoded.push(char::from(byte));
        } else {
            encoded.push('_');
            encoded.push_str(&hex::encode_upper([byte]));
        }
    }
    encoded
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> KeyError {
    KeyError::Write(format!("{} {}: {}", action, path.display(), e))
}

/// Blob store on the local filesystem: containers are directories, objects are files
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn container_path(&self, container: &str) -> PathBuf {
        self.root.join(encode_segment(container))
    }

    fn object_path(&self, container: &str, object: &str) -> PathBuf {
        self.container_path(container).join(encode_segment(object))
    }

    /// Write bytes to a unique temp file next to `target` and flush them to disk
    async fn write_temp(&self, target: &Path, bytes: &[u8]) -> KeyResult<PathBuf> {
        let file_name = target
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("object");
        let temp = target.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| io_error("Failed to create", &temp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| io_error("Failed to write", &temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("Failed to sync", &temp, e))?;
        Ok(temp)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn container_exists(&self, container: &str) -> KeyResult<bool> {
        let path = self.container_path(container);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("Failed to stat", &path, e)),
        }
    }

    async fn create_container(&self, container: &str) -> KeyResult<()> {
        let path = self.container_path(container);
        fs::create_dir_all(&path)
            .await
            .map_err(|e| io_error("Failed to create", &path, e))
    }

    async fn get(&self, container: &str, object: &str) -> KeyResult<Option<Vec<u8>>> {
        let path = self.object_path(container, object);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("Failed to read", &path, e)),
        }
    }

    async fn put(&self, container: &str, object: &str, bytes: &[u8]) -> KeyResult<()> {
        let target = self.object_path(container, object);
        let temp = self.write_temp(&target, bytes).await?;
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error("Failed to replace", &target, e));
        }
        Ok(())
    }

    async fn put_if_absent(&self, container: &str, object: &str, bytes: &[u8]) -> KeyResult<bool> {
        let target = self.object_path(container, object);
        let temp = self.write_temp(&target, bytes).await?;
        // hard_link refuses to overwrite, which makes the publish step atomic
        let linked = fs::hard_link(&temp, &target).await;
        let _ = fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_error("Failed to publish", &target, e)),
        }
    }
}

/// On-disk document for one keystore
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyStoreFile {
    name: String,
    #[serde(rename = "type")]
    store_type: String,
    last_update: Option<DateTime<Utc>>,
    /// Hex-encoded sealed blob
    keystore: String,
    entries: BTreeMap<Alias, KeyEntryAttributes>,
}

impl KeyStoreFile {
    fn from_sealed(sealed: SealedKeyStore) -> Self {
        Self {
            name: sealed.name,
            store_type: sealed.store_type,
            last_update: sealed.last_update,
            keystore: hex::encode(sealed.keystore),
            entries: sealed.entries,
        }
    }

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

/// Keystores as sealed JSON documents inside one blob-store container
pub struct FilesystemRepository {
    blobs: Arc<dyn BlobStore>,
    container: String,
    auto_create: bool,
    sealer: KeyStoreSealer,
    container_ready: OnceCell<()>,
}

impl FilesystemRepository {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        container: impl Into<String>,
        sealer: KeyStoreSealer,
        auto_create: bool,
    ) -> Self {
        Self {
            blobs,
            container: container.into(),
            auto_create,
            sealer,
            container_ready: OnceCell::new(),
        }
    }

    /// Repository rooted at a local directory
    pub fn local<P: AsRef<Path>>(
        root: P,
        container: impl Into<String>,
        sealer: KeyStoreSealer,
        auto_create: bool,
    ) -> Self {
        Self::new(Arc::new(FsBlobStore::new(root)), container, sealer, auto_create)
    }

    fn object_name(name: &str) -> String {
        format!("{}.keystore.json", name)
    }

    async fn ensure_container(&self) -> KeyResult<()> {
        if !self.auto_create {
            return Ok(());
        }
        self.container_ready
            .get_or_try_init(|| async {
                if !self.blobs.container_exists(&self.container).await? {
                    info!(container = %self.container, "Creating keystore container");
                    self.blobs.create_container(&self.container).await?;
                }
                Ok::<(), KeyError>(())
            })
            .await?;
        Ok(())
    }

    async fn read_file(&self, name: &str) -> KeyResult<KeyStoreFile> {
        self.ensure_container().await?;
        let bytes = self
            .blobs
            .get(&self.container, &Self::object_name(name))
            .await?
            .ok_or_else(|| KeyError::NotFound(name.to_string()))?;
        let file: KeyStoreFile = serde_json::from_slice(&bytes)
            .map_err(|e| KeyError::Corruption(format!("Malformed keystore file: {}", e)))?;
        if file.name != name {
            return Err(KeyError::Corruption(format!(
                "Keystore file for {} holds keystore {}",
                name, file.name
            )));
        }
        Ok(file)
    }

    fn encode(&self, store: &KeyStore, now: DateTime<Utc>) -> KeyResult<Vec<u8>> {
        let sealed = self.sealer.seal(store, now)?;
        Ok(serde_json::to_vec_pretty(&KeyStoreFile::from_sealed(sealed))?)
    }
}

#[async_trait]
impl KeyStoreRepository for FilesystemRepository {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn exists(&self, name: &str) -> KeyResult<bool> {
        self.ensure_container().await?;
        Ok(self
            .blobs
            .get(&self.container, &Self::object_name(name))
            .await?
            .is_some())
    }

    async fn load(&self, name: &str) -> KeyResult<KeyStore> {
        let file = self.read_file(name).await?;
        let store = self.sealer.unseal(file.into_sealed()?)?;
        debug!(keystore = %name, entries = store.len(), "Loaded keystore from filesystem");
        Ok(store)
    }

    async fn save(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>> {
        self.ensure_container().await?;
        let now = Utc::now();
        let bytes = self.encode(store, now)?;
        self.blobs
            .put(&self.container, &Self::object_name(store.name()), &bytes)
            .await?;
        Ok(now)
    }

    async fn create(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>> {
        self.ensure_container().await?;
        let now = Utc::now();
        let bytes = self.encode(store, now)?;
        let created = self
            .blobs
            .put_if_absent(&self.container, &Self::object_name(store.name()), &bytes)
            .await?;
        if !created {
            return Err(KeyError::AlreadyExists(store.name().to_string()));
        }
        Ok(now)
    }

    async fn load_attributes(&self, name: &str) -> KeyResult<BTreeMap<Alias, KeyEntryAttributes>> {
        Ok(self.read_file(name).await?.entries)
    }

    async fn last_update(&self, name: &str) -> KeyResult<DateTime<Utc>> {
        Ok(self
            .read_file(name)
            .await?
            .last_update
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }
}
