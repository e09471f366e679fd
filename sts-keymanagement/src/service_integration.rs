//! Wiring a key store service from configuration
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


use crate::crypto::{RandomKeyGenerator, SealedKeyStoreCodec};
use crate::document::{DocumentRepository, InMemoryDocumentStore};
use crate::error::{KeyError, KeyResult};
use crate::fs_store::FilesystemRepository;
use crate::relational::RelationalRepository;
use crate::repository::{KeyStoreRepository, KeyStoreSealer};
use crate::service::{KeyStoreService, ServiceSettings};
use std::path::Path;
use std::sync::Arc;
use sts_config::{KeyManagementConfig, PersistenceBackend};
use tracing::info;

/// Build the repository selected by `persistence.backend`
pub fn open_repository(config: &KeyManagementConfig) -> KeyResult<Arc<dyn KeyStoreRepository>> {
    if config.keystore.store_type != SealedKeyStoreCodec::STORE_TYPE {
        return Err(KeyError::Configuration(format!(
            "Unsupported keystore.store_type {:?}, only {:?} is available",
            config.keystore.store_type,
            SealedKeyStoreCodec::STORE_TYPE
        )));
    }

    let sealer = KeyStoreSealer::new(Arc::new(SealedKeyStoreCodec::new()), &config.keystore.password);
    let persistence = &config.persistence;

    info!(
        backend = ?persistence.backend,
        container = %persistence.container_name,
        path = %persistence.path,
        "Opening keystore repository"
    );

    let repository: Arc<dyn KeyStoreRepository> = match persistence.backend {
        PersistenceBackend::Filesystem => Arc::new(FilesystemRepository::local(
            &persistence.path,
            persistence.container_name.clone(),
            sealer,
            persistence.auto_create,
        )),
        PersistenceBackend::Relational => {
            let path = Path::new(&persistence.path);
            if persistence.auto_create {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        KeyError::Write(format!("Failed to create {}: {}", parent.display(), e))
                    })?;
                }
            }
            Arc::new(RelationalRepository::open(path, sealer, persistence.auto_create)?)
        }
        PersistenceBackend::Document => Arc::new(DocumentRepository::new(
            Arc::new(InMemoryDocumentStore::new()),
            persistence.container_name.clone(),
            sealer,
            persistence.auto_create,
        )),
    };
    Ok(repository)
}

/// Initialize a key store service for the configured backend
pub fn init_key_store_service(config: &KeyManagementConfig) -> KeyResult<Arc<KeyStoreService>> {
    let repository = open_repository(config)?;
    Ok(Arc::new(KeyStoreService::new(
        repository,
        Arc::new(RandomKeyGenerator::new()),
        ServiceSettings::from_config(config),
    )))
}
