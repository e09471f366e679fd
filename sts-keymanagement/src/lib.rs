//! Keystore lifecycle and rotation engine for the STS
//!
//! Keeps each named keystore populated with signing, encryption and secret
//! keys, rotates them through ACTIVE, LEGACY and EXPIRED on a schedule, and
//! persists them through interchangeable storage backends.
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



pub mod clock;
pub mod crypto;
pub mod document;
pub mod error;
pub mod fs_store;
pub mod key_types;
pub mod relational;
pub mod repository;
pub mod rotation;
pub mod service;
pub mod service_integration;

pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{KeyGenerator, KeyMaterialCodec, RandomKeyGenerator, SealedKeyStoreCodec};
pub use document::{DocumentRepository, DocumentStore, InMemoryDocumentStore};
pub use error::{KeyError, KeyResult};
pub use fs_store::{BlobStore, FilesystemRepository, FsBlobStore};
pub use key_types::{
    Alias, KeyEntry, KeyEntryAttributes, KeyMaterial, KeyState, KeyStore, KeyUsage, MaterialKind,
};
pub use relational::RelationalRepository;
pub use repository::{KeyStoreRepository, KeyStoreSealer, SealedKeyStore};
pub use rotation::{Rotation, RotationPlan, RotationPolicy};
pub use service::{KeyStoreService, ServiceSettings};
pub use service_integration::*;
