//! Key material sealing and generation
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
use crate::key_types::{Alias, KeyMaterial, MaterialKind};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

/// Supplies the keystore password for the duration of a single encode/decode call
pub type PasswordProvider<'a> = &'a (dyn Fn() -> Zeroizing<String> + Sync);

/// Serializes the key material of a whole keystore into one password-protected blob
pub trait KeyMaterialCodec: Send + Sync {
    /// Format tag persisted next to the blob
    fn store_type(&self) -> &str;

    fn serialize(
        &self,
        materials: &BTreeMap<Alias, KeyMaterial>,
        password: PasswordProvider<'_>,
    ) -> KeyResult<Vec<u8>>;

    fn deserialize(
        &self,
        bytes: &[u8],
        password: PasswordProvider<'_>,
    ) -> KeyResult<BTreeMap<Alias, KeyMaterial>>;
}

/// Produces fresh key material
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate_key_pair(&self, algorithm: &str, key_size: u32) -> KeyResult<KeyMaterial>;

    async fn generate_secret_key(&self, algorithm: &str, key_size: u32) -> KeyResult<KeyMaterial>;

    /// Dispatch on the kind of material wanted
    async fn generate(
        &self,
        kind: MaterialKind,
        algorithm: &str,
        key_size: u32,
    ) -> KeyResult<KeyMaterial> {
        match kind {
            MaterialKind::KeyPair => self.generate_key_pair(algorithm, key_size).await,
            MaterialKind::Secret => self.generate_secret_key(algorithm, key_size).await,
        }
    }
}

const MAGIC: &[u8; 4] = b"STSK";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

#[derive(Serialize, Deserialize)]
struct MaterialRecord {
    kind: MaterialKind,
    algorithm: String,
    material: String,
}

/// AES-256-GCM sealed keystore blob.
///
/// Layout: `STSK` | version | salt (16) | nonce (12) | ciphertext. The
/// sealing key is SHA-256 over salt and password; the plaintext is a JSON
/// map of alias to material.
#[derive(Debug, Default, Clone)]
pub struct SealedKeyStoreCodec;

impl SealedKeyStoreCodec {
    pub const STORE_TYPE: &'static str = "sts-sealed-v1";

    pub fn new() -> Self {
        Self
    }

    fn derive_key(salt: &[u8], password: &str) -> Zeroizing<[u8; 32]> {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&hasher.finalize());
        key
    }
}

impl KeyMaterialCodec for SealedKeyStoreCodec {
    fn store_type(&self) -> &str {
        Self::STORE_TYPE
    }

    fn serialize(
        &self,
        materials: &BTreeMap<Alias, KeyMaterial>,
        password: PasswordProvider<'_>,
    ) -> KeyResult<Vec<u8>> {
        let records: BTreeMap<&str, MaterialRecord> = materials
            .iter()
            .map(|(alias, material)| {
                (
                    alias.as_str(),
                    MaterialRecord {
                        kind: material.kind(),
                        algorithm: material.algorithm().to_string(),
                        material: hex::encode(material.expose()),
                    },
                )
            })
            .collect();
        let plaintext = Zeroizing::new(serde_json::to_vec(&records)?);

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let key = Self::derive_key(&salt, &password());
        let cipher = Aes256Gcm::new(&(*key).into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| KeyError::Encoding(format!("Sealing keystore failed: {}", e)))?;

        let mut result = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        result.extend_from_slice(MAGIC);
        result.push(FORMAT_VERSION);
        result.extend_from_slice(&salt);
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        password: PasswordProvider<'_>,
    ) -> KeyResult<BTreeMap<Alias, KeyMaterial>> {
        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(KeyError::Corruption("Keystore blob has no valid header".to_string()));
        }
        let version = bytes[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(KeyError::UnsupportedFormat(format!(
                "Sealed keystore version {}",
                version
            )));
        }

        let (salt, rest) = bytes[MAGIC.len() + 1..].split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let key = Self::derive_key(salt, &password());
        let cipher = Aes256Gcm::new(&(*key).into());

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| {
                    KeyError::Corruption(
                        "Unable to unlock keystore: wrong password or tampered data".to_string(),
                    )
                })?,
        );

        let records: BTreeMap<Alias, MaterialRecord> = serde_json::from_slice(&plaintext)
            .map_err(|e| KeyError::Corruption(format!("Malformed keystore payload: {}", e)))?;

        records
            .into_iter()
            .map(|(alias, record)| {
                let bytes = hex::decode(&record.material).map_err(|e| {
                    KeyError::Corruption(format!("Malformed material for {}: {}", alias, e))
                })?;
                Ok((alias, KeyMaterial::new(record.kind, record.algorithm, bytes)))
            })
            .collect()
    }
}

/// Generates opaque random material of the requested size in bits
#[derive(Debug, Default, Clone)]
pub struct RandomKeyGenerator;

impl RandomKeyGenerator {
    pub fn new() -> Self {
        Self
    }

    fn random(kind: MaterialKind, algorithm: &str, key_size: u32) -> KeyResult<KeyMaterial> {
        if key_size == 0 || key_size % 8 != 0 {
            return Err(KeyError::KeyGeneration(format!(
                "Key size must be a positive multiple of 8 bits, got {}",
                key_size
            )));
        }
        let mut bytes = vec![0u8; (key_size / 8) as usize];
        rand::thread_rng().fill_bytes(&mut bytes);
        Ok(KeyMaterial::new(kind, algorithm, bytes))
    }
}

#[async_trait]
impl KeyGenerator for RandomKeyGenerator {
    async fn generate_key_pair(&self, algorithm: &str, key_size: u32) -> KeyResult<KeyMaterial> {
        Self::random(MaterialKind::KeyPair, algorithm, key_size)
    }

    async fn generate_secret_key(&self, algorithm: &str, key_size: u32) -> KeyResult<KeyMaterial> {
        Self::random(MaterialKind::Secret, algorithm, key_size)
    }
}
