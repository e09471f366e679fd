//! Encryption of user secrets for resource servers
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



use crate::error::{TokenError, TokenResult};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use sts_keymanagement::{KeyEntry, KeyUsage};

const NONCE_LEN: usize = 12;

/// Encrypts a user secret under a keystore entry
pub trait SecretEncryptor: Send + Sync {
    fn encrypt(&self, key: &KeyEntry, plaintext: &[u8]) -> TokenResult<String>;

    fn decrypt(&self, key: &KeyEntry, encrypted: &str) -> TokenResult<Vec<u8>>;
}

/// AES-256-GCM under a `SecretKey` entry.
///
/// Output is `{alias}.{hex(nonce | ciphertext)}` so the recipient can find the key.
#[derive(Debug, Default, Clone)]
pub struct AesGcmSecretEncryptor;

impl AesGcmSecretEncryptor {
    pub fn new() -> Self {
        Self
    }

    /// Alias of the key an encrypted secret was produced with
    pub fn key_alias(encrypted: &str) -> Option<&str> {
        encrypted.rsplit_once('.').map(|(alias, _)| alias)
    }

    fn cipher(key: &KeyEntry) -> TokenResult<Aes256Gcm> {
        if key.key_usage() != KeyUsage::SecretKey {
            return Err(TokenError::Encryption(format!(
                "Key {} is a {} key, not a secret key",
                key.alias(),
                key.key_usage()
            )));
        }
        Aes256Gcm::new_from_slice(key.material().expose()).map_err(|_| {
            TokenError::Encryption(format!(
                "Key {} has {} bytes of material, AES-256 needs 32",
                key.alias(),
                key.material().len()
            ))
        })
    }
}

impl SecretEncryptor for AesGcmSecretEncryptor {
    fn encrypt(&self, key: &KeyEntry, plaintext: &[u8]) -> TokenResult<String> {
        let cipher = Self::cipher(key)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| TokenError::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(format!("{}.{}", key.alias(), hex::encode(sealed)))
    }

    fn decrypt(&self, key: &KeyEntry, encrypted: &str) -> TokenResult<Vec<u8>> {
        let (alias, payload) = encrypted
            .rsplit_once('.')
            .ok_or_else(|| TokenError::Encryption("Encrypted secret has no key alias".to_string()))?;
        if alias != key.alias() {
            return Err(TokenError::Encryption(format!(
                "Secret was encrypted with {}, not {}",
                alias,
                key.alias()
            )));
        }
        let sealed = hex::decode(payload)
            .map_err(|e| TokenError::Encryption(format!("Encrypted secret is not hex: {}", e)))?;
        if sealed.len() < NONCE_LEN {
            return Err(TokenError::Encryption("Encrypted secret is truncated".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        Self::cipher(key)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::Encryption("Encrypted secret failed authentication".to_string()))
    }
}
