//! Token claim assembly from rotated keys and per-resource-server secrets
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



use crate::encryption::{AesGcmSecretEncryptor, SecretEncryptor};
use crate::error::{TokenError, TokenResult};
use crate::resource_server::{ResourceServerRegistry, ResourceServerSecret};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use sts_keymanagement::{KeyEntry, KeyStoreService, KeyUsage};
use tracing::debug;

/// Claim holding the JSON-encoded map of claim name to encrypted secret
pub const USER_SECRET_CLAIM: &str = "user-secret";

/// Map each resource server's claim name to its encrypted secret.
///
/// Servers whose claim name and audience are both blank are skipped. When two
/// servers resolve to the same claim name the later one wins.
pub fn build_secret_claims(secrets: &[ResourceServerSecret]) -> BTreeMap<String, String> {
    let mut claims = BTreeMap::new();
    for secret in secrets {
        match secret.resource_server.claim_name() {
            Some(name) => {
                claims.insert(name.to_string(), secret.encrypted_secret.clone());
            }
            None => debug!("Skipping resource server without an addressable claim"),
        }
    }
    claims
}

/// Add the `user-secret` claim. Leaves `claims` untouched when there are no secrets.
pub fn apply_secret_claims(
    claims: &mut Map<String, Value>,
    secrets: &[ResourceServerSecret],
) -> TokenResult<()> {
    if secrets.is_empty() {
        return Ok(());
    }
    let encoded = serde_json::to_string(&build_secret_claims(secrets))?;
    claims.insert(USER_SECRET_CLAIM.to_string(), Value::String(encoded));
    Ok(())
}

/// Claims ready for signing, with the key to sign them under
#[derive(Debug, Clone)]
pub struct AssembledClaims {
    pub claims: Map<String, Value>,
    pub signing_key: KeyEntry,
}

pub struct ClaimAssembler {
    service: Arc<KeyStoreService>,
    registry: Arc<dyn ResourceServerRegistry>,
    encryptor: Arc<dyn SecretEncryptor>,
}

impl ClaimAssembler {
    pub fn new(
        service: Arc<KeyStoreService>,
        registry: Arc<dyn ResourceServerRegistry>,
        encryptor: Arc<dyn SecretEncryptor>,
    ) -> Self {
        Self {
            service,
            registry,
            encryptor,
        }
    }

    /// Assembler using AES-GCM secret encryption
    pub fn with_default_encryptor(
        service: Arc<KeyStoreService>,
        registry: Arc<dyn ResourceServerRegistry>,
    ) -> Self {
        Self::new(service, registry, Arc::new(AesGcmSecretEncryptor::new()))
    }

    /// Encrypt `user_secret` for every known audience under the newest active secret key.
    /// Unknown audiences are skipped.
    pub async fn process_resources(
        &self,
        keystore: &str,
        audiences: &[String],
        user_secret: &str,
    ) -> TokenResult<Vec<ResourceServerSecret>> {
        let mut servers = Vec::with_capacity(audiences.len());
        for audience in audiences {
            match self.registry.find_by_audience(audience).await? {
                Some(server) => servers.push(server),
                None => debug!(audience = %audience, "Unknown audience, skipping"),
            }
        }
        if servers.is_empty() {
            return Ok(Vec::new());
        }

        let key = self
            .service
            .select_active_key(keystore, KeyUsage::SecretKey)
            .await?;
        servers
            .into_iter()
            .map(|resource_server| -> TokenResult<ResourceServerSecret> {
                let encrypted_secret = self.encryptor.encrypt(&key, user_secret.as_bytes())?;
                debug!(
                    audience = %resource_server.audience,
                    alias = %key.alias(),
                    "Encrypted user secret"
                );
                Ok(ResourceServerSecret {
                    resource_server,
                    encrypted_secret,
                })
            })
            .collect()
    }

    /// Add the user secret claims to `claims` and select the signing key
    pub async fn assemble(
        &self,
        keystore: &str,
        mut claims: Map<String, Value>,
        audiences: &[String],
        user_secret: &str,
    ) -> TokenResult<AssembledClaims> {
        let signing_key = self.service.select_signing_key(keystore).await?;
        let secrets = self
            .process_resources(keystore, audiences, user_secret)
            .await?;
        apply_secret_claims(&mut claims, &secrets)?;
        Ok(AssembledClaims {
            claims,
            signing_key,
        })
    }

    /// Decrypt a secret produced by `process_resources`.
    ///
    /// Any active or legacy secret key of the keystore is accepted.
    pub async fn reveal_secret(&self, keystore: &str, encrypted: &str) -> TokenResult<Vec<u8>> {
        let alias = AesGcmSecretEncryptor::key_alias(encrypted)
            .ok_or_else(|| TokenError::Encryption("Encrypted secret has no key alias".to_string()))?;
        let key = self
            .service
            .select_verification_keys(keystore, KeyUsage::SecretKey)
            .await?
            .into_iter()
            .find(|key| key.alias() == alias)
            .ok_or_else(|| {
                TokenError::Encryption(format!("No usable secret key {} in {}", alias, keystore))
            })?;
        self.encryptor.decrypt(&key, encrypted)
    }
}
