//! Resource servers that receive per-user secrets inside issued tokens
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



use crate::error::TokenResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

fn non_blank(value: &str) -> Option<&str> {
    (!value.trim().is_empty()).then_some(value)
}

/// A registered token audience
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceServer {
    pub audience: String,
    /// Claim carrying this server's encrypted user secret
    #[serde(default)]
    pub user_secret_claim_name: Option<String>,
    #[serde(default)]
    pub jwks_url: Option<String>,
}

impl ResourceServer {
    pub fn new(audience: impl Into<String>) -> Self {
        Self {
            audience: audience.into(),
            user_secret_claim_name: None,
            jwks_url: None,
        }
    }

    pub fn with_claim_name(mut self, claim_name: impl Into<String>) -> Self {
        self.user_secret_claim_name = Some(claim_name.into());
        self
    }

    pub fn with_jwks_url(mut self, jwks_url: impl Into<String>) -> Self {
        self.jwks_url = Some(jwks_url.into());
        self
    }

    /// The configured claim name, or the audience when that is blank.
    /// `None` when both are blank.
    pub fn claim_name(&self) -> Option<&str> {
        self.user_secret_claim_name
            .as_deref()
            .and_then(non_blank)
            .or_else(|| non_blank(&self.audience))
    }
}

/// A resource server paired with the user secret encrypted for it. Request scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceServerSecret {
    pub resource_server: ResourceServer,
    pub encrypted_secret: String,
}

/// Read-only lookup of resource servers by audience
#[async_trait]
pub trait ResourceServerRegistry: Send + Sync {
    async fn find_by_audience(&self, audience: &str) -> TokenResult<Option<ResourceServer>>;

    async fn all(&self) -> TokenResult<Vec<ResourceServer>>;
}

/// Process-local registry
#[derive(Debug, Default)]
pub struct InMemoryResourceServerRegistry {
    servers: RwLock<BTreeMap<String, ResourceServer>>,
}

impl InMemoryResourceServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_servers(servers: impl IntoIterator<Item = ResourceServer>) -> Self {
        Self {
            servers: RwLock::new(
                servers
                    .into_iter()
                    .map(|server| (server.audience.clone(), server))
                    .collect(),
            ),
        }
    }

    /// Add or replace the server registered for its audience
    pub async fn register(&self, server: ResourceServer) {
        self.servers
            .write()
            .await
            .insert(server.audience.clone(), server);
    }
}

#[async_trait]
impl ResourceServerRegistry for InMemoryResourceServerRegistry {
    async fn find_by_audience(&self, audience: &str) -> TokenResult<Option<ResourceServer>> {
        Ok(self.servers.read().await.get(audience).cloned())
    }

    async fn all(&self) -> TokenResult<Vec<ResourceServer>> {
        Ok(self.servers.read().await.values().cloned().collect())
    }
}
