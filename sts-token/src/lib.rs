//! Token claim assembly for the STS
//!
//! Resolves token audiences to registered resource servers, encrypts the
//! user's secret for each of them under the keystore's current secret key,
//! and embeds the results as claims next to the selected signing key.
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



pub mod claims;
pub mod encryption;
pub mod error;
pub mod resource_server;

pub use claims::{
    apply_secret_claims, build_secret_claims, AssembledClaims, ClaimAssembler, USER_SECRET_CLAIM,
};
pub use encryption::{AesGcmSecretEncryptor, SecretEncryptor};
pub use error::{TokenError, TokenResult};
pub use resource_server::{
    InMemoryResourceServerRegistry, ResourceServer, ResourceServerRegistry, ResourceServerSecret,
};
