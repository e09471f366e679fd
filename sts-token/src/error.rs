//! Token error types
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



use sts_keymanagement::KeyError;
use thiserror::Error;

/// Claim assembly errors
#[derive(Error, Debug)]
pub enum TokenError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Secret encryption failed: {0}")]
    Encryption(String),

    #[error("Claim serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for token operations
pub type TokenResult<T> = Result<T, TokenError>;
