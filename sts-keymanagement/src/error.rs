//! Error types for key management
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


use crate::key_types::KeyUsage;
use thiserror::Error;

/// Key management errors
#[derive(Error, Debug)]
pub enum KeyError {
    /// Keystore absent from the backend; recoverable by initialization
    #[error("Keystore not found: {0}")]
    NotFound(String),

    /// Conditional create lost against an existing keystore
    #[error("Keystore already exists: {0}")]
    AlreadyExists(String),

    /// Stored blob cannot be unlocked or fails integrity checks
    #[error("Keystore corrupted: {0}")]
    Corruption(String),

    #[error("Unsupported keystore format: {0}")]
    UnsupportedFormat(String),

    /// Backend unreachable, timed out, or rejected the operation
    #[error("Storage backend error: {0}")]
    Write(String),

    /// Key material could not be serialized or sealed
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("No active {usage} key in keystore {keystore}")]
    NoActiveKey { keystore: String, usage: KeyUsage },

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Keystore {name}: {source}")]
    Keystore {
        name: String,
        #[source]
        source: Box<KeyError>,
    },
}

impl KeyError {
    /// Tag an error with the keystore it concerns. Already tagged errors are kept as is.
    pub fn for_keystore(self, name: &str) -> Self {
        match self {
            tagged @ KeyError::Keystore { .. } => tagged,
            other => KeyError::Keystore {
                name: name.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The error with any keystore tag removed
    pub fn root(&self) -> &KeyError {
        match self {
            KeyError::Keystore { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), KeyError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), KeyError::AlreadyExists(_))
    }

    /// Stored data is unusable until an operator intervenes
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            KeyError::Corruption(_) | KeyError::UnsupportedFormat(_)
        )
    }
}

impl From<serde_json::Error> for KeyError {
    fn from(e: serde_json::Error) -> Self {
        KeyError::Encoding(e.to_string())
    }
}

/// Result type for key operations
pub type KeyResult<T> = Result<T, KeyError>;
