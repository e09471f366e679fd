//! Configuration management for the security token service
//!
//! Values are layered: built-in defaults, then an optional TOML/YAML/JSON
//! file, then `STS_`-prefixed environment variables using `__` as the
//! nesting separator (`STS_KEYSTORE__PASSWORD`, `STS_KEYS__SECRET_KEYS__MIN_KEYS`).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Rotation policy for one kind of key (encryption pairs, signing pairs, secret keys)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RotationPolicyConfig {
    /// When disabled, keys are still minted on first use but never demoted
    pub enabled: bool,
    /// How long a new key stays ACTIVE, in milliseconds
    pub validity_interval_ms: u64,
    /// How long a demoted key stays LEGACY before it expires, in milliseconds
    pub legacy_interval_ms: u64,
    /// Minimum number of ACTIVE keys kept at all times
    pub min_keys: usize,
    /// Number of keys minted into a keystore that has none of this kind
    pub initial_count: usize,
    /// Key generation algorithm name, forwarded to the key generator
    pub algorithm: String,
    /// Signature algorithm, only meaningful for signing key pairs
    pub sig_algorithm: Option<String>,
    /// Key size in bits
    pub key_size: u32,
}

impl Default for RotationPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            validity_interval_ms: 3_600_000,
            legacy_interval_ms: 86_400_000,
            min_keys: 5,
            initial_count: 5,
            algorithm: "RSA".to_string(),
            sig_algorithm: None,
            key_size: 2048,
        }
    }
}

impl RotationPolicyConfig {
    pub fn validity_interval(&self) -> Duration {
        Duration::from_millis(self.validity_interval_ms)
    }

    pub fn legacy_interval(&self) -> Duration {
        Duration::from_millis(self.legacy_interval_ms)
    }

    fn validate(&self, kind: &str) -> Result<(), ConfigError> {
        if self.enabled && self.min_keys == 0 {
            return Err(ConfigError::Invalid(format!(
                "keys.{kind}.min_keys must be at least 1 when rotation is enabled"
            )));
        }
        if self.key_size == 0 {
            return Err(ConfigError::Invalid(format!("keys.{kind}.key_size must not be zero")));
        }
        if self.algorithm.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("keys.{kind}.algorithm must not be blank")));
        }
        Ok(())
    }
}

/// Keystore identity and protection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    pub name: String,
    pub password: String,
    /// Storage format tag written next to the sealed blob
    pub store_type: String,
    /// Prefix prepended to every generated key alias
    pub alias_prefix: String,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            name: "sts-keystore".to_string(),
            password: String::new(),
            store_type: "sts-sealed-v1".to_string(),
            alias_prefix: "sts-".to_string(),
        }
    }
}

/// Per-kind key settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub enc_key_pairs: RotationPolicyConfig,
    pub sign_key_pairs: RotationPolicyConfig,
    pub secret_keys: RotationPolicyConfig,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            enc_key_pairs: RotationPolicyConfig::default(),
            sign_key_pairs: RotationPolicyConfig {
                sig_algorithm: Some("SHA256withRSA".to_string()),
                ..RotationPolicyConfig::default()
            },
            secret_keys: RotationPolicyConfig {
                algorithm: "AES".to_string(),
                key_size: 256,
                ..RotationPolicyConfig::default()
            },
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    /// Sealed keystore documents in a directory tree
    #[default]
    Filesystem,
    /// SQLite tables
    Relational,
    /// Document collections
    Document,
}

/// Persistence settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// Directory (filesystem), table prefix scope (relational) or collection name (document)
    pub container_name: String,
    /// Filesystem root directory or SQLite database file
    pub path: String,
    /// Create the container on first use when it is missing
    pub auto_create: bool,
    /// Upper bound for a single backend call, in milliseconds
    pub io_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Filesystem,
            container_name: "sts-keystores".to_string(),
            path: "./data".to_string(),
            auto_create: true,
            io_timeout_ms: 5_000,
        }
    }
}

impl PersistenceConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `console`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Key management configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyManagementConfig {
    pub keystore: KeyStoreConfig,
    pub keys: KeysConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl KeyManagementConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        // Kind-specific defaults that differ from `RotationPolicyConfig::default`
        // must survive a partially specified `[keys.*]` table.
        let mut builder = config::Config::builder()
            .set_default("keys.secret_keys.algorithm", "AES")?
            .set_default("keys.secret_keys.key_size", 256)?
            .set_default("keys.sign_key_pairs.sig_algorithm", "SHA256withRSA")?;
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("STS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keystore.name.trim().is_empty() {
            return Err(ConfigError::Invalid("keystore.name must not be blank".to_string()));
        }
        if self.keystore.password.is_empty() {
            return Err(ConfigError::Invalid("keystore.password must be set".to_string()));
        }
        if self.persistence.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "persistence.io_timeout_ms must not be zero".to_string(),
            ));
        }
        self.keys.enc_key_pairs.validate("enc_key_pairs")?;
        self.keys.sign_key_pairs.validate("sign_key_pairs")?;
        self.keys.secret_keys.validate("secret_keys")?;
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        if self.logging.level.is_empty() {
            "info"
        } else {
            &self.logging.level
        }
    }
}
