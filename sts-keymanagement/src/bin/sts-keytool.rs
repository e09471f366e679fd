//! Keystore maintenance tool
//!
//! Usage:
//!   sts-keytool [CONFIG_FILE]
//!
//! Initializes the configured keystore if needed, runs one rotation pass and
//! prints the resulting entries. Settings come from the optional file and
//! `STS_*` environment variables.

use anyhow::Result;
use std::path::PathBuf;
use sts_config::KeyManagementConfig;
use sts_keymanagement::{init_key_store_service, KeyUsage};
use sts_logging::LogFormat;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    // Load configuration
    let config = KeyManagementConfig::load(config_path.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    sts_logging::init(
        "sts-keytool",
        config.log_level(),
        LogFormat::from_name(&config.logging.format),
    );

    let name = config.keystore.name.clone();
    info!(keystore = %name, backend = ?config.persistence.backend, "Configuration loaded");

    let service = init_key_store_service(&config)
        .map_err(|e| anyhow::anyhow!("Failed to open keystore repository: {}", e))?;

    service
        .get_or_initialize(&name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize keystore: {}", e))?;
    let store = service
        .refresh(&name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to rotate keystore: {}", e))?;

    println!("Keystore {} ({})", store.name(), store.store_type());
    println!("Last update: {}", store.last_update().to_rfc3339());
    println!("{}", "=".repeat(50));

    for usage in KeyUsage::ALL {
        let entries = store.entries_for(usage);
        println!();
        println!("{} ({} entries)", usage, entries.len());
        for entry in entries {
            let attrs = entry.attributes();
            println!(
                "  {:<8} {}  created {}  not after {}",
                attrs.state.as_str(),
                attrs.alias,
                attrs
                    .created_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
                attrs
                    .not_after
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
    }

    Ok(())
}
