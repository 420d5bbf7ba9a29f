//! Loading `relaybus.toml`.

use std::path::Path;

use relaybus_types::config::BusConfig;

/// Load bus configuration from a TOML file.
///
/// A missing, unreadable or malformed file falls back to
/// [`BusConfig::default`]. Missing keys take their per-field defaults.
pub async fn load_bus_config(path: &Path) -> BusConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No bus config at {}, using defaults", path.display());
            return BusConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return BusConfig::default();
        }
    };

    match toml::from_str::<BusConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            BusConfig::default()
        }
    }
}
