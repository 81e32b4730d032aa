//! Engine configuration loading.

use std::path::Path;

use anyhow::{Context, Result};
use sagaflow_types::config::EngineConfig;

/// Load the engine configuration.
///
/// With no path the defaults are used. An explicit path must exist and parse;
/// keys it omits keep their defaults.
pub async fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        tracing::debug!("no engine config given, using defaults");
        return Ok(EngineConfig::default());
    };

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    tracing::debug!(path = %path.display(), ?config, "engine config loaded");
    Ok(config)
}
