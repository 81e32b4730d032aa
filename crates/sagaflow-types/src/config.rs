//! Engine configuration for sagaflow.
//!
//! `EngineConfig` is the `sagaflow.toml` file that bounds what any single
//! run may consume: parallel fan-out, event buffering and stored output size.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on concurrently running parallel branches, applied on top of
    /// the step and workflow limits.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Capacity of the per-run event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Timeout for steps when neither the step nor the workflow sets one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_step_timeout_ms: Option<u64>,

    /// Step outputs whose JSON encoding exceeds this many bytes are replaced
    /// by a truncation marker.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,
}

fn default_max_concurrency() -> usize {
    16
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_step_output_bytes() -> usize {
    1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            event_capacity: default_event_capacity(),
            default_step_timeout_ms: None,
            max_step_output_bytes: default_max_step_output_bytes(),
        }
    }
}
