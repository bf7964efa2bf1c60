//! Orchestrator-wide configuration, loaded from the environment the way the
//! rest of the ambient stack does (no config-file format is imposed).

use std::time::Duration;

/// Tunables for `PipelineOps`. Every field has a sensible default so hosts
/// can override only what they need.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on how long `stop_pipeline`/`stop_node` wait for
    /// in-flight work to wind down before giving up (§4.F).
    pub stop_wait_timeout: Duration,
    /// Poll interval while waiting for inactivation; capped at
    /// `stop_wait_timeout / 4` by `PipelineOps` regardless of this value.
    pub stop_poll_interval: Duration,
    /// DSN passed to `SqliteMetadataStore::connect`.
    pub metadata_dsn: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stop_wait_timeout: Duration::from_secs(60),
            stop_poll_interval: Duration::from_secs(10),
            metadata_dsn: "sqlite::memory:".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Reads overrides from `PIPELINE_ORCHESTRATOR_*` environment
    /// variables, falling back to defaults for anything unset or
    /// unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("PIPELINE_ORCHESTRATOR_STOP_WAIT_TIMEOUT_SECS") {
            if let Ok(secs) = raw.parse() {
                config.stop_wait_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(raw) = std::env::var("PIPELINE_ORCHESTRATOR_STOP_POLL_INTERVAL_SECS") {
            if let Ok(secs) = raw.parse() {
                config.stop_poll_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(dsn) = std::env::var("PIPELINE_ORCHESTRATOR_METADATA_DSN") {
            config.metadata_dsn = dsn;
        }

        config
    }

    /// The interval actually used while polling: never more than a quarter
    /// of the overall timeout, and never more than `stop_poll_interval`.
    pub fn effective_poll_interval(&self) -> Duration {
        std::cmp::min(self.stop_poll_interval, self.stop_wait_timeout / 4)
    }
}
