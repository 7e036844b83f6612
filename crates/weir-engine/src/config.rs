use std::time::Duration;

use weir_content::ContentConfig;
use weir_repo::RepoConfig;

/// Top-level engine configuration, aggregating the per-component configs.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Content store settings.
    pub content: ContentConfig,
    /// Record repository settings.
    pub repo: RepoConfig,
    /// How long a committing session waits for a congested destination
    /// queue before the commit fails with backpressure (default: 10 s).
    pub backpressure_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            content: ContentConfig::default(),
            repo: RepoConfig::default(),
            backpressure_timeout: Duration::from_secs(10),
        }
    }
}
