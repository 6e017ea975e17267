use serde::Deserialize;
use std::time::Duration;

/// Top-level client configuration. Loaded from an optional TOML file and
/// overridden by environment variables (`SWARM_*`), mirroring the way
/// `ToolConfig`/`CacheConfig` compose defaults with file overrides.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub cas: CasConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub collection: CollectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            cas: CasConfig::default(),
            retry: RetryConfig::default(),
            collection: CollectionConfig::default(),
        }
    }
}

impl Config {
    /// Load from a YAML file, falling back to defaults for any field the
    /// file omits. A missing file is not an error — callers that only rely
    /// on environment variables never need one.
    pub fn from_file_or_default(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&text)?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SWARM_DISPATCHER_URL") {
            self.dispatcher.base_url = url;
        }
        if let Ok(n) = std::env::var("SWARM_MAX_PARALLEL_POLLS") {
            if let Ok(n) = n.parse() {
                self.collection.max_parallel_polls = n;
            }
        }
        if let Ok(n) = std::env::var("SWARM_CAS_CONCURRENCY") {
            if let Ok(n) = n.parse() {
                self.cas.transfer_concurrency = n;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub base_url: String,
    pub status_update_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            status_update_interval_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    pub transfer_concurrency: usize,
    pub local_root: Option<std::path::PathBuf>,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            transfer_concurrency: default_parallelism(),
            local_root: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 15_000,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub max_parallel_polls: usize,
    pub poll_interval_cap_secs: u64,
    pub poll_interval_growth_secs: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_parallel_polls: default_parallelism(),
            poll_interval_cap_secs: 15,
            poll_interval_growth_secs: 30,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_retry_bounds() {
        let config = Config::default();
        assert_eq!(config.retry.initial_delay(), Duration::from_secs(1));
        assert_eq!(config.retry.max_delay(), Duration::from_secs(15));
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = Config::from_file_or_default(Some(std::path::Path::new(
            "/nonexistent/swarm.toml",
        )))
        .unwrap();
        assert_eq!(config.dispatcher.base_url, "http://localhost:8080");
    }

    #[test]
    fn collection_defaults_match_spec_backoff_shape() {
        let config = Config::default();
        assert_eq!(config.collection.poll_interval_cap_secs, 15);
        assert_eq!(config.collection.poll_interval_growth_secs, 30);
    }
}
