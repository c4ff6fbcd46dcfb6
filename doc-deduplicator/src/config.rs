use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;

use crate::fingerprint;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Digest used for content fingerprints. Every replica must agree on
    // this, or a restart under a different algorithm re-accepts every
    // document once.
    #[envconfig(default = "sha-256")]
    pub fingerprint_algorithm: String,

    // Recency cache configuration
    #[envconfig(default = "100000")]
    pub cache_max_entries: u64,

    #[envconfig(default = "300")]
    pub cache_ttl_secs: u64,

    // Durable store configuration
    #[envconfig(default = "/tmp/doc-dedup-store")]
    pub store_path: String,

    // Bounded wait for a partition still replaying its change log before a
    // decision is surfaced as retryable
    #[envconfig(default = "10000")]
    pub recovery_wait_timeout_ms: u64,

    // Change log maintenance; 0 disables periodic compaction
    #[envconfig(default = "3600")]
    pub compaction_interval_secs: u64,

    // Cross-partition index (advisory, off by default)
    #[envconfig(default = "false")]
    pub cross_partition_index: bool,

    #[envconfig(default = "5000")]
    pub index_lag_tolerance_ms: u64,

    #[envconfig(default = "1024")]
    pub index_channel_capacity: usize,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "10")]
    pub readiness_refresh_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        fingerprint::for_algorithm(&self.fingerprint_algorithm)?;
        if self.cache_max_entries == 0 {
            anyhow::bail!("cache_max_entries must be positive");
        }
        if self.recovery_wait_timeout_ms == 0 {
            anyhow::bail!("recovery_wait_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn store_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.store_path)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn recovery_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_wait_timeout_ms)
    }

    pub fn compaction_interval(&self) -> Option<Duration> {
        (self.compaction_interval_secs > 0)
            .then(|| Duration::from_secs(self.compaction_interval_secs))
    }

    pub fn index_lag_tolerance(&self) -> Duration {
        Duration::from_millis(self.index_lag_tolerance_ms)
    }

    pub fn readiness_refresh(&self) -> Duration {
        Duration::from_secs(self.readiness_refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.fingerprint_algorithm, "sha-256");
        assert!(!config.cross_partition_index);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.recovery_wait_timeout(), Duration::from_secs(10));
        assert_eq!(config.compaction_interval(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn unknown_fingerprint_algorithm_fails_validation() {
        let mut env = HashMap::new();
        env.insert(
            "FINGERPRINT_ALGORITHM".to_string(),
            "crc32".to_string(),
        );
        let config = Config::init_from_hashmap(&env).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_compaction_interval_disables_the_task() {
        let mut env = HashMap::new();
        env.insert("COMPACTION_INTERVAL_SECS".to_string(), "0".to_string());
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.compaction_interval(), None);
    }
}
