//! WolfStream Configuration
//!
//! Configuration structures for a replication node. The injected drivers
//! (WAL source, table catalog, leader clients) are constructor arguments
//! on the replication types, not file configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Main WolfStream configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Cluster replication configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of partitions data shards into
    #[serde(default = "default_num_partitions")]
    pub num_partitions: u32,

    /// Partition this node is assigned (follower role)
    #[serde(default)]
    pub partition: u32,

    /// Stream this node follows
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Leader addresses to follow
    #[serde(default)]
    pub leaders: Vec<String>,

    /// Maximum replay age in seconds when following a leader (0 = unlimited)
    #[serde(default)]
    pub max_follow_age_secs: u64,

    /// Parallel remote-query workers per leader (feed role)
    #[serde(default = "default_cluster_query_concurrency")]
    pub cluster_query_concurrency: usize,

    /// Per-follower delivery queue capacity
    #[serde(default = "default_follower_queue_capacity")]
    pub follower_queue_capacity: usize,

    /// Entry mapping workers (0 = derive from CPU count)
    #[serde(default)]
    pub map_parallelism: usize,

    /// Interval between follower throughput/queue-depth reports, in seconds
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_num_partitions() -> u32 {
    1
}

fn default_stream() -> String {
    "default".to_string()
}

fn default_cluster_query_concurrency() -> usize {
    25
}

fn default_follower_queue_capacity() -> usize {
    1_000_000
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_partitions: default_num_partitions(),
            partition: 0,
            stream: default_stream(),
            leaders: Vec::new(),
            max_follow_age_secs: 0,
            cluster_query_concurrency: default_cluster_query_concurrency(),
            follower_queue_capacity: default_follower_queue_capacity(),
            map_parallelism: 0,
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ClusterConfig {
    /// Maximum replay age as a Duration, if limited
    pub fn max_follow_age(&self) -> Option<Duration> {
        if self.max_follow_age_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_follow_age_secs))
        }
    }

    /// Mapping parallelism, falling back to hardware detection
    pub fn effective_map_parallelism(&self) -> usize {
        if self.map_parallelism > 0 {
            self.map_parallelism
        } else {
            crate::tuning::map_parallelism()
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.cluster.num_partitions == 0 {
            return Err(crate::Error::Config(
                "cluster.num_partitions must be at least 1".into(),
            ));
        }

        if self.cluster.partition >= self.cluster.num_partitions {
            return Err(crate::Error::Config(format!(
                "cluster.partition {} out of range for {} partitions",
                self.cluster.partition, self.cluster.num_partitions
            )));
        }

        if self.cluster.follower_queue_capacity == 0 {
            return Err(crate::Error::Config(
                "cluster.follower_queue_capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Initialize global logging from configuration
pub fn init_logging(config: &LoggingConfig) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let result = match config.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    result.map_err(|e| crate::Error::Config(format!("unable to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config() {
        let toml = r#"
[cluster]
num_partitions = 4
partition = 1
stream = "inserts"
leaders = ["leader-1:7654", "leader-2:7654"]
max_follow_age_secs = 3600

[logging]
level = "debug"
"#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.cluster.num_partitions, 4);
        assert_eq!(config.cluster.partition, 1);
        assert_eq!(config.cluster.leaders.len(), 2);
        assert_eq!(
            config.cluster.max_follow_age(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.cluster.num_partitions, 1);
        assert_eq!(config.cluster.stream, "default");
        assert_eq!(config.cluster.max_follow_age(), None);
        assert_eq!(config.cluster.follower_queue_capacity, 1_000_000);
        assert_eq!(config.cluster.cluster_query_concurrency, 25);
        assert!(config.cluster.effective_map_parallelism() >= 1);
    }

    #[test]
    fn rejects_partition_out_of_range() {
        let toml = r#"
[cluster]
num_partitions = 2
partition = 2
"#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn rejects_zero_partitions() {
        let toml = r#"
[cluster]
num_partitions = 0
"#;
        assert!(Config::from_str(toml).is_err());
    }
}
