use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL, e.g. redis://localhost:6379/0
    pub url: String,
    /// Prefix applied to every cache key (default: "gtfsrt")
    #[serde(default = "RedisConfig::default_key_prefix")]
    pub key_prefix: String,
}

impl RedisConfig {
    fn default_key_prefix() -> String {
        "gtfsrt".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL for the static GTFS reference schema
    pub url: String,
    /// Schema holding the GTFS tables (default: "gtfs")
    #[serde(default = "DatabaseConfig::default_schema")]
    pub schema: String,
}

impl DatabaseConfig {
    fn default_schema() -> String {
        "gtfs".to_string()
    }
}

/// GTFS-RT feed endpoints. A feed left unset is simply not polled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedsConfig {
    #[serde(default)]
    pub vehicle_positions_url: Option<String>,
    #[serde(default)]
    pub trip_updates_url: Option<String>,
    #[serde(default)]
    pub alerts_url: Option<String>,
}

impl FeedsConfig {
    pub fn any_configured(&self) -> bool {
        self.vehicle_positions_url.is_some()
            || self.trip_updates_url.is_some()
            || self.alerts_url.is_some()
    }
}

/// Ingestion loop tuning
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Seconds between poll cycles (default: 15)
    #[serde(default = "IngestConfig::default_refresh_secs")]
    pub refresh_secs: u64,
    /// TTL of the writer lock in seconds (default: 45).
    /// Bounds worst-case downtime after a writer crash.
    #[serde(default = "IngestConfig::default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Per-request HTTP timeout in seconds (default: 8)
    #[serde(default = "IngestConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// User agent sent with feed requests
    #[serde(default = "IngestConfig::default_user_agent")]
    pub user_agent: String,
    /// Expected max age of the vehicle positions feed in seconds, used for
    /// staleness reporting on the read side (default: 60)
    #[serde(default = "IngestConfig::default_vehicle_staleness_secs")]
    pub vehicle_positions_staleness_secs: i64,
    /// Expected max age of the trip updates feed in seconds (default: 90)
    #[serde(default = "IngestConfig::default_trip_staleness_secs")]
    pub trip_updates_staleness_secs: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            refresh_secs: Self::default_refresh_secs(),
            lock_ttl_secs: Self::default_lock_ttl_secs(),
            request_timeout_secs: Self::default_request_timeout_secs(),
            user_agent: Self::default_user_agent(),
            vehicle_positions_staleness_secs: Self::default_vehicle_staleness_secs(),
            trip_updates_staleness_secs: Self::default_trip_staleness_secs(),
        }
    }
}

impl IngestConfig {
    fn default_refresh_secs() -> u64 {
        15
    }
    fn default_lock_ttl_secs() -> u64 {
        45
    }
    fn default_request_timeout_secs() -> u64 {
        8
    }
    fn default_user_agent() -> String {
        "busboard-ingestor/0.2".to_string()
    }
    fn default_vehicle_staleness_secs() -> i64 {
        60
    }
    fn default_trip_staleness_secs() -> i64 {
        90
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_defaults() {
        let ingest = IngestConfig::default();
        assert_eq!(ingest.refresh_secs, 15);
        assert_eq!(ingest.lock_ttl_secs, 45);
        assert_eq!(ingest.request_timeout_secs, 8);
        assert_eq!(ingest.vehicle_positions_staleness_secs, 60);
        assert_eq!(ingest.trip_updates_staleness_secs, 90);
    }

    #[test]
    fn parse_minimal_config() {
        let yaml = r#"
redis:
  url: redis://localhost:6379/0
database:
  url: postgres://localhost/gtfs
feeds:
  vehicle_positions_url: https://example.com/vp.pb
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.redis.key_prefix, "gtfsrt");
        assert_eq!(config.database.schema, "gtfs");
        assert!(config.feeds.any_configured());
        assert!(config.feeds.trip_updates_url.is_none());
        assert_eq!(config.ingest.refresh_secs, 15);
    }

    #[test]
    fn no_feeds_configured() {
        let feeds = FeedsConfig::default();
        assert!(!feeds.any_configured());
    }
}
