use config::{Config, File};
use ng_connectivity_error::NGResult;
use serde::{self, Deserialize};
use std::{ops::Deref, sync::Arc, time::Duration};

#[derive(Debug, Clone, Default)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Loads an optional TOML file overlaid with `NG__`-prefixed environment variables,
    /// e.g. `NG__CONNECTIVITY__CLIENT__CONNECTING_TIMEOUT_MS=30000`.
    pub fn new(config_path: String) -> NGResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path.as_str()).required(false))
            .add_source(
                config::Environment::with_prefix("NG")
                    .separator("__")
                    .try_parsing(true),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    pub fn from_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub connectivity: Connectivity,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Connectivity {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub acks: AcksConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub logs: ConnectionLogsConfig,
}

/// Lifecycle timeouts of the client actor.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClientConfig {
    /// Wait for a first command after start before acting on the desired status
    #[serde(default = "ClientConfig::init_timeout_ms_default")]
    pub init_timeout_ms: u64,
    #[serde(default = "ClientConfig::connecting_timeout_ms_default")]
    pub connecting_timeout_ms: u64,
    #[serde(default = "ClientConfig::disconnecting_timeout_ms_default")]
    pub disconnecting_timeout_ms: u64,
    #[serde(default = "ClientConfig::testing_timeout_ms_default")]
    pub testing_timeout_ms: u64,
    /// Raw TCP connect budget of the reachability pre-check
    #[serde(default = "ClientConfig::socket_check_timeout_ms_default")]
    pub socket_check_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            init_timeout_ms: ClientConfig::init_timeout_ms_default(),
            connecting_timeout_ms: ClientConfig::connecting_timeout_ms_default(),
            disconnecting_timeout_ms: ClientConfig::disconnecting_timeout_ms_default(),
            testing_timeout_ms: ClientConfig::testing_timeout_ms_default(),
            socket_check_timeout_ms: ClientConfig::socket_check_timeout_ms_default(),
        }
    }
}

impl ClientConfig {
    fn init_timeout_ms_default() -> u64 {
        5000
    }

    fn connecting_timeout_ms_default() -> u64 {
        60000
    }

    fn disconnecting_timeout_ms_default() -> u64 {
        10000
    }

    fn testing_timeout_ms_default() -> u64 {
        10000
    }

    fn socket_check_timeout_ms_default() -> u64 {
        2000
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_millis(self.connecting_timeout_ms)
    }

    pub fn disconnecting_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnecting_timeout_ms)
    }

    pub fn testing_timeout(&self) -> Duration {
        Duration::from_millis(self.testing_timeout_ms)
    }

    pub fn socket_check_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_check_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MappingConfig {
    /// Upper bound for every per-connection mapping pool
    #[serde(default = "MappingConfig::max_pool_size_default")]
    pub max_pool_size: usize,
    /// Bounded queue in front of each mapping worker
    #[serde(default = "MappingConfig::queue_capacity_default")]
    pub queue_capacity: usize,
    #[serde(default = "MappingConfig::max_header_bytes_default")]
    pub max_header_bytes: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        MappingConfig {
            max_pool_size: MappingConfig::max_pool_size_default(),
            queue_capacity: MappingConfig::queue_capacity_default(),
            max_header_bytes: MappingConfig::max_header_bytes_default(),
        }
    }
}

impl MappingConfig {
    fn max_pool_size_default() -> usize {
        5
    }

    fn queue_capacity_default() -> usize {
        1024
    }

    fn max_header_bytes_default() -> usize {
        5000
    }

    /// Effective pool size for a configured size.
    pub fn pool_size(&self, configured: usize) -> usize {
        configured.min(self.max_pool_size).max(1)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AcksConfig {
    /// Aggregation timeout when the signal carries no `timeout` header
    #[serde(default = "AcksConfig::default_timeout_ms_default")]
    pub default_timeout_ms: u64,
    #[serde(default = "AcksConfig::max_timeout_ms_default")]
    pub max_timeout_ms: u64,
    /// Settlement timeout of the per-message response collector
    #[serde(default = "AcksConfig::collector_timeout_ms_default")]
    pub collector_timeout_ms: u64,
}

impl Default for AcksConfig {
    fn default() -> Self {
        AcksConfig {
            default_timeout_ms: AcksConfig::default_timeout_ms_default(),
            max_timeout_ms: AcksConfig::max_timeout_ms_default(),
            collector_timeout_ms: AcksConfig::collector_timeout_ms_default(),
        }
    }
}

impl AcksConfig {
    fn default_timeout_ms_default() -> u64 {
        10000
    }

    fn max_timeout_ms_default() -> u64 {
        60000
    }

    fn collector_timeout_ms_default() -> u64 {
        60000
    }

    /// Requested timeout clamped to the configured maximum.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_millis(self.max_timeout_ms);
        requested
            .unwrap_or(Duration::from_millis(self.default_timeout_ms))
            .min(max)
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "SupervisorConfig::min_backoff_ms_default")]
    pub min_backoff_ms: u64,
    #[serde(default = "SupervisorConfig::max_backoff_ms_default")]
    pub max_backoff_ms: u64,
    /// Jitter factor is drawn from `[1, 1 + random_factor)`
    #[serde(default = "SupervisorConfig::random_factor_default")]
    pub random_factor: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            min_backoff_ms: SupervisorConfig::min_backoff_ms_default(),
            max_backoff_ms: SupervisorConfig::max_backoff_ms_default(),
            random_factor: SupervisorConfig::random_factor_default(),
        }
    }
}

impl SupervisorConfig {
    fn min_backoff_ms_default() -> u64 {
        1000
    }

    fn max_backoff_ms_default() -> u64 {
        600_000
    }

    fn random_factor_default() -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "EnrichmentConfig::cache_capacity_default")]
    pub cache_capacity: u64,
    #[serde(default = "EnrichmentConfig::cache_ttl_ms_default")]
    pub cache_ttl_ms: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        EnrichmentConfig {
            cache_capacity: EnrichmentConfig::cache_capacity_default(),
            cache_ttl_ms: EnrichmentConfig::cache_ttl_ms_default(),
        }
    }
}

impl EnrichmentConfig {
    fn cache_capacity_default() -> u64 {
        10_000
    }

    fn cache_ttl_ms_default() -> u64 {
        120_000
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConnectionLogsConfig {
    /// Entries kept per connection log
    #[serde(default = "ConnectionLogsConfig::capacity_default")]
    pub capacity: usize,
}

impl Default for ConnectionLogsConfig {
    fn default() -> Self {
        ConnectionLogsConfig {
            capacity: ConnectionLogsConfig::capacity_default(),
        }
    }
}

impl ConnectionLogsConfig {
    fn capacity_default() -> usize {
        100
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::level_default")]
    pub level: String,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default)]
    pub file_enabled: bool,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            level: Log::level_default(),
            dir: Log::dir_default(),
            file_enabled: false,
        }
    }
}

impl Log {
    fn level_default() -> String {
        "info".into()
    }

    fn dir_default() -> String {
        "./logs".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_file() {
        let settings = Settings::new("/nonexistent/ng-connectivity".to_string()).unwrap();
        assert_eq!(settings.connectivity.client.socket_check_timeout_ms, 2000);
        assert_eq!(settings.connectivity.mapping.pool_size(64), 5);
        assert_eq!(settings.connectivity.mapping.pool_size(0), 1);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = std::env::temp_dir().join(format!("ng-connectivity-settings-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[connectivity.acks]\ndefault_timeout_ms = 500\nmax_timeout_ms = 1000\n\n[connectivity.supervisor]\nrandom_factor = 0.5"
        )
        .unwrap();
        let settings = Settings::new(path.to_string_lossy().into_owned()).unwrap();
        let acks = settings.connectivity.acks;
        assert_eq!(acks.effective_timeout(None), Duration::from_millis(500));
        assert_eq!(acks.effective_timeout(Some(Duration::from_secs(5))), Duration::from_millis(1000));
        assert_eq!(settings.connectivity.supervisor.random_factor, 0.5);
        std::fs::remove_dir_all(&dir).ok();
    }
}
