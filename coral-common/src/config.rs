//! Typed configuration snapshot consumed by the proxy engine.
//!
//! File parsing and command-line handling live outside the core; whatever loads the
//! configuration hands the engine one of these snapshots.

use serde::Deserialize;

use crate::error::{ProxyError, ProxyResult};

/// Log verbosity accepted by the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Everything, including per-message traces.
    Debug,
    /// Normal operation events.
    #[default]
    Info,
    /// Degraded-but-running conditions.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Parses the textual level used by config files.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns the `tracing` filter directive for this level.
    #[must_use]
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Backend-cluster section of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Comma-separated seed list of backend addresses (`host:port,host:port`).
    pub servers: String,
    /// Password used both for client AUTH and backend connection preludes.
    pub password: String,
    /// Route every command to masters, never to replicas.
    pub disable_slave: bool,
    /// Dial every known backend eagerly at boot.
    pub preconnect: bool,
    /// Maximum request/response frame length in bytes.
    pub msg_max_length_limit: usize,
    /// Backend connect timeout in milliseconds.
    pub conn_timeout: u64,
    /// Per-request timeout in milliseconds; zero disables the sweep.
    pub timeout: u64,
    /// Base backoff in milliseconds for banning an unreachable backend.
    pub server_retry_timeout: u64,
    /// Connections kept per backend node; pipelining makes one the best practice.
    pub server_connections: usize,
    /// Threshold in milliseconds for slow-request warnings; zero disables.
    pub slowlog_slower_than: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            servers: String::new(),
            password: String::new(),
            disable_slave: false,
            preconnect: false,
            msg_max_length_limit: 6 * 1024 * 1024,
            conn_timeout: 200,
            timeout: 1000,
            server_retry_timeout: 1000,
            server_connections: 1,
            slowlog_slower_than: 0,
        }
    }
}

/// Full configuration snapshot for one proxy process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// RESP listener port.
    pub port: u16,
    /// Optional HTTP sidecar port; zero means disabled.
    pub web_port: u16,
    /// Log file directory used by the external log writer.
    pub log_path: String,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// Days of log retention honored by the external rotator.
    pub log_expire_day: u32,
    /// Backend cluster section.
    pub redis: RedisConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 6380,
            web_port: 0,
            log_path: String::new(),
            log_level: LogLevel::Info,
            log_expire_day: 7,
            redis: RedisConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Validates the snapshot before the engine boots from it.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidConfig` when the seed list is empty or a numeric
    /// field is out of its usable range.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.redis.servers.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "redis.servers must list at least one seed address",
            ));
        }
        if self.redis.msg_max_length_limit == 0 {
            return Err(ProxyError::InvalidConfig(
                "redis.msg_max_length_limit must be positive",
            ));
        }
        Ok(())
    }

    /// Splits the seed list into individual addresses, dropping empty entries.
    #[must_use]
    pub fn seed_addrs(&self) -> Vec<String> {
        self.redis
            .servers
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{LogLevel, ProxyConfig};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn defaults_match_documented_limits() {
        let config = ProxyConfig::default();
        assert_that!(config.redis.msg_max_length_limit, eq(6 * 1024 * 1024));
        assert_that!(config.redis.conn_timeout, eq(200));
        assert_that!(config.redis.server_connections, eq(1));
    }

    #[rstest]
    fn validate_rejects_empty_seed_list() {
        let config = ProxyConfig::default();
        assert_that!(config.validate().is_err(), eq(true));
    }

    #[rstest]
    fn seed_addrs_splits_and_trims() {
        let mut config = ProxyConfig::default();
        config.redis.servers = "127.0.0.1:7000, 127.0.0.1:7001,".to_owned();
        assert_that!(
            config.seed_addrs(),
            eq(&vec![
                "127.0.0.1:7000".to_owned(),
                "127.0.0.1:7001".to_owned()
            ])
        );
    }

    #[rstest]
    #[case("DEBUG", Some(LogLevel::Debug))]
    #[case("ERROR", Some(LogLevel::Error))]
    #[case("verbose", None)]
    fn log_level_parse_accepts_known_names(#[case] input: &str, #[case] expect: Option<LogLevel>) {
        assert_that!(LogLevel::parse(input), eq(expect));
    }
}
