//! Client tunables.
//!
//! Every timing knob of the session runtime lives in [`ClientConfig`]; the
//! defaults match the station protocol. [`ClientConfig::from_env`] lets a
//! deployment override individual values without recompiling.

use std::time::Duration;

use anyhow::Context;

/// How long a handshake may stay unanswered before it is re-sent (30 seconds).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Minimum gap between two identical meta/document/member queries (10 minutes).
pub const DEFAULT_QUERY_COOLDOWN: Duration = Duration::from_secs(600);
/// Login broadcast period while running (5 minutes).
pub const DEFAULT_KEEP_ONLINE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub handshake_timeout: Duration,
    pub query_cooldown: Duration,
    /// Runner sleep after an iteration that moved data.
    pub busy_interval: Duration,
    /// Runner sleep after an idle iteration.
    pub idle_interval: Duration,
    /// Failed pushes tolerated before a shipment is dropped.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Age after which a queued shipment is purged as undeliverable.
    pub shipment_expiry: Duration,
    pub keep_online_interval: Duration,
    /// Grace period given to the offline/online report around pause/resume.
    pub background_report_delay: Duration,
    /// Tracked delivery statuses before half of them are evicted.
    pub delivery_cache_capacity: usize,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            query_cooldown: DEFAULT_QUERY_COOLDOWN,
            busy_interval: Duration::from_millis(16),
            idle_interval: Duration::from_millis(256),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            shipment_expiry: Duration::from_secs(600),
            keep_online_interval: DEFAULT_KEEP_ONLINE_INTERVAL,
            background_report_delay: Duration::from_millis(512),
            delivery_cache_capacity: 1024,
            user_agent: default_user_agent(),
        }
    }
}

impl ClientConfig {
    /// Defaults, overridden by any of:
    /// - `HANDSHAKE_TIMEOUT_MS`
    /// - `QUERY_COOLDOWN_MS`
    /// - `MAX_RETRIES`
    /// - `SHIPMENT_EXPIRY_MS`
    /// - `KEEP_ONLINE_INTERVAL_MS`
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = env_number("HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("QUERY_COOLDOWN_MS")? {
            config.query_cooldown = Duration::from_millis(ms);
        }
        if let Some(retries) = env_number("MAX_RETRIES")? {
            config.max_retries =
                u32::try_from(retries).context("MAX_RETRIES does not fit in u32")?;
        }
        if let Some(ms) = env_number("SHIPMENT_EXPIRY_MS")? {
            config.shipment_expiry = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("KEEP_ONLINE_INTERVAL_MS")? {
            config.keep_online_interval = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

/// Where the station lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StationConfig {
    pub host: String,
    pub port: u16,
}

impl StationConfig {
    /// Requires `STATION_HOST` and `STATION_PORT`.
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("STATION_HOST").context("STATION_HOST is not set")?;
        let port = std::env::var("STATION_PORT").context("STATION_PORT is not set")?;
        let port = port
            .parse::<u16>()
            .context(format!("Failed to parse station port: {port}"))?;
        Ok(Self { host, port })
    }
}

fn env_number(name: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .context(format!("Failed to parse {name}: {value}")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).context(format!("{name} is not valid unicode")),
    }
}

fn default_user_agent() -> String {
    format!(
        "DIMP/1.0 ({}; U; {}) StationClient/{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_millis(30_000));
        assert_eq!(config.keep_online_interval, Duration::from_secs(300));
        assert!(config.idle_interval > config.busy_interval);
        assert!(config.user_agent.starts_with("DIMP/1.0 ("));
    }

    #[test]
    fn test_env_number_rejects_garbage() {
        std::env::set_var("STATION_CLIENT_TEST_NUMBER", "12x");
        assert!(env_number("STATION_CLIENT_TEST_NUMBER").is_err());
        std::env::set_var("STATION_CLIENT_TEST_NUMBER", " 42 ");
        assert_eq!(
            env_number("STATION_CLIENT_TEST_NUMBER").expect("Failed to parse"),
            Some(42)
        );
        std::env::remove_var("STATION_CLIENT_TEST_NUMBER");
        assert_eq!(
            env_number("STATION_CLIENT_TEST_NUMBER").expect("Failed to parse"),
            None
        );
    }
}
