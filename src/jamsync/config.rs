use std::time::Duration;

/// Runtime knobs for the coordination engine. Every option comes from the
/// environment (milliseconds) and falls back to its default when unset or
/// unparsable. Nothing here is persisted.
#[derive(Clone, Debug)]
pub struct Config {
    /// Host silence before a disconnection is declared.
    pub host_timeout_ms: i64,
    /// Grace period after a host disconnection before the room expires.
    pub reconnection_window_ms: i64,
    /// Period of the health liveness scan.
    pub health_check_interval: Duration,
    /// Period of the inactivity sweeper.
    pub cleanup_interval: Duration,
    /// Per-connection inactivity close.
    pub client_idle_timeout: Duration,
    /// Outbound frames buffered per connection before it is dropped.
    pub max_outbound_backlog: usize,
}

const DEFAULT_HOST_TIMEOUT_MS: i64 = 600_000;
const DEFAULT_RECONNECTION_WINDOW_MS: i64 = 300_000;
const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 10_000;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CLIENT_IDLE_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_MAX_OUTBOUND_BACKLOG: usize = 256;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    dotenvy::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host_timeout_ms: env_parse("HOST_TIMEOUT_MS", DEFAULT_HOST_TIMEOUT_MS),
            reconnection_window_ms: env_parse(
                "RECONNECTION_WINDOW_MS",
                DEFAULT_RECONNECTION_WINDOW_MS,
            ),
            health_check_interval: Duration::from_millis(env_parse(
                "HEALTH_CHECK_INTERVAL_MS",
                DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            )),
            cleanup_interval: Duration::from_millis(env_parse(
                "CLEANUP_INTERVAL_MS",
                DEFAULT_CLEANUP_INTERVAL_MS,
            )),
            client_idle_timeout: Duration::from_millis(env_parse(
                "CLIENT_IDLE_TIMEOUT_MS",
                DEFAULT_CLIENT_IDLE_TIMEOUT_MS,
            )),
            max_outbound_backlog: env_parse("MAX_OUTBOUND_BACKLOG", DEFAULT_MAX_OUTBOUND_BACKLOG),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_timeout_ms: DEFAULT_HOST_TIMEOUT_MS,
            reconnection_window_ms: DEFAULT_RECONNECTION_WINDOW_MS,
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            cleanup_interval: Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS),
            client_idle_timeout: Duration::from_millis(DEFAULT_CLIENT_IDLE_TIMEOUT_MS),
            max_outbound_backlog: DEFAULT_MAX_OUTBOUND_BACKLOG,
        }
    }
}
