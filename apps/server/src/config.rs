use std::time::Duration;

/// Chat server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem location of the SQLite history database.
    pub database_path: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Exact-match origins allowed to upgrade to a WebSocket.
    pub origin_allow_list: Vec<String>,
    /// Rows older than this are removed by the retention sweep.
    pub history_retention_ttl: Duration,
    /// Per room, only this many newest rows are retained.
    pub history_per_room_cap: u32,
    /// Number of messages loaded on an initial join.
    pub initial_history_limit: u32,
    /// Token-bucket burst capacity per user.
    pub rate_limit_capacity: f64,
    /// Token-bucket refill rate per user, tokens per second.
    pub rate_limit_refill_per_second: f64,
    /// Typing marks expire after this long without a refresh.
    pub typing_idle_timeout: Duration,
    /// Maximum message length in characters, after trimming.
    pub message_max_chars: usize,
    /// Maximum display-name length in characters, after trimming.
    pub display_name_max_chars: usize,
    /// Interval between retention sweeps.
    pub sweep_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            database_path: required_var("PARLOR_DATABASE_PATH"),
            port: parsed_var("PARLOR_PORT", 4010),
            origin_allow_list: required_var("PARLOR_ORIGIN_ALLOW_LIST")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            history_retention_ttl: Duration::from_secs(parsed_var(
                "PARLOR_HISTORY_RETENTION_TTL_SECS",
                86_400,
            )),
            history_per_room_cap: parsed_var("PARLOR_HISTORY_PER_ROOM_CAP", 500),
            initial_history_limit: parsed_var("PARLOR_INITIAL_HISTORY_LIMIT", 100),
            rate_limit_capacity: parsed_var("PARLOR_RATE_LIMIT_CAPACITY", 10.0),
            rate_limit_refill_per_second: parsed_var("PARLOR_RATE_LIMIT_REFILL_PER_SECOND", 3.0),
            typing_idle_timeout: Duration::from_secs(parsed_var(
                "PARLOR_TYPING_IDLE_TIMEOUT_SECS",
                3,
            )),
            message_max_chars: parsed_var("PARLOR_MESSAGE_MAX_CHARS", 2000),
            display_name_max_chars: parsed_var("PARLOR_DISPLAY_NAME_MAX_CHARS", 50),
            sweep_interval: Duration::from_secs(parsed_var("PARLOR_SWEEP_INTERVAL_SECS", 60)),
        }
    }

    /// Defaults suitable for tests: in-process values, no env lookups.
    pub fn for_tests(database_path: String) -> Self {
        Self {
            database_path,
            port: 0,
            origin_allow_list: vec!["http://localhost:5173".to_string()],
            history_retention_ttl: Duration::from_secs(86_400),
            history_per_room_cap: 500,
            initial_history_limit: 100,
            rate_limit_capacity: 10.0,
            rate_limit_refill_per_second: 3.0,
            typing_idle_timeout: Duration::from_secs(3),
            message_max_chars: 2000,
            display_name_max_chars: 50,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
