/// Configuration management
use crate::conversation_store::DEFAULT_LEDGER_CAPACITY;
use crate::error::{Result, SyncError};
use crate::messenger_types::ParticipantId;
use crate::realtime::connection::{ConnectionConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONNECT_DELAY};
use std::time::Duration;

/// Session configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server base address; the socket endpoint is derived from it
    pub base_url: String,

    /// Session credential
    pub token: Option<String>,

    /// Signed-in user, used for computed unread counts
    pub user_id: Option<ParticipantId>,

    /// Ping interval while the socket is open
    pub heartbeat_interval: Duration,

    /// Delay before the single reconnect attempt after an unexpected close
    pub reconnect_delay: Duration,

    /// Socket construction and HTTP request timeout
    pub connect_timeout: Duration,

    /// Capacity of the processed message id ledger
    pub ledger_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            token: None,
            user_id: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: Duration::from_secs(10),
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 && std::env::var("MATCHLINK_BASE_URL").is_err() {
            return Err(SyncError::Config(format!(
                "Usage: {} <base-url> [--token <token>] [--user-id <id>] [--heartbeat-secs <n>] [--reconnect-secs <n>]",
                args.first().map(String::as_str).unwrap_or("core")
            )));
        }

        let mut config = Self::default();
        let mut base_url: Option<String> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--token" => {
                    config.token = Some(flag_value(args, i, "--token")?.to_string());
                    i += 2;
                }
                "--user-id" => {
                    config.user_id = Some(parse_user_id(flag_value(args, i, "--user-id")?));
                    i += 2;
                }
                "--heartbeat-secs" => {
                    config.heartbeat_interval = parse_secs(flag_value(args, i, "--heartbeat-secs")?, "--heartbeat-secs")?;
                    i += 2;
                }
                "--reconnect-secs" => {
                    config.reconnect_delay = parse_secs(flag_value(args, i, "--reconnect-secs")?, "--reconnect-secs")?;
                    i += 2;
                }
                other if other.starts_with("--") => {
                    return Err(SyncError::Config(format!("Unknown flag: {}", other)));
                }
                other => {
                    base_url = Some(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("MATCHLINK_BASE_URL") {
            base_url = Some(url);
        }
        if let Ok(token) = std::env::var("MATCHLINK_TOKEN") {
            config.token = Some(token);
        }
        if let Ok(user) = std::env::var("MATCHLINK_USER_ID") {
            config.user_id = Some(parse_user_id(&user));
        }

        if let Some(url) = base_url {
            config.base_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| self.base_url.starts_with(scheme));
        if !scheme_ok {
            return Err(SyncError::Config(format!(
                "Base URL must start with http(s):// or ws(s)://, got {}",
                self.base_url
            )));
        }
        if self.heartbeat_interval.is_zero() || self.reconnect_delay.is_zero() {
            return Err(SyncError::Config("Intervals must be at least one second".to_string()));
        }
        Ok(())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            base_url: self.base_url.clone(),
            heartbeat_interval: self.heartbeat_interval,
            reconnect_delay: self.reconnect_delay,
        }
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| SyncError::Config(format!("{} requires an argument", flag)))
}

fn parse_secs(value: &str, flag: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| SyncError::Config(format!("{} must be a whole number of seconds", flag)))
}

fn parse_user_id(value: &str) -> ParticipantId {
    match value.parse::<i64>() {
        Ok(n) => ParticipantId::Number(n),
        Err(_) => ParticipantId::Text(value.to_string()),
    }
}
