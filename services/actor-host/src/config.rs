//! Configuration for the actor host.

use std::time::Duration;

use anyhow::{Context, Result};

/// Host process configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory holding the SQLite database and per-actor databases.
    pub data_dir: String,

    /// Address the line transport listens on.
    pub listen_addr: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Defaults applied to every registered actor definition.
    pub instance: InstanceOptions,
}

impl HostConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir =
            std::env::var("EMBER_DATA_DIR").unwrap_or_else(|_| "/var/lib/ember".to_string());

        let listen_addr =
            std::env::var("EMBER_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:7420".to_string());

        let log_level = std::env::var("EMBER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let instance = InstanceOptions::default().with_env_overrides()?;

        Ok(Self {
            data_dir,
            listen_addr,
            log_level,
            instance,
        })
    }
}

/// Per-actor timeouts and behavior switches.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceOptions {
    pub create_state_timeout: Duration,
    pub create_conn_state_timeout: Duration,
    pub on_connect_timeout: Duration,
    pub on_stop_timeout: Duration,
    pub action_timeout: Duration,
    /// Upper bound on waiting for background work when stopping.
    pub wait_until_timeout: Duration,
    /// Minimum spacing between throttled state writes.
    pub state_save_interval: Duration,
    /// How long a non-connected connection survives before it is pruned.
    pub connection_liveness_timeout: Duration,
    pub connection_liveness_interval: Duration,
    /// Idle time before an eligible actor goes to sleep.
    pub sleep_timeout: Duration,
    pub no_sleep: bool,
    pub max_incoming_message_size: usize,
    /// Upper bound on waiting for transports to confirm a disconnect.
    pub disconnect_ceiling: Duration,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            create_state_timeout: Duration::from_secs(5),
            create_conn_state_timeout: Duration::from_secs(5),
            on_connect_timeout: Duration::from_secs(5),
            on_stop_timeout: Duration::from_secs(5),
            action_timeout: Duration::from_secs(60),
            wait_until_timeout: Duration::from_secs(15),
            state_save_interval: Duration::from_secs(10),
            connection_liveness_timeout: Duration::from_millis(2_500),
            connection_liveness_interval: Duration::from_secs(5),
            sleep_timeout: Duration::from_secs(30),
            no_sleep: false,
            max_incoming_message_size: 64 * 1024,
            disconnect_ceiling: Duration::from_millis(1_500),
        }
    }
}

impl InstanceOptions {
    /// Applies `EMBER_*` overrides on top of these options.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(ms) = env_u64("EMBER_ACTION_TIMEOUT_MS")? {
            self.action_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("EMBER_STATE_SAVE_INTERVAL_MS")? {
            self.state_save_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("EMBER_SLEEP_TIMEOUT_MS")? {
            self.sleep_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("EMBER_CONN_LIVENESS_TIMEOUT_MS")? {
            self.connection_liveness_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("EMBER_CONN_LIVENESS_INTERVAL_MS")? {
            self.connection_liveness_interval = Duration::from_millis(ms);
        }
        if let Some(size) = env_u64("EMBER_MAX_MESSAGE_SIZE")? {
            self.max_incoming_message_size = usize::try_from(size)
                .context("EMBER_MAX_MESSAGE_SIZE does not fit in usize")?;
        }
        if let Ok(raw) = std::env::var("EMBER_NO_SLEEP") {
            self.no_sleep = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        Ok(self)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("{key} must be an integer, got '{raw}'")),
        Err(_) => Ok(None),
    }
}
