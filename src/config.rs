//! Configuration management
//!
//! All settings come from `BRIDGE_*` environment variables with
//! documented defaults. The loaded `Config` is an immutable snapshot;
//! components hold a shared reference and never observe mid-operation
//! changes.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// OneBot WebSocket endpoint to dial (e.g. NapCat reverse-WS)
    pub gateway_url: String,

    /// The bot's own account id, used for mention detection
    pub self_id: u64,

    /// Handshake bound for the initial connect
    pub connect_timeout: Duration,

    /// Reconnect backoff: starting delay
    pub reconnect_initial: Duration,

    /// Reconnect backoff: delay cap
    pub reconnect_max: Duration,

    /// Reconnect attempts before giving up (0 = retry forever)
    pub max_reconnects: u32,

    /// Reply to private messages without requiring a command prefix
    pub auto_reply_private: bool,

    /// Drop private messages from temporary (non-friend) sessions
    pub ignore_temp_session: bool,

    /// Command prefixes, sorted longest-first at load time
    pub command_prefixes: Vec<String>,

    /// Claude CLI command (name or path)
    pub cli_path: String,

    /// Root under which per-session working directories are created
    pub work_dir: PathBuf,

    /// Hard wall-clock timeout for one CLI invocation
    pub invoke_timeout: Duration,

    /// Global cap on concurrently running CLI invocations
    pub max_concurrent: usize,

    /// Per-session cap on requests waiting for the invocation lock
    pub session_backlog: usize,

    /// Idle duration after which a session may be evicted
    pub session_ttl: Duration,

    /// Period of the idle-eviction timer
    pub evict_interval: Duration,

    /// Append a cost suffix to successful replies
    pub cost_suffix: bool,

    /// Maximum characters per outbound message segment
    pub max_message_len: usize,

    /// Pause between consecutive segments of one long reply
    pub segment_delay: Duration,

    /// Send a "thinking" notice before invoking the CLI
    pub thinking_notice: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has invalid value: {}", key, v)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let gateway_url = env_or("BRIDGE_GATEWAY_URL", "ws://127.0.0.1:8081");

        let self_id: u64 = std::env::var("BRIDGE_SELF_ID")
            .context("BRIDGE_SELF_ID is required (the bot's own QQ number)")?
            .parse()
            .context("BRIDGE_SELF_ID must be numeric")?;

        let mut command_prefixes: Vec<String> =
            env_or("BRIDGE_COMMAND_PREFIXES", "/c,/claude,/ask")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        // Longest-prefix-first so "/claude" is never shadowed by "/c"
        command_prefixes.sort_by(|a, b| b.len().cmp(&a.len()));

        let config = Self {
            gateway_url,
            self_id,
            connect_timeout: Duration::from_secs(env_parse("BRIDGE_CONNECT_TIMEOUT_SECS", 30u64)?),
            reconnect_initial: Duration::from_millis(env_parse(
                "BRIDGE_RECONNECT_INITIAL_MS",
                1000u64,
            )?),
            reconnect_max: Duration::from_secs(env_parse("BRIDGE_RECONNECT_MAX_SECS", 60u64)?),
            max_reconnects: env_parse("BRIDGE_MAX_RECONNECTS", 0u32)?,
            auto_reply_private: env_bool("BRIDGE_AUTO_REPLY_PRIVATE", true),
            ignore_temp_session: env_bool("BRIDGE_IGNORE_TEMP_SESSION", true),
            command_prefixes,
            cli_path: env_or("BRIDGE_CLI_PATH", "claude"),
            work_dir: PathBuf::from(env_or("BRIDGE_WORK_DIR", ".")),
            invoke_timeout: Duration::from_secs(env_parse("BRIDGE_INVOKE_TIMEOUT_SECS", 300u64)?),
            max_concurrent: env_parse("BRIDGE_MAX_CONCURRENT", 4usize)?,
            session_backlog: env_parse("BRIDGE_SESSION_BACKLOG", 4usize)?,
            session_ttl: Duration::from_secs(env_parse("BRIDGE_SESSION_TTL_SECS", 3600u64)?),
            evict_interval: Duration::from_secs(env_parse("BRIDGE_EVICT_INTERVAL_SECS", 300u64)?),
            cost_suffix: env_bool("BRIDGE_COST_SUFFIX", true),
            max_message_len: env_parse("BRIDGE_MAX_MESSAGE_LEN", 2000usize)?,
            segment_delay: Duration::from_millis(env_parse("BRIDGE_SEGMENT_DELAY_MS", 500u64)?),
            thinking_notice: env_bool("BRIDGE_THINKING_NOTICE", true),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the snapshot; violations here are the only fatal errors
    pub fn validate(&self) -> Result<()> {
        if !self.gateway_url.starts_with("ws://") && !self.gateway_url.starts_with("wss://") {
            bail!(
                "BRIDGE_GATEWAY_URL must use ws:// or wss://: {}",
                self.gateway_url
            );
        }
        if self.self_id == 0 {
            bail!("BRIDGE_SELF_ID must be non-zero");
        }
        if self.command_prefixes.is_empty() {
            bail!("BRIDGE_COMMAND_PREFIXES must name at least one prefix");
        }
        if self.max_concurrent == 0 {
            bail!("BRIDGE_MAX_CONCURRENT must be at least 1");
        }
        if self.max_message_len == 0 {
            bail!("BRIDGE_MAX_MESSAGE_LEN must be at least 1");
        }
        if self.invoke_timeout.is_zero() {
            bail!("BRIDGE_INVOKE_TIMEOUT_SECS must be at least 1");
        }
        if self.connect_timeout.is_zero() {
            bail!("BRIDGE_CONNECT_TIMEOUT_SECS must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
impl Default for Config {
    /// Test fixture with the documented defaults and a fixed self id
    fn default() -> Self {
        Self {
            gateway_url: "ws://127.0.0.1:8081".to_string(),
            self_id: 10000,
            connect_timeout: Duration::from_secs(30),
            reconnect_initial: Duration::from_millis(1000),
            reconnect_max: Duration::from_secs(60),
            max_reconnects: 0,
            auto_reply_private: true,
            ignore_temp_session: true,
            command_prefixes: vec!["/claude".into(), "/ask".into(), "/c".into()],
            cli_path: "claude".to_string(),
            work_dir: PathBuf::from("."),
            invoke_timeout: Duration::from_secs(300),
            max_concurrent: 4,
            session_backlog: 4,
            session_ttl: Duration::from_secs(3600),
            evict_interval: Duration::from_secs(300),
            cost_suffix: true,
            max_message_len: 2000,
            segment_delay: Duration::from_millis(0),
            thinking_notice: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fixture_passes_validation() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_websocket_url() {
        let config = Config {
            gateway_url: "http://127.0.0.1:8081".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = Config {
            max_concurrent: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
