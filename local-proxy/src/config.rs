use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::ReconnectPolicy;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:11434/v1";
pub const DEFAULT_IDENTITY_PATH: &str = ".local-proxy/identity.json";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Relay base URL (`ws://` or `wss://`); the channel path is appended when missing
    pub relay_url: String,
    /// Shared broker secret presented on every channel upgrade
    pub broker_secret: String,
    /// OpenAI-compatible API base, e.g. Ollama's `/v1`
    pub backend_url: String,
    pub backend_model: Option<String>,
    pub backend_api_key: Option<String>,
    pub backend_timeout: Duration,
    pub display_name: Option<String>,
    pub identity_path: PathBuf,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub reconnect: ReconnectPolicy,
}

impl WorkerConfig {
    /// Config for a relay/backend pair with every other knob at its default.
    pub fn new(relay_url: impl Into<String>, broker_secret: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            broker_secret: broker_secret.into(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            backend_model: None,
            backend_api_key: None,
            backend_timeout: Duration::from_secs(230),
            display_name: None,
            identity_path: PathBuf::from(DEFAULT_IDENTITY_PATH),
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let relay_url = env_str("LOCAL_PROXY_RELAY_URL")
            .ok_or_else(|| anyhow::anyhow!("LOCAL_PROXY_RELAY_URL must be set"))?;
        let broker_secret = env_str("LOCAL_PROXY_BROKER_SECRET")
            .ok_or_else(|| anyhow::anyhow!("LOCAL_PROXY_BROKER_SECRET must be set"))?;

        let heartbeat_secs: u64 = env_parse("LOCAL_PROXY_HEARTBEAT_SECS", 30)?;
        if heartbeat_secs == 0 {
            return Err(anyhow::anyhow!(
                "LOCAL_PROXY_HEARTBEAT_SECS must be greater than zero"
            ));
        }

        Ok(Self {
            backend_url: env_str("LOCAL_PROXY_BACKEND_URL")
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            backend_model: env_str("LOCAL_PROXY_BACKEND_MODEL"),
            backend_api_key: env_str("LOCAL_PROXY_BACKEND_API_KEY"),
            backend_timeout: Duration::from_secs(env_parse(
                "LOCAL_PROXY_BACKEND_TIMEOUT_SECS",
                230,
            )?),
            display_name: env_str("LOCAL_PROXY_DISPLAY_NAME"),
            identity_path: env_str("LOCAL_PROXY_IDENTITY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IDENTITY_PATH)),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_missed_heartbeats: env_parse("LOCAL_PROXY_MAX_MISSED_HEARTBEATS", 3)?,
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(env_parse(
                    "LOCAL_PROXY_RECONNECT_INITIAL_MS",
                    1000,
                )?),
                max_delay: Duration::from_millis(env_parse(
                    "LOCAL_PROXY_RECONNECT_MAX_MS",
                    60_000,
                )?),
                max_attempts: env_parse("LOCAL_PROXY_RECONNECT_MAX_ATTEMPTS", 10)?,
            },
            ..Self::new(relay_url, broker_secret)
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::new("ws://relay", "broker");
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.max_missed_heartbeats, 3);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_env_parse_falls_back_to_default() {
        let value: u32 = env_parse("LOCAL_PROXY_TEST_UNSET_VARIABLE_XYZ", 7).unwrap();
        assert_eq!(value, 7);
    }
}
