use std::time::Duration;

/// Default time a dispatched request waits for its worker before a 504.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(240);

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the relay listens on
    pub port: u16,
    /// Shared broker secret every worker channel must present.
    /// When unset, all channel upgrades are refused.
    pub broker_secret: Option<String>,
    /// How long a dispatched request waits for the worker's reply
    pub request_timeout: Duration,
    /// Credentials of disconnected workers whose last heartbeat is older
    /// than this are purged by the sweeper.
    pub credential_ttl: Duration,
    /// How often the credential sweeper runs
    pub credential_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9090,
            broker_secret: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            credential_ttl: Duration::from_secs(7 * 24 * 3600),
            credential_sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let broker_secret = std::env::var("RELAY_BROKER_SECRET")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let request_timeout_ms: u64 = env_parse(
            "RELAY_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
        )?;
        if request_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "RELAY_REQUEST_TIMEOUT_MS must be greater than zero"
            ));
        }

        Ok(Self {
            port: env_parse("RELAY_PORT", 9090)?,
            broker_secret,
            request_timeout: Duration::from_millis(request_timeout_ms),
            credential_ttl: Duration::from_secs(env_parse(
                "RELAY_CREDENTIAL_TTL_SECS",
                7 * 24 * 3600,
            )?),
            credential_sweep_interval: Duration::from_secs(env_parse(
                "RELAY_CREDENTIAL_SWEEP_SECS",
                3600,
            )?),
        })
    }
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
