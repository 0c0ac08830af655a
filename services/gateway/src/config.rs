use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Built-in receptionist instructions, used unless `INSTRUCTIONS_PATH` points elsewhere.
pub const DEFAULT_INSTRUCTIONS: &str =
    "You are FortuneOne AI Receptionist (EN/TH) for a massage & waxing spa in NYC. \
Speak shortly, one question at a time. Verify service/date/time/name/phone. \
Offer nearest available slots. Policies: close 22:00, last booking 21:00, cancel >=3h.";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: SecretString,
    pub realtime_url: String,
    pub realtime_model: String,
    pub voice: String,
    pub instructions: String,
    pub quiet_threshold: Duration,
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub close_grace: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let realtime_url = std::env::var("REALTIME_URL")
            .unwrap_or_else(|_| "wss://api.openai.com/v1/realtime".to_string());
        if !realtime_url.starts_with("ws://") && !realtime_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "REALTIME_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", realtime_url),
            ));
        }

        let realtime_model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| "gpt-4o-realtime-preview".to_string());
        let voice = std::env::var("REALTIME_VOICE").unwrap_or_else(|_| "verse".to_string());

        let instructions = match std::env::var("INSTRUCTIONS_PATH") {
            Ok(path) => {
                let path = PathBuf::from(path);
                std::fs::read_to_string(&path).map_err(|e| {
                    ConfigError::InvalidValue(
                        "INSTRUCTIONS_PATH".to_string(),
                        format!("cannot read {}: {}", path.display(), e),
                    )
                })?
            }
            Err(_) => DEFAULT_INSTRUCTIONS.to_string(),
        };

        let quiet_threshold = Duration::from_millis(positive_var("QUIET_THRESHOLD_MS", 900)?);
        let idle_timeout = Duration::from_secs(positive_var("IDLE_TIMEOUT_SECS", 60)?);
        let keepalive_interval = Duration::from_secs(positive_var("KEEPALIVE_INTERVAL_SECS", 10)?);
        let connect_timeout = Duration::from_millis(positive_var("AI_CONNECT_TIMEOUT_MS", 5000)?);
        let drain_timeout = Duration::from_millis(positive_var("DRAIN_TIMEOUT_MS", 2000)?);
        let close_grace = Duration::from_millis(positive_var("CLOSE_GRACE_MS", 2000)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_url,
            realtime_model,
            voice,
            instructions,
            quiet_threshold,
            idle_timeout,
            keepalive_interval,
            connect_timeout,
            drain_timeout,
            close_grace,
            log_level,
        })
    }
}

/// Reads a strictly positive integer, falling back to `default` when unset.
fn positive_var(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(0) => Err(ConfigError::InvalidValue(
                name.to_string(),
                "must be greater than zero".to_string(),
            )),
            Ok(value) => Ok(value),
            Err(e) => Err(ConfigError::InvalidValue(name.to_string(), e.to_string())),
        },
        Err(_) => Ok(default),
    }
}
