use crate::codec::InferenceConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Tunables for the streaming engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Sessions with no inbound or outbound traffic for this long are reaped.
    pub idle_timeout: Duration,
    /// How often the reaper sweeps the registry.
    pub sweep_interval: Duration,
    /// Pause after each graceful teardown message.
    pub drain_pause: Duration,
    /// How long a lifecycle call waits for the stage it depends on.
    pub prerequisite_timeout: Duration,
    /// Upper bound on a single tool execution.
    pub tool_timeout: Duration,
    /// Audio chunks held before the oldest is dropped.
    pub audio_buffer_capacity: usize,
    /// Audio chunks moved to the outbound queue per drain pass.
    pub audio_batch_size: usize,
    /// Delay between drain attempts while audio is not yet allowed.
    pub audio_backoff: Duration,
    /// Default inference parameters for new sessions.
    pub inference: InferenceConfig,
    pub log_level: Level,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            drain_pause: Duration::from_millis(300),
            prerequisite_timeout: Duration::from_millis(5000),
            tool_timeout: Duration::from_millis(10_000),
            audio_buffer_capacity: 200,
            audio_batch_size: 10,
            audio_backoff: Duration::from_millis(10),
            inference: InferenceConfig::default(),
            log_level: Level::INFO,
        }
    }
}

/// Reads `name` and parses it, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn positive_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    let value = parse_var(name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

fn positive_f32(name: &str, default: f32) -> Result<f32, ConfigError> {
    let value = parse_var(name, default)?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' must be a positive number", value),
        ));
    }
    Ok(value)
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let defaults = Self::default();

        let idle_timeout = Duration::from_secs(positive_u64(
            "SONIC_IDLE_TIMEOUT_SECS",
            defaults.idle_timeout.as_secs(),
        )?);
        let sweep_interval = Duration::from_secs(positive_u64(
            "SONIC_SWEEP_INTERVAL_SECS",
            defaults.sweep_interval.as_secs(),
        )?);
        let drain_pause = Duration::from_millis(positive_u64("SONIC_DRAIN_PAUSE_MS", 300)?);
        let prerequisite_timeout =
            Duration::from_millis(positive_u64("SONIC_PREREQUISITE_TIMEOUT_MS", 5000)?);
        let tool_timeout = Duration::from_millis(positive_u64("SONIC_TOOL_TIMEOUT_MS", 10_000)?);
        let audio_buffer_capacity = positive_u64(
            "SONIC_AUDIO_BUFFER_CAPACITY",
            defaults.audio_buffer_capacity as u64,
        )? as usize;
        let audio_batch_size =
            positive_u64("SONIC_AUDIO_BATCH_SIZE", defaults.audio_batch_size as u64)? as usize;
        let audio_backoff = Duration::from_millis(positive_u64("SONIC_AUDIO_BACKOFF_MS", 10)?);

        let max_tokens = positive_u64("SONIC_MAX_TOKENS", defaults.inference.max_tokens as u64)?;
        let max_tokens = u32::try_from(max_tokens).map_err(|_| {
            ConfigError::InvalidValue(
                "SONIC_MAX_TOKENS".to_string(),
                format!("'{}' is too large", max_tokens),
            )
        })?;
        let top_p = positive_f32("SONIC_TOP_P", defaults.inference.top_p)?;
        let temperature = positive_f32("SONIC_TEMPERATURE", defaults.inference.temperature)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            idle_timeout,
            sweep_interval,
            drain_pause,
            prerequisite_timeout,
            tool_timeout,
            audio_buffer_capacity,
            audio_batch_size,
            audio_backoff,
            inference: InferenceConfig {
                max_tokens,
                top_p,
                temperature,
            },
            log_level,
        })
    }
}
