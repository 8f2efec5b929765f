use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::time::Duration;
use tracing::warn;

/// Default REST API base URL
pub const DEFAULT_API_BASE: &str = "https://discord.com/api";
/// Default gateway protocol version
pub const DEFAULT_API_VERSION: u8 = 6;
/// Bounds for the identify `large_threshold` field
pub const LARGE_THRESHOLD_MIN: u16 = 50;
pub const LARGE_THRESHOLD_MAX: u16 = 250;

/// Client identification properties sent with Identify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            os: env::consts::OS.to_string(),
            browser: "cordkit".to_string(),
            device: "cordkit".to_string(),
        }
    }
}

/// A send cap: at most `max` sends per `period`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCap {
    pub max: u32,
    #[serde(with = "duration_millis")]
    pub period: Duration,
}

impl SendCap {
    #[must_use]
    pub const fn new(max: u32, period: Duration) -> Self {
        Self { max, period }
    }

    /// Local REST burst cap per (credential, route)
    #[must_use]
    pub const fn rest_default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }

    /// Outbound gateway cap per connection
    #[must_use]
    pub const fn gateway_default() -> Self {
        Self::new(120, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub token: Secret<String>,
    pub shard_index: u32,
    pub shard_count: u32,
    pub compress: bool,
    pub large_threshold: u16,
    pub intents: Option<u64>,
    pub api_base: String,
    pub api_version: u8,
    /// Skip the `GET /gateway` lookup and connect here
    pub gateway_url: Option<String>,
    pub properties: ClientProperties,
    pub request_timeout: Duration,
    pub rest_burst: SendCap,
    pub gateway_send: SendCap,
    /// Reconnect delay used before any HELLO has been seen
    pub fallback_reconnect_delay: Duration,
    pub exit_on_fatal_close: bool,
    pub user_agent: String,
}

// Custom Serialize implementation - never expose the token in serialization
impl Serialize for ClientConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ClientConfig", 10)?;
        state.serialize_field("token", "[REDACTED]")?;
        state.serialize_field("shard_index", &self.shard_index)?;
        state.serialize_field("shard_count", &self.shard_count)?;
        state.serialize_field("compress", &self.compress)?;
        state.serialize_field("large_threshold", &self.large_threshold)?;
        state.serialize_field("intents", &self.intents)?;
        state.serialize_field("api_base", &self.api_base)?;
        state.serialize_field("api_version", &self.api_version)?;
        state.serialize_field("gateway_url", &self.gateway_url)?;
        state.serialize_field("exit_on_fatal_close", &self.exit_on_fatal_close)?;
        state.end()
    }
}

// Custom Deserialize implementation
impl<'de> Deserialize<'de> for ClientConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ClientConfigHelper {
            token: String,
            #[serde(default)]
            shard_index: u32,
            #[serde(default)]
            shard_count: Option<u32>,
            #[serde(default)]
            compress: bool,
            #[serde(default)]
            large_threshold: Option<u16>,
            #[serde(default)]
            intents: Option<u64>,
            #[serde(default)]
            api_base: Option<String>,
            #[serde(default)]
            api_version: Option<u8>,
            #[serde(default)]
            gateway_url: Option<String>,
            #[serde(default)]
            exit_on_fatal_close: Option<bool>,
        }

        let helper = ClientConfigHelper::deserialize(deserializer)?;
        let mut config = Self::new(helper.token)
            .shards(helper.shard_index, helper.shard_count.unwrap_or(1))
            .compress(helper.compress);
        config.intents = helper.intents;
        if let Some(threshold) = helper.large_threshold {
            config = config.large_threshold(threshold);
        }
        if let Some(api_base) = helper.api_base {
            config.api_base = api_base;
        }
        if let Some(version) = helper.api_version {
            config.api_version = version;
        }
        config.gateway_url = helper.gateway_url;
        if let Some(exit) = helper.exit_on_fatal_close {
            config.exit_on_fatal_close = exit;
        }
        Ok(config)
    }
}

impl ClientConfig {
    /// Create a new configuration for the given bot token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Secret::new(token.into()),
            shard_index: 0,
            shard_count: 1,
            compress: false,
            large_threshold: LARGE_THRESHOLD_MIN,
            intents: None,
            api_base: DEFAULT_API_BASE.to_string(),
            api_version: DEFAULT_API_VERSION,
            gateway_url: None,
            properties: ClientProperties::default(),
            request_timeout: Duration::from_secs(30),
            rest_burst: SendCap::rest_default(),
            gateway_send: SendCap::gateway_default(),
            fallback_reconnect_delay: Duration::from_secs(5),
            exit_on_fatal_close: true,
            user_agent: format!(
                "DiscordBot (cordkit, {})",
                env!("CARGO_PKG_VERSION")
            ),
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_TOKEN` (e.g., `DISCORD_TOKEN`)
    /// - `{PREFIX}_SHARD_INDEX` / `{PREFIX}_SHARD_COUNT` (optional, default 0 / 1)
    /// - `{PREFIX}_COMPRESS` (optional, defaults to false)
    /// - `{PREFIX}_API_BASE` (optional)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let token_var = format!("{}_TOKEN", prefix);

        let token =
            env::var(&token_var).map_err(|_| ConfigError::MissingEnvironmentVariable(token_var))?;

        let shard_index = parse_var(&format!("{}_SHARD_INDEX", prefix))?.unwrap_or(0);
        let shard_count = parse_var(&format!("{}_SHARD_COUNT", prefix))?.unwrap_or(1);
        let compress = env::var(format!("{}_COMPRESS", prefix))
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let mut config = Self::new(token)
            .shards(shard_index, shard_count)
            .compress(compress);
        if let Ok(api_base) = env::var(format!("{}_API_BASE", prefix)) {
            config.api_base = api_base;
        }
        Ok(config)
    }

    /// Create configuration from .env file and environment variables
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    /// Create configuration from a specific .env file path
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // no .env file, fall through to the process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    /// Load configuration with automatic .env file detection
    ///
    /// Tries `.env.local`, then `.env.{ENVIRONMENT}`, then `.env`, loading only
    /// the first one found.
    #[cfg(feature = "env-file")]
    pub fn from_env_auto(prefix: &str) -> Result<Self, ConfigError> {
        let env_files = [
            ".env.local".to_string(),
            format!(
                ".env.{}",
                env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
            ),
            ".env".to_string(),
        ];

        for env_file in &env_files {
            match dotenv::from_path(env_file) {
                Ok(_) => break,
                Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ConfigError::InvalidConfiguration(format!(
                        "Failed to load .env file '{}': {}",
                        env_file, e
                    )));
                }
            }
        }

        Self::from_env(prefix)
    }

    /// Set the shard descriptor.
    ///
    /// Invalid descriptors (count of zero, index outside `0..count`) are
    /// replaced with `(0, 1)` and a warning is logged.
    #[must_use]
    pub fn shards(mut self, shard_index: u32, shard_count: u32) -> Self {
        let (index, count) = validate_shard(shard_index, shard_count);
        self.shard_index = index;
        self.shard_count = count;
        self
    }

    #[must_use]
    pub const fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the member count above which guilds are sent without offline
    /// members. Clamped to `[50, 250]`.
    #[must_use]
    pub fn large_threshold(mut self, threshold: u16) -> Self {
        self.large_threshold = clamp_large_threshold(threshold);
        self
    }

    #[must_use]
    pub const fn intents(mut self, intents: u64) -> Self {
        self.intents = Some(intents);
        self
    }

    #[must_use]
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    #[must_use]
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn rest_burst(mut self, cap: SendCap) -> Self {
        self.rest_burst = cap;
        self
    }

    #[must_use]
    pub const fn gateway_send(mut self, cap: SendCap) -> Self {
        self.gateway_send = cap;
        self
    }

    #[must_use]
    pub const fn fallback_reconnect_delay(mut self, delay: Duration) -> Self {
        self.fallback_reconnect_delay = delay;
        self
    }

    #[must_use]
    pub const fn exit_on_fatal_close(mut self, exit: bool) -> Self {
        self.exit_on_fatal_close = exit;
        self
    }

    /// Check if this configuration carries a token
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.token.expose_secret().is_empty()
    }

    /// Get the bot token (use carefully - exposes secret)
    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }
}

/// Validate a shard descriptor, falling back to `(0, 1)`
pub fn validate_shard(shard_index: u32, shard_count: u32) -> (u32, u32) {
    if shard_count >= 1 && shard_index < shard_count {
        (shard_index, shard_count)
    } else {
        warn!(
            shard_index,
            shard_count, "Invalid shard descriptor, using [0, 1]"
        );
        (0, 1)
    }
}

/// Clamp a large-guild threshold into [50, 250]
pub fn clamp_large_threshold(threshold: u16) -> u16 {
    let clamped = threshold.clamp(LARGE_THRESHOLD_MIN, LARGE_THRESHOLD_MAX);
    if clamped != threshold {
        warn!(
            requested = threshold,
            used = clamped,
            "large_threshold out of range, clamping"
        );
    }
    clamped
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            ConfigError::InvalidConfiguration(format!("{} is not a valid number: {}", name, raw))
        }),
        Err(_) => Ok(None),
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
