//! Configuration module for the Shelter Sentry agent.
//!
//! Configuration is resolved once from environment variables before any
//! component starts, then handed to each component by reference. Nothing in
//! the agent reads the environment after startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::event::{Credentials, SensorId};
use crate::poller::FirstSample;

/// Prefix shared by every configuration variable.
const ENV_PREFIX: &str = "SHELTER_SENTRY_";

/// Default API URL for the shelter backend
const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Default resource path appended to the API URL
const DEFAULT_RESOURCE: &str = "refugio";

/// Default polling interval in milliseconds
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Polling interval limits in milliseconds
const MIN_POLL_INTERVAL_MS: u64 = 50;
const MAX_POLL_INTERVAL_MS: u64 = 60_000;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default interval between retry sweeps in seconds
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 30;
const MAX_RETRY_INTERVAL_SECS: u64 = 3_600;

/// Default cap on the retry sweep backoff in seconds
const DEFAULT_MAX_RETRY_BACKOFF_SECS: u64 = 600;

/// Permanent rejections tolerated before an entry is dead-lettered
const DEFAULT_MAX_REJECTED_ATTEMPTS: u64 = 5;

const DEFAULT_FAILURE_LOG: &str = "failed_requests.log";
const DEFAULT_DEAD_LETTER_LOG: &str = "failed_requests.dead.log";
const DEFAULT_DIGITAL_PINS: &str = "21";
const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";

/// Thermal source defaults
const DEFAULT_THERMAL_SENSOR_ID: u64 = 100;
const DEFAULT_THERMAL_BASELINE: f32 = 20.0;
const DEFAULT_THERMAL_THRESHOLD: f32 = 5.0;

/// Settings for the optional thermal-camera source.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalConfig {
    /// File the camera driver writes its latest frame to
    pub frame_path: PathBuf,

    /// Logical sensor id reported for thermal events
    pub sensor_id: SensorId,

    /// Static reference temperature the frame mean is compared against
    pub baseline: f32,

    /// Deviation from the baseline that must be exceeded to report movement
    pub threshold: f32,
}

/// Configuration for the Shelter Sentry agent.
///
/// All settings can be configured via `SHELTER_SENTRY_*` environment variables;
/// see [`Config::from_env`].
#[derive(Clone)]
pub struct Config {
    /// Base URL of the shelter backend
    pub api_url: String,

    /// Full URL events are POSTed to: `{api_url}/{resource}/`
    pub endpoint_url: String,

    /// Shelter identity sent as `id_refugio`
    pub shelter_id: String,

    /// Shared secret sent alongside the shelter identity
    pub password: String,

    /// Time between two sensor sweeps
    pub poll_interval: Duration,

    /// Upper bound on a single delivery attempt
    pub request_timeout: Duration,

    /// Base time between two retry sweeps of the failure store
    pub retry_interval: Duration,

    /// Cap on the backed-off retry sweep interval
    pub max_retry_backoff: Duration,

    /// Permanent rejections an entry may collect before it is dead-lettered
    pub max_rejected_attempts: u32,

    /// Durable log of events awaiting redelivery
    pub failure_log: PathBuf,

    /// Log of entries the backend refused too many times
    pub dead_letter_log: PathBuf,

    /// GPIO lines read as digital presence sensors
    pub digital_pins: Vec<u32>,

    /// Root of the sysfs GPIO interface
    pub gpio_root: PathBuf,

    /// Thermal source, when a frame path is configured
    pub thermal: Option<ThermalConfig>,

    /// Whether the first sample of each source is reported
    pub first_sample: FirstSample,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_url", &self.api_url)
            .field("endpoint_url", &self.endpoint_url)
            .field("shelter_id", &self.shelter_id)
            .field("password", &"<redacted>")
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout", &self.request_timeout)
            .field("retry_interval", &self.retry_interval)
            .field("max_retry_backoff", &self.max_retry_backoff)
            .field("max_rejected_attempts", &self.max_rejected_attempts)
            .field("failure_log", &self.failure_log)
            .field("dead_letter_log", &self.dead_letter_log)
            .field("digital_pins", &self.digital_pins)
            .field("gpio_root", &self.gpio_root)
            .field("thermal", &self.thermal)
            .field("first_sample", &self.first_sample)
            .finish()
    }
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Recognised variables (all prefixed with `SHELTER_SENTRY_`):
    /// - `API_URL`, `RESOURCE`: endpoint is `{API_URL}/{RESOURCE}/`
    /// - `SHELTER_ID`, `PASSWORD`: required credentials
    /// - `POLL_INTERVAL_MS`, `REQUEST_TIMEOUT_SECS`, `RETRY_INTERVAL_SECS`,
    ///   `MAX_RETRY_BACKOFF_SECS`, `MAX_REJECTED_ATTEMPTS`
    /// - `FAILURE_LOG`, `DEAD_LETTER_LOG`
    /// - `DIGITAL_PINS` (comma separated), `GPIO_ROOT`
    /// - `THERMAL_FRAME_PATH` (enables the thermal source), `THERMAL_SENSOR_ID`,
    ///   `THERMAL_BASELINE`, `THERMAL_THRESHOLD`
    /// - `SEED_SILENTLY`: suppress the event for each source's first sample
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a required variable is missing or a value
    /// does not parse or falls outside its allowed range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = var("API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let resource = var("RESOURCE").unwrap_or_else(|| DEFAULT_RESOURCE.to_string());
        let resource = resource.trim_matches('/');
        if resource.is_empty() {
            return Err(ConfigError::for_var(
                &name("RESOURCE"),
                "resource path must not be empty",
            ));
        }
        let endpoint_url = format!("{}/{}/", api_url, resource);

        let shelter_id = required("SHELTER_ID")?;
        let password = required("PASSWORD")?;

        let poll_interval = Duration::from_millis(parse_ranged(
            "POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
            MIN_POLL_INTERVAL_MS,
            MAX_POLL_INTERVAL_MS,
        )?);
        let request_timeout = Duration::from_secs(parse_ranged(
            "REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            MAX_REQUEST_TIMEOUT_SECS,
        )?);
        let retry_interval_secs = parse_ranged(
            "RETRY_INTERVAL_SECS",
            DEFAULT_RETRY_INTERVAL_SECS,
            1,
            MAX_RETRY_INTERVAL_SECS,
        )?;
        let max_backoff_secs = parse_ranged(
            "MAX_RETRY_BACKOFF_SECS",
            DEFAULT_MAX_RETRY_BACKOFF_SECS.max(retry_interval_secs),
            retry_interval_secs,
            u64::MAX,
        )?;
        let max_rejected_attempts = parse_ranged(
            "MAX_REJECTED_ATTEMPTS",
            DEFAULT_MAX_REJECTED_ATTEMPTS,
            1,
            u32::MAX as u64,
        )? as u32;

        let failure_log = PathBuf::from(
            var("FAILURE_LOG").unwrap_or_else(|| DEFAULT_FAILURE_LOG.to_string()),
        );
        let dead_letter_log = PathBuf::from(
            var("DEAD_LETTER_LOG").unwrap_or_else(|| DEFAULT_DEAD_LETTER_LOG.to_string()),
        );

        let digital_pins = parse_pins(
            &var("DIGITAL_PINS").unwrap_or_else(|| DEFAULT_DIGITAL_PINS.to_string()),
        )?;
        let gpio_root =
            PathBuf::from(var("GPIO_ROOT").unwrap_or_else(|| DEFAULT_GPIO_ROOT.to_string()));

        let thermal = match var("THERMAL_FRAME_PATH") {
            Some(path) => Some(ThermalConfig {
                frame_path: PathBuf::from(path),
                sensor_id: SensorId(parse_ranged(
                    "THERMAL_SENSOR_ID",
                    DEFAULT_THERMAL_SENSOR_ID,
                    0,
                    u32::MAX as u64,
                )? as u32),
                baseline: parse_float("THERMAL_BASELINE", DEFAULT_THERMAL_BASELINE)?,
                threshold: parse_threshold()?,
            }),
            None => None,
        };

        if digital_pins.is_empty() && thermal.is_none() {
            return Err(ConfigError {
                message: "no sensor sources configured".to_string(),
                env_var: None,
            });
        }

        let first_sample = if parse_bool("SEED_SILENTLY")? {
            FirstSample::SeedSilently
        } else {
            FirstSample::AlwaysEmit
        };

        Ok(Self {
            api_url,
            endpoint_url,
            shelter_id,
            password,
            poll_interval,
            request_timeout,
            retry_interval: Duration::from_secs(retry_interval_secs),
            max_retry_backoff: Duration::from_secs(max_backoff_secs),
            max_rejected_attempts,
            failure_log,
            dead_letter_log,
            digital_pins,
            gpio_root,
            thermal,
            first_sample,
        })
    }

    /// Authentication fields injected into every outbound payload.
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.shelter_id.clone(), self.password.clone())
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            endpoint_url: format!("{}/{}/", DEFAULT_API_URL, DEFAULT_RESOURCE),
            shelter_id: "0".to_string(),
            password: String::new(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            max_retry_backoff: Duration::from_secs(DEFAULT_MAX_RETRY_BACKOFF_SECS),
            max_rejected_attempts: DEFAULT_MAX_REJECTED_ATTEMPTS as u32,
            failure_log: PathBuf::from(DEFAULT_FAILURE_LOG),
            dead_letter_log: PathBuf::from(DEFAULT_DEAD_LETTER_LOG),
            digital_pins: vec![21],
            gpio_root: PathBuf::from(DEFAULT_GPIO_ROOT),
            thermal: None,
            first_sample: FirstSample::AlwaysEmit,
        }
    }
}

fn name(suffix: &str) -> String {
    format!("{}{}", ENV_PREFIX, suffix)
}

/// Read a variable, treating empty values as unset.
fn var(suffix: &str) -> Option<String> {
    env::var(name(suffix))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(suffix: &str) -> Result<String, ConfigError> {
    var(suffix).ok_or_else(|| ConfigError::for_var(&name(suffix), "variable is required"))
}

/// Parse an integer variable with validation against `[min, max]`.
fn parse_ranged(suffix: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    let env_var = name(suffix);

    match var(suffix) {
        Some(value) => {
            let parsed: u64 = value.parse().map_err(|_| {
                ConfigError::for_var(&env_var, format!("'{}' is not a valid number", value))
            })?;

            if parsed < min {
                return Err(ConfigError::for_var(
                    &env_var,
                    format!("{} is below minimum ({})", parsed, min),
                ));
            }

            if parsed > max {
                return Err(ConfigError::for_var(
                    &env_var,
                    format!("{} exceeds maximum ({})", parsed, max),
                ));
            }

            Ok(parsed)
        }
        None => Ok(default),
    }
}

fn parse_float(suffix: &str, default: f32) -> Result<f32, ConfigError> {
    match var(suffix) {
        Some(value) => match value.parse::<f32>() {
            Ok(parsed) if parsed.is_finite() => Ok(parsed),
            _ => Err(ConfigError::for_var(
                &name(suffix),
                format!("'{}' is not a valid number", value),
            )),
        },
        None => Ok(default),
    }
}

fn parse_threshold() -> Result<f32, ConfigError> {
    let threshold = parse_float("THERMAL_THRESHOLD", DEFAULT_THERMAL_THRESHOLD)?;
    if threshold <= 0.0 {
        return Err(ConfigError::for_var(
            &name("THERMAL_THRESHOLD"),
            "threshold must be greater than 0",
        ));
    }
    Ok(threshold)
}

fn parse_bool(suffix: &str) -> Result<bool, ConfigError> {
    match var(suffix).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("0") | Some("false") | Some("no") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some(other) => Err(ConfigError::for_var(
            &name(suffix),
            format!("'{}' is not a valid boolean", other),
        )),
    }
}

fn parse_pins(value: &str) -> Result<Vec<u32>, ConfigError> {
    let mut pins = Vec::new();
    for raw in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let pin: u32 = raw.parse().map_err(|_| {
            ConfigError::for_var(
                &name("DIGITAL_PINS"),
                format!("'{}' is not a valid GPIO number", raw),
            )
        })?;
        if pins.contains(&pin) {
            return Err(ConfigError::for_var(
                &name("DIGITAL_PINS"),
                format!("GPIO {} is listed twice", pin),
            ));
        }
        pins.push(pin);
    }
    Ok(pins)
}
