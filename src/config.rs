//! Configuration loaded with Figment.
//!
//! Values are layered, later sources winning:
//! 1. Built-in defaults
//! 2. A TOML file (`config/sheet_daq.toml` unless given explicitly)
//! 3. Environment variables prefixed with `SHEETDAQ_`, nested keys joined by `__`
//!
//! ```text
//! SHEETDAQ_INSTRUMENT__ADDRESS=192.168.1.204
//! SHEETDAQ_SWEEP__POINT_COUNT=51
//! SHEETDAQ_LOGGING__LEVEL=debug
//! ```
//!
//! The loaded [`AppConfig`] is passed to constructors explicitly; there is no
//! global configuration state.

use crate::adapters::tcp_adapter::DEFAULT_SCPI_PORT;
use crate::plan::{SweepParameters, SweepPlan};
use crate::timeout::{
    TimeoutEstimator, DEFAULT_AUTO_DELAY_S, DEFAULT_LINE_FREQUENCY_HZ, DEFAULT_SAFETY_MARGIN,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/sheet_daq.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or did not match the schema.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values were read but are not acceptable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Instrument connection
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Timeout estimation
    #[serde(default)]
    pub timing: TimingConfig,
    /// Raw sweep parameters, validated into a [`SweepPlan`]
    #[serde(default)]
    pub sweep: SweepParameters,
    /// Fit reporting
    #[serde(default)]
    pub analysis: AnalysisConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Result export
    #[serde(default)]
    pub output: OutputConfig,
}

/// Which device implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Keithley 2450 over a raw SCPI socket
    Keithley2450,
    /// Simulated ohmic device
    Mock,
}

/// Instrument connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Device implementation
    #[serde(default = "default_driver")]
    pub driver: Driver,
    /// Host name, `host:port`, or `TCPIP::host::port::SOCKET`
    #[serde(default)]
    pub address: String,
    /// Socket port, used when `address` has none
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per-command I/O timeout in milliseconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
    /// Mains frequency, sets the length of one power-line cycle
    #[serde(default = "default_line_frequency")]
    pub line_frequency_hz: f64,
    /// Simulated device settings, used by the `mock` driver
    #[serde(default)]
    pub mock: MockConfig,
}

/// Simulated device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockConfig {
    /// Device resistance in ohms
    #[serde(default = "default_mock_resistance")]
    pub resistance_ohms: f64,
    /// Relative noise amplitude (0 = noiseless)
    #[serde(default)]
    pub noise: f64,
    /// Noise generator seed
    #[serde(default)]
    pub seed: u64,
    /// Simulated acquisition time per point in milliseconds
    #[serde(default = "default_mock_point_time")]
    pub point_time_ms: u64,
}

/// Timeout estimation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Multiplier applied to the nominal sweep duration (>= 1)
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Per-point delay assumed when the instrument chooses its own, in seconds
    #[serde(default = "default_auto_delay")]
    pub auto_delay_s: f64,
}

/// Fit reporting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// k in `value ± k·σ`
    #[serde(default = "default_coverage_factor")]
    pub coverage_factor: f64,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable text
    #[serde(default)]
    pub json: bool,
}

/// Result export settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for CSV files. No export when unset.
    #[serde(default)]
    pub csv_dir: Option<PathBuf>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_driver() -> Driver {
    Driver::Keithley2450
}

fn default_port() -> u16 {
    DEFAULT_SCPI_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_io_timeout() -> u64 {
    5000
}

fn default_line_frequency() -> f64 {
    DEFAULT_LINE_FREQUENCY_HZ
}

fn default_mock_resistance() -> f64 {
    1000.0
}

fn default_mock_point_time() -> u64 {
    5
}

fn default_safety_margin() -> f64 {
    DEFAULT_SAFETY_MARGIN
}

fn default_auto_delay() -> f64 {
    DEFAULT_AUTO_DELAY_S
}

fn default_coverage_factor() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            address: String::new(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
            line_frequency_hz: default_line_frequency(),
            mock: MockConfig::default(),
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            resistance_ohms: default_mock_resistance(),
            noise: 0.0,
            seed: 0,
            point_time_ms: default_mock_point_time(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
            auto_delay_s: default_auto_delay(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            coverage_factor: default_coverage_factor(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl InstrumentConfig {
    /// Connection descriptor for the socket transport.
    pub fn descriptor(&self) -> String {
        if self.address.contains(':') {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-command I/O timeout.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// # Errors
    /// See [`AppConfig::load_from`].
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    /// Returns a ConfigError if a source is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment_for(path))
    }

    /// Defaults, then `path`, then the environment, not yet extracted.
    ///
    /// Useful when command line overrides must be applied before validation.
    pub fn figment_for<P: AsRef<Path>>(path: P) -> Figment {
        Self::base()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SHEETDAQ_").split("__"))
    }

    /// Defaults as a figment, for layering further providers on top.
    pub fn base() -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
    }

    /// Extract and validate from an assembled figment.
    ///
    /// # Errors
    /// Returns a ConfigError if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.instrument.driver == Driver::Keithley2450
            && self.instrument.address.trim().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "instrument.address cannot be empty for the keithley2450 driver".to_string(),
            ));
        }

        if self.instrument.line_frequency_hz != 50.0 && self.instrument.line_frequency_hz != 60.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid line_frequency_hz {}. Must be 50 or 60",
                self.instrument.line_frequency_hz
            )));
        }

        let resistance = self.instrument.mock.resistance_ohms;
        if self.instrument.driver == Driver::Mock && (!resistance.is_finite() || resistance <= 0.0)
        {
            return Err(ConfigError::ValidationError(format!(
                "Invalid mock resistance_ohms {}. Must be > 0",
                self.instrument.mock.resistance_ohms
            )));
        }

        if self.analysis.coverage_factor.is_nan() || self.analysis.coverage_factor <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid coverage_factor {}. Must be > 0",
                self.analysis.coverage_factor
            )));
        }

        self.timeout_estimator()?;
        self.sweep_plan()?;
        Ok(())
    }

    /// Estimator built from the timing and line frequency settings.
    ///
    /// # Errors
    /// Returns a ConfigError if the safety margin is below 1 or the auto
    /// delay is not positive.
    pub fn timeout_estimator(&self) -> Result<TimeoutEstimator, ConfigError> {
        TimeoutEstimator::new(
            self.instrument.line_frequency_hz,
            self.timing.safety_margin,
            self.timing.auto_delay_s,
        )
        .map_err(|e| ConfigError::ValidationError(format!("timing: {}", e)))
    }

    /// The configured sweep, validated.
    ///
    /// # Errors
    /// Returns a ConfigError if the sweep block does not validate.
    pub fn sweep_plan(&self) -> Result<SweepPlan, ConfigError> {
        self.sweep
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("sweep: {}", e)))
    }
}
