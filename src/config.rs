use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{StepStrategy, SweepConfig};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub sweep: SweepSettings,
    pub stage: StageConfig,
    pub acquisition: AcquisitionConfig,
    pub output: OutputConfig,
    pub experiment_logging: ExperimentLoggingConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SweepSettings {
    pub start_angle: f64,
    pub end_angle: f64,
    pub step_angle: f64,
    /// Scope records captured at each waveplate position
    pub records_per_step: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StageConfig {
    /// Serial number printed on the T-Cube controller
    pub serial_number: String,
    /// Wait after the move to the start angle
    pub settle_after_start_ms: u64,
    /// Wait after every step move
    pub settle_after_step_ms: u64,
    /// When set, the read-back position must come within this many degrees
    /// of the target before acquiring
    #[serde(default)]
    pub position_tolerance_deg: Option<f64>,
    /// How long to poll for the tolerance after the settle delay
    pub settle_timeout_ms: u64,
    #[serde(default)]
    pub step_strategy: StepStrategy,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AcquisitionConfig {
    pub device_id: String,
    pub timeout_secs: f64,
    pub poll_interval_ms: u64,
    /// Device clock frequency used to convert timestamps to seconds
    pub clockbase_hz: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    pub directory: String,
    pub file_prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExperimentLoggingConfig {
    pub enabled: bool,
    pub output_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            start_angle: 50.3,
            end_angle: 50.5,
            step_angle: 0.01,
            records_per_step: 5,
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            serial_number: "83835052".to_string(),
            settle_after_start_ms: 2000,
            settle_after_step_ms: 250,
            position_tolerance_deg: None,
            settle_timeout_ms: 1000,
            step_strategy: StepStrategy::ReadBack,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            device_id: "DEV2142".to_string(),
            timeout_secs: 30.0,
            poll_interval_ms: 500,
            clockbase_hz: 1.8e9,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: "./data".to_string(),
            file_prefix: "waveplate_sweep".to_string(),
        }
    }
}

impl Default for ExperimentLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_path: "./logs".to_string(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sweep_config()
            .validate()
            .map_err(|e| ConfigError::Message(format!("Invalid sweep: {}", e)))?;
        self.stage.validate()?;
        self.acquisition.validate()?;
        Ok(())
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            start_angle: self.sweep.start_angle,
            end_angle: self.sweep.end_angle,
            step_angle: self.sweep.step_angle,
            records_per_step: self.sweep.records_per_step,
        }
    }
}

impl StageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(tolerance) = self.position_tolerance_deg {
            if !(tolerance.is_finite() && tolerance > 0.0) {
                return Err(ConfigError::Message(format!(
                    "position_tolerance_deg must be positive, got: {}",
                    tolerance
                )));
            }
        }
        Ok(())
    }

    pub fn settle_after_start(&self) -> Duration {
        Duration::from_millis(self.settle_after_start_ms)
    }

    pub fn settle_after_step(&self) -> Duration {
        Duration::from_millis(self.settle_after_step_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

impl AcquisitionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            return Err(ConfigError::Message(format!(
                "timeout_secs must be positive, got: {}",
                self.timeout_secs
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !(self.clockbase_hz.is_finite() && self.clockbase_hz > 0.0) {
            return Err(ConfigError::Message(format!(
                "clockbase_hz must be positive, got: {}",
                self.clockbase_hz
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Load configuration from file with layered fallbacks
///
/// Defaults, then the TOML file, then `WAVEPLATE_SWEEP__SECTION__KEY`
/// environment overrides.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["config.toml", "sweep_config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("WAVEPLATE_SWEEP")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let config: AppConfig = config.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults with a warning
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
