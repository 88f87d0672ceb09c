//! Configuration management.
//!
//! All communication ports, instrument models and loop timings live in one
//! `Settings` struct loaded once at startup and passed by reference to the
//! acquisition loop and the sequencer. Nothing here is process-global.

use crate::error::{AppResult, DaqError};
use crate::lockin::LockinModel;
use config::Config;
use serde::Deserialize;
use std::time::Duration;

/// Top-level application settings, loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Log filter level (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Acquisition loop timing.
    #[serde(default)]
    pub acquisition: AcquisitionSettings,

    /// Sequencer polling behaviour.
    #[serde(default)]
    pub sequencer: SequencerSettings,

    /// Results sink location.
    #[serde(default)]
    pub storage: StorageSettings,

    /// Configured lock-in amplifiers, in column order.
    #[serde(default)]
    pub lockins: Vec<LockinSettings>,

    /// Cryostat controller section; absent means no controller columns.
    pub ppms: Option<PpmsSettings>,
}

/// One configured lock-in amplifier.
#[derive(Debug, Deserialize, Clone)]
pub struct LockinSettings {
    /// Device model, selects the driver.
    pub model: LockinModel,
    /// Port the instrument is attached to (e.g. `/dev/ttyUSB0`, `COM3`).
    pub port: String,
    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Acquisition loop timing.
#[derive(Debug, Deserialize, Clone)]
pub struct AcquisitionSettings {
    /// Delay between ticks; the stop flag is checked once per tick.
    #[serde(with = "humantime_serde", default = "default_tick_delay")]
    pub tick_delay: Duration,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            tick_delay: default_tick_delay(),
        }
    }
}

/// Sequencer polling behaviour.
#[derive(Debug, Deserialize, Clone)]
pub struct SequencerSettings {
    /// Interval between step-completion polls.
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: Duration,

    /// Optional per-step ceiling. A step that never reaches its target
    /// status fails with a step-timeout error instead of blocking forever.
    /// Unset means the step blocks until the operator stops the run.
    #[serde(with = "humantime_serde", default)]
    pub step_timeout: Option<Duration>,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            step_timeout: None,
        }
    }
}

/// Results sink location.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Directory the timestamp-named result files are written to.
    pub default_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            default_path: "./data".to_string(),
        }
    }
}

/// Cryostat controller limits and presence.
#[derive(Debug, Deserialize, Clone)]
pub struct PpmsSettings {
    /// Magnet limit in Tesla; larger requests are clamped.
    #[serde(default = "default_max_field")]
    pub max_field_t: f64,
    /// Field sweep rate limit in Tesla per minute; larger requests are clamped.
    #[serde(default = "default_max_field_rate")]
    pub max_field_rate_t_per_min: f64,
}

impl Default for PpmsSettings {
    fn default() -> Self {
        Self {
            max_field_t: default_max_field(),
            max_field_rate_t_per_min: default_max_field_rate(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            acquisition: AcquisitionSettings::default(),
            sequencer: SequencerSettings::default(),
            storage: StorageSettings::default(),
            lockins: Vec::new(),
            ppms: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_tick_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_field() -> f64 {
    9.0
}

fn default_max_field_rate() -> f64 {
    1.0
}

impl Settings {
    /// Load settings from `config/<name>.toml` (default `config/default`).
    pub fn new(config_name: Option<&str>) -> AppResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(DaqError::Config)?;

        let settings: Settings = s.try_deserialize().map_err(DaqError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from an explicit file path.
    pub fn from_path(path: &str) -> AppResult<Self> {
        let s = Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(DaqError::Config)?;

        let settings: Settings = s.try_deserialize().map_err(DaqError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        if self.acquisition.tick_delay.is_zero() {
            return Err(DaqError::Configuration(
                "acquisition.tick_delay must be greater than zero".to_string(),
            ));
        }
        if self.sequencer.check_interval.is_zero() {
            return Err(DaqError::Configuration(
                "sequencer.check_interval must be greater than zero".to_string(),
            ));
        }
        if let Some(ppms) = &self.ppms {
            if ppms.max_field_t <= 0.0 || ppms.max_field_rate_t_per_min <= 0.0 {
                return Err(DaqError::Configuration(
                    "ppms limits must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_src = r#"
            [[lockins]]
            model = "dsp72xx"
            port = "/dev/ttyUSB0"

            [[lockins]]
            model = "dsp52xx"
            port = "/dev/ttyUSB1"

            [ppms]
        "#;
        let settings: Settings = toml::from_str(toml_src).unwrap();
        assert_eq!(settings.lockins.len(), 2);
        assert_eq!(settings.lockins[0].model, LockinModel::Dsp72xx);
        assert_eq!(settings.lockins[0].baud_rate, 9600);
        assert_eq!(settings.acquisition.tick_delay, Duration::from_millis(100));
        assert_eq!(
            settings.ppms.as_ref().map(|p| p.max_field_t),
            Some(9.0)
        );
    }

    #[test]
    fn parses_durations_and_timeout() {
        let toml_src = r#"
            [acquisition]
            tick_delay = "250ms"

            [sequencer]
            check_interval = "10s"
            step_timeout = "2h"
        "#;
        let settings: Settings = toml::from_str(toml_src).unwrap();
        assert_eq!(settings.acquisition.tick_delay, Duration::from_millis(250));
        assert_eq!(settings.sequencer.check_interval, Duration::from_secs(10));
        assert_eq!(
            settings.sequencer.step_timeout,
            Some(Duration::from_secs(7200))
        );
    }
}
