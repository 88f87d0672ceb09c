//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur,
//! from configuration and I/O issues to instrument-specific problems.
//!
//! ## Error Hierarchy
//!
//! - **`Config` / `Configuration`**: file parsing errors from the `config`
//!   crate, and semantic errors caught during validation.
//! - **`Io` / `Storage`**: file and results-sink failures.
//! - **`Transport`**: no response or a broken link while talking to an
//!   instrument. These are never recovered locally; they abort the current
//!   acquisition tick or sequence step and are surfaced to the operator.
//! - **`Parse`**: a response arrived but could not be interpreted.
//! - **`Range`**: a requested value lies outside the physically valid range
//!   for the target register. The write is rejected before anything is sent.
//! - **`Saturation`**: the range controller ran into an end of the
//!   sensitivity ladder and the signal is still out of bounds.
//! - **`StepTimeout`**: a sequence step never reached its target status
//!   within the configured ceiling (only when a ceiling is configured).
//!
//! By using `#[from]`, `DaqError` can be seamlessly created from underlying
//! error types, simplifying error handling with the `?` operator.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Which end of the sensitivity ladder the range controller ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderEnd {
    /// Index 0: the smallest full-scale range.
    MostSensitive,
    /// The last index: the largest full-scale range.
    LeastSensitive,
}

impl fmt::Display for LadderEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LadderEnd::MostSensitive => write!(f, "most sensitive"),
            LadderEnd::LeastSensitive => write!(f, "least sensitive"),
        }
    }
}

/// The application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying file or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The command link failed (no response, broken port, timeout).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A response arrived but could not be interpreted.
    #[error("Malformed instrument response: {0}")]
    Parse(String),

    /// A requested value lies outside the physically valid range.
    #[error("Value {value} for {quantity} outside valid range [{min}, {max}]")]
    Range {
        /// Human-readable name of the register or quantity.
        quantity: &'static str,
        /// The rejected value.
        value: f64,
        /// Lower bound of the valid range.
        min: f64,
        /// Upper bound of the valid range.
        max: f64,
    },

    /// The range controller hit a ladder end with the signal still out of bounds.
    #[error("Auto-range saturated at the {at} end of the sensitivity ladder (magnitude {magnitude} raw)")]
    Saturation {
        /// Which ladder end was hit.
        at: LadderEnd,
        /// Last raw-code magnitude observed.
        magnitude: i64,
    },

    /// A sequence step never reached its target status within the ceiling.
    #[error("Step '{step}' did not reach status '{target}' within {} s", .timeout.as_secs())]
    StepTimeout {
        /// Label of the step that timed out.
        step: String,
        /// Status string the step was waiting for.
        target: String,
        /// The configured ceiling.
        timeout: Duration,
    },

    /// Results sink failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serial link was used before being connected.
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// Serial support compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// A compile-time feature gate is required for this operation.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// A general instrument-level failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The background sequence worker died.
    #[error("Sequence worker failed: {0}")]
    Worker(String),
}
