//! Lock-in amplifier device models.
//!
//! Each supported model gets a concrete driver speaking its own command
//! dialect; all of them sit behind the [`Lockin`] capability trait so the
//! acquisition loop and the range controller never dispatch on a model
//! name. The capability set covers sensitivity, time constant, oscillator
//! control and X/Y readout, plus the raw-code operations the range
//! controller works in.
//!
//! Register invariant: sensitivity and time-constant indices always index
//! validly into their ladders. Setters truncate a requested physical value
//! up to the nearest supported ladder entry before writing, and the
//! index-level setters reject out-of-ladder writes.

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod autorange;
pub mod dsp52xx;
pub mod dsp72xx;
pub mod ladder;
pub mod sr830;

pub use autorange::{auto_range, AutoRangeOutcome};
pub use dsp52xx::Dsp52xx;
pub use dsp72xx::Dsp72xx;
pub use sr830::Sr830;

/// Supported lock-in amplifier models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockinModel {
    /// Stanford Research Systems SR830.
    Sr830,
    /// Signal Recovery DSP 72XX series.
    Dsp72xx,
    /// Signal Recovery DSP 52XX series (slow, unbuffered responder).
    Dsp52xx,
}

impl fmt::Display for LockinModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockinModel::Sr830 => write!(f, "SR830"),
            LockinModel::Dsp72xx => write!(f, "DSP72XX"),
            LockinModel::Dsp52xx => write!(f, "DSP52XX"),
        }
    }
}

/// One complete reading of a lock-in, in physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// In-phase component in volts.
    pub x: f64,
    /// Quadrature component in volts.
    pub y: f64,
    /// Signal magnitude in volts.
    pub magnitude: f64,
    /// Oscillator frequency in hertz.
    pub frequency: f64,
    /// Oscillator amplitude in volts.
    pub oscillator_amplitude: f64,
}

/// Per-model auto-range behaviour.
///
/// Raw-code thresholds are fractions of the 10000-count full scale: the
/// loop drives the magnitude into `[low, high]`, but only engages at all
/// when the magnitude leaves `[trigger_low, high]` (one model family uses a
/// wider engage band than its adjust band).
#[derive(Debug, Clone, Copy)]
pub struct RangePolicy {
    /// Magnitude below this (raw counts) engages the controller.
    pub trigger_low: i64,
    /// Lower adjust bound in raw counts.
    pub low: i64,
    /// Upper adjust/engage bound in raw counts.
    pub high: i64,
    /// Fast time-constant index used while chasing the signal.
    pub fast_tc_index: usize,
    /// Settle time between sensitivity steps.
    pub step_settle: Duration,
    /// Settle time after the measurement time constant is restored.
    pub final_settle: Duration,
}

/// Capability interface over one lock-in amplifier.
///
/// Implementations serialize all commands on the device's single physical
/// channel internally; concurrent range adjustment against the same device
/// must still be serialized by the caller.
#[async_trait]
pub trait Lockin: Send + Sync {
    /// Configured instrument name (used for logging and column labels).
    fn name(&self) -> &str;

    /// The device model.
    fn model(&self) -> LockinModel;

    /// Whether acquisition rows carry frequency / oscillator amplitude
    /// columns for this device.
    fn has_oscillator_columns(&self) -> bool;

    /// The model's auto-range thresholds and settle times.
    fn range_policy(&self) -> RangePolicy;

    /// The model's sensitivity ladder in volts, most sensitive first.
    fn sensitivity_ladder(&self) -> &'static [f64];

    /// Full-scale sensitivity in volts.
    async fn sensitivity(&self) -> AppResult<f64>;

    /// Set the sensitivity to the smallest ladder entry at or above `volts`.
    async fn set_sensitivity(&self, volts: f64) -> AppResult<()>;

    /// Filter time constant in seconds.
    async fn time_constant(&self) -> AppResult<f64>;

    /// Set the time constant to the smallest ladder entry at or above `seconds`.
    async fn set_time_constant(&self, seconds: f64) -> AppResult<()>;

    /// Oscillator amplitude in volts.
    async fn oscillator_amplitude(&self) -> AppResult<f64>;

    /// Set the oscillator amplitude in volts.
    async fn set_oscillator_amplitude(&self, volts: f64) -> AppResult<()>;

    /// Oscillator frequency in hertz.
    async fn frequency(&self) -> AppResult<f64>;

    /// Set the oscillator frequency in hertz.
    async fn set_frequency(&self, hz: f64) -> AppResult<()>;

    /// X channel in volts.
    async fn x(&self) -> AppResult<f64>;

    /// Y channel in volts.
    async fn y(&self) -> AppResult<f64>;

    /// X and Y in volts from a single round trip.
    async fn xy(&self) -> AppResult<(f64, f64)>;

    /// Signal magnitude in volts.
    async fn magnitude(&self) -> AppResult<f64>;

    /// Signal magnitude in raw counts of the 10000-count full scale.
    async fn magnitude_raw(&self) -> AppResult<i64>;

    /// Current sensitivity ladder index.
    async fn sensitivity_index(&self) -> AppResult<usize>;

    /// Write a sensitivity ladder index directly.
    async fn set_sensitivity_index(&self, index: usize) -> AppResult<()>;

    /// Current time-constant ladder index.
    async fn time_constant_index(&self) -> AppResult<usize>;

    /// Write a time-constant ladder index directly.
    async fn set_time_constant_index(&self, index: usize) -> AppResult<()>;

    /// Safely park the instrument (oscillator amplitude to its minimum).
    async fn shutdown(&self) -> AppResult<()>;

    /// Take one complete reading in physical units.
    async fn reading(&self) -> AppResult<Reading> {
        let (x, y) = self.xy().await?;
        Ok(Reading {
            x,
            y,
            magnitude: self.magnitude().await?,
            frequency: self.frequency().await?,
            oscillator_amplitude: self.oscillator_amplitude().await?,
        })
    }
}
