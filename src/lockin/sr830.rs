//! Stanford Research Systems SR830 lock-in amplifier driver.
//!
//! The SR830 speaks a different dialect from the Signal Recovery family:
//! sensitivity and time constant are still register indices (`SENS`,
//! `OFLT`), but outputs come back as floating-point volts (`OUTP?`,
//! `SNAP?`), the reference frequency is a plain float (`FREQ`) and the
//! sine output amplitude is continuous (`SLVL`). No raw-code scaling is
//! applied to readings; the range controller derives raw counts from the
//! reported magnitude and the current full scale.

use crate::error::{AppResult, DaqError};
use crate::link::CommandLink;
use crate::lockin::ladder;
use crate::lockin::{Lockin, LockinModel, RangePolicy};
use async_trait::async_trait;
use log::info;
use std::time::Duration;
use tokio::sync::Mutex;

/// Full-scale sensitivity settings in volts, register index order.
pub static SENSITIVITIES: [f64; 27] = [
    2.0e-9, 5.0e-9, 10.0e-9, 20.0e-9, 50.0e-9, 100.0e-9, 200.0e-9, 500.0e-9, //
    1.0e-6, 2.0e-6, 5.0e-6, 10.0e-6, 20.0e-6, 50.0e-6, 100.0e-6, 200.0e-6, 500.0e-6, //
    1.0e-3, 2.0e-3, 5.0e-3, 10.0e-3, 20.0e-3, 50.0e-3, 100.0e-3, 200.0e-3, 500.0e-3, //
    1.0,
];

/// Filter time constants in seconds, register index order.
pub static TIME_CONSTANTS: [f64; 20] = [
    10.0e-6, 30.0e-6, 100.0e-6, 300.0e-6, 1.0e-3, 3.0e-3, 10.0e-3, 30.0e-3, //
    100.0e-3, 300.0e-3, 1.0, 3.0, 10.0, 30.0, 100.0, 300.0, //
    1.0e3, 3.0e3, 10.0e3, 30.0e3,
];

/// Time-constant index the range controller switches to while chasing the
/// signal (100 ms).
const FAST_TC_INDEX: usize = 8;

/// Sine output amplitude limits in volts.
const AMPLITUDE_RANGE: (f64, f64) = (0.004, 5.0);

/// Reference frequency limits in hertz.
const FREQUENCY_RANGE: (f64, f64) = (0.001, 102_000.0);

/// Stanford Research SR830 driver.
pub struct Sr830<L: CommandLink> {
    name: String,
    link: Mutex<L>,
}

impl<L: CommandLink> Sr830<L> {
    /// Create a driver over a configured link.
    pub fn new(name: impl Into<String>, link: L) -> Self {
        Self {
            name: name.into(),
            link: Mutex::new(link),
        }
    }

    async fn command(&self, command: &str) -> AppResult<()> {
        self.link.lock().await.write(command).await
    }

    async fn ask(&self, command: &str) -> AppResult<String> {
        let response = self.link.lock().await.query(command).await?;
        Ok(response.trim().to_string())
    }

    async fn ask_f64(&self, command: &str) -> AppResult<f64> {
        let response = self.ask(command).await?;
        response
            .parse::<f64>()
            .map_err(|_| DaqError::Parse(format!("'{response}' from {command} is not a number")))
    }

    async fn ask_index(&self, command: &str) -> AppResult<usize> {
        let response = self.ask(command).await?;
        response
            .parse::<usize>()
            .map_err(|_| DaqError::Parse(format!("'{response}' from {command} is not an index")))
    }

    /// Reference phase in degrees.
    pub async fn phase(&self) -> AppResult<f64> {
        self.ask_f64("PHAS?").await
    }
}

#[async_trait]
impl<L: CommandLink> Lockin for Sr830<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> LockinModel {
        LockinModel::Sr830
    }

    fn has_oscillator_columns(&self) -> bool {
        true
    }

    fn range_policy(&self) -> RangePolicy {
        RangePolicy {
            trigger_low: 1_000,
            low: 1_000,
            high: 9_000,
            fast_tc_index: FAST_TC_INDEX,
            step_settle: Duration::from_secs(1),
            final_settle: Duration::from_secs(5),
        }
    }

    fn sensitivity_ladder(&self) -> &'static [f64] {
        &SENSITIVITIES
    }

    async fn sensitivity(&self) -> AppResult<f64> {
        let index = self.sensitivity_index().await?;
        Ok(SENSITIVITIES[index])
    }

    async fn set_sensitivity(&self, volts: f64) -> AppResult<()> {
        let index = ladder::truncate_up(&SENSITIVITIES, volts);
        self.command(&format!("SENS {index}")).await
    }

    async fn time_constant(&self) -> AppResult<f64> {
        let index = self.time_constant_index().await?;
        Ok(TIME_CONSTANTS[index])
    }

    async fn set_time_constant(&self, seconds: f64) -> AppResult<()> {
        let index = ladder::truncate_up(&TIME_CONSTANTS, seconds);
        self.command(&format!("OFLT {index}")).await
    }

    async fn oscillator_amplitude(&self) -> AppResult<f64> {
        self.ask_f64("SLVL?").await
    }

    async fn set_oscillator_amplitude(&self, volts: f64) -> AppResult<()> {
        // Continuous output; out-of-range requests clamp to the supported span.
        let volts = volts.clamp(AMPLITUDE_RANGE.0, AMPLITUDE_RANGE.1);
        self.command(&format!("SLVL {volts}")).await
    }

    async fn frequency(&self) -> AppResult<f64> {
        self.ask_f64("FREQ?").await
    }

    async fn set_frequency(&self, hz: f64) -> AppResult<()> {
        let hz = ladder::strict_range(
            "reference frequency",
            hz,
            FREQUENCY_RANGE.0,
            FREQUENCY_RANGE.1,
        )?;
        self.command(&format!("FREQ {hz}")).await
    }

    async fn x(&self) -> AppResult<f64> {
        self.ask_f64("OUTP? 1").await
    }

    async fn y(&self) -> AppResult<f64> {
        self.ask_f64("OUTP? 2").await
    }

    async fn xy(&self) -> AppResult<(f64, f64)> {
        let response = self.ask("SNAP? 1,2").await?;
        let (x, y) = response
            .split_once(',')
            .ok_or_else(|| DaqError::Parse(format!("expected 'x,y' pair, got '{response}'")))?;
        let x = x
            .trim()
            .parse::<f64>()
            .map_err(|_| DaqError::Parse(format!("bad X in '{response}'")))?;
        let y = y
            .trim()
            .parse::<f64>()
            .map_err(|_| DaqError::Parse(format!("bad Y in '{response}'")))?;
        Ok((x, y))
    }

    async fn magnitude(&self) -> AppResult<f64> {
        self.ask_f64("OUTP? 3").await
    }

    async fn magnitude_raw(&self) -> AppResult<i64> {
        // The SR830 reports volts; express the magnitude in counts of the
        // current full scale so the range controller sees one unit system.
        let magnitude = self.magnitude().await?;
        let sensitivity = self.sensitivity().await?;
        Ok((magnitude / sensitivity * 10_000.0).round() as i64)
    }

    async fn sensitivity_index(&self) -> AppResult<usize> {
        let index = self.ask_index("SENS?").await?;
        ladder::check_index("sensitivity index", index, SENSITIVITIES.len())
    }

    async fn set_sensitivity_index(&self, index: usize) -> AppResult<()> {
        let index = ladder::check_index("sensitivity index", index, SENSITIVITIES.len())?;
        self.command(&format!("SENS {index}")).await
    }

    async fn time_constant_index(&self) -> AppResult<usize> {
        let index = self.ask_index("OFLT?").await?;
        ladder::check_index("time constant index", index, TIME_CONSTANTS.len())
    }

    async fn set_time_constant_index(&self, index: usize) -> AppResult<()> {
        let index = ladder::check_index("time constant index", index, TIME_CONSTANTS.len())?;
        self.command(&format!("OFLT {index}")).await
    }

    async fn shutdown(&self) -> AppResult<()> {
        info!("Shutting down {}", self.name);
        self.command(&format!("SLVL {}", AMPLITUDE_RANGE.0)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLink;

    fn driver(link: &MockLink) -> Sr830<MockLink> {
        Sr830::new("lockin-1", link.clone())
    }

    #[tokio::test]
    async fn sensitivity_setter_truncates_up() {
        let link = MockLink::new();
        let dev = driver(&link);
        // 3 mV requested -> 5 mV (index 19)
        dev.set_sensitivity(3.0e-3).await.unwrap();
        assert_eq!(link.sent(), vec!["SENS 19"]);
    }

    #[tokio::test]
    async fn outputs_are_volt_native() {
        let link = MockLink::with_responses(["4.57e-5"]);
        let dev = driver(&link);
        let x = dev.x().await.unwrap();
        assert!((x - 4.57e-5).abs() < 1e-12);
        assert_eq!(link.sent(), vec!["OUTP? 1"]);
    }

    #[tokio::test]
    async fn magnitude_raw_derives_counts_from_full_scale() {
        // 0.5 mV magnitude at 1 mV full scale -> 5000 counts
        let link = MockLink::with_responses(["5e-4", "17"]);
        let dev = driver(&link);
        assert_eq!(dev.magnitude_raw().await.unwrap(), 5_000);
    }

    #[tokio::test]
    async fn amplitude_clamps_to_supported_span() {
        let link = MockLink::new();
        let dev = driver(&link);
        dev.set_oscillator_amplitude(9.0).await.unwrap();
        dev.set_oscillator_amplitude(0.0).await.unwrap();
        assert_eq!(link.sent(), vec!["SLVL 5", "SLVL 0.004"]);
    }

    #[tokio::test]
    async fn frequency_is_validated_strictly() {
        let link = MockLink::new();
        let dev = driver(&link);
        dev.set_frequency(1000.0).await.unwrap();
        assert_eq!(link.sent(), vec!["FREQ 1000"]);
        assert!(dev.set_frequency(150_000.0).await.is_err());
    }
}
