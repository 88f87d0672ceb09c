//! Signal Recovery DSP 72XX lock-in amplifier driver.
//!
//! Shares the 52XX command vocabulary (`SEN`, `TC`, `OA`, `OF`, `X`, `Y`,
//! `XY`, `MAG`) but responds promptly and cleanly, so no response scrubbing
//! or command pacing is needed. The 72XX ladder is considerably finer:
//! 27 sensitivity steps down to 2 nV and 30 time constants from 10 µs.
//!
//! Readings are integer codes of the 10000-count full scale, converted to
//! volts with `sensitivity / 10000`. Oscillator amplitude is continuous in
//! millivolt steps over the whole 0-5 V span, unlike the 52XX.

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
pub static TIME_CONSTANTS: [f64; 30] = [
    10.0e-6, 20.0e-6, 40.0e-6, 80.0e-6, 160.0e-6, 320.0e-6, 640.0e-6, //
    5.0e-3, 10.0e-3, 20.0e-3, 50.0e-3, 100.0e-3, 200.0e-3, 500.0e-3, //
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, //
    1.0e3, 2.0e3, 5.0e3, 10.0e3, 20.0e3, 50.0e3, 100.0e3,
];

/// Time-constant index the range controller switches to while chasing the
/// signal (100 ms).
const FAST_TC_INDEX: usize = 11;

/// Rear-panel DAC output limit in volts.
const DAC_RANGE: f64 = 12.0;

/// Signal Recovery DSP 72XX driver.
pub struct Dsp72xx<L: CommandLink> {
    name: String,
    link: Mutex<L>,
}

impl<L: CommandLink> Dsp72xx<L> {
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

    async fn ask_i64(&self, command: &str) -> AppResult<i64> {
        let response = self.ask(command).await?;
        response
            .parse::<i64>()
            .map_err(|_| DaqError::Parse(format!("'{response}' from {command} is not an integer")))
    }

    async fn ask_f64(&self, command: &str) -> AppResult<f64> {
        let response = self.ask(command).await?;
        response
            .parse::<f64>()
            .map_err(|_| DaqError::Parse(format!("'{response}' from {command} is not a number")))
    }

    fn split_pair(response: &str) -> AppResult<(&str, &str)> {
        response
            .split_once(',')
            .ok_or_else(|| DaqError::Parse(format!("expected 'a,b' pair, got '{response}'")))
    }

    /// Reference phase in degrees (reported in millidegrees).
    pub async fn phase(&self) -> AppResult<f64> {
        Ok(self.ask_f64("PHA").await? / 1000.0)
    }

    /// Rear-panel ADC input voltage in volts (reported in millivolts).
    pub async fn adc(&self, channel: u8) -> AppResult<f64> {
        if !(1..=4).contains(&channel) {
            return Err(DaqError::Range {
                quantity: "ADC channel",
                value: f64::from(channel),
                min: 1.0,
                max: 4.0,
            });
        }
        Ok(self.ask_f64(&format!("ADC {channel}")).await? / 1000.0)
    }

    /// Set the rear-panel DAC3 output in volts.
    pub async fn set_dac3(&self, volts: f64) -> AppResult<()> {
        let volts = ladder::strict_range("DAC3 output", volts, -DAC_RANGE, DAC_RANGE)?;
        self.command(&format!("DAC. 3 {volts}")).await
    }

    /// Set the rear-panel DAC4 output in volts.
    pub async fn set_dac4(&self, volts: f64) -> AppResult<()> {
        let volts = ladder::strict_range("DAC4 output", volts, -DAC_RANGE, DAC_RANGE)?;
        self.command(&format!("DAC. 4 {volts}")).await
    }

    /// Let the instrument pick its own sensitivity (front-panel Auto-Sen).
    pub async fn auto_sensitivity(&self) -> AppResult<()> {
        self.command("AS").await
    }

    /// Auto-phase: maximize X and null Y.
    pub async fn auto_phase(&self) -> AppResult<()> {
        self.command("AQN").await
    }
}

#[async_trait]
impl<L: CommandLink> Lockin for Dsp72xx<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> LockinModel {
        LockinModel::Dsp72xx
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
        self.command(&format!("SEN {index}")).await
    }

    async fn time_constant(&self) -> AppResult<f64> {
        let index = self.time_constant_index().await?;
        Ok(TIME_CONSTANTS[index])
    }

    async fn set_time_constant(&self, seconds: f64) -> AppResult<()> {
        let index = ladder::truncate_up(&TIME_CONSTANTS, seconds);
        self.command(&format!("TC {index}")).await
    }

    async fn oscillator_amplitude(&self) -> AppResult<f64> {
        Ok(self.ask_f64("OA").await? / 1000.0)
    }

    async fn set_oscillator_amplitude(&self, volts: f64) -> AppResult<()> {
        let volts = ladder::strict_range("oscillator amplitude", volts, 0.0, 5.0)?;
        let millivolts = (volts * 1000.0).round() as i64;
        self.command(&format!("OA {millivolts}")).await
    }

    async fn frequency(&self) -> AppResult<f64> {
        let response = self.ask("OF").await?;
        let (mantissa, band) = Self::split_pair(&response)?;
        let mantissa = mantissa
            .trim()
            .parse::<i64>()
            .map_err(|_| DaqError::Parse(format!("bad frequency mantissa in '{response}'")))?;
        let band = band
            .trim()
            .parse::<u8>()
            .map_err(|_| DaqError::Parse(format!("bad frequency band in '{response}'")))?;
        ladder::decode_frequency(mantissa, band)
    }

    async fn set_frequency(&self, hz: f64) -> AppResult<()> {
        let (mantissa, band) = ladder::encode_frequency(hz)?;
        self.command(&format!("OF {mantissa} {band}")).await
    }

    async fn x(&self) -> AppResult<f64> {
        let scaled = self.ask_f64("X").await?;
        Ok(scaled * self.sensitivity().await? / 10_000.0)
    }

    async fn y(&self) -> AppResult<f64> {
        let scaled = self.ask_f64("Y").await?;
        Ok(scaled * self.sensitivity().await? / 10_000.0)
    }

    async fn xy(&self) -> AppResult<(f64, f64)> {
        let response = self.ask("XY").await?;
        let (x, y) = Self::split_pair(&response)?;
        let scaled_x = x
            .trim()
            .parse::<f64>()
            .map_err(|_| DaqError::Parse(format!("bad X in '{response}'")))?;
        let scaled_y = y
            .trim()
            .parse::<f64>()
            .map_err(|_| DaqError::Parse(format!("bad Y in '{response}'")))?;
        let scale = self.sensitivity().await? / 10_000.0;
        Ok((scaled_x * scale, scaled_y * scale))
    }

    async fn magnitude(&self) -> AppResult<f64> {
        let scaled = self.ask_f64("MAG").await?;
        Ok(scaled * self.sensitivity().await? / 10_000.0)
    }

    async fn magnitude_raw(&self) -> AppResult<i64> {
        self.ask_i64("MAG").await
    }

    async fn sensitivity_index(&self) -> AppResult<usize> {
        let index = self.ask_i64("SEN").await?;
        ladder::check_index("sensitivity index", index as usize, SENSITIVITIES.len())
    }

    async fn set_sensitivity_index(&self, index: usize) -> AppResult<()> {
        let index = ladder::check_index("sensitivity index", index, SENSITIVITIES.len())?;
        self.command(&format!("SEN {index}")).await
    }

    async fn time_constant_index(&self) -> AppResult<usize> {
        let index = self.ask_i64("TC").await?;
        ladder::check_index("time constant index", index as usize, TIME_CONSTANTS.len())
    }

    async fn set_time_constant_index(&self, index: usize) -> AppResult<()> {
        let index = ladder::check_index("time constant index", index, TIME_CONSTANTS.len())?;
        self.command(&format!("TC {index}")).await
    }

    async fn shutdown(&self) -> AppResult<()> {
        info!("Shutting down {}", self.name);
        self.command("OA 0").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLink;

    fn driver(link: &MockLink) -> Dsp72xx<MockLink> {
        Dsp72xx::new("lockin-1", link.clone())
    }

    #[test]
    fn fast_time_constant_is_100ms() {
        assert!((TIME_CONSTANTS[FAST_TC_INDEX] - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn sensitivity_setter_truncates_up() {
        let link = MockLink::new();
        let dev = driver(&link);
        // 3 mV requested -> 5 mV (index 19)
        dev.set_sensitivity(3.0e-3).await.unwrap();
        assert_eq!(link.sent(), vec!["SEN 19"]);
    }

    #[tokio::test]
    async fn amplitude_is_continuous_in_millivolts() {
        let link = MockLink::new();
        let dev = driver(&link);
        dev.set_oscillator_amplitude(3.0).await.unwrap();
        dev.set_oscillator_amplitude(0.1234).await.unwrap();
        assert_eq!(link.sent(), vec!["OA 3000", "OA 123"]);
    }

    #[tokio::test]
    async fn dac_outputs_use_floating_point_commands() {
        let link = MockLink::new();
        let dev = driver(&link);
        dev.set_dac3(-1.5).await.unwrap();
        assert_eq!(link.sent(), vec!["DAC. 3 -1.5"]);
        assert!(dev.set_dac4(12.5).await.is_err());
    }

    #[tokio::test]
    async fn magnitude_raw_is_unscaled() {
        let link = MockLink::with_responses(["9500"]);
        let dev = driver(&link);
        assert_eq!(dev.magnitude_raw().await.unwrap(), 9500);
    }
}
