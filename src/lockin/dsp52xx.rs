//! Signal Recovery DSP 52XX lock-in amplifier driver.
//!
//! The 52XX is the slow member of the family: it keeps no command buffer
//! and takes a long time to compose replies, so its link must be configured
//! with a generous read timeout (12 s) and ~100 ms of pacing between
//! commands. Responses occasionally carry a stray NUL byte, which this
//! driver strips before parsing.
//!
//! All readings come back as integer codes of the 10000-count full scale
//! and are converted to volts by multiplying with `sensitivity / 10000`.
//! Phase and ADC channels report milli-units instead and are divided by
//! 1000.

use crate::error::{AppResult, DaqError};
use crate::link::CommandLink;
use crate::lockin::ladder;
use crate::lockin::{Lockin, LockinModel, RangePolicy};
use async_trait::async_trait;
use log::info;
use std::time::Duration;
use tokio::sync::Mutex;

/// Full-scale sensitivity settings in volts, register index order.
pub static SENSITIVITIES: [f64; 16] = [
    100.0e-9, //
    300.0e-9, 1.0e-6, 3.0e-6, 10.0e-6, //
    30.0e-6, 100.0e-6, 300.0e-6, 1.0e-3, //
    3.0e-3, 10.0e-3, 30.0e-3, 100.0e-3, //
    300.0e-3, 1.0, 3.0,
];

/// Filter time constants in seconds, register index order.
pub static TIME_CONSTANTS: [f64; 14] = [
    1.0e-3, 3.0e-3, 10.0e-3, 30.0e-3, 100.0e-3, //
    300.0e-3, 1.0, 3.0, 10.0, 30.0, //
    100.0, 300.0, 1.0e3, 3.0e3,
];

/// Time-constant index the range controller switches to while chasing the
/// signal (100 ms).
const FAST_TC_INDEX: usize = 4;

/// Signal Recovery DSP 52XX driver.
pub struct Dsp52xx<L: CommandLink> {
    name: String,
    link: Mutex<L>,
}

impl<L: CommandLink> Dsp52xx<L> {
    /// Create a driver over a configured link.
    ///
    /// The link should carry a 12 s read timeout plus 100 ms query delay and
    /// command gap; the instrument will otherwise miss or garble queries.
    pub fn new(name: impl Into<String>, link: L) -> Self {
        Self {
            name: name.into(),
            link: Mutex::new(link),
        }
    }

    async fn command(&self, command: &str) -> AppResult<()> {
        self.link.lock().await.write(command).await
    }

    /// Query and scrub the response of the stray NUL bytes this model emits.
    async fn ask(&self, command: &str) -> AppResult<String> {
        let response = self.link.lock().await.query(command).await?;
        Ok(response.replace('\0', "").trim().to_string())
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

    /// Split a comma-delimited two-field response at the first comma.
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
impl<L: CommandLink> Lockin for Dsp52xx<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> LockinModel {
        LockinModel::Dsp52xx
    }

    fn has_oscillator_columns(&self) -> bool {
        false
    }

    fn range_policy(&self) -> RangePolicy {
        RangePolicy {
            trigger_low: 2_000,
            low: 1_000,
            high: 9_000,
            fast_tc_index: FAST_TC_INDEX,
            step_settle: Duration::from_secs(1),
            final_settle: Duration::from_secs(10),
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
        // No continuous amplitude above 2 V on this model: only the 2000 and
        // 5000 mV codes exist up there.
        let millivolts = if volts > 3.5 {
            5_000
        } else if volts > 2.0 {
            2_000
        } else {
            (volts * 1000.0).round() as i64
        };
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

    fn driver(link: &MockLink) -> Dsp52xx<MockLink> {
        Dsp52xx::new("lockin-1", link.clone())
    }

    #[tokio::test]
    async fn sensitivity_setter_truncates_up() {
        let link = MockLink::new();
        let dev = driver(&link);
        // 2 mV requested -> 3 mV (index 9)
        dev.set_sensitivity(2.0e-3).await.unwrap();
        // exact entry is idempotent
        dev.set_sensitivity(3.0e-3).await.unwrap();
        assert_eq!(link.sent(), vec!["SEN 9", "SEN 9"]);
    }

    #[tokio::test]
    async fn responses_are_scrubbed_of_nul_bytes() {
        let link = MockLink::with_responses(["\u{0}12"]);
        let dev = driver(&link);
        assert_eq!(dev.sensitivity_index().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn readings_scale_by_sensitivity_over_10000() {
        // X response 5000 counts at 10 mV full scale -> 5 mV
        let link = MockLink::with_responses(["5000", "10"]);
        let dev = driver(&link);
        let x = dev.x().await.unwrap();
        assert!((x - 5.0e-3).abs() < 1e-12);
        assert_eq!(link.sent(), vec!["X", "SEN"]);
    }

    #[tokio::test]
    async fn xy_is_a_single_round_trip_pair() {
        let link = MockLink::with_responses(["4000,3000", "10"]);
        let dev = driver(&link);
        let (x, y) = dev.xy().await.unwrap();
        assert!((x - 4.0e-3).abs() < 1e-12);
        assert!((y - 3.0e-3).abs() < 1e-12);
    }

    #[tokio::test]
    async fn amplitude_codes_above_two_volts_are_discrete() {
        let link = MockLink::new();
        let dev = driver(&link);
        dev.set_oscillator_amplitude(0.5).await.unwrap();
        dev.set_oscillator_amplitude(3.0).await.unwrap();
        dev.set_oscillator_amplitude(4.0).await.unwrap();
        assert_eq!(link.sent(), vec!["OA 500", "OA 2000", "OA 5000"]);
        assert!(dev.set_oscillator_amplitude(5.5).await.is_err());
    }

    #[tokio::test]
    async fn frequency_encodes_mantissa_and_band() {
        let link = MockLink::with_responses(["15000,1"]);
        let dev = driver(&link);
        dev.set_frequency(150.0).await.unwrap();
        assert_eq!(link.sent(), vec!["OF 15000 2"]);
        assert!((dev.frequency().await.unwrap() - 15.0).abs() < 1e-9);
        assert!(dev.set_frequency(0.4).await.is_err());
    }

    #[tokio::test]
    async fn index_writes_outside_the_ladder_are_rejected() {
        let link = MockLink::new();
        let dev = driver(&link);
        assert!(dev.set_sensitivity_index(16).await.is_err());
        assert!(dev.set_time_constant_index(14).await.is_err());
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn phase_and_adc_use_milli_unit_scaling() {
        let link = MockLink::with_responses(["36870", "1500"]);
        let dev = driver(&link);
        assert!((dev.phase().await.unwrap() - 36.87).abs() < 1e-9);
        assert!((dev.adc(2).await.unwrap() - 1.5).abs() < 1e-9);
        assert_eq!(link.sent(), vec!["PHA", "ADC 2"]);
        assert!(dev.adc(5).await.is_err());
    }

    #[tokio::test]
    async fn reading_gathers_all_channels_in_physical_units() {
        // 10 mV full scale (index 10): X/Y/MAG raw counts scale by 1e-6.
        let link =
            MockLink::with_responses(["4000,3000", "10", "5000", "10", "1370,2", "1000"]);
        let dev = driver(&link);
        let reading = dev.reading().await.unwrap();
        assert!((reading.x - 4.0e-3).abs() < 1e-12);
        assert!((reading.y - 3.0e-3).abs() < 1e-12);
        assert!((reading.magnitude - 5.0e-3).abs() < 1e-12);
        assert!((reading.frequency - 13.7).abs() < 1e-9);
        assert!((reading.oscillator_amplitude - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn shutdown_parks_the_oscillator() {
        let link = MockLink::new();
        let dev = driver(&link);
        dev.shutdown().await.unwrap();
        assert_eq!(link.sent(), vec!["OA 0"]);
    }
}
