//! Cryostat/magnet controller (PPMS) device model.
//!
//! The vendor SDK is an external collaborator: everything it exposes sits
//! behind the [`PpmsClient`] trait, which the rest of the system consumes.
//! [`Ppms`] wraps a client with the unit conversions and safety clamps the
//! instrument expects (Tesla to Oersted, Tesla/minute to Oersted/second,
//! magnet and sweep-rate limits) and exposes the status strings the
//! sequencer polls.

use crate::config::PpmsSettings;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use log::info;

pub mod mock;

pub use mock::MockPpms;

/// Temperature approach modes understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureApproach {
    /// Drive straight to the setpoint and settle fast.
    FastSettle,
    /// Approach from below without overshoot.
    NoOvershoot,
}

/// Field approach modes understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldApproach {
    /// Linear ramp to the setpoint.
    Linear,
    /// Approach without overshoot.
    NoOvershoot,
    /// Oscillate around the setpoint to minimize remanence.
    Oscillate,
}

/// Whether the magnet is left driven or switched to persistent mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrivenMode {
    /// Power supply stays connected.
    Driven,
    /// Persistent switch closes once the field is reached.
    Persistent,
}

/// Chamber operations, in controller menu order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChamberMode {
    /// Seal the chamber.
    Seal,
    /// Purge with helium, then seal.
    PurgeSeal,
    /// Vent to atmosphere, then seal.
    VentSeal,
    /// Pump continuously.
    PumpContinuous,
    /// Vent continuously.
    VentContinuous,
    /// Pump to high vacuum.
    HighVacuum,
}

/// The opaque vendor client for the controller.
///
/// Temperatures are Kelvin; fields are Oersted; field rates are Oersted per
/// second. Status strings come back verbatim from the controller (e.g.
/// `"Stable"`, `"Driven mode stable"`, `"Standby"`).
#[async_trait]
pub trait PpmsClient: Send + Sync {
    /// Temperature in Kelvin plus its status string.
    async fn get_temperature(&self) -> AppResult<(f64, String)>;

    /// Command a temperature ramp.
    async fn set_temperature(
        &self,
        kelvin: f64,
        rate_k_per_min: f64,
        approach: TemperatureApproach,
    ) -> AppResult<()>;

    /// Field in Oersted plus its status string.
    async fn get_field(&self) -> AppResult<(f64, String)>;

    /// Command a field ramp.
    async fn set_field(
        &self,
        oersted: f64,
        oersted_per_sec: f64,
        approach: FieldApproach,
        mode: DrivenMode,
    ) -> AppResult<()>;

    /// Chamber status string.
    async fn get_chamber(&self) -> AppResult<String>;

    /// Command a chamber operation.
    async fn set_chamber(&self, mode: ChamberMode) -> AppResult<()>;

    /// Bridge resistance in ohms plus its standard error, by channel (1-4).
    async fn get_resistance(&self, channel: u8) -> AppResult<(f64, f64)>;

    /// Configure a resistance bridge channel.
    async fn bridge_setup(
        &self,
        channel: u8,
        excitation_ua: f64,
        power_uw: f64,
        voltage_limit_mv: f64,
    ) -> AppResult<()>;

    /// Shut the system down leaving the pot in operation.
    async fn shutdown_potops(&self) -> AppResult<()>;

    /// Shut the system down in continuous cooling mode.
    async fn shutdown_continuous(&self) -> AppResult<()>;

    /// Abort any temperature or field command in progress.
    async fn abort(&self) -> AppResult<()>;
}

/// Bridge excitation limit in microamps.
const BRIDGE_MAX_EXCITATION_UA: f64 = 5_000.0;
/// Bridge power limit in microwatts.
const BRIDGE_MAX_POWER_UW: f64 = 1_000.0;
/// Bridge voltage limit handed to the controller, in millivolts.
const BRIDGE_VOLTAGE_LIMIT_MV: f64 = 1_000.0;

/// Controller device: a client plus unit conversion and limits.
pub struct Ppms {
    client: Box<dyn PpmsClient>,
    max_field_t: f64,
    max_field_rate_t_per_min: f64,
}

impl Ppms {
    /// Wrap a client with the configured magnet limits.
    pub fn new(client: Box<dyn PpmsClient>, settings: &PpmsSettings) -> Self {
        Self {
            client,
            max_field_t: settings.max_field_t,
            max_field_rate_t_per_min: settings.max_field_rate_t_per_min,
        }
    }

    /// Temperature in Kelvin.
    pub async fn temperature(&self) -> AppResult<f64> {
        Ok(self.client.get_temperature().await?.0)
    }

    /// Temperature status string.
    pub async fn temperature_status(&self) -> AppResult<String> {
        Ok(self.client.get_temperature().await?.1)
    }

    /// Field in Tesla.
    pub async fn field(&self) -> AppResult<f64> {
        Ok(self.client.get_field().await?.0 / 10_000.0)
    }

    /// Magnet status string.
    pub async fn magnet_status(&self) -> AppResult<String> {
        Ok(self.client.get_field().await?.1)
    }

    /// Ramp the temperature in fast-settle mode.
    ///
    /// `kelvin` is the setpoint, `rate` in Kelvin per minute.
    pub async fn set_temperature(&self, kelvin: f64, rate: f64) -> AppResult<()> {
        self.client
            .set_temperature(kelvin, rate, TemperatureApproach::FastSettle)
            .await
    }

    /// Ramp the field with a linear approach, leaving the magnet driven.
    ///
    /// `tesla` is the setpoint, `rate` in Tesla per minute; both clamp to
    /// the configured limits with their sign preserved.
    pub async fn set_field_driven(&self, tesla: f64, rate: f64) -> AppResult<()> {
        self.client
            .set_field(
                self.scaled_field(tesla),
                self.scaled_rate(rate),
                FieldApproach::Linear,
                DrivenMode::Driven,
            )
            .await
    }

    /// Ramp the field with a linear approach, ending in persistent mode.
    pub async fn set_field_persistent(&self, tesla: f64, rate: f64) -> AppResult<()> {
        self.client
            .set_field(
                self.scaled_field(tesla),
                self.scaled_rate(rate),
                FieldApproach::Linear,
                DrivenMode::Persistent,
            )
            .await
    }

    /// Clamp to the magnet limit and convert Tesla to Oersted.
    fn scaled_field(&self, tesla: f64) -> f64 {
        let sign = tesla.signum();
        sign * tesla.abs().min(self.max_field_t) * 10_000.0
    }

    /// Clamp to the rate limit and convert T/min to Oe/s, rounded to 2 d.p.
    fn scaled_rate(&self, rate: f64) -> f64 {
        let sign = rate.signum();
        let oe_per_sec = rate.abs().min(self.max_field_rate_t_per_min) * 10_000.0 / 60.0;
        sign * (oe_per_sec * 100.0).round() / 100.0
    }

    /// Chamber status string.
    pub async fn chamber(&self) -> AppResult<String> {
        self.client.get_chamber().await
    }

    /// Command a chamber operation.
    pub async fn set_chamber(&self, mode: ChamberMode) -> AppResult<()> {
        self.client.set_chamber(mode).await
    }

    /// Bridge resistance in ohms for channels 1-4.
    pub async fn bridge(&self, channel: u8) -> AppResult<f64> {
        check_bridge_channel(channel)?;
        Ok(self.client.get_resistance(channel).await?.0)
    }

    /// Configure a bridge channel for AC excitation in standard mode.
    ///
    /// `excitation_ua` up to 5000 µA, `power_uw` up to 1000 µW.
    pub async fn set_bridge(&self, channel: u8, excitation_ua: f64, power_uw: f64) -> AppResult<()> {
        check_bridge_channel(channel)?;
        if !(0.0..=BRIDGE_MAX_EXCITATION_UA).contains(&excitation_ua) {
            return Err(DaqError::Range {
                quantity: "bridge excitation",
                value: excitation_ua,
                min: 0.0,
                max: BRIDGE_MAX_EXCITATION_UA,
            });
        }
        if !(0.0..=BRIDGE_MAX_POWER_UW).contains(&power_uw) {
            return Err(DaqError::Range {
                quantity: "bridge power",
                value: power_uw,
                min: 0.0,
                max: BRIDGE_MAX_POWER_UW,
            });
        }
        self.client
            .bridge_setup(channel, excitation_ua, power_uw, BRIDGE_VOLTAGE_LIMIT_MV)
            .await
    }

    /// Shut the system down leaving the pot in operation.
    pub async fn shutdown_potops(&self) -> AppResult<()> {
        info!("Commanding shutdown (PotOps mode)");
        self.client.shutdown_potops().await
    }

    /// Shut the system down in continuous cooling mode.
    pub async fn shutdown_continuous(&self) -> AppResult<()> {
        info!("Commanding shutdown (continuous mode)");
        self.client.shutdown_continuous().await
    }

    /// Abort any temperature or field command in progress.
    pub async fn abort(&self) -> AppResult<()> {
        self.client.abort().await
    }
}

fn check_bridge_channel(channel: u8) -> AppResult<()> {
    if !(1..=4).contains(&channel) {
        return Err(DaqError::Range {
            quantity: "bridge channel",
            value: f64::from(channel),
            min: 1.0,
            max: 4.0,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PpmsSettings;

    fn device(mock: &MockPpms) -> Ppms {
        Ppms::new(Box::new(mock.clone()), &PpmsSettings::default())
    }

    #[tokio::test]
    async fn field_reads_in_tesla() {
        let mock = MockPpms::new();
        mock.set_field_now(35_000.0); // 3.5 T in Oersted
        let ppms = device(&mock);
        assert!((ppms.field().await.unwrap() - 3.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn field_requests_clamp_and_convert() {
        let mock = MockPpms::new();
        let ppms = device(&mock);
        // 12 T at 2 T/min: both over the limits
        ppms.set_field_driven(-12.0, 2.0).await.unwrap();
        let journal = mock.journal();
        assert_eq!(journal.len(), 1);
        assert_eq!(
            journal[0],
            "set_field -90000 166.67 Linear Driven".to_string()
        );
    }

    #[tokio::test]
    async fn field_rate_rounds_to_two_decimals() {
        let mock = MockPpms::new();
        let ppms = device(&mock);
        // 0.5 T/min -> 83.333... -> 83.33 Oe/s
        ppms.set_field_persistent(1.0, 0.5).await.unwrap();
        assert_eq!(
            mock.journal()[0],
            "set_field 10000 83.33 Linear Persistent".to_string()
        );
    }

    #[tokio::test]
    async fn bridge_rejects_bad_channel_and_limits() {
        let mock = MockPpms::new();
        let ppms = device(&mock);
        assert!(ppms.bridge(0).await.is_err());
        assert!(ppms.set_bridge(5, 100.0, 10.0).await.is_err());
        assert!(ppms.set_bridge(1, 6_000.0, 10.0).await.is_err());
        assert!(ppms.set_bridge(1, 100.0, 2_000.0).await.is_err());
        ppms.set_bridge(2, 100.0, 10.0).await.unwrap();
        assert_eq!(mock.journal()[0], "bridge_setup 2 100 10 1000".to_string());
    }
}
