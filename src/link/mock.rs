//! Mock command links.
//!
//! `MockLink` replays scripted responses and journals every command, for
//! driver-level protocol tests. `SimulatedLockinLink` behaves like a live
//! lock-in amplifier: it keeps register state, answers the model's command
//! dialect, and synthesizes readings from a configurable input signal, so
//! the whole acquisition stack can run without hardware.

use crate::error::{AppResult, DaqError};
use crate::link::CommandLink;
use crate::lockin::LockinModel;
use crate::lockin::{dsp52xx, dsp72xx, sr830};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// =============================================================================
// MockLink - scripted responses
// =============================================================================

/// Scripted command link for protocol tests.
///
/// Clones share the same script and journal, so a test can keep one clone
/// and hand the other to a driver.
#[derive(Clone, Default)]
pub struct MockLink {
    responses: Arc<Mutex<VecDeque<String>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockLink {
    /// Create an empty mock link.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock link preloaded with responses, consumed in order.
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let link = Self::new();
        for response in responses {
            link.push_response(response);
        }
        link
    }

    /// Append a scripted response.
    pub fn push_response(&self, response: impl Into<String>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response.into());
        }
    }

    /// All commands sent so far, writes and queries alike.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, command: &str) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.to_string());
        }
    }
}

#[async_trait]
impl CommandLink for MockLink {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.record(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.record(command);
        self.responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front())
            .ok_or_else(|| {
                DaqError::Transport(format!("No scripted response for '{command}'"))
            })
    }
}

// =============================================================================
// SimulatedLockinLink - register-level instrument simulation
// =============================================================================

/// Register-level simulation of a lock-in amplifier.
///
/// The simulated input signal has a fixed magnitude (plus optional noise)
/// split into X and Y at a fixed phase. Raw-code dialects report
/// `signal / sensitivity * 10000` clamped at the overload ceiling, so
/// stepping the sensitivity ladder moves the reported magnitude exactly the
/// way the range controller expects.
pub struct SimulatedLockinLink {
    model: LockinModel,
    signal_volts: f64,
    noise_volts: f64,
    sensitivity_index: usize,
    time_constant_index: usize,
    amplitude_mv: i64,
    amplitude_volts: f64,
    frequency_mantissa: i64,
    frequency_band: u8,
    frequency_hz: f64,
    sent: Arc<Mutex<Vec<String>>>,
}

/// Raw-code overload ceiling of the simulated device.
const OVERLOAD_RAW: i64 = 30_000;

impl SimulatedLockinLink {
    /// Create a simulated instrument of the given model measuring
    /// `signal_volts` at its input.
    pub fn new(model: LockinModel, signal_volts: f64) -> Self {
        let ladder = sensitivity_ladder(model);
        Self {
            model,
            signal_volts,
            noise_volts: 0.0,
            // Start mid-ladder, like an instrument left from a previous run.
            sensitivity_index: ladder.len() / 2,
            time_constant_index: 6,
            amplitude_mv: 1000,
            amplitude_volts: 1.0,
            frequency_mantissa: 1370,
            frequency_band: 2,
            frequency_hz: 137.0,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add uniform noise of the given amplitude to readings.
    pub fn with_noise(mut self, noise_volts: f64) -> Self {
        self.noise_volts = noise_volts;
        self
    }

    /// Start at an explicit sensitivity index.
    pub fn with_sensitivity_index(mut self, index: usize) -> Self {
        self.sensitivity_index = index.min(sensitivity_ladder(self.model).len() - 1);
        self
    }

    /// Change the simulated input signal mid-run.
    pub fn set_signal(&mut self, signal_volts: f64) {
        self.signal_volts = signal_volts;
    }

    /// All commands received so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn signal(&self) -> f64 {
        if self.noise_volts > 0.0 {
            let mut rng = rand::thread_rng();
            self.signal_volts + rng.gen_range(-self.noise_volts..=self.noise_volts)
        } else {
            self.signal_volts
        }
    }

    fn sensitivity(&self) -> f64 {
        sensitivity_ladder(self.model)[self.sensitivity_index]
    }

    fn raw(&self, volts: f64) -> i64 {
        let code = (volts / self.sensitivity() * 10_000.0).round() as i64;
        code.clamp(-OVERLOAD_RAW, OVERLOAD_RAW)
    }

    fn record(&self, command: &str) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.to_string());
        }
    }

    fn handle_write(&mut self, command: &str) {
        let mut parts = command.split_whitespace();
        let head = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        match (head, args.as_slice()) {
            ("SEN", [i]) | ("SENS", [i]) => {
                if let Ok(i) = i.parse::<usize>() {
                    let len = sensitivity_ladder(self.model).len();
                    self.sensitivity_index = i.min(len - 1);
                }
            }
            ("TC", [i]) | ("OFLT", [i]) => {
                if let Ok(i) = i.parse::<usize>() {
                    self.time_constant_index = i;
                }
            }
            ("OA", [mv]) => {
                if let Ok(mv) = mv.parse::<i64>() {
                    self.amplitude_mv = mv;
                }
            }
            ("SLVL", [v]) => {
                if let Ok(v) = v.parse::<f64>() {
                    self.amplitude_volts = v;
                }
            }
            ("OF", [mantissa, band]) => {
                if let (Ok(m), Ok(b)) = (mantissa.parse::<i64>(), band.parse::<u8>()) {
                    self.frequency_mantissa = m;
                    self.frequency_band = b;
                }
            }
            ("FREQ", [hz]) => {
                if let Ok(hz) = hz.parse::<f64>() {
                    self.frequency_hz = hz;
                }
            }
            _ => {}
        }
    }

    fn handle_query(&mut self, command: &str) -> Option<String> {
        // In-phase/quadrature split of the simulated signal (3-4-5 phase).
        let magnitude = self.signal();
        let x = magnitude * 0.8;
        let y = magnitude * 0.6;
        match self.model {
            LockinModel::Sr830 => match command {
                "SENS?" => Some(self.sensitivity_index.to_string()),
                "OFLT?" => Some(self.time_constant_index.to_string()),
                "OUTP? 1" => Some(format!("{x:e}")),
                "OUTP? 2" => Some(format!("{y:e}")),
                "OUTP? 3" => Some(format!("{magnitude:e}")),
                "SNAP? 1,2" => Some(format!("{x:e},{y:e}")),
                "FREQ?" => Some(self.frequency_hz.to_string()),
                "SLVL?" => Some(self.amplitude_volts.to_string()),
                "PHAS?" => Some("36.87".to_string()),
                _ => None,
            },
            LockinModel::Dsp72xx | LockinModel::Dsp52xx => match command {
                "SEN" => Some(self.sensitivity_index.to_string()),
                "TC" => Some(self.time_constant_index.to_string()),
                "MAG" => Some(self.raw(magnitude).to_string()),
                "X" => Some(self.raw(x).to_string()),
                "Y" => Some(self.raw(y).to_string()),
                "XY" => Some(format!("{},{}", self.raw(x), self.raw(y))),
                "OA" => Some(self.amplitude_mv.to_string()),
                "OF" => Some(format!(
                    "{},{}",
                    self.frequency_mantissa, self.frequency_band
                )),
                "PHA" => Some("36870".to_string()),
                "ADC 1" | "ADC 2" | "ADC 3" | "ADC 4" => Some("0".to_string()),
                _ => None,
            },
        }
    }
}

fn sensitivity_ladder(model: LockinModel) -> &'static [f64] {
    match model {
        LockinModel::Sr830 => &sr830::SENSITIVITIES,
        LockinModel::Dsp72xx => &dsp72xx::SENSITIVITIES,
        LockinModel::Dsp52xx => &dsp52xx::SENSITIVITIES,
    }
}

#[async_trait]
impl CommandLink for SimulatedLockinLink {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.record(command);
        self.handle_write(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.record(command);
        self.handle_query(command)
            .ok_or_else(|| DaqError::Transport(format!("Unknown command '{command}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_link_replays_in_order_and_journals() {
        let mut link = MockLink::with_responses(["5", "100,2"]);
        assert_eq!(link.query("SEN").await.unwrap(), "5");
        assert_eq!(link.query("OF").await.unwrap(), "100,2");
        link.write("SEN 7").await.unwrap();
        assert_eq!(link.sent(), vec!["SEN", "OF", "SEN 7"]);
        assert!(link.query("SEN").await.is_err());
    }

    #[tokio::test]
    async fn simulated_magnitude_tracks_sensitivity() {
        // 10 mV signal on the 72XX ladder: at 10 mV full scale the raw code
        // reads exactly 10000; one step less sensitive reads 5000.
        let mut link = SimulatedLockinLink::new(LockinModel::Dsp72xx, 10.0e-3);
        let idx = dsp72xx::SENSITIVITIES
            .iter()
            .position(|&s| s == 10.0e-3)
            .unwrap();
        link.write(&format!("SEN {idx}")).await.unwrap();
        assert_eq!(link.query("MAG").await.unwrap(), "10000");
        link.write(&format!("SEN {}", idx + 1)).await.unwrap();
        assert_eq!(link.query("MAG").await.unwrap(), "5000");
    }

    #[tokio::test]
    async fn simulated_overload_clamps_at_ceiling() {
        let mut link =
            SimulatedLockinLink::new(LockinModel::Dsp52xx, 10.0).with_sensitivity_index(0);
        let raw: i64 = link.query("MAG").await.unwrap().parse().unwrap();
        assert_eq!(raw, 30_000);
    }
}
