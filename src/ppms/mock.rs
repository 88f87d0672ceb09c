//! Mock controller client for tests and simulated runs.

use crate::error::AppResult;
use crate::ppms::{ChamberMode, DrivenMode, FieldApproach, PpmsClient, TemperatureApproach};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Scriptable in-memory controller.
///
/// Status strings are served from per-quantity queues: each poll pops the
/// next scripted status, and once a queue runs dry the last value repeats.
/// Every command is journalled verbatim so tests can assert exactly what
/// was sent. Clones share state.
#[derive(Clone)]
pub struct MockPpms {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    temperature: f64,
    field_oe: f64,
    chamber: String,
    temperature_statuses: VecDeque<String>,
    magnet_statuses: VecDeque<String>,
    steady_temperature_status: String,
    steady_magnet_status: String,
    auto_status: bool,
    resistances: [f64; 4],
    journal: Vec<String>,
}

impl Default for MockPpms {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPpms {
    /// Create a controller idling at 300 K and zero field.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                temperature: 300.0,
                field_oe: 0.0,
                chamber: "Sealed".to_string(),
                temperature_statuses: VecDeque::new(),
                magnet_statuses: VecDeque::new(),
                steady_temperature_status: "Stable".to_string(),
                steady_magnet_status: "Driven mode stable".to_string(),
                auto_status: false,
                resistances: [0.0; 4],
                journal: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the reported temperature immediately.
    pub fn set_temperature_now(&self, kelvin: f64) {
        self.lock().temperature = kelvin;
    }

    /// Set the reported field immediately, in Oersted.
    pub fn set_field_now(&self, oersted: f64) {
        self.lock().field_oe = oersted;
    }

    /// Set a bridge channel resistance.
    pub fn set_resistance(&self, channel: u8, ohms: f64) {
        if (1..=4).contains(&channel) {
            self.lock().resistances[usize::from(channel) - 1] = ohms;
        }
    }

    /// Queue a temperature status to be served on an upcoming poll.
    pub fn push_temperature_status(&self, status: impl Into<String>) {
        self.lock().temperature_statuses.push_back(status.into());
    }

    /// Queue a magnet status to be served on an upcoming poll.
    pub fn push_magnet_status(&self, status: impl Into<String>) {
        self.lock().magnet_statuses.push_back(status.into());
    }

    /// Set the status served once the temperature queue runs dry.
    pub fn set_steady_temperature_status(&self, status: impl Into<String>) {
        self.lock().steady_temperature_status = status.into();
    }

    /// Set the status served once the magnet queue runs dry.
    pub fn set_steady_magnet_status(&self, status: impl Into<String>) {
        self.lock().steady_magnet_status = status.into();
    }

    /// Make steady statuses follow commands, like a well-behaved
    /// controller: ramps end "Stable"/"... mode stable", shutdowns end
    /// "Standby". Scripted status queues still take precedence.
    pub fn enable_auto_status(&self) {
        self.lock().auto_status = true;
    }

    /// Everything commanded so far, in order.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }
}

#[async_trait]
impl PpmsClient for MockPpms {
    async fn get_temperature(&self) -> AppResult<(f64, String)> {
        let mut inner = self.lock();
        let status = inner
            .temperature_statuses
            .pop_front()
            .unwrap_or_else(|| inner.steady_temperature_status.clone());
        Ok((inner.temperature, status))
    }

    async fn set_temperature(
        &self,
        kelvin: f64,
        rate_k_per_min: f64,
        approach: TemperatureApproach,
    ) -> AppResult<()> {
        let mut inner = self.lock();
        inner
            .journal
            .push(format!("set_temperature {kelvin} {rate_k_per_min} {approach:?}"));
        inner.temperature = kelvin;
        if inner.auto_status {
            inner.steady_temperature_status = "Stable".to_string();
        }
        Ok(())
    }

    async fn get_field(&self) -> AppResult<(f64, String)> {
        let mut inner = self.lock();
        let status = inner
            .magnet_statuses
            .pop_front()
            .unwrap_or_else(|| inner.steady_magnet_status.clone());
        Ok((inner.field_oe, status))
    }

    async fn set_field(
        &self,
        oersted: f64,
        oersted_per_sec: f64,
        approach: FieldApproach,
        mode: DrivenMode,
    ) -> AppResult<()> {
        let mut inner = self.lock();
        inner.journal.push(format!(
            "set_field {oersted} {oersted_per_sec} {approach:?} {mode:?}"
        ));
        inner.field_oe = oersted;
        if inner.auto_status {
            inner.steady_magnet_status = match mode {
                DrivenMode::Driven => "Driven mode stable".to_string(),
                DrivenMode::Persistent => "Persistent mode stable".to_string(),
            };
        }
        Ok(())
    }

    async fn get_chamber(&self) -> AppResult<String> {
        Ok(self.lock().chamber.clone())
    }

    async fn set_chamber(&self, mode: ChamberMode) -> AppResult<()> {
        let mut inner = self.lock();
        inner.journal.push(format!("set_chamber {mode:?}"));
        inner.chamber = format!("{mode:?}");
        Ok(())
    }

    async fn get_resistance(&self, channel: u8) -> AppResult<(f64, f64)> {
        let inner = self.lock();
        let ohms = inner
            .resistances
            .get(usize::from(channel).saturating_sub(1))
            .copied()
            .unwrap_or(0.0);
        Ok((ohms, 0.0))
    }

    async fn bridge_setup(
        &self,
        channel: u8,
        excitation_ua: f64,
        power_uw: f64,
        voltage_limit_mv: f64,
    ) -> AppResult<()> {
        self.lock().journal.push(format!(
            "bridge_setup {channel} {excitation_ua} {power_uw} {voltage_limit_mv}"
        ));
        Ok(())
    }

    async fn shutdown_potops(&self) -> AppResult<()> {
        let mut inner = self.lock();
        inner.journal.push("shutdown_potops".to_string());
        if inner.auto_status {
            inner.steady_temperature_status = "Standby".to_string();
        }
        Ok(())
    }

    async fn shutdown_continuous(&self) -> AppResult<()> {
        let mut inner = self.lock();
        inner.journal.push("shutdown_continuous".to_string());
        if inner.auto_status {
            inner.steady_temperature_status = "Standby".to_string();
        }
        Ok(())
    }

    async fn abort(&self) -> AppResult<()> {
        self.lock().journal.push("abort".to_string());
        Ok(())
    }
}
