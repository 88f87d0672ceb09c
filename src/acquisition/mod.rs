//! Data acquisition loop.
//!
//! One cooperative loop polls every configured lock-in (range-adjusting
//! first) and, when present, the controller's temperature and field, then
//! emits a single row to the results sink and sleeps the inter-tick delay.
//! The stop token is checked once per tick; an in-flight range adjustment
//! completes its current step before the next stop check.
//!
//! The column set is computed once from the device list at setup time and
//! never changes during a run. A device error ends the run: the sink is
//! flushed and the error returned to the caller, so a failed tick can never
//! silently punch holes in the data.

use crate::error::AppResult;
use crate::lockin::{auto_range, AutoRangeOutcome, Lockin};
use crate::ppms::Ppms;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub mod storage;

pub use storage::{CsvSink, MemorySink, ResultsSink};

/// Cooperative stop flag shared between the loop and its owner.
///
/// `request_stop` may be called from any task; the loop observes it at its
/// next per-tick check.
#[derive(Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stop flag.
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Ordered column names, fixed at setup time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    columns: Vec<String>,
}

impl ColumnSchema {
    /// Build the schema for a device list: elapsed-time columns, controller
    /// columns when one is configured, then per-lock-in columns in list
    /// order (X and Y always; frequency and oscillator amplitude only for
    /// models that report them).
    pub fn build(lockins: &[Arc<dyn Lockin>], with_controller: bool) -> Self {
        let mut columns = vec![
            "Elapsed Time (s)".to_string(),
            "Elapsed Time (hr)".to_string(),
        ];
        if with_controller {
            columns.push("PPMS temperature (K)".to_string());
            columns.push("PPMS field (T)".to_string());
        }
        for (i, device) in lockins.iter().enumerate() {
            let n = i + 1;
            columns.push(format!("Lock-In {n} - X (V)"));
            columns.push(format!("Lock-In {n} - Y (V)"));
            if device.has_oscillator_columns() {
                columns.push(format!("Lock-In {n} - Frequency (Hz)"));
                columns.push(format!("Lock-In {n} - Osc Amp (V)"));
            }
        }
        Self { columns }
    }

    /// The column names in emit order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the schema has no columns (never true for a built schema).
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One emitted row; values align with the schema's column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Values in schema column order.
    pub values: Vec<f64>,
}

/// Everything an acquisition run needs, constructed once at setup.
pub struct RunPlan {
    /// Lock-ins to poll, in column order.
    pub lockins: Vec<Arc<dyn Lockin>>,
    /// Optional controller to read temperature and field from.
    pub ppms: Option<Arc<Ppms>>,
    /// Delay between ticks.
    pub tick_delay: Duration,
}

/// The acquisition loop.
pub struct AcquisitionLoop {
    lockins: Vec<Arc<dyn Lockin>>,
    ppms: Option<Arc<Ppms>>,
    schema: ColumnSchema,
    tick_delay: Duration,
    stop: StopToken,
}

impl AcquisitionLoop {
    /// Build a loop from a plan; the column schema is fixed here.
    pub fn new(plan: RunPlan) -> Self {
        let schema = ColumnSchema::build(&plan.lockins, plan.ppms.is_some());
        Self {
            lockins: plan.lockins,
            ppms: plan.ppms,
            schema,
            tick_delay: plan.tick_delay,
            stop: StopToken::new(),
        }
    }

    /// The schema rows will follow.
    pub fn schema(&self) -> &ColumnSchema {
        &self.schema
    }

    /// Token the owner can use to stop the loop.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Run until stopped, emitting one row per tick to `sink`.
    ///
    /// Returns the number of rows emitted, or the first device/sink error.
    pub async fn run(&self, sink: &mut dyn ResultsSink) -> AppResult<u64> {
        sink.begin(&self.schema).await?;
        info!(
            "Acquisition started: {} lock-in(s), controller {}",
            self.lockins.len(),
            if self.ppms.is_some() {
                "present"
            } else {
                "absent"
            }
        );

        let started = Instant::now();
        let mut rows = 0u64;
        loop {
            let row = match self.acquire_row(started).await {
                Ok(row) => row,
                Err(err) => {
                    warn!("Acquisition tick failed: {err}");
                    let _ = sink.finish().await;
                    return Err(err);
                }
            };
            if let Err(err) = sink.append(&row).await {
                warn!("Results sink failed: {err}");
                let _ = sink.finish().await;
                return Err(err);
            }
            rows += 1;

            tokio::time::sleep(self.tick_delay).await;
            if self.stop.is_stopped() {
                info!("Stop requested; acquisition ending after {rows} row(s)");
                break;
            }
        }

        sink.finish().await?;
        Ok(rows)
    }

    /// Poll everything once, in schema order.
    async fn acquire_row(&self, started: Instant) -> AppResult<Row> {
        let mut values = Vec::with_capacity(self.schema.len());
        let elapsed = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
        values.push(elapsed);
        values.push(elapsed / 3600.0);

        if let Some(ppms) = &self.ppms {
            values.push(ppms.temperature().await?);
            values.push(ppms.field().await?);
        }

        for device in &self.lockins {
            match auto_range(device.as_ref()).await? {
                AutoRangeOutcome::InRange => {}
                AutoRangeOutcome::Adjusted { steps, final_index } => {
                    debug!(
                        "{}: sensitivity adjusted {} step(s) to index {}",
                        device.name(),
                        steps,
                        final_index
                    );
                }
            }

            let (x, y) = device.xy().await?;
            values.push(x);
            values.push(y);
            if device.has_oscillator_columns() {
                values.push(device.frequency().await?);
                values.push(device.oscillator_amplitude().await?);
            }
        }

        Ok(Row { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SimulatedLockinLink;
    use crate::lockin::{Dsp52xx, Dsp72xx, LockinModel, Sr830};

    fn simulated(model: LockinModel, name: &str) -> Arc<dyn Lockin> {
        // Signal sized to sit mid-band at the starting sensitivity so the
        // range controller never engages (and never sleeps) in these tests.
        match model {
            LockinModel::Sr830 => {
                let link = SimulatedLockinLink::new(model, 1.0e-5);
                let link = configure_in_band(link, model);
                Arc::new(Sr830::new(name, link))
            }
            LockinModel::Dsp72xx => {
                let link = SimulatedLockinLink::new(model, 1.0e-5);
                let link = configure_in_band(link, model);
                Arc::new(Dsp72xx::new(name, link))
            }
            LockinModel::Dsp52xx => {
                let link = SimulatedLockinLink::new(model, 1.0e-5);
                let link = configure_in_band(link, model);
                Arc::new(Dsp52xx::new(name, link))
            }
        }
    }

    fn configure_in_band(link: SimulatedLockinLink, model: LockinModel) -> SimulatedLockinLink {
        let ladder: &[f64] = match model {
            LockinModel::Sr830 => &crate::lockin::sr830::SENSITIVITIES,
            LockinModel::Dsp72xx => &crate::lockin::dsp72xx::SENSITIVITIES,
            LockinModel::Dsp52xx => &crate::lockin::dsp52xx::SENSITIVITIES,
        };
        // 10 µV signal at 20 µV full scale reads 5000 counts.
        let index = ladder
            .iter()
            .position(|&s| s >= 2.0e-5)
            .unwrap_or(ladder.len() - 1);
        link.with_sensitivity_index(index)
    }

    #[test]
    fn schema_orders_controller_before_lockins() {
        let lockins = vec![
            simulated(LockinModel::Sr830, "lockin-1"),
            simulated(LockinModel::Dsp52xx, "lockin-2"),
        ];
        let schema = ColumnSchema::build(&lockins, true);
        assert_eq!(
            schema.columns(),
            &[
                "Elapsed Time (s)",
                "Elapsed Time (hr)",
                "PPMS temperature (K)",
                "PPMS field (T)",
                "Lock-In 1 - X (V)",
                "Lock-In 1 - Y (V)",
                "Lock-In 1 - Frequency (Hz)",
                "Lock-In 1 - Osc Amp (V)",
                "Lock-In 2 - X (V)",
                "Lock-In 2 - Y (V)",
            ]
        );
    }

    #[test]
    fn schema_without_controller_or_lockins_is_just_elapsed_time() {
        let schema = ColumnSchema::build(&[], false);
        assert_eq!(
            schema.columns(),
            &["Elapsed Time (s)", "Elapsed Time (hr)"]
        );
    }
}
