//! Closed-loop sensitivity range controller.
//!
//! Keeps the magnitude reading of a lock-in inside its useful fraction of
//! full scale by walking the sensitivity ladder one step at a time. The
//! procedure mirrors what an operator does by hand:
//!
//! 1. Check the raw-code magnitude; inside the engage band, do nothing.
//! 2. Remember the measurement time constant and switch to a fast one so
//!    the reading can track the sensitivity changes.
//! 3. Step the sensitivity until the magnitude sits in the adjust band,
//!    settling between steps.
//! 4. Restore the measurement time constant and wait out the filter settle
//!    before anyone trusts a reading again.
//!
//! Hitting an end of the ladder with the signal still out of bounds fails
//! with a saturation error instead of retrying forever; the measurement
//! time constant is restored before the error is returned.
//!
//! Concurrent invocations against the same device are not safe (the device
//! has one physical command channel) and must be serialized by the caller.

use crate::error::{AppResult, DaqError, LadderEnd};
use crate::lockin::{Lockin, RangePolicy};
use log::{debug, info};
use tokio::time::sleep;

/// What the range controller did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRangeOutcome {
    /// Magnitude was already inside the engage band; nothing was touched.
    InRange,
    /// Sensitivity was stepped until the magnitude landed in the adjust band.
    Adjusted {
        /// Number of single-index sensitivity steps taken.
        steps: usize,
        /// Ladder index the device ended on.
        final_index: usize,
    },
}

/// Run one auto-range pass against a device, using its own [`RangePolicy`].
pub async fn auto_range(device: &dyn Lockin) -> AppResult<AutoRangeOutcome> {
    let policy = device.range_policy();

    let magnitude = device.magnitude_raw().await?.abs();
    if magnitude >= policy.trigger_low && magnitude <= policy.high {
        return Ok(AutoRangeOutcome::InRange);
    }

    debug!(
        "{}: magnitude {} raw outside [{}, {}], adjusting range",
        device.name(),
        magnitude,
        policy.trigger_low,
        policy.high
    );

    let measurement_tc = device.time_constant_index().await?;
    device.set_time_constant_index(policy.fast_tc_index).await?;

    let adjusted = adjust(device, &policy).await;

    // The measurement time constant comes back even when the ladder
    // saturated, so the instrument is never left in the tracking state.
    device.set_time_constant_index(measurement_tc).await?;

    match adjusted {
        Ok((steps, final_index)) => {
            sleep(policy.final_settle).await;
            info!(
                "{}: range adjusted in {} step(s) to index {}",
                device.name(),
                steps,
                final_index
            );
            Ok(AutoRangeOutcome::Adjusted { steps, final_index })
        }
        Err(err) => Err(err),
    }
}

/// Step the sensitivity until the magnitude lands in `[low, high]`.
async fn adjust(device: &dyn Lockin, policy: &RangePolicy) -> AppResult<(usize, usize)> {
    let ladder_len = device.sensitivity_ladder().len();
    let mut steps = 0usize;

    loop {
        let magnitude = device.magnitude_raw().await?.abs();
        if magnitude >= policy.low && magnitude <= policy.high {
            let final_index = device.sensitivity_index().await?;
            return Ok((steps, final_index));
        }

        let index = device.sensitivity_index().await?;
        if magnitude > policy.high {
            // Overloaded: go one range less sensitive.
            if index + 1 >= ladder_len {
                return Err(DaqError::Saturation {
                    at: LadderEnd::LeastSensitive,
                    magnitude,
                });
            }
            device.set_sensitivity_index(index + 1).await?;
        } else {
            // Underrange: go one range more sensitive.
            if index == 0 {
                return Err(DaqError::Saturation {
                    at: LadderEnd::MostSensitive,
                    magnitude,
                });
            }
            device.set_sensitivity_index(index - 1).await?;
        }

        steps += 1;
        sleep(policy.step_settle).await;
    }
}
