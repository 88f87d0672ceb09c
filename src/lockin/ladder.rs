//! Discrete register ladders and range validation.
//!
//! Sensitivity and time-constant registers only accept values from an
//! ordered ladder of discrete settings. Physical setters round a requested
//! value *up* to the nearest supported entry, so the instrument never ends
//! up less sensitive than asked for by accident.

use crate::error::{AppResult, DaqError};

/// Index of the smallest ladder entry at or above `value`.
///
/// Values above the top of the ladder clamp to the last index; values below
/// the bottom select index 0. Idempotent: feeding a ladder entry back in
/// returns its own index.
pub fn truncate_up(ladder: &[f64], value: f64) -> usize {
    ladder
        .iter()
        .position(|&entry| entry >= value)
        .unwrap_or(ladder.len() - 1)
}

/// Validate that `value` lies in `[min, max]`, rejecting the write otherwise.
pub fn strict_range(quantity: &'static str, value: f64, min: f64, max: f64) -> AppResult<f64> {
    if value < min || value > max || !value.is_finite() {
        return Err(DaqError::Range {
            quantity,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

/// Validate a ladder index written directly to the register.
pub fn check_index(quantity: &'static str, index: usize, ladder_len: usize) -> AppResult<usize> {
    if index >= ladder_len {
        return Err(DaqError::Range {
            quantity,
            value: index as f64,
            min: 0.0,
            max: (ladder_len - 1) as f64,
        });
    }
    Ok(index)
}

// =============================================================================
// Oscillator frequency band encoding
// =============================================================================

/// Upper band edges in hertz and the mantissa scale of each band.
///
/// Band n covers up to the listed edge; the transmitted mantissa is
/// `round(hz * scale)`. The last band runs to the 120 kHz oscillator limit.
const FREQUENCY_BANDS: [(f64, f64); 6] = [
    (2.0, 10_000.0),
    (20.0, 1_000.0),
    (200.0, 100.0),
    (2_000.0, 10.0),
    (20_000.0, 1.0),
    (120_000.0, 0.1),
];

/// Valid oscillator frequency range in hertz.
pub const FREQUENCY_RANGE: (f64, f64) = (0.5, 120_000.0);

/// Encode a frequency in hertz as a `(mantissa, band)` register pair.
pub fn encode_frequency(hz: f64) -> AppResult<(i64, u8)> {
    let hz = strict_range(
        "oscillator frequency",
        hz,
        FREQUENCY_RANGE.0,
        FREQUENCY_RANGE.1,
    )?;
    for (band, (edge, scale)) in FREQUENCY_BANDS.iter().enumerate() {
        if hz <= *edge {
            return Ok(((hz * scale).round() as i64, band as u8));
        }
    }
    // strict_range already capped hz at the last band edge
    Err(DaqError::Range {
        quantity: "oscillator frequency",
        value: hz,
        min: FREQUENCY_RANGE.0,
        max: FREQUENCY_RANGE.1,
    })
}

/// Decode a `(mantissa, band)` register pair back to hertz.
pub fn decode_frequency(mantissa: i64, band: u8) -> AppResult<f64> {
    let scaled = mantissa as f64;
    match band {
        0 => Ok(scaled / 10_000.0),
        1 => Ok(scaled / 1_000.0),
        2 => Ok(scaled / 100.0),
        3 => Ok(scaled / 10.0),
        4 => Ok(scaled),
        5 => Ok(scaled * 10.0),
        _ => Err(DaqError::Parse(format!(
            "frequency band {band} out of range 0-5"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockin::dsp52xx;

    #[test]
    fn truncate_up_selects_smallest_entry_at_or_above() {
        let ladder = &dsp52xx::SENSITIVITIES;
        // 2 mV requested -> 3 mV supported (index 9)
        assert_eq!(truncate_up(ladder, 2.0e-3), 9);
        assert!((ladder[truncate_up(ladder, 2.0e-3)] - 3.0e-3).abs() < 1e-12);
        // below the bottom clamps to index 0
        assert_eq!(truncate_up(ladder, 1.0e-9), 0);
        // above the top clamps to the last index
        assert_eq!(truncate_up(ladder, 10.0), ladder.len() - 1);
    }

    #[test]
    fn truncate_up_is_idempotent() {
        let ladder = &dsp52xx::SENSITIVITIES;
        for (i, &entry) in ladder.iter().enumerate() {
            let first = truncate_up(ladder, entry);
            assert_eq!(first, i);
            assert_eq!(truncate_up(ladder, ladder[first]), first);
        }
    }

    #[test]
    fn strict_range_rejects_out_of_bounds() {
        assert!(strict_range("test", 5.0, 0.0, 10.0).is_ok());
        assert!(strict_range("test", -0.1, 0.0, 10.0).is_err());
        assert!(strict_range("test", 10.1, 0.0, 10.0).is_err());
        assert!(strict_range("test", f64::NAN, 0.0, 10.0).is_err());
    }

    #[test]
    fn frequency_round_trips_in_every_band() {
        for hz in [1.5, 15.0, 150.0, 1_500.0, 15_000.0, 50_000.0] {
            let (mantissa, band) = encode_frequency(hz).unwrap();
            let decoded = decode_frequency(mantissa, band).unwrap();
            assert!(
                (decoded - hz).abs() < 1e-9,
                "band {band}: {hz} Hz decoded as {decoded}"
            );
        }
    }

    #[test]
    fn frequency_band_assignment() {
        assert_eq!(encode_frequency(1.5).unwrap(), (15_000, 0));
        assert_eq!(encode_frequency(2.0).unwrap(), (20_000, 0));
        assert_eq!(encode_frequency(2.1).unwrap(), (2_100, 1));
        assert_eq!(encode_frequency(120_000.0).unwrap(), (12_000, 5));
    }

    #[test]
    fn frequency_rejects_outside_oscillator_limits() {
        assert!(encode_frequency(0.4).is_err());
        assert!(encode_frequency(120_001.0).is_err());
        assert!(decode_frequency(1_000, 6).is_err());
    }
}
