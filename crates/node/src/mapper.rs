//! Raw reading → moisture percentage.
//!
//! Two linear models are reported side by side, one over raw converter codes
//! and one over the corresponding voltages. Both are clamped to `[0, 100]`.

use thiserror::Error;

use crate::calibration::CalibrationRecord;

/// Linear raw-code → volts transform of an ADC front end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct VoltScale {
    /// Volts represented by the full positive code range.
    pub full_scale_volts: f64,
    /// Number of codes in the positive range (2^15 for the ADS1115).
    pub codes: f64,
}

impl VoltScale {
    /// ADS1115 with PGA at ±4.096 V.
    pub(crate) const ADS1115_4V096: Self = Self {
        full_scale_volts: 4.096,
        codes: 32768.0,
    };

    pub(crate) fn raw_to_volts(&self, raw: f64) -> f64 {
        raw * self.full_scale_volts / self.codes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum MapError {
    #[error("invalid calibration: dry and wet references are both {raw}")]
    InvalidCalibration { raw: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Percentages {
    pub volts: f64,
    pub percent_raw: f64,
    pub percent_voltage: f64,
}

/// Map a stable raw mean onto the calibrated span.
///
/// A zero-width span is a configuration error and is rejected before any
/// division happens.
pub(crate) fn map_to_percent(
    raw_mean: f64,
    calibration: &CalibrationRecord,
    scale: &VoltScale,
) -> Result<Percentages, MapError> {
    let dry = calibration.dry.raw;
    let wet = calibration.wet.raw;
    if dry == wet {
        return Err(MapError::InvalidCalibration { raw: dry });
    }

    let percent_raw = interpolate(raw_mean, dry as f64, wet as f64);

    let volts = scale.raw_to_volts(raw_mean);
    let dry_volts = scale.raw_to_volts(dry as f64);
    let wet_volts = scale.raw_to_volts(wet as f64);
    // Only reachable with a degenerate scale.
    if dry_volts == wet_volts {
        return Err(MapError::InvalidCalibration { raw: dry });
    }
    let percent_voltage = interpolate(volts, dry_volts, wet_volts);

    Ok(Percentages {
        volts,
        percent_raw,
        percent_voltage,
    })
}

fn interpolate(sample: f64, dry: f64, wet: f64) -> f64 {
    (100.0 * (dry - sample) / (dry - wet)).clamp(0.0, 100.0)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationPoint;

    fn cal(dry: i64, wet: i64) -> CalibrationRecord {
        CalibrationRecord {
            dry: CalibrationPoint { raw: dry },
            wet: CalibrationPoint { raw: wet },
        }
    }

    const SCALE: VoltScale = VoltScale::ADS1115_4V096;

    #[test]
    fn midpoint_is_fifty_percent() {
        let p = map_to_percent(550.0, &cal(800, 300), &SCALE).unwrap();
        assert!((p.percent_raw - 50.0).abs() < 1e-9);
        assert!((p.percent_voltage - 50.0).abs() < 1e-9);
    }

    #[test]
    fn dry_reference_is_zero_and_wet_is_hundred() {
        let c = cal(26000, 12000);
        assert_eq!(map_to_percent(26000.0, &c, &SCALE).unwrap().percent_raw, 0.0);
        assert_eq!(map_to_percent(12000.0, &c, &SCALE).unwrap().percent_raw, 100.0);
    }

    #[test]
    fn drier_than_dry_clamps_to_zero() {
        let p = map_to_percent(30000.0, &cal(26000, 12000), &SCALE).unwrap();
        assert_eq!(p.percent_raw, 0.0);
        assert_eq!(p.percent_voltage, 0.0);
    }

    #[test]
    fn wetter_than_wet_clamps_to_hundred() {
        let p = map_to_percent(5000.0, &cal(26000, 12000), &SCALE).unwrap();
        assert_eq!(p.percent_raw, 100.0);
        assert_eq!(p.percent_voltage, 100.0);
    }

    #[test]
    fn inverted_sensor_span_still_maps() {
        // Some sensors read higher when wet.
        let p = map_to_percent(400.0, &cal(100, 500), &SCALE).unwrap();
        assert!((p.percent_raw - 75.0).abs() < 1e-9);
    }

    #[test]
    fn zero_span_is_invalid_calibration() {
        let err = map_to_percent(500.0, &cal(500, 500), &SCALE).unwrap_err();
        assert_eq!(err, MapError::InvalidCalibration { raw: 500 });
    }

    #[test]
    fn mapping_is_pure() {
        let c = cal(800, 300);
        let a = map_to_percent(612.5, &c, &SCALE).unwrap();
        let b = map_to_percent(612.5, &c, &SCALE).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn volts_follow_ads1115_scale() {
        let p = map_to_percent(16384.0, &cal(26000, 12000), &SCALE).unwrap();
        assert!((p.volts - 2.048).abs() < 1e-12);
    }
}
