//! Glucose calibration.
//!
//! Raw readings go through three stages:
//!
//! 1. [`factory_calibrate`]: thermistor temperature compensation and the
//!    per-family [`FactoryCurve`] selected by the sensor's `i1` coefficient.
//! 2. [`custom_calibrate`]: an optional least-squares line fitted through
//!    user reference points, with bounded slope and intercept.
//! 3. [`KalmanFilter`]: 1-D smoothing of the emitted series.
//!
//! [`slope`] and [`trend`] then describe the rate of change between two
//! emitted values.

use time::OffsetDateTime;

use cgm_types::{CustomCalibrationPoint, FactoryCalibration, SensorFamily, SensorReading, TrendArrow};

use crate::error::{Error, Result};

/// Skin temperature below which readings are flagged, in °C.
pub const MIN_TEMPERATURE: f64 = 10.0;

/// Skin temperature above which readings are flagged, in °C.
pub const MAX_TEMPERATURE: f64 = 45.0;

const THERMISTOR_SCALE: f64 = 72_500.0;
const THERMISTOR_OFFSET: f64 = 1_000.0;
// Steinhart-Hart coefficients: constant, ln R, ln² R, ln³ R.
const SH_A: f64 = 0.000_918_002_3;
const SH_B: f64 = 0.000_196_456_1;
const SH_C: f64 = 0.000_000_052_835_66;
const SH_D: f64 = 0.000_000_706_177_5;
const KELVIN: f64 = 273.15;

const GLUCOSE_SCALE: f64 = 65.0;
const REFERENCE_TEMPERATURE: f64 = 32.5;
const TEMPERATURE_COEFFICIENT: f64 = 1.045;

/// Offset/slope table indexed by the sensor's `i1` coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactoryCurve {
    /// Offsets in mg/dL, one per curve index.
    pub offsets: [f64; 7],
    /// Slopes, one per curve index.
    pub slopes: [f64; 7],
}

// Approximate per-index coefficients, close to identity and monotonic in
// `i1`. They are not published vendor values.
static LIBRE1_CURVE: FactoryCurve = FactoryCurve {
    offsets: [0.0, 1.6, 3.2, 4.8, 6.4, 8.0, 9.6],
    slopes: [1.0, 0.985, 0.97, 0.955, 0.94, 0.925, 0.91],
};

static LIBRE2_CURVE: FactoryCurve = FactoryCurve {
    offsets: [0.0, 1.2, 2.4, 3.6, 4.8, 6.0, 7.2],
    slopes: [1.0, 0.99, 0.98, 0.97, 0.96, 0.95, 0.94],
};

impl FactoryCurve {
    /// Curve table for a sensor family.
    #[must_use]
    pub fn for_family(family: SensorFamily) -> &'static FactoryCurve {
        match family {
            SensorFamily::Libre2 | SensorFamily::LibreSense => &LIBRE2_CURVE,
            _ => &LIBRE1_CURVE,
        }
    }

    /// Map a temperature-compensated value through the curve selected by `i1`.
    #[must_use]
    pub fn apply(&self, i1: u16, compensated: f64) -> f64 {
        let index = usize::from(i1.clamp(1, 7) - 1);
        (compensated - self.offsets[index]) / self.slopes[index]
    }
}

/// Skin temperature in °C from the thermistor reading.
///
/// Returns `None` when the thermistor value cannot be converted.
#[must_use]
pub fn thermistor_temperature(
    raw_temperature: u16,
    adjustment: i16,
    calibration: &FactoryCalibration,
) -> Option<f64> {
    if raw_temperature == 0 {
        return None;
    }
    let denominator = f64::from(adjustment) + f64::from(calibration.i6);
    if denominator <= 0.0 {
        return None;
    }

    let resistance = f64::from(raw_temperature) * THERMISTOR_SCALE / denominator - THERMISTOR_OFFSET;
    if resistance <= 0.0 {
        return None;
    }

    let ln_r = resistance.ln();
    let inverse = SH_A + SH_B * ln_r + SH_C * ln_r.powi(2) + SH_D * ln_r.powi(3);
    if inverse <= 0.0 {
        return None;
    }

    let temperature = 1.0 / inverse - KELVIN;
    temperature.is_finite().then_some(temperature)
}

/// Reject a reading that carries quality flags.
pub fn check_quality(reading: &SensorReading) -> Result<()> {
    if reading.is_valid() {
        Ok(())
    } else {
        Err(Error::DataQuality(reading.error))
    }
}

/// Factory-calibrated glucose in mg/dL.
///
/// Returns `None` when the thermistor cannot be converted, the coefficients
/// are degenerate, or the result is not finite. Quality flags are not
/// checked here.
#[must_use]
pub fn factory_calibrate(
    reading: &SensorReading,
    calibration: &FactoryCalibration,
    family: SensorFamily,
) -> Option<f64> {
    let temperature = thermistor_temperature(
        reading.raw_temperature,
        reading.temperature_adjustment,
        calibration,
    )?;

    let span = f64::from(calibration.i4) - f64::from(calibration.i3);
    if span == 0.0 {
        return None;
    }

    let ratio = GLUCOSE_SCALE * (f64::from(reading.raw_glucose) - f64::from(calibration.i3)) / span;
    let compensation = TEMPERATURE_COEFFICIENT.powf(REFERENCE_TEMPERATURE - temperature);
    let value = FactoryCurve::for_family(family).apply(calibration.i1, ratio * compensation);

    value.is_finite().then_some(value)
}

/// Inclusive bounds of displayable glucose values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadableRange {
    /// Lowest value shown, in mg/dL.
    pub min: f64,
    /// Highest value shown, in mg/dL.
    pub max: f64,
}

impl Default for ReadableRange {
    fn default() -> Self {
        Self::STANDARD
    }
}

impl ReadableRange {
    /// 40–500 mg/dL.
    pub const STANDARD: Self = Self {
        min: 40.0,
        max: 500.0,
    };

    /// Create a range.
    #[must_use]
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Clamp a value into the range.
    #[must_use]
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Check that the bounds are finite and ordered.
    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err(Error::InvalidConfig(format!(
                "readable range {}..{} is invalid",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Allowed slope of a custom calibration line.
pub const SLOPE_BOUNDS: (f64, f64) = (0.8, 1.25);

/// Allowed intercept of a custom calibration line, in mg/dL.
pub const INTERCEPT_BOUNDS: (f64, f64) = (-100.0, 100.0);

/// `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    /// Line slope.
    pub slope: f64,
    /// Line intercept.
    pub intercept: f64,
}

impl Default for LinearFit {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl LinearFit {
    /// Slope 1, intercept 0.
    pub const IDENTITY: Self = Self {
        slope: 1.0,
        intercept: 0.0,
    };

    /// Fit a line through calibration points by ordinary least squares.
    ///
    /// Fewer than two usable points yield the identity. If every point shares
    /// the same `x` the slope defaults to 1. Slope and intercept are clamped
    /// to [`SLOPE_BOUNDS`] and [`INTERCEPT_BOUNDS`]; the intercept is computed
    /// with the clamped slope.
    #[must_use]
    pub fn fit(points: &[CustomCalibrationPoint]) -> Self {
        let usable: Vec<_> = points
            .iter()
            .filter(|p| p.x.is_finite() && p.y.is_finite())
            .collect();
        if usable.len() < 2 {
            return Self::IDENTITY;
        }

        let n = usable.len() as f64;
        let mean_x = usable.iter().map(|p| p.x).sum::<f64>() / n;
        let mean_y = usable.iter().map(|p| p.y).sum::<f64>() / n;
        let sxx: f64 = usable.iter().map(|p| (p.x - mean_x).powi(2)).sum();
        let sxy: f64 = usable
            .iter()
            .map(|p| (p.x - mean_x) * (p.y - mean_y))
            .sum();

        let slope = if sxx.abs() < f64::EPSILON {
            1.0
        } else {
            sxy / sxx
        };
        let slope = slope.clamp(SLOPE_BOUNDS.0, SLOPE_BOUNDS.1);
        let intercept = (mean_y - slope * mean_x).clamp(INTERCEPT_BOUNDS.0, INTERCEPT_BOUNDS.1);

        if slope.is_finite() && intercept.is_finite() {
            Self { slope, intercept }
        } else {
            Self::IDENTITY
        }
    }

    /// Evaluate the line.
    #[must_use]
    pub fn apply(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Apply custom calibration to a factory value and clamp to the range.
#[must_use]
pub fn custom_calibrate(
    raw: f64,
    points: &[CustomCalibrationPoint],
    range: &ReadableRange,
) -> f64 {
    range.clamp(LinearFit::fit(points).apply(raw))
}

/// Default process and observation noise of [`KalmanFilter`].
pub const DEFAULT_FILTER_NOISE: f64 = 2.5;

/// One-dimensional Kalman filter with a constant state model.
///
/// Process noise and observation noise share one tunable value. The first
/// observation initializes the estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanFilter {
    /// Current estimate.
    pub estimate: f64,
    /// Estimate covariance.
    pub covariance: f64,
    /// Process and observation noise.
    pub noise: f64,
    primed: bool,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new(DEFAULT_FILTER_NOISE)
    }
}

impl KalmanFilter {
    /// Create an unprimed filter.
    #[must_use]
    pub fn new(noise: f64) -> Self {
        Self {
            estimate: 0.0,
            covariance: noise,
            noise,
            primed: false,
        }
    }

    /// Whether an observation has been seen.
    #[must_use]
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Feed an observation and return the new estimate.
    pub fn update(&mut self, observation: f64) -> f64 {
        if !self.primed {
            self.estimate = observation;
            self.covariance = self.noise;
            self.primed = true;
            return self.estimate;
        }

        let predicted = self.covariance + self.noise;
        let gain = predicted / (predicted + self.noise);
        self.estimate += gain * (observation - self.estimate);
        self.covariance = (1.0 - gain) * predicted;
        self.estimate
    }

    /// Forget all observations.
    pub fn reset(&mut self) {
        *self = Self::new(self.noise);
    }
}

/// Rate of change per minute between two values.
///
/// Identical timestamps give `0.0`.
#[must_use]
pub fn slope(
    previous_at: OffsetDateTime,
    previous_value: f64,
    current_at: OffsetDateTime,
    current_value: f64,
) -> f64 {
    let minutes = (current_at - previous_at).as_seconds_f64() / 60.0;
    if minutes == 0.0 {
        return 0.0;
    }
    (current_value - previous_value) / minutes
}

/// Classify a per-minute slope.
#[must_use]
pub fn trend(slope: Option<f64>) -> TrendArrow {
    slope.map_or(TrendArrow::Unknown, TrendArrow::from_slope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgm_types::ReadingError;
    use proptest::prelude::*;
    use time::Duration;

    const UID: [u8; 8] = [0x2F, 0xE7, 0xB1, 0x00, 0x00, 0xA4, 0x07, 0xE0];

    fn calibration() -> FactoryCalibration {
        FactoryCalibration {
            i1: 1,
            i2: 300,
            i3: 20,
            i4: 1020,
            i5: 10000,
            i6: 16000,
        }
    }

    fn reading(raw_glucose: u16, raw_temperature: u16) -> SensorReading {
        SensorReading::new(
            &UID,
            OffsetDateTime::UNIX_EPOCH,
            100,
            raw_glucose,
            raw_temperature,
            0,
            ReadingError::OK,
        )
    }

    fn point(x: f64, y: f64) -> CustomCalibrationPoint {
        CustomCalibrationPoint::new(x, y)
    }

    #[test]
    fn test_thermistor_temperature_skin_range() {
        let t = thermistor_temperature(2428, 0, &calibration()).unwrap();
        assert!((t - 31.381_661).abs() < 1e-4, "got {t}");
    }

    #[test]
    fn test_thermistor_temperature_unusable() {
        assert_eq!(thermistor_temperature(0, 0, &calibration()), None);
        let mut cal = calibration();
        cal.i6 = 0;
        assert_eq!(thermistor_temperature(2428, 0, &cal), None);
        // Resistance would be negative.
        assert_eq!(thermistor_temperature(4, 0, &calibration()), None);
    }

    #[test]
    fn test_factory_calibrate() {
        let value = factory_calibrate(&reading(1500, 2428), &calibration(), SensorFamily::Libre2)
            .unwrap();
        let t = thermistor_temperature(2428, 0, &calibration()).unwrap();
        let expected = 65.0 * 1480.0 / 1000.0 * 1.045f64.powf(32.5 - t);
        assert!((value - expected).abs() < 1e-9);
    }

    #[test]
    fn test_check_quality() {
        assert!(check_quality(&reading(1500, 2428)).is_ok());

        let mut flagged = reading(1500, 2428);
        flagged.error = ReadingError::TEMP_HIGH | ReadingError::INVALID_DATA;
        match check_quality(&flagged) {
            Err(Error::DataQuality(flags)) => assert_eq!(flags, flagged.error),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_factory_calibrate_uses_curve_index() {
        let mut cal = calibration();
        cal.i1 = 3;
        let base = factory_calibrate(&reading(1500, 2428), &calibration(), SensorFamily::Libre1)
            .unwrap();
        let shifted = factory_calibrate(&reading(1500, 2428), &cal, SensorFamily::Libre1).unwrap();
        assert!(((base - 3.2) / 0.97 - shifted).abs() < 1e-9);
    }

    #[test]
    fn test_factory_calibrate_degenerate_span() {
        let mut cal = calibration();
        cal.i3 = 1020;
        assert_eq!(
            factory_calibrate(&reading(1500, 2428), &cal, SensorFamily::Libre2),
            None
        );
    }

    #[test]
    fn test_fit_identity_for_few_points() {
        assert_eq!(LinearFit::fit(&[]), LinearFit::IDENTITY);
        assert_eq!(LinearFit::fit(&[point(100.0, 140.0)]), LinearFit::IDENTITY);
        assert_eq!(custom_calibrate(123.0, &[], &ReadableRange::STANDARD), 123.0);
    }

    #[test]
    fn test_fit_exact_line() {
        let fit = LinearFit::fit(&[point(100.0, 110.0), point(200.0, 210.0)]);
        assert!((fit.slope - 1.0).abs() < 1e-12);
        assert!((fit.intercept - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_fit_clamps_slope_then_intercept() {
        let fit = LinearFit::fit(&[point(100.0, 100.0), point(200.0, 400.0)]);
        assert_eq!(fit.slope, 1.25);
        // mean (150, 250): 250 - 1.25 * 150 = 62.5
        assert!((fit.intercept - 62.5).abs() < 1e-12);

        let fit = LinearFit::fit(&[point(100.0, 300.0), point(101.0, 300.5)]);
        assert_eq!(fit.slope, 0.8);
        assert_eq!(fit.intercept, 100.0);
    }

    #[test]
    fn test_fit_degenerate_x() {
        let fit = LinearFit::fit(&[point(120.0, 100.0), point(120.0, 140.0)]);
        assert_eq!(fit.slope, 1.0);
        assert!((fit.intercept - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_fit_ignores_non_finite_points() {
        let fit = LinearFit::fit(&[point(f64::NAN, 1.0), point(100.0, 120.0)]);
        assert_eq!(fit, LinearFit::IDENTITY);
    }

    #[test]
    fn test_custom_calibrate_clamps_to_range() {
        let range = ReadableRange::new(40.0, 500.0);
        assert_eq!(custom_calibrate(10.0, &[], &range), 40.0);
        assert_eq!(custom_calibrate(900.0, &[], &range), 500.0);
    }

    #[test]
    fn test_readable_range_validate() {
        assert!(ReadableRange::STANDARD.validate().is_ok());
        assert!(ReadableRange::new(100.0, 50.0).validate().is_err());
        assert!(ReadableRange::new(f64::NAN, 50.0).validate().is_err());
    }

    #[test]
    fn test_kalman_first_observation_initializes() {
        let mut filter = KalmanFilter::default();
        assert!(!filter.is_primed());
        assert_eq!(filter.update(120.0), 120.0);
        assert!(filter.is_primed());
        assert_eq!(filter.covariance, DEFAULT_FILTER_NOISE);
    }

    #[test]
    fn test_kalman_moves_towards_observation() {
        let mut filter = KalmanFilter::new(2.5);
        filter.update(100.0);
        let estimate = filter.update(110.0);
        // covariance 2.5 -> predicted 5.0 -> gain 5 / 7.5
        assert!((estimate - (100.0 + 10.0 * 2.0 / 3.0)).abs() < 1e-12);
        assert!((filter.covariance - 5.0 / 3.0).abs() < 1e-12);

        filter.reset();
        assert!(!filter.is_primed());
    }

    #[test]
    fn test_kalman_constant_input_is_fixed_point() {
        let mut filter = KalmanFilter::default();
        for _ in 0..20 {
            assert_eq!(filter.update(95.0), 95.0);
        }
    }

    #[test]
    fn test_slope() {
        let t0 = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(slope(t0, 100.0, t0, 150.0), 0.0);
        assert_eq!(slope(t0, 100.0, t0 + Duration::minutes(5), 110.0), 2.0);
        assert_eq!(slope(t0, 100.0, t0 + Duration::minutes(2), 90.0), -5.0);
    }

    #[test]
    fn test_trend_thresholds() {
        assert_eq!(trend(None), TrendArrow::Unknown);
        assert_eq!(trend(Some(f64::NAN)), TrendArrow::Unknown);
        assert_eq!(trend(Some(4.0)), TrendArrow::RapidlyRising);
        assert_eq!(trend(Some(3.5)), TrendArrow::FastRising);
        assert_eq!(trend(Some(2.0)), TrendArrow::Rising);
        assert_eq!(trend(Some(1.0)), TrendArrow::Constant);
        assert_eq!(trend(Some(0.0)), TrendArrow::Constant);
        assert_eq!(trend(Some(-1.0)), TrendArrow::Constant);
        assert_eq!(trend(Some(-1.5)), TrendArrow::Falling);
        assert_eq!(trend(Some(-3.0)), TrendArrow::FastFalling);
        assert_eq!(trend(Some(-3.6)), TrendArrow::RapidlyFalling);
    }

    proptest! {
        #[test]
        fn fit_stays_within_bounds(
            points in proptest::collection::vec((-1000.0f64..1000.0, -1000.0f64..1000.0), 0..20)
        ) {
            let points: Vec<_> = points.into_iter().map(|(x, y)| point(x, y)).collect();
            let fit = LinearFit::fit(&points);
            prop_assert!(fit.slope >= SLOPE_BOUNDS.0 && fit.slope <= SLOPE_BOUNDS.1);
            prop_assert!(fit.intercept >= INTERCEPT_BOUNDS.0 && fit.intercept <= INTERCEPT_BOUNDS.1);
        }

        #[test]
        fn custom_calibrate_stays_in_range(raw in -1e6f64..1e6, n in 0usize..6) {
            let points: Vec<_> = (0..n).map(|i| point(100.0 + i as f64 * 20.0, 90.0 + i as f64 * 25.0)).collect();
            let value = custom_calibrate(raw, &points, &ReadableRange::STANDARD);
            prop_assert!((40.0..=500.0).contains(&value));
        }

        #[test]
        fn slope_of_same_instant_is_zero(a in -500.0f64..500.0, b in -500.0f64..500.0, secs in 0i64..2_000_000_000) {
            let t = OffsetDateTime::from_unix_timestamp(secs).unwrap();
            prop_assert_eq!(slope(t, a, t, b), 0.0);
        }
    }
}
