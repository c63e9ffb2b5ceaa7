//! Calculation logic providers
//!
//! A provider reduces the samples of one time window into a single aggregated
//! sample for the next coarser detail level. NATIVE passes values through
//! unchanged; AVERAGE, MINIMUM and MAXIMUM weight their inputs by the
//! duration each sample is valid for within the window. Samples with a
//! quality indicator of zero carry no data and are excluded from the value.

mod average;
mod maximum;
mod minimum;
mod native;

pub use average::AverageCalculationLogicProvider;
pub use maximum::MaximumCalculationLogicProvider;
pub use minimum::MinimumCalculationLogicProvider;
pub use native::NativeCalculationLogicProvider;

use crate::types::{CalculationMethod, DataType, Sample, SampleValue, Timestamp};
use crate::{Result, StratumError};

/// Reduction logic applied between two detail levels
pub trait CalculationLogicProvider: Send + Sync {
    /// Whether input values are forwarded without delay (NATIVE)
    fn pass_through(&self) -> bool {
        false
    }

    /// Time span in ms that has to be filled before a new value is calculated
    fn required_timespan(&self) -> i64;

    /// Data type of the input values
    fn input_type(&self) -> DataType;

    /// Data type of the calculated values
    fn output_type(&self) -> DataType;

    /// Reduce the window `[window_start, window_start + required_timespan)`
    /// into one sample stamped with the window start. `samples` are sorted
    /// ascending and may lead with one sample before the window start that
    /// paints the opening state.
    fn generate_value(&self, window_start: Timestamp, samples: &[Sample]) -> Sample;
}

/// Construct the provider for a calculation method.
///
/// The first calculation method parameter is the provider's required
/// timespan in milliseconds; a missing parameter means 1 ms.
pub fn create_provider(
    method: CalculationMethod,
    input_type: DataType,
    output_type: DataType,
    parameters: &[i64],
) -> Result<Box<dyn CalculationLogicProvider>> {
    match method {
        CalculationMethod::Native => Ok(Box::new(NativeCalculationLogicProvider::new(
            input_type,
            output_type,
            parameters,
        ))),
        CalculationMethod::Average => Ok(Box::new(AverageCalculationLogicProvider::new(
            input_type,
            output_type,
            parameters,
        ))),
        CalculationMethod::Minimum => Ok(Box::new(MinimumCalculationLogicProvider::new(
            input_type,
            output_type,
            parameters,
        ))),
        CalculationMethod::Maximum => Ok(Box::new(MaximumCalculationLogicProvider::new(
            input_type,
            output_type,
            parameters,
        ))),
        CalculationMethod::Unknown => Err(StratumError::InvalidArgument(
            "no calculation logic exists for method UNKNOWN".into(),
        )),
    }
}

pub(crate) fn timespan_from(parameters: &[i64]) -> i64 {
    parameters.first().copied().unwrap_or(1).max(1)
}

/// Convert a payload to the provider's output type
pub(crate) fn convert_value(value: SampleValue, output_type: DataType) -> SampleValue {
    match output_type {
        DataType::LongValue => SampleValue::Long(value.as_i64()),
        DataType::DoubleValue => SampleValue::Double(value.as_f64()),
        DataType::Unknown => value,
    }
}

/// Sample emitted for a window without any valid input
pub(crate) fn empty_sample(time: Timestamp, output_type: DataType) -> Sample {
    Sample {
        time,
        quality_indicator: 0.0,
        manual_indicator: 0.0,
        base_value_count: 0,
        value: match output_type {
            DataType::DoubleValue => SampleValue::Double(f64::NAN),
            _ => SampleValue::Long(0),
        },
    }
}

/// Duration-weighted aggregates over one window.
///
/// Each sample is weighted by the span from its (window-clamped) time to the
/// next sample's time or the window end. Quality and manual indicators are
/// accumulated over every sample; value and base value count only over those
/// with quality above zero.
pub(crate) struct WindowStats {
    pub span: i64,
    pub valid_weight: i64,
    pub weighted_quality: f64,
    pub weighted_manual: f64,
    pub weighted_value: f64,
    pub base_value_count: u64,
}

pub(crate) fn window_stats(window_start: Timestamp, span: i64, samples: &[Sample]) -> WindowStats {
    let window_end = window_start.saturating_add(span);
    let mut stats = WindowStats {
        span,
        valid_weight: 0,
        weighted_quality: 0.0,
        weighted_manual: 0.0,
        weighted_value: 0.0,
        base_value_count: 0,
    };
    for (index, sample) in samples.iter().enumerate() {
        let segment_start = sample.time.max(window_start);
        let segment_end = samples
            .get(index + 1)
            .map(|next| next.time)
            .unwrap_or(window_end)
            .min(window_end);
        if segment_end <= segment_start {
            continue;
        }
        let weight = (segment_end - segment_start) as f64;
        stats.weighted_quality += sample.quality_indicator * weight;
        stats.weighted_manual += sample.manual_indicator * weight;
        if sample.quality_indicator > 0.0 {
            stats.valid_weight += segment_end - segment_start;
            stats.weighted_value += sample.value.as_f64() * weight;
            stats.base_value_count += sample.base_value_count;
        }
    }
    stats
}

/// Weight of one sample's segment within the window, 0 when it has none
pub(crate) fn segment_weight(
    window_start: Timestamp,
    span: i64,
    samples: &[Sample],
    index: usize,
) -> i64 {
    let window_end = window_start.saturating_add(span);
    let segment_start = samples[index].time.max(window_start);
    let segment_end = samples
        .get(index + 1)
        .map(|next| next.time)
        .unwrap_or(window_end)
        .min(window_end);
    (segment_end - segment_start).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_construction() {
        let provider = create_provider(
            CalculationMethod::Average,
            DataType::LongValue,
            DataType::LongValue,
            &[60_000],
        )
        .unwrap();
        assert!(!provider.pass_through());
        assert_eq!(provider.required_timespan(), 60_000);

        let native = create_provider(
            CalculationMethod::Native,
            DataType::LongValue,
            DataType::LongValue,
            &[],
        )
        .unwrap();
        assert!(native.pass_through());

        assert!(create_provider(
            CalculationMethod::Unknown,
            DataType::LongValue,
            DataType::LongValue,
            &[],
        )
        .is_err());
    }

    #[test]
    fn test_window_stats_weighting() {
        // sample a covers [0,600), b covers [600,1000)
        let samples = [
            Sample::new_long(0, 1.0, 0.0, 2, 10),
            Sample::new_long(600, 0.5, 1.0, 3, 20),
        ];
        let stats = window_stats(0, 1000, &samples);
        assert_eq!(stats.valid_weight, 1000);
        assert_eq!(stats.weighted_quality, 600.0 + 0.5 * 400.0);
        assert_eq!(stats.weighted_manual, 400.0);
        assert_eq!(stats.weighted_value, 10.0 * 600.0 + 20.0 * 400.0);
        assert_eq!(stats.base_value_count, 5);
    }

    #[test]
    fn test_window_stats_clamps_leading_state() {
        // opening state carried from before the window start
        let samples = [
            Sample::new_long(-500, 1.0, 0.0, 1, 10),
            Sample::new_long(250, 0.0, 0.0, 1, 0),
        ];
        let stats = window_stats(0, 1000, &samples);
        assert_eq!(stats.valid_weight, 250);
        assert_eq!(stats.weighted_value, 10.0 * 250.0);
        // the zero-quality tail still counts into the quality mean
        assert_eq!(stats.weighted_quality, 250.0);
    }
}
