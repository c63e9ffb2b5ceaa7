//! Minimum calculation logic

use super::{
    convert_value, empty_sample, segment_weight, timespan_from, window_stats,
    CalculationLogicProvider,
};
use crate::types::{DataType, Sample, SampleValue, Timestamp};

/// MINIMUM provider: the smallest valid value of the window; the quality
/// indicator is the fraction of the window covered by valid samples
pub struct MinimumCalculationLogicProvider {
    input_type: DataType,
    output_type: DataType,
    required_timespan: i64,
}

impl MinimumCalculationLogicProvider {
    pub fn new(input_type: DataType, output_type: DataType, parameters: &[i64]) -> Self {
        Self {
            input_type,
            output_type,
            required_timespan: timespan_from(parameters),
        }
    }
}

fn is_less(candidate: SampleValue, best: SampleValue) -> bool {
    match (candidate, best) {
        (SampleValue::Long(a), SampleValue::Long(b)) => a < b,
        (a, b) => a.as_f64() < b.as_f64(),
    }
}

impl CalculationLogicProvider for MinimumCalculationLogicProvider {
    fn required_timespan(&self) -> i64 {
        self.required_timespan
    }

    fn input_type(&self) -> DataType {
        self.input_type
    }

    fn output_type(&self) -> DataType {
        self.output_type
    }

    fn generate_value(&self, window_start: Timestamp, samples: &[Sample]) -> Sample {
        let mut best: Option<SampleValue> = None;
        for (index, sample) in samples.iter().enumerate() {
            if sample.quality_indicator <= 0.0 {
                continue;
            }
            if segment_weight(window_start, self.required_timespan, samples, index) <= 0 {
                continue;
            }
            if best.map_or(true, |current| is_less(sample.value, current)) {
                best = Some(sample.value);
            }
        }
        let best = match best {
            Some(best) => best,
            None => return empty_sample(window_start, self.output_type),
        };
        let stats = window_stats(window_start, self.required_timespan, samples);
        Sample {
            time: window_start,
            quality_indicator: stats.valid_weight as f64 / stats.span as f64,
            manual_indicator: stats.weighted_manual / stats.span as f64,
            base_value_count: stats.base_value_count,
            value: convert_value(best, self.output_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_of_valid_samples() {
        let provider = MinimumCalculationLogicProvider::new(
            DataType::LongValue,
            DataType::LongValue,
            &[1000],
        );
        let samples = [
            Sample::new_long(0, 1.0, 0.0, 1, 8),
            Sample::new_long(250, 0.0, 0.0, 1, -99), // invalid, ignored
            Sample::new_long(500, 1.0, 0.0, 1, 3),
            Sample::new_long(750, 1.0, 0.0, 1, 5),
        ];
        let result = provider.generate_value(0, &samples);
        assert_eq!(result.value, SampleValue::Long(3));
        // 750 of 1000 ms are covered by valid samples
        assert_eq!(result.quality_indicator, 0.75);
        assert_eq!(result.base_value_count, 3);
    }

    #[test]
    fn test_empty_window() {
        let provider = MinimumCalculationLogicProvider::new(
            DataType::LongValue,
            DataType::LongValue,
            &[1000],
        );
        let result = provider.generate_value(500, &[]);
        assert_eq!(result.time, 500);
        assert_eq!(result.quality_indicator, 0.0);
        assert_eq!(result.value, SampleValue::Long(0));
    }
}
