//! Maximum calculation logic

use super::{
    convert_value, empty_sample, segment_weight, timespan_from, window_stats,
    CalculationLogicProvider,
};
use crate::types::{DataType, Sample, SampleValue, Timestamp};

/// MAXIMUM provider: the largest valid value of the window; the quality
/// indicator is the fraction of the window covered by valid samples
pub struct MaximumCalculationLogicProvider {
    input_type: DataType,
    output_type: DataType,
    required_timespan: i64,
}

impl MaximumCalculationLogicProvider {
    pub fn new(input_type: DataType, output_type: DataType, parameters: &[i64]) -> Self {
        Self {
            input_type,
            output_type,
            required_timespan: timespan_from(parameters),
        }
    }
}

fn is_greater(candidate: SampleValue, best: SampleValue) -> bool {
    match (candidate, best) {
        (SampleValue::Long(a), SampleValue::Long(b)) => a > b,
        (a, b) => a.as_f64() > b.as_f64(),
    }
}

impl CalculationLogicProvider for MaximumCalculationLogicProvider {
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
            if best.map_or(true, |current| is_greater(sample.value, current)) {
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
