//! Time-weighted average calculation logic

use super::{empty_sample, timespan_from, window_stats, CalculationLogicProvider};
use crate::types::{DataType, Sample, SampleValue, Timestamp};

/// AVERAGE provider: the value is the mean of the inputs weighted by the
/// duration each input was valid for; the quality indicator is the
/// duration-weighted mean of the input qualities over the whole window
pub struct AverageCalculationLogicProvider {
    input_type: DataType,
    output_type: DataType,
    required_timespan: i64,
}

impl AverageCalculationLogicProvider {
    pub fn new(input_type: DataType, output_type: DataType, parameters: &[i64]) -> Self {
        Self {
            input_type,
            output_type,
            required_timespan: timespan_from(parameters),
        }
    }
}

impl CalculationLogicProvider for AverageCalculationLogicProvider {
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
        let stats = window_stats(window_start, self.required_timespan, samples);
        if stats.valid_weight == 0 {
            return empty_sample(window_start, self.output_type);
        }
        let mean = stats.weighted_value / stats.valid_weight as f64;
        Sample {
            time: window_start,
            quality_indicator: stats.weighted_quality / stats.span as f64,
            manual_indicator: stats.weighted_manual / stats.span as f64,
            base_value_count: stats.base_value_count,
            value: match self.output_type {
                DataType::DoubleValue | DataType::Unknown => SampleValue::Double(mean),
                DataType::LongValue => SampleValue::Long(mean.round() as i64),
            },
        }
    }
}
