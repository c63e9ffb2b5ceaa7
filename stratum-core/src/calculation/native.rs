//! Pass-through calculation logic

use super::{convert_value, empty_sample, timespan_from, CalculationLogicProvider};
use crate::types::{DataType, Sample, Timestamp};

/// NATIVE provider: input values remain unchanged and are forwarded
/// immediately
pub struct NativeCalculationLogicProvider {
    input_type: DataType,
    output_type: DataType,
    required_timespan: i64,
}

impl NativeCalculationLogicProvider {
    pub fn new(input_type: DataType, output_type: DataType, parameters: &[i64]) -> Self {
        Self {
            input_type,
            output_type,
            required_timespan: timespan_from(parameters),
        }
    }
}

impl CalculationLogicProvider for NativeCalculationLogicProvider {
    fn pass_through(&self) -> bool {
        true
    }

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
        match samples.first() {
            Some(sample) => Sample {
                value: convert_value(sample.value, self.output_type),
                ..*sample
            },
            None => empty_sample(window_start, self.output_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleValue;

    #[test]
    fn test_identity() {
        let provider = NativeCalculationLogicProvider::new(
            DataType::LongValue,
            DataType::LongValue,
            &[],
        );
        let sample = Sample::new_long(123, 0.8, 0.1, 4, -17);
        assert_eq!(provider.generate_value(0, &[sample]), sample);
    }

    #[test]
    fn test_widening_conversion() {
        let provider = NativeCalculationLogicProvider::new(
            DataType::LongValue,
            DataType::DoubleValue,
            &[],
        );
        let sample = Sample::new_long(123, 1.0, 0.0, 1, 42);
        assert_eq!(
            provider.generate_value(0, &[sample]).value,
            SampleValue::Double(42.0)
        );
    }
}
