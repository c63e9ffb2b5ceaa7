//! Core types for stratum

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, StratumError};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Payload type of a stored stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// The payload type is unknown
    Unknown,
    /// 64-bit signed integer payload
    LongValue,
    /// 64-bit float payload
    DoubleValue,
}

impl DataType {
    /// On-disk encoding of the data type
    pub fn to_id(self) -> i64 {
        match self {
            DataType::Unknown => 0,
            DataType::LongValue => 1,
            DataType::DoubleValue => 2,
        }
    }

    /// Decode from the on-disk encoding; unknown ids map to `Unknown`
    pub fn from_id(id: i64) -> Self {
        match id {
            1 => DataType::LongValue,
            2 => DataType::DoubleValue,
            _ => DataType::Unknown,
        }
    }
}

/// Reduction function applied to a stream at a detail level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalculationMethod {
    /// The calculation method is unknown
    Unknown,
    /// Values are passed through unchanged
    Native,
    /// Time-weighted average of the values within a window
    Average,
    /// Minimum value within a window
    Minimum,
    /// Maximum value within a window
    Maximum,
}

impl CalculationMethod {
    /// On-disk encoding of the calculation method
    pub fn to_id(self) -> i64 {
        match self {
            CalculationMethod::Native => 0,
            CalculationMethod::Average => 1,
            CalculationMethod::Minimum => 2,
            CalculationMethod::Maximum => 3,
            CalculationMethod::Unknown => -1,
        }
    }

    /// Decode from the on-disk encoding; unknown ids map to `Unknown`
    pub fn from_id(id: i64) -> Self {
        match id {
            0 => CalculationMethod::Native,
            1 => CalculationMethod::Average,
            2 => CalculationMethod::Minimum,
            3 => CalculationMethod::Maximum,
            _ => CalculationMethod::Unknown,
        }
    }

    /// Short code used in file names
    pub fn short_code(self) -> &'static str {
        match self {
            CalculationMethod::Native => "NAT",
            CalculationMethod::Average => "AVG",
            CalculationMethod::Minimum => "MIN",
            CalculationMethod::Maximum => "MAX",
            CalculationMethod::Unknown => "UNK",
        }
    }

    /// Inverse of [`short_code`](Self::short_code); unknown codes map to `Unknown`
    pub fn from_short_code(code: &str) -> Self {
        match code {
            "NAT" => CalculationMethod::Native,
            "AVG" => CalculationMethod::Average,
            "MIN" => CalculationMethod::Minimum,
            "MAX" => CalculationMethod::Maximum,
            _ => CalculationMethod::Unknown,
        }
    }
}

/// Payload of a sample, long or double flavor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    /// 64-bit signed integer
    Long(i64),
    /// 64-bit float
    Double(f64),
}

impl SampleValue {
    /// Data type of the payload
    pub fn data_type(self) -> DataType {
        match self {
            SampleValue::Long(_) => DataType::LongValue,
            SampleValue::Double(_) => DataType::DoubleValue,
        }
    }

    /// Get as i64; doubles round half away from zero
    pub fn as_i64(self) -> i64 {
        match self {
            SampleValue::Long(v) => v,
            SampleValue::Double(v) => v.round() as i64,
        }
    }

    /// Get as f64; longs widen
    pub fn as_f64(self) -> f64 {
        match self {
            SampleValue::Long(v) => v as f64,
            SampleValue::Double(v) => v,
        }
    }
}

/// A single stored sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp in milliseconds since Unix epoch
    pub time: Timestamp,
    /// Quality of the data in [0, 1]; 0 means no valid data
    pub quality_indicator: f64,
    /// Fraction of the sample's window that was manually overridden, in [0, 1]
    pub manual_indicator: f64,
    /// Count of primitive samples folded into this one
    pub base_value_count: u64,
    /// Payload
    pub value: SampleValue,
}

impl Sample {
    /// Create a long-flavored sample
    pub fn new_long(
        time: Timestamp,
        quality_indicator: f64,
        manual_indicator: f64,
        base_value_count: u64,
        value: i64,
    ) -> Self {
        Self {
            time,
            quality_indicator,
            manual_indicator,
            base_value_count,
            value: SampleValue::Long(value),
        }
    }

    /// Create a double-flavored sample
    pub fn new_double(
        time: Timestamp,
        quality_indicator: f64,
        manual_indicator: f64,
        base_value_count: u64,
        value: f64,
    ) -> Self {
        Self {
            time,
            quality_indicator,
            manual_indicator,
            base_value_count,
            value: SampleValue::Double(value),
        }
    }

    /// Convert the payload to the long flavor (rounds half away from zero)
    pub fn into_long(self) -> Self {
        Self {
            value: SampleValue::Long(self.value.as_i64()),
            ..self
        }
    }

    /// Convert the payload to the double flavor (widens)
    pub fn into_double(self) -> Self {
        Self {
            value: SampleValue::Double(self.value.as_f64()),
            ..self
        }
    }

    /// Convert the payload to the given data type; `Unknown` leaves it untouched
    pub fn into_data_type(self, data_type: DataType) -> Self {
        match data_type {
            DataType::LongValue => self.into_long(),
            DataType::DoubleValue => self.into_double(),
            DataType::Unknown => self,
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            SampleValue::Long(v) => write!(
                f,
                "LONG: {} (q: {}, m: {}, @: {}, t: {})",
                v, self.quality_indicator, self.manual_indicator, self.base_value_count, self.time
            ),
            SampleValue::Double(v) => write!(
                f,
                "DOUBLE: {} (q: {}, m: {}, @: {}, t: {})",
                v, self.quality_indicator, self.manual_indicator, self.base_value_count, self.time
            ),
        }
    }
}

/// Per-stream metadata describing one storage channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetaData {
    /// Identifier of the logical stream
    pub configuration_id: String,
    /// Reduction function of this channel
    pub calculation_method: CalculationMethod,
    /// Provider-specific parameters; index 0 is the required timespan in ms
    pub calculation_method_parameters: Vec<i64>,
    /// Detail level; 0 is the raw/native level, higher is coarser
    pub detail_level_id: u64,
    /// Start of the covered time span (inclusive), ms
    pub start_time: Timestamp,
    /// End of the covered time span (exclusive), ms
    pub end_time: Timestamp,
    /// Retention target in ms
    pub proposed_data_age: i64,
    /// Tolerance for merging nearby samples, ms; metadata only
    pub accepted_time_delta: i64,
    /// Payload type of the stream
    pub data_type: DataType,
}

impl ChannelMetaData {
    /// Check the invariants that every channel metadata must satisfy
    pub fn validate(&self) -> Result<()> {
        if self.configuration_id.trim().is_empty() {
            return Err(StratumError::InvalidArgument(
                "empty configuration id".into(),
            ));
        }
        if self.start_time >= self.end_time {
            return Err(StratumError::InvalidArgument(format!(
                "invalid time span for '{}' (startTime {} >= endTime {})",
                self.configuration_id, self.start_time, self.end_time
            )));
        }
        Ok(())
    }

    /// Derive the metadata of a single shard covering `[start_time, end_time)`
    pub fn for_span(&self, start_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            start_time,
            end_time,
            ..self.clone()
        }
    }
}

impl fmt::Display for ChannelMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} [{}, {})",
            self.configuration_id,
            self.detail_level_id,
            self.calculation_method.short_code(),
            self.start_time,
            self.end_time
        )
    }
}
