//! Shard file header codec
//!
//! A shard file starts with a self-describing header followed by a dense
//! array of fixed-size records. The header repeats the channel metadata so
//! that a file can be verified and re-discovered without external state.
//! All integers are big-endian; the trailing CRC32 covers every header byte
//! after the file marker.

use bytes::{Buf, BufMut, BytesMut};

use crate::types::{CalculationMethod, ChannelMetaData, DataType};
use crate::{Result, StratumError};

/// Marker identifying files that can be handled by this back-end
pub const FILE_MARKER: u64 = 0x0a2d_04b2_0b58_0ca9;

/// Version of the file format; foreign versions are refused
pub const FILE_VERSION: i64 = 1;

/// Parsed shard file header
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Byte offset of the first record
    pub data_offset: u64,
    /// Channel metadata stored in the header
    pub meta: ChannelMetaData,
}

/// Byte offset of the first record for the given metadata
pub fn data_offset_for(meta: &ChannelMetaData) -> u64 {
    (11 + meta.calculation_method_parameters.len() as u64) * 8
        + meta.configuration_id.len() as u64
        + 4
}

/// Encode a complete header, marker through CRC
pub fn encode(meta: &ChannelMetaData) -> Vec<u8> {
    let config_id_bytes = meta.configuration_id.as_bytes();
    let data_offset = data_offset_for(meta);

    let mut buf = BytesMut::with_capacity(data_offset as usize);
    buf.put_u64(FILE_MARKER);
    buf.put_u64(data_offset);
    buf.put_i64(FILE_VERSION);
    buf.put_u64(meta.detail_level_id);
    buf.put_i64(meta.start_time);
    buf.put_i64(meta.end_time);
    buf.put_i64(meta.proposed_data_age);
    buf.put_i64(meta.accepted_time_delta);
    buf.put_i64(meta.data_type.to_id());
    buf.put_i64(meta.calculation_method.to_id());
    buf.put_u32(meta.calculation_method_parameters.len() as u32);
    buf.put_u32(config_id_bytes.len() as u32);
    for parameter in &meta.calculation_method_parameters {
        buf.put_i64(*parameter);
    }
    buf.put_slice(config_id_bytes);

    let checksum = crc32fast::hash(&buf[8..]);
    buf.put_u32(checksum);
    buf.to_vec()
}

fn corrupt(path: &str, reason: impl Into<String>) -> StratumError {
    StratumError::CorruptHeader {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Read the file marker and data offset from the first 16 header bytes
pub fn read_data_offset(prefix: &[u8], path: &str) -> Result<u64> {
    if prefix.len() < 16 {
        return Err(corrupt(path, "too small"));
    }
    let mut cursor = &prefix[..16];
    let marker = cursor.get_u64();
    if marker != FILE_MARKER {
        return Err(corrupt(path, "invalid marker"));
    }
    Ok(cursor.get_u64())
}

/// Decode and verify a complete header slice of exactly `data_offset` bytes
pub fn decode(bytes: &[u8], path: &str) -> Result<FileHeader> {
    let data_offset = read_data_offset(bytes, path)?;
    if data_offset as usize != bytes.len() || data_offset < 16 + 8 * 9 + 4 {
        return Err(corrupt(path, "invalid header size"));
    }

    let mut cursor = &bytes[16..];
    let version = cursor.get_i64();
    if version != FILE_VERSION {
        return Err(corrupt(path, format!("wrong version {version}")));
    }
    let detail_level_id = cursor.get_u64();
    let start_time = cursor.get_i64();
    let end_time = cursor.get_i64();
    if start_time >= end_time {
        return Err(corrupt(path, "invalid time span (startTime >= endTime)"));
    }
    let proposed_data_age = cursor.get_i64();
    let accepted_time_delta = cursor.get_i64();
    let data_type = DataType::from_id(cursor.get_i64());
    let calculation_method = CalculationMethod::from_id(cursor.get_i64());
    let parameter_count = cursor.get_u32() as u64;
    let config_id_len = cursor.get_u32() as u64;

    if data_offset != (11 + parameter_count) * 8 + config_id_len + 4 {
        return Err(corrupt(path, "inconsistent data offset"));
    }

    let mut calculation_method_parameters = Vec::with_capacity(parameter_count as usize);
    for _ in 0..parameter_count {
        calculation_method_parameters.push(cursor.get_i64());
    }

    let config_id_bytes = &cursor[..config_id_len as usize];
    cursor.advance(config_id_len as usize);
    let configuration_id = String::from_utf8_lossy(config_id_bytes).replace('\0', "");

    let stored_checksum = cursor.get_u32();
    let checksum = crc32fast::hash(&bytes[8..data_offset as usize - 4]);
    if stored_checksum != checksum {
        return Err(corrupt(
            path,
            format!("checksum mismatch (expected {checksum}, got {stored_checksum})"),
        ));
    }

    Ok(FileHeader {
        data_offset,
        meta: ChannelMetaData {
            configuration_id,
            calculation_method,
            calculation_method_parameters,
            detail_level_id,
            start_time,
            end_time,
            proposed_data_age,
            accepted_time_delta,
            data_type,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ChannelMetaData {
        ChannelMetaData {
            configuration_id: "boiler/steam-flow".into(),
            calculation_method: CalculationMethod::Average,
            calculation_method_parameters: vec![60_000, 7],
            detail_level_id: 2,
            start_time: 1_000,
            end_time: 2_000,
            proposed_data_age: 86_400_000,
            accepted_time_delta: 500,
            data_type: DataType::DoubleValue,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let meta = meta();
        let bytes = encode(&meta);
        assert_eq!(bytes.len() as u64, data_offset_for(&meta));

        let header = decode(&bytes, "test.va").unwrap();
        assert_eq!(header.data_offset, bytes.len() as u64);
        assert_eq!(header.meta, meta);
    }

    #[test]
    fn test_every_covered_byte_is_protected() {
        let bytes = encode(&meta());
        // flipping any bit after the marker must be detected
        for offset in 8..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[offset] ^= 0x01;
            let result = decode(&tampered, "test.va");
            assert!(
                matches!(result, Err(StratumError::CorruptHeader { .. })),
                "flip at offset {offset} went undetected"
            );
        }
    }

    #[test]
    fn test_rejects_foreign_files() {
        let mut bytes = encode(&meta());
        bytes[0] ^= 0xff;
        assert!(decode(&bytes, "test.va").is_err());

        assert!(matches!(
            decode(&[0u8; 8], "test.va"),
            Err(StratumError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn test_nul_stripped_from_configuration_id() {
        let mut meta = meta();
        meta.configuration_id = "tank\0-7".into();
        let header = decode(&encode(&meta), "test.va").unwrap();
        assert_eq!(header.meta.configuration_id, "tank-7");
    }
}
