//! File back-end factory
//!
//! Maps channel metadata onto on-disk names of the shape
//! `{configId}_{detailLevelId}_{method}_{startTime}_{endTime}.va` below
//! `{root}/{configId}/`, discovers existing shard files and verifies that a
//! file's header matches what its name claims. Files that fail verification
//! are ignored with a warning, never deleted.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, TimeZone, Timelike, Utc};
use tracing::warn;

use super::file::FileBackEnd;
use crate::types::{CalculationMethod, ChannelMetaData, Timestamp};
use crate::Result;

/// Extension of shard files
const FILE_EXTENSION: &str = "va";

/// Creates shard file back-ends and discovers existing ones
pub struct FileBackEndFactory {
    file_root: PathBuf,
    max_keep_open_detail_level: i64,
}

/// Fragments a shard file name decomposes into
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedFileName {
    configuration_id: String,
    detail_level_id: u64,
    method_code: String,
}

/// Convert text to a valid file name part: percent-encoded UTF-8 with the
/// part separator `_` replaced by a single space
pub fn encode_name_part(raw: &str) -> String {
    urlencoding::encode(raw).replace('_', " ")
}

/// Inverse of [`encode_name_part`]
pub fn decode_name_part(part: &str) -> String {
    let restored = part.replace(' ', "_");
    urlencoding::decode(&restored)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(restored)
}

/// Render a timestamp as the `YYYYMMDD.HHMMSS.mmm.dstOffset` file name part.
/// Times are rendered in UTC, so the trailing DST digit is always zero.
pub fn encode_time_part(time: Timestamp) -> String {
    match Utc.timestamp_millis_opt(time).single() {
        Some(instant) => format!(
            "{:04}{:02}{:02}.{:02}{:02}{:02}.{:03}.0",
            instant.year(),
            instant.month(),
            instant.day(),
            instant.hour(),
            instant.minute(),
            instant.second(),
            instant.timestamp_subsec_millis(),
        ),
        None => time.to_string(),
    }
}

/// Whether a file name fragment has the `YYYYMMDD.HHMMSS.mmm.dstOffset`
/// shape. Names written by the older schema revision lack the DST digit and
/// are refused.
fn is_time_part(part: &str) -> bool {
    let groups: Vec<&str> = part.split('.').collect();
    groups.len() == 4
        && groups
            .iter()
            .all(|group| !group.is_empty() && group.bytes().all(|b| b.is_ascii_digit()))
}

fn parse_file_name(name: &str) -> Option<ParsedFileName> {
    let stem = name.strip_suffix(&format!(".{FILE_EXTENSION}"))?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() != 5 {
        return None;
    }
    if !is_time_part(parts[3]) || !is_time_part(parts[4]) {
        warn!(
            "file name '{}' carries an unsupported time stamp shape, file will be ignored",
            name
        );
        return None;
    }
    Some(ParsedFileName {
        configuration_id: parts[0].to_string(),
        detail_level_id: parts[1].parse().ok()?,
        method_code: parts[2].to_string(),
    })
}

impl FileBackEndFactory {
    /// Create a factory rooted at `file_root`; shards at detail levels up to
    /// `max_keep_open_detail_level` keep their descriptor open while
    /// initialized (a negative value keeps none open)
    pub fn new(file_root: impl Into<PathBuf>, max_keep_open_detail_level: i64) -> Self {
        Self {
            file_root: file_root.into(),
            max_keep_open_detail_level,
        }
    }

    /// Root folder the shard files live in
    pub fn file_root(&self) -> &Path {
        &self.file_root
    }

    fn keep_open(&self, detail_level_id: u64) -> bool {
        detail_level_id as i64 <= self.max_keep_open_detail_level
    }

    /// File name a shard with the given metadata is stored under
    pub fn file_name(&self, meta: &ChannelMetaData) -> PathBuf {
        let configuration_part = encode_name_part(&meta.configuration_id);
        let file = format!(
            "{}_{}_{}_{}_{}.{}",
            configuration_part,
            meta.detail_level_id,
            meta.calculation_method.short_code(),
            encode_time_part(meta.start_time),
            encode_time_part(meta.end_time),
            FILE_EXTENSION,
        );
        self.file_root.join(configuration_part).join(file)
    }

    /// Construct an uninitialized back-end bound to the path the metadata
    /// maps to; the caller invokes `create` to materialize it on disk
    pub fn create_new_back_end(&self, meta: &ChannelMetaData) -> Result<FileBackEnd> {
        meta.validate()?;
        FileBackEnd::new(self.file_name(meta), self.keep_open(meta.detail_level_id))
    }

    /// Open a discovered file and verify that its header matches the claims
    /// encoded in its name; mismatching or unreadable files yield `None`
    fn open_verified(&self, path: &Path, parsed: &ParsedFileName, keep_open: bool) -> Option<(FileBackEnd, ChannelMetaData)> {
        let backend = match FileBackEnd::new(path, keep_open) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("file '{}' could not be evaluated and will be ignored: {}", path.display(), e);
                return None;
            }
        };
        if let Err(e) = backend.initialize(None) {
            warn!("file '{}' could not be evaluated and will be ignored: {}", path.display(), e);
            return None;
        }
        let meta = match backend.meta() {
            Ok(meta) => meta,
            Err(e) => {
                warn!("metadata of file '{}' could not be retrieved, file will be ignored: {}", path.display(), e);
                return None;
            }
        };
        let claims_match = encode_name_part(&meta.configuration_id) == parsed.configuration_id
            && meta.detail_level_id == parsed.detail_level_id
            && meta.calculation_method.short_code() == parsed.method_code;
        if !claims_match {
            warn!(
                "file content of '{}' does not match its name (header: {}), file will be ignored",
                path.display(),
                meta
            );
            return None;
        }
        Some((backend, meta))
    }

    fn scan_directory(
        &self,
        directory: &Path,
        mut matches: impl FnMut(&ParsedFileName) -> bool,
        keep_open: bool,
    ) -> Result<Vec<(FileBackEnd, ChannelMetaData)>> {
        let mut found = Vec::new();
        if !directory.is_dir() {
            return Ok(found);
        }
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let parsed = match parse_file_name(name) {
                Some(parsed) => parsed,
                None => continue,
            };
            if !matches(&parsed) {
                continue;
            }
            if let Some(hit) = self.open_verified(&path, &parsed, keep_open) {
                found.push(hit);
            }
        }
        Ok(found)
    }

    /// All verified back-ends of one channel, sorted by end time descending
    /// then start time descending. The returned handles are deinitialized.
    pub fn existing_back_ends(
        &self,
        configuration_id: &str,
        detail_level_id: u64,
        method: CalculationMethod,
    ) -> Result<Vec<FileBackEnd>> {
        let configuration_part = encode_name_part(configuration_id);
        let directory = self.file_root.join(&configuration_part);
        let mut found = self.scan_directory(
            &directory,
            |parsed| {
                parsed.configuration_id == configuration_part
                    && parsed.detail_level_id == detail_level_id
                    && parsed.method_code == method.short_code()
            },
            self.keep_open(detail_level_id),
        )?;
        found.sort_by(|(_, a), (_, b)| {
            b.end_time
                .cmp(&a.end_time)
                .then(b.start_time.cmp(&a.start_time))
        });
        let mut back_ends = Vec::with_capacity(found.len());
        for (backend, _) in found {
            backend.deinitialize()?;
            back_ends.push(backend);
        }
        Ok(back_ends)
    }

    /// Metadata of all existing back-ends, for one configuration or all.
    ///
    /// With `merge` the entries are grouped by configuration, detail level and
    /// method; each group's time span is widened to the union and the
    /// remaining fields are taken from the member with the latest end time.
    pub fn existing_back_ends_meta_data(
        &self,
        configuration_id: Option<&str>,
        merge: bool,
    ) -> Result<Vec<ChannelMetaData>> {
        let mut directories = Vec::new();
        if let Some(configuration_id) = configuration_id {
            directories.push(self.file_root.join(encode_name_part(configuration_id)));
        } else if self.file_root.is_dir() {
            for entry in fs::read_dir(&self.file_root)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    directories.push(entry.path());
                }
            }
        }

        let mut metas: Vec<ChannelMetaData> = Vec::new();
        for directory in directories {
            for (backend, meta) in self.scan_directory(&directory, |_| true, false)? {
                backend.deinitialize()?;
                if !merge {
                    metas.push(meta);
                    continue;
                }
                let group = metas.iter_mut().find(|entry| {
                    entry.configuration_id == meta.configuration_id
                        && entry.detail_level_id == meta.detail_level_id
                        && entry.calculation_method == meta.calculation_method
                });
                match group {
                    Some(entry) => {
                        let start_time = entry.start_time.min(meta.start_time);
                        let end_time = entry.end_time.max(meta.end_time);
                        if entry.end_time < meta.end_time {
                            *entry = meta;
                        }
                        entry.start_time = start_time;
                        entry.end_time = end_time;
                    }
                    None => metas.push(meta),
                }
            }
        }
        Ok(metas)
    }

    /// Remove every shard file of a configuration, then its directory
    pub fn delete_back_ends(&self, configuration_id: &str) -> Result<()> {
        let directory = self.file_root.join(encode_name_part(configuration_id));
        if !directory.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&directory)? {
            let entry = entry?;
            let path = entry.path();
            let is_shard = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_file_name)
                .is_some();
            if is_shard {
                fs::remove_file(&path)?;
            }
        }
        if let Err(e) = fs::remove_dir(&directory) {
            warn!("could not delete directory '{}': {}", directory.display(), e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Sample};
    use tempfile::TempDir;

    fn meta(config: &str, level: u64, method: CalculationMethod, start: i64, end: i64) -> ChannelMetaData {
        ChannelMetaData {
            configuration_id: config.into(),
            calculation_method: method,
            calculation_method_parameters: vec![],
            detail_level_id: level,
            start_time: start,
            end_time: end,
            proposed_data_age: 86_400_000,
            accepted_time_delta: 0,
            data_type: DataType::LongValue,
        }
    }

    fn materialize(factory: &FileBackEndFactory, meta: &ChannelMetaData) {
        let backend = factory.create_new_back_end(meta).unwrap();
        backend.create(meta).unwrap();
        backend.initialize(None).unwrap();
        backend
            .update_sample(Sample::new_long(meta.start_time, 1.0, 0.0, 1, 1))
            .unwrap();
        backend.deinitialize().unwrap();
    }

    #[test]
    fn test_name_part_encoding_round_trip() {
        for raw in ["plain", "with_underscore", "with space", "umlaut-äß/slash"] {
            let encoded = encode_name_part(raw);
            assert!(!encoded.contains('_'), "separator leaked into '{encoded}'");
            assert_eq!(decode_name_part(&encoded), raw);
        }
    }

    #[test]
    fn test_time_part_format() {
        // 2001-09-09T01:46:40.123Z
        assert_eq!(encode_time_part(1_000_000_000_123), "20010909.014640.123.0");
        assert_eq!(encode_time_part(0), "19700101.000000.000.0");
        // discovery accepts exactly the rendered shape and refuses the older
        // schema without the DST digit
        assert!(is_time_part(&encode_time_part(1_000_000_000_123)));
        assert!(!is_time_part("20010909.014640.123"));
        assert!(!is_time_part("20010909.014640.123.0.0"));
        assert!(!is_time_part("20010909.0146xx.123.0"));
    }

    #[test]
    fn test_old_timestamp_schema_is_ignored() {
        let dir = TempDir::new().unwrap();
        let factory = FileBackEndFactory::new(dir.path(), 0);
        let meta_a = meta("conf", 0, CalculationMethod::Native, 0, 1000);
        materialize(&factory, &meta_a);

        // rewrite the start time into the older schema without the DST digit
        let original = factory.file_name(&meta_a);
        let renamed = original.to_string_lossy().replace(".000.0_", ".000_");
        assert_ne!(original.to_string_lossy(), renamed);
        fs::rename(&original, &renamed).unwrap();

        assert!(factory
            .existing_back_ends("conf", 0, CalculationMethod::Native)
            .unwrap()
            .is_empty());
        assert!(factory
            .existing_back_ends_meta_data(Some("conf"), false)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_discovery_sorted_descending() {
        let dir = TempDir::new().unwrap();
        let factory = FileBackEndFactory::new(dir.path(), 0);
        materialize(&factory, &meta("conf_a", 0, CalculationMethod::Native, 0, 1000));
        materialize(&factory, &meta("conf_a", 0, CalculationMethod::Native, 1000, 2000));
        // different level and method must not be picked up
        materialize(&factory, &meta("conf_a", 1, CalculationMethod::Average, 0, 1000));

        let found = factory
            .existing_back_ends("conf_a", 0, CalculationMethod::Native)
            .unwrap();
        assert_eq!(found.len(), 2);
        for backend in &found {
            backend.initialize(None).unwrap();
        }
        assert_eq!(found[0].meta().unwrap().end_time, 2000);
        assert_eq!(found[1].meta().unwrap().end_time, 1000);
    }

    #[test]
    fn test_mismatching_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let factory = FileBackEndFactory::new(dir.path(), 0);
        let meta_a = meta("conf", 0, CalculationMethod::Native, 0, 1000);
        materialize(&factory, &meta_a);

        // claim a different detail level in the file name
        let original = factory.file_name(&meta_a);
        let renamed = original
            .to_string_lossy()
            .replace("conf_0_NAT", "conf_7_NAT");
        fs::rename(&original, renamed).unwrap();

        assert!(factory
            .existing_back_ends("conf", 7, CalculationMethod::Native)
            .unwrap()
            .is_empty());
        assert!(factory
            .existing_back_ends("conf", 0, CalculationMethod::Native)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_meta_data_merge_widens_spans() {
        let dir = TempDir::new().unwrap();
        let factory = FileBackEndFactory::new(dir.path(), 0);
        let mut newer = meta("conf", 0, CalculationMethod::Native, 1000, 2000);
        newer.proposed_data_age = 7;
        materialize(&factory, &meta("conf", 0, CalculationMethod::Native, 0, 1000));
        materialize(&factory, &newer);

        let merged = factory.existing_back_ends_meta_data(Some("conf"), true).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start_time, 0);
        assert_eq!(merged[0].end_time, 2000);
        // non-span fields come from the member with the latest end time
        assert_eq!(merged[0].proposed_data_age, 7);

        let raw = factory.existing_back_ends_meta_data(Some("conf"), false).unwrap();
        assert_eq!(raw.len(), 2);
    }

    #[test]
    fn test_delete_back_ends_removes_directory() {
        let dir = TempDir::new().unwrap();
        let factory = FileBackEndFactory::new(dir.path(), 0);
        materialize(&factory, &meta("doomed", 0, CalculationMethod::Native, 0, 1000));
        assert!(dir.path().join("doomed").is_dir());

        factory.delete_back_ends("doomed").unwrap();
        assert!(!dir.path().join("doomed").exists());
        // deleting a configuration that never existed is fine
        factory.delete_back_ends("doomed").unwrap();
    }
}
