//! File back-end
//!
//! Stores one contiguous `[start, end)` window of a stream in a single file:
//! a self-describing header followed by fixed-size records sorted strictly
//! ascending by time. Records are protected by a one-byte LRC, the header by
//! a CRC32. Insertion happens in place; a torn trailing record (crash during
//! write) is skipped with a warning and overwritten by the next insert.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::header::{self, FileHeader};
use crate::channel::StorageChannel;
use crate::types::{ChannelMetaData, DataType, Sample, SampleValue, Timestamp};
use crate::{Result, StratumError};

/// Size of one record in the file
pub const RECORD_SIZE: u64 = 41;

/// Seed of the record LRC
const LRC_SEED: u8 = 0x5a;

/// Upper bound for the copy buffer when shifting records within a file
const MAX_COPY_BUFFER_FILL_SIZE: u64 = 1024 * 1024;

/// Reader/writer lock shared between a shard and its manager
pub type ShardLock = Arc<RwLock<()>>;

/// Single-file storage of one shard
pub struct FileBackEnd {
    path: PathBuf,
    keep_open_while_initialized: bool,
    lock: Option<ShardLock>,
    state: Mutex<State>,
}

struct State {
    initialized: bool,
    file: Option<File>,
    open_in_write_mode: bool,
    meta: Option<ChannelMetaData>,
    data_offset: u64,
    is_empty: bool,
    first_value_time: Option<Timestamp>,
}

impl State {
    fn ensure_initialized(&self, path: &Path) -> Result<()> {
        if !self.initialized {
            return Err(StratumError::NotInitialized(format!(
                "back end '{}' is not properly initialized",
                path.display()
            )));
        }
        Ok(())
    }
}

fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(LRC_SEED, |parity, byte| parity ^ byte)
}

fn encode_record(sample: &Sample) -> [u8; RECORD_SIZE as usize] {
    let mut buf = [0u8; RECORD_SIZE as usize];
    {
        let mut cursor = &mut buf[..RECORD_SIZE as usize - 1];
        cursor.put_i64(sample.time);
        cursor.put_f64(sample.quality_indicator);
        cursor.put_f64(sample.manual_indicator);
        cursor.put_u64(sample.base_value_count);
        match sample.value {
            SampleValue::Long(v) => cursor.put_i64(v),
            SampleValue::Double(v) => cursor.put_f64(v),
        }
    }
    buf[RECORD_SIZE as usize - 1] = lrc(&buf[..RECORD_SIZE as usize - 1]);
    buf
}

fn decode_record(
    buf: &[u8; RECORD_SIZE as usize],
    data_type: DataType,
    path: &Path,
    offset: u64,
) -> Result<Sample> {
    let expected = lrc(&buf[..RECORD_SIZE as usize - 1]);
    let actual = buf[RECORD_SIZE as usize - 1];
    if expected != actual {
        return Err(StratumError::CorruptRecord {
            path: path.display().to_string(),
            offset,
            expected,
            actual,
        });
    }
    let mut cursor = &buf[..RECORD_SIZE as usize - 1];
    let time = cursor.get_i64();
    let quality_indicator = cursor.get_f64();
    let manual_indicator = cursor.get_f64();
    let base_value_count = cursor.get_u64();
    let value = match data_type {
        DataType::DoubleValue => SampleValue::Double(cursor.get_f64()),
        _ => SampleValue::Long(cursor.get_i64()),
    };
    Ok(Sample {
        time,
        quality_indicator,
        manual_indicator,
        base_value_count,
        value,
    })
}

impl FileBackEnd {
    /// Create a back-end bound to the given file path; nothing is opened yet
    pub fn new(path: impl Into<PathBuf>, keep_open_while_initialized: bool) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(StratumError::InvalidArgument(
                "empty file name passed for file back end".into(),
            ));
        }
        Ok(Self {
            path,
            keep_open_while_initialized,
            lock: None,
            state: Mutex::new(State {
                initialized: false,
                file: None,
                open_in_write_mode: false,
                meta: None,
                data_offset: 0,
                is_empty: true,
                first_value_time: None,
            }),
        })
    }

    /// File this back-end is bound to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the descriptor is kept open across calls while initialized
    pub fn keep_open(&self) -> bool {
        self.keep_open_while_initialized
    }

    /// Attach the shared reader/writer lock; writes fsync only when one is attached
    pub fn set_lock(&mut self, lock: Option<ShardLock>) {
        self.lock = lock;
    }

    /// The attached reader/writer lock, if any
    pub fn lock(&self) -> Option<ShardLock> {
        self.lock.clone()
    }

    /// Whether the instance has been initialized
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Create the file and write its header; fails if the file already exists
    pub fn create(&self, meta: &ChannelMetaData) -> Result<()> {
        meta.validate()?;
        if self.path.exists() {
            return Err(StratumError::AlreadyExists(self.path.display().to_string()));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("creating file '{}'", self.path.display());

        let header_bytes = header::encode(meta);
        let _guard = self.lock.as_ref().map(|lock| lock.write());
        let mut state = self.state.lock();
        let result = (|| {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&self.path)?;
            file.write_all(&header_bytes)?;
            if self.lock.is_some() {
                file.sync_data()?;
            }
            state.file = Some(file);
            state.open_in_write_mode = true;
            Ok(())
        })();
        self.close_if_required(&mut state);
        result
    }

    /// Open the file, verify the header and cache first-record state.
    ///
    /// A passed metadata argument is ignored; the header is the source of
    /// truth. Mismatches against external expectations surface through the
    /// factory's filename verification instead.
    pub fn initialize(&self, _meta: Option<&ChannelMetaData>) -> Result<()> {
        let mut state = self.state.lock();
        state.initialized = true;
        let result = (|| {
            self.open_connection(&mut state, false)?;
            let header = self.read_header(&mut state)?;
            let file_len = state
                .file
                .as_mut()
                .ok_or_else(|| StratumError::NotInitialized("file closed during initialize".into()))?
                .metadata()?
                .len();
            state.data_offset = header.data_offset;
            state.is_empty = file_len < header.data_offset + RECORD_SIZE;
            state.first_value_time = if state.is_empty {
                None
            } else {
                let _read_guard = self.lock.as_ref().map(|lock| lock.read());
                let file = state
                    .file
                    .as_mut()
                    .ok_or_else(|| StratumError::NotInitialized("file closed during initialize".into()))?;
                let first = Self::read_record_from(
                    file,
                    header.data_offset,
                    header.meta.data_type,
                    &self.path,
                )?;
                Some(first.time)
            };
            state.meta = Some(header.meta);
            Ok(())
        })();
        if result.is_err() {
            state.initialized = false;
            state.meta = None;
            state.first_value_time = None;
            state.is_empty = true;
            self.close_connection(&mut state);
        } else {
            self.close_if_required(&mut state);
        }
        result
    }

    /// Re-run `initialize` only when the instance is not currently initialized
    pub fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.initialize(None)
    }

    /// Channel metadata read from the header at initialize
    pub fn meta(&self) -> Result<ChannelMetaData> {
        let state = self.state.lock();
        state.ensure_initialized(&self.path)?;
        state.meta.clone().ok_or_else(|| {
            StratumError::NotInitialized(format!(
                "no metadata cached for '{}'",
                self.path.display()
            ))
        })
    }

    /// Whether the file holds no complete record
    pub fn is_empty(&self) -> Result<bool> {
        let state = self.state.lock();
        state.ensure_initialized(&self.path)?;
        Ok(state.is_empty)
    }

    /// Time of the first record, or `None` when the file is empty
    pub fn first_entry_time(&self) -> Result<Option<Timestamp>> {
        let state = self.state.lock();
        state.ensure_initialized(&self.path)?;
        Ok(state.first_value_time)
    }

    /// The shard's `[start, end)` is fixed at creation
    pub fn is_time_span_constant(&self) -> bool {
        true
    }

    /// Close any open descriptor and drop cached state
    pub fn deinitialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.close_connection(&mut state);
        state.initialized = false;
        state.meta = None;
        state.is_empty = true;
        state.first_value_time = None;
        Ok(())
    }

    /// Remove the file; idempotent
    pub fn delete(&self) -> Result<()> {
        let _guard = self.lock.as_ref().map(|lock| lock.write());
        let mut state = self.state.lock();
        self.close_connection(&mut state);
        if self.path.exists() {
            info!("deleting file '{}'", self.path.display());
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("deletion of file '{}' failed: {}", self.path.display(), e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Insert or overwrite the given samples; see [`update_samples`](Self::update_samples)
    pub fn update_sample(&self, sample: Sample) -> Result<()> {
        self.update_samples(std::slice::from_ref(&sample))
    }

    /// Insert the samples at their time-sorted positions.
    ///
    /// A sample whose time already exists overwrites the stored record; times
    /// before the shard start are silently dropped, times at or past the shard
    /// end terminate the batch.
    pub fn update_samples(&self, samples: &[Sample]) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_initialized(&self.path)?;
        if samples.is_empty() {
            return Ok(());
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by_key(|sample| sample.time);

        let result = (|| {
            self.open_connection(&mut state, true)?;
            self.write_samples(&mut state, &sorted)
        })();
        self.close_if_required(&mut state);
        result
    }

    /// Read all samples with `time ∈ [start, end)`, plus the last sample
    /// before `start` when one exists, sorted ascending.
    pub fn get_samples(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        let mut state = self.state.lock();
        state.ensure_initialized(&self.path)?;
        if start >= end {
            return Ok(Vec::new());
        }
        let result = (|| {
            self.open_connection(&mut state, false)?;
            self.read_span(&mut state, start, end)
        })();
        self.close_if_required(&mut state);
        result
    }

    fn open_connection(&self, state: &mut State, allow_write: bool) -> Result<()> {
        if state.file.is_some() && allow_write && !state.open_in_write_mode {
            self.close_connection(state);
        }
        if state.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(allow_write)
                .open(&self.path)
                .map_err(|e| {
                    error!("file '{}' could not be opened: {}", self.path.display(), e);
                    e
                })?;
            debug!("opened file '{}'", self.path.display());
            state.file = Some(file);
            state.open_in_write_mode = allow_write;
        }
        Ok(())
    }

    fn close_connection(&self, state: &mut State) {
        if state.file.take().is_some() {
            debug!("closed file '{}'", self.path.display());
        }
        state.open_in_write_mode = false;
    }

    fn close_if_required(&self, state: &mut State) {
        if !self.keep_open_while_initialized {
            self.close_connection(state);
        }
    }

    fn read_header(&self, state: &mut State) -> Result<FileHeader> {
        let _guard = self.lock.as_ref().map(|lock| lock.read());
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| StratumError::NotInitialized("no open file".into()))?;
        let file_len = file.metadata()?.len();
        if file_len < 16 {
            return Err(StratumError::CorruptHeader {
                path: self.path.display().to_string(),
                reason: "too small".into(),
            });
        }
        let mut prefix = [0u8; 16];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut prefix)?;
        let data_offset = header::read_data_offset(&prefix, &self.path.display().to_string())?;
        if file_len < data_offset {
            return Err(StratumError::CorruptHeader {
                path: self.path.display().to_string(),
                reason: "file shorter than its declared header".into(),
            });
        }
        let mut header_bytes = vec![0u8; data_offset as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes)?;
        header::decode(&header_bytes, &self.path.display().to_string())
    }

    fn read_record_from(
        file: &mut File,
        offset: u64,
        data_type: DataType,
        path: &Path,
    ) -> Result<Sample> {
        let mut buf = [0u8; RECORD_SIZE as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        decode_record(&buf, data_type, path, offset)
    }

    /// Locate the byte offset where a record with the given time belongs,
    /// scanning backwards from the end of the file.
    fn insertion_point(
        file: &mut File,
        data_offset: u64,
        data_type: DataType,
        path: &Path,
        time: Timestamp,
    ) -> Result<u64> {
        let file_len = file.metadata()?.len();
        if file_len < data_offset + RECORD_SIZE {
            return Ok(data_offset);
        }
        let mut end_search = (file_len - RECORD_SIZE) as i64;
        let incomplete = (end_search - data_offset as i64) % RECORD_SIZE as i64;
        if incomplete != 0 {
            end_search -= incomplete;
            end_search = end_search.max(data_offset as i64);
            warn!(
                "skipping torn trailing record in '{}' while locating insertion point",
                path.display()
            );
        }
        while end_search >= data_offset as i64 {
            let record = Self::read_record_from(file, end_search as u64, data_type, path)?;
            if time > record.time {
                return Ok(end_search as u64 + RECORD_SIZE);
            }
            if time == record.time {
                return Ok(end_search as u64);
            }
            end_search -= RECORD_SIZE as i64;
        }
        Ok(data_offset)
    }

    /// Shift `[insertion_point, end_copy)` forward by one record, copying
    /// back-to-front in bounded chunks so no unread byte is overwritten.
    fn shift_tail(file: &mut File, insertion_point: u64, mut end_copy: u64) -> Result<()> {
        let buffer_len = MAX_COPY_BUFFER_FILL_SIZE.min(end_copy - insertion_point) as usize;
        let mut buffer = vec![0u8; buffer_len];
        let mut start_copy = (end_copy - buffer_len as u64).max(insertion_point);
        while start_copy < end_copy {
            let fill = (end_copy - start_copy) as usize;
            file.seek(SeekFrom::Start(start_copy))?;
            file.read_exact(&mut buffer[..fill])?;
            file.seek(SeekFrom::Start(start_copy + RECORD_SIZE))?;
            file.write_all(&buffer[..fill])?;
            end_copy = start_copy;
            start_copy = start_copy.saturating_sub(fill as u64).max(insertion_point);
        }
        Ok(())
    }

    fn write_samples(&self, state: &mut State, samples: &[Sample]) -> Result<()> {
        let meta = state
            .meta
            .clone()
            .ok_or_else(|| StratumError::NotInitialized("no metadata cached".into()))?;
        let data_offset = state.data_offset;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| StratumError::NotInitialized("no open file".into()))?;

        let _guard = self.lock.as_ref().map(|lock| lock.write());
        let mut index = 0;
        while index < samples.len() {
            let time = samples[index].time;
            if time < meta.start_time {
                debug!(
                    "dropping sample at {} before shard start of '{}'",
                    time,
                    self.path.display()
                );
                index += 1;
                continue;
            }
            if time >= meta.end_time {
                break;
            }

            let file_len = file.metadata()?.len();
            let aligned_end =
                data_offset + (file_len.saturating_sub(data_offset) / RECORD_SIZE) * RECORD_SIZE;
            let insertion_point =
                Self::insertion_point(file, data_offset, meta.data_type, &self.path, time)?;
            let appending = insertion_point >= aligned_end;

            if !appending {
                let existing =
                    Self::read_record_from(file, insertion_point, meta.data_type, &self.path)?;
                if existing.time != time {
                    Self::shift_tail(file, insertion_point, aligned_end)?;
                }
            }

            file.seek(SeekFrom::Start(insertion_point))?;
            let mut last_time;
            loop {
                let sample = samples[index].into_data_type(meta.data_type);
                file.write_all(&encode_record(&sample))?;
                last_time = sample.time;
                index += 1;
                if !appending {
                    break;
                }
                match samples.get(index) {
                    Some(next) if next.time > last_time && next.time < meta.end_time => {}
                    _ => break,
                }
            }
        }
        if self.lock.is_some() {
            file.sync_data()?;
        }
        Ok(())
    }

    fn read_span(&self, state: &mut State, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        let meta = state
            .meta
            .clone()
            .ok_or_else(|| StratumError::NotInitialized("no metadata cached".into()))?;
        let data_offset = state.data_offset;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| StratumError::NotInitialized("no open file".into()))?;

        let file_len = file.metadata()?.len();
        let mut file_size = file_len;
        if file_len > data_offset {
            let incomplete = (file_len - data_offset) % RECORD_SIZE;
            if incomplete > 0 {
                file_size -= incomplete;
                warn!(
                    "skipping torn trailing record when reading file '{}'",
                    self.path.display()
                );
            }
        }

        let mut position = self.first_entry_position(file, data_offset, file_size, &meta, start)?;
        let mut samples = Vec::new();
        while position + RECORD_SIZE <= file_size {
            let record = {
                let _guard = self.lock.as_ref().map(|lock| lock.read());
                Self::read_record_from(file, position, meta.data_type, &self.path)?
            };
            if record.time >= end {
                break;
            }
            if record.time < meta.start_time || record.time >= meta.end_time {
                warn!(
                    "record at {} in file '{}' lies outside the shard span [{}, {})",
                    record.time,
                    self.path.display(),
                    meta.start_time,
                    meta.end_time
                );
            }
            samples.push(record);
            position += RECORD_SIZE;
        }
        Ok(samples)
    }

    /// Binary-search the byte offset of the first record to read for a query
    /// starting at `start_time`. The chosen record is the one at `start_time`
    /// or the last one before it.
    fn first_entry_position(
        &self,
        file: &mut File,
        data_offset: u64,
        file_size: u64,
        meta: &ChannelMetaData,
        start_time: Timestamp,
    ) -> Result<u64> {
        if meta.end_time < start_time {
            return Ok(if file_size > data_offset {
                file_size - RECORD_SIZE
            } else {
                file_size
            });
        }
        if meta.start_time > start_time {
            return Ok(data_offset);
        }

        let record_count = (file_size - data_offset) / RECORD_SIZE;
        if record_count == 0 {
            return Ok(data_offset);
        }

        let read_time = |file: &mut File, pointer: u64| -> Result<Timestamp> {
            let _guard = self.lock.as_ref().map(|lock| lock.read());
            Ok(Self::read_record_from(file, pointer, meta.data_type, &self.path)?.time)
        };

        let mut low: i64 = 0;
        let mut high: i64 = record_count as i64;
        while low < high {
            let mid = (low + high) / 2;
            let pointer = data_offset + mid as u64 * RECORD_SIZE;
            let mid_time = read_time(file, pointer)?;
            if mid_time < start_time {
                low = mid + 1;
            } else if mid_time > start_time {
                high = mid - 1;
            } else {
                return Ok(pointer);
            }
        }

        let mut index = low.min(high).max(0);
        let pointer = data_offset + index as u64 * RECORD_SIZE;
        if pointer < file_size && read_time(file, pointer)? > start_time {
            index -= 1;
        }
        let result = data_offset + index.max(0) as u64 * RECORD_SIZE;
        Ok(if result > data_offset && result == file_size {
            result - RECORD_SIZE
        } else {
            result
        })
    }
}

impl StorageChannel for FileBackEnd {
    fn update_sample(&self, sample: Sample) -> Result<()> {
        FileBackEnd::update_sample(self, sample)
    }

    fn update_samples(&self, samples: &[Sample]) -> Result<()> {
        FileBackEnd::update_samples(self, samples)
    }

    fn get_samples(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        FileBackEnd::get_samples(self, start, end)
    }

    fn cleanup_relicts(&self) -> Result<()> {
        self.state.lock().ensure_initialized(&self.path)
    }
}
