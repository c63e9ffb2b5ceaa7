//! Back-end multiplexer
//!
//! Presents one logical stream whose samples live across many shards, each
//! owning an exclusive time span. Writes are routed to the shard covering the
//! sample time, reads are merged across all covering shards in descending
//! end-time order. A failing shard never fails the whole stream: it is marked
//! corrupt at the manager and a zero-quality sentinel marks the gap.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::file::FileBackEnd;
use super::manager::BackEndManager;
use crate::channel::StorageChannel;
use crate::types::{ChannelMetaData, DataType, Sample, SampleValue, Timestamp};
use crate::{Result, StratumError};

/// Virtual back-end over every shard of one channel
pub struct BackEndMultiplexer {
    manager: Arc<BackEndManager>,
    meta: Mutex<Option<ChannelMetaData>>,
}

fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Zero-quality sample marking a gap caused by a corrupt shard
fn gap_sample(time: Timestamp, data_type: DataType) -> Sample {
    Sample {
        time,
        quality_indicator: 0.0,
        manual_indicator: 0.0,
        base_value_count: 0,
        value: match data_type {
            DataType::DoubleValue => SampleValue::Double(0.0),
            _ => SampleValue::Long(0),
        },
    }
}

impl BackEndMultiplexer {
    /// Create an uninitialized multiplexer backed by the given manager
    pub fn new(manager: Arc<BackEndManager>) -> Self {
        Self {
            manager,
            meta: Mutex::new(None),
        }
    }

    /// Adopt the channel metadata; must be called before any update or query
    pub fn initialize(&self, meta: &ChannelMetaData) -> Result<()> {
        meta.validate()?;
        *self.meta.lock() = Some(meta.clone());
        Ok(())
    }

    /// Release all shard resources held for this channel
    pub fn deinitialize(&self) -> Result<()> {
        if let Some(meta) = self.meta.lock().take() {
            self.manager.free_related_resources(&meta);
        }
        Ok(())
    }

    /// The covered span grows as shards are allocated
    pub fn is_time_span_constant(&self) -> bool {
        false
    }

    /// Channel metadata adopted at initialize
    pub fn meta(&self) -> Result<ChannelMetaData> {
        self.meta.lock().clone().ok_or_else(|| {
            StratumError::NotInitialized("multiplexer is not properly initialized".into())
        })
    }

    fn write_to_shard(
        &self,
        meta: &ChannelMetaData,
        time_hint: Timestamp,
        samples: &[Sample],
    ) -> Result<()> {
        let backend = self.manager.get_back_end_for_insert(meta, time_hint)?;
        let result = backend.update_samples(samples);
        if let Err(e) = self.manager.deinitialize_back_end(&backend) {
            warn!("could not deinitialize back end: {}", e);
        }
        result
    }

    fn route_failure(&self, meta: &ChannelMetaData, time: Timestamp, error: &StratumError) {
        error!(
            "backend ({}): could not write to sub backend (time: {}): {}",
            meta, time, error
        );
        self.manager
            .mark_back_end_as_corrupt(meta.detail_level_id, meta.calculation_method, time);
    }

    fn collect_samples(
        &self,
        meta: &ChannelMetaData,
        back_ends: &[(Arc<FileBackEnd>, ChannelMetaData)],
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<Sample> {
        let mut samples: Vec<Sample> = Vec::new();
        for (backend, shard_meta) in back_ends {
            let overlaps = start <= shard_meta.end_time && end > shard_meta.start_time;
            let older = start >= shard_meta.end_time;
            if !overlaps && !older {
                continue;
            }
            match backend.get_samples(start, end) {
                Ok(chunk) => {
                    samples.splice(0..0, chunk);
                    if samples.first().is_some_and(|first| first.time <= start) {
                        break;
                    }
                }
                Err(e) => {
                    let message = format!(
                        "backend ({}): could not read from sub backend (startTime: {}; endTime: {})",
                        shard_meta, start, end
                    );
                    if start < now_millis() - shard_meta.proposed_data_age {
                        info!("{} - backend is probably outdated: {}", message, e);
                    } else {
                        error!("{}: {}", message, e);
                    }
                    self.manager.mark_back_end_as_corrupt(
                        shard_meta.detail_level_id,
                        shard_meta.calculation_method,
                        shard_meta.start_time,
                    );
                    samples.insert(0, gap_sample(shard_meta.start_time, meta.data_type));
                    if shard_meta.start_time <= start {
                        break;
                    }
                }
            }
        }
        samples
    }
}

impl StorageChannel for BackEndMultiplexer {
    fn update_sample(&self, sample: Sample) -> Result<()> {
        let meta = self.meta()?;
        if let Err(e) = self.write_to_shard(&meta, sample.time, std::slice::from_ref(&sample)) {
            self.route_failure(&meta, sample.time, &e);
        }
        Ok(())
    }

    fn update_samples(&self, samples: &[Sample]) -> Result<()> {
        let meta = self.meta()?;

        // assign every sample to the shard responsible for its time
        let mut buckets: BTreeMap<Timestamp, Vec<Sample>> = BTreeMap::new();
        for sample in samples {
            let backend = match self.manager.get_back_end_for_insert(&meta, sample.time) {
                Ok(backend) => backend,
                Err(e) => {
                    self.route_failure(&meta, sample.time, &e);
                    continue;
                }
            };
            let shard_start = backend.meta().map(|shard_meta| shard_meta.start_time);
            if let Err(e) = self.manager.deinitialize_back_end(&backend) {
                warn!("could not deinitialize back end: {}", e);
            }
            match shard_start {
                Ok(shard_start) => buckets.entry(shard_start).or_default().push(*sample),
                Err(e) => self.route_failure(&meta, sample.time, &e),
            }
        }

        // process each bucket as one bulk write; a failing shard only loses
        // its own bucket
        for (shard_start, bucket) in buckets {
            if let Err(e) = self.write_to_shard(&meta, shard_start, &bucket) {
                self.route_failure(&meta, shard_start, &e);
            }
        }
        Ok(())
    }

    fn get_samples(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        let meta = self.meta()?;
        if start >= end {
            return Ok(Vec::new());
        }
        let back_ends = self.manager.get_existing_back_ends(&meta, start, end)?;
        let samples = self.collect_samples(&meta, &back_ends, start, end);
        for (backend, _) in &back_ends {
            if let Err(e) = self.manager.deinitialize_back_end(backend) {
                warn!("could not deinitialize back end: {}", e);
            }
        }
        Ok(samples)
    }

    /// Delete shards older than the retention bound, keeping at least the
    /// last two samples of the stream
    fn cleanup_relicts(&self) -> Result<()> {
        debug!("deleting old data... start");
        let meta = self.meta()?;
        let result = (|| -> Result<()> {
            let now = now_millis();
            let latest = self.get_samples(now - 1, now)?;
            let newest = match latest.first() {
                Some(newest) => newest.time,
                None => return Ok(()),
            };
            let boundary_start = newest - meta.proposed_data_age;
            let boundary = self.get_samples(boundary_start - 1, boundary_start)?;
            let boundary = match boundary.first() {
                Some(boundary) => boundary.time,
                None => return Ok(()),
            };
            self.manager.delete_old_back_ends(
                meta.detail_level_id,
                meta.calculation_method,
                boundary - 1,
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            error!("unable to clean up old data: {}", e);
        }
        debug!("deleting old data... end");
        Ok(())
    }
}
