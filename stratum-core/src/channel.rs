//! Storage channel surface and broadcast façade
//!
//! A `StorageChannel` is anything that accepts time-stamped samples and
//! answers time-range queries: a single shard file, a multiplexer spanning
//! many shards, or a calculating channel feeding a coarser detail level.
//! `ChannelGroup` fans updates out to every registered channel.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::types::{Sample, Timestamp};
use crate::Result;

/// Common update/query surface shared by shards, multiplexers and
/// calculating channels
pub trait StorageChannel: Send + Sync {
    /// Update a single sample; an existing sample with the same time is replaced
    fn update_sample(&self, sample: Sample) -> Result<()>;

    /// Update a batch of samples
    fn update_samples(&self, samples: &[Sample]) -> Result<()>;

    /// All samples with `time ∈ [start, end)` sorted ascending, plus the last
    /// sample before `start` when the implementation holds one
    fn get_samples(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>>;

    /// Purge data beyond the retention bound; default is a no-op
    fn cleanup_relicts(&self) -> Result<()> {
        Ok(())
    }
}

/// Registration set that broadcasts updates to every registered channel
#[derive(Default)]
pub struct ChannelGroup {
    channels: Mutex<Vec<Arc<dyn StorageChannel>>>,
}

impl ChannelGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel; it will receive every subsequent broadcast
    pub fn register(&self, channel: Arc<dyn StorageChannel>) {
        self.channels.lock().push(channel);
    }

    /// Remove a previously registered channel
    pub fn unregister(&self, channel: &Arc<dyn StorageChannel>) {
        self.channels
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, channel));
    }

    /// Number of registered channels
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Query results converted to the long flavor
    pub fn get_long_values(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        Ok(self
            .get_samples(start, end)?
            .into_iter()
            .map(Sample::into_long)
            .collect())
    }

    /// Query results converted to the double flavor
    pub fn get_double_values(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        Ok(self
            .get_samples(start, end)?
            .into_iter()
            .map(Sample::into_double)
            .collect())
    }
}

impl StorageChannel for ChannelGroup {
    fn update_sample(&self, sample: Sample) -> Result<()> {
        let channels = self.channels.lock();
        for channel in channels.iter() {
            channel.update_sample(sample)?;
        }
        Ok(())
    }

    fn update_samples(&self, samples: &[Sample]) -> Result<()> {
        let channels = self.channels.lock();
        for channel in channels.iter() {
            channel.update_samples(samples)?;
        }
        Ok(())
    }

    fn get_samples(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        let channels = self.channels.lock();
        // fast path when exactly one channel is registered
        if channels.len() == 1 {
            return channels[0].get_samples(start, end);
        }
        let mut samples = Vec::new();
        for channel in channels.iter() {
            samples.extend(channel.get_samples(start, end)?);
        }
        Ok(samples)
    }

    fn cleanup_relicts(&self) -> Result<()> {
        let channels = self.channels.lock();
        for channel in channels.iter() {
            channel.cleanup_relicts()?;
        }
        Ok(())
    }
}
