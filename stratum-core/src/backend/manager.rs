//! Back-end manager
//!
//! Owns the shard handles of one configuration: an ordered index per detail
//! level and calculation method, lazily loaded from disk. Routes inserts to
//! the shard owning a given instant (allocating fresh shards on demand),
//! hands out borrowed handles for reads, excludes corrupt shards without
//! losing the stream and deletes shards that fall out of retention.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::factory::FileBackEndFactory;
use super::file::FileBackEnd;
use crate::types::{CalculationMethod, ChannelMetaData, Timestamp};
use crate::Result;

type LevelKey = (u64, CalculationMethod);

/// Shard lifecycle owner for one configuration
pub struct BackEndManager {
    factory: FileBackEndFactory,
    configuration_id: String,
    new_span_width: i64,
    state: Mutex<HashMap<LevelKey, LevelIndex>>,
}

#[derive(Default)]
struct LevelIndex {
    loaded: bool,
    shards: BTreeMap<Timestamp, IndexedShard>,
}

struct IndexedShard {
    backend: Arc<FileBackEnd>,
    meta: ChannelMetaData,
}

impl BackEndManager {
    /// Create a manager for one configuration. `new_span_width` is the width
    /// in ms of freshly allocated shards (the pool's slice width).
    pub fn new(
        factory: FileBackEndFactory,
        configuration_id: impl Into<String>,
        new_span_width: i64,
    ) -> Self {
        Self {
            factory,
            configuration_id: configuration_id.into(),
            new_span_width: new_span_width.max(1),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Configuration this manager is responsible for
    pub fn configuration_id(&self) -> &str {
        &self.configuration_id
    }

    fn ensure_loaded(&self, index: &mut LevelIndex, key: LevelKey) -> Result<()> {
        if index.loaded {
            return Ok(());
        }
        let (detail_level_id, method) = key;
        let discovered =
            self.factory
                .existing_back_ends(&self.configuration_id, detail_level_id, method)?;
        for mut backend in discovered {
            backend.set_lock(Some(Arc::new(RwLock::new(()))));
            if let Err(e) = backend.initialize(None) {
                warn!(
                    "discovered shard '{}' became unreadable, skipping: {}",
                    backend.path().display(),
                    e
                );
                continue;
            }
            let meta = backend.meta()?;
            if !backend.keep_open() {
                backend.deinitialize()?;
            }
            index.shards.insert(
                meta.start_time,
                IndexedShard {
                    backend: Arc::new(backend),
                    meta,
                },
            );
        }
        index.loaded = true;
        Ok(())
    }

    /// The unique shard whose span includes `time`, allocating and creating a
    /// fresh shard of the configured width when none exists yet
    pub fn get_back_end_for_insert(
        &self,
        parent: &ChannelMetaData,
        time: Timestamp,
    ) -> Result<Arc<FileBackEnd>> {
        let key = (parent.detail_level_id, parent.calculation_method);
        let mut state = self.state.lock();
        let index = state.entry(key).or_default();
        self.ensure_loaded(index, key)?;

        if let Some((_, shard)) = index.shards.range(..=time).next_back() {
            if time < shard.meta.end_time {
                shard.backend.ensure_initialized()?;
                return Ok(shard.backend.clone());
            }
        }

        // no owner yet: allocate a shard aligned to the configured width,
        // clamped against its neighbors so no instant has two owners
        let width = self.new_span_width;
        let mut start_time = time.div_euclid(width) * width;
        let mut end_time = start_time.checked_add(width).unwrap_or(Timestamp::MAX);
        if let Some((_, previous)) = index.shards.range(..=time).next_back() {
            start_time = start_time.max(previous.meta.end_time);
        }
        let after = (std::ops::Bound::Excluded(time), std::ops::Bound::Unbounded);
        if let Some((_, next)) = index.shards.range(after).next() {
            end_time = end_time.min(next.meta.start_time);
        }

        let meta = parent.for_span(start_time, end_time);
        let mut backend = self.factory.create_new_back_end(&meta)?;
        backend.set_lock(Some(Arc::new(RwLock::new(()))));
        backend.create(&meta)?;
        backend.initialize(None)?;
        info!("allocated new shard {}", meta);

        let backend = Arc::new(backend);
        index.shards.insert(
            start_time,
            IndexedShard {
                backend: backend.clone(),
                meta,
            },
        );
        Ok(backend)
    }

    /// All shards that a query over `[start, end)` may need, paired with
    /// their indexed metadata, in descending end-time order. Shards lying
    /// entirely before `start` are included so that callers can resolve the
    /// state at the query start. A shard that fails to re-initialize is still
    /// handed out; its reads fail and the caller decides how to degrade.
    pub fn get_existing_back_ends(
        &self,
        parent: &ChannelMetaData,
        _start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<(Arc<FileBackEnd>, ChannelMetaData)>> {
        let key = (parent.detail_level_id, parent.calculation_method);
        let mut state = self.state.lock();
        let index = state.entry(key).or_default();
        self.ensure_loaded(index, key)?;

        let mut back_ends = Vec::new();
        for (_, shard) in index.shards.range(..end).rev() {
            if let Err(e) = shard.backend.ensure_initialized() {
                warn!(
                    "shard '{}' could not be initialized for read: {}",
                    shard.backend.path().display(),
                    e
                );
            }
            back_ends.push((shard.backend.clone(), shard.meta.clone()));
        }
        Ok(back_ends)
    }

    /// Return a borrowed handle; descriptors of high detail levels are closed
    pub fn deinitialize_back_end(&self, backend: &Arc<FileBackEnd>) -> Result<()> {
        if !backend.keep_open() {
            backend.deinitialize()?;
        }
        Ok(())
    }

    /// Exclude the shard owning `time` from the index and move its file aside
    /// with a `.corrupt` suffix; the span becomes allocatable again so the
    /// stream stays writable
    pub fn mark_back_end_as_corrupt(
        &self,
        detail_level_id: u64,
        method: CalculationMethod,
        time: Timestamp,
    ) {
        let mut state = self.state.lock();
        let index = match state.get_mut(&(detail_level_id, method)) {
            Some(index) => index,
            None => return,
        };
        let start_time = match index.shards.range(..=time).next_back() {
            Some((start, shard)) if time < shard.meta.end_time => *start,
            _ => {
                warn!(
                    "no shard of {}/{}/{} owns time {}, nothing to mark corrupt",
                    self.configuration_id,
                    detail_level_id,
                    method.short_code(),
                    time
                );
                return;
            }
        };
        if let Some(shard) = index.shards.remove(&start_time) {
            warn!(
                "marking shard '{}' as corrupt",
                shard.backend.path().display()
            );
            if let Err(e) = shard.backend.deinitialize() {
                warn!("could not deinitialize corrupt shard: {}", e);
            }
            let mut quarantined: OsString = shard.backend.path().as_os_str().to_owned();
            quarantined.push(".corrupt");
            if let Err(e) = fs::rename(shard.backend.path(), &quarantined) {
                warn!(
                    "could not move corrupt shard '{}' aside: {}",
                    shard.backend.path().display(),
                    e
                );
            }
        }
    }

    /// Delete every shard whose span ends at or before `older_than`; returns
    /// the number of deleted shards
    pub fn delete_old_back_ends(
        &self,
        detail_level_id: u64,
        method: CalculationMethod,
        older_than: Timestamp,
    ) -> Result<usize> {
        let key = (detail_level_id, method);
        let mut state = self.state.lock();
        let index = state.entry(key).or_default();
        self.ensure_loaded(index, key)?;

        let doomed: Vec<Timestamp> = index
            .shards
            .iter()
            .filter(|(_, shard)| shard.meta.end_time <= older_than)
            .map(|(start, _)| *start)
            .collect();
        let mut deleted = 0;
        for start_time in doomed {
            if let Some(shard) = index.shards.remove(&start_time) {
                match shard.backend.delete() {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(
                        "could not delete aged shard '{}': {}",
                        shard.backend.path().display(),
                        e
                    ),
                }
            }
        }
        if deleted > 0 {
            info!(
                "deleted {} aged shard(s) of {}/{}/{}",
                deleted,
                self.configuration_id,
                detail_level_id,
                method.short_code()
            );
        }
        Ok(deleted)
    }

    /// Release every descriptor held for one channel
    pub fn free_related_resources(&self, parent: &ChannelMetaData) {
        let mut state = self.state.lock();
        if let Some(index) = state.get_mut(&(parent.detail_level_id, parent.calculation_method)) {
            for shard in index.shards.values() {
                if let Err(e) = shard.backend.deinitialize() {
                    warn!("could not deinitialize back end: {}", e);
                }
            }
        }
    }
}
