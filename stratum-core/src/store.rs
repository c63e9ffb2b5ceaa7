//! Value store
//!
//! Top-level assembly: owns the root directory and its pool settings,
//! discovers existing configurations at open and wires, per configuration,
//! the back-end manager, one multiplexer per detail level and method, the
//! calculation chains between the levels and the broadcasting channel group.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::backend::{BackEndManager, BackEndMultiplexer, FileBackEndFactory};
use crate::calculation::create_provider;
use crate::channel::{ChannelGroup, StorageChannel};
use crate::pipeline::CalculatingStorageChannel;
use crate::settings::PoolSettings;
use crate::types::{CalculationMethod, ChannelMetaData, DataType, Sample, Timestamp};
use crate::{Result, StratumError};

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory holding `settings.xml` and one subdirectory per
    /// configuration
    pub root: PathBuf,
    /// Pool settings written when the root is freshly created; an existing
    /// `settings.xml` takes precedence
    pub pool: PoolSettings,
    /// Highest detail level whose shard descriptors stay open while
    /// initialized
    pub max_keep_open_detail_level: i64,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pool: PoolSettings::default(),
            max_keep_open_detail_level: 0,
        }
    }
}

/// One coarser detail level of a configuration
#[derive(Debug, Clone)]
pub struct LevelConfig {
    /// Detail level id, 1 or higher
    pub detail_level_id: u64,
    /// Reduction methods maintained at this level
    pub methods: Vec<CalculationMethod>,
    /// Window width of this level in ms
    pub timespan: i64,
}

/// A configuration's assembled storage: channel group, calculation chains and
/// one multiplexer per (detail level, method)
pub struct ConfigurationStore {
    base_meta: ChannelMetaData,
    channels: ChannelGroup,
    multiplexers: HashMap<(u64, CalculationMethod), Arc<BackEndMultiplexer>>,
    // keeps the calculation chains alive; registered heads are owned by the
    // channel group
    _chains: Vec<Arc<CalculatingStorageChannel>>,
}

impl ConfigurationStore {
    fn assemble(manager: Arc<BackEndManager>, level_metas: Vec<ChannelMetaData>) -> Result<Arc<Self>> {
        let base_meta = level_metas
            .iter()
            .find(|meta| meta.detail_level_id == 0)
            .or_else(|| level_metas.first())
            .cloned()
            .ok_or_else(|| {
                StratumError::InvalidArgument("a configuration needs at least one level".into())
            })?;

        let channels = ChannelGroup::new();
        let mut multiplexers = HashMap::new();
        let mut chains = Vec::new();

        // the native level writes through directly
        if let Some(native_meta) = level_metas.iter().find(|meta| meta.detail_level_id == 0) {
            let native = Arc::new(BackEndMultiplexer::new(manager.clone()));
            native.initialize(native_meta)?;
            multiplexers.insert(
                (0, native_meta.calculation_method),
                native.clone(),
            );
            channels.register(native);
        }

        // one calculation chain per method, built coarsest-first so each
        // level can forward to the next
        let mut methods: Vec<CalculationMethod> = level_metas
            .iter()
            .filter(|meta| meta.detail_level_id > 0)
            .map(|meta| meta.calculation_method)
            .collect();
        methods.sort_by_key(|method| method.to_id());
        methods.dedup();

        for method in methods {
            let mut levels: Vec<&ChannelMetaData> = level_metas
                .iter()
                .filter(|meta| meta.detail_level_id > 0 && meta.calculation_method == method)
                .collect();
            levels.sort_by_key(|meta| std::cmp::Reverse(meta.detail_level_id));

            let mut downstream: Option<Arc<CalculatingStorageChannel>> = None;
            for meta in levels {
                let multiplexer = Arc::new(BackEndMultiplexer::new(manager.clone()));
                multiplexer.initialize(meta)?;
                multiplexers.insert((meta.detail_level_id, method), multiplexer.clone());

                let provider = create_provider(
                    method,
                    meta.data_type,
                    meta.data_type,
                    &meta.calculation_method_parameters,
                )?;
                let channel = Arc::new(CalculatingStorageChannel::new(
                    multiplexer,
                    downstream.take(),
                    provider,
                ));
                chains.push(channel.clone());
                downstream = Some(channel);
            }
            if let Some(head) = downstream {
                channels.register(head);
            }
        }

        Ok(Arc::new(Self {
            base_meta,
            channels,
            multiplexers,
            _chains: chains,
        }))
    }

    /// Identifier of this configuration
    pub fn configuration_id(&self) -> &str {
        &self.base_meta.configuration_id
    }

    /// Payload type of the native level
    pub fn data_type(&self) -> DataType {
        self.base_meta.data_type
    }

    /// The (detail level, method) pairs this configuration maintains
    pub fn levels(&self) -> Vec<(u64, CalculationMethod)> {
        let mut levels: Vec<_> = self.multiplexers.keys().copied().collect();
        levels.sort_by_key(|(level, method)| (*level, method.to_id()));
        levels
    }

    /// Fan a batch of samples into the native level and every calculation
    /// chain
    pub fn update_samples(&self, samples: &[Sample]) -> Result<()> {
        let converted: Vec<Sample> = samples
            .iter()
            .map(|sample| sample.into_data_type(self.base_meta.data_type))
            .collect();
        self.channels.update_samples(&converted)
    }

    /// Samples of one detail level and method within `[start, end)`
    pub fn get_values(
        &self,
        detail_level_id: u64,
        method: CalculationMethod,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Sample>> {
        let multiplexer = self
            .multiplexers
            .get(&(detail_level_id, method))
            .ok_or_else(|| {
                StratumError::InvalidArgument(format!(
                    "configuration '{}' has no level {}/{}",
                    self.base_meta.configuration_id,
                    detail_level_id,
                    method.short_code()
                ))
            })?;
        multiplexer.get_samples(start, end)
    }

    /// Purge shards beyond the retention bound on every level
    pub fn cleanup_relicts(&self) -> Result<()> {
        self.channels.cleanup_relicts()
    }

    fn deinitialize(&self) {
        for multiplexer in self.multiplexers.values() {
            if let Err(e) = multiplexer.deinitialize() {
                warn!("could not deinitialize multiplexer: {}", e);
            }
        }
    }
}

/// Engine owning every configuration below one store root
pub struct ValueStore {
    root: PathBuf,
    pool: PoolSettings,
    max_keep_open_detail_level: i64,
    stores: RwLock<HashMap<String, Arc<ConfigurationStore>>>,
}

impl ValueStore {
    /// Open a store root, creating it (and its settings) when missing, and
    /// assemble every configuration discovered on disk
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        let pool = match PoolSettings::load(&config.root) {
            Ok(pool) => pool,
            Err(StratumError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                config.pool.store(&config.root)?;
                config.pool.clone()
            }
            Err(e) => return Err(e),
        };

        let store = Self {
            root: config.root,
            pool,
            max_keep_open_detail_level: config.max_keep_open_detail_level,
            stores: RwLock::new(HashMap::new()),
        };
        store.load_existing()?;
        Ok(store)
    }

    fn factory(&self) -> FileBackEndFactory {
        FileBackEndFactory::new(&self.root, self.max_keep_open_detail_level)
    }

    fn load_existing(&self) -> Result<()> {
        let metas = self.factory().existing_back_ends_meta_data(None, true)?;
        let mut grouped: HashMap<String, Vec<ChannelMetaData>> = HashMap::new();
        for meta in metas {
            grouped
                .entry(meta.configuration_id.clone())
                .or_default()
                .push(meta);
        }
        for (configuration_id, level_metas) in grouped {
            let manager = Arc::new(BackEndManager::new(
                self.factory(),
                configuration_id.clone(),
                self.pool.slice_millis(),
            ));
            match ConfigurationStore::assemble(manager, level_metas) {
                Ok(store) => {
                    info!("loaded configuration '{}'", configuration_id);
                    self.stores.write().insert(configuration_id, store);
                }
                Err(e) => {
                    warn!("failed to load configuration '{}': {}", configuration_id, e);
                }
            }
        }
        Ok(())
    }

    /// Create a new configuration with a native level and the given coarser
    /// levels
    pub fn create_configuration(
        &self,
        configuration_id: &str,
        data_type: DataType,
        proposed_data_age: i64,
        accepted_time_delta: i64,
        levels: &[LevelConfig],
    ) -> Result<Arc<ConfigurationStore>> {
        let mut stores = self.stores.write();
        if stores.contains_key(configuration_id) {
            return Err(StratumError::AlreadyExists(configuration_id.to_string()));
        }

        let base = ChannelMetaData {
            configuration_id: configuration_id.to_string(),
            calculation_method: CalculationMethod::Native,
            calculation_method_parameters: vec![],
            detail_level_id: 0,
            start_time: Timestamp::MIN,
            end_time: Timestamp::MAX,
            proposed_data_age,
            accepted_time_delta,
            data_type,
        };
        base.validate()?;

        let mut level_metas = vec![base.clone()];
        for level in levels {
            if level.detail_level_id == 0 {
                return Err(StratumError::InvalidArgument(
                    "detail level 0 is reserved for the native level".into(),
                ));
            }
            for method in &level.methods {
                level_metas.push(ChannelMetaData {
                    calculation_method: *method,
                    calculation_method_parameters: vec![level.timespan],
                    detail_level_id: level.detail_level_id,
                    ..base.clone()
                });
            }
        }

        let manager = Arc::new(BackEndManager::new(
            self.factory(),
            configuration_id,
            self.pool.slice_millis(),
        ));
        let store = ConfigurationStore::assemble(manager, level_metas)?;
        info!("created configuration '{}'", configuration_id);
        stores.insert(configuration_id.to_string(), store.clone());
        Ok(store)
    }

    /// Look up an assembled configuration
    pub fn configuration(&self, configuration_id: &str) -> Option<Arc<ConfigurationStore>> {
        self.stores.read().get(configuration_id).cloned()
    }

    /// Identifiers of every assembled configuration
    pub fn configurations(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    fn required(&self, configuration_id: &str) -> Result<Arc<ConfigurationStore>> {
        self.configuration(configuration_id).ok_or_else(|| {
            StratumError::InvalidArgument(format!(
                "configuration '{configuration_id}' does not exist"
            ))
        })
    }

    /// Write a batch of samples into a configuration
    pub fn update_samples(&self, configuration_id: &str, samples: &[Sample]) -> Result<()> {
        self.required(configuration_id)?.update_samples(samples)
    }

    /// Query one level of a configuration, results in the long flavor
    pub fn get_long_values(
        &self,
        configuration_id: &str,
        detail_level_id: u64,
        method: CalculationMethod,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Sample>> {
        Ok(self
            .required(configuration_id)?
            .get_values(detail_level_id, method, start, end)?
            .into_iter()
            .map(Sample::into_long)
            .collect())
    }

    /// Query one level of a configuration, results in the double flavor
    pub fn get_double_values(
        &self,
        configuration_id: &str,
        detail_level_id: u64,
        method: CalculationMethod,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Sample>> {
        Ok(self
            .required(configuration_id)?
            .get_values(detail_level_id, method, start, end)?
            .into_iter()
            .map(Sample::into_double)
            .collect())
    }

    /// Purge out-of-retention shards of every configuration
    pub fn cleanup_relicts(&self) -> Result<()> {
        let stores: Vec<_> = self.stores.read().values().cloned().collect();
        for store in stores {
            store.cleanup_relicts()?;
        }
        Ok(())
    }

    /// Remove a configuration and every file it owns
    pub fn drop_configuration(&self, configuration_id: &str) -> Result<()> {
        let removed = self.stores.write().remove(configuration_id);
        match removed {
            Some(store) => {
                store.deinitialize();
                self.factory().delete_back_ends(configuration_id)?;
                info!("dropped configuration '{}'", configuration_id);
                Ok(())
            }
            None => Err(StratumError::InvalidArgument(format!(
                "configuration '{configuration_id}' does not exist"
            ))),
        }
    }

    /// Release every resource; the store stays usable and reacquires
    /// descriptors on demand
    pub fn dispose(&self) {
        for store in self.stores.read().values() {
            store.deinitialize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TimeUnit;
    use tempfile::TempDir;

    fn store_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            root: dir.path().to_path_buf(),
            pool: PoolSettings {
                time: 10,
                unit: TimeUnit::Seconds,
                count: 100,
            },
            max_keep_open_detail_level: 0,
        }
    }

    fn long(time: Timestamp, value: i64) -> Sample {
        Sample::new_long(time, 1.0, 0.0, 1, value)
    }

    #[test]
    fn test_end_to_end_native_and_aggregates() {
        let dir = TempDir::new().unwrap();
        let store = ValueStore::open(store_config(&dir)).unwrap();
        store
            .create_configuration(
                "line-7/flow",
                DataType::LongValue,
                86_400_000,
                0,
                &[LevelConfig {
                    detail_level_id: 1,
                    methods: vec![
                        CalculationMethod::Average,
                        CalculationMethod::Minimum,
                        CalculationMethod::Maximum,
                    ],
                    timespan: 1000,
                }],
            )
            .unwrap();

        let samples: Vec<Sample> = vec![
            long(0, 10),
            long(500, 20),
            long(1000, 5),
            long(1500, 40),
            long(2000, 1),
        ];
        store.update_samples("line-7/flow", &samples).unwrap();

        let native = store
            .get_long_values("line-7/flow", 0, CalculationMethod::Native, 0, 10_000)
            .unwrap();
        assert_eq!(native.len(), 5);

        // windows [0,1000) and [1000,2000) are complete
        let averages = store
            .get_long_values("line-7/flow", 1, CalculationMethod::Average, 0, 10_000)
            .unwrap();
        assert_eq!(averages.len(), 2);
        assert_eq!(averages[0].time, 0);
        assert_eq!(averages[0].value.as_i64(), 15);
        assert_eq!(averages[1].value.as_i64(), 23); // (5*500 + 40*500) / 1000 = 22.5

        let minima = store
            .get_long_values("line-7/flow", 1, CalculationMethod::Minimum, 0, 10_000)
            .unwrap();
        assert_eq!(minima[0].value.as_i64(), 10);
        assert_eq!(minima[1].value.as_i64(), 5);

        let maxima = store
            .get_long_values("line-7/flow", 1, CalculationMethod::Maximum, 0, 10_000)
            .unwrap();
        assert_eq!(maxima[0].value.as_i64(), 20);
        assert_eq!(maxima[1].value.as_i64(), 40);
    }

    #[test]
    fn test_cleanup_purges_every_chain_level() {
        let dir = TempDir::new().unwrap();
        let store = ValueStore::open(store_config(&dir)).unwrap();
        store
            .create_configuration(
                "furnace/temp",
                DataType::LongValue,
                20_000,
                0,
                &[
                    LevelConfig {
                        detail_level_id: 1,
                        methods: vec![CalculationMethod::Average],
                        timespan: 1000,
                    },
                    LevelConfig {
                        detail_level_id: 2,
                        methods: vec![CalculationMethod::Average],
                        timespan: 2000,
                    },
                ],
            )
            .unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        // anchor mid-slice so the oldest shards always end before the
        // retention boundary
        let base = (now - 60_000).div_euclid(10_000) * 10_000 + 500;
        let samples: Vec<Sample> = (0..=116i64).map(|i| long(base + i * 500, i)).collect();
        store.update_samples("furnace/temp", &samples).unwrap();

        // the coarsest level holds data across several shards before cleanup
        assert!(!store
            .get_long_values(
                "furnace/temp",
                2,
                CalculationMethod::Average,
                base - 10_000,
                base + 29_500,
            )
            .unwrap()
            .is_empty());

        store.cleanup_relicts().unwrap();

        // shards beyond the retention bound are gone at every chained level
        for level in [1, 2] {
            assert!(
                store
                    .get_long_values(
                        "furnace/temp",
                        level,
                        CalculationMethod::Average,
                        base - 10_000,
                        base + 29_500,
                    )
                    .unwrap()
                    .is_empty(),
                "level {level} kept out-of-retention shards"
            );
        }
        // recent aggregates survive
        assert!(
            store
                .get_long_values(
                    "furnace/temp",
                    2,
                    CalculationMethod::Average,
                    base + 29_500,
                    base + 60_000,
                )
                .unwrap()
                .len()
                >= 2
        );
    }

    #[test]
    fn test_reopen_discovers_configurations() {
        let dir = TempDir::new().unwrap();
        {
            let store = ValueStore::open(store_config(&dir)).unwrap();
            store
                .create_configuration("boiler_1", DataType::DoubleValue, 86_400_000, 0, &[])
                .unwrap();
            store
                .update_samples("boiler_1", &[Sample::new_double(100, 1.0, 0.0, 1, 3.25)])
                .unwrap();
            store.dispose();
        }

        let reopened = ValueStore::open(store_config(&dir)).unwrap();
        assert_eq!(reopened.configurations(), vec!["boiler_1".to_string()]);
        let values = reopened
            .get_double_values("boiler_1", 0, CalculationMethod::Native, 0, 1000)
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value.as_f64(), 3.25);
    }

    #[test]
    fn test_settings_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            ValueStore::open(store_config(&dir)).unwrap();
        }
        // a differing pool in the config must lose against the stored file
        let mut config = store_config(&dir);
        config.pool = PoolSettings {
            time: 1,
            unit: TimeUnit::Minutes,
            count: 5,
        };
        let store = ValueStore::open(config).unwrap();
        assert_eq!(store.pool.slice_millis(), 10_000);
    }

    #[test]
    fn test_duplicate_configuration_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = ValueStore::open(store_config(&dir)).unwrap();
        store
            .create_configuration("twice", DataType::LongValue, 1000, 0, &[])
            .unwrap();
        assert!(matches!(
            store.create_configuration("twice", DataType::LongValue, 1000, 0, &[]),
            Err(StratumError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_drop_configuration_removes_files() {
        let dir = TempDir::new().unwrap();
        let store = ValueStore::open(store_config(&dir)).unwrap();
        store
            .create_configuration("doomed", DataType::LongValue, 1000, 0, &[])
            .unwrap();
        store.update_samples("doomed", &[long(1, 1)]).unwrap();
        assert!(dir.path().join("doomed").is_dir());

        store.drop_configuration("doomed").unwrap();
        assert!(!dir.path().join("doomed").exists());
        assert!(store.configuration("doomed").is_none());
    }

    #[test]
    fn test_unknown_level_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = ValueStore::open(store_config(&dir)).unwrap();
        store
            .create_configuration("conf", DataType::LongValue, 1000, 0, &[])
            .unwrap();
        assert!(matches!(
            store.get_long_values("conf", 3, CalculationMethod::Average, 0, 100),
            Err(StratumError::InvalidArgument(_))
        ));
    }
}
