//! Aggregation pipeline
//!
//! A calculating channel buffers the samples of its current window and, once
//! a sample past the window end arrives, reduces the buffered window through
//! its calculation provider, writes the aggregate into the level's own
//! back-end and hands it to the next coarser level. The last sample of a
//! finished window is carried over as the opening state of the next window,
//! mirroring the read path's last-before-start semantics.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::calculation::CalculationLogicProvider;
use crate::channel::StorageChannel;
use crate::types::{Sample, Timestamp};
use crate::Result;

/// One detail level of the aggregation pipeline
pub struct CalculatingStorageChannel {
    backend: Arc<dyn StorageChannel>,
    downstream: Option<Arc<CalculatingStorageChannel>>,
    provider: Box<dyn CalculationLogicProvider>,
    state: Mutex<LevelState>,
}

struct LevelState {
    window_start: Option<Timestamp>,
    /// Sorted ascending; may lead with one carried sample before the window
    buffer: Vec<Sample>,
    last_emitted: Option<Timestamp>,
}

impl CalculatingStorageChannel {
    /// Create a level that writes aggregates to `backend` and forwards them
    /// to the optional next coarser level
    pub fn new(
        backend: Arc<dyn StorageChannel>,
        downstream: Option<Arc<CalculatingStorageChannel>>,
        provider: Box<dyn CalculationLogicProvider>,
    ) -> Self {
        Self {
            backend,
            downstream,
            provider,
            state: Mutex::new(LevelState {
                window_start: None,
                buffer: Vec::new(),
                last_emitted: None,
            }),
        }
    }

    /// The back-end this level writes its aggregates to
    pub fn backend(&self) -> &Arc<dyn StorageChannel> {
        &self.backend
    }

    fn emit(&self, state: &mut LevelState, sample: Sample) -> Result<()> {
        // level output is strictly ascending; pass-through may overwrite the
        // newest sample in place
        let blocked = match state.last_emitted {
            Some(last) if self.provider.pass_through() => sample.time < last,
            Some(last) => sample.time <= last,
            None => false,
        };
        if blocked {
            debug!(
                "skipping sample at {} behind the level's emit frontier",
                sample.time
            );
            return Ok(());
        }
        state.last_emitted = Some(sample.time);
        self.backend.update_sample(sample)?;
        if let Some(downstream) = &self.downstream {
            downstream.update_sample(sample)?;
        }
        Ok(())
    }

    fn process(&self, state: &mut LevelState, sample: Sample) -> Result<()> {
        if self.provider.pass_through() {
            let forwarded = self.provider.generate_value(sample.time, &[sample]);
            return self.emit(state, forwarded);
        }

        let span = self.provider.required_timespan();
        let mut window_start = match state.window_start {
            Some(window_start) => window_start,
            None => sample.time.div_euclid(span) * span,
        };
        if sample.time < window_start {
            debug!(
                "dropping late sample at {} for already emitted window starting at {}",
                sample.time, window_start
            );
            return Ok(());
        }

        // emit and slide until the new sample fits the current window
        loop {
            let next_window = match window_start.checked_add(span) {
                Some(next_window) if sample.time >= next_window => next_window,
                _ => break,
            };
            let aggregated = self.provider.generate_value(window_start, &state.buffer);
            self.emit(state, aggregated)?;

            let carry = state.buffer.iter().rev().find(|s| s.time < next_window).copied();
            state.buffer.retain(|s| s.time >= next_window);
            if let Some(carry) = carry {
                state.buffer.insert(0, carry);
            }
            window_start = next_window;
        }
        state.window_start = Some(window_start);

        match state
            .buffer
            .binary_search_by_key(&sample.time, |s| s.time)
        {
            Ok(position) => state.buffer[position] = sample,
            Err(position) => state.buffer.insert(position, sample),
        }
        Ok(())
    }
}

impl StorageChannel for CalculatingStorageChannel {
    fn update_sample(&self, sample: Sample) -> Result<()> {
        let mut state = self.state.lock();
        self.process(&mut state, sample)
    }

    fn update_samples(&self, samples: &[Sample]) -> Result<()> {
        let mut sorted = samples.to_vec();
        sorted.sort_by_key(|sample| sample.time);
        let mut state = self.state.lock();
        for sample in sorted {
            self.process(&mut state, sample)?;
        }
        Ok(())
    }

    fn get_samples(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        self.backend.get_samples(start, end)
    }

    fn cleanup_relicts(&self) -> Result<()> {
        self.backend.cleanup_relicts()?;
        if let Some(downstream) = &self.downstream {
            downstream.cleanup_relicts()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculation::create_provider;
    use crate::types::{CalculationMethod, DataType, SampleValue};

    #[derive(Default)]
    struct RecordingChannel {
        samples: Mutex<Vec<Sample>>,
        cleanups: Mutex<usize>,
    }

    impl RecordingChannel {
        fn times(&self) -> Vec<Timestamp> {
            self.samples.lock().iter().map(|s| s.time).collect()
        }
    }

    impl StorageChannel for RecordingChannel {
        fn update_sample(&self, sample: Sample) -> Result<()> {
            self.samples.lock().push(sample);
            Ok(())
        }

        fn update_samples(&self, samples: &[Sample]) -> Result<()> {
            self.samples.lock().extend_from_slice(samples);
            Ok(())
        }

        fn get_samples(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
            Ok(self
                .samples
                .lock()
                .iter()
                .copied()
                .filter(|s| s.time >= start && s.time < end)
                .collect())
        }

        fn cleanup_relicts(&self) -> Result<()> {
            *self.cleanups.lock() += 1;
            Ok(())
        }
    }

    fn level(
        method: CalculationMethod,
        span: i64,
        downstream: Option<Arc<CalculatingStorageChannel>>,
    ) -> (Arc<CalculatingStorageChannel>, Arc<RecordingChannel>) {
        let backend = Arc::new(RecordingChannel::default());
        let provider = create_provider(
            method,
            DataType::LongValue,
            DataType::LongValue,
            &[span],
        )
        .unwrap();
        let channel = Arc::new(CalculatingStorageChannel::new(
            backend.clone(),
            downstream,
            provider,
        ));
        (channel, backend)
    }

    fn long(time: Timestamp, value: i64) -> Sample {
        Sample::new_long(time, 1.0, 0.0, 1, value)
    }

    #[test]
    fn test_pass_through_forwards_immediately() {
        let (channel, backend) = level(CalculationMethod::Native, 1, None);
        channel.update_sample(long(5, 50)).unwrap();
        channel.update_sample(long(7, 70)).unwrap();
        assert_eq!(backend.times(), vec![5, 7]);
    }

    #[test]
    fn test_window_emits_on_overflow() {
        let (channel, backend) = level(CalculationMethod::Average, 1000, None);
        channel
            .update_samples(&[long(0, 10), long(500, 20)])
            .unwrap();
        // window [0, 1000) is still open
        assert!(backend.times().is_empty());

        channel.update_sample(long(1000, 30)).unwrap();
        let emitted = backend.samples.lock().clone();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].time, 0);
        // 10 for the first half, 20 for the second
        assert_eq!(emitted[0].value, SampleValue::Long(15));
    }

    #[test]
    fn test_gap_slides_window_by_window() {
        let (channel, backend) = level(CalculationMethod::Maximum, 1000, None);
        channel.update_sample(long(100, 42)).unwrap();
        channel.update_sample(long(3500, 7)).unwrap();
        // windows [0,1000), [1000,2000) and [2000,3000) emit the held state
        assert_eq!(backend.times(), vec![0, 1000, 2000]);
        let emitted = backend.samples.lock().clone();
        assert!(emitted.iter().all(|s| s.value == SampleValue::Long(42)));
        // the carried state keeps painting full windows
        assert_eq!(emitted[1].quality_indicator, 1.0);
    }

    #[test]
    fn test_emissions_strictly_ascending() {
        let (channel, backend) = level(CalculationMethod::Average, 1000, None);
        channel
            .update_samples(&[long(100, 1), long(1200, 2), long(2500, 3)])
            .unwrap();
        // a late sample for a closed window must not re-emit it
        channel.update_sample(long(150, 9)).unwrap();
        channel.update_sample(long(3500, 4)).unwrap();

        let times = backend.times();
        assert!(times.windows(2).all(|w| w[0] < w[1]), "{times:?}");
    }

    #[test]
    fn test_cleanup_reaches_every_chained_level() {
        let (coarse, coarse_backend) = level(CalculationMethod::Average, 2000, None);
        let (fine, fine_backend) = level(CalculationMethod::Average, 1000, Some(coarse));

        fine.cleanup_relicts().unwrap();
        assert_eq!(*fine_backend.cleanups.lock(), 1);
        assert_eq!(*coarse_backend.cleanups.lock(), 1);
    }

    #[test]
    fn test_chained_levels() {
        let (coarse, coarse_backend) = level(CalculationMethod::Average, 2000, None);
        let (fine, fine_backend) = level(CalculationMethod::Average, 1000, Some(coarse));

        for time in (0..5000).step_by(500) {
            fine.update_sample(long(time, 10)).unwrap();
        }
        // fine emitted [0,1000)...[3000,4000), coarse folded two of them
        assert_eq!(fine_backend.times(), vec![0, 1000, 2000, 3000]);
        assert_eq!(coarse_backend.times(), vec![0]);
        assert_eq!(
            coarse_backend.samples.lock()[0].value,
            SampleValue::Long(10)
        );
    }
}
