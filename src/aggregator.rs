use serde::{Deserialize, Serialize};

use crate::sensor::{RawSample, SensorIndex};

/// Default run length; the inference service consumes batches of this size.
pub const DEFAULT_WINDOW_SIZE: u32 = 24;

/// Summary of one window of consecutive samples from a single sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedBatch {
    pub sensor: SensorIndex,
    pub mean_x: f32,
    pub mean_y: f32,
    pub mean_z: f32,
    pub mean_magnitude: f32,
    pub sample_count: u32,
    pub window_start_time: u64,
    pub window_end_time: u64,
    /// Set when the window was force-flushed before it filled.
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub samples_accepted: u64,
    pub batches_emitted: u32,
    pub partial_batches: u32,
}

/// Running sums for the single open window of one sensor stream.
#[derive(Debug)]
pub struct SampleAggregator {
    sensor: SensorIndex,
    window_size: u32,
    sum_x: f64,
    sum_y: f64,
    sum_z: f64,
    sum_magnitude: f64,
    count: u32,
    window_start: u64,
    window_end: u64,
    stats: AggregatorStats,
}

impl SampleAggregator {
    pub fn new(sensor: SensorIndex, window_size: u32) -> Self {
        debug_assert!(window_size > 0, "window size must be positive");
        Self {
            sensor,
            window_size: window_size.max(1),
            sum_x: 0.0,
            sum_y: 0.0,
            sum_z: 0.0,
            sum_magnitude: 0.0,
            count: 0,
            window_start: 0,
            window_end: 0,
            stats: AggregatorStats::default(),
        }
    }

    pub fn push(&mut self, sample: RawSample) -> Option<AggregatedBatch> {
        debug_assert_eq!(sample.sensor, self.sensor, "sample routed to the wrong stream");

        if self.count == 0 {
            self.window_start = sample.capture_time;
        }
        self.window_end = sample.capture_time;

        self.sum_x += f64::from(sample.axis_x);
        self.sum_y += f64::from(sample.axis_y);
        self.sum_z += f64::from(sample.axis_z);
        self.sum_magnitude += f64::from(sample.magnitude);
        self.count += 1;
        self.stats.samples_accepted += 1;

        if self.count >= self.window_size {
            Some(self.emit(false))
        } else {
            None
        }
    }

    /// Emits whatever is open as a partial batch.
    pub fn flush(&mut self) -> Option<AggregatedBatch> {
        if self.count == 0 {
            return None;
        }
        Some(self.emit(true))
    }

    fn emit(&mut self, partial: bool) -> AggregatedBatch {
        let n = f64::from(self.count);
        let batch = AggregatedBatch {
            sensor: self.sensor,
            mean_x: (self.sum_x / n) as f32,
            mean_y: (self.sum_y / n) as f32,
            mean_z: (self.sum_z / n) as f32,
            mean_magnitude: (self.sum_magnitude / n) as f32,
            sample_count: self.count,
            window_start_time: self.window_start,
            window_end_time: self.window_end,
            partial,
        };

        self.stats.batches_emitted += 1;
        if partial {
            self.stats.partial_batches += 1;
        }
        self.reset();
        batch
    }

    fn reset(&mut self) {
        self.sum_x = 0.0;
        self.sum_y = 0.0;
        self.sum_z = 0.0;
        self.sum_magnitude = 0.0;
        self.count = 0;
        self.window_start = 0;
        self.window_end = 0;
    }

    pub fn sensor(&self) -> SensorIndex {
        self.sensor
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Samples in the currently open window.
    pub fn open_count(&self) -> u32 {
        self.count
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f32, t: u64) -> RawSample {
        RawSample::new(0, value, 0.0, 0.0, t)
    }

    #[test]
    fn test_emits_on_full_window() {
        let mut agg = SampleAggregator::new(0, 3);
        assert!(agg.push(sample(1.0, 10)).is_none());
        assert!(agg.push(sample(2.0, 20)).is_none());
        let batch = agg.push(sample(3.0, 30)).unwrap();

        assert_eq!(batch.sample_count, 3);
        assert!(!batch.partial);
        assert_eq!(batch.window_start_time, 10);
        assert_eq!(batch.window_end_time, 30);
        assert!((batch.mean_x - 2.0).abs() < 1e-6);
        assert_eq!(agg.open_count(), 0);
    }

    #[test]
    fn test_flush_empty_window() {
        let mut agg = SampleAggregator::new(0, 4);
        assert!(agg.flush().is_none());
        assert_eq!(agg.stats().partial_batches, 0);
    }

    #[test]
    fn test_window_times_reset_between_batches() {
        let mut agg = SampleAggregator::new(0, 2);
        agg.push(sample(1.0, 100));
        agg.push(sample(1.0, 110));
        agg.push(sample(1.0, 120));
        let partial = agg.flush().unwrap();
        assert_eq!(partial.window_start_time, 120);
        assert_eq!(partial.window_end_time, 120);
        assert!(partial.partial);
        assert_eq!(agg.stats().batches_emitted, 2);
    }
}
