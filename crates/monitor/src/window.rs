use std::collections::VecDeque;

use types::TelemetrySample;

pub const DEFAULT_CAPACITY: usize = 2;

/// Bounded FIFO that masks spurious zero energy readings.
#[derive(Debug, Clone)]
pub struct SmoothingWindow {
    capacity: usize,
    samples: VecDeque<TelemetrySample>,
}

impl Default for SmoothingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SmoothingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: TelemetrySample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Latest sample with its energy replaced by the mean of the non-zero
    /// energies held, or zero when every held reading is zero.
    pub fn fixed_average(&self) -> Option<TelemetrySample> {
        let latest = self.samples.back()?;
        let (sum, count) = self
            .samples
            .iter()
            .map(|sample| sample.daily_energy_wh)
            .filter(|energy| *energy != 0.0)
            .fold((0.0, 0usize), |(sum, count), energy| (sum + energy, count + 1));

        let mut fixed = latest.clone();
        fixed.daily_energy_wh = if count == 0 { 0.0 } else { sum / count as f64 };
        Some(fixed)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
