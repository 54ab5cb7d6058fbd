//! Bounded per-patient vitals history for trends and rate calculations.

use std::collections::VecDeque;

use super::vitals::VitalsSample;

/// Number of readings kept per patient unless configured otherwise.
pub const DEFAULT_HISTORY_LEN: usize = 100;

/// Recent accepted samples for one patient, oldest at the front.
#[derive(Debug, Clone)]
pub struct VitalsHistory {
    samples: VecDeque<VitalsSample>,
    capacity: usize,
}

impl Default for VitalsHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_LEN)
    }
}

impl VitalsHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an accepted sample, evicting the oldest one when full.
    pub fn record(&mut self, sample: VitalsSample) {
        self.samples.push_back(sample);
        if self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&VitalsSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Readings newest first, at most `limit` of them.
    pub fn recent(&self, limit: usize) -> Vec<VitalsSample> {
        self.samples.iter().rev().take(limit).cloned().collect()
    }

    /// Heart rate trend normalized to 0-7 for an 8-level sparkline.
    ///
    /// Returns an empty Vec if there's not enough history.
    pub fn heart_rate_sparkline(&self) -> Vec<u8> {
        if self.samples.len() < 2 {
            return Vec::new();
        }

        let values: Vec<f64> = self
            .samples
            .iter()
            .map(|s| s.heart_rate)
            .filter(|v| v.is_finite())
            .collect();

        let max = values.iter().copied().fold(f64::MIN, f64::max);
        let min = values.iter().copied().fold(f64::MAX, f64::min);
        let range = (max - min).max(1.0);

        values
            .iter()
            .map(|&v| {
                let normalized = ((v - min) / range * 7.0) as u8;
                normalized.min(7)
            })
            .collect()
    }

    /// Steps per minute between the two most recent readings.
    ///
    /// Returns None if there's not enough history or the timestamps don't advance.
    pub fn step_rate(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }

        let current = self.samples.back()?;
        let previous = self.samples.get(self.samples.len() - 2)?;
        let delta = current.step_count as f64 - previous.step_count as f64;

        let elapsed = (current.timestamp - previous.timestamp).num_milliseconds() as f64 / 60_000.0;

        if elapsed > 0.0 {
            Some(delta / elapsed)
        } else {
            None
        }
    }
}
