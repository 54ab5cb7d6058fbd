//! Threshold classification of vitals samples.
//!
//! Each vital is graded against a normal band and a wider warning band;
//! anything outside the warning band is critical. The patient's status is
//! the worst grade across the three vitals.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::vitals::{PatientStatus, Severity, VitalsSample};

/// Normal and warning bands for a single vital.
///
/// A value inside `normal` is [`Severity::Normal`], inside `warning` (but
/// not normal) is [`Severity::Warning`], otherwise [`Severity::Critical`].
/// NaN falls outside every band and therefore grades as critical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalBand {
    pub normal: RangeInclusive<f64>,
    pub warning: RangeInclusive<f64>,
}

impl VitalBand {
    pub fn new(normal: RangeInclusive<f64>, warning: RangeInclusive<f64>) -> Self {
        Self { normal, warning }
    }

    pub fn grade(&self, value: f64) -> Severity {
        if self.normal.contains(&value) {
            Severity::Normal
        } else if self.warning.contains(&value) {
            Severity::Warning
        } else {
            Severity::Critical
        }
    }
}

/// Thresholds for vitals classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Beats per minute.
    pub heart_rate: VitalBand,
    /// SpO2 percent. Readings above 100 are not physiological and grade critical.
    pub oxygen_saturation: VitalBand,
    /// Breaths per minute.
    pub respiratory_rate: VitalBand,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            heart_rate: VitalBand::new(60.0..=100.0, 50.0..=120.0),
            // warning covers 90 up to (not including) 95; the normal band is checked first
            oxygen_saturation: VitalBand::new(95.0..=100.0, 90.0..=100.0),
            respiratory_rate: VitalBand::new(12.0..=20.0, 8.0..=25.0),
        }
    }
}

/// Per-vital grades for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VitalGrades {
    pub heart_rate: Severity,
    pub oxygen_saturation: Severity,
    pub respiratory_rate: Severity,
}

impl VitalGrades {
    /// The worst grade of the three.
    pub fn worst(&self) -> Severity {
        self.heart_rate.max(self.oxygen_saturation).max(self.respiratory_rate)
    }
}

impl Thresholds {
    /// Grade every vital of a sample individually.
    pub fn assess_vitals(&self, sample: &VitalsSample) -> VitalGrades {
        VitalGrades {
            heart_rate: self.heart_rate.grade(sample.heart_rate),
            oxygen_saturation: self.oxygen_saturation.grade(sample.oxygen_saturation),
            respiratory_rate: self.respiratory_rate.grade(sample.respiratory_rate),
        }
    }

    /// Classify a sample. Total: every input, however implausible, yields a status.
    pub fn classify(&self, sample: &VitalsSample) -> PatientStatus {
        match self.assess_vitals(sample).worst() {
            Severity::Normal => PatientStatus::InRange,
            worst => PatientStatus::OutOfRange(worst),
        }
    }

    /// Status for the latest known sample, taking its age into account.
    ///
    /// `age` is how long ago the sample was received. A sample is only
    /// current strictly within `window`; from then on the patient is
    /// `Offline` regardless of the last reading.
    pub fn assess(
        &self,
        latest: Option<&VitalsSample>,
        age: Duration,
        window: Duration,
    ) -> PatientStatus {
        match latest {
            Some(sample) if age < window => self.classify(sample),
            _ => PatientStatus::Offline,
        }
    }
}

/// Classify a sample with the default thresholds.
pub fn classify(sample: &VitalsSample) -> PatientStatus {
    Thresholds::default().classify(sample)
}
