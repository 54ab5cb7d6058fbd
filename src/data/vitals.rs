//! Vitals samples and the clinical status derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped reading from a patient's wearable (or the simulator).
///
/// Samples are immutable once created. The JSON form uses camelCase keys
/// (`heartRate`, `oxygenSaturation`, ...) to match what devices publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsSample {
    /// Beats per minute.
    pub heart_rate: f64,
    /// SpO2, in percent.
    pub oxygen_saturation: f64,
    /// Breaths per minute.
    pub respiratory_rate: f64,
    #[serde(default)]
    pub step_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl VitalsSample {
    pub fn new(
        heart_rate: f64,
        oxygen_saturation: f64,
        respiratory_rate: f64,
        step_count: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            heart_rate,
            oxygen_saturation,
            respiratory_rate,
            step_count,
            timestamp,
        }
    }
}

/// Severity of a single vital, or of a whole sample (worst of its vitals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl Severity {
    /// Returns a short symbol for display.
    pub fn symbol(&self) -> &'static str {
        match self {
            Severity::Normal => "OK",
            Severity::Warning => "WARN",
            Severity::Critical => "CRIT",
        }
    }
}

/// Clinical status of a patient.
///
/// Never set directly: always produced by the classifier from the most
/// recent [`VitalsSample`], or `Offline` when there is no recent sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "severity")]
pub enum PatientStatus {
    InRange,
    /// Carries the worst severity among the vitals; never `Severity::Normal`.
    OutOfRange(Severity),
    Offline,
}

impl PatientStatus {
    pub fn is_critical(&self) -> bool {
        matches!(self, PatientStatus::OutOfRange(Severity::Critical))
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, PatientStatus::Offline)
    }

    /// Short label for logs and exports.
    pub fn label(&self) -> &'static str {
        match self {
            PatientStatus::InRange => "in_range",
            PatientStatus::OutOfRange(Severity::Critical) => "critical",
            PatientStatus::OutOfRange(_) => "warning",
            PatientStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for PatientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
