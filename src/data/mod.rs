//! Data models and classification.
//!
//! ## Submodules
//!
//! - [`classify`]: Threshold classification ([`Thresholds`], [`classify()`])
//! - [`duration`]: Parsing and formatting of duration strings (e.g., "5s", "500ms")
//! - [`history`]: Bounded per-patient vitals history for trends
//! - [`location`]: Presence records ([`LocationRecord`], [`Connectivity`])
//! - [`vitals`]: Samples and statuses ([`VitalsSample`], [`PatientStatus`])
//!
//! ## Data Flow
//!
//! ```text
//! VitalsSample (device JSON / simulator)
//!        │
//!        ▼
//! Thresholds::classify()  ──▶ PatientStatus (InRange | OutOfRange(sev) | Offline)
//!        │
//!        └──▶ VitalsHistory::record() (trends)
//! ```

pub mod classify;
pub mod duration;
pub mod history;
pub mod location;
pub mod vitals;

pub use classify::{classify, Thresholds, VitalBand, VitalGrades};
pub use history::VitalsHistory;
pub use location::{ConnectionState, Connectivity, LocationRecord, TrackedPatient};
pub use vitals::{PatientStatus, Severity, VitalsSample};
