//! Data source abstraction for vitals and presence data.
//!
//! Every source comes in two flavours sharing one contract: a live one
//! talking to the network and a mock one generating deterministic
//! in-memory data. The [`BackendSelector`](crate::backend::BackendSelector)
//! decides which pair callers get.

mod beacon;
mod mock;
mod stream;

pub use beacon::{LiveBeaconSource, LiveBeaconSourceBuilder};
pub use mock::{
    Baseline, FixedNoise, MockLocationSource, MockVitalsSource, NoiseSource, Perturbation,
    RandomNoise, SharedNoise,
};
pub use stream::{
    frames_from_reader, ChannelTransport, Frames, LiveVitalsSource, TcpVitalsTransport,
    VitalsTransport,
};

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::data::{Connectivity, TrackedPatient, VitalsSample};
use crate::error::SourceError;

/// Latest-value stream of samples for one patient.
///
/// Holds `None` until the first sample arrives. The sender side is dropped
/// when the underlying connection ends, which makes `changed()` fail.
pub type SampleStream = watch::Receiver<Option<VitalsSample>>;

/// Trait for sources of live vitals.
///
/// # Example
///
/// ```
/// use vitalwatch::source::{Baseline, MockVitalsSource, RandomNoise, VitalsSource};
///
/// # tokio_test::block_on(async {
/// let source = MockVitalsSource::builder()
///     .patient("patient-1", Baseline::new(82.0, 96.0, 18.0, 2150))
///     .noise(RandomNoise::seeded(7))
///     .build();
/// let stream = source.connect("patient-1").await.unwrap();
/// assert!(stream.borrow().is_none());
/// # });
/// ```
#[async_trait]
pub trait VitalsSource: Send + Sync + Debug {
    /// Attach to the sample stream of one patient.
    ///
    /// The returned stream keeps only the most recent sample.
    async fn connect(&self, patient_id: &str) -> Result<SampleStream, SourceError>;

    /// Past readings for a patient, newest first.
    async fn history(&self, patient_id: &str, limit: usize)
        -> Result<Vec<VitalsSample>, SourceError> {
        let _ = (patient_id, limit);
        Err(SourceError::Unsupported(format!(
            "history from {}",
            self.description()
        )))
    }

    /// Returns a human-readable description of the source.
    fn description(&self) -> &str;
}

/// What a presence backend reports about one patient in one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub connectivity: Connectivity,
    pub zone: Option<String>,
}

impl Observation {
    pub fn new(connectivity: Connectivity, zone: Option<String>) -> Self {
        Self { connectivity, zone }
    }

    pub fn unknown() -> Self {
        Self::new(Connectivity::Unknown, None)
    }
}

/// Trait for presence (beacon) backends.
#[async_trait]
pub trait LocationSource: Send + Sync + Debug {
    /// Look up every patient in one batch.
    ///
    /// Must return exactly one entry per patient, in the same order. A
    /// failure for one patient is reported in that patient's slot only.
    async fn lookup_batch(&self, patients: &[TrackedPatient]) -> Vec<Result<Observation, SourceError>>;

    /// Check whether the backend is reachable, optionally at another address.
    ///
    /// Never hangs: implementations bound the probe with a timeout.
    async fn test_connection(&self, address: Option<&str>) -> bool;

    /// Returns a human-readable description of the source.
    fn description(&self) -> &str;
}
