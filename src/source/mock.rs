//! Simulated backends.
//!
//! Vitals are synthesized on a timer by perturbing a per-patient baseline;
//! presence is rolled per poll. All randomness comes from an injectable
//! [`NoiseSource`] so tests can pin every generated value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{LocationSource, Observation, SampleStream, VitalsSource};
use crate::data::{Connectivity, TrackedPatient, VitalsSample};
use crate::error::SourceError;

/// A source of uniform noise in `[0, 1)`.
pub trait NoiseSource: Send + std::fmt::Debug {
    fn unit(&mut self) -> f64;

    /// Uniform value in `[-bound, bound)`.
    fn symmetric(&mut self, bound: f64) -> f64 {
        (self.unit() * 2.0 - 1.0) * bound
    }
}

/// Noise source shared between a mock source and the tasks it spawns.
pub type SharedNoise = Arc<Mutex<Box<dyn NoiseSource>>>;

/// Pseudo-random noise from a seedable generator.
#[derive(Debug)]
pub struct RandomNoise(StdRng);

impl RandomNoise {
    /// Deterministic noise for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl NoiseSource for RandomNoise {
    fn unit(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
}

/// Noise that cycles through a fixed list of values. Handy in tests.
#[derive(Debug, Clone)]
pub struct FixedNoise {
    values: Vec<f64>,
    next: usize,
}

impl FixedNoise {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, next: 0 }
    }

    /// Always 0.5, which makes every symmetric perturbation zero.
    pub fn centered() -> Self {
        Self::new(vec![0.5])
    }
}

impl NoiseSource for FixedNoise {
    fn unit(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.5;
        }
        let value = self.values[self.next % self.values.len()];
        self.next = self.next.wrapping_add(1);
        value.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

fn shared(noise: impl NoiseSource + 'static) -> SharedNoise {
    Arc::new(Mutex::new(Box::new(noise)))
}

/// Resting vitals a simulated patient fluctuates around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub heart_rate: f64,
    pub oxygen_saturation: f64,
    pub respiratory_rate: f64,
    #[serde(default)]
    pub step_count: u64,
}

impl Baseline {
    pub fn new(heart_rate: f64, oxygen_saturation: f64, respiratory_rate: f64, step_count: u64) -> Self {
        Self {
            heart_rate,
            oxygen_saturation,
            respiratory_rate,
            step_count,
        }
    }
}

/// Bounds of the random perturbation applied to a baseline.
///
/// These are demo values, not clinical requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Perturbation {
    /// +/- bpm.
    pub heart_rate: f64,
    /// +/- percent.
    pub oxygen_saturation: f64,
    /// SpO2 is clamped to this range after perturbing.
    pub oxygen_saturation_min: f64,
    pub oxygen_saturation_max: f64,
    /// +/- breaths per minute.
    pub respiratory_rate: f64,
    /// Steps added on top of the baseline, `0..steps`.
    pub steps: u64,
}

impl Default for Perturbation {
    fn default() -> Self {
        Self {
            heart_rate: 5.0,
            oxygen_saturation: 2.0,
            oxygen_saturation_min: 85.0,
            oxygen_saturation_max: 100.0,
            respiratory_rate: 2.0,
            steps: 10,
        }
    }
}

impl Perturbation {
    fn apply(&self, base: &Baseline, noise: &mut dyn NoiseSource, timestamp: DateTime<Utc>) -> VitalsSample {
        let heart_rate = base.heart_rate + noise.symmetric(self.heart_rate);
        let oxygen_saturation = (base.oxygen_saturation + noise.symmetric(self.oxygen_saturation))
            .clamp(self.oxygen_saturation_min, self.oxygen_saturation_max);
        let respiratory_rate = base.respiratory_rate + noise.symmetric(self.respiratory_rate);
        let step_count = base.step_count + (noise.unit() * self.steps as f64) as u64;

        VitalsSample::new(heart_rate, oxygen_saturation, respiratory_rate, step_count, timestamp)
    }
}

/// Simulated vitals: one sample per `interval` per connected patient.
#[derive(Debug, Clone)]
pub struct MockVitalsSource {
    baselines: Arc<HashMap<String, Baseline>>,
    perturbation: Perturbation,
    interval: Duration,
    noise: SharedNoise,
}

impl MockVitalsSource {
    pub fn builder() -> MockVitalsSourceBuilder {
        MockVitalsSourceBuilder::default()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Generate one sample for a patient right now.
    pub fn sample(&self, patient_id: &str) -> Result<VitalsSample, SourceError> {
        let base = self.baseline(patient_id)?;
        let mut noise = self.noise.lock();
        Ok(self.perturbation.apply(base, noise.as_mut(), Utc::now()))
    }

    /// Readings every four hours going back `days` days, newest first.
    ///
    /// Uses wider swings than the live simulation and clamps to plausible
    /// ranges, so charts have something to show.
    pub fn generate_history(&self, patient_id: &str, days: u32) -> Result<Vec<VitalsSample>, SourceError> {
        let base = self.baseline(patient_id)?;
        let now = Utc::now();
        let mut noise = self.noise.lock();

        let readings = (0..=i64::from(days) * 6)
            .map(|k| {
                let timestamp = now - chrono::Duration::hours(4 * k);
                VitalsSample::new(
                    (base.heart_rate + noise.symmetric(10.0)).clamp(50.0, 120.0),
                    (base.oxygen_saturation + noise.symmetric(3.0)).clamp(85.0, 100.0),
                    (base.respiratory_rate + noise.symmetric(3.0)).clamp(12.0, 30.0),
                    (noise.unit() * 1000.0) as u64,
                    timestamp,
                )
            })
            .collect();

        Ok(readings)
    }

    fn baseline(&self, patient_id: &str) -> Result<&Baseline, SourceError> {
        self.baselines
            .get(patient_id)
            .ok_or_else(|| SourceError::UnknownPatient(patient_id.to_string()))
    }
}

#[async_trait]
impl VitalsSource for MockVitalsSource {
    async fn connect(&self, patient_id: &str) -> Result<SampleStream, SourceError> {
        let base = self.baseline(patient_id)?.clone();
        let (tx, rx) = watch::channel(None);
        let perturbation = self.perturbation.clone();
        let noise = self.noise.clone();
        let interval = self.interval;
        let patient = patient_id.to_string();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<DateTime<Utc>> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // wall clocks can step backwards; keep our own stream monotonic
                        let now = last.map_or_else(Utc::now, |l| Utc::now().max(l));
                        last = Some(now);
                        let sample = {
                            let mut noise = noise.lock();
                            perturbation.apply(&base, noise.as_mut(), now)
                        };
                        if tx.send(Some(sample)).is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            debug!("Mock vitals stream for {} closed", patient);
        });

        Ok(rx)
    }

    async fn history(&self, patient_id: &str, limit: usize) -> Result<Vec<VitalsSample>, SourceError> {
        let mut readings = self.generate_history(patient_id, 7)?;
        readings.truncate(limit);
        Ok(readings)
    }

    fn description(&self) -> &str {
        "mock vitals"
    }
}

/// Builder for [`MockVitalsSource`].
#[derive(Debug, Default)]
pub struct MockVitalsSourceBuilder {
    baselines: HashMap<String, Baseline>,
    perturbation: Option<Perturbation>,
    interval: Option<Duration>,
    noise: Option<SharedNoise>,
}

impl MockVitalsSourceBuilder {
    /// Register a simulated patient.
    pub fn patient(mut self, patient_id: impl Into<String>, baseline: Baseline) -> Self {
        self.baselines.insert(patient_id.into(), baseline);
        self
    }

    pub fn perturbation(mut self, perturbation: Perturbation) -> Self {
        self.perturbation = Some(perturbation);
        self
    }

    /// Time between samples (default: 5 seconds).
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn noise(mut self, noise: impl NoiseSource + 'static) -> Self {
        self.noise = Some(shared(noise));
        self
    }

    pub fn shared_noise(mut self, noise: SharedNoise) -> Self {
        self.noise = Some(noise);
        self
    }

    pub fn build(self) -> MockVitalsSource {
        let interval = match self.interval {
            Some(interval) if interval.is_zero() => {
                warn!("Mock sample interval must be positive, using 1ms");
                Duration::from_millis(1)
            }
            Some(interval) => interval,
            None => Duration::from_secs(5),
        };

        MockVitalsSource {
            baselines: Arc::new(self.baselines),
            perturbation: self.perturbation.unwrap_or_default(),
            interval,
            noise: self.noise.unwrap_or_else(|| shared(RandomNoise::from_entropy())),
        }
    }
}

/// Simulated presence: each poll rolls every patient independently.
///
/// 70% in range (in one of the configured zones), 20% out of range,
/// 10% unknown.
#[derive(Debug, Clone)]
pub struct MockLocationSource {
    zones: Vec<String>,
    noise: SharedNoise,
}

impl MockLocationSource {
    pub fn new(zones: Vec<String>, noise: impl NoiseSource + 'static) -> Self {
        Self::with_shared_noise(zones, shared(noise))
    }

    pub fn with_shared_noise(zones: Vec<String>, noise: SharedNoise) -> Self {
        Self { zones, noise }
    }

    fn roll(&self) -> Observation {
        let mut noise = self.noise.lock();
        let roll = noise.unit();
        if roll < 0.7 {
            let zone = if self.zones.is_empty() {
                None
            } else {
                let idx = (noise.unit() * self.zones.len() as f64) as usize;
                self.zones.get(idx.min(self.zones.len() - 1)).cloned()
            };
            Observation::new(Connectivity::InRange, zone)
        } else if roll < 0.9 {
            Observation::new(Connectivity::OutOfRange, None)
        } else {
            Observation::unknown()
        }
    }
}

#[async_trait]
impl LocationSource for MockLocationSource {
    async fn lookup_batch(&self, patients: &[TrackedPatient]) -> Vec<Result<Observation, SourceError>> {
        patients.iter().map(|_| Ok(self.roll())).collect()
    }

    async fn test_connection(&self, _address: Option<&str>) -> bool {
        true
    }

    fn description(&self) -> &str {
        "mock beacons"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{classify, PatientStatus};

    fn robert() -> Baseline {
        Baseline::new(82.0, 96.0, 18.0, 2150)
    }

    #[test]
    fn test_centered_noise_reproduces_baseline() {
        let source = MockVitalsSource::builder()
            .patient("patient-1", robert())
            .noise(FixedNoise::centered())
            .build();

        let sample = source.sample("patient-1").unwrap();
        assert_eq!(sample.heart_rate, 82.0);
        assert_eq!(sample.oxygen_saturation, 96.0);
        assert_eq!(sample.respiratory_rate, 18.0);
        assert_eq!(sample.step_count, 2155);
        assert_eq!(classify(&sample), PatientStatus::InRange);
    }

    #[test]
    fn test_perturbation_stays_within_bounds() {
        let source = MockVitalsSource::builder()
            .patient("patient-1", robert())
            .noise(RandomNoise::seeded(42))
            .build();

        for _ in 0..500 {
            let s = source.sample("patient-1").unwrap();
            assert!((77.0..=87.0).contains(&s.heart_rate));
            assert!((94.0..=98.0).contains(&s.oxygen_saturation));
            assert!((16.0..=20.0).contains(&s.respiratory_rate));
            assert!((2150..2160).contains(&s.step_count));
        }
    }

    #[test]
    fn test_oxygen_saturation_is_clamped() {
        let source = MockVitalsSource::builder()
            .patient("p", Baseline::new(70.0, 99.5, 16.0, 0))
            .noise(FixedNoise::new(vec![0.99]))
            .build();

        assert_eq!(source.sample("p").unwrap().oxygen_saturation, 100.0);
    }

    #[test]
    fn test_same_seed_same_samples() {
        let make = || {
            MockVitalsSource::builder()
                .patient("p", robert())
                .noise(RandomNoise::seeded(9))
                .build()
        };
        let (a, b) = (make(), make());
        for _ in 0..10 {
            assert_eq!(
                a.sample("p").unwrap().heart_rate,
                b.sample("p").unwrap().heart_rate
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_patient_cannot_connect() {
        let source = MockVitalsSource::builder().build();
        let err = source.connect("nobody").await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownPatient(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_emits_every_interval() {
        let source = MockVitalsSource::builder()
            .patient("p", robert())
            .interval(Duration::from_secs(5))
            .noise(FixedNoise::centered())
            .build();

        let mut stream = source.connect("p").await.unwrap();
        assert!(stream.borrow().is_none());

        stream.changed().await.unwrap();
        let first = stream.borrow_and_update().clone().unwrap();
        stream.changed().await.unwrap();
        let second = stream.borrow_and_update().clone().unwrap();

        assert!(second.timestamp >= first.timestamp);
        assert_eq!(first.heart_rate, 82.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let source = MockVitalsSource::builder()
            .patient("p", robert())
            .interval(Duration::ZERO)
            .noise(FixedNoise::centered())
            .build();
        assert_eq!(source.interval(), Duration::from_millis(1));

        let mut stream = source.connect("p").await.unwrap();
        for _ in 0..3 {
            stream.changed().await.unwrap();
        }
        assert_eq!(stream.borrow().as_ref().unwrap().heart_rate, 82.0);
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_clamped() {
        let source = MockVitalsSource::builder()
            .patient("p", robert())
            .noise(RandomNoise::seeded(3))
            .build();

        let history = source.history("p", 100).await.unwrap();
        assert_eq!(history.len(), 43);
        assert!(history.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
        assert!(history.iter().all(|s| (50.0..=120.0).contains(&s.heart_rate)));

        let limited = source.history("p", 5).await.unwrap();
        assert_eq!(limited.len(), 5);
    }

    #[tokio::test]
    async fn test_location_distribution_follows_roll() {
        // roll 0.1 -> in range, zone pick 0.6 -> second zone; 0.8 -> out of range; 0.95 -> unknown
        let source = MockLocationSource::new(
            vec!["Room 101A".to_string(), "Dining Hall".to_string()],
            FixedNoise::new(vec![0.1, 0.6, 0.8, 0.95]),
        );
        let patients = vec![
            TrackedPatient::new("p1", "A", Some("AA:01")),
            TrackedPatient::new("p2", "B", Some("AA:02")),
            TrackedPatient::new("p3", "C", Some("AA:03")),
        ];

        let batch = source.lookup_batch(&patients).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch[0].as_ref().unwrap(),
            &Observation::new(Connectivity::InRange, Some("Dining Hall".to_string()))
        );
        assert_eq!(batch[1].as_ref().unwrap().connectivity, Connectivity::OutOfRange);
        assert_eq!(batch[2].as_ref().unwrap().connectivity, Connectivity::Unknown);
        assert!(source.test_connection(None).await);
    }
}
