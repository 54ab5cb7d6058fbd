//! Runtime settings.
//!
//! Settings come from an optional TOML file and `VITALWATCH_*` environment
//! variables, later sources winning. Nested keys use `__` in variable
//! names:
//!
//! ```toml
//! [feed]
//! sample_interval = "5s"
//!
//! [poller]
//! interval = "1s"
//!
//! [live]
//! address = "192.168.61.162:5000"
//!
//! [mock]
//! zones = ["Room 101A", "Dining Hall"]
//!
//! [[patients]]
//! id = "patient-1"
//! name = "Robert Thompson"
//! rfid_mac = "AA:BB:CC:DD:EE:01"
//! baseline = { heart_rate = 82, oxygen_saturation = 96, respiratory_rate = 18 }
//! ```
//!
//! ```bash
//! VITALWATCH_POLLER__INTERVAL=2s vitalwatch --config vitalwatch.toml
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::backend::DEFAULT_SERVER_ADDRESS;
use crate::data::duration::serde_str;
use crate::data::{Thresholds, TrackedPatient};
use crate::feed::FeedSettings;
use crate::poller::PollerSettings;
use crate::source::{Baseline, MockVitalsSource, Perturbation, SharedNoise};

/// Everything the binary can be configured with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub feed: FeedSettings,
    pub poller: PollerSettings,
    pub live: LiveSettings,
    pub mock: MockSettings,
    pub thresholds: Thresholds,
    pub patients: Vec<PatientConfig>,
}

/// Connection settings for the live backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Server address used until one is persisted.
    pub address: String,
    #[serde(with = "serde_str")]
    pub connect_timeout: Duration,
    #[serde(with = "serde_str")]
    pub request_timeout: Duration,
    #[serde(with = "serde_str")]
    pub probe_timeout: Duration,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_SERVER_ADDRESS.to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Simulator settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockSettings {
    pub perturbation: Perturbation,
    /// Zones an in-range patient is placed in.
    pub zones: Vec<String>,
    /// Fixed seed for reproducible runs.
    pub seed: Option<u64>,
}

/// One monitored patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rfid_mac: Option<String>,
    /// Simulator baseline; patients without one have no mock vitals.
    #[serde(default)]
    pub baseline: Option<Baseline>,
}

impl Settings {
    /// Load from `path` (or `./vitalwatch.toml` if present) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), with an explicit environment in place of
    /// the process environment.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path),
            None => File::with_name("vitalwatch").required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("VITALWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the feed and poller cannot run with.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("feed.sample_interval", Some(self.feed.sample_interval)),
            ("feed.offline_after", self.feed.offline_after),
            ("feed.retry_delay", Some(self.feed.retry_delay)),
            ("poller.interval", Some(self.poller.interval)),
            ("poller.cycle_timeout", Some(self.poller.cycle_timeout)),
            ("poller.probe_timeout", Some(self.poller.probe_timeout)),
            ("live.connect_timeout", Some(self.live.connect_timeout)),
            ("live.request_timeout", Some(self.live.request_timeout)),
            ("live.probe_timeout", Some(self.live.probe_timeout)),
        ];
        for (key, value) in durations {
            if let Some(value) = value {
                ensure!(!value.is_zero(), "{} must be greater than zero", key);
            }
        }
        ensure!(self.feed.history_len > 0, "feed.history_len must be at least 1");
        Ok(())
    }

    /// Feed settings with the configured thresholds.
    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            thresholds: self.thresholds.clone(),
            ..self.feed.clone()
        }
    }

    pub fn tracked_patients(&self) -> Vec<TrackedPatient> {
        self.patients
            .iter()
            .map(|p| TrackedPatient::new(p.id.clone(), p.name.clone(), p.rfid_mac.as_deref()))
            .collect()
    }

    /// Simulated vitals for every patient with a baseline.
    pub fn mock_vitals(&self, noise: SharedNoise) -> MockVitalsSource {
        self.patients
            .iter()
            .filter_map(|p| p.baseline.clone().map(|b| (p.id.clone(), b)))
            .fold(MockVitalsSource::builder(), |builder, (id, baseline)| {
                builder.patient(id, baseline)
            })
            .perturbation(self.mock.perturbation.clone())
            .interval(self.feed.sample_interval)
            .shared_noise(noise)
            .build()
    }
}
