//! Live presence from the beacon server's HTTP API.
//!
//! ## Endpoints
//!
//! - `GET /status`: an object keyed by patient name or RFID tag MAC. Values
//!   are either a bare status (`"IN_RANGE"`, `"OUT_OF_RANGE"`, `"UNKNOWN"`)
//!   or an object `{"status": ..., "room": ..., "zone": ...}`.
//! - `GET /api/status`: lightweight reachability probe.
//!
//! ## Example
//!
//! ```no_run
//! use vitalwatch::backend::SharedAddress;
//! use vitalwatch::source::{LiveBeaconSource, LocationSource};
//!
//! # tokio_test::block_on(async {
//! let source = LiveBeaconSource::builder()
//!     .address(SharedAddress::default())
//!     .build()
//!     .unwrap();
//!
//! if source.test_connection(Some("192.168.61.20:5000")).await {
//!     println!("beacon server reachable");
//! }
//! # });
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{LocationSource, Observation};
use crate::backend::{ServerAddress, SharedAddress};
use crate::data::{Connectivity, TrackedPatient};
use crate::error::SourceError;

/// Beacon server client.
#[derive(Debug, Clone)]
pub struct LiveBeaconSource {
    client: Client,
    address: SharedAddress,
    request_timeout: Duration,
    probe_timeout: Duration,
}

/// One value of the `/status` object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum BeaconEntry {
    Bare(Connectivity),
    Detailed {
        status: Connectivity,
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        zone: Option<String>,
    },
}

impl BeaconEntry {
    fn observation(&self) -> Observation {
        match self {
            BeaconEntry::Bare(status) => Observation::new(*status, None),
            BeaconEntry::Detailed { status, room, zone } => {
                Observation::new(*status, room.clone().or_else(|| zone.clone()))
            }
        }
    }
}

/// Parsed `/status` body. Entries that failed to parse keep their error so
/// only the patient they belong to is affected.
type StatusMap = BTreeMap<String, Result<BeaconEntry, String>>;

impl LiveBeaconSource {
    /// Create a new builder for configuring the source.
    pub fn builder() -> LiveBeaconSourceBuilder {
        LiveBeaconSourceBuilder::default()
    }

    /// Fetch the raw status map from the beacon server.
    async fn fetch_status(&self) -> Result<StatusMap, SourceError> {
        let url = format!("{}/status", self.address.get().http_base());

        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SourceError::Http(format!(
                "Beacon server returned status {}",
                response.status()
            )));
        }

        let raw: BTreeMap<String, serde_json::Value> = response
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;

        Ok(raw
            .into_iter()
            .map(|(key, value)| {
                let entry = serde_json::from_value::<BeaconEntry>(value).map_err(|e| e.to_string());
                (key, entry)
            })
            .collect())
    }
}

/// Resolve one patient against the beacon status map.
///
/// Untagged patients are unknown. A name match wins; otherwise any key that
/// contains the tag MAC (or is contained in it); a tagged patient the
/// beacons don't mention is out of range.
fn resolve(patient: &TrackedPatient, status: &StatusMap) -> Result<Observation, SourceError> {
    let Some(mac) = patient.rfid_mac.as_deref() else {
        return Ok(Observation::unknown());
    };

    let entry = status.get(&patient.name).or_else(|| {
        let mac = mac.to_ascii_lowercase();
        status.iter().find_map(|(key, entry)| {
            let key = key.to_ascii_lowercase();
            (!key.is_empty() && (key.contains(&mac) || mac.contains(&key))).then_some(entry)
        })
    });

    match entry {
        Some(Ok(entry)) => Ok(entry.observation()),
        Some(Err(e)) => Err(SourceError::Parse(format!("entry for {}: {}", patient.name, e))),
        None => Ok(Observation::new(Connectivity::OutOfRange, None)),
    }
}

#[async_trait]
impl LocationSource for LiveBeaconSource {
    async fn lookup_batch(&self, patients: &[TrackedPatient]) -> Vec<Result<Observation, SourceError>> {
        match self.fetch_status().await {
            Ok(status) => patients.iter().map(|p| resolve(p, &status)).collect(),
            Err(e) => {
                warn!("Beacon status fetch failed: {}", e);
                patients.iter().map(|_| Err(e.clone())).collect()
            }
        }
    }

    async fn test_connection(&self, address: Option<&str>) -> bool {
        let address = match address {
            Some(addr) => match ServerAddress::parse(addr) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Connection test skipped: {}", e);
                    return false;
                }
            },
            None => self.address.get(),
        };

        let url = format!("{}/api/status", address.http_base());
        match self.client.get(&url).timeout(self.probe_timeout).send().await {
            Ok(response) => {
                debug!("Probe {} -> {}", url, response.status());
                response.status().is_success()
            }
            Err(e) => {
                debug!("Probe {} failed: {}", url, e);
                false
            }
        }
    }

    fn description(&self) -> &str {
        "live beacons"
    }
}

/// Builder for LiveBeaconSource.
#[derive(Debug, Default)]
pub struct LiveBeaconSourceBuilder {
    address: Option<SharedAddress>,
    request_timeout: Option<Duration>,
    probe_timeout: Option<Duration>,
}

impl LiveBeaconSourceBuilder {
    /// Share the server address owned by the backend selector.
    pub fn address(mut self, address: SharedAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Timeout for a status fetch (default: 5 seconds).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Timeout for a reachability probe (default: 3 seconds).
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Build the source.
    pub fn build(self) -> Result<LiveBeaconSource, SourceError> {
        let client = Client::builder()
            .build()
            .map_err(|e| SourceError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(LiveBeaconSource {
            client,
            address: self.address.unwrap_or_default(),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(5)),
            probe_timeout: self.probe_timeout.unwrap_or(Duration::from_secs(3)),
        })
    }
}
