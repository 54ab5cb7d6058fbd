//! Presence records produced by the location poller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A patient tracked by the presence beacons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedPatient {
    pub id: String,
    /// Display name; the beacon server keys its status map by this.
    pub name: String,
    /// MAC address of the patient's RFID tag, if one is assigned.
    #[serde(default)]
    pub rfid_mac: Option<String>,
}

impl TrackedPatient {
    pub fn new(id: impl Into<String>, name: impl Into<String>, rfid_mac: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rfid_mac: rfid_mac.filter(|m| !m.is_empty()).map(str::to_string),
        }
    }
}

/// Beacon connectivity for one patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Connectivity {
    InRange,
    OutOfRange,
    /// Lookup failed, no tag assigned, or the record went stale.
    Unknown,
}

/// State of the link to the live backend, for a connection badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Testing,
    Disconnected,
}

/// A record is stale once it is older than this many polling intervals.
pub const STALE_AFTER_INTERVALS: u32 = 3;

/// Where a patient is, as of one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub patient_id: String,
    pub name: String,
    pub rfid_mac: Option<String>,
    /// Last time the beacons reported the patient in range.
    pub last_seen: Option<DateTime<Utc>>,
    /// Room or zone label, when the backend reports one.
    pub zone: Option<String>,
    pub connectivity: Connectivity,
    /// When the poll that produced this record completed.
    pub refreshed_at: DateTime<Utc>,
}

impl LocationRecord {
    /// A record for a patient whose lookup failed.
    pub fn unknown(
        patient: &TrackedPatient,
        last_seen: Option<DateTime<Utc>>,
        refreshed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            patient_id: patient.id.clone(),
            name: patient.name.clone(),
            rfid_mac: patient.rfid_mac.clone(),
            last_seen,
            zone: None,
            connectivity: Connectivity::Unknown,
            refreshed_at,
        }
    }

    /// Whether the record is too old to trust for the given polling interval.
    pub fn is_stale(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        let max_age = interval.saturating_mul(STALE_AFTER_INTERVALS);
        match (now - self.refreshed_at).to_std() {
            Ok(age) => age > max_age,
            // refreshed in the future (clock skew): treat as fresh
            Err(_) => false,
        }
    }

    /// Connectivity to display: `Unknown` once the record is stale.
    pub fn effective_connectivity(&self, now: DateTime<Utc>, interval: Duration) -> Connectivity {
        if self.is_stale(now, interval) {
            Connectivity::Unknown
        } else {
            self.connectivity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(refreshed_at: DateTime<Utc>) -> LocationRecord {
        LocationRecord {
            patient_id: "patient-1".to_string(),
            name: "Robert Thompson".to_string(),
            rfid_mac: Some("AA:BB:CC:DD:EE:01".to_string()),
            last_seen: Some(refreshed_at),
            zone: Some("Room 101A".to_string()),
            connectivity: Connectivity::InRange,
            refreshed_at,
        }
    }

    #[test]
    fn test_fresh_record_keeps_connectivity() {
        let now = Utc::now();
        let r = record(now - chrono::Duration::seconds(2));
        assert!(!r.is_stale(now, Duration::from_secs(1)));
        assert_eq!(
            r.effective_connectivity(now, Duration::from_secs(1)),
            Connectivity::InRange
        );
    }

    #[test]
    fn test_record_older_than_three_intervals_is_unknown() {
        let now = Utc::now();
        let r = record(now - chrono::Duration::seconds(4));
        assert!(r.is_stale(now, Duration::from_secs(1)));
        assert_eq!(
            r.effective_connectivity(now, Duration::from_secs(1)),
            Connectivity::Unknown
        );
    }

    #[test]
    fn test_empty_mac_is_no_mac() {
        let p = TrackedPatient::new("p1", "Jane", Some(""));
        assert!(p.rfid_mac.is_none());
    }

    #[test]
    fn test_connectivity_wire_names() {
        let c: Connectivity = serde_json::from_str(r#""OUT_OF_RANGE""#).unwrap();
        assert_eq!(c, Connectivity::OutOfRange);
        assert_eq!(serde_json::to_string(&Connectivity::InRange).unwrap(), r#""IN_RANGE""#);
    }
}
