//! # vitalwatch
//!
//! Patient vitals synchronization, status classification and presence
//! polling, behind a backend that can be switched at runtime between live
//! services and a deterministic simulator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        BackendSelector                           │
//! │        mode: Live | Mock (persisted in a KeyValueStore)          │
//! │   ┌────────────────────────┐      ┌───────────────────────────┐  │
//! │   │ live                   │      │ mock                      │  │
//! │   │ LiveVitalsSource (TCP) │      │ MockVitalsSource          │  │
//! │   │ LiveBeaconSource (HTTP)│      │ MockLocationSource        │  │
//! │   └────────────────────────┘      └───────────────────────────┘  │
//! └──────────────┬──────────────────────────────────┬────────────────┘
//!                ▼                                  ▼
//!        ┌──────────────┐                   ┌────────────────┐
//!        │  VitalsFeed  │                   │ LocationPoller │
//!        │ (per patient)│                   │ (batch cycles) │
//!        └──────┬───────┘                   └───────┬────────┘
//!               ▼                                   ▼
//!   Thresholds::assess() -> PatientStatus    Vec<LocationRecord>
//! ```
//!
//! - **[`data`]**: samples, statuses, presence records and the threshold
//!   classifier ([`classify()`])
//! - **[`source`]**: the [`VitalsSource`] and [`LocationSource`] traits with
//!   live and mock implementations
//! - **[`backend`]**: the [`BackendSelector`] choosing which sources are used
//! - **[`feed`]**: per-patient vitals subscriptions ([`VitalsFeed`])
//! - **[`poller`]**: periodic presence lookups ([`LocationPoller`])
//! - **[`store`]**: durable key-value storage for the selector
//! - **[`config`]**: file and environment settings
//!
//! ## Usage
//!
//! ### Classifying a sample
//!
//! ```
//! use chrono::Utc;
//! use vitalwatch::{classify, PatientStatus, Severity, VitalsSample};
//!
//! let sample = VitalsSample::new(45.0, 98.0, 16.0, 0, Utc::now());
//! assert_eq!(classify(&sample), PatientStatus::OutOfRange(Severity::Critical));
//! ```
//!
//! ### Subscribing to simulated vitals
//!
//! ```no_run
//! use std::sync::Arc;
//! use vitalwatch::backend::{Backend, BackendSelector, SharedAddress};
//! use vitalwatch::feed::{FeedSettings, VitalsFeed};
//! use vitalwatch::VitalsSample;
//! use vitalwatch::source::{Baseline, MockLocationSource, MockVitalsSource, RandomNoise};
//! use vitalwatch::store::MemoryStore;
//!
//! # tokio_test::block_on(async {
//! let mock = Backend::new(
//!     Arc::new(
//!         MockVitalsSource::builder()
//!             .patient("patient-1", Baseline::new(82.0, 96.0, 18.0, 2150))
//!             .build(),
//!     ),
//!     Arc::new(MockLocationSource::new(vec!["Dining Hall".into()], RandomNoise::seeded(1))),
//! );
//! let selector = BackendSelector::load(
//!     Arc::new(MemoryStore::new()),
//!     SharedAddress::default(),
//!     mock.clone(),
//!     mock,
//! )
//! .await
//! .unwrap();
//!
//! let feed = VitalsFeed::new(Arc::new(selector), FeedSettings::default());
//! let subscription = feed.subscribe("patient-1", Arc::new(|s: &VitalsSample| println!("HR {}", s.heart_rate)));
//! # });
//! ```

pub mod backend;
pub mod config;
pub mod data;
pub mod error;
pub mod feed;
mod gate;
pub mod poller;
pub mod source;
pub mod store;

// Re-export main types for convenience
pub use backend::{Backend, BackendMode, BackendSelector, ServerAddress, SharedAddress};
pub use crate::config::Settings;
pub use data::{
    classify, ConnectionState, Connectivity, LocationRecord, PatientStatus, Severity, Thresholds,
    TrackedPatient, VitalsSample,
};
pub use error::{SelectorError, SourceError, StoreError};
pub use feed::{FeedSettings, SampleCallback, Subscription, VitalsFeed};
pub use poller::{LocationPoller, PollerHandle, PollerSettings};
pub use source::{LocationSource, VitalsSource};
