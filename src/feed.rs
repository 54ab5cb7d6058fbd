//! Per-patient vitals subscriptions.
//!
//! The [`VitalsFeed`] runs one background task per subscribed patient. The
//! task asks the [`BackendSelector`] for the current vitals source, connects,
//! and forwards every accepted sample to the patient's subscribers:
//!
//! ```text
//!  BackendSelector ──▶ VitalsSource::connect() ──▶ SampleStream (latest value)
//!                                                       │
//!                                                       ▼
//!                                    ordering check ─▶ VitalsHistory
//!                                                       │
//!                        ┌──────────────────────────────┤
//!                        ▼                              ▼
//!            Thresholds::assess() ─▶ watch_status()   callbacks
//! ```
//!
//! ## Failure handling
//!
//! When no sample arrives within the offline window the patient is reported
//! as [`PatientStatus::Offline`]. A stream that ends (or a connect that
//! fails) is retried after `retry_delay`, against whatever backend the
//! selector names at that moment. Subscribers stay registered across
//! reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::backend::BackendSelector;
use crate::data::duration::{format_duration, serde_opt, serde_str};
use crate::data::history::DEFAULT_HISTORY_LEN;
use crate::data::{PatientStatus, Thresholds, VitalsHistory, VitalsSample};
use crate::error::SourceError;
use crate::gate::DeliveryGate;
use crate::source::SampleStream;

/// Callback invoked with every accepted sample.
///
/// Identity is the `Arc` allocation: subscribing a clone of the same `Arc`
/// twice for one patient yields a single registration.
///
/// Callbacks run on the feed's tasks and should return quickly. A callback
/// must not unsubscribe another callback that may itself be waiting to
/// unsubscribe this one: each waits for the other's delivery to finish.
pub type SampleCallback = Arc<dyn Fn(&VitalsSample) + Send + Sync>;

/// Feed timing and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// Expected time between samples.
    #[serde(with = "serde_str")]
    pub sample_interval: Duration,
    /// How long without a sample before a patient is offline
    /// (default: two sample intervals).
    #[serde(with = "serde_opt", skip_serializing_if = "Option::is_none")]
    pub offline_after: Option<Duration>,
    /// Pause before reconnecting a stream that ended or failed to open.
    #[serde(with = "serde_str")]
    pub retry_delay: Duration,
    /// Accepted samples kept per patient.
    pub history_len: usize,
    #[serde(skip)]
    pub thresholds: Thresholds,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            offline_after: None,
            retry_delay: Duration::from_secs(5),
            history_len: DEFAULT_HISTORY_LEN,
            thresholds: Thresholds::default(),
        }
    }
}

impl FeedSettings {
    /// Effective offline window.
    pub fn offline_window(&self) -> Duration {
        self.offline_after
            .unwrap_or_else(|| self.sample_interval.saturating_mul(2))
    }
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    callback: SampleCallback,
    gate: DeliveryGate,
}

/// Everything the feed knows about one patient.
struct PatientFeed {
    subscribers: Vec<Subscriber>,
    history: VitalsHistory,
    /// When the latest accepted sample arrived.
    received_at: Option<Instant>,
    status: watch::Sender<PatientStatus>,
    pump: Option<JoinHandle<()>>,
    /// Offline timer left behind when the pump stops.
    expiry: Option<JoinHandle<()>>,
}

impl PatientFeed {
    fn new(history_len: usize) -> Self {
        let (status, _) = watch::channel(PatientStatus::Offline);
        Self {
            subscribers: Vec::new(),
            history: VitalsHistory::with_capacity(history_len),
            received_at: None,
            status,
            pump: None,
            expiry: None,
        }
    }

    fn assess(&self, settings: &FeedSettings) -> PatientStatus {
        let age = self
            .received_at
            .map_or(Duration::MAX, |received| received.elapsed());
        settings
            .thresholds
            .assess(self.history.latest(), age, settings.offline_window())
    }

    /// Re-derive the status and publish it if it changed.
    fn refresh(&self, patient_id: &str, settings: &FeedSettings) {
        let status = self.assess(settings);
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!("Patient {}: {} -> {}", patient_id, current, status);
            *current = status;
            true
        });
    }
}

struct FeedInner {
    selector: Arc<BackendSelector>,
    settings: FeedSettings,
    patients: Mutex<HashMap<String, PatientFeed>>,
    next_id: AtomicU64,
}

impl FeedInner {
    /// Record a sample and deliver it, unless it is older than the latest one.
    fn ingest(&self, patient_id: &str, sample: VitalsSample) {
        let subscribers = {
            let mut patients = self.patients.lock();
            let Some(feed) = patients.get_mut(patient_id) else {
                return;
            };

            if let Some(latest) = feed.history.latest() {
                if sample.timestamp < latest.timestamp {
                    debug!(
                        "Dropping out-of-order sample for {} ({} < {})",
                        patient_id, sample.timestamp, latest.timestamp
                    );
                    return;
                }
            }

            feed.history.record(sample.clone());
            feed.received_at = Some(Instant::now());
            feed.refresh(patient_id, &self.settings);
            feed.subscribers.clone()
        };

        for subscriber in &subscribers {
            subscriber.gate.deliver(|| (subscriber.callback)(&sample));
        }
    }

    fn refresh(&self, patient_id: &str) {
        if let Some(feed) = self.patients.lock().get(patient_id) {
            feed.refresh(patient_id, &self.settings);
        }
    }

    /// When the latest sample stops being current.
    fn offline_deadline(&self, patient_id: &str) -> Option<Instant> {
        let window = self.settings.offline_window();
        self.patients
            .lock()
            .get(patient_id)
            .and_then(|feed| feed.received_at)
            .and_then(|received| received.checked_add(window))
    }

    /// Drop a subscriber. The last one out stops the stream; status
    /// watchers still see the patient go offline when the sample expires.
    fn remove(self: &Arc<Self>, patient_id: &str, id: u64) {
        let mut patients = self.patients.lock();
        let Some(feed) = patients.get_mut(patient_id) else {
            return;
        };

        feed.subscribers.retain(|s| s.id != id);
        if !feed.subscribers.is_empty() {
            return;
        }
        let Some(pump) = feed.pump.take() else {
            return;
        };
        debug!("Last subscriber for {} left, stopping stream", patient_id);
        pump.abort();

        let deadline = feed
            .received_at
            .and_then(|received| received.checked_add(self.settings.offline_window()));
        match (deadline, tokio::runtime::Handle::try_current()) {
            (Some(deadline), Ok(runtime)) if deadline > Instant::now() => {
                feed.expiry = Some(runtime.spawn(expire_status(
                    Arc::downgrade(self),
                    patient_id.to_string(),
                    deadline,
                )));
            }
            _ => feed.refresh(patient_id, &self.settings),
        }
    }

    /// Follow one connected stream until it ends.
    async fn follow(&self, patient_id: &str, mut stream: SampleStream) {
        loop {
            let changed = match self.offline_deadline(patient_id) {
                Some(deadline) if deadline > Instant::now() => {
                    match timeout_at(deadline, stream.changed()).await {
                        Ok(changed) => changed,
                        Err(_) => {
                            debug!("No vitals from {} within the offline window", patient_id);
                            self.refresh(patient_id);
                            continue;
                        }
                    }
                }
                _ => stream.changed().await,
            };

            if changed.is_err() {
                return;
            }

            let sample = stream.borrow_and_update().clone();
            if let Some(sample) = sample {
                self.ingest(patient_id, sample);
            }
        }
    }

    /// Sleep until the next connection attempt, going offline on the way if due.
    async fn wait_retry(&self, patient_id: &str) {
        let retry_at = Instant::now() + self.settings.retry_delay;
        if let Some(deadline) = self
            .offline_deadline(patient_id)
            .filter(|deadline| *deadline < retry_at)
        {
            sleep_until(deadline).await;
            self.refresh(patient_id);
        }
        sleep_until(retry_at).await;
    }
}

/// Publish the offline transition for a patient nobody is streaming.
async fn expire_status(inner: Weak<FeedInner>, patient_id: String, deadline: Instant) {
    sleep_until(deadline).await;
    if let Some(inner) = inner.upgrade() {
        inner.refresh(&patient_id);
    }
}

/// Connect, follow and reconnect for one patient, forever.
async fn run_pump(inner: Arc<FeedInner>, patient_id: String) {
    let retry_delay = format_duration(inner.settings.retry_delay);

    loop {
        let source = inner.selector.vitals_source();
        match source.connect(&patient_id).await {
            Ok(stream) => {
                info!("Vitals for {} connected ({})", patient_id, source.description());
                inner.follow(&patient_id, stream).await;
                warn!(
                    "Vitals stream for {} ended, reconnecting in {}",
                    patient_id, retry_delay
                );
            }
            Err(e) => {
                warn!(
                    "Vitals connect for {} failed: {}, retrying in {}",
                    patient_id, e, retry_delay
                );
            }
        }
        inner.wait_retry(&patient_id).await;
    }
}

/// Vitals subscriptions for any number of patients.
///
/// Must be used from within a Tokio runtime: the first subscription for a
/// patient spawns its stream task.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use vitalwatch::backend::BackendSelector;
/// use vitalwatch::data::VitalsSample;
/// use vitalwatch::feed::{FeedSettings, SampleCallback, VitalsFeed};
///
/// # async fn run(selector: Arc<BackendSelector>) {
/// let feed = VitalsFeed::new(selector, FeedSettings::default());
/// let print: SampleCallback = Arc::new(|sample: &VitalsSample| println!("HR {}", sample.heart_rate));
///
/// let subscription = feed.subscribe("patient-1", print);
/// // ...
/// subscription.unsubscribe();
/// # }
/// ```
pub struct VitalsFeed {
    inner: Arc<FeedInner>,
}

impl VitalsFeed {
    pub fn new(selector: Arc<BackendSelector>, settings: FeedSettings) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                selector,
                settings,
                patients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.inner.settings
    }

    /// Register `callback` for every accepted sample of `patient_id`.
    ///
    /// Subscribing the same callback again returns a handle to the existing
    /// registration. Dropping the handle does not unsubscribe.
    pub fn subscribe(&self, patient_id: &str, callback: SampleCallback) -> Subscription {
        let mut patients = self.inner.patients.lock();
        let feed = patients
            .entry(patient_id.to_string())
            .or_insert_with(|| PatientFeed::new(self.inner.settings.history_len));

        let existing = feed
            .subscribers
            .iter()
            .find(|s| Arc::ptr_eq(&s.callback, &callback))
            .cloned();
        let subscriber = match existing {
            Some(subscriber) => subscriber,
            None => {
                let subscriber = Subscriber {
                    id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                    callback,
                    gate: DeliveryGate::new(),
                };
                feed.subscribers.push(subscriber.clone());
                subscriber
            }
        };

        if feed.pump.as_ref().map_or(true, JoinHandle::is_finished) {
            debug!("Starting vitals stream for {}", patient_id);
            if let Some(expiry) = feed.expiry.take() {
                expiry.abort();
            }
            feed.pump = Some(tokio::spawn(run_pump(
                self.inner.clone(),
                patient_id.to_string(),
            )));
        }

        Subscription {
            feed: Arc::downgrade(&self.inner),
            patient_id: patient_id.to_string(),
            id: subscriber.id,
            gate: subscriber.gate,
        }
    }

    /// Current status, aged against the offline window at the time of the call.
    pub fn status(&self, patient_id: &str) -> PatientStatus {
        self.inner
            .patients
            .lock()
            .get(patient_id)
            .map_or(PatientStatus::Offline, |feed| feed.assess(&self.inner.settings))
    }

    /// Status changes for a patient. A value is published only on change.
    pub fn watch_status(&self, patient_id: &str) -> watch::Receiver<PatientStatus> {
        let mut patients = self.inner.patients.lock();
        let feed = patients
            .entry(patient_id.to_string())
            .or_insert_with(|| PatientFeed::new(self.inner.settings.history_len));
        feed.refresh(patient_id, &self.inner.settings);
        feed.status.subscribe()
    }

    pub fn latest(&self, patient_id: &str) -> Option<VitalsSample> {
        self.inner
            .patients
            .lock()
            .get(patient_id)
            .and_then(|feed| feed.history.latest().cloned())
    }

    /// Accepted samples, newest first.
    pub fn history(&self, patient_id: &str) -> Vec<VitalsSample> {
        self.inner
            .patients
            .lock()
            .get(patient_id)
            .map(|feed| feed.history.recent(usize::MAX))
            .unwrap_or_default()
    }

    /// Heart rate trend (0-7) from the retained history.
    pub fn heart_rate_trend(&self, patient_id: &str) -> Vec<u8> {
        self.inner
            .patients
            .lock()
            .get(patient_id)
            .map(|feed| feed.history.heart_rate_sparkline())
            .unwrap_or_default()
    }

    /// Past readings from the current backend, newest first.
    pub async fn load_history(
        &self,
        patient_id: &str,
        limit: usize,
    ) -> Result<Vec<VitalsSample>, SourceError> {
        self.inner
            .selector
            .vitals_source()
            .history(patient_id, limit)
            .await
    }

    /// Patients the feed has state for, sorted.
    pub fn patients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.patients.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for VitalsFeed {
    fn drop(&mut self) {
        for feed in self.inner.patients.lock().values_mut() {
            for task in [feed.pump.take(), feed.expiry.take()].into_iter().flatten() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for VitalsFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VitalsFeed")
            .field("settings", &self.inner.settings)
            .field("patients", &self.patients())
            .finish()
    }
}

/// Handle to one registration.
#[derive(Clone)]
pub struct Subscription {
    feed: Weak<FeedInner>,
    patient_id: String,
    id: u64,
    gate: DeliveryGate,
}

impl Subscription {
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Stop deliveries to this callback.
    ///
    /// Idempotent. Once this returns the callback is not running and will
    /// not be called again; calling it from inside the callback is allowed.
    ///
    /// If the callback is running on another thread this blocks the calling
    /// thread until it returns, Tokio worker threads included.
    pub fn unsubscribe(&self) {
        if !self.gate.close() {
            return;
        }
        if let Some(inner) = self.feed.upgrade() {
            inner.remove(&self.patient_id, self.id);
        }
        debug!("Unsubscribed {} from {}", self.id, self.patient_id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("patient_id", &self.patient_id)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
