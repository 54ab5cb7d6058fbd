//! Fixed-cadence presence polling.
//!
//! Each cycle looks up every tracked patient in one batch through the
//! location source the [`BackendSelector`] currently names, turns the
//! answers into [`LocationRecord`]s and hands the complete set to the
//! caller's callback. Cycles never overlap: the next tick is scheduled only
//! after the previous callback has returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{BackendMode, BackendSelector};
use crate::data::duration::{format_duration, serde_str};
use crate::data::{ConnectionState, Connectivity, LocationRecord, TrackedPatient};
use crate::error::SourceError;
use crate::gate::DeliveryGate;
use crate::source::Observation;

/// Poller timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    /// Time between cycles.
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Upper bound for one batch lookup; a slower batch counts as failed.
    #[serde(with = "serde_str")]
    pub cycle_timeout: Duration,
    /// Upper bound for a connection test.
    #[serde(with = "serde_str")]
    pub probe_timeout: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            cycle_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// The last batch handed to a callback.
#[derive(Debug, Clone)]
struct Published {
    records: Vec<LocationRecord>,
    interval: Duration,
}

#[derive(Debug)]
struct PollerInner {
    selector: Arc<BackendSelector>,
    settings: PollerSettings,
    latest: Mutex<Option<Published>>,
    connection: watch::Sender<ConnectionState>,
}

impl PollerInner {
    fn set_connection(&self, state: ConnectionState) {
        self.connection.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Connection state: {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    /// `last_seen` of every patient in the last published batch.
    fn seen_before(&self) -> HashMap<String, DateTime<Utc>> {
        self.latest
            .lock()
            .iter()
            .flat_map(|published| published.records.iter())
            .filter_map(|r| r.last_seen.map(|seen| (r.patient_id.clone(), seen)))
            .collect()
    }

    /// Run one batch and build the records for it.
    async fn poll_once(
        &self,
        patients: &[TrackedPatient],
        last_seen: &mut HashMap<String, DateTime<Utc>>,
    ) -> Vec<LocationRecord> {
        let source = self.selector.location_source();
        let expected = patients.len();
        let fail_all = |e: SourceError| -> Vec<Result<Observation, SourceError>> {
            (0..expected).map(|_| Err(e.clone())).collect()
        };

        let results = match timeout(self.settings.cycle_timeout, source.lookup_batch(patients)).await {
            Ok(results) if results.len() == expected => results,
            Ok(results) => {
                warn!(
                    "{} answered {} entries for {} patients, discarding batch",
                    source.description(),
                    results.len(),
                    expected
                );
                fail_all(SourceError::Parse("batch size mismatch".to_string()))
            }
            Err(_) => {
                warn!(
                    "{} lookup exceeded {}",
                    source.description(),
                    format_duration(self.settings.cycle_timeout)
                );
                fail_all(SourceError::Timeout)
            }
        };

        let failures = results.iter().filter(|r| r.is_err()).count();
        if expected > 0 {
            self.set_connection(if failures == expected {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Connected
            });
        }

        let now = Utc::now();
        patients
            .iter()
            .zip(results)
            .map(|(patient, result)| match result {
                Ok(observation) => {
                    if observation.connectivity == Connectivity::InRange {
                        last_seen.insert(patient.id.clone(), now);
                    }
                    LocationRecord {
                        patient_id: patient.id.clone(),
                        name: patient.name.clone(),
                        rfid_mac: patient.rfid_mac.clone(),
                        last_seen: last_seen.get(&patient.id).copied(),
                        zone: observation.zone,
                        connectivity: observation.connectivity,
                        refreshed_at: now,
                    }
                }
                Err(e) => {
                    debug!("Location lookup for {} failed: {}", patient.name, e);
                    LocationRecord::unknown(patient, last_seen.get(&patient.id).copied(), now)
                }
            })
            .collect()
    }
}

async fn run_poller<F>(
    inner: Arc<PollerInner>,
    patients: Vec<TrackedPatient>,
    interval: Duration,
    mut on_update: F,
    gate: DeliveryGate,
) where
    F: FnMut(&[LocationRecord]) + Send + 'static,
{
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = inner.seen_before();

    loop {
        ticker.tick().await;
        if !gate.is_open() {
            break;
        }

        let records = inner.poll_once(&patients, &mut last_seen).await;
        let delivered = gate.deliver(|| {
            *inner.latest.lock() = Some(Published {
                records: records.clone(),
                interval,
            });
            on_update(&records);
        });
        if !delivered {
            break;
        }
    }
}

/// Presence poller.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use vitalwatch::backend::BackendSelector;
/// use vitalwatch::data::TrackedPatient;
/// use vitalwatch::poller::{LocationPoller, PollerSettings};
///
/// # async fn run(selector: Arc<BackendSelector>) {
/// let poller = LocationPoller::new(selector, PollerSettings::default());
/// let patients = vec![TrackedPatient::new("p1", "Robert Thompson", Some("AA:BB:CC:DD:EE:01"))];
///
/// let handle = poller.start(
///     |records| println!("{} locations", records.len()),
///     patients,
///     Duration::from_secs(1),
/// );
/// // ...
/// handle.stop();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocationPoller {
    inner: Arc<PollerInner>,
}

impl LocationPoller {
    pub fn new(selector: Arc<BackendSelector>, settings: PollerSettings) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(PollerInner {
                selector,
                settings,
                latest: Mutex::new(None),
                connection,
            }),
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.inner.settings
    }

    /// Start polling `patients` every `interval`.
    ///
    /// The first cycle runs one interval after this call. `on_update` gets
    /// one entry per patient, in the order given. Must be called from within
    /// a Tokio runtime.
    pub fn start<F>(&self, on_update: F, patients: Vec<TrackedPatient>, interval: Duration) -> PollerHandle
    where
        F: FnMut(&[LocationRecord]) + Send + 'static,
    {
        let interval = if interval.is_zero() {
            warn!("Polling interval must be positive, using 1ms");
            Duration::from_millis(1)
        } else {
            interval
        };

        info!(
            "Polling {} patients every {}",
            patients.len(),
            format_duration(interval)
        );

        let gate = DeliveryGate::new();
        let task = tokio::spawn(run_poller(
            self.inner.clone(),
            patients,
            interval,
            on_update,
            gate.clone(),
        ));

        PollerHandle { gate, task }
    }

    /// Probe the live beacon server, at `address` or the configured one.
    ///
    /// Bounded by `probe_timeout`. The connection badge shows `Testing`
    /// while the probe runs and the outcome afterwards.
    pub async fn test_connection(&self, address: Option<&str>) -> bool {
        self.inner.set_connection(ConnectionState::Testing);

        let source = self.inner.selector.backend_for(BackendMode::Live).locations;
        let reachable = timeout(self.inner.settings.probe_timeout, source.test_connection(address))
            .await
            .unwrap_or(false);

        self.inner.set_connection(if reachable {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        });
        info!(
            "Connection test {}: {}",
            address.map_or_else(|| self.inner.selector.server_address().to_string(), str::to_string),
            if reachable { "reachable" } else { "unreachable" }
        );
        reachable
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// The last published batch, with stale records degraded to `Unknown`.
    pub fn latest(&self) -> Vec<LocationRecord> {
        self.latest_at(Utc::now())
    }

    /// Like [`latest`](Self::latest), aged as of `now`.
    pub fn latest_at(&self, now: DateTime<Utc>) -> Vec<LocationRecord> {
        let Some(published) = self.inner.latest.lock().clone() else {
            return Vec::new();
        };

        published
            .records
            .into_iter()
            .map(|mut record| {
                record.connectivity = record.effective_connectivity(now, published.interval);
                record
            })
            .collect()
    }
}

/// Handle to a running poller. Dropping it stops the poller.
#[derive(Debug)]
pub struct PollerHandle {
    gate: DeliveryGate,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop polling.
    ///
    /// Idempotent, and allowed from inside the callback. Once this returns
    /// the callback is not running and will not be called again. A callback
    /// running on another thread blocks the calling thread until it returns.
    pub fn stop(&self) {
        if self.gate.close() {
            self.task.abort();
            info!("Location poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.gate.is_open() && !self.task.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, SharedAddress};
    use crate::source::{LocationSource, MockVitalsSource};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers batches from a script; once it runs out every patient is in range.
    #[derive(Debug, Default)]
    struct ScriptedLocations {
        batches: Mutex<VecDeque<Vec<Result<Observation, SourceError>>>>,
        delay: Option<Duration>,
        reachable: bool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedLocations {
        fn with_batches(batches: Vec<Vec<Result<Observation, SourceError>>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                reachable: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl LocationSource for ScriptedLocations {
        async fn lookup_batch(&self, patients: &[TrackedPatient]) -> Vec<Result<Observation, SourceError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.batches.lock().pop_front().unwrap_or_else(|| {
                patients
                    .iter()
                    .map(|_| Ok(Observation::new(Connectivity::InRange, Some("Room 101A".to_string()))))
                    .collect()
            })
        }

        async fn test_connection(&self, _address: Option<&str>) -> bool {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reachable
        }

        fn description(&self) -> &str {
            "scripted beacons"
        }
    }

    async fn poller_with(live: Arc<ScriptedLocations>, mock: Arc<ScriptedLocations>) -> (LocationPoller, Arc<BackendSelector>) {
        let vitals = Arc::new(MockVitalsSource::builder().build());
        let selector = Arc::new(
            BackendSelector::load(
                Arc::new(MemoryStore::new()),
                SharedAddress::default(),
                Backend::new(vitals.clone(), live),
                Backend::new(vitals, mock),
            )
            .await
            .unwrap(),
        );
        (LocationPoller::new(selector.clone(), PollerSettings::default()), selector)
    }

    fn patients(n: usize) -> Vec<TrackedPatient> {
        (1..=n)
            .map(|i| TrackedPatient::new(format!("p{i}"), format!("Patient {i}"), Some(&format!("AA:0{i}"))))
            .collect()
    }

    type Batches = Arc<Mutex<Vec<Vec<LocationRecord>>>>;

    fn collector() -> (Batches, impl FnMut(&[LocationRecord]) + Send + 'static) {
        let batches: Batches = Arc::default();
        let sink = batches.clone();
        (batches, move |records: &[LocationRecord]| sink.lock().push(records.to_vec()))
    }

    fn in_range() -> Result<Observation, SourceError> {
        Ok(Observation::new(Connectivity::InRange, Some("Dining Hall".to_string())))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failed_lookup_degrades_only_that_patient() {
        let mock = Arc::new(ScriptedLocations::with_batches(vec![vec![
            in_range(),
            in_range(),
            Err(SourceError::Connection("tag not answering".to_string())),
            in_range(),
            in_range(),
        ]]));
        let (poller, _) = poller_with(Arc::default(), mock).await;
        let (batches, on_update) = collector();

        let handle = poller.start(on_update, patients(5), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.stop();

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        let records = &batches[0];
        assert_eq!(records.len(), 5);
        assert_eq!(
            records.iter().filter(|r| r.connectivity == Connectivity::InRange).count(),
            4
        );
        assert_eq!(records[2].connectivity, Connectivity::Unknown);
        assert_eq!(records[2].patient_id, "p3");
        assert_eq!(poller.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_after_one_interval() {
        let mock = Arc::new(ScriptedLocations::with_batches(vec![]));
        let (poller, _) = poller_with(Arc::default(), mock.clone()).await;
        let (batches, on_update) = collector();

        let _handle = poller.start(on_update, patients(2), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(batches.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_final() {
        let mock = Arc::new(ScriptedLocations::with_batches(vec![]));
        let (poller, _) = poller_with(Arc::default(), mock).await;
        let (batches, on_update) = collector();

        let handle = poller.start(on_update, patients(1), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_inside_callback() {
        let mock = Arc::new(ScriptedLocations::with_batches(vec![]));
        let (poller, _) = poller_with(Arc::default(), mock).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<PollerHandle>>> = Arc::default();

        let on_update = {
            let calls = calls.clone();
            let slot = slot.clone();
            move |_: &[LocationRecord]| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = slot.lock().as_ref() {
                    handle.stop();
                }
            }
        };
        *slot.lock() = Some(poller.start(on_update, patients(1), Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_never_overlap() {
        let mock = Arc::new(ScriptedLocations {
            delay: Some(Duration::from_millis(2500)),
            reachable: true,
            ..ScriptedLocations::default()
        });
        let poller = LocationPoller::new(
            poller_with(Arc::default(), mock.clone()).await.1,
            PollerSettings {
                cycle_timeout: Duration::from_secs(10),
                ..PollerSettings::default()
            },
        );
        let (batches, on_update) = collector();

        let _handle = poller.start(on_update, patients(3), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(mock.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(batches.lock().len() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_batch_degrades_everyone() {
        let mock = Arc::new(ScriptedLocations {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedLocations::default()
        });
        let (poller, _) = poller_with(Arc::default(), mock).await;
        let (batches, on_update) = collector();

        let handle = poller.start(on_update, patients(3), Duration::from_secs(1));
        // one interval plus the 5s cycle timeout
        tokio::time::sleep(Duration::from_millis(6500)).await;
        handle.stop();

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].iter().all(|r| r.connectivity == Connectivity::Unknown));
        assert_eq!(poller.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_seen_carries_forward() {
        let mock = Arc::new(ScriptedLocations::with_batches(vec![
            vec![in_range()],
            vec![Ok(Observation::new(Connectivity::OutOfRange, None))],
            vec![Err(SourceError::Timeout)],
        ]));
        let (poller, _) = poller_with(Arc::default(), mock).await;
        let (batches, on_update) = collector();

        let handle = poller.start(on_update, patients(1), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        handle.stop();

        let batches = batches.lock();
        assert_eq!(batches.len(), 3);
        let seen = batches[0][0].last_seen;
        assert!(seen.is_some());
        assert_eq!(batches[1][0].connectivity, Connectivity::OutOfRange);
        assert_eq!(batches[1][0].last_seen, seen);
        assert_eq!(batches[2][0].connectivity, Connectivity::Unknown);
        assert_eq!(batches[2][0].last_seen, seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_degrades_stale_records() {
        let mock = Arc::new(ScriptedLocations::with_batches(vec![]));
        let (poller, _) = poller_with(Arc::default(), mock).await;
        assert!(poller.latest().is_empty());

        let (_, on_update) = collector();
        let handle = poller.start(on_update, patients(2), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.stop();

        let fresh = poller.latest();
        assert_eq!(fresh.len(), 2);
        assert!(fresh.iter().all(|r| r.connectivity == Connectivity::InRange));

        let later = Utc::now() + chrono::Duration::seconds(10);
        assert!(poller
            .latest_at(later)
            .iter()
            .all(|r| r.connectivity == Connectivity::Unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_cycle_follows_backend_switch() {
        let live = Arc::new(ScriptedLocations::with_batches(vec![]));
        let mock = Arc::new(ScriptedLocations::with_batches(vec![]));
        let (poller, selector) = poller_with(live.clone(), mock.clone()).await;
        let (_, on_update) = collector();

        let _handle = poller.start(on_update, patients(1), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        selector.set_mode(BackendMode::Live).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert_eq!(live.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_probe_updates_badge() {
        let live = Arc::new(ScriptedLocations::with_batches(vec![]));
        let (poller, _) = poller_with(live, Arc::default()).await;
        let mut badge = poller.watch_connection();

        assert!(poller.test_connection(Some("10.0.0.5:5000")).await);
        assert_eq!(*badge.borrow_and_update(), ConnectionState::Connected);

        let unreachable = Arc::new(ScriptedLocations::default());
        let (poller, _) = poller_with(unreachable, Arc::default()).await;
        assert!(!poller.test_connection(None).await);
        assert_eq!(poller.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out() {
        let live = Arc::new(ScriptedLocations {
            delay: Some(Duration::from_secs(60)),
            reachable: true,
            ..ScriptedLocations::default()
        });
        let (poller, _) = poller_with(live, Arc::default()).await;

        let started = Instant::now();
        assert!(!poller.test_connection(None).await);
        assert!(started.elapsed() <= Duration::from_secs(4));
    }
}
