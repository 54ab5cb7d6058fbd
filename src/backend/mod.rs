//! Runtime switch between the live and the mock backend.
//!
//! The [`BackendSelector`] owns the only piece of shared mutable state in
//! the crate: the current [`BackendMode`]. The vitals feed and the location
//! poller ask it for their source before every operation, so a committed
//! switch is seen by the very next connection attempt or poll.
//!
//! Switching does **not** restart running subscriptions or pollers. A feed
//! that is happily streaming keeps its current connection until it drops;
//! callers that want the switch to take effect immediately must unsubscribe
//! and resubscribe (or stop and restart their poller) after `set_mode`.

mod address;

pub use address::{ServerAddress, SharedAddress, DEFAULT_SERVER_ADDRESS};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SelectorError;
use crate::source::{LocationSource, VitalsSource};
use crate::store::{KeyValueStore, MODE_KEY, SERVER_ADDRESS_KEY};

/// Which backend the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Live,
    /// Default on first start, so a fresh install works without a server.
    #[default]
    Mock,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Live => "live",
            BackendMode::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(BackendMode::Live),
            "mock" => Ok(BackendMode::Mock),
            _ => Err(SelectorError::InvalidMode(s.to_string())),
        }
    }
}

/// A matched pair of sources for one mode.
#[derive(Debug, Clone)]
pub struct Backend {
    pub vitals: Arc<dyn VitalsSource>,
    pub locations: Arc<dyn LocationSource>,
}

impl Backend {
    pub fn new(vitals: Arc<dyn VitalsSource>, locations: Arc<dyn LocationSource>) -> Self {
        Self { vitals, locations }
    }
}

/// Process-wide backend mode, persisted in a [`KeyValueStore`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use vitalwatch::backend::{Backend, BackendMode, BackendSelector, SharedAddress};
/// use vitalwatch::source::{MockLocationSource, MockVitalsSource, RandomNoise};
/// use vitalwatch::store::MemoryStore;
///
/// # tokio_test::block_on(async {
/// let mock = Backend::new(
///     Arc::new(MockVitalsSource::builder().build()),
///     Arc::new(MockLocationSource::new(vec![], RandomNoise::seeded(1))),
/// );
/// let selector = BackendSelector::load(
///     Arc::new(MemoryStore::new()),
///     SharedAddress::default(),
///     mock.clone(),
///     mock,
/// )
/// .await
/// .unwrap();
///
/// assert_eq!(selector.mode(), BackendMode::Mock);
/// # });
/// ```
#[derive(Debug)]
pub struct BackendSelector {
    store: Arc<dyn KeyValueStore>,
    mode: RwLock<BackendMode>,
    address: SharedAddress,
    /// Held from persist to commit so the store and memory agree on the last write.
    writes: tokio::sync::Mutex<()>,
    live: Backend,
    mock: Backend,
}

impl BackendSelector {
    /// Load the persisted mode and server address.
    ///
    /// With nothing persisted the mode is [`BackendMode::Mock`] and the
    /// address stays whatever `address` already holds. A store error or an
    /// unparsable persisted value is returned as an error.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        address: SharedAddress,
        live: Backend,
        mock: Backend,
    ) -> Result<Self, SelectorError> {
        let mode = match store.get(MODE_KEY).await? {
            Some(value) => value.parse()?,
            None => BackendMode::default(),
        };

        if let Some(value) = store.get(SERVER_ADDRESS_KEY).await? {
            address.set(ServerAddress::parse(&value)?);
        }

        info!("Backend mode: {} (server {})", mode, address.get());

        Ok(Self {
            store,
            mode: RwLock::new(mode),
            address,
            writes: tokio::sync::Mutex::new(()),
            live,
            mock,
        })
    }

    /// The last committed mode.
    pub fn mode(&self) -> BackendMode {
        *self.mode.read()
    }

    /// Persist and commit a new mode.
    ///
    /// Returns once the store has accepted the value; on error the previous
    /// mode stays in effect. Concurrent calls commit in the order they
    /// persist. Running feeds and pollers are not restarted.
    pub async fn set_mode(&self, mode: BackendMode) -> Result<(), SelectorError> {
        let _write = self.writes.lock().await;
        self.store.set(MODE_KEY, mode.as_str()).await?;
        let previous = std::mem::replace(&mut *self.mode.write(), mode);
        if previous != mode {
            info!("Backend mode switched: {} -> {}", previous, mode);
        }
        Ok(())
    }

    /// The live server address currently in effect.
    pub fn server_address(&self) -> ServerAddress {
        self.address.get()
    }

    /// Validate, persist and commit a new live server address.
    ///
    /// Probe it first with
    /// [`LocationPoller::test_connection`](crate::poller::LocationPoller::test_connection)
    /// if the caller wants to avoid committing an unreachable address.
    pub async fn set_server_address(&self, address: &str) -> Result<ServerAddress, SelectorError> {
        let parsed = ServerAddress::parse(address)?;
        let _write = self.writes.lock().await;
        self.store.set(SERVER_ADDRESS_KEY, &parsed.to_string()).await?;
        self.address.set(parsed.clone());
        info!("Live server address set to {}", parsed);
        Ok(parsed)
    }

    /// Both sources for the current mode, read under one lock.
    pub fn backend(&self) -> Backend {
        self.backend_for(*self.mode.read())
    }

    /// The sources for a given mode, whichever mode is committed.
    pub fn backend_for(&self, mode: BackendMode) -> Backend {
        match mode {
            BackendMode::Live => self.live.clone(),
            BackendMode::Mock => self.mock.clone(),
        }
    }

    pub fn vitals_source(&self) -> Arc<dyn VitalsSource> {
        self.backend().vitals
    }

    pub fn location_source(&self) -> Arc<dyn LocationSource> {
        self.backend().locations
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::source::{FixedNoise, MockLocationSource, MockVitalsSource};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    pub(crate) fn mock_backend(label: &str) -> Backend {
        Backend::new(
            Arc::new(MockVitalsSource::builder().build()),
            Arc::new(MockLocationSource::new(
                vec![label.to_string()],
                FixedNoise::new(vec![0.0]),
            )),
        )
    }

    async fn selector(store: Arc<dyn KeyValueStore>) -> Result<BackendSelector, SelectorError> {
        BackendSelector::load(
            store,
            SharedAddress::default(),
            mock_backend("live"),
            mock_backend("mock"),
        )
        .await
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk unavailable")))
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk unavailable")))
        }
    }

    #[tokio::test]
    async fn test_defaults_to_mock_when_nothing_persisted() {
        let s = selector(Arc::new(MemoryStore::new())).await.unwrap();
        assert_eq!(s.mode(), BackendMode::Mock);
        assert_eq!(s.server_address().to_string(), DEFAULT_SERVER_ADDRESS);
    }

    #[tokio::test]
    async fn test_mode_survives_reload() {
        let store = Arc::new(MemoryStore::new());

        let s = selector(store.clone()).await.unwrap();
        s.set_mode(BackendMode::Live).await.unwrap();
        assert_eq!(s.mode(), BackendMode::Live);
        drop(s);

        let reloaded = selector(store).await.unwrap();
        assert_eq!(reloaded.mode(), BackendMode::Live);
    }

    #[tokio::test]
    async fn test_invalid_persisted_mode_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.set(MODE_KEY, "firebase").await.unwrap();

        let err = selector(store).await.unwrap_err();
        assert!(matches!(err, SelectorError::InvalidMode(_)));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_load() {
        let err = selector(Arc::new(BrokenStore)).await.unwrap_err();
        assert!(matches!(err, SelectorError::Store(_)));
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_previous_mode() {
        let s = BackendSelector {
            store: Arc::new(BrokenStore),
            mode: RwLock::new(BackendMode::Mock),
            address: SharedAddress::default(),
            writes: tokio::sync::Mutex::new(()),
            live: mock_backend("live"),
            mock: mock_backend("mock"),
        };

        assert!(s.set_mode(BackendMode::Live).await.is_err());
        assert_eq!(s.mode(), BackendMode::Mock);
    }

    /// Acknowledges writes of `slow_value` only after `delay`.
    #[derive(Debug)]
    struct SlowAckStore {
        inner: MemoryStore,
        slow_value: &'static str,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl KeyValueStore for SlowAckStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set(key, value).await?;
            if value == self.slow_value {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }
    }

    fn slow_ack_store(slow_value: &'static str) -> Arc<SlowAckStore> {
        Arc::new(SlowAckStore {
            inner: MemoryStore::new(),
            slow_value,
            delay: std::time::Duration::from_millis(100),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_mode_switches_agree_with_store() {
        let store = slow_ack_store("live");
        let s = selector(store.clone()).await.unwrap();

        let (first, second) = tokio::join!(s.set_mode(BackendMode::Live), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            s.set_mode(BackendMode::Mock).await
        });
        first.unwrap();
        second.unwrap();

        assert_eq!(s.mode(), BackendMode::Mock);
        assert_eq!(store.get(MODE_KEY).await.unwrap().as_deref(), Some("mock"));
        assert_eq!(selector(store).await.unwrap().mode(), s.mode());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_address_changes_agree_with_store() {
        let store = slow_ack_store("10.0.0.1:5000");
        let s = selector(store.clone()).await.unwrap();

        let (first, second) = tokio::join!(s.set_server_address("10.0.0.1:5000"), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            s.set_server_address("10.0.0.2:5000").await
        });
        first.unwrap();
        second.unwrap();

        assert_eq!(s.server_address().to_string(), "10.0.0.2:5000");
        assert_eq!(
            selector(store).await.unwrap().server_address().to_string(),
            "10.0.0.2:5000"
        );
    }

    #[tokio::test]
    async fn test_backend_follows_mode() {
        async fn zone(backend: Backend) -> Option<String> {
            let patients = [crate::data::TrackedPatient::new("p1", "A", Some("AA"))];
            let batch = backend.locations.lookup_batch(&patients).await;
            batch[0].as_ref().ok().and_then(|o| o.zone.clone())
        }

        let s = selector(Arc::new(MemoryStore::new())).await.unwrap();
        assert_eq!(zone(s.backend()).await.as_deref(), Some("mock"));

        s.set_mode(BackendMode::Live).await.unwrap();
        assert_eq!(zone(s.backend()).await.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn test_server_address_is_validated_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let s = selector(store.clone()).await.unwrap();

        assert!(matches!(
            s.set_server_address("not an address").await,
            Err(SelectorError::InvalidAddress(_))
        ));
        assert_eq!(s.server_address().to_string(), DEFAULT_SERVER_ADDRESS);

        s.set_server_address("10.1.1.20:5000").await.unwrap();
        let reloaded = selector(store).await.unwrap();
        assert_eq!(reloaded.server_address().to_string(), "10.1.1.20:5000");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("LIVE".parse::<BackendMode>().unwrap(), BackendMode::Live);
        assert_eq!(" mock ".parse::<BackendMode>().unwrap(), BackendMode::Mock);
        assert!("remote".parse::<BackendMode>().is_err());
    }
}
