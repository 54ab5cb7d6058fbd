//! Durable key-value storage for settings that must survive a restart.
//!
//! Only the backend selector talks to the store; other components read the
//! backend mode and server address through the selector.

mod file;

pub use file::JsonFileStore;

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Key under which the backend mode is persisted.
pub const MODE_KEY: &str = "backend_mode";
/// Key under which the live beacon server address is persisted.
pub const SERVER_ADDRESS_KEY: &str = "beacon_server_address";

/// Trait for durable string key-value storage.
///
/// `set` must only return `Ok` once the value is durable.
#[async_trait]
pub trait KeyValueStore: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-memory store. Not durable across processes; shared clones of an
/// `Arc<MemoryStore>` stand in for a restart in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
