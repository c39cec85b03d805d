use crate::public::checkpoint::CachedSimulationEngine;
use crate::public::config::SimulationConfiguration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Somewhere to keep snapshots between simulations.
pub trait CachedEngineStore {
    fn save(&mut self, engine: Arc<CachedSimulationEngine>, configuration: &SimulationConfiguration);

    /// Every stored snapshot for the configuration, oldest first.
    fn cached_engines(
        &self,
        configuration: &SimulationConfiguration,
    ) -> Vec<Arc<CachedSimulationEngine>>;

    fn capacity(&self) -> usize;

    /// Records that a snapshot was chosen for reuse.
    fn register_used(&mut self, _engine: &Arc<CachedSimulationEngine>) {}

    /// Drops every snapshot stored for the configuration.
    fn clear(&mut self, configuration: &SimulationConfiguration);
}

/// Lets several speculative continuations share one store.
impl<S: CachedEngineStore> CachedEngineStore for Arc<Mutex<S>> {
    fn save(&mut self, engine: Arc<CachedSimulationEngine>, configuration: &SimulationConfiguration) {
        self.lock().save(engine, configuration);
    }

    fn cached_engines(
        &self,
        configuration: &SimulationConfiguration,
    ) -> Vec<Arc<CachedSimulationEngine>> {
        self.lock().cached_engines(configuration)
    }

    fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    fn register_used(&mut self, engine: &Arc<CachedSimulationEngine>) {
        self.lock().register_used(engine);
    }

    fn clear(&mut self, configuration: &SimulationConfiguration) {
        self.lock().clear(configuration);
    }
}

/// Which snapshot to drop when a full store receives a new one.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub enum EvictionPolicy {
    #[default]
    LeastRecentlyUsed,
    Oldest,
}

struct StoredEngine {
    configuration: SimulationConfiguration,
    engine: Arc<CachedSimulationEngine>,
    saved_at: u64,
    used_at: u64,
}

/// A bounded in-memory store.
///
/// The capacity is shared by all configurations.
pub struct InMemoryCachedEngineStore {
    capacity: usize,
    policy: EvictionPolicy,
    entries: Vec<StoredEngine>,
    clock: u64,
}

impl InMemoryCachedEngineStore {
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, EvictionPolicy::default())
    }

    pub fn with_policy(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            capacity,
            policy,
            entries: Vec::with_capacity(capacity),
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict(&mut self) {
        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| match self.policy {
                EvictionPolicy::LeastRecentlyUsed => entry.used_at,
                EvictionPolicy::Oldest => entry.saved_at,
            })
            .map(|(index, _)| index);
        if let Some(index) = victim {
            let evicted = self.entries.remove(index);
            tracing::debug!(ends_at = %evicted.engine.ends_at(), "evicted snapshot");
        }
    }
}

impl CachedEngineStore for InMemoryCachedEngineStore {
    fn save(&mut self, engine: Arc<CachedSimulationEngine>, configuration: &SimulationConfiguration) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.evict();
        }
        let now = self.tick();
        self.entries.push(StoredEngine {
            configuration: configuration.clone(),
            engine,
            saved_at: now,
            used_at: now,
        });
    }

    fn cached_engines(
        &self,
        configuration: &SimulationConfiguration,
    ) -> Vec<Arc<CachedSimulationEngine>> {
        self.entries
            .iter()
            .filter(|entry| &entry.configuration == configuration)
            .map(|entry| entry.engine.clone())
            .collect()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn register_used(&mut self, engine: &Arc<CachedSimulationEngine>) {
        let now = self.tick();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| Arc::ptr_eq(&entry.engine, engine))
        {
            entry.used_at = now;
        }
    }

    fn clear(&mut self, configuration: &SimulationConfiguration) {
        self.entries
            .retain(|entry| &entry.configuration != configuration);
    }
}
