//! In-process key-value store backed by DashMap for lock-free concurrent access.
//! Used when no Redis is configured, and in tests.

use crate::kv::{Increment, KvStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;
use variant_core::types::MetricsBucket;
use variant_core::{ExperimentError, ExperimentResult};

/// How often a connected store drops expired values.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn new(value: &str, ttl_secs: Option<u64>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl_secs.map(|s| Instant::now() + Duration::from_secs(s)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct Tables {
    values: DashMap<String, ValueEntry>,
    sets: DashMap<String, HashSet<String>>,
    counters: DashMap<String, MetricsBucket>,
    /// Set membership created by `insert_new`, keyed by the value's key.
    registrations: DashMap<String, (String, String)>,
}

impl Tables {
    fn register(&self, key: &str, registry: &str, member: &str) {
        self.sets
            .entry(registry.to_string())
            .or_default()
            .insert(member.to_string());
        self.registrations
            .insert(key.to_string(), (registry.to_string(), member.to_string()));
    }

    /// Drops expired values and the set members registered with them.
    fn evict_expired(&self) -> usize {
        let mut expired = Vec::new();
        self.values.retain(|key, entry| {
            if entry.is_expired() {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });
        for key in &expired {
            if let Some((_, (registry, member))) = self.registrations.remove(key) {
                if let Some(mut members) = self.sets.get_mut(&registry) {
                    members.remove(&member);
                }
            }
        }
        expired.len()
    }
}

/// DashMap-backed store. Starts connected; `disconnect` simulates an
/// unreachable backend until `connect` is called again. While connected
/// through `connect`, a background task sweeps expired values.
pub struct MemoryKv {
    tables: Arc<Tables>,
    connected: AtomicBool,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            tables: Arc::new(Tables::default()),
            connected: AtomicBool::new(true),
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    fn ensure_connected(&self) -> ExperimentResult<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ExperimentError::NotConnected("memory"))
        }
    }

    /// Remove expired entries now. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        self.tables.evict_expired()
    }

    pub fn len(&self) -> usize {
        self.tables.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values.is_empty()
    }

    fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let tables = self.tables.clone();
        let period = self.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = tables.evict_expired();
                if evicted > 0 {
                    debug!(evicted, "Memory store eviction complete");
                }
            }
        }));
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryKv {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> ExperimentResult<()> {
        self.connected.store(true, Ordering::Release);
        self.start_sweeper();
        Ok(())
    }

    async fn disconnect(&self) -> ExperimentResult<()> {
        self.connected.store(false, Ordering::Release);
        self.stop_sweeper();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn get(&self, key: &str) -> ExperimentResult<Option<String>> {
        self.ensure_connected()?;
        let Some(entry) = self.tables.values.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.tables.values.remove_if(key, |_, e| e.is_expired());
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> ExperimentResult<bool> {
        self.ensure_connected()?;
        match self.tables.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = (!occupied.get().is_expired()).then(|| occupied.get().value.as_str());
                if current != expected {
                    return Ok(false);
                }
                occupied.insert(ValueEntry::new(value, ttl_secs));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(ValueEntry::new(value, ttl_secs));
                Ok(true)
            }
        }
    }

    async fn insert_new(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
        registry: &str,
        member: &str,
    ) -> ExperimentResult<bool> {
        self.ensure_connected()?;
        // The value-map guard is held while registering so both land together.
        match self.tables.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return Ok(false);
                }
                occupied.insert(ValueEntry::new(value, ttl_secs));
                self.tables.register(key, registry, member);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ValueEntry::new(value, ttl_secs));
                self.tables.register(key, registry, member);
                Ok(true)
            }
        }
    }

    async fn set_contains(&self, set: &str, member: &str) -> ExperimentResult<bool> {
        self.ensure_connected()?;
        Ok(self
            .tables
            .sets
            .get(set)
            .is_some_and(|members| members.contains(member)))
    }

    /// Increments sharing a key are applied under one bucket guard, so
    /// readers see all of them or none.
    async fn increment_batch(&self, increments: &[Increment]) -> ExperimentResult<()> {
        self.ensure_connected()?;
        for run in increments.chunk_by(|a, b| a.key == b.key) {
            let mut bucket = self.tables.counters.entry(run[0].key.clone()).or_default();
            for inc in run {
                let counter = bucket.entry(inc.field.clone()).or_default();
                *counter = counter.add(inc.by);
            }
        }
        Ok(())
    }

    async fn get_counters(&self, key: &str) -> ExperimentResult<MetricsBucket> {
        self.ensure_connected()?;
        Ok(self
            .tables
            .counters
            .get(key)
            .map(|bucket| bucket.clone())
            .unwrap_or_default())
    }
}
