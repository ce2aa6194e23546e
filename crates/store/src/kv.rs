//! Key-value abstraction the metrics and session stores are written against.

use async_trait::async_trait;
use variant_core::types::{MetricValue, MetricsBucket};
use variant_core::ExperimentResult;

/// One hash-field increment inside a pipelined batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Increment {
    pub key: String,
    pub field: String,
    pub by: MetricValue,
}

/// Concurrent-safe storage primitives.
///
/// Counter increments are atomic at the storage layer; callers never
/// read-modify-write counters themselves.
#[async_trait]
pub trait KvStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn connect(&self) -> ExperimentResult<()>;

    async fn disconnect(&self) -> ExperimentResult<()>;

    fn is_connected(&self) -> bool;

    async fn get(&self, key: &str) -> ExperimentResult<Option<String>>;

    /// Writes `value` only if the current value equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> ExperimentResult<bool>;

    /// Creates `key` if absent and adds `member` to the `registry` set in the
    /// same atomic step. Returns false if the key already existed.
    async fn insert_new(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
        registry: &str,
        member: &str,
    ) -> ExperimentResult<bool>;

    async fn set_contains(&self, set: &str, member: &str) -> ExperimentResult<bool>;

    /// Applies every increment or none of them.
    async fn increment_batch(&self, increments: &[Increment]) -> ExperimentResult<()>;

    /// All counters under `key`; empty when the key is absent.
    async fn get_counters(&self, key: &str) -> ExperimentResult<MetricsBucket>;
}
