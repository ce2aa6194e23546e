#![warn(clippy::unwrap_used)]

pub mod client;
pub mod kv;
pub mod local;
pub mod metrics_store;
pub mod sessions;

pub use client::RedisKv;
pub use kv::{Increment, KvStore};
pub use local::MemoryKv;
pub use metrics_store::{IngestReport, MetricsStore, SiteMetrics};
pub use sessions::{mint_session_id, SessionStore};
