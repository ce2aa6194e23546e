//! Experiment service: wires the models, store and selection crates into
//! one object the embedding application owns.

pub mod lifecycle;
pub mod service;

pub use lifecycle::{ConnectionStatus, Lifecycle};
pub use service::{ExperimentService, ServiceBuilder, SiteResponse};
