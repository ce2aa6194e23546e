//! Selection engine: resolves the experiment and variant to serve.

pub mod engine;
pub mod selector;

pub use engine::{get_active_experiment, resolve, select_specific, Resolved, SelectionSource};
pub use selector::{Selection, VariantSelector};
