pub mod config;
pub mod error;
pub mod key;
pub mod outcome;
pub mod types;
pub mod validation;

pub use config::AppConfig;
pub use error::{ExperimentError, ExperimentResult};
pub use outcome::Outcome;
pub use validation::{RequestParts, RequestValidator};
