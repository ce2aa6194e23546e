//! Site/model store: where site configurations come from.

pub mod backend;
pub mod directory;
pub mod store;

pub use backend::{ModelsBackend, StaticModels};
pub use directory::DirectoryModels;
pub use store::ModelStore;
