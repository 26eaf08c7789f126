//! Inventory of installed models: owned files in the models directory plus
//! registry entries for externally linked files.

pub mod manager;
pub mod types;

pub use manager::StoredModelsManager;
pub use types::{ModelSource, StoredModel};
