// Database module for the model downloader
// Provides SQLite persistence for the download ledger, the external link registry and settings

pub mod manager;
pub mod migrations;
pub mod models;
pub mod settings_repo;
pub mod ledger_repo;
pub mod links_repo;

pub use manager::DatabaseManager;
pub use models::*;
