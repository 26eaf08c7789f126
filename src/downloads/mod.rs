//! Download task management: ledger-backed tasks driven by a transfer backend

pub mod manager;
pub mod progress;
pub mod reconcile;

pub use manager::{DownloadHandle, DownloadTaskManager};
pub use progress::ProgressThrottle;
pub use reconcile::ReconcileSummary;
