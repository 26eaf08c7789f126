//! Download notifications surface

/// Where download status is shown to the user outside the app UI
pub trait DownloadNotifier: Send + Sync {
    /// Ask for permission to post notifications. Returns whether it is granted.
    fn request_permission(&self) -> bool;

    fn download_progress(&self, model_name: &str, progress: u8);

    fn download_completed(&self, model_name: &str);

    fn download_failed(&self, model_name: &str, reason: &str);

    /// Remove any notification shown for `model_name`
    fn dismiss(&self, model_name: &str);
}

/// Writes notifications to the log. Used when no platform surface exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl DownloadNotifier for LogNotifier {
    fn request_permission(&self) -> bool {
        true
    }

    fn download_progress(&self, model_name: &str, progress: u8) {
        log::debug!("Downloading {}: {}%", model_name, progress);
    }

    fn download_completed(&self, model_name: &str) {
        log::info!("Download complete: {}", model_name);
    }

    fn download_failed(&self, model_name: &str, reason: &str) {
        log::warn!("Download failed: {} ({})", model_name, reason);
    }

    fn dismiss(&self, model_name: &str) {
        log::debug!("Dismissed notification for {}", model_name);
    }
}
