use directories::ProjectDirs;
use std::path::PathBuf;

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    pub fn state_dir() -> Option<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            Some(
                PathBuf::from(home)
                    .join(".local")
                    .join("state")
                    .join("changedetect"),
            )
        } else {
            ProjectDirs::from("", "", "changedetect")
                .map(|proj_dirs| proj_dirs.data_local_dir().to_path_buf())
        }
    }

    /// Durable key-value store (device id, participation, admin mode flag)
    pub fn store_path() -> Option<PathBuf> {
        Self::state_dir().map(|d| d.join("store.json"))
    }

    /// Local archive of finalised sessions
    pub fn archive_path() -> Option<PathBuf> {
        Self::state_dir().map(|d| d.join("results.db"))
    }

    pub fn log_path() -> Option<PathBuf> {
        Self::state_dir().map(|d| d.join("changedetect.log"))
    }
}
