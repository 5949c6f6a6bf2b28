use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::lang::Language;
use crate::layout::{ChangeParams, StimulusArea};

pub const ADMIN_PASSWORD_ENV: &str = "CHANGEDETECT_ADMIN_PASSWORD";

/// Fixed experiment constants. Durations are milliseconds, distances are in
/// abstract stimulus-area units.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub num_trials: usize,
    pub num_stimuli: usize,
    pub stimulus_size: f64,
    pub study_time_ms: u64,
    pub blank_time_ms: u64,
    pub change_probability: f64,
    pub max_position_fraction: f64,
    pub response_time_limit_ms: u64,
    pub min_objects_to_move: usize,
    pub max_objects_to_move: usize,
    pub swap_probability: f64,
    pub min_move_distance: f64,
    pub max_move_distance: f64,
    pub settle_ms: u64,
    pub timeout_notice_ms: u64,
    pub retry_delay_ms: u64,
    pub training_advance_ms: u64,
    pub practice_advance_ms: u64,
    pub practice_trials: usize,
    pub instructions_countdown_secs: u64,
    pub readout_interval_ms: u64,
    pub area_width: f64,
    pub area_height: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let stimulus_size = 40.0;
        Self {
            num_trials: 10,
            num_stimuli: 5,
            stimulus_size,
            study_time_ms: 500,
            blank_time_ms: 900,
            change_probability: 0.5,
            max_position_fraction: 0.8,
            response_time_limit_ms: 15_000,
            min_objects_to_move: 1,
            max_objects_to_move: 3,
            swap_probability: 0.3,
            min_move_distance: stimulus_size / 2.0,
            max_move_distance: stimulus_size * 2.0,
            settle_ms: 1_000,
            timeout_notice_ms: 1_500,
            retry_delay_ms: 5_000,
            training_advance_ms: 2_000,
            practice_advance_ms: 1_500,
            practice_trials: 3,
            instructions_countdown_secs: 5,
            readout_interval_ms: 100,
            area_width: 600.0,
            area_height: 400.0,
        }
    }
}

impl ExperimentConfig {
    pub fn study_time(&self) -> Duration {
        Duration::from_millis(self.study_time_ms)
    }

    pub fn blank_time(&self) -> Duration {
        Duration::from_millis(self.blank_time_ms)
    }

    pub fn response_time_limit(&self) -> Duration {
        Duration::from_millis(self.response_time_limit_ms)
    }

    /// Recorded response time for a trial that ran out the clock.
    pub fn response_time_limit_secs(&self) -> f64 {
        self.response_time_limit_ms as f64 / 1000.0
    }

    pub fn stimulus_area(&self) -> StimulusArea {
        StimulusArea {
            width: self.area_width,
            height: self.area_height,
            stimulus_size: self.stimulus_size,
            max_position_fraction: self.max_position_fraction,
        }
    }

    pub fn change_params(&self) -> ChangeParams {
        ChangeParams {
            min_objects_to_move: self.min_objects_to_move,
            max_objects_to_move: self.max_objects_to_move,
            swap_probability: self.swap_probability,
            min_move_distance: self.min_move_distance,
            max_move_distance: self.max_move_distance,
        }
    }
}

/// Deployment settings persisted between runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub endpoint_url: Option<String>,
    pub spreadsheet_url: Option<String>,
    /// Local fallback used when the endpoint cannot verify a login.
    pub admin_password: Option<String>,
    pub language: Language,
}

impl AppConfig {
    /// Admin password with the environment taking precedence over the file.
    pub fn effective_admin_password(&self) -> Option<String> {
        self.admin_password_with(std::env::var(ADMIN_PASSWORD_ENV).ok())
    }

    fn admin_password_with(&self, env: Option<String>) -> Option<String> {
        env.filter(|p| !p.is_empty())
            .or_else(|| self.admin_password.clone())
    }
}

pub trait ConfigStore {
    fn load(&self) -> AppConfig;
    fn save(&self, cfg: &AppConfig) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new() -> Self {
        let path = if let Some(pd) = ProjectDirs::from("", "", "changedetect") {
            pd.config_dir().join("config.json")
        } else {
            PathBuf::from("changedetect_config.json")
        };
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> AppConfig {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!(path = %self.path.display(), "no config file, using defaults");
                return AppConfig::default();
            }
        };
        match serde_json::from_slice::<AppConfig>(&bytes) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "unreadable config, using defaults");
                AppConfig::default()
            }
        }
    }

    fn save(&self, cfg: &AppConfig) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)
    }
}
