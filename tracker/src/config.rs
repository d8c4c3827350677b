//! Configuration for the DutyRoll tracker.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DUTYROLL_DATA_DIR` | No | `~/.dutyroll` | Directory holding `checklist.json` |
//! | `DUTYROLL_OWNER` | No | - | Session owner identity |
//! | `DUTYROLL_SAVE_DEBOUNCE_MS` | No | 2000 | Quiet period before a debounced save |
//! | `DUTYROLL_TICK_MS` | No | 1000 | Host tick period (reset checks, polling) |
//! | `DUTYROLL_DEDUPE_WINDOW_MS` | No | 5000 | Window for suppressing duplicate completions |
//! | `DUTYROLL_DAILY_RESET` | No | `15:00` | Daily boundary, UTC `HH:MM` |
//! | `DUTYROLL_WEEKLY_RESET` | No | `tue 08:00` | Weekly boundary, UTC `DDD HH:MM` |
//!
//! # Example
//!
//! ```no_run
//! use dutyroll_tracker::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Data directory: {}", config.data_dir.display());
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::scheduler::BoundaryRule;
use crate::utils::debounce::DEFAULT_DEBOUNCE_MS;

/// Default data directory name relative to home.
const DEFAULT_DATA_DIR: &str = ".dutyroll";

/// Default host tick period in milliseconds.
const DEFAULT_TICK_MS: u64 = 1000;

/// Default duplicate-observation window in milliseconds.
const DEFAULT_DEDUPE_WINDOW_MS: u64 = 5000;

/// Default daily boundary (UTC).
const DEFAULT_DAILY_RESET: &str = "15:00";

/// Default weekly boundary (UTC).
const DEFAULT_WEEKLY_RESET: &str = "tue 08:00";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Configuration for the tracker.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the checklist document.
    pub data_dir: PathBuf,

    /// Owner identity for the session, if known up front.
    pub owner: Option<String>,

    /// Quiet period before a debounced save is flushed.
    pub save_debounce: Duration,

    /// Host tick period.
    pub tick_interval: Duration,

    /// Duplicate-observation window for detectors.
    pub dedupe_window: Duration,

    pub daily_reset: BoundaryRule,

    pub weekly_reset: BoundaryRule,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - a duration variable is set but is not a positive integer
    /// - a reset variable is set but cannot be parsed
    /// - `DUTYROLL_DATA_DIR` is unset and the home directory cannot be determined
    pub fn from_env() -> Result<Self, ConfigError> {
        // Optional: DUTYROLL_DATA_DIR (default: ~/.dutyroll)
        let data_dir = match env::var("DUTYROLL_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs.home_dir().join(DEFAULT_DATA_DIR)
            }
        };

        let owner = env::var("DUTYROLL_OWNER")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let save_debounce = millis_var("DUTYROLL_SAVE_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?;
        let tick_interval = millis_var("DUTYROLL_TICK_MS", DEFAULT_TICK_MS)?;
        let dedupe_window = millis_var("DUTYROLL_DEDUPE_WINDOW_MS", DEFAULT_DEDUPE_WINDOW_MS)?;

        let daily = env::var("DUTYROLL_DAILY_RESET").unwrap_or_else(|_| DEFAULT_DAILY_RESET.to_string());
        let daily_reset = BoundaryRule::parse_daily(&daily).map_err(|e| ConfigError::InvalidValue {
            key: "DUTYROLL_DAILY_RESET".to_string(),
            message: format!("{e} (got '{daily}')"),
        })?;

        let weekly = env::var("DUTYROLL_WEEKLY_RESET").unwrap_or_else(|_| DEFAULT_WEEKLY_RESET.to_string());
        let weekly_reset = BoundaryRule::parse_weekly(&weekly).map_err(|e| ConfigError::InvalidValue {
            key: "DUTYROLL_WEEKLY_RESET".to_string(),
            message: format!("{e} (got '{weekly}')"),
        })?;

        Ok(Self {
            data_dir,
            owner,
            save_debounce,
            tick_interval,
            dedupe_window,
            daily_reset,
            weekly_reset,
        })
    }
}

/// Parses a positive millisecond duration, falling back to `default`.
fn millis_var(key: &str, default: u64) -> Result<Duration, ConfigError> {
    let millis = match env::var(key) {
        Ok(val) => {
            let ms = val.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected positive integer, got '{val}'"),
            })?;
            if ms == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
            ms
        }
        Err(_) => default,
    };
    Ok(Duration::from_millis(millis))
}
