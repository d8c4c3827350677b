//! Error types for the DutyRoll tracker.
//!
//! Each module owns a focused error enum; [`TrackerError`] aggregates the ones
//! a user action can produce.

use thiserror::Error;

use crate::detectors::DetectorError;
use crate::persistence::PersistenceError;
use crate::tracker::ChangeError;

/// Errors returned by [`ChecklistTracker::apply_action`](crate::tracker::ChecklistTracker::apply_action).
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Detector registration or lookup failed.
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),

    /// Saving the checklist failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A checklist change was rejected.
    #[error("change rejected: {0}")]
    Change(#[from] ChangeError),
}

/// A specialized `Result` type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
