//! DutyRoll Tracker - recurring daily and weekly task checklist.
//!
//! This crate keeps the completion state of a fixed catalog of recurring,
//! time-boxed activities inside a live client session. Completion is inferred
//! from session events where possible and declared by the user otherwise.
//!
//! # Overview
//!
//! Detection flows one way: a host [`SessionEvent`] reaches the detectors
//! subscribed to it, their change notifications pass through the
//! [`DetectionOrchestrator`], and the [`ChecklistTracker`] applies them to the
//! live [`ChecklistState`] and requests a debounced save. On every host tick
//! the [`ResetScheduler`] clears tasks whose boundary has elapsed and tells
//! the detectors, so their internal counters stay in lockstep.
//!
//! The tracker only observes the session. It never drives it.
//!
//! # Modules
//!
//! - [`types`]: Tasks, categories, detection modes, checklist state
//! - [`catalog`]: The catalog of trackable activities
//! - [`events`]: Host session events, subscriptions, transition flag
//! - [`detectors`]: Completion detectors
//! - [`orchestrator`]: Detector registry and failure isolation
//! - [`scheduler`]: Reset boundaries and the periodic reset check
//! - [`persistence`]: Load/repair, atomic save, debounced save
//! - [`tracker`]: Session glue and direct user actions
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for tracker operations
//! - [`utils`]: Shared utilities (debouncing)

pub mod catalog;
pub mod config;
pub mod detectors;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod persistence;
pub mod scheduler;
pub mod tracker;
pub mod types;
pub mod utils;

pub use catalog::{Cadence, Catalog, CatalogError, TaskDefinition};
pub use config::{Config, ConfigError};
pub use detectors::{Detector, DetectorError, MemoryProbe, ProgressProbe};
pub use error::{Result, TrackerError};
pub use events::{EventFeed, EventKind, SessionEvent, TransitionFlag, TransitionGuard};
pub use orchestrator::{DetectionOrchestrator, DetectorChange, Registration};
pub use persistence::{LoadOrigin, LoadReport, PersistenceError, PersistenceManager};
pub use scheduler::{BoundaryRule, ResetApplied, ResetScheduler};
pub use tracker::{ChangeError, ChecklistTracker, UserAction};
pub use types::{BoundaryId, Category, ChecklistState, DetectionLimitation, DetectionMode, Task, TaskState};
pub use utils::{Debouncer, DebouncerError, DEFAULT_DEBOUNCE_MS};
