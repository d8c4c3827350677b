//! Completion detectors.
//!
//! A detector owns a set of task ids and infers their completion from
//! [`SessionEvent`]s. Detectors are independent: each keeps its own counters
//! and subscriptions, and the orchestrator contains any failure to the
//! detector that caused it.
//!
//! - [`activity_detector`]: counts activity completions against a required number
//!   of uses, suppressing duplicate observations
//! - [`progress_detector`]: polls externally-owned progress on each tick,
//!   respecting the transition-safety flag
//!
//! # Contract
//!
//! - `initialize` is idempotent and subscribes to the events the detector needs.
//! - `dispose` is idempotent and releases every subscription `initialize` made.
//! - `state` returns [`TaskState::Unknown`] rather than guessing.
//! - `sync` seeds counters from persisted completion, so a restart does not
//!   make the detector disagree with the checklist it was handed.
//! - `handle_event` never fails; problems are logged and the event is dropped.

pub mod activity_detector;
pub mod progress_detector;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::events::{EventFeed, EventKind, SessionEvent, SubscriptionId, TransitionGuard};
use crate::scheduler::ResetApplied;
use crate::types::{ChecklistState, DetectionLimitation, TaskState};

pub use activity_detector::{ActivityDetector, ActivityRule};
pub use progress_detector::{MemoryProbe, ProbeError, ProgressBinding, ProgressDetector, ProgressProbe};

/// Errors surfaced by detectors and detector registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectorError {
    /// `initialize` failed; the detector was fully unwound.
    #[error("detector '{detector}' failed to initialize: {reason}")]
    Registration { detector: String, reason: String },

    /// A detector with the same identity is already registered.
    #[error("detector '{0}' is already registered")]
    DuplicateDetector(String),

    /// No detector with this identity is registered.
    #[error("detector '{0}' is not registered")]
    UnknownDetector(String),

    /// The detector panicked; the payload message is preserved.
    #[error("detector '{detector}' panicked: {message}")]
    Panicked { detector: String, message: String },
}

/// A detector's claim that a task's completion changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskChange {
    pub task_id: String,
    pub completed: bool,
}

/// Collects change notifications raised while a detector handles one event.
#[derive(Debug, Default)]
pub struct ChangeSink {
    changes: Vec<TaskChange>,
}

impl ChangeSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises a change notification for `task_id`.
    pub fn notify(&mut self, task_id: impl Into<String>, completed: bool) {
        self.changes.push(TaskChange {
            task_id: task_id.into(),
            completed,
        });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn into_changes(self) -> Vec<TaskChange> {
        self.changes
    }
}

/// A completion detector for one family of activities.
pub trait Detector: Send {
    /// Stable identity, unique among registered detectors.
    fn id(&self) -> &str;

    /// Task ids this detector answers for.
    fn owned_tasks(&self) -> Vec<String>;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    /// Subscribes to the events this detector needs. Idempotent.
    fn initialize(&mut self, feed: &mut EventFeed) -> Result<(), DetectorError>;

    /// Current view of a task's completion.
    fn state(&self, task_id: &str, guard: &dyn TransitionGuard) -> TaskState;

    /// Handles one subscribed event, raising change notifications into `sink`.
    fn handle_event(&mut self, event: &SessionEvent, guard: &dyn TransitionGuard, sink: &mut ChangeSink);

    /// Re-synchronizes internal counters after a reset cleared some tasks.
    fn on_reset(&mut self, _reset: &ResetApplied) {}

    /// Aligns internal counters with a checklist that was loaded or
    /// switched in rather than built up from observed events.
    fn sync(&mut self, _state: &ChecklistState) {}

    /// Releases every subscription made by `initialize`. Idempotent.
    fn dispose(&mut self, feed: &mut EventFeed);

    /// Known detection gaps, for display.
    fn limitations(&self) -> Vec<DetectionLimitation> {
        Vec::new()
    }
}

/// Subscription handles held by one detector.
#[derive(Debug, Default)]
pub struct Subscriptions {
    handles: Vec<SubscriptionId>,
}

impl Subscriptions {
    /// Returns `true` once `subscribe_all` has run and not yet been released.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn subscribe_all(&mut self, feed: &mut EventFeed, owner: &str, kinds: &[EventKind]) {
        for kind in kinds {
            self.handles.push(feed.subscribe(owner, *kind));
        }
    }

    /// Unsubscribes every held handle exactly once. Returns how many were released.
    pub fn release(&mut self, feed: &mut EventFeed) -> usize {
        std::mem::take(&mut self.handles)
            .into_iter()
            .filter(|id| feed.unsubscribe(*id))
            .count()
    }
}

/// Activity key → task wiring used by the built-in activity detector.
const BUILTIN_ACTIVITY_RULES: &[(&str, &str, u32)] = &[
    ("daily-roulette", "duty_roulette", 1),
    ("daily-mini-lottery", "mini_lottery_ticket", 3),
    ("daily-tribal-quests", "tribal_quest", 3),
    ("weekly-custom-deliveries", "custom_delivery", 12),
    ("weekly-raid-clear", "raid_clear", 1),
];

/// Probe key → task wiring used by the built-in progress detector.
const BUILTIN_PROGRESS_BINDINGS: &[(&str, &str)] = &[("weekly-challenge-log", "challenge_log_complete")];

/// The detectors shipped with the built-in catalog.
#[must_use]
pub fn builtin(dedupe_window: Duration, probe: Arc<dyn ProgressProbe>) -> Vec<Box<dyn Detector>> {
    let rules = BUILTIN_ACTIVITY_RULES
        .iter()
        .map(|(task, activity, required)| ActivityRule::new(*task, *activity, *required))
        .collect();
    let bindings = BUILTIN_PROGRESS_BINDINGS
        .iter()
        .map(|(task, key)| ProgressBinding::new(*task, *key))
        .collect();

    vec![
        Box::new(ActivityDetector::new("activity", rules, dedupe_window)),
        Box::new(ProgressDetector::new("progress", bindings, probe)),
    ]
}
