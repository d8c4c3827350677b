//! Session glue: the live checklist and everything that mutates it.
//!
//! [`ChecklistTracker`] is owned by the primary execution context. It is the
//! only writer of the live [`ChecklistState`]; detectors, the reset scheduler,
//! and direct user actions all mutate it through here, and every meaningful
//! mutation requests a debounced save.
//!
//! # Detection Modes
//!
//! - `Manual`: detector notifications are ignored.
//! - `Auto`: completion follows the detector, OR-ed with the manual override.
//! - `Hybrid`: the detector can mark a task complete but never clears it.
//!
//! # Shutdown
//!
//! [`ChecklistTracker::shutdown`] cancels the pending debounced save, saves
//! the live state synchronously, unsubscribes every detector, and then
//! disposes them, in that order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::detectors::{self, Detector, DetectorError, ProgressProbe};
use crate::error::TrackerError;
use crate::events::{EventFeed, SessionEvent, TransitionFlag};
use crate::orchestrator::{DetectionOrchestrator, DetectorChange, Registration};
use crate::persistence::{PersistenceError, PersistenceManager};
use crate::scheduler::{ResetApplied, ResetScheduler};
use crate::types::{BoundaryId, Category, ChecklistState, DetectionLimitation, DetectionMode, TaskState};

/// Errors from applying a change to the checklist.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChangeError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("tracker has shut down")]
    ShutDown,
}

/// A direct user action from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserAction {
    Toggle {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    ResetCategory {
        category: Category,
    },
    ResetToDefaults,
    SetMode {
        #[serde(rename = "taskId")]
        task_id: String,
        mode: DetectionMode,
    },
    MuteDetector {
        detector: String,
        muted: bool,
    },
    /// Saves immediately instead of waiting for the debounce.
    Save,
}

/// The live checklist plus its detectors, scheduler, and storage.
#[derive(Debug)]
pub struct ChecklistTracker {
    catalog: Catalog,
    state: ChecklistState,
    orchestrator: DetectionOrchestrator,
    scheduler: ResetScheduler,
    store: PersistenceManager,
    shut_down: bool,
}

impl ChecklistTracker {
    /// Loads the checklist for `owner` and wires an empty orchestrator.
    #[must_use]
    pub fn new(
        catalog: Catalog,
        scheduler: ResetScheduler,
        store: PersistenceManager,
        feed: EventFeed,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let state = store.load(&catalog, owner, now);
        Self {
            catalog,
            state,
            orchestrator: DetectionOrchestrator::new(feed),
            scheduler,
            store,
            shut_down: false,
        }
    }

    /// Builds a tracker over the built-in catalog and detectors.
    ///
    /// Detector registration failures are logged and the tracker continues
    /// with the detectors that did register. Must be called from within a
    /// Tokio runtime.
    #[must_use]
    pub fn from_config(config: &Config, probe: Arc<dyn ProgressProbe>, now: DateTime<Utc>) -> Self {
        let catalog = Catalog::builtin();
        let scheduler = ResetScheduler::new(&catalog, config.daily_reset, config.weekly_reset);
        let store = PersistenceManager::new(&config.data_dir).with_debounce(config.save_debounce);

        let mut tracker = Self::new(
            catalog,
            scheduler,
            store,
            EventFeed::new(),
            config.owner.as_deref(),
            now,
        );
        for detector in detectors::builtin(config.dedupe_window, probe) {
            if let Err(e) = tracker.register_detector(detector) {
                warn!(error = %e, "Continuing without detector");
            }
        }
        tracker
    }

    #[must_use]
    pub fn state(&self) -> &ChecklistState {
        &self.state
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn scheduler(&self) -> &ResetScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn orchestrator(&self) -> &DetectionOrchestrator {
        &self.orchestrator
    }

    /// Handle to the transition-safety flag shared with detectors.
    #[must_use]
    pub fn transition_flag(&self) -> TransitionFlag {
        self.orchestrator.transition_flag().clone()
    }

    /// Number of physical document writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.store.write_count()
    }

    /// Registers a detector and syncs its counters to the live checklist.
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's registration error; the tracker and its
    /// other detectors are unaffected.
    pub fn register_detector(&mut self, detector: Box<dyn Detector>) -> Result<Registration, DetectorError> {
        let registration = self.orchestrator.register(detector)?;
        self.orchestrator.sync(&self.state);
        Ok(registration)
    }

    /// The detector's current view of a task, `Unknown` when none answers.
    #[must_use]
    pub fn detector_state(&self, task_id: &str) -> TaskState {
        self.orchestrator.state(task_id)
    }

    /// Routes a host event to the detectors and applies their notifications.
    ///
    /// Returns how many task changes were applied.
    pub fn handle_event(&mut self, event: &SessionEvent, now: DateTime<Utc>) -> usize {
        if self.shut_down {
            debug!(kind = ?event.kind(), "Event after shutdown ignored");
            return 0;
        }

        if let SessionEvent::SessionStarted { owner: Some(owner) } = event {
            self.adopt_owner(owner, now);
        }

        let state = &mut self.state;
        let mut changed = 0;
        self.orchestrator.dispatch(event, |change: &DetectorChange| {
            if apply_detector_change(state, change, now)? {
                changed += 1;
            }
            Ok::<(), ChangeError>(())
        });

        if changed > 0 {
            self.request_save();
        }
        changed
    }

    /// Switches the live checklist to `owner` if it belongs to someone else.
    fn adopt_owner(&mut self, owner: &str, now: DateTime<Utc>) {
        match self.state.owner.as_deref() {
            Some(current) if current == owner => {}
            None => {
                info!(owner = %owner, "Checklist owner set");
                self.state.owner = Some(owner.to_string());
                self.request_save();
            }
            Some(current) => {
                // The store holds one document, so the previous owner's
                // checklist is replaced rather than kept.
                info!(previous = %current, owner = %owner, "Session owner changed, switching checklist");
                self.state = self.store.load(&self.catalog, Some(owner), now);
                let task_ids = self.state.tasks.iter().map(|t| t.id.clone()).collect();
                self.notify_cleared(BoundaryId::Daily, task_ids, now);
                self.orchestrator.sync(&self.state);
                self.request_save();
            }
        }
    }

    /// Runs the periodic reset check, then delivers a tick to the detectors.
    ///
    /// Returns the resets that were applied.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<ResetApplied> {
        if self.shut_down {
            return Vec::new();
        }

        let resets = self.scheduler.check(&mut self.state, now);
        for reset in &resets {
            self.orchestrator.notify_reset(reset);
        }
        if !resets.is_empty() {
            self.request_save();
        }

        self.handle_event(&SessionEvent::Tick { now }, now);
        resets
    }

    /// Flips a task's manual override and recomputes its completion.
    ///
    /// Returns the task's new `completed` value.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeError::UnknownTask`] for ids outside the checklist.
    pub fn toggle_manual(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<bool, ChangeError> {
        self.ensure_running()?;
        let detected = self.orchestrator.state(task_id);
        let task = self
            .state
            .task_mut(task_id)
            .ok_or_else(|| ChangeError::UnknownTask(task_id.to_string()))?;

        task.manual_override = !task.manual_override;
        let from_detector = task.detection_mode != DetectionMode::Manual && detected.is_complete();
        task.set_completed(task.manual_override || from_detector, now);
        let completed = task.completed;

        info!(task_id = %task_id, manual_override = task.manual_override, completed, "Manual toggle");
        self.request_save();
        Ok(completed)
    }

    /// Clears every task in `category`, including tasks with a dedicated
    /// cadence. Boundary timestamps are not moved.
    ///
    /// Returns the cleared task ids.
    pub fn reset_category(&mut self, category: Category, now: DateTime<Utc>) -> Vec<String> {
        if self.shut_down {
            return Vec::new();
        }

        let mut cleared = Vec::new();
        for task in self.state.tasks.iter_mut().filter(|t| t.category == category) {
            task.clear();
            cleared.push(task.id.clone());
        }

        info!(category = %category, tasks = cleared.len(), "Category reset by user");
        self.notify_cleared(BoundaryId::for_category(category), cleared.clone(), now);
        self.request_save();
        cleared
    }

    /// Replaces the task list with catalog defaults, keeping the owner and
    /// the boundary timestamps.
    pub fn reset_to_defaults(&mut self, now: DateTime<Utc>) {
        if self.shut_down {
            return;
        }

        self.state.tasks = self.catalog.default_tasks();
        for category in [Category::Daily, Category::Weekly] {
            let task_ids = self
                .state
                .tasks
                .iter()
                .filter(|t| t.category == category)
                .map(|t| t.id.clone())
                .collect();
            self.notify_cleared(BoundaryId::for_category(category), task_ids, now);
        }

        info!(tasks = self.state.tasks.len(), "Checklist reset to catalog defaults");
        self.request_save();
    }

    /// Changes how a task's completion is decided.
    ///
    /// Switching to `Auto` re-syncs completion from the detector when it
    /// has an answer.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeError::UnknownTask`] for ids outside the checklist.
    pub fn set_detection_mode(
        &mut self,
        task_id: &str,
        mode: DetectionMode,
        now: DateTime<Utc>,
    ) -> Result<(), ChangeError> {
        self.ensure_running()?;
        let detected = self.orchestrator.state(task_id);
        let task = self
            .state
            .task_mut(task_id)
            .ok_or_else(|| ChangeError::UnknownTask(task_id.to_string()))?;

        task.detection_mode = mode;
        if mode == DetectionMode::Auto && detected != TaskState::Unknown {
            task.set_completed(detected.is_complete() || task.manual_override, now);
        }

        info!(task_id = %task_id, mode = ?mode, "Detection mode changed");
        self.request_save();
        Ok(())
    }

    /// Mutes or unmutes a detector without disposing it.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::UnknownDetector`] if no such detector exists.
    pub fn set_detector_muted(&mut self, detector_id: &str, muted: bool) -> Result<(), DetectorError> {
        self.orchestrator.set_muted(detector_id, muted)
    }

    /// Catalog and detector detection limitations, for display.
    #[must_use]
    pub fn limitations(&self) -> Vec<DetectionLimitation> {
        let mut all = self.catalog.limitations();
        all.extend(self.orchestrator.limitations());
        all
    }

    /// Next occurrence of every reset boundary.
    #[must_use]
    pub fn upcoming_resets(&self, now: DateTime<Utc>) -> Vec<(BoundaryId, DateTime<Utc>)> {
        self.scheduler.upcoming(now)
    }

    /// Applies one user action.
    ///
    /// # Errors
    ///
    /// Returns the rejected change, unknown detector, or failed save. The
    /// checklist is unchanged when a change is rejected.
    pub fn apply_action(&mut self, action: &UserAction, now: DateTime<Utc>) -> Result<(), TrackerError> {
        self.ensure_running()?;
        match action {
            UserAction::Toggle { task_id } => {
                self.toggle_manual(task_id, now)?;
            }
            UserAction::ResetCategory { category } => {
                self.reset_category(*category, now);
            }
            UserAction::ResetToDefaults => self.reset_to_defaults(now),
            UserAction::SetMode { task_id, mode } => self.set_detection_mode(task_id, *mode, now)?,
            UserAction::MuteDetector { detector, muted } => self.set_detector_muted(detector, *muted)?,
            UserAction::Save => self.save_now()?,
        }
        Ok(())
    }

    /// Snapshots the live state and schedules a debounced save.
    pub fn request_save(&self) {
        self.store.request_debounced_save(&self.state);
    }

    /// Saves the live state immediately.
    ///
    /// # Errors
    ///
    /// Returns the storage error; the previous document is left intact.
    pub fn save_now(&self) -> Result<(), PersistenceError> {
        self.store.save(&self.state)
    }

    /// Shuts the tracker down.
    ///
    /// Detectors are torn down even if the final save fails.
    ///
    /// # Errors
    ///
    /// Returns the final save's error.
    pub async fn shutdown(&mut self) -> Result<(), PersistenceError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let result = self.store.shutdown(&self.state).await;
        self.orchestrator.dispose_all();
        info!("Tracker shut down");
        result
    }

    fn ensure_running(&self) -> Result<(), ChangeError> {
        if self.shut_down {
            return Err(ChangeError::ShutDown);
        }
        Ok(())
    }

    fn notify_cleared(&mut self, boundary: BoundaryId, task_ids: Vec<String>, now: DateTime<Utc>) {
        if task_ids.is_empty() {
            return;
        }
        self.orchestrator.notify_reset(&ResetApplied {
            boundary,
            at: now,
            task_ids,
        });
    }
}

/// Applies one detector notification according to the task's detection mode.
///
/// Returns whether the task changed.
fn apply_detector_change(
    state: &mut ChecklistState,
    change: &DetectorChange,
    now: DateTime<Utc>,
) -> Result<bool, ChangeError> {
    let task = state
        .task_mut(&change.task_id)
        .ok_or_else(|| ChangeError::UnknownTask(change.task_id.clone()))?;

    let changed = match task.detection_mode {
        DetectionMode::Manual => {
            debug!(task_id = %task.id, detector = %change.detector, "Manual task, detector change ignored");
            false
        }
        DetectionMode::Auto => task.set_completed(change.completed || task.manual_override, now),
        DetectionMode::Hybrid if change.completed => task.set_completed(true, now),
        DetectionMode::Hybrid => false,
    };

    if changed {
        info!(
            task_id = %task.id,
            completed = task.completed,
            detector = %change.detector,
            "Task completion detected"
        );
    }
    Ok(changed)
}
