//! Activity detector: counts completions of external activities.
//!
//! Each [`ActivityRule`] maps an external activity key to a task and the
//! number of uses that complete it (a daily allowance of three lottery
//! tickets, twelve weekly deliveries, a single roulette). The detector keeps
//! a "uses consumed" counter per task and raises a change notification when
//! the counter reaches the required number.
//!
//! # Duplicate Observations
//!
//! The host may deliver the same real-world completion more than once. An
//! observation whose event id was already seen with a timestamp inside the
//! dedupe window is dropped without counting. Seen ids live in a bounded LRU
//! cache.
//!
//! # Resets
//!
//! When a reset clears one of this detector's tasks, its counter is re-zeroed
//! so the count and the cleared `completed` flag stay in lockstep. After a
//! load, a task stored as completed without a manual override counts as fully
//! used, since only this detector could have completed it.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use chrono::Utc;
//! use dutyroll_tracker::detectors::{ActivityDetector, ActivityRule, ChangeSink, Detector};
//! use dutyroll_tracker::events::{EventFeed, SessionEvent};
//!
//! let mut feed = EventFeed::new();
//! let mut detector = ActivityDetector::new(
//!     "activity",
//!     vec![ActivityRule::new("daily-roulette", "duty_roulette", 1)],
//!     Duration::from_secs(5),
//! );
//! detector.initialize(&mut feed).unwrap();
//!
//! let mut sink = ChangeSink::new();
//! let event = SessionEvent::ActivityCompleted {
//!     activity: "duty_roulette".into(),
//!     event_id: "evt-1".into(),
//!     at: Utc::now(),
//! };
//! detector.handle_event(&event, feed.transition_flag(), &mut sink);
//!
//! assert_eq!(detector.uses("daily-roulette"), 1);
//! assert!(!sink.is_empty());
//! ```

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::{debug, info, trace, warn};

use super::{ChangeSink, Detector, DetectorError, Subscriptions};
use crate::events::{EventFeed, EventKind, SessionEvent, TransitionGuard};
use crate::scheduler::ResetApplied;
use crate::types::{ChecklistState, DetectionLimitation, LimitationKind, TaskState};

/// Number of recent event ids remembered for de-duplication.
const DEDUPE_CAPACITY: usize = 256;

/// Maps one external activity to one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRule {
    pub task_id: String,
    /// External activity key carried by `ActivityCompleted`.
    pub activity: String,
    /// Uses needed to complete the task; at least 1.
    pub required: u32,
}

impl ActivityRule {
    #[must_use]
    pub fn new(task_id: impl Into<String>, activity: impl Into<String>, required: u32) -> Self {
        Self {
            task_id: task_id.into(),
            activity: activity.into(),
            required: required.max(1),
        }
    }
}

/// Counts activity completions per task.
pub struct ActivityDetector {
    id: String,
    rules: Vec<ActivityRule>,
    /// Uses consumed since the task's last reset.
    uses: HashMap<String, u32>,
    /// Event id → timestamp of the last counted observation.
    seen: LruCache<String, DateTime<Utc>>,
    dedupe_window: chrono::Duration,
    enabled: bool,
    subscriptions: Subscriptions,
}

impl std::fmt::Debug for ActivityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDetector")
            .field("id", &self.id)
            .field("rules", &self.rules)
            .field("uses", &self.uses)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl ActivityDetector {
    /// Creates a detector for `rules` with the given dedupe window.
    #[must_use]
    pub fn new(id: impl Into<String>, rules: Vec<ActivityRule>, dedupe_window: Duration) -> Self {
        let capacity = NonZeroUsize::new(DEDUPE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            id: id.into(),
            rules,
            uses: HashMap::new(),
            seen: LruCache::new(capacity),
            dedupe_window: chrono::Duration::from_std(dedupe_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            enabled: true,
            subscriptions: Subscriptions::default(),
        }
    }

    /// Uses consumed for a task since its last reset.
    #[must_use]
    pub fn uses(&self, task_id: &str) -> u32 {
        self.uses.get(task_id).copied().unwrap_or(0)
    }

    fn rule(&self, task_id: &str) -> Option<&ActivityRule> {
        self.rules.iter().find(|r| r.task_id == task_id)
    }

    /// Returns `true` if this observation repeats one already counted.
    fn is_duplicate(&mut self, event_id: &str, activity: &str, at: DateTime<Utc>) -> bool {
        // Some feeds omit ids; fall back to activity + timestamp identity.
        let key = if event_id.is_empty() {
            format!("{activity}@{}", at.timestamp_millis())
        } else {
            event_id.to_string()
        };

        if let Some(previous) = self.seen.get(&key) {
            let gap = if at >= *previous { at - *previous } else { *previous - at };
            if gap <= self.dedupe_window {
                return true;
            }
        }
        self.seen.put(key, at);
        false
    }

    fn record_use(&mut self, activity: &str, event_id: &str, at: DateTime<Utc>, sink: &mut ChangeSink) {
        let matching: Vec<(String, u32)> = self
            .rules
            .iter()
            .filter(|r| r.activity == activity)
            .map(|r| (r.task_id.clone(), r.required))
            .collect();

        if matching.is_empty() {
            trace!(detector = %self.id, activity = %activity, "Activity not tracked");
            return;
        }

        if self.is_duplicate(event_id, activity, at) {
            debug!(
                detector = %self.id,
                activity = %activity,
                event_id = %event_id,
                "Duplicate observation suppressed"
            );
            return;
        }

        for (task_id, required) in matching {
            let count = self.uses.entry(task_id.clone()).or_insert(0);
            if *count >= required {
                trace!(task_id = %task_id, count = *count, "Use beyond requirement ignored");
                continue;
            }
            *count += 1;
            debug!(task_id = %task_id, count = *count, required, "Activity use counted");

            if *count == required {
                info!(detector = %self.id, task_id = %task_id, "Task completed by activity");
                sink.notify(task_id, true);
            }
        }
    }
}

impl Detector for ActivityDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn owned_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            if !tasks.contains(&rule.task_id) {
                tasks.push(rule.task_id.clone());
            }
        }
        tasks
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn initialize(&mut self, feed: &mut EventFeed) -> Result<(), DetectorError> {
        if self.subscriptions.is_active() {
            return Ok(());
        }
        self.subscriptions.subscribe_all(
            feed,
            &self.id,
            &[EventKind::ActivityCompleted, EventKind::SessionEnded],
        );
        Ok(())
    }

    fn state(&self, task_id: &str, _guard: &dyn TransitionGuard) -> TaskState {
        // Counters are detector-owned, so the transition flag does not apply.
        match self.rule(task_id) {
            Some(rule) => TaskState::from_completed(self.uses(task_id) >= rule.required),
            None => TaskState::Unknown,
        }
    }

    fn handle_event(&mut self, event: &SessionEvent, _guard: &dyn TransitionGuard, sink: &mut ChangeSink) {
        match event {
            SessionEvent::ActivityCompleted {
                activity,
                event_id,
                at,
            } => self.record_use(activity, event_id, *at, sink),
            SessionEvent::SessionEnded => {
                self.seen.clear();
                trace!(detector = %self.id, "Dedupe cache cleared at session end");
            }
            other => {
                warn!(detector = %self.id, kind = ?other.kind(), "Unexpected event delivered");
            }
        }
    }

    fn on_reset(&mut self, reset: &ResetApplied) {
        for task_id in &reset.task_ids {
            if self.uses.remove(task_id).is_some() {
                debug!(
                    detector = %self.id,
                    task_id = %task_id,
                    boundary = %reset.boundary,
                    "Use counter re-zeroed"
                );
            }
        }
    }

    fn sync(&mut self, state: &ChecklistState) {
        for rule in &self.rules {
            let Some(task) = state.task(&rule.task_id) else {
                continue;
            };
            let uses = self.uses.get(&rule.task_id).copied().unwrap_or(0);

            if task.completed && !task.manual_override {
                if uses < rule.required {
                    self.uses.insert(rule.task_id.clone(), rule.required);
                    debug!(detector = %self.id, task_id = %rule.task_id, "Use counter seeded from checklist");
                }
            } else if !task.completed && uses >= rule.required {
                self.uses.remove(&rule.task_id);
                debug!(detector = %self.id, task_id = %rule.task_id, "Use counter cleared to match checklist");
            }
        }
    }

    fn dispose(&mut self, feed: &mut EventFeed) {
        let released = self.subscriptions.release(feed);
        if released > 0 {
            debug!(detector = %self.id, released, "Activity detector disposed");
        }
    }

    fn limitations(&self) -> Vec<DetectionLimitation> {
        self.rules
            .iter()
            .filter(|r| r.required > 1)
            .map(|r| {
                DetectionLimitation::for_task(
                    r.task_id.clone(),
                    LimitationKind::PartialCoverage,
                    format!(
                        "Counts {} uses; uses made while the tracker was not running are not seen",
                        r.required
                    ),
                )
            })
            .collect()
    }
}
