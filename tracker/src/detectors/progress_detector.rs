//! Progress detector: polls externally-owned completion flags.
//!
//! Some activities expose their progress only as state held by the external
//! session (a challenge log, a weekly tracker window). This detector reads
//! that state through a [`ProgressProbe`] on each tick while a session is
//! active, throttled to one poll per interval, and raises a change
//! notification whenever a reading differs from the last one it reported.
//!
//! # Transition Safety
//!
//! Externally-owned state is never read while the transition flag is raised.
//! Polls are skipped and queries return [`TaskState::Unknown`]; the next tick
//! after the transition retries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::{ChangeSink, Detector, DetectorError, Subscriptions};
use crate::events::{EventFeed, EventKind, SessionEvent, TransitionGuard};
use crate::scheduler::ResetApplied;
use crate::types::{DetectionLimitation, LimitationKind, TaskState};

/// Default minimum spacing between polls.
pub const DEFAULT_POLL_INTERVAL_SECS: i64 = 5;

/// Errors raised by a probe read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("progress source unavailable: {0}")]
    Unavailable(String),
}

/// Read access to externally-owned progress flags.
pub trait ProgressProbe: Send + Sync {
    /// Reads one flag. `Ok(None)` means the source has no value yet.
    fn read(&self, key: &str) -> Result<Option<bool>, ProbeError>;
}

/// In-process probe whose values are pushed by the host.
#[derive(Debug, Default)]
pub struct MemoryProbe {
    values: RwLock<HashMap<String, bool>>,
}

impl MemoryProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: bool) {
        match self.values.write() {
            Ok(mut values) => {
                values.insert(key.into(), value);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key.into(), value);
            }
        }
    }

    /// Forgets one reading, so it reads as unavailable.
    pub fn remove(&self, key: &str) {
        match self.values.write() {
            Ok(mut values) => {
                values.remove(key);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(key);
            }
        }
    }

    pub fn clear(&self) {
        match self.values.write() {
            Ok(mut values) => values.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl ProgressProbe for MemoryProbe {
    fn read(&self, key: &str) -> Result<Option<bool>, ProbeError> {
        let values = self
            .values
            .read()
            .map_err(|_| ProbeError::Unavailable("probe lock poisoned".to_string()))?;
        Ok(values.get(key).copied())
    }
}

/// Binds a task to a probe key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressBinding {
    pub task_id: String,
    pub key: String,
}

impl ProgressBinding {
    #[must_use]
    pub fn new(task_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            key: key.into(),
        }
    }
}

/// Polls a [`ProgressProbe`] for a set of bound tasks.
pub struct ProgressDetector {
    id: String,
    bindings: Vec<ProgressBinding>,
    probe: Arc<dyn ProgressProbe>,
    /// Last value reported per task.
    reported: HashMap<String, bool>,
    poll_interval: chrono::Duration,
    last_poll: Option<DateTime<Utc>>,
    session_active: bool,
    enabled: bool,
    subscriptions: Subscriptions,
}

impl std::fmt::Debug for ProgressDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressDetector")
            .field("id", &self.id)
            .field("bindings", &self.bindings)
            .field("reported", &self.reported)
            .field("session_active", &self.session_active)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl ProgressDetector {
    #[must_use]
    pub fn new(id: impl Into<String>, bindings: Vec<ProgressBinding>, probe: Arc<dyn ProgressProbe>) -> Self {
        Self {
            id: id.into(),
            bindings,
            probe,
            reported: HashMap::new(),
            poll_interval: chrono::Duration::seconds(DEFAULT_POLL_INTERVAL_SECS),
            last_poll: None,
            session_active: false,
            enabled: true,
            subscriptions: Subscriptions::default(),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: chrono::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn binding(&self, task_id: &str) -> Option<&ProgressBinding> {
        self.bindings.iter().find(|b| b.task_id == task_id)
    }

    fn poll(&mut self, now: DateTime<Utc>, guard: &dyn TransitionGuard, sink: &mut ChangeSink) {
        if !self.session_active {
            return;
        }
        if guard.is_transitioning() {
            debug!(detector = %self.id, "Transition in progress, poll deferred");
            return;
        }
        if let Some(last) = self.last_poll {
            if now - last < self.poll_interval {
                return;
            }
        }
        self.last_poll = Some(now);

        for binding in &self.bindings {
            match self.probe.read(&binding.key) {
                Ok(Some(value)) => {
                    if self.reported.get(&binding.task_id) != Some(&value) {
                        info!(
                            detector = %self.id,
                            task_id = %binding.task_id,
                            completed = value,
                            "Progress changed"
                        );
                        self.reported.insert(binding.task_id.clone(), value);
                        sink.notify(binding.task_id.clone(), value);
                    }
                }
                Ok(None) => {
                    trace!(key = %binding.key, "No progress value yet");
                }
                Err(e) => {
                    warn!(
                        detector = %self.id,
                        key = %binding.key,
                        error = %e,
                        "Progress read failed"
                    );
                }
            }
        }
    }
}

impl Detector for ProgressDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn owned_tasks(&self) -> Vec<String> {
        self.bindings.iter().map(|b| b.task_id.clone()).collect()
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
            &[
                EventKind::SessionStarted,
                EventKind::SessionEnded,
                EventKind::ContextChanged,
                EventKind::Tick,
            ],
        );
        Ok(())
    }

    fn state(&self, task_id: &str, guard: &dyn TransitionGuard) -> TaskState {
        let Some(binding) = self.binding(task_id) else {
            return TaskState::Unknown;
        };
        if !self.session_active || guard.is_transitioning() {
            return TaskState::Unknown;
        }
        match self.probe.read(&binding.key) {
            Ok(Some(value)) => TaskState::from_completed(value),
            Ok(None) => TaskState::Unknown,
            Err(e) => {
                debug!(detector = %self.id, error = %e, "Progress unavailable for query");
                TaskState::Unknown
            }
        }
    }

    fn handle_event(&mut self, event: &SessionEvent, guard: &dyn TransitionGuard, sink: &mut ChangeSink) {
        match event {
            SessionEvent::SessionStarted { .. } => {
                self.session_active = true;
                self.last_poll = None;
            }
            SessionEvent::SessionEnded => {
                self.session_active = false;
                self.reported.clear();
            }
            SessionEvent::ContextChanged { context } => {
                trace!(detector = %self.id, context, "Context changed, repolling next tick");
                self.last_poll = None;
            }
            SessionEvent::Tick { now } => self.poll(*now, guard, sink),
            SessionEvent::ActivityCompleted { .. } => {
                warn!(detector = %self.id, "Unexpected event delivered");
            }
        }
    }

    fn on_reset(&mut self, reset: &ResetApplied) {
        for task_id in &reset.task_ids {
            if self.reported.remove(task_id).is_some() {
                debug!(detector = %self.id, task_id = %task_id, "Reported progress forgotten");
            }
        }
        self.last_poll = None;
    }

    fn dispose(&mut self, feed: &mut EventFeed) {
        let released = self.subscriptions.release(feed);
        if released > 0 {
            debug!(detector = %self.id, released, "Progress detector disposed");
        }
    }

    fn limitations(&self) -> Vec<DetectionLimitation> {
        self.bindings
            .iter()
            .map(|b| {
                DetectionLimitation::for_task(
                    b.task_id.clone(),
                    LimitationKind::RequiresSession,
                    "Progress is read only while a session is active",
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TransitionFlag;
    use crate::types::BoundaryId;
    use chrono::TimeZone;

    struct FailingProbe;

    impl ProgressProbe for FailingProbe {
        fn read(&self, _key: &str) -> Result<Option<bool>, ProbeError> {
            Err(ProbeError::Unavailable("offline".into()))
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn setup() -> (ProgressDetector, Arc<MemoryProbe>, TransitionFlag) {
        let probe = Arc::new(MemoryProbe::new());
        let detector = ProgressDetector::new(
            "progress",
            vec![ProgressBinding::new("weekly-challenge-log", "challenge_log_complete")],
            probe.clone(),
        );
        (detector, probe, TransitionFlag::new())
    }

    fn send(d: &mut ProgressDetector, guard: &TransitionFlag, event: SessionEvent) -> Vec<crate::detectors::TaskChange> {
        let mut sink = ChangeSink::new();
        d.handle_event(&event, guard, &mut sink);
        sink.into_changes()
    }

    #[test]
    fn tick_reports_probe_value_once() {
        let (mut d, probe, guard) = setup();
        probe.set("challenge_log_complete", true);
        send(&mut d, &guard, SessionEvent::SessionStarted { owner: None });

        let first = send(&mut d, &guard, SessionEvent::Tick { now: t(0) });
        let second = send(&mut d, &guard, SessionEvent::Tick { now: t(10) });

        assert_eq!(first.len(), 1);
        assert!(first[0].completed);
        assert!(second.is_empty());
    }

    #[test]
    fn no_polling_outside_a_session() {
        let (mut d, probe, guard) = setup();
        probe.set("challenge_log_complete", true);

        assert!(send(&mut d, &guard, SessionEvent::Tick { now: t(0) }).is_empty());
        assert_eq!(d.state("weekly-challenge-log", &guard), TaskState::Unknown);
    }

    #[test]
    fn transition_defers_poll_and_query() {
        let (mut d, probe, guard) = setup();
        probe.set("challenge_log_complete", true);
        send(&mut d, &guard, SessionEvent::SessionStarted { owner: None });
        guard.set(true);

        assert!(send(&mut d, &guard, SessionEvent::Tick { now: t(0) }).is_empty());
        assert_eq!(d.state("weekly-challenge-log", &guard), TaskState::Unknown);

        guard.set(false);
        assert_eq!(send(&mut d, &guard, SessionEvent::Tick { now: t(1) }).len(), 1);
        assert_eq!(d.state("weekly-challenge-log", &guard), TaskState::Complete);
    }

    #[test]
    fn polls_are_throttled() {
        let (mut d, probe, guard) = setup();
        send(&mut d, &guard, SessionEvent::SessionStarted { owner: None });
        send(&mut d, &guard, SessionEvent::Tick { now: t(0) });

        probe.set("challenge_log_complete", true);
        assert!(send(&mut d, &guard, SessionEvent::Tick { now: t(1) }).is_empty());
        assert_eq!(send(&mut d, &guard, SessionEvent::Tick { now: t(6) }).len(), 1);
    }

    #[test]
    fn context_change_forces_next_poll() {
        let (mut d, probe, guard) = setup();
        send(&mut d, &guard, SessionEvent::SessionStarted { owner: None });
        send(&mut d, &guard, SessionEvent::Tick { now: t(0) });
        probe.set("challenge_log_complete", true);
        send(&mut d, &guard, SessionEvent::ContextChanged { context: 7 });

        assert_eq!(send(&mut d, &guard, SessionEvent::Tick { now: t(1) }).len(), 1);
    }

    #[test]
    fn probe_failure_is_a_logged_no_op() {
        let mut d = ProgressDetector::new(
            "progress",
            vec![ProgressBinding::new("weekly-challenge-log", "challenge_log_complete")],
            Arc::new(FailingProbe),
        );
        let guard = TransitionFlag::new();
        send(&mut d, &guard, SessionEvent::SessionStarted { owner: None });

        assert!(send(&mut d, &guard, SessionEvent::Tick { now: t(0) }).is_empty());
        assert_eq!(d.state("weekly-challenge-log", &guard), TaskState::Unknown);
    }

    #[test]
    fn reset_forgets_reported_value() {
        let (mut d, probe, guard) = setup();
        probe.set("challenge_log_complete", true);
        send(&mut d, &guard, SessionEvent::SessionStarted { owner: None });
        send(&mut d, &guard, SessionEvent::Tick { now: t(0) });

        d.on_reset(&ResetApplied {
            boundary: BoundaryId::Weekly,
            at: t(1),
            task_ids: vec!["weekly-challenge-log".into()],
        });
        probe.set("challenge_log_complete", false);

        let changes = send(&mut d, &guard, SessionEvent::Tick { now: t(2) });
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].completed);
    }

    #[test]
    fn dispose_releases_all_four_subscriptions() {
        let (mut d, _probe, _guard) = setup();
        let mut feed = EventFeed::new();
        d.initialize(&mut feed).unwrap();
        assert_eq!(feed.subscription_count("progress"), 4);

        d.dispose(&mut feed);
        assert_eq!(feed.total_subscriptions(), 0);
    }
}
