//! Detection orchestrator.
//!
//! Owns the registered [`Detector`]s, the task id → detector map, and the
//! event feed they subscribe to. Events and resets are routed to detectors
//! synchronously; change notifications come back tagged with the originating
//! detector's identity.
//!
//! # Registration
//!
//! The first detector to claim a task id owns it. Later claims for the same
//! id are logged and skipped without failing the registration. If
//! `initialize` fails (or panics), everything the registration had started
//! is unwound: claimed ids, the change-notification wiring, and any
//! subscriptions the detector managed to make.
//!
//! # Failure Isolation
//!
//! A detector that panics while handling an event or a reset, or whose
//! change notification cannot be applied, is logged with its identity and
//! skipped. Other detectors keep running.
//!
//! # Disposal
//!
//! Change-notification wiring and event subscriptions are removed first,
//! then every detector is disposed, then the internal maps are cleared.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info, warn};

use crate::detectors::{ChangeSink, Detector, DetectorError};
use crate::events::{EventFeed, SessionEvent, TransitionFlag};
use crate::scheduler::ResetApplied;
use crate::types::{ChecklistState, DetectionLimitation, LimitationKind, TaskState};

/// A change notification attributed to the detector that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorChange {
    pub task_id: String,
    pub completed: bool,
    pub detector: String,
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub detector: String,
    /// Task ids now owned by this detector.
    pub claimed: Vec<String>,
    /// Task ids already owned by an earlier detector.
    pub skipped: Vec<String>,
}

/// Registry and router for detectors.
pub struct DetectionOrchestrator {
    feed: EventFeed,
    /// Detectors in registration order.
    detectors: Vec<Box<dyn Detector>>,
    /// Task id → owning detector id.
    owners: HashMap<String, String>,
    /// Detectors whose change notifications are forwarded.
    listeners: HashSet<String>,
    /// Detectors muted without being disposed.
    muted: HashSet<String>,
}

impl std::fmt::Debug for DetectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionOrchestrator")
            .field("detectors", &self.detector_ids())
            .field("owners", &self.owners)
            .field("muted", &self.muted)
            .finish_non_exhaustive()
    }
}

impl Default for DetectionOrchestrator {
    fn default() -> Self {
        Self::new(EventFeed::new())
    }
}

impl DetectionOrchestrator {
    #[must_use]
    pub fn new(feed: EventFeed) -> Self {
        Self {
            feed,
            detectors: Vec::new(),
            owners: HashMap::new(),
            listeners: HashSet::new(),
            muted: HashSet::new(),
        }
    }

    #[must_use]
    pub fn feed(&self) -> &EventFeed {
        &self.feed
    }

    #[must_use]
    pub fn transition_flag(&self) -> &TransitionFlag {
        self.feed.transition_flag()
    }

    #[must_use]
    pub fn detector_ids(&self) -> Vec<String> {
        self.detectors.iter().map(|d| d.id().to_string()).collect()
    }

    #[must_use]
    pub fn owner_of(&self, task_id: &str) -> Option<&str> {
        self.owners.get(task_id).map(String::as_str)
    }

    fn index_of(&self, detector_id: &str) -> Option<usize> {
        self.detectors.iter().position(|d| d.id() == detector_id)
    }

    /// Registers and initializes a detector.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::DuplicateDetector`] if the identity is taken,
    /// or [`DetectorError::Registration`] if `initialize` failed. In both
    /// cases the detector leaves no trace and existing detectors are
    /// unaffected.
    pub fn register(&mut self, mut detector: Box<dyn Detector>) -> Result<Registration, DetectorError> {
        let detector_id = detector.id().to_string();
        if self.index_of(&detector_id).is_some() {
            warn!(detector = %detector_id, "Detector already registered");
            return Err(DetectorError::DuplicateDetector(detector_id));
        }

        let mut claimed = Vec::new();
        let mut skipped = Vec::new();
        for task_id in detector.owned_tasks() {
            match self.owners.get(&task_id) {
                Some(existing) => {
                    warn!(
                        task_id = %task_id,
                        owner = %existing,
                        detector = %detector_id,
                        "Task already owned by another detector, claim ignored"
                    );
                    skipped.push(task_id);
                }
                None => {
                    self.owners.insert(task_id.clone(), detector_id.clone());
                    claimed.push(task_id);
                }
            }
        }

        self.listeners.insert(detector_id.clone());

        let feed = &mut self.feed;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.initialize(feed)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        if let Some(reason) = failure {
            for task_id in &claimed {
                self.owners.remove(task_id);
            }
            self.listeners.remove(&detector_id);
            let leaked = self.feed.unsubscribe_owner(&detector_id);
            error!(
                detector = %detector_id,
                reason = %reason,
                unwound_tasks = claimed.len(),
                unwound_subscriptions = leaked,
                "Detector registration failed"
            );
            return Err(DetectorError::Registration {
                detector: detector_id,
                reason,
            });
        }

        info!(
            detector = %detector_id,
            claimed = claimed.len(),
            skipped = skipped.len(),
            "Detector registered"
        );
        self.detectors.push(detector);

        Ok(Registration {
            detector: detector_id,
            claimed,
            skipped,
        })
    }

    fn is_active(&self, detector: &dyn Detector) -> bool {
        detector.is_enabled() && !self.muted.contains(detector.id())
    }

    /// Queries the owning detector for a task.
    ///
    /// Returns [`TaskState::Unknown`] when no detector owns the task or the
    /// owner is disabled or muted.
    #[must_use]
    pub fn state(&self, task_id: &str) -> TaskState {
        let Some(owner) = self.owners.get(task_id) else {
            return TaskState::Unknown;
        };
        let Some(detector) = self.detectors.iter().find(|d| d.id() == owner) else {
            return TaskState::Unknown;
        };
        if !self.is_active(detector.as_ref()) {
            return TaskState::Unknown;
        }

        let guard = self.feed.transition_flag();
        panic::catch_unwind(AssertUnwindSafe(|| detector.state(task_id, guard))).unwrap_or_else(|payload| {
            error!(
                detector = %owner,
                task_id = %task_id,
                panic = %panic_message(payload.as_ref()),
                "Detector panicked during state query"
            );
            TaskState::Unknown
        })
    }

    /// Routes one event to its subscribers and forwards their change
    /// notifications to `on_change`.
    ///
    /// Returns how many notifications `on_change` accepted.
    pub fn dispatch<F, E>(&mut self, event: &SessionEvent, mut on_change: F) -> usize
    where
        F: FnMut(&DetectorChange) -> Result<(), E>,
        E: Display,
    {
        let mut accepted = 0;

        for detector_id in self.feed.subscribers(event.kind()) {
            let Some(idx) = self.index_of(&detector_id) else {
                warn!(detector = %detector_id, "Subscription without a registered detector");
                continue;
            };
            if !self.is_active(self.detectors[idx].as_ref()) {
                continue;
            }

            let mut sink = ChangeSink::new();
            let guard = self.feed.transition_flag();
            let detector = &mut self.detectors[idx];
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.handle_event(event, guard, &mut sink)));
            if let Err(payload) = outcome {
                error!(
                    detector = %detector_id,
                    kind = ?event.kind(),
                    panic = %panic_message(payload.as_ref()),
                    "Detector panicked while handling event"
                );
                continue;
            }

            if !self.listeners.contains(&detector_id) {
                debug!(detector = %detector_id, "Change notifications not wired, dropped");
                continue;
            }

            for change in sink.into_changes() {
                if self.owners.get(&change.task_id) != Some(&detector_id) {
                    warn!(
                        detector = %detector_id,
                        task_id = %change.task_id,
                        "Change for a task this detector does not own, ignored"
                    );
                    continue;
                }
                let change = DetectorChange {
                    task_id: change.task_id,
                    completed: change.completed,
                    detector: detector_id.clone(),
                };
                match on_change(&change) {
                    Ok(()) => accepted += 1,
                    Err(e) => warn!(
                        detector = %change.detector,
                        task_id = %change.task_id,
                        error = %e,
                        "Change notification handling failed"
                    ),
                }
            }
        }

        accepted
    }

    /// Tells every detector which tasks a reset just cleared.
    ///
    /// Disabled and muted detectors are included so their counters never
    /// drift from the cleared state.
    pub fn notify_reset(&mut self, reset: &ResetApplied) {
        for detector in &mut self.detectors {
            let detector_id = detector.id().to_string();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.on_reset(reset)));
            if let Err(payload) = outcome {
                error!(
                    detector = %detector_id,
                    boundary = %reset.boundary,
                    panic = %panic_message(payload.as_ref()),
                    "Detector panicked while handling reset"
                );
            }
        }
    }

    /// Hands every detector the current checklist so its counters match it.
    pub fn sync(&mut self, state: &ChecklistState) {
        for detector in &mut self.detectors {
            let detector_id = detector.id().to_string();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| detector.sync(state))) {
                error!(
                    detector = %detector_id,
                    panic = %panic_message(payload.as_ref()),
                    "Detector panicked while syncing to checklist"
                );
            }
        }
    }

    /// Mutes or unmutes a detector without disposing it.
    pub fn set_muted(&mut self, detector_id: &str, muted: bool) -> Result<(), DetectorError> {
        if self.index_of(detector_id).is_none() {
            return Err(DetectorError::UnknownDetector(detector_id.to_string()));
        }
        if muted {
            self.muted.insert(detector_id.to_string());
        } else {
            self.muted.remove(detector_id);
        }
        info!(detector = %detector_id, muted, "Detector mute changed");
        Ok(())
    }

    /// Sets a detector's own enable flag.
    pub fn set_enabled(&mut self, detector_id: &str, enabled: bool) -> Result<(), DetectorError> {
        let idx = self
            .index_of(detector_id)
            .ok_or_else(|| DetectorError::UnknownDetector(detector_id.to_string()))?;
        self.detectors[idx].set_enabled(enabled);
        Ok(())
    }

    /// Detection limitations from every registered detector, plus one
    /// global entry per detector that is currently muted or disabled.
    #[must_use]
    pub fn limitations(&self) -> Vec<DetectionLimitation> {
        let mut all: Vec<DetectionLimitation> = self.detectors.iter().flat_map(|d| d.limitations()).collect();
        for detector in &self.detectors {
            if !self.is_active(detector.as_ref()) {
                all.push(DetectionLimitation::global(
                    LimitationKind::PartialCoverage,
                    format!("Detector '{}' is paused; its tasks need manual marking", detector.id()),
                ));
            }
        }
        all
    }

    /// Tears down every detector.
    ///
    /// Every event subscription and change-notification wire is removed
    /// before any detector's `dispose` runs, so nothing can be delivered into
    /// a half-disposed detector.
    pub fn dispose_all(&mut self) {
        self.listeners.clear();
        for detector in &self.detectors {
            self.feed.unsubscribe_owner(detector.id());
        }

        for detector in &mut self.detectors {
            let detector_id = detector.id().to_string();
            let feed = &mut self.feed;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| detector.dispose(feed))) {
                error!(
                    detector = %detector_id,
                    panic = %panic_message(payload.as_ref()),
                    "Detector panicked during dispose"
                );
            }
        }

        let count = self.detectors.len();
        self.detectors.clear();
        self.owners.clear();
        self.muted.clear();
        info!(detectors = count, "All detectors disposed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::{ActivityDetector, ActivityRule};
    use crate::events::{EventKind, TransitionGuard};
    use crate::types::BoundaryId;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    /// Test detector with scripted behaviour.
    struct Scripted {
        id: String,
        tasks: Vec<String>,
        fail_init: bool,
        panic_on_event: bool,
        enabled: bool,
        subscribed: Vec<crate::events::SubscriptionId>,
        resets: usize,
    }

    impl Scripted {
        fn new(id: &str, tasks: &[&str]) -> Self {
            Self {
                id: id.to_string(),
                tasks: tasks.iter().map(|t| t.to_string()).collect(),
                fail_init: false,
                panic_on_event: false,
                enabled: true,
                subscribed: Vec::new(),
                resets: 0,
            }
        }
    }

    impl Detector for Scripted {
        fn id(&self) -> &str {
            &self.id
        }
        fn owned_tasks(&self) -> Vec<String> {
            self.tasks.clone()
        }
        fn is_enabled(&self) -> bool {
            self.enabled
        }
        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }
        fn initialize(&mut self, feed: &mut EventFeed) -> Result<(), DetectorError> {
            self.subscribed.push(feed.subscribe(&self.id, EventKind::SessionEnded));
            if self.fail_init {
                return Err(DetectorError::Registration {
                    detector: self.id.clone(),
                    reason: "scripted failure".into(),
                });
            }
            Ok(())
        }
        fn state(&self, _task_id: &str, _guard: &dyn TransitionGuard) -> TaskState {
            TaskState::Complete
        }
        fn handle_event(&mut self, _event: &SessionEvent, _guard: &dyn TransitionGuard, sink: &mut ChangeSink) {
            if self.panic_on_event {
                panic!("scripted panic");
            }
            for task in &self.tasks {
                sink.notify(task.clone(), true);
            }
            sink.notify("not-mine", true);
        }
        fn on_reset(&mut self, _reset: &ResetApplied) {
            self.resets += 1;
        }
        fn dispose(&mut self, feed: &mut EventFeed) {
            for id in self.subscribed.drain(..) {
                feed.unsubscribe(id);
            }
        }
    }

    fn collect(orch: &mut DetectionOrchestrator, event: &SessionEvent) -> Vec<DetectorChange> {
        let mut changes = Vec::new();
        orch.dispatch(event, |c: &DetectorChange| {
            changes.push(c.clone());
            Ok::<(), String>(())
        });
        changes
    }

    #[test]
    fn first_registrant_wins_duplicate_task_ids() {
        let mut orch = DetectionOrchestrator::default();
        orch.register(Box::new(Scripted::new("a", &["t1", "t2"]))).unwrap();
        let reg = orch.register(Box::new(Scripted::new("b", &["t2", "t3"]))).unwrap();

        assert_eq!(reg.claimed, vec!["t3".to_string()]);
        assert_eq!(reg.skipped, vec!["t2".to_string()]);
        assert_eq!(orch.owner_of("t2"), Some("a"));
    }

    #[test]
    fn duplicate_detector_identity_rejected() {
        let mut orch = DetectionOrchestrator::default();
        orch.register(Box::new(Scripted::new("a", &["t1"]))).unwrap();
        let err = orch.register(Box::new(Scripted::new("a", &["t9"]))).unwrap_err();

        assert_eq!(err, DetectorError::DuplicateDetector("a".into()));
        assert_eq!(orch.owner_of("t9"), None);
    }

    #[test]
    fn failed_initialize_is_fully_unwound() {
        let mut orch = DetectionOrchestrator::default();
        let mut broken = Scripted::new("broken", &["t1"]);
        broken.fail_init = true;

        let err = orch.register(Box::new(broken)).unwrap_err();

        assert!(matches!(err, DetectorError::Registration { .. }));
        assert_eq!(orch.owner_of("t1"), None);
        assert_eq!(orch.state("t1"), TaskState::Unknown);
        assert_eq!(orch.feed().subscription_count("broken"), 0);
        assert!(orch.detector_ids().is_empty());
    }

    #[test]
    fn panicking_initialize_is_reported_as_registration_failure() {
        struct Exploding;
        impl Detector for Exploding {
            fn id(&self) -> &str {
                "exploding"
            }
            fn owned_tasks(&self) -> Vec<String> {
                vec!["t1".into()]
            }
            fn is_enabled(&self) -> bool {
                true
            }
            fn set_enabled(&mut self, _enabled: bool) {}
            fn initialize(&mut self, feed: &mut EventFeed) -> Result<(), DetectorError> {
                feed.subscribe("exploding", EventKind::Tick);
                panic!("boom");
            }
            fn state(&self, _: &str, _: &dyn TransitionGuard) -> TaskState {
                TaskState::Unknown
            }
            fn handle_event(&mut self, _: &SessionEvent, _: &dyn TransitionGuard, _: &mut ChangeSink) {}
            fn dispose(&mut self, _: &mut EventFeed) {}
        }

        let mut orch = DetectionOrchestrator::default();
        let err = orch.register(Box::new(Exploding)).unwrap_err();

        assert_eq!(
            err,
            DetectorError::Registration {
                detector: "exploding".into(),
                reason: "boom".into()
            }
        );
        assert_eq!(orch.feed().total_subscriptions(), 0);
    }

    #[test]
    fn muted_and_disabled_detectors_answer_unknown() {
        let mut orch = DetectionOrchestrator::default();
        orch.register(Box::new(Scripted::new("a", &["t1"]))).unwrap();
        assert_eq!(orch.state("t1"), TaskState::Complete);

        orch.set_muted("a", true).unwrap();
        assert_eq!(orch.state("t1"), TaskState::Unknown);
        orch.set_muted("a", false).unwrap();

        orch.set_enabled("a", false).unwrap();
        assert_eq!(orch.state("t1"), TaskState::Unknown);
    }

    #[test]
    fn set_muted_unknown_detector_errors() {
        let mut orch = DetectionOrchestrator::default();
        assert_eq!(
            orch.set_muted("ghost", true),
            Err(DetectorError::UnknownDetector("ghost".into()))
        );
    }

    #[test]
    fn dispatch_tags_changes_and_drops_foreign_tasks() {
        let mut orch = DetectionOrchestrator::default();
        orch.register(Box::new(Scripted::new("a", &["t1"]))).unwrap();

        let changes = collect(&mut orch, &SessionEvent::SessionEnded);

        assert_eq!(
            changes,
            vec![DetectorChange {
                task_id: "t1".into(),
                completed: true,
                detector: "a".into()
            }]
        );
    }

    #[test]
    fn panicking_detector_does_not_stop_others() {
        let mut orch = DetectionOrchestrator::default();
        let mut bad = Scripted::new("bad", &["t1"]);
        bad.panic_on_event = true;
        orch.register(Box::new(bad)).unwrap();
        orch.register(Box::new(Scripted::new("good", &["t2"]))).unwrap();

        let changes = collect(&mut orch, &SessionEvent::SessionEnded);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].detector, "good");
    }

    #[test]
    fn failing_change_handler_is_isolated() {
        let mut orch = DetectionOrchestrator::default();
        orch.register(Box::new(Scripted::new("a", &["t1", "t2"]))).unwrap();

        let mut seen = Vec::new();
        let accepted = orch.dispatch(&SessionEvent::SessionEnded, |c: &DetectorChange| {
            seen.push(c.task_id.clone());
            if c.task_id == "t1" {
                Err("rejected")
            } else {
                Ok(())
            }
        });

        assert_eq!(accepted, 1);
        assert_eq!(seen, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn reset_reaches_every_detector() {
        let mut orch = DetectionOrchestrator::default();
        orch.register(Box::new(ActivityDetector::new(
            "activity",
            vec![ActivityRule::new("t1", "act", 1)],
            Duration::from_secs(5),
        )))
        .unwrap();
        orch.dispatch(
            &SessionEvent::ActivityCompleted {
                activity: "act".into(),
                event_id: "e".into(),
                at: Utc.with_ymd_and_hms(2025, 3, 4, 1, 0, 0).unwrap(),
            },
            |_: &DetectorChange| Ok::<(), String>(()),
        );
        assert_eq!(orch.state("t1"), TaskState::Complete);

        orch.notify_reset(&ResetApplied {
            boundary: BoundaryId::Daily,
            at: Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap(),
            task_ids: vec!["t1".into()],
        });

        assert_eq!(orch.state("t1"), TaskState::Incomplete);
    }

    #[test]
    fn dispose_all_releases_everything() {
        let mut orch = DetectionOrchestrator::default();
        orch.register(Box::new(Scripted::new("a", &["t1"]))).unwrap();
        orch.register(Box::new(ActivityDetector::new(
            "activity",
            vec![ActivityRule::new("t2", "act", 1)],
            Duration::from_secs(5),
        )))
        .unwrap();

        orch.dispose_all();

        assert_eq!(orch.feed().total_subscriptions(), 0);
        assert!(orch.detector_ids().is_empty());
        assert_eq!(orch.state("t1"), TaskState::Unknown);
        assert!(collect(&mut orch, &SessionEvent::SessionEnded).is_empty());
    }

    #[test]
    fn limitations_are_aggregated() {
        let mut orch = DetectionOrchestrator::default();
        orch.register(Box::new(ActivityDetector::new(
            "activity",
            vec![ActivityRule::new("t1", "act", 3)],
            Duration::from_secs(5),
        )))
        .unwrap();

        assert_eq!(orch.limitations().len(), 1);

        orch.set_muted("activity", true).unwrap();
        let limitations = orch.limitations();
        assert_eq!(limitations.len(), 2);
        assert!(limitations
            .iter()
            .any(|l| l.task_id.is_none() && l.description.contains("'activity'")));
    }
}
