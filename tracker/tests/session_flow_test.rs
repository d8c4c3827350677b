//! End-to-end tests of a tracked session.
//!
//! These tests build the tracker the way the binary does, feed it host
//! events, shut it down, and check what a later session sees on disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serial_test::serial;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use dutyroll_tracker::catalog::Catalog;
use dutyroll_tracker::config::Config;
use dutyroll_tracker::detectors::MemoryProbe;
use dutyroll_tracker::events::SessionEvent;
use dutyroll_tracker::persistence::PersistenceManager;
use dutyroll_tracker::scheduler::BoundaryRule;
use dutyroll_tracker::tracker::{ChangeError, ChecklistTracker};
use dutyroll_tracker::types::{ChecklistState, DetectionMode, TaskState};

// =============================================================================
// Test Helpers
// =============================================================================

/// Seconds after Tuesday 2025-03-04 12:00 UTC.
fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn config(dir: &TempDir) -> Config {
    Config {
        data_dir: dir.path().to_path_buf(),
        owner: Some("alice".into()),
        save_debounce: Duration::from_millis(50),
        tick_interval: Duration::from_millis(100),
        dedupe_window: Duration::from_secs(5),
        daily_reset: BoundaryRule::parse_daily("15:00").unwrap(),
        weekly_reset: BoundaryRule::parse_weekly("tue 08:00").unwrap(),
    }
}

fn event(json: &str) -> SessionEvent {
    serde_json::from_str(json).unwrap()
}

fn stored(dir: &TempDir, owner: &str) -> ChecklistState {
    PersistenceManager::new(dir.path()).load(&Catalog::builtin(), Some(owner), Utc::now())
}

fn completed(state: &ChecklistState, task_id: &str) -> bool {
    state.task(task_id).unwrap().completed
}

/// Environment variables read by `Config::from_env`.
const CONFIG_VARS: &[&str] = &[
    "DUTYROLL_DATA_DIR",
    "DUTYROLL_OWNER",
    "DUTYROLL_SAVE_DEBOUNCE_MS",
    "DUTYROLL_TICK_MS",
    "DUTYROLL_DEDUPE_WINDOW_MS",
    "DUTYROLL_DAILY_RESET",
    "DUTYROLL_WEEKLY_RESET",
];

fn clear_config_env() {
    for var in CONFIG_VARS {
        std::env::remove_var(var);
    }
}

// =============================================================================
// Session Lifecycle
// =============================================================================

#[tokio::test]
async fn session_progress_survives_restart() {
    let dir = TempDir::new().unwrap();
    let probe = Arc::new(MemoryProbe::new());
    let mut tracker = ChecklistTracker::from_config(&config(&dir), probe.clone(), t(0));
    tracker.tick(t(0));

    tracker.handle_event(&event(r#"{"type": "session_started", "owner": "alice"}"#), t(1));
    tracker.handle_event(
        &event(r#"{"type": "activity_completed", "activity": "duty_roulette", "eventId": "dr-1", "at": "2025-03-04T12:00:02Z"}"#),
        t(2),
    );
    tracker.handle_event(
        &event(r#"{"type": "activity_completed", "activity": "raid_clear", "eventId": "rc-1", "at": "2025-03-04T12:00:03Z"}"#),
        t(3),
    );
    probe.set("challenge_log_complete", true);
    tracker.tick(t(4));
    assert_ok!(tracker.toggle_manual("daily-hunt-bills", t(5)));

    assert!(completed(tracker.state(), "weekly-challenge-log"));

    assert_ok!(tracker.shutdown().await);

    let state = stored(&dir, "alice");
    for task_id in ["daily-roulette", "weekly-raid-clear", "weekly-challenge-log", "daily-hunt-bills"] {
        assert!(completed(&state, task_id), "{task_id} should be persisted as complete");
    }
    assert!(!completed(&state, "daily-mini-lottery"));
    assert_eq!(state.owner.as_deref(), Some("alice"));
}

#[tokio::test]
async fn next_session_applies_elapsed_daily_reset() {
    let dir = TempDir::new().unwrap();
    let probe = Arc::new(MemoryProbe::new());

    let mut first = ChecklistTracker::from_config(&config(&dir), probe.clone(), t(0));
    first.tick(t(0));
    first.toggle_manual("daily-roulette", t(1)).unwrap();
    first.toggle_manual("weekly-raid-clear", t(1)).unwrap();
    assert_ok!(first.shutdown().await);

    // Next day, after 15:00 but before the next weekly boundary.
    let later = Utc.with_ymd_and_hms(2025, 3, 5, 16, 0, 0).unwrap();
    let mut second = ChecklistTracker::from_config(&config(&dir), probe, later);
    assert!(completed(second.state(), "daily-roulette"));

    let resets = second.tick(later);
    assert!(!resets.is_empty());
    assert!(!completed(second.state(), "daily-roulette"));
    assert!(completed(second.state(), "weekly-raid-clear"));

    assert_ok!(second.shutdown().await);
    let state = stored(&dir, "alice");
    assert!(!completed(&state, "daily-roulette"));
    assert_eq!(state.last_daily_reset, Some(later));
}

#[tokio::test]
async fn detected_completion_survives_restart_and_mode_changes() {
    let dir = TempDir::new().unwrap();
    let probe = Arc::new(MemoryProbe::new());

    let mut first = ChecklistTracker::from_config(&config(&dir), probe.clone(), t(0));
    first.tick(t(0));
    first.handle_event(&event(r#"{"type": "session_started", "owner": "alice"}"#), t(1));
    first.handle_event(
        &event(r#"{"type": "activity_completed", "activity": "duty_roulette", "eventId": "dr-1", "at": "2025-03-04T12:00:02Z"}"#),
        t(2),
    );
    assert_ok!(first.toggle_manual("weekly-raid-clear", t(3)));
    assert_ok!(first.shutdown().await);

    let mut second = ChecklistTracker::from_config(&config(&dir), probe, t(10));
    second.tick(t(10));
    assert_eq!(second.detector_state("daily-roulette"), TaskState::Complete);
    assert_eq!(second.detector_state("weekly-raid-clear"), TaskState::Incomplete);

    // Re-selecting automatic detection must not clear a finished task.
    assert_ok!(second.set_detection_mode("daily-roulette", DetectionMode::Auto, t(11)));
    assert!(completed(second.state(), "daily-roulette"));

    // An override switched on and off falls back to the detector.
    assert_ok!(second.toggle_manual("daily-roulette", t(12)));
    assert_ok!(second.toggle_manual("daily-roulette", t(13)));
    assert!(completed(second.state(), "daily-roulette"));

    // A task completed only by override has nothing to fall back to.
    assert!(!assert_ok!(second.toggle_manual("weekly-raid-clear", t(14))));

    assert_ok!(second.shutdown().await);
    let state = stored(&dir, "alice");
    assert!(completed(&state, "daily-roulette"));
    assert!(!completed(&state, "weekly-raid-clear"));
}

#[tokio::test]
async fn shutdown_releases_detectors_and_rejects_changes() {
    let dir = TempDir::new().unwrap();
    let mut tracker = ChecklistTracker::from_config(&config(&dir), Arc::new(MemoryProbe::new()), t(0));
    assert_eq!(tracker.orchestrator().detector_ids(), vec!["activity".to_string(), "progress".to_string()]);
    assert!(tracker.orchestrator().feed().total_subscriptions() > 0);

    assert_ok!(tracker.shutdown().await);

    assert!(tracker.orchestrator().detector_ids().is_empty());
    assert_eq!(tracker.orchestrator().feed().total_subscriptions(), 0);
    assert_eq!(
        assert_err!(tracker.toggle_manual("daily-roulette", t(1))),
        ChangeError::ShutDown
    );
    assert_eq!(
        tracker.handle_event(
            &event(r#"{"type": "activity_completed", "activity": "duty_roulette", "eventId": "late", "at": "2025-03-04T12:00:09Z"}"#),
            t(9),
        ),
        0
    );
    // A second shutdown is a no-op.
    assert_ok!(tracker.shutdown().await);
}

// =============================================================================
// Owner Identity
// =============================================================================

#[tokio::test]
async fn owner_change_switches_checklist() {
    let dir = TempDir::new().unwrap();
    let mut tracker = ChecklistTracker::from_config(&config(&dir), Arc::new(MemoryProbe::new()), t(0));
    tracker.tick(t(0));
    tracker.toggle_manual("daily-roulette", t(1)).unwrap();

    tracker.handle_event(&event(r#"{"type": "session_started", "owner": "bob"}"#), t(2));

    assert_eq!(tracker.state().owner.as_deref(), Some("bob"));
    assert!(!completed(tracker.state(), "daily-roulette"));

    tracker.toggle_manual("weekly-raid-clear", t(3)).unwrap();
    assert_ok!(tracker.shutdown().await);

    let bob = stored(&dir, "bob");
    assert!(completed(&bob, "weekly-raid-clear"));
    assert!(!completed(&bob, "daily-roulette"));

    // The document now belongs to bob, so alice starts from defaults.
    let alice = stored(&dir, "alice");
    assert!(alice.tasks.iter().all(|t| !t.completed));
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
#[serial]
async fn tracker_from_environment_configuration() {
    let dir = TempDir::new().unwrap();
    clear_config_env();
    std::env::set_var("DUTYROLL_DATA_DIR", dir.path());
    std::env::set_var("DUTYROLL_OWNER", "carol");
    std::env::set_var("DUTYROLL_SAVE_DEBOUNCE_MS", "20");
    std::env::set_var("DUTYROLL_DAILY_RESET", "04:30");

    let config = Config::from_env();
    clear_config_env();
    let config = assert_ok!(config);
    assert_eq!(config.daily_reset, BoundaryRule::daily(4, 30).unwrap());

    let mut tracker = ChecklistTracker::from_config(&config, Arc::new(MemoryProbe::new()), t(0));
    tracker.tick(t(0));
    tracker.toggle_manual("daily-mini-lottery", t(1)).unwrap();
    assert_ok!(tracker.shutdown().await);

    let state = stored(&dir, "carol");
    assert_eq!(state.owner.as_deref(), Some("carol"));
    assert!(completed(&state, "daily-mini-lottery"));
}

#[test]
#[serial]
fn invalid_environment_is_rejected() {
    clear_config_env();
    std::env::set_var("DUTYROLL_DATA_DIR", "/tmp/dutyroll-test");
    std::env::set_var("DUTYROLL_WEEKLY_RESET", "someday 25:00");

    let result = Config::from_env();
    clear_config_env();

    let err = assert_err!(result);
    assert!(err.to_string().contains("DUTYROLL_WEEKLY_RESET"));
}
