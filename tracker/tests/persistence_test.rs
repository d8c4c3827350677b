//! Integration tests for checklist persistence.
//!
//! Covers the debounced save path end to end: coalescing, snapshot
//! isolation, and the interaction between a pending save and shutdown.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

use dutyroll_tracker::catalog::Catalog;
use dutyroll_tracker::persistence::{LoadOrigin, PersistenceManager, DOCUMENT_FILE};
use dutyroll_tracker::types::ChecklistState;

// =============================================================================
// Test Helpers
// =============================================================================

const QUIET: Duration = Duration::from_millis(100);

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap()
}

fn fresh_state() -> ChecklistState {
    Catalog::builtin().default_state(Some("alice".into()))
}

fn complete(state: &mut ChecklistState, task_id: &str) {
    state.task_mut(task_id).unwrap().set_completed(true, now());
}

fn reload(dir: &TempDir) -> ChecklistState {
    PersistenceManager::new(dir.path()).load(&Catalog::builtin(), Some("alice"), Utc::now())
}

async fn wait_for_writes(store: &PersistenceManager, expected: usize) {
    let reached = timeout(Duration::from_secs(5), async {
        while store.write_count() < expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_ok!(reached, "expected {expected} writes, saw {}", store.write_count());
}

// =============================================================================
// Immediate Saves
// =============================================================================

#[test]
fn save_and_reload_preserve_completion() {
    let dir = TempDir::new().unwrap();
    let store = PersistenceManager::new(dir.path());
    let mut state = fresh_state();
    complete(&mut state, "daily-roulette");
    state.last_daily_reset = Some(now());

    assert_ok!(store.save(&state));

    let report = PersistenceManager::new(dir.path()).load_with_report(&Catalog::builtin(), Some("alice"), Utc::now());
    assert_eq!(report.origin, LoadOrigin::Document);
    assert!(report.discarded.is_empty());
    assert_eq!(report.state.tasks, state.tasks);
    assert_eq!(report.state.last_daily_reset, Some(now()));
}

#[test]
fn truncated_document_loads_defaults() {
    let dir = TempDir::new().unwrap();
    let store = PersistenceManager::new(dir.path());
    let mut state = fresh_state();
    complete(&mut state, "daily-roulette");
    store.save(&state).unwrap();

    let bytes = std::fs::read(store.path()).unwrap();
    std::fs::write(store.path(), &bytes[..bytes.len() / 2]).unwrap();

    let report = store.load_with_report(&Catalog::builtin(), Some("alice"), Utc::now());
    assert!(matches!(report.origin, LoadOrigin::Corrupt(_)));
    assert!(report.state.tasks.iter().all(|t| !t.completed));
    assert!(dir.path().join(format!("{DOCUMENT_FILE}.corrupt")).exists());
}

#[test]
fn save_into_unwritable_location_fails_without_damage() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"plain file").unwrap();

    let store = PersistenceManager::new(blocker.join("nested"));
    assert_err!(store.save(&fresh_state()));
    assert_eq!(std::fs::read(&blocker).unwrap(), b"plain file");
}

// =============================================================================
// Debounced Saves
// =============================================================================

#[tokio::test]
async fn burst_of_requests_produces_one_write() {
    let dir = TempDir::new().unwrap();
    let store = PersistenceManager::new(dir.path()).with_debounce(QUIET);
    let mut state = fresh_state();

    for task_id in ["daily-roulette", "daily-mini-lottery", "weekly-raid-clear"] {
        complete(&mut state, task_id);
        store.request_debounced_save(&state);
    }

    wait_for_writes(&store, 1).await;
    sleep(QUIET * 3).await;
    assert_eq!(store.write_count(), 1);

    let loaded = reload(&dir);
    assert_eq!(loaded.tasks, state.tasks);
}

#[tokio::test]
async fn flushed_document_matches_state_at_request_time() {
    let dir = TempDir::new().unwrap();
    let store = PersistenceManager::new(dir.path()).with_debounce(QUIET);
    let mut state = fresh_state();

    complete(&mut state, "daily-roulette");
    store.request_debounced_save(&state);
    // Mutated after the request, never requested again.
    complete(&mut state, "weekly-lottery");

    wait_for_writes(&store, 1).await;

    let loaded = reload(&dir);
    assert!(loaded.task("daily-roulette").unwrap().completed);
    assert!(!loaded.task("weekly-lottery").unwrap().completed);
}

#[tokio::test]
async fn requests_after_a_flush_start_a_new_quiet_period() {
    let dir = TempDir::new().unwrap();
    let store = PersistenceManager::new(dir.path()).with_debounce(QUIET);
    let mut state = fresh_state();

    store.request_debounced_save(&state);
    wait_for_writes(&store, 1).await;

    complete(&mut state, "daily-hunt-bills");
    store.request_debounced_save(&state);
    wait_for_writes(&store, 2).await;

    assert!(reload(&dir).task("daily-hunt-bills").unwrap().completed);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn shutdown_cancels_pending_save_and_final_state_wins() {
    let dir = TempDir::new().unwrap();
    let mut store = PersistenceManager::new(dir.path()).with_debounce(Duration::from_secs(30));
    let mut state = fresh_state();

    complete(&mut state, "daily-roulette");
    store.request_debounced_save(&state);
    complete(&mut state, "weekly-custom-deliveries");

    let result = timeout(Duration::from_secs(5), store.shutdown(&state)).await;
    assert_ok!(assert_ok!(result));

    assert_eq!(store.write_count(), 1);
    let loaded = reload(&dir);
    assert!(loaded.task("daily-roulette").unwrap().completed);
    assert!(loaded.task("weekly-custom-deliveries").unwrap().completed);
}

#[tokio::test]
async fn shutdown_after_flush_writes_once_more() {
    let dir = TempDir::new().unwrap();
    let mut store = PersistenceManager::new(dir.path()).with_debounce(QUIET);
    let mut state = fresh_state();

    store.request_debounced_save(&state);
    wait_for_writes(&store, 1).await;

    complete(&mut state, "weekly-challenge-log");
    assert_ok!(store.shutdown(&state).await);

    assert_eq!(store.write_count(), 2);
    assert!(reload(&dir).task("weekly-challenge-log").unwrap().completed);
}

#[tokio::test]
async fn requests_after_shutdown_write_immediately() {
    let dir = TempDir::new().unwrap();
    let mut store = PersistenceManager::new(dir.path()).with_debounce(QUIET);
    let mut state = fresh_state();
    assert_ok!(store.shutdown(&state).await);

    complete(&mut state, "daily-tribal-quests");
    store.request_debounced_save(&state);

    assert_eq!(store.write_count(), 2);
    assert!(reload(&dir).task("daily-tribal-quests").unwrap().completed);
}
