//! DutyRoll Tracker - recurring task checklist for a live session.
//!
//! # Commands
//!
//! - `dutyroll-tracker run`: Track a session fed as JSON lines on stdin
//! - `dutyroll-tracker status`: Print the saved checklist
//! - `dutyroll-tracker reset <daily|weekly|all>`: Clear a category
//! - `dutyroll-tracker defaults`: Reset the checklist to catalog defaults
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.
//!
//! [`config`]: dutyroll_tracker::config

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use dutyroll_tracker::catalog::Catalog;
use dutyroll_tracker::config::Config;
use dutyroll_tracker::detectors::MemoryProbe;
use dutyroll_tracker::events::{EventFeed, SessionEvent, TransitionFlag};
use dutyroll_tracker::persistence::PersistenceManager;
use dutyroll_tracker::scheduler::ResetScheduler;
use dutyroll_tracker::tracker::{ChecklistTracker, UserAction};
use dutyroll_tracker::types::{Category, ChecklistState};

/// DutyRoll Tracker - recurring daily and weekly task checklist.
///
/// Infers completion from session events where possible, resets tasks at
/// their daily and weekly boundaries, and keeps the checklist on disk.
#[derive(Parser, Debug)]
#[command(name = "dutyroll-tracker")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    DUTYROLL_DATA_DIR          Checklist directory (default: ~/.dutyroll)
    DUTYROLL_OWNER             Session owner identity
    DUTYROLL_SAVE_DEBOUNCE_MS  Debounced save quiet period (default: 2000)
    DUTYROLL_TICK_MS           Reset check period (default: 1000)
    DUTYROLL_DEDUPE_WINDOW_MS  Duplicate completion window (default: 5000)
    DUTYROLL_DAILY_RESET       Daily boundary, UTC HH:MM (default: 15:00)
    DUTYROLL_WEEKLY_RESET      Weekly boundary, UTC DDD HH:MM (default: tue 08:00)

EXAMPLES:
    # Track a session, one JSON event per line
    host-session --events | dutyroll-tracker run

    # Show the checklist
    dutyroll-tracker status

    # Track a session with JSON logs
    host-session --events | dutyroll-tracker --log-json run

    # Clear all weekly tasks
    dutyroll-tracker reset weekly
")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Track a live session.
    ///
    /// Reads one JSON object per line from stdin: session events
    /// (`{"type": "activity_completed", ...}`), control lines
    /// (`{"type": "probe", ...}`, `{"type": "transition", ...}`), or user
    /// actions (`{"action": "toggle", "taskId": ...}`).
    Run,

    /// Print the saved checklist.
    Status {
        /// Print tasks as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Clear every task in a category.
    Reset {
        #[arg(value_enum)]
        scope: ResetScope,
    },

    /// Replace the checklist with catalog defaults.
    Defaults,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ResetScope {
    Daily,
    Weekly,
    All,
}

/// Host control lines accepted alongside session events.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlLine {
    /// Publishes an externally-owned progress reading.
    Probe { key: String, value: Option<bool> },
    /// Raises or lowers the transition-safety flag.
    Transition { active: bool },
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum HostLine {
    Control(ControlLine),
    Action(UserAction),
    Event(SessionEvent),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Command::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_tracker())
        }
        Command::Status { json } => run_status(json),
        Command::Reset { scope } => run_reset(scope),
        Command::Defaults => run_defaults(),
    }
}

/// Builds a tracker without detectors or debouncing, for one-shot commands.
fn offline_tracker(config: &Config, now: DateTime<Utc>) -> ChecklistTracker {
    let catalog = Catalog::builtin();
    let scheduler = ResetScheduler::new(&catalog, config.daily_reset, config.weekly_reset);
    ChecklistTracker::new(
        catalog,
        scheduler,
        PersistenceManager::new(&config.data_dir),
        EventFeed::new(),
        config.owner.as_deref(),
        now,
    )
}

/// Prints the saved checklist, applying any resets that have elapsed.
fn run_status(json: bool) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let now = Utc::now();
    let mut tracker = offline_tracker(&config, now);
    // Without a debouncer, any reset applied here is written straight away.
    tracker.tick(now);

    if json {
        let out = serde_json::to_string_pretty(&tracker.state().tasks).context("Failed to serialize tasks")?;
        println!("{out}");
        return Ok(());
    }

    print_checklist(&tracker, now);
    Ok(())
}

fn print_checklist(tracker: &ChecklistTracker, now: DateTime<Utc>) {
    let state = tracker.state();
    if let Some(owner) = &state.owner {
        println!("Owner: {owner}");
    }

    for category in [Category::Daily, Category::Weekly] {
        let total = state.tasks.iter().filter(|t| t.category == category).count();
        println!();
        println!("{category} ({}/{total})", state.completed_count(category));
        for task in state.tasks.iter().filter(|t| t.category == category) {
            let mark = if task.completed { "x" } else { " " };
            let name = tracker
                .catalog()
                .get(&task.id)
                .map_or(task.id.as_str(), |def| def.name.as_str());
            let manual = if task.manual_override { " (manual)" } else { "" };
            println!("  [{mark}] {name}{manual}");
        }
    }

    println!();
    println!("Next resets:");
    for (boundary, at) in tracker.upcoming_resets(now) {
        let label = boundary.to_string();
        println!("  {label:<28} {}", at.format("%a %Y-%m-%d %H:%M UTC"));
    }

    let limitations = tracker.limitations();
    if !limitations.is_empty() {
        println!();
        println!("Detection limitations:");
        for limitation in limitations {
            let scope = limitation.task_id.as_deref().unwrap_or("all");
            println!("  {scope}: {}", limitation.description);
        }
    }
}

/// Clears a category and saves immediately.
fn run_reset(scope: ResetScope) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let now = Utc::now();
    let mut tracker = offline_tracker(&config, now);

    let categories: &[Category] = match scope {
        ResetScope::Daily => &[Category::Daily],
        ResetScope::Weekly => &[Category::Weekly],
        ResetScope::All => &[Category::Daily, Category::Weekly],
    };
    let mut cleared = 0;
    for category in categories {
        cleared += tracker.reset_category(*category, now).len();
    }
    tracker.save_now().context("Failed to save checklist")?;

    println!("Cleared {cleared} tasks.");
    Ok(())
}

/// Resets the checklist to catalog defaults and saves immediately.
fn run_defaults() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let now = Utc::now();
    let mut tracker = offline_tracker(&config, now);

    tracker.reset_to_defaults(now);
    tracker.save_now().context("Failed to save checklist")?;

    println!("Checklist reset to defaults.");
    Ok(())
}

/// Runs the tracker against a session fed on stdin.
async fn run_tracker() -> Result<()> {
    info!("Starting DutyRoll tracker");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        data_dir = %config.data_dir.display(),
        owner = ?config.owner,
        daily_reset = %config.daily_reset,
        weekly_reset = %config.weekly_reset,
        "Configuration loaded"
    );

    let probe = Arc::new(MemoryProbe::new());
    let mut tracker = ChecklistTracker::from_config(&config, probe.clone(), Utc::now());
    let transition = tracker.transition_flag();
    log_summary(tracker.state());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("Tracker running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received");
                break;
            }

            _ = ticker.tick() => {
                tracker.tick(Utc::now());
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(&mut tracker, &probe, &transition, &line),
                    Ok(None) => {
                        info!("Event stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read event stream");
                        break;
                    }
                }
            }
        }
    }

    info!("Shutting down...");
    if let Err(e) = tracker.shutdown().await {
        error!(error = %e, "Final save failed");
        return Err(e).context("Failed to save checklist on shutdown");
    }

    log_summary(tracker.state());
    info!("Tracker stopped");
    Ok(())
}

/// Applies one stdin line to the tracker.
fn handle_line(tracker: &mut ChecklistTracker, probe: &MemoryProbe, transition: &TransitionFlag, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<HostLine>(line) {
        Ok(HostLine::Event(event)) => {
            let applied = tracker.handle_event(&event, Utc::now());
            debug!(kind = ?event.kind(), applied, "Session event handled");
        }
        Ok(HostLine::Control(ControlLine::Probe { key, value })) => {
            match value {
                Some(value) => probe.set(&key, value),
                None => probe.remove(&key),
            }
            debug!(key = %key, value = ?value, "Probe reading updated");
        }
        Ok(HostLine::Control(ControlLine::Transition { active })) => {
            transition.set(active);
            debug!(active, "Transition flag updated");
        }
        Ok(HostLine::Action(action)) => {
            if let Err(e) = tracker.apply_action(&action, Utc::now()) {
                warn!(error = %e, action = ?action, "User action rejected");
            }
        }
        Err(e) => {
            warn!(error = %e, "Ignoring unrecognized input line");
        }
    }
}

fn log_summary(state: &ChecklistState) {
    info!(
        daily_done = state.completed_count(Category::Daily),
        weekly_done = state.completed_count(Category::Weekly),
        tasks = state.tasks.len(),
        "Checklist summary"
    );
}

/// Initializes the logging subsystem.
///
/// Logs go to stderr so stdout stays clean for command output. With `json`
/// set, each record is one JSON object, for hosts that collect logs.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        let json_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_file(false)
            .with_line_number(false);

        tracing_subscriber::registry().with(filter).with(json_layer).init();
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// If a handler cannot be installed that signal is never reported; the
/// other one and end of input still stop the tracker.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_lines_parse_before_events() {
        let probe: HostLine = serde_json::from_str(r#"{"type": "probe", "key": "challenge_log_complete", "value": true}"#).unwrap();
        assert!(matches!(
            probe,
            HostLine::Control(ControlLine::Probe { ref key, value: Some(true) }) if key == "challenge_log_complete"
        ));

        let transition: HostLine = serde_json::from_str(r#"{"type": "transition", "active": false}"#).unwrap();
        assert!(matches!(transition, HostLine::Control(ControlLine::Transition { active: false })));

        let event: HostLine = serde_json::from_str(r#"{"type": "context_changed", "context": 7}"#).unwrap();
        assert!(matches!(
            event,
            HostLine::Event(SessionEvent::ContextChanged { context: 7 })
        ));
    }

    #[test]
    fn unknown_line_is_rejected() {
        assert!(serde_json::from_str::<HostLine>(r#"{"type": "launch_rocket"}"#).is_err());
    }

    #[test]
    fn user_action_lines_parse() {
        let line: HostLine = serde_json::from_str(r#"{"action": "toggle", "taskId": "daily-roulette"}"#).unwrap();
        assert!(matches!(
            line,
            HostLine::Action(UserAction::Toggle { ref task_id }) if task_id == "daily-roulette"
        ));

        let line: HostLine = serde_json::from_str(r#"{"action": "mute_detector", "detector": "progress", "muted": true}"#).unwrap();
        assert!(matches!(line, HostLine::Action(UserAction::MuteDetector { muted: true, .. })));

        assert!(serde_json::from_str::<HostLine>(r#"{"action": "explode"}"#).is_err());
    }

    #[test]
    fn cli_accepts_global_log_flag() {
        let cli = Cli::try_parse_from(["dutyroll-tracker", "reset", "weekly", "--log-json"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::Reset { scope: ResetScope::Weekly }));
    }
}
