//! Reset scheduler for recurring time boundaries.
//!
//! Every boundary is a small state machine: a [`BoundaryRule`] that knows when
//! the next occurrence falls, a scope of task ids it clears, and a
//! last-applied timestamp stored in [`ChecklistState`].
//!
//! # Boundaries
//!
//! - **Daily**: fixed UTC time every day, scoped to daily tasks without a
//!   dedicated cadence.
//! - **Weekly**: fixed UTC weekday + time, scoped to weekly tasks without a
//!   dedicated cadence.
//! - **Dedicated**: one per task whose cadence diverges from its category.
//!   Such a task is never in the scope of its category's generic boundary.
//!
//! # Example
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use dutyroll_tracker::scheduler::BoundaryRule;
//!
//! let rule = BoundaryRule::daily(15, 0).unwrap();
//! let last = Utc.with_ymd_and_hms(2025, 3, 3, 15, 0, 0).unwrap();
//!
//! assert!(!rule.has_elapsed_since(Some(last), Utc.with_ymd_and_hms(2025, 3, 4, 14, 59, 59).unwrap()));
//! assert!(rule.has_elapsed_since(Some(last), Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 1).unwrap()));
//! ```

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{Cadence, Catalog};
use crate::types::{BoundaryId, Category, ChecklistState};

/// Errors from parsing or constructing a boundary rule.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("hour must be 0-23, got {0}")]
    InvalidHour(u32),

    #[error("minute must be 0-59, got {0}")]
    InvalidMinute(u32),

    #[error("expected HH:MM, got '{0}'")]
    InvalidTime(String),

    #[error("expected a weekday followed by HH:MM, got '{0}'")]
    InvalidWeekly(String),
}

/// When a boundary recurs. All times are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryRule {
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
}

impl BoundaryRule {
    /// A boundary at `hour:minute` UTC every day.
    pub fn daily(hour: u32, minute: u32) -> Result<Self, RuleError> {
        validate(hour, minute)?;
        Ok(Self::Daily { hour, minute })
    }

    /// A boundary at `hour:minute` UTC every `weekday`.
    pub fn weekly(weekday: Weekday, hour: u32, minute: u32) -> Result<Self, RuleError> {
        validate(hour, minute)?;
        Ok(Self::Weekly {
            weekday,
            hour,
            minute,
        })
    }

    /// Parses `HH:MM` into a daily rule.
    pub fn parse_daily(input: &str) -> Result<Self, RuleError> {
        let (hour, minute) = parse_hh_mm(input.trim())?;
        Self::daily(hour, minute)
    }

    /// Parses `<weekday> HH:MM` (e.g. `tue 08:00`) into a weekly rule.
    pub fn parse_weekly(input: &str) -> Result<Self, RuleError> {
        let mut parts = input.split_whitespace();
        let (Some(day), Some(time), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RuleError::InvalidWeekly(input.to_string()));
        };
        let weekday = day
            .parse::<Weekday>()
            .map_err(|_| RuleError::InvalidWeekly(input.to_string()))?;
        let (hour, minute) = parse_hh_mm(time)?;
        Self::weekly(weekday, hour, minute)
    }

    fn period(&self) -> Duration {
        match self {
            Self::Daily { .. } => Duration::days(1),
            Self::Weekly { .. } => Duration::days(7),
        }
    }

    /// The first occurrence strictly after `now`.
    ///
    /// Deterministic: the same `now` always yields the same instant.
    #[must_use]
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::default()));

        let (days_ahead, hour, minute) = match *self {
            Self::Daily { hour, minute } => (0, hour, minute),
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let target = weekday.num_days_from_monday();
                let today = now.weekday().num_days_from_monday();
                ((target + 7 - today) % 7, hour, minute)
            }
        };

        let candidate = midnight
            + Duration::days(i64::from(days_ahead))
            + Duration::hours(i64::from(hour))
            + Duration::minutes(i64::from(minute));

        if candidate > now {
            candidate
        } else {
            candidate + self.period()
        }
    }

    /// The most recent occurrence at or before `now`.
    #[must_use]
    pub fn previous_occurrence(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.next_occurrence(now) - self.period()
    }

    /// True iff at least one occurrence falls within `(last_applied, now]`.
    ///
    /// A boundary that was never applied has always elapsed.
    #[must_use]
    pub fn has_elapsed_since(&self, last_applied: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_applied {
            None => true,
            Some(last) => self.next_occurrence(last) <= now,
        }
    }
}

impl fmt::Display for BoundaryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily { hour, minute } => write!(f, "daily {hour:02}:{minute:02} UTC"),
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "{weekday} {hour:02}:{minute:02} UTC"),
        }
    }
}

fn validate(hour: u32, minute: u32) -> Result<(), RuleError> {
    if hour > 23 {
        return Err(RuleError::InvalidHour(hour));
    }
    if minute > 59 {
        return Err(RuleError::InvalidMinute(minute));
    }
    Ok(())
}

fn parse_hh_mm(input: &str) -> Result<(u32, u32), RuleError> {
    let (h, m) = input
        .split_once(':')
        .ok_or_else(|| RuleError::InvalidTime(input.to_string()))?;
    let hour = h
        .parse::<u32>()
        .map_err(|_| RuleError::InvalidTime(input.to_string()))?;
    let minute = m
        .parse::<u32>()
        .map_err(|_| RuleError::InvalidTime(input.to_string()))?;
    Ok((hour, minute))
}

/// A boundary rule bound to the tasks it clears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary {
    pub id: BoundaryId,
    pub rule: BoundaryRule,
    /// Task ids cleared when this boundary elapses.
    pub scope: Vec<String>,
}

/// Emitted after a boundary clears its scope.
///
/// Detectors use it to re-zero internal counters for exactly these tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetApplied {
    pub boundary: BoundaryId,
    pub at: DateTime<Utc>,
    pub task_ids: Vec<String>,
}

/// Applies recurring resets to the checklist.
#[derive(Debug, Clone)]
pub struct ResetScheduler {
    boundaries: Vec<Boundary>,
}

impl ResetScheduler {
    /// Builds one boundary per generic category plus one per dedicated cadence.
    #[must_use]
    pub fn new(catalog: &Catalog, daily: BoundaryRule, weekly: BoundaryRule) -> Self {
        let mut daily_scope = Vec::new();
        let mut weekly_scope = Vec::new();
        let mut dedicated = Vec::new();

        for def in catalog.definitions() {
            match def.cadence {
                Cadence::Category => match def.category {
                    Category::Daily => daily_scope.push(def.id.clone()),
                    Category::Weekly => weekly_scope.push(def.id.clone()),
                },
                Cadence::Dedicated(rule) => dedicated.push(Boundary {
                    id: BoundaryId::Dedicated(def.id.clone()),
                    rule,
                    scope: vec![def.id.clone()],
                }),
            }
        }

        let mut boundaries = vec![
            Boundary {
                id: BoundaryId::Daily,
                rule: daily,
                scope: daily_scope,
            },
            Boundary {
                id: BoundaryId::Weekly,
                rule: weekly,
                scope: weekly_scope,
            },
        ];
        boundaries.extend(dedicated);

        Self { boundaries }
    }

    #[must_use]
    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    #[must_use]
    pub fn boundary(&self, id: &BoundaryId) -> Option<&Boundary> {
        self.boundaries.iter().find(|b| &b.id == id)
    }

    /// Runs one periodic check against every boundary.
    ///
    /// Each elapsed boundary clears `completed` and `manual_override` for the
    /// tasks in its scope and advances its own timestamp to `now`.
    pub fn check(&self, state: &mut ChecklistState, now: DateTime<Utc>) -> Vec<ResetApplied> {
        let mut applied = Vec::new();

        for boundary in &self.boundaries {
            let last = state.last_reset(&boundary.id);
            if !boundary.rule.has_elapsed_since(last, now) {
                continue;
            }

            let mut cleared = Vec::with_capacity(boundary.scope.len());
            for task_id in &boundary.scope {
                if let Some(task) = state.task_mut(task_id) {
                    task.clear();
                    cleared.push(task_id.clone());
                }
            }
            state.set_last_reset(&boundary.id, now);

            info!(
                boundary = %boundary.id,
                rule = %boundary.rule,
                previous = ?last,
                tasks = cleared.len(),
                "Reset boundary applied"
            );

            applied.push(ResetApplied {
                boundary: boundary.id.clone(),
                at: now,
                task_ids: cleared,
            });
        }

        if applied.is_empty() {
            debug!(now = %now, "No reset boundary elapsed");
        }

        applied
    }

    /// Next occurrence of every boundary, for display.
    #[must_use]
    pub fn upcoming(&self, now: DateTime<Utc>) -> Vec<(BoundaryId, DateTime<Utc>)> {
        self.boundaries
            .iter()
            .map(|b| (b.id.clone(), b.rule.next_occurrence(now)))
            .collect()
    }
}
