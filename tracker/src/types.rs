//! Checklist data model for DutyRoll.
//!
//! This module defines the task and checklist types shared by the detectors,
//! the reset scheduler, and the persistence layer. All persisted types
//! serialize to camelCase JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which generic reset boundary a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Daily,
    Weekly,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
        }
    }
}

/// How a task's completion is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Only direct user action completes the task.
    Manual,
    /// The owning detector is authoritative; a manual override still wins.
    Auto,
    /// The detector may mark the task complete but never clears it.
    Hybrid,
}

/// Tri-state answer from a detector query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Complete,
    Incomplete,
    /// The detector cannot answer right now (disabled, mid-transition, no data).
    Unknown,
}

impl TaskState {
    /// Maps a known boolean completion into a `TaskState`.
    #[must_use]
    pub fn from_completed(completed: bool) -> Self {
        if completed {
            Self::Complete
        } else {
            Self::Incomplete
        }
    }

    /// Returns `true` only for [`TaskState::Complete`].
    #[must_use]
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Identity of a reset boundary.
///
/// Dedicated boundaries are keyed by the task id whose cadence diverges from
/// its category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BoundaryId {
    Daily,
    Weekly,
    Dedicated(String),
}

impl BoundaryId {
    /// The generic boundary governing a category.
    #[must_use]
    pub fn for_category(category: Category) -> Self {
        match category {
            Category::Daily => Self::Daily,
            Category::Weekly => Self::Weekly,
        }
    }
}

impl fmt::Display for BoundaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Dedicated(task_id) => write!(f, "dedicated:{task_id}"),
        }
    }
}

/// A trackable recurring activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable identifier, unique across the catalog.
    pub id: String,

    pub category: Category,

    pub detection_mode: DetectionMode,

    pub completed: bool,

    /// Set by direct user action, independent of auto-detection.
    #[serde(default)]
    pub manual_override: bool,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub sort_order: i32,
}

impl Task {
    /// Creates an incomplete task.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        category: Category,
        detection_mode: DetectionMode,
        sort_order: i32,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            detection_mode,
            completed: false,
            manual_override: false,
            completed_at: None,
            sort_order,
        }
    }

    /// Clears completion and the manual override.
    pub fn clear(&mut self) {
        self.completed = false;
        self.manual_override = false;
        self.completed_at = None;
    }

    /// Sets `completed`, stamping `completed_at` on the false → true edge.
    ///
    /// Returns `true` if the value changed.
    pub fn set_completed(&mut self, completed: bool, now: DateTime<Utc>) -> bool {
        if self.completed == completed {
            return false;
        }
        self.completed = completed;
        self.completed_at = completed.then_some(now);
        true
    }
}

/// The live checklist: every task plus the reset bookkeeping.
///
/// Cloning produces a deep, independent snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChecklistState {
    /// Tasks in display order.
    pub tasks: Vec<Task>,

    /// When the generic daily boundary was last applied.
    pub last_daily_reset: Option<DateTime<Utc>>,

    /// When the generic weekly boundary was last applied.
    pub last_weekly_reset: Option<DateTime<Utc>>,

    /// Last-applied timestamps for tasks with a dedicated cadence, keyed by task id.
    pub dedicated_resets: BTreeMap<String, DateTime<Utc>>,

    pub last_save_time: Option<DateTime<Utc>>,

    /// Session-scoped owner identity, if known.
    pub owner: Option<String>,
}

impl ChecklistState {
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Returns the last-applied timestamp for a boundary.
    #[must_use]
    pub fn last_reset(&self, boundary: &BoundaryId) -> Option<DateTime<Utc>> {
        match boundary {
            BoundaryId::Daily => self.last_daily_reset,
            BoundaryId::Weekly => self.last_weekly_reset,
            BoundaryId::Dedicated(task_id) => self.dedicated_resets.get(task_id).copied(),
        }
    }

    /// Records that a boundary was applied at `at`.
    pub fn set_last_reset(&mut self, boundary: &BoundaryId, at: DateTime<Utc>) {
        match boundary {
            BoundaryId::Daily => self.last_daily_reset = Some(at),
            BoundaryId::Weekly => self.last_weekly_reset = Some(at),
            BoundaryId::Dedicated(task_id) => {
                self.dedicated_resets.insert(task_id.clone(), at);
            }
        }
    }

    /// Number of completed tasks in a category.
    #[must_use]
    pub fn completed_count(&self, category: Category) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.category == category && t.completed)
            .count()
    }
}

/// Kind of known detection gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitationKind {
    /// The activity cannot be observed at all; manual tracking only.
    NotDetectable,
    /// Only part of the activity is observed (e.g. counts reset on restart).
    PartialCoverage,
    /// Detection needs an active session to be running.
    RequiresSession,
}

/// Read-only metadata explaining a detection gap to the user.
///
/// A `task_id` of `None` means the limitation applies globally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionLimitation {
    pub task_id: Option<String>,
    pub kind: LimitationKind,
    pub description: String,
}

impl DetectionLimitation {
    #[must_use]
    pub fn for_task(task_id: impl Into<String>, kind: LimitationKind, description: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            kind,
            description: description.into(),
        }
    }

    #[must_use]
    pub fn global(kind: LimitationKind, description: impl Into<String>) -> Self {
        Self {
            task_id: None,
            kind,
            description: description.into(),
        }
    }
}
