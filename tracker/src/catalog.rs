//! Task catalog: the immutable definitions of every known activity.
//!
//! The catalog is the source of truth for task ids, categories, default
//! detection modes, and cadences. Checklist state is created from it on first
//! run and repaired against it on load.
//!
//! # Cadence
//!
//! Most tasks reset on their category's generic boundary. A task whose real
//! reset time diverges from that boundary (for example a weekly task that
//! resets on Saturday while the generic weekly reset is Tuesday) declares a
//! [`Cadence::Dedicated`] rule and gets its own last-reset timestamp.
//!
//! # Example
//!
//! ```
//! use dutyroll_tracker::catalog::{Cadence, Catalog};
//!
//! let catalog = Catalog::builtin();
//! let lottery = catalog.get("weekly-lottery").unwrap();
//! assert!(matches!(lottery.cadence, Cadence::Dedicated(_)));
//!
//! let state = catalog.default_state(None);
//! assert_eq!(state.tasks.len(), catalog.len());
//! ```

use std::collections::HashSet;

use chrono::Weekday;
use thiserror::Error;

use crate::scheduler::BoundaryRule;
use crate::types::{Category, ChecklistState, DetectionLimitation, DetectionMode, LimitationKind, Task};

/// Errors raised while building a catalog.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate task id in catalog: {0}")]
    DuplicateId(String),

    #[error("task id cannot be empty")]
    EmptyId,
}

/// Which boundary governs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// The category's generic boundary.
    Category,
    /// A rule of its own, tracked with a dedicated timestamp.
    Dedicated(BoundaryRule),
}

/// Immutable definition of one activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub default_mode: DetectionMode,
    pub cadence: Cadence,
    pub sort_order: i32,
    /// Known detection gap shown next to the task.
    pub limitation: Option<(LimitationKind, String)>,
}

impl TaskDefinition {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: Category,
        default_mode: DetectionMode,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            default_mode,
            cadence: Cadence::Category,
            sort_order: 0,
            limitation: None,
        }
    }

    #[must_use]
    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    #[must_use]
    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }

    #[must_use]
    pub fn with_limitation(mut self, kind: LimitationKind, description: impl Into<String>) -> Self {
        self.limitation = Some((kind, description.into()));
        self
    }

    /// The catalog-default task entry.
    #[must_use]
    pub fn to_task(&self) -> Task {
        Task::new(self.id.clone(), self.category, self.default_mode, self.sort_order)
    }
}

/// Validated collection of task definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    definitions: Vec<TaskDefinition>,
}

impl Catalog {
    /// Builds a catalog, rejecting empty or duplicate ids.
    pub fn new(definitions: Vec<TaskDefinition>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::with_capacity(definitions.len());
        for def in &definitions {
            if def.id.trim().is_empty() {
                return Err(CatalogError::EmptyId);
            }
            if !seen.insert(def.id.as_str()) {
                return Err(CatalogError::DuplicateId(def.id.clone()));
            }
        }
        Ok(Self { definitions })
    }

    /// The built-in activity catalog.
    #[must_use]
    pub fn builtin() -> Self {
        let saturday_noon = BoundaryRule::Weekly {
            weekday: Weekday::Sat,
            hour: 12,
            minute: 0,
        };

        let definitions = vec![
            TaskDefinition::new("daily-roulette", "Daily duty roulette", Category::Daily, DetectionMode::Auto)
                .with_sort_order(0),
            TaskDefinition::new("daily-mini-lottery", "Mini lottery tickets", Category::Daily, DetectionMode::Auto)
                .with_sort_order(1),
            TaskDefinition::new("daily-tribal-quests", "Tribal quest allowances", Category::Daily, DetectionMode::Hybrid)
                .with_sort_order(2)
                .with_limitation(
                    LimitationKind::PartialCoverage,
                    "Allowances spent before the tracker started are not counted",
                ),
            TaskDefinition::new("daily-hunt-bills", "Hunt bills", Category::Daily, DetectionMode::Manual)
                .with_sort_order(3)
                .with_limitation(
                    LimitationKind::NotDetectable,
                    "Hunt bill completion is not exposed by the session; mark it manually",
                ),
            TaskDefinition::new("weekly-challenge-log", "Challenge log", Category::Weekly, DetectionMode::Auto)
                .with_sort_order(10)
                .with_limitation(
                    LimitationKind::RequiresSession,
                    "Challenge log progress is only read while a session is active",
                ),
            TaskDefinition::new("weekly-custom-deliveries", "Custom deliveries", Category::Weekly, DetectionMode::Auto)
                .with_sort_order(11),
            TaskDefinition::new("weekly-raid-clear", "Weekly raid clear", Category::Weekly, DetectionMode::Hybrid)
                .with_sort_order(12),
            TaskDefinition::new("weekly-lottery", "Jumbo lottery", Category::Weekly, DetectionMode::Manual)
                .with_sort_order(13)
                .with_cadence(Cadence::Dedicated(saturday_noon)),
        ];

        Self { definitions }
    }

    #[must_use]
    pub fn definitions(&self) -> &[TaskDefinition] {
        &self.definitions
    }

    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.definitions.iter().find(|d| d.id == task_id)
    }

    #[must_use]
    pub fn contains(&self, task_id: &str) -> bool {
        self.get(task_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// First-run checklist built from catalog defaults.
    #[must_use]
    pub fn default_state(&self, owner: Option<String>) -> ChecklistState {
        ChecklistState {
            tasks: self.default_tasks(),
            owner,
            ..Default::default()
        }
    }

    /// Every task in its default (incomplete) form.
    #[must_use]
    pub fn default_tasks(&self) -> Vec<Task> {
        self.definitions.iter().map(TaskDefinition::to_task).collect()
    }

    /// Catalog-level detection limitations.
    #[must_use]
    pub fn limitations(&self) -> Vec<DetectionLimitation> {
        self.definitions
            .iter()
            .filter_map(|def| {
                def.limitation
                    .as_ref()
                    .map(|(kind, text)| DetectionLimitation::for_task(def.id.clone(), *kind, text.clone()))
            })
            .collect()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}
