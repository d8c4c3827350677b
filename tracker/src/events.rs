//! External session event feed.
//!
//! The host delivers lifecycle signals ([`SessionEvent`]) on the primary
//! execution context. Detectors subscribe to the [`EventKind`]s they need when
//! they initialize and unsubscribe when they are disposed. The feed keeps the
//! subscription handles per detector so cleanup is exact regardless of
//! registration order.
//!
//! The feed also owns the transition-safety flag: while it is raised,
//! externally-owned state must not be read.
//!
//! # Example
//!
//! ```
//! use dutyroll_tracker::events::{EventFeed, EventKind, TransitionGuard};
//!
//! let mut feed = EventFeed::new();
//! let handle = feed.subscribe("activity", EventKind::ActivityCompleted);
//!
//! assert_eq!(feed.subscribers(EventKind::ActivityCompleted), vec!["activity".to_string()]);
//! assert!(feed.unsubscribe(handle));
//! assert!(!feed.unsubscribe(handle));
//!
//! feed.transition_flag().set(true);
//! assert!(feed.transition_flag().is_transitioning());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

/// Lifecycle signals delivered by the host session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session began, optionally naming its owner identity.
    SessionStarted {
        #[serde(default)]
        owner: Option<String>,
    },
    SessionEnded,
    /// The session moved to another context (zone, map, scene).
    ContextChanged { context: u32 },
    /// An external activity finished.
    ActivityCompleted {
        /// External activity key, e.g. `mini_lottery_ticket`.
        activity: String,
        /// Stable identity of the real-world event, used for de-duplication.
        #[serde(rename = "eventId")]
        event_id: String,
        at: DateTime<Utc>,
    },
    /// Generic per-tick callback.
    Tick { now: DateTime<Utc> },
}

impl SessionEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionStarted { .. } => EventKind::SessionStarted,
            Self::SessionEnded => EventKind::SessionEnded,
            Self::ContextChanged { .. } => EventKind::ContextChanged,
            Self::ActivityCompleted { .. } => EventKind::ActivityCompleted,
            Self::Tick { .. } => EventKind::Tick,
        }
    }
}

/// Subscription key for [`SessionEvent`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStarted,
    SessionEnded,
    ContextChanged,
    ActivityCompleted,
    Tick,
}

/// Capability answering "is external state unsafe to read right now?".
pub trait TransitionGuard {
    fn is_transitioning(&self) -> bool;
}

/// Shared transition-safety flag.
///
/// Cloning yields another handle to the same flag, so the host can raise it
/// from wherever it learns about transitions.
#[derive(Debug, Clone, Default)]
pub struct TransitionFlag(Arc<AtomicBool>);

impl TransitionFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, transitioning: bool) {
        self.0.store(transitioning, Ordering::SeqCst);
    }
}

impl TransitionGuard for TransitionFlag {
    fn is_transitioning(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle returned by [`EventFeed::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

#[derive(Debug, Clone)]
struct Subscription {
    owner: String,
    kind: EventKind,
    /// Monotonic order, so delivery follows subscription order.
    seq: u64,
}

/// Subscription registry plus the transition flag.
#[derive(Debug, Default)]
pub struct EventFeed {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    by_owner: HashMap<String, Vec<SubscriptionId>>,
    next_seq: u64,
    transition: TransitionFlag,
}

impl EventFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a feed sharing an existing transition flag.
    #[must_use]
    pub fn with_transition_flag(transition: TransitionFlag) -> Self {
        Self {
            transition,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn transition_flag(&self) -> &TransitionFlag {
        &self.transition
    }

    /// Subscribes `owner` to one event kind.
    pub fn subscribe(&mut self, owner: &str, kind: EventKind) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.next_seq += 1;
        self.subscriptions.insert(
            id,
            Subscription {
                owner: owner.to_string(),
                kind,
                seq: self.next_seq,
            },
        );
        self.by_owner.entry(owner.to_string()).or_default().push(id);
        trace!(owner = %owner, kind = ?kind, "Subscribed");
        id
    }

    /// Removes one subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(sub) = self.subscriptions.remove(&id) else {
            return false;
        };
        if let Some(handles) = self.by_owner.get_mut(&sub.owner) {
            handles.retain(|h| *h != id);
            if handles.is_empty() {
                self.by_owner.remove(&sub.owner);
            }
        }
        trace!(owner = %sub.owner, kind = ?sub.kind, "Unsubscribed");
        true
    }

    /// Removes every subscription held by `owner`, returning how many there were.
    pub fn unsubscribe_owner(&mut self, owner: &str) -> usize {
        let handles = self.by_owner.remove(owner).unwrap_or_default();
        for id in &handles {
            self.subscriptions.remove(id);
        }
        if !handles.is_empty() {
            debug!(owner = %owner, count = handles.len(), "Dropped remaining subscriptions");
        }
        handles.len()
    }

    /// Owners subscribed to `kind`, in subscription order, without repeats.
    #[must_use]
    pub fn subscribers(&self, kind: EventKind) -> Vec<String> {
        let mut subs: Vec<&Subscription> = self
            .subscriptions
            .values()
            .filter(|s| s.kind == kind)
            .collect();
        subs.sort_by_key(|s| s.seq);

        let mut owners: Vec<String> = Vec::with_capacity(subs.len());
        for sub in subs {
            if !owners.contains(&sub.owner) {
                owners.push(sub.owner.clone());
            }
        }
        owners
    }

    #[must_use]
    pub fn subscription_count(&self, owner: &str) -> usize {
        self.by_owner.get(owner).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }
}
