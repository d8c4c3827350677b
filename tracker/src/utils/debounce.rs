//! Debounce utility for coalescing rapid requests.
//!
//! A request for a key is held until a configured duration has passed with
//! no newer request for the same key; then only the latest value is emitted.
//! Pending requests can be cancelled, which is how a shutdown makes sure no
//! delayed write lands after its own final write.
//!
//! # Architecture
//!
//! A background task owns the map of pending values, keyed by a
//! caller-defined key type. Commands arrive over a channel:
//!
//! 1. `Push` replaces any pending value for the key and resets its timer
//! 2. `Cancel` drops the pending value and acknowledges once it is gone
//! 3. When a timer expires the value is sent on the output channel
//!
//! Closing the input (dropping the [`Debouncer`]) flushes whatever is still
//! pending.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use dutyroll_tracker::utils::debounce::Debouncer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (output_tx, mut output_rx) = mpsc::channel(16);
//!     let debouncer = Debouncer::new(Duration::from_millis(100), output_tx);
//!
//!     debouncer.send("checklist", 1).await.unwrap();
//!     debouncer.send("checklist", 2).await.unwrap();
//!     debouncer.send("checklist", 3).await.unwrap();
//!
//!     // Only the last request survives.
//!     assert_eq!(output_rx.recv().await, Some(("checklist", 3)));
//! }
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default debounce interval in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 2000;

/// Capacity of the command channel.
const COMMAND_CAPACITY: usize = 1000;

/// Errors from debouncer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DebouncerError {
    /// The background task has stopped.
    #[error("debouncer channel closed")]
    ChannelClosed,

    /// The command channel is full.
    #[error("debouncer channel full")]
    ChannelFull,
}

enum Command<K, V> {
    Push(K, V),
    Cancel(K, oneshot::Sender<bool>),
}

#[derive(Debug)]
struct Pending<V> {
    value: V,
    deadline: Instant,
}

/// Coalesces rapid requests by key.
#[derive(Debug)]
pub struct Debouncer<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    input_tx: mpsc::Sender<Command<K, V>>,
    #[allow(dead_code)]
    task_handle: tokio::task::JoinHandle<()>,
}

impl<K, V> Debouncer<K, V>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
    V: Send + 'static,
{
    /// Creates a debouncer and spawns its background task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(interval: Duration, output_tx: mpsc::Sender<(K, V)>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(COMMAND_CAPACITY);

        let task_handle = tokio::spawn(async move {
            run_debounce_loop(interval, input_rx, output_tx).await;
        });

        Self { input_tx, task_handle }
    }

    /// Queues a value, replacing any pending value for `key` and restarting
    /// its timer.
    ///
    /// # Errors
    ///
    /// Returns [`DebouncerError::ChannelClosed`] if the background task has
    /// terminated.
    pub async fn send(&self, key: K, value: V) -> Result<(), DebouncerError> {
        self.input_tx
            .send(Command::Push(key, value))
            .await
            .map_err(|_| DebouncerError::ChannelClosed)
    }

    /// Queues a value without waiting, for use from synchronous code.
    ///
    /// # Errors
    ///
    /// Returns [`DebouncerError::ChannelFull`] or
    /// [`DebouncerError::ChannelClosed`].
    pub fn try_send(&self, key: K, value: V) -> Result<(), DebouncerError> {
        self.input_tx.try_send(Command::Push(key, value)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DebouncerError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => DebouncerError::ChannelClosed,
        })
    }

    /// Drops the pending value for `key`.
    ///
    /// Resolves once the background task has processed every command sent
    /// before it, so nothing queued earlier can still be emitted afterwards.
    /// Returns whether a value was pending.
    ///
    /// # Errors
    ///
    /// Returns [`DebouncerError::ChannelClosed`] if the background task has
    /// terminated.
    pub async fn cancel(&self, key: K) -> Result<bool, DebouncerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.input_tx
            .send(Command::Cancel(key, ack_tx))
            .await
            .map_err(|_| DebouncerError::ChannelClosed)?;
        ack_rx.await.map_err(|_| DebouncerError::ChannelClosed)
    }
}

async fn run_debounce_loop<K, V>(
    interval: Duration,
    mut input_rx: mpsc::Receiver<Command<K, V>>,
    output_tx: mpsc::Sender<(K, V)>,
) where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    let mut pending: HashMap<K, Pending<V>> = HashMap::new();

    // Idle wake-up when nothing is pending.
    let tick_interval = std::cmp::max(interval, Duration::from_millis(25));

    debug!(interval_ms = interval.as_millis(), "Starting debounce loop");

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();

        tokio::select! {
            command = input_rx.recv() => {
                match command {
                    Some(Command::Push(key, value)) => {
                        trace!(key = ?key, "Request received, timer reset");
                        let deadline = Instant::now() + interval;
                        pending.insert(key, Pending { value, deadline });
                    }
                    Some(Command::Cancel(key, ack)) => {
                        let removed = pending.remove(&key).is_some();
                        debug!(key = ?key, removed, "Pending request cancelled");
                        // The caller may have stopped waiting.
                        let _ = ack.send(removed);
                    }
                    None => {
                        debug!("Input channel closed, flushing remaining requests");
                        flush_all_pending(&mut pending, &output_tx).await;
                        break;
                    }
                }
            }

            _ = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => tokio::time::sleep(tick_interval).await,
                }
            } => {
                emit_expired(&mut pending, &output_tx).await;
            }
        }
    }

    debug!("Debounce loop terminated");
}

async fn emit_expired<K, V>(pending: &mut HashMap<K, Pending<V>>, output_tx: &mpsc::Sender<(K, V)>)
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    let now = Instant::now();
    let expired: Vec<K> = pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(key, _)| key.clone())
        .collect();

    for key in expired {
        if let Some(p) = pending.remove(&key) {
            trace!(key = ?key, "Emitting debounced request");
            if output_tx.send((key.clone(), p.value)).await.is_err() {
                warn!(key = ?key, "Output channel closed, debounced request dropped");
            }
        }
    }
}

async fn flush_all_pending<K, V>(pending: &mut HashMap<K, Pending<V>>, output_tx: &mpsc::Sender<(K, V)>)
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    for (key, p) in pending.drain() {
        trace!(key = ?key, "Flushing pending request");
        if output_tx.send((key.clone(), p.value)).await.is_err() {
            warn!(key = ?key, "Output channel closed, pending request dropped");
        }
    }
}
