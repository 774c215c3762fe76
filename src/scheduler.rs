//! Delayed-job plumbing for reservation auto-completion.
//!
//! [`JobQueue`] is the generic "run this named action with this payload at
//! this time, addressable by a stable key" seam. [`TimerQueue`] is the
//! in-process implementation: one tokio timer per key, delivered on an mpsc
//! channel. [`CompletionScheduler`] is the reservation-shaped wrapper the
//! engine talks to.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::clock::Clock;

pub const COMPLETE_RESERVATION: &str = "complete_reservation";

const FIRED_CHANNEL_CAPACITY: usize = 1024;

/// Longest single tokio sleep. The timer wheel tops out near 2.2 years, so
/// longer delays are slept in steps.
const MAX_TIMER_STEP: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub key: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub fires_at: DateTime<Utc>,
}

/// A job whose deadline passed, handed to whoever drains the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredJob {
    pub key: String,
    pub action: String,
    pub payload: serde_json::Value,
}

impl FiredJob {
    /// The reservation a completion job targets, if this is one.
    pub fn reservation_id(&self) -> Option<Ulid> {
        if self.action != COMPLETE_RESERVATION {
            return None;
        }
        self.payload.get("reservation_id")?.as_str()?.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The queue cannot accept work right now.
    Unavailable(String),
    /// The queue refused this particular job.
    Rejected(String),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Unavailable(msg) => write!(f, "job queue unavailable: {msg}"),
            SchedulerError::Rejected(msg) => write!(f, "job rejected: {msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Arm `job`. An existing job under the same key is replaced.
    async fn enqueue(&self, job: Job) -> Result<(), SchedulerError>;

    /// Disarm the job under `key`. `Ok(false)` if nothing was armed.
    async fn remove(&self, key: &str) -> Result<bool, SchedulerError>;
}

struct ArmedJob {
    generation: u64,
    token: CancellationToken,
    fires_at: DateTime<Utc>,
}

/// In-process job queue backed by tokio timers.
///
/// Each armed key owns a timer task. Removing or replacing the key cancels
/// that task. A timer that wins the race claims its slot by generation before
/// delivering, so a superseded timer never fires. `slots` counts armed keys
/// and is only grown through a bounded compare-and-swap.
pub struct TimerQueue {
    clock: Arc<dyn Clock>,
    armed: Arc<DashMap<String, ArmedJob>>,
    slots: Arc<AtomicUsize>,
    next_generation: AtomicU64,
    capacity: usize,
    fired: mpsc::Sender<FiredJob>,
}

impl TimerQueue {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> (Self, mpsc::Receiver<FiredJob>) {
        let (fired, rx) = mpsc::channel(FIRED_CHANNEL_CAPACITY);
        let queue = Self {
            clock,
            armed: Arc::new(DashMap::new()),
            slots: Arc::new(AtomicUsize::new(0)),
            next_generation: AtomicU64::new(0),
            capacity,
            fired,
        };
        (queue, rx)
    }

    pub fn armed(&self) -> usize {
        self.armed.len()
    }

    pub fn fires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.armed.get(key).map(|a| a.fires_at)
    }

    /// Reserve room for one new key, or `false` if the queue is full.
    fn claim_slot(&self) -> bool {
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }
}

#[async_trait]
impl JobQueue for TimerQueue {
    async fn enqueue(&self, job: Job) -> Result<(), SchedulerError> {
        if self.fired.is_closed() {
            return Err(SchedulerError::Unavailable("job runner stopped".into()));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let armed_job = ArmedJob {
            generation,
            token: token.clone(),
            fires_at: job.fires_at,
        };
        // The entry guard holds the shard, so check and insert are one step per key.
        match self.armed.entry(job.key.clone()) {
            Entry::Occupied(mut slot) => {
                let previous = slot.insert(armed_job);
                previous.token.cancel();
            }
            Entry::Vacant(slot) => {
                if !self.claim_slot() {
                    return Err(SchedulerError::Rejected(format!(
                        "{} jobs already armed",
                        self.capacity
                    )));
                }
                slot.insert(armed_job);
            }
        }

        let delay = (job.fires_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let armed = self.armed.clone();
        let slots = self.slots.clone();
        let fired = self.fired.clone();
        let Job { key, action, payload, .. } = job;

        tokio::spawn(async move {
            let mut remaining = delay;
            loop {
                let step = remaining.min(MAX_TIMER_STEP);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(step) => {}
                }
                remaining -= step;
                if remaining.is_zero() {
                    break;
                }
            }
            if armed.remove_if(&key, |_, a| a.generation == generation).is_none() {
                return;
            }
            slots.fetch_sub(1, Ordering::AcqRel);
            if fired.send(FiredJob { key, action, payload }).await.is_err() {
                tracing::warn!("job fired after the runner stopped");
            }
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, SchedulerError> {
        match self.armed.remove(key) {
            Some((_, job)) => {
                job.token.cancel();
                self.slots.fetch_sub(1, Ordering::AcqRel);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub fn completion_key(reservation_id: Ulid) -> String {
    format!("reservation:{reservation_id}:complete")
}

/// One completion job per reservation, keyed by its id.
#[derive(Clone)]
pub struct CompletionScheduler {
    queue: Arc<dyn JobQueue>,
}

impl CompletionScheduler {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    pub async fn schedule(
        &self,
        reservation_id: Ulid,
        fires_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.queue
            .enqueue(Job {
                key: completion_key(reservation_id),
                action: COMPLETE_RESERVATION.to_string(),
                payload: json!({ "reservation_id": reservation_id.to_string() }),
                fires_at,
            })
            .await
    }

    /// Remove-if-exists then add.
    pub async fn reschedule(
        &self,
        reservation_id: Ulid,
        fires_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.queue.remove(&completion_key(reservation_id)).await?;
        self.schedule(reservation_id, fires_at).await
    }

    pub async fn cancel(&self, reservation_id: Ulid) -> Result<bool, SchedulerError> {
        self.queue.remove(&completion_key(reservation_id)).await
    }
}
